//! `rex-cli` – Rex command line interface.
//!
//! This binary is the ignition switch for the agent. It:
//!
//! 1. Loads `~/.rex/config.toml`, writing a default file when absent, and
//!    refuses to start on an invalid configuration.
//! 2. Opens the memory database and connects the robot link (or a simulated
//!    robot when `simulate = true`).
//! 3. Spawns the agent with a console voice and, optionally, the status
//!    WebSocket feed.
//! 4. Reads stdin as a development stand-in for the microphone; see
//!    [`shell`] for the slash-commands.
//! 5. Intercepts **Ctrl-C** to emergency-stop the robot and exit safely.

mod config;
mod shell;

use colored::Colorize;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, warn};

use rex_link::{EventBus, RobotLink, SimLink, StatusServer, WsRobotLink};
use rex_memory::MemoryStore;
use rex_runtime::{Agent, Collaborators, ConsoleVoice, LlmCognition, init_tracing};
use rex_types::RexError;

fn main() -> ExitCode {
    // Before the runtime starts: the OTLP exporter is a simple exporter.
    let _tracing = init_tracing("rex");

    print_banner();

    let cfg = match load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            println!("{}: {}", "Config error".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start the async runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cfg)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            println!("{}: {}", "Error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn load_config() -> Result<config::RexConfig, RexError> {
    let cfg = match config::load()? {
        Some(cfg) => {
            println!("  Config loaded from {}", config::config_path().display().to_string().bold());
            cfg
        }
        None => {
            let mut cfg = config::RexConfig::default();
            config::apply_env_overrides(&mut cfg);
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => warn!(error = %e, "could not write default config"),
            }
            cfg
        }
    };
    cfg.validate()?;
    Ok(cfg)
}

async fn run(cfg: config::RexConfig) -> Result<(), RexError> {
    let memory = match &cfg.memory.path {
        Some(path) => MemoryStore::open(path)?,
        None => MemoryStore::open_in_memory()?,
    };

    let link: Arc<dyn RobotLink> = if cfg.simulate {
        println!("  Robot link: {}", "simulated".yellow());
        Arc::new(SimLink::new())
    } else {
        let link = WsRobotLink::new(&cfg.link_address);
        println!("  Robot link: {}", link.url().bold());
        Arc::new(link)
    };

    let cognition = LlmCognition::new(cfg.cognition.clone(), &cfg.robot_name, &cfg.masters)?;
    println!(
        "  Cognition:  {} at {}",
        cfg.cognition.model.bold(),
        cfg.cognition.base_url.dimmed()
    );

    let bus = EventBus::new(256);
    tokio::spawn(shell::render(bus.subscribe()));

    if let Some(addr) = &cfg.status_addr {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| RexError::Config(format!("status_addr {addr:?}: {e}")))?;
        let server = StatusServer::new(bus.clone());
        tokio::spawn(async move {
            if let Err(e) = server.run(addr).await {
                error!(error = %e, "status server stopped");
            }
        });
        println!("  Status feed: {}", format!("ws://{addr}").bold());
    }

    let agent = Agent::spawn(
        cfg.agent_config(),
        Collaborators {
            link,
            cognition: Arc::new(cognition),
            voice: Arc::new(ConsoleVoice::default()),
            memory: Arc::new(memory),
            bus,
        },
    );

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    // Stop first, from the signal thread, then let the shell wind down.
    let interrupted = Arc::new(Notify::new());
    let stopper = agent.stopper();
    let notify = interrupted.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – emergency stop, shutting down …".yellow().bold());
        stopper.stop();
        notify.notify_one();
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; Ctrl-C will not stop the robot");
    }

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());
    shell::run(&agent, interrupted).await;

    agent.shutdown().await;
    println!("{}", "  ✓ Robot stopped. Goodbye.".green());
    Ok(())
}

fn print_banner() {
    println!();
    println!("{}", r#"   ___  ___ __ __"#.bold().cyan());
    println!("{}", r#"  / _ \/ -_)\ \ /"#.bold().cyan());
    println!("{}", r#" /_/ \_\__//_\_\ "#.bold().cyan());
    println!();
    println!("  {} {}", "Rex".bold(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Voice-driven robot dog agent");
    println!();
}
