//! Configuration vault – reads/writes `~/.rex/config.toml`.
//!
//! Every section is optional in the file; missing keys take the component
//! defaults.

use rex_kernel::{MotionLimits, SafetyConfig};
use rex_memory::MemoryConfig;
use rex_perception::{VisionConfig, WakeConfig};
use rex_runtime::{AgentConfig, BehaviorConfig, CognitionConfig, ConversationConfig, DispatcherConfig};
use rex_types::RexError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroize;

/// Persisted configuration stored in `~/.rex/config.toml`.
// Per-field defaults rather than container `#[serde(default)]`: the latter
// moves fields out of `RexConfig::default()`, which the `Drop` impl forbids.
#[derive(Clone, Serialize, Deserialize)]
pub struct RexConfig {
    /// Name the robot answers to. Also used as the wake phrase.
    #[serde(default = "default_robot_name")]
    pub robot_name: String,
    /// People whose instructions the robot treats as its owners'.
    #[serde(default)]
    pub masters: Vec<String>,
    /// `host:port` (or `ws://` URL) of the robot's motion link.
    #[serde(default = "default_link_address")]
    pub link_address: String,
    /// Drive an in-process simulated robot instead of the real link.
    #[serde(default)]
    pub simulate: bool,
    /// Address for the status WebSocket feed, e.g. `127.0.0.1:9090`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_addr: Option<String>,

    #[serde(default)]
    pub wake: WakeConfig,
    #[serde(default)]
    pub vision: VisionConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub behavior: BehaviorConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub cognition: CognitionConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub limits: MotionLimits,
}

fn default_robot_name() -> String {
    RexConfig::default().robot_name.clone()
}

fn default_link_address() -> String {
    RexConfig::default().link_address.clone()
}

impl Default for RexConfig {
    fn default() -> Self {
        Self {
            robot_name: "Rex".to_string(),
            masters: Vec::new(),
            link_address: "192.168.12.1:8080".to_string(),
            simulate: false,
            status_addr: None,
            wake: WakeConfig::default(),
            vision: VisionConfig::default(),
            conversation: ConversationConfig::default(),
            behavior: BehaviorConfig::default(),
            safety: SafetyConfig::default(),
            dispatcher: DispatcherConfig::default(),
            cognition: CognitionConfig::default(),
            memory: MemoryConfig::default(),
            limits: MotionLimits::default(),
        }
    }
}

impl std::fmt::Debug for RexConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // CognitionConfig's own Debug redacts the API key.
        f.debug_struct("RexConfig")
            .field("robot_name", &self.robot_name)
            .field("masters", &self.masters)
            .field("link_address", &self.link_address)
            .field("simulate", &self.simulate)
            .field("status_addr", &self.status_addr)
            .field("cognition", &self.cognition)
            .field("memory", &self.memory)
            .finish_non_exhaustive()
    }
}

impl Drop for RexConfig {
    fn drop(&mut self) {
        self.cognition.api_key.zeroize();
    }
}

impl RexConfig {
    /// Reject configurations the agent cannot safely start with.
    pub fn validate(&self) -> Result<(), RexError> {
        if self.robot_name.trim().is_empty() {
            return Err(RexError::Config("robot_name must not be empty".into()));
        }
        if !self.simulate && self.link_address.trim().is_empty() {
            return Err(RexError::Config(
                "link_address is required unless simulate = true".into(),
            ));
        }
        if let Some(addr) = &self.status_addr
            && addr.parse::<std::net::SocketAddr>().is_err()
        {
            return Err(RexError::Config(format!("status_addr {addr:?} is not a socket address")));
        }
        let url = self.cognition.base_url.trim();
        if url.is_empty() {
            return Err(RexError::Config("cognition.base_url must not be empty".into()));
        }
        if self.cognition.api_key.is_empty() && !is_loopback_url(url) {
            return Err(RexError::Config(format!(
                "cognition.api_key (or REX_COGNITION_API_KEY) is required for remote server {url}"
            )));
        }
        Ok(())
    }

    /// Component configuration for the agent, with the robot identity
    /// pushed into every section that needs it.
    pub fn agent_config(&self) -> AgentConfig {
        let mut wake = self.wake.clone();
        wake.robot_name = self.robot_name.clone();
        let mut conversation = self.conversation.clone();
        conversation.robot_name = self.robot_name.clone();
        conversation.masters = self.masters.clone();

        AgentConfig {
            wake,
            vision: self.vision.clone(),
            conversation,
            behavior: self.behavior.clone(),
            safety: self.safety.clone(),
            dispatcher: self.dispatcher.clone(),
            memory: self.memory.clone(),
            limits: self.limits.clone(),
            ..AgentConfig::default()
        }
    }
}

fn is_loopback_url(url: &str) -> bool {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split('/').next().unwrap_or_default();
    let host = match authority.strip_prefix('[') {
        Some(v6) => v6.split(']').next().unwrap_or_default(),
        None => authority.split(':').next().unwrap_or_default(),
    };
    host.eq_ignore_ascii_case("localhost") || host == "::1" || host.starts_with("127.")
}

/// Return the path to `~/.rex/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".rex").join("config.toml")
}

/// Load the config from disk. Returns `None` if the file does not exist.
pub fn load() -> Result<Option<RexConfig>, RexError> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<RexConfig>, RexError> {
    if !path.exists() {
        return Ok(None);
    }
    let mut raw = fs::read_to_string(path)
        .map_err(|e| RexError::Config(format!("failed to read {}: {e}", path.display())))?;
    let parsed = toml::from_str::<RexConfig>(&raw);
    raw.zeroize();
    let mut cfg = parsed.map_err(|e| RexError::Config(format!("failed to parse {}: {e}", path.display())))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `REX_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `REX_ROBOT_NAME` | `robot_name` |
/// | `REX_LINK_ADDRESS` | `link_address` |
/// | `REX_COGNITION_URL` | `cognition.base_url` |
/// | `REX_COGNITION_MODEL` | `cognition.model` |
/// | `REX_COGNITION_API_KEY` | `cognition.api_key` |
/// | `REX_MEMORY_PATH` | `memory.path` |
pub fn apply_env_overrides(cfg: &mut RexConfig) {
    if let Ok(v) = std::env::var("REX_ROBOT_NAME")
        && !v.trim().is_empty()
    {
        cfg.robot_name = v;
    }
    if let Ok(v) = std::env::var("REX_LINK_ADDRESS") {
        cfg.link_address = v;
    }
    if let Ok(v) = std::env::var("REX_COGNITION_URL") {
        cfg.cognition.base_url = v;
    }
    if let Ok(v) = std::env::var("REX_COGNITION_MODEL") {
        cfg.cognition.model = v;
    }
    if let Ok(v) = std::env::var("REX_COGNITION_API_KEY") {
        cfg.cognition.api_key.zeroize();
        cfg.cognition.api_key = v;
    }
    if let Ok(v) = std::env::var("REX_MEMORY_PATH") {
        cfg.memory.path = Some(v);
    }
}

/// Save the config to disk, creating `~/.rex/` if necessary.
pub fn save(cfg: &RexConfig) -> Result<(), RexError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &RexConfig, path: &Path) -> Result<(), RexError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| RexError::Config(format!("failed to create config directory: {e}")))?;
        // Owner only (rwx------).
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| RexError::Config(format!("failed to set config directory permissions: {e}")))?;
        }
    }
    let mut raw = toml::to_string_pretty(cfg)
        .map_err(|e| RexError::Config(format!("failed to serialize config: {e}")))?;
    // Owner read/write only (rw-------).
    #[cfg(unix)]
    let written = {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
    };
    #[cfg(not(unix))]
    let written = fs::write(path, &raw);
    raw.zeroize();
    written.map_err(|e| RexError::Config(format!("failed to write {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_api_key() {
        let mut cfg = RexConfig::default();
        cfg.cognition.api_key = "sk-super-secret".to_string();
        let debug_str = format!("{:?}", cfg);
        assert!(!debug_str.contains("sk-super-secret"), "api key must not appear in debug output");
        assert!(debug_str.contains("<redacted>"));
    }

    #[test]
    fn debug_shows_not_set_for_empty_key() {
        let debug_str = format!("{:?}", RexConfig::default());
        assert!(debug_str.contains("<not set>"));
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&RexConfig::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap()).expect("dir metadata").permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let mut cfg = RexConfig::default();
        cfg.simulate = true;
        cfg.safety.loss_threshold = 5;
        cfg.behavior.idle_walk_enabled = false;
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert!(loaded.simulate);
        assert_eq!(loaded.safety.loss_threshold, 5);
        assert!(!loaded.behavior.idle_walk_enabled);
        assert_eq!(loaded.dispatcher.ack_timeout_ms, 1500);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "simulate = true\n\n[safety]\nlow_battery_percent = 30\n").unwrap();

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert!(loaded.simulate);
        assert_eq!(loaded.safety.low_battery_percent, 30);
        assert_eq!(loaded.safety.recovery_threshold, 2);
        assert_eq!(loaded.vision.sample_interval_ms, 2500);
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "simulate = \"maybe\"").unwrap();
        assert!(matches!(load_from(&path), Err(RexError::Config(_))));
    }

    #[test]
    fn config_path_points_to_rex_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".rex"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn apply_env_overrides_changes_link_address() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("REX_LINK_ADDRESS", "10.0.0.7:9000") };
        let mut cfg = RexConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.link_address, "10.0.0.7:9000");
        unsafe { std::env::remove_var("REX_LINK_ADDRESS") };
    }

    #[test]
    fn apply_env_overrides_changes_memory_path() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("REX_MEMORY_PATH", "/tmp/rex-memory.db") };
        let mut cfg = RexConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.memory.path.as_deref(), Some("/tmp/rex-memory.db"));
        unsafe { std::env::remove_var("REX_MEMORY_PATH") };
    }

    #[test]
    fn apply_env_overrides_changes_cognition_model() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("REX_COGNITION_MODEL", "mistral") };
        let mut cfg = RexConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.cognition.model, "mistral");
        unsafe { std::env::remove_var("REX_COGNITION_MODEL") };
    }

    #[test]
    fn default_config_is_valid() {
        assert!(RexConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_requires_link_address_unless_simulating() {
        let mut cfg = RexConfig::default();
        cfg.link_address = String::new();
        assert!(matches!(cfg.validate(), Err(RexError::Config(_))));
        cfg.simulate = true;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_requires_cognition_url() {
        let mut cfg = RexConfig::default();
        cfg.cognition.base_url = "  ".to_string();
        assert!(matches!(cfg.validate(), Err(RexError::Config(_))));
    }

    #[test]
    fn validate_requires_key_for_remote_cognition() {
        let mut cfg = RexConfig::default();
        cfg.cognition.base_url = "https://api.example.com".to_string();
        assert!(matches!(cfg.validate(), Err(RexError::Config(_))));
        cfg.cognition.api_key = "sk-test".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn loopback_detection() {
        assert!(is_loopback_url("http://localhost:11434"));
        assert!(is_loopback_url("http://127.0.0.1:8000/v1"));
        assert!(is_loopback_url("http://[::1]:11434"));
        assert!(!is_loopback_url("http://192.168.1.20:11434"));
        assert!(!is_loopback_url("https://localhost.example.com"));
    }

    #[test]
    fn agent_config_carries_robot_identity() {
        let mut cfg = RexConfig::default();
        cfg.robot_name = "Bolt".to_string();
        cfg.masters = vec!["Ana".to_string()];
        let agent = cfg.agent_config();
        assert_eq!(agent.wake.robot_name, "Bolt");
        assert_eq!(agent.conversation.robot_name, "Bolt");
        assert_eq!(agent.conversation.masters, vec!["Ana".to_string()]);
    }
}
