//! `rex-link` – The robot link and status plumbing
//!
//! Carries commands from the brain to the robot and status from the brain to
//! whatever shell is rendering it. Nothing here decides *what* to send.
//!
//! # Modules
//!
//! - [`link`] – the [`RobotLink`] trait and the JSON [`LinkFrame`] protocol.
//! - [`ws_link`] – [`WsRobotLink`], a persistent WebSocket connection with
//!   per-sequence acknowledgement routing.
//! - [`sim`] – [`SimLink`], an in-process robot for tests and `--simulate`.
//! - [`bus`] – topic-based broadcast [`EventBus`] for status events.
//! - [`status_server`] – serves the bus to UI clients as JSON over WebSocket.

pub mod bus;
pub mod link;
pub mod sim;
pub mod status_server;
pub mod ws_link;

pub use bus::{EventBus, Topic, TopicReceiver};
pub use link::{LinkFrame, RobotLink};
pub use sim::SimLink;
pub use status_server::StatusServer;
pub use ws_link::WsRobotLink;
