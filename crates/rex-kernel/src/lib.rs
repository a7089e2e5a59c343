//! `rex-kernel` – Safety & arbitration
//!
//! The brainstem of Rex. It does not think; it decides who may move the
//! robot, refuses unsafe commands and watches the link.
//!
//! # Modules
//!
//! - [`safety`] – [`SafetyMonitor`][safety::SafetyMonitor]: heartbeat and
//!   battery state machine, sole owner of the link state.
//! - [`arbiter`] – [`ActionArbiter`][arbiter::ActionArbiter]: the
//!   single-holder action channel, arbitrated by priority.
//! - [`interlock`] – [`Interlock`][interlock::Interlock]: ordered command
//!   safety rules.
//! - [`gate`] – [`ActionGate`][gate::ActionGate]: ownership plus interlock in
//!   one call.

pub mod arbiter;
pub mod gate;
pub mod interlock;
pub mod safety;

pub use arbiter::{ActionArbiter, ChannelOwner, Grant};
pub use gate::ActionGate;
pub use interlock::{
    EmergencyLatchRule, Interlock, InterlockContext, LinkHealthRule, MotionLimits, Rule,
    VelocityCapRule,
};
pub use safety::{HeartbeatOutcome, SafetyAction, SafetyConfig, SafetyMonitor};
