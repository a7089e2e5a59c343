//! [`Interlock`] – command safety rules.
//!
//! Before a [`RobotCommand`] is queued for the link, it is checked against
//! every registered [`Rule`] in order; the first violation returns
//! [`RexError::Interlock`] and the command is not sent. `Stop` passes every
//! built-in rule.
//!
//! Built-in rules:
//! - [`EmergencyLatchRule`] – nothing but `Stop` while the emergency latch is set.
//! - [`LinkHealthRule`] – nothing but `Stop` while the link is Lost.
//! - [`VelocityCapRule`] – rejects walk speeds and turn rates above caps.

use rex_types::{LinkStatus, RexError, RobotCommand, RobotLinkState};
use serde::{Deserialize, Serialize};

/// State a rule may consult besides the command itself.
#[derive(Debug, Clone, Copy)]
pub struct InterlockContext<'a> {
    pub link: &'a RobotLinkState,
    pub emergency_latched: bool,
}

/// A single invariant a command must satisfy.
pub trait Rule: Send + Sync {
    /// Human-readable name used in fault messages.
    fn name(&self) -> &str;

    fn check(&self, command: &RobotCommand, ctx: &InterlockContext<'_>) -> Result<(), RexError>;
}

/// Motion caps, in the same units as [`RobotCommand::Walk`] speed and
/// [`RobotCommand::Turn`] rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionLimits {
    pub max_speed: f32,
    pub max_turn_rate: f32,
}

impl Default for MotionLimits {
    fn default() -> Self {
        Self {
            max_speed: 0.5,
            max_turn_rate: 0.8,
        }
    }
}

#[derive(Default)]
pub struct Interlock {
    rules: Vec<Box<dyn Rule>>,
}

impl Interlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// The latch, link and velocity rules, in that order.
    pub fn standard(limits: &MotionLimits) -> Self {
        let mut interlock = Self::new();
        interlock.add_rule(Box::new(EmergencyLatchRule));
        interlock.add_rule(Box::new(LinkHealthRule));
        interlock.add_rule(Box::new(VelocityCapRule {
            max_speed: limits.max_speed,
            max_turn_rate: limits.max_turn_rate,
        }));
        interlock
    }

    /// Rules are evaluated in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn Rule>) {
        self.rules.push(rule);
    }

    pub fn verify(&self, command: &RobotCommand, ctx: &InterlockContext<'_>) -> Result<(), RexError> {
        for rule in &self.rules {
            rule.check(command, ctx)?;
        }
        Ok(())
    }
}

fn violation(rule: &dyn Rule, details: String) -> RexError {
    RexError::Interlock {
        rule: rule.name().to_string(),
        details,
    }
}

pub struct EmergencyLatchRule;

impl Rule for EmergencyLatchRule {
    fn name(&self) -> &str {
        "emergency_latch"
    }

    fn check(&self, command: &RobotCommand, ctx: &InterlockContext<'_>) -> Result<(), RexError> {
        if ctx.emergency_latched && !command.is_stop() {
            return Err(violation(
                self,
                format!("{} refused while emergency stopped", command.name()),
            ));
        }
        Ok(())
    }
}

pub struct LinkHealthRule;

impl Rule for LinkHealthRule {
    fn name(&self) -> &str {
        "link_health"
    }

    fn check(&self, command: &RobotCommand, ctx: &InterlockContext<'_>) -> Result<(), RexError> {
        if ctx.link.status == LinkStatus::Lost && !command.is_stop() {
            return Err(violation(
                self,
                format!("{} refused while link is lost", command.name()),
            ));
        }
        Ok(())
    }
}

pub struct VelocityCapRule {
    pub max_speed: f32,
    pub max_turn_rate: f32,
}

impl Rule for VelocityCapRule {
    fn name(&self) -> &str {
        "velocity_cap"
    }

    fn check(&self, command: &RobotCommand, _ctx: &InterlockContext<'_>) -> Result<(), RexError> {
        match command {
            RobotCommand::Walk { speed, .. } if speed.abs() > self.max_speed => Err(violation(
                self,
                format!("walk speed {speed} exceeds cap {}", self.max_speed),
            )),
            RobotCommand::Turn { rate, .. } if rate.abs() > self.max_turn_rate => Err(violation(
                self,
                format!("turn rate {rate} exceeds cap {}", self.max_turn_rate),
            )),
            _ => Ok(()),
        }
    }
}
