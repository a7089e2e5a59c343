//! [`ActionGate`] – single interception point between decision makers and
//! the command dispatcher.
//!
//! Every non-emergency command must pass [`ActionGate::authorize`], which
//! enforces two checks in order:
//!
//! 1. **Channel ownership** ([`ActionArbiter`]): the requester must currently
//!    hold the action channel.
//! 2. **Interlock** ([`Interlock`]): the command must satisfy every rule
//!    against the latest link snapshot and the emergency latch.
//!
//! Safety stops never go through the gate; they are injected straight into
//! the dispatcher.
//!
//! ```
//! use rex_kernel::{ActionGate, ChannelOwner, Interlock, MotionLimits};
//! use rex_types::{Gesture, RobotCommand, RobotLinkState};
//!
//! let mut gate = ActionGate::new(Interlock::standard(&MotionLimits::default()));
//! let link = RobotLinkState::default();
//! let sit = RobotCommand::Gesture(Gesture::Sit);
//!
//! assert!(gate.authorize(ChannelOwner::Behavior, &sit, &link).is_err());
//! gate.arbiter_mut().try_acquire(ChannelOwner::Behavior).unwrap();
//! assert!(gate.authorize(ChannelOwner::Behavior, &sit, &link).is_ok());
//!
//! gate.latch_emergency();
//! assert!(gate.authorize(ChannelOwner::Behavior, &sit, &link).is_err());
//! ```

use rex_types::{RexError, RobotCommand, RobotLinkState};

use crate::arbiter::{ActionArbiter, ChannelOwner};
use crate::interlock::{Interlock, InterlockContext};

pub struct ActionGate {
    arbiter: ActionArbiter,
    interlock: Interlock,
    emergency_latched: bool,
}

impl ActionGate {
    pub fn new(interlock: Interlock) -> Self {
        Self {
            arbiter: ActionArbiter::new(),
            interlock,
            emergency_latched: false,
        }
    }

    pub fn arbiter(&self) -> &ActionArbiter {
        &self.arbiter
    }

    pub fn arbiter_mut(&mut self) -> &mut ActionArbiter {
        &mut self.arbiter
    }

    pub fn latch_emergency(&mut self) {
        self.emergency_latched = true;
    }

    pub fn clear_emergency(&mut self) {
        self.emergency_latched = false;
    }

    pub fn is_latched(&self) -> bool {
        self.emergency_latched
    }

    /// # Errors
    ///
    /// - [`RexError::ChannelBusy`] – `owner` does not hold the action channel.
    /// - [`RexError::Interlock`] – a safety rule rejected the command.
    pub fn authorize(
        &self,
        owner: ChannelOwner,
        command: &RobotCommand,
        link: &RobotLinkState,
    ) -> Result<(), RexError> {
        if !self.arbiter.is_held_by(owner) {
            return Err(RexError::ChannelBusy {
                holder: self
                    .arbiter
                    .holder()
                    .map(|h| h.to_string())
                    .unwrap_or_else(|| "nobody".to_string()),
            });
        }
        let ctx = InterlockContext {
            link,
            emergency_latched: self.emergency_latched,
        };
        self.interlock.verify(command, &ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interlock::MotionLimits;
    use rex_types::{Direction, LinkStatus};

    fn gate() -> ActionGate {
        ActionGate::new(Interlock::standard(&MotionLimits::default()))
    }

    fn walk() -> RobotCommand {
        RobotCommand::Walk {
            direction: Direction::Left,
            speed: 0.2,
        }
    }

    #[test]
    fn requester_must_hold_channel() {
        let mut g = gate();
        let link = RobotLinkState::default();
        g.arbiter_mut().try_acquire(ChannelOwner::Conversation).unwrap();
        let err = g.authorize(ChannelOwner::Behavior, &walk(), &link).unwrap_err();
        assert_eq!(
            err,
            RexError::ChannelBusy {
                holder: "conversation".into()
            }
        );
        assert!(g.authorize(ChannelOwner::Conversation, &walk(), &link).is_ok());
    }

    #[test]
    fn interlock_runs_after_ownership() {
        let mut g = gate();
        g.arbiter_mut().try_acquire(ChannelOwner::Behavior).unwrap();
        let lost = RobotLinkState {
            status: LinkStatus::Lost,
            ..RobotLinkState::default()
        };
        assert!(matches!(
            g.authorize(ChannelOwner::Behavior, &walk(), &lost),
            Err(RexError::Interlock { .. })
        ));
    }

    #[test]
    fn clearing_latch_restores_motion() {
        let mut g = gate();
        let link = RobotLinkState::default();
        g.arbiter_mut().try_acquire(ChannelOwner::Conversation).unwrap();
        g.latch_emergency();
        assert!(g.authorize(ChannelOwner::Conversation, &walk(), &link).is_err());
        g.clear_emergency();
        assert!(!g.is_latched());
        assert!(g.authorize(ChannelOwner::Conversation, &walk(), &link).is_ok());
    }
}
