//! [`ActionArbiter`] – the single-holder action channel.
//!
//! Only one owner may command motion at a time. A request from a higher
//! priority owner preempts the current holder; a request from an equal or
//! lower priority owner is refused with [`RexError::ChannelBusy`] and the
//! caller is expected to retry later.
//!
//! Priority: `ConversationEmergency > Conversation > Behavior`.

use std::fmt;

use rex_types::RexError;
use tracing::debug;

/// Who is asking for the action channel. Ordered by priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChannelOwner {
    Behavior,
    Conversation,
    ConversationEmergency,
}

impl fmt::Display for ChannelOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelOwner::Behavior => "behavior",
            ChannelOwner::Conversation => "conversation",
            ChannelOwner::ConversationEmergency => "conversation-emergency",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    Acquired,
    AlreadyHeld,
    /// The channel was taken away from a lower priority holder.
    Preempted(ChannelOwner),
}

/// ```
/// use rex_kernel::arbiter::{ActionArbiter, ChannelOwner, Grant};
///
/// let mut arbiter = ActionArbiter::new();
/// assert_eq!(arbiter.try_acquire(ChannelOwner::Behavior).unwrap(), Grant::Acquired);
/// assert_eq!(
///     arbiter.try_acquire(ChannelOwner::Conversation).unwrap(),
///     Grant::Preempted(ChannelOwner::Behavior)
/// );
/// assert!(arbiter.try_acquire(ChannelOwner::Behavior).is_err());
/// ```
#[derive(Debug, Default)]
pub struct ActionArbiter {
    holder: Option<ChannelOwner>,
}

impl ActionArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holder(&self) -> Option<ChannelOwner> {
        self.holder
    }

    pub fn is_held_by(&self, owner: ChannelOwner) -> bool {
        self.holder == Some(owner)
    }

    pub fn try_acquire(&mut self, owner: ChannelOwner) -> Result<Grant, RexError> {
        match self.holder {
            None => {
                self.holder = Some(owner);
                debug!(%owner, "action channel acquired");
                Ok(Grant::Acquired)
            }
            Some(current) if current == owner => Ok(Grant::AlreadyHeld),
            Some(current) if owner > current => {
                self.holder = Some(owner);
                debug!(%owner, preempted = %current, "action channel preempted");
                Ok(Grant::Preempted(current))
            }
            Some(current) => Err(RexError::ChannelBusy {
                holder: current.to_string(),
            }),
        }
    }

    /// Release the channel if `owner` holds it. Returns whether it did.
    pub fn release(&mut self, owner: ChannelOwner) -> bool {
        if self.holder == Some(owner) {
            self.holder = None;
            debug!(%owner, "action channel released");
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_channel_is_granted() {
        let mut a = ActionArbiter::new();
        assert_eq!(a.try_acquire(ChannelOwner::Conversation).unwrap(), Grant::Acquired);
        assert_eq!(a.holder(), Some(ChannelOwner::Conversation));
    }

    #[test]
    fn behavior_is_denied_while_conversation_holds() {
        let mut a = ActionArbiter::new();
        a.try_acquire(ChannelOwner::Conversation).unwrap();
        let err = a.try_acquire(ChannelOwner::Behavior).unwrap_err();
        assert_eq!(
            err,
            RexError::ChannelBusy {
                holder: "conversation".into()
            }
        );
    }

    #[test]
    fn emergency_preempts_everyone() {
        let mut a = ActionArbiter::new();
        a.try_acquire(ChannelOwner::Conversation).unwrap();
        assert_eq!(
            a.try_acquire(ChannelOwner::ConversationEmergency).unwrap(),
            Grant::Preempted(ChannelOwner::Conversation)
        );
        assert!(a.try_acquire(ChannelOwner::Conversation).is_err());
    }

    #[test]
    fn reacquire_by_holder_is_idempotent() {
        let mut a = ActionArbiter::new();
        a.try_acquire(ChannelOwner::Behavior).unwrap();
        assert_eq!(a.try_acquire(ChannelOwner::Behavior).unwrap(), Grant::AlreadyHeld);
    }

    #[test]
    fn only_holder_can_release() {
        let mut a = ActionArbiter::new();
        a.try_acquire(ChannelOwner::Conversation).unwrap();
        assert!(!a.release(ChannelOwner::Behavior));
        assert!(a.release(ChannelOwner::Conversation));
        assert_eq!(a.holder(), None);
        assert_eq!(a.try_acquire(ChannelOwner::Behavior).unwrap(), Grant::Acquired);
    }
}
