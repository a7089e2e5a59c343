//! Topic-based publish/subscribe bus for status events.
//!
//! Uses [`tokio::sync::broadcast`] channels so a slow UI never blocks the
//! control loop. Every event published to a topic lane is also mirrored onto
//! the firehose channel returned by [`EventBus::subscribe`], which is what
//! the status server forwards to the shell.
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Conversation`] | Phase changes, heard and spoken text, thoughts |
//! | [`Topic::Perception`] | Recognized people |
//! | [`Topic::Commands`] | Dispatched and failed robot commands |
//! | [`Topic::Safety`] | Link status, low battery, emergency stops |

use rex_types::Event;
use tokio::sync::broadcast;

/// Number of buffered events before old ones are dropped for slow
/// subscribers.
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Conversation,
    Perception,
    Commands,
    Safety,
}

/// Shared event bus. Clones share the same underlying channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    firehose: broadcast::Sender<Event>,
    conversation: broadcast::Sender<Event>,
    perception: broadcast::Sender<Event>,
    commands: broadcast::Sender<Event>,
    safety: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus. `capacity` applies to every channel independently.
    pub fn new(capacity: usize) -> Self {
        let (firehose, _) = broadcast::channel(capacity);
        let (conversation, _) = broadcast::channel(capacity);
        let (perception, _) = broadcast::channel(capacity);
        let (commands, _) = broadcast::channel(capacity);
        let (safety, _) = broadcast::channel(capacity);
        Self {
            firehose,
            conversation,
            perception,
            commands,
            safety,
        }
    }

    /// Publish `event` to `topic` and to the firehose.
    ///
    /// Returns how many receivers were handed the event on the topic lane.
    /// Having no subscribers is normal and yields `0`; status reporting never
    /// fails the caller.
    pub fn publish_to(&self, topic: Topic, event: Event) -> usize {
        let _ = self.firehose.send(event.clone());
        self.topic_sender(topic).send(event).unwrap_or(0)
    }

    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Subscribe to every event regardless of topic.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.firehose.subscribe()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Conversation => &self.conversation,
            Topic::Perception => &self.perception,
            Topic::Commands => &self.commands,
            Topic::Safety => &self.safety,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// An async receiver bound to a single [`Topic`] channel.
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// `Lagged(n)` means the subscriber fell behind and `n` events were
    /// dropped; `Closed` means the bus is gone.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}
