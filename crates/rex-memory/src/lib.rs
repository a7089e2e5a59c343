//! `rex-memory` – The Knowledge Base.
//!
//! Who the robot has met and what it remembers about them, persisted in a
//! local SQLite file, plus the rolling window of the current conversation.
//!
//! # Modules
//!
//! - [`store`] – [`MemoryStore`]: people, face fingerprints and the
//!   append-only episodic log, with concurrent reads.
//! - [`person`] – [`Person`] records and fingerprint matching.
//! - [`episodic`] – [`MemoryEntry`] and the [`PrunePolicy`].
//! - [`window`] – [`ConversationWindow`]: bounded most-recent-N turns.

mod embedding;
pub mod episodic;
pub mod person;
pub mod store;
pub mod window;

pub use embedding::cosine_similarity;
pub use episodic::{DEFAULT_IMPORTANCE, MemoryEntry, PrunePolicy};
pub use person::{MAX_FINGERPRINTS, Person};
pub use store::{MemoryConfig, MemoryError, MemoryStore};
pub use window::{ConversationTurn, ConversationWindow, TurnRole};
