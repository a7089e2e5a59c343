//! [`MemoryStore`] – people and episodic memory on SQLite.
//!
//! SQLite is the durable copy; every record is also held in memory so that
//! readers (vision matching, cognition context) never touch the database.
//! Reads share an [`RwLock`]; writes hold the connection [`Mutex`] and then
//! the cache write lock, so appends are exclusive and always land on disk
//! before they become visible.
//!
//! # Storage layout
//!
//! | table          | columns                                                         |
//! |----------------|-----------------------------------------------------------------|
//! | `people`       | id, name, last_seen, greet_cooldown_until, is_master, created_at |
//! | `fingerprints` | rowid, person_id, embedding (little-endian f32 BLOB)            |
//! | `memories`     | id, timestamp, subject, summary, importance                     |
//!
//! # Example
//!
//! ```rust
//! use chrono::Utc;
//! use rex_memory::{MemoryEntry, MemoryStore};
//!
//! let store = MemoryStore::open_in_memory().unwrap();
//! let alice = store.enroll_person("Alice", vec![0.9, 0.1, 0.0], false, Utc::now()).unwrap();
//!
//! let (found, similarity) = store.identify(&[0.9, 0.1, 0.0]).unwrap();
//! assert_eq!(found.id, alice.id);
//! assert!(similarity > 0.99);
//!
//! store.append(&MemoryEntry::new(Some(alice.id), "Alice likes dogs.", 6.0)).unwrap();
//! assert_eq!(store.memories_about(alice.id, 5).len(), 1);
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use rex_types::{PersonId, RexError};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::embedding::{bytes_to_embedding, embedding_to_bytes};
use crate::episodic::{MemoryEntry, PrunePolicy};
use crate::person::{MAX_FINGERPRINTS, Person};

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Unknown person {0}")]
    UnknownPerson(PersonId),
    #[error("Fingerprint must be non-empty")]
    EmptyFingerprint,
    #[error("Memory store lock poisoned")]
    Poisoned,
}

impl From<MemoryError> for RexError {
    fn from(e: MemoryError) -> Self {
        RexError::Storage(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Database file; `None` keeps everything in memory.
    pub path: Option<String>,
    /// Memory excerpts included in each cognition request.
    pub context_entries: usize,
    /// Turns kept in the rolling conversation window.
    pub window_turns: usize,
    pub prune: PrunePolicy,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            path: None,
            context_entries: 5,
            window_turns: 20,
            prune: PrunePolicy::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row helpers
// ─────────────────────────────────────────────────────────────────────────────

fn parse_ts(col: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    s.parse::<DateTime<Utc>>().map_err(|e| {
        rusqlite::Error::InvalidColumnType(col, e.to_string(), rusqlite::types::Type::Text)
    })
}

fn parse_uuid(col: usize, s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| {
        rusqlite::Error::InvalidColumnType(col, e.to_string(), rusqlite::types::Type::Text)
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// MemoryStore
// ─────────────────────────────────────────────────────────────────────────────

pub struct MemoryStore {
    conn: Mutex<Connection>,
    people: RwLock<HashMap<PersonId, Person>>,
    memories: RwLock<Vec<MemoryEntry>>,
}

impl MemoryStore {
    /// Open (or create) a persistent database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, MemoryError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, MemoryError> {
        init_schema(&conn)?;
        let people = load_people(&conn)?;
        let memories = load_memories(&conn)?;
        info!(people = people.len(), memories = memories.len(), "memory store loaded");
        Ok(Self {
            conn: Mutex::new(conn),
            people: RwLock::new(people),
            memories: RwLock::new(memories),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, MemoryError> {
        self.conn.lock().map_err(|_| MemoryError::Poisoned)
    }

    // ── People ───────────────────────────────────────────────────────────────

    pub fn enroll_person(
        &self,
        name: &str,
        fingerprint: Vec<f32>,
        is_master: bool,
        now: DateTime<Utc>,
    ) -> Result<Person, MemoryError> {
        if fingerprint.is_empty() {
            return Err(MemoryError::EmptyFingerprint);
        }
        let person = Person::new(name, fingerprint, is_master, now);
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO people (id, name, last_seen, greet_cooldown_until, is_master, created_at)
             VALUES (?1, ?2, ?3, NULL, ?4, ?5)",
            params![
                person.id.to_string(),
                person.name,
                person.last_seen.to_rfc3339(),
                person.is_master,
                person.created_at.to_rfc3339(),
            ],
        )?;
        tx.execute(
            "INSERT INTO fingerprints (person_id, embedding) VALUES (?1, ?2)",
            params![person.id.to_string(), embedding_to_bytes(&person.fingerprints[0])],
        )?;
        tx.commit()?;
        self.people
            .write()
            .map_err(|_| MemoryError::Poisoned)?
            .insert(person.id, person.clone());
        info!(person_id = %person.id, name = %person.name, "person enrolled");
        Ok(person)
    }

    /// Best-matching known person for `embedding` and its similarity.
    pub fn identify(&self, embedding: &[f32]) -> Option<(Person, f32)> {
        let people = self.people.read().unwrap_or_else(PoisonError::into_inner);
        people
            .values()
            .map(|p| (p, p.similarity(embedding)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(p, s)| (p.clone(), s))
    }

    /// Update `last_seen` and optionally learn a new fingerprint sample.
    pub fn record_sighting(
        &self,
        id: PersonId,
        sample: Option<Vec<f32>>,
        now: DateTime<Utc>,
    ) -> Result<Person, MemoryError> {
        let mut conn = self.conn()?;
        let mut people = self.people.write().map_err(|_| MemoryError::Poisoned)?;
        let person = people.get_mut(&id).ok_or(MemoryError::UnknownPerson(id))?;
        let sample = sample.filter(|s| !s.is_empty());

        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE people SET last_seen = ?2 WHERE id = ?1",
            params![id.to_string(), now.to_rfc3339()],
        )?;
        if let Some(sample) = &sample {
            tx.execute(
                "INSERT INTO fingerprints (person_id, embedding) VALUES (?1, ?2)",
                params![id.to_string(), embedding_to_bytes(sample)],
            )?;
            tx.execute(
                "DELETE FROM fingerprints WHERE person_id = ?1 AND rowid NOT IN (
                     SELECT rowid FROM fingerprints WHERE person_id = ?1
                     ORDER BY rowid DESC LIMIT ?2)",
                params![id.to_string(), MAX_FINGERPRINTS as i64],
            )?;
        }
        tx.commit()?;

        person.last_seen = now;
        if let Some(sample) = sample {
            person.add_fingerprint(sample);
        }
        Ok(person.clone())
    }

    /// Suppress greetings for `id` until `until`.
    pub fn mark_greeted(&self, id: PersonId, until: DateTime<Utc>) -> Result<(), MemoryError> {
        let conn = self.conn()?;
        let mut people = self.people.write().map_err(|_| MemoryError::Poisoned)?;
        let person = people.get_mut(&id).ok_or(MemoryError::UnknownPerson(id))?;
        conn.execute(
            "UPDATE people SET greet_cooldown_until = ?2 WHERE id = ?1",
            params![id.to_string(), until.to_rfc3339()],
        )?;
        person.greet_cooldown_until = Some(until);
        debug!(person_id = %id, %until, "greeting cooldown set");
        Ok(())
    }

    pub fn person(&self, id: PersonId) -> Option<Person> {
        self.people
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Case-insensitive lookup by display name.
    pub fn person_by_name(&self, name: &str) -> Option<Person> {
        self.people
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn people(&self) -> Vec<Person> {
        let mut all: Vec<Person> = self
            .people
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|p| p.created_at);
        all
    }

    // ── Episodic memory ──────────────────────────────────────────────────────

    /// Append `entry` to the log. Entries are never rewritten.
    pub fn append(&self, entry: &MemoryEntry) -> Result<(), MemoryError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO memories (id, timestamp, subject, summary, importance)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.id.to_string(),
                entry.timestamp.to_rfc3339(),
                entry.subject.map(|s| s.to_string()),
                entry.summary,
                entry.importance as f64,
            ],
        )?;
        self.memories
            .write()
            .map_err(|_| MemoryError::Poisoned)?
            .push(entry.clone());
        Ok(())
    }

    /// Up to `limit` memories about `id`, most important first, ties broken
    /// by recency.
    pub fn memories_about(&self, id: PersonId, limit: usize) -> Vec<MemoryEntry> {
        let memories = self.memories.read().unwrap_or_else(PoisonError::into_inner);
        let mut about: Vec<MemoryEntry> = memories
            .iter()
            .filter(|m| m.subject == Some(id))
            .cloned()
            .collect();
        about.sort_by(|a, b| {
            b.importance
                .total_cmp(&a.importance)
                .then(b.timestamp.cmp(&a.timestamp))
        });
        about.truncate(limit);
        about
    }

    /// The `limit` most recent memories, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<MemoryEntry> {
        let memories = self.memories.read().unwrap_or_else(PoisonError::into_inner);
        let start = memories.len().saturating_sub(limit);
        memories[start..].to_vec()
    }

    /// Delete entries selected by `policy`. Returns how many were removed.
    pub fn prune(&self, policy: &PrunePolicy, now: DateTime<Utc>) -> Result<usize, MemoryError> {
        let mut conn = self.conn()?;
        let mut memories = self.memories.write().map_err(|_| MemoryError::Poisoned)?;
        let doomed: Vec<Uuid> = memories
            .iter()
            .filter(|m| policy.should_prune(m, now))
            .map(|m| m.id)
            .collect();
        let tx = conn.transaction()?;
        for id in &doomed {
            tx.execute("DELETE FROM memories WHERE id = ?1", params![id.to_string()])?;
        }
        tx.commit()?;
        memories.retain(|m| !doomed.contains(&m.id));
        if !doomed.is_empty() {
            info!(removed = doomed.len(), "memories pruned");
        }
        Ok(doomed.len())
    }
}

fn init_schema(conn: &Connection) -> Result<(), MemoryError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS people (
            id                   TEXT NOT NULL PRIMARY KEY,
            name                 TEXT NOT NULL,
            last_seen            TEXT NOT NULL,
            greet_cooldown_until TEXT,
            is_master            INTEGER NOT NULL DEFAULT 0,
            created_at           TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS fingerprints (
            person_id TEXT NOT NULL REFERENCES people(id),
            embedding BLOB NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_fingerprints_person ON fingerprints(person_id);
        CREATE TABLE IF NOT EXISTS memories (
            id         TEXT NOT NULL PRIMARY KEY,
            timestamp  TEXT NOT NULL,
            subject    TEXT,
            summary    TEXT NOT NULL,
            importance REAL NOT NULL
        );",
    )?;
    Ok(())
}

fn load_people(conn: &Connection) -> Result<HashMap<PersonId, Person>, MemoryError> {
    let mut stmt = conn.prepare(
        "SELECT id, name, last_seen, greet_cooldown_until, is_master, created_at FROM people",
    )?;
    let rows = stmt.query_map([], |row| {
        let id: String = row.get(0)?;
        let last_seen: String = row.get(2)?;
        let cooldown: Option<String> = row.get(3)?;
        let created_at: String = row.get(5)?;
        Ok(Person {
            id: PersonId(parse_uuid(0, &id)?),
            name: row.get(1)?,
            fingerprints: Vec::new(),
            last_seen: parse_ts(2, &last_seen)?,
            greet_cooldown_until: cooldown.as_deref().map(|s| parse_ts(3, s)).transpose()?,
            is_master: row.get(4)?,
            created_at: parse_ts(5, &created_at)?,
        })
    })?;
    let mut people = HashMap::new();
    for row in rows {
        let person = row?;
        people.insert(person.id, person);
    }

    let mut stmt =
        conn.prepare("SELECT person_id, embedding FROM fingerprints ORDER BY rowid ASC")?;
    let rows = stmt.query_map([], |row| {
        let id: String = row.get(0)?;
        let blob: Vec<u8> = row.get(1)?;
        Ok((PersonId(parse_uuid(0, &id)?), bytes_to_embedding(&blob)))
    })?;
    for row in rows {
        let (id, embedding) = row?;
        if let Some(person) = people.get_mut(&id) {
            person.fingerprints.push(embedding);
        }
    }
    Ok(people)
}

fn load_memories(conn: &Connection) -> Result<Vec<MemoryEntry>, MemoryError> {
    let mut stmt = conn.prepare(
        "SELECT id, timestamp, subject, summary, importance
         FROM memories ORDER BY timestamp ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        let id: String = row.get(0)?;
        let ts: String = row.get(1)?;
        let subject: Option<String> = row.get(2)?;
        let importance: f64 = row.get(4)?;
        Ok(MemoryEntry {
            id: parse_uuid(0, &id)?,
            timestamp: parse_ts(1, &ts)?,
            subject: subject
                .as_deref()
                .map(|s| parse_uuid(2, s).map(PersonId))
                .transpose()?,
            summary: row.get(3)?,
            importance: importance as f32,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rusqlite::OptionalExtension;
    use std::sync::Arc;

    fn person_row_exists(conn: &Connection, id: PersonId) -> rusqlite::Result<bool> {
        conn.query_row(
            "SELECT 1 FROM people WHERE id = ?1",
            params![id.to_string()],
            |_| Ok(()),
        )
        .optional()
        .map(|r| r.is_some())
    }

    #[test]
    fn identify_picks_closest_person() {
        let store = MemoryStore::open_in_memory().unwrap();
        let now = Utc::now();
        let alice = store.enroll_person("Alice", vec![1.0, 0.0, 0.0], false, now).unwrap();
        store.enroll_person("Bob", vec![0.0, 1.0, 0.0], false, now).unwrap();

        let (p, sim) = store.identify(&[0.9, 0.1, 0.0]).unwrap();
        assert_eq!(p.id, alice.id);
        assert!(sim > 0.9);
    }

    #[test]
    fn identify_on_empty_store_is_none() {
        let store = MemoryStore::open_in_memory().unwrap();
        assert!(store.identify(&[1.0, 0.0]).is_none());
    }

    #[test]
    fn empty_fingerprint_is_rejected() {
        let store = MemoryStore::open_in_memory().unwrap();
        assert!(matches!(
            store.enroll_person("Nobody", vec![], false, Utc::now()),
            Err(MemoryError::EmptyFingerprint)
        ));
    }

    #[test]
    fn sighting_updates_last_seen_and_caps_samples() {
        let store = MemoryStore::open_in_memory().unwrap();
        let t0 = Utc::now();
        let p = store.enroll_person("Alice", vec![1.0, 0.0], false, t0).unwrap();
        let mut last = p.clone();
        for i in 0..15 {
            last = store
                .record_sighting(p.id, Some(vec![1.0, i as f32]), t0 + Duration::seconds(i))
                .unwrap();
        }
        assert_eq!(last.last_seen, t0 + Duration::seconds(14));
        assert_eq!(last.fingerprints.len(), MAX_FINGERPRINTS);
        let conn = store.conn().unwrap();
        let rows: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM fingerprints WHERE person_id = ?1",
                params![p.id.to_string()],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(rows, MAX_FINGERPRINTS as i64);
    }

    #[test]
    fn sighting_of_unknown_person_errors() {
        let store = MemoryStore::open_in_memory().unwrap();
        let ghost = PersonId::new();
        assert!(matches!(
            store.record_sighting(ghost, None, Utc::now()),
            Err(MemoryError::UnknownPerson(id)) if id == ghost
        ));
    }

    #[test]
    fn memories_about_ranks_by_importance_then_recency() {
        let store = MemoryStore::open_in_memory().unwrap();
        let alice = store.enroll_person("Alice", vec![1.0], false, Utc::now()).unwrap();
        let base = Utc::now();
        let mk = |secs: i64, importance: f32, text: &str| MemoryEntry {
            timestamp: base + Duration::seconds(secs),
            ..MemoryEntry::new(Some(alice.id), text, importance)
        };
        store.append(&mk(0, 5.0, "old chat")).unwrap();
        store.append(&mk(10, 5.0, "new chat")).unwrap();
        store.append(&mk(5, 9.0, "birthday")).unwrap();
        store.append(&MemoryEntry::new(None, "saw a cat", 5.0)).unwrap();

        let about: Vec<String> = store
            .memories_about(alice.id, 2)
            .into_iter()
            .map(|m| m.summary)
            .collect();
        assert_eq!(about, vec!["birthday", "new chat"]);
        assert_eq!(store.recent(10).len(), 4);
    }

    #[test]
    fn append_is_append_only() {
        let store = MemoryStore::open_in_memory().unwrap();
        let entry = MemoryEntry::new(None, "once", 5.0);
        store.append(&entry).unwrap();
        assert!(store.append(&entry).is_err());
        assert_eq!(store.recent(10).len(), 1);
    }

    #[test]
    fn prune_removes_only_selected_entries() {
        let store = MemoryStore::open_in_memory().unwrap();
        let now = Utc::now();
        let old = MemoryEntry {
            timestamp: now - Duration::days(200),
            ..MemoryEntry::new(None, "old and dull", 2.0)
        };
        let precious = MemoryEntry {
            timestamp: now - Duration::days(200),
            ..MemoryEntry::new(None, "old but precious", 9.0)
        };
        store.append(&old).unwrap();
        store.append(&precious).unwrap();
        store.append(&MemoryEntry::new(None, "fresh", 1.0)).unwrap();

        assert_eq!(store.prune(&PrunePolicy::default(), now).unwrap(), 1);
        let left: Vec<String> = store.recent(10).into_iter().map(|m| m.summary).collect();
        assert_eq!(left, vec!["old but precious", "fresh"]);
    }

    fn count(store: &MemoryStore, table: &str) -> i64 {
        store
            .conn()
            .unwrap()
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn failed_enrollment_leaves_no_partial_person() {
        let store = MemoryStore::open_in_memory().unwrap();
        store
            .conn()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER no_prints BEFORE INSERT ON fingerprints
                 BEGIN SELECT RAISE(ABORT, 'fingerprints unavailable'); END;",
            )
            .unwrap();

        assert!(store.enroll_person("Alice", vec![1.0, 0.0], false, Utc::now()).is_err());
        assert_eq!(count(&store, "people"), 0);
        assert!(store.people().is_empty());
        assert!(store.identify(&[1.0, 0.0]).is_none());
    }

    #[test]
    fn failed_prune_keeps_database_and_cache_in_step() {
        let store = MemoryStore::open_in_memory().unwrap();
        let now = Utc::now();
        for summary in ["dull", "locked"] {
            store
                .append(&MemoryEntry {
                    timestamp: now - Duration::days(200),
                    ..MemoryEntry::new(None, summary, 1.0)
                })
                .unwrap();
        }
        store
            .conn()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER keep_locked BEFORE DELETE ON memories
                 WHEN OLD.summary = 'locked'
                 BEGIN SELECT RAISE(ABORT, 'locked'); END;",
            )
            .unwrap();

        assert!(store.prune(&PrunePolicy::default(), now).is_err());
        assert_eq!(count(&store, "memories"), 2);
        assert_eq!(store.recent(10).len(), 2);
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rex.db");
        let now = Utc::now();
        let alice_id;
        {
            let store = MemoryStore::open(&path).unwrap();
            let alice = store.enroll_person("Alice", vec![0.5, 0.5], true, now).unwrap();
            store.mark_greeted(alice.id, now + Duration::hours(1)).unwrap();
            store.append(&MemoryEntry::new(Some(alice.id), "likes tea", 6.0)).unwrap();
            assert!(person_row_exists(&store.conn().unwrap(), alice.id).unwrap());
            alice_id = alice.id;
        }
        let store = MemoryStore::open(&path).unwrap();
        let alice = store.person(alice_id).unwrap();
        assert_eq!(alice.name, "Alice");
        assert!(alice.is_master);
        assert_eq!(alice.fingerprints, vec![vec![0.5, 0.5]]);
        assert!(!alice.greeting_due(now));
        assert_eq!(store.memories_about(alice_id, 5)[0].summary, "likes tea");
        assert_eq!(store.person_by_name("alice").unwrap().id, alice_id);
    }

    #[test]
    fn concurrent_readers_and_a_writer() {
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        let p = store.enroll_person("Alice", vec![1.0, 0.0], false, Utc::now()).unwrap();
        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for i in 0..50 {
                    store
                        .append(&MemoryEntry::new(Some(p.id), format!("note {i}"), 5.0))
                        .unwrap();
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        assert!(store.identify(&[1.0, 0.0]).is_some());
                        let _ = store.memories_about(p.id, 3);
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(store.recent(100).len(), 50);
    }
}
