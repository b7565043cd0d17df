//! Persistence facade for scheduled messages.
//!
//! The scheduler treats the store as the single source of truth for message
//! status. [`MemoryStore`] backs tests and embedders; [`JsonFileStore`] keeps
//! the collection in one JSON document on disk for the daemon.
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::{MessageStatus, ScheduledMessage};

/// Store-assigned identifier of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message {0} not found")]
    NotFound(MessageId),

    #[error("message has no id; save it first")]
    Unsaved,

    #[error("store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("store serialisation error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// The operations the scheduler needs from the message collection.
pub trait MessageStore: Send + Sync {
    fn find_by_status(&self, status: MessageStatus) -> Result<Vec<ScheduledMessage>, StoreError>;

    /// Messages scheduled within the last `window` (future ones excluded).
    fn find_since(&self, window: Duration) -> Result<Vec<ScheduledMessage>, StoreError>;

    fn find_by_id(&self, id: MessageId) -> Result<ScheduledMessage, StoreError>;

    /// Insert or replace `message`, assigning an id on first save.
    fn save(&self, message: &mut ScheduledMessage) -> Result<MessageId, StoreError>;

    fn remove(&self, message: &ScheduledMessage) -> Result<(), StoreError>;
}

/// The collection itself, shared by both store flavours.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Collection {
    next_id: u64,
    messages: BTreeMap<MessageId, ScheduledMessage>,
}

impl Collection {
    fn by_status(&self, status: MessageStatus) -> Vec<ScheduledMessage> {
        let mut found: Vec<_> = self
            .messages
            .values()
            .filter(|m| m.status == status)
            .cloned()
            .collect();
        found.sort_by_key(|m| m.scheduled_at);
        found
    }

    fn since(&self, now: DateTime<Utc>, window: Duration) -> Vec<ScheduledMessage> {
        let from = now - window;
        let mut found: Vec<_> = self
            .messages
            .values()
            .filter(|m| m.scheduled_at >= from && m.scheduled_at <= now)
            .cloned()
            .collect();
        found.sort_by_key(|m| m.scheduled_at);
        found
    }

    fn get(&self, id: MessageId) -> Result<ScheduledMessage, StoreError> {
        self.messages.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    fn upsert(&mut self, message: &mut ScheduledMessage) -> MessageId {
        let id = match message.id {
            Some(id) => id,
            None => {
                self.next_id += 1;
                let id = MessageId(self.next_id);
                message.id = Some(id);
                id
            }
        };
        self.messages.insert(id, message.clone());
        id
    }

    fn delete(&mut self, message: &ScheduledMessage) -> Result<(), StoreError> {
        let id = message.id.ok_or(StoreError::Unsaved)?;
        self.messages
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }
}

fn lock(collection: &Mutex<Collection>) -> MutexGuard<'_, Collection> {
    collection.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Volatile store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Collection>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MessageStore for MemoryStore {
    fn find_by_status(&self, status: MessageStatus) -> Result<Vec<ScheduledMessage>, StoreError> {
        Ok(lock(&self.inner).by_status(status))
    }

    fn find_since(&self, window: Duration) -> Result<Vec<ScheduledMessage>, StoreError> {
        Ok(lock(&self.inner).since(Utc::now(), window))
    }

    fn find_by_id(&self, id: MessageId) -> Result<ScheduledMessage, StoreError> {
        lock(&self.inner).get(id)
    }

    fn save(&self, message: &mut ScheduledMessage) -> Result<MessageId, StoreError> {
        Ok(lock(&self.inner).upsert(message))
    }

    fn remove(&self, message: &ScheduledMessage) -> Result<(), StoreError> {
        lock(&self.inner).delete(message)
    }
}

/// Store persisted as a single JSON document, rewritten on every change.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    inner: Mutex<Collection>,
}

impl JsonFileStore {
    /// Open `path`, starting empty when the file does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let collection = match fs::read(&path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Collection::default(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Collection::default(),
            Err(e) => return Err(e.into()),
        };
        debug!(
            "opened message store {} ({} messages)",
            path.display(),
            collection.messages.len()
        );
        Ok(Self {
            path,
            inner: Mutex::new(collection),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write to a sibling temp file, then rename it into place.
    fn flush(&self, collection: &Collection) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(collection)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl MessageStore for JsonFileStore {
    fn find_by_status(&self, status: MessageStatus) -> Result<Vec<ScheduledMessage>, StoreError> {
        Ok(lock(&self.inner).by_status(status))
    }

    fn find_since(&self, window: Duration) -> Result<Vec<ScheduledMessage>, StoreError> {
        Ok(lock(&self.inner).since(Utc::now(), window))
    }

    fn find_by_id(&self, id: MessageId) -> Result<ScheduledMessage, StoreError> {
        lock(&self.inner).get(id)
    }

    fn save(&self, message: &mut ScheduledMessage) -> Result<MessageId, StoreError> {
        let mut collection = lock(&self.inner);
        let previous_next = collection.next_id;
        let previous = message.id.and_then(|id| collection.messages.get(&id).cloned());
        let assigned = message.id.is_none();
        let id = collection.upsert(message);
        if let Err(e) = self.flush(&collection) {
            // Keep memory in step with disk.
            collection.next_id = previous_next;
            match previous {
                Some(old) => {
                    collection.messages.insert(id, old);
                }
                None => {
                    collection.messages.remove(&id);
                }
            }
            if assigned {
                message.id = None;
            }
            return Err(e);
        }
        Ok(id)
    }

    fn remove(&self, message: &ScheduledMessage) -> Result<(), StoreError> {
        let mut collection = lock(&self.inner);
        let id = message.id.ok_or(StoreError::Unsaved)?;
        let old = collection.get(id)?;
        collection.delete(message)?;
        if let Err(e) = self.flush(&collection) {
            collection.messages.insert(id, old);
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;

    fn message(offset_secs: i64) -> ScheduledMessage {
        ScheduledMessage::new(
            Utc::now() + Duration::seconds(offset_secs),
            "Varsity",
            Payload::raw(b"ping".to_vec()),
        )
    }

    #[test]
    fn save_assigns_ids_and_finds_by_status() {
        let store = MemoryStore::new();
        let mut a = message(10);
        let mut b = message(5);
        let id_a = store.save(&mut a).unwrap();
        let id_b = store.save(&mut b).unwrap();
        assert_ne!(id_a, id_b);
        assert_eq!(a.id, Some(id_a));

        b.status = MessageStatus::Missed;
        store.save(&mut b).unwrap();
        assert_eq!(store.len(), 2);

        let queued = store.find_by_status(MessageStatus::Queued).unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, Some(id_a));
        assert_eq!(store.find_by_id(id_b).unwrap().status, MessageStatus::Missed);
    }

    #[test]
    fn find_since_excludes_old_and_future() {
        let store = MemoryStore::new();
        for offset in [-60, -30, 30] {
            store.save(&mut message(offset)).unwrap();
        }
        assert_eq!(store.find_since(Duration::seconds(45)).unwrap().len(), 1);
        assert_eq!(store.find_since(Duration::seconds(90)).unwrap().len(), 2);
    }

    #[test]
    fn remove_requires_a_saved_message() {
        let store = MemoryStore::new();
        assert!(matches!(store.remove(&message(0)), Err(StoreError::Unsaved)));
        let mut m = message(0);
        store.save(&mut m).unwrap();
        store.remove(&m).unwrap();
        assert!(store.is_empty());
        assert!(matches!(store.remove(&m), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn json_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.json");

        let store = JsonFileStore::open(&path).unwrap();
        let mut m = message(120).with_header("Round", "2");
        let id = store.save(&mut m).unwrap();
        m.status = MessageStatus::Scheduled;
        store.save(&mut m).unwrap();
        drop(store);

        let reopened = JsonFileStore::open(&path).unwrap();
        let loaded = reopened.find_by_id(id).unwrap();
        assert_eq!(loaded, m);
        let mut next = message(0);
        assert_ne!(reopened.save(&mut next).unwrap(), id);
    }

    #[test]
    fn json_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.json");
        fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(JsonFileStore::open(&path), Err(StoreError::Serde(_))));
    }
}
