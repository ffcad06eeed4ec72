use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::models::Level;

/// Identity of one tutoring conversation: same normalized fields, same memory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub level: Level,
    pub focus: String,
    pub grade: String,
    pub identity: String,
}

impl SessionKey {
    pub fn new(level: &str, focus: &str, grade: &str, identity: &str) -> Self {
        Self {
            level: Level::parse(level),
            focus: focus.trim().to_string(),
            grade: grade.trim().to_string(),
            identity: identity.to_string(),
        }
    }

    /// Hex digest of the normalized fields. Used as the map key and for logging,
    /// so the raw identity token never leaves this struct.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.level.as_str(),
            self.focus.as_str(),
            self.grade.as_str(),
            self.identity.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]);
        }
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub last_micro_lesson: String,
    pub last_reply_signature: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    fn empty() -> Self {
        Self {
            last_micro_lesson: String::new(),
            last_reply_signature: None,
            updated_at: Utc::now(),
        }
    }
}

/// Per-session repetition memory consulted by the rewriter.
///
/// Every operation is a single-key upsert or read; no multi-key atomicity is offered,
/// and a read-then-write across one rewrite may interleave with another request.
pub trait SessionStore: Send + Sync {
    fn last_micro_lesson(&self, key: &SessionKey) -> String;
    fn remember_micro_lesson(&self, key: &SessionKey, text: &str);
    fn last_reply_signature(&self, key: &SessionKey) -> Option<String>;
    fn remember_reply_signature(&self, key: &SessionKey, text: &str);
    fn forget(&self, key: &SessionKey);
}

pub fn signature(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

/// Process-lifetime store behind one mutex.
///
/// `capacity == 0` never evicts. Otherwise inserting a new key past capacity drops the
/// least recently updated record.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    records: Mutex<HashMap<String, SessionRecord>>,
    capacity: usize,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn record(&self, key: &SessionKey) -> Option<SessionRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key.fingerprint())
            .cloned()
    }

    fn upsert(&self, key: &SessionKey, update: impl FnOnce(&mut SessionRecord)) {
        let fingerprint = key.fingerprint();
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);

        if self.capacity > 0
            && records.len() >= self.capacity
            && !records.contains_key(&fingerprint)
        {
            let oldest = records
                .iter()
                .min_by_key(|(_, record)| record.updated_at)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                records.remove(&oldest);
                tracing::debug!(evicted = %oldest, "session memory at capacity");
            }
        }

        let record = records.entry(fingerprint).or_insert_with(SessionRecord::empty);
        update(record);
        record.updated_at = Utc::now();
    }
}

impl SessionStore for InMemorySessionStore {
    fn last_micro_lesson(&self, key: &SessionKey) -> String {
        self.record(key)
            .map(|record| record.last_micro_lesson)
            .unwrap_or_default()
    }

    fn remember_micro_lesson(&self, key: &SessionKey, text: &str) {
        self.upsert(key, |record| record.last_micro_lesson = text.to_string());
    }

    fn last_reply_signature(&self, key: &SessionKey) -> Option<String> {
        self.record(key).and_then(|record| record.last_reply_signature)
    }

    fn remember_reply_signature(&self, key: &SessionKey, text: &str) {
        let hashed = signature(text);
        self.upsert(key, |record| record.last_reply_signature = Some(hashed));
    }

    fn forget(&self, key: &SessionKey) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key.fingerprint());
    }
}
