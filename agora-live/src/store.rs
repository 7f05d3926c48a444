//! Session-durable key-value store.
//!
//! Backs the two pieces of client state that must outlive a page reload:
//!
//! - `viewedResources` — resource id → reported-at timestamp. The presence
//!   of a record here is the sole authority for "this view was already
//!   counted"; in-memory flags only exist to skip redundant work.
//! - preferences — currently the notification-sound toggle, which is
//!   independent of the session's view records.
//!
//! Storage format: an append-only log of length-prefixed, bincode-encoded
//! records, each carrying an FNV-folded checksum. Recovery replays the log
//! and stops at the first record that fails framing or verification, so a
//! torn tail from a crash never poisons earlier records. Last write wins
//! per key.
//!
//! Two tabs sharing one session file may both report a view before either
//! append lands; that is a documented limitation, not something this layer
//! locks against.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Preference key for the notification sound toggle.
pub const PREF_NOTIFICATION_SOUND: &str = "notificationSound";

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Record type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RecordKind {
    /// A view report for one resource (value = reported-at millis).
    View = 1,
    /// A preference flag (value = 0 or 1).
    Preference = 2,
}

/// One persisted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub kind: RecordKind,
    pub key: String,
    pub value: u64,
    /// FNV-folded checksum over kind, key and value.
    pub checksum: u32,
}

impl SessionRecord {
    /// Create a record with its checksum computed.
    pub fn new(kind: RecordKind, key: impl Into<String>, value: u64) -> Self {
        let key = key.into();
        let checksum = Self::compute_checksum(kind, &key, value);
        Self {
            kind,
            key,
            value,
            checksum,
        }
    }

    /// Verify the record's checksum.
    pub fn verify(&self) -> bool {
        self.checksum == Self::compute_checksum(self.kind, &self.key, self.value)
    }

    fn compute_checksum(kind: RecordKind, key: &str, value: u64) -> u32 {
        let mut hash: u32 = 0x811c_9dc5; // FNV offset basis
        hash ^= kind as u32;
        hash = hash.wrapping_mul(0x0100_0193); // FNV prime
        for byte in key.as_bytes() {
            hash ^= *byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        hash ^= value as u32;
        hash = hash.wrapping_mul(0x0100_0193);
        hash ^= (value >> 32) as u32;
        hash = hash.wrapping_mul(0x0100_0193);
        hash
    }

    /// Serialize record to bytes.
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    /// Deserialize record from bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(record)
    }
}

/// Store errors.
#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    SerializationError(String),
    DeserializationError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "Store I/O error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Store serialization error: {e}"),
            StoreError::DeserializationError(e) => {
                write!(f, "Store deserialization error: {e}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

/// The session store: an in-memory map view over an append-only log file.
///
/// `in_memory()` keeps everything in the maps with no backing file, which
/// is what tests and private-browsing style sessions use.
pub struct SessionStore {
    path: Option<PathBuf>,
    file: Option<File>,
    viewed: HashMap<String, u64>,
    prefs: HashMap<String, u64>,
    corrupt_skipped: usize,
}

impl SessionStore {
    /// Open (or create) a store backed by the given log file and replay it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let mut viewed = HashMap::new();
        let mut prefs = HashMap::new();
        let mut corrupt_skipped = 0;

        if path.exists() {
            let mut bytes = Vec::new();
            File::open(&path)?.read_to_end(&mut bytes)?;
            let (records, skipped) = Self::recover_records(&bytes);
            corrupt_skipped = skipped;
            for record in records {
                match record.kind {
                    RecordKind::View => {
                        viewed.insert(record.key, record.value);
                    }
                    RecordKind::Preference => {
                        prefs.insert(record.key, record.value);
                    }
                }
            }
            if skipped > 0 {
                log::warn!(
                    "session store {}: skipped {skipped} corrupt record(s) during recovery",
                    path.display()
                );
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path: Some(path),
            file: Some(file),
            viewed,
            prefs,
            corrupt_skipped,
        })
    }

    /// A store with no backing file.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            file: None,
            viewed: HashMap::new(),
            prefs: HashMap::new(),
            corrupt_skipped: 0,
        }
    }

    /// Replay length-prefixed records, stopping at the first framing or
    /// checksum failure. Returns valid records and the count skipped.
    fn recover_records(bytes: &[u8]) -> (Vec<SessionRecord>, usize) {
        let mut records = Vec::new();
        let mut offset = 0usize;

        while offset + 4 <= bytes.len() {
            let len =
                u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
                    as usize;
            offset += 4;
            if offset + len > bytes.len() {
                // Torn tail from an interrupted append.
                return (records, 1);
            }
            match SessionRecord::decode(&bytes[offset..offset + len]) {
                Ok(record) if record.verify() => {
                    records.push(record);
                    offset += len;
                }
                _ => return (records, 1),
            }
        }

        (records, 0)
    }

    fn append(&mut self, record: &SessionRecord) -> Result<(), StoreError> {
        if let Some(file) = self.file.as_mut() {
            let bytes = record.encode()?;
            file.write_all(&(bytes.len() as u32).to_le_bytes())?;
            file.write_all(&bytes)?;
            file.flush()?;
        }
        Ok(())
    }

    /// Whether a view has already been reported for this resource.
    pub fn has_viewed(&self, resource_id: &str) -> bool {
        self.viewed.contains_key(resource_id)
    }

    /// When the view for this resource was reported, if ever.
    pub fn viewed_at(&self, resource_id: &str) -> Option<u64> {
        self.viewed.get(resource_id).copied()
    }

    /// Record that a view was reported for this resource.
    ///
    /// Idempotent: returns `false` without writing if a record exists.
    pub fn record_view(&mut self, resource_id: &str) -> Result<bool, StoreError> {
        if self.viewed.contains_key(resource_id) {
            return Ok(false);
        }
        let record = SessionRecord::new(RecordKind::View, resource_id, now_millis());
        self.append(&record)?;
        self.viewed.insert(record.key, record.value);
        Ok(true)
    }

    /// Number of resources with a recorded view this session.
    pub fn viewed_count(&self) -> usize {
        self.viewed.len()
    }

    /// Notification sound preference. Defaults to enabled.
    pub fn sound_enabled(&self) -> bool {
        self.prefs
            .get(PREF_NOTIFICATION_SOUND)
            .map(|v| *v != 0)
            .unwrap_or(true)
    }

    /// Persist the notification sound preference.
    pub fn set_sound_enabled(&mut self, enabled: bool) -> Result<(), StoreError> {
        let record = SessionRecord::new(
            RecordKind::Preference,
            PREF_NOTIFICATION_SOUND,
            u64::from(enabled),
        );
        self.append(&record)?;
        self.prefs.insert(record.key, record.value);
        Ok(())
    }

    /// Records skipped during recovery (0 unless the log was damaged).
    pub fn corrupt_records_skipped(&self) -> usize {
        self.corrupt_skipped
    }

    /// Backing file path, if any.
    pub fn path(&self) -> Option<&std::path::Path> {
        self.path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_record_checksum_roundtrip() {
        let record = SessionRecord::new(RecordKind::View, "q-42", 1_700_000_000_000);
        assert!(record.verify());

        let encoded = record.encode().unwrap();
        let decoded = SessionRecord::decode(&encoded).unwrap();
        assert_eq!(decoded, record);
        assert!(decoded.verify());
    }

    #[test]
    fn test_record_detects_corruption() {
        let mut record = SessionRecord::new(RecordKind::View, "q-42", 123);
        record.value = 456;
        assert!(!record.verify());
    }

    #[test]
    fn test_in_memory_view_records() {
        let mut store = SessionStore::in_memory();
        assert!(!store.has_viewed("q-42"));

        assert!(store.record_view("q-42").unwrap());
        assert!(store.has_viewed("q-42"));
        assert!(store.viewed_at("q-42").is_some());

        // Second write is a no-op.
        assert!(!store.record_view("q-42").unwrap());
        assert_eq!(store.viewed_count(), 1);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.log");

        {
            let mut store = SessionStore::open(&path).unwrap();
            store.record_view("q-1").unwrap();
            store.record_view("q-2").unwrap();
            store.set_sound_enabled(false).unwrap();
        }

        let store = SessionStore::open(&path).unwrap();
        assert!(store.has_viewed("q-1"));
        assert!(store.has_viewed("q-2"));
        assert!(!store.has_viewed("q-3"));
        assert!(!store.sound_enabled());
        assert_eq!(store.corrupt_records_skipped(), 0);
    }

    #[test]
    fn test_sound_preference_default_and_flip() {
        let mut store = SessionStore::in_memory();
        assert!(store.sound_enabled());

        store.set_sound_enabled(false).unwrap();
        assert!(!store.sound_enabled());

        store.set_sound_enabled(true).unwrap();
        assert!(store.sound_enabled());
    }

    #[test]
    fn test_recovery_stops_at_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.log");

        {
            let mut store = SessionStore::open(&path).unwrap();
            store.record_view("q-1").unwrap();
        }

        // Simulate a torn append: a length prefix with no body behind it.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&100u32.to_le_bytes()).unwrap();
            file.write_all(&[1, 2, 3]).unwrap();
        }

        let store = SessionStore::open(&path).unwrap();
        assert!(store.has_viewed("q-1"));
        assert_eq!(store.corrupt_records_skipped(), 1);
    }

    #[test]
    fn test_recovery_rejects_bad_checksum() {
        let mut record = SessionRecord::new(RecordKind::View, "q-9", 7);
        record.checksum ^= 0xFFFF;
        let bytes = record.encode().unwrap();

        let mut log = Vec::new();
        log.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        log.extend_from_slice(&bytes);

        let (records, skipped) = SessionStore::recover_records(&log);
        assert!(records.is_empty());
        assert_eq!(skipped, 1);
    }

    #[test]
    fn test_last_write_wins_per_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.log");

        {
            let mut store = SessionStore::open(&path).unwrap();
            store.set_sound_enabled(false).unwrap();
            store.set_sound_enabled(true).unwrap();
            store.set_sound_enabled(false).unwrap();
        }

        let store = SessionStore::open(&path).unwrap();
        assert!(!store.sound_enabled());
    }
}
