//! Backend-side caches keyed by content digest.
//!
//! Concurrent identical requests may both miss and both populate an entry;
//! the second write simply overwrites the first.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::Completion;

/// Hex SHA-256 of a value's JSON serialization.
pub fn digest_json<T: Serialize>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    digest_bytes(&bytes)
}

pub fn digest_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Memoized completions keyed by a digest of the full request.
#[derive(Default)]
pub struct ResponseCache {
    entries: Mutex<HashMap<String, Completion>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Completion> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    pub fn put(&self, key: String, completion: Completion) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key, completion);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct ContextEntry {
    name: String,
    expires_at: Instant,
}

/// Names of server-side cached contexts, keyed by a digest of the context
/// text, each valid until its time-to-live runs out.
pub struct ContextCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, ContextEntry>>,
}

impl ContextCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    /// The cached context name for `digest`, if it has not expired.
    pub fn get(&self, digest: &str) -> Option<String> {
        self.get_at(digest, Instant::now())
    }

    fn get_at(&self, digest: &str, now: Instant) -> Option<String> {
        let mut entries = self.entries.lock().ok()?;
        entries.retain(|_, e| e.expires_at > now);
        entries.get(digest).map(|e| e.name.clone())
    }

    pub fn put(&self, digest: String, name: String) {
        self.put_at(digest, name, Instant::now());
    }

    fn put_at(&self, digest: String, name: String, now: Instant) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                digest,
                ContextEntry {
                    name,
                    expires_at: now + self.ttl,
                },
            );
        }
    }
}
