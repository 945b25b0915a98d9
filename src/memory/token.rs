//! Process-unique tokens and the per-object cache keyed by them.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::sync::mutex::Mutex;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// A process-unique key for data cached on a Memory or foreign buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(u64);

impl Token {
    /// Allocate a fresh token. Never returns the same value twice.
    pub fn new() -> Self {
        Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl Default for Token {
    fn default() -> Self {
        Self::new()
    }
}

type Entry = Box<dyn Any + Send + Sync>;

/// Typed values keyed by [`Token`].
///
/// Entries are dropped with the cache, which is how cached interop
/// registrations get torn down with the buffer they were made for.
#[derive(Default)]
pub struct TokenCache {
    entries: Mutex<HashMap<Token, Entry>>,
}

impl TokenCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a clone of the value stored under `token`, if it has type `T`.
    pub fn get<T: Clone + 'static>(&self, token: Token) -> Option<T> {
        self.entries
            .lock()
            .get(&token)
            .and_then(|entry| entry.downcast_ref::<T>())
            .cloned()
    }

    /// Store `value` under `token`, replacing any previous value.
    pub fn set<T: Send + Sync + 'static>(&self, token: Token, value: T) {
        let previous = self.entries.lock().insert(token, Box::new(value));
        drop(previous);
    }

    /// Remove the value under `token`. Returns whether one was present.
    pub fn remove(&self, token: Token) -> bool {
        let removed = self.entries.lock().remove(&token);
        removed.is_some()
    }

    /// Whether a value is stored under `token`.
    pub fn contains(&self, token: Token) -> bool {
        self.entries.lock().contains_key(&token)
    }

    /// Return the cached value, or create and cache it with `init`.
    ///
    /// The cache stays locked while `init` runs, so concurrent callers for
    /// the same cache never both run it.
    pub fn get_or_try_insert_with<T, E, F>(&self, token: Token, init: F) -> Result<T, E>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Result<T, E>,
    {
        let mut entries = self.entries.lock();
        if let Some(value) = entries.get(&token).and_then(|e| e.downcast_ref::<T>()) {
            return Ok(value.clone());
        }
        let value = init()?;
        let previous = entries.insert(token, Box::new(value.clone()));
        drop(entries);
        drop(previous);
        Ok(value)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache").field("entries", &self.len()).finish()
    }
}
