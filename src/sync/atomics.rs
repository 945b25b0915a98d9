//! Atomic helpers for counters and monotonic fence values.

use std::sync::atomic::{AtomicU64, Ordering};

/// A relaxed event counter for statistics.
#[derive(Debug)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    /// Create a new counter.
    pub const fn new(initial: u64) -> Self {
        Self(AtomicU64::new(initial))
    }

    /// Increment the counter.
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for AtomicCounter {
    fn default() -> Self {
        Self::new(0)
    }
}

/// A 64-bit value that can only move forward.
///
/// Used both as a fence-value generator and as a fence's requested target.
#[derive(Debug)]
pub struct MonotonicU64(AtomicU64);

impl MonotonicU64 {
    /// Create a new value.
    pub const fn new(initial: u64) -> Self {
        Self(AtomicU64::new(initial))
    }

    /// Advance by one and return the new value.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Raise to `value` if it is larger. Returns `true` if the value changed.
    pub fn raise(&self, value: u64) -> bool {
        self.0.fetch_max(value, Ordering::AcqRel) < value
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for MonotonicU64 {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_next_strictly_increases() {
        let value = MonotonicU64::new(0);
        assert_eq!(value.next(), 1);
        assert_eq!(value.next(), 2);
        assert_eq!(value.get(), 2);
    }

    #[test]
    fn test_monotonic_raise_ignores_stale() {
        let value = MonotonicU64::new(0);
        assert!(value.raise(5));
        assert!(!value.raise(3));
        assert!(!value.raise(5));
        assert_eq!(value.get(), 5);
    }
}
