//! Synchronization primitives.
//!
//! Provides thin wrappers over std or parking_lot mutexes and condition
//! variables, plus relaxed atomic counters for statistics.

pub(crate) mod atomics;
pub(crate) mod mutex;
