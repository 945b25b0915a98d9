//! Configuration and statistics types shared by devices and pools.

pub mod config;
pub mod stats;
