//! Strict mode handling for diagnostics.
//!
//! Allows configuration of how diagnostics are treated:
//! - Warn: Just emit the diagnostic
//! - Panic: Emit and then panic (useful for CI)
//!
//! Independently, a list of native error codes can be marked critical. A
//! native failure with one of those codes panics regardless of strict mode.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::RwLock;

/// Strict mode behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StrictMode {
    /// Just warn, don't panic.
    Warn = 0,
    /// Panic on errors.
    PanicOnError = 1,
    /// Panic on errors and warnings.
    PanicOnWarning = 2,
}

impl From<u8> for StrictMode {
    fn from(val: u8) -> Self {
        match val {
            1 => StrictMode::PanicOnError,
            2 => StrictMode::PanicOnWarning,
            _ => StrictMode::Warn,
        }
    }
}

static STRICT_MODE: AtomicU8 = AtomicU8::new(0);

static CRITICAL_CODES: RwLock<Vec<i32>> = RwLock::new(Vec::new());

/// Set the strict mode.
pub fn set_strict_mode(mode: StrictMode) {
    STRICT_MODE.store(mode as u8, Ordering::Relaxed);
}

/// Get the current strict mode.
pub fn strict_mode() -> StrictMode {
    StrictMode::from(STRICT_MODE.load(Ordering::Relaxed))
}

/// Check if we should panic on errors.
pub fn should_panic() -> bool {
    matches!(strict_mode(), StrictMode::PanicOnError | StrictMode::PanicOnWarning)
}

/// Check if we should panic for warnings.
pub fn should_panic_on_warning() -> bool {
    matches!(strict_mode(), StrictMode::PanicOnWarning)
}

/// Replace the set of native codes that abort the process when seen.
pub fn set_critical_codes(codes: &[i32]) {
    let mut guard = CRITICAL_CODES.write().unwrap_or_else(|e| e.into_inner());
    guard.clear();
    guard.extend_from_slice(codes);
}

/// Whether `code` was marked critical.
pub fn is_critical(code: i32) -> bool {
    CRITICAL_CODES
        .read()
        .map(|codes| codes.contains(&code))
        .unwrap_or(false)
}

/// RAII guard for temporarily setting strict mode.
pub struct StrictModeGuard {
    previous: StrictMode,
}

impl StrictModeGuard {
    /// Create a new guard that sets strict mode.
    pub fn new(mode: StrictMode) -> Self {
        let previous = strict_mode();
        set_strict_mode(mode);
        Self { previous }
    }

    /// Create a guard that enables panic-on-error.
    pub fn panic_on_error() -> Self {
        Self::new(StrictMode::PanicOnError)
    }
}

impl Drop for StrictModeGuard {
    fn drop(&mut self) {
        set_strict_mode(self.previous);
    }
}

/// Initialize strict mode and critical codes from the environment.
///
/// `FRAMEPOOL_STRICT`:
/// - "0" or "warn" -> Warn
/// - "1" or "error" -> PanicOnError
/// - "2" or "warning" -> PanicOnWarning
///
/// `FRAMEPOOL_CRITICAL_ERRORS`: comma separated native codes, e.g. "2,700".
/// Entries that do not parse as positive integers are skipped with a warning.
pub fn init_from_env() {
    if let Ok(val) = std::env::var("FRAMEPOOL_STRICT") {
        let mode = match val.to_lowercase().as_str() {
            "1" | "error" | "true" => StrictMode::PanicOnError,
            "2" | "warning" | "all" => StrictMode::PanicOnWarning,
            _ => StrictMode::Warn,
        };
        set_strict_mode(mode);
    }

    if let Ok(val) = std::env::var("FRAMEPOOL_CRITICAL_ERRORS") {
        set_critical_codes(&parse_codes(&val));
    }
}

fn parse_codes(list: &str) -> Vec<i32> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<i32>() {
            Ok(code) if code > 0 => Some(code),
            _ => {
                log::warn!("ignoring invalid critical error code {:?}", s);
                None
            }
        })
        .collect()
}
