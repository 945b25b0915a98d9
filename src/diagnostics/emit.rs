//! Diagnostic emission backend.
//!
//! Diagnostics go to the `log` facade at the level matching their kind.
//! A thread-local sink can additionally capture them (used by tests and by
//! callers that surface diagnostics in their own UI).

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::kind::{Diagnostic, DiagnosticKind};
use super::strict::{is_critical, should_panic, should_panic_on_warning};
use crate::gpu::NativeError;
use crate::sync::mutex::Mutex;

static DIAGNOSTICS_SUPPRESSED: AtomicBool = AtomicBool::new(false);

static VERBOSE_DIAGNOSTICS: AtomicBool = AtomicBool::new(false);

thread_local! {
    static THREAD_SINK: RefCell<Option<Arc<dyn DiagnosticSink>>> = RefCell::new(None);
}

/// Suppress all diagnostic log output. Sinks still receive diagnostics.
pub fn suppress_diagnostics(suppress: bool) {
    DIAGNOSTICS_SUPPRESSED.store(suppress, Ordering::Relaxed);
}

/// Log note and help lines even in release builds.
pub fn set_verbose(verbose: bool) {
    VERBOSE_DIAGNOSTICS.store(verbose, Ordering::Relaxed);
}

/// Check if diagnostics are suppressed.
pub fn is_suppressed() -> bool {
    DIAGNOSTICS_SUPPRESSED.load(Ordering::Relaxed)
}

fn verbose() -> bool {
    cfg!(any(debug_assertions, feature = "diagnostics")) || VERBOSE_DIAGNOSTICS.load(Ordering::Relaxed)
}

/// Emit a diagnostic.
pub fn emit(diag: &Diagnostic) {
    dispatch(diag, None);
    check_strict(diag, None);
}

/// Emit a diagnostic with additional runtime context.
pub fn emit_with_context(diag: &Diagnostic, context: &str) {
    dispatch(diag, Some(context));
    check_strict(diag, Some(context));
}

/// Emit a diagnostic for a failed native call.
///
/// The native call name and code become the context. Codes marked critical
/// with [`set_critical_codes`](super::strict::set_critical_codes) panic.
pub fn emit_native(diag: &Diagnostic, err: &NativeError) {
    let context = err.to_string();
    dispatch(diag, Some(&context));
    if is_critical(err.code) {
        panic!(
            "[framepool][{}] {}\nContext: {}\nNative code {} is marked critical.",
            diag.code, diag.message, context, err.code
        );
    }
    check_strict(diag, Some(&context));
}

fn dispatch(diag: &Diagnostic, context: Option<&str>) {
    THREAD_SINK.with(|sink| {
        if let Some(sink) = sink.borrow().as_ref() {
            sink.emit(diag);
        }
    });

    if is_suppressed() {
        return;
    }

    let level = diag.kind.level();
    match context {
        Some(ctx) => log::log!(level, "[{}] {}: {}", diag.code, diag.message, ctx),
        None => log::log!(level, "[{}] {}", diag.code, diag.message),
    }

    if verbose() {
        if let Some(note) = diag.note {
            log::log!(level, "  note: {}", note);
        }
        if let Some(help) = diag.help {
            log::log!(level, "  help: {}", help);
        }
    }
}

fn check_strict(diag: &Diagnostic, context: Option<&str>) {
    let fatal = match diag.kind {
        DiagnosticKind::Error => should_panic(),
        DiagnosticKind::Warning => should_panic_on_warning(),
        DiagnosticKind::Note | DiagnosticKind::Help => false,
    };
    if fatal {
        panic!(
            "[framepool][{}] {}\nContext: {}\nStrict mode enabled - diagnostics are fatal.",
            diag.code,
            diag.message,
            context.unwrap_or("none")
        );
    }
}

/// A diagnostic sink trait for custom output.
pub trait DiagnosticSink: Send + Sync {
    /// Handle a diagnostic.
    fn emit(&self, diag: &Diagnostic);
}

/// Route diagnostics raised on this thread to `sink` until the guard drops.
pub fn install_thread_sink(sink: Arc<dyn DiagnosticSink>) -> ThreadSinkGuard {
    let previous = THREAD_SINK.with(|slot| slot.borrow_mut().replace(sink));
    ThreadSinkGuard { previous }
}

/// Restores the previous thread sink on drop.
pub struct ThreadSinkGuard {
    previous: Option<Arc<dyn DiagnosticSink>>,
}

impl Drop for ThreadSinkGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        THREAD_SINK.with(|slot| *slot.borrow_mut() = previous);
    }
}

/// A simple sink that collects diagnostics.
#[derive(Default)]
pub struct CollectingSink {
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl CollectingSink {
    /// Create a new collecting sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all collected diagnostics.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().clone()
    }

    /// Codes of all collected diagnostics, in order.
    pub fn codes(&self) -> Vec<&'static str> {
        self.diagnostics.lock().iter().map(|d| d.code).collect()
    }

    /// Clear collected diagnostics.
    pub fn clear(&self) {
        self.diagnostics.lock().clear();
    }

    /// Check if any errors were collected.
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .lock()
            .iter()
            .any(|d| d.kind == DiagnosticKind::Error)
    }
}

impl DiagnosticSink for CollectingSink {
    fn emit(&self, diag: &Diagnostic) {
        self.diagnostics.lock().push(diag.clone());
    }
}
