//! Diagnostics.
//!
//! Every native failure is reported here before it is returned to the
//! caller, with a stable code so logs can be grepped and sinks can react.
//! Expected conditions (a flushing pool, an exhausted non-blocking acquire)
//! are not diagnostics and never show up here.
//!
//! ## Diagnostic Codes
//!
//! | Code  | Meaning                        |
//! |-------|--------------------------------|
//! | FP0xx | Device and context issues      |
//! | FP1xx | Fence issues                   |
//! | FP2xx | Memory and transfer issues     |
//! | FP3xx | Pool configuration issues      |
//! | FP4xx | Interop issues                 |
//! | FP9xx | Internal errors                |
//!
//! ## Usage
//!
//! ```rust,ignore
//! use framepool::{fp_diagnostic, fp_emit};
//!
//! fp_diagnostic!(
//!     Warning,
//!     code = "FP206",
//!     message = "copy fell back to host staging"
//! );
//!
//! fp_emit!(FP206);
//! ```

pub mod emit;
pub mod kind;
pub mod macros;
pub mod strict;

pub use emit::{
    emit, emit_native, emit_with_context, install_thread_sink, set_verbose, suppress_diagnostics,
    CollectingSink, DiagnosticSink, ThreadSinkGuard,
};
pub use kind::{Diagnostic, DiagnosticKind};
pub use strict::{
    init_from_env, set_critical_codes, set_strict_mode, strict_mode, StrictMode, StrictModeGuard,
};

pub use kind::{
    FP001, FP002, FP003, FP004, FP101, FP102, FP103, FP104, FP201, FP202, FP203, FP204, FP205, FP206,
    FP207, FP301, FP302, FP401, FP402, FP403, FP404, FP901,
};
