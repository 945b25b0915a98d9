//! Diagnostic kinds, the diagnostic record and predefined codes.

/// The severity level of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// A native call failed or an invariant broke.
    Error,
    /// Something degraded but the operation continued.
    Warning,
    /// Additional context about another diagnostic.
    Note,
    /// Actionable suggestion to fix the issue.
    Help,
}

impl DiagnosticKind {
    /// Get the display prefix for this kind.
    pub fn prefix(&self) -> &'static str {
        match self {
            DiagnosticKind::Error => "error",
            DiagnosticKind::Warning => "warning",
            DiagnosticKind::Note => "note",
            DiagnosticKind::Help => "help",
        }
    }

    /// The log level a diagnostic of this kind is emitted at.
    pub fn level(&self) -> log::Level {
        match self {
            DiagnosticKind::Error => log::Level::Error,
            DiagnosticKind::Warning => log::Level::Warn,
            DiagnosticKind::Note | DiagnosticKind::Help => log::Level::Info,
        }
    }
}

/// A diagnostic message with code, message, and optional context.
///
/// Diagnostic codes follow the pattern:
/// - `FP0xx` - Device and context issues
/// - `FP1xx` - Fence issues
/// - `FP2xx` - Memory and transfer issues
/// - `FP3xx` - Pool issues
/// - `FP4xx` - Interop issues
/// - `FP9xx` - Internal errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Severity level.
    pub kind: DiagnosticKind,
    /// Diagnostic code (e.g., "FP001").
    pub code: &'static str,
    /// Primary message.
    pub message: &'static str,
    /// Optional additional context.
    pub note: Option<&'static str>,
    /// Optional fix suggestion.
    pub help: Option<&'static str>,
}

impl Diagnostic {
    /// Create a new error diagnostic.
    pub const fn error(code: &'static str, message: &'static str) -> Self {
        Self {
            kind: DiagnosticKind::Error,
            code,
            message,
            note: None,
            help: None,
        }
    }

    /// Create a new warning diagnostic.
    pub const fn warning(code: &'static str, message: &'static str) -> Self {
        Self {
            kind: DiagnosticKind::Warning,
            code,
            message,
            note: None,
            help: None,
        }
    }

    /// Add a note to this diagnostic.
    pub const fn with_note(mut self, note: &'static str) -> Self {
        self.note = Some(note);
        self
    }

    /// Add a help message to this diagnostic.
    pub const fn with_help(mut self, help: &'static str) -> Self {
        self.help = Some(help);
        self
    }
}

// =============================================================================
// FP0xx - Device and context
// =============================================================================

/// FP001: Making the device context current failed.
pub const FP001: Diagnostic = Diagnostic::error(
    "FP001",
    "failed to push device context"
).with_note("the operation that needed the context was abandoned");

/// FP002: Restoring the previous context failed.
pub const FP002: Diagnostic = Diagnostic::error(
    "FP002",
    "failed to pop device context"
).with_note("the context stack of the calling thread may be unbalanced");

/// FP003: Peer access between two devices could not be enabled.
pub const FP003: Diagnostic = Diagnostic::warning(
    "FP003",
    "peer access could not be enabled"
).with_note("cross-device copies between these devices use host staging")
 .with_help("check DeviceCaps::PEER_ACCESS on both adapters");

/// FP004: Device construction failed.
pub const FP004: Diagnostic = Diagnostic::error(
    "FP004",
    "failed to open device"
);

// =============================================================================
// FP1xx - Fences
// =============================================================================

/// FP101: Querying a fence's completed value failed.
pub const FP101: Diagnostic = Diagnostic::error(
    "FP101",
    "failed to query fence completion"
).with_note("GPU memory guarded by this fence must not be read");

/// FP102: Arming or waiting on a fence failed.
pub const FP102: Diagnostic = Diagnostic::error(
    "FP102",
    "failed to wait for fence"
).with_note("GPU memory guarded by this fence must not be read");

/// FP103: Enqueueing a fence signal failed.
pub const FP103: Diagnostic = Diagnostic::error(
    "FP103",
    "failed to signal fence"
);

/// FP104: Creating a native fence failed.
pub const FP104: Diagnostic = Diagnostic::error(
    "FP104",
    "failed to create fence"
);

// =============================================================================
// FP2xx - Memory and transfers
// =============================================================================

/// FP201: Device resource allocation failed.
pub const FP201: Diagnostic = Diagnostic::error(
    "FP201",
    "failed to allocate device memory"
);

/// FP202: Staging allocation or mapping failed.
pub const FP202: Diagnostic = Diagnostic::error(
    "FP202",
    "failed to prepare staging memory"
);

/// FP203: Staging to device upload failed.
pub const FP203: Diagnostic = Diagnostic::error(
    "FP203",
    "failed to upload staging memory to device"
).with_note("the memory keeps its pending-upload state");

/// FP204: Device to staging download failed.
pub const FP204: Diagnostic = Diagnostic::error(
    "FP204",
    "failed to download device memory to staging"
).with_note("the memory keeps its pending-download state");

/// FP205: Device copy failed.
pub const FP205: Diagnostic = Diagnostic::error(
    "FP205",
    "failed to copy between device memories"
);

/// FP206: A copy fell back to the host path.
pub const FP206: Diagnostic = Diagnostic::warning(
    "FP206",
    "copy fell back to host staging"
).with_note("the data is correct but crossed the host twice");

/// FP207: Freeing a native resource failed.
pub const FP207: Diagnostic = Diagnostic::error(
    "FP207",
    "failed to release native resource"
);

// =============================================================================
// FP3xx - Pools
// =============================================================================

/// FP301: Pool configured with a shape the device cannot serve.
pub const FP301: Diagnostic = Diagnostic::warning(
    "FP301",
    "pool shape unsupported by device"
).with_help("check Device::supports_format and the device limits before configuring");

/// FP302: Pool reconfigured while in use.
pub const FP302: Diagnostic = Diagnostic::warning(
    "FP302",
    "pool configuration rejected while active"
).with_help("call set_active(false) and release every memory first");

// =============================================================================
// FP4xx - Interop
// =============================================================================

/// FP401: Foreign resource registration is unavailable.
pub const FP401: Diagnostic = Diagnostic::warning(
    "FP401",
    "foreign resource registration unavailable"
).with_note("the copy continues through host memory");

/// FP402: Mapping or unmapping a registered resource failed.
pub const FP402: Diagnostic = Diagnostic::error(
    "FP402",
    "failed to map foreign resource"
);

/// FP403: The foreign context thread is gone.
pub const FP403: Diagnostic = Diagnostic::error(
    "FP403",
    "foreign context thread is not running"
);

/// FP404: Dropping a foreign registration failed.
pub const FP404: Diagnostic = Diagnostic::error(
    "FP404",
    "failed to unregister foreign resource"
);

// =============================================================================
// FP9xx - Internal
// =============================================================================

/// FP901: Internal invariant violated.
pub const FP901: Diagnostic = Diagnostic::error(
    "FP901",
    "internal invariant violated"
).with_help("this is a framepool bug, please report it with the log above");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predefined_kinds() {
        assert_eq!(FP001.kind, DiagnosticKind::Error);
        assert_eq!(FP206.kind, DiagnosticKind::Warning);
        assert_eq!(FP301.kind.level(), log::Level::Warn);
        assert!(FP003.help.is_some());
    }
}
