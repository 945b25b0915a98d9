//! Diagnostic macros.

/// Emit a runtime diagnostic.
///
/// # Example
///
/// ```rust,ignore
/// fp_diagnostic!(
///     Warning,
///     code = "FP206",
///     message = "copy fell back to host staging",
///     note = "peer access is disabled between the two devices"
/// );
/// ```
#[macro_export]
macro_rules! fp_diagnostic {
    (
        $kind:ident,
        code = $code:expr,
        message = $msg:expr
        $(, note = $note:expr)?
        $(, help = $help:expr)?
    ) => {{
        let diag = $crate::diagnostics::Diagnostic {
            kind: $crate::diagnostics::DiagnosticKind::$kind,
            code: $code,
            message: $msg,
            note: None $(.or(Some($note)))?,
            help: None $(.or(Some($help)))?,
        };
        $crate::diagnostics::emit::emit(&diag);
    }};
}

/// Emit a predefined diagnostic by code, optionally with context.
///
/// # Example
///
/// ```rust,ignore
/// fp_emit!(FP206);
/// fp_emit!(FP301, format!("{:?} is not supported", format));
/// ```
#[macro_export]
macro_rules! fp_emit {
    ($code:ident) => {{
        $crate::diagnostics::emit::emit(&$crate::diagnostics::$code);
    }};
    ($code:ident, $ctx:expr) => {{
        $crate::diagnostics::emit::emit_with_context(&$crate::diagnostics::$code, &$ctx);
    }};
}

/// Emit a predefined diagnostic for a failed native call.
///
/// Evaluates to the error converted into a [`FrameError`](crate::FrameError)
/// so call sites can write `.map_err(|e| fp_native!(FP201, e))?`.
#[macro_export]
macro_rules! fp_native {
    ($code:ident, $err:expr) => {{
        let err: $crate::gpu::NativeError = $err;
        $crate::diagnostics::emit::emit_native(&$crate::diagnostics::$code, &err);
        $crate::FrameError::Device(err)
    }};
}

#[cfg(test)]
mod tests {
    use crate::diagnostics::emit::install_thread_sink;
    use crate::diagnostics::CollectingSink;
    use crate::gpu::NativeError;
    use crate::FrameError;
    use std::sync::Arc;

    #[test]
    fn test_macros_reach_sink() {
        let sink = Arc::new(CollectingSink::new());
        let _guard = install_thread_sink(sink.clone());

        fp_diagnostic!(Warning, code = "FP999", message = "custom", help = "none");
        fp_emit!(FP206);
        fp_emit!(FP301, String::from("NV12 1x1"));
        let err = fp_native!(FP201, NativeError::new("create_resource", 2, "oom"));

        assert_eq!(sink.codes(), vec!["FP999", "FP206", "FP301", "FP201"]);
        assert_eq!(err, FrameError::Device(NativeError::new("create_resource", 2, "oom")));
    }
}
