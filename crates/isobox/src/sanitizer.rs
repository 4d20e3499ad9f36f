//! Host-path scrubbing for guest-origin errors.
//!
//! Stack frames from the guest engine can leak host filesystem layout.
//! Before an error leaves the sandbox, absolute host paths are rewritten to
//! sandbox-relative markers, keeping error class names and line/column
//! numbers intact.

use errors::{
    ErrorCode,
    SandboxError,
};
use regex::Regex;
use serde::Serialize;

use crate::guest::{
    GuestError,
    GuestErrorKind,
};

/// A guest error after scrubbing: stable code, safe message, optional
/// path-scrubbed stack.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SanitizedError {
    pub code: ErrorCode,
    pub message: String,
    pub stack: Option<String>,
}

impl SanitizedError {
    pub fn to_sandbox_error(&self) -> SandboxError {
        SandboxError::new(self.code, self.message.clone())
    }
}

/// Stateless, idempotent path scrubber. The default pattern set recognises
/// unix and windows absolute paths, with or without `:line:col` suffixes;
/// replacement markers never re-match.
pub struct ErrorSanitizer {
    rules: Vec<(Regex, &'static str)>,
}

impl ErrorSanitizer {
    pub fn new(rules: Vec<(Regex, &'static str)>) -> Self {
        Self { rules }
    }

    pub fn sanitize_message(&self, message: &str) -> String {
        let mut out = message.to_string();
        for (pattern, replacement) in &self.rules {
            out = pattern.replace_all(&out, *replacement).into_owned();
        }
        out
    }

    pub fn sanitize_guest_error(&self, error: &GuestError) -> SanitizedError {
        let code = match error.kind {
            GuestErrorKind::Compile => ErrorCode::GuestCompileError,
            GuestErrorKind::Runtime => ErrorCode::GuestRuntimeError,
            GuestErrorKind::OutOfMemory => ErrorCode::MemoryLimit,
            GuestErrorKind::Terminated => ErrorCode::GuestRuntimeError,
            GuestErrorKind::NotTransferable => ErrorCode::NotTransferable,
        };
        SanitizedError {
            code,
            message: self.sanitize_message(&error.message),
            stack: error.stack.as_deref().map(|s| self.sanitize_message(s)),
        }
    }

    /// Sanitise whatever came out of a guest invocation. Typed guest errors
    /// keep their kind; structured sandbox errors keep their code; anything
    /// else is reported as a guest runtime error.
    pub fn sanitize_anyhow(&self, error: &anyhow::Error) -> SanitizedError {
        if let Some(guest) = error
            .chain()
            .filter_map(|cause| cause.downcast_ref::<GuestError>())
            .next()
        {
            return self.sanitize_guest_error(guest);
        }
        if let Some(sandbox) = error
            .chain()
            .filter_map(|cause| cause.downcast_ref::<SandboxError>())
            .next()
        {
            return SanitizedError {
                code: sandbox.code,
                message: self.sanitize_message(&sandbox.message),
                stack: None,
            };
        }
        SanitizedError {
            code: ErrorCode::GuestRuntimeError,
            message: self.sanitize_message(&format!("{error:#}")),
            stack: None,
        }
    }

    /// Re-sanitising is the identity.
    pub fn sanitize_sanitized(&self, error: &SanitizedError) -> SanitizedError {
        SanitizedError {
            code: error.code,
            message: self.sanitize_message(&error.message),
            stack: error.stack.as_deref().map(|s| self.sanitize_message(s)),
        }
    }
}

impl Default for ErrorSanitizer {
    fn default() -> Self {
        // Ordering matters: located paths first, so the bare-path rule never
        // eats the `:line:col` suffix.
        let rules = vec![
            (
                Regex::new(r"(?:[A-Za-z]:)?(?:[/\\][\w.\-]+)+:(\d+):(\d+)")
                    .expect("static regex"),
                "[sandbox:$1:$2]",
            ),
            // Three or more segments: deep enough to be a host path rather
            // than a path inside the virtual filesystem.
            (
                Regex::new(r"(?:[A-Za-z]:)?(?:[/\\][\w.\-]+){3,}").expect("static regex"),
                "[sandbox]",
            ),
        ];
        Self::new(rules)
    }
}
