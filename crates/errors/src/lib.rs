//! Structured errors for the sandbox runtime.
//!
//! Every user-visible failure carries a stable [`ErrorCode`] plus a sanitised
//! message. Components attach a [`SandboxError`] to their `anyhow` chains and
//! callers read the code back out with [`SandboxErrorAnyhowExt`].

use serde::{
    Deserialize,
    Serialize,
};

/// Stable machine-readable error taxonomy.
///
/// Codes are part of the public API: hosts dispatch on them, so renaming a
/// variant is a breaking change.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    InvalidConfig,
    InvalidInput,
    SandboxDisposed,
    PoolDisposed,
    PoolExhausted,
    AlreadyTracked,
    FileNotFound,
    IsDirectory,
    NotADirectory,
    DirectoryNotEmpty,
    QuotaExceeded,
    ModuleNotFound,
    ModuleForbidden,
    CircularDependency,
    Timeout,
    InfiniteLoop,
    CpuLimit,
    MemoryLimit,
    GuestCompileError,
    GuestRuntimeError,
    ContextSetupFailed,
    QueueCleared,
    NotTransferable,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidConfig => "InvalidConfig",
            Self::InvalidInput => "InvalidInput",
            Self::SandboxDisposed => "SandboxDisposed",
            Self::PoolDisposed => "PoolDisposed",
            Self::PoolExhausted => "PoolExhausted",
            Self::AlreadyTracked => "AlreadyTracked",
            Self::FileNotFound => "FileNotFound",
            Self::IsDirectory => "IsDirectory",
            Self::NotADirectory => "NotADirectory",
            Self::DirectoryNotEmpty => "DirectoryNotEmpty",
            Self::QuotaExceeded => "QuotaExceeded",
            Self::ModuleNotFound => "ModuleNotFound",
            Self::ModuleForbidden => "ModuleForbidden",
            Self::CircularDependency => "CircularDependency",
            Self::Timeout => "Timeout",
            Self::InfiniteLoop => "InfiniteLoop",
            Self::CpuLimit => "CpuLimit",
            Self::MemoryLimit => "MemoryLimit",
            Self::GuestCompileError => "GuestCompileError",
            Self::GuestRuntimeError => "GuestRuntimeError",
            Self::ContextSetupFailed => "ContextSetupFailed",
            Self::QueueCleared => "QueueCleared",
            Self::NotTransferable => "NotTransferable",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sandbox failure: stable code plus a message safe to show to tenants.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct SandboxError {
    pub code: ErrorCode,
    pub message: String,
}

impl SandboxError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfig, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn sandbox_disposed() -> Self {
        Self::new(ErrorCode::SandboxDisposed, "Sandbox has been disposed")
    }

    pub fn pool_disposed() -> Self {
        Self::new(ErrorCode::PoolDisposed, "Isolate pool has been disposed")
    }

    pub fn pool_exhausted(max: usize) -> Self {
        Self::new(
            ErrorCode::PoolExhausted,
            format!("Isolate pool exhausted (max {max})"),
        )
    }

    pub fn already_tracked(id: &str) -> Self {
        Self::new(
            ErrorCode::AlreadyTracked,
            format!("Isolate {id} is already tracked"),
        )
    }

    pub fn file_not_found(path: &str) -> Self {
        Self::new(ErrorCode::FileNotFound, format!("No such file: {path}"))
    }

    pub fn is_directory(path: &str) -> Self {
        Self::new(ErrorCode::IsDirectory, format!("{path} is a directory"))
    }

    pub fn not_a_directory(path: &str) -> Self {
        Self::new(
            ErrorCode::NotADirectory,
            format!("{path} is not a directory"),
        )
    }

    pub fn directory_not_empty(path: &str) -> Self {
        Self::new(
            ErrorCode::DirectoryNotEmpty,
            format!("Directory not empty: {path}"),
        )
    }

    pub fn quota_exceeded(requested: u64, limit: u64) -> Self {
        Self::new(
            ErrorCode::QuotaExceeded,
            format!("Filesystem quota exceeded: {requested} bytes requested, limit {limit}"),
        )
    }

    pub fn module_not_found(request: &str) -> Self {
        Self::new(
            ErrorCode::ModuleNotFound,
            format!("Module not found: {request}"),
        )
    }

    pub fn module_forbidden(request: &str) -> Self {
        Self::new(
            ErrorCode::ModuleForbidden,
            format!("Module not allow-listed: {request}"),
        )
    }

    pub fn timeout(elapsed_ms: u128, limit_ms: u128) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!("Execution timed out after {elapsed_ms}ms (limit {limit_ms}ms)"),
        )
    }

    pub fn infinite_loop(cpu_ratio: f64) -> Self {
        Self::new(
            ErrorCode::InfiniteLoop,
            format!("Infinite loop detected (cpu/wall ratio {cpu_ratio:.2})"),
        )
    }

    pub fn cpu_limit(cpu_ms: u128, limit_ms: u128) -> Self {
        Self::new(
            ErrorCode::CpuLimit,
            format!("CPU limit exceeded: {cpu_ms}ms used, limit {limit_ms}ms"),
        )
    }

    pub fn queue_cleared() -> Self {
        Self::new(ErrorCode::QueueCleared, "Queue was cleared")
    }

    pub fn context_setup_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ContextSetupFailed, message)
    }

    pub fn not_transferable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotTransferable, message)
    }
}

/// Read a [`SandboxError`] code back out of an `anyhow` chain.
pub trait SandboxErrorAnyhowExt {
    fn code(&self) -> Option<ErrorCode>;

    fn is_code(&self, code: ErrorCode) -> bool {
        self.code() == Some(code)
    }
}

impl SandboxErrorAnyhowExt for anyhow::Error {
    fn code(&self) -> Option<ErrorCode> {
        self.chain()
            .filter_map(|cause| cause.downcast_ref::<SandboxError>())
            .map(|e| e.code)
            .next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_survives_anyhow_chain() {
        let err: anyhow::Error = SandboxError::file_not_found("/a/b").into();
        let err = err.context("while reading module source");
        assert_eq!(err.code(), Some(ErrorCode::FileNotFound));
        assert!(err.is_code(ErrorCode::FileNotFound));
        assert!(!err.is_code(ErrorCode::IsDirectory));
    }

    #[test]
    fn test_plain_anyhow_has_no_code() {
        let err = anyhow::anyhow!("boring");
        assert_eq!(err.code(), None);
    }

    #[test]
    fn test_display_includes_code_and_message() {
        let err = SandboxError::invalid_input("Code cannot be empty");
        assert_eq!(err.to_string(), "InvalidInput: Code cannot be empty");
    }
}
