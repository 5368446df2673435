/// Error taxonomy for the file encryption engine
///
/// Every layer (module lifecycle, marshaling, KEM primitives, AEAD protocol)
/// reports through the single `FileCryptError` enum so callers can match on
/// the kind without unwrapping nested errors.
///
/// Error values carry kinds, sizes, status codes and causes as text. They
/// never carry keys, shared secrets or plaintext.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FileCryptError {
    // ── Module lifecycle ─────────────────────────────────────
    #[error("KEM module load failed: {0}")]
    ModuleLoadError(String),
    #[error("KEM module did not report ready within {timeout_ms} ms")]
    ModuleInitTimeout { timeout_ms: u64 },
    #[error("KEM module contract violated: {0}")]
    ModuleContractError(String),
    #[error("KEM module initialization failed after {attempts} attempts: {cause}")]
    ModuleInitFailed { attempts: u32, cause: String },
    #[error("Initialization timeout after {timeout_ms} ms")]
    InitializationTimeout { timeout_ms: u64 },
    #[error("KEM module not ready: {0}")]
    ModuleNotReady(String),

    // ── Marshaling ───────────────────────────────────────────
    #[error("Foreign allocation of {requested} bytes failed")]
    AllocationError { requested: usize },
    #[error("Invalid {what} length: expected {expected}, got {actual}")]
    InvalidInputLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("Foreign memory access out of bounds at {ptr:#x} (+{len})")]
    MemoryAccessError { ptr: u32, len: usize },

    // ── KEM primitives ───────────────────────────────────────
    #[error("Key generation failed with error code: {0}")]
    KeyGenFailed(i32),
    #[error("Encapsulation failed with error code: {0}")]
    EncapsulationFailed(i32),
    #[error("Decapsulation failed with error code: {0}")]
    DecapsulationFailed(i32),

    // ── Protocol ─────────────────────────────────────────────
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Key derivation failed")]
    KeyDerivationFailed,

    // ── Configuration & I/O ──────────────────────────────────
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("I/O error on {path}: {message}")]
    Io { path: String, message: String },
}

pub type Result<T> = std::result::Result<T, FileCryptError>;

impl FileCryptError {
    /// Whether the lifecycle manager may retry initialization after this error.
    ///
    /// Only transient load failures and ready-timeouts qualify. Contract
    /// violations point at a broken build and are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FileCryptError::ModuleLoadError(_) | FileCryptError::ModuleInitTimeout { .. }
        )
    }

    pub(crate) fn io(path: &std::path::Path, err: std::io::Error) -> Self {
        FileCryptError::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }
}
