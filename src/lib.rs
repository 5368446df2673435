// Crate-level lint configuration: stylistic lints only. Security-relevant
// lints (unsafe, unchecked arithmetic) remain enforced.
#![allow(
    clippy::empty_line_after_doc_comments,
    clippy::doc_lazy_continuation,
    clippy::len_without_is_empty,
    clippy::new_without_default
)]

//! Shield FileCrypt: post-quantum hybrid file encryption.
//!
//! Files are sealed with ChaCha20-Poly1305 under a key transported by
//! ML-KEM. The KEM runs inside a separately loaded module reached through a
//! narrow foreign function table; this crate owns that module's lifecycle,
//! marshals every buffer across the boundary, and layers the hybrid scheme
//! on top.
//!
//! ```text
//! file ─▶ engine ─▶ kem ─▶ marshal ─▶ module (lifecycle ▸ loader ▸ native)
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod file;
pub mod kem;
pub mod marshal;
pub mod module;

// ── Re-export main types ────────────────────────────────────────────────────
pub use config::{EngineConfig, KemParams, SecurityLevel};
pub use engine::{EncryptedContainer, EncryptedFile, EncryptedKeyBlob, HybridEngine};
pub use error::{FileCryptError, Result};
pub use file::{decrypt_file, encrypt_file, EncryptedArtifacts};
pub use kem::{EncapsulationResult, KemFacade, KeyPair, SharedSecret};
pub use marshal::AllocationStats;
pub use module::{ForeignModule, ModuleHandle, ModuleManager, ModuleState};

// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library version
pub fn get_version() -> &'static str {
    VERSION
}
