/// Foreign KEM Module
///
/// The KEM primitives live in a separately built computation module that is
/// reached only through a narrow, C-style function table: an allocator, a
/// deallocator, three KEM entry points taking pointers into the module's
/// linear memory, and a byte view of that memory.
///
/// - [`ForeignModule`]: the function-table contract
/// - [`native`]: in-crate reference module backed by `ml-kem`
/// - [`loader`]: payload sources and runtimes that instantiate modules
/// - [`lifecycle`]: the retrying, readiness-gated [`ModuleManager`]

pub mod lifecycle;
pub mod loader;
pub mod native;

#[cfg(test)]
pub(crate) mod testing;

use crate::config::KemParams;
use crate::error::{FileCryptError, Result};
use crate::marshal::AllocationStats;
use std::sync::{Arc, Mutex, MutexGuard};

pub use lifecycle::{ModuleManager, ModuleState};
pub use loader::{DefaultModuleSource, FsModuleSource, ModuleRuntime, ModuleSource, NativeRuntime, ReadyNotifier};
pub use native::{LinearMemory, ModuleManifest, NativeKemModule};

/// Pointer into a module's linear memory. Zero is null.
pub type ForeignPtr = u32;

/// Export names every module must provide
pub const EXPORT_MALLOC: &str = "malloc_wrapper";
pub const EXPORT_FREE: &str = "free_wrapper";
pub const EXPORT_KEYPAIR: &str = "crypto_kem_keypair";
pub const EXPORT_ENC: &str = "crypto_kem_enc";
pub const EXPORT_DEC: &str = "crypto_kem_dec";

pub const REQUIRED_EXPORTS: [&str; 5] = [
    EXPORT_MALLOC,
    EXPORT_FREE,
    EXPORT_KEYPAIR,
    EXPORT_ENC,
    EXPORT_DEC,
];

/// Function table of a loaded KEM module.
///
/// Mirrors the raw exports one to one: every pointer argument refers to the
/// module's own linear memory and every status code is `0` on success.
/// Callers never touch these directly; `marshal::MarshalScope` owns the
/// allocate/copy/invoke/free sequence.
pub trait ForeignModule: Send {
    fn has_export(&self, name: &str) -> bool;

    /// Allocate `size` bytes, returning `0` on exhaustion.
    fn malloc(&mut self, size: usize) -> ForeignPtr;

    fn free(&mut self, ptr: ForeignPtr);

    fn crypto_kem_keypair(&mut self, pk: ForeignPtr, sk: ForeignPtr) -> i32;

    fn crypto_kem_enc(&mut self, ct: ForeignPtr, ss: ForeignPtr, pk: ForeignPtr) -> i32;

    fn crypto_kem_dec(&mut self, ss: ForeignPtr, ct: ForeignPtr, sk: ForeignPtr) -> i32;

    /// Current view of linear memory. May move after `malloc` grows it.
    fn memory(&self) -> &[u8];

    fn memory_mut(&mut self) -> &mut [u8];
}

/// Names of required exports the module does not provide
pub fn missing_exports(module: &dyn ForeignModule) -> Vec<&'static str> {
    REQUIRED_EXPORTS
        .iter()
        .copied()
        .filter(|name| !module.has_export(name))
        .collect()
}

/// Shared handle to one ready module instance.
///
/// The module sits behind a mutex: its allocator is a single heap with no
/// concurrency control, so each marshaling sequence runs under one guard.
#[derive(Clone)]
pub struct ModuleHandle {
    module: Arc<Mutex<Box<dyn ForeignModule>>>,
    params: KemParams,
    stats: Arc<AllocationStats>,
}

impl ModuleHandle {
    pub fn new(module: Box<dyn ForeignModule>, params: KemParams) -> Self {
        Self {
            module: Arc::new(Mutex::new(module)),
            params,
            stats: Arc::new(AllocationStats::default()),
        }
    }

    pub fn params(&self) -> &KemParams {
        &self.params
    }

    /// Allocation counters for every buffer marshaled through this handle
    pub fn stats(&self) -> &AllocationStats {
        &self.stats
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Box<dyn ForeignModule>>> {
        self.module
            .lock()
            .map_err(|_| FileCryptError::ModuleNotReady("module lock poisoned".into()))
    }
}

impl std::fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("level", &self.params.level)
            .field("live_bytes", &self.stats.live_bytes())
            .finish()
    }
}
