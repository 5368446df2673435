//! Scripted module, source and runtime doubles for lifecycle and marshaling tests

use super::loader::{ModuleRuntime, ModuleSource, ReadyNotifier};
use super::native::{ModuleManifest, NativeKemModule};
use super::{ForeignModule, ForeignPtr};
use crate::config::{EngineConfig, KemParams, SecurityLevel};
use crate::error::{FileCryptError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Config that resolves only the built-in module and retries quickly
pub(crate) fn builtin_config() -> EngineConfig {
    EngineConfig {
        module_locations: vec!["builtin:ml-kem".to_string()],
        retry_delay_ms: 10,
        ..EngineConfig::default()
    }
}

// ─── Module ──────────────────────────────────────────────────────────────────

/// Wraps a [`NativeKemModule`] and injects allocator and status faults
pub(crate) struct ScriptedModule {
    inner: NativeKemModule,
    mallocs: usize,
    fail_malloc_on: Option<usize>,
    bogus_pointer_on: Option<usize>,
    bogus: HashSet<ForeignPtr>,
    status_override: Option<i32>,
    frees: usize,
    primitive_calls: usize,
}

impl ScriptedModule {
    pub(crate) fn native() -> Self {
        Self::wrap(NativeKemModule::new(SecurityLevel::Level3))
    }

    pub(crate) fn wrap(inner: NativeKemModule) -> Self {
        Self {
            inner,
            mallocs: 0,
            fail_malloc_on: None,
            bogus_pointer_on: None,
            bogus: HashSet::new(),
            status_override: None,
            frees: 0,
            primitive_calls: 0,
        }
    }

    /// The n-th malloc (1-based) returns null
    pub(crate) fn fail_malloc_on(mut self, n: usize) -> Self {
        self.fail_malloc_on = Some(n);
        self
    }

    /// The n-th malloc (1-based) returns a pointer past the end of memory
    pub(crate) fn bogus_pointer_on(mut self, n: usize) -> Self {
        self.bogus_pointer_on = Some(n);
        self
    }

    /// Every entry point returns `status` without running
    pub(crate) fn with_status(mut self, status: i32) -> Self {
        self.status_override = Some(status);
        self
    }

    pub(crate) fn frees(&self) -> usize {
        self.frees
    }

    pub(crate) fn primitive_calls(&self) -> usize {
        self.primitive_calls
    }

    pub(crate) fn inner_allocated_bytes(&self) -> usize {
        self.inner.allocated_bytes()
    }

    fn invoke(&mut self, run: impl FnOnce(&mut NativeKemModule) -> i32) -> i32 {
        self.primitive_calls += 1;
        match self.status_override {
            Some(status) => status,
            None => run(&mut self.inner),
        }
    }
}

impl ForeignModule for ScriptedModule {
    fn has_export(&self, name: &str) -> bool {
        self.inner.has_export(name)
    }

    fn malloc(&mut self, size: usize) -> ForeignPtr {
        self.mallocs += 1;
        if self.fail_malloc_on == Some(self.mallocs) {
            return 0;
        }
        if self.bogus_pointer_on == Some(self.mallocs) {
            let ptr = u32::MAX - 8;
            self.bogus.insert(ptr);
            return ptr;
        }
        self.inner.malloc(size)
    }

    fn free(&mut self, ptr: ForeignPtr) {
        self.frees += 1;
        if !self.bogus.remove(&ptr) {
            self.inner.free(ptr);
        }
    }

    fn crypto_kem_keypair(&mut self, pk: ForeignPtr, sk: ForeignPtr) -> i32 {
        self.invoke(|m| m.crypto_kem_keypair(pk, sk))
    }

    fn crypto_kem_enc(&mut self, ct: ForeignPtr, ss: ForeignPtr, pk: ForeignPtr) -> i32 {
        self.invoke(|m| m.crypto_kem_enc(ct, ss, pk))
    }

    fn crypto_kem_dec(&mut self, ss: ForeignPtr, ct: ForeignPtr, sk: ForeignPtr) -> i32 {
        self.invoke(|m| m.crypto_kem_dec(ss, ct, sk))
    }

    fn memory(&self) -> &[u8] {
        self.inner.memory()
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        self.inner.memory_mut()
    }
}

// ─── Source ──────────────────────────────────────────────────────────────────

/// In-memory source: serves payloads by location, optionally failing the
/// first N fetches, and records every location requested
pub(crate) struct ScriptedSource {
    payloads: HashMap<String, Vec<u8>>,
    failures_left: AtomicU32,
    requested: Mutex<Vec<String>>,
}

impl ScriptedSource {
    pub(crate) fn empty() -> Self {
        Self {
            payloads: HashMap::new(),
            failures_left: AtomicU32::new(0),
            requested: Mutex::new(Vec::new()),
        }
    }

    /// Serves the built-in manifest for `level` at `builtin:ml-kem`
    pub(crate) fn builtin(level: SecurityLevel) -> Self {
        Self::empty().serve(
            "builtin:ml-kem",
            ModuleManifest::builtin(level).to_bytes().unwrap(),
        )
    }

    pub(crate) fn serve(mut self, location: &str, payload: Vec<u8>) -> Self {
        self.payloads.insert(location.to_string(), payload);
        self
    }

    pub(crate) fn failing_first(self, n: u32) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub(crate) fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModuleSource for ScriptedSource {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>> {
        self.requested.lock().unwrap().push(location.to_string());
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(FileCryptError::ModuleLoadError("scripted network failure".into()));
        }
        self.payloads
            .get(location)
            .cloned()
            .ok_or_else(|| FileCryptError::ModuleLoadError(format!("{}: not found", location)))
    }
}

// ─── Runtime ─────────────────────────────────────────────────────────────────

/// Runtime that builds native modules but can withhold the ready callback or
/// drop exports
pub(crate) struct ScriptedRuntime {
    stall_first: u32,
    exports: Option<Vec<&'static str>>,
    status: Option<i32>,
    instantiations: AtomicU32,
    stalled: Mutex<Vec<ReadyNotifier>>,
}

impl ScriptedRuntime {
    pub(crate) fn new() -> Self {
        Self {
            stall_first: 0,
            exports: None,
            status: None,
            instantiations: AtomicU32::new(0),
            stalled: Mutex::new(Vec::new()),
        }
    }

    /// The first `n` instances never report ready
    pub(crate) fn stalling_first(mut self, n: u32) -> Self {
        self.stall_first = n;
        self
    }

    /// Instances export only `exports`
    pub(crate) fn with_exports(mut self, exports: &[&'static str]) -> Self {
        self.exports = Some(exports.to_vec());
        self
    }

    /// Instances answer every entry point with `status`
    pub(crate) fn with_status(mut self, status: i32) -> Self {
        self.status = Some(status);
        self
    }

    pub(crate) fn instantiations(&self) -> u32 {
        self.instantiations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModuleRuntime for ScriptedRuntime {
    async fn instantiate(
        &self,
        _payload: Vec<u8>,
        params: KemParams,
        on_ready: ReadyNotifier,
    ) -> Result<Box<dyn ForeignModule>> {
        let n = self.instantiations.fetch_add(1, Ordering::SeqCst) + 1;
        let native = match &self.exports {
            Some(exports) => NativeKemModule::with_exports(params.level, exports),
            None => NativeKemModule::new(params.level),
        };
        let module: Box<dyn ForeignModule> = match self.status {
            Some(status) => Box::new(ScriptedModule::wrap(native).with_status(status)),
            None => Box::new(native),
        };
        if n <= self.stall_first {
            // Held, not dropped: a dropped sender would read as a load error
            self.stalled.lock().unwrap().push(on_ready);
        } else {
            on_ready.notify();
        }
        Ok(module)
    }
}
