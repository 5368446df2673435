/// Module payload sources and runtimes
///
/// Loading is split in two steps, matching how a compiled module is shipped:
/// a [`ModuleSource`] fetches the raw payload from one candidate location,
/// and a [`ModuleRuntime`] turns a payload into a live [`ForeignModule`],
/// reporting readiness later through a [`ReadyNotifier`].

use super::native::{ModuleManifest, NativeKemModule};
use super::ForeignModule;
use crate::config::{KemParams, SecurityLevel, BUILTIN_SCHEME};
use crate::error::{FileCryptError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::oneshot;

/// Fetches a module payload from a location string
#[async_trait]
pub trait ModuleSource: Send + Sync {
    /// Return the payload at `location`, or `ModuleLoadError`
    async fn fetch(&self, location: &str) -> Result<Vec<u8>>;
}

/// Instantiates a module from its payload
#[async_trait]
pub trait ModuleRuntime: Send + Sync {
    /// Build the module. The runtime must call `on_ready.notify()` once the
    /// module may be used; the manager bounds how long it waits for that.
    async fn instantiate(
        &self,
        payload: Vec<u8>,
        params: KemParams,
        on_ready: ReadyNotifier,
    ) -> Result<Box<dyn ForeignModule>>;
}

// ─── Ready callback ──────────────────────────────────────────────────────────

/// One-shot "runtime initialized" callback handed to a runtime
pub struct ReadyNotifier {
    tx: oneshot::Sender<()>,
}

impl ReadyNotifier {
    pub fn channel() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    pub fn notify(self) {
        // Receiver gone means the manager already gave up on this attempt
        let _ = self.tx.send(());
    }
}

// ─── Sources ─────────────────────────────────────────────────────────────────

/// Reads payloads from files under a root directory
#[derive(Debug, Clone)]
pub struct FsModuleSource {
    root: PathBuf,
}

impl FsModuleSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ModuleSource for FsModuleSource {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>> {
        let path = self.root.join(location);
        let payload = tokio::fs::read(&path).await.map_err(|e| {
            FileCryptError::ModuleLoadError(format!("{}: {}", path.display(), e))
        })?;
        if payload.is_empty() {
            return Err(FileCryptError::ModuleLoadError(format!(
                "{}: empty payload",
                path.display()
            )));
        }
        Ok(payload)
    }
}

/// Filesystem source that also resolves `builtin:ml-kem` to the manifest of
/// the in-crate module
#[derive(Debug, Clone)]
pub struct DefaultModuleSource {
    fs: FsModuleSource,
    level: SecurityLevel,
}

impl DefaultModuleSource {
    pub fn new(root: impl Into<PathBuf>, level: SecurityLevel) -> Self {
        Self {
            fs: FsModuleSource::new(root),
            level,
        }
    }
}

#[async_trait]
impl ModuleSource for DefaultModuleSource {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>> {
        match location.strip_prefix(BUILTIN_SCHEME) {
            Some("ml-kem") => ModuleManifest::builtin(self.level).to_bytes(),
            Some(other) => Err(FileCryptError::ModuleLoadError(format!(
                "unknown builtin module '{}'",
                other
            ))),
            None => self.fs.fetch(location).await,
        }
    }
}

// ─── Runtimes ────────────────────────────────────────────────────────────────

/// Instantiates [`NativeKemModule`] from a JSON [`ModuleManifest`] payload
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeRuntime;

#[async_trait]
impl ModuleRuntime for NativeRuntime {
    async fn instantiate(
        &self,
        payload: Vec<u8>,
        params: KemParams,
        on_ready: ReadyNotifier,
    ) -> Result<Box<dyn ForeignModule>> {
        let manifest = ModuleManifest::parse(&payload)?;
        if manifest.security_level != params.level {
            return Err(FileCryptError::ModuleContractError(format!(
                "module '{}' implements {}, configured for {}",
                manifest.name, manifest.security_level, params.level
            )));
        }

        log::debug!(
            "Instantiating native module '{}' ({} exports)",
            manifest.name,
            manifest.exports.len()
        );
        let module = NativeKemModule::from_manifest(&manifest);

        // Runtime initialization completes asynchronously, after instantiate returns
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            on_ready.notify();
        });

        Ok(Box::new(module))
    }
}
