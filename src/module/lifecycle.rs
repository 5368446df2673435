/// KEM module lifecycle
///
/// ```text
/// Uninitialized ──▶ Initializing{attempt} ──▶ Ready(handle)
///                          │
///                          └──▶ Failed(error)      (ceiling reached or contract error)
/// ```
///
/// The first caller of [`ModuleManager::get_instance`] or
/// [`ModuleManager::wait_for_ready`] starts one background initialization
/// task; every other caller observes the same task through a `watch`
/// channel, so concurrent callers never trigger parallel loads.
///
/// Each attempt fetches the payload from the first location that answers,
/// instantiates it, waits (bounded) for the runtime-ready callback and then
/// checks the required exports. Load failures and ready timeouts are retried
/// up to `max_init_attempts`; contract errors fail at once.
///
/// Once `Ready`, a manager never leaves that state.

use super::loader::{DefaultModuleSource, ModuleRuntime, ModuleSource, NativeRuntime, ReadyNotifier};
use super::{missing_exports, ModuleHandle};
use crate::config::EngineConfig;
use crate::error::{FileCryptError, Result};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Observable manager state.
#[derive(Debug, Clone)]
pub enum ModuleState {
    Uninitialized,
    Initializing { attempt: u32 },
    Ready(ModuleHandle),
    Failed(FileCryptError),
}

impl ModuleState {
    fn settled(&self) -> Option<Result<ModuleHandle>> {
        match self {
            ModuleState::Ready(handle) => Some(Ok(handle.clone())),
            ModuleState::Failed(err) => Some(Err(err.clone())),
            _ => None,
        }
    }
}

struct Inner {
    config: EngineConfig,
    source: Arc<dyn ModuleSource>,
    runtime: Arc<dyn ModuleRuntime>,
    state: watch::Sender<ModuleState>,
    attempts: AtomicU32,
    reinit_scheduled: AtomicBool,
}

/// Owns the single module instance for one engine.
#[derive(Clone)]
pub struct ModuleManager {
    inner: Arc<Inner>,
}

impl ModuleManager {
    pub fn new(
        config: EngineConfig,
        source: Arc<dyn ModuleSource>,
        runtime: Arc<dyn ModuleRuntime>,
    ) -> Result<Self> {
        config.validate()?;
        let (state, _) = watch::channel(ModuleState::Uninitialized);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                source,
                runtime,
                state,
                attempts: AtomicU32::new(0),
                reinit_scheduled: AtomicBool::new(false),
            }),
        })
    }

    /// Manager over the filesystem/builtin source and the native runtime
    pub fn native(config: EngineConfig) -> Result<Self> {
        let source = DefaultModuleSource::new(config.module_root.clone(), config.security_level);
        Self::new(config, Arc::new(source), Arc::new(NativeRuntime))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ModuleState {
        self.inner.state.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.inner.state.borrow(), ModuleState::Ready(_))
    }

    /// The ready handle, without starting or awaiting initialization
    pub fn handle(&self) -> Option<ModuleHandle> {
        match &*self.inner.state.borrow() {
            ModuleState::Ready(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Initialization attempts made so far, across retries and re-runs
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Return the ready module, initializing it on first use.
    ///
    /// Resolves with the outcome of the single in-flight initialization.
    pub async fn get_instance(&self) -> Result<ModuleHandle> {
        self.start();
        self.outcome().await
    }

    /// Wait up to `timeout` for the module to become ready.
    ///
    /// On timeout, returns `InitializationTimeout` and schedules one more
    /// initialization attempt, run only if the in-flight initialization ends
    /// in failure.
    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<()> {
        self.start();
        match tokio::time::timeout(timeout, self.outcome()).await {
            Ok(outcome) => outcome.map(|_| ()),
            Err(_) => {
                let timeout_ms = millis(timeout);
                log::warn!("KEM module not ready after {} ms", timeout_ms);
                self.schedule_reinit();
                Err(FileCryptError::InitializationTimeout { timeout_ms })
            }
        }
    }

    fn start(&self) {
        let started = self.inner.state.send_if_modified(|state| {
            if matches!(state, ModuleState::Uninitialized) {
                *state = ModuleState::Initializing { attempt: 1 };
                true
            } else {
                false
            }
        });
        if started {
            tokio::spawn(initialize(self.inner.clone()));
        }
    }

    // The flag is set under the state read lock so the initialization task
    // cannot publish `Failed` between the check and the store.
    fn schedule_reinit(&self) {
        let state = self.inner.state.borrow();
        if matches!(*state, ModuleState::Initializing { .. }) {
            self.inner.reinit_scheduled.store(true, Ordering::SeqCst);
        }
    }

    async fn outcome(&self) -> Result<ModuleHandle> {
        let mut rx = self.inner.state.subscribe();
        loop {
            let settled = rx.borrow_and_update().settled();
            if let Some(outcome) = settled {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return Err(FileCryptError::ModuleNotReady("module manager dropped".into()));
            }
        }
    }
}

impl std::fmt::Debug for ModuleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleManager")
            .field("level", &self.inner.config.security_level)
            .field("state", &self.state())
            .field("attempts", &self.attempts())
            .finish()
    }
}

// ─── Initialization task ─────────────────────────────────────────────────────

async fn initialize(inner: Arc<Inner>) {
    let mut budget = inner.config.max_init_attempts;

    loop {
        match run_attempts(&inner, budget).await {
            Ok(handle) => {
                inner.reinit_scheduled.store(false, Ordering::SeqCst);
                log::info!(
                    "KEM module ready: {} after {} attempt(s)",
                    handle.params().level,
                    inner.attempts.load(Ordering::SeqCst)
                );
                inner.state.send_replace(ModuleState::Ready(handle));
                return;
            }
            Err(err) => {
                // A wait that timed out during this run gets one more attempt
                let settled = inner.state.send_if_modified(|state| {
                    if inner.reinit_scheduled.swap(false, Ordering::SeqCst) {
                        false
                    } else {
                        *state = ModuleState::Failed(err.clone());
                        true
                    }
                });
                if settled {
                    log::error!("KEM module initialization failed: {}", err);
                    return;
                }
                log::info!("Re-running KEM module initialization requested by a timed-out wait");
                budget = 1;
            }
        }
    }
}

async fn run_attempts(inner: &Inner, budget: u32) -> Result<ModuleHandle> {
    let mut last_error = None;

    for round in 1..=budget {
        let attempt = inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        inner
            .state
            .send_modify(|state| *state = ModuleState::Initializing { attempt });
        log::info!("Initializing KEM module (attempt {}, {}/{})", attempt, round, budget);

        match attempt_once(inner).await {
            Ok(handle) => return Ok(handle),
            Err(err) if !err.is_retryable() => {
                log::error!("Attempt {} failed and is not retryable: {}", attempt, err);
                return Err(err);
            }
            Err(err) => {
                log::warn!("Attempt {} failed: {}", attempt, err);
                last_error = Some(err);
                if round < budget {
                    tokio::time::sleep(inner.config.retry_delay()).await;
                }
            }
        }
    }

    Err(FileCryptError::ModuleInitFailed {
        attempts: inner.attempts.load(Ordering::SeqCst),
        cause: last_error.map(|e| e.to_string()).unwrap_or_default(),
    })
}

async fn attempt_once(inner: &Inner) -> Result<ModuleHandle> {
    let params = inner.config.params();
    let (location, payload) = fetch_payload(inner).await?;
    log::debug!("Fetched KEM module payload from {} ({} bytes)", location, payload.len());

    let (notifier, ready) = ReadyNotifier::channel();
    let module = inner.runtime.instantiate(payload, params, notifier).await?;

    let timeout = inner.config.init_timeout();
    match tokio::time::timeout(timeout, ready).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => {
            return Err(FileCryptError::ModuleLoadError(
                "runtime dropped the ready callback".into(),
            ))
        }
        Err(_) => {
            return Err(FileCryptError::ModuleInitTimeout {
                timeout_ms: inner.config.init_timeout_ms,
            })
        }
    }

    let missing = missing_exports(module.as_ref());
    if !missing.is_empty() {
        return Err(FileCryptError::ModuleContractError(format!(
            "required functions not found: {}",
            missing.join(", ")
        )));
    }

    Ok(ModuleHandle::new(module, params))
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

async fn fetch_payload(inner: &Inner) -> Result<(String, Vec<u8>)> {
    let mut last_error = None;
    for location in &inner.config.module_locations {
        match inner.source.fetch(location).await {
            Ok(payload) => return Ok((location.clone(), payload)),
            Err(err) => {
                log::debug!("No KEM module at {}: {}", location, err);
                last_error = Some(err);
            }
        }
    }
    Err(FileCryptError::ModuleLoadError(format!(
        "failed to fetch KEM module from any known location ({} tried, last: {})",
        inner.config.module_locations.len(),
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}
