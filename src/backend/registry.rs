//! Backend registry: at most one live backend per key.
//!
//! Epistemic foundation:
//! - K_i: Two requests for equal keys observe the same instance
//! - K_i: Concurrent first requests for one key construct it once
//! - B_i: Construction may fail → error surfaces, the slot stays empty for retry
//! - I^R: Construction and batch sizing are pluggable (factory, policy)

use super::{
    ApiBackend, BackendKey, BackendKind, BatchSizePolicy, FixedBatchSize, ModelBackend,
    DoublingBatchSize, TgiBackend, VllmBackend,
};
use crate::models::{ApiConfig, Config, EvalError, LocalConfig, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use tokio::sync::{Mutex, OnceCell};
use tracing::{info, warn};

/// Builds backend instances for keys.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn create(&self, key: &BackendKey) -> Result<Arc<dyn ModelBackend>>;
}

/// Builds API clients and launches local inference servers.
pub struct LaunchingFactory {
    api: ApiConfig,
    local: LocalConfig,
    api_key: Option<String>,
    next_port: AtomicU16,
}

impl LaunchingFactory {
    pub fn from_config(config: &Config) -> Self {
        Self {
            api: config.api.clone(),
            local: config.local.clone(),
            api_key: config.resolve_api_key().ok(),
            next_port: AtomicU16::new(config.local.base_port),
        }
    }
}

#[async_trait]
impl BackendFactory for LaunchingFactory {
    async fn create(&self, key: &BackendKey) -> Result<Arc<dyn ModelBackend>> {
        match key.kind {
            BackendKind::Api => {
                let api_key = self.api_key.clone().ok_or_else(|| {
                    EvalError::unavailable(
                        key.to_string(),
                        format!("missing API key: set {} or api.api_key", self.api.api_key_env),
                    )
                })?;
                Ok(Arc::new(ApiBackend::new(key.clone(), &self.api, api_key)?))
            }
            BackendKind::HuggingFace => match &self.local.base_url {
                Some(url) => Ok(Arc::new(TgiBackend::connect(key.clone(), &self.local, url)?)),
                None => {
                    let port = self.next_port.fetch_add(1, Ordering::Relaxed);
                    Ok(Arc::new(TgiBackend::launch(key.clone(), &self.local, port).await?))
                }
            },
            BackendKind::Vllm => match &self.local.base_url {
                Some(url) => Ok(Arc::new(VllmBackend::connect(key.clone(), &self.local, url)?)),
                None => {
                    let port = self.next_port.fetch_add(1, Ordering::Relaxed);
                    Ok(Arc::new(VllmBackend::launch(key.clone(), &self.local, port).await?))
                }
            },
        }
    }
}

/// A live backend and the batch size discovered for it.
#[derive(Clone)]
pub struct RegisteredBackend {
    pub backend: Arc<dyn ModelBackend>,
    pub batch_size: usize,
}

/// One key's backend, built at most once.
///
/// A closed slot has left the registry; it no longer starts constructions.
#[derive(Default)]
struct Slot {
    cell: OnceCell<RegisteredBackend>,
    closed: AtomicBool,
}

impl Slot {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait out any construction in progress; the backend it produced, if any.
    async fn settle(&self) -> Option<RegisteredBackend> {
        self.cell
            .get_or_try_init(|| async { Err::<RegisteredBackend, ()>(()) })
            .await
            .ok()
            .cloned()
    }
}

/// Process-wide map from backend key to live backend.
pub struct BackendRegistry {
    factory: Arc<dyn BackendFactory>,
    policy: Arc<dyn BatchSizePolicy>,
    slots: Mutex<HashMap<BackendKey, Arc<Slot>>>,
}

impl BackendRegistry {
    pub fn new(factory: Arc<dyn BackendFactory>, policy: Arc<dyn BatchSizePolicy>) -> Self {
        Self {
            factory,
            policy,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Registry that launches backends as configured.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(LaunchingFactory::from_config(config)),
            batch_policy(config),
        )
    }

    /// Return the live backend for `key`, constructing it on first use.
    ///
    /// Concurrent callers for the same key wait on a single construction.
    pub async fn get_or_create(&self, key: &BackendKey) -> Result<RegisteredBackend> {
        let slot = {
            let mut slots = self.slots.lock().await;
            Arc::clone(slots.entry(key.clone()).or_default())
        };

        let registered = slot
            .cell
            .get_or_try_init(|| async {
                // Shutdown took the slot before this construction began
                if slot.is_closed() {
                    return Err(EvalError::unavailable(
                        key.to_string(),
                        "shut down while waiting for construction",
                    ));
                }
                info!(backend = %key, "Constructing backend");
                let backend = self.factory.create(key).await?;
                let batch_size = match self.policy.discover(backend.as_ref()).await {
                    Ok(size) => size,
                    Err(e) => {
                        if let Err(shutdown_err) = backend.shutdown().await {
                            warn!(backend = %key, error = %shutdown_err, "Shutdown after failed sizing");
                        }
                        return Err(e);
                    }
                };
                info!(backend = %key, batch_size, "Backend ready");
                Ok::<_, EvalError>(RegisteredBackend {
                    backend,
                    batch_size,
                })
            })
            .await?;

        Ok(registered.clone())
    }

    /// Whether a constructed backend exists for `key`.
    pub async fn contains(&self, key: &BackendKey) -> bool {
        self.slots
            .lock()
            .await
            .get(key)
            .is_some_and(|slot| slot.cell.initialized())
    }

    pub async fn len(&self) -> usize {
        self.slots
            .lock()
            .await
            .values()
            .filter(|slot| slot.cell.initialized())
            .count()
    }

    /// Shut down and forget the backend for `key`. Returns whether one existed.
    ///
    /// A construction in progress for `key` is awaited and its backend shut down.
    pub async fn shutdown(&self, key: &BackendKey) -> Result<bool> {
        let Some(slot) = self.slots.lock().await.remove(key) else {
            return Ok(false);
        };
        slot.close();
        match slot.settle().await {
            Some(registered) => {
                registered.backend.shutdown().await?;
                info!(backend = %key, "Backend shut down");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Shut down every backend; keeps going past individual failures.
    ///
    /// Returns the number of backends shut down.
    pub async fn shutdown_all(&self) -> usize {
        let slots: Vec<(BackendKey, Arc<Slot>)> = self.slots.lock().await.drain().collect();
        for (_, slot) in &slots {
            slot.close();
        }
        let mut count = 0;
        for (key, slot) in slots {
            let Some(registered) = slot.settle().await else {
                continue;
            };
            match registered.backend.shutdown().await {
                Ok(()) => count += 1,
                Err(e) => warn!(backend = %key, error = %e, "Backend shutdown failed"),
            }
        }
        count
    }
}

/// Batch-size policy for a configuration.
pub fn batch_policy(config: &Config) -> Arc<dyn BatchSizePolicy> {
    match config.batching.batch_size {
        Some(size) => Arc::new(FixedBatchSize(size)),
        None => Arc::new(DoublingBatchSize {
            start: config.batching.discovery_start,
            max: config.batching.discovery_max,
        }),
    }
}
