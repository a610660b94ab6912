//! Accelerator residency coordination.
//!
//! At most one exchangeable engine is tracked as resident at a time. Acquiring
//! a different exchangeable engine unloads every other non-persistent engine
//! first; persistent engines (kept warm, such as diarization) are exempt and
//! never become "the" active engine.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Capability shared by every engine that can release accelerator memory.
///
/// Unloading an engine that holds nothing must succeed as a no-op.
#[async_trait]
pub trait Unloadable: Send + Sync {
    async fn unload(&self) -> Result<()>;
}

struct EngineRegistration {
    persistent: bool,
    engine: Arc<dyn Unloadable>,
}

#[derive(Default)]
pub struct ResidencyCoordinator {
    engines: RwLock<BTreeMap<String, EngineRegistration>>,
    active: RwLock<Option<String>>,
    /// Serializes `acquire` so two callers never race the active check.
    acquire_lock: Mutex<()>,
}

impl ResidencyCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) an engine under `name`.
    pub async fn register(
        &self,
        name: impl Into<String>,
        persistent: bool,
        engine: Arc<dyn Unloadable>,
    ) {
        let name = name.into();
        info!(
            "Registered engine '{}' ({})",
            name,
            if persistent { "persistent" } else { "exchangeable" }
        );
        self.engines
            .write()
            .await
            .insert(name, EngineRegistration { persistent, engine });
    }

    /// Make `name` the resident engine, evicting exchangeable competitors.
    pub async fn acquire(&self, name: &str) -> Result<()> {
        let _guard = self.acquire_lock.lock().await;
        let engines = self.engines.read().await;

        let registration = engines
            .get(name)
            .ok_or_else(|| Error::EngineNotRegistered(name.to_string()))?;
        if registration.persistent {
            debug!("Engine '{name}' is persistent; residency unchanged");
            return Ok(());
        }

        if self.active.read().await.as_deref() == Some(name) {
            return Ok(());
        }

        for (other, registration) in engines.iter() {
            if other == name || registration.persistent {
                continue;
            }
            info!("Engine '{name}' acquiring accelerator, unloading '{other}'");
            if let Err(err) = registration.engine.unload().await {
                warn!("Failed to unload engine '{other}': {err}");
            }
        }

        *self.active.write().await = Some(name.to_string());
        info!("'{name}' is now the active engine");
        Ok(())
    }

    /// Exchangeable engine currently considered resident.
    pub async fn active_engine(&self) -> Option<String> {
        self.active.read().await.clone()
    }
}
