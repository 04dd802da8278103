//! Unloader.
//!
//! Releases the loading context of stopped units. After a grace period the
//! plugin instance is dropped and then its context closed, both on a blocking
//! thread. Destruction is deterministic, so once `unload` returns the library
//! handle has been closed; no collection pass is needed. Whether the image is
//! also unmapped is up to the dynamic loader, see
//! [`ContextFactory::is_resident`](super::ContextFactory::is_resident).

use std::sync::Arc;
use std::time::Duration;

use super::registry::UnloadClaim;
use super::{PluginError, PluginId, PluginRegistry, PluginResult};

/// Releases loading contexts of stopped units.
#[derive(Debug, Clone)]
pub struct Unloader {
    registry: Arc<PluginRegistry>,
    grace: Duration,
}

impl Unloader {
    /// Create an unloader waiting `grace` before releasing contexts.
    pub fn new(registry: Arc<PluginRegistry>, grace: Duration) -> Self {
        Self { registry, grace }
    }

    /// Unload one Stopped unit.
    ///
    /// Fails without side effects if the unit is not Stopped or has a call
    /// outstanding. A failing context close is reported, but the unit is
    /// still marked Unloaded.
    pub async fn unload(&self, id: &PluginId) -> PluginResult<()> {
        let claim = self.registry.claim_unload(id)?;
        tokio::time::sleep(self.grace).await;
        self.release(id, claim).await
    }

    /// Unload several units sharing a single grace period.
    ///
    /// Every unit is attempted; one failure never prevents releasing the rest.
    pub async fn unload_many(&self, ids: &[PluginId]) -> Vec<(PluginId, PluginResult<()>)> {
        let mut results = Vec::with_capacity(ids.len());
        let mut claims = Vec::new();

        for id in ids {
            match self.registry.claim_unload(id) {
                Ok(claim) => claims.push((id.clone(), claim)),
                Err(e) => results.push((id.clone(), Err(e))),
            }
        }

        if !claims.is_empty() {
            tokio::time::sleep(self.grace).await;
        }

        for (id, claim) in claims {
            let result = self.release(&id, claim).await;
            results.push((id, result));
        }
        results
    }

    async fn release(&self, id: &PluginId, claim: UnloadClaim) -> PluginResult<()> {
        let UnloadClaim { name, instance, context } = claim;

        let released = tokio::task::spawn_blocking(move || {
            drop(instance);
            match context {
                Some(mut context) => context.close().map_err(|e| e.to_string()),
                None => Ok(()),
            }
        })
        .await;

        let result = match released {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(PluginError::Unload { id: id.clone(), reason }),
            Err(e) => Err(PluginError::Unload { id: id.clone(), reason: e.to_string() }),
        };

        if let Err(e) = &result {
            tracing::warn!(plugin = %id, name = %name, error = %e, "Releasing loading context failed");
        }
        self.registry.finish_unload(id)?;
        tracing::info!(plugin = %id, name = %name, "Plugin unloaded");

        result
    }
}
