//! Lifecycle controller.
//!
//! Drives `start`/`stop` across every unit in the registry. Each sweep claims
//! its units atomically, then runs the plugin calls concurrently on dedicated
//! threads, outside the registry lock and bounded by a timeout.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::oneshot;

use super::error::panic_message;
use super::registry::{CallOutcome, Claim};
use super::{LifecycleOp, Plugin, PluginError, PluginId, PluginRegistry, PluginResult};

/// Per-unit results of one command.
#[derive(Debug)]
pub struct LifecycleReport {
    /// The operation this report covers.
    pub op: LifecycleOp,
    /// Units whose call succeeded and whose transition was committed.
    pub succeeded: Vec<PluginId>,
    /// Contained per-unit failures.
    pub failed: Vec<PluginError>,
    /// Eligible units skipped because another call was outstanding.
    pub skipped: Vec<PluginId>,
    /// Units unloaded and removed as part of the command.
    pub unloaded: Vec<PluginId>,
    /// Released archives whose library is still mapped.
    pub resident: Vec<PathBuf>,
}

impl LifecycleReport {
    /// Empty report for `op`.
    pub fn new(op: LifecycleOp) -> Self {
        Self {
            op,
            succeeded: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            unloaded: Vec::new(),
            resident: Vec::new(),
        }
    }

    /// Whether no unit failed.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Identities of failed units, where known.
    pub fn failed_ids(&self) -> impl Iterator<Item = &PluginId> {
        self.failed.iter().filter_map(PluginError::plugin_id)
    }

    /// One-line summary, e.g. `start: 2 succeeded, 1 failed, 0 skipped`.
    pub fn summary(&self) -> String {
        let mut summary = format!(
            "{}: {} succeeded, {} failed, {} skipped",
            self.op,
            self.succeeded.len(),
            self.failed.len(),
            self.skipped.len()
        );
        if !self.unloaded.is_empty() {
            summary.push_str(&format!(", {} unloaded", self.unloaded.len()));
        }
        if !self.resident.is_empty() {
            summary.push_str(&format!(", {} still mapped", self.resident.len()));
        }
        summary
    }
}

/// Starts and stops plugin units held by a [`PluginRegistry`].
#[derive(Debug, Clone)]
pub struct LifecycleController {
    registry: Arc<PluginRegistry>,
    call_timeout: Duration,
}

impl LifecycleController {
    /// Create a controller bounding each plugin call by `call_timeout`.
    pub fn new(registry: Arc<PluginRegistry>, call_timeout: Duration) -> Self {
        Self { registry, call_timeout }
    }

    /// Start every Loaded or Stopped unit.
    pub async fn start_all(&self) -> LifecycleReport {
        self.sweep(LifecycleOp::Start).await
    }

    /// Stop every Running unit.
    pub async fn stop_all(&self) -> LifecycleReport {
        self.sweep(LifecycleOp::Stop).await
    }

    /// Apply the late outcome of timed-out calls that have since returned.
    pub(crate) fn reclaim_stalled(&self) {
        for late in self.registry.reclaim_stalled() {
            match late.result {
                Ok(()) => {
                    tracing::info!(plugin = %late.id, op = %late.op, "Stalled plugin call completed late");
                }
                Err(e) => tracing::warn!(plugin = %late.id, error = %e, "Stalled plugin call failed"),
            }
        }
    }

    async fn sweep(&self, op: LifecycleOp) -> LifecycleReport {
        self.reclaim_stalled();

        let claims = self.registry.claim(op);
        let mut report = LifecycleReport::new(op);
        for id in &claims.skipped {
            tracing::debug!(plugin = %id, %op, "Plugin busy, skipping");
        }
        report.skipped = claims.skipped;

        let calls = claims.claimed.into_iter().map(|claim| self.drive(op, claim));
        for (id, result) in join_all(calls).await {
            match result {
                Ok(()) => report.succeeded.push(id),
                Err(e) => report.failed.push(e),
            }
        }

        report.succeeded.sort();
        tracing::info!("{}", report.summary());
        report
    }

    /// Run one claimed call and settle it in the registry.
    ///
    /// The call runs on a detached thread rather than the runtime's blocking
    /// pool, so a plugin that never returns cannot hold up runtime shutdown.
    async fn drive(&self, op: LifecycleOp, claim: Claim) -> (PluginId, PluginResult<()>) {
        let Claim { id, name, instance } = claim;
        let (outcome_tx, mut outcome_rx) = oneshot::channel();

        let spawned = thread::Builder::new().name(format!("plugin-{op}")).spawn(move || {
            // The receiver is gone only if the unit was dropped mid-call.
            let _ = outcome_tx.send(invoke(instance, op));
        });

        let result = if let Err(e) = spawned {
            self.registry.lose(&id);
            Err(PluginError::Lifecycle {
                id: id.clone(),
                name: name.clone(),
                op,
                reason: format!("failed to spawn call thread: {e}"),
            })
        } else {
            match tokio::time::timeout(self.call_timeout, &mut outcome_rx).await {
                Ok(Ok(outcome)) => self.registry.complete(&id, op, outcome),
                Ok(Err(_)) => {
                    self.registry.lose(&id);
                    Err(PluginError::Lifecycle {
                        id: id.clone(),
                        name: name.clone(),
                        op,
                        reason: "call aborted without a result".to_string(),
                    })
                }
                Err(_) => {
                    self.registry.stall(&id, op, outcome_rx);
                    Err(PluginError::Timeout { id: id.clone(), name: name.clone(), op, after: self.call_timeout })
                }
            }
        };

        match &result {
            Ok(()) => tracing::info!(plugin = %id, name = %name, "Plugin {}", past_tense(op)),
            Err(e) => tracing::warn!(plugin = %id, name = %name, error = %e, "Plugin {op} failed"),
        }
        (id, result)
    }
}

/// Call the capability method on the current thread, containing panics.
///
/// Units from native libraries catch their own panics (see
/// [`Guarded`](super::Guarded)); the catch here covers units living in the
/// host's own image. Errors and panic payloads are rendered to strings here,
/// while the plugin's library is guaranteed to still be loaded.
fn invoke(mut instance: Box<dyn Plugin>, op: LifecycleOp) -> CallOutcome {
    let called = panic::catch_unwind(AssertUnwindSafe(|| match op {
        LifecycleOp::Start => instance.start(),
        LifecycleOp::Stop => instance.stop(),
        LifecycleOp::Unload => Ok(()),
    }));

    let result = match called {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(payload) => Err(format!("panicked: {}", panic_message(payload.as_ref()))),
    };
    CallOutcome { instance, result }
}

fn past_tense(op: LifecycleOp) -> &'static str {
    match op {
        LifecycleOp::Start => "started",
        LifecycleOp::Stop => "stopped",
        LifecycleOp::Unload => "unloaded",
    }
}
