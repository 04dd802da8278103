//! Plugin manager.
//!
//! Ties the scanner, loader, registry, controller and unloader together
//! behind the command surface used by the CLI: load, start, stop, reload and
//! unload. Every command is safe to repeat and safe to issue concurrently with
//! the periodic rescan.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{
    scanner, ArchiveDisposition, ArchiveLoad, ContextFactory, IsolatedLoader, LifecycleController,
    LifecycleOp, LifecycleReport, NativeContextFactory, PluginError, PluginId, PluginRegistry,
    PluginResult, PluginSnapshot, TrackedArchive, UnitState, Unloader,
};
use crate::config::PluginConfig;

/// Outcome of one `load_plugins` pass.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Identities newly inserted into the registry.
    pub loaded: Vec<PluginId>,
    /// Archives skipped because they did not change since the last pass.
    pub unchanged: Vec<PathBuf>,
    /// Archives changed on disk while their units are live. Picked up by reload.
    pub stale: Vec<PathBuf>,
    /// Contained archive- and unit-level failures.
    pub errors: Vec<PluginError>,
}

impl LoadReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// One-line summary, e.g. `load: 1 loaded, 1 failed, 0 unchanged`.
    pub fn summary(&self) -> String {
        let mut summary = format!(
            "load: {} loaded, {} failed, {} unchanged",
            self.loaded.len(),
            self.errors.len(),
            self.unchanged.len()
        );
        if !self.stale.is_empty() {
            summary.push_str(&format!(", {} stale", self.stale.len()));
        }
        summary
    }
}

/// Command surface of the plugin subsystem.
pub struct PluginManager {
    directory: PathBuf,
    extension: String,
    unload_on_stop: bool,
    registry: Arc<PluginRegistry>,
    loader: IsolatedLoader,
    controller: LifecycleController,
    unloader: Unloader,
    factory: Arc<dyn ContextFactory>,
    /// Serializes load passes so one archive is never loaded twice at once.
    load_pass: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("directory", &self.directory)
            .field("extension", &self.extension)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl PluginManager {
    /// Create a manager loading native shared libraries.
    ///
    /// Fails with a configuration error if the settings are invalid or the
    /// plugin directory does not exist.
    pub fn new(config: &PluginConfig) -> PluginResult<Self> {
        Self::with_factory(config, Arc::new(NativeContextFactory::new()))
    }

    /// Create a manager opening archives through `factory`.
    pub fn with_factory(
        config: &PluginConfig,
        factory: Arc<dyn ContextFactory>,
    ) -> PluginResult<Self> {
        config.validate()?;

        let directory = config.resolved_directory();
        if !directory.is_dir() {
            return Err(PluginError::NotADirectory(directory));
        }

        let registry = Arc::new(PluginRegistry::new());
        tracing::debug!(directory = %directory.display(), "Plugin manager ready");

        Ok(Self {
            directory,
            extension: config.extension.trim_start_matches('.').to_string(),
            unload_on_stop: config.unload_on_stop,
            loader: IsolatedLoader::new(factory.clone()),
            factory,
            controller: LifecycleController::new(registry.clone(), config.call_timeout()),
            unloader: Unloader::new(registry.clone(), config.unload_grace()),
            registry,
            load_pass: tokio::sync::Mutex::new(()),
        })
    }

    /// Get the plugins directory.
    pub fn directory(&self) -> &std::path::Path {
        &self.directory
    }

    /// Shared handle to the registry.
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Scan the directory and load every new archive.
    ///
    /// Unchanged archives are skipped, including ones that failed before.
    /// A changed archive whose units are still live is flagged stale and left
    /// alone; `reload_plugins` picks it up. Only a vanished or unreadable
    /// directory fails the whole pass.
    pub async fn load_plugins(&self) -> PluginResult<LoadReport> {
        let _pass = self.load_pass.lock().await;

        let directory = self.directory.clone();
        let extension = self.extension.clone();
        let records = tokio::task::spawn_blocking(move || scanner::scan(&directory, &extension))
            .await
            .map_err(|e| PluginError::Io(std::io::Error::other(e)))??;

        let present: HashSet<PathBuf> = records.iter().map(|r| r.path.clone()).collect();
        for path in self.registry.forget_missing(&present) {
            tracing::debug!(archive = %path.display(), "Archive removed from plugin directory");
        }

        let mut report = LoadReport::default();
        let mut pending = Vec::new();

        for record in records {
            match self.registry.disposition(&record) {
                ArchiveDisposition::New | ArchiveDisposition::Changed { live: false } => {
                    pending.push(record);
                }
                ArchiveDisposition::Unchanged => report.unchanged.push(record.path),
                ArchiveDisposition::Changed { live: true } => {
                    if self.registry.mark_stale(&record.path) {
                        tracing::warn!(
                            archive = %record.path.display(),
                            "Archive changed while its plugins are loaded; reload to pick it up"
                        );
                    }
                    report.stale.push(record.path);
                }
                ArchiveDisposition::Resident => {
                    if self.registry.mark_stale(&record.path) {
                        tracing::warn!(
                            archive = %record.path.display(),
                            "Archive changed but its previous version is still mapped; restart to load it"
                        );
                    }
                    report.stale.push(record.path);
                }
            }
        }

        if pending.is_empty() {
            tracing::debug!("{}", report.summary());
            return Ok(report);
        }

        let loader = self.loader.clone();
        let loads = tokio::task::spawn_blocking(move || {
            pending.iter().map(|record| loader.load(record)).collect::<Vec<_>>()
        })
        .await
        .map_err(|e| PluginError::Io(std::io::Error::other(e)))?;

        for ArchiveLoad { record, units, errors, archive_failed } in loads {
            report.loaded.extend(self.registry.merge(units));
            report.errors.extend(errors);
            self.registry.record_archive(record, archive_failed);
        }

        report.loaded.sort();
        tracing::info!("{}", report.summary());
        Ok(report)
    }

    /// Start every Loaded or Stopped plugin.
    pub async fn start_plugins(&self) -> LifecycleReport {
        self.controller.start_all().await
    }

    /// Stop every Running plugin.
    ///
    /// With `unload_on_stop` set, stopped plugins are also unloaded and
    /// removed so their archives are released.
    pub async fn stop_plugins(&self) -> LifecycleReport {
        let mut report = self.controller.stop_all().await;
        if self.unload_on_stop {
            self.unload_stopped(&mut report).await;
        }
        report
    }

    /// Unload and remove every Stopped plugin.
    pub async fn unload_plugins(&self) -> LifecycleReport {
        let mut report = LifecycleReport::new(LifecycleOp::Unload);
        self.unload_stopped(&mut report).await;
        report.succeeded.clone_from(&report.unloaded);
        tracing::info!("{}", report.summary());
        report
    }

    /// Stop, unload and remove everything that is stopped, then load again.
    ///
    /// This is the path that picks up archives changed on disk. Plugins that
    /// fail to stop keep running and keep their archive. An archive whose
    /// library stays mapped after unloading keeps its old code; a changed
    /// file is then reported stale instead of loaded.
    pub async fn reload_plugins(&self) -> PluginResult<(LifecycleReport, LoadReport)> {
        let mut stopped = self.controller.stop_all().await;
        self.unload_stopped(&mut stopped).await;

        let loaded = self.load_plugins().await?;
        Ok((stopped, loaded))
    }

    /// Snapshot of every registered plugin, sorted by identity.
    pub fn plugins(&self) -> Vec<PluginSnapshot> {
        self.registry.all()
    }

    /// Every archive seen so far, sorted by path.
    pub fn archives(&self) -> Vec<TrackedArchive> {
        self.registry.archives()
    }

    /// Stop and release every plugin that can be stopped. Used on exit.
    ///
    /// Plugins that were never started, or failed to stop, are released when
    /// the manager is dropped.
    pub async fn shutdown(&self) -> LifecycleReport {
        let mut report = self.controller.stop_all().await;
        self.unload_stopped(&mut report).await;

        if !self.registry.is_empty() {
            tracing::debug!(remaining = self.registry.len(), "Plugins left for drop on exit");
        }
        report
    }

    /// Unload and remove every Stopped unit, recording the outcome in `report`.
    async fn unload_stopped(&self, report: &mut LifecycleReport) {
        // A timed-out stop that finished since counts as Stopped.
        self.controller.reclaim_stalled();

        let ids = self.registry.ids_in_state(UnitState::Stopped);
        if ids.is_empty() {
            return;
        }

        // Removal and the residency check must not interleave with a load pass.
        let _pass = self.load_pass.lock().await;
        let mut released = Vec::new();

        for (id, result) in self.unloader.unload_many(&ids).await {
            if let Err(e) = result {
                report.failed.push(e);
            }
            // A failed close still leaves the unit Unloaded and removable.
            if self.registry.get(&id).is_some_and(|s| s.state == UnitState::Unloaded) {
                match self.registry.remove(&id) {
                    Ok(record) => {
                        released.extend(record);
                        report.unloaded.push(id);
                    }
                    Err(e) => report.failed.push(e),
                }
            }
        }

        if released.is_empty() {
            return;
        }
        let factory = Arc::clone(&self.factory);
        let checked = tokio::task::spawn_blocking(move || {
            released.into_iter().map(|record| (factory.is_resident(&record.path), record)).collect::<Vec<_>>()
        })
        .await;

        let checked = match checked {
            Ok(checked) => checked,
            Err(e) => {
                tracing::warn!(error = %e, "Library residency check failed");
                return;
            }
        };
        for (resident, record) in checked {
            if !resident {
                continue;
            }
            tracing::warn!(
                archive = %record.path.display(),
                "Library still mapped after unload; a changed archive takes effect after a restart"
            );
            report.resident.push(record.path.clone());
            self.registry.keep_resident(record);
        }
    }
}

/// Rescan the plugin directory every `interval` until `shutdown` flips.
///
/// The first pass runs one interval after spawning. Errors are logged and the
/// task keeps going.
pub fn spawn_periodic_rescan(
    manager: Arc<PluginManager>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = manager.load_plugins().await {
                        tracing::warn!(error = %e, "Periodic plugin rescan failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Periodic plugin rescan stopped");
    })
}
