//! Isolated loader.
//!
//! Turns one archive into plugin unit candidates. Each archive gets a fresh
//! loading context, and every unit ends up owning a context of its own: the
//! first unit takes over the context that enumerated the archive, further
//! units of the same archive get a newly opened one.
//!
//! Failures are contained: an archive that cannot be opened yields no
//! candidates, a unit that cannot be instantiated is skipped while its
//! siblings are still attempted.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use super::error::panic_message;
use super::{
    ArchiveRecord, ContextFactory, LoadingContext, PluginError, PluginId, PluginResult,
    PluginUnit,
};

/// Outcome of loading one archive.
#[derive(Debug)]
pub struct ArchiveLoad {
    /// The scanned record, with the identities of the candidates filled in.
    pub record: ArchiveRecord,
    /// Instantiated units, all in state Loaded.
    pub units: Vec<PluginUnit>,
    /// Contained archive- and unit-level failures.
    pub errors: Vec<PluginError>,
    /// Whether the archive as a whole could not be opened.
    pub archive_failed: bool,
}

impl ArchiveLoad {
    fn failed(record: ArchiveRecord, error: PluginError) -> Self {
        Self { record, units: Vec::new(), errors: vec![error], archive_failed: true }
    }
}

/// Loads plugin units from archives through a [`ContextFactory`].
#[derive(Clone)]
pub struct IsolatedLoader {
    factory: Arc<dyn ContextFactory>,
}

impl std::fmt::Debug for IsolatedLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolatedLoader").finish_non_exhaustive()
    }
}

impl IsolatedLoader {
    /// Create a loader opening contexts with `factory`.
    pub fn new(factory: Arc<dyn ContextFactory>) -> Self {
        Self { factory }
    }

    /// Load every plugin unit contained in `archive`.
    ///
    /// Blocks on file I/O and plugin constructors; call from a blocking
    /// context.
    pub fn load(&self, archive: &ArchiveRecord) -> ArchiveLoad {
        let mut record = ArchiveRecord::new(archive.path.clone(), archive.last_modified);

        let probe = match self.factory.open(&record.path) {
            Ok(context) => context,
            Err(e) => {
                tracing::warn!(archive = %record.path.display(), error = %e, "Skipping archive");
                return ArchiveLoad::failed(record, e);
            }
        };

        let unit_names = probe.units();
        if unit_names.is_empty() {
            tracing::debug!(archive = %record.path.display(), "Archive declares no plugin units");
        }

        let mut probe = Some(probe);
        let mut units = Vec::new();
        let mut errors = Vec::new();

        for unit in unit_names {
            let context = match probe.take() {
                Some(context) => context,
                None => match self.factory.open(&record.path) {
                    Ok(context) => context,
                    Err(e) => {
                        errors.push(PluginError::UnitInstantiation {
                            archive: record.path.clone(),
                            unit,
                            reason: e.to_string(),
                        });
                        continue;
                    }
                },
            };

            match instantiate(context, &unit) {
                Ok(plugin_unit) => {
                    tracing::info!(
                        plugin = %plugin_unit.id(),
                        name = plugin_unit.name(),
                        "Found plugin unit"
                    );
                    record.unit_identities.insert(plugin_unit.id().clone());
                    units.push(plugin_unit);
                }
                Err(e) => {
                    tracing::warn!(
                        archive = %record.path.display(),
                        unit = %unit,
                        error = %e,
                        "Skipping plugin unit"
                    );
                    errors.push(e);
                }
            }
        }

        ArchiveLoad { record, units, errors, archive_failed: false }
    }
}

/// Resolve `unit` through `context` and wrap the instance in a Loaded unit.
fn instantiate(context: Box<dyn LoadingContext>, unit: &str) -> PluginResult<PluginUnit> {
    let archive = context.archive().to_path_buf();
    let instantiation_error = |reason: String| PluginError::UnitInstantiation {
        archive: archive.clone(),
        unit: unit.to_string(),
        reason,
    };

    // Native factories report panics as errors; this catches in-process ones.
    let created = panic::catch_unwind(AssertUnwindSafe(|| {
        context.instantiate(unit).map(|instance| {
            let name = instance.name().trim().to_string();
            (instance, name)
        })
    }));

    let (instance, name) = match created {
        Ok(Ok(created)) => created,
        Ok(Err(e @ PluginError::UnitInstantiation { .. })) => return Err(e),
        Ok(Err(e)) => return Err(instantiation_error(e.to_string())),
        Err(payload) => {
            return Err(instantiation_error(format!(
                "constructor panicked: {}",
                panic_message(payload.as_ref())
            )));
        }
    };

    if name.is_empty() {
        drop(instance);
        return Err(instantiation_error("plugin reports an empty name".to_string()));
    }

    let mut plugin_unit = PluginUnit::discovered(PluginId::new(archive.clone(), unit), context);
    plugin_unit.attach(instance, name)?;
    Ok(plugin_unit)
}
