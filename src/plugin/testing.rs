//! Scripted loading contexts for unit tests.
//!
//! Archives are plain files on disk; their contents never matter. The factory
//! maps archive file names to scripted units, and any file it does not know
//! behaves like a corrupt archive.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{ContextFactory, ContextId, LoadingContext, Plugin, PluginError, PluginResult};

/// How a scripted unit behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Behavior {
    Normal,
    FailStart,
    FailStop,
    PanicOnStart,
    SlowStart(Duration),
    SlowStop(Duration),
    PanicOnCreate,
    EmptyName,
}

/// Call counters shared between a scripted unit and the test.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub created: AtomicUsize,
    pub dropped: AtomicUsize,
}

impl Counters {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ScriptedUnit {
    pub qualified: String,
    pub name: String,
    pub behavior: Behavior,
    pub counters: Arc<Counters>,
}

/// A normally behaving unit.
pub(crate) fn unit(qualified: &str, name: &str) -> ScriptedUnit {
    ScriptedUnit {
        qualified: qualified.to_string(),
        name: name.to_string(),
        behavior: Behavior::Normal,
        counters: Arc::default(),
    }
}

impl ScriptedUnit {
    pub fn behaving(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }
}

struct ScriptedPlugin {
    name: String,
    behavior: Behavior,
    counters: Arc<Counters>,
}

impl Plugin for ScriptedPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> anyhow::Result<()> {
        match self.behavior {
            Behavior::FailStart => anyhow::bail!("refusing to start"),
            Behavior::PanicOnStart => panic!("start exploded"),
            Behavior::SlowStart(delay) => std::thread::sleep(delay),
            _ => {}
        }
        self.counters.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        match self.behavior {
            Behavior::FailStop => anyhow::bail!("refusing to stop"),
            Behavior::SlowStop(delay) => std::thread::sleep(delay),
            _ => {}
        }
        self.counters.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for ScriptedPlugin {
    fn drop(&mut self) {
        self.counters.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

struct ScriptedContext {
    id: ContextId,
    archive: PathBuf,
    units: Vec<ScriptedUnit>,
    closed: bool,
    fail_close: bool,
    closes: Arc<AtomicUsize>,
}

impl LoadingContext for ScriptedContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn archive(&self) -> &Path {
        &self.archive
    }

    fn units(&self) -> Vec<String> {
        self.units.iter().map(|u| u.qualified.clone()).collect()
    }

    fn instantiate(&self, unit: &str) -> PluginResult<Box<dyn Plugin>> {
        let scripted = self.units.iter().find(|u| u.qualified == unit).ok_or_else(|| {
            PluginError::UnitInstantiation {
                archive: self.archive.clone(),
                unit: unit.to_string(),
                reason: "not declared".to_string(),
            }
        })?;

        if scripted.behavior == Behavior::PanicOnCreate {
            panic!("constructor exploded");
        }
        scripted.counters.created.fetch_add(1, Ordering::SeqCst);

        let name =
            if scripted.behavior == Behavior::EmptyName { String::new() } else { scripted.name.clone() };
        Ok(Box::new(ScriptedPlugin {
            name,
            behavior: scripted.behavior,
            counters: Arc::clone(&scripted.counters),
        }))
    }

    fn close(&mut self) -> PluginResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(PluginError::ArchiveLoad {
                archive: self.archive.clone(),
                reason: "close failed".to_string(),
            });
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Factory serving scripted archives by file name.
#[derive(Default)]
pub(crate) struct ScriptedFactory {
    archives: Mutex<HashMap<String, Vec<ScriptedUnit>>>,
    opened: Mutex<Vec<(PathBuf, ContextId)>>,
    closes: Arc<AtomicUsize>,
    fail_close: bool,
    pinned: bool,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_archive(self, file_name: &str, units: Vec<ScriptedUnit>) -> Self {
        self.archives.lock().insert(file_name.to_string(), units);
        self
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    /// Archives stay mapped after their contexts are closed.
    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }

    /// Every context opened so far, with its archive.
    pub fn opened(&self) -> Vec<(PathBuf, ContextId)> {
        self.opened.lock().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl ContextFactory for ScriptedFactory {
    fn open(&self, archive: &Path) -> PluginResult<Box<dyn LoadingContext>> {
        let file_name =
            archive.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let units = self.archives.lock().get(&file_name).cloned().ok_or_else(|| {
            PluginError::ArchiveLoad {
                archive: archive.to_path_buf(),
                reason: "not a plugin library".to_string(),
            }
        })?;

        let id = ContextId::next();
        self.opened.lock().push((archive.to_path_buf(), id));

        Ok(Box::new(ScriptedContext {
            id,
            archive: archive.to_path_buf(),
            units,
            closed: false,
            fail_close: self.fail_close,
            closes: Arc::clone(&self.closes),
        }))
    }

    fn is_resident(&self, _archive: &Path) -> bool {
        self.pinned
    }
}

/// Write empty archive files into `dir`.
pub(crate) fn touch(dir: &Path, names: &[&str]) {
    for name in names {
        std::fs::write(dir.join(name), b"archive").unwrap();
    }
}
