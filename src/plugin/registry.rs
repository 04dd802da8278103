//! Plugin registry.
//!
//! The registry is the single owner of every loaded [`PluginUnit`] and the
//! authority on its lifecycle state. All access goes through one
//! `parking_lot::Mutex`; the lock is only ever held for bookkeeping, never
//! across a plugin call, a filesystem read or an `.await`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tokio::sync::oneshot::{self, error::TryRecvError};

use super::{
    ArchiveRecord, ContextId, LifecycleOp, LoadingContext, Plugin, PluginError, PluginId,
    PluginResult, PluginSnapshot, UnitState,
};

/// Result of one start/stop call, carrying the instance back to its unit.
pub(crate) struct CallOutcome {
    pub instance: Box<dyn Plugin>,
    pub result: Result<(), String>,
}

/// What is currently happening to a unit's instance.
enum CallSlot {
    Idle,
    InFlight(LifecycleOp),
    /// The call outlived its timeout; the instance is still on the call thread.
    Stalled { op: LifecycleOp, outcome: oneshot::Receiver<CallOutcome> },
}

impl CallSlot {
    fn op(&self) -> Option<LifecycleOp> {
        match self {
            Self::Idle => None,
            Self::InFlight(op) | Self::Stalled { op, .. } => Some(*op),
        }
    }
}

/// One instantiated plugin together with the context that loaded it.
pub struct PluginUnit {
    // Dropped before `context`, whose library holds the instance's code.
    instance: Option<Box<dyn Plugin>>,
    slot: CallSlot,
    context: Option<Box<dyn LoadingContext>>,
    id: PluginId,
    name: String,
    state: UnitState,
}

impl PluginUnit {
    /// A unit found in an archive but not yet instantiated.
    pub fn discovered(id: PluginId, context: Box<dyn LoadingContext>) -> Self {
        Self {
            instance: None,
            slot: CallSlot::Idle,
            context: Some(context),
            name: id.unit.clone(),
            id,
            state: UnitState::Discovered,
        }
    }

    /// Attach the constructed instance, moving the unit to Loaded.
    pub fn attach(&mut self, instance: Box<dyn Plugin>, name: String) -> PluginResult<()> {
        self.transition(UnitState::Loaded)?;
        self.instance = Some(instance);
        self.name = name;
        Ok(())
    }

    pub fn id(&self) -> &PluginId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    /// Handle of the owned loading context, if not yet released.
    pub fn context_id(&self) -> Option<ContextId> {
        self.context.as_ref().map(|c| c.id())
    }

    /// Whether a call is outstanding.
    pub fn is_busy(&self) -> bool {
        !matches!(self.slot, CallSlot::Idle)
    }

    pub fn snapshot(&self) -> PluginSnapshot {
        PluginSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            state: self.state,
            context: self.context_id(),
            busy: self.is_busy(),
        }
    }

    fn transition(&mut self, to: UnitState) -> PluginResult<()> {
        if !self.state.can_transition_to(to) {
            return Err(PluginError::InvalidTransition { id: self.id.clone(), from: self.state, to });
        }
        self.state = to;
        Ok(())
    }

    /// Put the instance back and commit the transition if the call succeeded.
    fn settle(&mut self, op: LifecycleOp, outcome: CallOutcome) -> PluginResult<()> {
        self.instance = Some(outcome.instance);
        self.slot = CallSlot::Idle;

        match outcome.result {
            Ok(()) => self.transition(op.target_state()),
            Err(reason) => Err(PluginError::Lifecycle {
                id: self.id.clone(),
                name: self.name.clone(),
                op,
                reason,
            }),
        }
    }
}

impl Drop for PluginUnit {
    fn drop(&mut self) {
        drop(self.instance.take());

        if let CallSlot::Stalled { outcome, .. } = &mut self.slot {
            match outcome.try_recv() {
                // The late instance goes before the context that holds its code.
                Ok(late) => drop(late),
                Err(TryRecvError::Empty) => {
                    tracing::warn!(
                        plugin = %self.id,
                        "Plugin call still running, leaking its loading context"
                    );
                    std::mem::forget(self.context.take());
                    return;
                }
                Err(TryRecvError::Closed) => {}
            }
        }

        self.slot = CallSlot::Idle;
        drop(self.context.take());
    }
}

impl std::fmt::Debug for PluginUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginUnit")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("context", &self.context_id())
            .field("busy", &self.is_busy())
            .finish()
    }
}

/// An archive the registry has seen, with its load outcome.
#[derive(Debug, Clone)]
pub struct TrackedArchive {
    /// Last scanned record, with the identities loaded from it.
    pub record: ArchiveRecord,
    /// Archive-level load failure; retried only once the file changes.
    pub failed: bool,
    /// Changed on disk while its units were live.
    pub stale: bool,
    /// Every unit was unloaded but the library is still mapped, so only the
    /// version already in memory can be loaded from this path.
    pub resident: bool,
}

/// How a freshly scanned archive relates to what the registry knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveDisposition {
    /// Never seen.
    New,
    /// Seen with the same modification time.
    Unchanged,
    /// Modification time differs. `live` if units from it are still loaded.
    Changed { live: bool },
    /// Modification time differs, but the previous version is still mapped
    /// and would be handed out again.
    Resident,
}

/// An instance taken out of its unit for a start/stop call.
pub(crate) struct Claim {
    pub id: PluginId,
    pub name: String,
    pub instance: Box<dyn Plugin>,
}

/// Units claimed by one controller sweep.
pub(crate) struct Claims {
    pub claimed: Vec<Claim>,
    /// Eligible units skipped because a call is outstanding.
    pub skipped: Vec<PluginId>,
}

/// Resources taken out of a unit for unloading.
pub(crate) struct UnloadClaim {
    pub name: String,
    pub instance: Option<Box<dyn Plugin>>,
    pub context: Option<Box<dyn LoadingContext>>,
}

/// A stalled call whose late outcome was applied.
pub(crate) struct Reclaimed {
    pub id: PluginId,
    pub op: LifecycleOp,
    pub result: PluginResult<()>,
}

#[derive(Default)]
struct Inner {
    units: HashMap<PluginId, PluginUnit>,
    archives: HashMap<PathBuf, TrackedArchive>,
}

impl Inner {
    fn has_live_units(&self, record: &ArchiveRecord) -> bool {
        record
            .unit_identities
            .iter()
            .any(|id| self.units.get(id).is_some_and(|u| u.state.is_live()))
    }
}

/// Concurrency-safe collection of plugin units keyed by identity.
#[derive(Default)]
pub struct PluginRegistry {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PluginRegistry")
            .field("units", &inner.units.len())
            .field("archives", &inner.archives.len())
            .finish()
    }
}

impl PluginRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert every candidate whose identity is not yet registered.
    ///
    /// Candidates for identities already present are discarded, so a live
    /// unit is never replaced. Returns the identities actually inserted.
    pub fn merge(&self, candidates: Vec<PluginUnit>) -> Vec<PluginId> {
        let mut inserted = Vec::new();
        let mut rejected = Vec::new();

        {
            let mut inner = self.inner.lock();
            for candidate in candidates {
                if candidate.state != UnitState::Loaded || inner.units.contains_key(&candidate.id) {
                    rejected.push(candidate);
                    continue;
                }
                inserted.push(candidate.id.clone());
                inner.units.insert(candidate.id.clone(), candidate);
            }
        }

        for duplicate in &rejected {
            tracing::debug!(plugin = %duplicate.id, "Ignoring already registered plugin");
        }
        // Dropped outside the lock: dropping runs plugin code.
        drop(rejected);

        inserted
    }

    /// Consistent snapshot of every unit, sorted by identity.
    pub fn all(&self) -> Vec<PluginSnapshot> {
        let mut snapshots: Vec<_> =
            self.inner.lock().units.values().map(PluginUnit::snapshot).collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// Snapshot of one unit.
    pub fn get(&self, id: &PluginId) -> Option<PluginSnapshot> {
        self.inner.lock().units.get(id).map(PluginUnit::snapshot)
    }

    pub fn contains(&self, id: &PluginId) -> bool {
        self.inner.lock().units.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().units.is_empty()
    }

    /// Identities of units in `state`, sorted.
    pub fn ids_in_state(&self, state: UnitState) -> Vec<PluginId> {
        let mut ids: Vec<_> = self
            .inner
            .lock()
            .units
            .values()
            .filter(|u| u.state == state)
            .map(|u| u.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Delete an unloaded unit.
    ///
    /// Returns the archive record if this was the archive's last unit; the
    /// archive is then forgotten so the next scan rediscovers it.
    pub fn remove(&self, id: &PluginId) -> PluginResult<Option<ArchiveRecord>> {
        let (removed, released) = {
            let mut inner = self.inner.lock();
            let unit = inner.units.get(id).ok_or_else(|| PluginError::NotFound(id.clone()))?;
            if unit.state != UnitState::Unloaded {
                return Err(PluginError::InvalidState {
                    id: id.clone(),
                    op: LifecycleOp::Unload,
                    state: unit.state,
                });
            }
            let removed = inner.units.remove(id);

            let emptied = inner.archives.get_mut(&id.archive).is_some_and(|tracked| {
                tracked.record.unit_identities.remove(id);
                tracked.record.unit_identities.is_empty() && !tracked.failed
            });
            let released = if emptied {
                inner.archives.remove(&id.archive).map(|tracked| tracked.record)
            } else {
                None
            };
            (removed, released)
        };
        drop(removed);
        Ok(released)
    }

    /// Track a released archive whose library is still mapped.
    ///
    /// The same version may be loaded again; a changed file is reported as
    /// [`ArchiveDisposition::Resident`] instead.
    pub fn keep_resident(&self, record: ArchiveRecord) {
        let mut inner = self.inner.lock();
        if inner.archives.contains_key(&record.path) {
            return;
        }
        let record = ArchiveRecord::new(record.path, record.last_modified);
        inner
            .archives
            .insert(record.path.clone(), TrackedArchive { record, failed: false, stale: false, resident: true });
    }

    /// Compare a scanned archive with what is already known.
    pub fn disposition(&self, record: &ArchiveRecord) -> ArchiveDisposition {
        let inner = self.inner.lock();
        match inner.archives.get(&record.path) {
            None => ArchiveDisposition::New,
            Some(tracked) if tracked.resident => {
                if tracked.record.last_modified == record.last_modified {
                    ArchiveDisposition::New
                } else {
                    ArchiveDisposition::Resident
                }
            }
            Some(tracked) if tracked.record.last_modified == record.last_modified => {
                ArchiveDisposition::Unchanged
            }
            Some(tracked) => ArchiveDisposition::Changed { live: inner.has_live_units(&tracked.record) },
        }
    }

    /// Remember the outcome of loading an archive.
    pub fn record_archive(&self, record: ArchiveRecord, failed: bool) {
        let path = record.path.clone();
        self.inner
            .lock()
            .archives
            .insert(path, TrackedArchive { record, failed, stale: false, resident: false });
    }

    /// Flag a known archive as changed on disk. Returns `true` the first time.
    pub fn mark_stale(&self, path: &Path) -> bool {
        self.inner
            .lock()
            .archives
            .get_mut(path)
            .is_some_and(|tracked| !std::mem::replace(&mut tracked.stale, true))
    }

    /// Drop records of archives that vanished and have no live units.
    ///
    /// Resident archives are kept: a file reappearing under the same path
    /// would otherwise be opened as the old image.
    pub fn forget_missing(&self, present: &HashSet<PathBuf>) -> Vec<PathBuf> {
        let mut inner = self.inner.lock();
        let missing: Vec<PathBuf> = inner
            .archives
            .iter()
            .filter(|(path, tracked)| {
                !present.contains(*path) && !tracked.resident && !inner.has_live_units(&tracked.record)
            })
            .map(|(path, _)| path.clone())
            .collect();

        for path in &missing {
            inner.archives.remove(path);
        }
        missing
    }

    /// Every tracked archive, sorted by path.
    pub fn archives(&self) -> Vec<TrackedArchive> {
        let mut archives: Vec<_> = self.inner.lock().archives.values().cloned().collect();
        archives.sort_by(|a, b| a.record.path.cmp(&b.record.path));
        archives
    }

    /// Claim every idle unit `op` applies to, taking its instance out.
    ///
    /// The whole sweep is committed under one lock acquisition, so two
    /// concurrent sweeps never claim the same unit.
    pub(crate) fn claim(&self, op: LifecycleOp) -> Claims {
        let mut claims = Claims { claimed: Vec::new(), skipped: Vec::new() };
        let mut inner = self.inner.lock();

        for unit in inner.units.values_mut() {
            let eligible = match op {
                LifecycleOp::Start => unit.state.is_startable(),
                LifecycleOp::Stop => unit.state == UnitState::Running,
                LifecycleOp::Unload => false,
            };
            if !eligible {
                continue;
            }
            if unit.is_busy() {
                claims.skipped.push(unit.id.clone());
                continue;
            }
            let Some(instance) = unit.instance.take() else {
                tracing::warn!(plugin = %unit.id, "Plugin instance was lost, skipping");
                claims.skipped.push(unit.id.clone());
                continue;
            };

            unit.slot = CallSlot::InFlight(op);
            claims.claimed.push(Claim { id: unit.id.clone(), name: unit.name.clone(), instance });
        }

        claims.skipped.sort();
        claims
    }

    /// Return a claimed instance and commit or discard its transition.
    pub(crate) fn complete(
        &self,
        id: &PluginId,
        op: LifecycleOp,
        outcome: CallOutcome,
    ) -> PluginResult<()> {
        let mut inner = self.inner.lock();
        match inner.units.get_mut(id) {
            Some(unit) => unit.settle(op, outcome),
            None => Err(PluginError::NotFound(id.clone())),
        }
    }

    /// Park a timed-out call; the unit keeps its state and stays busy.
    pub(crate) fn stall(&self, id: &PluginId, op: LifecycleOp, outcome: oneshot::Receiver<CallOutcome>) {
        if let Some(unit) = self.inner.lock().units.get_mut(id) {
            unit.slot = CallSlot::Stalled { op, outcome };
        }
    }

    /// Mark a claimed call as finished without its instance.
    pub(crate) fn lose(&self, id: &PluginId) {
        if let Some(unit) = self.inner.lock().units.get_mut(id) {
            unit.slot = CallSlot::Idle;
        }
    }

    /// Apply the outcome of every stalled call that has since returned.
    pub(crate) fn reclaim_stalled(&self) -> Vec<Reclaimed> {
        let mut reclaimed = Vec::new();
        let mut inner = self.inner.lock();

        for unit in inner.units.values_mut() {
            let CallSlot::Stalled { op, outcome } = &mut unit.slot else {
                continue;
            };
            let op = *op;

            let result = match outcome.try_recv() {
                Ok(late) => unit.settle(op, late),
                Err(TryRecvError::Empty) => continue,
                Err(TryRecvError::Closed) => {
                    unit.slot = CallSlot::Idle;
                    Err(PluginError::Lifecycle {
                        id: unit.id.clone(),
                        name: unit.name.clone(),
                        op,
                        reason: "call aborted without a result".to_string(),
                    })
                }
            };
            reclaimed.push(Reclaimed { id: unit.id.clone(), op, result });
        }

        reclaimed
    }

    /// Take a stopped unit's instance and context for unloading.
    pub(crate) fn claim_unload(&self, id: &PluginId) -> PluginResult<UnloadClaim> {
        let mut inner = self.inner.lock();
        let unit = inner.units.get_mut(id).ok_or_else(|| PluginError::NotFound(id.clone()))?;

        if let Some(op) = unit.slot.op() {
            return Err(PluginError::Busy { id: id.clone(), op });
        }
        if unit.state != UnitState::Stopped {
            return Err(PluginError::InvalidState {
                id: id.clone(),
                op: LifecycleOp::Unload,
                state: unit.state,
            });
        }

        unit.slot = CallSlot::InFlight(LifecycleOp::Unload);
        Ok(UnloadClaim {
            name: unit.name.clone(),
            instance: unit.instance.take(),
            context: unit.context.take(),
        })
    }

    /// Mark an unload as done. The unit becomes Unloaded and removable.
    pub(crate) fn finish_unload(&self, id: &PluginId) -> PluginResult<()> {
        let mut inner = self.inner.lock();
        let unit = inner.units.get_mut(id).ok_or_else(|| PluginError::NotFound(id.clone()))?;
        unit.slot = CallSlot::Idle;
        unit.transition(UnitState::Unloaded)
    }
}
