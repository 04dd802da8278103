//! Plugin system error types.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use super::{LifecycleOp, PluginId, UnitState};

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;

/// Errors that can occur during plugin operations.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The plugin directory is not a directory.
    #[error("Plugin directory is not a directory: {0}")]
    NotADirectory(PathBuf),

    /// An archive could not be opened or its loading context created.
    #[error("Failed to load archive {archive}: {reason}")]
    ArchiveLoad { archive: PathBuf, reason: String },

    /// A unit inside an archive could not be resolved or instantiated.
    #[error("Failed to instantiate unit '{unit}' from {archive}: {reason}")]
    UnitInstantiation { archive: PathBuf, unit: String, reason: String },

    /// A plugin's start/stop call failed.
    #[error("Plugin '{name}' ({id}) failed to {op}: {reason}")]
    Lifecycle { id: PluginId, name: String, op: LifecycleOp, reason: String },

    /// A plugin's start/stop call did not return in time.
    #[error("Plugin '{name}' ({id}) timed out after {after:?} during {op}")]
    Timeout { id: PluginId, name: String, op: LifecycleOp, after: Duration },

    /// Releasing a loading context failed.
    #[error("Failed to release loading context of {id}: {reason}")]
    Unload { id: PluginId, reason: String },

    /// Operation not valid in the unit's current state.
    #[error("Cannot {op} plugin {id} while it is {state}")]
    InvalidState { id: PluginId, op: LifecycleOp, state: UnitState },

    /// The unit has a start/stop/unload call outstanding.
    #[error("Plugin {id} is busy with an outstanding {op}")]
    Busy { id: PluginId, op: LifecycleOp },

    /// A state transition the lifecycle does not allow.
    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition { id: PluginId, from: UnitState, to: UnitState },

    /// No unit with this identity.
    #[error("Plugin not found: {0}")]
    NotFound(PluginId),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse error classes used for reporting and containment decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Fatal to the subsystem.
    Configuration,
    /// One archive skipped.
    ArchiveLoad,
    /// One unit skipped.
    UnitInstantiation,
    /// One start/stop failed; state not advanced.
    Lifecycle,
    /// One context release failed.
    Unload,
    /// Operation rejected before anything ran.
    Precondition,
}

impl PluginError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::NotADirectory(_) => ErrorKind::Configuration,
            Self::ArchiveLoad { .. } | Self::Io(_) => ErrorKind::ArchiveLoad,
            Self::UnitInstantiation { .. } => ErrorKind::UnitInstantiation,
            Self::Lifecycle { .. } | Self::Timeout { .. } => ErrorKind::Lifecycle,
            Self::Unload { .. } => ErrorKind::Unload,
            Self::InvalidState { .. }
            | Self::Busy { .. }
            | Self::InvalidTransition { .. }
            | Self::NotFound(_) => ErrorKind::Precondition,
        }
    }

    /// Only configuration errors halt the subsystem.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }

    /// Identity of the plugin unit the error is about, if any.
    pub fn plugin_id(&self) -> Option<&PluginId> {
        match self {
            Self::Lifecycle { id, .. }
            | Self::Timeout { id, .. }
            | Self::Unload { id, .. }
            | Self::InvalidState { id, .. }
            | Self::Busy { id, .. }
            | Self::InvalidTransition { id, .. }
            | Self::NotFound(id) => Some(id),
            _ => None,
        }
    }
}

/// Render a caught panic payload as text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
