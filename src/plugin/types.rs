//! Core plugin types.
//!
//! Everything a plugin library and the host agree on lives here: the
//! capability contract, the registration entry point, and the identities and
//! states the registry tracks.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// The capability contract every plugin unit implements.
///
/// The host only ever calls `start` and `stop` in alternation; the controller
/// guarantees `start` is not invoked twice without a `stop` in between.
pub trait Plugin: Send {
    /// Human-readable plugin name. Must not be empty.
    fn name(&self) -> &str;

    /// Start the plugin's work.
    fn start(&mut self) -> anyhow::Result<()>;

    /// Stop the plugin's work.
    fn stop(&mut self) -> anyhow::Result<()>;
}

/// Constructor for one plugin unit, exported by a plugin library.
///
/// Panics inside the library are caught there and returned as `Err`.
pub type PluginFactory = fn() -> Result<Box<dyn Plugin>, String>;

/// Receives the units a plugin library declares.
pub trait UnitRegistrar {
    /// Register a unit under its fully-qualified name.
    fn register_unit(&mut self, unit: &str, factory: PluginFactory);
}

/// The well-known static every plugin library exports.
///
/// Host and plugin must be built by the same compiler; `abi_version` only
/// guards against libraries built for a different layout of this struct.
#[derive(Clone, Copy)]
pub struct PluginDeclaration {
    /// Must equal [`PLUGIN_ABI_VERSION`].
    pub abi_version: u32,
    /// Registers every unit contained in the library.
    pub register: fn(&mut dyn UnitRegistrar) -> Result<(), String>,
}

/// Layout tag of [`PluginDeclaration`].
pub const PLUGIN_ABI_VERSION: u32 = 2;

/// Name of the exported declaration symbol.
pub const ENTRY_SYMBOL: &[u8] = b"PLUGIN_DECLARATION\0";

/// Archive suffix used when none is configured.
pub const DEFAULT_ARCHIVE_EXTENSION: &str = std::env::consts::DLL_EXTENSION;

/// Export a plugin declaration for the listed unit types.
///
/// Each type must implement [`Plugin`] and [`Default`]. Its fully-qualified
/// type name becomes the unit name. Every entry point the host calls,
/// including registration and the destructor, runs under `catch_unwind`
/// inside the plugin library, so a panicking unit fails only its own call.
///
/// ```ignore
/// #[derive(Default)]
/// struct Alpha;
/// impl pluginhost::plugin::Plugin for Alpha { /* ... */ }
///
/// pluginhost::declare_plugin!(Alpha);
/// ```
#[macro_export]
macro_rules! declare_plugin {
    ($($unit:ty),+ $(,)?) => {
        #[allow(unsafe_code)]
        #[no_mangle]
        pub static PLUGIN_DECLARATION: $crate::plugin::PluginDeclaration =
            $crate::plugin::PluginDeclaration {
                abi_version: $crate::plugin::PLUGIN_ABI_VERSION,
                register: __pluginhost_register_units,
            };

        fn __pluginhost_register_units(
            registrar: &mut dyn $crate::plugin::UnitRegistrar,
        ) -> ::core::result::Result<(), ::std::string::String> {
            $crate::plugin::guard(::core::panic::AssertUnwindSafe(|| {
                $(
                    registrar.register_unit(
                        ::core::any::type_name::<$unit>(),
                        || $crate::plugin::Guarded::<$unit>::create(<$unit as ::core::default::Default>::default),
                    );
                )+
            }))
        }
    };
}

/// Stable identity of a plugin unit: the archive it came from plus the
/// unit's fully-qualified name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PluginId {
    /// Archive path.
    pub archive: PathBuf,
    /// Fully-qualified unit name inside the archive.
    pub unit: String,
}

impl PluginId {
    /// Create a new identity.
    pub fn new(archive: impl Into<PathBuf>, unit: impl Into<String>) -> Self {
        Self { archive: archive.into(), unit: unit.into() }
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.archive.display(), self.unit)
    }
}

/// Handle identifying one isolated loading context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(u64);

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

impl ContextId {
    /// Allocate a process-unique context id.
    pub fn next() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Lifecycle state of a plugin unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitState {
    /// Found in an archive, not yet instantiated.
    Discovered,
    /// Instance constructed, never started.
    Loaded,
    /// `start` succeeded.
    Running,
    /// `stop` succeeded; the loading context is still held.
    Stopped,
    /// Loading context released. Terminal.
    Unloaded,
}

impl UnitState {
    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Discovered -> Loaded -> Running <-> Stopped -> Unloaded.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Discovered, Self::Loaded)
                | (Self::Loaded | Self::Stopped, Self::Running)
                | (Self::Running, Self::Stopped)
                | (Self::Stopped, Self::Unloaded)
        )
    }

    /// Whether `start` applies to a unit in this state.
    pub fn is_startable(self) -> bool {
        matches!(self, Self::Loaded | Self::Stopped)
    }

    /// Whether the unit still owns a loading context.
    pub fn is_live(self) -> bool {
        !matches!(self, Self::Unloaded)
    }

    /// Lowercase display name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Loaded => "loaded",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Unloaded => "unloaded",
        }
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation driven against a plugin unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleOp {
    /// Invoke `start`.
    Start,
    /// Invoke `stop`.
    Stop,
    /// Release the loading context.
    Unload,
}

impl LifecycleOp {
    /// Lowercase verb.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Unload => "unload",
        }
    }

    /// State a unit reaches when the operation succeeds.
    pub fn target_state(self) -> UnitState {
        match self {
            Self::Start => UnitState::Running,
            Self::Stop => UnitState::Stopped,
            Self::Unload => UnitState::Unloaded,
        }
    }
}

impl fmt::Display for LifecycleOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One archive file found by the scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    /// Path of the archive.
    pub path: PathBuf,
    /// Modification time, used for change detection.
    pub last_modified: Option<SystemTime>,
    /// Identities of the units discovered in this archive.
    #[serde(default)]
    pub unit_identities: BTreeSet<PluginId>,
}

impl ArchiveRecord {
    /// Create a record with no known units.
    pub fn new(path: impl Into<PathBuf>, last_modified: Option<SystemTime>) -> Self {
        Self { path: path.into(), last_modified, unit_identities: BTreeSet::new() }
    }

    /// Archive path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name for display.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map_or_else(|| self.path.display().to_string(), |n| n.to_string_lossy().into_owned())
    }
}

/// Point-in-time view of a registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginSnapshot {
    /// Identity of the unit.
    pub id: PluginId,
    /// Name reported by the plugin.
    pub name: String,
    /// Lifecycle state.
    pub state: UnitState,
    /// Loading context, if not yet released.
    pub context: Option<ContextId>,
    /// Whether a start/stop/unload call is outstanding.
    pub busy: bool,
}
