//! Native plugin system.
//!
//! Discovers plugin libraries in a directory, loads each unit they declare in
//! its own loading context, starts and stops the units on command, and
//! releases the loading context once a unit is unloaded.
//!
//! # Architecture
//!
//! ```text
//! scanner -> loader -> registry -> controller (start/stop)
//!                                     \-> unloader (stop/reload)
//! ```
//!
//! - [`scanner::scan`] lists archive files without opening them.
//! - [`IsolatedLoader`] opens a fresh [`LoadingContext`] per archive and
//!   instantiates every declared unit.
//! - [`PluginRegistry`] owns each [`PluginUnit`] and its lifecycle state.
//! - [`LifecycleController`] runs `start`/`stop` outside the registry lock,
//!   bounded by a timeout.
//! - [`Unloader`] closes the context of stopped units after a grace period.
//! - [`PluginManager`] exposes the commands used by the CLI.
//!
//! # Writing a plugin
//!
//! A plugin is a `cdylib` that implements [`Plugin`] and exports its units
//! with [`declare_plugin!`](crate::declare_plugin). The macro wraps each unit
//! so that panics are caught inside the library; an unwind crossing into the
//! host would abort it.

mod context;
mod controller;
mod error;
mod guard;
mod loader;
mod manager;
mod registry;
pub mod scanner;
mod types;
mod unloader;

#[cfg(test)]
pub(crate) mod testing;

pub use context::{ContextFactory, LoadingContext, NativeContext, NativeContextFactory};
pub use controller::{LifecycleController, LifecycleReport};
pub use error::{ErrorKind, PluginError, PluginResult};
pub use guard::{guard, Guarded};
pub use loader::{ArchiveLoad, IsolatedLoader};
pub use manager::{spawn_periodic_rescan, LoadReport, PluginManager};
pub use registry::{ArchiveDisposition, PluginRegistry, PluginUnit, TrackedArchive};
pub use types::{
    ArchiveRecord, ContextId, LifecycleOp, Plugin, PluginDeclaration, PluginFactory, PluginId,
    PluginSnapshot, UnitRegistrar, UnitState, DEFAULT_ARCHIVE_EXTENSION, ENTRY_SYMBOL,
    PLUGIN_ABI_VERSION,
};
pub use unloader::Unloader;
