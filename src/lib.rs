#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::format_push_string)]

//! # pluginhost
//!
//! Dynamic plugin lifecycle manager - discover, load, start, stop and unload
//! native plugin libraries at runtime.
//!
//! Plugins are shared libraries dropped into a directory. Each library
//! declares one or more plugin units; every unit is loaded in its own loading
//! context, started and stopped on command, and unloaded again once stopped.
//!
//! ## Features
//!
//! - **Isolated loading**: one library handle per unit, released on unload
//! - **Contained failures**: a broken archive or plugin never takes down the rest
//! - **Rescanning**: new archives are picked up while the host keeps running
//! - **Bounded calls**: `start`/`stop` run off the registry lock with a timeout
//!
//! ## Quick Start
//!
//! ```bash
//! # List archives in ./plugins
//! pluginhost scan
//!
//! # Interactive mode: load, start, stop, reload, unload, list, exit
//! pluginhost run --dir ./plugins
//! ```

#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow common patterns that are intentional in this codebase
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::redundant_closure_for_method_calls)]

pub mod config;
pub mod plugin;

// Re-export commonly used types
pub use config::{Config, LoggingConfig, PluginConfig};
pub use plugin::{
    LifecycleReport, LoadReport, Plugin, PluginError, PluginId, PluginManager, PluginResult,
    PluginSnapshot, UnitState,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "pluginhost";
