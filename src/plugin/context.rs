//! Isolated loading contexts.
//!
//! A loading context resolves and instantiates the units of exactly one
//! archive. The native implementation maps each context to its own
//! `libloading::Library` handle; closing the context closes that handle.

#![allow(unsafe_code)]

use std::path::{Path, PathBuf};

use libloading::{Library, Symbol};

use super::{
    ContextId, Plugin, PluginDeclaration, PluginError, PluginFactory, PluginResult,
    UnitRegistrar, ENTRY_SYMBOL, PLUGIN_ABI_VERSION,
};

/// A scoped loader for the units of a single archive.
pub trait LoadingContext: Send {
    /// Unique handle of this context.
    fn id(&self) -> ContextId;

    /// Archive this context was opened on.
    fn archive(&self) -> &Path;

    /// Fully-qualified names of the units the archive declares.
    fn units(&self) -> Vec<String>;

    /// Construct one instance of `unit`.
    fn instantiate(&self, unit: &str) -> PluginResult<Box<dyn Plugin>>;

    /// Release the context. Closing an already closed context is a no-op.
    fn close(&mut self) -> PluginResult<()>;

    /// Whether `close` has been called.
    fn is_closed(&self) -> bool;
}

/// Opens a fresh loading context for an archive.
pub trait ContextFactory: Send + Sync {
    /// Open `archive`. Every call yields a new, unshared context.
    fn open(&self, archive: &Path) -> PluginResult<Box<dyn LoadingContext>>;

    /// Whether the code of `archive` is still mapped although every context
    /// opened on it has been closed.
    ///
    /// While it is, opening the path again yields the old image, not the
    /// file currently on disk.
    fn is_resident(&self, _archive: &Path) -> bool {
        false
    }
}

/// Opens archives as native shared libraries.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeContextFactory;

impl NativeContextFactory {
    /// Create a new factory.
    pub fn new() -> Self {
        Self
    }
}

impl ContextFactory for NativeContextFactory {
    fn open(&self, archive: &Path) -> PluginResult<Box<dyn LoadingContext>> {
        NativeContext::open(archive).map(|ctx| Box::new(ctx) as Box<dyn LoadingContext>)
    }

    // A closed library can stay mapped: glibc pins a library once it has
    // registered thread-local destructors, which any thread spawned by Rust
    // code does.
    #[cfg(unix)]
    fn is_resident(&self, archive: &Path) -> bool {
        use libloading::os::unix::Library as UnixLibrary;

        // SAFETY: With RTLD_NOLOAD nothing is mapped and no initializer runs;
        // the call only takes another reference to an already loaded image,
        // which is released again when the handle drops.
        unsafe { UnixLibrary::open(Some(archive), libc::RTLD_NOLOAD | libc::RTLD_LAZY) }.is_ok()
    }

    #[cfg(windows)]
    fn is_resident(&self, archive: &Path) -> bool {
        libloading::os::windows::Library::open_already_loaded(archive).is_ok()
    }
}

/// Collects the units a library registers.
#[derive(Default)]
struct Registrations {
    units: Vec<(String, PluginFactory)>,
}

impl UnitRegistrar for Registrations {
    fn register_unit(&mut self, unit: &str, factory: PluginFactory) {
        if self.units.iter().any(|(name, _)| name == unit) {
            tracing::warn!(unit, "Unit registered twice, keeping the first registration");
            return;
        }
        self.units.push((unit.to_string(), factory));
    }
}

/// A loading context backed by one native library handle.
pub struct NativeContext {
    id: ContextId,
    archive: PathBuf,
    // Function pointers into `library`; cleared before it is closed.
    units: Vec<(String, PluginFactory)>,
    library: Option<Library>,
}

impl NativeContext {
    /// Load `archive` and collect its unit registrations.
    pub fn open(archive: &Path) -> PluginResult<Self> {
        let load_error =
            |reason: String| PluginError::ArchiveLoad { archive: archive.to_path_buf(), reason };

        // SAFETY: Loading a library runs its initializers. Plugin libraries
        // are trusted code; sandboxing is out of scope.
        let library = unsafe { Library::new(archive) }.map_err(|e| load_error(e.to_string()))?;

        // SAFETY: The symbol is the `PluginDeclaration` static emitted by
        // `declare_plugin!`. The value is copied out while the library is
        // still loaded.
        let declaration: PluginDeclaration = unsafe {
            let symbol: Symbol<*const PluginDeclaration> = library
                .get(ENTRY_SYMBOL)
                .map_err(|e| load_error(format!("missing plugin declaration: {e}")))?;
            let ptr = *symbol;
            if ptr.is_null() {
                return Err(load_error("plugin declaration is null".to_string()));
            }
            *ptr
        };

        if declaration.abi_version != PLUGIN_ABI_VERSION {
            return Err(load_error(format!(
                "abi version mismatch: plugin={}, host={}",
                declaration.abi_version, PLUGIN_ABI_VERSION
            )));
        }

        // Panics are caught inside the library; one unwinding out of it
        // could not be caught here.
        let mut registrations = Registrations::default();
        (declaration.register)(&mut registrations)
            .map_err(|reason| load_error(format!("registration failed: {reason}")))?;

        let id = ContextId::next();
        tracing::debug!(
            archive = %archive.display(),
            context = %id,
            units = registrations.units.len(),
            "Opened loading context"
        );

        Ok(Self {
            id,
            archive: archive.to_path_buf(),
            units: registrations.units,
            library: Some(library),
        })
    }
}

impl LoadingContext for NativeContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn archive(&self) -> &Path {
        &self.archive
    }

    fn units(&self) -> Vec<String> {
        self.units.iter().map(|(name, _)| name.clone()).collect()
    }

    fn instantiate(&self, unit: &str) -> PluginResult<Box<dyn Plugin>> {
        let instantiation_error = |reason: &str| PluginError::UnitInstantiation {
            archive: self.archive.clone(),
            unit: unit.to_string(),
            reason: reason.to_string(),
        };

        if self.library.is_none() {
            return Err(instantiation_error("loading context is closed"));
        }

        let factory = self
            .units
            .iter()
            .find_map(|(name, factory)| (name == unit).then_some(*factory))
            .ok_or_else(|| instantiation_error("unit is not declared by the archive"))?;

        factory().map_err(|reason| instantiation_error(&reason))
    }

    fn close(&mut self) -> PluginResult<()> {
        let Some(library) = self.library.take() else {
            return Ok(());
        };
        self.units.clear();

        library.close().map_err(|e| PluginError::ArchiveLoad {
            archive: self.archive.clone(),
            reason: format!("failed to close library: {e}"),
        })?;

        tracing::debug!(archive = %self.archive.display(), context = %self.id, "Closed loading context");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.library.is_none()
    }
}

impl std::fmt::Debug for NativeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeContext")
            .field("id", &self.id)
            .field("archive", &self.archive)
            .field("units", &self.units.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_corrupt_archive_is_archive_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("corrupt.so");
        std::fs::write(&path, b"definitely not a shared library").unwrap();

        let result = NativeContextFactory::new().open(&path);
        match result {
            Err(PluginError::ArchiveLoad { archive, .. }) => assert_eq!(archive, path),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("corrupt archive opened"),
        }
    }

    #[test]
    fn test_missing_archive_is_archive_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("missing.so");

        let result = NativeContextFactory::new().open(&path);
        assert!(matches!(result, Err(PluginError::ArchiveLoad { .. })));
    }

    #[test]
    fn test_registrations_ignore_duplicates() {
        fn make() -> Result<Box<dyn Plugin>, String> {
            Err("never called".to_string())
        }

        let mut registrations = Registrations::default();
        registrations.register_unit("a::A", make);
        registrations.register_unit("a::A", make);
        registrations.register_unit("a::B", make);

        assert_eq!(registrations.units.len(), 2);
    }
}
