//! Panic guards compiled into plugin libraries.
//!
//! A plugin library links its own copy of `std`, so a panic raised in plugin
//! code cannot be caught by the host: to the host it is a foreign exception
//! and the process aborts. `declare_plugin!` therefore wraps every unit in
//! [`Guarded`], whose methods run `catch_unwind` inside the plugin library and
//! hand failures back as values.

use std::panic::{self, UnwindSafe};

use super::error::panic_message;
use super::Plugin;

/// Run `f`, turning a panic into its rendered message.
#[doc(hidden)]
pub fn guard<R>(f: impl FnOnce() -> R + UnwindSafe) -> Result<R, String> {
    panic::catch_unwind(f).map_err(|payload| format!("panicked: {}", panic_message(payload.as_ref())))
}

/// A plugin unit whose every entry point is guarded against unwinding.
///
/// The name is read once, under the guard, when the unit is constructed.
#[doc(hidden)]
pub struct Guarded<T> {
    inner: Option<T>,
    name: String,
}

impl<T: Plugin + 'static> Guarded<T> {
    /// Construct a unit with `make` and wrap it.
    pub fn create(make: fn() -> T) -> Result<Box<dyn Plugin>, String> {
        let (inner, name) = guard(|| {
            let inner = make();
            let name = inner.name().to_string();
            (inner, name)
        })?;
        Ok(Box::new(Self { inner: Some(inner), name }))
    }

    fn call(&mut self, f: fn(&mut T) -> anyhow::Result<()>) -> anyhow::Result<()> {
        let Some(inner) = self.inner.as_mut() else {
            anyhow::bail!("plugin instance already released");
        };
        guard(panic::AssertUnwindSafe(|| f(inner))).unwrap_or_else(|message| Err(anyhow::anyhow!(message)))
    }
}

impl<T: Plugin + 'static> Plugin for Guarded<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> anyhow::Result<()> {
        self.call(T::start)
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.call(T::stop)
    }
}

impl<T> Drop for Guarded<T> {
    fn drop(&mut self) {
        let inner = self.inner.take();
        // A panicking destructor must not unwind into the host.
        let _ = guard(panic::AssertUnwindSafe(move || drop(inner)));
    }
}
