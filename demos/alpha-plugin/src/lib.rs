//! Sample plugin for pluginhost.
//!
//! Declares two units: `Alpha` runs a background worker that ticks until it
//! is stopped, `Greeter` only prints on start and stop.
//!
//! Build with `cargo build --release` and copy the resulting library into the
//! host's plugin directory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use pluginhost::plugin::Plugin;

/// Ticks once per second on a worker thread.
#[derive(Default)]
pub struct Alpha {
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Plugin for Alpha {
    fn name(&self) -> &str {
        "Alpha"
    }

    fn start(&mut self) -> anyhow::Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);

        let running = Arc::clone(&self.running);
        let worker = thread::Builder::new().name("alpha-worker".to_string()).spawn(move || {
            let mut ticks = 0u64;
            while running.load(Ordering::SeqCst) {
                ticks += 1;
                println!("[Alpha] tick {ticks}");
                thread::sleep(Duration::from_secs(1));
            }
        })?;

        self.worker = Some(worker);
        println!("[Alpha] started");
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            // Must be joined before the library can be unloaded.
            worker.join().map_err(|_| anyhow::anyhow!("alpha worker panicked"))?;
        }
        println!("[Alpha] stopped");
        Ok(())
    }
}

impl Drop for Alpha {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Prints on start and stop.
#[derive(Default)]
pub struct Greeter;

impl Plugin for Greeter {
    fn name(&self) -> &str {
        "Greeter"
    }

    fn start(&mut self) -> anyhow::Result<()> {
        println!("[Greeter] hello");
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        println!("[Greeter] goodbye");
        Ok(())
    }
}

pluginhost::declare_plugin!(Alpha, Greeter);
