//! Plugin library for the native loading tests.
//!
//! `Steady` always succeeds, `Boom` panics on its first start, and `Spawner`
//! keeps a worker thread alive between start and stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use pluginhost::plugin::Plugin;

#[derive(Default)]
pub struct Steady;

impl Plugin for Steady {
    fn name(&self) -> &str {
        "Steady"
    }

    fn start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

// One per loaded image.
static BOOM_ARMED: AtomicBool = AtomicBool::new(true);

#[derive(Default)]
pub struct Boom;

impl Plugin for Boom {
    fn name(&self) -> &str {
        "Boom"
    }

    fn start(&mut self) -> anyhow::Result<()> {
        if BOOM_ARMED.swap(false, Ordering::SeqCst) {
            panic!("boom");
        }
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct Spawner {
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Plugin for Spawner {
    fn name(&self) -> &str {
        "Spawner"
    }

    fn start(&mut self) -> anyhow::Result<()> {
        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        self.worker = Some(thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(5));
            }
        }));
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            worker.join().map_err(|_| anyhow::anyhow!("worker panicked"))?;
        }
        Ok(())
    }
}

impl Drop for Spawner {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

pluginhost::declare_plugin!(Steady, Boom, Spawner);
