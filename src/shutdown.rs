use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::warn;

/// Granularity of interruptible waits.
const SLEEP_SLICE: Duration = Duration::from_millis(250);

/// Blocking wait used for retry backoff and rate-limit courtesy pauses.
pub trait Sleeper {
    /// Waits for `duration`. Returns `false` when the wait was cut short by an
    /// interrupt request.
    fn sleep(&self, duration: Duration) -> bool;
}

/// Cooperative interrupt flag shared between the signal listener and the
/// ingest loop.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Spawns a listener thread that turns the first Ctrl-C into a shutdown
    /// request. A second Ctrl-C exits immediately.
    pub fn listen_for_ctrl_c(&self) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build signal runtime")?;
        let shutdown = self.clone();

        std::thread::Builder::new()
            .name("ctrl-c".to_string())
            .spawn(move || {
                runtime.block_on(async {
                    if tokio::signal::ctrl_c().await.is_err() {
                        return;
                    }
                    warn!("interrupt received; flushing results after the current step");
                    shutdown.request();

                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("second interrupt received; exiting without flush");
                        std::process::exit(130);
                    }
                });
            })
            .context("failed to spawn interrupt listener")?;

        Ok(())
    }
}

impl Sleeper for Shutdown {
    fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_requested() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}
