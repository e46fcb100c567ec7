use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::registry::CarbonStat;

#[derive(Default)]
struct Shutdown {
    requested: Mutex<bool>,
    signal: Condvar,
}

/// Background thread that flushes a [`CarbonStat`] on a fixed interval.
///
/// The thread runs until [`shutdown`](Flusher::shutdown) is called or the `Flusher` is dropped, and performs one final
/// flush before exiting so that nothing recorded before shutdown is left behind.
pub struct Flusher {
    stat: CarbonStat,
    shutdown: Arc<Shutdown>,
    handle: Option<JoinHandle<()>>,
}

impl Flusher {
    pub(crate) fn spawn(stat: CarbonStat, interval: Duration) -> io::Result<Self> {
        let shutdown = Arc::new(Shutdown::default());

        let handle = {
            let stat = stat.clone();
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("metrics-exporter-carbon-flusher".to_string())
                .spawn(move || run(&stat, &shutdown, interval))?
        };

        Ok(Self { stat, shutdown, handle: Some(handle) })
    }

    /// Returns the registry being flushed.
    pub fn stat(&self) -> &CarbonStat {
        &self.stat
    }

    /// Stops the background thread, waiting for its final flush to complete.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        *self.shutdown.requested.lock() = true;
        self.shutdown.signal.notify_all();

        if handle.join().is_err() {
            debug!("Flusher thread panicked before shutting down.");
        }
    }
}

impl Drop for Flusher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(stat: &CarbonStat, shutdown: &Shutdown, interval: Duration) {
    let mut next_flush = Instant::now() + interval;
    loop {
        // Wait until our target flush deadline, or until we're asked to shut down.
        //
        // If the previous flush took longer than the flush interval, we won't wait at all.
        let stopping = {
            let mut requested = shutdown.requested.lock();
            while !*requested {
                let Some(remaining) = next_flush.checked_duration_since(Instant::now()) else {
                    break;
                };
                if remaining.is_zero() {
                    break;
                }
                shutdown.signal.wait_for(&mut requested, remaining);
            }
            *requested
        };

        next_flush = Instant::now() + interval;

        let outcome = stat.flush();
        debug!(?outcome, "Periodic flush finished.");

        if stopping {
            break;
        }
    }
}
