//! Background flush of stale queues.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, select};

use crate::Result;
use crate::config::SenderConfig;
use crate::flusher::Flusher;
use crate::pending_cache::PendingCache;

/// Name of the scheduler thread.
pub const FLUSH_THREAD_NAME: &str = "cache-flush-thread";

/// Periodically flushes queues that have not been flushed within the
/// configured staleness bound.
///
/// Runs on its own thread until [`FlushScheduler::stop`] is called or the
/// scheduler is dropped. A failing send never stops the scan loop.
#[derive(Debug)]
pub struct FlushScheduler {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl FlushScheduler {
    pub fn start(
        cache: Arc<PendingCache>,
        flusher: Arc<Flusher>,
        config: &SenderConfig,
    ) -> Result<Self> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(0);
        let initial_delay = config.flush_initial_delay;
        let period = config.flush_period;
        let max_staleness = config.max_staleness;

        let handle = std::thread::Builder::new()
            .name(FLUSH_THREAD_NAME.into())
            .spawn(move || {
                flush_loop(&cache, &flusher, stop_rx, initial_delay, period, max_staleness)
            })?;

        tracing::debug!(?period, ?max_staleness, "flush scheduler started");

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the scan loop and wait for the thread to exit. Idempotent.
    pub fn stop(&mut self) {
        // Dropping the sender disconnects the stop channel.
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("flush scheduler thread panicked");
            } else {
                tracing::debug!("flush scheduler stopped");
            }
        }
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn flush_loop(
    cache: &PendingCache,
    flusher: &Flusher,
    stop_rx: Receiver<()>,
    initial_delay: Duration,
    period: Duration,
    max_staleness: Duration,
) {
    let first_tick = crossbeam_channel::after(initial_delay);
    select! {
        recv(stop_rx) -> _ => return,
        recv(first_tick) -> _ => {},
    }

    let ticker = crossbeam_channel::tick(period);
    loop {
        let summary = cache.flush_stale(max_staleness, flusher);
        if summary.flushed > 0 || summary.failed > 0 {
            tracing::debug!(
                data_source = %flusher.data_source(),
                flushed = summary.flushed,
                failed = summary.failed,
                "staleness scan finished"
            );
        }

        select! {
            recv(stop_rx) -> _ => break,
            recv(ticker) -> _ => {},
        }
    }
}
