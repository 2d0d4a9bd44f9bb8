//! Batching queue for downloader input
//!
//! Extraction workers send downloader input over the control plane (`ARIA2`).
//! Payloads are buffered per destination file and appended in batches, either
//! by the periodic timer or explicitly before the download phase starts.
//!
//! A flush swaps the whole pending map for an empty one under the lock, so adds
//! that race with a flush land in the new map. Destinations whose append fails
//! are put back in front of anything added since, and the next flush retries them.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Destination writer used by the queue
#[async_trait]
pub trait AppendSink: Send + Sync {
    /// Append `content` to `destination` in one write
    async fn append(&self, destination: &str, content: &str) -> std::io::Result<()>;
}

/// Appends to files on disk, creating them when absent
#[derive(Clone, Copy, Debug, Default)]
pub struct FileAppendSink;

#[async_trait]
impl AppendSink for FileAppendSink {
    async fn append(&self, destination: &str, content: &str) -> std::io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(destination)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await
    }
}

/// Outcome of one flush
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Destinations appended successfully
    pub written: usize,
    /// Payloads contained in the successful appends
    pub payloads: usize,
    /// Destinations requeued after a failed append
    pub retried: usize,
}

struct FlushTimer {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Per-destination batching queue
pub struct DownloadQueue {
    pending: Mutex<HashMap<String, Vec<String>>>,
    flush_lock: tokio::sync::Mutex<()>,
    sink: Arc<dyn AppendSink>,
    timer: Mutex<Option<FlushTimer>>,
}

impl DownloadQueue {
    /// Create a queue writing through `sink`
    pub fn new(sink: Arc<dyn AppendSink>) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            sink,
            timer: Mutex::new(None),
        })
    }

    /// Create a queue appending to files on disk
    pub fn with_files() -> Arc<Self> {
        Self::new(Arc::new(FileAppendSink))
    }

    /// Buffer `payload` for `destination`
    pub fn add(&self, destination: impl Into<String>, payload: impl Into<String>) {
        self.pending
            .lock()
            .entry(destination.into())
            .or_default()
            .push(payload.into());
    }

    /// Write every buffered destination
    ///
    /// Flushes are serialized; a failed destination is requeued ahead of any
    /// payload added while the flush was in progress.
    pub async fn flush(&self) -> FlushReport {
        let _guard = self.flush_lock.lock().await;
        let drained = std::mem::take(&mut *self.pending.lock());
        if drained.is_empty() {
            return FlushReport::default();
        }

        let writes = drained.into_iter().map(|(destination, payloads)| async move {
            let content = payloads.concat();
            let result = self.sink.append(&destination, &content).await;
            (destination, payloads, result)
        });
        let results = futures::future::join_all(writes).await;

        let mut report = FlushReport::default();
        for (destination, payloads, result) in results {
            match result {
                Ok(()) => {
                    report.written += 1;
                    report.payloads += payloads.len();
                }
                Err(e) => {
                    tracing::warn!(
                        destination = %destination,
                        payloads = payloads.len(),
                        error = %e,
                        "failed to flush download input, will retry"
                    );
                    self.requeue(destination, payloads);
                    report.retried += 1;
                }
            }
        }

        tracing::debug!(
            written = report.written,
            payloads = report.payloads,
            retried = report.retried,
            "download queue flushed"
        );
        report
    }

    fn requeue(&self, destination: String, mut payloads: Vec<String>) {
        let mut pending = self.pending.lock();
        let entry = pending.entry(destination).or_default();
        payloads.append(entry);
        *entry = payloads;
    }

    /// Start periodic flushing: first after `delay`, then every `period`
    ///
    /// Does nothing if a timer is already running.
    pub fn begin_timer(self: &Arc<Self>, delay: Duration, period: Duration) {
        let mut timer = self.timer.lock();
        if timer.is_some() {
            tracing::warn!("download queue timer already running");
            return;
        }

        let cancel = CancellationToken::new();
        let queue: Weak<Self> = Arc::downgrade(self);
        let token = cancel.clone();
        let period = period.max(Duration::from_millis(1));
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(queue) = queue.upgrade() else { break };
                        queue.flush().await;
                    }
                }
            }
        });

        tracing::debug!(delay = ?delay, period = ?period, "download queue timer started");
        *timer = Some(FlushTimer { cancel, task });
    }

    /// Stop the timer and perform one final flush
    ///
    /// Returns `None` without flushing if no timer was started.
    pub async fn end_timer(&self) -> Option<FlushReport> {
        let timer = self.timer.lock().take();
        let Some(FlushTimer { cancel, task }) = timer else {
            tracing::debug!("download queue timer was never started");
            return None;
        };
        cancel.cancel();
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "download queue timer ended abnormally");
        }
        Some(self.flush().await)
    }

    /// Number of buffered payloads
    pub fn pending(&self) -> usize {
        self.pending.lock().values().map(Vec::len).sum()
    }

    /// Destinations with buffered payloads
    pub fn pending_destinations(&self) -> Vec<String> {
        let mut destinations: Vec<_> = self.pending.lock().keys().cloned().collect();
        destinations.sort();
        destinations
    }

    /// Buffered payloads of one destination
    pub fn pending_for(&self, destination: &str) -> Vec<String> {
        self.pending
            .lock()
            .get(destination)
            .cloned()
            .unwrap_or_default()
    }
}
