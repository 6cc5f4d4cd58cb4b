//! Mark-and-sweep garbage collection for orphaned extents.

use futures::future::try_join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{ExtentStore, LockTable, MetadataStore};
use crate::error::StorageError;

/// Lifecycle of the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    Initializing,
    Running,
    Closing,
    Closed,
}

/// Callback invoked once when a sweep fails and the collector shuts down.
pub type ErrorHandler = Arc<dyn Fn(&StorageError) + Send + Sync>;

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Extents present in the extent store when the sweep began.
    pub scanned: usize,
    /// Extent ids referenced by metadata.
    pub referenced: usize,
    pub deleted: usize,
    /// Unreferenced extents left alone because they were open for write.
    pub skipped_open: usize,
}

/// Garbage collector for cleaning up orphaned extents.
pub struct GarbageCollector {
    metadata: Arc<dyn MetadataStore>,
    extents: Arc<dyn ExtentStore>,
    interval: Duration,
    state: Mutex<CollectorState>,
    cancel: CancellationToken,
    on_error: Option<ErrorHandler>,
    locks: Option<Arc<LockTable>>,
}

impl GarbageCollector {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        extents: Arc<dyn ExtentStore>,
        interval: Duration,
    ) -> Self {
        Self {
            metadata,
            extents,
            interval,
            state: Mutex::new(CollectorState::Initializing),
            cancel: CancellationToken::new(),
            on_error: None,
            locks: None,
        }
    }

    /// Sets the handler told about a fatal sweep failure.
    pub fn on_error(mut self, handler: ErrorHandler) -> Self {
        self.on_error = Some(handler);
        self
    }

    /// Also prunes idle lock entries after each sweep.
    pub fn with_lock_table(mut self, locks: Arc<LockTable>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn state(&self) -> CollectorState {
        *self.state.lock()
    }

    /// Spawns the collection loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let collector = self.clone();
        tokio::spawn(async move { collector.run().await })
    }

    /// Runs the collection loop until closed or a sweep fails.
    pub async fn run(&self) {
        {
            let mut state = self.state.lock();
            if *state != CollectorState::Initializing {
                return;
            }
            *state = CollectorState::Running;
        }

        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_secs = self.interval.as_secs(),
            "Garbage collector started"
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Garbage collector shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let result = match self.sweep().await {
                        Ok(_) => self.metadata.checkpoint().await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = result {
                        error!(error = %e, "Garbage collection failed, collector closed");
                        *self.state.lock() = CollectorState::Closed;
                        if let Some(handler) = &self.on_error {
                            handler(&e);
                        }
                        return;
                    }
                }
            }
        }

        *self.state.lock() = CollectorState::Closed;
    }

    /// Asks the loop to stop. A sweep already in progress runs to completion.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                CollectorState::Closed => return,
                CollectorState::Initializing => *state = CollectorState::Closed,
                _ => *state = CollectorState::Closing,
            }
        }
        self.cancel.cancel();
    }

    /// Performs a single mark-and-sweep pass.
    ///
    /// The extent listing and the open-for-write set are both taken before
    /// metadata is scanned. An extent written after the listing is not a
    /// candidate; one written before it is either open (skipped) or already
    /// referenced by committed metadata by the time the scan runs.
    pub async fn sweep(&self) -> Result<SweepReport, StorageError> {
        debug!("Starting garbage collection");

        let all = self.extents.list_extent_ids().await?;
        // Extents move from open to referenced on writes and the other way for
        // copy sources, so the open set is read on both sides of the mark
        let mut open = self.extents.open_extent_ids();
        let referenced = self.metadata.referenced_extent_ids().await?;
        open.extend(self.extents.open_extent_ids());

        let mut report = SweepReport {
            scanned: all.len(),
            referenced: referenced.len(),
            ..Default::default()
        };

        let candidates: Vec<String> = all
            .into_iter()
            .filter(|id| !referenced.contains(id))
            .filter(|id| {
                let pinned = open.contains(id);
                if pinned {
                    report.skipped_open += 1;
                }
                !pinned
            })
            .collect();

        try_join_all(candidates.iter().map(|id| self.extents.delete(id))).await?;
        report.deleted = candidates.len();

        if let Some(locks) = &self.locks {
            locks.prune();
        }

        if report.deleted > 0 {
            info!(
                scanned = report.scanned,
                referenced = report.referenced,
                deleted = report.deleted,
                skipped_open = report.skipped_open,
                "Garbage collection completed"
            );
        } else {
            debug!(scanned = report.scanned, "Garbage collection: nothing to delete");
        }

        Ok(report)
    }
}
