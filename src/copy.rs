//! Background blob copies.
//!
//! A copy is registered under its copy id with its own cancellation token and
//! runs as a tracked task. The task streams the source chunks into a fresh
//! extent, reporting progress into the destination's metadata as it goes.
//!
//! Completion and abort both take the destination's lock and decide under
//! it: abort removes the registry entry and cancels the token, completion
//! only commits while the entry is still registered. Whichever loses finds
//! the other's result and backs off, and an abandoned extent is deleted by
//! the task that wrote it.

use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::StorageResult;
use crate::models::{
    BlobId, BlobModel, BlobType, BlockModel, CommittedBlock, CopyStatus, ExtentChunk,
    PageRangeModel,
};
use crate::storage::{
    create_pinned, pin_extent, BlobContent, ExtentPin, ExtentStore, LockTable, MetadataStore,
};

/// A copy to run: the source as it was when the copy started, and where it goes.
///
/// The job pins every source extent until it is dropped, so the collector
/// leaves the bytes alone even once no row references them.
pub struct CopyJob {
    pub copy_id: String,
    pub source: BlobModel,
    /// Written page ranges of a page blob source.
    pub source_pages: Vec<PageRangeModel>,
    pub destination: BlobId,
    source_pins: Vec<ExtentPin>,
}

impl CopyJob {
    pub fn new(
        extents: &Arc<dyn ExtentStore>,
        copy_id: String,
        source: BlobModel,
        source_pages: Vec<PageRangeModel>,
        destination: BlobId,
    ) -> Self {
        let mut job = Self {
            copy_id,
            source,
            source_pages,
            destination,
            source_pins: Vec::new(),
        };
        let ids: HashSet<String> = job.groups().into_iter().flatten().map(|c| c.id).collect();
        job.source_pins = ids.iter().map(|id| pin_extent(extents, id)).collect();
        job
    }

    /// Source data grouped into the units the destination keeps: one group
    /// per committed block, append chunk or page range.
    fn groups(&self) -> Vec<Vec<ExtentChunk>> {
        match self.source.properties.blob_type {
            BlobType::PageBlob => self
                .source_pages
                .iter()
                .map(|r| r.extent_chunks.clone())
                .collect(),
            _ => self
                .source
                .content_chunks()
                .into_iter()
                .map(|c| vec![c])
                .collect(),
        }
    }
}

enum Transfer {
    /// Every group was copied; one destination chunk per source group.
    Done(Vec<ExtentChunk>),
    /// Cancelled, or the destination no longer belongs to this copy.
    Abandoned,
}

struct PendingCopy {
    destination: BlobId,
    cancel: CancellationToken,
}

/// Runs and tracks in-flight copies.
pub struct CopyManager {
    metadata: Arc<dyn MetadataStore>,
    extents: Arc<dyn ExtentStore>,
    locks: Arc<LockTable>,
    chunk_size: u64,
    pending: DashMap<String, PendingCopy>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl CopyManager {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        extents: Arc<dyn ExtentStore>,
        locks: Arc<LockTable>,
        chunk_size: usize,
    ) -> Self {
        Self {
            metadata,
            extents,
            locks,
            chunk_size: chunk_size.max(1) as u64,
            pending: DashMap::new(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn is_pending(&self, copy_id: &str) -> bool {
        self.pending.contains_key(copy_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Registers the copy and spawns its transfer.
    ///
    /// The destination row must already carry `copy_id` in pending state.
    pub fn start(self: &Arc<Self>, job: CopyJob) {
        let cancel = self.shutdown.child_token();
        self.pending.insert(
            job.copy_id.clone(),
            PendingCopy {
                destination: job.destination.clone(),
                cancel: cancel.clone(),
            },
        );

        let manager = self.clone();
        self.tasks.spawn(async move { manager.run(job, cancel).await });
    }

    /// Unregisters a pending copy and stops its transfer.
    ///
    /// Callers hold the destination's lock. Returns false when the copy had
    /// already finished.
    pub fn cancel(&self, copy_id: &str) -> bool {
        match self.pending.remove(copy_id) {
            Some((_, copy)) => {
                copy.cancel.cancel();
                debug!(copy_id, destination = %copy.destination.name, "Cancelled copy");
                true
            }
            None => false,
        }
    }

    /// Stops every transfer and waits for the tasks to record the outcome.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    async fn run(self: Arc<Self>, job: CopyJob, cancel: CancellationToken) {
        let pin = match create_pinned(&self.extents).await {
            Ok(pin) => pin,
            Err(e) => {
                self.finish(&job, Err(e), None).await;
                return;
            }
        };
        let result = self.transfer(&job, &pin, &cancel).await;
        self.finish(&job, result, Some(pin)).await;
    }

    async fn transfer(
        &self,
        job: &CopyJob,
        pin: &ExtentPin,
        cancel: &CancellationToken,
    ) -> StorageResult<Transfer> {
        let groups = job.groups();
        let total: u64 = groups.iter().flatten().map(|c| c.count).sum();
        let mut copied = 0u64;
        let mut chunks = Vec::with_capacity(groups.len());

        for group in &groups {
            let start = copied;
            for chunk in group {
                let mut offset = 0;
                while offset < chunk.count {
                    let piece = chunk.slice(offset, (chunk.count - offset).min(self.chunk_size));
                    let data = tokio::select! {
                        _ = cancel.cancelled() => return Ok(Transfer::Abandoned),
                        data = self.extents.read(&piece) => data?,
                    };
                    self.extents.append(pin.extent_id(), data).await?;
                    offset += piece.count;
                    copied += piece.count;

                    if !self.report_progress(job, copied, total, cancel).await? {
                        return Ok(Transfer::Abandoned);
                    }
                }
            }
            chunks.push(ExtentChunk::new(
                pin.extent_id().to_string(),
                start,
                copied - start,
            ));
        }

        Ok(Transfer::Done(chunks))
    }

    /// Records progress on the destination. Returns false once the
    /// destination no longer belongs to this copy.
    async fn report_progress(
        &self,
        job: &CopyJob,
        copied: u64,
        total: u64,
        cancel: &CancellationToken,
    ) -> StorageResult<bool> {
        let _guard = self.locks.lock(&job.destination.lock_key()).await;
        if cancel.is_cancelled() {
            return Ok(false);
        }
        let Some(mut blob) = self.current_destination(job).await? else {
            return Ok(false);
        };
        blob.properties.copy_progress = Some(format!("{}/{}", copied, total));
        self.metadata.update_blob(blob).await?;
        Ok(true)
    }

    /// Returns the destination row if it still carries this pending copy.
    async fn current_destination(&self, job: &CopyJob) -> StorageResult<Option<BlobModel>> {
        Ok(self
            .metadata
            .find_blob(&job.destination)
            .await?
            .filter(|b| {
                b.properties.copy_id.as_deref() == Some(job.copy_id.as_str())
                    && b.properties.copy_status == Some(CopyStatus::Pending)
            }))
    }

    async fn finish(&self, job: &CopyJob, result: StorageResult<Transfer>, pin: Option<ExtentPin>) {
        let guard = self.locks.lock(&job.destination.lock_key()).await;

        // Abort removes the entry first; a missing entry means the copy lost.
        let owned = self.pending.remove(&job.copy_id).is_some();
        let committed = if owned {
            match self.record_outcome(job, result, pin.as_ref()).await {
                Ok(committed) => committed,
                Err(e) => {
                    warn!(copy_id = %job.copy_id, error = %e, "Failed to record copy outcome");
                    false
                }
            }
        } else {
            false
        };
        drop(guard);

        if let Some(pin) = pin {
            let extent_id = pin.extent_id().to_string();
            drop(pin);
            if !committed {
                if let Err(e) = self.extents.delete(&extent_id).await {
                    warn!(
                        extent = %extent_id,
                        error = %e,
                        "Failed to delete abandoned copy extent"
                    );
                }
            }
        }
    }

    /// Writes the final state of the copy. Returns true when the copied
    /// extent became part of the destination.
    async fn record_outcome(
        &self,
        job: &CopyJob,
        result: StorageResult<Transfer>,
        pin: Option<&ExtentPin>,
    ) -> StorageResult<bool> {
        let Some(mut blob) = self.current_destination(job).await? else {
            return Ok(false);
        };
        let now = Utc::now();

        let failure = match result {
            Ok(Transfer::Done(chunks)) if pin.is_some() => {
                let content = completed_content(job, blob, chunks, now);
                self.metadata.replace_blob_content(content).await?;
                info!(
                    copy_id = %job.copy_id,
                    destination = %job.destination.name,
                    size = job.source.properties.content_length,
                    "Copy completed"
                );
                return Ok(true);
            }
            Ok(_) => "Copy was interrupted before completion".to_string(),
            Err(e) => e.to_string(),
        };

        blob.properties.copy_status = Some(CopyStatus::Failed);
        blob.properties.copy_status_description = Some(failure.clone());
        blob.properties.copy_completion_time = Some(now);
        self.metadata.update_blob(blob).await?;
        warn!(copy_id = %job.copy_id, reason = %failure, "Copy failed");
        Ok(false)
    }
}

/// Builds the destination content for a finished copy.
fn completed_content(
    job: &CopyJob,
    mut blob: BlobModel,
    chunks: Vec<ExtentChunk>,
    now: chrono::DateTime<Utc>,
) -> BlobContent {
    let source = &job.source.properties;
    let props = &mut blob.properties;
    props.content_length = source.content_length;
    props.content_type = source.content_type.clone();
    props.content_encoding = source.content_encoding.clone();
    props.content_language = source.content_language.clone();
    props.content_md5 = source.content_md5.clone();
    props.content_disposition = source.content_disposition.clone();
    props.cache_control = source.cache_control.clone();
    props.sequence_number = source.sequence_number;
    props.committed_block_count = source.committed_block_count;
    props.copy_status = Some(CopyStatus::Success);
    props.copy_progress = Some(format!("{}/{}", total_bytes(&chunks), total_bytes(&chunks)));
    props.copy_completion_time = Some(now);
    props.copy_status_description = None;
    props.update_etag(now);
    blob.lease.etag = None;

    let mut committed_blocks = Vec::new();
    let mut page_ranges = Vec::new();
    blob.extent_chunks.clear();
    blob.committed_blocks.clear();

    match source.blob_type {
        BlobType::PageBlob => {
            page_ranges = job
                .source_pages
                .iter()
                .zip(chunks)
                .map(|(row, chunk)| PageRangeModel::new(row.start, row.end, vec![chunk]))
                .collect();
        }
        BlobType::BlockBlob if !job.source.committed_blocks.is_empty() => {
            let mut seen = HashSet::new();
            for (block, chunk) in job.source.committed_blocks.iter().zip(chunks) {
                let row = BlockModel::new(&job.destination, block.block_id.clone(), chunk, now);
                blob.committed_blocks.push(CommittedBlock::from(&row));
                if seen.insert(block.block_id.clone()) {
                    committed_blocks.push(row);
                }
            }
        }
        _ => blob.extent_chunks = chunks,
    }

    BlobContent {
        blob,
        committed_blocks,
        page_ranges,
    }
}

fn total_bytes(chunks: &[ExtentChunk]) -> u64 {
    chunks.iter().map(|c| c.count).sum()
}
