//! Handlers shared by every blob type.

use chrono::Duration;
use tracing::{debug, info};

use crate::context::RequestContext;
use crate::error::{ErrorCode, StorageError, StorageResult};
use crate::lease::{self, LeaseAccess, LeaseAction, LeaseTarget};
use crate::models::{slice_chunks, AccessTier, BlobModel, BlobType, PageRange, Rehydration};
use crate::page_range::{self, PageSegment};
use crate::router::EngineState;
use crate::snapshot::{format_snapshot_time, parse_snapshot_time};

use super::{load_writable_blob, read_segments, OperationResult, Payload, ResponseHeaders};

/// The `x-ms-delete-snapshots` directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteSnapshots {
    /// Delete the base blob and all of its snapshots.
    Include,
    /// Delete only the snapshots.
    Only,
}

impl DeleteSnapshots {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "include" => Some(DeleteSnapshots::Include),
            "only" => Some(DeleteSnapshots::Only),
            _ => None,
        }
    }
}

/// Loads a committed blob or snapshot for a read.
async fn load_readable_blob(state: &EngineState, ctx: &RequestContext) -> StorageResult<BlobModel> {
    let id = ctx.blob_id()?;
    let blob = state.metadata.get_blob(&id).await?;
    ctx.conditions
        .check(&blob.properties.etag, blob.properties.last_modified)?;
    lease::validate(
        &blob.lease,
        ctx.lease_id.as_deref(),
        LeaseAccess::Read,
        LeaseTarget::Blob,
        ctx.now,
    )?;
    Ok(blob)
}

/// Download blob content, optionally a byte range of it.
pub async fn get_blob(state: &EngineState, ctx: &RequestContext) -> StorageResult<OperationResult> {
    let blob = load_readable_blob(state, ctx).await?;
    if blob.properties.effective_tier(ctx.now) == AccessTier::Archive {
        return Err(StorageError::new(ErrorCode::BlobArchived));
    }

    let size = blob.properties.content_length;
    let (start, end) = match ctx.range {
        Some(range) => {
            if range.start >= size || range.end.is_some_and(|end| end < range.start) {
                return Err(StorageError::new(ErrorCode::InvalidRange));
            }
            let end = range.end.unwrap_or(size - 1).min(size - 1);
            (range.start, end)
        }
        None => (0, size.saturating_sub(1)),
    };

    let data = if size == 0 {
        bytes::Bytes::new()
    } else {
        let segments = match blob.properties.blob_type {
            BlobType::PageBlob => {
                let rows = state
                    .metadata
                    .list_page_ranges(&blob.id(), Some(PageRange::new(start, end)))
                    .await?;
                page_range::layout(&rows, start, end)
            }
            _ => slice_chunks(&blob.content_chunks(), start, end + 1 - start)
                .into_iter()
                .map(PageSegment::Data)
                .collect(),
        };
        read_segments(&state.extents, &segments).await?
    };

    let mut headers = ResponseHeaders::for_blob(&blob, ctx.now);
    headers.content_length = Some(data.len() as u64);
    let result = if ctx.range.is_some() {
        headers.content_range = Some(format!("bytes {}-{}/{}", start, end, size));
        headers.content.content_md5 = None;
        OperationResult::new(http::StatusCode::PARTIAL_CONTENT, headers)
    } else {
        OperationResult::ok(headers)
    };

    debug!(blob = %blob.name, bytes = data.len(), "Read blob");
    Ok(result.with_payload(Payload::Content(data)))
}

/// Get blob properties.
pub async fn get_blob_properties(
    state: &EngineState,
    ctx: &RequestContext,
) -> StorageResult<OperationResult> {
    let blob = load_readable_blob(state, ctx).await?;
    Ok(OperationResult::ok(ResponseHeaders::for_blob(&blob, ctx.now)))
}

/// Set blob HTTP headers. Headers absent from the request are cleared.
pub async fn set_blob_properties(
    state: &EngineState,
    ctx: &RequestContext,
) -> StorageResult<OperationResult> {
    let id = ctx.blob_id()?;
    let _guard = state.locks.lock(&id.lock_key()).await;

    let mut blob = load_writable_blob(state, ctx).await?;
    ctx.content.apply_to(&mut blob.properties);
    blob.properties.update_etag(ctx.now);
    state.metadata.update_blob(blob.clone()).await?;

    let mut headers =
        ResponseHeaders::modified(&blob.properties.etag, blob.properties.last_modified);
    headers.sequence_number = blob.properties.sequence_number;
    Ok(OperationResult::ok(headers))
}

/// Replace blob metadata.
pub async fn set_blob_metadata(
    state: &EngineState,
    ctx: &RequestContext,
) -> StorageResult<OperationResult> {
    let id = ctx.blob_id()?;
    let _guard = state.locks.lock(&id.lock_key()).await;

    let mut blob = load_writable_blob(state, ctx).await?;
    blob.metadata = ctx.metadata.clone();
    blob.properties.update_etag(ctx.now);
    state.metadata.update_blob(blob.clone()).await?;

    let mut headers =
        ResponseHeaders::modified(&blob.properties.etag, blob.properties.last_modified);
    headers.request_server_encrypted = Some(true);
    Ok(OperationResult::ok(headers))
}

/// Delete a blob, a snapshot, or a blob's snapshots.
///
/// Extents are left to the garbage collector: snapshots share them with the
/// base blob, so no single row owns the bytes.
pub async fn delete_blob(
    state: &EngineState,
    ctx: &RequestContext,
    delete_snapshots: Option<DeleteSnapshots>,
) -> StorageResult<OperationResult> {
    let id = ctx.blob_id()?;
    let _guard = state.locks.lock(&id.lock_key()).await;

    if id.is_snapshot() {
        if delete_snapshots.is_some() {
            return Err(StorageError::with_message(
                ErrorCode::InvalidQueryParameterValue,
                "x-ms-delete-snapshots is not allowed when deleting a snapshot.",
            ));
        }
        let snapshot = state.metadata.get_blob(&id).await?;
        ctx.conditions
            .check(&snapshot.properties.etag, snapshot.properties.last_modified)?;
        state.metadata.delete_blob(&id).await?;
        info!(blob = %id.name, snapshot = %id.snapshot, "Deleted snapshot");
        return Ok(OperationResult::accepted(ResponseHeaders::default()));
    }

    let blob = load_writable_blob(state, ctx).await?;
    let snapshots = state.metadata.list_snapshots(&id).await?;

    let removed = match delete_snapshots {
        None if !snapshots.is_empty() => {
            return Err(StorageError::new(ErrorCode::SnapshotsPresent));
        }
        None => {
            state.metadata.delete_blob(&id).await?;
            0
        }
        Some(directive) => {
            let keep_base = directive == DeleteSnapshots::Only;
            state.metadata.delete_blob_and_snapshots(&id, keep_base).await?
        }
    };

    if delete_snapshots != Some(DeleteSnapshots::Only) {
        if let Some(copy_id) = &blob.properties.copy_id {
            state.copies.cancel(copy_id);
        }
    }

    info!(
        blob = %id.name,
        snapshots = removed,
        only_snapshots = delete_snapshots == Some(DeleteSnapshots::Only),
        "Deleted blob"
    );
    Ok(OperationResult::accepted(ResponseHeaders::default()))
}

/// Create a read-only snapshot of a blob.
pub async fn snapshot_blob(
    state: &EngineState,
    ctx: &RequestContext,
) -> StorageResult<OperationResult> {
    let id = ctx.blob_id()?;
    if id.is_snapshot() {
        return Err(StorageError::with_message(
            ErrorCode::InvalidQueryParameterValue,
            "Cannot snapshot a snapshot.",
        ));
    }
    let _guard = state.locks.lock(&id.lock_key()).await;

    let blob = load_readable_blob(state, ctx).await?;
    let latest = state
        .metadata
        .list_snapshots(&id)
        .await?
        .iter()
        .filter_map(|s| parse_snapshot_time(&s.snapshot))
        .max();
    if let Some(latest) = latest {
        state.snapshots.observe(&id, latest);
    }
    let time = state.snapshots.allocate(&id, ctx.now);
    let stamp = format_snapshot_time(time);

    let mut snapshot = blob.create_snapshot(&stamp);
    if !ctx.metadata.is_empty() {
        snapshot.metadata = ctx.metadata.clone();
    }
    state.metadata.create_snapshot(snapshot).await?;
    info!(blob = %id.name, snapshot = %stamp, "Created snapshot");

    let mut headers =
        ResponseHeaders::modified(&blob.properties.etag, blob.properties.last_modified);
    headers.snapshot = Some(stamp);
    Ok(OperationResult::created(headers))
}

/// Acquire, renew, change, release or break a blob lease.
pub async fn blob_lease(
    state: &EngineState,
    ctx: &RequestContext,
    action: &LeaseAction,
) -> StorageResult<OperationResult> {
    let id = ctx.blob_id()?;
    if id.is_snapshot() {
        return Err(StorageError::with_message(
            ErrorCode::InvalidQueryParameterValue,
            "Snapshots cannot be leased.",
        ));
    }
    let _guard = state.locks.lock(&id.lock_key()).await;

    let mut blob = state.metadata.get_blob(&id).await?;
    ctx.conditions
        .check(&blob.properties.etag, blob.properties.last_modified)?;

    let etag = blob.properties.etag.clone();
    let (next, outcome) = lease::apply(&blob.lease, action, ctx.now, Some(&etag))?;
    blob.lease = next;
    state.metadata.update_blob(blob.clone()).await?;
    debug!(blob = %id.name, action = action.as_str(), "Blob lease updated");

    let mut headers =
        ResponseHeaders::modified(&blob.properties.etag, blob.properties.last_modified);
    headers.lease_id = outcome.lease_id;
    headers.lease_time = outcome.lease_time;

    let result = match action {
        LeaseAction::Acquire { .. } => OperationResult::created(headers),
        LeaseAction::Break { .. } => OperationResult::accepted(headers),
        _ => OperationResult::ok(headers),
    };
    Ok(result)
}

/// Set the access tier of a block blob.
///
/// Leaving Archive takes the configured rehydration delay; until then the
/// blob stays archived and reports a pending archive status.
pub async fn set_blob_tier(
    state: &EngineState,
    ctx: &RequestContext,
    tier: AccessTier,
) -> StorageResult<OperationResult> {
    let id = ctx.blob_id()?;
    if id.is_snapshot() {
        return Err(StorageError::with_message(
            ErrorCode::InvalidQueryParameterValue,
            "Snapshot tiers cannot be changed.",
        ));
    }
    let _guard = state.locks.lock(&id.lock_key()).await;

    let mut blob = load_readable_blob(state, ctx).await?;
    if blob.properties.blob_type != BlobType::BlockBlob {
        return Err(StorageError::with_message(
            ErrorCode::InvalidBlobType,
            "Access tiers apply to block blobs only.",
        ));
    }

    let props = &mut blob.properties;
    props.settle_rehydration(ctx.now);
    let delay =
        Duration::from_std(state.config.rehydrate_delay).unwrap_or_else(|_| Duration::zero());

    let pending = match (props.access_tier, props.rehydration) {
        (AccessTier::Archive, Some(_)) if tier == AccessTier::Archive => {
            props.rehydration = None;
            false
        }
        (AccessTier::Archive, Some(mut rehydration)) => {
            rehydration.target = tier;
            props.rehydration = Some(rehydration);
            true
        }
        (AccessTier::Archive, None) if tier != AccessTier::Archive && delay > Duration::zero() => {
            props.rehydration = Some(Rehydration {
                target: tier,
                completes_on: ctx.now + delay,
            });
            true
        }
        _ => {
            if props.access_tier != tier {
                props.access_tier = tier;
                props.access_tier_change_time = Some(ctx.now);
            }
            false
        }
    };
    props.access_tier_inferred = false;
    state.metadata.update_blob(blob.clone()).await?;
    debug!(blob = %id.name, tier = tier.as_str(), pending, "Set blob tier");

    let headers = ResponseHeaders::default();
    Ok(if pending {
        OperationResult::accepted(headers)
    } else {
        OperationResult::ok(headers)
    })
}
