//! Copy blob handlers.

use percent_encoding::percent_decode_str;
use tracing::info;
use url::Url;
use uuid::Uuid;

use crate::context::RequestContext;
use crate::copy::CopyJob;
use crate::error::{ErrorCode, StorageError, StorageResult};
use crate::models::{AccessTier, BlobId, BlobModel, BlobType, CopyStatus};
use crate::router::EngineState;
use crate::storage::BlobContent;

use super::{load_overwrite_target, release_blocks, OperationResult, ResponseHeaders};

/// Base for resolving copy sources given as a bare path.
const LOCAL_BASE: &str = "http://127.0.0.1/";

/// Resolves an `x-ms-copy-source` value to the blob it names.
///
/// Accepts absolute URLs and `/account/container/blob` paths. Path segments
/// are percent-decoded and a `snapshot` query parameter addresses a snapshot.
pub fn parse_copy_source(source: &str) -> StorageResult<BlobId> {
    let invalid = || {
        StorageError::with_message(
            ErrorCode::InvalidSourceBlobUrl,
            format!("Copy source {} is not a blob URL", source),
        )
    };

    let base = Url::parse(LOCAL_BASE).map_err(|_| invalid())?;
    let url = base.join(source).map_err(|_| invalid())?;

    let segments: Vec<String> = url
        .path_segments()
        .ok_or_else(invalid)?
        .map(|s| percent_decode_str(s).decode_utf8_lossy().into_owned())
        .collect();
    if segments.len() < 3 || segments[..2].iter().any(|s| s.is_empty()) {
        return Err(invalid());
    }

    let name = segments[2..].join("/");
    if name.is_empty() {
        return Err(invalid());
    }
    let snapshot = url
        .query_pairs()
        .find(|(key, _)| key == "snapshot")
        .map(|(_, value)| value.into_owned())
        .unwrap_or_default();

    Ok(BlobId::new(&segments[0], &segments[1], name).with_snapshot(snapshot))
}

/// Start an asynchronous copy of `source` onto the addressed blob.
///
/// The destination is replaced at once by an empty blob of the source's type
/// with a pending copy status; the bytes arrive in the background.
pub async fn start_copy(
    state: &EngineState,
    ctx: &RequestContext,
    source_url: &str,
) -> StorageResult<OperationResult> {
    let source_id = parse_copy_source(source_url)?;
    let id = ctx.blob_id()?;
    let _guard = state.locks.lock(&id.lock_key()).await;

    // Read under the destination lock so a copy onto itself sees a stable source
    let source = state.metadata.get_blob(&source_id).await?;
    if source.properties.effective_tier(ctx.now) == AccessTier::Archive {
        return Err(StorageError::with_message(
            ErrorCode::BlobArchived,
            "The copy source is archived.",
        ));
    }
    let source_pages = match source.properties.blob_type {
        BlobType::PageBlob => state.metadata.list_page_ranges(&source_id, None).await?,
        _ => Vec::new(),
    };

    let (id, existing) = load_overwrite_target(state, ctx).await?;
    if let Some(blob) = &existing {
        if blob.properties.copy_status == Some(CopyStatus::Pending) {
            return Err(StorageError::new(ErrorCode::PendingCopyOperation));
        }
    }

    let copy_id = Uuid::new_v4().to_string();
    let mut blob = BlobModel::new(&id, source.properties.blob_type, 0, ctx.now);
    blob.metadata = if ctx.metadata.is_empty() {
        source.metadata.clone()
    } else {
        ctx.metadata.clone()
    };
    if let Some(previous) = &existing {
        blob.properties.created_on = previous.properties.created_on;
        blob.lease = previous.lease.clone();
        blob.lease.etag = None;
    }
    let props = &mut blob.properties;
    props.copy_id = Some(copy_id.clone());
    props.copy_source = Some(source_url.to_string());
    props.copy_status = Some(CopyStatus::Pending);
    props.copy_progress = Some(format!("0/{}", source.properties.content_length));

    // Pin the source before the destination row stops referencing it
    let job = CopyJob::new(
        &state.extents,
        copy_id.clone(),
        source,
        source_pages,
        id.clone(),
    );
    let discarded = state
        .metadata
        .replace_blob_content(BlobContent {
            blob: blob.clone(),
            committed_blocks: Vec::new(),
            page_ranges: Vec::new(),
        })
        .await?;
    release_blocks(&state.extents, &discarded).await;

    state.copies.start(job);

    info!(
        source = %source_url,
        destination = %id.name,
        copy_id = %copy_id,
        "Started copy"
    );

    let mut headers =
        ResponseHeaders::modified(&blob.properties.etag, blob.properties.last_modified);
    headers.copy_id = Some(copy_id);
    headers.copy_status = Some(CopyStatus::Pending);
    Ok(OperationResult::accepted(headers))
}

/// Abort a pending copy, leaving the destination empty with status aborted.
pub async fn abort_copy(
    state: &EngineState,
    ctx: &RequestContext,
    copy_id: &str,
) -> StorageResult<OperationResult> {
    let id = ctx.blob_id()?;
    let _guard = state.locks.lock(&id.lock_key()).await;

    let mut blob = state.metadata.get_blob(&id).await?;
    super::check_blob_lease(&blob, ctx.lease_id.as_deref(), ctx.now)?;
    if blob.properties.copy_status != Some(CopyStatus::Pending) {
        return Err(StorageError::new(ErrorCode::NoPendingCopyOperation));
    }
    if blob.properties.copy_id.as_deref() != Some(copy_id) {
        return Err(StorageError::new(ErrorCode::CopyIdMismatch));
    }

    state.copies.cancel(copy_id);
    blob.properties.copy_status = Some(CopyStatus::Aborted);
    blob.properties.copy_completion_time = Some(ctx.now);
    blob.properties.copy_status_description = Some("Copy was aborted by the client".to_string());
    state.metadata.update_blob(blob).await?;

    info!(blob = %id.name, copy_id, "Aborted copy");
    Ok(OperationResult::no_content(ResponseHeaders::default()))
}
