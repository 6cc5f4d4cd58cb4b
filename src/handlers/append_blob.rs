//! Append blob handlers.

use bytes::Bytes;
use tracing::{debug, info};

use crate::context::RequestContext;
use crate::error::{ErrorCode, StorageError, StorageResult};
use crate::models::{BlobModel, BlobType};
use crate::router::EngineState;
use crate::storage::{write_pinned, BlobContent};

use super::{
    load_overwrite_target, load_writable_blob, release_blocks, replacement_blob, touch_content,
    verify_md5, OperationResult, ResponseHeaders,
};

/// Maximum size of a single appended block (4 MiB).
pub const MAX_APPEND_BLOCK_SIZE: u64 = 4 * 1024 * 1024;

/// Maximum number of blocks in an append blob.
pub const MAX_APPEND_BLOCK_COUNT: u32 = 50_000;

/// `x-ms-blob-condition-*` headers on an append.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendConditions {
    /// Offset the append must land at.
    pub append_position: Option<u64>,
    /// Size the blob must not exceed after the append.
    pub max_size: Option<u64>,
}

/// Create an empty append blob, replacing any existing blob.
pub async fn create_append_blob(
    state: &EngineState,
    ctx: &RequestContext,
) -> StorageResult<OperationResult> {
    let id = ctx.blob_id()?;
    let _guard = state.locks.lock(&id.lock_key()).await;

    let (id, existing) = load_overwrite_target(state, ctx).await?;
    let blob = replacement_blob(&id, BlobType::AppendBlob, 0, existing.as_ref(), ctx);

    let discarded = state
        .metadata
        .replace_blob_content(BlobContent {
            blob: blob.clone(),
            committed_blocks: Vec::new(),
            page_ranges: Vec::new(),
        })
        .await?;
    release_blocks(&state.extents, &discarded).await;

    info!(container = %id.container, blob = %id.name, "Created append blob");

    let mut headers =
        ResponseHeaders::modified(&blob.properties.etag, blob.properties.last_modified);
    headers.request_server_encrypted = Some(true);
    Ok(OperationResult::created(headers))
}

fn check_appendable(blob: &BlobModel) -> StorageResult<()> {
    if blob.properties.blob_type != BlobType::AppendBlob {
        return Err(StorageError::new(ErrorCode::InvalidBlobType));
    }
    if blob.properties.is_sealed == Some(true) {
        return Err(StorageError::with_message(
            ErrorCode::InvalidOperation,
            "Cannot modify a sealed blob",
        ));
    }
    Ok(())
}

/// Append a block to the end of an append blob.
pub async fn append_block(
    state: &EngineState,
    ctx: &RequestContext,
    body: Bytes,
    conditions: AppendConditions,
) -> StorageResult<OperationResult> {
    let block_size = body.len() as u64;
    if block_size == 0 {
        return Err(StorageError::with_message(
            ErrorCode::InvalidHeaderValue,
            "An appended block cannot be empty",
        ));
    }
    if block_size > MAX_APPEND_BLOCK_SIZE {
        return Err(StorageError::with_message(
            ErrorCode::RequestBodyTooLarge,
            format!(
                "Append block size cannot exceed {} bytes",
                MAX_APPEND_BLOCK_SIZE
            ),
        ));
    }

    let id = ctx.blob_id()?;
    let _guard = state.locks.lock(&id.lock_key()).await;

    let mut blob = load_writable_blob(state, ctx).await?;
    check_appendable(&blob)?;

    let block_count = blob.properties.committed_block_count.unwrap_or(0);
    if block_count >= MAX_APPEND_BLOCK_COUNT {
        return Err(StorageError::new(ErrorCode::BlockCountExceedsLimit));
    }

    let append_offset = blob.properties.content_length;
    if let Some(max_size) = conditions.max_size {
        if append_offset + block_size > max_size {
            return Err(StorageError::new(ErrorCode::MaxBlobSizeConditionNotMet));
        }
    }
    if let Some(position) = conditions.append_position {
        if position != append_offset {
            return Err(StorageError::new(ErrorCode::AppendPositionConditionNotMet));
        }
    }

    let md5 = verify_md5(&body, ctx.content.content_md5.as_deref())?;
    let (chunk, pin) = write_pinned(&state.extents, body).await?;

    blob.extent_chunks.push(chunk);
    blob.properties.content_length += block_size;
    blob.properties.committed_block_count = Some(block_count + 1);
    touch_content(&mut blob, ctx.now);
    state.metadata.update_blob(blob.clone()).await?;
    drop(pin);

    debug!(
        blob = %id.name,
        offset = append_offset,
        size = block_size,
        "Appended block"
    );

    let mut headers =
        ResponseHeaders::modified(&blob.properties.etag, blob.properties.last_modified);
    headers.content.content_md5 = Some(md5);
    headers.append_offset = Some(append_offset);
    headers.committed_block_count = blob.properties.committed_block_count;
    headers.request_server_encrypted = Some(true);
    Ok(OperationResult::created(headers))
}

/// Seal an append blob so it accepts no further appends.
pub async fn seal_append_blob(
    state: &EngineState,
    ctx: &RequestContext,
) -> StorageResult<OperationResult> {
    let id = ctx.blob_id()?;
    let _guard = state.locks.lock(&id.lock_key()).await;

    let mut blob = load_writable_blob(state, ctx).await?;
    if blob.properties.blob_type != BlobType::AppendBlob {
        return Err(StorageError::new(ErrorCode::InvalidBlobType));
    }

    if blob.properties.is_sealed != Some(true) {
        blob.properties.is_sealed = Some(true);
        blob.properties.update_etag(ctx.now);
        state.metadata.update_blob(blob.clone()).await?;
        info!(blob = %id.name, "Sealed append blob");
    }

    let mut headers =
        ResponseHeaders::modified(&blob.properties.etag, blob.properties.last_modified);
    headers.is_sealed = Some(true);
    Ok(OperationResult::ok(headers))
}
