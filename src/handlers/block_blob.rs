//! Block blob handlers: upload, staging and commit.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::context::RequestContext;
use crate::error::{ErrorCode, StorageError, StorageResult};
use crate::lease::{self, LeaseAccess, LeaseTarget};
use crate::models::{
    validate_blob_name, BlobModel, BlobType, BlockListItem, BlockListType, BlockModel,
    BlockState, CommittedBlock, MAX_BLOCK_ID_LENGTH, MAX_COMMITTED_BLOCKS,
};
use crate::router::EngineState;
use crate::storage::{write_pinned, BlobContent};

use super::{
    check_blob_lease, load_overwrite_target, release_blocks, replacement_blob, touch_content,
    verify_md5, BlockList, OperationResult, Payload, ResponseHeaders,
};

/// Upload a block blob in one request, replacing any existing blob.
pub async fn upload_block_blob(
    state: &EngineState,
    ctx: &RequestContext,
    body: Bytes,
) -> StorageResult<OperationResult> {
    let id = ctx.blob_id()?;
    let _guard = state.locks.lock(&id.lock_key()).await;

    let (id, existing) = load_overwrite_target(state, ctx).await?;
    let md5 = verify_md5(&body, ctx.content.content_md5.as_deref())?;

    let mut blob = replacement_blob(
        &id,
        BlobType::BlockBlob,
        body.len() as u64,
        existing.as_ref(),
        ctx,
    );
    blob.properties.content_md5 = Some(md5.clone());

    let pin = if body.is_empty() {
        None
    } else {
        let (chunk, pin) = write_pinned(&state.extents, body).await?;
        blob.extent_chunks.push(chunk);
        Some(pin)
    };

    let discarded = state
        .metadata
        .replace_blob_content(BlobContent {
            blob: blob.clone(),
            committed_blocks: Vec::new(),
            page_ranges: Vec::new(),
        })
        .await?;
    drop(pin);
    release_blocks(&state.extents, &discarded).await;

    info!(
        container = %id.container,
        blob = %id.name,
        size = blob.properties.content_length,
        "Uploaded block blob"
    );

    let mut headers =
        ResponseHeaders::modified(&blob.properties.etag, blob.properties.last_modified);
    headers.content.content_md5 = Some(md5);
    headers.request_server_encrypted = Some(true);
    Ok(OperationResult::created(headers))
}

/// Validates a block id: base64 encoded, at most 64 bytes once decoded.
fn validate_block_id(block_id: &str) -> StorageResult<()> {
    let decoded = BASE64.decode(block_id).map_err(|_| {
        StorageError::with_message(ErrorCode::InvalidBlockId, "Block ID must be base64 encoded")
    })?;
    if decoded.is_empty() || decoded.len() > MAX_BLOCK_ID_LENGTH {
        return Err(StorageError::with_message(
            ErrorCode::InvalidBlockId,
            format!(
                "Block ID must be between 1 and {} bytes when decoded",
                MAX_BLOCK_ID_LENGTH
            ),
        ));
    }
    Ok(())
}

/// Stage a block for a later commit.
///
/// The first block staged against a new name creates an uncommitted stub so
/// the name is held while blocks accumulate.
pub async fn stage_block(
    state: &EngineState,
    ctx: &RequestContext,
    block_id: &str,
    body: Bytes,
) -> StorageResult<OperationResult> {
    validate_block_id(block_id)?;

    let id = ctx.blob_id()?;
    if id.is_snapshot() {
        return Err(StorageError::with_message(
            ErrorCode::InvalidQueryParameterValue,
            "Snapshots cannot be modified.",
        ));
    }
    validate_blob_name(&id.name)?;
    let md5 = verify_md5(&body, ctx.content.content_md5.as_deref())?;
    let _guard = state.locks.lock(&id.lock_key()).await;

    let existing = state.metadata.find_blob(&id).await?;
    if let Some(blob) = existing.as_ref().filter(|b| b.committed) {
        check_blob_lease(blob, ctx.lease_id.as_deref(), ctx.now)?;
    }

    let (chunk, pin) = write_pinned(&state.extents, body).await?;
    if existing.is_none() {
        state
            .metadata
            .put_blob(BlobModel::uncommitted_stub(&id, ctx.now))
            .await?;
    }
    let block = BlockModel::new(&id, block_id.to_string(), chunk, ctx.now);
    let size = block.size;
    state.metadata.upsert_block(block).await?;
    drop(pin);

    debug!(blob = %id.name, block_id, size, "Staged block");

    let mut headers = ResponseHeaders::default();
    headers.content.content_md5 = Some(md5);
    headers.request_server_encrypted = Some(true);
    Ok(OperationResult::created(headers))
}

/// Commit a block list, making it the blob's content.
///
/// Every named block must resolve against the blob's staged or committed
/// blocks; otherwise nothing changes. The new block set replaces the old one
/// in a single metadata swap, and only then are the extents of staged blocks
/// left out of the list deleted.
pub async fn commit_block_list(
    state: &EngineState,
    ctx: &RequestContext,
    items: &[BlockListItem],
) -> StorageResult<OperationResult> {
    if items.len() > MAX_COMMITTED_BLOCKS {
        return Err(StorageError::with_message(
            ErrorCode::BlockCountExceedsLimit,
            format!("A block blob holds at most {} blocks.", MAX_COMMITTED_BLOCKS),
        ));
    }

    let id = ctx.blob_id()?;
    let _guard = state.locks.lock(&id.lock_key()).await;

    let (id, existing) = load_overwrite_target(state, ctx).await?;
    if let Some(blob) = &existing {
        if blob.properties.blob_type != BlobType::BlockBlob {
            return Err(StorageError::new(ErrorCode::InvalidBlobType));
        }
    }

    let blocks = state.metadata.list_blocks(&id).await?;
    let mut committed: HashMap<&str, &BlockModel> = HashMap::new();
    let mut uncommitted: HashMap<&str, &BlockModel> = HashMap::new();
    for block in &blocks {
        let table = if block.committed {
            &mut committed
        } else {
            &mut uncommitted
        };
        table.insert(block.block_id.as_str(), block);
    }

    let mut resolved: Vec<&BlockModel> = Vec::with_capacity(items.len());
    for item in items {
        let block_id = item.block_id.as_str();
        let block = match item.state {
            BlockState::Committed => committed.get(block_id),
            BlockState::Uncommitted => uncommitted.get(block_id),
            BlockState::Latest => uncommitted
                .get(block_id)
                .or_else(|| committed.get(block_id)),
        };
        match block {
            Some(block) => resolved.push(*block),
            None => {
                return Err(StorageError::with_message(
                    ErrorCode::InvalidBlockList,
                    format!("Block {} ({}) does not exist", block_id, item.state.as_str()),
                ))
            }
        }
    }

    let size: u64 = resolved.iter().map(|b| b.size).sum();
    let mut blob = match existing {
        Some(mut blob) => {
            ctx.content.apply_to(&mut blob.properties);
            if blob.properties.content_type.is_none() {
                blob.properties.content_type = Some(super::DEFAULT_CONTENT_TYPE.to_string());
            }
            blob.metadata = ctx.metadata.clone();
            blob.properties.content_length = size;
            blob.properties.clear_copy();
            blob
        }
        None => {
            let stub = state.metadata.find_blob(&id).await?;
            replacement_blob(&id, BlobType::BlockBlob, size, stub.as_ref(), ctx)
        }
    };
    blob.committed = true;
    blob.extent_chunks.clear();
    blob.committed_blocks = resolved.iter().map(|b| CommittedBlock::from(*b)).collect();
    touch_content(&mut blob, ctx.now);

    let mut seen = HashSet::new();
    let rows: Vec<BlockModel> = resolved
        .iter()
        .filter(|b| seen.insert(b.block_id.as_str()))
        .map(|b| (*b).clone())
        .collect();

    let discarded = state
        .metadata
        .replace_blob_content(BlobContent {
            blob: blob.clone(),
            committed_blocks: rows,
            page_ranges: Vec::new(),
        })
        .await?;
    release_blocks(&state.extents, &discarded).await;

    info!(
        container = %id.container,
        blob = %id.name,
        blocks = blob.committed_blocks.len(),
        size,
        discarded = discarded.len(),
        "Committed block list"
    );

    let mut headers =
        ResponseHeaders::modified(&blob.properties.etag, blob.properties.last_modified);
    headers.content.content_md5 = blob.properties.content_md5.clone();
    headers.request_server_encrypted = Some(true);
    Ok(OperationResult::created(headers))
}

/// List the committed and/or staged blocks of a blob.
pub async fn get_block_list(
    state: &EngineState,
    ctx: &RequestContext,
    list_type: BlockListType,
) -> StorageResult<OperationResult> {
    let id = ctx.blob_id()?;
    let blob = state
        .metadata
        .find_blob(&id)
        .await?
        .ok_or_else(|| StorageError::new(ErrorCode::BlobNotFound))?;

    let mut headers = ResponseHeaders::default();
    if blob.committed {
        if blob.properties.blob_type != BlobType::BlockBlob {
            return Err(StorageError::new(ErrorCode::InvalidBlobType));
        }
        lease::validate(
            &blob.lease,
            ctx.lease_id.as_deref(),
            LeaseAccess::Read,
            LeaseTarget::Blob,
            ctx.now,
        )?;
        headers = ResponseHeaders::modified(&blob.properties.etag, blob.properties.last_modified);
        headers.content_length = Some(blob.properties.content_length);
    }

    let mut list = BlockList::default();
    if list_type != BlockListType::Uncommitted && blob.committed {
        list.committed = blob.committed_blocks.clone();
    }
    if list_type != BlockListType::Committed && !id.is_snapshot() {
        list.uncommitted = state
            .metadata
            .list_blocks(&id)
            .await?
            .into_iter()
            .filter(|b| !b.committed)
            .collect();
    }

    Ok(OperationResult::ok(headers).with_payload(Payload::BlockList(list)))
}
