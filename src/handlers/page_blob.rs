//! Page blob handlers.

use bytes::Bytes;
use tracing::{debug, info};

use crate::context::RequestContext;
use crate::error::{ErrorCode, StorageError, StorageResult};
use crate::lease::{self, LeaseAccess, LeaseTarget};
use crate::models::{
    BlobModel, BlobType, PageRange, MAX_PAGE_BLOB_SIZE, MAX_PAGE_RANGE_SIZE, PAGE_SIZE,
};
use crate::page_range::{self, RangeEdit};
use crate::router::EngineState;
use crate::storage::{write_pinned, BlobContent};

use super::{
    load_overwrite_target, load_writable_blob, release_blocks, replacement_blob, touch_content,
    verify_md5, OperationResult, Payload, ResponseHeaders,
};

/// Largest sequence number a page blob accepts.
pub const MAX_SEQUENCE_NUMBER: u64 = i64::MAX as u64;

/// `x-ms-if-sequence-number-*` conditions on page writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceConditions {
    pub le: Option<u64>,
    pub lt: Option<u64>,
    pub eq: Option<u64>,
}

impl SequenceConditions {
    fn check(&self, current: u64) -> StorageResult<()> {
        let met = self.le.map_or(true, |v| current <= v)
            && self.lt.map_or(true, |v| current < v)
            && self.eq.map_or(true, |v| current == v);
        if met {
            Ok(())
        } else {
            Err(StorageError::new(ErrorCode::SequenceNumberConditionNotMet))
        }
    }
}

/// How `UpdateSequenceNumber` changes the stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceNumberAction {
    /// Keep the larger of the stored and supplied values.
    Max(u64),
    Update(u64),
    Increment,
}

fn validate_blob_size(size: u64) -> StorageResult<()> {
    if size % PAGE_SIZE != 0 {
        return Err(StorageError::with_message(
            ErrorCode::InvalidHeaderValue,
            "Page blob size must be aligned to 512 bytes",
        ));
    }
    if size > MAX_PAGE_BLOB_SIZE {
        return Err(StorageError::with_message(
            ErrorCode::InvalidHeaderValue,
            "Page blob size exceeds the maximum",
        ));
    }
    Ok(())
}

fn validate_sequence_number(value: u64) -> StorageResult<u64> {
    if value > MAX_SEQUENCE_NUMBER {
        return Err(StorageError::with_message(
            ErrorCode::InvalidHeaderValue,
            "Sequence number is out of range",
        ));
    }
    Ok(value)
}

fn validate_page_range(range: PageRange) -> StorageResult<()> {
    if range.end < range.start || !range.is_page_aligned() {
        return Err(StorageError::with_message(
            ErrorCode::InvalidPageRange,
            "Page ranges must be aligned to 512-byte boundaries",
        ));
    }
    Ok(())
}

/// Loads a page blob for a page write and checks the range against it.
async fn load_for_page_write(
    state: &EngineState,
    ctx: &RequestContext,
    range: PageRange,
    sequence: &SequenceConditions,
) -> StorageResult<BlobModel> {
    validate_page_range(range)?;

    let blob = load_writable_blob(state, ctx).await?;
    if blob.properties.blob_type != BlobType::PageBlob {
        return Err(StorageError::new(ErrorCode::InvalidBlobType));
    }
    if range.end >= blob.properties.content_length {
        return Err(StorageError::with_message(
            ErrorCode::InvalidPageRange,
            "Page range exceeds the blob size",
        ));
    }
    sequence.check(blob.properties.sequence_number.unwrap_or(0))?;
    Ok(blob)
}

fn page_write_headers(blob: &BlobModel) -> ResponseHeaders {
    let mut headers =
        ResponseHeaders::modified(&blob.properties.etag, blob.properties.last_modified);
    headers.sequence_number = blob.properties.sequence_number;
    headers.request_server_encrypted = Some(true);
    headers
}

/// Create an empty page blob of a fixed size, replacing any existing blob.
pub async fn create_page_blob(
    state: &EngineState,
    ctx: &RequestContext,
    size: u64,
    sequence_number: Option<u64>,
) -> StorageResult<OperationResult> {
    validate_blob_size(size)?;
    let sequence_number = validate_sequence_number(sequence_number.unwrap_or(0))?;

    let id = ctx.blob_id()?;
    let _guard = state.locks.lock(&id.lock_key()).await;

    let (id, existing) = load_overwrite_target(state, ctx).await?;
    let mut blob = replacement_blob(&id, BlobType::PageBlob, size, existing.as_ref(), ctx);
    blob.properties.sequence_number = Some(sequence_number);

    let discarded = state
        .metadata
        .replace_blob_content(BlobContent {
            blob: blob.clone(),
            committed_blocks: Vec::new(),
            page_ranges: Vec::new(),
        })
        .await?;
    release_blocks(&state.extents, &discarded).await;

    info!(container = %id.container, blob = %id.name, size, "Created page blob");
    Ok(OperationResult::created(page_write_headers(&blob)))
}

/// Write pages into a page blob.
pub async fn upload_pages(
    state: &EngineState,
    ctx: &RequestContext,
    range: PageRange,
    body: Bytes,
    sequence: SequenceConditions,
) -> StorageResult<OperationResult> {
    validate_page_range(range)?;
    if body.len() as u64 != range.length() {
        return Err(StorageError::with_message(
            ErrorCode::InvalidHeaderValue,
            "Content length does not match the page range",
        ));
    }
    if range.length() > MAX_PAGE_RANGE_SIZE {
        return Err(StorageError::new(ErrorCode::RequestBodyTooLarge));
    }

    let id = ctx.blob_id()?;
    let _guard = state.locks.lock(&id.lock_key()).await;

    let mut blob = load_for_page_write(state, ctx, range, &sequence).await?;
    let md5 = verify_md5(&body, ctx.content.content_md5.as_deref())?;

    let (chunk, pin) = write_pinned(&state.extents, body).await?;
    let overlapping = state.metadata.list_page_ranges(&id, Some(range)).await?;
    let edit = page_range::update(&overlapping, range, chunk);
    touch_content(&mut blob, ctx.now);
    state
        .metadata
        .update_page_blob(blob.clone(), &edit.removed, edit.inserted)
        .await?;
    drop(pin);
    debug!(blob = %id.name, start = range.start, end = range.end, "Uploaded pages");

    let mut headers = page_write_headers(&blob);
    headers.content.content_md5 = Some(md5);
    Ok(OperationResult::created(headers))
}

/// Clear pages, turning them back into unwritten (zero) space.
pub async fn clear_pages(
    state: &EngineState,
    ctx: &RequestContext,
    range: PageRange,
    sequence: SequenceConditions,
) -> StorageResult<OperationResult> {
    let id = ctx.blob_id()?;
    let _guard = state.locks.lock(&id.lock_key()).await;

    let mut blob = load_for_page_write(state, ctx, range, &sequence).await?;
    let overlapping = state.metadata.list_page_ranges(&id, Some(range)).await?;
    let edit = page_range::clear(&overlapping, range);
    touch_content(&mut blob, ctx.now);
    state
        .metadata
        .update_page_blob(blob.clone(), &edit.removed, edit.inserted)
        .await?;
    debug!(blob = %id.name, start = range.start, end = range.end, "Cleared pages");

    Ok(OperationResult::created(page_write_headers(&blob)))
}

/// List the written ranges of a page blob or snapshot.
///
/// With a filter, the ranges straddling its bounds are trimmed in the
/// result only.
pub async fn get_page_ranges(
    state: &EngineState,
    ctx: &RequestContext,
    filter: Option<PageRange>,
) -> StorageResult<OperationResult> {
    if let Some(filter) = filter {
        if filter.end < filter.start {
            return Err(StorageError::new(ErrorCode::InvalidRange));
        }
    }

    let id = ctx.blob_id()?;
    let blob = state.metadata.get_blob(&id).await?;
    if blob.properties.blob_type != BlobType::PageBlob {
        return Err(StorageError::new(ErrorCode::InvalidBlobType));
    }
    ctx.conditions
        .check(&blob.properties.etag, blob.properties.last_modified)?;
    lease::validate(
        &blob.lease,
        ctx.lease_id.as_deref(),
        LeaseAccess::Read,
        LeaseTarget::Blob,
        ctx.now,
    )?;

    let rows = state.metadata.list_page_ranges(&id, filter).await?;
    let ranges = page_range::filtered(&rows, filter);

    let mut headers =
        ResponseHeaders::modified(&blob.properties.etag, blob.properties.last_modified);
    headers.content_length = Some(blob.properties.content_length);
    Ok(OperationResult::ok(headers).with_payload(Payload::PageRanges(ranges)))
}

/// Resize a page blob. Shrinking drops the pages beyond the new size.
pub async fn resize_page_blob(
    state: &EngineState,
    ctx: &RequestContext,
    size: u64,
) -> StorageResult<OperationResult> {
    validate_blob_size(size)?;

    let id = ctx.blob_id()?;
    let _guard = state.locks.lock(&id.lock_key()).await;

    let mut blob = load_writable_blob(state, ctx).await?;
    if blob.properties.blob_type != BlobType::PageBlob {
        return Err(StorageError::new(ErrorCode::InvalidBlobType));
    }

    let edit = if size < blob.properties.content_length {
        let rows = state.metadata.list_page_ranges(&id, None).await?;
        page_range::truncate(&rows, size)
    } else {
        RangeEdit::default()
    };

    blob.properties.content_length = size;
    touch_content(&mut blob, ctx.now);
    state
        .metadata
        .update_page_blob(blob.clone(), &edit.removed, edit.inserted)
        .await?;
    info!(blob = %id.name, size, "Resized page blob");

    Ok(OperationResult::ok(page_write_headers(&blob)))
}

/// Change a page blob's sequence number.
pub async fn update_sequence_number(
    state: &EngineState,
    ctx: &RequestContext,
    action: SequenceNumberAction,
) -> StorageResult<OperationResult> {
    let id = ctx.blob_id()?;
    let _guard = state.locks.lock(&id.lock_key()).await;

    let mut blob = load_writable_blob(state, ctx).await?;
    if blob.properties.blob_type != BlobType::PageBlob {
        return Err(StorageError::new(ErrorCode::InvalidBlobType));
    }

    let current = blob.properties.sequence_number.unwrap_or(0);
    let next = match action {
        SequenceNumberAction::Max(value) => current.max(validate_sequence_number(value)?),
        SequenceNumberAction::Update(value) => validate_sequence_number(value)?,
        SequenceNumberAction::Increment => validate_sequence_number(current + 1)?,
    };
    blob.properties.sequence_number = Some(next);
    blob.properties.update_etag(ctx.now);
    state.metadata.update_blob(blob.clone()).await?;

    Ok(OperationResult::ok(page_write_headers(&blob)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_conditions_combine() {
        let conditions = SequenceConditions {
            le: Some(5),
            lt: Some(6),
            ..Default::default()
        };
        assert!(conditions.check(5).is_ok());
        assert_eq!(
            conditions.check(6).unwrap_err().code,
            ErrorCode::SequenceNumberConditionNotMet
        );
        assert!(SequenceConditions::default().check(u64::MAX).is_ok());
    }

    #[test]
    fn page_ranges_must_be_aligned_and_ordered() {
        assert!(validate_page_range(PageRange::new(0, 511)).is_ok());
        assert!(validate_page_range(PageRange::new(0, 100)).is_err());
        assert!(validate_page_range(PageRange::new(512, 511)).is_err());
        assert_eq!(
            validate_page_range(PageRange::new(0, u64::MAX)).unwrap_err().code,
            ErrorCode::InvalidPageRange
        );
    }

    #[test]
    fn blob_size_must_be_page_aligned() {
        assert!(validate_blob_size(0).is_ok());
        assert!(validate_blob_size(4096).is_ok());
        assert_eq!(
            validate_blob_size(1000).unwrap_err().code,
            ErrorCode::InvalidHeaderValue
        );
    }
}
