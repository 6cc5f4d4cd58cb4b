//! Operation handlers for the blob engine.

mod append_blob;
mod blob;
mod block_blob;
mod container;
mod copy;
mod page_blob;

pub use append_blob::*;
pub use blob::*;
pub use block_blob::*;
pub use container::*;
pub use copy::*;
pub use page_blob::*;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use md5::{Digest, Md5};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::context::{format_http_date, ContentHeaders};
use crate::error::{ErrorCode, StorageError, StorageResult};
use crate::lease::{self, LeaseAccess, LeaseTarget};
use crate::models::{
    validate_blob_name, AccessTier, BlobId, BlobModel, BlobType, BlockModel, CommittedBlock,
    ContainerModel, CopyStatus, LeaseDuration, LeaseState, LeaseStatus, PageRange,
    PublicAccessLevel, SignedIdentifier,
};
use crate::page_range::PageSegment;
use crate::router::EngineState;
use crate::storage::{BlobListing, ExtentStore};

/// Content type given to blobs written without one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Service version reported on every result.
pub const SERVICE_VERSION: &str = "2021-10-04";

/// Header-property bag describing the outcome of an operation.
///
/// Every field is optional; [`ResponseHeaders::to_header_map`] renders the
/// set ones under their wire names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHeaders {
    pub request_id: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub created_on: Option<DateTime<Utc>>,
    pub content_length: Option<u64>,
    pub content_range: Option<String>,
    pub content: ContentHeaders,
    pub blob_type: Option<BlobType>,
    pub metadata: HashMap<String, String>,
    pub lease_id: Option<String>,
    pub lease_state: Option<LeaseState>,
    pub lease_status: Option<LeaseStatus>,
    pub lease_duration: Option<LeaseDuration>,
    pub lease_time: Option<u32>,
    pub copy_id: Option<String>,
    pub copy_status: Option<CopyStatus>,
    pub copy_source: Option<String>,
    pub copy_progress: Option<String>,
    pub copy_completion_time: Option<DateTime<Utc>>,
    pub copy_status_description: Option<String>,
    pub sequence_number: Option<u64>,
    pub committed_block_count: Option<u32>,
    pub append_offset: Option<u64>,
    pub is_sealed: Option<bool>,
    pub access_tier: Option<AccessTier>,
    pub access_tier_inferred: Option<bool>,
    pub access_tier_change_time: Option<DateTime<Utc>>,
    pub archive_status: Option<String>,
    pub snapshot: Option<String>,
    pub public_access: Option<PublicAccessLevel>,
    pub request_server_encrypted: Option<bool>,
}

impl ResponseHeaders {
    /// Headers describing a blob's properties as seen at `now`.
    pub fn for_blob(blob: &BlobModel, now: DateTime<Utc>) -> Self {
        let props = &blob.properties;
        let held = blob.lease.state(now);
        Self {
            etag: Some(props.etag.clone()),
            last_modified: Some(props.last_modified),
            created_on: Some(props.created_on),
            content_length: Some(props.content_length),
            content: ContentHeaders {
                content_type: props.content_type.clone(),
                content_encoding: props.content_encoding.clone(),
                content_language: props.content_language.clone(),
                content_md5: props.content_md5.clone(),
                content_disposition: props.content_disposition.clone(),
                cache_control: props.cache_control.clone(),
            },
            blob_type: Some(props.blob_type),
            metadata: blob.metadata.clone(),
            lease_state: Some(held),
            lease_status: Some(blob.lease.status(now)),
            lease_duration: blob.lease.reported_duration(now),
            copy_id: props.copy_id.clone(),
            copy_status: props.copy_status,
            copy_source: props.copy_source.clone(),
            copy_progress: props.copy_progress.clone(),
            copy_completion_time: props.copy_completion_time,
            copy_status_description: props.copy_status_description.clone(),
            sequence_number: props.sequence_number,
            committed_block_count: props.committed_block_count,
            is_sealed: props.is_sealed,
            access_tier: match props.blob_type {
                BlobType::BlockBlob => Some(props.effective_tier(now)),
                _ => None,
            },
            access_tier_inferred: match props.blob_type {
                BlobType::BlockBlob => Some(props.access_tier_inferred),
                _ => None,
            },
            access_tier_change_time: props.access_tier_change_time,
            archive_status: props.archive_status(now),
            snapshot: (!blob.snapshot.is_empty()).then(|| blob.snapshot.clone()),
            ..Default::default()
        }
    }

    /// Headers describing a container's properties as seen at `now`.
    pub fn for_container(container: &ContainerModel, now: DateTime<Utc>) -> Self {
        Self {
            etag: Some(container.properties.etag.clone()),
            last_modified: Some(container.properties.last_modified),
            metadata: container.metadata.clone(),
            lease_state: Some(container.lease.state(now)),
            lease_status: Some(container.lease.status(now)),
            lease_duration: container.lease.reported_duration(now),
            public_access: Some(container.properties.public_access),
            ..Default::default()
        }
    }

    /// ETag and Last-Modified only.
    pub fn modified(etag: &str, last_modified: DateTime<Utc>) -> Self {
        Self {
            etag: Some(etag.to_string()),
            last_modified: Some(last_modified),
            ..Default::default()
        }
    }

    /// Renders the set fields into HTTP headers.
    pub fn to_header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        insert(&mut headers, "x-ms-version", Some(SERVICE_VERSION));
        insert(&mut headers, "x-ms-request-id", self.request_id.as_deref());
        insert(&mut headers, "etag", self.etag.as_deref());
        insert(
            &mut headers,
            "last-modified",
            self.last_modified.as_ref().map(format_http_date),
        );
        insert(
            &mut headers,
            "x-ms-creation-time",
            self.created_on.as_ref().map(format_http_date),
        );
        insert(&mut headers, "content-length", self.content_length);
        insert(&mut headers, "content-range", self.content_range.as_deref());
        insert(&mut headers, "content-type", self.content.content_type.as_deref());
        insert(&mut headers, "content-encoding", self.content.content_encoding.as_deref());
        insert(&mut headers, "content-language", self.content.content_language.as_deref());
        insert(&mut headers, "content-md5", self.content.content_md5.as_deref());
        insert(
            &mut headers,
            "content-disposition",
            self.content.content_disposition.as_deref(),
        );
        insert(&mut headers, "cache-control", self.content.cache_control.as_deref());
        insert(&mut headers, "x-ms-blob-type", self.blob_type.map(|t| t.as_str()));
        for (key, value) in &self.metadata {
            insert(&mut headers, &format!("x-ms-meta-{}", key), Some(value.as_str()));
        }
        insert(&mut headers, "x-ms-lease-id", self.lease_id.as_deref());
        insert(&mut headers, "x-ms-lease-state", self.lease_state.map(|s| s.as_str()));
        insert(&mut headers, "x-ms-lease-status", self.lease_status.map(|s| s.as_str()));
        insert(
            &mut headers,
            "x-ms-lease-duration",
            self.lease_duration.map(|d| d.as_str()),
        );
        insert(&mut headers, "x-ms-lease-time", self.lease_time);
        insert(&mut headers, "x-ms-copy-id", self.copy_id.as_deref());
        insert(&mut headers, "x-ms-copy-status", self.copy_status.map(|s| s.as_str()));
        insert(&mut headers, "x-ms-copy-source", self.copy_source.as_deref());
        insert(&mut headers, "x-ms-copy-progress", self.copy_progress.as_deref());
        insert(
            &mut headers,
            "x-ms-copy-completion-time",
            self.copy_completion_time.as_ref().map(format_http_date),
        );
        insert(
            &mut headers,
            "x-ms-copy-status-description",
            self.copy_status_description.as_deref(),
        );
        insert(&mut headers, "x-ms-blob-sequence-number", self.sequence_number);
        insert(
            &mut headers,
            "x-ms-blob-committed-block-count",
            self.committed_block_count,
        );
        insert(&mut headers, "x-ms-blob-append-offset", self.append_offset);
        insert(&mut headers, "x-ms-blob-sealed", self.is_sealed);
        insert(&mut headers, "x-ms-access-tier", self.access_tier.map(|t| t.as_str()));
        insert(
            &mut headers,
            "x-ms-access-tier-inferred",
            self.access_tier_inferred,
        );
        insert(
            &mut headers,
            "x-ms-access-tier-change-time",
            self.access_tier_change_time.as_ref().map(format_http_date),
        );
        insert(&mut headers, "x-ms-archive-status", self.archive_status.as_deref());
        insert(&mut headers, "x-ms-snapshot", self.snapshot.as_deref());
        insert(
            &mut headers,
            "x-ms-blob-public-access",
            self.public_access
                .filter(|a| *a != PublicAccessLevel::None)
                .map(|a| a.as_str()),
        );
        insert(
            &mut headers,
            "x-ms-request-server-encrypted",
            self.request_server_encrypted,
        );
        headers
    }
}

/// Inserts a header if it has a value that is valid on the wire.
fn insert(headers: &mut HeaderMap, name: &str, value: Option<impl ToString>) {
    let Some(value) = value else {
        return;
    };
    if let (Ok(name), Ok(value)) = (
        HeaderName::try_from(name),
        HeaderValue::from_str(&value.to_string()),
    ) {
        headers.insert(name, value);
    }
}

/// Block lists returned by GetBlockList.
#[derive(Debug, Clone, Default)]
pub struct BlockList {
    pub committed: Vec<CommittedBlock>,
    pub uncommitted: Vec<BlockModel>,
}

/// Body of an operation result, left for the caller to serialize.
#[derive(Debug, Clone, Default)]
pub enum Payload {
    #[default]
    Empty,
    Content(Bytes),
    Containers {
        containers: Vec<ContainerModel>,
        next_marker: Option<String>,
    },
    Blobs(BlobListing),
    BlockList(BlockList),
    PageRanges(Vec<PageRange>),
    Acl(Vec<SignedIdentifier>),
}

/// Result of an operation.
#[derive(Debug, Clone)]
pub struct OperationResult {
    pub status: StatusCode,
    pub headers: ResponseHeaders,
    pub payload: Payload,
}

impl OperationResult {
    pub fn new(status: StatusCode, headers: ResponseHeaders) -> Self {
        Self {
            status,
            headers,
            payload: Payload::Empty,
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn ok(headers: ResponseHeaders) -> Self {
        Self::new(StatusCode::OK, headers)
    }

    pub fn created(headers: ResponseHeaders) -> Self {
        Self::new(StatusCode::CREATED, headers)
    }

    pub fn accepted(headers: ResponseHeaders) -> Self {
        Self::new(StatusCode::ACCEPTED, headers)
    }

    pub fn no_content(headers: ResponseHeaders) -> Self {
        Self::new(StatusCode::NO_CONTENT, headers)
    }
}

/// Checks the request's lease id against a blob before a write.
pub fn check_blob_lease(
    blob: &BlobModel,
    ctx_lease: Option<&str>,
    now: DateTime<Utc>,
) -> StorageResult<()> {
    lease::validate(&blob.lease, ctx_lease, LeaseAccess::Write, LeaseTarget::Blob, now)
}

/// Computes the base64 MD5 of `body`, failing when a supplied digest differs.
pub(crate) fn verify_md5(body: &[u8], expected: Option<&str>) -> StorageResult<String> {
    let computed = BASE64.encode(Md5::digest(body));
    if let Some(expected) = expected {
        if BASE64.decode(expected).is_err() {
            return Err(StorageError::with_message(
                ErrorCode::InvalidHeaderValue,
                "Content-MD5 is not valid base64.",
            ));
        }
        if expected != computed {
            return Err(StorageError::new(ErrorCode::Md5Mismatch));
        }
    }
    Ok(computed)
}

/// Reads the given segments into one buffer, zero-filling gaps.
pub(crate) async fn read_segments(
    extents: &Arc<dyn ExtentStore>,
    segments: &[PageSegment],
) -> StorageResult<Bytes> {
    let mut out = BytesMut::new();
    for segment in segments {
        match segment {
            PageSegment::Data(chunk) => out.extend_from_slice(&extents.read(chunk).await?),
            PageSegment::Zero(len) => out.resize(out.len() + *len as usize, 0),
        }
    }
    Ok(out.freeze())
}

/// Deletes the extents of staged blocks dropped by a content swap.
///
/// The metadata no longer references them, so a failure here only delays
/// reclamation until the next collector sweep.
pub(crate) async fn release_blocks(extents: &Arc<dyn ExtentStore>, blocks: &[BlockModel]) {
    for block in blocks {
        if let Err(e) = extents.delete(&block.extent_chunk.id).await {
            warn!(
                extent = %block.extent_chunk.id,
                error = %e,
                "Failed to delete discarded block extent"
            );
        }
    }
}

/// Loads the base blob addressed by the request for a write, rejecting snapshots.
pub(crate) async fn load_writable_blob(
    state: &EngineState,
    ctx: &crate::context::RequestContext,
) -> StorageResult<BlobModel> {
    let id = ctx.blob_id()?;
    if id.is_snapshot() {
        return Err(StorageError::with_message(
            ErrorCode::InvalidQueryParameterValue,
            "Snapshots cannot be modified.",
        ));
    }
    let blob = state.metadata.get_blob(&id).await?;
    ctx.conditions
        .check(&blob.properties.etag, blob.properties.last_modified)?;
    check_blob_lease(&blob, ctx.lease_id.as_deref(), ctx.now)?;
    Ok(blob)
}

/// Resolves the blob a create-style write replaces, checking conditions and
/// lease against it. Returns `None` when no committed blob exists yet.
pub(crate) async fn load_overwrite_target(
    state: &EngineState,
    ctx: &crate::context::RequestContext,
) -> StorageResult<(BlobId, Option<BlobModel>)> {
    let id = ctx.blob_id()?;
    if id.is_snapshot() {
        return Err(StorageError::with_message(
            ErrorCode::InvalidQueryParameterValue,
            "Snapshots cannot be modified.",
        ));
    }
    validate_blob_name(&id.name)?;

    let existing = state
        .metadata
        .find_blob(&id)
        .await?
        .filter(|b| b.committed);
    match &existing {
        Some(blob) => {
            ctx.conditions
                .check(&blob.properties.etag, blob.properties.last_modified)?;
            check_blob_lease(blob, ctx.lease_id.as_deref(), ctx.now)?;
        }
        None => ctx.conditions.check_missing()?,
    }
    Ok((id, existing))
}

/// Builds a fresh blob for a create-style write, keeping the creation time
/// and lease of the blob it replaces.
pub(crate) fn replacement_blob(
    id: &BlobId,
    blob_type: BlobType,
    content_length: u64,
    previous: Option<&BlobModel>,
    ctx: &crate::context::RequestContext,
) -> BlobModel {
    let mut blob = BlobModel::new(id, blob_type, content_length, ctx.now);
    ctx.content.apply_to(&mut blob.properties);
    if blob.properties.content_type.is_none() {
        blob.properties.content_type = Some(DEFAULT_CONTENT_TYPE.to_string());
    }
    blob.metadata = ctx.metadata.clone();
    if let Some(previous) = previous {
        blob.properties.created_on = previous.properties.created_on;
        blob.lease = previous.lease.clone();
        blob.lease.etag = None;
    }
    blob
}

/// Stamps a content write: fresh ETag and modification time, and the lease
/// loses its recorded ETag.
pub(crate) fn touch_content(blob: &mut BlobModel, now: DateTime<Utc>) {
    blob.properties.update_etag(now);
    blob.lease.etag = None;
}
