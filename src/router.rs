//! Operation routing for the blob engine.
//!
//! Callers decode a request into a [`RequestContext`] and an [`Operation`];
//! [`dispatch`] runs the matching handler against the shared [`EngineState`].

use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::context::RequestContext;
use crate::copy::CopyManager;
use crate::error::{ErrorKind, StorageResult};
use crate::handlers::{
    self, AppendConditions, DeleteSnapshots, OperationResult, SequenceConditions,
    SequenceNumberAction,
};
use crate::lease::LeaseAction;
use crate::models::{
    AccessTier, BlockListItem, BlockListType, PageRange, PublicAccessLevel, SignedIdentifier,
};
use crate::snapshot::SnapshotTimeAllocator;
use crate::storage::{ExtentStore, ListBlobsOptions, LockTable, MetadataStore};

/// State shared by every operation.
#[derive(Clone)]
pub struct EngineState {
    pub config: Arc<Config>,
    pub metadata: Arc<dyn MetadataStore>,
    pub extents: Arc<dyn ExtentStore>,
    pub locks: Arc<LockTable>,
    pub snapshots: Arc<SnapshotTimeAllocator>,
    pub copies: Arc<CopyManager>,
}

impl EngineState {
    pub fn new(
        config: Config,
        metadata: Arc<dyn MetadataStore>,
        extents: Arc<dyn ExtentStore>,
    ) -> Self {
        let locks = Arc::new(LockTable::new());
        let copies = Arc::new(CopyManager::new(
            metadata.clone(),
            extents.clone(),
            locks.clone(),
            config.copy_chunk_size,
        ));
        Self {
            config: Arc::new(config),
            metadata,
            extents,
            locks,
            snapshots: Arc::new(SnapshotTimeAllocator::new()),
            copies,
        }
    }
}

/// An engine operation with its typed arguments.
#[derive(Debug, Clone)]
pub enum Operation {
    // Container operations
    CreateContainer {
        public_access: PublicAccessLevel,
    },
    DeleteContainer,
    GetContainerProperties,
    SetContainerMetadata,
    GetContainerAcl,
    SetContainerAcl {
        public_access: PublicAccessLevel,
        identifiers: Vec<SignedIdentifier>,
    },
    ListContainers {
        prefix: Option<String>,
        marker: Option<String>,
        max_results: Option<u32>,
    },
    ListBlobs(ListBlobsOptions),
    ContainerLease(LeaseAction),

    // Operations on any blob type
    GetBlob,
    GetBlobProperties,
    SetBlobProperties,
    SetBlobMetadata,
    DeleteBlob {
        delete_snapshots: Option<DeleteSnapshots>,
    },
    SnapshotBlob,
    BlobLease(LeaseAction),
    SetBlobTier(AccessTier),
    StartCopy {
        source: String,
    },
    AbortCopy {
        copy_id: String,
    },

    // Block blob operations
    UploadBlockBlob(Bytes),
    StageBlock {
        block_id: String,
        body: Bytes,
    },
    CommitBlockList(Vec<BlockListItem>),
    GetBlockList(BlockListType),

    // Page blob operations
    CreatePageBlob {
        size: u64,
        sequence_number: Option<u64>,
    },
    UploadPages {
        range: PageRange,
        body: Bytes,
        conditions: SequenceConditions,
    },
    ClearPages {
        range: PageRange,
        conditions: SequenceConditions,
    },
    GetPageRanges(Option<PageRange>),
    ResizePageBlob {
        size: u64,
    },
    UpdateSequenceNumber(SequenceNumberAction),

    // Append blob operations
    CreateAppendBlob,
    AppendBlock {
        body: Bytes,
        conditions: AppendConditions,
    },
    SealAppendBlob,
}

impl Operation {
    /// Name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::CreateContainer { .. } => "CreateContainer",
            Operation::DeleteContainer => "DeleteContainer",
            Operation::GetContainerProperties => "GetContainerProperties",
            Operation::SetContainerMetadata => "SetContainerMetadata",
            Operation::GetContainerAcl => "GetContainerAcl",
            Operation::SetContainerAcl { .. } => "SetContainerAcl",
            Operation::ListContainers { .. } => "ListContainers",
            Operation::ListBlobs(_) => "ListBlobs",
            Operation::ContainerLease(_) => "ContainerLease",
            Operation::GetBlob => "GetBlob",
            Operation::GetBlobProperties => "GetBlobProperties",
            Operation::SetBlobProperties => "SetBlobProperties",
            Operation::SetBlobMetadata => "SetBlobMetadata",
            Operation::DeleteBlob { .. } => "DeleteBlob",
            Operation::SnapshotBlob => "SnapshotBlob",
            Operation::BlobLease(_) => "BlobLease",
            Operation::SetBlobTier(_) => "SetBlobTier",
            Operation::StartCopy { .. } => "StartCopy",
            Operation::AbortCopy { .. } => "AbortCopy",
            Operation::UploadBlockBlob(_) => "UploadBlockBlob",
            Operation::StageBlock { .. } => "StageBlock",
            Operation::CommitBlockList(_) => "CommitBlockList",
            Operation::GetBlockList(_) => "GetBlockList",
            Operation::CreatePageBlob { .. } => "CreatePageBlob",
            Operation::UploadPages { .. } => "UploadPages",
            Operation::ClearPages { .. } => "ClearPages",
            Operation::GetPageRanges(_) => "GetPageRanges",
            Operation::ResizePageBlob { .. } => "ResizePageBlob",
            Operation::UpdateSequenceNumber(_) => "UpdateSequenceNumber",
            Operation::CreateAppendBlob => "CreateAppendBlob",
            Operation::AppendBlock { .. } => "AppendBlock",
            Operation::SealAppendBlob => "SealAppendBlob",
        }
    }
}

/// Runs an operation, tagging the result or error with the request id.
pub async fn dispatch(
    state: &EngineState,
    ctx: &RequestContext,
    op: Operation,
) -> StorageResult<OperationResult> {
    let name = op.name();
    debug!(
        operation = name,
        request_id = %ctx.request_id,
        container = ctx.container.as_deref().unwrap_or(""),
        blob = ctx.blob.as_deref().unwrap_or(""),
        "Dispatching operation"
    );

    match route(state, ctx, op).await {
        Ok(mut result) => {
            result.headers.request_id = Some(ctx.request_id.clone());
            Ok(result)
        }
        Err(e) => {
            let e = e.with_request_id(&ctx.request_id);
            match e.kind() {
                ErrorKind::Internal => warn!(
                    operation = name,
                    request_id = %ctx.request_id,
                    error = %e,
                    "Operation failed"
                ),
                _ => debug!(
                    operation = name,
                    request_id = %ctx.request_id,
                    error = %e,
                    "Operation rejected"
                ),
            }
            Err(e)
        }
    }
}

async fn route(
    state: &EngineState,
    ctx: &RequestContext,
    op: Operation,
) -> StorageResult<OperationResult> {
    match op {
        Operation::CreateContainer { public_access } => {
            handlers::create_container(state, ctx, public_access).await
        }
        Operation::DeleteContainer => handlers::delete_container(state, ctx).await,
        Operation::GetContainerProperties => handlers::get_container_properties(state, ctx).await,
        Operation::SetContainerMetadata => handlers::set_container_metadata(state, ctx).await,
        Operation::GetContainerAcl => handlers::get_container_acl(state, ctx).await,
        Operation::SetContainerAcl {
            public_access,
            identifiers,
        } => handlers::set_container_acl(state, ctx, public_access, identifiers).await,
        Operation::ListContainers {
            prefix,
            marker,
            max_results,
        } => {
            handlers::list_containers(state, ctx, prefix.as_deref(), marker.as_deref(), max_results)
                .await
        }
        Operation::ListBlobs(options) => handlers::list_blobs(state, ctx, &options).await,
        Operation::ContainerLease(action) => handlers::container_lease(state, ctx, &action).await,

        Operation::GetBlob => handlers::get_blob(state, ctx).await,
        Operation::GetBlobProperties => handlers::get_blob_properties(state, ctx).await,
        Operation::SetBlobProperties => handlers::set_blob_properties(state, ctx).await,
        Operation::SetBlobMetadata => handlers::set_blob_metadata(state, ctx).await,
        Operation::DeleteBlob { delete_snapshots } => {
            handlers::delete_blob(state, ctx, delete_snapshots).await
        }
        Operation::SnapshotBlob => handlers::snapshot_blob(state, ctx).await,
        Operation::BlobLease(action) => handlers::blob_lease(state, ctx, &action).await,
        Operation::SetBlobTier(tier) => handlers::set_blob_tier(state, ctx, tier).await,
        Operation::StartCopy { source } => handlers::start_copy(state, ctx, &source).await,
        Operation::AbortCopy { copy_id } => handlers::abort_copy(state, ctx, &copy_id).await,

        Operation::UploadBlockBlob(body) => handlers::upload_block_blob(state, ctx, body).await,
        Operation::StageBlock { block_id, body } => {
            handlers::stage_block(state, ctx, &block_id, body).await
        }
        Operation::CommitBlockList(items) => handlers::commit_block_list(state, ctx, &items).await,
        Operation::GetBlockList(list_type) => handlers::get_block_list(state, ctx, list_type).await,

        Operation::CreatePageBlob {
            size,
            sequence_number,
        } => handlers::create_page_blob(state, ctx, size, sequence_number).await,
        Operation::UploadPages {
            range,
            body,
            conditions,
        } => handlers::upload_pages(state, ctx, range, body, conditions).await,
        Operation::ClearPages { range, conditions } => {
            handlers::clear_pages(state, ctx, range, conditions).await
        }
        Operation::GetPageRanges(filter) => handlers::get_page_ranges(state, ctx, filter).await,
        Operation::ResizePageBlob { size } => handlers::resize_page_blob(state, ctx, size).await,
        Operation::UpdateSequenceNumber(action) => {
            handlers::update_sequence_number(state, ctx, action).await
        }

        Operation::CreateAppendBlob => handlers::create_append_blob(state, ctx).await,
        Operation::AppendBlock { body, conditions } => {
            handlers::append_block(state, ctx, body, conditions).await
        }
        Operation::SealAppendBlob => handlers::seal_append_blob(state, ctx).await,
    }
}
