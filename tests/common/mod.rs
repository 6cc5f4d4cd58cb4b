//! Common test utilities.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use azurite_engine::models::{BlobModel, ExtentChunk, PublicAccessLevel};
use azurite_engine::{
    BlobServer, Config, ErrorCode, ExtentStore, MemoryExtentStore, MemoryMetadataStore,
    MetadataStore, Operation, OperationResult, Payload, RequestContext, StorageResult,
};

pub const ACCOUNT: &str = "devstoreaccount1";

/// Test engine wrapper.
pub struct TestEngine {
    pub server: BlobServer,
    pub metadata: Arc<dyn MetadataStore>,
    pub extents: Arc<dyn ExtentStore>,
}

impl TestEngine {
    /// Creates an engine over in-memory stores.
    pub fn new() -> Self {
        Self::with_extents(Arc::new(MemoryExtentStore::new()))
    }

    /// Creates an engine over the given extent store.
    pub fn with_extents(extents: Arc<dyn ExtentStore>) -> Self {
        Self::with_config(Config::default(), extents)
    }

    pub fn with_config(config: Config, extents: Arc<dyn ExtentStore>) -> Self {
        let metadata: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::new());
        let server = BlobServer::with_storage(config, metadata.clone(), extents.clone());
        Self {
            server,
            metadata,
            extents,
        }
    }

    pub fn container(&self, container: &str) -> RequestContext {
        RequestContext::for_container(ACCOUNT, container)
    }

    pub fn blob(&self, container: &str, blob: &str) -> RequestContext {
        RequestContext::for_blob(ACCOUNT, container, blob)
    }

    pub async fn exec(
        &self,
        ctx: &RequestContext,
        op: Operation,
    ) -> StorageResult<OperationResult> {
        self.server.execute(ctx, op).await
    }

    /// Runs an operation that is expected to fail and returns its code.
    pub async fn exec_err(&self, ctx: &RequestContext, op: Operation) -> ErrorCode {
        match self.exec(ctx, op).await {
            Ok(result) => panic!("expected an error, got status {}", result.status),
            Err(e) => e.code,
        }
    }

    pub async fn create_container(&self, name: &str) {
        self.exec(
            &self.container(name),
            Operation::CreateContainer {
                public_access: PublicAccessLevel::None,
            },
        )
        .await
        .unwrap();
    }

    pub async fn put_block_blob(
        &self,
        container: &str,
        name: &str,
        data: &[u8],
    ) -> OperationResult {
        self.exec(
            &self.blob(container, name),
            Operation::UploadBlockBlob(Bytes::copy_from_slice(data)),
        )
        .await
        .unwrap()
    }

    /// Downloads a blob or snapshot.
    pub async fn read(&self, ctx: &RequestContext) -> Bytes {
        match self.exec(ctx, Operation::GetBlob).await.unwrap().payload {
            Payload::Content(data) => data,
            other => panic!("unexpected payload {:?}", other),
        }
    }

    pub async fn stored_blob(&self, container: &str, name: &str) -> BlobModel {
        self.metadata
            .get_blob(&self.blob(container, name).blob_id().unwrap())
            .await
            .unwrap()
    }
}

/// Polls `check` until it returns true, failing after two seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Extent store whose reads wait until the gate is opened.
///
/// Lets tests hold a background copy in flight.
pub struct GatedExtentStore {
    inner: MemoryExtentStore,
    gate: watch::Sender<bool>,
}

impl GatedExtentStore {
    pub fn closed() -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            inner: MemoryExtentStore::new(),
            gate,
        }
    }

    pub fn open(&self) {
        self.gate.send_replace(true);
    }
}

#[async_trait]
impl ExtentStore for GatedExtentStore {
    async fn write(&self, data: Bytes) -> StorageResult<ExtentChunk> {
        self.inner.write(data).await
    }

    async fn create(&self) -> StorageResult<String> {
        self.inner.create().await
    }

    async fn append(&self, extent_id: &str, data: Bytes) -> StorageResult<ExtentChunk> {
        self.inner.append(extent_id, data).await
    }

    async fn read(&self, chunk: &ExtentChunk) -> StorageResult<Bytes> {
        let mut rx = self.gate.subscribe();
        // The sender lives as long as the store, so this only returns once open.
        let _ = rx.wait_for(|open| *open).await;
        self.inner.read(chunk).await
    }

    async fn read_range(
        &self,
        chunk: &ExtentChunk,
        offset: u64,
        count: u64,
    ) -> StorageResult<Bytes> {
        self.inner.read_range(chunk, offset, count).await
    }

    async fn delete(&self, extent_id: &str) -> StorageResult<()> {
        self.inner.delete(extent_id).await
    }

    async fn list_extent_ids(&self) -> StorageResult<Vec<String>> {
        self.inner.list_extent_ids().await
    }

    async fn total_size(&self) -> u64 {
        self.inner.total_size().await
    }

    fn retain(&self, extent_id: &str) {
        self.inner.retain(extent_id)
    }

    fn close(&self, extent_id: &str) {
        self.inner.close(extent_id)
    }

    fn open_extent_ids(&self) -> HashSet<String> {
        self.inner.open_extent_ids()
    }
}
