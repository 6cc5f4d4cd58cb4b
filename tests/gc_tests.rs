//! Garbage collection and persistence tests.

mod common;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use azurite_engine::config::Args;
use azurite_engine::handlers::DeleteSnapshots;
use azurite_engine::models::ExtentChunk;
use azurite_engine::storage::{write_pinned, CollectorState};
use azurite_engine::{
    BlobServerBuilder, Config, ErrorCode, ExtentStore, FsExtentStore, GarbageCollector,
    MemoryExtentStore, MemoryMetadataStore, MetadataStore, Operation, StorageError, StorageResult,
};
use common::{eventually, TestEngine, ACCOUNT};

async fn fs_engine(dir: &tempfile::TempDir) -> TestEngine {
    let extents = FsExtentStore::new(dir.path().join("extents")).await.unwrap();
    TestEngine::with_extents(Arc::new(extents))
}

fn collector(engine: &TestEngine) -> GarbageCollector {
    GarbageCollector::new(
        engine.metadata.clone(),
        engine.extents.clone(),
        Duration::from_secs(60),
    )
}

#[tokio::test]
async fn test_sweep_deletes_only_orphans() {
    let dir = tempfile::tempdir().unwrap();
    let engine = fs_engine(&dir).await;
    engine.create_container("sweeps").await;
    engine.put_block_blob("sweeps", "kept.bin", b"referenced bytes").await;

    let orphan = engine
        .extents
        .write(Bytes::from_static(b"nobody points here"))
        .await
        .unwrap();
    engine.extents.close(&orphan.id);

    let report = collector(&engine).sweep().await.unwrap();
    assert_eq!(report.scanned, 2);
    assert_eq!(report.deleted, 1);

    let remaining = engine.extents.list_extent_ids().await.unwrap();
    assert!(!remaining.contains(&orphan.id));
    assert!(!dir.path().join("extents").join(&orphan.id).exists());
    assert_eq!(
        engine.read(&engine.blob("sweeps", "kept.bin")).await,
        "referenced bytes"
    );

    // A second pass finds nothing left to do
    let report = collector(&engine).sweep().await.unwrap();
    assert_eq!(report.deleted, 0);
}

#[tokio::test]
async fn test_sweep_skips_open_extents() {
    let engine = TestEngine::new();
    let (chunk, pin) = write_pinned(&engine.extents, Bytes::from_static(b"in flight"))
        .await
        .unwrap();

    let gc = collector(&engine);
    let report = gc.sweep().await.unwrap();
    assert_eq!(report.deleted, 0);
    assert_eq!(report.skipped_open, 1);
    assert!(engine.extents.read(&chunk).await.is_ok());

    drop(pin);
    let report = gc.sweep().await.unwrap();
    assert_eq!(report.deleted, 1);
    assert!(engine.extents.list_extent_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_snapshot_keeps_shared_extents() {
    let dir = tempfile::tempdir().unwrap();
    let engine = fs_engine(&dir).await;
    engine.create_container("snapgc").await;
    engine.put_block_blob("snapgc", "doc", b"version one").await;
    let base = engine.blob("snapgc", "doc");

    let snapshot = engine
        .exec(&base, Operation::SnapshotBlob)
        .await
        .unwrap()
        .headers
        .snapshot
        .unwrap();
    engine.put_block_blob("snapgc", "doc", b"version two").await;

    let gc = collector(&engine);
    assert_eq!(gc.sweep().await.unwrap().deleted, 0);

    let snap_ctx = engine.blob("snapgc", "doc").with_snapshot(snapshot);
    assert_eq!(engine.read(&snap_ctx).await, "version one");

    engine
        .exec(
            &base,
            Operation::DeleteBlob {
                delete_snapshots: Some(DeleteSnapshots::Only),
            },
        )
        .await
        .unwrap();
    assert_eq!(gc.sweep().await.unwrap().deleted, 1);
    assert_eq!(engine.read(&base).await, "version two");
}

#[tokio::test]
async fn test_container_delete_frees_extents() {
    let engine = TestEngine::new();
    engine.create_container("dropme").await;
    for name in ["a", "b", "c"] {
        engine.put_block_blob("dropme", name, name.as_bytes()).await;
    }

    engine
        .exec(&engine.container("dropme"), Operation::DeleteContainer)
        .await
        .unwrap();
    let report = collector(&engine).sweep().await.unwrap();
    assert_eq!(report.deleted, 3);
    assert_eq!(engine.extents.total_size().await, 0);
}

#[tokio::test]
async fn test_collector_loop_runs_until_closed() {
    let engine = TestEngine::new();
    let orphan = engine
        .extents
        .write(Bytes::from_static(b"orphan"))
        .await
        .unwrap();
    engine.extents.close(&orphan.id);

    let gc = Arc::new(GarbageCollector::new(
        engine.metadata.clone(),
        engine.extents.clone(),
        Duration::from_millis(10),
    ));
    assert_eq!(gc.state(), CollectorState::Initializing);
    let handle = gc.start();

    let extents = engine.extents.clone();
    eventually(move || {
        let extents = extents.clone();
        async move { extents.list_extent_ids().await.unwrap().is_empty() }
    })
    .await;
    assert_eq!(gc.state(), CollectorState::Running);

    gc.close();
    handle.await.unwrap();
    assert_eq!(gc.state(), CollectorState::Closed);
}

#[tokio::test]
async fn test_closing_before_start_never_runs() {
    let engine = TestEngine::new();
    let gc = Arc::new(collector(&engine));
    gc.close();
    assert_eq!(gc.state(), CollectorState::Closed);

    // The loop sees the closed state and returns at once
    tokio::time::timeout(Duration::from_secs(1), gc.start())
        .await
        .unwrap()
        .unwrap();
}

/// Extent store whose listing always fails.
struct BrokenListing(MemoryExtentStore);

#[async_trait]
impl ExtentStore for BrokenListing {
    async fn write(&self, data: Bytes) -> StorageResult<ExtentChunk> {
        self.0.write(data).await
    }

    async fn create(&self) -> StorageResult<String> {
        self.0.create().await
    }

    async fn append(&self, extent_id: &str, data: Bytes) -> StorageResult<ExtentChunk> {
        self.0.append(extent_id, data).await
    }

    async fn read(&self, chunk: &ExtentChunk) -> StorageResult<Bytes> {
        self.0.read(chunk).await
    }

    async fn read_range(
        &self,
        chunk: &ExtentChunk,
        offset: u64,
        count: u64,
    ) -> StorageResult<Bytes> {
        self.0.read_range(chunk, offset, count).await
    }

    async fn delete(&self, extent_id: &str) -> StorageResult<()> {
        self.0.delete(extent_id).await
    }

    async fn list_extent_ids(&self) -> StorageResult<Vec<String>> {
        Err(StorageError::with_message(
            ErrorCode::InternalError,
            "extent listing unavailable",
        ))
    }

    async fn total_size(&self) -> u64 {
        self.0.total_size().await
    }

    fn retain(&self, extent_id: &str) {
        self.0.retain(extent_id)
    }

    fn close(&self, extent_id: &str) {
        self.0.close(extent_id)
    }

    fn open_extent_ids(&self) -> HashSet<String> {
        self.0.open_extent_ids()
    }
}

#[tokio::test]
async fn test_failed_sweep_closes_collector_and_reports() {
    let metadata: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::new());
    let extents: Arc<dyn ExtentStore> = Arc::new(BrokenListing(MemoryExtentStore::new()));

    let reported = Arc::new(Mutex::new(Vec::new()));
    let sink = reported.clone();
    let gc = Arc::new(
        GarbageCollector::new(metadata, extents, Duration::from_millis(10)).on_error(Arc::new(
            move |e: &StorageError| sink.lock().push(e.code),
        )),
    );

    tokio::time::timeout(Duration::from_secs(2), gc.start())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(gc.state(), CollectorState::Closed);
    assert_eq!(*reported.lock(), [ErrorCode::InternalError]);
}

#[tokio::test]
async fn test_workspace_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = || {
        Config::from(Args {
            location: Some(dir.path().to_path_buf()),
            in_memory: false,
            ..Args::default()
        })
    };

    let server = BlobServerBuilder::new().config(config()).build().await.unwrap();
    let engine = TestEngine {
        metadata: server.state().metadata.clone(),
        extents: server.state().extents.clone(),
        server,
    };
    engine.create_container("durable").await;
    engine.put_block_blob("durable", "saved.txt", b"still here").await;
    engine.server.shutdown().await.unwrap();
    drop(engine);

    assert!(dir.path().join("metadata.json").exists());

    let server = BlobServerBuilder::new().config(config()).build().await.unwrap();
    let ctx = azurite_engine::RequestContext::for_blob(ACCOUNT, "durable", "saved.txt");
    let result = server.execute(&ctx, Operation::GetBlob).await.unwrap();
    match result.payload {
        azurite_engine::Payload::Content(data) => assert_eq!(data, "still here"),
        other => panic!("unexpected payload {:?}", other),
    }
}
