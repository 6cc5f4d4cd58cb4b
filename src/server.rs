//! Engine lifecycle: store setup, garbage collection and shutdown.

use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::context::RequestContext;
use crate::error::{StorageError, StorageResult};
use crate::handlers::OperationResult;
use crate::router::{dispatch, EngineState, Operation};
use crate::storage::{
    ExtentStore, FsExtentStore, GarbageCollector, MemoryExtentStore, MemoryMetadataStore,
    MetadataStore,
};

/// Blob storage engine.
pub struct BlobServer {
    state: EngineState,
}

impl BlobServer {
    /// Creates an engine over in-memory stores.
    pub fn new(config: Config) -> Self {
        let metadata: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::new());
        let extents: Arc<dyn ExtentStore> =
            Arc::new(MemoryExtentStore::with_limit(config.extent_size_limit));
        Self::with_storage(config, metadata, extents)
    }

    /// Creates an engine over the given stores.
    pub fn with_storage(
        config: Config,
        metadata: Arc<dyn MetadataStore>,
        extents: Arc<dyn ExtentStore>,
    ) -> Self {
        Self {
            state: EngineState::new(config, metadata, extents),
        }
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn config(&self) -> &Config {
        &self.state.config
    }

    /// Runs one operation.
    pub async fn execute(
        &self,
        ctx: &RequestContext,
        op: Operation,
    ) -> StorageResult<OperationResult> {
        dispatch(&self.state, ctx, op).await
    }

    /// Runs the garbage collector until Ctrl-C or a fatal collector error,
    /// then shuts down.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let fatal = Arc::new(Notify::new());
        let failure: Arc<parking_lot::Mutex<Option<String>>> = Arc::default();

        let collector = Arc::new(
            GarbageCollector::new(
                self.state.metadata.clone(),
                self.state.extents.clone(),
                self.state.config.gc_interval,
            )
            .with_lock_table(self.state.locks.clone())
            .on_error({
                let fatal = fatal.clone();
                let failure = failure.clone();
                Arc::new(move |e: &StorageError| {
                    *failure.lock() = Some(e.to_string());
                    fatal.notify_one();
                })
            }),
        );
        let handle = collector.start();

        match self.state.config.workspace() {
            Some(dir) => info!(workspace = %dir.display(), "Blob engine started"),
            None => info!("Blob engine started in memory"),
        }

        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                }
                info!("Shutdown requested");
            }
            _ = fatal.notified() => {
                error!("Garbage collector failed, shutting down");
            }
        }

        collector.close();
        if let Err(e) = handle.await {
            warn!(error = %e, "Garbage collector task ended abnormally");
        }
        self.shutdown().await?;

        let reason = failure.lock().take();
        match reason {
            Some(reason) => Err(reason.into()),
            None => Ok(()),
        }
    }

    /// Stops pending copies and persists metadata.
    pub async fn shutdown(&self) -> StorageResult<()> {
        let pending = self.state.copies.pending_count();
        if pending > 0 {
            info!(pending, "Stopping pending copies");
        }
        self.state.copies.shutdown().await;
        self.state.metadata.checkpoint().await?;
        info!("Blob engine stopped");
        Ok(())
    }
}

/// Builder for creating a blob engine.
pub struct BlobServerBuilder {
    config: Config,
    metadata: Option<Arc<dyn MetadataStore>>,
    extents: Option<Arc<dyn ExtentStore>>,
}

impl BlobServerBuilder {
    /// Creates a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            metadata: None,
            extents: None,
        }
    }

    /// Sets the configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Sets the metadata store.
    pub fn metadata(mut self, metadata: Arc<dyn MetadataStore>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Sets the extent store.
    pub fn extents(mut self, extents: Arc<dyn ExtentStore>) -> Self {
        self.extents = Some(extents);
        self
    }

    /// Builds the engine. Stores not set explicitly live in the workspace
    /// when one is configured and in memory otherwise.
    pub async fn build(self) -> StorageResult<BlobServer> {
        let metadata: Arc<dyn MetadataStore> = match (self.metadata, self.config.metadata_path()) {
            (Some(metadata), _) => metadata,
            (None, Some(path)) => Arc::new(MemoryMetadataStore::open(path).await?),
            (None, None) => Arc::new(MemoryMetadataStore::new()),
        };
        let extents: Arc<dyn ExtentStore> = match (self.extents, self.config.extents_path()) {
            (Some(extents), _) => extents,
            (None, Some(path)) => Arc::new(FsExtentStore::new(path).await?),
            (None, None) => Arc::new(MemoryExtentStore::with_limit(self.config.extent_size_limit)),
        };

        Ok(BlobServer::with_storage(self.config, metadata, extents))
    }
}

impl Default for BlobServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
