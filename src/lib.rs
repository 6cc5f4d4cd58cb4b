//! azurite-engine: the storage core of an Azure Blob Storage emulator.
//!
//! Blob data lives in an extent store, everything else in a metadata store.
//! Operations are typed [`Operation`] values run through a [`BlobServer`],
//! which also owns the background garbage collector and blob copies.
//!
//! # Example
//!
//! ```no_run
//! use azurite_engine::{BlobServerBuilder, Config, Operation, RequestContext};
//! use azurite_engine::models::PublicAccessLevel;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let server = BlobServerBuilder::new().config(Config::default()).build().await?;
//!     let ctx = RequestContext::for_container("devstoreaccount1", "data");
//!     server
//!         .execute(&ctx, Operation::CreateContainer { public_access: PublicAccessLevel::None })
//!         .await?;
//!     server.run().await
//! }
//! ```

pub mod config;
pub mod context;
pub mod copy;
pub mod error;
pub mod handlers;
pub mod lease;
pub mod models;
pub mod page_range;
pub mod router;
pub mod server;
pub mod snapshot;
pub mod storage;

// Re-exports for convenience
pub use config::{Args, Config, DEFAULT_ACCOUNT};
pub use context::RequestContext;
pub use error::{ErrorCode, ErrorKind, StorageError, StorageResult};
pub use handlers::{OperationResult, Payload, ResponseHeaders};
pub use router::{dispatch, EngineState, Operation};
pub use server::{BlobServer, BlobServerBuilder};
pub use storage::{
    ExtentStore, FsExtentStore, GarbageCollector, MemoryExtentStore, MemoryMetadataStore,
    MetadataStore,
};
