//! Block data models for block blobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::blob::{BlobId, ExtentChunk};

/// Maximum number of committed blocks in a block blob.
pub const MAX_COMMITTED_BLOCKS: usize = 50_000;

/// Maximum decoded length of a block ID.
pub const MAX_BLOCK_ID_LENGTH: usize = 64;

/// Where a block named in a commit request is looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockState {
    /// Only among committed blocks.
    Committed,
    /// Only among staged blocks.
    Uncommitted,
    /// The most recently written version, staged or committed.
    Latest,
}

impl BlockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockState::Uncommitted => "Uncommitted",
            BlockState::Committed => "Committed",
            BlockState::Latest => "Latest",
        }
    }
}

/// Block list type for GetBlockList operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockListType {
    Committed,
    Uncommitted,
    #[default]
    All,
}

impl BlockListType {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "committed" => BlockListType::Committed,
            "uncommitted" => BlockListType::Uncommitted,
            _ => BlockListType::All,
        }
    }
}

/// One entry of a commit request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockListItem {
    pub block_id: String,
    pub state: BlockState,
}

impl BlockListItem {
    pub fn new(block_id: impl Into<String>, state: BlockState) -> Self {
        Self {
            block_id: block_id.into(),
            state,
        }
    }

    pub fn latest(block_id: impl Into<String>) -> Self {
        Self::new(block_id, BlockState::Latest)
    }
}

/// A block belonging to a block blob, staged or committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockModel {
    /// Account name.
    pub account: String,
    /// Container name.
    pub container: String,
    /// Blob name.
    pub blob: String,
    /// Block ID (base64 encoded).
    pub block_id: String,
    /// Block size in bytes.
    pub size: u64,
    /// Reference to extent data.
    pub extent_chunk: ExtentChunk,
    /// Whether the block is part of the committed block list.
    pub committed: bool,
    /// When the block was staged.
    pub staged_time: DateTime<Utc>,
}

impl BlockModel {
    /// Creates a new, uncommitted block model.
    pub fn new(
        blob: &BlobId,
        block_id: String,
        extent_chunk: ExtentChunk,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            account: blob.account.clone(),
            container: blob.container.clone(),
            blob: blob.name.clone(),
            block_id,
            size: extent_chunk.count,
            extent_chunk,
            committed: false,
            staged_time: now,
        }
    }

    /// Returns the identity of the parent blob.
    pub fn parent(&self) -> BlobId {
        BlobId::new(&self.account, &self.container, &self.blob)
    }
}

/// Block entry in a committed block list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommittedBlock {
    pub block_id: String,
    pub size: u64,
    pub extent_chunk: ExtentChunk,
}

impl From<&BlockModel> for CommittedBlock {
    fn from(block: &BlockModel) -> Self {
        Self {
            block_id: block.block_id.clone(),
            size: block.size,
            extent_chunk: block.extent_chunk.clone(),
        }
    }
}
