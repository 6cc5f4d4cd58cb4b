//! Blob data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::block::CommittedBlock;
use super::lease::Lease;

/// Blob types supported by Azure Blob Storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobType {
    BlockBlob,
    PageBlob,
    AppendBlob,
}

impl BlobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobType::BlockBlob => "BlockBlob",
            BlobType::PageBlob => "PageBlob",
            BlobType::AppendBlob => "AppendBlob",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "BlockBlob" => Some(BlobType::BlockBlob),
            "PageBlob" => Some(BlobType::PageBlob),
            "AppendBlob" => Some(BlobType::AppendBlob),
            _ => None,
        }
    }
}

/// Access tiers for blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AccessTier {
    #[default]
    Hot,
    Cool,
    Cold,
    Archive,
}

impl AccessTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessTier::Hot => "Hot",
            AccessTier::Cool => "Cool",
            AccessTier::Cold => "Cold",
            AccessTier::Archive => "Archive",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "hot" => Some(AccessTier::Hot),
            "cool" => Some(AccessTier::Cool),
            "cold" => Some(AccessTier::Cold),
            "archive" => Some(AccessTier::Archive),
            _ => None,
        }
    }
}

/// Pending move of an archived blob back to an online tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rehydration {
    pub target: AccessTier,
    pub completes_on: DateTime<Utc>,
}

/// Copy status for blob copy operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyStatus {
    Pending,
    Success,
    Aborted,
    Failed,
}

impl CopyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CopyStatus::Pending => "pending",
            CopyStatus::Success => "success",
            CopyStatus::Aborted => "aborted",
            CopyStatus::Failed => "failed",
        }
    }
}

/// Reference to data stored in an extent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentChunk {
    /// UUID of the extent containing this data.
    pub id: String,
    /// Byte offset within the extent.
    pub offset: u64,
    /// Number of bytes.
    pub count: u64,
}

impl ExtentChunk {
    pub fn new(id: String, offset: u64, count: u64) -> Self {
        Self { id, offset, count }
    }

    /// Returns the sub-chunk covering `count` bytes starting `skip` bytes in.
    pub fn slice(&self, skip: u64, count: u64) -> Self {
        Self::new(self.id.clone(), self.offset + skip, count)
    }
}

/// Returns the sub-chunks covering `count` bytes, `skip` bytes into `chunks`.
pub fn slice_chunks(chunks: &[ExtentChunk], mut skip: u64, mut count: u64) -> Vec<ExtentChunk> {
    let mut out = Vec::new();
    for chunk in chunks {
        if count == 0 {
            break;
        }
        if skip >= chunk.count {
            skip -= chunk.count;
            continue;
        }
        let take = (chunk.count - skip).min(count);
        out.push(chunk.slice(skip, take));
        count -= take;
        skip = 0;
    }
    out
}

/// Identity of a blob: base blob when `snapshot` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobId {
    pub account: String,
    pub container: String,
    pub name: String,
    pub snapshot: String,
}

impl BlobId {
    pub fn new(
        account: impl Into<String>,
        container: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            account: account.into(),
            container: container.into(),
            name: name.into(),
            snapshot: String::new(),
        }
    }

    pub fn with_snapshot(mut self, snapshot: impl Into<String>) -> Self {
        self.snapshot = snapshot.into();
        self
    }

    /// Returns the identity of the base blob this id belongs to.
    pub fn base(&self) -> Self {
        Self::new(&self.account, &self.container, &self.name)
    }

    pub fn is_snapshot(&self) -> bool {
        !self.snapshot.is_empty()
    }

    /// Key used to serialize writers on this identity.
    pub fn lock_key(&self) -> String {
        format!("{}/{}/{}", self.account, self.container, self.name)
    }
}

/// Blob properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobProperties {
    pub content_length: u64,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    pub content_md5: Option<String>,
    pub content_disposition: Option<String>,
    pub cache_control: Option<String>,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
    pub created_on: DateTime<Utc>,
    pub blob_type: BlobType,
    pub access_tier: AccessTier,
    /// Whether the tier was defaulted rather than set explicitly.
    pub access_tier_inferred: bool,
    pub access_tier_change_time: Option<DateTime<Utc>>,
    pub rehydration: Option<Rehydration>,
    /// Sequence number for page blobs.
    pub sequence_number: Option<u64>,
    /// Committed block count for append blobs.
    pub committed_block_count: Option<u32>,
    /// Whether the append blob is sealed.
    pub is_sealed: Option<bool>,
    /// Copy ID for ongoing/completed copy operations.
    pub copy_id: Option<String>,
    /// Copy source URL.
    pub copy_source: Option<String>,
    /// Copy status.
    pub copy_status: Option<CopyStatus>,
    /// Copy progress (bytes copied / total bytes).
    pub copy_progress: Option<String>,
    /// Copy completion time.
    pub copy_completion_time: Option<DateTime<Utc>>,
    /// Copy status description (for failed copies).
    pub copy_status_description: Option<String>,
}

impl BlobProperties {
    /// Creates new blob properties for the given blob type.
    pub fn new(blob_type: BlobType, content_length: u64, now: DateTime<Utc>) -> Self {
        let mut props = Self {
            content_length,
            content_type: Some("application/octet-stream".to_string()),
            content_encoding: None,
            content_language: None,
            content_md5: None,
            content_disposition: None,
            cache_control: None,
            etag: new_etag(),
            last_modified: now,
            created_on: now,
            blob_type,
            access_tier: AccessTier::Hot,
            access_tier_inferred: true,
            access_tier_change_time: None,
            rehydration: None,
            sequence_number: None,
            committed_block_count: None,
            is_sealed: None,
            copy_id: None,
            copy_source: None,
            copy_status: None,
            copy_progress: None,
            copy_completion_time: None,
            copy_status_description: None,
        };

        match blob_type {
            BlobType::PageBlob => {
                props.sequence_number = Some(0);
            }
            BlobType::AppendBlob => {
                props.committed_block_count = Some(0);
                props.is_sealed = Some(false);
            }
            BlobType::BlockBlob => {}
        }

        props
    }

    /// Updates the ETag and last modified time.
    pub fn update_etag(&mut self, now: DateTime<Utc>) {
        self.etag = new_etag();
        self.last_modified = now;
    }

    /// Clears every copy-related field.
    pub fn clear_copy(&mut self) {
        self.copy_id = None;
        self.copy_source = None;
        self.copy_status = None;
        self.copy_progress = None;
        self.copy_completion_time = None;
        self.copy_status_description = None;
    }

    /// Returns the tier in effect at `now`, completing any due rehydration.
    pub fn effective_tier(&self, now: DateTime<Utc>) -> AccessTier {
        match self.rehydration {
            Some(r) if r.completes_on <= now => r.target,
            _ => self.access_tier,
        }
    }

    /// Returns the archive status string while a rehydration is pending.
    pub fn archive_status(&self, now: DateTime<Utc>) -> Option<String> {
        match self.rehydration {
            Some(r) if r.completes_on > now => Some(format!(
                "rehydrate-pending-to-{}",
                r.target.as_str().to_lowercase()
            )),
            _ => None,
        }
    }

    /// Folds a completed rehydration into the stored tier.
    pub fn settle_rehydration(&mut self, now: DateTime<Utc>) {
        if let Some(r) = self.rehydration {
            if r.completes_on <= now {
                self.access_tier = r.target;
                self.access_tier_change_time = Some(r.completes_on);
                self.rehydration = None;
            }
        }
    }
}

/// Generates a fresh ETag value.
pub fn new_etag() -> String {
    format!("\"0x{}\"", uuid::Uuid::new_v4().simple())
}

/// Complete blob model stored in metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobModel {
    /// Account name.
    pub account: String,
    /// Container name.
    pub container: String,
    /// Blob name (full path).
    pub name: String,
    /// Snapshot timestamp (empty for base blob). Snapshots share the base
    /// blob's name, which is their link back to the lineage they came from.
    pub snapshot: String,
    /// Blob properties.
    pub properties: BlobProperties,
    /// User-defined metadata.
    pub metadata: HashMap<String, String>,
    /// Lease on the blob (always available on snapshots).
    pub lease: Lease,
    /// Committed block layout of a block blob, in order.
    pub committed_blocks: Vec<CommittedBlock>,
    /// References to extent data chunks (block and append blobs).
    pub extent_chunks: Vec<ExtentChunk>,
    /// False while the blob only exists as a stub for staged blocks.
    pub committed: bool,
}

impl BlobModel {
    /// Creates a new, committed blob model.
    pub fn new(id: &BlobId, blob_type: BlobType, content_length: u64, now: DateTime<Utc>) -> Self {
        Self {
            account: id.account.clone(),
            container: id.container.clone(),
            name: id.name.clone(),
            snapshot: id.snapshot.clone(),
            properties: BlobProperties::new(blob_type, content_length, now),
            metadata: HashMap::new(),
            lease: Lease::default(),
            committed_blocks: Vec::new(),
            extent_chunks: Vec::new(),
            committed: true,
        }
    }

    /// Creates the zero-length placeholder that holds a name while blocks are staged.
    pub fn uncommitted_stub(id: &BlobId, now: DateTime<Utc>) -> Self {
        let mut blob = Self::new(id, BlobType::BlockBlob, 0, now);
        blob.committed = false;
        blob
    }

    /// Returns the identity of this blob.
    pub fn id(&self) -> BlobId {
        BlobId {
            account: self.account.clone(),
            container: self.container.clone(),
            name: self.name.clone(),
            snapshot: self.snapshot.clone(),
        }
    }

    /// Creates a snapshot of this blob stamped with `snapshot_time`.
    pub fn create_snapshot(&self, snapshot_time: &str) -> Self {
        let mut snapshot = self.clone();
        snapshot.snapshot = snapshot_time.to_string();
        snapshot.lease = Lease::default();
        snapshot
    }

    /// Returns the chunks holding the content of a block or append blob, in order.
    pub fn content_chunks(&self) -> Vec<ExtentChunk> {
        if self.committed_blocks.is_empty() {
            self.extent_chunks.clone()
        } else {
            self.committed_blocks
                .iter()
                .map(|b| b.extent_chunk.clone())
                .collect()
        }
    }

    /// Returns every extent id this row references.
    pub fn extent_ids(&self) -> impl Iterator<Item = &str> {
        self.extent_chunks
            .iter()
            .chain(self.committed_blocks.iter().map(|b| &b.extent_chunk))
            .map(|c| c.id.as_str())
    }
}
