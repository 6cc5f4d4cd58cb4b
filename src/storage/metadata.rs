//! Metadata store for containers, blobs, blocks and page ranges.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use crate::error::{ErrorCode, StorageError, StorageResult};
use crate::models::{BlobId, BlobModel, BlockModel, ContainerModel, PageRange, PageRangeModel};

/// Listing options for [`MetadataStore::list_blobs`].
#[derive(Debug, Clone, Default)]
pub struct ListBlobsOptions {
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    /// Continuation marker from a previous page.
    pub marker: Option<String>,
    pub max_results: Option<u32>,
    pub include_snapshots: bool,
    pub include_uncommitted: bool,
}

/// One page of a blob listing.
#[derive(Debug, Clone, Default)]
pub struct BlobListing {
    pub blobs: Vec<BlobModel>,
    pub prefixes: Vec<String>,
    pub next_marker: Option<String>,
}

/// New content for a blob, swapped in by [`MetadataStore::replace_blob_content`].
#[derive(Debug, Clone)]
pub struct BlobContent {
    pub blob: BlobModel,
    /// Block rows that make up the committed block set.
    pub committed_blocks: Vec<BlockModel>,
    pub page_ranges: Vec<PageRangeModel>,
}

/// Trait for metadata storage operations.
///
/// Each call is applied atomically: readers never observe half of a mutation.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    // Container operations
    async fn create_container(&self, container: ContainerModel) -> StorageResult<()>;
    async fn get_container(&self, account: &str, name: &str) -> StorageResult<ContainerModel>;
    async fn update_container(&self, container: ContainerModel) -> StorageResult<()>;
    /// Removes the container with every blob, block and page range in it.
    async fn delete_container(&self, account: &str, name: &str) -> StorageResult<()>;
    async fn list_containers(
        &self,
        account: &str,
        prefix: Option<&str>,
        marker: Option<&str>,
        maxresults: Option<u32>,
    ) -> StorageResult<(Vec<ContainerModel>, Option<String>)>;
    async fn container_exists(&self, account: &str, name: &str) -> bool;

    // Blob operations
    /// Inserts or replaces a blob row.
    async fn put_blob(&self, blob: BlobModel) -> StorageResult<()>;
    /// Inserts a snapshot row, copying the base blob's page ranges.
    async fn create_snapshot(&self, snapshot: BlobModel) -> StorageResult<()>;
    /// Returns a committed blob.
    async fn get_blob(&self, id: &BlobId) -> StorageResult<BlobModel>;
    /// Returns a blob row, including uncommitted stubs.
    async fn find_blob(&self, id: &BlobId) -> StorageResult<Option<BlobModel>>;
    async fn update_blob(&self, blob: BlobModel) -> StorageResult<()>;
    /// Removes one blob row. Removing a base blob also removes its blocks.
    async fn delete_blob(&self, id: &BlobId) -> StorageResult<()>;
    async fn list_blobs(
        &self,
        account: &str,
        container: &str,
        options: &ListBlobsOptions,
    ) -> StorageResult<BlobListing>;
    async fn list_snapshots(&self, id: &BlobId) -> StorageResult<Vec<BlobModel>>;
    /// Deletes every snapshot of a blob, and the base blob too unless
    /// `keep_base`, in one step. Returns the number of snapshots removed.
    async fn delete_blob_and_snapshots(
        &self,
        id: &BlobId,
        keep_base: bool,
    ) -> StorageResult<usize>;
    /// Swaps in a blob row with its committed blocks and page ranges.
    ///
    /// Every other block row of the blob is dropped; the dropped uncommitted
    /// rows are returned so their extents can be released.
    async fn replace_blob_content(&self, content: BlobContent) -> StorageResult<Vec<BlockModel>>;

    // Block operations
    async fn upsert_block(&self, block: BlockModel) -> StorageResult<()>;
    async fn list_blocks(&self, id: &BlobId) -> StorageResult<Vec<BlockModel>>;

    // Page range operations
    /// Returns page range rows sorted by start, optionally only those overlapping `range`.
    async fn list_page_ranges(
        &self,
        id: &BlobId,
        range: Option<PageRange>,
    ) -> StorageResult<Vec<PageRangeModel>>;
    async fn upsert_page_range(&self, id: &BlobId, range: PageRangeModel) -> StorageResult<()>;
    async fn delete_page_ranges(&self, id: &BlobId, starts: &[u64]) -> StorageResult<()>;
    /// Deletes the `removed` rows, inserts `inserted` and writes `blob`, all
    /// in one step.
    async fn update_page_blob(
        &self,
        blob: BlobModel,
        removed: &[u64],
        inserted: Vec<PageRangeModel>,
    ) -> StorageResult<()>;

    /// Returns every extent id referenced by a blob, block or page range row.
    async fn referenced_extent_ids(&self) -> StorageResult<HashSet<String>>;

    /// Flushes the catalog to durable storage, if the store has any.
    async fn checkpoint(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Key type for containers.
type ContainerKey = (String, String);

/// Key type for blocks: base blob, block id, committed flag.
type BlockKey = (BlobId, String, bool);

#[derive(Default)]
struct Catalog {
    containers: BTreeMap<ContainerKey, ContainerModel>,
    /// Blobs indexed by identity; ordering matches listing order.
    blobs: BTreeMap<BlobId, BlobModel>,
    blocks: BTreeMap<BlockKey, BlockModel>,
    page_ranges: HashMap<BlobId, BTreeMap<u64, PageRangeModel>>,
}

/// Serialized form of the catalog.
#[derive(Serialize, Deserialize, Default)]
struct CatalogImage {
    containers: Vec<ContainerModel>,
    blobs: Vec<BlobModel>,
    blocks: Vec<BlockModel>,
    page_ranges: Vec<(BlobId, Vec<PageRangeModel>)>,
}

impl Catalog {
    fn image(&self) -> CatalogImage {
        CatalogImage {
            containers: self.containers.values().cloned().collect(),
            blobs: self.blobs.values().cloned().collect(),
            blocks: self.blocks.values().cloned().collect(),
            page_ranges: self
                .page_ranges
                .iter()
                .map(|(id, rows)| (id.clone(), rows.values().cloned().collect()))
                .collect(),
        }
    }

    fn from_image(image: CatalogImage) -> Self {
        let mut catalog = Catalog::default();
        for container in image.containers {
            catalog
                .containers
                .insert((container.account.clone(), container.name.clone()), container);
        }
        for blob in image.blobs {
            catalog.blobs.insert(blob.id(), blob);
        }
        for block in image.blocks {
            catalog.blocks.insert(
                (block.parent(), block.block_id.clone(), block.committed),
                block,
            );
        }
        for (id, rows) in image.page_ranges {
            catalog
                .page_ranges
                .insert(id, rows.into_iter().map(|r| (r.start, r)).collect());
        }
        catalog
    }

    fn require_container(&self, account: &str, container: &str) -> StorageResult<()> {
        if self
            .containers
            .contains_key(&(account.to_string(), container.to_string()))
        {
            Ok(())
        } else {
            Err(StorageError::new(ErrorCode::ContainerNotFound))
        }
    }

    fn block_keys(&self, base: &BlobId) -> Vec<BlockKey> {
        let start = (base.clone(), String::new(), false);
        self.blocks
            .range(start..)
            .take_while(|(key, _)| &key.0 == base)
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn snapshot_keys(&self, base: &BlobId) -> Vec<BlobId> {
        self.blobs
            .range(base.clone()..)
            .take_while(|(other, _)| {
                other.account == base.account
                    && other.container == base.container
                    && other.name == base.name
            })
            .filter(|(other, _)| other.is_snapshot())
            .map(|(other, _)| other.clone())
            .collect()
    }

    fn swap_rows(&mut self, id: &BlobId, removed: &[u64], inserted: Vec<PageRangeModel>) {
        let rows = self.page_ranges.entry(id.clone()).or_default();
        for start in removed {
            rows.remove(start);
        }
        for row in inserted {
            rows.insert(row.start, row);
        }
        if rows.is_empty() {
            self.page_ranges.remove(id);
        }
    }

    fn remove_blocks(&mut self, base: &BlobId) -> Vec<BlockModel> {
        self.block_keys(base)
            .into_iter()
            .filter_map(|key| self.blocks.remove(&key))
            .collect()
    }
}

/// In-memory implementation of the metadata store, optionally backed by a
/// JSON image on disk.
pub struct MemoryMetadataStore {
    catalog: RwLock<Catalog>,
    /// Where checkpoints are written, if anywhere.
    persist_path: Option<PathBuf>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self {
            catalog: RwLock::new(Catalog::default()),
            persist_path: None,
        }
    }

    /// Opens a store persisted at `path`, loading the previous image if present.
    pub async fn open(path: PathBuf) -> StorageResult<Self> {
        let catalog = match fs::read(&path).await {
            Ok(bytes) => {
                let image: CatalogImage = serde_json::from_slice(&bytes)
                    .map_err(|e| StorageError::internal("Corrupt metadata image", e))?;
                info!(
                    path = %path.display(),
                    containers = image.containers.len(),
                    blobs = image.blobs.len(),
                    "Loaded metadata"
                );
                Catalog::from_image(image)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Catalog::default(),
            Err(e) => return Err(StorageError::internal("Failed to read metadata image", e)),
        };

        Ok(Self {
            catalog: RwLock::new(catalog),
            persist_path: Some(path),
        })
    }

    async fn save_to(&self, path: &Path) -> StorageResult<()> {
        let bytes = {
            let catalog = self.catalog.read();
            serde_json::to_vec(&catalog.image())
                .map_err(|e| StorageError::internal("Failed to encode metadata", e))?
        };

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &bytes)
            .await
            .map_err(|e| StorageError::internal("Failed to write metadata image", e))?;
        fs::rename(&tmp, path)
            .await
            .map_err(|e| StorageError::internal("Failed to replace metadata image", e))?;

        debug!(path = %path.display(), bytes = bytes.len(), "Saved metadata");
        Ok(())
    }
}

impl Default for MemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

fn blob_marker(blob: &BlobModel) -> String {
    if blob.snapshot.is_empty() {
        blob.name.clone()
    } else {
        format!("{}\n{}", blob.name, blob.snapshot)
    }
}

fn parse_blob_marker(marker: &str) -> (&str, &str) {
    marker.split_once('\n').unwrap_or((marker, ""))
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn create_container(&self, container: ContainerModel) -> StorageResult<()> {
        let mut catalog = self.catalog.write();
        let key = (container.account.clone(), container.name.clone());
        if catalog.containers.contains_key(&key) {
            return Err(StorageError::new(ErrorCode::ContainerAlreadyExists));
        }
        catalog.containers.insert(key, container);
        Ok(())
    }

    async fn get_container(&self, account: &str, name: &str) -> StorageResult<ContainerModel> {
        self.catalog
            .read()
            .containers
            .get(&(account.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StorageError::new(ErrorCode::ContainerNotFound))
    }

    async fn update_container(&self, container: ContainerModel) -> StorageResult<()> {
        let mut catalog = self.catalog.write();
        let key = (container.account.clone(), container.name.clone());
        match catalog.containers.get_mut(&key) {
            Some(existing) => {
                *existing = container;
                Ok(())
            }
            None => Err(StorageError::new(ErrorCode::ContainerNotFound)),
        }
    }

    async fn delete_container(&self, account: &str, name: &str) -> StorageResult<()> {
        let mut catalog = self.catalog.write();
        if catalog
            .containers
            .remove(&(account.to_string(), name.to_string()))
            .is_none()
        {
            return Err(StorageError::new(ErrorCode::ContainerNotFound));
        }

        let in_container = |id: &BlobId| id.account == account && id.container == name;
        catalog.blobs.retain(|id, _| !in_container(id));
        catalog.blocks.retain(|key, _| !in_container(&key.0));
        catalog.page_ranges.retain(|id, _| !in_container(id));
        Ok(())
    }

    async fn list_containers(
        &self,
        account: &str,
        prefix: Option<&str>,
        marker: Option<&str>,
        maxresults: Option<u32>,
    ) -> StorageResult<(Vec<ContainerModel>, Option<String>)> {
        let maxresults = maxresults.unwrap_or(5000) as usize;
        let catalog = self.catalog.read();

        let mut containers: Vec<ContainerModel> = catalog
            .containers
            .values()
            .filter(|c| c.account == account)
            .filter(|c| prefix.map_or(true, |p| c.name.starts_with(p)))
            .filter(|c| marker.map_or(true, |m| c.name.as_str() > m))
            .take(maxresults + 1)
            .cloned()
            .collect();

        let next_marker = if containers.len() > maxresults {
            containers.truncate(maxresults);
            containers.last().map(|c| c.name.clone())
        } else {
            None
        };

        Ok((containers, next_marker))
    }

    async fn container_exists(&self, account: &str, name: &str) -> bool {
        self.catalog
            .read()
            .containers
            .contains_key(&(account.to_string(), name.to_string()))
    }

    async fn put_blob(&self, blob: BlobModel) -> StorageResult<()> {
        let mut catalog = self.catalog.write();
        catalog.require_container(&blob.account, &blob.container)?;
        catalog.blobs.insert(blob.id(), blob);
        Ok(())
    }

    async fn create_snapshot(&self, snapshot: BlobModel) -> StorageResult<()> {
        let mut catalog = self.catalog.write();
        catalog.require_container(&snapshot.account, &snapshot.container)?;

        let id = snapshot.id();
        if catalog.blobs.contains_key(&id) {
            return Err(StorageError::new(ErrorCode::BlobAlreadyExists));
        }

        if let Some(rows) = catalog.page_ranges.get(&id.base()).cloned() {
            catalog.page_ranges.insert(id.clone(), rows);
        }
        catalog.blobs.insert(id, snapshot);
        Ok(())
    }

    async fn get_blob(&self, id: &BlobId) -> StorageResult<BlobModel> {
        let catalog = self.catalog.read();
        catalog.require_container(&id.account, &id.container)?;
        catalog
            .blobs
            .get(id)
            .filter(|b| b.committed)
            .cloned()
            .ok_or_else(|| StorageError::new(ErrorCode::BlobNotFound))
    }

    async fn find_blob(&self, id: &BlobId) -> StorageResult<Option<BlobModel>> {
        let catalog = self.catalog.read();
        catalog.require_container(&id.account, &id.container)?;
        Ok(catalog.blobs.get(id).cloned())
    }

    async fn update_blob(&self, blob: BlobModel) -> StorageResult<()> {
        let mut catalog = self.catalog.write();
        catalog.require_container(&blob.account, &blob.container)?;
        match catalog.blobs.get_mut(&blob.id()) {
            Some(existing) => {
                *existing = blob;
                Ok(())
            }
            None => Err(StorageError::new(ErrorCode::BlobNotFound)),
        }
    }

    async fn delete_blob(&self, id: &BlobId) -> StorageResult<()> {
        let mut catalog = self.catalog.write();
        catalog.require_container(&id.account, &id.container)?;
        if catalog.blobs.remove(id).is_none() {
            return Err(StorageError::new(ErrorCode::BlobNotFound));
        }
        catalog.page_ranges.remove(id);
        if !id.is_snapshot() {
            catalog.remove_blocks(id);
        }
        Ok(())
    }

    async fn list_blobs(
        &self,
        account: &str,
        container: &str,
        options: &ListBlobsOptions,
    ) -> StorageResult<BlobListing> {
        let maxresults = options.max_results.unwrap_or(5000) as usize;
        let prefix = options.prefix.as_deref().unwrap_or("");
        let catalog = self.catalog.read();
        catalog.require_container(account, container)?;

        let start = BlobId::new(account, container, prefix);
        let (marker_name, marker_snapshot) = options
            .marker
            .as_deref()
            .map(parse_blob_marker)
            .unwrap_or(("", ""));

        let candidates = catalog
            .blobs
            .range(start..)
            .take_while(|(id, _)| {
                id.account == account && id.container == container && id.name.starts_with(prefix)
            })
            .map(|(_, blob)| blob)
            .filter(|b| (b.name.as_str(), b.snapshot.as_str()) >= (marker_name, marker_snapshot))
            .filter(|b| options.include_snapshots || b.snapshot.is_empty())
            .filter(|b| options.include_uncommitted || b.committed);

        let mut listing = BlobListing::default();
        let mut returned = 0usize;

        for blob in candidates {
            let virtual_dir = options.delimiter.as_deref().and_then(|delim| {
                blob.name[prefix.len()..]
                    .find(delim)
                    .map(|idx| blob.name[..prefix.len() + idx + delim.len()].to_string())
            });

            if let Some(dir) = &virtual_dir {
                if listing.prefixes.last() == Some(dir) {
                    continue;
                }
            }

            if returned == maxresults {
                listing.next_marker = Some(match virtual_dir {
                    Some(dir) => dir,
                    None => blob_marker(blob),
                });
                break;
            }

            match virtual_dir {
                Some(dir) => listing.prefixes.push(dir),
                None => listing.blobs.push(blob.clone()),
            }
            returned += 1;
        }

        Ok(listing)
    }

    async fn list_snapshots(&self, id: &BlobId) -> StorageResult<Vec<BlobModel>> {
        let catalog = self.catalog.read();
        Ok(catalog
            .snapshot_keys(&id.base())
            .iter()
            .filter_map(|key| catalog.blobs.get(key).cloned())
            .collect())
    }

    async fn delete_blob_and_snapshots(
        &self,
        id: &BlobId,
        keep_base: bool,
    ) -> StorageResult<usize> {
        let mut catalog = self.catalog.write();
        catalog.require_container(&id.account, &id.container)?;
        let base = id.base();
        if !catalog.blobs.contains_key(&base) {
            return Err(StorageError::new(ErrorCode::BlobNotFound));
        }

        let snapshots = catalog.snapshot_keys(&base);
        for key in &snapshots {
            catalog.blobs.remove(key);
            catalog.page_ranges.remove(key);
        }
        if !keep_base {
            catalog.blobs.remove(&base);
            catalog.page_ranges.remove(&base);
            catalog.remove_blocks(&base);
        }
        Ok(snapshots.len())
    }

    async fn replace_blob_content(&self, content: BlobContent) -> StorageResult<Vec<BlockModel>> {
        let mut catalog = self.catalog.write();
        catalog.require_container(&content.blob.account, &content.blob.container)?;

        let id = content.blob.id();
        let kept: HashSet<&str> = content
            .committed_blocks
            .iter()
            .map(|b| b.extent_chunk.id.as_str())
            .collect();
        let discarded: Vec<BlockModel> = catalog
            .remove_blocks(&id)
            .into_iter()
            .filter(|b| !b.committed && !kept.contains(b.extent_chunk.id.as_str()))
            .collect();

        for mut block in content.committed_blocks {
            block.committed = true;
            catalog
                .blocks
                .insert((id.clone(), block.block_id.clone(), true), block);
        }

        if content.page_ranges.is_empty() {
            catalog.page_ranges.remove(&id);
        } else {
            catalog.page_ranges.insert(
                id.clone(),
                content
                    .page_ranges
                    .into_iter()
                    .map(|r| (r.start, r))
                    .collect(),
            );
        }

        catalog.blobs.insert(id, content.blob);
        Ok(discarded)
    }

    async fn upsert_block(&self, block: BlockModel) -> StorageResult<()> {
        let mut catalog = self.catalog.write();
        catalog.require_container(&block.account, &block.container)?;
        let key = (block.parent(), block.block_id.clone(), block.committed);
        catalog.blocks.insert(key, block);
        Ok(())
    }

    async fn list_blocks(&self, id: &BlobId) -> StorageResult<Vec<BlockModel>> {
        let catalog = self.catalog.read();
        catalog.require_container(&id.account, &id.container)?;
        let base = id.base();
        let mut blocks: Vec<BlockModel> = catalog
            .block_keys(&base)
            .iter()
            .filter_map(|key| catalog.blocks.get(key).cloned())
            .collect();
        blocks.sort_by(|a, b| {
            a.staged_time
                .cmp(&b.staged_time)
                .then_with(|| a.block_id.cmp(&b.block_id))
        });
        Ok(blocks)
    }

    async fn list_page_ranges(
        &self,
        id: &BlobId,
        range: Option<PageRange>,
    ) -> StorageResult<Vec<PageRangeModel>> {
        let catalog = self.catalog.read();
        let Some(rows) = catalog.page_ranges.get(id) else {
            return Ok(Vec::new());
        };
        Ok(match range {
            None => rows.values().cloned().collect(),
            Some(range) => {
                // The only row starting before `range` that can overlap it is the
                // last one starting at or below `range.start`.
                let head = rows
                    .range(..=range.start)
                    .next_back()
                    .filter(|(_, r)| r.end >= range.start)
                    .map(|(_, r)| r.clone());
                let tail = rows
                    .range(range.start..)
                    .take_while(|(start, _)| **start <= range.end)
                    .filter(|(start, _)| **start != range.start)
                    .map(|(_, r)| r.clone());
                head.into_iter().chain(tail).collect()
            }
        })
    }

    async fn upsert_page_range(&self, id: &BlobId, range: PageRangeModel) -> StorageResult<()> {
        let mut catalog = self.catalog.write();
        catalog.require_container(&id.account, &id.container)?;
        catalog
            .page_ranges
            .entry(id.clone())
            .or_default()
            .insert(range.start, range);
        Ok(())
    }

    async fn delete_page_ranges(&self, id: &BlobId, starts: &[u64]) -> StorageResult<()> {
        let mut catalog = self.catalog.write();
        catalog.require_container(&id.account, &id.container)?;
        catalog.swap_rows(id, starts, Vec::new());
        Ok(())
    }

    async fn update_page_blob(
        &self,
        blob: BlobModel,
        removed: &[u64],
        inserted: Vec<PageRangeModel>,
    ) -> StorageResult<()> {
        let mut catalog = self.catalog.write();
        catalog.require_container(&blob.account, &blob.container)?;
        let id = blob.id();
        if !catalog.blobs.contains_key(&id) {
            return Err(StorageError::new(ErrorCode::BlobNotFound));
        }
        catalog.swap_rows(&id, removed, inserted);
        catalog.blobs.insert(id, blob);
        Ok(())
    }

    async fn referenced_extent_ids(&self) -> StorageResult<HashSet<String>> {
        let catalog = self.catalog.read();
        let mut ids = HashSet::new();
        for blob in catalog.blobs.values() {
            ids.extend(blob.extent_ids().map(str::to_string));
        }
        for block in catalog.blocks.values() {
            ids.insert(block.extent_chunk.id.clone());
        }
        for rows in catalog.page_ranges.values() {
            for row in rows.values() {
                ids.extend(row.extent_chunks.iter().map(|c| c.id.clone()));
            }
        }
        Ok(ids)
    }

    async fn checkpoint(&self) -> StorageResult<()> {
        match &self.persist_path {
            Some(path) => self.save_to(path).await,
            None => Ok(()),
        }
    }
}
