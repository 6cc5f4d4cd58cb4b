//! Extent store for blob data.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;
use uuid::Uuid;

use crate::error::{ErrorCode, StorageError, StorageResult};
use crate::models::ExtentChunk;

/// Trait for extent (blob data) storage operations.
///
/// Extents created by [`ExtentStore::write`] or [`ExtentStore::create`] are
/// *open for write* until [`ExtentStore::close`] is called. Open extents are
/// never reclaimed by the garbage collector, which covers the window between
/// writing bytes and committing the metadata that references them. Use
/// [`write_pinned`] / [`create_pinned`] so the close happens on drop.
#[async_trait]
pub trait ExtentStore: Send + Sync {
    /// Writes data to a new extent and returns an ExtentChunk reference.
    async fn write(&self, data: Bytes) -> StorageResult<ExtentChunk>;

    /// Creates a new empty extent and returns its id.
    async fn create(&self) -> StorageResult<String>;

    /// Appends data to an existing extent.
    async fn append(&self, extent_id: &str, data: Bytes) -> StorageResult<ExtentChunk>;

    /// Reads data from the extent store.
    async fn read(&self, chunk: &ExtentChunk) -> StorageResult<Bytes>;

    /// Reads a range of data from the extent store.
    async fn read_range(
        &self,
        chunk: &ExtentChunk,
        offset: u64,
        count: u64,
    ) -> StorageResult<Bytes>;

    /// Deletes an extent from the store.
    async fn delete(&self, extent_id: &str) -> StorageResult<()>;

    /// Lists the ids of every stored extent.
    async fn list_extent_ids(&self) -> StorageResult<Vec<String>>;

    /// Returns the total size of all extents.
    async fn total_size(&self) -> u64;

    /// Marks an existing extent as open, keeping the collector off it.
    fn retain(&self, extent_id: &str);

    /// Marks a previously created extent as no longer open for write.
    fn close(&self, extent_id: &str);

    /// Returns the ids of extents currently open for write.
    fn open_extent_ids(&self) -> HashSet<String>;
}

/// Reference-counted set of extents open for write.
#[derive(Default)]
pub struct OpenExtents {
    open: DashMap<Arc<str>, usize>,
}

impl OpenExtents {
    pub fn open(&self, extent_id: &str) {
        *self.open.entry(Arc::from(extent_id)).or_insert(0) += 1;
    }

    pub fn close(&self, extent_id: &str) {
        self.open.remove_if_mut(extent_id, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }

    pub fn contains(&self, extent_id: &str) -> bool {
        self.open.contains_key(extent_id)
    }

    pub fn ids(&self) -> HashSet<String> {
        self.open.iter().map(|e| e.key().to_string()).collect()
    }
}

/// Keeps an extent open for write until dropped.
pub struct ExtentPin {
    store: Arc<dyn ExtentStore>,
    extent_id: String,
}

impl ExtentPin {
    pub fn extent_id(&self) -> &str {
        &self.extent_id
    }
}

impl Drop for ExtentPin {
    fn drop(&mut self) {
        self.store.close(&self.extent_id);
    }
}

/// Writes `data` to a new extent that stays pinned until the returned guard drops.
pub async fn write_pinned(
    store: &Arc<dyn ExtentStore>,
    data: Bytes,
) -> StorageResult<(ExtentChunk, ExtentPin)> {
    let chunk = store.write(data).await?;
    let pin = ExtentPin {
        store: store.clone(),
        extent_id: chunk.id.clone(),
    };
    Ok((chunk, pin))
}

/// Pins an extent that already exists, such as the source of a copy.
pub fn pin_extent(store: &Arc<dyn ExtentStore>, extent_id: &str) -> ExtentPin {
    store.retain(extent_id);
    ExtentPin {
        store: store.clone(),
        extent_id: extent_id.to_string(),
    }
}

/// Creates an empty extent that stays pinned until the returned guard drops.
pub async fn create_pinned(store: &Arc<dyn ExtentStore>) -> StorageResult<ExtentPin> {
    let extent_id = store.create().await?;
    Ok(ExtentPin {
        store: store.clone(),
        extent_id,
    })
}

/// Number of shards for the extent store (must be power of 2).
const NUM_SHARDS: usize = 64;

/// Sharded in-memory implementation of the extent store.
/// Uses multiple DashMaps to reduce lock contention.
pub struct MemoryExtentStore {
    /// Sharded extents - each shard handles a subset of extent IDs.
    shards: Vec<DashMap<Arc<str>, Bytes>>,
    /// Current total size in bytes.
    current_size: AtomicU64,
    /// Maximum size limit (0 = unlimited).
    size_limit: u64,
    /// Extents open for write.
    open: OpenExtents,
}

impl MemoryExtentStore {
    pub fn new() -> Self {
        Self::with_limit(0)
    }

    pub fn with_limit(limit: u64) -> Self {
        let shards = (0..NUM_SHARDS).map(|_| DashMap::new()).collect();
        Self {
            shards,
            current_size: AtomicU64::new(0),
            size_limit: limit,
            open: OpenExtents::default(),
        }
    }

    /// Get the shard for a given extent ID.
    #[inline]
    fn get_shard(&self, extent_id: &str) -> &DashMap<Arc<str>, Bytes> {
        // Use a simple hash of the first few bytes of the UUID
        let hash = extent_id
            .bytes()
            .take(8)
            .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
        &self.shards[hash % NUM_SHARDS]
    }

    fn check_limit(&self, additional: u64) -> StorageResult<()> {
        if self.size_limit > 0 {
            let current = self.current_size.load(Ordering::Relaxed);
            if current + additional > self.size_limit {
                return Err(StorageError::with_message(
                    ErrorCode::RequestBodyTooLarge,
                    "Storage limit exceeded",
                ));
            }
        }
        Ok(())
    }
}

impl Default for MemoryExtentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExtentStore for MemoryExtentStore {
    async fn write(&self, data: Bytes) -> StorageResult<ExtentChunk> {
        let size = data.len() as u64;
        self.check_limit(size)?;

        let extent_id = Uuid::new_v4().to_string();
        self.open.open(&extent_id);

        let shard = self.get_shard(&extent_id);
        shard.insert(Arc::from(extent_id.as_str()), data);
        self.current_size.fetch_add(size, Ordering::Relaxed);

        Ok(ExtentChunk::new(extent_id, 0, size))
    }

    async fn create(&self) -> StorageResult<String> {
        let extent_id = Uuid::new_v4().to_string();
        self.open.open(&extent_id);
        self.get_shard(&extent_id)
            .insert(Arc::from(extent_id.as_str()), Bytes::new());
        Ok(extent_id)
    }

    async fn append(&self, extent_id: &str, data: Bytes) -> StorageResult<ExtentChunk> {
        let size = data.len() as u64;
        self.check_limit(size)?;

        let shard = self.get_shard(extent_id);
        let mut extent = shard.get_mut(extent_id).ok_or_else(|| {
            StorageError::with_message(
                ErrorCode::InternalError,
                format!("Extent {} does not exist", extent_id),
            )
        })?;

        let offset = extent.len() as u64;
        let mut buffer = BytesMut::with_capacity(extent.len() + data.len());
        buffer.extend_from_slice(&extent);
        buffer.extend_from_slice(&data);
        *extent = buffer.freeze();
        self.current_size.fetch_add(size, Ordering::Relaxed);

        Ok(ExtentChunk::new(extent_id.to_string(), offset, size))
    }

    async fn read(&self, chunk: &ExtentChunk) -> StorageResult<Bytes> {
        self.read_range(chunk, 0, chunk.count).await
    }

    async fn read_range(
        &self,
        chunk: &ExtentChunk,
        offset: u64,
        count: u64,
    ) -> StorageResult<Bytes> {
        let shard = self.get_shard(&chunk.id);
        let extent = shard.get(chunk.id.as_str()).ok_or_else(|| {
            StorageError::with_message(
                ErrorCode::InternalError,
                format!("Extent {} does not exist", chunk.id),
            )
        })?;

        let start = (chunk.offset + offset) as usize;
        let end = start + count as usize;

        if end > extent.len() {
            return Err(StorageError::with_message(
                ErrorCode::InternalError,
                format!("Read past the end of extent {}", chunk.id),
            ));
        }

        Ok(extent.slice(start..end))
    }

    async fn delete(&self, extent_id: &str) -> StorageResult<()> {
        let shard = self.get_shard(extent_id);
        if let Some((_, data)) = shard.remove(extent_id) {
            self.current_size
                .fetch_sub(data.len() as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn list_extent_ids(&self) -> StorageResult<Vec<String>> {
        Ok(self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .iter()
                    .map(|entry| entry.key().to_string())
                    .collect::<Vec<_>>()
            })
            .collect())
    }

    async fn total_size(&self) -> u64 {
        self.current_size.load(Ordering::Relaxed)
    }

    fn retain(&self, extent_id: &str) {
        self.open.open(extent_id);
    }

    fn close(&self, extent_id: &str) {
        self.open.close(extent_id);
    }

    fn open_extent_ids(&self) -> HashSet<String> {
        self.open.ids()
    }
}

/// File system implementation of the extent store.
pub struct FsExtentStore {
    /// Base directory for extent files.
    base_path: PathBuf,
    /// Metadata for extents (size tracking).
    extent_sizes: DashMap<Arc<str>, u64>,
    /// Current total size in bytes.
    current_size: AtomicU64,
    /// Extents open for write.
    open: OpenExtents,
}

impl FsExtentStore {
    /// Opens the store, indexing any extent files already on disk.
    pub async fn new(base_path: PathBuf) -> StorageResult<Self> {
        fs::create_dir_all(&base_path)
            .await
            .map_err(|e| StorageError::internal("Failed to create extent directory", e))?;

        let extent_sizes = DashMap::new();
        let mut total = 0u64;
        let mut entries = fs::read_dir(&base_path)
            .await
            .map_err(|e| StorageError::internal("Failed to scan extent directory", e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::internal("Failed to scan extent directory", e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| StorageError::internal("Failed to inspect extent file", e))?;
            if !file_type.is_file() {
                continue;
            }
            let size = entry
                .metadata()
                .await
                .map_err(|e| StorageError::internal("Failed to inspect extent file", e))?
                .len();
            let name = entry.file_name().to_string_lossy().to_string();
            extent_sizes.insert(Arc::from(name.as_str()), size);
            total += size;
        }
        debug!(
            path = %base_path.display(),
            extents = extent_sizes.len(),
            bytes = total,
            "Indexed extent directory"
        );

        Ok(Self {
            base_path,
            extent_sizes,
            current_size: AtomicU64::new(total),
            open: OpenExtents::default(),
        })
    }

    fn extent_path(&self, extent_id: &str) -> PathBuf {
        self.base_path.join(extent_id)
    }
}

#[async_trait]
impl ExtentStore for FsExtentStore {
    async fn write(&self, data: Bytes) -> StorageResult<ExtentChunk> {
        let extent_id = self.create().await?;
        let result = self.append(&extent_id, data).await;
        if result.is_err() {
            self.close(&extent_id);
        }
        result
    }

    async fn create(&self) -> StorageResult<String> {
        let extent_id = Uuid::new_v4().to_string();
        self.open.open(&extent_id);

        if let Err(e) = fs::File::create(self.extent_path(&extent_id)).await {
            self.open.close(&extent_id);
            return Err(StorageError::internal("Failed to create extent file", e));
        }
        self.extent_sizes.insert(Arc::from(extent_id.as_str()), 0);

        Ok(extent_id)
    }

    async fn append(&self, extent_id: &str, data: Bytes) -> StorageResult<ExtentChunk> {
        let size = data.len() as u64;
        let offset = self
            .extent_sizes
            .get(extent_id)
            .map(|s| *s.value())
            .ok_or_else(|| {
                StorageError::with_message(
                    ErrorCode::InternalError,
                    format!("Extent {} does not exist", extent_id),
                )
            })?;

        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(self.extent_path(extent_id))
            .await
            .map_err(|e| StorageError::internal("Failed to open extent file", e))?;

        file.write_all(&data)
            .await
            .map_err(|e| StorageError::internal("Failed to write extent data", e))?;
        file.flush()
            .await
            .map_err(|e| StorageError::internal("Failed to flush extent data", e))?;

        if let Some(mut entry) = self.extent_sizes.get_mut(extent_id) {
            *entry += size;
        }
        self.current_size.fetch_add(size, Ordering::Relaxed);

        Ok(ExtentChunk::new(extent_id.to_string(), offset, size))
    }

    async fn read(&self, chunk: &ExtentChunk) -> StorageResult<Bytes> {
        self.read_range(chunk, 0, chunk.count).await
    }

    async fn read_range(
        &self,
        chunk: &ExtentChunk,
        offset: u64,
        count: u64,
    ) -> StorageResult<Bytes> {
        let path = self.extent_path(&chunk.id);

        let mut file = fs::File::open(&path)
            .await
            .map_err(|e| StorageError::internal("Failed to open extent file", e))?;

        let start = chunk.offset + offset;
        file.seek(std::io::SeekFrom::Start(start))
            .await
            .map_err(|e| StorageError::internal("Failed to seek in extent file", e))?;

        let mut buffer = vec![0u8; count as usize];
        file.read_exact(&mut buffer)
            .await
            .map_err(|e| StorageError::internal("Failed to read extent data", e))?;

        Ok(Bytes::from(buffer))
    }

    async fn delete(&self, extent_id: &str) -> StorageResult<()> {
        if let Some((_, size)) = self.extent_sizes.remove(extent_id) {
            self.current_size.fetch_sub(size, Ordering::Relaxed);
        }

        match fs::remove_file(self.extent_path(extent_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::internal("Failed to delete extent file", e)),
        }
    }

    async fn list_extent_ids(&self) -> StorageResult<Vec<String>> {
        Ok(self
            .extent_sizes
            .iter()
            .map(|entry| entry.key().to_string())
            .collect())
    }

    async fn total_size(&self) -> u64 {
        self.current_size.load(Ordering::Relaxed)
    }

    fn retain(&self, extent_id: &str) {
        self.open.open(extent_id);
    }

    fn close(&self, extent_id: &str) {
        self.open.close(extent_id);
    }

    fn open_extent_ids(&self) -> HashSet<String> {
        self.open.ids()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pins_keep_extents_open_until_dropped() {
        let store: Arc<dyn ExtentStore> = Arc::new(MemoryExtentStore::new());
        let (chunk, pin) = write_pinned(&store, Bytes::from_static(b"abc")).await.unwrap();
        assert!(store.open_extent_ids().contains(&chunk.id));

        drop(pin);
        assert!(store.open_extent_ids().is_empty());
        assert_eq!(store.read(&chunk).await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn pins_on_existing_extents_are_counted() {
        let store: Arc<dyn ExtentStore> = Arc::new(MemoryExtentStore::new());
        let (chunk, writer) = write_pinned(&store, Bytes::from_static(b"abc")).await.unwrap();
        let reader = pin_extent(&store, &chunk.id);

        drop(writer);
        assert!(store.open_extent_ids().contains(&chunk.id));

        drop(reader);
        assert!(store.open_extent_ids().is_empty());
    }

    #[tokio::test]
    async fn appends_return_chunks_at_increasing_offsets() {
        let store: Arc<dyn ExtentStore> = Arc::new(MemoryExtentStore::new());
        let pin = create_pinned(&store).await.unwrap();
        let first = store
            .append(pin.extent_id(), Bytes::from_static(b"hello "))
            .await
            .unwrap();
        let second = store
            .append(pin.extent_id(), Bytes::from_static(b"world"))
            .await
            .unwrap();

        assert_eq!((first.offset, first.count), (0, 6));
        assert_eq!((second.offset, second.count), (6, 5));
        assert_eq!(store.read(&second).await.unwrap(), "world");
        assert_eq!(store.read_range(&first, 1, 3).await.unwrap(), "ell");
    }

    #[tokio::test]
    async fn memory_store_enforces_size_limit() {
        let store = MemoryExtentStore::with_limit(4);
        store.write(Bytes::from_static(b"1234")).await.unwrap();
        let err = store.write(Bytes::from_static(b"5")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::RequestBodyTooLarge);
    }

    #[tokio::test]
    async fn fs_store_reindexes_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let chunk = {
            let store = FsExtentStore::new(dir.path().to_path_buf()).await.unwrap();
            store.write(Bytes::from_static(b"persisted")).await.unwrap()
        };

        let store = FsExtentStore::new(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(store.list_extent_ids().await.unwrap(), [chunk.id.clone()]);
        assert_eq!(store.total_size().await, 9);
        assert!(store.open_extent_ids().is_empty());
        assert_eq!(store.read(&chunk).await.unwrap(), "persisted");

        store.delete(&chunk.id).await.unwrap();
        assert!(store.list_extent_ids().await.unwrap().is_empty());
        assert_eq!(store.total_size().await, 0);
    }
}
