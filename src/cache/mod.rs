//! # Cache Management
//!
//! The catalog of local KV caches: allocation out of the engine's pinned
//! pools, registration of user-provided tensors, key bindings, and the
//! delayed-destruction policy that keeps an entry alive while any cache
//! key still references it.

pub mod access_table;
pub mod copy;

use crate::error::{KvError, KvResult};
use crate::memory::MemAddr;
use crate::mempool::{ScalableMemPool, SharedBlock};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Element type of cache tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    /// 1-byte signed integer.
    Int8,
    /// 4-byte signed integer.
    Int32,
    /// 2-byte float.
    Float16,
    /// 4-byte float.
    Float32,
}

impl DataType {
    /// Element size in bytes.
    pub fn size_bytes(&self) -> u64 {
        match self {
            DataType::Int8 => 1,
            DataType::Float16 => 2,
            DataType::Int32 | DataType::Float32 => 4,
        }
    }
}

/// Where a cache's tensors live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachePlacement {
    /// Pinned host memory.
    Host,
    /// Device memory.
    Device,
}

impl CachePlacement {
    /// Corresponding registration kind.
    pub fn mem_kind(&self) -> crate::memory::MemKind {
        match self {
            CachePlacement::Host => crate::memory::MemKind::Host,
            CachePlacement::Device => crate::memory::MemKind::Device,
        }
    }
}

/// First-dimension interpretation of a cache's shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheMemType {
    /// `[batch, feat]`: the first dim indexes the batch.
    Contiguous,
    /// `[nblocks, block_feat]`: the first dim indexes a block.
    Blocks,
    /// Both views apply.
    Mix,
}

/// Identity a peer can address a cache by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// Request id, or prefix id when `is_prefix` is set.
    pub id: u64,
    /// Owning model.
    pub model_id: u64,
    /// Distinguishes the prefix key namespace.
    pub is_prefix: bool,
}

impl CacheKey {
    /// Key for a request-scoped cache.
    pub fn for_request(req_id: u64, model_id: u64) -> Self {
        Self { id: req_id, model_id, is_prefix: false }
    }

    /// Key for a shared-prefix cache.
    pub fn for_prefix(prefix_id: u64, model_id: u64) -> Self {
        Self { id: prefix_id, model_id, is_prefix: true }
    }
}

/// Requested cache geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheDesc {
    /// Number of tensors (layers × tensors-per-layer).
    pub num_tensors: usize,
    /// Element type.
    pub data_type: DataType,
    /// Tensor shape; the first dim is the batch or block count.
    pub shape: Vec<u64>,
    /// Placement of every tensor.
    pub placement: CachePlacement,
    /// First-dimension interpretation.
    pub cache_mem_type: CacheMemType,
}

impl CacheDesc {
    /// Total bytes of one tensor.
    pub fn tensor_size(&self) -> u64 {
        self.shape.iter().product::<u64>() * self.data_type.size_bytes()
    }

    fn validate(&self) -> KvResult<()> {
        if self.num_tensors == 0 {
            return Err(KvError::ParamInvalid("num_tensors must be > 0".to_string()));
        }
        if self.shape.is_empty() || self.shape.iter().any(|&d| d == 0) {
            return Err(KvError::ParamInvalid(format!("invalid shape {:?}", self.shape)));
        }
        Ok(())
    }
}

/// Catalog record for one cache.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Catalog id, unique per endpoint.
    pub cache_id: i64,
    /// Placement of the tensors.
    pub placement: CachePlacement,
    /// First-dimension interpretation.
    pub cache_mem_type: CacheMemType,
    /// Element type.
    pub data_type: DataType,
    /// Tensor shape.
    pub shape: Vec<u64>,
    /// Bytes per tensor.
    pub tensor_size: u64,
    /// Bytes per batch row (Contiguous) or per block (Blocks).
    pub stride: u64,
    /// Batch rows per tensor.
    pub batch_size: u64,
    /// Blocks per tensor.
    pub num_blocks: u64,
    /// Base address of every tensor.
    pub tensor_addrs: Vec<MemAddr>,
    /// Whether the engine owns the tensor storage.
    pub is_owned: bool,
    /// Whether remote peers may address this cache directly.
    pub remote_accessible: bool,
}

impl CacheEntry {
    fn from_desc(cache_id: i64, desc: &CacheDesc, tensor_addrs: Vec<MemAddr>, is_owned: bool) -> Self {
        let tensor_size = desc.tensor_size();
        let leading = desc.shape[0];
        let stride = tensor_size / leading;
        Self {
            cache_id,
            placement: desc.placement,
            cache_mem_type: desc.cache_mem_type,
            data_type: desc.data_type,
            shape: desc.shape.clone(),
            tensor_size,
            stride,
            batch_size: leading,
            num_blocks: leading,
            tensor_addrs,
            is_owned,
            remote_accessible: false,
        }
    }
}

/// User-facing cache handle.
#[derive(Debug, Clone)]
pub struct Cache {
    /// Catalog id.
    pub cache_id: i64,
    /// Base address of every tensor.
    pub tensor_addrs: Vec<MemAddr>,
    /// Geometry the cache was created with.
    pub desc: CacheDesc,
}

/// Binding of a cache key inside the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRef {
    /// Cache the key is bound to.
    pub cache_id: i64,
    /// Batch row the key's request occupies.
    pub batch_index: u64,
}

struct EntryRecord {
    entry: CacheEntry,
    owned_blocks: Vec<SharedBlock>,
    ext_ref: bool,
    key_count: usize,
}

struct ManagerState {
    next_cache_id: i64,
    entries: HashMap<i64, EntryRecord>,
    keys: HashMap<CacheKey, KeyRef>,
}

/// Cache catalog with delayed destruction.
///
/// All map mutations hold a single mutex. An allocated entry carries an
/// external reference until `deallocate`; it is destroyed only once the
/// external reference is gone and no key references it.
pub struct CacheManager {
    state: Mutex<ManagerState>,
    device_pool: Option<ScalableMemPool>,
    host_pool: Option<ScalableMemPool>,
}

impl CacheManager {
    /// Catalog backed by the given pools; either may be absent.
    pub fn new(device_pool: Option<ScalableMemPool>, host_pool: Option<ScalableMemPool>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ManagerState {
                next_cache_id: 1,
                entries: HashMap::new(),
                keys: HashMap::new(),
            }),
            device_pool,
            host_pool,
        })
    }

    fn pool_for(&self, placement: CachePlacement) -> KvResult<&ScalableMemPool> {
        let pool = match placement {
            CachePlacement::Device => self.device_pool.as_ref(),
            CachePlacement::Host => self.host_pool.as_ref(),
        };
        pool.ok_or_else(|| {
            KvError::FeatureNotEnabled(format!("no {:?} memory pool configured", placement))
        })
    }

    /// Allocate a cache from the pool of its placement and bind `keys`.
    ///
    /// Keys are validated before any allocation, so a duplicate key leaves
    /// the catalog untouched.
    pub fn allocate(&self, desc: &CacheDesc, keys: &[CacheKey], remote_accessible: bool) -> KvResult<Cache> {
        desc.validate()?;
        let pool = self.pool_for(desc.placement)?;
        let tensor_size = desc.tensor_size();

        let mut state = self.state.lock();
        for key in keys {
            if let Some(existing) = state.keys.get(key) {
                return Err(KvError::ParamInvalid(format!(
                    "cache key {:?} already bound to cache {}",
                    key, existing.cache_id
                )));
            }
        }

        let mut owned_blocks = Vec::with_capacity(desc.num_tensors);
        for index in 0..desc.num_tensors {
            match pool.alloc_shared(tensor_size as usize) {
                Some(block) => owned_blocks.push(block),
                None => {
                    // Blocks already taken return to the pool on drop.
                    pool.log_pool_state();
                    return Err(KvError::OutOfMemory(format!(
                        "tensor {} of {} ({} bytes) did not fit",
                        index, desc.num_tensors, tensor_size
                    )));
                }
            }
        }
        let tensor_addrs: Vec<MemAddr> = owned_blocks.iter().map(|block| block.addr()).collect();

        let cache_id = state.next_cache_id;
        state.next_cache_id += 1;
        let mut entry = CacheEntry::from_desc(cache_id, desc, tensor_addrs.clone(), true);
        entry.remote_accessible = remote_accessible;
        state.entries.insert(
            cache_id,
            EntryRecord { entry, owned_blocks, ext_ref: true, key_count: keys.len() },
        );
        for (index, key) in keys.iter().enumerate() {
            state.keys.insert(*key, KeyRef { cache_id, batch_index: index as u64 });
        }
        log::info!(
            "allocated cache {}: {} tensors x {} bytes, placement {:?}",
            cache_id,
            desc.num_tensors,
            tensor_size,
            desc.placement
        );
        Ok(Cache { cache_id, tensor_addrs, desc: desc.clone() })
    }

    /// Register user-provided tensors as a cache; storage stays caller-owned.
    pub fn register(
        &self,
        desc: &CacheDesc,
        keys: &[CacheKey],
        tensor_addrs: Vec<MemAddr>,
        remote_accessible: bool,
    ) -> KvResult<Cache> {
        desc.validate()?;
        if tensor_addrs.len() != desc.num_tensors {
            return Err(KvError::ParamInvalid(format!(
                "{} addresses given for {} tensors",
                tensor_addrs.len(),
                desc.num_tensors
            )));
        }
        let mut state = self.state.lock();
        for key in keys {
            if let Some(existing) = state.keys.get(key) {
                return Err(KvError::ParamInvalid(format!(
                    "cache key {:?} already bound to cache {}",
                    key, existing.cache_id
                )));
            }
        }
        let cache_id = state.next_cache_id;
        state.next_cache_id += 1;
        let mut entry = CacheEntry::from_desc(cache_id, desc, tensor_addrs.clone(), false);
        entry.remote_accessible = remote_accessible;
        state.entries.insert(
            cache_id,
            EntryRecord { entry, owned_blocks: Vec::new(), ext_ref: true, key_count: keys.len() },
        );
        for (index, key) in keys.iter().enumerate() {
            state.keys.insert(*key, KeyRef { cache_id, batch_index: index as u64 });
        }
        log::info!("registered cache {} ({} tensors)", cache_id, desc.num_tensors);
        Ok(Cache { cache_id, tensor_addrs, desc: desc.clone() })
    }

    /// Insert a prebuilt entry, for mirrored or externally built catalogs.
    pub fn register_cache_entry(&self, entry: CacheEntry) -> KvResult<()> {
        let mut state = self.state.lock();
        if state.entries.contains_key(&entry.cache_id) {
            return Err(KvError::ParamInvalid(format!("cache {} already exists", entry.cache_id)));
        }
        let cache_id = entry.cache_id;
        state.entries.insert(
            cache_id,
            EntryRecord { entry, owned_blocks: Vec::new(), ext_ref: true, key_count: 0 },
        );
        Ok(())
    }

    /// Remove an entry inserted via [`CacheManager::register_cache_entry`].
    pub fn unregister_cache_entry(&self, cache_id: i64) -> KvResult<()> {
        let mut state = self.state.lock();
        if state.entries.remove(&cache_id).is_none() {
            return Err(KvError::CacheNotExist(format!("cache {}", cache_id)));
        }
        state.keys.retain(|_, key_ref| key_ref.cache_id != cache_id);
        Ok(())
    }

    /// Drop the external reference of an allocated cache.
    ///
    /// The entry survives while any key still references it and is
    /// destroyed once the last key is removed.
    pub fn deallocate(&self, cache_id: i64) -> KvResult<()> {
        let mut state = self.state.lock();
        let (destroy_now, keys_remaining) = {
            let record = state
                .entries
                .get_mut(&cache_id)
                .ok_or_else(|| KvError::CacheNotExist(format!("cache {}", cache_id)))?;
            if !record.entry.is_owned {
                return Err(KvError::ParamInvalid(format!(
                    "cache {} is registered; use unregister",
                    cache_id
                )));
            }
            record.ext_ref = false;
            (record.key_count == 0, record.key_count)
        };
        if destroy_now {
            state.entries.remove(&cache_id);
            log::info!("cache {} deallocated", cache_id);
        } else {
            log::info!("cache {} deallocation deferred, {} keys remain", cache_id, keys_remaining);
        }
        Ok(())
    }

    /// Remove a registered (non-owned) cache and all of its keys.
    pub fn unregister(&self, cache_id: i64) -> KvResult<()> {
        let mut state = self.state.lock();
        let is_owned = state
            .entries
            .get(&cache_id)
            .map(|record| record.entry.is_owned)
            .ok_or_else(|| KvError::CacheNotExist(format!("cache {}", cache_id)))?;
        if is_owned {
            return Err(KvError::ParamInvalid(format!(
                "cache {} is allocated; use deallocate",
                cache_id
            )));
        }
        state.entries.remove(&cache_id);
        state.keys.retain(|_, key_ref| key_ref.cache_id != cache_id);
        log::info!("cache {} unregistered", cache_id);
        Ok(())
    }

    /// Unbind a key; destroys the entry when it was the last reference
    /// and the external reference is already gone.
    pub fn remove_cache_key(&self, key: &CacheKey) -> KvResult<()> {
        let mut state = self.state.lock();
        let key_ref = state
            .keys
            .remove(key)
            .ok_or_else(|| KvError::CacheNotExist(format!("cache key {:?}", key)))?;
        let destroy = match state.entries.get_mut(&key_ref.cache_id) {
            Some(record) => {
                record.key_count = record.key_count.saturating_sub(1);
                record.key_count == 0 && !record.ext_ref
            }
            None => false,
        };
        if destroy {
            state.entries.remove(&key_ref.cache_id);
            log::info!("cache {} destroyed after last key removal", key_ref.cache_id);
        }
        Ok(())
    }

    /// Entry snapshot by id.
    pub fn get_entry(&self, cache_id: i64) -> Option<CacheEntry> {
        self.state.lock().entries.get(&cache_id).map(|record| record.entry.clone())
    }

    /// Key binding lookup.
    pub fn find_by_key(&self, key: &CacheKey) -> Option<KeyRef> {
        self.state.lock().keys.get(key).copied()
    }

    /// Number of live entries.
    pub fn entry_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Snapshot used by the access-table serialiser: every entry plus
    /// every key binding, ordered by cache id.
    pub fn table_snapshot(&self) -> (Vec<CacheEntry>, Vec<(CacheKey, KeyRef)>) {
        let state = self.state.lock();
        let mut entries: Vec<CacheEntry> =
            state.entries.values().map(|record| record.entry.clone()).collect();
        entries.sort_by_key(|entry| entry.cache_id);
        let mut keys: Vec<(CacheKey, KeyRef)> =
            state.keys.iter().map(|(key, key_ref)| (*key, *key_ref)).collect();
        keys.sort_by_key(|(_, key_ref)| (key_ref.cache_id, key_ref.batch_index));
        (entries, keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mempool::PinnedRegion;

    fn manager_with_pool(pages: usize) -> (PinnedRegion, Arc<CacheManager>) {
        let size = pages << 10;
        let region = PinnedRegion::allocate(size);
        let pool = ScalableMemPool::initialize(region.base(), size, 10).unwrap();
        (region, CacheManager::new(Some(pool), None))
    }

    fn small_desc() -> CacheDesc {
        CacheDesc {
            num_tensors: 2,
            data_type: DataType::Int32,
            shape: vec![4, 32],
            placement: CachePlacement::Device,
            cache_mem_type: CacheMemType::Contiguous,
        }
    }

    #[test]
    fn test_allocate_sets_stride_invariant() {
        let (_region, manager) = manager_with_pool(16);
        let cache = manager.allocate(&small_desc(), &[], false).unwrap();
        let entry = manager.get_entry(cache.cache_id).unwrap();
        assert_eq!(entry.tensor_size, 4 * 32 * 4);
        assert_eq!(entry.stride * entry.batch_size, entry.tensor_size);
        assert_eq!(entry.tensor_addrs.len(), 2);
    }

    #[test]
    fn test_duplicate_key_rejected_without_side_effects() {
        let (_region, manager) = manager_with_pool(16);
        let key = CacheKey::for_request(7, 1);
        manager.allocate(&small_desc(), &[key], false).unwrap();
        let before = manager.entry_count();
        let err = manager.allocate(&small_desc(), &[key], false).unwrap_err();
        assert!(matches!(err, KvError::ParamInvalid(_)));
        assert_eq!(manager.entry_count(), before);
    }

    #[test]
    fn test_delayed_destruction() {
        let (_region, manager) = manager_with_pool(16);
        let key = CacheKey::for_request(9, 1);
        let cache = manager.allocate(&small_desc(), &[key], false).unwrap();

        manager.deallocate(cache.cache_id).unwrap();
        // Still visible: the key holds it alive.
        assert!(manager.get_entry(cache.cache_id).is_some());

        manager.remove_cache_key(&key).unwrap();
        assert!(manager.get_entry(cache.cache_id).is_none());
    }

    #[test]
    fn test_destruction_order_key_first() {
        let (_region, manager) = manager_with_pool(16);
        let key = CacheKey::for_request(11, 1);
        let cache = manager.allocate(&small_desc(), &[key], false).unwrap();

        manager.remove_cache_key(&key).unwrap();
        // External reference still holds the entry.
        assert!(manager.get_entry(cache.cache_id).is_some());
        manager.deallocate(cache.cache_id).unwrap();
        assert!(manager.get_entry(cache.cache_id).is_none());
    }

    #[test]
    fn test_allocation_failure_is_oom() {
        let (_region, manager) = manager_with_pool(4);
        let desc = CacheDesc { shape: vec![64, 64], ..small_desc() };
        let err = manager.allocate(&desc, &[], false).unwrap_err();
        assert!(matches!(err, KvError::OutOfMemory(_)));
        assert_eq!(manager.entry_count(), 0);
    }

    #[test]
    fn test_register_does_not_own() {
        let (_region, manager) = manager_with_pool(16);
        let backing = vec![0u8; 1024];
        let desc = CacheDesc { num_tensors: 1, ..small_desc() };
        let cache = manager
            .register(&desc, &[], vec![backing.as_ptr() as MemAddr], false)
            .unwrap();
        let entry = manager.get_entry(cache.cache_id).unwrap();
        assert!(!entry.is_owned);
        assert!(manager.deallocate(cache.cache_id).is_err());
        manager.unregister(cache.cache_id).unwrap();
        assert_eq!(manager.entry_count(), 0);
    }

    #[test]
    fn test_prefix_and_request_keys_are_distinct() {
        let (_region, manager) = manager_with_pool(16);
        let request = CacheKey::for_request(5, 1);
        let prefix = CacheKey::for_prefix(5, 1);
        manager.allocate(&small_desc(), &[request], false).unwrap();
        // Same ids, different namespace: allowed.
        manager.allocate(&small_desc(), &[prefix], false).unwrap();
        assert_ne!(
            manager.find_by_key(&request).unwrap().cache_id,
            manager.find_by_key(&prefix).unwrap().cache_id
        );
    }
}
