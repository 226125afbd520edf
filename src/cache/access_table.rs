//! Cache access table.
//!
//! Each endpoint exposes a compact, versioned catalog of its local caches
//! in a single registered buffer. Peers GET the buffer and rebuild the
//! catalog locally, so pulls by cache id or `(req_id, model_id)` need no
//! extra round-trip. A version of `u64::MAX` advertises that remote cache
//! access is disabled on this endpoint.

use crate::cache::{CacheEntry, CacheKey, CacheManager, CacheMemType, CachePlacement, DataType, KeyRef};
use crate::error::{KvError, KvResult};
use crate::fabric::{copy_local, CommHandle, Fabric};
use crate::memory::MemAddr;
use crate::mempool::PinnedRegion;
use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound of the serialized table.
pub const CACHE_ACCESS_TABLE_BUFFER_SIZE: usize = 1024 * 1024;
/// Version sentinel meaning "remote cache access disabled".
pub const REMOTE_ACCESS_DISABLED_VERSION: u64 = u64::MAX;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct TableHeader {
    version_num: u64,
    num_caches: u64,
    num_cache_indices: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct SummaryFixed {
    cache_id: i64,
    num_blocks: u64,
    batch_size: u64,
    tensor_size: u64,
    stride: u64,
    placement: u64,
    num_tensors: u64,
    remote_accessible: u64,
    cache_mem_type: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct IndexRecord {
    cache_id: i64,
    req_id: u64,
    model_id: u64,
}

const HEADER_SIZE: usize = std::mem::size_of::<TableHeader>();
const SUMMARY_SIZE: usize = std::mem::size_of::<SummaryFixed>();
const INDEX_SIZE: usize = std::mem::size_of::<IndexRecord>();

fn placement_to_wire(placement: CachePlacement) -> u64 {
    match placement {
        CachePlacement::Host => 0,
        CachePlacement::Device => 1,
    }
}

fn placement_from_wire(value: u64) -> KvResult<CachePlacement> {
    match value {
        0 => Ok(CachePlacement::Host),
        1 => Ok(CachePlacement::Device),
        other => Err(KvError::Failed(format!("bad placement {} in cache table", other))),
    }
}

fn mem_type_to_wire(mem_type: CacheMemType) -> u64 {
    match mem_type {
        CacheMemType::Contiguous => 0,
        CacheMemType::Blocks => 1,
        CacheMemType::Mix => 2,
    }
}

fn mem_type_from_wire(value: u64) -> KvResult<CacheMemType> {
    match value {
        0 => Ok(CacheMemType::Contiguous),
        1 => Ok(CacheMemType::Blocks),
        2 => Ok(CacheMemType::Mix),
        other => Err(KvError::Failed(format!("bad cache_mem_type {} in cache table", other))),
    }
}

/// Serialize a catalog snapshot into the wire layout.
pub fn serialize_table(
    version: u64,
    entries: &[CacheEntry],
    keys: &[(CacheKey, KeyRef)],
) -> KvResult<Vec<u8>> {
    let indices: Vec<&(CacheKey, KeyRef)> = keys.iter().filter(|(key, _)| !key.is_prefix).collect();
    let mut total = HEADER_SIZE + INDEX_SIZE * indices.len();
    for entry in entries {
        total += SUMMARY_SIZE + 8 * entry.tensor_addrs.len();
    }
    if total > CACHE_ACCESS_TABLE_BUFFER_SIZE {
        return Err(KvError::ParamInvalid(format!(
            "serialized cache table needs {} bytes, exceeding 1 MiB",
            total
        )));
    }

    let mut buffer = Vec::with_capacity(total);
    let header = TableHeader {
        version_num: version,
        num_caches: entries.len() as u64,
        num_cache_indices: indices.len() as u64,
    };
    buffer.extend_from_slice(bytemuck::bytes_of(&header));
    for entry in entries {
        let fixed = SummaryFixed {
            cache_id: entry.cache_id,
            num_blocks: entry.num_blocks,
            batch_size: entry.batch_size,
            tensor_size: entry.tensor_size,
            stride: entry.stride,
            placement: placement_to_wire(entry.placement),
            num_tensors: entry.tensor_addrs.len() as u64,
            remote_accessible: entry.remote_accessible as u64,
            cache_mem_type: mem_type_to_wire(entry.cache_mem_type),
        };
        buffer.extend_from_slice(bytemuck::bytes_of(&fixed));
        for addr in &entry.tensor_addrs {
            buffer.extend_from_slice(&addr.to_ne_bytes());
        }
    }
    for (key, key_ref) in indices {
        let record = IndexRecord { cache_id: key_ref.cache_id, req_id: key.id, model_id: key.model_id };
        buffer.extend_from_slice(bytemuck::bytes_of(&record));
    }
    Ok(buffer)
}

/// Parsed remote table snapshot.
pub struct ParsedTable {
    /// Remote version number.
    pub version: u64,
    /// Remote entries keyed by cache id.
    pub entries: HashMap<i64, CacheEntry>,
    /// `(req_id, model_id)` to cache id.
    pub keys: HashMap<(u64, u64), i64>,
}

/// Parse the wire layout back into a snapshot.
pub fn parse_table(bytes: &[u8]) -> KvResult<ParsedTable> {
    if bytes.len() < HEADER_SIZE {
        return Err(KvError::Failed("cache table shorter than its header".to_string()));
    }
    let header: TableHeader = bytemuck::pod_read_unaligned(&bytes[..HEADER_SIZE]);
    let mut entries = HashMap::new();
    let mut keys = HashMap::new();
    let mut offset = HEADER_SIZE;

    for _ in 0..header.num_caches {
        if bytes.len() < offset + SUMMARY_SIZE {
            return Err(KvError::Failed("cache table truncated in a summary".to_string()));
        }
        let fixed: SummaryFixed = bytemuck::pod_read_unaligned(&bytes[offset..offset + SUMMARY_SIZE]);
        offset += SUMMARY_SIZE;
        let addr_bytes = fixed.num_tensors as usize * 8;
        if bytes.len() < offset + addr_bytes {
            return Err(KvError::Failed("cache table truncated in tensor addresses".to_string()));
        }
        let mut tensor_addrs = Vec::with_capacity(fixed.num_tensors as usize);
        for i in 0..fixed.num_tensors as usize {
            let start = offset + i * 8;
            let addr = u64::from_ne_bytes(
                bytes[start..start + 8]
                    .try_into()
                    .map_err(|_| KvError::Failed("bad address slice".to_string()))?,
            );
            tensor_addrs.push(addr);
        }
        offset += addr_bytes;

        let entry = CacheEntry {
            cache_id: fixed.cache_id,
            placement: placement_from_wire(fixed.placement)?,
            cache_mem_type: mem_type_from_wire(fixed.cache_mem_type)?,
            // Mirror entries carry geometry only; shape and element type
            // stay with the owning endpoint.
            data_type: DataType::Int8,
            shape: Vec::new(),
            tensor_size: fixed.tensor_size,
            stride: fixed.stride,
            batch_size: fixed.batch_size,
            num_blocks: fixed.num_blocks,
            tensor_addrs,
            is_owned: false,
            remote_accessible: fixed.remote_accessible != 0,
        };
        entries.insert(entry.cache_id, entry);
    }

    for _ in 0..header.num_cache_indices {
        if bytes.len() < offset + INDEX_SIZE {
            return Err(KvError::Failed("cache table truncated in an index".to_string()));
        }
        let record: IndexRecord = bytemuck::pod_read_unaligned(&bytes[offset..offset + INDEX_SIZE]);
        offset += INDEX_SIZE;
        keys.insert((record.req_id, record.model_id), record.cache_id);
    }

    Ok(ParsedTable { version: header.version_num, entries, keys })
}

/// The process page every local mirror syncs through.
///
/// One registered buffer is shared by all entities of an engine; syncs
/// serialise on its mutex.
pub struct SharedDevBuffer {
    region: PinnedRegion,
    lock: Mutex<()>,
}

impl SharedDevBuffer {
    /// Allocate the shared mirror page.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            region: PinnedRegion::allocate(CACHE_ACCESS_TABLE_BUFFER_SIZE),
            lock: Mutex::new(()),
        })
    }

    /// Base address, for registration with the fabric.
    pub fn addr(&self) -> MemAddr {
        self.region.base()
    }

    /// Buffer length.
    pub fn len(&self) -> usize {
        self.region.len()
    }

    /// True when the buffer is empty (never the case in practice).
    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }
}

/// Maintains this endpoint's exported table buffer.
pub struct CacheAccessTableUpdater {
    enabled: bool,
    buffer: PinnedRegion,
    version: AtomicU64,
}

impl CacheAccessTableUpdater {
    /// Allocate the export buffer. When remote access is disabled, the
    /// buffer holds only a header carrying the disabled sentinel.
    pub fn new(enabled: bool) -> KvResult<Self> {
        // A disabled endpoint exports only the sentinel header.
        let buffer = if enabled {
            PinnedRegion::allocate(CACHE_ACCESS_TABLE_BUFFER_SIZE)
        } else {
            PinnedRegion::allocate(HEADER_SIZE)
        };
        let updater = Self { enabled, buffer, version: AtomicU64::new(0) };
        if !enabled {
            let header = TableHeader {
                version_num: REMOTE_ACCESS_DISABLED_VERSION,
                num_caches: 0,
                num_cache_indices: 0,
            };
            let bytes = bytemuck::bytes_of(&header);
            copy_local(updater.buffer.base(), bytes.as_ptr() as MemAddr, bytes.len() as u64);
        }
        Ok(updater)
    }

    /// Whether this endpoint exports its catalog.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Export buffer address, shared with peers at link time.
    pub fn buffer_addr(&self) -> MemAddr {
        self.buffer.base()
    }

    /// Export buffer length.
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Serialize the catalog into the export buffer, bumping the version.
    pub fn update(&self, manager: &CacheManager) -> KvResult<u64> {
        if !self.enabled {
            return Ok(REMOTE_ACCESS_DISABLED_VERSION);
        }
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        if version == REMOTE_ACCESS_DISABLED_VERSION {
            return Err(KvError::Failed("cache table version space exhausted".to_string()));
        }
        let (entries, keys) = manager.table_snapshot();
        log::info!(
            "updating cache access table: version={} caches={} indices={}",
            version,
            entries.len(),
            keys.len()
        );
        let bytes = serialize_table(version, &entries, &keys)?;
        copy_local(self.buffer.base(), bytes.as_ptr() as MemAddr, bytes.len() as u64);
        Ok(version)
    }
}

/// Local mirror of one peer's exported table.
pub struct CacheAccessTable {
    shared: Arc<SharedDevBuffer>,
    version: u64,
    entries: HashMap<i64, CacheEntry>,
    keys: HashMap<(u64, u64), i64>,
}

impl CacheAccessTable {
    /// Empty mirror backed by the engine's shared page.
    pub fn new(shared: Arc<SharedDevBuffer>) -> Self {
        Self { shared, version: 0, entries: HashMap::new(), keys: HashMap::new() }
    }

    /// Last version observed; 0 before the first sync.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// True when the peer advertises remote access disabled.
    pub fn remote_access_disabled(&self) -> bool {
        self.version == REMOTE_ACCESS_DISABLED_VERSION
    }

    /// GET the peer's export buffer and reload the mirror maps.
    pub fn sync_from_remote(
        &mut self,
        fabric: &dyn Fabric,
        comm: CommHandle,
        remote_table_addr: MemAddr,
        remote_table_len: u64,
        timeout: Duration,
    ) -> KvResult<()> {
        if remote_table_len as usize > self.shared.len() {
            return Err(KvError::ParamInvalid(format!(
                "remote table length {} exceeds the mirror page",
                remote_table_len
            )));
        }
        let parsed = {
            let _guard = self.shared.lock.lock();
            fabric.get(comm, self.shared.addr(), remote_table_addr, remote_table_len)?;
            fabric.sync_stream(comm, timeout)?;
            // The shared page belongs to this process; view it as bytes.
            let bytes = unsafe {
                std::slice::from_raw_parts(self.shared.addr() as *const u8, remote_table_len as usize)
            };
            parse_table(bytes)?
        };
        let prior = self.version;
        self.version = parsed.version;
        self.entries = parsed.entries;
        self.keys = parsed.keys;
        log::info!(
            "cache access table synced: version {} -> {}, {} caches",
            prior,
            self.version,
            self.entries.len()
        );
        Ok(())
    }

    /// Resolve by cache id when positive, else by `(req_id, model_id)`.
    pub fn find(&self, cache_id: i64, req_id: u64, model_id: u64) -> Option<&CacheEntry> {
        if cache_id > 0 {
            return self.entries.get(&cache_id);
        }
        self.keys
            .get(&(req_id, model_id))
            .and_then(|resolved| self.entries.get(resolved))
    }

    /// Number of mirrored caches.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True before the first successful sync or when the peer is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(cache_id: i64, addrs: Vec<MemAddr>) -> CacheEntry {
        CacheEntry {
            cache_id,
            placement: CachePlacement::Device,
            cache_mem_type: CacheMemType::Blocks,
            data_type: DataType::Int32,
            shape: vec![8, 16],
            tensor_size: 512,
            stride: 64,
            batch_size: 8,
            num_blocks: 8,
            tensor_addrs: addrs,
            is_owned: true,
            remote_accessible: true,
        }
    }

    #[test]
    fn test_serialize_parse_round_trip() {
        let entries = vec![entry(3, vec![0x1000, 0x2000]), entry(5, vec![0x9000])];
        let keys = vec![
            (CacheKey::for_request(77, 2), KeyRef { cache_id: 3, batch_index: 0 }),
            (CacheKey::for_prefix(88, 2), KeyRef { cache_id: 5, batch_index: 0 }),
        ];
        let bytes = serialize_table(9, &entries, &keys).unwrap();
        let parsed = parse_table(&bytes).unwrap();

        assert_eq!(parsed.version, 9);
        assert_eq!(parsed.entries.len(), 2);
        // Prefix keys stay endpoint-local.
        assert_eq!(parsed.keys.len(), 1);
        assert_eq!(parsed.keys[&(77, 2)], 3);

        let mirrored = &parsed.entries[&3];
        assert_eq!(mirrored.tensor_addrs, vec![0x1000, 0x2000]);
        assert_eq!(mirrored.stride, 64);
        assert_eq!(mirrored.cache_mem_type, CacheMemType::Blocks);
        assert!(!mirrored.is_owned);
    }

    #[test]
    fn test_oversize_table_rejected() {
        // One cache with enough tensor addresses to overflow 1 MiB.
        let addrs: Vec<MemAddr> = (0..200_000).map(|i| i as u64).collect();
        let entries = vec![entry(1, addrs)];
        assert!(serialize_table(1, &entries, &[]).is_err());
    }

    #[test]
    fn test_disabled_updater_writes_sentinel() {
        let updater = CacheAccessTableUpdater::new(false).unwrap();
        let bytes = unsafe {
            std::slice::from_raw_parts(updater.buffer_addr() as *const u8, HEADER_SIZE)
        };
        let header: TableHeader = bytemuck::pod_read_unaligned(bytes);
        assert_eq!(header.version_num, REMOTE_ACCESS_DISABLED_VERSION);
    }

    #[test]
    fn test_version_monotonic() {
        use crate::mempool::ScalableMemPool;
        let region = PinnedRegion::allocate(64 << 10);
        let pool = ScalableMemPool::initialize(region.base(), region.len(), 10).unwrap();
        let manager = CacheManager::new(Some(pool), None);
        let updater = CacheAccessTableUpdater::new(true).unwrap();

        let v1 = updater.update(&manager).unwrap();
        let v2 = updater.update(&manager).unwrap();
        assert!(v2 > v1);
    }

    #[test]
    fn test_truncated_table_fails() {
        let entries = vec![entry(1, vec![0x1000])];
        let bytes = serialize_table(2, &entries, &[]).unwrap();
        assert!(parse_table(&bytes[..bytes.len() - 4]).is_err());
    }
}
