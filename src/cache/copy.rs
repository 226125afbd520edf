//! Local cache copies and block swaps.
//!
//! Large device-to-device copies ride an ordered async path split into
//! 4 GiB chunks; everything else fans out over a small worker pool.

use crate::cache::{CacheEntry, CacheManager, CachePlacement};
use crate::error::{KvError, KvResult};
use crate::fabric::copy_local;
use crate::memory::MemAddr;

/// Device-to-device copies at or above this size go async.
const ASYNC_COPY_MIN: u64 = 2 * 1024 * 1024;
/// Largest single async copy; bigger transfers are chunked.
const MAX_COPY_BLOCK: u64 = 4 * 1024 * 1024 * 1024;
/// Worker cap for the pooled copy path.
const COPY_WORKERS: usize = 4;

/// Placement pair of one copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyKind {
    /// Host to host.
    H2H,
    /// Host to device.
    H2D,
    /// Device to host.
    D2H,
    /// Device to device.
    D2D,
}

impl CopyKind {
    fn between(src: CachePlacement, dst: CachePlacement) -> Self {
        match (src, dst) {
            (CachePlacement::Host, CachePlacement::Host) => CopyKind::H2H,
            (CachePlacement::Host, CachePlacement::Device) => CopyKind::H2D,
            (CachePlacement::Device, CachePlacement::Host) => CopyKind::D2H,
            (CachePlacement::Device, CachePlacement::Device) => CopyKind::D2D,
        }
    }
}

/// One copy task.
#[derive(Debug, Clone, Copy)]
pub struct CopyOp {
    /// Destination address.
    pub dst: MemAddr,
    /// Bytes available at the destination.
    pub dst_max: u64,
    /// Source address.
    pub src: MemAddr,
    /// Bytes to copy.
    pub count: u64,
    /// Placement pair.
    pub kind: CopyKind,
}

/// Batch of copies executed together.
///
/// Device-to-device ops of 2 MiB and above (or any op when an mbuf is
/// involved) run on the ordered async path, chunked at 4 GiB. The rest
/// fan out across at most four workers.
pub struct CopyJob {
    mbuf_involved: bool,
    max_block_size: u64,
    async_ops: Vec<CopyOp>,
    pooled_ops: Vec<CopyOp>,
}

impl CopyJob {
    /// Empty job.
    pub fn new(mbuf_involved: bool) -> Self {
        Self {
            mbuf_involved,
            max_block_size: MAX_COPY_BLOCK,
            async_ops: Vec::new(),
            pooled_ops: Vec::new(),
        }
    }

    #[cfg(test)]
    fn with_max_block_size(mbuf_involved: bool, max_block_size: u64) -> Self {
        Self { mbuf_involved, max_block_size, async_ops: Vec::new(), pooled_ops: Vec::new() }
    }

    fn needs_async(&self, op: &CopyOp) -> bool {
        op.kind == CopyKind::D2D && (op.count >= ASYNC_COPY_MIN || self.mbuf_involved)
    }

    /// Queue one copy.
    pub fn add_copy_task(&mut self, op: CopyOp) -> KvResult<()> {
        if op.count > op.dst_max {
            return Err(KvError::ParamInvalid(format!(
                "copy of {} bytes into a {}-byte destination",
                op.count, op.dst_max
            )));
        }
        if self.needs_async(&op) {
            self.async_ops.push(op);
        } else {
            self.pooled_ops.push(op);
        }
        Ok(())
    }

    /// Execute every queued copy and wait for completion.
    pub fn run(self) -> KvResult<()> {
        // Ordered async path, chunked.
        for op in &self.async_ops {
            let mut offset = 0u64;
            while offset < op.count {
                let chunk = (op.count - offset).min(self.max_block_size);
                copy_local(op.dst + offset, op.src + offset, chunk);
                offset += chunk;
            }
        }
        if self.pooled_ops.is_empty() {
            return Ok(());
        }
        let group_size = (self.pooled_ops.len() + COPY_WORKERS - 1) / COPY_WORKERS;
        rayon::scope(|scope| {
            for group in self.pooled_ops.chunks(group_size) {
                scope.spawn(move |_| {
                    for op in group {
                        copy_local(op.dst, op.src, op.count);
                    }
                });
            }
        });
        Ok(())
    }
}

/// Source/destination block pair for a blockwise copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyBlockInfo {
    /// Block index in the source cache.
    pub src_block_index: u64,
    /// Block index in the destination cache.
    pub dst_block_index: u64,
}

/// Parameters of a local cache copy.
#[derive(Debug, Clone)]
pub struct CopyCacheParam {
    /// Source cache.
    pub src_cache_id: i64,
    /// Destination cache.
    pub dst_cache_id: i64,
    /// Source batch row (continuous copies).
    pub src_batch_index: u64,
    /// Destination batch row (continuous copies).
    pub dst_batch_index: u64,
    /// Byte offset inside the row.
    pub offset: u64,
    /// Bytes to copy; 0 means the rest of the source row.
    pub size: u64,
    /// Block pairs; empty selects the continuous form.
    pub copy_block_infos: Vec<CopyBlockInfo>,
    /// Message-buffer memory is involved.
    pub mbuf_involved: bool,
    /// Devices the tensor list is striped across.
    pub num_devices: usize,
}

impl Default for CopyCacheParam {
    fn default() -> Self {
        Self {
            src_cache_id: 0,
            dst_cache_id: 0,
            src_batch_index: 0,
            dst_batch_index: 0,
            offset: 0,
            size: 0,
            copy_block_infos: Vec::new(),
            mbuf_involved: false,
            num_devices: 1,
        }
    }
}

/// Direction of a block swap between host and device caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapDirection {
    /// Host cache into device cache.
    HostToDevice,
    /// Device cache into host cache.
    DeviceToHost,
}

impl CacheManager {
    /// Copy between two local caches, continuous or blockwise.
    pub fn copy_cache(&self, param: &CopyCacheParam) -> KvResult<()> {
        let src = self
            .get_entry(param.src_cache_id)
            .ok_or_else(|| KvError::CacheNotExist(format!("src cache {}", param.src_cache_id)))?;
        let dst = self
            .get_entry(param.dst_cache_id)
            .ok_or_else(|| KvError::CacheNotExist(format!("dst cache {}", param.dst_cache_id)))?;
        if src.tensor_addrs.len() != dst.tensor_addrs.len() {
            return Err(KvError::ParamInvalid(format!(
                "tensor counts differ: src {} vs dst {}",
                src.tensor_addrs.len(),
                dst.tensor_addrs.len()
            )));
        }
        if param.num_devices == 0 || src.tensor_addrs.len() % param.num_devices != 0 {
            return Err(KvError::ParamInvalid(format!(
                "{} tensors cannot stripe over {} devices",
                src.tensor_addrs.len(),
                param.num_devices
            )));
        }
        if param.copy_block_infos.is_empty() {
            self.copy_cache_for_continuous(&src, &dst, param)
        } else {
            self.copy_cache_for_blocks(&src, &dst, param)
        }
    }

    /// Row-oriented copy: one span per tensor.
    pub fn copy_cache_for_continuous(
        &self,
        src: &CacheEntry,
        dst: &CacheEntry,
        param: &CopyCacheParam,
    ) -> KvResult<()> {
        if param.src_batch_index >= src.batch_size || param.dst_batch_index >= dst.batch_size {
            return Err(KvError::ParamInvalid(format!(
                "batch index out of range: src {} of {}, dst {} of {}",
                param.src_batch_index, src.batch_size, param.dst_batch_index, dst.batch_size
            )));
        }
        if param.offset >= src.stride {
            return Err(KvError::ParamInvalid(format!(
                "offset {} is past the source stride {}",
                param.offset, src.stride
            )));
        }
        let copy_size = if param.size > 0 { param.size } else { src.stride - param.offset };
        let src_offset = src.stride * param.src_batch_index + param.offset;
        let dst_offset = dst.stride * param.dst_batch_index + param.offset;
        if src_offset + copy_size > src.tensor_size || dst_offset + copy_size > dst.tensor_size {
            return Err(KvError::ParamInvalid(format!(
                "copy of {} bytes does not fit (src {}+{}, dst {}+{})",
                copy_size, src_offset, src.tensor_size, dst_offset, dst.tensor_size
            )));
        }
        let kind = CopyKind::between(src.placement, dst.placement);
        let per_device = src.tensor_addrs.len() / param.num_devices;
        for device in 0..param.num_devices {
            let mut job = CopyJob::new(param.mbuf_involved);
            let begin = device * per_device;
            for index in begin..begin + per_device {
                job.add_copy_task(CopyOp {
                    dst: dst.tensor_addrs[index] + dst_offset,
                    dst_max: dst.tensor_size - dst_offset,
                    src: src.tensor_addrs[index] + src_offset,
                    count: copy_size,
                    kind,
                })?;
            }
            job.run()?;
        }
        log::info!(
            "continuous copy {} -> {}: {} tensors, {} bytes each",
            src.cache_id,
            dst.cache_id,
            src.tensor_addrs.len(),
            copy_size
        );
        Ok(())
    }

    /// Blockwise copy following the given block pairs.
    pub fn copy_cache_for_blocks(
        &self,
        src: &CacheEntry,
        dst: &CacheEntry,
        param: &CopyCacheParam,
    ) -> KvResult<()> {
        if src.stride != dst.stride {
            return Err(KvError::ParamInvalid(format!(
                "block strides differ: src {} vs dst {}",
                src.stride, dst.stride
            )));
        }
        for info in &param.copy_block_infos {
            if info.src_block_index >= src.num_blocks || info.dst_block_index >= dst.num_blocks {
                return Err(KvError::ParamInvalid(format!(
                    "block pair ({}, {}) out of range [0, {}) x [0, {})",
                    info.src_block_index, info.dst_block_index, src.num_blocks, dst.num_blocks
                )));
            }
        }
        let kind = CopyKind::between(src.placement, dst.placement);
        let per_device = src.tensor_addrs.len() / param.num_devices;
        for device in 0..param.num_devices {
            let mut job = CopyJob::new(param.mbuf_involved);
            let begin = device * per_device;
            for index in begin..begin + per_device {
                for info in &param.copy_block_infos {
                    job.add_copy_task(CopyOp {
                        dst: dst.tensor_addrs[index] + info.dst_block_index * dst.stride,
                        dst_max: dst.stride,
                        src: src.tensor_addrs[index] + info.src_block_index * src.stride,
                        count: src.stride,
                        kind,
                    })?;
                }
            }
            job.run()?;
        }
        log::info!(
            "block copy {} -> {}: {} pairs x {} tensors",
            src.cache_id,
            dst.cache_id,
            param.copy_block_infos.len(),
            src.tensor_addrs.len()
        );
        Ok(())
    }

    /// Swap fixed-size blocks between a host cache and a device cache.
    pub fn swap_blocks(
        &self,
        src_cache_id: i64,
        dst_cache_id: i64,
        block_size: u64,
        direction: SwapDirection,
        block_mapping: &[(u64, u64)],
    ) -> KvResult<()> {
        if block_size == 0 {
            return Err(KvError::ParamInvalid("block_size must be > 0".to_string()));
        }
        let src = self
            .get_entry(src_cache_id)
            .ok_or_else(|| KvError::CacheNotExist(format!("src cache {}", src_cache_id)))?;
        let dst = self
            .get_entry(dst_cache_id)
            .ok_or_else(|| KvError::CacheNotExist(format!("dst cache {}", dst_cache_id)))?;
        let expected = match direction {
            SwapDirection::HostToDevice => (CachePlacement::Host, CachePlacement::Device),
            SwapDirection::DeviceToHost => (CachePlacement::Device, CachePlacement::Host),
        };
        if (src.placement, dst.placement) != expected {
            return Err(KvError::ParamInvalid(format!(
                "swap direction {:?} does not match placements ({:?} -> {:?})",
                direction, src.placement, dst.placement
            )));
        }
        if src.tensor_addrs.len() != dst.tensor_addrs.len() {
            return Err(KvError::ParamInvalid(format!(
                "tensor counts differ: src {} vs dst {}",
                src.tensor_addrs.len(),
                dst.tensor_addrs.len()
            )));
        }
        let src_blocks = src.tensor_size / block_size;
        let dst_blocks = dst.tensor_size / block_size;
        for &(from, to) in block_mapping {
            if from >= src_blocks || to >= dst_blocks {
                return Err(KvError::ParamInvalid(format!(
                    "swap pair ({}, {}) out of range [0, {}) x [0, {})",
                    from, to, src_blocks, dst_blocks
                )));
            }
        }
        let kind = CopyKind::between(src.placement, dst.placement);
        let mut job = CopyJob::new(false);
        for (src_addr, dst_addr) in src.tensor_addrs.iter().zip(dst.tensor_addrs.iter()) {
            for &(from, to) in block_mapping {
                job.add_copy_task(CopyOp {
                    dst: dst_addr + to * block_size,
                    dst_max: block_size,
                    src: src_addr + from * block_size,
                    count: block_size,
                    kind,
                })?;
            }
        }
        job.run()?;
        log::info!(
            "swapped {} blocks x {} tensors, {:?}",
            block_mapping.len(),
            src.tensor_addrs.len(),
            direction
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheDesc, CacheMemType, DataType};
    use crate::mempool::{PinnedRegion, ScalableMemPool};
    use std::sync::Arc;

    fn manager() -> (PinnedRegion, PinnedRegion, Arc<CacheManager>) {
        let dev_region = PinnedRegion::allocate(256 << 10);
        let host_region = PinnedRegion::allocate(256 << 10);
        let dev_pool = ScalableMemPool::initialize(dev_region.base(), dev_region.len(), 10).unwrap();
        let host_pool =
            ScalableMemPool::initialize(host_region.base(), host_region.len(), 10).unwrap();
        (dev_region, host_region, CacheManager::new(Some(dev_pool), Some(host_pool)))
    }

    fn desc(placement: CachePlacement, mem_type: CacheMemType, shape: Vec<u64>) -> CacheDesc {
        CacheDesc { num_tensors: 2, data_type: DataType::Int32, shape, placement, cache_mem_type: mem_type }
    }

    fn fill(addr: MemAddr, len: usize, seed: u8) {
        let bytes: Vec<u8> = (0..len).map(|i| seed.wrapping_add(i as u8)).collect();
        copy_local(addr, bytes.as_ptr() as MemAddr, len as u64);
    }

    fn read(addr: MemAddr, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        copy_local(out.as_mut_ptr() as MemAddr, addr, len as u64);
        out
    }

    #[test]
    fn test_continuous_copy_row() {
        let (_d, _h, manager) = manager();
        let src = manager
            .allocate(&desc(CachePlacement::Device, CacheMemType::Contiguous, vec![4, 16]), &[], false)
            .unwrap();
        let dst = manager
            .allocate(&desc(CachePlacement::Device, CacheMemType::Contiguous, vec![4, 16]), &[], false)
            .unwrap();
        let stride = 16 * 4;
        fill(src.tensor_addrs[0] + stride, stride as usize, 3);

        manager
            .copy_cache(&CopyCacheParam {
                src_cache_id: src.cache_id,
                dst_cache_id: dst.cache_id,
                src_batch_index: 1,
                dst_batch_index: 2,
                ..CopyCacheParam::default()
            })
            .unwrap();

        assert_eq!(
            read(dst.tensor_addrs[0] + 2 * stride, stride as usize),
            read(src.tensor_addrs[0] + stride, stride as usize)
        );
    }

    #[test]
    fn test_block_copy_requires_equal_stride() {
        let (_d, _h, manager) = manager();
        let src = manager
            .allocate(&desc(CachePlacement::Device, CacheMemType::Blocks, vec![4, 16]), &[], false)
            .unwrap();
        let dst = manager
            .allocate(&desc(CachePlacement::Device, CacheMemType::Blocks, vec![4, 32]), &[], false)
            .unwrap();
        let err = manager
            .copy_cache(&CopyCacheParam {
                src_cache_id: src.cache_id,
                dst_cache_id: dst.cache_id,
                copy_block_infos: vec![CopyBlockInfo { src_block_index: 0, dst_block_index: 0 }],
                ..CopyCacheParam::default()
            })
            .unwrap_err();
        assert!(matches!(err, KvError::ParamInvalid(_)));
    }

    #[test]
    fn test_block_copy_moves_pairs() {
        let (_d, _h, manager) = manager();
        let src = manager
            .allocate(&desc(CachePlacement::Device, CacheMemType::Blocks, vec![4, 16]), &[], false)
            .unwrap();
        let dst = manager
            .allocate(&desc(CachePlacement::Device, CacheMemType::Blocks, vec![4, 16]), &[], false)
            .unwrap();
        let stride = 16 * 4usize;
        fill(src.tensor_addrs[0], stride, 1);
        fill(src.tensor_addrs[0] + 2 * stride as u64, stride, 9);

        manager
            .copy_cache(&CopyCacheParam {
                src_cache_id: src.cache_id,
                dst_cache_id: dst.cache_id,
                copy_block_infos: vec![
                    CopyBlockInfo { src_block_index: 0, dst_block_index: 3 },
                    CopyBlockInfo { src_block_index: 2, dst_block_index: 1 },
                ],
                ..CopyCacheParam::default()
            })
            .unwrap();

        assert_eq!(read(dst.tensor_addrs[0] + 3 * stride as u64, stride), read(src.tensor_addrs[0], stride));
        assert_eq!(
            read(dst.tensor_addrs[0] + stride as u64, stride),
            read(src.tensor_addrs[0] + 2 * stride as u64, stride)
        );
    }

    #[test]
    fn test_copy_invariant_under_placement() {
        let (_d, _h, manager) = manager();
        let mut payload_device = Vec::new();
        let mut payload_host = Vec::new();
        for placement in [CachePlacement::Device, CachePlacement::Host] {
            let src = manager
                .allocate(&desc(placement, CacheMemType::Contiguous, vec![2, 16]), &[], false)
                .unwrap();
            let dst = manager
                .allocate(&desc(placement, CacheMemType::Contiguous, vec![2, 16]), &[], false)
                .unwrap();
            fill(src.tensor_addrs[0], 64, 5);
            manager
                .copy_cache(&CopyCacheParam {
                    src_cache_id: src.cache_id,
                    dst_cache_id: dst.cache_id,
                    ..CopyCacheParam::default()
                })
                .unwrap();
            let out = read(dst.tensor_addrs[0], 64);
            if placement == CachePlacement::Device {
                payload_device = out;
            } else {
                payload_host = out;
            }
        }
        assert_eq!(payload_device, payload_host);
    }

    #[test]
    fn test_swap_blocks_direction_checked() {
        let (_d, _h, manager) = manager();
        let host = manager
            .allocate(&desc(CachePlacement::Host, CacheMemType::Blocks, vec![4, 16]), &[], false)
            .unwrap();
        let device = manager
            .allocate(&desc(CachePlacement::Device, CacheMemType::Blocks, vec![4, 16]), &[], false)
            .unwrap();

        let err = manager
            .swap_blocks(host.cache_id, device.cache_id, 64, SwapDirection::DeviceToHost, &[(0, 0)])
            .unwrap_err();
        assert!(matches!(err, KvError::ParamInvalid(_)));

        fill(host.tensor_addrs[0], 64, 11);
        manager
            .swap_blocks(host.cache_id, device.cache_id, 64, SwapDirection::HostToDevice, &[(0, 2)])
            .unwrap();
        assert_eq!(read(device.tensor_addrs[0] + 128, 64), read(host.tensor_addrs[0], 64));
    }

    #[test]
    fn test_copy_job_chunks_large_async() {
        let src = vec![7u8; 10 * 1024 * 1024];
        let mut dst = vec![0u8; 10 * 1024 * 1024];
        let mut job = CopyJob::with_max_block_size(false, 3 * 1024 * 1024);
        job.add_copy_task(CopyOp {
            dst: dst.as_mut_ptr() as MemAddr,
            dst_max: dst.len() as u64,
            src: src.as_ptr() as MemAddr,
            count: src.len() as u64,
            kind: CopyKind::D2D,
        })
        .unwrap();
        job.run().unwrap();
        assert_eq!(dst, src);
    }

    #[test]
    fn test_copy_job_rejects_overflow() {
        let mut job = CopyJob::new(false);
        let err = job
            .add_copy_task(CopyOp { dst: 0x1000, dst_max: 8, src: 0x2000, count: 16, kind: CopyKind::H2H })
            .unwrap_err();
        assert!(matches!(err, KvError::ParamInvalid(_)));
    }
}
