//! # Transfer Planning
//!
//! Turns a pull/push/transfer request into one-sided run descriptors.
//! Three layout classes exist per side; the legal transitions are
//! contiguous→contiguous, contiguous→blocks (source split into
//! stride-sized pieces, last may be a remainder), and blocks→blocks
//! (adjacent pairs coalesced into runs). Blocks→contiguous is rejected.

pub mod buffered;
pub mod client;
pub mod layerwise;
pub mod wire;

use crate::cache::CacheEntry;
use crate::error::{KvError, KvResult};
use crate::memory::MemAddr;
use wire::{TransferCacheReq, TransferCacheRequest, TransferInfo};

/// Transfers below this size take the staging path.
pub const NEED_USE_BUFFER_THRESH: u64 = 256 * 1024;

/// One generic one-sided operation for the point-to-point engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOpDesc {
    /// Address on this endpoint.
    pub local_addr: MemAddr,
    /// Address on the peer.
    pub remote_addr: MemAddr,
    /// Bytes to move.
    pub len: u64,
}

/// Parameters of a cache pull.
#[derive(Debug, Clone, Default)]
pub struct PullCacheParam {
    /// Remote cache id; 0 selects lookup by key.
    pub cache_id: i64,
    /// Request id of the remote cache key.
    pub req_id: u64,
    /// Prefix id of the remote cache key; 0 when unused.
    pub prefix_id: u64,
    /// Model id of the remote cache key.
    pub model_id: u64,
    /// Destination batch row for the contiguous form.
    pub batch_index: u64,
    /// Source block list; empty for a contiguous source.
    pub prompt_blocks: Vec<u64>,
    /// Destination block list; empty for a contiguous destination.
    pub decoder_blocks: Vec<u64>,
    /// Bytes per tensor for the contiguous form; 0 means one stride.
    pub size: u64,
    /// Dense source tensor subset; empty selects all.
    pub src_tensor_indices: Vec<u64>,
    /// Dense destination tensor subset; empty selects all.
    pub dst_tensor_indices: Vec<u64>,
    /// Response deadline override in milliseconds; 0 uses the engine default.
    pub timeout_ms: u64,
}

/// Dense tensor ranges addressed by a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorSelection {
    /// First source tensor.
    pub src_start: u64,
    /// First destination tensor.
    pub dst_start: u64,
    /// Tensors addressed on each side.
    pub count: u64,
}

/// Check that `indices` form a dense contiguous range, returning its start.
pub fn validate_dense_indices(indices: &[u64]) -> KvResult<u64> {
    let mut unique: Vec<u64> = indices.to_vec();
    unique.sort_unstable();
    unique.dedup();
    if unique.len() != indices.len() {
        return Err(KvError::ParamInvalid("tensor indices contain duplicates".to_string()));
    }
    let (min, max) = (unique[0], unique[unique.len() - 1]);
    if max - min + 1 != unique.len() as u64 {
        return Err(KvError::ParamInvalid(format!(
            "tensor indices are not contiguous: [{}, {}] holds {} values",
            min,
            max,
            unique.len()
        )));
    }
    Ok(min)
}

/// Resolve the tensor subsets of a request against the destination cache.
pub fn select_tensors(
    src_indices: &[u64],
    dst_indices: &[u64],
    dst_num_tensors: u64,
) -> KvResult<TensorSelection> {
    if !src_indices.is_empty() && !dst_indices.is_empty() && src_indices.len() != dst_indices.len() {
        return Err(KvError::ParamInvalid(format!(
            "tensor subsets differ in length: src {} vs dst {}",
            src_indices.len(),
            dst_indices.len()
        )));
    }
    let dst_start = if dst_indices.is_empty() { 0 } else { validate_dense_indices(dst_indices)? };
    let src_start = if src_indices.is_empty() { 0 } else { validate_dense_indices(src_indices)? };
    let count = if !dst_indices.is_empty() {
        dst_indices.len() as u64
    } else if !src_indices.is_empty() {
        src_indices.len() as u64
    } else {
        dst_num_tensors
    };
    if dst_start + count > dst_num_tensors {
        return Err(KvError::ParamInvalid(format!(
            "destination tensors [{}, {}) exceed the cache's {}",
            dst_start,
            dst_start + count,
            dst_num_tensors
        )));
    }
    Ok(TensorSelection { src_start, dst_start, count })
}

/// A run of block pairs with adjacent ids on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRun {
    /// First source block.
    pub src_start: u64,
    /// First destination block.
    pub dst_start: u64,
    /// Blocks in the run.
    pub len: u64,
}

/// Coalesce `(src, dst)` block pairs into runs where both ids advance
/// together.
pub fn find_contiguous_block_runs(src_blocks: &[u64], dst_blocks: &[u64]) -> KvResult<Vec<BlockRun>> {
    if src_blocks.len() != dst_blocks.len() {
        return Err(KvError::ParamInvalid(format!(
            "block lists differ in length: src {} vs dst {}",
            src_blocks.len(),
            dst_blocks.len()
        )));
    }
    let mut runs: Vec<BlockRun> = Vec::new();
    for (&src, &dst) in src_blocks.iter().zip(dst_blocks.iter()) {
        match runs.last_mut() {
            Some(run) if src == run.src_start + run.len && dst == run.dst_start + run.len => {
                run.len += 1;
            }
            _ => runs.push(BlockRun { src_start: src, dst_start: dst, len: 1 }),
        }
    }
    Ok(runs)
}

/// Build the wire request for a pull against the destination cache.
///
/// The source side is validated by the peer; this end only needs the
/// destination geometry.
pub fn plan_pull_request(
    dst: &CacheEntry,
    param: &PullCacheParam,
    timeout_ms: u64,
) -> KvResult<TransferCacheRequest> {
    if !param.prompt_blocks.is_empty() && param.decoder_blocks.is_empty() {
        return Err(KvError::ParamInvalid(
            "pull from a blocks source into a contiguous destination is not supported".to_string(),
        ));
    }
    let selection = select_tensors(
        &param.src_tensor_indices,
        &param.dst_tensor_indices,
        dst.tensor_addrs.len() as u64,
    )?;

    let mut header = TransferCacheReq {
        cache_id: param.cache_id,
        req_id: param.req_id,
        prefix_id: param.prefix_id,
        model_id: param.model_id,
        batch_index: param.batch_index,
        dst_addr_count: selection.count,
        dst_placement: match dst.placement {
            crate::cache::CachePlacement::Host => 0,
            crate::cache::CachePlacement::Device => 1,
        },
        timeout_in_ms: timeout_ms,
        num_tensors: selection.count,
        src_tensor_indices_size: selection.count,
        src_tensor_start_index: selection.src_start,
        ..TransferCacheReq::default()
    };

    let mut infos = Vec::new();
    if param.decoder_blocks.is_empty() {
        // Contiguous destination: fold the batch offset into each address.
        if param.batch_index >= dst.batch_size {
            return Err(KvError::ParamInvalid(format!(
                "batch index {} out of range [0, {})",
                param.batch_index, dst.batch_size
            )));
        }
        let pull_size = if param.size > 0 { param.size } else { dst.stride };
        if pull_size > dst.stride {
            return Err(KvError::ParamInvalid(format!(
                "pull size {} exceeds the destination stride {}",
                pull_size, dst.stride
            )));
        }
        header.pull_size = pull_size;
        header.buffer_info_count = 1;
        for t in 0..selection.count {
            let base = dst.tensor_addrs[(selection.dst_start + t) as usize];
            infos.push(TransferInfo::dst(base + param.batch_index * dst.stride));
        }
        infos.push(TransferInfo::run(pull_size, 0));
        infos.push(TransferInfo::run(pull_size, 0));
    } else {
        let runs = if param.prompt_blocks.is_empty() {
            // Contiguous source split into stride-sized pieces, one per
            // destination block, in list order.
            header.is_pull_block = 0;
            param
                .decoder_blocks
                .iter()
                .enumerate()
                .map(|(piece, &dst_block)| BlockRun { src_start: piece as u64, dst_start: dst_block, len: 1 })
                .collect()
        } else {
            header.is_pull_block = 1;
            find_contiguous_block_runs(&param.prompt_blocks, &param.decoder_blocks)?
        };
        for run in &runs {
            let dst_end = run.dst_start + run.len - 1;
            if dst_end >= dst.num_blocks {
                return Err(KvError::ParamInvalid(format!(
                    "destination blocks [{}, {}] out of range [0, {})",
                    run.dst_start, dst_end, dst.num_blocks
                )));
            }
            header.max_block_index = header.max_block_index.max(run.src_start + run.len - 1);
        }
        header.block_size = dst.stride;
        header.buffer_info_count = runs.len() as u64;
        for t in 0..selection.count {
            infos.push(TransferInfo::dst(dst.tensor_addrs[(selection.dst_start + t) as usize]));
        }
        for run in &runs {
            infos.push(TransferInfo::run(run.len * dst.stride, run.src_start));
        }
        for run in &runs {
            infos.push(TransferInfo::run(run.len * dst.stride, run.dst_start));
        }
    }

    Ok(TransferCacheRequest { header, infos })
}

/// One concrete one-sided operation resolved on the serving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedOp {
    /// Source address on the serving endpoint.
    pub src_addr: MemAddr,
    /// Destination address on the requesting endpoint.
    pub dst_addr: MemAddr,
    /// Bytes to move.
    pub len: u64,
}

/// Expand a received request against the local source cache.
///
/// `src_batch_index` is the batch row bound to the resolved cache key on
/// this side; it offsets contiguous sources only.
pub fn expand_request(
    request: &TransferCacheRequest,
    src: &CacheEntry,
    src_batch_index: u64,
) -> KvResult<Vec<ResolvedOp>> {
    let header = &request.header;
    let tensor_count = header.dst_addr_count;
    let src_start = header.src_tensor_start_index;
    if src_start + tensor_count > src.tensor_addrs.len() as u64 {
        return Err(KvError::ParamInvalid(format!(
            "request addresses source tensors [{}, {}) of {}",
            src_start,
            src_start + tensor_count,
            src.tensor_addrs.len()
        )));
    }

    let mut ops = Vec::new();
    if header.block_size == 0 {
        // Contiguous to contiguous.
        if header.pull_size > src.stride {
            return Err(KvError::ParamInvalid(format!(
                "pull size {} exceeds the source stride {}",
                header.pull_size, src.stride
            )));
        }
        if src_batch_index >= src.batch_size {
            return Err(KvError::ParamInvalid(format!(
                "source batch index {} out of range [0, {})",
                src_batch_index, src.batch_size
            )));
        }
        let src_offset = src_batch_index * src.stride;
        for t in 0..tensor_count {
            let src_base = src.tensor_addrs[(src_start + t) as usize];
            ops.push(ResolvedOp {
                src_addr: src_base + src_offset,
                dst_addr: request.dst_addrs()[t as usize].dst_addr(),
                len: header.pull_size,
            });
        }
        return Ok(ops);
    }

    if header.is_pull_block != 0 {
        // Blocks to blocks: strides must agree.
        if src.stride != header.block_size {
            return Err(KvError::ParamInvalid(format!(
                "source stride {} does not match destination block size {}",
                src.stride, header.block_size
            )));
        }
        if header.max_block_index >= src.num_blocks {
            return Err(KvError::ParamInvalid(format!(
                "source block {} out of range [0, {})",
                header.max_block_index, src.num_blocks
            )));
        }
    }

    for t in 0..tensor_count {
        let src_base = src.tensor_addrs[(src_start + t) as usize];
        for (src_run, dst_run) in request.src_runs().iter().zip(request.dst_runs().iter()) {
            let src_offset = src_run.block_start_index() * header.block_size;
            if src_offset >= src.tensor_size {
                return Err(KvError::ParamInvalid(format!(
                    "source run at {} starts past the tensor ({} bytes)",
                    src_offset, src.tensor_size
                )));
            }
            // A contiguous source may end mid-piece; clamp to what exists.
            let len = src_run.buffer_len().min(src.tensor_size - src_offset);
            ops.push(ResolvedOp {
                src_addr: src_base + src_offset,
                dst_addr: request.dst_addrs()[t as usize].dst_addr()
                    + dst_run.block_start_index() * header.block_size,
                len,
            });
        }
    }
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheMemType, CachePlacement, DataType};

    fn entry(mem_type: CacheMemType, shape: Vec<u64>, addrs: Vec<MemAddr>) -> CacheEntry {
        let tensor_size: u64 = shape.iter().product::<u64>() * 4;
        let leading = shape[0];
        CacheEntry {
            cache_id: 1,
            placement: CachePlacement::Device,
            cache_mem_type: mem_type,
            data_type: DataType::Int32,
            shape,
            tensor_size,
            stride: tensor_size / leading,
            batch_size: leading,
            num_blocks: leading,
            tensor_addrs: addrs,
            is_owned: true,
            remote_accessible: false,
        }
    }

    #[test]
    fn test_dense_indices_validation() {
        assert_eq!(validate_dense_indices(&[4, 5, 6]).unwrap(), 4);
        assert_eq!(validate_dense_indices(&[6, 4, 5]).unwrap(), 4);
        assert!(validate_dense_indices(&[1, 3]).is_err());
        assert!(validate_dense_indices(&[2, 2, 3]).is_err());
    }

    #[test]
    fn test_block_run_coalescing() {
        // Pairs (0,1) (1,2) coalesce, then the runs break wherever either
        // side stops advancing by one.
        let runs = find_contiguous_block_runs(&[0, 1, 4, 5, 6], &[1, 2, 4, 6, 9]).unwrap();
        assert_eq!(
            runs,
            vec![
                BlockRun { src_start: 0, dst_start: 1, len: 2 },
                BlockRun { src_start: 4, dst_start: 4, len: 1 },
                BlockRun { src_start: 5, dst_start: 6, len: 1 },
                BlockRun { src_start: 6, dst_start: 9, len: 1 },
            ]
        );
    }

    #[test]
    fn test_blocks_to_contiguous_forbidden() {
        let dst = entry(CacheMemType::Contiguous, vec![4, 32], vec![0x1000]);
        let param = PullCacheParam { prompt_blocks: vec![0, 1], ..PullCacheParam::default() };
        assert!(matches!(plan_pull_request(&dst, &param, 1000), Err(KvError::ParamInvalid(_))));
    }

    #[test]
    fn test_contiguous_plan_folds_batch_offset() {
        let dst = entry(CacheMemType::Contiguous, vec![4, 128], vec![0x1000, 0x9000]);
        let param = PullCacheParam { batch_index: 1, ..PullCacheParam::default() };
        let request = plan_pull_request(&dst, &param, 1000).unwrap();
        assert_eq!(request.header.pull_size, 512);
        assert_eq!(request.header.buffer_info_count, 1);
        assert_eq!(request.dst_addrs()[0].dst_addr(), 0x1000 + 512);
        assert_eq!(request.dst_addrs()[1].dst_addr(), 0x9000 + 512);
    }

    #[test]
    fn test_contiguous_to_blocks_plan() {
        let dst = entry(CacheMemType::Blocks, vec![64, 2], vec![0x4000]);
        let param = PullCacheParam { decoder_blocks: vec![1, 3, 5, 7], ..PullCacheParam::default() };
        let request = plan_pull_request(&dst, &param, 1000).unwrap();
        assert_eq!(request.header.block_size, 8);
        assert_eq!(request.header.buffer_info_count, 4);
        assert_eq!(request.header.is_pull_block, 0);
        // Piece i of the source goes to decoder_blocks[i].
        assert_eq!(request.src_runs()[2].block_start_index(), 2);
        assert_eq!(request.dst_runs()[2].block_start_index(), 5);
    }

    #[test]
    fn test_blocks_plan_rejects_out_of_range_dst() {
        let dst = entry(CacheMemType::Blocks, vec![4, 16], vec![0x4000]);
        let param = PullCacheParam {
            prompt_blocks: vec![0],
            decoder_blocks: vec![9],
            ..PullCacheParam::default()
        };
        assert!(plan_pull_request(&dst, &param, 1000).is_err());
    }

    #[test]
    fn test_expand_contiguous_uses_source_batch() {
        let dst = entry(CacheMemType::Contiguous, vec![4, 128], vec![0x1000]);
        let src = entry(CacheMemType::Contiguous, vec![4, 128], vec![0x20_0000]);
        let param = PullCacheParam { batch_index: 2, ..PullCacheParam::default() };
        let request = plan_pull_request(&dst, &param, 1000).unwrap();
        let ops = expand_request(&request, &src, 1).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].src_addr, 0x20_0000 + 512);
        assert_eq!(ops[0].dst_addr, 0x1000 + 2 * 512);
        assert_eq!(ops[0].len, 512);
    }

    #[test]
    fn test_expand_remainder_piece_is_clamped() {
        // Source [1, 7] int32 = 28 bytes; destination blocks of 8 bytes.
        let dst = entry(CacheMemType::Blocks, vec![64, 2], vec![0x4000]);
        let src = entry(CacheMemType::Contiguous, vec![1, 7], vec![0x8000]);
        let param = PullCacheParam { decoder_blocks: vec![1, 3, 5, 7], ..PullCacheParam::default() };
        let request = plan_pull_request(&dst, &param, 1000).unwrap();
        let ops = expand_request(&request, &src, 0).unwrap();
        assert_eq!(ops.len(), 4);
        assert_eq!(ops[0].len, 8);
        assert_eq!(ops[3].len, 4); // remainder
        assert_eq!(ops[3].src_addr, 0x8000 + 24);
        assert_eq!(ops[3].dst_addr, 0x4000 + 7 * 8);
    }

    #[test]
    fn test_expand_blocks_checks_stride() {
        let dst = entry(CacheMemType::Blocks, vec![4, 16], vec![0x4000]);
        let src = entry(CacheMemType::Blocks, vec![4, 32], vec![0x8000]);
        let param = PullCacheParam {
            prompt_blocks: vec![0],
            decoder_blocks: vec![1],
            ..PullCacheParam::default()
        };
        let request = plan_pull_request(&dst, &param, 1000).unwrap();
        assert!(expand_request(&request, &src, 0).is_err());
    }

    #[test]
    fn test_tensor_subset_selection() {
        let selection = select_tensors(&[2, 3], &[4, 5], 8).unwrap();
        assert_eq!(selection, TensorSelection { src_start: 2, dst_start: 4, count: 2 });
        assert!(select_tensors(&[1, 2], &[4], 8).is_err());
        assert!(select_tensors(&[], &[7, 8], 8).is_err());
    }

    mod properties {
        use crate::transfer::find_contiguous_block_runs;
        use proptest::prelude::*;

        proptest! {
            // Coalescing never drops, reorders, or invents a block pair.
            #[test]
            fn prop_block_runs_cover_all_pairs(
                pairs in proptest::collection::vec((0u64..64, 0u64..64), 0..32)
            ) {
                let src: Vec<u64> = pairs.iter().map(|p| p.0).collect();
                let dst: Vec<u64> = pairs.iter().map(|p| p.1).collect();
                let runs = find_contiguous_block_runs(&src, &dst).unwrap();
                let mut flattened = Vec::new();
                for run in &runs {
                    for i in 0..run.len {
                        flattened.push((run.src_start + i, run.dst_start + i));
                    }
                }
                prop_assert_eq!(flattened, pairs);
            }

            // Runs longer than one block only form where both ids advance.
            #[test]
            fn prop_runs_are_maximal_forward_steps(
                start in 0u64..16, len in 1u64..16
            ) {
                let src: Vec<u64> = (start..start + len).collect();
                let dst: Vec<u64> = (start + 1..start + len + 1).collect();
                let runs = find_contiguous_block_runs(&src, &dst).unwrap();
                prop_assert_eq!(runs.len(), 1);
                prop_assert_eq!(runs[0].len, len);
            }
        }
    }
}
