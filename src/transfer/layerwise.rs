//! Layer-wise cache transfer.
//!
//! The initiator owns the source data and PUTs it into the destination's
//! tensor addresses, one layer batch at a time. The event-recorded
//! variant polls a fabric event after each batch, which lets adjacent
//! layers pipeline instead of serialising on a full stream sync.

use crate::cache::CacheEntry;
use crate::error::{KvError, KvResult};
use crate::fabric::{CommHandle, Fabric};
use crate::memory::MemAddr;
use crate::transfer::find_contiguous_block_runs;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Poll period while waiting on a recorded event.
const EVENT_POLL_PERIOD: Duration = Duration::from_micros(50);

/// Layer-wise transfer parameters.
#[derive(Debug, Clone, Default)]
pub struct TransferCacheConfig {
    /// Local source cache.
    pub cache_id: i64,
    /// Remote destination cache; used when `dst_addrs` is empty and the
    /// peer's catalog is mirrored.
    pub dst_cache_id: i64,
    /// Tensors per layer on both sides.
    pub tensor_num_per_layer: u64,
    /// Source layers `[lo, hi)`.
    pub src_layer_range: (u64, u64),
    /// Destination layers `[lo, hi)`; must have the same width.
    pub dst_layer_range: (u64, u64),
    /// Destination tensor addresses, layer-major; resolved from the
    /// mirrored catalog when empty.
    pub dst_addrs: Vec<MemAddr>,
    /// Source batch row for the contiguous form.
    pub batch_index: u64,
    /// Bytes per tensor; 0 transfers the whole tensor.
    pub size: u64,
    /// Use the event-recorded synchronisation variant.
    pub use_event_record: bool,
}

/// Block lists for the blockwise form; empty lists select contiguous.
#[derive(Debug, Clone, Default)]
pub struct TransferBlockConfig {
    /// Source block indices.
    pub src_blocks: Vec<u64>,
    /// Destination block indices.
    pub dst_blocks: Vec<u64>,
}

impl TransferBlockConfig {
    /// True when the contiguous form applies.
    pub fn is_contiguous(&self) -> bool {
        self.src_blocks.is_empty() && self.dst_blocks.is_empty()
    }
}

/// One layer batch's worth of one-sided PUTs.
struct LayerBatch {
    ops: Vec<(MemAddr, MemAddr, u64)>,
}

/// Executes a layer-wise transfer over one communicator.
pub struct LayerWiseTransferJob {
    fabric: Arc<dyn Fabric>,
    comm: CommHandle,
}

impl LayerWiseTransferJob {
    /// Job bound to a communicator.
    pub fn new(fabric: Arc<dyn Fabric>, comm: CommHandle) -> Self {
        Self { fabric, comm }
    }

    /// Validate the config against the source cache and build per-layer
    /// batches.
    fn build_batches(
        src: &CacheEntry,
        config: &TransferCacheConfig,
        blocks: &TransferBlockConfig,
    ) -> KvResult<Vec<LayerBatch>> {
        let per_layer = config.tensor_num_per_layer;
        if per_layer == 0 {
            return Err(KvError::ParamInvalid("tensor_num_per_layer must be > 0".to_string()));
        }
        let num_tensors = src.tensor_addrs.len() as u64;
        if num_tensors % per_layer != 0 {
            return Err(KvError::ParamInvalid(format!(
                "{} tensors do not divide into layers of {}",
                num_tensors, per_layer
            )));
        }
        let num_layers = num_tensors / per_layer;
        let (src_lo, src_hi) = config.src_layer_range;
        let (dst_lo, dst_hi) = config.dst_layer_range;
        if src_lo >= src_hi || dst_lo >= dst_hi {
            return Err(KvError::ParamInvalid("layer ranges must be non-empty half-open intervals".to_string()));
        }
        if src_hi - src_lo != dst_hi - dst_lo {
            return Err(KvError::ParamInvalid(format!(
                "layer ranges differ in width: src {} vs dst {}",
                src_hi - src_lo,
                dst_hi - dst_lo
            )));
        }
        if src_hi > num_layers {
            return Err(KvError::ParamInvalid(format!(
                "source layers [{}, {}) exceed the cache's {}",
                src_lo, src_hi, num_layers
            )));
        }
        let width = src_hi - src_lo;
        if config.dst_addrs.len() as u64 != width * per_layer {
            return Err(KvError::ParamInvalid(format!(
                "{} destination addresses given, {} layers x {} tensors needed",
                config.dst_addrs.len(),
                width,
                per_layer
            )));
        }

        let runs = if blocks.is_contiguous() {
            None
        } else {
            let runs = find_contiguous_block_runs(&blocks.src_blocks, &blocks.dst_blocks)?;
            for run in &runs {
                if run.src_start + run.len > src.num_blocks {
                    return Err(KvError::ParamInvalid(format!(
                        "source blocks [{}, {}) out of range [0, {})",
                        run.src_start,
                        run.src_start + run.len,
                        src.num_blocks
                    )));
                }
            }
            Some(runs)
        };

        let mut batches = Vec::with_capacity(width as usize);
        for layer in 0..width {
            let mut ops = Vec::new();
            for t in 0..per_layer {
                let src_tensor = src.tensor_addrs[((src_lo + layer) * per_layer + t) as usize];
                let dst_base = config.dst_addrs[(layer * per_layer + t) as usize];
                match &runs {
                    None => {
                        let len = if config.size > 0 { config.size } else { src.tensor_size };
                        let offset = config.batch_index * src.stride;
                        if offset + len > src.tensor_size {
                            return Err(KvError::ParamInvalid(format!(
                                "transfer of {} bytes at row {} exceeds the tensor",
                                len, config.batch_index
                            )));
                        }
                        ops.push((src_tensor + offset, dst_base + offset, len));
                    }
                    Some(runs) => {
                        for run in runs {
                            ops.push((
                                src_tensor + run.src_start * src.stride,
                                dst_base + run.dst_start * src.stride,
                                run.len * src.stride,
                            ));
                        }
                    }
                }
            }
            batches.push(LayerBatch { ops });
        }
        Ok(batches)
    }

    /// Run the transfer; one batch per destination layer.
    pub async fn run(
        &self,
        src: &CacheEntry,
        config: &TransferCacheConfig,
        blocks: &TransferBlockConfig,
        timeout: Duration,
    ) -> KvResult<()> {
        let batches = Self::build_batches(src, config, blocks)?;
        let deadline = Instant::now() + timeout;
        for (index, batch) in batches.iter().enumerate() {
            for &(src_addr, dst_addr, len) in &batch.ops {
                self.fabric.put(self.comm, src_addr, dst_addr, len)?;
            }
            if config.use_event_record {
                self.wait_event(deadline).await?;
            }
            log::debug!("layer batch {} of {} posted ({} ops)", index + 1, batches.len(), batch.ops.len());
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.fabric.sync_stream(self.comm, remaining)?;
        Ok(())
    }

    /// Record an event behind the batch and poll it to completion.
    async fn wait_event(&self, deadline: Instant) -> KvResult<()> {
        let event = self.fabric.record_event(self.comm)?;
        loop {
            match self.fabric.query_event(event) {
                Ok(true) => break,
                Ok(false) => {
                    if Instant::now() >= deadline {
                        self.fabric.destroy_event(event)?;
                        let _ = self.fabric.abort_stream(self.comm);
                        return Err(KvError::Timeout("layer event did not complete".to_string()));
                    }
                    tokio::time::sleep(EVENT_POLL_PERIOD).await;
                }
                Err(err) => {
                    self.fabric.destroy_event(event)?;
                    return Err(err);
                }
            }
        }
        self.fabric.destroy_event(event)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheMemType, CachePlacement, DataType};

    fn entry(num_tensors: usize, shape: Vec<u64>) -> CacheEntry {
        let tensor_size: u64 = shape.iter().product::<u64>() * 4;
        let leading = shape[0];
        CacheEntry {
            cache_id: 1,
            placement: CachePlacement::Device,
            cache_mem_type: CacheMemType::Contiguous,
            data_type: DataType::Int32,
            shape,
            tensor_size,
            stride: tensor_size / leading,
            batch_size: leading,
            num_blocks: leading,
            tensor_addrs: (0..num_tensors).map(|i| 0x10_0000 + (i as u64) * 0x1000).collect(),
            is_owned: true,
            remote_accessible: false,
        }
    }

    #[test]
    fn test_layer_range_validation() {
        let src = entry(8, vec![4, 32]);
        let config = TransferCacheConfig {
            tensor_num_per_layer: 2,
            src_layer_range: (0, 2),
            dst_layer_range: (2, 3),
            dst_addrs: vec![0x1, 0x2],
            ..TransferCacheConfig::default()
        };
        // Widths differ.
        assert!(LayerWiseTransferJob::build_batches(&src, &config, &TransferBlockConfig::default()).is_err());

        let config = TransferCacheConfig {
            tensor_num_per_layer: 2,
            src_layer_range: (3, 5),
            dst_layer_range: (0, 2),
            dst_addrs: vec![0x1, 0x2, 0x3, 0x4],
            ..TransferCacheConfig::default()
        };
        // Source range past the 4 layers of an 8-tensor cache.
        assert!(LayerWiseTransferJob::build_batches(&src, &config, &TransferBlockConfig::default()).is_err());
    }

    #[test]
    fn test_batches_map_layers_to_dst_addrs() {
        let src = entry(8, vec![4, 32]);
        let config = TransferCacheConfig {
            tensor_num_per_layer: 2,
            src_layer_range: (0, 1),
            dst_layer_range: (2, 3),
            dst_addrs: vec![0xA000, 0xB000],
            ..TransferCacheConfig::default()
        };
        let batches =
            LayerWiseTransferJob::build_batches(&src, &config, &TransferBlockConfig::default()).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].ops.len(), 2);
        // Whole tensors: src layer 0 tensors 0 and 1.
        assert_eq!(batches[0].ops[0], (src.tensor_addrs[0], 0xA000, src.tensor_size));
        assert_eq!(batches[0].ops[1], (src.tensor_addrs[1], 0xB000, src.tensor_size));
    }

    #[test]
    fn test_block_form_builds_runs() {
        let src = entry(2, vec![8, 16]);
        let config = TransferCacheConfig {
            tensor_num_per_layer: 2,
            src_layer_range: (0, 1),
            dst_layer_range: (0, 1),
            dst_addrs: vec![0xA000, 0xB000],
            ..TransferCacheConfig::default()
        };
        let blocks = TransferBlockConfig { src_blocks: vec![0, 1, 5], dst_blocks: vec![2, 3, 7] };
        let batches = LayerWiseTransferJob::build_batches(&src, &config, &blocks).unwrap();
        // Two runs per tensor: (0,1)->(2,3) coalesced, then 5->7.
        assert_eq!(batches[0].ops.len(), 4);
        let stride = src.stride;
        assert_eq!(batches[0].ops[0], (src.tensor_addrs[0], 0xA000 + 2 * stride, 2 * stride));
        assert_eq!(batches[0].ops[1], (src.tensor_addrs[0] + 5 * stride, 0xA000 + 7 * stride, stride));
    }

    #[test]
    fn test_out_of_range_src_blocks_rejected() {
        let src = entry(2, vec![4, 16]);
        let config = TransferCacheConfig {
            tensor_num_per_layer: 2,
            src_layer_range: (0, 1),
            dst_layer_range: (0, 1),
            dst_addrs: vec![0xA000, 0xB000],
            ..TransferCacheConfig::default()
        };
        let blocks = TransferBlockConfig { src_blocks: vec![7], dst_blocks: vec![0] };
        assert!(LayerWiseTransferJob::build_batches(&src, &config, &blocks).is_err());
    }
}
