//! Shared-slot wire layouts.
//!
//! Requests and responses travel as raw byte images inside registered
//! slots: the requester PUTs a [`TransferCacheReq`] into the peer's
//! request slot and raises the slot's flag; the peer answers through the
//! requester's response slot the same way. Layouts are `#[repr(C)]`
//! eight-byte fields in declaration order.

use crate::error::{KvError, KvResult};
use crate::memory::MemAddr;
use bytemuck::{Pod, Zeroable};

/// Request slot size, flag included.
pub const REQ_SLOT_SIZE: usize = 112 * 1024;
/// Response slot size, flag included.
pub const RESP_SLOT_SIZE: usize = 4 * 1024;
/// Size of the blocking flag at the tail of each slot.
pub const FLAG_SIZE: usize = 8;

/// Fixed header of a cache-transfer request.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct TransferCacheReq {
    /// Source cache id on the peer; 0 selects lookup by key.
    pub cache_id: i64,
    /// Request id of the source cache key.
    pub req_id: u64,
    /// Prefix id of the source cache key; 0 when unused.
    pub prefix_id: u64,
    /// Model id of the source cache key.
    pub model_id: u64,
    /// Destination batch row, already folded into the dst addresses.
    pub batch_index: u64,
    /// Number of destination tensor addresses that follow.
    pub dst_addr_count: u64,
    /// Number of src/dst buffer-info pairs that follow the addresses.
    pub buffer_info_count: u64,
    /// 1 for a blocks-to-blocks pull.
    pub is_pull_block: u64,
    /// Destination placement (0 host, 1 device).
    pub dst_placement: u64,
    /// Response deadline in milliseconds.
    pub timeout_in_ms: u64,
    /// Source tensors the peer must expose at minimum.
    pub num_tensors: u64,
    /// Bytes per destination tensor for the contiguous form.
    pub pull_size: u64,
    /// Highest source block index referenced by the runs.
    pub max_block_index: u64,
    /// Number of source tensors addressed.
    pub src_tensor_indices_size: u64,
    /// First source tensor addressed.
    pub src_tensor_start_index: u64,
    /// Destination block stride; 0 for the contiguous form.
    pub block_size: u64,
}

/// One slot of the request's variable section.
///
/// The first `dst_addr_count` entries carry destination addresses; the
/// next `buffer_info_count` entries carry source run descriptors and the
/// final `buffer_info_count` entries destination run descriptors.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct TransferInfo {
    word0: u64,
    word1: u64,
}

impl TransferInfo {
    /// Destination-address entry.
    pub fn dst(addr: MemAddr) -> Self {
        Self { word0: addr, word1: 0 }
    }

    /// Run-descriptor entry.
    pub fn run(buffer_len: u64, block_start_index: u64) -> Self {
        Self { word0: buffer_len, word1: block_start_index }
    }

    /// Destination address of an address entry.
    pub fn dst_addr(&self) -> MemAddr {
        self.word0
    }

    /// Length of a run entry.
    pub fn buffer_len(&self) -> u64 {
        self.word0
    }

    /// Starting block of a run entry.
    pub fn block_start_index(&self) -> u64 {
        self.word1
    }
}

/// Leading word of the response slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct ResponseInfo {
    /// Stable numeric status code; 0 is success.
    pub ret_code: i32,
    _pad: i32,
}

impl ResponseInfo {
    /// Response carrying the given code.
    pub fn with_code(ret_code: i32) -> Self {
        Self { ret_code, _pad: 0 }
    }
}

const HEADER_SIZE: usize = std::mem::size_of::<TransferCacheReq>();
const INFO_SIZE: usize = std::mem::size_of::<TransferInfo>();

/// Full request: header plus variable section.
#[derive(Debug, Clone, Default)]
pub struct TransferCacheRequest {
    /// Fixed header.
    pub header: TransferCacheReq,
    /// `dst_addr_count + 2 * buffer_info_count` entries.
    pub infos: Vec<TransferInfo>,
}

impl TransferCacheRequest {
    /// Serialized size in bytes.
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + INFO_SIZE * self.infos.len()
    }

    /// Serialize, enforcing the slot budget (slot minus flag).
    pub fn serialize(&self) -> KvResult<Vec<u8>> {
        let expected = (self.header.dst_addr_count + 2 * self.header.buffer_info_count) as usize;
        if self.infos.len() != expected {
            return Err(KvError::ParamInvalid(format!(
                "request carries {} infos, header promises {}",
                self.infos.len(),
                expected
            )));
        }
        let size = self.wire_size();
        if size > REQ_SLOT_SIZE - FLAG_SIZE {
            return Err(KvError::ParamInvalid(format!(
                "request of {} bytes exceeds the {}-byte slot budget",
                size,
                REQ_SLOT_SIZE - FLAG_SIZE
            )));
        }
        let mut bytes = Vec::with_capacity(size);
        bytes.extend_from_slice(bytemuck::bytes_of(&self.header));
        for info in &self.infos {
            bytes.extend_from_slice(bytemuck::bytes_of(info));
        }
        Ok(bytes)
    }

    /// Parse a request image out of a slot.
    pub fn parse(bytes: &[u8]) -> KvResult<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(KvError::Failed("request slot shorter than the header".to_string()));
        }
        let header: TransferCacheReq = bytemuck::pod_read_unaligned(&bytes[..HEADER_SIZE]);
        let info_count = (header.dst_addr_count + 2 * header.buffer_info_count) as usize;
        let needed = HEADER_SIZE + INFO_SIZE * info_count;
        if bytes.len() < needed {
            return Err(KvError::Failed(format!(
                "request slot holds {} bytes, header needs {}",
                bytes.len(),
                needed
            )));
        }
        let mut infos = Vec::with_capacity(info_count);
        for i in 0..info_count {
            let start = HEADER_SIZE + i * INFO_SIZE;
            infos.push(bytemuck::pod_read_unaligned(&bytes[start..start + INFO_SIZE]));
        }
        Ok(Self { header, infos })
    }

    /// Destination-address entries.
    pub fn dst_addrs(&self) -> &[TransferInfo] {
        &self.infos[..self.header.dst_addr_count as usize]
    }

    /// Source run descriptors.
    pub fn src_runs(&self) -> &[TransferInfo] {
        let start = self.header.dst_addr_count as usize;
        &self.infos[start..start + self.header.buffer_info_count as usize]
    }

    /// Destination run descriptors.
    pub fn dst_runs(&self) -> &[TransferInfo] {
        let start = (self.header.dst_addr_count + self.header.buffer_info_count) as usize;
        &self.infos[start..start + self.header.buffer_info_count as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_is_sixteen_words() {
        assert_eq!(HEADER_SIZE, 16 * 8);
        assert_eq!(INFO_SIZE, 16);
    }

    #[test]
    fn test_serialize_parse_round_trip() {
        let request = TransferCacheRequest {
            header: TransferCacheReq {
                cache_id: 12,
                req_id: 5,
                model_id: 2,
                dst_addr_count: 2,
                buffer_info_count: 1,
                is_pull_block: 1,
                pull_size: 4096,
                block_size: 512,
                ..TransferCacheReq::default()
            },
            infos: vec![
                TransferInfo::dst(0xA000),
                TransferInfo::dst(0xB000),
                TransferInfo::run(1024, 3),
                TransferInfo::run(1024, 7),
            ],
        };
        let bytes = request.serialize().unwrap();
        let parsed = TransferCacheRequest::parse(&bytes).unwrap();
        assert_eq!(parsed.header.cache_id, 12);
        assert_eq!(parsed.dst_addrs()[1].dst_addr(), 0xB000);
        assert_eq!(parsed.src_runs()[0].block_start_index(), 3);
        assert_eq!(parsed.dst_runs()[0].block_start_index(), 7);
    }

    #[test]
    fn test_slot_budget_enforced() {
        let count = (REQ_SLOT_SIZE / INFO_SIZE) as u64;
        let request = TransferCacheRequest {
            header: TransferCacheReq { dst_addr_count: count, ..TransferCacheReq::default() },
            infos: vec![TransferInfo::default(); count as usize],
        };
        assert!(matches!(request.serialize(), Err(KvError::ParamInvalid(_))));
    }

    #[test]
    fn test_info_count_mismatch_rejected() {
        let request = TransferCacheRequest {
            header: TransferCacheReq { dst_addr_count: 3, ..TransferCacheReq::default() },
            infos: vec![TransferInfo::dst(0x1)],
        };
        assert!(request.serialize().is_err());
    }

    #[test]
    fn test_truncated_parse_rejected() {
        let request = TransferCacheRequest {
            header: TransferCacheReq { dst_addr_count: 1, ..TransferCacheReq::default() },
            infos: vec![TransferInfo::dst(0x1)],
        };
        let bytes = request.serialize().unwrap();
        assert!(TransferCacheRequest::parse(&bytes[..bytes.len() - 1]).is_err());
    }
}
