//! Staging-buffer transfer service.
//!
//! Unregistered or sub-threshold transfers cannot ride one-sided ops
//! end to end; they stage through pinned pools instead. Two pools double
//! buffer the rounds: stage local bytes in, move pool-to-pool with one
//! one-sided op per piece, stage bytes out on the far side. The far side
//! is driven by lightweight coordination frames on the control channel.

use crate::channel::protocol::ControlMessage;
use crate::channel::{Channel, MessageHandler};
use crate::config::BufferPoolConfig;
use crate::error::{code, KvError, KvResult};
use crate::fabric::{copy_local, CommHandle, Fabric};
use crate::memory::{MemAddr, MemKind};
use crate::mempool::{PinnedRegion, ScalableMemPool, SharedBlock};
use crate::transfer::TransferOpDesc;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use std::time::{Duration, Instant};

/// Registry key of the coordination frames.
pub const BUFFER_TRANSFER_MSG_TYPE: i32 = 8;
/// Number of staging pools; two pools double buffer.
pub const NUM_POOLS: usize = 2;

/// Direction of a generic transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferOp {
    /// Remote to local.
    Read,
    /// Local to remote.
    Write,
}

/// Placement pair of a buffered transfer; all ops in one buffered call
/// must share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    /// Read, remote host to local host.
    ReadRH2H,
    /// Read, remote device to local host.
    ReadRD2H,
    /// Read, remote host to local device.
    ReadRH2D,
    /// Read, remote device to local device.
    ReadRD2D,
    /// Write, local host to remote host.
    WriteH2RH,
    /// Write, local host to remote device.
    WriteH2RD,
    /// Write, local device to remote host.
    WriteD2RH,
    /// Write, local device to remote device.
    WriteD2RD,
}

/// Classify one op; unregistered endpoints count as host.
pub fn classify(
    op: TransferOp,
    local_kind: Option<MemKind>,
    remote_kind: Option<MemKind>,
) -> TransferType {
    let local = local_kind.unwrap_or(MemKind::Host);
    let remote = remote_kind.unwrap_or(MemKind::Host);
    match (op, local, remote) {
        (TransferOp::Read, MemKind::Host, MemKind::Host) => TransferType::ReadRH2H,
        (TransferOp::Read, MemKind::Host, MemKind::Device) => TransferType::ReadRD2H,
        (TransferOp::Read, MemKind::Device, MemKind::Host) => TransferType::ReadRH2D,
        (TransferOp::Read, MemKind::Device, MemKind::Device) => TransferType::ReadRD2D,
        (TransferOp::Write, MemKind::Host, MemKind::Host) => TransferType::WriteH2RH,
        (TransferOp::Write, MemKind::Host, MemKind::Device) => TransferType::WriteH2RD,
        (TransferOp::Write, MemKind::Device, MemKind::Host) => TransferType::WriteD2RH,
        (TransferOp::Write, MemKind::Device, MemKind::Device) => TransferType::WriteD2RD,
    }
}

/// Coordination frame payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BufferMsg {
    req_id: u64,
    phase: BufferPhase,
    #[serde(default)]
    op: Option<TransferOp>,
    /// Piece lengths and their peer-side final (write) or source (read)
    /// addresses.
    #[serde(default)]
    pieces: Vec<PieceDesc>,
    #[serde(default)]
    chunk_addrs: Vec<MemAddr>,
    #[serde(default)]
    error_code: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum BufferPhase {
    Request,
    Chunks,
    Commit,
    Complete,
    Release,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct PieceDesc {
    len: u64,
    addr: MemAddr,
}

/// One piece of a split op on the initiator.
struct Piece {
    local_addr: MemAddr,
    remote_addr: MemAddr,
    len: u64,
}

struct InflightRound {
    chunks: Vec<SharedBlock>,
    pieces: Vec<PieceDesc>,
}

/// Bounded staging pools plus both roles of the coordination protocol.
pub struct BufferTransferService {
    config: BufferPoolConfig,
    regions: Vec<PinnedRegion>,
    pools: Vec<ScalableMemPool>,
    pool_toggle: AtomicUsize,
    next_req_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<BufferMsg>>>,
    inflight: Mutex<HashMap<(String, u64), InflightRound>>,
}

impl BufferTransferService {
    /// Build the pools; `None` when the configuration disables staging.
    pub fn new(config: BufferPoolConfig) -> KvResult<Option<Arc<Self>>> {
        if config.is_disabled() {
            log::info!("staging buffer pool disabled by configuration");
            return Ok(None);
        }
        let pool_bytes = config.buffer_num * config.buffer_size_bytes();
        let mut regions = Vec::with_capacity(NUM_POOLS);
        let mut pools = Vec::with_capacity(NUM_POOLS);
        for _ in 0..NUM_POOLS {
            let region = PinnedRegion::allocate(pool_bytes);
            // One page per staging buffer keeps chunk allocation exact.
            let page_shift = (config.buffer_size_bytes() as u64).trailing_zeros() as usize;
            let pool = ScalableMemPool::initialize(region.base(), pool_bytes, page_shift)?;
            regions.push(region);
            pools.push(pool);
        }
        log::info!(
            "staging pools ready: {} x {} buffers x {} MiB",
            NUM_POOLS,
            config.buffer_num,
            config.buffer_size_mib
        );
        Ok(Some(Arc::new(Self {
            config,
            regions,
            pools,
            pool_toggle: AtomicUsize::new(0),
            next_req_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        })))
    }

    /// Staging regions, for fabric registration by the owning engine.
    pub fn regions(&self) -> impl Iterator<Item = (MemAddr, u64)> + '_ {
        self.regions.iter().map(|region| (region.base(), region.len() as u64))
    }

    fn chunk_size(&self) -> u64 {
        self.config.buffer_size_bytes() as u64
    }

    fn next_pool(&self) -> &ScalableMemPool {
        let index = self.pool_toggle.fetch_add(1, Ordering::SeqCst) % NUM_POOLS;
        &self.pools[index]
    }

    fn split_ops(&self, ops: &[TransferOpDesc]) -> Vec<Piece> {
        let chunk = self.chunk_size();
        let mut pieces = Vec::new();
        for op in ops {
            let mut offset = 0;
            while offset < op.len {
                let len = (op.len - offset).min(chunk);
                pieces.push(Piece {
                    local_addr: op.local_addr + offset,
                    remote_addr: op.remote_addr + offset,
                    len,
                });
                offset += len;
            }
        }
        pieces
    }

    async fn send_and_wait(
        &self,
        channel: &Arc<Channel>,
        message: BufferMsg,
        deadline: Instant,
    ) -> KvResult<BufferMsg> {
        let req_id = message.req_id;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(req_id, tx);
        let frame = ControlMessage::App {
            msg_type: BUFFER_TRANSFER_MSG_TYPE,
            payload: serde_json::to_value(&message)?,
        };
        if let Err(err) = channel.send(&frame).await {
            self.pending.lock().remove(&req_id);
            return Err(err);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, rx).await {
            Ok(Ok(reply)) => {
                if reply.error_code != code::SUCCESS {
                    return Err(KvError::from_code(reply.error_code, "buffered transfer peer failure"));
                }
                Ok(reply)
            }
            _ => {
                self.pending.lock().remove(&req_id);
                Err(KvError::Timeout("buffered transfer coordination timed out".to_string()))
            }
        }
    }

    async fn send_oneway(&self, channel: &Arc<Channel>, message: BufferMsg) -> KvResult<()> {
        let frame = ControlMessage::App {
            msg_type: BUFFER_TRANSFER_MSG_TYPE,
            payload: serde_json::to_value(&message)?,
        };
        channel.send(&frame).await
    }

    /// Run a buffered transfer; all ops must share one [`TransferType`].
    pub async fn transfer(
        &self,
        channel: &Arc<Channel>,
        fabric: &Arc<dyn Fabric>,
        comm: CommHandle,
        op: TransferOp,
        ops: &[TransferOpDesc],
        timeout: Duration,
    ) -> KvResult<()> {
        let deadline = Instant::now() + timeout;
        let pieces = self.split_ops(ops);
        let round_size = self.config.buffer_num;
        for round in pieces.chunks(round_size) {
            match op {
                TransferOp::Write => self.write_round(channel, fabric, comm, round, deadline).await?,
                TransferOp::Read => self.read_round(channel, fabric, comm, round, deadline).await?,
            }
        }
        Ok(())
    }

    async fn write_round(
        &self,
        channel: &Arc<Channel>,
        fabric: &Arc<dyn Fabric>,
        comm: CommHandle,
        round: &[Piece],
        deadline: Instant,
    ) -> KvResult<()> {
        let pool = self.next_pool();
        let mut chunks = Vec::with_capacity(round.len());
        for piece in round {
            let timeout = deadline.saturating_duration_since(Instant::now());
            let chunk = pool.alloc_shared_timeout(piece.len as usize, timeout).ok_or_else(|| {
                pool.log_pool_state();
                KvError::Timeout("staging pool exhausted past the deadline".to_string())
            })?;
            copy_local(chunk.addr(), piece.local_addr, piece.len);
            chunks.push(chunk);
        }

        let req_id = self.next_req_id.fetch_add(1, Ordering::SeqCst);
        let request = BufferMsg {
            req_id,
            phase: BufferPhase::Request,
            op: Some(TransferOp::Write),
            pieces: round.iter().map(|p| PieceDesc { len: p.len, addr: p.remote_addr }).collect(),
            chunk_addrs: Vec::new(),
            error_code: 0,
        };
        let reply = self.send_and_wait(channel, request, deadline).await?;
        if reply.chunk_addrs.len() != round.len() {
            return Err(KvError::Failed(format!(
                "peer returned {} staging chunks for {} pieces",
                reply.chunk_addrs.len(),
                round.len()
            )));
        }
        let moved = (|| -> KvResult<()> {
            for (chunk, remote_chunk) in chunks.iter().zip(reply.chunk_addrs.iter()) {
                fabric.put(comm, chunk.addr(), *remote_chunk, chunk.len() as u64)?;
            }
            fabric.sync_stream(comm, deadline.saturating_duration_since(Instant::now()))
        })();
        if let Err(err) = moved {
            // Let the peer reclaim the round it staged for us.
            let release = BufferMsg {
                req_id,
                phase: BufferPhase::Release,
                op: Some(TransferOp::Write),
                pieces: Vec::new(),
                chunk_addrs: Vec::new(),
                error_code: 0,
            };
            let _ = self.send_oneway(channel, release).await;
            return Err(err);
        }

        let commit = BufferMsg {
            req_id,
            phase: BufferPhase::Commit,
            op: Some(TransferOp::Write),
            pieces: Vec::new(),
            chunk_addrs: Vec::new(),
            error_code: 0,
        };
        self.send_and_wait(channel, commit, deadline).await?;
        Ok(())
    }

    async fn read_round(
        &self,
        channel: &Arc<Channel>,
        fabric: &Arc<dyn Fabric>,
        comm: CommHandle,
        round: &[Piece],
        deadline: Instant,
    ) -> KvResult<()> {
        let req_id = self.next_req_id.fetch_add(1, Ordering::SeqCst);
        let request = BufferMsg {
            req_id,
            phase: BufferPhase::Request,
            op: Some(TransferOp::Read),
            pieces: round.iter().map(|p| PieceDesc { len: p.len, addr: p.remote_addr }).collect(),
            chunk_addrs: Vec::new(),
            error_code: 0,
        };
        let reply = self.send_and_wait(channel, request, deadline).await?;
        if reply.chunk_addrs.len() != round.len() {
            return Err(KvError::Failed(format!(
                "peer returned {} staging chunks for {} pieces",
                reply.chunk_addrs.len(),
                round.len()
            )));
        }

        let pool = self.next_pool();
        let result = (|| -> KvResult<()> {
            let mut local_chunks = Vec::with_capacity(round.len());
            for piece in round {
                let timeout = deadline.saturating_duration_since(Instant::now());
                let chunk = pool.alloc_shared_timeout(piece.len as usize, timeout).ok_or_else(|| {
                    pool.log_pool_state();
                    KvError::Timeout("staging pool exhausted past the deadline".to_string())
                })?;
                local_chunks.push(chunk);
            }
            for ((piece, chunk), remote_chunk) in
                round.iter().zip(local_chunks.iter()).zip(reply.chunk_addrs.iter())
            {
                fabric.get(comm, chunk.addr(), *remote_chunk, piece.len)?;
            }
            fabric.sync_stream(comm, deadline.saturating_duration_since(Instant::now()))?;
            for (piece, chunk) in round.iter().zip(local_chunks.iter()) {
                copy_local(piece.local_addr, chunk.addr(), piece.len);
            }
            Ok(())
        })();

        // Always let the peer reclaim its chunks.
        let release = BufferMsg {
            req_id,
            phase: BufferPhase::Release,
            op: Some(TransferOp::Read),
            pieces: Vec::new(),
            chunk_addrs: Vec::new(),
            error_code: 0,
        };
        self.send_oneway(channel, release).await?;
        result
    }

    /// Peer role: allocate chunks for an incoming round.
    async fn handle_request(&self, channel: Arc<Channel>, message: BufferMsg) -> KvResult<()> {
        let pool = self.next_pool();
        let mut chunks = Vec::with_capacity(message.pieces.len());
        let mut failed = 0u32;
        for piece in &message.pieces {
            match pool.alloc_shared_timeout(piece.len as usize, Duration::from_millis(100)) {
                Some(chunk) => chunks.push(chunk),
                None => {
                    pool.log_pool_state();
                    failed = code::RESOURCE_EXHAUSTED;
                    break;
                }
            }
        }
        if failed != 0 {
            let reply = BufferMsg {
                req_id: message.req_id,
                phase: BufferPhase::Chunks,
                op: message.op,
                pieces: Vec::new(),
                chunk_addrs: Vec::new(),
                error_code: failed,
            };
            return self.send_oneway(&channel, reply).await;
        }

        // Reads stage the source bytes in before the initiator GETs them.
        if message.op == Some(TransferOp::Read) {
            for (piece, chunk) in message.pieces.iter().zip(chunks.iter()) {
                copy_local(chunk.addr(), piece.addr, piece.len);
            }
        }

        let chunk_addrs: Vec<MemAddr> = chunks.iter().map(|chunk| chunk.addr()).collect();
        self.inflight.lock().insert(
            (channel.id().to_string(), message.req_id),
            InflightRound { chunks, pieces: message.pieces.clone() },
        );
        let reply = BufferMsg {
            req_id: message.req_id,
            phase: BufferPhase::Chunks,
            op: message.op,
            pieces: Vec::new(),
            chunk_addrs,
            error_code: 0,
        };
        self.send_oneway(&channel, reply).await
    }

    /// Peer role: a write round landed; stage the bytes out.
    async fn handle_commit(&self, channel: Arc<Channel>, message: BufferMsg) -> KvResult<()> {
        let round = self.inflight.lock().remove(&(channel.id().to_string(), message.req_id));
        let error_code = match round {
            Some(round) => {
                for (piece, chunk) in round.pieces.iter().zip(round.chunks.iter()) {
                    copy_local(piece.addr, chunk.addr(), piece.len);
                }
                code::SUCCESS
            }
            None => {
                log::warn!("commit for unknown buffered round {}", message.req_id);
                code::FAILED
            }
        };
        let reply = BufferMsg {
            req_id: message.req_id,
            phase: BufferPhase::Complete,
            op: message.op,
            pieces: Vec::new(),
            chunk_addrs: Vec::new(),
            error_code,
        };
        self.send_oneway(&channel, reply).await
    }

    fn complete_pending(&self, message: BufferMsg) {
        if let Some(sender) = self.pending.lock().remove(&message.req_id) {
            let _ = sender.send(message);
        } else {
            log::warn!("unmatched buffered-transfer reply, req_id={}", message.req_id);
        }
    }
}

#[async_trait]
impl MessageHandler for BufferTransferService {
    async fn handle(&self, channel: Arc<Channel>, message: ControlMessage) -> KvResult<()> {
        let payload = match message {
            ControlMessage::App { payload, .. } => payload,
            other => {
                return Err(KvError::Failed(format!(
                    "buffered-transfer handler got message type {}",
                    other.msg_type()
                )))
            }
        };
        let message: BufferMsg = serde_json::from_value(payload)?;
        match message.phase {
            BufferPhase::Request => self.handle_request(channel, message).await,
            BufferPhase::Commit => self.handle_commit(channel, message).await,
            BufferPhase::Release => {
                self.inflight.lock().remove(&(channel.id().to_string(), message.req_id));
                Ok(())
            }
            BufferPhase::Chunks | BufferPhase::Complete => {
                self.complete_pending(message);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_matrix() {
        assert_eq!(
            classify(TransferOp::Read, Some(MemKind::Host), Some(MemKind::Host)),
            TransferType::ReadRH2H
        );
        assert_eq!(
            classify(TransferOp::Read, Some(MemKind::Device), Some(MemKind::Device)),
            TransferType::ReadRD2D
        );
        assert_eq!(
            classify(TransferOp::Write, Some(MemKind::Device), Some(MemKind::Host)),
            TransferType::WriteD2RH
        );
        // Unregistered endpoints default to host.
        assert_eq!(classify(TransferOp::Write, None, None), TransferType::WriteH2RH);
    }

    #[test]
    fn test_disabled_pool_yields_none() {
        let config = BufferPoolConfig { buffer_num: 0, buffer_size_mib: 0 };
        assert!(BufferTransferService::new(config).unwrap().is_none());
    }

    #[test]
    fn test_split_ops_chunking() {
        let config = BufferPoolConfig { buffer_num: 2, buffer_size_mib: 1 };
        let service = BufferTransferService::new(config).unwrap().unwrap();
        let ops = [TransferOpDesc { local_addr: 0x1000, remote_addr: 0x9000, len: 2 * 1024 * 1024 + 7 }];
        let pieces = service.split_ops(&ops);
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0].len, 1024 * 1024);
        assert_eq!(pieces[2].len, 7);
        assert_eq!(pieces[2].local_addr, 0x1000 + 2 * 1024 * 1024);
        assert_eq!(pieces[2].remote_addr, 0x9000 + 2 * 1024 * 1024);
    }

    #[test]
    fn test_pool_alternation() {
        let config = BufferPoolConfig { buffer_num: 2, buffer_size_mib: 1 };
        let service = BufferTransferService::new(config).unwrap().unwrap();
        let first = service.next_pool() as *const ScalableMemPool;
        let second = service.next_pool() as *const ScalableMemPool;
        let third = service.next_pool() as *const ScalableMemPool;
        assert_ne!(first, second);
        assert_eq!(first, third);
    }
}
