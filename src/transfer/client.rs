//! Slot-protocol request and serve paths.
//!
//! Each linked entity owns four registered regions: a request slot and a
//! response slot the peer writes into, and send-side staging images for
//! the two outgoing directions. A request is one PUT of the serialized
//! image followed by one PUT of the slot flag; the requester then spins
//! on its own response flag until the peer commits the whole transfer.

use crate::cache::{CacheKey, CacheManager};
use crate::error::{code, KvError, KvResult};
use crate::fabric::{copy_local, CommHandle, Fabric};
use crate::memory::{MemAddr, MemRegistry};
use crate::mempool::{PinnedRegion, ScalableMemPool, SharedBlock};
use crate::transfer::wire::{
    ResponseInfo, TransferCacheRequest, FLAG_SIZE, REQ_SLOT_SIZE, RESP_SLOT_SIZE,
};
use crate::transfer::{expand_request, NEED_USE_BUFFER_THRESH};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Poll period of the response-flag spin and the request server.
const FLAG_POLL_PERIOD: Duration = Duration::from_micros(50);

fn flag_offset(slot_size: usize) -> u64 {
    (slot_size - FLAG_SIZE) as u64
}

fn read_flag(addr: MemAddr) -> u64 {
    // Peers write the flag through one-sided PUTs; a plain load could be
    // cached past the update.
    unsafe { (addr as *const u64).read_volatile() }
}

fn write_flag(addr: MemAddr, value: u64) {
    unsafe { (addr as *mut u64).write_volatile(value) }
}

/// The four registered regions backing one entity's slot protocol.
pub struct EntitySlots {
    /// Peer-writable request slot.
    pub req_recv: PinnedRegion,
    /// Peer-writable response slot.
    pub resp_recv: PinnedRegion,
    /// Outgoing request image.
    pub req_send: PinnedRegion,
    /// Outgoing response image.
    pub resp_send: PinnedRegion,
}

impl EntitySlots {
    /// Allocate all four regions, flags cleared.
    pub fn new() -> Self {
        Self {
            req_recv: PinnedRegion::allocate(REQ_SLOT_SIZE),
            resp_recv: PinnedRegion::allocate(RESP_SLOT_SIZE),
            req_send: PinnedRegion::allocate(REQ_SLOT_SIZE),
            resp_send: PinnedRegion::allocate(RESP_SLOT_SIZE),
        }
    }
}

impl Default for EntitySlots {
    fn default() -> Self {
        Self::new()
    }
}

/// Peer-side slot addresses learned from the memory-descriptor exchange.
#[derive(Debug, Clone, Copy)]
pub struct RemoteSlots {
    /// Peer's request slot.
    pub req_addr: MemAddr,
    /// Peer's response slot.
    pub resp_addr: MemAddr,
}

/// A destination staged through the local buffer pool.
///
/// The request carries the chunk's address instead of the final
/// destination; once the response lands, [`StagedDst::stage_out`] copies
/// the spans into place.
pub struct StagedDst {
    chunk: SharedBlock,
    final_base: MemAddr,
    spans: Vec<(u64, u64)>,
}

impl StagedDst {
    /// Copy the staged spans into their final destination.
    pub fn stage_out(&self) {
        for &(offset, len) in &self.spans {
            copy_local(self.final_base + offset, self.chunk.addr() + offset, len);
        }
    }
}

/// Decide whether a pull must take the staging path.
pub fn need_buffer_for_pull(
    request: &TransferCacheRequest,
    registry: &MemRegistry,
    host_to_host: bool,
) -> bool {
    if host_to_host {
        return true;
    }
    let header = &request.header;
    if header.block_size == 0 {
        if header.pull_size < NEED_USE_BUFFER_THRESH {
            return true;
        }
        return request.dst_addrs().iter().any(|info| {
            registry
                .find_segment(info.dst_addr(), info.dst_addr() + header.pull_size)
                .is_none()
        });
    }
    for run in request.dst_runs() {
        if run.buffer_len() < NEED_USE_BUFFER_THRESH {
            return true;
        }
    }
    request.dst_addrs().iter().any(|info| {
        request.dst_runs().iter().any(|run| {
            let start = info.dst_addr() + run.block_start_index() * header.block_size;
            registry.find_segment(start, start + run.buffer_len()).is_none()
        })
    })
}

/// Swap every destination address for a registered staging chunk.
///
/// Pool exhaustion blocks until `deadline`; the chunks return to the pool
/// when the returned handles drop.
pub fn stage_request_dsts(
    request: &mut TransferCacheRequest,
    pool: &ScalableMemPool,
    deadline: Instant,
) -> KvResult<Vec<StagedDst>> {
    let header = request.header;
    let mut staged = Vec::with_capacity(header.dst_addr_count as usize);
    let spans: Vec<(u64, u64)> = if header.block_size == 0 {
        vec![(0, header.pull_size)]
    } else {
        request
            .dst_runs()
            .iter()
            .map(|run| (run.block_start_index() * header.block_size, run.buffer_len()))
            .collect()
    };
    let window = spans
        .iter()
        .map(|&(offset, len)| offset + len)
        .max()
        .unwrap_or(0);
    if window == 0 {
        return Ok(staged);
    }
    for index in 0..header.dst_addr_count as usize {
        let timeout = deadline.saturating_duration_since(Instant::now());
        let chunk = pool.alloc_shared_timeout(window as usize, timeout).ok_or_else(|| {
            pool.log_pool_state();
            KvError::ResourceExhausted(format!("no staging chunk of {} bytes within deadline", window))
        })?;
        let final_base = request.infos[index].dst_addr();
        // Seed the chunk with the current destination bytes so spans the
        // peer only partially fills round-trip unchanged at stage-out.
        for &(offset, len) in &spans {
            copy_local(chunk.addr() + offset, final_base + offset, len);
        }
        request.infos[index] = crate::transfer::wire::TransferInfo::dst(chunk.addr());
        staged.push(StagedDst { chunk, final_base, spans: spans.clone() });
    }
    Ok(staged)
}

/// Requester side of the slot protocol.
pub struct DataTransferClient {
    fabric: Arc<dyn Fabric>,
    comm: CommHandle,
    remote: RemoteSlots,
}

impl DataTransferClient {
    /// Client bound to one communicator and its peer's slots.
    pub fn new(fabric: Arc<dyn Fabric>, comm: CommHandle, remote: RemoteSlots) -> Self {
        Self { fabric, comm, remote }
    }

    /// Send a request and wait for the peer's response.
    ///
    /// The response flag is set by the peer only after every data PUT of
    /// the request completed, so a success return means the payload
    /// landed.
    pub async fn send_request(
        &self,
        slots: &EntitySlots,
        request: &TransferCacheRequest,
        timeout: Duration,
    ) -> KvResult<()> {
        let bytes = request.serialize()?;
        let send_base = slots.req_send.base();
        copy_local(send_base, bytes.as_ptr() as MemAddr, bytes.len() as u64);
        write_flag(send_base + flag_offset(REQ_SLOT_SIZE), 1);

        // Clear our response flag before the peer can raise it.
        let resp_flag_addr = slots.resp_recv.base() + flag_offset(RESP_SLOT_SIZE);
        write_flag(resp_flag_addr, 0);

        self.fabric.put(self.comm, send_base, self.remote.req_addr, bytes.len() as u64)?;
        self.fabric.put(
            self.comm,
            send_base + flag_offset(REQ_SLOT_SIZE),
            self.remote.req_addr + flag_offset(REQ_SLOT_SIZE),
            FLAG_SIZE as u64,
        )?;
        self.fabric.sync_stream(self.comm, timeout)?;

        let deadline = Instant::now() + timeout;
        loop {
            if read_flag(resp_flag_addr) == 1 {
                break;
            }
            if Instant::now() >= deadline {
                let _ = self.fabric.abort_stream(self.comm);
                return Err(KvError::Timeout(format!(
                    "peer response did not arrive within {:?}",
                    timeout
                )));
            }
            tokio::time::sleep(FLAG_POLL_PERIOD).await;
        }

        let response: ResponseInfo = {
            let bytes = unsafe {
                std::slice::from_raw_parts(
                    slots.resp_recv.base() as *const u8,
                    std::mem::size_of::<ResponseInfo>(),
                )
            };
            bytemuck::pod_read_unaligned(bytes)
        };
        write_flag(resp_flag_addr, 0);
        if response.ret_code != code::SUCCESS as i32 {
            return Err(KvError::from_code(response.ret_code as u32, "peer reported failure"));
        }
        Ok(())
    }
}

/// Serving side of the slot protocol: executes requests landing in the
/// local request slot against the local cache catalog.
pub struct RequestServer {
    fabric: Arc<dyn Fabric>,
    comm: CommHandle,
    cache_manager: Arc<CacheManager>,
    remote: RemoteSlots,
}

impl RequestServer {
    /// Server bound to one communicator and its peer's slots.
    pub fn new(
        fabric: Arc<dyn Fabric>,
        comm: CommHandle,
        cache_manager: Arc<CacheManager>,
        remote: RemoteSlots,
    ) -> Self {
        Self { fabric, comm, cache_manager, remote }
    }

    /// Process one pending request, if any. Returns true when a request
    /// was served.
    pub fn serve_once(&self, slots: &EntitySlots) -> KvResult<bool> {
        let req_flag_addr = slots.req_recv.base() + flag_offset(REQ_SLOT_SIZE);
        if read_flag(req_flag_addr) != 1 {
            return Ok(false);
        }
        write_flag(req_flag_addr, 0);

        let bytes = unsafe {
            std::slice::from_raw_parts(
                slots.req_recv.base() as *const u8,
                REQ_SLOT_SIZE - FLAG_SIZE,
            )
        };
        let outcome = TransferCacheRequest::parse(bytes).and_then(|request| {
            let timeout = Duration::from_millis(request.header.timeout_in_ms.max(1));
            self.execute(&request, timeout)
        });
        let ret_code = match &outcome {
            Ok(()) => code::SUCCESS as i32,
            Err(err) => {
                log::error!("request execution failed: {}", err);
                err.code() as i32
            }
        };
        self.respond(slots, ret_code)?;
        outcome.map(|_| true)
    }

    fn execute(&self, request: &TransferCacheRequest, timeout: Duration) -> KvResult<()> {
        let header = &request.header;
        let (entry, src_batch_index) = if header.cache_id > 0 {
            let entry = self.cache_manager.get_entry(header.cache_id).ok_or_else(|| {
                KvError::CacheNotExist(format!("cache {}", header.cache_id))
            })?;
            (entry, 0)
        } else {
            let key = if header.prefix_id != 0 {
                CacheKey::for_prefix(header.prefix_id, header.model_id)
            } else {
                CacheKey::for_request(header.req_id, header.model_id)
            };
            let key_ref = self
                .cache_manager
                .find_by_key(&key)
                .ok_or_else(|| KvError::CacheNotExist(format!("cache key {:?}", key)))?;
            let entry = self.cache_manager.get_entry(key_ref.cache_id).ok_or_else(|| {
                KvError::CacheNotExist(format!("cache {}", key_ref.cache_id))
            })?;
            (entry, key_ref.batch_index)
        };

        let ops = expand_request(request, &entry, src_batch_index)?;
        for op in &ops {
            self.fabric.put(self.comm, op.src_addr, op.dst_addr, op.len)?;
        }
        self.fabric.sync_stream(self.comm, timeout)?;
        log::debug!("served pull of {} ops from cache {}", ops.len(), entry.cache_id);
        Ok(())
    }

    fn respond(&self, slots: &EntitySlots, ret_code: i32) -> KvResult<()> {
        let response = ResponseInfo::with_code(ret_code);
        let send_base = slots.resp_send.base();
        let bytes = bytemuck::bytes_of(&response);
        copy_local(send_base, bytes.as_ptr() as MemAddr, bytes.len() as u64);
        write_flag(send_base + flag_offset(RESP_SLOT_SIZE), 1);

        self.fabric.put(self.comm, send_base, self.remote.resp_addr, bytes.len() as u64)?;
        self.fabric.put(
            self.comm,
            send_base + flag_offset(RESP_SLOT_SIZE),
            self.remote.resp_addr + flag_offset(RESP_SLOT_SIZE),
            FLAG_SIZE as u64,
        )?;
        self.fabric.sync_stream(self.comm, Duration::from_secs(1))?;
        Ok(())
    }
}

/// Poll period exported for the entity's serve loop.
pub fn serve_poll_period() -> Duration {
    FLAG_POLL_PERIOD
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheDesc, CacheMemType, CachePlacement, DataType};
    use crate::fabric::loopback::{LoopbackFabric, LoopbackHub};
    use crate::fabric::CommDesc;
    use crate::memory::MemKind;
    use crate::transfer::{plan_pull_request, PullCacheParam};

    struct Endpoint {
        fabric: Arc<LoopbackFabric>,
        comm: CommHandle,
        slots: EntitySlots,
        region: PinnedRegion,
        pool: ScalableMemPool,
        cache_manager: Arc<CacheManager>,
    }

    fn register_slots(fabric: &LoopbackFabric, slots: &EntitySlots) {
        use crate::fabric::Fabric as _;
        fabric
            .register_mem(slots.req_recv.base(), REQ_SLOT_SIZE as u64, MemKind::Device)
            .unwrap();
        fabric
            .register_mem(slots.resp_recv.base(), RESP_SLOT_SIZE as u64, MemKind::Device)
            .unwrap();
        fabric
            .register_mem(slots.req_send.base(), REQ_SLOT_SIZE as u64, MemKind::Device)
            .unwrap();
        fabric
            .register_mem(slots.resp_send.base(), RESP_SLOT_SIZE as u64, MemKind::Device)
            .unwrap();
    }

    fn endpoint(hub: &Arc<LoopbackHub>, name: &str, peer: &str) -> Endpoint {
        use crate::fabric::Fabric as _;
        let fabric = Arc::new(LoopbackFabric::with_hub(hub.clone(), name));
        let desc = CommDesc {
            endpoint: name.to_string(),
            device_id: 0,
            rdma_traffic_class: None,
            rdma_service_level: None,
        };
        let peer_name = peer.to_string();
        let fabric2 = fabric.clone();
        let handle = std::thread::spawn(move || {
            fabric2.create_communicator(&desc, &peer_name, Duration::from_secs(2)).unwrap()
        });
        let comm = handle.join().unwrap();

        let slots = EntitySlots::new();
        register_slots(&fabric, &slots);
        let region = PinnedRegion::allocate(256 << 10);
        let pool = ScalableMemPool::initialize(region.base(), region.len(), 10).unwrap();
        fabric
            .register_mem(region.base(), region.len() as u64, MemKind::Device)
            .unwrap();
        let cache_manager = CacheManager::new(Some(pool.clone()), None);
        Endpoint { fabric, comm, slots, region, pool, cache_manager }
    }

    fn make_pair(hub: &Arc<LoopbackHub>) -> (Endpoint, Endpoint) {
        let hub_a = hub.clone();
        let handle = std::thread::spawn(move || endpoint(&hub_a, "a", "b"));
        let b = endpoint(hub, "b", "a");
        (handle.join().unwrap(), b)
    }

    fn device_desc(shape: Vec<u64>) -> CacheDesc {
        CacheDesc {
            num_tensors: 1,
            data_type: DataType::Int32,
            shape,
            placement: CachePlacement::Device,
            cache_mem_type: CacheMemType::Contiguous,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_request_round_trip() {
        let hub = LoopbackHub::new();
        let (puller, server) = make_pair(&hub);

        // Source cache on the serving side, bound to a key at batch 0.
        let src_key = CacheKey::for_request(42, 1);
        let src = server
            .cache_manager
            .allocate(&device_desc(vec![4, 128]), &[src_key], false)
            .unwrap();
        let payload: Vec<u8> = (0..512u32).flat_map(|v| v.to_ne_bytes()).collect();
        copy_local(src.tensor_addrs[0], payload.as_ptr() as MemAddr, payload.len() as u64);

        // Destination cache on the pulling side.
        let dst = puller
            .cache_manager
            .allocate(&device_desc(vec![4, 128]), &[], false)
            .unwrap();

        let param = PullCacheParam { req_id: 42, model_id: 1, batch_index: 1, ..PullCacheParam::default() };
        let dst_entry = puller.cache_manager.get_entry(dst.cache_id).unwrap();
        let request = plan_pull_request(&dst_entry, &param, 1000).unwrap();

        // Each side sees the peer's receive slots.
        let client = DataTransferClient::new(
            puller.fabric.clone(),
            puller.comm,
            RemoteSlots {
                req_addr: server.slots.req_recv.base(),
                resp_addr: server.slots.resp_recv.base(),
            },
        );
        let request_server = RequestServer::new(
            server.fabric.clone(),
            server.comm,
            server.cache_manager.clone(),
            RemoteSlots {
                req_addr: puller.slots.req_recv.base(),
                resp_addr: puller.slots.resp_recv.base(),
            },
        );

        let server_slots = server.slots;
        let serve = tokio::task::spawn_blocking(move || {
            let deadline = Instant::now() + Duration::from_secs(2);
            loop {
                match request_server.serve_once(&server_slots) {
                    Ok(true) => break,
                    Ok(false) if Instant::now() < deadline => {
                        std::thread::sleep(Duration::from_micros(50))
                    }
                    Ok(false) => panic!("no request arrived"),
                    Err(err) => panic!("serve failed: {}", err),
                }
            }
        });

        client
            .send_request(&puller.slots, &request, Duration::from_secs(2))
            .await
            .unwrap();
        serve.await.unwrap();

        // Destination row 1 now equals source row 0.
        let mut out = vec![0u8; 512];
        copy_local(out.as_mut_ptr() as MemAddr, dst.tensor_addrs[0] + 512, 512);
        assert_eq!(out, payload[..512]);
        let _ = (puller.region, server.region, puller.pool, server.pool);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_cache_reports_not_exist() {
        let hub = LoopbackHub::new();
        let (puller, server) = make_pair(&hub);

        let dst = puller
            .cache_manager
            .allocate(&device_desc(vec![2, 64]), &[], false)
            .unwrap();
        let dst_entry = puller.cache_manager.get_entry(dst.cache_id).unwrap();
        let param = PullCacheParam { req_id: 999, model_id: 1, ..PullCacheParam::default() };
        let request = plan_pull_request(&dst_entry, &param, 500).unwrap();

        let client = DataTransferClient::new(
            puller.fabric.clone(),
            puller.comm,
            RemoteSlots {
                req_addr: server.slots.req_recv.base(),
                resp_addr: server.slots.resp_recv.base(),
            },
        );
        let request_server = RequestServer::new(
            server.fabric.clone(),
            server.comm,
            server.cache_manager.clone(),
            RemoteSlots {
                req_addr: puller.slots.req_recv.base(),
                resp_addr: puller.slots.resp_recv.base(),
            },
        );
        let server_slots = server.slots;
        let serve = tokio::task::spawn_blocking(move || {
            let deadline = Instant::now() + Duration::from_secs(2);
            while Instant::now() < deadline {
                match request_server.serve_once(&server_slots) {
                    Ok(false) => std::thread::sleep(Duration::from_micros(50)),
                    _ => break,
                }
            }
        });

        let err = client
            .send_request(&puller.slots, &request, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::CacheNotExist(_)));
        serve.await.unwrap();
    }

    #[test]
    fn test_need_buffer_threshold() {
        let registry = MemRegistry::new();
        let backing = PinnedRegion::allocate(1 << 20);
        registry
            .register_mem(backing.base(), backing.len() as u64, MemKind::Device)
            .unwrap();

        let small = TransferCacheRequest {
            header: crate::transfer::wire::TransferCacheReq {
                dst_addr_count: 1,
                buffer_info_count: 1,
                pull_size: 1024,
                ..Default::default()
            },
            infos: vec![
                crate::transfer::wire::TransferInfo::dst(backing.base()),
                crate::transfer::wire::TransferInfo::run(1024, 0),
                crate::transfer::wire::TransferInfo::run(1024, 0),
            ],
        };
        assert!(need_buffer_for_pull(&small, &registry, false));

        let large = TransferCacheRequest {
            header: crate::transfer::wire::TransferCacheReq {
                dst_addr_count: 1,
                buffer_info_count: 1,
                pull_size: 512 * 1024,
                ..Default::default()
            },
            infos: vec![
                crate::transfer::wire::TransferInfo::dst(backing.base()),
                crate::transfer::wire::TransferInfo::run(512 * 1024, 0),
                crate::transfer::wire::TransferInfo::run(512 * 1024, 0),
            ],
        };
        assert!(!need_buffer_for_pull(&large, &registry, false));
        assert!(need_buffer_for_pull(&large, &registry, true));

        // Unregistered destination forces staging.
        let unregistered = PinnedRegion::allocate(1 << 20);
        let mut outside = large.clone();
        outside.infos[0] = crate::transfer::wire::TransferInfo::dst(unregistered.base());
        assert!(need_buffer_for_pull(&outside, &registry, false));
    }

    #[test]
    fn test_stage_request_dsts_substitutes_chunks() {
        let region = PinnedRegion::allocate(256 << 10);
        let pool = ScalableMemPool::initialize(region.base(), region.len(), 10).unwrap();
        let final_a = vec![0x11u8; 4096];
        let final_b = vec![0x22u8; 4096];
        let mut request = TransferCacheRequest {
            header: crate::transfer::wire::TransferCacheReq {
                dst_addr_count: 2,
                buffer_info_count: 1,
                pull_size: 4096,
                ..Default::default()
            },
            infos: vec![
                crate::transfer::wire::TransferInfo::dst(final_a.as_ptr() as MemAddr),
                crate::transfer::wire::TransferInfo::dst(final_b.as_ptr() as MemAddr),
                crate::transfer::wire::TransferInfo::run(4096, 0),
                crate::transfer::wire::TransferInfo::run(4096, 0),
            ],
        };
        let staged = stage_request_dsts(
            &mut request,
            &pool,
            Instant::now() + Duration::from_millis(100),
        )
        .unwrap();
        assert_eq!(staged.len(), 2);
        assert_ne!(request.dst_addrs()[0].dst_addr(), final_a.as_ptr() as MemAddr);
        assert_eq!(staged[0].final_base, final_a.as_ptr() as MemAddr);
        assert_eq!(staged[0].spans, vec![(0, 4096)]);
        // Chunks are seeded with the destination's current bytes.
        let mut seeded = vec![0u8; 16];
        copy_local(seeded.as_mut_ptr() as MemAddr, staged[0].chunk.addr(), 16);
        assert_eq!(seeded, vec![0x11u8; 16]);
    }
}
