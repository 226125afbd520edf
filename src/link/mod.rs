//! # Link Management
//!
//! One [`CommEntity`] per linked remote cluster: it owns the communicator,
//! the request/response slots shared with exactly one peer entity, the
//! mirror of the peer's cache catalog, and the serving task that executes
//! requests landing in the local request slot.
//!
//! Link and unlink are serialised process-wide; transfers take the
//! entity's pull mutex so destruction can drain them.

use crate::cache::access_table::{CacheAccessTable, CacheAccessTableUpdater, SharedDevBuffer};
use crate::cache::{CacheEntry, CacheManager, CachePlacement};
use crate::error::{KvError, KvResult};
use crate::fabric::{CommDesc, CommHandle, Fabric};
use crate::memory::{MemKind, MemRegistry};
use crate::mempool::ScalableMemPool;
use crate::transfer::client::{
    need_buffer_for_pull, serve_poll_period, stage_request_dsts, DataTransferClient, EntitySlots,
    RemoteSlots, RequestServer,
};
use crate::transfer::layerwise::{LayerWiseTransferJob, TransferBlockConfig, TransferCacheConfig};
use crate::transfer::wire::{REQ_SLOT_SIZE, RESP_SLOT_SIZE};
use crate::transfer::{expand_request, plan_pull_request, PullCacheParam};
use dashmap::DashMap;
use parking_lot::Mutex as PlMutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;

/// Entity lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Communicator being created.
    Creating,
    /// Memory descriptors not yet exchanged.
    Preparing,
    /// Ready for transfers.
    Idle,
    /// A transfer is in flight.
    Busy,
    /// Unlink in progress.
    Destroying,
    /// Unlinked.
    Destroyed,
}

/// Result of polling an entity's preparation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterMemStatus {
    /// Memory exchange still running.
    Preparing,
    /// Link ready.
    Ok,
    /// Link establishment failed.
    Failed,
}

/// Local slot addresses serialised into the fabric's descriptor exchange.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExchangeMemInfo {
    /// Exported cache-table buffer.
    pub cache_table_addr: u64,
    /// Exported cache-table buffer length.
    pub cache_table_size: u64,
    /// Peer-writable request slot.
    pub req_addr: u64,
    /// Request slot length.
    pub req_size: u64,
    /// Peer-writable response slot.
    pub resp_addr: u64,
    /// Response slot length.
    pub resp_size: u64,
}

/// Per-entity transfer counters, logged at unlink.
#[derive(Debug, Default)]
pub struct TransferStats {
    /// Completed pulls.
    pub pulls: AtomicU64,
    /// Completed layer-wise transfers.
    pub transfers: AtomicU64,
    /// Payload bytes moved by this entity's requests.
    pub bytes: AtomicU64,
}

/// Snapshot of [`TransferStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferStatsSnapshot {
    /// Completed pulls.
    pub pulls: u64,
    /// Completed layer-wise transfers.
    pub transfers: u64,
    /// Payload bytes moved.
    pub bytes: u64,
}

struct BusyGuard<'a> {
    entity: &'a CommEntity,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.entity.state.lock();
        if *state == EntityState::Busy {
            *state = EntityState::Idle;
        }
    }
}

/// Handle for one linked remote cluster.
pub struct CommEntity {
    comm_id: i64,
    cluster_name: String,
    comm: CommHandle,
    fabric: Arc<dyn Fabric>,
    state: PlMutex<EntityState>,
    failed: AtomicBool,
    unlink_flag: AtomicBool,
    pull_mutex: AsyncMutex<()>,
    slots: EntitySlots,
    remote_slots: PlMutex<Option<RemoteSlots>>,
    remote_table: PlMutex<Option<(u64, u64)>>,
    mirror: PlMutex<CacheAccessTable>,
    stats: TransferStats,
    serve_task: PlMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CommEntity {
    /// Entity id.
    pub fn comm_id(&self) -> i64 {
        self.comm_id
    }

    /// Remote cluster this entity is linked to.
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EntityState {
        *self.state.lock()
    }

    /// Counters for this entity.
    pub fn stats(&self) -> TransferStatsSnapshot {
        TransferStatsSnapshot {
            pulls: self.stats.pulls.load(Ordering::Relaxed),
            transfers: self.stats.transfers.load(Ordering::Relaxed),
            bytes: self.stats.bytes.load(Ordering::Relaxed),
        }
    }

    fn set_state(&self, state: EntityState) {
        *self.state.lock() = state;
    }

    fn remote_slots(&self) -> KvResult<RemoteSlots> {
        self.remote_slots
            .lock()
            .ok_or_else(|| KvError::NotYetLink(format!("cluster '{}'", self.cluster_name)))
    }

    fn enter_busy(&self) -> KvResult<BusyGuard<'_>> {
        let mut state = self.state.lock();
        if *state != EntityState::Idle {
            return Err(KvError::NotYetLink(format!(
                "cluster '{}' is {:?}, not ready for transfers",
                self.cluster_name, *state
            )));
        }
        *state = EntityState::Busy;
        Ok(BusyGuard { entity: self })
    }

    /// Pull a remote cache into `dst` through the request-slot protocol.
    ///
    /// Small, unregistered, or host-to-host destinations stage through
    /// `staging_pool` and are copied out once the peer commits.
    pub async fn pull_cache(
        &self,
        dst: &CacheEntry,
        param: &PullCacheParam,
        registry: &MemRegistry,
        staging_pool: Option<&ScalableMemPool>,
        default_timeout: Duration,
    ) -> KvResult<()> {
        let _transfer = self.pull_mutex.lock().await;
        if self.unlink_flag.load(Ordering::SeqCst) {
            return Err(KvError::NotYetLink(format!("cluster '{}' is unlinking", self.cluster_name)));
        }
        let _busy = self.enter_busy()?;

        let timeout = if param.timeout_ms > 0 {
            Duration::from_millis(param.timeout_ms)
        } else {
            default_timeout
        };
        let mut request = plan_pull_request(dst, param, timeout.as_millis() as u64)?;

        let host_to_host = dst.placement == CachePlacement::Host
            && self
                .mirror
                .lock()
                .find(param.cache_id, param.req_id, param.model_id)
                .map(|src| src.placement == CachePlacement::Host)
                .unwrap_or(false);
        let staged = if need_buffer_for_pull(&request, registry, host_to_host) {
            match staging_pool {
                Some(pool) => {
                    stage_request_dsts(&mut request, pool, Instant::now() + timeout)?
                }
                None => {
                    log::warn!("pull needs the staging path but no buffer pool is configured");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let client = DataTransferClient::new(self.fabric.clone(), self.comm, self.remote_slots()?);
        client.send_request(&self.slots, &request, timeout).await?;
        for dst in &staged {
            dst.stage_out();
        }

        let bytes: u64 = request
            .src_runs()
            .iter()
            .map(|run| run.buffer_len())
            .sum::<u64>()
            * request.header.dst_addr_count;
        self.stats.pulls.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes.fetch_add(bytes, Ordering::Relaxed);
        Ok(())
    }

    /// Pull directly with one-sided GETs against the mirrored catalog.
    ///
    /// Requires remote cache access enabled on both sides.
    pub async fn pull_cache_by_get(
        &self,
        dst: &CacheEntry,
        param: &PullCacheParam,
        default_timeout: Duration,
    ) -> KvResult<()> {
        let _transfer = self.pull_mutex.lock().await;
        if self.unlink_flag.load(Ordering::SeqCst) {
            return Err(KvError::NotYetLink(format!("cluster '{}' is unlinking", self.cluster_name)));
        }
        let _busy = self.enter_busy()?;
        let timeout = if param.timeout_ms > 0 {
            Duration::from_millis(param.timeout_ms)
        } else {
            default_timeout
        };

        let src_entry = {
            let mut mirror = self.mirror.lock();
            if mirror.find(param.cache_id, param.req_id, param.model_id).is_none() {
                self.sync_mirror_locked(&mut mirror, timeout)?;
            }
            if mirror.remote_access_disabled() {
                return Err(KvError::ParamInvalid(format!(
                    "cluster '{}' does not export its cache catalog",
                    self.cluster_name
                )));
            }
            mirror
                .find(param.cache_id, param.req_id, param.model_id)
                .cloned()
                .ok_or_else(|| {
                    KvError::CacheNotExist(format!(
                        "cache_id {} / key ({}, {}) on cluster '{}'",
                        param.cache_id, param.req_id, param.model_id, self.cluster_name
                    ))
                })?
        };
        if !src_entry.remote_accessible {
            return Err(KvError::ParamInvalid(format!(
                "remote cache {} is not remote-accessible",
                src_entry.cache_id
            )));
        }

        let request = plan_pull_request(dst, param, timeout.as_millis() as u64)?;
        // The mirrored catalog carries no per-key batch binding; direct
        // gets read from the row base.
        let ops = expand_request(&request, &src_entry, 0)?;
        for op in &ops {
            self.fabric.get(self.comm, op.dst_addr, op.src_addr, op.len)?;
        }
        self.fabric.sync_stream(self.comm, timeout)?;

        let bytes: u64 = ops.iter().map(|op| op.len).sum();
        self.stats.pulls.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes.fetch_add(bytes, Ordering::Relaxed);
        Ok(())
    }

    /// Layer-wise push into the peer's tensors.
    pub async fn transfer_cache(
        &self,
        src: &CacheEntry,
        config: &TransferCacheConfig,
        blocks: &TransferBlockConfig,
        default_timeout: Duration,
    ) -> KvResult<()> {
        let _transfer = self.pull_mutex.lock().await;
        if self.unlink_flag.load(Ordering::SeqCst) {
            return Err(KvError::NotYetLink(format!("cluster '{}' is unlinking", self.cluster_name)));
        }
        let _busy = self.enter_busy()?;

        let mut config = config.clone();
        if config.dst_addrs.is_empty() {
            let mirror = self.mirror.lock();
            let dst_entry = mirror.find(config.dst_cache_id, 0, 0).ok_or_else(|| {
                KvError::CacheNotExist(format!(
                    "destination cache {} is not mirrored; pass dst_addrs or sync first",
                    config.dst_cache_id
                ))
            })?;
            let per_layer = config.tensor_num_per_layer as usize;
            let (dst_lo, dst_hi) = config.dst_layer_range;
            let start = dst_lo as usize * per_layer;
            let end = dst_hi as usize * per_layer;
            if end > dst_entry.tensor_addrs.len() {
                return Err(KvError::ParamInvalid(format!(
                    "destination layers [{}, {}) exceed the mirrored cache's {} tensors",
                    dst_lo,
                    dst_hi,
                    dst_entry.tensor_addrs.len()
                )));
            }
            config.dst_addrs = dst_entry.tensor_addrs[start..end].to_vec();
        }

        let job = LayerWiseTransferJob::new(self.fabric.clone(), self.comm);
        job.run(src, &config, blocks, default_timeout).await?;
        self.stats.transfers.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Refresh the mirror of the peer's catalog.
    pub fn sync_mirror(&self, timeout: Duration) -> KvResult<u64> {
        let mut mirror = self.mirror.lock();
        self.sync_mirror_locked(&mut mirror, timeout)?;
        Ok(mirror.version())
    }

    fn sync_mirror_locked(&self, mirror: &mut CacheAccessTable, timeout: Duration) -> KvResult<()> {
        let (addr, len) = self
            .remote_table
            .lock()
            .ok_or_else(|| KvError::NotYetLink(format!("cluster '{}'", self.cluster_name)))?;
        mirror.sync_from_remote(self.fabric.as_ref(), self.comm, addr, len, timeout)
    }
}

/// Creates and destroys entities; one per linked cluster.
pub struct LinkManager {
    fabric: Arc<dyn Fabric>,
    cache_manager: Arc<CacheManager>,
    updater: Arc<CacheAccessTableUpdater>,
    shared_dev_buffer: Arc<SharedDevBuffer>,
    local_endpoint: String,
    device_id: u32,
    rdma_traffic_class: Option<u32>,
    rdma_service_level: Option<u32>,
    entities: DashMap<i64, Arc<CommEntity>>,
    by_cluster: DashMap<String, i64>,
    link_mutex: AsyncMutex<()>,
    next_comm_id: AtomicI64,
}

impl LinkManager {
    /// Build a manager for one endpoint.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fabric: Arc<dyn Fabric>,
        cache_manager: Arc<CacheManager>,
        updater: Arc<CacheAccessTableUpdater>,
        local_endpoint: String,
        device_id: u32,
        rdma_traffic_class: Option<u32>,
        rdma_service_level: Option<u32>,
    ) -> Arc<Self> {
        Arc::new(Self {
            fabric,
            cache_manager,
            updater,
            shared_dev_buffer: SharedDevBuffer::new(),
            local_endpoint,
            device_id,
            rdma_traffic_class,
            rdma_service_level,
            entities: DashMap::new(),
            by_cluster: DashMap::new(),
            link_mutex: AsyncMutex::new(()),
            next_comm_id: AtomicI64::new(1),
        })
    }

    /// Entity by id.
    pub fn get_entity(&self, comm_id: i64) -> Option<Arc<CommEntity>> {
        self.entities.get(&comm_id).map(|entry| entry.value().clone())
    }

    /// Entity by remote cluster name.
    pub fn get_entity_by_cluster(&self, cluster_name: &str) -> Option<Arc<CommEntity>> {
        self.by_cluster
            .get(cluster_name)
            .and_then(|entry| self.get_entity(*entry.value()))
    }

    /// Number of linked clusters.
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Poll an entity's preparation state.
    pub fn query_register_mem_status(&self, comm_id: i64) -> RegisterMemStatus {
        match self.get_entity(comm_id) {
            None => RegisterMemStatus::Failed,
            Some(entity) => {
                if entity.failed.load(Ordering::SeqCst) {
                    return RegisterMemStatus::Failed;
                }
                match entity.state() {
                    EntityState::Creating | EntityState::Preparing => RegisterMemStatus::Preparing,
                    EntityState::Idle | EntityState::Busy => RegisterMemStatus::Ok,
                    EntityState::Destroying | EntityState::Destroyed => RegisterMemStatus::Failed,
                }
            }
        }
    }

    /// Create the communicator and exchange memory descriptors with the
    /// peer named `remote_endpoint`. Runs inside the channel handshake on
    /// both sides.
    pub async fn establish(
        self: &Arc<Self>,
        cluster_name: &str,
        remote_endpoint: &str,
        timeout: Duration,
    ) -> KvResult<i64> {
        let _link = self.link_mutex.lock().await;
        if self.by_cluster.contains_key(cluster_name) {
            return Err(KvError::AlreadyLink(format!("cluster '{}'", cluster_name)));
        }

        let comm_id = self.next_comm_id.fetch_add(1, Ordering::SeqCst);
        // The placeholder carries the observable FSM while the link is
        // being prepared; it is replaced by the real entity on success.
        let placeholder = Arc::new(CommEntity {
            comm_id,
            cluster_name: cluster_name.to_string(),
            comm: CommHandle(0),
            fabric: self.fabric.clone(),
            state: PlMutex::new(EntityState::Creating),
            failed: AtomicBool::new(false),
            unlink_flag: AtomicBool::new(false),
            pull_mutex: AsyncMutex::new(()),
            slots: EntitySlots::new(),
            remote_slots: PlMutex::new(None),
            remote_table: PlMutex::new(None),
            mirror: PlMutex::new(CacheAccessTable::new(self.shared_dev_buffer.clone())),
            stats: TransferStats::default(),
            serve_task: PlMutex::new(None),
        });
        self.entities.insert(comm_id, placeholder.clone());
        self.by_cluster.insert(cluster_name.to_string(), comm_id);

        match self.do_establish(&placeholder, remote_endpoint, timeout).await {
            Ok(entity) => {
                self.entities.insert(comm_id, entity);
                log::info!("linked cluster '{}' as comm {}", cluster_name, comm_id);
                Ok(comm_id)
            }
            Err(err) => {
                placeholder.failed.store(true, Ordering::SeqCst);
                placeholder.set_state(EntityState::Destroyed);
                self.entities.remove(&comm_id);
                self.by_cluster.remove(cluster_name);
                Err(err)
            }
        }
    }

    /// Communicator creation, slot registration, and descriptor exchange.
    async fn do_establish(
        self: &Arc<Self>,
        placeholder: &Arc<CommEntity>,
        remote_endpoint: &str,
        timeout: Duration,
    ) -> KvResult<Arc<CommEntity>> {
        let local_desc = CommDesc {
            endpoint: self.local_endpoint.clone(),
            device_id: self.device_id,
            rdma_traffic_class: self.rdma_traffic_class,
            rdma_service_level: self.rdma_service_level,
        };
        let fabric = self.fabric.clone();
        let remote = remote_endpoint.to_string();
        let comm = tokio::task::spawn_blocking(move || {
            fabric.create_communicator(&local_desc, &remote, timeout)
        })
        .await
        .map_err(|err| KvError::LinkFailed(format!("communicator task failed: {}", err)))?
        .map_err(|err| KvError::LinkFailed(err.to_string()))?;
        placeholder.set_state(EntityState::Preparing);

        let entity = Arc::new(CommEntity {
            comm_id: placeholder.comm_id,
            cluster_name: placeholder.cluster_name.clone(),
            comm,
            fabric: self.fabric.clone(),
            state: PlMutex::new(EntityState::Preparing),
            failed: AtomicBool::new(false),
            unlink_flag: AtomicBool::new(false),
            pull_mutex: AsyncMutex::new(()),
            slots: EntitySlots::new(),
            remote_slots: PlMutex::new(None),
            remote_table: PlMutex::new(None),
            mirror: PlMutex::new(CacheAccessTable::new(self.shared_dev_buffer.clone())),
            stats: TransferStats::default(),
            serve_task: PlMutex::new(None),
        });

        self.prepare_mem(&entity, timeout).await?;

        entity.set_state(EntityState::Idle);
        self.spawn_serve_task(&entity);
        Ok(entity)
    }

    /// Register the entity's slots and run the descriptor exchange; the
    /// unlink flag aborts between steps.
    async fn prepare_mem(self: &Arc<Self>, entity: &Arc<CommEntity>, timeout: Duration) -> KvResult<()> {
        let check_unlink = || -> KvResult<()> {
            if entity.unlink_flag.load(Ordering::SeqCst) {
                return Err(KvError::LinkFailed("unlink requested during preparation".to_string()));
            }
            Ok(())
        };

        check_unlink()?;
        self.fabric.register_mem(
            entity.slots.req_recv.base(),
            REQ_SLOT_SIZE as u64,
            MemKind::Device,
        )?;
        self.fabric.register_mem(
            entity.slots.resp_recv.base(),
            RESP_SLOT_SIZE as u64,
            MemKind::Device,
        )?;
        self.fabric.register_mem(
            entity.slots.req_send.base(),
            REQ_SLOT_SIZE as u64,
            MemKind::Device,
        )?;
        self.fabric.register_mem(
            entity.slots.resp_send.base(),
            RESP_SLOT_SIZE as u64,
            MemKind::Device,
        )?;
        self.fabric.register_mem(
            self.shared_dev_buffer.addr(),
            self.shared_dev_buffer.len() as u64,
            MemKind::Device,
        )?;
        self.fabric.register_mem(
            self.updater.buffer_addr(),
            self.updater.buffer_len() as u64,
            MemKind::Device,
        )?;

        check_unlink()?;
        let local_info = ExchangeMemInfo {
            cache_table_addr: self.updater.buffer_addr(),
            cache_table_size: self.updater.buffer_len() as u64,
            req_addr: entity.slots.req_recv.base(),
            req_size: REQ_SLOT_SIZE as u64,
            resp_addr: entity.slots.resp_recv.base(),
            resp_size: RESP_SLOT_SIZE as u64,
        };
        let local_bytes = serde_json::to_vec(&local_info)?;
        let fabric = self.fabric.clone();
        let comm = entity.comm;
        let peer_bytes = tokio::task::spawn_blocking(move || {
            fabric.exchange_mem_desc(comm, &local_bytes, timeout)
        })
        .await
        .map_err(|err| KvError::LinkFailed(format!("exchange task failed: {}", err)))?
        .map_err(|err| KvError::LinkFailed(err.to_string()))?;
        let peer_info: ExchangeMemInfo = serde_json::from_slice(&peer_bytes)
            .map_err(|err| KvError::LinkFailed(format!("bad peer memory descriptor: {}", err)))?;

        check_unlink()?;
        *entity.remote_slots.lock() =
            Some(RemoteSlots { req_addr: peer_info.req_addr, resp_addr: peer_info.resp_addr });
        *entity.remote_table.lock() = Some((peer_info.cache_table_addr, peer_info.cache_table_size));

        // Provider-side preparation is optional.
        match self.fabric.prepare(entity.comm) {
            Ok(()) | Err(KvError::FeatureNotEnabled(_)) => {}
            Err(err) => return Err(KvError::LinkFailed(err.to_string())),
        }
        Ok(())
    }

    fn spawn_serve_task(self: &Arc<Self>, entity: &Arc<CommEntity>) {
        let serving = entity.clone();
        let cache_manager = self.cache_manager.clone();
        let fabric = self.fabric.clone();
        let handle = tokio::spawn(async move {
            let remote = match serving.remote_slots() {
                Ok(remote) => remote,
                Err(_) => return,
            };
            let server = RequestServer::new(fabric, serving.comm, cache_manager, remote);
            loop {
                if serving.unlink_flag.load(Ordering::SeqCst) {
                    break;
                }
                match server.serve_once(&serving.slots) {
                    Ok(true) => {}
                    Ok(false) => tokio::time::sleep(serve_poll_period()).await,
                    Err(err) => {
                        log::error!(
                            "cluster '{}': request service error: {}",
                            serving.cluster_name(),
                            err
                        );
                    }
                }
            }
        });
        *entity.serve_task.lock() = Some(handle);
    }

    /// Tear a link down, draining in-flight transfers.
    pub async fn unlink(&self, comm_id: i64) -> KvResult<()> {
        let _link = self.link_mutex.lock().await;
        let entity = self
            .get_entity(comm_id)
            .ok_or_else(|| KvError::NotYetLink(format!("comm {}", comm_id)))?;

        entity.unlink_flag.store(true, Ordering::SeqCst);
        entity.set_state(EntityState::Destroying);
        // Waiters on the pull mutex observe the state on wake.
        let _drain = entity.pull_mutex.lock().await;
        if let Some(handle) = entity.serve_task.lock().take() {
            handle.abort();
        }
        self.fabric
            .destroy_communicator(entity.comm)
            .map_err(|err| KvError::UnlinkFailed(err.to_string()))?;
        entity.set_state(EntityState::Destroyed);

        self.entities.remove(&comm_id);
        self.by_cluster.remove(entity.cluster_name());
        let stats = entity.stats();
        log::info!(
            "unlinked cluster '{}' (comm {}): {} pulls, {} transfers, {} bytes",
            entity.cluster_name(),
            comm_id,
            stats.pulls,
            stats.transfers,
            stats.bytes
        );
        Ok(())
    }

    /// Unlink everything, for engine shutdown.
    pub async fn unlink_all(&self) {
        let ids: Vec<i64> = self.entities.iter().map(|entry| *entry.key()).collect();
        for comm_id in ids {
            if let Err(err) = self.unlink(comm_id).await {
                log::warn!("unlink of comm {} failed: {}", comm_id, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::loopback::{LoopbackFabric, LoopbackHub};
    use crate::mempool::PinnedRegion;

    fn manager_on(hub: &Arc<LoopbackHub>, name: &str) -> (Arc<LinkManager>, PinnedRegion) {
        let fabric: Arc<dyn Fabric> = Arc::new(LoopbackFabric::with_hub(hub.clone(), name));
        let region = PinnedRegion::allocate(64 << 10);
        let pool = ScalableMemPool::initialize(region.base(), region.len(), 10).unwrap();
        fabric
            .register_mem(region.base(), region.len() as u64, MemKind::Device)
            .unwrap();
        let cache_manager = CacheManager::new(Some(pool), None);
        let updater = Arc::new(CacheAccessTableUpdater::new(true).unwrap());
        (
            LinkManager::new(fabric, cache_manager, updater, name.to_string(), 0, None, None),
            region,
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_establish_and_unlink() {
        let hub = LoopbackHub::new();
        let (a, _ra) = manager_on(&hub, "prompt");
        let (b, _rb) = manager_on(&hub, "decoder");

        let a2 = a.clone();
        let left = tokio::spawn(async move {
            a2.establish("decoder", "decoder", Duration::from_secs(2)).await
        });
        let right = b.establish("prompt", "prompt", Duration::from_secs(2)).await.unwrap();
        let left = left.await.unwrap().unwrap();

        assert_eq!(a.query_register_mem_status(left), RegisterMemStatus::Ok);
        assert_eq!(b.query_register_mem_status(right), RegisterMemStatus::Ok);
        let entity = a.get_entity(left).unwrap();
        assert_eq!(entity.state(), EntityState::Idle);
        assert!(entity.remote_slots().is_ok());

        a.unlink(left).await.unwrap();
        assert_eq!(a.entity_count(), 0);
        assert_eq!(a.query_register_mem_status(left), RegisterMemStatus::Failed);
        b.unlink(right).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_double_link_rejected() {
        let hub = LoopbackHub::new();
        let (a, _ra) = manager_on(&hub, "x");
        let (b, _rb) = manager_on(&hub, "y");

        let a2 = a.clone();
        let left = tokio::spawn(async move { a2.establish("y", "y", Duration::from_secs(2)).await });
        b.establish("x", "x", Duration::from_secs(2)).await.unwrap();
        left.await.unwrap().unwrap();

        let err = a.establish("y", "y", Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, KvError::AlreadyLink(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_transfer_on_unlinked_entity_fails() {
        let hub = LoopbackHub::new();
        let (a, _ra) = manager_on(&hub, "p");
        let (b, _rb) = manager_on(&hub, "q");

        let a2 = a.clone();
        let left = tokio::spawn(async move { a2.establish("q", "q", Duration::from_secs(2)).await });
        b.establish("p", "p", Duration::from_secs(2)).await.unwrap();
        let comm_id = left.await.unwrap().unwrap();

        let entity = a.get_entity(comm_id).unwrap();
        entity.set_state(EntityState::Preparing);
        let dst = CacheEntry {
            cache_id: 1,
            placement: CachePlacement::Device,
            cache_mem_type: crate::cache::CacheMemType::Contiguous,
            data_type: crate::cache::DataType::Int32,
            shape: vec![1, 8],
            tensor_size: 32,
            stride: 32,
            batch_size: 1,
            num_blocks: 1,
            tensor_addrs: vec![0x1000],
            is_owned: true,
            remote_accessible: false,
        };
        let registry = MemRegistry::new();
        let err = entity
            .pull_cache(&dst, &PullCacheParam::default(), &registry, None, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::NotYetLink(_)));
    }
}
