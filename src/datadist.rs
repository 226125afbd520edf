//! # Cluster Dataplane Facade
//!
//! One handle per cluster participant: owns the memory pools, the cache
//! catalog, the exported access table, the control-channel manager, and
//! the per-remote-cluster link entities. Prompt and decoder clusters run
//! the same engine with different roles.

use crate::cache::access_table::CacheAccessTableUpdater;
use crate::cache::copy::{CopyCacheParam, SwapDirection};
use crate::cache::{Cache, CacheDesc, CacheKey, CacheManager, CacheEntry};
use crate::channel::protocol::AddrRange;
use crate::channel::{Channel, ChannelConfig, ChannelHooks, ChannelManager};
use crate::config::EngineOptions;
use crate::error::{KvError, KvResult};
use crate::fabric::loopback::LoopbackFabric;
use crate::fabric::Fabric;
use crate::link::{CommEntity, LinkManager, RegisterMemStatus, TransferStatsSnapshot};
use crate::memory::{MemAddr, MemKind, MemRegistry};
use crate::mempool::{PinnedRegion, ScalableMemPool};
use crate::transfer::layerwise::{TransferBlockConfig, TransferCacheConfig};
use crate::transfer::PullCacheParam;
use async_trait::async_trait;
use parking_lot::Mutex as PlMutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Cluster role in a disaggregated deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Prefill cluster producing caches.
    Prompt,
    /// Decode cluster consuming caches.
    Decoder,
    /// Both roles on one cluster.
    Mix,
}

struct DataDistHooks {
    registry: MemRegistry,
    link_manager: Arc<LinkManager>,
    endpoint: String,
    cluster_id: u64,
    link_timeout: Duration,
}

#[async_trait]
impl ChannelHooks for DataDistHooks {
    fn local_addr_ranges(&self) -> Vec<AddrRange> {
        self.registry
            .segments_snapshot()
            .into_iter()
            .map(|segment| AddrRange { mem_type: segment.kind, start: segment.start, end: segment.end })
            .collect()
    }

    fn local_comm_res(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({
            "endpoint": self.endpoint,
            "cluster_id": self.cluster_id,
        }))
    }

    async fn on_peer_connected(&self, channel: Arc<Channel>) -> KvResult<()> {
        let peer_endpoint = channel
            .peer_comm_res()
            .and_then(|res| res.get("endpoint").and_then(|v| v.as_str()).map(str::to_string))
            .ok_or_else(|| KvError::LinkFailed("peer advertised no endpoint".to_string()))?;
        self.link_manager
            .establish(&peer_endpoint, &peer_endpoint, self.link_timeout)
            .await
            .map(|_| ())
    }

    async fn on_peer_disconnected(&self, channel: Arc<Channel>) {
        // The entity survives channel loss; transfers ride the fabric, and
        // a re-link reuses or replaces the entity explicitly.
        log::info!("control channel {} closed; entities retained", channel.id());
    }
}

/// Cluster-level KV-cache dataplane handle.
pub struct DataDist {
    cluster_id: u64,
    role: PlMutex<Role>,
    options: EngineOptions,
    fabric: Arc<dyn Fabric>,
    registry: MemRegistry,
    cache_manager: Arc<CacheManager>,
    updater: Arc<CacheAccessTableUpdater>,
    link_manager: Arc<LinkManager>,
    channel_manager: Arc<ChannelManager>,
    staging_pool: Option<ScalableMemPool>,
    // Backing regions live as long as the engine.
    _device_region: Option<PinnedRegion>,
    _host_region: Option<PinnedRegion>,
    _staging_region: Option<PinnedRegion>,
    listen_addr: Option<SocketAddr>,
}

impl DataDist {
    /// Bring the engine up under `endpoint_name` on the in-process
    /// fabric.
    pub async fn initialize(
        cluster_id: u64,
        role: Role,
        endpoint_name: &str,
        options: EngineOptions,
    ) -> KvResult<Arc<Self>> {
        let fabric: Arc<dyn Fabric> = Arc::new(LoopbackFabric::new(endpoint_name));
        Self::initialize_with_fabric(cluster_id, role, endpoint_name, options, fabric, ChannelConfig::default())
            .await
    }

    /// Bring the engine up over an injected fabric provider.
    pub async fn initialize_with_fabric(
        cluster_id: u64,
        role: Role,
        endpoint_name: &str,
        options: EngineOptions,
        fabric: Arc<dyn Fabric>,
        channel_config: ChannelConfig,
    ) -> KvResult<Arc<Self>> {
        let registry = MemRegistry::new();

        let mut device_region = None;
        let device_pool = match &options.mem_pool {
            Some(config) => {
                let region = PinnedRegion::allocate(config.memory_size);
                let pool = ScalableMemPool::initialize(region.base(), region.len(), config.page_shift)?;
                fabric.register_mem(region.base(), region.len() as u64, MemKind::Device)?;
                registry.register_mem(region.base(), region.len() as u64, MemKind::Device)?;
                device_region = Some(region);
                Some(pool)
            }
            None => None,
        };
        let mut host_region = None;
        let host_pool = match &options.host_mem_pool {
            Some(config) => {
                let region = PinnedRegion::allocate(config.memory_size);
                let pool = ScalableMemPool::initialize(region.base(), region.len(), config.page_shift)?;
                fabric.register_mem(region.base(), region.len() as u64, MemKind::Host)?;
                registry.register_mem(region.base(), region.len() as u64, MemKind::Host)?;
                host_region = Some(region);
                Some(pool)
            }
            None => None,
        };

        let mut staging_region = None;
        let staging_pool = if options.buffer_pool.is_disabled() {
            None
        } else {
            let bytes = options.buffer_pool.buffer_num * options.buffer_pool.buffer_size_bytes();
            let region = PinnedRegion::allocate(bytes);
            // Pull staging hands out one chunk per destination tensor, so
            // the pool pages stay fine-grained (4 KiB) rather than
            // whole-buffer sized.
            let pool = ScalableMemPool::initialize(region.base(), region.len(), 12)?;
            fabric.register_mem(region.base(), region.len() as u64, MemKind::Device)?;
            registry.register_mem(region.base(), region.len() as u64, MemKind::Device)?;
            staging_region = Some(region);
            Some(pool)
        };

        let cache_manager = CacheManager::new(device_pool, host_pool);
        let updater = Arc::new(CacheAccessTableUpdater::new(options.enable_remote_cache_accessible)?);
        let link_manager = LinkManager::new(
            fabric.clone(),
            cache_manager.clone(),
            updater.clone(),
            endpoint_name.to_string(),
            options.device_id,
            options.rdma_traffic_class,
            options.rdma_service_level,
        );

        let hooks = Arc::new(DataDistHooks {
            registry: registry.clone(),
            link_manager: link_manager.clone(),
            endpoint: endpoint_name.to_string(),
            cluster_id,
            link_timeout: Duration::from_millis(options.link_total_time_ms),
        });
        let channel_manager = ChannelManager::new(channel_config, hooks)?;
        let listen = options.listen_info.as_ref().map(|info| info.socket_addr());
        let listen_addr = channel_manager.start(listen).await?;

        log::info!(
            "datadist up: cluster {} role {:?} endpoint '{}'{}",
            cluster_id,
            role,
            endpoint_name,
            listen_addr.map(|a| format!(", listening on {}", a)).unwrap_or_default()
        );
        Ok(Arc::new(Self {
            cluster_id,
            role: PlMutex::new(role),
            options,
            fabric,
            registry,
            cache_manager,
            updater,
            link_manager,
            channel_manager,
            staging_pool,
            _device_region: device_region,
            _host_region: host_region,
            _staging_region: staging_region,
            listen_addr,
        }))
    }

    /// Cluster id this engine serves.
    pub fn cluster_id(&self) -> u64 {
        self.cluster_id
    }

    /// Current role.
    pub fn role(&self) -> Role {
        *self.role.lock()
    }

    /// Listen address, when accepting links.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    /// The cache catalog.
    pub fn cache_manager(&self) -> &Arc<CacheManager> {
        &self.cache_manager
    }

    /// Swap roles; requires `enable_switch_role`.
    pub fn set_role(&self, role: Role) -> KvResult<()> {
        if !self.options.enable_switch_role {
            return Err(KvError::FeatureNotEnabled("enable_switch_role is off".to_string()));
        }
        let prior = {
            let mut current = self.role.lock();
            let prior = *current;
            *current = role;
            prior
        };
        log::info!("role switched: {:?} -> {:?}", prior, role);
        Ok(())
    }

    /// Tear all links and channels down.
    pub async fn finalize(&self) {
        self.link_manager.unlink_all().await;
        self.channel_manager.shutdown().await;
        log::info!("datadist for cluster {} finalized", self.cluster_id);
    }

    // ----- linking -----

    /// Link a remote cluster through its control-channel address.
    pub async fn link(&self, remote_addr: SocketAddr, timeout: Duration) -> KvResult<i64> {
        let channel = self.channel_manager.connect(remote_addr, timeout).await?;
        let peer_endpoint = channel
            .peer_comm_res()
            .and_then(|res| res.get("endpoint").and_then(|v| v.as_str()).map(str::to_string))
            .ok_or_else(|| KvError::LinkFailed("peer advertised no endpoint".to_string()))?;
        let entity = self
            .link_manager
            .get_entity_by_cluster(&peer_endpoint)
            .ok_or_else(|| KvError::LinkFailed(format!("no entity for cluster '{}'", peer_endpoint)))?;
        Ok(entity.comm_id())
    }

    /// Unlink a remote cluster.
    pub async fn unlink(&self, comm_id: i64) -> KvResult<()> {
        self.link_manager.unlink(comm_id).await
    }

    /// Poll link preparation.
    pub fn query_register_mem_status(&self, comm_id: i64) -> RegisterMemStatus {
        self.link_manager.query_register_mem_status(comm_id)
    }

    /// Comm id of an established link, by the peer's endpoint name.
    ///
    /// Links made by the peer also appear here: establishment is
    /// symmetric, so the accepting side gets an entity too.
    pub fn linked_comm_id(&self, cluster_name: &str) -> Option<i64> {
        self.link_manager
            .get_entity_by_cluster(cluster_name)
            .map(|entity| entity.comm_id())
    }

    /// Transfer counters of one link.
    pub fn query_stats(&self, comm_id: i64) -> KvResult<TransferStatsSnapshot> {
        self.entity(comm_id).map(|entity| entity.stats())
    }

    fn entity(&self, comm_id: i64) -> KvResult<Arc<CommEntity>> {
        self.link_manager
            .get_entity(comm_id)
            .ok_or_else(|| KvError::NotYetLink(format!("comm {}", comm_id)))
    }

    // ----- cache lifecycle -----

    /// Allocate a cache from the engine's pools and export the catalog.
    pub fn allocate(&self, desc: &CacheDesc, keys: &[CacheKey]) -> KvResult<Cache> {
        let cache = self.cache_manager.allocate(
            desc,
            keys,
            self.options.enable_remote_cache_accessible,
        )?;
        self.refresh_table()?;
        Ok(cache)
    }

    /// Register caller-owned tensors as a cache.
    pub fn register(
        &self,
        desc: &CacheDesc,
        keys: &[CacheKey],
        tensor_addrs: Vec<MemAddr>,
    ) -> KvResult<Cache> {
        let cache = self.cache_manager.register(
            desc,
            keys,
            tensor_addrs,
            self.options.enable_remote_cache_accessible,
        )?;
        self.refresh_table()?;
        Ok(cache)
    }

    /// Drop the external reference of an allocated cache.
    pub fn deallocate(&self, cache_id: i64) -> KvResult<()> {
        self.cache_manager.deallocate(cache_id)?;
        self.refresh_table()
    }

    /// Remove a registered cache.
    pub fn unregister(&self, cache_id: i64) -> KvResult<()> {
        self.cache_manager.unregister(cache_id)?;
        self.refresh_table()
    }

    /// Unbind a cache key.
    pub fn remove_cache_key(&self, key: &CacheKey) -> KvResult<()> {
        self.cache_manager.remove_cache_key(key)?;
        self.refresh_table()
    }

    fn refresh_table(&self) -> KvResult<()> {
        self.updater.update(&self.cache_manager).map(|_| ())
    }

    // ----- data movement -----

    /// Pull the remote cache identified by `src_key` into the local
    /// cache `dst_cache_id`.
    pub async fn pull_cache(
        &self,
        comm_id: i64,
        dst_cache_id: i64,
        src_key: CacheKey,
        mut param: PullCacheParam,
    ) -> KvResult<()> {
        let entity = self.entity(comm_id)?;
        let dst = self.dst_entry(dst_cache_id)?;
        if src_key.is_prefix {
            param.prefix_id = src_key.id;
        } else {
            param.req_id = src_key.id;
        }
        param.model_id = src_key.model_id;
        let timeout = Duration::from_millis(self.options.sync_kv_cache_wait_time_ms);
        if self.options.enable_remote_cache_accessible {
            entity.pull_cache_by_get(&dst, &param, timeout).await
        } else {
            entity
                .pull_cache(&dst, &param, &self.registry, self.staging_pool.as_ref(), timeout)
                .await
        }
    }

    /// Pull a remote cache by its id on the peer.
    pub async fn pull_cache_by_id(
        &self,
        comm_id: i64,
        dst_cache_id: i64,
        src_cache_id: i64,
        mut param: PullCacheParam,
    ) -> KvResult<()> {
        let entity = self.entity(comm_id)?;
        let dst = self.dst_entry(dst_cache_id)?;
        param.cache_id = src_cache_id;
        let timeout = Duration::from_millis(self.options.sync_kv_cache_wait_time_ms);
        if self.options.enable_remote_cache_accessible {
            entity.pull_cache_by_get(&dst, &param, timeout).await
        } else {
            entity
                .pull_cache(&dst, &param, &self.registry, self.staging_pool.as_ref(), timeout)
                .await
        }
    }

    fn dst_entry(&self, dst_cache_id: i64) -> KvResult<CacheEntry> {
        self.cache_manager
            .get_entry(dst_cache_id)
            .ok_or_else(|| KvError::CacheNotExist(format!("cache {}", dst_cache_id)))
    }

    /// Layer-wise transfer of a local cache into a linked peer.
    pub async fn transfer_cache(
        &self,
        comm_id: i64,
        task_id: u64,
        config: TransferCacheConfig,
        blocks: TransferBlockConfig,
    ) -> KvResult<()> {
        let entity = self.entity(comm_id)?;
        let src = self
            .cache_manager
            .get_entry(config.cache_id)
            .ok_or_else(|| KvError::CacheNotExist(format!("cache {}", config.cache_id)))?;
        let timeout = Duration::from_millis(self.options.sync_kv_cache_wait_time_ms);
        log::debug!("transfer task {} on comm {}", task_id, comm_id);
        entity.transfer_cache(&src, &config, &blocks, timeout).await
    }

    /// Refresh the mirror of a peer's catalog.
    pub fn sync_remote_table(&self, comm_id: i64) -> KvResult<u64> {
        let entity = self.entity(comm_id)?;
        entity.sync_mirror(Duration::from_millis(self.options.sync_kv_cache_wait_time_ms))
    }

    /// Local cache copy.
    pub fn copy_cache(&self, param: &CopyCacheParam) -> KvResult<()> {
        self.cache_manager.copy_cache(param)
    }

    /// Swap blocks between a host cache and a device cache.
    pub fn swap_blocks(
        &self,
        src_cache_id: i64,
        dst_cache_id: i64,
        block_size: u64,
        direction: SwapDirection,
        block_mapping: &[(u64, u64)],
    ) -> KvResult<()> {
        self.cache_manager
            .swap_blocks(src_cache_id, dst_cache_id, block_size, direction, block_mapping)
    }

    /// The underlying fabric, for advanced wiring and tests.
    pub fn fabric(&self) -> &Arc<dyn Fabric> {
        &self.fabric
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheMemType, CachePlacement, DataType};
    use crate::config::MemPoolConfig;
    use crate::fabric::loopback::LoopbackHub;

    async fn engine(
        hub: &Arc<LoopbackHub>,
        name: &str,
        role: Role,
        listen: bool,
        remote_accessible: bool,
    ) -> Arc<DataDist> {
        let fabric: Arc<dyn Fabric> = Arc::new(LoopbackFabric::with_hub(hub.clone(), name));
        let mut options = EngineOptions {
            mem_pool: Some(MemPoolConfig { memory_size: 4 << 20, page_shift: 10 }),
            enable_remote_cache_accessible: remote_accessible,
            ..EngineOptions::default()
        };
        if listen {
            options.listen_info = Some(crate::config::ListenInfo::parse("127.0.0.1:0").unwrap());
        }
        DataDist::initialize_with_fabric(1, role, name, options, fabric, ChannelConfig::default())
            .await
            .unwrap()
    }

    fn contiguous_desc(shape: Vec<u64>) -> CacheDesc {
        CacheDesc {
            num_tensors: 2,
            data_type: DataType::Int32,
            shape,
            placement: CachePlacement::Device,
            cache_mem_type: CacheMemType::Contiguous,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_link_and_query_status() {
        let hub = LoopbackHub::new();
        let prompt = engine(&hub, "dd-p", Role::Prompt, true, false).await;
        let decoder = engine(&hub, "dd-d", Role::Decoder, false, false).await;

        let comm_id = decoder
            .link(prompt.listen_addr().unwrap(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(decoder.query_register_mem_status(comm_id), RegisterMemStatus::Ok);

        decoder.unlink(comm_id).await.unwrap();
        assert_eq!(decoder.query_register_mem_status(comm_id), RegisterMemStatus::Failed);

        decoder.finalize().await;
        prompt.finalize().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_set_role_gated() {
        let hub = LoopbackHub::new();
        let engine = engine(&hub, "dd-r", Role::Prompt, false, false).await;
        let err = engine.set_role(Role::Decoder).unwrap_err();
        assert!(matches!(err, KvError::FeatureNotEnabled(_)));
        engine.finalize().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_allocate_updates_table() {
        let hub = LoopbackHub::new();
        let engine = engine(&hub, "dd-a", Role::Prompt, false, true).await;
        let key = CacheKey::for_request(1, 1);
        let cache = engine.allocate(&contiguous_desc(vec![2, 16]), &[key]).unwrap();
        assert!(cache.cache_id > 0);
        engine.remove_cache_key(&key).unwrap();
        engine.deallocate(cache.cache_id).unwrap();
        assert_eq!(engine.cache_manager().entry_count(), 0);
        engine.finalize().await;
    }
}
