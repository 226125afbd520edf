//! # Point-to-Point Transfer Engine
//!
//! Generic register-mem + connect + transfer surface between endpoints:
//! one-sided READ/WRITE over registered segments, a staging path for
//! unregistered or small transfers, lightweight notify messages, and an
//! async-transfer worker with status polling.

use crate::channel::protocol::{AddrRange, ControlMessage};
use crate::channel::{Channel, ChannelConfig, ChannelHooks, ChannelManager, MessageHandler};
use crate::config::EngineOptions;
use crate::error::{KvError, KvResult};
use crate::fabric::loopback::LoopbackFabric;
use crate::fabric::{CommDesc, CommHandle, Fabric};
use crate::memory::{MemAddr, MemHandle, MemKind, MemRegistry};
use crate::transfer::buffered::{classify, BufferTransferService, TransferOp, BUFFER_TRANSFER_MSG_TYPE};
use crate::transfer::{TransferOpDesc, NEED_USE_BUFFER_THRESH};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex as PlMutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Notify message type in the handler registry.
const NOTIFY_MSG_TYPE: i32 = 4;

/// A lightweight application notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyDesc {
    /// Notification name, at most 1024 characters.
    pub name: String,
    /// Notification body, at most 1024 characters.
    pub message: String,
}

/// Handle of an asynchronous transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferReq(pub u64);

/// State of an asynchronous transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Still running.
    Waiting,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

struct PeerLink {
    channel_id: String,
    comm: CommHandle,
}

struct P2pShared {
    endpoint: String,
    fabric: Arc<dyn Fabric>,
    registry: MemRegistry,
    /// remote engine name -> link
    peers: DashMap<String, PeerLink>,
    /// channel id -> remote engine name
    by_channel: DashMap<String, String>,
    connect_timeout: Duration,
    notify_inbox: PlMutex<VecDeque<NotifyDesc>>,
}

struct P2pHooks {
    shared: Arc<P2pShared>,
}

#[async_trait]
impl ChannelHooks for P2pHooks {
    fn local_addr_ranges(&self) -> Vec<AddrRange> {
        self.shared
            .registry
            .segments_snapshot()
            .into_iter()
            .map(|segment| AddrRange { mem_type: segment.kind, start: segment.start, end: segment.end })
            .collect()
    }

    fn local_comm_res(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({ "endpoint": self.shared.endpoint }))
    }

    async fn on_peer_connected(&self, channel: Arc<Channel>) -> KvResult<()> {
        let peer_endpoint = channel
            .peer_comm_res()
            .and_then(|res| res.get("endpoint").and_then(|v| v.as_str()).map(str::to_string))
            .ok_or_else(|| KvError::Failed("peer advertised no engine endpoint".to_string()))?;
        if self.shared.peers.contains_key(&peer_endpoint) {
            return Err(KvError::AlreadyConnected(format!("engine '{}'", peer_endpoint)));
        }

        let fabric = self.shared.fabric.clone();
        let local_desc = CommDesc {
            endpoint: self.shared.endpoint.clone(),
            device_id: 0,
            rdma_traffic_class: None,
            rdma_service_level: None,
        };
        let timeout = self.shared.connect_timeout;
        let remote = peer_endpoint.clone();
        let comm = tokio::task::spawn_blocking(move || {
            fabric.create_communicator(&local_desc, &remote, timeout)
        })
        .await
        .map_err(|err| KvError::Failed(format!("communicator task failed: {}", err)))??;

        self.shared
            .peers
            .insert(peer_endpoint.clone(), PeerLink { channel_id: channel.id().to_string(), comm });
        self.shared.by_channel.insert(channel.id().to_string(), peer_endpoint.clone());
        log::info!("engine '{}' connected to '{}'", self.shared.endpoint, peer_endpoint);
        Ok(())
    }

    async fn on_peer_disconnected(&self, channel: Arc<Channel>) {
        if let Some((_, peer_endpoint)) = self.shared.by_channel.remove(channel.id()) {
            if let Some((_, link)) = self.shared.peers.remove(&peer_endpoint) {
                if let Err(err) = self.shared.fabric.destroy_communicator(link.comm) {
                    log::warn!("destroying communicator to '{}' failed: {}", peer_endpoint, err);
                }
            }
            log::info!("engine '{}' disconnected from '{}'", self.shared.endpoint, peer_endpoint);
        }
    }
}

struct NotifyHandler {
    shared: Arc<P2pShared>,
}

#[async_trait]
impl MessageHandler for NotifyHandler {
    async fn handle(&self, _channel: Arc<Channel>, message: ControlMessage) -> KvResult<()> {
        if let ControlMessage::Notify { name, message } = message {
            self.shared.notify_inbox.lock().push_back(NotifyDesc { name, message });
        }
        Ok(())
    }
}

/// Per-endpoint point-to-point engine.
pub struct P2pEngine {
    shared: Arc<P2pShared>,
    channel_manager: Arc<ChannelManager>,
    buffer_service: Option<Arc<BufferTransferService>>,
    async_reqs: Arc<DashMap<u64, TransferStatus>>,
    next_req_id: AtomicU64,
    listen_addr: Option<SocketAddr>,
}

impl P2pEngine {
    /// Bring the engine up under `engine_name`, listening when the
    /// options carry a `listen_ip_info`.
    pub async fn initialize(engine_name: &str, options: &EngineOptions) -> KvResult<Arc<Self>> {
        let fabric: Arc<dyn Fabric> = Arc::new(LoopbackFabric::new(engine_name));
        Self::initialize_with_fabric(engine_name, options, fabric, ChannelConfig::default()).await
    }

    /// Bring the engine up over an injected fabric provider.
    pub async fn initialize_with_fabric(
        engine_name: &str,
        options: &EngineOptions,
        fabric: Arc<dyn Fabric>,
        channel_config: ChannelConfig,
    ) -> KvResult<Arc<Self>> {
        let shared = Arc::new(P2pShared {
            endpoint: engine_name.to_string(),
            fabric: fabric.clone(),
            registry: MemRegistry::new(),
            peers: DashMap::new(),
            by_channel: DashMap::new(),
            connect_timeout: channel_config.connect_timeout,
            notify_inbox: PlMutex::new(VecDeque::new()),
        });
        let hooks = Arc::new(P2pHooks { shared: shared.clone() });
        let channel_manager = ChannelManager::new(channel_config, hooks)?;

        let buffer_service = BufferTransferService::new(options.buffer_pool)?;
        if let Some(service) = &buffer_service {
            for (addr, len) in service.regions() {
                fabric.register_mem(addr, len, MemKind::Device)?;
                shared.registry.register_mem(addr, len, MemKind::Device)?;
            }
            channel_manager.register_handler(BUFFER_TRANSFER_MSG_TYPE, service.clone());
        }
        channel_manager.register_handler(NOTIFY_MSG_TYPE, Arc::new(NotifyHandler { shared: shared.clone() }));

        let listen = options.listen_info.as_ref().map(|info| info.socket_addr());
        let listen_addr = channel_manager.start(listen).await?;
        log::info!(
            "p2p engine '{}' initialized{}",
            engine_name,
            listen_addr.map(|a| format!(", listening on {}", a)).unwrap_or_default()
        );

        Ok(Arc::new(Self {
            shared,
            channel_manager,
            buffer_service,
            async_reqs: Arc::new(DashMap::new()),
            next_req_id: AtomicU64::new(1),
            listen_addr,
        }))
    }

    /// Address the engine accepts connections on, when listening.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    /// Engine name on the fabric.
    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    /// Tear everything down: channels, communicators, tasks.
    pub async fn finalize(&self) {
        let remotes: Vec<String> =
            self.shared.peers.iter().map(|entry| entry.key().clone()).collect();
        for remote in remotes {
            if let Err(err) = self.disconnect(&remote).await {
                log::warn!("disconnect from '{}' during finalize failed: {}", remote, err);
            }
        }
        self.channel_manager.shutdown().await;
        log::info!("p2p engine '{}' finalized", self.shared.endpoint);
    }

    /// Register local memory for one-sided access.
    pub fn register_mem(&self, addr: MemAddr, len: u64, kind: MemKind) -> KvResult<MemHandle> {
        self.shared.fabric.register_mem(addr, len, kind)?;
        self.shared.registry.register_mem(addr, len, kind)
    }

    /// Deregister local memory. Unknown handles are tolerated.
    pub fn deregister_mem(&self, handle: MemHandle) -> KvResult<()> {
        self.shared.registry.deregister_mem(handle)
    }

    /// Connect to a remote engine's listen address.
    pub async fn connect(&self, remote_addr: SocketAddr, timeout: Duration) -> KvResult<String> {
        let channel = self.channel_manager.connect(remote_addr, timeout).await?;
        self.shared
            .by_channel
            .get(channel.id())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| KvError::Failed("connected channel lost its engine mapping".to_string()))
    }

    /// Disconnect from a remote engine.
    pub async fn disconnect(&self, remote_engine: &str) -> KvResult<()> {
        let channel_id = self
            .shared
            .peers
            .get(remote_engine)
            .map(|link| link.channel_id.clone())
            .ok_or_else(|| KvError::NotConnected(format!("engine '{}'", remote_engine)))?;
        self.channel_manager.disconnect(&channel_id).await
    }

    fn peer_comm(&self, remote_engine: &str) -> KvResult<(CommHandle, Arc<Channel>)> {
        let link = self
            .shared
            .peers
            .get(remote_engine)
            .ok_or_else(|| KvError::NotConnected(format!("engine '{}'", remote_engine)))?;
        let channel = self
            .channel_manager
            .get_channel(&link.channel_id)
            .ok_or_else(|| KvError::NotConnected(format!("engine '{}'", remote_engine)))?;
        Ok((link.comm, channel))
    }

    /// Classify the batch and decide direct vs staged, rejecting mixed
    /// placement sets in buffered mode.
    fn transfer_mode(
        &self,
        channel: &Arc<Channel>,
        op: TransferOp,
        ops: &[TransferOpDesc],
    ) -> KvResult<bool> {
        let remote_segments = channel.remote_segments();
        let mut need_buffer = false;
        let mut batch_type = None;
        for desc in ops {
            if desc.len == 0 {
                return Err(KvError::ParamInvalid("zero-length transfer op".to_string()));
            }
            let local = self
                .shared
                .registry
                .find_segment(desc.local_addr, desc.local_addr + desc.len);
            let remote = remote_segments.find_segment(desc.remote_addr, desc.remote_addr + desc.len);
            need_buffer =
                need_buffer || local.is_none() || remote.is_none() || desc.len < NEED_USE_BUFFER_THRESH;
            let cur = classify(op, local.map(|s| s.kind), remote.map(|s| s.kind));
            if need_buffer {
                if let Some(prev) = batch_type {
                    if prev != cur {
                        return Err(KvError::ParamInvalid(
                            "all ops must share one transfer type in buffered mode".to_string(),
                        ));
                    }
                }
            }
            batch_type = Some(cur);
        }
        Ok(need_buffer)
    }

    /// Move a batch of ops synchronously.
    pub async fn transfer_sync(
        &self,
        remote_engine: &str,
        op: TransferOp,
        ops: &[TransferOpDesc],
        timeout: Duration,
    ) -> KvResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let (comm, channel) = self.peer_comm(remote_engine)?;
        let _serialised = channel.transfer_lock().lock().await;
        let _guard = channel.begin_transfer();

        let need_buffer = self.transfer_mode(&channel, op, ops)?;
        if need_buffer {
            let service = self.buffer_service.as_ref().ok_or_else(|| {
                KvError::FeatureNotEnabled(
                    "transfer needs the staging path but the buffer pool is disabled".to_string(),
                )
            })?;
            return service
                .transfer(&channel, &self.shared.fabric, comm, op, ops, timeout)
                .await;
        }

        for desc in ops {
            match op {
                TransferOp::Write => {
                    self.shared.fabric.put(comm, desc.local_addr, desc.remote_addr, desc.len)?
                }
                TransferOp::Read => {
                    self.shared.fabric.get(comm, desc.local_addr, desc.remote_addr, desc.len)?
                }
            }
        }
        self.shared.fabric.sync_stream(comm, timeout)?;
        Ok(())
    }

    /// Start an asynchronous transfer; poll with
    /// [`P2pEngine::get_transfer_status`].
    pub fn transfer_async(
        self: &Arc<Self>,
        remote_engine: &str,
        op: TransferOp,
        ops: Vec<TransferOpDesc>,
        timeout: Duration,
    ) -> KvResult<TransferReq> {
        // Fail fast on unknown peers instead of from the worker.
        self.peer_comm(remote_engine)?;
        let req_id = self.next_req_id.fetch_add(1, Ordering::SeqCst);
        self.async_reqs.insert(req_id, TransferStatus::Waiting);

        let engine = self.clone();
        let remote = remote_engine.to_string();
        let statuses = self.async_reqs.clone();
        tokio::spawn(async move {
            let outcome = engine.transfer_sync(&remote, op, &ops, timeout).await;
            let status = match outcome {
                Ok(()) => TransferStatus::Completed,
                Err(err) => {
                    log::error!("async transfer {} failed: {}", req_id, err);
                    TransferStatus::Failed
                }
            };
            statuses.insert(req_id, status);
        });
        Ok(TransferReq(req_id))
    }

    /// Report an async transfer's state; terminal states consume the
    /// request handle.
    pub fn get_transfer_status(&self, req: TransferReq) -> KvResult<TransferStatus> {
        let status = self
            .async_reqs
            .get(&req.0)
            .map(|entry| *entry.value())
            .ok_or_else(|| KvError::ParamInvalid(format!("unknown transfer request {}", req.0)))?;
        if status != TransferStatus::Waiting {
            self.async_reqs.remove(&req.0);
        }
        Ok(status)
    }

    /// Send a notify to a connected remote engine.
    pub async fn send_notify(
        &self,
        remote_engine: &str,
        notify: NotifyDesc,
        timeout: Duration,
    ) -> KvResult<()> {
        let (_, channel) = self.peer_comm(remote_engine)?;
        let message = ControlMessage::Notify { name: notify.name, message: notify.message };
        tokio::time::timeout(timeout, channel.send(&message))
            .await
            .map_err(|_| KvError::Timeout("notify send timed out".to_string()))?
    }

    /// Drain received notifies in arrival order.
    pub fn get_notifies(&self) -> Vec<NotifyDesc> {
        self.shared.notify_inbox.lock().drain(..).collect()
    }

    /// Number of connected remote engines.
    pub fn peer_count(&self) -> usize {
        self.shared.peers.len()
    }

    /// The channel manager, for tests exercising pool limits.
    pub fn channel_manager(&self) -> &Arc<ChannelManager> {
        &self.channel_manager
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::loopback::LoopbackHub;

    async fn engine_on(hub: &Arc<LoopbackHub>, name: &str, listen: bool) -> Arc<P2pEngine> {
        let fabric: Arc<dyn Fabric> = Arc::new(LoopbackFabric::with_hub(hub.clone(), name));
        let mut options = EngineOptions::default();
        if listen {
            options.listen_info = Some(crate::config::ListenInfo::parse("127.0.0.1:0").unwrap());
        }
        P2pEngine::initialize_with_fabric(name, &options, fabric, ChannelConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_connect_and_direct_write() {
        let hub = LoopbackHub::new();
        let server = engine_on(&hub, "srv", true).await;
        let client = engine_on(&hub, "cli", false).await;

        let src = vec![0xABu8; 512 * 1024];
        let dst = vec![0u8; 512 * 1024];
        client
            .register_mem(src.as_ptr() as MemAddr, src.len() as u64, MemKind::Device)
            .unwrap();
        server
            .register_mem(dst.as_ptr() as MemAddr, dst.len() as u64, MemKind::Device)
            .unwrap();

        let remote = client
            .connect(server.listen_addr().unwrap(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(remote, "srv");

        let ops = [TransferOpDesc {
            local_addr: src.as_ptr() as MemAddr,
            remote_addr: dst.as_ptr() as MemAddr,
            len: src.len() as u64,
        }];
        client
            .transfer_sync(&remote, TransferOp::Write, &ops, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(dst, src);

        client.finalize().await;
        server.finalize().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_transfer_to_unknown_peer_fails() {
        let hub = LoopbackHub::new();
        let engine = engine_on(&hub, "solo", false).await;
        let ops = [TransferOpDesc { local_addr: 0x1000, remote_addr: 0x2000, len: 64 }];
        let err = engine
            .transfer_sync("nobody", TransferOp::Write, &ops, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::NotConnected(_)));
        engine.finalize().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_async_transfer_completes() {
        let hub = LoopbackHub::new();
        let server = engine_on(&hub, "asrv", true).await;
        let client = engine_on(&hub, "acli", false).await;

        let src = vec![7u8; 512 * 1024];
        let dst = vec![0u8; 512 * 1024];
        client
            .register_mem(src.as_ptr() as MemAddr, src.len() as u64, MemKind::Device)
            .unwrap();
        server
            .register_mem(dst.as_ptr() as MemAddr, dst.len() as u64, MemKind::Device)
            .unwrap();
        let remote = client
            .connect(server.listen_addr().unwrap(), Duration::from_secs(2))
            .await
            .unwrap();

        let ops = vec![TransferOpDesc {
            local_addr: src.as_ptr() as MemAddr,
            remote_addr: dst.as_ptr() as MemAddr,
            len: src.len() as u64,
        }];
        let req = client
            .transfer_async(&remote, TransferOp::Write, ops, Duration::from_secs(2))
            .unwrap();

        let mut status = TransferStatus::Waiting;
        for _ in 0..100 {
            status = client.get_transfer_status(req).unwrap();
            if status != TransferStatus::Waiting {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, TransferStatus::Completed);
        assert_eq!(dst, src);
        // Terminal status consumed the handle.
        assert!(client.get_transfer_status(req).is_err());

        client.finalize().await;
        server.finalize().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_buffered_small_write() {
        let hub = LoopbackHub::new();
        let server = engine_on(&hub, "bsrv", true).await;
        let client = engine_on(&hub, "bcli", false).await;

        // Small, unregistered buffers force the staging path.
        let src = vec![0x5Au8; 4096];
        let dst = vec![0u8; 4096];
        let remote = client
            .connect(server.listen_addr().unwrap(), Duration::from_secs(2))
            .await
            .unwrap();

        let ops = [TransferOpDesc {
            local_addr: src.as_ptr() as MemAddr,
            remote_addr: dst.as_ptr() as MemAddr,
            len: src.len() as u64,
        }];
        client
            .transfer_sync(&remote, TransferOp::Write, &ops, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(dst, src);

        client.finalize().await;
        server.finalize().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_buffered_read_round_trip() {
        let hub = LoopbackHub::new();
        let server = engine_on(&hub, "rsrv", true).await;
        let client = engine_on(&hub, "rcli", false).await;

        let remote_data = vec![0xC3u8; 64 * 1024];
        let local_out = vec![0u8; 64 * 1024];
        let remote = client
            .connect(server.listen_addr().unwrap(), Duration::from_secs(2))
            .await
            .unwrap();

        let ops = [TransferOpDesc {
            local_addr: local_out.as_ptr() as MemAddr,
            remote_addr: remote_data.as_ptr() as MemAddr,
            len: remote_data.len() as u64,
        }];
        client
            .transfer_sync(&remote, TransferOp::Read, &ops, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(local_out, remote_data);

        client.finalize().await;
        server.finalize().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_notify_ordering_and_drain() {
        let hub = LoopbackHub::new();
        let server = engine_on(&hub, "nsrv", true).await;
        let client = engine_on(&hub, "ncli", false).await;

        let remote = client
            .connect(server.listen_addr().unwrap(), Duration::from_secs(2))
            .await
            .unwrap();
        for i in 0..5 {
            client
                .send_notify(
                    &remote,
                    NotifyDesc { name: format!("n{}", i), message: format!("m{}", i) },
                    Duration::from_secs(1),
                )
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let notifies = server.get_notifies();
        assert_eq!(notifies.len(), 5);
        for (i, notify) in notifies.iter().enumerate() {
            assert_eq!(notify.name, format!("n{}", i));
        }
        assert!(server.get_notifies().is_empty());

        client.finalize().await;
        server.finalize().await;
    }
}
