//! # Channel Management
//!
//! Point-to-point TCP control connections: connect/accept handshakes,
//! per-channel reader tasks, heartbeats, transfer counters, and the
//! waterline eviction policy that keeps the pool under its limits.
//!
//! Upper layers plug in through [`ChannelHooks`] (link establishment on
//! connect/disconnect) and a per-message-type handler registry.

pub mod eviction;
pub mod protocol;

use crate::error::{code, KvError, KvResult};
use crate::memory::SegmentTable;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex as PlMutex;
use protocol::{AddrRange, ControlMessage};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex as AsyncMutex, Notify};
use uuid::Uuid;

/// Poll period while a connect waits for the pool to drain.
pub const CHECK_DISCONNECT_PERIOD: Duration = Duration::from_millis(10);
/// How long a server waits for a disconnect-request response.
pub const WAIT_RESP_TIME: Duration = Duration::from_millis(20);

/// Which end of the TCP connection this channel is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSide {
    /// This endpoint initiated the connection.
    Client,
    /// This endpoint accepted the connection.
    Server,
}

/// Channel pool limits and liveness tuning.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Hard channel limit; 0 disables the limit.
    pub max_channel: usize,
    /// Eviction trigger; 0 disables waterline eviction.
    pub high_waterline: usize,
    /// Eviction target.
    pub low_waterline: usize,
    /// How often heartbeats are sent.
    pub heartbeat_interval: Duration,
    /// Silence budget before a channel is declared dead.
    pub heartbeat_timeout: Duration,
    /// TCP connect budget.
    pub connect_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_channel: 0,
            high_waterline: 0,
            low_waterline: 0,
            heartbeat_interval: Duration::from_millis(500),
            heartbeat_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl ChannelConfig {
    /// Check waterline ordering: `0 < low < high <= max` when configured.
    pub fn validate(&self) -> KvResult<()> {
        if self.high_waterline > 0 {
            if self.low_waterline == 0
                || self.low_waterline >= self.high_waterline
                || self.max_channel < self.high_waterline
            {
                return Err(KvError::ParamInvalid(format!(
                    "waterlines must satisfy 0 < low({}) < high({}) <= max({})",
                    self.low_waterline, self.high_waterline, self.max_channel
                )));
            }
        }
        Ok(())
    }
}

/// One control connection to a peer endpoint.
#[derive(Debug)]
pub struct Channel {
    id: String,
    side: ChannelSide,
    peer_addr: SocketAddr,
    writer: AsyncMutex<OwnedWriteHalf>,
    transfer_count: AtomicU32,
    has_transferred: AtomicBool,
    disconnecting: AtomicBool,
    closed: AtomicBool,
    last_heartbeat: PlMutex<Instant>,
    remote_segments: PlMutex<SegmentTable>,
    peer_comm_res: PlMutex<Option<serde_json::Value>>,
    transfer_lock: AsyncMutex<()>,
}

impl Channel {
    fn new(
        id: String,
        side: ChannelSide,
        peer_addr: SocketAddr,
        writer: OwnedWriteHalf,
        remote_segments: SegmentTable,
        peer_comm_res: Option<serde_json::Value>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            side,
            peer_addr,
            writer: AsyncMutex::new(writer),
            transfer_count: AtomicU32::new(0),
            has_transferred: AtomicBool::new(false),
            disconnecting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            last_heartbeat: PlMutex::new(Instant::now()),
            remote_segments: PlMutex::new(remote_segments),
            peer_comm_res: PlMutex::new(peer_comm_res),
            transfer_lock: AsyncMutex::new(()),
        })
    }

    /// Channel id minted by the connecting client.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Which end of the connection this is.
    pub fn side(&self) -> ChannelSide {
        self.side
    }

    /// Peer socket address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Send a control message to the peer.
    pub async fn send(&self, message: &ControlMessage) -> KvResult<()> {
        let mut writer = self.writer.lock().await;
        message.write_to(&mut *writer).await
    }

    /// Mutex serialising transfers over this channel.
    pub fn transfer_lock(&self) -> &AsyncMutex<()> {
        &self.transfer_lock
    }

    /// Enter a transfer: bumps the in-flight counter and marks activity.
    pub fn begin_transfer(self: &Arc<Self>) -> TransferGuard {
        self.transfer_count.fetch_add(1, Ordering::SeqCst);
        self.has_transferred.store(true, Ordering::SeqCst);
        TransferGuard { channel: self.clone() }
    }

    /// Number of transfers currently in flight.
    pub fn transfer_count(&self) -> u32 {
        self.transfer_count.load(Ordering::SeqCst)
    }

    /// True when the channel transferred since the last eviction reset.
    pub fn has_transferred(&self) -> bool {
        self.has_transferred.load(Ordering::SeqCst)
    }

    pub(crate) fn reset_has_transferred(&self) {
        self.has_transferred.store(false, Ordering::SeqCst);
    }

    /// Hide or expose the channel for eviction candidate selection.
    pub fn set_disconnecting(&self, value: bool) {
        self.disconnecting.store(value, Ordering::SeqCst);
    }

    /// True while the channel is an eviction victim.
    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::SeqCst)
    }

    fn touch_heartbeat(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat.lock().elapsed()
    }

    /// The peer's advertised registered ranges.
    pub fn remote_segments(&self) -> SegmentTable {
        self.remote_segments.lock().clone()
    }

    /// Replace the peer's advertised ranges.
    pub fn set_remote_segments(&self, table: SegmentTable) {
        *self.remote_segments.lock() = table;
    }

    /// Communicator resource the peer advertised on `Connect`.
    pub fn peer_comm_res(&self) -> Option<serde_json::Value> {
        self.peer_comm_res.lock().clone()
    }
}

/// RAII guard for one in-flight transfer on a channel.
pub struct TransferGuard {
    channel: Arc<Channel>,
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        self.channel.transfer_count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Upper-layer integration points for channel lifecycle.
#[async_trait]
pub trait ChannelHooks: Send + Sync {
    /// Registered ranges advertised in outgoing `Connect` messages.
    fn local_addr_ranges(&self) -> Vec<AddrRange> {
        Vec::new()
    }

    /// Communicator resource description advertised on `Connect`.
    fn local_comm_res(&self) -> Option<serde_json::Value> {
        None
    }

    /// Runs between the `Connect` exchange and the final `Status`; link
    /// establishment (communicator + memory exchange) happens here.
    async fn on_peer_connected(&self, channel: Arc<Channel>) -> KvResult<()>;

    /// Runs once per channel teardown, whatever the cause.
    async fn on_peer_disconnected(&self, channel: Arc<Channel>);
}

/// No-op hooks for tests and plain channel pools.
pub struct NoopHooks;

#[async_trait]
impl ChannelHooks for NoopHooks {
    async fn on_peer_connected(&self, _channel: Arc<Channel>) -> KvResult<()> {
        Ok(())
    }

    async fn on_peer_disconnected(&self, _channel: Arc<Channel>) {}
}

/// Handler for one control-message type, resolved from the registry.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process a message received on `channel`.
    async fn handle(&self, channel: Arc<Channel>, message: ControlMessage) -> KvResult<()>;
}

/// Client/server channel maps, reactor tasks, and the eviction policy.
pub struct ChannelManager {
    config: ChannelConfig,
    hooks: Arc<dyn ChannelHooks>,
    channels: DashMap<String, Arc<Channel>>,
    handlers: DashMap<i32, Arc<dyn MessageHandler>>,
    evict_notify: Arc<Notify>,
    pending_disconnects: PlMutex<HashMap<u64, oneshot::Sender<u32>>>,
    next_req_id: AtomicU64,
    reserved: AtomicUsize,
    shutting_down: AtomicBool,
    local_addr: PlMutex<Option<SocketAddr>>,
    tasks: PlMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ChannelManager {
    /// Build a manager. Waterline configuration is validated here.
    pub fn new(config: ChannelConfig, hooks: Arc<dyn ChannelHooks>) -> KvResult<Arc<Self>> {
        config.validate()?;
        if config.high_waterline > 0 {
            log::info!(
                "waterline config: max_channel={} high_waterline={} low_waterline={}",
                config.max_channel,
                config.high_waterline,
                config.low_waterline
            );
        }
        Ok(Arc::new(Self {
            config,
            hooks,
            channels: DashMap::new(),
            handlers: DashMap::new(),
            evict_notify: Arc::new(Notify::new()),
            pending_disconnects: PlMutex::new(HashMap::new()),
            next_req_id: AtomicU64::new(1),
            reserved: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            local_addr: PlMutex::new(None),
            tasks: PlMutex::new(Vec::new()),
        }))
    }

    /// Start background tasks and, when `listen` is given, the acceptor.
    ///
    /// Returns the bound address when listening.
    pub async fn start(self: &Arc<Self>, listen: Option<SocketAddr>) -> KvResult<Option<SocketAddr>> {
        let mut bound = None;
        if let Some(addr) = listen {
            let listener = TcpListener::bind(addr).await?;
            let local = listener.local_addr()?;
            bound = Some(local);
            *self.local_addr.lock() = bound;
            let manager = self.clone();
            let handle = tokio::spawn(async move { manager.accept_loop(listener).await });
            self.tasks.lock().push(handle);
            log::info!("channel manager listening on {}", local);
        }

        let manager = self.clone();
        let heartbeat = tokio::spawn(async move { manager.heartbeat_loop().await });
        self.tasks.lock().push(heartbeat);

        if self.config.high_waterline > 0 {
            let manager = self.clone();
            let evictor = tokio::spawn(async move { eviction::eviction_loop(manager).await });
            self.tasks.lock().push(evictor);
        }
        Ok(bound)
    }

    /// Address the acceptor is bound to, when listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Register a handler for one message type.
    pub fn register_handler(&self, msg_type: i32, handler: Arc<dyn MessageHandler>) {
        self.handlers.insert(msg_type, handler);
    }

    /// Total channel count, both sides.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Look up a channel by id.
    pub fn get_channel(&self, channel_id: &str) -> Option<Arc<Channel>> {
        self.channels.get(channel_id).map(|entry| entry.value().clone())
    }

    /// Snapshot of all channels.
    pub fn channels_snapshot(&self) -> Vec<Arc<Channel>> {
        self.channels.iter().map(|entry| entry.value().clone()).collect()
    }

    pub(crate) fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub(crate) fn evict_notify(&self) -> &Arc<Notify> {
        &self.evict_notify
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Connect to a remote endpoint and run the link handshake.
    pub async fn connect(self: &Arc<Self>, remote: SocketAddr, timeout: Duration) -> KvResult<Arc<Channel>> {
        self.admit(timeout).await?;
        let result = self.connect_inner(remote, timeout).await;
        self.reserved.fetch_sub(1, Ordering::SeqCst);
        if self.config.high_waterline > 0 && self.channel_count() >= self.config.high_waterline {
            self.evict_notify.notify_one();
        }
        result
    }

    async fn connect_inner(self: &Arc<Self>, remote: SocketAddr, timeout: Duration) -> KvResult<Arc<Channel>> {
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(remote))
            .await
            .map_err(|_| KvError::Timeout(format!("connect to {} timed out", remote)))??;
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        let (mut reader, mut writer) = stream.into_split();

        let channel_id = Uuid::new_v4().to_string();
        let connect = ControlMessage::Connect {
            channel_id: channel_id.clone(),
            comm_res: self.hooks.local_comm_res(),
            timeout: timeout.as_millis() as u64,
            addrs: self.hooks.local_addr_ranges(),
        };
        connect.write_to(&mut writer).await?;

        let reply = ControlMessage::read_from(&mut reader).await?;
        let (remote_segments, peer_comm_res) = match reply {
            ControlMessage::Connect { addrs, comm_res, .. } => (segments_from_ranges(&addrs)?, comm_res),
            ControlMessage::Status { error_code, error_message } => {
                return Err(KvError::from_code(error_code, error_message));
            }
            other => {
                return Err(KvError::Failed(format!(
                    "unexpected handshake reply type {}",
                    other.msg_type()
                )));
            }
        };

        let channel = Channel::new(
            channel_id.clone(),
            ChannelSide::Client,
            peer_addr,
            writer,
            remote_segments,
            peer_comm_res,
        );
        self.hooks.on_peer_connected(channel.clone()).await?;

        match ControlMessage::read_from(&mut reader).await? {
            ControlMessage::Status { error_code, error_message } => {
                if error_code != code::SUCCESS {
                    return Err(KvError::from_code(error_code, error_message));
                }
            }
            other => {
                return Err(KvError::Failed(format!(
                    "expected final status, got type {}",
                    other.msg_type()
                )));
            }
        }

        self.channels.insert(channel_id, channel.clone());
        self.spawn_reader(channel.clone(), reader);
        log::info!("channel {} connected to {}", channel.id(), peer_addr);
        Ok(channel)
    }

    /// Tear a channel down from this side, notifying the peer.
    pub async fn disconnect(self: &Arc<Self>, channel_id: &str) -> KvResult<()> {
        let channel = self
            .get_channel(channel_id)
            .ok_or_else(|| KvError::NotConnected(format!("unknown channel {}", channel_id)))?;
        channel.set_disconnecting(true);
        let message = ControlMessage::Disconnect { channel_id: channel_id.to_string() };
        if let Err(err) = channel.send(&message).await {
            log::warn!("disconnect notify on {} failed: {}", channel_id, err);
        }
        self.remove_channel(&channel).await;
        Ok(())
    }

    /// Send a notify message on a channel.
    pub async fn send_notify(&self, channel_id: &str, name: &str, message: &str) -> KvResult<()> {
        let channel = self
            .get_channel(channel_id)
            .ok_or_else(|| KvError::NotConnected(format!("unknown channel {}", channel_id)))?;
        channel
            .send(&ControlMessage::Notify { name: name.to_string(), message: message.to_string() })
            .await
    }

    /// Stop all tasks and drop every channel.
    pub async fn shutdown(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.evict_notify.notify_waiters();
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            handle.abort();
        }
        let channels = self.channels_snapshot();
        for channel in channels {
            self.remove_channel(&channel).await;
        }
    }

    /// Wait for admission under `max_channel`, reserving a slot.
    async fn admit(&self, timeout: Duration) -> KvResult<()> {
        if self.config.max_channel == 0 {
            self.reserved.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        loop {
            let current = self.channel_count() + self.reserved.load(Ordering::SeqCst);
            if current < self.config.max_channel {
                // Benign race: a concurrent admit may slip past; the
                // reservation counter keeps the steady state bounded.
                self.reserved.fetch_add(1, Ordering::SeqCst);
                return Ok(());
            }
            self.evict_notify.notify_one();
            if Instant::now() >= deadline {
                return Err(KvError::ResourceExhausted(format!(
                    "channel count {} reached max_channel {}",
                    self.channel_count(),
                    self.config.max_channel
                )));
            }
            tokio::time::sleep(CHECK_DISCONNECT_PERIOD).await;
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let manager = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = manager.handle_incoming(stream).await {
                            log::warn!("handshake with {} failed: {}", peer, err);
                        }
                    });
                }
                Err(err) => {
                    log::error!("accept error: {}", err);
                    if self.is_shutting_down() {
                        break;
                    }
                }
            }
        }
    }

    async fn handle_incoming(self: &Arc<Self>, stream: TcpStream) -> KvResult<()> {
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        let (mut reader, mut writer) = stream.into_split();

        let (channel_id, handshake_timeout, remote_segments, peer_comm_res) =
            match ControlMessage::read_from(&mut reader).await? {
                ControlMessage::Connect { channel_id, timeout, addrs, comm_res } => (
                    channel_id,
                    Duration::from_millis(timeout),
                    segments_from_ranges(&addrs)?,
                    comm_res,
                ),
                other => {
                    return Err(KvError::Failed(format!(
                        "handshake must start with Connect, got type {}",
                        other.msg_type()
                    )));
                }
            };

        if let Err(err) = self.admit(handshake_timeout).await {
            let status = ControlMessage::Status { error_code: err.code(), error_message: err.to_string() };
            let _ = status.write_to(&mut writer).await;
            return Err(err);
        }

        let reply = ControlMessage::Connect {
            channel_id: channel_id.clone(),
            comm_res: self.hooks.local_comm_res(),
            timeout: handshake_timeout.as_millis() as u64,
            addrs: self.hooks.local_addr_ranges(),
        };
        if let Err(err) = reply.write_to(&mut writer).await {
            self.reserved.fetch_sub(1, Ordering::SeqCst);
            return Err(err);
        }

        let channel = Channel::new(
            channel_id.clone(),
            ChannelSide::Server,
            peer_addr,
            writer,
            remote_segments,
            peer_comm_res,
        );
        let establish = self.hooks.on_peer_connected(channel.clone()).await;
        let (error_code, error_message) = match &establish {
            Ok(()) => (code::SUCCESS, String::new()),
            Err(err) => (err.code(), err.to_string()),
        };
        let status = ControlMessage::Status { error_code, error_message };
        let status_sent = channel.send(&status).await;
        self.reserved.fetch_sub(1, Ordering::SeqCst);
        establish?;
        status_sent?;

        self.channels.insert(channel_id, channel.clone());
        self.spawn_reader(channel.clone(), reader);
        if self.config.high_waterline > 0 && self.channel_count() >= self.config.high_waterline {
            self.evict_notify.notify_one();
        }
        log::info!("channel {} accepted from {}", channel.id(), peer_addr);
        Ok(())
    }

    fn spawn_reader(self: &Arc<Self>, channel: Arc<Channel>, mut reader: OwnedReadHalf) {
        let manager = self.clone();
        // Reader tasks end on their own: removing the channel drops the
        // write half, and the peer's teardown closes the read half.
        tokio::spawn(async move {
            loop {
                match ControlMessage::read_from(&mut reader).await {
                    Ok(message) => {
                        if let Err(err) = manager.dispatch(&channel, message).await {
                            log::warn!("channel {}: handler error: {}", channel.id(), err);
                        }
                        if channel.closed.load(Ordering::SeqCst) {
                            break;
                        }
                    }
                    Err(err) => {
                        if !channel.closed.load(Ordering::SeqCst) && !manager.is_shutting_down() {
                            log::debug!("channel {}: read ended: {}", channel.id(), err);
                            manager.remove_channel(&channel).await;
                        }
                        break;
                    }
                }
            }
        });
    }

    async fn dispatch(self: &Arc<Self>, channel: &Arc<Channel>, message: ControlMessage) -> KvResult<()> {
        match message {
            ControlMessage::Heartbeat { .. } => {
                channel.touch_heartbeat();
                Ok(())
            }
            ControlMessage::Disconnect { .. } => {
                log::info!("channel {}: peer disconnected", channel.id());
                self.remove_channel(channel).await;
                Ok(())
            }
            ControlMessage::RequestDisconnect { channel_id, req_id, .. } => {
                self.answer_disconnect_request(channel, &channel_id, req_id).await
            }
            ControlMessage::RequestDisconnectResp { req_id, error_code, .. } => {
                let sender = self.pending_disconnects.lock().remove(&req_id);
                if let Some(sender) = sender {
                    let _ = sender.send(error_code);
                } else {
                    log::warn!("unmatched disconnect response, req_id={}", req_id);
                }
                Ok(())
            }
            other => {
                let handler = self.handlers.get(&other.msg_type()).map(|entry| entry.value().clone());
                match handler {
                    Some(handler) => handler.handle(channel.clone(), other).await,
                    None => {
                        log::warn!(
                            "channel {}: no handler for message type {}",
                            channel.id(),
                            other.msg_type()
                        );
                        Ok(())
                    }
                }
            }
        }
    }

    /// The client is authoritative: agree only when no transfer is in
    /// flight, then tear the channel down from this side.
    async fn answer_disconnect_request(
        self: &Arc<Self>,
        channel: &Arc<Channel>,
        channel_id: &str,
        req_id: u64,
    ) -> KvResult<()> {
        if channel.transfer_count() > 0 {
            let resp = ControlMessage::RequestDisconnectResp {
                req_id,
                error_code: code::LINK_BUSY,
                error_message: "transfers in flight".to_string(),
            };
            return channel.send(&resp).await;
        }
        let resp = ControlMessage::RequestDisconnectResp {
            req_id,
            error_code: code::SUCCESS,
            error_message: String::new(),
        };
        channel.send(&resp).await?;
        self.disconnect(channel_id).await
    }

    pub(crate) fn next_req_id(&self) -> u64 {
        self.next_req_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn register_pending_disconnect(&self, req_id: u64) -> oneshot::Receiver<u32> {
        let (tx, rx) = oneshot::channel();
        self.pending_disconnects.lock().insert(req_id, tx);
        rx
    }

    pub(crate) fn forget_pending_disconnect(&self, req_id: u64) {
        self.pending_disconnects.lock().remove(&req_id);
    }

    async fn remove_channel(self: &Arc<Self>, channel: &Arc<Channel>) {
        if channel.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.channels.remove(channel.id());
        self.hooks.on_peer_disconnected(channel.clone()).await;
        log::debug!("channel {} removed, {} remain", channel.id(), self.channel_count());
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.is_shutting_down() {
                break;
            }
            for channel in self.channels_snapshot() {
                let beat = ControlMessage::Heartbeat { channel_id: channel.id().to_string() };
                if let Err(err) = channel.send(&beat).await {
                    log::debug!("heartbeat send on {} failed: {}", channel.id(), err);
                }
                if channel.heartbeat_age() > self.config.heartbeat_timeout {
                    log::warn!(
                        "channel {} missed heartbeats for {:?}, evicting",
                        channel.id(),
                        channel.heartbeat_age()
                    );
                    self.remove_channel(&channel).await;
                }
            }
        }
    }
}

fn segments_from_ranges(ranges: &[AddrRange]) -> KvResult<SegmentTable> {
    let mut table = SegmentTable::new();
    for range in ranges {
        table.add_range(range.start, range.end, range.mem_type)?;
    }
    Ok(table)
}
