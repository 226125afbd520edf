//! In-process fabric provider.
//!
//! Endpoints living in one process rendezvous through a shared hub;
//! one-sided PUT/GET become direct copies between registered regions.
//! Tests and single-host deployments run the full protocol stack over
//! this provider without any interconnect hardware.

use crate::error::{KvError, KvResult};
use crate::fabric::{copy_local, CommDesc, CommHandle, EventHandle, Fabric, FabricMemHandle};
use crate::memory::{MemAddr, MemKind, SegmentTable};
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

type PairKey = (String, String);

fn pair_key(a: &str, b: &str) -> PairKey {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

#[derive(Default)]
struct EndpointState {
    segments: SegmentTable,
    registrations: HashMap<u64, (MemAddr, u64)>,
}

struct CommState {
    local: String,
    remote: String,
}

#[derive(Default)]
struct HubState {
    endpoints: HashMap<String, EndpointState>,
    comms: HashMap<u64, CommState>,
    /// Endpoints that arrived at a communicator rendezvous.
    arrivals: HashMap<PairKey, HashSet<String>>,
    /// Deposited memory-descriptor blobs keyed by (pair, sender).
    mem_descs: HashMap<(PairKey, String), Vec<u8>>,
    next_comm: u64,
    next_reg: u64,
    next_event: u64,
}

/// Shared rendezvous point for all loopback endpoints in a process.
pub struct LoopbackHub {
    state: Mutex<HubState>,
    changed: Condvar,
}

impl LoopbackHub {
    /// A fresh, private hub (one per test keeps endpoints isolated).
    pub fn new() -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(HubState::default()), changed: Condvar::new() })
    }

    /// The process-wide hub.
    pub fn global() -> Arc<Self> {
        static GLOBAL: Lazy<Arc<LoopbackHub>> = Lazy::new(LoopbackHub::new);
        GLOBAL.clone()
    }
}

/// In-process [`Fabric`] provider bound to one endpoint name.
#[derive(Clone)]
pub struct LoopbackFabric {
    endpoint: String,
    hub: Arc<LoopbackHub>,
}

impl LoopbackFabric {
    /// Endpoint on the process-wide hub.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_hub(LoopbackHub::global(), endpoint)
    }

    /// Endpoint on a private hub.
    pub fn with_hub(hub: Arc<LoopbackHub>, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        hub.state.lock().endpoints.entry(endpoint.clone()).or_default();
        Self { endpoint, hub }
    }

    /// This fabric's endpoint name.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn check_registered(
        state: &HubState,
        endpoint: &str,
        addr: MemAddr,
        len: u64,
    ) -> KvResult<()> {
        let ep = state
            .endpoints
            .get(endpoint)
            .ok_or_else(|| KvError::NotConnected(format!("unknown endpoint '{}'", endpoint)))?;
        ep.segments
            .find_segment(addr, addr + len)
            .map(|_| ())
            .ok_or_else(|| {
                KvError::ParamInvalid(format!(
                    "[{:#x}, +{}) is not registered on '{}'",
                    addr, len, endpoint
                ))
            })
    }

    fn comm_pair(&self, comm: CommHandle) -> KvResult<(String, String)> {
        let state = self.hub.state.lock();
        let comm_state = state
            .comms
            .get(&comm.0)
            .ok_or_else(|| KvError::NotConnected(format!("unknown communicator {}", comm.0)))?;
        Ok((comm_state.local.clone(), comm_state.remote.clone()))
    }
}

impl Fabric for LoopbackFabric {
    fn register_mem(&self, addr: MemAddr, len: u64, kind: MemKind) -> KvResult<FabricMemHandle> {
        let mut state = self.hub.state.lock();
        state.next_reg += 1;
        let handle = state.next_reg;
        let ep = state.endpoints.entry(self.endpoint.clone()).or_default();
        ep.segments.add_range(addr, addr + len, kind)?;
        ep.registrations.insert(handle, (addr, len));
        Ok(FabricMemHandle(handle))
    }

    fn deregister_mem(&self, handle: FabricMemHandle) -> KvResult<()> {
        let mut state = self.hub.state.lock();
        if let Some(ep) = state.endpoints.get_mut(&self.endpoint) {
            if let Some((addr, len)) = ep.registrations.remove(&handle.0) {
                ep.segments.remove_range(addr, addr + len);
            }
        }
        Ok(())
    }

    fn create_communicator(
        &self,
        local: &CommDesc,
        remote_endpoint: &str,
        timeout: Duration,
    ) -> KvResult<CommHandle> {
        let key = pair_key(&local.endpoint, remote_endpoint);
        let deadline = Instant::now() + timeout;
        let mut state = self.hub.state.lock();
        state
            .arrivals
            .entry(key.clone())
            .or_default()
            .insert(local.endpoint.clone());
        self.hub.changed.notify_all();

        loop {
            let peer_arrived = state
                .arrivals
                .get(&key)
                .map(|set| set.contains(remote_endpoint))
                .unwrap_or(false);
            if peer_arrived {
                break;
            }
            if self.hub.changed.wait_until(&mut state, deadline).timed_out() {
                // Withdraw so a later retry starts clean.
                if let Some(set) = state.arrivals.get_mut(&key) {
                    set.remove(&local.endpoint);
                }
                return Err(KvError::Timeout(format!(
                    "communicator rendezvous with '{}' timed out",
                    remote_endpoint
                )));
            }
        }

        state.next_comm += 1;
        let id = state.next_comm;
        state.comms.insert(
            id,
            CommState { local: local.endpoint.clone(), remote: remote_endpoint.to_string() },
        );
        log::debug!(
            "loopback comm {} created: {} -> {}",
            id,
            local.endpoint,
            remote_endpoint
        );
        Ok(CommHandle(id))
    }

    fn destroy_communicator(&self, comm: CommHandle) -> KvResult<()> {
        let mut state = self.hub.state.lock();
        if let Some(comm_state) = state.comms.remove(&comm.0) {
            let key = pair_key(&comm_state.local, &comm_state.remote);
            let now_empty = state
                .arrivals
                .get_mut(&key)
                .map(|set| {
                    set.remove(&comm_state.local);
                    set.is_empty()
                })
                .unwrap_or(false);
            if now_empty {
                state.arrivals.remove(&key);
            }
            state.mem_descs.remove(&(key, comm_state.local));
        }
        Ok(())
    }

    fn exchange_mem_desc(
        &self,
        comm: CommHandle,
        local_desc: &[u8],
        timeout: Duration,
    ) -> KvResult<Vec<u8>> {
        let (local, remote) = self.comm_pair(comm)?;
        let key = pair_key(&local, &remote);
        let deadline = Instant::now() + timeout;

        let mut state = self.hub.state.lock();
        state
            .mem_descs
            .insert((key.clone(), local.clone()), local_desc.to_vec());
        self.hub.changed.notify_all();

        loop {
            if let Some(peer_desc) = state.mem_descs.remove(&(key.clone(), remote.clone())) {
                return Ok(peer_desc);
            }
            if self.hub.changed.wait_until(&mut state, deadline).timed_out() {
                state.mem_descs.remove(&(key, local));
                return Err(KvError::Timeout(format!(
                    "memory descriptor exchange with '{}' timed out",
                    remote
                )));
            }
        }
    }

    fn put(&self, comm: CommHandle, local: MemAddr, remote: MemAddr, len: u64) -> KvResult<()> {
        let (local_ep, remote_ep) = self.comm_pair(comm)?;
        {
            let state = self.hub.state.lock();
            Self::check_registered(&state, &local_ep, local, len)?;
            Self::check_registered(&state, &remote_ep, remote, len)?;
        }
        copy_local(remote, local, len);
        Ok(())
    }

    fn get(&self, comm: CommHandle, local: MemAddr, remote: MemAddr, len: u64) -> KvResult<()> {
        let (local_ep, remote_ep) = self.comm_pair(comm)?;
        {
            let state = self.hub.state.lock();
            Self::check_registered(&state, &local_ep, local, len)?;
            Self::check_registered(&state, &remote_ep, remote, len)?;
        }
        copy_local(local, remote, len);
        Ok(())
    }

    fn sync_stream(&self, _comm: CommHandle, _timeout: Duration) -> KvResult<()> {
        // Loopback copies complete inline.
        Ok(())
    }

    fn record_event(&self, _comm: CommHandle) -> KvResult<EventHandle> {
        let mut state = self.hub.state.lock();
        state.next_event += 1;
        Ok(EventHandle(state.next_event))
    }

    fn query_event(&self, _event: EventHandle) -> KvResult<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn pair(hub: &Arc<LoopbackHub>) -> (LoopbackFabric, LoopbackFabric) {
        (
            LoopbackFabric::with_hub(hub.clone(), "a"),
            LoopbackFabric::with_hub(hub.clone(), "b"),
        )
    }

    fn desc(endpoint: &str) -> CommDesc {
        CommDesc {
            endpoint: endpoint.to_string(),
            device_id: 0,
            rdma_traffic_class: None,
            rdma_service_level: None,
        }
    }

    fn connect(a: &LoopbackFabric, b: &LoopbackFabric) -> (CommHandle, CommHandle) {
        let a2 = a.clone();
        let handle = thread::spawn(move || {
            a2.create_communicator(&desc("a"), "b", Duration::from_secs(1)).unwrap()
        });
        let comm_b = b
            .create_communicator(&desc("b"), "a", Duration::from_secs(1))
            .unwrap();
        (handle.join().unwrap(), comm_b)
    }

    #[test]
    fn test_rendezvous_times_out_alone() {
        let hub = LoopbackHub::new();
        let (a, _b) = pair(&hub);
        let err = a
            .create_communicator(&desc("a"), "b", Duration::from_millis(30))
            .unwrap_err();
        assert!(matches!(err, KvError::Timeout(_)));
    }

    #[test]
    fn test_put_between_registered_regions() {
        let hub = LoopbackHub::new();
        let (a, b) = pair(&hub);
        let (comm_a, _comm_b) = connect(&a, &b);

        let src = vec![42u8; 256];
        let dst = vec![0u8; 256];
        a.register_mem(src.as_ptr() as MemAddr, 256, MemKind::Device).unwrap();
        b.register_mem(dst.as_ptr() as MemAddr, 256, MemKind::Device).unwrap();

        a.put(comm_a, src.as_ptr() as MemAddr, dst.as_ptr() as MemAddr, 256).unwrap();
        assert_eq!(dst, src);
    }

    #[test]
    fn test_unregistered_target_rejected() {
        let hub = LoopbackHub::new();
        let (a, b) = pair(&hub);
        let (comm_a, _comm_b) = connect(&a, &b);

        let src = vec![1u8; 64];
        let dst = vec![0u8; 64];
        a.register_mem(src.as_ptr() as MemAddr, 64, MemKind::Host).unwrap();
        // dst never registered on b.
        let err = a
            .put(comm_a, src.as_ptr() as MemAddr, dst.as_ptr() as MemAddr, 64)
            .unwrap_err();
        assert!(matches!(err, KvError::ParamInvalid(_)));
    }

    #[test]
    fn test_exchange_mem_desc() {
        let hub = LoopbackHub::new();
        let (a, b) = pair(&hub);
        let (comm_a, comm_b) = connect(&a, &b);

        let handle = thread::spawn(move || {
            a.exchange_mem_desc(comm_a, b"from-a", Duration::from_secs(1)).unwrap()
        });
        let got_a = b
            .exchange_mem_desc(comm_b, b"from-b", Duration::from_secs(1))
            .unwrap();
        let got_b = handle.join().unwrap();
        assert_eq!(got_a, b"from-a");
        assert_eq!(got_b, b"from-b");
    }

    #[test]
    fn test_prepare_is_optional() {
        let hub = LoopbackHub::new();
        let (a, b) = pair(&hub);
        let (comm_a, _comm_b) = connect(&a, &b);
        assert!(matches!(a.prepare(comm_a), Err(KvError::FeatureNotEnabled(_))));
    }
}
