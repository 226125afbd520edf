//! # Interconnect Fabric
//!
//! Capability seam between the engine and the interconnect library. The
//! engine never assumes eager availability of every capability: optional
//! operations default to `FeatureNotEnabled`, and a provider implements
//! what its hardware supports.
//!
//! [`loopback::LoopbackFabric`] is the in-process provider used by tests
//! and single-host deployments; a real RDMA provider slots in behind the
//! same trait.

pub mod loopback;

use crate::error::{KvError, KvResult};
use crate::memory::{MemAddr, MemKind};
use std::time::Duration;

/// Opaque communicator handle issued by a fabric provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommHandle(pub u64);

/// Opaque registration handle issued by a fabric provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FabricMemHandle(pub u64);

/// Opaque event handle for record/poll pipelining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(pub u64);

/// Local side of a communicator, forwarded to the provider.
#[derive(Debug, Clone)]
pub struct CommDesc {
    /// Endpoint name, unique per process participant.
    pub endpoint: String,
    /// Device ordinal behind this endpoint.
    pub device_id: u32,
    /// RDMA traffic class, when configured.
    pub rdma_traffic_class: Option<u32>,
    /// RDMA service level, when configured.
    pub rdma_service_level: Option<u32>,
}

/// Interconnect capability surface.
///
/// One-sided `put`/`get` complete without remote CPU involvement; both
/// ends of every transfer must be registered. All blocking calls accept a
/// deadline and return `Timeout` when it elapses.
pub trait Fabric: Send + Sync {
    /// Register `[addr, addr + len)` for one-sided access.
    fn register_mem(&self, addr: MemAddr, len: u64, kind: MemKind) -> KvResult<FabricMemHandle>;

    /// Release a registration. Unknown handles are tolerated.
    fn deregister_mem(&self, handle: FabricMemHandle) -> KvResult<()>;

    /// Create a communicator toward `remote_endpoint`, rendezvousing with
    /// the peer's matching call.
    fn create_communicator(
        &self,
        local: &CommDesc,
        remote_endpoint: &str,
        timeout: Duration,
    ) -> KvResult<CommHandle>;

    /// Destroy a communicator and drain its in-flight work.
    fn destroy_communicator(&self, comm: CommHandle) -> KvResult<()>;

    /// Exchange an opaque memory-descriptor blob with the peer, returning
    /// the peer's blob.
    fn exchange_mem_desc(&self, comm: CommHandle, local_desc: &[u8], timeout: Duration) -> KvResult<Vec<u8>>;

    /// One-sided PUT: local `[local, local + len)` into the peer's
    /// `[remote, remote + len)`.
    fn put(&self, comm: CommHandle, local: MemAddr, remote: MemAddr, len: u64) -> KvResult<()>;

    /// One-sided GET: peer's `[remote, remote + len)` into local
    /// `[local, local + len)`.
    fn get(&self, comm: CommHandle, local: MemAddr, remote: MemAddr, len: u64) -> KvResult<()>;

    /// Wait until all posted one-sided work on the communicator completed.
    fn sync_stream(&self, comm: CommHandle, timeout: Duration) -> KvResult<()>;

    /// Abort the communicator's stream, draining pending work.
    fn abort_stream(&self, _comm: CommHandle) -> KvResult<()> {
        Ok(())
    }

    /// Record an event behind the posted work.
    fn record_event(&self, _comm: CommHandle) -> KvResult<EventHandle> {
        Err(KvError::FeatureNotEnabled("event recording".to_string()))
    }

    /// True once a recorded event completed.
    fn query_event(&self, _event: EventHandle) -> KvResult<bool> {
        Err(KvError::FeatureNotEnabled("event query".to_string()))
    }

    /// Destroy a recorded event.
    fn destroy_event(&self, _event: EventHandle) -> KvResult<()> {
        Ok(())
    }

    /// Provider-side link preparation, where supported.
    fn prepare(&self, _comm: CommHandle) -> KvResult<()> {
        Err(KvError::FeatureNotEnabled("prepare".to_string()))
    }
}

/// Copy `len` bytes between two local ranges.
///
/// Stands in for the device runtime's typed memcpy: staging in/out of
/// pinned buffers and local cache copies go through here, never through
/// the fabric.
///
/// Callers guarantee both ranges are live allocations of at least `len`
/// bytes owned by this process; the ranges must not overlap.
pub fn copy_local(dst: MemAddr, src: MemAddr, len: u64) {
    if len == 0 {
        return;
    }
    // Addresses originate from live allocations owned by the engine.
    unsafe {
        std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_local() {
        let src = vec![7u8; 64];
        let mut dst = vec![0u8; 64];
        copy_local(dst.as_mut_ptr() as MemAddr, src.as_ptr() as MemAddr, 64);
        assert_eq!(dst, src);
    }

    #[test]
    fn test_copy_local_zero_len() {
        let src = [1u8];
        let mut dst = [0u8];
        copy_local(dst.as_mut_ptr() as MemAddr, src.as_ptr() as MemAddr, 0);
        assert_eq!(dst[0], 0);
    }
}
