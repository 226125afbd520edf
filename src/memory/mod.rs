//! # Memory Registration & Segment Tracking
//!
//! Registered memory is what one-sided transfers are allowed to touch.
//! The registry de-duplicates registrations by `(addr, len)` and keeps the
//! endpoint's segment table in step, so the transfer planner can classify
//! any address range as host, device, or unregistered.

use crate::error::{KvError, KvResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Raw memory address as carried on the wire.
///
/// Addresses cross endpoints as integers and are only ever dereferenced by
/// the interconnect; nothing in this crate follows a remote address.
pub type MemAddr = u64;

/// Placement of a registered range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemKind {
    /// Pinned host memory.
    Host,
    /// Device (accelerator) memory.
    Device,
}

/// Opaque token returned by [`MemRegistry::register_mem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemHandle(u64);

impl MemHandle {
    /// Raw handle value, for logging.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// A registered, typed address range on an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// First byte of the range.
    pub start: MemAddr,
    /// One past the last byte of the range.
    pub end: MemAddr,
    /// Placement of the range.
    pub kind: MemKind,
}

impl Segment {
    /// True when the segment fully contains `[start, end)`.
    pub fn contains(&self, start: MemAddr, end: MemAddr) -> bool {
        self.start <= start && end <= self.end
    }

    /// Length of the segment in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// True when the segment is empty.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Interval map of registered segments for one endpoint.
///
/// Segments never overlap; insertion of an overlapping range is rejected.
#[derive(Debug, Default, Clone)]
pub struct SegmentTable {
    segments: BTreeMap<MemAddr, Segment>,
}

impl SegmentTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `[start, end)` with the given kind.
    pub fn add_range(&mut self, start: MemAddr, end: MemAddr, kind: MemKind) -> KvResult<()> {
        if start >= end {
            return Err(KvError::ParamInvalid(format!(
                "segment [{:#x}, {:#x}) is empty or inverted",
                start, end
            )));
        }
        // The candidate overlaps its predecessor or the first range at or
        // after its start.
        if let Some((_, prev)) = self.segments.range(..start).next_back() {
            if prev.end > start {
                return Err(KvError::ParamInvalid(format!(
                    "segment [{:#x}, {:#x}) overlaps [{:#x}, {:#x})",
                    start, end, prev.start, prev.end
                )));
            }
        }
        if let Some((_, next)) = self.segments.range(start..).next() {
            if next.start < end {
                return Err(KvError::ParamInvalid(format!(
                    "segment [{:#x}, {:#x}) overlaps [{:#x}, {:#x})",
                    start, end, next.start, next.end
                )));
            }
        }
        self.segments.insert(start, Segment { start, end, kind });
        Ok(())
    }

    /// Remove the segment that starts at `start` and ends at `end`.
    ///
    /// Removal of an unknown range is a no-op.
    pub fn remove_range(&mut self, start: MemAddr, end: MemAddr) {
        if let Some(segment) = self.segments.get(&start) {
            if segment.end == end {
                self.segments.remove(&start);
            }
        }
    }

    /// Find the single segment enclosing all of `[start, end)`, if any.
    pub fn find_segment(&self, start: MemAddr, end: MemAddr) -> Option<Segment> {
        if start >= end {
            return None;
        }
        self.segments
            .range(..=start)
            .next_back()
            .map(|(_, segment)| *segment)
            .filter(|segment| segment.contains(start, end))
    }

    /// Number of registered segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// True when no segments are registered.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Snapshot of all segments, ordered by start address.
    pub fn snapshot(&self) -> Vec<Segment> {
        self.segments.values().copied().collect()
    }
}

struct Registration {
    addr: MemAddr,
    len: u64,
    kind: MemKind,
}

struct RegistryState {
    next_handle: u64,
    by_range: HashMap<(MemAddr, u64), MemHandle>,
    by_handle: HashMap<MemHandle, Registration>,
    segments: SegmentTable,
}

/// Registration bookkeeping for one endpoint.
///
/// Registering the same `(addr, len)` twice returns the prior handle;
/// deregistering an unknown handle warns and succeeds.
#[derive(Clone)]
pub struct MemRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl Default for MemRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RegistryState {
                next_handle: 1,
                by_range: HashMap::new(),
                by_handle: HashMap::new(),
                segments: SegmentTable::new(),
            })),
        }
    }

    /// Register `[addr, addr + len)` with the given placement.
    pub fn register_mem(&self, addr: MemAddr, len: u64, kind: MemKind) -> KvResult<MemHandle> {
        if len == 0 {
            return Err(KvError::ParamInvalid("cannot register a zero-length range".to_string()));
        }
        let mut state = self.state.lock();
        if let Some(handle) = state.by_range.get(&(addr, len)) {
            log::debug!("register_mem: [{:#x}, +{}) already registered", addr, len);
            return Ok(*handle);
        }
        state.segments.add_range(addr, addr + len, kind)?;
        let handle = MemHandle(state.next_handle);
        state.next_handle += 1;
        state.by_range.insert((addr, len), handle);
        state.by_handle.insert(handle, Registration { addr, len, kind });
        log::info!(
            "register_mem: handle={} [{:#x}, +{}) kind={:?}",
            handle.raw(),
            addr,
            len,
            kind
        );
        Ok(handle)
    }

    /// Deregister a handle. Unknown handles warn and return success.
    pub fn deregister_mem(&self, handle: MemHandle) -> KvResult<()> {
        let mut state = self.state.lock();
        match state.by_handle.remove(&handle) {
            Some(registration) => {
                state.by_range.remove(&(registration.addr, registration.len));
                state
                    .segments
                    .remove_range(registration.addr, registration.addr + registration.len);
                log::info!(
                    "deregister_mem: handle={} [{:#x}, +{})",
                    handle.raw(),
                    registration.addr,
                    registration.len
                );
            }
            None => {
                log::warn!("deregister_mem: unknown handle {}", handle.raw());
            }
        }
        Ok(())
    }

    /// Kind of the handle's registration, if the handle is live.
    pub fn kind_of(&self, handle: MemHandle) -> Option<MemKind> {
        self.state.lock().by_handle.get(&handle).map(|r| r.kind)
    }

    /// Find the single registered segment enclosing `[start, end)`.
    pub fn find_segment(&self, start: MemAddr, end: MemAddr) -> Option<Segment> {
        self.state.lock().segments.find_segment(start, end)
    }

    /// Snapshot of the endpoint's registered segments.
    pub fn segments_snapshot(&self) -> Vec<Segment> {
        self.state.lock().segments.snapshot()
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.state.lock().by_handle.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.state.lock().by_handle.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_table_overlap_rejected() {
        let mut table = SegmentTable::new();
        table.add_range(0x1000, 0x2000, MemKind::Device).unwrap();
        assert!(table.add_range(0x1800, 0x2800, MemKind::Device).is_err());
        assert!(table.add_range(0x800, 0x1001, MemKind::Host).is_err());
        table.add_range(0x2000, 0x3000, MemKind::Host).unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_find_segment_whole_containment() {
        let mut table = SegmentTable::new();
        table.add_range(0x1000, 0x2000, MemKind::Device).unwrap();
        table.add_range(0x2000, 0x3000, MemKind::Device).unwrap();

        let found = table.find_segment(0x1100, 0x1200).unwrap();
        assert_eq!(found.start, 0x1000);

        // Spanning two adjacent segments is not a single enclosure.
        assert!(table.find_segment(0x1800, 0x2200).is_none());
        assert!(table.find_segment(0x3000, 0x3001).is_none());
        assert!(table.find_segment(0x1200, 0x1200).is_none());
    }

    #[test]
    fn test_register_dedupe_by_range() {
        let registry = MemRegistry::new();
        let first = registry.register_mem(0x4000, 0x1000, MemKind::Device).unwrap();
        let second = registry.register_mem(0x4000, 0x1000, MemKind::Device).unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_deregister_idempotent() {
        let registry = MemRegistry::new();
        let handle = registry.register_mem(0x4000, 0x1000, MemKind::Host).unwrap();
        registry.deregister_mem(handle).unwrap();
        // A second deregistration is tolerated.
        registry.deregister_mem(handle).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_deregister_restores_table() {
        let registry = MemRegistry::new();
        registry.register_mem(0x1000, 0x1000, MemKind::Device).unwrap();
        let before = registry.segments_snapshot();

        let handle = registry.register_mem(0x8000, 0x2000, MemKind::Host).unwrap();
        registry.deregister_mem(handle).unwrap();

        assert_eq!(registry.segments_snapshot(), before);
    }

    #[test]
    fn test_zero_length_rejected() {
        let registry = MemRegistry::new();
        assert!(registry.register_mem(0x1000, 0, MemKind::Host).is_err());
    }
}
