//! Host-memory reference device for `imgsync`.
//!
//! [`HostDevice`] implements [`DeviceAllocator`] on top of plain heap
//! allocations. It is the correctness oracle for the coherence manager: every
//! primitive is counted, transfers are bounds-checked against both buffers,
//! fresh allocations are poisoned, and allocation or transfer failures can be
//! injected on demand.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use imgsync_core::{DeviceAllocator, DevicePtr, Result, SyncDirection, SyncError, TransferPlan};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Byte pattern written into every fresh allocation.
pub const POISON: u8 = 0xCD;

/// Addresses are spaced one page apart so they never look contiguous.
const PAGE_SHIFT: u32 = 12;

/// Call counters for a [`HostDevice`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub allocations: usize,
    pub frees: usize,
    /// Frees of addresses that were not live.
    pub invalid_frees: usize,
    pub host_to_device: usize,
    pub device_to_host: usize,
    pub bytes_to_device: usize,
    pub bytes_to_host: usize,
}

impl DeviceStats {
    /// Copies in either direction.
    pub fn copies(&self) -> usize {
        self.host_to_device + self.device_to_host
    }
}

#[derive(Clone, Copy)]
enum Fault {
    Allocation,
    Transfer,
}

#[derive(Debug, Default)]
struct Faults {
    allocations: usize,
    transfers: usize,
}

/// Device collaborator backed by host memory.
pub struct HostDevice {
    name: String,
    arena: Mutex<HashMap<DevicePtr, Vec<u8>>>,
    next: AtomicU64,
    capacity: Option<usize>,
    stats: Mutex<DeviceStats>,
    faults: Mutex<Faults>,
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDevice {
    pub fn new() -> Self {
        Self {
            name: "host".to_string(),
            arena: Mutex::new(HashMap::new()),
            next: AtomicU64::new(1),
            capacity: None,
            stats: Mutex::new(DeviceStats::default()),
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Device refusing to hold more than `bytes` live bytes.
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            capacity: Some(bytes),
            ..Self::new()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Convenience: a fresh device behind an `Arc`.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn stats(&self) -> DeviceStats {
        *self.stats.lock()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = DeviceStats::default();
    }

    /// Make the next `allocate` call fail.
    pub fn fail_next_allocation(&self) {
        self.faults.lock().allocations += 1;
    }

    /// Make the next copy, in either direction, fail before moving any byte.
    pub fn fail_next_transfer(&self) {
        self.faults.lock().transfers += 1;
    }

    pub fn live_allocations(&self) -> usize {
        self.arena.lock().len()
    }

    pub fn live_bytes(&self) -> usize {
        self.arena.lock().values().map(Vec::len).sum()
    }

    pub fn is_live(&self, ptr: DevicePtr) -> bool {
        self.arena.lock().contains_key(&ptr)
    }

    /// Snapshot of an allocation's contents.
    pub fn read(&self, ptr: DevicePtr) -> Option<Vec<u8>> {
        self.arena.lock().get(&ptr).cloned()
    }

    /// Run `f` over an allocation's bytes, standing in for a kernel launch.
    ///
    /// Not counted as a transfer.
    pub fn with_memory_mut<R>(&self, ptr: DevicePtr, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        self.arena.lock().get_mut(&ptr).map(|mem| f(mem))
    }

    fn take_fault(&self, kind: Fault) -> bool {
        let mut faults = self.faults.lock();
        let pending = match kind {
            Fault::Allocation => &mut faults.allocations,
            Fault::Transfer => &mut faults.transfers,
        };
        if *pending > 0 {
            *pending -= 1;
            true
        } else {
            false
        }
    }

    /// Reject plans that would touch bytes outside either buffer.
    fn check_plan(
        direction: SyncDirection,
        plan: &TransferPlan,
        host_len: usize,
        device_len: usize,
    ) -> Result<()> {
        if plan.host_extent() > host_len {
            return Err(SyncError::Transfer {
                direction,
                reason: format!(
                    "plan reaches host byte {} of {host_len}",
                    plan.host_extent()
                ),
            });
        }
        if plan.device_extent() > device_len {
            return Err(SyncError::Transfer {
                direction,
                reason: format!(
                    "plan reaches device byte {} of {device_len}",
                    plan.device_extent()
                ),
            });
        }
        Ok(())
    }
}

impl DeviceAllocator for HostDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn allocate(&self, byte_len: usize) -> Result<DevicePtr> {
        if self.take_fault(Fault::Allocation) {
            return Err(SyncError::Allocation {
                bytes: byte_len,
                reason: "injected allocation failure".into(),
            });
        }

        let mut arena = self.arena.lock();
        if let Some(capacity) = self.capacity {
            let live: usize = arena.values().map(Vec::len).sum();
            if live + byte_len > capacity {
                return Err(SyncError::Allocation {
                    bytes: byte_len,
                    reason: format!("{live} of {capacity} bytes in use"),
                });
            }
        }

        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let ptr = DevicePtr(id << PAGE_SHIFT);
        arena.insert(ptr, vec![POISON; byte_len]);
        self.stats.lock().allocations += 1;
        debug!(device = %self.name, %ptr, byte_len, "host device allocate");
        Ok(ptr)
    }

    fn free(&self, ptr: DevicePtr) {
        let removed = self.arena.lock().remove(&ptr);
        let mut stats = self.stats.lock();
        if removed.is_some() {
            stats.frees += 1;
        } else {
            stats.invalid_frees += 1;
            warn!(device = %self.name, %ptr, "free of unknown device address");
        }
    }

    fn copy_host_to_device(&self, dst: DevicePtr, host: &[u8], plan: &TransferPlan) -> Result<()> {
        let direction = SyncDirection::HostToDevice;
        if self.take_fault(Fault::Transfer) {
            return Err(SyncError::Transfer {
                direction,
                reason: "injected transfer failure".into(),
            });
        }

        let mut arena = self.arena.lock();
        let mem = arena.get_mut(&dst).ok_or_else(|| SyncError::Transfer {
            direction,
            reason: format!("unknown device address {dst}"),
        })?;
        Self::check_plan(direction, plan, host.len(), mem.len())?;

        for span in plan.spans() {
            mem[span.device_offset..span.device_offset + span.len]
                .copy_from_slice(&host[span.host_offset..span.host_offset + span.len]);
        }

        let mut stats = self.stats.lock();
        stats.host_to_device += 1;
        stats.bytes_to_device += plan.total_bytes();
        Ok(())
    }

    fn copy_device_to_host(
        &self,
        src: DevicePtr,
        host: &mut [u8],
        plan: &TransferPlan,
    ) -> Result<()> {
        let direction = SyncDirection::DeviceToHost;
        if self.take_fault(Fault::Transfer) {
            return Err(SyncError::Transfer {
                direction,
                reason: "injected transfer failure".into(),
            });
        }

        let arena = self.arena.lock();
        let mem = arena.get(&src).ok_or_else(|| SyncError::Transfer {
            direction,
            reason: format!("unknown device address {src}"),
        })?;
        Self::check_plan(direction, plan, host.len(), mem.len())?;

        for span in plan.spans() {
            host[span.host_offset..span.host_offset + span.len]
                .copy_from_slice(&mem[span.device_offset..span.device_offset + span.len]);
        }

        let mut stats = self.stats.lock();
        stats.device_to_host += 1;
        stats.bytes_to_host += plan.total_bytes();
        Ok(())
    }
}

impl std::fmt::Debug for HostDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostDevice")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
