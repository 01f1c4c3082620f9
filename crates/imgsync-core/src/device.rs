//! Device collaborator interface and the shared device buffer handle.
//!
//! A [`DeviceAllocator`] owns the raw primitives (allocate, free, copy in,
//! copy out). A [`DeviceBuffer`] owns one allocation and frees it when
//! dropped; managers hold it behind an `Arc` so grafted managers alias the
//! same memory and the last one out releases it.

use std::sync::Arc;

use tracing::debug;

use crate::Result;
use crate::transfer::TransferPlan;

/// Opaque device address issued by a [`DeviceAllocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(pub u64);

impl std::fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Low-level device memory and transfer engine.
///
/// Implementations report exhaustion as [`crate::SyncError::Allocation`] and
/// failed copies as [`crate::SyncError::Transfer`]; the manager propagates
/// both unchanged. Copies are synchronous: they complete before returning.
pub trait DeviceAllocator: Send + Sync {
    /// Human-readable name for logs.
    fn name(&self) -> &str;

    /// Allocate `byte_len` bytes of device memory.
    fn allocate(&self, byte_len: usize) -> Result<DevicePtr>;

    /// Release an allocation. Called exactly once per successful `allocate`.
    fn free(&self, ptr: DevicePtr);

    /// Copy the spans of `plan` from `host` into the allocation at `dst`.
    fn copy_host_to_device(&self, dst: DevicePtr, host: &[u8], plan: &TransferPlan) -> Result<()>;

    /// Copy the spans of `plan` from the allocation at `src` into `host`.
    fn copy_device_to_host(
        &self,
        src: DevicePtr,
        host: &mut [u8],
        plan: &TransferPlan,
    ) -> Result<()>;
}

/// Whether two allocator handles refer to the same device collaborator.
pub(crate) fn same_device(a: &Arc<dyn DeviceAllocator>, b: &Arc<dyn DeviceAllocator>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// One device allocation, freed on drop.
pub struct DeviceBuffer {
    ptr: DevicePtr,
    byte_len: usize,
    device: Arc<dyn DeviceAllocator>,
}

impl DeviceBuffer {
    /// Allocate `byte_len` bytes on `device`.
    pub fn allocate(device: Arc<dyn DeviceAllocator>, byte_len: usize) -> Result<Self> {
        let ptr = device.allocate(byte_len)?;
        debug!(device = device.name(), %ptr, byte_len, "allocated device buffer");
        Ok(Self {
            ptr,
            byte_len,
            device,
        })
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    pub fn device(&self) -> &Arc<dyn DeviceAllocator> {
        &self.device
    }

    pub(crate) fn upload(&self, host: &[u8], plan: &TransferPlan) -> Result<()> {
        self.device.copy_host_to_device(self.ptr, host, plan)
    }

    pub(crate) fn download(&self, host: &mut [u8], plan: &TransferPlan) -> Result<()> {
        self.device.copy_device_to_host(self.ptr, host, plan)
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        debug!(device = self.device.name(), ptr = %self.ptr, "freeing device buffer");
        self.device.free(self.ptr);
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &self.ptr)
            .field("byte_len", &self.byte_len)
            .field("device", &self.device.name())
            .finish()
    }
}
