//! Capability handed to kernel executors.

use crate::device::DevicePtr;
use crate::region::RegionDescriptor;

/// Narrow view of a manager's device buffer for kernel launches.
///
/// Exposes the device pointer, its byte length and the GPU region, nothing
/// else. Holding one borrows the manager immutably, so no synchronization can
/// run while a kernel is being prepared. Issuing it never changes freshness:
/// an executor that writes device memory must call
/// [`crate::ImageSyncManager::mark_gpu_modified`] once the capability is dropped.
#[derive(Debug)]
pub struct KernelAccess<'a> {
    ptr: DevicePtr,
    byte_len: usize,
    region: &'a RegionDescriptor,
}

impl<'a> KernelAccess<'a> {
    pub(crate) fn new(ptr: DevicePtr, byte_len: usize, region: &'a RegionDescriptor) -> Self {
        Self {
            ptr,
            byte_len,
            region,
        }
    }

    pub fn device_ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    pub fn region(&self) -> &RegionDescriptor {
        self.region
    }
}
