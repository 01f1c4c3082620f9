//! The image side of the contract.
//!
//! [`HostImage`] is what a manager needs from its owner. [`SyncedImage`] is a
//! reference owner: host pixels in a `Vec`, plus the manager that keeps them
//! coherent with the device. It syncs before every host read, marks the host
//! modified on every mutable borrow and marks the device modified after every
//! kernel run.

use std::sync::Arc;

use bytemuck::Pod;

use crate::config::SyncOptions;
use crate::device::DeviceAllocator;
use crate::kernel::KernelAccess;
use crate::manager::ImageSyncManager;
use crate::region::RegionDescriptor;
use crate::{Result, SyncError};

/// An image owning host pixel storage for its buffered region.
pub trait HostImage {
    type Pixel: Pod;

    /// Region materialized by the host buffer.
    fn buffered_region(&self) -> RegionDescriptor;

    fn host_buffer(&self) -> &[Self::Pixel];

    fn host_buffer_mut(&mut self) -> &mut [Self::Pixel];
}

/// Host pixels paired with their coherence manager.
#[derive(Debug)]
pub struct SyncedImage<T: Pod> {
    region: RegionDescriptor,
    pixels: Vec<T>,
    manager: ImageSyncManager<T>,
}

impl<T: Pod> SyncedImage<T> {
    /// Zero-filled image over `region`.
    pub fn new(region: RegionDescriptor, device: Arc<dyn DeviceAllocator>) -> Result<Self> {
        Self::with_options(region, device, SyncOptions::default())
    }

    pub fn with_options(
        region: RegionDescriptor,
        device: Arc<dyn DeviceAllocator>,
        options: SyncOptions,
    ) -> Result<Self> {
        let pixels = vec![T::zeroed(); region.num_elements()];
        Self::build(region, pixels, device, options)
    }

    /// Image over `region` holding `pixels` (dimension-0-fastest).
    pub fn from_pixels(
        region: RegionDescriptor,
        pixels: Vec<T>,
        device: Arc<dyn DeviceAllocator>,
    ) -> Result<Self> {
        Self::build(region, pixels, device, SyncOptions::default())
    }

    fn build(
        region: RegionDescriptor,
        pixels: Vec<T>,
        device: Arc<dyn DeviceAllocator>,
        options: SyncOptions,
    ) -> Result<Self> {
        if pixels.len() != region.num_elements() {
            return Err(SyncError::HostBufferMismatch {
                expected: region.num_elements(),
                got: pixels.len(),
            });
        }
        let mut manager = ImageSyncManager::with_options(region.ndim(), device, options)?;
        manager.set_cpu_region(region.clone())?;
        let mut image = Self {
            region,
            pixels,
            manager,
        };
        // Initial pixels are host-only until the first upload.
        image.manager.mark_cpu_modified()?;
        Ok(image)
    }

    pub fn region(&self) -> &RegionDescriptor {
        &self.region
    }

    /// Host pixels, pulled back from the device first if they are stale.
    pub fn buffer(&mut self) -> Result<&[T]> {
        self.manager.make_cpu_buffer_up_to_date(&mut self.pixels)?;
        Ok(&self.pixels)
    }

    /// Mutable host pixels. The device copy is considered stale afterwards.
    pub fn buffer_mut(&mut self) -> Result<&mut [T]> {
        self.manager.make_cpu_buffer_up_to_date(&mut self.pixels)?;
        self.manager.mark_cpu_modified()?;
        Ok(&mut self.pixels)
    }

    /// Make sure the device holds the current pixels.
    pub fn upload(&mut self) -> Result<()> {
        self.manager.make_gpu_buffer_up_to_date(&self.pixels)
    }

    /// Run a device kernel over the image.
    ///
    /// Uploads first, hands `kernel` the launch capability, then marks the
    /// device copy modified. A failing kernel leaves freshness untouched.
    pub fn run_kernel<R>(
        &mut self,
        kernel: impl FnOnce(&KernelAccess<'_>) -> Result<R>,
    ) -> Result<R> {
        self.upload()?;
        let out = {
            let access = self.manager.kernel_access()?;
            kernel(&access)?
        };
        self.manager.mark_gpu_modified()?;
        Ok(out)
    }

    /// Resize to `region`. Pixels are zeroed; the device buffer follows.
    pub fn set_region(&mut self, region: RegionDescriptor) -> Result<()> {
        if region == self.region {
            return Ok(());
        }
        self.manager.make_cpu_buffer_up_to_date(&mut self.pixels)?;
        self.manager.set_cpu_region(region.clone())?;
        self.pixels = vec![T::zeroed(); region.num_elements()];
        self.region = region;
        self.manager.mark_cpu_modified()
    }

    /// Take over `other`'s pixels and alias its device buffer.
    ///
    /// Both images must share geometry. The receiver's own pixels, including
    /// host writes never uploaded, are replaced by a copy of `other`'s.
    pub fn graft(&mut self, other: &SyncedImage<T>) -> Result<()> {
        if self.region != other.region {
            return Err(SyncError::InvalidGraft(format!(
                "source region {} differs from receiver region {}",
                other.region, self.region
            )));
        }
        self.manager.graft_replacing_host(&other.manager)?;
        self.pixels.clone_from(&other.pixels);
        Ok(())
    }

    pub fn manager(&self) -> &ImageSyncManager<T> {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut ImageSyncManager<T> {
        &mut self.manager
    }
}

impl<T: Pod> HostImage for SyncedImage<T> {
    type Pixel = T;

    fn buffered_region(&self) -> RegionDescriptor {
        self.region.clone()
    }

    fn host_buffer(&self) -> &[T] {
        &self.pixels
    }

    fn host_buffer_mut(&mut self) -> &mut [T] {
        &mut self.pixels
    }
}
