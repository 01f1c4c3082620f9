//! The CPU/device coherence manager.
//!
//! An [`ImageSyncManager`] belongs to exactly one image. It records the
//! image's CPU region, the (possibly cropped) GPU region, which side is
//! current, and a shared handle to the device buffer. The image lends its host
//! buffer to each synchronization call; the manager copies the overlap of the
//! two regions only when the requested side is stale.
//!
//! Managers are not internally synchronized. Every mutating operation takes
//! `&mut self`, so concurrent use of one manager needs external serialization.

use std::marker::PhantomData;
use std::sync::Arc;

use bytemuck::Pod;
use tracing::{debug, trace, warn};

use crate::config::SyncOptions;
use crate::device::{DeviceAllocator, DeviceBuffer, DevicePtr, same_device};
use crate::freshness::{Freshness, FreshnessState, Side};
use crate::image::HostImage;
use crate::kernel::KernelAccess;
use crate::region::RegionDescriptor;
use crate::transfer::{SyncDirection, TransferPlan};
use crate::{Result, SyncError};

/// Keeps one image's host buffer and device buffer coherent.
pub struct ImageSyncManager<T: Pod> {
    ndim: usize,
    device: Arc<dyn DeviceAllocator>,
    options: SyncOptions,
    cpu_region: Option<RegionDescriptor>,
    gpu_region: Option<RegionDescriptor>,
    /// The GPU region was set explicitly and no longer follows the CPU region.
    gpu_region_cropped: bool,
    freshness: FreshnessState,
    buffer: Option<Arc<DeviceBuffer>>,
    _pixel: PhantomData<fn() -> T>,
}

impl<T: Pod> ImageSyncManager<T> {
    /// Create a manager for `ndim`-dimensional images on `device`.
    pub fn new(ndim: usize, device: Arc<dyn DeviceAllocator>) -> Result<Self> {
        Self::with_options(ndim, device, SyncOptions::default())
    }

    pub fn with_options(
        ndim: usize,
        device: Arc<dyn DeviceAllocator>,
        options: SyncOptions,
    ) -> Result<Self> {
        if ndim == 0 {
            return Err(SyncError::InvalidDimension(ndim));
        }
        Ok(Self {
            ndim,
            device,
            options,
            cpu_region: None,
            gpu_region: None,
            gpu_region_cropped: false,
            freshness: FreshnessState::new(),
            buffer: None,
            _pixel: PhantomData,
        })
    }

    // ── Binding ─────────────────────────────────────────────────────────

    /// Bind to `image`, copying its buffered-region geometry.
    ///
    /// Neither allocates device memory nor copies pixels.
    pub fn set_image<I>(&mut self, image: &I) -> Result<()>
    where
        I: HostImage<Pixel = T> + ?Sized,
    {
        self.set_cpu_region(image.buffered_region())
    }

    /// Record the CPU region directly.
    ///
    /// When the GPU region follows the CPU region, a geometry change drops
    /// the device buffer; it is reallocated on the next upload. A cropped GPU
    /// region is kept and must still intersect the new CPU region.
    pub fn set_cpu_region(&mut self, region: RegionDescriptor) -> Result<()> {
        self.check_ndim(region.ndim())?;
        if self.cpu_region.as_ref() == Some(&region) {
            return Ok(());
        }

        if self.gpu_region_cropped
            && let Some(gpu) = &self.gpu_region
            && !region.overlap(gpu).is_some_and(|o| !o.is_empty())
        {
            return Err(SyncError::RegionOutsideImage {
                cpu: region,
                gpu: gpu.clone(),
            });
        }

        let gpu_changes = !self.gpu_region_cropped && self.gpu_region.as_ref() != Some(&region);
        if gpu_changes && self.buffer.is_some() {
            self.ensure_no_unsynced_device_writes()?;
            self.drop_device_buffer();
        }

        debug!(ndim = self.ndim, region = %region, "bound image region");
        if !self.gpu_region_cropped {
            self.gpu_region = Some(region.clone());
        }
        self.cpu_region = Some(region);
        Ok(())
    }

    /// Restrict the device buffer to `region`, e.g. a cropped working set.
    ///
    /// The region must intersect the CPU region. Changing it drops the
    /// current device buffer.
    pub fn set_gpu_region(&mut self, region: RegionDescriptor) -> Result<()> {
        self.check_ndim(region.ndim())?;
        let cpu = self.cpu_region.as_ref().ok_or(SyncError::NoImage)?;
        let intersects = cpu.overlap(&region).is_some_and(|o| !o.is_empty());
        if !intersects {
            return Err(SyncError::RegionOutsideImage {
                cpu: cpu.clone(),
                gpu: region,
            });
        }

        if self.gpu_region.as_ref() != Some(&region) && self.buffer.is_some() {
            self.ensure_no_unsynced_device_writes()?;
            self.drop_device_buffer();
        }

        debug!(region = %region, "set device region");
        self.gpu_region = Some(region);
        self.gpu_region_cropped = true;
        Ok(())
    }

    // ── Freshness ───────────────────────────────────────────────────────

    /// The host buffer was written; the device copy is now stale.
    pub fn mark_cpu_modified(&mut self) -> Result<()> {
        self.freshness.mark_cpu_modified()
    }

    /// Device memory was written; the host copy is now stale.
    pub fn mark_gpu_modified(&mut self) -> Result<()> {
        if self.buffer.is_none() {
            return Err(SyncError::NoDeviceBuffer);
        }
        self.freshness.mark_gpu_modified()
    }

    pub fn freshness(&self) -> Freshness {
        self.freshness.state()
    }

    pub fn freshness_state(&self) -> &FreshnessState {
        &self.freshness
    }

    /// The host copy is behind the device copy.
    pub fn is_cpu_buffer_dirty(&self) -> bool {
        self.freshness.is_cpu_stale()
    }

    /// The device copy is behind the host copy.
    pub fn is_gpu_buffer_dirty(&self) -> bool {
        self.freshness.is_gpu_stale()
    }

    // ── Synchronization ─────────────────────────────────────────────────

    /// Bring `host` up to date with the device, copying only if it is stale.
    pub fn make_cpu_buffer_up_to_date(&mut self, host: &mut [T]) -> Result<()> {
        debug_assert!(self.freshness.is_consistent());
        if !self.freshness.is_cpu_stale() {
            trace!("host buffer already current");
            return Ok(());
        }

        let (cpu, gpu) = self.regions()?;
        check_host_len(host.len(), cpu)?;
        let buffer = self.buffer.as_ref().ok_or(SyncError::NoDeviceBuffer)?;

        let plan = self.plan(cpu, gpu);
        if !plan.is_empty() {
            buffer
                .download(bytemuck::cast_slice_mut(host), &plan)
                .inspect_err(|e| warn!(error = %e, "device-to-host transfer failed"))?;
        }
        debug!(
            ptr = %buffer.ptr(),
            bytes = plan.total_bytes(),
            spans = plan.spans().len(),
            "synchronized host buffer"
        );
        self.freshness.complete_sync();
        Ok(())
    }

    /// Bring the device buffer up to date with `host`.
    ///
    /// Allocates the device buffer on first use, sized to the GPU region. A
    /// fresh allocation is always filled from the host.
    pub fn make_gpu_buffer_up_to_date(&mut self, host: &[T]) -> Result<()> {
        debug_assert!(self.freshness.is_consistent());
        if self.buffer.is_some() && !self.freshness.is_gpu_stale() {
            trace!("device buffer already current");
            return Ok(());
        }

        let (cpu, gpu) = self.regions()?;
        check_host_len(host.len(), cpu)?;
        let plan = self.plan(cpu, gpu);

        let buffer = match &self.buffer {
            Some(buffer) => Arc::clone(buffer),
            None => Arc::new(self.allocate_device_buffer(gpu)?),
        };

        // A failed upload into a fresh allocation drops it with `buffer`.
        if !plan.is_empty() {
            buffer
                .upload(bytemuck::cast_slice(host), &plan)
                .inspect_err(|e| warn!(error = %e, "host-to-device transfer failed"))?;
        }
        debug!(
            ptr = %buffer.ptr(),
            bytes = plan.total_bytes(),
            spans = plan.spans().len(),
            "synchronized device buffer"
        );
        self.buffer = Some(buffer);
        self.freshness.complete_sync();
        Ok(())
    }

    /// Synchronize in whichever direction the timestamps call for.
    ///
    /// Returns the direction of the copy performed, if any.
    pub fn update(&mut self, host: &mut [T]) -> Result<Option<SyncDirection>> {
        match self.freshness.pending_direction() {
            Some(SyncDirection::HostToDevice) => {
                self.make_gpu_buffer_up_to_date(host)?;
                Ok(Some(SyncDirection::HostToDevice))
            }
            Some(SyncDirection::DeviceToHost) => {
                self.make_cpu_buffer_up_to_date(host)?;
                Ok(Some(SyncDirection::DeviceToHost))
            }
            None => Ok(None),
        }
    }

    // ── Aliasing ────────────────────────────────────────────────────────

    /// Share `other`'s device buffer, regions and freshness.
    ///
    /// The device buffer is aliased, not copied. A buffer this manager held
    /// alone is released first, unless it carries writes never copied back.
    /// Fails with [`SyncError::UnsyncedHostWrites`] if the host side holds
    /// writes never uploaded: the adopted freshness would hide them.
    pub fn graft(&mut self, other: &ImageSyncManager<T>) -> Result<()> {
        self.graft_inner(other, true)
    }

    /// Graft for an owner that replaces its host pixels with the source's,
    /// so pending host writes are discarded along with the pixels.
    pub(crate) fn graft_replacing_host(&mut self, other: &ImageSyncManager<T>) -> Result<()> {
        self.graft_inner(other, false)
    }

    fn graft_inner(&mut self, other: &ImageSyncManager<T>, keep_host: bool) -> Result<()> {
        self.check_ndim(other.ndim)?;
        if !same_device(&self.device, &other.device) {
            return Err(SyncError::InvalidGraft(format!(
                "source is bound to device {}, receiver to {}",
                other.device.name(),
                self.device.name()
            )));
        }

        if let Some(own) = &self.buffer {
            let aliased = other.buffer.as_ref().is_some_and(|b| Arc::ptr_eq(b, own));
            if !aliased
                && Arc::strong_count(own) == 1
                && self.freshness.has_unsynced_writes(Side::Gpu)
            {
                return Err(SyncError::UnsyncedDeviceWrites);
            }
        }
        if keep_host && self.freshness.has_unsynced_writes(Side::Cpu) {
            return Err(SyncError::UnsyncedHostWrites);
        }

        self.buffer = other.buffer.clone();
        self.cpu_region = other.cpu_region.clone();
        self.gpu_region = other.gpu_region.clone();
        self.gpu_region_cropped = other.gpu_region_cropped;
        self.freshness = other.freshness;
        debug!(
            ptr = ?self.device_buffer_id(),
            owners = self.device_buffer_owners(),
            state = %self.freshness.state(),
            "grafted device buffer"
        );
        Ok(())
    }

    /// Whether both managers alias the same device allocation.
    pub fn shares_device_buffer_with(&self, other: &ImageSyncManager<T>) -> bool {
        match (&self.buffer, &other.buffer) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    // ── Device buffer ───────────────────────────────────────────────────

    /// Issue the kernel-launch capability for the current device buffer.
    ///
    /// Does not change freshness. Call [`Self::mark_gpu_modified`] after a
    /// kernel writes device memory.
    pub fn kernel_access(&self) -> Result<KernelAccess<'_>> {
        let buffer = self.buffer.as_ref().ok_or(SyncError::NoDeviceBuffer)?;
        let region = self.gpu_region.as_ref().ok_or(SyncError::NoImage)?;
        Ok(KernelAccess::new(buffer.ptr(), buffer.byte_len(), region))
    }

    /// Drop this manager's reference to the device buffer.
    ///
    /// Fails if the device holds writes the host never received.
    pub fn release_device_buffer(&mut self) -> Result<()> {
        if self.buffer.is_none() {
            return Ok(());
        }
        self.ensure_no_unsynced_device_writes()?;
        self.drop_device_buffer();
        Ok(())
    }

    /// Forget the device buffer and all freshness history.
    ///
    /// Region geometry is kept. Unsynchronized device writes are discarded.
    pub fn initialize(&mut self) {
        self.buffer = None;
        self.freshness.reset();
    }

    pub fn has_device_buffer(&self) -> bool {
        self.buffer.is_some()
    }

    /// Device address of the buffer; equal for grafted managers.
    pub fn device_buffer_id(&self) -> Option<DevicePtr> {
        self.buffer.as_ref().map(|b| b.ptr())
    }

    /// Size in bytes of the device buffer, 0 when none is allocated.
    pub fn device_buffer_size(&self) -> usize {
        self.buffer.as_ref().map_or(0, |b| b.byte_len())
    }

    /// Number of managers referencing the device buffer.
    pub fn device_buffer_owners(&self) -> usize {
        self.buffer.as_ref().map_or(0, Arc::strong_count)
    }

    // ── Geometry ────────────────────────────────────────────────────────

    pub fn ndim(&self) -> usize {
        self.ndim
    }

    pub fn cpu_region(&self) -> Option<&RegionDescriptor> {
        self.cpu_region.as_ref()
    }

    pub fn gpu_region(&self) -> Option<&RegionDescriptor> {
        self.gpu_region.as_ref()
    }

    /// Intersection of the CPU and GPU regions; bounds every transfer.
    pub fn overlap(&self) -> Option<RegionDescriptor> {
        let (cpu, gpu) = self.regions().ok()?;
        cpu.overlap(gpu)
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn device(&self) -> &Arc<dyn DeviceAllocator> {
        &self.device
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn check_ndim(&self, got: usize) -> Result<()> {
        if got != self.ndim {
            return Err(SyncError::DimensionMismatch {
                expected: self.ndim,
                got,
            });
        }
        Ok(())
    }

    fn regions(&self) -> Result<(&RegionDescriptor, &RegionDescriptor)> {
        match (&self.cpu_region, &self.gpu_region) {
            (Some(cpu), Some(gpu)) => Ok((cpu, gpu)),
            _ => Err(SyncError::NoImage),
        }
    }

    fn plan(&self, cpu: &RegionDescriptor, gpu: &RegionDescriptor) -> TransferPlan {
        let overlap = cpu.overlap(gpu).unwrap_or_else(|| gpu.clone());
        TransferPlan::new(
            cpu,
            gpu,
            &overlap,
            std::mem::size_of::<T>(),
            self.options.coalesce_transfers,
        )
    }

    fn allocate_device_buffer(&self, gpu: &RegionDescriptor) -> Result<DeviceBuffer> {
        if gpu.is_empty() {
            return Err(SyncError::EmptyRegion(gpu.clone()));
        }
        let bytes = gpu
            .num_elements()
            .checked_mul(std::mem::size_of::<T>())
            .ok_or_else(|| SyncError::Allocation {
                bytes: usize::MAX,
                reason: "buffer size overflow".into(),
            })?;
        if let Some(limit) = self.options.max_device_bytes
            && bytes > limit
        {
            return Err(SyncError::Allocation {
                bytes,
                reason: format!("exceeds device budget of {limit} bytes"),
            });
        }
        DeviceBuffer::allocate(Arc::clone(&self.device), bytes)
    }

    fn ensure_no_unsynced_device_writes(&self) -> Result<()> {
        if self.buffer.is_some() && self.freshness.has_unsynced_writes(Side::Gpu) {
            return Err(SyncError::UnsyncedDeviceWrites);
        }
        Ok(())
    }

    /// Release the buffer reference. Without a buffer there is nothing to be
    /// stale against, so freshness restarts from `BothCurrent`.
    fn drop_device_buffer(&mut self) {
        self.buffer = None;
        self.freshness.reset();
    }
}

fn check_host_len(got: usize, cpu: &RegionDescriptor) -> Result<()> {
    let expected = cpu.num_elements();
    if got != expected {
        return Err(SyncError::HostBufferMismatch { expected, got });
    }
    Ok(())
}

impl<T: Pod> std::fmt::Display for ImageSyncManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "ImageSyncManager ({}-D, {})", self.ndim, self.device.name())?;
        match &self.cpu_region {
            Some(r) => writeln!(f, "  cpu region: {r}")?,
            None => writeln!(f, "  cpu region: <unbound>")?,
        }
        match &self.gpu_region {
            Some(r) => writeln!(f, "  gpu region: {r}")?,
            None => writeln!(f, "  gpu region: <unbound>")?,
        }
        writeln!(f, "  freshness: {}", self.freshness.state())?;
        match &self.buffer {
            Some(b) => write!(
                f,
                "  device buffer: {} ({} bytes, {} owner(s))",
                b.ptr(),
                b.byte_len(),
                Arc::strong_count(b)
            ),
            None => write!(f, "  device buffer: <none>"),
        }
    }
}

impl<T: Pod> std::fmt::Debug for ImageSyncManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageSyncManager")
            .field("ndim", &self.ndim)
            .field("device", &self.device.name())
            .field("cpu_region", &self.cpu_region)
            .field("gpu_region", &self.gpu_region)
            .field("freshness", &self.freshness)
            .field("buffer", &self.buffer)
            .finish_non_exhaustive()
    }
}
