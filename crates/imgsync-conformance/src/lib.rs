//! Conformance fixtures for the coherence manager.
//!
//! Every suite under `tests/` drives an [`ImageSyncManager`] against a
//! [`HostDevice`], whose counters make copies and allocations observable.

use std::sync::Arc;

use bytemuck::Pod;
use imgsync_core::{DeviceAllocator, ImageSyncManager, RegionDescriptor};
use imgsync_host::HostDevice;

/// Region at `index` with extents `size`. Panics on mismatched arrays.
pub fn region(index: &[i64], size: &[usize]) -> RegionDescriptor {
    RegionDescriptor::new(index, size).expect("index and size must have equal, non-zero length")
}

/// A fresh host device, plus the same device as a trait object.
pub fn device() -> (Arc<HostDevice>, Arc<dyn DeviceAllocator>) {
    let dev = HostDevice::shared();
    let dyn_dev: Arc<dyn DeviceAllocator> = dev.clone();
    (dev, dyn_dev)
}

/// Manager bound to `cpu` on `device`.
pub fn bound_manager<T: Pod>(
    device: &Arc<dyn DeviceAllocator>,
    cpu: &RegionDescriptor,
) -> ImageSyncManager<T> {
    let mut m = ImageSyncManager::new(cpu.ndim(), Arc::clone(device)).expect("manager");
    m.set_cpu_region(cpu.clone()).expect("bind region");
    m
}

/// `0, 1, 2, ...` as `f32`, one value per element of `region`.
pub fn iota_f32(region: &RegionDescriptor) -> Vec<f32> {
    (0..region.num_elements()).map(|i| i as f32).collect()
}

/// Decode a device snapshot as `f32` values.
pub fn as_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Host elements lying inside `inner`, in `outer`'s layout.
pub fn elements_in<T: Copy>(
    outer: &RegionDescriptor,
    data: &[T],
    inner: &RegionDescriptor,
) -> Vec<T> {
    let mut out = Vec::with_capacity(inner.num_elements());
    for_each_point(inner, |p| {
        if let Some(off) = outer.linear_offset(p) {
            out.push(data[off]);
        }
    });
    out
}

/// Visit every point of `region` in dimension-0-fastest order.
pub fn for_each_point(region: &RegionDescriptor, mut f: impl FnMut(&[i64])) {
    if region.is_empty() {
        return;
    }
    let mut point = region.index().to_vec();
    for _ in 0..region.num_elements() {
        f(&point);
        for d in 0..region.ndim() {
            point[d] += 1;
            if point[d] < region.index()[d] + region.size()[d] as i64 {
                break;
            }
            point[d] = region.index()[d];
        }
    }
}
