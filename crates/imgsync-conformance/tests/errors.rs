//! Failure paths: errors are classified and leave the manager usable.

use std::sync::Arc;

use imgsync_conformance::{bound_manager, device, iota_f32, region};
use imgsync_core::{
    DeviceAllocator, ErrorKind, Freshness, ImageSyncManager, SyncDirection, SyncError, SyncOptions,
};
use imgsync_host::HostDevice;

// ─── Device failures ────────────────────────────────────────────────────

#[test]
fn failed_first_upload_frees_fresh_allocation() {
    let _ = tracing_subscriber::fmt::try_init();
    let (dev, dyn_dev) = device();
    let cpu = region(&[0, 0], &[4, 4]);
    let mut m = bound_manager::<f32>(&dyn_dev, &cpu);
    let host = iota_f32(&cpu);
    m.mark_cpu_modified().unwrap();

    dev.fail_next_transfer();
    let err = m.make_gpu_buffer_up_to_date(&host).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transfer);
    assert!(matches!(
        err,
        SyncError::Transfer {
            direction: SyncDirection::HostToDevice,
            ..
        }
    ));
    assert!(!m.has_device_buffer());
    assert_eq!(m.freshness(), Freshness::GpuStale);
    assert_eq!(dev.live_allocations(), 0);
    assert_eq!(dev.stats().frees, 1);

    m.make_gpu_buffer_up_to_date(&host).unwrap();
    assert_eq!(m.freshness(), Freshness::BothCurrent);
    assert_eq!(dev.stats().host_to_device, 1);
}

#[test]
fn failed_reupload_keeps_buffer_and_staleness() {
    let (dev, dyn_dev) = device();
    let cpu = region(&[0], &[8]);
    let mut m = bound_manager::<u32>(&dyn_dev, &cpu);
    let mut host: Vec<u32> = (0..8).collect();
    m.make_gpu_buffer_up_to_date(&host).unwrap();
    let ptr = m.device_buffer_id().unwrap();

    host[0] = 100;
    m.mark_cpu_modified().unwrap();
    dev.fail_next_transfer();
    assert!(m.make_gpu_buffer_up_to_date(&host).is_err());
    assert_eq!(m.device_buffer_id(), Some(ptr));
    assert!(m.is_gpu_buffer_dirty());

    m.make_gpu_buffer_up_to_date(&host).unwrap();
    assert_eq!(&dev.read(ptr).unwrap()[..4], &100u32.to_ne_bytes());
}

#[test]
fn failed_download_leaves_host_stale() {
    let (dev, dyn_dev) = device();
    let cpu = region(&[0], &[4]);
    let mut m = bound_manager::<u8>(&dyn_dev, &cpu);
    let mut host = vec![1u8; 4];
    m.make_gpu_buffer_up_to_date(&host).unwrap();
    let ptr = m.device_buffer_id().unwrap();
    dev.with_memory_mut(ptr, |mem| mem.fill(7)).unwrap();
    m.mark_gpu_modified().unwrap();

    dev.fail_next_transfer();
    let err = m.make_cpu_buffer_up_to_date(&mut host).unwrap_err();
    assert!(matches!(
        err,
        SyncError::Transfer {
            direction: SyncDirection::DeviceToHost,
            ..
        }
    ));
    assert_eq!(host, vec![1; 4]);
    assert_eq!(m.freshness(), Freshness::CpuStale);

    m.make_cpu_buffer_up_to_date(&mut host).unwrap();
    assert_eq!(host, vec![7; 4]);
}

#[test]
fn failed_allocation_leaves_no_buffer() {
    let (dev, dyn_dev) = device();
    let cpu = region(&[0, 0], &[2, 2]);
    let mut m = bound_manager::<f32>(&dyn_dev, &cpu);
    let host = iota_f32(&cpu);

    dev.fail_next_allocation();
    let err = m.make_gpu_buffer_up_to_date(&host).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Allocation);
    assert!(!m.has_device_buffer());
    assert_eq!(dev.stats().copies(), 0);

    m.make_gpu_buffer_up_to_date(&host).unwrap();
    assert!(m.has_device_buffer());
    assert_eq!(dev.stats().allocations, 1);
}

#[test]
fn device_capacity_exhaustion_is_an_allocation_error() {
    let dev = Arc::new(HostDevice::with_capacity(32));
    let dyn_dev: Arc<dyn DeviceAllocator> = dev.clone();
    let mut m = bound_manager::<f32>(&dyn_dev, &region(&[0], &[16]));
    let err = m.make_gpu_buffer_up_to_date(&[0.0; 16]).unwrap_err();
    assert!(matches!(err, SyncError::Allocation { bytes: 64, .. }));
    assert_eq!(dev.live_bytes(), 0);
}

#[test]
fn device_budget_checked_before_allocating() {
    let (dev, dyn_dev) = device();
    let options = SyncOptions::default().with_max_device_bytes(32);
    let mut m = ImageSyncManager::<f32>::with_options(1, dyn_dev, options).unwrap();
    m.set_cpu_region(region(&[0], &[16])).unwrap();

    let err = m.make_gpu_buffer_up_to_date(&[0.0; 16]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Allocation);
    assert_eq!(dev.stats().allocations, 0);

    // A crop that fits the budget goes through.
    m.set_gpu_region(region(&[0], &[8])).unwrap();
    m.make_gpu_buffer_up_to_date(&[0.0; 16]).unwrap();
    assert_eq!(m.device_buffer_size(), 32);
}

// ─── Contract violations ────────────────────────────────────────────────

#[test]
fn zero_dimensions_rejected() {
    let (_dev, dyn_dev) = device();
    assert!(matches!(
        ImageSyncManager::<f32>::new(0, dyn_dev),
        Err(SyncError::InvalidDimension(0))
    ));
}

#[test]
fn region_dimension_mismatch_rejected() {
    let (_dev, dyn_dev) = device();
    let mut m = ImageSyncManager::<f32>::new(3, dyn_dev).unwrap();
    let err = m.set_cpu_region(region(&[0, 0], &[4, 4])).unwrap_err();
    assert!(matches!(
        err,
        SyncError::DimensionMismatch {
            expected: 3,
            got: 2
        }
    ));
    assert!(m.cpu_region().is_none());
}

#[test]
fn host_buffer_length_checked() {
    let (dev, dyn_dev) = device();
    let mut m = bound_manager::<f32>(&dyn_dev, &region(&[0, 0], &[4, 4]));
    let err = m.make_gpu_buffer_up_to_date(&[0.0; 15]).unwrap_err();
    assert!(matches!(
        err,
        SyncError::HostBufferMismatch {
            expected: 16,
            got: 15
        }
    ));
    assert_eq!(dev.stats().allocations, 0);
}

#[test]
fn unbound_manager_cannot_upload() {
    let (_dev, dyn_dev) = device();
    let mut m = ImageSyncManager::<f32>::new(2, dyn_dev).unwrap();
    assert!(matches!(
        m.make_gpu_buffer_up_to_date(&[]),
        Err(SyncError::NoImage)
    ));
    assert!(matches!(
        m.set_gpu_region(region(&[0, 0], &[1, 1])),
        Err(SyncError::NoImage)
    ));
    assert!(m.overlap().is_none());
}

#[test]
fn kernel_access_requires_buffer() {
    let (_dev, dyn_dev) = device();
    let m = bound_manager::<f32>(&dyn_dev, &region(&[0], &[4]));
    assert!(matches!(m.kernel_access(), Err(SyncError::NoDeviceBuffer)));
}

// ─── Buffer lifetime ────────────────────────────────────────────────────

#[test]
fn release_refuses_unsynced_device_writes() {
    let (dev, dyn_dev) = device();
    let mut m = bound_manager::<u8>(&dyn_dev, &region(&[0], &[4]));
    let mut host = vec![0u8; 4];
    m.make_gpu_buffer_up_to_date(&host).unwrap();
    m.mark_gpu_modified().unwrap();

    assert!(matches!(
        m.release_device_buffer(),
        Err(SyncError::UnsyncedDeviceWrites)
    ));
    assert!(m.has_device_buffer());

    m.make_cpu_buffer_up_to_date(&mut host).unwrap();
    m.release_device_buffer().unwrap();
    assert!(!m.has_device_buffer());
    assert_eq!(dev.live_allocations(), 0);
    assert_eq!(m.freshness(), Freshness::BothCurrent);
}

#[test]
fn region_change_refuses_unsynced_device_writes() {
    let (_dev, dyn_dev) = device();
    let mut m = bound_manager::<u8>(&dyn_dev, &region(&[0], &[4]));
    m.make_gpu_buffer_up_to_date(&[0; 4]).unwrap();
    m.mark_gpu_modified().unwrap();

    let err = m.set_cpu_region(region(&[0], &[8])).unwrap_err();
    assert!(matches!(err, SyncError::UnsyncedDeviceWrites));
    assert_eq!(m.cpu_region(), Some(&region(&[0], &[4])));
}

#[test]
fn region_change_with_synced_buffer_reallocates() {
    let (dev, dyn_dev) = device();
    let mut m = bound_manager::<u8>(&dyn_dev, &region(&[0], &[4]));
    m.make_gpu_buffer_up_to_date(&[0; 4]).unwrap();

    m.set_cpu_region(region(&[0], &[8])).unwrap();
    assert!(!m.has_device_buffer());
    assert_eq!(m.gpu_region(), Some(&region(&[0], &[8])));

    m.make_gpu_buffer_up_to_date(&[1; 8]).unwrap();
    assert_eq!(m.device_buffer_size(), 8);
    assert_eq!(dev.live_allocations(), 1);
}

#[test]
fn initialize_discards_buffer_and_history() {
    let (dev, dyn_dev) = device();
    let cpu = region(&[0], &[4]);
    let mut m = bound_manager::<u8>(&dyn_dev, &cpu);
    m.make_gpu_buffer_up_to_date(&[0; 4]).unwrap();
    m.mark_gpu_modified().unwrap();

    m.initialize();
    assert!(!m.has_device_buffer());
    assert_eq!(m.freshness(), Freshness::BothCurrent);
    assert_eq!(m.cpu_region(), Some(&cpu));
    assert_eq!(dev.live_allocations(), 0);
    m.mark_cpu_modified().unwrap();
}
