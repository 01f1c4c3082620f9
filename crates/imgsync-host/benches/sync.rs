use std::sync::Arc;

use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use imgsync_core::{DeviceAllocator, ImageSyncManager, RegionDescriptor};
use imgsync_host::HostDevice;

fn bound(device: &Arc<dyn DeviceAllocator>, cpu: &RegionDescriptor) -> ImageSyncManager<f32> {
    let mut m = ImageSyncManager::new(cpu.ndim(), Arc::clone(device)).expect("manager");
    m.set_cpu_region(cpu.clone()).expect("bind region");
    m
}

fn bench_round_trip(c: &mut Criterion) {
    let shapes: &[(&[usize], &str)] = &[
        (&[256, 256], "256x256"),
        (&[1024, 1024], "1024x1024"),
        (&[64, 64, 64], "64x64x64"),
    ];

    let device: Arc<dyn DeviceAllocator> = Arc::new(HostDevice::new());
    let mut group = c.benchmark_group("host_device_round_trip_f32");

    for &(size, name) in shapes {
        let origin = vec![0i64; size.len()];
        let cpu = RegionDescriptor::new(&origin, size).expect("region");
        let elements = cpu.num_elements();
        group.throughput(Throughput::Bytes((elements * 2 * 4) as u64));

        let data: Vec<f32> = (0..elements).map(|i| i as f32 * 0.5).collect();

        group.bench_function(BenchmarkId::new("upload_download", name), |bench| {
            bench.iter_batched(
                || {
                    let mut m = bound(&device, &cpu);
                    m.make_gpu_buffer_up_to_date(&data).expect("allocate");
                    (m, data.clone())
                },
                |(mut m, mut host)| {
                    m.mark_cpu_modified().expect("mark cpu");
                    m.make_gpu_buffer_up_to_date(&host).expect("upload");
                    m.mark_gpu_modified().expect("mark gpu");
                    m.make_cpu_buffer_up_to_date(&mut host).expect("download");
                },
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

fn bench_noop_sync(c: &mut Criterion) {
    let device: Arc<dyn DeviceAllocator> = Arc::new(HostDevice::new());
    let cpu = RegionDescriptor::new(&[0, 0], &[512, 512]).expect("region");
    let mut host = vec![0.0f32; cpu.num_elements()];
    let mut m = bound(&device, &cpu);
    m.make_gpu_buffer_up_to_date(&host).expect("allocate");

    c.bench_function("already_current_512x512", |bench| {
        bench.iter(|| {
            m.make_gpu_buffer_up_to_date(&host).expect("noop upload");
            m.make_cpu_buffer_up_to_date(&mut host).expect("noop download");
        });
    });
}

criterion_group!(benches, bench_round_trip, bench_noop_sync);
criterion_main!(benches);
