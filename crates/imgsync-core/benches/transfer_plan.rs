use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use imgsync_core::{RegionDescriptor, TransferPlan};

fn bench_transfer_plan(c: &mut Criterion) {
    let cases: &[(&[usize], &[i64], &[usize], &str)] = &[
        (&[512, 512], &[0, 0], &[512, 512], "full_512x512"),
        (&[512, 512], &[128, 128], &[256, 256], "crop_256x256"),
        (&[64, 64, 64], &[0, 0, 0], &[64, 64, 64], "full_64x64x64"),
        (&[64, 64, 64], &[8, 8, 8], &[32, 32, 32], "crop_32x32x32"),
    ];

    let mut group = c.benchmark_group("transfer_plan_f32");

    for &(image, gpu_index, gpu_size, name) in cases {
        let origin = vec![0i64; image.len()];
        let cpu = RegionDescriptor::new(&origin, image).expect("cpu region");
        let gpu = RegionDescriptor::new(gpu_index, gpu_size).expect("gpu region");
        let overlap = cpu.overlap(&gpu).expect("same rank");
        group.throughput(Throughput::Elements(overlap.num_elements() as u64));

        for coalesce in [true, false] {
            let id = if coalesce { "coalesced" } else { "per_row" };
            group.bench_function(BenchmarkId::new(id, name), |bench| {
                bench.iter(|| {
                    let plan = TransferPlan::new(&cpu, &gpu, &overlap, 4, coalesce);
                    std::hint::black_box(plan.total_bytes())
                });
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_transfer_plan);
criterion_main!(benches);
