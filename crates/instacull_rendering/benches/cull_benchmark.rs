//! Benchmark for the culling rule and full software frames.
//!
//! TARGET: 400,000 instances culled and drawn in under 10 ms on the software device
//!
//! Run with: cargo bench --package instacull_rendering --bench cull_benchmark

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use glam::Vec3;
use instacull_rendering::culling::classify;
use instacull_rendering::{
    CameraState, CullerConfig, CullingParameters, InstancedCuller, MeshGeometry, PopulationSource,
    SoftwareBackend,
};

fn camera() -> CameraState {
    CameraState::perspective(
        Vec3::new(0.0, 40.0, -150.0),
        Vec3::new(0.0, -0.2, 1.0).normalize(),
        Vec3::Y,
        60f32.to_radians(),
        16.0 / 9.0,
        0.3,
        250.0,
    )
}

fn culler(count: u32) -> InstancedCuller<SoftwareBackend> {
    let mut backend = SoftwareBackend::new();
    let mesh = backend.upload_mesh(&MeshGeometry::cube(0.5));
    let material = backend.load_material();
    let program = backend.load_culling_program();
    let config = CullerConfig {
        area_size: 400.0,
        population: PopulationSource::Random { seed: 42 },
        ..CullerConfig::default()
    }
    .with_mesh(mesh)
    .with_material(material)
    .with_program(program)
    .with_instance_count(count);
    InstancedCuller::new(backend, config)
}

fn benchmark_classify(c: &mut Criterion) {
    let uniforms = CullingParameters::from_camera(&camera(), 0.87).to_uniforms();

    c.bench_function("classify_single_instance", |b| {
        let mut x = 0.0f32;
        b.iter(|| {
            x += 0.1;
            black_box(classify(&uniforms, black_box(Vec3::new(x % 200.0, 0.0, x % 150.0))))
        });
    });
}

fn benchmark_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("software_frame");
    group.sample_size(10);

    for count in [10_000u32, 100_000, 400_000] {
        let mut culler = culler(count);
        let camera = camera();
        if culler.initialize(&camera).is_err() {
            continue;
        }
        group.throughput(Throughput::Elements(u64::from(count)));
        group.bench_function(format!("{count}_instances"), |b| {
            b.iter(|| black_box(culler.run_frame(&camera)));
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_classify, benchmark_frames);
criterion_main!(benches);
