//! # Culling Pipeline Tests
//!
//! Drives the full culler (lifecycle, command stream, append counter and
//! indirect draw) against the software device.

use std::sync::Arc;

use glam::Vec3;
use instacull_rendering::{
    culling::classify, CameraState, CullError, CullerConfig, CullerState, CullingParameters,
    FrameCommand, FrameOutcome, Frustum, GpuBackend, InstanceRecord, InstancedCuller, MeshGeometry,
    PopulationSource, Requirement, SoftwareBackend,
};

const WHITE: [f32; 4] = [1.0, 1.0, 1.0, 1.0];

fn origin_camera() -> CameraState {
    CameraState::perspective(Vec3::ZERO, Vec3::Z, Vec3::Y, 60f32.to_radians(), 1.0, 0.3, 500.0)
}

fn orbit_camera() -> CameraState {
    CameraState::perspective(
        Vec3::new(30.0, 12.0, -40.0),
        Vec3::new(-0.5, -0.2, 1.0).normalize(),
        Vec3::Y,
        60f32.to_radians(),
        16.0 / 9.0,
        0.3,
        70.0,
    )
}

/// Culler whose mesh has a bounding radius of exactly 1.
fn unit_radius_culler(config: CullerConfig) -> InstancedCuller<SoftwareBackend> {
    let mut backend = SoftwareBackend::new();
    let mut mesh = backend.upload_mesh(&MeshGeometry::cube(0.5));
    mesh.bounds_extents = [1.0, 0.0, 0.0];
    let material = backend.load_material();
    let program = backend.load_culling_program();
    let config = config
        .with_mesh(mesh)
        .with_material(material)
        .with_program(program);
    InstancedCuller::new(backend, config)
}

fn explicit(records: Vec<InstanceRecord>) -> CullerConfig {
    CullerConfig::default().with_population(PopulationSource::Explicit(Arc::from(records)))
}

fn random(count: u32, area_size: f32, seed: u64) -> CullerConfig {
    CullerConfig {
        area_size,
        population: PopulationSource::Random { seed },
        ..CullerConfig::default()
    }
    .with_instance_count(count)
}

fn sorted_keys(records: &[InstanceRecord]) -> Vec<[u32; 8]> {
    let mut keys: Vec<_> = records.iter().map(InstanceRecord::sort_key).collect();
    keys.sort_unstable();
    keys
}

fn last_draw_count(culler: &InstancedCuller<SoftwareBackend>) -> u32 {
    culler
        .backend()
        .last_draw()
        .expect("a draw was recorded")
        .arguments
        .instance_count
}

/// Test: only the instance in front of the camera survives.
#[test]
fn test_three_instance_scenario() {
    let records = vec![
        InstanceRecord::new(0.0, 0.0, 0.0, WHITE),
        InstanceRecord::new(1000.0, 0.0, 0.0, WHITE),
        InstanceRecord::new(0.0, 0.0, -1000.0, WHITE),
    ];
    let mut culler = unit_radius_culler(explicit(records.clone()));

    let outcome = culler.run_frame(&origin_camera()).unwrap();
    assert_eq!(outcome, FrameOutcome::Drawn { groups: 1 });

    let draw = culler.backend().last_draw().unwrap();
    assert_eq!(draw.arguments.instance_count, 1);
    assert_eq!(draw.instances, vec![records[0]]);
}

/// Test: a zero distance bound culls everything, every frame.
#[test]
fn test_zero_max_distance_draws_nothing() {
    let mut culler = unit_radius_culler(random(2000, 50.0, 1));
    let mut camera = origin_camera();
    camera.far_clip = 0.0;

    for _ in 0..3 {
        culler.run_frame(&camera).unwrap();
        assert_eq!(last_draw_count(&culler), 0);
    }
    assert_eq!(culler.backend().draw_count(), 3);
}

/// Test: a frustum no point can satisfy yields an empty visible set.
#[test]
fn test_degenerate_frustum_draws_nothing() {
    let mut culler = unit_radius_culler(random(500, 20.0, 2));
    let mut camera = origin_camera();
    camera.frustum = Frustum::from_arrays([[0.0, 0.0, 0.0, -10.0]; 6]);

    culler.run_frame(&camera).unwrap();
    assert_eq!(last_draw_count(&culler), 0);
    assert!(culler.backend().last_draw().unwrap().instances.is_empty());
}

/// Test: the drawn count equals the number of instances the reference rule accepts,
/// and the drawn set is exactly that subset.
#[test]
fn test_count_and_set_match_reference_rule() {
    let mut culler = unit_radius_culler(random(20_000, 200.0, 42));
    let camera = orbit_camera();
    culler.run_frame(&camera).unwrap();

    let resources = culler.resources().unwrap();
    let records = culler
        .backend()
        .buffer_records(resources.pool().buffer())
        .unwrap()
        .to_vec();
    let uniforms = CullingParameters::from_camera(&camera, resources.instance_radius()).to_uniforms();
    let expected: Vec<InstanceRecord> = records
        .iter()
        .copied()
        .filter(|r| classify(&uniforms, r.world_position()).is_visible())
        .collect();

    let draw = culler.backend().last_draw().unwrap();
    assert!(!expected.is_empty());
    assert!(expected.len() < records.len());
    assert_eq!(draw.arguments.instance_count as usize, expected.len());
    assert_eq!(sorted_keys(&draw.instances), sorted_keys(&expected));
}

/// Test: instances clearly outside a plane are absent; spheres fully inside are present.
#[test]
fn test_containment() {
    let inside = InstanceRecord::new(0.0, 0.0, 50.0, WHITE);
    let behind = InstanceRecord::new(0.0, 0.0, -5.0, WHITE);
    let far_left = InstanceRecord::new(-200.0, 0.0, 50.0, WHITE);
    let above = InstanceRecord::new(0.0, 300.0, 100.0, WHITE);
    let beyond_far = InstanceRecord::new(0.0, 0.0, 600.0, WHITE);
    let mut culler = unit_radius_culler(explicit(vec![inside, behind, far_left, above, beyond_far]));

    culler.run_frame(&origin_camera()).unwrap();
    let draw = culler.backend().last_draw().unwrap();
    assert_eq!(draw.instances, vec![inside]);
}

/// Test: the visible count never exceeds the pool size.
#[test]
fn test_count_bounded_by_capacity() {
    let mut culler = unit_radius_culler(random(300, 10.0, 3));
    let camera = CameraState::perspective(
        Vec3::new(0.0, 50.0, 0.0),
        Vec3::NEG_Y,
        Vec3::Z,
        120f32.to_radians(),
        1.0,
        0.1,
        1000.0,
    );

    culler.run_frame(&camera).unwrap();
    let resources = culler.resources().unwrap();
    let count = last_draw_count(&culler);
    assert_eq!(count, 300);
    assert!(count <= resources.surface().capacity());
    assert_eq!(
        culler.backend().counter_value(resources.surface().buffer()),
        Some(count)
    );
}

/// Test: initializing twice gives the same sizes, arguments and visible set.
#[test]
fn test_reinitialization_is_idempotent() {
    let mut culler = unit_radius_culler(random(1000, 100.0, 5));
    let camera = orbit_camera();

    culler.initialize(&camera).unwrap();
    culler.run_frame(&camera).unwrap();
    let first_args = culler.resources().unwrap().arguments().initial();
    let first_set = sorted_keys(&culler.backend().last_draw().unwrap().instances);

    culler.initialize(&camera).unwrap();
    assert_eq!(culler.backend().live_buffer_count(), 3);
    culler.run_frame(&camera).unwrap();

    let resources = culler.resources().unwrap();
    assert_eq!(resources.pool().len(), 1000);
    assert_eq!(resources.surface().capacity(), 1000);
    assert_eq!(resources.arguments().initial(), first_args);
    assert_eq!(sorted_keys(&culler.backend().last_draw().unwrap().instances), first_set);
}

/// Test: changing the instance count resizes every buffer together.
#[test]
fn test_resize_reallocates_everything() {
    let mut culler = unit_radius_culler(random(100, 30.0, 6));
    let camera = origin_camera();
    culler.run_frame(&camera).unwrap();

    let config = culler.config().clone().with_instance_count(37);
    assert!(culler.reconfigure(config, &camera).unwrap());

    let resources = culler.resources().unwrap();
    let backend = culler.backend();
    assert_eq!(resources.pool().len(), 37);
    assert_eq!(resources.surface().capacity(), 37);
    assert_eq!(backend.buffer_size(resources.pool().buffer()), Some(37 * 32));
    assert_eq!(backend.buffer_size(resources.surface().buffer()), Some(37 * 32));
    assert_eq!(backend.live_buffer_count(), 3);

    let fresh = PopulationSource::Random { seed: 6 }.generate(37, 30.0).unwrap();
    assert_eq!(backend.buffer_records(resources.pool().buffer()).unwrap(), &fresh[..]);

    culler.run_frame(&camera).unwrap();
    let draw = culler.backend().last_draw().unwrap();
    assert!(draw.arguments.instance_count <= 37);
    assert!(draw.instances.iter().all(|record| fresh.contains(record)));
}

/// Test: missing mesh, missing compute support and a missing entry point skip the frame.
#[test]
fn test_missing_requirements_skip_frames() {
    let mut culler = unit_radius_culler(random(10, 10.0, 0));
    let mut config = culler.config().clone();
    config.render_mesh = None;
    assert!(culler.reconfigure(config, &origin_camera()).is_err());

    let outcome = culler.run_frame(&origin_camera()).unwrap();
    assert_eq!(
        outcome,
        FrameOutcome::Skipped {
            reason: CullError::MissingRequirement(Requirement::RenderMesh)
        }
    );
    assert_eq!(culler.state(), CullerState::Uninitialized);
    assert_eq!(culler.backend().submission_count(), 0);

    let mut culler = unit_radius_culler(random(10, 10.0, 0));
    culler.backend_mut().set_compute_supported(false);
    let outcome = culler.run_frame(&origin_camera()).unwrap();
    assert_eq!(
        outcome,
        FrameOutcome::Skipped {
            reason: CullError::MissingRequirement(Requirement::ComputeSupport)
        }
    );

    let mut culler = unit_radius_culler(random(10, 10.0, 0));
    let program = culler.backend_mut().load_program(&["CullEverything"]);
    let config = culler.config().clone().with_program(program);
    assert!(matches!(
        culler.reconfigure(config, &origin_camera()),
        Err(CullError::EntryPointNotFound(_))
    ));
    assert_eq!(culler.backend().live_buffer_count(), 0);
    assert_eq!(culler.backend().draw_count(), 0);
}

/// Test: a failed allocation leaves nothing behind, and the next frame retries.
#[test]
fn test_allocation_failure_rolls_back_then_retries() {
    let mut culler = unit_radius_culler(random(64, 10.0, 0));
    culler.backend_mut().set_allocation_budget(Some(2));

    assert!(matches!(
        culler.initialize(&origin_camera()),
        Err(CullError::AllocationFailed { .. })
    ));
    assert_eq!(culler.backend().live_buffer_count(), 0);
    assert_eq!(culler.state(), CullerState::Uninitialized);

    let outcome = culler.run_frame(&origin_camera()).unwrap();
    assert!(!outcome.is_drawn());
    assert_eq!(culler.stats().frames_skipped, 1);

    culler.backend_mut().set_allocation_budget(None);
    let outcome = culler.run_frame(&origin_camera()).unwrap();
    assert!(outcome.is_drawn());
    assert!(culler.is_ready());
    assert_eq!(culler.backend().live_buffer_count(), 3);
}

/// Test: a failed submission is reported for that frame only.
#[test]
fn test_submission_failure_keeps_ready() {
    let mut culler = unit_radius_culler(random(64, 10.0, 0));
    culler.initialize(&origin_camera()).unwrap();

    culler.backend_mut().fail_next_submit();
    assert!(matches!(
        culler.run_frame(&origin_camera()),
        Err(CullError::Submission(_))
    ));
    assert!(culler.is_ready());
    assert_eq!(culler.stats().submission_failures, 1);
    assert_eq!(culler.backend().draw_count(), 0);

    assert!(culler.run_frame(&origin_camera()).unwrap().is_drawn());
    assert_eq!(culler.stats().initializations, 1);
}

/// Test: each frame is reset, dispatch, counter copy, draw, in that order.
#[test]
fn test_frame_command_order() {
    let mut culler = unit_radius_culler(random(200, 10.0, 0));
    let camera = origin_camera();
    culler.run_frame(&camera).unwrap();

    let resources = culler.resources().unwrap();
    let surface = resources.surface().buffer();
    let arguments = resources.arguments().buffer();
    let commands = culler.backend().last_submission();

    assert_eq!(commands.len(), 4);
    assert_eq!(commands[0], FrameCommand::ResetCounter { buffer: surface });
    match commands[1] {
        FrameCommand::Dispatch { kernel, groups, uniforms } => {
            assert_eq!(kernel, resources.pass().kernel());
            assert_eq!(groups, [4, 1, 1]);
            assert_eq!(uniforms.max_distance, camera.far_clip);
        }
        other => panic!("expected dispatch, got {other:?}"),
    }
    assert_eq!(
        commands[2],
        FrameCommand::CopyCounter {
            source: surface,
            target: arguments,
            offset_bytes: 4
        }
    );
    assert!(matches!(
        commands[3],
        FrameCommand::DrawIndexedIndirect { arguments: a, .. } if a == arguments
    ));
}

/// Test: 65 instances need two workgroups, and the 65th is not lost.
#[test]
fn test_partial_last_workgroup() {
    let records: Vec<InstanceRecord> = (0..65)
        .map(|i| InstanceRecord::new((i % 5) as f32 - 2.0, 0.0, 20.0 + i as f32, WHITE))
        .collect();
    let mut culler = unit_radius_culler(explicit(records.clone()));

    let outcome = culler.run_frame(&origin_camera()).unwrap();
    assert_eq!(outcome, FrameOutcome::Drawn { groups: 2 });
    assert_eq!(last_draw_count(&culler), 65);
    assert_eq!(
        sorted_keys(&culler.backend().last_draw().unwrap().instances),
        sorted_keys(&records)
    );
}

/// Test: the counter is reset each frame and the other arguments are never touched.
#[test]
fn test_counter_reset_between_frames() {
    let mut culler = unit_radius_culler(random(500, 40.0, 8));
    let camera = CameraState::perspective(
        Vec3::new(0.0, 100.0, 0.0),
        Vec3::NEG_Y,
        Vec3::Z,
        100f32.to_radians(),
        1.0,
        0.1,
        1000.0,
    );
    culler.run_frame(&camera).unwrap();
    assert_eq!(last_draw_count(&culler), 500);

    let mut blind = camera;
    blind.far_clip = 0.0;
    culler.run_frame(&blind).unwrap();
    assert_eq!(last_draw_count(&culler), 0);

    let initial = culler.resources().unwrap().arguments().initial();
    let current = culler.backend().last_draw().unwrap().arguments;
    assert_eq!(current.index_count, 36);
    assert_eq!(current.index_count, initial.index_count);
    assert_eq!(current.start_index, initial.start_index);
    assert_eq!(current.base_vertex, initial.base_vertex);
    assert_eq!(current.start_instance, 0);
}

/// Test: dropping the culler releases its buffers.
#[test]
fn test_release_on_drop() {
    let mut culler = unit_radius_culler(random(32, 10.0, 0));
    culler.initialize(&origin_camera()).unwrap();
    assert_eq!(culler.backend().live_buffer_count(), 3);

    culler.release();
    assert_eq!(culler.backend().live_buffer_count(), 0);
    assert!(culler.run_frame(&origin_camera()).unwrap().is_drawn());
    assert_eq!(culler.backend().live_buffer_count(), 3);
    drop(culler);
}
