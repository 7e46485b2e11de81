//! # INSTACULL Demo
//!
//! Headless host for the culler. Scatters instances on a disc, orbits a
//! camera around it and submits one culled indirect draw per frame.
//!
//! ```text
//! instacull_demo [--config <PATH>] [--frames <N>] [--software]
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use glam::Vec3;
use instacull_rendering::pipeline::RENDER_SHADER_SOURCE;
use instacull_rendering::culling::CULL_SHADER_SOURCE;
use instacull_rendering::{
    CameraState, CullError, CullResult, CullerConfig, CullerSettings, GpuBackend, InstancedCuller,
    MeshGeometry, SoftwareBackend, WgpuBackend,
};

const DEFAULT_FRAMES: u32 = 120;
const TARGET_WIDTH: u32 = 1280;
const TARGET_HEIGHT: u32 = 720;
const CUBE_HALF_EXTENT: f32 = 0.5;

#[derive(Debug, Default)]
struct Options {
    config: Option<PathBuf>,
    frames: Option<u32>,
    software: bool,
    help: bool,
}

impl Options {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self, String> {
        let mut options = Self::default();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    let path = args.next().ok_or("--config needs a path")?;
                    options.config = Some(PathBuf::from(path));
                }
                "--frames" => {
                    let value = args.next().ok_or("--frames needs a number")?;
                    let frames = value
                        .parse()
                        .map_err(|_| format!("--frames: not a number: {value}"))?;
                    options.frames = Some(frames);
                }
                "--software" => options.software = true,
                "--help" | "-h" => options.help = true,
                other => return Err(format!("unknown argument: {other}")),
            }
        }
        Ok(options)
    }
}

fn print_usage() {
    println!("Usage: instacull_demo [--config <PATH>] [--frames <N>] [--software]");
    println!();
    println!("  --config <PATH>   TOML settings (instance_count, area_size, radius_multiplier, seed)");
    println!("  --frames <N>      Frames to run (default {DEFAULT_FRAMES})");
    println!("  --software        Skip the GPU and run on the software device");
}

/// Camera circling the population at a fixed height, looking at the centre.
fn orbit_camera(frame: u32, frames: u32, area_size: f32) -> CameraState {
    let radius = area_size.max(1.0) * 0.75;
    let angle = std::f32::consts::TAU * frame as f32 / frames.max(1) as f32;
    let position = Vec3::new(radius * angle.cos(), radius * 0.25, radius * angle.sin());
    let forward = (Vec3::ZERO - position).normalize_or_zero();
    let aspect = TARGET_WIDTH as f32 / TARGET_HEIGHT as f32;
    CameraState::perspective(position, forward, Vec3::Y, 60f32.to_radians(), aspect, 0.3, radius * 1.5)
}

/// Runs the frames and prints statistics. `visible` reads back the drawn
/// count for the summary only; the frame path itself never reads it.
fn drive<B: GpuBackend>(
    culler: &mut InstancedCuller<B>,
    frames: u32,
    area_size: f32,
    visible: impl Fn(&InstancedCuller<B>) -> Option<u32>,
) {
    let started = Instant::now();
    let mut failures = 0u32;
    for frame in 0..frames {
        let camera = orbit_camera(frame, frames, area_size);
        match culler.run_frame(&camera) {
            Ok(outcome) if !outcome.is_drawn() => {
                tracing::debug!("Frame {frame} skipped: {outcome:?}");
            }
            Ok(_) => {}
            Err(error) => {
                failures += 1;
                eprintln!("   ✗ Frame {frame}: {error}");
            }
        }
    }
    let elapsed = started.elapsed();

    let stats = culler.stats();
    println!();
    println!("═══════════════════════════════════════════════════════════════════");
    println!("                         RUN STATISTICS");
    println!("═══════════════════════════════════════════════════════════════════");
    println!("  Frames drawn:        {}", stats.frames_drawn);
    println!("  Frames skipped:      {}", stats.frames_skipped);
    println!("  Submission failures: {failures}");
    println!("  Instances:           {}", stats.instance_count);
    println!("  Workgroups/dispatch: {}", stats.groups_per_dispatch);
    println!("  Resident memory:     {:.2} MiB", stats.resident_bytes as f64 / (1024.0 * 1024.0));
    println!("  Draw ratio:          {:.1}%", stats.draw_ratio() * 100.0);
    println!("  Wall time:           {:.2?} ({:.1} frames/s)", elapsed, f64::from(frames) / elapsed.as_secs_f64().max(1e-9));
    match visible(culler) {
        Some(count) => println!("  Visible (last frame): {count}"),
        None => println!("  Visible (last frame): unavailable"),
    }
    println!("═══════════════════════════════════════════════════════════════════");
}

fn run_software(settings: &CullerSettings, frames: u32) {
    println!("🖥️  Backend: software device");
    let mut backend = SoftwareBackend::new();
    let mesh = backend.upload_mesh(&MeshGeometry::cube(CUBE_HALF_EXTENT));
    let material = backend.load_material();
    let program = backend.load_culling_program();
    let config = CullerConfig::from_settings(settings)
        .with_mesh(mesh)
        .with_material(material)
        .with_program(program);

    let mut culler = InstancedCuller::new(backend, config);
    drive(&mut culler, frames, settings.area_size, |culler| {
        culler
            .backend()
            .last_draw()
            .map(|draw| draw.arguments.instance_count)
    });
}

fn build_gpu_culler(settings: &CullerSettings) -> CullResult<InstancedCuller<WgpuBackend>> {
    let mut backend = pollster::block_on(WgpuBackend::headless(TARGET_WIDTH, TARGET_HEIGHT))?;
    let mesh = backend.upload_mesh(&MeshGeometry::cube(CUBE_HALF_EXTENT));
    let material = backend.load_material("instacull.unlit", RENDER_SHADER_SOURCE)?;
    let program = backend.load_program("instacull.cull", CULL_SHADER_SOURCE)?;
    let config = CullerConfig::from_settings(settings)
        .with_mesh(mesh)
        .with_material(material)
        .with_program(program);
    Ok(InstancedCuller::new(backend, config))
}

fn run_gpu(settings: &CullerSettings, frames: u32) -> CullResult<()> {
    let mut culler = build_gpu_culler(settings)?;
    println!("🎮 Backend: wgpu");
    drive(&mut culler, frames, settings.area_size, |culler| {
        let arguments = culler.resources()?.arguments().buffer();
        culler
            .backend()
            .read_draw_arguments_blocking(arguments)
            .ok()
            .map(|arguments| arguments.instance_count)
    });
    Ok(())
}

fn main() -> ExitCode {
    let options = match Options::parse(std::env::args().skip(1)) {
        Ok(options) => options,
        Err(message) => {
            eprintln!("✗ {message}");
            print_usage();
            return ExitCode::FAILURE;
        }
    };
    if options.help {
        print_usage();
        return ExitCode::SUCCESS;
    }

    println!("═══════════════════════════════════════════════════════════════════");
    println!("                    INSTACULL DEMO v{}", env!("CARGO_PKG_VERSION"));
    println!("              GPU-DRIVEN FRUSTUM CULLING, HEADLESS");
    println!("═══════════════════════════════════════════════════════════════════");

    let settings = match &options.config {
        Some(path) => match CullerSettings::load(path) {
            Ok(settings) => settings,
            Err(error) => {
                eprintln!("✗ {error}");
                return ExitCode::FAILURE;
            }
        },
        None => CullerSettings::default(),
    };
    let frames = options.frames.unwrap_or(DEFAULT_FRAMES);

    println!();
    println!("  Instances:         {}", settings.instance_count);
    println!("  Area size:         {}", settings.area_size);
    println!("  Radius multiplier: {}", settings.radius_multiplier);
    println!("  Seed:              {}", settings.seed);
    println!("  Frames:            {frames}");
    println!();

    if options.software {
        run_software(&settings, frames);
        return ExitCode::SUCCESS;
    }

    match run_gpu(&settings, frames) {
        Ok(()) => {}
        Err(error @ CullError::DeviceUnavailable(_)) => {
            tracing::warn!("Falling back to the software device: {}", error);
            println!("⚠️  {error}; falling back to the software device");
            run_software(&settings, frames);
        }
        Err(error) => {
            eprintln!("✗ {error}");
            return ExitCode::FAILURE;
        }
    }
    ExitCode::SUCCESS
}
