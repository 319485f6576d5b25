//! Clustered forward rendering demo
//!
//! A floor with rows of spheres and cubes lit by a grid of colored point
//! lights. Hold the right mouse button to look around and use WASD to move.
//!
//! ```text
//! cargo run --example clustered_scene -- --lights 256 --msaa 4
//! ```

use std::path::PathBuf;

use clap::Parser;
use glam::{Quat, Vec3};
use winit::event_loop::EventLoop;

use clustered_renderer::resources::{Material, MaterialSlot, Mesh, TextureData};
use clustered_renderer::scene::Transform;
use clustered_renderer::window::{self, Window};
use clustered_renderer::{Engine, FrameStatus, RendererConfig, Scene};

#[derive(Parser, Debug)]
#[command(
    name = "clustered_scene",
    about = "Clustered forward rendering demo",
    long_about = "Renders a scene lit by many point lights using a depth prepass, \
                  compute light clustering and clustered forward shading."
)]
struct Args {
    /// Initial window width in pixels.
    #[arg(long, default_value = "1280")]
    width: u32,

    /// Initial window height in pixels.
    #[arg(long, default_value = "720")]
    height: u32,

    /// Disable vertical sync (may cause tearing).
    #[arg(long)]
    no_vsync: bool,

    /// Number of point lights.
    #[arg(long, default_value = "128")]
    lights: u32,

    /// MSAA sample count (1, 2, 4 or 8), clamped to what the device supports.
    #[arg(long, default_value = "4")]
    msaa: u32,

    /// Frames the CPU may record ahead of the GPU.
    #[arg(long, default_value = "2")]
    frames_in_flight: u32,

    /// Image used as the albedo texture of the floor.
    #[arg(long)]
    floor_texture: Option<PathBuf>,

    /// Exit after rendering N frames.
    #[arg(long)]
    max_frames: Option<u64>,
}

fn build_scene(args: &Args) -> Result<Scene, Box<dyn std::error::Error>> {
    let mut scene = Scene::new();

    let floor_mesh = scene.add_mesh(Mesh::plane(40.0, 40.0, 4));
    let sphere = scene.add_mesh(Mesh::sphere(32, 16));
    let cube = scene.add_mesh(Mesh::cube());

    let mut floor_material = Material::rubber(Vec3::splat(0.6));
    if let Some(path) = &args.floor_texture {
        let texture = scene.add_texture(TextureData::from_file(path)?);
        floor_material = floor_material.with_texture(MaterialSlot::Albedo, texture);
    } else {
        let texture = scene.add_texture(TextureData::checkerboard(
            256,
            [200, 200, 200, 255],
            [90, 90, 90, 255],
        ));
        floor_material = floor_material.with_texture(MaterialSlot::Albedo, texture);
    }
    let floor_material = scene.add_material(floor_material)?;
    scene.add_object(floor_mesh, floor_material, Transform::new())?;

    let materials = [
        scene.add_material(Material::gold())?,
        scene.add_material(Material::copper())?,
        scene.add_material(Material::plastic(Vec3::new(0.2, 0.4, 0.9)))?,
        scene.add_material(Material::metal(Vec3::splat(0.9), 0.3))?,
    ];

    for row in 0..6 {
        for column in 0..6 {
            let position = Vec3::new(column as f32 * 3.0 - 7.5, 0.5, row as f32 * 3.0 - 7.5);
            let material = materials[(row + column) % materials.len()];
            let (mesh, transform) = if (row + column) % 2 == 0 {
                (sphere, Transform::from_position(position))
            } else {
                (
                    cube,
                    Transform::from_position_rotation(
                        position,
                        Quat::from_rotation_y(0.4 * column as f32),
                    ),
                )
            };
            scene.add_object(mesh, material, transform)?;
        }
    }

    scene.set_directional_light(Vec3::new(-0.3, -1.0, -0.2), Vec3::new(1.0, 0.95, 0.9), 0.1);

    let side = (args.lights as f32).sqrt().ceil().max(1.0) as u32;
    let spacing = 20.0 / side as f32;
    for i in 0..args.lights {
        let (x, z) = (i % side, i / side);
        let base = Vec3::new(
            x as f32 * spacing - 10.0 + spacing * 0.5,
            1.0,
            z as f32 * spacing - 10.0 + spacing * 0.5,
        );
        let hue = i as f32 / args.lights as f32;
        let color = Vec3::new(
            (hue * std::f32::consts::TAU).sin() * 0.5 + 0.5,
            (hue * std::f32::consts::TAU + 2.1).sin() * 0.5 + 0.5,
            (hue * std::f32::consts::TAU + 4.2).sin() * 0.5 + 0.5,
        );
        scene.add_point_light(base, color, spacing * 1.5, 2.0);
    }

    Ok(scene)
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = RendererConfig::default()
        .with_title("Clustered Renderer")
        .with_size(args.width, args.height)
        .with_vsync(!args.no_vsync)
        .with_msaa_samples(args.msaa)
        .with_frames_in_flight(args.frames_in_flight)
        .with_max_point_lights(args.lights.max(1));
    config.validate()?;

    let scene = build_scene(&args)?;
    log::info!(
        "Scene: {} objects, {} point lights",
        scene.objects().len(),
        scene.point_light_count()
    );

    let event_loop = EventLoop::new()?;
    let mut window = Window::new(&event_loop, &config.title, config.width, config.height)?;
    let mut engine = Engine::new(&window, &config, scene)?;
    {
        let camera = engine.camera_mut();
        camera.position = Vec3::new(0.0, 4.0, 14.0);
        camera.pitch = -15.0;
        camera.pan(0.0, 0.0, true);
    }

    let mut presented = 0u64;
    let mut failure = None;
    window::run(event_loop, &mut window, |window| {
        match engine.frame(window) {
            Ok(FrameStatus::Presented) => presented += 1,
            Ok(FrameStatus::Skipped) => {}
            Err(e) => {
                failure = Some(e);
                return false;
            }
        }
        args.max_frames.map_or(true, |max| presented < max)
    })?;

    engine.shutdown()?;
    log::info!("Presented {} frames", presented);
    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
