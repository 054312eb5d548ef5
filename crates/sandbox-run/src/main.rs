//! Renders a project directory off-screen and writes the final frame as a
//! PNG. Mostly a smoke-test harness for the engine.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use sandbox_engine::Engine;
use sandbox_project::{load_dir, PassName};

#[derive(Debug, Parser)]
#[command(name = "sandbox-run", about = "Render a shader project to a PNG")]
struct Cli {
    /// Project directory containing project.json.
    project: PathBuf,

    #[arg(long, default_value_t = 800)]
    width: u32,

    #[arg(long, default_value_t = 450)]
    height: u32,

    /// Number of frames to step before capturing, so feedback buffers have
    /// content.
    #[arg(long, default_value_t = 60)]
    frames: u32,

    /// Output image path.
    #[arg(long, default_value = "frame.png")]
    output: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let project = load_dir(&cli.project)
        .with_context(|| format!("failed to load project at {}", cli.project.display()))?;
    let mut engine = Engine::new(project, cli.width, cli.height)
        .context("failed to initialize the render engine")?;

    for error in engine.compilation_errors() {
        tracing::error!(%error, "pass failed to compile");
    }

    for frame in 0..cli.frames.max(1) {
        engine.step(frame as f32 / 60.0);
    }

    let pixels = engine
        .read_pixels(PassName::Image, 0, 0, cli.width, cli.height)
        .context("pixel readback failed")?;
    // read_pixels returns rows bottom-up; image files want top-down.
    let mut top_down = Vec::with_capacity(pixels.len());
    let row_bytes = (cli.width * 4) as usize;
    for row in pixels.chunks_exact(row_bytes).rev() {
        top_down.extend_from_slice(row);
    }
    let frame = image::RgbaImage::from_raw(cli.width, cli.height, top_down)
        .context("frame dimensions did not match the readback buffer")?;
    frame
        .save(&cli.output)
        .with_context(|| format!("failed to write {}", cli.output.display()))?;

    tracing::info!(
        frames = cli.frames,
        output = %cli.output.display(),
        "render complete"
    );
    Ok(())
}
