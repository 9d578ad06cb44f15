// lwr - A click-through image overlay for Wayland
// Displays an image on the overlay layer, anchored to the edges of an output

mod cli;
mod error;
mod geometry;
mod image_loader;
mod packer;
mod scaler;
mod shm;
mod signal;
mod wayland;

use anyhow::Result;
use error::OverlayError;
use log::info;
use scaler::ScaledImage;
use signal::ShutdownSignal;
use wayland::{SessionConfig, Shutdown};

fn main() {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run() {
        eprintln!("lwr: error: {err:#}");
        let code = err
            .downcast_ref::<OverlayError>()
            .map_or(1, OverlayError::exit_code);
        std::process::exit(code);
    }
}

fn run() -> Result<()> {
    // Block the shutdown signals before any library can spawn a thread
    let shutdown = ShutdownSignal::install()?;

    // Parse command line arguments
    let args = cli::parse_args()?;

    // Load the image
    let source = image_loader::load_image(&args.image_path)?;
    let (width, height) = source.dimensions();
    info!("Loaded image {} ({}x{})", args.image_path.display(), width, height);

    // Resolve the overlay size and scale once
    let geometry = geometry::resolve(args.width, args.height, width, height)?;
    let image = ScaledImage::new(source, geometry)?;
    info!("Overlay size: {}x{}", geometry.width, geometry.height);

    let config = SessionConfig {
        anchor: args.anchor,
        margin: args.margin,
        output: args.output,
        namespace: args.namespace,
    };

    match wayland::run(image, config, shutdown)? {
        Shutdown::Signal(name) => info!("Stopped by {}", name),
        Shutdown::Closed => info!("Compositor closed the overlay"),
    }

    Ok(())
}
