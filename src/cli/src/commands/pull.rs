//! `cimage pull` command.

use clap::Args;

use cimage_core::config::CimageConfig;
use cimage_core::platform::Platform;
use cimage_store::distribution::{self, ImageReference, Puller};

#[derive(Args)]
pub struct PullArgs {
    /// Image reference (e.g., "localhost:5000/app:v1")
    pub image: String,

    /// Platform to pull (e.g., "linux/amd64"; default: host platform)
    #[arg(long)]
    pub platform: Option<Platform>,

    /// Suppress progress output
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: PullArgs, config: &CimageConfig) -> Result<(), Box<dyn std::error::Error>> {
    let (images, layers) = super::open_stores(config)?;
    let reference = ImageReference::parse(&args.image)?;
    let registry = distribution::connect(&reference, &config.registry, &super::credential_store(config))?;
    let platform = args.platform.unwrap_or_else(Platform::host);

    if !args.quiet {
        println!("Pulling {} ({})...", args.image, platform);
    }

    let image = Puller::new(registry, layers).pull(&args.image, &platform).await?;
    let id = images.save(&image)?;

    if args.quiet {
        println!("{id}");
    } else {
        println!("Pulled: {} ({})", args.image, id);
    }
    Ok(())
}
