//! `cimage push` command - push every platform of a stored image.

use clap::Args;

use cimage_core::config::CimageConfig;
use cimage_store::distribution::{self, ImageReference, Pusher};

#[derive(Args)]
pub struct PushArgs {
    /// Image name, which is also the target reference (e.g., "localhost:5000/app:v1")
    pub image: String,

    /// Suppress progress output
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: PushArgs, config: &CimageConfig) -> Result<(), Box<dyn std::error::Error>> {
    let (images, layers) = super::open_stores(config)?;
    let reference = ImageReference::parse(&args.image)?;
    let registry = distribution::connect(&reference, &config.registry, &super::credential_store(config))?;

    if !args.quiet {
        println!("Pushing {}...", args.image);
    }

    let result = Pusher::new(registry, images, layers).push(&args.image).await?;

    if args.quiet {
        println!("{}", result.digest);
    } else {
        println!(
            "Pushed: {} ({}, {} platform(s), {} layer(s) uploaded, {} reused)",
            result.reference, result.digest, result.platforms, result.uploaded, result.reused
        );
    }
    Ok(())
}
