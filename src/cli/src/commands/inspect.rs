//! `cimage inspect` command - print an image spec as JSON.

use clap::Args;

use cimage_core::config::CimageConfig;
use cimage_core::platform::Platform;

#[derive(Args)]
pub struct InspectArgs {
    /// Image name
    pub name: String,

    /// Platform variant to show (default: host platform)
    #[arg(long)]
    pub platform: Option<Platform>,
}

pub async fn execute(args: InspectArgs, config: &CimageConfig) -> Result<(), Box<dyn std::error::Error>> {
    let (images, _) = super::open_stores(config)?;
    let platform = args.platform.unwrap_or_else(Platform::host);
    let image = images.get_by_name(&args.name, &platform)?;

    println!("{}", serde_json::to_string_pretty(&image)?);
    Ok(())
}
