//! `cimage rmi` command - remove one or more images from the index.

use clap::Args;

use cimage_core::config::CimageConfig;
use cimage_core::platform::Platform;

#[derive(Args)]
pub struct RmiArgs {
    /// Image names to remove
    #[arg(required = true)]
    pub images: Vec<String>,

    /// Only remove this platform variant (default: all variants)
    #[arg(long)]
    pub platform: Option<Platform>,

    /// Ignore images that do not exist
    #[arg(short, long)]
    pub force: bool,
}

pub async fn execute(args: RmiArgs, config: &CimageConfig) -> Result<(), Box<dyn std::error::Error>> {
    let (images, _) = super::open_stores(config)?;

    let mut errors: Vec<String> = Vec::new();

    for name in &args.images {
        match images.delete_by_name(name, args.platform.as_ref()) {
            Ok(()) => println!("Untagged: {name}"),
            Err(e) if args.force && e.is_not_found() => continue,
            Err(e) => errors.push(format!("{name}: {e}")),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        let msg = errors.join("\n");
        Err(format!("Failed to remove image(s):\n{msg}").into())
    }
}
