//! `cimage prune` command - reclaim unreferenced image specs and layers.

use clap::Args;

use cimage_core::config::CimageConfig;

use crate::output;

#[derive(Args)]
pub struct PruneArgs {
    /// Only print the reclaimed size
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: PruneArgs, config: &CimageConfig) -> Result<(), Box<dyn std::error::Error>> {
    let (images, layers) = super::open_stores(config)?;
    let report = cimage_store::prune(&images, &layers)?;

    if !args.quiet {
        for id in &report.removed_images {
            println!("Deleted image: {}", output::short_id(id));
        }
        for id in &report.removed_layers {
            println!("Deleted layer: {id}");
        }
    }
    println!(
        "Total reclaimed space: {}",
        output::format_bytes(report.reclaimed_bytes)
    );
    Ok(())
}
