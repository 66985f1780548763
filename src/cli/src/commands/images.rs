//! `cimage images` command.

use clap::Args;

use cimage_core::config::CimageConfig;
use cimage_store::ImageSummary;

use crate::output;

#[derive(Args)]
pub struct ImagesArgs {
    /// Only show image IDs (one per line)
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: ImagesArgs, config: &CimageConfig) -> Result<(), Box<dyn std::error::Error>> {
    let (images, _) = super::open_stores(config)?;
    let rows = images.list()?;

    if args.quiet {
        for row in &rows {
            println!("{}", row.descriptor.id);
        }
        return Ok(());
    }

    let mut table = output::new_table(&["NAME", "PLATFORM", "IMAGE ID", "SIZE", "CREATED"]);
    for row in &rows {
        table.add_row(cells(row));
    }

    println!("{table}");
    Ok(())
}

fn cells(row: &ImageSummary) -> Vec<String> {
    vec![
        row.name.clone(),
        row.descriptor.platform.to_string(),
        output::short_id(&row.descriptor.id).to_string(),
        output::format_bytes(row.descriptor.size),
        output::format_ago(&row.descriptor.created_at),
    ]
}
