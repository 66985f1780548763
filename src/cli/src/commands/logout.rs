//! `cimage logout` command - forget stored registry credentials.

use clap::Args;

use cimage_core::config::CimageConfig;
use cimage_store::distribution;

#[derive(Args)]
pub struct LogoutArgs {
    /// Registry server
    pub server: String,
}

pub async fn execute(args: LogoutArgs, config: &CimageConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = super::credential_store(config);
    if distribution::logout(&args.server, &store)? {
        println!("Removing login credentials for {}", args.server);
    } else {
        println!("Not logged in to {}", args.server);
    }
    Ok(())
}
