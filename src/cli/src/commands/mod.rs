//! CLI command definitions and dispatch.

mod images;
mod inspect;
mod login;
mod logout;
mod prune;
mod pull;
mod push;
mod rmi;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use cimage_core::config::{CimageConfig, LogLevel, StoreConfig};
use cimage_store::distribution::CredentialStore;
use cimage_store::{Backend, FsBackend, ImageStore, LayerStore};

/// cimage - content-addressed image store and registry client.
#[derive(Parser)]
#[command(name = "cimage", version, about)]
pub struct Cli {
    /// Root directory of the local store (default: ~/.cimage)
    #[arg(long, global = true)]
    pub data_root: Option<PathBuf>,

    /// YAML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level: debug, info, warn, error
    #[arg(long, global = true)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// List stored images
    Images(images::ImagesArgs),
    /// Display an image spec as JSON
    Inspect(inspect::InspectArgs),
    /// Pull an image from a registry
    Pull(pull::PullArgs),
    /// Push a stored image to a registry
    Push(push::PushArgs),
    /// Remove one or more images from the index
    Rmi(rmi::RmiArgs),
    /// Remove image specs and layers no image references
    Prune(prune::PruneArgs),
    /// Store registry credentials
    Login(login::LoginArgs),
    /// Remove stored registry credentials
    Logout(logout::LogoutArgs),
}

/// Load the configuration file (if any) and apply command-line overrides.
pub fn load_config(cli: &Cli) -> Result<CimageConfig, Box<dyn std::error::Error>> {
    let mut config = CimageConfig::load_or_default(cli.config.as_deref())?;
    if let Some(root) = &cli.data_root {
        config.store = StoreConfig::new(root);
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    Ok(config)
}

/// Open the image and layer stores under the configured data root.
pub(crate) fn open_stores(
    config: &CimageConfig,
) -> Result<(ImageStore, Arc<LayerStore>), Box<dyn std::error::Error>> {
    tracing::debug!(root = %config.store.data_root.display(), "Opening stores");
    let backend: Arc<dyn Backend> = Arc::new(FsBackend::open(config.store.clone())?);
    let layers = Arc::new(LayerStore::new(backend.clone())?);
    Ok((ImageStore::new(backend), layers))
}

/// Open the credential store under the configured data root.
pub(crate) fn credential_store(config: &CimageConfig) -> CredentialStore {
    CredentialStore::new(config.store.auth_file())
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli, config: CimageConfig) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Images(args) => images::execute(args, &config).await,
        Command::Inspect(args) => inspect::execute(args, &config).await,
        Command::Pull(args) => pull::execute(args, &config).await,
        Command::Push(args) => push::execute(args, &config).await,
        Command::Rmi(args) => rmi::execute(args, &config).await,
        Command::Prune(args) => prune::execute(args, &config).await,
        Command::Login(args) => login::execute(args, &config).await,
        Command::Logout(args) => logout::execute(args, &config).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "cimage",
            "images",
            "--data-root",
            "/tmp/store",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.data_root, Some(PathBuf::from("/tmp/store")));
        assert_eq!(cli.log_level, Some(LogLevel::Debug));
        assert!(matches!(cli.command, Command::Images(_)));
    }

    #[test]
    fn test_parse_rejects_unknown_log_level() {
        let result = Cli::try_parse_from(["cimage", "--log-level", "loud", "images"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_pull_with_platform() {
        let cli = Cli::try_parse_from([
            "cimage",
            "pull",
            "localhost:5000/app:v1",
            "--platform",
            "linux/arm64",
        ])
        .unwrap();
        match cli.command {
            Command::Pull(args) => {
                assert_eq!(args.image, "localhost:5000/app:v1");
                let platform = args.platform.unwrap();
                assert_eq!(platform.os, "linux");
                assert_eq!(platform.architecture, "arm64");
            }
            _ => panic!("expected pull"),
        }
    }

    #[test]
    fn test_parse_rmi_requires_a_name() {
        assert!(Cli::try_parse_from(["cimage", "rmi"]).is_err());
    }

    #[test]
    fn test_load_config_data_root_override() {
        let dir = TempDir::new().unwrap();
        let cli = Cli::try_parse_from([
            "cimage",
            "--data-root",
            dir.path().to_str().unwrap(),
            "prune",
        ])
        .unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.store.data_root, dir.path());
        assert_eq!(config.store.auth_file(), dir.path().join("auth.json"));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cimage.yaml");
        std::fs::write(
            &path,
            format!(
                "store:\n  data_root: {}\nlog_level: info\n",
                dir.path().join("data").display()
            ),
        )
        .unwrap();
        let cli = Cli::try_parse_from(["cimage", "--config", path.to_str().unwrap(), "images"])
            .unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.log_level, LogLevel::Info);
    }

    #[tokio::test]
    async fn test_images_on_empty_store() {
        let dir = TempDir::new().unwrap();
        let cli = Cli::try_parse_from([
            "cimage",
            "--data-root",
            dir.path().to_str().unwrap(),
            "images",
            "-q",
        ])
        .unwrap();
        let config = load_config(&cli).unwrap();
        dispatch(cli, config).await.unwrap();
        assert!(dir.path().join("layers").is_dir());
    }
}
