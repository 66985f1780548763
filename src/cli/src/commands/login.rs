//! `cimage login` command - verify and store registry credentials.

use std::io::BufRead;

use clap::Args;

use cimage_core::config::CimageConfig;
use cimage_store::distribution;

#[derive(Args)]
pub struct LoginArgs {
    /// Registry server (e.g., "localhost:5000")
    pub server: String,

    /// Username
    #[arg(short, long)]
    pub username: Option<String>,

    /// Password
    #[arg(short, long)]
    pub password: Option<String>,

    /// Read password from stdin
    #[arg(long)]
    pub password_stdin: bool,
}

pub async fn execute(args: LoginArgs, config: &CimageConfig) -> Result<(), Box<dyn std::error::Error>> {
    let username = match args.username {
        Some(u) => u,
        None => prompt("Username: ")?,
    };

    let password = if args.password_stdin {
        read_line()?
    } else {
        match args.password {
            Some(p) => p,
            None => prompt("Password: ")?,
        }
    };

    if username.is_empty() || password.is_empty() {
        return Err("Username and password are required".into());
    }

    let store = super::credential_store(config);
    distribution::login(&args.server, &username, &password, &config.registry, &store).await?;

    println!("Login Succeeded");
    Ok(())
}

fn prompt(label: &str) -> std::io::Result<String> {
    eprint!("{label}");
    read_line()
}

fn read_line() -> std::io::Result<String> {
    let mut input = String::new();
    std::io::stdin().lock().read_line(&mut input)?;
    Ok(input.trim().to_string())
}
