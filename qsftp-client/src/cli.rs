//! QSFTP CLI implementation

use crate::client::{ClientConfig, QsftpClient};
use clap::{Parser, Subcommand};
use qsftp_core::Result;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// QSFTP Client - Quantum-Safe File Transfer Protocol
#[derive(Parser)]
#[command(name = "qsftp-client")]
#[command(about = "QSFTP client for quantum-safe file transfer")]
#[command(version)]
pub struct Cli {
    /// Server address
    #[arg(short, long, default_value = "localhost")]
    pub server: String,

    /// Server port
    #[arg(short, long, default_value = "8443")]
    pub port: u16,

    /// Principal presented during authentication
    #[arg(long, default_value = "qsftp-user")]
    pub principal: String,

    /// PKCS#8 identity key path
    #[arg(long)]
    pub identity: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Upload file
    Upload {
        /// Local file path
        #[arg(value_name = "LOCAL")]
        local: PathBuf,

        /// Remote file path
        #[arg(value_name = "REMOTE")]
        remote: String,
    },

    /// Download file
    Download {
        /// Remote file path
        #[arg(value_name = "REMOTE")]
        remote: String,

        /// Local file path
        #[arg(value_name = "LOCAL")]
        local: PathBuf,
    },

    /// Show remote file metadata
    Stat {
        /// Remote file path
        #[arg(value_name = "FILE")]
        file: String,
    },
}

/// Run CLI application
pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = ClientConfig {
        server_address: cli.server,
        server_port: cli.port,
        principal: cli.principal,
        identity_key: cli.identity,
        ..Default::default()
    };
    let mut client = QsftpClient::new(config)?;
    client.connect().await?;

    match cli.command {
        Commands::Upload { local, remote } => {
            println!("Uploading {} to {}", local.display(), remote);
            let bytes = client.upload_file(&local, &remote).await?;
            println!("Uploaded {} bytes", bytes);
        }

        Commands::Download { remote, local } => {
            println!("Downloading {} to {}", remote, local.display());
            let bytes = client.download_file(&remote, &local).await?;
            println!("Downloaded {} bytes", bytes);
        }

        Commands::Stat { file } => {
            let (size, modified) = client.stat(&file).await?;
            println!("{}: {} bytes", file, size);
            if let Some(modified) = modified {
                println!("modified: {} (unix ms)", modified);
            }
        }
    }

    client.disconnect().await?;
    Ok(())
}
