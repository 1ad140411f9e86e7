//! QSFTP Tools - offline management utilities.
//!
//! Generates identity keys and inspects exported audit ledgers without a
//! running server.

use clap::{Parser, Subcommand};
use qsftp_core::ledger::verify_records;
use qsftp_core::{AuditRecord, Error, Result, SigningIdentity, SoftwareProvider};
use std::path::{Path, PathBuf};

/// QSFTP Tools - Management and utilities
#[derive(Parser)]
#[command(name = "qsftp-tools")]
#[command(about = "QSFTP management and utility tools")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate an Ed25519 identity key
    Keygen {
        /// Output private key path (PKCS#8)
        #[arg(long)]
        output: PathBuf,
    },

    /// Verify the hash chain and signatures of an exported audit ledger
    VerifyLedger {
        /// Ledger JSON export
        #[arg(long)]
        input: PathBuf,

        /// Hex-encoded ledger verifying key
        #[arg(long)]
        key: String,
    },

    /// Re-export an audit ledger as pretty-printed JSON
    ExportLogs {
        /// Ledger JSON export
        #[arg(long)]
        input: PathBuf,

        /// Output file; stdout when absent
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn read_ledger(path: &Path) -> Result<Vec<AuditRecord>> {
    let raw = std::fs::read(path)
        .map_err(|e| Error::File(format!("{}: {e}", path.display())))?;
    Ok(serde_json::from_slice(&raw)?)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen { output } => {
            let (signing, pkcs8) = SigningIdentity::generate()?;
            std::fs::write(&output, &pkcs8)
                .map_err(|e| Error::File(format!("{}: {e}", output.display())))?;
            println!("Private key: {}", output.display());
            println!("Public key:  {}", hex::encode(signing.public_key()));
        }

        Commands::VerifyLedger { input, key } => {
            let records = read_ledger(&input)?;
            if records.is_empty() {
                println!("Ledger is empty, nothing to verify");
                return Ok(());
            }
            let verifying_key = hex::decode(&key)
                .map_err(|e| Error::Config(format!("verifying key: {e}")))?;
            let provider = SoftwareProvider::new();
            verify_records(&records, 0, records.len() as u64 - 1, &provider, &verifying_key)?;
            println!("Ledger OK: {} records, chain and signatures verified", records.len());
        }

        Commands::ExportLogs { input, output } => {
            let records = read_ledger(&input)?;
            let exported =
                serde_json::Value::Array(records.iter().map(AuditRecord::export).collect());
            match output {
                Some(path) => {
                    std::fs::write(&path, serde_json::to_vec_pretty(&exported)?)
                        .map_err(|e| Error::File(format!("{}: {e}", path.display())))?;
                    println!("Exported {} records to {}", records.len(), path.display());
                }
                None => println!("{exported:#}"),
            }
        }
    }

    Ok(())
}
