//! QSFTP server daemon.
//!
//! Accepts TCP connections, runs the responder handshake, then drives one
//! session engine per connection over a directory-rooted file backend.
//! Error handling follows the engine's failure classes: recoverable
//! errors drop the offending frame, session-fatal errors tear down the
//! connection, fatal errors stop the daemon.

use clap::Parser;
use qsftp_core::recovery::{classify, FailureClass};
use qsftp_core::{
    AllowAll, AuditLedger, Authorizer, AuthorizationError, CryptoProvider, DiskBackend,
    EngineEvent, FrameStream, Handshake, HandshakeConfig, HardwareClass, Identity, Result, Role,
    SessionEngine,
    SigningIdentity, SoftToken, SoftwareProvider, TcpFrameStream, TcpTransport, DEFAULT_PORT,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// QSFTP Server - Quantum-Safe File Transfer Protocol
#[derive(Parser)]
#[command(name = "qsftp-server")]
#[command(about = "QSFTP server for quantum-safe file transfer")]
#[command(version)]
pub struct Cli {
    /// Configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Server address
    #[arg(short, long, default_value = "0.0.0.0")]
    pub address: String,

    /// Server port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Transfer root directory
    #[arg(short, long, default_value = "./data")]
    pub root: PathBuf,

    /// PKCS#8 identity key path
    #[arg(long)]
    pub identity: Option<PathBuf>,

    /// Refuse uploads
    #[arg(long)]
    pub read_only: bool,

    /// Export the audit ledger to this file on shutdown
    #[arg(long)]
    pub ledger_export: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

/// Optional settings from the TOML configuration file; CLI defaults apply
/// where a key is absent.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    address: Option<String>,
    port: Option<u16>,
    root: Option<PathBuf>,
    identity: Option<PathBuf>,
    read_only: Option<bool>,
    ledger_export: Option<PathBuf>,
}

struct ServerConfig {
    address: String,
    port: u16,
    root: PathBuf,
    identity: Option<PathBuf>,
    read_only: bool,
    ledger_export: Option<PathBuf>,
}

fn load_config(cli: Cli) -> anyhow::Result<ServerConfig> {
    let file = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            toml::from_str::<FileConfig>(&raw)?
        }
        None => FileConfig::default(),
    };
    Ok(ServerConfig {
        address: file.address.unwrap_or(cli.address),
        port: file.port.unwrap_or(cli.port),
        root: file.root.unwrap_or(cli.root),
        identity: file.identity.or(cli.identity),
        read_only: file.read_only.unwrap_or(cli.read_only),
        ledger_export: file.ledger_export.or(cli.ledger_export),
    })
}

/// Denies anything that would modify the transfer root.
struct ReadOnlyPolicy;

#[async_trait::async_trait]
impl Authorizer for ReadOnlyPolicy {
    async fn authorize(&self, _identity: &Identity, resource: &str, action: &str) -> Result<()> {
        if matches!(action, "open-write" | "write") {
            return Err(AuthorizationError::Denied {
                resource: resource.to_string(),
                action: action.to_string(),
                reason: "server is read-only".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

struct Shared {
    provider: Arc<dyn CryptoProvider>,
    signing: Arc<SigningIdentity>,
    token: Arc<SoftToken>,
    ledger: Arc<AuditLedger>,
    authorizer: Arc<dyn Authorizer>,
    backend: Arc<DiskBackend>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = load_config(cli)?;
    let provider: Arc<dyn CryptoProvider> = Arc::new(SoftwareProvider::new());
    let signing = Arc::new(match &config.identity {
        Some(path) => SigningIdentity::from_pkcs8(&std::fs::read(path)?)?,
        None => {
            tracing::warn!("no identity key configured, using an ephemeral identity");
            SigningIdentity::generate()?.0
        }
    });
    let token = Arc::new(SoftToken::new(
        "qsftp-server",
        HardwareClass::Tpm,
        signing.clone(),
        provider.clone(),
    ));
    let (ledger_signing, _) = SigningIdentity::generate()?;
    let ledger = Arc::new(AuditLedger::new(provider.clone(), ledger_signing));
    tracing::info!(
        key = %hex::encode(ledger.verifying_key()),
        "audit ledger verifying key"
    );

    let authorizer: Arc<dyn Authorizer> = if config.read_only {
        Arc::new(ReadOnlyPolicy)
    } else {
        Arc::new(AllowAll)
    };
    let shared = Arc::new(Shared {
        provider,
        signing,
        token,
        ledger: ledger.clone(),
        authorizer,
        backend: Arc::new(DiskBackend::new(&config.root)),
    });

    let listener = TcpListener::bind((config.address.as_str(), config.port)).await?;
    tracing::info!(address = %config.address, port = config.port, root = %config.root.display(), "qsftp server listening");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
                break;
            }
            accepted = TcpTransport::accept(&listener) => {
                match accepted {
                    Ok((stream, addr)) => {
                        let shared = shared.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, addr, shared).await;
                        });
                    }
                    Err(err) => tracing::warn!(error = %err, "accept failed"),
                }
            }
        }
    }

    if let Some(path) = &config.ledger_export {
        std::fs::write(path, serde_json::to_vec_pretty(&ledger.records())?)?;
        tracing::info!(path = %path.display(), records = ledger.len(), "audit ledger exported");
    }
    Ok(())
}

async fn handle_connection(mut stream: TcpFrameStream, addr: SocketAddr, shared: Arc<Shared>) {
    let handshake = Handshake::new(
        Role::Responder,
        HandshakeConfig::default(),
        shared.provider.clone(),
        shared.token.clone(),
        shared.ledger.clone(),
    );
    let session = match handshake.run(&mut stream).await {
        Ok(session) => session,
        Err(err) => {
            tracing::warn!(%addr, error = %err, "handshake failed");
            return;
        }
    };
    tracing::info!(%addr, session = %session.session_id, peer = %session.peer.principal, "session established");

    let mut engine = SessionEngine::new(
        session,
        Role::Responder,
        shared.provider.clone(),
        shared.signing.clone(),
        shared.ledger.clone(),
        shared.authorizer.clone(),
        shared.backend.clone(),
    );

    loop {
        let frame = match stream.receive().await {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!(%addr, error = %err, "peer disconnected");
                break;
            }
        };
        let output = match engine.handle_frame(frame).await {
            Ok(output) => output,
            Err(err) => match classify(&err) {
                FailureClass::Recoverable => {
                    tracing::warn!(%addr, error = %err, "dropping frame");
                    continue;
                }
                FailureClass::SessionFatal => {
                    tracing::error!(%addr, error = %err, "session failed");
                    break;
                }
                FailureClass::Fatal => {
                    tracing::error!(%addr, error = %err, "fatal failure, stopping daemon");
                    std::process::exit(1);
                }
            },
        };
        for reply in output.replies {
            if stream.send(reply).await.is_err() {
                break;
            }
        }
        match engine.maybe_rotate() {
            Ok(Some(rotation)) => {
                if stream.send(rotation).await.is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(err) => {
                tracing::error!(%addr, error = %err, "key rotation failed");
                break;
            }
        }
        if output.events.iter().any(|e| matches!(e, EngineEvent::SessionClosed)) {
            break;
        }
    }
    if let Err(err) = engine.close() {
        tracing::warn!(%addr, error = %err, "session close audit failed");
    }
}
