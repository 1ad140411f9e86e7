//! QSFTP client implementation.
//!
//! Wraps the protocol engine behind connect/upload/download/stat calls.
//! Local file contents are staged through an in-memory backend; the
//! engine handles sealing, chunk integrity and re-requests.

use indicatif::{ProgressBar, ProgressStyle};
use qsftp_core::session::chunk_count_for;
use qsftp_core::{
    AllowAll, AuditLedger, CryptoProvider, EngineEvent, Error, FileBackend, FileOperation,
    FileResponse, FrameStream, Handshake, HandshakeConfig, HardwareClass, MemoryBackend, Result,
    Role, SessionEngine, SigningIdentity, SoftToken, SoftwareProvider, TcpTransport, Transport,
    TransportConfig, DEFAULT_CHUNK_SIZE, DEFAULT_PORT,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address
    pub server_address: String,
    /// Server port
    pub server_port: u16,
    /// Principal presented during authentication
    pub principal: String,
    /// PKCS#8 identity key path; a fresh ephemeral key is generated when
    /// absent
    pub identity_key: Option<PathBuf>,
    /// Connection timeout in seconds
    pub connection_timeout: u64,
    /// Transfer chunk size in bytes
    pub chunk_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: "localhost".to_string(),
            server_port: DEFAULT_PORT,
            principal: "qsftp-user".to_string(),
            identity_key: None,
            connection_timeout: 30,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

struct Connection {
    engine: SessionEngine,
    stream: Box<dyn FrameStream>,
    backend: Arc<MemoryBackend>,
}

/// QSFTP client
pub struct QsftpClient {
    config: ClientConfig,
    provider: Arc<dyn CryptoProvider>,
    connection: Option<Connection>,
}

impl QsftpClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        Ok(Self {
            config,
            provider: Arc::new(SoftwareProvider::new()),
            connection: None,
        })
    }

    /// Connect and run the handshake.
    pub async fn connect(&mut self) -> Result<()> {
        let signing = Arc::new(self.load_identity().await?);
        let token = Arc::new(SoftToken::new(
            self.config.principal.clone(),
            HardwareClass::SecurityToken,
            signing.clone(),
            self.provider.clone(),
        ));
        let (ledger_signing, _) = SigningIdentity::generate()?;
        let ledger = Arc::new(AuditLedger::new(self.provider.clone(), ledger_signing));

        let transport = TcpTransport::new(TransportConfig {
            address: self.config.server_address.clone(),
            port: self.config.server_port,
            connect_timeout: Duration::from_secs(self.config.connection_timeout),
        });
        let mut stream = transport.open_stream().await?;

        let handshake = Handshake::new(
            Role::Initiator,
            HandshakeConfig::default(),
            self.provider.clone(),
            token,
            ledger.clone(),
        );
        let session = handshake.run(&mut *stream).await?;
        tracing::info!(
            session = %session.session_id,
            peer = %session.peer.principal,
            "session established"
        );

        let backend = Arc::new(MemoryBackend::new());
        let engine = SessionEngine::new(
            session,
            Role::Initiator,
            self.provider.clone(),
            signing,
            ledger,
            Arc::new(AllowAll),
            backend.clone(),
        )
        .with_chunk_size(self.config.chunk_size);

        self.connection = Some(Connection { engine, stream, backend });
        Ok(())
    }

    /// Upload a local file to the server.
    pub async fn upload_file(&mut self, local: &Path, remote: &str) -> Result<u64> {
        let data = tokio::fs::read(local)
            .await
            .map_err(|e| Error::File(format!("{}: {e}", local.display())))?;
        let size = data.len() as u64;
        let chunk_size = self.config.chunk_size;
        let conn = self.connection()?;
        conn.backend.insert("::upload", data)?;

        let handle = match Self::request(conn, &FileOperation::Open {
            path: remote.to_string(),
            write: true,
        })
        .await?
        {
            FileResponse::Handle { handle } => handle,
            other => return Err(unexpected_response(&other)),
        };

        let chunk_count = chunk_count_for(size, chunk_size);
        let announce = conn.engine.request(&FileOperation::Write {
            handle,
            size,
            chunk_count,
            chunk_size: chunk_size as u32,
        })?;
        conn.stream.send(announce).await?;

        let src_handle = conn.backend.open("::upload", false).await?;
        let frames = conn.engine.send_file(handle, src_handle, remote).await?;
        let progress = chunk_progress(chunk_count);
        for frame in frames {
            conn.stream.send(frame).await?;
            progress.inc(1);
        }
        progress.finish_and_clear();

        // Close doubles as the completion sync point: the server processes
        // it only after every chunk landed and verified.
        match Self::request(conn, &FileOperation::Close { handle }).await? {
            FileResponse::Closed { .. } => Ok(size),
            other => Err(unexpected_response(&other)),
        }
    }

    /// Download a remote file.
    pub async fn download_file(&mut self, remote: &str, local: &Path) -> Result<u64> {
        let conn = self.connection()?;
        let handle = match Self::request(conn, &FileOperation::Open {
            path: remote.to_string(),
            write: false,
        })
        .await?
        {
            FileResponse::Handle { handle } => handle,
            other => return Err(unexpected_response(&other)),
        };

        let read = conn.engine.request(&FileOperation::Read { handle })?;
        conn.stream.send(read).await?;
        let (chunk_count, chunk_size) = match Self::await_response(conn).await? {
            FileResponse::Stream { chunk_count, chunk_size, .. } => (chunk_count, chunk_size),
            other => return Err(unexpected_response(&other)),
        };
        conn.engine
            .begin_receive(handle, "::download", chunk_count, chunk_size)
            .await?;

        let progress = chunk_progress(chunk_count);
        let bytes = loop {
            let mut done = None;
            for event in Self::pump(conn).await? {
                match event {
                    EngineEvent::ChunkStored { .. } => progress.inc(1),
                    EngineEvent::TransferComplete { bytes, .. } => done = Some(bytes),
                    EngineEvent::PeerError(info) => {
                        return Err(Error::File(format!("server error: {}", info.message)))
                    }
                    _ => {}
                }
            }
            if let Some(bytes) = done {
                break bytes;
            }
        };
        progress.finish_and_clear();

        match Self::request(conn, &FileOperation::Close { handle }).await? {
            FileResponse::Closed { .. } => {}
            other => return Err(unexpected_response(&other)),
        }

        let contents = conn
            .backend
            .contents("::download")?
            .ok_or_else(|| Error::Internal("download buffer missing".to_string()))?;
        tokio::fs::write(local, &contents)
            .await
            .map_err(|e| Error::File(format!("{}: {e}", local.display())))?;
        Ok(bytes)
    }

    /// Fetch remote file metadata.
    pub async fn stat(&mut self, remote: &str) -> Result<(u64, Option<i64>)> {
        let conn = self.connection()?;
        match Self::request(conn, &FileOperation::Stat { path: remote.to_string() }).await? {
            FileResponse::Stat { size, modified } => Ok((size, modified)),
            other => Err(unexpected_response(&other)),
        }
    }

    /// Tear the session down cleanly.
    pub async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut conn) = self.connection.take() {
            let teardown = conn.engine.teardown()?;
            conn.stream.send(teardown).await?;
            conn.stream.close().await?;
        }
        Ok(())
    }

    // ---- internals ------------------------------------------------------

    async fn load_identity(&self) -> Result<SigningIdentity> {
        match &self.config.identity_key {
            Some(path) => {
                let pkcs8 = tokio::fs::read(path)
                    .await
                    .map_err(|e| Error::Config(format!("identity key {}: {e}", path.display())))?;
                SigningIdentity::from_pkcs8(&pkcs8)
            }
            None => {
                tracing::warn!("no identity key configured, using an ephemeral identity");
                let (signing, _) = SigningIdentity::generate()?;
                Ok(signing)
            }
        }
    }

    fn connection(&mut self) -> Result<&mut Connection> {
        self.connection
            .as_mut()
            .ok_or_else(|| Error::Transport("not connected".to_string()))
    }

    /// Receive one frame, feed the engine, flush its replies.
    async fn pump(conn: &mut Connection) -> Result<Vec<EngineEvent>> {
        let frame = conn.stream.receive().await?;
        let output = conn.engine.handle_frame(frame).await?;
        for reply in output.replies {
            conn.stream.send(reply).await?;
        }
        Ok(output.events)
    }

    async fn await_response(conn: &mut Connection) -> Result<FileResponse> {
        loop {
            for event in Self::pump(conn).await? {
                match event {
                    EngineEvent::Response(response) => return Ok(response),
                    EngineEvent::PeerError(info) => {
                        return Err(Error::File(format!("server error: {}", info.message)))
                    }
                    _ => {}
                }
            }
        }
    }

    async fn request(conn: &mut Connection, operation: &FileOperation) -> Result<FileResponse> {
        let frame = conn.engine.request(operation)?;
        conn.stream.send(frame).await?;
        Self::await_response(conn).await
    }
}

fn unexpected_response(response: &FileResponse) -> Error {
    Error::Transport(format!("unexpected server response: {response:?}"))
}

fn chunk_progress(chunk_count: u64) -> ProgressBar {
    let progress = ProgressBar::new(chunk_count);
    if let Ok(style) = ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} chunks") {
        progress.set_style(style);
    }
    progress
}
