//! TLS for stream channels, driven as an explicit handshake state machine.
//!
//! A [`SecureChannel`] wraps a `rustls` connection and exposes the handshake
//! as a sequence of [`HandshakeStatus`] steps that the stream transport runs
//! from its read and write handlers. A step that would block returns control
//! to the loop; the next readable or writable event resumes it.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection};
use tracing::error;

use crate::framing::FrameDecoder;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("TLS protocol error: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("PEM error: {0}")]
    Pem(#[from] rustls::pki_types::pem::Error),

    #[error("TLS I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid server name {0:?}")]
    InvalidServerName(String),

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    /// A server context was given to a connecting transport, or vice versa.
    #[error("TLS context role does not match the transport")]
    RoleMismatch,

    /// The peer closed the connection mid-handshake.
    #[error("connection closed during handshake")]
    Closed,
}

/// Next step of the handshake state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// No handshake in progress.
    NotHandshaking,
    /// Handshake records are waiting to be written.
    NeedWrap,
    /// The handshake needs more records from the peer.
    NeedUnwrap,
    /// Received records must be processed.
    NeedTask,
    /// The handshake just completed.
    Finished,
}

// ---------------------------------------------------------------------------
// TlsContext
// ---------------------------------------------------------------------------

/// Credentials and settings for one side of a TLS session.
#[derive(Clone)]
pub enum TlsContext {
    Server(Arc<ServerConfig>),
    Client {
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    },
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

impl TlsContext {
    /// Server context from DER-encoded certificate chain and key.
    pub fn server_from_der(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, TlsError> {
        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .inspect_err(|e| error!("Failed to build TLS server context: {e}"))?;
        Ok(TlsContext::Server(Arc::new(config)))
    }

    /// Server context from a PEM certificate chain file and a PEM key file.
    pub fn server_from_pem(cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        let chain = load_certs(cert_path)?;
        let key = PrivateKeyDer::from_pem_file(key_path)
            .inspect_err(|e| error!("Failed to load TLS key {}: {e}", key_path.display()))?;
        Self::server_from_der(chain, key)
    }

    /// Client context trusting exactly `roots`.
    pub fn client_trusting(
        roots: Vec<CertificateDer<'static>>,
        server_name: &str,
    ) -> Result<Self, TlsError> {
        let mut store = RootCertStore::empty();
        for cert in roots {
            store.add(cert)?;
        }
        let config = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(store)
            .with_no_client_auth();
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| TlsError::InvalidServerName(server_name.to_string()))?;
        Ok(TlsContext::Client {
            config: Arc::new(config),
            server_name,
        })
    }

    /// Client context trusting the certificates of a PEM bundle.
    pub fn client_from_pem(ca_path: &Path, server_name: &str) -> Result<Self, TlsError> {
        Self::client_trusting(load_certs(ca_path)?, server_name)
    }

    pub fn is_server(&self) -> bool {
        matches!(self, TlsContext::Server(_))
    }

    /// Start a new session for one channel.
    pub(crate) fn new_channel(&self) -> Result<SecureChannel, TlsError> {
        let conn: Connection = match self {
            TlsContext::Server(config) => ServerConnection::new(config.clone())?.into(),
            TlsContext::Client {
                config,
                server_name,
            } => ClientConnection::new(config.clone(), server_name.clone())?.into(),
        };
        Ok(SecureChannel::new(conn))
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = CertificateDer::pem_file_iter(path)?.collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

// ---------------------------------------------------------------------------
// SecureChannel
// ---------------------------------------------------------------------------

/// Result of pulling plaintext through the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SecureRead {
    /// The socket would block; wait for the next readable event.
    Pending,
    /// The peer closed the connection.
    Closed,
}

pub struct SecureChannel {
    conn: Connection,
    handshaking: bool,
    task_pending: bool,
}

impl SecureChannel {
    fn new(mut conn: Connection) -> Self {
        // Plaintext is framed before it reaches rustls; a partial accept
        // would split a frame.
        conn.set_buffer_limit(None);
        Self {
            conn,
            handshaking: true,
            task_pending: false,
        }
    }

    pub fn status(&self) -> HandshakeStatus {
        if !self.handshaking {
            HandshakeStatus::NotHandshaking
        } else if self.task_pending {
            HandshakeStatus::NeedTask
        } else if self.conn.wants_write() {
            HandshakeStatus::NeedWrap
        } else if self.conn.is_handshaking() {
            HandshakeStatus::NeedUnwrap
        } else {
            HandshakeStatus::Finished
        }
    }

    pub fn is_handshaking(&self) -> bool {
        self.handshaking
    }

    /// Whether encrypted bytes are waiting to be written.
    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    /// Run the handshake until it completes or the socket would block.
    ///
    /// Returns the status it stopped at: `NeedUnwrap` waits for readability,
    /// `NeedWrap` for writability, `Finished`/`NotHandshaking` means done.
    pub fn drive<S: Read + Write>(&mut self, socket: &mut S) -> Result<HandshakeStatus, TlsError> {
        loop {
            match self.status() {
                HandshakeStatus::NotHandshaking => return Ok(HandshakeStatus::NotHandshaking),
                HandshakeStatus::NeedTask => {
                    self.task_pending = false;
                    self.process()?;
                }
                HandshakeStatus::NeedUnwrap => match self.conn.read_tls(socket) {
                    Ok(0) => return Err(TlsError::Closed),
                    Ok(_) => self.task_pending = true,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(HandshakeStatus::NeedUnwrap);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e.into()),
                },
                HandshakeStatus::NeedWrap => match self.conn.write_tls(socket) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(HandshakeStatus::NeedWrap);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e.into()),
                },
                HandshakeStatus::Finished => {
                    self.handshaking = false;
                    return Ok(HandshakeStatus::Finished);
                }
            }
        }
    }

    /// Feed decrypted bytes into `decoder` until the socket would block,
    /// collecting complete frame bodies through `on_data`.
    pub(crate) fn read_into<S, F>(
        &mut self,
        socket: &mut S,
        decoder: &mut FrameDecoder,
        mut on_data: F,
    ) -> Result<SecureRead, TlsError>
    where
        S: Read + Write,
        F: FnMut(&mut FrameDecoder) -> Result<(), TlsError>,
    {
        loop {
            if self.handshaking {
                match self.drive(socket)? {
                    HandshakeStatus::NeedUnwrap | HandshakeStatus::NeedWrap => {
                        return Ok(SecureRead::Pending);
                    }
                    _ => {}
                }
            }

            let mut eof = false;
            let mut blocked = false;
            match self.conn.read_tls(socket) {
                Ok(0) => eof = true,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => blocked = true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            self.process()?;

            loop {
                let read = self.conn.reader().read(decoder.spare_capacity());
                match read {
                    Ok(0) => {
                        eof = true;
                        break;
                    }
                    Ok(n) => {
                        decoder.commit(n);
                        on_data(decoder)?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        eof = true;
                        break;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            self.recheck();
            if eof {
                return Ok(SecureRead::Closed);
            }
            if blocked {
                return Ok(SecureRead::Pending);
            }
        }
    }

    /// Hand a complete frame to the session for encryption.
    pub fn write_plaintext(&mut self, frame: &[u8]) -> io::Result<()> {
        self.conn.writer().write_all(frame)
    }

    /// Write pending records. Returns `true` once nothing is left.
    pub fn flush<S: Write>(&mut self, socket: &mut S) -> io::Result<bool> {
        while self.conn.wants_write() {
            match self.conn.write_tls(socket) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Re-enter the handshake if the session started a new one.
    pub fn recheck(&mut self) {
        if self.conn.is_handshaking() {
            self.handshaking = true;
        }
    }

    /// Send close_notify, best effort.
    pub fn close<S: Write>(&mut self, socket: &mut S) {
        self.conn.send_close_notify();
        let _ = self.flush(socket);
    }

    fn process(&mut self) -> Result<(), TlsError> {
        self.conn.process_new_packets()?;
        Ok(())
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("status", &self.status())
            .finish()
    }
}
