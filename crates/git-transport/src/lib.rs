//! Byte-stream connections for git network operations.
//!
//! This crate provides the physical layer under the wire protocol: URL
//! parsing, SSH and local subprocess plumbing, git-daemon TCP sockets,
//! and the smart-HTTP RPC adapter that turns request/response cycles
//! into a duplex framed stream. Protocol logic (pkt-line, negotiation,
//! drivers) lives in `git-protocol`.

pub mod credential;
pub mod http;
pub mod local;
pub mod ssh;
pub mod tcp;
pub mod url;

use std::io::{Read, Write};

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("HTTP error: {status}: {message}")]
    Http { status: u16, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Git URL scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scheme {
    Ssh,
    Git,
    Http,
    Https,
    File,
    /// Local path without scheme prefix.
    Local,
    /// Unknown scheme, served by an external `git-remote-<name>` helper.
    Ext(String),
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scheme::Ssh => write!(f, "ssh"),
            Scheme::Git => write!(f, "git"),
            Scheme::Http => write!(f, "http"),
            Scheme::Https => write!(f, "https"),
            Scheme::File => write!(f, "file"),
            Scheme::Local => write!(f, "local"),
            Scheme::Ext(name) => write!(f, "{}", name),
        }
    }
}

/// Parsed git URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitUrl {
    pub scheme: Scheme,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub path: String,
}

impl std::fmt::Display for GitUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.scheme {
            Scheme::Ssh if self.user.is_some() && self.port.is_none() => {
                // SCP-like syntax: user@host:path
                write!(
                    f,
                    "{}@{}:{}",
                    self.user.as_deref().unwrap_or("git"),
                    self.host.as_deref().unwrap_or(""),
                    self.path
                )
            }
            Scheme::Local => write!(f, "{}", self.path),
            Scheme::File => write!(f, "file://{}", self.path),
            _ => {
                write!(f, "{}://", self.scheme)?;
                if let Some(ref user) = self.user {
                    write!(f, "{}@", user)?;
                }
                if let Some(ref host) = self.host {
                    write!(f, "{}", host)?;
                }
                if let Some(port) = self.port {
                    write!(f, ":{}", port)?;
                }
                write!(f, "{}", self.path)
            }
        }
    }
}

/// Service requested from the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    /// git-upload-pack (fetch/clone/ls-remote).
    UploadPack,
    /// git-receive-pack (push).
    ReceivePack,
}

impl Service {
    /// Service name as used on the wire and as the default exec name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::UploadPack => "git-upload-pack",
            Service::ReceivePack => "git-receive-pack",
        }
    }
}

/// Wire protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V0,
    V1,
    V2,
}

impl ProtocolVersion {
    /// The `GIT_PROTOCOL` / `Git-Protocol` request value, if any.
    pub fn request_value(&self) -> Option<&'static str> {
        match self {
            ProtocolVersion::V0 => None,
            ProtocolVersion::V1 => Some("version=1"),
            ProtocolVersion::V2 => Some("version=2"),
        }
    }
}

/// Options applied when opening a connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Protocol version to request; the server may downgrade.
    pub protocol: Option<ProtocolVersion>,
    /// Override the remote exec path (`--upload-pack=` / `--receive-pack=`).
    pub remote_exec: Option<String>,
    /// Enable gzip Content-Encoding on HTTP request bodies.
    pub gzip: bool,
}

/// A duplex byte stream to a remote service process.
///
/// Stream transports (SSH, daemon, local subprocess) hand out the raw
/// pipe ends. The HTTP adapter buffers writes and turns each
/// [`Connection::dispatch`] into one POST, staging the response for the
/// reader.
pub trait Connection: Send {
    /// Reader for the remote's output.
    fn reader(&mut self) -> &mut dyn Read;

    /// Writer for data headed to the remote.
    fn writer(&mut self) -> &mut dyn Write;

    /// Mark the end of one protocol request.
    ///
    /// Stream transports flush the writer. Stateless transports submit
    /// the buffered request and make the response readable.
    fn dispatch(&mut self) -> Result<(), TransportError>;

    /// Whether each request/response pair must be self-contained.
    fn is_stateless(&self) -> bool {
        false
    }

    /// Close the connection, releasing all resources.
    fn close(self: Box<Self>) -> Result<(), TransportError>;
}

/// Open a byte-stream connection for the given URL and service.
///
/// Schemes handled elsewhere: `Ext` URLs are served by external helpers
/// and bundles/local shortcuts never open a wire connection; callers are
/// expected to route those before calling this.
pub fn connect(
    url: &GitUrl,
    service: Service,
    options: &ConnectOptions,
) -> Result<Box<dyn Connection>, TransportError> {
    match &url.scheme {
        Scheme::Ssh => ssh::connect(url, service, options),
        Scheme::Git => tcp::connect(url, service, options),
        Scheme::Http | Scheme::Https => {
            let conn = http::HttpConnection::open(url, service, options)?;
            Ok(Box::new(conn))
        }
        Scheme::File | Scheme::Local => local::connect(url, service, options),
        Scheme::Ext(name) => Err(TransportError::UnsupportedScheme(format!(
            "{} (requires the git-remote-{} helper)",
            name, name
        ))),
    }
}
