//! git-daemon TCP connections (`git://`).
//!
//! After the socket opens, the client sends one framed request line:
//!
//! ```text
//! git-upload-pack /path/to/repo\0host=example.com[:port]\0
//! ```
//!
//! with an optional trailing `\0version=2\0` extension for protocol v2.
//! Everything after that is the ordinary wire protocol.

use std::io::{Read, Write};
use std::net::TcpStream;

use crate::{Connection, ConnectOptions, GitUrl, Service, TransportError};

/// Default git daemon port.
pub const DEFAULT_PORT: u16 = 9418;

struct TcpConnection {
    read: TcpStream,
    write: TcpStream,
}

impl Connection for TcpConnection {
    fn reader(&mut self) -> &mut dyn Read {
        &mut self.read
    }

    fn writer(&mut self) -> &mut dyn Write {
        &mut self.write
    }

    fn dispatch(&mut self) -> Result<(), TransportError> {
        self.write.flush()?;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), TransportError> {
        let _ = self.write.shutdown(std::net::Shutdown::Both);
        Ok(())
    }
}

/// Build the daemon request payload for `service` on `url`.
fn request_line(url: &GitUrl, service: Service, options: &ConnectOptions) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(service.as_str().as_bytes());
    payload.push(b' ');
    payload.extend_from_slice(url.path.as_bytes());
    payload.push(0);
    if let Some(host) = url.host.as_deref() {
        payload.extend_from_slice(b"host=");
        payload.extend_from_slice(host.as_bytes());
        if let Some(port) = url.port {
            payload.extend_from_slice(format!(":{}", port).as_bytes());
        }
        payload.push(0);
    }
    if let Some(value) = options.protocol.and_then(|v| v.request_value()) {
        // Extra parameters ride behind a second NUL
        payload.push(0);
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);
    }
    payload
}

/// Connect to a git daemon and issue the service request.
pub fn connect(
    url: &GitUrl,
    service: Service,
    options: &ConnectOptions,
) -> Result<Box<dyn Connection>, TransportError> {
    let host = url
        .host
        .as_deref()
        .ok_or_else(|| TransportError::InvalidUrl("git:// URL requires a host".into()))?;
    let port = url.port.unwrap_or(DEFAULT_PORT);

    let stream = TcpStream::connect((host, port)).map_err(|e| {
        TransportError::ConnectionFailed(format!("cannot reach {}:{}: {}", host, port, e))
    })?;
    let read = stream
        .try_clone()
        .map_err(|e| TransportError::ConnectionFailed(format!("socket clone failed: {}", e)))?;

    let mut conn = TcpConnection {
        read,
        write: stream,
    };

    // The request line is itself pkt-line framed
    let payload = request_line(url, service, options);
    let framed = format!("{:04x}", payload.len() + 4);
    conn.write.write_all(framed.as_bytes())?;
    conn.write.write_all(&payload)?;
    conn.write.flush()?;

    Ok(Box::new(conn))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProtocolVersion;

    fn daemon_url() -> GitUrl {
        GitUrl::parse("git://example.com/repo.git").unwrap()
    }

    #[test]
    fn request_line_format() {
        let payload = request_line(&daemon_url(), Service::UploadPack, &ConnectOptions::default());
        assert_eq!(
            payload,
            b"git-upload-pack /repo.git\0host=example.com\0".to_vec()
        );
    }

    #[test]
    fn request_line_with_port_and_v2() {
        let url = GitUrl::parse("git://example.com:9419/repo.git").unwrap();
        let opts = ConnectOptions {
            protocol: Some(ProtocolVersion::V2),
            ..Default::default()
        };
        let payload = request_line(&url, Service::ReceivePack, &opts);
        assert_eq!(
            payload,
            b"git-receive-pack /repo.git\0host=example.com:9419\0\0version=2\0".to_vec()
        );
    }
}
