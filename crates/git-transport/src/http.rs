//! Smart-HTTP RPC adapter.
//!
//! Turns the duplex [`Connection`] contract into HTTP request/response
//! cycles against the remote's smart endpoints:
//!
//! - `GET {url}/info/refs?service=<svc>` — discovery; returns either the
//!   v0/v1 advertisement (prefixed by a `# service=<svc>` pkt-line), the
//!   v2 capability stream, or — on a dumb server — a flat text listing.
//! - `POST {url}/<svc>` — one protocol request per POST.
//!
//! Outbound packets accumulate in a 1 MiB buffer. A request that fits is
//! sent with Content-Length (gzip-compressed when enabled); one that
//! overflows spills to a temporary file and is sent with chunked
//! Transfer-Encoding and a 100-continue probe. A 401 triggers one
//! credential fill and retry; the spill file keeps large requests
//! rewindable.
//!
//! HTTP itself is spoken by a spawned `curl`, like every other external
//! process this layer drives.

use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::process::{Command, Stdio};

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::credential::Credential;
use crate::{Connection, ConnectOptions, GitUrl, Scheme, Service, TransportError};

/// Requests up to this size are posted with Content-Length; larger ones
/// switch to chunked streaming from a spill file.
pub const LARGE_REQUEST_THRESHOLD: usize = 1024 * 1024;

/// What the discovery request found on the other end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerKind {
    /// Smart server: advertisement/capability stream, POST endpoint live.
    Smart,
    /// Dumb server: plain `info/refs` listing, objects fetched by path.
    Dumb,
}

/// An outbound request body: in memory until it exceeds the threshold,
/// then spilled to a temp file (the "large request" path).
struct RequestBody {
    mem: Vec<u8>,
    spill: Option<tempfile::NamedTempFile>,
}

impl RequestBody {
    fn new() -> Self {
        Self {
            mem: Vec::new(),
            spill: None,
        }
    }

    fn is_large(&self) -> bool {
        self.spill.is_some()
    }

    fn len(&self) -> usize {
        self.mem.len()
    }

    fn clear(&mut self) {
        self.mem.clear();
        self.spill = None;
    }
}

impl Write for RequestBody {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(ref mut spill) = self.spill {
            return spill.write(buf);
        }
        self.mem.extend_from_slice(buf);
        if self.mem.len() > LARGE_REQUEST_THRESHOLD {
            let mut spill = tempfile::NamedTempFile::new()?;
            spill.write_all(&self.mem)?;
            self.mem.clear();
            self.spill = Some(spill);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Some(ref mut spill) = self.spill {
            spill.flush()?;
        }
        Ok(())
    }
}

/// Smart-HTTP connection state.
pub struct HttpConnection {
    /// Repository base URL, scheme through path, no trailing slash.
    base_url: String,
    service: Service,
    gzip: bool,
    protocol_header: Option<&'static str>,
    credential: Credential,
    /// Set once a 401 forced a fill; reused for every later request.
    authenticated: bool,
    body: RequestBody,
    response: Cursor<Vec<u8>>,
    kind: ServerKind,
    /// Raw discovery body, staged for the reader on smart servers and
    /// exposed via [`HttpConnection::info_refs`] on dumb ones.
    info_refs: Vec<u8>,
}

impl HttpConnection {
    /// Perform discovery against `url` and classify the server.
    pub fn open(
        url: &GitUrl,
        service: Service,
        options: &ConnectOptions,
    ) -> Result<Self, TransportError> {
        let scheme = match url.scheme {
            Scheme::Https => "https",
            _ => "http",
        };
        let base_url = format!("{}://{}{}", scheme, url.authority(), url.path);
        let base_url = base_url.trim_end_matches('/').to_string();

        let mut conn = Self {
            base_url,
            service,
            gzip: options.gzip,
            protocol_header: options.protocol.and_then(|v| v.request_value()),
            credential: Credential::for_url(
                scheme,
                &url.authority(),
                Some(url.path.trim_start_matches('/')),
            ),
            authenticated: false,
            body: RequestBody::new(),
            response: Cursor::new(Vec::new()),
            kind: ServerKind::Dumb,
            info_refs: Vec::new(),
        };
        conn.discover()?;
        Ok(conn)
    }

    /// Whether discovery found a smart server.
    pub fn kind(&self) -> ServerKind {
        self.kind
    }

    /// The raw `info/refs` discovery body.
    pub fn info_refs(&self) -> &[u8] {
        &self.info_refs
    }

    /// The repository base URL (for the dumb walker's object GETs).
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn discover(&mut self) -> Result<(), TransportError> {
        let url = format!(
            "{}/info/refs?service={}",
            self.base_url,
            self.service.as_str()
        );

        let resp = self.perform(CurlRequest {
            url: &url,
            post: false,
            headers: self.common_headers(),
            body: None,
        })?;

        let smart_type = format!(
            "application/x-{}-advertisement",
            self.service.as_str()
        );
        self.kind = if resp.content_type.as_deref() == Some(smart_type.as_str()) {
            ServerKind::Smart
        } else {
            // Anything else is served by the dumb walker
            log::debug!(
                "no smart advertisement at {} (content-type {:?}), falling back to dumb",
                url,
                resp.content_type
            );
            ServerKind::Dumb
        };

        self.info_refs = resp.body.clone();
        if self.kind == ServerKind::Smart {
            self.response = Cursor::new(resp.body);
        }
        Ok(())
    }

    /// Fetch an arbitrary path under the repository URL (dumb protocol:
    /// loose objects, pack indexes, `objects/info/packs`).
    pub fn get_path(&mut self, path: &str) -> Result<Vec<u8>, TransportError> {
        let url = format!("{}/{}", self.base_url, path);
        let resp = self.perform(CurlRequest {
            url: &url,
            post: false,
            headers: Vec::new(),
            body: None,
        })?;
        Ok(resp.body)
    }

    fn common_headers(&self) -> Vec<String> {
        let mut headers = Vec::new();
        if let Some(value) = self.protocol_header {
            headers.push(format!("Git-Protocol: {}", value));
        }
        headers
    }

    fn rpc_headers(&self) -> Vec<String> {
        let svc = self.service.as_str();
        let mut headers = vec![
            format!("Content-Type: application/x-{}-request", svc),
            format!("Accept: application/x-{}-result", svc),
        ];
        headers.extend(self.common_headers());
        headers
    }

    /// Submit the buffered request body as one POST.
    fn post_rpc(&mut self) -> Result<(), TransportError> {
        let url = format!("{}/{}", self.base_url, self.service.as_str());
        let mut headers = self.rpc_headers();

        let body = if self.body.is_large() {
            // Chunked streaming with a 100-continue probe; the spill
            // file stays on disk so an auth retry can re-read it.
            headers.push("Transfer-Encoding: chunked".into());
            headers.push("Expect: 100-continue".into());
            let spill = self.body.spill.as_mut().expect("large body has spill");
            spill.flush()?;
            spill.seek(SeekFrom::Start(0))?;
            CurlBody::File(spill.path().to_path_buf())
        } else if self.gzip && self.body.len() > 0 {
            headers.push("Content-Encoding: gzip".into());
            let mut enc = GzEncoder::new(Vec::new(), Compression::default());
            enc.write_all(&self.body.mem)?;
            CurlBody::Bytes(enc.finish()?)
        } else {
            CurlBody::Bytes(self.body.mem.clone())
        };

        let resp = self.perform(CurlRequest {
            url: &url,
            post: true,
            headers,
            body: Some(body),
        })?;

        let expected = format!("application/x-{}-result", self.service.as_str());
        if resp.content_type.as_deref() != Some(expected.as_str()) {
            return Err(TransportError::Http {
                status: resp.status,
                message: format!(
                    "expected {}, got {:?}",
                    expected, resp.content_type
                ),
            });
        }

        self.body.clear();
        self.response = Cursor::new(resp.body);
        Ok(())
    }

    /// Run one curl request, handling the 401 → fill → retry cycle.
    fn perform(&mut self, req: CurlRequest<'_>) -> Result<HttpResponse, TransportError> {
        let auth = if self.authenticated {
            Some(self.credential.clone())
        } else {
            None
        };
        let resp = run_curl(&req, auth.as_ref())?;

        if resp.status == 401 {
            if self.authenticated {
                self.credential.reject();
                self.authenticated = false;
                return Err(TransportError::AuthenticationFailed);
            }
            self.credential.fill()?;
            self.authenticated = true;

            if req.is_large() {
                // The server consumed (part of) a streamed body before
                // challenging; send a zero-length probe to settle auth
                // before re-streaming.
                log::debug!("large request: probing auth before resend");
                let probe = CurlRequest {
                    url: req.url,
                    post: true,
                    headers: req.headers.clone(),
                    body: Some(CurlBody::Bytes(Vec::new())),
                };
                let _ = run_curl(&probe, Some(&self.credential));
            }

            let resp = run_curl(&req, Some(&self.credential))?;
            if resp.status == 401 {
                self.credential.reject();
                self.authenticated = false;
                return Err(TransportError::AuthenticationFailed);
            }
            if resp.status < 400 {
                self.credential.approve();
            }
            return check_status(resp);
        }

        check_status(resp)
    }
}

fn check_status(resp: HttpResponse) -> Result<HttpResponse, TransportError> {
    if resp.status >= 400 {
        return Err(TransportError::Http {
            status: resp.status,
            message: String::from_utf8_lossy(&resp.body).trim().to_string(),
        });
    }
    Ok(resp)
}

impl Connection for HttpConnection {
    fn reader(&mut self) -> &mut dyn Read {
        &mut self.response
    }

    fn writer(&mut self) -> &mut dyn Write {
        &mut self.body
    }

    fn dispatch(&mut self) -> Result<(), TransportError> {
        self.post_rpc()
    }

    fn is_stateless(&self) -> bool {
        true
    }

    fn close(self: Box<Self>) -> Result<(), TransportError> {
        Ok(())
    }
}

/// One request for the curl runner.
struct CurlRequest<'a> {
    url: &'a str,
    post: bool,
    headers: Vec<String>,
    body: Option<CurlBody>,
}

impl CurlRequest<'_> {
    fn is_large(&self) -> bool {
        matches!(self.body, Some(CurlBody::File(_)))
    }
}

enum CurlBody {
    Bytes(Vec<u8>),
    File(std::path::PathBuf),
}

/// Parsed HTTP response: final status, content type, body.
#[derive(Debug)]
struct HttpResponse {
    status: u16,
    content_type: Option<String>,
    body: Vec<u8>,
}

fn run_curl(
    req: &CurlRequest<'_>,
    credential: Option<&Credential>,
) -> Result<HttpResponse, TransportError> {
    let mut cmd = Command::new("curl");
    cmd.arg("-s").arg("-S").arg("-L").arg("--include");

    if req.post {
        cmd.arg("-X").arg("POST");
    }
    for header in &req.headers {
        cmd.arg("-H").arg(header);
    }
    if let Some(cred) = credential {
        if let (Some(user), Some(pass)) = (&cred.username, &cred.password) {
            cmd.arg("-u").arg(format!("{}:{}", user, pass));
        }
    }

    let mut stdin_bytes = None;
    match req.body {
        Some(CurlBody::Bytes(ref bytes)) => {
            cmd.arg("--data-binary").arg("@-");
            stdin_bytes = Some(bytes.clone());
        }
        Some(CurlBody::File(ref path)) => {
            cmd.arg("--data-binary").arg(format!("@{}", path.display()));
        }
        None => {}
    }

    cmd.arg(req.url);
    cmd.stdin(if stdin_bytes.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| TransportError::ConnectionFailed(format!("curl not found: {}", e)))?;

    if let Some(bytes) = stdin_bytes {
        if let Some(ref mut stdin) = child.stdin {
            stdin.write_all(&bytes)?;
        }
    }
    drop(child.stdin.take());

    let output = child.wait_with_output()?;
    if !output.status.success() && output.stdout.is_empty() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(TransportError::ConnectionFailed(format!(
            "curl failed: {}",
            stderr.trim()
        )));
    }

    parse_http_response(&output.stdout)
}

/// Split a `--include` response into status, headers, and body.
///
/// Redirects and 100-continue produce several stacked header blocks; the
/// last one wins.
fn parse_http_response(raw: &[u8]) -> Result<HttpResponse, TransportError> {
    let mut rest = raw;
    let mut status = 0u16;
    let mut content_type = None;

    loop {
        if !rest.starts_with(b"HTTP/") {
            break;
        }
        let end = find_header_end(rest).ok_or_else(|| TransportError::ConnectionFailed(
            "truncated HTTP response headers".into(),
        ))?;
        let (headers, body) = rest.split_at(end);
        let header_text = String::from_utf8_lossy(headers);

        let mut lines = header_text.lines();
        if let Some(status_line) = lines.next() {
            let mut parts = status_line.split_whitespace();
            parts.next(); // HTTP/1.1
            if let Some(code) = parts.next() {
                status = code.parse().unwrap_or(0);
            }
        }
        content_type = None;
        for line in lines {
            if let Some(value) = header_value(line, "content-type") {
                content_type = Some(value);
            }
        }

        rest = &body[4.min(body.len())..];
        // 1xx blocks are followed by the real response headers
        if !(100..200).contains(&status) && !rest.starts_with(b"HTTP/") {
            break;
        }
    }

    if status == 0 {
        return Err(TransportError::ConnectionFailed(
            "no HTTP status line in response".into(),
        ));
    }

    Ok(HttpResponse {
        status,
        content_type,
        body: rest.to_vec(),
    })
}

fn find_header_end(bytes: &[u8]) -> Option<usize> {
    bytes.windows(4).position(|w| w == b"\r\n\r\n")
}

fn header_value(line: &str, name: &str) -> Option<String> {
    let (key, value) = line.split_once(':')?;
    if key.trim().eq_ignore_ascii_case(name) {
        // Strip any ;charset= parameter
        let value = value.trim();
        let value = value.split(';').next().unwrap_or(value).trim();
        Some(value.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_response() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: application/x-git-upload-pack-advertisement\r\n\r\nbody bytes";
        let resp = parse_http_response(raw).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(
            resp.content_type.as_deref(),
            Some("application/x-git-upload-pack-advertisement")
        );
        assert_eq!(resp.body, b"body bytes");
    }

    #[test]
    fn parse_stacked_header_blocks() {
        let raw = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nhello";
        let resp = parse_http_response(raw).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.content_type.as_deref(), Some("text/plain"));
        assert_eq!(resp.body, b"hello");
    }

    #[test]
    fn parse_redirect_then_result() {
        let raw = b"HTTP/1.1 301 Moved Permanently\r\nLocation: elsewhere\r\n\r\nHTTP/1.1 401 Unauthorized\r\nContent-Type: text/html\r\n\r\ndenied";
        let resp = parse_http_response(raw).unwrap();
        assert_eq!(resp.status, 401);
        assert_eq!(resp.body, b"denied");
    }

    #[test]
    fn content_type_parameter_stripped() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\n\r\nrefs";
        let resp = parse_http_response(raw).unwrap();
        assert_eq!(resp.content_type.as_deref(), Some("text/plain"));
    }

    #[test]
    fn missing_status_is_error() {
        assert!(parse_http_response(b"garbage").is_err());
    }

    #[test]
    fn request_body_spills_when_large() {
        let mut body = RequestBody::new();
        body.write_all(&vec![0u8; LARGE_REQUEST_THRESHOLD + 1]).unwrap();
        assert!(body.is_large());

        let mut small = RequestBody::new();
        small.write_all(b"0009want\n").unwrap();
        assert!(!small.is_large());
        assert_eq!(small.len(), 9);
    }
}
