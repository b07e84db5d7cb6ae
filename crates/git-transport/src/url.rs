//! Git URL parsing.
//!
//! Supported forms:
//! - ssh://[user@]host[:port]/path
//! - git://host[:port]/path
//! - http[s]://[user@]host[:port]/path
//! - file:///path
//! - /local/path
//! - user@host:path (SCP-like SSH)
//! - anything://... (handed to the `git-remote-<scheme>` helper)

use crate::{GitUrl, Scheme, TransportError};

impl GitUrl {
    /// Parse a git URL string into a GitUrl.
    ///
    /// Handles all standard git URL formats including the SCP-like SSH
    /// syntax (`user@host:path`), which has no explicit scheme. A scheme
    /// this crate does not speak natively parses as [`Scheme::Ext`] so
    /// the caller can route it to an external helper.
    pub fn parse(url: &str) -> Result<Self, TransportError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(TransportError::InvalidUrl("empty URL".into()));
        }

        if let Some(rest) = url.strip_prefix("ssh://") {
            return parse_standard(Scheme::Ssh, rest);
        }
        if let Some(rest) = url.strip_prefix("git://") {
            return parse_standard(Scheme::Git, rest);
        }
        if let Some(rest) = url.strip_prefix("http://") {
            return parse_standard(Scheme::Http, rest);
        }
        if let Some(rest) = url.strip_prefix("https://") {
            return parse_standard(Scheme::Https, rest);
        }
        if let Some(rest) = url.strip_prefix("file://") {
            return Ok(GitUrl {
                scheme: Scheme::File,
                host: None,
                port: None,
                user: None,
                path: rest.to_string(),
            });
        }

        // Unknown scheme: valid token before "://" means an external
        // helper (git-remote-<scheme>) owns this URL.
        if let Some(sep) = url.find("://") {
            let scheme = &url[..sep];
            if !scheme.is_empty()
                && scheme
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'-' || b == b'.')
            {
                return Ok(GitUrl {
                    scheme: Scheme::Ext(scheme.to_ascii_lowercase()),
                    host: None,
                    port: None,
                    user: None,
                    path: url.to_string(),
                });
            }
        }

        // Absolute or relative local paths (Unix or Windows)
        if url.starts_with('/')
            || url.starts_with('.')
            || (url.len() >= 2 && url.as_bytes()[1] == b':' && url.as_bytes()[0].is_ascii_alphabetic() && url.len() > 2 && (url.as_bytes()[2] == b'\\' || url.as_bytes()[2] == b'/'))
        {
            return Ok(GitUrl {
                scheme: Scheme::Local,
                host: None,
                port: None,
                user: None,
                path: url.to_string(),
            });
        }

        // SCP-like syntax: [user@]host:path
        if let Some(colon_pos) = url.find(':') {
            // Windows drive letter check: single letter before colon
            if colon_pos == 1 && url.as_bytes()[0].is_ascii_alphabetic() {
                return Ok(GitUrl {
                    scheme: Scheme::Local,
                    host: None,
                    port: None,
                    user: None,
                    path: url.to_string(),
                });
            }

            let host_part = &url[..colon_pos];
            let path = &url[colon_pos + 1..];

            let (user, host) = if let Some(at_pos) = host_part.find('@') {
                (
                    Some(host_part[..at_pos].to_string()),
                    host_part[at_pos + 1..].to_string(),
                )
            } else {
                (None, host_part.to_string())
            };

            if host.is_empty() {
                return Err(TransportError::InvalidUrl(format!(
                    "empty host in SCP-like URL: {}",
                    url
                )));
            }

            return Ok(GitUrl {
                scheme: Scheme::Ssh,
                host: Some(host),
                port: None,
                user,
                path: path.to_string(),
            });
        }

        Err(TransportError::InvalidUrl(format!(
            "could not parse URL: {}",
            url
        )))
    }

    /// The `host:port` authority for HTTP base URLs and daemon connects.
    pub fn authority(&self) -> String {
        let mut s = self.host.clone().unwrap_or_default();
        if let Some(port) = self.port {
            s.push(':');
            s.push_str(&port.to_string());
        }
        s
    }
}

/// Parse a URL with the scheme already stripped: [user@]host[:port]/path
fn parse_standard(scheme: Scheme, rest: &str) -> Result<GitUrl, TransportError> {
    let (authority, path) = match rest.find('/') {
        Some(slash_pos) => (&rest[..slash_pos], &rest[slash_pos..]),
        None => (rest, "/"),
    };

    let (user, host_port) = if let Some(at_pos) = authority.find('@') {
        (
            Some(authority[..at_pos].to_string()),
            &authority[at_pos + 1..],
        )
    } else {
        (None, authority)
    };

    // IPv6 literals are bracketed: [::1]:port
    let (host, port) = if host_port.starts_with('[') {
        match host_port.find(']') {
            Some(bracket_end) => {
                let host = &host_port[1..bracket_end];
                let after = &host_port[bracket_end + 1..];
                let port = match after.strip_prefix(':') {
                    Some(port_str) => Some(port_str.parse::<u16>().map_err(|_| {
                        TransportError::InvalidUrl(format!("invalid port: {}", port_str))
                    })?),
                    None => None,
                };
                (host.to_string(), port)
            }
            None => {
                return Err(TransportError::InvalidUrl("unclosed IPv6 bracket".into()));
            }
        }
    } else if let Some(colon_pos) = host_port.rfind(':') {
        let host = &host_port[..colon_pos];
        let port_str = &host_port[colon_pos + 1..];
        let port = port_str.parse::<u16>().map_err(|_| {
            TransportError::InvalidUrl(format!("invalid port: {}", port_str))
        })?;
        (host.to_string(), Some(port))
    } else {
        (host_port.to_string(), None)
    };

    if host.is_empty() {
        return Err(TransportError::InvalidUrl("empty host".into()));
    }

    Ok(GitUrl {
        scheme,
        host: Some(host),
        port,
        user,
        path: path.to_string(),
    })
}
