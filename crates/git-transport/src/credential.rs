//! Credential helper interface.
//!
//! Authentication material comes from the external `git credential`
//! machinery, which serializes prompting process-wide. The HTTP adapter
//! calls [`Credential::fill`] on a 401 and reports the outcome back via
//! `approve`/`reject` so helpers can update their stores.

use std::io::Write;
use std::process::{Command, Stdio};

use crate::TransportError;

/// A credential context: what we are authenticating against, and the
/// username/password once filled.
#[derive(Debug, Clone, Default)]
pub struct Credential {
    pub protocol: String,
    pub host: String,
    pub path: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Credential {
    /// Describe the target of an HTTP request.
    pub fn for_url(protocol: &str, host: &str, path: Option<&str>) -> Self {
        Self {
            protocol: protocol.to_string(),
            host: host.to_string(),
            path: path.map(str::to_string),
            username: None,
            password: None,
        }
    }

    /// Whether both username and password are present.
    pub fn is_filled(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// Ask the credential machinery to fill in username and password.
    pub fn fill(&mut self) -> Result<(), TransportError> {
        let output = self.run_helper("fill", true)?;

        let response = String::from_utf8_lossy(&output);
        for line in response.lines() {
            if let Some(val) = line.strip_prefix("username=") {
                self.username = Some(val.to_string());
            } else if let Some(val) = line.strip_prefix("password=") {
                self.password = Some(val.to_string());
            }
        }

        if self.is_filled() {
            Ok(())
        } else {
            Err(TransportError::AuthenticationFailed)
        }
    }

    /// Report that the filled credentials worked.
    pub fn approve(&self) {
        let _ = self.run_helper("approve", false);
    }

    /// Report that the filled credentials were rejected.
    pub fn reject(&mut self) {
        let _ = self.run_helper("reject", false);
        self.username = None;
        self.password = None;
    }

    fn describe(&self) -> String {
        let mut input = format!("protocol={}\nhost={}\n", self.protocol, self.host);
        if let Some(ref path) = self.path {
            input.push_str(&format!("path={}\n", path));
        }
        if let Some(ref username) = self.username {
            input.push_str(&format!("username={}\n", username));
        }
        if let Some(ref password) = self.password {
            input.push_str(&format!("password={}\n", password));
        }
        input.push('\n');
        input
    }

    fn run_helper(&self, action: &str, capture: bool) -> Result<Vec<u8>, TransportError> {
        let mut child = Command::new("git")
            .args(["credential", action])
            .stdin(Stdio::piped())
            .stdout(if capture { Stdio::piped() } else { Stdio::null() })
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                TransportError::ConnectionFailed(format!("git credential {} failed: {}", action, e))
            })?;

        if let Some(ref mut stdin) = child.stdin {
            stdin.write_all(self.describe().as_bytes())?;
        }
        drop(child.stdin.take());

        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(TransportError::AuthenticationFailed);
        }
        Ok(output.stdout)
    }
}
