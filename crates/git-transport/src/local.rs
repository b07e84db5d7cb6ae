//! Local connections: spawn the service process directly for `file://`
//! URLs and bare paths.

use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};

use crate::{Connection, ConnectOptions, GitUrl, Service, TransportError};

/// A connection backed by a child process's stdin/stdout pipes.
///
/// Shared by the local and SSH transports; the remote service reads
/// requests on its stdin and answers on its stdout.
pub struct ChildConnection {
    child: Child,
    /// Exit codes tolerated on close (e.g. ssh returning the remote's
    /// exit status after the server hangs up first).
    benign_exit_codes: &'static [i32],
    label: &'static str,
}

impl ChildConnection {
    pub fn new(child: Child, label: &'static str) -> Self {
        Self {
            child,
            benign_exit_codes: &[],
            label,
        }
    }

    pub fn with_benign_exit_codes(mut self, codes: &'static [i32]) -> Self {
        self.benign_exit_codes = codes;
        self
    }
}

impl Connection for ChildConnection {
    fn reader(&mut self) -> &mut dyn Read {
        self.child.stdout.as_mut().expect("stdout not captured")
    }

    fn writer(&mut self) -> &mut dyn Write {
        self.child.stdin.as_mut().expect("stdin not captured")
    }

    fn dispatch(&mut self) -> Result<(), TransportError> {
        self.child
            .stdin
            .as_mut()
            .expect("stdin not captured")
            .flush()?;
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<(), TransportError> {
        // Closing stdin signals EOF to the remote service
        drop(self.child.stdin.take());
        let status = self.child.wait()?;
        if !status.success() {
            let code = status.code().unwrap_or(-1);
            if !self.benign_exit_codes.contains(&code) {
                return Err(TransportError::ConnectionFailed(format!(
                    "{} exited with code {}",
                    self.label, code
                )));
            }
        }
        Ok(())
    }
}

/// Connect to a repository on the local filesystem by spawning the
/// service process with the repository path as its argument.
pub fn connect(
    url: &GitUrl,
    service: Service,
    options: &ConnectOptions,
) -> Result<Box<dyn Connection>, TransportError> {
    let exec = options
        .remote_exec
        .as_deref()
        .unwrap_or(service.as_str());

    let mut cmd = Command::new(exec);
    cmd.arg(&url.path);
    if let Some(value) = options.protocol.and_then(|v| v.request_value()) {
        cmd.env("GIT_PROTOCOL", value);
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    let child = cmd.spawn().map_err(|e| {
        TransportError::ConnectionFailed(format!("failed to spawn {}: {}", exec, e))
    })?;

    Ok(Box::new(ChildConnection::new(child, "local service")))
}
