//! SSH connections: spawn an ssh client running the remote service.

use std::process::{Command, Stdio};

use crate::local::ChildConnection;
use crate::{Connection, ConnectOptions, GitUrl, Service, TransportError};

/// Resolve the SSH command to use.
///
/// Checked in order:
/// 1. `GIT_SSH_COMMAND` environment variable (may contain arguments)
/// 2. caller-supplied command (e.g. from configuration)
/// 3. `GIT_SSH` environment variable
/// 4. default: `ssh`
fn resolve_ssh_command(configured: Option<&str>) -> String {
    if let Ok(cmd) = std::env::var("GIT_SSH_COMMAND") {
        return cmd;
    }
    if let Some(cmd) = configured {
        return cmd.to_string();
    }
    if let Ok(cmd) = std::env::var("GIT_SSH") {
        return cmd;
    }
    "ssh".to_string()
}

/// Connect to a remote repository over SSH.
pub fn connect(
    url: &GitUrl,
    service: Service,
    options: &ConnectOptions,
) -> Result<Box<dyn Connection>, TransportError> {
    connect_with_command(url, service, options, None)
}

/// Connect over SSH with an optional configured ssh command.
pub fn connect_with_command(
    url: &GitUrl,
    service: Service,
    options: &ConnectOptions,
    ssh_command: Option<&str>,
) -> Result<Box<dyn Connection>, TransportError> {
    let host = url
        .host
        .as_deref()
        .ok_or_else(|| TransportError::InvalidUrl("SSH URL requires a host".into()))?;

    let exec = options
        .remote_exec
        .as_deref()
        .unwrap_or(service.as_str());
    let ssh_cmd = resolve_ssh_command(ssh_command);

    // A command with arguments has to go through the shell
    let mut cmd = if ssh_cmd.contains(' ') {
        let mut c = Command::new("sh");
        c.arg("-c");

        let mut shell_cmd = ssh_cmd.clone();
        if options.protocol.is_some() {
            shell_cmd.push_str(" -o SendEnv=GIT_PROTOCOL");
        }
        if let Some(port) = url.port {
            shell_cmd.push_str(&format!(" -p {}", port));
        }
        match url.user {
            Some(ref user) => shell_cmd.push_str(&format!(" {}@{}", user, host)),
            None => shell_cmd.push_str(&format!(" {}", host)),
        }
        shell_cmd.push_str(&format!(" {} '{}'", exec, url.path));
        c.arg(shell_cmd);
        c
    } else {
        let mut c = Command::new(&ssh_cmd);
        if options.protocol.is_some() {
            // Ask the server side to honor our protocol request
            c.arg("-o").arg("SendEnv=GIT_PROTOCOL");
        }
        if let Some(port) = url.port {
            c.arg("-p").arg(port.to_string());
        }
        match url.user {
            Some(ref user) => {
                c.arg(format!("{}@{}", user, host));
            }
            None => {
                c.arg(host);
            }
        }
        c.arg(exec);
        c.arg(&url.path);
        c
    };

    if let Some(value) = options.protocol.and_then(|v| v.request_value()) {
        cmd.env("GIT_PROTOCOL", value);
    }

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    let child = cmd
        .spawn()
        .map_err(|e| TransportError::Ssh(format!("failed to spawn ssh: {}", e)))?;

    // ssh propagates the remote side's exit; 128/255 show up after the
    // server closes first on an otherwise successful exchange.
    Ok(Box::new(
        ChildConnection::new(child, "ssh").with_benign_exit_codes(&[128, 255]),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ssh_command() {
        // Only deterministic when the env vars are unset; skip otherwise.
        if std::env::var_os("GIT_SSH_COMMAND").is_none()
            && std::env::var_os("GIT_SSH").is_none()
        {
            assert_eq!(resolve_ssh_command(None), "ssh");
            assert_eq!(resolve_ssh_command(Some("my-ssh")), "my-ssh");
        }
    }
}
