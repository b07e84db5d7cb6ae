//! Capability parsing and negotiation.
//!
//! In v0/v1 the first advertised ref line carries, after a NUL byte, a
//! space-separated capability token list (`thin-pack`, `agent=git/2.39`,
//! …). In v2 capabilities arrive as their own packet stream, where a
//! command token like `fetch=shallow wait-for-done filter` declares the
//! features available under that command.

use git_hash::HashAlgorithm;
use git_transport::ProtocolVersion;

use crate::ProtocolError;

/// Parsed set of server capabilities for one connection.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    entries: Vec<CapabilityEntry>,
}

/// A single capability, optionally with a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityEntry {
    pub name: String,
    pub value: Option<String>,
}

fn parse_token(token: &str) -> CapabilityEntry {
    match token.split_once('=') {
        Some((name, value)) => CapabilityEntry {
            name: name.to_string(),
            value: Some(value.to_string()),
        },
        None => CapabilityEntry {
            name: token.to_string(),
            value: None,
        },
    }
}

impl Capabilities {
    /// Parse the NUL-separated capability list of a v0/v1 advertisement.
    ///
    /// `<oid> HEAD\0multi_ack thin-pack side-band-64k symref=HEAD:refs/heads/main agent=git/2.39.0`
    pub fn parse_v1(caps_str: &str) -> Self {
        Self {
            entries: caps_str.split_whitespace().map(parse_token).collect(),
        }
    }

    /// Parse v2 capability advertisement lines, one capability or
    /// command descriptor per packet.
    pub fn parse_v2(lines: &[Vec<u8>]) -> Self {
        let mut entries = Vec::new();
        for line in lines {
            let s = String::from_utf8_lossy(line);
            let s = s.trim_end_matches('\n');
            if s.is_empty() || s == "version 2" {
                continue;
            }
            entries.push(parse_token(s));
        }
        Self { entries }
    }

    /// Whether `name` was advertised (bare or with a value).
    pub fn supports(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    /// The value of a `name=value` capability.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .and_then(|e| e.value.as_deref())
    }

    /// All values of a capability that may repeat (`symref=`).
    pub fn values(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.name == name)
            .filter_map(|e| e.value.as_deref())
            .collect()
    }

    /// Whether a v2 `command` declares `feature` in its descriptor
    /// (`fetch=shallow wait-for-done` → `supports_feature("fetch", "shallow")`).
    pub fn supports_feature(&self, command: &str, feature: &str) -> bool {
        self.value(command)
            .map(|features| features.split_whitespace().any(|f| f == feature))
            .unwrap_or(false)
    }

    /// All capability entries, in advertisement order.
    pub fn entries(&self) -> &[CapabilityEntry] {
        &self.entries
    }

    /// Verify the advertised object format against the local algorithm.
    ///
    /// An absent `object-format` implies SHA-1 in every protocol
    /// version; an explicit value must match exactly.
    pub fn verify_object_format(
        &self,
        algo: HashAlgorithm,
        version: ProtocolVersion,
    ) -> Result<(), ProtocolError> {
        match self.value("object-format") {
            Some(advertised) => {
                if HashAlgorithm::from_name(advertised) != Some(algo) {
                    return Err(ProtocolError::Protocol(format!(
                        "mismatched object format: server uses {}, repository uses {}",
                        advertised,
                        algo.name()
                    )));
                }
                Ok(())
            }
            None if algo == HashAlgorithm::Sha1 => Ok(()),
            None => Err(ProtocolError::Protocol(format!(
                "server did not advertise an object format, but the repository uses {} ({:?})",
                algo.name(),
                version
            ))),
        }
    }
}

impl std::fmt::Display for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, e) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            match e.value {
                Some(ref v) => write!(f, "{}={}", e.name, v)?,
                None => write!(f, "{}", e.name)?,
            }
        }
        Ok(())
    }
}

/// Sideband mode for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidebandMode {
    /// No sideband: raw pack bytes after the ACK phase.
    None,
    /// `side-band`: 1000-byte frames.
    Band,
    /// `side-band-64k`: full-size frames.
    Band64k,
}

/// Pick the widest sideband the server offers.
pub fn select_sideband(caps: &Capabilities) -> SidebandMode {
    if caps.supports("side-band-64k") {
        SidebandMode::Band64k
    } else if caps.supports("side-band") {
        SidebandMode::Band
    } else {
        SidebandMode::None
    }
}

/// The agent token this client sends.
pub const AGENT: &str = concat!("agent=git-remoting/", env!("CARGO_PKG_VERSION"));

/// Multi-ack flavor negotiated for a v0/v1 fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiAck {
    None,
    MultiAck,
    Detailed,
}

/// Choose the client capability list for a v0/v1 fetch.
pub fn negotiate_fetch(server: &Capabilities) -> (Vec<String>, MultiAck) {
    let mut client = Vec::new();

    let multi_ack = if server.supports("multi_ack_detailed") {
        client.push("multi_ack_detailed".into());
        MultiAck::Detailed
    } else if server.supports("multi_ack") {
        client.push("multi_ack".into());
        MultiAck::MultiAck
    } else {
        MultiAck::None
    };

    if server.supports("side-band-64k") {
        client.push("side-band-64k".into());
    } else if server.supports("side-band") {
        client.push("side-band".into());
    }
    for cap in ["thin-pack", "ofs-delta", "include-tag"] {
        if server.supports(cap) {
            client.push(cap.into());
        }
    }
    if let Some(value) = server.value("object-format") {
        client.push(format!("object-format={}", value));
    }

    client.push(AGENT.into());
    (client, multi_ack)
}

/// Choose the client capability list for a v0/v1 push.
pub fn negotiate_push(server: &Capabilities) -> Vec<String> {
    let mut client = Vec::new();

    if server.supports("report-status-v2") {
        client.push("report-status-v2".into());
    } else if server.supports("report-status") {
        client.push("report-status".into());
    }
    for cap in ["ofs-delta", "side-band-64k"] {
        if server.supports(cap) {
            client.push(cap.into());
        }
    }
    if let Some(value) = server.value("object-format") {
        client.push(format!("object-format={}", value));
    }

    client.push(AGENT.into());
    client
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_v1_capabilities() {
        let caps = Capabilities::parse_v1(
            "multi_ack thin-pack side-band side-band-64k ofs-delta symref=HEAD:refs/heads/main agent=git/2.39.0",
        );
        assert!(caps.supports("multi_ack"));
        assert!(caps.supports("side-band-64k"));
        assert_eq!(caps.value("symref"), Some("HEAD:refs/heads/main"));
        assert_eq!(caps.value("agent"), Some("git/2.39.0"));
        assert!(!caps.supports("nonexistent"));
    }

    #[test]
    fn parse_v2_command_descriptors() {
        let lines = vec![
            b"version 2\n".to_vec(),
            b"agent=git/2.39.0\n".to_vec(),
            b"ls-refs=unborn\n".to_vec(),
            b"fetch=shallow wait-for-done filter\n".to_vec(),
            b"object-format=sha1\n".to_vec(),
        ];
        let caps = Capabilities::parse_v2(&lines);
        assert_eq!(caps.value("agent"), Some("git/2.39.0"));
        assert!(caps.supports("ls-refs"));
        assert!(caps.supports_feature("fetch", "shallow"));
        assert!(caps.supports_feature("fetch", "wait-for-done"));
        assert!(caps.supports_feature("ls-refs", "unborn"));
        assert!(!caps.supports_feature("fetch", "sideband-all"));
        assert!(!caps.supports_feature("push", "atomic"));
    }

    #[test]
    fn repeated_values_collected() {
        let caps = Capabilities::parse_v1(
            "symref=HEAD:refs/heads/main symref=refs/heads/alias:refs/heads/main",
        );
        assert_eq!(caps.values("symref").len(), 2);
    }

    #[test]
    fn sideband_selection() {
        assert_eq!(
            select_sideband(&Capabilities::parse_v1("side-band side-band-64k")),
            SidebandMode::Band64k
        );
        assert_eq!(
            select_sideband(&Capabilities::parse_v1("side-band")),
            SidebandMode::Band
        );
        assert_eq!(
            select_sideband(&Capabilities::parse_v1("thin-pack")),
            SidebandMode::None
        );
    }

    #[test]
    fn object_format_agreement() {
        use git_transport::ProtocolVersion as V;

        let explicit = Capabilities::parse_v1("object-format=sha256");
        assert!(explicit
            .verify_object_format(HashAlgorithm::Sha256, V::V0)
            .is_ok());
        assert!(explicit
            .verify_object_format(HashAlgorithm::Sha1, V::V0)
            .is_err());

        // Absence implies SHA-1
        let silent = Capabilities::parse_v1("thin-pack");
        assert!(silent
            .verify_object_format(HashAlgorithm::Sha1, V::V0)
            .is_ok());
        assert!(silent
            .verify_object_format(HashAlgorithm::Sha256, V::V2)
            .is_err());
    }

    #[test]
    fn fetch_negotiation_prefers_detailed_acks() {
        let server = Capabilities::parse_v1(
            "multi_ack multi_ack_detailed thin-pack side-band-64k ofs-delta include-tag",
        );
        let (client, multi_ack) = negotiate_fetch(&server);
        assert_eq!(multi_ack, MultiAck::Detailed);
        assert!(client.contains(&"multi_ack_detailed".to_string()));
        assert!(client.contains(&"side-band-64k".to_string()));
        assert!(client.contains(&"thin-pack".to_string()));
        assert!(client.iter().any(|c| c.starts_with("agent=")));
    }

    #[test]
    fn push_negotiation_prefers_v2_report() {
        let server = Capabilities::parse_v1("report-status report-status-v2 ofs-delta");
        let client = negotiate_push(&server);
        assert!(client.contains(&"report-status-v2".to_string()));
        assert!(!client.contains(&"report-status".to_string()));
    }
}
