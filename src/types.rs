use std::fmt;
use std::net::IpAddr;

/// Opaque circuit identifier assigned by the daemon.
///
/// Unique while the circuit exists; may be reused after long idle periods.
/// Treated as an opaque key and never parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CircuitId(String);

impl CircuitId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CircuitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 40-character hex relay identity.
///
/// Circuit-path responses may carry a leading `$` and mixed case; the
/// constructor normalizes both so every variant of the same identity
/// compares and hashes equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn normalize(raw: &str) -> Self {
        let stripped = raw.strip_prefix('$').unwrap_or(raw);
        Self(stripped.to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Browser tab handle as seen by the platform layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TabId(pub u64);

/// Stream-isolation credential: the join key between the proxy-side and
/// control-side observations.
///
/// Stored as `username|password` built from the unescaped field values.
/// `|` is not permitted in either field by the daemon, so the encoding is
/// unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SocksCredential(String);

impl SocksCredential {
    pub fn from_parts(username: &str, password: &str) -> Self {
        Self(format!("{}|{}", username, password))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Classification of one circuit hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Relay,
    Bridge {
        /// Configured pluggable-transport tag ("vanilla", "obfs4", ...).
        /// `None` when the bridge is not in the local configuration.
        transport: Option<String>,
    },
}

/// Resolved metadata for one hop. Missing fields stay `None`; a hop with
/// nothing resolvable is still a valid (blank) entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeData {
    pub kind: NodeKind,
    pub ip: Option<IpAddr>,
    pub country: Option<String>,
}

impl NodeData {
    pub fn relay(ip: Option<IpAddr>) -> Self {
        Self {
            kind: NodeKind::Relay,
            ip,
            country: None,
        }
    }

    pub fn bridge(transport: Option<String>, ip: Option<IpAddr>) -> Self {
        Self {
            kind: NodeKind::Bridge { transport },
            ip,
            country: None,
        }
    }

    pub fn is_bridge(&self) -> bool {
        matches!(self.kind, NodeKind::Bridge { .. })
    }
}

/// Ordered relay path of one circuit, first hop first.
///
/// Built once by the resolver and immutable afterwards; consumers share it
/// as `Arc<CircuitPath>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitPath {
    pub hops: Vec<NodeData>,
}
