//! Node identifiers of the form `name@host:port`
//!
//! The canonical string is the node's identity on the wire: two ids are the
//! same node exactly when their strings are equal. IPv6 hosts are bracketed
//! in canonical form.

use crate::error::{CoreError, CoreResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]{0,63}$").expect("node name regex"));

static HOSTNAME_LABEL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?$").expect("label regex"));

/// Validated `name@host:port` node identifier
#[derive(Debug, Clone)]
pub struct NodeId {
    full: String,
    name: String,
    host: String,
    port: u16,
}

impl NodeId {
    /// Parse and validate a node id string
    pub fn parse(input: &str) -> CoreResult<Self> {
        let (name, rest) = input
            .split_once('@')
            .ok_or_else(|| CoreError::invalid_node_id(format!("missing '@' in '{}'", input)))?;

        if !NAME_RE.is_match(name) {
            return Err(CoreError::invalid_node_id(format!(
                "invalid name part in '{}'",
                input
            )));
        }

        let (host, port_str) = split_host_port(input, rest)?;

        let port: u16 = port_str
            .parse()
            .map_err(|_| CoreError::invalid_node_id(format!("invalid port in '{}'", input)))?;
        if port == 0 {
            return Err(CoreError::invalid_node_id(format!(
                "port must be 1-65535 in '{}'",
                input
            )));
        }

        let canonical_host = validate_host(input, &host)?;
        let full = format!("{}@{}:{}", name, canonical_host, port);

        Ok(Self {
            full,
            name: name.to_string(),
            host: canonical_host,
            port,
        })
    }

    /// Build a node id from components, validating each part
    pub fn new(name: &str, host: &str, port: u16) -> CoreResult<Self> {
        Self::parse(&format!("{}@{}:{}", name, host, port))
    }

    /// Whether a string is a valid node id
    pub fn is_valid(input: &str) -> bool {
        Self::parse(input).is_ok()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host with IPv6 brackets stripped, suitable for socket APIs
    pub fn host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` in dialable form (IPv6 hosts bracketed)
    pub fn addr_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn as_str(&self) -> &str {
        &self.full
    }
}

// Identity is the canonical string.
impl PartialEq for NodeId {
    fn eq(&self, other: &Self) -> bool {
        self.full == other.full
    }
}

impl Eq for NodeId {}

impl std::hash::Hash for NodeId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.full.hash(state);
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.full.cmp(&other.full)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full)
    }
}

impl FromStr for NodeId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.full)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Split `host:port`, handling bracketed and bare IPv6 hosts.
fn split_host_port(input: &str, rest: &str) -> CoreResult<(String, String)> {
    if let Some(stripped) = rest.strip_prefix('[') {
        // Bracketed IPv6: [::1]:4369
        let (host, after) = stripped.split_once(']').ok_or_else(|| {
            CoreError::invalid_node_id(format!("unterminated '[' in '{}'", input))
        })?;
        let port = after.strip_prefix(':').ok_or_else(|| {
            CoreError::invalid_node_id(format!("missing port after ']' in '{}'", input))
        })?;
        return Ok((host.to_string(), port.to_string()));
    }

    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| CoreError::invalid_node_id(format!("missing port in '{}'", input)))?;
    Ok((host.to_string(), port.to_string()))
}

/// Validate a host part and return its canonical form.
fn validate_host(input: &str, host: &str) -> CoreResult<String> {
    if host.is_empty() {
        return Err(CoreError::invalid_node_id(format!(
            "empty host in '{}'",
            input
        )));
    }

    if host.parse::<Ipv4Addr>().is_ok() {
        return Ok(host.to_string());
    }

    if let Ok(v6) = host.parse::<Ipv6Addr>() {
        return Ok(format!("[{}]", v6));
    }

    // RFC-1123 hostname: dot-separated labels, 253 chars total.
    if host.len() <= 253
        && !host.contains(':')
        && host
            .split('.')
            .all(|label| HOSTNAME_LABEL_RE.is_match(label))
    {
        return Ok(host.to_string());
    }

    Err(CoreError::invalid_node_id(format!(
        "invalid host part in '{}'",
        input
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_hostname_form() {
        let id = NodeId::parse("alpha@example.com:4369").unwrap();
        assert_eq!(id.name(), "alpha");
        assert_eq!(id.host(), "example.com");
        assert_eq!(id.port(), 4369);
        assert_eq!(id.to_string(), "alpha@example.com:4369");
    }

    #[test]
    fn parses_ipv4_form() {
        let id = NodeId::parse("n1@127.0.0.1:9000").unwrap();
        assert_eq!(id.addr_string(), "127.0.0.1:9000");
    }

    #[test]
    fn parses_ipv6_forms() {
        let bracketed = NodeId::parse("n1@[::1]:9000").unwrap();
        assert_eq!(bracketed.host(), "::1");
        assert_eq!(bracketed.addr_string(), "[::1]:9000");

        // Bare IPv6 is accepted and canonicalized with brackets.
        let bare = NodeId::parse("n1@::1:9000").unwrap();
        assert_eq!(bare.to_string(), "n1@[::1]:9000");
        assert_eq!(bare, bracketed);
    }

    #[test]
    fn rejects_bad_names() {
        assert!(!NodeId::is_valid("1abc@host:1"));
        assert!(!NodeId::is_valid("@host:1"));
        assert!(!NodeId::is_valid("a b@host:1"));
        let long_name = "a".repeat(65);
        assert!(!NodeId::is_valid(&format!("{}@host:1", long_name)));
    }

    #[test]
    fn rejects_bad_hosts_and_ports() {
        assert!(!NodeId::is_valid("n@:1"));
        assert!(!NodeId::is_valid("n@host:0"));
        assert!(!NodeId::is_valid("n@host:65536"));
        assert!(!NodeId::is_valid("n@host"));
        assert!(!NodeId::is_valid("n@-bad.example:1"));
        assert!(!NodeId::is_valid("n@[::1:1"));
    }

    #[test]
    fn round_trips_through_parse() {
        for s in ["a@b:1", "node-1@10.0.0.1:65535", "x_y@[fe80::1]:4369"] {
            let id = NodeId::parse(s).unwrap();
            let again = NodeId::parse(&id.to_string()).unwrap();
            assert_eq!(id, again);
        }
    }

    #[test]
    fn serde_round_trip() {
        let id = NodeId::parse("alpha@localhost:4369").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"alpha@localhost:4369\"");
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
