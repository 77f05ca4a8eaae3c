//! Per-interface options override file.
//!
//! The file is a JSON object whose keys are matched case-insensitively:
//!
//! ```json
//! {
//!   "IPv4":       ["203.0.113.9", "198.51.100.40/27"],
//!   "Hostname":   "web01",
//!   "Domainname": "example.com",
//!   "Gateway":    "203.0.113.1",
//!   "PvtIPs":     "192.168.0.0/16",
//!   "Tftp":       "203.0.113.2"
//! }
//! ```
//!
//! Missing or empty values mean "not set". Values that fail to parse are
//! dropped with a warning; only unreadable files and malformed JSON are
//! errors.

use crate::error::{DhcpdError, Result};
use crate::types::Ipv4Network;
use serde_json::{Map, Value};
use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::{debug, warn};

/// Parsed override options. `None` fields fall through to built-in policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverrideOptions {
    /// Candidate leases, in file order. Bare addresses carry the implicit
    /// /24 prefix.
    pub addresses: Vec<Ipv4Network>,
    pub hostname: Option<String>,
    pub domain: Option<String>,
    pub gateway: Option<Ipv4Addr>,
    pub private_range: Option<Ipv4Network>,
    pub tftp: Option<Ipv4Addr>,
}

impl OverrideOptions {
    /// Loads options from `path`. A missing file yields empty options.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no options file");
                return Ok(Self::default());
            }
            Err(e) => return Err(DhcpdError::options(path.display().to_string(), e)),
        };
        Self::parse(&bytes).map_err(|e| DhcpdError::options(path.display().to_string(), e))
    }

    /// Parses the JSON document. Invalid individual values are skipped.
    pub fn parse(bytes: &[u8]) -> std::result::Result<Self, String> {
        let document: Map<String, Value> =
            serde_json::from_slice(bytes).map_err(|e| format!("failed to unmarshal: {e}"))?;

        let mut options = Self::default();
        for (key, value) in &document {
            if value.is_null() {
                continue;
            }
            match key.to_ascii_lowercase().as_str() {
                "ipv4" => {
                    let entries = value
                        .as_array()
                        .ok_or_else(|| format!("{key}: expected an array of strings"))?;
                    for entry in entries {
                        let entry = string_value(key, entry)?;
                        match parse_address(entry) {
                            Some(address) => options.addresses.push(address),
                            None => warn!(value = entry, "failed to parse IPv4 override, ignoring"),
                        }
                    }
                }
                "hostname" => options.hostname = non_empty(string_value(key, value)?),
                "domainname" => options.domain = non_empty(string_value(key, value)?),
                "gateway" => options.gateway = parse_field(key, string_value(key, value)?),
                "pvtips" => {
                    options.private_range = non_empty(string_value(key, value)?).and_then(|s| {
                        match s.parse::<Ipv4Network>() {
                            Ok(range) => Some(range),
                            Err(e) => {
                                warn!(field = %key, value = %s, error = %e, "failed to parse override, ignoring");
                                None
                            }
                        }
                    })
                }
                "tftp" => options.tftp = parse_field(key, string_value(key, value)?),
                _ => debug!(key = %key, "unknown options key"),
            }
        }
        Ok(options)
    }
}

fn string_value<'v>(key: &str, value: &'v Value) -> std::result::Result<&'v str, String> {
    value
        .as_str()
        .ok_or_else(|| format!("{key}: expected a string, got {value}"))
}

fn non_empty(s: &str) -> Option<String> {
    Some(s.trim().to_string()).filter(|s| !s.is_empty())
}

fn parse_field(key: &str, value: &str) -> Option<Ipv4Addr> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    match value.parse() {
        Ok(addr) => Some(addr),
        Err(e) => {
            warn!(field = %key, value, error = %e, "failed to parse override, ignoring");
            None
        }
    }
}

/// `a.b.c.d` gets the implicit /24, `a.b.c.d/nn` keeps its prefix.
fn parse_address(s: &str) -> Option<Ipv4Network> {
    let s = s.trim();
    if s.contains('/') {
        s.parse().ok()
    } else {
        s.parse().ok().map(Ipv4Network::implicit)
    }
}
