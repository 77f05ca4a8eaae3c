//! Hostname and domain selection.
//!
//! Hostname and domain walk their priority chains independently: options
//! override, static override file, dynamic hostname, configured default.

use crate::config::ServerConfig;
use crate::options::OverrideOptions;
use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::debug;

/// Hostname derived from the leased address, `a-b-c-d`.
pub fn dynamic_hostname(address: Ipv4Addr) -> String {
    address.to_string().replace('.', "-")
}

/// Hostname and optional domain read from a static override file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostnameOverride {
    pub hostname: Option<String>,
    pub domain: Option<String>,
}

/// Reads `name[.domain]` from an override file.
///
/// The content is trimmed and split on the first dot. Empty parts count
/// as absent. A missing file is an `io::ErrorKind::NotFound` error that
/// callers treat as "no override".
pub fn read_hostname_override(path: &Path) -> io::Result<HostnameOverride> {
    let content = fs::read_to_string(path)?;
    let trimmed = content.trim();
    let (hostname, domain) = match trimmed.split_once('.') {
        Some((hostname, domain)) => (hostname, Some(domain)),
        None => (trimmed, None),
    };

    Ok(HostnameOverride {
        hostname: Some(hostname.to_string()).filter(|h| !h.is_empty()),
        domain: domain.map(str::to_string).filter(|d| !d.is_empty()),
    })
}

/// Resolves hostname and domain for a reply.
pub struct HostnamePolicy<'a> {
    config: &'a ServerConfig,
}

impl<'a> HostnamePolicy<'a> {
    pub fn new(config: &'a ServerConfig) -> Self {
        Self { config }
    }

    /// Returns `(hostname, domain)` for a lease on `interface`.
    pub fn resolve(
        &self,
        interface: &str,
        lease: Ipv4Addr,
        options: &OverrideOptions,
    ) -> (String, String) {
        let mut hostname = if self.config.dynamic_hostname {
            dynamic_hostname(lease)
        } else {
            self.config.hostname.clone()
        };
        let mut domain = self.config.domain.clone();

        if self.config.hostname_override {
            let path = self.config.hostname_file(interface);
            match read_hostname_override(&path) {
                Ok(file) => {
                    if let Some(h) = file.hostname {
                        hostname = h;
                    }
                    if let Some(d) = file.domain {
                        domain = d;
                    }
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "no static hostname override");
                }
            }
        }

        if let Some(h) = options.hostname.as_ref().filter(|h| !h.is_empty()) {
            hostname = h.clone();
        }
        if let Some(d) = options.domain.as_ref().filter(|d| !d.is_empty()) {
            domain = d.clone();
        }

        (hostname, domain)
    }
}
