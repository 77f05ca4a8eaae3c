//! Command line arguments and the immutable server configuration.
//!
//! `Args` is parsed once in `main` and validated into a [`ServerConfig`],
//! which is then shared by reference with every listener. Invalid patterns
//! or networks are fatal at startup.

use crate::error::{DhcpdError, Result};
use crate::monitor::LinkReadiness;
use crate::types::Ipv4Network;
use clap::{Parser, ValueEnum};
use regex::Regex;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::level_filters::LevelFilter;

/// Default DNS server when none is configured.
pub const DEFAULT_DNS: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

/// Default interface pattern for tap devices.
pub const DEFAULT_INTERFACE_PATTERN: &str = "tap.*_0";

/// Default private range deprioritized during lease selection.
pub const DEFAULT_PRIVATE_RANGE: &str = "192.168.0.0/16";

/// Default prefix for hostname and options override files.
pub const DEFAULT_OVERRIDE_PREFIX: &str = "/var/lib/dhcpd-unnumbered/hostname.";

/// Default lease time (30 minutes).
pub const DEFAULT_LEASE_TIME: Duration = Duration::from_secs(30 * 60);

/// Default bound on concurrently handled datagrams per process.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 256;

/// Log verbosity accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    None,
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl LogLevel {
    /// Maps to a tracing filter. `fatal` has no tracing equivalent and
    /// collapses onto `error`.
    pub fn as_filter(&self) -> LevelFilter {
        match self {
            LogLevel::None => LevelFilter::OFF,
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Error | LogLevel::Fatal => LevelFilter::ERROR,
        }
    }
}

/// DHCP server for unnumbered interfaces.
#[derive(Debug, Parser)]
#[command(name = "dhcpd-unnumbered", version, about, long_about = None)]
pub struct Args {
    /// DHCP lease time (e.g. 30m, 1h, 90s).
    #[arg(long = "leasetime", default_value = "30m", value_parser = parse_duration)]
    pub lease_time: Duration,

    /// Regex to match interfaces.
    #[arg(long = "regex", default_value = DEFAULT_INTERFACE_PATTERN)]
    pub regex: String,

    /// Additionally bind VRF interfaces matching this regex.
    #[arg(long = "bind")]
    pub bind: Option<String>,

    /// Private IP range. Addresses in this range do not qualify for initial
    /// offers when a public address is also routed to the interface.
    #[arg(long = "pvtcidr", default_value = DEFAULT_PRIVATE_RANGE)]
    pub pvtcidr: String,

    /// Generate hostnames from the leased address (a-b-c-d.domainname).
    #[arg(long = "dynamic-hostname")]
    pub dynamic_hostname: bool,

    /// Read hostname from <override-file-prefix><interface name>, and
    /// options from <override-file-prefix><interface name>.options.
    #[arg(long = "hostname-override")]
    pub hostname_override: bool,

    /// Path and file prefix for hostname and options override files.
    #[arg(long = "override-file-prefix", default_value = DEFAULT_OVERRIDE_PREFIX)]
    pub override_file_prefix: String,

    /// Static hostname handed out in offers.
    #[arg(long = "hostname", default_value = "localhost")]
    pub hostname: String,

    /// Domain name handed out in offers.
    #[arg(long = "domainname", default_value = "localdomain")]
    pub domainname: String,

    /// Boot file to offer in DHCP replies.
    #[arg(long = "bootfile")]
    pub bootfile: Option<String>,

    /// TFTP server to offer in DHCP replies.
    #[arg(long = "tftp")]
    pub tftp: Option<Ipv4Addr>,

    /// DNS server to offer; repeat for more than one server.
    #[arg(long = "dns")]
    pub dns: Vec<Ipv4Addr>,

    /// Log level.
    #[arg(long = "loglevel", value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Maximum number of requests handled concurrently.
    #[arg(long = "max-in-flight", default_value_t = DEFAULT_MAX_IN_FLIGHT)]
    pub max_in_flight: usize,

    /// Only consider a link up once it has transmitted packets.
    #[arg(long = "require-link-traffic")]
    pub require_link_traffic: bool,
}

/// Validated, immutable server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interfaces on which requests are answered.
    pub interface_pattern: Regex,
    /// VRF devices that get their own scoped listener.
    pub vrf_pattern: Option<Regex>,
    pub lease_time: Duration,
    pub private_range: Ipv4Network,
    /// Never empty once validated.
    pub dns_servers: Vec<Ipv4Addr>,
    pub dynamic_hostname: bool,
    pub hostname_override: bool,
    pub override_prefix: String,
    pub hostname: String,
    pub domain: String,
    pub bootfile: Option<String>,
    pub tftp: Option<Ipv4Addr>,
    pub max_in_flight: usize,
    pub link_readiness: LinkReadiness,
}

impl ServerConfig {
    /// Validates command line arguments.
    pub fn from_args(args: &Args) -> Result<Self> {
        let interface_pattern = Regex::new(&args.regex)
            .map_err(|e| DhcpdError::invalid_config("regex", e))?;

        let vrf_pattern = args
            .bind
            .as_deref()
            .filter(|pattern| !pattern.is_empty())
            .map(Regex::new)
            .transpose()
            .map_err(|e| DhcpdError::invalid_config("bind", e))?;

        let private_range: Ipv4Network = args
            .pvtcidr
            .parse()
            .map_err(|e| DhcpdError::invalid_config("pvtcidr", e))?;

        let dns_servers = if args.dns.is_empty() {
            vec![DEFAULT_DNS]
        } else {
            args.dns.clone()
        };

        if args.max_in_flight == 0 {
            return Err(DhcpdError::invalid_config(
                "max-in-flight",
                "must be at least 1",
            ));
        }

        let lease_secs = args.lease_time.as_secs();
        if lease_secs == 0 || lease_secs > u64::from(u32::MAX) {
            return Err(DhcpdError::invalid_config(
                "leasetime",
                format!("{lease_secs}s is outside 1s..=2^32-1s"),
            ));
        }

        let link_readiness = if args.require_link_traffic {
            LinkReadiness::RequireTraffic
        } else {
            LinkReadiness::OperStateOnly
        };

        Ok(Self {
            interface_pattern,
            vrf_pattern,
            lease_time: args.lease_time,
            private_range,
            dns_servers,
            dynamic_hostname: args.dynamic_hostname,
            hostname_override: args.hostname_override,
            override_prefix: args.override_file_prefix.clone(),
            hostname: args.hostname.clone(),
            domain: args.domainname.clone(),
            bootfile: args.bootfile.clone().filter(|b| !b.is_empty()),
            tftp: args.tftp,
            max_in_flight: args.max_in_flight,
            link_readiness,
        })
    }

    /// Lease time in seconds as carried by option 51.
    pub fn lease_secs(&self) -> u32 {
        u32::try_from(self.lease_time.as_secs()).unwrap_or(u32::MAX)
    }

    /// Path of the hostname override file for an interface.
    pub fn hostname_file(&self, interface: &str) -> PathBuf {
        PathBuf::from(format!("{}{}", self.override_prefix, interface))
    }

    /// Configuration built from the default command line.
    pub fn with_defaults() -> Result<Self> {
        Self::from_args(&Args::parse_from(["dhcpd-unnumbered"]))
    }

    /// Path of the options override file for an interface.
    pub fn options_file(&self, interface: &str) -> PathBuf {
        PathBuf::from(format!("{}{}.options", self.override_prefix, interface))
    }
}

/// Parses durations such as `30m`, `1h30m`, `90s` or a bare number of
/// seconds.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = 0u64;
    let mut digits = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit = match c {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => return Err(format!("invalid duration unit '{c}' in '{s}'")),
        };
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("missing value before '{c}' in '{s}'"))?;
        total = value
            .checked_mul(unit)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(|| format!("duration '{s}' overflows"))?;
        digits.clear();
    }
    if !digits.is_empty() {
        return Err(format!("missing unit after '{digits}' in '{s}'"));
    }
    Ok(Duration::from_secs(total))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        let mut argv = vec!["dhcpd-unnumbered"];
        argv.extend_from_slice(args);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_args(&parse(&[])).unwrap();
        assert_eq!(config.lease_time, DEFAULT_LEASE_TIME);
        assert_eq!(config.dns_servers, vec![DEFAULT_DNS]);
        assert_eq!(config.private_range.to_string(), "192.168.0.0/16");
        assert!(config.vrf_pattern.is_none());
        assert!(config.interface_pattern.is_match("tap.123456_0"));
        assert_eq!(config.link_readiness, LinkReadiness::OperStateOnly);
    }

    #[test]
    fn test_repeated_dns() {
        let config =
            ServerConfig::from_args(&parse(&["--dns", "1.1.1.1", "--dns", "9.9.9.9"])).unwrap();
        assert_eq!(
            config.dns_servers,
            vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(9, 9, 9, 9)]
        );
    }

    #[test]
    fn test_invalid_regex_is_fatal() {
        let err = ServerConfig::from_args(&parse(&["--regex", "tap(["])).unwrap_err();
        assert!(matches!(err, DhcpdError::InvalidConfig { ref field, .. } if field == "regex"));
    }

    #[test]
    fn test_invalid_cidr_is_fatal() {
        let err = ServerConfig::from_args(&parse(&["--pvtcidr", "192.168.0.0"])).unwrap_err();
        assert!(matches!(err, DhcpdError::InvalidConfig { ref field, .. } if field == "pvtcidr"));
    }

    #[test]
    fn test_empty_bind_means_no_vrfs() {
        let config = ServerConfig::from_args(&parse(&["--bind", ""])).unwrap();
        assert!(config.vrf_pattern.is_none());
    }

    #[test]
    fn test_override_paths() {
        let config =
            ServerConfig::from_args(&parse(&["--override-file-prefix", "/tmp/host."])).unwrap();
        assert_eq!(
            config.hostname_file("tap.1_0"),
            PathBuf::from("/tmp/host.tap.1_0")
        );
        assert_eq!(
            config.options_file("tap.1_0"),
            PathBuf::from("/tmp/host.tap.1_0.options")
        );
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30m"), Ok(Duration::from_secs(1800)));
        assert_eq!(parse_duration("1h30m"), Ok(Duration::from_secs(5400)));
        assert_eq!(parse_duration("45s"), Ok(Duration::from_secs(45)));
        assert_eq!(parse_duration("600"), Ok(Duration::from_secs(600)));
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("m").is_err());
        assert!(parse_duration("10m5").is_err());
    }

    #[test]
    fn test_log_level_filter() {
        assert_eq!(LogLevel::None.as_filter(), LevelFilter::OFF);
        assert_eq!(LogLevel::Warning.as_filter(), LevelFilter::WARN);
        assert_eq!(LogLevel::Fatal.as_filter(), LevelFilter::ERROR);
    }

    #[test]
    fn test_require_link_traffic() {
        let config = ServerConfig::from_args(&parse(&["--require-link-traffic"])).unwrap();
        assert_eq!(config.link_readiness, LinkReadiness::RequireTraffic);
    }
}
