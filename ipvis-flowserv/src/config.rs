//! Process configuration: command line and environment.

use crate::batch::{DEFAULT_BATCH_CAPACITY, MIN_RATE};
use crate::classify::LocalNetwork;
use crate::registry::{DEFAULT_MAX_CLIENTS, DEFAULT_TIMEOUT, MAX_TIMEOUT};
use crate::subnets::{Credentials, Subnet};
use crate::wire::MAX_BATCH_RECORDS;
use clap::{ArgAction, Parser};
use ipnet::Ipv4Net;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default UDP service port.
pub const DEFAULT_PORT: u16 = 9990;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Batch capacity must be between 1 and {max}, got {0}", max = MAX_BATCH_RECORDS)]
    BatchCapacity(usize),

    #[error("At least one subscriber slot is required")]
    MaxClients,

    #[error("Subscriber timeout must be between 1 and {max} seconds, got {0}", max = MAX_TIMEOUT.as_secs())]
    SubscriberTimeout(u64),

    #[error("Minimum flush interval must be at least one millisecond")]
    MinRate,

    #[error("Failed to enumerate interfaces: {0}")]
    Interfaces(#[source] nix::Error),

    #[error("Interface {0} has no IPv4 address; pass --local-network")]
    NoIpv4Address(String),
}

/// ipvis flow collector
#[derive(Parser, Debug, Clone)]
#[command(name = "ipvis-flowserv", version, about)]
pub struct Args {
    /// Interface to capture on
    #[arg(short, long, env = "IPVIS_INTERFACE")]
    pub interface: String,

    /// Local network in CIDR notation (defaults to the interface's IPv4 network)
    #[arg(long, env = "IPVIS_LOCAL_NETWORK")]
    pub local_network: Option<Ipv4Net>,

    /// UDP port for control requests
    #[arg(short, long, env = "IPVIS_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Flow records per batch
    #[arg(long, env = "IPVIS_BATCH_CAPACITY", default_value_t = DEFAULT_BATCH_CAPACITY)]
    pub batch_capacity: usize,

    /// Maximum number of subscribers
    #[arg(long, env = "IPVIS_MAX_CLIENTS", default_value_t = DEFAULT_MAX_CLIENTS)]
    pub max_clients: usize,

    /// Subscriber lifetime without renewal, in seconds
    #[arg(long, env = "IPVIS_SUBSCRIBER_TIMEOUT", default_value_t = DEFAULT_TIMEOUT.as_secs())]
    pub subscriber_timeout: u64,

    /// Minimum interval between time-triggered flushes, in milliseconds
    #[arg(long, env = "IPVIS_MIN_RATE", default_value_t = MIN_RATE.as_millis() as u64)]
    pub min_rate: u64,

    /// Leave the interface out of promiscuous mode
    #[arg(long = "no-promiscuous", action = ArgAction::SetFalse)]
    pub promiscuous: bool,

    /// Subnet directory URL
    #[arg(long, env = "IPVIS_SUBNET_URL")]
    pub subnet_url: Option<String>,

    /// Subnet directory credentials (user:password)
    #[arg(long, env = "IPVIS_SUBNET_AUTH", hide_env_values = true)]
    pub subnet_auth: Option<String>,

    /// Additional subnet to report (repeatable)
    #[arg(long = "subnet")]
    pub subnets: Vec<Ipv4Net>,

    /// Firewall rule file, one rule per line
    #[arg(long, env = "IPVIS_RULES_FILE")]
    pub rules_file: Option<PathBuf>,

    /// Subscriber registered at startup, host[:port] (repeatable)
    #[arg(long = "subscriber")]
    pub subscribers: Vec<String>,
}

/// Resolved, immutable collector configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub interface: String,
    pub local_network: LocalNetwork,
    pub port: u16,
    pub batch_capacity: usize,
    pub max_clients: usize,
    pub subscriber_timeout: Duration,
    pub min_rate: Duration,
    pub promiscuous: bool,
    pub subnet_url: Option<String>,
    pub subnet_credentials: Option<Credentials>,
    pub static_subnets: Vec<Subnet>,
    pub rules_file: Option<PathBuf>,
    pub subscribers: Vec<String>,
}

impl Config {
    /// Defaults for everything but the interface and local network.
    pub fn new(interface: impl Into<String>, local_network: LocalNetwork) -> Self {
        Config {
            interface: interface.into(),
            local_network,
            port: DEFAULT_PORT,
            batch_capacity: DEFAULT_BATCH_CAPACITY,
            max_clients: DEFAULT_MAX_CLIENTS,
            subscriber_timeout: DEFAULT_TIMEOUT,
            min_rate: MIN_RATE,
            promiscuous: true,
            subnet_url: None,
            subnet_credentials: None,
            static_subnets: Vec::new(),
            rules_file: None,
            subscribers: Vec::new(),
        }
    }

    /// Validate arguments and derive the local network.
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        if args.batch_capacity == 0 || args.batch_capacity > MAX_BATCH_RECORDS {
            return Err(ConfigError::BatchCapacity(args.batch_capacity));
        }
        if args.max_clients == 0 {
            return Err(ConfigError::MaxClients);
        }
        if args.subscriber_timeout == 0 || args.subscriber_timeout > MAX_TIMEOUT.as_secs() {
            return Err(ConfigError::SubscriberTimeout(args.subscriber_timeout));
        }
        if args.min_rate == 0 {
            return Err(ConfigError::MinRate);
        }

        let local_network = match args.local_network {
            Some(net) => LocalNetwork::from(net),
            None => interface_network(&args.interface)?,
        };

        Ok(Config {
            interface: args.interface,
            local_network,
            port: args.port,
            batch_capacity: args.batch_capacity,
            max_clients: args.max_clients,
            subscriber_timeout: Duration::from_secs(args.subscriber_timeout),
            min_rate: Duration::from_millis(args.min_rate),
            promiscuous: args.promiscuous,
            subnet_url: args.subnet_url,
            subnet_credentials: args.subnet_auth.as_deref().map(Credentials::parse),
            static_subnets: args.subnets.into_iter().map(Subnet::from).collect(),
            rules_file: args.rules_file,
            subscribers: args.subscribers,
        })
    }
}

/// First IPv4 address and netmask configured on `name`.
pub fn interface_network(name: &str) -> Result<LocalNetwork, ConfigError> {
    let addrs = nix::ifaddrs::getifaddrs().map_err(ConfigError::Interfaces)?;

    for ifa in addrs.filter(|ifa| ifa.interface_name == name) {
        let addr = ifa.address.as_ref().and_then(|a| a.as_sockaddr_in().copied());
        let mask = ifa.netmask.as_ref().and_then(|m| m.as_sockaddr_in().copied());
        if let (Some(addr), Some(mask)) = (addr, mask) {
            let addr = SocketAddrV4::from(addr);
            let mask = SocketAddrV4::from(mask);
            return Ok(LocalNetwork::new(*addr.ip(), *mask.ip()));
        }
    }

    Err(ConfigError::NoIpv4Address(name.to_string()))
}

/// Resolve `host[:port]` to an IPv4 endpoint, using `default_port` when
/// no port is given.
pub async fn resolve_endpoint(endpoint: &str, default_port: u16) -> io::Result<SocketAddrV4> {
    let target = match endpoint.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => endpoint.to_string(),
        _ => format!("{endpoint}:{default_port}"),
    };

    tokio::net::lookup_host(target)
        .await?
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("No IPv4 address for {endpoint}"),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["ipvis-flowserv", "--interface", "eth0"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults() {
        let config = Config::from_args(parse(&["--local-network", "129.123.0.0/16"])).unwrap();

        assert_eq!(config.interface, "eth0");
        assert_eq!(config.local_network.base(), Ipv4Addr::new(129, 123, 0, 0));
        assert_eq!(config.local_network.prefix_len(), 16);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.batch_capacity, DEFAULT_BATCH_CAPACITY);
        assert_eq!(config.max_clients, DEFAULT_MAX_CLIENTS);
        assert_eq!(config.subscriber_timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.min_rate, Duration::from_millis(41));
        assert!(config.promiscuous);
        assert!(config.subnet_credentials.is_none());
    }

    #[test]
    fn overrides() {
        let config = Config::from_args(parse(&[
            "--local-network",
            "10.8.0.0/24",
            "--port",
            "7000",
            "--batch-capacity",
            "6",
            "--max-clients",
            "2",
            "--subscriber-timeout",
            "5",
            "--min-rate",
            "100",
            "--no-promiscuous",
            "--subnet",
            "10.8.0.0/26",
            "--subnet",
            "10.8.0.64/26",
            "--subnet-auth",
            "viz:secret",
            "--subscriber",
            "viewer.example:5000",
        ]))
        .unwrap();

        assert_eq!(config.port, 7000);
        assert_eq!(config.batch_capacity, 6);
        assert_eq!(config.max_clients, 2);
        assert_eq!(config.subscriber_timeout, Duration::from_secs(5));
        assert_eq!(config.min_rate, Duration::from_millis(100));
        assert!(!config.promiscuous);
        assert_eq!(config.static_subnets.len(), 2);
        assert_eq!(config.static_subnets[1].base, Ipv4Addr::new(10, 8, 0, 64));
        assert_eq!(
            config.subnet_credentials.unwrap().password.as_deref(),
            Some("secret")
        );
        assert_eq!(config.subscribers, vec!["viewer.example:5000".to_string()]);
    }

    #[test]
    fn rejects_bad_limits() {
        let net = ["--local-network", "10.0.0.0/8"];
        let with = |extra: &[&str]| {
            let mut all = net.to_vec();
            all.extend_from_slice(extra);
            Config::from_args(parse(&all))
        };

        assert!(matches!(
            with(&["--batch-capacity", "0"]),
            Err(ConfigError::BatchCapacity(0))
        ));
        assert!(matches!(
            with(&["--batch-capacity", "100000"]),
            Err(ConfigError::BatchCapacity(100000))
        ));
        assert!(matches!(
            with(&["--max-clients", "0"]),
            Err(ConfigError::MaxClients)
        ));
        assert!(matches!(
            with(&["--subscriber-timeout", "0"]),
            Err(ConfigError::SubscriberTimeout(0))
        ));
        assert!(matches!(
            with(&["--subscriber-timeout", "18446744073709551615"]),
            Err(ConfigError::SubscriberTimeout(u64::MAX))
        ));
        assert!(matches!(with(&["--min-rate", "0"]), Err(ConfigError::MinRate)));
    }

    #[test]
    fn interface_is_required() {
        assert!(Args::try_parse_from(["ipvis-flowserv"]).is_err());
    }

    #[test]
    fn unknown_interface_has_no_network() {
        assert!(matches!(
            interface_network("ipvis-no-such-if0"),
            Err(ConfigError::NoIpv4Address(_))
        ));
    }

    #[tokio::test]
    async fn resolve_literal_endpoints() {
        assert_eq!(
            resolve_endpoint("127.0.0.1:4000", 9990).await.unwrap(),
            "127.0.0.1:4000".parse::<SocketAddrV4>().unwrap()
        );
        assert_eq!(
            resolve_endpoint("127.0.0.1", 9990).await.unwrap(),
            "127.0.0.1:9990".parse::<SocketAddrV4>().unwrap()
        );
    }
}
