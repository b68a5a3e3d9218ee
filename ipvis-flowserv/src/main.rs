//! ipvis-flowserv daemon: streams live flow batches to UDP subscribers.

use anyhow::Context;
use clap::Parser;
use ipvis_flowserv::collector::Collector;
use ipvis_flowserv::config::{Args, Config, resolve_endpoint};
use ipvis_flowserv::rules::{FileRuleProvider, FirewallRuleSet, NoRules, RuleProvider};
use ipvis_flowserv::subnets::{HttpSubnetProvider, StaticSubnetProvider, Subnet, SubnetProvider};
use ipvis_flowserv::wire::SubnetSnapshot;
use ipvis_flowserv::PacketCapture;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ipvis_flowserv=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match Config::from_args(Args::parse()) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };

    info!(
        interface = %config.interface,
        network = %config.local_network,
        port = config.port,
        "ipvis-flowserv starting..."
    );

    let snapshot = SubnetSnapshot::build(
        &config.local_network,
        &gather_subnets(&config).await,
        config.batch_capacity,
    );

    let rules = match load_rules(&config) {
        Ok(r) => r,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Failed to load firewall rules");
            std::process::exit(1);
        }
    };

    let capture = match PacketCapture::open(&config.interface, config.promiscuous) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to open capture");
            std::process::exit(1);
        }
    };

    let control = match UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port)).await {
        Ok(s) => s,
        Err(e) => {
            error!(port = config.port, error = %e, "Failed to bind control socket");
            std::process::exit(1);
        }
    };

    let fanout = match UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to bind fan-out socket");
            std::process::exit(1);
        }
    };

    let mut collector = Collector::new(&config, snapshot, rules, fanout, Instant::now());

    for endpoint in &config.subscribers {
        match resolve_endpoint(endpoint, config.port).await {
            Ok(addr) => {
                if let Err(e) = collector.subscribe(addr, Instant::now()) {
                    warn!(subscriber = %endpoint, error = %e, "Static subscriber not registered");
                }
            }
            Err(e) => warn!(subscriber = %endpoint, error = %e, "Failed to resolve subscriber"),
        }
    }

    let (mut sigint, mut sigterm) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(i), Ok(t)) => (i, t),
        (Err(e), _) | (_, Err(e)) => {
            error!(error = %e, "Failed to register signal handlers");
            std::process::exit(1);
        }
    };

    let shutdown = async move {
        tokio::select! {
            _ = sigint.recv() => { info!("Received SIGINT"); }
            _ = sigterm.recv() => { info!("Received SIGTERM"); }
        }
    };

    let stats = collector.run(capture, control, shutdown).await;
    info!(?stats, "ipvis-flowserv stopped");
}

/// Subnets from the directory (if configured) followed by static ones.
///
/// A failed directory fetch leaves only the static subnets.
async fn gather_subnets(config: &Config) -> Vec<Subnet> {
    let max = config.batch_capacity;
    let mut subnets = Vec::new();

    if let Some(url) = &config.subnet_url {
        let provider = HttpSubnetProvider::new(url.clone(), config.subnet_credentials.clone());
        match provider.fetch_subnets(max).await {
            Ok(list) => subnets.extend(list),
            Err(e) => warn!(url = %url, error = %e, "Failed to fetch subnet list"),
        }
    }

    let remaining = max.saturating_sub(subnets.len());
    let provider = StaticSubnetProvider::new(config.static_subnets.iter().copied());
    if let Ok(list) = provider.fetch_subnets(remaining).await {
        subnets.extend(list);
    }

    subnets
}

fn load_rules(config: &Config) -> anyhow::Result<FirewallRuleSet> {
    let rules = match &config.rules_file {
        Some(path) => FileRuleProvider::new(path)
            .fetch_rules()
            .with_context(|| format!("reading {}", path.display()))?,
        None => NoRules.fetch_rules()?,
    };
    Ok(rules)
}
