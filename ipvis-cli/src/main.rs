use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use ipvis_flowserv::config::{DEFAULT_PORT, resolve_endpoint};
use ipvis_flowserv::registry::DEFAULT_TIMEOUT;
use ipvis_flowserv::wire::{
    self, FlowBatch, FlowRequest, MAX_DATAGRAM, PacketType, RuleChunk, SubnetRequest,
    SubnetSnapshot, WireMessage,
};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;
use tabled::{Table, Tabled};
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout_at};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// How long query subcommands wait for replies.
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "ipvis")]
#[command(about = "Client for the ipvis flow collector", long_about = None)]
struct Cli {
    /// Collector address (host[:port])
    #[arg(short, long, env = "IPVIS_SERVER", default_value = "127.0.0.1")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe and print flow batches until interrupted
    Flows {
        /// Print one line per batch instead of every record
        #[arg(long)]
        summary: bool,

        /// Local port to receive on (0 picks any)
        #[arg(short, long, default_value = "0")]
        port: u16,

        /// Seconds between subscription renewals; keep below the collector's subscriber timeout
        #[arg(
            long,
            default_value_t = DEFAULT_TIMEOUT.as_secs() / 2,
            value_parser = clap::value_parser!(u64).range(1..)
        )]
        renew: u64,
    },

    /// Show the collector's subnet snapshot
    Subnets,

    /// List the collector's firewall rules
    Rules,

    /// Send a firewall alert to every subscriber
    Alert {
        /// Alert text
        text: String,
    },
}

#[derive(Tabled)]
struct SubnetRow {
    #[tabled(rename = "SUBNET")]
    subnet: String,
    #[tabled(rename = "NETMASK")]
    netmask: Ipv4Addr,
    #[tabled(rename = "HOST BITS")]
    host_bits: String,
}

#[derive(Tabled)]
struct RuleRow {
    #[tabled(rename = "#")]
    index: u16,
    #[tabled(rename = "RULE")]
    rule: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let server = resolve_endpoint(&cli.server, DEFAULT_PORT)
        .await
        .with_context(|| format!("resolving {}", cli.server))?;

    match cli.command {
        Commands::Flows {
            summary,
            port,
            renew,
        } => flows(server, port, summary, Duration::from_secs(renew)).await,
        Commands::Subnets => subnets(server).await,
        Commands::Rules => rules(server).await,
        Commands::Alert { text } => {
            let socket = bind(0).await?;
            socket
                .send_to(&wire::firewall_alert(text.as_bytes()), server)
                .await?;
            println!("Alert sent to {server}");
            Ok(())
        }
    }
}

async fn bind(port: u16) -> anyhow::Result<UdpSocket> {
    UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
        .await
        .context("binding UDP socket")
}

async fn flows(
    server: SocketAddrV4,
    port: u16,
    summary: bool,
    renew_every: Duration,
) -> anyhow::Result<()> {
    let socket = bind(port).await?;
    let subscribe = FlowRequest { flow_on: true }.to_datagram();
    socket.send_to(&subscribe, server).await?;
    eprintln!("Subscribed to {server}, Ctrl-C to stop");

    let mut renew = tokio::time::interval(renew_every);
    renew.tick().await;
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = renew.tick() => {
                socket.send_to(&subscribe, server).await?;
                debug!("Renewed subscription");
            }
            received = socket.recv_from(&mut buf) => {
                let (n, from) = received?;
                print_datagram(&buf[..n], summary);
                debug!(from = %from, len = n, "Received datagram");
            }
        }
    }

    socket
        .send_to(&FlowRequest { flow_on: false }.to_datagram(), server)
        .await?;
    eprintln!("Unsubscribed");
    Ok(())
}

fn print_datagram(datagram: &[u8], summary: bool) {
    let msg = match WireMessage::decode(datagram) {
        Ok(m) => m,
        Err(e) => {
            debug!(error = %e, "Skipping undecodable datagram");
            return;
        }
    };

    match msg.packet_type {
        PacketType::Flow => match FlowBatch::decode(msg.payload) {
            Ok(batch) if summary => {
                let bytes: u64 = batch.records.iter().map(|r| u64::from(r.size)).sum();
                println!(
                    "{}/{}: {} records, {} bytes",
                    batch.base,
                    batch.prefix_len,
                    batch.records.len(),
                    bytes
                );
            }
            Ok(batch) => {
                for record in &batch.records {
                    println!(
                        "{:<8} {:<15} {:<5} {}",
                        record.direction.as_str(),
                        record.address(batch.base),
                        record.transport.as_str(),
                        record.size
                    );
                }
            }
            Err(e) => debug!(error = %e, "Bad flow batch"),
        },
        PacketType::Firewall => {
            println!("ALERT {}", String::from_utf8_lossy(msg.payload));
        }
        other => debug!(?other, "Ignoring unexpected packet"),
    }
}

async fn subnets(server: SocketAddrV4) -> anyhow::Result<()> {
    let socket = bind(0).await?;
    let request_id: u32 = rand::random();
    socket
        .send_to(&SubnetRequest { request_id }.to_datagram(), server)
        .await?;

    let deadline = Instant::now() + REPLY_TIMEOUT;
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, _) = timeout_at(deadline, socket.recv_from(&mut buf))
            .await
            .context("no subnet reply from collector")??;

        let Ok(msg) = WireMessage::decode(&buf[..n]) else {
            continue;
        };
        if msg.packet_type != PacketType::Subnet {
            continue;
        }
        let snapshot = SubnetSnapshot::decode(msg.payload)?;
        if snapshot.request_id != request_id {
            debug!(got = snapshot.request_id, want = request_id, "Stale subnet reply");
            continue;
        }

        println!("Local network: {}/{}", snapshot.base, snapshot.prefix_len);
        if snapshot.entries.is_empty() {
            println!("No subnets");
            return Ok(());
        }

        let base = u32::from(snapshot.base);
        let rows: Vec<SubnetRow> = snapshot
            .entries
            .iter()
            .map(|entry| SubnetRow {
                subnet: format!(
                    "{}/{}",
                    Ipv4Addr::from(base | entry.base),
                    entry.mask.leading_ones()
                ),
                netmask: Ipv4Addr::from(entry.mask),
                host_bits: format!("{:#x}", entry.base),
            })
            .collect();
        println!("{}", Table::new(rows));
        return Ok(());
    }
}

async fn rules(server: SocketAddrV4) -> anyhow::Result<()> {
    let socket = bind(0).await?;
    socket.send_to(&wire::rule_request(), server).await?;

    let deadline = Instant::now() + REPLY_TIMEOUT;
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut received: BTreeMap<u16, String> = BTreeMap::new();
    let mut total = None;

    while total.is_none_or(|t| received.len() < usize::from(t)) {
        let Ok(result) = timeout_at(deadline, socket.recv_from(&mut buf)).await else {
            break;
        };
        let (n, _) = result?;

        let Ok(msg) = WireMessage::decode(&buf[..n]) else {
            continue;
        };
        if msg.packet_type != PacketType::FwRule {
            continue;
        }
        match RuleChunk::decode(msg.payload) {
            Ok(chunk) => {
                total = Some(chunk.total);
                received.insert(chunk.index, String::from_utf8_lossy(chunk.rule).into_owned());
            }
            Err(e) => debug!(error = %e, "Bad rule chunk"),
        }
    }

    let Some(total) = total else {
        bail!("no rules received (the collector may have none configured)");
    };

    let rows: Vec<RuleRow> = received
        .iter()
        .map(|(index, rule)| RuleRow {
            index: *index,
            rule: rule.clone(),
        })
        .collect();
    println!("{}", Table::new(rows));

    let missing: Vec<u16> = (0..total).filter(|i| !received.contains_key(i)).collect();
    if !missing.is_empty() {
        eprintln!("Missing {} of {total} rules: {missing:?}", missing.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn renew_of(args: &[&str]) -> Option<u64> {
        let mut argv = vec!["ipvis", "flows"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).ok()?.command {
            Commands::Flows { renew, .. } => Some(renew),
            _ => None,
        }
    }

    #[test]
    fn renew_defaults_to_half_the_default_timeout() {
        assert_eq!(renew_of(&[]), Some(30));
    }

    #[test]
    fn renew_is_configurable() {
        assert_eq!(renew_of(&["--renew", "4"]), Some(4));
    }

    #[test]
    fn renew_of_zero_is_rejected() {
        assert_eq!(renew_of(&["--renew", "0"]), None);
    }
}
