//! Subnet directory retrieval and the cached topology snapshot.

use crate::classify::LocalNetwork;
use crate::wire::{MAX_SUBNET_ENTRIES, SubnetEntry, SubnetSnapshot};
use ipnet::Ipv4Net;
use std::future::Future;
use std::net::Ipv4Addr;
use thiserror::Error;
use tracing::{debug, info};

/// Length of one packed `{base, mask}` record in a directory response.
const RECORD_LEN: usize = 8;

/// Subnet retrieval errors.
#[derive(Debug, Error)]
pub enum SubnetError {
    #[error("Subnet directory request failed: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, SubnetError>;

/// A subnet as reported by the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    pub base: Ipv4Addr,
    pub mask: Ipv4Addr,
}

impl From<Ipv4Net> for Subnet {
    fn from(net: Ipv4Net) -> Self {
        Subnet {
            base: net.network(),
            mask: net.netmask(),
        }
    }
}

/// Source of the subnet list, queried once at startup.
pub trait SubnetProvider {
    /// Fetch at most `max` subnets.
    fn fetch_subnets(&self, max: usize) -> impl Future<Output = Result<Vec<Subnet>>> + Send;
}

/// Subnets given on the command line.
#[derive(Debug, Clone, Default)]
pub struct StaticSubnetProvider {
    subnets: Vec<Subnet>,
}

impl StaticSubnetProvider {
    pub fn new(subnets: impl IntoIterator<Item = Subnet>) -> Self {
        StaticSubnetProvider {
            subnets: subnets.into_iter().collect(),
        }
    }
}

impl SubnetProvider for StaticSubnetProvider {
    async fn fetch_subnets(&self, max: usize) -> Result<Vec<Subnet>> {
        Ok(self.subnets.iter().take(max).copied().collect())
    }
}

/// Basic-auth credentials for the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: Option<String>,
}

impl Credentials {
    /// Parse `user:password`; a missing colon means no password.
    pub fn parse(s: &str) -> Self {
        match s.split_once(':') {
            Some((user, password)) => Credentials {
                user: user.to_string(),
                password: Some(password.to_string()),
            },
            None => Credentials {
                user: s.to_string(),
                password: None,
            },
        }
    }
}

/// Subnet directory served over HTTP(S).
///
/// The response body is a packed sequence of 8-byte big-endian
/// `{base:u32, mask:u32}` records.
#[derive(Debug, Clone)]
pub struct HttpSubnetProvider {
    client: reqwest::Client,
    url: String,
    credentials: Option<Credentials>,
}

impl HttpSubnetProvider {
    pub fn new(url: impl Into<String>, credentials: Option<Credentials>) -> Self {
        HttpSubnetProvider {
            client: reqwest::Client::new(),
            url: url.into(),
            credentials,
        }
    }
}

impl SubnetProvider for HttpSubnetProvider {
    async fn fetch_subnets(&self, max: usize) -> Result<Vec<Subnet>> {
        let mut request = self.client.get(&self.url);
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.user, creds.password.as_ref());
        }

        let body = request.send().await?.error_for_status()?.bytes().await?;
        let subnets = parse_records(&body, max);
        debug!(url = %self.url, bytes = body.len(), count = subnets.len(), "Fetched subnet list");
        Ok(subnets)
    }
}

/// Decode packed subnet records, ignoring a trailing partial record.
pub fn parse_records(body: &[u8], max: usize) -> Vec<Subnet> {
    body.chunks_exact(RECORD_LEN)
        .take(max)
        .map(|rec| Subnet {
            base: Ipv4Addr::new(rec[0], rec[1], rec[2], rec[3]),
            mask: Ipv4Addr::new(rec[4], rec[5], rec[6], rec[7]),
        })
        .collect()
}

impl SubnetSnapshot {
    /// Build the cached snapshot from a directory listing.
    ///
    /// Only the first `max` subnets are considered. Of those, subnets whose
    /// base lies outside `local` are dropped and the rest have their network
    /// bits cleared; masks are kept as reported.
    pub fn build(local: &LocalNetwork, subnets: &[Subnet], max: usize) -> Self {
        let entries: Vec<SubnetEntry> = subnets
            .iter()
            .take(max)
            .filter(|subnet| local.contains(subnet.base))
            .take(MAX_SUBNET_ENTRIES)
            .map(|subnet| SubnetEntry {
                base: local.host_bits(subnet.base),
                mask: u32::from(subnet.mask),
            })
            .collect();

        info!(
            received = subnets.len().min(max),
            local = entries.len(),
            network = %local,
            "Built subnet snapshot"
        );

        SubnetSnapshot {
            request_id: 0,
            base: local.base(),
            prefix_len: local.prefix_len(),
            entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> LocalNetwork {
        LocalNetwork::new(Ipv4Addr::new(129, 123, 0, 0), Ipv4Addr::new(255, 255, 0, 0))
    }

    fn subnet(s: &str) -> Subnet {
        s.parse::<Ipv4Net>().unwrap().into()
    }

    #[test]
    fn snapshot_keeps_only_local_subnets_stripped() {
        let subnets = [
            subnet("129.123.4.0/24"),
            subnet("10.0.0.0/8"),
            subnet("129.123.128.0/17"),
        ];

        let snapshot = SubnetSnapshot::build(&local(), &subnets, 100);

        assert_eq!(snapshot.base, Ipv4Addr::new(129, 123, 0, 0));
        assert_eq!(snapshot.prefix_len, 16);
        assert_eq!(
            snapshot.entries,
            vec![
                SubnetEntry {
                    base: 0x0000_0400,
                    mask: 0xffff_ff00
                },
                SubnetEntry {
                    base: 0x0000_8000,
                    mask: 0xffff_8000
                },
            ]
        );
    }

    #[test]
    fn snapshot_considers_only_first_max_subnets() {
        let subnets = [
            subnet("10.0.0.0/8"),
            subnet("129.123.1.0/24"),
            subnet("129.123.2.0/24"),
        ];
        let snapshot = SubnetSnapshot::build(&local(), &subnets, 2);
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.entries[0].base, 0x0100);
    }

    #[test]
    fn parse_records_ignores_trailing_bytes() {
        let body = [
            129, 123, 4, 0, 255, 255, 255, 0, // first
            129, 123, 5, 0, 255, 255, 255, 128, // second
            1, 2, 3, // partial
        ];
        let subnets = parse_records(&body, 10);
        assert_eq!(subnets.len(), 2);
        assert_eq!(subnets[1].base, Ipv4Addr::new(129, 123, 5, 0));
        assert_eq!(subnets[1].mask, Ipv4Addr::new(255, 255, 255, 128));

        assert_eq!(parse_records(&body, 1).len(), 1);
    }

    #[test]
    fn credentials_parse() {
        assert_eq!(
            Credentials::parse("admin:s3:cret"),
            Credentials {
                user: "admin".into(),
                password: Some("s3:cret".into())
            }
        );
        assert_eq!(Credentials::parse("guest").password, None);
    }

    #[tokio::test]
    async fn static_provider_honours_max() {
        let provider =
            StaticSubnetProvider::new([subnet("129.123.1.0/24"), subnet("129.123.2.0/24")]);
        assert_eq!(provider.fetch_subnets(1).await.unwrap().len(), 1);
        assert_eq!(provider.fetch_subnets(10).await.unwrap().len(), 2);
    }
}
