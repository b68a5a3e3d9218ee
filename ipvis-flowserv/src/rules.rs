//! Firewall rule set and paginated delivery.
//!
//! Rules are opaque descriptors. Each one travels in its own FWRULE
//! datagram tagged with its index and the rule count so a receiver can
//! detect loss and reassemble.

use crate::fanout::{DatagramSink, unicast};
use crate::wire::{MAX_RULE_LEN, RuleChunk};
use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Rule loading errors.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("Failed to read rule file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Rule {index} is {len} bytes, limit is {limit}", limit = MAX_RULE_LEN)]
    TooLong { index: usize, len: usize },

    #[error("{0} rules exceed the addressable count")]
    TooMany(usize),
}

pub type Result<T> = std::result::Result<T, RuleError>;

/// Ordered, immutable rule descriptors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirewallRuleSet {
    rules: Vec<Vec<u8>>,
}

impl FirewallRuleSet {
    pub fn new(rules: Vec<Vec<u8>>) -> Result<Self> {
        if rules.len() > u16::MAX as usize {
            return Err(RuleError::TooMany(rules.len()));
        }
        if let Some((index, rule)) = rules
            .iter()
            .enumerate()
            .find(|(_, rule)| rule.len() > MAX_RULE_LEN)
        {
            return Err(RuleError::TooLong {
                index,
                len: rule.len(),
            });
        }
        Ok(FirewallRuleSet { rules })
    }

    pub fn empty() -> Self {
        FirewallRuleSet::default()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.rules.iter().map(Vec::as_slice)
    }

    /// Rules wrapped with their position and the total count.
    pub fn chunks(&self) -> impl Iterator<Item = RuleChunk<'_>> {
        let total = self.rules.len() as u16;
        self.rules
            .iter()
            .enumerate()
            .map(move |(index, rule)| RuleChunk {
                index: index as u16,
                total,
                rule,
            })
    }

    /// Send every rule to `dest`, one datagram each, in order.
    ///
    /// Returns the number of datagrams sent successfully.
    pub fn send_rules<S: DatagramSink + ?Sized>(&self, sink: &S, dest: SocketAddrV4) -> usize {
        let sent = self
            .chunks()
            .filter(|chunk| unicast(sink, &chunk.to_datagram(), dest))
            .count();
        debug!(dest = %dest, sent, total = self.len(), "Sent firewall rules");
        sent
    }
}

/// Source of firewall rules, read once at startup.
pub trait RuleProvider {
    fn fetch_rules(&self) -> Result<FirewallRuleSet>;
}

/// No rules configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRules;

impl RuleProvider for NoRules {
    fn fetch_rules(&self) -> Result<FirewallRuleSet> {
        Ok(FirewallRuleSet::empty())
    }
}

/// Rules from a text file: one rule per line, blank lines and `#` comments skipped.
#[derive(Debug, Clone)]
pub struct FileRuleProvider {
    path: PathBuf,
}

impl FileRuleProvider {
    pub fn new(path: impl AsRef<Path>) -> Self {
        FileRuleProvider {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl RuleProvider for FileRuleProvider {
    fn fetch_rules(&self) -> Result<FirewallRuleSet> {
        let text = std::fs::read_to_string(&self.path).map_err(|source| RuleError::Io {
            path: self.path.clone(),
            source,
        })?;

        let rules = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| line.as_bytes().to_vec())
            .collect();

        let set = FirewallRuleSet::new(rules)?;
        info!(path = %self.path.display(), count = set.len(), "Loaded firewall rules");
        Ok(set)
    }
}
