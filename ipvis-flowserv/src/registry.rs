//! Subscriber registry.
//!
//! A fixed-size slot table of UDP endpoints with expiry times. Lookups are
//! linear scans over the table; an empty slot is `None`. Expired entries are
//! only removed when the live set is requested.

use std::net::SocketAddrV4;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::info;

/// Default number of subscriber slots.
pub const DEFAULT_MAX_CLIENTS: usize = 32;

/// Default subscriber lifetime without renewal.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Longest accepted subscriber lifetime; longer timeouts are clamped.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// The registry has no free slot.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("Subscriber table is full ({capacity} slots)")]
pub struct RegistryFull {
    pub capacity: usize,
}

/// Result of a successful subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    /// A free slot was taken.
    Added,
    /// The endpoint was already registered; its expiry was extended.
    Renewed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    addr: SocketAddrV4,
    expires_at: Instant,
}

/// Fixed-capacity table of subscribed endpoints.
#[derive(Debug)]
pub struct SubscriberRegistry {
    slots: Vec<Option<Slot>>,
    count: usize,
    timeout: Duration,
    default_port: u16,
}

impl SubscriberRegistry {
    /// Create an empty registry.
    ///
    /// `default_port` replaces port 0 in subscribe and unsubscribe.
    /// `timeout` is clamped to [`MAX_TIMEOUT`].
    pub fn new(capacity: usize, timeout: Duration, default_port: u16) -> Self {
        SubscriberRegistry {
            slots: vec![None; capacity],
            count: 0,
            timeout: timeout.min(MAX_TIMEOUT),
            default_port,
        }
    }

    /// Expiry for an entry renewed at `now`, saturating instead of overflowing.
    fn deadline(&self, now: Instant) -> Instant {
        [self.timeout, MAX_TIMEOUT / 365, Duration::from_secs(60 * 60)]
            .into_iter()
            .find_map(|timeout| now.checked_add(timeout))
            .unwrap_or(now)
    }

    fn resolve(&self, addr: SocketAddrV4) -> SocketAddrV4 {
        if addr.port() == 0 {
            SocketAddrV4::new(*addr.ip(), self.default_port)
        } else {
            addr
        }
    }

    /// Register `addr` or renew its expiry.
    pub fn subscribe(
        &mut self,
        addr: SocketAddrV4,
        now: Instant,
    ) -> Result<Subscription, RegistryFull> {
        let addr = self.resolve(addr);
        let expires_at = self.deadline(now);
        let capacity = self.slots.len();

        for slot in self.slots.iter_mut().flatten() {
            if slot.addr == addr {
                slot.expires_at = expires_at;
                return Ok(Subscription::Renewed);
            }
        }

        match self.slots.iter_mut().find(|slot| slot.is_none()) {
            Some(free) => {
                *free = Some(Slot { addr, expires_at });
                self.count += 1;
                info!(subscriber = %addr, clients = self.count, "Added a subscriber");
                Ok(Subscription::Added)
            }
            None => Err(RegistryFull { capacity }),
        }
    }

    /// Remove `addr`. Returns whether it was registered.
    pub fn unsubscribe(&mut self, addr: SocketAddrV4) -> bool {
        let addr = self.resolve(addr);

        for slot in self.slots.iter_mut() {
            if matches!(slot, Some(s) if s.addr == addr) {
                *slot = None;
                self.count -= 1;
                info!(subscriber = %addr, clients = self.count, "Removed a subscriber");
                return true;
            }
        }
        false
    }

    /// Remove every entry whose expiry lies before `now`.
    ///
    /// Returns the number of entries removed.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<SocketAddrV4> = self
            .slots
            .iter()
            .flatten()
            .filter(|slot| slot.expires_at < now)
            .map(|slot| slot.addr)
            .collect();

        for addr in &expired {
            self.unsubscribe(*addr);
        }
        expired.len()
    }

    /// Endpoints still live at `now`, in slot order.
    ///
    /// Expired entries are unsubscribed as a side effect.
    pub fn live_subscribers(&mut self, now: Instant) -> impl Iterator<Item = SocketAddrV4> + '_ {
        self.expire(now);
        self.iter()
    }

    /// Registered endpoints in slot order, without expiry checks.
    pub fn iter(&self) -> impl Iterator<Item = SocketAddrV4> + '_ {
        self.slots.iter().flatten().map(|slot| slot.addr)
    }

    pub fn contains(&self, addr: SocketAddrV4) -> bool {
        let addr = self.resolve(addr);
        self.iter().any(|a| a == addr)
    }

    /// Expiry of `addr`, if registered.
    pub fn expires_at(&self, addr: SocketAddrV4) -> Option<Instant> {
        let addr = self.resolve(addr);
        self.slots
            .iter()
            .flatten()
            .find(|slot| slot.addr == addr)
            .map(|slot| slot.expires_at)
    }

    /// Number of registered endpoints.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;

    const PORT: u16 = 9990;

    fn ep(last: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, last), port)
    }

    fn registry(capacity: usize) -> SubscriberRegistry {
        SubscriberRegistry::new(capacity, Duration::from_secs(10), PORT)
    }

    fn assert_consistent(reg: &SubscriberRegistry) {
        let all: Vec<_> = reg.iter().collect();
        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(all.len(), unique.len(), "duplicate entries");
        assert_eq!(reg.len(), all.len(), "count out of sync");
    }

    #[test]
    fn subscribe_then_renew() {
        let now = Instant::now();
        let mut reg = registry(4);

        assert_eq!(reg.subscribe(ep(1, 1000), now), Ok(Subscription::Added));
        let later = now + Duration::from_secs(5);
        assert_eq!(reg.subscribe(ep(1, 1000), later), Ok(Subscription::Renewed));

        assert_eq!(reg.len(), 1);
        assert_eq!(reg.expires_at(ep(1, 1000)), Some(later + Duration::from_secs(10)));
        assert_consistent(&reg);
    }

    #[test]
    fn port_zero_means_default_port() {
        let now = Instant::now();
        let mut reg = registry(4);

        reg.subscribe(ep(1, 0), now).unwrap();
        assert!(reg.contains(ep(1, PORT)));
        assert_eq!(reg.subscribe(ep(1, PORT), now), Ok(Subscription::Renewed));

        assert!(reg.unsubscribe(ep(1, 0)));
        assert!(reg.is_empty());
    }

    #[test]
    fn same_address_different_ports_are_distinct() {
        let now = Instant::now();
        let mut reg = registry(4);
        reg.subscribe(ep(1, 1000), now).unwrap();
        reg.subscribe(ep(1, 1001), now).unwrap();
        assert_eq!(reg.len(), 2);
        assert_consistent(&reg);
    }

    #[test]
    fn unsubscribe_unknown_is_noop() {
        let now = Instant::now();
        let mut reg = registry(2);
        reg.subscribe(ep(2, 2000), now).unwrap();

        assert!(!reg.unsubscribe(ep(1, 1000)));
        assert_eq!(reg.len(), 1);
        assert!(reg.contains(ep(2, 2000)));
    }

    #[test]
    fn rejects_when_full() {
        let now = Instant::now();
        let mut reg = registry(3);
        for i in 1..=3 {
            reg.subscribe(ep(i, 1000), now).unwrap();
        }

        let before: Vec<_> = reg.iter().collect();
        assert_eq!(
            reg.subscribe(ep(4, 1000), now),
            Err(RegistryFull { capacity: 3 })
        );
        assert_eq!(reg.iter().collect::<Vec<_>>(), before);
        assert_eq!(reg.len(), 3);

        // Renewal still works while full
        assert_eq!(reg.subscribe(ep(2, 1000), now), Ok(Subscription::Renewed));
    }

    #[test]
    fn freed_slot_is_reused() {
        let now = Instant::now();
        let mut reg = registry(2);
        reg.subscribe(ep(1, 1000), now).unwrap();
        reg.subscribe(ep(2, 1000), now).unwrap();
        reg.unsubscribe(ep(1, 1000));

        assert_eq!(reg.subscribe(ep(3, 1000), now), Ok(Subscription::Added));
        assert_eq!(reg.iter().collect::<Vec<_>>(), vec![ep(3, 1000), ep(2, 1000)]);
    }

    #[test]
    fn expired_entries_leave_on_live_scan() {
        let now = Instant::now();
        let mut reg = registry(4);
        reg.subscribe(ep(1, 1000), now).unwrap();
        reg.subscribe(ep(2, 1000), now + Duration::from_secs(5)).unwrap();

        // Exactly at expiry the entry is still live
        let at_expiry = now + Duration::from_secs(10);
        assert_eq!(reg.live_subscribers(at_expiry).count(), 2);

        let after = now + Duration::from_secs(11);
        let live: Vec<_> = reg.live_subscribers(after).collect();
        assert_eq!(live, vec![ep(2, 1000)]);
        assert_eq!(reg.len(), 1);
        assert_consistent(&reg);
    }

    #[test]
    fn huge_timeout_is_clamped() {
        let now = Instant::now();
        let mut reg = SubscriberRegistry::new(4, Duration::from_secs(u64::MAX), PORT);
        assert_eq!(reg.timeout(), MAX_TIMEOUT);

        assert_eq!(reg.subscribe(ep(1, 1000), now), Ok(Subscription::Added));
        assert_eq!(reg.subscribe(ep(1, 1000), now), Ok(Subscription::Renewed));
        assert_eq!(reg.expires_at(ep(1, 1000)), Some(now + MAX_TIMEOUT));

        let next_day = now + Duration::from_secs(24 * 60 * 60);
        assert_eq!(reg.live_subscribers(next_day).count(), 1);
    }

    #[test]
    fn mixed_operations_keep_invariants() {
        let now = Instant::now();
        let mut reg = registry(5);
        let ops: [(u8, u16, bool); 12] = [
            (1, 1, true),
            (2, 1, true),
            (1, 1, true),
            (3, 0, true),
            (3, PORT, true),
            (2, 1, false),
            (4, 4, true),
            (5, 5, true),
            (6, 6, true),
            (7, 7, true),
            (1, 1, false),
            (7, 7, true),
        ];

        for (last, port, on) in ops {
            if on {
                let _ = reg.subscribe(ep(last, port), now);
            } else {
                reg.unsubscribe(ep(last, port));
            }
            assert_consistent(&reg);
            assert!(reg.len() <= reg.capacity());
        }
    }
}
