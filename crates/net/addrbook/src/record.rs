//! A single stored address with its TTL class and expiry.

use std::time::Duration;

use libp2p::Multiaddr;
use web_time::Instant;

use crate::ttl::Expiry;

/// One address known for a peer.
///
/// `ttl` is the class the address was stored under, not the time remaining.
/// Equality looks at the address bytes only.
#[derive(Debug, Clone)]
pub struct ExpiringAddr {
    pub addr: Multiaddr,
    pub ttl: Duration,
    pub expires: Expiry,
}

impl ExpiringAddr {
    /// Record for `addr` expiring `ttl` after `now`.
    pub fn new(addr: Multiaddr, ttl: Duration, now: Instant) -> Self {
        Self {
            addr,
            ttl,
            expires: Expiry::after(now, ttl),
        }
    }

    pub fn is_expired_by(&self, now: Instant) -> bool {
        self.expires.is_expired_by(now)
    }

    /// Move the record to another TTL class, restarting its clock at `now`.
    pub(crate) fn retarget(&mut self, ttl: Duration, now: Instant) {
        self.ttl = ttl;
        self.expires = Expiry::after(now, ttl);
    }
}

impl PartialEq for ExpiringAddr {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for ExpiringAddr {}
