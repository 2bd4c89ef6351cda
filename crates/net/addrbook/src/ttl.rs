//! TTL classes handed out to callers, and the absolute expiry derived from them.

use std::time::Duration;

use web_time::Instant;

/// Short-lived hints, e.g. addresses relayed by a third party.
pub const TEMP_ADDR_TTL: Duration = Duration::from_secs(10);

/// Addresses received alongside a provider record. Once these lapse, callers
/// need another lookup to reach the provider.
pub const PROVIDER_ADDR_TTL: Duration = Duration::from_secs(10 * 60);

/// Addresses of a peer we were connected to until recently.
pub const RECENTLY_CONNECTED_ADDR_TTL: Duration = Duration::from_secs(10 * 60);

/// Our own external addresses as observed by remote peers.
pub const OWN_OBSERVED_ADDR_TTL: Duration = Duration::from_secs(10 * 60);

/// Addresses that never expire for the lifetime of the process (bootnodes).
pub const PERMANENT_ADDR_TTL: Duration = Duration::MAX;

/// Addresses of a peer we are directly connected to.
///
/// Never expires in practice, but compares unequal to [`PERMANENT_ADDR_TTL`] so
/// that `update_addrs(peer, CONNECTED_ADDR_TTL, RECENTLY_CONNECTED_ADDR_TTL)`
/// on disconnect leaves bootnode addresses alone.
pub const CONNECTED_ADDR_TTL: Duration = PERMANENT_ADDR_TTL.saturating_sub(Duration::from_nanos(1));

/// Absolute instant at which a record goes stale.
///
/// `Never` is produced when `now + ttl` does not fit the monotonic clock, which
/// is always the case for the permanent sentinels. It orders after every `At`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Expiry {
    At(Instant),
    Never,
}

impl Expiry {
    /// Expiry of a record created at `now` with the given TTL.
    pub fn after(now: Instant, ttl: Duration) -> Self {
        now.checked_add(ttl).map_or(Self::Never, Self::At)
    }

    /// Strict: a record is still valid at exactly its expiry instant.
    pub fn is_expired_by(&self, now: Instant) -> bool {
        match self {
            Self::At(at) => now > *at,
            Self::Never => false,
        }
    }

    /// Time left before expiry, `None` for records that never expire.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        match self {
            Self::At(at) => Some(at.saturating_duration_since(now)),
            Self::Never => None,
        }
    }
}
