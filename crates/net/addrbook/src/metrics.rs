//! Address Book Metrics

use metrics::{Counter, Gauge};

/// Address Book Metrics
#[derive(Clone, Debug)]
pub(crate) struct AddrBookMetrics {
    /// Records inserted or extended by add/set
    addrs_added_total: Counter,
    /// Addresses handed to the subscriber fan-out
    broadcasts_total: Counter,
    /// Records dropped after their expiry passed
    records_expired_total: Counter,
    /// Live address stream subscribers
    subscribers: Gauge,
}

impl Default for AddrBookMetrics {
    fn default() -> Self {
        Self {
            addrs_added_total: metrics::counter!("addrbook.addrs_added_total"),
            broadcasts_total: metrics::counter!("addrbook.broadcasts_total"),
            records_expired_total: metrics::counter!("addrbook.records_expired_total"),
            subscribers: metrics::gauge!("addrbook.subscribers"),
        }
    }
}

impl AddrBookMetrics {
    pub(crate) fn inc_addrs_added(&self) {
        self.addrs_added_total.increment(1);
    }

    pub(crate) fn inc_broadcasts(&self) {
        self.broadcasts_total.increment(1);
    }

    pub(crate) fn add_records_expired(&self, count: usize) {
        if count > 0 {
            self.records_expired_total.increment(count as u64);
        }
    }

    pub(crate) fn inc_subscribers(&self) {
        self.subscribers.increment(1.0);
    }

    pub(crate) fn dec_subscribers(&self) {
        self.subscribers.decrement(1.0);
    }
}
