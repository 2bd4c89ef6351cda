//! Peer address store with TTL merge rules, driving the subscription fan-out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use libp2p::{Multiaddr, PeerId};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use web_time::Instant;

use crate::config::{AddrBookConfig, AddrBookError};
use crate::metrics::AddrBookMetrics;
use crate::record::ExpiringAddr;
use crate::subscription::{AddrStream, AddrSubManager};
use crate::traits::{AddrBook, AddrBookPeerId};

/// Records of one peer, keyed by address (multiaddr equality is byte equality).
type PeerAddrs = HashMap<Multiaddr, ExpiringAddr>;

/// In-memory [`AddrBook`].
///
/// A single mutex guards the store and is held across broadcasts, so the
/// snapshot a new stream starts from and the broadcasts that follow it are
/// totally ordered with respect to every other write. Lock order is always
/// store, then subscriber index.
pub struct AddrManager<Id: AddrBookPeerId = PeerId> {
    config: AddrBookConfig,
    addrs: Mutex<HashMap<Id, PeerAddrs>>,
    subs: Arc<AddrSubManager<Id>>,
    metrics: AddrBookMetrics,
}

impl<Id: AddrBookPeerId> Default for AddrManager<Id> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Id: AddrBookPeerId> AddrManager<Id> {
    /// Empty book with the default configuration.
    pub fn new() -> Self {
        Self::build(AddrBookConfig::default())
    }

    /// Empty book, rejecting an invalid `config`.
    pub fn with_config(config: AddrBookConfig) -> Result<Self, AddrBookError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: AddrBookConfig) -> Self {
        let metrics = AddrBookMetrics::default();
        Self {
            subs: Arc::new(AddrSubManager::with_metrics(
                config.stream_channel_capacity,
                metrics.clone(),
            )),
            config,
            addrs: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Configuration the book was built with.
    pub fn config(&self) -> &AddrBookConfig {
        &self.config
    }

    /// Subscription fan-out shared with every open [`AddrStream`].
    pub fn sub_manager(&self) -> &Arc<AddrSubManager<Id>> {
        &self.subs
    }

    /// Stored record for one address, expired or not.
    pub fn record(&self, peer: &Id, addr: &Multiaddr) -> Option<ExpiringAddr> {
        self.addrs.lock().get(peer)?.get(addr).cloned()
    }

    /// Number of peers with stored records, including expired ones.
    pub fn peer_count(&self) -> usize {
        self.addrs.lock().len()
    }

    /// Number of open streams for `peer`.
    pub fn subscriber_count(&self, peer: &Id) -> usize {
        self.subs.subscriber_count(peer)
    }

    /// Drop every expired record and every peer left without records.
    ///
    /// Returns the number of records removed.
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let mut store = self.addrs.lock();

        let mut removed = 0;
        store.retain(|_, records| {
            let before = records.len();
            records.retain(|_, record| !record.is_expired_by(now));
            removed += before - records.len();
            !records.is_empty()
        });
        drop(store);

        self.metrics.add_records_expired(removed);
        removed
    }

    /// Sweep expired records every `gc_interval` until `shutdown` fires.
    ///
    /// Reads already filter expired records, so running this only bounds how
    /// long stale entries hold memory.
    pub async fn run_gc(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.gc_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        debug!(interval = ?self.config.gc_interval(), "address book gc started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!("address book gc received shutdown signal");
                    break;
                }

                _ = interval.tick() => {
                    let removed = self.prune_expired();
                    if removed > 0 {
                        trace!(removed, "pruned expired addresses");
                    }
                }
            }
        }
    }

    pub fn spawn_gc(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run_gc(shutdown))
    }
}

impl<Id: AddrBookPeerId> AddrBook<Id> for AddrManager<Id> {
    fn add_addrs(&self, peer: &Id, addrs: &[Multiaddr], ttl: Duration) {
        if ttl.is_zero() {
            warn!(?peer, "ignoring add with zero ttl");
            return;
        }

        let now = Instant::now();
        let mut store = self.addrs.lock();

        for addr in addrs {
            if addr.is_empty() {
                warn!(?peer, "was passed empty multiaddr");
                continue;
            }

            let candidate = ExpiringAddr::new(addr.clone(), ttl, now);
            let records = store.entry(peer.clone()).or_default();

            // TTLs only extend here; set_addrs is the way to shorten them.
            let live = match records.get(addr) {
                Some(existing) if existing.expires >= candidate.expires => continue,
                Some(existing) => !existing.is_expired_by(now),
                None => false,
            };

            trace!(?peer, %addr, ?ttl, "adding address");
            records.insert(addr.clone(), candidate);
            self.metrics.inc_addrs_added();
            // Open streams already carry a live address; extending it is silent.
            if !live {
                self.subs.broadcast(peer, addr);
            }
        }
    }

    fn set_addrs(&self, peer: &Id, addrs: &[Multiaddr], ttl: Duration) {
        let now = Instant::now();
        let mut store = self.addrs.lock();

        for addr in addrs {
            if addr.is_empty() {
                warn!(?peer, "was passed empty multiaddr");
                continue;
            }

            if ttl.is_zero() {
                let Some(records) = store.get_mut(peer) else {
                    continue;
                };
                if records.remove(addr).is_some() {
                    trace!(?peer, %addr, "removed address");
                }
                if records.is_empty() {
                    store.remove(peer);
                }
                continue;
            }

            trace!(?peer, %addr, ?ttl, "setting address");
            store
                .entry(peer.clone())
                .or_default()
                .insert(addr.clone(), ExpiringAddr::new(addr.clone(), ttl, now));
            self.metrics.inc_addrs_added();
            self.subs.broadcast(peer, addr);
        }
    }

    fn update_addrs(&self, peer: &Id, old_ttl: Duration, new_ttl: Duration) {
        let now = Instant::now();
        let mut store = self.addrs.lock();
        let Some(records) = store.get_mut(peer) else {
            return;
        };

        let mut updated = 0usize;
        for record in records.values_mut().filter(|record| record.ttl == old_ttl) {
            record.retarget(new_ttl, now);
            updated += 1;
        }

        if updated > 0 {
            trace!(?peer, ?old_ttl, ?new_ttl, updated, "updated address ttls");
        }
    }

    fn addrs(&self, peer: &Id) -> Vec<Multiaddr> {
        let now = Instant::now();
        let mut store = self.addrs.lock();
        let Some(records) = store.get_mut(peer) else {
            return Vec::new();
        };

        let before = records.len();
        records.retain(|_, record| !record.is_expired_by(now));
        let expired = before - records.len();

        let good: Vec<Multiaddr> = records.keys().cloned().collect();
        if records.is_empty() {
            store.remove(peer);
        }
        drop(store);

        if expired > 0 {
            trace!(?peer, expired, "dropped expired addresses");
            self.metrics.add_records_expired(expired);
        }
        good
    }

    fn clear_addrs(&self, peer: &Id) {
        if self.addrs.lock().remove(peer).is_some() {
            trace!(?peer, "cleared addresses");
        }
    }

    fn peers(&self) -> Vec<Id> {
        self.addrs.lock().keys().cloned().collect()
    }

    fn addr_stream(&self, peer: &Id, cancel: CancellationToken) -> AddrStream {
        let now = Instant::now();
        let store = self.addrs.lock();

        let initial: Vec<Multiaddr> = store
            .get(peer)
            .map(|records| {
                records
                    .values()
                    .filter(|record| !record.is_expired_by(now))
                    .map(|record| record.addr.clone())
                    .collect()
            })
            .unwrap_or_default();

        // Registered before the store lock is released so no broadcast slips
        // between the snapshot and the subscription.
        self.subs.subscribe(peer.clone(), initial, cancel)
    }
}
