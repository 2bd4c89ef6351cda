//! Per-peer address subscriptions.
//!
//! Every subscriber runs as its own task. The task starts with a sorted
//! snapshot of the peer's addresses and appends each published address it has
//! not yet seen. Publishing is a non-blocking send into the subscriber's
//! unbounded queue, so a slow consumer only ever delays itself.

use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::Stream;
use libp2p::{Multiaddr, PeerId};
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::DEFAULT_STREAM_CHANNEL_CAPACITY;
use crate::metrics::AddrBookMetrics;
use crate::traits::AddrBookPeerId;

/// Publisher-side handle of one subscription.
#[derive(Debug)]
struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<Multiaddr>,
}

/// Type alias for the subscriber index to avoid clippy::type_complexity.
type SubIndex<Id> = HashMap<Id, Vec<Arc<Subscriber>>>;

/// Fans newly learned addresses out to the live subscribers of each peer.
///
/// Broadcasts take the index read lock; subscribe and unsubscribe take the
/// write lock. Nothing in here blocks while a lock is held.
#[derive(Debug)]
pub struct AddrSubManager<Id: AddrBookPeerId = PeerId> {
    subs: RwLock<SubIndex<Id>>,
    next_id: AtomicU64,
    stream_channel_capacity: usize,
    metrics: AddrBookMetrics,
}

impl<Id: AddrBookPeerId> Default for AddrSubManager<Id> {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_CHANNEL_CAPACITY)
    }
}

impl<Id: AddrBookPeerId> AddrSubManager<Id> {
    /// `stream_channel_capacity` is clamped to at least one.
    pub fn new(stream_channel_capacity: usize) -> Self {
        Self::with_metrics(stream_channel_capacity, AddrBookMetrics::default())
    }

    pub(crate) fn with_metrics(stream_channel_capacity: usize, metrics: AddrBookMetrics) -> Self {
        Self {
            subs: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            stream_channel_capacity: stream_channel_capacity.max(1),
            metrics,
        }
    }

    /// Register a subscriber for `peer` primed with `initial`.
    ///
    /// Callers must take `initial` under the same critical section that
    /// serializes their broadcasts, otherwise an address can fall between the
    /// snapshot and the subscription. Outside a tokio runtime nothing is
    /// registered and the returned stream is already finished.
    pub fn subscribe(
        self: &Arc<Self>,
        peer: Id,
        mut initial: Vec<Multiaddr>,
        cancel: CancellationToken,
    ) -> AddrStream {
        let Ok(handle) = Handle::try_current() else {
            warn!(?peer, "address stream requested outside a tokio runtime");
            return AddrStream::finished(cancel);
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (pub_tx, pub_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::channel(self.stream_channel_capacity);

        {
            let mut subs = self.subs.write();
            subs.entry(peer.clone())
                .or_default()
                .push(Arc::new(Subscriber { id, tx: pub_tx }));
        }
        self.metrics.inc_subscribers();

        initial.sort_by(|a, b| a.as_ref().cmp(b.as_ref()));
        initial.dedup();

        debug!(?peer, subscriber = id, initial = initial.len(), "address stream opened");

        // The guard unregisters even if the runtime drops the task unpolled.
        let registration = Registration {
            manager: Arc::clone(self),
            peer,
            id,
        };
        handle.spawn(run_subscriber(
            registration,
            initial,
            pub_rx,
            out_tx,
            cancel.clone(),
        ));

        AddrStream {
            inner: ReceiverStream::new(out_rx),
            cancel,
        }
    }

    /// Hand `addr` to every subscriber currently registered for `peer`.
    pub fn broadcast(&self, peer: &Id, addr: &Multiaddr) {
        self.metrics.inc_broadcasts();
        let subs = self.subs.read();
        let Some(peer_subs) = subs.get(peer) else {
            return;
        };

        for sub in peer_subs {
            // Fails only once the subscriber task has exited; its registration
            // is about to be dropped.
            if sub.tx.send(addr.clone()).is_err() {
                trace!(?peer, subscriber = sub.id, "subscriber gone, skipping");
            }
        }
        trace!(?peer, %addr, subscribers = peer_subs.len(), "broadcast address");
    }

    /// Drop subscriber `id` of `peer`, removing the peer once it has none left.
    pub(crate) fn unsubscribe(&self, peer: &Id, id: u64) {
        let mut subs = self.subs.write();
        let Some(peer_subs) = subs.get_mut(peer) else {
            return;
        };

        let before = peer_subs.len();
        peer_subs.retain(|sub| sub.id != id);
        let removed = before != peer_subs.len();

        if peer_subs.is_empty() {
            subs.remove(peer);
        }
        drop(subs);

        if removed {
            self.metrics.dec_subscribers();
            debug!(?peer, subscriber = id, "address stream closed");
        }
    }

    /// Number of live subscribers for `peer`.
    pub fn subscriber_count(&self, peer: &Id) -> usize {
        self.subs.read().get(peer).map_or(0, Vec::len)
    }

    /// Peers with at least one live subscriber.
    pub fn subscribed_peers(&self) -> Vec<Id> {
        self.subs.read().keys().cloned().collect()
    }
}

/// Index entry of a running subscriber task, removed when dropped.
struct Registration<Id: AddrBookPeerId> {
    manager: Arc<AddrSubManager<Id>>,
    peer: Id,
    id: u64,
}

impl<Id: AddrBookPeerId> Drop for Registration<Id> {
    fn drop(&mut self) {
        self.manager.unsubscribe(&self.peer, self.id);
    }
}

/// Subscriber task: drain the buffer into the consumer while accepting new
/// publications, until cancelled or the consumer goes away.
async fn run_subscriber<Id: AddrBookPeerId>(
    registration: Registration<Id>,
    initial: Vec<Multiaddr>,
    mut pub_rx: mpsc::UnboundedReceiver<Multiaddr>,
    out_tx: mpsc::Sender<Multiaddr>,
    cancel: CancellationToken,
) {
    let Registration { peer, id, .. } = &registration;
    let mut delivered: HashSet<Multiaddr> = initial.iter().cloned().collect();
    let mut buffer: VecDeque<Multiaddr> = initial.into();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                trace!(?peer, subscriber = id, "address stream cancelled");
                break;
            }

            permit = out_tx.reserve(), if !buffer.is_empty() => {
                let Ok(permit) = permit else {
                    trace!(?peer, subscriber = id, "address stream dropped by consumer");
                    break;
                };
                if let Some(addr) = buffer.pop_front() {
                    permit.send(addr);
                }
            }

            _ = out_tx.closed(), if buffer.is_empty() => {
                trace!(?peer, subscriber = id, "address stream dropped by consumer");
                break;
            }

            published = pub_rx.recv() => {
                let Some(addr) = published else {
                    break;
                };
                if delivered.insert(addr.clone()) {
                    buffer.push_back(addr);
                }
            }
        }
    }
}

/// Addresses for one peer: a sorted snapshot, then every newly learned
/// address exactly once. Ends when the subscription's token is cancelled.
///
/// Dropping the stream also ends the subscription.
#[derive(Debug)]
pub struct AddrStream {
    inner: ReceiverStream<Multiaddr>,
    cancel: CancellationToken,
}

impl AddrStream {
    /// A stream that yields nothing.
    fn finished(cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        Self {
            inner: ReceiverStream::new(rx),
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Stream for AddrStream {
    type Item = Multiaddr;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        // Addresses already queued in the channel are not yielded after cancel.
        if this.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        Pin::new(&mut this.inner).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use tokio::time::timeout;

    use super::*;

    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
    struct TestId(u64);

    const WAIT: Duration = Duration::from_secs(5);

    fn addr(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    async fn next(stream: &mut AddrStream) -> Option<Multiaddr> {
        timeout(WAIT, stream.next()).await.unwrap()
    }

    async fn wait_unsubscribed(manager: &AddrSubManager<TestId>, peer: TestId) {
        timeout(WAIT, async {
            while manager.subscriber_count(&peer) > 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_is_sorted_and_deduped() {
        let manager = Arc::new(AddrSubManager::<TestId>::default());
        let a = addr("/ip4/1.2.3.1/tcp/1111");
        let b = addr("/ip4/2.2.3.2/tcp/1111");
        let c = addr("/ip4/2.2.3.2/tcp/2222");

        let mut stream = manager.subscribe(
            TestId(1),
            vec![c.clone(), a.clone(), b.clone(), a.clone()],
            CancellationToken::new(),
        );

        assert_eq!(next(&mut stream).await, Some(a));
        assert_eq!(next(&mut stream).await, Some(b));
        assert_eq!(next(&mut stream).await, Some(c));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_subscriber() {
        let manager = Arc::new(AddrSubManager::<TestId>::default());
        let cancel = CancellationToken::new();
        let mut s1 = manager.subscribe(TestId(1), vec![], cancel.clone());
        let mut s2 = manager.subscribe(TestId(1), vec![], cancel.clone());
        let mut other = manager.subscribe(TestId(2), vec![], cancel.clone());
        assert_eq!(manager.subscriber_count(&TestId(1)), 2);

        let a = addr("/ip4/1.2.3.1/tcp/1111");
        manager.broadcast(&TestId(1), &a);

        assert_eq!(next(&mut s1).await, Some(a.clone()));
        assert_eq!(next(&mut s2).await, Some(a));

        // Other peers' subscribers see nothing.
        assert!(
            timeout(Duration::from_millis(50), other.next())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_published_addresses_are_deduped() {
        let manager = Arc::new(AddrSubManager::<TestId>::default());
        let a = addr("/ip4/1.2.3.1/tcp/1111");
        let b = addr("/ip4/2.2.3.2/tcp/1111");
        let mut stream = manager.subscribe(TestId(1), vec![a.clone()], CancellationToken::new());

        manager.broadcast(&TestId(1), &a);
        manager.broadcast(&TestId(1), &b);
        manager.broadcast(&TestId(1), &b);

        assert_eq!(next(&mut stream).await, Some(a));
        assert_eq!(next(&mut stream).await, Some(b));
        assert!(
            timeout(Duration::from_millis(50), stream.next())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_buffers_beyond_channel_capacity() {
        let manager = Arc::new(AddrSubManager::<TestId>::new(1));
        let mut stream = manager.subscribe(TestId(1), vec![], CancellationToken::new());

        let addrs: Vec<Multiaddr> = (0..64)
            .map(|i| addr(&format!("/ip4/10.0.0.{i}/tcp/4001")))
            .collect();
        for a in &addrs {
            manager.broadcast(&TestId(1), a);
        }

        for expected in addrs {
            assert_eq!(next(&mut stream).await, Some(expected));
        }
    }

    #[tokio::test]
    async fn test_cancel_terminates_and_unsubscribes() {
        let manager = Arc::new(AddrSubManager::<TestId>::default());
        let cancel = CancellationToken::new();
        let a = addr("/ip4/1.2.3.1/tcp/1111");
        let mut stream = manager.subscribe(TestId(1), vec![a.clone()], cancel.clone());

        assert_eq!(next(&mut stream).await, Some(a));
        cancel.cancel();

        assert!(stream.is_cancelled());
        assert_eq!(next(&mut stream).await, None);
        wait_unsubscribed(&manager, TestId(1)).await;
        assert!(manager.subscribed_peers().is_empty());

        // Broadcasting to a peer without subscribers is a no-op.
        manager.broadcast(&TestId(1), &addr("/ip4/2.2.3.2/tcp/1111"));
    }

    #[tokio::test]
    async fn test_cancel_with_pending_addresses() {
        let manager = Arc::new(AddrSubManager::<TestId>::default());
        let cancel = CancellationToken::new();
        let mut stream = manager.subscribe(
            TestId(1),
            vec![addr("/ip4/1.2.3.1/tcp/1111"), addr("/ip4/2.2.3.2/tcp/1111")],
            cancel.clone(),
        );

        cancel.cancel();
        assert_eq!(next(&mut stream).await, None);
        wait_unsubscribed(&manager, TestId(1)).await;
    }

    #[tokio::test]
    async fn test_dropping_stream_unsubscribes() {
        let manager = Arc::new(AddrSubManager::<TestId>::default());
        let cancel = CancellationToken::new();
        let keep = manager.subscribe(TestId(1), vec![], cancel.clone());
        let dropped = manager.subscribe(
            TestId(1),
            vec![addr("/ip4/1.2.3.1/tcp/1111")],
            cancel.clone(),
        );
        assert_eq!(manager.subscriber_count(&TestId(1)), 2);

        drop(dropped);
        timeout(WAIT, async {
            while manager.subscriber_count(&TestId(1)) > 1 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(manager.subscriber_count(&TestId(1)), 1);

        drop(keep);
        wait_unsubscribed(&manager, TestId(1)).await;
    }

    #[test]
    fn test_unsubscribe_unknown_is_noop() {
        let manager = AddrSubManager::<TestId>::default();
        manager.unsubscribe(&TestId(1), 42);
        assert_eq!(manager.subscriber_count(&TestId(1)), 0);
    }

    #[test]
    fn test_subscribe_outside_runtime_registers_nothing() {
        let manager = Arc::new(AddrSubManager::<TestId>::default());
        let mut stream = manager.subscribe(
            TestId(1),
            vec![addr("/ip4/1.2.3.1/tcp/1111")],
            CancellationToken::new(),
        );

        assert_eq!(manager.subscriber_count(&TestId(1)), 0);
        assert!(manager.subscribed_peers().is_empty());
        assert_eq!(futures::executor::block_on(stream.next()), None);

        // Nothing to deliver to, and no dead sender left behind.
        manager.broadcast(&TestId(1), &addr("/ip4/2.2.3.2/tcp/1111"));
        assert_eq!(manager.subscriber_count(&TestId(1)), 0);
    }

    #[test]
    fn test_runtime_shutdown_unsubscribes_unpolled_task() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let manager = Arc::new(AddrSubManager::<TestId>::default());

        let stream = {
            let _guard = runtime.enter();
            manager.subscribe(TestId(1), vec![], CancellationToken::new())
        };
        assert_eq!(manager.subscriber_count(&TestId(1)), 1);

        drop(runtime);
        assert_eq!(manager.subscriber_count(&TestId(1)), 0);
        drop(stream);
    }
}
