//! The address book contract and the bounds placed on peer identifiers.

use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use auto_impl::auto_impl;
use libp2p::{Multiaddr, PeerId};
use tokio_util::sync::CancellationToken;

use crate::subscription::AddrStream;

/// Blanket-implemented for any type with Clone + Eq + Hash + Send + Sync + Debug.
pub trait AddrBookPeerId: Clone + Eq + Hash + Send + Sync + Debug + 'static {}

impl<T> AddrBookPeerId for T where T: Clone + Eq + Hash + Send + Sync + Debug + 'static {}

/// Best-effort store of where peers can be reached.
///
/// Nothing here fails: unknown peers read as empty, and input that cannot be
/// stored (empty multiaddrs, zero TTLs on add) is dropped.
#[auto_impl(&, Box, Arc)]
pub trait AddrBook<Id: AddrBookPeerId = PeerId>: Send + Sync {
    fn add_addr(&self, peer: &Id, addr: Multiaddr, ttl: Duration) {
        self.add_addrs(peer, &[addr], ttl);
    }

    /// Store addresses under `ttl`. An address already known with a later or
    /// equal expiry is left as is; TTLs only ever grow through this call.
    fn add_addrs(&self, peer: &Id, addrs: &[Multiaddr], ttl: Duration);

    fn set_addr(&self, peer: &Id, addr: Multiaddr, ttl: Duration) {
        self.set_addrs(peer, &[addr], ttl);
    }

    /// Overwrite the TTL of each address. A zero TTL removes the address.
    fn set_addrs(&self, peer: &Id, addrs: &[Multiaddr], ttl: Duration);

    /// Move every address stored under exactly `old_ttl` to `new_ttl`.
    fn update_addrs(&self, peer: &Id, old_ttl: Duration, new_ttl: Duration);

    /// All addresses of `peer` that have not expired, in no particular order.
    fn addrs(&self, peer: &Id) -> Vec<Multiaddr>;

    fn clear_addrs(&self, peer: &Id);

    /// Peers with at least one stored record. Expired records are not
    /// filtered, so a peer may linger here until its addresses are next read.
    fn peers(&self) -> Vec<Id>;

    /// Stream of the peer's current addresses followed by every address
    /// learned afterwards, ending when `cancel` fires.
    fn addr_stream(&self, peer: &Id, cancel: CancellationToken) -> AddrStream;
}
