//! In-memory peer address book with TTL expiry and per-peer address streams.
//!
//! - [`AddrManager`] - peer → address records, with add (extend-only) and set
//!   (authoritative) merge rules and lazy expiry on read
//! - [`AddrSubManager`] - fan-out of newly learned addresses to [`AddrStream`]s
//! - [`ttl`] - the TTL classes callers pick from

mod metrics;

pub mod config;
pub mod manager;
pub mod record;
pub mod subscription;
pub mod traits;
pub mod ttl;

pub use config::{AddrBookConfig, AddrBookError};
pub use manager::AddrManager;
pub use record::ExpiringAddr;
pub use subscription::{AddrStream, AddrSubManager};
pub use traits::{AddrBook, AddrBookPeerId};
pub use ttl::{
    CONNECTED_ADDR_TTL, Expiry, OWN_OBSERVED_ADDR_TTL, PERMANENT_ADDR_TTL, PROVIDER_ADDR_TTL,
    RECENTLY_CONNECTED_ADDR_TTL, TEMP_ADDR_TTL,
};
