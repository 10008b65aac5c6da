//! Connection pooling and dispatch.
//!
//! Mirrors the pooling half of Chromium's `net/socket/`, generalised to a
//! scheduler that owns every destination's connections and queues:
//! - [`destination`]: Destination keys and their canonical hash key
//! - [`entry`]: Per-destination idle/active sets, attempts and queues
//! - [`connectattempt`]: Primary/backup transport racing
//! - [`coalesce`]: Address-based coalescing of multiplexed sessions
//! - [`pool`]: The pool state driven by the manager loop
//! - [`config`]: Limits and timing knobs
//! - [`proxy`]: HTTP/HTTPS/SOCKS5 proxy settings

pub mod coalesce;
pub mod config;
pub mod connectattempt;
pub mod connection;
pub mod destination;
pub mod entry;
pub mod pool;
pub mod proxy;
pub mod snapshot;
pub mod transport;

mod connect;
mod dispatch;
mod supervise;

pub use config::{Param, PoolConfig};
pub use connection::{Connection, ConnectionFactory, ConnectionParams};
pub use destination::DestinationKey;
pub use proxy::{ProxySettings, ProxyType};
pub use snapshot::EntrySnapshot;
pub use transport::{ConnectFlags, Transport, TransportEvents, TransportFactory, TransportStatus};
