//! # connmgr
//!
//! A Chromium-inspired HTTP connection manager for Rust.
//!
//! `connmgr` decides which connection every HTTP transaction runs on. It
//! pools idle connections per destination, races primary and backup
//! transports, coalesces multiplexed sessions across hosts that share an
//! address, and enforces global and per-destination socket limits.
//!
//! ## Features
//!
//! - **Connection Pooling**: 6 connections per host, 256 total (configurable)
//! - **Happy Eyeballs**: Backup transport after 250ms, IPv4 fast fallback
//! - **Multiplexing**: Coalesces HTTP/2-style sessions across hosts
//! - **Fair Dispatch**: Priority queues per top-level context, urgent-start reserve
//! - **Supervision**: Dead-connection pruning, traffic checks, connect timeouts
//! - **Diagnostics**: JSON snapshots of the pool (`json` feature)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use connmgr::ConnectionManager;
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = ConnectionManager::builder()
//!         .transport_factory(my_transports)
//!         .connection_factory(my_connections)
//!         .build()
//!         .unwrap();
//!     manager.submit(my_transaction, 0).unwrap();
//!     manager.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Error codes and message-driven timers
//! - [`http`] - Transactions, capability bits and pacing
//! - [`socket`] - Destinations, connections, transports and the pool
//! - [`manager`] - The manager handle and its message loop

pub mod base;
pub mod http;
pub mod manager;
pub mod socket;

pub use base::neterror::NetError;
pub use http::{Caps, NullTransaction, Transaction};
pub use manager::{ConnectionManager, ConnectionManagerBuilder, SpeculativeOptions};
pub use socket::{DestinationKey, PoolConfig};
