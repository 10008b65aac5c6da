//! Transaction model.
//!
//! Mirrors the parts of Chromium's `net/http/` the connection manager needs:
//! - [`caps`]: Capability bits carried by a transaction
//! - [`transaction`]: The [`Transaction`] trait and the placeholder [`NullTransaction`]
//! - [`pacing`]: The external pacing oracle

pub mod caps;
pub mod pacing;
pub mod transaction;

pub use caps::Caps;
pub use pacing::Pacer;
pub use transaction::{NullTransaction, RequestGroup, Transaction};
