//! Transactions as seen by the connection manager.
//!
//! The manager never parses requests or responses. A transaction is an opaque
//! unit of work that knows its destination, its capabilities and how to be
//! closed. Anything that runs bytes implements [`Transaction`] elsewhere.

use crate::base::neterror::NetError;
use crate::http::caps::Caps;
use crate::socket::connection::Connection;
use crate::socket::destination::DestinationKey;
use crate::socket::transport::TransportStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// A logical group of loads (a document and its subresources).
///
/// Non-blocking transactions wait while their group has blocking loads
/// outstanding, so scripts and stylesheets go out before images.
pub trait RequestGroup: Send + Sync {
    fn blocking_transaction_count(&self) -> u32;
}

pub trait Transaction: Send + Sync {
    fn destination(&self) -> &DestinationKey;

    fn caps(&self) -> Caps;

    /// Top-level browsing context this load belongs to. Zero means none.
    fn top_level_context_id(&self) -> u64;

    /// Whether the transaction has finished (successfully or not).
    fn is_done(&self) -> bool;

    /// Terminate the transaction with `reason`. Must be idempotent.
    fn close(&self, reason: NetError);

    /// Current status. An error here means the caller already gave up on it.
    fn status(&self) -> Result<(), NetError> {
        Ok(())
    }

    fn request_group(&self) -> Option<Arc<dyn RequestGroup>> {
        None
    }

    /// Connection a sticky transaction must continue on. Taken once.
    fn take_sticky_connection(&self) -> Option<Arc<dyn Connection>> {
        None
    }

    fn on_transport_status(&self, _status: TransportStatus) {}

    /// Called when a blocking transaction passes the group gate.
    fn dispatched_as_blocking(&self) {}

    fn set_priority(&self, _priority: i32) {}

    fn as_null(&self) -> Option<&NullTransaction> {
        None
    }
}

/// Identity comparison for trait objects (ignores vtable address).
pub fn same_transaction(a: &Arc<dyn Transaction>, b: &Arc<dyn Transaction>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Placeholder transaction that carries no request.
///
/// Drives the TLS handshake on a fresh connection so it becomes reusable,
/// and backs speculative connects. A real transaction may claim it to wait
/// for that connection instead of opening another one.
pub struct NullTransaction {
    destination: DestinationKey,
    caps: Caps,
    claimed: AtomicBool,
    closed: Mutex<Option<NetError>>,
}

impl std::fmt::Debug for NullTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NullTransaction")
            .field("destination", &self.destination.hash_key())
            .field("caps", &self.caps)
            .field("claimed", &self.is_claimed())
            .finish()
    }
}

impl NullTransaction {
    pub fn new(destination: DestinationKey, caps: Caps) -> Self {
        Self { destination, caps, claimed: AtomicBool::new(false), closed: Mutex::new(None) }
    }

    /// Claim for a waiting transaction. Only one claimant at a time.
    pub fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn unclaim(&self) {
        self.claimed.store(false, Ordering::Release);
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    pub fn close_reason(&self) -> Option<NetError> {
        self.closed.lock().ok().and_then(|r| *r)
    }
}

impl Transaction for NullTransaction {
    fn destination(&self) -> &DestinationKey {
        &self.destination
    }

    fn caps(&self) -> Caps {
        self.caps
    }

    fn top_level_context_id(&self) -> u64 {
        0
    }

    fn is_done(&self) -> bool {
        self.closed.lock().map(|r| r.is_some()).unwrap_or(true)
    }

    fn close(&self, reason: NetError) {
        if let Ok(mut closed) = self.closed.lock() {
            closed.get_or_insert(reason);
        }
    }

    fn as_null(&self) -> Option<&NullTransaction> {
        Some(self)
    }
}
