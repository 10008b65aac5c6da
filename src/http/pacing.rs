//! Request pacing.
//!
//! A [`Pacer`] is a yes/no oracle (typically a token bucket) consulted before
//! a non-urgent transaction may take a connection.

use crate::http::transaction::Transaction;
use std::sync::Arc;

pub trait Pacer: Send + Sync {
    /// Returns true if `trans` may run now. A false answer leaves the
    /// transaction queued; the pacer is expected to trigger queue
    /// processing once tokens are available again.
    fn try_run(&self, trans: &Arc<dyn Transaction>) -> bool;

    /// Forget any pacing state held for `trans` (it was dispatched some other way).
    fn cancel(&self, _trans: &Arc<dyn Transaction>) {}
}
