//! Connection seam.
//!
//! A [`Connection`] wraps one established transport and runs transactions on
//! it: one at a time for HTTP/1, many at once for a multiplexing protocol.
//! Framing is its own business; the manager only moves connections between
//! the idle and active sets and asks them yes/no questions.

use crate::base::neterror::NetError;
use crate::http::caps::Caps;
use crate::http::transaction::Transaction;
use crate::manager::ConnectionManager;
use crate::socket::destination::DestinationKey;
use crate::socket::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub trait Connection: Send + Sync {
    /// Destination this connection was opened for.
    fn destination(&self) -> &DestinationKey;

    /// Start running `trans`. Errors mean the connection is unusable.
    fn activate(&self, trans: Arc<dyn Transaction>, caps: Caps, priority: i32) -> Result<(), NetError>;

    /// False once a fatal condition was seen or the connection expired.
    fn can_reuse(&self) -> bool;

    /// A multiplexing session with room for another stream.
    fn can_directly_activate(&self) -> bool;

    /// Has carried at least one real transaction.
    fn is_experienced(&self) -> bool;

    /// Currently speaking the multiplexing protocol.
    fn uses_multiplex(&self) -> bool;

    fn ever_used_multiplex(&self) -> bool;

    /// Protocol negotiation has completed.
    fn reported_npn(&self) -> bool;

    /// The single transaction an HTTP/1 connection is running, if any.
    fn transaction(&self) -> Option<Arc<dyn Transaction>>;

    fn has_transaction(&self, trans: &Arc<dyn Transaction>) -> bool;

    /// Abort one transaction. The connection may stay open for others.
    fn close_transaction(&self, trans: &Arc<dyn Transaction>, reason: NetError);

    /// Stop accepting new work; close once the current work drains.
    fn dont_reuse(&self);

    /// Tear down the transport, closing anything still running with `reason`.
    fn close(&self, reason: NetError);

    /// How much longer the connection may sit idle.
    fn time_to_live(&self) -> Duration;

    /// Largest amount of data read in one transaction. Idle connections with
    /// more history are preferred, they tend to have a larger window.
    fn max_bytes_read(&self) -> u64;

    fn rtt(&self) -> Duration {
        Duration::ZERO
    }

    fn protocol_version(&self) -> &'static str {
        "http/1.1"
    }

    /// Run read-timeout checks; returns when it next wants to be asked.
    fn read_timeout_tick(&self, _now: Instant) -> Option<Duration> {
        None
    }

    /// Arm (or disarm) traffic verification after a network change.
    fn check_for_traffic(&self, _check: bool) {}

    /// No bytes arrived since traffic verification was armed.
    fn no_traffic(&self) -> bool {
        false
    }

    /// Whether the server certificate also covers `host:port` (coalescing).
    fn join_connection(&self, _host: &str, _port: u16) -> bool {
        false
    }

    fn begin_idle_monitoring(&self) {}

    fn end_idle_monitoring(&self) {}

    /// Treat the connection as reused after `after`, allowing restarts on server close.
    fn set_reused_after(&self, _after: Duration) {}
}

/// Identity comparison for trait objects (ignores vtable address).
pub fn same_connection(a: &Arc<dyn Connection>, b: &Arc<dyn Connection>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Measurements passed along when a transport becomes a connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionParams {
    pub caps: Caps,
    /// Time from starting the winning transport to it becoming writable.
    pub rtt: Duration,
    /// The winning transport reported `ConnectedTo` before writable.
    pub connected_ok: bool,
    pub max_request_delay: Duration,
}

pub trait ConnectionFactory: Send + Sync {
    /// Wrap an established transport. `manager` is how the connection hands
    /// itself back via [`ConnectionManager::reclaim_connection`].
    fn create(
        &self,
        destination: &DestinationKey,
        transport: Box<dyn Transport>,
        params: ConnectionParams,
        manager: ConnectionManager,
    ) -> Result<Arc<dyn Connection>, NetError>;
}
