//! Transport seam.
//!
//! DNS, TCP and TLS live behind [`TransportFactory`]. A transport reports its
//! progress through the [`TransportEvents`] handle it was created with; every
//! report becomes a message on the manager's queue, so transports may call
//! it from any task.

use crate::base::neterror::NetError;
use crate::manager::Msg;
use crate::socket::connectattempt::{AttemptId, Side};
use crate::socket::destination::DestinationKey;
use std::net::{IpAddr, SocketAddr};
use tokio::sync::mpsc::UnboundedSender;

/// Progress reported while a transport connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    ResolvingHost,
    ResolvedHost,
    /// Addresses are known and a TCP handshake is in flight.
    ConnectingTo,
    /// TCP is up; TLS (if any) follows.
    ConnectedTo,
}

/// Options a transport is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectFlags {
    pub bypass_cache: bool,
    pub anonymous: bool,
    pub no_permanent_storage: bool,
    pub be_conservative: bool,
    pub disable_ipv4: bool,
    pub disable_ipv6: bool,
    /// Fall back to the other address family if the preferred one fails.
    pub retry_with_different_ip_family: bool,
    /// Refuse to connect to private-network addresses.
    pub disable_rfc1918: bool,
}

pub trait Transport: Send + Sync {
    /// Address actually connected to, once known.
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Addresses the host resolved to. Empty until resolution finishes.
    fn resolved_addrs(&self) -> Vec<IpAddr>;

    /// Tear the transport down. No further events are expected afterwards.
    fn close(&self, reason: NetError);
}

pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        destination: &DestinationKey,
        flags: ConnectFlags,
        events: TransportEvents,
    ) -> Result<Box<dyn Transport>, NetError>;
}

/// Event sink handed to each transport.
#[derive(Clone)]
pub struct TransportEvents {
    tx: UnboundedSender<Msg>,
    attempt: AttemptId,
    side: Side,
}

impl std::fmt::Debug for TransportEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportEvents")
            .field("attempt", &self.attempt)
            .field("side", &self.side)
            .finish()
    }
}

impl TransportEvents {
    pub(crate) fn new(tx: UnboundedSender<Msg>, attempt: AttemptId, side: Side) -> Self {
        Self { tx, attempt, side }
    }

    pub fn attempt(&self) -> AttemptId {
        self.attempt
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn status(&self, status: TransportStatus) {
        self.post(Msg::TransportStatus { attempt: self.attempt, side: self.side, status });
    }

    /// The transport is connected and ready for output.
    pub fn writable(&self) {
        self.post(Msg::TransportWritable { attempt: self.attempt, side: self.side });
    }

    pub fn failed(&self, error: NetError) {
        self.post(Msg::TransportFailed { attempt: self.attempt, side: self.side, error });
    }

    fn post(&self, msg: Msg) {
        if self.tx.send(msg).is_err() {
            tracing::trace!(attempt = ?self.attempt, "transport event after manager shutdown");
        }
    }
}
