//! Connect attempts ("half-open sockets").
//!
//! A [`ConnectAttempt`] races a primary transport against a backup started
//! after a delay once the primary is visibly stuck in its TCP handshake.
//! The first side to become writable wins; the other side is torn down.
//!
//! ```text
//!  ConnectingPrimary --(primary ConnectingTo)--> BackupArmed --(timer)--> Racing
//!         |   ^                                      |                      |
//!         |   +------(ConnectedTo, timer cancelled)--+                      |
//!         +-----------------(writable)-------------------> Resolved <-------+
//!  any state --(abandon / connect timeout)--> Retired
//! ```

use crate::base::neterror::NetError;
use crate::base::timer::Timer;
use crate::http::caps::Caps;
use crate::http::transaction::Transaction;
use crate::manager::Msg;
use crate::socket::transport::{Transport, TransportStatus};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AttemptId(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Primary,
    Backup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AttemptState {
    ConnectingPrimary,
    BackupArmed,
    Racing,
    Resolved,
    Retired,
}

impl AttemptState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptState::ConnectingPrimary => "connecting-primary",
            AttemptState::BackupArmed => "backup-armed",
            AttemptState::Racing => "racing",
            AttemptState::Resolved => "resolved",
            AttemptState::Retired => "retired",
        }
    }
}

struct TransportSlot {
    transport: Box<dyn Transport>,
    started: Instant,
    connected: bool,
}

/// The side that won the race, ready to become a connection.
pub(crate) struct Winner {
    pub transport: Box<dyn Transport>,
    pub rtt: Duration,
    pub connected_ok: bool,
}

pub(crate) struct ConnectAttempt {
    id: AttemptId,
    transaction: Arc<dyn Transaction>,
    caps: Caps,
    state: AttemptState,
    primary: Option<TransportSlot>,
    backup: Option<TransportSlot>,
    primary_status: Option<TransportStatus>,
    primary_started: Option<Instant>,
    backup_timer: Timer,
    speculative: bool,
    free: bool,
    from_predictor: bool,
    urgent: bool,
    allow_1918: bool,
    has_connected: bool,
    timed_out: bool,
}

impl std::fmt::Debug for ConnectAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectAttempt")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("speculative", &self.speculative)
            .field("free", &self.free)
            .field("live_transports", &self.live_transports())
            .finish()
    }
}

impl ConnectAttempt {
    pub fn new(
        id: AttemptId,
        transaction: Arc<dyn Transaction>,
        caps: Caps,
        speculative: bool,
        from_predictor: bool,
        allow_1918: bool,
    ) -> Self {
        Self {
            id,
            transaction,
            caps,
            state: AttemptState::ConnectingPrimary,
            primary: None,
            backup: None,
            primary_status: None,
            primary_started: None,
            backup_timer: Timer::new(),
            speculative,
            free: true,
            from_predictor,
            urgent: caps.contains(Caps::URGENT_START),
            allow_1918,
            has_connected: false,
            timed_out: false,
        }
    }

    pub fn id(&self) -> AttemptId {
        self.id
    }

    /// The transaction this attempt was opened for.
    pub fn transaction(&self) -> &Arc<dyn Transaction> {
        &self.transaction
    }

    pub fn caps(&self) -> Caps {
        self.caps
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    pub fn is_speculative(&self) -> bool {
        self.speculative
    }

    pub fn is_from_predictor(&self) -> bool {
        self.from_predictor
    }

    pub fn is_free(&self) -> bool {
        self.free
    }

    pub fn has_connected(&self) -> bool {
        self.has_connected
    }

    pub fn allow_1918(&self) -> bool {
        self.allow_1918
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn has_backup(&self) -> bool {
        self.backup.is_some()
    }

    pub fn backup_timer_armed(&self) -> bool {
        self.backup_timer.is_armed()
    }

    pub fn primary_transport(&self) -> Option<&dyn Transport> {
        self.primary.as_ref().map(|slot| slot.transport.as_ref())
    }

    pub fn live_transports(&self) -> usize {
        usize::from(self.primary.is_some()) + usize::from(self.backup.is_some())
    }

    /// Urgent attempts only serve urgent transactions.
    pub fn accepts(&self, caps: Caps) -> bool {
        !self.urgent || caps.contains(Caps::URGENT_START)
    }

    pub fn start_primary(&mut self, transport: Box<dyn Transport>, now: Instant) {
        self.primary = Some(TransportSlot { transport, started: now, connected: false });
        self.primary_started = Some(now);
    }

    pub fn start_backup(&mut self, transport: Box<dyn Transport>, now: Instant) {
        self.backup = Some(TransportSlot { transport, started: now, connected: false });
        self.state = AttemptState::Racing;
    }

    /// Bind a transaction to this attempt. A speculative attempt stops being
    /// speculative and gets a backup timer if its primary is mid-handshake.
    pub fn claim(&mut self, tx: &UnboundedSender<Msg>, backup_delay: Duration) -> bool {
        if self.timed_out || self.state == AttemptState::Retired {
            return false;
        }
        if self.speculative {
            self.speculative = false;
            if self.primary_status == Some(TransportStatus::ConnectingTo) {
                self.arm_backup_timer(tx, backup_delay);
            }
        }
        if self.free {
            self.free = false;
            return true;
        }
        false
    }

    /// Give the attempt back. The backup timer keeps running; another
    /// transaction will most likely claim it shortly.
    pub fn unclaim(&mut self) {
        self.free = true;
    }

    pub fn arm_backup_timer(&mut self, tx: &UnboundedSender<Msg>, delay: Duration) -> bool {
        if delay.is_zero() || self.speculative || self.backup.is_some() || self.backup_timer.is_armed() {
            return false;
        }
        if !matches!(self.state, AttemptState::ConnectingPrimary) {
            return false;
        }
        let attempt = self.id;
        self.backup_timer.arm(tx, delay, move |generation| Msg::BackupTimerFired { attempt, generation });
        self.state = AttemptState::BackupArmed;
        tracing::trace!(attempt = ?self.id, delay_ms = delay.as_millis() as u64, "backup timer armed");
        true
    }

    pub fn cancel_backup_timer(&mut self) {
        if !self.backup_timer.is_armed() {
            return;
        }
        self.backup_timer.cancel();
        if self.state == AttemptState::BackupArmed {
            self.state = AttemptState::ConnectingPrimary;
        }
        tracing::trace!(attempt = ?self.id, "backup timer cancelled");
    }

    /// Accept a backup timer expiry. False if stale or no longer wanted.
    pub fn backup_timer_fired(&mut self, generation: u64) -> bool {
        self.backup_timer.fire(generation) && self.state == AttemptState::BackupArmed
    }

    /// The backup transport could not be started; carry on with the primary.
    pub fn backup_start_failed(&mut self) {
        if self.state == AttemptState::BackupArmed {
            self.state = AttemptState::ConnectingPrimary;
        }
    }

    pub fn on_status(&mut self, side: Side, status: TransportStatus) {
        if status == TransportStatus::ConnectedTo {
            if let Some(slot) = self.slot_mut(side) {
                slot.connected = true;
            }
            self.cancel_backup_timer();
        }
        if side == Side::Primary {
            self.primary_status = Some(status);
        }
    }

    /// Resolve the race in favour of `side`, closing the other transport.
    pub fn take_winner(&mut self, side: Side, now: Instant) -> Option<Winner> {
        let slot = match side {
            Side::Primary => self.primary.take(),
            Side::Backup => self.backup.take(),
        }?;
        self.cancel_backup_timer();
        let loser = match side {
            Side::Primary => self.backup.take(),
            Side::Backup => self.primary.take(),
        };
        if let Some(loser) = loser {
            loser.transport.close(NetError::ConnectionAborted);
        }
        self.state = AttemptState::Resolved;
        self.has_connected = true;
        Some(Winner {
            transport: slot.transport,
            rtt: now.saturating_duration_since(slot.started),
            connected_ok: slot.connected,
        })
    }

    /// Drop a failed side. Returns true if a transport was removed.
    pub fn side_failed(&mut self, side: Side) -> bool {
        let removed = match side {
            Side::Primary => self.primary.take(),
            Side::Backup => self.backup.take(),
        };
        removed.is_some()
    }

    /// Close both transports after the connect timeout. The attempt stays in
    /// its entry until the grace period ends.
    pub fn close_transports(&mut self, reason: NetError) {
        self.cancel_backup_timer();
        for slot in [self.primary.take(), self.backup.take()].into_iter().flatten() {
            slot.transport.close(reason);
        }
        self.timed_out = true;
        self.state = AttemptState::Retired;
    }

    pub fn abandon(&mut self) {
        self.cancel_backup_timer();
        for slot in [self.primary.take(), self.backup.take()].into_iter().flatten() {
            slot.transport.close(NetError::ConnectionAborted);
        }
        self.state = AttemptState::Retired;
    }

    /// Time since the primary transport started.
    pub fn duration(&self, now: Instant) -> Duration {
        self.primary_started.map_or(Duration::ZERO, |started| now.saturating_duration_since(started))
    }

    fn slot_mut(&mut self, side: Side) -> Option<&mut TransportSlot> {
        match side {
            Side::Primary => self.primary.as_mut(),
            Side::Backup => self.backup.as_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::transaction::NullTransaction;
    use crate::socket::destination::DestinationKey;
    use std::net::{IpAddr, SocketAddr};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct FakeTransport {
        closed: Arc<Mutex<Option<NetError>>>,
    }

    impl Transport for FakeTransport {
        fn peer_addr(&self) -> Option<SocketAddr> {
            None
        }

        fn resolved_addrs(&self) -> Vec<IpAddr> {
            Vec::new()
        }

        fn close(&self, reason: NetError) {
            *self.closed.lock().unwrap() = Some(reason);
        }
    }

    fn attempt(speculative: bool) -> ConnectAttempt {
        let key = DestinationKey::new("example.com", 443, true);
        let trans: Arc<dyn Transaction> = Arc::new(NullTransaction::new(key, Caps::ALLOW_KEEPALIVE));
        ConnectAttempt::new(AttemptId(1), trans, Caps::ALLOW_KEEPALIVE, speculative, false, true)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_cancels_backup_timer() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut a = attempt(false);
        a.start_primary(Box::new(FakeTransport::default()), Instant::now());
        a.on_status(Side::Primary, TransportStatus::ConnectingTo);
        assert!(a.arm_backup_timer(&tx, Duration::from_millis(250)));
        assert_eq!(a.state(), AttemptState::BackupArmed);

        a.on_status(Side::Primary, TransportStatus::ConnectedTo);
        assert!(!a.backup_timer_armed());
        assert_eq!(a.state(), AttemptState::ConnectingPrimary);
    }

    #[tokio::test(start_paused = true)]
    async fn test_speculative_attempt_arms_backup_only_when_claimed() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut a = attempt(true);
        a.start_primary(Box::new(FakeTransport::default()), Instant::now());
        a.on_status(Side::Primary, TransportStatus::ConnectingTo);
        assert!(!a.arm_backup_timer(&tx, Duration::from_millis(250)));

        assert!(a.claim(&tx, Duration::from_millis(250)));
        assert!(!a.is_speculative());
        assert!(a.backup_timer_armed());
        // Already bound.
        assert!(!a.claim(&tx, Duration::from_millis(250)));
        a.unclaim();
        assert!(a.is_free());
    }

    #[tokio::test(start_paused = true)]
    async fn test_winner_closes_loser() {
        let mut a = attempt(false);
        let primary_closed = Arc::new(Mutex::new(None));
        let start = Instant::now();
        a.start_primary(Box::new(FakeTransport { closed: primary_closed.clone() }), start);
        a.start_backup(Box::new(FakeTransport::default()), start);
        assert_eq!(a.state(), AttemptState::Racing);

        tokio::time::advance(Duration::from_millis(40)).await;
        a.on_status(Side::Backup, TransportStatus::ConnectedTo);
        let winner = a.take_winner(Side::Backup, Instant::now()).unwrap();
        assert!(winner.connected_ok);
        assert_eq!(winner.rtt, Duration::from_millis(40));
        assert_eq!(*primary_closed.lock().unwrap(), Some(NetError::ConnectionAborted));
        assert_eq!(a.state(), AttemptState::Resolved);
        assert!(a.has_connected());
        assert_eq!(a.live_transports(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_attempt_refuses_claim() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut a = attempt(true);
        a.start_primary(Box::new(FakeTransport::default()), Instant::now());
        a.close_transports(NetError::ConnectionTimedOut);

        assert!(!a.claim(&tx, Duration::from_millis(250)));
        assert!(a.is_speculative());
        assert!(!a.backup_timer_armed());
        assert_eq!(a.state(), AttemptState::Retired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backup_start_failure_disarms() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut a = attempt(false);
        a.start_primary(Box::new(FakeTransport::default()), Instant::now());
        a.on_status(Side::Primary, TransportStatus::ConnectingTo);
        assert!(a.arm_backup_timer(&tx, Duration::from_millis(250)));

        a.backup_start_failed();
        assert_eq!(a.state(), AttemptState::ConnectingPrimary);
        assert_eq!(a.live_transports(), 1);
    }

    #[test]
    fn test_urgent_attempt_accepts_only_urgent() {
        let key = DestinationKey::new("example.com", 443, true);
        let trans: Arc<dyn Transaction> = Arc::new(NullTransaction::new(key, Caps::URGENT_START));
        let a = ConnectAttempt::new(AttemptId(2), trans, Caps::URGENT_START, false, false, true);
        assert!(a.accepts(Caps::URGENT_START | Caps::ALLOW_KEEPALIVE));
        assert!(!a.accepts(Caps::ALLOW_KEEPALIVE));
    }
}
