//! Connection manager handle and message loop.
//!
//! All pool state lives on one spawned task. [`ConnectionManager`] is a cheap
//! cloneable handle that posts typed messages to it; the loop applies them
//! strictly in arrival order, so no pool state is ever locked.
//!
//! # Example
//!
//! ```rust,ignore
//! use connmgr::manager::ConnectionManager;
//!
//! let manager = ConnectionManager::builder()
//!     .transport_factory(transports)
//!     .connection_factory(connections)
//!     .max_connections_per_host(6)
//!     .build()?;
//!
//! manager.submit(transaction, 0)?;
//! // ...
//! manager.shutdown().await;
//! ```

use crate::base::neterror::NetError;
use crate::http::caps::Caps;
use crate::http::pacing::Pacer;
use crate::http::transaction::Transaction;
use crate::socket::config::{Param, PoolConfig};
use crate::socket::connectattempt::{AttemptId, Side};
use crate::socket::connection::{Connection, ConnectionFactory};
use crate::socket::destination::DestinationKey;
use crate::socket::pool::ConnectionPool;
use crate::socket::snapshot::EntrySnapshot;
use crate::socket::transport::{TransportFactory, TransportStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, watch};

/// Everything the pool loop reacts to.
pub(crate) enum Msg {
    Submit { trans: Arc<dyn Transaction>, priority: i32 },
    Reschedule { trans: Arc<dyn Transaction>, priority: i32 },
    Cancel { trans: Arc<dyn Transaction>, reason: NetError },
    SpeculativeConnect { destination: DestinationKey, caps: Caps, options: SpeculativeOptions },
    ReclaimConnection(Arc<dyn Connection>),
    ReportMultiplex { conn: Arc<dyn Connection>, uses_multiplex: bool },
    UpdateParam { param: Param, value: u16 },
    /// Hash key of the entry that freed capacity; `None` sweeps every entry.
    ProcessPendingQ(Option<String>),
    ProcessAllMultiplexPendingQ,
    CancelTransactions { key: String, reason: NetError },
    PruneDeadConnections,
    PruneNoTraffic,
    VerifyTraffic,
    ShiftReloadCleanup(Option<String>),
    ClearConnectionHistory,
    UpdateCurrentTopLevelContext(u64),
    UpdatePacer(Option<Arc<dyn Pacer>>),
    MoveToWildcardEntry { destination: DestinationKey, conn: Arc<dyn Connection> },
    ResetIpFamilyPreference(String),
    Snapshot(oneshot::Sender<Vec<EntrySnapshot>>),
    Shutdown,

    // Timers
    PruneTimerFired(u64),
    TimeoutTick(u64),
    TrafficTimerFired(u64),
    BackupTimerFired { attempt: AttemptId, generation: u64 },

    // Transport events
    TransportStatus { attempt: AttemptId, side: Side, status: TransportStatus },
    TransportWritable { attempt: AttemptId, side: Side },
    TransportFailed { attempt: AttemptId, side: Side, error: NetError },
}

/// Options for [`ConnectionManager::speculative_connect`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SpeculativeOptions {
    /// Overrides `PoolConfig::parallel_speculative_limit`.
    pub parallel_limit: Option<usize>,
    /// Connect even when idle connections exist, up to the limit.
    pub ignore_idle: bool,
    pub is_from_predictor: bool,
    /// Allow connecting to private (RFC 1918) addresses.
    pub allow_1918: bool,
}

/// Handle to a running connection manager.
#[derive(Clone)]
pub struct ConnectionManager {
    tx: UnboundedSender<Msg>,
    shutting_down: Arc<AtomicBool>,
    done: watch::Receiver<bool>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

impl ConnectionManager {
    /// Create a new manager builder.
    pub fn builder() -> ConnectionManagerBuilder {
        ConnectionManagerBuilder::default()
    }

    pub(crate) fn sender(&self) -> &UnboundedSender<Msg> {
        &self.tx
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn post(&self, msg: Msg) -> Result<(), NetError> {
        if self.is_shutting_down() {
            return Err(NetError::ShuttingDown);
        }
        self.tx.send(msg).map_err(|_| NetError::ShuttingDown)
    }

    /// Queue a transaction for dispatch. Higher `priority` runs first.
    pub fn submit(&self, trans: Arc<dyn Transaction>, priority: i32) -> Result<(), NetError> {
        self.post(Msg::Submit { trans, priority })
    }

    /// Move a still-queued transaction to a new priority. No-op once dispatched.
    pub fn reschedule(&self, trans: Arc<dyn Transaction>, priority: i32) -> Result<(), NetError> {
        self.post(Msg::Reschedule { trans, priority })
    }

    pub fn cancel(&self, trans: Arc<dyn Transaction>, reason: NetError) -> Result<(), NetError> {
        self.post(Msg::Cancel { trans, reason })
    }

    /// Warm up a connection to `destination` ahead of any request.
    pub fn speculative_connect(
        &self,
        destination: DestinationKey,
        caps: Caps,
        options: SpeculativeOptions,
    ) -> Result<(), NetError> {
        if !options.allow_1918 && destination.is_local_ip_literal() {
            tracing::trace!(destination = %destination, "speculative connect to local address skipped");
            return Ok(());
        }
        self.post(Msg::SpeculativeConnect { destination, caps, options })
    }

    /// Called by a connection when it has finished its transaction.
    pub fn reclaim_connection(&self, conn: Arc<dyn Connection>) -> Result<(), NetError> {
        self.post(Msg::ReclaimConnection(conn))
    }

    /// Called once a connection knows whether it negotiated multiplexing.
    pub fn report_multiplex(&self, conn: Arc<dyn Connection>, uses_multiplex: bool) -> Result<(), NetError> {
        self.post(Msg::ReportMultiplex { conn, uses_multiplex })
    }

    pub fn update_param(&self, param: Param, value: u16) -> Result<(), NetError> {
        self.post(Msg::UpdateParam { param, value })
    }

    /// Re-run dispatch for `destination`, or for every entry.
    pub fn process_pending_q(&self, destination: Option<&DestinationKey>) -> Result<(), NetError> {
        self.post(Msg::ProcessPendingQ(destination.map(|d| d.hash_key().to_string())))
    }

    pub fn process_all_multiplex_pending_q(&self) -> Result<(), NetError> {
        self.post(Msg::ProcessAllMultiplexPendingQ)
    }

    /// Fail every transaction queued for `destination`.
    pub fn cancel_transactions(&self, destination: &DestinationKey, reason: NetError) -> Result<(), NetError> {
        self.post(Msg::CancelTransactions { key: destination.hash_key().to_string(), reason })
    }

    pub fn prune_dead_connections(&self) -> Result<(), NetError> {
        self.post(Msg::PruneDeadConnections)
    }

    pub fn prune_no_traffic(&self) -> Result<(), NetError> {
        self.post(Msg::PruneNoTraffic)
    }

    /// Start a traffic check, e.g. after a network change.
    pub fn verify_traffic(&self) -> Result<(), NetError> {
        self.post(Msg::VerifyTraffic)
    }

    /// Forced reload: drop idle connections, stop reusing active ones.
    pub fn shift_reload_cleanup(&self, destination: Option<&DestinationKey>) -> Result<(), NetError> {
        self.post(Msg::ShiftReloadCleanup(destination.map(|d| d.hash_key().to_string())))
    }

    pub fn clear_connection_history(&self) -> Result<(), NetError> {
        self.post(Msg::ClearConnectionHistory)
    }

    pub fn update_current_top_level_context(&self, id: u64) -> Result<(), NetError> {
        self.post(Msg::UpdateCurrentTopLevelContext(id))
    }

    pub fn update_pacer(&self, pacer: Option<Arc<dyn Pacer>>) -> Result<(), NetError> {
        self.post(Msg::UpdatePacer(pacer))
    }

    pub fn move_to_wildcard_entry(&self, destination: DestinationKey, conn: Arc<dyn Connection>) -> Result<(), NetError> {
        self.post(Msg::MoveToWildcardEntry { destination, conn })
    }

    pub fn reset_ip_family_preference(&self, destination: &DestinationKey) -> Result<(), NetError> {
        self.post(Msg::ResetIpFamilyPreference(destination.hash_key().to_string()))
    }

    /// Diagnostic view of every non-private entry.
    pub async fn snapshot(&self) -> Result<Vec<EntrySnapshot>, NetError> {
        let (reply, rx) = oneshot::channel();
        self.post(Msg::Snapshot(reply))?;
        rx.await.map_err(|_| NetError::ShuttingDown)
    }

    /// Abort everything and wait for the loop to finish. Safe to call twice.
    pub async fn shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::AcqRel) {
            tracing::debug!("connection manager shutdown requested");
            let _ = self.tx.send(Msg::Shutdown);
        }
        let mut done = self.done.clone();
        // A closed channel means the loop is already gone.
        let _ = done.wait_for(|finished| *finished).await;
    }
}

/// Builder for a [`ConnectionManager`].
#[derive(Default)]
pub struct ConnectionManagerBuilder {
    config: PoolConfig,
    transports: Option<Arc<dyn TransportFactory>>,
    connections: Option<Arc<dyn ConnectionFactory>>,
    pacer: Option<Arc<dyn Pacer>>,
}

impl ConnectionManagerBuilder {
    /// Replace the whole configuration.
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the global connection limit.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Set the per-destination connection limit.
    pub fn max_connections_per_host(mut self, max: usize) -> Self {
        self.config.max_connections_per_host = max;
        self
    }

    /// Set the delay before a backup transport is raced.
    pub fn backup_delay(mut self, delay: Duration) -> Self {
        self.config.backup_delay = delay;
        self
    }

    /// Enable or disable multiplexed session reuse.
    pub fn multiplex(mut self, enabled: bool) -> Self {
        self.config.multiplex_enabled = enabled;
        self
    }

    /// Set how transports are opened.
    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transports = Some(factory);
        self
    }

    /// Set how established transports become connections.
    pub fn connection_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.connections = Some(factory);
        self
    }

    /// Set the request pacer.
    pub fn pacer(mut self, pacer: Arc<dyn Pacer>) -> Self {
        self.pacer = Some(pacer);
        self
    }

    /// Spawn the manager loop. Must be called inside a tokio runtime.
    pub fn build(self) -> Result<ConnectionManager, NetError> {
        let transports = self.transports.ok_or(NetError::InvalidArgument)?;
        let connections = self.connections.ok_or(NetError::InvalidArgument)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(false);
        let handle = ConnectionManager {
            tx,
            shutting_down: Arc::new(AtomicBool::new(false)),
            done: done_rx,
        };
        let pool = ConnectionPool::new(self.config, transports, connections, self.pacer, handle.clone());
        tokio::spawn(run(pool, rx, done_tx));
        Ok(handle)
    }
}

async fn run(mut pool: ConnectionPool, mut rx: UnboundedReceiver<Msg>, done: watch::Sender<bool>) {
    tracing::debug!("connection manager started");
    while let Some(msg) = rx.recv().await {
        if matches!(msg, Msg::Shutdown) {
            pool.handle.shutting_down.store(true, Ordering::Release);
            pool.shutdown();
            rx.close();
            while let Ok(late) = rx.try_recv() {
                discard(late);
            }
            break;
        }
        pool.handle(msg);
    }
    pool.shutdown();
    drop(pool);
    tracing::debug!("connection manager stopped");
    let _ = done.send(true);
}

/// Release whatever a message still holds after the loop stopped.
fn discard(msg: Msg) {
    match msg {
        Msg::Submit { trans, .. } => trans.close(NetError::Aborted),
        Msg::Cancel { trans, reason } => {
            if !trans.is_done() {
                trans.close(reason);
            }
        }
        Msg::ReclaimConnection(conn)
        | Msg::ReportMultiplex { conn, .. }
        | Msg::MoveToWildcardEntry { conn, .. } => conn.close(NetError::Aborted),
        Msg::Snapshot(reply) => {
            let _ = reply.send(Vec::new());
        }
        _ => {}
    }
}
