//! Recording fakes for the transport, connection and transaction seams.

#![allow(dead_code)]

use connmgr::base::neterror::NetError;
use connmgr::http::caps::Caps;
use connmgr::http::pacing::Pacer;
use connmgr::http::transaction::{RequestGroup, Transaction};
use connmgr::manager::ConnectionManager;
use connmgr::socket::config::PoolConfig;
use connmgr::socket::connection::{Connection, ConnectionFactory, ConnectionParams};
use connmgr::socket::destination::DestinationKey;
use connmgr::socket::snapshot::EntrySnapshot;
use connmgr::socket::transport::{ConnectFlags, Transport, TransportEvents, TransportFactory, TransportStatus};
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn dest(host: &str, port: u16, ssl: bool) -> DestinationKey {
    DestinationKey::new(host, port, ssl)
}

pub fn same(a: &Arc<dyn Transaction>, b: &Arc<MockTransaction>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

// Transactions

pub struct MockTransaction {
    destination: DestinationKey,
    caps: Caps,
    context: u64,
    done: AtomicBool,
    reason: Mutex<Option<NetError>>,
    priority: AtomicI32,
    statuses: Mutex<Vec<TransportStatus>>,
    group: Option<Arc<dyn RequestGroup>>,
    sticky: Mutex<Option<Arc<dyn Connection>>>,
}

impl MockTransaction {
    pub fn new(destination: &DestinationKey) -> Arc<Self> {
        Self::with(destination, Caps::ALLOW_KEEPALIVE, 0)
    }

    pub fn with(destination: &DestinationKey, caps: Caps, context: u64) -> Arc<Self> {
        Arc::new(Self {
            destination: destination.clone(),
            caps,
            context,
            done: AtomicBool::new(false),
            reason: Mutex::new(None),
            priority: AtomicI32::new(0),
            statuses: Mutex::new(Vec::new()),
            group: None,
            sticky: Mutex::new(None),
        })
    }

    pub fn in_group(destination: &DestinationKey, group: Arc<dyn RequestGroup>) -> Arc<Self> {
        Arc::new(Self {
            destination: destination.clone(),
            caps: Caps::ALLOW_KEEPALIVE,
            context: 0,
            done: AtomicBool::new(false),
            reason: Mutex::new(None),
            priority: AtomicI32::new(0),
            statuses: Mutex::new(Vec::new()),
            group: Some(group),
            sticky: Mutex::new(None),
        })
    }

    pub fn as_dyn(self: &Arc<Self>) -> Arc<dyn Transaction> {
        self.clone()
    }

    pub fn close_reason(&self) -> Option<NetError> {
        *self.reason.lock().unwrap()
    }

    pub fn statuses(&self) -> Vec<TransportStatus> {
        self.statuses.lock().unwrap().clone()
    }

    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::SeqCst)
    }

    pub fn finish(&self) {
        self.done.store(true, Ordering::SeqCst);
    }

    /// Pin the transaction to `conn`, as for a connection-based auth round.
    pub fn stick_to(&self, conn: Arc<dyn Connection>) {
        *self.sticky.lock().unwrap() = Some(conn);
    }
}

impl Transaction for MockTransaction {
    fn destination(&self) -> &DestinationKey {
        &self.destination
    }

    fn caps(&self) -> Caps {
        self.caps
    }

    fn top_level_context_id(&self) -> u64 {
        self.context
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn close(&self, reason: NetError) {
        self.done.store(true, Ordering::SeqCst);
        self.reason.lock().unwrap().get_or_insert(reason);
    }

    fn status(&self) -> Result<(), NetError> {
        match self.close_reason() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    fn request_group(&self) -> Option<Arc<dyn RequestGroup>> {
        self.group.clone()
    }

    fn on_transport_status(&self, status: TransportStatus) {
        self.statuses.lock().unwrap().push(status);
    }

    fn set_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::SeqCst);
    }

    fn take_sticky_connection(&self) -> Option<Arc<dyn Connection>> {
        self.sticky.lock().unwrap().take()
    }
}

pub struct BlockingGroup(pub u32);

impl RequestGroup for BlockingGroup {
    fn blocking_transaction_count(&self) -> u32 {
        self.0
    }
}

pub struct DenyPacer;

impl Pacer for DenyPacer {
    fn try_run(&self, _trans: &Arc<dyn Transaction>) -> bool {
        false
    }
}

// Transports

struct MockTransport {
    closed: Arc<Mutex<Option<NetError>>>,
    peer: Option<SocketAddr>,
    addrs: Vec<IpAddr>,
}

impl Transport for MockTransport {
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn resolved_addrs(&self) -> Vec<IpAddr> {
        self.addrs.clone()
    }

    fn close(&self, reason: NetError) {
        self.closed.lock().unwrap().get_or_insert(reason);
    }
}

pub struct Opened {
    pub destination: String,
    pub flags: ConnectFlags,
    pub events: TransportEvents,
    closed: Arc<Mutex<Option<NetError>>>,
}

#[derive(Default)]
pub struct MockTransportFactory {
    opened: Mutex<Vec<Opened>>,
    addrs: Mutex<Vec<IpAddr>>,
    peer: Mutex<Option<SocketAddr>>,
    fail_next: Mutex<Option<NetError>>,
}

impl MockTransportFactory {
    /// Refuse the next transport with `err`.
    pub fn fail_next(&self, err: NetError) {
        *self.fail_next.lock().unwrap() = Some(err);
    }

    pub fn set_addrs(&self, addrs: Vec<IpAddr>) {
        *self.addrs.lock().unwrap() = addrs;
    }

    pub fn set_peer(&self, peer: SocketAddr) {
        *self.peer.lock().unwrap() = Some(peer);
    }

    pub fn count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    pub fn events(&self, i: usize) -> TransportEvents {
        self.opened.lock().unwrap()[i].events.clone()
    }

    pub fn flags(&self, i: usize) -> ConnectFlags {
        self.opened.lock().unwrap()[i].flags
    }

    pub fn destination(&self, i: usize) -> String {
        self.opened.lock().unwrap()[i].destination.clone()
    }

    pub fn closed(&self, i: usize) -> Option<NetError> {
        *self.opened.lock().unwrap()[i].closed.lock().unwrap()
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(
        &self,
        destination: &DestinationKey,
        flags: ConnectFlags,
        events: TransportEvents,
    ) -> Result<Box<dyn Transport>, NetError> {
        if let Some(err) = self.fail_next.lock().unwrap().take() {
            return Err(err);
        }
        let closed = Arc::new(Mutex::new(None));
        self.opened.lock().unwrap().push(Opened {
            destination: destination.hash_key().to_string(),
            flags,
            events,
            closed: closed.clone(),
        });
        Ok(Box::new(MockTransport {
            closed,
            peer: *self.peer.lock().unwrap(),
            addrs: self.addrs.lock().unwrap().clone(),
        }))
    }
}

// Connections

pub struct MockConnection {
    destination: DestinationKey,
    bytes: u64,
    multiplex: bool,
    join_ok: bool,
    reusable: AtomicBool,
    experienced: AtomicBool,
    watching: AtomicBool,
    silent: AtomicBool,
    current: Mutex<Option<Arc<dyn Transaction>>>,
    activated: Mutex<Vec<Arc<dyn Transaction>>>,
    closed: Mutex<Option<NetError>>,
    params: ConnectionParams,
}

impl MockConnection {
    /// Finish the current transaction, leaving the connection free.
    pub fn complete(&self) -> Option<Arc<dyn Transaction>> {
        self.current.lock().unwrap().take()
    }

    pub fn set_reusable(&self, reusable: bool) {
        self.reusable.store(reusable, Ordering::SeqCst);
    }

    /// Receive nothing from now on.
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    pub fn activated(&self) -> Vec<Arc<dyn Transaction>> {
        self.activated.lock().unwrap().clone()
    }

    pub fn ran(&self, trans: &Arc<MockTransaction>) -> bool {
        self.activated().iter().any(|t| same(t, trans))
    }

    pub fn close_reason(&self) -> Option<NetError> {
        *self.closed.lock().unwrap()
    }

    pub fn params(&self) -> ConnectionParams {
        self.params
    }
}

impl Connection for MockConnection {
    fn destination(&self) -> &DestinationKey {
        &self.destination
    }

    fn activate(&self, trans: Arc<dyn Transaction>, _caps: Caps, _priority: i32) -> Result<(), NetError> {
        if self.close_reason().is_some() {
            return Err(NetError::ConnectionClosed);
        }
        self.experienced.store(true, Ordering::SeqCst);
        self.activated.lock().unwrap().push(trans.clone());
        if !self.multiplex {
            *self.current.lock().unwrap() = Some(trans);
        }
        Ok(())
    }

    fn can_reuse(&self) -> bool {
        self.reusable.load(Ordering::SeqCst) && self.close_reason().is_none()
    }

    fn can_directly_activate(&self) -> bool {
        self.multiplex && self.can_reuse()
    }

    fn is_experienced(&self) -> bool {
        self.experienced.load(Ordering::SeqCst)
    }

    fn uses_multiplex(&self) -> bool {
        self.multiplex
    }

    fn ever_used_multiplex(&self) -> bool {
        self.multiplex
    }

    fn reported_npn(&self) -> bool {
        true
    }

    fn transaction(&self) -> Option<Arc<dyn Transaction>> {
        self.current.lock().unwrap().clone()
    }

    fn has_transaction(&self, trans: &Arc<dyn Transaction>) -> bool {
        let ptr = Arc::as_ptr(trans) as *const ();
        self.activated
            .lock()
            .unwrap()
            .iter()
            .any(|t| Arc::as_ptr(t) as *const () == ptr && !t.is_done())
    }

    fn close_transaction(&self, trans: &Arc<dyn Transaction>, reason: NetError) {
        trans.close(reason);
        let mut current = self.current.lock().unwrap();
        if current.as_ref().is_some_and(|t| Arc::as_ptr(t) as *const () == Arc::as_ptr(trans) as *const ()) {
            *current = None;
        }
    }

    fn dont_reuse(&self) {
        self.reusable.store(false, Ordering::SeqCst);
    }

    fn close(&self, reason: NetError) {
        self.closed.lock().unwrap().get_or_insert(reason);
    }

    fn time_to_live(&self) -> Duration {
        Duration::from_secs(300)
    }

    fn max_bytes_read(&self) -> u64 {
        self.bytes
    }

    fn join_connection(&self, _host: &str, _port: u16) -> bool {
        self.join_ok
    }

    fn check_for_traffic(&self, check: bool) {
        self.watching.store(check, Ordering::SeqCst);
    }

    fn no_traffic(&self) -> bool {
        self.watching.load(Ordering::SeqCst) && self.silent.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct MockConnectionFactory {
    multiplex: AtomicBool,
    join_ok: AtomicBool,
    bytes: Mutex<VecDeque<u64>>,
    created: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockConnectionFactory {
    pub fn set_multiplex(&self, multiplex: bool) {
        self.multiplex.store(multiplex, Ordering::SeqCst);
    }

    pub fn set_join(&self, join_ok: bool) {
        self.join_ok.store(join_ok, Ordering::SeqCst);
    }

    /// Throughput given to the next connections, in creation order.
    pub fn push_bytes(&self, bytes: &[u64]) {
        self.bytes.lock().unwrap().extend(bytes);
    }

    pub fn count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn conn(&self, i: usize) -> Arc<MockConnection> {
        self.created.lock().unwrap()[i].clone()
    }

    pub fn all(&self) -> Vec<Arc<MockConnection>> {
        self.created.lock().unwrap().clone()
    }
}

impl ConnectionFactory for MockConnectionFactory {
    fn create(
        &self,
        destination: &DestinationKey,
        _transport: Box<dyn Transport>,
        params: ConnectionParams,
        _manager: ConnectionManager,
    ) -> Result<Arc<dyn Connection>, NetError> {
        let conn = Arc::new(MockConnection {
            destination: destination.clone(),
            bytes: self.bytes.lock().unwrap().pop_front().unwrap_or(0),
            multiplex: self.multiplex.load(Ordering::SeqCst),
            join_ok: self.join_ok.load(Ordering::SeqCst),
            reusable: AtomicBool::new(true),
            experienced: AtomicBool::new(false),
            watching: AtomicBool::new(false),
            silent: AtomicBool::new(false),
            current: Mutex::new(None),
            activated: Mutex::new(Vec::new()),
            closed: Mutex::new(None),
            params,
        });
        self.created.lock().unwrap().push(conn.clone());
        Ok(conn)
    }
}

// Harness

pub struct Harness {
    pub manager: ConnectionManager,
    pub transports: Arc<MockTransportFactory>,
    pub connections: Arc<MockConnectionFactory>,
}

impl Harness {
    pub fn new(config: PoolConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_pacer(config: PoolConfig, pacer: Arc<dyn Pacer>) -> Self {
        Self::build(config, Some(pacer))
    }

    fn build(config: PoolConfig, pacer: Option<Arc<dyn Pacer>>) -> Self {
        let transports = Arc::new(MockTransportFactory::default());
        let connections = Arc::new(MockConnectionFactory::default());
        let mut builder = ConnectionManager::builder()
            .config(config)
            .transport_factory(transports.clone())
            .connection_factory(connections.clone());
        if let Some(pacer) = pacer {
            builder = builder.pacer(pacer);
        }
        let manager = builder.build().unwrap();
        Self { manager, transports, connections }
    }

    /// Wait until the loop has drained everything posted so far, including
    /// follow-up messages it posts to itself.
    pub async fn settle(&self) {
        for _ in 0..4 {
            self.manager.snapshot().await.unwrap();
        }
    }

    /// Drive transport `i` through a normal connect.
    pub async fn connect(&self, i: usize) {
        let events = self.transports.events(i);
        events.status(TransportStatus::ConnectingTo);
        events.status(TransportStatus::ConnectedTo);
        events.writable();
        self.settle().await;
    }

    pub async fn entry(&self, destination: &DestinationKey) -> Option<EntrySnapshot> {
        self.manager
            .snapshot()
            .await
            .unwrap()
            .into_iter()
            .find(|e| e.key == destination.hash_key())
    }

    /// Finish the transaction on `conn` and hand the connection back.
    pub async fn release(&self, conn: &Arc<MockConnection>) {
        conn.complete();
        self.manager.reclaim_connection(conn.clone()).unwrap();
        self.settle().await;
    }
}

pub fn config(per_host: usize) -> PoolConfig {
    PoolConfig {
        max_connections_per_host: per_host,
        ..PoolConfig::default()
    }
}
