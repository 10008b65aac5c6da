//! Connection pool state.
//!
//! [`ConnectionPool`] is owned by the manager's message loop and is never
//! shared; every method runs on that one task. The dispatch ladder lives in
//! `dispatch`, connect racing in `connect` and the timers in `supervise`.

use crate::base::neterror::NetError;
use crate::base::timer::Timer;
use crate::http::pacing::Pacer;
use crate::http::transaction::Transaction;
use crate::manager::{ConnectionManager, Msg};
use crate::socket::coalesce::CoalescingIndex;
use crate::socket::config::{Param, PoolConfig};
use crate::socket::connection::{Connection, ConnectionFactory};
use crate::socket::destination::DestinationKey;
use crate::socket::entry::{Claim, DestinationEntry};
use crate::socket::snapshot::{AttemptSnapshot, ConnectionSnapshot, EntrySnapshot};
use crate::socket::transport::TransportFactory;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

pub(crate) struct ConnectionPool {
    pub(crate) config: PoolConfig,
    pub(crate) entries: HashMap<String, DestinationEntry>,
    pub(crate) coalescing: CoalescingIndex,
    pub(crate) transports: Arc<dyn TransportFactory>,
    pub(crate) connections: Arc<dyn ConnectionFactory>,
    pub(crate) pacer: Option<Arc<dyn Pacer>>,
    pub(crate) handle: ConnectionManager,

    // Counters
    pub(crate) num_active: usize,
    /// Live transports of attempts still racing.
    pub(crate) num_connecting: usize,
    pub(crate) num_idle: usize,
    pub(crate) num_multiplex_active: usize,
    pub(crate) num_half_open: usize,

    pub(crate) current_top_level_context: u64,
    pub(crate) prune_timer: Timer,
    pub(crate) timeout_tick: Timer,
    pub(crate) traffic_timer: Timer,
    pub(crate) pruning_no_traffic: bool,
    pub(crate) next_attempt_id: u64,
    pub(crate) shut_down: bool,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("entries", &self.entries.len())
            .field("num_active", &self.num_active)
            .field("num_connecting", &self.num_connecting)
            .field("num_idle", &self.num_idle)
            .field("num_multiplex_active", &self.num_multiplex_active)
            .field("num_half_open", &self.num_half_open)
            .finish()
    }
}

impl ConnectionPool {
    pub(crate) fn new(
        config: PoolConfig,
        transports: Arc<dyn TransportFactory>,
        connections: Arc<dyn ConnectionFactory>,
        pacer: Option<Arc<dyn Pacer>>,
        handle: ConnectionManager,
    ) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            coalescing: CoalescingIndex::new(),
            transports,
            connections,
            pacer,
            handle,
            num_active: 0,
            num_connecting: 0,
            num_idle: 0,
            num_multiplex_active: 0,
            num_half_open: 0,
            current_top_level_context: 0,
            prune_timer: Timer::new(),
            timeout_tick: Timer::new(),
            traffic_timer: Timer::new(),
            pruning_no_traffic: false,
            next_attempt_id: 1,
            shut_down: false,
        }
    }

    pub(crate) fn tx(&self) -> &UnboundedSender<Msg> {
        self.handle.sender()
    }

    /// Queue a message for later processing on this loop.
    pub(crate) fn post(&self, msg: Msg) {
        if self.shut_down {
            return;
        }
        let _ = self.tx().send(msg);
    }

    pub(crate) fn handle(&mut self, msg: Msg) {
        match msg {
            Msg::Submit { trans, priority } => {
                if let Err(e) = self.process_new_transaction(trans.clone(), priority) {
                    tracing::debug!(error = %e, "transaction failed to dispatch");
                    trans.close(e);
                }
            }
            Msg::Reschedule { trans, priority } => self.reschedule(trans, priority),
            Msg::Cancel { trans, reason } => self.cancel_transaction(trans, reason),
            Msg::SpeculativeConnect { destination, caps, options } => {
                self.speculative_connect(destination, caps, options)
            }
            Msg::ReclaimConnection(conn) => self.reclaim_connection(conn),
            Msg::ReportMultiplex { conn, uses_multiplex } => {
                self.report_multiplex_connection(conn, uses_multiplex)
            }
            Msg::UpdateParam { param, value } => self.update_param(param, value),
            Msg::ProcessPendingQ(key) => self.process_pending_q(key),
            Msg::ProcessAllMultiplexPendingQ => self.process_all_multiplex_pending_q(),
            Msg::CancelTransactions { key, reason } => self.cancel_transactions(&key, reason),
            Msg::PruneDeadConnections => self.prune_dead_connections(),
            Msg::PruneNoTraffic => self.prune_no_traffic(),
            Msg::VerifyTraffic => self.verify_traffic(),
            Msg::ShiftReloadCleanup(key) => self.shift_reload_cleanup(key),
            Msg::ClearConnectionHistory => self.clear_connection_history(),
            Msg::UpdateCurrentTopLevelContext(id) => {
                tracing::debug!(previous = self.current_top_level_context, current = id, "focused context changed");
                self.current_top_level_context = id;
            }
            Msg::UpdatePacer(pacer) => self.pacer = pacer,
            Msg::MoveToWildcardEntry { destination, conn } => self.move_to_wildcard_entry(&destination, conn),
            Msg::ResetIpFamilyPreference(key) => {
                if let Some(entry) = self.entries.get_mut(&key) {
                    entry.reset_ip_family();
                }
            }
            Msg::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Msg::Shutdown => self.shutdown(),
            Msg::PruneTimerFired(generation) => {
                if self.prune_timer.fire(generation) {
                    self.prune_dead_connections();
                }
            }
            Msg::TimeoutTick(generation) => self.on_timeout_tick(generation),
            Msg::TrafficTimerFired(generation) => {
                if self.traffic_timer.fire(generation) {
                    self.prune_no_traffic();
                }
            }
            Msg::BackupTimerFired { attempt, generation } => self.on_backup_timer(attempt, generation),
            Msg::TransportStatus { attempt, side, status } => self.on_transport_status(attempt, side, status),
            Msg::TransportWritable { attempt, side } => self.on_transport_writable(attempt, side),
            Msg::TransportFailed { attempt, side, error } => self.on_transport_failed(attempt, side, error),
        }
    }

    /// Pick the entry a transaction for `dest` should use, favouring one that
    /// can run it right away. Returns the entry's hash key.
    pub(crate) fn get_or_create_entry(&mut self, dest: &DestinationKey, prohibit_wildcard: bool) -> String {
        let specific = dest.hash_key().to_string();
        if self.entries.contains_key(&specific) && self.available_for_dispatch_now(&specific) {
            return specific;
        }
        if !prohibit_wildcard {
            if let Some(wildcard) = dest.wildcard() {
                let wc = wildcard.hash_key().to_string();
                if self.entries.contains_key(&wc) && self.available_for_dispatch_now(&wc) {
                    tracing::trace!(key = %specific, wildcard = %wc, "using wildcard entry");
                    return wc;
                }
            }
        }
        self.entries
            .entry(specific.clone())
            .or_insert_with(|| DestinationEntry::new(dest.clone()));
        specific
    }

    /// Has a reusable idle connection or a multiplexed session with room.
    pub(crate) fn available_for_dispatch_now(&mut self, key: &str) -> bool {
        let idle_ready = self
            .entries
            .get(key)
            .and_then(|e| e.idle.first())
            .is_some_and(|c| c.can_reuse());
        idle_ready || self.preferred_connection(key).is_some()
    }

    /// Entry currently holding `conn`.
    pub(crate) fn find_connection_entry(&self, conn: &Arc<dyn Connection>) -> Option<String> {
        let key = conn.destination().hash_key();
        if self.entries.get(key).is_some_and(|e| e.holds(conn)) {
            return Some(key.to_string());
        }
        // Coalesced or moved to a wildcard entry.
        if let Some((k, _)) = self.entries.iter().find(|(_, e)| e.holds(conn)) {
            return Some(k.clone());
        }
        self.entries.contains_key(key).then(|| key.to_string())
    }

    pub(crate) fn add_active(&mut self, key: &str, conn: Arc<dyn Connection>) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.active.push(conn);
            self.num_active += 1;
            self.activate_timeout_tick();
        }
    }

    pub(crate) fn decrement_active(&mut self, conn: &Arc<dyn Connection>) {
        self.num_active = self.num_active.saturating_sub(1);
        if conn.ever_used_multiplex() {
            self.num_multiplex_active = self.num_multiplex_active.saturating_sub(1);
        }
    }

    /// Per-destination cap: plain requests through an HTTP proxy share the
    /// larger proxy allowance.
    pub(crate) fn max_persist_connections(&self, key: &str) -> usize {
        match self.entries.get(key) {
            Some(entry) if entry.key.using_http_proxy() && !entry.key.using_connect() => {
                self.config.max_connections_per_proxy
            }
            _ => self.config.max_connections_per_host,
        }
    }

    pub(crate) fn release_claim(&mut self, key: &str, claim: Option<Claim>) {
        match claim {
            Some(Claim::Attempt(id)) => {
                if let Some(attempt) = self.entries.get_mut(key).and_then(|e| e.attempt_mut(id)) {
                    attempt.unclaim();
                }
            }
            Some(Claim::Null(null)) => {
                if let Some(null) = null.as_null() {
                    null.unclaim();
                }
            }
            None => {}
        }
    }

    /// A connection finished its work and is handed back.
    pub(crate) fn reclaim_connection(&mut self, conn: Arc<dyn Connection>) {
        let key = match self.find_connection_entry(&conn) {
            Some(key) => key,
            None => {
                // Made outside the manager (e.g. a proxy tunnel); adopt it.
                let dest = conn.destination().clone();
                self.get_or_create_entry(&dest, true)
            }
        };
        tracing::debug!(key = %key, "reclaiming connection");

        // Multiplexed sessions stay active for as long as they live.
        if conn.ever_used_multiplex() {
            conn.dont_reuse();
        }
        // Still bound to a transaction means it was reset or aborted.
        if conn.transaction().is_some() {
            conn.dont_reuse();
        }

        let removed = self.entries.get_mut(&key).is_some_and(|e| e.remove_active(&conn));
        if removed {
            self.decrement_active(&conn);
            self.conditionally_stop_timeout_tick();
        }

        if conn.can_reuse() {
            let Some(entry) = self.entries.get_mut(&key) else {
                return;
            };
            if entry.is_idle(&conn) {
                tracing::warn!(key = %key, "connection reclaimed twice");
            } else {
                entry.insert_idle(conn.clone());
                self.num_idle += 1;
                conn.begin_idle_monitoring();
                self.prune_after(conn.time_to_live());
            }
        } else {
            tracing::debug!(key = %key, "closing connection: cannot be reused");
            conn.close(NetError::Aborted);
        }

        self.process_pending_q(Some(key));
    }

    pub(crate) fn cancel_transaction(&mut self, trans: Arc<dyn Transaction>, reason: NetError) {
        if let Some(pacer) = &self.pacer {
            pacer.cancel(&trans);
        }
        let own = trans.destination().hash_key().to_string();
        let mut keys: Vec<String> = self.entries.keys().filter(|k| **k != own).cloned().collect();
        keys.insert(0, own);

        for key in keys {
            let Some(pending) = self.entries.get_mut(&key).and_then(|e| e.remove_pending(&trans)) else {
                continue;
            };
            tracing::debug!(key = %key, reason = %reason, "cancelling queued transaction");
            match pending.claim {
                Some(Claim::Attempt(id)) => self.abandon_attempt(&key, id),
                claim => self.release_claim(&key, claim),
            }
            trans.close(reason);

            // A handshake placeholder may have been kept alive for the
            // cancelled request; stop it too.
            let placeholders: Vec<_> = self
                .entries
                .get(&key)
                .map(|e| {
                    e.active
                        .iter()
                        .filter_map(|c| c.transaction().filter(|t| t.as_null().is_some()).map(|t| (c.clone(), t)))
                        .collect()
                })
                .unwrap_or_default();
            for (conn, null) in placeholders {
                tracing::debug!(key = %key, "closing handshake placeholder of cancelled transaction");
                conn.close_transaction(&null, reason);
            }
            return;
        }

        let bound = self
            .entries
            .values()
            .flat_map(|e| e.active.iter())
            .find(|c| c.has_transaction(&trans))
            .cloned();
        match bound {
            Some(conn) if !trans.is_done() => conn.close_transaction(&trans, reason),
            _ if !trans.is_done() => trans.close(reason),
            _ => {}
        }
    }

    pub(crate) fn reschedule(&mut self, trans: Arc<dyn Transaction>, priority: i32) {
        trans.set_priority(priority);
        for entry in self.entries.values_mut() {
            if let Some(mut pending) = entry.remove_pending(&trans) {
                tracing::trace!(key = %entry.key, priority, "rescheduling queued transaction");
                pending.priority = priority;
                entry.insert_transaction(pending);
                return;
            }
        }
    }

    /// Fail every queued transaction of one entry.
    pub(crate) fn cancel_transactions(&mut self, key: &str, reason: NetError) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        let queued = entry.drain_all_pending();
        tracing::debug!(key = %key, count = queued.len(), reason = %reason, "cancelling queued transactions");
        for pending in queued {
            self.release_claim(key, pending.claim);
            pending.trans.close(reason);
        }
    }

    pub(crate) fn update_param(&mut self, param: Param, value: u16) {
        tracing::debug!(param = ?param, value, "updating parameter");
        self.config.apply(param, value);
    }

    /// Close idle connections everywhere and stop reusing active ones.
    pub(crate) fn shift_reload_cleanup(&mut self, key: Option<String>) {
        let keys: Vec<String> = self.entries.keys().cloned().collect();
        for k in &keys {
            self.close_persistent_connections(k);
        }
        if let Some(entry) = key.and_then(|k| self.entries.get_mut(&k)) {
            entry.reset_ip_family();
        }
    }

    fn close_persistent_connections(&mut self, key: &str) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        tracing::debug!(key = %key, idle = entry.idle.len(), "closing persistent connections");
        for conn in entry.idle.drain(..) {
            self.num_idle = self.num_idle.saturating_sub(1);
            conn.close(NetError::Aborted);
        }
        for conn in &entry.active {
            conn.dont_reuse();
        }
        self.conditionally_stop_prune_timer();
    }

    /// Forget entries that hold nothing at all.
    pub(crate) fn clear_connection_history(&mut self) {
        let empty: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_empty())
            .map(|(k, _)| k.clone())
            .collect();
        for key in empty {
            self.remove_preferred(&key);
            self.entries.remove(&key);
        }
    }

    /// Move a multiplexed proxy session to the proxy's wildcard entry so
    /// other destinations behind the same proxy can share it.
    pub(crate) fn move_to_wildcard_entry(&mut self, dest: &DestinationKey, conn: Arc<dyn Connection>) {
        let Some(wildcard) = dest.wildcard() else {
            return;
        };
        let key = dest.hash_key().to_string();
        if !self.entries.contains_key(&key) {
            return;
        }
        let wc = self.get_or_create_entry(&wildcard, true);
        if wc == key {
            return;
        }
        let Some(entry) = self.entries.get_mut(&key) else {
            return;
        };
        if !entry.using_multiplex || !entry.is_active(&conn) {
            return;
        }
        if self.entries.get(&wc).is_some_and(|e| e.is_active(&conn)) {
            return;
        }
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.remove_active(&conn);
        }
        if let Some(wc_entry) = self.entries.get_mut(&wc) {
            tracing::debug!(from = %key, to = %wc, "moving multiplexed session to wildcard entry");
            wc_entry.active.insert(0, conn);
            wc_entry.using_multiplex = true;
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<EntrySnapshot> {
        let describe = |conn: &Arc<dyn Connection>| ConnectionSnapshot {
            ttl_ms: conn.time_to_live().as_millis() as u64,
            rtt_ms: conn.rtt().as_millis() as u64,
            protocol: conn.protocol_version().to_string(),
        };
        let mut out: Vec<EntrySnapshot> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.key.is_private())
            .map(|(key, e)| EntrySnapshot {
                key: key.clone(),
                host: e.key.host().to_string(),
                port: e.key.port(),
                ssl: e.key.end_to_end_ssl(),
                multiplex: e.using_multiplex,
                active: e.active.iter().map(describe).collect(),
                idle: e.idle.iter().map(describe).collect(),
                attempts: e
                    .attempts
                    .iter()
                    .map(|a| AttemptSnapshot {
                        speculative: a.is_speculative(),
                        from_predictor: a.is_from_predictor(),
                        state: a.state().as_str().to_string(),
                    })
                    .collect(),
                pending: e.queued_len(),
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Abort everything. Safe to call more than once.
    pub(crate) fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        tracing::debug!(entries = self.entries.len(), "connection manager shutting down");

        let entries = std::mem::take(&mut self.entries);
        for (key, mut entry) in entries {
            for conn in entry.active.drain(..) {
                self.decrement_active(&conn);
                if let Some(trans) = conn.transaction() {
                    conn.close_transaction(&trans, NetError::Aborted);
                }
                conn.close(NetError::Aborted);
            }
            for conn in entry.idle.drain(..) {
                self.num_idle = self.num_idle.saturating_sub(1);
                conn.close(NetError::Aborted);
            }
            for pending in entry.drain_all_pending() {
                if let Some(Claim::Null(null)) = &pending.claim {
                    if let Some(null) = null.as_null() {
                        null.unclaim();
                    }
                }
                pending.trans.close(NetError::Aborted);
            }
            for mut attempt in entry.attempts.drain(..) {
                self.num_connecting = self.num_connecting.saturating_sub(attempt.live_transports());
                self.num_half_open = self.num_half_open.saturating_sub(1);
                attempt.abandon();
            }
            tracing::trace!(key = %key, "entry removed");
        }

        self.coalescing.clear();
        self.timeout_tick.cancel();
        self.prune_timer.cancel();
        self.traffic_timer.cancel();
    }
}
