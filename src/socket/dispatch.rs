//! Dispatch ladder and pending-queue processing.

use crate::base::neterror::NetError;
use crate::http::caps::Caps;
use crate::http::transaction::{NullTransaction, Transaction};
use crate::manager::{Msg, SpeculativeOptions};
use crate::socket::connection::{same_connection, Connection};
use crate::socket::destination::DestinationKey;
use crate::socket::entry::{Claim, PendingTransaction};
use crate::socket::pool::ConnectionPool;
use std::sync::Arc;

/// Outcome of one pass down the dispatch ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatch {
    Dispatched,
    /// Not a failure; the transaction stays queued.
    RetryLater,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NewConnection {
    /// A connect attempt now owes this transaction a connection.
    Started,
    Unavailable,
}

impl ConnectionPool {
    pub(crate) fn process_new_transaction(&mut self, trans: Arc<dyn Transaction>, priority: i32) -> Result<(), NetError> {
        if let Err(e) = trans.status() {
            tracing::debug!(error = %e, "dropping transaction that already failed");
            return Ok(());
        }

        let dest = trans.destination().clone();
        let mut key = self.get_or_create_entry(&dest, dest.using_connect());
        if let Some(preferred) = self.preferred_entry(&key) {
            if preferred != key {
                tracing::debug!(key = %key, preferred = %preferred, "redirecting to coalesced entry");
                key = preferred;
            }
        }

        if let Some(conn) = trans.take_sticky_connection() {
            let owner = self
                .find_connection_entry(&conn)
                .filter(|k| self.entries.get(k).is_some_and(|e| e.is_active(&conn)))
                .ok_or(NetError::Unexpected)?;
            tracing::debug!(key = %owner, "dispatching on sticky connection");
            let caps = trans.caps();
            return self.dispatch_transaction(&owner, trans, caps, priority, conn);
        }

        let mut pending = PendingTransaction::new(trans, priority);
        match self.try_dispatch(&key, false, &mut pending) {
            Ok(Dispatch::Dispatched) => Ok(()),
            Ok(Dispatch::RetryLater) => {
                if let Some(entry) = self.entries.get_mut(&key) {
                    tracing::trace!(key = %key, priority, "queueing transaction");
                    entry.insert_transaction(pending);
                }
                Ok(())
            }
            Err(e) => {
                self.release_claim(&key, pending.claim.take());
                Err(e)
            }
        }
    }

    /// Walk the ladder once. On `RetryLater` the caller keeps the transaction
    /// queued; `pending.claim` may have been set along the way.
    pub(crate) fn try_dispatch(
        &mut self,
        key: &str,
        only_reused: bool,
        pending: &mut PendingTransaction,
    ) -> Result<Dispatch, NetError> {
        let trans = pending.trans.clone();
        let caps = trans.caps();
        let priority = pending.priority;

        // 1. Multiplexed session, no limits apply.
        let mut unused_multiplex = None;
        if !caps.contains(Caps::DISALLOW_MULTIPLEX) && self.config.multiplex_enabled {
            if let Some((owner, conn)) = self.preferred_connection(key) {
                if caps.contains(Caps::ALLOW_KEEPALIVE) || !conn.is_experienced() {
                    tracing::trace!(key = %key, "dispatching on multiplexed connection");
                    self.dispatch_transaction(&owner, trans, caps, priority, conn)?;
                    return Ok(Dispatch::Dispatched);
                }
                unused_multiplex = Some((owner, conn));
            }
        }

        // 2. Pacing
        if !self.pacing_allows(&trans, caps) {
            tracing::trace!(key = %key, "transaction paced");
            return Ok(Dispatch::RetryLater);
        }

        // 3. Blocking group
        if caps.contains(Caps::LOAD_AS_BLOCKING) {
            trans.dispatched_as_blocking();
        } else if caps.contains(Caps::LOAD_UNBLOCKED) {
            // Explicitly exempt from group ordering.
        } else if let Some(group) = trans.request_group() {
            if group.blocking_transaction_count() > 0 {
                tracing::trace!(key = %key, "waiting for blocking transactions in group");
                return Ok(Dispatch::RetryLater);
            }
        }

        // 4. Idle reuse, best throughput first.
        if caps.contains(Caps::ALLOW_KEEPALIVE) {
            while let Some(conn) = self.pop_idle(key) {
                if !conn.can_reuse() {
                    tracing::debug!(key = %key, "closing idle connection: cannot be reused");
                    conn.close(NetError::Aborted);
                    continue;
                }
                conn.end_idle_monitoring();
                self.conditionally_stop_prune_timer();
                self.add_active(key, conn.clone());
                tracing::trace!(key = %key, "dispatching on idle connection");
                self.dispatch_transaction(key, trans, caps, priority, conn)?;
                return Ok(Dispatch::Dispatched);
            }
        }

        // 5. New connection
        if !only_reused {
            match self.make_new_connection(key, pending)? {
                NewConnection::Started => return Ok(Dispatch::RetryLater),
                NewConnection::Unavailable => {}
            }
        }

        // 6. A non-keepalive transaction cannot share the experienced session;
        // let it drain so a fresh connection fits under the cap.
        if let Some((owner, conn)) = unused_multiplex {
            tracing::debug!(key = %key, owner = %owner, "draining multiplexed connection for non-keepalive transaction");
            conn.dont_reuse();
        }

        Ok(Dispatch::RetryLater)
    }

    fn pacing_allows(&self, trans: &Arc<dyn Transaction>, caps: Caps) -> bool {
        if caps.contains(Caps::LOAD_AS_BLOCKING) || caps.contains(Caps::LOAD_UNBLOCKED) {
            return true;
        }
        if self.num_active.saturating_sub(self.num_multiplex_active) < self.config.pacing_min_parallelism {
            return true;
        }
        self.pacer.as_ref().map_or(true, |pacer| pacer.try_run(trans))
    }

    fn pop_idle(&mut self, key: &str) -> Option<Arc<dyn Connection>> {
        let entry = self.entries.get_mut(key)?;
        if entry.idle.is_empty() {
            return None;
        }
        self.num_idle = self.num_idle.saturating_sub(1);
        Some(entry.idle.remove(0))
    }

    pub(crate) fn dispatch_transaction(
        &mut self,
        key: &str,
        trans: Arc<dyn Transaction>,
        caps: Caps,
        priority: i32,
        conn: Arc<dyn Connection>,
    ) -> Result<(), NetError> {
        if let Some(pacer) = &self.pacer {
            pacer.cancel(&trans);
        }
        if conn.uses_multiplex() {
            return conn.activate(trans, caps, priority);
        }
        self.dispatch_abstract(key, trans, caps, priority, conn)
    }

    fn dispatch_abstract(
        &mut self,
        key: &str,
        trans: Arc<dyn Transaction>,
        caps: Caps,
        priority: i32,
        conn: Arc<dyn Connection>,
    ) -> Result<(), NetError> {
        if let Err(e) = conn.activate(trans, caps, priority) {
            tracing::debug!(key = %key, error = %e, "activation failed, dropping connection");
            let removed = self.entries.get_mut(key).is_some_and(|en| en.remove_active(&conn));
            if removed {
                self.decrement_active(&conn);
                self.conditionally_stop_timeout_tick();
            }
            conn.close(e);
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn make_new_connection(
        &mut self,
        key: &str,
        pending: &mut PendingTransaction,
    ) -> Result<NewConnection, NetError> {
        let caps = pending.trans.caps();

        // A speculative or abandoned attempt may already be under way.
        let tx = self.tx().clone();
        let backup_delay = self.config.backup_delay;
        if let Some(entry) = self.entries.get_mut(key) {
            let free = entry
                .attempts
                .iter_mut()
                .find(|a| !a.has_connected() && !a.timed_out() && a.is_free() && a.accepts(caps));
            if let Some(attempt) = free {
                if attempt.claim(&tx, backup_delay) {
                    tracing::debug!(key = %key, attempt = ?attempt.id(), "claimed connect attempt");
                    pending.claim = Some(Claim::Attempt(attempt.id()));
                    return Ok(NewConnection::Started);
                }
            }

            // A connection still finishing its handshake will be idle soon.
            if caps.contains(Caps::ALLOW_KEEPALIVE) {
                let null = entry
                    .active
                    .iter()
                    .filter_map(|c| c.transaction())
                    .find(|t| t.as_null().is_some_and(NullTransaction::claim));
                if let Some(null) = null {
                    tracing::debug!(key = %key, "claimed handshake placeholder");
                    pending.claim = Some(Claim::Null(null));
                    return Ok(NewConnection::Started);
                }
            }
        }

        if !caps.contains(Caps::DISALLOW_MULTIPLEX)
            && caps.contains(Caps::ALLOW_KEEPALIVE)
            && self.restrict_connections(key)
        {
            tracing::trace!(key = %key, "new connections restricted while multiplexing is negotiated");
            return Ok(NewConnection::Unavailable);
        }

        // Over the global cap: idle sockets go first, lowest throughput first.
        while self.num_idle + self.num_active + 1 >= self.config.max_connections && self.num_idle > 0 {
            if !self.close_one_idle() {
                break;
            }
        }

        // Then ask multiplexed sessions to wind down.
        if self.num_idle + self.num_active + 1 >= self.config.max_connections
            && self.num_active > 0
            && self.config.multiplex_enabled
        {
            self.drain_multiplex_sessions();
        }

        if self.at_active_connection_limit(key, caps) {
            return Ok(NewConnection::Unavailable);
        }

        let trans = pending.trans.clone();
        self.create_transport(key, trans, caps, false, false, true, Some(pending))?;
        Ok(NewConnection::Started)
    }

    fn close_one_idle(&mut self) -> bool {
        let Some(entry) = self.entries.values_mut().find(|e| !e.idle.is_empty()) else {
            return false;
        };
        let Some(conn) = entry.idle.pop() else {
            return false;
        };
        tracing::debug!(key = %entry.key, "closing idle connection to make room");
        self.num_idle = self.num_idle.saturating_sub(1);
        conn.close(NetError::Aborted);
        self.conditionally_stop_prune_timer();
        true
    }

    /// Stop reusing multiplexed sessions until enough are closing to fit one
    /// more connection under the global cap.
    fn drain_multiplex_sessions(&self) {
        let mut draining = 0;
        let sessions = self
            .entries
            .values()
            .filter(|e| e.using_multiplex)
            .flat_map(|e| e.active.iter())
            .filter(|c| c.uses_multiplex() && c.can_reuse());
        for conn in sessions {
            tracing::debug!(key = %conn.destination(), "draining multiplexed connection to make room");
            conn.dont_reuse();
            draining += 1;
            if self.num_idle + self.num_active + 1 <= self.config.max_connections + draining {
                break;
            }
        }
    }

    /// True when `key` may not open another connection for `caps`.
    pub(crate) fn at_active_connection_limit(&self, key: &str, caps: Caps) -> bool {
        let Some(entry) = self.entries.get(key) else {
            return true;
        };
        let total = entry.active.len() + entry.unconnected_attempts();
        let max_persist = self.max_persist_connections(key);

        let at_limit = if caps.contains(Caps::URGENT_START) {
            total >= max_persist + self.config.max_urgent_excessive
        } else {
            self.num_active >= self.config.max_connections || total >= max_persist
        };
        if at_limit {
            tracing::trace!(key = %key, total, max_persist, "at active connection limit");
        }
        at_limit
    }

    /// While a TLS destination is still negotiating multiplexing, hold off on
    /// extra sockets that would only be thrown away.
    pub(crate) fn restrict_connections(&mut self, key: &str) -> bool {
        if self.available_for_dispatch_now(key) {
            return true;
        }
        let multiplex_enabled = self.config.multiplex_enabled;
        let Some(entry) = self.entries.get(key) else {
            return false;
        };
        let restrict = entry.key.first_hop_ssl()
            && multiplex_enabled
            && entry.using_multiplex
            && (!entry.attempts.is_empty() || !entry.active.is_empty());
        if !restrict {
            return false;
        }
        if entry.unconnected_attempts() > 0 {
            return true;
        }
        if entry.active.iter().any(|c| !c.reported_npn() || c.can_directly_activate()) {
            return true;
        }
        // Every connection negotiated plain HTTP/1; a mixed host.
        tracing::debug!(key = %key, "multiplex restriction bypassed");
        false
    }

    pub(crate) fn process_pending_q(&mut self, key: Option<String>) {
        match key {
            Some(key) => {
                if self.process_pending_q_for_entry(&key, false) {
                    return;
                }
                let others: Vec<String> = self.entries.keys().filter(|k| **k != key).cloned().collect();
                for other in others {
                    if self.process_pending_q_for_entry(&other, false) {
                        return;
                    }
                }
            }
            None => {
                let keys: Vec<String> = self.entries.keys().cloned().collect();
                for key in keys {
                    self.process_pending_q_for_entry(&key, true);
                }
            }
        }
    }

    /// Returns true if anything was dispatched.
    pub(crate) fn process_pending_q_for_entry(&mut self, key: &str, consider_all: bool) -> bool {
        if !self.entries.contains_key(key) {
            return false;
        }
        self.process_multiplex_pending_q(key);

        let mut urgent = self.entries.get_mut(key).map(|e| std::mem::take(&mut e.urgent)).unwrap_or_default();
        let mut dispatched = self.dispatch_pending_q(key, &mut urgent, consider_all);
        if let Some(entry) = self.entries.get_mut(key) {
            entry.restore_transactions(urgent);
        }
        if dispatched && !consider_all {
            return true;
        }

        let mut queue = self.prepare_pending_q(key, consider_all);
        if !queue.is_empty() {
            dispatched |= self.dispatch_pending_q(key, &mut queue, consider_all);
            if let Some(entry) = self.entries.get_mut(key) {
                entry.restore_transactions(queue);
                entry.remove_empty_pending_queues();
            }
        }
        dispatched
    }

    /// Pull transactions to try, favouring the focused top-level context.
    fn prepare_pending_q(&mut self, key: &str, consider_all: bool) -> Vec<PendingTransaction> {
        let max_persist = self.max_persist_connections(key);
        let ctx = self.current_top_level_context;
        let ratio = self.config.focused_window_ratio;
        let Some(entry) = self.entries.get_mut(key) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let available = max_persist.saturating_sub(entry.active.len() + entry.unconnected_attempts());
        if available == 0 {
            return out;
        }

        if !consider_all {
            entry.take_focused(ctx, available, &mut out);
            if out.is_empty() {
                entry.take_non_focused(ctx, available, &mut out);
            }
            return out;
        }

        let focused_max = ((available as f64 * ratio) as usize).max(1);
        entry.take_focused(ctx, focused_max, &mut out);
        let remaining = available.saturating_sub(out.len());
        if remaining > 0 {
            entry.take_non_focused(ctx, remaining, &mut out);
        }
        out
    }

    fn dispatch_pending_q(&mut self, key: &str, queue: &mut Vec<PendingTransaction>, consider_all: bool) -> bool {
        let mut dispatched = false;
        let mut i = 0;
        while i < queue.len() {
            let only_reused = queue[i].claim.is_some();
            match self.try_dispatch(key, only_reused, &mut queue[i]) {
                Ok(Dispatch::RetryLater) => i += 1,
                Ok(Dispatch::Dispatched) => {
                    let done = queue.remove(i);
                    self.release_claim(key, done.claim);
                    dispatched = true;
                    if !consider_all {
                        break;
                    }
                }
                Err(e) => {
                    let failed = queue.remove(i);
                    tracing::debug!(key = %key, error = %e, "queued transaction failed");
                    self.release_claim(key, failed.claim);
                    failed.trans.close(e);
                }
            }
        }
        dispatched
    }

    /// Hand every multiplex-eligible queued transaction to the preferred session.
    pub(crate) fn process_multiplex_pending_q(&mut self, key: &str) {
        if !self.config.multiplex_enabled {
            return;
        }
        let Some((owner, conn)) = self.preferred_connection(key) else {
            return;
        };
        let Some(queued) = self.entries.get_mut(key).map(|e| e.drain_all_pending()) else {
            return;
        };

        let mut leftovers = Vec::new();
        for pending in queued {
            let caps = pending.trans.caps();
            if !conn.can_directly_activate()
                || !caps.contains(Caps::ALLOW_KEEPALIVE)
                || caps.contains(Caps::DISALLOW_MULTIPLEX)
            {
                leftovers.push(pending);
                continue;
            }
            tracing::trace!(key = %key, "dispatching queued transaction on multiplexed connection");
            let result = self.dispatch_transaction(&owner, pending.trans.clone(), caps, pending.priority, conn.clone());
            self.release_claim(key, pending.claim);
            if let Err(e) = result {
                pending.trans.close(e);
            }
        }
        if let Some(entry) = self.entries.get_mut(key) {
            entry.restore_transactions(leftovers);
            entry.remove_empty_pending_queues();
        }
    }

    pub(crate) fn process_all_multiplex_pending_q(&mut self) {
        let keys: Vec<String> = self.entries.keys().cloned().collect();
        for key in keys {
            self.process_multiplex_pending_q(&key);
        }
    }

    /// The coalesced entry `key` should use, if any. Only returned when the
    /// preferred entry's session also covers `key`'s host.
    pub(crate) fn preferred_entry(&mut self, key: &str) -> Option<String> {
        if !self.config.coalesce {
            return None;
        }
        let entry = self.entries.get(key)?;
        if entry.coalescing_keys.is_empty() {
            return None;
        }
        let preferred = self.coalescing.lookup(&entry.coalescing_keys)?.to_string();
        if preferred == key {
            return Some(preferred);
        }
        let host = entry.key.host().to_string();
        let port = entry.key.port();

        let Some(pref) = self.entries.get(&preferred) else {
            let keys = entry.coalescing_keys.clone();
            self.coalescing.remove(&keys, &preferred);
            return None;
        };
        if !pref.using_multiplex {
            return None;
        }
        let session = pref.active.iter().find(|c| c.can_directly_activate()).cloned();
        let Some(session) = session else {
            // Nothing left there to pool onto.
            self.remove_preferred(&preferred);
            return None;
        };
        if !session.join_connection(&host, port) {
            tracing::debug!(key = %key, preferred = %preferred, "cannot join preferred connection");
            return None;
        }
        Some(preferred)
    }

    /// The multiplexed session to use for `key`, with the entry that owns it.
    pub(crate) fn preferred_connection(&mut self, key: &str) -> Option<(String, Arc<dyn Connection>)> {
        let target = self.preferred_entry(key).unwrap_or_else(|| key.to_string());
        let entry = self.entries.get(&target)?;

        let mut experienced = None;
        let mut fresh = None;
        for conn in entry.active.iter().filter(|c| c.can_directly_activate()) {
            if conn.is_experienced() {
                experienced = Some(conn.clone());
                break;
            }
            if fresh.is_none() {
                fresh = Some(conn.clone());
            }
        }
        let conn = match (experienced, fresh) {
            (Some(exp), Some(fresh)) => {
                // Two sessions to one host; let the newer one drain.
                if !same_connection(&exp, &fresh) {
                    fresh.dont_reuse();
                }
                exp
            }
            (Some(exp), None) => exp,
            (None, Some(fresh)) => fresh,
            (None, None) => return None,
        };

        if target != key {
            if let Some(original) = self.entries.get_mut(key) {
                original.using_multiplex = true;
            }
        }
        Some((target, conn))
    }

    pub(crate) fn store_preferred(&mut self, key: &str) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        if entry.coalescing_keys.is_empty() {
            return;
        }
        self.coalescing.store(&entry.coalescing_keys, key);
        entry.in_preferred_index = true;
        tracing::debug!(key = %key, indexed = self.coalescing.len(), "registered as preferred multiplex entry");
    }

    pub(crate) fn remove_preferred(&mut self, key: &str) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        if !entry.in_preferred_index {
            return;
        }
        self.coalescing.remove(&entry.coalescing_keys, key);
        entry.in_preferred_index = false;
    }

    /// A connection learned whether it negotiated the multiplexing protocol.
    pub(crate) fn report_multiplex_connection(&mut self, conn: Arc<dyn Connection>, uses_multiplex: bool) {
        let Some(key) = self.find_connection_entry(&conn) else {
            return;
        };
        if !uses_multiplex {
            return;
        }
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.using_multiplex = true;
        }
        self.num_multiplex_active += 1;
        self.prune_after(conn.time_to_live());

        match self.preferred_entry(&key) {
            Some(preferred) if preferred != key => {
                tracing::debug!(key = %key, preferred = %preferred, "draining connection in favour of coalesced entry");
                conn.dont_reuse();
            }
            Some(_) => {
                let attempts: Vec<_> = self
                    .entries
                    .get(&key)
                    .map(|e| e.attempts.iter().map(|a| a.id()).collect())
                    .unwrap_or_default();
                for id in attempts {
                    self.abandon_attempt(&key, id);
                }
                let duplicate = self.entries.get(&key).is_some_and(|e| {
                    e.active
                        .iter()
                        .any(|c| !same_connection(c, &conn) && c.uses_multiplex() && c.can_directly_activate())
                });
                if duplicate {
                    tracing::debug!(key = %key, "draining duplicate multiplexed connection");
                    conn.dont_reuse();
                }
            }
            None => self.store_preferred(&key),
        }

        self.post(Msg::ProcessPendingQ(Some(key)));
        self.post(Msg::ProcessAllMultiplexPendingQ);
    }

    pub(crate) fn speculative_connect(&mut self, dest: DestinationKey, caps: Caps, options: SpeculativeOptions) {
        let null: Arc<dyn Transaction> = Arc::new(NullTransaction::new(dest.clone(), caps));
        let mut key = self.get_or_create_entry(&dest, false);
        if let Some(preferred) = self.preferred_entry(&key) {
            key = preferred;
        }

        let limit = options.parallel_limit.unwrap_or(self.config.parallel_speculative_limit);
        let keepalive = caps.contains(Caps::ALLOW_KEEPALIVE);
        let Some(entry) = self.entries.get(&key) else {
            return;
        };
        let idle = entry.idle.len();
        let idle_ok = (options.ignore_idle && idle < limit) || idle == 0;

        if self.num_half_open < limit
            && idle_ok
            && !(keepalive && self.restrict_connections(&key))
            && !self.at_active_connection_limit(&key, caps)
        {
            let started = self.create_transport(
                &key,
                null,
                caps,
                true,
                options.is_from_predictor,
                options.allow_1918,
                None,
            );
            if let Err(e) = started {
                tracing::debug!(key = %key, error = %e, "speculative connect failed to start");
            }
        } else {
            tracing::debug!(key = %key, idle, half_open = self.num_half_open, "speculative connect skipped");
        }
    }
}
