//! Connect attempt lifecycle: starting transports, reacting to their
//! progress, and turning the winner into a connection.

use crate::base::neterror::NetError;
use crate::http::caps::Caps;
use crate::http::transaction::{NullTransaction, Transaction};
use crate::manager::Msg;
use crate::socket::coalesce::coalescing_keys;
use crate::socket::connectattempt::{AttemptId, ConnectAttempt, Side};
use crate::socket::connection::ConnectionParams;
use crate::socket::entry::{Claim, PendingTransaction};
use crate::socket::pool::ConnectionPool;
use crate::socket::transport::{ConnectFlags, TransportEvents, TransportStatus};
use std::sync::Arc;
use tokio::time::Instant;

impl ConnectionPool {
    fn connect_flags(&self, key: &str, caps: Caps, side: Side, disable_rfc1918: bool) -> ConnectFlags {
        let mut flags = ConnectFlags {
            bypass_cache: caps.contains(Caps::REFRESH_DNS),
            anonymous: caps.contains(Caps::LOAD_ANONYMOUS),
            disable_rfc1918,
            ..ConnectFlags::default()
        };
        let Some(entry) = self.entries.get(key) else {
            return flags;
        };
        flags.anonymous |= entry.key.is_anonymous();
        flags.no_permanent_storage = entry.key.is_private();
        flags.be_conservative = caps.contains(Caps::BE_CONSERVATIVE) || entry.key.be_conservative();

        if entry.prefers_ipv4() {
            flags.disable_ipv6 = true;
            flags.retry_with_different_ip_family = true;
        } else if entry.prefers_ipv6() {
            flags.disable_ipv4 = true;
            flags.retry_with_different_ip_family = true;
        } else if side == Side::Backup && self.config.fast_fallback_ipv4 {
            flags.disable_ipv6 = true;
        }
        flags
    }

    /// Start a connect attempt for `key`. When `pending` is given the new
    /// attempt is claimed for it.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create_transport(
        &mut self,
        key: &str,
        trans: Arc<dyn Transaction>,
        caps: Caps,
        speculative: bool,
        from_predictor: bool,
        allow_1918: bool,
        pending: Option<&mut PendingTransaction>,
    ) -> Result<AttemptId, NetError> {
        let dest = self.entries.get(key).ok_or(NetError::Unexpected)?.key.clone();
        let id = AttemptId(self.next_attempt_id);
        self.next_attempt_id += 1;

        let flags = self.connect_flags(key, caps, Side::Primary, speculative && !allow_1918);
        let events = TransportEvents::new(self.tx().clone(), id, Side::Primary);
        let transport = self.transports.create(&dest, flags, events)?;

        let mut attempt = ConnectAttempt::new(id, trans, caps, speculative, from_predictor, allow_1918);
        attempt.start_primary(transport, Instant::now());
        if let Some(pending) = pending {
            if attempt.claim(self.tx(), self.config.backup_delay) {
                pending.claim = Some(Claim::Attempt(id));
            }
        }
        tracing::debug!(key = %key, attempt = ?id, speculative, "starting connect attempt");

        if let Some(entry) = self.entries.get_mut(key) {
            entry.attempts.push(attempt);
        }
        self.num_half_open += 1;
        self.num_connecting += 1;
        self.activate_timeout_tick();
        Ok(id)
    }

    fn locate_attempt(&self, id: AttemptId) -> Option<String> {
        self.entries
            .iter()
            .find(|(_, e)| e.attempts.iter().any(|a| a.id() == id))
            .map(|(k, _)| k.clone())
    }

    pub(crate) fn on_backup_timer(&mut self, id: AttemptId, generation: u64) {
        let Some(key) = self.locate_attempt(id) else {
            return;
        };
        let Some(attempt) = self.entries.get_mut(&key).and_then(|e| e.attempt_mut(id)) else {
            return;
        };
        if !attempt.backup_timer_fired(generation) {
            return;
        }
        let caps = attempt.caps();
        let disable_rfc1918 = attempt.is_speculative() && !attempt.allow_1918();

        let flags = self.connect_flags(&key, caps, Side::Backup, disable_rfc1918);
        let Some(dest) = self.entries.get(&key).map(|e| e.key.clone()) else {
            return;
        };
        let events = TransportEvents::new(self.tx().clone(), id, Side::Backup);
        match self.transports.create(&dest, flags, events) {
            Ok(transport) => {
                if let Some(attempt) = self.entries.get_mut(&key).and_then(|e| e.attempt_mut(id)) {
                    tracing::debug!(key = %key, attempt = ?id, "starting backup transport");
                    attempt.start_backup(transport, Instant::now());
                    self.num_connecting += 1;
                }
            }
            Err(e) => {
                tracing::debug!(key = %key, attempt = ?id, error = %e, "backup transport failed to start");
                let exhausted = self
                    .entries
                    .get_mut(&key)
                    .and_then(|entry| entry.attempt_mut(id))
                    .map(|a| {
                        a.backup_start_failed();
                        a.live_transports() == 0
                    })
                    .unwrap_or(false);
                if exhausted {
                    self.fail_bound_transaction(&key, id, e);
                    self.abandon_attempt(&key, id);
                }
            }
        }
    }

    pub(crate) fn on_transport_status(&mut self, id: AttemptId, side: Side, status: TransportStatus) {
        let Some(key) = self.locate_attempt(id) else {
            tracing::trace!(attempt = ?id, ?status, "status for unknown attempt");
            return;
        };
        let tx = self.tx().clone();
        let backup_delay = self.config.backup_delay;
        let capture = self.config.multiplex_enabled && self.config.coalesce;
        let Some(entry) = self.entries.get_mut(&key) else {
            return;
        };

        if let Some(claimant) = entry.find_pending_mut(|p| p.claims(id)) {
            claimant.trans.on_transport_status(status);
        }
        let Some(attempt) = entry.attempt_mut(id) else {
            return;
        };
        attempt.transaction().on_transport_status(status);
        attempt.on_status(side, status);

        if side != Side::Primary || status != TransportStatus::ConnectingTo {
            return;
        }
        let addrs = attempt.primary_transport().map(|t| t.resolved_addrs()).unwrap_or_default();
        if !attempt.has_backup() {
            attempt.arm_backup_timer(&tx, backup_delay);
        }

        let captured = capture
            && entry.key.end_to_end_ssl()
            && !entry.key.using_proxy()
            && entry.coalescing_keys.is_empty()
            && !addrs.is_empty();
        if captured {
            entry.coalescing_keys = coalescing_keys(&entry.key, &addrs);
            tracing::trace!(key = %key, count = entry.coalescing_keys.len(), "captured coalescing keys");
            self.process_multiplex_pending_q(&key);
        }
    }

    /// First side to become writable wins.
    pub(crate) fn on_transport_writable(&mut self, id: AttemptId, side: Side) {
        let Some(key) = self.locate_attempt(id) else {
            return;
        };
        let Some(entry) = self.entries.get_mut(&key) else {
            return;
        };
        let live = entry.attempt_mut(id).is_some_and(|a| match side {
            Side::Primary => a.primary_transport().is_some(),
            Side::Backup => a.has_backup(),
        });
        if !live {
            return;
        }
        let Some(mut attempt) = entry.take_attempt(id) else {
            return;
        };
        let before = attempt.live_transports();
        let Some(winner) = attempt.take_winner(side, Instant::now()) else {
            return;
        };
        if let Some(addr) = winner.transport.peer_addr() {
            entry.record_ip_family(addr);
        }
        let dest = entry.key.clone();
        self.num_connecting = self.num_connecting.saturating_sub(before);
        self.num_half_open = self.num_half_open.saturating_sub(1);

        let params = ConnectionParams {
            caps: attempt.caps(),
            rtt: winner.rtt,
            connected_ok: winner.connected_ok,
            max_request_delay: self.config.max_request_delay,
        };
        tracing::debug!(key = %key, attempt = ?id, ?side, rtt_ms = winner.rtt.as_millis() as u64, "connect attempt won");

        match self.connections.create(&dest, winner.transport, params, self.handle.clone()) {
            Ok(conn) => {
                let bound = self.entries.get_mut(&key).and_then(|e| e.take_claimant(id));
                if let Some(pending) = bound {
                    self.add_active(&key, conn.clone());
                    let caps = pending.trans.caps();
                    if let Err(e) = self.dispatch_transaction(&key, pending.trans.clone(), caps, pending.priority, conn) {
                        pending.trans.close(e);
                    }
                } else {
                    conn.set_reused_after(self.config.null_reuse_after);
                    let queued = self.entries.get(&key).map_or(0, |e| e.queued_len());
                    if dest.first_hop_ssl() && queued == 0 && !dest.using_connect() {
                        // Finish the handshake so the connection is ready when idle.
                        let null: Arc<dyn Transaction> = match attempt.transaction().as_null() {
                            Some(_) => attempt.transaction().clone(),
                            None => Arc::new(NullTransaction::new(dest.clone(), attempt.caps())),
                        };
                        self.add_active(&key, conn.clone());
                        let caps = null.caps();
                        if let Err(e) = self.dispatch_transaction(&key, null, caps, 0, conn) {
                            tracing::debug!(key = %key, error = %e, "handshake placeholder failed");
                        }
                    } else {
                        self.add_active(&key, conn.clone());
                        self.reclaim_connection(conn);
                    }
                }
            }
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "failed to create connection");
                self.fail_bound_transaction(&key, id, e);
            }
        }

        if let Some(entry) = self.entries.get_mut(&key) {
            entry.release_attempt_claims(id);
            if entry.unconnected_attempts() == 0 {
                self.post(Msg::ProcessPendingQ(Some(key)));
            }
        }
    }

    pub(crate) fn on_transport_failed(&mut self, id: AttemptId, side: Side, error: NetError) {
        let Some(key) = self.locate_attempt(id) else {
            return;
        };
        let Some(entry) = self.entries.get_mut(&key) else {
            return;
        };
        if error.is_connect_failure() && (entry.prefers_ipv4() || entry.prefers_ipv6()) {
            // The remembered family may be the broken one.
            entry.reset_ip_family();
        }
        let Some(attempt) = entry.attempt_mut(id) else {
            return;
        };
        let removed = attempt.side_failed(side);
        let exhausted = attempt.live_transports() == 0 && !attempt.backup_timer_armed();
        if removed {
            self.num_connecting = self.num_connecting.saturating_sub(1);
        }
        tracing::debug!(key = %key, attempt = ?id, ?side, error = %error, exhausted, "transport failed");
        if exhausted {
            self.fail_bound_transaction(&key, id, error);
            self.abandon_attempt(&key, id);
        }
    }

    /// Fail the transaction waiting on attempt `id`, unless it still has
    /// another way to get a connection.
    pub(crate) fn fail_bound_transaction(&mut self, key: &str, id: AttemptId, error: NetError) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        let other_avenues =
            !entry.idle.is_empty() || entry.attempts.iter().any(|a| a.id() != id && !a.has_connected() && !a.timed_out());
        if other_avenues {
            entry.release_attempt_claims(id);
            return;
        }
        if let Some(pending) = entry.take_claimant(id) {
            tracing::debug!(key = %key, attempt = ?id, error = %error, "failing transaction bound to attempt");
            pending.trans.close(error);
        }
    }

    /// Tear down attempt `id` and forget it.
    pub(crate) fn abandon_attempt(&mut self, key: &str, id: AttemptId) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        let Some(mut attempt) = entry.take_attempt(id) else {
            return;
        };
        let live = attempt.live_transports();
        let connected = attempt.has_connected();
        attempt.abandon();
        entry.release_attempt_claims(id);
        let drained = entry.unconnected_attempts() == 0;
        tracing::debug!(key = %key, attempt = ?id, "abandoning connect attempt");

        self.num_connecting = self.num_connecting.saturating_sub(live);
        if !connected {
            self.num_half_open = self.num_half_open.saturating_sub(1);
        }
        if drained {
            self.post(Msg::ProcessPendingQ(Some(key.to_string())));
        }
        self.conditionally_stop_timeout_tick();
    }
}
