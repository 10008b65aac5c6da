//! Background supervision: dead-connection pruning, no-traffic pruning and
//! the read-timeout tick.

use crate::base::neterror::NetError;
use crate::manager::Msg;
use crate::socket::connection::Connection;
use crate::socket::pool::ConnectionPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const MIN_TICK: Duration = Duration::from_secs(1);

impl ConnectionPool {
    /// Make sure pruning runs no later than `ttl` from now.
    pub(crate) fn prune_after(&mut self, ttl: Duration) {
        let tx = self.tx().clone();
        self.prune_timer.arm_if_earlier(&tx, ttl, Msg::PruneTimerFired);
    }

    pub(crate) fn conditionally_stop_prune_timer(&mut self) {
        if self.num_idle > 0 {
            return;
        }
        // Multiplexed sessions stay active and still expire.
        if self.num_active > 0 && self.config.multiplex_enabled {
            return;
        }
        self.prune_timer.cancel();
    }

    pub(crate) fn prune_dead_connections(&mut self) {
        tracing::debug!(entries = self.entries.len(), idle = self.num_idle, "pruning dead connections");
        let mut next: Option<Duration> = None;
        let mut soonest = |ttl: Duration| next = Some(next.map_or(ttl, |n| n.min(ttl)));

        for entry in self.entries.values_mut() {
            let mut i = entry.idle.len();
            while i > 0 {
                i -= 1;
                if entry.idle[i].can_reuse() {
                    soonest(entry.idle[i].time_to_live());
                    continue;
                }
                let conn = entry.idle.remove(i);
                self.num_idle = self.num_idle.saturating_sub(1);
                conn.close(NetError::Aborted);
            }

            if entry.using_multiplex {
                for conn in entry.active.iter().filter(|c| c.uses_multiplex()) {
                    if conn.can_reuse() {
                        soonest(conn.time_to_live());
                    } else {
                        conn.dont_reuse();
                    }
                }
            }
            entry.remove_empty_pending_queues();
        }

        self.prune_empty_entries();

        match next {
            Some(ttl) => self.prune_after(ttl),
            None => self.conditionally_stop_prune_timer(),
        }
    }

    /// Drop empty entries once the table grows large. Multiplexing entries
    /// serve coalescing and survive until a higher threshold.
    fn prune_empty_entries(&mut self) {
        if self.entries.len() <= self.config.entry_prune_threshold {
            return;
        }
        let empty: Vec<(String, bool)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_empty())
            .map(|(k, e)| (k.clone(), e.using_multiplex))
            .collect();
        for (key, multiplex) in empty {
            if self.entries.len() <= self.config.entry_prune_threshold {
                break;
            }
            if multiplex
                && self.config.multiplex_enabled
                && self.entries.len() <= self.config.multiplex_entry_prune_threshold
            {
                continue;
            }
            tracing::trace!(key = %key, "removing empty entry");
            self.remove_preferred(&key);
            self.entries.remove(&key);
        }
    }

    /// Ask every connection to watch for traffic, then prune the silent ones.
    pub(crate) fn verify_traffic(&mut self) {
        if self.pruning_no_traffic {
            return;
        }
        for entry in self.entries.values() {
            for conn in &entry.active {
                conn.check_for_traffic(true);
            }
            for conn in &entry.idle {
                conn.check_for_traffic(false);
            }
        }
        self.pruning_no_traffic = true;
        let tx = self.tx().clone();
        let grace = self.config.network_changed_timeout;
        self.traffic_timer.arm(&tx, grace, Msg::TrafficTimerFired);
        tracing::debug!(grace_ms = grace.as_millis() as u64, "verifying traffic");
    }

    pub(crate) fn prune_no_traffic(&mut self) {
        self.pruning_no_traffic = false;
        let mut silent: Vec<Arc<dyn Connection>> = Vec::new();
        for entry in self.entries.values_mut() {
            let mut i = 0;
            while i < entry.active.len() {
                if entry.active[i].no_traffic() {
                    silent.push(entry.active.remove(i));
                } else {
                    i += 1;
                }
            }
        }
        tracing::debug!(count = silent.len(), "pruning connections without traffic");
        for conn in silent {
            self.decrement_active(&conn);
            conn.close(NetError::Aborted);
        }
        self.conditionally_stop_timeout_tick();
    }

    /// Start the tick, or pull it in to one second if it runs slower.
    pub(crate) fn activate_timeout_tick(&mut self) {
        let tx = self.tx().clone();
        self.timeout_tick.arm_if_earlier(&tx, MIN_TICK, Msg::TimeoutTick);
    }

    pub(crate) fn conditionally_stop_timeout_tick(&mut self) {
        if self.num_active == 0 && self.num_half_open == 0 {
            self.timeout_tick.cancel();
        }
    }

    pub(crate) fn on_timeout_tick(&mut self, generation: u64) {
        if !self.timeout_tick.fire(generation) {
            return;
        }
        let now = Instant::now();
        let mut next = self.config.timeout_tick_max;

        for entry in self.entries.values() {
            for conn in &entry.active {
                if let Some(wait) = conn.read_timeout_tick(now) {
                    next = next.min(wait);
                }
            }
        }

        let connect_timeout = self.config.connect_timeout;
        let abandon_after = connect_timeout + self.config.abandon_grace;
        let mut timed_out = Vec::new();
        let mut stale = Vec::new();
        let mut closed = 0;
        for (key, entry) in self.entries.iter_mut() {
            for attempt in entry.attempts.iter_mut() {
                next = MIN_TICK;
                let elapsed = attempt.duration(now);
                if elapsed >= abandon_after {
                    stale.push((key.clone(), attempt.id()));
                } else if elapsed >= connect_timeout && !attempt.timed_out() {
                    closed += attempt.live_transports();
                    attempt.close_transports(NetError::ConnectionTimedOut);
                    timed_out.push((key.clone(), attempt.id()));
                }
            }
        }
        self.num_connecting = self.num_connecting.saturating_sub(closed);

        for (key, id) in timed_out {
            tracing::debug!(key = %key, attempt = ?id, "connect attempt timed out");
            self.fail_bound_transaction(&key, id, NetError::ConnectionTimedOut);
        }
        for (key, id) in stale {
            self.abandon_attempt(&key, id);
        }

        if self.num_active == 0 && self.num_half_open == 0 {
            tracing::trace!("timeout tick stopped");
            return;
        }
        let tx = self.tx().clone();
        self.timeout_tick.arm(&tx, next.max(MIN_TICK), Msg::TimeoutTick);
    }
}
