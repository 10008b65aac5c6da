//! Per-destination state.
//!
//! A [`DestinationEntry`] holds everything the manager knows about one
//! destination: idle and active connections, in-flight connect attempts and
//! the queues of transactions waiting for a connection. Pending transactions
//! live in exactly one queue: the urgent-start queue or the queue of their
//! top-level context. Every queue is ordered by descending priority, first
//! come first served among equals.

use crate::http::caps::Caps;
use crate::http::transaction::{same_transaction, Transaction};
use crate::socket::connectattempt::{AttemptId, ConnectAttempt};
use crate::socket::connection::{same_connection, Connection};
use crate::socket::destination::DestinationKey;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// What a queued transaction is already waiting on.
#[derive(Clone)]
pub(crate) enum Claim {
    /// A connect attempt that will hand it the new connection.
    Attempt(AttemptId),
    /// A placeholder transaction finishing a handshake on an active connection.
    Null(Arc<dyn Transaction>),
}

pub(crate) struct PendingTransaction {
    pub trans: Arc<dyn Transaction>,
    pub priority: i32,
    pub claim: Option<Claim>,
}

impl PendingTransaction {
    pub fn new(trans: Arc<dyn Transaction>, priority: i32) -> Self {
        Self { trans, priority, claim: None }
    }

    pub fn claims(&self, id: AttemptId) -> bool {
        matches!(self.claim, Some(Claim::Attempt(a)) if a == id)
    }

    fn is_urgent(&self) -> bool {
        self.trans.caps().contains(Caps::URGENT_START)
    }
}

impl std::fmt::Debug for PendingTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTransaction")
            .field("priority", &self.priority)
            .field("caps", &self.trans.caps())
            .field("claimed", &self.claim.is_some())
            .finish()
    }
}

/// Insert after the last element whose priority is at least `pending`'s.
pub(crate) fn insert_sorted(queue: &mut Vec<PendingTransaction>, pending: PendingTransaction) {
    let idx = queue
        .iter()
        .rposition(|p| p.priority >= pending.priority)
        .map_or(0, |i| i + 1);
    queue.insert(idx, pending);
}

/// Insert before the first element of equal or lower priority. Used to put
/// leftovers back at the head of their priority band.
fn insert_sorted_first(queue: &mut Vec<PendingTransaction>, pending: PendingTransaction) {
    let idx = queue
        .iter()
        .rposition(|p| p.priority > pending.priority)
        .map_or(0, |i| i + 1);
    queue.insert(idx, pending);
}

pub(crate) struct DestinationEntry {
    pub key: DestinationKey,
    pub idle: Vec<Arc<dyn Connection>>,
    pub active: Vec<Arc<dyn Connection>>,
    pub attempts: Vec<ConnectAttempt>,
    pub urgent: Vec<PendingTransaction>,
    pub pending: BTreeMap<u64, Vec<PendingTransaction>>,
    pub coalescing_keys: Vec<String>,
    pub using_multiplex: bool,
    pub in_preferred_index: bool,
    prefer_ipv4: bool,
    prefer_ipv6: bool,
}

impl std::fmt::Debug for DestinationEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationEntry")
            .field("key", &self.key.hash_key())
            .field("idle", &self.idle.len())
            .field("active", &self.active.len())
            .field("attempts", &self.attempts)
            .field("urgent", &self.urgent.len())
            .field("pending", &self.pending_len())
            .field("using_multiplex", &self.using_multiplex)
            .finish()
    }
}

impl DestinationEntry {
    pub fn new(key: DestinationKey) -> Self {
        Self {
            key,
            idle: Vec::new(),
            active: Vec::new(),
            attempts: Vec::new(),
            urgent: Vec::new(),
            pending: BTreeMap::new(),
            coalescing_keys: Vec::new(),
            using_multiplex: false,
            in_preferred_index: false,
            prefer_ipv4: false,
            prefer_ipv6: false,
        }
    }

    /// Queue a transaction behind everything of equal or higher priority.
    pub fn insert_transaction(&mut self, pending: PendingTransaction) {
        if pending.is_urgent() {
            insert_sorted(&mut self.urgent, pending);
        } else {
            let ctx = pending.trans.top_level_context_id();
            insert_sorted(self.pending.entry(ctx).or_default(), pending);
        }
    }

    /// Put back transactions taken for dispatch, preserving their order.
    pub fn restore_transactions(&mut self, leftovers: Vec<PendingTransaction>) {
        for pending in leftovers.into_iter().rev() {
            if pending.is_urgent() {
                insert_sorted_first(&mut self.urgent, pending);
            } else {
                let ctx = pending.trans.top_level_context_id();
                insert_sorted_first(self.pending.entry(ctx).or_default(), pending);
            }
        }
    }

    /// Take up to `max` (zero means all) transactions from the focused context's queue.
    pub fn take_focused(&mut self, ctx: u64, max: usize, out: &mut Vec<PendingTransaction>) {
        let Some(queue) = self.pending.get_mut(&ctx) else {
            return;
        };
        let count = if max == 0 { queue.len() } else { max.min(queue.len()) };
        out.extend(queue.drain(..count));
    }

    /// Take up to `max` (zero means all) transactions from every other
    /// context, merged by priority. A zero `ctx` takes from every queue.
    pub fn take_non_focused(&mut self, ctx: u64, max: usize, out: &mut Vec<PendingTransaction>) {
        let mut total = 0;
        for (id, queue) in self.pending.iter_mut() {
            if ctx != 0 && *id == ctx {
                continue;
            }
            let room = if max == 0 { queue.len() } else { (max - total).min(queue.len()) };
            for pending in queue.drain(..room) {
                insert_sorted(out, pending);
            }
            total += room;
            if max != 0 && total == max {
                break;
            }
        }
    }

    pub fn remove_empty_pending_queues(&mut self) {
        self.pending.retain(|_, queue| !queue.is_empty());
    }

    /// Non-urgent queued transactions across all contexts.
    pub fn pending_len(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    pub fn queued_len(&self) -> usize {
        self.urgent.len() + self.pending_len()
    }

    /// Remove `trans` from whichever queue holds it.
    pub fn remove_pending(&mut self, trans: &Arc<dyn Transaction>) -> Option<PendingTransaction> {
        if let Some(idx) = self.urgent.iter().position(|p| same_transaction(&p.trans, trans)) {
            return Some(self.urgent.remove(idx));
        }
        for queue in self.pending.values_mut() {
            if let Some(idx) = queue.iter().position(|p| same_transaction(&p.trans, trans)) {
                return Some(queue.remove(idx));
            }
        }
        None
    }

    pub fn find_pending_mut(&mut self, mut pred: impl FnMut(&PendingTransaction) -> bool) -> Option<&mut PendingTransaction> {
        self.urgent
            .iter_mut()
            .chain(self.pending.values_mut().flatten())
            .find(|p| pred(p))
    }

    /// Remove the queued transaction waiting on attempt `id`.
    pub fn take_claimant(&mut self, id: AttemptId) -> Option<PendingTransaction> {
        let trans = self.find_pending_mut(|p| p.claims(id))?.trans.clone();
        self.remove_pending(&trans)
    }

    /// Forget every claim on attempt `id`; the transactions stay queued.
    pub fn release_attempt_claims(&mut self, id: AttemptId) {
        for pending in self.urgent.iter_mut().chain(self.pending.values_mut().flatten()) {
            if pending.claims(id) {
                pending.claim = None;
            }
        }
    }

    pub fn drain_all_pending(&mut self) -> Vec<PendingTransaction> {
        let mut all: Vec<_> = self.urgent.drain(..).collect();
        for (_, queue) in std::mem::take(&mut self.pending) {
            all.extend(queue);
        }
        all
    }

    /// Attempts that have not produced a connection; they count against the cap.
    pub fn unconnected_attempts(&self) -> usize {
        self.attempts.iter().filter(|a| !a.has_connected()).count()
    }

    pub fn attempt_mut(&mut self, id: AttemptId) -> Option<&mut ConnectAttempt> {
        self.attempts.iter_mut().find(|a| a.id() == id)
    }

    pub fn take_attempt(&mut self, id: AttemptId) -> Option<ConnectAttempt> {
        let idx = self.attempts.iter().position(|a| a.id() == id)?;
        Some(self.attempts.remove(idx))
    }

    /// Idle list stays sorted by descending `max_bytes_read`.
    pub fn insert_idle(&mut self, conn: Arc<dyn Connection>) {
        let bytes = conn.max_bytes_read();
        let idx = self
            .idle
            .iter()
            .position(|c| c.max_bytes_read() < bytes)
            .unwrap_or(self.idle.len());
        self.idle.insert(idx, conn);
    }

    pub fn remove_active(&mut self, conn: &Arc<dyn Connection>) -> bool {
        match self.active.iter().position(|c| same_connection(c, conn)) {
            Some(idx) => {
                self.active.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, conn: &Arc<dyn Connection>) -> bool {
        self.active.iter().any(|c| same_connection(c, conn))
    }

    pub fn is_idle(&self, conn: &Arc<dyn Connection>) -> bool {
        self.idle.iter().any(|c| same_connection(c, conn))
    }

    pub fn holds(&self, conn: &Arc<dyn Connection>) -> bool {
        self.is_active(conn) || self.is_idle(conn)
    }

    pub fn is_empty(&self) -> bool {
        self.idle.is_empty() && self.active.is_empty() && self.attempts.is_empty() && self.queued_len() == 0
    }

    /// Remember which address family worked so later transports skip the other.
    pub fn record_ip_family(&mut self, addr: SocketAddr) {
        match addr {
            SocketAddr::V4(_) if !self.prefer_ipv6 => self.prefer_ipv4 = true,
            SocketAddr::V6(_) if !self.prefer_ipv4 => self.prefer_ipv6 = true,
            _ => {}
        }
    }

    pub fn reset_ip_family(&mut self) {
        self.prefer_ipv4 = false;
        self.prefer_ipv6 = false;
    }

    pub fn prefers_ipv4(&self) -> bool {
        self.prefer_ipv4
    }

    pub fn prefers_ipv6(&self) -> bool {
        self.prefer_ipv6
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::neterror::NetError;

    struct Job {
        key: DestinationKey,
        caps: Caps,
        ctx: u64,
    }

    impl Transaction for Job {
        fn destination(&self) -> &DestinationKey {
            &self.key
        }

        fn caps(&self) -> Caps {
            self.caps
        }

        fn top_level_context_id(&self) -> u64 {
            self.ctx
        }

        fn is_done(&self) -> bool {
            false
        }

        fn close(&self, _reason: NetError) {}
    }

    fn job(caps: Caps, ctx: u64) -> Arc<dyn Transaction> {
        Arc::new(Job { key: DestinationKey::new("example.com", 443, true), caps, ctx })
    }

    fn entry() -> DestinationEntry {
        DestinationEntry::new(DestinationKey::new("example.com", 443, true))
    }

    #[test]
    fn test_insert_sorted_is_stable_and_descending() {
        let mut queue = Vec::new();
        let a = job(Caps::NONE, 0);
        let b = job(Caps::NONE, 0);
        let c = job(Caps::NONE, 0);
        insert_sorted(&mut queue, PendingTransaction::new(a.clone(), 0));
        insert_sorted(&mut queue, PendingTransaction::new(b.clone(), 0));
        insert_sorted(&mut queue, PendingTransaction::new(c.clone(), 5));

        assert!(same_transaction(&queue[0].trans, &c));
        assert!(same_transaction(&queue[1].trans, &a));
        assert!(same_transaction(&queue[2].trans, &b));
    }

    #[test]
    fn test_urgent_and_context_queues_are_disjoint() {
        let mut e = entry();
        let urgent = job(Caps::URGENT_START, 7);
        let normal = job(Caps::NONE, 7);
        e.insert_transaction(PendingTransaction::new(urgent.clone(), 0));
        e.insert_transaction(PendingTransaction::new(normal.clone(), 0));

        assert_eq!(e.urgent.len(), 1);
        assert_eq!(e.pending_len(), 1);
        assert!(e.remove_pending(&urgent).is_some());
        assert!(e.remove_pending(&urgent).is_none());
        assert_eq!(e.queued_len(), 1);
    }

    #[test]
    fn test_take_focused_and_non_focused() {
        let mut e = entry();
        for ctx in [1, 1, 2, 3] {
            e.insert_transaction(PendingTransaction::new(job(Caps::NONE, ctx), ctx as i32));
        }

        let mut focused = Vec::new();
        e.take_focused(1, 1, &mut focused);
        assert_eq!(focused.len(), 1);

        let mut others = Vec::new();
        e.take_non_focused(1, 0, &mut others);
        // Contexts 2 and 3, merged by priority.
        assert_eq!(others.iter().map(|p| p.priority).collect::<Vec<_>>(), vec![3, 2]);
        assert_eq!(e.pending_len(), 1);
    }

    #[test]
    fn test_restore_preserves_order_ahead_of_equal_priority() {
        let mut e = entry();
        let first = job(Caps::NONE, 0);
        let second = job(Caps::NONE, 0);
        let late = job(Caps::NONE, 0);
        e.insert_transaction(PendingTransaction::new(first.clone(), 1));
        e.insert_transaction(PendingTransaction::new(second.clone(), 1));

        let mut taken = Vec::new();
        e.take_focused(0, 0, &mut taken);
        e.insert_transaction(PendingTransaction::new(late.clone(), 1));
        e.restore_transactions(taken);

        let queue = &e.pending[&0];
        assert!(same_transaction(&queue[0].trans, &first));
        assert!(same_transaction(&queue[1].trans, &second));
        assert!(same_transaction(&queue[2].trans, &late));
    }

    #[test]
    fn test_ip_family_preference() {
        let mut e = entry();
        e.record_ip_family("127.0.0.1:443".parse().unwrap());
        e.record_ip_family("[::1]:443".parse().unwrap());
        assert!(e.prefers_ipv4());
        assert!(!e.prefers_ipv6());
        e.reset_ip_family();
        assert!(!e.prefers_ipv4());
    }
}
