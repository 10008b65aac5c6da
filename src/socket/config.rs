//! Connection manager configuration.

use std::time::Duration;

/// Limits and timing knobs for the connection manager.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Global cap on active plus connecting sockets.
    pub max_connections: usize,

    /// Extra slots per destination that urgent-start transactions may use.
    pub max_urgent_excessive: usize,

    /// Per-destination cap for direct connections and CONNECT tunnels.
    pub max_connections_per_host: usize,

    /// Per-destination cap for plain requests through an HTTP proxy.
    pub max_connections_per_proxy: usize,

    /// Passed to connections; how long a request may wait for a response.
    pub max_request_delay: Duration,

    /// Dispatch onto multiplexing connections at all.
    pub multiplex_enabled: bool,

    /// Share multiplexing connections between hosts with the same address.
    pub coalesce: bool,

    /// Delay before racing a backup transport. Zero disables backups.
    pub backup_delay: Duration,

    /// Connect attempts older than this have their transports closed.
    pub connect_timeout: Duration,

    /// After a timed-out attempt lingers this long it is abandoned.
    pub abandon_grace: Duration,

    /// Window given to connections to show traffic after a network change.
    pub network_changed_timeout: Duration,

    /// Backup transports prefer IPv4.
    pub fast_fallback_ipv4: bool,

    /// Default cap on concurrent speculative attempts per destination.
    pub parallel_speculative_limit: usize,

    /// Below this many non-multiplexed active connections the pacer is skipped.
    pub pacing_min_parallelism: usize,

    /// Share of free slots given to the focused top-level context.
    pub focused_window_ratio: f64,

    /// Empty entries are pruned only when the table is larger than this.
    pub entry_prune_threshold: usize,

    /// Empty multiplexing entries are pruned only above this table size.
    pub multiplex_entry_prune_threshold: usize,

    /// A connection that only drove a handshake counts as reused after this.
    pub null_reuse_after: Duration,

    /// Longest interval between read-timeout ticks.
    pub timeout_tick_max: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 256,
            max_urgent_excessive: 3,
            max_connections_per_host: 6,
            max_connections_per_proxy: 32,
            max_request_delay: Duration::from_secs(10),
            multiplex_enabled: true,
            coalesce: true,
            backup_delay: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(90),
            abandon_grace: Duration::from_secs(5),
            network_changed_timeout: Duration::from_secs(5),
            fast_fallback_ipv4: true,
            parallel_speculative_limit: 6,
            pacing_min_parallelism: 6,
            focused_window_ratio: 0.9,
            entry_prune_threshold: 125,
            multiplex_entry_prune_threshold: 300,
            null_reuse_after: Duration::from_millis(950),
            timeout_tick_max: Duration::from_secs(3600),
        }
    }
}

/// Limits that can be changed while the manager runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    MaxConnections,
    MaxUrgentStartQ,
    MaxPersistentConnectionsPerHost,
    MaxPersistentConnectionsPerProxy,
    /// Seconds.
    MaxRequestDelay,
}

impl PoolConfig {
    pub fn apply(&mut self, param: Param, value: u16) {
        match param {
            Param::MaxConnections => self.max_connections = value as usize,
            Param::MaxUrgentStartQ => self.max_urgent_excessive = value as usize,
            Param::MaxPersistentConnectionsPerHost => self.max_connections_per_host = value as usize,
            Param::MaxPersistentConnectionsPerProxy => self.max_connections_per_proxy = value as usize,
            Param::MaxRequestDelay => self.max_request_delay = Duration::from_secs(value as u64),
        }
    }
}
