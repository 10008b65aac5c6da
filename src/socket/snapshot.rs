//! Read-only diagnostic view of the manager's entries.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
    pub ttl_ms: u64,
    pub rtt_ms: u64,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptSnapshot {
    pub speculative: bool,
    pub from_predictor: bool,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntrySnapshot {
    pub key: String,
    pub host: String,
    pub port: u16,
    pub ssl: bool,
    pub multiplex: bool,
    pub active: Vec<ConnectionSnapshot>,
    pub idle: Vec<ConnectionSnapshot>,
    pub attempts: Vec<AttemptSnapshot>,
    pub pending: usize,
}

impl EntrySnapshot {
    pub fn half_open(&self) -> usize {
        self.attempts.len()
    }
}

/// Render a snapshot as JSON for diagnostics pages.
#[cfg(feature = "json")]
pub fn snapshot_to_json(entries: &[EntrySnapshot]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(entries)
}

#[cfg(all(test, feature = "json"))]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_json_shape() {
        let entries = vec![EntrySnapshot {
            key: ".S...a.com:443".into(),
            host: "a.com".into(),
            port: 443,
            ssl: true,
            multiplex: false,
            active: vec![ConnectionSnapshot { ttl_ms: 1000, rtt_ms: 20, protocol: "http/1.1".into() }],
            idle: Vec::new(),
            attempts: vec![AttemptSnapshot { speculative: true, from_predictor: false, state: "connecting-primary".into() }],
            pending: 2,
        }];
        let json = snapshot_to_json(&entries).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value[0]["host"], "a.com");
        assert_eq!(value[0]["active"][0]["rtt_ms"], 20);
        assert_eq!(value[0]["attempts"][0]["state"], "connecting-primary");
    }
}
