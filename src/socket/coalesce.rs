//! Coalescing index.
//!
//! Maps address-derived keys to the destination entry preferred for
//! multiplexed reuse. Hosts that resolve to the same address (and whose
//! certificate the preferred connection also covers) can share its session.

use crate::socket::destination::DestinationKey;
use std::collections::HashMap;
use std::net::IpAddr;

/// Build the coalescing keys for a destination from its resolved addresses.
pub fn coalescing_keys(key: &DestinationKey, addrs: &[IpAddr]) -> Vec<String> {
    let anon = if key.is_anonymous() { "~A:" } else { "~.:" };
    addrs
        .iter()
        .map(|ip| format!("{ip}{anon}{}/[{}]viaDNS", key.port(), key.isolation()))
        .collect()
}

#[derive(Debug, Default)]
pub(crate) struct CoalescingIndex {
    preferred: HashMap<String, String>,
}

impl CoalescingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// First entry registered under any of `keys`.
    pub fn lookup(&self, keys: &[String]) -> Option<&str> {
        keys.iter().find_map(|k| self.preferred.get(k)).map(String::as_str)
    }

    /// Register `entry` under every key.
    pub fn store(&mut self, keys: &[String], entry: &str) {
        for k in keys {
            self.preferred.insert(k.clone(), entry.to_string());
        }
    }

    /// Drop the keys still pointing at `entry`.
    pub fn remove(&mut self, keys: &[String], entry: &str) {
        for k in keys {
            if self.preferred.get(k).is_some_and(|e| e == entry) {
                self.preferred.remove(k);
            }
        }
    }

    pub fn clear(&mut self) {
        self.preferred.clear();
    }

    pub fn len(&self) -> usize {
        self.preferred.len()
    }
}
