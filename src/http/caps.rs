//! Transaction capability bits.

use std::ops::{BitOr, BitOrAssign};

/// Capability set carried by every transaction.
///
/// Plain `u32` newtype with associated constants; combine with `|`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Caps(u32);

impl Caps {
    pub const NONE: Caps = Caps(0);
    /// Transaction may run on (and leave behind) a persistent connection.
    pub const ALLOW_KEEPALIVE: Caps = Caps(1 << 0);
    /// Never dispatch onto a multiplexing connection.
    pub const DISALLOW_MULTIPLEX: Caps = Caps(1 << 1);
    /// Transaction is pinned to the connection it already references.
    pub const STICKY_CONNECTION: Caps = Caps(1 << 2);
    pub const LOAD_ANONYMOUS: Caps = Caps(1 << 3);
    pub const BE_CONSERVATIVE: Caps = Caps(1 << 4);
    /// Blocking load (scripts, stylesheets). Exempt from pacing and the group gate.
    pub const LOAD_AS_BLOCKING: Caps = Caps(1 << 5);
    /// Exempt from pacing.
    pub const LOAD_UNBLOCKED: Caps = Caps(1 << 6);
    /// Bypass the resolver cache when connecting.
    pub const REFRESH_DNS: Caps = Caps(1 << 7);
    /// Latency critical; queued separately and allowed past the per-host cap.
    pub const URGENT_START: Caps = Caps(1 << 8);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Caps(bits)
    }

    pub const fn contains(self, other: Caps) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Caps) -> Caps {
        Caps(self.0 | other.0)
    }

    pub fn remove(&mut self, other: Caps) {
        self.0 &= !other.0;
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Caps {
    type Output = Caps;

    fn bitor(self, rhs: Caps) -> Caps {
        self.union(rhs)
    }
}

impl BitOrAssign for Caps {
    fn bitor_assign(&mut self, rhs: Caps) {
        self.0 |= rhs.0;
    }
}

impl std::fmt::Debug for Caps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const NAMES: [(Caps, &str); 9] = [
            (Caps::ALLOW_KEEPALIVE, "ALLOW_KEEPALIVE"),
            (Caps::DISALLOW_MULTIPLEX, "DISALLOW_MULTIPLEX"),
            (Caps::STICKY_CONNECTION, "STICKY_CONNECTION"),
            (Caps::LOAD_ANONYMOUS, "LOAD_ANONYMOUS"),
            (Caps::BE_CONSERVATIVE, "BE_CONSERVATIVE"),
            (Caps::LOAD_AS_BLOCKING, "LOAD_AS_BLOCKING"),
            (Caps::LOAD_UNBLOCKED, "LOAD_UNBLOCKED"),
            (Caps::REFRESH_DNS, "REFRESH_DNS"),
            (Caps::URGENT_START, "URGENT_START"),
        ];
        let mut set = f.debug_set();
        for (flag, name) in NAMES {
            if self.contains(flag) {
                set.entry(&format_args!("{name}"));
            }
        }
        set.finish()
    }
}
