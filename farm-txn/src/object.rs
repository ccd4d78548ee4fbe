//! The version word and the on-the-wire object layout.
//!
//! Grounded on `original_source/include/farm_txn.h`'s `rlock_object` /
//! `wlock_object` / `runlock_object` / `wunlock_object` / `is_version_diff`
//! family. The version counter occupies the low 56 bits, wrapping to 1
//! (never 0) on overflow; the high 8 bits carry RLOCK (bit 0) and WLOCK
//! (bit 1). Packed into one `AtomicU64` so a single CAS moves both the lock
//! state and the version atomically, per spec §9's "implementations ...
//! MUST NOT split version and lock across two words".

use std::sync::atomic::{AtomicU64, Ordering};

const VBITS: u32 = 56;
pub const MAX_VERSION: u64 = (1u64 << VBITS) - 1;
const RLOCK_BIT: u64 = 1u64 << VBITS;
const WLOCK_BIT: u64 = 2u64 << VBITS;

fn counter(v: u64) -> u64 {
    v & MAX_VERSION
}

pub fn is_rlocked(v: u64) -> bool {
    v & RLOCK_BIT != 0
}

pub fn is_wlocked(v: u64) -> bool {
    v & WLOCK_BIT != 0
}

pub fn is_locked(v: u64) -> bool {
    is_rlocked(v) || is_wlocked(v)
}

/// True if `before` and `after` describe different committed states: either
/// carries WLOCK (an apply is or was in flight), or the version counters
/// differ once the RLOCK bit — which doesn't imply a new commit — is masked
/// away.
pub fn is_version_diff(before: u64, after: u64) -> bool {
    if is_wlocked(before) || is_wlocked(after) {
        return true;
    }
    counter(before) != counter(after)
}

/// The atomic word prefixing every live object: version counter + lock
/// bits. Lives in the owning worker's heap, shared between the apply step
/// and any reader.
#[derive(Debug)]
pub struct VersionWord(AtomicU64);

impl VersionWord {
    /// A freshly allocated object: version 0, unlocked (spec §3: "a freshly
    /// allocated object has version == 0").
    pub fn new() -> VersionWord {
        VersionWord(AtomicU64::new(0))
    }

    pub fn from_raw(v: u64) -> VersionWord {
        VersionWord(AtomicU64::new(v))
    }

    pub fn load(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn version(&self) -> u64 {
        counter(self.load())
    }

    pub fn is_rlocked(&self) -> bool {
        is_rlocked(self.load())
    }

    pub fn is_wlocked(&self) -> bool {
        is_wlocked(self.0.load(Ordering::Acquire))
    }

    pub fn is_locked(&self) -> bool {
        is_locked(self.load())
    }

    /// Sets RLOCK iff the word is currently unlocked. Returns whether the
    /// CAS succeeded (spec §4.2).
    pub fn rlock(&self) -> bool {
        let ov = self.0.load(Ordering::Relaxed);
        if is_locked(ov) {
            return false;
        }
        let nv = ov | RLOCK_BIT;
        self.0.compare_exchange(ov, nv, Ordering::Relaxed, Ordering::Relaxed).is_ok()
    }

    /// Upgrades RLOCK to WLOCK, bumping the version counter (wrapping to 1,
    /// never 0, on overflow). Caller must already hold RLOCK with WLOCK
    /// clear; violating that is an internal invariant bug, not a user
    /// error, so it's a debug assertion rather than a `Result`.
    pub fn wlock(&self) -> bool {
        let ov = self.0.load(Ordering::Relaxed);
        debug_assert!(is_rlocked(ov) && !is_wlocked(ov));
        let mut nv = counter(ov) + 1;
        if nv > MAX_VERSION {
            nv = 1;
        }
        nv |= WLOCK_BIT;
        self.0.compare_exchange(ov, nv, Ordering::Relaxed, Ordering::Relaxed).is_ok()
    }

    /// Clears RLOCK. Relaxed: release ordering isn't required here because
    /// the payload hasn't changed (spec §4.2).
    pub fn runlock(&self) {
        self.0.fetch_and(!RLOCK_BIT, Ordering::Relaxed);
    }

    /// Clears WLOCK under release ordering, so any reader that observes the
    /// unlocked word also observes the payload write that preceded it
    /// (spec §4.2 / §4.4's "memory fence separates lock acquisition from
    /// payload write").
    pub fn wunlock(&self) {
        self.0.fetch_and(!WLOCK_BIT, Ordering::Release);
    }
}

impl Default for VersionWord {
    fn default() -> VersionWord {
        VersionWord::new()
    }
}
