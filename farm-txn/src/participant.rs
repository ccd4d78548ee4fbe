//! The participant side of the commit protocol: the state machine a
//! non-coordinator worker runs for each transaction that touches one of
//! its addresses (spec §4.2–§4.4, §9 design note on participant
//! lifecycle).
//!
//! Grounded on `original_source/include/farm_txn.h`'s per-transaction
//! participant record, keyed the same way here: `(coordinator_wid,
//! seq_id)`.

use farm_base::{GAddr, Status, WorkerId};
use farm_net::WireObject;

use crate::coordinator::LocalStore;
use crate::object::{is_rlocked, is_version_diff};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Idle,
    Preparing,
    Prepared,
    Validated,
    Rejected,
    Committed,
    Aborted,
    /// Rejected its own PREPARE locally and already released its locks;
    /// distinct from `Aborted` so a stray ABORT arriving afterward is
    /// recognized as a no-op rather than a protocol violation (spec §9).
    AbortedBySelf,
}

/// Globally unique transaction identity as seen from a participant: which
/// coordinator opened it, and that coordinator's sequence number.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TxnKey {
    pub coordinator_wid: WorkerId,
    pub seq_id: u32,
}

/// One transaction's state as tracked by a participant worker. Dropped
/// entirely once an ACKNOWLEDGE is received for it (spec §4.4).
pub struct Participant {
    pub key: TxnKey,
    pub state: State,
    write_set: Vec<WireObject>,
    /// Addresses RLOCKed so far across however many PREPARE chunks have
    /// arrived; rolled back in full on any later chunk's failure.
    locked: Vec<GAddr>,
    /// `(addr, version)` pairs accumulated across VALIDATE chunks while
    /// waiting for the total named by the first chunk's `total` count.
    validated_pairs: Vec<(GAddr, u64)>,
}

impl Participant {
    pub fn new(key: TxnKey) -> Participant {
        Participant { key, state: State::Idle, write_set: Vec::new(), locked: Vec::new(), validated_pairs: Vec::new() }
    }

    /// Addresses this participant holds (or held) a write-set entry for,
    /// for the caller to use when replaying anything it deferred behind
    /// them.
    pub fn write_addrs(&self) -> impl Iterator<Item = GAddr> + '_ {
        self.write_set.iter().map(|o| o.addr).filter(|a| !a.is_null())
    }

    fn rollback_prepare(&mut self, local: &dyn LocalStore) {
        for addr in self.locked.drain(..) {
            local.runlock(addr);
        }
        self.write_set.clear();
    }

    /// Handles one inbound PREPARE chunk: attempts to RLOCK every address
    /// in `objects`, verifying neither it's been freed nor its backing
    /// block is too small for the payload (spec §4.4 Phase 1 steps 2-3),
    /// rolling back everything locked so far (across this and prior
    /// chunks) on the first failure. `total` is the full object count
    /// across all chunks for this transaction (spec §6's PREPARE chunking
    /// note); once `total` objects have been accumulated, the final
    /// status is returned — otherwise `None`, meaning "still waiting for
    /// more chunks."
    ///
    /// A participant that has already replied PREPARE_FAILED for this key
    /// must not re-enter PREPARING (spec §9: "MUST NOT accept PREPARE
    /// after replying PREPARE_FAILED").
    pub fn on_prepare(&mut self, local: &dyn LocalStore, objects: Vec<WireObject>, total: usize) -> Option<Status> {
        if self.state == State::Rejected || self.state == State::AbortedBySelf {
            return Some(Status::PrepareFailed);
        }
        self.state = State::Preparing;
        for obj in &objects {
            if obj.addr.is_null() {
                self.write_set.push(obj.clone());
                continue;
            }
            if !local.rlock(obj.addr) {
                self.rollback_prepare(local);
                self.state = State::Rejected;
                return Some(Status::PrepareFailed);
            }
            let fits = obj.size < 0 || local.block_size(obj.addr).is_some_and(|b| b >= obj.size as u64);
            if local.is_freed(obj.addr) || !fits {
                local.runlock(obj.addr);
                self.rollback_prepare(local);
                self.state = State::Rejected;
                return Some(Status::PrepareFailed);
            }
            self.locked.push(obj.addr);
            self.write_set.push(obj.clone());
        }
        if self.write_set.len() < total {
            return None;
        }
        self.state = State::Prepared;
        Some(Status::Success)
    }

    /// Handles one inbound VALIDATE chunk: checks that every `(addr,
    /// version)` pair still matches the current local version, and that no
    /// address outside this participant's own write-set is concurrently
    /// RLOCKed by another transaction (spec §4.4 Phase 2: a read-set
    /// address held by someone else's in-flight write is a conflict even
    /// when its counter hasn't moved yet). `total` works the same as in
    /// [`Participant::on_prepare`].
    pub fn on_validate(&mut self, local: &dyn LocalStore, versions: &[(GAddr, u64)], total: usize) -> Option<Status> {
        if self.state != State::Prepared {
            return Some(Status::ValidateFailed);
        }
        for &(addr, observed) in versions {
            let current = local.version(addr);
            let rlocked_elsewhere = is_rlocked(current) && !self.write_set.iter().any(|o| o.addr == addr);
            if is_version_diff(observed, current) || rlocked_elsewhere {
                self.state = State::Rejected;
                self.validated_pairs.clear();
                return Some(Status::ValidateFailed);
            }
            self.validated_pairs.push((addr, observed));
        }
        if self.validated_pairs.len() < total {
            return None;
        }
        self.state = State::Validated;
        Some(Status::Success)
    }

    /// Handles an inbound COMMIT: upgrades RLOCK to WLOCK, applies every
    /// buffered write, then releases WLOCK (spec §4.4).
    pub fn on_commit(&mut self, local: &dyn LocalStore) {
        for obj in &self.write_set {
            if obj.addr.is_null() {
                continue;
            }
            local.wlock(obj.addr);
            local.apply_write(obj.addr, obj.size, &obj.payload);
            local.wunlock(obj.addr);
        }
        self.state = State::Committed;
    }

    /// Handles an inbound ABORT: releases every RLOCK taken during
    /// PREPARE. A transaction that already aborted itself (PREPARE_FAILED)
    /// has nothing left to release; this is a no-op, not an error.
    pub fn on_abort(&mut self, local: &dyn LocalStore) {
        if self.state == State::AbortedBySelf {
            return;
        }
        for obj in &self.write_set {
            if !obj.addr.is_null() {
                local.runlock(obj.addr);
            }
        }
        self.state = State::Aborted;
    }

    /// True once this record's terminal state has been communicated back
    /// to the coordinator and an ACKNOWLEDGE received; the worker may
    /// forget it (spec §4.4: "dropped on ACKNOWLEDGE").
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, State::Committed | State::Aborted | State::AbortedBySelf)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeStore {
        versions: RefCell<HashMap<GAddr, u64>>,
        locked: RefCell<HashMap<GAddr, bool>>,
        freed: RefCell<HashMap<GAddr, bool>>,
    }

    impl LocalStore for FakeStore {
        fn rlock(&self, addr: GAddr) -> bool {
            let mut l = self.locked.borrow_mut();
            if *l.get(&addr).unwrap_or(&false) {
                return false;
            }
            l.insert(addr, true);
            true
        }
        fn wlock(&self, _addr: GAddr) -> bool {
            true
        }
        fn runlock(&self, addr: GAddr) {
            self.locked.borrow_mut().insert(addr, false);
        }
        fn wunlock(&self, _addr: GAddr) {}
        fn version(&self, addr: GAddr) -> u64 {
            *self.versions.borrow().get(&addr).unwrap_or(&0)
        }
        fn is_freed(&self, addr: GAddr) -> bool {
            *self.freed.borrow().get(&addr).unwrap_or(&false)
        }
        fn block_size(&self, _addr: GAddr) -> Option<u64> {
            Some(u64::MAX)
        }
        fn apply_write(&self, addr: GAddr, _size: i32, _payload: &[u8]) {
            *self.versions.borrow_mut().entry(addr).or_insert(0) += 1;
        }
        fn read(&self, addr: GAddr) -> (u64, Vec<u8>) {
            (self.version(addr), vec![])
        }
        fn alloc(&self, _size: u32) -> GAddr {
            GAddr::NULL
        }
    }

    fn key() -> TxnKey {
        TxnKey { coordinator_wid: 1, seq_id: 7 }
    }

    #[test]
    fn prepare_validate_commit_happy_path() {
        let local = FakeStore::default();
        let addr = GAddr::new(2, 0);
        let mut p = Participant::new(key());

        let objs = vec![WireObject { addr, size: 1, payload: vec![9] }];
        let status = p.on_prepare(&local, objs.clone(), objs.len());
        assert_eq!(status, Some(Status::Success));
        assert_eq!(p.state, State::Prepared);

        let pairs = [(addr, 0)];
        let status = p.on_validate(&local, &pairs, pairs.len());
        assert_eq!(status, Some(Status::Success));
        assert_eq!(p.state, State::Validated);

        p.on_commit(&local);
        assert_eq!(p.state, State::Committed);
        assert!(p.is_terminal());
        assert_eq!(local.version(addr), 1);
    }

    #[test]
    fn prepare_conflict_rejects_and_releases_partial_locks() {
        let local = FakeStore::default();
        let a = GAddr::new(2, 0);
        let b = GAddr::new(2, 8);
        local.rlock(b);

        let mut p = Participant::new(key());
        let objs = vec![
            WireObject { addr: a, size: 1, payload: vec![1] },
            WireObject { addr: b, size: 1, payload: vec![2] },
        ];
        let status = p.on_prepare(&local, objs.clone(), objs.len());
        assert_eq!(status, Some(Status::PrepareFailed));
        assert_eq!(p.state, State::Rejected);
        // `a` was locked then rolled back by the partial-failure path.
        assert!(!*local.locked.borrow().get(&a).unwrap());
    }

    #[test]
    fn prepare_rejects_freed_address() {
        let local = FakeStore::default();
        let addr = GAddr::new(2, 0);
        local.freed.borrow_mut().insert(addr, true);

        let mut p = Participant::new(key());
        let objs = vec![WireObject { addr, size: 1, payload: vec![1] }];
        let status = p.on_prepare(&local, objs.clone(), objs.len());
        assert_eq!(status, Some(Status::PrepareFailed));
        assert!(!*local.locked.borrow().get(&addr).unwrap());
    }

    #[test]
    fn prepare_accumulates_across_chunks_before_replying() {
        let local = FakeStore::default();
        let a = GAddr::new(2, 0);
        let b = GAddr::new(2, 8);
        let mut p = Participant::new(key());

        let first = p.on_prepare(&local, vec![WireObject { addr: a, size: 1, payload: vec![1] }], 2);
        assert_eq!(first, None, "should wait for the second chunk before deciding");
        assert_eq!(p.state, State::Preparing);

        let second = p.on_prepare(&local, vec![WireObject { addr: b, size: 1, payload: vec![2] }], 2);
        assert_eq!(second, Some(Status::Success));
        assert_eq!(p.state, State::Prepared);
    }

    #[test]
    fn validate_detects_stale_version() {
        let local = FakeStore::default();
        let addr = GAddr::new(2, 0);
        local.versions.borrow_mut().insert(addr, 5);

        let mut p = Participant::new(key());
        let objs = vec![WireObject { addr, size: 1, payload: vec![1] }];
        p.on_prepare(&local, objs.clone(), objs.len());
        let pairs = [(addr, 3)];
        let status = p.on_validate(&local, &pairs, pairs.len());
        assert_eq!(status, Some(Status::ValidateFailed));
        assert_eq!(p.state, State::Rejected);
    }

    #[test]
    fn rejected_participant_does_not_reaccept_prepare() {
        let local = FakeStore::default();
        let addr = GAddr::new(2, 0);
        local.rlock(addr);

        let mut p = Participant::new(key());
        let objs = vec![WireObject { addr, size: 1, payload: vec![1] }];
        p.on_prepare(&local, objs.clone(), objs.len());
        assert_eq!(p.state, State::Rejected);

        let status = p.on_prepare(&local, vec![], 0);
        assert_eq!(status, Some(Status::PrepareFailed));
    }

    #[test]
    fn abort_releases_locks_from_prepare() {
        let local = FakeStore::default();
        let addr = GAddr::new(2, 0);
        let mut p = Participant::new(key());
        let objs = vec![WireObject { addr, size: 1, payload: vec![1] }];
        p.on_prepare(&local, objs.clone(), objs.len());
        p.on_abort(&local);
        assert_eq!(p.state, State::Aborted);
        assert!(!*local.locked.borrow().get(&addr).unwrap());
    }
}
