//! The coordinator side of the three-phase commit protocol: PREPARE,
//! VALIDATE, then COMMIT or ABORT (spec §4.2–§4.4). Grounded on
//! `original_source/include/farm_txn.h`'s `Coordinator` role and its
//! `prepare()` / `validate()` / `commit()` / `abort()` drivers.
//!
//! The local (self) participant is served directly through [`LocalStore`];
//! remote participants are driven over a [`Transport`] and their replies
//! fed back in through [`CoordinatorTxn::on_reply`]. This lets a single
//! poll loop in the worker drive many in-flight coordinator transactions
//! without blocking on any one of them.

use std::collections::BTreeSet;

use farm_base::{GAddr, Status, WorkerId};
use farm_net::{Message, OpCode, Payload, Transport};

use crate::context::TxnContext;
use crate::object::{is_rlocked, is_version_diff};

/// The storage surface a [`CoordinatorTxn`] (or [`crate::participant::Participant`])
/// needs from whichever worker owns the addresses it's touching. Kept
/// separate from `farm_alloc`/the concrete heap so this crate stays
/// protocol-pure; `farm-worker` provides the real implementation.
pub trait LocalStore {
    fn rlock(&self, addr: GAddr) -> bool;
    fn wlock(&self, addr: GAddr) -> bool;
    fn runlock(&self, addr: GAddr);
    fn wunlock(&self, addr: GAddr);
    fn version(&self, addr: GAddr) -> u64;
    fn is_freed(&self, addr: GAddr) -> bool;
    /// Size of the backing block carved for `addr`, if any; `None` if
    /// `addr` isn't currently allocated. Used at PREPARE to reject a write
    /// whose payload no longer fits the object's original class (spec
    /// §4.4 Phase 1 step 3).
    fn block_size(&self, addr: GAddr) -> Option<u64>;
    /// Applies a buffered write, or frees the object if `size < 0`.
    fn apply_write(&self, addr: GAddr, size: i32, payload: &[u8]);
    fn read(&self, addr: GAddr) -> (u64, Vec<u8>);
    fn alloc(&self, size: u32) -> GAddr;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Preparing,
    Validating,
    Committing,
    Done,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    Committed,
    /// A participant rejected PREPARE (write-set address already locked,
    /// freed, or no longer large enough for the buffered payload).
    PrepareFailed,
    /// VALIDATE found a read-set address had a newer version, or held a
    /// concurrent RLOCK from another transaction.
    ValidateFailed,
}

/// Drives one transaction's commit across its participants. `self_wid` is
/// served synchronously via `local`; every other participant is sent a
/// message and its reply is applied through [`CoordinatorTxn::on_reply`].
pub struct CoordinatorTxn {
    pub id: u32,
    self_wid: WorkerId,
    ctx: TxnContext,
    phase: Phase,
    outcome: Option<Outcome>,
    awaiting: BTreeSet<WorkerId>,
}

impl CoordinatorTxn {
    pub fn new(id: u32, self_wid: WorkerId, ctx: TxnContext) -> CoordinatorTxn {
        CoordinatorTxn { id, self_wid, ctx, phase: Phase::Preparing, outcome: None, awaiting: BTreeSet::new() }
    }

    pub fn ctx(&self) -> &TxnContext {
        &self.ctx
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// True once every participant is self: no messages need to leave this
    /// worker at all (spec §4.6 short-form fast path).
    pub fn is_local_only(&self) -> bool {
        self.ctx.is_local_only(self.self_wid)
    }

    fn send_chunks<T: Transport>(
        &self,
        transport: &mut T,
        wid: WorkerId,
        chunks: Vec<(farm_net::Header, Payload)>,
    ) -> farm_base::Result<()> {
        for (header, payload) in chunks {
            transport.send(Message::new(self.self_wid, wid, header, payload))?;
        }
        Ok(())
    }

    /// Kicks off PREPARE: locks the local write-set directly (spec §4.4
    /// Phase 1 scopes to `participants = W`), and sends chunked PREPARE
    /// messages to every remote write-set owner.
    pub fn begin_prepare<T: Transport>(&mut self, local: &dyn LocalStore, transport: &mut T) -> farm_base::Result<()> {
        let participants = self.ctx.write_participants();
        for wid in &participants {
            if *wid == self.self_wid {
                if !self.rlock_local_write_set(local) {
                    self.outcome = Some(Outcome::PrepareFailed);
                    self.phase = Phase::Done;
                    return Ok(());
                }
                continue;
            }
            let chunks = self.ctx.generate_prepare_msgs(self.id, *wid);
            self.send_chunks(transport, *wid, chunks)?;
            self.awaiting.insert(*wid);
        }
        if self.awaiting.is_empty() && self.outcome.is_none() {
            self.advance_to_validate(local, transport)?;
        }
        Ok(())
    }

    /// RLOCKs every local write-set address, checking it's neither freed
    /// nor too small for its buffered payload (spec §4.4 Phase 1 steps
    /// 2-3), rolling back everything already locked on the first failure.
    fn rlock_local_write_set(&self, local: &dyn LocalStore) -> bool {
        let entries: Vec<(GAddr, i32)> = self
            .ctx
            .write_set
            .get(&self.self_wid)
            .into_iter()
            .flat_map(|m| m.iter())
            .filter(|(a, _)| !a.is_null())
            .map(|(&a, &slot)| (a, self.ctx.slot(slot).size))
            .collect();
        let mut locked = Vec::with_capacity(entries.len());
        for &(addr, size) in &entries {
            if !local.rlock(addr) {
                for done in &locked {
                    local.runlock(*done);
                }
                return false;
            }
            let fits = size < 0 || local.block_size(addr).is_some_and(|b| b >= size as u64);
            if local.is_freed(addr) || !fits {
                local.runlock(addr);
                for done in &locked {
                    local.runlock(*done);
                }
                return false;
            }
            locked.push(addr);
        }
        true
    }

    fn runlock_local_write_set(&self, local: &dyn LocalStore) {
        for addr in self.ctx.write_set.get(&self.self_wid).into_iter().flat_map(|m| m.keys()) {
            if !addr.is_null() {
                local.runlock(*addr);
            }
        }
    }

    /// Feeds back a remote participant's reply to PREPARE or VALIDATE.
    pub fn on_reply<T: Transport>(
        &mut self,
        local: &dyn LocalStore,
        transport: &mut T,
        msg: &Message,
    ) -> farm_base::Result<()> {
        let from = msg.src;
        match (self.phase, msg.header.op) {
            (Phase::Preparing, OpCode::PrepareReply) => {
                self.awaiting.remove(&from);
                if msg.header.status != Status::Success {
                    self.outcome = Some(Outcome::PrepareFailed);
                }
                if self.awaiting.is_empty() {
                    if self.outcome.is_some() {
                        self.begin_abort(local, transport)?;
                    } else {
                        self.advance_to_validate(local, transport)?;
                    }
                }
            }
            (Phase::Validating, OpCode::ValidateReply) => {
                self.awaiting.remove(&from);
                if msg.header.status != Status::Success {
                    self.outcome = Some(Outcome::ValidateFailed);
                }
                if self.awaiting.is_empty() {
                    if self.outcome.is_some() {
                        self.begin_abort(local, transport)?;
                    } else {
                        self.begin_commit(local, transport)?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Advances to VALIDATE, scoped to `participants = R` (spec §4.4 Phase
    /// 2): a write-only participant never receives a VALIDATE message.
    fn advance_to_validate<T: Transport>(&mut self, local: &dyn LocalStore, transport: &mut T) -> farm_base::Result<()> {
        self.phase = Phase::Validating;
        let participants = self.ctx.read_participants();
        for wid in &participants {
            if *wid == self.self_wid {
                if self.validate_local(local).is_err() {
                    self.outcome = Some(Outcome::ValidateFailed);
                }
                continue;
            }
            let chunks = self.ctx.generate_validate_msgs(self.id, *wid);
            self.send_chunks(transport, *wid, chunks)?;
            self.awaiting.insert(*wid);
        }
        if self.awaiting.is_empty() {
            if self.outcome.is_some() {
                self.begin_abort(local, transport)?;
            } else {
                self.begin_commit(local, transport)?;
            }
        }
        Ok(())
    }

    /// Checks every locally-owned read-set address still matches its
    /// observed version, and that no such address is RLOCKed by a
    /// transaction other than this one's own write-set (spec §4.4 Phase 2).
    fn validate_local(&self, local: &dyn LocalStore) -> Result<(), ()> {
        let own_writes = self.ctx.write_set.get(&self.self_wid);
        for (addr, &slot) in self.ctx.read_set.get(&self.self_wid).into_iter().flatten() {
            let observed = self.ctx.slot(slot).version;
            let current = local.version(*addr);
            let rlocked_elsewhere = is_rlocked(current) && !own_writes.is_some_and(|m| m.contains_key(addr));
            if is_version_diff(observed, current) || rlocked_elsewhere {
                return Err(());
            }
        }
        Ok(())
    }

    /// Drives COMMIT, scoped to `participants = W` (spec §4.4).
    fn begin_commit<T: Transport>(&mut self, local: &dyn LocalStore, transport: &mut T) -> farm_base::Result<()> {
        self.phase = Phase::Committing;
        let participants = self.ctx.write_participants();
        for wid in &participants {
            if *wid == self.self_wid {
                self.apply_local(local);
                continue;
            }
            let (header, payload) = self.ctx.generate_commit_msg(self.id);
            transport.send(Message::new(self.self_wid, *wid, header, payload))?;
        }
        self.outcome = Some(Outcome::Committed);
        self.phase = Phase::Done;
        Ok(())
    }

    fn apply_local(&self, local: &dyn LocalStore) {
        for (addr, &slot) in self.ctx.write_set.get(&self.self_wid).into_iter().flatten() {
            if addr.is_null() {
                continue;
            }
            let obj = self.ctx.slot(slot);
            local.wlock(*addr);
            local.apply_write(*addr, obj.size, &obj.payload);
            local.wunlock(*addr);
        }
    }

    /// Drives ABORT, scoped to `participants = W` (spec §4.4, §4.6: a
    /// pure-reader participant never sees ABORT).
    fn begin_abort<T: Transport>(&mut self, local: &dyn LocalStore, transport: &mut T) -> farm_base::Result<()> {
        self.runlock_local_write_set(local);
        let participants = self.ctx.write_participants();
        for wid in &participants {
            if *wid != self.self_wid {
                let (header, payload) = self.ctx.generate_abort_msg(self.id);
                transport.send(Message::new(self.self_wid, *wid, header, payload))?;
            }
        }
        self.phase = Phase::Done;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use farm_net::InProcessNetwork;
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

    #[test]
    fn local_only_commit_completes_without_sending_messages() {
        let net = InProcessNetwork::new();
        let mut transport = net.transport_for(1);
        let local = FakeStore::default();

        let mut ctx = TxnContext::new();
        let addr = GAddr::new(1, 0);
        ctx.tx_read(addr, 0, vec![]);
        ctx.tx_write(addr, vec![9]);

        let mut txn = CoordinatorTxn::new(1, 1, ctx);
        assert!(txn.is_local_only());
        txn.begin_prepare(&local, &mut transport).unwrap();
        assert_eq!(txn.outcome(), Some(Outcome::Committed));
        assert!(txn.is_done());
        assert!(transport.poll_recv().is_none());
    }

    #[test]
    fn remote_participant_failing_prepare_aborts() {
        let net = InProcessNetwork::new();
        let mut transport = net.transport_for(1);
        let local = FakeStore::default();

        let mut ctx = TxnContext::new();
        ctx.tx_write(GAddr::new(2, 0), vec![1]);

        let mut txn = CoordinatorTxn::new(1, 1, ctx);
        txn.begin_prepare(&local, &mut transport).unwrap();
        assert!(!txn.is_done());

        let mut header = farm_net::Header::new(OpCode::PrepareReply);
        header.id = 1;
        header.status = Status::PrepareFailed;
        let reply = Message::new(2, 1, header, Payload::Empty);
        txn.on_reply(&local, &mut transport, &reply).unwrap();

        assert_eq!(txn.outcome(), Some(Outcome::PrepareFailed));
        assert!(txn.is_done());
        let abort = transport.poll_recv().unwrap();
        assert_eq!(abort.header.op, OpCode::Abort);
    }

    #[test]
    fn write_only_participant_never_receives_validate() {
        let net = InProcessNetwork::new();
        let mut transport = net.transport_for(1);
        let local = FakeStore::default();

        // Worker 2 is written to but never read: it's a write-only
        // participant and must be scoped out of VALIDATE.
        let mut ctx = TxnContext::new();
        ctx.tx_write(GAddr::new(2, 0), vec![1]);

        let mut txn = CoordinatorTxn::new(1, 1, ctx);
        txn.begin_prepare(&local, &mut transport).unwrap();
        let mut header = farm_net::Header::new(OpCode::PrepareReply);
        header.id = 1;
        header.status = Status::Success;
        let reply = Message::new(2, 1, header, Payload::Empty);
        txn.on_reply(&local, &mut transport, &reply).unwrap();

        // No VALIDATE should have gone to worker 2; COMMIT should follow.
        let next = transport.poll_recv().unwrap();
        assert_eq!(next.header.op, OpCode::Commit);
        assert_eq!(txn.outcome(), Some(Outcome::Committed));
    }
}
