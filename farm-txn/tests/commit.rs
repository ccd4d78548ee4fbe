//! End-to-end commit protocol scenarios driven over the in-process
//! transport, exercising a coordinator and one or more separate participant
//! workers: a clean two-worker commit, a write-write conflict where exactly
//! one of two contending transactions commits, and a remote VALIDATE
//! failure that aborts both sides.

use std::cell::RefCell;
use std::collections::HashMap;

use farm_base::{GAddr, Status};
use farm_net::{InProcessNetwork, Message, OpCode, Payload, Transport};
use farm_txn::{CoordinatorTxn, LocalStore, Outcome, Participant, TxnContext, TxnKey};

#[derive(Default)]
struct FakeStore {
    versions: RefCell<HashMap<GAddr, u64>>,
    locked: RefCell<HashMap<GAddr, bool>>,
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
    fn is_freed(&self, _addr: GAddr) -> bool {
        false
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

/// Runs a remote participant's side of the exchange in response to whatever
/// the coordinator just sent it, feeding the reply straight back. None of
/// these scenarios exceed one chunk, so `on_prepare`/`on_validate` always
/// resolve on the first call.
fn serve_one(participant: &mut Participant, local: &dyn LocalStore, transport: &mut impl Transport, msg: Message) -> Option<Message> {
    match msg.header.op {
        OpCode::Prepare => {
            let objects = match msg.payload {
                Payload::Objects(objs) => objs,
                _ => vec![],
            };
            let total = msg.header.size as usize;
            let status = participant.on_prepare(local, objects, total).expect("single-chunk PREPARE resolves immediately");
            let mut header = farm_net::Header::new(OpCode::PrepareReply);
            header.id = msg.header.id;
            header.status = status;
            let reply = Message::new(msg.dst, msg.src, header, Payload::Empty);
            transport.send(reply.clone()).unwrap();
            Some(reply)
        }
        OpCode::Validate => {
            let versions = match msg.payload {
                Payload::Versions(v) => v,
                _ => vec![],
            };
            let total = msg.header.size as usize;
            let status = participant.on_validate(local, &versions, total).expect("single-chunk VALIDATE resolves immediately");
            let mut header = farm_net::Header::new(OpCode::ValidateReply);
            header.id = msg.header.id;
            header.status = status;
            let reply = Message::new(msg.dst, msg.src, header, Payload::Empty);
            transport.send(reply.clone()).unwrap();
            Some(reply)
        }
        OpCode::Commit => {
            participant.on_commit(local);
            None
        }
        OpCode::Abort => {
            participant.on_abort(local);
            None
        }
        _ => None,
    }
}

#[test]
fn two_worker_transaction_commits_across_both() {
    let net = InProcessNetwork::new();
    let mut coord_transport = net.transport_for(1);
    let mut peer_transport = net.transport_for(2);

    let coord_store = FakeStore::default();
    let peer_store = FakeStore::default();

    let addr_local = GAddr::new(1, 0);
    let addr_remote = GAddr::new(2, 0);

    let mut ctx = TxnContext::new();
    ctx.tx_read(addr_local, 0, vec![]);
    ctx.tx_write(addr_local, vec![1]);
    ctx.tx_read(addr_remote, 0, vec![]);
    ctx.tx_write(addr_remote, vec![2]);

    let mut coord = CoordinatorTxn::new(1, 1, ctx);
    let mut peer = Participant::new(TxnKey { coordinator_wid: 1, seq_id: 1 });

    coord.begin_prepare(&coord_store, &mut coord_transport).unwrap();
    assert!(!coord.is_done());

    // Deliver PREPARE to the peer, have it reply.
    let prepare = peer_transport.poll_recv().unwrap();
    assert_eq!(prepare.header.op, OpCode::Prepare);
    serve_one(&mut peer, &peer_store, &mut peer_transport, prepare);
    let reply = coord_transport.poll_recv().unwrap();
    coord.on_reply(&coord_store, &mut coord_transport, &reply).unwrap();

    // Coordinator has moved to VALIDATE; deliver that too.
    let validate = peer_transport.poll_recv().unwrap();
    assert_eq!(validate.header.op, OpCode::Validate);
    serve_one(&mut peer, &peer_store, &mut peer_transport, validate);
    let reply = coord_transport.poll_recv().unwrap();
    coord.on_reply(&coord_store, &mut coord_transport, &reply).unwrap();

    assert_eq!(coord.outcome(), Some(Outcome::Committed));
    assert!(coord.is_done());

    // Coordinator applied its own write locally...
    assert_eq!(coord_store.version(addr_local), 1);

    // ...and sent COMMIT to the peer.
    let commit = peer_transport.poll_recv().unwrap();
    assert_eq!(commit.header.op, OpCode::Commit);
    serve_one(&mut peer, &peer_store, &mut peer_transport, commit);
    assert_eq!(peer_store.version(addr_remote), 1);
}

#[test]
fn write_write_conflict_exactly_one_commits() {
    let net = InProcessNetwork::new();
    let mut coord_a_transport = net.transport_for(10);
    let mut coord_b_transport = net.transport_for(20);
    let mut peer_transport = net.transport_for(3);

    let coord_a_store = FakeStore::default();
    let coord_b_store = FakeStore::default();
    // Both transactions contend for the same address on the same worker,
    // so only whichever PREPARE lands first can RLOCK it.
    let peer_store = FakeStore::default();
    let addr_remote = GAddr::new(3, 0);

    let mut ctx_a = TxnContext::new();
    ctx_a.tx_write(addr_remote, vec![1]);
    let mut ctx_b = TxnContext::new();
    ctx_b.tx_write(addr_remote, vec![2]);

    let mut coord_a = CoordinatorTxn::new(1, 10, ctx_a);
    let mut coord_b = CoordinatorTxn::new(1, 20, ctx_b);
    let mut peer_a = Participant::new(TxnKey { coordinator_wid: 10, seq_id: 1 });
    let mut peer_b = Participant::new(TxnKey { coordinator_wid: 20, seq_id: 1 });

    coord_a.begin_prepare(&coord_a_store, &mut coord_a_transport).unwrap();
    coord_b.begin_prepare(&coord_b_store, &mut coord_b_transport).unwrap();

    // A's PREPARE lands first and locks the shared address.
    let prepare_a = peer_transport.poll_recv().unwrap();
    serve_one(&mut peer_a, &peer_store, &mut peer_transport, prepare_a);
    let reply_a = coord_a_transport.poll_recv().unwrap();
    assert_eq!(reply_a.header.status, Status::Success);
    coord_a.on_reply(&coord_a_store, &mut coord_a_transport, &reply_a).unwrap();

    // B's PREPARE lands second against the now-locked address and fails.
    let prepare_b = peer_transport.poll_recv().unwrap();
    serve_one(&mut peer_b, &peer_store, &mut peer_transport, prepare_b);
    let reply_b = coord_b_transport.poll_recv().unwrap();
    assert_eq!(reply_b.header.status, Status::PrepareFailed);
    coord_b.on_reply(&coord_b_store, &mut coord_b_transport, &reply_b).unwrap();

    assert_eq!(coord_b.outcome(), Some(Outcome::PrepareFailed));
    assert!(coord_b.is_done());

    // A has no read-set and moves straight to COMMIT.
    assert_eq!(coord_a.outcome(), Some(Outcome::Committed));
    assert!(coord_a.is_done());

    let commit_a = peer_transport.poll_recv().unwrap();
    assert_eq!(commit_a.header.op, OpCode::Commit);
    serve_one(&mut peer_a, &peer_store, &mut peer_transport, commit_a);
    assert_eq!(peer_store.version(addr_remote), 1);

    let abort_b = peer_transport.poll_recv().unwrap();
    assert_eq!(abort_b.header.op, OpCode::Abort);
    serve_one(&mut peer_b, &peer_store, &mut peer_transport, abort_b);
    assert_eq!(peer_b.state, farm_txn::State::Aborted);
}

#[test]
fn remote_validate_failure_aborts_both_sides() {
    let net = InProcessNetwork::new();
    let mut coord_transport = net.transport_for(1);
    let mut peer_transport = net.transport_for(2);

    let coord_store = FakeStore::default();
    let peer_store = FakeStore::default();
    let addr_remote = GAddr::new(2, 0);
    // Someone else bumps the version between read and validate.
    peer_store.versions.borrow_mut().insert(addr_remote, 9);

    let mut ctx = TxnContext::new();
    ctx.tx_read(addr_remote, 0, vec![]);
    ctx.tx_write(addr_remote, vec![2]);

    let mut coord = CoordinatorTxn::new(1, 1, ctx);
    let mut peer = Participant::new(TxnKey { coordinator_wid: 1, seq_id: 2 });

    coord.begin_prepare(&coord_store, &mut coord_transport).unwrap();
    let prepare = peer_transport.poll_recv().unwrap();
    serve_one(&mut peer, &peer_store, &mut peer_transport, prepare);
    let reply = coord_transport.poll_recv().unwrap();
    coord.on_reply(&coord_store, &mut coord_transport, &reply).unwrap();

    let validate = peer_transport.poll_recv().unwrap();
    serve_one(&mut peer, &peer_store, &mut peer_transport, validate);
    let reply = coord_transport.poll_recv().unwrap();
    assert_eq!(reply.header.status, Status::ValidateFailed);
    coord.on_reply(&coord_store, &mut coord_transport, &reply).unwrap();

    assert_eq!(coord.outcome(), Some(Outcome::ValidateFailed));
    let abort = peer_transport.poll_recv().unwrap();
    assert_eq!(abort.header.op, OpCode::Abort);
    serve_one(&mut peer, &peer_store, &mut peer_transport, abort);
    assert_eq!(peer.state, farm_txn::State::Aborted);
}
