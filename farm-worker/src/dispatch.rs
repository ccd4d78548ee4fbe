//! The service task: a worker's single dispatch point for both inbound
//! network messages and locally-issued requests. Grounded on
//! `original_source/include/worker.h`'s `Worker` class and `src/worker.cc`'s
//! request-processing loop, realized here as a synchronous `dispatch` call
//! per inbound message rather than a dedicated OS thread plus lockfree
//! queue — the concurrency model the original needed for its C++ I/O
//! multiplexer isn't needed once the transport is a polled trait object.

use std::collections::HashMap;

use tracing::{debug, warn};

use farm_base::{Config, GAddr, Status, WorkerId};
use farm_net::{Flags, Header, Message, OpCode, Payload, Transport, WireObject};
use farm_txn::{CoordinatorTxn, DeferredReadQueue, LocalStore, Outcome, Participant, TxnContext, TxnKey};

use crate::heap::Heap;
use crate::kv::KvStore;
use crate::stats::{format_stats, GhostCounter, StatsBroadcaster};

/// A locally-issued request waiting on an address currently held in
/// another transaction's write-set (spec §4.5).
struct PendingLocalRead {
    addr: GAddr,
    reply_to: WorkerId,
    req_id: u32,
}

pub struct Worker {
    pub self_wid: WorkerId,
    pub heap: Heap,
    kv: KvStore,
    ghost: GhostCounter,
    broadcaster: Option<StatsBroadcaster>,
    participants: HashMap<TxnKey, Participant>,
    coordinators: HashMap<u32, CoordinatorTxn>,
    deferred: DeferredReadQueue<PendingLocalRead>,
    next_seq: u32,
    /// Resolved `FarmMalloc` replies awaiting `take_alloc_reply`, keyed by
    /// the request id handed back from `request_alloc`.
    alloc_replies: HashMap<u32, GAddr>,
    /// Resolved `FarmRead` replies awaiting `take_read_reply`. `None` means
    /// the remote address was freed (spec §4.3: FARM_READ against a freed
    /// address fails).
    read_replies: HashMap<u32, Option<(u64, Vec<u8>)>>,
}

impl Worker {
    pub fn new(config: &Config, self_wid: WorkerId) -> Worker {
        Worker {
            self_wid,
            heap: Heap::new(self_wid, config.size, config.factor),
            kv: KvStore::new(),
            ghost: GhostCounter::new(config.ghost_th),
            broadcaster: if config.is_master { Some(StatsBroadcaster::new(config.unsynced_th)) } else { None },
            participants: HashMap::new(),
            coordinators: HashMap::new(),
            deferred: DeferredReadQueue::new(),
            next_seq: 1,
            alloc_replies: HashMap::new(),
            read_replies: HashMap::new(),
        }
    }

    fn reply(&self, transport: &mut impl Transport, to: WorkerId, header: Header, payload: Payload) {
        if let Err(e) = transport.send(Message::new(self.self_wid, to, header, payload)) {
            warn!(error = ?e, "failed to send reply");
        }
    }

    fn next_req_id(&mut self) -> u32 {
        let id = self.next_seq;
        self.next_seq += 1;
        id
    }

    /// Starts a new coordinator-driven transaction for a local caller's
    /// read-set/write-set and drives PREPARE immediately.
    pub fn tx_commit(&mut self, ctx: TxnContext, transport: &mut impl Transport) -> u32 {
        let id = self.next_req_id();
        let mut txn = CoordinatorTxn::new(id, self.self_wid, ctx);
        let _ = txn.begin_prepare(&self.heap, transport);
        let done = txn.is_done();
        if done {
            let self_wid = self.self_wid;
            let local_writes: Vec<GAddr> = txn
                .ctx()
                .write_set
                .get(&self_wid)
                .into_iter()
                .flat_map(|m| m.keys())
                .copied()
                .filter(|a| !a.is_null())
                .collect();
            for addr in local_writes {
                self.drain_deferred_reads(transport, addr);
            }
        }
        self.coordinators.insert(id, txn);
        if done {
            self.reap_coordinator(id);
        }
        id
    }

    pub fn commit_outcome(&self, id: u32) -> Option<Outcome> {
        self.coordinators.get(&id).and_then(|t| t.outcome())
    }

    fn reap_coordinator(&mut self, id: u32) {
        if self.coordinators.get(&id).is_some_and(|t| t.is_done()) {
            self.coordinators.remove(&id);
        }
    }

    /// Requests an allocation of `size` bytes from `owner`, returning a
    /// request id to pass to [`Worker::take_alloc_reply`] once it resolves
    /// (spec §4.3's remote `txAlloc` path). A local `owner` resolves
    /// synchronously.
    pub fn request_alloc(&mut self, transport: &mut impl Transport, owner: WorkerId, size: u32) -> u32 {
        let req_id = self.next_req_id();
        if owner == self.self_wid {
            self.alloc_replies.insert(req_id, self.heap.alloc(size));
            return req_id;
        }
        let mut header = Header::new(OpCode::FarmMalloc);
        header.id = req_id;
        if let Err(e) = transport.send(Message::new(self.self_wid, owner, header, Payload::MallocReq { size, flags: Flags::none() })) {
            warn!(error = ?e, "failed to send FarmMalloc");
            self.alloc_replies.insert(req_id, GAddr::NULL);
        }
        req_id
    }

    /// Takes the resolved address for a prior `request_alloc`, if its
    /// reply (local or remote) has arrived.
    pub fn take_alloc_reply(&mut self, req_id: u32) -> Option<GAddr> {
        self.alloc_replies.remove(&req_id)
    }

    /// Requests a read of `addr` from `owner`, returning a request id to
    /// pass to [`Worker::take_read_reply`] once it resolves (spec §4.3's
    /// remote read path). A local `owner` resolves synchronously, deferring
    /// behind an in-flight PREPARE the same way a remote `FarmRead` does.
    pub fn request_read(&mut self, transport: &mut impl Transport, owner: WorkerId, addr: GAddr) -> u32 {
        let req_id = self.next_req_id();
        if owner == self.self_wid {
            if self.heap.is_freed(addr) {
                self.read_replies.insert(req_id, None);
            } else if self.heap.is_locked(addr) {
                self.deferred.defer(addr, PendingLocalRead { addr, reply_to: self.self_wid, req_id });
            } else {
                let (version, payload) = self.heap.read(addr);
                self.read_replies.insert(req_id, Some((version, payload)));
            }
            return req_id;
        }
        let mut header = Header::new(OpCode::FarmRead);
        header.id = req_id;
        header.addr = addr;
        if let Err(e) = transport.send(Message::new(self.self_wid, owner, header, Payload::Empty)) {
            warn!(error = ?e, "failed to send FarmRead");
            self.read_replies.insert(req_id, None);
        }
        req_id
    }

    /// Takes the resolved `(version, payload)` for a prior `request_read`,
    /// if its reply has arrived. The outer `Option` is "has it arrived
    /// yet"; the inner `Option` is "did the read succeed" (`None` means the
    /// address was freed).
    pub fn take_read_reply(&mut self, req_id: u32) -> Option<Option<(u64, Vec<u8>)>> {
        self.read_replies.remove(&req_id)
    }

    /// Processes one inbound message, replying over `transport` as needed.
    pub fn dispatch(&mut self, transport: &mut impl Transport, msg: Message) {
        match msg.header.op {
            OpCode::FarmMalloc => self.on_malloc(transport, msg),
            OpCode::FarmMallocReply => self.on_malloc_reply(msg),
            OpCode::FarmRead => self.on_read(transport, msg),
            OpCode::FarmReadReply => self.on_read_reply(msg),
            OpCode::Put => self.on_put(transport, msg),
            OpCode::Get => self.on_get(transport, msg),
            OpCode::UpdateMemStats => self.on_update_mem_stats(transport, msg),
            OpCode::BroadcastMemStats => {
                debug!(from = msg.src, "received membership stats broadcast");
            }
            OpCode::FetchMemStats => self.on_fetch_mem_stats(transport, msg),
            OpCode::Prepare => self.on_prepare(transport, msg),
            OpCode::PrepareReply | OpCode::ValidateReply => self.on_coordinator_reply(transport, msg),
            OpCode::Validate => self.on_validate(transport, msg),
            OpCode::Commit => self.on_commit(transport, msg),
            OpCode::Abort => self.on_abort(transport, msg),
            OpCode::Acknowledge => {
                self.reap_coordinator(msg.header.id);
            }
            _ => warn!(op = ?msg.header.op, "unexpected op code at dispatch"),
        }
    }

    fn on_malloc(&mut self, transport: &mut impl Transport, msg: Message) {
        let size = match msg.payload {
            Payload::MallocReq { size, .. } => size,
            _ => 0,
        };
        let addr = self.heap.alloc(size);
        self.ghost.record_alloc(size as u64);
        let mut header = Header::new(OpCode::FarmMallocReply);
        header.id = msg.header.id;
        header.status = if addr.is_null() { Status::AllocError } else { Status::Success };
        header.addr = addr;
        self.reply(transport, msg.src, header, Payload::Empty);
    }

    fn on_malloc_reply(&mut self, msg: Message) {
        let addr = if msg.header.status == Status::Success { msg.header.addr } else { GAddr::NULL };
        self.alloc_replies.insert(msg.header.id, addr);
    }

    fn on_read(&mut self, transport: &mut impl Transport, msg: Message) {
        let addr = msg.header.addr;
        if self.heap.is_freed(addr) {
            let mut header = Header::new(OpCode::FarmReadReply);
            header.id = msg.header.id;
            header.status = Status::ReadError;
            self.reply(transport, msg.src, header, Payload::Empty);
            return;
        }
        // An address mid-PREPARE in some other transaction's write-set
        // can't be read yet without risking a dirty read; park the request
        // and replay it once that transaction finalizes (spec §4.5).
        if self.heap.is_locked(addr) {
            self.deferred.defer(addr, PendingLocalRead { addr, reply_to: msg.src, req_id: msg.header.id });
            return;
        }
        self.serve_read(transport, msg.src, msg.header.id, addr);
    }

    fn on_read_reply(&mut self, msg: Message) {
        let result = match msg.payload {
            Payload::ReadReply { version, payload, .. } if msg.header.status == Status::Success => {
                Some((version, payload))
            }
            _ => None,
        };
        self.read_replies.insert(msg.header.id, result);
    }

    /// Serves a read locally-or-to-a-remote-requester. `to == self_wid`
    /// (only reachable from [`Worker::request_read`]'s local fast path)
    /// resolves straight into `read_replies` instead of round-tripping a
    /// wire message to itself.
    fn serve_read(&mut self, transport: &mut impl Transport, to: WorkerId, req_id: u32, addr: GAddr) {
        let (version, payload) = self.heap.read(addr);
        if to == self.self_wid {
            self.read_replies.insert(req_id, Some((version, payload)));
            return;
        }
        let mut header = Header::new(OpCode::FarmReadReply);
        header.id = req_id;
        header.addr = addr;
        self.reply(transport, to, header, Payload::ReadReply { version, size: payload.len() as i32, payload });
    }

    /// Replays every read parked behind `addr`, in the order they arrived,
    /// now that the transaction holding it has finalized.
    fn drain_deferred_reads(&mut self, transport: &mut impl Transport, addr: GAddr) {
        for waiter in self.deferred.drain(addr) {
            self.serve_read(transport, waiter.reply_to, waiter.req_id, waiter.addr);
        }
    }

    fn on_put(&mut self, transport: &mut impl Transport, msg: Message) {
        if let Payload::KeyValue { key, value } = msg.payload {
            self.kv.put(key, value);
        }
        let mut header = Header::new(OpCode::PutReply);
        header.id = msg.header.id;
        self.reply(transport, msg.src, header, Payload::Empty);
    }

    fn on_get(&mut self, transport: &mut impl Transport, msg: Message) {
        let key = match msg.payload {
            Payload::Key(k) => k,
            _ => 0,
        };
        let mut header = Header::new(OpCode::GetReply);
        header.id = msg.header.id;
        match self.kv.get(key) {
            Some(v) => self.reply(transport, msg.src, header, Payload::Value(v.to_vec())),
            None => {
                header.status = Status::NotExist;
                self.reply(transport, msg.src, header, Payload::Empty);
            }
        }
    }

    fn on_update_mem_stats(&mut self, transport: &mut impl Transport, msg: Message) {
        let Some(broadcaster) = &mut self.broadcaster else {
            return;
        };
        if let Payload::MemStat { total, free } = msg.payload {
            if let Some(table) = broadcaster.record_push(msg.src, total, free) {
                debug!(table = %format_stats(&table), "broadcasting membership stats");
                for &(wid, _, _) in &table {
                    let mut header = Header::new(OpCode::BroadcastMemStats);
                    header.nobj = table.len() as u32;
                    self.reply(transport, wid, header, Payload::MemStatList(table.clone()));
                }
            }
        }
    }

    /// Answers a FETCH_MEM_STATS request with the last-known membership
    /// table (spec §4.7, §6). A worker with no broadcaster (non-master)
    /// has nothing to report and replies with an empty table.
    fn on_fetch_mem_stats(&mut self, transport: &mut impl Transport, msg: Message) {
        let table = self.broadcaster.as_ref().map(|b| b.snapshot()).unwrap_or_default();
        let mut header = Header::new(OpCode::FetchMemStatsReply);
        header.id = msg.header.id;
        header.nobj = table.len() as u32;
        self.reply(transport, msg.src, header, Payload::MemStatList(table));
    }

    fn on_prepare(&mut self, transport: &mut impl Transport, msg: Message) {
        let key = TxnKey { coordinator_wid: msg.src, seq_id: msg.header.id };
        let objects = match msg.payload {
            Payload::Objects(objs) => objs,
            _ => Vec::<WireObject>::new(),
        };
        let total = msg.header.size as usize;
        let participant = self.participants.entry(key).or_insert_with(|| Participant::new(key));
        let Some(status) = participant.on_prepare(&self.heap, objects, total) else {
            return;
        };
        let mut header = Header::new(OpCode::PrepareReply);
        header.id = msg.header.id;
        header.status = status;
        self.reply(transport, msg.src, header, Payload::Empty);
    }

    fn on_validate(&mut self, transport: &mut impl Transport, msg: Message) {
        let key = TxnKey { coordinator_wid: msg.src, seq_id: msg.header.id };
        let versions = match msg.payload {
            Payload::Versions(v) => v,
            _ => Vec::new(),
        };
        let total = msg.header.size as usize;
        let status = match self.participants.get_mut(&key) {
            Some(p) => p.on_validate(&self.heap, &versions, total),
            None => Some(Status::ValidateFailed),
        };
        let Some(status) = status else {
            return;
        };
        let mut header = Header::new(OpCode::ValidateReply);
        header.id = msg.header.id;
        header.status = status;
        self.reply(transport, msg.src, header, Payload::Empty);
    }

    fn on_commit(&mut self, transport: &mut impl Transport, msg: Message) {
        let key = TxnKey { coordinator_wid: msg.src, seq_id: msg.header.id };
        if let Some(mut p) = self.participants.remove(&key) {
            p.on_commit(&self.heap);
            let addrs: Vec<GAddr> = p.write_addrs().collect();
            for addr in addrs {
                self.drain_deferred_reads(transport, addr);
            }
        }
        let mut header = Header::new(OpCode::Acknowledge);
        header.id = msg.header.id;
        self.reply(transport, msg.src, header, Payload::Empty);
    }

    fn on_abort(&mut self, transport: &mut impl Transport, msg: Message) {
        let key = TxnKey { coordinator_wid: msg.src, seq_id: msg.header.id };
        if let Some(mut p) = self.participants.remove(&key) {
            p.on_abort(&self.heap);
            let addrs: Vec<GAddr> = p.write_addrs().collect();
            for addr in addrs {
                self.drain_deferred_reads(transport, addr);
            }
        }
        let mut header = Header::new(OpCode::Acknowledge);
        header.id = msg.header.id;
        self.reply(transport, msg.src, header, Payload::Empty);
    }

    fn on_coordinator_reply(&mut self, transport: &mut impl Transport, msg: Message) {
        let id = msg.header.id;
        let done = if let Some(txn) = self.coordinators.get_mut(&id) {
            let _ = txn.on_reply(&self.heap, transport, &msg);
            txn.is_done()
        } else {
            false
        };
        if done {
            self.reap_coordinator(id);
        }
    }
}
