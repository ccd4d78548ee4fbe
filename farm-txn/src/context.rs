//! Client-side transaction context: the read-set / write-set bookkeeping an
//! application builds up between `tx_begin` and `tx_commit`, plus the
//! message-generation helpers the coordinator uses to drive PREPARE /
//! VALIDATE / COMMIT / ABORT across participants.
//!
//! Grounded on `original_source/include/farm_txn.h`'s `TxnContext` /
//! `generatePrepareMsg` / `generateValidateMsg` family, reshaped per spec
//! §9's design note: one owning arena (`Vec<Object>`) indexed by
//! [`TxnSlotId`], rather than the original's `shared_ptr`-linked object
//! graph, so the read-set and write-set can reference the same slot without
//! reference cycles or runtime borrow checks.

use std::collections::BTreeMap;

use farm_base::{GAddr, WorkerId};
use farm_net::{Header, OpCode, Payload, WireObject, MAX_REQUEST_SIZE};

/// Index into a [`TxnContext`]'s arena. Stable for the lifetime of the
/// transaction; never reused.
pub type TxnSlotId = usize;

/// A transaction's local view of one object: the version last observed (for
/// read-set entries) or the payload to apply (for write-set entries).
#[derive(Clone, Debug)]
pub struct Object {
    pub addr: GAddr,
    /// Version observed at read time, or `0` for a not-yet-read write-only
    /// slot.
    pub version: u64,
    /// `-1` marks a pending free.
    pub size: i32,
    pub payload: Vec<u8>,
}

impl Object {
    fn read(addr: GAddr, version: u64, payload: Vec<u8>) -> Object {
        Object { addr, version, size: payload.len() as i32, payload }
    }

    fn write(addr: GAddr, payload: Vec<u8>) -> Object {
        Object { addr, version: 0, size: payload.len() as i32, payload }
    }

    fn free(addr: GAddr) -> Object {
        Object { addr, version: 0, size: -1, payload: Vec::new() }
    }
}

/// Globally unique transaction identity: the coordinator that owns it, plus
/// a coordinator-local monotonic sequence number (spec §4.1).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TxnId {
    pub coordinator_wid: WorkerId,
    pub seq_id: u32,
}

/// Read-set and write-set bookkeeping for one in-flight transaction,
/// grouped by the worker that owns each address (spec §4.1: "participants
/// are derived from the union of read-set and write-set owners").
#[derive(Debug, Default)]
pub struct TxnContext {
    arena: Vec<Object>,
    pub read_set: BTreeMap<WorkerId, BTreeMap<GAddr, TxnSlotId>>,
    pub write_set: BTreeMap<WorkerId, BTreeMap<GAddr, TxnSlotId>>,
}

impl TxnContext {
    pub fn new() -> TxnContext {
        TxnContext::default()
    }

    pub fn slot(&self, id: TxnSlotId) -> &Object {
        &self.arena[id]
    }

    fn push(&mut self, obj: Object) -> TxnSlotId {
        self.arena.push(obj);
        self.arena.len() - 1
    }

    /// Records a read: `addr` observed at `version` with the given payload.
    /// Overwrites a prior read-set entry for the same address (re-reading
    /// refreshes the observed version).
    pub fn tx_read(&mut self, addr: GAddr, version: u64, payload: Vec<u8>) -> TxnSlotId {
        let slot = self.push(Object::read(addr, version, payload));
        self.read_set.entry(addr.wid()).or_default().insert(addr, slot);
        slot
    }

    /// Records a partial read covering `[offset, offset + payload.len())`
    /// of `addr`; tracked the same as a full read since validation only
    /// cares about the version, not the byte range (spec §4.5).
    pub fn tx_partial_read(
        &mut self,
        addr: GAddr,
        version: u64,
        _offset: u32,
        payload: Vec<u8>,
    ) -> TxnSlotId {
        self.tx_read(addr, version, payload)
    }

    /// Buffers a write to be applied on commit. Overwrites a prior
    /// write-set entry for the same address. If `addr` is already in the
    /// read-set, the write-set entry promotes that same slot instead of
    /// allocating a new one, so both sets name the same `Object` (spec §3:
    /// "an address present in both sets stores the same slot id in both
    /// maps").
    pub fn tx_write(&mut self, addr: GAddr, payload: Vec<u8>) -> TxnSlotId {
        let existing = self
            .write_set
            .get(&addr.wid())
            .and_then(|m| m.get(&addr))
            .or_else(|| self.read_set.get(&addr.wid()).and_then(|m| m.get(&addr)))
            .copied();
        let slot = match existing {
            Some(slot) => {
                let obj = &mut self.arena[slot];
                obj.size = payload.len() as i32;
                obj.payload = payload;
                slot
            }
            None => self.push(Object::write(addr, payload)),
        };
        self.write_set.entry(addr.wid()).or_default().insert(addr, slot);
        slot
    }

    /// A partial write merges into a full-object write-set entry at apply
    /// time; here it's recorded as a distinct buffered write keyed by the
    /// same address, later coalesced by [`TxnContext::write_objects_for`].
    pub fn tx_partial_write(&mut self, addr: GAddr, offset: u32, payload: Vec<u8>) -> TxnSlotId {
        let mut padded = vec![0u8; offset as usize];
        padded.extend_from_slice(&payload);
        self.tx_write(addr, padded)
    }

    /// Buffers a free of `addr`, to be applied as part of commit.
    pub fn tx_free(&mut self, addr: GAddr) -> TxnSlotId {
        let slot = self.push(Object::free(addr));
        self.write_set.entry(addr.wid()).or_default().insert(addr, slot);
        slot
    }

    /// The set of workers participating in this transaction: the union of
    /// read-set and write-set owners (spec §4.1).
    pub fn participants(&self) -> Vec<WorkerId> {
        let mut wids: Vec<WorkerId> =
            self.read_set.keys().chain(self.write_set.keys()).copied().collect();
        wids.sort_unstable();
        wids.dedup();
        wids
    }

    /// Write-set owners only: who PREPARE, COMMIT and ABORT address
    /// (spec §4.4 — those three phases scope to `participants = W`).
    pub fn write_participants(&self) -> Vec<WorkerId> {
        self.write_set.keys().copied().collect()
    }

    /// Read-set owners only: who VALIDATE addresses (spec §4.4 Phase 2 —
    /// `participants = R`).
    pub fn read_participants(&self) -> Vec<WorkerId> {
        self.read_set.keys().copied().collect()
    }

    /// True when every participant is `self_wid`: the short-form local-only
    /// fast path applies (spec §4.6).
    pub fn is_local_only(&self, self_wid: WorkerId) -> bool {
        self.participants().iter().all(|&w| w == self_wid)
    }

    fn write_objects_for(&self, wid: WorkerId) -> Vec<WireObject> {
        self.write_set
            .get(&wid)
            .into_iter()
            .flat_map(|m| m.values())
            .map(|&slot| {
                let obj = &self.arena[slot];
                WireObject { addr: obj.addr, size: obj.size, payload: obj.payload.clone() }
            })
            .collect()
    }

    /// Rough wire-size estimate for one object inside a PREPARE chunk: just
    /// conservative enough that a chunk built under this estimate actually
    /// stays under `MAX_REQUEST_SIZE` once encoded (spec §6).
    fn prepare_wire_size(obj: &WireObject) -> usize {
        16 + obj.payload.len()
    }

    /// Wire-size estimate for one `(addr, version)` VALIDATE pair.
    const VALIDATE_PAIR_SIZE: usize = 16;

    fn chunk_msgs<T>(
        items: Vec<T>,
        item_size: impl Fn(&T) -> usize,
        build: impl Fn(Vec<T>, u32) -> (Header, Payload),
    ) -> Vec<(Header, Payload)> {
        let total = items.len() as u32;
        let mut msgs = Vec::new();
        let mut chunk = Vec::new();
        let mut chunk_bytes = 0usize;
        for item in items {
            let size = item_size(&item);
            if !chunk.is_empty() && chunk_bytes + size > MAX_REQUEST_SIZE {
                msgs.push(build(std::mem::take(&mut chunk), total));
                chunk_bytes = 0;
            }
            chunk_bytes += size;
            chunk.push(item);
        }
        if !chunk.is_empty() || msgs.is_empty() {
            msgs.push(build(chunk, total));
        }
        msgs
    }

    /// Builds the PREPARE chunks sent to `wid`: the write-set objects this
    /// worker owns, split so that no single message exceeds
    /// `MAX_REQUEST_SIZE` (spec §4.2, §6 PREPARE payload table entry, §8's
    /// "N objects exceeding MAX_REQUEST_SIZE" boundary case). `Header.size`
    /// carries the total object count across every chunk for this
    /// participant, since `Header.nobj` only describes the chunk at hand;
    /// the participant accumulates until it has seen that many.
    pub fn generate_prepare_msgs(&self, id: u32, wid: WorkerId) -> Vec<(Header, Payload)> {
        let objs = self.write_objects_for(wid);
        Self::chunk_msgs(objs, Self::prepare_wire_size, |chunk, total| {
            let mut header = Header::new(OpCode::Prepare);
            header.id = id;
            header.nobj = chunk.len() as u32;
            header.size = total;
            (header, Payload::Objects(chunk))
        })
    }

    /// Builds the VALIDATE chunks sent to `wid`: `(addr, version)` pairs for
    /// every read-set entry owned by `wid`, chunked the same way as
    /// [`TxnContext::generate_prepare_msgs`] (spec §4.3).
    pub fn generate_validate_msgs(&self, id: u32, wid: WorkerId) -> Vec<(Header, Payload)> {
        let pairs: Vec<(GAddr, u64)> = self
            .read_set
            .get(&wid)
            .into_iter()
            .flat_map(|m| m.values())
            .map(|&slot| {
                let obj = &self.arena[slot];
                (obj.addr, obj.version)
            })
            .collect();
        Self::chunk_msgs(pairs, |_| Self::VALIDATE_PAIR_SIZE, |chunk, total| {
            let mut header = Header::new(OpCode::Validate);
            header.id = id;
            header.nobj = chunk.len() as u32;
            header.size = total;
            (header, Payload::Versions(chunk))
        })
    }

    /// Builds the COMMIT notification sent to `wid`: no payload, since the
    /// participant already buffered the write-set objects during PREPARE
    /// (spec §4.4).
    pub fn generate_commit_msg(&self, id: u32) -> (Header, Payload) {
        let mut header = Header::new(OpCode::Commit);
        header.id = id;
        (header, Payload::Empty)
    }

    /// Builds the ABORT notification sent to `wid`.
    pub fn generate_abort_msg(&self, id: u32) -> (Header, Payload) {
        let mut header = Header::new(OpCode::Abort);
        header.id = id;
        (header, Payload::Empty)
    }
}
