use farm_base::{GAddr, Status, WorkerId};
use serde::{Deserialize, Serialize};

/// Op codes, grounded 1:1 on `enum Work` in the original `workrequest.h`,
/// minus the `REPLY` bit trick (each reply gets its own variant instead).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum OpCode {
    FetchMemStats,
    UpdateMemStats,
    FetchMemStatsReply,
    BroadcastMemStats,
    Put,
    Get,
    PutReply,
    GetReply,
    FarmMalloc,
    FarmMallocReply,
    FarmRead,
    FarmReadReply,
    Prepare,
    PrepareReply,
    Validate,
    ValidateReply,
    Commit,
    Abort,
    Acknowledge,
}

impl OpCode {
    /// True for messages carrying a reply to an earlier request.
    pub fn is_reply(self) -> bool {
        use OpCode::*;
        matches!(
            self,
            FetchMemStatsReply
                | PutReply
                | GetReply
                | FarmMallocReply
                | FarmReadReply
                | PrepareReply
                | ValidateReply
                | Acknowledge
        )
    }
}

/// Bit 0 = ASYNC, bit 1 = ALIGNED, bit 2 = TO_SERVE. Other bits reserved.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Flags(pub u8);

impl Flags {
    pub const ASYNC: Flags = Flags(1 << 0);
    pub const ALIGNED: Flags = Flags(1 << 1);
    pub const TO_SERVE: Flags = Flags(1 << 2);

    pub fn none() -> Flags {
        Flags(0)
    }

    pub fn contains(self, bit: Flags) -> bool {
        self.0 & bit.0 == bit.0
    }

    pub fn with(self, bit: Flags) -> Flags {
        Flags(self.0 | bit.0)
    }
}

/// Common header fields present on every wire message. `addr`, `size`, and
/// `nobj` are context-dependent per op code (see the payload table in the
/// spec).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Header {
    pub op: OpCode,
    /// Transaction sequence id, coordinator-local; 0 for non-transactional
    /// messages.
    pub id: u32,
    pub status: Status,
    pub flags: Flags,
    pub addr: GAddr,
    pub size: u32,
    pub nobj: u32,
}

impl Header {
    pub fn new(op: OpCode) -> Header {
        Header {
            op,
            id: 0,
            status: Status::Success,
            flags: Flags::none(),
            addr: GAddr::NULL,
            size: 0,
            nobj: 0,
        }
    }
}

/// An object as it travels in a PREPARE chunk: `varint(addr) ||
/// varint(size) || payload` in the original wire format; here just the
/// decoded triple, since `rmp_serde` owns the actual varint-ish encoding of
/// integers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireObject {
    pub addr: GAddr,
    /// -1 means "free this object on commit".
    pub size: i32,
    pub payload: Vec<u8>,
}

/// The variable part of a message. Which variant is valid for a given
/// [`OpCode`] is fixed by the payload table in the spec; mismatches are a
/// protocol bug caught by [`Message::body_matches_op`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Payload {
    Empty,
    /// `(total, free)` bytes on this worker, for UPDATE_MEM_STATS.
    MemStat { total: u64, free: u64 },
    /// `(wid, total, free)` triples, for FETCH_MEM_STATS_REPLY and
    /// BROADCAST_MEM_STATS.
    MemStatList(Vec<(WorkerId, u64, u64)>),
    Key(u64),
    KeyValue { key: u64, value: Vec<u8> },
    Value(Vec<u8>),
    MallocReq { size: u32, flags: Flags },
    ReadReply { version: u64, size: i32, payload: Vec<u8> },
    Objects(Vec<WireObject>),
    /// `(addr, version)` pairs, for VALIDATE.
    Versions(Vec<(GAddr, u64)>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub src: WorkerId,
    pub dst: WorkerId,
    pub header: Header,
    pub payload: Payload,
}

impl Message {
    pub fn new(src: WorkerId, dst: WorkerId, header: Header, payload: Payload) -> Message {
        Message { src, dst, header, payload }
    }

    pub fn encode(&self) -> farm_base::Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn decode(buf: &[u8]) -> farm_base::Result<Message> {
        Ok(rmp_serde::from_slice(buf)?)
    }
}
