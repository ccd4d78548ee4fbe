/// Identifies a worker within a deployment. `0` is reserved for the
/// coordinator / "unassigned".
pub type WorkerId = u16;

/// The coordinator's reserved worker id; also used to mean "no owner yet".
pub const COORDINATOR_WID: WorkerId = 0;

const OFF_BITS: u32 = 48;
const OFF_MASK: u64 = (1u64 << OFF_BITS) - 1;

/// A 64-bit global address: owner worker id in the high 16 bits, byte offset
/// into that worker's local heap in the low 48 bits. `GAddr(0)` is the null
/// address (see spec §3).
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash,
    serde::Serialize, serde::Deserialize,
)]
pub struct GAddr(pub u64);

impl GAddr {
    pub const NULL: GAddr = GAddr(0);

    pub fn new(wid: WorkerId, off: u64) -> GAddr {
        debug_assert!(off <= OFF_MASK, "offset {off} exceeds 48 bits");
        GAddr(((wid as u64) << OFF_BITS) | (off & OFF_MASK))
    }

    pub fn wid(self) -> WorkerId {
        (self.0 >> OFF_BITS) as WorkerId
    }

    pub fn off(self) -> u64 {
        self.0 & OFF_MASK
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// The first (empty) global address owned by `wid`, i.e. offset 0.
    pub fn empty_glob(wid: WorkerId) -> GAddr {
        GAddr::new(wid, 0)
    }

    pub fn add(self, off: u64) -> GAddr {
        GAddr(self.0 + off)
    }
}

impl From<u64> for GAddr {
    fn from(v: u64) -> GAddr {
        GAddr(v)
    }
}

impl From<GAddr> for u64 {
    fn from(a: GAddr) -> u64 {
        a.0
    }
}
