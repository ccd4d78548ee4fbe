/// Wire-level result codes. Never thrown; always propagated through a
/// `status` field on a request or reply.
///
/// Ordinal values match the wire encoding in the spec (`SUCCESS = 0`, then
/// the rest in declaration order) and must not be reordered once a cluster is
/// running mixed versions.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash,
    serde::Serialize, serde::Deserialize,
)]
#[repr(u8)]
pub enum Status {
    Success = 0,
    AllocError,
    ReadError,
    WriteError,
    LockFailed,
    PrepareFailed,
    ValidateFailed,
    CommitFailed,
    NotExist,
}

impl Status {
    pub fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Option<Status> {
        use Status::*;
        Some(match v {
            0 => Success,
            1 => AllocError,
            2 => ReadError,
            3 => WriteError,
            4 => LockFailed,
            5 => PrepareFailed,
            6 => ValidateFailed,
            7 => CommitFailed,
            8 => NotExist,
            _ => return None,
        })
    }
}
