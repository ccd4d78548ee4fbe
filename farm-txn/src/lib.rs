mod context;
mod coordinator;
mod deferred;
mod object;
mod participant;

pub use context::{Object, TxnContext, TxnId, TxnSlotId};
pub use coordinator::{CoordinatorTxn, LocalStore, Outcome, Phase};
pub use deferred::{DeferredRead, DeferredReadQueue};
pub use object::{is_locked, is_rlocked, is_version_diff, is_wlocked, VersionWord, MAX_VERSION};
pub use participant::{Participant, State, TxnKey};
