mod message;
mod transport;

pub use message::{Flags, Header, Message, OpCode, Payload, WireObject};
pub use transport::{InProcessNetwork, InProcessTransport, Transport};

/// A message larger than this is not allowed at the transport layer;
/// PREPARE/VALIDATE chunking keeps any one message under the limit (spec
/// §6). Chosen generously enough for one object plus header in tests.
pub const MAX_REQUEST_SIZE: usize = 64 * 1024;
