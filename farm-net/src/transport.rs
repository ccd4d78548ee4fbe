use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use farm_base::{err, Result, WorkerId};

use crate::message::Message;

/// A reliable, in-order, message-boundary-preserving full-duplex channel
/// between nodes (spec §6). The real implementation is RDMA-backed and out
/// of scope; this trait is the seam a production transport plugs into, and
/// [`InProcessTransport`] is the in-process stand-in used by tests and the
/// single-binary demo harness.
pub trait Transport {
    /// Enqueue `msg` for delivery to `msg.dst`. May defer onto a pending
    /// list if the transport has no free send slot right now; submission
    /// order on that list is preserved (spec §9 design notes).
    fn send(&mut self, msg: Message) -> Result<()>;

    /// Non-blocking poll for the next inbound message addressed to this
    /// node, if any.
    fn poll_recv(&mut self) -> Option<Message>;

    /// Equivalent to a normal `send`, but semantically "from a registered
    /// buffer" to avoid a copy; the in-process transport has no copies to
    /// avoid; but this lets callers model the distinction.
    fn send_from_registered(&mut self, msg: Message) -> Result<()> {
        self.send(msg)
    }
}

/// Bound on a single mailbox before new sends are deferred onto the
/// sender's pending list. Chosen to be large enough that ordinary tests
/// never hit it by accident, while still being exercisable deliberately.
const MAILBOX_CAPACITY: usize = 4096;

#[derive(Default)]
struct Hub {
    mailboxes: Mutex<HashMap<WorkerId, VecDeque<Message>>>,
}

impl Hub {
    fn try_deliver(&self, msg: Message) -> std::result::Result<(), Message> {
        let mut boxes = self.mailboxes.lock().unwrap();
        let mailbox = boxes.entry(msg.dst).or_default();
        if mailbox.len() >= MAILBOX_CAPACITY {
            return Err(msg);
        }
        mailbox.push_back(msg);
        Ok(())
    }

    fn pop(&self, who: WorkerId) -> Option<Message> {
        let mut boxes = self.mailboxes.lock().unwrap();
        boxes.get_mut(&who).and_then(|q| q.pop_front())
    }
}

/// A shared in-process "network": every [`InProcessTransport`] handle
/// created from the same `InProcessNetwork` can reach every other one.
/// Stands in for the RDMA fabric in tests.
#[derive(Clone, Default)]
pub struct InProcessNetwork {
    hub: Arc<Hub>,
}

impl InProcessNetwork {
    pub fn new() -> InProcessNetwork {
        InProcessNetwork::default()
    }

    pub fn transport_for(&self, self_id: WorkerId) -> InProcessTransport {
        InProcessTransport {
            self_id,
            hub: self.hub.clone(),
            pending: VecDeque::new(),
        }
    }
}

/// One node's handle onto an [`InProcessNetwork`]. Messages sent to the same
/// destination are delivered in send order; a full mailbox defers the send
/// onto `pending`, drained on every subsequent `send`/`poll_recv` call.
pub struct InProcessTransport {
    self_id: WorkerId,
    hub: Arc<Hub>,
    pending: VecDeque<Message>,
}

impl InProcessTransport {
    fn drain_pending(&mut self) {
        while let Some(msg) = self.pending.pop_front() {
            match self.hub.try_deliver(msg) {
                Ok(()) => {}
                Err(msg) => {
                    self.pending.push_front(msg);
                    break;
                }
            }
        }
    }
}

impl Transport for InProcessTransport {
    fn send(&mut self, msg: Message) -> Result<()> {
        if msg.src != self.self_id {
            return Err(err("message source does not match sending transport"));
        }
        self.drain_pending();
        if !self.pending.is_empty() {
            // Earlier sends are still backed up; preserve order.
            self.pending.push_back(msg);
            return Ok(());
        }
        if let Err(msg) = self.hub.try_deliver(msg) {
            self.pending.push_back(msg);
        }
        Ok(())
    }

    fn poll_recv(&mut self) -> Option<Message> {
        self.drain_pending();
        self.hub.pop(self.self_id)
    }
}
