// Causal reorder buffer for subscriber delivery.
//
// Incoming messages are handed to subscribers in causal order: a message is
// held back until everything its sender had observed (per its vector clock)
// has been delivered here. The buffer is bounded; on overflow it degrades
// to insertion order and logs the gap rather than stalling the stream.

use crate::clock::VectorClock;
use crate::message::Message;
use tracing::warn;

/// One buffered message plus its decrypted payload
#[derive(Debug, Clone)]
pub struct Deliverable {
    pub message: Message,
    pub plaintext: Vec<u8>,
}

/// Per-session reorder window
pub struct CausalBuffer {
    session_id: String,
    /// This install's device id. Incoming clocks carry components for our
    /// own messages (the sender observed them); those never gate delivery.
    local_device: String,
    /// Pointwise max over everything delivered so far
    delivered_head: VectorClock,
    pending: Vec<Deliverable>,
    window: usize,
}

fn origin_device(msg: &Message) -> &str {
    msg.id.split('_').nth(1).filter(|d| !d.is_empty()).unwrap_or(&msg.sender)
}

impl CausalBuffer {
    pub fn new(session_id: &str, local_device: &str, window: usize) -> Self {
        Self {
            session_id: session_id.to_string(),
            local_device: local_device.to_string(),
            delivered_head: VectorClock::new(),
            pending: Vec::new(),
            window: window.max(1),
        }
    }

    /// True when every foreign component of the message's clock has already
    /// been delivered — i.e. all its causal predecessors are in. The origin
    /// device and our own device are excluded: per-connection ordering
    /// covers the former, and we always hold our own messages.
    fn ready(&self, msg: &Message) -> bool {
        let origin = origin_device(msg);
        msg.vector_clock
            .devices()
            .filter(|d| *d != origin && *d != self.local_device)
            .all(|d| msg.vector_clock.get(d) <= self.delivered_head.get(d))
    }

    fn deliver(&mut self, item: Deliverable) -> Deliverable {
        self.delivered_head =
            VectorClock::pointwise_max(&self.delivered_head, &item.message.vector_clock);
        item
    }

    /// Offer a decrypted message. Returns everything now deliverable, in
    /// causal order. On window overflow, everything is released in
    /// insertion order instead.
    pub fn offer(&mut self, message: Message, plaintext: Vec<u8>) -> Vec<Deliverable> {
        let item = Deliverable { message, plaintext };
        let mut out = Vec::new();

        if self.ready(&item.message) {
            out.push(self.deliver(item));
            // Newly delivered clocks may unblock buffered messages
            loop {
                let Some(pos) = self.pending.iter().position(|p| self.ready(&p.message)) else {
                    break;
                };
                let next = self.pending.remove(pos);
                out.push(self.deliver(next));
            }
            return out;
        }

        self.pending.push(item);
        if self.pending.len() > self.window {
            warn!(
                session_id = %self.session_id,
                buffered = self.pending.len(),
                "reorder window overflow, falling back to insertion order"
            );
            for item in self.pending.drain(..) {
                self.delivered_head =
                    VectorClock::pointwise_max(&self.delivered_head, &item.message.vector_clock);
                out.push(item);
            }
        }
        out
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn delivered_head(&self) -> &VectorClock {
        &self.delivered_head
    }
}
