//! Messages waiting for an encrypted session, and the heartbeat clock.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// How pending messages may be sent once the session is encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetransmitMode {
    #[default]
    No,
    /// Queued while plaintext: sent as typed.
    Exact,
    /// The peer reported an error: sent with the resend prefix.
    WithPrefix,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub message: Vec<u8>,
    /// Host tag handed back with the sent/resent event.
    pub opaque: Vec<u8>,
    pub queued_at: Instant,
}

/// Shared queue of pending messages. Clones share the same queue, so a UI
/// thread can enqueue while the conversation handles network input.
#[derive(Debug, Clone, Default)]
pub struct ResendQueue {
    inner: Arc<RwLock<Vec<PendingMessage>>>,
}

impl ResendQueue {
    pub fn later(&self, message: &[u8], opaque: &[u8]) {
        use tracing::trace;

        let mut queue = self.inner.write().unwrap_or_else(|e| e.into_inner());
        queue.push(PendingMessage {
            message: message.to_vec(),
            opaque: opaque.to_vec(),
            queued_at: Instant::now(),
        });
        trace!(target: "otr::resend", pending = queue.len(), "queued message for later");
    }

    /// Takes everything queued; entries older than `max_age` are dropped.
    pub fn take_pending(&self, max_age: Duration) -> Vec<PendingMessage> {
        use tracing::debug;

        let mut queue = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let all = std::mem::take(&mut *queue);
        let total = all.len();
        let fresh: Vec<_> = all.into_iter().filter(|m| m.queued_at.elapsed() <= max_age).collect();
        if fresh.len() != total {
            debug!(
                target: "otr::resend",
                dropped = total - fresh.len(),
                "dropping pending messages older than the resend interval"
            );
        }
        fresh
    }

    /// Forgets entries older than `max_age` without taking the rest.
    pub fn prune(&self, max_age: Duration) {
        let mut queue = self.inner.write().unwrap_or_else(|e| e.into_inner());
        queue.retain(|m| m.queued_at.elapsed() <= max_age);
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Resend bookkeeping of one conversation.
#[derive(Debug, Default)]
pub struct ResendContext {
    pub mode: RetransmitMode,
    pub queue: ResendQueue,
    last_sent: Option<Instant>,
    retransmitting: bool,
}

impl ResendContext {
    /// Remembers a sent message unless it is itself a retransmission.
    pub fn later(&self, message: &[u8], opaque: &[u8]) {
        if self.retransmitting {
            return;
        }
        self.queue.later(message, opaque);
    }

    pub fn start_retransmitting(&mut self) {
        self.retransmitting = true;
    }

    pub fn end_retransmitting(&mut self) {
        self.retransmitting = false;
    }

    pub fn mark_sent(&mut self) {
        self.last_sent = Some(Instant::now());
    }

    /// True when nothing went out within `interval`.
    pub fn heartbeat_due(&self, interval: Duration) -> bool {
        match self.last_sent {
            None => true,
            Some(at) => at.elapsed() >= interval,
        }
    }

    /// True if the last send happened within `interval`.
    pub fn sent_recently(&self, interval: Duration) -> bool {
        matches!(self.last_sent, Some(at) if at.elapsed() < interval)
    }

    pub fn reset(&mut self) {
        self.mode = RetransmitMode::No;
        self.retransmitting = false;
        self.queue.clear();
    }
}
