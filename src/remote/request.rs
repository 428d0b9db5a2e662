//! Request bookkeeping: priorities, queue entries and completion plumbing.

use std::collections::VecDeque;
use std::time::Duration;

use futures::channel::oneshot;
use tokio::task::JoinHandle;

use crate::error::NimbusResult;
use crate::protocol::ClientFrame;

/// Wire-level request priority. Connection requests outrank auth, which
/// outranks everything else.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Medium,
    High,
}

pub type Completion = oneshot::Sender<NimbusResult<()>>;

/// One queued (or in-flight) client request. `internal_id` identifies the
/// entry across its whole lifecycle, since the wire event-id is only
/// assigned at flush time.
pub struct QueuedRequest {
    pub internal_id: u64,
    pub frame: ClientFrame,
    pub completion: Option<Completion>,
    /// Echoed event-id for client-ack frames; everything else gets a fresh
    /// id at flush.
    pub fixed_event_id: Option<String>,
    pub timeout: Option<Duration>,
    pub timeout_handle: Option<JoinHandle<()>>,
    /// Monotonic enqueue stamp used to keep replay ordering stable.
    pub enqueue_seq: u64,
}

impl QueuedRequest {
    pub fn priority(&self) -> Priority {
        match self.frame {
            ClientFrame::Connect { .. } | ClientFrame::Reconnect { .. } => Priority::High,
            ClientFrame::Auth { .. } => Priority::Medium,
            _ => Priority::Low,
        }
    }

    /// Connect and reconnect requests always carry a timeout; everything
    /// else only when the caller configured one.
    pub fn always_times_out(&self) -> bool {
        matches!(
            self.frame,
            ClientFrame::Connect { .. } | ClientFrame::Reconnect { .. }
        )
    }

    /// Requests bound to one physical connection are dropped rather than
    /// replayed when it goes away. Acks reference event-ids of the dead
    /// connection, so they die with it too.
    pub fn bound_to_connection(&self) -> bool {
        matches!(
            self.frame,
            ClientFrame::Connect { .. }
                | ClientFrame::Reconnect { .. }
                | ClientFrame::Nop
                | ClientFrame::Disconnect
                | ClientFrame::Ack
        )
    }

    /// Ack and disconnect frames are one-way: they never enter the pending
    /// table and no response correlates back to them.
    pub fn expects_response(&self) -> bool {
        !matches!(self.frame, ClientFrame::Ack | ClientFrame::Disconnect)
    }

    pub fn cancel_timeout(&mut self) {
        if let Some(handle) = self.timeout_handle.take() {
            handle.abort();
        }
    }

    pub fn complete(&mut self, result: NimbusResult<()>) {
        self.cancel_timeout();
        if let Some(completion) = self.completion.take() {
            let _ = completion.send(result);
        }
    }
}

/// Inserts `request` in front of the first entry with strictly lower
/// priority, keeping entries of the same class in enqueue order.
pub fn insert_prioritized(queue: &mut VecDeque<QueuedRequest>, request: QueuedRequest) {
    let priority = request.priority();
    let position = queue
        .iter()
        .position(|queued| queued.priority() < priority)
        .unwrap_or(queue.len());
    queue.insert(position, request);
}
