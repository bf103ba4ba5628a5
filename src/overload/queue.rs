//! Bounded wait queue ordered by the shedding strategy.

use std::collections::VecDeque;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use super::config::{ShedFunction, ShedStrategy};
use crate::context::ProtectionContext;
use crate::error::OverloadReason;

/// What a queued caller is told when it leaves the queue: the time it
/// waited, or why it was turned away.
pub(crate) type Admitted = Result<Duration, OverloadReason>;

/// A request waiting for a concurrency slot.
///
/// Custom shed functions receive and return these; a request left out of
/// the returned queue is rejected as shed.
#[derive(Debug)]
pub struct QueuedRequest {
    id: Uuid,
    priority: i64,
    sequence: u64,
    enqueued_at: Instant,
    context: ProtectionContext,
    responder: oneshot::Sender<Admitted>,
}

impl QueuedRequest {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    /// Arrival order; lower values arrived earlier.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    pub fn context(&self) -> &ProtectionContext {
        &self.context
    }

    pub fn waited(&self) -> Duration {
        self.enqueued_at.elapsed()
    }

    /// Hand the caller its answer. Fails if the caller stopped waiting.
    pub(crate) fn respond(self, answer: Admitted) -> Result<(), Admitted> {
        self.responder.send(answer)
    }
}

#[derive(Debug, Default)]
pub(crate) struct AdmissionQueue {
    items: VecDeque<QueuedRequest>,
    next_sequence: u64,
}

impl AdmissionQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Enqueue a request and return the receiver its caller waits on.
    pub(crate) fn push(
        &mut self,
        id: Uuid,
        priority: i64,
        context: ProtectionContext,
        strategy: ShedStrategy,
        custom: Option<&ShedFunction>,
    ) -> oneshot::Receiver<Admitted> {
        let (responder, rx) = oneshot::channel();
        let item = QueuedRequest {
            id,
            priority,
            sequence: self.next_sequence,
            enqueued_at: Instant::now(),
            context,
            responder,
        };
        self.next_sequence += 1;

        match strategy {
            ShedStrategy::Fifo => self.items.push_back(item),
            ShedStrategy::Lifo => self.items.push_front(item),
            ShedStrategy::Priority => {
                // Behind every item of equal or higher priority.
                let at = self
                    .items
                    .iter()
                    .position(|queued| queued.priority < priority)
                    .unwrap_or(self.items.len());
                self.items.insert(at, item);
            }
            ShedStrategy::Random => {
                self.items.push_back(item);
                self.items
                    .make_contiguous()
                    .shuffle(&mut rand::thread_rng());
            }
            ShedStrategy::Custom => {
                self.items.push_back(item);
                if let Some(custom) = custom {
                    let current: Vec<_> = self.items.drain(..).collect();
                    self.items = custom.apply(current).into();
                }
            }
        }
        rx
    }

    pub(crate) fn pop_front(&mut self) -> Option<QueuedRequest> {
        self.items.pop_front()
    }

    pub(crate) fn remove(&mut self, id: Uuid) -> Option<QueuedRequest> {
        let at = self.items.iter().position(|queued| queued.id == id)?;
        self.items.remove(at)
    }

    pub(crate) fn drain_all(&mut self) -> Vec<QueuedRequest> {
        self.items.drain(..).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
