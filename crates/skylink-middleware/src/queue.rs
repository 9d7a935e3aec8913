//! Unbounded FIFO that hands events from the delivery context to a
//! poll-driven consumer.
//!
//! The delivery task only ever calls [`EventQueue::push`]; the consumer calls
//! [`EventQueue::drain_all`] on its own cadence.  Both take the same short
//! critical section, so a drain sees a consistent prefix of the arrival order
//! and never observes an event twice.

use std::collections::VecDeque;

use parking_lot::Mutex;
use skylink_types::Event;

#[derive(Debug, Default)]
pub struct EventQueue {
    inner: Mutex<VecDeque<Event>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `event`. Never waits on the consumer.
    pub fn push(&self, event: Event) {
        self.inner.lock().push_back(event);
    }

    /// Remove and return everything queued, oldest first.
    ///
    /// Returns an empty `Vec` when nothing is pending.
    pub fn drain_all(&self) -> Vec<Event> {
        let drained = std::mem::take(&mut *self.inner.lock());
        drained.into()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
