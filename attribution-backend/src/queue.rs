//! Ordered, bounded queue with single-flight draining.
//!
//! Shared by the source/trigger pipeline and the OS registration pipeline.
//! An item stays counted against the bound until the drain loop asks for
//! the next one, so the item being processed still occupies a slot.

use parking_lot::Mutex;
use std::collections::VecDeque;

#[derive(Debug, PartialEq, Eq)]
pub enum Enqueue<T> {
    /// Queue full; the item is handed back untouched.
    Rejected(T),
    /// A drain is already running and will reach this item.
    Queued,
    /// The caller must start a drain loop.
    StartDrain,
}

struct QueueState<T> {
    items: VecDeque<T>,
    in_flight: bool,
    draining: bool,
}

pub struct GatedQueue<T> {
    state: Mutex<QueueState<T>>,
    max_len: usize,
}

impl<T> GatedQueue<T> {
    pub fn new(max_len: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                in_flight: false,
                draining: false,
            }),
            max_len,
        }
    }

    pub fn enqueue(&self, item: T) -> Enqueue<T> {
        let mut state = self.state.lock();
        let len = state.items.len() + usize::from(state.in_flight);
        if len >= self.max_len {
            return Enqueue::Rejected(item);
        }
        state.items.push_back(item);
        if state.draining {
            Enqueue::Queued
        } else {
            state.draining = true;
            Enqueue::StartDrain
        }
    }

    /// Completes the in-flight item (if any) and hands out the next one.
    /// Returning `None` ends the drain; the next enqueue starts a new one.
    pub fn take_next(&self) -> Option<T> {
        let mut state = self.state.lock();
        state.in_flight = false;
        match state.items.pop_front() {
            Some(item) => {
                state.in_flight = true;
                Some(item)
            }
            None => {
                state.draining = false;
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.items.len() + usize::from(state.in_flight)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
