//! Small thread-coordination primitives shared by the pipeline tasks.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A manually settable flag that threads can wait on with a timeout.
///
/// Waiters return immediately while the flag is set; otherwise they block
/// until it is set or the timeout elapses.
pub struct FlagEvent {
    state: Mutex<bool>,
    cvar: Condvar,
}

impl FlagEvent {
    pub fn new(initially_set: bool) -> Self {
        Self {
            state: Mutex::new(initially_set),
            cvar: Condvar::new(),
        }
    }

    pub fn set(&self) {
        let mut state = self.state.lock().unwrap();
        *state = true;
        self.cvar.notify_all();
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        *state = false;
    }

    pub fn is_set(&self) -> bool {
        *self.state.lock().unwrap()
    }

    /// Wait until the flag is set. Returns true if it was set within the
    /// timeout, false otherwise.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let state = self.state.lock().unwrap();
        if *state {
            return true;
        }
        let (state, _result) = self
            .cvar
            .wait_timeout_while(state, timeout, |set| !*set)
            .unwrap();
        *state
    }
}

/// FIFO job queue with blocking pop. Multiple producers and consumers share
/// one queue; consumers poll with a timeout so they can observe shutdown.
pub struct JobQueue<T> {
    items: Mutex<VecDeque<T>>,
    cvar: Condvar,
}

impl<T> JobQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            cvar: Condvar::new(),
        }
    }

    pub fn push(&self, item: T) {
        let mut items = self.items.lock().unwrap();
        items.push_back(item);
        self.cvar.notify_one();
    }

    /// Pop the next item, waiting up to `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let items = self.items.lock().unwrap();
        let (mut items, _result) = self
            .cvar
            .wait_timeout_while(items, timeout, |q| q.is_empty())
            .unwrap();
        items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for JobQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
