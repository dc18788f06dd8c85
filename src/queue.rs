//! Bounded drop-oldest hand-off queue
//!
//! The one backpressure primitive in the pipeline: producers never block;
//! when a queue is full the oldest item is dropped to make room. A single
//! consumer thread blocks on the condvar until the queue is finished and
//! drained.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

struct State<T> {
    items: VecDeque<T>,
    finished: bool,
}

pub(crate) struct BoundedQueue<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                finished: false,
            }),
            cond: Condvar::new(),
            capacity,
        }
    }

    /// Never blocks; returns `true` if an item was dropped to make room
    /// (or the queue is already finished)
    pub fn push(&self, item: T) -> bool {
        let mut state = self.state.lock();
        if state.finished {
            return true;
        }
        let dropped = if state.items.len() == self.capacity {
            state.items.pop_front();
            true
        } else {
            false
        };
        state.items.push_back(item);
        drop(state);
        self.cond.notify_one();
        dropped
    }

    /// Blocks the consumer until an item arrives or the queue is finished
    /// and empty
    pub fn pop_blocking(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.finished {
                return None;
            }
            self.cond.wait(&mut state);
        }
    }

    /// No more pushes will be accepted; queued items still drain
    pub fn finish(&self) {
        self.state.lock().finished = true;
        self.cond.notify_all();
    }

    /// Discard everything queued, returning the count
    pub fn clear(&self) -> u64 {
        let mut state = self.state.lock();
        let n = state.items.len() as u64;
        state.items.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn drops_oldest_when_full() {
        let queue = BoundedQueue::new(2);
        assert!(!queue.push(1));
        assert!(!queue.push(2));
        assert!(queue.push(3));
        assert_eq!(queue.pop_blocking(), Some(2));
        assert_eq!(queue.pop_blocking(), Some(3));
    }

    #[test]
    fn finish_drains_then_ends() {
        let queue = BoundedQueue::new(4);
        queue.push("a");
        queue.finish();
        assert_eq!(queue.pop_blocking(), Some("a"));
        assert_eq!(queue.pop_blocking(), None);
        // Pushes after finish are reported as drops.
        assert!(queue.push("b"));
    }

    #[test]
    fn wakes_a_blocked_consumer() {
        let queue = Arc::new(BoundedQueue::new(2));
        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.pop_blocking())
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        queue.push(7u32);
        assert_eq!(consumer.join().unwrap(), Some(7));
    }
}
