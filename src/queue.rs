//! Thread-safe FIFO/LIFO hybrid queue, the Rust equivalent of `tsqueue<T>`
//! from `netron/tsqueue.hpp`, with a blocking `wait()` the original never
//! had (it only ever polled `empty()` in a spin loop).

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

pub struct ThreadSafeQueue<T> {
    state: Mutex<VecDeque<T>>,
    signal: Condvar,
}

impl<T> ThreadSafeQueue<T> {
    pub fn new() -> ThreadSafeQueue<T> {
        ThreadSafeQueue {
            state: Mutex::new(VecDeque::new()),
            signal: Condvar::new(),
        }
    }

    pub fn push_back(&self, item: T) {
        let mut queue = self.state.lock().unwrap();
        queue.push_back(item);
        self.signal.notify_one();
    }

    pub fn push_front(&self, item: T) {
        let mut queue = self.state.lock().unwrap();
        queue.push_front(item);
        self.signal.notify_one();
    }

    pub fn pop_front(&self) -> Option<T> {
        self.state.lock().unwrap().pop_front()
    }

    pub fn pop_back(&self) -> Option<T> {
        self.state.lock().unwrap().pop_back()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().is_empty()
    }

    pub fn count(&self) -> usize {
        self.state.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.state.lock().unwrap().clear();
    }

    /// Blocks the calling thread until the queue holds at least one item,
    /// tolerating spurious wakeups structurally rather than by convention.
    pub fn wait(&self) {
        let guard = self.state.lock().unwrap();
        let _guard = self.signal.wait_while(guard, |queue| queue.is_empty()).unwrap();
    }
}

impl<T: Clone> ThreadSafeQueue<T> {
    pub fn front(&self) -> Option<T> {
        self.state.lock().unwrap().front().cloned()
    }

    pub fn back(&self) -> Option<T> {
        self.state.lock().unwrap().back().cloned()
    }
}

impl<T> Default for ThreadSafeQueue<T> {
    fn default() -> Self {
        ThreadSafeQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_order() {
        let queue = ThreadSafeQueue::new();
        queue.push_back(1);
        queue.push_back(2);
        queue.push_back(3);
        assert_eq!(queue.pop_front(), Some(1));
        assert_eq!(queue.pop_front(), Some(2));
        assert_eq!(queue.count(), 1);
    }

    #[test]
    fn wait_unblocks_on_push() {
        let queue = Arc::new(ThreadSafeQueue::new());
        let producer = queue.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            producer.push_back(42);
        });
        queue.wait();
        assert_eq!(queue.pop_front(), Some(42));
        handle.join().unwrap();
    }
}
