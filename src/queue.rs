use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use marine_proto::Message;

use crate::error::QueueError;

struct QueueState {
    items: VecDeque<Message>,
    producers: usize,
    /// Set once the producer count has dropped back to zero. No further
    /// registrations or pushes are accepted afterwards.
    producers_done: bool,
}

/// Result of a pop with a timeout
#[derive(Debug, PartialEq)]
pub enum PopResult {
    Message(Message),
    /// Nothing arrived before the timeout
    Empty,
    /// All producers have left and the buffer is drained
    Closed,
}

/// Unbounded FIFO shared by many producer threads and one consumer.
///
/// The queue reports closed only after every registered producer has
/// deregistered and the buffer is empty, so no message pushed before
/// shutdown is lost.
pub struct MessageQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                producers: 0,
                producers_done: false,
            }),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A panicking producer cannot leave the deque half-modified
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Call before the first push
    pub fn register_producer(&self) -> Result<(), QueueError> {
        let mut state = self.lock();
        if state.producers_done {
            return Err(QueueError::Closed);
        }
        state.producers += 1;
        Ok(())
    }

    /// Call after the last push. Waiting consumers are woken when the last
    /// producer leaves.
    pub fn deregister_producer(&self) {
        let mut state = self.lock();
        state.producers = state.producers.saturating_sub(1);
        if state.producers == 0 {
            state.producers_done = true;
            self.available.notify_all();
        }
    }

    /// Append to the tail without blocking
    pub fn push(&self, message: Message) -> Result<(), QueueError> {
        let mut state = self.lock();
        if state.producers_done {
            return Err(QueueError::Closed);
        }
        state
            .items
            .try_reserve(1)
            .map_err(|_| QueueError::Allocation)?;
        state.items.push_back(message);
        self.available.notify_one();
        Ok(())
    }

    /// Block until a message is available. `None` once the queue is closed.
    pub fn pop(&self) -> Option<Message> {
        let mut state = self.lock();
        loop {
            if let Some(message) = state.items.pop_front() {
                return Some(message);
            }
            if state.producers_done {
                return None;
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`
    pub fn pop_timeout(&self, timeout: Duration) -> PopResult {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(message) = state.items.pop_front() {
                return PopResult::Message(message);
            }
            if state.producers_done {
                return PopResult::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return PopResult::Empty;
            }
            state = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn producer_count(&self) -> usize {
        self.lock().producers
    }

    /// True once every producer has left and the buffer is drained
    pub fn is_closed(&self) -> bool {
        let state = self.lock();
        state.producers_done && state.items.is_empty()
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Set of sink queues that receive every pushed message.
///
/// Each sink (data log, live monitor) drains its own queue, so a slow sink
/// never delays another.
#[derive(Clone, Default)]
pub struct Fanout {
    queues: Vec<Arc<MessageQueue>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(&mut self, queue: Arc<MessageQueue>) {
        self.queues.push(queue);
    }

    /// Register a producer on every sink queue. The registration is
    /// released when the returned handle is dropped.
    pub fn register(&self) -> Result<QueueProducer, QueueError> {
        for (i, queue) in self.queues.iter().enumerate() {
            if let Err(e) = queue.register_producer() {
                for registered in &self.queues[..i] {
                    registered.deregister_producer();
                }
                return Err(e);
            }
        }
        Ok(QueueProducer {
            queues: self.queues.clone(),
        })
    }
}

/// Registered producer handle
pub struct QueueProducer {
    queues: Vec<Arc<MessageQueue>>,
}

impl QueueProducer {
    pub fn push(&self, message: Message) -> Result<(), QueueError> {
        if let Some((last, rest)) = self.queues.split_last() {
            for queue in rest {
                queue.push(message.clone())?;
            }
            last.push(message)?;
        }
        Ok(())
    }

    pub fn push_all(&self, messages: impl IntoIterator<Item = Message>) -> Result<(), QueueError> {
        for message in messages {
            self.push(message)?;
        }
        Ok(())
    }
}

impl Drop for QueueProducer {
    fn drop(&mut self) {
        for queue in &self.queues {
            queue.deregister_producer();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fifo_single_producer() {
        let queue = MessageQueue::new();
        queue.register_producer().unwrap();
        for i in 0..5 {
            queue.push(Message::float(0x30, 4, i as f32)).unwrap();
        }
        queue.deregister_producer();
        for i in 0..5 {
            assert_eq!(queue.pop().unwrap().as_float(), Some(i as f32));
        }
        assert!(queue.pop().is_none());
        assert!(queue.is_closed());
    }

    #[test]
    fn test_not_closed_until_drained() {
        let queue = MessageQueue::new();
        queue.register_producer().unwrap();
        queue.push(Message::float(1, 4, 1.0)).unwrap();
        queue.deregister_producer();
        assert!(!queue.is_closed());
        assert!(queue.pop().is_some());
        assert!(queue.is_closed());
    }

    #[test]
    fn test_closed_rejects_producers() {
        let queue = MessageQueue::new();
        queue.register_producer().unwrap();
        queue.deregister_producer();
        assert_eq!(queue.register_producer(), Err(QueueError::Closed));
        assert_eq!(queue.push(Message::float(1, 4, 1.0)), Err(QueueError::Closed));
    }

    #[test]
    fn test_pop_timeout() {
        let queue = MessageQueue::new();
        queue.register_producer().unwrap();
        assert_eq!(queue.pop_timeout(Duration::from_millis(10)), PopResult::Empty);
        queue.push(Message::float(1, 4, 1.0)).unwrap();
        assert!(matches!(queue.pop_timeout(Duration::from_millis(10)), PopResult::Message(_)));
        queue.deregister_producer();
        assert_eq!(queue.pop_timeout(Duration::from_millis(10)), PopResult::Closed);
    }

    #[test]
    fn test_blocked_consumer_woken_on_close() {
        let queue = Arc::new(MessageQueue::new());
        queue.register_producer().unwrap();
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(20));
        queue.deregister_producer();
        assert!(consumer.join().unwrap().is_none());
    }

    #[test]
    fn test_many_producers_one_consumer() {
        const PRODUCERS: u8 = 8;
        const MESSAGES: usize = 500;

        let queue = Arc::new(MessageQueue::new());
        let mut fanout = Fanout::new();
        fanout.add_sink(Arc::clone(&queue));

        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let producer = fanout.register().unwrap();
            handles.push(thread::spawn(move || {
                for i in 0..MESSAGES {
                    producer.push(Message::float(0x10 + p, 4, i as f32)).unwrap();
                }
            }));
        }
        assert_eq!(queue.producer_count(), PRODUCERS as usize);

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut last = vec![-1.0f32; PRODUCERS as usize];
                let mut count = 0;
                while let Some(msg) = queue.pop() {
                    let p = (msg.source() - 0x10) as usize;
                    let value = msg.as_float().unwrap();
                    assert!(value > last[p], "per-producer order violated");
                    last[p] = value;
                    count += 1;
                }
                count
            })
        };

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(consumer.join().unwrap(), PRODUCERS as usize * MESSAGES);
        assert!(queue.is_closed());
    }

    #[test]
    fn test_fanout_feeds_every_sink() {
        let log = Arc::new(MessageQueue::new());
        let monitor = Arc::new(MessageQueue::new());
        let mut fanout = Fanout::new();
        fanout.add_sink(Arc::clone(&log));
        fanout.add_sink(Arc::clone(&monitor));

        let producer = fanout.register().unwrap();
        producer.push(Message::string(0x30, 0, "GPS")).unwrap();
        drop(producer);

        assert_eq!(log.pop().unwrap().as_str(), Some("GPS"));
        assert_eq!(monitor.pop().unwrap().as_str(), Some("GPS"));
        assert!(log.pop().is_none());
        assert!(monitor.pop().is_none());
    }

    #[test]
    fn test_fanout_register_after_close() {
        let queue = Arc::new(MessageQueue::new());
        let mut fanout = Fanout::new();
        fanout.add_sink(Arc::clone(&queue));
        drop(fanout.register().unwrap());
        assert!(fanout.register().is_err());
    }
}
