//! Per-session message queue and delivery leases.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{PalmError, PalmResult};
use crate::message::{Envelope, LeaseCounter, Message};

/// Ordered, unbounded, single-consumer delivery channel of one session.
///
/// Producers push envelopes; a batch pushed with [`MessageQueue::push_all`]
/// lands contiguously, so a Finished/Result pair is never split by another
/// producer. Memory grows with undrained messages.
pub struct MessageQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
    leases: LeaseCounter,
}

struct QueueState {
    pending: VecDeque<Envelope>,
    closed: bool,
}

impl MessageQueue {
    pub(crate) fn new(session_id: u64) -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
            leases: LeaseCounter::new(session_id),
        }
    }

    pub fn push(&self, envelope: Envelope) -> PalmResult<()> {
        self.push_all(vec![envelope])
    }

    pub fn push_all(&self, batch: Vec<Envelope>) -> PalmResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().map_err(|_| PalmError::poisoned("queue"))?;
        if state.closed {
            return Err(PalmError::InvalidHandle);
        }
        state.pending.extend(batch);
        drop(state);
        self.ready.notify_all();
        Ok(())
    }

    /// Next message, or `None` once `timeout` elapses with the queue empty.
    pub fn wait(&self, timeout: Duration) -> PalmResult<Option<Message>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().map_err(|_| PalmError::poisoned("queue"))?;
        loop {
            if state.closed {
                return Err(PalmError::InvalidHandle);
            }
            if let Some(envelope) = state.pending.pop_front() {
                return Ok(Some(Message::new(envelope, self.leases.acquire())));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _) = self
                .ready
                .wait_timeout(state, deadline - now)
                .map_err(|_| PalmError::poisoned("queue"))?;
            state = guard;
        }
    }

    /// Messages queued but not yet delivered.
    pub fn pending(&self) -> usize {
        self.state.lock().map(|s| s.pending.len()).unwrap_or(0)
    }

    /// Messages delivered but not yet released.
    pub fn outstanding(&self) -> usize {
        self.leases.outstanding()
    }

    /// Close the queue only if every delivered message has been released.
    ///
    /// Leases are taken under the queue lock, so the check and the close are
    /// atomic with respect to delivery: a blocked waiter either got its
    /// message before this call (and the close is refused) or wakes to a
    /// closed queue. Returns how many undelivered messages were discarded.
    pub(crate) fn close_if_released(&self) -> PalmResult<usize> {
        let mut state = self.state.lock().map_err(|_| PalmError::poisoned("queue"))?;
        if state.closed {
            return Err(PalmError::InvalidHandle);
        }
        let outstanding = self.leases.outstanding();
        if outstanding > 0 {
            return Err(PalmError::MemoryLeak { outstanding });
        }
        state.closed = true;
        let dropped = state.pending.len();
        state.pending.clear();
        drop(state);
        self.ready.notify_all();
        Ok(dropped)
    }

    /// Refuse further traffic, wake any waiter and discard undelivered
    /// messages. Returns how many were discarded.
    pub(crate) fn close(&self) -> usize {
        let dropped = match self.state.lock() {
            Ok(mut state) => {
                state.closed = true;
                let n = state.pending.len();
                state.pending.clear();
                n
            }
            Err(poisoned) => {
                let mut state = poisoned.into_inner();
                state.closed = true;
                let n = state.pending.len();
                state.pending.clear();
                n
            }
        };
        self.ready.notify_all();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Status;
    use crate::message::{Event, MessageType};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn empty_queue_times_out() {
        let queue = MessageQueue::new(1);
        let started = Instant::now();
        assert!(queue.wait(Duration::from_millis(10)).unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_millis(10));
        assert_eq!(queue.outstanding(), 0);
    }

    #[test]
    fn delivers_in_push_order_and_tracks_leases() {
        let queue = MessageQueue::new(1);
        queue
            .push_all(vec![
                Envelope::success(Event::MatchingStarted),
                Envelope::success(Event::MatchingFinished),
            ])
            .unwrap();
        let first = queue.wait(Duration::ZERO).unwrap().unwrap();
        let second = queue.wait(Duration::ZERO).unwrap().unwrap();
        assert_eq!(first.message_type(), MessageType::MatchingStarted);
        assert_eq!(second.message_type(), MessageType::MatchingFinished);
        assert_eq!(queue.outstanding(), 2);
        drop(first);
        drop(second);
        assert_eq!(queue.outstanding(), 0);
    }

    #[test]
    fn waiter_wakes_on_push_from_other_thread() {
        let queue = Arc::new(MessageQueue::new(1));
        let producer = Arc::clone(&queue);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer
                .push(Envelope::new(Status::Timeout, Event::CaptureFinished))
                .unwrap();
        });
        let message = queue.wait(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(message.status(), Status::Timeout);
        handle.join().unwrap();
    }

    #[test]
    fn close_if_released_waits_for_leases() {
        let queue = MessageQueue::new(1);
        queue
            .push_all(vec![
                Envelope::success(Event::CaptureStarted),
                Envelope::success(Event::CaptureFinished),
            ])
            .unwrap();
        let held = queue.wait(Duration::ZERO).unwrap().unwrap();
        assert!(matches!(
            queue.close_if_released(),
            Err(PalmError::MemoryLeak { outstanding: 1 })
        ));
        assert_eq!(queue.pending(), 1);

        drop(held);
        assert_eq!(queue.close_if_released().unwrap(), 1);
        assert!(matches!(
            queue.close_if_released(),
            Err(PalmError::InvalidHandle)
        ));
    }

    #[test]
    fn blocked_waiter_wakes_to_closed_queue() {
        let queue = Arc::new(MessageQueue::new(1));
        let waiter = Arc::clone(&queue);
        let handle = thread::spawn(move || waiter.wait(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        queue.close_if_released().unwrap();
        assert!(queue.push(Envelope::success(Event::CaptureStarted)).is_err());
        assert!(matches!(
            handle.join().unwrap(),
            Err(PalmError::InvalidHandle)
        ));
    }

    #[test]
    fn closed_queue_rejects_traffic() {
        let queue = MessageQueue::new(1);
        queue.push(Envelope::success(Event::CaptureStarted)).unwrap();
        assert_eq!(queue.close(), 1);
        assert!(matches!(
            queue.push(Envelope::success(Event::CaptureStarted)),
            Err(PalmError::InvalidHandle)
        ));
        assert!(matches!(
            queue.wait(Duration::ZERO),
            Err(PalmError::InvalidHandle)
        ));
    }
}
