use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::clock::Clock;
use crate::Buffer;

struct DelayedPacket {
    buffer: Buffer,
    release_at_ms: i64,
    seq: u64,
}

impl PartialEq for DelayedPacket {
    fn eq(&self, other: &Self) -> bool {
        self.release_at_ms == other.release_at_ms && self.seq == other.seq
    }
}
impl Eq for DelayedPacket {}

impl PartialOrd for DelayedPacket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedPacket {
    // `BinaryHeap` is a max-heap; we want the packet with the smallest
    // `release_at_ms` (and, on ties, the smallest `seq`, i.e. inserted
    // first) to compare as the greatest so it sits at the heap's head.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .release_at_ms
            .cmp(&self.release_at_ms)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner {
    heap: BinaryHeap<DelayedPacket>,
    next_seq: u64,
}

/// A min-heap of packets keyed by release time, shared between a producer
/// (the [`crate::shaper::Shaper`]) and a drainer task. Thread-safe; pushing
/// wakes any task blocked in [`DelayQueue::pop_ready_blocking`].
pub struct DelayQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    clock: Arc<dyn Clock>,
    len: AtomicU64,
}

impl DelayQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            notify: Notify::new(),
            clock,
            len: AtomicU64::new(0),
        }
    }

    /// Enqueues `buffer` to be released no earlier than `release_at_ms`.
    pub fn push(&self, buffer: Buffer, release_at_ms: i64) {
        let mut guard = self.inner.lock().unwrap();
        let seq = guard.next_seq;
        guard.next_seq += 1;
        guard.heap.push(DelayedPacket {
            buffer,
            release_at_ms,
            seq,
        });
        self.len.fetch_add(1, AtomicOrdering::Relaxed);
        drop(guard);
        self.notify.notify_waiters();
    }

    /// Pops the head iff it is ready now. Never blocks.
    pub fn pop_ready(&self) -> Option<Buffer> {
        let now = self.clock.now_ms();
        let mut guard = self.inner.lock().unwrap();
        self.pop_ready_locked(&mut guard, now)
    }

    fn pop_ready_locked(&self, guard: &mut Inner, now: i64) -> Option<Buffer> {
        if guard.heap.peek().map(|p| p.release_at_ms <= now) == Some(true) {
            let packet = guard.heap.pop().unwrap();
            self.len.fetch_sub(1, AtomicOrdering::Relaxed);
            Some(packet.buffer)
        } else {
            None
        }
    }

    /// Waits until either the head becomes ready or `max_wait_ms` elapses,
    /// whichever is first, re-checking under lock after every wake. Returns
    /// `None` if no packet became ready within the window.
    pub async fn pop_ready_blocking(&self, max_wait_ms: u64) -> Option<Buffer> {
        let deadline = self.clock.now_ms() + max_wait_ms as i64;
        loop {
            let notified = self.notify.notified();
            let now = self.clock.now_ms();
            let wait_ms = {
                let mut guard = self.inner.lock().unwrap();
                if let Some(buf) = self.pop_ready_locked(&mut guard, now) {
                    return Some(buf);
                }
                let remaining = deadline - now;
                if remaining <= 0 {
                    return None;
                }
                match guard.heap.peek() {
                    Some(head) => (head.release_at_ms - now).clamp(0, remaining),
                    None => remaining,
                }
            };
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(Duration::from_millis(wait_ms as u64)) => {}
            }
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(AtomicOrdering::Relaxed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn queue() -> (Arc<ManualClock>, DelayQueue) {
        let clock = Arc::new(ManualClock::new());
        let queue = DelayQueue::new(clock.clone());
        (clock, queue)
    }

    #[test]
    fn pop_ready_returns_none_when_head_not_due() {
        let (clock, q) = queue();
        q.push(vec![1], 100);
        clock.set(50);
        assert!(q.pop_ready().is_none());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn pop_ready_returns_head_when_due() {
        let (clock, q) = queue();
        q.push(vec![1], 100);
        clock.set(100);
        assert_eq!(q.pop_ready(), Some(vec![1]));
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn fifo_tie_break_on_equal_release_time() {
        let (clock, q) = queue();
        q.push(vec![b'A'], 10);
        q.push(vec![b'B'], 10);
        clock.set(10);
        assert_eq!(q.pop_ready(), Some(vec![b'A']));
        assert_eq!(q.pop_ready(), Some(vec![b'B']));
    }

    #[tokio::test(start_paused = true)]
    async fn pop_ready_blocking_wakes_on_push() {
        let clock = Arc::new(crate::clock::SystemClock::new());
        let q = Arc::new(DelayQueue::new(clock));
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.pop_ready_blocking(5_000).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.push(vec![42], 0);
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("task did not finish")
            .unwrap();
        assert_eq!(result, Some(vec![42]));
    }

    #[tokio::test(start_paused = true)]
    async fn pop_ready_blocking_times_out_when_empty() {
        let clock = Arc::new(crate::clock::SystemClock::new());
        let q = DelayQueue::new(clock);
        let result = q.pop_ready_blocking(20).await;
        assert_eq!(result, None);
    }
}
