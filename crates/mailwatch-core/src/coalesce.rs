//! Debounced coalescing of arrival bursts
//!
//! IDLE servers often announce one logical delivery as several EXISTS
//! updates in quick succession. Pending counts queue up (bounded) and the
//! last pusher within a quiet window drains them as a single summed fetch.

use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Quiet window after the last push before a drain
pub const QUIET_WINDOW: Duration = Duration::from_secs(2);
/// Pending-count queue capacity
pub const BURST_CAPACITY: usize = 3;
/// Retry pause when the queue is full
const FULL_RETRY: Duration = Duration::from_millis(250);

#[derive(Default)]
struct BurstQueue {
    counts: Vec<u32>,
    generation: u64,
}

/// Bounded queue of pending arrival counts with quiet-window draining
pub struct BurstCoalescer {
    quiet_window: Duration,
    inner: Mutex<BurstQueue>,
}

impl BurstCoalescer {
    pub fn new(quiet_window: Duration) -> Self {
        Self {
            quiet_window,
            inner: Mutex::new(BurstQueue::default()),
        }
    }

    /// Queue an arrival count. Blocks (with retries) while the queue is
    /// full. Returns `Some(total)` when this caller's quiet window expired
    /// with no later push, i.e. this caller owns the drain; `None` when a
    /// later push superseded it.
    pub async fn note(&self, count: u32) -> Option<u32> {
        let my_generation;
        loop {
            let mut queue = self.inner.lock().await;
            if queue.counts.len() < BURST_CAPACITY {
                queue.counts.push(count);
                queue.generation += 1;
                my_generation = queue.generation;
                break;
            }
            drop(queue);
            debug!("Arrival queue full; waiting");
            tokio::time::sleep(FULL_RETRY).await;
        }

        tokio::time::sleep(self.quiet_window).await;

        let mut queue = self.inner.lock().await;
        if queue.generation != my_generation {
            // A later push restarted the window; that caller drains
            return None;
        }
        let total = queue.counts.drain(..).sum();
        debug!("Draining arrival burst: {}", total);
        Some(total)
    }

    /// Number of counts currently pending
    pub async fn pending(&self) -> usize {
        self.inner.lock().await.counts.len()
    }
}

impl Default for BurstCoalescer {
    fn default() -> Self {
        Self::new(QUIET_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::{advance, Instant};

    #[tokio::test(start_paused = true)]
    async fn single_arrival_drains_after_quiet_window() {
        let coalescer = BurstCoalescer::default();
        let start = Instant::now();
        let drained = coalescer.note(1).await;
        assert_eq!(drained, Some(1));
        assert!(start.elapsed() >= QUIET_WINDOW);
        assert_eq!(coalescer.pending().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_within_window_drains_once_with_sum() {
        // Arrival count=1 at t=0, count=2 at t=1: one drain of 3 at t>=3
        let coalescer = Arc::new(BurstCoalescer::default());
        let start = Instant::now();

        let first = {
            let c = Arc::clone(&coalescer);
            tokio::spawn(async move { c.note(1).await })
        };
        advance(Duration::from_secs(1)).await;
        let second = {
            let c = Arc::clone(&coalescer);
            tokio::spawn(async move { c.note(2).await })
        };

        let first = first.await.unwrap();
        let second = second.await.unwrap();

        assert_eq!(first, None);
        assert_eq!(second, Some(3));
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert_eq!(coalescer.pending().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn separated_arrivals_drain_separately() {
        let coalescer = BurstCoalescer::default();
        assert_eq!(coalescer.note(2).await, Some(2));
        assert_eq!(coalescer.note(5).await, Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_makes_pusher_wait() {
        let coalescer = Arc::new(BurstCoalescer::default());

        // Fill the queue without letting any window elapse
        let mut tasks = Vec::new();
        for _ in 0..BURST_CAPACITY {
            let c = Arc::clone(&coalescer);
            tasks.push(tokio::spawn(async move { c.note(1).await }));
        }
        tokio::task::yield_now().await;
        assert_eq!(coalescer.pending().await, BURST_CAPACITY);

        // Fourth pusher has to wait for a drain before it can queue
        let c = Arc::clone(&coalescer);
        let fourth = tokio::spawn(async move { c.note(7).await });

        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }
        // The first three were drained together by exactly one owner
        assert_eq!(results.iter().filter(|r| r.is_some()).count(), 1);
        assert_eq!(results.iter().flatten().sum::<u32>(), 3);

        // The late pusher eventually gets its own drain
        assert_eq!(fourth.await.unwrap(), Some(7));
    }
}
