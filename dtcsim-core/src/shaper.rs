use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex as AsyncMutex;

use crate::clock::Clock;
use crate::delay_queue::DelayQueue;
use crate::profile::{Direction, EffectiveProfile};
use crate::Buffer;

/// Packets queued past this many entries are tail-dropped rather than
/// buffered forever.
pub const DEFAULT_HIGH_WATER_MARK: usize = 4096;

#[derive(Debug, Default, Clone, Copy)]
pub struct LossStats {
    pub total: u64,
    pub dropped: u64,
}

/// One direction's worth of shaping: loss decision, delay sampling, and the
/// [`DelayQueue`] that turns a sampled delay into a release time. A
/// [`crate::router::Router`] owns two of these (outbound, inbound) so that
/// each direction's randomness is independent and neither can starve the
/// other waiting on a shared lock.
pub struct Shaper {
    direction: Direction,
    profile: ArcSwap<EffectiveProfile>,
    // `StdRng` is not `Sync`; guarded by a lightweight async mutex since the
    // only contention is between concurrent `submit` callers.
    rng: AsyncMutex<StdRng>,
    queue: DelayQueue,
    total: AtomicU64,
    dropped: AtomicU64,
    high_water_mark: usize,
}

impl Shaper {
    pub fn new(direction: Direction, clock: Arc<dyn Clock>) -> Self {
        Self::with_seed(direction, clock, rand::thread_rng().gen())
    }

    pub fn with_seed(direction: Direction, clock: Arc<dyn Clock>, seed: u64) -> Self {
        Self {
            direction,
            profile: ArcSwap::from_pointee(EffectiveProfile::default()),
            rng: AsyncMutex::new(StdRng::seed_from_u64(seed)),
            queue: DelayQueue::new(clock),
            total: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }

    /// Atomically replaces the live profile. Previously-queued packets keep
    /// their already-assigned release times; this does not retro-delay
    /// in-flight data. Loss/delay statistics counters are reset.
    pub fn set_profile(&self, profile: &EffectiveProfile) {
        self.profile.store(Arc::new(profile.clone()));
        self.total.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
    }

    /// Runs `buffer` through the loss decision and delay sampler, then
    /// enqueues it (or drops it).
    pub async fn submit(&self, buffer: Buffer, now_ms: i64) {
        self.total.fetch_add(1, Ordering::Relaxed);

        if self.queue.len() >= self.high_water_mark {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            log::debug!("shaper: high-water mark reached, tail-dropping packet");
            return;
        }

        let profile = self.profile.load();
        let loss_pct = profile.loss_pct(self.direction);
        let delay_model = profile.delay_model(self.direction);

        let (u, v) = {
            let mut rng = self.rng.lock().await;
            (rng.gen::<f64>(), rng.gen::<f64>())
        };

        if loss_pct > 0.0 && u * 100.0 < loss_pct {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let delay_ms = delay_model.sample(v);
        self.queue.push(buffer, now_ms + delay_ms as i64);
    }

    /// Pops a packet whose release time has elapsed, waiting up to
    /// `max_wait_ms` for one to become ready.
    pub async fn drain(&self, max_wait_ms: u64) -> Option<Buffer> {
        self.queue.pop_ready_blocking(max_wait_ms).await
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn loss_stats(&self) -> LossStats {
        LossStats {
            total: self.total.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// The bandwidth cap configured for this direction, if any. Recorded
    /// for visibility in [`crate::stats::StatsSnapshot`]; `submit` does not
    /// yet enforce it; actual throttling is future work.
    pub fn configured_bandwidth_kbps(&self) -> Option<u32> {
        self.profile.load().bandwidth_kbps(self.direction)
    }
}
