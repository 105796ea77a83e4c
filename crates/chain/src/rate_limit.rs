use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time;

/// Paces outbound upstream calls to a sustained rate with a bounded burst
/// allowance. Rather than accounting tokens, each acquisition reserves the
/// next slot on a shared schedule and sleeps until its reservation comes
/// up; the burst tolerance lets reservations run ahead of real time by a
/// fixed window. A zero rate disables pacing (no pacer is constructed).
#[derive(Debug)]
pub struct RpcPacer {
    /// Spacing between consecutive slots at the sustained rate.
    slot_interval: Duration,
    /// How far the schedule may run ahead of the clock before callers
    /// start sleeping.
    burst_window: Duration,
    next_slot: AsyncMutex<Instant>,
}

impl RpcPacer {
    pub fn new(rate_per_second: u64, burst: u64) -> Option<Arc<Self>> {
        if rate_per_second == 0 {
            return None;
        }
        let slot_interval = Duration::from_secs_f64(1.0 / rate_per_second as f64);
        let burst_window = slot_interval.saturating_mul(burst.max(1).saturating_sub(1) as u32);
        Some(Arc::new(Self {
            slot_interval,
            burst_window,
            next_slot: AsyncMutex::new(Instant::now()),
        }))
    }

    pub async fn acquire(&self) {
        let wait = {
            let mut next_slot = self.next_slot.lock().await;
            let now = Instant::now();
            // An idle schedule never banks more than the burst window.
            let reserved = if *next_slot > now { *next_slot } else { now };
            *next_slot = reserved + self.slot_interval;
            reserved.saturating_duration_since(now + self.burst_window)
        };
        if !wait.is_zero() {
            time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_rate_disables_pacing() {
        assert!(RpcPacer::new(0, 10).is_none());
    }

    #[tokio::test]
    async fn burst_window_admits_without_sleeping() {
        let pacer = RpcPacer::new(1, 3).expect("pacer");
        let started = Instant::now();
        for _ in 0..3 {
            pacer.acquire().await;
        }
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn schedule_past_the_burst_window_sleeps() {
        let pacer = RpcPacer::new(10, 1).expect("pacer");
        pacer.acquire().await;
        let started = Instant::now();
        pacer.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn sustained_rate_spaces_reservations_by_the_interval() {
        let pacer = RpcPacer::new(20, 1).expect("pacer");
        let started = Instant::now();
        for _ in 0..4 {
            pacer.acquire().await;
        }
        // Three paced waits at 50 ms each after the free first slot.
        assert!(started.elapsed() >= Duration::from_millis(140));
    }
}
