use chrono::{DateTime, Timelike, Utc};
use oracle_core_types::Tier;
use std::collections::HashMap;
use std::sync::Mutex;

/// Per-tier ceilings: (per-minute, per-day). `None` means unlimited.
pub fn tier_limits(tier: Tier) -> Option<(u32, u32)> {
    match tier {
        Tier::Public => Some((100, 10_000)),
        Tier::Free => Some((500, 50_000)),
        Tier::Standard => Some((1_000, 100_000)),
        Tier::Premium => Some((5_000, 500_000)),
        Tier::Internal => None,
    }
}

#[derive(Debug, Clone, Copy)]
pub enum LimitDecision {
    Allowed {
        limit: u32,
        remaining: u32,
        reset_unix: i64,
    },
    MinuteExceeded {
        limit: u32,
        retry_after: u64,
        reset_unix: i64,
    },
    DayExceeded {
        limit: u32,
        retry_after: u64,
        reset_unix: i64,
    },
    Unlimited,
}

#[derive(Debug, Default)]
struct IdentityWindows {
    minute_start: i64,
    minute_count: u32,
    day_start: i64,
    day_count: u32,
}

/// Two fixed windows per identity: the current minute and the current UTC
/// day. Identities are API-key ids when a key is presented, client IPs
/// otherwise.
pub struct TierLimiter {
    windows: Mutex<HashMap<String, IdentityWindows>>,
}

impl TierLimiter {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Counts the request against both windows and decides. Limits come
    /// from the key row when present (admin-tunable per key) and from the
    /// tier table otherwise.
    pub fn check(
        &self,
        identity: &str,
        tier: Tier,
        key_limits: Option<(u32, u32)>,
        now: DateTime<Utc>,
    ) -> LimitDecision {
        let Some((per_minute, per_day)) = key_limits.or_else(|| tier_limits(tier)) else {
            return LimitDecision::Unlimited;
        };
        if per_minute == 0 && per_day == 0 {
            return LimitDecision::Unlimited;
        }

        let minute_start = now.timestamp() - now.second() as i64;
        let day_start = day_start_unix(now);
        let minute_reset = minute_start + 60;
        let day_reset = day_start + 86_400;

        let mut windows = self.windows.lock().expect("rate limit windows poisoned");
        let entry = windows.entry(identity.to_string()).or_default();

        if entry.minute_start != minute_start {
            entry.minute_start = minute_start;
            entry.minute_count = 0;
        }
        if entry.day_start != day_start {
            entry.day_start = day_start;
            entry.day_count = 0;
        }

        if entry.day_count >= per_day {
            return LimitDecision::DayExceeded {
                limit: per_day,
                retry_after: (day_reset - now.timestamp()).max(1) as u64,
                reset_unix: day_reset,
            };
        }
        if entry.minute_count >= per_minute {
            return LimitDecision::MinuteExceeded {
                limit: per_minute,
                retry_after: (minute_reset - now.timestamp()).max(1) as u64,
                reset_unix: minute_reset,
            };
        }

        entry.minute_count += 1;
        entry.day_count += 1;
        LimitDecision::Allowed {
            limit: per_minute,
            remaining: per_minute - entry.minute_count,
            reset_unix: minute_reset,
        }
    }

    /// Drops identities whose day window has lapsed; called from the
    /// periodic cleanup sweep.
    pub fn sweep(&self, now: DateTime<Utc>) {
        let day_start = day_start_unix(now);
        let mut windows = self.windows.lock().expect("rate limit windows poisoned");
        windows.retain(|_, entry| entry.day_start == day_start);
    }

    pub fn tracked_identities(&self) -> usize {
        self.windows
            .lock()
            .expect("rate limit windows poisoned")
            .len()
    }
}

fn day_start_unix(now: DateTime<Utc>) -> i64 {
    now.timestamp()
        - now.num_seconds_from_midnight() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 2, h, m, s).unwrap()
    }

    #[test]
    fn allows_up_to_the_minute_ceiling_then_rejects() {
        let limiter = TierLimiter::new();
        let now = at(10, 0, 30);
        for index in 0..500 {
            match limiter.check("key-free", Tier::Free, None, now) {
                LimitDecision::Allowed { limit, .. } => assert_eq!(limit, 500),
                other => panic!("request {index} unexpectedly limited: {other:?}"),
            }
        }
        match limiter.check("key-free", Tier::Free, None, now) {
            LimitDecision::MinuteExceeded {
                limit,
                retry_after,
                ..
            } => {
                assert_eq!(limit, 500);
                assert!(retry_after > 0);
            }
            other => panic!("expected minute limit, got {other:?}"),
        }
    }

    #[test]
    fn remaining_counts_down_and_resets_next_minute() {
        let limiter = TierLimiter::new();
        let now = at(10, 0, 0);
        match limiter.check("ip:1.2.3.4", Tier::Public, None, now) {
            LimitDecision::Allowed { remaining, .. } => assert_eq!(remaining, 99),
            other => panic!("unexpected: {other:?}"),
        }
        match limiter.check("ip:1.2.3.4", Tier::Public, None, at(10, 1, 0)) {
            LimitDecision::Allowed { remaining, .. } => assert_eq!(remaining, 99),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn day_ceiling_outlives_minute_windows() {
        let limiter = TierLimiter::new();
        // Custom key limits make the day window testable: 10/minute, 15/day.
        let limits = Some((10, 15));
        let mut granted = 0;
        for minute in 0..3 {
            for _ in 0..10 {
                if matches!(
                    limiter.check("key-custom", Tier::Free, limits, at(9, minute, 0)),
                    LimitDecision::Allowed { .. }
                ) {
                    granted += 1;
                }
            }
        }
        assert_eq!(granted, 15);
        match limiter.check("key-custom", Tier::Free, limits, at(9, 3, 0)) {
            LimitDecision::DayExceeded { limit, .. } => assert_eq!(limit, 15),
            other => panic!("expected day limit, got {other:?}"),
        }
    }

    #[test]
    fn internal_tier_is_unlimited() {
        let limiter = TierLimiter::new();
        for _ in 0..10_000 {
            assert!(matches!(
                limiter.check("key-internal", Tier::Internal, None, at(8, 0, 0)),
                LimitDecision::Unlimited
            ));
        }
    }

    #[test]
    fn identities_are_isolated() {
        let limiter = TierLimiter::new();
        let now = at(12, 0, 0);
        for _ in 0..100 {
            limiter.check("ip:a", Tier::Public, None, now);
        }
        assert!(matches!(
            limiter.check("ip:a", Tier::Public, None, now),
            LimitDecision::MinuteExceeded { .. }
        ));
        assert!(matches!(
            limiter.check("ip:b", Tier::Public, None, now),
            LimitDecision::Allowed { .. }
        ));
    }

    #[test]
    fn sweep_drops_stale_identities() {
        let limiter = TierLimiter::new();
        limiter.check("ip:a", Tier::Public, None, at(1, 0, 0));
        assert_eq!(limiter.tracked_identities(), 1);
        let next_day = Utc.with_ymd_and_hms(2026, 8, 3, 1, 0, 0).unwrap();
        limiter.sweep(next_day);
        assert_eq!(limiter.tracked_identities(), 0);
    }
}
