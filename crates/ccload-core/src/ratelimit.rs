//! Per-IP login attempt limiter with exponential-feel lockout: a fixed
//! attempt budget, a lockout window once it is exceeded, and a reset
//! interval after which the counter starts over.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_LOCKOUT: Duration = Duration::from_secs(15 * 60);
const DEFAULT_RESET_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy)]
struct AttemptRecord {
    count: u32,
    last_attempt: Instant,
    lock_until: Option<Instant>,
}

pub struct LoginRateLimiter {
    records: Mutex<HashMap<IpAddr, AttemptRecord>>,
    max_attempts: u32,
    lockout: Duration,
    reset_interval: Duration,
}

impl Default for LoginRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl LoginRateLimiter {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_ATTEMPTS, DEFAULT_LOCKOUT, DEFAULT_RESET_INTERVAL)
    }

    pub fn with_limits(max_attempts: u32, lockout: Duration, reset_interval: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            max_attempts,
            lockout,
            reset_interval,
        }
    }

    /// Records one attempt and says whether it may proceed.
    pub fn allow_attempt(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut records = self.records.lock().expect("rate limiter lock");
        let record = records.entry(ip).or_insert(AttemptRecord {
            count: 0,
            last_attempt: now,
            lock_until: None,
        });

        if let Some(lock_until) = record.lock_until
            && now < lock_until
        {
            return false;
        }
        if now.duration_since(record.last_attempt) > self.reset_interval {
            record.count = 0;
        }

        record.count += 1;
        record.last_attempt = now;
        if record.count > self.max_attempts {
            record.lock_until = Some(now + self.lockout);
            return false;
        }
        true
    }

    /// Remaining lockout for an IP, if one is active.
    pub fn lockout_remaining(&self, ip: IpAddr) -> Option<Duration> {
        let now = Instant::now();
        self.records
            .lock()
            .expect("rate limiter lock")
            .get(&ip)
            .and_then(|record| record.lock_until)
            .and_then(|until| until.checked_duration_since(now))
    }

    /// A successful login forgets the IP entirely.
    pub fn record_success(&self, ip: IpAddr) {
        self.records.lock().expect("rate limiter lock").remove(&ip);
    }

    /// Drops entries that are both past the reset interval and no longer
    /// locked.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.records.lock().expect("rate limiter lock").retain(|_, record| {
            let stale = now.duration_since(record.last_attempt) > self.reset_interval;
            let locked = record.lock_until.is_some_and(|until| now < until);
            !stale || locked
        });
    }

    /// Hourly cleanup task. A stop signal triggers one final sweep before
    /// the task exits.
    pub fn spawn_cleanup(self: Arc<Self>, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.sweep(),
                    _ = stop.changed() => {
                        self.sweep();
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([127, 0, 0, last])
    }

    #[test]
    fn five_attempts_pass_then_lockout() {
        let limiter = LoginRateLimiter::new();
        for attempt in 1..=5 {
            assert!(limiter.allow_attempt(ip(1)), "attempt {attempt}");
        }
        assert!(!limiter.allow_attempt(ip(1)));

        let remaining = limiter.lockout_remaining(ip(1)).unwrap();
        assert!(remaining > Duration::from_secs(890));
        assert!(remaining <= Duration::from_secs(900));

        // Still locked on the next try.
        assert!(!limiter.allow_attempt(ip(1)));
    }

    #[test]
    fn success_clears_the_record() {
        let limiter = LoginRateLimiter::new();
        for _ in 0..6 {
            limiter.allow_attempt(ip(2));
        }
        assert!(limiter.lockout_remaining(ip(2)).is_some());

        limiter.record_success(ip(2));
        assert!(limiter.lockout_remaining(ip(2)).is_none());
        assert!(limiter.allow_attempt(ip(2)));
    }

    #[test]
    fn addresses_are_tracked_independently() {
        let limiter = LoginRateLimiter::new();
        for _ in 0..6 {
            limiter.allow_attempt(ip(3));
        }
        assert!(!limiter.allow_attempt(ip(3)));
        assert!(limiter.allow_attempt(ip(4)));
    }

    #[test]
    fn counter_resets_after_the_reset_interval() {
        let limiter =
            LoginRateLimiter::with_limits(2, Duration::from_secs(900), Duration::ZERO);
        // Reset interval of zero means every spaced-out attempt starts a
        // fresh window.
        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(2));
            assert!(limiter.allow_attempt(ip(5)));
        }
    }

    #[test]
    fn sweep_keeps_locked_entries() {
        let limiter = LoginRateLimiter::with_limits(1, Duration::from_secs(900), Duration::ZERO);
        limiter.allow_attempt(ip(6));
        std::thread::sleep(Duration::from_millis(2));
        limiter.allow_attempt(ip(6));
        assert!(limiter.lockout_remaining(ip(6)).is_some());

        // Past the reset interval but still locked: the record survives.
        std::thread::sleep(Duration::from_millis(2));
        limiter.sweep();
        assert!(limiter.lockout_remaining(ip(6)).is_some());
    }

    #[tokio::test]
    async fn cleanup_task_sweeps_once_on_stop() {
        let limiter = Arc::new(LoginRateLimiter::with_limits(
            1,
            Duration::ZERO,
            Duration::ZERO,
        ));
        limiter.allow_attempt(ip(7));
        std::thread::sleep(Duration::from_millis(2));

        let (tx, rx) = watch::channel(false);
        let handle = limiter.clone().spawn_cleanup(rx);
        tx.send(true).unwrap();
        handle.await.unwrap();

        // Entry was stale and unlocked, so the shutdown sweep removed it.
        assert!(limiter.records.lock().unwrap().is_empty());
    }
}
