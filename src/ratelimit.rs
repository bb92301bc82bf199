//! Sliding-window admission control for outbound transcription calls.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

/// Outcome of one admission attempt.
#[derive(Debug, Clone, Copy)]
pub struct Admission {
    pub admitted: bool,
    /// How long to wait before the window has room again. Zero when admitted.
    pub wait: Duration,
}

/// Admits at most `max_requests` calls per `window`. Thread-safe, no I/O;
/// callers are responsible for sleeping out the returned wait.
pub struct RateLimiter {
    window: Duration,
    max_requests: usize,
    requests: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(cfg: &RateLimitConfig) -> Self {
        Self {
            window: Duration::from_secs(cfg.window_seconds),
            max_requests: cfg.max_requests,
            requests: Mutex::new(VecDeque::new()),
        }
    }

    /// Try to admit a request now. Admission records the current time; a
    /// refusal computes the wait until the oldest in-window request expires.
    pub fn acquire(&self) -> Admission {
        let now = Instant::now();
        let mut requests = self.requests.lock().unwrap_or_else(|p| p.into_inner());

        while let Some(oldest) = requests.front() {
            if now.duration_since(*oldest) >= self.window {
                requests.pop_front();
            } else {
                break;
            }
        }

        if requests.len() < self.max_requests {
            requests.push_back(now);
            return Admission {
                admitted: true,
                wait: Duration::ZERO,
            };
        }

        // requests is non-empty here: max_requests is validated > 0.
        let oldest = *requests.front().expect("window non-empty at capacity");
        let wait = self.window.saturating_sub(now.duration_since(oldest));
        Admission {
            admitted: false,
            wait,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(window_seconds: u64, max_requests: usize) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            window_seconds,
            max_requests,
        })
    }

    #[test]
    fn admits_up_to_capacity() {
        let limiter = limiter(10, 3);
        for _ in 0..3 {
            assert!(limiter.acquire().admitted);
        }

        let refused = limiter.acquire();
        assert!(!refused.admitted);
        assert!(refused.wait > Duration::ZERO);
        assert!(refused.wait <= Duration::from_secs(10));
    }

    #[test]
    fn refusal_does_not_consume_a_slot() {
        let limiter = limiter(10, 1);
        assert!(limiter.acquire().admitted);

        // Repeated refusals should not push the wait further out.
        let first = limiter.acquire();
        let second = limiter.acquire();
        assert!(!first.admitted);
        assert!(!second.admitted);
        assert!(second.wait <= first.wait);
    }

    #[test]
    fn window_expiry_frees_slots() {
        let limiter = limiter(1, 2);
        assert!(limiter.acquire().admitted);
        assert!(limiter.acquire().admitted);
        assert!(!limiter.acquire().admitted);

        std::thread::sleep(Duration::from_millis(1_050));
        assert!(limiter.acquire().admitted);
    }

    #[test]
    fn concurrent_acquires_never_exceed_capacity() {
        let limiter = std::sync::Arc::new(limiter(60, 10));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = limiter.clone();
            handles.push(std::thread::spawn(move || {
                (0..5).filter(|_| limiter.acquire().admitted).count()
            }));
        }

        let admitted: usize = handles
            .into_iter()
            .map(|h| h.join().expect("thread panicked"))
            .sum();
        assert_eq!(admitted, 10);
    }
}
