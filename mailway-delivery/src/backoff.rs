//! Retry backoff policies for the queue scheduler.
//!
//! A backoff maps `(envelope, attempts)` to the wait before the next
//! attempt; `None` permanently fails the message. The queue's default is
//! to never retry.

use std::{sync::Arc, time::Duration};

use mailway_common::Envelope;
use rand::Rng;

pub type Backoff = Arc<dyn Fn(&Envelope, u32) -> Option<Duration> + Send + Sync>;

/// Exponential backoff with jitter:
/// `delay = min(base * 2^(attempts - 1), max) * (1 ± jitter)`, giving up
/// after `max_attempts`.
pub fn exponential(
    base: Duration,
    max: Duration,
    jitter_factor: f64,
    max_attempts: u32,
) -> Backoff {
    Arc::new(move |_envelope, attempts| {
        if attempts >= max_attempts {
            return None;
        }
        Some(delay_for(attempts, base, max, jitter_factor))
    })
}

fn delay_for(attempts: u32, base: Duration, max: Duration, jitter_factor: f64) -> Duration {
    let exponent = attempts.saturating_sub(1);
    let delay_secs = if exponent >= 63 {
        max.as_secs()
    } else {
        base.as_secs()
            .saturating_mul(1u64 << exponent)
            .min(max.as_secs())
    };

    if jitter_factor <= 0.0 {
        return Duration::from_secs(delay_secs);
    }

    let jitter_range = (delay_secs as f64) * jitter_factor;
    let jitter: f64 = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
    Duration::from_secs(((delay_secs as f64) + jitter).max(0.0) as u64)
}

#[cfg(test)]
mod test {
    use super::*;

    fn envelope() -> Envelope {
        Envelope::new("sender@example.com")
    }

    #[test]
    fn doubles_per_attempt_without_jitter() {
        let backoff = exponential(
            Duration::from_secs(60),
            Duration::from_secs(86_400),
            0.0,
            25,
        );

        assert_eq!(backoff(&envelope(), 1), Some(Duration::from_secs(60)));
        assert_eq!(backoff(&envelope(), 2), Some(Duration::from_secs(120)));
        assert_eq!(backoff(&envelope(), 3), Some(Duration::from_secs(240)));
    }

    #[test]
    fn caps_at_max_delay() {
        let backoff = exponential(
            Duration::from_secs(60),
            Duration::from_secs(86_400),
            0.0,
            100,
        );
        assert_eq!(backoff(&envelope(), 40), Some(Duration::from_secs(86_400)));
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let backoff = exponential(Duration::from_secs(1), Duration::from_secs(10), 0.0, 3);
        assert!(backoff(&envelope(), 2).is_some());
        assert!(backoff(&envelope(), 3).is_none());
        assert!(backoff(&envelope(), 10).is_none());
    }

    #[test]
    fn jitter_stays_in_range() {
        let backoff = exponential(
            Duration::from_secs(100),
            Duration::from_secs(86_400),
            0.2,
            25,
        );
        for _ in 0..32 {
            let delay = backoff(&envelope(), 1).unwrap().as_secs();
            assert!((80..=120).contains(&delay), "delay {delay} out of range");
        }
    }
}
