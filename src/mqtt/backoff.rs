//! Reconnect delay schedule
//!
//! Delays grow geometrically from `initial_ms` up to `max_ms`. Jitter only
//! removes part of the most recent growth step, so every delay stays strictly
//! above the previous one until the cap is reached.

use super::config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    /// Un-jittered delay handed out last, `None` after a reset
    last_base_ms: Option<f64>,
    last_delay_ms: Option<u64>,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            last_base_ms: None,
            last_delay_ms: None,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let initial = self.config.initial_ms as f64;
        let cap = self.config.max_ms as f64;

        let (floor, base) = match self.last_base_ms {
            None => (0.0, initial.min(cap)),
            Some(previous) => (previous, (previous * self.config.factor).min(cap)),
        };
        self.last_base_ms = Some(base);

        // never shave below the previous base; the first delay has no step
        let step = if floor > 0.0 { base - floor } else { 0.0 };
        let shaved = step * self.config.jitter * rand::thread_rng().gen::<f64>();

        let mut delay_ms = (base - shaved).round() as u64;
        // rounding can swallow a sub-millisecond step
        if let Some(previous) = self.last_delay_ms {
            if delay_ms <= previous {
                delay_ms = (previous + 1).min(self.config.max_ms);
            }
        }
        self.last_delay_ms = Some(delay_ms);

        Duration::from_millis(delay_ms)
    }

    /// Back to `initial_ms` after a connection made it to `Ready`
    pub fn reset(&mut self) {
        self.last_base_ms = None;
        self.last_delay_ms = None;
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.config.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BackoffConfig {
        BackoffConfig {
            initial_ms: 1000,
            max_ms: 20_000,
            factor: 1.5,
            jitter: 0.9,
            max_attempts: None,
        }
    }

    #[test]
    fn first_delay_is_initial() {
        let mut backoff = Backoff::new(config());
        assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
    }

    #[test]
    fn delays_strictly_increase_until_cap() {
        // jitter is random, so run the schedule many times
        for _ in 0..200 {
            let mut backoff = Backoff::new(config());
            let mut previous = backoff.next_delay();
            let mut reached_cap = false;

            for _ in 0..30 {
                let delay = backoff.next_delay();
                if previous == Duration::from_millis(20_000) {
                    assert_eq!(delay, previous);
                    reached_cap = true;
                } else {
                    assert!(delay > previous, "{delay:?} not above {previous:?}");
                }
                assert!(delay <= Duration::from_millis(20_000));
                previous = delay;
            }
            assert!(reached_cap);
        }
    }

    #[test]
    fn reset_returns_to_minimum() {
        let mut backoff = Backoff::new(config());
        for _ in 0..5 {
            backoff.next_delay();
        }
        assert!(backoff.next_delay() > Duration::from_millis(1000));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
    }

    #[test]
    fn tiny_factor_still_grows_every_attempt() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial_ms: 1000,
            max_ms: 1010,
            factor: 1.0001,
            jitter: 0.0,
            max_attempts: None,
        });

        let delays: Vec<u64> = (0..12)
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect();
        assert_eq!(delays[..11], (1000..=1010u64).collect::<Vec<u64>>()[..]);
        assert_eq!(delays[11], 1010);
    }

    #[test]
    fn initial_above_cap_is_clamped() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial_ms: 5000,
            max_ms: 5000,
            ..config()
        });
        assert_eq!(backoff.next_delay(), Duration::from_millis(5000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(5000));
    }
}
