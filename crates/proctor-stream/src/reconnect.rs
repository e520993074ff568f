use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Consecutive failed attempts after which connectivity is reported as degraded.
    pub degraded_after: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            degraded_after: 5,
        }
    }
}

/// Exponential backoff bounded by a ceiling.
///
/// Retries never run out; [`Backoff::reset`] is called after every successful
/// connect so the next outage starts from the initial delay again.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    next: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let next = policy.initial_delay.min(policy.max_delay);
        Self {
            policy,
            next,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.attempt = self.attempt.saturating_add(1);
        let grown = delay.mul_f64(self.policy.multiplier.max(1.0));
        self.next = grown.min(self.policy.max_delay);
        delay
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_degraded(&self) -> bool {
        self.policy.degraded_after > 0 && self.attempt >= self.policy.degraded_after
    }

    pub fn reset(&mut self) {
        self.next = self.policy.initial_delay.min(self.policy.max_delay);
        self.attempt = 0;
    }
}

/// Signaling connectivity as surfaced to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connectivity {
    Connecting,
    Connected,
    Reconnecting { attempt: u32, delay: Duration },
    Degraded { attempt: u32 },
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            multiplier: 2.0,
            degraded_after: 3,
        }
    }

    #[test]
    fn delays_grow_until_the_ceiling() {
        let mut backoff = Backoff::new(policy());
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(400),
                Duration::from_millis(400),
            ]
        );
    }

    #[test]
    fn three_failures_then_success_restarts_from_initial_delay() {
        let mut backoff = Backoff::new(policy());
        let first = backoff.next_delay();
        let second = backoff.next_delay();
        let third = backoff.next_delay();
        assert!(first < second && second < third);
        assert!(backoff.is_degraded());

        backoff.reset();

        assert_eq!(backoff.attempt(), 0);
        assert!(!backoff.is_degraded());
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn multiplier_below_one_never_shrinks_delays() {
        let mut backoff = Backoff::new(ReconnectPolicy {
            multiplier: 0.5,
            ..policy()
        });
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}
