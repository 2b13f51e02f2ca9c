use std::time::Duration;

/// Delay policy applied to a receiver after consecutive transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Always wait the same amount of time.
    Fixed(Duration),
    /// Wait `initial * multiplier^(failures - 1)`, capped at `max`.
    Exponential {
        initial: Duration,
        max: Duration,
        multiplier: u32,
    },
}

impl Backoff {
    /// Delay before polling again after `failures` consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let factor = multiplier.saturating_pow(failures.saturating_sub(1));
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(30),
            multiplier: 2,
        }
    }
}

/// What to do with an envelope whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Discard it through [`Receiver::reject`](crate::Receiver::reject).
    #[default]
    Reject,
    /// Leave it unresolved; the backend redelivers it once its liveness
    /// timeout expires.
    Abandon,
}

/// Worker settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Backoff after transport failures while polling.
    pub backoff: Backoff,
    /// How long a receiver is skipped after returning an empty batch.
    pub idle_delay: Duration,
    /// Maximum number of envelopes of one batch handled at the same time.
    pub concurrency: usize,
    pub on_failure: FailurePolicy,
    /// How long the current batch may keep running after cancellation.
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            idle_delay: Duration::from_secs(1),
            concurrency: 1,
            on_failure: FailurePolicy::default(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}
