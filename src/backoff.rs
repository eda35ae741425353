//! Delay applied by a flush driver after a batch is requeued.
//!
//! Attempt semantics: attempt `0` is the first submission (no delay); requeue number `n`
//! waits `delay(n)`. Exponential delays double per attempt and saturate at the configured cap
//! (or [`MAX_BACKOFF`]) instead of overflowing.
//!
//! ```rust
//! use std::time::Duration;
//! use opik_streamer::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100))
//!     .with_max(Duration::from_secs(1))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::ZERO);
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(3), Duration::from_millis(400));
//! assert_eq!(backoff.delay(9), Duration::from_secs(1));
//! ```

use rand::{rng, Rng};
use std::fmt;
use std::time::Duration;

/// Maximum delay used when calculations overflow (1 hour).
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffError {
    ConstantDoesNotSupportMax,
    MaxMustBePositive,
    MaxLessThanBase { base: Duration, max: Duration },
}

impl fmt::Display for BackoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffError::ConstantDoesNotSupportMax => {
                write!(f, "with_max is only valid for exponential backoff")
            }
            BackoffError::MaxMustBePositive => write!(f, "max must be greater than zero"),
            BackoffError::MaxLessThanBase { base, max } => {
                write!(f, "max ({:?}) must be >= base ({:?})", max, base)
            }
        }
    }
}

impl std::error::Error for BackoffError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackoffKind {
    Constant(Duration),
    Exponential { base: Duration, max: Option<Duration> },
}

/// How long to wait before resubmitting a requeued batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    kind: BackoffKind,
    jitter: Jitter,
}

impl Backoff {
    pub fn constant(delay: Duration) -> Self {
        Self { kind: BackoffKind::Constant(delay), jitter: Jitter::None }
    }

    pub fn exponential(base: Duration) -> Self {
        Self { kind: BackoffKind::Exponential { base, max: None }, jitter: Jitter::None }
    }

    /// Cap an exponential backoff. Errors on constant backoff, a zero max, or `max < base`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        match &mut self.kind {
            BackoffKind::Exponential { base, max: existing } => {
                if max < *base {
                    return Err(BackoffError::MaxLessThanBase { base: *base, max });
                }
                *existing = Some(max);
                Ok(self)
            }
            BackoffKind::Constant(_) => Err(BackoffError::ConstantDoesNotSupportMax),
        }
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn jitter(&self) -> Jitter {
        self.jitter
    }

    /// Un-jittered delay before attempt `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match self.kind {
            BackoffKind::Constant(delay) => delay.min(MAX_BACKOFF),
            BackoffKind::Exponential { base, max } => {
                let multiplier = 2u128.saturating_pow(attempt - 1);
                let nanos = base.as_nanos().saturating_mul(multiplier);
                let raw = Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64);
                max.map(|m| raw.min(m)).unwrap_or(raw).min(MAX_BACKOFF)
            }
        }
    }

    /// Delay with jitter applied, using the thread-local RNG.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        self.jitter.apply_with_rng(self.delay(attempt), &mut rng())
    }
}

impl Default for Backoff {
    /// 100ms doubling up to 5s, full jitter.
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential {
                base: Duration::from_millis(100),
                max: Some(Duration::from_secs(5)),
            },
            jitter: Jitter::Full,
        }
    }
}

/// Jitter strategy for spreading out requeue delays across streams and processes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Jitter {
    /// Exact backoff delay; deterministic.
    #[default]
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// Uniform in `[delay/2, delay]`.
    Equal,
}

impl Jitter {
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let millis: u64 = delay.as_millis().try_into().unwrap_or(u64::MAX);
        match self {
            Jitter::None => delay,
            _ if millis == 0 => Duration::ZERO,
            Jitter::Full => Duration::from_millis(rng.random_range(0..=millis)),
            Jitter::Equal => Duration::from_millis(rng.random_range(millis / 2..=millis)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn constant_backoff_returns_same_delay() {
        let backoff = Backoff::constant(Duration::from_secs(1));
        assert_eq!(backoff.delay(0), Duration::ZERO);
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(7), Duration::from_secs(1));
    }

    #[test]
    fn exponential_backoff_doubles_each_time() {
        let backoff = Backoff::exponential(Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(5), Duration::from_millis(1600));
    }

    #[test]
    fn exponential_backoff_respects_max() {
        let backoff = Backoff::exponential(Duration::from_millis(100))
            .with_max(Duration::from_secs(1))
            .unwrap();
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_secs(1));
        assert_eq!(backoff.delay(30), Duration::from_secs(1));
    }

    #[test]
    fn huge_attempts_saturate() {
        let backoff = Backoff::exponential(Duration::from_secs(1));
        assert_eq!(backoff.delay(u32::MAX), MAX_BACKOFF);
    }

    #[test]
    fn with_max_validation() {
        assert_eq!(
            Backoff::constant(Duration::from_secs(1)).with_max(Duration::from_secs(2)),
            Err(BackoffError::ConstantDoesNotSupportMax)
        );
        assert_eq!(
            Backoff::exponential(Duration::from_secs(1)).with_max(Duration::ZERO),
            Err(BackoffError::MaxMustBePositive)
        );
        assert!(matches!(
            Backoff::exponential(Duration::from_secs(10)).with_max(Duration::from_secs(1)),
            Err(BackoffError::MaxLessThanBase { .. })
        ));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let mut rng = StdRng::seed_from_u64(42);
        let delay = Duration::from_millis(1000);
        for _ in 0..100 {
            let full = Jitter::Full.apply_with_rng(delay, &mut rng);
            assert!(full <= delay);
            let equal = Jitter::Equal.apply_with_rng(delay, &mut rng);
            assert!(equal >= Duration::from_millis(500) && equal <= delay);
        }
        assert_eq!(Jitter::None.apply_with_rng(delay, &mut rng), delay);
        assert_eq!(Jitter::Full.apply_with_rng(Duration::ZERO, &mut rng), Duration::ZERO);
    }

    #[test]
    fn default_is_capped_and_jittered() {
        let backoff = Backoff::default();
        assert_eq!(backoff.jitter(), Jitter::Full);
        assert_eq!(backoff.delay(20), Duration::from_secs(5));
        assert!(backoff.jittered_delay(3) <= Duration::from_millis(400));
    }
}
