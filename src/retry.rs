//! Bounded backoff for polling a condition.
//!
//! Used both while waiting for the reconcile lease and while waiting for the
//! token controller to populate a secret.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

/// Backoff parameters.
///
/// The delay before retry `n` (0-based) is `initial_delay * factor^n`, capped
/// at `cap`, plus a random extra of up to `jitter` times that delay.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Backoff {
    pub initial_delay_ms: u64,
    pub factor: f64,
    pub jitter: f64,
    /// Maximum number of times the condition is evaluated.
    pub steps: u32,
    pub cap_ms: Option<u64>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::lease()
    }
}

impl Backoff {
    /// Lease acquisition: nominally constant 500ms, jittered up to 2x, 50 attempts.
    pub fn lease() -> Self {
        Self {
            initial_delay_ms: 500,
            factor: 1.0,
            jitter: 1.0,
            steps: 50,
            cap_ms: None,
        }
    }

    /// Population wait: 2ms doubling up to 100ms, 50 polls.
    pub fn populate() -> Self {
        Self {
            initial_delay_ms: 2,
            factor: 2.0,
            jitter: 0.0,
            steps: 50,
            cap_ms: Some(100),
        }
    }

    /// Delay before the retry following failed attempt `step` (0-based).
    /// `random` must be in `[0, 1)`.
    pub fn delay_for(&self, step: u32, random: f64) -> Duration {
        let exponent = i32::try_from(step).unwrap_or(i32::MAX);
        let mut base = self.initial_delay_ms as f64 * self.factor.max(0.0).powi(exponent);
        if let Some(cap) = self.cap_ms {
            base = base.min(cap as f64);
        }
        if !base.is_finite() {
            base = self.cap_ms.unwrap_or(u64::MAX) as f64;
        }
        let jittered = base + base * self.jitter.max(0.0) * random.clamp(0.0, 1.0);
        Duration::from_nanos((jittered * 1_000_000.0).round() as u64)
    }

    /// Upper bound on the total time spent sleeping between attempts.
    pub fn max_total_delay(&self) -> Duration {
        (0..self.steps.saturating_sub(1))
            .map(|step| self.delay_for(step, 1.0))
            .sum()
    }
}

/// Why [`poll_with_backoff`] gave up.
#[derive(Debug, PartialEq, Eq)]
pub enum BackoffError<E> {
    /// The condition never succeeded within `steps` attempts.
    Exhausted { attempts: u32 },
    Cancelled { attempts: u32 },
    /// The condition returned an error; it is not retried.
    Failed { attempts: u32, error: E },
}

/// Evaluate `condition` until it yields a value, sleeping between attempts.
///
/// The first attempt runs immediately. `Ok(None)` means "not yet", `Ok(Some)`
/// ends the loop, `Err` aborts without further retries. Returns the value and
/// the number of attempts it took.
pub async fn poll_with_backoff<T, E, F, Fut>(
    backoff: &Backoff,
    cancel: &CancellationToken,
    mut condition: F,
) -> Result<(T, u32), BackoffError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let steps = backoff.steps.max(1);
    for step in 0..steps {
        let attempts = step + 1;
        if cancel.is_cancelled() {
            return Err(BackoffError::Cancelled { attempts: step });
        }
        match condition(attempts).await {
            Ok(Some(value)) => return Ok((value, attempts)),
            Ok(None) => {}
            Err(error) => return Err(BackoffError::Failed { attempts, error }),
        }
        if attempts == steps {
            break;
        }
        let random = if backoff.jitter > 0.0 {
            rand::rng().random::<f64>()
        } else {
            0.0
        };
        let delay = backoff.delay_for(step, random);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BackoffError::Cancelled { attempts }),
            _ = tokio::time::sleep(delay) => {}
        }
    }
    Err(BackoffError::Exhausted { attempts: steps })
}
