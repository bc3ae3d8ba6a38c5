use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Exponential backoff parameters shared by every retrying component.
///
/// A zero `max_elapsed_time` disables the elapsed-time limit; callers then
/// retry until success, a permanent error, or cancellation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffSettings {
    initial_interval: Duration,
    max_interval: Duration,
    max_elapsed_time: Duration,
    multiplier: f64,
    randomization_factor: f64,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum BackoffSettingsError {
    #[error("initial interval must be greater than zero")]
    ZeroInitialInterval,
    #[error("initial interval {initial:?} exceeds max interval {max:?}")]
    InitialAboveMax { initial: Duration, max: Duration },
    #[error("multiplier must be a finite value >= 1.0, got {0}")]
    InvalidMultiplier(f64),
    #[error("randomization factor must be within [0, 1), got {0}")]
    InvalidRandomization(f64),
}

impl BackoffSettings {
    pub const DEFAULT_MULTIPLIER: f64 = 1.5;
    pub const DEFAULT_RANDOMIZATION_FACTOR: f64 = 0.5;

    pub fn new(
        initial_interval: Duration,
        max_interval: Duration,
        max_elapsed_time: Duration,
        multiplier: f64,
        randomization_factor: f64,
    ) -> Result<Self, BackoffSettingsError> {
        if initial_interval.is_zero() {
            return Err(BackoffSettingsError::ZeroInitialInterval);
        }
        if initial_interval > max_interval {
            return Err(BackoffSettingsError::InitialAboveMax {
                initial: initial_interval,
                max: max_interval,
            });
        }
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(BackoffSettingsError::InvalidMultiplier(multiplier));
        }
        if !(0.0..1.0).contains(&randomization_factor) {
            return Err(BackoffSettingsError::InvalidRandomization(
                randomization_factor,
            ));
        }
        Ok(Self {
            initial_interval,
            max_interval,
            max_elapsed_time,
            multiplier,
            randomization_factor,
        })
    }

    /// Short-lived retries for the command channel.
    pub fn control_plane() -> Self {
        Self {
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_millis(200),
            max_elapsed_time: Duration::from_secs(3),
            multiplier: Self::DEFAULT_MULTIPLIER,
            randomization_factor: Self::DEFAULT_RANDOMIZATION_FACTOR,
        }
    }

    /// Long-lived retries for the metrics and events channels.
    pub fn data_plane() -> Self {
        Self {
            initial_interval: Duration::from_secs(10),
            max_interval: Duration::from_secs(60),
            max_elapsed_time: Duration::from_secs(120),
            multiplier: Self::DEFAULT_MULTIPLIER,
            randomization_factor: Self::DEFAULT_RANDOMIZATION_FACTOR,
        }
    }

    pub fn initial_interval(&self) -> Duration {
        self.initial_interval
    }

    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }

    pub fn max_elapsed_time(&self) -> Duration {
        self.max_elapsed_time
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn randomization_factor(&self) -> f64 {
        self.randomization_factor
    }

    /// Un-jittered wait before retry number `attempt` (zero based).
    pub fn base_interval(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let scaled = self.initial_interval.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_interval.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Jittered wait before retry number `attempt`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.jittered(self.base_interval(attempt), fastrand::f64())
    }

    fn jittered(&self, base: Duration, sample: f64) -> Duration {
        let base = base.as_secs_f64();
        let delta = self.randomization_factor * base;
        let value = base - delta + sample * (2.0 * delta);
        if value.is_finite() && value > 0.0 {
            Duration::from_secs_f64(value)
        } else {
            Duration::ZERO
        }
    }

    fn remaining(&self, elapsed: Duration) -> Option<Duration> {
        if self.max_elapsed_time.is_zero() {
            None
        } else {
            Some(self.max_elapsed_time.saturating_sub(elapsed))
        }
    }
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self::control_plane()
    }
}

/// Classification returned by a retried operation.
#[derive(Debug)]
pub enum Retry<E> {
    Transient(E),
    Permanent(E),
}

impl<E> Retry<E> {
    pub fn into_inner(self) -> E {
        match self {
            Retry::Transient(err) | Retry::Permanent(err) => err,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackoffError<E> {
    #[error("operation cancelled")]
    Cancelled,
    #[error("retries exhausted after {attempts} attempt(s) in {elapsed:?}: {last}")]
    Exhausted {
        attempts: u32,
        elapsed: Duration,
        #[source]
        last: E,
    },
    #[error(transparent)]
    Permanent(E),
}

impl<E> BackoffError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BackoffError::Cancelled)
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, BackoffError::Exhausted { .. })
    }

    /// The last error produced by the operation, if it ran at all.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            BackoffError::Cancelled => None,
            BackoffError::Exhausted { last, .. } => Some(last),
            BackoffError::Permanent(err) => Some(err),
        }
    }

    pub fn into_last_error(self) -> Option<E> {
        match self {
            BackoffError::Cancelled => None,
            BackoffError::Exhausted { last, .. } => Some(last),
            BackoffError::Permanent(err) => Some(err),
        }
    }
}

/// Runs `operation` until it succeeds, fails permanently, the elapsed budget
/// runs out, or `cancel` fires. Cancellation interrupts both an in-flight
/// attempt and a pending sleep.
pub async fn wait_until<T, E, F, Fut>(
    cancel: &CancellationToken,
    settings: &BackoffSettings,
    mut operation: F,
) -> Result<T, BackoffError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Retry<E>>>,
{
    let started = Instant::now();
    let mut attempts: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(BackoffError::Cancelled);
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BackoffError::Cancelled),
            outcome = operation() => outcome,
        };
        let retry_index = attempts;
        attempts = attempts.saturating_add(1);

        let last = match outcome {
            Ok(value) => return Ok(value),
            Err(Retry::Permanent(err)) => return Err(BackoffError::Permanent(err)),
            Err(Retry::Transient(err)) => err,
        };

        let elapsed = started.elapsed();
        let delay = match settings.remaining(elapsed) {
            Some(remaining) if remaining.is_zero() => {
                return Err(BackoffError::Exhausted {
                    attempts,
                    elapsed,
                    last,
                });
            }
            Some(remaining) => settings.next_delay(retry_index).min(remaining),
            None => settings.next_delay(retry_index),
        };
        trace!(attempts, delay_ms = delay.as_millis() as u64, "operation failed, backing off");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BackoffError::Cancelled),
            _ = sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, thiserror::Error, PartialEq)]
    #[error("boom {0}")]
    struct Boom(u32);

    fn settings(initial_ms: u64, max_ms: u64, elapsed_ms: u64) -> BackoffSettings {
        BackoffSettings::new(
            Duration::from_millis(initial_ms),
            Duration::from_millis(max_ms),
            Duration::from_millis(elapsed_ms),
            BackoffSettings::DEFAULT_MULTIPLIER,
            BackoffSettings::DEFAULT_RANDOMIZATION_FACTOR,
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_without_retry() {
        let cancel = CancellationToken::new();
        let result: Result<u32, BackoffError<Boom>> =
            wait_until(&cancel, &settings(10, 100, 1000), || async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_after_three_retries() {
        let cancel = CancellationToken::new();
        let invocations = AtomicU32::new(0);
        let result = wait_until(&cancel, &settings(1, 10, 300), || {
            let attempt = invocations.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt > 3 {
                    Ok(attempt)
                } else {
                    Err(Retry::Transient(Boom(attempt)))
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 4);
        assert_eq!(invocations.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_within_elapsed_window() {
        let cancel = CancellationToken::new();
        let settings = settings(10, 40, 300);
        let invocations = AtomicU32::new(0);
        let started = Instant::now();
        let result: Result<(), _> = wait_until(&cancel, &settings, || {
            let attempt = invocations.fetch_add(1, Ordering::SeqCst);
            async move { Err(Retry::Transient(Boom(attempt))) }
        })
        .await;
        let elapsed = started.elapsed();

        let err = result.unwrap_err();
        assert!(err.is_exhausted(), "unexpected error: {err}");
        assert!(elapsed >= settings.max_elapsed_time());
        assert!(elapsed < settings.max_elapsed_time() + settings.max_interval());
        let attempts = invocations.load(Ordering::SeqCst);
        match err {
            BackoffError::Exhausted {
                attempts: reported,
                last,
                ..
            } => {
                assert_eq!(reported, attempts);
                assert_eq!(last, Boom(attempts - 1));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_short_circuits() {
        let cancel = CancellationToken::new();
        let invocations = AtomicU32::new(0);
        let result: Result<(), _> = wait_until(&cancel, &settings(10, 100, 1000), || {
            invocations.fetch_add(1, Ordering::SeqCst);
            async { Err(Retry::Permanent(Boom(1))) }
        })
        .await;
        assert!(matches!(result, Err(BackoffError::Permanent(Boom(1)))));
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_sleep() {
        let cancel = CancellationToken::new();
        let settings = settings(60_000, 60_000, 600_000);
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(5)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let result: Result<(), _> = wait_until(&cancel, &settings, || async {
            Err(Retry::Transient(Boom(0)))
        })
        .await;
        assert!(result.unwrap_err().is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_inflight_operation() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(5)).await;
            trigger.cancel();
        });
        let result: Result<(), BackoffError<Boom>> =
            wait_until(&cancel, &settings(10, 100, 1000), || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    std::future::pending::<()>().await;
                    Ok(())
                }
            })
            .await;
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn already_cancelled_never_invokes() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let invocations = AtomicU32::new(0);
        let result: Result<(), BackoffError<Boom>> =
            wait_until(&cancel, &settings(10, 100, 1000), || {
                invocations.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn delays_stay_within_jitter_bounds() {
        let settings = settings(50, 200, 3000);
        for attempt in 0..32 {
            let base = settings.base_interval(attempt);
            assert!(base <= settings.max_interval());
            let spread = base.as_secs_f64() * settings.randomization_factor();
            let delay = settings.next_delay(attempt).as_secs_f64();
            assert!(delay >= base.as_secs_f64() - spread - 1e-9);
            assert!(delay <= base.as_secs_f64() + spread + 1e-9);
        }
    }

    #[test]
    fn base_interval_grows_then_caps() {
        let settings = settings(50, 200, 3000);
        assert_eq!(settings.base_interval(0), Duration::from_millis(50));
        assert_eq!(settings.base_interval(1), Duration::from_millis(75));
        assert_eq!(settings.base_interval(10), Duration::from_millis(200));
        assert_eq!(settings.base_interval(u32::MAX), Duration::from_millis(200));
    }

    #[test]
    fn jitter_extremes_never_negative() {
        let settings = settings(50, 200, 3000);
        let base = Duration::from_millis(100);
        assert_eq!(settings.jittered(base, 0.0), Duration::from_millis(50));
        assert!(settings.jittered(base, 1.0) <= Duration::from_millis(150));
        assert_eq!(settings.jittered(Duration::ZERO, 0.0), Duration::ZERO);
    }

    #[test]
    fn rejects_invalid_settings() {
        let ms = Duration::from_millis;
        assert_eq!(
            BackoffSettings::new(ms(0), ms(10), ms(10), 1.5, 0.5).unwrap_err(),
            BackoffSettingsError::ZeroInitialInterval
        );
        assert!(matches!(
            BackoffSettings::new(ms(20), ms(10), ms(10), 1.5, 0.5),
            Err(BackoffSettingsError::InitialAboveMax { .. })
        ));
        assert!(matches!(
            BackoffSettings::new(ms(1), ms(10), ms(10), 0.5, 0.5),
            Err(BackoffSettingsError::InvalidMultiplier(_))
        ));
        assert!(matches!(
            BackoffSettings::new(ms(1), ms(10), ms(10), 1.5, 1.0),
            Err(BackoffSettingsError::InvalidRandomization(_))
        ));
    }

    #[test]
    fn defaults_match_channel_profiles() {
        let control = BackoffSettings::control_plane();
        assert_eq!(control.initial_interval(), Duration::from_millis(50));
        assert_eq!(control.max_interval(), Duration::from_millis(200));
        assert_eq!(control.max_elapsed_time(), Duration::from_secs(3));
        let data = BackoffSettings::data_plane();
        assert_eq!(data.initial_interval(), Duration::from_secs(10));
        assert_eq!(data.max_elapsed_time(), Duration::from_secs(120));
    }
}
