use std::future::Future;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::select;

use crate::cancel::CancellationToken;

/// Push policy value selecting the uniform backoff schedule.
pub const BACKOFF_RETRY: &str = "BACKOFF_RETRY";
/// Push policy value selecting the exponential decay schedule.
pub const EXPONENTIAL_DECAY_RETRY: &str = "EXPONENTIAL_DECAY_RETRY";

const BACKOFF_RETRY_TIMES: u32 = 3;
const BACKOFF_RETRY_MIN_SECONDS: u64 = 10;
const BACKOFF_RETRY_MAX_SECONDS: u64 = 20;
const EXP_DECAY_MAX_SLEEP_SECONDS: u64 = 512;

/// A bounded reattempt schedule for a failed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// A fixed number of retries with a uniformly random pause.
    /// Suited to transient remote failures of unknown character.
    Backoff { retries: u32, seed: Option<u64> },
    /// Doubling pause capped at 512 seconds. Suited to sustained outages
    /// where hammering the endpoint only makes things worse.
    ExponentialDecay { retries: u32 },
    /// Single attempt, no retries.
    None,
}

impl Schedule {
    pub fn backoff() -> Self {
        Self::Backoff {
            retries: BACKOFF_RETRY_TIMES,
            seed: None,
        }
    }

    /// Backoff schedule with a deterministic delay sequence.
    pub fn backoff_seeded(seed: u64) -> Self {
        Self::Backoff {
            retries: BACKOFF_RETRY_TIMES,
            seed: Some(seed),
        }
    }

    pub fn exponential_decay(retries: u32) -> Self {
        Self::ExponentialDecay { retries }
    }

    /// Resolves a subscription's `push_policy` option. Unrecognized or
    /// absent values mean no retries.
    pub fn from_push_policy(policy: Option<&str>, max_notifier_retries: u32) -> Self {
        match policy {
            Some(BACKOFF_RETRY) => Self::backoff(),
            Some(EXPONENTIAL_DECAY_RETRY) => Self::exponential_decay(max_notifier_retries),
            _ => Self::None,
        }
    }

    /// Number of reattempts after the initial attempt.
    pub fn retries(&self) -> u32 {
        match self {
            Self::Backoff { retries, .. } => *retries,
            Self::ExponentialDecay { retries } => *retries,
            Self::None => 0,
        }
    }

    pub fn delays(&self) -> Delays {
        match self {
            Self::Backoff { retries, seed } => Delays::Backoff {
                remaining: *retries,
                rng: match seed {
                    Some(seed) => StdRng::seed_from_u64(*seed),
                    None => StdRng::from_entropy(),
                },
            },
            Self::ExponentialDecay { retries } => Delays::ExponentialDecay {
                remaining: *retries,
                exponent: 0,
            },
            Self::None => Delays::None,
        }
    }
}

/// Iterator over the sleep durations of a [`Schedule`], one per retry.
pub enum Delays {
    Backoff { remaining: u32, rng: StdRng },
    ExponentialDecay { remaining: u32, exponent: u32 },
    None,
}

impl Iterator for Delays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        match self {
            Self::Backoff { remaining, rng } => {
                if *remaining == 0 {
                    return None;
                }
                *remaining -= 1;
                Some(Duration::from_secs(
                    rng.gen_range(BACKOFF_RETRY_MIN_SECONDS..=BACKOFF_RETRY_MAX_SECONDS),
                ))
            }
            Self::ExponentialDecay {
                remaining,
                exponent,
            } => {
                if *remaining == 0 {
                    return None;
                }
                *remaining -= 1;
                // 2^9 already hits the cap, so saturate there.
                let secs = if *exponent >= 9 {
                    EXP_DECAY_MAX_SLEEP_SECONDS
                } else {
                    1u64 << *exponent
                };
                *exponent += 1;
                Some(Duration::from_secs(secs))
            }
            Self::None => None,
        }
    }
}

/// Terminal result of a retried delivery.
#[derive(Debug)]
pub enum Outcome<T, E> {
    /// An attempt succeeded.
    Delivered { attempts: u32, value: T },
    /// Every attempt failed and the schedule is exhausted.
    Failed { attempts: u32, last_error: E },
    /// The caller cancelled between attempts or during a backoff sleep.
    Cancelled { attempts: u32 },
}

impl<T, E> Outcome<T, E> {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Delivered { attempts, .. } => *attempts,
            Self::Failed { attempts, .. } => *attempts,
            Self::Cancelled { attempts } => *attempts,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// Runs `attempt` once, then up to `schedule.retries()` more times, sleeping
/// the schedule's delay before each reattempt.
///
/// Cancellation is checked before every attempt and raced against every
/// sleep; a cancelled sleep ends immediately. Errors never propagate out of
/// this function, only into the returned [`Outcome`].
pub async fn invoke<T, E, A>(
    cancel: Option<CancellationToken>,
    schedule: Schedule,
    mut attempt: impl FnMut() -> A,
) -> Outcome<T, E>
where
    A: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts: u32 = 0;
    if cancel.as_ref().map(|c| c.is_cancelled()).unwrap_or(false) {
        return Outcome::Cancelled { attempts };
    }

    attempts += 1;
    let mut last_error = match attempt().await {
        Ok(value) => return Outcome::Delivered { attempts, value },
        Err(e) => e,
    };

    for delay in schedule.delays() {
        tracing::debug!(
            "delivery attempt {} failed, sleeping {:?} before retry: {}",
            attempts,
            delay,
            last_error
        );
        if sleep_cancelled(cancel.as_ref(), delay).await {
            return Outcome::Cancelled { attempts };
        }
        attempts += 1;
        match attempt().await {
            Ok(value) => return Outcome::Delivered { attempts, value },
            Err(e) => last_error = e,
        }
    }
    Outcome::Failed {
        attempts,
        last_error,
    }
}

/// Sleeps for `delay`, returning true if cancellation fired first.
async fn sleep_cancelled(cancel: Option<&CancellationToken>, delay: Duration) -> bool {
    match cancel {
        Some(token) => {
            select! {
                _ = token.cancelled() => true,
                _ = tokio::time::sleep(delay) => false,
            }
        }
        None => {
            tokio::time::sleep(delay).await;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering::SeqCst};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn exponential_delays_double_then_cap() {
        let delays: Vec<u64> = Schedule::exponential_decay(12)
            .delays()
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(
            delays,
            vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 512, 512]
        );
    }

    #[test]
    fn backoff_delays_stay_in_range_and_are_reproducible() {
        let first: Vec<u64> = Schedule::backoff_seeded(7)
            .delays()
            .map(|d| d.as_secs())
            .collect();
        let second: Vec<u64> = Schedule::backoff_seeded(7)
            .delays()
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
        for secs in first {
            assert!((10..=20).contains(&secs), "delay {} out of range", secs);
        }
    }

    #[test]
    fn unknown_policy_means_no_retries() {
        assert_eq!(Schedule::from_push_policy(None, 10), Schedule::None);
        assert_eq!(
            Schedule::from_push_policy(Some("NO_SUCH_POLICY"), 10),
            Schedule::None
        );
        assert_eq!(
            Schedule::from_push_policy(Some(BACKOFF_RETRY), 10).retries(),
            3
        );
        assert_eq!(
            Schedule::from_push_policy(Some(EXPONENTIAL_DECAY_RETRY), 7).retries(),
            7
        );
    }

    #[tokio::test(start_paused = true)]
    async fn all_failures_exhaust_exactly_one_plus_n_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome: Outcome<(), &str> = invoke(None, Schedule::exponential_decay(5), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, SeqCst);
                Err("boom")
            }
        })
        .await;
        match outcome {
            Outcome::Failed {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 6);
                assert_eq!(last_error, "boom");
            }
            other => panic!("expected Failed, got {:?}", other),
        }
        assert_eq!(calls.load(SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_exhausts_after_four_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome: Outcome<(), &str> = invoke(None, Schedule::backoff_seeded(1), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, SeqCst);
                Err("still down")
            }
        })
        .await;
        assert_eq!(outcome.attempts(), 4);
        assert_eq!(calls.load(SeqCst), 4);
    }

    #[tokio::test]
    async fn first_success_never_sleeps() {
        let outcome: Outcome<u32, &str> =
            invoke(None, Schedule::backoff(), || async { Ok(42) }).await;
        match outcome {
            Outcome::Delivered { attempts, value } => {
                assert_eq!(attempts, 1);
                assert_eq!(value, 42);
            }
            other => panic!("expected Delivered, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome: Outcome<&str, String> = invoke(None, Schedule::exponential_decay(5), || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, SeqCst) < 2 {
                    Err("not yet".to_string())
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert!(outcome.is_delivered());
        assert_eq!(outcome.attempts(), 3);
    }

    #[tokio::test]
    async fn cancelled_before_first_attempt() {
        let token = CancellationToken::new();
        token.cancel();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome: Outcome<(), &str> = invoke(Some(token), Schedule::backoff(), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, SeqCst);
                Err("unreachable")
            }
        })
        .await;
        assert!(matches!(outcome, Outcome::Cancelled { attempts: 0 }));
        assert_eq!(calls.load(SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_backoff_sleep() {
        let token = CancellationToken::new();
        let inner = token.clone();
        let outcome: Outcome<(), &str> = invoke(Some(token), Schedule::backoff_seeded(3), || {
            // Cancel from inside the first attempt so the following sleep
            // is already doomed when it starts.
            inner.cancel();
            async { Err("down") }
        })
        .await;
        assert!(matches!(outcome, Outcome::Cancelled { attempts: 1 }));
    }
}
