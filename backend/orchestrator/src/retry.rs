//! Bounded, classified retry for ledger calls.
//!
//! ## Resilience
//!
//! * Every failure is classified by its type, never by its message:
//!   [`ErrorClass::Transient`] is retried after a back-off delay,
//!   [`ErrorClass::Terminal`] propagates on the attempt that produced it, and
//!   [`ErrorClass::Ambiguous`] (submitted, outcome unknown) is resolved by a
//!   probe before anything is resubmitted.
//! * Each call site declares its [`RetrySafety`]. A [`RetrySafety::SingleShot`]
//!   operation is never resubmitted after an ambiguous outcome unless a probe
//!   proved it did not land.
//!
//! ```text
//! Attempting(n) ──ok──────────────► Success
//!       │
//!       ├─transient, n < max──────► Retrying(n + 1)
//!       ├─ambiguous──probe──landed► Success (reconciled)
//!       │             └─not landed► Retrying(n + 1)
//!       └─terminal / n == max─────► Failed
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::errors::LedgerError;

/// How a failure should be treated by [`RetryExecutor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Nothing reached the ledger; trying again is safe.
    Transient,
    /// The operation may have landed.
    Ambiguous,
    /// Retrying cannot change the outcome.
    Terminal,
}

/// Structured classification of an error type.
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

impl Classify for LedgerError {
    fn class(&self) -> ErrorClass {
        match self {
            LedgerError::Transport { .. } => ErrorClass::Transient,
            LedgerError::ConfirmationTimeout { .. } => ErrorClass::Ambiguous,
            LedgerError::Rejected { .. } | LedgerError::Decode(_) => ErrorClass::Terminal,
        }
    }
}

/// Whether an operation may be submitted again after an ambiguous outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrySafety {
    /// Reads have no effect to duplicate.
    Read,
    /// The ledger itself refuses a second effect; the reason names the check.
    LedgerGuarded(&'static str),
    /// A second submission would duplicate the effect.
    SingleShot,
}

impl RetrySafety {
    fn tolerates_resubmission(self) -> bool {
        !matches!(self, Self::SingleShot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    /// Doubles after every failed attempt, capped at the policy's max delay.
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            backoff: Backoff::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt that follows failed attempt `attempt`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.base_delay
                    .checked_mul(factor)
                    .unwrap_or(self.max_delay)
                    .min(self.max_delay)
            }
        }
    }
}

/// Sleep primitive used between attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

/// Successful result of [`RetryExecutor::execute`].
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
    /// The value came from a probe after an ambiguous outcome.
    pub reconciled: bool,
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("{label}: terminal failure on attempt {attempts}: {error}")]
    Terminal { label: String, attempts: u32, error: E },

    #[error("{label}: still failing after {attempts} attempts: {error}")]
    Exhausted { label: String, attempts: u32, error: E },

    #[error("{label}: outcome unknown after attempt {attempts}, not resubmitting: {error}")]
    Ambiguous { label: String, attempts: u32, error: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Terminal { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::Ambiguous { attempts, .. } => *attempts,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

impl RetryError<LedgerError> {
    /// Business rejection that ended the call, if any.
    pub fn reject_code(&self) -> Option<crate::errors::RejectCode> {
        match self {
            Self::Terminal { error, .. } => error.reject_code(),
            _ => None,
        }
    }
}

/// Runs operations under a [`RetryPolicy`].
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_sleeper(policy, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(policy: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { policy, sleeper }
    }

    /// Run `op` until it succeeds, fails terminally, or the attempt budget
    /// is spent. `op` receives the 1-based attempt number.
    pub async fn execute<T, E, F, Fut>(
        &self,
        label: &str,
        safety: RetrySafety,
        op: F,
    ) -> Result<Attempted<T>, RetryError<E>>
    where
        E: Classify + fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(
            label,
            safety,
            op,
            None::<fn() -> std::future::Ready<Result<Option<T>, E>>>,
        )
        .await
    }

    /// Like [`execute`](Self::execute), but an ambiguous outcome is first
    /// checked with `probe`: `Ok(Some(value))` means the operation landed,
    /// `Ok(None)` means it did not and resubmitting is safe.
    pub async fn execute_with_probe<T, E, F, Fut, P, PFut>(
        &self,
        label: &str,
        safety: RetrySafety,
        op: F,
        probe: P,
    ) -> Result<Attempted<T>, RetryError<E>>
    where
        E: Classify + fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnMut() -> PFut,
        PFut: Future<Output = Result<Option<T>, E>>,
    {
        self.run(label, safety, op, Some(probe)).await
    }

    async fn run<T, E, F, Fut, P, PFut>(
        &self,
        label: &str,
        safety: RetrySafety,
        mut op: F,
        mut probe: Option<P>,
    ) -> Result<Attempted<T>, RetryError<E>>
    where
        E: Classify + fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnMut() -> PFut,
        PFut: Future<Output = Result<Option<T>, E>>,
    {
        let max = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(label, attempt, max, "attempting");

            let error = match op(attempt).await {
                Ok(value) => {
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                        reconciled: false,
                    })
                }
                Err(error) => error,
            };

            match error.class() {
                ErrorClass::Terminal => {
                    return Err(RetryError::Terminal {
                        label: label.to_string(),
                        attempts: attempt,
                        error,
                    });
                }
                ErrorClass::Transient => {}
                ErrorClass::Ambiguous => match probe.as_mut() {
                    Some(probe) => match probe().await {
                        Ok(Some(value)) => {
                            info!(label, attempt, "ambiguous outcome resolved: operation landed");
                            return Ok(Attempted {
                                value,
                                attempts: attempt,
                                reconciled: true,
                            });
                        }
                        Ok(None) => debug!(label, attempt, "probe shows operation did not land"),
                        Err(probe_error) if probe_error.class() == ErrorClass::Terminal => {
                            return Err(RetryError::Terminal {
                                label: label.to_string(),
                                attempts: attempt,
                                error: probe_error,
                            });
                        }
                        Err(probe_error) => {
                            warn!(label, attempt, "probe failed: {probe_error}");
                            if !safety.tolerates_resubmission() {
                                return Err(RetryError::Ambiguous {
                                    label: label.to_string(),
                                    attempts: attempt,
                                    error,
                                });
                            }
                        }
                    },
                    None if !safety.tolerates_resubmission() => {
                        return Err(RetryError::Ambiguous {
                            label: label.to_string(),
                            attempts: attempt,
                            error,
                        });
                    }
                    None => {}
                },
            }

            if attempt >= max {
                return Err(RetryError::Exhausted {
                    label: label.to_string(),
                    attempts: attempt,
                    error,
                });
            }

            let delay = self.policy.delay_after(attempt);
            warn!(
                label,
                attempt,
                "attempt failed (will retry in {}ms): {error}",
                delay.as_millis()
            );
            self.sleeper.sleep(delay).await;
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records requested delays instead of sleeping.
    #[derive(Default)]
    pub struct RecordingSleeper {
        pub delays: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, delay: Duration) {
            self.delays.lock().unwrap().push(delay);
        }
    }

    pub fn instant_executor(max_attempts: u32) -> RetryExecutor {
        RetryExecutor::with_sleeper(
            RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(40),
                backoff: Backoff::Exponential,
            },
            Arc::new(RecordingSleeper::default()),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::testing::{instant_executor, RecordingSleeper};
    use super::*;
    use crate::errors::{RejectCode, TransportFault};

    fn reset() -> LedgerError {
        LedgerError::transport(TransportFault::ConnectionReset, "connection reset by peer")
    }

    fn timeout() -> LedgerError {
        LedgerError::ConfirmationTimeout {
            tx_hash: "tx-1".to_string(),
            waited_ms: 500,
        }
    }

    #[tokio::test]
    async fn succeeds_after_k_transient_failures() {
        let executor = instant_executor(5);
        for k in 0..5u32 {
            let calls = Cell::new(0u32);
            let out = executor
                .execute("read", RetrySafety::Read, |_| {
                    calls.set(calls.get() + 1);
                    let n = calls.get();
                    async move {
                        if n <= k {
                            Err(reset())
                        } else {
                            Ok(n)
                        }
                    }
                })
                .await
                .unwrap();
            assert_eq!(out.attempts, k + 1);
            assert_eq!(calls.get(), k + 1);
            assert!(!out.reconciled);
        }
    }

    #[tokio::test]
    async fn always_transient_fails_after_exactly_max_attempts() {
        let executor = instant_executor(4);
        let calls = Cell::new(0u32);
        let err = executor
            .execute("submit", RetrySafety::SingleShot, |_| {
                calls.set(calls.get() + 1);
                async { Err::<(), _>(reset()) }
            })
            .await
            .unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(err.attempts(), 4);
        assert_eq!(calls.get(), 4);
    }

    #[tokio::test]
    async fn terminal_failure_makes_one_attempt() {
        let executor = instant_executor(4);
        let calls = Cell::new(0u32);
        let err = executor
            .execute("pay", RetrySafety::LedgerGuarded("one payment per cycle"), |_| {
                calls.set(calls.get() + 1);
                async { Err::<(), _>(LedgerError::rejected("makePayment", RejectCode::AlreadyPaid)) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RetryError::Terminal { attempts: 1, .. }));
        assert_eq!(err.reject_code(), Some(RejectCode::AlreadyPaid));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn single_shot_does_not_resubmit_ambiguous_outcome() {
        let executor = instant_executor(4);
        let calls = Cell::new(0u32);
        let err = executor
            .execute("create", RetrySafety::SingleShot, |_| {
                calls.set(calls.get() + 1);
                async { Err::<(), _>(timeout()) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RetryError::Ambiguous { attempts: 1, .. }));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn guarded_operation_resubmits_after_ambiguous_outcome() {
        let executor = instant_executor(3);
        let calls = Cell::new(0u32);
        let out = executor
            .execute("link", RetrySafety::LedgerGuarded("re-link is idempotent"), |attempt| {
                calls.set(calls.get() + 1);
                async move {
                    if attempt == 1 {
                        Err(timeout())
                    } else {
                        Ok("linked")
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(out.value, "linked");
        assert_eq!(out.attempts, 2);
    }

    #[tokio::test]
    async fn probe_that_finds_the_effect_stops_resubmission() {
        let executor = instant_executor(3);
        let calls = Cell::new(0u32);
        let out = executor
            .execute_with_probe(
                "pay",
                RetrySafety::SingleShot,
                |_| {
                    calls.set(calls.get() + 1);
                    async { Err(timeout()) }
                },
                || async { Ok(Some(42u32)) },
            )
            .await
            .unwrap();
        assert_eq!(out.value, 42);
        assert!(out.reconciled);
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn probe_that_finds_nothing_allows_resubmission() {
        let executor = instant_executor(3);
        let out = executor
            .execute_with_probe(
                "pay",
                RetrySafety::SingleShot,
                |attempt| async move {
                    if attempt == 1 {
                        Err(timeout())
                    } else {
                        Ok(attempt)
                    }
                },
                || async { Ok(None) },
            )
            .await
            .unwrap();
        assert_eq!(out.value, 2);
        assert!(!out.reconciled);
    }

    #[tokio::test]
    async fn delays_back_off_and_cap() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let executor = RetryExecutor::with_sleeper(
            RetryPolicy {
                max_attempts: 5,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(40),
                backoff: Backoff::Exponential,
            },
            sleeper.clone(),
        );
        let _ = executor
            .execute("read", RetrySafety::Read, |_| async { Err::<(), _>(reset()) })
            .await;
        let delays: Vec<u128> = sleeper
            .delays
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.as_millis())
            .collect();
        assert_eq!(delays, vec![10, 20, 40, 40]);
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy {
            backoff: Backoff::Fixed,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_after(1), policy.delay_after(7));
    }
}
