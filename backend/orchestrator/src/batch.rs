//! Per-member batch results.
//!
//! A batch never aborts because one member failed. Every member gets an
//! [`ItemResult`], and the batch only stops issuing new operations when the
//! caller cancels, the circuit breaker opens, or the ledger stays unreachable
//! after the retry budget. The operation in flight always runs to completion.

use std::fmt;

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::{LedgerError, RejectCode};
use crate::orchestrator::OrchestratorError;
use crate::retry::RetryError;
use crate::types::{Amount, MemberId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Workflow {
    Join,
    Payment,
    Default,
}

impl Workflow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Payment => "payment",
            Self::Default => "default",
        }
    }
}

impl fmt::Display for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a member's operation did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemberFailure {
    /// The ledger refused the operation.
    Rejected { code: RejectCode, message: String },
    /// Caught before submission.
    InsufficientBalance { required: Amount, available: Amount },
    /// A local check failed; nothing was submitted.
    Precondition { reason: String },
    /// The operation may have landed; it was not resubmitted.
    Unconfirmed { message: String },
}

impl fmt::Display for MemberFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected { code, message } => write!(f, "rejected ({code}): {message}"),
            Self::InsufficientBalance {
                required,
                available,
            } => write!(f, "insufficient balance: need {required}, have {available}"),
            Self::Precondition { reason } => f.write_str(reason),
            Self::Unconfirmed { message } => write!(f, "outcome unknown: {message}"),
        }
    }
}

/// Failure of a single-member operation.
#[derive(Debug)]
pub enum MemberError {
    /// Recorded against the member; the batch goes on.
    Failed(MemberFailure),
    /// Retries exhausted; the batch stops.
    Unreachable(RetryError<LedgerError>),
}

impl MemberError {
    pub fn precondition(reason: impl Into<String>) -> Self {
        Self::Failed(MemberFailure::Precondition {
            reason: reason.into(),
        })
    }
}

impl From<RetryError<LedgerError>> for MemberError {
    fn from(e: RetryError<LedgerError>) -> Self {
        match e {
            RetryError::Exhausted { .. } => Self::Unreachable(e),
            RetryError::Ambiguous { .. } => Self::Failed(MemberFailure::Unconfirmed {
                message: e.to_string(),
            }),
            RetryError::Terminal { error, .. } => match error {
                LedgerError::Rejected { code, message, .. } => {
                    Self::Failed(MemberFailure::Rejected { code, message })
                }
                other => Self::Failed(MemberFailure::Precondition {
                    reason: other.to_string(),
                }),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum HaltReason {
    Cancelled,
    CircuitOpen { consecutive_failures: u32 },
    LedgerUnreachable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum ItemOutcome<O> {
    Done(O),
    Failed(MemberFailure),
    Skipped(HaltReason),
}

/// Outcomes that may be a no-op repeat of an earlier success.
pub trait Repeatable {
    fn is_repeat(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemResult<O> {
    pub member: MemberId,
    pub outcome: ItemOutcome<O>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport<O> {
    pub workflow: Workflow,
    pub cycle: u32,
    pub items: Vec<ItemResult<O>>,
    pub halted: Option<HaltReason>,
}

impl<O> BatchReport<O> {
    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Skipped(_)))
    }

    pub fn outcome_for(&self, member: &MemberId) -> Option<&ItemOutcome<O>> {
        self.items
            .iter()
            .find(|item| &item.member == member)
            .map(|item| &item.outcome)
    }

    fn count(&self, pred: impl Fn(&ItemOutcome<O>) -> bool) -> usize {
        self.items.iter().filter(|item| pred(&item.outcome)).count()
    }
}

impl<O: Repeatable> BatchReport<O> {
    /// Fresh successes, repeats excluded.
    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Done(done) if !done.is_repeat()))
    }

    pub fn repeats(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Done(done) if done.is_repeat()))
    }
}

impl<O: Serialize> BatchReport<O> {
    /// Same report with outcomes as JSON, for journaling and errors.
    pub fn to_json(&self) -> BatchReport<Value> {
        BatchReport {
            workflow: self.workflow,
            cycle: self.cycle,
            items: self
                .items
                .iter()
                .map(|item| ItemResult {
                    member: item.member.clone(),
                    outcome: match &item.outcome {
                        ItemOutcome::Done(o) => {
                            ItemOutcome::Done(serde_json::to_value(o).unwrap_or(Value::Null))
                        }
                        ItemOutcome::Failed(f) => ItemOutcome::Failed(f.clone()),
                        ItemOutcome::Skipped(h) => ItemOutcome::Skipped(*h),
                    },
                })
                .collect(),
            halted: self.halted,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Circuit breaker
// ─────────────────────────────────────────────────────────

/// Opens after `threshold` consecutive member failures. Any success closes
/// it again; a threshold of zero disables it.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: u32,
    consecutive_failures: u32,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            consecutive_failures: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.threshold > 0 && self.consecutive_failures >= self.threshold
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.is_open() {
            warn!(
                failures = self.consecutive_failures,
                "circuit breaker open, skipping remaining members"
            );
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

// ─────────────────────────────────────────────────────────
// Batch bookkeeping
// ─────────────────────────────────────────────────────────

pub(crate) struct BatchRun<O> {
    report: BatchReport<O>,
    breaker: CircuitBreaker,
    cancel: CancellationToken,
    unreachable: Option<RetryError<LedgerError>>,
}

impl<O> BatchRun<O> {
    pub(crate) fn new(
        workflow: Workflow,
        cycle: u32,
        breaker_threshold: u32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            report: BatchReport {
                workflow,
                cycle,
                items: Vec::new(),
                halted: None,
            },
            breaker: CircuitBreaker::new(breaker_threshold),
            cancel,
            unreachable: None,
        }
    }

    /// Reason to stop issuing operations, if any.
    pub(crate) fn halt(&mut self) -> Option<HaltReason> {
        let reason = if self.unreachable.is_some() {
            Some(HaltReason::LedgerUnreachable)
        } else if self.cancel.is_cancelled() {
            Some(HaltReason::Cancelled)
        } else if self.breaker.is_open() {
            Some(HaltReason::CircuitOpen {
                consecutive_failures: self.breaker.consecutive_failures(),
            })
        } else {
            None
        };
        if self.report.halted.is_none() {
            self.report.halted = reason;
        }
        reason
    }

    pub(crate) fn skip(&mut self, member: MemberId, reason: HaltReason) {
        self.report.items.push(ItemResult {
            member,
            outcome: ItemOutcome::Skipped(reason),
        });
    }

    pub(crate) fn record(&mut self, member: MemberId, result: Result<O, MemberError>) {
        let workflow = self.report.workflow;
        let outcome = match result {
            Ok(done) => {
                self.breaker.record_success();
                ItemOutcome::Done(done)
            }
            Err(MemberError::Failed(failure)) => {
                warn!(%workflow, %member, "member operation failed: {failure}");
                self.breaker.record_failure();
                ItemOutcome::Failed(failure)
            }
            Err(MemberError::Unreachable(e)) => {
                warn!(%workflow, %member, "ledger unreachable: {e}");
                let failure = MemberFailure::Unconfirmed {
                    message: e.to_string(),
                };
                self.unreachable = Some(e);
                ItemOutcome::Failed(failure)
            }
        };
        self.report.items.push(ItemResult { member, outcome });
    }

    pub(crate) fn finish(self) -> Result<BatchReport<O>, OrchestratorError>
    where
        O: Serialize,
    {
        let report = self.report;
        info!(
            workflow = %report.workflow,
            cycle = report.cycle,
            items = report.items.len(),
            failed = report.failed(),
            skipped = report.skipped(),
            "batch finished"
        );
        match self.unreachable {
            Some(source) => Err(OrchestratorError::LedgerUnreachable {
                report: Box::new(report.to_json()),
                source,
            }),
            None => Ok(report),
        }
    }
}
