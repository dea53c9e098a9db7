//! Phased bring-up of a circle's backing records.
//!
//! Linking every record in one operation would exceed a single operation's
//! resource budget, so bring-up is split into independently retryable,
//! independently verified steps:
//!
//! | From             | To               | Operation            | Links                   |
//! |------------------|------------------|----------------------|-------------------------|
//! | `Created`        | `BasicLinked`    | `initializeBasic`    | members, governance     |
//! | `BasicLinked`    | `EconomicLinked` | `initializeEconomic` | collateral, payments    |
//! | `EconomicLinked` | `Active`         | `initializeCore`     | core; flips `is_active` |
//! | `Active`         | `Finalized`      | `finalize`           | none                    |
//!
//! The coordinator remembers the last phase it verified per circle. A step
//! whose verification fails leaves that record untouched, so the same step
//! can be re-run (the ledger re-links idempotently) and nothing is skipped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::CircleConfig;
use crate::errors::LedgerError;
use crate::events::{decode_circle_id, CircleIdOutcome};
use crate::health::{HealthReport, HealthVerifier, VerifyError};
use crate::ledger::{submit_and_confirm, Ledger, Operation};
use crate::retry::{RetryError, RetryExecutor, RetrySafety};
use crate::types::{CircleId, ComponentKind, Phase};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: Phase,
    pub to: Phase,
    pub step: PhaseStep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseStep {
    LinkBasic,
    LinkEconomic,
    LinkCore,
    Finalize,
}

impl PhaseStep {
    pub fn operation(self) -> Operation {
        match self {
            Self::LinkBasic => Operation::InitializeBasic,
            Self::LinkEconomic => Operation::InitializeEconomic,
            Self::LinkCore => Operation::InitializeCore,
            Self::Finalize => Operation::Finalize,
        }
    }
}

pub const TRANSITIONS: [Transition; 4] = [
    Transition {
        from: Phase::Created,
        to: Phase::BasicLinked,
        step: PhaseStep::LinkBasic,
    },
    Transition {
        from: Phase::BasicLinked,
        to: Phase::EconomicLinked,
        step: PhaseStep::LinkEconomic,
    },
    Transition {
        from: Phase::EconomicLinked,
        to: Phase::Active,
        step: PhaseStep::LinkCore,
    },
    Transition {
        from: Phase::Active,
        to: Phase::Finalized,
        step: PhaseStep::Finalize,
    },
];

pub fn transition_from(phase: Phase) -> Option<Transition> {
    TRANSITIONS.iter().copied().find(|t| t.from == phase)
}

#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error("no transition out of {0}")]
    NoTransition(Phase),

    #[error("stale advance for circle {circle_id}: expected {expected}, found {actual}")]
    StalePhase {
        circle_id: CircleId,
        expected: Phase,
        actual: Phase,
    },

    #[error("phase {phase} verification failed for circle {circle_id}: {reason}")]
    PhaseVerificationFailed {
        circle_id: CircleId,
        phase: Phase,
        reason: String,
    },

    #[error("registration {tx_hash} confirmed but circle id is unknown: {reason}")]
    EventDecodingAmbiguity { tx_hash: String, reason: String },

    #[error(transparent)]
    Ledger(#[from] RetryError<LedgerError>),
}

/// Result of a factory registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    pub tx_hash: String,
    pub circle: CircleIdOutcome,
    pub attempts: u32,
}

impl Registration {
    /// The new circle's id. An unreadable receipt is an error: the circle
    /// exists on the ledger, so registering again would create a second one.
    pub fn circle_id(&self) -> Result<CircleId, DeploymentError> {
        match &self.circle {
            CircleIdOutcome::Known { circle_id } => Ok(*circle_id),
            CircleIdOutcome::Unknown { tx_hash, reason } => {
                Err(DeploymentError::EventDecodingAmbiguity {
                    tx_hash: tx_hash.clone(),
                    reason: reason.clone(),
                })
            }
        }
    }
}

/// One verified phase transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseRecord {
    pub circle_id: CircleId,
    pub from: Phase,
    pub to: Phase,
    pub tx_hash: String,
    pub attempts: u32,
    pub health: HealthReport,
}

pub struct PhaseDeploymentCoordinator {
    ledger: Arc<dyn Ledger>,
    retry: RetryExecutor,
    verifier: HealthVerifier,
    confirmation_timeout: Duration,
    verified: HashMap<CircleId, Phase>,
}

impl PhaseDeploymentCoordinator {
    pub fn new(ledger: Arc<dyn Ledger>, retry: RetryExecutor, confirmation_timeout: Duration) -> Self {
        let verifier = HealthVerifier::new(ledger.clone(), retry.clone());
        Self {
            ledger,
            retry,
            verifier,
            confirmation_timeout,
            verified: HashMap::new(),
        }
    }

    /// Last phase this coordinator verified for `circle_id`.
    pub fn last_verified(&self, circle_id: CircleId) -> Option<Phase> {
        self.verified.get(&circle_id).copied()
    }

    /// Register a new circle with the factory.
    ///
    /// Registration creates a new record on every submission, so it is
    /// never resubmitted after an ambiguous outcome. A confirmed receipt
    /// whose id cannot be read is reported as [`CircleIdOutcome::Unknown`].
    pub async fn register(
        &mut self,
        creator: &str,
        circle: &CircleConfig,
    ) -> Result<Registration, DeploymentError> {
        let op = Operation::CreateCircle {
            creator: creator.to_string(),
            participants: circle.participants,
            tokens: circle.tokens.clone(),
            collateral_factor_bps: circle.collateral_factor_bps,
            penalty_rate_bps: circle.penalty_rate_bps,
            cycle_duration_secs: circle.cycle_duration.as_secs(),
            seize_on_default: circle.seize_on_default,
        };
        let ledger = self.ledger.as_ref();
        let timeout = self.confirmation_timeout;

        let attempted = self
            .retry
            .execute("createCircle", RetrySafety::SingleShot, |_| {
                submit_and_confirm(ledger, None, ComponentKind::Factory, &op, timeout)
            })
            .await?;

        let receipt = attempted.value;
        let outcome = decode_circle_id(&receipt.tx_hash, &receipt.events);
        match &outcome {
            CircleIdOutcome::Known { circle_id } => {
                info!(circle_id, tx_hash = %receipt.tx_hash, "circle registered");
                self.verified.insert(*circle_id, Phase::Created);
            }
            CircleIdOutcome::Unknown { reason, .. } => {
                error!(tx_hash = %receipt.tx_hash, "circle registered but id unknown: {reason}");
            }
        }

        Ok(Registration {
            tx_hash: receipt.tx_hash,
            circle: outcome,
            attempts: attempted.attempts,
        })
    }

    /// Run the transition out of `expected_current`, then verify it.
    ///
    /// Rejects the call when the ledger (or this coordinator's record) shows
    /// a different phase. A ledger already one step ahead but not yet
    /// verified is treated as an interrupted attempt and re-linked.
    pub async fn advance_phase(
        &mut self,
        circle_id: CircleId,
        expected_current: Phase,
    ) -> Result<PhaseRecord, DeploymentError> {
        let transition =
            transition_from(expected_current).ok_or(DeploymentError::NoTransition(expected_current))?;

        if let Some(recorded) = self.last_verified(circle_id) {
            if recorded != expected_current {
                return Err(DeploymentError::StalePhase {
                    circle_id,
                    expected: expected_current,
                    actual: recorded,
                });
            }
        }

        let on_ledger = self.verifier.instance(circle_id).await?.phase;
        if on_ledger != transition.from && on_ledger != transition.to {
            return Err(DeploymentError::StalePhase {
                circle_id,
                expected: expected_current,
                actual: on_ledger,
            });
        }
        if on_ledger == transition.to {
            warn!(circle_id, phase = %transition.to, "phase applied but never verified; re-linking");
        }

        let op = transition.step.operation();
        let ledger = self.ledger.as_ref();
        let timeout = self.confirmation_timeout;
        let attempted = self
            .retry
            .execute(
                op.name(),
                RetrySafety::LedgerGuarded("phase initialisation re-links the same records"),
                |_| submit_and_confirm(ledger, Some(circle_id), ComponentKind::Factory, &op, timeout),
            )
            .await?;

        let health = match self.verifier.verify(circle_id, transition.to).await {
            Ok(report) => report,
            Err(VerifyError::Unhealthy { reason, .. }) => {
                self.verified.entry(circle_id).or_insert(expected_current);
                return Err(DeploymentError::PhaseVerificationFailed {
                    circle_id,
                    phase: transition.to,
                    reason,
                });
            }
            Err(VerifyError::Ledger(e)) => return Err(e.into()),
        };

        self.verified.insert(circle_id, transition.to);
        info!(
            circle_id,
            from = %transition.from,
            to = %transition.to,
            attempts = attempted.attempts,
            "phase advanced"
        );
        Ok(PhaseRecord {
            circle_id,
            from: transition.from,
            to: transition.to,
            tx_hash: attempted.value.tx_hash,
            attempts: attempted.attempts,
            health,
        })
    }

    /// Find the last phase that verifies, walking down from what the ledger
    /// reports. Used after a restart.
    pub async fn resume(&mut self, circle_id: CircleId) -> Result<Phase, DeploymentError> {
        let mut phase = self.verifier.instance(circle_id).await?.phase;
        loop {
            match self.verifier.verify(circle_id, phase).await {
                Ok(_) => {
                    info!(circle_id, %phase, "resuming from verified phase");
                    self.verified.insert(circle_id, phase);
                    return Ok(phase);
                }
                Err(VerifyError::Unhealthy { reason, .. }) => match phase.previous() {
                    Some(previous) => {
                        warn!(circle_id, %phase, "does not verify ({reason}); trying {previous}");
                        phase = previous;
                    }
                    None => {
                        return Err(DeploymentError::PhaseVerificationFailed {
                            circle_id,
                            phase,
                            reason,
                        })
                    }
                },
                Err(VerifyError::Ledger(e)) => return Err(e.into()),
            }
        }
    }

    /// Advance from the last verified phase until the circle is `Active`.
    pub async fn deploy_to_active(
        &mut self,
        circle_id: CircleId,
    ) -> Result<Vec<PhaseRecord>, DeploymentError> {
        let mut current = match self.last_verified(circle_id) {
            Some(phase) => phase,
            None => self.resume(circle_id).await?,
        };

        let mut records = Vec::new();
        while current < Phase::Active {
            let record = self.advance_phase(circle_id, current).await?;
            current = record.to;
            records.push(record);
        }
        Ok(records)
    }

    /// Lock an active circle.
    pub async fn finalize(&mut self, circle_id: CircleId) -> Result<PhaseRecord, DeploymentError> {
        self.advance_phase(circle_id, Phase::Active).await
    }

    /// Stop accepting members and payments. Setting the flag twice is harmless.
    pub async fn deactivate(&mut self, circle_id: CircleId) -> Result<HealthReport, DeploymentError> {
        let ledger = self.ledger.as_ref();
        let timeout = self.confirmation_timeout;
        let op = Operation::DeactivateCircle;
        self.retry
            .execute(
                op.name(),
                RetrySafety::LedgerGuarded("deactivation only clears a flag"),
                |_| submit_and_confirm(ledger, Some(circle_id), ComponentKind::Factory, &op, timeout),
            )
            .await?;
        info!(circle_id, "circle deactivated");
        Ok(self.verifier.check(circle_id).await?)
    }
}
