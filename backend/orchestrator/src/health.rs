//! Phase-appropriate health checks for a circle.
//!
//! A phase is only considered reached once the ledger agrees on the phase,
//! every component that phase links has an address, and (from `Active` on)
//! the core record answers and the circle is flagged active.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::errors::LedgerError;
use crate::ledger::{self, Ledger, Query};
use crate::retry::{RetryError, RetryExecutor, RetrySafety};
use crate::types::{CircleId, CircleInstance, ComponentKind, ContractStats, Phase};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub circle_id: CircleId,
    pub phase: Phase,
    pub is_active: bool,
    pub missing_components: Vec<ComponentKind>,
    pub can_accept_members: bool,
    pub can_process_payments: bool,
    pub stats: Option<ContractStats>,
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("circle {circle_id} unhealthy at {phase}: {reason}")]
    Unhealthy {
        circle_id: CircleId,
        phase: Phase,
        reason: String,
    },

    #[error(transparent)]
    Ledger(#[from] RetryError<LedgerError>),
}

#[derive(Clone)]
pub struct HealthVerifier {
    ledger: Arc<dyn Ledger>,
    retry: RetryExecutor,
}

impl HealthVerifier {
    pub fn new(ledger: Arc<dyn Ledger>, retry: RetryExecutor) -> Self {
        Self { ledger, retry }
    }

    /// Current ledger view of the circle.
    pub async fn instance(
        &self,
        circle_id: CircleId,
    ) -> Result<CircleInstance, RetryError<LedgerError>> {
        let source = self.ledger.as_ref();
        let query = Query::GetCircleInstance;
        let attempted = self
            .retry
            .execute("getCircleInstance", RetrySafety::Read, |_| {
                ledger::read::<CircleInstance>(source, circle_id, ComponentKind::Factory, &query)
            })
            .await?;
        Ok(attempted.value)
    }

    /// Snapshot without asserting any phase.
    pub async fn check(&self, circle_id: CircleId) -> Result<HealthReport, RetryError<LedgerError>> {
        let instance = self.instance(circle_id).await?;
        let stats = if instance.phase >= Phase::Active {
            Some(self.stats(circle_id).await?)
        } else {
            None
        };
        Ok(report(&instance, instance.phase, stats))
    }

    /// Assert that `phase` has been reached and is internally consistent.
    pub async fn verify(&self, circle_id: CircleId, phase: Phase) -> Result<HealthReport, VerifyError> {
        let instance = self.instance(circle_id).await?;
        let unhealthy = |reason: String| {
            warn!(circle_id, %phase, "verification failed: {reason}");
            VerifyError::Unhealthy {
                circle_id,
                phase,
                reason,
            }
        };

        if instance.phase < phase {
            return Err(unhealthy(format!("ledger still reports {}", instance.phase)));
        }

        let missing = instance.missing_components(phase);
        if !missing.is_empty() {
            return Err(unhealthy(format!("components not linked: {missing:?}")));
        }

        let stats = if phase >= Phase::Active {
            if !instance.is_active {
                return Err(unhealthy("circle is not flagged active".to_string()));
            }
            let stats = self.stats(circle_id).await?;
            if stats.current_cycle == 0 {
                return Err(unhealthy("core record has no open cycle".to_string()));
            }
            Some(stats)
        } else {
            if instance.can_accept_members() {
                return Err(unhealthy("accepting members before activation".to_string()));
            }
            None
        };

        debug!(circle_id, %phase, "phase verified");
        Ok(report(&instance, phase, stats))
    }

    async fn stats(&self, circle_id: CircleId) -> Result<ContractStats, RetryError<LedgerError>> {
        let source = self.ledger.as_ref();
        let query = Query::GetContractStats;
        let attempted = self
            .retry
            .execute("getContractStats", RetrySafety::Read, |_| {
                ledger::read::<ContractStats>(source, circle_id, ComponentKind::Core, &query)
            })
            .await?;
        Ok(attempted.value)
    }
}

fn report(instance: &CircleInstance, phase: Phase, stats: Option<ContractStats>) -> HealthReport {
    HealthReport {
        circle_id: instance.id,
        phase,
        is_active: instance.is_active,
        missing_components: instance.missing_components(phase),
        can_accept_members: instance.can_accept_members(),
        can_process_payments: instance.can_process_payments(),
        stats,
    }
}
