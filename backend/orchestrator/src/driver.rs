//! Long-running background task that takes a circle to `Active` and then
//! drives its cycles, journaling every outcome to the database.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use sqlx::SqlitePool;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::batch::BatchReport;
use crate::config::Config;
use crate::db;
use crate::deployment::{DeploymentError, PhaseDeploymentCoordinator};
use crate::errors::AppError;
use crate::ledger::Ledger;
use crate::orchestrator::{CycleOrchestrator, OrchestratorError};
use crate::retry::RetryExecutor;
use crate::types::{CircleId, Phase};

pub struct DriverState {
    pub pool: SqlitePool,
    pub config: Config,
    pub ledger: Arc<dyn Ledger>,
    pub retry: RetryExecutor,
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Deployment(#[from] DeploymentError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    App(#[from] AppError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// The cycle window is still open.
    Collecting,
    /// Defaults, payout and advance ran for the elapsed cycle.
    Advanced,
    /// The window elapsed but no member who paid this cycle is still owed a
    /// payout. Late payments can still unblock the cycle.
    Stalled,
    /// The circle is finalized: every member was paid out or removed, or
    /// the last round has nobody left to pay.
    Finished,
}

pub struct Driver {
    state: Arc<DriverState>,
    coordinator: PhaseDeploymentCoordinator,
    orchestrator: CycleOrchestrator,
}

/// Spawn the driver loop as a background [`tokio`] task.
pub async fn run(state: Arc<DriverState>, cancel: CancellationToken) {
    let mut driver = match Driver::bootstrap(state.clone()).await {
        Ok(driver) => driver,
        Err(e) => {
            error!("Driver bootstrap failed: {e}");
            return;
        }
    };

    // Stop in-flight batches as soon as shutdown is requested.
    let batches = driver.orchestrator.cancel_token();
    let forward = cancel.clone();
    tokio::spawn(async move {
        forward.cancelled().await;
        batches.cancel();
    });

    let poll_interval = Duration::from_secs(state.config.poll_interval_secs);
    loop {
        match driver.tick().await {
            Ok(Tick::Finished) => {
                info!(circle_id = driver.circle_id(), "Circle finished; driver stopping");
                return;
            }
            Ok(_) => {}
            Err(e) => error!("Driver tick error: {e}"),
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Driver shutting down");
                return;
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

impl Driver {
    /// Register (when no circle id is configured), deploy to `Active`,
    /// sync and enrol the configured members.
    pub async fn bootstrap(state: Arc<DriverState>) -> Result<Self, DriverError> {
        let config = &state.config;
        let mut coordinator = PhaseDeploymentCoordinator::new(
            state.ledger.clone(),
            state.retry.clone(),
            config.confirmation_timeout,
        );

        let circle_id = match config.circle_id {
            Some(id) => id,
            None => {
                let creator = config.creator.as_deref().ok_or_else(|| {
                    AppError::Config("CREATOR is required when CIRCLE_ID is not set".to_string())
                })?;
                let registration = coordinator.register(creator, &config.circle).await?;
                let id = registration.circle_id()?;
                info!(circle_id = id, tx_hash = %registration.tx_hash, "Registered new circle");
                id
            }
        };

        for record in coordinator.deploy_to_active(circle_id).await? {
            db::record_phase(&state.pool, &record).await?;
        }

        let mut orchestrator = CycleOrchestrator::new(
            circle_id,
            config.circle.clone(),
            state.ledger.clone(),
            state.retry.clone(),
            config.confirmation_timeout,
        );
        orchestrator.sync().await?;

        for token in config.circle.tokens.iter().filter(|t| t.is_active) {
            let drift = orchestrator.check_collateral_drift(token.token).await?;
            if !drift.is_clean() {
                warn!(
                    circle_id,
                    token = token.token.as_str(),
                    mismatches = drift.mismatches.len(),
                    "Ledger collateral preview differs from the local schedule"
                );
            }
        }

        if !config.members.is_empty() {
            let joins = orchestrator.join_members(&config.members).await;
            journal_batch(&state.pool, circle_id, joins).await?;
        }

        Ok(Self {
            state,
            coordinator,
            orchestrator,
        })
    }

    pub fn circle_id(&self) -> CircleId {
        self.orchestrator.circle_id()
    }

    pub fn orchestrator(&self) -> &CycleOrchestrator {
        &self.orchestrator
    }

    /// One pass: collect payments, and once the cycle window has elapsed,
    /// handle defaults, pay out and advance.
    pub async fn tick(&mut self) -> Result<Tick, DriverError> {
        let pool = &self.state.pool;
        let circle_id = self.orchestrator.circle_id();
        self.orchestrator.sync().await?;

        if self.coordinator.last_verified(circle_id) == Some(Phase::Finalized) {
            return Ok(Tick::Finished);
        }
        if self.all_paid_out() {
            let record = self.coordinator.finalize(circle_id).await?;
            db::record_phase(pool, &record).await?;
            return Ok(Tick::Finished);
        }

        let payments = self.orchestrator.collect_payments().await;
        journal_batch(pool, circle_id, payments).await?;

        if !self.orchestrator.cycle_window_elapsed(Utc::now()) {
            return Ok(Tick::Collecting);
        }

        let defaults = self.orchestrator.handle_defaults().await;
        journal_batch(pool, circle_id, defaults).await?;

        // Seizures may have removed members.
        self.orchestrator.sync().await?;
        let cycle = self.orchestrator.cycle().number;
        if !self.has_payout_recipient() {
            if cycle >= self.state.config.circle.participants {
                warn!(circle_id, cycle, "Nobody can take the final payout; finalizing");
                let record = self.coordinator.finalize(circle_id).await?;
                db::record_phase(pool, &record).await?;
                return Ok(Tick::Finished);
            }
            warn!(circle_id, cycle, "No paid-up member is owed a payout; waiting");
            return Ok(Tick::Stalled);
        }

        let payout = self.orchestrator.distribute_payout().await;
        journal_operation(pool, circle_id, "payout", cycle, payout).await?;

        let advance = self.orchestrator.advance_cycle().await;
        journal_operation(pool, circle_id, "advance", cycle, advance).await?;
        Ok(Tick::Advanced)
    }

    /// Whether some active member paid the current cycle and has not been
    /// paid out yet.
    fn has_payout_recipient(&self) -> bool {
        let cycle = self.orchestrator.cycle().number;
        self.orchestrator
            .members()
            .any(|m| m.is_active && !m.has_received_payout && m.has_paid_cycle(cycle))
    }

    fn all_paid_out(&self) -> bool {
        let members: Vec<_> = self.orchestrator.members().collect();
        members.len() == self.state.config.circle.participants as usize
            && members.iter().all(|m| m.has_received_payout || !m.is_active)
    }
}

// ─────────────────────────────────────────────────────────
// Journal helpers
// ─────────────────────────────────────────────────────────

/// Journal a batch, including the partial report of an unreachable ledger.
async fn journal_batch<O: Serialize>(
    pool: &SqlitePool,
    circle_id: CircleId,
    result: Result<BatchReport<O>, OrchestratorError>,
) -> Result<BatchReport<O>, DriverError> {
    match result {
        Ok(report) => {
            db::record_batch(pool, circle_id, &report.to_json()).await?;
            Ok(report)
        }
        Err(OrchestratorError::LedgerUnreachable { report, source }) => {
            db::record_batch(pool, circle_id, &report).await?;
            Err(OrchestratorError::LedgerUnreachable { report, source }.into())
        }
        Err(e) => Err(e.into()),
    }
}

async fn journal_operation<T: Serialize>(
    pool: &SqlitePool,
    circle_id: CircleId,
    workflow: &str,
    cycle: u32,
    result: Result<T, OrchestratorError>,
) -> Result<T, DriverError> {
    match result {
        Ok(outcome) => {
            db::record_operation(pool, circle_id, workflow, cycle, "done", &outcome).await?;
            Ok(outcome)
        }
        Err(e) => {
            let detail = json!({ "error": e.to_string() });
            db::record_operation(pool, circle_id, workflow, cycle, "failed", &detail).await?;
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircleConfig;
    use crate::ledger::memory::MemoryLedger;
    use crate::retry::testing::instant_executor;
    use crate::retry::RetryPolicy;
    use crate::types::{Amount, MemberId, SettlementToken, TokenConfig};

    fn g(n: u32) -> MemberId {
        MemberId::new(format!("G{n}"))
    }

    fn drain(ledger: &MemoryLedger, member: &MemberId, keep: Amount) {
        let balance = ledger.balance(member, SettlementToken::TokenA);
        ledger.fund(member, SettlementToken::TokenA, keep - balance);
    }

    fn config(participants: u32, cycle_duration: Duration) -> Config {
        Config {
            rpc_url: "http://localhost:8000".to_string(),
            circle_id: None,
            creator: Some("GCREATOR".to_string()),
            database_url: "sqlite::memory:".to_string(),
            api_port: 0,
            poll_interval_secs: 1,
            retry: RetryPolicy::default(),
            confirmation_timeout: Duration::from_secs(1),
            circle: CircleConfig {
                participants,
                tokens: vec![TokenConfig {
                    token: SettlementToken::TokenA,
                    monthly_payment: 100,
                    is_active: true,
                }],
                collateral_factor_bps: 5_500,
                penalty_rate_bps: 500,
                cycle_duration,
                seize_on_default: true,
                circuit_breaker_threshold: 3,
            },
            members: (1..=participants).map(|n| (g(n), SettlementToken::TokenA)).collect(),
        }
    }

    async fn state(config: Config) -> (Arc<MemoryLedger>, Arc<DriverState>) {
        let ledger = Arc::new(MemoryLedger::new());
        for (member, token) in &config.members {
            ledger.fund(member, *token, 10_000);
        }
        let pool = db::init_pool("sqlite::memory:").await.unwrap();
        let state = Arc::new(DriverState {
            pool,
            config,
            ledger: ledger.clone(),
            retry: instant_executor(3),
        });
        (ledger, state)
    }

    #[tokio::test]
    async fn bootstrap_registers_deploys_and_enrols() {
        let (ledger, state) = state(config(3, Duration::from_secs(3_600))).await;
        let driver = Driver::bootstrap(state.clone()).await.unwrap();
        let circle_id = driver.circle_id();

        let phases = db::phases_for_circle(&state.pool, circle_id).await.unwrap();
        let steps: Vec<(i64, i64)> = phases.iter().map(|p| (p.from_phase, p.to_phase)).collect();
        assert_eq!(steps, vec![(1, 2), (2, 3), (3, 4)]);

        assert_eq!(driver.orchestrator().members().count(), 3);
        assert_eq!(ledger.applied_count("joinCircle"), 3);
        let ops = db::operations_for_circle(&state.pool, circle_id).await.unwrap();
        assert_eq!(ops.len(), 3);
        assert!(ops.iter().all(|op| op.workflow == "join" && op.status == "done"));
    }

    #[tokio::test]
    async fn tick_waits_for_the_cycle_window() {
        let (ledger, state) = state(config(3, Duration::from_secs(3_600))).await;
        let mut driver = Driver::bootstrap(state).await.unwrap();

        assert_eq!(driver.tick().await.unwrap(), Tick::Collecting);
        assert_eq!(ledger.applied_count("makePayment"), 3);
        assert_eq!(ledger.applied_count("distributePayout"), 0);

        // Everyone already paid; nothing new is submitted.
        assert_eq!(driver.tick().await.unwrap(), Tick::Collecting);
        assert_eq!(ledger.applied_count("makePayment"), 3);
    }

    #[tokio::test]
    async fn elapsed_windows_run_every_cycle_then_finalize() {
        let (ledger, state) = state(config(3, Duration::ZERO)).await;
        let mut driver = Driver::bootstrap(state.clone()).await.unwrap();
        let circle_id = driver.circle_id();

        for cycle in 1..=3 {
            assert_eq!(driver.tick().await.unwrap(), Tick::Advanced, "cycle {cycle}");
        }
        assert_eq!(ledger.applied_count("distributePayout"), 3);
        assert_eq!(driver.tick().await.unwrap(), Tick::Finished);

        let phases = db::phases_for_circle(&state.pool, circle_id).await.unwrap();
        let last = phases.last().unwrap();
        assert_eq!(last.to_phase, i64::from(Phase::Finalized.number()));

        let ops = db::operations_for_circle(&state.pool, circle_id).await.unwrap();
        let payouts = ops.iter().filter(|op| op.workflow == "payout").count();
        let advances = ops.iter().filter(|op| op.workflow == "advance").count();
        assert_eq!((payouts, advances), (3, 3));
    }

    #[tokio::test]
    async fn last_member_defaulting_without_seizure_finishes_the_circle() {
        let mut config = config(3, Duration::ZERO);
        config.circle.seize_on_default = false;
        let (ledger, state) = state(config).await;
        let mut driver = Driver::bootstrap(state.clone()).await.unwrap();
        let circle_id = driver.circle_id();
        // Enough for two cycles only.
        drain(&ledger, &g(3), 200);

        assert_eq!(driver.tick().await.unwrap(), Tick::Advanced);
        assert_eq!(driver.tick().await.unwrap(), Tick::Advanced);
        assert_eq!(driver.tick().await.unwrap(), Tick::Finished);
        assert_eq!(driver.tick().await.unwrap(), Tick::Finished);

        assert_eq!(ledger.applied_count("distributePayout"), 2);
        assert_eq!(ledger.applied_count("finalize"), 1);
        let g3 = driver.orchestrator().member(&g(3)).unwrap();
        assert!(g3.is_active);
        assert!(!g3.has_received_payout);
        assert_eq!(g3.default_count, 1);

        let phases = db::phases_for_circle(&state.pool, circle_id).await.unwrap();
        assert_eq!(phases.last().unwrap().to_phase, i64::from(Phase::Finalized.number()));
    }

    #[tokio::test]
    async fn unpaid_cycle_stalls_until_late_payments_arrive() {
        let mut config = config(3, Duration::ZERO);
        config.circle.seize_on_default = false;
        let (ledger, state) = state(config).await;
        let mut driver = Driver::bootstrap(state).await.unwrap();
        for n in 1..=3 {
            drain(&ledger, &g(n), 0);
        }

        assert_eq!(driver.tick().await.unwrap(), Tick::Stalled);
        assert_eq!(ledger.applied_count("distributePayout"), 0);
        assert_eq!(ledger.applied_count("advanceCycle"), 0);

        for n in 1..=3 {
            ledger.fund(&g(n), SettlementToken::TokenA, 1_000);
        }
        assert_eq!(driver.tick().await.unwrap(), Tick::Advanced);
        assert_eq!(ledger.applied_count("makePayment"), 3);
        assert_eq!(ledger.applied_count("distributePayout"), 1);
    }

    #[tokio::test]
    async fn unknown_circle_id_stops_bootstrap() {
        let (ledger, state) = state(config(3, Duration::ZERO)).await;
        ledger.omit_circle_created_event();
        let err = Driver::bootstrap(state).await.err().unwrap();
        assert!(matches!(
            err,
            DriverError::Deployment(DeploymentError::EventDecodingAmbiguity { .. })
        ));
        assert_eq!(ledger.circle_count(), 1);
    }
}
