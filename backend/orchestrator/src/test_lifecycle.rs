//! Whole-circle run against the in-memory ledger: registration, phased
//! deployment, ten members, three cycles with one default, and a restart.

use std::sync::Arc;
use std::time::Duration;

use crate::batch::{ItemOutcome, MemberFailure};
use crate::config::CircleConfig;
use crate::deployment::PhaseDeploymentCoordinator;
use crate::errors::RejectCode;
use crate::ledger::memory::MemoryLedger;
use crate::orchestrator::{CycleOrchestrator, DefaultOutcome, PayoutOutcome};
use crate::retry::testing::instant_executor;
use crate::types::{Amount, MemberId, Phase, SettlementToken};

const ONE: Amount = 1_000_000;
const MONTHLY: Amount = 50 * ONE;
const WAIT: Duration = Duration::from_secs(1);

fn g(n: u32) -> MemberId {
    MemberId::new(format!("G{n}"))
}

fn collateral(position: u32) -> Amount {
    // 55% of the payments still owed after this position's payout.
    MONTHLY * Amount::from(10 - position) * 55 / 100
}

#[tokio::test]
async fn ten_member_circle_runs_three_cycles() {
    let config = CircleConfig::reference();
    let ledger = Arc::new(MemoryLedger::new());

    let mut coordinator = PhaseDeploymentCoordinator::new(ledger.clone(), instant_executor(3), WAIT);
    let circle_id = coordinator
        .register("GCREATOR", &config)
        .await
        .unwrap()
        .circle_id()
        .unwrap();
    let records = coordinator.deploy_to_active(circle_id).await.unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.last().unwrap().health.can_process_payments);

    // G7 can cover the first cycle only.
    for n in 1..=10 {
        let payments = if n == 7 { 1 } else { 3 };
        ledger.fund(&g(n), SettlementToken::TokenA, collateral(n) + payments * MONTHLY);
    }

    let mut orchestrator =
        CycleOrchestrator::new(circle_id, config.clone(), ledger.clone(), instant_executor(3), WAIT);
    let roster: Vec<_> = (1..=10).map(|n| (g(n), SettlementToken::TokenA)).collect();
    let joins = orchestrator.join_members(&roster).await.unwrap();
    assert_eq!(joins.succeeded(), 10);

    let g1 = orchestrator.member(&g(1)).unwrap();
    assert_eq!(g1.locked_collateral, 247_500_000);
    assert_eq!(g1.guarantor_position, 6);
    assert_eq!(g1.guarantor, Some(g(6)));
    assert_eq!(orchestrator.member(&g(5)).unwrap().locked_collateral, 137_500_000);
    assert_eq!(orchestrator.member(&g(10)).unwrap().locked_collateral, 0);
    assert!(orchestrator
        .check_collateral_drift(SettlementToken::TokenA)
        .await
        .unwrap()
        .is_clean());

    // Cycle 1: everyone pays, G1 is paid out.
    assert_eq!(orchestrator.collect_payments().await.unwrap().succeeded(), 10);
    assert!(orchestrator.handle_defaults().await.unwrap().items.is_empty());
    let payout = orchestrator.distribute_payout().await.unwrap();
    assert!(matches!(
        payout,
        PayoutOutcome::Distributed { cycle: 1, ref recipient, amount, anomaly: None, .. }
            if *recipient == g(1) && amount == 10 * MONTHLY
    ));
    assert_eq!(orchestrator.advance_cycle().await.unwrap().to, 2);

    // Cycle 2: G7 cannot pay and defaults.
    let payments = orchestrator.collect_payments().await.unwrap();
    assert_eq!(payments.succeeded(), 9);
    assert!(matches!(
        payments.outcome_for(&g(7)),
        Some(ItemOutcome::Failed(MemberFailure::Rejected {
            code: RejectCode::InsufficientBalance,
            ..
        }))
    ));

    let defaults = orchestrator.handle_defaults().await.unwrap();
    assert_eq!(defaults.items.len(), 1);
    let Some(ItemOutcome::Done(DefaultOutcome::Recorded {
        penalty,
        amount_owed,
        seizure: Some(seizure),
        anomalies,
        ..
    })) = defaults.outcome_for(&g(7))
    else {
        panic!("unexpected {defaults:?}");
    };
    assert_eq!(*penalty, 2_500_000);
    assert_eq!(*amount_owed, 52_500_000);
    assert_eq!(seizure.collateral_seized, 52_500_000);
    assert_eq!(seizure.payments_seized, 0);
    assert_eq!(seizure.guarantor_liability, 0);
    assert_eq!(seizure.total_seizable, 52_500_000);
    assert!(anomalies.is_empty(), "{anomalies:?}");

    let g7 = orchestrator.member(&g(7)).unwrap();
    assert!(!g7.is_active);
    assert_eq!(g7.locked_collateral, collateral(7) - 52_500_000);
    assert_eq!(g7.reputation_score, 90);
    // Collateral covered the debt; the guarantor is untouched.
    assert_eq!(orchestrator.member(&g(2)).unwrap().locked_collateral, collateral(2));

    let PayoutOutcome::Distributed { recipient, amount, .. } =
        orchestrator.distribute_payout().await.unwrap()
    else {
        panic!("cycle 2 payout not distributed");
    };
    assert_eq!((recipient, amount), (g(2), 9 * MONTHLY));
    assert_eq!(orchestrator.advance_cycle().await.unwrap().to, 3);

    // Restart: a fresh coordinator and orchestrator pick up from the ledger.
    let mut restarted_coordinator =
        PhaseDeploymentCoordinator::new(ledger.clone(), instant_executor(3), WAIT);
    assert_eq!(restarted_coordinator.resume(circle_id).await.unwrap(), Phase::Active);
    assert!(restarted_coordinator.deploy_to_active(circle_id).await.unwrap().is_empty());

    let mut restarted =
        CycleOrchestrator::new(circle_id, config, ledger.clone(), instant_executor(3), WAIT);
    restarted.sync().await.unwrap();
    assert_eq!(restarted.cycle().number, 3);
    assert_eq!(restarted.members().count(), 10);
    assert!(!restarted.member(&g(7)).unwrap().is_active);

    // Cycle 3: the nine active members pay, G3 is paid out.
    let payments = restarted.collect_payments().await.unwrap();
    assert_eq!(payments.items.len(), 9);
    assert_eq!(payments.succeeded(), 9);
    assert_eq!(restarted.next_recipient().map(|m| m.id.clone()), Some(g(3)));
    assert!(matches!(
        restarted.distribute_payout().await.unwrap(),
        PayoutOutcome::Distributed { cycle: 3, .. }
    ));
    assert_eq!(restarted.advance_cycle().await.unwrap().to, 4);

    assert_eq!(ledger.applied_count("makePayment"), 28);
    assert_eq!(ledger.applied_count("distributePayout"), 3);
    assert_eq!(ledger.applied_count("handleDefault"), 1);
    // Collateral stays locked; three payments out, one payout in.
    assert_eq!(ledger.balance(&g(1), SettlementToken::TokenA), 10 * MONTHLY);
}
