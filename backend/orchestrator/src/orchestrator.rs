//! Per-cycle workflows over an active circle.
//!
//! | Workflow            | Operation          | Resubmission guard on the ledger          |
//! |---------------------|--------------------|-------------------------------------------|
//! | join                | `joinCircle`       | an address can only be a member once      |
//! | payment collection  | `makePayment`      | one payment per member per cycle          |
//! | default handling    | `handleDefault`    | one default per member per cycle          |
//! | payout distribution | `distributePayout` | one payout per cycle                      |
//! | cycle advance       | `advanceCycle`     | only a complete cycle can be advanced     |
//!
//! Every mutating call is submitted through the [`RetryExecutor`] with a probe
//! that re-reads the affected record, so a confirmation timeout is settled by
//! looking at the ledger rather than by submitting again.
//!
//! Expected amounts come from [`CollateralModel`] before submission and are
//! compared with what the ledger recorded afterwards. A difference is
//! reported as an [`Anomaly`] on the outcome; the ledger's value is kept.
//!
//! Workflows take `&mut self` and run members one after another, so two
//! operations for the same member are never in flight together.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::{BatchReport, BatchRun, MemberError, MemberFailure, Repeatable, Workflow};
use crate::collateral::{guarantor_position, settle_default, CollateralModel, SeizableAssets};
use crate::config::CircleConfig;
use crate::errors::{CollateralError, LedgerError, RejectCode};
use crate::ledger::{self, submit_and_confirm, Ledger, Operation, Query};
use crate::retry::{Attempted, RetryError, RetryExecutor, RetrySafety};
use crate::types::{
    Amount, CircleId, CircleInstance, CollateralQuote, ComponentKind, ContractStats, Cycle,
    CycleInfo, Member, MemberId, Phase, SettlementToken, TokenConfig,
};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("ledger unreachable during {} batch: {source}", .report.workflow)]
    LedgerUnreachable {
        report: Box<BatchReport<Value>>,
        source: RetryError<LedgerError>,
    },

    #[error("circle {circle_id} not open for operations (phase {phase}, active: {is_active})")]
    CircleNotReady {
        circle_id: CircleId,
        phase: Phase,
        is_active: bool,
    },

    #[error("cycle {cycle} is not complete")]
    CycleNotComplete { cycle: u32 },

    #[error("no member is eligible for the cycle {cycle} payout")]
    NoEligibleRecipient { cycle: u32 },

    #[error("token {} is not accepted by this circle", .0.as_str())]
    TokenNotAccepted(SettlementToken),

    #[error(transparent)]
    Collateral(#[from] CollateralError),

    #[error(transparent)]
    Ledger(#[from] RetryError<LedgerError>),
}

/// The ledger recorded something other than what the model predicted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "anomaly", rename_all = "snake_case")]
pub enum Anomaly {
    CollateralMismatch {
        member: MemberId,
        expected: Amount,
        confirmed: Amount,
    },
    GuarantorMismatch {
        member: MemberId,
        expected: u32,
        confirmed: u32,
    },
    AmountMismatch {
        member: MemberId,
        field: &'static str,
        expected: Amount,
        confirmed: Amount,
    },
    RecipientMismatch {
        cycle: u32,
        expected: MemberId,
        confirmed: Option<MemberId>,
    },
}

// ─────────────────────────────────────────────────────────
// Outcomes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum JoinOutcome {
    Joined {
        queue_number: u32,
        guarantor_position: u32,
        locked_collateral: Amount,
        attempts: u32,
        reconciled: bool,
        anomalies: Vec<Anomaly>,
    },
    AlreadyMember { queue_number: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PaymentOutcome {
    Paid {
        cycle: u32,
        amount: Amount,
        attempts: u32,
        reconciled: bool,
        anomaly: Option<Anomaly>,
    },
    AlreadyPaid { cycle: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DefaultOutcome {
    Recorded {
        cycle: u32,
        penalty: Amount,
        amount_owed: Amount,
        seizure: Option<SeizableAssets>,
        guarantor: Option<MemberId>,
        attempts: u32,
        reconciled: bool,
        anomalies: Vec<Anomaly>,
    },
    AlreadyRecorded { cycle: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PayoutOutcome {
    Distributed {
        cycle: u32,
        recipient: MemberId,
        amount: Amount,
        attempts: u32,
        reconciled: bool,
        anomaly: Option<Anomaly>,
    },
    AlreadyDistributed {
        cycle: u32,
        recipient: Option<MemberId>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleAdvance {
    pub from: u32,
    pub to: u32,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftRow {
    pub position: u32,
    pub expected: Option<Amount>,
    pub ledger: Option<Amount>,
}

/// Ledger collateral preview and token settings compared with the local
/// schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollateralDrift {
    pub token: SettlementToken,
    pub monthly_payment: Amount,
    /// Token settings as the ledger holds them now.
    pub ledger_token: TokenConfig,
    pub mismatches: Vec<DriftRow>,
}

impl CollateralDrift {
    /// The ledger still charges the configured monthly payment.
    pub fn token_matches(&self) -> bool {
        self.ledger_token.is_active && self.ledger_token.monthly_payment == self.monthly_payment
    }

    pub fn is_clean(&self) -> bool {
        self.token_matches() && self.mismatches.is_empty()
    }
}

impl Repeatable for JoinOutcome {
    fn is_repeat(&self) -> bool {
        matches!(self, Self::AlreadyMember { .. })
    }
}

impl Repeatable for PaymentOutcome {
    fn is_repeat(&self) -> bool {
        matches!(self, Self::AlreadyPaid { .. })
    }
}

impl Repeatable for DefaultOutcome {
    fn is_repeat(&self) -> bool {
        matches!(self, Self::AlreadyRecorded { .. })
    }
}

struct Landed {
    tx_hash: Option<String>,
}

// ─────────────────────────────────────────────────────────
// Orchestrator
// ─────────────────────────────────────────────────────────

pub struct CycleOrchestrator {
    circle_id: CircleId,
    config: CircleConfig,
    model: CollateralModel,
    ledger: Arc<dyn Ledger>,
    retry: RetryExecutor,
    confirmation_timeout: Duration,
    /// Local copy of the member records, keyed by position.
    members: BTreeMap<u32, Member>,
    positions: HashMap<MemberId, u32>,
    cycle: Cycle,
    cancel: CancellationToken,
}

impl CycleOrchestrator {
    pub fn new(
        circle_id: CircleId,
        config: CircleConfig,
        ledger: Arc<dyn Ledger>,
        retry: RetryExecutor,
        confirmation_timeout: Duration,
    ) -> Self {
        Self {
            circle_id,
            model: config.model(),
            config,
            ledger,
            retry,
            confirmation_timeout,
            members: BTreeMap::new(),
            positions: HashMap::new(),
            cycle: Cycle::first(Utc::now()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn circle_id(&self) -> CircleId {
        self.circle_id
    }

    pub fn cycle(&self) -> &Cycle {
        &self.cycle
    }

    /// Members in payout order.
    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn member(&self, id: &MemberId) -> Option<&Member> {
        self.positions.get(id).and_then(|p| self.members.get(p))
    }

    /// Cancelling stops every running and future batch after the member in
    /// flight.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Head of the payout queue: lowest position that is active, has not
    /// been paid out, and has paid the current cycle.
    pub fn next_recipient(&self) -> Option<&Member> {
        let cycle = self.cycle.number;
        self.members
            .values()
            .find(|m| m.is_active && !m.has_received_payout && m.has_paid_cycle(cycle))
    }

    pub fn cycle_window_elapsed(&self, now: DateTime<Utc>) -> bool {
        chrono::Duration::from_std(self.config.cycle_duration)
            .map_or(false, |window| now - self.cycle.opened_at >= window)
    }

    /// Replace local bookkeeping with the ledger's view.
    pub async fn sync(&mut self) -> Result<ContractStats, OrchestratorError> {
        let members: Vec<Member> = self.read(ComponentKind::Members, Query::GetMembers).await?;
        let stats: ContractStats = self.read(ComponentKind::Core, Query::GetContractStats).await?;

        self.members.clear();
        self.positions.clear();
        for member in members {
            self.remember(member);
        }
        self.resolve_guarantors();

        if stats.current_cycle > 0 {
            let info: CycleInfo = self
                .read(
                    ComponentKind::Payments,
                    Query::GetCycleInfo {
                        cycle: stats.current_cycle,
                    },
                )
                .await?;
            if stats.current_cycle != self.cycle.number {
                if stats.current_cycle < self.cycle.number {
                    warn!(
                        circle_id = self.circle_id,
                        local = self.cycle.number,
                        ledger = stats.current_cycle,
                        "ledger reports an earlier cycle; following the ledger"
                    );
                }
                self.cycle = Cycle {
                    number: stats.current_cycle,
                    payout_recipient: None,
                    is_complete: false,
                    opened_at: Utc::now(),
                };
            }
            self.cycle.is_complete = info.is_complete;
            self.cycle.payout_recipient = info.payout_recipient;
        }

        info!(
            circle_id = self.circle_id,
            members = self.members.len(),
            cycle = self.cycle.number,
            "synced with ledger"
        );
        Ok(stats)
    }

    // ─── Join ─────────────────────────────────────────────

    pub async fn join_members(
        &mut self,
        candidates: &[(MemberId, SettlementToken)],
    ) -> Result<BatchReport<JoinOutcome>, OrchestratorError> {
        self.ensure_open().await?;
        let mut run = self.batch(Workflow::Join);
        for (member, token) in candidates {
            if let Some(reason) = run.halt() {
                run.skip(member.clone(), reason);
                continue;
            }
            let result = self.join_member(member, *token).await;
            run.record(member.clone(), result);
        }
        run.finish()
    }

    pub async fn join_member(
        &mut self,
        member: &MemberId,
        token: SettlementToken,
    ) -> Result<JoinOutcome, MemberError> {
        if let Some(existing) = self.member(member) {
            return Ok(JoinOutcome::AlreadyMember {
                queue_number: existing.queue_number,
            });
        }

        let n = self.config.participants;
        let monthly = self.config.monthly_payment(token).ok_or_else(|| {
            MemberError::precondition(format!("token {} not accepted", token.as_str()))
        })?;
        // The local roster may be stale; the ledger decides the next slot.
        let stats: ContractStats = self.read(ComponentKind::Core, Query::GetContractStats).await?;
        let position = stats.total_members + 1;
        if position > n {
            return Err(MemberError::precondition(format!("circle is full ({n} members)")));
        }
        let required = self
            .model
            .required_collateral(position, monthly, n)
            .map_err(|e| MemberError::precondition(e.to_string()))?;

        let available: Amount = self
            .read(
                ComponentKind::Collateral,
                Query::GetBalance {
                    member: member.clone(),
                    token,
                },
            )
            .await?;
        if available < required {
            return Err(MemberError::Failed(MemberFailure::InsufficientBalance {
                required,
                available,
            }));
        }

        let op = Operation::JoinCircle {
            member: member.clone(),
            token,
        };
        let info_query = Query::GetMemberInfo {
            member: member.clone(),
        };
        let (source, circle) = (self.ledger.as_ref(), self.circle_id);
        let probe_query = &info_query;
        let submitted = self
            .submit(
                &op,
                ComponentKind::Members,
                RetrySafety::LedgerGuarded("joinCircle rejects an address that is already a member"),
                move || async move {
                    match ledger::read::<Member>(source, circle, ComponentKind::Members, probe_query).await {
                        Ok(_) => Ok(true),
                        Err(e) if e.reject_code() == Some(RejectCode::NotFound) => Ok(false),
                        Err(e) => Err(e),
                    }
                },
            )
            .await;

        let attempted = match submitted {
            Ok(attempted) => attempted,
            Err(e) if e.reject_code() == Some(RejectCode::AlreadyMember) => {
                let existing: Member = self.read(ComponentKind::Members, info_query).await?;
                let queue_number = existing.queue_number;
                self.remember(existing);
                self.resolve_guarantors();
                return Ok(JoinOutcome::AlreadyMember { queue_number });
            }
            Err(e) => return Err(e.into()),
        };

        let mut confirmed: Member = self.read(ComponentKind::Members, info_query).await?;
        let mut anomalies = Vec::new();

        let expected = self
            .model
            .required_collateral(confirmed.position, monthly, n)
            .map_err(|e| MemberError::precondition(e.to_string()))?;
        if confirmed.locked_collateral != expected {
            warn!(
                %member,
                expected,
                confirmed = confirmed.locked_collateral,
                "locked collateral differs from the model"
            );
            anomalies.push(Anomaly::CollateralMismatch {
                member: member.clone(),
                expected,
                confirmed: confirmed.locked_collateral,
            });
        }

        let pairing = guarantor_position(confirmed.position, n)
            .map_err(|e| MemberError::precondition(e.to_string()))?;
        if confirmed.guarantor_position != pairing {
            warn!(%member, expected = pairing, confirmed = confirmed.guarantor_position, "guarantor pairing differs");
            anomalies.push(Anomaly::GuarantorMismatch {
                member: member.clone(),
                expected: pairing,
                confirmed: confirmed.guarantor_position,
            });
        }
        confirmed.guarantor_position = pairing;

        info!(
            %member,
            queue_number = confirmed.queue_number,
            collateral = confirmed.locked_collateral,
            guarantor_position = pairing,
            "member joined"
        );
        let outcome = JoinOutcome::Joined {
            queue_number: confirmed.queue_number,
            guarantor_position: pairing,
            locked_collateral: confirmed.locked_collateral,
            attempts: attempted.attempts,
            reconciled: attempted.reconciled,
            anomalies,
        };
        self.remember(confirmed);
        self.resolve_guarantors();
        Ok(outcome)
    }

    // ─── Payments ─────────────────────────────────────────

    /// Collect the current cycle's payment from every active member who has
    /// not paid it yet.
    pub async fn collect_payments(&mut self) -> Result<BatchReport<PaymentOutcome>, OrchestratorError> {
        self.ensure_open().await?;
        let cycle = self.cycle.number;
        let due: Vec<MemberId> = self
            .members
            .values()
            .filter(|m| m.is_active && !m.has_paid_cycle(cycle))
            .map(|m| m.id.clone())
            .collect();

        let mut run = self.batch(Workflow::Payment);
        for member in due {
            if let Some(reason) = run.halt() {
                run.skip(member, reason);
                continue;
            }
            let result = self.pay_member(&member).await;
            run.record(member, result);
        }
        run.finish()
    }

    /// Pay the current cycle for `member`: the monthly payment plus any
    /// pending penalty. Paying twice reports [`PaymentOutcome::AlreadyPaid`].
    pub async fn pay_member(&mut self, member: &MemberId) -> Result<PaymentOutcome, MemberError> {
        let cycle = self.cycle.number;
        let local = self
            .member(member)
            .ok_or_else(|| MemberError::precondition(format!("{member} is not a member")))?;
        if !local.is_active {
            return Err(MemberError::precondition(format!("{member} is no longer active")));
        }
        if local.has_paid_cycle(cycle) {
            debug!(%member, cycle, "already paid locally");
            return Ok(PaymentOutcome::AlreadyPaid { cycle });
        }
        let (token, pending_penalty) = (local.preferred_token, local.pending_penalty);
        let monthly = self.config.monthly_payment(token).ok_or_else(|| {
            MemberError::precondition(format!("token {} not accepted", token.as_str()))
        })?;
        let expected = monthly + pending_penalty;

        let op = Operation::MakePayment {
            member: member.clone(),
        };
        let info_query = Query::GetMemberInfo {
            member: member.clone(),
        };
        let (source, circle) = (self.ledger.as_ref(), self.circle_id);
        let probe_query = &info_query;
        let submitted = self
            .submit(
                &op,
                ComponentKind::Payments,
                RetrySafety::LedgerGuarded("makePayment rejects a second payment in the same cycle"),
                move || async move {
                    ledger::read::<Member>(source, circle, ComponentKind::Members, probe_query)
                        .await
                        .map(|m| m.has_paid_cycle(cycle))
                },
            )
            .await;

        let attempted = match submitted {
            Ok(attempted) => attempted,
            Err(e) if e.reject_code() == Some(RejectCode::AlreadyPaid) => {
                info!(%member, cycle, "ledger already holds this cycle's payment");
                let current: Member = self.read(ComponentKind::Members, info_query).await?;
                self.remember(current);
                return Ok(PaymentOutcome::AlreadyPaid { cycle });
            }
            Err(e) => return Err(e.into()),
        };

        let confirmed: Member = self.read(ComponentKind::Members, info_query).await?;
        let amount = confirmed.past_payments.last().copied().unwrap_or_default();
        let anomaly = (amount != expected).then(|| {
            warn!(%member, expected, confirmed = amount, "payment amount differs");
            Anomaly::AmountMismatch {
                member: member.clone(),
                field: "payment",
                expected,
                confirmed: amount,
            }
        });

        info!(%member, cycle, amount, tx_hash = ?attempted.value.tx_hash, "payment made");
        self.remember(confirmed);
        Ok(PaymentOutcome::Paid {
            cycle,
            amount,
            attempts: attempted.attempts,
            reconciled: attempted.reconciled,
            anomaly,
        })
    }

    // ─── Defaults ─────────────────────────────────────────

    /// Record a default for every active member who has not paid the
    /// current cycle. Call once the cycle window has elapsed.
    pub async fn handle_defaults(&mut self) -> Result<BatchReport<DefaultOutcome>, OrchestratorError> {
        let cycle = self.cycle.number;
        let late: Vec<MemberId> = self
            .members
            .values()
            .filter(|m| m.is_active && !m.has_paid_cycle(cycle))
            .map(|m| m.id.clone())
            .collect();

        let mut run = self.batch(Workflow::Default);
        for member in late {
            if let Some(reason) = run.halt() {
                run.skip(member, reason);
                continue;
            }
            let result = self.handle_default(&member).await;
            run.record(member, result);
        }
        run.finish()
    }

    pub async fn handle_default(&mut self, member: &MemberId) -> Result<DefaultOutcome, MemberError> {
        let cycle = self.cycle.number;
        let defaulter = self
            .member(member)
            .cloned()
            .ok_or_else(|| MemberError::precondition(format!("{member} is not a member")))?;
        if !defaulter.is_active {
            return Err(MemberError::precondition(format!("{member} is no longer active")));
        }
        if defaulter.has_paid_cycle(cycle) {
            return Err(MemberError::precondition(format!("{member} paid cycle {cycle}")));
        }
        let monthly = self
            .config
            .monthly_payment(defaulter.preferred_token)
            .ok_or_else(|| MemberError::precondition("member's token is no longer accepted"))?;

        let mut predicted_guarantor = defaulter
            .guarantor
            .as_ref()
            .filter(|g| *g != member)
            .and_then(|g| self.member(g))
            .cloned();
        let mut predicted = defaulter.clone();
        let settlement = settle_default(
            &self.model,
            &mut predicted,
            predicted_guarantor.as_mut(),
            monthly,
            cycle,
            self.config.participants,
            self.config.seize_on_default,
        );

        let op = Operation::HandleDefault {
            member: member.clone(),
        };
        let info_query = Query::GetMemberInfo {
            member: member.clone(),
        };
        let (source, circle) = (self.ledger.as_ref(), self.circle_id);
        let probe_query = &info_query;
        let defaults_before = defaulter.default_count;
        let submitted = self
            .submit(
                &op,
                ComponentKind::Collateral,
                RetrySafety::LedgerGuarded("handleDefault rejects a second default in the same cycle"),
                move || async move {
                    ledger::read::<Member>(source, circle, ComponentKind::Members, probe_query)
                        .await
                        .map(|m| m.default_count > defaults_before)
                },
            )
            .await;

        let attempted = match submitted {
            Ok(attempted) => attempted,
            Err(e) if e.reject_code() == Some(RejectCode::AlreadyDefaulted) => {
                info!(%member, cycle, "default already recorded");
                let current: Member = self.read(ComponentKind::Members, info_query).await?;
                self.remember(current);
                return Ok(DefaultOutcome::AlreadyRecorded { cycle });
            }
            Err(e) => return Err(e.into()),
        };

        let mut anomalies = Vec::new();
        let confirmed: Member = self.read(ComponentKind::Members, info_query).await?;
        for (field, expected, actual) in [
            ("locked_collateral", predicted.locked_collateral, confirmed.locked_collateral),
            ("pending_penalty", predicted.pending_penalty, confirmed.pending_penalty),
        ] {
            compare(&mut anomalies, member, field, expected, actual);
        }
        self.remember(confirmed);

        let guarantor_id = match predicted_guarantor {
            Some(predicted_g) => {
                let confirmed_g: Member = self
                    .read(
                        ComponentKind::Members,
                        Query::GetMemberInfo {
                            member: predicted_g.id.clone(),
                        },
                    )
                    .await?;
                let id = predicted_g.id.clone();
                for (field, expected, actual) in [
                    ("locked_collateral", predicted_g.locked_collateral, confirmed_g.locked_collateral),
                    ("guarantor_liability", predicted_g.guarantor_liability, confirmed_g.guarantor_liability),
                ] {
                    compare(&mut anomalies, &id, field, expected, actual);
                }
                self.remember(confirmed_g);
                Some(id)
            }
            None => None,
        };

        info!(
            %member,
            cycle,
            penalty = settlement.penalty,
            owed = settlement.amount_owed,
            seized = settlement.seizure.map(|s| s.total_seizable),
            "default recorded"
        );
        Ok(DefaultOutcome::Recorded {
            cycle,
            penalty: settlement.penalty,
            amount_owed: settlement.amount_owed,
            seizure: settlement.seizure,
            guarantor: guarantor_id,
            attempts: attempted.attempts,
            reconciled: attempted.reconciled,
            anomalies,
        })
    }

    // ─── Payout and cycle advance ─────────────────────────

    pub async fn distribute_payout(&mut self) -> Result<PayoutOutcome, OrchestratorError> {
        let cycle = self.cycle.number;
        if self.cycle.is_complete {
            return Ok(PayoutOutcome::AlreadyDistributed {
                cycle,
                recipient: self.cycle.payout_recipient.clone(),
            });
        }
        let expected = self
            .next_recipient()
            .map(|m| m.id.clone())
            .ok_or(OrchestratorError::NoEligibleRecipient { cycle })?;

        let cycle_query = Query::GetCycleInfo { cycle };
        let (source, circle) = (self.ledger.as_ref(), self.circle_id);
        let probe_query = &cycle_query;
        let submitted = self
            .submit(
                &Operation::DistributePayout,
                ComponentKind::Payments,
                RetrySafety::LedgerGuarded("distributePayout rejects a completed cycle"),
                move || async move {
                    ledger::read::<CycleInfo>(source, circle, ComponentKind::Payments, probe_query)
                        .await
                        .map(|info| info.is_complete)
                },
            )
            .await;

        let attempted = match submitted {
            Ok(attempted) => Some(attempted),
            Err(e) if e.reject_code() == Some(RejectCode::PayoutAlreadyDistributed) => None,
            Err(e) => return Err(e.into()),
        };

        let info: CycleInfo = self.read(ComponentKind::Payments, cycle_query).await?;
        if let Some(recipient) = &info.payout_recipient {
            let record: Member = self
                .read(
                    ComponentKind::Members,
                    Query::GetMemberInfo {
                        member: recipient.clone(),
                    },
                )
                .await?;
            self.remember(record);
        }
        self.cycle.is_complete = info.is_complete;
        self.cycle.payout_recipient = info.payout_recipient.clone();

        let Some(attempted) = attempted else {
            info!(cycle, "payout already distributed");
            return Ok(PayoutOutcome::AlreadyDistributed {
                cycle,
                recipient: info.payout_recipient,
            });
        };

        let anomaly = (info.payout_recipient.as_ref() != Some(&expected)).then(|| {
            warn!(cycle, %expected, confirmed = ?info.payout_recipient, "payout went to another member");
            Anomaly::RecipientMismatch {
                cycle,
                expected: expected.clone(),
                confirmed: info.payout_recipient.clone(),
            }
        });
        let recipient = info.payout_recipient.unwrap_or(expected);
        info!(cycle, %recipient, amount = info.payout_amount, "payout distributed");
        Ok(PayoutOutcome::Distributed {
            cycle,
            recipient,
            amount: info.payout_amount,
            attempts: attempted.attempts,
            reconciled: attempted.reconciled,
            anomaly,
        })
    }

    /// Open the next cycle. Refused while the current one is incomplete.
    pub async fn advance_cycle(&mut self) -> Result<CycleAdvance, OrchestratorError> {
        let from = self.cycle.number;
        if !self.cycle.is_complete {
            return Err(OrchestratorError::CycleNotComplete { cycle: from });
        }

        let stats_query = Query::GetContractStats;
        let (source, circle) = (self.ledger.as_ref(), self.circle_id);
        let probe_query = &stats_query;
        let submitted = self
            .submit(
                &Operation::AdvanceCycle,
                ComponentKind::Core,
                RetrySafety::LedgerGuarded("advanceCycle rejects a cycle that is not complete"),
                move || async move {
                    ledger::read::<ContractStats>(source, circle, ComponentKind::Core, probe_query)
                        .await
                        .map(|stats| stats.current_cycle > from)
                },
            )
            .await;

        // A rejection may mean an earlier attempt already advanced.
        let attempts = match submitted {
            Ok(attempted) => attempted.attempts,
            Err(e) if e.reject_code() == Some(RejectCode::CycleNotComplete) => e.attempts(),
            Err(e) => return Err(e.into()),
        };

        let stats: ContractStats = self.read(ComponentKind::Core, stats_query).await?;
        if stats.current_cycle <= from {
            return Err(OrchestratorError::CycleNotComplete { cycle: from });
        }
        self.cycle = Cycle {
            number: stats.current_cycle,
            payout_recipient: None,
            is_complete: false,
            opened_at: Utc::now(),
        };
        info!(from, to = stats.current_cycle, "cycle advanced");
        Ok(CycleAdvance {
            from,
            to: stats.current_cycle,
            attempts,
        })
    }

    /// Compare the ledger's collateral preview for `token` with the local
    /// schedule.
    pub async fn check_collateral_drift(
        &self,
        token: SettlementToken,
    ) -> Result<CollateralDrift, OrchestratorError> {
        let n = self.config.participants;
        let monthly = self
            .config
            .monthly_payment(token)
            .ok_or(OrchestratorError::TokenNotAccepted(token))?;
        let expected = self.model.schedule(monthly, n)?;
        let ledger_token: TokenConfig = self
            .read(ComponentKind::Core, Query::GetTokenConfig { token })
            .await?;
        let quoted: Vec<CollateralQuote> = self
            .read(
                ComponentKind::Collateral,
                Query::GetCollateralDemo {
                    participants: n,
                    monthly_payment: monthly,
                },
            )
            .await?;

        let highest = quoted.iter().map(|q| q.position).max().unwrap_or(0).max(n);
        let mismatches: Vec<DriftRow> = (1..=highest)
            .filter_map(|position| {
                let expected = expected
                    .iter()
                    .find(|q| q.position == position)
                    .map(|q| q.collateral);
                let ledger = quoted
                    .iter()
                    .find(|q| q.position == position)
                    .map(|q| q.collateral);
                (expected != ledger).then_some(DriftRow {
                    position,
                    expected,
                    ledger,
                })
            })
            .collect();

        if !mismatches.is_empty() {
            warn!(
                token = token.as_str(),
                rows = mismatches.len(),
                "ledger collateral schedule drifted from the model"
            );
        }
        let drift = CollateralDrift {
            token,
            monthly_payment: monthly,
            ledger_token,
            mismatches,
        };
        if !drift.token_matches() {
            warn!(
                token = token.as_str(),
                configured = monthly,
                ledger = drift.ledger_token.monthly_payment,
                active = drift.ledger_token.is_active,
                "ledger token settings differ from the configuration"
            );
        }
        Ok(drift)
    }

    // ─── Helpers ──────────────────────────────────────────

    fn batch<O>(&self, workflow: Workflow) -> BatchRun<O> {
        BatchRun::new(
            workflow,
            self.cycle.number,
            self.config.circuit_breaker_threshold,
            self.cancel.clone(),
        )
    }

    fn remember(&mut self, member: Member) {
        self.positions.insert(member.id.clone(), member.position);
        self.members.insert(member.position, member);
    }

    fn resolve_guarantors(&mut self) {
        let by_position: HashMap<u32, MemberId> = self
            .members
            .iter()
            .map(|(position, m)| (*position, m.id.clone()))
            .collect();
        for member in self.members.values_mut() {
            member.guarantor = by_position.get(&member.guarantor_position).cloned();
        }
    }

    async fn ensure_open(&self) -> Result<CircleInstance, OrchestratorError> {
        let instance: CircleInstance = self
            .read(ComponentKind::Factory, Query::GetCircleInstance)
            .await?;
        if !instance.can_accept_members() {
            return Err(OrchestratorError::CircleNotReady {
                circle_id: self.circle_id,
                phase: instance.phase,
                is_active: instance.is_active,
            });
        }
        Ok(instance)
    }

    async fn read<T: DeserializeOwned>(
        &self,
        component: ComponentKind,
        query: Query,
    ) -> Result<T, RetryError<LedgerError>> {
        let (source, circle) = (self.ledger.as_ref(), self.circle_id);
        let query = &query;
        let attempted = self
            .retry
            .execute(query.name(), RetrySafety::Read, move |_| {
                ledger::read::<T>(source, circle, component, query)
            })
            .await?;
        Ok(attempted.value)
    }

    /// Submit `op` and wait for confirmation. After an ambiguous outcome
    /// `landed` re-reads the ledger to tell whether the operation took
    /// effect.
    async fn submit<P, PFut>(
        &self,
        op: &Operation,
        component: ComponentKind,
        safety: RetrySafety,
        mut landed: P,
    ) -> Result<Attempted<Landed>, RetryError<LedgerError>>
    where
        P: FnMut() -> PFut,
        PFut: Future<Output = Result<bool, LedgerError>>,
    {
        let (source, circle) = (self.ledger.as_ref(), self.circle_id);
        let timeout = self.confirmation_timeout;
        self.retry
            .execute_with_probe(
                op.name(),
                safety,
                move |_| async move {
                    submit_and_confirm(source, Some(circle), component, op, timeout)
                        .await
                        .map(|receipt| Landed {
                            tx_hash: Some(receipt.tx_hash),
                        })
                },
                move || {
                    let check = landed();
                    async move {
                        check
                            .await
                            .map(|hit| hit.then_some(Landed { tx_hash: None }))
                    }
                },
            )
            .await
    }
}

fn compare(
    anomalies: &mut Vec<Anomaly>,
    member: &MemberId,
    field: &'static str,
    expected: Amount,
    confirmed: Amount,
) {
    if expected != confirmed {
        warn!(%member, field, expected, confirmed, "ledger settlement differs from the model");
        anomalies.push(Anomaly::AmountMismatch {
            member: member.clone(),
            field,
            expected,
            confirmed,
        });
    }
}
