//! In-memory ledger with fault injection.
//!
//! Implements the circle contracts' observable behaviour closely enough to
//! drive the orchestrator end to end: phases and component links, balances,
//! joins, payments, defaults with seizure, payouts and cycle advance. Every
//! submission is applied immediately; confirmation hands back the stored
//! outcome.
//!
//! Faults are armed per test:
//!
//! | Fault                         | Effect                                          |
//! |-------------------------------|-------------------------------------------------|
//! | `fail_next_submissions(n)`    | next `n` submits fail before reaching the ledger |
//! | `time_out_next_confirmations` | operation lands, confirmation times out         |
//! | `break_link(phase)`           | linking `phase` leaves one component unset      |
//! | `omit_circle_created_event`   | registration receipt lacks `CircleCreated`      |
//! | `skew_join_collateral(d)`     | joins lock `required + d`                       |
//! | `skew_collateral_demo(d)`     | `getCollateralDemo` adds `d` to every row       |

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

use crate::collateral::{guarantor_position, settle_default, CollateralModel};
use crate::errors::{LedgerError, RejectCode, TransportFault};
use crate::events::{ReceiptEvent, CIRCLE_CREATED_SCHEMA};
use crate::ledger::{Ledger, Operation, Query, Receipt, SubmissionHandle};
use crate::types::{
    Amount, CircleId, CircleInstance, ComponentKind, ContractStats, CycleInfo, Member, MemberId,
    Phase, SettlementToken, TokenConfig, INITIAL_REPUTATION,
};

#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    next_circle_id: CircleId,
    next_tx: u64,
    circles: BTreeMap<CircleId, CircleState>,
    balances: HashMap<(MemberId, SettlementToken), Amount>,
    outcomes: HashMap<String, Result<Receipt, LedgerError>>,
    applied: Vec<&'static str>,
    faults: Faults,
}

#[derive(Default)]
struct Faults {
    failing_submissions: u32,
    timed_out_confirmations: u32,
    broken_link: Option<Phase>,
    omit_created_event: bool,
    join_skew: Amount,
    demo_skew: Amount,
}

struct CircleState {
    instance: CircleInstance,
    participants: u32,
    tokens: BTreeMap<SettlementToken, TokenConfig>,
    model: CollateralModel,
    seize_on_default: bool,
    members: Vec<Member>,
    current_cycle: u32,
    cycles: BTreeMap<u32, CycleInfo>,
    defaults: HashSet<(MemberId, u32)>,
}

impl CircleState {
    fn member_index(&self, member: &MemberId) -> Result<usize, RejectCode> {
        self.members
            .iter()
            .position(|m| &m.id == member)
            .ok_or(RejectCode::NotFound)
    }

    fn monthly(&self, token: SettlementToken) -> Result<Amount, RejectCode> {
        self.tokens
            .get(&token)
            .filter(|t| t.is_active)
            .map(|t| t.monthly_payment)
            .ok_or(RejectCode::TokenInactive)
    }

    fn cycle_info(&mut self) -> &mut CycleInfo {
        let number = self.current_cycle;
        self.cycles.entry(number).or_insert_with(|| CycleInfo {
            number,
            payout_recipient: None,
            payout_amount: 0,
            paid_members: 0,
            is_complete: false,
        })
    }

    fn resolve_guarantors(&mut self) {
        let by_position: HashMap<u32, MemberId> = self
            .members
            .iter()
            .map(|m| (m.position, m.id.clone()))
            .collect();
        for member in &mut self.members {
            member.guarantor = by_position.get(&member.guarantor_position).cloned();
        }
    }

    fn stats(&self) -> ContractStats {
        ContractStats {
            total_members: self.members.len() as u32,
            active_members: self.members.iter().filter(|m| m.is_active).count() as u32,
            current_cycle: self.current_cycle,
            total_collateral: self.members.iter().map(|m| m.locked_collateral).sum(),
            contract_balance: self.members.iter().map(|m| m.locked_collateral).sum::<Amount>()
                + self
                    .cycles
                    .values()
                    .filter(|c| !c.is_complete)
                    .map(|c| c.payout_amount)
                    .sum::<Amount>(),
        }
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fund(&self, member: &MemberId, token: SettlementToken, amount: Amount) {
        *self
            .state()
            .balances
            .entry((member.clone(), token))
            .or_default() += amount;
    }

    pub fn balance(&self, member: &MemberId, token: SettlementToken) -> Amount {
        self.state()
            .balances
            .get(&(member.clone(), token))
            .copied()
            .unwrap_or_default()
    }

    pub fn fail_next_submissions(&self, count: u32) {
        self.state().faults.failing_submissions = count;
    }

    pub fn time_out_next_confirmations(&self, count: u32) {
        self.state().faults.timed_out_confirmations = count;
    }

    pub fn break_link(&self, phase: Phase) {
        self.state().faults.broken_link = Some(phase);
    }

    pub fn heal_links(&self) {
        self.state().faults.broken_link = None;
    }

    pub fn omit_circle_created_event(&self) {
        self.state().faults.omit_created_event = true;
    }

    pub fn skew_join_collateral(&self, delta: Amount) {
        self.state().faults.join_skew = delta;
    }

    pub fn skew_collateral_demo(&self, delta: Amount) {
        self.state().faults.demo_skew = delta;
    }

    /// Replace a circle's token settings, as a governance vote would.
    pub fn set_token_config(&self, circle: CircleId, config: TokenConfig) {
        if let Some(c) = self.state().circles.get_mut(&circle) {
            c.tokens.insert(config.token, config);
        }
    }

    /// How many times `operation` was applied to the ledger.
    pub fn applied_count(&self, operation: &str) -> usize {
        self.state()
            .applied
            .iter()
            .filter(|name| **name == operation)
            .count()
    }

    pub fn circle_count(&self) -> usize {
        self.state().circles.len()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn submit(
        &self,
        circle: Option<CircleId>,
        _component: ComponentKind,
        op: &Operation,
    ) -> Result<SubmissionHandle, LedgerError> {
        let mut state = self.state();
        if state.faults.failing_submissions > 0 {
            state.faults.failing_submissions -= 1;
            return Err(LedgerError::transport(
                TransportFault::ConnectionReset,
                "connection reset by peer",
            ));
        }

        state.next_tx += 1;
        let tx_hash = format!("tx-{:08}", state.next_tx);
        let ledger_seq = 1_000 + state.next_tx;

        let outcome = state
            .apply(circle, op)
            .map(|events| Receipt {
                tx_hash: tx_hash.clone(),
                ledger: ledger_seq,
                events,
            })
            .map_err(|code| LedgerError::Rejected {
                operation: op.name().to_string(),
                code,
                message: format!("{} rejected", op.name()),
            });
        if outcome.is_ok() {
            state.applied.push(op.name());
        }
        state.outcomes.insert(tx_hash.clone(), outcome);
        Ok(SubmissionHandle { tx_hash })
    }

    async fn wait_for_confirmation(
        &self,
        handle: &SubmissionHandle,
        timeout: Duration,
    ) -> Result<Receipt, LedgerError> {
        let mut state = self.state();
        if state.faults.timed_out_confirmations > 0 {
            state.faults.timed_out_confirmations -= 1;
            return Err(LedgerError::ConfirmationTimeout {
                tx_hash: handle.tx_hash.clone(),
                waited_ms: timeout.as_millis() as u64,
            });
        }
        state
            .outcomes
            .get(&handle.tx_hash)
            .cloned()
            .unwrap_or_else(|| Err(LedgerError::rejected("getTransaction", RejectCode::NotFound)))
    }

    async fn query(
        &self,
        circle: CircleId,
        _component: ComponentKind,
        query: &Query,
    ) -> Result<Value, LedgerError> {
        let state = self.state();
        let reject = |code| LedgerError::rejected(query.name(), code);
        let c = state.circles.get(&circle).ok_or_else(|| reject(RejectCode::NotFound))?;

        match query {
            Query::GetCircleInstance => to_value(&c.instance),
            Query::GetMemberInfo { member } => {
                let idx = c.member_index(member).map_err(reject)?;
                to_value(&c.members[idx])
            }
            Query::GetMembers => to_value(&c.members),
            Query::GetContractStats => to_value(&c.stats()),
            Query::GetCollateralDemo {
                participants,
                monthly_payment,
            } => {
                let mut schedule = c
                    .model
                    .schedule(*monthly_payment, *participants)
                    .map_err(|_| reject(RejectCode::Other(400)))?;
                for quote in &mut schedule {
                    quote.collateral += state.faults.demo_skew;
                }
                to_value(&schedule)
            }
            Query::GetCycleInfo { cycle } => {
                let info = c.cycles.get(cycle).ok_or_else(|| reject(RejectCode::NotFound))?;
                to_value(info)
            }
            Query::GetTokenConfig { token } => {
                let config = c.tokens.get(token).ok_or_else(|| reject(RejectCode::NotFound))?;
                to_value(config)
            }
            Query::GetBalance { member, token } => Ok(json!(state
                .balances
                .get(&(member.clone(), *token))
                .copied()
                .unwrap_or_default())),
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, LedgerError> {
    serde_json::to_value(value).map_err(|e| LedgerError::Decode(e.to_string()))
}

fn component_address(circle: CircleId, kind: ComponentKind) -> String {
    format!("C{circle:04}{kind:?}").to_uppercase()
}

impl State {
    fn apply(
        &mut self,
        circle: Option<CircleId>,
        op: &Operation,
    ) -> Result<Vec<ReceiptEvent>, RejectCode> {
        if let Operation::CreateCircle { .. } = op {
            return self.create_circle(op);
        }

        let id = circle.ok_or(RejectCode::NotFound)?;
        let broken_link = self.faults.broken_link;
        let join_skew = self.faults.join_skew;
        let c = self.circles.get_mut(&id).ok_or(RejectCode::NotFound)?;

        match op {
            Operation::CreateCircle { .. } => unreachable!("handled above"),
            Operation::InitializeBasic => link(
                c,
                Phase::BasicLinked,
                &[ComponentKind::Members, ComponentKind::Governance],
                broken_link,
            ),
            Operation::InitializeEconomic => link(
                c,
                Phase::EconomicLinked,
                &[ComponentKind::Collateral, ComponentKind::Payments],
                broken_link,
            ),
            Operation::InitializeCore => {
                let events = link(c, Phase::Active, &[ComponentKind::Core], broken_link)?;
                c.instance.is_active = true;
                if c.current_cycle == 0 {
                    c.current_cycle = 1;
                    c.cycle_info();
                }
                Ok(events)
            }
            Operation::Finalize => match c.instance.phase {
                Phase::Active | Phase::Finalized => {
                    c.instance.phase = Phase::Finalized;
                    Ok(vec![phase_event(id, Phase::Finalized)])
                }
                _ => Err(RejectCode::PhaseMismatch),
            },
            Operation::DeactivateCircle => {
                c.instance.is_active = false;
                Ok(vec![])
            }
            Operation::JoinCircle { member, token } => {
                if !c.instance.can_accept_members() {
                    return Err(RejectCode::NotActive);
                }
                if c.member_index(member).is_ok() {
                    return Err(RejectCode::AlreadyMember);
                }
                if c.members.len() as u32 >= c.participants {
                    return Err(RejectCode::CircleFull);
                }
                let monthly = c.monthly(*token)?;
                let position = c.members.len() as u32 + 1;
                let required = c
                    .model
                    .required_collateral(position, monthly, c.participants)
                    .map_err(|_| RejectCode::Other(400))?;
                let locked = required + join_skew;

                let balance = self.balances.entry((member.clone(), *token)).or_default();
                if *balance < locked {
                    return Err(RejectCode::InsufficientBalance);
                }
                *balance -= locked;

                let guarantor_position = guarantor_position(position, c.participants)
                    .map_err(|_| RejectCode::Other(400))?;
                c.members.push(Member {
                    id: member.clone(),
                    queue_number: position,
                    position,
                    locked_collateral: locked,
                    required_collateral: required,
                    guarantor_position,
                    guarantor: None,
                    preferred_token: *token,
                    reputation_score: INITIAL_REPUTATION,
                    past_payments: Vec::new(),
                    last_payment_cycle: 0,
                    default_count: 0,
                    pending_penalty: 0,
                    guarantor_liability: 0,
                    is_active: true,
                    has_received_payout: false,
                });
                c.resolve_guarantors();
                Ok(vec![ReceiptEvent::new(
                    "MemberJoined",
                    1,
                    json!({ "member": member, "queue_number": position, "collateral": locked }),
                )])
            }
            Operation::MakePayment { member } => {
                if !c.instance.can_process_payments() {
                    return Err(RejectCode::NotActive);
                }
                let idx = c.member_index(member)?;
                let cycle = c.current_cycle;
                let m = &c.members[idx];
                if !m.is_active {
                    return Err(RejectCode::NotActive);
                }
                if m.has_paid_cycle(cycle) {
                    return Err(RejectCode::AlreadyPaid);
                }
                let token = m.preferred_token;
                let amount = c.monthly(token)? + m.pending_penalty;

                let balance = self.balances.entry((member.clone(), token)).or_default();
                if *balance < amount {
                    return Err(RejectCode::InsufficientBalance);
                }
                *balance -= amount;

                let m = &mut c.members[idx];
                m.past_payments.push(amount);
                m.last_payment_cycle = cycle;
                m.pending_penalty = 0;
                let info = c.cycle_info();
                info.paid_members += 1;
                info.payout_amount += amount;
                Ok(vec![ReceiptEvent::new(
                    "PaymentMade",
                    1,
                    json!({ "member": member, "cycle": cycle, "amount": amount }),
                )])
            }
            Operation::HandleDefault { member } => {
                let idx = c.member_index(member)?;
                let cycle = c.current_cycle;
                if c.defaults.contains(&(member.clone(), cycle)) {
                    return Err(RejectCode::AlreadyDefaulted);
                }
                if c.members[idx].has_paid_cycle(cycle) {
                    return Err(RejectCode::AlreadyPaid);
                }
                let monthly = c.monthly(c.members[idx].preferred_token)?;
                let guarantor_idx = c.members[idx]
                    .guarantor
                    .as_ref()
                    .and_then(|g| c.member_index(g).ok())
                    .filter(|g| *g != idx);

                let model = c.model;
                let (participants, seize) = (c.participants, c.seize_on_default);
                let settlement = match guarantor_idx {
                    Some(g) => {
                        let (defaulter, guarantor) = pair_mut(&mut c.members, idx, g);
                        settle_default(
                            &model,
                            defaulter,
                            Some(guarantor),
                            monthly,
                            cycle,
                            participants,
                            seize,
                        )
                    }
                    None => settle_default(
                        &model,
                        &mut c.members[idx],
                        None,
                        monthly,
                        cycle,
                        participants,
                        seize,
                    ),
                };
                c.defaults.insert((member.clone(), cycle));
                Ok(vec![ReceiptEvent::new(
                    "DefaultHandled",
                    1,
                    json!({ "member": member, "cycle": cycle, "penalty": settlement.penalty }),
                )])
            }
            Operation::DistributePayout => {
                if !c.instance.can_process_payments() {
                    return Err(RejectCode::NotActive);
                }
                let cycle = c.current_cycle;
                if c.cycle_info().is_complete {
                    return Err(RejectCode::PayoutAlreadyDistributed);
                }
                let idx = c
                    .members
                    .iter()
                    .enumerate()
                    .filter(|(_, m)| m.is_active && !m.has_received_payout && m.has_paid_cycle(cycle))
                    .min_by_key(|(_, m)| m.position)
                    .map(|(i, _)| i)
                    .ok_or(RejectCode::NotFound)?;

                let recipient = c.members[idx].id.clone();
                let token = c.members[idx].preferred_token;
                c.members[idx].has_received_payout = true;
                let info = c.cycle_info();
                info.payout_recipient = Some(recipient.clone());
                info.is_complete = true;
                let amount = info.payout_amount;
                *self.balances.entry((recipient.clone(), token)).or_default() += amount;
                Ok(vec![ReceiptEvent::new(
                    "PayoutDistributed",
                    1,
                    json!({ "recipient": recipient, "cycle": cycle, "amount": amount }),
                )])
            }
            Operation::AdvanceCycle => {
                if !c.cycle_info().is_complete {
                    return Err(RejectCode::CycleNotComplete);
                }
                c.current_cycle += 1;
                c.cycle_info();
                Ok(vec![ReceiptEvent::new(
                    "CycleAdvanced",
                    1,
                    json!({ "cycle": c.current_cycle }),
                )])
            }
        }
    }

    fn create_circle(&mut self, op: &Operation) -> Result<Vec<ReceiptEvent>, RejectCode> {
        let Operation::CreateCircle {
            creator,
            participants,
            tokens,
            collateral_factor_bps,
            penalty_rate_bps,
            seize_on_default,
            ..
        } = op
        else {
            return Err(RejectCode::Other(400));
        };
        if *participants == 0 || tokens.is_empty() {
            return Err(RejectCode::Other(400));
        }

        self.next_circle_id += 1;
        let id = self.next_circle_id;
        let instance = CircleInstance {
            id,
            phase: Phase::Created,
            creator: creator.clone(),
            component_addresses: BTreeMap::from([(
                ComponentKind::Factory,
                component_address(id, ComponentKind::Factory),
            )]),
            is_active: false,
            created_at: Utc::now(),
        };
        self.circles.insert(
            id,
            CircleState {
                instance,
                participants: *participants,
                tokens: tokens.iter().map(|t| (t.token, t.clone())).collect(),
                model: CollateralModel::new(*collateral_factor_bps, *penalty_rate_bps),
                seize_on_default: *seize_on_default,
                members: Vec::new(),
                current_cycle: 0,
                cycles: BTreeMap::new(),
                defaults: HashSet::new(),
            },
        );

        if self.faults.omit_created_event {
            return Ok(vec![]);
        }
        Ok(vec![ReceiptEvent::new(
            "CircleCreated",
            CIRCLE_CREATED_SCHEMA,
            json!({ "circle_id": id, "creator": creator }),
        )])
    }
}

/// Link `components` and move to `target`. Re-linking at `target` is a no-op
/// rewrite of the same addresses.
fn link(
    c: &mut CircleState,
    target: Phase,
    components: &[ComponentKind],
    broken_link: Option<Phase>,
) -> Result<Vec<ReceiptEvent>, RejectCode> {
    let current = c.instance.phase;
    if current != target && Some(current) != target.previous() {
        return Err(RejectCode::PhaseMismatch);
    }
    let id = c.instance.id;
    for (i, kind) in components.iter().enumerate() {
        let skip = broken_link == Some(target) && i + 1 == components.len();
        if skip {
            c.instance.component_addresses.remove(kind);
        } else {
            c.instance
                .component_addresses
                .insert(*kind, component_address(id, *kind));
        }
    }
    c.instance.phase = target;
    Ok(vec![phase_event(id, target)])
}

fn phase_event(circle: CircleId, phase: Phase) -> ReceiptEvent {
    ReceiptEvent::new(
        "PhaseAdvanced",
        1,
        json!({ "circle_id": circle, "phase": phase.number() }),
    )
}

fn pair_mut<T>(items: &mut [T], a: usize, b: usize) -> (&mut T, &mut T) {
    assert_ne!(a, b);
    if a < b {
        let (left, right) = items.split_at_mut(b);
        (&mut left[a], &mut right[0])
    } else {
        let (left, right) = items.split_at_mut(a);
        (&mut right[0], &mut left[b])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{read, submit_and_confirm};

    const WAIT: Duration = Duration::from_secs(1);

    fn create_op() -> Operation {
        Operation::CreateCircle {
            creator: "GCREATOR".to_string(),
            participants: 3,
            tokens: vec![TokenConfig {
                token: SettlementToken::TokenA,
                monthly_payment: 100,
                is_active: true,
            }],
            collateral_factor_bps: 5_500,
            penalty_rate_bps: 500,
            cycle_duration_secs: 60,
            seize_on_default: true,
        }
    }

    async fn run(ledger: &MemoryLedger, circle: CircleId, op: Operation) -> Result<Receipt, LedgerError> {
        submit_and_confirm(ledger, Some(circle), ComponentKind::Factory, &op, WAIT).await
    }

    #[tokio::test]
    async fn phases_only_link_in_order() {
        let ledger = MemoryLedger::new();
        submit_and_confirm(&ledger, None, ComponentKind::Factory, &create_op(), WAIT)
            .await
            .unwrap();

        let err = run(&ledger, 1, Operation::InitializeEconomic).await.unwrap_err();
        assert_eq!(err.reject_code(), Some(RejectCode::PhaseMismatch));

        run(&ledger, 1, Operation::InitializeBasic).await.unwrap();
        run(&ledger, 1, Operation::InitializeBasic).await.unwrap();
        run(&ledger, 1, Operation::InitializeEconomic).await.unwrap();

        let circle: CircleInstance = read(&ledger, 1, ComponentKind::Factory, &Query::GetCircleInstance)
            .await
            .unwrap();
        assert_eq!(circle.phase, Phase::EconomicLinked);
        assert!(circle.missing_components(Phase::EconomicLinked).is_empty());
    }

    #[tokio::test]
    async fn failed_submission_is_not_applied() {
        let ledger = MemoryLedger::new();
        ledger.fail_next_submissions(1);
        let err = submit_and_confirm(&ledger, None, ComponentKind::Factory, &create_op(), WAIT)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Transport { .. }));
        assert_eq!(ledger.circle_count(), 0);
    }

    #[tokio::test]
    async fn timed_out_confirmation_still_lands() {
        let ledger = MemoryLedger::new();
        ledger.time_out_next_confirmations(1);
        let err = submit_and_confirm(&ledger, None, ComponentKind::Factory, &create_op(), WAIT)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::ConfirmationTimeout { .. }));
        assert_eq!(ledger.circle_count(), 1);
        assert_eq!(ledger.applied_count("createCircle"), 1);
    }

    #[test]
    fn pair_mut_returns_requested_order() {
        let mut items = vec![1, 2, 3];
        let (a, b) = pair_mut(&mut items, 2, 0);
        assert_eq!((*a, *b), (3, 1));
    }
}
