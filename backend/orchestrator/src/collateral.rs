//! Collateral sizing, guarantor pairing and seizure decomposition.
//!
//! Every function here is pure and must agree with the ledger-side contract
//! bit for bit: the orchestrator uses these numbers to detect drift before it
//! submits anything.
//!
//! ## Collateral schedule
//!
//! ```text
//! outstanding(p) = monthly × (N − p)
//! collateral(p)  = outstanding(p) × factor_bps / 10 000   (rounded toward zero)
//! ```
//!
//! The last position owes nothing: by the time it is paid out it has paid in
//! for every other member.
//!
//! ## Guarantor pairing
//!
//! ```text
//! guarantor(p) = ((p − 1 + ⌊N / 2⌋) mod N) + 1
//! ```
//!
//! Early positions are backed by late ones, whose stake is still locked when
//! the early member might walk away.

use serde::{Deserialize, Serialize};

use crate::errors::CollateralError;
use crate::types::{Amount, CollateralQuote, Member, DEFAULT_REPUTATION_PENALTY};

/// Reference collateral factor: 0.55.
pub const DEFAULT_COLLATERAL_FACTOR_BPS: u32 = 5_500;

/// Reference default penalty: 5% of the monthly payment.
pub const DEFAULT_PENALTY_RATE_BPS: u32 = 500;

const BPS_DENOMINATOR: Amount = 10_000;

/// What can be taken from a defaulter and their guarantor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeizableAssets {
    /// Sum of every seized source, guarantor included.
    pub total_seizable: Amount,
    /// Taken from the defaulter's own locked collateral.
    pub collateral_seized: Amount,
    /// Taken from the defaulter's paid-in, not yet paid-back contributions.
    pub payments_seized: Amount,
    /// Liability the guarantor is bonded for once the defaulter's collateral
    /// falls short.
    pub guarantor_liability: Amount,
    /// Taken from the guarantor's locked collateral; never above it.
    pub guarantor_contribution: Amount,
    /// Left over once collateral, the guarantor and contributions are
    /// exhausted.
    pub unrecovered: Amount,
}

/// Collateral formulas parameterised by the circle's configured rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollateralModel {
    pub factor_bps: u32,
    pub penalty_rate_bps: u32,
}

impl Default for CollateralModel {
    fn default() -> Self {
        Self {
            factor_bps: DEFAULT_COLLATERAL_FACTOR_BPS,
            penalty_rate_bps: DEFAULT_PENALTY_RATE_BPS,
        }
    }
}

impl CollateralModel {
    pub fn new(factor_bps: u32, penalty_rate_bps: u32) -> Self {
        Self {
            factor_bps,
            penalty_rate_bps,
        }
    }

    /// Collateral a member must lock to take `position`.
    pub fn required_collateral(
        &self,
        position: u32,
        monthly_payment: Amount,
        total_participants: u32,
    ) -> Result<Amount, CollateralError> {
        check_position(position, total_participants)?;
        if monthly_payment <= 0 {
            return Err(CollateralError::NonPositivePayment(monthly_payment));
        }

        let remaining = Amount::from(total_participants - position);
        monthly_payment
            .checked_mul(remaining)
            .and_then(|debt| debt.checked_mul(Amount::from(self.factor_bps)))
            .map(|scaled| scaled / BPS_DENOMINATOR)
            .ok_or(CollateralError::Overflow)
    }

    /// Collateral for every position, first to last.
    pub fn schedule(
        &self,
        monthly_payment: Amount,
        total_participants: u32,
    ) -> Result<Vec<CollateralQuote>, CollateralError> {
        if total_participants == 0 {
            return Err(CollateralError::EmptyCircle);
        }
        (1..=total_participants)
            .map(|position| {
                self.required_collateral(position, monthly_payment, total_participants)
                    .map(|collateral| CollateralQuote {
                        position,
                        collateral,
                    })
            })
            .collect()
    }

    /// Penalty accrued by one default.
    pub fn penalty(&self, monthly_payment: Amount) -> Amount {
        monthly_payment.saturating_mul(Amount::from(self.penalty_rate_bps)) / BPS_DENOMINATOR
    }

    /// Decompose what can be recovered from `defaulter` (and `guarantor`)
    /// towards `amount_owed`.
    ///
    /// The defaulter's collateral is taken first. When it falls short the
    /// guarantor becomes bonded for the amount owed, but only ever pays up to
    /// their own locked collateral. Paid-in contributions cover the remainder
    /// of that bond, or of the shortfall when there is no guarantor.
    pub fn seizable_assets(
        &self,
        defaulter: &Member,
        guarantor: Option<&Member>,
        amount_owed: Amount,
    ) -> SeizableAssets {
        let owed = amount_owed.max(0);
        let collateral_seized = defaulter.locked_collateral.clamp(0, owed);
        let shortfall = owed - collateral_seized;

        let (guarantor_liability, guarantor_contribution) = match guarantor {
            Some(g) if shortfall > 0 && g.id != defaulter.id => {
                (owed, g.locked_collateral.clamp(0, owed))
            }
            _ => (0, 0),
        };

        // Contributions only cover what the guarantor could not.
        let remainder = if guarantor_liability > 0 {
            guarantor_liability - guarantor_contribution
        } else {
            shortfall
        };
        let payments_seized = defaulter.unspent_contributions().clamp(0, remainder);

        SeizableAssets {
            total_seizable: collateral_seized + payments_seized + guarantor_contribution,
            collateral_seized,
            payments_seized,
            guarantor_liability,
            guarantor_contribution,
            unrecovered: remainder - payments_seized,
        }
    }
}

/// Effect of one recorded default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultSettlement {
    pub penalty: Amount,
    pub amount_owed: Amount,
    pub seizure: Option<SeizableAssets>,
}

/// Record a default against `defaulter` and, when `seize` is set, take what
/// [`CollateralModel::seizable_assets`] allows from them and their guarantor.
///
/// The member owes the missed payment and every unpaid penalty. A member who
/// was already paid out also owes the contributions of the cycles still
/// ahead. Seizure ends membership.
pub fn settle_default(
    model: &CollateralModel,
    defaulter: &mut Member,
    guarantor: Option<&mut Member>,
    monthly_payment: Amount,
    current_cycle: u32,
    total_participants: u32,
    seize: bool,
) -> DefaultSettlement {
    let penalty = model.penalty(monthly_payment);
    defaulter.default_count += 1;
    defaulter.pending_penalty += penalty;
    defaulter.reputation_score = defaulter
        .reputation_score
        .saturating_sub(DEFAULT_REPUTATION_PENALTY);

    let future_cycles = if defaulter.has_received_payout {
        Amount::from(total_participants.saturating_sub(current_cycle))
    } else {
        0
    };
    let amount_owed = monthly_payment
        .saturating_add(defaulter.pending_penalty)
        .saturating_add(monthly_payment.saturating_mul(future_cycles));

    if !seize {
        return DefaultSettlement {
            penalty,
            amount_owed,
            seizure: None,
        };
    }

    let assets = model.seizable_assets(defaulter, guarantor.as_deref(), amount_owed);
    defaulter.locked_collateral -= assets.collateral_seized;
    defaulter.is_active = false;
    if let Some(guarantor) = guarantor {
        guarantor.locked_collateral -= assets.guarantor_contribution;
        guarantor.guarantor_liability += assets.guarantor_liability;
    }

    DefaultSettlement {
        penalty,
        amount_owed,
        seizure: Some(assets),
    }
}

/// Position whose holder guarantees `member_position`.
pub fn guarantor_position(
    member_position: u32,
    total_participants: u32,
) -> Result<u32, CollateralError> {
    check_position(member_position, total_participants)?;
    let n = u64::from(total_participants);
    let offset = (u64::from(member_position) - 1 + n / 2) % n;
    // offset < n, which came from a u32.
    Ok(offset as u32 + 1)
}

fn check_position(position: u32, total_participants: u32) -> Result<(), CollateralError> {
    if total_participants == 0 {
        return Err(CollateralError::EmptyCircle);
    }
    if position == 0 || position > total_participants {
        return Err(CollateralError::InvalidPosition {
            position,
            participants: total_participants,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MemberId, SettlementToken};

    /// Six-decimal base units, like USDC.
    const ONE: Amount = 1_000_000;

    fn member(id: &str, locked: Amount, payments: Vec<Amount>) -> Member {
        Member {
            id: MemberId::new(id),
            queue_number: 1,
            position: 1,
            locked_collateral: locked,
            required_collateral: locked,
            guarantor_position: 6,
            guarantor: None,
            preferred_token: SettlementToken::TokenA,
            reputation_score: 100,
            past_payments: payments,
            last_payment_cycle: 0,
            default_count: 0,
            pending_penalty: 0,
            guarantor_liability: 0,
            is_active: true,
            has_received_payout: false,
        }
    }

    #[test]
    fn reference_schedule_for_ten_members() {
        let model = CollateralModel::default();
        assert_eq!(model.required_collateral(1, 50 * ONE, 10), Ok(247_500_000));
        assert_eq!(model.required_collateral(5, 50 * ONE, 10), Ok(137_500_000));
        assert_eq!(model.required_collateral(10, 50 * ONE, 10), Ok(0));
    }

    #[test]
    fn collateral_is_non_increasing_and_zero_at_last_slot() {
        let model = CollateralModel::default();
        for n in 1..=25u32 {
            for monthly in [1, 7, 50 * ONE, 1_234_567] {
                let schedule = model.schedule(monthly, n).unwrap();
                assert_eq!(schedule.len(), n as usize);
                assert!(schedule.windows(2).all(|w| w[1].collateral <= w[0].collateral));
                assert!(schedule.iter().all(|q| q.collateral >= 0));
                assert_eq!(schedule.last().unwrap().collateral, 0);
            }
        }
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let model = CollateralModel::default();
        assert_eq!(
            model.required_collateral(0, 50, 10),
            Err(CollateralError::InvalidPosition {
                position: 0,
                participants: 10
            })
        );
        assert!(matches!(
            model.required_collateral(11, 50, 10),
            Err(CollateralError::InvalidPosition { .. })
        ));
        assert_eq!(
            model.required_collateral(1, 0, 10),
            Err(CollateralError::NonPositivePayment(0))
        );
        assert_eq!(
            model.required_collateral(1, -5, 10),
            Err(CollateralError::NonPositivePayment(-5))
        );
        assert_eq!(model.schedule(50, 0), Err(CollateralError::EmptyCircle));
        assert_eq!(
            model.required_collateral(1, Amount::MAX, 10),
            Err(CollateralError::Overflow)
        );
    }

    #[test]
    fn guarantor_of_first_position_in_ten() {
        assert_eq!(guarantor_position(1, 10), Ok(6));
        assert_eq!(guarantor_position(6, 10), Ok(1));
        assert_eq!(guarantor_position(10, 10), Ok(5));
    }

    #[test]
    fn guarantor_is_total_and_never_self_for_three_or_more() {
        for n in 1..=40u32 {
            for p in 1..=n {
                let g = guarantor_position(p, n).unwrap();
                assert!((1..=n).contains(&g), "n={n} p={p} g={g}");
                if n >= 3 {
                    assert_ne!(g, p, "n={n} p={p}");
                }
            }
        }
        assert!(guarantor_position(0, 5).is_err());
        assert!(guarantor_position(6, 5).is_err());
        assert_eq!(guarantor_position(1, 0), Err(CollateralError::EmptyCircle));
    }

    #[test]
    fn guarantor_pays_no_more_than_their_own_lock() {
        let model = CollateralModel::default();
        let defaulter = member("GDEFAULT", 100, vec![]);
        let guarantor = member("GGUARD", 80, vec![]);

        let assets = model.seizable_assets(&defaulter, Some(&guarantor), 150);

        assert_eq!(assets.collateral_seized, 100);
        assert_eq!(assets.guarantor_contribution, 80);
        assert_eq!(assets.payments_seized, 0);
        assert_eq!(assets.total_seizable, 180);
        assert_eq!(assets.unrecovered, 70);
    }

    #[test]
    fn contributions_only_cover_what_the_guarantor_could_not() {
        let model = CollateralModel::default();
        let defaulter = member("GDEFAULT", 100, vec![40]);
        let guarantor = member("GGUARD", 80, vec![]);

        let assets = model.seizable_assets(&defaulter, Some(&guarantor), 150);

        assert_eq!(assets.collateral_seized, 100);
        assert_eq!(assets.guarantor_liability, 150);
        assert_eq!(assets.guarantor_contribution, 80);
        assert_eq!(assets.payments_seized, 40);
        assert_eq!(assets.unrecovered, 30);
        assert_eq!(assets.total_seizable, 220);
        assert_eq!(
            assets.collateral_seized
                + assets.guarantor_contribution
                + assets.payments_seized
                + assets.unrecovered,
            100 + assets.guarantor_liability
        );

        // A guarantor who covers the whole bond leaves contributions alone.
        let rich = member("GGUARD", 500, vec![]);
        let covered = model.seizable_assets(&defaulter, Some(&rich), 150);
        assert_eq!(covered.guarantor_contribution, 150);
        assert_eq!(covered.payments_seized, 0);
        assert_eq!(covered.unrecovered, 0);
    }

    #[test]
    fn guarantor_untouched_when_collateral_covers_debt() {
        let model = CollateralModel::default();
        let defaulter = member("GDEFAULT", 500, vec![]);
        let guarantor = member("GGUARD", 80, vec![]);

        let assets = model.seizable_assets(&defaulter, Some(&guarantor), 150);

        assert_eq!(assets.collateral_seized, 150);
        assert_eq!(assets.guarantor_contribution, 0);
        assert_eq!(assets.unrecovered, 0);
        assert_eq!(assets.total_seizable, 150);
    }

    #[test]
    fn unspent_contributions_cover_the_defaulters_shortfall() {
        let model = CollateralModel::default();
        let defaulter = member("GDEFAULT", 100, vec![20, 20]);

        let assets = model.seizable_assets(&defaulter, None, 150);

        assert_eq!(assets.collateral_seized, 100);
        assert_eq!(assets.payments_seized, 40);
        assert_eq!(assets.guarantor_contribution, 0);
        assert_eq!(assets.total_seizable, 140);
        assert_eq!(assets.unrecovered, 10);

        let mut paid_out = defaulter.clone();
        paid_out.has_received_payout = true;
        assert_eq!(model.seizable_assets(&paid_out, None, 150).payments_seized, 0);
    }

    #[test]
    fn default_without_seizure_only_accrues() {
        let model = CollateralModel::default();
        let mut defaulter = member("GDEFAULT", 300 * ONE, vec![]);

        let settlement = settle_default(&model, &mut defaulter, None, 50 * ONE, 2, 10, false);

        assert_eq!(settlement.penalty, 2_500_000);
        assert_eq!(settlement.amount_owed, 52_500_000);
        assert!(settlement.seizure.is_none());
        assert_eq!(defaulter.default_count, 1);
        assert_eq!(defaulter.pending_penalty, 2_500_000);
        assert_eq!(defaulter.reputation_score, 90);
        assert!(defaulter.is_active);
        assert_eq!(defaulter.locked_collateral, 300 * ONE);
    }

    #[test]
    fn seizure_moves_liability_onto_the_guarantor() {
        let model = CollateralModel::new(5_500, 0);
        let mut defaulter = member("GDEFAULT", 100, vec![]);
        defaulter.has_received_payout = true;
        let mut guarantor = member("GGUARD", 80, vec![]);

        // 10 + 10 × (10 − 6) = 50 owed: the missed payment plus four cycles ahead.
        let settlement = settle_default(
            &model,
            &mut defaulter,
            Some(&mut guarantor),
            10,
            6,
            10,
            true,
        );

        assert_eq!(settlement.amount_owed, 50);
        let assets = settlement.seizure.unwrap();
        assert_eq!(assets.collateral_seized, 50);
        assert_eq!(assets.guarantor_contribution, 0);
        assert_eq!(defaulter.locked_collateral, 50);
        assert!(!defaulter.is_active);
        assert_eq!(guarantor.locked_collateral, 80);

        let mut broke = member("GBROKE", 30, vec![]);
        let settlement =
            settle_default(&model, &mut broke, Some(&mut guarantor), 100, 1, 10, true);
        let assets = settlement.seizure.unwrap();
        assert_eq!(assets.collateral_seized, 30);
        assert_eq!(assets.guarantor_contribution, 80);
        assert_eq!(guarantor.locked_collateral, 0);
        assert_eq!(guarantor.guarantor_liability, 100);
    }

    #[test]
    fn penalty_uses_rate() {
        let model = CollateralModel::default();
        assert_eq!(model.penalty(50 * ONE), 2_500_000);
        assert_eq!(CollateralModel::new(5_500, 0).penalty(50 * ONE), 0);
    }
}
