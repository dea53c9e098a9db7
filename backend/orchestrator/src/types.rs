//! # Types
//!
//! Domain records shared by every module of the orchestrator.
//!
//! ## Ownership of state
//!
//! The ledger is the single source of truth for every record below. The
//! orchestrator keeps an in-memory copy of [`Member`] and [`Cycle`] for
//! bookkeeping and drift detection, and re-reads the ledger whenever it needs
//! to settle a question about the real state.
//!
//! ## Phase as a Finite-State Machine
//!
//! ```text
//! Created ──► BasicLinked ──► EconomicLinked ──► Active ──► Finalized
//! ```
//!
//! Phases only move forward, one step at a time. Joining and paying are
//! permitted from `Active` onward while the circle is flagged active.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Token amount in the settlement token's base units.
pub type Amount = i128;

/// Identifier the ledger assigns to a circle at registration.
pub type CircleId = u64;

/// Reputation every member starts with.
pub const INITIAL_REPUTATION: u32 = 100;

/// Reputation lost per recorded default.
pub const DEFAULT_REPUTATION_PENALTY: u32 = 10;

/// Ledger address of a participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(pub String);

impl MemberId {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Settlement tokens a circle accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementToken {
    TokenA,
    TokenB,
}

impl SettlementToken {
    pub const ALL: [SettlementToken; 2] = [SettlementToken::TokenA, SettlementToken::TokenB];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TokenA => "token_a",
            Self::TokenB => "token_b",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "token_a" | "a" => Some(Self::TokenA),
            "token_b" | "b" => Some(Self::TokenB),
            _ => None,
        }
    }
}

/// Initialisation stage of a circle's backing records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum Phase {
    /// Registered with the factory; nothing linked yet.
    Created = 1,
    /// Membership and governance records linked.
    BasicLinked = 2,
    /// Collateral and payment records linked.
    EconomicLinked = 3,
    /// Core coordinator linked; circle open for members and payments.
    Active = 4,
    /// Optional immutability lock.
    Finalized = 5,
}

impl Phase {
    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn next(self) -> Option<Phase> {
        match self {
            Self::Created => Some(Self::BasicLinked),
            Self::BasicLinked => Some(Self::EconomicLinked),
            Self::EconomicLinked => Some(Self::Active),
            Self::Active => Some(Self::Finalized),
            Self::Finalized => None,
        }
    }

    pub fn previous(self) -> Option<Phase> {
        match self {
            Self::Created => None,
            Self::BasicLinked => Some(Self::Created),
            Self::EconomicLinked => Some(Self::BasicLinked),
            Self::Active => Some(Self::EconomicLinked),
            Self::Finalized => Some(Self::Active),
        }
    }

    /// Components that must be linked once this phase is reached.
    pub fn required_components(self) -> &'static [ComponentKind] {
        use ComponentKind::*;
        match self {
            Self::Created => &[Factory],
            Self::BasicLinked => &[Factory, Members, Governance],
            Self::EconomicLinked => &[Factory, Members, Governance, Collateral, Payments],
            Self::Active | Self::Finalized => {
                &[Factory, Members, Governance, Collateral, Payments, Core]
            }
        }
    }
}

impl TryFrom<u8> for Phase {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Created),
            2 => Ok(Self::BasicLinked),
            3 => Ok(Self::EconomicLinked),
            4 => Ok(Self::Active),
            5 => Ok(Self::Finalized),
            other => Err(format!("unknown circle phase {other}")),
        }
    }
}

impl From<Phase> for u8 {
    fn from(phase: Phase) -> Self {
        phase.number()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::BasicLinked => "basic_linked",
            Self::EconomicLinked => "economic_linked",
            Self::Active => "active",
            Self::Finalized => "finalized",
        };
        write!(f, "{name}({})", self.number())
    }
}

/// Backing records that make up one circle on the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Factory,
    Core,
    Members,
    Collateral,
    Payments,
    Governance,
}

/// A participant's record within one circle.
///
/// Never deleted: `is_active = false` marks an exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    /// Join order, starting at 1.
    pub queue_number: u32,
    /// Payout order, fixed at join time.
    pub position: u32,
    pub locked_collateral: Amount,
    pub required_collateral: Amount,
    /// Position whose holder backs this member.
    pub guarantor_position: u32,
    /// Resolved once the guarantor position has been filled.
    pub guarantor: Option<MemberId>,
    pub preferred_token: SettlementToken,
    pub reputation_score: u32,
    pub past_payments: Vec<Amount>,
    /// Zero until the first payment.
    pub last_payment_cycle: u32,
    pub default_count: u32,
    /// Penalties accrued by defaults and not yet paid.
    pub pending_penalty: Amount,
    /// Liability taken on as a guarantor for a defaulted member.
    pub guarantor_liability: Amount,
    pub is_active: bool,
    pub has_received_payout: bool,
}

impl Member {
    pub fn has_paid_cycle(&self, cycle: u32) -> bool {
        self.last_payment_cycle >= cycle
    }

    /// Contributions the member has paid in and not yet been paid back for.
    pub fn unspent_contributions(&self) -> Amount {
        if self.has_received_payout {
            0
        } else {
            self.past_payments.iter().sum()
        }
    }
}

/// One payment-collection-and-payout period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cycle {
    /// Starts at 1; strictly increasing.
    pub number: u32,
    pub payout_recipient: Option<MemberId>,
    pub is_complete: bool,
    pub opened_at: DateTime<Utc>,
}

impl Cycle {
    pub fn first(opened_at: DateTime<Utc>) -> Self {
        Self {
            number: 1,
            payout_recipient: None,
            is_complete: false,
            opened_at,
        }
    }
}

/// Ledger-side record of a circle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircleInstance {
    pub id: CircleId,
    pub phase: Phase,
    pub creator: String,
    pub component_addresses: BTreeMap<ComponentKind, String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl CircleInstance {
    pub fn can_accept_members(&self) -> bool {
        self.phase >= Phase::Active && self.is_active
    }

    pub fn can_process_payments(&self) -> bool {
        self.phase >= Phase::Active && self.is_active
    }

    /// Components required by `phase` that have no address recorded.
    pub fn missing_components(&self, phase: Phase) -> Vec<ComponentKind> {
        phase
            .required_components()
            .iter()
            .copied()
            .filter(|kind| {
                self.component_addresses
                    .get(kind)
                    .map_or(true, |address| address.trim().is_empty())
            })
            .collect()
    }
}

/// Per-token settlement settings. Only governance operations change these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenConfig {
    pub token: SettlementToken,
    pub monthly_payment: Amount,
    pub is_active: bool,
}

/// Aggregate counters reported by the core record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractStats {
    pub total_members: u32,
    pub active_members: u32,
    pub current_cycle: u32,
    pub total_collateral: Amount,
    pub contract_balance: Amount,
}

/// Ledger-side view of one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleInfo {
    pub number: u32,
    pub payout_recipient: Option<MemberId>,
    pub payout_amount: Amount,
    pub paid_members: u32,
    pub is_complete: bool,
}

/// One row of a collateral schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollateralQuote {
    pub position: u32,
    pub collateral: Amount,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(phase: Phase, is_active: bool) -> CircleInstance {
        CircleInstance {
            id: 7,
            phase,
            creator: "GCREATOR".to_string(),
            component_addresses: BTreeMap::new(),
            is_active,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn phase_walks_forward_one_step() {
        let mut seen = vec![Phase::Created];
        while let Some(next) = seen.last().and_then(|p| p.next()) {
            seen.push(next);
        }
        let numbers: Vec<u8> = seen.iter().map(|p| p.number()).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
        assert_eq!(Phase::Active.previous(), Some(Phase::EconomicLinked));
        assert_eq!(Phase::Created.previous(), None);
    }

    #[test]
    fn phase_serialises_as_number() {
        let json = serde_json::to_string(&Phase::EconomicLinked).unwrap();
        assert_eq!(json, "3");
        let back: Phase = serde_json::from_str("4").unwrap();
        assert_eq!(back, Phase::Active);
        assert!(serde_json::from_str::<Phase>("9").is_err());
    }

    #[test]
    fn accepting_members_needs_active_phase_and_flag() {
        assert!(!instance(Phase::EconomicLinked, true).can_accept_members());
        assert!(!instance(Phase::Active, false).can_accept_members());
        assert!(instance(Phase::Active, true).can_accept_members());
        assert!(instance(Phase::Finalized, true).can_process_payments());
    }

    #[test]
    fn missing_components_ignores_blank_addresses() {
        let mut circle = instance(Phase::BasicLinked, false);
        circle
            .component_addresses
            .insert(ComponentKind::Factory, "CFACTORY".to_string());
        circle
            .component_addresses
            .insert(ComponentKind::Members, "  ".to_string());
        assert_eq!(
            circle.missing_components(Phase::BasicLinked),
            vec![ComponentKind::Members, ComponentKind::Governance]
        );
    }

    #[test]
    fn settlement_token_parse() {
        assert_eq!(SettlementToken::parse("token_a"), Some(SettlementToken::TokenA));
        assert_eq!(SettlementToken::parse(" B "), Some(SettlementToken::TokenB));
        assert_eq!(SettlementToken::parse("usdc"), None);
    }
}
