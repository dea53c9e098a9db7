//! Abstract ledger interface.
//!
//! The ledger serialises every mutation and is the only source of truth. The
//! orchestrator talks to it through three calls: `submit`, then
//! `wait_for_confirmation` for the returned handle, and `query` for reads.
//! Operations and queries are named by their logical contract call; the wire
//! encoding belongs to the implementation.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::LedgerError;
use crate::events::ReceiptEvent;
use crate::types::{Amount, CircleId, ComponentKind, MemberId, SettlementToken, TokenConfig};

#[cfg(any(test, feature = "testutils"))]
pub mod memory;
pub mod rpc;

/// Mutating contract calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "camelCase")]
pub enum Operation {
    #[serde(rename_all = "camelCase")]
    CreateCircle {
        creator: String,
        participants: u32,
        tokens: Vec<TokenConfig>,
        collateral_factor_bps: u32,
        penalty_rate_bps: u32,
        cycle_duration_secs: u64,
        seize_on_default: bool,
    },
    /// Phase 1 → 2: membership and governance records.
    InitializeBasic,
    /// Phase 2 → 3: collateral and payment records.
    InitializeEconomic,
    /// Phase 3 → 4: core coordinator; activates the circle.
    InitializeCore,
    /// Phase 4 → 5.
    Finalize,
    DeactivateCircle,
    JoinCircle {
        member: MemberId,
        token: SettlementToken,
    },
    MakePayment {
        member: MemberId,
    },
    DistributePayout,
    HandleDefault {
        member: MemberId,
    },
    AdvanceCycle,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateCircle { .. } => "createCircle",
            Self::InitializeBasic => "initializeBasic",
            Self::InitializeEconomic => "initializeEconomic",
            Self::InitializeCore => "initializeCore",
            Self::Finalize => "finalize",
            Self::DeactivateCircle => "deactivateCircle",
            Self::JoinCircle { .. } => "joinCircle",
            Self::MakePayment { .. } => "makePayment",
            Self::DistributePayout => "distributePayout",
            Self::HandleDefault { .. } => "handleDefault",
            Self::AdvanceCycle => "advanceCycle",
        }
    }
}

/// Read-only contract calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "query", content = "args", rename_all = "camelCase")]
pub enum Query {
    GetCircleInstance,
    GetMemberInfo {
        member: MemberId,
    },
    GetMembers,
    GetContractStats,
    #[serde(rename_all = "camelCase")]
    GetCollateralDemo {
        participants: u32,
        monthly_payment: Amount,
    },
    GetCycleInfo {
        cycle: u32,
    },
    GetTokenConfig {
        token: SettlementToken,
    },
    GetBalance {
        member: MemberId,
        token: SettlementToken,
    },
}

impl Query {
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetCircleInstance => "getCircleInstance",
            Self::GetMemberInfo { .. } => "getMemberInfo",
            Self::GetMembers => "getMembers",
            Self::GetContractStats => "getContractStats",
            Self::GetCollateralDemo { .. } => "getCollateralDemo",
            Self::GetCycleInfo { .. } => "getCycleInfo",
            Self::GetTokenConfig { .. } => "getTokenConfig",
            Self::GetBalance { .. } => "getBalance",
        }
    }
}

/// Handle for a submitted, not yet confirmed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionHandle {
    pub tx_hash: String,
}

/// Confirmed result of a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: String,
    pub ledger: u64,
    #[serde(default)]
    pub events: Vec<ReceiptEvent>,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Submit `op`. `circle` is `None` only for factory registration.
    async fn submit(
        &self,
        circle: Option<CircleId>,
        component: ComponentKind,
        op: &Operation,
    ) -> Result<SubmissionHandle, LedgerError>;

    async fn wait_for_confirmation(
        &self,
        handle: &SubmissionHandle,
        timeout: Duration,
    ) -> Result<Receipt, LedgerError>;

    async fn query(
        &self,
        circle: CircleId,
        component: ComponentKind,
        query: &Query,
    ) -> Result<Value, LedgerError>;
}

/// Submit and block until the ledger confirms.
pub async fn submit_and_confirm(
    ledger: &dyn Ledger,
    circle: Option<CircleId>,
    component: ComponentKind,
    op: &Operation,
    timeout: Duration,
) -> Result<Receipt, LedgerError> {
    let handle = ledger.submit(circle, component, op).await?;
    ledger.wait_for_confirmation(&handle, timeout).await
}

/// Run `query` and decode the result.
pub async fn read<T: DeserializeOwned>(
    ledger: &dyn Ledger,
    circle: CircleId,
    component: ComponentKind,
    query: &Query,
) -> Result<T, LedgerError> {
    let value = ledger.query(circle, component, query).await?;
    serde_json::from_value(value)
        .map_err(|e| LedgerError::Decode(format!("{}: {e}", query.name())))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn operations_serialise_with_logical_names() {
        let op = Operation::JoinCircle {
            member: MemberId::new("GABC"),
            token: SettlementToken::TokenB,
        };
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({ "method": "joinCircle", "args": { "member": "GABC", "token": "token_b" } })
        );
        assert_eq!(
            serde_json::to_value(Operation::AdvanceCycle).unwrap(),
            json!({ "method": "advanceCycle" })
        );
        assert_eq!(op.name(), "joinCircle");
    }

    #[test]
    fn every_operation_name_matches_its_tag() {
        let ops = vec![
            Operation::InitializeBasic,
            Operation::InitializeEconomic,
            Operation::InitializeCore,
            Operation::Finalize,
            Operation::DeactivateCircle,
            Operation::MakePayment {
                member: MemberId::new("G1"),
            },
            Operation::DistributePayout,
            Operation::HandleDefault {
                member: MemberId::new("G1"),
            },
            Operation::AdvanceCycle,
        ];
        for op in ops {
            let value = serde_json::to_value(&op).unwrap();
            assert_eq!(value["method"], json!(op.name()));
        }
    }

    #[test]
    fn queries_serialise_camel_case_args() {
        let q = Query::GetCollateralDemo {
            participants: 10,
            monthly_payment: 50,
        };
        assert_eq!(
            serde_json::to_value(&q).unwrap(),
            json!({ "query": "getCollateralDemo", "args": { "participants": 10, "monthlyPayment": 50 } })
        );
        assert_eq!(q.name(), "getCollateralDemo");
    }
}
