//! Application-wide error types.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Amount;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Precondition violations of the collateral formulas. Inputs are rejected,
/// never clamped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollateralError {
    #[error("position {position} outside 1..={participants}")]
    InvalidPosition { position: u32, participants: u32 },

    #[error("circle must have at least one participant")]
    EmptyCircle,

    #[error("monthly payment must be positive, got {0}")]
    NonPositivePayment(Amount),

    #[error("collateral computation overflowed")]
    Overflow,
}

/// Transport-level failure below the ledger protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportFault {
    ConnectionReset,
    Timeout,
    Closed,
    /// Rate limited or the node answered with a server-side error.
    Unavailable,
}

/// Business rejection codes returned by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCode {
    InsufficientBalance,
    InsufficientAllowance,
    AlreadyPaid,
    AlreadyMember,
    AlreadyDefaulted,
    PayoutAlreadyDistributed,
    CircleFull,
    NotActive,
    PhaseMismatch,
    CycleNotComplete,
    TokenInactive,
    Unauthorized,
    NotFound,
    Other(u32),
}

impl RejectCode {
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::InsufficientBalance,
            2 => Self::InsufficientAllowance,
            3 => Self::AlreadyPaid,
            4 => Self::AlreadyMember,
            5 => Self::AlreadyDefaulted,
            6 => Self::PayoutAlreadyDistributed,
            7 => Self::CircleFull,
            8 => Self::NotActive,
            9 => Self::PhaseMismatch,
            10 => Self::CycleNotComplete,
            11 => Self::TokenInactive,
            12 => Self::Unauthorized,
            13 => Self::NotFound,
            other => Self::Other(other),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::InsufficientBalance => 1,
            Self::InsufficientAllowance => 2,
            Self::AlreadyPaid => 3,
            Self::AlreadyMember => 4,
            Self::AlreadyDefaulted => 5,
            Self::PayoutAlreadyDistributed => 6,
            Self::CircleFull => 7,
            Self::NotActive => 8,
            Self::PhaseMismatch => 9,
            Self::CycleNotComplete => 10,
            Self::TokenInactive => 11,
            Self::Unauthorized => 12,
            Self::NotFound => 13,
            Self::Other(code) => *code,
        }
    }

    /// The operation already took effect earlier.
    pub fn is_duplicate(&self) -> bool {
        matches!(
            self,
            Self::AlreadyPaid
                | Self::AlreadyMember
                | Self::AlreadyDefaulted
                | Self::PayoutAlreadyDistributed
        )
    }
}

impl fmt::Display for RejectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "code {code}"),
            known => write!(f, "{known:?} (code {})", known.code()),
        }
    }
}

/// Failures reported by a [`crate::ledger::Ledger`] implementation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    #[error("transport failure ({kind:?}): {message}")]
    Transport {
        kind: TransportFault,
        message: String,
    },

    /// Submitted, but no confirmation arrived in time. The operation may or
    /// may not have landed.
    #[error("confirmation of {tx_hash} timed out after {waited_ms}ms")]
    ConfirmationTimeout { tx_hash: String, waited_ms: u64 },

    #[error("ledger rejected {operation}: {code}: {message}")]
    Rejected {
        operation: String,
        code: RejectCode,
        message: String,
    },

    #[error("malformed ledger response: {0}")]
    Decode(String),
}

impl LedgerError {
    pub fn rejected(operation: impl Into<String>, code: RejectCode) -> Self {
        Self::Rejected {
            operation: operation.into(),
            code,
            message: String::new(),
        }
    }

    pub fn transport(kind: TransportFault, message: impl Into<String>) -> Self {
        Self::Transport {
            kind,
            message: message.into(),
        }
    }

    pub fn reject_code(&self) -> Option<RejectCode> {
        match self {
            Self::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}
