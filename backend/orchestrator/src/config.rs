//! Application configuration loaded from environment variables.
//!
//! Only `main` reads the environment. Everything circle-scoped ends up in a
//! [`CircleConfig`] that is handed to the coordinator and the orchestrator.

use std::str::FromStr;
use std::time::Duration;

use crate::collateral::{CollateralModel, DEFAULT_COLLATERAL_FACTOR_BPS, DEFAULT_PENALTY_RATE_BPS};
use crate::errors::{AppError, Result};
use crate::retry::{Backoff, RetryPolicy};
use crate::types::{Amount, CircleId, MemberId, SettlementToken, TokenConfig};

const DEFAULT_CYCLE_DURATION_SECS: u64 = 30 * 24 * 60 * 60;

/// Settings of one circle.
#[derive(Debug, Clone, PartialEq)]
pub struct CircleConfig {
    pub participants: u32,
    pub tokens: Vec<TokenConfig>,
    pub collateral_factor_bps: u32,
    pub penalty_rate_bps: u32,
    /// How long members have to pay before defaults are handled.
    pub cycle_duration: Duration,
    pub seize_on_default: bool,
    /// Consecutive terminal failures after which a batch stops.
    pub circuit_breaker_threshold: u32,
}

impl CircleConfig {
    /// Ten participants paying 50 (six decimals) in token A.
    pub fn reference() -> Self {
        Self {
            participants: 10,
            tokens: vec![TokenConfig {
                token: SettlementToken::TokenA,
                monthly_payment: 50_000_000,
                is_active: true,
            }],
            collateral_factor_bps: DEFAULT_COLLATERAL_FACTOR_BPS,
            penalty_rate_bps: DEFAULT_PENALTY_RATE_BPS,
            cycle_duration: Duration::from_secs(DEFAULT_CYCLE_DURATION_SECS),
            seize_on_default: true,
            circuit_breaker_threshold: 3,
        }
    }

    pub fn model(&self) -> CollateralModel {
        CollateralModel::new(self.collateral_factor_bps, self.penalty_rate_bps)
    }

    /// Monthly payment for `token`, if the circle accepts it.
    pub fn monthly_payment(&self, token: SettlementToken) -> Option<Amount> {
        self.tokens
            .iter()
            .find(|t| t.token == token && t.is_active)
            .map(|t| t.monthly_payment)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Ledger JSON-RPC endpoint
    pub rpc_url: String,
    /// Existing circle to resume; `None` registers a new one
    pub circle_id: Option<CircleId>,
    /// Creator address used for registration
    pub creator: Option<String>,
    /// Path to the SQLite journal
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// How often (in seconds) the driver runs a tick
    pub poll_interval_secs: u64,
    pub retry: RetryPolicy,
    pub confirmation_timeout: Duration,
    pub circle: CircleConfig,
    /// Members to enrol, in queue order
    pub members: Vec<(MemberId, SettlementToken)>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_source(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. `from_env` passes the process environment.
    pub fn from_source(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let circle_id = match var("CIRCLE_ID") {
            Some(raw) => Some(parse("CIRCLE_ID", &raw)?),
            None => None,
        };
        let creator = var("CREATOR");
        if circle_id.is_none() && creator.is_none() {
            return Err(AppError::Config(
                "CREATOR is required when CIRCLE_ID is not set".to_string(),
            ));
        }

        let mut tokens = Vec::new();
        for (key, token) in [
            ("MONTHLY_PAYMENT_TOKEN_A", SettlementToken::TokenA),
            ("MONTHLY_PAYMENT_TOKEN_B", SettlementToken::TokenB),
        ] {
            if let Some(raw) = var(key) {
                let monthly_payment: Amount = parse(key, &raw)?;
                if monthly_payment <= 0 {
                    return Err(AppError::Config(format!("{key} must be positive")));
                }
                tokens.push(TokenConfig {
                    token,
                    monthly_payment,
                    is_active: true,
                });
            }
        }
        if tokens.is_empty() {
            return Err(AppError::Config(
                "set MONTHLY_PAYMENT_TOKEN_A and/or MONTHLY_PAYMENT_TOKEN_B".to_string(),
            ));
        }

        let participants: u32 = parse_or(&var, "PARTICIPANTS", 10)?;
        if participants == 0 {
            return Err(AppError::Config("PARTICIPANTS must be at least 1".to_string()));
        }

        let members = match var("MEMBERS") {
            Some(raw) => parse_members(&raw)?,
            None => Vec::new(),
        };
        if members.len() > participants as usize {
            return Err(AppError::Config(format!(
                "MEMBERS lists {} addresses for {participants} participants",
                members.len()
            )));
        }

        Ok(Config {
            rpc_url: var("RPC_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8000/rpc".to_string()),
            circle_id,
            creator,
            database_url: var("DATABASE_URL")
                .unwrap_or_else(|| "sqlite:./ajo_journal.db".to_string()),
            api_port: parse_or(&var, "API_PORT", 3002)?,
            poll_interval_secs: parse_or(&var, "POLL_INTERVAL_SECS", 30)?,
            retry: RetryPolicy {
                max_attempts: parse_or(&var, "MAX_ATTEMPTS", 3)?,
                base_delay: Duration::from_millis(parse_or(&var, "RETRY_BASE_DELAY_MS", 2_000)?),
                max_delay: Duration::from_millis(parse_or(&var, "RETRY_MAX_DELAY_MS", 60_000)?),
                backoff: Backoff::Exponential,
            },
            confirmation_timeout: Duration::from_secs(parse_or(
                &var,
                "CONFIRMATION_TIMEOUT_SECS",
                60,
            )?),
            circle: CircleConfig {
                participants,
                tokens,
                collateral_factor_bps: parse_or(
                    &var,
                    "COLLATERAL_FACTOR_BPS",
                    DEFAULT_COLLATERAL_FACTOR_BPS,
                )?,
                penalty_rate_bps: parse_or(&var, "PENALTY_RATE_BPS", DEFAULT_PENALTY_RATE_BPS)?,
                cycle_duration: Duration::from_secs(parse_or(
                    &var,
                    "CYCLE_DURATION_SECS",
                    DEFAULT_CYCLE_DURATION_SECS,
                )?),
                seize_on_default: parse_or(&var, "SEIZE_ON_DEFAULT", true)?,
                circuit_breaker_threshold: parse_or(&var, "CIRCUIT_BREAKER_THRESHOLD", 3)?,
            },
            members,
        })
    }
}

fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| AppError::Config(format!("Invalid {key}: {raw}")))
}

fn parse_or<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T> {
    match var(key) {
        Some(raw) => parse(key, &raw),
        None => Ok(default),
    }
}

/// `GADDR1:token_a,GADDR2:token_b`
fn parse_members(raw: &str) -> Result<Vec<(MemberId, SettlementToken)>> {
    let mut members: Vec<(MemberId, SettlementToken)> = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (address, token) = entry
            .split_once(':')
            .ok_or_else(|| AppError::Config(format!("MEMBERS entry without token: {entry}")))?;
        let token = SettlementToken::parse(token)
            .ok_or_else(|| AppError::Config(format!("MEMBERS entry with unknown token: {entry}")))?;
        let id = MemberId::new(address.trim());
        if members.iter().any(|(m, _)| *m == id) {
            return Err(AppError::Config(format!("MEMBERS lists {id} twice")));
        }
        members.push((id, token));
    }
    Ok(members)
}
