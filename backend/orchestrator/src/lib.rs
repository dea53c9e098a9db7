//! Ajo circle orchestrator.
//!
//! Takes a rotating savings circle through its phased deployment on an
//! external ledger, sizes collateral per payout position, and drives each
//! cycle's joins, payments, defaults and payouts with retries that never
//! double-apply an operation.

pub mod api;
pub mod batch;
pub mod collateral;
pub mod config;
pub mod db;
pub mod deployment;
pub mod driver;
pub mod errors;
pub mod events;
pub mod health;
pub mod ledger;
pub mod orchestrator;
pub mod retry;
pub mod types;

#[cfg(test)]
mod test_lifecycle;
