//! Deployment-time configuration (spec §6 "Configuration").
//!
//! Mirrors the teacher's `AgentConfig::from_env` idiom: every field has a
//! sane default and is overridable via environment variable, so the crate
//! runs out of the box in tests and demos.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Minimum delay between both-escrows-finalized and secret disclosure.
    pub finality_lock_duration: Duration,
    /// Length of the winning resolver's exclusive-withdrawal window.
    pub resolver_exclusive_duration: Duration,
    /// Dst-cancellation trigger offset; src-cancellation is 2x this.
    pub cancellation_duration: Duration,
    /// Valid safety-deposit amount range (per side).
    pub minimum_deposit: u128,
    pub maximum_deposit: u128,
    /// Deposit claimability then refund timing.
    pub claim_window: Duration,
    pub refund_window: Duration,
    /// Base multiplier for incentive calculation, expressed in basis points
    /// (10_000 == 1.0x) to keep all arithmetic integer.
    pub incentive_multiplier_bps: u64,
    /// Partial-fill bounds.
    pub max_parts: u32,
    pub min_fill_amount: u128,
    pub max_fill_percentage_bps: u64,
    /// Auction rate-tick cadence; must be >= 1 Hz per spec §6.
    pub auction_tick_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            finality_lock_duration: Duration::from_secs(30),
            resolver_exclusive_duration: Duration::from_secs(60),
            cancellation_duration: Duration::from_secs(300),
            minimum_deposit: 1,
            maximum_deposit: u128::MAX,
            claim_window: Duration::from_secs(600),
            refund_window: Duration::from_secs(600),
            incentive_multiplier_bps: 1_000,
            max_parts: 100,
            min_fill_amount: 1,
            max_fill_percentage_bps: 10_000,
            auction_tick_interval: Duration::from_millis(1_000),
        }
    }
}

impl CoordinatorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            finality_lock_duration: env_secs("FINALITY_LOCK_SECS", defaults.finality_lock_duration),
            resolver_exclusive_duration: env_secs(
                "RESOLVER_EXCLUSIVE_SECS",
                defaults.resolver_exclusive_duration,
            ),
            cancellation_duration: env_secs("CANCELLATION_SECS", defaults.cancellation_duration),
            minimum_deposit: env_parsed("MINIMUM_DEPOSIT", defaults.minimum_deposit),
            maximum_deposit: env_parsed("MAXIMUM_DEPOSIT", defaults.maximum_deposit),
            claim_window: env_secs("CLAIM_WINDOW_SECS", defaults.claim_window),
            refund_window: env_secs("REFUND_WINDOW_SECS", defaults.refund_window),
            incentive_multiplier_bps: env_parsed(
                "INCENTIVE_MULTIPLIER_BPS",
                defaults.incentive_multiplier_bps,
            ),
            max_parts: env_parsed("MAX_PARTS", defaults.max_parts),
            min_fill_amount: env_parsed("MIN_FILL_AMOUNT", defaults.min_fill_amount),
            max_fill_percentage_bps: env_parsed(
                "MAX_FILL_PERCENTAGE_BPS",
                defaults.max_fill_percentage_bps,
            ),
            auction_tick_interval: env_millis("AUCTION_TICK_MILLIS", defaults.auction_tick_interval),
        }
    }

    /// `CalculateIncentive` (spec §4.5): `depositAmount x multiplier(reason)`.
    pub fn incentive_multiplier_bps_for(&self, reason: crate::deposit::ClaimReason) -> u64 {
        use crate::deposit::ClaimReason::*;
        match reason {
            WithdrawalExecuted => self.incentive_multiplier_bps,
            CancellationExecuted => self.incentive_multiplier_bps * 3 / 2,
            Timeout => self.incentive_multiplier_bps * 2,
            MaliciousBehavior => self.incentive_multiplier_bps,
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
