use crate::error::ConfigError;
use hsd_client::{COIN, MAX_NAME_LENGTH};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

/// Smallest delay the runtime timers can tell apart from "now".
pub const TIMER_RESOLUTION: Duration = Duration::from_millis(1);

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct ChaosSchedule {
    /// Time between chaos ticks, milliseconds
    pub mine_interval: u64,
    /// Blocks mined per tick
    pub mine_batch: u32,
    /// Distance below the tip of the block invalidated each tick
    pub fork_depth: u64,
    /// Lower bound of the relay delay window, milliseconds
    pub relay_delay_min: u64,
    /// Upper bound of the relay delay window, milliseconds
    pub relay_delay_max: u64,
}

pub static DEV: Lazy<ChaosSchedule> = Lazy::new(|| ChaosSchedule {
    mine_interval: 2000,
    mine_batch: 5,
    fork_depth: 3,
    relay_delay_min: 2,
    relay_delay_max: 60_000,
});

impl Default for ChaosSchedule {
    fn default() -> Self {
        DEV.clone()
    }
}

impl ChaosSchedule {
    pub fn mine_interval(&self) -> Duration {
        Duration::from_millis(self.mine_interval)
    }

    pub fn relay_delay(&self) -> RangeInclusive<Duration> {
        Duration::from_millis(self.relay_delay_min)..=Duration::from_millis(self.relay_delay_max)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mine_interval == 0 {
            return Err(ConfigError::invalid("mineInterval", "must be positive"));
        }
        if self.mine_batch == 0 {
            return Err(ConfigError::invalid("mineBatch", "must be positive"));
        }
        if Duration::from_millis(self.relay_delay_min) <= TIMER_RESOLUTION {
            return Err(ConfigError::invalid(
                "relayDelayMin",
                format!("must exceed the timer resolution of {TIMER_RESOLUTION:?}"),
            ));
        }
        if self.relay_delay_min > self.relay_delay_max {
            return Err(ConfigError::invalid(
                "relayDelayMax",
                "must not be below relayDelayMin",
            ));
        }
        Ok(())
    }
}

pub fn schedule_value_parser(s: &str) -> eyre::Result<ChaosSchedule, eyre::Error> {
    let schedule = match s {
        "dev" => DEV.clone(),
        path => {
            let path = PathBuf::from(path);
            let raw = std::fs::read_to_string(&path)
                .map_err(|err| eyre::eyre!("Failed to read {}: {err}", path.display()))?;
            serde_json::from_str(&raw)?
        }
    };
    schedule.validate()?;
    Ok(schedule)
}

#[derive(Clone, Debug)]
pub struct FundingConfig {
    /// Wallet that pays for actor funding
    pub funder_wallet: String,
    /// Amount sent per funding request
    pub amount: u64,
    /// Overall deadline of one `ensure` call
    pub timeout: Duration,
}

impl Default for FundingConfig {
    fn default() -> Self {
        Self {
            funder_wallet: "primary".to_string(),
            amount: COIN,
            timeout: Duration::from_secs(60),
        }
    }
}

impl FundingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.amount == 0 {
            return Err(ConfigError::invalid("funding amount", "must be positive"));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::invalid("funding timeout", "must be positive"));
        }
        Ok(())
    }
}

/// Balances an actor must hold before each covenant is sent.
#[derive(Clone, Debug)]
pub struct AuctionConfig {
    pub min_open_balance: u64,
    pub min_bid_balance: u64,
    pub min_reveal_balance: u64,
    /// Auctions still running after this long are failed
    pub max_lifetime: Duration,
    /// Period of OPEN retries while the name was never opened
    pub open_retry: Duration,
}

impl Default for AuctionConfig {
    fn default() -> Self {
        Self {
            min_open_balance: COIN,
            min_bid_balance: COIN,
            min_reveal_balance: COIN,
            max_lifetime: Duration::from_secs(30 * 60),
            open_retry: Duration::from_secs(30),
        }
    }
}

impl AuctionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_lifetime.is_zero() {
            return Err(ConfigError::invalid("auction lifetime", "must be positive"));
        }
        if self.open_retry.is_zero() {
            return Err(ConfigError::invalid("open retry", "must be positive"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Sleep between two auctions scheduled by one actor slot
    pub interval: RangeInclusive<Duration>,
    pub name_length: RangeInclusive<usize>,
    /// Blocks mined to each actor before scheduling starts
    pub prefund_blocks: u32,
    /// Local grinding needs a network where any name can be opened right away
    pub local_grinder: bool,
    pub name_attempts: u32,
    pub max_active_auctions: usize,
    /// Names auctioned once at startup
    pub names: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3)..=Duration::from_secs(20),
            name_length: 1..=MAX_NAME_LENGTH,
            prefund_blocks: 0,
            local_grinder: true,
            name_attempts: 16,
            max_active_auctions: 64,
            names: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.start() > self.interval.end() {
            return Err(ConfigError::invalid("auction interval", "empty range"));
        }
        let (min, max) = (*self.name_length.start(), *self.name_length.end());
        if min == 0 || max > MAX_NAME_LENGTH || min > max {
            return Err(ConfigError::invalid(
                "name length",
                format!("{min}..={max} must lie within 1..={MAX_NAME_LENGTH}"),
            ));
        }
        if self.name_attempts == 0 {
            return Err(ConfigError::invalid("name attempts", "must be positive"));
        }
        if self.max_active_auctions == 0 {
            return Err(ConfigError::invalid("max active auctions", "must be positive"));
        }
        Ok(())
    }
}
