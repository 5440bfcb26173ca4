//! Configuration module for the execution engine
//!
//! Configuration is loaded from TOML files with environment variable
//! overrides via dotenvy, and every knob has a serde default so a partial
//! file (or none at all) still yields a runnable engine.

use crate::types::{Address, SubmissionChannel};
use serde::{Deserialize, Serialize};

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Execution / retry behavior
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Trading defaults applied when a directive leaves them unset
    #[serde(default)]
    pub trading: TradingConfig,

    /// Hard fee ceiling; the fee estimator can never push past these
    #[serde(default)]
    pub fees: FeeConfig,

    /// Relay/builder endpoints for the protected channels
    #[serde(default)]
    pub relays: RelayConfig,

    /// Position lifecycle polling
    #[serde(default)]
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Default retry budget for an order
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,

    /// Quote call timeout in milliseconds
    #[serde(default = "default_quote_timeout_ms")]
    pub quote_timeout_ms: u64,

    /// Simulation call timeout in milliseconds; a timed-out simulation is
    /// treated the same as a failed one
    #[serde(default = "default_simulation_timeout_ms")]
    pub simulation_timeout_ms: u64,

    /// How many blocks to wait for inclusion before declaring NotIncluded
    #[serde(default = "default_inclusion_wait_blocks")]
    pub inclusion_wait_blocks: u64,

    /// Poll interval while waiting for inclusion, in milliseconds
    #[serde(default = "default_inclusion_poll_ms")]
    pub inclusion_poll_ms: u64,

    /// How many consecutive target blocks a bundle is replicated across
    #[serde(default = "default_submission_blocks")]
    pub submission_blocks: u64,

    /// Base delay for exponential backoff between attempts, milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Ceiling for the backoff delay, milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Priority fee multiplier applied on each replace-by-fee retry,
    /// in percent (110 = +10% per retry), clamped to the hard fee cap
    #[serde(default = "default_fee_escalation_percent")]
    pub fee_escalation_percent: u64,

    /// Re-run the asset safety check on every retry attempt. Off by
    /// default: the initial verdict is reused for the order's lifetime.
    #[serde(default)]
    pub recheck_safety_on_retry: bool,

    /// Degrade to the next channel when every endpoint on the preferred
    /// one rejects (bundle -> private relay -> public)
    #[serde(default = "default_true")]
    pub allow_channel_fallback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Default slippage tolerance in percent
    #[serde(default = "default_slippage_percent")]
    pub default_slippage_percent: f64,

    /// Default order deadline, seconds from creation
    #[serde(default = "default_deadline_secs")]
    pub default_deadline_secs: u64,

    /// Default submission channel preference
    #[serde(default = "default_channel")]
    pub default_channel: SubmissionChannel,

    /// Run the asset safety check on buys unless the directive opts out
    #[serde(default = "default_true")]
    pub safety_check_buys: bool,

    /// Execution venue (router contract) all swap transactions target
    #[serde(default = "default_router")]
    pub router: Address,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeConfig {
    /// Hard ceiling on total fee per gas unit
    #[serde(default = "default_max_fee_per_gas")]
    pub max_fee_per_gas: u128,

    /// Hard ceiling on priority fee per gas unit
    #[serde(default = "default_max_priority_fee_per_gas")]
    pub max_priority_fee_per_gas: u128,

    /// Gas limit for a single swap transaction
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RelayConfig {
    /// Relay/builder endpoint URLs, tried in parallel on submission
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Per-request timeout against a relay, in milliseconds
    #[serde(default = "default_relay_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Position poll cadence in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Slippage tolerance applied to trigger-driven exit orders, percent
    #[serde(default = "default_exit_slippage_percent")]
    pub exit_slippage_percent: f64,

    /// Retry budget for trigger-driven exit orders
    #[serde(default = "default_exit_retry_budget")]
    pub exit_retry_budget: u32,
}

// Default value functions
fn default_retry_budget() -> u32 {
    3
}
fn default_quote_timeout_ms() -> u64 {
    2_000
}
fn default_simulation_timeout_ms() -> u64 {
    3_000
}
fn default_inclusion_wait_blocks() -> u64 {
    6
}
fn default_inclusion_poll_ms() -> u64 {
    500
}
fn default_submission_blocks() -> u64 {
    3
}
fn default_backoff_base_ms() -> u64 {
    100
}
fn default_backoff_max_ms() -> u64 {
    5_000
}
fn default_fee_escalation_percent() -> u64 {
    112
}
fn default_slippage_percent() -> f64 {
    1.0
}
fn default_deadline_secs() -> u64 {
    120
}
fn default_channel() -> SubmissionChannel {
    SubmissionChannel::Bundle
}
fn default_router() -> Address {
    Address::ZERO
}
fn default_max_fee_per_gas() -> u128 {
    200_000_000_000 // 200 gwei-equivalent
}
fn default_max_priority_fee_per_gas() -> u128 {
    5_000_000_000
}
fn default_gas_limit() -> u64 {
    400_000
}
fn default_relay_timeout_ms() -> u64 {
    2_000
}
fn default_tick_interval_ms() -> u64 {
    1_000
}
fn default_exit_slippage_percent() -> f64 {
    2.0
}
fn default_exit_retry_budget() -> u32 {
    2
}
fn default_true() -> bool {
    true
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            retry_budget: default_retry_budget(),
            quote_timeout_ms: default_quote_timeout_ms(),
            simulation_timeout_ms: default_simulation_timeout_ms(),
            inclusion_wait_blocks: default_inclusion_wait_blocks(),
            inclusion_poll_ms: default_inclusion_poll_ms(),
            submission_blocks: default_submission_blocks(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            fee_escalation_percent: default_fee_escalation_percent(),
            recheck_safety_on_retry: false,
            allow_channel_fallback: default_true(),
        }
    }
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            default_slippage_percent: default_slippage_percent(),
            default_deadline_secs: default_deadline_secs(),
            default_channel: default_channel(),
            safety_check_buys: default_true(),
            router: default_router(),
        }
    }
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            max_fee_per_gas: default_max_fee_per_gas(),
            max_priority_fee_per_gas: default_max_priority_fee_per_gas(),
            gas_limit: default_gas_limit(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            exit_slippage_percent: default_exit_slippage_percent(),
            exit_retry_budget: default_exit_retry_budget(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            execution: ExecutionConfig::default(),
            trading: TradingConfig::default(),
            fees: FeeConfig::default(),
            relays: RelayConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: &str) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_file(path)
    }

    /// Reject configurations that cannot drive a sane engine
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=100.0).contains(&self.trading.default_slippage_percent) {
            anyhow::bail!(
                "default_slippage_percent {} out of range [0, 100]",
                self.trading.default_slippage_percent
            );
        }
        if !(0.0..=100.0).contains(&self.monitor.exit_slippage_percent) {
            anyhow::bail!(
                "exit_slippage_percent {} out of range [0, 100]",
                self.monitor.exit_slippage_percent
            );
        }
        if self.execution.retry_budget == 0 {
            anyhow::bail!("retry_budget must be at least 1");
        }
        if self.execution.fee_escalation_percent < 100 {
            anyhow::bail!(
                "fee_escalation_percent {} would lower the fee on retry",
                self.execution.fee_escalation_percent
            );
        }
        if self.execution.submission_blocks == 0 {
            anyhow::bail!("submission_blocks must be at least 1");
        }
        if self.fees.gas_limit == 0 {
            anyhow::bail!("gas_limit must be non-zero");
        }
        Ok(())
    }
}
