//! Volley - automated on-chain trade execution and position lifecycle engine
//!
//! Given a target asset and a directive (buy/sell with an optional
//! take-profit ladder, stop-loss, or trailing stop), the engine builds the
//! order, protects it behind simulate-then-submit bundles with
//! multi-channel fallback, drives it to inclusion, and manages the
//! resulting position until it is fully closed.
//!
//! Discovery, asset safety scoring, fee prediction, and RPC failover are
//! external collaborators consumed through the traits in [`interfaces`];
//! [`paper`] provides deterministic in-memory implementations of all of
//! them for simulation mode and tests.

pub mod bundle;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod events;
pub mod interfaces;
pub mod monitor;
pub mod nonce;
pub mod order;
pub mod paper;
pub mod position;
pub mod relay;
pub mod types;
pub mod wallet;

// Re-export the types a typical embedding touches
pub use config::Config;
pub use engine::{Engine, SellAmount, TradeOptions};
pub use error::{EngineError, EngineResult};
pub use events::Event;
pub use order::{Order, OrderRequest, OrderState};
pub use position::{ExitPlan, Position, PositionState, TakeProfitSpec};
pub use types::{Address, Asset, Mode, SubmissionChannel, TxHash};
pub use wallet::ManagedAccount;
