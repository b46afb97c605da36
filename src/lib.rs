//! Walk-forward backtesting engine for single stocks and small portfolios.
//!
//! A run flows through one orchestrator: bars are loaded per symbol, a
//! pluggable predictor emits buy/sell/hold signals from strictly historical
//! data, the simulator fills them against a cash account with slippage and
//! commission, and the ledger is aggregated into metrics, an equity curve
//! and (for portfolios) a correlation report.

pub mod allocation;
pub mod cache;
pub mod config;
pub mod correlation;
pub mod data;
pub mod error;
pub mod http;
pub mod indicators;
pub mod models;
pub mod orchestrator;
pub mod performance;
pub mod prediction;
pub mod simulator;
pub mod sweep;

pub use config::{BacktestConfig, PortfolioConfig};
pub use error::BacktestError;
pub use models::BacktestResult;
pub use orchestrator::BacktestOrchestrator;
