use thiserror::Error;

/// Error taxonomy for backtest runs. Configuration and whole-run data
/// failures are fatal and surface before any simulation starts; the
/// per-trade conditions are recovered locally and become the reason text of
/// a ledger skip entry instead of being raised.
#[derive(Debug, Error)]
pub enum BacktestError {
    #[error("no data available for {symbol} in the requested window")]
    DataUnavailable { symbol: String },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("insufficient funds: order needs {required:.2}, cash is {available:.2}")]
    InsufficientFunds { required: f64, available: f64 },

    #[error("oversell on {symbol}: requested {requested}, held {held}")]
    OverSell {
        symbol: String,
        requested: f64,
        held: f64,
    },

    #[error("prediction provider failed: {0}")]
    PredictionFailure(String),
}
