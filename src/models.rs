use anyhow::anyhow;
use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// A single OHLCV bar. Timestamps are timezone-naive by construction: every
/// provider strips timezone information at the ingestion boundary so cached
/// and freshly fetched bars always compare cleanly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub symbol: String,
    pub timestamp: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::Buy => "buy",
            SignalAction::Sell => "sell",
            SignalAction::Hold => "hold",
        }
    }
}

impl FromStr for SignalAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" => Ok(SignalAction::Buy),
            "sell" => Ok(SignalAction::Sell),
            "hold" => Ok(SignalAction::Hold),
            other => Err(anyhow!("Unknown signal action '{}'", other)),
        }
    }
}

/// A trading signal for one symbol at one timestamp. Predictors must derive
/// it exclusively from bars dated strictly before `timestamp`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub timestamp: NaiveDateTime,
    pub symbol: String,
    pub action: SignalAction,
    pub confidence: f64,
    pub target_price: Option<f64>,
    pub rationale: String,
}

impl Signal {
    /// The default signal when a predictor has nothing actionable to say.
    pub fn hold(timestamp: NaiveDateTime, symbol: &str, rationale: &str) -> Self {
        Self {
            timestamp,
            symbol: symbol.to_string(),
            action: SignalAction::Hold,
            confidence: 0.0,
            target_price: None,
            rationale: rationale.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }
}

/// Immutable ledger entry for an executed fill. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub id: String,
    pub timestamp: NaiveDateTime,
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: f64,
    pub execution_price: f64,
    pub commission: f64,
    pub slippage_cost: f64,
    /// Set on closing (sell) fills only.
    pub realized_pnl: Option<f64>,
}

/// Audit entry for an order that was rejected, clipped away entirely, or
/// replaced by an implicit hold after a predictor failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedTrade {
    pub timestamp: NaiveDateTime,
    pub symbol: String,
    pub action: SignalAction,
    pub reason: String,
}

/// A long-only holding. `average_cost` is the volume-weighted entry price,
/// updated on every buy and left untouched by sells.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub symbol: String,
    pub quantity: f64,
    pub average_cost: f64,
}

/// The single mutable aggregate of a backtest run. Cash and positions are
/// only ever updated together by the simulator, one fill at a time.
#[derive(Debug, Clone)]
pub struct Account {
    pub cash: f64,
    pub initial_capital: f64,
    pub positions: HashMap<String, Position>,
}

impl Account {
    pub fn new(initial_capital: f64) -> Self {
        Self {
            cash: initial_capital,
            initial_capital,
            positions: HashMap::new(),
        }
    }

    pub fn position_quantity(&self, symbol: &str) -> f64 {
        self.positions.get(symbol).map(|p| p.quantity).unwrap_or(0.0)
    }

    /// Market value of all holdings at the given per-symbol prices. Symbols
    /// without a quote fall back to their average cost.
    pub fn positions_value(&self, prices: &HashMap<String, f64>) -> f64 {
        self.positions
            .values()
            .map(|position| {
                let price = prices
                    .get(&position.symbol)
                    .copied()
                    .unwrap_or(position.average_cost);
                position.quantity * price
            })
            .sum()
    }

    pub fn total_value(&self, prices: &HashMap<String, f64>) -> f64 {
        self.cash + self.positions_value(prices)
    }
}

/// Target capital weights for one rebalance event. Consumed immediately to
/// produce rebalancing orders, never persisted.
#[derive(Debug, Clone)]
pub struct AllocationTarget {
    pub weights: HashMap<String, f64>,
}

impl AllocationTarget {
    pub fn weight(&self, symbol: &str) -> f64 {
        self.weights.get(symbol).copied().unwrap_or(0.0)
    }

    pub fn weight_sum(&self) -> f64 {
        self.weights.values().sum()
    }
}

/// Portfolio value snapshot taken once per simulated timestep.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquityPoint {
    pub timestamp: NaiveDateTime,
    pub total_value: f64,
    pub cash: f64,
    pub positions_value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub total_return: f64,
    pub total_return_percent: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub max_drawdown: f64,
    pub max_drawdown_percent: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub total_trades: i32,
    pub winning_trades: i32,
    pub losing_trades: i32,
    pub total_commission: f64,
    pub total_slippage_cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolBreakdown {
    pub symbol: String,
    pub trades: i32,
    pub realized_pnl: f64,
    pub commission: f64,
    pub final_quantity: f64,
    pub final_value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationReport {
    pub symbols: Vec<String>,
    pub matrix: Vec<Vec<f64>>,
    pub avg_correlation: f64,
    pub diversification_ratio: f64,
    pub effective_positions: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExcludedSymbol {
    pub symbol: String,
    pub reason: String,
}

/// Write-once output artifact of a completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestResult {
    pub id: String,
    pub symbols: Vec<String>,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub initial_capital: f64,
    pub final_value: f64,
    pub metrics: PerformanceMetrics,
    pub equity_curve: Vec<EquityPoint>,
    pub trades: Vec<Trade>,
    pub skipped_trades: Vec<SkippedTrade>,
    pub excluded_symbols: Vec<ExcludedSymbol>,
    pub per_symbol: Vec<SymbolBreakdown>,
    pub correlation: Option<CorrelationReport>,
    pub created_at: NaiveDateTime,
}

/// `sequence` is the fill's position in the run ledger; it keeps ids unique
/// when a rebalance order and a signal fill hit the same symbol on the same
/// day.
pub fn generate_trade_id(
    run_id: &str,
    symbol: &str,
    timestamp: NaiveDateTime,
    sequence: usize,
) -> String {
    format!(
        "{}_{}_{}_{}",
        run_id,
        symbol,
        timestamp.format("%Y-%m-%d"),
        sequence
    )
}

pub fn now_naive() -> NaiveDateTime {
    Utc::now().naive_utc()
}
