use crate::error::BacktestError;
use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};

pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarInterval {
    Daily,
    Weekly,
}

impl BarInterval {
    pub fn as_str(self) -> &'static str {
        match self {
            BarInterval::Daily => "1d",
            BarInterval::Weekly => "1wk",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "1d" | "daily" | "day" => Ok(BarInterval::Daily),
            "1wk" | "weekly" | "week" => Ok(BarInterval::Weekly),
            other => Err(anyhow!("Unknown bar interval '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStrategy {
    Equal,
    RiskParity,
    Custom,
}

impl AllocationStrategy {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "equal" | "equal_weight" => Ok(Self::Equal),
            "risk_parity" | "risk-parity" => Ok(Self::RiskParity),
            "custom" => Ok(Self::Custom),
            other => Err(anyhow!(
                "Allocation strategy must be equal, risk_parity or custom (value: {})",
                other
            )),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Equal => "equal",
            Self::RiskParity => "risk_parity",
            Self::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceFrequency {
    Never,
    Weekly,
    Monthly,
    Quarterly,
}

impl RebalanceFrequency {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "never" | "none" => Ok(Self::Never),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "quarterly" => Ok(Self::Quarterly),
            other => Err(anyhow!(
                "Rebalance frequency must be never, weekly, monthly or quarterly (value: {})",
                other
            )),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Never => "never",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
        }
    }
}

/// Execution friction applied by the simulator to every fill.
#[derive(Debug, Clone)]
pub struct CostModel {
    /// Commission as a fraction of notional, charged on both sides.
    pub commission_rate: f64,
    /// Slippage as a fraction of price, applied against the trader.
    pub slippage_rate: f64,
    /// Orders whose notional falls below this are skipped rather than filled.
    pub minimum_trade_value: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            commission_rate: 0.001,
            slippage_rate: 0.0005,
            minimum_trade_value: 1.0,
        }
    }
}

impl CostModel {
    fn validate(&self) -> Result<(), BacktestError> {
        for (name, value) in [
            ("commission rate", self.commission_rate),
            ("slippage rate", self.slippage_rate),
        ] {
            if !value.is_finite() || !(0.0..0.5).contains(&value) {
                return Err(BacktestError::InvalidConfiguration(format!(
                    "{} must be in [0, 0.5) (value: {})",
                    name, value
                )));
            }
        }
        if !self.minimum_trade_value.is_finite() || self.minimum_trade_value < 0.0 {
            return Err(BacktestError::InvalidConfiguration(format!(
                "minimum trade value must be >= 0 (value: {})",
                self.minimum_trade_value
            )));
        }
        Ok(())
    }
}

/// Configuration for a single-symbol run.
#[derive(Debug, Clone)]
pub struct BacktestConfig {
    pub symbol: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub initial_capital: f64,
    pub predictor: String,
    pub predictor_params: HashMap<String, f64>,
    pub lookback_window: usize,
    pub interval: BarInterval,
    pub costs: CostModel,
}

impl BacktestConfig {
    pub fn validate(&self) -> Result<(), BacktestError> {
        if self.symbol.trim().is_empty() {
            return Err(BacktestError::InvalidConfiguration(
                "symbol must not be empty".to_string(),
            ));
        }
        validate_window_and_capital(self.start, self.end, self.initial_capital)?;
        if self.lookback_window == 0 {
            return Err(BacktestError::InvalidConfiguration(
                "lookback window must be at least 1 bar".to_string(),
            ));
        }
        self.costs.validate()
    }
}

/// Configuration for a multi-symbol portfolio run.
#[derive(Debug, Clone)]
pub struct PortfolioConfig {
    pub symbols: Vec<String>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub initial_capital: f64,
    pub allocation: AllocationStrategy,
    pub custom_weights: Option<HashMap<String, f64>>,
    pub rebalance: RebalanceFrequency,
    pub predictor: String,
    pub predictor_params: HashMap<String, f64>,
    pub lookback_window: usize,
    /// Trailing daily-return window used for inverse-volatility weights.
    pub volatility_lookback: usize,
    pub interval: BarInterval,
    pub costs: CostModel,
}

impl PortfolioConfig {
    pub fn validate(&self) -> Result<(), BacktestError> {
        if self.symbols.len() < 2 || self.symbols.len() > 10 {
            return Err(BacktestError::InvalidConfiguration(format!(
                "portfolio runs need between 2 and 10 symbols (got {})",
                self.symbols.len()
            )));
        }

        let mut seen = HashSet::new();
        for symbol in &self.symbols {
            if symbol.trim().is_empty() {
                return Err(BacktestError::InvalidConfiguration(
                    "symbols must not be empty".to_string(),
                ));
            }
            if !seen.insert(symbol.trim().to_uppercase()) {
                return Err(BacktestError::InvalidConfiguration(format!(
                    "duplicate symbol '{}'",
                    symbol
                )));
            }
        }

        validate_window_and_capital(self.start, self.end, self.initial_capital)?;

        if self.lookback_window == 0 {
            return Err(BacktestError::InvalidConfiguration(
                "lookback window must be at least 1 bar".to_string(),
            ));
        }
        if self.volatility_lookback < 2 {
            return Err(BacktestError::InvalidConfiguration(format!(
                "volatility lookback must be at least 2 returns (value: {})",
                self.volatility_lookback
            )));
        }

        match (self.allocation, &self.custom_weights) {
            (AllocationStrategy::Custom, None) => {
                return Err(BacktestError::InvalidConfiguration(
                    "custom allocation requires explicit weights".to_string(),
                ));
            }
            (AllocationStrategy::Custom, Some(weights)) => {
                validate_custom_weights(&self.symbols, weights)?;
            }
            (_, Some(_)) => {
                return Err(BacktestError::InvalidConfiguration(
                    "custom weights are only valid with the custom allocation strategy"
                        .to_string(),
                ));
            }
            _ => {}
        }

        self.costs.validate()
    }
}

fn validate_window_and_capital(
    start: NaiveDate,
    end: NaiveDate,
    initial_capital: f64,
) -> Result<(), BacktestError> {
    if end <= start {
        return Err(BacktestError::InvalidConfiguration(format!(
            "end date {} must be after start date {}",
            end, start
        )));
    }
    if !initial_capital.is_finite() || initial_capital <= 0.0 {
        return Err(BacktestError::InvalidConfiguration(format!(
            "initial capital must be positive (value: {})",
            initial_capital
        )));
    }
    Ok(())
}

/// Custom weights must cover exactly the configured symbols and sum to 1.
/// A bad sum is surfaced as a configuration error instead of being silently
/// renormalized.
pub fn validate_custom_weights(
    symbols: &[String],
    weights: &HashMap<String, f64>,
) -> Result<(), BacktestError> {
    for symbol in symbols {
        match weights.get(symbol) {
            Some(weight) if weight.is_finite() && *weight >= 0.0 => {}
            Some(weight) => {
                return Err(BacktestError::InvalidConfiguration(format!(
                    "weight for {} must be a finite non-negative number (value: {})",
                    symbol, weight
                )));
            }
            None => {
                return Err(BacktestError::InvalidConfiguration(format!(
                    "missing custom weight for {}",
                    symbol
                )));
            }
        }
    }

    for symbol in weights.keys() {
        if !symbols.contains(symbol) {
            return Err(BacktestError::InvalidConfiguration(format!(
                "custom weight given for unknown symbol '{}'",
                symbol
            )));
        }
    }

    let sum: f64 = weights.values().sum();
    if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
        return Err(BacktestError::InvalidConfiguration(format!(
            "custom weights must sum to 1.0 (sum: {:.6})",
            sum
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_portfolio() -> PortfolioConfig {
        PortfolioConfig {
            symbols: vec!["AAPL".to_string(), "MSFT".to_string()],
            start: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2023, 12, 31).unwrap(),
            initial_capital: 10_000.0,
            allocation: AllocationStrategy::Equal,
            custom_weights: None,
            rebalance: RebalanceFrequency::Monthly,
            predictor: "technical".to_string(),
            predictor_params: HashMap::new(),
            lookback_window: 30,
            volatility_lookback: 20,
            interval: BarInterval::Daily,
            costs: CostModel::default(),
        }
    }

    #[test]
    fn rejects_single_symbol_portfolio() {
        let mut config = base_portfolio();
        config.symbols = vec!["AAPL".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_reversed_date_range() {
        let mut config = base_portfolio();
        config.end = config.start;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_custom_weights_that_do_not_sum_to_one() {
        let mut config = base_portfolio();
        config.allocation = AllocationStrategy::Custom;
        config.custom_weights = Some(HashMap::from([
            ("AAPL".to_string(), 0.5),
            ("MSFT".to_string(), 0.6),
        ]));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sum to 1.0"));
    }

    #[test]
    fn accepts_custom_weights_within_tolerance() {
        let mut config = base_portfolio();
        config.allocation = AllocationStrategy::Custom;
        config.custom_weights = Some(HashMap::from([
            ("AAPL".to_string(), 0.4),
            ("MSFT".to_string(), 0.6),
        ]));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_custom_weights_without_custom_strategy() {
        let mut config = base_portfolio();
        config.custom_weights = Some(HashMap::from([
            ("AAPL".to_string(), 0.5),
            ("MSFT".to_string(), 0.5),
        ]));
        assert!(config.validate().is_err());
    }
}
