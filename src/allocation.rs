use crate::config::{
    validate_custom_weights, AllocationStrategy, RebalanceFrequency, WEIGHT_SUM_TOLERANCE,
};
use crate::error::BacktestError;
use crate::indicators::rolling_volatility;
use crate::models::{Account, AllocationTarget, TradeSide};
use chrono::{Datelike, NaiveDate};
use log::debug;
use std::collections::HashMap;

/// An order the allocation engine wants executed to move the account toward
/// its target weights.
#[derive(Debug, Clone)]
pub struct RebalanceOrder {
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: f64,
}

/// Computes target capital weights and the rebalancing orders needed to
/// reach them. Risk parity here is the simplified inverse-volatility
/// weighting: each symbol is sized by 1/sigma of its trailing daily returns,
/// without accounting for cross correlations. Equalizing marginal risk
/// contribution would change results and is intentionally not done.
pub struct AllocationEngine {
    volatility_lookback: usize,
    /// Rebalance deltas below this notional are ignored to avoid churn.
    min_rebalance_value: f64,
}

impl AllocationEngine {
    pub fn new(volatility_lookback: usize, min_rebalance_value: f64) -> Self {
        Self {
            volatility_lookback,
            min_rebalance_value,
        }
    }

    pub fn compute_targets(
        &self,
        strategy: AllocationStrategy,
        symbols: &[String],
        returns_by_symbol: &HashMap<String, Vec<f64>>,
        custom_weights: Option<&HashMap<String, f64>>,
    ) -> Result<AllocationTarget, BacktestError> {
        if symbols.is_empty() {
            return Err(BacktestError::InvalidConfiguration(
                "cannot allocate across zero symbols".to_string(),
            ));
        }

        let weights = match strategy {
            AllocationStrategy::Equal => {
                let weight = 1.0 / symbols.len() as f64;
                symbols
                    .iter()
                    .map(|symbol| (symbol.clone(), weight))
                    .collect()
            }
            AllocationStrategy::RiskParity => self.inverse_volatility_weights(symbols, returns_by_symbol),
            AllocationStrategy::Custom => {
                let weights = custom_weights.ok_or_else(|| {
                    BacktestError::InvalidConfiguration(
                        "custom allocation requires explicit weights".to_string(),
                    )
                })?;
                validate_custom_weights(symbols, weights)?;
                weights.clone()
            }
        };

        let target = AllocationTarget { weights };
        debug_assert!((target.weight_sum() - 1.0).abs() <= WEIGHT_SUM_TOLERANCE * 10.0);
        Ok(target)
    }

    /// weight[i] proportional to 1/volatility[i]. Symbols without enough
    /// return history to measure volatility are assigned the mean
    /// volatility of the measurable ones so they neither dominate nor
    /// vanish; an all-unmeasurable set degenerates to equal weight.
    fn inverse_volatility_weights(
        &self,
        symbols: &[String],
        returns_by_symbol: &HashMap<String, Vec<f64>>,
    ) -> HashMap<String, f64> {
        let mut volatilities: HashMap<&str, Option<f64>> = HashMap::new();
        for symbol in symbols {
            let vol = returns_by_symbol
                .get(symbol)
                .and_then(|returns| rolling_volatility(returns, self.volatility_lookback))
                .filter(|v| v.is_finite() && *v > 0.0);
            volatilities.insert(symbol.as_str(), vol);
        }

        let measured: Vec<f64> = volatilities.values().filter_map(|v| *v).collect();
        if measured.is_empty() {
            let weight = 1.0 / symbols.len() as f64;
            return symbols
                .iter()
                .map(|symbol| (symbol.clone(), weight))
                .collect();
        }
        let mean_vol = measured.iter().sum::<f64>() / measured.len() as f64;

        let inverses: HashMap<&str, f64> = volatilities
            .iter()
            .map(|(symbol, vol)| (*symbol, 1.0 / vol.unwrap_or(mean_vol)))
            .collect();
        let total: f64 = inverses.values().sum();

        symbols
            .iter()
            .map(|symbol| {
                (
                    symbol.clone(),
                    inverses.get(symbol.as_str()).copied().unwrap_or(0.0) / total,
                )
            })
            .collect()
    }

    /// Diffs current position values against target values and emits one
    /// order per symbol whose delta clears the minimum-trade threshold.
    /// Sells come first so freed cash can fund the buys.
    pub fn rebalance_orders(
        &self,
        target: &AllocationTarget,
        account: &Account,
        prices: &HashMap<String, f64>,
    ) -> Vec<RebalanceOrder> {
        let total_value = account.total_value(prices);
        let mut sells = Vec::new();
        let mut buys = Vec::new();

        for (symbol, weight) in &target.weights {
            let Some(price) = prices.get(symbol).copied().filter(|p| *p > 0.0) else {
                debug!("No price for {} at rebalance; leaving untouched", symbol);
                continue;
            };

            let current_value = account.position_quantity(symbol) * price;
            let target_value = weight * total_value;
            let delta = target_value - current_value;

            if delta.abs() < self.min_rebalance_value {
                continue;
            }

            let order = RebalanceOrder {
                symbol: symbol.clone(),
                side: if delta > 0.0 {
                    TradeSide::Buy
                } else {
                    TradeSide::Sell
                },
                quantity: delta.abs() / price,
            };
            if delta > 0.0 {
                buys.push(order);
            } else {
                sells.push(order);
            }
        }

        // Deterministic ordering regardless of map iteration order.
        sells.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        buys.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        sells.extend(buys);
        sells
    }
}

/// True when stepping from `previous` to `current` crosses a rebalance
/// boundary: a new ISO week, calendar month, or calendar quarter.
pub fn crosses_rebalance_boundary(
    frequency: RebalanceFrequency,
    previous: NaiveDate,
    current: NaiveDate,
) -> bool {
    match frequency {
        RebalanceFrequency::Never => false,
        RebalanceFrequency::Weekly => {
            previous.iso_week().year() != current.iso_week().year()
                || previous.iso_week().week() != current.iso_week().week()
        }
        RebalanceFrequency::Monthly => {
            previous.year() != current.year() || previous.month() != current.month()
        }
        RebalanceFrequency::Quarterly => {
            previous.year() != current.year()
                || (previous.month0() / 3) != (current.month0() / 3)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn equal_weight_is_one_over_n_regardless_of_history() {
        let engine = AllocationEngine::new(20, 10.0);
        let target = engine
            .compute_targets(
                AllocationStrategy::Equal,
                &symbols(&["AAPL", "MSFT", "GOOGL"]),
                &HashMap::new(),
                None,
            )
            .unwrap();
        for weight in target.weights.values() {
            assert!((weight - 1.0 / 3.0).abs() < 1e-9);
        }
        assert!((target.weight_sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn risk_parity_prefers_the_calmer_symbol() {
        let engine = AllocationEngine::new(20, 10.0);
        let calm: Vec<f64> = (0..40).map(|i| if i % 2 == 0 { 0.001 } else { -0.001 }).collect();
        let wild: Vec<f64> = (0..40).map(|i| if i % 2 == 0 { 0.05 } else { -0.05 }).collect();
        let returns = HashMap::from([
            ("CALM".to_string(), calm),
            ("WILD".to_string(), wild),
        ]);

        let target = engine
            .compute_targets(
                AllocationStrategy::RiskParity,
                &symbols(&["CALM", "WILD"]),
                &returns,
                None,
            )
            .unwrap();

        assert!(target.weight("CALM") > target.weight("WILD"));
        assert!((target.weight_sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn risk_parity_degenerates_to_equal_without_history() {
        let engine = AllocationEngine::new(20, 10.0);
        let target = engine
            .compute_targets(
                AllocationStrategy::RiskParity,
                &symbols(&["AAA", "BBB"]),
                &HashMap::new(),
                None,
            )
            .unwrap();
        assert!((target.weight("AAA") - 0.5).abs() < 1e-9);
        assert!((target.weight_sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn custom_weights_are_not_silently_renormalized() {
        let engine = AllocationEngine::new(20, 10.0);
        let bad = HashMap::from([("AAA".to_string(), 0.5), ("BBB".to_string(), 0.6)]);
        let err = engine
            .compute_targets(
                AllocationStrategy::Custom,
                &symbols(&["AAA", "BBB"]),
                &HashMap::new(),
                Some(&bad),
            )
            .unwrap_err();
        assert!(matches!(err, BacktestError::InvalidConfiguration(_)));
    }

    #[test]
    fn small_deltas_produce_no_orders() {
        let engine = AllocationEngine::new(20, 100.0);
        let mut account = Account::new(1_000.0);
        account.cash = 500.0;
        account.positions.insert(
            "AAA".to_string(),
            crate::models::Position {
                symbol: "AAA".to_string(),
                quantity: 5.0,
                average_cost: 100.0,
            },
        );
        let prices = HashMap::from([("AAA".to_string(), 100.0), ("BBB".to_string(), 50.0)]);

        // Total 1000; equal target 500 each. AAA already at 500; BBB needs
        // 500 which clears the threshold, AAA delta is zero.
        let target = AllocationTarget {
            weights: HashMap::from([("AAA".to_string(), 0.5), ("BBB".to_string(), 0.5)]),
        };
        let orders = engine.rebalance_orders(&target, &account, &prices);
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].symbol, "BBB");
        assert_eq!(orders[0].side, TradeSide::Buy);
        assert!((orders[0].quantity - 10.0).abs() < 1e-9);
    }

    #[test]
    fn sells_precede_buys() {
        let engine = AllocationEngine::new(20, 10.0);
        let mut account = Account::new(0.0);
        account.cash = 0.0;
        account.positions.insert(
            "AAA".to_string(),
            crate::models::Position {
                symbol: "AAA".to_string(),
                quantity: 10.0,
                average_cost: 100.0,
            },
        );
        let prices = HashMap::from([("AAA".to_string(), 100.0), ("BBB".to_string(), 100.0)]);
        let target = AllocationTarget {
            weights: HashMap::from([("AAA".to_string(), 0.5), ("BBB".to_string(), 0.5)]),
        };

        let orders = engine.rebalance_orders(&target, &account, &prices);
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].side, TradeSide::Sell);
        assert_eq!(orders[0].symbol, "AAA");
        assert_eq!(orders[1].side, TradeSide::Buy);
        assert_eq!(orders[1].symbol, "BBB");
    }

    #[test]
    fn rebalance_boundaries() {
        let d = |y, m, day| NaiveDate::from_ymd_opt(y, m, day).unwrap();
        assert!(!crosses_rebalance_boundary(
            RebalanceFrequency::Never,
            d(2023, 1, 1),
            d(2024, 1, 1)
        ));
        assert!(crosses_rebalance_boundary(
            RebalanceFrequency::Weekly,
            d(2023, 1, 6), // Friday, week 1
            d(2023, 1, 9)  // Monday, week 2
        ));
        assert!(!crosses_rebalance_boundary(
            RebalanceFrequency::Monthly,
            d(2023, 3, 1),
            d(2023, 3, 31)
        ));
        assert!(crosses_rebalance_boundary(
            RebalanceFrequency::Monthly,
            d(2023, 3, 31),
            d(2023, 4, 3)
        ));
        assert!(crosses_rebalance_boundary(
            RebalanceFrequency::Quarterly,
            d(2023, 3, 31),
            d(2023, 4, 3)
        ));
        assert!(!crosses_rebalance_boundary(
            RebalanceFrequency::Quarterly,
            d(2023, 4, 3),
            d(2023, 6, 30)
        ));
    }
}
