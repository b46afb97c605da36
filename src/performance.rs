use crate::models::{EquityPoint, PerformanceMetrics, Trade};
use statrs::statistics::Statistics;

const TRADING_DAYS_PER_YEAR: f64 = 252.0;
const RISK_FREE_ANNUAL: f64 = 0.02;

/// Derives summary statistics from a finished run's equity curve and trade
/// ledger. Ratios that need at least two equity points report 0 instead of
/// NaN so downstream JSON stays clean.
pub struct PerformanceCalculator;

impl PerformanceCalculator {
    pub fn calculate(
        initial_capital: f64,
        equity_curve: &[EquityPoint],
        trades: &[Trade],
    ) -> PerformanceMetrics {
        let final_value = equity_curve
            .last()
            .map(|point| point.total_value)
            .unwrap_or(initial_capital);
        let total_return = final_value - initial_capital;
        let total_return_percent = if initial_capital > 0.0 {
            total_return / initial_capital * 100.0
        } else {
            0.0
        };

        let returns = Self::period_returns(equity_curve);
        let sharpe_ratio = Self::sharpe(&returns);
        let sortino_ratio = Self::sortino(&returns);
        let (max_drawdown, max_drawdown_percent) = Self::max_drawdown(equity_curve);

        let closed: Vec<f64> = trades.iter().filter_map(|t| t.realized_pnl).collect();
        let winning_trades = closed.iter().filter(|pnl| **pnl > 0.0).count() as i32;
        let losing_trades = closed.iter().filter(|pnl| **pnl < 0.0).count() as i32;
        let win_rate = if closed.is_empty() {
            0.0
        } else {
            winning_trades as f64 / closed.len() as f64
        };

        let gross_profit: f64 = closed.iter().filter(|pnl| **pnl > 0.0).sum();
        let gross_loss: f64 = -closed.iter().filter(|pnl| **pnl < 0.0).sum::<f64>();
        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        PerformanceMetrics {
            total_return,
            total_return_percent,
            sharpe_ratio,
            sortino_ratio,
            max_drawdown,
            max_drawdown_percent,
            win_rate,
            profit_factor,
            total_trades: trades.len() as i32,
            winning_trades,
            losing_trades,
            total_commission: trades.iter().map(|t| t.commission).sum(),
            total_slippage_cost: trades.iter().map(|t| t.slippage_cost).sum(),
        }
    }

    fn period_returns(equity_curve: &[EquityPoint]) -> Vec<f64> {
        equity_curve
            .windows(2)
            .filter(|pair| pair[0].total_value > 0.0)
            .map(|pair| (pair[1].total_value - pair[0].total_value) / pair[0].total_value)
            .collect()
    }

    fn sharpe(returns: &[f64]) -> f64 {
        if returns.len() < 2 {
            return 0.0;
        }
        let mean = returns.iter().copied().mean();
        let std_dev = returns.iter().copied().std_dev();
        if !std_dev.is_finite() || std_dev <= f64::EPSILON {
            return 0.0;
        }
        let rf_daily = RISK_FREE_ANNUAL / TRADING_DAYS_PER_YEAR;
        (mean - rf_daily) / std_dev * TRADING_DAYS_PER_YEAR.sqrt()
    }

    /// Like Sharpe but penalizing only downside deviation below the
    /// risk-free rate.
    fn sortino(returns: &[f64]) -> f64 {
        if returns.len() < 2 {
            return 0.0;
        }
        let rf_daily = RISK_FREE_ANNUAL / TRADING_DAYS_PER_YEAR;
        let mean = returns.iter().copied().mean();
        let downside_sq: f64 = returns
            .iter()
            .map(|r| (r - rf_daily).min(0.0).powi(2))
            .sum::<f64>()
            / returns.len() as f64;
        let downside_dev = downside_sq.sqrt();
        if downside_dev <= f64::EPSILON {
            return 0.0;
        }
        (mean - rf_daily) / downside_dev * TRADING_DAYS_PER_YEAR.sqrt()
    }

    /// Single pass over the curve tracking the running peak.
    fn max_drawdown(equity_curve: &[EquityPoint]) -> (f64, f64) {
        let mut peak = f64::MIN;
        let mut worst = 0.0f64;
        let mut worst_percent = 0.0f64;
        for point in equity_curve {
            peak = peak.max(point.total_value);
            let drawdown = peak - point.total_value;
            if drawdown > worst {
                worst = drawdown;
                worst_percent = if peak > 0.0 { drawdown / peak * 100.0 } else { 0.0 };
            }
        }
        (worst, worst_percent)
    }
}
