use crate::models::{PriceBar, Signal};
use anyhow::Result;
use chrono::NaiveDateTime;
use std::collections::HashMap;

pub const INSUFFICIENT_HISTORY_RATIONALE: &str = "insufficient historical data";

/// A pluggable signal source. Implementations see the full bar series but
/// must only act on bars dated strictly before `timestamp`; use
/// [`visible_bars`] as the first step of every `predict` so the walk-forward
/// guarantee holds by construction.
pub trait PredictionProvider: Send + Sync {
    fn name(&self) -> &str;

    fn predict(
        &self,
        timestamp: NaiveDateTime,
        bars: &[PriceBar],
        lookback_window: usize,
    ) -> Result<Signal>;
}

/// Restricts a chronologically sorted series to bars strictly before the
/// decision timestamp. This is the no-look-ahead boundary: nothing at or
/// after `timestamp` may influence the signal.
pub fn visible_bars(timestamp: NaiveDateTime, bars: &[PriceBar]) -> &[PriceBar] {
    let cutoff = bars.partition_point(|bar| bar.timestamp < timestamp);
    &bars[..cutoff]
}

/// Closes of the visible window, newest last.
pub fn visible_closes(timestamp: NaiveDateTime, bars: &[PriceBar]) -> Vec<f64> {
    visible_bars(timestamp, bars)
        .iter()
        .map(|bar| bar.close)
        .collect()
}

#[path = "predictors/technical.rs"]
pub mod technical;
pub use technical::TechnicalRulePredictor;

#[path = "predictors/momentum.rs"]
pub mod momentum;
pub use momentum::MomentumPredictor;

#[path = "predictors/model.rs"]
pub mod model;
pub use model::{ModelPredictor, PriceModel};

/// Builds a rule-based predictor by name. Model-backed predictors are
/// constructed directly with [`ModelPredictor::new`] since they need a live
/// model collaborator.
pub fn create_predictor(
    name: &str,
    parameters: HashMap<String, f64>,
) -> Result<Box<dyn PredictionProvider>> {
    match name.trim().to_ascii_lowercase().as_str() {
        "technical" => Ok(Box::new(TechnicalRulePredictor::new(parameters))),
        "momentum" => Ok(Box::new(MomentumPredictor::new(parameters))),
        other => Err(anyhow::anyhow!("Unknown predictor '{}'", other)),
    }
}

/// Extract a parameter as f64 with a default value
pub(crate) fn get_param(params: &HashMap<String, f64>, key: &str, default: f64) -> f64 {
    let value = params.get(key).copied().unwrap_or(default);
    if value.is_finite() {
        value
    } else {
        default
    }
}

/// Extract a parameter as usize with a minimum value
pub(crate) fn get_param_usize_at_least(
    params: &HashMap<String, f64>,
    key: &str,
    default: usize,
    min: usize,
) -> usize {
    params
        .get(key)
        .copied()
        .filter(|value| value.is_finite())
        .unwrap_or(default as f64)
        .max(min as f64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn bars(closes: &[f64]) -> Vec<PriceBar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, close)| PriceBar {
                symbol: "AAA".to_string(),
                timestamp: NaiveDate::from_ymd_opt(2023, 1, 1)
                    .unwrap()
                    .and_hms_opt(0, 0, 0)
                    .unwrap()
                    + chrono::Duration::days(i as i64),
                open: *close,
                high: *close,
                low: *close,
                close: *close,
                volume: 1.0,
            })
            .collect()
    }

    #[test]
    fn visible_bars_excludes_decision_timestamp() {
        let series = bars(&[1.0, 2.0, 3.0, 4.0]);
        let cutoff = series[2].timestamp;
        let visible = visible_bars(cutoff, &series);
        assert_eq!(visible.len(), 2);
        assert!(visible.iter().all(|bar| bar.timestamp < cutoff));
    }

    #[test]
    fn factory_rejects_unknown_predictor() {
        assert!(create_predictor("finbert", HashMap::new()).is_err());
        assert!(create_predictor("technical", HashMap::new()).is_ok());
        assert!(create_predictor("momentum", HashMap::new()).is_ok());
    }
}
