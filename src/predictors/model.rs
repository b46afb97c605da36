use crate::models::{PriceBar, Signal, SignalAction};
use crate::prediction::{
    visible_bars, PredictionProvider, INSUFFICIENT_HISTORY_RATIONALE,
};
use anyhow::Result;
use chrono::NaiveDateTime;
use std::collections::HashMap;

/// Opaque learned-model collaborator. Implementations may wrap anything
/// that maps a close history to a next-price estimate; the backtester never
/// looks inside.
pub trait PriceModel: Send + Sync {
    fn predict_price(&self, symbol: &str, closes: &[f64]) -> Result<f64>;
}

/// Bridges a [`PriceModel`] into the prediction contract: the model's target
/// price is compared against the last visible close and turned into a
/// buy/sell/hold with confidence proportional to the predicted move.
pub struct ModelPredictor {
    model: Box<dyn PriceModel>,
    /// Predicted moves smaller than this fraction are treated as noise.
    entry_threshold: f64,
}

impl ModelPredictor {
    pub fn new(model: Box<dyn PriceModel>, parameters: HashMap<String, f64>) -> Self {
        let entry_threshold = parameters
            .get("entryThreshold")
            .copied()
            .filter(|value| value.is_finite() && *value > 0.0)
            .unwrap_or(0.01);
        Self {
            model,
            entry_threshold,
        }
    }
}

impl PredictionProvider for ModelPredictor {
    fn name(&self) -> &str {
        "model"
    }

    fn predict(
        &self,
        timestamp: NaiveDateTime,
        bars: &[PriceBar],
        lookback_window: usize,
    ) -> Result<Signal> {
        let symbol = bars.first().map(|bar| bar.symbol.as_str()).unwrap_or("");
        let visible = visible_bars(timestamp, bars);
        if visible.len() < lookback_window {
            return Ok(Signal::hold(timestamp, symbol, INSUFFICIENT_HISTORY_RATIONALE));
        }

        let closes: Vec<f64> = visible.iter().map(|bar| bar.close).collect();
        let last_close = *closes.last().expect("non-empty closes");

        // Model failures propagate; the orchestrator contains them per
        // timestep as implicit holds.
        let predicted = self.model.predict_price(symbol, &closes)?;
        if !predicted.is_finite() || predicted <= 0.0 {
            return Err(anyhow::anyhow!(
                "model returned unusable price {} for {}",
                predicted,
                symbol
            ));
        }

        let expected_move = (predicted - last_close) / last_close;
        let rationale = format!(
            "model target {:.2} vs close {:.2} ({:+.2}%)",
            predicted,
            last_close,
            expected_move * 100.0
        );

        if expected_move.abs() < self.entry_threshold {
            return Ok(Signal::hold(timestamp, symbol, &rationale));
        }

        Ok(Signal {
            timestamp,
            symbol: symbol.to_string(),
            action: if expected_move > 0.0 {
                SignalAction::Buy
            } else {
                SignalAction::Sell
            },
            confidence: (expected_move.abs() / (self.entry_threshold * 5.0)).min(1.0),
            target_price: Some(predicted),
            rationale,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};

    struct FixedModel(f64);

    impl PriceModel for FixedModel {
        fn predict_price(&self, _symbol: &str, _closes: &[f64]) -> Result<f64> {
            Ok(self.0)
        }
    }

    struct FailingModel;

    impl PriceModel for FailingModel {
        fn predict_price(&self, _symbol: &str, _closes: &[f64]) -> Result<f64> {
            Err(anyhow::anyhow!("inference backend offline"))
        }
    }

    fn bars(count: usize, close: f64) -> Vec<PriceBar> {
        let base = NaiveDate::from_ymd_opt(2023, 6, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        (0..count)
            .map(|i| PriceBar {
                symbol: "AAA".to_string(),
                timestamp: base + Duration::days(i as i64),
                open: close,
                high: close,
                low: close,
                close,
                volume: 1.0,
            })
            .collect()
    }

    #[test]
    fn buys_when_model_sees_upside() {
        let predictor = ModelPredictor::new(Box::new(FixedModel(110.0)), HashMap::new());
        let series = bars(30, 100.0);
        let t = series.last().unwrap().timestamp + Duration::days(1);
        let signal = predictor.predict(t, &series, 20).unwrap();
        assert_eq!(signal.action, SignalAction::Buy);
        assert_eq!(signal.target_price, Some(110.0));
    }

    #[test]
    fn model_errors_propagate_for_containment_upstream() {
        let predictor = ModelPredictor::new(Box::new(FailingModel), HashMap::new());
        let series = bars(30, 100.0);
        let t = series.last().unwrap().timestamp + Duration::days(1);
        assert!(predictor.predict(t, &series, 20).is_err());
    }

    #[test]
    fn small_predicted_moves_hold() {
        let predictor = ModelPredictor::new(Box::new(FixedModel(100.3)), HashMap::new());
        let series = bars(30, 100.0);
        let t = series.last().unwrap().timestamp + Duration::days(1);
        let signal = predictor.predict(t, &series, 20).unwrap();
        assert_eq!(signal.action, SignalAction::Hold);
    }
}
