use crate::models::{PriceBar, Signal, SignalAction};
use crate::prediction::{
    get_param, get_param_usize_at_least, visible_closes, PredictionProvider,
    INSUFFICIENT_HISTORY_RATIONALE,
};
use anyhow::Result;
use chrono::NaiveDateTime;
use std::collections::HashMap;

/// Trades on the sign and magnitude of the trailing return: buy persistent
/// strength, sell persistent weakness, hold inside the dead zone.
pub struct MomentumPredictor {
    window: usize,
    entry_threshold: f64,
    confidence_scale: f64,
}

impl MomentumPredictor {
    pub fn new(parameters: HashMap<String, f64>) -> Self {
        Self {
            window: get_param_usize_at_least(&parameters, "momentumWindow", 20, 2),
            entry_threshold: get_param(&parameters, "entryThreshold", 0.02),
            confidence_scale: get_param(&parameters, "confidenceScale", 0.10),
        }
    }
}

impl PredictionProvider for MomentumPredictor {
    fn name(&self) -> &str {
        "momentum"
    }

    fn predict(
        &self,
        timestamp: NaiveDateTime,
        bars: &[PriceBar],
        lookback_window: usize,
    ) -> Result<Signal> {
        let symbol = bars.first().map(|bar| bar.symbol.as_str()).unwrap_or("");
        let closes = visible_closes(timestamp, bars);

        let required = lookback_window.max(self.window + 1);
        if closes.len() < required {
            return Ok(Signal::hold(timestamp, symbol, INSUFFICIENT_HISTORY_RATIONALE));
        }

        let last = *closes.last().expect("non-empty closes");
        let reference = closes[closes.len() - 1 - self.window];
        if reference <= 0.0 {
            return Ok(Signal::hold(timestamp, symbol, "non-positive reference close"));
        }

        let momentum = (last - reference) / reference;
        let rationale = format!(
            "{}-bar return {:.2}% vs threshold {:.2}%",
            self.window,
            momentum * 100.0,
            self.entry_threshold * 100.0
        );

        if momentum.abs() < self.entry_threshold {
            return Ok(Signal::hold(timestamp, symbol, &rationale));
        }

        let confidence = (momentum.abs() / self.confidence_scale).min(1.0);
        let action = if momentum > 0.0 {
            SignalAction::Buy
        } else {
            SignalAction::Sell
        };
        let target = last * (1.0 + momentum.signum() * self.entry_threshold);

        Ok(Signal {
            timestamp,
            symbol: symbol.to_string(),
            action,
            confidence,
            target_price: Some(target),
            rationale,
        })
    }
}
