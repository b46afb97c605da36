use crate::indicators;
use crate::models::{PriceBar, Signal, SignalAction};
use crate::prediction::{
    get_param, get_param_usize_at_least, visible_closes, PredictionProvider,
    INSUFFICIENT_HISTORY_RATIONALE,
};
use anyhow::Result;
use chrono::NaiveDateTime;
use log::warn;
use std::collections::HashMap;

/// Votes three classic indicator rules (RSI, MACD, SMA crossover) and trades
/// when a majority agrees. Confidence scales with how many voters line up.
pub struct TechnicalRulePredictor {
    rsi_period: usize,
    oversold_level: f64,
    overbought_level: f64,
    macd_fast: usize,
    macd_slow: usize,
    macd_signal: usize,
    sma_short: usize,
    sma_long: usize,
}

impl TechnicalRulePredictor {
    pub fn new(parameters: HashMap<String, f64>) -> Self {
        Self {
            rsi_period: get_param_usize_at_least(&parameters, "rsiPeriod", 14, 2),
            oversold_level: get_param(&parameters, "oversoldLevel", 30.0),
            overbought_level: get_param(&parameters, "overboughtLevel", 70.0),
            macd_fast: get_param_usize_at_least(&parameters, "macdFast", 12, 2),
            macd_slow: get_param_usize_at_least(&parameters, "macdSlow", 26, 3),
            macd_signal: get_param_usize_at_least(&parameters, "macdSignal", 9, 2),
            sma_short: get_param_usize_at_least(&parameters, "smaShort", 10, 2),
            sma_long: get_param_usize_at_least(&parameters, "smaLong", 30, 3),
        }
    }

    fn rsi_vote(&self, symbol: &str, closes: &[f64]) -> (i32, String) {
        let value = match indicators::rsi(closes, self.rsi_period) {
            Some(value) => value,
            None => {
                // Explicit neutral fallback; never a silent default.
                warn!(
                    "RSI fallback to neutral 50 for {} ({} closes, period {})",
                    symbol,
                    closes.len(),
                    self.rsi_period
                );
                50.0
            }
        };

        if value < self.oversold_level {
            (1, format!("RSI {:.1} oversold", value))
        } else if value > self.overbought_level {
            (-1, format!("RSI {:.1} overbought", value))
        } else {
            (0, format!("RSI {:.1} neutral", value))
        }
    }

    fn macd_vote(&self, closes: &[f64]) -> (i32, String) {
        match indicators::macd(closes, self.macd_fast, self.macd_slow, self.macd_signal) {
            Some((line, signal, histogram)) if histogram > 0.0 => {
                (1, format!("MACD {:.3} above signal {:.3}", line, signal))
            }
            Some((line, signal, histogram)) if histogram < 0.0 => {
                (-1, format!("MACD {:.3} below signal {:.3}", line, signal))
            }
            Some(_) => (0, "MACD flat".to_string()),
            None => (0, "MACD warming up".to_string()),
        }
    }

    fn crossover_vote(&self, closes: &[f64]) -> (i32, String) {
        let short = indicators::sma(closes, self.sma_short);
        let long = indicators::sma(closes, self.sma_long);
        match (short, long) {
            (Some(short), Some(long)) if short > long => {
                (1, format!("SMA{} {:.2} above SMA{} {:.2}", self.sma_short, short, self.sma_long, long))
            }
            (Some(short), Some(long)) if short < long => {
                (-1, format!("SMA{} {:.2} below SMA{} {:.2}", self.sma_short, short, self.sma_long, long))
            }
            (Some(_), Some(_)) => (0, "SMAs equal".to_string()),
            _ => (0, "SMA warming up".to_string()),
        }
    }
}

impl PredictionProvider for TechnicalRulePredictor {
    fn name(&self) -> &str {
        "technical"
    }

    fn predict(
        &self,
        timestamp: NaiveDateTime,
        bars: &[PriceBar],
        lookback_window: usize,
    ) -> Result<Signal> {
        let symbol = bars.first().map(|bar| bar.symbol.as_str()).unwrap_or("");
        let closes = visible_closes(timestamp, bars);
        if closes.len() < lookback_window {
            return Ok(Signal::hold(timestamp, symbol, INSUFFICIENT_HISTORY_RATIONALE));
        }

        let (rsi_vote, rsi_note) = self.rsi_vote(symbol, &closes);
        let (macd_vote, macd_note) = self.macd_vote(&closes);
        let (cross_vote, cross_note) = self.crossover_vote(&closes);

        let score = rsi_vote + macd_vote + cross_vote;
        let rationale = format!("{}; {}; {}", rsi_note, macd_note, cross_note);
        let last_close = *closes.last().expect("non-empty closes");

        let (action, confidence, target) = if score >= 2 {
            (SignalAction::Buy, score as f64 / 3.0, last_close * 1.02)
        } else if score <= -2 {
            (SignalAction::Sell, (-score) as f64 / 3.0, last_close * 0.98)
        } else {
            return Ok(Signal::hold(timestamp, symbol, &rationale));
        };

        Ok(Signal {
            timestamp,
            symbol: symbol.to_string(),
            action,
            confidence: confidence.min(1.0),
            target_price: Some(target),
            rationale,
        })
    }
}
