//! Closed-form indicator math shared by the rule-based predictors and the
//! allocation/correlation analytics. All functions operate on plain close
//! slices so callers control exactly which bars are visible.

/// Simple moving average over the trailing `period` values. Returns `None`
/// until enough values exist; callers decide how to handle the warmup.
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// Exponential moving average series seeded with the first value.
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    out.push(values[0]);
    for i in 1..values.len() {
        let prev = out[i - 1];
        out.push(values[i] * multiplier + prev * (1.0 - multiplier));
    }
    out
}

/// 12/26/9-style MACD. Returns (macd_line, signal_line, histogram) for the
/// most recent value, or `None` when the slice is shorter than the slow
/// period plus signal warmup.
pub fn macd(
    values: &[f64],
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
) -> Option<(f64, f64, f64)> {
    if values.len() < slow_period + signal_period {
        return None;
    }

    let fast = ema_series(values, fast_period);
    let slow = ema_series(values, slow_period);
    let macd_line: Vec<f64> = fast.iter().zip(slow.iter()).map(|(f, s)| f - s).collect();
    let signal = ema_series(&macd_line, signal_period);

    let m = *macd_line.last()?;
    let s = *signal.last()?;
    Some((m, s, m - s))
}

/// Latest RSI value using Wilder smoothing. Returns `None` when fewer than
/// `period + 1` closes are available; callers that substitute the neutral 50
/// must log that fallback rather than applying it silently.
pub fn rsi(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period + 1 {
        return None;
    }

    let mut sum_gain = 0.0;
    let mut sum_loss = 0.0;
    for i in 1..=period {
        let delta = values[i] - values[i - 1];
        if delta >= 0.0 {
            sum_gain += delta;
        } else {
            sum_loss -= delta;
        }
    }

    let mut avg_gain = sum_gain / period as f64;
    let mut avg_loss = sum_loss / period as f64;

    // Wilder smoothing over the remainder of the series.
    for i in (period + 1)..values.len() {
        let delta = values[i] - values[i - 1];
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { -delta } else { 0.0 };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
    }

    Some(rsi_from_averages(avg_gain, avg_loss))
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else if avg_gain == 0.0 {
        0.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    }
}

/// Simple period-over-period returns. Zero-or-negative previous closes
/// contribute a zero return instead of an infinity.
pub fn simple_returns(values: &[f64]) -> Vec<f64> {
    values
        .windows(2)
        .map(|pair| {
            if pair[0] > 0.0 {
                (pair[1] - pair[0]) / pair[0]
            } else {
                0.0
            }
        })
        .collect()
}

/// Sample standard deviation of the trailing `lookback` returns.
pub fn rolling_volatility(returns: &[f64], lookback: usize) -> Option<f64> {
    if lookback < 2 || returns.len() < lookback {
        return None;
    }
    let window = &returns[returns.len() - lookback..];
    let mean = window.iter().sum::<f64>() / window.len() as f64;
    let variance = window
        .iter()
        .map(|r| (r - mean) * (r - mean))
        .sum::<f64>()
        / (window.len() as f64 - 1.0);
    Some(variance.sqrt())
}

/// Pearson correlation of two equally long series. Returns `None` for
/// mismatched lengths, short series, or zero variance on either side.
pub fn pearson_correlation(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() || a.len() < 2 {
        return None;
    }

    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        let da = x - mean_a;
        let db = y - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }

    if var_a <= f64::EPSILON || var_b <= f64::EPSILON {
        return None;
    }
    Some(cov / (var_a.sqrt() * var_b.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_requires_full_window() {
        let values = vec![1.0, 2.0, 3.0, 4.0];
        assert_eq!(sma(&values, 5), None);
        assert!((sma(&values, 2).unwrap() - 3.5).abs() < 1e-12);
        assert!((sma(&values, 4).unwrap() - 2.5).abs() < 1e-12);
    }

    #[test]
    fn rsi_is_none_without_enough_closes() {
        let values = vec![100.0; 10];
        assert_eq!(rsi(&values, 14), None);
    }

    #[test]
    fn rsi_extremes_for_one_sided_series() {
        let rising: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let falling: Vec<f64> = (0..30).map(|i| 130.0 - i as f64).collect();
        assert!((rsi(&rising, 14).unwrap() - 100.0).abs() < 1e-9);
        assert!(rsi(&falling, 14).unwrap() < 1e-9);
    }

    #[test]
    fn rsi_flat_series_is_neutral() {
        let flat = vec![50.0; 20];
        assert!((rsi(&flat, 14).unwrap() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn macd_none_until_warmup() {
        let values = vec![10.0; 20];
        assert_eq!(macd(&values, 12, 26, 9), None);
        let longer = vec![10.0; 40];
        let (line, signal, hist) = macd(&longer, 12, 26, 9).unwrap();
        assert!(line.abs() < 1e-9 && signal.abs() < 1e-9 && hist.abs() < 1e-9);
    }

    #[test]
    fn pearson_correlation_sign_and_bounds() {
        let a = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let inverse: Vec<f64> = a.iter().map(|v| -v).collect();
        assert!((pearson_correlation(&a, &a).unwrap() - 1.0).abs() < 1e-12);
        assert!((pearson_correlation(&a, &inverse).unwrap() + 1.0).abs() < 1e-12);

        let flat = vec![3.0; 5];
        assert_eq!(pearson_correlation(&a, &flat), None);
    }

    #[test]
    fn rolling_volatility_uses_trailing_window() {
        let mut returns = vec![0.0; 50];
        returns.extend([0.01, -0.01, 0.01, -0.01, 0.01]);
        let vol = rolling_volatility(&returns, 5).unwrap();
        assert!(vol > 0.0);
        // The leading zeros must not dilute the trailing window.
        let direct = rolling_volatility(&[0.01, -0.01, 0.01, -0.01, 0.01], 5).unwrap();
        assert!((vol - direct).abs() < 1e-12);
    }
}
