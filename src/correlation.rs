use crate::indicators::pearson_correlation;
use crate::models::CorrelationReport;
use log::warn;
use statrs::statistics::Statistics;
use std::collections::HashMap;

/// Builds the pairwise return-correlation matrix and the derived
/// diversification measures for a portfolio run.
pub struct CorrelationAnalyzer;

impl CorrelationAnalyzer {
    /// Correlations are computed over the trailing overlap of each pair's
    /// return series, so a symbol that starts trading later in the window
    /// is compared against the same recent stretch of the other symbol.
    /// Mid-series gaps can still shift the windows by a few days; the
    /// series are not re-aligned bar by bar. A pair with no variance or no
    /// overlap reports 0 and is logged rather than poisoning the matrix.
    pub fn analyze(
        symbols: &[String],
        returns_by_symbol: &HashMap<String, Vec<f64>>,
        weights: &HashMap<String, f64>,
    ) -> CorrelationReport {
        let n = symbols.len();
        let mut matrix = vec![vec![0.0; n]; n];

        for i in 0..n {
            matrix[i][i] = 1.0;
            for j in (i + 1)..n {
                let value = Self::pair_correlation(
                    symbols[i].as_str(),
                    symbols[j].as_str(),
                    returns_by_symbol,
                );
                matrix[i][j] = value;
                matrix[j][i] = value;
            }
        }

        let avg_correlation = Self::average_off_diagonal(&matrix);
        let diversification_ratio =
            Self::diversification_ratio(symbols, returns_by_symbol, weights, &matrix);
        let effective_positions = Self::effective_positions(n, avg_correlation);

        CorrelationReport {
            symbols: symbols.to_vec(),
            matrix,
            avg_correlation,
            diversification_ratio,
            effective_positions,
        }
    }

    fn pair_correlation(
        a: &str,
        b: &str,
        returns_by_symbol: &HashMap<String, Vec<f64>>,
    ) -> f64 {
        let (Some(ra), Some(rb)) = (returns_by_symbol.get(a), returns_by_symbol.get(b)) else {
            warn!("Missing return series for correlation pair {}/{}", a, b);
            return 0.0;
        };
        let overlap = ra.len().min(rb.len());
        if overlap < 2 {
            warn!("No overlapping returns for correlation pair {}/{}", a, b);
            return 0.0;
        }
        match pearson_correlation(&ra[ra.len() - overlap..], &rb[rb.len() - overlap..]) {
            Some(value) => value,
            None => {
                warn!("Degenerate return series for correlation pair {}/{}", a, b);
                0.0
            }
        }
    }

    fn average_off_diagonal(matrix: &[Vec<f64>]) -> f64 {
        let n = matrix.len();
        if n < 2 {
            return 0.0;
        }
        let mut sum = 0.0;
        let mut count = 0usize;
        for i in 0..n {
            for j in (i + 1)..n {
                sum += matrix[i][j];
                count += 1;
            }
        }
        sum / count as f64
    }

    /// Weighted average of individual volatilities divided by the portfolio
    /// volatility implied by the correlation matrix. 1.0 means perfectly
    /// correlated holdings; higher means real diversification.
    fn diversification_ratio(
        symbols: &[String],
        returns_by_symbol: &HashMap<String, Vec<f64>>,
        weights: &HashMap<String, f64>,
        matrix: &[Vec<f64>],
    ) -> f64 {
        let vols: Vec<f64> = symbols
            .iter()
            .map(|symbol| {
                returns_by_symbol
                    .get(symbol)
                    .filter(|r| r.len() >= 2)
                    .map(|r| r.iter().copied().std_dev())
                    .filter(|v| v.is_finite())
                    .unwrap_or(0.0)
            })
            .collect();
        let w: Vec<f64> = symbols
            .iter()
            .map(|symbol| weights.get(symbol).copied().unwrap_or(0.0))
            .collect();

        let weighted_vol: f64 = w.iter().zip(&vols).map(|(wi, vi)| wi * vi).sum();

        let mut variance = 0.0;
        for i in 0..symbols.len() {
            for j in 0..symbols.len() {
                variance += w[i] * w[j] * vols[i] * vols[j] * matrix[i][j];
            }
        }
        let portfolio_vol = variance.max(0.0).sqrt();
        if portfolio_vol <= f64::EPSILON {
            return 1.0;
        }
        weighted_vol / portfolio_vol
    }

    /// How many independent positions the portfolio behaves like given the
    /// average pairwise correlation: n when holdings are uncorrelated,
    /// collapsing toward 1 as they move together.
    fn effective_positions(n: usize, avg_correlation: f64) -> f64 {
        if n == 0 {
            return 0.0;
        }
        let n = n as f64;
        let rho = avg_correlation.clamp(0.0, 1.0);
        n / (1.0 + (n - 1.0) * rho)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn equal_weights(names: &[&str]) -> HashMap<String, f64> {
        names
            .iter()
            .map(|s| (s.to_string(), 1.0 / names.len() as f64))
            .collect()
    }

    #[test]
    fn matrix_is_symmetric_with_unit_diagonal() {
        let a: Vec<f64> = (0..30).map(|i| (i as f64 * 0.7).sin() * 0.01).collect();
        let b: Vec<f64> = (0..30).map(|i| (i as f64 * 0.3).cos() * 0.02).collect();
        let c: Vec<f64> = a.iter().zip(&b).map(|(x, y)| x * 0.5 - y).collect();
        let returns = HashMap::from([
            ("AAA".to_string(), a),
            ("BBB".to_string(), b),
            ("CCC".to_string(), c),
        ]);
        let names = symbols(&["AAA", "BBB", "CCC"]);

        let report = CorrelationAnalyzer::analyze(&names, &returns, &equal_weights(&["AAA", "BBB", "CCC"]));

        assert_eq!(report.matrix.len(), 3);
        for i in 0..3 {
            assert!((report.matrix[i][i] - 1.0).abs() < 1e-12);
            for j in 0..3 {
                assert!((report.matrix[i][j] - report.matrix[j][i]).abs() < 1e-12);
                assert!(report.matrix[i][j] >= -1.0 - 1e-9 && report.matrix[i][j] <= 1.0 + 1e-9);
            }
        }
    }

    #[test]
    fn identical_series_correlate_perfectly_and_do_not_diversify() {
        let r: Vec<f64> = (0..30).map(|i| ((i % 5) as f64 - 2.0) * 0.01).collect();
        let returns = HashMap::from([("AAA".to_string(), r.clone()), ("BBB".to_string(), r)]);
        let names = symbols(&["AAA", "BBB"]);

        let report = CorrelationAnalyzer::analyze(&names, &returns, &equal_weights(&["AAA", "BBB"]));

        assert!((report.matrix[0][1] - 1.0).abs() < 1e-9);
        assert!((report.avg_correlation - 1.0).abs() < 1e-9);
        assert!((report.diversification_ratio - 1.0).abs() < 1e-9);
        // Perfectly correlated holdings act like a single position.
        assert!((report.effective_positions - 1.0).abs() < 1e-6);
    }

    #[test]
    fn anticorrelated_series_diversify() {
        let a: Vec<f64> = (0..30).map(|i| ((i % 4) as f64 - 1.5) * 0.01).collect();
        let b: Vec<f64> = a.iter().map(|x| -x).collect();
        let returns = HashMap::from([("AAA".to_string(), a), ("BBB".to_string(), b)]);
        let names = symbols(&["AAA", "BBB"]);

        let report = CorrelationAnalyzer::analyze(&names, &returns, &equal_weights(&["AAA", "BBB"]));

        assert!(report.matrix[0][1] < -0.99);
        assert!(report.diversification_ratio > 1.5);
    }

    #[test]
    fn late_starter_is_compared_against_the_recent_window() {
        // AAA trades the whole window: a flat early stretch, then a swing.
        // BBB only exists for the swing and mirrors it exactly. Aligned on
        // the trailing overlap the pair is perfectly anticorrelated; an
        // early-window alignment would see AAA's flat stretch instead.
        let swing: Vec<f64> = (0..30).map(|i| if i % 2 == 0 { 0.02 } else { -0.02 }).collect();
        let mut a = vec![0.01; 30];
        a.extend(&swing);
        let b: Vec<f64> = swing.iter().map(|r| -r).collect();

        let returns = HashMap::from([("AAA".to_string(), a), ("BBB".to_string(), b)]);
        let names = symbols(&["AAA", "BBB"]);

        let report =
            CorrelationAnalyzer::analyze(&names, &returns, &equal_weights(&["AAA", "BBB"]));
        assert!(report.matrix[0][1] < -0.99);
    }

    #[test]
    fn uncorrelated_holdings_count_as_independent_positions() {
        // Empty return series give a zero off-diagonal matrix.
        let names = symbols(&["AAA", "BBB"]);
        let returns: HashMap<String, Vec<f64>> = HashMap::new();

        let report = CorrelationAnalyzer::analyze(&names, &returns, &equal_weights(&["AAA", "BBB"]));
        assert!((report.effective_positions - 2.0).abs() < 1e-9);
    }

    #[test]
    fn missing_series_yields_zero_not_panic() {
        let names = symbols(&["AAA", "BBB"]);
        let returns = HashMap::from([("AAA".to_string(), vec![0.01, -0.02, 0.005])]);
        let report = CorrelationAnalyzer::analyze(&names, &returns, &equal_weights(&["AAA", "BBB"]));
        assert_eq!(report.matrix[0][1], 0.0);
    }
}
