use crate::allocation::{crosses_rebalance_boundary, AllocationEngine};
use crate::config::{AllocationStrategy, BacktestConfig, BarInterval, PortfolioConfig};
use crate::correlation::CorrelationAnalyzer;
use crate::data::HistoricalDataProvider;
use crate::error::BacktestError;
use crate::indicators::simple_returns;
use crate::models::{
    Account, AllocationTarget, BacktestResult, EquityPoint, ExcludedSymbol, PriceBar, Signal,
    SignalAction, SymbolBreakdown, TradeSide,
};
use crate::performance::PerformanceCalculator;
use crate::prediction::PredictionProvider;
use crate::simulator::{TradeSimulator, QUANTITY_EPSILON};
use anyhow::{anyhow, Result};
use chrono::{NaiveDate, NaiveDateTime};
use log::{info, warn};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use uuid::Uuid;

/// Lifecycle of one run. Transitions are strictly forward; any error sends
/// the run to `Failed` and the partial state is discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initialized,
    LoadingData,
    GeneratingPredictions,
    Simulating,
    Aggregating,
    Complete,
    Failed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Initialized => "initialized",
            Phase::LoadingData => "loading_data",
            Phase::GeneratingPredictions => "generating_predictions",
            Phase::Simulating => "simulating",
            Phase::Aggregating => "aggregating",
            Phase::Complete => "complete",
            Phase::Failed => "failed",
        }
    }
}

/// Drives a run end to end: validate, load bars, walk the timeline bar by
/// bar asking the predictor for a signal and the simulator for fills, then
/// aggregate the ledger into a result.
pub struct BacktestOrchestrator {
    data: Arc<dyn HistoricalDataProvider>,
    predictor: Box<dyn PredictionProvider>,
    cancel: Arc<AtomicBool>,
    phase: Phase,
}

impl BacktestOrchestrator {
    pub fn new(data: Arc<dyn HistoricalDataProvider>, predictor: Box<dyn PredictionProvider>) -> Self {
        Self {
            data,
            predictor,
            cancel: Arc::new(AtomicBool::new(false)),
            phase: Phase::Initialized,
        }
    }

    /// Shared flag checked between timesteps; set it from another thread to
    /// stop the run at the next bar.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn transition(&mut self, next: Phase) {
        info!("Run phase {} -> {}", self.phase.as_str(), next.as_str());
        self.phase = next;
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(anyhow!("run cancelled"));
        }
        Ok(())
    }

    pub fn run_single(&mut self, config: &BacktestConfig) -> Result<BacktestResult> {
        match self.run_single_inner(config) {
            Ok(result) => {
                self.transition(Phase::Complete);
                Ok(result)
            }
            Err(err) => {
                self.transition(Phase::Failed);
                Err(err)
            }
        }
    }

    pub fn run_portfolio(&mut self, config: &PortfolioConfig) -> Result<BacktestResult> {
        match self.run_portfolio_inner(config) {
            Ok(result) => {
                self.transition(Phase::Complete);
                Ok(result)
            }
            Err(err) => {
                self.transition(Phase::Failed);
                Err(err)
            }
        }
    }

    fn run_single_inner(&mut self, config: &BacktestConfig) -> Result<BacktestResult> {
        config.validate()?;
        let run_id = Uuid::new_v4().to_string();
        info!(
            "Starting backtest {} for {} ({} to {}, {} predictor)",
            run_id,
            config.symbol,
            config.start,
            config.end,
            self.predictor.name()
        );

        self.transition(Phase::LoadingData);
        let symbols = vec![config.symbol.trim().to_uppercase()];
        let (mut series, excluded) =
            self.load_series(&symbols, config.start, config.end, config.interval)?;
        let bars = series.remove(&symbols[0]).unwrap_or_default();
        if bars.is_empty() {
            return Err(BacktestError::DataUnavailable {
                symbol: symbols[0].clone(),
            }
            .into());
        }

        self.transition(Phase::GeneratingPredictions);
        self.transition(Phase::Simulating);

        let mut account = Account::new(config.initial_capital);
        let mut simulator = TradeSimulator::new(&run_id, config.costs.clone());
        let mut equity_curve = Vec::with_capacity(bars.len());
        let symbol = symbols[0].as_str();

        for bar in &bars {
            self.check_cancelled()?;

            let signal = self.signal_or_hold(bar.timestamp, &bars, config.lookback_window, &mut simulator);
            if signal.action != SignalAction::Hold {
                simulator.execute_signal(&signal, bar.close, &mut account);
            }

            let prices = HashMap::from([(symbol.to_string(), bar.close)]);
            equity_curve.push(EquityPoint {
                timestamp: bar.timestamp,
                total_value: account.total_value(&prices),
                cash: account.cash,
                positions_value: account.positions_value(&prices),
            });
        }

        self.transition(Phase::Aggregating);
        let last_close = HashMap::from([(
            symbol.to_string(),
            bars.last().map(|bar| bar.close).unwrap_or(0.0),
        )]);
        Ok(self.aggregate(
            run_id,
            symbols,
            config.start,
            config.end,
            config.initial_capital,
            account,
            simulator,
            equity_curve,
            excluded,
            None,
            last_close,
        ))
    }

    fn run_portfolio_inner(&mut self, config: &PortfolioConfig) -> Result<BacktestResult> {
        // Fail fast: nothing is fetched until the configuration is sound.
        config.validate()?;
        let run_id = Uuid::new_v4().to_string();
        info!(
            "Starting portfolio backtest {} for [{}] ({} allocation, {} rebalance)",
            run_id,
            config.symbols.join(", "),
            config.allocation.label(),
            config.rebalance.label()
        );

        self.transition(Phase::LoadingData);
        let symbols: Vec<String> = config
            .symbols
            .iter()
            .map(|s| s.trim().to_uppercase())
            .collect();
        let (series, excluded) =
            self.load_series(&symbols, config.start, config.end, config.interval)?;

        let active: Vec<String> = symbols
            .iter()
            .filter(|symbol| series.contains_key(*symbol))
            .cloned()
            .collect();
        if active.is_empty() {
            return Err(BacktestError::DataUnavailable {
                symbol: symbols.join(", "),
            }
            .into());
        }
        if !excluded.is_empty() {
            warn!(
                "Proceeding with {}/{} symbols; excluded: {}",
                active.len(),
                symbols.len(),
                excluded
                    .iter()
                    .map(|e| e.symbol.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            // Declared weights cannot be honored once a symbol drops out,
            // and silently renormalizing them would misrepresent the run.
            if config.allocation == AllocationStrategy::Custom {
                return Err(BacktestError::InvalidConfiguration(format!(
                    "custom weights cannot be applied: no data for {}",
                    excluded
                        .iter()
                        .map(|e| e.symbol.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
                .into());
            }
        }

        self.transition(Phase::GeneratingPredictions);
        self.transition(Phase::Simulating);

        let engine = AllocationEngine::new(
            config.volatility_lookback,
            config.costs.minimum_trade_value,
        );
        let mut account = Account::new(config.initial_capital);
        let mut simulator = TradeSimulator::new(&run_id, config.costs.clone());

        // Union of every active symbol's trading days, walked in order.
        let timeline: BTreeSet<NaiveDateTime> = series
            .values()
            .flat_map(|bars| bars.iter().map(|bar| bar.timestamp))
            .collect();

        let mut last_close: HashMap<String, f64> = HashMap::new();
        // Closes dated strictly before the current timestep, per symbol.
        // Allocation weights are derived from these so sizing decisions
        // never see the bar being traded.
        let mut history: HashMap<String, Vec<f64>> = active
            .iter()
            .map(|symbol| (symbol.clone(), Vec::new()))
            .collect();
        let mut equity_curve = Vec::with_capacity(timeline.len());
        let mut current_target: Option<AllocationTarget> = None;
        let mut previous_date: Option<NaiveDate> = None;

        for &timestamp in &timeline {
            self.check_cancelled()?;

            let todays_bars: HashMap<&str, &PriceBar> = active
                .iter()
                .filter_map(|symbol| {
                    let bars = series.get(symbol)?;
                    let index = bars
                        .binary_search_by_key(&timestamp, |bar| bar.timestamp)
                        .ok()?;
                    Some((symbol.as_str(), &bars[index]))
                })
                .collect();
            for (symbol, bar) in &todays_bars {
                last_close.insert(symbol.to_string(), bar.close);
            }

            let rebalance_due = match previous_date {
                None => true, // initial allocation deploys the capital
                Some(previous) => {
                    crosses_rebalance_boundary(config.rebalance, previous, timestamp.date())
                }
            };
            if rebalance_due {
                let returns_by_symbol: HashMap<String, Vec<f64>> = history
                    .iter()
                    .map(|(symbol, closes)| (symbol.clone(), simple_returns(closes)))
                    .collect();
                let target = engine.compute_targets(
                    config.allocation,
                    &active,
                    &returns_by_symbol,
                    config.custom_weights.as_ref(),
                )?;
                let orders = engine.rebalance_orders(&target, &account, &last_close);
                if !orders.is_empty() {
                    info!(
                        "Rebalancing {} positions at {}",
                        orders.len(),
                        timestamp.date()
                    );
                }
                for order in orders {
                    let Some(price) = last_close.get(&order.symbol).copied() else {
                        continue;
                    };
                    simulator.execute_order(
                        timestamp,
                        &order.symbol,
                        order.side,
                        order.quantity,
                        price,
                        &mut account,
                    );
                }
                current_target = Some(target);
            }

            // Per-symbol signals, sized toward the allocation target so one
            // symbol cannot swallow the whole cash balance.
            for symbol in &active {
                let Some(bar) = todays_bars.get(symbol.as_str()) else {
                    continue;
                };
                let bars = &series[symbol];
                let signal =
                    self.signal_or_hold(timestamp, bars, config.lookback_window, &mut simulator);
                match signal.action {
                    SignalAction::Hold => {}
                    SignalAction::Sell => {
                        simulator.execute_signal(&signal, bar.close, &mut account);
                    }
                    SignalAction::Buy => {
                        let weight = current_target
                            .as_ref()
                            .map(|target| target.weight(symbol))
                            .unwrap_or(0.0);
                        let total = account.total_value(&last_close);
                        let current = account.position_quantity(symbol) * bar.close;
                        let shortfall = weight * total - current;
                        if shortfall > QUANTITY_EPSILON {
                            simulator.execute_order(
                                timestamp,
                                symbol,
                                TradeSide::Buy,
                                shortfall / bar.close,
                                bar.close,
                                &mut account,
                            );
                        }
                    }
                }
            }

            equity_curve.push(EquityPoint {
                timestamp,
                total_value: account.total_value(&last_close),
                cash: account.cash,
                positions_value: account.positions_value(&last_close),
            });

            for (symbol, bar) in &todays_bars {
                if let Some(closes) = history.get_mut(*symbol) {
                    closes.push(bar.close);
                }
            }
            previous_date = Some(timestamp.date());
        }

        self.transition(Phase::Aggregating);
        let weights = current_target
            .map(|target| target.weights)
            .unwrap_or_default();
        let returns_by_symbol: HashMap<String, Vec<f64>> = history
            .iter()
            .map(|(symbol, closes)| (symbol.clone(), simple_returns(closes)))
            .collect();
        let correlation = CorrelationAnalyzer::analyze(&active, &returns_by_symbol, &weights);

        Ok(self.aggregate(
            run_id,
            symbols,
            config.start,
            config.end,
            config.initial_capital,
            account,
            simulator,
            equity_curve,
            excluded,
            Some(correlation),
            last_close,
        ))
    }

    /// Asks the predictor for a signal; a predictor failure is contained as
    /// an implicit hold with an audit entry instead of aborting the run.
    fn signal_or_hold(
        &self,
        timestamp: NaiveDateTime,
        bars: &[PriceBar],
        lookback_window: usize,
        simulator: &mut TradeSimulator,
    ) -> Signal {
        let symbol = bars.first().map(|bar| bar.symbol.as_str()).unwrap_or("");
        match self.predictor.predict(timestamp, bars, lookback_window) {
            Ok(signal) => signal,
            Err(err) => {
                warn!(
                    "Predictor {} failed for {} at {}: {}",
                    self.predictor.name(),
                    symbol,
                    timestamp,
                    err
                );
                simulator.record_skip(
                    timestamp,
                    symbol,
                    SignalAction::Hold,
                    &BacktestError::PredictionFailure(err.to_string()).to_string(),
                );
                Signal::hold(timestamp, symbol, "predictor failure")
            }
        }
    }

    /// Loads every symbol's bars on a small worker pool. Per-symbol failures
    /// and empty series become exclusions; only a total absence of data is
    /// fatal to the caller.
    fn load_series(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
        interval: BarInterval,
    ) -> Result<(HashMap<String, Vec<PriceBar>>, Vec<ExcludedSymbol>)> {
        let workers = num_cpus::get().min(symbols.len()).max(1);
        let (task_tx, task_rx) = crossbeam_channel::bounded::<String>(symbols.len());
        let (result_tx, result_rx) =
            crossbeam_channel::bounded::<(String, Result<Vec<PriceBar>>)>(symbols.len());

        for symbol in symbols {
            task_tx.send(symbol.clone())?;
        }
        drop(task_tx);

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let data = Arc::clone(&self.data);
            handles.push(thread::spawn(move || {
                while let Ok(symbol) = task_rx.recv() {
                    let outcome = data.load(&symbol, start, end, interval);
                    if result_tx.send((symbol, outcome)).is_err() {
                        break;
                    }
                }
            }));
        }
        drop(result_tx);

        let mut series = HashMap::new();
        let mut excluded = Vec::new();
        while let Ok((symbol, outcome)) = result_rx.recv() {
            match outcome {
                Ok(bars) if bars.is_empty() => {
                    warn!("No historical data for {}; excluding from run", symbol);
                    excluded.push(ExcludedSymbol {
                        symbol,
                        reason: "no historical data available".to_string(),
                    });
                }
                Ok(bars) => {
                    info!("Loaded {} bars for {}", bars.len(), symbol);
                    series.insert(symbol, bars);
                }
                Err(err) => {
                    warn!("Failed to load {}: {}; excluding from run", symbol, err);
                    excluded.push(ExcludedSymbol {
                        symbol,
                        reason: err.to_string(),
                    });
                }
            }
        }
        for handle in handles {
            let _ = handle.join();
        }

        // Stable report order regardless of worker scheduling.
        excluded.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok((series, excluded))
    }

    #[allow(clippy::too_many_arguments)]
    fn aggregate(
        &self,
        run_id: String,
        symbols: Vec<String>,
        start: NaiveDate,
        end: NaiveDate,
        initial_capital: f64,
        account: Account,
        simulator: TradeSimulator,
        equity_curve: Vec<EquityPoint>,
        excluded: Vec<ExcludedSymbol>,
        correlation: Option<crate::models::CorrelationReport>,
        last_close: HashMap<String, f64>,
    ) -> BacktestResult {
        let (trades, skipped_trades) = simulator.into_ledger();
        let metrics = PerformanceCalculator::calculate(initial_capital, &equity_curve, &trades);
        let final_value = equity_curve
            .last()
            .map(|point| point.total_value)
            .unwrap_or(initial_capital);

        let mut per_symbol: Vec<SymbolBreakdown> = symbols
            .iter()
            .filter(|symbol| !excluded.iter().any(|e| &e.symbol == *symbol))
            .map(|symbol| {
                let symbol_trades: Vec<_> =
                    trades.iter().filter(|t| &t.symbol == symbol).collect();
                let final_quantity = account.position_quantity(symbol);
                let price = last_close
                    .get(symbol)
                    .copied()
                    .or_else(|| {
                        account
                            .positions
                            .get(symbol)
                            .map(|position| position.average_cost)
                    })
                    .unwrap_or(0.0);
                SymbolBreakdown {
                    symbol: symbol.clone(),
                    trades: symbol_trades.len() as i32,
                    realized_pnl: symbol_trades.iter().filter_map(|t| t.realized_pnl).sum(),
                    commission: symbol_trades.iter().map(|t| t.commission).sum(),
                    final_quantity,
                    final_value: final_quantity * price,
                }
            })
            .collect();
        per_symbol.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        info!(
            "Run {} finished: final value {:.2} ({:+.2}%), {} trades, {} skipped",
            run_id,
            final_value,
            metrics.total_return_percent,
            trades.len(),
            skipped_trades.len()
        );

        BacktestResult {
            id: run_id,
            symbols,
            start: start.and_hms_opt(0, 0, 0).expect("valid midnight"),
            end: end.and_hms_opt(0, 0, 0).expect("valid midnight"),
            initial_capital,
            final_value,
            metrics,
            equity_curve,
            trades,
            skipped_trades,
            excluded_symbols: excluded,
            per_symbol,
            correlation,
            created_at: crate::models::now_naive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CostModel, RebalanceFrequency};
    use crate::data::InMemoryDataProvider;
    use crate::prediction::MomentumPredictor;
    use chrono::Duration;
    use std::sync::atomic::AtomicUsize;

    fn daily_bars(symbol: &str, closes: &[f64]) -> Vec<PriceBar> {
        let base = NaiveDate::from_ymd_opt(2023, 1, 2)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, close)| PriceBar {
                symbol: symbol.to_string(),
                timestamp: base + Duration::days(i as i64),
                open: *close,
                high: *close * 1.01,
                low: *close * 0.99,
                close: *close,
                volume: 10_000.0,
            })
            .collect()
    }

    fn single_config(symbol: &str) -> BacktestConfig {
        BacktestConfig {
            symbol: symbol.to_string(),
            start: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2023, 12, 31).unwrap(),
            initial_capital: 10_000.0,
            predictor: "momentum".to_string(),
            predictor_params: HashMap::new(),
            lookback_window: 25,
            interval: BarInterval::Daily,
            costs: CostModel::default(),
        }
    }

    fn portfolio_config(symbols: &[&str]) -> PortfolioConfig {
        PortfolioConfig {
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            start: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2023, 12, 31).unwrap(),
            initial_capital: 100_000.0,
            allocation: AllocationStrategy::Equal,
            custom_weights: None,
            rebalance: RebalanceFrequency::Monthly,
            predictor: "momentum".to_string(),
            predictor_params: HashMap::new(),
            lookback_window: 25,
            volatility_lookback: 20,
            interval: BarInterval::Daily,
            costs: CostModel::default(),
        }
    }

    fn momentum() -> Box<dyn PredictionProvider> {
        Box::new(MomentumPredictor::new(HashMap::new()))
    }

    struct CountingProvider(AtomicUsize);

    struct FailingPredictor;

    impl PredictionProvider for FailingPredictor {
        fn name(&self) -> &str {
            "broken"
        }

        fn predict(
            &self,
            _timestamp: NaiveDateTime,
            _bars: &[PriceBar],
            _lookback_window: usize,
        ) -> Result<Signal> {
            Err(anyhow!("inference backend offline"))
        }
    }

    impl HistoricalDataProvider for CountingProvider {
        fn load(
            &self,
            _symbol: &str,
            _start: NaiveDate,
            _end: NaiveDate,
            _interval: BarInterval,
        ) -> Result<Vec<PriceBar>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    #[test]
    fn single_run_walks_every_bar() {
        let closes: Vec<f64> = (0..100).map(|i| 100.0 * 1.005f64.powi(i)).collect();
        let provider = InMemoryDataProvider::new(HashMap::from([(
            "AAA".to_string(),
            daily_bars("AAA", &closes),
        )]));
        let mut orchestrator = BacktestOrchestrator::new(Arc::new(provider), momentum());

        let result = orchestrator.run_single(&single_config("AAA")).unwrap();
        assert_eq!(orchestrator.phase(), Phase::Complete);
        assert_eq!(result.equity_curve.len(), 100);
        assert!(!result.trades.is_empty());
        assert!(result.correlation.is_none());
        assert_eq!(result.per_symbol.len(), 1);
    }

    #[test]
    fn missing_symbol_is_fatal_for_single_runs() {
        let provider = InMemoryDataProvider::new(HashMap::new());
        let mut orchestrator = BacktestOrchestrator::new(Arc::new(provider), momentum());

        let err = orchestrator.run_single(&single_config("GHOST")).unwrap_err();
        assert_eq!(orchestrator.phase(), Phase::Failed);
        assert!(matches!(
            err.downcast_ref::<BacktestError>(),
            Some(BacktestError::DataUnavailable { .. })
        ));
    }

    #[test]
    fn invalid_config_fails_before_any_fetch() {
        let provider = Arc::new(CountingProvider(AtomicUsize::new(0)));
        let mut orchestrator = BacktestOrchestrator::new(provider.clone(), momentum());

        let mut config = portfolio_config(&["AAA", "BBB"]);
        config.initial_capital = -5.0;
        assert!(orchestrator.run_portfolio(&config).is_err());
        assert_eq!(provider.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unknown_symbol_is_excluded_and_run_proceeds() {
        let closes: Vec<f64> = (0..80).map(|i| 100.0 + i as f64 * 0.3).collect();
        let provider = InMemoryDataProvider::new(HashMap::from([
            ("AAA".to_string(), daily_bars("AAA", &closes)),
            ("BBB".to_string(), daily_bars("BBB", &closes)),
        ]));
        let mut orchestrator = BacktestOrchestrator::new(Arc::new(provider), momentum());

        let result = orchestrator
            .run_portfolio(&portfolio_config(&["AAA", "BBB", "GHOST"]))
            .unwrap();
        assert_eq!(result.excluded_symbols.len(), 1);
        assert_eq!(result.excluded_symbols[0].symbol, "GHOST");
        assert_eq!(result.per_symbol.len(), 2);
        assert!(!result.equity_curve.is_empty());
    }

    #[test]
    fn all_symbols_missing_is_fatal() {
        let provider = InMemoryDataProvider::new(HashMap::new());
        let mut orchestrator = BacktestOrchestrator::new(Arc::new(provider), momentum());

        let err = orchestrator
            .run_portfolio(&portfolio_config(&["AAA", "BBB"]))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BacktestError>(),
            Some(BacktestError::DataUnavailable { .. })
        ));
    }

    #[test]
    fn predictor_failures_become_recorded_holds() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        let provider = InMemoryDataProvider::new(HashMap::from([(
            "AAA".to_string(),
            daily_bars("AAA", &closes),
        )]));
        let mut orchestrator =
            BacktestOrchestrator::new(Arc::new(provider), Box::new(FailingPredictor));

        let result = orchestrator.run_single(&single_config("AAA")).unwrap();
        assert_eq!(orchestrator.phase(), Phase::Complete);
        assert!(result.trades.is_empty());
        assert_eq!(result.skipped_trades.len(), 40);
        assert!(result.skipped_trades[0]
            .reason
            .contains("prediction provider failed"));
        // The account never moves when every signal degrades to a hold.
        assert!((result.final_value - 10_000.0).abs() < 1e-9);
    }

    #[test]
    fn cancellation_stops_the_run() {
        let closes: Vec<f64> = (0..50).map(|i| 100.0 + i as f64).collect();
        let provider = InMemoryDataProvider::new(HashMap::from([(
            "AAA".to_string(),
            daily_bars("AAA", &closes),
        )]));
        let mut orchestrator = BacktestOrchestrator::new(Arc::new(provider), momentum());
        orchestrator.cancel_flag().store(true, Ordering::Relaxed);

        let err = orchestrator.run_single(&single_config("AAA")).unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        assert_eq!(orchestrator.phase(), Phase::Failed);
    }

    #[test]
    fn initial_allocation_deploys_capital_even_without_signals() {
        // Flat prices keep the momentum predictor in its dead zone, so every
        // position comes from the initial allocation alone.
        let provider = InMemoryDataProvider::new(HashMap::from([
            ("AAA".to_string(), daily_bars("AAA", &[100.0; 60])),
            ("BBB".to_string(), daily_bars("BBB", &[50.0; 60])),
        ]));
        let mut orchestrator = BacktestOrchestrator::new(Arc::new(provider), momentum());

        let mut config = portfolio_config(&["AAA", "BBB"]);
        config.rebalance = RebalanceFrequency::Never;
        let result = orchestrator.run_portfolio(&config).unwrap();

        assert_eq!(result.trades.len(), 2);
        assert!(result.trades.iter().all(|t| t.side == TradeSide::Buy));
        let invested: f64 = result
            .per_symbol
            .iter()
            .map(|breakdown| breakdown.final_value)
            .sum();
        assert!(invested > 90_000.0);
    }

    #[test]
    fn custom_allocation_with_excluded_symbol_fails() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64 * 0.1).collect();
        let provider = InMemoryDataProvider::new(HashMap::from([
            ("AAA".to_string(), daily_bars("AAA", &closes)),
            ("BBB".to_string(), daily_bars("BBB", &closes)),
        ]));
        let mut orchestrator = BacktestOrchestrator::new(Arc::new(provider), momentum());

        let mut config = portfolio_config(&["AAA", "BBB", "GHOST"]);
        config.allocation = AllocationStrategy::Custom;
        config.custom_weights = Some(HashMap::from([
            ("AAA".to_string(), 0.4),
            ("BBB".to_string(), 0.3),
            ("GHOST".to_string(), 0.3),
        ]));
        assert!(orchestrator.run_portfolio(&config).is_err());
    }
}
