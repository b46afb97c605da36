use anyhow::{anyhow, Context, Result};
use backtester::cache::FileBarCache;
use backtester::config::{
    AllocationStrategy, BacktestConfig, BarInterval, CostModel, PortfolioConfig,
    RebalanceFrequency,
};
use backtester::data::{CsvDataProvider, HistoricalDataProvider};
use backtester::http::HttpBarProvider;
use backtester::orchestrator::BacktestOrchestrator;
use backtester::prediction::create_predictor;
use backtester::sweep::{linear_variants, run_sweep};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use log::info;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "backtester")]
#[command(about = "Walk-forward backtesting for single stocks and portfolios")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct DataArgs {
    /// Directory of per-symbol CSV files (<SYMBOL>.csv)
    #[arg(long, value_name = "DIR", default_value = "./data")]
    data_dir: PathBuf,
    /// Fetch bars from this HTTP endpoint instead of local CSV files
    #[arg(long, value_name = "URL")]
    base_url: Option<String>,
    /// Cache fetched bars under this directory
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,
}

#[derive(Args)]
struct RunArgs {
    /// Start date (YYYY-MM-DD)
    #[arg(long)]
    start: String,
    /// End date (YYYY-MM-DD)
    #[arg(long)]
    end: String,
    /// Starting cash balance
    #[arg(long, default_value_t = 10_000.0)]
    capital: f64,
    /// Predictor to drive signals (technical or momentum)
    #[arg(long, default_value = "technical")]
    predictor: String,
    /// Predictor parameters as key=value pairs
    #[arg(long = "param", value_name = "KEY=VALUE")]
    params: Vec<String>,
    /// Minimum bars of history before the predictor may act
    #[arg(long, default_value_t = 30)]
    lookback: usize,
    /// Bar interval (1d or 1wk)
    #[arg(long, default_value = "1d")]
    interval: String,
    /// Commission as a fraction of notional
    #[arg(long, default_value_t = 0.001)]
    commission: f64,
    /// Slippage as a fraction of price
    #[arg(long, default_value_t = 0.0005)]
    slippage: f64,
    /// Write the JSON report here instead of stdout
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Backtest a single symbol
    Backtest {
        /// Ticker symbol to test
        symbol: String,
        #[command(flatten)]
        run: RunArgs,
        #[command(flatten)]
        data: DataArgs,
    },
    /// Backtest a multi-symbol portfolio with periodic rebalancing
    Portfolio {
        /// Comma separated ticker symbols (2 to 10)
        #[arg(value_delimiter = ',', num_args = 1..)]
        symbols: Vec<String>,
        /// Allocation strategy (equal, risk_parity or custom)
        #[arg(long, default_value = "equal")]
        allocation: String,
        /// Custom weights as SYMBOL=WEIGHT pairs, must sum to 1
        #[arg(long = "weight", value_name = "SYMBOL=WEIGHT")]
        weights: Vec<String>,
        /// Rebalance cadence (never, weekly, monthly or quarterly)
        #[arg(long, default_value = "monthly")]
        rebalance: String,
        /// Trailing daily-return window for risk parity weights
        #[arg(long, default_value_t = 20)]
        volatility_lookback: usize,
        #[command(flatten)]
        run: RunArgs,
        #[command(flatten)]
        data: DataArgs,
    },
    /// Sweep one predictor parameter over a range and rank the outcomes
    Sweep {
        /// Ticker symbol to test
        symbol: String,
        /// Parameter to sweep
        #[arg(long)]
        key: String,
        /// Inclusive range start
        #[arg(long)]
        from: f64,
        /// Inclusive range end
        #[arg(long)]
        to: f64,
        /// Step between variants
        #[arg(long, default_value_t = 1.0)]
        step: f64,
        #[command(flatten)]
        run: RunArgs,
        #[command(flatten)]
        data: DataArgs,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    info!("Starting backtester. Not financial advice. Use at your own risk.");

    match cli.command {
        Commands::Backtest { symbol, run, data } => {
            let config = BacktestConfig {
                symbol,
                start: parse_date(&run.start)?,
                end: parse_date(&run.end)?,
                initial_capital: run.capital,
                predictor: run.predictor.clone(),
                predictor_params: parse_params(&run.params)?,
                lookback_window: run.lookback,
                interval: BarInterval::parse(&run.interval)?,
                costs: costs_from(&run),
            };
            let provider = build_provider(&data)?;
            let predictor =
                create_predictor(&config.predictor, config.predictor_params.clone())?;
            let mut orchestrator = BacktestOrchestrator::new(provider, predictor);
            let result = orchestrator.run_single(&config)?;
            emit(&result, run.output.as_deref())?;
        }
        Commands::Portfolio {
            symbols,
            allocation,
            weights,
            rebalance,
            volatility_lookback,
            run,
            data,
        } => {
            let custom_weights = if weights.is_empty() {
                None
            } else {
                Some(parse_params(&weights)?)
            };
            let config = PortfolioConfig {
                symbols,
                start: parse_date(&run.start)?,
                end: parse_date(&run.end)?,
                initial_capital: run.capital,
                allocation: AllocationStrategy::parse(&allocation)?,
                custom_weights,
                rebalance: RebalanceFrequency::parse(&rebalance)?,
                predictor: run.predictor.clone(),
                predictor_params: parse_params(&run.params)?,
                lookback_window: run.lookback,
                volatility_lookback,
                interval: BarInterval::parse(&run.interval)?,
                costs: costs_from(&run),
            };
            let provider = build_provider(&data)?;
            let predictor =
                create_predictor(&config.predictor, config.predictor_params.clone())?;
            let mut orchestrator = BacktestOrchestrator::new(provider, predictor);
            let result = orchestrator.run_portfolio(&config)?;
            emit(&result, run.output.as_deref())?;
        }
        Commands::Sweep {
            symbol,
            key,
            from,
            to,
            step,
            run,
            data,
        } => {
            let base = parse_params(&run.params)?;
            let config = BacktestConfig {
                symbol,
                start: parse_date(&run.start)?,
                end: parse_date(&run.end)?,
                initial_capital: run.capital,
                predictor: run.predictor.clone(),
                predictor_params: base.clone(),
                lookback_window: run.lookback,
                interval: BarInterval::parse(&run.interval)?,
                costs: costs_from(&run),
            };
            let provider = build_provider(&data)?;
            let variants = linear_variants(&base, &key, from, to, step)?;
            let runs = run_sweep(provider, &config, variants)?;

            let report: Vec<SweepReportRow> = runs
                .iter()
                .map(|sweep_run| SweepReportRow {
                    parameters: sweep_run.parameters.clone(),
                    final_value: sweep_run.final_value,
                    total_return_percent: sweep_run.metrics.total_return_percent,
                    sharpe_ratio: sweep_run.metrics.sharpe_ratio,
                    max_drawdown_percent: sweep_run.metrics.max_drawdown_percent,
                    total_trades: sweep_run.metrics.total_trades,
                })
                .collect();
            emit(&report, run.output.as_deref())?;
        }
    }

    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SweepReportRow {
    parameters: HashMap<String, f64>,
    final_value: f64,
    total_return_percent: f64,
    sharpe_ratio: f64,
    max_drawdown_percent: f64,
    total_trades: i32,
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{}' (expected YYYY-MM-DD)", raw))
}

fn parse_params(pairs: &[String]) -> Result<HashMap<String, f64>> {
    let mut params = HashMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("Expected KEY=VALUE, got '{}'", pair))?;
        let value: f64 = value
            .trim()
            .parse()
            .with_context(|| format!("Non-numeric value in '{}'", pair))?;
        params.insert(key.trim().to_string(), value);
    }
    Ok(params)
}

fn costs_from(run: &RunArgs) -> CostModel {
    CostModel {
        commission_rate: run.commission,
        slippage_rate: run.slippage,
        ..CostModel::default()
    }
}

fn build_provider(data: &DataArgs) -> Result<Arc<dyn HistoricalDataProvider>> {
    match (&data.base_url, &data.cache_dir) {
        (Some(base_url), Some(cache_dir)) => {
            let cache = FileBarCache::new(cache_dir)?;
            Ok(Arc::new(backtester::cache::CachedProvider::new(
                HttpBarProvider::new(base_url)?,
                cache,
            )))
        }
        (Some(base_url), None) => Ok(Arc::new(HttpBarProvider::new(base_url)?)),
        (None, Some(cache_dir)) => {
            let cache = FileBarCache::new(cache_dir)?;
            Ok(Arc::new(backtester::cache::CachedProvider::new(
                CsvDataProvider::new(&data.data_dir),
                cache,
            )))
        }
        (None, None) => Ok(Arc::new(CsvDataProvider::new(&data.data_dir))),
    }
}

fn emit<T: Serialize>(value: &T, output: Option<&std::path::Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => {
            fs::write(path, json)
                .with_context(|| format!("Failed to write report to {}", path.display()))?;
            info!("Report written to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}
