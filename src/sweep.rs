use crate::config::BacktestConfig;
use crate::data::HistoricalDataProvider;
use crate::models::PerformanceMetrics;
use crate::orchestrator::BacktestOrchestrator;
use crate::prediction::create_predictor;
use anyhow::{anyhow, Result};
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

/// One completed sweep variant with the parameters that produced it.
#[derive(Debug, Clone)]
pub struct SweepRun {
    pub parameters: HashMap<String, f64>,
    pub final_value: f64,
    pub metrics: PerformanceMetrics,
}

/// Runs the same backtest across many predictor parameter sets in parallel
/// and ranks the outcomes. Each variant gets its own predictor, simulator
/// and account so runs cannot leak state into each other.
pub fn run_sweep(
    data: Arc<dyn HistoricalDataProvider>,
    config: &BacktestConfig,
    variants: Vec<HashMap<String, f64>>,
) -> Result<Vec<SweepRun>> {
    if variants.is_empty() {
        return Err(anyhow!("sweep needs at least one parameter variant"));
    }
    config.validate()?;

    let workers = num_cpus::get().min(variants.len()).max(1);
    info!(
        "Sweeping {} variants of {} on {} workers",
        variants.len(),
        config.predictor,
        workers
    );

    let (task_tx, task_rx) = crossbeam_channel::bounded::<HashMap<String, f64>>(variants.len());
    let (result_tx, result_rx) =
        crossbeam_channel::bounded::<(HashMap<String, f64>, Result<SweepRun>)>(variants.len());

    for variant in variants {
        task_tx.send(variant)?;
    }
    drop(task_tx);

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let task_rx = task_rx.clone();
        let result_tx = result_tx.clone();
        let data = Arc::clone(&data);
        let config = config.clone();
        handles.push(thread::spawn(move || {
            while let Ok(parameters) = task_rx.recv() {
                let outcome = run_variant(&data, &config, &parameters);
                if result_tx.send((parameters, outcome)).is_err() {
                    break;
                }
            }
        }));
    }
    drop(result_tx);

    let mut runs = Vec::new();
    let mut failures = 0usize;
    while let Ok((parameters, outcome)) = result_rx.recv() {
        match outcome {
            Ok(run) => runs.push(run),
            Err(err) => {
                warn!("Sweep variant {:?} failed: {}", parameters, err);
                failures += 1;
            }
        }
    }
    for handle in handles {
        let _ = handle.join();
    }

    if runs.is_empty() {
        return Err(anyhow!("all {} sweep variants failed", failures));
    }

    // Best risk-adjusted performance first; ties broken by final value.
    runs.sort_by(|a, b| {
        b.metrics
            .sharpe_ratio
            .partial_cmp(&a.metrics.sharpe_ratio)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                b.final_value
                    .partial_cmp(&a.final_value)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
    });
    Ok(runs)
}

fn run_variant(
    data: &Arc<dyn HistoricalDataProvider>,
    config: &BacktestConfig,
    parameters: &HashMap<String, f64>,
) -> Result<SweepRun> {
    let mut variant_config = config.clone();
    variant_config.predictor_params = parameters.clone();

    let predictor = create_predictor(&variant_config.predictor, parameters.clone())?;
    let mut orchestrator = BacktestOrchestrator::new(Arc::clone(data), predictor);
    let result = orchestrator.run_single(&variant_config)?;

    Ok(SweepRun {
        parameters: parameters.clone(),
        final_value: result.final_value,
        metrics: result.metrics,
    })
}

/// Expands a single numeric parameter over inclusive `start..=end` in fixed
/// steps, merged over the base parameter map.
pub fn linear_variants(
    base: &HashMap<String, f64>,
    key: &str,
    start: f64,
    end: f64,
    step: f64,
) -> Result<Vec<HashMap<String, f64>>> {
    if !(step.is_finite() && step > 0.0) || !start.is_finite() || !end.is_finite() || end < start {
        return Err(anyhow!(
            "invalid sweep range {}..{} step {}",
            start,
            end,
            step
        ));
    }
    let mut variants = Vec::new();
    let mut value = start;
    while value <= end + step * 1e-9 {
        let mut parameters = base.clone();
        parameters.insert(key.to_string(), value);
        variants.push(parameters);
        value += step;
    }
    Ok(variants)
}
