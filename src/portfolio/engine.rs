//! # Portfolio Engine
//!
//! $$
//! P \;\longrightarrow\; (\mu,\Sigma) \;\longrightarrow\; \{\mathbf w^\*_{\text{MC}},\ \mathbf w^\*_{\text{SLSQP}}\}
//! $$
//!
//! High-level orchestration: statistics are estimated once per price matrix,
//! the configured strategies run in order and their results come back as one
//! ordered list.

use std::collections::BTreeMap;
use std::collections::HashSet;

use impl_new_derive::ImplNew;
use rayon::prelude::*;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;

use super::data::DAILY_ANNUALIZATION;
use super::data::PriceMatrix;
use super::data::ReturnsStatistics;
use super::monte_carlo::DEFAULT_TRIALS;
use super::monte_carlo::MonteCarloSampler;
use super::monte_carlo::SimplexSampling;
use super::monte_carlo::SimulationPopulation;
use super::monte_carlo::select;
use super::optimizers::AllocationStrategy;
use super::optimizers::ConstrainedObjective;
use super::optimizers::ConstrainedOptimizer;
use super::slsqp::DEFAULT_FTOL;
use super::slsqp::DEFAULT_MAX_ITERS;
use super::types::BoundSet;
use super::types::OptimizationResult;
use crate::error::OptimizationError;
use crate::error::Result;
use crate::store::ResultStore;

/// Strategies the engine knows how to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
  /// Random sampling; yields a max-Sharpe and a min-volatility result.
  MonteCarlo,
  /// Constrained gradient solve; yields one result.
  Slsqp,
}

/// Runtime configuration for [`PortfolioEngine`].
#[derive(Clone, Debug)]
pub struct PortfolioEngineConfig {
  /// Return periods per year.
  pub annualization_factor: f64,
  /// Monte Carlo trial count.
  pub trials: usize,
  /// Base seed; `None` seeds from the OS on every run.
  pub seed: Option<u64>,
  pub sampling: SimplexSampling,
  /// Per-symbol `(min, max)` weights. Symbols not listed get `(0, 1)`.
  pub bounds: BTreeMap<String, (f64, f64)>,
  /// SLSQP iteration cap.
  pub max_iterations: u64,
  /// SLSQP objective tolerance.
  pub ftol: f64,
  /// Risk-free rate subtracted in the Sharpe ratio.
  pub risk_free: f64,
  pub objective: ConstrainedObjective,
  /// Strategies to run, in output order.
  pub strategies: Vec<StrategyKind>,
}

impl Default for PortfolioEngineConfig {
  fn default() -> Self {
    Self {
      annualization_factor: DAILY_ANNUALIZATION,
      trials: DEFAULT_TRIALS,
      seed: None,
      sampling: SimplexSampling::default(),
      bounds: BTreeMap::new(),
      max_iterations: DEFAULT_MAX_ITERS,
      ftol: DEFAULT_FTOL,
      risk_free: 0.0,
      objective: ConstrainedObjective::default(),
      strategies: vec![StrategyKind::MonteCarlo, StrategyKind::Slsqp],
    }
  }
}

/// One portfolio of a batch.
#[derive(ImplNew, Clone, Debug)]
pub struct PortfolioRequest {
  pub id: String,
  pub prices: PriceMatrix,
}

/// Everything a single run produced.
#[derive(Clone, Debug)]
pub struct EngineRun {
  pub statistics: ReturnsStatistics,
  /// Present when the Monte Carlo strategy ran.
  pub population: Option<SimulationPopulation>,
  pub results: Vec<OptimizationResult>,
}

/// Single entry point tying statistics and strategies together for one asset universe.
#[derive(Clone, Debug)]
pub struct PortfolioEngine {
  symbols: Vec<String>,
  bounds: BoundSet,
  config: PortfolioEngineConfig,
}

impl PortfolioEngine {
  /// Construct an engine for an ordered, duplicate-free asset list.
  ///
  /// Bounds and the remaining configuration are validated here, before any
  /// data is touched.
  pub fn new(symbols: Vec<String>, config: PortfolioEngineConfig) -> Result<Self> {
    if symbols.is_empty() {
      return Err(OptimizationError::InvalidConfig(
        "asset list must not be empty".to_string(),
      ));
    }
    let mut seen = HashSet::new();
    if let Some(dup) = symbols.iter().find(|s| !seen.insert(s.as_str())) {
      return Err(OptimizationError::InvalidConfig(format!(
        "asset {dup} listed twice"
      )));
    }
    if config.strategies.is_empty() {
      return Err(OptimizationError::InvalidConfig(
        "at least one strategy is required".to_string(),
      ));
    }
    if !(config.annualization_factor.is_finite() && config.annualization_factor > 0.0) {
      return Err(OptimizationError::InvalidConfig(format!(
        "annualization factor must be finite and positive, got {}",
        config.annualization_factor
      )));
    }
    if config.strategies.contains(&StrategyKind::MonteCarlo) && config.trials == 0 {
      return Err(OptimizationError::InvalidConfig(
        "trial count must be positive".to_string(),
      ));
    }
    if config.strategies.contains(&StrategyKind::Slsqp) && config.max_iterations == 0 {
      return Err(OptimizationError::InvalidConfig(
        "iteration cap must be positive".to_string(),
      ));
    }

    let bounds = BoundSet::from_pairs(&symbols, &config.bounds)?;
    Ok(Self {
      symbols,
      bounds,
      config,
    })
  }

  /// Borrow engine configuration.
  pub fn config(&self) -> &PortfolioEngineConfig {
    &self.config
  }

  /// Asset universe, in weight order.
  pub fn symbols(&self) -> &[String] {
    &self.symbols
  }

  /// Resolved per-asset bounds.
  pub fn bounds(&self) -> &BoundSet {
    &self.bounds
  }

  /// Annualized statistics of `prices`, after checking its columns match the asset list.
  pub fn statistics(&self, prices: &PriceMatrix) -> Result<ReturnsStatistics> {
    if prices.symbols() != self.symbols.as_slice() {
      return Err(OptimizationError::AssetMismatch {
        expected: self.symbols.clone(),
        actual: prices.symbols().to_vec(),
      });
    }
    let stats = ReturnsStatistics::from_prices(prices, self.config.annualization_factor)?;
    info!(
      assets = stats.n_assets(),
      observations = stats.observations(),
      "return statistics estimated"
    );
    Ok(stats)
  }

  /// Run every configured strategy and return their results in order.
  pub fn run(&self, prices: &PriceMatrix) -> Result<Vec<OptimizationResult>> {
    Ok(self.run_detailed(prices)?.results)
  }

  /// Same as [`PortfolioEngine::run`], also returning statistics and the sampled population.
  pub fn run_detailed(&self, prices: &PriceMatrix) -> Result<EngineRun> {
    self.run_seeded(prices, self.config.seed)
  }

  /// Run and hand each result to `store`, once per result.
  ///
  /// Nothing is saved when any strategy fails.
  pub fn run_and_persist(
    &self,
    portfolio_id: &str,
    prices: &PriceMatrix,
    store: &mut dyn ResultStore,
  ) -> anyhow::Result<Vec<OptimizationResult>> {
    let results = self.run(prices)?;
    persist_results(portfolio_id, &results, store)?;
    Ok(results)
  }

  /// Run independent requests in parallel.
  ///
  /// With a base seed, request `i` samples with `seed + i` so each gets its
  /// own random stream. Output order follows `requests`.
  pub fn run_many(&self, requests: &[PortfolioRequest]) -> Vec<(String, Result<Vec<OptimizationResult>>)> {
    requests
      .par_iter()
      .enumerate()
      .map(|(i, request)| {
        let seed = self.config.seed.map(|s| s.wrapping_add(i as u64));
        let outcome = self
          .run_seeded(&request.prices, seed)
          .map(|run| run.results);
        (request.id.clone(), outcome)
      })
      .collect()
  }

  fn run_seeded(&self, prices: &PriceMatrix, seed: Option<u64>) -> Result<EngineRun> {
    let statistics = self.statistics(prices)?;
    let mut population = None;
    let mut results = Vec::new();

    for kind in &self.config.strategies {
      match kind {
        StrategyKind::MonteCarlo => {
          // sampled directly so the population survives for the frontier chart
          let sampler = self.sampler(seed)?;
          let sampled = sampler.sample(&statistics)?;
          results.extend(finished(&sampler, select(&sampled)?));
          population = Some(sampled);
        }
        StrategyKind::Slsqp => {
          let optimizer = self.optimizer()?;
          let allocated = optimizer.allocate(&statistics)?;
          results.extend(finished(&optimizer, allocated));
        }
      }
    }

    Ok(EngineRun {
      statistics,
      population,
      results,
    })
  }

  fn sampler(&self, seed: Option<u64>) -> Result<MonteCarloSampler> {
    let sampler = MonteCarloSampler::new(self.config.trials, seed)?
      .with_sampling(self.config.sampling)
      .with_risk_free(self.config.risk_free);
    if self.config.bounds.is_empty() {
      Ok(sampler)
    } else {
      Ok(sampler.with_bounds(self.bounds.clone()))
    }
  }

  fn optimizer(&self) -> Result<ConstrainedOptimizer> {
    Ok(
      ConstrainedOptimizer::with_bound_set(&self.symbols, self.bounds.clone())?
        .with_objective(self.config.objective)
        .with_risk_free(self.config.risk_free)
        .with_max_iters(self.config.max_iterations)
        .with_ftol(self.config.ftol),
    )
  }
}

/// Save each result under `portfolio_id`, in order.
pub fn persist_results(
  portfolio_id: &str,
  results: &[OptimizationResult],
  store: &mut dyn ResultStore,
) -> anyhow::Result<()> {
  for result in results {
    store.save(portfolio_id, result)?;
  }
  info!(portfolio_id, saved = results.len(), "results persisted");
  Ok(())
}

fn finished(strategy: &dyn AllocationStrategy, results: Vec<OptimizationResult>) -> Vec<OptimizationResult> {
  info!(strategy = strategy.name(), results = results.len(), "strategy finished");
  results
}

#[cfg(test)]
mod tests {
  use chrono::NaiveDate;
  use rand::Rng;
  use rand::SeedableRng;
  use rand::rngs::StdRng;
  use tracing_test::traced_test;

  use super::*;
  use crate::portfolio::types::BUDGET_TOLERANCE;
  use crate::portfolio::types::OptimizerMethod;
  use crate::store::InMemoryStore;

  fn symbols(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
  }

  /// Geometric random walks with per-asset drift and volatility.
  fn random_walk(names: &[&str], rows: usize, seed: u64) -> PriceMatrix {
    let mut rng = StdRng::seed_from_u64(seed);
    let start = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
    let dates = (0..rows)
      .map(|i| start + chrono::Duration::days(i as i64))
      .collect();

    let columns = names
      .iter()
      .enumerate()
      .map(|(j, name)| {
        let drift = 0.0002 * (j as f64 + 1.0);
        let scale = 0.01 * (j as f64 + 1.0);
        let mut closes = Vec::with_capacity(rows);
        let mut p = 100.0;
        for _ in 0..rows {
          closes.push(p);
          p *= (drift + scale * (rng.random::<f64>() - 0.5)).exp();
        }
        (name.to_string(), closes)
      })
      .collect();

    PriceMatrix::from_columns(dates, columns).unwrap()
  }

  fn seeded_config() -> PortfolioEngineConfig {
    PortfolioEngineConfig {
      trials: 2_000,
      seed: Some(7),
      ..PortfolioEngineConfig::default()
    }
  }

  #[test]
  fn results_follow_strategy_order() {
    let engine = PortfolioEngine::new(symbols(&["A", "B", "C"]), seeded_config()).unwrap();
    let results = engine.run(&random_walk(&["A", "B", "C"], 300, 1)).unwrap();

    let methods: Vec<_> = results.iter().map(|r| r.method).collect();
    assert_eq!(
      methods,
      vec![
        OptimizerMethod::MonteCarloMaxSharpe,
        OptimizerMethod::MonteCarloMinVolatility,
        OptimizerMethod::SlsqpMaxSharpe,
      ]
    );
    for r in &results {
      assert_eq!(r.weights.len(), 3);
      assert!(engine.bounds().admits(&r.weights, BUDGET_TOLERANCE));
    }
  }

  #[test]
  fn both_strategies_honor_bounds() {
    let mut config = seeded_config();
    config.bounds.insert("C".to_string(), (0.05, 0.2));
    let engine = PortfolioEngine::new(symbols(&["A", "B", "C"]), config).unwrap();
    let run = engine.run_detailed(&random_walk(&["A", "B", "C"], 300, 2)).unwrap();

    assert!(run.population.as_ref().is_some_and(|p| p.len() == 2_000));
    for r in &run.results {
      assert!(engine.bounds().admits(&r.weights, BUDGET_TOLERANCE), "{r:?}");
    }
  }

  #[test]
  fn narrow_bound_does_not_starve_the_sampler() {
    let names = ["S0", "S1", "S2", "S3", "S4", "S5", "S6", "S7", "S8", "S9"];
    let mut config = PortfolioEngineConfig {
      seed: Some(1),
      ..PortfolioEngineConfig::default()
    };
    config.bounds.insert("S0".to_string(), (0.6, 0.7));
    let engine = PortfolioEngine::new(symbols(&names), config).unwrap();
    let run = engine.run_detailed(&random_walk(&names, 300, 12)).unwrap();

    assert!(run.population.as_ref().is_some_and(|p| p.len() == 10_000));
    let methods: Vec<_> = run.results.iter().map(|r| r.method).collect();
    assert_eq!(
      methods,
      vec![
        OptimizerMethod::MonteCarloMaxSharpe,
        OptimizerMethod::MonteCarloMinVolatility,
        OptimizerMethod::SlsqpMaxSharpe,
      ]
    );
    for r in &run.results {
      assert!(engine.bounds().admits(&r.weights, BUDGET_TOLERANCE), "{r:?}");
      assert!(r.weights[0] >= 0.6 - BUDGET_TOLERANCE);
    }
  }

  #[test]
  fn unknown_bound_symbol_fails_at_construction() {
    let mut config = seeded_config();
    config.bounds.insert("ZZZ".to_string(), (0.0, 0.3));
    let err = PortfolioEngine::new(symbols(&["A", "B", "C"]), config).unwrap_err();
    assert!(matches!(err, OptimizationError::InvalidBound(_)));
  }

  #[test]
  fn duplicate_symbols_are_rejected() {
    let err = PortfolioEngine::new(symbols(&["A", "A"]), seeded_config()).unwrap_err();
    assert!(matches!(err, OptimizationError::InvalidConfig(_)));
  }

  #[test]
  fn mismatched_price_columns_are_rejected() {
    let engine = PortfolioEngine::new(symbols(&["A", "B"]), seeded_config()).unwrap();
    let err = engine.run(&random_walk(&["B", "A"], 50, 3)).unwrap_err();
    assert!(matches!(err, OptimizationError::AssetMismatch { .. }));
  }

  #[test]
  fn two_price_rows_stop_before_any_strategy() {
    let engine = PortfolioEngine::new(symbols(&["A", "B"]), seeded_config()).unwrap();
    let err = engine.run_detailed(&random_walk(&["A", "B"], 2, 4)).unwrap_err();
    assert_eq!(err, OptimizationError::InsufficientData { valid_rows: 1 });
  }

  #[test]
  fn constant_prices_fail_the_solver_but_not_the_sampler() {
    let dates: Vec<NaiveDate> = (1..=10)
      .map(|d| NaiveDate::from_ymd_opt(2024, 3, d).unwrap())
      .collect();
    let prices = PriceMatrix::from_columns(
      dates,
      vec![("A".to_string(), vec![10.0; 10]), ("B".to_string(), vec![20.0; 10])],
    )
    .unwrap();

    let sampling_only = PortfolioEngine::new(
      symbols(&["A", "B"]),
      PortfolioEngineConfig {
        strategies: vec![StrategyKind::MonteCarlo],
        ..seeded_config()
      },
    )
    .unwrap();
    let results = sampling_only.run(&prices).unwrap();
    assert!(results.iter().all(|r| r.volatility == 0.0 && r.sharpe.is_none()));

    let with_solver = PortfolioEngine::new(symbols(&["A", "B"]), seeded_config()).unwrap();
    let err = with_solver.run(&prices).unwrap_err();
    assert!(matches!(err, OptimizationError::OptimizationFailed(_)));
  }

  #[test]
  fn persisting_saves_each_result_once() {
    let engine = PortfolioEngine::new(symbols(&["A", "B", "C"]), seeded_config()).unwrap();
    let mut store = InMemoryStore::new();
    let results = engine
      .run_and_persist("client-42", &random_walk(&["A", "B", "C"], 200, 5), &mut store)
      .unwrap();

    assert_eq!(store.records().len(), results.len());
    for (record, result) in store.records().iter().zip(&results) {
      assert_eq!(record.portfolio_id, "client-42");
      assert_eq!(&record.to_result(), result);
    }
  }

  #[test]
  fn failed_run_persists_nothing() {
    let engine = PortfolioEngine::new(
      symbols(&["A", "B", "C"]),
      PortfolioEngineConfig {
        max_iterations: 1,
        ..seeded_config()
      },
    )
    .unwrap();
    let mut store = InMemoryStore::new();
    let outcome = engine.run_and_persist("p", &random_walk(&["A", "B", "C"], 200, 6), &mut store);

    assert!(outcome.is_err());
    assert!(store.records().is_empty());
  }

  #[test]
  fn batch_runs_match_sequential_runs() {
    let engine = PortfolioEngine::new(
      symbols(&["A", "B"]),
      PortfolioEngineConfig {
        strategies: vec![StrategyKind::MonteCarlo],
        ..seeded_config()
      },
    )
    .unwrap();
    let requests: Vec<PortfolioRequest> = (0..4)
      .map(|i| PortfolioRequest::new(format!("p{i}"), random_walk(&["A", "B"], 120, 10 + i)))
      .collect();

    let batch = engine.run_many(&requests);
    assert_eq!(batch.len(), 4);
    for (i, (id, outcome)) in batch.iter().enumerate() {
      assert_eq!(id, &format!("p{i}"));
      let expected = engine
        .run_seeded(&requests[i].prices, Some(7 + i as u64))
        .unwrap()
        .results;
      assert_eq!(outcome.as_ref().unwrap(), &expected);
    }
  }

  #[test]
  #[traced_test]
  fn run_logs_strategy_progress() {
    let engine = PortfolioEngine::new(symbols(&["A", "B"]), seeded_config()).unwrap();
    engine.run(&random_walk(&["A", "B"], 120, 8)).unwrap();

    assert!(logs_contain("return statistics estimated"));
    assert!(logs_contain("monte carlo sampling finished"));
    assert!(logs_contain("strategy finished"));
    // both strategies report through the same line
    assert!(logs_contain("monte-carlo"));
    assert!(logs_contain("slsqp"));
  }
}
