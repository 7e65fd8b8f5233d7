//! # Portfolio Optimizers
//!
//! $$
//! \min_{\mathbf{w}} -\frac{\mathbf w^\top\mu - r_f}{\sqrt{\mathbf w^\top\Sigma\mathbf w}}
//! \quad\text{s.t.}\quad \sum_i w_i = 1,\quad l_i\le w_i\le u_i
//! $$
//!
//! The strategy contract shared by all allocators and the SLSQP-driven
//! constrained optimizer.
//!
//! The Sharpe ratio is not concave over the bounded simplex in general, so
//! [`ConstrainedOptimizer`] returns a local maximum reached from the
//! equal-weight start, not a certified global one.

use std::collections::BTreeMap;

use argmin::core::CostFunction;
use argmin::core::Gradient;
use ndarray::Array1;
use ndarray::Array2;
use ndarray::ArrayView1;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;
use tracing::warn;

use super::data::ReturnsStatistics;
use super::metrics::portfolio_return;
use super::metrics::portfolio_volatility;
use super::metrics::sharpe_ratio;
use super::slsqp::DEFAULT_FTOL;
use super::slsqp::DEFAULT_MAX_ITERS;
use super::slsqp::LinearEquality;
use super::slsqp::Slsqp;
use super::slsqp::SolverReport;
use super::types::BoundSet;
use super::types::OptimizationResult;
use super::types::OptimizerMethod;
use crate::error::OptimizationError;
use crate::error::Result;

/// Anything that turns return statistics into candidate allocations.
pub trait AllocationStrategy {
  /// Short identifier used in logs.
  fn name(&self) -> &'static str;

  /// Produce one or more results, each with weights aligned to `stats.symbols()`.
  fn allocate(&self, stats: &ReturnsStatistics) -> Result<Vec<OptimizationResult>>;
}

/// What the constrained optimizer minimizes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConstrainedObjective {
  /// Minimize the negative Sharpe ratio.
  #[default]
  MaxSharpe,
  /// Minimize portfolio volatility.
  MinVolatility,
}

impl ConstrainedObjective {
  fn method(&self) -> OptimizerMethod {
    match self {
      Self::MaxSharpe => OptimizerMethod::SlsqpMaxSharpe,
      Self::MinVolatility => OptimizerMethod::SlsqpMinVolatility,
    }
  }
}

/// Objective handed to the solver, with analytic gradients.
struct AllocationProblem {
  mu: Array1<f64>,
  cov: Array2<f64>,
  risk_free: f64,
  objective: ConstrainedObjective,
}

impl CostFunction for AllocationProblem {
  type Param = Vec<f64>;
  type Output = f64;

  fn cost(&self, w: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
    let w = ArrayView1::from(w.as_slice());
    let volatility = portfolio_volatility(w, &self.cov)?;
    match self.objective {
      ConstrainedObjective::MaxSharpe => {
        let sharpe = sharpe_ratio(portfolio_return(w, &self.mu), volatility, self.risk_free)?;
        Ok(-sharpe)
      }
      ConstrainedObjective::MinVolatility => Ok(volatility),
    }
  }
}

impl Gradient for AllocationProblem {
  type Param = Vec<f64>;
  type Gradient = Vec<f64>;

  fn gradient(&self, w: &Self::Param) -> std::result::Result<Self::Gradient, argmin::core::Error> {
    let w = ArrayView1::from(w.as_slice());
    let volatility = portfolio_volatility(w, &self.cov)?;
    if volatility == 0.0 {
      return Err(OptimizationError::DivisionByZero.into());
    }
    let sigma_w = self.cov.dot(&w);

    let grad = match self.objective {
      // d(-S)/dw = -μ/σ + (μ_p - r_f) Σw / σ³
      ConstrainedObjective::MaxSharpe => {
        let excess = portfolio_return(w, &self.mu) - self.risk_free;
        let sigma3 = volatility.powi(3);
        -(&self.mu / volatility) + sigma_w * (excess / sigma3)
      }
      ConstrainedObjective::MinVolatility => sigma_w / volatility,
    };
    Ok(grad.to_vec())
  }
}

/// Gradient-based constrained allocator (SLSQP).
#[derive(Clone, Debug)]
pub struct ConstrainedOptimizer {
  symbols: Vec<String>,
  bounds: BoundSet,
  objective: ConstrainedObjective,
  risk_free: f64,
  max_iters: u64,
  ftol: f64,
}

impl ConstrainedOptimizer {
  /// Build an optimizer for `symbols`.
  ///
  /// Bounds are validated here: a bound for a symbol outside the universe,
  /// an out-of-range pair or a bound set that excludes `Σ w = 1` fails with
  /// [`OptimizationError::InvalidBound`] before any solve is attempted.
  pub fn new(symbols: &[String], bounds: Option<&BTreeMap<String, (f64, f64)>>) -> Result<Self> {
    let bounds = match bounds {
      Some(requested) => BoundSet::from_pairs(symbols, requested)?,
      None => BoundSet::unbounded(symbols.len()),
    };
    Self::with_bound_set(symbols, bounds)
  }

  /// Build an optimizer from already resolved bounds.
  pub fn with_bound_set(symbols: &[String], bounds: BoundSet) -> Result<Self> {
    if bounds.len() != symbols.len() {
      return Err(OptimizationError::InvalidBound(format!(
        "{} bounds for {} assets",
        bounds.len(),
        symbols.len()
      )));
    }
    Ok(Self {
      symbols: symbols.to_vec(),
      bounds,
      objective: ConstrainedObjective::default(),
      risk_free: 0.0,
      max_iters: DEFAULT_MAX_ITERS,
      ftol: DEFAULT_FTOL,
    })
  }

  /// Objective to minimize; max-Sharpe by default.
  pub fn with_objective(mut self, objective: ConstrainedObjective) -> Self {
    self.objective = objective;
    self
  }

  /// Risk-free rate used by the Sharpe objective.
  pub fn with_risk_free(mut self, risk_free: f64) -> Self {
    self.risk_free = risk_free;
    self
  }

  /// Cap on solver iterations; hitting it is reported as a failure.
  pub fn with_max_iters(mut self, max_iters: u64) -> Self {
    self.max_iters = max_iters;
    self
  }

  /// Objective tolerance for convergence.
  pub fn with_ftol(mut self, ftol: f64) -> Self {
    self.ftol = ftol;
    self
  }

  /// Resolved per-asset bounds.
  pub fn bounds(&self) -> &BoundSet {
    &self.bounds
  }

  /// Configured objective.
  pub fn objective(&self) -> ConstrainedObjective {
    self.objective
  }

  /// Run the solver from equal weights and return its raw report.
  pub fn solve(&self, stats: &ReturnsStatistics) -> Result<SolverReport> {
    if stats.symbols() != self.symbols.as_slice() {
      return Err(OptimizationError::AssetMismatch {
        expected: self.symbols.clone(),
        actual: stats.symbols().to_vec(),
      });
    }

    let n = self.symbols.len();
    let solver = Slsqp::new(
      self.bounds.lower(),
      self.bounds.upper(),
      LinearEquality::budget(n),
    )?
    .with_max_iters(self.max_iters)
    .with_ftol(self.ftol);

    let problem = AllocationProblem {
      mu: stats.mean_returns().clone(),
      cov: stats.covariance().clone(),
      risk_free: self.risk_free,
      objective: self.objective,
    };
    let x0 = vec![1.0 / n as f64; n];

    Ok(solver.minimize(problem, &x0))
  }

  /// Solve and recompute the metrics at the solver's final weights.
  pub fn optimize(&self, stats: &ReturnsStatistics) -> Result<OptimizationResult> {
    let report = self.solve(stats)?;
    if !report.success {
      warn!(
        iterations = report.iterations,
        message = %report.message,
        "slsqp did not converge"
      );
      return Err(OptimizationError::OptimizationFailed(report.message));
    }
    info!(
      iterations = report.iterations,
      evaluations = report.evaluations,
      objective = report.fun,
      "slsqp converged"
    );

    self.result_at(report.x, stats)
  }

  /// Metrics at converged weights; any metric failure fails the solve.
  fn result_at(&self, weights: Vec<f64>, stats: &ReturnsStatistics) -> Result<OptimizationResult> {
    let failed = |e: OptimizationError| OptimizationError::OptimizationFailed(e.to_string());
    let w = ArrayView1::from(weights.as_slice());
    let expected_return = portfolio_return(w, stats.mean_returns());
    let volatility = portfolio_volatility(w, stats.covariance()).map_err(failed)?;
    let sharpe = match self.objective {
      ConstrainedObjective::MaxSharpe => {
        Some(sharpe_ratio(expected_return, volatility, self.risk_free).map_err(failed)?)
      }
      ConstrainedObjective::MinVolatility => sharpe_ratio(expected_return, volatility, self.risk_free).ok(),
    };

    Ok(OptimizationResult {
      method: self.objective.method(),
      weights,
      expected_return,
      volatility,
      sharpe,
    })
  }
}

impl AllocationStrategy for ConstrainedOptimizer {
  fn name(&self) -> &'static str {
    "slsqp"
  }

  fn allocate(&self, stats: &ReturnsStatistics) -> Result<Vec<OptimizationResult>> {
    Ok(vec![self.optimize(stats)?])
  }
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;
  use approx::assert_relative_eq;
  use chrono::NaiveDate;
  use ndarray::array;

  use super::*;
  use crate::portfolio::data::PriceMatrix;
  use crate::portfolio::monte_carlo::MonteCarloSampler;
  use crate::portfolio::types::BUDGET_TOLERANCE;

  fn symbols(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
  }

  fn correlated_stats() -> ReturnsStatistics {
    ReturnsStatistics::from_moments(
      symbols(&["A", "B", "C"]),
      array![0.08, 0.12, 0.15],
      array![[0.04, 0.006, 0.002], [0.006, 0.09, 0.01], [0.002, 0.01, 0.16]],
      252.0,
    )
    .unwrap()
  }

  /// 504 daily closes per asset drifting up 0.05% a day with orthogonal,
  /// equal-size noise, so the sample moments are exactly symmetric.
  fn symmetric_prices() -> PriceMatrix {
    let patterns = [[1.0, -1.0, 1.0, -1.0], [1.0, 1.0, -1.0, -1.0], [1.0, -1.0, -1.0, 1.0]];
    let drift = 1.0005f64.ln();
    let noise = 0.01;
    let rows = 504;
    let start = NaiveDate::from_ymd_opt(2022, 1, 3).unwrap();
    let dates = (0..rows)
      .map(|i| start + chrono::Duration::days(i as i64))
      .collect();

    let columns = patterns
      .iter()
      .enumerate()
      .map(|(j, pattern)| {
        let mut closes = vec![100.0];
        for t in 1..rows {
          // the last three returns carry no noise so every block stays balanced
          let shock = if t - 1 < 500 { pattern[(t - 1) % 4] * noise } else { 0.0 };
          let prev = closes[t - 1];
          closes.push(prev * (drift + shock).exp());
        }
        (format!("S{j}"), closes)
      })
      .collect();

    PriceMatrix::from_columns(dates, columns).unwrap()
  }

  #[test]
  fn symmetric_assets_converge_to_equal_weights() {
    let stats = ReturnsStatistics::from_prices(&symmetric_prices(), 252.0).unwrap();
    let optimizer = ConstrainedOptimizer::new(stats.symbols(), None).unwrap();
    let report = optimizer.solve(&stats).unwrap();
    assert!(report.success, "{}", report.message);

    let result = optimizer.optimize(&stats).unwrap();
    for w in &result.weights {
      assert_abs_diff_eq!(*w, 1.0 / 3.0, epsilon = 1e-3);
    }

    // equal variance, zero correlation: S* = sqrt(N) * mu / sigma
    let mu = stats.mean_returns()[0];
    let sigma = stats.covariance()[[0, 0]].sqrt();
    assert_relative_eq!(result.sharpe.unwrap(), 3f64.sqrt() * mu / sigma, max_relative = 1e-6);
  }

  #[test]
  fn uncorrelated_pair_matches_tangency_portfolio() {
    let stats = ReturnsStatistics::from_moments(
      symbols(&["A", "B"]),
      array![0.10, 0.15],
      array![[0.04, 0.0], [0.0, 0.09]],
      252.0,
    )
    .unwrap();
    let result = ConstrainedOptimizer::new(stats.symbols(), None)
      .unwrap()
      .optimize(&stats)
      .unwrap();

    // w ∝ Σ⁻¹μ = (2.5, 1.667)
    assert_abs_diff_eq!(result.weights[0], 0.6, epsilon = 1e-4);
    assert_abs_diff_eq!(result.weights[1], 0.4, epsilon = 1e-4);
    assert_eq!(result.method, OptimizerMethod::SlsqpMaxSharpe);
  }

  #[test]
  fn correlated_assets_match_tangency_portfolio() {
    let stats = correlated_stats();
    let result = ConstrainedOptimizer::new(stats.symbols(), None)
      .unwrap()
      .optimize(&stats)
      .unwrap();

    let expected = [0.476_629_5, 0.298_302_7, 0.225_067_7];
    for (w, e) in result.weights.iter().zip(expected) {
      assert_abs_diff_eq!(*w, e, epsilon = 5e-4);
    }
    assert_relative_eq!(result.sharpe.unwrap(), 0.635_893_2, max_relative = 1e-6);
    assert!(BoundSet::unbounded(3).admits(&result.weights, BUDGET_TOLERANCE));
  }

  #[test]
  fn binding_upper_bound_is_respected() {
    let stats = correlated_stats();
    let mut bounds = BTreeMap::new();
    bounds.insert("C".to_string(), (0.0, 0.2));
    let optimizer = ConstrainedOptimizer::new(stats.symbols(), Some(&bounds)).unwrap();
    let result = optimizer.optimize(&stats).unwrap();

    assert!(optimizer.bounds().admits(&result.weights, BUDGET_TOLERANCE));
    assert_abs_diff_eq!(result.weights[2], 0.2, epsilon = 1e-6);
    // grid search over the capped face peaks at 0.63466
    assert!(result.sharpe.unwrap() >= 0.634_65);
    assert!(result.sharpe.unwrap() < 0.635_893_2);
  }

  #[test]
  fn unknown_bound_symbol_fails_before_solving() {
    let mut bounds = BTreeMap::new();
    bounds.insert("ZZZ".to_string(), (0.0, 0.5));
    let err = ConstrainedOptimizer::new(&symbols(&["A", "B", "C"]), Some(&bounds)).unwrap_err();
    assert!(matches!(err, OptimizationError::InvalidBound(_)));
  }

  #[test]
  fn single_asset_is_fully_invested() {
    let stats = ReturnsStatistics::from_moments(symbols(&["A"]), array![0.07], array![[0.0225]], 252.0).unwrap();
    let result = ConstrainedOptimizer::new(stats.symbols(), None)
      .unwrap()
      .optimize(&stats)
      .unwrap();

    assert_eq!(result.weights, vec![1.0]);
    assert_eq!(result.expected_return, 0.07);
    assert_relative_eq!(result.volatility, 0.15, epsilon = 1e-12);
  }

  #[test]
  fn repeated_runs_are_identical() {
    let stats = correlated_stats();
    let optimizer = ConstrainedOptimizer::new(stats.symbols(), None).unwrap();
    assert_eq!(optimizer.optimize(&stats).unwrap(), optimizer.optimize(&stats).unwrap());
  }

  #[test]
  fn iteration_cap_surfaces_as_failure() {
    let stats = correlated_stats();
    let err = ConstrainedOptimizer::new(stats.symbols(), None)
      .unwrap()
      .with_max_iters(1)
      .optimize(&stats)
      .unwrap_err();
    assert_eq!(
      err,
      OptimizationError::OptimizationFailed("Iteration limit reached".to_string())
    );
  }

  #[test]
  fn zero_variance_is_not_swallowed() {
    let stats =
      ReturnsStatistics::from_moments(symbols(&["A", "B"]), Array1::zeros(2), Array2::zeros((2, 2)), 252.0)
        .unwrap();
    let err = ConstrainedOptimizer::new(stats.symbols(), None)
      .unwrap()
      .optimize(&stats)
      .unwrap_err();
    assert!(matches!(err, OptimizationError::OptimizationFailed(msg) if msg.contains("division by zero")));
  }

  #[test]
  fn negative_variance_at_the_solution_is_a_solver_failure() {
    // indefinite covariance: wᵗΣw = -0.03 at (0.5, -0.5)
    let stats = ReturnsStatistics::from_moments(
      symbols(&["A", "B"]),
      array![0.10, 0.15],
      array![[0.04, 0.1], [0.1, 0.04]],
      252.0,
    )
    .unwrap();
    let optimizer = ConstrainedOptimizer::new(stats.symbols(), None).unwrap();

    for objective in [ConstrainedObjective::MaxSharpe, ConstrainedObjective::MinVolatility] {
      let err = optimizer
        .clone()
        .with_objective(objective)
        .result_at(vec![0.5, -0.5], &stats)
        .unwrap_err();
      assert!(
        matches!(&err, OptimizationError::OptimizationFailed(msg) if msg.contains("degenerate variance")),
        "{err:?}"
      );
    }
  }

  #[test]
  fn min_volatility_objective_uses_inverse_variance() {
    let stats = ReturnsStatistics::from_moments(
      symbols(&["A", "B"]),
      array![0.10, 0.15],
      array![[0.04, 0.0], [0.0, 0.09]],
      252.0,
    )
    .unwrap();
    let result = ConstrainedOptimizer::new(stats.symbols(), None)
      .unwrap()
      .with_objective(ConstrainedObjective::MinVolatility)
      .optimize(&stats)
      .unwrap();

    // w ∝ 1/σ² = (25, 11.1)
    assert_abs_diff_eq!(result.weights[0], 9.0 / 13.0, epsilon = 1e-4);
    assert_eq!(result.method, OptimizerMethod::SlsqpMinVolatility);
  }

  #[test]
  fn slsqp_is_at_least_as_good_as_sampling() {
    let stats = correlated_stats();
    let slsqp = ConstrainedOptimizer::new(stats.symbols(), None)
      .unwrap()
      .optimize(&stats)
      .unwrap();
    let population = MonteCarloSampler::new(5_000, Some(17))
      .unwrap()
      .sample(&stats)
      .unwrap();
    let sampled = population.best_by_sharpe().unwrap().sharpe.unwrap();

    assert!(slsqp.sharpe.unwrap() >= sampled - 1e-9);
  }

  #[test]
  fn mismatched_universe_is_rejected() {
    let stats = correlated_stats();
    let err = ConstrainedOptimizer::new(&symbols(&["A", "B", "D"]), None)
      .unwrap()
      .solve(&stats)
      .unwrap_err();
    assert!(matches!(err, OptimizationError::AssetMismatch { .. }));
  }
}
