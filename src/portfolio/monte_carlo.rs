//! # Monte Carlo Sampler
//!
//! $$
//! \mathbf{w}^{(k)} = \frac{\mathbf{u}^{(k)}}{\sum_i u_i^{(k)}},\qquad
//! \mathbf{u}^{(k)} \sim \mathcal U[0,1)^N,\quad k=1,\dots,K
//! $$
//!
//! Unguided exploration of the weight simplex. Every trial is kept in a
//! [`SimulationPopulation`] so several selections (max-Sharpe, min-volatility,
//! frontier) can be made from a single sampling pass.
//!
//! Normalizing independent uniforms does not produce a uniform distribution
//! over the simplex: mass concentrates toward the centroid. It is kept as the
//! default frontier explorer; [`SimplexSampling::FlatDirichlet`] draws
//! uniformly over the simplex instead.
//!
//! With per-asset bounds every draw is mapped into the bounded region, so a
//! narrow box costs no trials.

use ndarray::Array1;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::Distribution;
use rand_distr::Exp1;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;

use super::data::ReturnsStatistics;
use super::metrics::portfolio_return;
use super::metrics::portfolio_volatility;
use super::metrics::sharpe_ratio;
use super::optimizers::AllocationStrategy;
use super::types::BoundSet;
use super::types::OptimizationResult;
use super::types::OptimizerMethod;
use crate::error::OptimizationError;
use crate::error::Result;

/// Default number of trials per run.
pub const DEFAULT_TRIALS: usize = 10_000;

/// How raw draws are mapped onto the weight simplex.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SimplexSampling {
  /// Independent `U[0,1)` draws divided by their sum.
  #[default]
  NormalizedUniform,
  /// Independent `Exp(1)` draws divided by their sum, i.e. `Dirichlet(1, …, 1)`.
  FlatDirichlet,
}

/// One sampled portfolio.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trial {
  pub weights: Vec<f64>,
  pub expected_return: f64,
  pub volatility: f64,
  /// `None` when the volatility is exactly zero.
  pub sharpe: Option<f64>,
}

impl Trial {
  fn into_result(self, method: OptimizerMethod) -> OptimizationResult {
    OptimizationResult {
      method,
      weights: self.weights,
      expected_return: self.expected_return,
      volatility: self.volatility,
      sharpe: self.sharpe,
    }
  }
}

/// All trials of one sampling pass, in trial order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SimulationPopulation {
  trials: Vec<Trial>,
  discarded: usize,
}

impl SimulationPopulation {
  /// Kept trials, in draw order.
  pub fn trials(&self) -> &[Trial] {
    &self.trials
  }

  /// Number of kept trials.
  pub fn len(&self) -> usize {
    self.trials.len()
  }

  /// `true` when every trial was discarded.
  pub fn is_empty(&self) -> bool {
    self.trials.is_empty()
  }

  /// Trials dropped for degenerate variance or an all-zero draw.
  pub fn discarded(&self) -> usize {
    self.discarded
  }

  /// Trial with the highest Sharpe ratio; the earliest wins ties.
  ///
  /// Trials with an undefined Sharpe ratio are skipped. If no trial has one
  /// (e.g. constant prices) the first trial is returned as is.
  pub fn best_by_sharpe(&self) -> Option<&Trial> {
    let mut best: Option<(&Trial, f64)> = None;
    for trial in &self.trials {
      if let Some(s) = trial.sharpe {
        match best {
          Some((_, b)) if s <= b => {}
          _ => best = Some((trial, s)),
        }
      }
    }
    best.map(|(t, _)| t).or_else(|| self.trials.first())
  }

  /// Trial with the lowest volatility; the earliest wins ties.
  pub fn best_by_volatility(&self) -> Option<&Trial> {
    let mut best: Option<&Trial> = None;
    for trial in &self.trials {
      match best {
        Some(b) if trial.volatility >= b.volatility => {}
        _ => best = Some(trial),
      }
    }
    best
  }

  /// Non-dominated trials ordered by increasing volatility.
  ///
  /// A trial is kept when no other trial has both lower-or-equal volatility
  /// and strictly higher expected return.
  pub fn efficient_frontier(&self) -> Vec<&Trial> {
    let mut order: Vec<&Trial> = self.trials.iter().collect();
    order.sort_by(|a, b| {
      a.volatility
        .total_cmp(&b.volatility)
        .then(b.expected_return.total_cmp(&a.expected_return))
    });

    let mut frontier = Vec::new();
    let mut best_return = f64::NEG_INFINITY;
    for trial in order {
      if trial.expected_return > best_return {
        best_return = trial.expected_return;
        frontier.push(trial);
      }
    }
    frontier
  }
}

/// Random-weight frontier explorer.
#[derive(Clone, Debug)]
pub struct MonteCarloSampler {
  trials: usize,
  seed: Option<u64>,
  sampling: SimplexSampling,
  risk_free: f64,
  bounds: Option<BoundSet>,
}

impl Default for MonteCarloSampler {
  fn default() -> Self {
    Self {
      trials: DEFAULT_TRIALS,
      seed: None,
      sampling: SimplexSampling::default(),
      risk_free: 0.0,
      bounds: None,
    }
  }
}

impl MonteCarloSampler {
  /// Sampler running `trials` draws; fails when `trials` is zero.
  pub fn new(trials: usize, seed: Option<u64>) -> Result<Self> {
    if trials == 0 {
      return Err(OptimizationError::InvalidConfig(
        "trial count must be positive".to_string(),
      ));
    }
    Ok(Self {
      trials,
      seed,
      ..Self::default()
    })
  }

  /// Simplex mapping for raw draws.
  pub fn with_sampling(mut self, sampling: SimplexSampling) -> Self {
    self.sampling = sampling;
    self
  }

  /// Risk-free rate used for trial Sharpe ratios.
  pub fn with_risk_free(mut self, risk_free: f64) -> Self {
    self.risk_free = risk_free;
    self
  }

  /// Draw every trial inside `bounds`.
  pub fn with_bounds(mut self, bounds: BoundSet) -> Self {
    self.bounds = Some(bounds);
    self
  }

  /// Configured trial count.
  pub fn trials(&self) -> usize {
    self.trials
  }

  /// Configured seed, if any.
  pub fn seed(&self) -> Option<u64> {
    self.seed
  }

  /// Run all trials with a random source built from the configured seed.
  ///
  /// Without a seed the source is seeded from the OS; it is still local to
  /// this call.
  pub fn sample(&self, stats: &ReturnsStatistics) -> Result<SimulationPopulation> {
    let mut rng = match self.seed {
      Some(seed) => StdRng::seed_from_u64(seed),
      None => StdRng::from_os_rng(),
    };
    self.sample_with(stats, &mut rng)
  }

  /// Run all trials drawing from `rng`.
  pub fn sample_with<R: Rng + ?Sized>(
    &self,
    stats: &ReturnsStatistics,
    rng: &mut R,
  ) -> Result<SimulationPopulation> {
    let n = stats.n_assets();
    let limits = match &self.bounds {
      Some(bounds) if bounds.len() != n => {
        return Err(OptimizationError::InvalidBound(format!(
          "{} bounds for {n} assets",
          bounds.len()
        )));
      }
      Some(bounds) => Some((bounds.lower(), bounds.upper())),
      None => None,
    };

    let mu = stats.mean_returns();
    let cov = stats.covariance();
    let mut population = SimulationPopulation {
      trials: Vec::with_capacity(self.trials),
      discarded: 0,
    };

    for _ in 0..self.trials {
      let Some(draw) = self.draw(n, rng) else {
        population.discarded += 1;
        continue;
      };
      let weights = match &limits {
        Some((lower, upper)) => fit_to_bounds(&draw, lower, upper),
        None => draw,
      };

      let expected_return = portfolio_return(weights.view(), mu);
      let volatility = match portfolio_volatility(weights.view(), cov) {
        Ok(v) => v,
        Err(err) => {
          debug!(%err, "discarding trial");
          population.discarded += 1;
          continue;
        }
      };
      let sharpe = sharpe_ratio(expected_return, volatility, self.risk_free).ok();

      population.trials.push(Trial {
        weights: weights.to_vec(),
        expected_return,
        volatility,
        sharpe,
      });
    }

    info!(
      trials = self.trials,
      kept = population.len(),
      discarded = population.discarded,
      "monte carlo sampling finished"
    );
    Ok(population)
  }

  fn draw<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Option<Array1<f64>> {
    let raw: Array1<f64> = match self.sampling {
      SimplexSampling::NormalizedUniform => Array1::from_iter((0..n).map(|_| rng.random::<f64>())),
      SimplexSampling::FlatDirichlet => Array1::from_iter((0..n).map(|_| -> f64 { Exp1.sample(&mut *rng) })),
    };
    let total = raw.sum();
    if total > 0.0 && total.is_finite() {
      Some(raw / total)
    } else {
      None
    }
  }
}

/// Map the simplex point `p` into `{Σ w = 1, l ≤ w ≤ u}`.
///
/// Minimums are funded first and the rest of the budget follows `p`. Weight
/// above a maximum is capped and handed to the assets that still have room,
/// again in proportion to `p`, until nothing overflows. Requires `Σ l ≤ 1 ≤ Σ u`.
fn fit_to_bounds(p: &Array1<f64>, lower: &[f64], upper: &[f64]) -> Array1<f64> {
  let n = p.len();
  let budget = (1.0 - lower.iter().sum::<f64>()).max(0.0);
  let mut w = Array1::from_iter((0..n).map(|i| lower[i] + budget * p[i]));
  let mut capped = vec![false; n];

  for _ in 0..n {
    let mut excess = 0.0;
    for i in 0..n {
      if !capped[i] && w[i] >= upper[i] {
        excess += w[i] - upper[i];
        w[i] = upper[i];
        capped[i] = true;
      }
    }
    if excess <= 0.0 {
      break;
    }

    let open: Vec<usize> = (0..n).filter(|&i| !capped[i]).collect();
    let share: f64 = open.iter().map(|&i| p[i]).sum();
    if share > 0.0 {
      for &i in &open {
        w[i] += excess * p[i] / share;
      }
    } else {
      // no draw mass left on open assets: fill by remaining room, which cannot overflow
      let room: f64 = open.iter().map(|&i| upper[i] - w[i]).sum();
      if room <= 0.0 {
        break;
      }
      for &i in &open {
        w[i] += excess * (upper[i] - w[i]) / room;
      }
    }
  }
  w
}

impl AllocationStrategy for MonteCarloSampler {
  fn name(&self) -> &'static str {
    "monte-carlo"
  }

  /// Max-Sharpe selection followed by min-volatility selection.
  fn allocate(&self, stats: &ReturnsStatistics) -> Result<Vec<OptimizationResult>> {
    let population = self.sample(stats)?;
    select(&population)
  }
}

/// Max-Sharpe and min-volatility results from an existing population.
pub fn select(population: &SimulationPopulation) -> Result<Vec<OptimizationResult>> {
  let no_trials = || {
    OptimizationError::OptimizationFailed(format!(
      "no admissible monte carlo trials ({} discarded)",
      population.discarded()
    ))
  };
  let sharpe = population.best_by_sharpe().ok_or_else(no_trials)?;
  let volatility = population.best_by_volatility().ok_or_else(no_trials)?;

  Ok(vec![
    sharpe.clone().into_result(OptimizerMethod::MonteCarloMaxSharpe),
    volatility
      .clone()
      .into_result(OptimizerMethod::MonteCarloMinVolatility),
  ])
}
