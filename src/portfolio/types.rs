//! # Portfolio Types
//!
//! $$
//! \mathbf{w}^\*=\arg\max_{\mathbf{w}} \frac{\mathbb E[R_p]-r_f}{\sigma_p},\qquad
//! \sum_i w_i = 1,\quad l_i \le w_i \le u_i
//! $$
//!
//! Bounds, method identifiers and result containers shared by all strategies.

use std::collections::BTreeMap;
use std::fmt::Display;

use serde::Deserialize;
use serde::Serialize;

use crate::error::OptimizationError;
use crate::error::Result;

/// Tolerance on the budget constraint `Σ wᵢ = 1` for emitted weight vectors.
pub const BUDGET_TOLERANCE: f64 = 1e-6;

/// Per-asset `(minimum, maximum)` weight pair with `0 ≤ min ≤ max ≤ 1`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssetBound {
  min: f64,
  max: f64,
}

impl Default for AssetBound {
  fn default() -> Self {
    Self { min: 0.0, max: 1.0 }
  }
}

impl AssetBound {
  /// Validated pair; fails with [`OptimizationError::InvalidBound`] outside `0 ≤ min ≤ max ≤ 1`.
  pub fn new(min: f64, max: f64) -> Result<Self> {
    if !(min.is_finite() && max.is_finite()) || min < 0.0 || max > 1.0 || min > max {
      return Err(OptimizationError::InvalidBound(format!(
        "bound ({min}, {max}) must satisfy 0 <= min <= max <= 1"
      )));
    }
    Ok(Self { min, max })
  }

  /// Smallest allowed weight.
  pub fn min(&self) -> f64 {
    self.min
  }

  /// Largest allowed weight.
  pub fn max(&self) -> f64 {
    self.max
  }

  /// Whether `w` lies in `[min - tol, max + tol]`.
  pub fn contains(&self, w: f64, tol: f64) -> bool {
    w >= self.min - tol && w <= self.max + tol
  }
}

/// Validated bounds aligned with an asset universe.
#[derive(Clone, Debug, PartialEq)]
pub struct BoundSet {
  bounds: Vec<AssetBound>,
}

impl BoundSet {
  /// `(0, 1)` for every asset.
  pub fn unbounded(n: usize) -> Self {
    Self {
      bounds: vec![AssetBound::default(); n],
    }
  }

  /// Resolve a symbol-keyed bound map against `symbols`.
  ///
  /// Assets without an entry get `(0, 1)`. Fails on symbols outside the
  /// universe and on bound sets that leave no weight vector summing to one.
  pub fn from_map(symbols: &[String], requested: &BTreeMap<String, AssetBound>) -> Result<Self> {
    for symbol in requested.keys() {
      if !symbols.iter().any(|s| s == symbol) {
        return Err(OptimizationError::InvalidBound(format!(
          "bound references unknown asset {symbol}"
        )));
      }
    }

    let bounds = symbols
      .iter()
      .map(|s| requested.get(s).copied().unwrap_or_default())
      .collect();
    let set = Self { bounds };
    set.check_feasible()?;
    Ok(set)
  }

  /// Same as [`BoundSet::from_map`] for raw `(min, max)` pairs.
  pub fn from_pairs(symbols: &[String], requested: &BTreeMap<String, (f64, f64)>) -> Result<Self> {
    let mut parsed = BTreeMap::new();
    for (symbol, &(min, max)) in requested {
      let bound = AssetBound::new(min, max).map_err(|e| match e {
        OptimizationError::InvalidBound(msg) => {
          OptimizationError::InvalidBound(format!("{symbol}: {msg}"))
        }
        other => other,
      })?;
      parsed.insert(symbol.clone(), bound);
    }
    Self::from_map(symbols, &parsed)
  }

  fn check_feasible(&self) -> Result<()> {
    let lo: f64 = self.bounds.iter().map(|b| b.min).sum();
    let hi: f64 = self.bounds.iter().map(|b| b.max).sum();
    if lo > 1.0 + BUDGET_TOLERANCE || hi < 1.0 - BUDGET_TOLERANCE {
      return Err(OptimizationError::InvalidBound(format!(
        "bounds admit total weight in [{lo}, {hi}], which excludes 1"
      )));
    }
    Ok(())
  }

  /// Number of assets covered.
  pub fn len(&self) -> usize {
    self.bounds.len()
  }

  /// `true` for an empty universe.
  pub fn is_empty(&self) -> bool {
    self.bounds.is_empty()
  }

  /// Bound of asset `i`.
  pub fn get(&self, i: usize) -> Option<&AssetBound> {
    self.bounds.get(i)
  }

  /// Minimums, in universe order.
  pub fn lower(&self) -> Vec<f64> {
    self.bounds.iter().map(|b| b.min).collect()
  }

  /// Maximums, in universe order.
  pub fn upper(&self) -> Vec<f64> {
    self.bounds.iter().map(|b| b.max).collect()
  }

  /// Whether `weights` lies in the box and on the budget hyperplane.
  pub fn admits(&self, weights: &[f64], tol: f64) -> bool {
    weights.len() == self.bounds.len()
      && (weights.iter().sum::<f64>() - 1.0).abs() <= tol
      && self
        .bounds
        .iter()
        .zip(weights)
        .all(|(b, &w)| b.contains(w, tol))
  }
}

/// Identifies which strategy and which selection rule produced a result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OptimizerMethod {
  /// Highest Sharpe ratio among the Monte Carlo trials.
  MonteCarloMaxSharpe,
  /// Lowest volatility among the Monte Carlo trials.
  MonteCarloMinVolatility,
  /// SLSQP maximization of the Sharpe ratio.
  SlsqpMaxSharpe,
  /// SLSQP minimization of volatility.
  SlsqpMinVolatility,
}

impl OptimizerMethod {
  /// Kebab-case identifier, as stored and printed.
  pub fn name(&self) -> &'static str {
    match self {
      Self::MonteCarloMaxSharpe => "monte-carlo-max-sharpe",
      Self::MonteCarloMinVolatility => "monte-carlo-min-volatility",
      Self::SlsqpMaxSharpe => "slsqp-max-sharpe",
      Self::SlsqpMinVolatility => "slsqp-min-volatility",
    }
  }
}

impl Display for OptimizerMethod {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.name())
  }
}

/// Output of one strategy selection.
///
/// `weights` is aligned with the asset universe of the statistics it was
/// computed from. `sharpe` is `None` when the volatility is exactly zero.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
  pub method: OptimizerMethod,
  pub weights: Vec<f64>,
  pub expected_return: f64,
  pub volatility: f64,
  pub sharpe: Option<f64>,
}

impl OptimizationResult {
  /// Weight of each symbol, in universe order.
  pub fn allocation<'a>(&'a self, symbols: &'a [String]) -> Vec<(&'a str, f64)> {
    symbols
      .iter()
      .map(String::as_str)
      .zip(self.weights.iter().copied())
      .collect()
  }
}
