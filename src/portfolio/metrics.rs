//! # Portfolio Metrics
//!
//! $$
//! \mu_p = \mathbf{w}^\top\mu,\qquad
//! \sigma_p = \sqrt{\mathbf{w}^\top \Sigma \mathbf{w}},\qquad
//! S = \frac{\mu_p - r_f}{\sigma_p}
//! $$
//!
//! Pure metric functions shared by every allocation strategy.

use ndarray::Array1;
use ndarray::Array2;
use ndarray::ArrayView1;
use serde::Deserialize;
use serde::Serialize;

use crate::error::OptimizationError;
use crate::error::Result;

/// Negative portfolio variance tolerated as rounding noise before it is treated as corruption.
pub const VARIANCE_TOLERANCE: f64 = 1e-12;

/// Expected return, volatility and Sharpe ratio of one weight vector.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortfolioMetrics {
  pub expected_return: f64,
  pub volatility: f64,
  pub sharpe: f64,
}

impl PortfolioMetrics {
  /// Evaluate all three metrics, failing when the Sharpe ratio is undefined.
  pub fn evaluate(
    weights: ArrayView1<'_, f64>,
    mean_returns: &Array1<f64>,
    covariance: &Array2<f64>,
    risk_free: f64,
  ) -> Result<Self> {
    let expected_return = portfolio_return(weights, mean_returns);
    let volatility = portfolio_volatility(weights, covariance)?;
    let sharpe = sharpe_ratio(expected_return, volatility, risk_free)?;

    Ok(Self {
      expected_return,
      volatility,
      sharpe,
    })
  }
}

/// `Σ wᵢ μᵢ`.
pub fn portfolio_return(weights: ArrayView1<'_, f64>, mean_returns: &Array1<f64>) -> f64 {
  weights.dot(mean_returns)
}

/// `wᵗ Σ w` without the square root.
pub fn portfolio_variance(weights: ArrayView1<'_, f64>, covariance: &Array2<f64>) -> f64 {
  weights.dot(&covariance.dot(&weights))
}

/// `sqrt(wᵗ Σ w)`.
///
/// Slightly negative radicands within [`VARIANCE_TOLERANCE`] are clamped to zero.
pub fn portfolio_volatility(weights: ArrayView1<'_, f64>, covariance: &Array2<f64>) -> Result<f64> {
  let variance = portfolio_variance(weights, covariance);
  if variance.is_nan() || variance < -VARIANCE_TOLERANCE {
    return Err(OptimizationError::DegenerateVariance { radicand: variance });
  }
  Ok(variance.max(0.0).sqrt())
}

/// `(μ_p - r_f) / σ_p`, refusing to divide by an exactly zero volatility.
pub fn sharpe_ratio(expected_return: f64, volatility: f64, risk_free: f64) -> Result<f64> {
  if volatility == 0.0 {
    return Err(OptimizationError::DivisionByZero);
  }
  Ok((expected_return - risk_free) / volatility)
}
