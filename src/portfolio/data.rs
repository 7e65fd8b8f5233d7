//! # Portfolio Data
//!
//! $$
//! r_t = \ln\frac{P_t}{P_{t-1}},\qquad
//! \mu = f\,\bar r,\qquad
//! \Sigma = \frac{f}{T-1}\sum_t (r_t-\bar r)(r_t-\bar r)^\top
//! $$
//!
//! Price matrix container and the return statistics every strategy consumes.

use std::collections::HashSet;

use chrono::NaiveDate;
use ndarray::Array1;
use ndarray::Array2;
use ndarray::ArrayView1;
use ndarray::ArrayView2;
use ndarray::Axis;
use ndarray_stats::CorrelationExt;
use tracing::debug;

use crate::error::OptimizationError;
use crate::error::Result;

/// Trading days per year, the usual factor for daily closes.
pub const DAILY_ANNUALIZATION: f64 = 252.0;
/// Months per year, for monthly closes.
pub const MONTHLY_ANNUALIZATION: f64 = 12.0;

/// Dense dates × assets matrix of closing prices.
///
/// Rows follow `dates`, columns follow `symbols`. Entries may be `NaN` where a
/// price is undefined (e.g. a missing leading price); such rows are dropped
/// when returns are computed.
#[derive(Clone, Debug, PartialEq)]
pub struct PriceMatrix {
  dates: Vec<NaiveDate>,
  symbols: Vec<String>,
  prices: Array2<f64>,
}

impl PriceMatrix {
  /// Build a matrix, checking shape and symbol uniqueness.
  pub fn new(dates: Vec<NaiveDate>, symbols: Vec<String>, prices: Array2<f64>) -> Result<Self> {
    if symbols.is_empty() {
      return Err(OptimizationError::InvalidPriceMatrix(
        "at least one asset symbol is required".to_string(),
      ));
    }

    let mut seen = HashSet::with_capacity(symbols.len());
    for s in &symbols {
      if !seen.insert(s.as_str()) {
        return Err(OptimizationError::InvalidPriceMatrix(format!(
          "duplicate symbol {s}"
        )));
      }
    }

    let (rows, cols) = prices.dim();
    if cols != symbols.len() {
      return Err(OptimizationError::InvalidPriceMatrix(format!(
        "{cols} price columns for {} symbols",
        symbols.len()
      )));
    }
    if rows != dates.len() {
      return Err(OptimizationError::InvalidPriceMatrix(format!(
        "{rows} price rows for {} dates",
        dates.len()
      )));
    }

    Ok(Self {
      dates,
      symbols,
      prices,
    })
  }

  /// Build a matrix from per-symbol close columns of equal length.
  pub fn from_columns(dates: Vec<NaiveDate>, columns: Vec<(String, Vec<f64>)>) -> Result<Self> {
    let rows = dates.len();
    let cols = columns.len();
    let mut prices = Array2::<f64>::zeros((rows, cols));
    let mut symbols = Vec::with_capacity(cols);

    for (j, (symbol, closes)) in columns.into_iter().enumerate() {
      if closes.len() != rows {
        return Err(OptimizationError::InvalidPriceMatrix(format!(
          "column {symbol} has {} prices for {rows} dates",
          closes.len()
        )));
      }
      prices.column_mut(j).assign(&ArrayView1::from(closes.as_slice()));
      symbols.push(symbol);
    }

    Self::new(dates, symbols, prices)
  }

  /// Observation dates, one per row.
  pub fn dates(&self) -> &[NaiveDate] {
    &self.dates
  }

  /// Column symbols, in order.
  pub fn symbols(&self) -> &[String] {
    &self.symbols
  }

  /// `T × N` close prices.
  pub fn prices(&self) -> ArrayView2<'_, f64> {
    self.prices.view()
  }

  /// Number of columns.
  pub fn n_assets(&self) -> usize {
    self.symbols.len()
  }

  /// Number of rows.
  pub fn n_periods(&self) -> usize {
    self.dates.len()
  }
}

/// Period-over-period log-returns with undefined rows dropped.
///
/// A row is kept only when every asset has a finite, strictly positive price
/// in both periods. The result therefore has at most `T - 1` rows.
pub fn log_returns(prices: ArrayView2<'_, f64>) -> Array2<f64> {
  let (rows, cols) = prices.dim();
  let mut flat = Vec::with_capacity(rows.saturating_sub(1) * cols);
  let mut kept = 0usize;

  for t in 1..rows {
    let prev = prices.row(t - 1);
    let curr = prices.row(t);
    let row: Vec<f64> = prev
      .iter()
      .zip(curr.iter())
      .map(|(&p0, &p1)| {
        if p0 > 0.0 && p1 > 0.0 {
          (p1 / p0).ln()
        } else {
          f64::NAN
        }
      })
      .collect();

    if row.iter().all(|r| r.is_finite()) {
      flat.extend(row);
      kept += 1;
    }
  }

  Array2::from_shape_vec((kept, cols), flat).unwrap_or_else(|_| Array2::zeros((0, cols)))
}

/// Annualized mean-return vector and covariance matrix over a fixed asset universe.
#[derive(Clone, Debug)]
pub struct ReturnsStatistics {
  symbols: Vec<String>,
  mean_returns: Array1<f64>,
  covariance: Array2<f64>,
  annualization_factor: f64,
  observations: usize,
}

impl ReturnsStatistics {
  /// Derive statistics from closing prices.
  pub fn from_prices(prices: &PriceMatrix, annualization_factor: f64) -> Result<Self> {
    let returns = log_returns(prices.prices());
    debug!(
      periods = prices.n_periods(),
      valid_returns = returns.nrows(),
      "computed log returns"
    );
    Self::from_returns(prices.symbols().to_vec(), returns.view(), annualization_factor)
  }

  /// Derive statistics from an already computed return matrix (rows = periods).
  pub fn from_returns(
    symbols: Vec<String>,
    returns: ArrayView2<'_, f64>,
    annualization_factor: f64,
  ) -> Result<Self> {
    check_annualization(annualization_factor)?;
    if returns.ncols() != symbols.len() {
      return Err(OptimizationError::InvalidPriceMatrix(format!(
        "{} return columns for {} symbols",
        returns.ncols(),
        symbols.len()
      )));
    }

    let observations = returns.nrows();
    if observations < 2 {
      return Err(OptimizationError::InsufficientData {
        valid_rows: observations,
      });
    }

    let mean = returns
      .mean_axis(Axis(0))
      .ok_or(OptimizationError::InsufficientData {
        valid_rows: observations,
      })?;
    let cov = returns
      .t()
      .cov(1.0)
      .map_err(|_| OptimizationError::InsufficientData {
        valid_rows: observations,
      })?;

    Ok(Self {
      symbols,
      mean_returns: mean * annualization_factor,
      covariance: cov * annualization_factor,
      annualization_factor,
      observations,
    })
  }

  /// Wrap externally estimated annualized moments.
  pub fn from_moments(
    symbols: Vec<String>,
    mean_returns: Array1<f64>,
    covariance: Array2<f64>,
    annualization_factor: f64,
  ) -> Result<Self> {
    check_annualization(annualization_factor)?;
    let n = symbols.len();
    if n == 0 {
      return Err(OptimizationError::InvalidPriceMatrix(
        "at least one asset symbol is required".to_string(),
      ));
    }
    if mean_returns.len() != n || covariance.dim() != (n, n) {
      return Err(OptimizationError::InvalidPriceMatrix(format!(
        "moments of shape {} / {:?} for {n} symbols",
        mean_returns.len(),
        covariance.dim()
      )));
    }
    for i in 0..n {
      for j in (i + 1)..n {
        let (a, b) = (covariance[[i, j]], covariance[[j, i]]);
        if (a - b).abs() > 1e-12 * a.abs().max(b.abs()).max(1.0) {
          return Err(OptimizationError::InvalidPriceMatrix(format!(
            "covariance is not symmetric at ({i}, {j})"
          )));
        }
      }
    }

    Ok(Self {
      symbols,
      mean_returns,
      covariance,
      annualization_factor,
      observations: 0,
    })
  }

  /// Asset symbols, in weight order.
  pub fn symbols(&self) -> &[String] {
    &self.symbols
  }

  /// Number of assets.
  pub fn n_assets(&self) -> usize {
    self.symbols.len()
  }

  /// Annualized arithmetic mean of log-returns, one entry per asset.
  pub fn mean_returns(&self) -> &Array1<f64> {
    &self.mean_returns
  }

  /// Annualized sample covariance (ddof = 1).
  pub fn covariance(&self) -> &Array2<f64> {
    &self.covariance
  }

  /// Periods per year the moments were scaled by.
  pub fn annualization_factor(&self) -> f64 {
    self.annualization_factor
  }

  /// Number of return rows the moments were estimated from (0 for external moments).
  pub fn observations(&self) -> usize {
    self.observations
  }

  /// Annualized per-asset volatility, `sqrt(diag(Σ))`.
  pub fn volatilities(&self) -> Array1<f64> {
    self.covariance.diag().mapv(|v| v.max(0.0).sqrt())
  }

  /// Position of `symbol` in the asset universe.
  pub fn index_of(&self, symbol: &str) -> Option<usize> {
    self.symbols.iter().position(|s| s == symbol)
  }
}

fn check_annualization(factor: f64) -> Result<()> {
  if factor.is_finite() && factor > 0.0 {
    Ok(())
  } else {
    Err(OptimizationError::InvalidConfig(format!(
      "annualization factor must be finite and positive, got {factor}"
    )))
  }
}
