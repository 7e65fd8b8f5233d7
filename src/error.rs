//! # Errors
//!
//! Failure taxonomy of the optimization core. Every variant is returned to the
//! immediate caller; nothing inside the core logs-and-swallows.

use thiserror::Error;

/// Errors raised by statistics, metrics and allocation strategies.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizationError {
  /// Fewer than two valid return rows remained after dropping undefined rows.
  #[error("insufficient data: {valid_rows} valid return rows, at least 2 required")]
  InsufficientData { valid_rows: usize },

  /// `wᵗΣw` came out negative beyond floating tolerance.
  #[error("degenerate variance: portfolio variance {radicand:e} is negative")]
  DegenerateVariance { radicand: f64 },

  /// Portfolio volatility is exactly zero, so the Sharpe ratio is undefined.
  #[error("division by zero: portfolio volatility is zero")]
  DivisionByZero,

  /// Malformed or unrecognized per-asset bound configuration.
  #[error("invalid bound: {0}")]
  InvalidBound(String),

  /// The constrained solver did not converge; carries the solver message verbatim.
  #[error("optimization failed: {0}")]
  OptimizationFailed(String),

  /// Price matrix shape or symbol list is inconsistent.
  #[error("invalid price matrix: {0}")]
  InvalidPriceMatrix(String),

  /// Configuration value out of its valid domain.
  #[error("invalid configuration: {0}")]
  InvalidConfig(String),

  /// Price matrix columns do not match the configured asset list.
  #[error("asset mismatch: expected {expected:?}, got {actual:?}")]
  AssetMismatch {
    expected: Vec<String>,
    actual: Vec<String>,
  },
}

pub type Result<T> = std::result::Result<T, OptimizationError>;
