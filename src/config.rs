//! # Run Configuration
//!
//! TOML file support for optimization runs. Every field has a default, so a
//! file only needs to name what differs; command-line flags override file
//! values afterwards.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use chrono::NaiveDate;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;

use crate::portfolio::data::DAILY_ANNUALIZATION;
use crate::portfolio::engine::PortfolioEngineConfig;
use crate::portfolio::engine::StrategyKind;
use crate::portfolio::monte_carlo::DEFAULT_TRIALS;
use crate::portfolio::monte_carlo::SimplexSampling;
use crate::portfolio::optimizers::ConstrainedObjective;
use crate::portfolio::slsqp::DEFAULT_FTOL;
use crate::portfolio::slsqp::DEFAULT_MAX_ITERS;

/// Complete run configuration as read from a file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
  #[serde(default)]
  pub portfolio: PortfolioSettings,
  #[serde(default)]
  pub engine: EngineSettings,
  #[serde(default)]
  pub data: DataSettings,
  #[serde(default)]
  pub output: OutputSettings,
}

/// Which assets to optimize and how far each may go.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSettings {
  /// Identifier results are stored under.
  #[serde(default)]
  pub id: Option<String>,
  #[serde(default)]
  pub symbols: Vec<String>,
  #[serde(default)]
  pub bounds: BTreeMap<String, BoundSetting>,
}

/// `{ min = .., max = .. }`, each side defaulting to the unit interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundSetting {
  #[serde(default)]
  pub min: f64,
  #[serde(default = "default_max_weight")]
  pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
  #[serde(default = "default_annualization")]
  pub annualization_factor: f64,
  #[serde(default = "default_trials")]
  pub trials: usize,
  #[serde(default)]
  pub seed: Option<u64>,
  #[serde(default)]
  pub sampling: SimplexSampling,
  #[serde(default = "default_max_iterations")]
  pub max_iterations: u64,
  #[serde(default = "default_ftol")]
  pub ftol: f64,
  #[serde(default)]
  pub risk_free: f64,
  #[serde(default)]
  pub objective: ConstrainedObjective,
  #[serde(default = "default_strategies")]
  pub strategies: Vec<StrategyKind>,
}

impl Default for EngineSettings {
  fn default() -> Self {
    Self {
      annualization_factor: default_annualization(),
      trials: default_trials(),
      seed: None,
      sampling: SimplexSampling::default(),
      max_iterations: default_max_iterations(),
      ftol: default_ftol(),
      risk_free: 0.0,
      objective: ConstrainedObjective::default(),
      strategies: default_strategies(),
    }
  }
}

/// Where prices come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataSourceKind {
  #[default]
  Csv,
  Yahoo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSettings {
  #[serde(default)]
  pub source: DataSourceKind,
  /// Wide price CSV, required for the csv source.
  #[serde(default)]
  pub prices: Option<PathBuf>,
  /// Inclusive range, written as quoted `"YYYY-MM-DD"` strings.
  #[serde(default)]
  pub start: Option<NaiveDate>,
  #[serde(default)]
  pub end: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputSettings {
  /// JSON-lines result store.
  #[serde(default)]
  pub store: Option<PathBuf>,
  /// HTML frontier chart.
  #[serde(default)]
  pub frontier: Option<PathBuf>,
}

fn default_max_weight() -> f64 {
  1.0
}

fn default_annualization() -> f64 {
  DAILY_ANNUALIZATION
}

fn default_trials() -> usize {
  DEFAULT_TRIALS
}

fn default_max_iterations() -> u64 {
  DEFAULT_MAX_ITERS
}

fn default_ftol() -> f64 {
  DEFAULT_FTOL
}

fn default_strategies() -> Vec<StrategyKind> {
  vec![StrategyKind::MonteCarlo, StrategyKind::Slsqp]
}

impl RunConfig {
  /// Load configuration from a TOML file.
  pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
    let path = path.as_ref();
    info!(path = %path.display(), "loading configuration");

    let content =
      std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Self::from_toml(&content).with_context(|| format!("parsing {}", path.display()))
  }

  /// Parse configuration from TOML text.
  pub fn from_toml(content: &str) -> anyhow::Result<Self> {
    Ok(toml::from_str(content)?)
  }

  /// Engine configuration; bounds are validated later by the engine itself.
  pub fn to_engine_config(&self) -> PortfolioEngineConfig {
    let e = &self.engine;
    PortfolioEngineConfig {
      annualization_factor: e.annualization_factor,
      trials: e.trials,
      seed: e.seed,
      sampling: e.sampling,
      bounds: self
        .portfolio
        .bounds
        .iter()
        .map(|(symbol, b)| (symbol.clone(), (b.min, b.max)))
        .collect(),
      max_iterations: e.max_iterations,
      ftol: e.ftol,
      risk_free: e.risk_free,
      objective: e.objective,
      strategies: e.strategies.clone(),
    }
  }

  /// Commented example file.
  pub fn example() -> &'static str {
    r#"# markowitz run configuration

[portfolio]
id = "client-1"
symbols = ["AAPL", "MSFT", "GOOG"]

[portfolio.bounds]
GOOG = { min = 0.05, max = 0.4 }

[engine]
annualization_factor = 252.0
trials = 10000
# seed = 42
sampling = "normalized-uniform"   # or "flat-dirichlet"
max_iterations = 100
risk_free = 0.0
objective = "max-sharpe"          # or "min-volatility"
strategies = ["monte-carlo", "slsqp"]

[data]
source = "csv"
prices = "data/prices.csv"
# start = "2023-01-01"
# end = "2024-12-31"

[output]
# store = "results.jsonl"
# frontier = "frontier.html"
"#
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn example_parses() {
    let config = RunConfig::from_toml(RunConfig::example()).unwrap();

    assert_eq!(config.portfolio.symbols, vec!["AAPL", "MSFT", "GOOG"]);
    assert_eq!(config.portfolio.id.as_deref(), Some("client-1"));
    assert_eq!(
      config.portfolio.bounds["GOOG"],
      BoundSetting { min: 0.05, max: 0.4 }
    );
    assert_eq!(config.engine.sampling, SimplexSampling::NormalizedUniform);
    assert_eq!(config.data.prices, Some(PathBuf::from("data/prices.csv")));
    assert!(config.output.store.is_none());
  }

  #[test]
  fn empty_file_gives_defaults() {
    let config = RunConfig::from_toml("").unwrap();
    assert_eq!(config, RunConfig::default());

    let engine = config.to_engine_config();
    assert_eq!(engine.annualization_factor, 252.0);
    assert_eq!(engine.trials, 10_000);
    assert_eq!(engine.max_iterations, 100);
    assert_eq!(engine.strategies, vec![StrategyKind::MonteCarlo, StrategyKind::Slsqp]);
  }

  #[test]
  fn partial_bounds_and_dates_are_filled_in() {
    let config = RunConfig::from_toml(
      r#"
[portfolio]
symbols = ["A", "B"]
bounds = { B = { max = 0.3 } }

[engine]
sampling = "flat-dirichlet"
objective = "min-volatility"
strategies = ["slsqp"]

[data]
start = "2024-01-02"
"#,
    )
    .unwrap();

    let engine = config.to_engine_config();
    assert_eq!(engine.bounds["B"], (0.0, 0.3));
    assert_eq!(engine.sampling, SimplexSampling::FlatDirichlet);
    assert_eq!(engine.objective, ConstrainedObjective::MinVolatility);
    assert_eq!(engine.strategies, vec![StrategyKind::Slsqp]);
    assert_eq!(config.data.start, NaiveDate::from_ymd_opt(2024, 1, 2));
  }

  #[test]
  fn unknown_strategy_is_rejected() {
    assert!(RunConfig::from_toml("[engine]\nstrategies = [\"genetic\"]\n").is_err());
  }

  #[test]
  fn load_reports_the_path() {
    let err = RunConfig::load("/nonexistent/markowitz.toml").unwrap_err();
    assert!(format!("{err:#}").contains("/nonexistent/markowitz.toml"));
  }
}
