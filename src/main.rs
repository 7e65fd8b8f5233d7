//! `markowitz` command-line front end.

use std::path::PathBuf;

use anyhow::Context;
use anyhow::bail;
use chrono::NaiveDate;
use clap::Parser;
use clap::ValueEnum;
use markowitz_rs::config::DataSourceKind;
use markowitz_rs::config::RunConfig;
use markowitz_rs::market::CsvPriceSource;
use markowitz_rs::market::PriceSource;
use markowitz_rs::portfolio::ConstrainedObjective;
use markowitz_rs::portfolio::PortfolioEngine;
use markowitz_rs::portfolio::SimplexSampling;
use markowitz_rs::portfolio::StrategyKind;
use markowitz_rs::portfolio::persist_results;
use markowitz_rs::report::results_table;
use markowitz_rs::report::write_frontier_html;
use markowitz_rs::store::JsonLinesStore;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Mean-variance portfolio optimization from historical closing prices.
#[derive(Parser, Debug)]
#[command(name = "markowitz", version, about, long_about = None)]
struct Cli {
  /// TOML run configuration; flags below override its values
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Wide price CSV (date column, then one close column per symbol)
  #[arg(short, long)]
  prices: Option<PathBuf>,

  /// Price source
  #[arg(long, value_enum)]
  source: Option<SourceArg>,

  /// Comma-separated asset symbols, in output order
  #[arg(short, long, value_delimiter = ',')]
  symbols: Vec<String>,

  /// First date to include (YYYY-MM-DD)
  #[arg(long)]
  start: Option<NaiveDate>,

  /// Last date to include (YYYY-MM-DD)
  #[arg(long)]
  end: Option<NaiveDate>,

  /// Monte Carlo trial count
  #[arg(short, long)]
  trials: Option<usize>,

  /// Seed for reproducible sampling
  #[arg(long)]
  seed: Option<u64>,

  /// Return periods per year
  #[arg(long)]
  annualization: Option<f64>,

  /// Per-asset weight bound, SYM=MIN:MAX (repeatable)
  #[arg(long = "bound", value_parser = parse_bound)]
  bounds: Vec<(String, (f64, f64))>,

  /// SLSQP iteration cap
  #[arg(long)]
  max_iter: Option<u64>,

  /// Strategy to run (repeatable, in output order)
  #[arg(long, value_enum)]
  strategy: Vec<StrategyArg>,

  /// Simplex sampling scheme for Monte Carlo trials
  #[arg(long, value_enum)]
  sampling: Option<SamplingArg>,

  /// SLSQP objective
  #[arg(long, value_enum)]
  objective: Option<ObjectiveArg>,

  /// Annualized risk-free rate
  #[arg(long)]
  risk_free: Option<f64>,

  /// Append results to this JSON-lines store
  #[arg(long)]
  store: Option<PathBuf>,

  /// Identifier results are stored under
  #[arg(long)]
  portfolio_id: Option<String>,

  /// Write the sampled frontier as an HTML chart
  #[arg(long)]
  frontier: Option<PathBuf>,

  /// Print an example configuration file and exit
  #[arg(long)]
  example_config: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StrategyArg {
  MonteCarlo,
  Slsqp,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SamplingArg {
  NormalizedUniform,
  FlatDirichlet,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ObjectiveArg {
  MaxSharpe,
  MinVolatility,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SourceArg {
  Csv,
  Yahoo,
}

fn parse_bound(raw: &str) -> Result<(String, (f64, f64)), String> {
  let (symbol, range) = raw
    .split_once('=')
    .ok_or_else(|| format!("expected SYM=MIN:MAX, got {raw:?}"))?;
  let (min, max) = range
    .split_once(':')
    .ok_or_else(|| format!("expected MIN:MAX after '=', got {range:?}"))?;
  let min = min.trim().parse::<f64>().map_err(|e| format!("bad minimum {min:?}: {e}"))?;
  let max = max.trim().parse::<f64>().map_err(|e| format!("bad maximum {max:?}: {e}"))?;
  Ok((symbol.trim().to_string(), (min, max)))
}

impl Cli {
  /// Fold command-line overrides into the file configuration.
  fn merge_into(&self, config: &mut RunConfig) {
    if !self.symbols.is_empty() {
      config.portfolio.symbols = self.symbols.clone();
    }
    if let Some(id) = &self.portfolio_id {
      config.portfolio.id = Some(id.clone());
    }
    if let Some(prices) = &self.prices {
      config.data.prices = Some(prices.clone());
    }
    if let Some(source) = self.source {
      config.data.source = match source {
        SourceArg::Csv => DataSourceKind::Csv,
        SourceArg::Yahoo => DataSourceKind::Yahoo,
      };
    }
    if self.start.is_some() {
      config.data.start = self.start;
    }
    if self.end.is_some() {
      config.data.end = self.end;
    }

    let engine = &mut config.engine;
    if let Some(trials) = self.trials {
      engine.trials = trials;
    }
    if self.seed.is_some() {
      engine.seed = self.seed;
    }
    if let Some(factor) = self.annualization {
      engine.annualization_factor = factor;
    }
    if let Some(max_iter) = self.max_iter {
      engine.max_iterations = max_iter;
    }
    if let Some(risk_free) = self.risk_free {
      engine.risk_free = risk_free;
    }
    if let Some(sampling) = self.sampling {
      engine.sampling = match sampling {
        SamplingArg::NormalizedUniform => SimplexSampling::NormalizedUniform,
        SamplingArg::FlatDirichlet => SimplexSampling::FlatDirichlet,
      };
    }
    if let Some(objective) = self.objective {
      engine.objective = match objective {
        ObjectiveArg::MaxSharpe => ConstrainedObjective::MaxSharpe,
        ObjectiveArg::MinVolatility => ConstrainedObjective::MinVolatility,
      };
    }
    if !self.strategy.is_empty() {
      engine.strategies = self
        .strategy
        .iter()
        .map(|s| match s {
          StrategyArg::MonteCarlo => StrategyKind::MonteCarlo,
          StrategyArg::Slsqp => StrategyKind::Slsqp,
        })
        .collect();
    }

    for (symbol, (min, max)) in &self.bounds {
      config.portfolio.bounds.insert(
        symbol.clone(),
        markowitz_rs::config::BoundSetting {
          min: *min,
          max: *max,
        },
      );
    }

    if let Some(store) = &self.store {
      config.output.store = Some(store.clone());
    }
    if let Some(frontier) = &self.frontier {
      config.output.frontier = Some(frontier.clone());
    }
  }
}

fn price_source(config: &RunConfig) -> anyhow::Result<Box<dyn PriceSource>> {
  match config.data.source {
    DataSourceKind::Csv => {
      let path = config
        .data
        .prices
        .as_ref()
        .context("a price file is required for the csv source (--prices)")?;
      Ok(Box::new(CsvPriceSource::new(path)))
    }
    #[cfg(feature = "yahoo")]
    DataSourceKind::Yahoo => Ok(Box::new(markowitz_rs::market::YahooPriceSource::default())),
    #[cfg(not(feature = "yahoo"))]
    DataSourceKind::Yahoo => bail!("the yahoo source needs a build with the `yahoo` feature"),
  }
}

fn main() -> anyhow::Result<()> {
  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
    .with(tracing_subscriber::fmt::layer().with_target(false))
    .init();

  let cli = Cli::parse();
  if cli.example_config {
    print!("{}", RunConfig::example());
    return Ok(());
  }

  let mut config = match &cli.config {
    Some(path) => RunConfig::load(path)?,
    None => RunConfig::default(),
  };
  cli.merge_into(&mut config);

  let symbols = config.portfolio.symbols.clone();
  if symbols.is_empty() {
    bail!("no symbols given (--symbols or [portfolio].symbols)");
  }

  let engine = PortfolioEngine::new(symbols.clone(), config.to_engine_config())?;
  let prices = price_source(&config)?.fetch(&symbols, config.data.start, config.data.end)?;
  info!(
    periods = prices.n_periods(),
    first = ?prices.dates().first(),
    last = ?prices.dates().last(),
    "prices loaded"
  );

  let run = engine.run_detailed(&prices)?;
  results_table(engine.symbols(), &run.results).printstd();

  if let Some(path) = &config.output.store {
    let id = config
      .portfolio
      .id
      .as_deref()
      .context("--portfolio-id is required when storing results")?;
    let mut store = JsonLinesStore::open(path)?;
    persist_results(id, &run.results, &mut store)?;
  }

  if let Some(path) = &config.output.frontier {
    match &run.population {
      Some(population) => {
        write_frontier_html(path, population, &run.results)?;
        info!(path = %path.display(), "frontier chart written");
      }
      None => warn!("frontier chart skipped: the monte-carlo strategy did not run"),
    }
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn bound_flag_parses() {
    assert_eq!(
      parse_bound("GOOG=0.05:0.4").unwrap(),
      ("GOOG".to_string(), (0.05, 0.4))
    );
    assert!(parse_bound("GOOG=0.4").is_err());
    assert!(parse_bound("GOOG").is_err());
  }

  #[test]
  fn flags_override_file_values() {
    let cli = Cli::parse_from([
      "markowitz",
      "--symbols",
      "A,B",
      "--trials",
      "500",
      "--bound",
      "B=0:0.3",
      "--strategy",
      "slsqp",
      "--objective",
      "min-volatility",
    ]);
    let mut config = RunConfig::from_toml("[engine]\ntrials = 20000\nseed = 9\n").unwrap();
    cli.merge_into(&mut config);

    assert_eq!(config.portfolio.symbols, vec!["A", "B"]);
    assert_eq!(config.engine.trials, 500);
    assert_eq!(config.engine.seed, Some(9));
    assert_eq!(config.engine.strategies, vec![StrategyKind::Slsqp]);
    assert_eq!(config.engine.objective, ConstrainedObjective::MinVolatility);
    assert_eq!(config.to_engine_config().bounds["B"], (0.0, 0.3));
  }
}
