//! # Result Store
//!
//! Persistence of optimization results. The engine hands each emitted
//! [`OptimizationResult`] to a [`ResultStore`] exactly once; stores never
//! reach back into the optimization core.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use crate::portfolio::types::OptimizationResult;
use crate::portfolio::types::OptimizerMethod;

/// Sink for completed strategy runs.
pub trait ResultStore {
  fn save(&mut self, portfolio_id: &str, result: &OptimizationResult) -> anyhow::Result<()>;
}

/// One stored result. Weights are kept as a plain list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedResult {
  pub portfolio_id: String,
  pub method: OptimizerMethod,
  pub weights: Vec<f64>,
  pub expected_return: f64,
  pub volatility: f64,
  pub sharpe: Option<f64>,
  pub recorded_at: DateTime<Utc>,
}

impl PersistedResult {
  /// Snapshot `result` under `portfolio_id`, stamped now.
  pub fn new(portfolio_id: &str, result: &OptimizationResult) -> Self {
    Self {
      portfolio_id: portfolio_id.to_string(),
      method: result.method,
      weights: result.weights.clone(),
      expected_return: result.expected_return,
      volatility: result.volatility,
      sharpe: result.sharpe,
      recorded_at: Utc::now(),
    }
  }

  /// Back to the in-memory result type.
  pub fn to_result(&self) -> OptimizationResult {
    OptimizationResult {
      method: self.method,
      weights: self.weights.clone(),
      expected_return: self.expected_return,
      volatility: self.volatility,
      sharpe: self.sharpe,
    }
  }
}

/// Keeps everything in a `Vec`; useful for tests and dry runs.
#[derive(Clone, Debug, Default)]
pub struct InMemoryStore {
  records: Vec<PersistedResult>,
}

impl InMemoryStore {
  /// Empty store.
  pub fn new() -> Self {
    Self::default()
  }

  /// Every saved record, in save order.
  pub fn records(&self) -> &[PersistedResult] {
    &self.records
  }

  /// Records saved under `portfolio_id`.
  pub fn for_portfolio<'a>(&'a self, portfolio_id: &'a str) -> impl Iterator<Item = &'a PersistedResult> + 'a {
    self
      .records
      .iter()
      .filter(move |r| r.portfolio_id == portfolio_id)
  }
}

impl ResultStore for InMemoryStore {
  fn save(&mut self, portfolio_id: &str, result: &OptimizationResult) -> anyhow::Result<()> {
    self.records.push(PersistedResult::new(portfolio_id, result));
    Ok(())
  }
}

/// Append-only file with one JSON object per line.
#[derive(Clone, Debug)]
pub struct JsonLinesStore {
  path: PathBuf,
}

impl JsonLinesStore {
  /// The file is created on first save; parent directories are created eagerly.
  pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
    let path = path.as_ref().to_path_buf();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent)
        .with_context(|| format!("creating store directory {}", parent.display()))?;
    }
    Ok(Self { path })
  }

  /// Backing file.
  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Every record in the file, in write order. A missing file reads as empty.
  pub fn load(&self) -> anyhow::Result<Vec<PersistedResult>> {
    if !self.path.exists() {
      return Ok(Vec::new());
    }
    let file = File::open(&self.path).with_context(|| format!("opening {}", self.path.display()))?;

    let mut records = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
      let line = line.with_context(|| format!("reading {}", self.path.display()))?;
      if line.trim().is_empty() {
        continue;
      }
      let record: PersistedResult = serde_json::from_str(&line)
        .with_context(|| format!("{}:{}: malformed record", self.path.display(), lineno + 1))?;
      records.push(record);
    }
    Ok(records)
  }

  /// Records of one portfolio, in write order.
  pub fn load_portfolio(&self, portfolio_id: &str) -> anyhow::Result<Vec<PersistedResult>> {
    Ok(
      self
        .load()?
        .into_iter()
        .filter(|r| r.portfolio_id == portfolio_id)
        .collect(),
    )
  }
}

impl ResultStore for JsonLinesStore {
  fn save(&mut self, portfolio_id: &str, result: &OptimizationResult) -> anyhow::Result<()> {
    let record = PersistedResult::new(portfolio_id, result);
    let mut line = serde_json::to_string(&record)?;
    line.push('\n');

    let mut file = OpenOptions::new()
      .create(true)
      .append(true)
      .open(&self.path)
      .with_context(|| format!("opening {} for append", self.path.display()))?;
    file
      .write_all(line.as_bytes())
      .with_context(|| format!("writing to {}", self.path.display()))?;

    debug!(portfolio_id, method = %result.method, path = %self.path.display(), "result persisted");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn result(method: OptimizerMethod, weights: Vec<f64>) -> OptimizationResult {
    OptimizationResult {
      method,
      weights,
      expected_return: 0.11,
      volatility: 0.18,
      sharpe: Some(0.11 / 0.18),
    }
  }

  #[test]
  fn json_lines_store_reads_back_what_it_wrote() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = JsonLinesStore::open(dir.path().join("nested").join("results.jsonl")).unwrap();

    let first = result(OptimizerMethod::MonteCarloMaxSharpe, vec![0.2, 0.3, 0.5]);
    let second = result(OptimizerMethod::SlsqpMaxSharpe, vec![0.25, 0.25, 0.5]);
    store.save("client-1", &first).unwrap();
    store.save("client-2", &second).unwrap();

    let records = store.load().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].to_result(), first);
    assert_eq!(records[1].portfolio_id, "client-2");

    let client_two = store.load_portfolio("client-2").unwrap();
    assert_eq!(client_two.len(), 1);
    assert_eq!(client_two[0].to_result(), second);
  }

  #[test]
  fn weights_are_stored_as_a_json_list() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("results.jsonl");
    let mut store = JsonLinesStore::open(&path).unwrap();
    store
      .save("p", &result(OptimizerMethod::SlsqpMinVolatility, vec![0.5, 0.5]))
      .unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let value: serde_json::Value = serde_json::from_str(raw.trim()).unwrap();
    assert_eq!(value["weights"], serde_json::json!([0.5, 0.5]));
    assert_eq!(value["method"], "slsqp-min-volatility");
  }

  #[test]
  fn missing_file_loads_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonLinesStore::open(dir.path().join("absent.jsonl")).unwrap();
    assert!(store.load().unwrap().is_empty());
  }

  #[test]
  fn malformed_line_is_reported_with_position() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("results.jsonl");
    std::fs::write(&path, "{not json}\n").unwrap();

    let err = JsonLinesStore::open(&path).unwrap().load().unwrap_err();
    assert!(format!("{err:#}").contains(":1: malformed record"));
  }

  #[test]
  fn in_memory_store_filters_by_portfolio() {
    let mut store = InMemoryStore::new();
    store
      .save("a", &result(OptimizerMethod::MonteCarloMaxSharpe, vec![1.0]))
      .unwrap();
    store
      .save("b", &result(OptimizerMethod::MonteCarloMinVolatility, vec![1.0]))
      .unwrap();

    assert_eq!(store.records().len(), 2);
    assert_eq!(store.for_portfolio("b").count(), 1);
  }
}
