//! # Market Data
//!
//! Price sources that turn a symbol list and a date range into a
//! [`PriceMatrix`]. Gap handling happens here: the optimization core only
//! ever sees dense, date-ordered matrices.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::bail;
use chrono::NaiveDate;
use csv::ReaderBuilder;
use csv::Trim;
use tracing::debug;
use tracing::info;

use crate::portfolio::data::PriceMatrix;

const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%Y/%m/%d", "%d.%m.%Y", "%m/%d/%Y"];

/// Supplies closing prices for an ordered symbol list.
pub trait PriceSource {
  /// Closing prices of `symbols` (columns in the given order) on every date
  /// in `[start, end]`. Open ends mean "as far as the source goes".
  fn fetch(
    &self,
    symbols: &[String],
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
  ) -> anyhow::Result<PriceMatrix>;
}

/// Wide CSV file: a date column followed by one close column per symbol.
///
/// ```text
/// date,AAPL,MSFT,GOOG
/// 2024-01-02,185.64,370.87,138.17
/// ```
///
/// Empty cells are read as `NaN`; rows containing one are dropped later when
/// returns are computed.
#[derive(Clone, Debug)]
pub struct CsvPriceSource {
  path: PathBuf,
  delimiter: u8,
}

impl CsvPriceSource {
  /// Comma-delimited source reading `path`.
  pub fn new(path: impl AsRef<Path>) -> Self {
    Self {
      path: path.as_ref().to_path_buf(),
      delimiter: b',',
    }
  }

  /// Field delimiter, e.g. `b';'`.
  pub fn with_delimiter(mut self, delimiter: u8) -> Self {
    self.delimiter = delimiter;
    self
  }

  /// File the prices are read from.
  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl PriceSource for CsvPriceSource {
  fn fetch(
    &self,
    symbols: &[String],
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
  ) -> anyhow::Result<PriceMatrix> {
    info!(path = %self.path.display(), symbols = symbols.len(), "loading prices from csv");

    let mut reader = ReaderBuilder::new()
      .has_headers(true)
      .delimiter(self.delimiter)
      .trim(Trim::All)
      .from_path(&self.path)
      .with_context(|| format!("opening {}", self.path.display()))?;

    let headers = reader.headers()?.clone();
    let columns = symbols
      .iter()
      .map(|symbol| {
        headers
          .iter()
          .skip(1)
          .position(|h| h == symbol)
          .map(|i| i + 1)
          .with_context(|| format!("symbol {symbol} not found in {}", self.path.display()))
      })
      .collect::<anyhow::Result<Vec<usize>>>()?;

    let mut rows: BTreeMap<NaiveDate, Vec<f64>> = BTreeMap::new();
    let mut skipped = 0usize;
    for (line, record) in reader.records().enumerate() {
      let record = record.with_context(|| format!("reading row {}", line + 2))?;
      let raw_date = record.get(0).unwrap_or_default();
      let date = parse_date(raw_date).with_context(|| format!("row {}: bad date {raw_date:?}", line + 2))?;

      if start.is_some_and(|s| date < s) || end.is_some_and(|e| date > e) {
        skipped += 1;
        continue;
      }

      let closes = columns
        .iter()
        .zip(symbols)
        .map(|(&col, symbol)| {
          let cell = record.get(col).unwrap_or_default();
          if cell.is_empty() {
            return Ok(f64::NAN);
          }
          cell
            .parse::<f64>()
            .with_context(|| format!("row {}: bad price {cell:?} for {symbol}", line + 2))
        })
        .collect::<anyhow::Result<Vec<f64>>>()?;

      if rows.insert(date, closes).is_some() {
        bail!("{}: date {date} appears twice", self.path.display());
      }
    }

    debug!(kept = rows.len(), outside_range = skipped, "csv rows read");
    to_matrix(symbols, rows)
  }
}

fn parse_date(raw: &str) -> anyhow::Result<NaiveDate> {
  // datetime stamps are cut to their date part
  let date_part = raw.split(['T', ' ']).next().unwrap_or(raw);
  DATE_FORMATS
    .iter()
    .find_map(|fmt| NaiveDate::parse_from_str(date_part, fmt).ok())
    .with_context(|| format!("unrecognized date format {raw:?}"))
}

fn to_matrix(symbols: &[String], rows: BTreeMap<NaiveDate, Vec<f64>>) -> anyhow::Result<PriceMatrix> {
  let mut columns: Vec<(String, Vec<f64>)> = symbols
    .iter()
    .map(|s| (s.clone(), Vec::with_capacity(rows.len())))
    .collect();
  let mut dates = Vec::with_capacity(rows.len());

  for (date, closes) in rows {
    dates.push(date);
    for (column, close) in columns.iter_mut().zip(closes) {
      column.1.push(close);
    }
  }

  Ok(PriceMatrix::from_columns(dates, columns)?)
}

#[cfg(feature = "yahoo")]
pub use yahoo::YahooPriceSource;

#[cfg(feature = "yahoo")]
mod yahoo {
  use chrono::DateTime;
  use chrono::Days;
  use chrono::NaiveTime;
  use chrono::Utc;
  use time::OffsetDateTime;
  use yahoo_finance_api as yahoo;

  use super::*;

  /// Daily adjusted closes from Yahoo Finance, inner-joined on date.
  #[derive(Clone, Debug, Default)]
  pub struct YahooPriceSource {
    /// Look-back used when no start date is given.
    pub default_lookback_days: Option<u64>,
  }

  fn to_offset(date: NaiveDate) -> anyhow::Result<OffsetDateTime> {
    let secs = date.and_time(NaiveTime::MIN).and_utc().timestamp();
    Ok(OffsetDateTime::from_unix_timestamp(secs)?)
  }

  impl PriceSource for YahooPriceSource {
    fn fetch(
      &self,
      symbols: &[String],
      start: Option<NaiveDate>,
      end: Option<NaiveDate>,
    ) -> anyhow::Result<PriceMatrix> {
      let end = end.unwrap_or_else(|| Utc::now().date_naive());
      let lookback = self.default_lookback_days.unwrap_or(730);
      let start = match start {
        Some(s) => s,
        None => end
          .checked_sub_days(Days::new(lookback))
          .context("look-back reaches before the calendar start")?,
      };
      // the upper bound is exclusive on the provider side
      let (from, to) = (to_offset(start)?, to_offset(end + Days::new(1))?);

      let provider = yahoo::YahooConnector::new()?;
      let mut joined: BTreeMap<NaiveDate, Vec<f64>> = BTreeMap::new();

      for (j, symbol) in symbols.iter().enumerate() {
        let response = tokio_test::block_on(provider.get_quote_history(symbol, from, to))
          .with_context(|| format!("downloading {symbol}"))?;
        let quotes = response
          .quotes()
          .with_context(|| format!("decoding quotes for {symbol}"))?;
        debug!(symbol = %symbol, quotes = quotes.len(), "quotes downloaded");

        let mut seen = BTreeMap::new();
        for quote in quotes {
          let date = DateTime::from_timestamp(quote.timestamp as i64, 0)
            .context("quote timestamp out of range")?
            .date_naive();
          seen.insert(date, quote.adjclose);
        }

        if j == 0 {
          joined = seen.into_iter().map(|(d, c)| (d, vec![c])).collect();
        } else {
          joined.retain(|d, _| seen.contains_key(d));
          for (date, closes) in joined.iter_mut() {
            if let Some(close) = seen.get(date) {
              closes.push(*close);
            }
          }
        }
      }

      info!(symbols = symbols.len(), dates = joined.len(), "yahoo prices joined");
      to_matrix(symbols, joined)
    }
  }
}
