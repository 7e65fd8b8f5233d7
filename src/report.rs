//! # Report
//!
//! Terminal tables and HTML frontier charts for optimization results.

use std::path::Path;

use anyhow::Context;
use plotly::Layout;
use plotly::Plot;
use plotly::Scatter;
use plotly::common::Line;
use plotly::common::Marker;
use plotly::common::Mode;
use plotly::layout::Axis;
use prettytable::Cell;
use prettytable::Row;
use prettytable::Table;
use prettytable::format::consts::FORMAT_BOX_CHARS;

use crate::portfolio::monte_carlo::SimulationPopulation;
use crate::portfolio::types::OptimizationResult;

/// One row per result: method, return, volatility, Sharpe, then one weight column per asset.
pub fn results_table(symbols: &[String], results: &[OptimizationResult]) -> Table {
  let mut table = Table::new();
  table.set_format(*FORMAT_BOX_CHARS);

  let mut titles = vec![
    Cell::new("Method"),
    Cell::new("Return"),
    Cell::new("Volatility"),
    Cell::new("Sharpe"),
  ];
  titles.extend(symbols.iter().map(|s| Cell::new(s)));
  table.set_titles(Row::new(titles));

  for result in results {
    let sharpe = result
      .sharpe
      .map_or_else(|| "n/a".to_string(), |s| format!("{s:.4}"));
    let mut cells = vec![
      Cell::new(result.method.name()),
      Cell::new(&format!("{:.4}", result.expected_return)),
      Cell::new(&format!("{:.4}", result.volatility)),
      Cell::new(&sharpe),
    ];
    cells.extend(
      result
        .weights
        .iter()
        .map(|w| Cell::new(&format!("{:.2}%", w * 100.0))),
    );
    table.add_row(Row::new(cells));
  }

  table
}

/// Risk/return scatter of every trial with the frontier and selected results on top.
pub fn frontier_plot(population: &SimulationPopulation, selected: &[OptimizationResult]) -> Plot {
  let trials = population.trials();
  let hover: Vec<String> = trials
    .iter()
    .map(|t| match t.sharpe {
      Some(s) => format!("sharpe: {s:.4}"),
      None => "sharpe: n/a".to_string(),
    })
    .collect();

  let cloud = Scatter::new(
    trials.iter().map(|t| t.volatility).collect::<Vec<f64>>(),
    trials.iter().map(|t| t.expected_return).collect::<Vec<f64>>(),
  )
  .mode(Mode::Markers)
  .marker(Marker::new().size(3).color("rgba(31,119,180,0.35)"))
  .name("Trials")
  .hover_text_array(hover);

  let frontier = population.efficient_frontier();
  let frontier = Scatter::new(
    frontier.iter().map(|t| t.volatility).collect::<Vec<f64>>(),
    frontier.iter().map(|t| t.expected_return).collect::<Vec<f64>>(),
  )
  .mode(Mode::Lines)
  .line(Line::new().width(2.0).color("rgb(214,39,40)"))
  .name("Efficient frontier");

  let mut plot = Plot::new();
  plot.set_layout(
    Layout::new()
      .title("Mean-variance frontier")
      .x_axis(Axis::new().title("Volatility"))
      .y_axis(Axis::new().title("Expected return")),
  );
  plot.add_trace(cloud);
  plot.add_trace(frontier);

  for result in selected {
    let point = Scatter::new(vec![result.volatility], vec![result.expected_return])
      .mode(Mode::Markers)
      .marker(Marker::new().size(12))
      .name(result.method.name());
    plot.add_trace(point);
  }

  plot
}

/// Write [`frontier_plot`] as a standalone HTML file.
pub fn write_frontier_html(
  path: impl AsRef<Path>,
  population: &SimulationPopulation,
  selected: &[OptimizationResult],
) -> anyhow::Result<()> {
  let path = path.as_ref();
  let html = frontier_plot(population, selected).to_html();
  std::fs::write(path, html).with_context(|| format!("writing frontier chart to {}", path.display()))
}

#[cfg(test)]
mod tests {
  use ndarray::array;

  use super::*;
  use crate::portfolio::data::ReturnsStatistics;
  use crate::portfolio::monte_carlo::MonteCarloSampler;
  use crate::portfolio::monte_carlo::select;
  use crate::portfolio::types::OptimizerMethod;

  fn symbols() -> Vec<String> {
    vec!["AAPL".to_string(), "MSFT".to_string()]
  }

  #[test]
  fn table_has_one_row_per_result() {
    let results = vec![
      OptimizationResult {
        method: OptimizerMethod::SlsqpMaxSharpe,
        weights: vec![0.6, 0.4],
        expected_return: 0.12,
        volatility: 0.2,
        sharpe: Some(0.6),
      },
      OptimizationResult {
        method: OptimizerMethod::MonteCarloMinVolatility,
        weights: vec![0.5, 0.5],
        expected_return: 0.0,
        volatility: 0.0,
        sharpe: None,
      },
    ];
    let table = results_table(&symbols(), &results);

    assert_eq!(table.len(), 2);
    let first = table.get_row(0).unwrap();
    assert_eq!(first.get_cell(0).unwrap().get_content(), "slsqp-max-sharpe");
    assert_eq!(first.get_cell(4).unwrap().get_content(), "60.00%");
    let second = table.get_row(1).unwrap();
    assert_eq!(second.get_cell(3).unwrap().get_content(), "n/a");
    assert!(table.to_string().contains("MSFT"));
  }

  #[test]
  fn frontier_chart_is_written_as_html() {
    let stats = ReturnsStatistics::from_moments(
      symbols(),
      array![0.1, 0.15],
      array![[0.04, 0.01], [0.01, 0.09]],
      252.0,
    )
    .unwrap();
    let population = MonteCarloSampler::new(200, Some(3)).unwrap().sample(&stats).unwrap();
    let selected = select(&population).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frontier.html");
    write_frontier_html(&path, &population, &selected).unwrap();

    let html = std::fs::read_to_string(&path).unwrap();
    assert!(html.contains("Efficient frontier"));
    assert!(html.contains("monte-carlo-max-sharpe"));
  }
}
