//! # Portfolio
//!
//! $$
//! \sigma_p^2 = \mathbf{w}^\top \Sigma \mathbf{w}
//! $$
//!
//! Mean-variance portfolio optimization: return statistics, Monte Carlo
//! frontier sampling and SLSQP Sharpe maximization.

pub mod data;
pub mod engine;
pub mod metrics;
pub mod monte_carlo;
pub mod optimizers;
pub mod slsqp;
pub mod types;

pub use data::DAILY_ANNUALIZATION;
pub use data::MONTHLY_ANNUALIZATION;
pub use data::PriceMatrix;
pub use data::ReturnsStatistics;
pub use data::log_returns;
pub use engine::EngineRun;
pub use engine::PortfolioEngine;
pub use engine::PortfolioEngineConfig;
pub use engine::PortfolioRequest;
pub use engine::StrategyKind;
pub use engine::persist_results;
pub use metrics::PortfolioMetrics;
pub use metrics::portfolio_return;
pub use metrics::portfolio_volatility;
pub use metrics::sharpe_ratio;
pub use monte_carlo::MonteCarloSampler;
pub use monte_carlo::SimplexSampling;
pub use monte_carlo::SimulationPopulation;
pub use monte_carlo::Trial;
pub use optimizers::AllocationStrategy;
pub use optimizers::ConstrainedObjective;
pub use optimizers::ConstrainedOptimizer;
pub use slsqp::SolverReport;
pub use types::AssetBound;
pub use types::BoundSet;
pub use types::OptimizationResult;
pub use types::OptimizerMethod;
