//! # markowitz-rs
//!
//! $$
//! \max_{\mathbf w}\ \frac{\mathbf w^\top\mu - r_f}{\sqrt{\mathbf w^\top\Sigma\mathbf w}}
//! \quad\text{s.t.}\quad \textstyle\sum_i w_i = 1,\ l_i\le w_i\le u_i
//! $$
//!
//! Mean-variance portfolio optimization over historical closing prices.
//! [`portfolio`] holds the computation-only core; [`market`], [`store`],
//! [`report`] and [`config`] are the I/O collaborators around it.

pub mod config;
pub mod error;
pub mod market;
pub mod portfolio;
pub mod report;
pub mod store;

pub use error::OptimizationError;
