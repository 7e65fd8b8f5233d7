//! # SLSQP
//!
//! $$
//! \min_{\mathbf{x}} f(\mathbf{x})\quad\text{s.t.}\quad
//! \mathbf{a}^\top\mathbf{x} = b,\qquad \mathbf{l}\le\mathbf{x}\le\mathbf{u}
//! $$
//!
//! Sequential quadratic programming for smooth objectives under one linear
//! equality constraint and box bounds. Each iteration solves
//!
//! $$
//! \min_{\mathbf d}\ \tfrac12\mathbf d^\top B\mathbf d + \nabla f^\top\mathbf d
//! \quad\text{s.t.}\quad \mathbf a^\top\mathbf d = 0,\ \mathbf l-\mathbf x\le\mathbf d\le\mathbf u-\mathbf x
//! $$
//!
//! with a primal active-set method, backtracks along `d` on `f`, and updates
//! `B` with Powell-damped BFGS. Because the constraints are linear every
//! iterate stays feasible, so `f` itself serves as the merit function.
//!
//! [`Slsqp`] is an argmin [`Solver`]: [`Slsqp::minimize`] drives it with an
//! [`Executor`] over any [`CostFunction`] + [`Gradient`] problem. Convergence
//! is to a local minimum only.

use argmin::core::CostFunction;
use argmin::core::Error;
use argmin::core::Executor;
use argmin::core::Gradient;
use argmin::core::IterState;
use argmin::core::KV;
use argmin::core::Problem;
use argmin::core::Solver;
use argmin::core::State;
use argmin::core::TerminationReason;
use argmin::core::TerminationStatus;
use nalgebra::DMatrix;
use nalgebra::DVector;
use tracing::debug;

use crate::error::OptimizationError;
use crate::error::Result;

/// Default cap on outer iterations.
pub const DEFAULT_MAX_ITERS: u64 = 100;
/// Default objective tolerance.
pub const DEFAULT_FTOL: f64 = 1e-10;

const ARMIJO: f64 = 1e-4;
const MAX_BACKTRACKS: usize = 40;
const STEP_EPS: f64 = 1e-12;

pub(crate) const MSG_SUCCESS: &str = "Optimization terminated successfully";
pub(crate) const MSG_ITER_LIMIT: &str = "Iteration limit reached";
pub(crate) const MSG_LINESEARCH: &str = "Positive directional derivative for linesearch";
pub(crate) const MSG_INCOMPATIBLE: &str = "Inequality constraints incompatible";
pub(crate) const MSG_SINGULAR: &str = "Singular matrix C in LSQ subproblem";

/// Executor state: parameter and gradient vectors, scalar cost.
type SqpState = IterState<Vec<f64>, Vec<f64>, (), (), (), f64>;

/// `aᵗx = b`.
#[derive(Clone, Debug, PartialEq)]
pub struct LinearEquality {
  pub coefficients: Vec<f64>,
  pub rhs: f64,
}

impl LinearEquality {
  /// `Σ xᵢ = 1`.
  pub fn budget(n: usize) -> Self {
    Self {
      coefficients: vec![1.0; n],
      rhs: 1.0,
    }
  }

  fn residual(&self, x: &[f64]) -> f64 {
    dot(&self.coefficients, x) - self.rhs
  }
}

/// Outcome of [`Slsqp::minimize`].
#[derive(Clone, Debug, PartialEq)]
pub struct SolverReport {
  /// Final iterate.
  pub x: Vec<f64>,
  /// Objective at `x`.
  pub fun: f64,
  pub iterations: u64,
  /// Objective evaluations, line search included.
  pub evaluations: u64,
  /// Gradient evaluations.
  pub gradient_evaluations: u64,
  pub success: bool,
  pub message: String,
}

/// How a run stopped before the iteration cap.
#[derive(Clone, Debug, PartialEq)]
enum Exit {
  Converged,
  Failed(String),
}

/// SQP solver for box bounds plus one linear equality.
///
/// Besides its configuration it carries the quasi-Newton model and the
/// counters of the run it is driving.
#[derive(Clone, Debug)]
pub struct Slsqp {
  lower: Vec<f64>,
  upper: Vec<f64>,
  equality: LinearEquality,
  max_iters: u64,
  ftol: f64,
  hessian: Option<DMatrix<f64>>,
  exit: Option<Exit>,
  evaluations: u64,
  gradient_evaluations: u64,
}

impl Slsqp {
  /// Solver for `lower ≤ x ≤ upper`, `equality`; all three must have the same length.
  pub fn new(lower: Vec<f64>, upper: Vec<f64>, equality: LinearEquality) -> Result<Self> {
    let n = lower.len();
    if upper.len() != n || equality.coefficients.len() != n {
      return Err(OptimizationError::InvalidBound(format!(
        "{n} lower bounds, {} upper bounds and {} constraint coefficients",
        upper.len(),
        equality.coefficients.len()
      )));
    }
    if equality.coefficients.iter().any(|&c| !(c > 0.0)) {
      return Err(OptimizationError::InvalidConfig(
        "equality coefficients must be strictly positive".to_string(),
      ));
    }
    if lower.iter().zip(&upper).any(|(l, u)| !(l <= u)) {
      return Err(OptimizationError::InvalidBound(
        "every lower bound must not exceed its upper bound".to_string(),
      ));
    }

    Ok(Self {
      lower,
      upper,
      equality,
      max_iters: DEFAULT_MAX_ITERS,
      ftol: DEFAULT_FTOL,
      hessian: None,
      exit: None,
      evaluations: 0,
      gradient_evaluations: 0,
    })
  }

  /// Cap on outer iterations, handed to the executor.
  pub fn with_max_iters(mut self, max_iters: u64) -> Self {
    self.max_iters = max_iters;
    self
  }

  /// Objective change below which the run counts as converged.
  pub fn with_ftol(mut self, ftol: f64) -> Self {
    self.ftol = ftol;
    self
  }

  /// Configured iteration cap.
  pub fn max_iters(&self) -> u64 {
    self.max_iters
  }

  /// Minimize `problem` starting from `x0`.
  ///
  /// `x0` is moved onto the feasible set first if it is not already on it.
  /// Never panics on solver trouble: failures come back with
  /// `success == false` and an explanatory `message`.
  pub fn minimize<P>(&self, problem: P, x0: &[f64]) -> SolverReport
  where
    P: CostFunction<Param = Vec<f64>, Output = f64> + Gradient<Param = Vec<f64>, Gradient = Vec<f64>>,
  {
    let n = self.lower.len();
    let mut report = SolverReport {
      x: x0.to_vec(),
      fun: f64::NAN,
      iterations: 0,
      evaluations: 0,
      gradient_evaluations: 0,
      success: false,
      message: String::new(),
    };

    if x0.len() != n {
      report.message = format!("initial guess has {} entries for {n} variables", x0.len());
      return report;
    }
    let Some(start) = self.feasible_start(x0) else {
      report.message = MSG_INCOMPATIBLE.to_string();
      return report;
    };
    report.x = start.clone();

    let max_iters = self.max_iters;
    let res = match Executor::new(problem, self.clone())
      .configure(|state| state.param(start).max_iters(max_iters))
      .run()
    {
      Ok(res) => res,
      // only the first objective evaluation propagates errors
      Err(err) => {
        report.message = format!("objective evaluation failed at the initial point: {err}");
        return report;
      }
    };

    let state = res.state();
    if let Some(x) = state.get_param() {
      report.x = x.clone();
    }
    report.fun = state.get_cost();
    report.iterations = state.get_iter();
    report.evaluations = res.solver.evaluations;
    report.gradient_evaluations = res.solver.gradient_evaluations;
    match &res.solver.exit {
      Some(Exit::Converged) => {
        report.success = true;
        report.message = MSG_SUCCESS.to_string();
      }
      Some(Exit::Failed(message)) => report.message = message.clone(),
      None => report.message = MSG_ITER_LIMIT.to_string(),
    }
    report
  }

  fn eval_gradient<O>(&mut self, problem: &mut Problem<O>, x: &Vec<f64>) -> std::result::Result<Vec<f64>, String>
  where
    O: Gradient<Param = Vec<f64>, Gradient = Vec<f64>>,
  {
    self.gradient_evaluations += 1;
    match problem.gradient(x) {
      Ok(g) if g.len() == x.len() && g.iter().all(|v| v.is_finite()) => Ok(g),
      Ok(_) => Err("gradient is not finite".to_string()),
      Err(err) => Err(format!("gradient evaluation failed: {err}")),
    }
  }

  /// No descent along `d`: converged if the slope is within tolerance.
  fn stalled(&self, slope: f64) -> Exit {
    if slope.abs() <= self.ftol {
      Exit::Converged
    } else {
      Exit::Failed(MSG_LINESEARCH.to_string())
    }
  }

  fn clip(&self, x: &[f64]) -> Vec<f64> {
    x.iter()
      .zip(self.lower.iter().zip(&self.upper))
      .map(|(&xi, (&l, &u))| xi.clamp(l, u))
      .collect()
  }

  fn is_feasible(&self, x: &[f64]) -> bool {
    x.iter()
      .zip(self.lower.iter().zip(&self.upper))
      .all(|(&xi, (&l, &u))| xi >= l && xi <= u)
      && self.equality.residual(x).abs() <= 1e-12
  }

  /// Project `x0` onto `{aᵗx = b, l ≤ x ≤ u}` along `a` by bisection on the
  /// shift `τ` in `clamp(x0 + τa, l, u)`.
  fn feasible_start(&self, x0: &[f64]) -> Option<Vec<f64>> {
    if self.is_feasible(x0) {
      return Some(x0.to_vec());
    }

    let a = &self.equality.coefficients;
    let b = self.equality.rhs;
    if dot(a, &self.lower) > b + 1e-12 || dot(a, &self.upper) < b - 1e-12 {
      return None;
    }

    let shifted = |tau: f64| -> Vec<f64> {
      self.clip(
        &x0.iter()
          .zip(a)
          .map(|(xi, ai)| xi + tau * ai)
          .collect::<Vec<f64>>(),
      )
    };

    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for i in 0..x0.len() {
      lo = lo.min((self.lower[i] - x0[i]) / a[i]);
      hi = hi.max((self.upper[i] - x0[i]) / a[i]);
    }

    for _ in 0..200 {
      let mid = 0.5 * (lo + hi);
      let r = self.equality.residual(&shifted(mid));
      if r.abs() <= 1e-15 {
        lo = mid;
        hi = mid;
        break;
      }
      if r < 0.0 {
        lo = mid;
      } else {
        hi = mid;
      }
    }

    let mut x = shifted(0.5 * (lo + hi));
    // absorb the bisection remainder in the first coordinate with slack
    let r = self.equality.residual(&x);
    if let Some(i) = (0..x.len()).find(|&i| {
      let xi = x[i] - r / a[i];
      xi >= self.lower[i] && xi <= self.upper[i]
    }) {
      x[i] -= r / a[i];
    }
    Some(x)
  }

  /// Primal active-set solve of the QP subproblem around `x`.
  ///
  /// Returns `None` only when the reduced KKT system is singular.
  fn qp_step(&self, hess: &DMatrix<f64>, g: &[f64], x: &[f64]) -> Option<Vec<f64>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Slot {
      Free,
      AtLower,
      AtUpper,
      Fixed,
    }

    let n = x.len();
    let a = &self.equality.coefficients;
    let lo: Vec<f64> = (0..n).map(|i| self.lower[i] - x[i]).collect();
    let hi: Vec<f64> = (0..n).map(|i| self.upper[i] - x[i]).collect();

    let mut slots: Vec<Slot> = (0..n)
      .map(|i| {
        if self.upper[i] - self.lower[i] <= 0.0 {
          Slot::Fixed
        } else {
          Slot::Free
        }
      })
      .collect();
    let mut d = vec![0.0; n];

    if slots.iter().all(|&s| s == Slot::Fixed) {
      return Some(d);
    }

    let g_scale = 1.0 + inf_norm(g);
    let max_steps = 3 * n + 10;

    for _ in 0..max_steps {
      let free: Vec<usize> = (0..n).filter(|&i| slots[i] == Slot::Free).collect();
      let k = free.len();

      // gradient of the model at d
      let bd = hess * DVector::from_column_slice(&d);
      let r: Vec<f64> = (0..n).map(|i| bd[i] + g[i]).collect();

      let kkt = DMatrix::<f64>::from_fn(k + 1, k + 1, |i, j| match (i < k, j < k) {
        (true, true) => hess[(free[i], free[j])],
        (true, false) => a[free[i]],
        (false, true) => a[free[j]],
        (false, false) => 0.0,
      });
      let rhs = DVector::<f64>::from_fn(k + 1, |i, _| {
        if i < k {
          -r[free[i]]
        } else {
          -dot(a, &d)
        }
      });
      let sol = kkt.lu().solve(&rhs)?;
      if sol.iter().any(|v| !v.is_finite()) {
        return None;
      }
      let lambda = sol[k];

      let p_norm = (0..k).fold(0.0f64, |m, i| m.max(sol[i].abs()));
      if p_norm <= STEP_EPS * (1.0 + inf_norm(&d)) {
        // stationary on the current working set: check bound multipliers
        let mut release: Option<(usize, f64)> = None;
        for i in 0..n {
          let rho = r[i] + a[i] * lambda;
          let violation = match slots[i] {
            Slot::AtLower => -rho,
            Slot::AtUpper => rho,
            _ => continue,
          };
          if violation > 1e-12 * g_scale && release.map_or(true, |(_, v)| violation > v) {
            release = Some((i, violation));
          }
        }
        match release {
          Some((i, _)) => slots[i] = Slot::Free,
          None => return Some(d),
        }
        continue;
      }

      let mut step = 1.0;
      let mut blocking: Option<(usize, Slot)> = None;
      for (idx, &i) in free.iter().enumerate() {
        let p = sol[idx];
        if p < 0.0 {
          let t = (lo[i] - d[i]) / p;
          if t < step {
            step = t;
            blocking = Some((i, Slot::AtLower));
          }
        } else if p > 0.0 {
          let t = (hi[i] - d[i]) / p;
          if t < step {
            step = t;
            blocking = Some((i, Slot::AtUpper));
          }
        }
      }
      let step = step.max(0.0);

      for (idx, &i) in free.iter().enumerate() {
        d[i] += step * sol[idx];
      }

      if let Some((i, slot)) = blocking {
        d[i] = if slot == Slot::AtLower { lo[i] } else { hi[i] };
        if k > 1 {
          slots[i] = slot;
        }
      }
    }

    // the active-set iterate never increases the model, so the last one is usable
    Some(d)
  }
}

impl<O> Solver<O, SqpState> for Slsqp
where
  O: CostFunction<Param = Vec<f64>, Output = f64> + Gradient<Param = Vec<f64>, Gradient = Vec<f64>>,
{
  const NAME: &'static str = "SLSQP";

  fn init(&mut self, problem: &mut Problem<O>, state: SqpState) -> std::result::Result<(SqpState, Option<KV>), Error> {
    let Some(x) = state.get_param().cloned() else {
      return Err(OptimizationError::InvalidConfig("slsqp needs an initial point".to_string()).into());
    };
    self.hessian = Some(DMatrix::identity(x.len(), x.len()));
    self.exit = None;
    self.evaluations = 1;
    self.gradient_evaluations = 0;

    let f = problem.cost(&x)?;
    if !f.is_finite() {
      self.exit = Some(Exit::Failed(format!(
        "objective is not finite at the initial point ({f})"
      )));
      return Ok((state.cost(f), None));
    }

    match self.eval_gradient(problem, &x) {
      Ok(g) => Ok((state.cost(f).gradient(g), None)),
      Err(message) => {
        self.exit = Some(Exit::Failed(message));
        Ok((state.cost(f), None))
      }
    }
  }

  fn next_iter(
    &mut self,
    problem: &mut Problem<O>,
    state: SqpState,
  ) -> std::result::Result<(SqpState, Option<KV>), Error> {
    if self.exit.is_some() {
      return Ok((state, None));
    }
    let (Some(x), Some(g)) = (state.get_param().cloned(), state.get_gradient().cloned()) else {
      return Err(OptimizationError::InvalidConfig("slsqp state lost its iterate".to_string()).into());
    };
    let f = state.get_cost();
    let mut hess = self
      .hessian
      .take()
      .unwrap_or_else(|| DMatrix::identity(x.len(), x.len()));

    let Some(d) = self.qp_step(&hess, &g, &x) else {
      self.exit = Some(Exit::Failed(MSG_SINGULAR.to_string()));
      return Ok((state, None));
    };
    if inf_norm(&d) <= STEP_EPS {
      self.exit = Some(Exit::Converged);
      return Ok((state, None));
    }

    let slope = dot(&g, &d);
    if slope >= 0.0 {
      self.exit = Some(self.stalled(slope));
      return Ok((state, None));
    }

    let mut alpha = 1.0;
    let mut accepted = None;
    for _ in 0..MAX_BACKTRACKS {
      let trial = self.clip(
        &x.iter()
          .zip(&d)
          .map(|(xi, di)| xi + alpha * di)
          .collect::<Vec<f64>>(),
      );
      self.evaluations += 1;
      match problem.cost(&trial) {
        Ok(ft) if ft.is_finite() && ft <= f + ARMIJO * alpha * slope => {
          accepted = Some((trial, ft));
          break;
        }
        Ok(_) => {}
        Err(err) => debug!(%err, alpha, "objective undefined along search direction"),
      }
      alpha *= 0.5;
    }

    let Some((x_new, f_new)) = accepted else {
      self.exit = Some(self.stalled(slope));
      return Ok((state, None));
    };

    let g_new = match self.eval_gradient(problem, &x_new) {
      Ok(g) => g,
      Err(message) => {
        self.exit = Some(Exit::Failed(message));
        return Ok((state.param(x_new).cost(f_new), None));
      }
    };

    let s: Vec<f64> = x_new.iter().zip(&x).map(|(a, b)| a - b).collect();
    let y: Vec<f64> = g_new.iter().zip(&g).map(|(a, b)| a - b).collect();
    damped_bfgs(&mut hess, &s, &y);
    self.hessian = Some(hess);

    let df = (f - f_new).abs();
    let step = inf_norm(&s);
    debug!(iter = state.get_iter() + 1, f = f_new, step, alpha, "slsqp iteration");

    if df < self.ftol && step < self.ftol.sqrt() {
      self.exit = Some(Exit::Converged);
    }
    Ok((state.param(x_new).cost(f_new).gradient(g_new), None))
  }

  // failures also stop here; `minimize` tells them apart through `exit`
  fn terminate(&mut self, _state: &SqpState) -> TerminationStatus {
    match self.exit {
      Some(_) => TerminationStatus::Terminated(TerminationReason::SolverConverged),
      None => TerminationStatus::NotTerminated,
    }
  }
}

/// Powell-damped BFGS update, keeping `B` symmetric positive definite.
fn damped_bfgs(hess: &mut DMatrix<f64>, s: &[f64], y: &[f64]) {
  let s = DVector::from_column_slice(s);
  let y = DVector::from_column_slice(y);
  let bs = &*hess * &s;
  let sbs = s.dot(&bs);
  if sbs <= 1e-16 {
    return;
  }

  let sy = s.dot(&y);
  let theta = if sy >= 0.2 * sbs {
    1.0
  } else {
    0.8 * sbs / (sbs - sy)
  };
  let r = &y * theta + &bs * (1.0 - theta);
  let sr = s.dot(&r);
  if sr <= 1e-16 {
    return;
  }

  *hess += (&r * r.transpose()) / sr - (&bs * bs.transpose()) / sbs;
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
  a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn inf_norm(v: &[f64]) -> f64 {
  v.iter().fold(0.0f64, |m, x| m.max(x.abs()))
}
