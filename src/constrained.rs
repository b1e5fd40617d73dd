//! Constrained minimization via an augmented Lagrangian.
//!
//! A [`ConstrainedFunction`] minimizes an additive objective subject to
//! inequality constraints `c(x) <= 0`. Each constraint is a [`Term`]
//! computing `c(x)`; internally it is wrapped into the smooth penalty `Phi`
//! (Nocedal & Wright, eq. 17.65, with the inequality orientation flipped so
//! that feasibility is `c <= 0`) and added to an augmented Lagrangian. The
//! outer loop repeatedly minimizes the augmented Lagrangian with an
//! unconstrained [`Solver`], then either updates the dual variables or
//! increases the penalty parameter, following Nocedal & Wright, chapter 17.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use nalgebra::DVector;
use thiserror::Error;

use crate::core::{ExitCondition, Solver, SolverResults, Term, TermError, Variable};
use crate::function::{Function, FunctionError};

/// Error returned from [`ConstrainedFunction`] operations.
#[derive(Debug, Error)]
pub enum ConstraintError {
    /// A constraint with the same name has already been added.
    #[error("a constraint named {0:?} has already been added")]
    DuplicateConstraint(String),
    /// An underlying function operation failed.
    #[error(transparent)]
    Function(#[from] FunctionError),
}

/// A scalar shared between the outer loop and the penalty terms.
///
/// Writes from the outer loop must be visible to every `Phi` wrapper on the
/// next evaluation, across the parallel term loop, so the value lives in an
/// atomic holding the `f64` bits.
#[derive(Clone, Debug)]
struct Parameter(Arc<AtomicU64>);

impl Parameter {
    fn new(value: f64) -> Self {
        Self(Arc::new(AtomicU64::new(value.to_bits())))
    }

    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Smooth penalty wrapper of a constraint term `c(x) <= 0`.
///
/// With `t = c(x)`, multiplier `sigma` and penalty `mu`, the value is
/// `sigma t + mu/2 t^2` on the active side of the switching surface
/// `-t = sigma/mu` and the constant `-sigma^2 / (2 mu)` on the inactive
/// side; the function is C1 across the surface. Arity and argument
/// dimensions are inherited from the wrapped term.
struct Phi {
    term: Arc<dyn Term>,
    sigma: Parameter,
    mu: Parameter,
}

impl Term for Phi {
    fn arity(&self) -> usize {
        self.term.arity()
    }

    fn dimension(&self, argument: usize) -> usize {
        self.term.dimension(argument)
    }

    fn value(&self, arguments: &[&[f64]]) -> Result<f64, TermError> {
        let t = self.term.value(arguments)?;
        let (sigma, mu) = (self.sigma.get(), self.mu.get());
        if -t - sigma / mu <= 0.0 {
            Ok(sigma * t + 0.5 * mu * t * t)
        } else {
            Ok(-0.5 * sigma * sigma / mu)
        }
    }

    fn value_and_gradient(
        &self,
        arguments: &[&[f64]],
        gradient: &mut [DVector<f64>],
    ) -> Result<f64, TermError> {
        let t = self.term.value_and_gradient(arguments, gradient)?;
        let (sigma, mu) = (self.sigma.get(), self.mu.get());
        if -t - sigma / mu <= 0.0 {
            let scale = sigma + mu * t;
            for (argument, block) in gradient.iter_mut().enumerate() {
                for i in 0..self.term.dimension(argument) {
                    block[i] *= scale;
                }
            }
            Ok(sigma * t + 0.5 * mu * t * t)
        } else {
            for (argument, block) in gradient.iter_mut().enumerate() {
                for i in 0..self.term.dimension(argument) {
                    block[i] = 0.0;
                }
            }
            Ok(-0.5 * sigma * sigma / mu)
        }
    }

    // The penalty is only piecewise twice differentiable; no Hessian. The
    // default evaluator already fails with `HessianNotSupported`.
}

struct Constraint {
    function: Function,
    lambda: Parameter,
    cached_value: f64,
}

/// Explicit first-order dual update for one constraint, projecting the
/// multiplier onto non-negativity.
fn updated_dual(lambda: f64, mu: f64, c: f64) -> f64 {
    if c + lambda / mu <= 0.0 {
        0.0
    } else {
        lambda + mu * c
    }
}

/// An objective with inequality constraints `c(x) <= 0`.
///
/// Objective terms contribute to both the raw objective and the augmented
/// Lagrangian; constraint terms are tracked separately (to read `c(x)`) and
/// enter the augmented Lagrangian through the smooth penalty wrapper.
///
/// See the [crate](crate) documentation for a complete example of
/// minimizing `(x - 3)^2` subject to `x <= 2`.
pub struct ConstrainedFunction {
    objective: Function,
    augmented_lagrangian: Function,
    constraints: BTreeMap<String, Constraint>,
    mu: Parameter,
    /// Threshold (and denominator regularizer) for the relative objective
    /// improvement between outer iterations.
    pub function_improvement_tolerance: f64,
    /// Threshold (and denominator regularizer) for the relative change of
    /// the dual variables.
    pub dual_change_tolerance: f64,
    /// Outer iteration limit.
    pub max_number_of_iterations: usize,
}

impl ConstrainedFunction {
    /// Create an empty constrained function.
    pub fn new() -> Self {
        Self {
            objective: Function::new(),
            augmented_lagrangian: Function::new(),
            constraints: BTreeMap::new(),
            mu: Parameter::new(10.0),
            function_improvement_tolerance: 1e-10,
            dual_change_tolerance: 1e-6,
            max_number_of_iterations: 100,
        }
    }

    /// Register a variable with the objective and the augmented Lagrangian.
    pub fn add_variable(&mut self, variable: &Variable) -> Result<(), FunctionError> {
        self.objective.add_variable(variable)?;
        self.augmented_lagrangian.add_variable(variable)
    }

    /// Add an objective term; it contributes unchanged to the inner problem.
    pub fn add_term(
        &mut self,
        term: Arc<dyn Term>,
        arguments: &[&Variable],
    ) -> Result<(), FunctionError> {
        self.objective.add_term(Arc::clone(&term), arguments)?;
        self.augmented_lagrangian.add_term(term, arguments)
    }

    /// Add an inequality constraint `c(x) <= 0` where `term` computes `c`.
    ///
    /// Names must be unique; a duplicate fails with
    /// [`ConstraintError::DuplicateConstraint`]. The arguments must already
    /// be registered through [`add_variable`](Self::add_variable).
    pub fn add_constraint_term(
        &mut self,
        name: impl Into<String>,
        term: Arc<dyn Term>,
        arguments: &[&Variable],
    ) -> Result<(), ConstraintError> {
        let name = name.into();
        if self.constraints.contains_key(&name) {
            return Err(ConstraintError::DuplicateConstraint(name));
        }

        let mut function = Function::new();
        for variable in arguments {
            function.add_variable(variable)?;
        }
        function.add_term(Arc::clone(&term), arguments)?;

        let lambda = Parameter::new(0.0);
        let phi = Phi {
            term,
            sigma: lambda.clone(),
            mu: self.mu.clone(),
        };
        self.augmented_lagrangian.add_term(Arc::new(phi), arguments)?;

        self.constraints.insert(
            name,
            Constraint {
                function,
                lambda,
                cached_value: 0.0,
            },
        );
        Ok(())
    }

    /// Read-only access to the raw objective.
    pub fn objective(&self) -> &Function {
        &self.objective
    }

    /// Mutable access to the raw objective, e.g. for evaluating it.
    pub fn objective_mut(&mut self) -> &mut Function {
        &mut self.objective
    }

    /// Whether every constraint satisfies `c(x) <= 1e-12` at the current
    /// user values.
    pub fn is_feasible(&mut self) -> Result<bool, FunctionError> {
        for constraint in self.constraints.values_mut() {
            if constraint.function.evaluate()? > 1e-12 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Minimize the objective subject to the constraints.
    ///
    /// Runs the augmented-Lagrangian outer loop, invoking `solver` on the
    /// augmented Lagrangian once per iteration. The outer loop writes
    /// [`FunctionTolerance`](ExitCondition::FunctionTolerance),
    /// [`GradientTolerance`](ExitCondition::GradientTolerance) (dual
    /// variables converged and the violation is negligible) or
    /// [`NoConvergence`](ExitCondition::NoConvergence); an
    /// [`InternalError`](ExitCondition::InternalError) reported by the inner
    /// solver is left in place and stops the loop. Errors from evaluating
    /// the objective or the constraints themselves are returned.
    pub fn solve(
        &mut self,
        solver: &dyn Solver,
        results: &mut SolverResults,
    ) -> Result<(), FunctionError> {
        results.exit_condition = ExitCondition::InternalError;

        if self.augmented_lagrangian.number_of_scalars() == 0 {
            results.exit_condition = ExitCondition::FunctionTolerance;
            return Ok(());
        }

        self.mu.set(10.0);
        let mut nu = self.mu.get().powf(-0.1);

        let mut f_prev = f64::NAN;
        let mut iterations = 0;

        loop {
            // Minimize the smooth approximation of the Lagrangian.
            solver.solve(&mut self.augmented_lagrangian, results);
            if results.exit_condition == ExitCondition::InternalError {
                return Ok(());
            }
            let f = self.objective.evaluate()?;
            let mu = self.mu.get();

            let mut infeasibility = f64::NEG_INFINITY;
            let mut max_violation: f64 = 0.0;
            for constraint in self.constraints.values_mut() {
                let c = constraint.function.evaluate()?;
                constraint.cached_value = c;
                infeasibility = infeasibility.max(c * constraint.lambda.get());
                max_violation = max_violation.max(c);
            }

            debug!(
                "outer iteration {iterations}: f = {f:e}, mu = {mu:e}, \
                 max violation = {max_violation:e}"
            );
            if let Some(log) = solver.log_function() {
                log(&format!(
                    " ___________________________________________________________\n\
                     |   mu   |   nu   |   objective   |   infeas.  |  max viol. |\n\
                     +--------+--------+---------------+------------+------------+\n\
                     |{mu:7.1e} |{nu:7.1e} | {f:+13.6e} | {infeasibility:10.3e} | {max_violation:10.3e} |\n\
                     |________|________|_______________|____________|____________|"
                ));
            }

            if (f - f_prev).abs() / (f.abs() + self.function_improvement_tolerance)
                < self.function_improvement_tolerance
            {
                results.exit_condition = ExitCondition::FunctionTolerance;
                break;
            }

            if max_violation <= nu {
                // The violation is acceptable for the current tolerance;
                // update the dual variables with the explicit formula.
                let mut max_change: f64 = 0.0;
                let mut max_lambda: f64 = 0.0;
                for constraint in self.constraints.values_mut() {
                    let previous = constraint.lambda.get();
                    let updated = updated_dual(previous, mu, constraint.cached_value);
                    constraint.lambda.set(updated);
                    max_change = max_change.max((previous - updated).abs());
                    max_lambda = max_lambda.max(updated.abs());
                }

                if let Some(log) = solver.log_function() {
                    log(&format!(
                        "Updating dual variables. Maximum change: {max_change}."
                    ));
                }

                // Dual convergence is only meaningful once some multiplier
                // is active; without any, the function-improvement stop
                // governs termination.
                if max_lambda > 0.0
                    && max_change / (max_lambda + self.dual_change_tolerance)
                        < self.dual_change_tolerance
                    && max_violation < 1e-8
                {
                    results.exit_condition = ExitCondition::GradientTolerance;
                    break;
                }

                nu /= mu.powf(0.9);
            } else {
                // The violation is too big; increase the penalty parameter
                // to push it down.
                if let Some(log) = solver.log_function() {
                    log("Updating penalty parameter.");
                }
                self.mu.set(mu * 100.0);
                nu = self.mu.get().powf(-0.1);
            }

            if let Some(log) = solver.log_function() {
                log("");
                let mut printed = 0;
                for (name, constraint) in &self.constraints {
                    let lambda = constraint.lambda.get();
                    if lambda == 0.0 {
                        continue;
                    }
                    let mut line =
                        format!("{:.<25}: {:<10}", format!("lambda[{name}]"), lambda);
                    if constraint.cached_value > 0.0 {
                        line.push_str(&format!(" Violation : {}", constraint.cached_value));
                    }
                    log(&line);
                    printed += 1;
                    if printed >= 10 {
                        log("Not printing more dual variables.");
                        break;
                    }
                }
                log("");
            }

            iterations += 1;
            if iterations >= self.max_number_of_iterations {
                results.exit_condition = ExitCondition::NoConvergence;
                break;
            }

            f_prev = f;
        }
        Ok(())
    }
}

impl Default for ConstrainedFunction {
    fn default() -> Self {
        Self::new()
    }
}
