//! Limited-memory BFGS minimizer.
//!
//! A quasi-Newton method that approximates the inverse Hessian from a short
//! history of iterates (the classical two-loop recursion) and globalizes
//! with an Armijo backtracking line search. Only the gradient path of the
//! function is used, which makes the solver suitable for augmented
//! Lagrangians, whose penalty terms provide no Hessian.
//!
//! # References
//!
//! \[1\] [Numerical
//! Optimization](https://link.springer.com/book/10.1007/978-0-387-40065-5),
//! chapter 7.

use std::collections::VecDeque;

use getset::{CopyGetters, Setters};
use log::debug;
use nalgebra::DVector;

use crate::core::{ExitCondition, Solver, SolverResults};
use crate::function::{Function, FunctionError};

/// Options for the [`Lbfgs`] solver.
#[derive(Debug, Clone, CopyGetters, Setters)]
#[getset(get_copy = "pub", set = "pub")]
pub struct LbfgsOptions {
    /// Gradient norm below which the solve stops. Default: `1e-10`.
    gradient_tolerance: f64,
    /// Threshold (and denominator regularizer) for the relative function
    /// improvement between iterations. Default: `1e-14`.
    function_improvement_tolerance: f64,
    /// Threshold (and denominator regularizer) for the relative step length.
    /// Default: `1e-14`.
    argument_improvement_tolerance: f64,
    /// Number of curvature pairs kept in memory. Default: `10`.
    history: usize,
    /// Iteration limit. Default: `500`.
    max_iterations: usize,
}

impl Default for LbfgsOptions {
    fn default() -> Self {
        Self {
            gradient_tolerance: 1e-10,
            function_improvement_tolerance: 1e-14,
            argument_improvement_tolerance: 1e-14,
            history: 10,
            max_iterations: 500,
        }
    }
}

/// L-BFGS solver.
///
/// See [module](self) documentation for more details.
pub struct Lbfgs {
    options: LbfgsOptions,
    log: Option<Box<dyn Fn(&str)>>,
}

impl Lbfgs {
    /// Initialize the solver with default options.
    pub fn new() -> Self {
        Self::with_options(LbfgsOptions::default())
    }

    /// Initialize the solver with given options.
    pub fn with_options(options: LbfgsOptions) -> Self {
        Self { options, log: None }
    }

    /// Attach a sink receiving per-iteration status lines.
    pub fn set_log_function(&mut self, log: impl Fn(&str) + 'static) -> &mut Self {
        self.log = Some(Box::new(log));
        self
    }

    fn minimize(
        &self,
        function: &mut Function,
        results: &mut SolverResults,
    ) -> Result<(), FunctionError> {
        let LbfgsOptions {
            gradient_tolerance,
            function_improvement_tolerance,
            argument_improvement_tolerance,
            history,
            max_iterations,
        } = self.options;

        let n = function.number_of_scalars();
        if n == 0 {
            results.exit_condition = ExitCondition::FunctionTolerance;
            return Ok(());
        }

        let mut x = DVector::zeros(n);
        function.copy_user_to_global(&mut x);

        let mut gradient = DVector::zeros(n);
        let mut value = function.evaluate_with_gradient(&x, &mut gradient)?;

        // Curvature pairs (s, y, 1 / y's) with the most recent at the back.
        let mut pairs: VecDeque<(DVector<f64>, DVector<f64>, f64)> =
            VecDeque::with_capacity(history);
        let mut trial_gradient = DVector::zeros(n);

        results.exit_condition = ExitCondition::NoConvergence;

        for iteration in 0..max_iterations {
            if let Some(log) = &self.log {
                log(&format!(
                    "iteration {iteration}: f = {value:e}, |g| = {:e}",
                    gradient.norm()
                ));
            }

            if gradient.norm() <= gradient_tolerance {
                results.exit_condition = ExitCondition::GradientTolerance;
                break;
            }

            let mut direction = search_direction(&pairs, &gradient);
            let mut slope = direction.dot(&gradient);
            if slope >= 0.0 {
                // Not a descent direction (stale curvature); fall back to
                // steepest descent.
                direction = -&gradient;
                slope = -gradient.norm_squared();
            }

            // Armijo backtracking. The unit step is the natural first trial
            // once curvature information exists.
            let mut step = if pairs.is_empty() {
                (1.0 / gradient.norm()).min(1.0)
            } else {
                1.0
            };
            let mut accepted = None;
            while step > 1e-20 {
                let candidate = &x + &direction * step;
                let trial = function.evaluate_with_gradient(&candidate, &mut trial_gradient)?;
                if trial <= value + 1e-4 * step * slope {
                    accepted = Some((candidate, trial));
                    break;
                }
                step *= 0.5;
            }
            let Some((candidate, trial)) = accepted else {
                // No acceptable step exists at this scale; the argument
                // cannot improve further.
                debug!("line search stalled at iteration {iteration}");
                results.exit_condition = ExitCondition::ArgumentTolerance;
                break;
            };

            let s = &candidate - &x;
            let y = &trial_gradient - &gradient;
            let sy = s.dot(&y);
            if sy > 1e-12 * s.norm() * y.norm() {
                if pairs.len() == history {
                    pairs.pop_front();
                }
                let rho = 1.0 / sy;
                pairs.push_back((s.clone(), y, rho));
            }

            let function_stop = (value - trial).abs()
                / (trial.abs() + function_improvement_tolerance)
                < function_improvement_tolerance;
            let argument_stop = s.norm() / (x.norm() + argument_improvement_tolerance)
                < argument_improvement_tolerance;

            x = candidate;
            value = trial;
            gradient.copy_from(&trial_gradient);

            if function_stop {
                results.exit_condition = ExitCondition::FunctionTolerance;
                break;
            }
            if argument_stop {
                results.exit_condition = ExitCondition::ArgumentTolerance;
                break;
            }
        }

        function.copy_global_to_user(&x);
        Ok(())
    }
}

impl Default for Lbfgs {
    fn default() -> Self {
        Self::new()
    }
}

impl Solver for Lbfgs {
    fn solve(&self, function: &mut Function, results: &mut SolverResults) {
        if let Err(error) = self.minimize(function, results) {
            debug!("function evaluation failed: {error}");
            results.exit_condition = ExitCondition::InternalError;
        }
    }

    fn log_function(&self) -> Option<&dyn Fn(&str)> {
        self.log.as_deref()
    }
}

/// Two-loop recursion: apply the implicit inverse Hessian approximation to
/// the gradient and negate, yielding a descent direction.
fn search_direction(
    pairs: &VecDeque<(DVector<f64>, DVector<f64>, f64)>,
    gradient: &DVector<f64>,
) -> DVector<f64> {
    let mut q = gradient.clone();

    let mut alphas = Vec::with_capacity(pairs.len());
    for (s, y, rho) in pairs.iter().rev() {
        let alpha = rho * s.dot(&q);
        q.axpy(-alpha, y, 1.0);
        alphas.push(alpha);
    }

    // Scale by gamma = s'y / y'y, the standard initial Hessian guess.
    if let Some((s, y, _)) = pairs.back() {
        let yy = y.norm_squared();
        if yy > 0.0 {
            q *= s.dot(y) / yy;
        }
    }

    for ((s, y, rho), alpha) in pairs.iter().zip(alphas.iter().rev()) {
        let beta = rho * y.dot(&q);
        q.axpy(alpha - beta, s, 1.0);
    }

    -q
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Variable;
    use crate::testing::{Rosenbrock, SquaredDistance};

    use approx::assert_abs_diff_eq;
    use nalgebra::dvector;
    use std::sync::Arc;

    #[test]
    fn minimizes_a_shifted_quadratic() {
        let x = Variable::scalar(0.0);
        let mut function = Function::new();
        function.add_variable(&x).unwrap();
        function
            .add_term(Arc::new(SquaredDistance::new(dvector![3.0])), &[&x])
            .unwrap();

        let mut results = SolverResults::new();
        Lbfgs::new().solve(&mut function, &mut results);

        assert!(results.is_success());
        assert_abs_diff_eq!(x.values()[0], 3.0, epsilon = 1e-6);
    }

    #[test]
    fn minimizes_rosenbrock() {
        let x = Variable::new([-1.2, 1.0]);
        let mut function = Function::new();
        function.add_variable(&x).unwrap();
        function
            .add_term(Arc::new(Rosenbrock::new(1.0, 100.0)), &[&x])
            .unwrap();

        let mut results = SolverResults::new();
        Lbfgs::new().solve(&mut function, &mut results);

        assert!(results.is_success());
        let values = x.values();
        assert_abs_diff_eq!(values[0], 1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(values[1], 1.0, epsilon = 1e-5);
    }

    #[test]
    fn empty_function_is_already_solved() {
        let mut function = Function::new();
        let mut results = SolverResults::new();
        Lbfgs::new().solve(&mut function, &mut results);
        assert_eq!(results.exit_condition, ExitCondition::FunctionTolerance);
    }

    #[test]
    fn evaluation_failure_becomes_an_internal_error() {
        use crate::core::{Term, TermError};

        struct Failing;

        impl Term for Failing {
            fn arity(&self) -> usize {
                1
            }

            fn dimension(&self, _argument: usize) -> usize {
                1
            }

            fn value(&self, _arguments: &[&[f64]]) -> Result<f64, TermError> {
                Err(TermError::Failed("bad input".to_string()))
            }
        }

        let x = Variable::scalar(0.0);
        let mut function = Function::new();
        function.add_variable(&x).unwrap();
        function.add_term(Arc::new(Failing), &[&x]).unwrap();

        let mut results = SolverResults::new();
        Lbfgs::new().solve(&mut function, &mut results);
        assert_eq!(results.exit_condition, ExitCondition::InternalError);
    }
}
