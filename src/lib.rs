#![warn(missing_docs)]

//! # Minterm
//!
//! A framework for composing additive nonlinear objectives from
//! user-defined terms and minimizing them, optionally subject to inequality
//! constraints.
//!
//! An objective is a sum of [`Term`]s, each contributing a value (and
//! optionally a gradient and a Hessian) over a subset of the problem's
//! [`Variable`]s. A [`Function`](function::Function) composes terms over
//! registered variables, assembles global derivatives in parallel, and maps
//! between the user parameterization and a flat solver-space vector,
//! applying per-variable [`ChangeOfVariables`] transforms where attached. A
//! [`ConstrainedFunction`](constrained::ConstrainedFunction) minimizes such
//! an objective subject to inequality constraints `c(x) <= 0` with the
//! augmented Lagrangian method, driving an unconstrained [`Solver`] such as
//! the bundled [`Lbfgs`].
//!
//! ## Defining a problem
//!
//! A term is any type implementing [`Term`]; variables are created as
//! [`Variable`] handles and shared between the user and the functions they
//! are registered with.
//!
//! ```rust
//! use std::sync::Arc;
//! use minterm::{Function, Term, TermError, Variable};
//! use nalgebra::{dvector, DVector};
//!
//! /// f(x) = (x - a)^2 over a one-dimensional variable.
//! struct Shifted {
//!     a: f64,
//! }
//!
//! impl Term for Shifted {
//!     fn arity(&self) -> usize {
//!         1
//!     }
//!
//!     fn dimension(&self, _argument: usize) -> usize {
//!         1
//!     }
//!
//!     fn value(&self, arguments: &[&[f64]]) -> Result<f64, TermError> {
//!         let d = arguments[0][0] - self.a;
//!         Ok(d * d)
//!     }
//!
//!     fn value_and_gradient(
//!         &self,
//!         arguments: &[&[f64]],
//!         gradient: &mut [DVector<f64>],
//!     ) -> Result<f64, TermError> {
//!         let d = arguments[0][0] - self.a;
//!         gradient[0][0] = 2.0 * d;
//!         Ok(d * d)
//!     }
//! }
//!
//! let x = Variable::scalar(0.0);
//! let mut function = Function::new();
//! function.add_variable(&x).unwrap();
//! function.add_term(Arc::new(Shifted { a: 3.0 }), &[&x]).unwrap();
//!
//! let mut gradient = DVector::zeros(0);
//! let value = function
//!     .evaluate_with_gradient(&dvector![1.0], &mut gradient)
//!     .unwrap();
//! assert_eq!(value, 4.0);
//! assert_eq!(gradient[0], -4.0);
//! ```
//!
//! ## Constrained minimization
//!
//! Constraints are ordinary terms computing `c(x)`; the outer loop wraps
//! them into smooth penalties and adapts the penalty parameter and the dual
//! multipliers between inner solves (Nocedal & Wright, chapter 17).
//!
//! ```rust
//! use std::sync::Arc;
//! use minterm::{ConstrainedFunction, Lbfgs, SolverResults, Variable};
//! # use minterm::{Term, TermError};
//! # use nalgebra::DVector;
//! #
//! # /// f(x) = (x - 3)^2.
//! # struct Shifted;
//! #
//! # impl Term for Shifted {
//! #     fn arity(&self) -> usize {
//! #         1
//! #     }
//! #
//! #     fn dimension(&self, _argument: usize) -> usize {
//! #         1
//! #     }
//! #
//! #     fn value(&self, arguments: &[&[f64]]) -> Result<f64, TermError> {
//! #         Ok((arguments[0][0] - 3.0).powi(2))
//! #     }
//! #
//! #     fn value_and_gradient(
//! #         &self,
//! #         arguments: &[&[f64]],
//! #         gradient: &mut [DVector<f64>],
//! #     ) -> Result<f64, TermError> {
//! #         gradient[0][0] = 2.0 * (arguments[0][0] - 3.0);
//! #         self.value(arguments)
//! #     }
//! # }
//! #
//! # /// c(x) = x - 2, so that c(x) <= 0 encodes x <= 2.
//! # struct Bound;
//! #
//! # impl Term for Bound {
//! #     fn arity(&self) -> usize {
//! #         1
//! #     }
//! #
//! #     fn dimension(&self, _argument: usize) -> usize {
//! #         1
//! #     }
//! #
//! #     fn value(&self, arguments: &[&[f64]]) -> Result<f64, TermError> {
//! #         Ok(arguments[0][0] - 2.0)
//! #     }
//! #
//! #     fn value_and_gradient(
//! #         &self,
//! #         arguments: &[&[f64]],
//! #         gradient: &mut [DVector<f64>],
//! #     ) -> Result<f64, TermError> {
//! #         gradient[0][0] = 1.0;
//! #         self.value(arguments)
//! #     }
//! # }
//!
//! // minimize (x - 3)^2 subject to x <= 2.
//! let x = Variable::scalar(0.0);
//! let mut problem = ConstrainedFunction::new();
//! problem.add_variable(&x).unwrap();
//! problem.add_term(Arc::new(Shifted), &[&x]).unwrap();
//! problem.add_constraint_term("x <= 2", Arc::new(Bound), &[&x]).unwrap();
//!
//! let mut results = SolverResults::new();
//! problem.solve(&Lbfgs::new(), &mut results).unwrap();
//!
//! assert!(results.is_success());
//! assert!((x.values()[0] - 2.0).abs() < 1e-4);
//! assert!(problem.is_feasible().unwrap());
//! ```
//!
//! ## License
//!
//! Licensed under MIT.

pub mod constrained;
mod core;
pub mod function;
pub mod solver;

pub use constrained::{ConstrainedFunction, ConstraintError};
pub use core::*;
pub use function::{Function, FunctionError};
pub use solver::Lbfgs;

pub use nalgebra;
pub use sprs;

#[cfg(feature = "testing")]
pub mod testing;

#[cfg(not(feature = "testing"))]
pub(crate) mod testing;
