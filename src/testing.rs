//! Testing terms and transforms useful for benchmarking, debugging and smoke
//! testing.
//!
//! [`SquaredDistance`] and [`Affine`] are recommended for first tests;
//! [`Bilinear`] couples two variables (off-diagonal Hessian blocks) and
//! [`Rosenbrock`] is the classical nonconvex benchmark with a full Hessian.

#![allow(unused)]

use nalgebra::DVector;

use crate::core::{ChangeOfVariables, Term, TermError, TermHessian};

/// `f(x) = |x - target|^2` over a single variable.
///
/// The gradient is `2 (x - target)` and the Hessian is `2 I`. With a
/// one-dimensional zero target this is the simple parabola `x^2`; used both
/// as an objective building block and as a convex regularizer in tests.
#[derive(Debug, Clone)]
pub struct SquaredDistance {
    target: DVector<f64>,
}

impl SquaredDistance {
    /// Initializes the term with the given target point.
    pub fn new(target: DVector<f64>) -> Self {
        Self { target }
    }
}

impl Term for SquaredDistance {
    fn arity(&self) -> usize {
        1
    }

    fn dimension(&self, _argument: usize) -> usize {
        self.target.len()
    }

    fn value(&self, arguments: &[&[f64]]) -> Result<f64, TermError> {
        let x = arguments[0];
        Ok(self
            .target
            .iter()
            .zip(x)
            .map(|(target, x)| (x - target) * (x - target))
            .sum())
    }

    fn value_and_gradient(
        &self,
        arguments: &[&[f64]],
        gradient: &mut [DVector<f64>],
    ) -> Result<f64, TermError> {
        let x = arguments[0];
        for i in 0..self.target.len() {
            gradient[0][i] = 2.0 * (x[i] - self.target[i]);
        }
        self.value(arguments)
    }

    fn value_gradient_hessian(
        &self,
        arguments: &[&[f64]],
        gradient: &mut [DVector<f64>],
        hessian: &mut TermHessian,
    ) -> Result<f64, TermError> {
        let block = hessian.block_mut(0, 0);
        block.fill(0.0);
        block.fill_diagonal(2.0);
        self.value_and_gradient(arguments, gradient)
    }
}

/// `c(x_1, ..., x_k) = sum_i coefficients_i . x_i + offset`.
///
/// The workhorse for linear inequality constraints: `x <= b` is
/// `Affine::new(vec![dvector![1.0]], -b)`. All derivatives are implemented;
/// the Hessian blocks are zero.
#[derive(Debug, Clone)]
pub struct Affine {
    coefficients: Vec<DVector<f64>>,
    offset: f64,
}

impl Affine {
    /// Initializes the term with one coefficient vector per argument.
    pub fn new(coefficients: Vec<DVector<f64>>, offset: f64) -> Self {
        Self {
            coefficients,
            offset,
        }
    }
}

impl Term for Affine {
    fn arity(&self) -> usize {
        self.coefficients.len()
    }

    fn dimension(&self, argument: usize) -> usize {
        self.coefficients[argument].len()
    }

    fn value(&self, arguments: &[&[f64]]) -> Result<f64, TermError> {
        let mut value = self.offset;
        for (coefficients, x) in self.coefficients.iter().zip(arguments) {
            value += coefficients.iter().zip(*x).map(|(c, x)| c * x).sum::<f64>();
        }
        Ok(value)
    }

    fn value_and_gradient(
        &self,
        arguments: &[&[f64]],
        gradient: &mut [DVector<f64>],
    ) -> Result<f64, TermError> {
        for (argument, coefficients) in self.coefficients.iter().enumerate() {
            for i in 0..coefficients.len() {
                gradient[argument][i] = coefficients[i];
            }
        }
        self.value(arguments)
    }

    fn value_gradient_hessian(
        &self,
        arguments: &[&[f64]],
        gradient: &mut [DVector<f64>],
        hessian: &mut TermHessian,
    ) -> Result<f64, TermError> {
        for a in 0..self.coefficients.len() {
            for b in 0..self.coefficients.len() {
                hessian.block_mut(a, b).fill(0.0);
            }
        }
        self.value_and_gradient(arguments, gradient)
    }
}

/// `f(u, v) = (left . u) (right . v)` over two variables.
///
/// Couples its arguments: the only nonzero Hessian blocks are the
/// off-diagonal `left right'` and its transpose, which makes the term handy
/// for exercising block assembly and sparsity patterns.
#[derive(Debug, Clone)]
pub struct Bilinear {
    left: DVector<f64>,
    right: DVector<f64>,
}

impl Bilinear {
    /// Initializes the term with the two weight vectors.
    pub fn new(left: DVector<f64>, right: DVector<f64>) -> Self {
        Self { left, right }
    }

    fn dots(&self, arguments: &[&[f64]]) -> (f64, f64) {
        let lu = self.left.iter().zip(arguments[0]).map(|(l, u)| l * u).sum();
        let rv = self
            .right
            .iter()
            .zip(arguments[1])
            .map(|(r, v)| r * v)
            .sum();
        (lu, rv)
    }
}

impl Term for Bilinear {
    fn arity(&self) -> usize {
        2
    }

    fn dimension(&self, argument: usize) -> usize {
        match argument {
            0 => self.left.len(),
            _ => self.right.len(),
        }
    }

    fn value(&self, arguments: &[&[f64]]) -> Result<f64, TermError> {
        let (lu, rv) = self.dots(arguments);
        Ok(lu * rv)
    }

    fn value_and_gradient(
        &self,
        arguments: &[&[f64]],
        gradient: &mut [DVector<f64>],
    ) -> Result<f64, TermError> {
        let (lu, rv) = self.dots(arguments);
        for i in 0..self.left.len() {
            gradient[0][i] = self.left[i] * rv;
        }
        for i in 0..self.right.len() {
            gradient[1][i] = self.right[i] * lu;
        }
        Ok(lu * rv)
    }

    fn value_gradient_hessian(
        &self,
        arguments: &[&[f64]],
        gradient: &mut [DVector<f64>],
        hessian: &mut TermHessian,
    ) -> Result<f64, TermError> {
        hessian.block_mut(0, 0).fill(0.0);
        hessian.block_mut(1, 1).fill(0.0);
        for i in 0..self.left.len() {
            for j in 0..self.right.len() {
                let mixed = self.left[i] * self.right[j];
                hessian.block_mut(0, 1)[(i, j)] = mixed;
                hessian.block_mut(1, 0)[(j, i)] = mixed;
            }
        }
        self.value_and_gradient(arguments, gradient)
    }
}

/// [Rosenbrock function](https://en.wikipedia.org/wiki/Rosenbrock_function)
/// `f(x) = (a - x_0)^2 + b (x_1 - x_0^2)^2` over one two-dimensional
/// variable.
///
/// The global minimum `(a, a^2)` sits in a long, narrow, parabolic valley;
/// the standard smoke test for unconstrained minimizers.
#[derive(Debug, Clone, Copy)]
pub struct Rosenbrock {
    a: f64,
    b: f64,
}

impl Rosenbrock {
    /// Initializes the term with the classical parameters, usually
    /// `(1, 100)`.
    pub fn new(a: f64, b: f64) -> Self {
        Self { a, b }
    }
}

impl Term for Rosenbrock {
    fn arity(&self) -> usize {
        1
    }

    fn dimension(&self, _argument: usize) -> usize {
        2
    }

    fn value(&self, arguments: &[&[f64]]) -> Result<f64, TermError> {
        let [x0, x1] = [arguments[0][0], arguments[0][1]];
        Ok((self.a - x0).powi(2) + self.b * (x1 - x0 * x0).powi(2))
    }

    fn value_and_gradient(
        &self,
        arguments: &[&[f64]],
        gradient: &mut [DVector<f64>],
    ) -> Result<f64, TermError> {
        let [x0, x1] = [arguments[0][0], arguments[0][1]];
        gradient[0][0] = -2.0 * (self.a - x0) - 4.0 * self.b * x0 * (x1 - x0 * x0);
        gradient[0][1] = 2.0 * self.b * (x1 - x0 * x0);
        self.value(arguments)
    }

    fn value_gradient_hessian(
        &self,
        arguments: &[&[f64]],
        gradient: &mut [DVector<f64>],
        hessian: &mut TermHessian,
    ) -> Result<f64, TermError> {
        let [x0, x1] = [arguments[0][0], arguments[0][1]];
        let block = hessian.block_mut(0, 0);
        block[(0, 0)] = 2.0 - 4.0 * self.b * (x1 - 3.0 * x0 * x0);
        block[(0, 1)] = -4.0 * self.b * x0;
        block[(1, 0)] = -4.0 * self.b * x0;
        block[(1, 1)] = 2.0 * self.b;
        self.value_and_gradient(arguments, gradient)
    }
}

/// Componentwise exponential reparameterization `x = exp(t)`.
///
/// Keeps a variable strictly positive while the solver works in an
/// unbounded space. The Jacobian of `t -> x` is `diag(exp(t))`, so the
/// gradient pullback scales each component by `exp(t_i)`.
#[derive(Debug, Clone, Copy)]
pub struct Exponential {
    dimension: usize,
}

impl Exponential {
    /// Initializes the transform for a variable of the given dimension.
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl ChangeOfVariables for Exponential {
    fn x_dimension(&self) -> usize {
        self.dimension
    }

    fn t_dimension(&self) -> usize {
        self.dimension
    }

    fn t_to_x(&self, x: &mut [f64], t: &[f64]) {
        for (x, t) in x.iter_mut().zip(t) {
            *x = t.exp();
        }
    }

    fn x_to_t(&self, t: &mut [f64], x: &[f64]) {
        for (t, x) in t.iter_mut().zip(x) {
            *t = x.ln();
        }
    }

    fn update_gradient(&self, gradient: &mut [f64], t: &[f64], user_gradient: &[f64]) {
        for i in 0..self.dimension {
            gradient[i] += t[i].exp() * user_gradient[i];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;
    use nalgebra::dvector;

    #[test]
    fn affine_evaluates_the_inner_products() {
        let term = Affine::new(vec![dvector![1.0, 2.0], dvector![-1.0]], 0.5);
        assert_eq!(term.arity(), 2);
        assert_eq!(term.dimension(0), 2);

        let value = term.value(&[&[3.0, 4.0], &[2.0]]).unwrap();
        assert_abs_diff_eq!(value, 3.0 + 8.0 - 2.0 + 0.5, epsilon = 1e-14);
    }

    #[test]
    fn bilinear_hessian_blocks_are_transposes() {
        let term = Bilinear::new(dvector![1.0, 2.0], dvector![3.0]);
        let mut gradient = [DVector::zeros(2), DVector::zeros(1)];
        let mut hessian = TermHessian::for_term(&term);

        term.value_gradient_hessian(&[&[1.0, 1.0], &[1.0]], &mut gradient, &mut hessian)
            .unwrap();

        assert_eq!(hessian.block(0, 1).as_slice(), &[3.0, 6.0]);
        assert_eq!(
            hessian.block(1, 0).clone(),
            hessian.block(0, 1).transpose()
        );
    }

    #[test]
    fn exponential_round_trips() {
        let change = Exponential::new(2);
        let t = [0.5, -1.0];
        let mut x = [0.0; 2];
        change.t_to_x(&mut x, &t);
        let mut back = [0.0; 2];
        change.x_to_t(&mut back, &x);
        assert_abs_diff_eq!(back[0], t[0], epsilon = 1e-14);
        assert_abs_diff_eq!(back[1], t[1], epsilon = 1e-14);
    }
}
