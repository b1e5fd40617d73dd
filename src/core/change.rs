/// A smooth bijection between the user parameterization `x` and the solver
/// parameterization `t`.
///
/// Attaching a change of variables to a variable lets the solver work in an
/// unbounded space while the user keeps a natural parameterization, e.g.
/// `x = exp(t)` for a variable that must stay positive. The two spaces may
/// have different dimensions.
///
/// Only the dense gradient paths support changes of variables; requesting a
/// Hessian for a function with one attached fails with
/// [`UnsupportedChangeOfVariables`](crate::function::FunctionError::UnsupportedChangeOfVariables).
pub trait ChangeOfVariables: Send + Sync {
    /// Dimension of the user space.
    fn x_dimension(&self) -> usize;

    /// Dimension of the solver space.
    fn t_dimension(&self) -> usize;

    /// Compute `x` from `t`.
    fn t_to_x(&self, x: &mut [f64], t: &[f64]);

    /// Compute `t` from `x`.
    fn x_to_t(&self, t: &mut [f64], x: &[f64]);

    /// Pull a user-space gradient back to solver space.
    ///
    /// Applies the transposed Jacobian of `t_to_x` at `t` to `user_gradient`
    /// and *accumulates* the result into `gradient` (length
    /// [`t_dimension`](ChangeOfVariables::t_dimension)).
    fn update_gradient(&self, gradient: &mut [f64], t: &[f64], user_gradient: &[f64]);
}
