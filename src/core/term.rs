use nalgebra::{DMatrix, DVector};
use thiserror::Error;

/// Error returned from the evaluators of a [`Term`].
#[derive(Debug, Error)]
pub enum TermError {
    /// The term does not implement the gradient evaluator.
    #[error("term does not provide a gradient")]
    GradientNotSupported,
    /// The term does not implement the Hessian evaluator.
    #[error("term does not provide a Hessian")]
    HessianNotSupported,
    /// The evaluation itself failed (domain error, invalid input, ...).
    #[error("{0}")]
    Failed(String),
}

/// An additive contribution to an objective function.
///
/// A term is evaluated over a tuple of variable arguments. It declares how
/// many arguments it consumes ([`arity`](Term::arity)) and the expected
/// dimension of each ([`dimension`](Term::dimension)). Terms are added to a
/// [`Function`](crate::function::Function), which sums their values and
/// assembles their derivatives into a global gradient and Hessian.
///
/// There are three evaluators of increasing cost. Only
/// [`value`](Term::value) is required; the default implementations of the
/// other two fail with [`TermError::GradientNotSupported`] and
/// [`TermError::HessianNotSupported`] so that a term only implements the
/// derivatives it can actually provide.
///
/// ## Implementing a term
///
/// ```rust
/// use minterm::{Term, TermError};
/// use nalgebra::DVector;
///
/// /// f(x) = (x[0] - a)^2 for a one-dimensional variable.
/// struct Shifted {
///     a: f64,
/// }
///
/// impl Term for Shifted {
///     fn arity(&self) -> usize {
///         1
///     }
///
///     fn dimension(&self, _argument: usize) -> usize {
///         1
///     }
///
///     fn value(&self, arguments: &[&[f64]]) -> Result<f64, TermError> {
///         let d = arguments[0][0] - self.a;
///         Ok(d * d)
///     }
///
///     fn value_and_gradient(
///         &self,
///         arguments: &[&[f64]],
///         gradient: &mut [DVector<f64>],
///     ) -> Result<f64, TermError> {
///         let d = arguments[0][0] - self.a;
///         gradient[0][0] = 2.0 * d;
///         Ok(d * d)
///     }
/// }
/// ```
pub trait Term: Send + Sync {
    /// Number of variable arguments the term consumes.
    fn arity(&self) -> usize;

    /// Dimension of the `argument`-th variable, in user space.
    fn dimension(&self, argument: usize) -> usize;

    /// Evaluate the term value.
    ///
    /// `arguments` holds one slice per argument, of length
    /// [`dimension(i)`](Term::dimension), in user (x) space.
    fn value(&self, arguments: &[&[f64]]) -> Result<f64, TermError>;

    /// Evaluate the term value and its per-argument gradient.
    ///
    /// The gradient of argument `i` must be written to `gradient[i][j]` for
    /// `j < dimension(i)`. The buffers may be longer than the argument
    /// dimension and may contain stale values; every entry up to the
    /// dimension must be overwritten, entries beyond it must be left alone.
    fn value_and_gradient(
        &self,
        arguments: &[&[f64]],
        gradient: &mut [DVector<f64>],
    ) -> Result<f64, TermError> {
        let _ = (arguments, gradient);
        Err(TermError::GradientNotSupported)
    }

    /// Evaluate the term value, its gradient and its block Hessian.
    ///
    /// Block `(i, j)` of `hessian` has shape `dimension(i) x dimension(j)`
    /// and must be fully overwritten; the aggregate matrix must be symmetric
    /// across `(i, j)` and `(j, i)`. The gradient contract is the same as in
    /// [`value_and_gradient`](Term::value_and_gradient).
    fn value_gradient_hessian(
        &self,
        arguments: &[&[f64]],
        gradient: &mut [DVector<f64>],
        hessian: &mut TermHessian,
    ) -> Result<f64, TermError> {
        let _ = (arguments, gradient, hessian);
        Err(TermError::HessianNotSupported)
    }
}

/// Pre-allocated `arity x arity` block matrix receiving a term's Hessian.
///
/// Block `(i, j)` has shape `dimension(i) x dimension(j)`. The storage is
/// owned by the function the term was added to and reused across
/// evaluations, so evaluators must overwrite every entry of every block.
#[derive(Debug, Clone)]
pub struct TermHessian {
    arity: usize,
    blocks: Vec<DMatrix<f64>>,
}

impl TermHessian {
    pub(crate) fn for_term(term: &dyn Term) -> Self {
        let arity = term.arity();
        let mut blocks = Vec::with_capacity(arity * arity);
        for i in 0..arity {
            for j in 0..arity {
                blocks.push(DMatrix::zeros(term.dimension(i), term.dimension(j)));
            }
        }
        Self { arity, blocks }
    }

    /// Block `(i, j)`, shaped `dimension(i) x dimension(j)`.
    pub fn block(&self, i: usize, j: usize) -> &DMatrix<f64> {
        &self.blocks[i * self.arity + j]
    }

    /// Mutable access to block `(i, j)`.
    pub fn block_mut(&mut self, i: usize, j: usize) -> &mut DMatrix<f64> {
        &mut self.blocks[i * self.arity + j]
    }
}
