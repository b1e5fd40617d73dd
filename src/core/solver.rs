use crate::function::Function;

/// The reason a solve terminated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitCondition {
    /// The solver failed, typically because an evaluation failed.
    InternalError,
    /// The relative function improvement fell below the tolerance.
    FunctionTolerance,
    /// The gradient (or, for the constrained outer loop, the change of the
    /// dual variables) fell below the tolerance.
    GradientTolerance,
    /// The step in the argument fell below the tolerance.
    ArgumentTolerance,
    /// The iteration limit was reached.
    NoConvergence,
}

impl ExitCondition {
    /// Whether the condition represents a normal termination.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            ExitCondition::FunctionTolerance
                | ExitCondition::GradientTolerance
                | ExitCondition::ArgumentTolerance
        )
    }
}

/// Outcome record of a solve.
///
/// The inner solver overwrites [`exit_condition`](Self::exit_condition) on
/// every call; the constrained outer loop overwrites it again before
/// returning.
#[derive(Clone, Debug)]
pub struct SolverResults {
    /// Why the solve terminated.
    pub exit_condition: ExitCondition,
}

impl SolverResults {
    /// A fresh record, initialized to [`ExitCondition::InternalError`].
    pub fn new() -> Self {
        Self {
            exit_condition: ExitCondition::InternalError,
        }
    }

    /// Whether the recorded condition represents a normal termination.
    pub fn is_success(&self) -> bool {
        self.exit_condition.is_success()
    }
}

impl Default for SolverResults {
    fn default() -> Self {
        Self::new()
    }
}

/// Common interface for unconstrained minimizers.
///
/// A solver minimizes a [`Function`] over its flat solver-space vector. It
/// reads the start point from the current user values
/// ([`Function::copy_user_to_global`]) and writes the minimizer back
/// ([`Function::copy_global_to_user`]) so that repeated calls, as issued by
/// [`ConstrainedFunction::solve`](crate::constrained::ConstrainedFunction::solve),
/// continue from where the previous one stopped.
pub trait Solver {
    /// Minimize `function`, recording the termination in `results`.
    ///
    /// Evaluation failures must not escape; they are reported as
    /// [`ExitCondition::InternalError`].
    fn solve(&self, function: &mut Function, results: &mut SolverResults);

    /// An optional sink for free-form status lines.
    ///
    /// Both the solver itself and the constrained outer loop write their
    /// formatted status strings here when present. The default is `None`.
    fn log_function(&self) -> Option<&dyn Fn(&str)> {
        None
    }
}
