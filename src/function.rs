//! Additive objective functions composed of [`Term`]s.
//!
//! A [`Function`] is a sum of terms, each contributing over a subset of the
//! registered [`Variable`]s. Registration assigns every variable a fixed
//! offset into a flat solver-space vector; evaluation accumulates the terms'
//! values, gradients and Hessian blocks into global quantities. Terms are
//! evaluated in parallel, partitioned into contiguous chunks by term index,
//! so results are deterministic for a fixed worker count.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use sprs::{CsMat, TriMat};
use thiserror::Error;

use crate::core::{ChangeOfVariables, Term, TermError, TermHessian, Variable, VariableId};

/// Error returned from [`Function`] operations.
#[derive(Debug, Error)]
pub enum FunctionError {
    /// A dimension disagrees with what was registered or declared.
    #[error("dimension mismatch: expected {expected}, got {found}")]
    DimensionMismatch {
        /// The registered or declared dimension.
        expected: usize,
        /// The dimension that was supplied.
        found: usize,
    },
    /// The number of term arguments differs from the term's arity.
    #[error("term expects {expected} arguments, {found} were given")]
    ArityMismatch {
        /// The term's arity.
        expected: usize,
        /// The number of arguments supplied.
        found: usize,
    },
    /// A term argument has not been registered with the function.
    #[error("argument variable has not been registered")]
    UnknownVariable,
    /// A Hessian was requested but support was disabled at construction.
    #[error("Hessian support is disabled for this function")]
    HessianDisabled,
    /// A Hessian was requested for a term argument that has a change of
    /// variables attached.
    #[error("Hessian is not supported for variables with a change of variables")]
    UnsupportedChangeOfVariables,
    /// A term failed during evaluation; carries the first captured message.
    #[error("term evaluation failed: {0}")]
    Evaluation(String),
    /// The requested number of worker threads is not positive.
    #[error("the number of worker threads must be positive")]
    InvalidThreadCount,
}

struct RegisteredVariable {
    handle: Variable,
    user_dimension: usize,
    solver_dimension: usize,
    global_index: usize,
    change: Option<Arc<dyn ChangeOfVariables>>,
    /// User-space values used during evaluation.
    temp: Vec<f64>,
    /// Solver-space values, kept for the gradient pullback.
    solver_temp: Vec<f64>,
}

struct AddedTerm {
    term: Arc<dyn Term>,
    arguments: Vec<usize>,
    hessian: Option<TermHessian>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum EvaluationMode {
    Value,
    Gradient,
    GradientAndHessian,
}

struct Worker {
    gradient: DVector<f64>,
    scratch: Vec<DVector<f64>>,
    error: Option<TermError>,
}

impl Worker {
    /// Evaluate one contiguous chunk of terms, accumulating gradients into
    /// this worker's buffer. Returns the partial value sum; a failure is
    /// parked in the worker's error slot and stops the chunk.
    fn run(
        &mut self,
        terms: &mut [AddedTerm],
        variables: &[RegisteredVariable],
        mode: EvaluationMode,
    ) -> f64 {
        let mut sum = 0.0;
        for added in terms.iter_mut() {
            let arity = added.arguments.len();
            let views: Vec<&[f64]> = added
                .arguments
                .iter()
                .map(|&slot| variables[slot].temp.as_slice())
                .collect();

            let result = match mode {
                EvaluationMode::Value => added.term.value(&views),
                EvaluationMode::Gradient => added
                    .term
                    .value_and_gradient(&views, &mut self.scratch[..arity]),
                EvaluationMode::GradientAndHessian => match added.hessian.as_mut() {
                    Some(hessian) => added.term.value_gradient_hessian(
                        &views,
                        &mut self.scratch[..arity],
                        hessian,
                    ),
                    None => Err(TermError::HessianNotSupported),
                },
            };

            match result {
                Ok(value) => sum += value,
                Err(error) => {
                    self.error = Some(error);
                    return sum;
                }
            }

            if mode == EvaluationMode::Value {
                continue;
            }

            for (argument, &slot) in added.arguments.iter().enumerate() {
                let variable = &variables[slot];
                let offset = variable.global_index;
                match &variable.change {
                    None => {
                        for i in 0..variable.user_dimension {
                            self.gradient[offset + i] += self.scratch[argument][i];
                        }
                    }
                    Some(change) => {
                        let gradient = &mut self.gradient.as_mut_slice()
                            [offset..offset + variable.solver_dimension];
                        change.update_gradient(
                            gradient,
                            &variable.solver_temp,
                            &self.scratch[argument].as_slice()[..variable.user_dimension],
                        );
                    }
                }
            }
        }
        sum
    }
}

/// An additive objective over registered variables.
///
/// Variables are registered first, then terms referencing them; both are
/// append-only. Evaluation works either from the variables' current user
/// values ([`evaluate`](Function::evaluate)) or from a flat solver-space
/// vector of length [`number_of_scalars`](Function::number_of_scalars),
/// optionally producing a gradient and a dense or sparse Hessian.
pub struct Function {
    variables: Vec<RegisteredVariable>,
    slots: HashMap<VariableId, usize>,
    terms: Vec<AddedTerm>,
    number_of_scalars: usize,
    hessian_enabled: bool,
    number_of_hessian_elements: usize,
    number_of_workers: usize,
    workers: Vec<Worker>,
    local_storage_allocated: bool,
    evaluations_without_gradient: usize,
    evaluations_with_gradient: usize,
    evaluate_time: Duration,
    write_time: Duration,
    copy_time: Duration,
}

impl Function {
    /// Create an empty function with Hessian support enabled.
    pub fn new() -> Self {
        Self {
            variables: Vec::new(),
            slots: HashMap::new(),
            terms: Vec::new(),
            number_of_scalars: 0,
            hessian_enabled: true,
            number_of_hessian_elements: 0,
            number_of_workers: rayon::current_num_threads(),
            workers: Vec::new(),
            local_storage_allocated: false,
            evaluations_without_gradient: 0,
            evaluations_with_gradient: 0,
            evaluate_time: Duration::ZERO,
            write_time: Duration::ZERO,
            copy_time: Duration::ZERO,
        }
    }

    /// Create an empty function that never allocates Hessian scratch.
    ///
    /// Hessian evaluations on such a function fail with
    /// [`FunctionError::HessianDisabled`].
    pub fn with_hessian_disabled() -> Self {
        Self {
            hessian_enabled: false,
            ..Self::new()
        }
    }

    /// Register a variable.
    ///
    /// Registration is idempotent: re-adding the same handle is a no-op,
    /// unless its dimension no longer matches the registered one, which
    /// fails with [`FunctionError::DimensionMismatch`]. The variable is
    /// assigned the next free offset into the flat solver vector.
    pub fn add_variable(&mut self, variable: &Variable) -> Result<(), FunctionError> {
        self.register(variable, None)
    }

    /// Register a variable with a change of variables.
    ///
    /// The variable dimension must equal the transform's
    /// [`x_dimension`](ChangeOfVariables::x_dimension); the variable then
    /// occupies [`t_dimension`](ChangeOfVariables::t_dimension) scalars of
    /// the flat solver vector.
    pub fn add_variable_with_change(
        &mut self,
        variable: &Variable,
        change: Arc<dyn ChangeOfVariables>,
    ) -> Result<(), FunctionError> {
        self.register(variable, Some(change))
    }

    fn register(
        &mut self,
        variable: &Variable,
        change: Option<Arc<dyn ChangeOfVariables>>,
    ) -> Result<(), FunctionError> {
        self.local_storage_allocated = false;

        let user_dimension = variable.dimension();
        if let Some(&slot) = self.slots.get(&variable.id()) {
            let registered = self.variables[slot].user_dimension;
            if registered != user_dimension {
                return Err(FunctionError::DimensionMismatch {
                    expected: registered,
                    found: user_dimension,
                });
            }
            return Ok(());
        }

        let solver_dimension = match &change {
            Some(change) => {
                if change.x_dimension() != user_dimension {
                    return Err(FunctionError::DimensionMismatch {
                        expected: change.x_dimension(),
                        found: user_dimension,
                    });
                }
                change.t_dimension()
            }
            None => user_dimension,
        };

        self.slots.insert(variable.id(), self.variables.len());
        self.variables.push(RegisteredVariable {
            handle: variable.clone(),
            user_dimension,
            solver_dimension,
            global_index: self.number_of_scalars,
            change,
            temp: vec![0.0; user_dimension],
            solver_temp: vec![0.0; solver_dimension],
        });
        self.number_of_scalars += solver_dimension;
        Ok(())
    }

    /// Add a term over the given argument variables.
    ///
    /// The argument count must match the term's arity, every argument must
    /// already be registered, and each argument's dimension must equal the
    /// dimension the term declares for that position. When Hessian support
    /// is enabled, the term's block scratch is pre-allocated here.
    pub fn add_term(
        &mut self,
        term: Arc<dyn Term>,
        arguments: &[&Variable],
    ) -> Result<(), FunctionError> {
        self.local_storage_allocated = false;

        if term.arity() != arguments.len() {
            return Err(FunctionError::ArityMismatch {
                expected: term.arity(),
                found: arguments.len(),
            });
        }

        let mut slots = Vec::with_capacity(arguments.len());
        for (argument, variable) in arguments.iter().enumerate() {
            let &slot = self
                .slots
                .get(&variable.id())
                .ok_or(FunctionError::UnknownVariable)?;
            let registered = self.variables[slot].user_dimension;
            if registered != term.dimension(argument) {
                return Err(FunctionError::DimensionMismatch {
                    expected: term.dimension(argument),
                    found: registered,
                });
            }
            slots.push(slot);
        }

        let hessian = self
            .hessian_enabled
            .then(|| TermHessian::for_term(term.as_ref()));
        self.terms.push(AddedTerm {
            term,
            arguments: slots,
            hessian,
        });
        Ok(())
    }

    /// Total length of the flat solver-space vector.
    pub fn number_of_scalars(&self) -> usize {
        self.number_of_scalars
    }

    /// Number of registered variables.
    pub fn number_of_variables(&self) -> usize {
        self.variables.len()
    }

    /// Number of added terms.
    pub fn number_of_terms(&self) -> usize {
        self.terms.len()
    }

    /// Set the number of parallel workers used for term evaluation.
    ///
    /// Workers are logical partitions of the term list; they run on the
    /// global thread pool. Fails with [`FunctionError::InvalidThreadCount`]
    /// for zero.
    pub fn set_number_of_threads(&mut self, workers: usize) -> Result<(), FunctionError> {
        if workers == 0 {
            return Err(FunctionError::InvalidThreadCount);
        }
        self.local_storage_allocated = false;
        self.number_of_workers = workers;
        Ok(())
    }

    /// Evaluate the function at the variables' current user values.
    pub fn evaluate(&mut self) -> Result<f64, FunctionError> {
        self.evaluations_without_gradient += 1;
        self.prepare();
        self.copy_user_to_local();
        self.evaluate_terms(EvaluationMode::Value)
    }

    /// Evaluate the function at a flat solver-space vector.
    pub fn evaluate_at(&mut self, x: &DVector<f64>) -> Result<f64, FunctionError> {
        self.evaluations_without_gradient += 1;
        self.prepare();
        self.copy_global_to_local(x);
        self.evaluate_terms(EvaluationMode::Value)
    }

    /// Evaluate the function and its gradient at a flat solver-space vector.
    ///
    /// `gradient` is resized to [`number_of_scalars`](Self::number_of_scalars)
    /// if needed. Gradients of variables with a change of variables are
    /// pulled back to solver space through
    /// [`ChangeOfVariables::update_gradient`].
    pub fn evaluate_with_gradient(
        &mut self,
        x: &DVector<f64>,
        gradient: &mut DVector<f64>,
    ) -> Result<f64, FunctionError> {
        self.evaluations_with_gradient += 1;
        self.prepare();
        self.copy_global_to_local(x);
        let value = self.evaluate_terms(EvaluationMode::Gradient)?;
        self.reduce_gradient(gradient);
        Ok(value)
    }

    /// Evaluate the function, its gradient and its dense Hessian.
    ///
    /// Fails with [`FunctionError::HessianDisabled`] if Hessian support was
    /// disabled at construction and with
    /// [`FunctionError::UnsupportedChangeOfVariables`] if any term argument
    /// has a change of variables attached (the gradient path supports the
    /// transform, the Hessian paths deliberately do not).
    pub fn evaluate_with_hessian(
        &mut self,
        x: &DVector<f64>,
        gradient: &mut DVector<f64>,
        hessian: &mut DMatrix<f64>,
    ) -> Result<f64, FunctionError> {
        self.ensure_hessian_supported()?;
        self.evaluations_with_gradient += 1;
        self.prepare();
        self.copy_global_to_local(x);
        let value = self.evaluate_terms(EvaluationMode::GradientAndHessian)?;
        self.reduce_gradient(gradient);

        let start = Instant::now();
        let n = self.number_of_scalars;
        if hessian.shape() != (n, n) {
            *hessian = DMatrix::zeros(n, n);
        } else {
            hessian.fill(0.0);
        }
        for added in &self.terms {
            let Some(blocks) = &added.hessian else { continue };
            for (a, &slot_a) in added.arguments.iter().enumerate() {
                let offset_a = self.variables[slot_a].global_index;
                for (b, &slot_b) in added.arguments.iter().enumerate() {
                    let offset_b = self.variables[slot_b].global_index;
                    let block = blocks.block(a, b);
                    for i in 0..block.nrows() {
                        for j in 0..block.ncols() {
                            hessian[(offset_a + i, offset_b + j)] += block[(i, j)];
                        }
                    }
                }
            }
        }
        self.write_time += start.elapsed();
        Ok(value)
    }

    /// Evaluate the function, its gradient and its sparse Hessian.
    ///
    /// The Hessian is assembled from a triplet list (pre-sized from the last
    /// structural or numeric pass) and compressed; duplicate entries are
    /// summed. The failure modes of
    /// [`evaluate_with_hessian`](Self::evaluate_with_hessian) apply.
    pub fn evaluate_with_sparse_hessian(
        &mut self,
        x: &DVector<f64>,
        gradient: &mut DVector<f64>,
        hessian: &mut CsMat<f64>,
    ) -> Result<f64, FunctionError> {
        self.ensure_hessian_supported()?;
        self.evaluations_with_gradient += 1;
        self.prepare();
        self.copy_global_to_local(x);
        let value = self.evaluate_terms(EvaluationMode::GradientAndHessian)?;
        self.reduce_gradient(gradient);

        let start = Instant::now();
        let n = self.number_of_scalars;
        let mut triplets = TriMat::with_capacity((n, n), self.number_of_hessian_elements);
        let mut elements = 0;
        for added in &self.terms {
            let Some(blocks) = &added.hessian else { continue };
            for (a, &slot_a) in added.arguments.iter().enumerate() {
                let offset_a = self.variables[slot_a].global_index;
                for (b, &slot_b) in added.arguments.iter().enumerate() {
                    let offset_b = self.variables[slot_b].global_index;
                    let block = blocks.block(a, b);
                    for i in 0..block.nrows() {
                        for j in 0..block.ncols() {
                            triplets.add_triplet(offset_a + i, offset_b + j, block[(i, j)]);
                            elements += 1;
                        }
                    }
                }
            }
        }
        self.number_of_hessian_elements = elements;
        *hessian = triplets.to_csr();
        self.write_time += start.elapsed();
        Ok(value)
    }

    /// Build the structural sparsity pattern of the Hessian.
    ///
    /// Emits one triplet of value `1.0` per element of every term's block
    /// Hessian and compresses the result. Solvers call this once to discover
    /// the sparsity; the element count is retained to pre-size subsequent
    /// numeric builds.
    pub fn create_sparse_hessian(&mut self) -> CsMat<f64> {
        let n = self.number_of_scalars;
        let mut triplets = TriMat::with_capacity((n, n), self.number_of_hessian_elements);
        let mut elements = 0;
        for added in &self.terms {
            for (a, &slot_a) in added.arguments.iter().enumerate() {
                let offset_a = self.variables[slot_a].global_index;
                for (b, &slot_b) in added.arguments.iter().enumerate() {
                    let offset_b = self.variables[slot_b].global_index;
                    for i in 0..added.term.dimension(a) {
                        for j in 0..added.term.dimension(b) {
                            triplets.add_triplet(offset_a + i, offset_b + j, 1.0);
                            elements += 1;
                        }
                    }
                }
            }
        }
        self.number_of_hessian_elements = elements;
        triplets.to_csr()
    }

    /// Write the variables' current user values into the flat solver vector,
    /// applying `x_to_t` where a change of variables is attached. The vector
    /// is resized to [`number_of_scalars`](Self::number_of_scalars) if
    /// needed.
    pub fn copy_user_to_global(&mut self, x: &mut DVector<f64>) {
        let start = Instant::now();
        if x.len() != self.number_of_scalars {
            *x = DVector::zeros(self.number_of_scalars);
        }
        for variable in &self.variables {
            let out = &mut x.as_mut_slice()
                [variable.global_index..variable.global_index + variable.solver_dimension];
            match &variable.change {
                Some(change) => variable.handle.read(|values| change.x_to_t(out, values)),
                None => variable.handle.read(|values| out.copy_from_slice(values)),
            }
        }
        self.copy_time += start.elapsed();
    }

    /// Write a flat solver vector back into the variables' user storage,
    /// applying `t_to_x` where a change of variables is attached.
    pub fn copy_global_to_user(&mut self, x: &DVector<f64>) {
        let start = Instant::now();
        for variable in &self.variables {
            let t = &x.as_slice()
                [variable.global_index..variable.global_index + variable.solver_dimension];
            match &variable.change {
                Some(change) => variable.handle.write(|values| change.t_to_x(values, t)),
                None => variable.handle.write(|values| values.copy_from_slice(t)),
            }
        }
        self.copy_time += start.elapsed();
    }

    /// Write evaluation counters and accumulated timings to `out`.
    pub fn print_timing_information(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(
            out,
            "Function evaluations without gradient : {}",
            self.evaluations_without_gradient
        )?;
        writeln!(
            out,
            "Function evaluations with gradient    : {}",
            self.evaluations_with_gradient
        )?;
        writeln!(out, "Function evaluate time     : {:?}", self.evaluate_time)?;
        writeln!(out, "Function write g/H time    : {:?}", self.write_time)?;
        writeln!(out, "Function copy data time    : {:?}", self.copy_time)
    }

    fn ensure_hessian_supported(&self) -> Result<(), FunctionError> {
        if !self.hessian_enabled {
            return Err(FunctionError::HessianDisabled);
        }
        for added in &self.terms {
            for &slot in &added.arguments {
                if self.variables[slot].change.is_some() {
                    return Err(FunctionError::UnsupportedChangeOfVariables);
                }
            }
        }
        Ok(())
    }

    /// Lazily (re)allocate the per-worker buffers. Any structural change
    /// (variable added, term added, worker count changed) invalidates them.
    fn prepare(&mut self) {
        if self.local_storage_allocated {
            return;
        }
        let max_arity = self
            .terms
            .iter()
            .map(|added| added.arguments.len())
            .max()
            .unwrap_or(1)
            .max(1);
        let max_dimension = self
            .variables
            .iter()
            .map(|variable| variable.user_dimension)
            .max()
            .unwrap_or(1)
            .max(1);
        self.workers = (0..self.number_of_workers)
            .map(|_| Worker {
                gradient: DVector::zeros(self.number_of_scalars),
                scratch: vec![DVector::zeros(max_dimension); max_arity],
                error: None,
            })
            .collect();
        self.local_storage_allocated = true;
    }

    fn copy_user_to_local(&mut self) {
        let start = Instant::now();
        for variable in &mut self.variables {
            variable
                .handle
                .read(|values| variable.temp.copy_from_slice(values));
        }
        self.copy_time += start.elapsed();
    }

    fn copy_global_to_local(&mut self, x: &DVector<f64>) {
        let start = Instant::now();
        for variable in &mut self.variables {
            let t = &x.as_slice()
                [variable.global_index..variable.global_index + variable.solver_dimension];
            match &variable.change {
                Some(change) => {
                    change.t_to_x(&mut variable.temp, t);
                    variable.solver_temp.copy_from_slice(t);
                }
                None => variable.temp.copy_from_slice(t),
            }
        }
        self.copy_time += start.elapsed();
    }

    /// Run the parallel term loop. Per-worker failures are parked in the
    /// workers' error slots and joined after the parallel region; the first
    /// captured message is surfaced as a single evaluation error.
    fn evaluate_terms(&mut self, mode: EvaluationMode) -> Result<f64, FunctionError> {
        let start = Instant::now();
        for worker in &mut self.workers {
            worker.gradient.fill(0.0);
            worker.error = None;
        }

        let variables = &self.variables;
        let chunk = self.terms.len().div_ceil(self.workers.len().max(1)).max(1);
        let partials: Vec<f64> = self
            .terms
            .par_chunks_mut(chunk)
            .zip(self.workers.par_iter_mut())
            .map(|(terms, worker)| worker.run(terms, variables, mode))
            .collect();
        self.evaluate_time += start.elapsed();

        let mut first_error = None;
        for worker in &mut self.workers {
            let error = worker.error.take();
            first_error = first_error.or(error);
        }
        if let Some(error) = first_error {
            return Err(FunctionError::Evaluation(error.to_string()));
        }
        Ok(partials.into_iter().sum())
    }

    fn reduce_gradient(&mut self, gradient: &mut DVector<f64>) {
        let start = Instant::now();
        if gradient.len() != self.number_of_scalars {
            *gradient = DVector::zeros(self.number_of_scalars);
        } else {
            gradient.fill(0.0);
        }
        for worker in &self.workers {
            *gradient += &worker.gradient;
        }
        self.write_time += start.elapsed();
    }
}

impl Default for Function {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Bilinear, Exponential, Rosenbrock, SquaredDistance};

    use approx::assert_abs_diff_eq;
    use nalgebra::dvector;

    /// A term whose evaluation always fails.
    struct Failing;

    impl Term for Failing {
        fn arity(&self) -> usize {
            1
        }

        fn dimension(&self, _argument: usize) -> usize {
            1
        }

        fn value(&self, _arguments: &[&[f64]]) -> Result<f64, TermError> {
            Err(TermError::Failed("singular residual".to_string()))
        }

        fn value_and_gradient(
            &self,
            _arguments: &[&[f64]],
            _gradient: &mut [DVector<f64>],
        ) -> Result<f64, TermError> {
            Err(TermError::Failed("singular residual".to_string()))
        }
    }

    fn coupled_function() -> (Function, Variable, Variable) {
        // f(u, v) = |u - (1, 2)|^2 + |v - (-1)|^2 + (u . (1, 1)) * (v . (2))
        let u = Variable::new([0.5, -0.5]);
        let v = Variable::scalar(2.0);

        let mut function = Function::new();
        function.add_variable(&u).unwrap();
        function.add_variable(&v).unwrap();
        function
            .add_term(
                Arc::new(SquaredDistance::new(dvector![1.0, 2.0])),
                &[&u],
            )
            .unwrap();
        function
            .add_term(Arc::new(SquaredDistance::new(dvector![-1.0])), &[&v])
            .unwrap();
        function
            .add_term(
                Arc::new(Bilinear::new(dvector![1.0, 1.0], dvector![2.0])),
                &[&u, &v],
            )
            .unwrap();
        (function, u, v)
    }

    fn coupled_value(u: &[f64], v: &[f64]) -> f64 {
        (u[0] - 1.0).powi(2)
            + (u[1] - 2.0).powi(2)
            + (v[0] + 1.0).powi(2)
            + (u[0] + u[1]) * 2.0 * v[0]
    }

    fn coupled_gradient(u: &[f64], v: &[f64]) -> DVector<f64> {
        dvector![
            2.0 * (u[0] - 1.0) + 2.0 * v[0],
            2.0 * (u[1] - 2.0) + 2.0 * v[0],
            2.0 * (v[0] + 1.0) + 2.0 * (u[0] + u[1])
        ]
    }

    #[test]
    fn variable_indices_follow_insertion_order() {
        let u = Variable::zeros(2);
        let v = Variable::zeros(3);
        let w = Variable::zeros(1);

        let mut function = Function::new();
        function.add_variable(&u).unwrap();
        function.add_variable(&v).unwrap();
        function.add_variable(&w).unwrap();
        assert_eq!(function.number_of_scalars(), 6);
        assert_eq!(function.number_of_variables(), 3);

        // Re-adding is a no-op and offsets do not shift.
        function.add_variable(&v).unwrap();
        assert_eq!(function.number_of_scalars(), 6);

        // Offsets are visible through the flat vector layout.
        u.set(&[1.0, 2.0]);
        v.set(&[3.0, 4.0, 5.0]);
        w.set(&[6.0]);
        let mut x = DVector::zeros(0);
        function.copy_user_to_global(&mut x);
        assert_eq!(x, dvector![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn add_term_validates_structure() {
        let u = Variable::zeros(2);
        let unregistered = Variable::zeros(1);

        let mut function = Function::new();
        function.add_variable(&u).unwrap();

        let term = Arc::new(SquaredDistance::new(dvector![0.0, 0.0]));
        assert!(matches!(
            function.add_term(term.clone(), &[&u, &u]),
            Err(FunctionError::ArityMismatch {
                expected: 1,
                found: 2
            })
        ));
        assert!(matches!(
            function.add_term(term.clone(), &[&unregistered]),
            Err(FunctionError::UnknownVariable)
        ));

        let wrong_dimension = Arc::new(SquaredDistance::new(dvector![0.0]));
        assert!(matches!(
            function.add_term(wrong_dimension, &[&u]),
            Err(FunctionError::DimensionMismatch {
                expected: 1,
                found: 2
            })
        ));

        function.add_term(term, &[&u]).unwrap();
        assert_eq!(function.number_of_terms(), 1);
    }

    #[test]
    fn change_of_variables_must_match_dimension() {
        let x = Variable::zeros(2);
        let mut function = Function::new();
        assert!(matches!(
            function.add_variable_with_change(&x, Arc::new(Exponential::new(3))),
            Err(FunctionError::DimensionMismatch {
                expected: 3,
                found: 2
            })
        ));
    }

    #[test]
    fn evaluate_matches_user_and_solver_paths() {
        let (mut function, u, v) = coupled_function();
        let expected = coupled_value(&u.values(), &v.values());

        assert_abs_diff_eq!(function.evaluate().unwrap(), expected, epsilon = 1e-14);

        let mut x = DVector::zeros(0);
        function.copy_user_to_global(&mut x);
        assert_abs_diff_eq!(function.evaluate_at(&x).unwrap(), expected, epsilon = 1e-14);
    }

    #[test]
    fn gradient_is_assembled_from_term_contributions() {
        let (mut function, _, _) = coupled_function();
        let x = dvector![0.2, 0.4, -0.3];
        let mut gradient = DVector::zeros(0);

        let value = function.evaluate_with_gradient(&x, &mut gradient).unwrap();

        assert_abs_diff_eq!(
            value,
            coupled_value(&[0.2, 0.4], &[-0.3]),
            epsilon = 1e-14
        );
        assert_abs_diff_eq!(
            gradient,
            coupled_gradient(&[0.2, 0.4], &[-0.3]),
            epsilon = 1e-14
        );
    }

    #[test]
    fn dense_hessian_is_assembled_and_symmetric() {
        let (mut function, _, _) = coupled_function();
        let x = dvector![0.2, 0.4, -0.3];
        let mut gradient = DVector::zeros(0);
        let mut hessian = DMatrix::zeros(0, 0);

        function
            .evaluate_with_hessian(&x, &mut gradient, &mut hessian)
            .unwrap();

        let expected = nalgebra::dmatrix![
            2.0, 0.0, 2.0;
            0.0, 2.0, 2.0;
            2.0, 2.0, 2.0
        ];
        assert_abs_diff_eq!(hessian, expected, epsilon = 1e-14);
        assert_abs_diff_eq!(hessian.transpose(), hessian, epsilon = 1e-14);
    }

    #[test]
    fn rosenbrock_hessian_matches_closed_form() {
        let x = Variable::new([-1.2, 1.0]);
        let mut function = Function::new();
        function.add_variable(&x).unwrap();
        function
            .add_term(Arc::new(Rosenbrock::new(1.0, 100.0)), &[&x])
            .unwrap();

        let point = dvector![-1.2, 1.0];
        let mut gradient = DVector::zeros(0);
        let mut hessian = DMatrix::zeros(0, 0);
        function
            .evaluate_with_hessian(&point, &mut gradient, &mut hessian)
            .unwrap();

        let (a, b, x0, x1) = (1.0, 100.0, -1.2, 1.0);
        assert_abs_diff_eq!(
            gradient,
            dvector![
                -2.0 * (a - x0) - 4.0 * b * x0 * (x1 - x0 * x0),
                2.0 * b * (x1 - x0 * x0)
            ],
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            hessian,
            nalgebra::dmatrix![
                2.0 - 4.0 * b * (x1 - 3.0 * x0 * x0), -4.0 * b * x0;
                -4.0 * b * x0, 2.0 * b
            ],
            epsilon = 1e-12
        );
    }

    #[test]
    fn sparse_hessian_matches_dense() {
        let (mut function, _, _) = coupled_function();
        let x = dvector![0.2, 0.4, -0.3];
        let mut gradient = DVector::zeros(0);
        let mut dense = DMatrix::zeros(0, 0);
        let mut sparse = CsMat::zero((0, 0));

        function
            .evaluate_with_hessian(&x, &mut gradient, &mut dense)
            .unwrap();
        function
            .evaluate_with_sparse_hessian(&x, &mut gradient, &mut sparse)
            .unwrap();

        assert_eq!(sparse.shape(), (3, 3));
        for (&value, (i, j)) in sparse.iter() {
            assert_abs_diff_eq!(value, dense[(i, j)], epsilon = 1e-14);
        }
    }

    #[test]
    fn numeric_sparse_entries_are_subset_of_pattern() {
        let (mut function, _, _) = coupled_function();
        let pattern = function.create_sparse_hessian();
        assert_eq!(pattern.shape(), (3, 3));
        for (&value, _) in pattern.iter() {
            assert_eq!(value, 1.0);
        }

        let x = dvector![0.2, 0.4, -0.3];
        let mut gradient = DVector::zeros(0);
        let mut sparse = CsMat::zero((0, 0));
        function
            .evaluate_with_sparse_hessian(&x, &mut gradient, &mut sparse)
            .unwrap();

        let structural: std::collections::HashSet<(usize, usize)> =
            pattern.iter().map(|(_, index)| index).collect();
        for (_, index) in sparse.iter() {
            assert!(structural.contains(&index));
        }
    }

    #[test]
    fn worker_counts_agree() {
        // A few dozen scalar terms so that several chunks are actually used.
        let variables: Vec<Variable> =
            (0..12).map(|i| Variable::scalar(0.1 * i as f64)).collect();
        let mut function = Function::new();
        for variable in &variables {
            function.add_variable(variable).unwrap();
        }
        for (i, variable) in variables.iter().enumerate() {
            function
                .add_term(
                    Arc::new(SquaredDistance::new(dvector![i as f64])),
                    &[variable],
                )
                .unwrap();
        }
        for pair in variables.windows(2) {
            function
                .add_term(
                    Arc::new(Bilinear::new(dvector![1.0], dvector![-0.5])),
                    &[&pair[0], &pair[1]],
                )
                .unwrap();
        }

        let mut x = DVector::zeros(0);
        function.copy_user_to_global(&mut x);

        function.set_number_of_threads(1).unwrap();
        let mut gradient_serial = DVector::zeros(0);
        let serial = function
            .evaluate_with_gradient(&x, &mut gradient_serial)
            .unwrap();

        function.set_number_of_threads(4).unwrap();
        let mut gradient_parallel = DVector::zeros(0);
        let parallel = function
            .evaluate_with_gradient(&x, &mut gradient_parallel)
            .unwrap();

        assert_abs_diff_eq!(serial, parallel, epsilon = 1e-12);
        assert_abs_diff_eq!(gradient_serial, gradient_parallel, epsilon = 1e-12);
    }

    #[test]
    fn gradient_is_pulled_back_through_change_of_variables() {
        // f(x) = x^2 with x = exp(t): df/dt = 2 exp(2t).
        let x = Variable::scalar(2.0);
        let mut function = Function::new();
        function
            .add_variable_with_change(&x, Arc::new(Exponential::new(1)))
            .unwrap();
        function
            .add_term(Arc::new(SquaredDistance::new(dvector![0.0])), &[&x])
            .unwrap();

        let mut t = DVector::zeros(0);
        function.copy_user_to_global(&mut t);
        assert_abs_diff_eq!(t[0], 2.0f64.ln(), epsilon = 1e-14);

        let mut gradient = DVector::zeros(0);
        let value = function.evaluate_with_gradient(&t, &mut gradient).unwrap();
        assert_abs_diff_eq!(value, 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(gradient[0], 2.0 * (2.0 * t[0]).exp(), epsilon = 1e-12);

        // Round-trip back to user space.
        function.copy_global_to_user(&t);
        assert_abs_diff_eq!(x.values()[0], 2.0, epsilon = 1e-14);
    }

    #[test]
    fn hessian_rejects_change_of_variables() {
        let x = Variable::scalar(1.0);
        let mut function = Function::new();
        function
            .add_variable_with_change(&x, Arc::new(Exponential::new(1)))
            .unwrap();
        function
            .add_term(Arc::new(SquaredDistance::new(dvector![0.0])), &[&x])
            .unwrap();

        let t = dvector![0.0];
        let mut gradient = DVector::zeros(0);
        let mut hessian = DMatrix::zeros(0, 0);
        assert!(matches!(
            function.evaluate_with_hessian(&t, &mut gradient, &mut hessian),
            Err(FunctionError::UnsupportedChangeOfVariables)
        ));
    }

    #[test]
    fn hessian_can_be_disabled() {
        let x = Variable::scalar(1.0);
        let mut function = Function::with_hessian_disabled();
        function.add_variable(&x).unwrap();
        function
            .add_term(Arc::new(SquaredDistance::new(dvector![0.0])), &[&x])
            .unwrap();

        let point = dvector![1.0];
        let mut gradient = DVector::zeros(0);

        // The gradient path is unaffected.
        function
            .evaluate_with_gradient(&point, &mut gradient)
            .unwrap();

        let mut hessian = DMatrix::zeros(0, 0);
        assert!(matches!(
            function.evaluate_with_hessian(&point, &mut gradient, &mut hessian),
            Err(FunctionError::HessianDisabled)
        ));
    }

    #[test]
    fn term_failure_is_captured_across_the_parallel_region() {
        let x = Variable::scalar(1.0);
        let mut function = Function::new();
        function.add_variable(&x).unwrap();
        for _ in 0..8 {
            function
                .add_term(Arc::new(SquaredDistance::new(dvector![0.0])), &[&x])
                .unwrap();
        }
        function.add_term(Arc::new(Failing), &[&x]).unwrap();

        match function.evaluate() {
            Err(FunctionError::Evaluation(message)) => {
                assert!(message.contains("singular residual"));
            }
            other => panic!("expected evaluation error, got {other:?}"),
        }

        let mut gradient = DVector::zeros(0);
        assert!(matches!(
            function.evaluate_with_gradient(&dvector![1.0], &mut gradient),
            Err(FunctionError::Evaluation(_))
        ));
    }

    #[test]
    fn zero_threads_is_rejected() {
        let mut function = Function::new();
        assert!(matches!(
            function.set_number_of_threads(0),
            Err(FunctionError::InvalidThreadCount)
        ));
        function.set_number_of_threads(2).unwrap();
    }

    #[test]
    fn empty_function_evaluates_to_zero() {
        let mut function = Function::new();
        assert_eq!(function.evaluate().unwrap(), 0.0);
        assert_eq!(function.number_of_scalars(), 0);
    }
}
