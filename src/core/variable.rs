use std::sync::{Arc, RwLock};

/// A shared handle to the user-space storage of an optimization variable.
///
/// The handle owns a fixed-length vector of values. Cloning it is cheap and
/// yields another handle to the *same* storage; the storage allocation is
/// the identity under which a [`Function`](crate::function::Function)
/// registers the variable, so the same handle can participate in several
/// functions (an objective and its constraints, for instance) and they all
/// observe the same current values.
#[derive(Clone, Debug)]
pub struct Variable {
    values: Arc<RwLock<Vec<f64>>>,
}

/// Opaque identity of a [`Variable`]'s storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VariableId(usize);

impl Variable {
    /// Create a variable holding the given values.
    pub fn new(values: impl Into<Vec<f64>>) -> Self {
        Self {
            values: Arc::new(RwLock::new(values.into())),
        }
    }

    /// Create a variable of the given dimension, initialized to zero.
    pub fn zeros(dimension: usize) -> Self {
        Self::new(vec![0.0; dimension])
    }

    /// Create a one-dimensional variable.
    pub fn scalar(value: f64) -> Self {
        Self::new(vec![value])
    }

    /// Dimension of the variable in user space.
    pub fn dimension(&self) -> usize {
        self.read(|values| values.len())
    }

    /// A copy of the current values.
    pub fn values(&self) -> Vec<f64> {
        self.read(|values| values.to_vec())
    }

    /// Overwrite the current values.
    ///
    /// # Panics
    ///
    /// Panics if `values` does not match the variable dimension; the
    /// dimension is fixed at creation.
    pub fn set(&self, values: &[f64]) {
        self.write(|stored| {
            assert_eq!(stored.len(), values.len(), "variable dimension is fixed");
            stored.copy_from_slice(values);
        });
    }

    /// The storage identity of this handle.
    pub fn id(&self) -> VariableId {
        VariableId(Arc::as_ptr(&self.values) as usize)
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&[f64]) -> R) -> R {
        let guard = self.values.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&guard)
    }

    pub(crate) fn write<R>(&self, f: impl FnOnce(&mut [f64]) -> R) -> R {
        let mut guard = self.values.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_storage() {
        let x = Variable::new([1.0, 2.0]);
        let alias = x.clone();
        alias.set(&[3.0, 4.0]);

        assert_eq!(x.values(), vec![3.0, 4.0]);
        assert_eq!(x.id(), alias.id());
    }

    #[test]
    fn distinct_variables_have_distinct_ids() {
        let x = Variable::scalar(1.0);
        let y = Variable::scalar(1.0);
        assert_ne!(x.id(), y.id());
    }

    #[test]
    #[should_panic(expected = "dimension is fixed")]
    fn set_rejects_resize() {
        Variable::zeros(2).set(&[0.0]);
    }
}
