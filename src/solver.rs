//! The collection of implemented solvers.

pub mod lbfgs;

pub use lbfgs::Lbfgs;
