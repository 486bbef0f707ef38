//! Reverse-mode adjoint propagation.
//!
//! Gradients are built as graph nodes: [`backprop`] walks the forward graph
//! in reverse topological order and calls each node's rule in [`vjp`], which
//! appends the ops computing its inputs' deltas and records them in an
//! [`Adjoints`] accumulator.

pub mod adjoints;
pub mod backprop;
pub mod vjp;

pub use adjoints::Adjoints;
pub use backprop::backprop;
pub use vjp::propagate;
