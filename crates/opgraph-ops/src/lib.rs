//! Shape inference, broadcast policies, and graph construction.
//!
//! Every op insertion goes through [`builder`], which runs the op's
//! inference function from [`shape_inference`] against the current graph and
//! only then stores the node. Broadcast-capable ops delegate to the policy
//! engine in [`broadcast`], which reads literal target shapes through
//! [`constant_folding`].

pub mod broadcast;
pub mod builder;
pub mod constant_folding;
pub mod shape_inference;

pub use broadcast::{
    Resolution, broadcast_axes, node_arg_positions, node_broadcast_axes, resolve, resolve_static,
};
pub use builder::{
    add_constant, add_op, add_parameter, broadcast, broadcast_explicit, clone_with_new_inputs,
    refine_parameter, replace_input, revalidate, shape_constant,
};
pub use shape_inference::{Inference, infer};

use opgraph_core::{DType, Output, PartialShape, Shape};

/// Error returned when an op's static preconditions fail.
///
/// Carries the offending values; [`infer`] wraps it into
/// `IrError::Validation` together with the node and op identity.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ShapeError {
    #[error("shape mismatch: {0}")]
    Mismatch(String),

    #[error("expected {expected} inputs, got {got}")]
    Arity { expected: &'static str, got: usize },

    #[error("input {0} does not exist")]
    MissingInput(Output),

    #[error("{what} must be an integral number, but is: {got}")]
    ElementType { what: &'static str, got: DType },

    #[error("element types {a} and {b} do not match")]
    DTypeMismatch { a: DType, b: DType },

    #[error("{what} rank must be {expected}, but has shape {got}")]
    Rank {
        what: &'static str,
        expected: usize,
        got: PartialShape,
    },

    #[error("shapes {a} and {b} are incompatible")]
    ShapeMismatch { a: PartialShape, b: PartialShape },

    #[error("invalid axis {axis} for ndim {ndim}")]
    InvalidAxis { axis: i64, ndim: usize },

    #[error("axes_mapping input should be provided if explicit mode is used")]
    MissingAxesMapping,

    #[error("axes_mapping input should not be provided for mode other than explicit")]
    UnexpectedAxesMapping,

    #[error("Broadcast doesn't permit transposes. axes_mapping {axes:?} not in sorted order")]
    AxesNotSorted { axes: Vec<i64> },

    #[error("Broadcast axes_mapping[{index}]: {axis} exceeds target rank {rank}")]
    AxisOutOfRange {
        index: usize,
        axis: i64,
        rank: usize,
    },

    #[error("Broadcast axes_mapping length {axes} doesn't match rank of input tensor {rank}")]
    AxesLength { axes: usize, rank: usize },

    #[error("Broadcast target[axes_mapping[{index}]] Expected {expected}. Got {got}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        got: usize,
    },

    #[error("Broadcast incorrect target shape at axis {axis}. Expecting either 1 or {arg}. Got {target}")]
    IncompatibleDims {
        axis: usize,
        arg: usize,
        target: usize,
    },

    #[error(
        "Broadcast target_shape has smaller rank {target_rank} than arg shape {arg_rank} aligned at axis {start_axis}"
    )]
    TargetRankTooSmall {
        target_rank: usize,
        arg_rank: usize,
        start_axis: i64,
    },

    #[error("Broadcast target shape entry {index} is negative: {value}")]
    NegativeDimension { index: usize, value: i64 },

    #[error("element count mismatch: shape requires {expected} elements, got {got}")]
    ElementCount { expected: usize, got: usize },

    #[error("element count of shape {shape} overflows")]
    ElementCountOverflow { shape: Shape },

    #[error("concatenated length along axis {axis} overflows")]
    LengthOverflow { axis: usize },

    /// Not a data problem; surfaces as `IrError::Configuration`.
    #[error("{0}")]
    Configuration(String),
}
