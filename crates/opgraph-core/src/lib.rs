//! Typed dataflow graph IR for tensor programs.
//!
//! `opgraph-core` provides the foundational types (`DType`, `Shape`,
//! `PartialShape`, `AutoBroadcastSpec`), the node arena every op instance
//! lives in, the attribute round-trip interface, and the narrow backend
//! contract a fully typed graph is handed to.
//!
//! Shape inference and graph construction live in `opgraph-ops`; reverse-mode
//! adjoints in `opgraph-autograd`.

pub mod attributes;
pub mod backend;
pub mod graph;
pub mod literal;
pub mod schedule;
pub mod types;

pub use attributes::{AttrMap, AttrValue, AttributeVisitor};
pub use graph::{Graph, Node, NodeId, OpKind, Output, TensorMeta, TypeInfo};
pub use literal::Literal;
pub use types::{
    AutoBroadcastSpec, AutoBroadcastType, AxisSet, DType, Dimension, PartialShape, Shape,
};

pub type Result<T> = std::result::Result<T, IrError>;

#[derive(thiserror::Error, Debug)]
pub enum IrError {
    /// A static precondition of an op failed. The graph must be fixed.
    #[error("{op} node {node}: {message}")]
    Validation {
        node: NodeId,
        op: TypeInfo,
        message: String,
    },

    /// Programmer error: an unknown policy tag, op version or attribute set.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Adjoints requested where the gradient rule cannot be resolved.
    #[error("autodiff not supported for {op} node {node}: {reason}")]
    DifferentiationUnsupported {
        node: NodeId,
        op: TypeInfo,
        reason: String,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("graph error: {0}")]
    Graph(&'static str),

    #[error("backend error: {0}")]
    Backend(String),
}

impl IrError {
    pub fn validation(node: NodeId, op: TypeInfo, message: impl Into<String>) -> Self {
        IrError::Validation {
            node,
            op,
            message: message.into(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, IrError::Validation { .. })
    }
}
