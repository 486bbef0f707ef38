//! Backend contract: a fully typed graph is compiled into an executable,
//! which maps host input tensors to host output tensors.
//!
//! The inference core never depends on a backend; backends depend on the
//! core and consume whatever graph it produced.

use crate::graph::{Graph, NodeId, Output, TensorMeta};
use crate::types::{DType, Shape};
use crate::{IrError, Result};

/// Dense host tensor exchanged with executables. Data is stored as f32
/// regardless of `dtype`.
#[derive(Clone, Debug, PartialEq)]
pub struct HostTensor {
    pub dtype: DType,
    pub shape: Shape,
    pub data: Vec<f32>,
}

impl HostTensor {
    pub fn new(dtype: DType, shape: Shape, data: Vec<f32>) -> Result<Self> {
        let expected = shape.checked_numel().ok_or_else(|| {
            IrError::InvalidArgument(format!("element count of shape {shape} overflows"))
        })?;
        if data.len() != expected {
            return Err(IrError::InvalidArgument(format!(
                "data length {} does not match shape {shape} (expected {expected})",
                data.len(),
            )));
        }
        Ok(Self { dtype, shape, data })
    }

    pub fn from_f32(data: &[f32], shape: &Shape) -> Result<Self> {
        Self::new(DType::F32, shape.clone(), data.to_vec())
    }

    /// Whether this tensor satisfies a resolved output type.
    pub fn matches(&self, meta: &TensorMeta) -> bool {
        meta.dtype.merge(self.dtype).is_some()
            && meta.shape.compatible(&(&self.shape).into())
    }
}

/// A compiled graph.
pub trait Executable: Send + Sync {
    /// Parameter nodes, in the order `execute` expects their values.
    fn parameters(&self) -> &[NodeId];

    /// Outputs produced by `execute`, in order.
    fn outputs(&self) -> &[Output];

    fn execute(&self, inputs: &[HostTensor]) -> Result<Vec<HostTensor>>;
}

/// Pluggable compute backend.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Compile the subgraph needed for `outputs`, reading `parameters` as
    /// runtime inputs.
    fn compile(
        &self,
        graph: &Graph,
        parameters: &[NodeId],
        outputs: &[Output],
    ) -> Result<Box<dyn Executable>>;
}
