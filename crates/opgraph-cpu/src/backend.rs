use std::collections::HashMap;
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, trace};

use opgraph_core::backend::{Backend, Executable, HostTensor};
use opgraph_core::schedule::topo_schedule;
use opgraph_core::{DType, Graph, IrError, NodeId, OpKind, Output, Result, Shape};
use opgraph_ops::node_arg_positions;

use crate::kernels::{self, Kernel, Operand};
use crate::runtime::{Runtime, ensure_initialized};

/// Reference CPU backend. Evaluates every value as f32.
#[derive(Clone, Copy, Debug, Default)]
pub struct CpuBackend;

#[derive(Debug)]
struct Step {
    id: NodeId,
    kernel: Kernel,
    inputs: SmallVec<[usize; 3]>,
    dtype: DType,
    shape: Shape,
}

/// A graph lowered to a flat list of kernel steps.
pub struct CpuExecutable {
    runtime: Arc<Runtime>,
    steps: Vec<Step>,
    parameters: Vec<NodeId>,
    outputs: Vec<Output>,
    output_steps: Vec<usize>,
}

impl Backend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn compile(
        &self,
        graph: &Graph,
        parameters: &[NodeId],
        outputs: &[Output],
    ) -> Result<Box<dyn Executable>> {
        let runtime = ensure_initialized();
        for &p in parameters {
            if !matches!(graph.node(p)?.op, OpKind::Parameter { .. }) {
                return Err(IrError::InvalidArgument(format!("{p} is not a parameter")));
            }
        }

        let schedule = topo_schedule(graph, outputs)?;
        let mut slots: HashMap<NodeId, usize> = HashMap::with_capacity(schedule.topo.len());
        let mut steps = Vec::with_capacity(schedule.topo.len());

        for &id in &schedule.topo {
            let node = graph.node(id)?;
            let meta = node
                .outputs
                .first()
                .ok_or(IrError::Graph("node has no outputs"))?;
            let shape = meta.shape.to_shape().ok_or_else(|| {
                IrError::Backend(format!("{}: shape {} is not static", node.name, meta.shape))
            })?;
            if shape.checked_numel().is_none() {
                return Err(IrError::Backend(format!(
                    "{}: element count of shape {shape} overflows",
                    node.name
                )));
            }
            if meta.dtype.is_dynamic() {
                return Err(IrError::Backend(format!(
                    "{}: element type is not resolved",
                    node.name
                )));
            }

            let kernel = match &node.op {
                OpKind::Parameter { .. } => {
                    let slot = parameters.iter().position(|&p| p == id).ok_or_else(|| {
                        IrError::InvalidArgument(format!("{} is needed but not bound", node.name))
                    })?;
                    Kernel::Input(slot)
                }
                OpKind::Constant { .. } => Kernel::Literal(
                    graph
                        .literal(id)
                        .ok_or(IrError::Graph("constant without literal"))?
                        .to_f32_vec(),
                ),
                OpKind::Add => Kernel::Add,
                OpKind::Sum { reduction_axes } => Kernel::Sum(reduction_axes.clone()),
                OpKind::Reshape { .. } => Kernel::Copy,
                OpKind::Concat { axis } => {
                    let rank = shape.ndim() as i64;
                    let axis = if *axis < 0 { axis + rank } else { *axis };
                    Kernel::Concat(axis as usize)
                }
                OpKind::BroadcastV0 { .. }
                | OpKind::BroadcastV1 { .. }
                | OpKind::BroadcastV3 { .. } => Kernel::Broadcast(node_arg_positions(graph, id)?),
            };

            let inputs = node
                .inputs
                .iter()
                .map(|input| {
                    slots
                        .get(&input.node)
                        .copied()
                        .ok_or(IrError::Graph("input scheduled after its consumer"))
                })
                .collect::<Result<SmallVec<[usize; 3]>>>()?;

            slots.insert(id, steps.len());
            steps.push(Step {
                id,
                kernel,
                inputs,
                dtype: meta.dtype,
                shape,
            });
        }

        let output_steps = outputs
            .iter()
            .map(|o| {
                if o.index != 0 {
                    return Err(IrError::Graph("output slot not found"));
                }
                slots
                    .get(&o.node)
                    .copied()
                    .ok_or(IrError::Graph("output was not scheduled"))
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            steps = steps.len(),
            parameters = parameters.len(),
            outputs = outputs.len(),
            generation = runtime.generation(),
            "compiled CPU executable"
        );
        Ok(Box::new(CpuExecutable {
            runtime,
            steps,
            parameters: parameters.to_vec(),
            outputs: outputs.to_vec(),
            output_steps,
        }))
    }
}

impl Executable for CpuExecutable {
    fn parameters(&self) -> &[NodeId] {
        &self.parameters
    }

    fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    fn execute(&self, inputs: &[HostTensor]) -> Result<Vec<HostTensor>> {
        if inputs.len() != self.parameters.len() {
            return Err(IrError::InvalidArgument(format!(
                "expected {} inputs, got {}",
                self.parameters.len(),
                inputs.len()
            )));
        }
        let options = *self.runtime.options();

        let mut values: Vec<Vec<f32>> = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            let out = match &step.kernel {
                Kernel::Input(slot) => {
                    let tensor = &inputs[*slot];
                    if tensor.shape != step.shape {
                        return Err(IrError::InvalidArgument(format!(
                            "input {slot}: expected shape {}, got {}",
                            step.shape, tensor.shape
                        )));
                    }
                    if tensor.data.len() != step.shape.numel() {
                        return Err(IrError::InvalidArgument(format!(
                            "input {slot}: shape {} needs {} values, got {}",
                            step.shape,
                            step.shape.numel(),
                            tensor.data.len()
                        )));
                    }
                    tensor.data.clone()
                }
                kernel => {
                    let args: SmallVec<[Operand<'_>; 3]> = step
                        .inputs
                        .iter()
                        .map(|&i| Operand {
                            data: &values[i],
                            shape: &self.steps[i].shape,
                        })
                        .collect();
                    kernels::eval(kernel, &args, &step.shape)?
                }
            };

            if options.trace_kernels {
                trace!(node = %step.id, kernel = step.kernel.name(), len = out.len(), "eval");
            }
            if options.check_finite && out.iter().any(|x| !x.is_finite()) {
                return Err(IrError::Backend(format!(
                    "{}: non-finite value in {} output",
                    step.id,
                    step.kernel.name()
                )));
            }
            values.push(out);
        }

        self.output_steps
            .iter()
            .map(|&i| {
                let step = &self.steps[i];
                HostTensor::new(step.dtype, step.shape.clone(), values[i].clone())
            })
            .collect()
    }
}
