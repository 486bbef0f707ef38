//! Graph construction and re-inference.
//!
//! Nodes only enter the graph after their inference succeeded, and the
//! rewiring operations stage their changes on a copy so that a failing
//! re-inference leaves the caller's graph untouched.

use std::collections::HashSet;

use tracing::debug;

use opgraph_core::{
    AutoBroadcastSpec, DType, Graph, IrError, Literal, NodeId, OpKind, Output, PartialShape,
    Result, Shape,
};

use crate::shape_inference::infer;

/// Infer and insert a non-constant op.
pub fn add_op(graph: &mut Graph, op: OpKind, inputs: &[Output]) -> Result<NodeId> {
    if op.is_constant() {
        return Err(IrError::InvalidArgument(
            "constants carry a literal; use add_constant".into(),
        ));
    }
    for input in inputs {
        graph.meta(*input)?;
    }
    let id = graph.next_id();
    let inference = infer(graph, id, &op, inputs)?;
    graph.insert(op, inputs, inference.outputs, inference.value_relevant)
}

pub fn add_parameter(
    graph: &mut Graph,
    dtype: DType,
    shape: impl Into<PartialShape>,
) -> Result<NodeId> {
    add_op(
        graph,
        OpKind::Parameter {
            dtype,
            shape: shape.into(),
        },
        &[],
    )
}

/// Insert a literal. The payload must hold exactly `shape.numel()` values of
/// a storage class that fits `dtype`.
pub fn add_constant(
    graph: &mut Graph,
    dtype: DType,
    shape: Shape,
    literal: impl Into<Literal>,
) -> Result<NodeId> {
    let literal = literal.into();
    let id = graph.next_id();
    let op = OpKind::Constant { dtype, shape };
    let type_info = op.type_info();
    if dtype.is_dynamic() || !literal.fits(dtype) {
        return Err(IrError::validation(
            id,
            type_info,
            format!("literal cannot hold element type {dtype}"),
        ));
    }
    if let OpKind::Constant { shape, .. } = &op {
        let Some(numel) = shape.checked_numel() else {
            return Err(IrError::validation(
                id,
                type_info,
                format!("element count of shape {shape} overflows"),
            ));
        };
        if literal.len() != numel {
            return Err(IrError::validation(
                id,
                type_info,
                format!(
                    "literal has {} values, shape {shape} requires {numel}",
                    literal.len()
                ),
            ));
        }
    }
    let inference = infer(graph, id, &op, &[])?;
    graph.insert_literal(op, literal, inference.outputs)
}

/// Rank-1 `i64` literal, the usual producer of a target shape.
pub fn shape_constant(graph: &mut Graph, dims: &[usize]) -> Result<NodeId> {
    let values = dims.iter().map(|&d| d as i64).collect::<Vec<_>>();
    add_constant(graph, DType::I64, Shape::new(vec![dims.len()]), values)
}

/// Broadcast v3 of `arg` to the shape produced by `target`.
pub fn broadcast(
    graph: &mut Graph,
    arg: Output,
    target: Output,
    spec: AutoBroadcastSpec,
) -> Result<NodeId> {
    add_op(graph, OpKind::BroadcastV3 { spec }, &[arg, target])
}

/// Broadcast v3 in explicit mode with a literal axes mapping.
pub fn broadcast_explicit(
    graph: &mut Graph,
    arg: Output,
    target: Output,
    axes_mapping: &[i64],
) -> Result<NodeId> {
    let mapping = add_constant(
        graph,
        DType::I64,
        Shape::new(vec![axes_mapping.len()]),
        axes_mapping.to_vec(),
    )?;
    add_op(
        graph,
        OpKind::BroadcastV3 {
            spec: AutoBroadcastSpec::explicit(),
        },
        &[arg, target, mapping.into()],
    )
}

/// Re-run inference for one node. Returns whether its outputs changed.
pub fn revalidate(graph: &mut Graph, id: NodeId) -> Result<bool> {
    let node = graph.node(id)?;
    let inference = infer(graph, id, &node.op, &node.inputs)?;
    let changed = node.outputs != inference.outputs;
    graph.set_outputs(id, inference.outputs, inference.value_relevant)?;
    Ok(changed)
}

/// Re-infer everything downstream of `start`, in arena order.
///
/// A consumer is re-inferred when an input's type changed, or when an input
/// whose value it reads may have changed.
fn propagate(graph: &mut Graph, start: NodeId) -> Result<usize> {
    let mut type_dirty: HashSet<NodeId> = HashSet::new();
    let mut value_dirty: HashSet<NodeId> = HashSet::from([start]);
    if revalidate(graph, start)? {
        type_dirty.insert(start);
    }
    let mut reinferred = 1;

    let downstream: Vec<NodeId> = graph
        .nodes()
        .skip(start.index() + 1)
        .map(|n| n.id)
        .collect();
    for id in downstream {
        let node = graph.node(id)?;
        let type_hit = node.inputs.iter().any(|i| type_dirty.contains(&i.node));
        let value_hit = node
            .inputs
            .iter()
            .enumerate()
            .any(|(k, i)| value_dirty.contains(&i.node) && node.input_is_relevant_to_shape(k));
        let touched = node.inputs.iter().any(|i| value_dirty.contains(&i.node));

        if type_hit || value_hit {
            reinferred += 1;
            if revalidate(graph, id)? {
                type_dirty.insert(id);
            }
        }
        if touched {
            value_dirty.insert(id);
        }
    }
    debug!(start = %start, reinferred, "propagated");
    Ok(reinferred)
}

/// Rewire input `index` of `id` to `source` and re-infer downstream.
///
/// On error the graph is left as it was. The edit is staged on a copy of the
/// whole graph, so each call costs `O(graph.len())` even when little is
/// re-inferred.
pub fn replace_input(graph: &mut Graph, id: NodeId, index: usize, source: Output) -> Result<()> {
    let mut staged = graph.clone();
    staged.set_input(id, index, source)?;
    propagate(&mut staged, id)?;
    *graph = staged;
    Ok(())
}

/// Narrow a Parameter's shape and re-infer downstream.
///
/// The new shape must refine the current one. On error the graph is left as
/// it was. Like [`replace_input`], this copies the whole graph.
pub fn refine_parameter(graph: &mut Graph, id: NodeId, shape: PartialShape) -> Result<()> {
    let node = graph.node(id)?;
    let OpKind::Parameter { shape: current, .. } = &node.op else {
        return Err(IrError::InvalidArgument(format!(
            "{} is not a Parameter",
            node.name
        )));
    };
    if !shape.refines(current) {
        return Err(IrError::validation(
            id,
            node.type_info(),
            format!("shape {shape} does not refine {current}"),
        ));
    }

    let mut staged = graph.clone();
    if let OpKind::Parameter { shape: slot, .. } = staged.op_mut(id)? {
        *slot = shape;
    }
    propagate(&mut staged, id)?;
    *graph = staged;
    Ok(())
}

/// A new node of the same kind and attributes as `id`, wired to `inputs`.
pub fn clone_with_new_inputs(graph: &mut Graph, id: NodeId, inputs: &[Output]) -> Result<NodeId> {
    let node = graph.node(id)?;
    if node.inputs.len() != inputs.len() {
        return Err(IrError::validation(
            graph.next_id(),
            node.type_info(),
            format!(
                "clone expects {} inputs, got {}",
                node.inputs.len(),
                inputs.len()
            ),
        ));
    }
    match node.op.clone() {
        OpKind::Constant { dtype, shape } => {
            let literal = graph
                .literal(id)
                .cloned()
                .ok_or(IrError::Graph("constant without literal"))?;
            add_constant(graph, dtype, shape, literal)
        }
        op => add_op(graph, op, inputs),
    }
}
