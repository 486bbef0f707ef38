//! Per-op gradient rules.

use opgraph_core::{Graph, IrError, Node, NodeId, OpKind, Output, PartialShape, Result, Shape};
use opgraph_ops::{add_op, node_broadcast_axes};

use crate::adjoints::Adjoints;

fn unsupported(node: &Node, reason: impl Into<String>) -> IrError {
    IrError::DifferentiationUnsupported {
        node: node.id,
        op: node.type_info(),
        reason: reason.into(),
    }
}

fn static_shape(graph: &Graph, node: &Node, output: Output) -> Result<Shape> {
    let meta = graph.meta(output)?;
    meta.shape.to_shape().ok_or_else(|| {
        unsupported(
            node,
            format!("input {output} has dynamic shape {}", meta.shape),
        )
    })
}

fn input(node: &Node, index: usize) -> Result<Output> {
    node.inputs
        .get(index)
        .copied()
        .ok_or(IrError::Graph("input index out of range"))
}

/// Apply the gradient rule of `id`: given the deltas of its outputs, append
/// the nodes computing its inputs' deltas and accumulate them.
///
/// Shape-only inputs (broadcast target shapes and axes mappings) receive no
/// delta.
pub fn propagate(
    graph: &mut Graph,
    adjoints: &mut Adjoints,
    id: NodeId,
    deltas: &[Output],
) -> Result<()> {
    let node = graph.node(id)?.clone();
    let Some(&delta) = deltas.first() else {
        return Ok(());
    };

    match &node.op {
        OpKind::Parameter { .. } | OpKind::Constant { .. } => Ok(()),

        OpKind::Add => {
            adjoints.add_delta(graph, input(&node, 0)?, delta)?;
            adjoints.add_delta(graph, input(&node, 1)?, delta)
        }

        OpKind::Sum { reduction_axes } => {
            let x = input(&node, 0)?;
            let shape = static_shape(graph, &node, x)?;
            let spread = add_op(
                graph,
                OpKind::BroadcastV0 {
                    shape,
                    broadcast_axes: reduction_axes.clone(),
                },
                &[delta],
            )?;
            adjoints.add_delta(graph, x, spread.into())
        }

        OpKind::Reshape { .. } => {
            let x = input(&node, 0)?;
            let shape = static_shape(graph, &node, x)?;
            let back = add_op(graph, OpKind::Reshape { shape }, &[delta])?;
            adjoints.add_delta(graph, x, back.into())
        }

        OpKind::BroadcastV0 { .. } | OpKind::BroadcastV1 { .. } | OpKind::BroadcastV3 { .. } => {
            let arg = input(&node, 0)?;
            let Some(axes) = node_broadcast_axes(graph, id)? else {
                return Err(unsupported(
                    &node,
                    "broadcast axes are not statically known",
                ));
            };
            let arg_shape = static_shape(graph, &node, arg)?;

            let mut reduced = delta;
            if !axes.is_empty() {
                reduced = add_op(
                    graph,
                    OpKind::Sum {
                        reduction_axes: axes,
                    },
                    &[reduced],
                )?
                .into();
            }
            // Stretched size-1 axes were summed away; restore them.
            if graph.meta(reduced)?.shape != PartialShape::from(&arg_shape) {
                reduced = add_op(graph, OpKind::Reshape { shape: arg_shape }, &[reduced])?.into();
            }
            adjoints.add_delta(graph, arg, reduced)
        }

        OpKind::Concat { .. } => Err(unsupported(&node, "no gradient rule")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opgraph_core::{AutoBroadcastSpec, DType, Dimension};
    use opgraph_ops::{add_parameter, broadcast, broadcast_explicit, shape_constant};

    fn delta_for(g: &mut Graph, id: NodeId) -> Output {
        let meta = g.meta(id.into()).unwrap().clone();
        add_parameter(g, meta.dtype, meta.shape).unwrap().into()
    }

    #[test]
    fn test_numpy_broadcast_reduces_prefix() {
        let mut g = Graph::new();
        let x = add_parameter(&mut g, DType::F32, Shape::new(vec![5])).unwrap();
        let t = shape_constant(&mut g, &[4, 5]).unwrap();
        let b = broadcast(&mut g, x.into(), t.into(), AutoBroadcastSpec::numpy()).unwrap();
        let d = delta_for(&mut g, b);

        let mut adjoints = Adjoints::new();
        propagate(&mut g, &mut adjoints, b, &[d]).unwrap();

        let dx = adjoints.get(x.into()).unwrap();
        let sum = g.node(dx.node).unwrap();
        assert_eq!(
            sum.op,
            OpKind::Sum {
                reduction_axes: [0].into_iter().collect()
            }
        );
        assert_eq!(g.meta(dx).unwrap().shape, Shape::new(vec![5]).into());
        assert!(adjoints.get(t.into()).is_none());
    }

    #[test]
    fn test_stretched_axis_is_reshaped_back() {
        let mut g = Graph::new();
        let x = add_parameter(&mut g, DType::F32, Shape::new(vec![3, 1])).unwrap();
        let t = shape_constant(&mut g, &[2, 3, 4]).unwrap();
        let b = broadcast(&mut g, x.into(), t.into(), AutoBroadcastSpec::numpy()).unwrap();
        let d = delta_for(&mut g, b);

        let mut adjoints = Adjoints::new();
        propagate(&mut g, &mut adjoints, b, &[d]).unwrap();
        let dx = adjoints.get(x.into()).unwrap();
        assert!(matches!(g.node(dx.node).unwrap().op, OpKind::Reshape { .. }));
        assert_eq!(g.meta(dx).unwrap().shape, Shape::new(vec![3, 1]).into());
    }

    #[test]
    fn test_explicit_broadcast_sums_unmapped_axes() {
        let mut g = Graph::new();
        let x = add_parameter(&mut g, DType::F32, Shape::new(vec![4, 5])).unwrap();
        let t = shape_constant(&mut g, &[2, 4, 5, 3]).unwrap();
        let b = broadcast_explicit(&mut g, x.into(), t.into(), &[1, 2]).unwrap();
        let d = delta_for(&mut g, b);

        let mut adjoints = Adjoints::new();
        propagate(&mut g, &mut adjoints, b, &[d]).unwrap();
        let dx = adjoints.get(x.into()).unwrap();
        assert_eq!(
            g.node(dx.node).unwrap().op,
            OpKind::Sum {
                reduction_axes: [0, 3].into_iter().collect()
            }
        );
    }

    #[test]
    fn test_dynamic_broadcast_is_unsupported() {
        let mut g = Graph::new();
        let x = add_parameter(
            &mut g,
            DType::F32,
            PartialShape::new(vec![Dimension::Dynamic]),
        )
        .unwrap();
        let t = shape_constant(&mut g, &[4, 5]).unwrap();
        let b = broadcast(&mut g, x.into(), t.into(), AutoBroadcastSpec::numpy()).unwrap();
        let d = delta_for(&mut g, b);

        let err = propagate(&mut g, &mut Adjoints::new(), b, &[d]).unwrap_err();
        assert!(matches!(err, IrError::DifferentiationUnsupported { node, .. } if node == b));
    }

    #[test]
    fn test_sum_spreads_back() {
        let mut g = Graph::new();
        let x = add_parameter(&mut g, DType::F32, Shape::new(vec![4, 5])).unwrap();
        let s = add_op(
            &mut g,
            OpKind::Sum {
                reduction_axes: [1].into_iter().collect(),
            },
            &[x.into()],
        )
        .unwrap();
        let d = delta_for(&mut g, s);
        let mut adjoints = Adjoints::new();
        propagate(&mut g, &mut adjoints, s, &[d]).unwrap();
        let dx = adjoints.get(x.into()).unwrap();
        assert_eq!(
            g.node(dx.node).unwrap().op,
            OpKind::BroadcastV0 {
                shape: Shape::new(vec![4, 5]),
                broadcast_axes: [1].into_iter().collect(),
            }
        );
    }

    #[test]
    fn test_concat_has_no_rule() {
        let mut g = Graph::new();
        let a = add_parameter(&mut g, DType::F32, Shape::new(vec![2])).unwrap();
        let c = add_op(&mut g, OpKind::Concat { axis: 0 }, &[a.into(), a.into()]).unwrap();
        let d = delta_for(&mut g, c);
        let err = propagate(&mut g, &mut Adjoints::new(), c, &[d]).unwrap_err();
        assert!(matches!(err, IrError::DifferentiationUnsupported { .. }));
    }
}
