//! Broadcast-policy engine.
//!
//! [`resolve`] is the forward algorithm used by shape inference: it validates
//! an argument shape against a target shape under one of the four alignment
//! policies and returns the result shape plus the set of result axes that were
//! synthesized. [`broadcast_axes`] re-derives that set from two fully static
//! shapes alone; gradient rules use it, and the two must always agree.

use opgraph_core::{
    AutoBroadcastSpec, AutoBroadcastType, AxisSet, Dimension, Graph, IrError, NodeId, OpKind,
    PartialShape, Result, Shape,
};

use crate::ShapeError;
use crate::constant_folding::constant_values;

/// Outcome of a forward broadcast resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub shape: PartialShape,
    /// `None` while any decision the set depends on is still unknown.
    pub broadcast_axes: Option<AxisSet>,
}

impl Resolution {
    fn unresolved(shape: PartialShape) -> Self {
        Self {
            shape,
            broadcast_axes: None,
        }
    }
}

/// First result axis the argument is aligned against.
///
/// PDPD uses its start axis attribute unless it is `-1`; every other policy
/// aligns right.
pub fn start_axis(
    spec: &AutoBroadcastSpec,
    target_rank: usize,
    arg_rank: usize,
) -> std::result::Result<usize, ShapeError> {
    let start = match spec.kind {
        AutoBroadcastType::Pdpd if spec.axis != -1 => spec.axis,
        _ => target_rank as i64 - arg_rank as i64,
    };
    if start < 0 || start as usize + arg_rank > target_rank {
        return Err(ShapeError::TargetRankTooSmall {
            target_rank,
            arg_rank,
            start_axis: start,
        });
    }
    Ok(start as usize)
}

/// Resolve `arg` against `target` under `spec`.
///
/// `axes_mapping` is only read in explicit mode, where `None` means the
/// mapping exists but its values are not known yet.
pub fn resolve(
    arg: &PartialShape,
    target: &PartialShape,
    axes_mapping: Option<&[i64]>,
    spec: &AutoBroadcastSpec,
) -> std::result::Result<Resolution, ShapeError> {
    match spec.kind {
        AutoBroadcastType::None => resolve_explicit(arg, target, axes_mapping),
        AutoBroadcastType::Numpy | AutoBroadcastType::Pdpd => resolve_aligned(arg, target, spec),
        AutoBroadcastType::Bidirectional => resolve_bidirectional(arg, target),
    }
}

fn resolve_explicit(
    arg: &PartialShape,
    target: &PartialShape,
    axes_mapping: Option<&[i64]>,
) -> std::result::Result<Resolution, ShapeError> {
    let Some(mapping) = axes_mapping else {
        return Ok(Resolution::unresolved(target.clone()));
    };

    if mapping.windows(2).any(|w| w[0] >= w[1]) {
        return Err(ShapeError::AxesNotSorted {
            axes: mapping.to_vec(),
        });
    }
    if let Some(rank) = arg.rank() {
        if rank != mapping.len() {
            return Err(ShapeError::AxesLength {
                axes: mapping.len(),
                rank,
            });
        }
    }

    let Some(t) = target.dims() else {
        // Rank unknown: only negative entries can be rejected.
        if let Some((index, &axis)) = mapping.iter().enumerate().find(|(_, a)| **a < 0) {
            return Err(ShapeError::AxisOutOfRange {
                index,
                axis,
                rank: 0,
            });
        }
        return Ok(Resolution::unresolved(PartialShape::Dynamic));
    };

    let mut result = t.to_vec();
    for (index, &axis) in mapping.iter().enumerate() {
        if axis < 0 || axis as usize >= t.len() {
            return Err(ShapeError::AxisOutOfRange {
                index,
                axis,
                rank: t.len(),
            });
        }
        let Some(a) = arg.dims() else { continue };
        let pos = axis as usize;
        result[pos] = a[index].merge(t[pos]).ok_or(ShapeError::DimensionMismatch {
            index,
            expected: a[index].get().unwrap_or_default(),
            got: t[pos].get().unwrap_or_default(),
        })?;
    }

    let axes = (0..t.len())
        .filter(|i| !mapping.contains(&(*i as i64)))
        .collect();
    Ok(Resolution {
        shape: PartialShape::Ranked(result),
        broadcast_axes: Some(axes),
    })
}

fn resolve_aligned(
    arg: &PartialShape,
    target: &PartialShape,
    spec: &AutoBroadcastSpec,
) -> std::result::Result<Resolution, ShapeError> {
    let Some(t) = target.dims() else {
        return Ok(Resolution::unresolved(PartialShape::Dynamic));
    };
    let Some(a) = arg.dims() else {
        return Ok(Resolution::unresolved(target.clone()));
    };
    let start = start_axis(spec, t.len(), a.len())?;

    // Outside the aligned window the target is authoritative.
    let mut result = t.to_vec();
    let mut axes: AxisSet = (0..start).chain(start + a.len()..t.len()).collect();
    let mut known = true;

    for (j, &ad) in a.iter().enumerate() {
        let i = start + j;
        match (ad, t[i]) {
            (Dimension::Static(x), Dimension::Static(y)) => {
                if x == 1 && y != 1 {
                    axes.insert(i);
                } else if x != y {
                    return Err(ShapeError::IncompatibleDims {
                        axis: i,
                        arg: x,
                        target: y,
                    });
                }
            }
            (Dimension::Static(1), Dimension::Dynamic) => known = false,
            (Dimension::Static(x), Dimension::Dynamic) => result[i] = Dimension::Static(x),
            // The argument can only be 1 here.
            (Dimension::Dynamic, Dimension::Static(1)) => {}
            (Dimension::Dynamic, _) => known = false,
        }
    }

    Ok(Resolution {
        shape: PartialShape::Ranked(result),
        broadcast_axes: known.then_some(axes),
    })
}

fn resolve_bidirectional(
    arg: &PartialShape,
    target: &PartialShape,
) -> std::result::Result<Resolution, ShapeError> {
    let (Some(a), Some(t)) = (arg.dims(), target.dims()) else {
        return Ok(Resolution::unresolved(PartialShape::Dynamic));
    };
    let rank = a.len().max(t.len());
    let pad = |dims: &[Dimension]| -> Vec<Dimension> {
        std::iter::repeat_n(Dimension::Static(1), rank - dims.len())
            .chain(dims.iter().copied())
            .collect()
    };
    let (pa, pt) = (pad(a), pad(t));
    let start = rank - a.len();

    let mut result = Vec::with_capacity(rank);
    let mut axes: AxisSet = (0..start).collect();
    let mut known = true;

    for i in 0..rank {
        let dim = match (pa[i], pt[i]) {
            (Dimension::Static(x), Dimension::Static(y)) => {
                if x == y || y == 1 {
                    Dimension::Static(x)
                } else if x == 1 {
                    Dimension::Static(y)
                } else {
                    return Err(ShapeError::IncompatibleDims {
                        axis: i,
                        arg: x,
                        target: y,
                    });
                }
            }
            (Dimension::Static(1), Dimension::Dynamic)
            | (Dimension::Dynamic, Dimension::Static(1))
            | (Dimension::Dynamic, Dimension::Dynamic) => Dimension::Dynamic,
            (Dimension::Static(x), Dimension::Dynamic) => Dimension::Static(x),
            (Dimension::Dynamic, Dimension::Static(y)) => Dimension::Static(y),
        };
        if i >= start {
            match (pa[i], dim) {
                (Dimension::Static(x), Dimension::Static(y)) => {
                    if x != y {
                        axes.insert(i);
                    }
                }
                _ => known = false,
            }
        }
        result.push(dim);
    }

    Ok(Resolution {
        shape: PartialShape::Ranked(result),
        broadcast_axes: known.then_some(axes),
    })
}

/// [`resolve`] for fully static shapes. Explicit mode needs `axes_mapping`.
pub fn resolve_static(
    arg: &Shape,
    target: &Shape,
    axes_mapping: Option<&[usize]>,
    spec: &AutoBroadcastSpec,
) -> std::result::Result<(Shape, AxisSet), ShapeError> {
    let mapping: Option<Vec<i64>> = axes_mapping.map(|m| m.iter().map(|&a| a as i64).collect());
    if spec.is_explicit() && mapping.is_none() {
        return Err(ShapeError::MissingAxesMapping);
    }
    let resolution = resolve(&arg.into(), &target.into(), mapping.as_deref(), spec)?;
    match (resolution.shape.to_shape(), resolution.broadcast_axes) {
        (Some(shape), Some(axes)) => Ok((shape, axes)),
        _ => Err(ShapeError::Mismatch(format!(
            "static inputs {arg} and {target} produced a partial result"
        ))),
    }
}

/// Broadcast axes derived from the argument and the final result shape alone.
///
/// An axis is synthesized when it lies outside the aligned window or when the
/// result dimension differs from the aligned argument dimension. In explicit
/// mode the set is every result axis the mapping does not name.
pub fn broadcast_axes(
    arg: &Shape,
    result: &Shape,
    spec: &AutoBroadcastSpec,
    axes_mapping: Option<&[usize]>,
) -> std::result::Result<AxisSet, ShapeError> {
    if spec.is_explicit() {
        let mapping = axes_mapping.ok_or(ShapeError::MissingAxesMapping)?;
        return Ok((0..result.ndim()).filter(|i| !mapping.contains(i)).collect());
    }
    let start = start_axis(spec, result.ndim(), arg.ndim())?;
    let end = start + arg.ndim();
    Ok((0..result.ndim())
        .filter(|&i| i < start || i >= end || result.0[i] != arg.0[i - start])
        .collect())
}

fn explicit_mapping(graph: &Graph, id: NodeId) -> Result<Option<Vec<usize>>> {
    let node = graph.node(id)?;
    let Some(values) = node.inputs.get(2).and_then(|o| constant_values(graph, *o)) else {
        return Ok(None);
    };
    values
        .iter()
        .map(|&a| usize::try_from(a))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map(Some)
        .map_err(|_| IrError::validation(id, node.type_info(), "negative axes_mapping entry"))
}

fn checked_spec(node_id: NodeId, op: &OpKind) -> Result<Option<AutoBroadcastSpec>> {
    match op {
        OpKind::BroadcastV1 { spec } if spec.kind == AutoBroadcastType::Bidirectional => {
            Err(IrError::Configuration(format!(
                "{} node {node_id}: unknown autobroadcast type {}",
                op.type_info(),
                spec.kind
            )))
        }
        OpKind::BroadcastV1 { spec } | OpKind::BroadcastV3 { spec } => Ok(Some(*spec)),
        OpKind::BroadcastV0 { .. } => Ok(None),
        other => Err(IrError::InvalidArgument(format!(
            "{} is not a broadcast op",
            other.type_info()
        ))),
    }
}

/// Broadcast axes of a broadcast node, `None` when they are not statically
/// known.
pub fn node_broadcast_axes(graph: &Graph, id: NodeId) -> Result<Option<AxisSet>> {
    let node = graph.node(id)?;
    if let OpKind::BroadcastV0 { broadcast_axes, .. } = &node.op {
        return Ok(Some(broadcast_axes.clone()));
    }
    let Some(spec) = checked_spec(id, &node.op)? else {
        return Ok(None);
    };

    if spec.is_explicit() {
        let target = node
            .inputs
            .get(1)
            .ok_or(IrError::Graph("broadcast node has no target shape input"))?;
        let target_rank = match graph.meta(*target)?.shape.dims() {
            Some([Dimension::Static(n)]) => *n,
            _ => return Ok(None),
        };
        let Some(mapping) = explicit_mapping(graph, id)? else {
            return Ok(None);
        };
        return Ok(Some(
            (0..target_rank).filter(|i| !mapping.contains(i)).collect(),
        ));
    }

    let arg = node
        .inputs
        .first()
        .ok_or(IrError::Graph("broadcast node has no argument"))?;
    let arg = graph.meta(*arg)?.shape.to_shape();
    let result = node.outputs[0].shape.to_shape();
    match (arg, result) {
        (Some(arg), Some(result)) => broadcast_axes(&arg, &result, &spec, None)
            .map(Some)
            .map_err(|e| IrError::validation(id, node.type_info(), e.to_string())),
        _ => Ok(None),
    }
}

/// For each argument axis of a static broadcast node, the result axis it
/// occupies. Backends use this to index the argument.
pub fn node_arg_positions(graph: &Graph, id: NodeId) -> Result<Vec<usize>> {
    let node = graph.node(id)?;
    if let OpKind::BroadcastV0 {
        shape,
        broadcast_axes,
    } = &node.op
    {
        return Ok((0..shape.ndim())
            .filter(|i| !broadcast_axes.contains(i))
            .collect());
    }
    let spec = checked_spec(id, &node.op)?.ok_or(IrError::Graph("not a broadcast node"))?;

    if spec.is_explicit() {
        return explicit_mapping(graph, id)?.ok_or_else(|| {
            IrError::InvalidArgument(format!("{}: axes_mapping is not a literal", node.name))
        });
    }

    let arg_rank = graph
        .meta(node.inputs[0])?
        .shape
        .rank()
        .ok_or(IrError::Graph("broadcast argument rank is unknown"))?;
    let result_rank = node.outputs[0]
        .shape
        .rank()
        .ok_or(IrError::Graph("broadcast result rank is unknown"))?;
    let start = start_axis(&spec, result_rank, arg_rank)
        .map_err(|e| IrError::validation(id, node.type_info(), e.to_string()))?;
    Ok((start..start + arg_rank).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ps(dims: &[Option<usize>]) -> PartialShape {
        PartialShape::new(
            dims.iter()
                .map(|d| d.map_or(Dimension::Dynamic, Dimension::Static))
                .collect::<Vec<_>>(),
        )
    }

    fn axes(v: &[usize]) -> AxisSet {
        v.iter().copied().collect()
    }

    #[test]
    fn test_numpy_stretch_and_prefix() {
        let (shape, set) = resolve_static(
            &Shape::new(vec![3, 1, 5]),
            &Shape::new(vec![4, 3, 7, 5]),
            None,
            &AutoBroadcastSpec::numpy(),
        )
        .unwrap();
        assert_eq!(shape, Shape::new(vec![4, 3, 7, 5]));
        assert_eq!(set, axes(&[0, 2]));
    }

    #[test]
    fn test_numpy_incompatible() {
        let err = resolve_static(
            &Shape::new(vec![3]),
            &Shape::new(vec![2, 4]),
            None,
            &AutoBroadcastSpec::numpy(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ShapeError::IncompatibleDims {
                axis: 1,
                arg: 3,
                target: 4
            }
        );
    }

    #[test]
    fn test_numpy_target_rank_too_small() {
        let err = resolve_static(
            &Shape::new(vec![2, 3, 4]),
            &Shape::new(vec![3, 4]),
            None,
            &AutoBroadcastSpec::numpy(),
        )
        .unwrap_err();
        assert!(matches!(err, ShapeError::TargetRankTooSmall { .. }));
    }

    #[test]
    fn test_pdpd_window() {
        let (shape, set) = resolve_static(
            &Shape::new(vec![4, 5]),
            &Shape::new(vec![2, 4, 5, 3]),
            None,
            &AutoBroadcastSpec::pdpd(1),
        )
        .unwrap();
        assert_eq!(shape, Shape::new(vec![2, 4, 5, 3]));
        assert_eq!(set, axes(&[0, 3]));
    }

    #[test]
    fn test_pdpd_minus_one_aligns_right() {
        let (_, set) = resolve_static(
            &Shape::new(vec![5]),
            &Shape::new(vec![4, 5]),
            None,
            &AutoBroadcastSpec::pdpd(-1),
        )
        .unwrap();
        assert_eq!(set, axes(&[0]));
    }

    #[test]
    fn test_pdpd_window_past_end() {
        let err = resolve_static(
            &Shape::new(vec![4, 5]),
            &Shape::new(vec![2, 4, 5]),
            None,
            &AutoBroadcastSpec::pdpd(2),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ShapeError::TargetRankTooSmall {
                target_rank: 3,
                arg_rank: 2,
                start_axis: 2
            }
        );
    }

    #[test]
    fn test_explicit_mapping() {
        let (shape, set) = resolve_static(
            &Shape::new(vec![4, 5]),
            &Shape::new(vec![2, 4, 5, 3]),
            Some(&[1, 2][..]),
            &AutoBroadcastSpec::explicit(),
        )
        .unwrap();
        assert_eq!(shape, Shape::new(vec![2, 4, 5, 3]));
        assert_eq!(set, axes(&[0, 3]));
    }

    #[test]
    fn test_explicit_rejects_transpose() {
        let err = resolve_static(
            &Shape::new(vec![4, 5]),
            &Shape::new(vec![2, 4, 5, 3]),
            Some(&[2, 1][..]),
            &AutoBroadcastSpec::explicit(),
        )
        .unwrap_err();
        assert_eq!(err, ShapeError::AxesNotSorted { axes: vec![2, 1] });
    }

    #[test]
    fn test_explicit_checks() {
        let spec = AutoBroadcastSpec::explicit();
        let arg = ps(&[Some(4), Some(5)]);
        let target = ps(&[Some(2), Some(4), Some(5)]);
        assert!(matches!(
            resolve(&arg, &target, Some(&[1, 3][..]), &spec),
            Err(ShapeError::AxisOutOfRange {
                index: 1,
                axis: 3,
                rank: 3,
            })
        ));
        assert!(matches!(
            resolve(&arg, &target, Some(&[-1, 1][..]), &spec),
            Err(ShapeError::AxisOutOfRange { .. })
        ));
        assert!(matches!(
            resolve(&arg, &target, Some(&[1][..]), &spec),
            Err(ShapeError::AxesLength { axes: 1, rank: 2 })
        ));
        assert!(matches!(
            resolve(&arg, &target, Some(&[0, 1][..]), &spec),
            Err(ShapeError::DimensionMismatch {
                index: 0,
                expected: 4,
                got: 2
            })
        ));
    }

    #[test]
    fn test_explicit_unknown_mapping_keeps_target() {
        let target = ps(&[Some(2), None]);
        let r = resolve(
            &ps(&[Some(2)]),
            &target,
            None,
            &AutoBroadcastSpec::explicit(),
        )
        .unwrap();
        assert_eq!(r.shape, target);
        assert_eq!(r.broadcast_axes, None);
    }

    #[test]
    fn test_bidirectional_pads_both() {
        let (shape, set) = resolve_static(
            &Shape::new(vec![3, 1]),
            &Shape::new(vec![2, 1, 6]),
            None,
            &AutoBroadcastSpec::bidirectional(),
        )
        .unwrap();
        assert_eq!(shape, Shape::new(vec![2, 3, 6]));
        assert_eq!(set, axes(&[0, 2]));
    }

    #[test]
    fn test_bidirectional_longer_arg() {
        let (shape, set) = resolve_static(
            &Shape::new(vec![2, 3, 4]),
            &Shape::new(vec![1, 4]),
            None,
            &AutoBroadcastSpec::bidirectional(),
        )
        .unwrap();
        assert_eq!(shape, Shape::new(vec![2, 3, 4]));
        assert!(set.is_empty());
    }

    #[test]
    fn test_stretch_to_zero() {
        let (shape, set) = resolve_static(
            &Shape::new(vec![1]),
            &Shape::new(vec![0]),
            None,
            &AutoBroadcastSpec::numpy(),
        )
        .unwrap();
        assert_eq!(shape, Shape::new(vec![0]));
        assert_eq!(set, axes(&[0]));
    }

    #[test]
    fn test_partial_known_arg_dim_fixes_result() {
        let r = resolve(
            &ps(&[Some(3)]),
            &ps(&[Some(2), None]),
            None,
            &AutoBroadcastSpec::numpy(),
        )
        .unwrap();
        assert_eq!(r.shape, ps(&[Some(2), Some(3)]));
        assert_eq!(r.broadcast_axes, Some(axes(&[0])));
    }

    #[test]
    fn test_partial_one_against_unknown_defers() {
        let r = resolve(
            &ps(&[Some(1)]),
            &ps(&[Some(2), None]),
            None,
            &AutoBroadcastSpec::numpy(),
        )
        .unwrap();
        assert_eq!(r.shape, ps(&[Some(2), None]));
        assert_eq!(r.broadcast_axes, None);
    }

    #[test]
    fn test_dynamic_rank_inputs() {
        let spec = AutoBroadcastSpec::numpy();
        let target = ps(&[Some(2), Some(3)]);
        let r = resolve(&PartialShape::Dynamic, &target, None, &spec).unwrap();
        assert_eq!(r.shape, target);
        let r = resolve(&target, &PartialShape::Dynamic, None, &spec).unwrap();
        assert_eq!(r.shape, PartialShape::Dynamic);
        let r = resolve(
            &target,
            &PartialShape::Dynamic,
            None,
            &AutoBroadcastSpec::bidirectional(),
        )
        .unwrap();
        assert_eq!(r.shape, PartialShape::Dynamic);
    }

    #[test]
    fn test_broadcast_axes_matches_forward_cases() {
        let arg = Shape::new(vec![3, 1, 5]);
        let result = Shape::new(vec![4, 3, 7, 5]);
        assert_eq!(
            broadcast_axes(&arg, &result, &AutoBroadcastSpec::numpy(), None).unwrap(),
            axes(&[0, 2])
        );
        assert_eq!(
            broadcast_axes(
                &Shape::new(vec![4, 5]),
                &Shape::new(vec![2, 4, 5, 3]),
                &AutoBroadcastSpec::explicit(),
                Some(&[1, 2][..])
            )
            .unwrap(),
            axes(&[0, 3])
        );
        assert_eq!(
            broadcast_axes(
                &Shape::new(vec![4, 5]),
                &Shape::new(vec![2, 4, 5, 3]),
                &AutoBroadcastSpec::explicit(),
                None
            ),
            Err(ShapeError::MissingAxesMapping)
        );
    }
}
