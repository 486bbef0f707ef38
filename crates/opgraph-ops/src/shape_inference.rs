//! Per-op type and shape inference.
//!
//! Given an `OpKind` and the graph its inputs live in, computes the element
//! type and partial shape of every output slot, and which inputs contribute
//! their value (not only their type) to that result. The builder calls this
//! on every insertion and every re-inference.

use smallvec::{SmallVec, smallvec};
use tracing::debug;

use opgraph_core::{
    AutoBroadcastSpec, AutoBroadcastType, AxisSet, DType, Dimension, Graph, IrError, NodeId,
    OpKind, Output, PartialShape, Result, Shape, TensorMeta,
};

use crate::ShapeError;
use crate::broadcast::resolve;
use crate::constant_folding::{constant_values, target_shape};

type ShapeResult<T> = std::result::Result<T, ShapeError>;

/// Resolved outputs of one node.
#[derive(Clone, Debug, PartialEq)]
pub struct Inference {
    pub outputs: SmallVec<[TensorMeta; 1]>,
    pub value_relevant: SmallVec<[bool; 3]>,
}

impl Inference {
    fn single(meta: TensorMeta, value_relevant: SmallVec<[bool; 3]>) -> Self {
        Self {
            outputs: smallvec![meta],
            value_relevant,
        }
    }
}

/// Run the inference function of `op` as node `node` with the given inputs.
///
/// Never mutates the graph. Data errors come back as `IrError::Validation`
/// tagged with `node` and the op's `(name, version)`.
pub fn infer(graph: &Graph, node: NodeId, op: &OpKind, inputs: &[Output]) -> Result<Inference> {
    match infer_op(graph, op, inputs) {
        Ok(inference) => {
            debug!(node = %node, op = %op.type_info(), outputs = ?inference.outputs, "inferred");
            Ok(inference)
        }
        Err(ShapeError::Configuration(message)) => Err(IrError::Configuration(message)),
        Err(e) => Err(IrError::validation(node, op.type_info(), e.to_string())),
    }
}

fn infer_op(graph: &Graph, op: &OpKind, inputs: &[Output]) -> ShapeResult<Inference> {
    let metas = inputs
        .iter()
        .map(|o| graph.meta(*o).map_err(|_| ShapeError::MissingInput(*o)))
        .collect::<ShapeResult<Vec<_>>>()?;

    match op {
        OpKind::Parameter { dtype, shape } => {
            expect_inputs(&metas, 0, "0")?;
            Ok(Inference::single(
                TensorMeta::new(*dtype, shape.clone()),
                SmallVec::new(),
            ))
        }

        OpKind::Constant { dtype, shape } => {
            expect_inputs(&metas, 0, "0")?;
            Ok(Inference::single(
                TensorMeta::new(*dtype, shape.clone()),
                SmallVec::new(),
            ))
        }

        OpKind::Concat { axis } => {
            if metas.is_empty() {
                return Err(ShapeError::Arity {
                    expected: "at least 1",
                    got: 0,
                });
            }
            let meta = infer_concat(*axis, &metas)?;
            Ok(Inference::single(meta, smallvec![false; metas.len()]))
        }

        OpKind::Add => {
            expect_inputs(&metas, 2, "2")?;
            let (a, b) = (metas[0], metas[1]);
            let dtype = merge_dtype(a.dtype, b.dtype)?;
            let shape = a
                .shape
                .merge(&b.shape)
                .ok_or_else(|| ShapeError::ShapeMismatch {
                    a: a.shape.clone(),
                    b: b.shape.clone(),
                })?;
            Ok(Inference::single(
                TensorMeta::new(dtype, shape),
                smallvec![false, false],
            ))
        }

        OpKind::Sum { reduction_axes } => {
            expect_inputs(&metas, 1, "1")?;
            let arg = metas[0];
            let shape = match arg.shape.dims() {
                None => PartialShape::Dynamic,
                Some(dims) => {
                    check_axes(reduction_axes, dims.len())?;
                    PartialShape::Ranked(
                        dims.iter()
                            .enumerate()
                            .filter(|(i, _)| !reduction_axes.contains(i))
                            .map(|(_, d)| *d)
                            .collect(),
                    )
                }
            };
            Ok(Inference::single(
                TensorMeta::new(arg.dtype, shape),
                smallvec![false],
            ))
        }

        OpKind::Reshape { shape } => {
            expect_inputs(&metas, 1, "1")?;
            let arg = metas[0];
            let expected = element_count(shape)?;
            if let Some(from) = arg.shape.to_shape() {
                let got = element_count(&from)?;
                if got != expected {
                    return Err(ShapeError::ElementCount { expected, got });
                }
            }
            Ok(Inference::single(
                TensorMeta::new(arg.dtype, shape.clone()),
                smallvec![false],
            ))
        }

        OpKind::BroadcastV0 {
            shape,
            broadcast_axes,
        } => {
            expect_inputs(&metas, 1, "1")?;
            let arg = metas[0];
            check_axes(broadcast_axes, shape.ndim())?;
            let required: PartialShape = Shape::new(
                shape
                    .0
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !broadcast_axes.contains(i))
                    .map(|(_, d)| *d)
                    .collect::<Vec<_>>(),
            )
            .into();
            if !arg.shape.compatible(&required) {
                return Err(ShapeError::Mismatch(format!(
                    "argument shape {} does not match {} with broadcast axes {:?} removed",
                    arg.shape, shape, broadcast_axes
                )));
            }
            Ok(Inference::single(
                TensorMeta::new(arg.dtype, shape.clone()),
                smallvec![false],
            ))
        }

        OpKind::BroadcastV1 { spec } | OpKind::BroadcastV3 { spec } => {
            infer_broadcast(graph, op, spec, inputs, &metas)
        }
    }
}

fn expect_inputs(metas: &[&TensorMeta], n: usize, expected: &'static str) -> ShapeResult<()> {
    if metas.len() != n {
        return Err(ShapeError::Arity {
            expected,
            got: metas.len(),
        });
    }
    Ok(())
}

fn merge_dtype(a: DType, b: DType) -> ShapeResult<DType> {
    a.merge(b).ok_or(ShapeError::DTypeMismatch { a, b })
}

fn check_axes(axes: &AxisSet, ndim: usize) -> ShapeResult<()> {
    match axes.iter().find(|&&a| a >= ndim) {
        Some(&axis) => Err(ShapeError::InvalidAxis {
            axis: axis as i64,
            ndim,
        }),
        None => Ok(()),
    }
}

fn infer_concat(axis: i64, metas: &[&TensorMeta]) -> ShapeResult<TensorMeta> {
    let dtype = metas
        .iter()
        .try_fold(DType::Dynamic, |acc, m| merge_dtype(acc, m.dtype))?;

    let Some(first) = metas.iter().find(|m| m.shape.rank().is_some()) else {
        return Ok(TensorMeta::new(dtype, PartialShape::Dynamic));
    };
    let rank = first.shape.rank().unwrap_or_default();
    let resolved = if axis < 0 { axis + rank as i64 } else { axis };
    if resolved < 0 || resolved >= rank as i64 {
        return Err(ShapeError::InvalidAxis { axis, ndim: rank });
    }
    let axis = resolved as usize;

    let mut dims = vec![Dimension::Dynamic; rank];
    let mut length = Some(0usize);
    for m in metas {
        let Some(d) = m.shape.dims() else {
            length = None;
            continue;
        };
        let mismatch = || ShapeError::ShapeMismatch {
            a: first.shape.clone(),
            b: m.shape.clone(),
        };
        if d.len() != rank {
            return Err(mismatch());
        }
        for (k, &dim) in d.iter().enumerate() {
            if k == axis {
                length = match (length, dim.get()) {
                    (Some(acc), Some(n)) => {
                        let sum = acc.checked_add(n);
                        Some(sum.ok_or(ShapeError::LengthOverflow { axis })?)
                    }
                    _ => None,
                };
            } else {
                dims[k] = dims[k].merge(dim).ok_or_else(mismatch)?;
            }
        }
    }
    dims[axis] = length.map_or(Dimension::Dynamic, Dimension::Static);
    Ok(TensorMeta::new(dtype, PartialShape::Ranked(dims)))
}

fn element_count(shape: &Shape) -> ShapeResult<usize> {
    shape
        .checked_numel()
        .ok_or_else(|| ShapeError::ElementCountOverflow {
            shape: shape.clone(),
        })
}

/// Target shapes and axes mappings are rank-1 integer tensors.
fn check_index_input(what: &'static str, meta: &TensorMeta) -> ShapeResult<()> {
    if !(meta.dtype.is_integral() || meta.dtype.is_dynamic()) {
        return Err(ShapeError::ElementType {
            what,
            got: meta.dtype,
        });
    }
    if !meta.shape.rank_compatible(1) {
        return Err(ShapeError::Rank {
            what,
            expected: 1,
            got: meta.shape.clone(),
        });
    }
    Ok(())
}

fn infer_broadcast(
    graph: &Graph,
    op: &OpKind,
    spec: &AutoBroadcastSpec,
    inputs: &[Output],
    metas: &[&TensorMeta],
) -> ShapeResult<Inference> {
    if matches!(op, OpKind::BroadcastV1 { .. }) && spec.kind == AutoBroadcastType::Bidirectional {
        return Err(ShapeError::Configuration(format!(
            "{}: unknown autobroadcast type {}",
            op.type_info(),
            spec.kind
        )));
    }
    let explicit = spec.is_explicit();
    match (explicit, metas.len()) {
        (true, 3) | (false, 2) => {}
        (true, 2) => return Err(ShapeError::MissingAxesMapping),
        (false, 3) => return Err(ShapeError::UnexpectedAxesMapping),
        (true, got) => {
            return Err(ShapeError::Arity {
                expected: "3",
                got,
            });
        }
        (false, got) => {
            return Err(ShapeError::Arity {
                expected: "2",
                got,
            });
        }
    }

    let arg = metas[0];
    check_index_input("Broadcast shape", metas[1])?;

    let mapping = if explicit {
        let axes = metas[2];
        check_index_input("Broadcast axes", axes)?;
        if let (Some(rank), Some([Dimension::Static(len)])) = (arg.shape.rank(), axes.shape.dims())
        {
            if *len != rank {
                return Err(ShapeError::AxesLength { axes: *len, rank });
            }
        }
        constant_values(graph, inputs[2]).map(<[i64]>::to_vec)
    } else {
        None
    };

    let target = target_shape(graph, inputs[1])?;
    let resolution = resolve(&arg.shape, &target, mapping.as_deref(), spec)?;
    debug!(
        spec = %spec,
        arg = %arg.shape,
        target = %target,
        result = %resolution.shape,
        axes = ?resolution.broadcast_axes,
        "broadcast resolved"
    );

    let mut value_relevant: SmallVec<[bool; 3]> = smallvec![false, true];
    if explicit {
        value_relevant.push(true);
    }
    Ok(Inference::single(
        TensorMeta::new(arg.dtype, resolution.shape),
        value_relevant,
    ))
}
