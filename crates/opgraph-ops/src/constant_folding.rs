//! Reading statically known shape values out of the graph.
//!
//! Only two producers are understood: a `Constant` with an integer literal,
//! and a `Concat` whose inputs are each a single element. The lookup never
//! goes further upstream than a concat's direct inputs.

use opgraph_core::{Dimension, Graph, OpKind, Output, PartialShape};

use crate::ShapeError;

/// Integer payload of the `Constant` producing `output`, if it is one.
pub fn constant_values(graph: &Graph, output: Output) -> Option<&[i64]> {
    let node = graph.get(output.node)?;
    if !node.op.is_constant() || output.index != 0 {
        return None;
    }
    graph.literal(output.node)?.as_i64()
}

fn dimension(index: usize, value: i64) -> Result<Dimension, ShapeError> {
    usize::try_from(value)
        .map(Dimension::Static)
        .map_err(|_| ShapeError::NegativeDimension { index, value })
}

/// Best-known value of a rank-1 target-shape input, as a partial shape.
///
/// - a literal yields a static shape;
/// - a concat of single-element inputs yields one dimension per input, known
///   where that input is a literal;
/// - any other producer with a static `[n]` shape yields rank `n` with
///   unknown dimensions;
/// - otherwise the result rank is unknown.
pub fn target_shape(graph: &Graph, output: Output) -> Result<PartialShape, ShapeError> {
    if let Some(values) = constant_values(graph, output) {
        return values
            .iter()
            .enumerate()
            .map(|(i, &v)| dimension(i, v))
            .collect::<Result<Vec<_>, _>>()
            .map(PartialShape::Ranked);
    }
    if let Some(shape) = concat_of_elements(graph, output)? {
        return Ok(shape);
    }
    let Ok(meta) = graph.meta(output) else {
        return Err(ShapeError::MissingInput(output));
    };
    Ok(match meta.shape.dims() {
        Some([Dimension::Static(n)]) => PartialShape::with_rank(*n),
        _ => PartialShape::Dynamic,
    })
}

fn concat_of_elements(graph: &Graph, output: Output) -> Result<Option<PartialShape>, ShapeError> {
    let Some(node) = graph.get(output.node) else {
        return Ok(None);
    };
    if !matches!(node.op, OpKind::Concat { .. }) {
        return Ok(None);
    }
    let Some(len) = node
        .output_meta(output.index)
        .and_then(|m| m.shape.to_shape())
        .filter(|s| s.ndim() == 1)
        .map(|s| s.0[0])
    else {
        return Ok(None);
    };
    if node.inputs.len() != len {
        return Ok(None);
    }
    let single = |o: &Output| {
        graph
            .meta(*o)
            .ok()
            .and_then(|m| m.shape.to_shape())
            .is_some_and(|s| s.0 == [1])
    };
    if !node.inputs.iter().all(single) {
        return Ok(None);
    }

    node.inputs
        .iter()
        .enumerate()
        .map(|(i, o)| match constant_values(graph, *o) {
            Some([v]) => dimension(i, *v),
            _ => Ok(Dimension::Dynamic),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(|dims| Some(PartialShape::Ranked(dims)))
}
