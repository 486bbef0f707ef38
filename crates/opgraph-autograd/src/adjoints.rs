use std::collections::HashMap;

use opgraph_core::{Graph, IrError, OpKind, Output, Result};
use opgraph_ops::add_op;

/// Accumulated backward delta per forward output.
///
/// Created for one differentiation pass. When several consumers contribute to
/// the same output their deltas are summed with an `Add` node.
#[derive(Clone, Debug, Default)]
pub struct Adjoints {
    deltas: HashMap<Output, Output>,
}

impl Adjoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// The node holding the total delta of `output`, if any reached it.
    pub fn get(&self, output: Output) -> Option<Output> {
        self.deltas.get(&output).copied()
    }

    /// Add `delta` to the accumulated delta of `output`.
    pub fn add_delta(&mut self, graph: &mut Graph, output: Output, delta: Output) -> Result<()> {
        let expected = &graph.meta(output)?.shape;
        let got = &graph.meta(delta)?.shape;
        if !expected.compatible(got) {
            return Err(IrError::InvalidArgument(format!(
                "delta {delta} has shape {got}, {output} has shape {expected}"
            )));
        }
        let total = match self.deltas.get(&output) {
            None => delta,
            Some(&previous) => add_op(graph, OpKind::Add, &[previous, delta])?.into(),
        };
        self.deltas.insert(output, total);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Output, Output)> + '_ {
        self.deltas.iter().map(|(k, v)| (*k, *v))
    }
}
