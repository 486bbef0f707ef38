use tracing::{debug, trace};

use opgraph_core::{Graph, Output, Result};

use crate::adjoints::Adjoints;
use crate::vjp::propagate;

/// Build the gradient graph of `root`, seeded with `seed` as its delta.
///
/// Visits the nodes `root` depends on in reverse arena order, so every
/// consumer has contributed to a node's delta before that node's rule runs.
/// Gradient nodes are appended to `graph`; if any rule fails, `graph` is left
/// unchanged.
///
/// The pass works on a copy of the whole graph, so each call costs
/// `O(graph.len())` in addition to the nodes it appends.
pub fn backprop(graph: &mut Graph, root: Output, seed: Output) -> Result<Adjoints> {
    let mut staged = graph.clone();
    let order = staged.ancestors(&[root.node]);
    let mut adjoints = Adjoints::new();
    adjoints.add_delta(&mut staged, root, seed)?;

    for id in order.into_iter().rev() {
        let Some(delta) = adjoints.get(id.into()) else {
            continue;
        };
        trace!(node = %id, delta = %delta, "propagate");
        propagate(&mut staged, &mut adjoints, id, &[delta])?;
    }

    debug!(
        root = %root,
        deltas = adjoints.len(),
        added = staged.len() - graph.len(),
        "backprop"
    );
    *graph = staged;
    Ok(adjoints)
}
