use std::collections::{HashMap, HashSet, VecDeque};

use crate::graph::{Graph, NodeId, Output};
use crate::{IrError, Result};

#[derive(Debug, Clone)]
pub struct Schedule {
    /// Nodes in an order where dependencies appear before dependents.
    pub topo: Vec<NodeId>,
    /// The requested outputs.
    pub outputs: Vec<Output>,
}

/// Compute a topo order for the subgraph required to produce `outputs`.
///
/// - Only includes nodes reachable from outputs.
/// - Ensures dependencies appear before dependents; ties keep arena order.
/// - Detects cycles and dangling handles.
pub fn topo_schedule(graph: &Graph, outputs: &[Output]) -> Result<Schedule> {
    // 1) Collect reachable nodes by reverse traversal (from outputs to inputs).
    let mut reachable: HashSet<NodeId> = HashSet::new();
    let mut stack: Vec<NodeId> = outputs.iter().map(|o| o.node).collect();

    while let Some(nid) = stack.pop() {
        if !reachable.insert(nid) {
            continue;
        }
        let n = graph.node(nid)?;
        stack.extend(n.inputs.iter().map(|i| i.node));
    }

    // 2) In-degrees within the reachable subgraph + adjacency (dep -> users).
    let mut indeg: HashMap<NodeId, usize> = HashMap::new();
    let mut users: HashMap<NodeId, Vec<NodeId>> = HashMap::new();

    for &nid in reachable.iter() {
        indeg.entry(nid).or_insert(0);
        for inp in graph.node(nid)?.inputs.iter() {
            *indeg.entry(nid).or_insert(0) += 1;
            users.entry(inp.node).or_default().push(nid);
        }
    }

    // 3) Kahn's algorithm, seeded in arena order for determinism.
    let mut seeds: Vec<NodeId> = indeg
        .iter()
        .filter(|&(_, &d)| d == 0)
        .map(|(&nid, _)| nid)
        .collect();
    seeds.sort();
    let mut q: VecDeque<NodeId> = seeds.into();

    let mut topo = Vec::with_capacity(reachable.len());
    while let Some(nid) = q.pop_front() {
        topo.push(nid);
        if let Some(us) = users.get_mut(&nid) {
            us.sort();
            for &u in us.iter() {
                let Some(e) = indeg.get_mut(&u) else { continue };
                *e -= 1;
                if *e == 0 {
                    q.push_back(u);
                }
            }
        }
    }

    if topo.len() != reachable.len() {
        return Err(IrError::Graph("cycle detected in graph"));
    }

    Ok(Schedule {
        topo,
        outputs: outputs.to_vec(),
    })
}
