//! Computation graph IR.
//!
//! The graph is an arena of nodes addressed by stable `NodeId`s. A node can
//! only reference outputs of nodes constructed before it, so the arena order
//! is always a valid topological order and cycles cannot be expressed.
//!
//! This module stores nodes and their resolved output types; it does not run
//! shape inference. `opgraph-ops` computes `TensorMeta`s and inserts nodes.

use std::collections::HashMap;
use std::fmt;

use smallvec::SmallVec;
use tracing::debug;

use crate::attributes::{AttrMap, AttrValue, AttributeVisitor};
use crate::literal::Literal;
use crate::types::{AutoBroadcastSpec, AxisSet, DType, PartialShape, Shape};
use crate::{IrError, Result};

/// Unique identifier for a node in the computation graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }

    /// Reference to output slot `index` of this node.
    pub fn output(self, index: usize) -> Output {
        Output { node: self, index }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// A (producer node, output slot) pair: the unit of wiring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Output {
    pub node: NodeId,
    pub index: usize,
}

impl From<NodeId> for Output {
    fn from(node: NodeId) -> Self {
        node.output(0)
    }
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.index)
    }
}

/// Resolved element type and shape of an output slot.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TensorMeta {
    pub dtype: DType,
    pub shape: PartialShape,
}

impl TensorMeta {
    pub fn new(dtype: DType, shape: impl Into<PartialShape>) -> Self {
        Self {
            dtype,
            shape: shape.into(),
        }
    }

    pub fn is_static(&self) -> bool {
        !self.dtype.is_dynamic() && self.shape.is_static()
    }
}

impl fmt::Display for TensorMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.dtype, self.shape)
    }
}

/// Stable op identity used for serialization and backend dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TypeInfo {
    pub name: &'static str,
    pub version: u32,
}

impl TypeInfo {
    pub const fn new(name: &'static str, version: u32) -> Self {
        Self { name, version }
    }
}

impl fmt::Display for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-v{}", self.name, self.version)
    }
}

/// The set of operations supported by the graph IR.
#[derive(Clone, Debug, PartialEq)]
pub enum OpKind {
    // ── Sources ─────────────────────────────────────────────────────────
    /// Graph input; its shape may be partially known.
    Parameter { dtype: DType, shape: PartialShape },
    /// Compile-time literal. The payload is stored on the graph.
    Constant { dtype: DType, shape: Shape },

    // ── Structural ──────────────────────────────────────────────────────
    Concat { axis: i64 },
    Reshape { shape: Shape },

    // ── Arithmetic ──────────────────────────────────────────────────────
    Add,
    Sum { reduction_axes: AxisSet },

    // ── Broadcasting ────────────────────────────────────────────────────
    /// Broadcast to a static shape along the given result axes.
    BroadcastV0 {
        shape: Shape,
        broadcast_axes: AxisSet,
    },
    /// Inputs: `[arg, target_shape]`, plus `axes_mapping` in explicit mode.
    /// Supports NONE, NUMPY and PDPD.
    BroadcastV1 { spec: AutoBroadcastSpec },
    /// Same inputs as v1; additionally supports BIDIRECTIONAL.
    BroadcastV3 { spec: AutoBroadcastSpec },
}

pub const PARAMETER: TypeInfo = TypeInfo::new("Parameter", 0);
pub const CONSTANT: TypeInfo = TypeInfo::new("Constant", 0);
pub const CONCAT: TypeInfo = TypeInfo::new("Concat", 0);
pub const RESHAPE: TypeInfo = TypeInfo::new("Reshape", 1);
pub const ADD: TypeInfo = TypeInfo::new("Add", 1);
pub const SUM: TypeInfo = TypeInfo::new("Sum", 0);
pub const BROADCAST_V0: TypeInfo = TypeInfo::new("Broadcast", 0);
pub const BROADCAST_V1: TypeInfo = TypeInfo::new("Broadcast", 1);
pub const BROADCAST_V3: TypeInfo = TypeInfo::new("Broadcast", 3);

impl OpKind {
    pub fn type_info(&self) -> TypeInfo {
        match self {
            OpKind::Parameter { .. } => PARAMETER,
            OpKind::Constant { .. } => CONSTANT,
            OpKind::Concat { .. } => CONCAT,
            OpKind::Reshape { .. } => RESHAPE,
            OpKind::Add => ADD,
            OpKind::Sum { .. } => SUM,
            OpKind::BroadcastV0 { .. } => BROADCAST_V0,
            OpKind::BroadcastV1 { .. } => BROADCAST_V1,
            OpKind::BroadcastV3 { .. } => BROADCAST_V3,
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, OpKind::Constant { .. })
    }

    /// Broadcast spec for the dynamic broadcast versions.
    pub fn broadcast_spec(&self) -> Option<AutoBroadcastSpec> {
        match self {
            OpKind::BroadcastV1 { spec } | OpKind::BroadcastV3 { spec } => Some(*spec),
            _ => None,
        }
    }

    /// Enumerate this op's named attributes.
    pub fn visit_attributes(&self, visitor: &mut dyn AttributeVisitor) {
        match self {
            OpKind::Parameter { dtype, shape } => {
                visitor.on_attribute("element_type", AttrValue::ElementType(*dtype));
                visitor.on_attribute("shape", AttrValue::PartialShape(shape.clone()));
            }
            OpKind::Constant { dtype, shape } => {
                visitor.on_attribute("element_type", AttrValue::ElementType(*dtype));
                visitor.on_attribute("shape", AttrValue::Shape(shape.clone()));
            }
            OpKind::Concat { axis } => visitor.on_attribute("axis", AttrValue::I64(*axis)),
            OpKind::Reshape { shape } => {
                visitor.on_attribute("shape", AttrValue::Shape(shape.clone()));
            }
            OpKind::Add => {}
            OpKind::Sum { reduction_axes } => {
                visitor.on_attribute("reduction_axes", AttrValue::axes(reduction_axes));
            }
            OpKind::BroadcastV0 {
                shape,
                broadcast_axes,
            } => {
                visitor.on_attribute("shape", AttrValue::Shape(shape.clone()));
                visitor.on_attribute("broadcast_axes", AttrValue::axes(broadcast_axes));
            }
            OpKind::BroadcastV1 { spec } | OpKind::BroadcastV3 { spec } => {
                visitor.on_attribute("broadcast_spec", AttrValue::broadcast_spec(spec));
            }
        }
    }

    /// Rebuild an op from its identity and attribute map.
    ///
    /// Dispatches on the full `(name, version)` pair. Unknown pairs and
    /// unknown broadcast modes are configuration errors.
    pub fn from_attributes(type_info: TypeInfo, attrs: &AttrMap) -> Result<OpKind> {
        let op = match (type_info.name, type_info.version) {
            ("Parameter", 0) => OpKind::Parameter {
                dtype: attrs.element_type("element_type")?,
                shape: attrs.partial_shape("shape")?,
            },
            ("Constant", 0) => OpKind::Constant {
                dtype: attrs.element_type("element_type")?,
                shape: attrs.shape("shape")?,
            },
            ("Concat", 0) => OpKind::Concat {
                axis: attrs.i64("axis")?,
            },
            ("Reshape", 1) => OpKind::Reshape {
                shape: attrs.shape("shape")?,
            },
            ("Add", 1) => OpKind::Add,
            ("Sum", 0) => OpKind::Sum {
                reduction_axes: attrs.axes("reduction_axes")?,
            },
            ("Broadcast", 0) => OpKind::BroadcastV0 {
                shape: attrs.shape("shape")?,
                broadcast_axes: attrs.axes("broadcast_axes")?,
            },
            ("Broadcast", 1) => OpKind::BroadcastV1 {
                spec: attrs.broadcast_spec("broadcast_spec")?,
            },
            ("Broadcast", 3) => OpKind::BroadcastV3 {
                spec: attrs.broadcast_spec("broadcast_spec")?,
            },
            (name, version) => {
                return Err(IrError::Configuration(format!(
                    "unknown op {name} version {version}"
                )));
            }
        };
        Ok(op)
    }
}

/// A node in the computation graph.
#[derive(Clone, Debug)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub op: OpKind,
    pub inputs: SmallVec<[Output; 3]>,
    pub outputs: SmallVec<[TensorMeta; 1]>,
    /// Per input: whether its *value* (not only its shape) feeds this node's
    /// output shape. Re-inference schedulers use this after constant folding.
    pub value_relevant: SmallVec<[bool; 3]>,
}

impl Node {
    pub fn type_info(&self) -> TypeInfo {
        self.op.type_info()
    }

    pub fn output_meta(&self, index: usize) -> Option<&TensorMeta> {
        self.outputs.get(index)
    }

    pub fn input_is_relevant_to_shape(&self, index: usize) -> bool {
        self.value_relevant.get(index).copied().unwrap_or(false)
    }
}

/// The computation graph arena.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    literals: HashMap<NodeId, Literal>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// The id the next inserted node will receive.
    pub fn next_id(&self) -> NodeId {
        NodeId(self.nodes.len())
    }

    /// Insert a node whose outputs have already been inferred.
    ///
    /// Every input must name an existing output slot of an existing node.
    pub fn insert(
        &mut self,
        op: OpKind,
        inputs: &[Output],
        outputs: SmallVec<[TensorMeta; 1]>,
        value_relevant: SmallVec<[bool; 3]>,
    ) -> Result<NodeId> {
        for input in inputs {
            self.meta(*input)?;
        }
        let id = self.next_id();
        let name = format!("{}_{}", op.type_info().name, id.0);
        debug!(node = %id, op = %op.type_info(), inputs = inputs.len(), "insert node");
        self.nodes.push(Node {
            id,
            name,
            op,
            inputs: SmallVec::from_slice(inputs),
            outputs,
            value_relevant,
        });
        Ok(id)
    }

    /// Insert a `Constant` node together with its payload.
    pub fn insert_literal(
        &mut self,
        op: OpKind,
        literal: Literal,
        outputs: SmallVec<[TensorMeta; 1]>,
    ) -> Result<NodeId> {
        if !op.is_constant() {
            return Err(IrError::InvalidArgument(format!(
                "literal attached to non-constant op {}",
                op.type_info()
            )));
        }
        let id = self.insert(op, &[], outputs, SmallVec::new())?;
        self.literals.insert(id, literal);
        Ok(id)
    }

    /// Get a node by ID.
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    /// Get a node by ID, failing on a dangling handle.
    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.get(id).ok_or(IrError::Graph("node not found"))
    }

    /// Resolved type of an output slot.
    pub fn meta(&self, output: Output) -> Result<&TensorMeta> {
        self.node(output.node)?
            .output_meta(output.index)
            .ok_or(IrError::Graph("output slot not found"))
    }

    /// Payload of a `Constant` node.
    pub fn literal(&self, id: NodeId) -> Option<&Literal> {
        self.literals.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Replace the resolved outputs of a node after re-inference.
    pub fn set_outputs(
        &mut self,
        id: NodeId,
        outputs: SmallVec<[TensorMeta; 1]>,
        value_relevant: SmallVec<[bool; 3]>,
    ) -> Result<()> {
        let node = self
            .nodes
            .get_mut(id.0)
            .ok_or(IrError::Graph("node not found"))?;
        node.outputs = outputs;
        node.value_relevant = value_relevant;
        Ok(())
    }

    /// Rewire input `index` of `id`. Does not re-run inference.
    ///
    /// The new producer must precede the consumer so that the arena stays
    /// acyclic.
    pub fn set_input(&mut self, id: NodeId, index: usize, source: Output) -> Result<()> {
        if source.node >= id {
            return Err(IrError::Graph(
                "input must be produced by a node constructed earlier",
            ));
        }
        self.meta(source)?;
        let node = self
            .nodes
            .get_mut(id.0)
            .ok_or(IrError::Graph("node not found"))?;
        let slot = node
            .inputs
            .get_mut(index)
            .ok_or(IrError::Graph("input index out of range"))?;
        *slot = source;
        Ok(())
    }

    /// Mutable access to a node's attributes. Callers must re-infer.
    pub fn op_mut(&mut self, id: NodeId) -> Result<&mut OpKind> {
        self.nodes
            .get_mut(id.0)
            .map(|n| &mut n.op)
            .ok_or(IrError::Graph("node not found"))
    }

    /// Nodes that read any output of `id`.
    pub fn consumers(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes[id.0.min(self.nodes.len())..]
            .iter()
            .filter(|n| n.inputs.iter().any(|i| i.node == id))
            .map(|n| n.id)
            .collect()
    }

    /// Nodes `outputs` depend on (including themselves), in arena order.
    ///
    /// Inputs always precede their consumers in the arena, so a single
    /// backwards sweep marks every ancestor and arena order is topological.
    pub fn ancestors(&self, outputs: &[NodeId]) -> Vec<NodeId> {
        let mut needed = vec![false; self.nodes.len()];
        for out in outputs {
            if let Some(slot) = needed.get_mut(out.0) {
                *slot = true;
            }
        }
        for node in self.nodes.iter().rev() {
            if needed[node.id.0] {
                for input in &node.inputs {
                    needed[input.node.0] = true;
                }
            }
        }
        self.nodes
            .iter()
            .filter(|n| needed[n.id.0])
            .map(|n| n.id)
            .collect()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Dimension;
    use smallvec::smallvec;

    fn meta(shape: Vec<usize>) -> SmallVec<[TensorMeta; 1]> {
        smallvec![TensorMeta::new(DType::F32, Shape::new(shape))]
    }

    fn param(g: &mut Graph, shape: Vec<usize>) -> NodeId {
        g.insert(
            OpKind::Parameter {
                dtype: DType::F32,
                shape: Shape::new(shape.clone()).into(),
            },
            &[],
            meta(shape),
            SmallVec::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_ancestors_in_arena_order() {
        let mut g = Graph::new();
        let a = param(&mut g, vec![2, 3]);
        let unused = param(&mut g, vec![2, 3]);
        let b = param(&mut g, vec![2, 3]);
        let c = g
            .insert(
                OpKind::Add,
                &[b.into(), a.into()],
                meta(vec![2, 3]),
                smallvec![false, false],
            )
            .unwrap();

        assert_eq!(g.ancestors(&[c]), vec![a, b, c]);
        assert!(!g.ancestors(&[c]).contains(&unused));
        assert_eq!(g.ancestors(&[a, b]), vec![a, b]);
    }

    #[test]
    fn test_ancestors_of_deep_chain() {
        let mut g = Graph::new();
        let x = param(&mut g, vec![2]);
        let mut cur = x;
        for _ in 0..50_000 {
            cur = g
                .insert(
                    OpKind::Add,
                    &[cur.into(), x.into()],
                    meta(vec![2]),
                    smallvec![false, false],
                )
                .unwrap();
        }
        let order = g.ancestors(&[cur]);
        assert_eq!(order.len(), 50_001);
        assert_eq!(order.first(), Some(&x));
        assert_eq!(order.last(), Some(&cur));
    }

    #[test]
    fn test_insert_rejects_dangling_input() {
        let mut g = Graph::new();
        let err = g
            .insert(
                OpKind::Add,
                &[NodeId(4).into(), NodeId(5).into()],
                meta(vec![1]),
                SmallVec::new(),
            )
            .unwrap_err();
        assert!(matches!(err, IrError::Graph(_)));
        assert!(g.is_empty());
    }

    #[test]
    fn test_set_input_rejects_forward_reference() {
        let mut g = Graph::new();
        let a = param(&mut g, vec![2]);
        let b = param(&mut g, vec![2]);
        let c = g
            .insert(
                OpKind::Add,
                &[a.into(), b.into()],
                meta(vec![2]),
                SmallVec::new(),
            )
            .unwrap();
        let d = param(&mut g, vec![2]);
        assert!(g.set_input(c, 0, d.into()).is_err());
        g.set_input(c, 1, a.into()).unwrap();
        assert_eq!(g.node(c).unwrap().inputs[1], a.output(0));
    }

    #[test]
    fn test_consumers_and_names() {
        let mut g = Graph::new();
        let a = param(&mut g, vec![2]);
        let c = g
            .insert(
                OpKind::Add,
                &[a.into(), a.into()],
                meta(vec![2]),
                SmallVec::new(),
            )
            .unwrap();
        assert_eq!(g.consumers(a), vec![c]);
        assert_eq!(g.node(c).unwrap().name, "Add_1");
    }

    #[test]
    fn test_literal_only_on_constants() {
        let mut g = Graph::new();
        let err = g
            .insert_literal(OpKind::Add, Literal::from(vec![1i64]), meta(vec![1]))
            .unwrap_err();
        assert!(matches!(err, IrError::InvalidArgument(_)));

        let id = g
            .insert_literal(
                OpKind::Constant {
                    dtype: DType::I64,
                    shape: Shape::new(vec![2]),
                },
                Literal::from(vec![4i64, 5]),
                smallvec![TensorMeta::new(DType::I64, Shape::new(vec![2]))],
            )
            .unwrap();
        assert_eq!(g.literal(id).and_then(|l| l.as_i64()), Some(&[4i64, 5][..]));
    }

    #[test]
    fn test_type_info_distinguishes_versions() {
        let v1 = OpKind::BroadcastV1 {
            spec: AutoBroadcastSpec::numpy(),
        };
        let v3 = OpKind::BroadcastV3 {
            spec: AutoBroadcastSpec::numpy(),
        };
        assert_eq!(v1.type_info().name, v3.type_info().name);
        assert_ne!(v1.type_info(), v3.type_info());
        assert_eq!(v3.type_info().to_string(), "Broadcast-v3");
    }

    #[test]
    fn test_attribute_round_trip() {
        let ops = vec![
            OpKind::Parameter {
                dtype: DType::F32,
                shape: PartialShape::new(vec![Dimension::Static(2), Dimension::Dynamic]),
            },
            OpKind::Concat { axis: -1 },
            OpKind::Sum {
                reduction_axes: [0, 2].into_iter().collect(),
            },
            OpKind::BroadcastV0 {
                shape: Shape::new(vec![4, 5]),
                broadcast_axes: [0].into_iter().collect(),
            },
            OpKind::BroadcastV3 {
                spec: AutoBroadcastSpec::pdpd(1),
            },
            OpKind::Add,
        ];
        for op in ops {
            let attrs = AttrMap::of(&op);
            let json = attrs.to_json().unwrap();
            let back = AttrMap::from_json(&json).unwrap();
            assert_eq!(OpKind::from_attributes(op.type_info(), &back).unwrap(), op);
        }
    }

    #[test]
    fn test_from_attributes_unknown_version() {
        let err = OpKind::from_attributes(TypeInfo::new("Broadcast", 2), &AttrMap::new())
            .unwrap_err();
        assert!(matches!(err, IrError::Configuration(_)));
    }
}
