//! Attribute visitor: the minimal contract a serializer needs from an op.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::graph::OpKind;
use crate::types::{AutoBroadcastSpec, AxisSet, DType, PartialShape, Shape};
use crate::{IrError, Result};

/// A single named attribute value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttrValue {
    I64(i64),
    Shape(Shape),
    PartialShape(PartialShape),
    Axes(Vec<usize>),
    ElementType(DType),
    /// Kept as a string so unknown modes surface when the op is rebuilt.
    BroadcastSpec { mode: String, axis: i64 },
}

impl AttrValue {
    pub fn axes(axes: &AxisSet) -> Self {
        AttrValue::Axes(axes.iter().copied().collect())
    }

    pub fn broadcast_spec(spec: &AutoBroadcastSpec) -> Self {
        AttrValue::BroadcastSpec {
            mode: spec.kind.as_str().to_string(),
            axis: spec.axis,
        }
    }
}

/// Receives each named attribute of an op.
pub trait AttributeVisitor {
    fn on_attribute(&mut self, name: &'static str, value: AttrValue);
}

/// Attribute map collected from (or used to rebuild) an op.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AttrMap(pub BTreeMap<String, AttrValue>);

impl AttributeVisitor for AttrMap {
    fn on_attribute(&mut self, name: &'static str, value: AttrValue) {
        self.0.insert(name.to_string(), value);
    }
}

impl AttrMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect every attribute of `op`.
    pub fn of(op: &OpKind) -> Self {
        let mut map = Self::new();
        op.visit_attributes(&mut map);
        map
    }

    pub fn insert(&mut self, name: impl Into<String>, value: AttrValue) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| IrError::InvalidArgument(format!("attribute serialization: {e}")))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| IrError::Configuration(format!("attribute parse error: {e}")))
    }

    fn require(&self, name: &str) -> Result<&AttrValue> {
        self.get(name)
            .ok_or_else(|| IrError::Configuration(format!("missing attribute '{name}'")))
    }

    fn wrong_type(name: &str, expected: &str) -> IrError {
        IrError::Configuration(format!("attribute '{name}' is not {expected}"))
    }

    pub fn i64(&self, name: &str) -> Result<i64> {
        match self.require(name)? {
            AttrValue::I64(v) => Ok(*v),
            _ => Err(Self::wrong_type(name, "an integer")),
        }
    }

    pub fn shape(&self, name: &str) -> Result<Shape> {
        match self.require(name)? {
            AttrValue::Shape(s) => Ok(s.clone()),
            _ => Err(Self::wrong_type(name, "a shape")),
        }
    }

    pub fn partial_shape(&self, name: &str) -> Result<PartialShape> {
        match self.require(name)? {
            AttrValue::PartialShape(s) => Ok(s.clone()),
            AttrValue::Shape(s) => Ok(s.into()),
            _ => Err(Self::wrong_type(name, "a partial shape")),
        }
    }

    pub fn axes(&self, name: &str) -> Result<AxisSet> {
        match self.require(name)? {
            AttrValue::Axes(v) => Ok(v.iter().copied().collect()),
            _ => Err(Self::wrong_type(name, "an axis set")),
        }
    }

    pub fn element_type(&self, name: &str) -> Result<DType> {
        match self.require(name)? {
            AttrValue::ElementType(t) => Ok(*t),
            _ => Err(Self::wrong_type(name, "an element type")),
        }
    }

    pub fn broadcast_spec(&self, name: &str) -> Result<AutoBroadcastSpec> {
        match self.require(name)? {
            AttrValue::BroadcastSpec { mode, axis } => Ok(AutoBroadcastSpec {
                kind: mode.parse()?,
                axis: *axis,
            }),
            _ => Err(Self::wrong_type(name, "a broadcast spec")),
        }
    }
}
