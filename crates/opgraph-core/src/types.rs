//! Core type definitions: element types, static and partial shapes, and the
//! auto-broadcast policy attached to broadcast-capable ops.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::IrError;

/// Set of axis indices, kept sorted.
pub type AxisSet = BTreeSet<usize>;

/// Supported element types for tensor values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// Not yet known. Compatible with every other element type.
    Dynamic,
    Boolean,
    F32,
    F16,
    BF16,
    I32,
    I64,
    U8,
    U64,
}

impl DType {
    /// Size in bytes of a single element, `None` for `Dynamic`.
    pub fn size_bytes(self) -> Option<usize> {
        match self {
            DType::Dynamic => None,
            DType::Boolean | DType::U8 => Some(1),
            DType::F16 | DType::BF16 => Some(2),
            DType::F32 | DType::I32 => Some(4),
            DType::I64 | DType::U64 => Some(8),
        }
    }

    pub fn is_dynamic(self) -> bool {
        self == DType::Dynamic
    }

    /// Integer element type (signed or unsigned). Booleans do not count.
    pub fn is_integral(self) -> bool {
        matches!(self, DType::I32 | DType::I64 | DType::U8 | DType::U64)
    }

    pub fn is_real(self) -> bool {
        matches!(self, DType::F32 | DType::F16 | DType::BF16)
    }

    /// Merge two element types; `Dynamic` yields the other side.
    pub fn merge(self, other: DType) -> Option<DType> {
        match (self, other) {
            (DType::Dynamic, t) | (t, DType::Dynamic) => Some(t),
            (a, b) if a == b => Some(a),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::Dynamic => "dynamic",
            DType::Boolean => "boolean",
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::U8 => "u8",
            DType::U64 => "u64",
        };
        f.write_str(name)
    }
}

/// Fully static tensor shape.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape(pub Vec<usize>);

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self(dims.into())
    }

    /// Scalar (rank-0) shape.
    pub fn scalar() -> Self {
        Self(vec![])
    }

    /// Number of dimensions (rank).
    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements, saturating at `usize::MAX`.
    ///
    /// Use [`Shape::checked_numel`] wherever an oversized shape must be
    /// reported rather than clamped.
    pub fn numel(&self) -> usize {
        self.checked_numel().unwrap_or(usize::MAX)
    }

    /// Total number of elements, `None` if it does not fit in `usize`.
    pub fn checked_numel(&self) -> Option<usize> {
        if self.0.contains(&0) {
            return Some(0);
        }
        self.0.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    /// Get dimension at axis (supports negative indexing).
    pub fn dim(&self, axis: i64) -> Option<usize> {
        let ndim = self.0.len() as i64;
        let idx = if axis < 0 { ndim + axis } else { axis };
        if idx >= 0 && idx < ndim {
            Some(self.0[idx as usize])
        } else {
            None
        }
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Row-major strides in elements.
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1; self.0.len()];
        for i in (0..self.0.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.0[i + 1];
        }
        strides
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Self(dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

/// A single dimension: a known size or dynamic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    Static(usize),
    Dynamic,
}

impl Dimension {
    pub fn dynamic() -> Self {
        Dimension::Dynamic
    }

    pub fn is_static(self) -> bool {
        matches!(self, Dimension::Static(_))
    }

    pub fn is_dynamic(self) -> bool {
        matches!(self, Dimension::Dynamic)
    }

    /// The known size, if any.
    pub fn get(self) -> Option<usize> {
        match self {
            Dimension::Static(n) => Some(n),
            Dimension::Dynamic => None,
        }
    }

    /// Two dimensions are compatible if either is dynamic or both are equal.
    pub fn compatible(self, other: Dimension) -> bool {
        match (self, other) {
            (Dimension::Static(a), Dimension::Static(b)) => a == b,
            _ => true,
        }
    }

    /// The more specific of two compatible dimensions.
    pub fn merge(self, other: Dimension) -> Option<Dimension> {
        match (self, other) {
            (Dimension::Dynamic, d) | (d, Dimension::Dynamic) => Some(d),
            (Dimension::Static(a), Dimension::Static(b)) if a == b => Some(self),
            _ => None,
        }
    }

    /// `self` is at least as specific as `other` and agrees with it.
    pub fn refines(self, other: Dimension) -> bool {
        match other {
            Dimension::Dynamic => true,
            Dimension::Static(_) => self == other,
        }
    }
}

impl From<usize> for Dimension {
    fn from(n: usize) -> Self {
        Dimension::Static(n)
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Static(n) => write!(f, "{n}"),
            Dimension::Dynamic => write!(f, "?"),
        }
    }
}

/// A shape that may have unknown rank or unknown dimensions.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartialShape {
    /// Any rank, any dimensions.
    Dynamic,
    /// Known rank; each dimension may still be dynamic.
    Ranked(Vec<Dimension>),
}

impl PartialShape {
    pub fn dynamic() -> Self {
        PartialShape::Dynamic
    }

    pub fn new(dims: impl Into<Vec<Dimension>>) -> Self {
        PartialShape::Ranked(dims.into())
    }

    /// Known rank with every dimension dynamic.
    pub fn with_rank(rank: usize) -> Self {
        PartialShape::Ranked(vec![Dimension::Dynamic; rank])
    }

    pub fn rank(&self) -> Option<usize> {
        match self {
            PartialShape::Dynamic => None,
            PartialShape::Ranked(dims) => Some(dims.len()),
        }
    }

    pub fn dims(&self) -> Option<&[Dimension]> {
        match self {
            PartialShape::Dynamic => None,
            PartialShape::Ranked(dims) => Some(dims),
        }
    }

    /// Rank known and every dimension known.
    pub fn is_static(&self) -> bool {
        match self {
            PartialShape::Dynamic => false,
            PartialShape::Ranked(dims) => dims.iter().all(|d| d.is_static()),
        }
    }

    pub fn to_shape(&self) -> Option<Shape> {
        self.dims()?
            .iter()
            .map(|d| d.get())
            .collect::<Option<Vec<_>>>()
            .map(Shape)
    }

    /// Rank-compatible and elementwise compatible.
    pub fn compatible(&self, other: &PartialShape) -> bool {
        match (self, other) {
            (PartialShape::Dynamic, _) | (_, PartialShape::Dynamic) => true,
            (PartialShape::Ranked(a), PartialShape::Ranked(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.compatible(*y))
            }
        }
    }

    /// The most specific shape both operands describe, `None` if incompatible.
    pub fn merge(&self, other: &PartialShape) -> Option<PartialShape> {
        match (self, other) {
            (PartialShape::Dynamic, s) | (s, PartialShape::Dynamic) => Some(s.clone()),
            (PartialShape::Ranked(a), PartialShape::Ranked(b)) => {
                if a.len() != b.len() {
                    return None;
                }
                a.iter()
                    .zip(b)
                    .map(|(x, y)| x.merge(*y))
                    .collect::<Option<Vec<_>>>()
                    .map(PartialShape::Ranked)
            }
        }
    }

    /// Every shape `self` admits is also admitted by `other`.
    pub fn refines(&self, other: &PartialShape) -> bool {
        match (self, other) {
            (_, PartialShape::Dynamic) => true,
            (PartialShape::Dynamic, PartialShape::Ranked(_)) => false,
            (PartialShape::Ranked(a), PartialShape::Ranked(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.refines(*y))
            }
        }
    }

    /// Whether the rank could be `rank`.
    pub fn rank_compatible(&self, rank: usize) -> bool {
        self.rank().is_none_or(|r| r == rank)
    }
}

impl From<Shape> for PartialShape {
    fn from(shape: Shape) -> Self {
        PartialShape::Ranked(shape.0.into_iter().map(Dimension::Static).collect())
    }
}

impl From<&Shape> for PartialShape {
    fn from(shape: &Shape) -> Self {
        PartialShape::Ranked(shape.0.iter().copied().map(Dimension::Static).collect())
    }
}

impl fmt::Display for PartialShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartialShape::Dynamic => write!(f, "[...]"),
            PartialShape::Ranked(dims) => {
                write!(f, "[")?;
                for (i, d) in dims.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{d}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Dimension-alignment policy of a broadcast-capable op.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoBroadcastType {
    /// Explicit axes mapping.
    None,
    Numpy,
    Pdpd,
    Bidirectional,
}

impl AutoBroadcastType {
    pub fn as_str(self) -> &'static str {
        match self {
            AutoBroadcastType::None => "none",
            AutoBroadcastType::Numpy => "numpy",
            AutoBroadcastType::Pdpd => "pdpd",
            AutoBroadcastType::Bidirectional => "bidirectional",
        }
    }
}

impl FromStr for AutoBroadcastType {
    type Err = IrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "explicit" => Ok(AutoBroadcastType::None),
            "numpy" => Ok(AutoBroadcastType::Numpy),
            "pdpd" => Ok(AutoBroadcastType::Pdpd),
            "bidirectional" => Ok(AutoBroadcastType::Bidirectional),
            other => Err(IrError::Configuration(format!(
                "unknown autobroadcast type '{other}'"
            ))),
        }
    }
}

impl fmt::Display for AutoBroadcastType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broadcast policy plus the PDPD start axis (ignored by other policies).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AutoBroadcastSpec {
    pub kind: AutoBroadcastType,
    pub axis: i64,
}

impl AutoBroadcastSpec {
    pub const fn new(kind: AutoBroadcastType) -> Self {
        Self { kind, axis: 0 }
    }

    pub const fn explicit() -> Self {
        Self::new(AutoBroadcastType::None)
    }

    pub const fn numpy() -> Self {
        Self::new(AutoBroadcastType::Numpy)
    }

    pub const fn bidirectional() -> Self {
        Self::new(AutoBroadcastType::Bidirectional)
    }

    /// PDPD alignment starting at `axis` of the target; `-1` aligns right.
    pub const fn pdpd(axis: i64) -> Self {
        Self {
            kind: AutoBroadcastType::Pdpd,
            axis,
        }
    }

    pub fn is_explicit(&self) -> bool {
        self.kind == AutoBroadcastType::None
    }
}

impl Default for AutoBroadcastSpec {
    fn default() -> Self {
        Self::numpy()
    }
}

impl fmt::Display for AutoBroadcastSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            AutoBroadcastType::Pdpd => write!(f, "pdpd(axis={})", self.axis),
            kind => write!(f, "{kind}"),
        }
    }
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

    #[test]
    fn test_shape_numel() {
        assert_eq!(Shape::new(vec![2, 3, 4]).numel(), 24);
        assert_eq!(Shape::scalar().numel(), 1);
        assert_eq!(Shape::new(vec![0, 5]).numel(), 0);
    }

    #[test]
    fn test_shape_numel_overflow() {
        let huge = Shape::new(vec![1 << 40, 1 << 40]);
        assert_eq!(huge.checked_numel(), None);
        assert_eq!(huge.numel(), usize::MAX);
        let empty = Shape::new(vec![1 << 40, 1 << 40, 0]);
        assert_eq!(empty.checked_numel(), Some(0));
    }

    #[test]
    fn test_shape_dim_negative_index() {
        let s = Shape::new(vec![2, 3, 4]);
        assert_eq!(s.dim(0), Some(2));
        assert_eq!(s.dim(-1), Some(4));
        assert_eq!(s.dim(-3), Some(2));
        assert_eq!(s.dim(3), None);
    }

    #[test]
    fn test_shape_strides() {
        assert_eq!(Shape::new(vec![2, 3, 4]).strides(), vec![12, 4, 1]);
        assert_eq!(Shape::scalar().strides(), Vec::<usize>::new());
    }

    #[test]
    fn test_dimension_merge_dynamic_is_identity() {
        let d = Dimension::Static(7);
        assert_eq!(Dimension::Dynamic.merge(d), Some(d));
        assert_eq!(d.merge(Dimension::Dynamic), Some(d));
        assert_eq!(d.merge(Dimension::Static(8)), None);
    }

    #[test]
    fn test_partial_shape_dynamic_rank_compatible_with_any() {
        let any = PartialShape::dynamic();
        assert!(any.compatible(&ps(&[Some(2), None, Some(4)])));
        assert!(any.compatible(&PartialShape::from(Shape::scalar())));
        assert_eq!(
            any.merge(&ps(&[Some(2), None])),
            Some(ps(&[Some(2), None]))
        );
    }

    #[test]
    fn test_partial_shape_rank_mismatch() {
        let a = ps(&[Some(2), None]);
        let b = ps(&[Some(2), None, None]);
        assert!(!a.compatible(&b));
        assert_eq!(a.merge(&b), None);
    }

    #[test]
    fn test_partial_shape_merge_refines() {
        let a = ps(&[Some(2), None, None]);
        let b = ps(&[None, Some(3), None]);
        let m = a.merge(&b).unwrap();
        assert_eq!(m, ps(&[Some(2), Some(3), None]));
        assert!(m.refines(&a));
        assert!(m.refines(&b));
        assert!(!a.refines(&m));
        assert!(!m.is_static());
    }

    #[test]
    fn test_partial_shape_to_shape() {
        assert_eq!(
            ps(&[Some(4), Some(5)]).to_shape(),
            Some(Shape::new(vec![4, 5]))
        );
        assert_eq!(ps(&[Some(4), None]).to_shape(), None);
        assert_eq!(PartialShape::dynamic().to_shape(), None);
    }

    #[test]
    fn test_partial_shape_display() {
        assert_eq!(ps(&[Some(2), None]).to_string(), "[2, ?]");
        assert_eq!(PartialShape::dynamic().to_string(), "[...]");
    }

    #[test]
    fn test_dtype_merge_and_families() {
        assert_eq!(DType::Dynamic.merge(DType::I64), Some(DType::I64));
        assert_eq!(DType::F32.merge(DType::I64), None);
        assert!(DType::I32.is_integral());
        assert!(DType::U8.is_integral());
        assert!(!DType::Boolean.is_integral());
        assert!(!DType::F32.is_integral());
        assert_eq!(DType::F16.size_bytes(), Some(2));
        assert_eq!(DType::Dynamic.size_bytes(), None);
    }

    #[test]
    fn test_broadcast_type_parse() {
        assert_eq!(
            "NUMPY".parse::<AutoBroadcastType>().unwrap(),
            AutoBroadcastType::Numpy
        );
        assert_eq!(
            "explicit".parse::<AutoBroadcastType>().unwrap(),
            AutoBroadcastType::None
        );
        let err = "transpose".parse::<AutoBroadcastType>().unwrap_err();
        assert!(matches!(err, IrError::Configuration(_)));
    }

    #[test]
    fn test_broadcast_spec_display() {
        assert_eq!(AutoBroadcastSpec::pdpd(1).to_string(), "pdpd(axis=1)");
        assert_eq!(AutoBroadcastSpec::numpy().to_string(), "numpy");
    }
}
