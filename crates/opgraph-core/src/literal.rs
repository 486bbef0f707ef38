//! Literal payloads held by `Constant` nodes.

use crate::types::DType;

/// Host storage for a constant's value.
///
/// Integral and boolean element types are stored as `i64`, floating types as
/// `f32`.
#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    I64(Vec<i64>),
    F32(Vec<f32>),
}

impl Literal {
    pub fn len(&self) -> usize {
        match self {
            Literal::I64(v) => v.len(),
            Literal::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this storage can hold values of `dtype`.
    pub fn fits(&self, dtype: DType) -> bool {
        match self {
            Literal::I64(_) => dtype.is_integral() || dtype == DType::Boolean,
            Literal::F32(_) => dtype.is_real(),
        }
    }

    /// Integer view of the payload; `None` for floating literals.
    pub fn as_i64(&self) -> Option<&[i64]> {
        match self {
            Literal::I64(v) => Some(v),
            Literal::F32(_) => None,
        }
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self {
            Literal::I64(v) => v.iter().map(|&x| x as f32).collect(),
            Literal::F32(v) => v.clone(),
        }
    }
}

impl From<Vec<i64>> for Literal {
    fn from(v: Vec<i64>) -> Self {
        Literal::I64(v)
    }
}

impl From<Vec<f32>> for Literal {
    fn from(v: Vec<f32>) -> Self {
        Literal::F32(v)
    }
}
