//! Reference f32 kernels, one per op.
//!
//! Kernels see only flat row-major data plus static shapes; all shape
//! resolution happened during inference and compilation.

use opgraph_core::{AxisSet, IrError, Result, Shape};

/// A kernel input: flat data and its static shape.
#[derive(Clone, Copy, Debug)]
pub struct Operand<'a> {
    pub data: &'a [f32],
    pub shape: &'a Shape,
}

/// A compiled node's computation.
#[derive(Clone, Debug, PartialEq)]
pub enum Kernel {
    /// Bound from the executable's parameter list.
    Input(usize),
    Literal(Vec<f32>),
    Add,
    Sum(AxisSet),
    /// Reshape: the flat data is unchanged.
    Copy,
    Concat(usize),
    /// For each argument axis, the result axis it lands on.
    Broadcast(Vec<usize>),
}

impl Kernel {
    pub fn name(&self) -> &'static str {
        match self {
            Kernel::Input(_) => "input",
            Kernel::Literal(_) => "literal",
            Kernel::Add => "add",
            Kernel::Sum(_) => "sum",
            Kernel::Copy => "copy",
            Kernel::Concat(_) => "concat",
            Kernel::Broadcast(_) => "broadcast",
        }
    }
}

/// Evaluate `kernel` over `inputs`, producing data of `out_shape`.
pub fn eval(kernel: &Kernel, inputs: &[Operand<'_>], out_shape: &Shape) -> Result<Vec<f32>> {
    match kernel {
        Kernel::Input(slot) => Err(IrError::InvalidArgument(format!(
            "input slot {slot} is bound at execute time"
        ))),
        Kernel::Literal(values) => Ok(values.clone()),
        Kernel::Add => add(inputs),
        Kernel::Sum(axes) => sum(inputs, axes, out_shape),
        Kernel::Copy => Ok(require_input(inputs, 0)?.data.to_vec()),
        Kernel::Concat(axis) => concat(inputs, *axis),
        Kernel::Broadcast(positions) => broadcast(inputs, positions, out_shape),
    }
}

fn require_input<'a>(inputs: &'a [Operand<'a>], idx: usize) -> Result<&'a Operand<'a>> {
    inputs
        .get(idx)
        .ok_or_else(|| IrError::InvalidArgument(format!("expected input at index {idx}")))
}

fn add(inputs: &[Operand<'_>]) -> Result<Vec<f32>> {
    let a = require_input(inputs, 0)?;
    let b = require_input(inputs, 1)?;
    if a.shape != b.shape {
        return Err(IrError::Backend(format!(
            "add: shapes {} and {} differ",
            a.shape, b.shape
        )));
    }
    Ok(a.data
        .iter()
        .zip(b.data.iter())
        .map(|(&x, &y)| x + y)
        .collect())
}

fn sum(inputs: &[Operand<'_>], axes: &AxisSet, out_shape: &Shape) -> Result<Vec<f32>> {
    let a = require_input(inputs, 0)?;
    let in_shape = a.shape.dims();
    let out_strides = out_shape.strides();
    if in_shape.len() != out_shape.ndim() + axes.len() {
        return Err(IrError::Backend(format!(
            "sum: cannot reduce {} to {}",
            a.shape, out_shape
        )));
    }

    let mut result = vec![0.0f32; out_shape.numel()];
    for (in_flat, &x) in a.data.iter().enumerate() {
        let mut remaining = in_flat;
        let mut out_flat = 0usize;
        // Kept axes, walked from the innermost outward.
        let mut out_d = out_shape.ndim();
        for d in (0..in_shape.len()).rev() {
            let coord = remaining % in_shape[d];
            remaining /= in_shape[d];
            if !axes.contains(&d) {
                out_d -= 1;
                out_flat += coord * out_strides[out_d];
            }
        }
        result[out_flat] += x;
    }
    Ok(result)
}

fn concat(inputs: &[Operand<'_>], axis: usize) -> Result<Vec<f32>> {
    let first = require_input(inputs, 0)?;
    let dims = first.shape.dims();
    if axis >= dims.len() {
        return Err(IrError::Backend(format!(
            "concat: axis {axis} out of range for {}",
            first.shape
        )));
    }
    let outer: usize = dims[..axis].iter().product();
    let total: usize = inputs.iter().map(|i| i.data.len()).sum();

    let mut result = Vec::with_capacity(total);
    for o in 0..outer {
        for input in inputs {
            let chunk = input.shape.dims()[axis..].iter().product::<usize>();
            result.extend_from_slice(&input.data[o * chunk..(o + 1) * chunk]);
        }
    }
    Ok(result)
}

fn broadcast(inputs: &[Operand<'_>], positions: &[usize], out_shape: &Shape) -> Result<Vec<f32>> {
    let a = require_input(inputs, 0)?;
    let in_shape = a.shape.dims();
    let out_dims = out_shape.dims();
    if positions.len() != in_shape.len() {
        return Err(IrError::Backend(format!(
            "broadcast: {} argument axes but {} positions",
            in_shape.len(),
            positions.len()
        )));
    }

    // Result axis -> (argument extent, argument stride).
    let in_strides = a.shape.strides();
    let mut source: Vec<Option<(usize, usize)>> = vec![None; out_dims.len()];
    for (arg_axis, &pos) in positions.iter().enumerate() {
        let slot = source.get_mut(pos).ok_or_else(|| {
            IrError::Backend(format!("broadcast: axis {pos} out of range for {out_shape}"))
        })?;
        *slot = Some((in_shape[arg_axis], in_strides[arg_axis]));
    }

    let mut result = vec![0.0f32; out_shape.numel()];
    for (out_flat, out) in result.iter_mut().enumerate() {
        let mut remaining = out_flat;
        let mut in_flat = 0usize;
        for d in (0..out_dims.len()).rev() {
            let coord = remaining % out_dims[d];
            remaining /= out_dims[d];
            if let Some((in_dim, stride)) = source[d] {
                let in_coord = if in_dim == 1 { 0 } else { coord };
                in_flat += in_coord * stride;
            }
        }
        *out = a.data[in_flat];
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operand<'a>(data: &'a [f32], shape: &'a Shape) -> Operand<'a> {
        Operand { data, shape }
    }

    #[test]
    fn test_sum_middle_axis() {
        let shape = Shape::new(vec![2, 3, 2]);
        let data: Vec<f32> = (0..12).map(|x| x as f32).collect();
        let out = eval(
            &Kernel::Sum([1].into_iter().collect()),
            &[operand(&data, &shape)],
            &Shape::new(vec![2, 2]),
        )
        .unwrap();
        assert_eq!(out, vec![6.0, 9.0, 24.0, 27.0]);
    }

    #[test]
    fn test_sum_all_axes() {
        let shape = Shape::new(vec![2, 2]);
        let data = [1.0, 2.0, 3.0, 4.0];
        let out = eval(
            &Kernel::Sum([0, 1].into_iter().collect()),
            &[operand(&data, &shape)],
            &Shape::scalar(),
        )
        .unwrap();
        assert_eq!(out, vec![10.0]);
    }

    #[test]
    fn test_broadcast_prefix_and_stretch() {
        // [3, 1] -> [2, 3, 2], arg axes at 1 and 2.
        let shape = Shape::new(vec![3, 1]);
        let data = [1.0, 2.0, 3.0];
        let out = eval(
            &Kernel::Broadcast(vec![1, 2]),
            &[operand(&data, &shape)],
            &Shape::new(vec![2, 3, 2]),
        )
        .unwrap();
        assert_eq!(
            out,
            vec![1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0]
        );
    }

    #[test]
    fn test_broadcast_explicit_positions() {
        // [2] placed on axis 0 of [2, 3].
        let shape = Shape::new(vec![2]);
        let data = [1.0, 2.0];
        let out = eval(
            &Kernel::Broadcast(vec![0]),
            &[operand(&data, &shape)],
            &Shape::new(vec![2, 3]),
        )
        .unwrap();
        assert_eq!(out, vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_concat_inner_axis() {
        let a_shape = Shape::new(vec![2, 1]);
        let b_shape = Shape::new(vec![2, 2]);
        let a = [1.0, 2.0];
        let b = [10.0, 11.0, 20.0, 21.0];
        let out = eval(
            &Kernel::Concat(1),
            &[operand(&a, &a_shape), operand(&b, &b_shape)],
            &Shape::new(vec![2, 3]),
        )
        .unwrap();
        assert_eq!(out, vec![1.0, 10.0, 11.0, 2.0, 20.0, 21.0]);
    }

    #[test]
    fn test_add_rejects_mismatch() {
        let a_shape = Shape::new(vec![2]);
        let b_shape = Shape::new(vec![3]);
        let err = eval(
            &Kernel::Add,
            &[operand(&[1.0, 2.0], &a_shape), operand(&[1.0, 2.0, 3.0], &b_shape)],
            &a_shape,
        )
        .unwrap_err();
        assert!(matches!(err, IrError::Backend(_)));
    }
}
