//! Shape inference and slice-level kernels for the reference executor.
//!
//! Kernels operate on plain `&[f32]` slices so the executor can point them at
//! owned or aliased storage without caring which. Backward kernels that feed
//! gradient accumulation add into their destination; the executor zeroes a
//! gradient slice before its first accumulation.

use anyhow::{bail, ensure, Result};

use crate::graph::{NarrowSpec, OpKind};
use crate::tensor::Shape;

/// Infers an operator's output shape from its input shapes.
pub fn infer_output_shape(op: &OpKind, inputs: &[Shape]) -> Result<Shape> {
    match op {
        OpKind::Linear(spec) => {
            ensure!(inputs.len() == 1, "linear expects one input");
            let x = &inputs[0];
            ensure!(
                x.rank() == 2 && x.dims()[1] == spec.in_features,
                "linear expects [rows, {}], got {:?}",
                spec.in_features,
                x.dims()
            );
            Ok(Shape::new([x.rows(), spec.out_features]))
        }
        OpKind::Add | OpKind::Mul => {
            ensure!(inputs.len() == 2, "elementwise op expects two inputs");
            if inputs[0] != inputs[1] {
                bail!(
                    "elementwise shape mismatch: {:?} vs {:?}",
                    inputs[0].dims(),
                    inputs[1].dims()
                );
            }
            Ok(inputs[0].clone())
        }
        OpKind::Sigmoid | OpKind::Tanh => {
            ensure!(inputs.len() == 1, "activation expects one input");
            Ok(inputs[0].clone())
        }
        OpKind::Narrow(spec) => {
            ensure!(inputs.len() == 1, "narrow expects one input");
            let x = &inputs[0];
            ensure!(x.rank() == 2, "narrow expects a rank-2 input");
            let cols = x.dims()[1];
            ensure!(
                spec.offset + spec.len <= cols,
                "narrow [{}..{}) exceeds {} columns",
                spec.offset,
                spec.offset + spec.len,
                cols
            );
            Ok(Shape::new([x.rows(), spec.len]))
        }
    }
}

/// `y = x W + b` with `x: [rows, in]`, `w: [in, out]`, `b: [out]`.
pub fn linear_forward(
    x: &[f32],
    rows: usize,
    in_features: usize,
    out_features: usize,
    w: &[f32],
    b: &[f32],
    y: &mut [f32],
) {
    for r in 0..rows {
        let x_row = &x[r * in_features..(r + 1) * in_features];
        let y_row = &mut y[r * out_features..(r + 1) * out_features];
        y_row.copy_from_slice(b);
        for (k, &xv) in x_row.iter().enumerate() {
            if xv == 0.0 {
                continue;
            }
            let w_row = &w[k * out_features..(k + 1) * out_features];
            for (o, &wv) in w_row.iter().enumerate() {
                y_row[o] += xv * wv;
            }
        }
    }
}

/// Backward of the fully connected projection. `dx` is overwritten; `dw` and
/// `db` are accumulated into.
#[allow(clippy::too_many_arguments)]
pub fn linear_backward(
    x: &[f32],
    rows: usize,
    in_features: usize,
    out_features: usize,
    w: &[f32],
    dy: &[f32],
    dx: &mut [f32],
    dw: &mut [f32],
    db: &mut [f32],
) {
    for r in 0..rows {
        let x_row = &x[r * in_features..(r + 1) * in_features];
        let dy_row = &dy[r * out_features..(r + 1) * out_features];
        let dx_row = &mut dx[r * in_features..(r + 1) * in_features];
        for k in 0..in_features {
            let w_row = &w[k * out_features..(k + 1) * out_features];
            let mut acc = 0.0;
            for (o, &dyv) in dy_row.iter().enumerate() {
                acc += dyv * w_row[o];
            }
            dx_row[k] = acc;
            let xv = x_row[k];
            if xv != 0.0 {
                let dw_row = &mut dw[k * out_features..(k + 1) * out_features];
                for (o, &dyv) in dy_row.iter().enumerate() {
                    dw_row[o] += xv * dyv;
                }
            }
        }
        for (o, &dyv) in dy_row.iter().enumerate() {
            db[o] += dyv;
        }
    }
}

pub fn add_forward(a: &[f32], b: &[f32], y: &mut [f32]) {
    for ((yv, &av), &bv) in y.iter_mut().zip(a).zip(b) {
        *yv = av + bv;
    }
}

/// Addition routes the upstream gradient to both operands unchanged.
pub fn add_backward(dy: &[f32], dx: &mut [f32]) {
    for (dxv, &dyv) in dx.iter_mut().zip(dy) {
        *dxv += dyv;
    }
}

pub fn mul_forward(a: &[f32], b: &[f32], y: &mut [f32]) {
    for ((yv, &av), &bv) in y.iter_mut().zip(a).zip(b) {
        *yv = av * bv;
    }
}

/// `d(a*b)/da = dy * b`; the caller passes the opposite operand as `other`.
pub fn mul_backward(dy: &[f32], other: &[f32], dx: &mut [f32]) {
    for ((dxv, &dyv), &ov) in dx.iter_mut().zip(dy).zip(other) {
        *dxv += dyv * ov;
    }
}

pub fn sigmoid_forward(x: &[f32], y: &mut [f32]) {
    for (yv, &xv) in y.iter_mut().zip(x) {
        *yv = 1.0 / (1.0 + (-xv).exp());
    }
}

/// Uses the forward output: `sigmoid'(x) = y * (1 - y)`.
pub fn sigmoid_backward(dy: &[f32], y: &[f32], dx: &mut [f32]) {
    for ((dxv, &dyv), &yv) in dx.iter_mut().zip(dy).zip(y) {
        *dxv += dyv * yv * (1.0 - yv);
    }
}

pub fn tanh_forward(x: &[f32], y: &mut [f32]) {
    for (yv, &xv) in y.iter_mut().zip(x) {
        *yv = xv.tanh();
    }
}

/// Uses the forward output: `tanh'(x) = 1 - y^2`.
pub fn tanh_backward(dy: &[f32], y: &[f32], dx: &mut [f32]) {
    for ((dxv, &dyv), &yv) in dx.iter_mut().zip(dy).zip(y) {
        *dxv += dyv * (1.0 - yv * yv);
    }
}

/// Copies `spec.len` columns starting at `spec.offset` out of each row.
pub fn narrow_forward(x: &[f32], rows: usize, cols: usize, spec: &NarrowSpec, y: &mut [f32]) {
    for r in 0..rows {
        let src = &x[r * cols + spec.offset..r * cols + spec.offset + spec.len];
        y[r * spec.len..(r + 1) * spec.len].copy_from_slice(src);
    }
}

/// Scatters the slice gradient back into the source's column window.
pub fn narrow_backward(dy: &[f32], rows: usize, cols: usize, spec: &NarrowSpec, dx: &mut [f32]) {
    for r in 0..rows {
        let dst = &mut dx[r * cols + spec.offset..r * cols + spec.offset + spec.len];
        for (dxv, &dyv) in dst.iter_mut().zip(&dy[r * spec.len..(r + 1) * spec.len]) {
            *dxv += dyv;
        }
    }
}
