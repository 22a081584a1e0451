//! Queued device operations.
//!
//! Each primitive the simulator exposes is recorded as one [`Op`] and only
//! applied when the batch is run.

use std::fmt;

use hbmsim_core::{Residency, SimError, TensorId};

/// Concatenation axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    /// Axis 0: stack vertically, columns must match.
    Rows,
    /// Axis 1: stack horizontally, rows must match.
    Cols,
}

impl TryFrom<usize> for Axis {
    type Error = SimError;

    fn try_from(axis: usize) -> Result<Self, SimError> {
        match axis {
            0 => Ok(Axis::Rows),
            1 => Ok(Axis::Cols),
            _ => Err(SimError::IndexOutOfRange { index: axis, len: 2 }),
        }
    }
}

/// One pending operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Move to SRAM (no-op if already there).
    MoveToSram(TensorId),
    /// Move to HBM (no-op if already there).
    MoveToHbm(TensorId),
    /// `dst = src`, in `residency`.
    Copy { src: TensorId, dst: TensorId, residency: Residency },
    /// In-place transpose.
    Transpose { target: TensorId, residency: Residency },
    /// `out = [a; b]` (rows) or `out = [a, b]` (cols).
    Concat {
        a: TensorId,
        b: TensorId,
        out: TensorId,
        axis: Axis,
        residency: Residency,
    },
    /// `out = a @ b`
    MatMul { a: TensorId, b: TensorId, out: TensorId },
    /// `out = src[row, :]` as a 1xcols matrix.
    GetRow {
        src: TensorId,
        row: usize,
        out: TensorId,
        residency: Residency,
    },
    /// `out = exp(src)` elementwise.
    Exp { src: TensorId, out: TensorId },
    /// `out = [[sum(src)]]`
    Sum { src: TensorId, out: TensorId },
    /// `out = num / den`, den either 1x1 (broadcast) or the same shape.
    Div { num: TensorId, den: TensorId, out: TensorId },
    /// Return the handle to the allocator.
    Release(TensorId),
}

impl Op {
    /// Short operation name for logs and error reports.
    pub fn name(&self) -> &'static str {
        match self {
            Op::MoveToSram(_) => "move_to_sram",
            Op::MoveToHbm(_) => "move_to_hbm",
            Op::Copy { .. } => "copy",
            Op::Transpose { .. } => "transpose",
            Op::Concat { .. } => "concat",
            Op::MatMul { .. } => "matmul",
            Op::GetRow { .. } => "get_row",
            Op::Exp { .. } => "exp",
            Op::Sum { .. } => "sum",
            Op::Div { .. } => "div",
            Op::Release(_) => "release",
        }
    }

    /// Handle written by this op, if it produces a value.
    pub fn output(&self) -> Option<TensorId> {
        match self {
            Op::Copy { dst, .. } => Some(*dst),
            Op::Transpose { target, .. } => Some(*target),
            Op::Concat { out, .. }
            | Op::MatMul { out, .. }
            | Op::GetRow { out, .. }
            | Op::Exp { out, .. }
            | Op::Sum { out, .. }
            | Op::Div { out, .. } => Some(*out),
            Op::MoveToSram(_) | Op::MoveToHbm(_) | Op::Release(_) => None,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::MoveToSram(t) | Op::MoveToHbm(t) | Op::Release(t) => {
                write!(f, "{}({t})", self.name())
            }
            Op::Copy { src, dst, residency } => write!(f, "copy({src} -> {dst}, {residency})"),
            Op::Transpose { target, residency } => write!(f, "transpose({target}, {residency})"),
            Op::Concat { a, b, out, axis, residency } => {
                write!(f, "concat({a}, {b} -> {out}, {axis:?}, {residency})")
            }
            Op::MatMul { a, b, out } => write!(f, "matmul({a}, {b} -> {out})"),
            Op::GetRow { src, row, out, residency } => {
                write!(f, "get_row({src}[{row}] -> {out}, {residency})")
            }
            Op::Exp { src, out } => write!(f, "exp({src} -> {out})"),
            Op::Sum { src, out } => write!(f, "sum({src} -> {out})"),
            Op::Div { num, den, out } => write!(f, "div({num}, {den} -> {out})"),
        }
    }
}
