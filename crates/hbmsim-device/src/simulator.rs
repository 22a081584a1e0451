//! The deferred-execution device simulator.
//!
//! Primitives are recorded into an ordered queue and only applied by
//! [`GpuSimulator::run`], which walks the queue in submission order against
//! the allocator's matrices. Every compute primitive requires its operands to
//! be SRAM-resident when it executes; only the move primitives change a
//! matrix's tier.
//!
//! Each operation validates everything it reads before it writes, so a failed
//! operation never leaves a half-written output behind. The first failure
//! aborts the batch: the remaining operations are dropped, and the error
//! carries the failing operation's queue index.

use hbmsim_core::{Allocator, Matrix, Residency, Result, SimError, TensorId};

use crate::config::SimConfig;
use crate::kernels;
use crate::op::{Axis, Op};
use crate::stats::SimStats;

/// Simulated two-tier device with an operation queue.
#[derive(Debug, Default)]
pub struct GpuSimulator {
    config: SimConfig,
    queue: Vec<Op>,
    stats: SimStats,
}

impl GpuSimulator {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            queue: Vec::new(),
            stats: SimStats::default(),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn stats(&self) -> &SimStats {
        &self.stats
    }

    /// Number of operations waiting for the next `run`.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// The pending operations, in submission order.
    pub fn queued(&self) -> &[Op] {
        &self.queue
    }

    /// Drop every pending operation without executing it. Returns how many
    /// were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        dropped
    }

    fn push(&mut self, op: Op) {
        tracing::trace!(op = %op, "queue");
        self.queue.push(op);
    }

    // =========================================================================
    // Primitives
    // =========================================================================

    pub fn move_to_sram(&mut self, t: TensorId) {
        self.push(Op::MoveToSram(t));
    }

    pub fn move_to_hbm(&mut self, t: TensorId) {
        self.push(Op::MoveToHbm(t));
    }

    pub fn copy(&mut self, src: TensorId, dst: TensorId, residency: Residency) {
        self.push(Op::Copy { src, dst, residency });
    }

    pub fn transpose(&mut self, target: TensorId, residency: Residency) {
        self.push(Op::Transpose { target, residency });
    }

    pub fn concat(&mut self, a: TensorId, b: TensorId, out: TensorId, axis: Axis, residency: Residency) {
        self.push(Op::Concat { a, b, out, axis, residency });
    }

    pub fn matmul(&mut self, a: TensorId, b: TensorId, out: TensorId) {
        self.push(Op::MatMul { a, b, out });
    }

    pub fn get_row(&mut self, src: TensorId, row: usize, out: TensorId, residency: Residency) {
        self.push(Op::GetRow { src, row, out, residency });
    }

    pub fn exp(&mut self, src: TensorId, out: TensorId) {
        self.push(Op::Exp { src, out });
    }

    pub fn sum(&mut self, src: TensorId, out: TensorId) {
        self.push(Op::Sum { src, out });
    }

    pub fn div(&mut self, num: TensorId, den: TensorId, out: TensorId) {
        self.push(Op::Div { num, den, out });
    }

    pub fn release(&mut self, t: TensorId) {
        self.push(Op::Release(t));
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Execute every queued operation in order, then clear the queue.
    ///
    /// `debug` additionally logs each operation's output values; it never
    /// changes results. On failure the queue is still cleared and the error
    /// is a [`SimError::Execution`] naming the failing operation.
    pub fn run(&mut self, debug: bool, alloc: &mut Allocator) -> Result<()> {
        let queue = std::mem::take(&mut self.queue);
        let log_values = debug || self.config.trace_values;
        tracing::debug!(ops = queue.len(), "run batch");

        for (index, op) in queue.iter().enumerate() {
            if let Err(source) = self.execute(op, alloc) {
                tracing::debug!(index, op = %op, error = %source, "batch aborted");
                return Err(SimError::Execution {
                    index,
                    op: op.name(),
                    source: Box::new(source),
                });
            }
            self.stats.record(op);
            tracing::trace!(index, op = %op, "executed");

            if log_values {
                if let Some(out) = op.output() {
                    if let (Ok(name), Ok(value)) = (alloc.name(out), alloc.get(out)) {
                        tracing::debug!(index, op = op.name(), name, value = ?value, "output");
                    }
                }
            }
        }

        self.stats.batches += 1;
        Ok(())
    }

    fn execute(&mut self, op: &Op, alloc: &mut Allocator) -> Result<()> {
        const SRAM: Residency = Residency::Sram;

        match *op {
            Op::MoveToSram(t) => self.move_tier(alloc, t, Residency::Sram),
            Op::MoveToHbm(t) => self.move_tier(alloc, t, Residency::Hbm),
            Op::Copy { src, dst, residency } => {
                let value = require(alloc, src, residency)?.clone();
                let existing = alloc.get(dst)?;
                if !existing.is_unassigned() && existing.shape() != value.shape() {
                    return Err(SimError::shape_mismatch("copy", value.shape(), existing.shape()));
                }
                self.write(alloc, dst, value, residency)
            }
            Op::Transpose { target, residency } => {
                require_compute_tier(alloc, target, residency)?;
                let value = kernels::transpose(require(alloc, target, SRAM)?);
                self.write(alloc, target, value, SRAM)
            }
            Op::Concat { a, b, out, axis, residency } => {
                require_compute_tier(alloc, out, residency)?;
                let value = kernels::concat(require(alloc, a, SRAM)?, require(alloc, b, SRAM)?, axis)?;
                self.write(alloc, out, value, SRAM)
            }
            Op::MatMul { a, b, out } => {
                let value = kernels::matmul(require(alloc, a, SRAM)?, require(alloc, b, SRAM)?)?;
                self.write(alloc, out, value, SRAM)
            }
            Op::GetRow { src, row, out, residency } => {
                require_compute_tier(alloc, out, residency)?;
                let value = kernels::get_row(require(alloc, src, SRAM)?, row)?;
                self.write(alloc, out, value, SRAM)
            }
            Op::Exp { src, out } => {
                let value = kernels::exp(require(alloc, src, SRAM)?);
                self.write(alloc, out, value, SRAM)
            }
            Op::Sum { src, out } => {
                let value = kernels::sum(require(alloc, src, SRAM)?);
                self.write(alloc, out, value, SRAM)
            }
            Op::Div { num, den, out } => {
                let value = kernels::div(require(alloc, num, SRAM)?, require(alloc, den, SRAM)?)?;
                self.write(alloc, out, value, SRAM)
            }
            Op::Release(t) => alloc.release(t),
        }
    }

    fn move_tier(&mut self, alloc: &mut Allocator, t: TensorId, tier: Residency) -> Result<()> {
        let current = alloc.get(t)?;
        if current.residency() == tier {
            return Ok(());
        }
        let bytes = current.nbytes();
        self.check_budget(tier, alloc.projected_bytes(t, tier, bytes)?)?;
        alloc.move_to(t, tier)?;
        match tier {
            Residency::Sram => self.stats.bytes_to_sram += bytes,
            Residency::Hbm => self.stats.bytes_to_hbm += bytes,
        }
        Ok(())
    }

    /// Store `value` into `out` in `tier`. Only an unassigned output may take
    /// its tier from the write; a written one must already live there.
    fn write(&self, alloc: &mut Allocator, out: TensorId, value: Matrix, tier: Residency) -> Result<()> {
        let current = alloc.get(out)?;
        if !current.is_unassigned() && current.residency() != tier {
            return Err(SimError::ResidencyViolation {
                name: alloc.name(out)?.to_string(),
                expected: tier,
                found: current.residency(),
            });
        }
        let value = value.with_residency(tier);
        self.check_budget(tier, alloc.projected_bytes(out, tier, value.nbytes())?)?;
        alloc.store(out, value)
    }

    fn check_budget(&self, tier: Residency, requested: usize) -> Result<()> {
        match self.config.budget(tier) {
            Some(budget) if requested > budget => Err(SimError::ResourceExhausted {
                tier,
                requested,
                budget,
            }),
            _ => Ok(()),
        }
    }
}

/// Borrow `id`, failing unless it is resident in `tier`.
fn require(alloc: &Allocator, id: TensorId, tier: Residency) -> Result<&Matrix> {
    let m = alloc.get(id)?;
    if m.residency() != tier {
        return Err(SimError::ResidencyViolation {
            name: alloc.name(id)?.to_string(),
            expected: tier,
            found: m.residency(),
        });
    }
    Ok(m)
}

/// Compute primitives only run in SRAM, whatever tier the caller asked for.
fn require_compute_tier(alloc: &Allocator, out: TensorId, requested: Residency) -> Result<()> {
    if requested.is_sram() {
        return Ok(());
    }
    Err(SimError::ResidencyViolation {
        name: alloc.name(out)?.to_string(),
        expected: Residency::Sram,
        found: requested,
    })
}
