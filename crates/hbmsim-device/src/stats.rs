//! Execution counters collected across batch runs.

use serde::Serialize;

use crate::op::Op;

/// Counters for everything the simulator has executed.
///
/// Only successfully applied operations are counted. Transfer byte counts
/// include only moves that actually changed a matrix's tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SimStats {
    pub batches: usize,
    pub moves_to_sram: usize,
    pub moves_to_hbm: usize,
    pub copies: usize,
    pub transposes: usize,
    pub concats: usize,
    pub matmuls: usize,
    pub row_extracts: usize,
    pub exps: usize,
    pub sums: usize,
    pub divs: usize,
    pub releases: usize,
    pub bytes_to_sram: usize,
    pub bytes_to_hbm: usize,
}

impl SimStats {
    pub(crate) fn record(&mut self, op: &Op) {
        let counter = match op {
            Op::MoveToSram(_) => &mut self.moves_to_sram,
            Op::MoveToHbm(_) => &mut self.moves_to_hbm,
            Op::Copy { .. } => &mut self.copies,
            Op::Transpose { .. } => &mut self.transposes,
            Op::Concat { .. } => &mut self.concats,
            Op::MatMul { .. } => &mut self.matmuls,
            Op::GetRow { .. } => &mut self.row_extracts,
            Op::Exp { .. } => &mut self.exps,
            Op::Sum { .. } => &mut self.sums,
            Op::Div { .. } => &mut self.divs,
            Op::Release(_) => &mut self.releases,
        };
        *counter += 1;
    }

    /// Operations applied over all batches.
    pub fn total_ops(&self) -> usize {
        self.moves_to_sram
            + self.moves_to_hbm
            + self.copies
            + self.transposes
            + self.concats
            + self.matmuls
            + self.row_extracts
            + self.exps
            + self.sums
            + self.divs
            + self.releases
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hbmsim_core::Allocator;

    #[test]
    fn test_record_and_total() {
        let mut alloc = Allocator::new();
        let a = alloc.allocate("a").unwrap();
        let b = alloc.allocate("b").unwrap();

        let mut stats = SimStats::default();
        stats.record(&Op::MoveToSram(a));
        stats.record(&Op::Exp { src: a, out: b });
        stats.record(&Op::Exp { src: a, out: b });
        stats.record(&Op::Release(b));

        assert_eq!(stats.moves_to_sram, 1);
        assert_eq!(stats.exps, 2);
        assert_eq!(stats.releases, 1);
        assert_eq!(stats.total_ops(), 4);
    }
}
