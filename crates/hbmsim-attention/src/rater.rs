//! Query source and answer scorer.
//!
//! The [`QueryRater`] trait is everything the streaming driver needs from the
//! outside world: one query per round, a place to commit each answer, and a
//! final report. [`Rater`] is the in-process implementation used by the CLI,
//! the benches and the tests. It owns every input it loads into the
//! allocator as well as every answer committed to it.

use hbmsim_core::{Allocator, Matrix, Residency, Result, SimError, TensorId};
use hbmsim_device::GpuSimulator;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::reference;

/// Interface between the attention driver and its query source / collector.
pub trait QueryRater {
    /// Next query block (1+ rows, `d` columns), HBM-resident. `None` once
    /// every query has been handed out.
    fn next_query(&mut self) -> Option<TensorId>;

    /// Take ownership of an HBM-resident answer for the most recent query.
    fn commit_answer(&mut self, answer: TensorId, alloc: &Allocator) -> Result<()>;

    /// Print a human-readable summary of all committed answers.
    fn print_result(&self, sim: &GpuSimulator, alloc: &Allocator);
}

/// Parameters for a randomly generated workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaterConfig {
    /// Number of rounds (key/value pairs and queries).
    pub rounds: usize,
    /// Feature width `d` of keys, values and queries.
    pub dim: usize,
    /// Seed for the input generator.
    pub seed: u64,
    /// Max absolute error for an answer to pass.
    pub tolerance: f32,
}

impl Default for RaterConfig {
    fn default() -> Self {
        Self {
            rounds: 8,
            dim: 16,
            seed: 0,
            tolerance: 1e-4,
        }
    }
}

/// Score of one committed answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundScore {
    pub round: usize,
    pub rows: usize,
    pub max_abs_error: f32,
    pub passed: bool,
}

/// Summary of a whole run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RaterReport {
    pub rounds: usize,
    pub committed: usize,
    pub passed: usize,
    pub tolerance: f32,
    pub max_abs_error: f32,
    pub per_round: Vec<RoundScore>,
}

impl RaterReport {
    /// Every round committed and within tolerance.
    pub fn all_passed(&self) -> bool {
        self.committed == self.rounds && self.passed == self.rounds
    }
}

struct Committed {
    handle: TensorId,
    score: RoundScore,
}

/// In-process query source that scores answers against [`reference::attention`].
pub struct Rater {
    keys: Vec<TensorId>,
    values: Vec<TensorId>,
    queries: Vec<TensorId>,
    expected: Vec<Matrix>,
    handed_out: usize,
    committed: Vec<Committed>,
    tolerance: f32,
}

impl Rater {
    /// Load explicit inputs into `alloc` (all in HBM).
    ///
    /// Round `i` attends query `i` over keys/values `0..=i`.
    pub fn new(
        alloc: &mut Allocator,
        keys: Vec<Matrix>,
        values: Vec<Matrix>,
        queries: Vec<Matrix>,
        tolerance: f32,
    ) -> Result<Self> {
        if keys.len() != values.len() || keys.len() != queries.len() {
            return Err(SimError::shape_mismatch(
                "rater inputs",
                (keys.len(), values.len()),
                (queries.len(), keys.len()),
            ));
        }

        let mut expected = Vec::with_capacity(queries.len());
        for (i, q) in queries.iter().enumerate() {
            let k = reference::stack_rows(&keys[..=i])?;
            let v = reference::stack_rows(&values[..=i])?;
            expected.push(reference::attention(q, &k, &v)?);
        }

        let load = |alloc: &mut Allocator, prefix: &str, ms: Vec<Matrix>| -> Result<Vec<TensorId>> {
            ms.into_iter()
                .enumerate()
                .map(|(i, m)| alloc.insert(format!("{prefix}_{i}"), m.with_residency(Residency::Hbm)))
                .collect()
        };
        let keys = load(alloc, "key", keys)?;
        let values = load(alloc, "value", values)?;
        let queries = load(alloc, "query", queries)?;

        tracing::debug!(rounds = keys.len(), "rater loaded inputs");
        Ok(Self {
            keys,
            values,
            queries,
            expected,
            handed_out: 0,
            committed: Vec::new(),
            tolerance,
        })
    }

    /// Random workload: 1xd keys and values, round `i` queries with `i + 1` rows.
    pub fn random(alloc: &mut Allocator, config: &RaterConfig) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let d = config.dim;
        let mut sample = |rows: usize| -> Matrix {
            let data: Vec<f32> = (0..rows * d).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
            Matrix::from_f32(&data, rows, d)
        };

        let keys = (0..config.rounds).map(|_| sample(1)).collect();
        let values = (0..config.rounds).map(|_| sample(1)).collect();
        let queries = (0..config.rounds).map(|i| sample(i + 1)).collect();
        Self::new(alloc, keys, values, queries, config.tolerance)
    }

    pub fn keys(&self) -> &[TensorId] {
        &self.keys
    }

    pub fn values(&self) -> &[TensorId] {
        &self.values
    }

    pub fn rounds(&self) -> usize {
        self.queries.len()
    }

    /// Handles of committed answers, in round order.
    pub fn answers(&self) -> Vec<TensorId> {
        self.committed.iter().map(|c| c.handle).collect()
    }

    /// Reference answer for `round`.
    pub fn expected(&self, round: usize) -> Option<&Matrix> {
        self.expected.get(round)
    }

    /// Every handle this rater is responsible for releasing.
    pub fn owned_handles(&self) -> Vec<TensorId> {
        self.keys
            .iter()
            .chain(&self.values)
            .chain(&self.queries)
            .copied()
            .chain(self.committed.iter().map(|c| c.handle))
            .collect()
    }

    pub fn report(&self) -> RaterReport {
        let per_round: Vec<RoundScore> = self.committed.iter().map(|c| c.score.clone()).collect();
        RaterReport {
            rounds: self.rounds(),
            committed: per_round.len(),
            passed: per_round.iter().filter(|s| s.passed).count(),
            tolerance: self.tolerance,
            max_abs_error: per_round.iter().map(|s| s.max_abs_error).fold(0.0, f32::max),
            per_round,
        }
    }

    /// Release every input and committed answer.
    pub fn release_all(&mut self, alloc: &mut Allocator) -> Result<()> {
        for id in self.owned_handles() {
            alloc.release(id)?;
        }
        self.keys.clear();
        self.values.clear();
        self.queries.clear();
        self.committed.clear();
        Ok(())
    }
}

impl QueryRater for Rater {
    fn next_query(&mut self) -> Option<TensorId> {
        let q = self.queries.get(self.handed_out).copied()?;
        self.handed_out += 1;
        Some(q)
    }

    fn commit_answer(&mut self, answer: TensorId, alloc: &Allocator) -> Result<()> {
        let round = self.committed.len();
        if round >= self.handed_out {
            return Err(SimError::IndexOutOfRange {
                index: round,
                len: self.handed_out,
            });
        }

        let got = alloc.get(answer)?;
        if !got.residency().is_hbm() {
            return Err(SimError::ResidencyViolation {
                name: alloc.name(answer)?.to_string(),
                expected: Residency::Hbm,
                found: got.residency(),
            });
        }
        let want = &self.expected[round];
        if got.shape() != want.shape() {
            return Err(SimError::shape_mismatch("commit_answer", got.shape(), want.shape()));
        }

        let max_abs_error = got
            .as_slice()
            .iter()
            .zip(want.as_slice())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        let passed = max_abs_error <= self.tolerance;
        tracing::debug!(round, max_abs_error, passed, "answer committed");

        self.committed.push(Committed {
            handle: answer,
            score: RoundScore {
                round,
                rows: got.rows(),
                max_abs_error,
                passed,
            },
        });
        Ok(())
    }

    fn print_result(&self, sim: &GpuSimulator, alloc: &Allocator) {
        let report = self.report();
        let stats = sim.stats();

        println!("{:<8} {:>6} {:>14} {:>8}", "Round", "Rows", "Max |err|", "Status");
        println!("{}", "-".repeat(40));
        for s in &report.per_round {
            let status = if s.passed { "ok" } else { "FAIL" };
            println!("{:<8} {:>6} {:>14.3e} {:>8}", s.round, s.rows, s.max_abs_error, status);
        }
        println!();
        println!(
            "Committed {}/{} rounds, {} passed (tolerance {:.1e})",
            report.committed, report.rounds, report.passed, report.tolerance
        );
        println!(
            "Ops: {} in {} batches ({} matmul, {} concat, {} release)",
            stats.total_ops(),
            stats.batches,
            stats.matmuls,
            stats.concats,
            stats.releases
        );
        println!(
            "Transfers: {} B hbm->sram, {} B sram->hbm",
            stats.bytes_to_sram, stats.bytes_to_hbm
        );
        println!(
            "Peak resident: {} B sram, {} B hbm",
            alloc.peak_bytes(Residency::Sram),
            alloc.peak_bytes(Residency::Hbm)
        );

        tracing::info!(
            committed = report.committed,
            passed = report.passed,
            max_abs_error = report.max_abs_error,
            "rater summary"
        );
    }
}
