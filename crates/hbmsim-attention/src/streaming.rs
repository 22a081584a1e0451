//! Streaming attention over a growing key/value history.
//!
//! Round `i` attends query `i` over keys/values `0..=i`. Instead of
//! rebuilding the stacked matrices every round, the driver keeps two
//! SRAM-resident accumulators and grows each by one key/value per round:
//!
//! - `K^T` accumulator: `[d, i + 1]`, grown by concatenating columns
//! - `V` accumulator:   `[i + 1, d]`, grown by concatenating rows
//!
//! Growth is replace-and-release: the grown matrix is a new allocation and
//! the previous one is released in the same batch, so there is only ever one
//! live version of each accumulator.
//!
//! Softmax is computed one query row at a time and every per-row temporary
//! is released before the next row starts, so SRAM never holds a full
//! `[rows, i + 1]` score matrix. The softmax does not subtract the row max
//! before exponentiating; large scores overflow to `inf`.

use std::collections::HashSet;

use hbmsim_core::{Allocator, Residency, Result, SimError, TensorId};
use hbmsim_device::{Axis, GpuSimulator};

use crate::rater::QueryRater;

const SRAM: Residency = Residency::Sram;

/// Temporaries queued for one query row.
struct RowTemps {
    q_row: TensorId,
    scores: TensorId,
    exp: TensorId,
    sum: TensorId,
    softmax: TensorId,
    answer: TensorId,
}

impl RowTemps {
    fn release(self, sim: &mut GpuSimulator) {
        for t in [self.q_row, self.scores, self.exp, self.sum, self.softmax, self.answer] {
            sim.release(t);
        }
    }
}

/// Handles a queued round produces once its batch runs.
struct RoundPlan {
    k_t: TensorId,
    v: TensorId,
    answer: TensorId,
}

/// Streaming attention driver state.
#[derive(Debug, Default)]
pub struct StreamingAttention {
    k_t_acc: Option<TensorId>,
    v_stack_acc: Option<TensorId>,
    rounds: usize,
}

impl StreamingAttention {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rounds committed so far.
    pub fn rounds_done(&self) -> usize {
        self.rounds
    }

    /// Current `K^T` accumulator.
    pub fn key_accumulator(&self) -> Option<TensorId> {
        self.k_t_acc
    }

    /// Current `V` accumulator.
    pub fn value_accumulator(&self) -> Option<TensorId> {
        self.v_stack_acc
    }

    /// Run one round: pull a query, grow the accumulators with `key` and
    /// `value`, compute the answer, execute the batch and commit it.
    ///
    /// Returns the committed answer handle, now owned by `rater`.
    ///
    /// If the batch fails, every handle the round allocated is released and
    /// the inputs are written back to HBM. The driver keeps whichever
    /// accumulator is still live: once the batch has released the previous
    /// version, the grown one (already holding `key`/`value`) takes its place.
    pub fn step<R: QueryRater>(
        &mut self,
        key: TensorId,
        value: TensorId,
        rater: &mut R,
        sim: &mut GpuSimulator,
        alloc: &mut Allocator,
    ) -> Result<TensorId> {
        let round = self.rounds;
        let span = tracing::debug_span!("round", round);
        let _enter = span.enter();

        let q = rater.next_query().ok_or(SimError::SourceExhausted { round })?;
        let (rows, cols) = alloc.get(q)?.shape();
        if rows == 0 {
            return Err(SimError::shape_mismatch("query", (rows, cols), (1, cols)));
        }

        let before: HashSet<TensorId> = alloc.live().into_iter().map(|(id, _)| id).collect();
        let inputs = [q, key, value];

        let plan = match self.queue_round(q, rows, key, value, sim, alloc) {
            Ok(plan) => plan,
            Err(err) => {
                self.abandon(&before, None, inputs, sim, alloc)?;
                return Err(err);
            }
        };
        if let Err(err) = sim.run(false, alloc) {
            tracing::debug!(error = %err, "round failed");
            self.abandon(&before, Some(&plan), inputs, sim, alloc)?;
            return Err(err);
        }

        self.k_t_acc = Some(plan.k_t);
        self.v_stack_acc = Some(plan.v);
        if let Err(err) = rater.commit_answer(plan.answer, alloc) {
            alloc.release(plan.answer)?;
            return Err(err);
        }
        self.rounds += 1;
        tracing::debug!(rows, "round committed");
        Ok(plan.answer)
    }

    /// Release the accumulators. Call once after the last round.
    pub fn finish(&mut self, sim: &mut GpuSimulator, alloc: &mut Allocator) -> Result<()> {
        for acc in [self.k_t_acc.take(), self.v_stack_acc.take()].into_iter().flatten() {
            sim.release(acc);
        }
        sim.run(false, alloc)
    }

    /// Queue a whole round: accumulator growth, every query row, and the
    /// write-back of the query and the answer.
    fn queue_round(
        &self,
        q: TensorId,
        rows: usize,
        key: TensorId,
        value: TensorId,
        sim: &mut GpuSimulator,
        alloc: &mut Allocator,
    ) -> Result<RoundPlan> {
        sim.move_to_sram(q);
        let (k_t, v) = self.grow(key, value, sim, alloc)?;

        let mut answer: Option<TensorId> = None;
        for r in 0..rows {
            let temps = Self::queue_row(q, r, k_t, v, sim, alloc)?;
            answer = Some(match answer {
                None => {
                    let seed = alloc.allocate("answer_init")?;
                    sim.copy(temps.answer, seed, SRAM);
                    seed
                }
                Some(prev) => {
                    let next = alloc.allocate("answer_next")?;
                    sim.concat(prev, temps.answer, next, Axis::Rows, SRAM);
                    sim.release(prev);
                    next
                }
            });
            temps.release(sim);
        }
        let answer = answer.ok_or(SimError::IndexOutOfRange { index: 0, len: rows })?;

        sim.move_to_hbm(q);
        sim.move_to_hbm(answer);
        Ok(RoundPlan { k_t, v, answer })
    }

    /// Clean up after a round whose batch never completed.
    fn abandon(
        &mut self,
        before: &HashSet<TensorId>,
        plan: Option<&RoundPlan>,
        inputs: [TensorId; 3],
        sim: &mut GpuSimulator,
        alloc: &mut Allocator,
    ) -> Result<()> {
        sim.clear();

        // A previous accumulator is only released after its grown version is complete.
        if let Some(plan) = plan {
            for (acc, grown) in [(&mut self.k_t_acc, plan.k_t), (&mut self.v_stack_acc, plan.v)] {
                if acc.is_some_and(|old| !alloc.is_live(old)) {
                    *acc = Some(grown);
                }
            }
        }

        let keep = [self.k_t_acc, self.v_stack_acc];
        for (id, _) in alloc.live() {
            if !before.contains(&id) && !keep.contains(&Some(id)) {
                alloc.release(id)?;
            }
        }
        for id in inputs {
            if alloc.is_live(id) {
                alloc.move_to(id, Residency::Hbm)?;
            }
        }
        Ok(())
    }

    /// Queue the accumulator growth for one key/value pair and return the
    /// handles the accumulators will hold once the batch runs.
    fn grow(
        &self,
        key: TensorId,
        value: TensorId,
        sim: &mut GpuSimulator,
        alloc: &mut Allocator,
    ) -> Result<(TensorId, TensorId)> {
        let first = self.k_t_acc.is_none();

        sim.move_to_sram(key);
        let k_copy = alloc.allocate(if first { "k_copy_init" } else { "k_copy" })?;
        sim.copy(key, k_copy, SRAM);
        sim.transpose(k_copy, SRAM);
        sim.move_to_hbm(key);

        let k_t = match self.k_t_acc {
            None => k_copy,
            Some(prev) => {
                let next = alloc.allocate("k_t_next")?;
                sim.concat(prev, k_copy, next, Axis::Cols, SRAM);
                sim.release(prev);
                sim.release(k_copy);
                next
            }
        };

        sim.move_to_sram(value);
        let v_copy = alloc.allocate(if first { "v_copy_init" } else { "v_copy" })?;
        sim.copy(value, v_copy, SRAM);
        sim.move_to_hbm(value);

        let v = match self.v_stack_acc {
            None => v_copy,
            Some(prev) => {
                let next = alloc.allocate("v_next")?;
                sim.concat(prev, v_copy, next, Axis::Rows, SRAM);
                sim.release(prev);
                sim.release(v_copy);
                next
            }
        };

        Ok((k_t, v))
    }

    /// Queue `softmax(q[r] @ K^T) @ V` for one row. Nothing is released.
    fn queue_row(
        q: TensorId,
        r: usize,
        k_t: TensorId,
        v: TensorId,
        sim: &mut GpuSimulator,
        alloc: &mut Allocator,
    ) -> Result<RowTemps> {
        let q_row = alloc.allocate("q_row")?;
        sim.get_row(q, r, q_row, SRAM);

        let scores = alloc.allocate("scores_row")?;
        sim.matmul(q_row, k_t, scores);

        let exp = alloc.allocate("row_exp")?;
        sim.exp(scores, exp);

        let sum = alloc.allocate("row_sum")?;
        sim.sum(exp, sum);

        let softmax = alloc.allocate("row_soft")?;
        sim.div(exp, sum, softmax);

        let answer = alloc.allocate("row_ans")?;
        sim.matmul(softmax, v, answer);

        Ok(RowTemps {
            q_row,
            scores,
            exp,
            sum,
            softmax,
            answer,
        })
    }
}

/// Run every round for `keys`/`values`, committing each answer to `rater`,
/// then release the accumulators.
pub fn calculate<R: QueryRater>(
    keys: &[TensorId],
    values: &[TensorId],
    rater: &mut R,
    sim: &mut GpuSimulator,
    alloc: &mut Allocator,
) -> Result<()> {
    if keys.len() != values.len() {
        return Err(SimError::shape_mismatch(
            "calculate",
            (keys.len(), 1),
            (values.len(), 1),
        ));
    }

    let mut driver = StreamingAttention::new();
    for (&key, &value) in keys.iter().zip(values) {
        driver.step(key, value, rater, sim, alloc)?;
    }
    driver.finish(sim, alloc)?;
    tracing::info!(rounds = driver.rounds_done(), "streaming attention complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rater::{Rater, RaterConfig};
    use hbmsim_core::Matrix;

    fn setup(rounds: usize, dim: usize) -> (Allocator, GpuSimulator, Rater) {
        let mut alloc = Allocator::new();
        let cfg = RaterConfig {
            rounds,
            dim,
            seed: 7,
            ..Default::default()
        };
        let rater = Rater::random(&mut alloc, &cfg).unwrap();
        (alloc, GpuSimulator::default(), rater)
    }

    #[test]
    fn test_accumulator_shapes_grow_per_round() {
        let (mut alloc, mut sim, mut rater) = setup(5, 3);
        let keys = rater.keys().to_vec();
        let values = rater.values().to_vec();
        let mut driver = StreamingAttention::new();

        for i in 0..5 {
            driver.step(keys[i], values[i], &mut rater, &mut sim, &mut alloc).unwrap();
            let k_t = alloc.get(driver.key_accumulator().unwrap()).unwrap();
            let v = alloc.get(driver.value_accumulator().unwrap()).unwrap();
            assert_eq!(k_t.shape(), (3, i + 1), "round {i}");
            assert_eq!(v.shape(), (i + 1, 3), "round {i}");
            assert_eq!(k_t.residency(), Residency::Sram);
        }
        assert_eq!(driver.rounds_done(), 5);
        driver.finish(&mut sim, &mut alloc).unwrap();
        assert!(driver.key_accumulator().is_none());
    }

    #[test]
    fn test_old_accumulators_released() {
        let (mut alloc, mut sim, mut rater) = setup(3, 2);
        let keys = rater.keys().to_vec();
        let values = rater.values().to_vec();
        let mut driver = StreamingAttention::new();

        driver.step(keys[0], values[0], &mut rater, &mut sim, &mut alloc).unwrap();
        let k0 = driver.key_accumulator().unwrap();
        let v0 = driver.value_accumulator().unwrap();
        driver.step(keys[1], values[1], &mut rater, &mut sim, &mut alloc).unwrap();
        assert!(!alloc.is_live(k0));
        assert!(!alloc.is_live(v0));
        assert!(alloc.is_live(driver.key_accumulator().unwrap()));
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let (mut alloc, mut sim, mut rater) = setup(4, 4);
        let keys = rater.keys().to_vec();
        let values = rater.values().to_vec();
        let mut driver = StreamingAttention::new();
        for i in 0..3 {
            driver.step(keys[i], values[i], &mut rater, &mut sim, &mut alloc).unwrap();
        }

        // Inspect the softmax of every row of the last query against the
        // accumulators left by the third round.
        let q = alloc
            .insert("extra_query", Matrix::from_f32(&[0.5, -1.0, 2.0, 0.25, 3.0, 1.0, -2.0, 0.0], 2, 4))
            .unwrap();
        sim.move_to_sram(q);
        let k_t = driver.key_accumulator().unwrap();
        let v = driver.value_accumulator().unwrap();
        let temps: Vec<RowTemps> = (0..2)
            .map(|r| StreamingAttention::queue_row(q, r, k_t, v, &mut sim, &mut alloc).unwrap())
            .collect();
        sim.run(false, &mut alloc).unwrap();

        for t in &temps {
            let p = alloc.get(t.softmax).unwrap();
            assert_eq!(p.shape(), (1, 3));
            let total: f32 = p.as_slice().iter().sum();
            assert!((total - 1.0).abs() < 1e-5, "sum = {total}");
            assert_eq!(alloc.get(t.answer).unwrap().shape(), (1, 4));
        }
        for t in temps {
            t.release(&mut sim);
        }
        sim.run(false, &mut alloc).unwrap();
    }

    #[test]
    fn test_multi_row_queries_match_reference() {
        let (mut alloc, mut sim, mut rater) = setup(6, 5);
        let keys = rater.keys().to_vec();
        let values = rater.values().to_vec();
        calculate(&keys, &values, &mut rater, &mut sim, &mut alloc).unwrap();

        let report = rater.report();
        assert_eq!(report.committed, 6);
        assert!(report.all_passed(), "{report:?}");
        for (i, id) in rater.answers().into_iter().enumerate() {
            let m = alloc.get(id).unwrap();
            assert_eq!(m.shape(), (i + 1, 5));
            assert_eq!(m.residency(), Residency::Hbm);
        }
    }

    #[test]
    fn test_source_exhausted() {
        let (mut alloc, mut sim, mut rater) = setup(1, 2);
        let keys = rater.keys().to_vec();
        let values = rater.values().to_vec();
        let mut driver = StreamingAttention::new();
        driver.step(keys[0], values[0], &mut rater, &mut sim, &mut alloc).unwrap();
        let err = driver
            .step(keys[0], values[0], &mut rater, &mut sim, &mut alloc)
            .unwrap_err();
        assert_eq!(err.kind(), hbmsim_core::ErrorKind::SourceExhausted);
    }

    #[test]
    fn test_calculate_length_mismatch() {
        let (mut alloc, mut sim, mut rater) = setup(2, 2);
        let keys = rater.keys().to_vec();
        let err = calculate(&keys, &keys[..1], &mut rater, &mut sim, &mut alloc).unwrap_err();
        assert_eq!(err.kind(), hbmsim_core::ErrorKind::ShapeMismatch);
    }

    /// Hands out fixed queries and accepts any answer.
    struct FixedQueries {
        queries: Vec<TensorId>,
        next: usize,
        answers: Vec<TensorId>,
    }

    impl QueryRater for FixedQueries {
        fn next_query(&mut self) -> Option<TensorId> {
            let q = self.queries.get(self.next).copied()?;
            self.next += 1;
            Some(q)
        }

        fn commit_answer(&mut self, answer: TensorId, _alloc: &Allocator) -> Result<()> {
            self.answers.push(answer);
            Ok(())
        }

        fn print_result(&self, _sim: &GpuSimulator, _alloc: &Allocator) {}
    }

    fn load_row(alloc: &mut Allocator, name: &str, data: &[f32]) -> TensorId {
        alloc.insert(name, Matrix::from_f32(data, 1, data.len())).unwrap()
    }

    #[test]
    fn test_failed_row_keeps_grown_accumulators() {
        let mut alloc = Allocator::new();
        let mut sim = GpuSimulator::default();
        let keys = [load_row(&mut alloc, "k0", &[1.0, 0.0]), load_row(&mut alloc, "k1", &[0.0, 1.0])];
        let values = [load_row(&mut alloc, "v0", &[1.0, 0.0]), load_row(&mut alloc, "v1", &[0.0, 1.0])];
        let good = load_row(&mut alloc, "q0", &[1.0, 0.0]);
        // Three columns against two-wide keys: fails at the first row's matmul.
        let bad = load_row(&mut alloc, "q1", &[1.0, 0.0, 0.0]);
        let mut rater = FixedQueries {
            queries: vec![good, bad],
            next: 0,
            answers: Vec::new(),
        };

        let mut driver = StreamingAttention::new();
        driver.step(keys[0], values[0], &mut rater, &mut sim, &mut alloc).unwrap();
        let k0 = driver.key_accumulator().unwrap();
        let v0 = driver.value_accumulator().unwrap();

        let err = driver
            .step(keys[1], values[1], &mut rater, &mut sim, &mut alloc)
            .unwrap_err();
        assert_eq!(err.kind(), hbmsim_core::ErrorKind::ShapeMismatch);
        assert_eq!(sim.pending(), 0);
        assert_eq!(driver.rounds_done(), 1);

        // Growth ran before the failing row, so the grown versions replace
        // the released round-0 accumulators.
        assert!(!alloc.is_live(k0));
        assert!(!alloc.is_live(v0));
        let k_t = alloc.get(driver.key_accumulator().unwrap()).unwrap();
        assert_eq!(k_t.shape(), (2, 2));
        assert_eq!(k_t.residency(), Residency::Sram);
        let v = alloc.get(driver.value_accumulator().unwrap()).unwrap();
        assert_eq!(v.shape(), (2, 2));
        assert_eq!(alloc.get(bad).unwrap().residency(), Residency::Hbm);

        driver.finish(&mut sim, &mut alloc).unwrap();
        let mut owned = vec![good, bad];
        owned.extend(keys);
        owned.extend(values);
        owned.extend(rater.answers.iter().copied());
        alloc.leak_check(&owned).unwrap();
        assert_eq!(alloc.resident_bytes(Residency::Sram), 0);
    }
}
