//! Generation-checked allocator for simulated device matrices.
//!
//! Every matrix lives in a slot table owned by the [`Allocator`]. Callers only
//! ever hold [`TensorId`] handles: a slot index stamped with the generation it
//! was issued under. Releasing a slot bumps its generation, so any handle kept
//! past its release stops matching and is reported as
//! [`SimError::UseAfterRelease`] (or [`SimError::DoubleRelease`]) instead of
//! silently aliasing whatever reuses the slot.
//!
//! The allocator also keeps per-tier byte accounting so the simulator can
//! enforce SRAM/HBM budgets and report peak usage.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SimError;
use crate::matrix::Matrix;
use crate::residency::Residency;
use crate::Result;

/// Handle to an allocator-owned matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TensorId {
    index: u32,
    generation: u32,
}

impl TensorId {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

struct Entry {
    name: String,
    matrix: Matrix,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Slot-table allocator with release tracking and per-tier accounting.
pub struct Allocator {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Bytes currently resident, indexed by [`tier_index`].
    resident: [usize; 2],
    /// High-water mark of `resident`.
    peak: [usize; 2],
    total_allocations: usize,
    /// Most slots the table may hold. Handles index slots with a `u32`.
    slot_limit: usize,
}

fn tier_index(tier: Residency) -> usize {
    match tier {
        Residency::Hbm => 0,
        Residency::Sram => 1,
    }
}

impl Allocator {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            resident: [0; 2],
            peak: [0; 2],
            total_allocations: 0,
            slot_limit: u32::MAX as usize,
        }
    }

    #[cfg(test)]
    fn with_slot_limit(slot_limit: usize) -> Self {
        Self {
            slot_limit,
            ..Self::new()
        }
    }

    /// Allocate an unassigned matrix named `name` and mark it live.
    ///
    /// Fails with [`SimError::SlotsExhausted`] once every slot index is taken.
    pub fn allocate(&mut self, name: impl Into<String>) -> Result<TensorId> {
        let name = name.into();
        let entry = Entry {
            name,
            matrix: Matrix::empty(),
        };

        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = Some(entry);
                TensorId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = u32::try_from(self.slots.len())
                    .ok()
                    .filter(|&i| (i as usize) < self.slot_limit)
                    .ok_or(SimError::SlotsExhausted {
                        limit: self.slot_limit,
                    })?;
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                TensorId {
                    index,
                    generation: 0,
                }
            }
        };
        self.total_allocations += 1;
        tracing::trace!(handle = %id, "allocate");
        Ok(id)
    }

    /// Allocate a slot already holding `matrix`. Used to load inputs.
    pub fn insert(&mut self, name: impl Into<String>, matrix: Matrix) -> Result<TensorId> {
        let id = self.allocate(name)?;
        let tier = tier_index(matrix.residency());
        self.resident[tier] += matrix.nbytes();
        self.peak[tier] = self.peak[tier].max(self.resident[tier]);
        if let Some(entry) = self.slot_entry_mut(id) {
            entry.matrix = matrix;
        }
        Ok(id)
    }

    /// Release `id`. Releasing a handle that is no longer live is a
    /// [`SimError::DoubleRelease`].
    pub fn release(&mut self, id: TensorId) -> Result<()> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.entry.is_some())
            .ok_or(SimError::DoubleRelease { handle: id })?;

        let entry = slot.entry.take().ok_or(SimError::DoubleRelease { handle: id })?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);

        let tier = tier_index(entry.matrix.residency());
        self.resident[tier] -= entry.matrix.nbytes();
        tracing::trace!(handle = %id, name = %entry.name, "release");
        Ok(())
    }

    /// Whether `id` refers to a live allocation.
    pub fn is_live(&self, id: TensorId) -> bool {
        self.entry(id).is_ok()
    }

    /// Borrow the matrix behind `id`.
    pub fn get(&self, id: TensorId) -> Result<&Matrix> {
        self.entry(id).map(|e| &e.matrix)
    }

    /// Debug name of `id`.
    pub fn name(&self, id: TensorId) -> Result<&str> {
        self.entry(id).map(|e| e.name.as_str())
    }

    /// Replace the contents of `id`, keeping byte accounting in step.
    ///
    /// Budget checks belong to the caller (see [`Allocator::projected_bytes`]).
    pub fn store(&mut self, id: TensorId, matrix: Matrix) -> Result<()> {
        let entry = self.entry_mut(id)?;
        let old_tier = tier_index(entry.matrix.residency());
        let old_bytes = entry.matrix.nbytes();
        let new_tier = tier_index(matrix.residency());
        let new_bytes = matrix.nbytes();
        entry.matrix = matrix;

        self.resident[old_tier] -= old_bytes;
        self.resident[new_tier] += new_bytes;
        self.peak[new_tier] = self.peak[new_tier].max(self.resident[new_tier]);
        Ok(())
    }

    /// Move `id` to `tier`. Returns `false` when it already lived there.
    pub fn move_to(&mut self, id: TensorId, tier: Residency) -> Result<bool> {
        let entry = self.entry_mut(id)?;
        let from = entry.matrix.residency();
        if from == tier {
            return Ok(false);
        }
        let bytes = entry.matrix.nbytes();
        entry.matrix.set_residency(tier);

        self.resident[tier_index(from)] -= bytes;
        let to = tier_index(tier);
        self.resident[to] += bytes;
        self.peak[to] = self.peak[to].max(self.resident[to]);
        Ok(true)
    }

    /// Bytes `tier` would hold if `id` were replaced by `new_bytes` bytes in `tier`.
    pub fn projected_bytes(&self, id: TensorId, tier: Residency, new_bytes: usize) -> Result<usize> {
        let current = self.get(id)?;
        let existing = if current.residency() == tier {
            current.nbytes()
        } else {
            0
        };
        Ok(self.resident[tier_index(tier)] - existing + new_bytes)
    }

    /// Bytes currently resident in `tier`.
    pub fn resident_bytes(&self, tier: Residency) -> usize {
        self.resident[tier_index(tier)]
    }

    /// Highest number of bytes ever resident in `tier` at once.
    pub fn peak_bytes(&self, tier: Residency) -> usize {
        self.peak[tier_index(tier)]
    }

    /// Number of live allocations.
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    /// Number of `allocate` calls over the allocator's lifetime.
    pub fn total_allocations(&self) -> usize {
        self.total_allocations
    }

    /// Every live handle with its debug name, in slot order.
    pub fn live(&self) -> Vec<(TensorId, String)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let entry = slot.entry.as_ref()?;
                let id = TensorId {
                    index: u32::try_from(index).ok()?,
                    generation: slot.generation,
                };
                Some((id, entry.name.clone()))
            })
            .collect()
    }

    /// Fail with [`SimError::LeakDetected`] if anything outside `retained` is still live.
    pub fn leak_check(&self, retained: &[TensorId]) -> Result<()> {
        let names: Vec<String> = self
            .live()
            .into_iter()
            .filter(|(id, _)| !retained.contains(id))
            .map(|(id, name)| format!("{name}{id}"))
            .collect();
        if names.is_empty() {
            Ok(())
        } else {
            tracing::warn!(leaked = names.len(), "leak check failed");
            Err(SimError::LeakDetected { names })
        }
    }

    fn entry(&self, id: TensorId) -> Result<&Entry> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
            .ok_or(SimError::UseAfterRelease { handle: id })
    }

    fn entry_mut(&mut self, id: TensorId) -> Result<&mut Entry> {
        self.slot_entry_mut(id)
            .ok_or(SimError::UseAfterRelease { handle: id })
    }

    fn slot_entry_mut(&mut self, id: TensorId) -> Option<&mut Entry> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("live", &self.live_count())
            .field("slots", &self.slots.len())
            .field("hbm_bytes", &self.resident[0])
            .field("sram_bytes", &self.resident[1])
            .finish()
    }
}
