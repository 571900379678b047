//! Active-region right-context score slab.
//!
//! Each tentative entry owns a contiguous slot range `[s_idx, s_idx +
//! rc_count)` in one append-only vector. When an entry retires, its range is
//! moved out as an owned slab (ranges are never split); when the retirable
//! prefix is compacted away, the corresponding slots are drained from the
//! front and the remaining ranges shift down in lockstep.

use super::entry::WORST_SCORE;

#[derive(Debug, Default)]
pub(crate) struct RcScoreBlock {
    slots: Vec<i32>,
}

impl RcScoreBlock {
    pub(crate) fn with_capacity(cap: usize) -> Self {
        Self {
            slots: Vec::with_capacity(cap),
        }
    }

    /// Reserve `n` slots initialised to `WORST_SCORE`; returns the range start.
    pub(crate) fn alloc(&mut self, n: usize) -> usize {
        let s_idx = self.slots.len();
        self.slots.resize(s_idx + n, WORST_SCORE);
        s_idx
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn slice(&self, s_idx: usize, n: usize) -> &[i32] {
        &self.slots[s_idx..s_idx + n]
    }

    pub(crate) fn slice_mut(&mut self, s_idx: usize, n: usize) -> &mut [i32] {
        &mut self.slots[s_idx..s_idx + n]
    }

    /// Copy a range out as an owned slab (used when its entry retires).
    pub(crate) fn take_slab(&self, s_idx: usize, n: usize) -> Box<[i32]> {
        self.slots[s_idx..s_idx + n].to_vec().into_boxed_slice()
    }

    /// Drop the first `len` slots; surviving ranges must be shifted by the
    /// caller.
    pub(crate) fn drain_prefix(&mut self, len: usize) {
        self.slots.drain(..len);
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
    }
}
