//! Backpointer table: the forward-search lattice.
//!
//! ## Regions
//!
//! ```text
//!   global index →  0 ............................................ end_idx
//!                   [ released | retired (stable indices) | active ]
//!                     ^released_front                       ^active_idx
//! ```
//!
//! Entries are appended per frame (`push_frame` → `enter`* → `commit`).
//! When the caller reports that the oldest reachable backpointer has moved
//! forward, entries ending before that window retire: dead ones (invalid, or
//! zero refcount after cascading drops) are compacted out, survivors move to
//! the retired region and every surviving index is remapped through an
//! explicit permutation. Retired indices never change again, so a sweeping
//! arc-buffer cursor stays valid across compactions; the retired front is
//! reclaimed only by an explicit `release`.
//!
//! The table has a single writer. Readers (arc sweep, hypothesis backwalk)
//! never mutate anything but refcounts.

mod entry;
mod rcscore;
mod seg;

pub use entry::{BpEntry, BpIdx, WORST_SCORE};
pub use seg::{Hypothesis, SegIter, Segment};

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::dict::{Dictionary, TiedStateMap, WordId};
use crate::error::{Result, TrellisError};
use rcscore::RcScoreBlock;

/// Capacity hints for a new table.
#[derive(Debug, Clone, Copy)]
pub struct BpTableConfig {
    /// Initial entry capacity. Default: 4096.
    pub n_ent_alloc: usize,
    /// Initial capacity of the frame-indexed arrays. Default: 128.
    pub n_frame_alloc: usize,
}

impl Default for BpTableConfig {
    fn default() -> Self {
        Self {
            n_ent_alloc: 4096,
            n_frame_alloc: 128,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableState {
    Empty,
    Accumulating,
    Committed,
    Finalized,
}

/// A retired entry carries its right-context scores inline, so releasing the
/// retired front reclaims both in one step and score ranges are never split.
#[derive(Debug, Clone)]
struct RetiredEnt {
    ent: BpEntry,
    rc: Box<[i32]>,
}

impl std::fmt::Debug for BpTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BpTable")
            .field("retired_base", &self.retired_base)
            .field("retired_next", &self.retired_next)
            .field("n_frame", &self.n_frame)
            .field("active_fr", &self.active_fr)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Append-only, frame-indexed backpointer table with retirement/compaction.
pub struct BpTable {
    dict: Arc<dyn Dictionary>,
    d2p: Arc<dyn TiedStateMap>,

    /// Retired region; `retired[0]` has global index `retired_base`.
    retired: VecDeque<RetiredEnt>,
    retired_base: usize,
    /// One past the last retired index; also the first active index.
    retired_next: usize,

    /// Active region; `ent[i]` has global index `retired_next + i`.
    ent: Vec<BpEntry>,
    rc: RcScoreBlock,

    /// Frames pushed so far; the current frame is `n_frame - 1`.
    n_frame: u32,
    /// First frame that may still hold active entries. Only advances.
    active_fr: u32,
    /// Oldest backpointer still reachable from future frames, as reported by
    /// the most recent `push_frame`.
    oldest_bp: Option<BpIdx>,

    /// Frame → global index of the first entry exiting at or after that
    /// frame, for committed frames `[ef_first, ef_first + ef_idx.len())`.
    ef_idx: VecDeque<BpIdx>,
    ef_first: u32,

    /// Offset into `ent` where the current tentative batch begins.
    frame_start: usize,
    state: TableState,

    // Permutation of the most recent compaction, for callers holding
    // pre-commit indices.
    last_perm: Vec<Option<BpIdx>>,
    last_perm_base: usize,
    last_boundary: usize,
    last_shift: usize,
}

impl BpTable {
    /// Create an empty table.
    ///
    /// # Errors
    /// `InvalidCapacity` if either capacity hint is zero.
    pub fn new(
        dict: Arc<dyn Dictionary>,
        d2p: Arc<dyn TiedStateMap>,
        config: BpTableConfig,
    ) -> Result<Self> {
        if config.n_ent_alloc == 0 {
            return Err(TrellisError::InvalidCapacity {
                what: "n_ent_alloc",
                value: config.n_ent_alloc,
            });
        }
        if config.n_frame_alloc == 0 {
            return Err(TrellisError::InvalidCapacity {
                what: "n_frame_alloc",
                value: config.n_frame_alloc,
            });
        }
        Ok(Self {
            dict,
            d2p,
            retired: VecDeque::with_capacity(config.n_ent_alloc),
            retired_base: 0,
            retired_next: 0,
            ent: Vec::with_capacity(config.n_ent_alloc),
            rc: RcScoreBlock::with_capacity(config.n_ent_alloc),
            n_frame: 0,
            active_fr: 0,
            oldest_bp: None,
            ef_idx: VecDeque::with_capacity(config.n_frame_alloc),
            ef_first: 0,
            frame_start: 0,
            state: TableState::Empty,
            last_perm: Vec::new(),
            last_perm_base: 0,
            last_boundary: 0,
            last_shift: 0,
        })
    }

    // ── Index accessors ──────────────────────────────────────────────────

    /// One past the last entry (global).
    pub fn end_idx(&self) -> BpIdx {
        self.retired_next + self.ent.len()
    }

    /// One past the last retired entry; equals the first active index.
    pub fn retired_idx(&self) -> BpIdx {
        self.retired_next
    }

    /// First active (non-retired) index.
    pub fn active_idx(&self) -> BpIdx {
        self.retired_next
    }

    /// Oldest retired index still physically present.
    pub fn first_retained_idx(&self) -> BpIdx {
        self.retired_base
    }

    /// Number of frames searched so far.
    pub fn frame_idx(&self) -> u32 {
        self.n_frame
    }

    /// First frame that may still hold active entries.
    pub fn active_frame(&self) -> u32 {
        self.active_fr
    }

    /// Safe arc frontier: every word exit starting before this frame has
    /// already retired, and no future entry can start before it either
    /// (future paths chain through the reachability window).
    pub fn active_sf(&self) -> u32 {
        let min_active = self.ent.iter().map(|e| e.sf).min().unwrap_or(u32::MAX);
        min_active.min(self.active_fr + 1)
    }

    pub fn active_count(&self) -> usize {
        self.ent.len()
    }

    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    pub fn is_finalized(&self) -> bool {
        self.state == TableState::Finalized
    }

    fn oob(&self, index: usize) -> TrellisError {
        TrellisError::IndexOutOfRange {
            index,
            start: self.retired_base,
            end: self.end_idx(),
        }
    }

    /// Entry by global index.
    pub fn ent(&self, idx: BpIdx) -> Result<&BpEntry> {
        if idx >= self.retired_next {
            self.ent.get(idx - self.retired_next).ok_or_else(|| self.oob(idx))
        } else if idx >= self.retired_base {
            Ok(&self.retired[idx - self.retired_base].ent)
        } else {
            Err(self.oob(idx))
        }
    }

    fn entry_mut(&mut self, idx: BpIdx) -> Result<&mut BpEntry> {
        if idx >= self.retired_next {
            let off = idx - self.retired_next;
            if off < self.ent.len() {
                Ok(&mut self.ent[off])
            } else {
                Err(self.oob(idx))
            }
        } else if idx >= self.retired_base {
            Ok(&mut self.retired[idx - self.retired_base].ent)
        } else {
            Err(self.oob(idx))
        }
    }

    /// Best predecessor of an entry, if it has one.
    pub fn prev(&self, e: &BpEntry) -> Result<Option<&BpEntry>> {
        e.prev.map(|p| self.ent(p)).transpose()
    }

    /// Start frame of the entry at `idx`.
    pub fn sf(&self, idx: BpIdx) -> Result<u32> {
        Ok(self.ent(idx)?.sf)
    }

    /// First word exit at or after `frame` (committed frames in the active
    /// window only).
    pub fn ef_idx(&self, frame: u32) -> Result<BpIdx> {
        let end = self.ef_first as usize + self.ef_idx.len();
        if frame < self.ef_first || frame as usize >= end {
            return Err(TrellisError::IndexOutOfRange {
                index: frame as usize,
                start: self.ef_first as usize,
                end,
            });
        }
        Ok(self.ef_idx[(frame - self.ef_first) as usize])
    }

    /// Number of word exits committed in `frame` (0 if outside the window).
    pub fn ef_count(&self, frame: u32) -> usize {
        let Ok(start) = self.ef_idx(frame) else {
            return 0;
        };
        let committed_end = self.retired_next + self.frame_start;
        let end = self.ef_idx(frame + 1).unwrap_or(committed_end);
        end - start
    }

    // ── Frame lifecycle ──────────────────────────────────────────────────

    /// Open a new frame. Must be called exactly once per decoded frame,
    /// before any `enter` for that frame.
    ///
    /// `oldest_bp` is the oldest backpointer still reachable from future
    /// frames (bounds the next compaction); `None` means nothing older than
    /// the current frame is reachable.
    ///
    /// Returns the new frame index.
    pub fn push_frame(&mut self, oldest_bp: Option<BpIdx>) -> u32 {
        debug_assert!(
            matches!(self.state, TableState::Empty | TableState::Committed),
            "push_frame while a frame is open or after finalize"
        );
        debug_assert!(oldest_bp.is_none_or(|b| b >= self.retired_base && b < self.end_idx()));
        self.oldest_bp = oldest_bp;
        let frame = self.n_frame;
        self.n_frame += 1;
        self.frame_start = self.ent.len();
        self.state = TableState::Accumulating;
        trace!(frame, oldest_bp = ?oldest_bp, "frame opened");
        frame
    }

    /// Append one tentative word-exit entry for the current frame.
    ///
    /// The entry is not visible to readers until `commit`. The real-word
    /// fields are derived from the predecessor's cached values, so filler
    /// skipping is O(1).
    pub fn enter(
        &mut self,
        wid: WordId,
        prev: Option<BpIdx>,
        score: i32,
        rc: usize,
    ) -> Result<BpIdx> {
        debug_assert!(
            self.state == TableState::Accumulating,
            "enter outside an open frame"
        );
        let frame = self.n_frame - 1;
        let rc_count = self.d2p.rc_count(wid).max(1);
        if rc >= rc_count {
            return Err(TrellisError::RcIndexOutOfRange { rc, rc_count });
        }

        let (sf, real_wid, prev_real_wid) = self.lm_state(wid, prev)?;
        if let Some(p) = prev {
            self.entry_mut(p)?.refcnt += 1;
        }

        let s_idx = self.rc.alloc(rc_count);
        self.rc.slice_mut(s_idx, rc_count)[rc] = score;

        let idx = self.end_idx();
        self.ent.push(BpEntry {
            sf,
            ef: frame,
            valid: true,
            refcnt: 0,
            wid,
            prev,
            score,
            s_idx,
            rc_count,
            real_wid,
            prev_real_wid,
            last_phone: self.dict.last_phone(wid),
            last2_phone: self.dict.last2_phone(wid),
        });
        Ok(idx)
    }

    /// Derive (sf, real_wid, prev_real_wid) for a word exiting after `prev`.
    fn lm_state(
        &self,
        wid: WordId,
        prev: Option<BpIdx>,
    ) -> Result<(u32, WordId, Option<WordId>)> {
        match prev {
            Some(p) => {
                let pe = self.ent(p)?;
                let sf = pe.ef + 1;
                if self.dict.is_filler(wid) {
                    Ok((sf, pe.real_wid, pe.prev_real_wid))
                } else {
                    Ok((sf, wid, Some(pe.real_wid)))
                }
            }
            None => Ok((0, wid, None)),
        }
    }

    /// Re-point a tentative entry at a different predecessor and refresh its
    /// poor-man's-trigram language-model state (`real_wid`/`prev_real_wid`).
    ///
    /// Only valid on entries of the currently open frame; committed entries
    /// are immutable.
    pub fn fake_lmstate(
        &mut self,
        idx: BpIdx,
        prev: Option<BpIdx>,
        score: i32,
    ) -> Result<()> {
        debug_assert!(
            self.state == TableState::Accumulating
                && idx >= self.retired_next + self.frame_start,
            "fake_lmstate on a committed entry"
        );
        let wid = self.ent(idx)?.wid;
        let (sf, real_wid, prev_real_wid) = self.lm_state(wid, prev)?;
        let old_prev = self.ent(idx)?.prev;
        if let Some(op) = old_prev {
            let e = self.entry_mut(op)?;
            debug_assert!(e.refcnt > 0);
            e.refcnt -= 1;
        }
        if let Some(p) = prev {
            self.entry_mut(p)?.refcnt += 1;
        }
        let e = self.entry_mut(idx)?;
        e.prev = prev;
        e.sf = sf;
        e.score = score;
        e.real_wid = real_wid;
        e.prev_real_wid = prev_real_wid;
        Ok(())
    }

    /// Write one right-context alternate score for a tentative entry.
    pub fn set_rcscore(&mut self, idx: BpIdx, rc: usize, score: i32) -> Result<()> {
        debug_assert!(
            idx >= self.retired_next + self.frame_start,
            "right-context scores are frozen after commit"
        );
        let e = self.ent(idx)?;
        let (s_idx, rc_count) = (e.s_idx, e.rc_count);
        if rc >= rc_count {
            return Err(TrellisError::RcIndexOutOfRange { rc, rc_count });
        }
        self.rc.slice_mut(s_idx, rc_count)[rc] = score;
        let e = self.entry_mut(idx)?;
        if score > e.score {
            e.score = score;
        }
        Ok(())
    }

    /// Right-context score range of an entry (read-only).
    pub fn rcscores(&self, idx: BpIdx) -> Result<&[i32]> {
        if idx >= self.retired_next {
            let e = self.ent(idx)?;
            Ok(self.rc.slice(e.s_idx, e.rc_count))
        } else if idx >= self.retired_base {
            Ok(&self.retired[idx - self.retired_base].rc)
        } else {
            Err(self.oob(idx))
        }
    }

    /// Mark a tentative entry pruned. It is skipped by exit search and arc
    /// sweeps; if a successor still references it, it survives compaction
    /// as a chain link and drops once unreferenced.
    pub fn invalidate(&mut self, idx: BpIdx) -> Result<()> {
        debug_assert!(
            idx >= self.retired_next + self.frame_start,
            "invalidate on a committed entry"
        );
        self.entry_mut(idx)?.valid = false;
        Ok(())
    }

    /// Close the current frame: make its entries visible, index them by end
    /// frame, and run garbage collection over entries that fell out of the
    /// reachability window.
    pub fn commit(&mut self) -> Result<()> {
        debug_assert!(
            self.state == TableState::Accumulating,
            "commit without an open frame"
        );
        let frame = self.n_frame - 1;
        let batch_len = self.ent.len() - self.frame_start;

        let new_active_fr = match self.oldest_bp {
            Some(b) => self.ent(b)?.ef,
            None => frame,
        };
        self.state = TableState::Committed;
        self.retire_window(new_active_fr, None);
        self.frame_start = self.ent.len();

        // Frame index entries appended after compaction so stored indices
        // are already remapped. Frames with no exits point at this batch.
        let batch_start = self.end_idx() - batch_len;
        while (self.ef_first as usize + self.ef_idx.len()) <= frame as usize {
            self.ef_idx.push_back(batch_start);
        }

        debug!(
            frame,
            n_exits = batch_len,
            active = self.ent.len(),
            retired = self.retired.len(),
            active_fr = self.active_fr,
            "frame committed"
        );
        Ok(())
    }

    /// Flush all remaining entries to the retired region, dropping dead
    /// paths. No `push_frame`/`enter` is valid afterwards until `reset`.
    pub fn finalize(&mut self) -> Result<()> {
        debug_assert!(
            matches!(self.state, TableState::Committed | TableState::Empty),
            "finalize with an open frame"
        );
        if self.state == TableState::Empty {
            self.state = TableState::Finalized;
            return Ok(());
        }
        let last_frame = self.n_frame - 1;
        self.retire_window(self.n_frame, Some(last_frame));
        self.ef_idx.clear();
        self.ef_first = self.n_frame;
        self.frame_start = 0;
        self.state = TableState::Finalized;
        info!(
            n_frame = self.n_frame,
            retired = self.retired.len(),
            "backpointer table finalized"
        );
        Ok(())
    }

    /// Clear the table for a new utterance.
    pub fn reset(&mut self) {
        self.retired.clear();
        self.retired_base = 0;
        self.retired_next = 0;
        self.ent.clear();
        self.rc.clear();
        self.n_frame = 0;
        self.active_fr = 0;
        self.oldest_bp = None;
        self.ef_idx.clear();
        self.ef_first = 0;
        self.frame_start = 0;
        self.state = TableState::Empty;
        self.last_perm.clear();
        self.last_perm_base = 0;
        self.last_boundary = 0;
        self.last_shift = 0;
    }

    /// Physically reclaim retired entries with global index below
    /// `first_idx`. The caller (normally a releasing arc sweep) promises it
    /// no longer needs them.
    pub fn release(&mut self, first_idx: BpIdx) {
        let bound = first_idx.min(self.retired_next);
        while self.retired_base < bound {
            self.retired.pop_front();
            self.retired_base += 1;
        }
    }

    /// Map an index held from before the most recent `commit` to its
    /// post-compaction position. `None` if the entry was compacted away.
    pub fn remap(&self, idx: BpIdx) -> Option<BpIdx> {
        if idx < self.last_perm_base {
            Some(idx)
        } else if idx < self.last_boundary {
            self.last_perm[idx - self.last_perm_base]
        } else {
            Some(idx - self.last_shift)
        }
    }

    /// Retire committed entries ending before `new_active_fr`.
    ///
    /// Drops dead (zero-refcount) entries with a newest→oldest cascade,
    /// moves survivors to the retired region in order, and remaps every
    /// surviving reference through the permutation. Relative order is
    /// preserved.
    ///
    /// `keep_final_frame`: during `finalize`, valid exits in that frame
    /// survive even with no successors (they are the candidate path ends).
    fn retire_window(&mut self, new_active_fr: u32, keep_final_frame: Option<u32>) {
        self.active_fr = self.active_fr.max(new_active_fr);
        let boundary_off = self
            .ent
            .iter()
            .take_while(|e| e.ef < self.active_fr || keep_final_frame.is_some())
            .count();
        let base = self.retired_next;

        if boundary_off == 0 {
            self.last_perm.clear();
            self.last_perm_base = base;
            self.last_boundary = base;
            self.last_shift = 0;
            return;
        }

        // Pass 1: survival, newest→oldest so refcount drops cascade.
        // Invalidated entries stay as chain links while referenced and fall
        // with their last successor; they are never exit candidates.
        let mut keep = vec![false; boundary_off];
        for j in (0..boundary_off).rev() {
            let e = &self.ent[j];
            keep[j] = e.refcnt > 0
                || (e.valid && keep_final_frame.is_some_and(|f| e.ef == f));
            if !keep[j] {
                if let Some(p) = self.ent[j].prev {
                    if p >= base {
                        self.ent[p - base].refcnt -= 1;
                    } else if p >= self.retired_base {
                        self.retired[p - self.retired_base].ent.refcnt -= 1;
                    }
                }
            }
        }

        // Pass 2: move survivors, building the permutation in order.
        let rc_prefix_len = if boundary_off < self.ent.len() {
            self.ent[boundary_off].s_idx
        } else {
            self.rc.len()
        };
        let prefix: Vec<BpEntry> = self.ent.drain(..boundary_off).collect();
        let mut perm: Vec<Option<BpIdx>> = vec![None; boundary_off];
        let mut kept = 0usize;
        for (j, mut e) in prefix.into_iter().enumerate() {
            if !keep[j] {
                continue;
            }
            if let Some(p) = e.prev {
                if p >= base {
                    e.prev = Some(perm[p - base].expect("referenced entry survives compaction"));
                }
            }
            let rc = self.rc.take_slab(e.s_idx, e.rc_count);
            e.s_idx = 0;
            let new_idx = self.retired_next;
            perm[j] = Some(new_idx);
            self.retired.push_back(RetiredEnt { ent: e, rc });
            self.retired_next += 1;
            kept += 1;
        }
        let dropped = boundary_off - kept;

        self.rc.drain_prefix(rc_prefix_len);
        for e in &mut self.ent {
            e.s_idx -= rc_prefix_len;
            if let Some(p) = e.prev {
                e.prev = Some(if p < base {
                    p
                } else if p < base + boundary_off {
                    perm[p - base].expect("referenced entry survives compaction")
                } else {
                    p - dropped
                });
            }
        }

        while self.ef_first < self.active_fr && !self.ef_idx.is_empty() {
            self.ef_idx.pop_front();
            self.ef_first += 1;
        }
        if self.ef_idx.is_empty() {
            self.ef_first = self.ef_first.max(self.active_fr);
        }
        for v in self.ef_idx.iter_mut() {
            debug_assert!(*v >= base + boundary_off);
            *v -= dropped;
        }
        if let Some(b) = self.oldest_bp {
            if b >= base {
                debug_assert!(b >= base + boundary_off, "oldest_bp inside retired prefix");
                self.oldest_bp = Some(b - dropped);
            }
        }

        self.last_perm = perm;
        self.last_perm_base = base;
        self.last_boundary = base + boundary_off;
        self.last_shift = dropped;

        if kept > 0 || dropped > 0 {
            trace!(
                kept,
                dropped,
                active_fr = self.active_fr,
                retired = self.retired.len(),
                "window retired"
            );
        }
    }

    // ── Queries ──────────────────────────────────────────────────────────

    /// Best-scoring valid exit in the final frame, matching `wid` (`None`
    /// matches any word). Equal scores resolve to the most recently entered
    /// exit.
    pub fn find_exit(&self, wid: Option<WordId>) -> Result<BpIdx> {
        debug_assert!(
            self.state != TableState::Accumulating,
            "find_exit during an open frame"
        );
        if self.n_frame == 0 {
            return Err(TrellisError::NoExit { wid });
        }
        let last = self.n_frame - 1;
        let mut best: Option<(BpIdx, i32)> = None;
        let mut idx = self.end_idx();
        while idx > self.retired_base {
            idx -= 1;
            let e = self.ent(idx)?;
            if e.ef < last {
                break;
            }
            if e.ef != last || !e.valid {
                continue;
            }
            if let Some(w) = wid {
                if e.wid != w {
                    continue;
                }
            }
            match best {
                Some((_, s)) if s >= e.score => {}
                _ => best = Some((idx, e.score)),
            }
        }
        best.map(|(i, _)| i).ok_or(TrellisError::NoExit { wid })
    }

    /// Best path ending in `finish_wid` (or the overall best exit), as a
    /// word sequence plus total score.
    pub fn hyp(&self, finish_wid: Option<WordId>) -> Result<Hypothesis> {
        let exit = self.find_exit(finish_wid)?;
        let score = self.ent(exit)?.score;
        let mut wids = Vec::new();
        let mut cur = Some(exit);
        while let Some(i) = cur {
            let e = self.ent(i)?;
            wids.push(e.wid);
            cur = e.prev;
        }
        wids.reverse();
        Ok(Hypothesis { wids, score })
    }

    /// Frame-aligned segmentation of the best path.
    pub fn seg_iter(&self, finish_wid: Option<WordId>) -> Result<SegIter> {
        let exit = self.find_exit(finish_wid)?;
        let mut chain = Vec::new();
        let mut cur = Some(exit);
        while let Some(i) = cur {
            chain.push(i);
            cur = self.ent(i)?.prev;
        }
        chain.reverse();
        let mut segments = Vec::with_capacity(chain.len());
        for &i in &chain {
            let e = self.ent(i)?;
            let prev_score = match self.prev(e)? {
                Some(pe) => pe.score,
                None => 0,
            };
            segments.push(Segment {
                wid: e.wid,
                sf: e.sf,
                ef: e.ef,
                score: e.score - prev_score,
            });
        }
        Ok(SegIter::new(segments))
    }

    /// Log the table contents at debug level.
    pub fn dump(&self) {
        debug!(
            n_frame = self.n_frame,
            active_fr = self.active_fr,
            retired = self.retired.len(),
            active = self.ent.len(),
            "bptbl dump"
        );
        for idx in self.retired_base..self.end_idx() {
            if let Ok(e) = self.ent(idx) {
                debug!(
                    idx,
                    wid = e.wid,
                    sf = e.sf,
                    ef = e.ef,
                    prev = ?e.prev,
                    score = e.score,
                    refcnt = e.refcnt,
                    valid = e.valid,
                    "bp"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::{StaticDict, UniformTiedStateMap};

    fn test_dict() -> (Arc<StaticDict>, Vec<WordId>) {
        let mut dict = StaticDict::new();
        let cat = dict.add_word("CAT", vec![1, 2, 3], false);
        let dog = dict.add_word("DOG", vec![4, 5, 6], false);
        let fish = dict.add_word("FISH", vec![7, 8], false);
        (Arc::new(dict), vec![cat, dog, fish])
    }

    fn table(n_rc: usize) -> (BpTable, Vec<WordId>) {
        let (dict, wids) = test_dict();
        let d2p = Arc::new(UniformTiedStateMap::new(n_rc));
        (
            BpTable::new(dict, d2p, BpTableConfig::default()).unwrap(),
            wids,
        )
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let (dict, _) = test_dict();
        let d2p = Arc::new(UniformTiedStateMap::new(1));
        let err = BpTable::new(
            dict,
            d2p,
            BpTableConfig {
                n_ent_alloc: 0,
                n_frame_alloc: 128,
            },
        )
        .unwrap_err();
        assert!(matches!(err, TrellisError::InvalidCapacity { .. }));
    }

    #[test]
    fn single_word_utterance() {
        let (mut tbl, w) = table(1);
        assert_eq!(tbl.push_frame(None), 0);
        tbl.enter(w[0], None, -100, 0).unwrap();
        tbl.commit().unwrap();
        tbl.finalize().unwrap();
        let hyp = tbl.hyp(None).unwrap();
        assert_eq!(hyp.wids, vec![w[0]]);
        assert_eq!(hyp.score, -100);
    }

    #[test]
    fn exit_found_in_final_frame_only() {
        let (mut tbl, w) = table(1);
        tbl.push_frame(None);
        tbl.commit().unwrap();
        tbl.push_frame(None);
        let dog = tbl.enter(w[1], None, -200, 0).unwrap();
        tbl.commit().unwrap();
        tbl.finalize().unwrap();
        let exit = tbl.find_exit(None).unwrap();
        let e = tbl.ent(exit).unwrap();
        assert_eq!(e.wid, w[1]);
        assert_eq!(e.ef, 1);
        assert_eq!(e.score, -200);
        // index may have been remapped by finalize, but the entry is the one
        // entered above
        let _ = dog;
    }

    #[test]
    fn find_exit_without_exits_is_no_exit() {
        let (mut tbl, _) = table(1);
        tbl.push_frame(None);
        tbl.commit().unwrap();
        tbl.finalize().unwrap();
        assert!(matches!(
            tbl.find_exit(None),
            Err(TrellisError::NoExit { wid: None })
        ));
    }

    #[test]
    fn find_exit_filters_by_word() {
        let (mut tbl, w) = table(1);
        tbl.push_frame(None);
        tbl.enter(w[0], None, -100, 0).unwrap();
        tbl.enter(w[1], None, -50, 0).unwrap();
        tbl.commit().unwrap();
        tbl.finalize().unwrap();
        let cat = tbl.find_exit(Some(w[0])).unwrap();
        assert_eq!(tbl.ent(cat).unwrap().wid, w[0]);
        let any = tbl.find_exit(None).unwrap();
        assert_eq!(tbl.ent(any).unwrap().wid, w[1]);
        assert!(matches!(
            tbl.find_exit(Some(w[2])),
            Err(TrellisError::NoExit { .. })
        ));
    }

    #[test]
    fn equal_scores_prefer_latest_entry() {
        let (mut tbl, w) = table(1);
        tbl.push_frame(None);
        tbl.enter(w[0], None, -100, 0).unwrap();
        let second = tbl.enter(w[1], None, -100, 0).unwrap();
        tbl.commit().unwrap();
        let exit = tbl.find_exit(None).unwrap();
        assert_eq!(exit, second);
        assert_eq!(tbl.ent(exit).unwrap().wid, w[1]);
    }

    #[test]
    fn hyp_is_idempotent() {
        let (mut tbl, w) = table(1);
        tbl.push_frame(None);
        let a = tbl.enter(w[0], None, -100, 0).unwrap();
        tbl.commit().unwrap();
        tbl.push_frame(Some(a));
        tbl.enter(w[1], Some(a), -250, 0).unwrap();
        tbl.commit().unwrap();
        tbl.finalize().unwrap();
        let h1 = tbl.hyp(None).unwrap();
        let h2 = tbl.hyp(None).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.wids, vec![w[0], w[1]]);
        assert_eq!(h1.score, -250);
    }

    #[test]
    fn predecessor_chain_terminates_with_hyp_length() {
        let (mut tbl, w) = table(1);
        let mut prev = None;
        for f in 0..20u32 {
            tbl.push_frame(prev);
            let idx = tbl
                .enter(w[(f % 3) as usize], prev, -((f as i32 + 1) * 10), 0)
                .unwrap();
            tbl.commit().unwrap();
            prev = Some(tbl.end_idx() - 1);
            let _ = idx;
        }
        tbl.finalize().unwrap();
        let hyp = tbl.hyp(None).unwrap();
        assert_eq!(hyp.wids.len(), 20);
        // walk the chain by hand; it must reach the path start in exactly
        // hyp-length steps
        let mut steps = 0;
        let mut cur = Some(tbl.find_exit(None).unwrap());
        while let Some(i) = cur {
            steps += 1;
            cur = tbl.ent(i).unwrap().prev;
        }
        assert_eq!(steps, 20);
    }

    #[test]
    fn filler_words_propagate_real_word_state() {
        let mut dict = StaticDict::new();
        let wids = vec![
            dict.add_word("CAT", vec![1, 2, 3], false),
            dict.add_word("DOG", vec![4, 5, 6], false),
        ];
        let uh = dict.add_word("<uh>", vec![9], true);
        let dict = Arc::new(dict);
        let d2p = Arc::new(UniformTiedStateMap::new(1));
        let mut tbl = BpTable::new(dict, d2p, BpTableConfig::default()).unwrap();

        tbl.push_frame(None);
        let cat = tbl.enter(wids[0], None, -10, 0).unwrap();
        tbl.commit().unwrap();
        tbl.push_frame(Some(cat));
        let filler = tbl.enter(uh, Some(cat), -20, 0).unwrap();
        tbl.commit().unwrap();
        let filler = tbl.remap(filler).unwrap();
        tbl.push_frame(Some(filler));
        let dog = tbl.enter(wids[1], Some(filler), -30, 0).unwrap();
        tbl.commit().unwrap();

        let fe = tbl.ent(tbl.remap(filler).unwrap()).unwrap();
        assert_eq!(fe.real_wid, wids[0]);
        assert_eq!(fe.prev_real_wid, None);
        let de = tbl.ent(tbl.remap(dog).unwrap()).unwrap();
        assert_eq!(de.real_wid, wids[1]);
        assert_eq!(de.prev_real_wid, Some(wids[0]));
    }

    #[test]
    fn fake_lmstate_moves_refcount_and_state() {
        let (mut tbl, w) = table(1);
        tbl.push_frame(None);
        let a = tbl.enter(w[0], None, -10, 0).unwrap();
        let b = tbl.enter(w[1], None, -12, 0).unwrap();
        tbl.commit().unwrap();
        tbl.push_frame(Some(a));
        let c = tbl.enter(w[2], Some(a), -30, 0).unwrap();
        tbl.fake_lmstate(c, Some(b), -25).unwrap();
        assert_eq!(tbl.ent(a).unwrap().refcnt, 0);
        assert_eq!(tbl.ent(b).unwrap().refcnt, 1);
        let ce = tbl.ent(c).unwrap();
        assert_eq!(ce.prev, Some(b));
        assert_eq!(ce.prev_real_wid, Some(w[1]));
        assert_eq!(ce.score, -25);
    }

    #[test]
    fn rc_scores_track_best_and_bounds() {
        let (mut tbl, w) = table(3);
        tbl.push_frame(None);
        let a = tbl.enter(w[0], None, -100, 0).unwrap();
        tbl.set_rcscore(a, 1, -80).unwrap();
        tbl.set_rcscore(a, 2, -120).unwrap();
        assert!(matches!(
            tbl.set_rcscore(a, 3, -10),
            Err(TrellisError::RcIndexOutOfRange { rc: 3, rc_count: 3 })
        ));
        assert_eq!(tbl.ent(a).unwrap().score, -80);
        assert_eq!(tbl.rcscores(a).unwrap(), &[-100, -80, -120]);
        tbl.commit().unwrap();
        tbl.finalize().unwrap();
        // scores survive retirement in the same order
        let exit = tbl.find_exit(None).unwrap();
        assert_eq!(tbl.rcscores(exit).unwrap(), &[-100, -80, -120]);
    }

    #[test]
    fn enter_rejects_out_of_range_rc() {
        let (mut tbl, w) = table(2);
        tbl.push_frame(None);
        assert!(matches!(
            tbl.enter(w[0], None, -10, 2),
            Err(TrellisError::RcIndexOutOfRange { rc: 2, rc_count: 2 })
        ));
    }

    #[test]
    fn ent_rejects_out_of_range_index() {
        let (mut tbl, w) = table(1);
        tbl.push_frame(None);
        tbl.enter(w[0], None, -10, 0).unwrap();
        tbl.commit().unwrap();
        assert!(tbl.ent(0).is_ok());
        assert!(matches!(
            tbl.ent(5),
            Err(TrellisError::IndexOutOfRange { index: 5, .. })
        ));
    }

    #[test]
    fn compaction_preserves_relative_order() {
        let (mut tbl, w) = table(1);
        // frame 0: three exits; only the last gets a successor
        tbl.push_frame(None);
        let a = tbl.enter(w[0], None, -10, 0).unwrap();
        let b = tbl.enter(w[1], None, -11, 0).unwrap();
        let c = tbl.enter(w[2], None, -12, 0).unwrap();
        tbl.commit().unwrap();
        tbl.push_frame(Some(a));
        let d = tbl.enter(w[0], Some(a), -20, 0).unwrap();
        let e = tbl.enter(w[1], Some(c), -21, 0).unwrap();
        tbl.commit().unwrap();
        // advance the window past frame 0; b (refcnt 0) is compacted out
        let d = tbl.remap(d).unwrap();
        tbl.push_frame(Some(d));
        tbl.enter(w[2], Some(d), -30, 0).unwrap();
        tbl.commit().unwrap();

        let na = tbl.remap(a).unwrap();
        let nc = tbl.remap(c).unwrap();
        assert_eq!(tbl.remap(b), None);
        assert!(na < nc, "surviving order must be preserved");
        assert_eq!(tbl.ent(na).unwrap().wid, w[0]);
        assert_eq!(tbl.ent(nc).unwrap().wid, w[2]);
        // d and e shifted down by one dropped entry
        let ne = tbl.remap(e).unwrap();
        assert_eq!(tbl.ent(ne).unwrap().prev, Some(nc));
        assert!(na < nc && nc < tbl.remap(d).unwrap() && tbl.remap(d).unwrap() < ne);
    }

    #[test]
    fn dead_subtrees_cascade_at_finalize() {
        let (mut tbl, w) = table(1);
        tbl.push_frame(None);
        let a = tbl.enter(w[0], None, -10, 0).unwrap();
        tbl.commit().unwrap();
        tbl.push_frame(Some(a));
        // dead end in frame 1: no successor, not in the final frame
        tbl.enter(w[1], Some(a), -20, 0).unwrap();
        let live = tbl.enter(w[2], Some(a), -22, 0).unwrap();
        tbl.commit().unwrap();
        tbl.push_frame(Some(tbl.remap(live).unwrap()));
        tbl.enter(w[0], Some(tbl.remap(live).unwrap()), -30, 0).unwrap();
        tbl.commit().unwrap();
        tbl.finalize().unwrap();
        // a, live, and the final exit survive; the dead end is gone
        assert_eq!(tbl.retired_count(), 3);
        let hyp = tbl.hyp(None).unwrap();
        assert_eq!(hyp.wids, vec![w[0], w[2], w[0]]);
    }

    #[test]
    fn invalidated_entry_with_a_successor_survives_compaction() {
        let (mut tbl, w) = table(1);
        tbl.push_frame(None);
        // same-frame chain, then the predecessor is pruned while referenced
        let a = tbl.enter(w[0], None, -10, 0).unwrap();
        let b = tbl.enter(w[1], Some(a), -12, 0).unwrap();
        tbl.invalidate(a).unwrap();
        tbl.commit().unwrap();
        tbl.push_frame(Some(b));
        let c = tbl.enter(w[2], Some(b), -20, 0).unwrap();
        tbl.commit().unwrap();
        // advancing the window retires frame 0; the pruned entry rides
        // along as a chain link instead of leaving b's prev dangling
        tbl.push_frame(Some(tbl.remap(c).unwrap()));
        tbl.enter(w[0], Some(tbl.remap(c).unwrap()), -30, 0).unwrap();
        tbl.commit().unwrap();
        let a = tbl.remap(a).unwrap();
        let e = tbl.ent(a).unwrap();
        assert!(!e.valid);
        assert_eq!(e.refcnt, 1);
        tbl.finalize().unwrap();
        assert_eq!(tbl.hyp(None).unwrap().wids, vec![w[0], w[1], w[2], w[0]]);
    }

    #[test]
    fn invalidated_entry_drops_with_its_last_successor() {
        let (mut tbl, w) = table(1);
        tbl.push_frame(None);
        let a = tbl.enter(w[0], None, -10, 0).unwrap();
        tbl.enter(w[1], Some(a), -12, 0).unwrap();
        tbl.invalidate(a).unwrap();
        tbl.commit().unwrap();
        tbl.push_frame(None);
        tbl.enter(w[2], None, -20, 0).unwrap();
        tbl.commit().unwrap();
        tbl.finalize().unwrap();
        // the successor has no extension and is not a final-frame exit, so
        // the cascade frees it and the pruned entry behind it in one pass
        assert_eq!(tbl.retired_count(), 1);
        assert_eq!(tbl.hyp(None).unwrap().wids, vec![w[2]]);
    }

    #[test]
    fn ef_index_counts_per_frame_exits() {
        let (mut tbl, w) = table(1);
        tbl.push_frame(None);
        let a = tbl.enter(w[0], None, -10, 0).unwrap();
        tbl.enter(w[1], None, -11, 0).unwrap();
        tbl.commit().unwrap();
        tbl.push_frame(Some(a));
        tbl.commit().unwrap();
        tbl.push_frame(Some(a));
        tbl.enter(w[2], Some(a), -30, 0).unwrap();
        tbl.commit().unwrap();
        assert_eq!(tbl.ef_count(0), 2);
        assert_eq!(tbl.ef_count(1), 0);
        assert_eq!(tbl.ef_count(2), 1);
        assert_eq!(tbl.ef_count(7), 0);
    }

    #[test]
    fn seg_iter_reports_frame_alignment_and_deltas() {
        let (mut tbl, w) = table(1);
        tbl.push_frame(None);
        let a = tbl.enter(w[0], None, -100, 0).unwrap();
        tbl.commit().unwrap();
        tbl.push_frame(Some(a));
        tbl.commit().unwrap();
        tbl.push_frame(Some(a));
        tbl.enter(w[1], Some(a), -250, 0).unwrap();
        tbl.commit().unwrap();
        tbl.finalize().unwrap();
        let segs: Vec<Segment> = tbl.seg_iter(None).unwrap().collect();
        assert_eq!(segs.len(), 2);
        assert_eq!((segs[0].wid, segs[0].sf, segs[0].ef, segs[0].score), (w[0], 0, 0, -100));
        assert_eq!((segs[1].wid, segs[1].sf, segs[1].ef, segs[1].score), (w[1], 1, 2, -150));
    }

    #[test]
    fn reset_returns_to_empty() {
        let (mut tbl, w) = table(1);
        tbl.push_frame(None);
        tbl.enter(w[0], None, -10, 0).unwrap();
        tbl.commit().unwrap();
        tbl.finalize().unwrap();
        tbl.reset();
        assert_eq!(tbl.end_idx(), 0);
        assert_eq!(tbl.frame_idx(), 0);
        assert!(!tbl.is_finalized());
        // table is usable again
        tbl.push_frame(None);
        tbl.enter(w[1], None, -5, 0).unwrap();
        tbl.commit().unwrap();
        tbl.finalize().unwrap();
        assert_eq!(tbl.hyp(None).unwrap().wids, vec![w[1]]);
    }

    #[test]
    fn release_reclaims_retired_front() {
        let (mut tbl, w) = table(1);
        let mut prev = None;
        for f in 0..10u32 {
            tbl.push_frame(prev);
            tbl.enter(w[0], prev, -(f as i32), 0).unwrap();
            tbl.commit().unwrap();
            prev = Some(tbl.end_idx() - 1);
        }
        // everything except the newest chain tail is retired by now
        assert!(tbl.retired_count() >= 8);
        let cut = tbl.retired_idx() - 2;
        tbl.release(cut);
        assert_eq!(tbl.first_retained_idx(), cut);
        assert!(tbl.ent(cut).is_ok());
        assert!(matches!(
            tbl.ent(cut - 1),
            Err(TrellisError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    #[should_panic(expected = "enter outside an open frame")]
    fn enter_before_push_frame_is_a_contract_violation() {
        let (mut tbl, w) = table(1);
        let _ = tbl.enter(w[0], None, -10, 0);
    }

    #[test]
    #[should_panic(expected = "find_exit during an open frame")]
    fn find_exit_during_an_open_frame_is_a_contract_violation() {
        let (mut tbl, w) = table(1);
        tbl.push_frame(None);
        tbl.enter(w[0], None, -10, 0).unwrap();
        let _ = tbl.find_exit(None);
    }

    #[test]
    #[should_panic(expected = "commit without an open frame")]
    fn double_commit_is_a_contract_violation() {
        let (mut tbl, _) = table(1);
        tbl.push_frame(None);
        tbl.commit().unwrap();
        let _ = tbl.commit();
    }
}
