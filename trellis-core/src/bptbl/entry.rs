//! Backpointer entry record: one hypothesized word exit.

use crate::dict::{PhoneId, WordId};

/// Numeric backpointer index into the owning table.
///
/// Indices are global across the retired and active regions. Active-region
/// indices are remapped when compaction runs; retired indices are stable for
/// the life of the utterance (until explicitly released).
pub type BpIdx = usize;

/// Sentinel slot value for a right-context score that was never set.
pub const WORST_SCORE: i32 = i32::MIN;

/// A recorded word-exit hypothesis.
///
/// Created during one frame's word-exit evaluation; immutable once the frame
/// is committed, except for `refcnt` which tracks the number of successor
/// entries still pointing at it.
#[derive(Debug, Clone)]
pub struct BpEntry {
    /// Start frame (first frame of the word).
    pub sf: u32,
    /// End frame (the frame this exit was entered in).
    pub ef: u32,
    /// Cleared by absolute pruning; invalid entries drop at compaction.
    pub valid: bool,
    /// Number of successors referencing this entry.
    pub refcnt: u32,
    /// Word that exited.
    pub wid: WordId,
    /// Best predecessor, `None` at the start of a path.
    pub prev: Option<BpIdx>,
    /// Best score among all right contexts.
    pub score: i32,
    /// Start of this entry's right-context score range (active region only;
    /// retired entries carry their scores inline).
    pub s_idx: usize,
    /// Number of right-context score slots.
    pub rc_count: usize,
    /// This word, or the latest non-filler predecessor word.
    pub real_wid: WordId,
    /// Non-filler predecessor of `real_wid`.
    pub prev_real_wid: Option<WordId>,
    /// Last phone of this word.
    pub last_phone: PhoneId,
    /// Second-to-last phone of this word, if any.
    pub last2_phone: Option<PhoneId>,
}
