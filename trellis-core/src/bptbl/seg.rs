//! Hypothesis extraction results: word sequence and frame-aligned segments.

use serde::{Deserialize, Serialize};

use crate::dict::WordId;

/// Best-path word sequence with its total path score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hypothesis {
    /// Word IDs in utterance order.
    pub wids: Vec<WordId>,
    /// Total (cumulative Viterbi) score of the path.
    pub score: i32,
}

/// One word of a hypothesis with its frame alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub wid: WordId,
    /// First frame of the word.
    pub sf: u32,
    /// Last frame of the word.
    pub ef: u32,
    /// Score contribution of this word (delta from the predecessor exit).
    pub score: i32,
}

/// Iterator over the best path's segments, in utterance order.
#[derive(Debug, Clone)]
pub struct SegIter {
    segments: Vec<Segment>,
    cur: usize,
}

impl SegIter {
    pub(crate) fn new(segments: Vec<Segment>) -> Self {
        Self { segments, cur: 0 }
    }

    /// Remaining segments without consuming the iterator.
    pub fn as_slice(&self) -> &[Segment] {
        &self.segments[self.cur..]
    }
}

impl Iterator for SegIter {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        let seg = self.segments.get(self.cur).copied();
        self.cur += 1;
        seg
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rem = self.segments.len().saturating_sub(self.cur);
        (rem, Some(rem))
    }
}

impl ExactSizeIterator for SegIter {}
