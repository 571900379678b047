//! Arc buffer: single-producer/single-consumer handoff of committed word
//! exits to a second search pass.
//!
//! The producer (the decode worker) periodically sweeps newly retired
//! backpointer entries into lightweight [`WordArc`]s, then commits a frame
//! window: every arc starting before the committed frontier is present,
//! sorted and indexed by start frame, and will never change. The consumer
//! blocks on [`ArcBufferConsumer::wait`] until the frontier moves, walks the
//! new arcs under a short-lived lock, and releases frames it has fully
//! rescored so their memory can be reclaimed.
//!
//! The two halves are separate owned handles over one shared core, so the
//! producer/consumer protocol is enforced by the type system rather than by
//! convention.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace};

use crate::bptbl::{BpIdx, BpTable, WORST_SCORE};
use crate::dict::WordId;
use crate::error::{Result, TrellisError};

/// One word exit projected out of the backpointer table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WordArc {
    pub wid: WordId,
    /// First frame of the word.
    pub sf: u32,
    /// Last frame of the word.
    pub ef: u32,
    /// Forward pass scores, when the buffer was created with `keep_scores`.
    pub score: Option<ArcScore>,
}

/// Forward-pass score detail attached to an arc.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArcScore {
    /// Best path score over all right contexts.
    pub score: i32,
    /// Per-right-context path scores, sparse over the contexts actually
    /// reached.
    pub rc_scores: Vec<(u16, i32)>,
}

struct ArcBufferState {
    /// Arcs in start-frame order up to `committed_len`; the tail beyond it
    /// is the uncommitted window being filled by sweeps.
    arcs: std::collections::VecDeque<WordArc>,
    committed_len: usize,
    /// Global index of `arcs[0]`; release pops the front without disturbing
    /// the frame index values.
    arc_base: usize,
    /// Frame → global index of the first arc with `sf >= frame`, for frames
    /// `[first_sf, next_sf)`.
    sf_idx: std::collections::VecDeque<usize>,
    first_sf: u32,
    /// Committed frontier: every arc starting before this frame is present.
    next_sf: u32,
    /// Frontier the open window will commit to.
    target_sf: u32,
    /// Last frontier handed to the consumer by `wait`.
    consumer_sf: u32,
    window_open: bool,
    finalized: bool,
}

struct ArcBufferCore {
    name: String,
    keep_scores: bool,
    state: Mutex<ArcBufferState>,
    cond: Condvar,
}

/// Create a connected producer/consumer pair.
///
/// `keep_scores` controls whether swept arcs carry their forward-pass
/// scores; a purely word-level second pass can leave it off and halve the
/// arc size.
pub fn arc_buffer(name: impl Into<String>, keep_scores: bool) -> (ArcBufferProducer, ArcBufferConsumer) {
    let core = Arc::new(ArcBufferCore {
        name: name.into(),
        keep_scores,
        state: Mutex::new(ArcBufferState {
            arcs: std::collections::VecDeque::new(),
            committed_len: 0,
            arc_base: 0,
            sf_idx: std::collections::VecDeque::new(),
            first_sf: 0,
            next_sf: 0,
            target_sf: 0,
            consumer_sf: 0,
            window_open: false,
            finalized: false,
        }),
        cond: Condvar::new(),
    });
    (
        ArcBufferProducer {
            core: core.clone(),
            next_idx: 0,
            pending: Vec::new(),
        },
        ArcBufferConsumer { core },
    )
}

/// Writing half: owned by the decode worker.
pub struct ArcBufferProducer {
    core: Arc<ArcBufferCore>,
    /// Sweep cursor into the backpointer table's retired region.
    next_idx: BpIdx,
    /// Retired entries seen by an earlier sweep but starting at or past its
    /// target frame; re-examined on the next sweep.
    pending: Vec<BpIdx>,
}

impl ArcBufferProducer {
    /// Open (or widen) the fill window so the next `commit` advances the
    /// frontier to `next_sf`.
    pub fn extend(&mut self, next_sf: u32) {
        let mut st = self.core.state.lock();
        debug_assert!(next_sf >= st.next_sf, "arc window can only move forward");
        st.target_sf = st.target_sf.max(next_sf);
        st.window_open = true;
        trace!(name = %self.core.name, target_sf = st.target_sf, "arc window extended");
    }

    /// Project retired backpointer entries into the open window.
    ///
    /// Covers every entry retired since the previous sweep plus any entries
    /// deferred by it. Entries starting at or past the window target are
    /// deferred again. With `release`, retired entries below the sweep
    /// boundary are physically reclaimed from the table.
    ///
    /// Returns the boundary index: all entries below it have been turned
    /// into arcs.
    pub fn sweep(&mut self, bptbl: &mut BpTable, release: bool) -> Result<BpIdx> {
        let retired_end = bptbl.retired_idx();
        let (target_sf, next_sf) = {
            let st = self.core.state.lock();
            (st.target_sf, st.next_sf)
        };

        let mut batch = Vec::new();
        let mut deferred = Vec::new();
        let candidates = self
            .pending
            .drain(..)
            .chain(self.next_idx..retired_end)
            .collect::<Vec<_>>();
        for idx in candidates {
            let e = bptbl.ent(idx)?;
            // pruned entries retained as chain links are not arcs
            if !e.valid {
                continue;
            }
            if e.sf >= target_sf {
                deferred.push(idx);
                continue;
            }
            if e.sf < next_sf {
                error!(
                    name = %self.core.name,
                    idx,
                    sf = e.sf,
                    next_sf,
                    "retired entry starts behind the committed frontier"
                );
                return Err(TrellisError::FrameMismatch {
                    expected: next_sf,
                    found: e.sf,
                });
            }
            let score = if self.core.keep_scores {
                let rc_scores = bptbl
                    .rcscores(idx)?
                    .iter()
                    .enumerate()
                    .filter(|(_, &s)| s > WORST_SCORE)
                    .map(|(rc, &s)| (rc as u16, s))
                    .collect();
                Some(ArcScore {
                    score: e.score,
                    rc_scores,
                })
            } else {
                None
            };
            batch.push(WordArc {
                wid: e.wid,
                sf: e.sf,
                ef: e.ef,
                score,
            });
        }
        self.next_idx = retired_end;
        let boundary = deferred.iter().copied().min().unwrap_or(retired_end);
        self.pending = deferred;

        let n_arcs = batch.len();
        {
            let mut st = self.core.state.lock();
            st.arcs.extend(batch);
        }
        if release {
            bptbl.release(boundary);
        }
        debug!(
            name = %self.core.name,
            n_arcs,
            deferred = self.pending.len(),
            boundary,
            "swept retired entries"
        );
        Ok(boundary)
    }

    /// Close the window: sort and index the swept arcs, advance the
    /// committed frontier to the window target, and wake the consumer.
    pub fn commit(&mut self) {
        let mut st = self.core.state.lock();
        debug_assert!(st.window_open, "commit without an open arc window");
        let committed_len = st.committed_len;
        st.arcs
            .make_contiguous()[committed_len..]
            .sort_by_key(|a| a.sf);

        // Index the newly committed frames with one walk over the sorted
        // tail. Frames without arcs point at the next arc past them.
        let mut pos = committed_len;
        let (next_sf, target_sf) = (st.next_sf, st.target_sf);
        for f in next_sf..target_sf {
            while pos < st.arcs.len() && st.arcs[pos].sf < f {
                pos += 1;
            }
            let global = st.arc_base + pos;
            st.sf_idx.push_back(global);
        }

        st.committed_len = st.arcs.len();
        st.next_sf = target_sf;
        st.window_open = false;
        trace!(
            name = %self.core.name,
            next_sf = st.next_sf,
            committed = st.committed_len,
            "arc window committed"
        );
        drop(st);
        self.core.cond.notify_one();
    }

    /// Drain everything left in a finalized table, commit it, and mark the
    /// stream complete. Wakes the consumer unconditionally.
    pub fn finalize(&mut self, bptbl: &mut BpTable, release: bool) -> Result<()> {
        debug_assert!(bptbl.is_finalized(), "finalize the table before the arc stream");
        self.extend(bptbl.frame_idx());
        self.sweep(bptbl, release)?;
        self.commit();
        let mut st = self.core.state.lock();
        st.finalized = true;
        info!(
            name = %self.core.name,
            n_arcs = st.committed_len,
            next_sf = st.next_sf,
            "arc stream finalized"
        );
        drop(st);
        self.core.cond.notify_all();
        Ok(())
    }

    /// Empty the buffer for a new utterance. The consumer must be done with
    /// the previous one.
    pub fn reset(&mut self) {
        self.next_idx = 0;
        self.pending.clear();
        let mut st = self.core.state.lock();
        st.arcs.clear();
        st.committed_len = 0;
        st.arc_base = 0;
        st.sf_idx.clear();
        st.first_sf = 0;
        st.next_sf = 0;
        st.target_sf = 0;
        st.consumer_sf = 0;
        st.window_open = false;
        st.finalized = false;
    }
}

/// Reading half: owned by the second-pass thread.
pub struct ArcBufferConsumer {
    core: Arc<ArcBufferCore>,
}

impl ArcBufferConsumer {
    /// Block until the committed frontier moves past what this consumer has
    /// already seen, or the stream is finalized. Returns the frontier.
    ///
    /// `timeout`: `None` blocks indefinitely; `Some(Duration::ZERO)` polls.
    /// On timeout the current frontier is returned without being marked
    /// seen, so a later call still wakes for the same data.
    pub fn wait(&self, timeout: Option<Duration>) -> u32 {
        let mut st = self.core.state.lock();
        loop {
            if st.finalized || st.next_sf > st.consumer_sf {
                st.consumer_sf = st.next_sf;
                return st.next_sf;
            }
            match timeout {
                None => self.core.cond.wait(&mut st),
                Some(d) => {
                    if self.core.cond.wait_for(&mut st, d).timed_out() {
                        return st.next_sf;
                    }
                }
            }
        }
    }

    /// Take the buffer lock for iteration. Keep the guard short-lived; the
    /// producer blocks on it during sweeps.
    pub fn lock(&self) -> ArcBufferReader<'_> {
        ArcBufferReader {
            st: self.core.state.lock(),
        }
    }

    /// Reclaim all arcs starting before `first_sf`. Frames below it can no
    /// longer be iterated.
    pub fn release(&self, first_sf: u32) {
        let mut st = self.core.state.lock();
        let bound = first_sf.min(st.next_sf);
        if bound <= st.first_sf {
            return;
        }
        let keep_global = if bound == st.next_sf && (bound - st.first_sf) as usize >= st.sf_idx.len() {
            st.arc_base + st.committed_len
        } else {
            st.sf_idx[(bound - st.first_sf) as usize]
        };
        for _ in st.first_sf..bound {
            st.sf_idx.pop_front();
        }
        let drop_n = keep_global - st.arc_base;
        st.arcs.drain(..drop_n);
        st.arc_base = keep_global;
        st.committed_len -= drop_n;
        st.first_sf = bound;
        trace!(name = %self.core.name, first_sf = bound, dropped = drop_n, "arcs released");
    }
}

/// Locked view over the committed arcs.
pub struct ArcBufferReader<'a> {
    st: MutexGuard<'a, ArcBufferState>,
}

impl ArcBufferReader<'_> {
    /// Iterate committed arcs starting at frame `sf` or later, in start
    /// frame order. `None` if `sf` is outside the retained committed window.
    pub fn iter(&self, sf: u32) -> Option<ArcIter<'_>> {
        if sf < self.st.first_sf || sf >= self.st.next_sf {
            return None;
        }
        let pos = self.st.sf_idx[(sf - self.st.first_sf) as usize] - self.st.arc_base;
        Some(ArcIter {
            st: &*self.st,
            pos,
            end: self.st.committed_len,
        })
    }

    /// Committed frontier.
    pub fn next_sf(&self) -> u32 {
        self.st.next_sf
    }

    /// Oldest retained frame.
    pub fn first_sf(&self) -> u32 {
        self.st.first_sf
    }

    /// Whether the producer has finalized the stream.
    pub fn is_final(&self) -> bool {
        self.st.finalized
    }

    /// Number of committed arcs currently retained.
    pub fn len(&self) -> usize {
        self.st.committed_len
    }

    pub fn is_empty(&self) -> bool {
        self.st.committed_len == 0
    }
}

/// Iterator handed out by [`ArcBufferReader::iter`].
pub struct ArcIter<'a> {
    st: &'a ArcBufferState,
    pos: usize,
    end: usize,
}

impl<'a> Iterator for ArcIter<'a> {
    type Item = &'a WordArc;

    fn next(&mut self) -> Option<&'a WordArc> {
        if self.pos >= self.end {
            return None;
        }
        let arc = &self.st.arcs[self.pos];
        self.pos += 1;
        Some(arc)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rem = self.end - self.pos;
        (rem, Some(rem))
    }
}

impl ExactSizeIterator for ArcIter<'_> {}
