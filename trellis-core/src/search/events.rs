//! Progress events emitted by the search driver.
//!
//! Events are serialisable so an embedding application can forward them to a
//! UI or log sink unchanged.

use serde::{Deserialize, Serialize};

use crate::bptbl::Segment;

/// Lifecycle state of the first-pass worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PassStatus {
    /// No utterance in progress.
    Idle,
    /// Frames are being decoded and arcs streamed out.
    Decoding,
    /// Frame input exhausted; final sweep and hypothesis extraction running.
    Ending,
}

/// Emitted by the search driver as an utterance progresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum PassEvent {
    /// Worker lifecycle change.
    Status { status: PassStatus },
    /// The arc frontier advanced: all word arcs starting before `next_sf`
    /// are committed and visible to the second pass.
    Frontier { next_sf: u32 },
    /// Utterance finished; the best first-pass hypothesis is attached.
    ///
    /// `words` are spellings in utterance order. An utterance with no
    /// surviving exit produces an empty word list.
    Hypothesis {
        words: Vec<String>,
        score: i32,
        segments: Vec<Segment>,
        n_frames: u32,
    },
    /// The worker stopped on an error.
    Failed { message: String },
}
