//! # trellis-core
//!
//! Reusable two-pass speech-search core: the forward Viterbi backpointer
//! table and its streaming handoff to a second rescoring pass.
//!
//! ## Architecture
//!
//! ```text
//! FrameScorer → SearchDriver worker ─► BpTable (push_frame/enter/commit)
//!                     │                    │ retire + compact
//!                     │ every N frames     ▼
//!                     └────────► ArcBufferProducer (extend/sweep/commit)
//!                                          │ condvar signal
//!                                          ▼
//!                                ArcBufferConsumer (wait/iter/release)
//!                                          │
//!                                    second-pass thread
//! ```
//!
//! The decode worker is the only writer of the backpointer table. The arc
//! buffer decouples it from the rescoring thread: committed word exits are
//! projected into lightweight arcs, grouped by start frame, and handed off
//! under a single lock with single-consumer wait/signal semantics.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod arcs;
pub mod bptbl;
pub mod dict;
pub mod error;
pub mod search;

// Convenience re-exports for downstream crates
pub use arcs::{arc_buffer, ArcBufferConsumer, ArcBufferProducer, ArcScore, WordArc};
pub use bptbl::{BpEntry, BpIdx, BpTable, BpTableConfig, Hypothesis, SegIter, Segment};
pub use dict::{Dictionary, PhoneId, StaticDict, TiedStateMap, UniformTiedStateMap, WordId};
pub use error::TrellisError;
pub use search::{
    run_second_pass, FrameScorer, FrameScores, PassEvent, PassStatus, SearchConfig, SearchDriver,
    SecondPass, UttResult, WordExtender,
};
