use thiserror::Error;

use crate::dict::WordId;

/// All errors produced by trellis-core.
#[derive(Debug, Error)]
pub enum TrellisError {
    #[error("invalid capacity for {what}: {value}")]
    InvalidCapacity { what: &'static str, value: usize },

    #[error("backpointer index {index} out of range [{start}, {end})")]
    IndexOutOfRange {
        index: usize,
        start: usize,
        end: usize,
    },

    #[error("right-context index {rc} out of range (entry has {rc_count} slots)")]
    RcIndexOutOfRange { rc: usize, rc_count: usize },

    #[error("no valid exit found (wid: {wid:?})")]
    NoExit { wid: Option<WordId> },

    #[error("frame mismatch between swept sources: expected {expected}, found {found}")]
    FrameMismatch { expected: u32, found: u32 },

    #[error("search pass is already running")]
    AlreadyRunning,

    #[error("search pass is not running")]
    NotRunning,

    #[error("utterance result not ready — decode has not finished")]
    NotReady,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TrellisError>;
