use thiserror::Error;

use crate::fabric::{CompFlags, FabricError, XferId};
use fab_wire::WireError;

/// Errors that end a transfer session (or, for the pool variants, refuse
/// work). Soft conditions (`Again` on a send, `Canceled` completions on
/// flagged contexts) never surface here; they are absorbed by the per-pass
/// state machines.
#[derive(Debug, Error)]
pub enum XferError {
    #[error("fabric: {0}")]
    Fabric(#[from] FabricError),
    #[error("wire: {0}")]
    Wire(#[from] WireError),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("completion {got} does not match posted head {want}")]
    CompletionMismatch { want: XferId, got: XferId },
    #[error("unexpected completion flags {0:?}")]
    BadFlags(CompFlags),
    #[error("stream verification failed at byte {at}")]
    Verify { at: u64 },
    #[error("bytes arrived past end of stream")]
    Overrun,
    #[error("queue overflow: {0}")]
    Overflow(&'static str),
    #[error("operation canceled")]
    Canceled,
    #[error("session assignment is suspended")]
    PoolSuspended,
    #[error("worker pool is full")]
    PoolFull,
    #[error("one or more workers failed")]
    WorkerFailed,
}

/// Whether a pass step moved the session forward. Steps that had nothing to
/// do report `Idle`; the pass aggregate is informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Idle,
    Advanced,
}

impl Activity {
    pub fn merge(self, other: Activity) -> Activity {
        if self == Activity::Advanced || other == Activity::Advanced {
            Activity::Advanced
        } else {
            Activity::Idle
        }
    }
}

/// Three-valued step status: no activity, activity, or a session-fatal error.
pub type Step = Result<Activity, XferError>;
