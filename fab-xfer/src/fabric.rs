//! Provider contract the engine is written against.
//!
//! The traits model a reliable-datagram fabric: endpoints with an address
//! vector, completion queues delivering per-operation completions in posting
//! order, poll-sets aggregating many completion queues, and keyed memory
//! registrations addressed by zero-based offsets. Anything satisfying these
//! semantics can carry a transfer; the crate ships an in-process loopback
//! provider under [`crate::testing`] and `fab-tcp` adds a socket-backed one.

use std::ops::BitOr;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use fab_wire::{MrKey, RemoteIov, wire_newtype};

wire_newtype!(
    XferId,
    u64,
    "Per-operation context token; completions carry it back to the poster."
);
wire_newtype!(
    PeerAddr,
    u64,
    "Resolved peer handle produced by address-vector insertion."
);
wire_newtype!(
    MrDesc,
    u64,
    "Opaque local descriptor of a memory registration."
);

/// Shared payload storage. A queue owns the buffer object while a clone of
/// the cell lets a registration (and so the provider) reach the bytes: the
/// program/NIC ownership handoff without aliasing the buffer itself.
pub type PayloadCell = Arc<Mutex<Box<[u8]>>>;

pub fn alloc_cell(len: usize) -> PayloadCell {
    Arc::new(Mutex::new(vec![0u8; len].into_boxed_slice()))
}

/// Completion flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompFlags(pub u32);

impl CompFlags {
    pub const NONE: CompFlags = CompFlags(0);
    pub const MSG: CompFlags = CompFlags(1 << 0);
    pub const RMA: CompFlags = CompFlags(1 << 1);
    pub const SEND: CompFlags = CompFlags(1 << 2);
    pub const RECV: CompFlags = CompFlags(1 << 3);
    pub const WRITE: CompFlags = CompFlags(1 << 4);

    pub fn contains(self, other: CompFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CompFlags {
    type Output = CompFlags;
    fn bitor(self, rhs: CompFlags) -> CompFlags {
        CompFlags(self.0 | rhs.0)
    }
}

/// Flags for one-sided write postings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteFlags(pub u32);

impl WriteFlags {
    pub const NONE: WriteFlags = WriteFlags(0);
    /// Generate a completion for this posting.
    pub const COMPLETION: WriteFlags = WriteFlags(1 << 0);
    /// Completion means the payload is placed at the target, not merely sent.
    pub const DELIVERY_COMPLETE: WriteFlags = WriteFlags(1 << 1);

    pub fn contains(self, other: WriteFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for WriteFlags {
    type Output = WriteFlags;
    fn bitor(self, rhs: WriteFlags) -> WriteFlags {
        WriteFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompStatus {
    Ok,
    /// The posting was fabric-cancelled; the context decides whether the
    /// completion is absorbed or a protocol error.
    Canceled,
}

/// One completion-queue entry.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub xid: XferId,
    pub flags: CompFlags,
    pub len: usize,
    pub status: CompStatus,
}

/// Access requested for a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Local source for sends and one-sided writes.
    Write,
    /// Target of peer one-sided writes.
    RemoteWrite,
}

/// One local scatter/gather segment of a posting.
#[derive(Clone)]
pub struct LocalIov {
    pub cell: PayloadCell,
    pub offset: usize,
    pub len: usize,
    pub desc: MrDesc,
}

impl std::fmt::Debug for LocalIov {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIov")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("desc", &self.desc)
            .finish()
    }
}

/// One memory span handed to [`Fabric::register`].
#[derive(Clone)]
pub struct MemSeg {
    pub cell: PayloadCell,
    pub offset: usize,
    pub len: usize,
}

/// Provider limits and mode bits checked at bring-up.
#[derive(Debug, Clone, Copy)]
pub struct FabricInfo {
    pub version: (u32, u32),
    /// Registrations are addressed by zero-based offset, not virtual address.
    pub mr_offset_addressing: bool,
    /// Segments accepted by one registration call.
    pub mr_maxsegs: usize,
    /// Local segments accepted by one posting.
    pub msg_maxsegs: usize,
    /// Remote segments accepted by one one-sided write.
    pub rma_maxsegs: usize,
}

/// Minimum provider interface version the engine accepts.
pub const MIN_FABRIC_VERSION: (u32, u32) = (1, 13);

#[derive(Debug, Error)]
pub enum FabricError {
    /// Transmit resources momentarily exhausted; retry on a later pass.
    #[error("resource temporarily unavailable")]
    Again,
    #[error("operation canceled")]
    Canceled,
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    #[error("endpoint closed")]
    Closed,
    #[error("unknown memory key {0}")]
    BadKey(MrKey),
    #[error("bad peer address")]
    BadAddr,
    #[error("provider error: {0}")]
    Provider(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A live memory registration. Dropping the handle releases it.
pub trait RegisteredMr: Send + Sync {
    fn key(&self) -> MrKey;
    fn desc(&self) -> MrDesc;
}

/// Completion queue. Entries for operations posted to one endpoint are
/// delivered in posting order; the engine leans on this to match completions
/// against FIFO heads.
pub trait CompletionQueue: Send + Sync + 'static {
    fn read(&self) -> Result<Option<Completion>, FabricError>;
}

/// Aggregate over many completion queues; `poll` is a readiness hint only.
pub trait PollSet: Send + 'static {
    type Cq: CompletionQueue;

    fn add(&mut self, cq: &Arc<Self::Cq>) -> Result<(), FabricError>;
    fn del(&mut self, cq: &Arc<Self::Cq>) -> Result<(), FabricError>;
    fn poll(&mut self) -> usize;
}

/// Reliable-datagram endpoint bound to a completion queue and an address
/// vector.
pub trait Endpoint: Send + 'static {
    /// This endpoint's opaque address bytes (at most the wire address cap).
    fn name(&self) -> Vec<u8>;

    fn av_insert(&self, addr: &[u8]) -> Result<PeerAddr, FabricError>;
    fn av_remove(&self, peer: PeerAddr) -> Result<(), FabricError>;

    fn post_recv(&self, cell: &PayloadCell, cap: usize, xid: XferId) -> Result<(), FabricError>;
    fn send(
        &self,
        peer: PeerAddr,
        cell: &PayloadCell,
        len: usize,
        xid: XferId,
    ) -> Result<(), FabricError>;

    /// One-sided scatter/gather write. Local and remote vectors must carry
    /// the same number of bytes and respect the per-call segment limits.
    fn writev(
        &self,
        peer: PeerAddr,
        local: &[LocalIov],
        remote: &[RemoteIov],
        xid: XferId,
        flags: WriteFlags,
    ) -> Result<(), FabricError>;

    /// Request cancellation of an in-flight posting. The cancel surfaces
    /// later as a completion with [`CompStatus::Canceled`].
    fn cancel(&self, xid: XferId);

    fn close(&self);
}

/// A fabric domain: the factory for endpoints, completion queues, poll-sets
/// and memory registrations.
pub trait Fabric: Send + Sync + 'static {
    type Ep: Endpoint;
    type Cq: CompletionQueue;
    type Ps: PollSet<Cq = Self::Cq>;

    fn info(&self) -> FabricInfo;
    fn cq(&self) -> Result<Arc<Self::Cq>, FabricError>;
    fn endpoint(&self, cq: &Arc<Self::Cq>) -> Result<Self::Ep, FabricError>;
    fn poll_set(&self) -> Result<Self::Ps, FabricError>;
    fn register(
        &self,
        segs: Vec<MemSeg>,
        access: Access,
        key: MrKey,
    ) -> Result<Box<dyn RegisteredMr>, FabricError>;
}
