//! Buffer families crossing the NIC boundary.
//!
//! Every posted object carries an [`XferCtx`]: the completion token, the
//! discriminant a completion is classified by, program/NIC ownership, batch
//! placement marks, and the cancelled flag. Payload buffers additionally
//! track their registration and a count of outstanding fragments.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use fab_wire::{MrKey, PROGRESS_LEN, VECTOR_CAP};

use crate::fabric::{
    Access, Fabric, FabricError, MrDesc, PayloadCell, RegisteredMr, XferId, alloc_cell,
};
use crate::keys::KeySource;
use crate::mr::register_buffer;

static NEXT_XFER_ID: AtomicU64 = AtomicU64::new(1);

/// Mint a fresh completion token.
pub fn next_xfer_id() -> XferId {
    XferId(NEXT_XFER_ID.fetch_add(1, Ordering::Relaxed))
}

/// What a completion for this context means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferKind {
    Progress,
    RdmaWrite,
    Vector,
    Fragment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Program,
    Nic,
}

/// Batch boundary marks for multi-buffer one-sided writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Place(u8);

impl Place {
    pub const NONE: Place = Place(0);
    pub const FIRST: Place = Place(1);
    pub const LAST: Place = Place(2);

    pub fn contains(self, other: Place) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Place) {
        self.0 |= other.0;
    }
}

/// Per-posting context; a completion's token downcasts back to the buffer
/// holding it via FIFO-head matching.
#[derive(Debug)]
pub struct XferCtx {
    pub xid: XferId,
    pub kind: XferKind,
    pub owner: Owner,
    pub place: Place,
    pub cancelled: bool,
}

impl XferCtx {
    pub fn new(kind: XferKind) -> Self {
        Self {
            xid: next_xfer_id(),
            kind,
            owner: Owner::Program,
            place: Place::NONE,
            cancelled: false,
        }
    }

    /// Fresh token and cleared marks for a recycled buffer.
    pub fn rearm(&mut self) {
        self.xid = next_xfer_id();
        self.owner = Owner::Program;
        self.place = Place::NONE;
        self.cancelled = false;
    }
}

/// Variable-length payload buffer.
pub struct ByteBuf {
    pub ctx: XferCtx,
    cell: PayloadCell,
    capacity: usize,
    pub nused: usize,
    mr: Option<Box<dyn RegisteredMr>>,
    nchildren: Arc<AtomicU8>,
}

impl std::fmt::Debug for ByteBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteBuf")
            .field("xid", &self.ctx.xid)
            .field("capacity", &self.capacity)
            .field("nused", &self.nused)
            .field("registered", &self.mr.is_some())
            .field("nchildren", &self.children())
            .finish()
    }
}

impl ByteBuf {
    pub fn new(capacity: usize) -> Self {
        Self {
            ctx: XferCtx::new(XferKind::RdmaWrite),
            cell: alloc_cell(capacity),
            capacity,
            nused: 0,
            mr: None,
            nchildren: Arc::new(AtomicU8::new(0)),
        }
    }

    pub fn cell(&self) -> &PayloadCell {
        &self.cell
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Register the whole buffer if it is not already in the data plane.
    /// Idempotent, so static and per-transfer modes share one call site.
    pub fn ensure_registered<F: Fabric>(
        &mut self,
        fabric: &F,
        keys: &mut KeySource,
        access: Access,
    ) -> Result<(), FabricError> {
        if self.mr.is_none() {
            self.mr = Some(register_buffer(fabric, &self.cell, self.capacity, access, keys)?);
        }
        Ok(())
    }

    pub fn mr_key(&self) -> Option<MrKey> {
        self.mr.as_ref().map(|mr| mr.key())
    }

    pub fn desc(&self) -> Option<MrDesc> {
        self.mr.as_ref().map(|mr| mr.desc())
    }

    /// Drop the registration (per-transfer mode, on leaving the data plane).
    pub fn release_mr(&mut self) {
        self.mr = None;
    }

    pub fn children(&self) -> u8 {
        self.nchildren.load(Ordering::Relaxed)
    }

    fn add_child(&self) {
        self.nchildren.fetch_add(1, Ordering::Relaxed);
    }

    fn children_handle(&self) -> Arc<AtomicU8> {
        self.nchildren.clone()
    }
}

/// Zero-payload placeholder standing in for a span of a parent payload
/// buffer inside a write batch. Holds only a non-owning back-reference: the
/// parent's child count is the one lifetime-controlling link.
#[derive(Debug)]
pub struct Fragment {
    pub ctx: XferCtx,
    nchildren: Arc<AtomicU8>,
    pub offset: usize,
    pub len: usize,
}

impl Fragment {
    /// Decrement the parent's outstanding-fragment count.
    pub fn release_parent(&self) {
        let prev = self.nchildren.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "fragment released twice");
    }
}

/// Common surface of the fixed-layout control buffers.
pub trait CtrlBuf: Send {
    fn alloc() -> Self;
    fn ctx(&self) -> &XferCtx;
    fn ctx_mut(&mut self) -> &mut XferCtx;
    fn cell(&self) -> &PayloadCell;
    fn capacity(&self) -> usize;
    fn nused(&self) -> usize;
    fn set_nused(&mut self, n: usize);
}

macro_rules! ctrl_buf {
    ($name:ident, $kind:expr, $cap:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug)]
        pub struct $name {
            pub ctx: XferCtx,
            cell: PayloadCell,
            nused: usize,
        }

        impl CtrlBuf for $name {
            fn alloc() -> Self {
                Self {
                    ctx: XferCtx::new($kind),
                    cell: alloc_cell($cap),
                    nused: 0,
                }
            }

            fn ctx(&self) -> &XferCtx {
                &self.ctx
            }

            fn ctx_mut(&mut self) -> &mut XferCtx {
                &mut self.ctx
            }

            fn cell(&self) -> &PayloadCell {
                &self.cell
            }

            fn capacity(&self) -> usize {
                $cap
            }

            fn nused(&self) -> usize {
                self.nused
            }

            fn set_nused(&mut self, n: usize) {
                debug_assert!(n <= $cap);
                self.nused = n;
            }
        }
    };
}

ctrl_buf!(
    ProgressBuf,
    XferKind::Progress,
    PROGRESS_LEN,
    "Carries exactly one progress message."
);
ctrl_buf!(
    VectorBuf,
    XferKind::Vector,
    VECTOR_CAP,
    "Carries one vector message (up to a full remote window)."
);

/// Payload capacities cycle through a few awkward primes to force interior
/// fragmentation and multi-segment registration paths.
pub const PAYLOAD_SIZE_CYCLE: [usize; 4] = [23, 29, 31, 37];

/// Free-list of payload buffers with a lazy replenisher.
#[derive(Debug, Default)]
pub struct BufPool {
    free: Vec<ByteBuf>,
    next_size: usize,
}

impl BufPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pop a spare buffer or allocate the next size in the cycle.
    pub fn take(&mut self) -> ByteBuf {
        if let Some(buf) = self.free.pop() {
            return buf;
        }
        let capacity = PAYLOAD_SIZE_CYCLE[self.next_size];
        self.next_size = (self.next_size + 1) % PAYLOAD_SIZE_CYCLE.len();
        ByteBuf::new(capacity)
    }

    pub fn put(&mut self, mut buf: ByteBuf) {
        debug_assert_eq!(buf.children(), 0, "pooled buffer has live fragments");
        buf.nused = 0;
        buf.ctx.rearm();
        self.free.push(buf);
    }
}

/// Recycler for fragment placeholders.
#[derive(Debug, Default)]
pub struct FragPool {
    free: Vec<Fragment>,
    live: usize,
}

impl FragPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fragments split off and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.live
    }

    /// Split `len` bytes off `parent` at `offset`, bumping its child count.
    pub fn take(&mut self, parent: &ByteBuf, offset: usize, len: usize) -> Fragment {
        parent.add_child();
        self.live += 1;
        match self.free.pop() {
            Some(mut frag) => {
                frag.ctx.rearm();
                frag.nchildren = parent.children_handle();
                frag.offset = offset;
                frag.len = len;
                frag
            }
            None => Fragment {
                ctx: XferCtx::new(XferKind::Fragment),
                nchildren: parent.children_handle(),
                offset,
                len,
            },
        }
    }

    pub fn put(&mut self, frag: Fragment) {
        debug_assert!(self.live > 0, "fragment returned twice");
        self.live -= 1;
        self.free.push(frag);
    }
}
