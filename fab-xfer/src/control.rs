//! Control-message plumbing: posted receives and pending sends matched to
//! completions in FIFO order.

use tracing::debug;

use crate::buffer::{CtrlBuf, Owner};
use crate::error::{Activity, Step, XferError};
use crate::fabric::{CompFlags, CompStatus, Completion, Endpoint, FabricError, PeerAddr, XferId};
use crate::fifo::Fifo;

/// Depth of each control FIFO and of the posted-buffer pools.
pub const CTRL_DEPTH: usize = 16;

/// Receive side of a control stream.
#[derive(Debug)]
pub struct RxCtrl<B: CtrlBuf> {
    pub posted: Fifo<B>,
    pub rcvd: Fifo<B>,
}

impl<B: CtrlBuf> RxCtrl<B> {
    pub fn new() -> Self {
        Self {
            posted: Fifo::new(CTRL_DEPTH),
            rcvd: Fifo::new(CTRL_DEPTH),
        }
    }

    /// Hand a buffer to the NIC and append it to the posted chain.
    pub fn post<E: Endpoint>(&mut self, ep: &E, mut buf: B) -> Result<(), XferError> {
        let cap = buf.capacity();
        let xid = buf.ctx().xid;
        buf.ctx_mut().owner = Owner::Nic;
        ep.post_recv(buf.cell(), cap, xid)?;
        self.posted
            .put(buf)
            .map_err(|_| XferError::Overflow("control rx posted"))
    }

    /// Post the whole pool of `n` fresh buffers.
    pub fn post_all<E: Endpoint>(&mut self, ep: &E, n: usize) -> Result<(), XferError> {
        for _ in 0..n {
            self.post(ep, B::alloc())?;
        }
        Ok(())
    }

    /// Token of the oldest posted buffer, for completion classification.
    pub fn head_xid(&self) -> Option<XferId> {
        self.posted.peek().map(|b| b.ctx().xid)
    }

    /// Match a completion against the posted head. Fails fast when flags
    /// lack RECV|MSG and the context is not flagged cancelled; otherwise
    /// dequeues the head, asserts the token matches, records the received
    /// length, and returns the buffer.
    pub fn complete(&mut self, cmpl: &Completion) -> Result<B, XferError> {
        let mut head = self
            .posted
            .get()
            .ok_or_else(|| XferError::Protocol("receive completion with nothing posted".into()))?;
        if head.ctx().xid != cmpl.xid {
            return Err(XferError::CompletionMismatch {
                want: head.ctx().xid,
                got: cmpl.xid,
            });
        }
        if !cmpl.flags.contains(CompFlags::RECV | CompFlags::MSG) && !head.ctx().cancelled {
            return Err(XferError::BadFlags(cmpl.flags));
        }
        head.ctx_mut().owner = Owner::Program;
        head.set_nused(cmpl.len.min(head.capacity()));
        Ok(head)
    }

    /// Fabric-cancel every posted buffer in place, preserving order so the
    /// canceled completions still match head-first.
    pub fn cancel<E: Endpoint>(&mut self, ep: &E) {
        self.posted.for_each_mut(|buf| {
            ep.cancel(buf.ctx().xid);
            buf.ctx_mut().cancelled = true;
        });
    }
}

impl<B: CtrlBuf> Default for RxCtrl<B> {
    fn default() -> Self {
        Self::new()
    }
}

/// Send side of a control stream with a pool of spare buffers.
#[derive(Debug)]
pub struct TxCtrl<B: CtrlBuf> {
    pub ready: Fifo<B>,
    pub posted: Fifo<B>,
    pool: Vec<B>,
}

impl<B: CtrlBuf> TxCtrl<B> {
    pub fn new() -> Self {
        let pool = (0..CTRL_DEPTH).map(|_| B::alloc()).collect();
        Self {
            ready: Fifo::new(CTRL_DEPTH),
            posted: Fifo::new(CTRL_DEPTH),
            pool,
        }
    }

    /// A spare buffer, if the pool has one.
    pub fn take(&mut self) -> Option<B> {
        self.pool.pop()
    }

    /// Queue a filled buffer for transmission.
    pub fn enqueue(&mut self, buf: B) -> Result<(), XferError> {
        self.ready
            .put(buf)
            .map_err(|_| XferError::Overflow("control tx ready"))
    }

    pub fn head_xid(&self) -> Option<XferId> {
        self.posted.peek().map(|b| b.ctx().xid)
    }

    pub fn in_flight(&self) -> usize {
        self.posted.len()
    }

    pub fn is_drained(&self) -> bool {
        self.ready.is_empty() && self.posted.is_empty()
    }

    /// Drain `ready` into fabric sends while `posted` has room, stopping on
    /// transient exhaustion.
    pub fn transmit<E: Endpoint>(&mut self, ep: &E, peer: PeerAddr) -> Step {
        let mut activity = Activity::Idle;
        while !self.posted.is_full() && !self.ready.is_empty() {
            let head = self.ready.peek().expect("non-empty ready fifo");
            match ep.send(peer, head.cell(), head.nused(), head.ctx().xid) {
                Ok(()) => {
                    let mut buf = self.ready.get().expect("non-empty ready fifo");
                    buf.ctx_mut().owner = Owner::Nic;
                    self.posted
                        .put(buf)
                        .map_err(|_| XferError::Overflow("control tx posted"))?;
                    activity = Activity::Advanced;
                }
                Err(FabricError::Again) => {
                    debug!("send backpressure, retrying next pass");
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(activity)
    }

    /// Match a send completion against the posted head and return the buffer
    /// to the pool. Requires SEND|MSG unless the context was cancelled.
    pub fn complete(&mut self, cmpl: &Completion) -> Result<(), XferError> {
        let mut head = self
            .posted
            .get()
            .ok_or_else(|| XferError::Protocol("send completion with nothing posted".into()))?;
        if head.ctx().xid != cmpl.xid {
            return Err(XferError::CompletionMismatch {
                want: head.ctx().xid,
                got: cmpl.xid,
            });
        }
        if !cmpl.flags.contains(CompFlags::SEND | CompFlags::MSG)
            && !(head.ctx().cancelled || cmpl.status == CompStatus::Canceled)
        {
            return Err(XferError::BadFlags(cmpl.flags));
        }
        head.ctx_mut().owner = Owner::Program;
        head.ctx_mut().rearm();
        self.pool.push(head);
        Ok(())
    }

    pub fn cancel<E: Endpoint>(&mut self, ep: &E) {
        self.posted.for_each_mut(|buf| {
            ep.cancel(buf.ctx().xid);
            buf.ctx_mut().cancelled = true;
        });
    }
}

impl<B: CtrlBuf> Default for TxCtrl<B> {
    fn default() -> Self {
        Self::new()
    }
}
