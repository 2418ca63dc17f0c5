//! Put-side state machine: consumes advertised RDMA targets, batches local
//! payload buffers into scatter/gather writes (splitting fragments when the
//! remote window is maxed out), and reports progress.

use std::collections::VecDeque;
use std::sync::Arc;

use rand::RngCore;
use tracing::{debug, info, warn};

use fab_wire::{
    AckMsg, ACK_LEN, INITIAL_LEN, InitialMsg, MAX_RIOVS, PROGRESS_LEN, ProgressMsg, RemoteIov,
    VectorMsg,
};

use crate::bringup::await_completion;
use crate::buffer::{
    BufPool, ByteBuf, CtrlBuf, FragPool, Fragment, Owner, Place, ProgressBuf, VectorBuf, XferCtx,
    next_xfer_id,
};
use crate::cancel::CancelToken;
use crate::control::{CTRL_DEPTH, RxCtrl, TxCtrl};
use crate::error::{Activity, Step, XferError};
use crate::fabric::{
    Access, CompFlags, CompStatus, Completion, CompletionQueue, Endpoint, Fabric, LocalIov,
    PeerAddr, WriteFlags, XferId, alloc_cell,
};
use crate::fifo::Fifo;
use crate::keys::KeySource;
use crate::session::{EofState, LoopStatus, SESSION_FIFO_DEPTH, SessionQueues};
use crate::terminal::{REF_LINE, Terminal};

/// An entry of the in-flight write chain: a whole payload buffer or a
/// fragment placeholder for a span of one.
pub enum WrEntry {
    Write(ByteBuf),
    Fragment(Fragment),
}

impl WrEntry {
    fn ctx(&self) -> &XferCtx {
        match self {
            WrEntry::Write(b) => &b.ctx,
            WrEntry::Fragment(f) => &f.ctx,
        }
    }

    fn ctx_mut(&mut self) -> &mut XferCtx {
        match self {
            WrEntry::Write(b) => &mut b.ctx,
            WrEntry::Fragment(f) => &mut f.ctx,
        }
    }

    pub fn xid(&self) -> XferId {
        self.ctx().xid
    }

    pub fn place(&self) -> Place {
        self.ctx().place
    }
}

pub struct Transmitter<F: Fabric> {
    fabric: Arc<F>,
    ep: F::Ep,
    cq: Arc<F::Cq>,
    peer: PeerAddr,
    keys: KeySource,
    pool: BufPool,
    frags: FragPool,
    reregister: bool,
    /// Remote segments one write may carry (1 in contiguous mode).
    rma_maxsegs: usize,
    /// Local segments one posting may carry.
    msg_maxsegs: usize,
    started: bool,
    cancelled: bool,
    eof: EofState,
    /// Bytes written since the last progress report.
    bytes_progress: u64,
    /// Buffers and fragments whose writes are in flight, oldest first.
    wrposted: Fifo<WrEntry>,
    vec_rx: RxCtrl<VectorBuf>,
    prog_tx: TxCtrl<ProgressBuf>,
    /// Bytes of the `ready_for_cxn` head already split off as fragments.
    frag_offset: usize,
    /// Selects the staging arrays the next write is prepared into.
    phase: usize,
    /// Double-buffered remote windows (at most [`MAX_RIOVS`] entries).
    riov: [Vec<RemoteIov>; 2],
    /// Double-buffered local scatter/gather staging.
    liov: [Vec<LocalIov>; 2],
    /// Fragments produced so far (observable for diagnostics).
    pub nfragments: u64,
    /// Peak outstanding-fragment count seen on any split parent.
    pub nchildren_peak: u8,
    /// Write postings issued so far.
    pub nwrites: u64,
}

impl<F: Fabric> Transmitter<F> {
    pub fn new(
        fabric: Arc<F>,
        ep: F::Ep,
        cq: Arc<F::Cq>,
        peer: PeerAddr,
        reregister: bool,
        contiguous: bool,
    ) -> Self {
        let info = fabric.info();
        let rma_maxsegs = if contiguous {
            1
        } else {
            info.rma_maxsegs.min(MAX_RIOVS)
        };
        Self {
            fabric,
            ep,
            cq,
            peer,
            keys: KeySource::new(),
            pool: BufPool::new(),
            frags: FragPool::new(),
            reregister,
            rma_maxsegs,
            msg_maxsegs: info.msg_maxsegs,
            started: false,
            cancelled: false,
            eof: EofState::default(),
            bytes_progress: 0,
            wrposted: Fifo::new(SESSION_FIFO_DEPTH),
            vec_rx: RxCtrl::new(),
            prog_tx: TxCtrl::new(),
            frag_offset: 0,
            phase: 0,
            riov: [Vec::new(), Vec::new()],
            liov: [Vec::new(), Vec::new()],
            nfragments: 0,
            nchildren_peak: 0,
            nwrites: 0,
        }
    }

    pub fn cq(&self) -> &Arc<F::Cq> {
        &self.cq
    }

    /// Fragments currently split off and not yet freed back to the pool.
    pub fn live_fragments(&self) -> usize {
        self.frags.outstanding()
    }

    pub fn eof(&self) -> EofState {
        self.eof
    }

    pub fn poll(
        &mut self,
        queues: &mut SessionQueues,
        terminal: &mut Terminal,
        token: &CancelToken,
    ) -> LoopStatus {
        if !self.started {
            if let Err(e) = self.start(queues, token) {
                warn!("transmitter start failed: {e}");
                self.ep.close();
                return LoopStatus::Error;
            }
            self.started = true;
        }
        match self.pass(queues, terminal, token) {
            Ok(_) => {
                if self.done() {
                    info!("transmit session complete");
                    self.ep.close();
                    LoopStatus::End
                } else {
                    LoopStatus::Continue
                }
            }
            Err(e) => {
                warn!("transmit session failed: {e}");
                self.ep.close();
                LoopStatus::Error
            }
        }
    }

    /// Seed the source with empty buffers, run the address handshake, and
    /// arm the vector receive pool.
    fn start(&mut self, queues: &mut SessionQueues, token: &CancelToken) -> Result<(), XferError> {
        // Stage two lines' worth of buffers; production runs ahead of the
        // advertised window.
        let mut total = 0;
        while total < 2 * REF_LINE.len() {
            let mut buf = self.pool.take();
            if !self.reregister {
                buf.ensure_registered(&*self.fabric, &mut self.keys, Access::Write)?;
            }
            total += buf.capacity();
            queues
                .ready_for_terminal
                .put(buf)
                .map_err(|_| XferError::Overflow("ready_for_terminal"))?;
        }

        // Arm the ack receive before the initial message can possibly be
        // answered.
        let ack_cell = alloc_cell(ACK_LEN);
        let ack_xid = next_xfer_id();
        self.ep.post_recv(&ack_cell, ACK_LEN, ack_xid)?;

        let mut nonce = [0u8; fab_wire::NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let initial = InitialMsg {
            nonce,
            nsources: 1,
            id: 0,
            addr: self.ep.name(),
        };
        let init_cell = alloc_cell(INITIAL_LEN);
        let init_xid = next_xfer_id();
        {
            let mut cell = init_cell.lock();
            initial.encode(&mut cell[..])?;
        }
        self.ep.send(self.peer, &init_cell, INITIAL_LEN, init_xid)?;

        // The initial send must settle first; anything else on the queue at
        // this point is a protocol error, not a process abort.
        let cmpl = await_completion(&*self.cq, token)?;
        if cmpl.xid != init_xid {
            return Err(XferError::Protocol(
                "completion arrived before the initial send settled".into(),
            ));
        }
        if !cmpl.flags.contains(CompFlags::SEND | CompFlags::MSG) {
            return Err(XferError::BadFlags(cmpl.flags));
        }

        let cmpl = await_completion(&*self.cq, token)?;
        if cmpl.xid != ack_xid || !cmpl.flags.contains(CompFlags::RECV | CompFlags::MSG) {
            return Err(XferError::Protocol("expected the handshake ack".into()));
        }
        let ack = {
            let cell = ack_cell.lock();
            AckMsg::decode(&cell[..cmpl.len])?
        };

        // The ack names the peer's real endpoint; drop the bootstrap entry.
        let bootstrap = self.peer;
        self.peer = self.ep.av_insert(&ack.addr)?;
        self.ep.av_remove(bootstrap)?;
        info!("handshake complete");

        self.vec_rx.post_all(&self.ep, CTRL_DEPTH)?;
        Ok(())
    }

    fn pass(
        &mut self,
        queues: &mut SessionQueues,
        terminal: &mut Terminal,
        token: &CancelToken,
    ) -> Step {
        let mut activity = self.drain_completion(queues)?;
        self.check_cancel(token);
        activity = activity.merge(self.unload_vectors()?);
        activity = activity.merge(
            terminal.trade(&mut queues.ready_for_terminal, &mut queues.ready_for_cxn)?,
        );
        activity = activity.merge(self.write_targets(queues)?);
        activity = activity.merge(self.progress_update(queues, terminal)?);
        activity = activity.merge(self.prog_tx.transmit(&self.ep, self.peer)?);
        Ok(activity)
    }

    fn drain_completion(&mut self, queues: &mut SessionQueues) -> Step {
        let Some(cmpl) = self.cq.read()? else {
            return Ok(Activity::Idle);
        };
        if self.vec_rx.head_xid() == Some(cmpl.xid) {
            self.vector_complete(&cmpl)?;
        } else if self.prog_tx.head_xid() == Some(cmpl.xid) {
            self.prog_tx.complete(&cmpl)?;
        } else if self.wrposted.peek().map(WrEntry::xid) == Some(cmpl.xid) {
            self.write_complete(&cmpl, queues)?;
        } else {
            return Err(XferError::Protocol(format!(
                "completion {} matches no posted context",
                cmpl.xid
            )));
        }
        Ok(Activity::Advanced)
    }

    fn vector_complete(&mut self, cmpl: &Completion) -> Result<(), XferError> {
        let buf = self.vec_rx.complete(cmpl)?;
        if cmpl.status == CompStatus::Canceled {
            return Ok(());
        }
        let malformed = {
            let cell = buf.cell().lock();
            VectorMsg::decode(&cell[..cmpl.len]).err()
        };
        if let Some(e) = malformed {
            // Malformed but recoverable: repost without touching state.
            warn!("malformed vector message: {e}");
            if self.cancelled {
                return Ok(());
            }
            return self.vec_rx.post(&self.ep, buf);
        }
        self.vec_rx
            .rcvd
            .put(buf)
            .map_err(|_| XferError::Overflow("vector rcvd"))
    }

    /// Release the completed batch from the head of `wrposted`: fragments
    /// return to the pool and decrement their parent; whole buffers flow to
    /// the terminal, accumulating the progress counter.
    fn write_complete(
        &mut self,
        cmpl: &Completion,
        queues: &mut SessionQueues,
    ) -> Result<(), XferError> {
        {
            let head = self.wrposted.peek().expect("matched wrposted head");
            if !head.place().contains(Place::FIRST) {
                return Err(XferError::Protocol(
                    "write chain head does not start a batch".into(),
                ));
            }
            if cmpl.status != CompStatus::Canceled
                && !cmpl.flags.contains(CompFlags::RMA | CompFlags::WRITE)
                && !head.ctx().cancelled
            {
                return Err(XferError::BadFlags(cmpl.flags));
            }
        }
        loop {
            let mut entry = self
                .wrposted
                .get()
                .ok_or_else(|| XferError::Protocol("write batch truncated".into()))?;
            entry.ctx_mut().owner = Owner::Program;
            let last = entry.place().contains(Place::LAST);
            match entry {
                WrEntry::Fragment(frag) => {
                    frag.release_parent();
                    self.frags.put(frag);
                }
                WrEntry::Write(mut buf) => {
                    if buf.children() != 0 {
                        return Err(XferError::Protocol(
                            "payload released with live fragments".into(),
                        ));
                    }
                    self.bytes_progress += buf.nused as u64;
                    if self.reregister {
                        buf.release_mr();
                    }
                    queues
                        .ready_for_terminal
                        .put(buf)
                        .map_err(|_| XferError::Overflow("ready_for_terminal"))?;
                }
            }
            if last {
                break;
            }
        }
        Ok(())
    }

    fn check_cancel(&mut self, token: &CancelToken) {
        if token.is_cancelled() && !self.cancelled {
            info!("canceling transmit session");
            self.vec_rx.cancel(&self.ep);
            self.prog_tx.cancel(&self.ep);
            self.cancelled = true;
        }
    }

    /// Move received vector messages into the current remote window; an
    /// empty vector is the peer's EOF.
    fn unload_vectors(&mut self) -> Step {
        let mut activity = Activity::Idle;
        loop {
            let Some(head) = self.vec_rx.rcvd.peek() else {
                break;
            };
            let msg = {
                let cell = head.cell().lock();
                VectorMsg::decode(&cell[..head.nused()])
                    .map_err(|e| XferError::Protocol(format!("vector changed underfoot: {e}")))?
            };
            if msg.is_eof() {
                debug!("peer sent empty vector, remote end of stream");
                self.eof.remote = true;
            } else {
                if self.riov[self.phase].len() + msg.iovs.len() > MAX_RIOVS {
                    break;
                }
                self.riov[self.phase].extend(msg.iovs);
            }
            let buf = self.vec_rx.rcvd.get().expect("peeked head");
            if !self.cancelled {
                self.vec_rx.post(&self.ep, buf)?;
            }
            activity = Activity::Advanced;
        }
        Ok(activity)
    }

    /// Batch payload buffers from the head of `ready_for_cxn` into one
    /// scatter/gather write against the current remote window.
    fn write_targets(&mut self, queues: &mut SessionQueues) -> Step {
        if self.cancelled || self.eof.local {
            return Ok(Activity::Idle);
        }
        let window_len = self.riov[self.phase].len();
        if window_len == 0 {
            return Ok(Activity::Idle);
        }
        let maxbytes: u64 = self.riov[self.phase]
            .iter()
            .take(self.rma_maxsegs.min(window_len))
            .map(|r| r.len)
            .sum();
        let riovs_maxed = window_len >= self.rma_maxsegs;

        let mut batch: Vec<WrEntry> = Vec::new();
        let mut locals: Vec<LocalIov> = Vec::new();
        let mut total: u64 = 0;

        while self.wrposted.len() + batch.len() < self.wrposted.capacity() {
            let Some(head) = queues.ready_for_cxn.peek_mut() else {
                break;
            };
            let avail = (head.nused - self.frag_offset) as u64;
            if total + avail > maxbytes {
                if !riovs_maxed {
                    // More remote vectors are expected; prefer whole buffers.
                    break;
                }
                let take = (maxbytes - total) as usize;
                if take == 0 {
                    break;
                }
                head.ensure_registered(&*self.fabric, &mut self.keys, Access::Write)?;
                locals.push(LocalIov {
                    cell: head.cell().clone(),
                    offset: self.frag_offset,
                    len: take,
                    desc: head.desc().expect("registered buffer has a desc"),
                });
                let frag = self.frags.take(head, self.frag_offset, take);
                self.nchildren_peak = self.nchildren_peak.max(head.children());
                self.frag_offset += take;
                self.nfragments += 1;
                total = maxbytes;
                batch.push(WrEntry::Fragment(frag));
                break;
            } else {
                let mut buf = queues.ready_for_cxn.get().expect("peeked head");
                buf.ensure_registered(&*self.fabric, &mut self.keys, Access::Write)?;
                locals.push(LocalIov {
                    cell: buf.cell().clone(),
                    offset: self.frag_offset,
                    len: avail as usize,
                    desc: buf.desc().expect("registered buffer has a desc"),
                });
                total += avail;
                self.frag_offset = 0;
                batch.push(WrEntry::Write(buf));
                if total == maxbytes {
                    break;
                }
            }
        }
        if batch.is_empty() {
            return Ok(Activity::Idle);
        }

        for entry in &mut batch {
            entry.ctx_mut().owner = Owner::Nic;
            entry.ctx_mut().place = Place::NONE;
        }
        batch
            .first_mut()
            .expect("non-empty batch")
            .ctx_mut()
            .place
            .insert(Place::FIRST);
        batch
            .last_mut()
            .expect("non-empty batch")
            .ctx_mut()
            .place
            .insert(Place::LAST);
        let first_xid = batch[0].xid();
        for entry in batch {
            self.wrposted
                .put(entry)
                .map_err(|_| XferError::Overflow("wrposted"))?;
        }
        self.liov[self.phase] = locals;
        self.write_fully(first_xid, total)?;
        Ok(Activity::Advanced)
    }

    /// Issue the batch as one or more postings sliced to the common byte
    /// length under the per-call segment caps; only the final posting
    /// carries the completion. The unconsumed remote suffix lands in the
    /// phase-flipped arrays and the phase advances, so the next batch is
    /// prepared into arrays the NIC is no longer reading.
    fn write_fully(&mut self, xid: XferId, total: u64) -> Result<(), XferError> {
        let phase = self.phase;
        let mut local: VecDeque<LocalIov> = self.liov[phase].drain(..).collect();
        let mut remote: VecDeque<RemoteIov> = self.riov[phase].drain(..).collect();
        let mut remaining = total;
        while remaining > 0 {
            let lbytes: u64 = local
                .iter()
                .take(self.msg_maxsegs)
                .map(|l| l.len as u64)
                .sum();
            let rbytes: u64 = remote.iter().take(self.rma_maxsegs).map(|r| r.len).sum();
            let n = lbytes.min(rbytes).min(remaining);
            if n == 0 {
                return Err(XferError::Protocol(
                    "write stalled with bytes remaining".into(),
                ));
            }
            let lslice = take_local(&mut local, n);
            let rslice = take_remote(&mut remote, n);
            remaining -= n;
            let flags = if remaining == 0 {
                WriteFlags::COMPLETION | WriteFlags::DELIVERY_COMPLETE
            } else {
                WriteFlags::DELIVERY_COMPLETE
            };
            self.ep.writev(self.peer, &lslice, &rslice, xid, flags)?;
            self.nwrites += 1;
        }
        debug_assert!(local.is_empty());
        self.riov[phase ^ 1] = remote.into_iter().collect();
        self.liov[phase ^ 1].clear();
        self.phase ^= 1;
        Ok(())
    }

    /// Report freshly written bytes, and exactly one final report with
    /// `nleftover == 0` once the source is drained.
    fn progress_update(&mut self, queues: &SessionQueues, terminal: &Terminal) -> Step {
        if self.cancelled {
            return Ok(Activity::Idle);
        }
        let reached_eof =
            terminal.eof() && queues.ready_for_cxn.is_empty() && self.wrposted.is_empty();
        if self.bytes_progress == 0 && !(reached_eof && !self.eof.local) {
            return Ok(Activity::Idle);
        }
        let Some(mut pb) = self.prog_tx.take() else {
            return Ok(Activity::Idle);
        };
        let msg = ProgressMsg {
            nfilled: self.bytes_progress,
            nleftover: if reached_eof { 0 } else { 1 },
        };
        {
            let mut cell = pb.cell().lock();
            msg.encode(&mut cell[..])?;
        }
        pb.set_nused(PROGRESS_LEN);
        self.prog_tx.enqueue(pb)?;
        self.bytes_progress = 0;
        if reached_eof && !self.eof.local {
            self.eof.local = true;
            debug!("local end of stream reported");
        }
        Ok(Activity::Advanced)
    }

    fn done(&self) -> bool {
        if self.cancelled {
            return self.vec_rx.posted.is_empty()
                && self.prog_tx.posted.is_empty()
                && self.wrposted.is_empty();
        }
        self.eof.local && self.eof.remote && self.prog_tx.is_drained() && self.wrposted.is_empty()
    }
}

fn take_local(q: &mut VecDeque<LocalIov>, mut n: u64) -> Vec<LocalIov> {
    let mut out = Vec::new();
    while n > 0 {
        let mut seg = q.pop_front().expect("local byte accounting");
        if seg.len as u64 <= n {
            n -= seg.len as u64;
            out.push(seg);
        } else {
            let take = n as usize;
            let rest = LocalIov {
                cell: seg.cell.clone(),
                offset: seg.offset + take,
                len: seg.len - take,
                desc: seg.desc,
            };
            seg.len = take;
            out.push(seg);
            q.push_front(rest);
            n = 0;
        }
    }
    out
}

fn take_remote(q: &mut VecDeque<RemoteIov>, mut n: u64) -> Vec<RemoteIov> {
    let mut out = Vec::new();
    while n > 0 {
        let mut seg = q.pop_front().expect("remote byte accounting");
        if seg.len <= n {
            n -= seg.len;
            out.push(seg);
        } else {
            let rest = RemoteIov {
                addr: seg.addr + n,
                len: seg.len - n,
                key: seg.key,
            };
            seg.len = n;
            out.push(seg);
            q.push_front(rest);
            n = 0;
        }
    }
    out
}
