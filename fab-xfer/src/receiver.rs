//! Get-side state machine: advertises RDMA target buffers, consumes
//! progress reports, and feeds filled buffers to the sink.

use std::sync::Arc;

use tracing::{debug, info, warn};

use fab_wire::{MAX_RIOVS, ProgressMsg, RemoteIov, VectorMsg};

use crate::buffer::{BufPool, ByteBuf, CtrlBuf, Owner, ProgressBuf, VectorBuf};
use crate::cancel::CancelToken;
use crate::control::{CTRL_DEPTH, RxCtrl, TxCtrl};
use crate::error::{Activity, Step, XferError};
use crate::fabric::{Access, CompStatus, Completion, CompletionQueue, Endpoint, Fabric, PeerAddr};
use crate::fifo::Fifo;
use crate::keys::KeySource;
use crate::session::{EofState, LoopStatus, SessionQueues, SESSION_FIFO_DEPTH};
use crate::terminal::{REF_LINE, Terminal};

pub struct Receiver<F: Fabric> {
    fabric: Arc<F>,
    ep: F::Ep,
    cq: Arc<F::Cq>,
    peer: PeerAddr,
    keys: KeySource,
    pool: BufPool,
    reregister: bool,
    started: bool,
    cancelled: bool,
    eof: EofState,
    /// Bytes the peer reports placed but not yet distributed to targets.
    nfull: u64,
    /// Advertised targets awaiting fill, oldest first.
    tgtposted: Fifo<ByteBuf>,
    prog_rx: RxCtrl<ProgressBuf>,
    vec_tx: TxCtrl<VectorBuf>,
}

impl<F: Fabric> Receiver<F> {
    pub fn new(fabric: Arc<F>, ep: F::Ep, cq: Arc<F::Cq>, peer: PeerAddr, reregister: bool) -> Self {
        Self {
            fabric,
            ep,
            cq,
            peer,
            keys: KeySource::new(),
            pool: BufPool::new(),
            reregister,
            started: false,
            cancelled: false,
            eof: EofState::default(),
            nfull: 0,
            tgtposted: Fifo::new(SESSION_FIFO_DEPTH),
            prog_rx: RxCtrl::new(),
            vec_tx: TxCtrl::new(),
        }
    }

    pub fn cq(&self) -> &Arc<F::Cq> {
        &self.cq
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
            if let Err(e) = self.start(queues) {
                warn!("receiver start failed: {e}");
                self.ep.close();
                return LoopStatus::Error;
            }
            self.started = true;
        }
        match self.pass(queues, terminal, token) {
            Ok(_) => {
                if self.done(queues, terminal) {
                    info!("receive session complete");
                    self.ep.close();
                    LoopStatus::End
                } else {
                    LoopStatus::Continue
                }
            }
            Err(e) => {
                warn!("receive session failed: {e}");
                self.ep.close();
                LoopStatus::Error
            }
        }
    }

    /// Post the whole progress receive pool and seed the advertisement queue
    /// with payload buffers covering at least one reference line.
    fn start(&mut self, queues: &mut SessionQueues) -> Result<(), XferError> {
        self.prog_rx.post_all(&self.ep, CTRL_DEPTH)?;
        let mut total = 0;
        while total < REF_LINE.len() {
            let mut buf = self.pool.take();
            if !self.reregister {
                buf.ensure_registered(&*self.fabric, &mut self.keys, Access::RemoteWrite)?;
            }
            total += buf.capacity();
            queues
                .ready_for_cxn
                .put(buf)
                .map_err(|_| XferError::Overflow("ready_for_cxn"))?;
        }
        debug!(seeded = total, "receiver started");
        Ok(())
    }

    fn pass(
        &mut self,
        queues: &mut SessionQueues,
        terminal: &mut Terminal,
        token: &CancelToken,
    ) -> Step {
        let mut activity = self.drain_completion()?;
        self.check_cancel(token);
        activity = activity.merge(
            terminal.trade(&mut queues.ready_for_terminal, &mut queues.ready_for_cxn)?,
        );
        activity = activity.merge(self.vector_update(queues)?);
        activity = activity.merge(self.vec_tx.transmit(&self.ep, self.peer)?);
        activity = activity.merge(self.targets_read(queues)?);
        Ok(activity)
    }

    /// Drain at most one completion and dispatch it by context.
    fn drain_completion(&mut self) -> Step {
        let Some(cmpl) = self.cq.read()? else {
            return Ok(Activity::Idle);
        };
        if self.prog_rx.head_xid() == Some(cmpl.xid) {
            self.progress_complete(&cmpl)?;
        } else if self.vec_tx.head_xid() == Some(cmpl.xid) {
            self.vec_tx.complete(&cmpl)?;
        } else {
            return Err(XferError::Protocol(format!(
                "completion {} matches no posted context",
                cmpl.xid
            )));
        }
        Ok(Activity::Advanced)
    }

    fn progress_complete(&mut self, cmpl: &Completion) -> Result<(), XferError> {
        let buf = self.prog_rx.complete(cmpl)?;
        if cmpl.status == CompStatus::Canceled {
            // Absorbed: the buffer was flagged when the stream was cancelled.
            return Ok(());
        }
        let msg = {
            let cell = buf.cell().lock();
            ProgressMsg::decode(&cell[..cmpl.len])
        };
        match msg {
            Ok(p) => {
                self.nfull += p.nfilled;
                if p.nleftover == 0 {
                    debug!("peer reported end of stream");
                    self.eof.remote = true;
                }
            }
            // Malformed but recoverable: log, repost, no state change.
            Err(e) => warn!("malformed progress message: {e}"),
        }
        if self.cancelled {
            // No further receives once the stream is being torn down.
            return Ok(());
        }
        self.prog_rx.post(&self.ep, buf)
    }

    fn check_cancel(&mut self, token: &CancelToken) {
        if token.is_cancelled() && !self.cancelled {
            info!("canceling receive session");
            self.prog_rx.cancel(&self.ep);
            self.vec_tx.cancel(&self.ep);
            self.cancelled = true;
        }
    }

    /// Advertise free payload buffers as RDMA targets, or reply to the
    /// peer's EOF with the one empty vector.
    fn vector_update(&mut self, queues: &mut SessionQueues) -> Step {
        if self.cancelled {
            return Ok(Activity::Idle);
        }
        if self.eof.remote {
            if !self.eof.local {
                let Some(mut vb) = self.vec_tx.take() else {
                    return Ok(Activity::Idle);
                };
                let n = {
                    let mut cell = vb.cell().lock();
                    VectorMsg::default().encode(&mut cell[..])?
                };
                vb.set_nused(n);
                self.vec_tx.enqueue(vb)?;
                self.eof.local = true;
                debug!("sent empty vector, local end of stream");
                return Ok(Activity::Advanced);
            }
            return Ok(Activity::Idle);
        }

        let mut activity = Activity::Idle;
        while !queues.ready_for_cxn.is_empty()
            && !self.vec_tx.ready.is_full()
            && !self.tgtposted.is_full()
        {
            let Some(mut vb) = self.vec_tx.take() else {
                break;
            };
            let mut msg = VectorMsg::default();
            while msg.iovs.len() < MAX_RIOVS
                && !queues.ready_for_cxn.is_empty()
                && !self.tgtposted.is_full()
            {
                let mut buf = queues.ready_for_cxn.get().expect("non-empty fifo");
                buf.ensure_registered(&*self.fabric, &mut self.keys, Access::RemoteWrite)?;
                msg.iovs.push(RemoteIov {
                    addr: 0,
                    len: buf.capacity() as u64,
                    key: buf.mr_key().expect("registered buffer has a key"),
                });
                buf.ctx.owner = Owner::Nic;
                self.tgtposted
                    .put(buf)
                    .map_err(|_| XferError::Overflow("tgtposted"))?;
            }
            let n = {
                let mut cell = vb.cell().lock();
                msg.encode(&mut cell[..])?
            };
            vb.set_nused(n);
            self.vec_tx.enqueue(vb)?;
            activity = Activity::Advanced;
        }
        Ok(activity)
    }

    /// Distribute reported bytes into the oldest advertised targets; full
    /// buffers (and, at remote EOF, the partial head) go to the sink.
    fn targets_read(&mut self, queues: &mut SessionQueues) -> Step {
        let mut activity = Activity::Idle;
        while self.nfull > 0 {
            let Some(head) = self.tgtposted.peek_mut() else {
                break;
            };
            let room = (head.capacity() - head.nused) as u64;
            let take = room.min(self.nfull);
            head.nused += take as usize;
            self.nfull -= take;
            activity = Activity::Advanced;
            if head.nused == head.capacity() {
                self.release_target(queues)?;
            } else {
                break;
            }
        }
        if self.eof.remote && self.nfull == 0 {
            if let Some(head) = self.tgtposted.peek() {
                if head.nused > 0 {
                    self.release_target(queues)?;
                    activity = Activity::Advanced;
                }
            }
        }
        Ok(activity)
    }

    fn release_target(&mut self, queues: &mut SessionQueues) -> Result<(), XferError> {
        let mut buf = self.tgtposted.get().expect("non-empty tgtposted");
        buf.ctx.owner = Owner::Program;
        if self.reregister {
            buf.release_mr();
        }
        queues
            .ready_for_terminal
            .put(buf)
            .map_err(|_| XferError::Overflow("ready_for_terminal"))
    }

    fn done(&self, queues: &SessionQueues, terminal: &Terminal) -> bool {
        if self.cancelled {
            return self.prog_rx.posted.is_empty() && self.vec_tx.posted.is_empty();
        }
        terminal.eof()
            && queues.ready_for_terminal.is_empty()
            && self.eof.local
            && self.eof.remote
            && self.vec_tx.is_drained()
    }
}
