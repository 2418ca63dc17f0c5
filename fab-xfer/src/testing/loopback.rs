//! A pair of fabric domains joined by an in-memory hub.
//!
//! Sends match the peer's posted receives (or wait in an unclaimed queue),
//! one-sided writes copy straight into regions registered by key, and every
//! operation's completion lands on the owning completion queue in posting
//! order. Knobs exist for shrinking the provider limits and for forcing
//! transient send failures, so tests can drive the fragmentation and
//! backpressure paths deterministically.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use fab_wire::MrKey;

use crate::fabric::{
    Access, CompFlags, CompStatus, Completion, CompletionQueue, Endpoint, Fabric, FabricError,
    FabricInfo, LocalIov, MemSeg, MrDesc, PayloadCell, PeerAddr, PollSet, RegisteredMr, WriteFlags,
    XferId,
};
use fab_wire::RemoteIov;

/// Provider limits reported by a loopback domain.
#[derive(Debug, Clone, Copy)]
pub struct LoopbackOptions {
    pub version: (u32, u32),
    pub mr_offset_addressing: bool,
    pub mr_maxsegs: usize,
    pub msg_maxsegs: usize,
    pub rma_maxsegs: usize,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            version: (1, 15),
            mr_offset_addressing: true,
            mr_maxsegs: 8,
            msg_maxsegs: 8,
            rma_maxsegs: 4,
        }
    }
}

struct PostedRecv {
    cell: PayloadCell,
    cap: usize,
    xid: XferId,
}

struct EpState {
    posted: VecDeque<PostedRecv>,
    unclaimed: VecDeque<Vec<u8>>,
    cq: Arc<LoopCq>,
    closed: bool,
}

#[derive(Default)]
struct HubState {
    eps: HashMap<u64, EpState>,
    mrs: HashMap<MrKey, Vec<MemSeg>>,
    next_ep: u64,
    /// Countdown of sends answered with `Again`.
    force_again: u32,
}

#[derive(Default)]
struct Hub {
    state: Mutex<HubState>,
}

impl Hub {
    fn push_cmpl(cq: &LoopCq, cmpl: Completion) {
        cq.queue.lock().push_back(cmpl);
    }

    /// Copy `bytes` into the registration `key` at zero-based `addr`,
    /// spilling across its segments as needed.
    fn apply_write(st: &HubState, key: MrKey, addr: u64, bytes: &[u8]) -> Result<(), FabricError> {
        let segs = st.mrs.get(&key).ok_or(FabricError::BadKey(key))?;
        let end = addr + bytes.len() as u64;
        let mut cursor = 0u64;
        for seg in segs {
            let seg_end = cursor + seg.len as u64;
            let lo = addr.max(cursor);
            let hi = end.min(seg_end);
            if lo < hi {
                let n = (hi - lo) as usize;
                let into = seg.offset + (lo - cursor) as usize;
                let from = (lo - addr) as usize;
                seg.cell.lock()[into..into + n].copy_from_slice(&bytes[from..from + n]);
            }
            cursor = seg_end;
        }
        if end > cursor {
            return Err(FabricError::Provider(format!(
                "write of {} bytes at {addr} overruns registration {key}",
                bytes.len()
            )));
        }
        Ok(())
    }
}

/// Completion queue of a loopback domain.
#[derive(Default)]
pub struct LoopCq {
    queue: Mutex<VecDeque<Completion>>,
}

impl CompletionQueue for LoopCq {
    fn read(&self) -> Result<Option<Completion>, FabricError> {
        Ok(self.queue.lock().pop_front())
    }
}

pub struct LoopPollSet {
    cqs: Vec<Arc<LoopCq>>,
}

impl PollSet for LoopPollSet {
    type Cq = LoopCq;

    fn add(&mut self, cq: &Arc<LoopCq>) -> Result<(), FabricError> {
        self.cqs.push(cq.clone());
        Ok(())
    }

    fn del(&mut self, cq: &Arc<LoopCq>) -> Result<(), FabricError> {
        self.cqs.retain(|c| !Arc::ptr_eq(c, cq));
        Ok(())
    }

    fn poll(&mut self) -> usize {
        self.cqs
            .iter()
            .filter(|cq| !cq.queue.lock().is_empty())
            .count()
    }
}

struct LoopMr {
    hub: Arc<Hub>,
    key: MrKey,
}

impl RegisteredMr for LoopMr {
    fn key(&self) -> MrKey {
        self.key
    }

    fn desc(&self) -> MrDesc {
        MrDesc(self.key.0)
    }
}

impl Drop for LoopMr {
    fn drop(&mut self) {
        self.hub.state.lock().mrs.remove(&self.key);
    }
}

pub struct LoopEp {
    hub: Arc<Hub>,
    id: u64,
    msg_maxsegs: usize,
    rma_maxsegs: usize,
}

impl Endpoint for LoopEp {
    fn name(&self) -> Vec<u8> {
        self.id.to_be_bytes().to_vec()
    }

    fn av_insert(&self, addr: &[u8]) -> Result<PeerAddr, FabricError> {
        let bytes: [u8; 8] = addr.try_into().map_err(|_| FabricError::BadAddr)?;
        let id = u64::from_be_bytes(bytes);
        let st = self.hub.state.lock();
        if !st.eps.contains_key(&id) {
            return Err(FabricError::Unreachable(format!("no endpoint {id}")));
        }
        Ok(PeerAddr(id))
    }

    fn av_remove(&self, _peer: PeerAddr) -> Result<(), FabricError> {
        Ok(())
    }

    fn post_recv(&self, cell: &PayloadCell, cap: usize, xid: XferId) -> Result<(), FabricError> {
        let mut st = self.hub.state.lock();
        let ep = st.eps.get_mut(&self.id).ok_or(FabricError::Closed)?;
        if ep.closed {
            return Err(FabricError::Closed);
        }
        if let Some(msg) = ep.unclaimed.pop_front() {
            let n = msg.len().min(cap);
            cell.lock()[..n].copy_from_slice(&msg[..n]);
            Hub::push_cmpl(
                &ep.cq,
                Completion {
                    xid,
                    flags: CompFlags::RECV | CompFlags::MSG,
                    len: n,
                    status: CompStatus::Ok,
                },
            );
        } else {
            ep.posted.push_back(PostedRecv {
                cell: cell.clone(),
                cap,
                xid,
            });
        }
        Ok(())
    }

    fn send(
        &self,
        peer: PeerAddr,
        cell: &PayloadCell,
        len: usize,
        xid: XferId,
    ) -> Result<(), FabricError> {
        let mut st = self.hub.state.lock();
        if st.force_again > 0 {
            st.force_again -= 1;
            return Err(FabricError::Again);
        }
        let bytes = cell.lock()[..len].to_vec();
        let dst = st
            .eps
            .get_mut(&peer.0)
            .ok_or_else(|| FabricError::Unreachable(format!("no endpoint {}", peer.0)))?;
        if dst.closed {
            return Err(FabricError::Closed);
        }
        if let Some(recv) = dst.posted.pop_front() {
            let n = bytes.len().min(recv.cap);
            recv.cell.lock()[..n].copy_from_slice(&bytes[..n]);
            Hub::push_cmpl(
                &dst.cq,
                Completion {
                    xid: recv.xid,
                    flags: CompFlags::RECV | CompFlags::MSG,
                    len: n,
                    status: CompStatus::Ok,
                },
            );
        } else {
            dst.unclaimed.push_back(bytes);
        }
        let src_cq = st.eps.get(&self.id).map(|e| e.cq.clone());
        if let Some(cq) = src_cq {
            Hub::push_cmpl(
                &cq,
                Completion {
                    xid,
                    flags: CompFlags::SEND | CompFlags::MSG,
                    len,
                    status: CompStatus::Ok,
                },
            );
        }
        Ok(())
    }

    fn writev(
        &self,
        _peer: PeerAddr,
        local: &[LocalIov],
        remote: &[RemoteIov],
        xid: XferId,
        flags: WriteFlags,
    ) -> Result<(), FabricError> {
        if local.len() > self.msg_maxsegs {
            return Err(FabricError::Provider(format!(
                "{} local segments exceed the posting limit {}",
                local.len(),
                self.msg_maxsegs
            )));
        }
        if remote.len() > self.rma_maxsegs {
            return Err(FabricError::Provider(format!(
                "{} remote segments exceed the write limit {}",
                remote.len(),
                self.rma_maxsegs
            )));
        }
        let mut payload = Vec::new();
        for seg in local {
            let cell = seg.cell.lock();
            payload.extend_from_slice(&cell[seg.offset..seg.offset + seg.len]);
        }
        let rlen: u64 = remote.iter().map(|r| r.len).sum();
        if rlen != payload.len() as u64 {
            return Err(FabricError::Provider(format!(
                "local {} vs remote {} byte mismatch",
                payload.len(),
                rlen
            )));
        }
        let st = self.hub.state.lock();
        let mut consumed = 0usize;
        for riov in remote {
            let n = riov.len as usize;
            Hub::apply_write(&st, riov.key, riov.addr, &payload[consumed..consumed + n])?;
            consumed += n;
        }
        if flags.contains(WriteFlags::COMPLETION) {
            if let Some(ep) = st.eps.get(&self.id) {
                Hub::push_cmpl(
                    &ep.cq,
                    Completion {
                        xid,
                        flags: CompFlags::RMA | CompFlags::WRITE,
                        len: payload.len(),
                        status: CompStatus::Ok,
                    },
                );
            }
        }
        Ok(())
    }

    fn cancel(&self, xid: XferId) {
        let mut st = self.hub.state.lock();
        let Some(ep) = st.eps.get_mut(&self.id) else {
            return;
        };
        let before = ep.posted.len();
        ep.posted.retain(|p| p.xid != xid);
        if ep.posted.len() != before {
            Hub::push_cmpl(
                &ep.cq,
                Completion {
                    xid,
                    flags: CompFlags::NONE,
                    len: 0,
                    status: CompStatus::Canceled,
                },
            );
        }
    }

    fn close(&self) {
        let mut st = self.hub.state.lock();
        if let Some(ep) = st.eps.get_mut(&self.id) {
            ep.closed = true;
            ep.posted.clear();
            ep.unclaimed.clear();
        }
    }
}

/// One loopback domain; create them in pairs over a shared hub.
pub struct LoopFabric {
    hub: Arc<Hub>,
    opts: LoopbackOptions,
}

impl LoopFabric {
    /// Fail the next `n` sends with `Again`.
    pub fn force_send_again(&self, n: u32) {
        self.hub.state.lock().force_again = n;
    }

    /// Endpoints live on the shared hub. Endpoint ids are handed out
    /// sequentially from zero, so tests can address the first endpoint as
    /// `0u64.to_be_bytes()` once this reports it exists.
    pub fn endpoint_count(&self) -> usize {
        self.hub.state.lock().eps.len()
    }
}

impl Fabric for LoopFabric {
    type Ep = LoopEp;
    type Cq = LoopCq;
    type Ps = LoopPollSet;

    fn info(&self) -> FabricInfo {
        FabricInfo {
            version: self.opts.version,
            mr_offset_addressing: self.opts.mr_offset_addressing,
            mr_maxsegs: self.opts.mr_maxsegs,
            msg_maxsegs: self.opts.msg_maxsegs,
            rma_maxsegs: self.opts.rma_maxsegs,
        }
    }

    fn cq(&self) -> Result<Arc<LoopCq>, FabricError> {
        Ok(Arc::new(LoopCq::default()))
    }

    fn endpoint(&self, cq: &Arc<LoopCq>) -> Result<LoopEp, FabricError> {
        let mut st = self.hub.state.lock();
        let id = st.next_ep;
        st.next_ep += 1;
        st.eps.insert(
            id,
            EpState {
                posted: VecDeque::new(),
                unclaimed: VecDeque::new(),
                cq: cq.clone(),
                closed: false,
            },
        );
        Ok(LoopEp {
            hub: self.hub.clone(),
            id,
            msg_maxsegs: self.opts.msg_maxsegs,
            rma_maxsegs: self.opts.rma_maxsegs,
        })
    }

    fn poll_set(&self) -> Result<LoopPollSet, FabricError> {
        Ok(LoopPollSet { cqs: Vec::new() })
    }

    fn register(
        &self,
        segs: Vec<MemSeg>,
        _access: Access,
        key: MrKey,
    ) -> Result<Box<dyn RegisteredMr>, FabricError> {
        if segs.is_empty() || segs.len() > self.opts.mr_maxsegs {
            return Err(FabricError::Provider(format!(
                "{} segments exceed the registration limit {}",
                segs.len(),
                self.opts.mr_maxsegs
            )));
        }
        self.hub.state.lock().mrs.insert(key, segs);
        Ok(Box::new(LoopMr {
            hub: self.hub.clone(),
            key,
        }))
    }
}

/// Two domains over one hub with default limits.
pub fn loopback_pair() -> (Arc<LoopFabric>, Arc<LoopFabric>) {
    loopback_pair_with(LoopbackOptions::default(), LoopbackOptions::default())
}

/// Two domains over one hub with per-side limits.
pub fn loopback_pair_with(
    a: LoopbackOptions,
    b: LoopbackOptions,
) -> (Arc<LoopFabric>, Arc<LoopFabric>) {
    let hub = Arc::new(Hub::default());
    (
        Arc::new(LoopFabric {
            hub: hub.clone(),
            opts: a,
        }),
        Arc::new(LoopFabric { hub, opts: b }),
    )
}
