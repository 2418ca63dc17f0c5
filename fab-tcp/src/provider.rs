//! The fabric contract carried over a single TCP connection.
//!
//! Two frame types flow on the stream: `MSG` carries a control message and
//! matches the peer's posted receives; `WRITE` carries a keyed span and is
//! applied straight into the registration it names, emulating a one-sided
//! write. Completions are queued locally: a send completes when its frame
//! is written out, which is the closest a stream socket comes to
//! delivery-complete semantics.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, warn};

use fab_wire::{MrKey, RemoteIov};
use fab_xfer::fabric::{
    Access, CompFlags, CompStatus, Completion, CompletionQueue, Endpoint, Fabric, FabricError,
    FabricInfo, LocalIov, MemSeg, MrDesc, PayloadCell, PeerAddr, PollSet, RegisteredMr,
    WriteFlags, XferId,
};

const FRAME_MSG: u8 = 1;
const FRAME_WRITE: u8 = 2;

struct PostedRecv {
    cell: PayloadCell,
    cap: usize,
    xid: XferId,
}

struct Conn {
    writer: Mutex<TcpStream>,
}

#[derive(Default)]
struct CoreState {
    conn: Option<Arc<Conn>>,
    cq: Option<Arc<TcpCq>>,
    posted: VecDeque<PostedRecv>,
    unclaimed: VecDeque<Vec<u8>>,
    mrs: HashMap<MrKey, Vec<MemSeg>>,
    local_name: Option<String>,
    closed: bool,
}

#[derive(Default)]
struct Core {
    state: Mutex<CoreState>,
}

impl Core {
    fn install_conn(self: &Arc<Self>, stream: TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        let conn = Arc::new(Conn {
            writer: Mutex::new(stream),
        });
        {
            let mut st = self.state.lock();
            st.conn = Some(conn);
        }
        let core = self.clone();
        thread::Builder::new()
            .name("fab-tcp-reader".into())
            .spawn(move || core.read_loop(reader))
            .expect("reader thread spawn");
        Ok(())
    }

    fn read_loop(&self, mut stream: TcpStream) {
        loop {
            match self.read_frame(&mut stream) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    let closed = self.state.lock().closed;
                    if !closed {
                        warn!("peer stream failed: {e}");
                    }
                    break;
                }
            }
        }
        let st = self.state.lock();
        if let Some(cq) = &st.cq {
            cq.broken.store(true, Ordering::SeqCst);
        }
    }

    /// Read and apply one frame; `Ok(false)` on orderly EOF.
    fn read_frame(&self, stream: &mut TcpStream) -> std::io::Result<bool> {
        let mut kind = [0u8; 1];
        if let Err(e) = stream.read_exact(&mut kind) {
            return if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Ok(false)
            } else {
                Err(e)
            };
        }
        match kind[0] {
            FRAME_MSG => {
                let len = read_u32(stream)? as usize;
                let mut bytes = vec![0u8; len];
                stream.read_exact(&mut bytes)?;
                self.deliver_msg(bytes);
            }
            FRAME_WRITE => {
                let key = MrKey(read_u64(stream)?);
                let addr = read_u64(stream)?;
                let len = read_u32(stream)? as usize;
                let mut bytes = vec![0u8; len];
                stream.read_exact(&mut bytes)?;
                if let Err(e) = self.apply_write(key, addr, &bytes) {
                    warn!("dropping stray one-sided write: {e}");
                }
            }
            other => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unknown frame type {other}"),
                ));
            }
        }
        Ok(true)
    }

    fn deliver_msg(&self, bytes: Vec<u8>) {
        let mut st = self.state.lock();
        if let Some(recv) = st.posted.pop_front() {
            let n = bytes.len().min(recv.cap);
            recv.cell.lock()[..n].copy_from_slice(&bytes[..n]);
            if let Some(cq) = &st.cq {
                cq.push(Completion {
                    xid: recv.xid,
                    flags: CompFlags::RECV | CompFlags::MSG,
                    len: n,
                    status: CompStatus::Ok,
                });
            }
        } else {
            st.unclaimed.push_back(bytes);
        }
    }

    fn apply_write(&self, key: MrKey, addr: u64, bytes: &[u8]) -> Result<(), FabricError> {
        let st = self.state.lock();
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

    fn conn(&self) -> Result<(Arc<Conn>, Option<Arc<TcpCq>>), FabricError> {
        let st = self.state.lock();
        if st.closed {
            return Err(FabricError::Closed);
        }
        let conn = st.conn.clone().ok_or(FabricError::Closed)?;
        Ok((conn, st.cq.clone()))
    }
}

pub struct TcpCq {
    queue: Mutex<VecDeque<Completion>>,
    broken: AtomicBool,
}

impl TcpCq {
    fn push(&self, cmpl: Completion) {
        self.queue.lock().push_back(cmpl);
    }
}

impl CompletionQueue for TcpCq {
    fn read(&self) -> Result<Option<Completion>, FabricError> {
        if let Some(cmpl) = self.queue.lock().pop_front() {
            return Ok(Some(cmpl));
        }
        if self.broken.load(Ordering::SeqCst) {
            return Err(FabricError::Closed);
        }
        Ok(None)
    }
}

pub struct TcpPollSet {
    cqs: Vec<Arc<TcpCq>>,
}

impl PollSet for TcpPollSet {
    type Cq = TcpCq;

    fn add(&mut self, cq: &Arc<TcpCq>) -> Result<(), FabricError> {
        self.cqs.push(cq.clone());
        Ok(())
    }

    fn del(&mut self, cq: &Arc<TcpCq>) -> Result<(), FabricError> {
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

struct TcpMr {
    core: Arc<Core>,
    key: MrKey,
}

impl RegisteredMr for TcpMr {
    fn key(&self) -> MrKey {
        self.key
    }

    fn desc(&self) -> MrDesc {
        MrDesc(self.key.0)
    }
}

impl Drop for TcpMr {
    fn drop(&mut self) {
        self.core.state.lock().mrs.remove(&self.key);
    }
}

pub struct TcpEp {
    core: Arc<Core>,
}

impl Endpoint for TcpEp {
    fn name(&self) -> Vec<u8> {
        self.core
            .state
            .lock()
            .local_name
            .clone()
            .unwrap_or_default()
            .into_bytes()
    }

    fn av_insert(&self, addr: &[u8]) -> Result<PeerAddr, FabricError> {
        let text = std::str::from_utf8(addr).map_err(|_| FabricError::BadAddr)?;
        {
            let st = self.core.state.lock();
            if st.conn.is_some() {
                // One peer per endpoint: further inserts rebind to it.
                return Ok(PeerAddr(1));
            }
        }
        debug!(peer = text, "connecting");
        let stream = TcpStream::connect(text)
            .map_err(|e| FabricError::Unreachable(format!("{text}: {e}")))?;
        let local = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        self.core
            .install_conn(stream)
            .map_err(FabricError::Io)?;
        self.core.state.lock().local_name = Some(local);
        Ok(PeerAddr(1))
    }

    fn av_remove(&self, _peer: PeerAddr) -> Result<(), FabricError> {
        Ok(())
    }

    fn post_recv(&self, cell: &PayloadCell, cap: usize, xid: XferId) -> Result<(), FabricError> {
        let mut st = self.core.state.lock();
        if st.closed {
            return Err(FabricError::Closed);
        }
        if let Some(bytes) = st.unclaimed.pop_front() {
            let n = bytes.len().min(cap);
            cell.lock()[..n].copy_from_slice(&bytes[..n]);
            let cq = st.cq.clone();
            drop(st);
            if let Some(cq) = cq {
                cq.push(Completion {
                    xid,
                    flags: CompFlags::RECV | CompFlags::MSG,
                    len: n,
                    status: CompStatus::Ok,
                });
            }
        } else {
            st.posted.push_back(PostedRecv {
                cell: cell.clone(),
                cap,
                xid,
            });
        }
        Ok(())
    }

    fn send(
        &self,
        _peer: PeerAddr,
        cell: &PayloadCell,
        len: usize,
        xid: XferId,
    ) -> Result<(), FabricError> {
        let (conn, cq) = self.core.conn()?;
        let bytes = cell.lock()[..len].to_vec();
        {
            let mut w = conn.writer.lock();
            w.write_all(&[FRAME_MSG])?;
            w.write_all(&(len as u32).to_be_bytes())?;
            w.write_all(&bytes)?;
        }
        if let Some(cq) = cq {
            cq.push(Completion {
                xid,
                flags: CompFlags::SEND | CompFlags::MSG,
                len,
                status: CompStatus::Ok,
            });
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
        let (conn, cq) = self.core.conn()?;
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
        {
            let mut w = conn.writer.lock();
            let mut consumed = 0usize;
            for riov in remote {
                let n = riov.len as usize;
                w.write_all(&[FRAME_WRITE])?;
                w.write_all(&riov.key.0.to_be_bytes())?;
                w.write_all(&riov.addr.to_be_bytes())?;
                w.write_all(&(n as u32).to_be_bytes())?;
                w.write_all(&payload[consumed..consumed + n])?;
                consumed += n;
            }
        }
        if flags.contains(WriteFlags::COMPLETION) {
            if let Some(cq) = cq {
                cq.push(Completion {
                    xid,
                    flags: CompFlags::RMA | CompFlags::WRITE,
                    len: payload.len(),
                    status: CompStatus::Ok,
                });
            }
        }
        Ok(())
    }

    fn cancel(&self, xid: XferId) {
        let mut st = self.core.state.lock();
        let before = st.posted.len();
        st.posted.retain(|p| p.xid != xid);
        if st.posted.len() != before {
            if let Some(cq) = &st.cq {
                cq.push(Completion {
                    xid,
                    flags: CompFlags::NONE,
                    len: 0,
                    status: CompStatus::Canceled,
                });
            }
        }
    }

    fn close(&self) {
        let mut st = self.core.state.lock();
        st.closed = true;
        st.posted.clear();
        st.unclaimed.clear();
        if let Some(conn) = &st.conn {
            let _ = conn.writer.lock().shutdown(Shutdown::Both);
        }
    }
}

/// A TCP-backed fabric domain for one transfer peer.
pub struct TcpFabric {
    core: Arc<Core>,
    info: FabricInfo,
}

impl TcpFabric {
    fn default_info() -> FabricInfo {
        FabricInfo {
            version: (1, 15),
            mr_offset_addressing: true,
            mr_maxsegs: 8,
            msg_maxsegs: 8,
            rma_maxsegs: 4,
        }
    }

    /// Receiver personality: bind, accept exactly one peer in the
    /// background, and serve it.
    pub fn listen(bind: &str, port: u16) -> std::io::Result<Self> {
        let listener = TcpListener::bind((bind, port))?;
        let local = listener.local_addr()?.to_string();
        let core = Arc::new(Core::default());
        core.state.lock().local_name = Some(local.clone());
        debug!(addr = %local, "listening");
        let accept_core = core.clone();
        thread::Builder::new()
            .name("fab-tcp-accept".into())
            .spawn(move || match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "peer connected");
                    if let Err(e) = accept_core.install_conn(stream) {
                        warn!("failed to adopt peer stream: {e}");
                    }
                }
                Err(e) => warn!("accept failed: {e}"),
            })
            .expect("accept thread spawn");
        Ok(Self {
            core,
            info: Self::default_info(),
        })
    }

    /// Transmitter personality: the connection is made when the bootstrap
    /// peer address is inserted.
    pub fn connector() -> Self {
        Self {
            core: Arc::new(Core::default()),
            info: Self::default_info(),
        }
    }
}

impl Fabric for TcpFabric {
    type Ep = TcpEp;
    type Cq = TcpCq;
    type Ps = TcpPollSet;

    fn info(&self) -> FabricInfo {
        self.info
    }

    fn cq(&self) -> Result<Arc<TcpCq>, FabricError> {
        Ok(Arc::new(TcpCq {
            queue: Mutex::new(VecDeque::new()),
            broken: AtomicBool::new(false),
        }))
    }

    fn endpoint(&self, cq: &Arc<TcpCq>) -> Result<TcpEp, FabricError> {
        self.core.state.lock().cq = Some(cq.clone());
        Ok(TcpEp {
            core: self.core.clone(),
        })
    }

    fn poll_set(&self) -> Result<TcpPollSet, FabricError> {
        Ok(TcpPollSet { cqs: Vec::new() })
    }

    fn register(
        &self,
        segs: Vec<MemSeg>,
        _access: Access,
        key: MrKey,
    ) -> Result<Box<dyn RegisteredMr>, FabricError> {
        if segs.is_empty() || segs.len() > self.info.mr_maxsegs {
            return Err(FabricError::Provider(format!(
                "{} segments exceed the registration limit {}",
                segs.len(),
                self.info.mr_maxsegs
            )));
        }
        self.core.state.lock().mrs.insert(key, segs);
        Ok(Box::new(TcpMr {
            core: self.core.clone(),
            key,
        }))
    }
}

fn read_u32(stream: &mut TcpStream) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64(stream: &mut TcpStream) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    stream.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}
