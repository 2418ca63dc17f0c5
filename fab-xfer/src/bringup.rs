//! Personality bring-up: fabric checks, the get-side half of the address
//! handshake, and session construction.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use fab_wire::{ACK_LEN, AckMsg, INITIAL_LEN, InitialMsg};

use crate::buffer::next_xfer_id;
use crate::cancel::CancelToken;
use crate::error::XferError;
use crate::fabric::{
    CompFlags, Completion, CompletionQueue, Endpoint, Fabric, MIN_FABRIC_VERSION, alloc_cell,
};
use crate::receiver::Receiver;
use crate::session::Session;
use crate::terminal::{Sink, Source};
use crate::transmitter::Transmitter;

/// Modes selected on the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct XferOpts {
    /// Re-register payload regions per transfer instead of once.
    pub reregister: bool,
    /// Restrict remote windows to one segment per write (put side).
    pub contiguous: bool,
}

/// Block until one completion arrives, polling the cancel token. Handshake
/// paths wait here with no deadline; a signal lifts them out.
pub fn await_completion<C: CompletionQueue>(
    cq: &C,
    token: &CancelToken,
) -> Result<Completion, XferError> {
    loop {
        if let Some(cmpl) = cq.read()? {
            return Ok(cmpl);
        }
        if token.is_cancelled() {
            return Err(XferError::Canceled);
        }
        std::thread::sleep(Duration::from_micros(50));
    }
}

/// Reject providers the engine cannot run against.
pub fn check_fabric<F: Fabric>(fabric: &F) -> Result<(), XferError> {
    let info = fabric.info();
    if info.version < MIN_FABRIC_VERSION {
        return Err(XferError::Protocol(format!(
            "fabric interface {}.{} is older than {}.{}",
            info.version.0, info.version.1, MIN_FABRIC_VERSION.0, MIN_FABRIC_VERSION.1
        )));
    }
    if !info.mr_offset_addressing {
        return Err(XferError::Protocol(
            "provider must address registrations by offset, not virtual address".into(),
        ));
    }
    if info.mr_maxsegs == 0 || info.msg_maxsegs == 0 || info.rma_maxsegs == 0 {
        return Err(XferError::Protocol("provider reports zero segment limits".into()));
    }
    Ok(())
}

/// Get-side bring-up: await a peer's initial message, answer with an ack,
/// and pair the receiver with its sink.
pub fn bringup_get<F: Fabric>(
    fabric: Arc<F>,
    opts: XferOpts,
    sink: Sink,
    token: &CancelToken,
) -> Result<Session<F>, XferError> {
    check_fabric(&*fabric)?;
    let cq = fabric.cq()?;
    let ep = fabric.endpoint(&cq)?;

    let init_cell = alloc_cell(INITIAL_LEN);
    let init_xid = next_xfer_id();
    ep.post_recv(&init_cell, INITIAL_LEN, init_xid)?;
    info!("awaiting peer");
    let cmpl = await_completion(&*cq, token)?;
    if cmpl.xid != init_xid || !cmpl.flags.contains(CompFlags::RECV | CompFlags::MSG) {
        return Err(XferError::Protocol("expected the peer's initial message".into()));
    }
    let initial = {
        let cell = init_cell.lock();
        InitialMsg::decode(&cell[..cmpl.len])?
    };
    if initial.nsources != 1 || initial.id != 0 {
        return Err(XferError::Protocol(format!(
            "unsupported fan-out: nsources={} id={}",
            initial.nsources, initial.id
        )));
    }
    debug!(addrlen = initial.addr.len(), "peer announced itself");
    let peer = ep.av_insert(&initial.addr)?;

    let ack_cell = alloc_cell(ACK_LEN);
    let ack_xid = next_xfer_id();
    {
        let mut cell = ack_cell.lock();
        AckMsg { addr: ep.name() }.encode(&mut cell[..])?;
    }
    ep.send(peer, &ack_cell, ACK_LEN, ack_xid)?;
    let cmpl = await_completion(&*cq, token)?;
    if cmpl.xid != ack_xid || !cmpl.flags.contains(CompFlags::SEND | CompFlags::MSG) {
        return Err(XferError::Protocol("ack send did not settle".into()));
    }
    info!("peer accepted");

    let receiver = Receiver::new(fabric, ep, cq, peer, opts.reregister);
    Ok(Session::get(receiver, sink))
}

/// Put-side bring-up: resolve the bootstrap peer address and pair the
/// transmitter with its source. The handshake itself runs on the
/// transmitter's first pass.
pub fn bringup_put<F: Fabric>(
    fabric: Arc<F>,
    peer_addr: &[u8],
    opts: XferOpts,
    source: Source,
) -> Result<Session<F>, XferError> {
    check_fabric(&*fabric)?;
    let cq = fabric.cq()?;
    let ep = fabric.endpoint(&cq)?;
    let peer = ep.av_insert(peer_addr)?;
    let transmitter = Transmitter::new(fabric, ep, cq, peer, opts.reregister, opts.contiguous);
    Ok(Session::put(transmitter, source))
}
