use std::sync::Arc;

use fab_xfer::XferError;
use fab_xfer::buffer::{CtrlBuf, ProgressBuf};
use fab_xfer::control::{CTRL_DEPTH, RxCtrl, TxCtrl};
use fab_xfer::error::Activity;
use fab_xfer::fabric::{
    CompFlags, CompStatus, Completion, CompletionQueue, Endpoint, Fabric, PeerAddr,
};
use fab_xfer::testing::loopback_pair;

struct Pair<F: Fabric> {
    a_ep: F::Ep,
    a_cq: Arc<F::Cq>,
    b_ep: F::Ep,
    b_cq: Arc<F::Cq>,
    a_to_b: PeerAddr,
}

fn link() -> (
    Pair<fab_xfer::testing::LoopFabric>,
    Arc<fab_xfer::testing::LoopFabric>,
) {
    let (fabric, _other) = loopback_pair();
    let a_cq = fabric.cq().unwrap();
    let a_ep = fabric.endpoint(&a_cq).unwrap();
    let b_cq = fabric.cq().unwrap();
    let b_ep = fabric.endpoint(&b_cq).unwrap();
    let a_to_b = a_ep.av_insert(&b_ep.name()).unwrap();
    (
        Pair {
            a_ep,
            a_cq,
            b_ep,
            b_cq,
            a_to_b,
        },
        fabric,
    )
}

fn fill(buf: &mut ProgressBuf, byte: u8) {
    let cap = buf.capacity();
    buf.cell().lock()[..cap].fill(byte);
    buf.set_nused(cap);
}

#[test]
fn test_tx_sends_match_completions_in_order() {
    let (pair, _fabric) = link();
    let mut rx: RxCtrl<ProgressBuf> = RxCtrl::new();
    rx.post_all(&pair.b_ep, CTRL_DEPTH).unwrap();

    let mut tx: TxCtrl<ProgressBuf> = TxCtrl::new();
    for i in 0..3 {
        let mut buf = tx.take().unwrap();
        fill(&mut buf, i);
        tx.enqueue(buf).unwrap();
    }
    assert_eq!(
        tx.transmit(&pair.a_ep, pair.a_to_b).unwrap(),
        Activity::Advanced
    );
    assert_eq!(tx.in_flight(), 3);

    // Send completions drain the posted chain head-first back to the pool.
    for _ in 0..3 {
        let cmpl = pair.a_cq.read().unwrap().expect("send completion");
        tx.complete(&cmpl).unwrap();
    }
    assert!(tx.is_drained());

    // The receiver saw the three messages in transmit order.
    for i in 0..3 {
        let cmpl = pair.b_cq.read().unwrap().expect("recv completion");
        let buf = rx.complete(&cmpl).unwrap();
        assert_eq!(buf.nused(), buf.capacity());
        assert_eq!(buf.cell().lock()[0], i);
    }
}

#[test]
fn test_transmit_backs_off_on_again() {
    let (pair, fabric) = link();
    let mut rx: RxCtrl<ProgressBuf> = RxCtrl::new();
    rx.post_all(&pair.b_ep, CTRL_DEPTH).unwrap();

    let mut tx: TxCtrl<ProgressBuf> = TxCtrl::new();
    for _ in 0..2 {
        let mut buf = tx.take().unwrap();
        fill(&mut buf, 9);
        tx.enqueue(buf).unwrap();
    }
    fabric.force_send_again(1);
    // First pass stops at the transient failure without losing the message.
    tx.transmit(&pair.a_ep, pair.a_to_b).unwrap();
    assert_eq!(tx.in_flight(), 0);
    assert_eq!(tx.ready.len(), 2);
    // Next pass drains.
    assert_eq!(
        tx.transmit(&pair.a_ep, pair.a_to_b).unwrap(),
        Activity::Advanced
    );
    assert_eq!(tx.in_flight(), 2);
}

#[test]
fn test_rx_complete_rejects_wrong_flags() {
    let (pair, _fabric) = link();
    let mut rx: RxCtrl<ProgressBuf> = RxCtrl::new();
    rx.post(&pair.b_ep, ProgressBuf::alloc()).unwrap();
    let xid = rx.head_xid().unwrap();

    let bogus = Completion {
        xid,
        flags: CompFlags::SEND | CompFlags::MSG,
        len: 16,
        status: CompStatus::Ok,
    };
    match rx.complete(&bogus) {
        Err(XferError::BadFlags(_)) => {}
        other => panic!("expected flag rejection, got {other:?}"),
    }
}

#[test]
fn test_rx_complete_rejects_mismatched_context() {
    let (pair, _fabric) = link();
    let mut rx: RxCtrl<ProgressBuf> = RxCtrl::new();
    rx.post(&pair.b_ep, ProgressBuf::alloc()).unwrap();

    let cmpl = Completion {
        xid: fab_xfer::buffer::next_xfer_id(),
        flags: CompFlags::RECV | CompFlags::MSG,
        len: 16,
        status: CompStatus::Ok,
    };
    match rx.complete(&cmpl) {
        Err(XferError::CompletionMismatch { .. }) => {}
        other => panic!("expected context mismatch, got {other:?}"),
    }
}

#[test]
fn test_cancel_all_preserves_fifo_order() {
    let (pair, _fabric) = link();
    let mut rx: RxCtrl<ProgressBuf> = RxCtrl::new();
    rx.post_all(&pair.b_ep, 4).unwrap();

    rx.cancel(&pair.b_ep);
    // Four canceled completions, absorbed in the same order they were
    // posted.
    for _ in 0..4 {
        let cmpl = pair.b_cq.read().unwrap().expect("canceled completion");
        assert_eq!(cmpl.status, CompStatus::Canceled);
        let buf = rx.complete(&cmpl).unwrap();
        assert!(buf.ctx().cancelled);
    }
    assert!(rx.posted.is_empty());
    assert!(pair.b_cq.read().unwrap().is_none());
}
