use std::io::Write;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use fab_xfer::session::Conn;
use fab_xfer::terminal::REF_LINE;
use fab_xfer::testing::{LoopFabric, LoopbackOptions, loopback_pair_with};
use fab_xfer::{
    CancelToken, LoopStatus, Session, Sink, Source, XferError, XferOpts, bringup_get, bringup_put,
};

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn contents(&self) -> Vec<u8> {
        self.0.lock().clone()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct Harness {
    get: Session<LoopFabric>,
    put: Session<LoopFabric>,
    token: CancelToken,
    sink_out: SharedBuf,
}

/// Bring up a connected get/put pair over a loopback hub. The get side's
/// handshake half runs on a helper thread because it blocks awaiting the
/// transmitter's initial message.
fn start_pair(
    get_fab_opts: LoopbackOptions,
    put_fab_opts: LoopbackOptions,
    opts: XferOpts,
    nreps: u64,
) -> Harness {
    let _ = tracing_subscriber::fmt::try_init();
    let (gf, pf) = loopback_pair_with(get_fab_opts, put_fab_opts);
    let token = CancelToken::new();
    let sink_out = SharedBuf::default();

    let get_thread = {
        let gf = gf.clone();
        let token = token.clone();
        let out = sink_out.clone();
        thread::spawn(move || bringup_get(gf, opts, Sink::with_echo(nreps, Box::new(out)), &token))
    };
    // The get endpoint is always the hub's first; wait for it to exist so
    // the bootstrap address below resolves.
    while pf.endpoint_count() < 1 {
        thread::yield_now();
    }
    let mut put = bringup_put(pf, &0u64.to_be_bytes(), opts, Source::new(nreps)).unwrap();
    // The first pass runs the blocking handshake against the helper thread.
    assert_eq!(put.poll(&token), LoopStatus::Continue);
    let get = get_thread.join().unwrap().unwrap();
    Harness {
        get,
        put,
        token,
        sink_out,
    }
}

/// Alternate session passes until both sides finish.
fn drive(h: &mut Harness, limit: usize) -> (LoopStatus, LoopStatus) {
    let mut gs = LoopStatus::Continue;
    let mut ps = LoopStatus::Continue;
    for _ in 0..limit {
        if ps == LoopStatus::Continue {
            ps = h.put.poll(&h.token);
        }
        if gs == LoopStatus::Continue {
            gs = h.get.poll(&h.token);
        }
        if gs != LoopStatus::Continue && ps != LoopStatus::Continue {
            break;
        }
    }
    (gs, ps)
}

fn reference(nreps: usize) -> Vec<u8> {
    REF_LINE.repeat(nreps)
}

#[test]
fn test_full_round_trip_static_mr() {
    let mut h = start_pair(
        LoopbackOptions::default(),
        LoopbackOptions::default(),
        XferOpts::default(),
        10_000,
    );
    let (gs, ps) = drive(&mut h, 5_000_000);
    assert_eq!(gs, LoopStatus::End);
    assert_eq!(ps, LoopStatus::End);
    let bytes = h.sink_out.contents();
    assert_eq!(bytes.len(), 780_000);
    assert_eq!(bytes, reference(10_000));

    match h.get.conn() {
        Conn::Get(rx) => {
            let eof = rx.eof();
            assert!(eof.local && eof.remote, "both EOF signals must be seen");
        }
        Conn::Put(_) => unreachable!(),
    }
}

#[test]
fn test_reregister_mode_is_equivalent() {
    let nreps = 400;
    let mut h = start_pair(
        LoopbackOptions::default(),
        LoopbackOptions::default(),
        XferOpts {
            reregister: true,
            contiguous: false,
        },
        nreps,
    );
    let (gs, ps) = drive(&mut h, 1_000_000);
    assert_eq!((gs, ps), (LoopStatus::End, LoopStatus::End));
    assert_eq!(h.sink_out.contents(), reference(nreps as usize));
}

#[test]
fn test_contiguous_mode_forces_fragments() {
    let nreps = 200;
    let mut h = start_pair(
        LoopbackOptions::default(),
        LoopbackOptions::default(),
        XferOpts {
            reregister: false,
            contiguous: true,
        },
        nreps,
    );
    let (gs, ps) = drive(&mut h, 1_000_000);
    assert_eq!((gs, ps), (LoopStatus::End, LoopStatus::End));
    assert_eq!(h.sink_out.contents(), reference(nreps as usize));

    // Single-segment remote windows cannot hold most payload buffers, so
    // the transmitter must have split fragments off their parents, and the
    // parent child counts must have drained back to zero before delivery.
    match h.put.conn() {
        Conn::Put(tx) => {
            assert!(tx.nfragments > 0, "contiguous mode must fragment");
            assert!(tx.nwrites > 0);
            assert!(
                tx.nchildren_peak >= 1,
                "split parents must have carried live fragments"
            );
            assert_eq!(
                tx.live_fragments(),
                0,
                "every fragment must be freed and release its parent"
            );
        }
        Conn::Get(_) => unreachable!("put harness holds a transmitter"),
    }
}

#[test]
fn test_mismatched_window_sizes_still_complete() {
    // A tighter remote write limit on the put side changes the batching
    // geometry but not the bytes.
    let nreps = 150;
    let mut h = start_pair(
        LoopbackOptions::default(),
        LoopbackOptions {
            rma_maxsegs: 2,
            ..LoopbackOptions::default()
        },
        XferOpts::default(),
        nreps,
    );
    let (gs, ps) = drive(&mut h, 1_000_000);
    assert_eq!((gs, ps), (LoopStatus::End, LoopStatus::End));
    assert_eq!(h.sink_out.contents(), reference(nreps as usize));
}

#[test]
fn test_cancellation_drains_cleanly() {
    let mut h = start_pair(
        LoopbackOptions::default(),
        LoopbackOptions::default(),
        XferOpts::default(),
        10_000,
    );
    // Let the steady state establish, then pull the plug.
    for _ in 0..2_000 {
        h.put.poll(&h.token);
        h.get.poll(&h.token);
    }
    h.token.cancel();
    let (gs, ps) = drive(&mut h, 1_000_000);
    // Cancellation is not an error: both sides absorb their canceled
    // completions and end once their posted queues drain.
    assert_eq!(gs, LoopStatus::End);
    assert_eq!(ps, LoopStatus::End);
    assert!(h.sink_out.contents().len() < 780_000);
}

#[test]
fn test_cancel_during_prehandshake_wait() {
    let (gf, _pf) = loopback_pair_with(LoopbackOptions::default(), LoopbackOptions::default());
    let token = CancelToken::new();
    token.cancel();
    // No peer will ever arrive; the canceled token must lift the blocking
    // wait instead of hanging.
    match bringup_get(gf, XferOpts::default(), Sink::new(1), &token) {
        Err(XferError::Canceled) => {}
        Err(e) => panic!("expected cancellation, got Err({e:?})"),
        Ok(_) => panic!("expected cancellation, got Ok"),
    }
}

#[test]
fn test_put_to_absent_peer_fails() {
    let (_gf, pf) = loopback_pair_with(LoopbackOptions::default(), LoopbackOptions::default());
    // Nobody created endpoint 7; bring-up must fail with a fabric error.
    let r = bringup_put(
        pf,
        &7u64.to_be_bytes(),
        XferOpts::default(),
        Source::new(1),
    );
    assert!(matches!(r, Err(XferError::Fabric(_))));
}

#[test]
fn test_old_provider_rejected() {
    let (gf, _pf) = loopback_pair_with(
        LoopbackOptions {
            version: (1, 12),
            ..LoopbackOptions::default()
        },
        LoopbackOptions::default(),
    );
    let token = CancelToken::new();
    let r = bringup_get(gf, XferOpts::default(), Sink::new(1), &token);
    assert!(matches!(r, Err(XferError::Protocol(_))));
}

#[test]
fn test_virtual_address_mr_rejected() {
    let (gf, _pf) = loopback_pair_with(
        LoopbackOptions {
            mr_offset_addressing: false,
            ..LoopbackOptions::default()
        },
        LoopbackOptions::default(),
    );
    let token = CancelToken::new();
    let r = bringup_get(gf, XferOpts::default(), Sink::new(1), &token);
    assert!(matches!(r, Err(XferError::Protocol(_))));
}
