//! Command-line personalities: `fget` consumes a stream, `fput` produces
//! one. Exit status is zero only on a clean, verified transfer.

use std::io::{self, BufWriter};
use std::sync::Arc;

use clap::Parser;
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fab_xfer::{
    CancelToken, DEFAULT_REPS, Sink, Source, WorkerPool, XferOpts, bringup_get, bringup_put,
};

use crate::provider::TcpFabric;

/// Service port both personalities agree on.
pub const SERVICE_PORT: u16 = 4242;

/// Receive a bulk stream from a peer and verify it.
#[derive(Parser, Debug)]
#[command(name = "fget", version, about, long_about = None)]
pub struct GetArgs {
    /// Address to bind the listening endpoint to.
    #[arg(short = 'b', default_value = "0.0.0.0")]
    pub bind: String,

    /// Re-register payload regions on every transfer instead of once.
    #[arg(short = 'r')]
    pub reregister: bool,
}

/// Produce a bulk stream and send it to a peer.
#[derive(Parser, Debug)]
#[command(name = "fput", version, about, long_about = None)]
pub struct PutArgs {
    /// Re-register payload regions on every transfer instead of once.
    #[arg(short = 'r')]
    pub reregister: bool,

    /// Restrict each one-sided write to a single remote segment.
    #[arg(short = 'g')]
    pub contiguous: bool,

    /// Peer address (port defaults to the service port).
    pub peer: String,
}

fn init() -> CancelToken {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .try_init();
    let token = CancelToken::new();
    for sig in [SIGHUP, SIGINT, SIGQUIT, SIGTERM] {
        if let Err(e) = signal_hook::flag::register(sig, token.flag()) {
            error!("signal handler registration failed: {e}");
        }
    }
    token
}

pub fn run_get(args: GetArgs) -> i32 {
    let token = init();
    let fabric = match TcpFabric::listen(&args.bind, SERVICE_PORT) {
        Ok(f) => Arc::new(f),
        Err(e) => {
            error!("fabric bring-up failed: {e}");
            return 1;
        }
    };
    let opts = XferOpts {
        reregister: args.reregister,
        contiguous: false,
    };
    let sink = Sink::with_echo(DEFAULT_REPS, Box::new(BufWriter::new(io::stdout())));
    let session = match bringup_get(fabric.clone(), opts, sink, &token) {
        Ok(s) => s,
        Err(e) => {
            error!("bring-up failed: {e}");
            return 1;
        }
    };
    finish(fabric, session, token)
}

pub fn run_put(args: PutArgs) -> i32 {
    let token = init();
    let fabric = Arc::new(TcpFabric::connector());
    let opts = XferOpts {
        reregister: args.reregister,
        contiguous: args.contiguous,
    };
    let peer = if args.peer.contains(':') {
        args.peer.clone()
    } else {
        format!("{}:{SERVICE_PORT}", args.peer)
    };
    let source = Source::with_echo(DEFAULT_REPS, Box::new(BufWriter::new(io::stdout())));
    let session = match bringup_put(fabric.clone(), peer.as_bytes(), opts, source) {
        Ok(s) => s,
        Err(e) => {
            error!("bring-up failed: {e}");
            return 1;
        }
    };
    finish(fabric, session, token)
}

fn finish(
    fabric: Arc<TcpFabric>,
    session: fab_xfer::Session<TcpFabric>,
    token: CancelToken,
) -> i32 {
    let pool = WorkerPool::new(fabric, token.clone());
    if let Err(e) = pool.assign(session) {
        error!("session assignment failed: {e}");
        return 1;
    }
    let mut code = 0;
    if let Err(e) = pool.join_all() {
        error!("{e}");
        code = 1;
    }
    if token.is_cancelled() {
        info!("canceled by signal");
        code = 1;
    }
    if code == 0 {
        info!("transfer complete");
    }
    code
}
