//! # fab-xfer
//!
//! A bulk-transfer engine for reliable-datagram fabrics with one-sided
//! writes: the receiver advertises registered target buffers in *vector*
//! messages, the transmitter lands payload in them with scatter/gather RDMA
//! writes and reports placement in *progress* messages, and both sides run
//! an explicit bidirectional EOF handshake.
//!
//! ## Architecture
//!
//! - **Zero-copy lifecycles**: every buffer is owned by exactly one queue;
//!   posting hands it to the NIC, the matching completion hands it back.
//! - **Flow control**: fixed-depth posted FIFOs on both control streams and
//!   a bounded in-flight write chain act as credit windows.
//! - **Fragmentation**: when the remote window is maxed out, a payload
//!   buffer is split into fragment placeholders; the parent is delivered
//!   only once its outstanding-fragment count drains to zero.
//! - **Double buffering**: two-phase scatter/gather staging lets a write be
//!   in flight while the next one is prepared.
//! - **Scheduling**: a bounded worker pool steps up to 8192 sessions over
//!   per-worker poll-sets, sleeping when idle.
//!
//! The fabric itself is abstracted behind [`fabric::Fabric`]; the
//! [`testing`] module ships an in-process loopback provider.

pub mod bringup;
pub mod buffer;
pub mod cancel;
pub mod control;
pub mod error;
pub mod fabric;
pub mod fifo;
pub mod keys;
pub mod mr;
pub mod receiver;
pub mod session;
pub mod terminal;
pub mod testing;
pub mod transmitter;
pub mod worker;

pub use bringup::{XferOpts, bringup_get, bringup_put};
pub use cancel::CancelToken;
pub use error::{Activity, Step, XferError};
pub use session::{LoopStatus, Session};
pub use terminal::{DEFAULT_REPS, REF_LINE, Sink, Source};
pub use worker::WorkerPool;
