//! A session pairs a connection state machine with a terminal through two
//! buffer queues.

use std::sync::Arc;

use crate::buffer::ByteBuf;
use crate::cancel::CancelToken;
use crate::fabric::Fabric;
use crate::fifo::Fifo;
use crate::receiver::Receiver;
use crate::terminal::{Sink, Source, Terminal};
use crate::transmitter::Transmitter;

/// Depth of the two session queues.
pub const SESSION_FIFO_DEPTH: usize = 64;

/// Explicit, bidirectional EOF state of a connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct EofState {
    pub local: bool,
    pub remote: bool,
}

/// Outcome of one session pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    Continue,
    End,
    Error,
}

/// Buffers in flight between the connection and the terminal.
#[derive(Debug)]
pub struct SessionQueues {
    /// Destined for the NIC: advertised as targets (get) or written (put).
    pub ready_for_cxn: Fifo<ByteBuf>,
    /// Destined for the terminal: verified (get) or refilled (put).
    pub ready_for_terminal: Fifo<ByteBuf>,
}

impl SessionQueues {
    pub fn new() -> Self {
        Self {
            ready_for_cxn: Fifo::new(SESSION_FIFO_DEPTH),
            ready_for_terminal: Fifo::new(SESSION_FIFO_DEPTH),
        }
    }
}

impl Default for SessionQueues {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection personality.
pub enum Conn<F: Fabric> {
    Get(Receiver<F>),
    Put(Transmitter<F>),
}

macro_rules! dispatch {
    ($self:ident, $fn:ident $(, $args:expr)*) => {
        match $self {
            Conn::Get(c) => c.$fn($($args),*),
            Conn::Put(c) => c.$fn($($args),*),
        }
    };
}

pub struct Session<F: Fabric> {
    conn: Conn<F>,
    terminal: Terminal,
    queues: SessionQueues,
}

impl<F: Fabric> Session<F> {
    pub fn get(receiver: Receiver<F>, sink: Sink) -> Self {
        Self {
            conn: Conn::Get(receiver),
            terminal: Terminal::Sink(sink),
            queues: SessionQueues::new(),
        }
    }

    pub fn put(transmitter: Transmitter<F>, source: Source) -> Self {
        Self {
            conn: Conn::Put(transmitter),
            terminal: Terminal::Source(source),
            queues: SessionQueues::new(),
        }
    }

    /// The connection's completion queue, for poll-set membership.
    pub fn cq(&self) -> &Arc<F::Cq> {
        let conn = &self.conn;
        dispatch!(conn, cq)
    }

    /// One cooperative pass: step the connection, which trades buffers with
    /// the terminal through the session queues.
    pub fn poll(&mut self, token: &CancelToken) -> LoopStatus {
        let conn = &mut self.conn;
        dispatch!(conn, poll, &mut self.queues, &mut self.terminal, token)
    }

    pub fn conn(&self) -> &Conn<F> {
        &self.conn
    }
}
