//! Stream terminals: a deterministic source and a verifying sink.

use std::io::Write;

use tracing::debug;

use crate::buffer::ByteBuf;
use crate::error::{Activity, Step, XferError};
use crate::fifo::Fifo;

/// Reference line every transfer produces and verifies, 78 bytes with the
/// trailing newline.
pub const REF_LINE: &[u8; 78] =
    b"The quick brown fox jumps over the lazy dog 0123456789 abcdefghijklmnopqrstuv\n";

/// Repetitions of the reference line in the standard transfer.
pub const DEFAULT_REPS: u64 = 10_000;

/// Either terminal of a session; the connection side only sees `trade`.
pub enum Terminal {
    Source(Source),
    Sink(Sink),
}

impl Terminal {
    /// Consume buffers from `ready`, produce or verify their payloads, and
    /// hand them back on `completed`.
    pub fn trade(&mut self, ready: &mut Fifo<ByteBuf>, completed: &mut Fifo<ByteBuf>) -> Step {
        match self {
            Terminal::Source(s) => s.trade(ready, completed),
            Terminal::Sink(s) => s.trade(ready, completed),
        }
    }

    pub fn eof(&self) -> bool {
        match self {
            Terminal::Source(s) => s.eof,
            Terminal::Sink(s) => s.eof,
        }
    }
}

type Echo = Box<dyn Write + Send>;

/// Produces the repeating reference text into empty payload buffers.
pub struct Source {
    idx: u64,
    total: u64,
    eof: bool,
    echo: Option<Echo>,
}

impl Source {
    pub fn new(nreps: u64) -> Self {
        let total = nreps * REF_LINE.len() as u64;
        Self {
            idx: 0,
            total,
            // A zero-length stream is at EOF before the first trade.
            eof: total == 0,
            echo: None,
        }
    }

    /// Echo everything produced to `out` (the binaries pass stdout).
    pub fn with_echo(nreps: u64, out: Echo) -> Self {
        Self {
            echo: Some(out),
            ..Self::new(nreps)
        }
    }

    fn trade(&mut self, ready: &mut Fifo<ByteBuf>, completed: &mut Fifo<ByteBuf>) -> Step {
        let mut activity = Activity::Idle;
        while !self.eof && !ready.is_empty() && !completed.is_full() {
            let mut buf = ready.get().expect("non-empty ready fifo");
            let n = (buf.capacity() as u64).min(self.total - self.idx) as usize;
            {
                let mut cell = buf.cell().lock();
                for (i, byte) in cell[..n].iter_mut().enumerate() {
                    *byte = REF_LINE[((self.idx + i as u64) % REF_LINE.len() as u64) as usize];
                }
                if let Some(echo) = &mut self.echo {
                    echo.write_all(&cell[..n]).map_err(|e| {
                        XferError::Protocol(format!("echo write failed: {e}"))
                    })?;
                }
            }
            buf.nused = n;
            self.idx += n as u64;
            if self.idx == self.total {
                self.eof = true;
                if let Some(echo) = &mut self.echo {
                    let _ = echo.flush();
                }
                debug!(total = self.total, "source reached end of stream");
            }
            completed
                .put(buf)
                .map_err(|_| XferError::Overflow("source completed"))?;
            activity = Activity::Advanced;
        }
        Ok(activity)
    }
}

/// Verifies arriving payloads against the rolling reference text.
pub struct Sink {
    idx: u64,
    total: u64,
    eof: bool,
    echo: Option<Echo>,
}

impl Sink {
    pub fn new(nreps: u64) -> Self {
        let total = nreps * REF_LINE.len() as u64;
        Self {
            idx: 0,
            total,
            // A zero-length stream is at EOF before the first trade.
            eof: total == 0,
            echo: None,
        }
    }

    pub fn with_echo(nreps: u64, out: Echo) -> Self {
        Self {
            echo: Some(out),
            ..Self::new(nreps)
        }
    }

    fn trade(&mut self, ready: &mut Fifo<ByteBuf>, completed: &mut Fifo<ByteBuf>) -> Step {
        let mut activity = Activity::Idle;
        while !ready.is_empty() && !completed.is_full() {
            let mut buf = ready.get().expect("non-empty ready fifo");
            if self.idx + buf.nused as u64 > self.total {
                return Err(XferError::Overrun);
            }
            {
                let cell = buf.cell().lock();
                for (i, byte) in cell[..buf.nused].iter().enumerate() {
                    let at = self.idx + i as u64;
                    if *byte != REF_LINE[(at % REF_LINE.len() as u64) as usize] {
                        return Err(XferError::Verify { at });
                    }
                }
                if let Some(echo) = &mut self.echo {
                    echo.write_all(&cell[..buf.nused]).map_err(|e| {
                        XferError::Protocol(format!("echo write failed: {e}"))
                    })?;
                }
            }
            self.idx += buf.nused as u64;
            if self.idx == self.total {
                self.eof = true;
                if let Some(echo) = &mut self.echo {
                    let _ = echo.flush();
                }
                debug!(total = self.total, "sink verified full stream");
            }
            buf.nused = 0;
            completed
                .put(buf)
                .map_err(|_| XferError::Overflow("sink completed"))?;
            activity = Activity::Advanced;
        }
        Ok(activity)
    }
}
