//! # fab-wire
//!
//! Fixed-layout codec for the bulk-transfer control channel.
//!
//! Four messages coordinate a transfer session: *initial* and *ack* perform
//! the address handshake, *vector* advertises RDMA target windows from the
//! receiver, and *progress* reports placed bytes (and EOF) from the
//! transmitter. All integers are big-endian; initial, ack and progress are
//! fixed-size, vector is a 4-byte header followed by whole 24-byte triples.
//!
//! Decoding is strict: a message that does not match its layout exactly is
//! rejected with a [`WireError`] naming the malformation, so the engine can
//! log and repost the buffer without touching session state.

use std::fmt;

use thiserror::Error;

pub mod constants;
pub use constants::{
    ACK_LEN, ADDR_CAP, INITIAL_LEN, MAX_RIOVS, NONCE_LEN, PROGRESS_LEN, RIOV_LEN, VECTOR_CAP,
};

#[macro_export]
macro_rules! wire_newtype {
    ($name:ident, $inner:ty, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub $inner);

        impl From<$inner> for $name {
            fn from(val: $inner) -> Self {
                $name(val)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

wire_newtype!(
    MrKey,
    u64,
    "Memory-region key a peer cites to address a registered remote window."
);

/// Errors raised by strict wire decoding (and over-long encodes).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("message truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },
    #[error("address of {len} bytes exceeds the {ADDR_CAP}-byte wire field")]
    AddrTooLong { len: usize },
    #[error("vector carries {niovs} segments, limit is {MAX_RIOVS}")]
    TooManySegments { niovs: u32 },
    #[error("vector body of {got} bytes does not hold {niovs} whole segments")]
    RaggedVector { niovs: u32, got: usize },
    #[error("progress message must be exactly {PROGRESS_LEN} bytes, got {got}")]
    BadProgressLength { got: usize },
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes(buf[at..at + 4].try_into().unwrap())
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_be_bytes(buf[at..at + 8].try_into().unwrap())
}

/// One remote RDMA target segment: a zero-based offset and length inside the
/// registration identified by `key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteIov {
    pub addr: u64,
    pub len: u64,
    pub key: MrKey,
}

/// Handshake opener sent by the transmitter: a nonce, the (reserved) source
/// fan-out fields, and the sender's opaque endpoint address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialMsg {
    pub nonce: [u8; NONCE_LEN],
    pub nsources: u32,
    pub id: u32,
    pub addr: Vec<u8>,
}

impl InitialMsg {
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, WireError> {
        if out.len() < INITIAL_LEN {
            return Err(WireError::Truncated {
                need: INITIAL_LEN,
                got: out.len(),
            });
        }
        if self.addr.len() > ADDR_CAP {
            return Err(WireError::AddrTooLong {
                len: self.addr.len(),
            });
        }
        out[..NONCE_LEN].copy_from_slice(&self.nonce);
        out[NONCE_LEN..NONCE_LEN + 4].copy_from_slice(&self.nsources.to_be_bytes());
        out[NONCE_LEN + 4..NONCE_LEN + 8].copy_from_slice(&self.id.to_be_bytes());
        out[NONCE_LEN + 8..NONCE_LEN + 12]
            .copy_from_slice(&(self.addr.len() as u32).to_be_bytes());
        let addr = &mut out[NONCE_LEN + 12..INITIAL_LEN];
        addr[..self.addr.len()].copy_from_slice(&self.addr);
        addr[self.addr.len()..].fill(0);
        Ok(INITIAL_LEN)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < INITIAL_LEN {
            return Err(WireError::Truncated {
                need: INITIAL_LEN,
                got: buf.len(),
            });
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&buf[..NONCE_LEN]);
        let nsources = read_u32(buf, NONCE_LEN);
        let id = read_u32(buf, NONCE_LEN + 4);
        let addrlen = read_u32(buf, NONCE_LEN + 8) as usize;
        if addrlen > ADDR_CAP {
            return Err(WireError::AddrTooLong { len: addrlen });
        }
        let addr = buf[NONCE_LEN + 12..NONCE_LEN + 12 + addrlen].to_vec();
        Ok(Self {
            nonce,
            nsources,
            id,
            addr,
        })
    }
}

/// Handshake reply from the receiver carrying its own endpoint address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckMsg {
    pub addr: Vec<u8>,
}

impl AckMsg {
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, WireError> {
        if out.len() < ACK_LEN {
            return Err(WireError::Truncated {
                need: ACK_LEN,
                got: out.len(),
            });
        }
        if self.addr.len() > ADDR_CAP {
            return Err(WireError::AddrTooLong {
                len: self.addr.len(),
            });
        }
        out[..4].copy_from_slice(&(self.addr.len() as u32).to_be_bytes());
        let addr = &mut out[4..ACK_LEN];
        addr[..self.addr.len()].copy_from_slice(&self.addr);
        addr[self.addr.len()..].fill(0);
        Ok(ACK_LEN)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < ACK_LEN {
            return Err(WireError::Truncated {
                need: ACK_LEN,
                got: buf.len(),
            });
        }
        let addrlen = read_u32(buf, 0) as usize;
        if addrlen > ADDR_CAP {
            return Err(WireError::AddrTooLong { len: addrlen });
        }
        Ok(Self {
            addr: buf[4..4 + addrlen].to_vec(),
        })
    }
}

/// Receiver advertisement of RDMA target windows. An empty vector is the
/// receiver's explicit EOF signal and must be sent exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VectorMsg {
    pub iovs: Vec<RemoteIov>,
}

impl VectorMsg {
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, WireError> {
        if self.iovs.len() > MAX_RIOVS {
            return Err(WireError::TooManySegments {
                niovs: self.iovs.len() as u32,
            });
        }
        let need = 4 + self.iovs.len() * RIOV_LEN;
        if out.len() < need {
            return Err(WireError::Truncated {
                need,
                got: out.len(),
            });
        }
        out[..4].copy_from_slice(&(self.iovs.len() as u32).to_be_bytes());
        for (i, iov) in self.iovs.iter().enumerate() {
            let at = 4 + i * RIOV_LEN;
            out[at..at + 8].copy_from_slice(&iov.addr.to_be_bytes());
            out[at + 8..at + 16].copy_from_slice(&iov.len.to_be_bytes());
            out[at + 16..at + 24].copy_from_slice(&iov.key.0.to_be_bytes());
        }
        Ok(need)
    }

    /// Strict decode of a received vector message. `buf` must be exactly the
    /// received frame: a short header, a ragged body, or a segment count
    /// beyond the window are each rejected.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < 4 {
            return Err(WireError::Truncated {
                need: 4,
                got: buf.len(),
            });
        }
        let niovs = read_u32(buf, 0);
        let body = buf.len() - 4;
        if niovs as usize > MAX_RIOVS {
            return Err(WireError::TooManySegments { niovs });
        }
        if body % RIOV_LEN != 0 || body != niovs as usize * RIOV_LEN {
            return Err(WireError::RaggedVector { niovs, got: body });
        }
        let mut iovs = Vec::with_capacity(niovs as usize);
        for i in 0..niovs as usize {
            let at = 4 + i * RIOV_LEN;
            iovs.push(RemoteIov {
                addr: read_u64(buf, at),
                len: read_u64(buf, at + 8),
                key: MrKey(read_u64(buf, at + 16)),
            });
        }
        Ok(Self { iovs })
    }

    /// An empty vector signals the sender's EOF.
    pub fn is_eof(&self) -> bool {
        self.iovs.is_empty()
    }
}

/// Transmitter report: bytes placed by RDMA since the last report, and
/// whether more are coming (`nleftover == 0` means the stream is done).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressMsg {
    pub nfilled: u64,
    pub nleftover: u64,
}

impl ProgressMsg {
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, WireError> {
        if out.len() < PROGRESS_LEN {
            return Err(WireError::Truncated {
                need: PROGRESS_LEN,
                got: out.len(),
            });
        }
        out[..8].copy_from_slice(&self.nfilled.to_be_bytes());
        out[8..16].copy_from_slice(&self.nleftover.to_be_bytes());
        Ok(PROGRESS_LEN)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() != PROGRESS_LEN {
            return Err(WireError::BadProgressLength { got: buf.len() });
        }
        Ok(Self {
            nfilled: read_u64(buf, 0),
            nleftover: read_u64(buf, 8),
        })
    }
}

impl fmt::Display for ProgressMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "progress({} filled, {} leftover)", self.nfilled, self.nleftover)
    }
}
