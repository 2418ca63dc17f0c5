//! Wire-protocol limits shared by the engine and the providers.

/// Maximum number of `(addr, len, key)` triples one vector message may carry.
pub const MAX_RIOVS: usize = 12;

/// Size of one encoded remote-vector triple.
pub const RIOV_LEN: usize = 24;

/// Capacity of the opaque endpoint-address field in initial and ack messages.
pub const ADDR_CAP: usize = 512;

/// Length of the handshake nonce.
pub const NONCE_LEN: usize = 16;

/// Encoded length of an initial message (nonce + nsources + id + addrlen + addr).
pub const INITIAL_LEN: usize = NONCE_LEN + 4 + 4 + 4 + ADDR_CAP;

/// Encoded length of an ack message (addrlen + addr).
pub const ACK_LEN: usize = 4 + ADDR_CAP;

/// Encoded length of a progress message (nfilled + nleftover).
pub const PROGRESS_LEN: usize = 16;

/// Largest possible encoded vector message (header + a full window of triples).
pub const VECTOR_CAP: usize = 4 + MAX_RIOVS * RIOV_LEN;
