//! In-process test doubles for the fabric contract.

pub mod loopback;

pub use loopback::{LoopFabric, LoopbackOptions, loopback_pair, loopback_pair_with};
