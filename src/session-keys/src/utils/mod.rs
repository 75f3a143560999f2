//! Small deterministic helpers shared by the codecs, the gateway and the in-memory ledger.

pub mod bytes;
pub mod crypto;
pub mod kernel;
