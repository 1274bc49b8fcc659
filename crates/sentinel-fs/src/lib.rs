//! SentinelFS service: the write-gated pass-through façade and its FUSE
//! transport adapter.

pub mod gate;
pub mod transport;
