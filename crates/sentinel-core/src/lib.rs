//! Transport-independent engine for the SentinelFS write gate: entropy
//! estimation, content classification, path translation, just-in-time
//! backups, and the process-wide write counters.

pub mod backup;
pub mod entropy;
pub mod paths;
pub mod sniff;
pub mod stats;
