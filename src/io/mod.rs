//! I/O infrastructure.

pub mod streaming;
