//! Core foundation types (no internal deps).

pub mod types;
