//! WebSocket streaming of map geometry to visualization clients.
//!
//! - [`wire`]: tagged binary frame encoder/decoder
//! - [`server`]: single-listener broadcast server driven by an explicit service step
//!
//! The producer loop talks to the server through [`FrameSink`], so the
//! per-tick sequencing can be exercised without sockets.

pub mod server;
pub mod wire;

pub use server::{ServerStats, StreamServer};
pub use wire::{Frame, FrameEncoder, FrameTag, HEADER_LEN, WireElement, decode_frame};

use crate::error::Result;

/// Destination for encoded frames.
///
/// `broadcast` hands one complete frame to every connected client;
/// `service` performs the pending network I/O. Neither may block the caller
/// on a slow or absent client.
pub trait FrameSink {
    /// Open the delivery endpoint. Sinks without one accept any port.
    fn open(&mut self, _port: u16) -> Result<()> {
        Ok(())
    }

    /// Tear the delivery endpoint down.
    fn close(&mut self) {}

    /// Queue a frame for all currently connected clients.
    fn broadcast(&mut self, frame: &[u8]);

    /// Pump accept/handshake/read/write events once.
    fn service(&mut self);
}
