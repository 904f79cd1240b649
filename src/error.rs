//! Error types for Prasaran

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Prasaran error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error (socket bind, accept, config file read)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("Configuration error: {0}")]
    Config(#[from] basic_toml::Error),

    /// WebSocket protocol or transport error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// Frame buffer could not be grown to hold the payload
    #[error("Failed to allocate {bytes} bytes for frame '{tag}'")]
    FrameAllocation {
        /// Tag of the frame being built
        tag: char,
        /// Total frame size requested
        bytes: usize,
    },

    /// Frame bytes do not match the layout of their tag
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// First byte of a frame is not a known tag
    #[error("Unknown frame tag: {0:#04x}")]
    UnknownTag(u8),

    /// Stream server has no listening endpoint
    #[error("Stream server not initialized")]
    NotInitialized,
}
