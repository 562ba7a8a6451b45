//! Error types for the VNC server library.

use std::io;
use thiserror::Error;

/// Result type for VNC operations.
pub type Result<T> = std::result::Result<T, VncError>;

/// Errors that can occur in VNC server operations.
#[derive(Debug, Error)]
pub enum VncError {
    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// VNC protocol error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication failed.
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// Invalid pixel format.
    #[error("Invalid pixel format")]
    InvalidPixelFormat,

    /// Encoding error.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Invalid operation or state.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Connection closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A session never completed the handshake within the allotted time.
    #[error("Handshake timed out")]
    HandshakeTimeout,

    /// The peer offered a protocol version below 3.3.
    #[error("Unsupported protocol version: {0}")]
    Unsupported(String),

    /// Framebuffer resize failed (e.g. allocation failure); the framebuffer
    /// remains at its old size.
    #[error("Resize failed: {0}")]
    ResizeFailure(String),
}
