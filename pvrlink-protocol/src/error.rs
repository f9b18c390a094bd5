//! Error types for the pvrlink backend protocol.

use thiserror::Error;

/// Wire- and schema-level errors.
///
/// These are stateless failures: a byte stream that does not parse, or a
/// lookup against a field table that does not exist.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The frame could not be decoded: bad length prefix, truncated payload,
    /// or a field count that does not match the schema expectation.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Frame payload exceeds what the fixed-width length prefix can declare.
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Unknown field table or command name.
    #[error("unknown {kind}: {name}")]
    SchemaError { kind: &'static str, name: String },
}

/// Connection-level errors surfaced to callers of the client engine.
#[derive(Error, Debug)]
pub enum ClientError {
    /// No mutually acceptable protocol version was found.
    #[error("version negotiation failed: offered down to {lowest_offered}, floor is {floor}")]
    NegotiationFailed { lowest_offered: u32, floor: u32 },

    /// A gating rule was broken: command before announce, double announce,
    /// or a malformed handshake response.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The command exists but is outside the negotiated version's support
    /// range. Carries the valid range for diagnostics.
    #[error(
        "command {command} unsupported at protocol version {version} (supported {from}..={})",
        .to.map_or_else(|| "latest".to_string(), |v| v.to_string())
    )]
    UnsupportedCommand {
        command: String,
        version: u32,
        from: u32,
        to: Option<u32>,
    },

    /// Short or overrun read, size mismatch, or a failed transfer request.
    #[error("transfer error: {0}")]
    Transfer(String),

    /// The connection was closed (locally or by the peer) before the
    /// operation completed.
    #[error("connection closed")]
    ConnectionClosed,

    /// A wire or schema failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Socket-level fault: EOF, reset, or a timeout past the read budget.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// True when the underlying cause is a read timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Io(e) if e.kind() == std::io::ErrorKind::TimedOut)
    }

    /// Error kind plus message chain, for synthesized error events.
    pub fn chain(&self) -> Vec<String> {
        let mut out = vec![self.to_string()];
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            out.push(err.to_string());
            source = err.source();
        }
        out
    }
}
