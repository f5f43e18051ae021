use thiserror::Error;

/// Errors surfaced by the transport engine.
///
/// Recoverable conditions (`WouldBlock`, `WriteCallAgain`, EAGAIN-class
/// flush failures) leave the session usable; `ChannelClosed`,
/// `ProtocolError` and `CompressionError` latch the session inactive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("out of buffers: {0}")]
    NoBuffers(String),
    #[error("operation would block")]
    WouldBlock,
    #[error("fragmentation ran out of buffers; call write again with the same buffer")]
    WriteCallAgain,
    #[error("flush failed: {0}")]
    WriteFlushFailed(String),
    #[error("channel closed: {0}")]
    ChannelClosed(String),
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("compression error: {0}")]
    CompressionError(String),
    #[error("internal error: {0}")]
    InternalError(String),
}

impl TransportError {
    /// Numeric code reported alongside the text.
    pub fn code(&self) -> i32 {
        match self {
            TransportError::InvalidArgument(_) => -1,
            TransportError::NoBuffers(_) => -4,
            TransportError::WouldBlock => -11,
            TransportError::WriteCallAgain => -12,
            TransportError::WriteFlushFailed(_) => -13,
            TransportError::ChannelClosed(_) => -14,
            TransportError::ProtocolError(_) => -15,
            TransportError::CompressionError(_) => -16,
            TransportError::InternalError(_) => -20,
        }
    }

    /// Whether this error moves the session to `Inactive`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::ChannelClosed(_)
                | TransportError::ProtocolError(_)
                | TransportError::CompressionError(_)
                | TransportError::InternalError(_)
        )
    }
}

impl From<ripc_proto::ProtoError> for TransportError {
    fn from(err: ripc_proto::ProtoError) -> TransportError {
        match err {
            ripc_proto::ProtoError::Refused(text) => TransportError::ChannelClosed(text),
            other => TransportError::ProtocolError(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
