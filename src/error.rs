use std::path::PathBuf;

/// QUIC transport error codes (RFC 9000 §20).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum TransportError {
    NoError = 0x00,
    InternalError = 0x01,
    ConnectionRefused = 0x02,
    FlowControlError = 0x03,
    StreamLimitError = 0x04,
    StreamStateError = 0x05,
    FinalSizeError = 0x06,
    FrameEncodingError = 0x07,
    TransportParameterError = 0x08,
    ConnectionIdLimitError = 0x09,
    ProtocolViolation = 0x0a,
    InvalidToken = 0x0b,
    ApplicationError = 0x0c,
    CryptoBufferExceeded = 0x0d,
    KeyUpdateError = 0x0e,
    AeadLimitReached = 0x0f,
    NoViablePath = 0x10,
    VersionNegotiationError = 0x11,
}

impl TransportError {
    pub const fn to_code(self) -> u64 {
        self as u64
    }

    /// `CRYPTO_ERROR` range: 0x0100 + TLS alert description.
    pub const fn crypto_error(alert: u8) -> u64 {
        0x0100 + alert as u64
    }

    pub fn from_code(code: u64) -> Option<Self> {
        let e = match code {
            0x00 => Self::NoError,
            0x01 => Self::InternalError,
            0x02 => Self::ConnectionRefused,
            0x03 => Self::FlowControlError,
            0x04 => Self::StreamLimitError,
            0x05 => Self::StreamStateError,
            0x06 => Self::FinalSizeError,
            0x07 => Self::FrameEncodingError,
            0x08 => Self::TransportParameterError,
            0x09 => Self::ConnectionIdLimitError,
            0x0a => Self::ProtocolViolation,
            0x0b => Self::InvalidToken,
            0x0c => Self::ApplicationError,
            0x0d => Self::CryptoBufferExceeded,
            0x0e => Self::KeyUpdateError,
            0x0f => Self::AeadLimitReached,
            0x10 => Self::NoViablePath,
            0x11 => Self::VersionNegotiationError,
            _ => return None,
        };
        Some(e)
    }
}

/// HTTP/3 and QPACK error codes (RFC 9114 §8.1, RFC 9204 §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum H3Error {
    NoError = 0x0100,
    GeneralProtocolError = 0x0101,
    InternalError = 0x0102,
    StreamCreationError = 0x0103,
    ClosedCriticalStream = 0x0104,
    FrameUnexpected = 0x0105,
    FrameError = 0x0106,
    ExcessiveLoad = 0x0107,
    IdError = 0x0108,
    SettingsError = 0x0109,
    MissingSettings = 0x010a,
    RequestRejected = 0x010b,
    RequestCancelled = 0x010c,
    RequestIncomplete = 0x010d,
    MessageError = 0x010e,
    ConnectError = 0x010f,
    VersionFallback = 0x0110,
    QpackDecompressionFailed = 0x0200,
    QpackEncoderStreamError = 0x0201,
    QpackDecoderStreamError = 0x0202,
}

impl H3Error {
    pub const fn to_code(self) -> u64 {
        self as u64
    }
}

/// Engine-wide error.
///
/// `Done` and `StreamBlocked` are flow signals rather than failures: they tell
/// the caller to come back later.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// There is no more work to do.
    #[error("done")]
    Done,

    /// Caller-provided buffer is too short.
    #[error("buffer too short, need {needed} bytes")]
    BufferTooShort { needed: usize },

    /// The packet's version is not supported.
    #[error("unknown QUIC version")]
    UnknownVersion,

    #[error("invalid frame")]
    InvalidFrame,

    #[error("invalid packet")]
    InvalidPacket,

    /// The operation cannot be completed in the current connection state.
    #[error("invalid state")]
    InvalidState,

    #[error("stream {0} is in an invalid state")]
    InvalidStreamState(u64),

    /// The peer asked us to stop sending on the stream.
    #[error("stream {0} stopped by peer (code {1})")]
    StreamStopped(u64, u64),

    /// The peer reset the stream.
    #[error("stream {0} reset by peer (code {1})")]
    StreamReset(u64, u64),

    #[error("stream limit reached")]
    StreamLimit,

    #[error("flow control limit violated")]
    FlowControl,

    #[error("final size violated")]
    FinalSize,

    /// The TLS engine rejected the handshake.
    #[error("TLS failure: {reason}")]
    Tls { alert: Option<u8>, reason: String },

    /// Packet or token protection failed.
    #[error("cryptographic operation failed")]
    CryptoFail,

    /// Peer violated the transport protocol.
    #[error("transport error: {0:?}")]
    Transport(TransportError),

    /// HTTP/3 protocol error.
    #[error("HTTP/3 error: {0:?}")]
    Http3(H3Error),

    /// Not enough stream capacity to make progress; retry once writable.
    #[error("stream blocked")]
    StreamBlocked,
}

impl Error {
    /// The transport error code carried in CONNECTION_CLOSE for this error.
    pub fn to_wire(&self) -> u64 {
        match self {
            Error::Transport(e) => e.to_code(),
            Error::Http3(e) => e.to_code(),
            Error::InvalidFrame | Error::BufferTooShort { .. } => {
                TransportError::FrameEncodingError.to_code()
            }
            Error::InvalidPacket | Error::UnknownVersion => {
                TransportError::ProtocolViolation.to_code()
            }
            Error::InvalidStreamState(_) => TransportError::StreamStateError.to_code(),
            Error::StreamLimit => TransportError::StreamLimitError.to_code(),
            Error::FlowControl => TransportError::FlowControlError.to_code(),
            Error::FinalSize => TransportError::FinalSizeError.to_code(),
            // internal_error(80) when the TLS engine gave no alert
            Error::Tls { alert, .. } => TransportError::crypto_error(alert.unwrap_or(80)),
            _ => TransportError::InternalError.to_code(),
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::Transport(e)
    }
}

impl From<H3Error> for Error {
    fn from(e: H3Error) -> Self {
        Error::Http3(e)
    }
}

/// Errors raised while building a [`Config`](crate::Config).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The ALPN list is empty or an entry is empty, too long or truncated.
    #[error("invalid application protocol list")]
    InvalidAlpn,

    #[error("unknown congestion control algorithm `{0}`")]
    UnknownCongestionControl(String),

    /// A certificate, key or trust-anchor file could not be read or decoded.
    #[error("cannot load {path}: {source}")]
    Pem {
        path: PathBuf,
        #[source]
        source: rustls::pki_types::pem::Error,
    },

    #[error("TLS configuration rejected: {0}")]
    Tls(#[from] rustls::Error),

    /// A private key was given without a certificate chain or vice versa.
    #[error("certificate chain and private key must be configured together")]
    IncompleteIdentity,

    /// A local transport parameter is outside what RFC 9000 allows, so the
    /// peer would refuse the handshake.
    #[error("transport parameter {name} out of range: {value}")]
    InvalidTransportParam { name: &'static str, value: u64 },
}
