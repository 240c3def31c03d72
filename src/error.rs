use num_enum::{FromPrimitive, IntoPrimitive};
use thiserror::Error;

/// Status codes a server can put into the last byte of its handshake response
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive)]
pub enum HandshakeErrorKind {
    #[num_enum(default)]
    Unknown = 0x01,
    ServerBusy = 0x02,
    BadFormat = 0x03,
    BadHostname = 0x04,
    ProtocolNotAllowed = 0x05,
    ServerError = 0x06,
}
impl HandshakeErrorKind {
    pub fn message(self) -> &'static str {
        match self {
            HandshakeErrorKind::Unknown => "Unknown handshake error",
            HandshakeErrorKind::ServerBusy => "Handshake failed, server is busy",
            HandshakeErrorKind::BadFormat => "Handshake failed, bad format sent by client",
            HandshakeErrorKind::BadHostname => "Handshake failed, invalid hostname",
            HandshakeErrorKind::ProtocolNotAllowed => "Handshake failed, protocol not allowed",
            HandshakeErrorKind::ServerError => "Handshake failed, server error",
        }
    }
}

/// Failure flags of an OPEN response. Flags `0x00` (success) and `0x01` (redirect) are not
///  failures and are handled by the connection before an error is ever built.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive)]
pub enum OpenErrorKind {
    NotAvailable = 0x08,
    ModeNotAllowed = 0x09,
    ProtocolNotAllowed = 0x0a,
    HostNotAllowed = 0x0b,
    AuthRejected = 0x0c,
    ServiceUnavailable = 0x0d,
    ServiceError = 0x0e,
    #[num_enum(default)]
    Other = 0x0f,
}
impl OpenErrorKind {
    pub fn message(self) -> &'static str {
        match self {
            OpenErrorKind::NotAvailable => "Failed to open channel, not available",
            OpenErrorKind::ModeNotAllowed => "Not allowed to open channel with specified mode",
            OpenErrorKind::ProtocolNotAllowed => "Not allowed to open channel with specified protocol",
            OpenErrorKind::HostNotAllowed => "Not allowed to open channel from host",
            OpenErrorKind::AuthRejected => "Not allowed to open channel with credentials",
            OpenErrorKind::ServiceUnavailable => "Failed to open channel, service is not available",
            OpenErrorKind::ServiceError => "Failed to open channel, service error",
            OpenErrorKind::Other => "Failed to open channel, unknown error",
        }
    }
}

/// Error flags of a SIGNAL frame (`0x0a..=0x0f`)
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive)]
pub enum SignalErrorKind {
    Protocol = 0x0a,
    Operation = 0x0b,
    Limit = 0x0c,
    Server = 0x0d,
    Violation = 0x0e,
    #[num_enum(default)]
    Other = 0x0f,
}
impl SignalErrorKind {
    pub fn message(self) -> &'static str {
        match self {
            SignalErrorKind::Protocol => "Protocol error",
            SignalErrorKind::Operation => "Operational error",
            SignalErrorKind::Limit => "Limit error",
            SignalErrorKind::Server => "Server error",
            SignalErrorKind::Violation => "Violation error",
            SignalErrorKind::Other => "Unknown error",
        }
    }
}

/// Everything that can go wrong with a channel.
///
/// Usage errors are returned synchronously by the call that violated the contract. Open and
///  signal errors are scoped to a single channel, while handshake, transport and protocol
///  errors are fatal to the whole connection and cascade to every channel attached to it.
///
/// The type is `Clone` because a single connection-level failure is recorded as the sticky
///  error of every affected channel.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ChannelError {
    #[error("Invalid channel mode {0}")]
    InvalidMode(u8),
    #[error("Could not read the address \"{0}\"")]
    InvalidAddress(String),
    #[error("Could not read the port \"{0}\"")]
    InvalidPort(String),
    #[error("Already connected")]
    AlreadyConnected,
    #[error("Channel is not connected")]
    NotConnected,
    #[error("Channel is not writable")]
    NotWritable,
    #[error("You do not have permission to send signals")]
    NotEmittable,
    #[error("Priority must be between 1 - 3, was {0}")]
    InvalidPriority(u8),
    #[error("Flag must fit into four bits, was {0}")]
    InvalidFlag(u8),
    #[error("Payload max limit reached: {len} bytes, the maximum is {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("Channel already open")]
    AlreadyOpen,
    #[error("Address 0 is reserved for broadcast signals")]
    BroadcastAddress,

    #[error("{message}")]
    Handshake { kind: HandshakeErrorKind, message: String },
    #[error("{message}")]
    Open { kind: OpenErrorKind, message: String },
    #[error("{message}")]
    Signal { kind: SignalErrorKind, message: String },

    #[error("{0}")]
    Transport(String),
    #[error("{0}")]
    Protocol(String),
}

impl ChannelError {
    pub fn handshake(kind: HandshakeErrorKind) -> ChannelError {
        ChannelError::Handshake {
            kind,
            message: kind.message().to_string(),
        }
    }

    /// A non-empty `reason` sent by the server replaces the generic message
    pub fn open(kind: OpenErrorKind, reason: &str) -> ChannelError {
        ChannelError::Open {
            kind,
            message: Self::message_or(kind.message(), reason),
        }
    }

    /// A non-empty `reason` sent by the server replaces the generic message
    pub fn signal(kind: SignalErrorKind, reason: &str) -> ChannelError {
        ChannelError::Signal {
            kind,
            message: Self::message_or(kind.message(), reason),
        }
    }

    fn message_or(generic: &str, reason: &str) -> String {
        if reason.is_empty() {
            generic.to_string()
        }
        else {
            reason.to_string()
        }
    }

    /// The code that was transmitted on the wire, if this error originated from the server
    pub fn code(&self) -> Option<u8> {
        match self {
            ChannelError::Handshake { kind, .. } => Some((*kind).into()),
            ChannelError::Open { kind, .. } => Some((*kind).into()),
            ChannelError::Signal { kind, .. } => Some((*kind).into()),
            _ => None,
        }
    }

    /// Errors of this kind tear down the connection and every channel attached to it
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self,
            ChannelError::Handshake { .. } | ChannelError::Transport(_) | ChannelError::Protocol(_))
    }
}
