//! Connection-level errors.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::schema::SchemaError;
use crate::wire::{DecodeError, EncodeError, ObjectId};

/// Error type for connection operations.
///
/// Variants fall in two groups, see [`Error::is_fatal`]: failures that leave
/// the byte stream or object map untrustworthy and tear the connection down,
/// and usage errors reported to the caller with the connection untouched.
#[derive(Debug, Error)]
pub enum Error {
    // Codec errors
    #[error("malformed message {opcode} for object {object}: {source}")]
    Decode {
        object: ObjectId,
        opcode: u16,
        #[source]
        source: DecodeError,
    },

    #[error("framing error: {0}")]
    Framing(DecodeError),

    // Registry errors
    #[error("message for unknown object {id}")]
    UnknownObject { id: ObjectId },

    #[error("invalid opcode {opcode} for {interface}@{object}")]
    UnknownOpcode {
        object: ObjectId,
        interface: String,
        opcode: u16,
    },

    #[error("peer announced new object with invalid id {id}")]
    InvalidNewId { id: ObjectId },

    #[error("peer announced object {id} of unknown interface {interface}")]
    UnknownPeerInterface { id: ObjectId, interface: String },

    #[error("argument {arg} of {message} refers to unknown object {id}")]
    UnknownReference {
        message: String,
        arg: String,
        id: ObjectId,
    },

    #[error("argument {arg} of {message} refers to a {found}, expected {expected}")]
    ReferenceMismatch {
        message: String,
        arg: String,
        expected: String,
        found: String,
    },

    // Protocol errors
    #[error("{0}")]
    Protocol(ProtocolError),

    // Transport errors
    #[error("connection lost")]
    ConnectionLost(#[source] Option<io::Error>),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    // Usage errors
    #[error("cannot encode {interface}.{message}: {source}")]
    Encode {
        interface: String,
        message: String,
        #[source]
        source: EncodeError,
    },

    #[error("{interface} has no message named {name}")]
    NoSuchMessage { interface: String, name: String },

    #[error("unknown interface {0}")]
    UnknownInterface(String),

    #[error("object {object} is not live on this connection")]
    NotLive { object: ObjectId },

    #[error("object {object} belongs to another connection")]
    ForeignProxy { object: ObjectId },

    #[error("{interface}.{message} needs version {since}, object has version {version}")]
    VersionTooLow {
        interface: String,
        message: String,
        since: u32,
        version: u32,
    },

    #[error("{interface} version {requested} requested, schema supports {supported}")]
    VersionUnsupported {
        interface: String,
        requested: u32,
        supported: u32,
    },

    #[error("argument {arg} expects {expected}, got {found}")]
    WrongInterface {
        arg: String,
        expected: String,
        found: String,
    },

    #[error("argument refers to unknown object {id}")]
    UnknownArgumentObject { id: ObjectId },

    #[error("{operation} is not available on this side of the connection")]
    WrongSide { operation: &'static str },

    #[error("object id space exhausted")]
    IdsExhausted,

    #[error("event queue {queue} does not exist on this connection")]
    UnknownQueue { queue: u64 },

    #[error("no listener for {interface}.{event}")]
    MissingHandler { interface: String, event: String },

    #[error("connection has failed: {0}")]
    ConnectionFailed(#[source] Arc<Error>),

    #[error("invalid protocol: {0}")]
    Schema(#[from] SchemaError),

    // Socket discovery
    #[error("XDG_RUNTIME_DIR is not set")]
    NoRuntimeDir,

    #[error("WAYLAND_SOCKET is not a valid descriptor: {0}")]
    InvalidSocketFd(String),

    #[error("cannot connect to {}: {source}", .path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Whether this error tears the connection down.
    ///
    /// Usage errors, schema errors and socket discovery errors are not fatal:
    /// either no connection exists yet or its state is unchanged.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Decode { .. }
                | Self::Framing(_)
                | Self::UnknownObject { .. }
                | Self::UnknownOpcode { .. }
                | Self::InvalidNewId { .. }
                | Self::UnknownPeerInterface { .. }
                | Self::UnknownReference { .. }
                | Self::ReferenceMismatch { .. }
                | Self::Protocol(_)
                | Self::ConnectionLost(_)
                | Self::Io(_)
                | Self::ConnectionFailed(_)
        )
    }

    /// The underlying cause, looking through [`Error::ConnectionFailed`].
    #[must_use]
    pub fn root(&self) -> &Error {
        match self {
            Self::ConnectionFailed(inner) => inner.root(),
            other => other,
        }
    }

    /// The peer's fatal error, if that is what ended the connection.
    #[must_use]
    pub fn protocol_error(&self) -> Option<&ProtocolError> {
        match self.root() {
            Self::Protocol(err) => Some(err),
            _ => None,
        }
    }
}

/// Fatal error reported by the peer through `wl_display.error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    /// The offending object.
    pub object: ObjectId,
    /// Its interface, if the object was known locally.
    pub interface: Option<String>,
    pub code: u32,
    /// Symbolic name of `code` in the interface's `error` enum.
    pub code_name: Option<String>,
    pub message: String,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.interface {
            Some(interface) => write!(f, "{interface}@{}", self.object)?,
            None => write!(f, "object {}", self.object)?,
        }
        match &self.code_name {
            Some(name) => write!(f, ": error {} ({name}): {}", self.code, self.message),
            None => write!(f, ": error {}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for ProtocolError {}
