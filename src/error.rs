//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

/// Result type often returned from methods that can have httpchan `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur managing HTTP connections.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    /// An argument failed validation at an API entry point.
    InvalidArgument,
    /// An operation was attempted against an object in the wrong state.
    InvalidState,
    /// ALPN negotiated a protocol this library cannot speak.
    UnsupportedProtocol,
    /// The connection, or its channel, is closed or closing.
    ConnectionClosed,
    /// The server is shutting down and refuses new work.
    ServerClosed,
    /// A required user callback did not do its part.
    ReactionRequired,
    /// The 31-bit stream-id space has been used up.
    StreamIdsExhausted,
    /// An error with no further classification.
    Unknown,
}

impl Error {
    /// Returns true if an argument failed validation.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self.inner.kind, Kind::InvalidArgument)
    }

    /// Returns true if an operation ran against an object in the wrong state.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self.inner.kind, Kind::InvalidState)
    }

    /// Returns true if ALPN selected a protocol this library cannot speak.
    pub fn is_unsupported_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::UnsupportedProtocol)
    }

    /// Returns true if the connection or its channel is closed.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::ConnectionClosed)
    }

    /// Returns true if the server refused new work because it is shutting down.
    pub fn is_server_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::ServerClosed)
    }

    /// Returns true if a required user callback did not do its part.
    pub fn is_reaction_required(&self) -> bool {
        matches!(self.inner.kind, Kind::ReactionRequired)
    }

    /// Returns true if the stream-id space has been exhausted.
    pub fn is_stream_ids_exhausted(&self) -> bool {
        matches!(self.inner.kind, Kind::StreamIdsExhausted)
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.inner.cause
    }

    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn kind(&self) -> Kind {
        self.inner.kind
    }

    /// A shallow copy carrying the kind but not the cause, for the places an
    /// error must be reported to more than one consumer.
    pub(crate) fn clone_kind(&self) -> Error {
        Error::new(self.inner.kind)
    }

    pub(crate) fn new_invalid_argument() -> Error {
        Error::new(Kind::InvalidArgument)
    }

    pub(crate) fn new_invalid_state() -> Error {
        Error::new(Kind::InvalidState)
    }

    pub(crate) fn new_unsupported_protocol() -> Error {
        Error::new(Kind::UnsupportedProtocol)
    }

    pub(crate) fn new_connection_closed() -> Error {
        Error::new(Kind::ConnectionClosed)
    }

    pub(crate) fn new_reaction_required() -> Error {
        Error::new(Kind::ReactionRequired)
    }

    pub(crate) fn new_stream_ids_exhausted() -> Error {
        Error::new(Kind::StreamIdsExhausted)
    }

    pub(crate) fn new_unknown() -> Error {
        Error::new(Kind::Unknown)
    }

    /// The error's standalone message, without the message from the source.
    pub fn message(&self) -> impl fmt::Display + '_ {
        self.description()
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::InvalidArgument => "invalid argument",
            Kind::InvalidState => "operation not allowed in current state",
            Kind::UnsupportedProtocol => "negotiated protocol is not supported",
            Kind::ConnectionClosed => "connection closed",
            Kind::ServerClosed => "server is shutting down",
            Kind::ReactionRequired => "required callback was not invoked",
            Kind::StreamIdsExhausted => "stream ids exhausted",
            Kind::Unknown => "unknown error",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("httpchan::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

#[doc(hidden)]
trait AssertSendSync: Send + Sync + 'static {}
#[doc(hidden)]
impl AssertSendSync for Error {}
