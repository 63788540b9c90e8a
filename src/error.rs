use std::error;
use std::fmt;
use std::io;
use std::str::Utf8Error;

use crate::names::NameError;
use crate::{ObjectPathError, SignatureError};

/// Result alias using an [`Error`] as the error type by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised by this crate.
pub struct Error {
    kind: Box<ErrorKind>,
}

impl Error {
    #[inline]
    pub(crate) fn new(kind: ErrorKind) -> Error {
        Self {
            kind: Box::new(kind),
        }
    }

    /// Test if the error is a remote error reply.
    pub fn is_remote(&self) -> bool {
        matches!(&*self.kind, ErrorKind::Remote { .. })
    }

    /// Test if the error is a method call timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(&*self.kind, ErrorKind::TimedOut)
    }

    /// Test if the error indicates that the connection is gone.
    pub fn is_disconnected(&self) -> bool {
        matches!(&*self.kind, ErrorKind::Disconnected)
    }

    /// The D-Bus error name, for remote errors.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use tokbus::{CallOptions, Connection};
    ///
    /// # #[tokio::main] async fn main() -> tokbus::Result<()> {
    /// let c = Connection::session().await?;
    ///
    /// let err = c
    ///     .call_remote(
    ///         "/does/not/exist",
    ///         "Nope",
    ///         Vec::new(),
    ///         CallOptions::new().destination("org.freedesktop.DBus"),
    ///     )
    ///     .await
    ///     .unwrap_err();
    ///
    /// assert!(err.error_name().is_some());
    /// # Ok(()) }
    /// ```
    pub fn error_name(&self) -> Option<&str> {
        match &*self.kind {
            ErrorKind::Remote { name, .. } => Some(name),
            _ => None,
        }
    }

    /// The message carried by a remote error, if any.
    pub fn error_message(&self) -> Option<&str> {
        match &*self.kind {
            ErrorKind::Remote { message, .. } => message.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn remote(name: Box<str>, message: Option<Box<str>>) -> Self {
        Self::new(ErrorKind::Remote { name, message })
    }
}

impl From<SignatureError> for Error {
    #[inline]
    fn from(error: SignatureError) -> Self {
        Self::new(ErrorKind::Signature(error))
    }
}

impl From<ObjectPathError> for Error {
    #[inline]
    fn from(error: ObjectPathError) -> Self {
        Self::new(ErrorKind::ObjectPath(error))
    }
}

impl From<NameError> for Error {
    #[inline]
    fn from(error: NameError) -> Self {
        Self::new(ErrorKind::Name(error))
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(error: io::Error) -> Self {
        Self::new(ErrorKind::Io(error))
    }
}

impl From<Utf8Error> for Error {
    #[inline]
    fn from(error: Utf8Error) -> Self {
        Self::new(ErrorKind::Utf8Error(error))
    }
}

impl From<ErrorKind> for Error {
    #[inline]
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Debug for Error {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.kind, f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.kind {
            ErrorKind::Io(..) => write!(f, "I/O error"),
            ErrorKind::Signature(..) => write!(f, "Signature error"),
            ErrorKind::ObjectPath(..) => write!(f, "Object path error"),
            ErrorKind::Name(..) => write!(f, "Name error"),
            ErrorKind::Utf8Error(..) => write!(f, "UTF-8 error"),
            ErrorKind::Introspection(error) => write!(f, "Introspection error: {error}"),
            ErrorKind::MissingBus => write!(f, "Missing bus to connect to"),
            ErrorKind::InvalidAddress => write!(f, "Invalid D-Bus address"),
            ErrorKind::ConnectFailed => {
                write!(f, "Failed to connect to any address of the bus")
            }
            ErrorKind::AuthenticationFailed => write!(f, "Authentication failed"),
            ErrorKind::AuthenticationRejected => {
                write!(f, "All authentication mechanisms were rejected")
            }
            ErrorKind::InvalidSasl => write!(f, "Invalid SASL message"),
            ErrorKind::InvalidProtocol => write!(f, "Invalid protocol"),
            ErrorKind::NonZeroPadding => write!(f, "Non-zero padding byte"),
            ErrorKind::BufferUnderflow => write!(f, "Buffer underflow"),
            ErrorKind::NotNullTerminated => write!(f, "String is not null terminated"),
            ErrorKind::StringContainsNull => write!(f, "String contains an embedded null"),
            ErrorKind::InvalidBoolean(b) => write!(f, "Invalid boolean value {b}"),
            ErrorKind::MissingPath => write!(f, "Missing required PATH header"),
            ErrorKind::MissingInterface => write!(f, "Missing required INTERFACE header"),
            ErrorKind::MissingMember => write!(f, "Missing required MEMBER header"),
            ErrorKind::MissingErrorName => write!(f, "Missing required ERROR_NAME header"),
            ErrorKind::MissingReplySerial => {
                write!(f, "Missing required REPLY_SERIAL header")
            }
            ErrorKind::MissingSignature => {
                write!(f, "Non-empty body without a SIGNATURE header")
            }
            ErrorKind::DuplicateHeaderField(field) => {
                write!(f, "Duplicate header field {field}")
            }
            ErrorKind::ZeroSerial => write!(f, "Zero message serial"),
            ErrorKind::ZeroReplySerial => write!(f, "Zero REPLY_SERIAL header"),
            ErrorKind::UnknownMessageType(t) => write!(f, "Unknown message type {t}"),
            ErrorKind::ArrayTooLong(length) => {
                write!(f, "Array of length {length} is too long (max is 67108864)")
            }
            ErrorKind::BodyTooLong(length) => {
                write!(f, "Body of length {length} is too long (max is 134217728)")
            }
            ErrorKind::MessageTooLong(length) => {
                write!(
                    f,
                    "Message of length {length} is too long (max is 134217728)"
                )
            }
            ErrorKind::BodyLengthMismatch { declared, actual } => {
                write!(
                    f,
                    "Declared body length {declared} does not match actual {actual}"
                )
            }
            ErrorKind::ValueMismatch { expected, actual } => {
                write!(f, "Value of type {actual} does not match signature {expected}")
            }
            ErrorKind::ArityMismatch { expected, actual } => {
                write!(
                    f,
                    "Expected {expected} arguments for signature, got {actual}"
                )
            }
            ErrorKind::UnexpectedReplySignature { expected, actual } => {
                write!(
                    f,
                    "Unexpected return value signature: expected {expected:?}, received {actual:?}"
                )
            }
            ErrorKind::InvalidFdIndex(index) => {
                write!(f, "Unix fd index {index} out of range")
            }
            ErrorKind::StructFieldMismatch => {
                write!(f, "Struct fields do not match the declared layout")
            }
            ErrorKind::Remote { name, message } => match message {
                Some(message) => write!(f, "{name}: {message}"),
                None => write!(f, "{name}"),
            },
            ErrorKind::TimedOut => write!(f, "Method call timed out"),
            ErrorKind::Disconnected => write!(f, "Connection to the bus was lost"),
            ErrorKind::SendQueueFull(n) => {
                write!(f, "Outgoing queue exceeded {n} bytes")
            }
            ErrorKind::PathAlreadyExported(path) => {
                write!(f, "An object is already exported at path {path}")
            }
            ErrorKind::UnknownProperty(name) => {
                write!(f, "Property {name} is not declared by any interface")
            }
            ErrorKind::UnknownMethod(name) => {
                write!(f, "Method {name} is not a member of any supported interface")
            }
            ErrorKind::UnknownSignal(name) => {
                write!(f, "Signal {name} is not a member of any supported interface")
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &*self.kind {
            ErrorKind::Io(error) => Some(error),
            ErrorKind::Signature(error) => Some(error),
            ErrorKind::ObjectPath(error) => Some(error),
            ErrorKind::Name(error) => Some(error),
            ErrorKind::Utf8Error(error) => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum ErrorKind {
    Io(io::Error),
    Signature(SignatureError),
    ObjectPath(ObjectPathError),
    Name(NameError),
    Utf8Error(Utf8Error),
    Introspection(Box<str>),
    MissingBus,
    InvalidAddress,
    ConnectFailed,
    AuthenticationFailed,
    AuthenticationRejected,
    InvalidSasl,
    InvalidProtocol,
    NonZeroPadding,
    BufferUnderflow,
    NotNullTerminated,
    StringContainsNull,
    InvalidBoolean(u32),
    MissingPath,
    MissingInterface,
    MissingMember,
    MissingErrorName,
    MissingReplySerial,
    MissingSignature,
    DuplicateHeaderField(u8),
    ZeroSerial,
    ZeroReplySerial,
    UnknownMessageType(u8),
    ArrayTooLong(u32),
    BodyTooLong(u32),
    MessageTooLong(usize),
    BodyLengthMismatch { declared: u32, actual: u32 },
    ValueMismatch { expected: Box<str>, actual: Box<str> },
    ArityMismatch { expected: usize, actual: usize },
    UnexpectedReplySignature { expected: Box<str>, actual: Box<str> },
    InvalidFdIndex(u32),
    StructFieldMismatch,
    Remote { name: Box<str>, message: Option<Box<str>> },
    TimedOut,
    Disconnected,
    SendQueueFull(usize),
    PathAlreadyExported(Box<str>),
    UnknownProperty(Box<str>),
    UnknownMethod(Box<str>),
    UnknownSignal(Box<str>),
}
