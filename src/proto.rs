//! Low level constants for the D-Bus wire protocol.

use crate::signature::Signature;

/// Maximum length in bytes of a single array (2^26).
pub(crate) const MAX_ARRAY_LENGTH: u32 = 1 << 26;
/// Maximum length in bytes of a message body (2^27).
pub(crate) const MAX_BODY_LENGTH: u32 = 1 << 27;
/// Maximum length in bytes of a whole message (2^27).
pub(crate) const MAX_MESSAGE_LENGTH: usize = 1 << 27;

raw_enum! {
    /// The endianness flag of a message.
    #[repr(u8)]
    pub enum Endianness {
        /// Little endian, the `'l'` flag.
        LITTLE = b'l',
        /// Big endian, the `'B'` flag.
        BIG = b'B',
    }
}

impl Endianness {
    /// Native endian.
    #[cfg(target_endian = "little")]
    pub const NATIVE: Self = Self::LITTLE;
    /// Native endian.
    #[cfg(target_endian = "big")]
    pub const NATIVE: Self = Self::BIG;

    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        match Self(b) {
            Self::LITTLE => Some(Self::LITTLE),
            Self::BIG => Some(Self::BIG),
            _ => None,
        }
    }
}

raw_enum! {
    /// The type of a message.
    #[repr(u8)]
    pub(crate) enum MessageType {
        /// Method call. This message type may prompt a reply.
        METHOD_CALL = 1,
        /// Method reply with returned data.
        METHOD_RETURN = 2,
        /// Error reply. If the first argument exists and is a string, it is an
        /// error message.
        ERROR = 3,
        /// Signal emission.
        SIGNAL = 4,
    }
}

raw_set! {
    /// Flags inside of a D-Bus message.
    #[repr(u8)]
    pub enum Flags {
        /// An empty set of flags.
        EMPTY = 0,
        /// This message does not expect method return replies or error
        /// replies, even if it is of a type that can have a reply; the reply
        /// should be omitted.
        NO_REPLY_EXPECTED = 1,
        /// The bus must not launch an owner for the destination name in
        /// response to this message.
        NO_AUTO_START = 2,
        /// This flag may be set on a method call message to inform the
        /// receiving side that the caller is prepared to wait for interactive
        /// authorization, which might take a considerable time to complete.
        ALLOW_INTERACTIVE_AUTHORIZATION = 4,
    }
}

raw_enum! {
    /// Header field codes in the `a(yv)` header-field array.
    #[repr(u8)]
    pub(crate) enum HeaderField {
        /// The object to send a call to, or the object a signal is emitted
        /// from. Required for `METHOD_CALL` and `SIGNAL`.
        PATH = 1,
        /// The interface to invoke a method call on, or that a signal is
        /// emitted from. Optional for method calls, required for signals.
        INTERFACE = 2,
        /// The member, either the method name or signal name.
        MEMBER = 3,
        /// The name of the error that occurred, for errors.
        ERROR_NAME = 4,
        /// The serial number of the message this message is a reply to.
        REPLY_SERIAL = 5,
        /// The name of the connection this message is intended for.
        DESTINATION = 6,
        /// Unique name of the sending connection, controlled by the bus.
        SENDER = 7,
        /// The signature of the message body. If omitted the body must be
        /// zero-length.
        SIGNATURE = 8,
        /// The number of unix file descriptors that accompany the message.
        UNIX_FDS = 9,
    }
}

raw_enum! {
    /// A single type code inside of a signature.
    #[repr(u8)]
    pub(crate) enum Type {
        /// Not a valid type code, used to terminate signatures.
        INVALID = b'\0',
        /// 8-bit unsigned integer.
        BYTE = b'y',
        /// Boolean value, 0 is FALSE and 1 is TRUE. Everything else is
        /// invalid.
        BOOLEAN = b'b',
        /// 16-bit signed integer.
        INT16 = b'n',
        /// 16-bit unsigned integer.
        UINT16 = b'q',
        /// 32-bit signed integer.
        INT32 = b'i',
        /// 32-bit unsigned integer.
        UINT32 = b'u',
        /// 64-bit signed integer.
        INT64 = b'x',
        /// 64-bit unsigned integer.
        UINT64 = b't',
        /// IEEE 754 double.
        DOUBLE = b'd',
        /// UTF-8 string. Must be nul terminated and contain no other nul
        /// bytes.
        STRING = b's',
        /// Name of an object instance.
        OBJECT_PATH = b'o',
        /// A type signature.
        SIGNATURE = b'g',
        /// Array of the next single complete type.
        ARRAY = b'a',
        OPEN_PAREN = b'(',
        CLOSE_PAREN = b')',
        /// Variant type (the type of the value is part of the value itself).
        VARIANT = b'v',
        OPEN_BRACE = b'{',
        CLOSE_BRACE = b'}',
        /// Unix file descriptor, an index into the out-of-band fd array.
        UNIX_FD = b'h',
    }
}

impl Type {
    #[inline]
    pub(crate) const fn new(b: u8) -> Self {
        Self(b)
    }

    /// Alignment of the type code in bytes. Container open tokens carry the
    /// alignment of the container.
    pub(crate) const fn alignment(self) -> usize {
        match self {
            Type::BYTE | Type::SIGNATURE | Type::VARIANT => 1,
            Type::INT16 | Type::UINT16 => 2,
            Type::BOOLEAN | Type::INT32 | Type::UINT32 | Type::UNIX_FD => 4,
            Type::STRING | Type::OBJECT_PATH | Type::ARRAY => 4,
            Type::INT64 | Type::UINT64 | Type::DOUBLE => 8,
            Type::OPEN_PAREN | Type::OPEN_BRACE => 8,
            _ => 1,
        }
    }

    /// Fixed encoded size of the type, if it has one.
    pub(crate) const fn fixed_size(self) -> Option<usize> {
        match self {
            Type::BYTE => Some(1),
            Type::INT16 | Type::UINT16 => Some(2),
            Type::BOOLEAN | Type::INT32 | Type::UINT32 | Type::UNIX_FD => Some(4),
            Type::INT64 | Type::UINT64 | Type::DOUBLE => Some(8),
            _ => None,
        }
    }
}

/// The signature of the header-field array.
pub(crate) const HEADER_FIELDS: &Signature = Signature::new_const(b"a(yv)");

/// Protocol major version spoken by this crate.
pub(crate) const PROTOCOL_VERSION: u8 = 1;
