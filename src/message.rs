//! Whole-message encoding and decoding.

use std::fmt;
use std::num::NonZeroU32;
use std::os::fd::OwnedFd;

use crate::buf::{padding_to, OwnedBuf, ReadBuf};
use crate::error::{Error, ErrorKind, Result};
use crate::marshal::{load_values, store_values};
use crate::names::{
    validate_bus_name, validate_error_name, validate_interface_name, validate_member_name,
};
use crate::proto::{
    Endianness, Flags, HeaderField, MessageType, HEADER_FIELDS, MAX_ARRAY_LENGTH, MAX_BODY_LENGTH,
    MAX_MESSAGE_LENGTH, PROTOCOL_VERSION,
};
use crate::value::Value;
use crate::{ObjectPath, OwnedObjectPath, OwnedSignature, Signature};

/// The kind of a [`Message`] along with the header fields which are required
/// for that kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// A method call.
    MethodCall {
        /// The path of the object the call is addressed to.
        path: OwnedObjectPath,
        /// The method name.
        member: Box<str>,
    },
    /// A reply to a method call.
    MethodReturn {
        /// The serial of the call this is a reply to.
        reply_serial: NonZeroU32,
    },
    /// An error reply to a method call.
    Error {
        /// The D-Bus error name.
        error_name: Box<str>,
        /// The serial of the call this is a reply to.
        reply_serial: NonZeroU32,
    },
    /// A signal emission.
    Signal {
        /// The path of the object emitting the signal.
        path: OwnedObjectPath,
        /// The signal name.
        member: Box<str>,
    },
}

impl MessageKind {
    pub(crate) fn message_type(&self) -> MessageType {
        match self {
            MessageKind::MethodCall { .. } => MessageType::METHOD_CALL,
            MessageKind::MethodReturn { .. } => MessageType::METHOD_RETURN,
            MessageKind::Error { .. } => MessageType::ERROR,
            MessageKind::Signal { .. } => MessageType::SIGNAL,
        }
    }
}

/// A D-Bus message.
///
/// A message is constructed through one of [`Message::method_call`],
/// [`Message::method_return`], [`Message::error`] or [`Message::signal`] and
/// refined with the `with_` methods. A serial is assigned by the connection
/// when the message is sent.
///
/// # Examples
///
/// ```
/// use tokbus::{Message, ObjectPath};
///
/// const PATH: &ObjectPath = ObjectPath::new_const(b"/org/freedesktop/DBus");
///
/// let m = Message::method_call(PATH, "Hello")
///     .with_interface("org.freedesktop.DBus")
///     .with_destination("org.freedesktop.DBus");
///
/// assert_eq!(m.member(), Some("Hello"));
/// assert!(m.serial().is_none());
/// ```
pub struct Message {
    pub(crate) kind: MessageKind,
    /// Serial of the message. Assigned by the connection on send; always
    /// present on received messages.
    pub(crate) serial: Option<NonZeroU32>,
    pub(crate) flags: Flags,
    pub(crate) interface: Option<Box<str>>,
    pub(crate) destination: Option<Box<str>>,
    pub(crate) sender: Option<Box<str>>,
    pub(crate) endianness: Endianness,
    pub(crate) body: Vec<Value>,
    /// File descriptors attached to the message. Body values of type `h`
    /// index into this array.
    pub(crate) fds: Vec<OwnedFd>,
    /// The `UNIX_FDS` count a decoded message declared.
    pub(crate) declared_fds: u32,
}

impl Message {
    fn with_kind(kind: MessageKind) -> Self {
        Self {
            kind,
            serial: None,
            flags: Flags::EMPTY,
            interface: None,
            destination: None,
            sender: None,
            endianness: Endianness::NATIVE,
            body: Vec::new(),
            fds: Vec::new(),
            declared_fds: 0,
        }
    }

    /// Construct a method call message.
    pub fn method_call(path: &ObjectPath, member: &str) -> Self {
        Self::with_kind(MessageKind::MethodCall {
            path: path.to_owned(),
            member: member.into(),
        })
    }

    /// Construct a method return message replying to the given serial.
    pub fn method_return(reply_serial: NonZeroU32) -> Self {
        Self::with_kind(MessageKind::MethodReturn { reply_serial })
    }

    /// Construct an error message replying to the given serial.
    pub fn error(error_name: &str, reply_serial: NonZeroU32) -> Self {
        Self::with_kind(MessageKind::Error {
            error_name: error_name.into(),
            reply_serial,
        })
    }

    /// Construct a signal message. The interface is required for signals and
    /// is set with [`Message::with_interface`].
    pub fn signal(path: &ObjectPath, member: &str) -> Self {
        Self::with_kind(MessageKind::Signal {
            path: path.to_owned(),
            member: member.into(),
        })
    }

    /// Get the kind of the message.
    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    /// Get the serial of the message, if one has been assigned.
    pub fn serial(&self) -> Option<NonZeroU32> {
        self.serial
    }

    pub(crate) fn with_serial(mut self, serial: NonZeroU32) -> Self {
        self.serial = Some(serial);
        self
    }

    /// Get the flags of the message.
    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Modify the flags of the message.
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Get the interface of the message.
    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    /// Modify the interface of the message.
    pub fn with_interface(mut self, interface: &str) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Get the destination of the message.
    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    /// Modify the destination of the message.
    pub fn with_destination(mut self, destination: &str) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Get the sender of the message.
    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    /// Modify the sender of the message.
    pub fn with_sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Get the endianness the message is encoded with.
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// Modify the endianness of the message.
    pub fn with_endianness(mut self, endianness: Endianness) -> Self {
        self.endianness = endianness;
        self
    }

    /// Get the body of the message.
    pub fn body(&self) -> &[Value] {
        &self.body
    }

    /// Take the body out of the message.
    pub fn into_body(self) -> Vec<Value> {
        self.body
    }

    /// Modify the body of the message.
    pub fn with_body(mut self, body: Vec<Value>) -> Self {
        self.body = body;
        self
    }

    /// Attach file descriptors to the message. Body values of type `h` are
    /// indexes into this array.
    pub fn with_fds(mut self, fds: Vec<OwnedFd>) -> Self {
        self.fds = fds;
        self
    }

    /// The file descriptors attached to the message.
    pub fn fds(&self) -> &[OwnedFd] {
        &self.fds
    }

    /// Take the file descriptors out of the message.
    pub fn take_fds(&mut self) -> Vec<OwnedFd> {
        std::mem::take(&mut self.fds)
    }

    /// The path of the message, for kinds which carry one.
    pub fn path(&self) -> Option<&ObjectPath> {
        match &self.kind {
            MessageKind::MethodCall { path, .. } => Some(path),
            MessageKind::Signal { path, .. } => Some(path),
            _ => None,
        }
    }

    /// The member of the message, for kinds which carry one.
    pub fn member(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::MethodCall { member, .. } => Some(member),
            MessageKind::Signal { member, .. } => Some(member),
            _ => None,
        }
    }

    /// The signature describing the body. Fails if the combined signature
    /// would be invalid, such as hand-built containers breaking the
    /// grammar or a body exceeding the signature length limit.
    pub fn body_signature(&self) -> Result<OwnedSignature> {
        let mut bytes = Vec::new();

        for value in &self.body {
            bytes.extend_from_slice(value.signature().as_bytes());
        }

        Ok(OwnedSignature::new(&bytes)?)
    }

    /// Test if the message expects a reply, which is the case for method
    /// calls without the `NO_REPLY_EXPECTED` flag.
    pub fn expects_reply(&self) -> bool {
        matches!(self.kind, MessageKind::MethodCall { .. })
            && !(self.flags & Flags::NO_REPLY_EXPECTED)
    }

    fn validate_names(&self) -> Result<()> {
        match &self.kind {
            MessageKind::MethodCall { member, .. } => {
                validate_member_name(member)?;
            }
            MessageKind::Signal { member, .. } => {
                validate_member_name(member)?;

                if self.interface.is_none() {
                    return Err(Error::new(ErrorKind::MissingInterface));
                }
            }
            MessageKind::Error { error_name, .. } => {
                validate_error_name(error_name)?;
            }
            MessageKind::MethodReturn { .. } => {}
        }

        if let Some(interface) = &self.interface {
            validate_interface_name(interface)?;
        }

        if let Some(destination) = &self.destination {
            validate_bus_name(destination)?;
        }

        if let Some(sender) = &self.sender {
            validate_bus_name(sender)?;
        }

        Ok(())
    }

    /// Build the header-field array as a value tree so the regular
    /// marshaller lays it out.
    fn header_fields(&self, body_signature: &Signature) -> Vec<Value> {
        fn field(code: HeaderField, value: Value) -> Value {
            Value::Struct(vec![Value::Byte(code.0), Value::variant(value)])
        }

        let mut fields = Vec::new();

        match &self.kind {
            MessageKind::MethodCall { path, member } => {
                fields.push(field(HeaderField::PATH, Value::ObjectPath(path.clone())));
                fields.push(field(HeaderField::MEMBER, Value::from(&**member)));
            }
            MessageKind::MethodReturn { reply_serial } => {
                fields.push(field(
                    HeaderField::REPLY_SERIAL,
                    Value::UInt32(reply_serial.get()),
                ));
            }
            MessageKind::Error {
                error_name,
                reply_serial,
            } => {
                fields.push(field(HeaderField::ERROR_NAME, Value::from(&**error_name)));
                fields.push(field(
                    HeaderField::REPLY_SERIAL,
                    Value::UInt32(reply_serial.get()),
                ));
            }
            MessageKind::Signal { path, member } => {
                fields.push(field(HeaderField::PATH, Value::ObjectPath(path.clone())));
                fields.push(field(HeaderField::MEMBER, Value::from(&**member)));
            }
        }

        if let Some(interface) = &self.interface {
            fields.push(field(HeaderField::INTERFACE, Value::from(&**interface)));
        }

        if let Some(destination) = &self.destination {
            fields.push(field(HeaderField::DESTINATION, Value::from(&**destination)));
        }

        if let Some(sender) = &self.sender {
            fields.push(field(HeaderField::SENDER, Value::from(&**sender)));
        }

        if !body_signature.is_empty() {
            fields.push(field(
                HeaderField::SIGNATURE,
                Value::Signature(body_signature.to_owned()),
            ));
        }

        if !self.fds.is_empty() {
            fields.push(field(
                HeaderField::UNIX_FDS,
                Value::UInt32(self.fds.len() as u32),
            ));
        }

        fields
    }

    /// Encode the message into bytes.
    ///
    /// Errors unless a serial has been assigned.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let Some(serial) = self.serial else {
            return Err(Error::new(ErrorKind::ZeroSerial));
        };

        self.validate_names()?;
        self.validate_fd_indexes(self.fds.len() as u32)?;

        let body_signature = self.body_signature()?;

        let mut body = OwnedBuf::with_endianness(self.endianness);
        store_values(&mut body, &body_signature, &self.body)?;

        if body.len() > MAX_BODY_LENGTH as usize {
            return Err(Error::new(ErrorKind::BodyTooLong(body.len() as u32)));
        }

        let mut buf = OwnedBuf::with_endianness(self.endianness);
        buf.store(self.endianness.0);
        buf.store(self.kind.message_type().0);
        buf.store(self.flags.0);
        buf.store(PROTOCOL_VERSION);
        buf.store(body.len() as u32);
        buf.store(serial.get());

        let fields = vec![Value::array_unchecked(
            Signature::new_const(b"(yv)"),
            self.header_fields(&body_signature),
        )];
        store_values(&mut buf, HEADER_FIELDS, &fields)?;

        // The body begins on an 8-byte boundary.
        buf.align(8);

        let mut out = buf.into_vec();
        out.extend_from_slice(body.get());

        if out.len() > MAX_MESSAGE_LENGTH {
            return Err(Error::new(ErrorKind::MessageTooLong(out.len())));
        }

        Ok(out)
    }

    /// Total length of the message at the head of `bytes`, once the fixed
    /// header and the header-field length are available. Validates the
    /// fixed-header limits so oversized frames fail before buffering.
    pub(crate) fn required_len(bytes: &[u8]) -> Result<Option<usize>> {
        if bytes.len() < 16 {
            return Ok(None);
        }

        let Some(endianness) = Endianness::from_byte(bytes[0]) else {
            return Err(Error::new(ErrorKind::InvalidProtocol));
        };

        let mut read = ReadBuf::from_slice(&bytes[..16], endianness);
        let _ = read.load::<u32>()?;
        let body_len = read.load::<u32>()?;
        let _serial = read.load::<u32>()?;
        let fields_len = read.load::<u32>()?;

        if body_len > MAX_BODY_LENGTH {
            return Err(Error::new(ErrorKind::BodyTooLong(body_len)));
        }

        if fields_len > MAX_ARRAY_LENGTH {
            return Err(Error::new(ErrorKind::ArrayTooLong(fields_len)));
        }

        let fields_len = fields_len as usize;
        let header = 16 + fields_len;
        let total = header + padding_to(header, 8) + body_len as usize;

        if total > MAX_MESSAGE_LENGTH {
            return Err(Error::new(ErrorKind::MessageTooLong(total)));
        }

        Ok(Some(total))
    }

    /// Decode a whole message, taking the number of file descriptors its
    /// `UNIX_FDS` header declares off the front of `fds`.
    pub(crate) fn decode_split(bytes: &[u8], fds: &mut Vec<OwnedFd>) -> Result<Message> {
        let mut message = Message::decode(bytes, Vec::new())?;

        let count = message.declared_fds as usize;

        if fds.len() < count {
            return Err(Error::new(ErrorKind::InvalidFdIndex(message.declared_fds)));
        }

        message.fds = fds.drain(..count).collect();
        Ok(message)
    }

    /// Decode a whole message from bytes, taking ownership of the file
    /// descriptors received alongside it.
    pub fn decode(bytes: &[u8], fds: Vec<OwnedFd>) -> Result<Message> {
        let Some(&endianness) = bytes.first() else {
            return Err(Error::new(ErrorKind::BufferUnderflow));
        };

        let Some(endianness) = Endianness::from_byte(endianness) else {
            return Err(Error::new(ErrorKind::InvalidProtocol));
        };

        if bytes.len() > MAX_MESSAGE_LENGTH {
            return Err(Error::new(ErrorKind::MessageTooLong(bytes.len())));
        }

        let mut read = ReadBuf::from_slice(bytes, endianness);
        let _ = read.load::<u8>()?;
        let message_type = read.load::<u8>()?;
        // Unknown flag bits are ignored.
        let flags = Flags(read.load::<u8>()? & 0x7);
        let version = read.load::<u8>()?;

        if version != PROTOCOL_VERSION {
            return Err(Error::new(ErrorKind::InvalidProtocol));
        }

        let body_len = read.load::<u32>()?;
        let serial = read.load::<u32>()?;

        let Some(serial) = NonZeroU32::new(serial) else {
            return Err(Error::new(ErrorKind::ZeroSerial));
        };

        let mut fields = Fields::load(&mut read)?;

        read.align(8)?;

        if read.len() != body_len as usize {
            return Err(Error::new(ErrorKind::BodyLengthMismatch {
                declared: body_len,
                actual: read.len() as u32,
            }));
        }

        let body = match &fields.signature {
            Some(signature) => {
                let body = load_values(&mut read, signature)?;

                if !read.is_empty() {
                    return Err(Error::new(ErrorKind::BodyLengthMismatch {
                        declared: body_len,
                        actual: (body_len as usize - read.len()) as u32,
                    }));
                }

                body
            }
            None => {
                if body_len != 0 {
                    return Err(Error::new(ErrorKind::MissingSignature));
                }

                Vec::new()
            }
        };

        let kind = fields.take_kind(MessageType(message_type))?;

        let declared_fds = fields.unix_fds.unwrap_or(0);

        let message = Message {
            kind,
            serial: Some(serial),
            flags,
            interface: fields.interface,
            destination: fields.destination,
            sender: fields.sender,
            endianness,
            body,
            fds,
            declared_fds,
        };

        message.validate_fd_indexes(declared_fds)?;

        Ok(message)
    }

    /// Check that every `h`-typed value indexes into the fd array.
    fn validate_fd_indexes(&self, count: u32) -> Result<()> {
        fn walk(value: &Value, count: u32) -> Result<()> {
            match value {
                Value::UnixFd(index) => {
                    if *index >= count {
                        return Err(Error::new(ErrorKind::InvalidFdIndex(*index)));
                    }
                }
                Value::Array(_, values) | Value::Struct(values) => {
                    for value in values {
                        walk(value, count)?;
                    }
                }
                Value::Dict(_, _, entries) => {
                    for (k, v) in entries {
                        walk(k, count)?;
                        walk(v, count)?;
                    }
                }
                Value::Variant(inner) => walk(inner, count)?,
                _ => {}
            }

            Ok(())
        }

        for value in &self.body {
            walk(value, count)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("serial", &self.serial)
            .field("flags", &self.flags)
            .field("interface", &self.interface)
            .field("destination", &self.destination)
            .field("sender", &self.sender)
            .field("endianness", &self.endianness)
            .field("body", &self.body)
            .field("fds", &self.fds.len())
            .finish()
    }
}

/// Equality over everything except the fd values themselves, which only
/// compare by count.
impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.serial == other.serial
            && self.flags == other.flags
            && self.interface == other.interface
            && self.destination == other.destination
            && self.sender == other.sender
            && self.endianness == other.endianness
            && self.body == other.body
            && self.fds.len() == other.fds.len()
    }
}

/// Header fields collected during decoding.
struct Fields {
    path: Option<OwnedObjectPath>,
    interface: Option<Box<str>>,
    member: Option<Box<str>>,
    error_name: Option<Box<str>>,
    reply_serial: Option<NonZeroU32>,
    destination: Option<Box<str>>,
    sender: Option<Box<str>>,
    signature: Option<OwnedSignature>,
    unix_fds: Option<u32>,
}

fn put<T>(slot: &mut Option<T>, code: HeaderField, value: T) -> Result<()> {
    if slot.is_some() {
        return Err(Error::new(ErrorKind::DuplicateHeaderField(code.0)));
    }

    *slot = Some(value);
    Ok(())
}

fn expect_string(value: Value) -> Result<Box<str>> {
    match value {
        Value::String(s) => Ok(s.into()),
        _ => Err(Error::new(ErrorKind::InvalidProtocol)),
    }
}

impl Fields {
    fn load(read: &mut ReadBuf<'_>) -> Result<Fields> {
        let mut fields = Fields {
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            destination: None,
            sender: None,
            signature: None,
            unix_fds: None,
        };

        let mut values = load_values(read, HEADER_FIELDS)?;

        let Some(Value::Array(_, entries)) = values.pop() else {
            return Err(Error::new(ErrorKind::InvalidProtocol));
        };

        for entry in entries {
            let Value::Struct(mut pair) = entry else {
                return Err(Error::new(ErrorKind::InvalidProtocol));
            };

            let (Some(value), Some(Value::Byte(code))) = (pair.pop(), pair.pop()) else {
                return Err(Error::new(ErrorKind::InvalidProtocol));
            };

            let value = value.into_inner();
            let code = HeaderField(code);

            match code {
                HeaderField::PATH => {
                    let Value::ObjectPath(path) = value else {
                        return Err(Error::new(ErrorKind::InvalidProtocol));
                    };

                    put(&mut fields.path, code, path)?;
                }
                HeaderField::INTERFACE => {
                    put(&mut fields.interface, code, expect_string(value)?)?;
                }
                HeaderField::MEMBER => {
                    put(&mut fields.member, code, expect_string(value)?)?;
                }
                HeaderField::ERROR_NAME => {
                    put(&mut fields.error_name, code, expect_string(value)?)?;
                }
                HeaderField::REPLY_SERIAL => {
                    let Value::UInt32(serial) = value else {
                        return Err(Error::new(ErrorKind::InvalidProtocol));
                    };

                    let Some(serial) = NonZeroU32::new(serial) else {
                        return Err(Error::new(ErrorKind::ZeroReplySerial));
                    };

                    put(&mut fields.reply_serial, code, serial)?;
                }
                HeaderField::DESTINATION => {
                    put(&mut fields.destination, code, expect_string(value)?)?;
                }
                HeaderField::SENDER => {
                    put(&mut fields.sender, code, expect_string(value)?)?;
                }
                HeaderField::SIGNATURE => {
                    let Value::Signature(signature) = value else {
                        return Err(Error::new(ErrorKind::InvalidProtocol));
                    };

                    put(&mut fields.signature, code, signature)?;
                }
                HeaderField::UNIX_FDS => {
                    let Value::UInt32(count) = value else {
                        return Err(Error::new(ErrorKind::InvalidProtocol));
                    };

                    put(&mut fields.unix_fds, code, count)?;
                }
                // Unknown header fields must be ignored.
                _ => {}
            }
        }

        Ok(fields)
    }

    /// Apply the required-field matrix for the message type and produce the
    /// kind of the message.
    fn take_kind(&mut self, message_type: MessageType) -> Result<MessageKind> {
        match message_type {
            MessageType::METHOD_CALL => {
                let path = self
                    .path
                    .take()
                    .ok_or(Error::new(ErrorKind::MissingPath))?;
                let member = self
                    .member
                    .take()
                    .ok_or(Error::new(ErrorKind::MissingMember))?;

                Ok(MessageKind::MethodCall { path, member })
            }
            MessageType::METHOD_RETURN => {
                let reply_serial = self
                    .reply_serial
                    .take()
                    .ok_or(Error::new(ErrorKind::MissingReplySerial))?;

                Ok(MessageKind::MethodReturn { reply_serial })
            }
            MessageType::ERROR => {
                let error_name = self
                    .error_name
                    .take()
                    .ok_or(Error::new(ErrorKind::MissingErrorName))?;
                let reply_serial = self
                    .reply_serial
                    .take()
                    .ok_or(Error::new(ErrorKind::MissingReplySerial))?;

                Ok(MessageKind::Error {
                    error_name,
                    reply_serial,
                })
            }
            MessageType::SIGNAL => {
                let path = self
                    .path
                    .take()
                    .ok_or(Error::new(ErrorKind::MissingPath))?;
                let member = self
                    .member
                    .take()
                    .ok_or(Error::new(ErrorKind::MissingMember))?;

                if self.interface.is_none() {
                    return Err(Error::new(ErrorKind::MissingInterface));
                }

                Ok(MessageKind::Signal { path, member })
            }
            MessageType(t) => Err(Error::new(ErrorKind::UnknownMessageType(t))),
        }
    }
}
