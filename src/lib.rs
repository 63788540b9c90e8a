//! A native D-Bus client and server library for Tokio.
//!
//! This crate speaks the D-Bus protocol directly over a unix or TCP stream:
//! the SASL handshake, the binary wire format, reply correlation, signal
//! match rules, exported objects with the standard `Peer`,
//! `Introspectable`, `Properties` and `ObjectManager` interfaces, and
//! introspection-driven proxies for remote objects.
//!
//! # Examples
//!
//! ```no_run
//! use tokbus::{CallOptions, Connection};
//!
//! # #[tokio::main] async fn main() -> tokbus::Result<()> {
//! let c = Connection::session().await?;
//!
//! let reply = c
//!     .call_remote(
//!         "/org/freedesktop/DBus",
//!         "GetId",
//!         Vec::new(),
//!         CallOptions::new()
//!             .destination("org.freedesktop.DBus")
//!             .interface("org.freedesktop.DBus"),
//!     )
//!     .await?;
//! # Ok(()) }
//! ```

#[macro_use]
mod macros;

#[doc(inline)]
pub use self::error::{Error, Result};
mod error;

#[doc(inline)]
pub use self::proto::{Endianness, Flags};
pub(crate) mod proto;

#[doc(inline)]
pub use self::signature::{OwnedSignature, Signature, SignatureError};
pub mod signature;

#[doc(inline)]
pub use self::object_path::{ObjectPath, ObjectPathError, OwnedObjectPath};
pub mod object_path;

pub mod names;

#[doc(inline)]
pub use self::value::{StructDescriptor, Value};
mod value;

pub use self::buf::{OwnedBuf, ReadBuf};
pub mod buf;

mod marshal;

#[doc(inline)]
pub use self::message::{Message, MessageKind};
mod message;

pub mod address;

mod transport;

mod sasl;

#[doc(inline)]
pub use self::match_rule::{MatchRule, MatchType};
mod match_rule;

#[doc(inline)]
pub use self::interface::{Access, EmitsChanged, Interface, Method, Property, SignalDef};
mod interface;

#[doc(inline)]
pub use self::object::{
    CallError, ExportedObject, Invocation, MethodResult, ObjectBuilder, DEFAULT_ERROR_NAME,
};
mod object;

pub mod introspect;

#[doc(inline)]
pub use self::connection::{
    CallOptions, Connection, ConnectionBuilder, MatchGuard, ReturnValue,
};
mod connection;

#[doc(inline)]
pub use self::proxy::Proxy;
mod proxy;

pub mod org_freedesktop_dbus;

mod utils;
