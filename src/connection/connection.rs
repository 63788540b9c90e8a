use std::num::NonZeroU32;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{Error, ErrorKind, Result};
use crate::interface::Interface;
use crate::match_rule::MatchRule;
use crate::message::Message;
use crate::names::validate_bus_name;
use crate::object::ExportedObject;
use crate::org_freedesktop_dbus::{self as fdo, NameFlag, NameReply, ReleaseNameReply};
use crate::proto::Flags;
use crate::proxy::Proxy;
use crate::value::Value;
use crate::{ObjectPath, OwnedObjectPath};

use super::engine::Action;

/// Options controlling a remote method call.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use tokbus::CallOptions;
///
/// let opts = CallOptions::new()
///     .destination("org.example")
///     .interface("org.example.Widget")
///     .timeout(Duration::from_secs(5));
///
/// assert!(opts.expect_reply);
/// assert!(opts.auto_start);
/// ```
#[derive(Debug, Clone)]
pub struct CallOptions<'a> {
    /// Whether a reply is tracked; when false the call resolves
    /// immediately and `NO_REPLY_EXPECTED` is set.
    pub expect_reply: bool,
    /// Whether the bus may start a service to handle the call.
    pub auto_start: bool,
    /// Fail the call with a timeout error if no reply arrives in time.
    pub timeout: Option<Duration>,
    /// The interface containing the method.
    pub interface: Option<&'a str>,
    /// The bus name the call is addressed to.
    pub destination: Option<&'a str>,
}

impl<'a> CallOptions<'a> {
    /// Options with the defaults: a reply is expected and auto start is
    /// allowed.
    pub fn new() -> Self {
        Self {
            expect_reply: true,
            auto_start: true,
            timeout: None,
            interface: None,
            destination: None,
        }
    }

    /// Do not track a reply for this call.
    pub fn no_reply(mut self) -> Self {
        self.expect_reply = false;
        self
    }

    /// Do not let the bus auto-start a service for this call.
    pub fn no_auto_start(mut self) -> Self {
        self.auto_start = false;
        self
    }

    /// Fail the call if no reply arrives within the duration.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The interface containing the method.
    pub fn interface(mut self, interface: &'a str) -> Self {
        self.interface = Some(interface);
        self
    }

    /// The bus name the call is addressed to.
    pub fn destination(mut self, destination: &'a str) -> Self {
        self.destination = Some(destination);
        self
    }
}

impl Default for CallOptions<'_> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/// The decoded body of a method reply.
///
/// A one-element reply signature decodes to [`ReturnValue::Single`], an
/// empty one to [`ReturnValue::Empty`] and anything else to
/// [`ReturnValue::Tuple`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReturnValue {
    /// The reply carried no values.
    Empty,
    /// The reply carried exactly one value.
    Single(Value),
    /// The reply carried multiple values, in order.
    Tuple(Vec<Value>),
}

impl ReturnValue {
    pub(crate) fn from_body(mut values: Vec<Value>) -> Self {
        match values.len() {
            0 => ReturnValue::Empty,
            1 => ReturnValue::Single(values.remove(0)),
            _ => ReturnValue::Tuple(values),
        }
    }

    /// The single value of the reply, if there was exactly one.
    pub fn into_value(self) -> Option<Value> {
        match self {
            ReturnValue::Single(value) => Some(value),
            _ => None,
        }
    }

    /// All values of the reply, in order.
    pub fn into_values(self) -> Vec<Value> {
        match self {
            ReturnValue::Empty => Vec::new(),
            ReturnValue::Single(value) => vec![value],
            ReturnValue::Tuple(values) => values,
        }
    }
}

struct Inner {
    actions: mpsc::UnboundedSender<Action>,
    unique_name: OnceLock<Box<str>>,
    closed: watch::Receiver<bool>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = self.actions.send(Action::Close);
    }
}

/// A connection to a message bus.
///
/// Cloning the connection is cheap and every clone talks to the same
/// underlying engine task. The connection is closed when explicitly asked
/// to or when the last clone is dropped.
///
/// # Examples
///
/// ```no_run
/// use tokbus::{CallOptions, Connection};
///
/// # #[tokio::main] async fn main() -> tokbus::Result<()> {
/// let c = Connection::session().await?;
///
/// let reply = c
///     .call_remote(
///         "/org/freedesktop/DBus",
///         "ListNames",
///         Vec::new(),
///         CallOptions::new()
///             .destination("org.freedesktop.DBus")
///             .interface("org.freedesktop.DBus"),
///     )
///     .await?;
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Connect to the session bus.
    pub async fn session() -> Result<Self> {
        super::ConnectionBuilder::new().session_bus().connect().await
    }

    /// Connect to the system bus.
    pub async fn system() -> Result<Self> {
        super::ConnectionBuilder::new().system_bus().connect().await
    }

    /// Connect to `session`, `system` or an explicit bus address.
    pub async fn connect(bus: &str) -> Result<Self> {
        super::ConnectionBuilder::new().address(bus).connect().await
    }

    pub(crate) fn from_parts(
        actions: mpsc::UnboundedSender<Action>,
        closed: watch::Receiver<bool>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                actions,
                unique_name: OnceLock::new(),
                closed,
            }),
        }
    }

    /// The unique bus name assigned to this connection by the bus.
    pub fn unique_name(&self) -> Option<&str> {
        self.inner.unique_name.get().map(|name| &**name)
    }

    /// Send the `Hello` bootstrap call and record the resulting unique
    /// name.
    pub(crate) async fn hello(&self) -> Result<()> {
        let message = Message::method_call(fdo::PATH, "Hello")
            .with_interface(fdo::INTERFACE)
            .with_destination(fdo::DESTINATION);

        let reply = self.call(message, None).await?;

        let Some(Value::String(name)) = reply.body().first() else {
            return Err(Error::new(ErrorKind::InvalidProtocol));
        };

        let _ = self.inner.unique_name.set(name.clone().into());
        Ok(())
    }

    fn action(&self, action: Action) -> Result<()> {
        self.inner
            .actions
            .send(action)
            .map_err(|_| Error::new(ErrorKind::Disconnected))
    }

    /// Send a method call and wait for its reply message.
    ///
    /// The reply-table entry is registered before the message is written,
    /// so a fast peer cannot win a race against the caller.
    pub async fn call(&self, message: Message, timeout: Option<Duration>) -> Result<Message> {
        let (tx, rx) = oneshot::channel();

        self.action(Action::Call {
            message,
            timeout,
            reply: tx,
        })?;

        rx.await.map_err(|_| Error::new(ErrorKind::Disconnected))?
    }

    /// Queue a message without tracking a reply, returning the serial it
    /// was assigned.
    pub async fn send(&self, message: Message) -> Result<NonZeroU32> {
        let (tx, rx) = oneshot::channel();
        self.action(Action::Send { message, done: tx })?;
        rx.await.map_err(|_| Error::new(ErrorKind::Disconnected))?
    }

    /// Call a method on a remote object.
    ///
    /// The body signature is derived from the argument values. The reply
    /// body is decoded into a [`ReturnValue`]; a remote error, a timeout or
    /// a disconnect fail the call with the corresponding [`Error`].
    pub async fn call_remote(
        &self,
        path: &str,
        member: &str,
        args: Vec<Value>,
        options: CallOptions<'_>,
    ) -> Result<ReturnValue> {
        let path = ObjectPath::new(path)?;

        let mut flags = Flags::EMPTY;

        if !options.expect_reply {
            flags = flags | Flags::NO_REPLY_EXPECTED;
        }

        if !options.auto_start {
            flags = flags | Flags::NO_AUTO_START;
        }

        let mut message = Message::method_call(path, member)
            .with_flags(flags)
            .with_body(args);

        if let Some(interface) = options.interface {
            message = message.with_interface(interface);
        }

        if let Some(destination) = options.destination {
            message = message.with_destination(destination);
        }

        if !options.expect_reply {
            self.send(message).await?;
            return Ok(ReturnValue::Empty);
        }

        let reply = self.call(message, options.timeout).await?;
        Ok(ReturnValue::from_body(reply.into_body()))
    }

    /// Register a match rule and a handler for the messages it selects.
    ///
    /// The rule is forwarded to the bus with `AddMatch` when it is the
    /// first local registration of its kind. Handlers run on the
    /// connection engine in registration order; a panicking handler is
    /// logged and skipped without affecting the others.
    pub async fn add_match<F>(&self, rule: MatchRule, handler: F) -> Result<MatchGuard>
    where
        F: FnMut(&Message) + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        self.action(Action::AddMatch {
            rule,
            handler: Box::new(handler),
            done: tx,
        })?;

        let id = rx.await.map_err(|_| Error::new(ErrorKind::Disconnected))??;

        Ok(MatchGuard {
            actions: self.inner.actions.clone(),
            id: Some(id),
        })
    }

    /// Request ownership of a well-known bus name.
    pub async fn request_name(&self, name: &str, flags: NameFlag) -> Result<NameReply> {
        validate_bus_name(name)?;

        let reply = self
            .call_remote(
                fdo::PATH.as_str(),
                "RequestName",
                vec![Value::from(name), Value::UInt32(flags.0)],
                CallOptions::new()
                    .destination(fdo::DESTINATION)
                    .interface(fdo::INTERFACE),
            )
            .await?;

        match reply {
            ReturnValue::Single(Value::UInt32(n)) => Ok(NameReply(n)),
            _ => Err(Error::new(ErrorKind::InvalidProtocol)),
        }
    }

    /// Release a well-known bus name previously requested.
    pub async fn release_name(&self, name: &str) -> Result<ReleaseNameReply> {
        validate_bus_name(name)?;

        let reply = self
            .call_remote(
                fdo::PATH.as_str(),
                "ReleaseName",
                vec![Value::from(name)],
                CallOptions::new()
                    .destination(fdo::DESTINATION)
                    .interface(fdo::INTERFACE),
            )
            .await?;

        match reply {
            ReturnValue::Single(Value::UInt32(n)) => Ok(ReleaseNameReply(n)),
            _ => Err(Error::new(ErrorKind::InvalidProtocol)),
        }
    }

    /// The unique name of the connection owning a bus name.
    pub async fn get_name_owner(&self, name: &str) -> Result<String> {
        let reply = self
            .call_remote(
                fdo::PATH.as_str(),
                "GetNameOwner",
                vec![Value::from(name)],
                CallOptions::new()
                    .destination(fdo::DESTINATION)
                    .interface(fdo::INTERFACE),
            )
            .await?;

        match reply {
            ReturnValue::Single(Value::String(owner)) => Ok(owner),
            _ => Err(Error::new(ErrorKind::InvalidProtocol)),
        }
    }

    /// The unix user id of the connection owning a bus name.
    pub async fn get_connection_unix_user(&self, name: &str) -> Result<u32> {
        let reply = self
            .call_remote(
                fdo::PATH.as_str(),
                "GetConnectionUnixUser",
                vec![Value::from(name)],
                CallOptions::new()
                    .destination(fdo::DESTINATION)
                    .interface(fdo::INTERFACE),
            )
            .await?;

        match reply {
            ReturnValue::Single(Value::UInt32(uid)) => Ok(uid),
            _ => Err(Error::new(ErrorKind::InvalidProtocol)),
        }
    }

    /// Export an object, making it reachable at its path and announcing it
    /// through `InterfacesAdded`. Exporting over an existing path fails.
    pub async fn export(&self, object: ExportedObject) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.action(Action::Export { object, done: tx })?;
        rx.await.map_err(|_| Error::new(ErrorKind::Disconnected))?
    }

    /// Stop exporting the object at a path. Returns whether an object was
    /// exported there.
    pub async fn unexport(&self, path: &ObjectPath) -> Result<bool> {
        let (tx, rx) = oneshot::channel();

        self.action(Action::Unexport {
            path: path.to_owned(),
            done: tx,
        })?;

        rx.await.map_err(|_| Error::new(ErrorKind::Disconnected))
    }

    /// Emit a signal declared by an exported object. The arguments are
    /// validated against the declared signature.
    pub async fn emit_signal(
        &self,
        path: &ObjectPath,
        interface: Option<&str>,
        member: &str,
        args: Vec<Value>,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();

        self.action(Action::EmitSignal {
            path: path.to_owned(),
            interface: interface.map(Box::from),
            member: member.into(),
            args,
            done: tx,
        })?;

        rx.await.map_err(|_| Error::new(ErrorKind::Disconnected))?
    }

    /// Read the value of an exported property.
    pub async fn exported_property(
        &self,
        path: &ObjectPath,
        interface: &str,
        name: &str,
    ) -> Result<Option<Value>> {
        let (tx, rx) = oneshot::channel();

        self.action(Action::GetProperty {
            path: path.to_owned(),
            interface: interface.into(),
            name: name.into(),
            done: tx,
        })?;

        rx.await.map_err(|_| Error::new(ErrorKind::Disconnected))
    }

    /// Update the value of an exported property, emitting
    /// `PropertiesChanged` as its declaration asks. Write access is not
    /// enforced for local updates.
    pub async fn set_exported_property(
        &self,
        path: &ObjectPath,
        interface: &str,
        name: &str,
        value: Value,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();

        self.action(Action::SetProperty {
            path: path.to_owned(),
            interface: interface.into(),
            name: name.into(),
            value,
            done: tx,
        })?;

        rx.await.map_err(|_| Error::new(ErrorKind::Disconnected))?
    }

    /// Build a proxy for a remote object. With `interfaces` the proxy uses
    /// the explicit declarations; without, the remote object is
    /// introspected.
    pub async fn get_remote_object(
        &self,
        destination: &str,
        path: &str,
        interfaces: Option<Vec<Interface>>,
    ) -> Result<Proxy> {
        validate_bus_name(destination)?;
        let path = OwnedObjectPath::new(path)?;

        match interfaces {
            Some(interfaces) => Ok(Proxy::new(
                self.clone(),
                destination.into(),
                path,
                interfaces,
            )),
            None => Proxy::introspected(self.clone(), destination.into(), path).await,
        }
    }

    /// Ask the connection to shut down. Outstanding calls fail with a
    /// disconnected error.
    pub fn close(&self) {
        let _ = self.inner.actions.send(Action::Close);
    }

    /// Wait until the connection has shut down, either on request or
    /// because the transport failed.
    pub async fn closed(&self) {
        let mut closed = self.inner.closed.clone();

        loop {
            if *closed.borrow() {
                return;
            }

            if closed.changed().await.is_err() {
                return;
            }
        }
    }
}

/// A registered match rule. Dropping the guard, or calling
/// [`MatchGuard::remove`], unregisters the handler; the last registration
/// of a rule also issues `RemoveMatch` on the bus.
pub struct MatchGuard {
    actions: mpsc::UnboundedSender<Action>,
    id: Option<u64>,
}

impl MatchGuard {
    /// Unregister the match rule.
    pub fn remove(mut self) {
        self.remove_inner();
    }

    fn remove_inner(&mut self) {
        if let Some(id) = self.id.take() {
            let _ = self.actions.send(Action::RemoveMatch { id });
        }
    }
}

impl Drop for MatchGuard {
    fn drop(&mut self) {
        self.remove_inner();
    }
}
