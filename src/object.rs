//! Exported objects and the registry which dispatches method calls to them.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::OnceLock;

use crate::error::{Error, ErrorKind, Result};
use crate::interface::{Interface, Method, Property, SignalDef};
use crate::introspect;
use crate::message::Message;
use crate::names::validate_error_name;
use crate::org_freedesktop_dbus as fdo;
use crate::value::Value;
use crate::{ObjectPath, OwnedObjectPath, OwnedSignature, Signature};

/// Error name used for handler errors which do not pick their own name.
pub const DEFAULT_ERROR_NAME: &str = "org.tokbus.Error.Failed";

/// Error name substituted when a handler picks an invalid error name.
const INVALID_ERROR_NAME: &str = "org.tokbus.InvalidErrorName";

/// An error produced by a method handler, converted into a D-Bus error
/// reply.
///
/// # Examples
///
/// ```
/// use tokbus::CallError;
///
/// let e = CallError::new("out of cheese");
/// let e = CallError::with_name("org.example.Error.OutOfCheese", "out of cheese");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallError {
    name: Option<Box<str>>,
    message: Box<str>,
}

impl CallError {
    /// Construct an error with the default error name.
    pub fn new(message: impl fmt::Display) -> Self {
        Self {
            name: None,
            message: message.to_string().into(),
        }
    }

    /// Construct an error with an explicit D-Bus error name.
    pub fn with_name(name: &str, message: impl fmt::Display) -> Self {
        Self {
            name: Some(name.into()),
            message: message.to_string().into(),
        }
    }

    /// The error name and message body of the reply. An invalid error name
    /// is replaced rather than producing an unsendable reply.
    pub(crate) fn into_parts(self) -> (Box<str>, Box<str>) {
        match self.name {
            Some(name) => match validate_error_name(&name) {
                Ok(()) => (name, self.message),
                Err(..) => (
                    INVALID_ERROR_NAME.into(),
                    format!("(invalid error name {name:?}) {}", self.message).into(),
                ),
            },
            None => (DEFAULT_ERROR_NAME.into(), self.message),
        }
    }
}

impl From<Error> for CallError {
    fn from(error: Error) -> Self {
        Self::new(error)
    }
}

/// A method call as seen by a handler.
#[derive(Debug)]
pub struct Invocation {
    /// The interface the call was resolved against.
    pub interface: Box<str>,
    /// The method name.
    pub member: Box<str>,
    /// The decoded arguments.
    pub args: Vec<Value>,
    /// The unique bus name of the caller, when the bus provided one.
    pub sender: Option<Box<str>>,
}

/// The outcome of a method handler.
pub type MethodResult = Result<Vec<Value>, CallError>;

/// The future returned by a method handler.
pub type MethodFuture = Pin<Box<dyn Future<Output = MethodResult> + Send>>;

type MethodHandler = Box<dyn FnMut(Invocation) -> MethodFuture + Send>;

/// Handler registration key: explicit bindings carry the interface name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum HandlerKey {
    Member(Box<str>),
    Bound(Box<str>, Box<str>),
}

/// Builder for an [`ExportedObject`].
pub struct ObjectBuilder {
    path: OwnedObjectPath,
    interfaces: Vec<Interface>,
    handlers: HashMap<HandlerKey, MethodHandler>,
    properties: HashMap<(Box<str>, Box<str>), Value>,
}

impl ObjectBuilder {
    /// Start building an object exported at the given path.
    pub fn new(path: &ObjectPath) -> Self {
        Self {
            path: path.to_owned(),
            interfaces: Vec::new(),
            handlers: HashMap::new(),
            properties: HashMap::new(),
        }
    }

    /// Declare an interface. Declaration order decides how calls without an
    /// `INTERFACE` header are resolved.
    pub fn interface(mut self, interface: Interface) -> Self {
        self.interfaces.retain(|i| i.name != interface.name);
        self.interfaces.push(interface);
        self
    }

    /// Register a handler for a method by member name, independent of which
    /// declared interface it is resolved through.
    pub fn handler<F, Fut>(mut self, member: &str, mut f: F) -> Self
    where
        F: FnMut(Invocation) -> Fut + Send + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        self.handlers.insert(
            HandlerKey::Member(member.into()),
            Box::new(move |invocation| Box::pin(f(invocation))),
        );
        self
    }

    /// Register a handler bound to an explicit `(interface, member)` pair,
    /// which takes precedence over a member-only handler. This is how a
    /// member shared by two interfaces is disambiguated.
    pub fn handler_on<F, Fut>(mut self, interface: &str, member: &str, mut f: F) -> Self
    where
        F: FnMut(Invocation) -> Fut + Send + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        self.handlers.insert(
            HandlerKey::Bound(interface.into(), member.into()),
            Box::new(move |invocation| Box::pin(f(invocation))),
        );
        self
    }

    /// Set the initial value of a declared property.
    pub fn property_value(mut self, interface: &str, name: &str, value: Value) -> Self {
        self.properties
            .insert((interface.into(), name.into()), value);
        self
    }

    /// Finish the object, validating interface members and property values
    /// against their declarations.
    pub fn build(self) -> Result<ExportedObject> {
        for interface in &self.interfaces {
            interface.validate_members()?;
        }

        for ((interface, name), value) in &self.properties {
            let Some(property) = self
                .interfaces
                .iter()
                .find(|i| *i.name == **interface)
                .and_then(|i| i.property(name))
            else {
                return Err(Error::new(ErrorKind::UnknownProperty(
                    format!("{interface}.{name}").into(),
                )));
            };

            value.expect(&property.signature)?;
        }

        Ok(ExportedObject {
            path: self.path,
            interfaces: self.interfaces,
            handlers: self.handlers,
            properties: self.properties,
        })
    }
}

/// An object exported on a connection: a path, declared interfaces and the
/// handlers and property values backing them.
pub struct ExportedObject {
    path: OwnedObjectPath,
    interfaces: Vec<Interface>,
    handlers: HashMap<HandlerKey, MethodHandler>,
    properties: HashMap<(Box<str>, Box<str>), Value>,
}

impl ExportedObject {
    /// The path the object is exported at.
    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    /// The declared interfaces, in declaration order.
    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    fn interface(&self, name: &str) -> Option<&Interface> {
        self.interfaces.iter().find(|i| &*i.name == name)
    }

    /// Find the property declaration for `(interface, name)`. An empty
    /// interface searches every declared interface in declaration order.
    fn find_property(&self, interface: &str, name: &str) -> Option<(&Interface, &Property)> {
        if interface.is_empty() {
            self.interfaces
                .iter()
                .find_map(|i| i.property(name).map(|p| (i, p)))
        } else {
            let i = self.interface(interface)?;
            i.property(name).map(|p| (i, p))
        }
    }

    /// The readable property values of one interface as dict entries.
    fn readable_properties(&self, interface: &Interface) -> Vec<(Value, Value)> {
        let mut entries = Vec::new();

        for property in interface.properties() {
            if !property.access().readable() {
                continue;
            }

            let key = (interface.name.clone(), property.name.clone());

            if let Some(value) = self.properties.get(&key) {
                entries.push((
                    Value::from(&*property.name),
                    Value::variant(value.clone()),
                ));
            }
        }

        entries
    }

    /// All interfaces with their readable properties, the
    /// `a{sa{sv}}`-shaped payload of `GetManagedObjects` and
    /// `InterfacesAdded`.
    fn interfaces_and_properties(&self) -> Value {
        let entries = self
            .interfaces
            .iter()
            .map(|interface| {
                let props = Value::Dict(
                    Signature::STRING.to_owned(),
                    Signature::VARIANT.to_owned(),
                    self.readable_properties(interface),
                );

                (Value::from(&*interface.name), props)
            })
            .collect();

        Value::Dict(
            Signature::STRING.to_owned(),
            OwnedSignature::new(b"a{sv}").expect("valid signature"),
            entries,
        )
    }
}

/// What the connection engine should do with an incoming method call.
pub(crate) enum Dispatch {
    /// Messages to queue, typically a reply and possibly signals.
    Messages(Vec<Message>),
    /// A handler future to drive; its outcome is turned into a reply
    /// through the template.
    Deferred {
        future: MethodFuture,
        template: ReplyTemplate,
    },
}

/// Everything needed to turn a handler outcome into a reply message.
pub(crate) struct ReplyTemplate {
    /// Reply serial and destination; `None` when the caller set
    /// `NO_REPLY_EXPECTED`.
    reply_to: Option<(NonZeroU32, Option<Box<str>>)>,
    /// The declared output signature the handler result must match.
    output: OwnedSignature,
}

impl ReplyTemplate {
    /// Build the reply message for a handler outcome, or `None` when no
    /// reply was requested.
    pub(crate) fn build(self, result: MethodResult) -> Option<Message> {
        let (reply_serial, destination) = self.reply_to?;

        let message = match result {
            Ok(values) => {
                let mut signature = OwnedSignature::empty();

                for value in &values {
                    match signature.extend_from_signature(&value.signature()) {
                        Ok(()) => {}
                        Err(e) => return Some(error_reply(
                            DEFAULT_ERROR_NAME,
                            e.to_string(),
                            reply_serial,
                            destination.as_deref(),
                        )),
                    }
                }

                if *signature != *self.output {
                    return Some(error_reply(
                        DEFAULT_ERROR_NAME,
                        format!(
                            "handler returned {:?}, declared output is {:?}",
                            signature.as_str(),
                            self.output.as_str()
                        ),
                        reply_serial,
                        destination.as_deref(),
                    ));
                }

                let mut message = Message::method_return(reply_serial).with_body(values);

                if let Some(destination) = &destination {
                    message = message.with_destination(destination);
                }

                message
            }
            Err(error) => {
                let (name, text) = error.into_parts();
                error_reply(&name, text, reply_serial, destination.as_deref())
            }
        };

        Some(message)
    }
}

fn error_reply(
    name: &str,
    text: impl fmt::Display,
    reply_serial: NonZeroU32,
    destination: Option<&str>,
) -> Message {
    let mut message =
        Message::error(name, reply_serial).with_body(vec![Value::from(text.to_string())]);

    if let Some(destination) = destination {
        message = message.with_destination(destination);
    }

    message
}

/// The standard interfaces every exported object answers for.
fn standard_interfaces() -> &'static [Interface] {
    static STANDARD: OnceLock<Vec<Interface>> = OnceLock::new();

    STANDARD.get_or_init(|| {
        let peer = Interface::new(fdo::PEER)
            .expect("valid interface name")
            .with_method(Method::new("Ping", Signature::EMPTY, Signature::EMPTY))
            .with_method(Method::new("GetMachineId", Signature::EMPTY, Signature::STRING));

        let introspectable = Interface::new(fdo::INTROSPECTABLE)
            .expect("valid interface name")
            .with_method(Method::new("Introspect", Signature::EMPTY, Signature::STRING));

        let properties = Interface::new(fdo::PROPERTIES)
            .expect("valid interface name")
            .with_method(Method::new(
                "Get",
                Signature::new_const(b"ss"),
                Signature::VARIANT,
            ))
            .with_method(Method::new(
                "Set",
                Signature::new_const(b"ssv"),
                Signature::EMPTY,
            ))
            .with_method(Method::new(
                "GetAll",
                Signature::STRING,
                Signature::new_const(b"a{sv}"),
            ))
            .with_signal(SignalDef::new(
                "PropertiesChanged",
                Signature::new_const(b"sa{sv}as"),
            ));

        let object_manager = Interface::new(fdo::OBJECT_MANAGER)
            .expect("valid interface name")
            .with_method(Method::new(
                "GetManagedObjects",
                Signature::EMPTY,
                Signature::new_const(b"a{oa{sa{sv}}}"),
            ))
            .with_signal(SignalDef::new(
                "InterfacesAdded",
                Signature::new_const(b"oa{sa{sv}}"),
            ))
            .with_signal(SignalDef::new(
                "InterfacesRemoved",
                Signature::new_const(b"oas"),
            ));

        vec![peer, introspectable, properties, object_manager]
    })
}

/// The local path to exported object map, and the dispatcher which serves
/// incoming method calls from it.
pub(crate) struct ObjectRegistry {
    objects: HashMap<OwnedObjectPath, ExportedObject>,
    machine_id: Box<str>,
}

impl ObjectRegistry {
    pub(crate) fn new() -> Self {
        Self {
            objects: HashMap::new(),
            machine_id: read_machine_id(),
        }
    }

    /// Export an object, rejecting path collisions. Returns the
    /// `InterfacesAdded` signal to emit.
    pub(crate) fn export(&mut self, object: ExportedObject) -> Result<Message> {
        if self.objects.contains_key(&object.path) {
            return Err(Error::new(ErrorKind::PathAlreadyExported(
                object.path.as_str().into(),
            )));
        }

        let signal = Message::signal(&object.path, "InterfacesAdded")
            .with_interface(fdo::OBJECT_MANAGER)
            .with_body(vec![
                Value::ObjectPath(object.path.clone()),
                object.interfaces_and_properties(),
            ]);

        self.objects.insert(object.path.clone(), object);
        Ok(signal)
    }

    /// Stop exporting the object at a path. Returns the
    /// `InterfacesRemoved` signal to emit, or `None` if nothing was
    /// exported there.
    pub(crate) fn unexport(&mut self, path: &ObjectPath) -> Option<Message> {
        let object = self.objects.remove(path)?;

        let names = object
            .interfaces
            .iter()
            .map(|i| Value::from(&*i.name))
            .collect();

        Some(
            Message::signal(&object.path, "InterfacesRemoved")
                .with_interface(fdo::OBJECT_MANAGER)
                .with_body(vec![
                    Value::ObjectPath(object.path.clone()),
                    Value::Array(Signature::STRING.to_owned(), names),
                ]),
        )
    }

    /// Read the stored value of an exported property.
    pub(crate) fn property(&self, path: &ObjectPath, interface: &str, name: &str) -> Option<Value> {
        let object = self.objects.get(path)?;
        let (interface, _) = object.find_property(interface, name)?;
        object
            .properties
            .get(&(interface.name.clone(), name.into()))
            .cloned()
    }

    /// Update the stored value of an exported property, returning the
    /// `PropertiesChanged` signal to emit, if the property emits one.
    pub(crate) fn set_property(
        &mut self,
        path: &ObjectPath,
        interface: &str,
        name: &str,
        value: Value,
        enforce_access: bool,
    ) -> Result<Option<Message>, CallError> {
        let Some(object) = self.objects.get_mut(path) else {
            return Err(CallError::with_name(
                fdo::ERR_UNKNOWN_OBJECT,
                format!("{} is not an object provided by this process", path.as_str()),
            ));
        };

        let Some((iface, property)) = object.find_property(interface, name) else {
            return Err(CallError::with_name(
                fdo::ERR_UNKNOWN_PROPERTY,
                format!("no property {name:?} on {interface:?}"),
            ));
        };

        if enforce_access && !property.access().writeable() {
            return Err(CallError::with_name(
                fdo::ERR_PROPERTY_READ_ONLY,
                format!("property {name:?} is not writeable"),
            ));
        }

        if value.expect(&property.signature).is_err() {
            return Err(CallError::with_name(
                fdo::ERR_INVALID_ARGS,
                format!(
                    "property {name:?} has type {:?}",
                    property.signature.as_str()
                ),
            ));
        }

        let iface_name = iface.name.clone();
        let emits = property.emits_changed();
        let path = object.path.clone();

        object
            .properties
            .insert((iface_name.clone(), name.into()), value.clone());

        let signal = match emits {
            crate::interface::EmitsChanged::True => Some(properties_changed(
                &path,
                &iface_name,
                vec![(Value::from(name), Value::variant(value))],
                vec![],
            )),
            crate::interface::EmitsChanged::Invalidates => Some(properties_changed(
                &path,
                &iface_name,
                vec![],
                vec![Value::from(name)],
            )),
            crate::interface::EmitsChanged::False => None,
        };

        Ok(signal)
    }

    /// Build a signal message for a declared signal, validating the
    /// arguments against the declared signature.
    pub(crate) fn signal(
        &self,
        path: &ObjectPath,
        interface: Option<&str>,
        member: &str,
        args: Vec<Value>,
    ) -> Result<Message> {
        let Some(object) = self.objects.get(path) else {
            return Err(Error::new(ErrorKind::UnknownSignal(member.into())));
        };

        let mut found = None;

        for i in &object.interfaces {
            if let Some(interface) = interface {
                if &*i.name != interface {
                    continue;
                }
            }

            if let Some(signal) = i.signal(member) {
                found = Some((i, signal));
                break;
            }
        }

        let Some((iface, signal)) = found else {
            return Err(Error::new(ErrorKind::UnknownSignal(member.into())));
        };

        let mut signature = OwnedSignature::empty();

        for arg in &args {
            signature.extend_from_signature(&arg.signature())?;
        }

        if *signature != *signal.signature {
            return Err(Error::new(ErrorKind::UnexpectedReplySignature {
                expected: signal.signature.as_str().into(),
                actual: signature.as_str().into(),
            }));
        }

        Ok(Message::signal(path, member)
            .with_interface(&iface.name)
            .with_body(args))
    }

    /// Serve an incoming method call.
    pub(crate) fn dispatch(&mut self, message: &Message) -> Dispatch {
        let Some(serial) = message.serial() else {
            return Dispatch::Messages(Vec::new());
        };

        let reply_to = message
            .expects_reply()
            .then(|| (serial, message.sender().map(Box::from)));

        let Some(path) = message.path() else {
            return Dispatch::Messages(Vec::new());
        };

        let path = path.to_owned();
        let member = message.member().unwrap_or_default().to_string();
        let interface = message.interface().map(str::to_string);
        let sender = message.sender().map(Box::from);

        // Ping targets the peer itself; it is answered before any object
        // lookup, matching the reference bus behavior.
        if member == "Ping" && matches!(interface.as_deref(), Some(fdo::PEER)) {
            return finish(reply_to, Ok(Vec::new()));
        }

        if member == "GetMachineId" && matches!(interface.as_deref(), Some(fdo::PEER)) {
            let id = Value::from(&*self.machine_id);
            return finish(reply_to, Ok(vec![id]));
        }

        if member == "Introspect" && matches!(interface.as_deref(), Some(fdo::INTROSPECTABLE)) {
            let result = self.introspect(&path);
            return finish(reply_to, result);
        }

        if !self.objects.contains_key(&path) {
            return finish(
                reply_to,
                Err(CallError::with_name(
                    fdo::ERR_UNKNOWN_OBJECT,
                    format!(
                        "{} is not an object provided by this process",
                        path.as_str()
                    ),
                )),
            );
        }

        // Remaining standard-interface members, which need the object.
        match (interface.as_deref(), member.as_str()) {
            (Some(fdo::PROPERTIES), "Get" | "Set" | "GetAll") => {
                return self.dispatch_properties(reply_to, &path, &member, message);
            }
            (Some(fdo::OBJECT_MANAGER), "GetManagedObjects") => {
                let result = Ok(vec![self.managed_objects(&path)]);
                return finish(reply_to, result);
            }
            _ => {}
        }

        // Select the interface: an explicit header picks it exactly, and
        // without one the first declaring interface in declaration order
        // wins.
        let resolved = {
            let object = &self.objects[&path];

            match &interface {
                Some(name) => object
                    .interface(name)
                    .and_then(|i| i.method(&member).map(|m| (i.name.clone(), m.clone()))),
                None => object
                    .interfaces
                    .iter()
                    .find_map(|i| i.method(&member).map(|m| (i.name.clone(), m.clone()))),
            }
        };

        let Some((interface_name, method)) = resolved else {
            // Fall back to standard members when no interface was named.
            if interface.is_none() {
                if let Some(dispatch) =
                    self.dispatch_standard_fallback(&reply_to, &path, &member, message)
                {
                    return dispatch;
                }
            }

            return finish(
                reply_to,
                Err(CallError::with_name(
                    fdo::ERR_UNKNOWN_METHOD,
                    format!(
                        "method {member:?} with signature {:?} on interface {} does not exist",
                        message
                            .body_signature()
                            .map(|s| s.to_string())
                            .unwrap_or_default(),
                        interface.as_deref().unwrap_or("(null)")
                    ),
                )),
            );
        };

        let actual = message
            .body_signature()
            .unwrap_or_else(|_| OwnedSignature::empty());

        if *actual != *method.input {
            return finish(
                reply_to,
                Err(CallError::with_name(
                    fdo::ERR_INVALID_ARGS,
                    format!(
                        "call to {member} has wrong args ({}, expected {})",
                        actual.as_str(),
                        method.input.as_str()
                    ),
                )),
            );
        }

        let object = self
            .objects
            .get_mut(&path)
            .expect("object looked up above");

        // An explicit binding beats a member-only handler.
        let key = HandlerKey::Bound(interface_name.clone(), member.clone().into());
        let handler = match object.handlers.contains_key(&key) {
            true => object.handlers.get_mut(&key),
            false => object
                .handlers
                .get_mut(&HandlerKey::Member(member.clone().into())),
        };

        let Some(handler) = handler else {
            return finish(
                reply_to,
                Err(CallError::with_name(
                    fdo::ERR_UNKNOWN_METHOD,
                    format!("method {member:?} is declared but not implemented"),
                )),
            );
        };

        let invocation = Invocation {
            interface: interface_name,
            member: member.into(),
            args: message.body().to_vec(),
            sender,
        };

        Dispatch::Deferred {
            future: handler(invocation),
            template: ReplyTemplate {
                reply_to,
                output: method.output.clone(),
            },
        }
    }

    /// Standard members reachable without an `INTERFACE` header, tried
    /// after the declared interfaces.
    fn dispatch_standard_fallback(
        &mut self,
        reply_to: &Option<(NonZeroU32, Option<Box<str>>)>,
        path: &ObjectPath,
        member: &str,
        message: &Message,
    ) -> Option<Dispatch> {
        match member {
            "Ping" => Some(finish(reply_to.clone(), Ok(Vec::new()))),
            "GetMachineId" => {
                let id = Value::from(&*self.machine_id);
                Some(finish(reply_to.clone(), Ok(vec![id])))
            }
            "Introspect" => {
                let result = self.introspect(path);
                Some(finish(reply_to.clone(), result))
            }
            "Get" | "Set" | "GetAll" => {
                Some(self.dispatch_properties(reply_to.clone(), path, member, message))
            }
            "GetManagedObjects" => {
                let result = Ok(vec![self.managed_objects(path)]);
                Some(finish(reply_to.clone(), result))
            }
            _ => None,
        }
    }

    fn dispatch_properties(
        &mut self,
        reply_to: Option<(NonZeroU32, Option<Box<str>>)>,
        path: &ObjectPath,
        member: &str,
        message: &Message,
    ) -> Dispatch {
        match member {
            "Get" => {
                let result = self.properties_get(path, message.body());
                finish(reply_to, result)
            }
            "GetAll" => {
                let result = self.properties_get_all(path, message.body());
                finish(reply_to, result)
            }
            "Set" => {
                let (result, signal) = self.properties_set(path, message.body());

                match result {
                    Ok(values) => {
                        let mut messages = Vec::new();

                        if let Dispatch::Messages(replies) = finish(reply_to, Ok(values)) {
                            messages.extend(replies);
                        }

                        messages.extend(signal);
                        Dispatch::Messages(messages)
                    }
                    Err(error) => finish(reply_to, Err(error)),
                }
            }
            _ => Dispatch::Messages(Vec::new()),
        }
    }

    fn properties_get(&self, path: &ObjectPath, args: &[Value]) -> MethodResult {
        let [Value::String(interface), Value::String(name)] = args else {
            return Err(CallError::with_name(
                fdo::ERR_INVALID_ARGS,
                "Get takes (ss)",
            ));
        };

        let object = self
            .objects
            .get(path)
            .ok_or_else(|| CallError::with_name(fdo::ERR_UNKNOWN_OBJECT, path.as_str()))?;

        let Some((iface, property)) = object.find_property(interface, name) else {
            return Err(CallError::with_name(
                fdo::ERR_UNKNOWN_PROPERTY,
                format!("no property {name:?} on {interface:?}"),
            ));
        };

        if !property.access().readable() {
            return Err(CallError::with_name(
                fdo::ERR_PROPERTY_READ_ONLY,
                format!("property {name:?} is not readable"),
            ));
        }

        let value = object
            .properties
            .get(&(iface.name.clone(), name.clone().into()))
            .cloned()
            .ok_or_else(|| {
                CallError::with_name(
                    fdo::ERR_UNKNOWN_PROPERTY,
                    format!("property {name:?} has no value"),
                )
            })?;

        Ok(vec![Value::variant(value)])
    }

    fn properties_get_all(&self, path: &ObjectPath, args: &[Value]) -> MethodResult {
        let [Value::String(interface)] = args else {
            return Err(CallError::with_name(
                fdo::ERR_INVALID_ARGS,
                "GetAll takes (s)",
            ));
        };

        let object = self
            .objects
            .get(path)
            .ok_or_else(|| CallError::with_name(fdo::ERR_UNKNOWN_OBJECT, path.as_str()))?;

        let mut entries = Vec::new();

        for iface in &object.interfaces {
            if !interface.is_empty() && **interface != *iface.name {
                continue;
            }

            entries.extend(object.readable_properties(iface));
        }

        Ok(vec![Value::Dict(
            Signature::STRING.to_owned(),
            Signature::VARIANT.to_owned(),
            entries,
        )])
    }

    fn properties_set(
        &mut self,
        path: &ObjectPath,
        args: &[Value],
    ) -> (Result<Vec<Value>, CallError>, Option<Message>) {
        let [Value::String(interface), Value::String(name), value] = args else {
            return (
                Err(CallError::with_name(
                    fdo::ERR_INVALID_ARGS,
                    "Set takes (ssv)",
                )),
                None,
            );
        };

        let value = value.clone().into_inner();

        match self.set_property(path, interface, name, value, true) {
            Ok(signal) => (Ok(Vec::new()), signal),
            Err(error) => (Err(error), None),
        }
    }

    fn introspect(&self, path: &ObjectPath) -> MethodResult {
        let xml = match self.objects.get(path) {
            Some(object) => {
                let mut interfaces: Vec<&Interface> = object.interfaces.iter().collect();
                interfaces.extend(standard_interfaces());

                let children = self.children_of(path);
                let children: Vec<&str> = children.iter().map(|c| &**c).collect();

                introspect::generate(path, &interfaces, &children)
            }
            None => {
                let exported: Vec<&ObjectPath> =
                    self.objects.keys().map(|p| &**p).collect();

                match introspect::generate_partial(path, &exported) {
                    Some(xml) => xml,
                    None => {
                        return Err(CallError::with_name(
                            fdo::ERR_UNKNOWN_OBJECT,
                            format!(
                                "{} is not an object provided by this process",
                                path.as_str()
                            ),
                        ));
                    }
                }
            }
        };

        Ok(vec![Value::from(xml)])
    }

    /// Immediate child segment names of exported objects under a path.
    fn children_of(&self, path: &ObjectPath) -> Vec<String> {
        let mut children = Vec::new();

        for candidate in self.objects.keys() {
            if **candidate == *path || !candidate.starts_with(path) {
                continue;
            }

            let rest = &candidate.as_str()[path.as_str().len()..];
            let rest = rest.strip_prefix('/').unwrap_or(rest);

            if let Some(child) = rest.split('/').next() {
                let child = child.to_string();

                if !children.contains(&child) {
                    children.push(child);
                }
            }
        }

        children.sort();
        children
    }

    /// The `GetManagedObjects` payload: exported objects strictly below the
    /// given path.
    fn managed_objects(&self, path: &ObjectPath) -> Value {
        let mut paths: Vec<&OwnedObjectPath> = self.objects.keys().collect();
        paths.sort();

        let mut entries = Vec::new();

        for p in paths {
            if **p == *path || !p.starts_with(path) {
                continue;
            }

            let object = &self.objects[p];

            entries.push((
                Value::ObjectPath(p.clone()),
                object.interfaces_and_properties(),
            ));
        }

        Value::Dict(
            Signature::OBJECT_PATH.to_owned(),
            OwnedSignature::new(b"a{sa{sv}}").expect("valid signature"),
            entries,
        )
    }

}

/// Turn an immediate outcome into the messages to queue, honoring
/// `NO_REPLY_EXPECTED`.
fn finish(reply_to: Option<(NonZeroU32, Option<Box<str>>)>, result: MethodResult) -> Dispatch {
    let Some((reply_serial, destination)) = reply_to else {
        return Dispatch::Messages(Vec::new());
    };

    let message = match result {
        Ok(values) => {
            let mut message = Message::method_return(reply_serial).with_body(values);

            if let Some(destination) = &destination {
                message = message.with_destination(destination);
            }

            message
        }
        Err(error) => {
            let (name, text) = error.into_parts();
            error_reply(&name, text, reply_serial, destination.as_deref())
        }
    };

    Dispatch::Messages(vec![message])
}

/// Build a `PropertiesChanged` signal message.
fn properties_changed(
    path: &ObjectPath,
    interface: &str,
    changed: Vec<(Value, Value)>,
    invalidated: Vec<Value>,
) -> Message {
    Message::signal(path, "PropertiesChanged")
        .with_interface(fdo::PROPERTIES)
        .with_body(vec![
            Value::from(interface),
            Value::Dict(
                Signature::STRING.to_owned(),
                Signature::VARIANT.to_owned(),
                changed,
            ),
            Value::Array(Signature::STRING.to_owned(), invalidated),
        ])
}

/// The machine id served by `Peer.GetMachineId`, read from the usual
/// locations with a stable random fallback.
fn read_machine_id() -> Box<str> {
    for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
        if let Ok(contents) = std::fs::read_to_string(path) {
            let id = contents.trim();

            if !id.is_empty() {
                return id.into();
            }
        }
    }

    let random = rand::random::<[u8; 16]>();
    String::from_utf8(crate::utils::hex_encode(&random))
        .expect("hex is ascii")
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::EmitsChanged;
    use crate::message::MessageKind;

    fn serial(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).unwrap()
    }

    fn call(path: &str, interface: Option<&str>, member: &str, body: Vec<Value>) -> Message {
        let mut m = Message::method_call(ObjectPath::new(path).unwrap(), member)
            .with_serial(serial(42))
            .with_sender(":1.99")
            .with_body(body);

        if let Some(interface) = interface {
            m = m.with_interface(interface);
        }

        m
    }

    fn widget_registry() -> ObjectRegistry {
        let a = Interface::new("org.example.A")
            .unwrap()
            .with_method(Method::new("Common", Signature::EMPTY, Signature::STRING))
            .with_property(
                Property::new("foo", Signature::STRING).writeable(),
            );

        let b = Interface::new("org.example.B")
            .unwrap()
            .with_method(Method::new("Common", Signature::EMPTY, Signature::STRING));

        let object = ObjectBuilder::new(ObjectPath::new("/org/example/w").unwrap())
            .interface(a)
            .interface(b)
            .handler("Common", |_| async { Ok(vec![Value::from("via A")]) })
            .handler_on("org.example.B", "Common", |_| async {
                Ok(vec![Value::from("via B")])
            })
            .property_value("org.example.A", "foo", "bar".into())
            .build()
            .unwrap();

        let mut registry = ObjectRegistry::new();
        registry.export(object).unwrap();
        registry
    }

    async fn run(dispatch: Dispatch) -> Vec<Message> {
        match dispatch {
            Dispatch::Messages(messages) => messages,
            Dispatch::Deferred { future, template } => {
                template.build(future.await).into_iter().collect()
            }
        }
    }

    fn reply_body(messages: &[Message]) -> &[Value] {
        assert_eq!(messages.len(), 1);
        assert!(
            matches!(messages[0].kind(), MessageKind::MethodReturn { .. }),
            "expected method return, got {:?}",
            messages[0]
        );
        messages[0].body()
    }

    fn error_name(messages: &[Message]) -> &str {
        assert_eq!(messages.len(), 1);

        let MessageKind::Error { error_name, .. } = messages[0].kind() else {
            panic!("expected error, got {:?}", messages[0]);
        };

        error_name
    }

    #[tokio::test]
    async fn ambiguous_member_resolves_in_declaration_order() {
        let mut registry = widget_registry();

        // Without INTERFACE the first declaring interface wins, and the
        // member-only handler runs.
        let messages = run(registry.dispatch(&call("/org/example/w", None, "Common", vec![]))).await;
        assert_eq!(reply_body(&messages), [Value::from("via A")]);

        // With INTERFACE=B the explicit binding runs.
        let messages = run(registry.dispatch(&call(
            "/org/example/w",
            Some("org.example.B"),
            "Common",
            vec![],
        )))
        .await;
        assert_eq!(reply_body(&messages), [Value::from("via B")]);

        // With INTERFACE=A the member-only handler still runs.
        let messages = run(registry.dispatch(&call(
            "/org/example/w",
            Some("org.example.A"),
            "Common",
            vec![],
        )))
        .await;
        assert_eq!(reply_body(&messages), [Value::from("via A")]);
    }

    #[tokio::test]
    async fn unknown_object_and_method() {
        let mut registry = widget_registry();

        let messages = run(registry.dispatch(&call("/no/such", None, "Common", vec![]))).await;
        assert_eq!(error_name(&messages), fdo::ERR_UNKNOWN_OBJECT);

        let messages =
            run(registry.dispatch(&call("/org/example/w", None, "Missing", vec![]))).await;
        assert_eq!(error_name(&messages), fdo::ERR_UNKNOWN_METHOD);

        let messages = run(registry.dispatch(&call(
            "/org/example/w",
            Some("org.example.A"),
            "Missing",
            vec![],
        )))
        .await;
        assert_eq!(error_name(&messages), fdo::ERR_UNKNOWN_METHOD);
    }

    #[tokio::test]
    async fn wrong_arguments_rejected() {
        let mut registry = widget_registry();

        let messages = run(registry.dispatch(&call(
            "/org/example/w",
            None,
            "Common",
            vec![Value::UInt32(1)],
        )))
        .await;
        assert_eq!(error_name(&messages), fdo::ERR_INVALID_ARGS);
    }

    #[tokio::test]
    async fn property_get_set_emits_changed() {
        let mut registry = widget_registry();

        // Get with an empty interface searches the declared interfaces.
        let messages = run(registry.dispatch(&call(
            "/org/example/w",
            Some(fdo::PROPERTIES),
            "Get",
            vec!["".into(), "foo".into()],
        )))
        .await;
        assert_eq!(
            reply_body(&messages),
            [Value::variant(Value::from("bar"))]
        );

        let messages = run(registry.dispatch(&call(
            "/org/example/w",
            Some(fdo::PROPERTIES),
            "Set",
            vec!["".into(), "foo".into(), Value::variant(Value::from("baz"))],
        )))
        .await;

        // The reply plus a PropertiesChanged signal.
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0].kind(), MessageKind::MethodReturn { .. }));

        let signal = &messages[1];
        assert!(
            matches!(signal.kind(), MessageKind::Signal { member, .. } if &**member == "PropertiesChanged")
        );
        assert_eq!(signal.interface(), Some(fdo::PROPERTIES));

        let expected_changed = Value::Dict(
            Signature::STRING.to_owned(),
            Signature::VARIANT.to_owned(),
            vec![("foo".into(), Value::variant(Value::from("baz")))],
        );
        let expected_invalidated = Value::Array(Signature::STRING.to_owned(), vec![]);

        assert_eq!(
            signal.body(),
            [
                Value::from("org.example.A"),
                expected_changed,
                expected_invalidated,
            ]
        );

        // A subsequent Get observes the new value.
        let messages = run(registry.dispatch(&call(
            "/org/example/w",
            Some(fdo::PROPERTIES),
            "Get",
            vec!["org.example.A".into(), "foo".into()],
        )))
        .await;
        assert_eq!(
            reply_body(&messages),
            [Value::variant(Value::from("baz"))]
        );
    }

    #[tokio::test]
    async fn property_set_validates_type_and_access() {
        let read_only = Interface::new("org.example.R")
            .unwrap()
            .with_property(Property::new("ro", Signature::UINT32));

        let object = ObjectBuilder::new(ObjectPath::new("/r").unwrap())
            .interface(read_only)
            .property_value("org.example.R", "ro", Value::UInt32(1))
            .build()
            .unwrap();

        let mut registry = ObjectRegistry::new();
        registry.export(object).unwrap();

        let messages = run(registry.dispatch(&call(
            "/r",
            Some(fdo::PROPERTIES),
            "Set",
            vec![
                "org.example.R".into(),
                "ro".into(),
                Value::variant(Value::UInt32(2)),
            ],
        )))
        .await;
        assert_eq!(error_name(&messages), fdo::ERR_PROPERTY_READ_ONLY);

        let mut registry = widget_registry();

        let messages = run(registry.dispatch(&call(
            "/org/example/w",
            Some(fdo::PROPERTIES),
            "Set",
            vec![
                "org.example.A".into(),
                "foo".into(),
                Value::variant(Value::UInt32(2)),
            ],
        )))
        .await;
        assert_eq!(error_name(&messages), fdo::ERR_INVALID_ARGS);
    }

    #[tokio::test]
    async fn invalidating_property_omits_the_value() {
        let iface = Interface::new("org.example.I").unwrap().with_property(
            Property::new("p", Signature::STRING)
                .writeable()
                .with_emits_changed(EmitsChanged::Invalidates),
        );

        let object = ObjectBuilder::new(ObjectPath::new("/i").unwrap())
            .interface(iface)
            .property_value("org.example.I", "p", "x".into())
            .build()
            .unwrap();

        let mut registry = ObjectRegistry::new();
        registry.export(object).unwrap();

        let signal = registry
            .set_property(
                ObjectPath::new("/i").unwrap(),
                "org.example.I",
                "p",
                "y".into(),
                false,
            )
            .unwrap()
            .unwrap();

        let expected_changed = Value::Dict(
            Signature::STRING.to_owned(),
            Signature::VARIANT.to_owned(),
            vec![],
        );
        let expected_invalidated =
            Value::Array(Signature::STRING.to_owned(), vec!["p".into()]);

        assert_eq!(
            signal.body(),
            [
                Value::from("org.example.I"),
                expected_changed,
                expected_invalidated,
            ]
        );
    }

    #[tokio::test]
    async fn get_all_returns_readable_values() {
        let mut registry = widget_registry();

        let messages = run(registry.dispatch(&call(
            "/org/example/w",
            Some(fdo::PROPERTIES),
            "GetAll",
            vec!["org.example.A".into()],
        )))
        .await;

        let body = reply_body(&messages);
        let Value::Dict(_, _, entries) = &body[0] else {
            panic!("expected dict");
        };

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, Value::from("foo"));
    }

    #[tokio::test]
    async fn ping_answers_before_object_lookup() {
        let mut registry = widget_registry();

        let messages = run(registry.dispatch(&call(
            "/not/exported",
            Some(fdo::PEER),
            "Ping",
            vec![],
        )))
        .await;
        assert_eq!(reply_body(&messages), []);
    }

    #[tokio::test]
    async fn introspection_lists_interfaces_and_children() {
        let mut registry = widget_registry();

        let messages = run(registry.dispatch(&call(
            "/org/example/w",
            Some(fdo::INTROSPECTABLE),
            "Introspect",
            vec![],
        )))
        .await;

        let body = reply_body(&messages);
        let xml = body[0].as_str().unwrap();

        assert!(xml.contains("org.example.A"));
        assert!(xml.contains("org.example.B"));
        assert!(xml.contains(fdo::PEER));
        assert!(xml.contains(fdo::PROPERTIES));

        // A partial path produces node stubs.
        let messages = run(registry.dispatch(&call(
            "/org/example",
            Some(fdo::INTROSPECTABLE),
            "Introspect",
            vec![],
        )))
        .await;

        let body = reply_body(&messages);
        assert!(body[0].as_str().unwrap().contains("<node name=\"w\"/>"));
    }

    #[tokio::test]
    async fn no_reply_expected_suppresses_replies() {
        use crate::proto::Flags;

        let mut registry = widget_registry();

        let m = call("/org/example/w", None, "Common", vec![])
            .with_flags(Flags::NO_REPLY_EXPECTED);

        let messages = run(registry.dispatch(&m)).await;
        assert!(messages.is_empty());

        // Errors are suppressed as well.
        let m = call("/no/such", None, "Common", vec![]).with_flags(Flags::NO_REPLY_EXPECTED);
        let messages = run(registry.dispatch(&m)).await;
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn handler_error_becomes_error_reply() {
        let iface = Interface::new("org.example.F")
            .unwrap()
            .with_method(Method::new("Fail", Signature::EMPTY, Signature::EMPTY))
            .with_method(Method::new("FailNamed", Signature::EMPTY, Signature::EMPTY))
            .with_method(Method::new("FailBadName", Signature::EMPTY, Signature::EMPTY));

        let object = ObjectBuilder::new(ObjectPath::new("/f").unwrap())
            .interface(iface)
            .handler("Fail", |_| async { Err(CallError::new("boom")) })
            .handler("FailNamed", |_| async {
                Err(CallError::with_name("org.example.Error.Custom", "boom"))
            })
            .handler("FailBadName", |_| async {
                Err(CallError::with_name("not a name", "boom"))
            })
            .build()
            .unwrap();

        let mut registry = ObjectRegistry::new();
        registry.export(object).unwrap();

        let messages = run(registry.dispatch(&call("/f", None, "Fail", vec![]))).await;
        assert_eq!(error_name(&messages), DEFAULT_ERROR_NAME);
        assert_eq!(messages[0].body(), [Value::from("boom")]);

        let messages = run(registry.dispatch(&call("/f", None, "FailNamed", vec![]))).await;
        assert_eq!(error_name(&messages), "org.example.Error.Custom");

        let messages = run(registry.dispatch(&call("/f", None, "FailBadName", vec![]))).await;
        assert_eq!(error_name(&messages), INVALID_ERROR_NAME);
    }

    #[tokio::test]
    async fn handler_output_signature_is_validated() {
        let iface = Interface::new("org.example.O")
            .unwrap()
            .with_method(Method::new("M", Signature::EMPTY, Signature::STRING));

        let object = ObjectBuilder::new(ObjectPath::new("/o").unwrap())
            .interface(iface)
            .handler("M", |_| async { Ok(vec![Value::UInt32(1)]) })
            .build()
            .unwrap();

        let mut registry = ObjectRegistry::new();
        registry.export(object).unwrap();

        let messages = run(registry.dispatch(&call("/o", None, "M", vec![]))).await;
        assert_eq!(error_name(&messages), DEFAULT_ERROR_NAME);
    }

    #[tokio::test]
    async fn caller_identity_is_passed_to_handlers() {
        let iface = Interface::new("org.example.C")
            .unwrap()
            .with_method(Method::new("Who", Signature::EMPTY, Signature::STRING));

        let object = ObjectBuilder::new(ObjectPath::new("/c").unwrap())
            .interface(iface)
            .handler("Who", |invocation: Invocation| async move {
                Ok(vec![Value::from(
                    invocation.sender.as_deref().unwrap_or("nobody"),
                )])
            })
            .build()
            .unwrap();

        let mut registry = ObjectRegistry::new();
        registry.export(object).unwrap();

        let messages = run(registry.dispatch(&call("/c", None, "Who", vec![]))).await;
        assert_eq!(reply_body(&messages), [Value::from(":1.99")]);
    }

    #[test]
    fn export_collision_rejected() {
        let mut registry = widget_registry();

        let duplicate = ObjectBuilder::new(ObjectPath::new("/org/example/w").unwrap())
            .build()
            .unwrap();

        assert!(registry.export(duplicate).is_err());
    }

    #[test]
    fn export_and_unexport_emit_object_manager_signals() {
        let mut registry = ObjectRegistry::new();

        let object = ObjectBuilder::new(ObjectPath::new("/org/x").unwrap())
            .interface(Interface::new("org.example.A").unwrap())
            .build()
            .unwrap();

        let added = registry.export(object).unwrap();
        assert!(matches!(
            added.kind(),
            MessageKind::Signal { member, .. } if &**member == "InterfacesAdded"
        ));
        assert_eq!(added.interface(), Some(fdo::OBJECT_MANAGER));

        let removed = registry
            .unexport(ObjectPath::new("/org/x").unwrap())
            .unwrap();
        assert!(matches!(
            removed.kind(),
            MessageKind::Signal { member, .. } if &**member == "InterfacesRemoved"
        ));

        assert!(registry.unexport(ObjectPath::new("/org/x").unwrap()).is_none());
    }

    #[test]
    fn declared_signal_emission_validates_signature() {
        let iface = Interface::new("org.example.S")
            .unwrap()
            .with_signal(SignalDef::new("Pulse", Signature::UINT32));

        let object = ObjectBuilder::new(ObjectPath::new("/s").unwrap())
            .interface(iface)
            .build()
            .unwrap();

        let mut registry = ObjectRegistry::new();
        registry.export(object).unwrap();

        let path = ObjectPath::new("/s").unwrap();

        let signal = registry
            .signal(path, None, "Pulse", vec![Value::UInt32(7)])
            .unwrap();
        assert_eq!(signal.interface(), Some("org.example.S"));
        assert_eq!(signal.body(), [Value::UInt32(7)]);

        assert!(registry
            .signal(path, None, "Pulse", vec![Value::from("wrong")])
            .is_err());
        assert!(registry.signal(path, None, "Missing", vec![]).is_err());
    }

    #[test]
    fn property_value_must_match_declaration() {
        let iface = Interface::new("org.example.P")
            .unwrap()
            .with_property(Property::new("n", Signature::UINT32));

        let bad = ObjectBuilder::new(ObjectPath::new("/p").unwrap())
            .interface(iface)
            .property_value("org.example.P", "n", "wrong type".into())
            .build();

        assert!(bad.is_err());
    }
}
