//! Proxies for remote objects.

use crate::connection::{CallOptions, Connection, MatchGuard, ReturnValue};
use crate::error::{Error, ErrorKind, Result};
use crate::interface::{Interface, Method, SignalDef};
use crate::introspect;
use crate::match_rule::{MatchRule, MatchType};
use crate::message::Message;
use crate::org_freedesktop_dbus as fdo;
use crate::value::Value;
use crate::{ObjectPath, OwnedObjectPath, OwnedSignature};

/// A local representation of a remote object.
///
/// A proxy pairs a bus name and an object path with a set of interface
/// descriptions, either supplied explicitly or obtained by introspection,
/// and offers typed method invocation and signal subscription against them.
///
/// # Examples
///
/// ```no_run
/// use tokbus::{CallOptions, Connection, Value};
///
/// # #[tokio::main] async fn main() -> tokbus::Result<()> {
/// let c = Connection::session().await?;
///
/// // Without explicit interfaces the remote object is introspected.
/// let proxy = c
///     .get_remote_object("org.freedesktop.DBus", "/org/freedesktop/DBus", None)
///     .await?;
///
/// let names = proxy
///     .call_remote("ListNames", Vec::new(), CallOptions::new())
///     .await?;
/// # Ok(()) }
/// ```
pub struct Proxy {
    connection: Connection,
    destination: Box<str>,
    path: OwnedObjectPath,
    interfaces: Vec<Interface>,
}

impl Proxy {
    pub(crate) fn new(
        connection: Connection,
        destination: Box<str>,
        path: OwnedObjectPath,
        interfaces: Vec<Interface>,
    ) -> Self {
        Self {
            connection,
            destination,
            path,
            interfaces,
        }
    }

    /// Construct a proxy by introspecting the remote object.
    pub(crate) async fn introspected(
        connection: Connection,
        destination: Box<str>,
        path: OwnedObjectPath,
    ) -> Result<Proxy> {
        let mut proxy = Self::new(connection, destination, path, Vec::new());
        proxy.introspect().await?;
        Ok(proxy)
    }

    /// The bus name the proxy is bound to.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// The path of the remote object.
    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    /// The interfaces the proxy knows about.
    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    /// Introspect the remote object and merge the discovered interfaces
    /// into the known set. Interfaces already known, such as explicitly
    /// supplied ones, keep their definitions.
    pub async fn introspect(&mut self) -> Result<()> {
        let reply = self
            .connection
            .call_remote(
                self.path.as_str(),
                "Introspect",
                Vec::new(),
                CallOptions::new()
                    .destination(&self.destination)
                    .interface(fdo::INTROSPECTABLE),
            )
            .await?;

        let Some(Value::String(xml)) = reply.into_value() else {
            return Err(Error::new(ErrorKind::Introspection(
                "Introspect did not return a string".into(),
            )));
        };

        let node = introspect::parse(&xml)?;

        for interface in node.interfaces {
            if !self.interfaces.iter().any(|i| i.name() == interface.name()) {
                self.interfaces.push(interface);
            }
        }

        Ok(())
    }

    /// Find a method declaration, honoring an explicit interface choice.
    fn find_method(&self, interface: Option<&str>, member: &str) -> Result<(&Interface, &Method)> {
        for i in &self.interfaces {
            if let Some(interface) = interface {
                if i.name() != interface {
                    continue;
                }
            }

            if let Some(method) = i.method(member) {
                return Ok((i, method));
            }
        }

        Err(Error::new(ErrorKind::UnknownMethod(member.into())))
    }

    /// Find a signal declaration, honoring an explicit interface choice.
    fn find_signal(
        &self,
        interface: Option<&str>,
        member: &str,
    ) -> Result<(&Interface, &SignalDef)> {
        for i in &self.interfaces {
            if let Some(interface) = interface {
                if i.name() != interface {
                    continue;
                }
            }

            if let Some(signal) = i.signal(member) {
                return Ok((i, signal));
            }
        }

        Err(Error::new(ErrorKind::UnknownSignal(member.into())))
    }

    /// Call a method on the remote object.
    ///
    /// The method is resolved against the known interfaces, optionally
    /// restricted by `options.interface`. Arguments are validated against
    /// the declared input signature and the reply against the declared
    /// output signature.
    pub async fn call_remote(
        &self,
        member: &str,
        args: Vec<Value>,
        options: CallOptions<'_>,
    ) -> Result<ReturnValue> {
        let (interface, method) = self.find_method(options.interface, member)?;

        let mut actual = OwnedSignature::empty();

        for arg in &args {
            actual.extend_from_signature(&arg.signature())?;
        }

        if *actual != *method.input() {
            return Err(Error::new(ErrorKind::ValueMismatch {
                expected: method.input().as_str().into(),
                actual: actual.as_str().into(),
            }));
        }

        let output = method.output().to_owned();
        let expect_reply = options.expect_reply;

        let options = CallOptions {
            interface: Some(interface.name()),
            destination: Some(&self.destination),
            ..options
        };

        let reply = self
            .connection
            .call_remote(self.path.as_str(), member, args, options)
            .await?;

        if !expect_reply {
            return Ok(reply);
        }

        let mut reply_signature = OwnedSignature::empty();

        let reply_values: &[Value] = match &reply {
            ReturnValue::Empty => &[],
            ReturnValue::Single(value) => std::slice::from_ref(value),
            ReturnValue::Tuple(values) => values,
        };

        for value in reply_values {
            reply_signature.extend_from_signature(&value.signature())?;
        }

        if *reply_signature != *output {
            return Err(Error::new(ErrorKind::UnexpectedReplySignature {
                expected: output.as_str().into(),
                actual: reply_signature.as_str().into(),
            }));
        }

        Ok(reply)
    }

    /// Subscribe to a signal of the remote object.
    ///
    /// Builds the match rule bound to the proxy's bus name, path and the
    /// declaring interface, registers it on the connection and returns the
    /// guard whose release removes the rule. Signals whose body does not
    /// match the declared signature are ignored.
    pub async fn notify_on_signal<F>(
        &self,
        member: &str,
        interface: Option<&str>,
        mut handler: F,
    ) -> Result<MatchGuard>
    where
        F: FnMut(&[Value]) + Send + 'static,
    {
        let (iface, signal) = self.find_signal(interface, member)?;
        let expected = signal.signature().to_owned();

        let mut rule = MatchRule::new()
            .message_type(MatchType::Signal)
            .path(&self.path)
            .interface(iface.name())
            .member(member);

        // A unique destination is also the sender name signals carry; a
        // well-known name is resolved by the bus, so it only goes into the
        // rule sent to the bus side via serialization when unique.
        if self.destination.starts_with(':') {
            rule = rule.sender(&self.destination);
        }

        let handler = move |message: &Message| {
            let matches = match message.body_signature() {
                Ok(signature) => *signature == *expected,
                Err(..) => false,
            };

            if matches {
                handler(message.body());
            }
        };

        self.connection.add_match(rule, handler).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Signature;

    fn test_interfaces() -> Vec<Interface> {
        vec![
            Interface::new("org.example.A")
                .unwrap()
                .with_method(Method::new("M", Signature::UINT32, Signature::STRING))
                .with_signal(SignalDef::new("S", Signature::STRING)),
            Interface::new("org.example.B")
                .unwrap()
                .with_method(Method::new("M", Signature::EMPTY, Signature::EMPTY)),
        ]
    }

    fn proxy() -> Proxy {
        // A connection backed by a closed channel; method resolution does
        // not touch it.
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let (_closed_tx, closed_rx) = tokio::sync::watch::channel(false);
        let connection = Connection::from_parts(tx, closed_rx);

        Proxy::new(
            connection,
            "org.example".into(),
            OwnedObjectPath::new("/org/example").unwrap(),
            test_interfaces(),
        )
    }

    #[test]
    fn method_resolution_prefers_declaration_order() {
        let proxy = proxy();

        let (iface, method) = proxy.find_method(None, "M").unwrap();
        assert_eq!(iface.name(), "org.example.A");
        assert_eq!(method.input(), Signature::UINT32);

        let (iface, _) = proxy.find_method(Some("org.example.B"), "M").unwrap();
        assert_eq!(iface.name(), "org.example.B");

        assert!(proxy.find_method(None, "Nope").is_err());
        assert!(proxy.find_method(Some("org.example.C"), "M").is_err());
    }

    #[test]
    fn signal_resolution() {
        let proxy = proxy();

        let (iface, signal) = proxy.find_signal(None, "S").unwrap();
        assert_eq!(iface.name(), "org.example.A");
        assert_eq!(signal.signature(), Signature::STRING);

        assert!(proxy.find_signal(Some("org.example.B"), "S").is_err());
    }

    #[tokio::test]
    async fn argument_count_is_validated() {
        let proxy = proxy();

        let err = proxy
            .call_remote("M", Vec::new(), CallOptions::new().interface("org.example.A"))
            .await
            .unwrap_err();

        assert!(format!("{err}").contains("signature"));
    }
}
