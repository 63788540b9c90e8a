//! Match rules for routing bus messages to subscribers.

use std::fmt;
use std::fmt::Write;

use crate::message::{Message, MessageKind};
use crate::value::Value;
use crate::{ObjectPath, OwnedObjectPath};

/// The message type criterion of a [`MatchRule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    /// Match method call messages.
    MethodCall,
    /// Match method return messages.
    MethodReturn,
    /// Match error messages.
    Error,
    /// Match signal messages.
    Signal,
}

impl MatchType {
    fn as_str(self) -> &'static str {
        match self {
            MatchType::MethodCall => "method_call",
            MatchType::MethodReturn => "method_return",
            MatchType::Error => "error",
            MatchType::Signal => "signal",
        }
    }

    fn matches(self, kind: &MessageKind) -> bool {
        matches!(
            (self, kind),
            (MatchType::MethodCall, MessageKind::MethodCall { .. })
                | (MatchType::MethodReturn, MessageKind::MethodReturn { .. })
                | (MatchType::Error, MessageKind::Error { .. })
                | (MatchType::Signal, MessageKind::Signal { .. })
        )
    }
}

/// A compiled message match rule.
///
/// A rule is built up from criteria, serialized to the broker for
/// `AddMatch`, and evaluated locally against every incoming message to
/// select the handlers to invoke.
///
/// # Examples
///
/// ```
/// use tokbus::{MatchRule, MatchType};
///
/// let rule = MatchRule::new()
///     .message_type(MatchType::Signal)
///     .interface("org.example.Widget")
///     .member("Changed");
///
/// assert_eq!(
///     rule.to_string(),
///     "type='signal',interface='org.example.Widget',member='Changed'"
/// );
/// ```
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MatchRule {
    message_type: Option<MatchType>,
    sender: Option<Box<str>>,
    interface: Option<Box<str>>,
    member: Option<Box<str>>,
    path: Option<OwnedObjectPath>,
    path_namespace: Option<OwnedObjectPath>,
    destination: Option<Box<str>>,
    /// Equality criteria on string-typed body arguments, by index.
    args: Vec<(u8, Box<str>)>,
    /// Path-prefix criteria on body arguments, by index.
    arg_paths: Vec<(u8, Box<str>)>,
    arg0_namespace: Option<Box<str>>,
}

impl MatchRule {
    /// Construct an empty rule which matches everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Match on the message type.
    pub fn message_type(mut self, message_type: MatchType) -> Self {
        self.message_type = Some(message_type);
        self
    }

    /// Match on the sender bus name.
    pub fn sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Match on the interface.
    pub fn interface(mut self, interface: &str) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Match on the member.
    pub fn member(mut self, member: &str) -> Self {
        self.member = Some(member.into());
        self
    }

    /// Match on the object path.
    pub fn path(mut self, path: &ObjectPath) -> Self {
        self.path = Some(path.to_owned());
        self
    }

    /// Match messages whose path is or is under the given path.
    pub fn path_namespace(mut self, path: &ObjectPath) -> Self {
        self.path_namespace = Some(path.to_owned());
        self
    }

    /// Match on the destination bus name.
    pub fn destination(mut self, destination: &str) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Match a string-typed body argument by value. `index` may be 0..=63.
    pub fn arg(mut self, index: u8, value: &str) -> Self {
        self.args.push((index, value.into()));
        self
    }

    /// Match a string- or path-typed body argument as a path prefix.
    pub fn arg_path(mut self, index: u8, value: &str) -> Self {
        self.arg_paths.push((index, value.into()));
        self
    }

    /// Match the first body argument by reverse-DNS namespace.
    pub fn arg0_namespace(mut self, value: &str) -> Self {
        self.arg0_namespace = Some(value.into());
        self
    }

    /// Evaluate the rule against a message.
    pub fn matches(&self, message: &Message) -> bool {
        if let Some(t) = self.message_type {
            if !t.matches(message.kind()) {
                return false;
            }
        }

        if let Some(sender) = &self.sender {
            if message.sender() != Some(&**sender) {
                return false;
            }
        }

        if let Some(interface) = &self.interface {
            if message.interface() != Some(&**interface) {
                return false;
            }
        }

        if let Some(member) = &self.member {
            if message.member() != Some(&**member) {
                return false;
            }
        }

        if let Some(path) = &self.path {
            if message.path() != Some(path) {
                return false;
            }
        }

        if let Some(namespace) = &self.path_namespace {
            match message.path() {
                Some(path) if path.starts_with(namespace) => {}
                _ => return false,
            }
        }

        if let Some(destination) = &self.destination {
            if message.destination() != Some(&**destination) {
                return false;
            }
        }

        for (index, expected) in &self.args {
            match arg_str(message, *index) {
                Some(actual) if actual == &**expected => {}
                _ => return false,
            }
        }

        for (index, prefix) in &self.arg_paths {
            match arg_path_str(message, *index) {
                Some(actual) if path_prefix_matches(prefix, actual) => {}
                _ => return false,
            }
        }

        if let Some(namespace) = &self.arg0_namespace {
            match arg_str(message, 0) {
                Some(actual) if namespace_matches(namespace, actual) => {}
                _ => return false,
            }
        }

        true
    }
}

/// A string-typed body argument at the given index.
fn arg_str(message: &Message, index: u8) -> Option<&str> {
    match message.body().get(index as usize)? {
        Value::String(s) => Some(s),
        _ => None,
    }
}

/// A string- or object-path-typed body argument at the given index.
fn arg_path_str(message: &Message, index: u8) -> Option<&str> {
    match message.body().get(index as usize)? {
        Value::String(s) => Some(s),
        Value::ObjectPath(p) => Some(p.as_str()),
        _ => None,
    }
}

/// Path-prefix semantics of `argNpath`: either side may be a prefix of the
/// other, on `/` boundaries.
fn path_prefix_matches(rule: &str, actual: &str) -> bool {
    fn prefixed(prefix: &str, path: &str) -> bool {
        prefix.ends_with('/') && path.starts_with(prefix)
    }

    rule == actual || prefixed(rule, actual) || prefixed(actual, rule)
}

/// `arg0namespace` semantics: the argument equals the namespace or starts
/// with it followed by a dot.
fn namespace_matches(namespace: &str, actual: &str) -> bool {
    match actual.strip_prefix(namespace) {
        Some("") => true,
        Some(rest) => rest.starts_with('.'),
        None => false,
    }
}

/// Serializes the rule in the comma-separated `key='value'` form consumed
/// by the broker's `AddMatch`.
impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();

        let mut add = |key: &str, value: &str| {
            if !out.is_empty() {
                out.push(',');
            }

            let _ = write!(out, "{key}='{value}'");
        };

        if let Some(t) = self.message_type {
            add("type", t.as_str());
        }

        if let Some(sender) = &self.sender {
            add("sender", sender);
        }

        if let Some(interface) = &self.interface {
            add("interface", interface);
        }

        if let Some(member) = &self.member {
            add("member", member);
        }

        if let Some(path) = &self.path {
            add("path", path.as_str());
        }

        if let Some(namespace) = &self.path_namespace {
            add("path_namespace", namespace.as_str());
        }

        if let Some(destination) = &self.destination {
            add("destination", destination);
        }

        for (index, value) in &self.args {
            add(&format!("arg{index}"), value);
        }

        for (index, value) in &self.arg_paths {
            add(&format!("arg{index}path"), value);
        }

        if let Some(namespace) = &self.arg0_namespace {
            add("arg0namespace", namespace);
        }

        f.write_str(&out)
    }
}
