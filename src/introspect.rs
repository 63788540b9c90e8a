//! Generation and parsing of introspection XML.

use std::fmt::Write;

use xmlparser::{ElementEnd, Token};

use crate::error::{Error, ErrorKind, Result};
use crate::interface::{Access, EmitsChanged, Interface, Method, Property, SignalDef};
use crate::{ObjectPath, OwnedSignature};

const DTD: &str = "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n\"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">";

const EMITS_CHANGED_ANNOTATION: &str = "org.freedesktop.DBus.Property.EmitsChangedSignal";

/// The parsed content of an introspection document.
#[derive(Debug, Default)]
pub struct Node {
    /// The interfaces declared on the object.
    pub interfaces: Vec<Interface>,
    /// The names of child nodes.
    pub children: Vec<String>,
}

/// Render an introspection document for an object with the given
/// interfaces. Member lists are sorted by name so the output is
/// deterministic.
pub(crate) fn generate(path: &ObjectPath, interfaces: &[&Interface], children: &[&str]) -> String {
    let mut out = String::new();

    out.push_str(DTD);
    let _ = writeln!(out, "\n<node name=\"{}\">", path.as_str());

    for interface in interfaces {
        generate_interface(&mut out, interface);
    }

    for child in children {
        let _ = writeln!(out, "  <node name=\"{}\"/>", escape(child));
    }

    out.push_str("</node>\n");
    out
}

/// Render the child-node stub document served when introspecting an
/// unexported prefix of exported paths. Returns `None` if nothing is
/// exported below the path.
pub(crate) fn generate_partial(path: &ObjectPath, exported: &[&ObjectPath]) -> Option<String> {
    let mut children = Vec::new();

    for candidate in exported {
        if *candidate == path || !candidate.starts_with(path) {
            continue;
        }

        let rest = &candidate.as_str()[path.as_str().len()..];
        let rest = rest.strip_prefix('/').unwrap_or(rest);
        let child = rest.split('/').next().unwrap_or(rest);

        let child = child.to_string();

        if !children.contains(&child) {
            children.push(child);
        }
    }

    if children.is_empty() {
        return None;
    }

    children.sort();

    let mut out = String::new();
    out.push_str(DTD);
    let _ = writeln!(out, "\n<node name=\"{}\">", path.as_str());

    for child in children {
        let _ = writeln!(out, "  <node name=\"{child}\"/>");
    }

    out.push_str("</node>\n");
    Some(out)
}

fn generate_interface(out: &mut String, interface: &Interface) {
    let _ = writeln!(out, "  <interface name=\"{}\">", interface.name());

    let mut methods = interface.methods().to_vec();
    methods.sort_by(|a, b| a.name().cmp(b.name()));

    for method in &methods {
        let _ = writeln!(out, "    <method name=\"{}\">", method.name());

        for t in method.input().iter() {
            let _ = writeln!(
                out,
                "      <arg direction=\"in\" type=\"{}\"/>",
                t.signature().as_str()
            );
        }

        for t in method.output().iter() {
            let _ = writeln!(
                out,
                "      <arg direction=\"out\" type=\"{}\"/>",
                t.signature().as_str()
            );
        }

        for (name, value) in &method.annotations {
            let _ = writeln!(
                out,
                "      <annotation name=\"{}\" value=\"{}\"/>",
                escape(name),
                escape(value)
            );
        }

        let _ = writeln!(out, "    </method>");
    }

    let mut signals = interface.signals().to_vec();
    signals.sort_by(|a, b| a.name().cmp(b.name()));

    for signal in &signals {
        let _ = writeln!(out, "    <signal name=\"{}\">", signal.name());

        for t in signal.signature().iter() {
            let _ = writeln!(out, "      <arg type=\"{}\"/>", t.signature().as_str());
        }

        let _ = writeln!(out, "    </signal>");
    }

    let mut properties = interface.properties().to_vec();
    properties.sort_by(|a, b| a.name().cmp(b.name()));

    for property in &properties {
        let _ = writeln!(
            out,
            "    <property name=\"{}\" type=\"{}\" access=\"{}\">",
            property.name(),
            property.signature().as_str(),
            property.access().as_str()
        );
        let _ = writeln!(
            out,
            "      <annotation name=\"{EMITS_CHANGED_ANNOTATION}\" value=\"{}\"/>",
            property.emits_changed().as_str()
        );
        let _ = writeln!(out, "    </property>");
    }

    let _ = writeln!(out, "  </interface>");
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());

    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }

    out
}

fn introspection_error(message: impl std::fmt::Display) -> Error {
    Error::new(ErrorKind::Introspection(message.to_string().into()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    In,
    Out,
}

#[derive(Default)]
struct InterfaceBuilder {
    name: Option<String>,
    methods: Vec<Method>,
    signals: Vec<SignalDef>,
    properties: Vec<Property>,
}

#[derive(Default)]
struct MethodBuilder {
    name: Option<String>,
    input: OwnedSignature,
    output: OwnedSignature,
    annotations: Vec<(Box<str>, Box<str>)>,
}

#[derive(Default)]
struct SignalBuilder {
    name: Option<String>,
    signature: OwnedSignature,
}

struct PropertyBuilder {
    name: Option<String>,
    signature: Option<OwnedSignature>,
    access: Access,
    emits_changed: EmitsChanged,
}

impl Default for PropertyBuilder {
    fn default() -> Self {
        Self {
            name: None,
            signature: None,
            access: Access::Read,
            emits_changed: EmitsChanged::True,
        }
    }
}

#[derive(Default)]
struct ArgBuilder {
    signature: Option<OwnedSignature>,
    direction: Option<Direction>,
}

#[derive(Default)]
struct AnnotationBuilder {
    name: Option<String>,
    value: Option<String>,
}

enum State {
    Node(Node, Option<String>),
    Interface(InterfaceBuilder),
    Method(MethodBuilder),
    Signal(SignalBuilder),
    Property(PropertyBuilder),
    Arg(ArgBuilder),
    Annotation(AnnotationBuilder),
    /// An element this parser has no interest in; its whole subtree is
    /// skipped.
    Skip,
}

impl State {
    fn element_name(&self) -> &'static str {
        match self {
            State::Node(..) => "node",
            State::Interface(..) => "interface",
            State::Method(..) => "method",
            State::Signal(..) => "signal",
            State::Property(..) => "property",
            State::Arg(..) => "arg",
            State::Annotation(..) => "annotation",
            State::Skip => "",
        }
    }
}

/// Parse an introspection document into its interfaces and child nodes.
///
/// Elements and attributes this crate has no use for, such as `doc`
/// elements, are skipped rather than rejected.
pub fn parse(document: &str) -> Result<Node> {
    let mut stack: Vec<State> = Vec::new();
    let mut root = None;

    for token in xmlparser::Tokenizer::from(document) {
        let token = token.map_err(introspection_error)?;

        match token {
            Token::ElementStart { local, .. } => {
                let state = match (stack.last(), local.as_str()) {
                    (None, "node") => State::Node(Node::default(), None),
                    (Some(State::Node(..)), "node") => State::Node(Node::default(), None),
                    (Some(State::Node(..)), "interface") => {
                        State::Interface(InterfaceBuilder::default())
                    }
                    (Some(State::Interface(..)), "method") => {
                        State::Method(MethodBuilder::default())
                    }
                    (Some(State::Interface(..)), "signal") => {
                        State::Signal(SignalBuilder::default())
                    }
                    (Some(State::Interface(..)), "property") => {
                        State::Property(PropertyBuilder::default())
                    }
                    (Some(State::Method(..) | State::Signal(..)), "arg") => {
                        State::Arg(ArgBuilder::default())
                    }
                    (
                        Some(State::Method(..) | State::Property(..) | State::Interface(..)),
                        "annotation",
                    ) => State::Annotation(AnnotationBuilder::default()),
                    (None, element) => {
                        return Err(introspection_error(format!(
                            "unexpected root element {element}"
                        )));
                    }
                    _ => State::Skip,
                };

                stack.push(state);
            }
            Token::Attribute { local, value, .. } => {
                let Some(top) = stack.last_mut() else {
                    continue;
                };

                match (top, local.as_str()) {
                    (State::Node(_, name), "name") => {
                        *name = Some(value.as_str().to_string());
                    }
                    (State::Interface(builder), "name") => {
                        builder.name = Some(value.as_str().to_string());
                    }
                    (State::Method(builder), "name") => {
                        builder.name = Some(value.as_str().to_string());
                    }
                    (State::Signal(builder), "name") => {
                        builder.name = Some(value.as_str().to_string());
                    }
                    (State::Property(builder), "name") => {
                        builder.name = Some(value.as_str().to_string());
                    }
                    (State::Property(builder), "type") => {
                        let signature = OwnedSignature::new(value.as_str().as_bytes())?;
                        builder.signature = Some(signature);
                    }
                    (State::Property(builder), "access") => {
                        builder.access = match value.as_str() {
                            "read" => Access::Read,
                            "write" => Access::Write,
                            "readwrite" => Access::ReadWrite,
                            other => {
                                return Err(introspection_error(format!(
                                    "unsupported property access {other:?}"
                                )));
                            }
                        };
                    }
                    (State::Arg(builder), "type") => {
                        let signature = OwnedSignature::new(value.as_str().as_bytes())?;
                        builder.signature = Some(signature);
                    }
                    (State::Arg(builder), "direction") => {
                        builder.direction = match value.as_str() {
                            "in" => Some(Direction::In),
                            "out" => Some(Direction::Out),
                            other => {
                                return Err(introspection_error(format!(
                                    "unsupported argument direction {other:?}"
                                )));
                            }
                        };
                    }
                    (State::Annotation(builder), "name") => {
                        builder.name = Some(value.as_str().to_string());
                    }
                    (State::Annotation(builder), "value") => {
                        builder.value = Some(value.as_str().to_string());
                    }
                    _ => {}
                }
            }
            Token::ElementEnd { end, .. } => {
                match end {
                    ElementEnd::Open => continue,
                    ElementEnd::Close(_, name) => {
                        let Some(top) = stack.last() else {
                            return Err(introspection_error("unbalanced element end"));
                        };

                        if !matches!(top, State::Skip) && top.element_name() != name.as_str() {
                            return Err(introspection_error(format!(
                                "mismatching end tag {:?}",
                                name.as_str()
                            )));
                        }
                    }
                    ElementEnd::Empty => {}
                }

                let Some(top) = stack.pop() else {
                    return Err(introspection_error("unbalanced element end"));
                };

                match (stack.last_mut(), top) {
                    (None, State::Node(node, _)) => {
                        root = Some(node);
                    }
                    (Some(State::Node(parent, _)), State::Node(_, child_name)) => {
                        if let Some(name) = child_name {
                            parent.children.push(name);
                        }
                    }
                    (Some(State::Node(node, _)), State::Interface(builder)) => {
                        node.interfaces.push(builder.build()?);
                    }
                    (Some(State::Interface(iface)), State::Method(builder)) => {
                        iface.methods.push(builder.build()?);
                    }
                    (Some(State::Interface(iface)), State::Signal(builder)) => {
                        iface.signals.push(builder.build()?);
                    }
                    (Some(State::Interface(iface)), State::Property(builder)) => {
                        iface.properties.push(builder.build()?);
                    }
                    (Some(State::Method(method)), State::Arg(builder)) => {
                        let signature = builder
                            .signature
                            .ok_or_else(|| introspection_error("argument without a type"))?;

                        match builder.direction.unwrap_or(Direction::In) {
                            Direction::In => method.input.extend_from_signature(&signature)?,
                            Direction::Out => method.output.extend_from_signature(&signature)?,
                        }
                    }
                    (Some(State::Signal(signal)), State::Arg(builder)) => {
                        let signature = builder
                            .signature
                            .ok_or_else(|| introspection_error("argument without a type"))?;

                        signal.signature.extend_from_signature(&signature)?;
                    }
                    (Some(State::Property(property)), State::Annotation(builder)) => {
                        if builder.name.as_deref() == Some(EMITS_CHANGED_ANNOTATION) {
                            property.emits_changed = match builder.value.as_deref() {
                                Some("true") | None => EmitsChanged::True,
                                Some("invalidates") => EmitsChanged::Invalidates,
                                Some("false") => EmitsChanged::False,
                                Some(other) => {
                                    return Err(introspection_error(format!(
                                        "unsupported EmitsChangedSignal value {other:?}"
                                    )));
                                }
                            };
                        }
                    }
                    (Some(State::Method(method)), State::Annotation(builder)) => {
                        if let (Some(name), Some(value)) = (builder.name, builder.value) {
                            method.annotations.push((name.into(), value.into()));
                        }
                    }
                    (Some(_), State::Annotation(..)) => {}
                    (Some(_), State::Skip) => {}
                    (None, _) => {
                        return Err(introspection_error("unbalanced element end"));
                    }
                    (Some(State::Skip), _) => {}
                    _ => {
                        return Err(introspection_error("unexpected element nesting"));
                    }
                }
            }
            _ => {}
        }
    }

    root.ok_or_else(|| introspection_error("missing root node element"))
}

impl InterfaceBuilder {
    fn build(self) -> Result<Interface> {
        let name = self
            .name
            .ok_or_else(|| introspection_error("interface without a name"))?;

        let mut interface = Interface::new(&name)?;

        for method in self.methods {
            interface = interface.with_method(method);
        }

        for signal in self.signals {
            interface = interface.with_signal(signal);
        }

        for property in self.properties {
            interface = interface.with_property(property);
        }

        Ok(interface)
    }
}

impl MethodBuilder {
    fn build(self) -> Result<Method> {
        let name = self
            .name
            .ok_or_else(|| introspection_error("method without a name"))?;

        let mut method = Method::new(&name, &self.input, &self.output);
        method.annotations = self.annotations;
        Ok(method)
    }
}

impl SignalBuilder {
    fn build(self) -> Result<SignalDef> {
        let name = self
            .name
            .ok_or_else(|| introspection_error("signal without a name"))?;

        Ok(SignalDef::new(&name, &self.signature))
    }
}

impl PropertyBuilder {
    fn build(self) -> Result<Property> {
        let name = self
            .name
            .ok_or_else(|| introspection_error("property without a name"))?;
        let signature = self
            .signature
            .ok_or_else(|| introspection_error("property without a type"))?;

        let mut property = Property::new(&name, &signature);
        property.access = self.access;
        property.emits_changed = self.emits_changed;
        Ok(property)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Signature;

    fn widget() -> Interface {
        Interface::new("org.example.Widget")
            .unwrap()
            .with_method(Method::new(
                "Frob",
                Signature::new(b"su").unwrap(),
                Signature::UINT32,
            ))
            .with_method(Method::new("Reset", Signature::EMPTY, Signature::EMPTY))
            .with_signal(SignalDef::new("Frobbed", Signature::UINT32))
            .with_property(
                Property::new("Color", Signature::STRING)
                    .writeable()
                    .with_emits_changed(EmitsChanged::Invalidates),
            )
    }

    #[test]
    fn generate_then_parse_round_trips() {
        let iface = widget();

        let xml = generate(ObjectPath::new("/org/example").unwrap(), &[&iface], &[]);

        let node = parse(&xml).unwrap();
        assert_eq!(node.interfaces.len(), 1);

        let parsed = &node.interfaces[0];
        assert_eq!(parsed.name(), "org.example.Widget");

        let frob = parsed.method("Frob").unwrap();
        assert_eq!(frob.input(), Signature::new(b"su").unwrap());
        assert_eq!(frob.output(), Signature::UINT32);

        let signal = parsed.signal("Frobbed").unwrap();
        assert_eq!(signal.signature(), Signature::UINT32);

        let color = parsed.property("Color").unwrap();
        assert_eq!(color.access(), Access::ReadWrite);
        assert_eq!(color.emits_changed(), EmitsChanged::Invalidates);
    }

    #[test]
    fn generation_is_deterministic_and_sorted() {
        let iface = widget();
        let path = ObjectPath::new("/org/example").unwrap();

        let a = generate(path, &[&iface], &[]);
        let b = generate(path, &[&iface], &[]);
        assert_eq!(a, b);

        // Members appear sorted by name.
        let frob = a.find("\"Frob\"").unwrap();
        let reset = a.find("\"Reset\"").unwrap();
        assert!(frob < reset);
    }

    #[test]
    fn parse_ignores_doc_and_unknown_elements() {
        let xml = r#"
            <node>
              <interface name="org.example.X">
                <method name="M">
                  <doc><summary>Does things.</summary></doc>
                  <arg direction="in" type="s"/>
                </method>
              </interface>
              <mystery><deeper/></mystery>
            </node>
        "#;

        let node = parse(xml).unwrap();
        let m = node.interfaces[0].method("M").unwrap();
        assert_eq!(m.input(), Signature::STRING);
    }

    #[test]
    fn parse_rejects_invalid_type() {
        let xml = r#"
            <node>
              <interface name="org.example.X">
                <method name="M"><arg direction="in" type="!"/></method>
              </interface>
            </node>
        "#;

        assert!(parse(xml).is_err());
    }

    #[test]
    fn partial_path_stubs() {
        let exported = [
            ObjectPath::new("/org/example/a").unwrap(),
            ObjectPath::new("/org/example/b/c").unwrap(),
        ];

        let xml = generate_partial(ObjectPath::new("/org/example").unwrap(), &exported).unwrap();
        assert!(xml.contains("<node name=\"a\"/>"));
        assert!(xml.contains("<node name=\"b\"/>"));
        assert!(!xml.contains("name=\"c\""));

        assert!(generate_partial(ObjectPath::new("/net").unwrap(), &exported).is_none());
    }
}
