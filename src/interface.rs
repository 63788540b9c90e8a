//! Declarative interface descriptions.
//!
//! An [`Interface`] declares the methods, signals and properties a remote or
//! exported object supports. Descriptions either come from code, through
//! [`Interface::new`] and the `with_` builders, or from introspection XML.

use crate::error::Result;
use crate::names::{validate_interface_name, validate_member_name};
use crate::{OwnedSignature, Signature};

/// Access mode of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// The property can only be read.
    Read,
    /// The property can only be written.
    Write,
    /// The property can be read and written.
    ReadWrite,
}

impl Access {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Access::Read => "read",
            Access::Write => "write",
            Access::ReadWrite => "readwrite",
        }
    }

    /// Test if the property can be read.
    pub fn readable(self) -> bool {
        !matches!(self, Access::Write)
    }

    /// Test if the property can be written.
    pub fn writeable(self) -> bool {
        !matches!(self, Access::Read)
    }
}

/// Whether changes to a property are advertised through the
/// `PropertiesChanged` signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmitsChanged {
    /// The signal is emitted with the new value.
    #[default]
    True,
    /// The signal is emitted without the new value.
    Invalidates,
    /// No signal is emitted.
    False,
}

impl EmitsChanged {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            EmitsChanged::True => "true",
            EmitsChanged::Invalidates => "invalidates",
            EmitsChanged::False => "false",
        }
    }
}

/// A method declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    pub(crate) name: Box<str>,
    pub(crate) input: OwnedSignature,
    pub(crate) output: OwnedSignature,
    pub(crate) annotations: Vec<(Box<str>, Box<str>)>,
}

impl Method {
    /// Construct a new method declaration with input and output signatures.
    pub fn new(name: &str, input: &Signature, output: &Signature) -> Self {
        Self {
            name: name.into(),
            input: input.to_owned(),
            output: output.to_owned(),
            annotations: Vec::new(),
        }
    }

    /// The method name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The signature of the method arguments.
    pub fn input(&self) -> &Signature {
        &self.input
    }

    /// The signature of the method return values.
    pub fn output(&self) -> &Signature {
        &self.output
    }

    /// Attach an annotation to the method.
    pub fn with_annotation(mut self, name: &str, value: &str) -> Self {
        self.annotations.push((name.into(), value.into()));
        self
    }
}

/// A signal declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalDef {
    pub(crate) name: Box<str>,
    pub(crate) signature: OwnedSignature,
}

impl SignalDef {
    /// Construct a new signal declaration.
    pub fn new(name: &str, signature: &Signature) -> Self {
        Self {
            name: name.into(),
            signature: signature.to_owned(),
        }
    }

    /// The signal name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The signature of the signal arguments.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }
}

/// A property declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub(crate) name: Box<str>,
    pub(crate) signature: OwnedSignature,
    pub(crate) access: Access,
    pub(crate) emits_changed: EmitsChanged,
}

impl Property {
    /// Construct a new read-only property declaration which emits
    /// `PropertiesChanged` on change.
    pub fn new(name: &str, signature: &Signature) -> Self {
        Self {
            name: name.into(),
            signature: signature.to_owned(),
            access: Access::Read,
            emits_changed: EmitsChanged::True,
        }
    }

    /// The property name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The signature of the property value.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// The access mode of the property.
    pub fn access(&self) -> Access {
        self.access
    }

    /// How property changes are advertised.
    pub fn emits_changed(&self) -> EmitsChanged {
        self.emits_changed
    }

    /// Mark the property writeable.
    pub fn writeable(mut self) -> Self {
        self.access = match self.access {
            Access::Write => Access::Write,
            _ => Access::ReadWrite,
        };
        self
    }

    /// Mark the property write-only.
    pub fn write_only(mut self) -> Self {
        self.access = Access::Write;
        self
    }

    /// Set how property changes are advertised.
    pub fn with_emits_changed(mut self, emits_changed: EmitsChanged) -> Self {
        self.emits_changed = emits_changed;
        self
    }
}

/// A named set of method, signal and property declarations.
///
/// # Examples
///
/// ```
/// use tokbus::{Interface, Method, Property, Signature, SignalDef};
///
/// let iface = Interface::new("org.example.Widget")?
///     .with_method(Method::new("Frob", Signature::new(b"su")?, Signature::UINT32))
///     .with_signal(SignalDef::new("Frobbed", Signature::UINT32))
///     .with_property(Property::new("Color", Signature::STRING).writeable());
///
/// assert!(iface.method("Frob").is_some());
/// assert!(iface.method("Missing").is_none());
/// # Ok::<_, tokbus::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub(crate) name: Box<str>,
    pub(crate) methods: Vec<Method>,
    pub(crate) signals: Vec<SignalDef>,
    pub(crate) properties: Vec<Property>,
}

impl Interface {
    /// Construct a new empty interface with a validated name.
    pub fn new(name: &str) -> Result<Self> {
        validate_interface_name(name)?;

        Ok(Self {
            name: name.into(),
            methods: Vec::new(),
            signals: Vec::new(),
            properties: Vec::new(),
        })
    }

    /// The interface name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a method declaration.
    pub fn with_method(mut self, method: Method) -> Self {
        self.methods.retain(|m| m.name != method.name);
        self.methods.push(method);
        self
    }

    /// Add a signal declaration.
    pub fn with_signal(mut self, signal: SignalDef) -> Self {
        self.signals.retain(|s| s.name != signal.name);
        self.signals.push(signal);
        self
    }

    /// Add a property declaration.
    pub fn with_property(mut self, property: Property) -> Self {
        self.properties.retain(|p| p.name != property.name);
        self.properties.push(property);
        self
    }

    /// Look up a method by name.
    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| &*m.name == name)
    }

    /// Look up a signal by name.
    pub fn signal(&self, name: &str) -> Option<&SignalDef> {
        self.signals.iter().find(|s| &*s.name == name)
    }

    /// Look up a property by name.
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| &*p.name == name)
    }

    /// The declared methods.
    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    /// The declared signals.
    pub fn signals(&self) -> &[SignalDef] {
        &self.signals
    }

    /// The declared properties.
    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    /// Validate every member name declared on the interface.
    pub(crate) fn validate_members(&self) -> Result<()> {
        for method in &self.methods {
            validate_member_name(&method.name)?;
        }

        for signal in &self.signals {
            validate_member_name(&signal.name)?;
        }

        for property in &self.properties {
            validate_member_name(&property.name)?;
        }

        Ok(())
    }
}
