//! The dynamic value tree used for message bodies.

use std::fmt;

use crate::error::{Error, ErrorKind, Result};
use crate::{OwnedObjectPath, OwnedSignature, Signature};

/// A single D-Bus value.
///
/// Every variant corresponds to one type code. Container values carry enough
/// signature information to marshal themselves even when empty.
///
/// # Examples
///
/// ```
/// use tokbus::{Signature, Value};
///
/// let v = Value::from("hello");
/// assert_eq!(&*v.signature(), Signature::STRING);
///
/// let a = Value::array(Signature::UINT32, vec![1u32.into(), 2u32.into()])?;
/// assert_eq!(&*a.signature(), Signature::new(b"au")?);
/// # Ok::<_, tokbus::Error>(())
/// ```
#[derive(Clone, PartialEq)]
pub enum Value {
    /// A byte (`y`).
    Byte(u8),
    /// A boolean (`b`).
    Bool(bool),
    /// A signed 16-bit integer (`n`).
    Int16(i16),
    /// An unsigned 16-bit integer (`q`).
    UInt16(u16),
    /// A signed 32-bit integer (`i`).
    Int32(i32),
    /// An unsigned 32-bit integer (`u`).
    UInt32(u32),
    /// A signed 64-bit integer (`x`).
    Int64(i64),
    /// An unsigned 64-bit integer (`t`).
    UInt64(u64),
    /// A double (`d`).
    Double(f64),
    /// A string (`s`).
    String(String),
    /// An object path (`o`).
    ObjectPath(OwnedObjectPath),
    /// A signature (`g`).
    Signature(OwnedSignature),
    /// An index into the out-of-band fd array of a message (`h`).
    UnixFd(u32),
    /// An array (`a`). Carries the element signature so that empty arrays
    /// stay marshallable.
    Array(OwnedSignature, Vec<Value>),
    /// A dictionary (`a{kv}`). Carries the key and value signatures.
    Dict(OwnedSignature, OwnedSignature, Vec<(Value, Value)>),
    /// A struct (`(...)`).
    Struct(Vec<Value>),
    /// A variant (`v`), a boxed value paired with its own signature.
    Variant(Box<Value>),
}

impl Value {
    /// Construct an array value, validating every element against the
    /// element signature.
    pub fn array(elem: &Signature, values: Vec<Value>) -> Result<Value> {
        elem.require_single_complete_type()?;

        for value in &values {
            value.expect(elem)?;
        }

        Ok(Value::Array(elem.to_owned(), values))
    }

    /// Construct a dictionary value, validating the key and value
    /// signatures, including the basic-key rule, and every entry.
    pub fn dict(
        key: &Signature,
        value: &Signature,
        entries: Vec<(Value, Value)>,
    ) -> Result<Value> {
        let mut dict = Vec::with_capacity(key.len() + value.len() + 3);
        dict.extend_from_slice(b"a{");
        dict.extend_from_slice(key.as_bytes());
        dict.extend_from_slice(value.as_bytes());
        dict.push(b'}');
        Signature::new(&dict)?;

        for (k, v) in &entries {
            k.expect(key)?;
            v.expect(value)?;
        }

        Ok(Value::Dict(key.to_owned(), value.to_owned(), entries))
    }

    /// Construct a variant value.
    pub fn variant(value: Value) -> Value {
        Value::Variant(Box::new(value))
    }

    /// Construct an array from elements which are already known to match the
    /// element signature.
    pub(crate) fn array_unchecked(elem: &Signature, values: Vec<Value>) -> Value {
        Value::Array(elem.to_owned(), values)
    }

    /// The signature describing this value.
    ///
    /// # Examples
    ///
    /// ```
    /// use tokbus::{Signature, Value};
    ///
    /// let v = Value::Struct(vec![1i32.into(), "two".into()]);
    /// assert_eq!(&*v.signature(), Signature::new(b"(is)")?);
    /// # Ok::<_, tokbus::Error>(())
    /// ```
    pub fn signature(&self) -> OwnedSignature {
        let mut out = Vec::new();
        self.write_signature(&mut out);
        // SAFETY: The construction rules on container values guarantee that
        // the derived signature is well-formed.
        unsafe { OwnedSignature::from_slice_unchecked(&out) }
    }

    fn write_signature(&self, out: &mut Vec<u8>) {
        match self {
            Value::Byte(..) => out.push(b'y'),
            Value::Bool(..) => out.push(b'b'),
            Value::Int16(..) => out.push(b'n'),
            Value::UInt16(..) => out.push(b'q'),
            Value::Int32(..) => out.push(b'i'),
            Value::UInt32(..) => out.push(b'u'),
            Value::Int64(..) => out.push(b'x'),
            Value::UInt64(..) => out.push(b't'),
            Value::Double(..) => out.push(b'd'),
            Value::String(..) => out.push(b's'),
            Value::ObjectPath(..) => out.push(b'o'),
            Value::Signature(..) => out.push(b'g'),
            Value::UnixFd(..) => out.push(b'h'),
            Value::Array(elem, ..) => {
                out.push(b'a');
                out.extend_from_slice(elem.as_bytes());
            }
            Value::Dict(key, value, ..) => {
                out.extend_from_slice(b"a{");
                out.extend_from_slice(key.as_bytes());
                out.extend_from_slice(value.as_bytes());
                out.push(b'}');
            }
            Value::Struct(fields) => {
                out.push(b'(');

                for field in fields {
                    field.write_signature(out);
                }

                out.push(b')');
            }
            Value::Variant(..) => out.push(b'v'),
        }
    }

    /// Check that this value matches the given single complete type.
    pub(crate) fn expect(&self, signature: &Signature) -> Result<()> {
        if *self.signature() == *signature {
            return Ok(());
        }

        Err(Error::new(ErrorKind::ValueMismatch {
            expected: signature.as_str().into(),
            actual: self.signature().as_str().into(),
        }))
    }

    /// Get the value as a `&str` if it is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get the value as a `u32` if it is one.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::UInt32(n) => Some(*n),
            _ => None,
        }
    }

    /// Get the value as a `bool` if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Unwrap one level of variant, if the value is a variant.
    pub fn into_inner(self) -> Value {
        match self {
            Value::Variant(inner) => *inner,
            value => value,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Byte(v) => write!(f, "Byte({v})"),
            Value::Bool(v) => write!(f, "Bool({v})"),
            Value::Int16(v) => write!(f, "Int16({v})"),
            Value::UInt16(v) => write!(f, "UInt16({v})"),
            Value::Int32(v) => write!(f, "Int32({v})"),
            Value::UInt32(v) => write!(f, "UInt32({v})"),
            Value::Int64(v) => write!(f, "Int64({v})"),
            Value::UInt64(v) => write!(f, "UInt64({v})"),
            Value::Double(v) => write!(f, "Double({v})"),
            Value::String(v) => write!(f, "String({v:?})"),
            Value::ObjectPath(v) => write!(f, "ObjectPath({:?})", v.as_str()),
            Value::Signature(v) => write!(f, "Signature({:?})", v.as_str()),
            Value::UnixFd(v) => write!(f, "UnixFd({v})"),
            Value::Array(elem, values) => {
                write!(f, "Array[{}]", elem.as_str())?;
                f.debug_list().entries(values).finish()
            }
            Value::Dict(key, value, entries) => {
                write!(f, "Dict[{}{}]", key.as_str(), value.as_str())?;
                f.debug_map()
                    .entries(entries.iter().map(|(k, v)| (k, v)))
                    .finish()
            }
            Value::Struct(fields) => {
                let mut t = f.debug_tuple("Struct");

                for field in fields {
                    t.field(field);
                }

                t.finish()
            }
            Value::Variant(inner) => f.debug_tuple("Variant").field(inner).finish(),
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                #[inline]
                fn from(value: $ty) -> Self {
                    Value::$variant(value)
                }
            }
        )*
    }
}

impl_from! {
    u8 => Byte,
    bool => Bool,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f64 => Double,
    String => String,
    OwnedObjectPath => ObjectPath,
    OwnedSignature => Signature,
}

impl From<&str> for Value {
    #[inline]
    fn from(value: &str) -> Self {
        Value::String(value.into())
    }
}

/// An ordered struct field layout, used to build struct values from field
/// name/value pairs.
///
/// When a signature calls for a struct, the caller may hold the fields as an
/// ordered sequence or keyed by field name. A descriptor carries the declared
/// field order so that named fields can be laid out deterministically;
/// unknown, missing or duplicated names are rejected.
///
/// # Examples
///
/// ```
/// use tokbus::{StructDescriptor, Value};
///
/// let desc = StructDescriptor::new(&["x", "y"]);
///
/// let v = desc.from_named(vec![
///     ("y".to_string(), Value::Int32(2)),
///     ("x".to_string(), Value::Int32(1)),
/// ])?;
///
/// assert_eq!(v, Value::Struct(vec![Value::Int32(1), Value::Int32(2)]));
/// # Ok::<_, tokbus::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct StructDescriptor {
    fields: Vec<Box<str>>,
}

impl StructDescriptor {
    /// Construct a new descriptor from the declared field order.
    pub fn new(fields: &[&str]) -> Self {
        Self {
            fields: fields.iter().map(|f| Box::from(*f)).collect(),
        }
    }

    /// The declared field names in order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| &**f)
    }

    /// Build a struct value from an ordered sequence of fields.
    pub fn from_ordered(&self, values: Vec<Value>) -> Result<Value> {
        if values.len() != self.fields.len() {
            return Err(Error::new(ErrorKind::StructFieldMismatch));
        }

        Ok(Value::Struct(values))
    }

    /// Build a struct value from named fields, ordering them by the declared
    /// layout.
    pub fn from_named(&self, mut named: Vec<(String, Value)>) -> Result<Value> {
        if named.len() != self.fields.len() {
            return Err(Error::new(ErrorKind::StructFieldMismatch));
        }

        let mut out = Vec::with_capacity(self.fields.len());

        for field in &self.fields {
            let Some(n) = named.iter().position(|(name, _)| **name == **field) else {
                return Err(Error::new(ErrorKind::StructFieldMismatch));
            };

            out.push(named.swap_remove(n).1);
        }

        Ok(Value::Struct(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Signature;

    #[test]
    fn signatures_derive() {
        assert_eq!(*Value::Byte(1).signature(), *Signature::BYTE);
        assert_eq!(*Value::from("s").signature(), *Signature::STRING);

        let v = Value::Struct(vec![
            Value::Int32(1),
            Value::Array(Signature::UINT32.to_owned(), vec![]),
            Value::variant(Value::Bool(true)),
        ]);

        assert_eq!(*v.signature(), *Signature::new(b"(iauv)").unwrap());
    }

    #[test]
    fn dict_signature() {
        let v = Value::Dict(
            Signature::STRING.to_owned(),
            Signature::VARIANT.to_owned(),
            vec![],
        );

        assert_eq!(*v.signature(), *Signature::new(b"a{sv}").unwrap());
    }

    #[test]
    fn array_rejects_mixed_elements() {
        let err = Value::array(
            Signature::UINT32,
            vec![Value::UInt32(1), Value::Int32(2)],
        );

        assert!(err.is_err());
    }

    #[test]
    fn array_rejects_multiple_complete_types() {
        assert!(Value::array(Signature::new(b"ii").unwrap(), vec![]).is_err());
    }

    #[test]
    fn struct_descriptor_ordered_and_named() {
        let desc = StructDescriptor::new(&["a", "b", "c"]);

        let ordered = desc
            .from_ordered(vec![1u32.into(), 2u32.into(), 3u32.into()])
            .unwrap();

        let named = desc
            .from_named(vec![
                ("c".to_string(), 3u32.into()),
                ("a".to_string(), 1u32.into()),
                ("b".to_string(), 2u32.into()),
            ])
            .unwrap();

        assert_eq!(ordered, named);

        assert!(desc.from_ordered(vec![1u32.into()]).is_err());
        assert!(desc
            .from_named(vec![
                ("a".to_string(), 1u32.into()),
                ("a".to_string(), 2u32.into()),
                ("b".to_string(), 3u32.into()),
            ])
            .is_err());
    }
}
