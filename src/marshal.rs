//! Signature-driven encoding and decoding of [`Value`] trees.

use std::str::from_utf8;

use crate::buf::{OwnedBuf, ReadBuf};
use crate::error::{Error, ErrorKind, Result};
use crate::proto::MAX_ARRAY_LENGTH;
use crate::signature::SingleType;
use crate::value::Value;
use crate::{ObjectPath, Signature};

/// Encode a sequence of values described by a root signature.
pub(crate) fn store_values(buf: &mut OwnedBuf, signature: &Signature, values: &[Value]) -> Result<()> {
    let arity = signature.arity();

    if arity != values.len() {
        return Err(Error::new(ErrorKind::ArityMismatch {
            expected: arity,
            actual: values.len(),
        }));
    }

    for (t, value) in signature.iter().zip(values) {
        value.expect(t.signature())?;
        store_value(buf, t, value)?;
    }

    Ok(())
}

/// Encode one value described by a single complete type.
///
/// The value is assumed to match the type; [`store_values`] checks that at
/// the root and construction rules keep nested values consistent.
fn store_value(buf: &mut OwnedBuf, t: SingleType<'_>, value: &Value) -> Result<()> {
    match (t, value) {
        (SingleType::Basic(..), value) => store_basic(buf, value),
        (SingleType::Array(_, elem), Value::Array(_, values)) => {
            store_array(buf, elem, |buf| {
                let Some(t) = elem.iter().next() else {
                    return Ok(());
                };

                for value in values {
                    store_value(buf, t, value)?;
                }

                Ok(())
            })
        }
        (SingleType::Array(_, elem), Value::Dict(_, _, entries)) => {
            let Some(SingleType::DictEntry(_, key_sig, value_sig)) = elem.iter().next() else {
                return Err(value_mismatch(t.signature(), value));
            };

            store_array(buf, elem, |buf| {
                for (k, v) in entries {
                    buf.align(8);
                    store_value(buf, key_type(key_sig), k)?;
                    store_value(buf, key_type(value_sig), v)?;
                }

                Ok(())
            })
        }
        (SingleType::Struct(_, fields), Value::Struct(values)) => {
            buf.align(8);

            for (t, value) in fields.iter().zip(values) {
                store_value(buf, t, value)?;
            }

            Ok(())
        }
        (t, value) => Err(value_mismatch(t.signature(), value)),
    }
}

/// The single complete type of a signature known to hold exactly one.
fn key_type(signature: &Signature) -> SingleType<'_> {
    signature
        .iter()
        .next()
        .expect("signature holds a single complete type")
}

fn value_mismatch(signature: &Signature, value: &Value) -> Error {
    Error::new(ErrorKind::ValueMismatch {
        expected: signature.as_str().into(),
        actual: value.signature().as_str().into(),
    })
}

fn store_basic(buf: &mut OwnedBuf, value: &Value) -> Result<()> {
    match value {
        Value::Byte(v) => buf.store(*v),
        Value::Bool(v) => buf.store(*v as u32),
        Value::Int16(v) => buf.store(*v),
        Value::UInt16(v) => buf.store(*v),
        Value::Int32(v) => buf.store(*v),
        Value::UInt32(v) => buf.store(*v),
        Value::Int64(v) => buf.store(*v),
        Value::UInt64(v) => buf.store(*v),
        Value::Double(v) => buf.store(*v),
        Value::UnixFd(v) => buf.store(*v),
        Value::String(v) => store_string(buf, v)?,
        Value::ObjectPath(v) => store_string(buf, v.as_str())?,
        Value::Signature(v) => {
            buf.store(v.len() as u8);
            buf.extend_from_slice_nul(v.as_bytes());
        }
        Value::Variant(inner) => {
            let signature = inner.signature();
            buf.store(signature.len() as u8);
            buf.extend_from_slice_nul(signature.as_bytes());
            store_value(buf, key_type(&signature), inner)?;
        }
        _ => {
            return Err(Error::new(ErrorKind::ValueMismatch {
                expected: "basic type".into(),
                actual: value.signature().as_str().into(),
            }))
        }
    }

    Ok(())
}

fn store_string(buf: &mut OwnedBuf, s: &str) -> Result<()> {
    if s.as_bytes().contains(&0) {
        return Err(Error::new(ErrorKind::StringContainsNull));
    }

    buf.store(s.len() as u32);
    buf.extend_from_slice_nul(s.as_bytes());
    Ok(())
}

/// Store the common array framing: length slot, padding to element
/// alignment, then the elements produced by `elements`.
fn store_array<F>(buf: &mut OwnedBuf, elem: &Signature, elements: F) -> Result<()>
where
    F: FnOnce(&mut OwnedBuf) -> Result<()>,
{
    let at = buf.alloc_u32();

    // Padding to the element alignment is counted into the offset but not
    // into the array length, and is emitted even for empty arrays.
    buf.align(elem.alignment());
    let start = buf.len();

    elements(buf)?;

    let n = buf.len() - start;

    if n > MAX_ARRAY_LENGTH as usize {
        return Err(Error::new(ErrorKind::ArrayTooLong(n as u32)));
    }

    buf.store_at(at, n as u32);
    Ok(())
}

/// Decode a sequence of values described by a root signature.
pub(crate) fn load_values(buf: &mut ReadBuf<'_>, signature: &Signature) -> Result<Vec<Value>> {
    let mut values = Vec::new();

    for t in signature.iter() {
        values.push(load_value(buf, t)?);
    }

    Ok(values)
}

/// Decode one value described by a single complete type.
fn load_value(buf: &mut ReadBuf<'_>, t: SingleType<'_>) -> Result<Value> {
    match t {
        SingleType::Basic(signature) => load_basic(buf, signature),
        SingleType::Array(_, elem) => load_array(buf, elem),
        SingleType::Struct(_, fields) => {
            buf.align(8)?;

            let mut values = Vec::new();

            for t in fields.iter() {
                values.push(load_value(buf, t)?);
            }

            Ok(Value::Struct(values))
        }
        SingleType::DictEntry(signature, ..) => Err(Error::new(ErrorKind::ValueMismatch {
            expected: "single complete type".into(),
            actual: signature.as_str().into(),
        })),
    }
}

fn load_basic(buf: &mut ReadBuf<'_>, signature: &Signature) -> Result<Value> {
    Ok(match signature.as_bytes() {
        b"y" => Value::Byte(buf.load()?),
        b"b" => match buf.load::<u32>()? {
            0 => Value::Bool(false),
            1 => Value::Bool(true),
            b => return Err(Error::new(ErrorKind::InvalidBoolean(b))),
        },
        b"n" => Value::Int16(buf.load()?),
        b"q" => Value::UInt16(buf.load()?),
        b"i" => Value::Int32(buf.load()?),
        b"u" => Value::UInt32(buf.load()?),
        b"x" => Value::Int64(buf.load()?),
        b"t" => Value::UInt64(buf.load()?),
        b"d" => Value::Double(buf.load()?),
        b"h" => Value::UnixFd(buf.load()?),
        b"s" => Value::String(load_string(buf)?.into()),
        b"o" => {
            let s = load_string(buf)?;
            Value::ObjectPath(ObjectPath::new(s)?.to_owned())
        }
        b"g" => Value::Signature(load_signature(buf)?.to_owned()),
        b"v" => {
            let signature = load_signature(buf)?;
            signature.require_single_complete_type()?;
            let value = load_value(buf, key_type(signature))?;
            Value::Variant(Box::new(value))
        }
        _ => {
            return Err(Error::new(ErrorKind::ValueMismatch {
                expected: "basic type".into(),
                actual: signature.as_str().into(),
            }))
        }
    })
}

fn load_string<'a>(buf: &mut ReadBuf<'a>) -> Result<&'a str> {
    let len = buf.load::<u32>()? as usize;
    let bytes = buf.load_slice_nul(len)?;
    Ok(from_utf8(bytes)?)
}

pub(crate) fn load_signature<'a>(buf: &mut ReadBuf<'a>) -> Result<&'a Signature> {
    let len = buf.load::<u8>()? as usize;
    let bytes = buf.load_slice_nul(len)?;
    Ok(Signature::new(bytes)?)
}

fn load_array(buf: &mut ReadBuf<'_>, elem: &Signature) -> Result<Value> {
    let len = buf.load::<u32>()?;

    if len > MAX_ARRAY_LENGTH {
        return Err(Error::new(ErrorKind::ArrayTooLong(len)));
    }

    buf.align(elem.alignment())?;

    let len = len as usize;
    let start = buf.pos();

    let value = match key_type(elem) {
        SingleType::DictEntry(_, key, value) => {
            let mut entries = Vec::new();

            while buf.pos() - start < len {
                buf.align(8)?;
                let k = load_value(buf, key_type(key))?;
                let v = load_value(buf, key_type(value))?;
                entries.push((k, v));
            }

            Value::Dict(key.to_owned(), value.to_owned(), entries)
        }
        t => {
            let mut values = Vec::new();

            while buf.pos() - start < len {
                values.push(load_value(buf, t)?);
            }

            Value::Array(elem.to_owned(), values)
        }
    };

    // The declared length must cover whole elements.
    if buf.pos() - start != len {
        return Err(Error::new(ErrorKind::BodyLengthMismatch {
            declared: len as u32,
            actual: (buf.pos() - start) as u32,
        }));
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Endianness;

    fn encode(signature: &Signature, values: &[Value], endianness: Endianness) -> Vec<u8> {
        let mut buf = OwnedBuf::with_endianness(endianness);
        store_values(&mut buf, signature, values).unwrap();
        buf.into_vec()
    }

    fn round_trip(signature: &Signature, values: Vec<Value>, endianness: Endianness) {
        let bytes = encode(signature, &values, endianness);

        let mut read = ReadBuf::from_slice(&bytes, endianness);
        let decoded = load_values(&mut read, signature).unwrap();
        assert!(read.is_empty());
        assert_eq!(decoded, values);

        // A second encode of the decoded values is byte identical.
        assert_eq!(encode(signature, &decoded, endianness), bytes);
    }

    #[test]
    fn array_of_strings() {
        let signature = Signature::new(b"as").unwrap();
        let values = vec![Value::array(
            Signature::STRING,
            vec!["foo".into(), "bar".into()],
        )
        .unwrap()];

        let bytes = encode(signature, &values, Endianness::LITTLE);

        assert_eq!(
            bytes,
            [
                0x14, 0x00, 0x00, 0x00, // array length 20
                0x03, 0x00, 0x00, 0x00, b'f', b'o', b'o', 0x00, // "foo"
                0x03, 0x00, 0x00, 0x00, b'b', b'a', b'r', 0x00, // "bar"
            ]
        );

        round_trip(signature, values, Endianness::LITTLE);
    }

    #[test]
    fn empty_struct_array_keeps_element_padding() {
        let signature = Signature::new(b"a(ii)").unwrap();
        let values = vec![Value::array(Signature::new(b"(ii)").unwrap(), vec![]).unwrap()];

        let bytes = encode(signature, &values, Endianness::LITTLE);
        assert_eq!(bytes, [0, 0, 0, 0, 0, 0, 0, 0]);

        round_trip(signature, values, Endianness::LITTLE);
    }

    #[test]
    fn booleans() {
        let signature = Signature::new(b"b").unwrap();

        let bytes = encode(signature, &[Value::Bool(true)], Endianness::LITTLE);
        assert_eq!(bytes, [1, 0, 0, 0]);

        let mut read = ReadBuf::from_slice(&[2, 0, 0, 0], Endianness::LITTLE);
        assert!(load_values(&mut read, signature).is_err());
    }

    #[test]
    fn variant_alignment_is_global() {
        // u8 then a variant holding a u32: the variant body aligns against
        // the stream offset, not the start of the variant.
        let signature = Signature::new(b"yv").unwrap();
        let values = vec![Value::Byte(7), Value::variant(Value::UInt32(9))];

        let bytes = encode(signature, &values, Endianness::LITTLE);

        assert_eq!(
            bytes,
            [
                7, // y
                1, b'u', 0, // variant signature "u"
                9, 0, 0, 0, // u32, already aligned at offset 4
            ]
        );

        round_trip(signature, values, Endianness::LITTLE);
    }

    #[test]
    fn dict_round_trip() {
        let signature = Signature::new(b"a{sv}").unwrap();

        let values = vec![Value::dict(
            Signature::STRING,
            Signature::VARIANT,
            vec![
                ("one".into(), Value::variant(Value::UInt32(1))),
                ("two".into(), Value::variant(Value::from("2"))),
            ],
        )
        .unwrap()];

        round_trip(signature, values.clone(), Endianness::LITTLE);
        round_trip(signature, values, Endianness::BIG);
    }

    #[test]
    fn nested_containers_round_trip() {
        let signature = Signature::new(b"a(isa{yu})xd").unwrap();

        let entry = Value::Struct(vec![
            Value::Int32(-1),
            "name".into(),
            Value::dict(
                Signature::BYTE,
                Signature::UINT32,
                vec![(Value::Byte(1), Value::UInt32(2))],
            )
            .unwrap(),
        ]);

        let values = vec![
            Value::array(Signature::new(b"(isa{yu})").unwrap(), vec![entry]).unwrap(),
            Value::Int64(i64::MIN),
            Value::Double(0.5),
        ];

        round_trip(signature, values.clone(), Endianness::LITTLE);
        round_trip(signature, values, Endianness::BIG);
    }

    #[test]
    fn array_length_must_cover_whole_elements() {
        // Array of u32 declaring 3 bytes of content.
        let bytes = [3, 0, 0, 0, 1, 0, 0, 0];
        let mut read = ReadBuf::from_slice(&bytes, Endianness::LITTLE);
        assert!(load_values(&mut read, Signature::new(b"au").unwrap()).is_err());
    }

    #[test]
    fn arity_mismatch() {
        let mut buf = OwnedBuf::new();
        let err = store_values(
            &mut buf,
            Signature::new(b"ii").unwrap(),
            &[Value::Int32(1)],
        );
        assert!(err.is_err());
    }

    #[test]
    fn value_signature_mismatch() {
        let mut buf = OwnedBuf::new();
        let err = store_values(&mut buf, Signature::new(b"s").unwrap(), &[Value::Int32(1)]);
        assert!(err.is_err());
    }

    #[test]
    fn string_with_embedded_null_rejected() {
        let mut buf = OwnedBuf::new();
        let err = store_values(
            &mut buf,
            Signature::STRING,
            &[Value::String("a\0b".into())],
        );
        assert!(err.is_err());
    }
}
