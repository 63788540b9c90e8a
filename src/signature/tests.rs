use super::{Signature, SignatureErrorKind, SingleType, MAX_SIGNATURE};

use SignatureErrorKind::*;

macro_rules! test {
    ($input:expr, $expected:pat) => {{
        let actual = Signature::new($input).map_err(|e| e.kind);

        assert!(
            matches!(actual, $expected),
            "{actual:?} does not match {}",
            stringify!($expected)
        );
    }};
}

#[test]
fn signature_tests() {
    test!(b"", Ok(..));
    test!(b"sss", Ok(..));
    test!(b"i", Ok(..));
    test!(b"b", Ok(..));
    test!(b"ai", Ok(..));
    test!(b"(i)", Ok(..));
    test!(b"w", Err(UnknownTypeCode(..)));
    test!(b"a", Err(MissingArrayElementType));
    test!(b"aaaaaa", Err(MissingArrayElementType));
    test!(b"ii(ii)a", Err(MissingArrayElementType));
    test!(b"ia", Err(MissingArrayElementType));
    test!(b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaai", Ok(..));
    test!(
        b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaai",
        Err(ExceededMaximumArrayRecursion)
    );
    test!(b")", Err(StructEndedButNotStarted));
    test!(b"}", Err(DictEndedButNotStarted));
    test!(b"i)", Err(StructEndedButNotStarted));
    test!(b"a)", Err(MissingArrayElementType));
    test!(b"(", Err(StructStartedButNotEnded));
    test!(b"(i", Err(StructStartedButNotEnded));
    test!(b"(iiiii", Err(StructStartedButNotEnded));
    test!(b"(ai", Err(StructStartedButNotEnded));
    test!(b"()", Err(StructHasNoFields));
    test!(b"(())", Err(StructHasNoFields));
    test!(b"a()", Err(StructHasNoFields));
    test!(b"i()", Err(StructHasNoFields));
    test!(b"()i", Err(StructHasNoFields));
    test!(b"(a)", Err(MissingArrayElementType));
    test!(b"a{ia}", Err(MissingArrayElementType));
    test!(b"a{}", Err(DictEntryHasNoFields));
    test!(b"a{aii}", Err(DictKeyMustBeBasicType));
    test!(b" ", Err(UnknownTypeCode(..)));
    test!(b"not a valid signature", Err(UnknownTypeCode(..)));
    test!(b"123", Err(UnknownTypeCode(..)));
    test!(b".", Err(UnknownTypeCode(..)));
    /* https://bugs.freedesktop.org/show_bug.cgi?id=17803 */
    test!(b"a{(ii)i}", Err(DictKeyMustBeBasicType));
    test!(b"a{vs}", Err(DictKeyMustBeBasicType));
    test!(b"a{i}", Err(DictEntryHasOnlyOneField));
    test!(b"{is}", Err(DictEntryNotInsideArray));
    test!(b"a{isi}", Err(DictEntryHasTooManyFields));
    test!(&[b'i'; 255], Ok(..));
    test!(&[b'i'; MAX_SIGNATURE], Err(SignatureTooLong));
    test! {
        b"((((((((((((((((((((((((((((((((ii))))))))))))))))))))))))))))))))",
        Ok(..)
    };
    test! {
        b"(((((((((((((((((((((((((((((((((ii))))))))))))))))))))))))))))))))",
        Err(ExceededMaximumStructRecursion)
    };
}

#[test]
fn iter_single_complete_types() {
    let sig = Signature::new(b"ia(ii)a{sv}v").unwrap();
    let mut it = sig.iter();

    assert!(matches!(it.next(), Some(SingleType::Basic(s)) if s == b"i"));

    let Some(SingleType::Array(full, elem)) = it.next() else {
        panic!("expected array");
    };

    assert_eq!(full, b"a(ii)");
    assert_eq!(elem, b"(ii)");

    let Some(SingleType::Array(full, elem)) = it.next() else {
        panic!("expected dict array");
    };

    assert_eq!(full, b"a{sv}");
    assert_eq!(elem, b"{sv}");

    assert!(matches!(it.next(), Some(SingleType::Basic(s)) if s == b"v"));
    assert!(it.next().is_none());
}

#[test]
fn iter_dict_entry() {
    let sig = Signature::new(b"a{s(ii)}").unwrap();
    let mut it = sig.iter();

    let Some(SingleType::Array(_, elem)) = it.next() else {
        panic!("expected array");
    };

    let Some(SingleType::DictEntry(full, key, value)) = elem.iter().next() else {
        panic!("expected dict entry");
    };

    assert_eq!(full, b"{s(ii)}");
    assert_eq!(key, b"s");
    assert_eq!(value, b"(ii)");
}

#[test]
fn struct_fields() {
    let sig = Signature::new(b"(i(ss)ay)").unwrap();

    let Some(SingleType::Struct(full, fields)) = sig.iter().next() else {
        panic!("expected struct");
    };

    assert_eq!(full, b"(i(ss)ay)");
    assert_eq!(fields, b"i(ss)ay");

    let inner = fields.iter().map(|t| t.signature().as_str()).collect::<Vec<_>>();
    assert_eq!(inner, vec!["i", "(ss)", "ay"]);
}

#[test]
fn arity_and_fixed_size() {
    assert_eq!(Signature::new(b"").unwrap().arity(), 0);
    assert_eq!(Signature::new(b"ii").unwrap().arity(), 2);
    assert_eq!(Signature::new(b"a(ii)s").unwrap().arity(), 2);
    assert!(Signature::new(b"(id)").unwrap().is_single_complete_type());
    assert!(!Signature::new(b"ii").unwrap().is_single_complete_type());
    assert!(Signature::new(b"u(dx)").unwrap().is_fixed_size());
    assert!(!Signature::new(b"g").unwrap().is_fixed_size());
}
