use crate::proto::Type;

use super::stack::Stack;
use super::{SignatureError, SignatureErrorKind, MAX_CONTAINER_DEPTH, MAX_DEPTH, MAX_SIGNATURE};

/// The kind of container a stack slot tracks, along with the number of
/// complete types seen inside it so far.
#[derive(Debug, Clone, Copy)]
pub(super) enum Kind {
    Array,
    Struct,
    Dict,
}

/// Validate a signature against the D-Bus grammar, including the length
/// limit and the per-container nesting limits.
pub(crate) const fn validate(bytes: &[u8]) -> Result<(), SignatureError> {
    use SignatureErrorKind::*;

    if bytes.len() >= MAX_SIGNATURE {
        return Err(SignatureError::new(SignatureTooLong));
    }

    let mut stack = Stack::<(Kind, u8), MAX_DEPTH>::new((Kind::Array, 0));
    let mut arrays = 0;
    let mut structs = 0;
    let mut n = 0;

    while n < bytes.len() {
        let t = Type::new(bytes[n]);
        n += 1;

        let mut is_basic = match t {
            Type::BYTE
            | Type::BOOLEAN
            | Type::INT16
            | Type::UINT16
            | Type::INT32
            | Type::UINT32
            | Type::INT64
            | Type::UINT64
            | Type::DOUBLE
            | Type::STRING
            | Type::OBJECT_PATH
            | Type::SIGNATURE
            | Type::UNIX_FD => true,
            // A variant closes a complete type but is not a valid dict key.
            Type::VARIANT => false,
            Type::ARRAY => {
                if arrays == MAX_CONTAINER_DEPTH || !stack.try_push((Kind::Array, 0)) {
                    return Err(SignatureError::new(ExceededMaximumArrayRecursion));
                }

                arrays += 1;
                continue;
            }
            Type::OPEN_PAREN => {
                if structs == MAX_CONTAINER_DEPTH || !stack.try_push((Kind::Struct, 0)) {
                    return Err(SignatureError::new(ExceededMaximumStructRecursion));
                }

                structs += 1;
                continue;
            }
            Type::CLOSE_PAREN => {
                let fields = match stack.pop() {
                    Some((Kind::Struct, fields)) => fields,
                    Some((Kind::Array, _)) => {
                        return Err(SignatureError::new(MissingArrayElementType));
                    }
                    _ => {
                        return Err(SignatureError::new(StructEndedButNotStarted));
                    }
                };

                if fields == 0 {
                    return Err(SignatureError::new(StructHasNoFields));
                }

                structs -= 1;
                false
            }
            Type::OPEN_BRACE => {
                if !stack.try_push((Kind::Dict, 0)) {
                    return Err(SignatureError::new(ExceededMaximumDictRecursion));
                }

                continue;
            }
            Type::CLOSE_BRACE => {
                let fields = match stack.pop() {
                    Some((Kind::Dict, fields)) => fields,
                    Some((Kind::Array, _)) => {
                        return Err(SignatureError::new(MissingArrayElementType));
                    }
                    _ => {
                        return Err(SignatureError::new(DictEndedButNotStarted));
                    }
                };

                match fields {
                    0 => return Err(SignatureError::new(DictEntryHasNoFields)),
                    1 => return Err(SignatureError::new(DictEntryHasOnlyOneField)),
                    2 => {}
                    _ => return Err(SignatureError::new(DictEntryHasTooManyFields)),
                }

                if !matches!(stack.peek(), Some((Kind::Array, _))) {
                    return Err(SignatureError::new(DictEntryNotInsideArray));
                }

                false
            }
            t => return Err(SignatureError::new(UnknownTypeCode(t))),
        };

        // A complete type also completes every array directly above it.
        while let Some((Kind::Array, _)) = stack.peek() {
            stack.pop();
            arrays -= 1;
            is_basic = false;
        }

        // The first complete type inside a dict entry is its key.
        if let Some((Kind::Dict, 0)) = stack.peek() {
            if !is_basic {
                return Err(SignatureError::new(DictKeyMustBeBasicType));
            }
        }

        if let Some((kind, seen)) = stack.pop() {
            let _ = stack.try_push((kind, seen + 1));
        }
    }

    match stack.pop() {
        Some((Kind::Array, _)) => Err(SignatureError::new(MissingArrayElementType)),
        Some((Kind::Struct, _)) => Err(SignatureError::new(StructStartedButNotEnded)),
        Some((Kind::Dict, _)) => Err(SignatureError::new(DictStartedButNotEnded)),
        None => Ok(()),
    }
}
