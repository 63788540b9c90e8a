use std::slice;

use crate::proto;

use super::Signature;

/// A single complete type yielded by the [`Iter`] iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingleType<'a> {
    /// A basic type or a variant.
    Basic(&'a Signature),
    /// An array. Holds the full `a...` signature and the element signature.
    Array(&'a Signature, &'a Signature),
    /// A struct. Holds the full `(...)` signature and the field signatures.
    Struct(&'a Signature, &'a Signature),
    /// A dict entry. Holds the full `{kv}` signature, the key signature and
    /// the value signature.
    DictEntry(&'a Signature, &'a Signature, &'a Signature),
}

impl<'a> SingleType<'a> {
    /// The full signature of the single complete type.
    pub fn signature(&self) -> &'a Signature {
        match *self {
            SingleType::Basic(sig) => sig,
            SingleType::Array(sig, _) => sig,
            SingleType::Struct(sig, _) => sig,
            SingleType::DictEntry(sig, _, _) => sig,
        }
    }
}

/// An iterator over a signature which yields one [`SingleType`] at a time.
pub struct Iter<'a> {
    iter: slice::Iter<'a, u8>,
}

impl<'a> Iter<'a> {
    #[inline]
    pub(super) fn new(s: &'a Signature) -> Iter<'a> {
        Iter {
            iter: s.as_bytes().iter(),
        }
    }

    /// Consume one single complete type and return its signature.
    fn next_signature(&mut self) -> Option<&'a Signature> {
        let slice = self.iter.as_slice();
        let mut depth = 0usize;
        let mut n = 0;

        loop {
            let &b = self.iter.next()?;

            let (c, term) = match b {
                b'a' => (0, false),
                b'(' | b'{' => (1, false),
                b')' | b'}' => (-1, true),
                _ => (0, true),
            };

            depth = depth.wrapping_add_signed(c);

            n += 1;

            if term && depth == 0 {
                break;
            }
        }

        // SAFETY: A slice of a validated signature covering whole complete
        // types is itself a valid signature.
        Some(unsafe { Signature::new_unchecked(&slice[..n]) })
    }

    /// Consume the field types of a struct whose open paren has already been
    /// consumed, returning the field signatures without the parens.
    fn next_struct(&mut self) -> Option<&'a Signature> {
        let slice = self.iter.as_slice();
        let mut depth = 1usize;
        let mut n = 0;

        loop {
            let &b = self.iter.next()?;

            depth = depth.wrapping_add_signed(match b {
                b'(' | b'{' => 1,
                b')' | b'}' => -1,
                _ => 0,
            });

            if depth == 0 {
                break;
            }

            n += 1;
        }

        // SAFETY: See next_signature.
        Some(unsafe { Signature::new_unchecked(&slice[..n]) })
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = SingleType<'a>;

    fn next(&mut self) -> Option<SingleType<'a>> {
        let slice = self.iter.as_slice();
        let b = self.iter.next()?;

        Some(match proto::Type::new(*b) {
            proto::Type::ARRAY => {
                let elem = self.next_signature()?;
                // SAFETY: Covers the `a` plus its element type.
                let full = unsafe { Signature::new_unchecked(&slice[..elem.len() + 1]) };
                SingleType::Array(full, elem)
            }
            proto::Type::OPEN_PAREN => {
                let fields = self.next_struct()?;
                // SAFETY: Covers the parens and the field types.
                let full = unsafe { Signature::new_unchecked(&slice[..fields.len() + 2]) };
                SingleType::Struct(full, fields)
            }
            proto::Type::OPEN_BRACE => {
                let key = self.next_signature()?;
                let value = self.next_signature()?;

                if self.iter.next().copied() != Some(b'}') {
                    return None;
                }

                // SAFETY: Covers the braces, key and value types.
                let full =
                    unsafe { Signature::new_unchecked(&slice[..key.len() + value.len() + 2]) };
                SingleType::DictEntry(full, key, value)
            }
            // SAFETY: A one byte slice of a basic type code.
            _ => SingleType::Basic(unsafe { Signature::new_unchecked(&slice[..1]) }),
        })
    }
}
