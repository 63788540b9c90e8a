use std::fmt;
use std::str::from_utf8_unchecked;

use crate::proto::Type;

use super::{validate, Iter, OwnedSignature, SignatureError, SignatureErrorKind};

/// A borrowed, validated D-Bus signature.
///
/// A signature is a concatenation of zero or more single complete types. Use
/// [`Signature::iter`] to walk the single complete types of a root signature.
///
/// # Examples
///
/// ```
/// use tokbus::Signature;
///
/// const SIG: &Signature = Signature::new_const(b"aaaai");
///
/// assert!(Signature::new(b"aai").is_ok());
/// assert!(Signature::new(b"a").is_err());
/// ```
#[derive(Hash, PartialEq, Eq)]
#[repr(transparent)]
pub struct Signature([u8]);

impl Signature {
    /// The empty signature.
    pub const EMPTY: &'static Signature = Signature::new_const(b"");

    /// A single byte.
    pub const BYTE: &'static Signature = Signature::new_const(b"y");

    /// A boolean.
    pub const BOOLEAN: &'static Signature = Signature::new_const(b"b");

    /// Signed 16-bit integer.
    pub const INT16: &'static Signature = Signature::new_const(b"n");

    /// Unsigned 16-bit integer.
    pub const UINT16: &'static Signature = Signature::new_const(b"q");

    /// Signed 32-bit integer.
    pub const INT32: &'static Signature = Signature::new_const(b"i");

    /// Unsigned 32-bit integer.
    pub const UINT32: &'static Signature = Signature::new_const(b"u");

    /// Signed 64-bit integer.
    pub const INT64: &'static Signature = Signature::new_const(b"x");

    /// Unsigned 64-bit integer.
    pub const UINT64: &'static Signature = Signature::new_const(b"t");

    /// IEEE 754 double-precision floating point.
    pub const DOUBLE: &'static Signature = Signature::new_const(b"d");

    /// A string.
    pub const STRING: &'static Signature = Signature::new_const(b"s");

    /// An object path.
    pub const OBJECT_PATH: &'static Signature = Signature::new_const(b"o");

    /// A signature.
    pub const SIGNATURE: &'static Signature = Signature::new_const(b"g");

    /// A variant.
    pub const VARIANT: &'static Signature = Signature::new_const(b"v");

    /// A unix file descriptor index.
    pub const UNIX_FD: &'static Signature = Signature::new_const(b"h");

    /// Construct a new empty signature.
    pub const fn empty() -> &'static Self {
        // SAFETY: The empty signature is trivially valid.
        unsafe { Self::new_unchecked(&[]) }
    }

    /// Construct a new signature with validation inside of a constant
    /// context.
    ///
    /// This will panic in case the signature is invalid.
    ///
    /// ```compile_fail
    /// use tokbus::Signature;
    ///
    /// const BAD: &Signature = Signature::new_const(b"(a)");
    /// ```
    ///
    /// # Examples
    ///
    /// ```
    /// use tokbus::Signature;
    ///
    /// const SIG: &Signature = Signature::new_const(b"i(ai)");
    /// ```
    #[inline]
    #[track_caller]
    pub const fn new_const(signature: &[u8]) -> &Signature {
        if validate(signature).is_err() {
            panic!("Invalid D-Bus signature")
        };

        // SAFETY: The byte slice is repr transparent over this type.
        unsafe { Self::new_unchecked(signature) }
    }

    /// Try to construct a new signature with validation.
    #[inline]
    pub const fn new(signature: &[u8]) -> Result<&Signature, SignatureError> {
        if let Err(error) = validate(signature) {
            return Err(error);
        };

        // SAFETY: The byte slice is repr transparent over this type.
        unsafe { Ok(Self::new_unchecked(signature)) }
    }

    /// Construct a new signature without validation. The caller is
    /// responsible for ensuring that the signature is valid.
    ///
    /// # Safety
    ///
    /// The caller must ensure that the signature is a valid signature.
    #[inline]
    pub(crate) const unsafe fn new_unchecked(signature: &[u8]) -> &Self {
        &*(signature as *const _ as *const Signature)
    }

    /// Test if the signature is empty.
    ///
    /// # Examples
    ///
    /// ```
    /// use tokbus::Signature;
    ///
    /// assert!(Signature::EMPTY.is_empty());
    /// assert!(!Signature::STRING.is_empty());
    /// ```
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Get the length of the signature in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Get the signature as a string.
    pub fn as_str(&self) -> &str {
        // SAFETY: Validation indirectly ensures that the signature is valid
        // UTF-8.
        unsafe { from_utf8_unchecked(&self.0) }
    }

    /// Get the signature as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Iterate over the single complete types of the signature.
    ///
    /// # Examples
    ///
    /// ```
    /// use tokbus::Signature;
    ///
    /// let sig = Signature::new(b"ia(ii)")?;
    /// let mut it = sig.iter();
    ///
    /// assert_eq!(it.next().map(|t| t.signature().as_str()), Some("i"));
    /// assert_eq!(it.next().map(|t| t.signature().as_str()), Some("a(ii)"));
    /// assert!(it.next().is_none());
    /// # Ok::<_, tokbus::SignatureError>(())
    /// ```
    pub fn iter(&self) -> Iter<'_> {
        Iter::new(self)
    }

    /// The number of single complete types in the signature.
    pub fn arity(&self) -> usize {
        self.iter().count()
    }

    /// Test if the signature consists of exactly one single complete type.
    pub fn is_single_complete_type(&self) -> bool {
        let mut it = self.iter();
        it.next().is_some() && it.next().is_none()
    }

    /// Require that the signature is a single complete type, as needed for
    /// the contents of a variant.
    pub(crate) fn require_single_complete_type(&self) -> Result<(), SignatureError> {
        if !self.is_single_complete_type() {
            return Err(SignatureError::new(SignatureErrorKind::NotSingleCompleteType));
        }

        Ok(())
    }

    /// The alignment in bytes of the first type in the signature.
    ///
    /// # Examples
    ///
    /// ```
    /// use tokbus::Signature;
    ///
    /// assert_eq!(Signature::new(b"y")?.alignment(), 1);
    /// assert_eq!(Signature::new(b"nq")?.alignment(), 2);
    /// assert_eq!(Signature::new(b"ai")?.alignment(), 4);
    /// assert_eq!(Signature::new(b"(yy)")?.alignment(), 8);
    /// # Ok::<_, tokbus::SignatureError>(())
    /// ```
    pub fn alignment(&self) -> usize {
        match self.0.first() {
            Some(&b) => Type::new(b).alignment(),
            None => 1,
        }
    }

    /// Test if every type in the signature has a fixed encoded size.
    ///
    /// # Examples
    ///
    /// ```
    /// use tokbus::Signature;
    ///
    /// assert!(Signature::new(b"u(dx)")?.is_fixed_size());
    /// assert!(!Signature::new(b"us")?.is_fixed_size());
    /// assert!(!Signature::new(b"au")?.is_fixed_size());
    /// # Ok::<_, tokbus::SignatureError>(())
    /// ```
    pub fn is_fixed_size(&self) -> bool {
        self.0.iter().all(|&b| {
            let t = Type::new(b);
            t.fixed_size().is_some() || matches!(t, Type::OPEN_PAREN | Type::CLOSE_PAREN)
        })
    }
}

impl fmt::Debug for Signature {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Signature").field(&self.as_str()).finish()
    }
}

impl fmt::Display for Signature {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AsRef<Signature> for Signature {
    #[inline]
    fn as_ref(&self) -> &Signature {
        self
    }
}

impl ToOwned for Signature {
    type Owned = OwnedSignature;

    #[inline]
    fn to_owned(&self) -> Self::Owned {
        // SAFETY: This signature is already validated.
        unsafe { OwnedSignature::from_slice_unchecked(&self.0) }
    }
}

impl<'a> IntoIterator for &'a Signature {
    type Item = super::SingleType<'a>;
    type IntoIter = Iter<'a>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl PartialEq<OwnedSignature> for Signature {
    #[inline]
    fn eq(&self, other: &OwnedSignature) -> bool {
        self.0 == *other.as_bytes()
    }
}

impl PartialEq<OwnedSignature> for &Signature {
    #[inline]
    fn eq(&self, other: &OwnedSignature) -> bool {
        self.0 == *other.as_bytes()
    }
}

impl PartialEq<[u8]> for Signature {
    #[inline]
    fn eq(&self, other: &[u8]) -> bool {
        self.0 == *other
    }
}

impl<const N: usize> PartialEq<[u8; N]> for Signature {
    #[inline]
    fn eq(&self, other: &[u8; N]) -> bool {
        self.0 == other[..]
    }
}

impl<const N: usize> PartialEq<[u8; N]> for &Signature {
    #[inline]
    fn eq(&self, other: &[u8; N]) -> bool {
        self.0 == other[..]
    }
}
