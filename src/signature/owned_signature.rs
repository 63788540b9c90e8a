use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

use super::{validate, Signature, SignatureError, SignatureErrorKind, MAX_SIGNATURE};

/// An owned, validated D-Bus signature.
///
/// # Examples
///
/// ```
/// use tokbus::{OwnedSignature, Signature};
///
/// let sig = OwnedSignature::new(b"a{sv}")?;
/// assert_eq!(&*sig, Signature::new(b"a{sv}")?);
/// # Ok::<_, tokbus::SignatureError>(())
/// ```
#[derive(Clone, Hash, PartialEq, Eq)]
pub struct OwnedSignature(Vec<u8>);

impl OwnedSignature {
    /// Construct a new empty signature.
    pub const fn empty() -> Self {
        Self(Vec::new())
    }

    /// Try to construct a new signature with validation.
    pub fn new(signature: &[u8]) -> Result<Self, SignatureError> {
        validate(signature)?;
        Ok(Self(signature.to_vec()))
    }

    /// Construct an owned signature from a slice without validation.
    ///
    /// # Safety
    ///
    /// The caller must ensure that the signature is a valid signature.
    pub(crate) unsafe fn from_slice_unchecked(signature: &[u8]) -> Self {
        Self(signature.to_vec())
    }

    /// Append a single complete type to the signature.
    ///
    /// Errors if the result would exceed the maximum signature length.
    pub(crate) fn extend_from_signature(
        &mut self,
        other: &Signature,
    ) -> Result<(), SignatureError> {
        if self.0.len() + other.len() >= MAX_SIGNATURE {
            return Err(SignatureError::new(SignatureErrorKind::SignatureTooLong));
        }

        self.0.extend_from_slice(other.as_bytes());
        Ok(())
    }
}

impl Deref for OwnedSignature {
    type Target = Signature;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // SAFETY: The contents were validated at construction.
        unsafe { Signature::new_unchecked(&self.0) }
    }
}

impl Borrow<Signature> for OwnedSignature {
    #[inline]
    fn borrow(&self) -> &Signature {
        self
    }
}

impl AsRef<Signature> for OwnedSignature {
    #[inline]
    fn as_ref(&self) -> &Signature {
        self
    }
}

impl From<&Signature> for OwnedSignature {
    #[inline]
    fn from(signature: &Signature) -> Self {
        signature.to_owned()
    }
}

impl Default for OwnedSignature {
    #[inline]
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for OwnedSignature {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OwnedSignature").field(&self.as_str()).finish()
    }
}

impl fmt::Display for OwnedSignature {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PartialEq<Signature> for OwnedSignature {
    #[inline]
    fn eq(&self, other: &Signature) -> bool {
        *self.0 == *other.as_bytes()
    }
}

impl PartialEq<&Signature> for OwnedSignature {
    #[inline]
    fn eq(&self, other: &&Signature) -> bool {
        *self.0 == *other.as_bytes()
    }
}
