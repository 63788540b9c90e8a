use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

use super::{ObjectPath, ObjectPathError};

/// An owned, validated D-Bus object path.
///
/// # Examples
///
/// ```
/// use tokbus::{ObjectPath, OwnedObjectPath};
///
/// let path = OwnedObjectPath::new("/org/example")?;
/// assert_eq!(&*path, ObjectPath::new("/org/example")?);
/// # Ok::<_, tokbus::ObjectPathError>(())
/// ```
#[derive(Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct OwnedObjectPath(Box<[u8]>);

impl OwnedObjectPath {
    /// Try to construct a new object path with validation.
    pub fn new<P>(path: &P) -> Result<Self, ObjectPathError>
    where
        P: ?Sized + AsRef<[u8]>,
    {
        Ok(ObjectPath::new(path)?.to_owned())
    }

    /// Construct an owned path from a slice without validation.
    ///
    /// # Safety
    ///
    /// The caller must ensure that the path is a valid object path.
    pub(crate) unsafe fn from_slice_unchecked(path: &[u8]) -> Self {
        Self(path.into())
    }
}

impl Deref for OwnedObjectPath {
    type Target = ObjectPath;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // SAFETY: The contents were validated at construction.
        unsafe { ObjectPath::new_unchecked(&self.0) }
    }
}

impl Borrow<ObjectPath> for OwnedObjectPath {
    #[inline]
    fn borrow(&self) -> &ObjectPath {
        self
    }
}

impl AsRef<ObjectPath> for OwnedObjectPath {
    #[inline]
    fn as_ref(&self) -> &ObjectPath {
        self
    }
}

impl From<&ObjectPath> for OwnedObjectPath {
    #[inline]
    fn from(path: &ObjectPath) -> Self {
        path.to_owned()
    }
}

impl fmt::Debug for OwnedObjectPath {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OwnedObjectPath").field(&self.as_str()).finish()
    }
}

impl fmt::Display for OwnedObjectPath {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PartialEq<ObjectPath> for OwnedObjectPath {
    #[inline]
    fn eq(&self, other: &ObjectPath) -> bool {
        *self.0 == *other.as_bytes()
    }
}

impl PartialEq<&ObjectPath> for OwnedObjectPath {
    #[inline]
    fn eq(&self, other: &&ObjectPath) -> bool {
        *self.0 == *other.as_bytes()
    }
}

impl PartialEq<str> for OwnedObjectPath {
    #[inline]
    fn eq(&self, other: &str) -> bool {
        *self.0 == *other.as_bytes()
    }
}
