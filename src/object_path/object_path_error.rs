use std::error;
use std::fmt;

/// Error raised when validation of an [`ObjectPath`] fails.
///
/// [`ObjectPath`]: crate::ObjectPath
#[derive(Debug, PartialEq, Eq)]
pub struct ObjectPathError {
    path: Box<str>,
}

impl ObjectPathError {
    pub(super) fn new(path: &[u8]) -> Self {
        Self {
            path: String::from_utf8_lossy(path).into(),
        }
    }
}

impl fmt::Display for ObjectPathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid D-Bus object path: {:?}", self.path)
    }
}

impl error::Error for ObjectPathError {}
