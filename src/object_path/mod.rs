//! Types for validated D-Bus object paths.

pub use self::object_path::ObjectPath;
mod object_path;

pub use self::owned_object_path::OwnedObjectPath;
mod owned_object_path;

pub use self::object_path_error::ObjectPathError;
mod object_path_error;

mod validation;

#[cfg(test)]
mod tests;
