//! Validators for the D-Bus name grammars.
//!
//! Interface names, error names, bus names and member names each have their
//! own grammar. These checks run at API entry so that malformed names are
//! rejected before a message is marshalled.

use std::error;
use std::fmt;

/// Maximum length of any D-Bus name.
const MAX_NAME: usize = 255;

/// Error raised when a D-Bus name fails validation.
#[derive(Debug, PartialEq, Eq)]
pub struct NameError {
    what: &'static str,
    name: Box<str>,
}

impl NameError {
    fn new(what: &'static str, name: &str) -> Self {
        Self {
            what,
            name: name.into(),
        }
    }
}

impl fmt::Display for NameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid D-Bus {} name: {:?}", self.what, self.name)
    }
}

impl error::Error for NameError {}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Validate a dot-separated name where every element is non-empty, made of
/// `[A-Za-z0-9_]`, and does not start with a digit.
fn validate_dotted(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME {
        return false;
    }

    let mut elements = 0;

    for element in name.split('.') {
        let bytes = element.as_bytes();

        let [first, rest @ ..] = bytes else {
            return false;
        };

        if first.is_ascii_digit() || !is_name_byte(*first) {
            return false;
        }

        if !rest.iter().copied().all(is_name_byte) {
            return false;
        }

        elements += 1;
    }

    elements >= 2
}

/// Validate an interface name: two or more dot-separated elements of
/// `[A-Za-z0-9_]`, no element starting with a digit.
///
/// # Examples
///
/// ```
/// use tokbus::names::validate_interface_name;
///
/// assert!(validate_interface_name("org.freedesktop.DBus").is_ok());
/// assert!(validate_interface_name("org").is_err());
/// assert!(validate_interface_name("org..DBus").is_err());
/// assert!(validate_interface_name("org.6Dbus").is_err());
/// ```
pub fn validate_interface_name(name: &str) -> Result<(), NameError> {
    if !validate_dotted(name) {
        return Err(NameError::new("interface", name));
    }

    Ok(())
}

/// Validate an error name. Error names follow the interface name grammar.
pub fn validate_error_name(name: &str) -> Result<(), NameError> {
    if !validate_dotted(name) {
        return Err(NameError::new("error", name));
    }

    Ok(())
}

/// Validate a member (method or signal) name: 1-255 bytes of
/// `[A-Za-z0-9_]`, not starting with a digit.
///
/// # Examples
///
/// ```
/// use tokbus::names::validate_member_name;
///
/// assert!(validate_member_name("Ping").is_ok());
/// assert!(validate_member_name("Get_2").is_ok());
/// assert!(validate_member_name("").is_err());
/// assert!(validate_member_name("2Fast").is_err());
/// assert!(validate_member_name("Has.Dot").is_err());
/// ```
pub fn validate_member_name(name: &str) -> Result<(), NameError> {
    let bytes = name.as_bytes();

    let valid = match bytes {
        [] => false,
        [first, ..] if first.is_ascii_digit() => false,
        bytes => bytes.len() <= MAX_NAME && bytes.iter().copied().all(is_name_byte),
    };

    if !valid {
        return Err(NameError::new("member", name));
    }

    Ok(())
}

/// Validate a bus name, either a unique name (`:1.42`) or a well-known
/// reverse-DNS name. Well-known names follow the interface grammar with `-`
/// additionally permitted; unique name elements may start with digits.
///
/// # Examples
///
/// ```
/// use tokbus::names::validate_bus_name;
///
/// assert!(validate_bus_name("org.freedesktop.DBus").is_ok());
/// assert!(validate_bus_name(":1.42").is_ok());
/// assert!(validate_bus_name("com.example-service").is_ok());
/// assert!(validate_bus_name("org").is_err());
/// assert!(validate_bus_name(":").is_err());
/// ```
pub fn validate_bus_name(name: &str) -> Result<(), NameError> {
    fn is_bus_byte(b: u8) -> bool {
        is_name_byte(b) || b == b'-'
    }

    fn validate(name: &str) -> bool {
        let (unique, name) = match name.strip_prefix(':') {
            Some(rest) => (true, rest),
            None => (false, name),
        };

        if name.is_empty() || name.len() > MAX_NAME {
            return false;
        }

        let mut elements = 0;

        for element in name.split('.') {
            let bytes = element.as_bytes();

            let [first, rest @ ..] = bytes else {
                return false;
            };

            if !is_bus_byte(*first) || (!unique && first.is_ascii_digit()) {
                return false;
            }

            if !rest.iter().copied().all(is_bus_byte) {
                return false;
            }

            elements += 1;
        }

        elements >= 2
    }

    if !validate(name) {
        return Err(NameError::new("bus", name));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_names() {
        assert!(validate_interface_name("a.b").is_ok());
        assert!(validate_interface_name("org.freedesktop.DBus.Properties").is_ok());
        assert!(validate_interface_name("_a._b").is_ok());
        assert!(validate_interface_name("").is_err());
        assert!(validate_interface_name("nodots").is_err());
        assert!(validate_interface_name(".leading.dot").is_err());
        assert!(validate_interface_name("trailing.dot.").is_err());
        assert!(validate_interface_name("a..b").is_err());
        assert!(validate_interface_name("a.1b").is_err());
        assert!(validate_interface_name("a.b-c").is_err());

        let long = format!("a.{}", "b".repeat(300));
        assert!(validate_interface_name(&long).is_err());
    }

    #[test]
    fn member_names() {
        assert!(validate_member_name("Hello").is_ok());
        assert!(validate_member_name("_hidden").is_ok());
        assert!(validate_member_name("A1").is_ok());
        assert!(validate_member_name("").is_err());
        assert!(validate_member_name("1A").is_err());
        assert!(validate_member_name("with space").is_err());
        assert!(validate_member_name(&"m".repeat(256)).is_err());
    }

    #[test]
    fn bus_names() {
        assert!(validate_bus_name("org.example").is_ok());
        assert!(validate_bus_name("org.example-dash").is_ok());
        assert!(validate_bus_name(":1.42").is_ok());
        assert!(validate_bus_name(":1.0.1").is_ok());
        assert!(validate_bus_name("org").is_err());
        assert!(validate_bus_name(":").is_err());
        assert!(validate_bus_name("org.7zip").is_err());
        assert!(validate_bus_name("org..example").is_err());
    }
}
