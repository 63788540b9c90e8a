//! Parsing of D-Bus bus address strings.
//!
//! A bus address is one or more `transport:key=value,...` records separated
//! by `;`. Each record is tried in order until a connection succeeds.

use std::env;

use crate::error::{Error, ErrorKind, Result};

const ENV_SESSION_BUS: &str = "DBUS_SESSION_BUS_ADDRESS";
const ENV_SYSTEM_BUS: &str = "DBUS_SYSTEM_BUS_ADDRESS";
const ENV_STARTER_BUS_TYPE: &str = "DBUS_STARTER_BUS_TYPE";
const DEFAULT_SYSTEM_BUS: &str = "unix:path=/var/run/dbus/system_bus_socket";

/// A single parsed bus address record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// A unix domain socket. The payload is the socket path; abstract
    /// addresses are prefixed with a NUL byte.
    Unix(Vec<u8>),
    /// A TCP endpoint.
    Tcp {
        /// Host to connect to.
        host: String,
        /// Port to connect to.
        port: u16,
    },
    /// A TCP endpoint guarded by a nonce file, whose first 16 bytes are
    /// written to the stream before anything else.
    NonceTcp {
        /// Host to connect to.
        host: String,
        /// Port to connect to.
        port: u16,
        /// File holding the nonce.
        noncefile: Vec<u8>,
    },
}

/// Parse a bus address string into the list of records to try, in order.
///
/// # Examples
///
/// ```
/// use tokbus::address::{parse, Address};
///
/// let addresses = parse("unix:path=/tmp/bus;tcp:host=localhost,port=4000")?;
///
/// assert_eq!(addresses.len(), 2);
/// assert_eq!(addresses[0], Address::Unix(b"/tmp/bus".to_vec()));
/// # Ok::<_, tokbus::Error>(())
/// ```
pub fn parse(address: &str) -> Result<Vec<Address>> {
    let mut out = Vec::new();

    for record in address.split(';') {
        if record.is_empty() {
            continue;
        }

        let Some((transport, rest)) = record.split_once(':') else {
            return Err(Error::new(ErrorKind::InvalidAddress));
        };

        let mut keys = Vec::new();

        for pair in rest.split(',') {
            if pair.is_empty() {
                continue;
            }

            let Some((key, value)) = pair.split_once('=') else {
                return Err(Error::new(ErrorKind::InvalidAddress));
            };

            keys.push((key, unescape(value)?));
        }

        match transport {
            "unix" => {
                // The keys are tried in order: path, abstract, tmpdir.
                if let Some(path) = lookup(&keys, "path") {
                    out.push(Address::Unix(path));
                } else if let Some(name) = lookup(&keys, "abstract") {
                    let mut path = vec![0];
                    path.extend_from_slice(&name);
                    out.push(Address::Unix(path));
                } else if let Some(dir) = lookup(&keys, "tmpdir") {
                    let mut path = dir;
                    path.extend_from_slice(b"/dbus-socket");
                    out.push(Address::Unix(path));
                } else {
                    return Err(Error::new(ErrorKind::InvalidAddress));
                }
            }
            "tcp" | "nonce-tcp" => {
                let Some(host) = lookup(&keys, "host") else {
                    return Err(Error::new(ErrorKind::InvalidAddress));
                };

                let host = String::from_utf8(host)
                    .map_err(|_| Error::new(ErrorKind::InvalidAddress))?;

                let port = lookup(&keys, "port")
                    .and_then(|p| String::from_utf8(p).ok())
                    .and_then(|p| p.parse().ok())
                    .ok_or(Error::new(ErrorKind::InvalidAddress))?;

                if transport == "tcp" {
                    out.push(Address::Tcp { host, port });
                } else {
                    let Some(noncefile) = lookup(&keys, "noncefile") else {
                        return Err(Error::new(ErrorKind::InvalidAddress));
                    };

                    out.push(Address::NonceTcp {
                        host,
                        port,
                        noncefile,
                    });
                }
            }
            // Unknown transports are skipped so that an address list
            // containing them can still connect through a supported record.
            _ => {}
        }
    }

    if out.is_empty() {
        return Err(Error::new(ErrorKind::InvalidAddress));
    }

    Ok(out)
}

fn lookup(keys: &[(&str, Vec<u8>)], name: &str) -> Option<Vec<u8>> {
    keys.iter()
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.clone())
}

/// Undo the `%XX` escaping used in address values.
fn unescape(value: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(value.len());
    let mut bytes = value.bytes();

    while let Some(b) = bytes.next() {
        if b != b'%' {
            out.push(b);
            continue;
        }

        let (Some(hi), Some(lo)) = (bytes.next(), bytes.next()) else {
            return Err(Error::new(ErrorKind::InvalidAddress));
        };

        let Some(decoded) = crate::utils::hex_decode(&[hi, lo]) else {
            return Err(Error::new(ErrorKind::InvalidAddress));
        };

        out.extend_from_slice(&decoded);
    }

    Ok(out)
}

/// Resolve a user-supplied bus specification into an address string.
///
/// `session` and `system` resolve through the environment; anything else is
/// taken to be a literal address.
pub fn resolve(bus: &str) -> Result<String> {
    match bus {
        "session" => match env::var(ENV_SESSION_BUS) {
            Ok(address) => Ok(address),
            Err(_) => Err(Error::new(ErrorKind::MissingBus)),
        },
        "system" => Ok(env::var(ENV_SYSTEM_BUS).unwrap_or_else(|_| DEFAULT_SYSTEM_BUS.into())),
        "starter" => match env::var(ENV_STARTER_BUS_TYPE) {
            Ok(kind) if kind == "session" || kind == "system" => resolve(&kind),
            _ => Err(Error::new(ErrorKind::MissingBus)),
        },
        address => Ok(address.into()),
    }
}
