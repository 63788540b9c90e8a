//! The SASL-framed handshake D-Bus performs before binary framing.
//!
//! This is a sans-io state machine: the transport feeds it `\r\n`-terminated
//! lines and writes out whatever it asks to send. Mechanisms are attempted
//! in the order EXTERNAL, DBUS_COOKIE_SHA1, ANONYMOUS; a `REJECTED` or
//! `ERROR` response moves on to the next one.

use std::env;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use sha1::{Digest, Sha1};

use crate::error::{Error, ErrorKind, Result};
use crate::utils::{hex_decode, hex_encode, split_once, trim_end};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mech {
    External,
    CookieSha1,
    Anonymous,
}

impl Mech {
    const PREFERENCE: [Mech; 3] = [Mech::External, Mech::CookieSha1, Mech::Anonymous];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// An AUTH command has been sent, waiting for OK, DATA or REJECTED.
    WaitingForReply,
    /// NEGOTIATE_UNIX_FD has been sent, waiting for AGREE_UNIX_FD.
    WaitingForAgreeUnixFd,
    /// BEGIN has been produced; the handshake is over.
    Done,
}

/// What the transport should do next.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Step {
    /// Send the line and wait for the next response.
    Send(Vec<u8>),
    /// Send `BEGIN`; the handshake is complete and binary framing follows.
    Begin {
        /// Whether the server agreed to pass unix file descriptors.
        unix_fd: bool,
    },
}

/// Client side of the SASL handshake.
pub(crate) struct ClientAuth {
    uid: u32,
    remaining: Vec<Mech>,
    mech: Mech,
    state: State,
    negotiate_unix_fd: bool,
    unix_fd: bool,
    guid: Option<Box<str>>,
    /// Keyring directory override, used by tests.
    keyring_dir: Option<PathBuf>,
}

impl ClientAuth {
    pub(crate) fn new(uid: u32, negotiate_unix_fd: bool) -> Self {
        let [mech, rest @ ..] = Mech::PREFERENCE;

        let mut remaining = rest.to_vec();
        remaining.reverse();

        Self {
            uid,
            remaining,
            mech,
            state: State::WaitingForReply,
            negotiate_unix_fd,
            unix_fd: false,
            guid: None,
            keyring_dir: None,
        }
    }

    /// The GUID the server sent in its OK response.
    pub(crate) fn guid(&self) -> Option<&str> {
        self.guid.as_deref()
    }

    /// The first AUTH line to send.
    pub(crate) fn initial(&self) -> Vec<u8> {
        self.auth_line(self.mech)
    }

    fn auth_line(&self, mech: Mech) -> Vec<u8> {
        match mech {
            Mech::External => {
                let mut line = b"AUTH EXTERNAL ".to_vec();
                line.extend_from_slice(&hex_encode(self.uid.to_string().as_bytes()));
                line
            }
            Mech::CookieSha1 => {
                let user = env::var("USER")
                    .or_else(|_| env::var("LOGNAME"))
                    .unwrap_or_else(|_| self.uid.to_string());

                let mut line = b"AUTH DBUS_COOKIE_SHA1 ".to_vec();
                line.extend_from_slice(&hex_encode(user.as_bytes()));
                line
            }
            Mech::Anonymous => {
                let mut line = b"AUTH ANONYMOUS ".to_vec();
                line.extend_from_slice(&hex_encode(b"tokbus"));
                line
            }
        }
    }

    fn next_mech(&mut self) -> Result<Step> {
        let Some(mech) = self.remaining.pop() else {
            return Err(Error::new(ErrorKind::AuthenticationRejected));
        };

        self.mech = mech;
        self.state = State::WaitingForReply;
        Ok(Step::Send(self.auth_line(mech)))
    }

    fn begin(&mut self) -> Step {
        self.state = State::Done;

        Step::Begin {
            unix_fd: self.unix_fd,
        }
    }

    /// Advance the handshake with one line received from the server. The
    /// line may still carry its `\r\n` terminator.
    pub(crate) fn step(&mut self, line: &[u8]) -> Result<Step> {
        let line = trim_end(line);

        let (command, rest) = match split_once(line, b' ') {
            Some((command, rest)) => (command, rest),
            None => (line, &b""[..]),
        };

        match (self.state, command) {
            (State::WaitingForReply, b"OK") => {
                if rest.is_empty() {
                    return Err(Error::new(ErrorKind::AuthenticationFailed));
                }

                self.guid = Some(String::from_utf8_lossy(rest).into());

                if self.negotiate_unix_fd {
                    self.state = State::WaitingForAgreeUnixFd;
                    Ok(Step::Send(b"NEGOTIATE_UNIX_FD".to_vec()))
                } else {
                    Ok(self.begin())
                }
            }
            (State::WaitingForReply, b"REJECTED") => self.next_mech(),
            (State::WaitingForReply, b"ERROR") => self.next_mech(),
            (State::WaitingForReply, b"DATA") => match self.mech {
                // EXTERNAL has no challenge data to exchange.
                Mech::External => Ok(Step::Send(b"DATA".to_vec())),
                Mech::CookieSha1 => match self.cookie_response(rest) {
                    Ok(step) => Ok(step),
                    Err(..) => Ok(Step::Send(b"ERROR no usable cookie".to_vec())),
                },
                Mech::Anonymous => Err(Error::new(ErrorKind::InvalidSasl)),
            },
            (State::WaitingForAgreeUnixFd, b"AGREE_UNIX_FD") => {
                self.unix_fd = true;
                Ok(self.begin())
            }
            // The server may refuse fd passing and the session continues
            // without it.
            (State::WaitingForAgreeUnixFd, b"ERROR") => Ok(self.begin()),
            _ => Err(Error::new(ErrorKind::InvalidSasl)),
        }
    }

    /// Answer a DBUS_COOKIE_SHA1 challenge.
    ///
    /// The challenge payload is `hex(context cookie_id server_challenge)`;
    /// the response is `hex(client_challenge hash)` where `hash` is the sha1
    /// over `server_challenge:client_challenge:cookie`.
    fn cookie_response(&self, challenge: &[u8]) -> Result<Step> {
        let data = hex_decode(challenge).ok_or(Error::new(ErrorKind::InvalidSasl))?;

        let mut parts = data.split(|&b| b == b' ');

        let (Some(context), Some(cookie_id), Some(server_challenge)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::new(ErrorKind::InvalidSasl));
        };

        let cookie = self.lookup_cookie(context, cookie_id)?;

        let client_challenge = {
            let random = rand::random::<[u8; 8]>();
            hex_encode(&Sha1::digest(random))
        };

        let mut to_hash = server_challenge.to_vec();
        to_hash.push(b':');
        to_hash.extend_from_slice(&client_challenge);
        to_hash.push(b':');
        to_hash.extend_from_slice(&cookie);

        let response = hex_encode(&Sha1::digest(&to_hash));

        let mut reply = client_challenge;
        reply.push(b' ');
        reply.extend_from_slice(&response);

        let mut line = b"DATA ".to_vec();
        line.extend_from_slice(&hex_encode(&reply));
        Ok(Step::Send(line))
    }

    /// Read the named cookie out of the keyring context file, refusing
    /// keyring directories with unsafe permissions.
    fn lookup_cookie(&self, context: &[u8], cookie_id: &[u8]) -> Result<Vec<u8>> {
        let dir = match &self.keyring_dir {
            Some(dir) => dir.clone(),
            None => {
                let home = env::var_os("HOME").ok_or(Error::new(ErrorKind::AuthenticationFailed))?;
                let mut dir = PathBuf::from(home);
                dir.push(".dbus-keyrings");
                dir
            }
        };

        let meta = fs::metadata(&dir)?;

        if meta.mode() & 0o066 != 0 || meta.uid() != nix::unistd::geteuid().as_raw() {
            return Err(Error::new(ErrorKind::AuthenticationFailed));
        }

        let context = std::str::from_utf8(context)
            .map_err(|_| Error::new(ErrorKind::InvalidSasl))?;

        if context.is_empty() || context.contains(['/', '\\']) {
            return Err(Error::new(ErrorKind::InvalidSasl));
        }

        let contents = fs::read(dir.join(context))?;

        for line in contents.split(|&b| b == b'\n') {
            let mut parts = line.split(|&b| b == b' ').filter(|p| !p.is_empty());

            let (Some(id), Some(_created), Some(cookie)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };

            if id == cookie_id {
                return Ok(cookie.to_vec());
            }
        }

        Err(Error::new(ErrorKind::AuthenticationFailed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_happy_path() {
        let mut auth = ClientAuth::new(1000, false);

        assert_eq!(auth.initial(), b"AUTH EXTERNAL 31303030".to_vec());

        let step = auth.step(b"OK 1234deadbeef\r\n").unwrap();
        assert_eq!(step, Step::Begin { unix_fd: false });
        assert_eq!(auth.guid(), Some("1234deadbeef"));
    }

    #[test]
    fn external_with_unix_fd_negotiation() {
        let mut auth = ClientAuth::new(0, true);

        assert_eq!(auth.initial(), b"AUTH EXTERNAL 30".to_vec());

        let step = auth.step(b"OK abcd\r\n").unwrap();
        assert_eq!(step, Step::Send(b"NEGOTIATE_UNIX_FD".to_vec()));

        let step = auth.step(b"AGREE_UNIX_FD\r\n").unwrap();
        assert_eq!(step, Step::Begin { unix_fd: true });
    }

    #[test]
    fn unix_fd_refusal_still_begins() {
        let mut auth = ClientAuth::new(0, true);
        auth.step(b"OK abcd\r\n").unwrap();

        let step = auth.step(b"ERROR not supported\r\n").unwrap();
        assert_eq!(step, Step::Begin { unix_fd: false });
    }

    #[test]
    fn external_data_roundtrip() {
        let mut auth = ClientAuth::new(1000, false);

        let step = auth.step(b"DATA\r\n").unwrap();
        assert_eq!(step, Step::Send(b"DATA".to_vec()));
    }

    #[test]
    fn rejected_walks_the_preference_list() {
        let mut auth = ClientAuth::new(1000, false);

        let step = auth.step(b"REJECTED DBUS_COOKIE_SHA1 ANONYMOUS\r\n").unwrap();
        let Step::Send(line) = step else {
            panic!("expected another AUTH");
        };
        assert!(line.starts_with(b"AUTH DBUS_COOKIE_SHA1 "));

        let step = auth.step(b"REJECTED ANONYMOUS\r\n").unwrap();
        let Step::Send(line) = step else {
            panic!("expected another AUTH");
        };
        assert_eq!(line, b"AUTH ANONYMOUS 746f6b627573".to_vec());

        let err = auth.step(b"REJECTED\r\n").unwrap_err();
        assert!(format!("{err}").contains("rejected"));
    }

    #[test]
    fn ok_without_guid_fails() {
        let mut auth = ClientAuth::new(1000, false);
        assert!(auth.step(b"OK\r\n").is_err());
    }

    #[test]
    fn garbage_command_fails() {
        let mut auth = ClientAuth::new(1000, false);
        assert!(auth.step(b"WAT 123\r\n").is_err());
    }

    #[test]
    fn cookie_challenge_produces_well_formed_reply() {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!("tokbus-keyring-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700)).unwrap();

        fs::write(dir.join("test_context"), b"42 1700000000 deadbeefcafe\n").unwrap();

        let mut auth = ClientAuth::new(1000, false);
        auth.keyring_dir = Some(dir.clone());
        auth.mech = Mech::CookieSha1;

        let mut challenge = b"DATA ".to_vec();
        challenge.extend_from_slice(&hex_encode(b"test_context 42 0123456789abcdef"));
        challenge.extend_from_slice(b"\r\n");

        let Step::Send(line) = auth.step(&challenge).unwrap() else {
            panic!("expected DATA reply");
        };

        let payload = line.strip_prefix(b"DATA ").unwrap();
        let decoded = hex_decode(payload).unwrap();
        let text = String::from_utf8(decoded).unwrap();

        let (client_challenge, hash) = text.split_once(' ').unwrap();
        // Both halves are sha1 digests in hex.
        assert_eq!(client_challenge.len(), 40);
        assert_eq!(hash.len(), 40);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn unknown_cookie_id_turns_into_error_line() {
        let mut auth = ClientAuth::new(1000, false);
        auth.mech = Mech::CookieSha1;
        auth.keyring_dir = Some(PathBuf::from("/nonexistent-keyring"));

        let mut challenge = b"DATA ".to_vec();
        challenge.extend_from_slice(&hex_encode(b"ctx 1 abcd"));

        let Step::Send(line) = auth.step(&challenge).unwrap() else {
            panic!("expected ERROR line");
        };

        assert!(line.starts_with(b"ERROR"));
    }
}
