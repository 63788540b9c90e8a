//! The byte-stream transport beneath a connection.
//!
//! Opens the stream for a parsed [`Address`], writes the nonce prelude and
//! the credential NUL byte, and afterwards moves bytes in and out, carrying
//! `SCM_RIGHTS` file descriptors on unix sockets. All I/O methods take
//! `&self` so the engine can wait for readability and writability at the
//! same time.

use std::io;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use tokio::io::Interest;
use tokio::net::{TcpStream, UnixStream};

use crate::address::Address;
use crate::error::{Error, ErrorKind, Result};

/// Number of fds that can ride along a single read.
const FD_BATCH: usize = 16;

pub(crate) enum Transport {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Transport {
    /// Open a transport by trying each address in order, and perform the
    /// pre-SASL prelude on the resulting stream.
    pub(crate) async fn connect(addresses: &[Address]) -> Result<Transport> {
        let mut last = None;

        for address in addresses {
            match Self::connect_one(address).await {
                Ok(transport) => return Ok(transport),
                Err(error) => last = Some(error),
            }
        }

        Err(last.unwrap_or(Error::new(ErrorKind::ConnectFailed)))
    }

    async fn connect_one(address: &Address) -> Result<Transport> {
        let transport = match address {
            Address::Unix(path) => match path.split_first() {
                Some((0, name)) => {
                    let stream = connect_abstract(name)?;
                    stream.set_nonblocking(true)?;
                    Transport::Unix(UnixStream::from_std(stream)?)
                }
                _ => {
                    let path = std::ffi::OsStr::from_bytes(path);
                    Transport::Unix(UnixStream::connect(path).await?)
                }
            },
            Address::Tcp { host, port } => {
                Transport::Tcp(TcpStream::connect((host.as_str(), *port)).await?)
            }
            Address::NonceTcp {
                host,
                port,
                noncefile,
            } => {
                let nonce = std::fs::read(std::ffi::OsStr::from_bytes(noncefile))?;

                if nonce.len() < 16 {
                    return Err(Error::new(ErrorKind::InvalidAddress));
                }

                let transport =
                    Transport::Tcp(TcpStream::connect((host.as_str(), *port)).await?);
                transport.send_all(&nonce[..16]).await?;
                transport
            }
        };

        // The single NUL byte D-Bus requires for credential passing.
        transport.send_all(b"\0").await?;
        Ok(transport)
    }

    /// Construct a transport over an already connected unix stream, which
    /// still performs its own prelude. Used by tests.
    #[cfg(test)]
    pub(crate) async fn from_unix_stream(stream: UnixStream) -> Result<Transport> {
        let transport = Transport::Unix(stream);
        transport.send_all(b"\0").await?;
        Ok(transport)
    }

    /// Whether the transport can carry file descriptors.
    pub(crate) fn supports_fd_passing(&self) -> bool {
        matches!(self, Transport::Unix(..))
    }

    /// Write as much of the buffer as the socket accepts, returning the
    /// number of bytes written. File descriptors are attached to the bytes
    /// of this write.
    pub(crate) async fn send(&self, buf: &[u8], fds: &[OwnedFd]) -> Result<usize> {
        match self {
            Transport::Unix(stream) if !fds.is_empty() => send_with_fds(stream, buf, fds).await,
            Transport::Unix(stream) => loop {
                stream.writable().await?;

                match stream.try_write(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e.into()),
                }
            },
            Transport::Tcp(stream) => loop {
                stream.writable().await?;

                match stream.try_write(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e.into()),
                }
            },
        }
    }

    /// Write the whole buffer.
    pub(crate) async fn send_all(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.send(buf, &[]).await?;

            if n == 0 {
                return Err(Error::new(ErrorKind::Disconnected));
            }

            buf = &buf[n..];
        }

        Ok(())
    }

    /// Read more bytes into `buf`, collecting any file descriptors that
    /// arrive alongside. Returns the number of bytes read, zero at EOF.
    pub(crate) async fn recv(
        &self,
        buf: &mut Vec<u8>,
        fds: &mut Vec<OwnedFd>,
    ) -> Result<usize> {
        let mut chunk = [0u8; 8192];

        let n = match self {
            Transport::Unix(stream) => recv_with_fds(stream, &mut chunk, fds).await?,
            Transport::Tcp(stream) => loop {
                stream.readable().await?;

                match stream.try_read(&mut chunk) {
                    Ok(n) => break n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e.into()),
                }
            },
        };

        buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }
}

/// Connect an abstract-namespace unix socket, which cannot be expressed as
/// a filesystem path.
fn connect_abstract(name: &[u8]) -> Result<std::os::unix::net::UnixStream> {
    use nix::sys::socket::{connect, socket, AddressFamily, SockFlag, SockType, UnixAddr};

    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(io::Error::from)?;

    let addr = UnixAddr::new_abstract(name).map_err(io::Error::from)?;
    connect(fd.as_raw_fd(), &addr).map_err(io::Error::from)?;

    Ok(std::os::unix::net::UnixStream::from(fd))
}

async fn send_with_fds(stream: &UnixStream, buf: &[u8], fds: &[OwnedFd]) -> Result<usize> {
    let raw: Vec<i32> = fds.iter().map(|fd| fd.as_raw_fd()).collect();

    loop {
        stream.writable().await?;

        let result = stream.try_io(Interest::WRITABLE, || {
            let iov = [IoSlice::new(buf)];
            let cmsgs = [ControlMessage::ScmRights(&raw)];

            sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
                .map_err(io::Error::from)
        });

        match result {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

async fn recv_with_fds(
    stream: &UnixStream,
    chunk: &mut [u8],
    fds: &mut Vec<OwnedFd>,
) -> Result<usize> {
    loop {
        stream.readable().await?;

        let mut received = Vec::new();

        let result = stream.try_io(Interest::READABLE, || {
            let mut cmsg_space = nix::cmsg_space!([i32; FD_BATCH]);
            let mut iov = [IoSliceMut::new(chunk)];

            let msg = recvmsg::<()>(
                stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_space),
                MsgFlags::MSG_CMSG_CLOEXEC,
            )
            .map_err(io::Error::from)?;

            for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                if let ControlMessageOwned::ScmRights(raw) = cmsg {
                    for fd in raw {
                        // SAFETY: The kernel hands us ownership of freshly
                        // received descriptors.
                        received.push(unsafe { OwnedFd::from_raw_fd(fd) });
                    }
                }
            }

            Ok(msg.bytes)
        });

        match result {
            Ok(n) => {
                fds.append(&mut received);
                return Ok(n);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
