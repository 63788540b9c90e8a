use tokio::sync::{mpsc, watch};

use crate::address;
use crate::error::{Error, ErrorKind, Result};
use crate::sasl::{ClientAuth, Step};
use crate::transport::Transport;

use super::{Connection, Engine};

/// Default soft limit on queued outgoing bytes (128 MiB).
const DEFAULT_MAX_QUEUED: usize = 128 * 1024 * 1024;

/// Builder of a [`Connection`].
///
/// # Examples
///
/// ```no_run
/// use tokbus::ConnectionBuilder;
///
/// # #[tokio::main] async fn main() -> tokbus::Result<()> {
/// let c = ConnectionBuilder::new().session_bus().connect().await?;
/// # Ok(()) }
/// ```
pub struct ConnectionBuilder {
    bus: Box<str>,
    negotiate_unix_fd: bool,
    max_queued_bytes: usize,
}

impl ConnectionBuilder {
    /// Construct a new builder targeting the session bus.
    pub fn new() -> Self {
        Self {
            bus: "session".into(),
            negotiate_unix_fd: true,
            max_queued_bytes: DEFAULT_MAX_QUEUED,
        }
    }

    /// Connect to the session bus (the default).
    pub fn session_bus(mut self) -> Self {
        self.bus = "session".into();
        self
    }

    /// Connect to the system bus.
    pub fn system_bus(mut self) -> Self {
        self.bus = "system".into();
        self
    }

    /// Connect to an explicit bus address, such as
    /// `unix:path=/run/user/1000/bus`.
    pub fn address(mut self, address: &str) -> Self {
        self.bus = address.into();
        self
    }

    /// Control whether `NEGOTIATE_UNIX_FD` is attempted during the
    /// handshake. Defaults to true on transports that can carry fds.
    pub fn negotiate_unix_fd(mut self, negotiate: bool) -> Self {
        self.negotiate_unix_fd = negotiate;
        self
    }

    /// Soft limit on memory used by queued outgoing messages. Exceeding it
    /// closes the connection.
    pub fn max_queued_bytes(mut self, bytes: usize) -> Self {
        self.max_queued_bytes = bytes;
        self
    }

    /// Resolve the address, connect, authenticate and say `Hello`.
    pub async fn connect(self) -> Result<Connection> {
        let address = address::resolve(&self.bus)?;
        let addresses = address::parse(&address)?;
        let transport = Transport::connect(&addresses).await?;
        self.establish(transport).await
    }

    /// Establish a connection over an already connected unix stream. Used
    /// by tests to talk to a scripted peer.
    #[cfg(test)]
    pub(crate) async fn connect_unix_stream(
        self,
        stream: tokio::net::UnixStream,
    ) -> Result<Connection> {
        let transport = Transport::from_unix_stream(stream).await?;
        self.establish(transport).await
    }

    async fn establish(self, transport: Transport) -> Result<Connection> {
        let uid = nix::unistd::geteuid().as_raw();
        let negotiate = self.negotiate_unix_fd && transport.supports_fd_passing();

        let mut auth = ClientAuth::new(uid, negotiate);
        let mut buf = Vec::new();

        send_line(&transport, &auth.initial()).await?;

        loop {
            let line = read_line(&transport, &mut buf).await?;

            match auth.step(&line)? {
                Step::Send(line) => send_line(&transport, &line).await?,
                Step::Begin { .. } => {
                    send_line(&transport, b"BEGIN").await?;
                    break;
                }
            }
        }

        let (actions, actions_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed) = watch::channel(false);

        // Bytes past the final SASL line already belong to the binary
        // protocol.
        let engine = Engine::new(
            transport,
            buf,
            actions_rx,
            actions.clone(),
            closed_tx,
            self.max_queued_bytes,
        );

        tokio::spawn(engine.run());

        let connection = Connection::from_parts(actions, closed);
        connection.hello().await?;
        Ok(connection)
    }
}

impl Default for ConnectionBuilder {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

async fn send_line(transport: &Transport, line: &[u8]) -> Result<()> {
    let mut out = line.to_vec();
    out.extend_from_slice(b"\r\n");
    transport.send_all(&out).await
}

async fn read_line(transport: &Transport, buf: &mut Vec<u8>) -> Result<Vec<u8>> {
    loop {
        if let Some(n) = buf.iter().position(|&b| b == b'\n') {
            return Ok(buf.drain(..=n).collect());
        }

        let mut fds = Vec::new();

        if transport.recv(buf, &mut fds).await? == 0 {
            return Err(Error::new(ErrorKind::Disconnected));
        }
    }
}
