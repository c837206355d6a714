use std::fmt;
use std::io::{self, Read, Write};
use std::net::{self, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use mio::tcp::TcpStream as MioTcpStream;
use mio::Token;

use crate::error::NsqError;
use crate::frame::{self, Frame, FrameReader};

/// Hook invoked right after a TCP session is (re-)established, the same
/// place on every connect and reconnect. The only thing this client ever
/// needs to do there is emit the protocol MAGIC.
pub type OnConnect = fn(&mut Connection) -> Result<(), NsqError>;

pub fn send_magic(conn: &mut Connection) -> Result<(), NsqError> {
    conn.write(frame::MAGIC)
}

enum Socket {
    Blocking(net::TcpStream),
    NonBlocking(MioTcpStream),
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Socket::Blocking(s) => s.read(buf),
            Socket::NonBlocking(s) => s.read(buf),
        }
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Socket::Blocking(s) => s.write(buf),
            Socket::NonBlocking(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Socket::Blocking(s) => s.flush(),
            Socket::NonBlocking(s) => s.flush(),
        }
    }
}

/// One TCP connection to one broker node.
///
/// Blocking connections (backed by `std::net::TcpStream`) are used by the
/// publisher, request/response style. Non-blocking connections (backed by
/// `mio::tcp::TcpStream`) are used by the subscriber, multiplexed by the
/// event loop. Both share the same [`FrameReader`], so a connection
/// mid-frame when it is reconnected simply starts a fresh reader.
pub struct Connection {
    address: String,
    socket: Socket,
    connect_timeout: Duration,
    read_write_timeout: Duration,
    read_wait_timeout: Duration,
    on_connect: OnConnect,
    reader: FrameReader,
    token: Option<Token>,
}

impl Connection {
    pub fn connect_blocking(
        address: &str,
        connect_timeout: Duration,
        read_write_timeout: Duration,
        read_wait_timeout: Duration,
        on_connect: OnConnect,
    ) -> Result<Connection, NsqError> {
        let socket = open_blocking(address, connect_timeout, read_write_timeout)?;
        let mut conn = Connection {
            address: address.to_owned(),
            socket: Socket::Blocking(socket),
            connect_timeout,
            read_write_timeout,
            read_wait_timeout,
            on_connect,
            reader: FrameReader::new(),
            token: None,
        };

        on_connect(&mut conn)?;
        Ok(conn)
    }

    pub fn connect_nonblocking(
        address: &str,
        connect_timeout: Duration,
        read_write_timeout: Duration,
        read_wait_timeout: Duration,
        on_connect: OnConnect,
    ) -> Result<Connection, NsqError> {
        let socket = open_nonblocking(address, connect_timeout)?;
        let mut conn = Connection {
            address: address.to_owned(),
            socket: Socket::NonBlocking(socket),
            connect_timeout,
            read_write_timeout,
            read_wait_timeout,
            on_connect,
            reader: FrameReader::new(),
            token: None,
        };

        on_connect(&mut conn)?;
        Ok(conn)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn token(&self) -> Option<Token> {
        self.token
    }

    pub fn set_token(&mut self, token: Token) {
        self.token = Some(token);
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self.socket, Socket::Blocking(_))
    }

    /// The handle the event loop registers for read readiness. Only
    /// meaningful for non-blocking connections.
    pub fn mio_stream(&self) -> Result<&MioTcpStream, NsqError> {
        match &self.socket {
            Socket::NonBlocking(s) => Ok(s),
            Socket::Blocking(_) => Err(NsqError::configuration(
                "a blocking connection cannot be registered with the event loop",
            )),
        }
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), NsqError> {
        if let Socket::Blocking(s) = &self.socket {
            let _ = s.set_write_timeout(Some(self.read_write_timeout));
        }

        self.socket.write_all(bytes).map_err(|e| self.socket_error(e))
    }

    /// Reads the next complete frame. Blocking connections never return
    /// `Ok(None)`: they block (up to `read_wait_timeout`) until a full
    /// frame has arrived. Non-blocking connections return `Ok(None)` when
    /// the socket currently has nothing more to offer.
    pub fn read_frame(&mut self) -> Result<Option<Frame>, NsqError> {
        if let Socket::Blocking(s) = &self.socket {
            let _ = s.set_read_timeout(Some(self.read_wait_timeout));
        }

        self.reader
            .read_from(&mut self.socket)
            .map_err(|e| self.socket_error(e))
    }

    /// Tears down and re-establishes the TCP session, replacing the socket
    /// in place, and re-sends MAGIC via the configured on-connect hook —
    /// exactly as on first connect.
    pub fn reconnect(&mut self) -> Result<(), NsqError> {
        let on_connect = self.on_connect;

        match &self.socket {
            Socket::Blocking(_) => {
                self.socket = Socket::Blocking(open_blocking(
                    &self.address,
                    self.connect_timeout,
                    self.read_write_timeout,
                )?);
            }
            Socket::NonBlocking(_) => {
                self.socket = Socket::NonBlocking(open_nonblocking(&self.address, self.connect_timeout)?);
            }
        }

        self.reader = FrameReader::new();
        on_connect(self)
    }

    fn socket_error(&self, err: io::Error) -> NsqError {
        NsqError::socket(self.address.clone(), err.to_string())
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

fn resolve(address: &str) -> Result<SocketAddr, NsqError> {
    address
        .to_socket_addrs()
        .map_err(|e| NsqError::socket(address, e.to_string()))?
        .next()
        .ok_or_else(|| NsqError::socket(address, "address did not resolve to anything"))
}

fn open_blocking(address: &str, connect_timeout: Duration, read_write_timeout: Duration) -> Result<net::TcpStream, NsqError> {
    let addr = resolve(address)?;
    let stream = net::TcpStream::connect_timeout(&addr, connect_timeout)
        .map_err(|e| NsqError::socket(address, e.to_string()))?;
    stream
        .set_write_timeout(Some(read_write_timeout))
        .map_err(|e| NsqError::socket(address, e.to_string()))?;
    stream.set_nodelay(true).ok();
    Ok(stream)
}

fn open_nonblocking(address: &str, connect_timeout: Duration) -> Result<MioTcpStream, NsqError> {
    let addr = resolve(address)?;
    let std_stream = net::TcpStream::connect_timeout(&addr, connect_timeout)
        .map_err(|e| NsqError::socket(address, e.to_string()))?;
    std_stream.set_nodelay(true).ok();
    MioTcpStream::from_stream(std_stream).map_err(|e| NsqError::socket(address, e.to_string()))
}

/// Normalises a single `host` or `host:port` entry, defaulting the port to
/// NSQ's usual 4150 when omitted.
pub fn canonical_address(raw: &str) -> String {
    if raw.contains(':') {
        raw.to_owned()
    } else {
        format!("{}:4150", raw)
    }
}
