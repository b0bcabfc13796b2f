//! # Plain Connection
//!
//! Purpose: Own a single TCP connection to the server and speak RESP2 over
//! it, with no retry of any kind.
//!
//! ## Design Principles
//! 1. **Cache-Friendly Buffers**: The connection reuses its write buffer and
//!    a buffered reader across calls.
//! 2. **Verbatim Options**: Dial options are applied in the order given.
//! 3. **Pluggable Dialing**: `Dialer` is the seam the retrying connection uses
//!    to obtain fresh connections.

use std::io::{self, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::action::{Action, Cmd, Conn, Marshal, Unmarshal};
use crate::error::{ClientError, ClientResult};

/// Low-level dial option, forwarded verbatim to the dialer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialOpt {
    /// Timeout for establishing the TCP connection.
    ConnectTimeout(Duration),
    /// TCP read timeout.
    ReadTimeout(Duration),
    /// TCP write timeout.
    WriteTimeout(Duration),
    /// Overrides the default of disabling Nagle.
    NoDelay(bool),
    /// Database selected right after connecting.
    SelectDb(u32),
}

/// Produces fresh connections.
pub trait Dialer: Send + Sync {
    fn dial(&self, network: &str, addr: &str, opts: &[DialOpt]) -> ClientResult<Box<dyn Conn>>;
}

/// Dials plain TCP connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    fn dial(&self, network: &str, addr: &str, opts: &[DialOpt]) -> ClientResult<Box<dyn Conn>> {
        Ok(Box::new(RespConn::connect(network, addr, opts)?))
    }
}

/// Single TCP connection with reusable buffers.
pub struct RespConn {
    // None once closed.
    reader: Option<BufReader<TcpStream>>,
    write_buf: Vec<u8>,
}

impl RespConn {
    /// Connects to `addr` over `network` (`tcp`, `tcp4` or `tcp6`).
    pub fn connect(network: &str, addr: &str, opts: &[DialOpt]) -> ClientResult<Self> {
        let stream = connect_stream(network, addr, opts)?;
        // Disable Nagle to keep request latency low for small payloads.
        stream.set_nodelay(true)?;

        let mut select_db = None;
        for opt in opts {
            match opt {
                DialOpt::ConnectTimeout(_) => {}
                DialOpt::ReadTimeout(timeout) => stream.set_read_timeout(Some(*timeout))?,
                DialOpt::WriteTimeout(timeout) => stream.set_write_timeout(Some(*timeout))?,
                DialOpt::NoDelay(enabled) => stream.set_nodelay(*enabled)?,
                DialOpt::SelectDb(db) => select_db = Some(*db),
            }
        }

        let mut conn = RespConn {
            reader: Some(BufReader::new(stream)),
            write_buf: Vec::with_capacity(256),
        };
        if let Some(db) = select_db {
            let mut select = Cmd::<()>::new("SELECT", [db.to_string()]);
            conn.do_action(&mut select)?;
        }
        tracing::debug!(network, addr, "connected");
        Ok(conn)
    }

    fn reader(&mut self) -> ClientResult<&mut BufReader<TcpStream>> {
        self.reader.as_mut().ok_or(ClientError::Closed)
    }
}

impl Conn for RespConn {
    fn do_action(&mut self, action: &mut dyn Action) -> ClientResult<()> {
        action.run(self)
    }

    fn encode(&mut self, m: &mut dyn Marshal) -> ClientResult<()> {
        self.write_buf.clear();
        m.marshal_resp(&mut self.write_buf)?;

        let stream = self
            .reader
            .as_mut()
            .ok_or(ClientError::Closed)?
            .get_mut();
        stream.write_all(&self.write_buf)?;
        stream.flush()?;
        Ok(())
    }

    fn decode(&mut self, um: &mut dyn Unmarshal) -> ClientResult<()> {
        let reader = self.reader()?;
        um.unmarshal_resp(reader)
    }

    fn close(&mut self) -> ClientResult<()> {
        let reader = self.reader.take().ok_or(ClientError::Closed)?;
        match reader.get_ref().shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // Peer already went away; the socket is closed either way.
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn net_conn(&self) -> Option<&TcpStream> {
        self.reader.as_ref().map(BufReader::get_ref)
    }
}

fn any_family(_addr: &SocketAddr) -> bool {
    true
}

fn connect_stream(network: &str, addr: &str, opts: &[DialOpt]) -> ClientResult<TcpStream> {
    let in_family: fn(&SocketAddr) -> bool = match network {
        "tcp" => any_family,
        "tcp4" => SocketAddr::is_ipv4,
        "tcp6" => SocketAddr::is_ipv6,
        other => return Err(ClientError::UnsupportedNetwork(other.to_string())),
    };

    let resolved = addr.to_socket_addrs().map_err(|err| match err.kind() {
        // Missing or malformed port.
        io::ErrorKind::InvalidInput => ClientError::InvalidAddress(addr.to_string()),
        _ => ClientError::Io(err),
    })?;
    let candidates: Vec<SocketAddr> = resolved.filter(|candidate| in_family(candidate)).collect();
    if candidates.is_empty() {
        return Err(ClientError::InvalidAddress(addr.to_string()));
    }

    let connect_timeout = opts.iter().rev().find_map(|opt| match opt {
        DialOpt::ConnectTimeout(timeout) => Some(*timeout),
        _ => None,
    });
    let mut last_err = None;
    for candidate in candidates {
        let attempt = match connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&candidate, timeout),
            None => TcpStream::connect(candidate),
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                tracing::debug!(%candidate, error = %err, "connect attempt failed");
                last_err = Some(err);
            }
        }
    }
    Err(last_err.map_or_else(|| ClientError::InvalidAddress(addr.to_string()), ClientError::Io))
}
