//! # Connection and Action Contracts
//!
//! Purpose: Define the capability traits every connection and command
//! implements, plus the protocol-level command object `Cmd`.
//!
//! ## Design Principles
//! 1. **Strategy Pattern**: `Conn` hides whether the caller talks to a plain
//!    socket or a retrying wrapper.
//! 2. **Two-Phase Actions**: A command is first a `Marshal` (request bytes),
//!    then an `Unmarshal` (reply target) on the same connection.
//! 3. **Single-Use Decoding**: A `Cmd` whose decode failed mid-frame refuses
//!    to be sent again instead of reading someone else's reply.
//!
//! ## Usage Notes
//!
//! - `Cmd` is enough for one-shot calls. Retried calls should use the
//!   deferred wrappers in `retry_cmd`, which rebuild a fresh `Cmd` per attempt.

use std::io::{BufRead, Write};
use std::net::TcpStream;

use crate::error::{ClientError, ClientResult, ServerError};
use crate::resp::{encode_command, read_response, FlatArg, FromResp, RespValue};

/// Writes the RESP request of an action.
pub trait Marshal {
    fn marshal_resp(&mut self, w: &mut dyn Write) -> ClientResult<()>;
}

/// Reads one RESP reply into an action.
pub trait Unmarshal {
    fn unmarshal_resp(&mut self, r: &mut dyn BufRead) -> ClientResult<()>;
}

/// A unit of work: one request sent, one reply received.
pub trait Action {
    /// Keys the action touches.
    fn keys(&mut self) -> Vec<String>;

    /// Executes the action against `conn`.
    fn run(&mut self, conn: &mut dyn Conn) -> ClientResult<()>;
}

/// A live connection to the server.
pub trait Conn: Send {
    /// Runs an action on this connection.
    fn do_action(&mut self, action: &mut dyn Action) -> ClientResult<()>;

    /// Writes a request.
    fn encode(&mut self, m: &mut dyn Marshal) -> ClientResult<()>;

    /// Reads one reply.
    fn decode(&mut self, um: &mut dyn Unmarshal) -> ClientResult<()>;

    fn close(&mut self) -> ClientResult<()>;

    /// Underlying socket, as-is. Reading, writing or closing it directly
    /// corrupts the connection's framing.
    fn net_conn(&self) -> Option<&TcpStream>;
}

/// Commands whose first argument is not a key.
const KEYLESS_COMMANDS: &[&str] = &[
    "AUTH", "BGREWRITEAOF", "BGSAVE", "CLIENT", "CLUSTER", "COMMAND", "CONFIG", "DBSIZE",
    "DEBUG", "DISCARD", "ECHO", "EXEC", "FLUSHALL", "FLUSHDB", "INFO", "LASTSAVE", "MONITOR",
    "MULTI", "PING", "PSUBSCRIBE", "PUBLISH", "PUNSUBSCRIBE", "QUIT", "RANDOMKEY", "READONLY",
    "READWRITE", "ROLE", "SAVE", "SCAN", "SCRIPT", "SELECT", "SHUTDOWN", "SLAVEOF", "SLOWLOG",
    "SUBSCRIBE", "SYNC", "TIME", "UNSUBSCRIBE", "UNWATCH",
];

fn command_keys(cmd: &str, args: &[String]) -> Vec<String> {
    let upper = cmd.to_ascii_uppercase();
    if upper == "BITOP" && args.len() > 1 {
        return vec![args[1].clone()];
    }
    if args.is_empty() || KEYLESS_COMMANDS.contains(&upper.as_str()) {
        return Vec::new();
    }
    vec![args[0].clone()]
}

/// Protocol-level command decoding its reply into `R`.
pub struct Cmd<R> {
    /// Command name followed by its arguments.
    args: Vec<Vec<u8>>,
    keys: Vec<String>,
    encoded: Vec<u8>,
    line_buf: Vec<u8>,
    reply: Option<R>,
    stale: bool,
}

impl<R: FromResp> Cmd<R> {
    /// Builds a command from string arguments, e.g. `INCR test`.
    pub fn new<I, S>(cmd: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let keys = command_keys(cmd, &args);
        let mut wire = Vec::with_capacity(args.len() + 1);
        wire.push(cmd.as_bytes().to_vec());
        wire.extend(args.into_iter().map(String::into_bytes));
        Self::from_parts(wire, keys)
    }

    /// Builds a command whose first argument is `key`, followed by the
    /// flattened `args`, e.g. `HSET testing_h 5 wew`.
    pub fn flat(cmd: &str, key: &str, args: &[FlatArg]) -> Self {
        let mut wire = Vec::with_capacity(args.len() + 2);
        wire.push(cmd.as_bytes().to_vec());
        wire.push(key.as_bytes().to_vec());
        for arg in args {
            arg.flatten_into(&mut wire);
        }
        Self::from_parts(wire, vec![key.to_string()])
    }

    fn from_parts(args: Vec<Vec<u8>>, keys: Vec<String>) -> Self {
        Cmd {
            args,
            keys,
            encoded: Vec::new(),
            line_buf: Vec::new(),
            reply: None,
            stale: false,
        }
    }

    pub fn reply(&self) -> Option<&R> {
        self.reply.as_ref()
    }

    pub fn take_reply(&mut self) -> Option<R> {
        self.reply.take()
    }

    /// True once a decode failed part-way through a reply.
    pub fn is_stale(&self) -> bool {
        self.stale
    }
}

impl<R: FromResp> Action for Cmd<R> {
    fn keys(&mut self) -> Vec<String> {
        self.keys.clone()
    }

    fn run(&mut self, conn: &mut dyn Conn) -> ClientResult<()> {
        conn.encode(self)?;
        conn.decode(self)
    }
}

impl<R: FromResp> Marshal for Cmd<R> {
    fn marshal_resp(&mut self, w: &mut dyn Write) -> ClientResult<()> {
        if self.stale {
            return Err(ClientError::StaleAction);
        }
        if self.encoded.is_empty() {
            let args: Vec<&[u8]> = self.args.iter().map(Vec::as_slice).collect();
            encode_command(&args, &mut self.encoded);
        }
        w.write_all(&self.encoded)?;
        Ok(())
    }
}

impl<R: FromResp> Unmarshal for Cmd<R> {
    fn unmarshal_resp(&mut self, r: &mut dyn BufRead) -> ClientResult<()> {
        if self.stale {
            return Err(ClientError::StaleAction);
        }
        match read_response(r, &mut self.line_buf) {
            Ok(RespValue::Error(message)) => Err(ClientError::Server(ServerError::new(message))),
            Ok(value) => {
                self.reply = Some(R::from_resp(value)?);
                Ok(())
            }
            Err(err) => {
                // Part of a frame may already be consumed.
                self.stale = true;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn marshal<M: Marshal>(m: &mut M) -> Vec<u8> {
        let mut out = Vec::new();
        m.marshal_resp(&mut out).unwrap();
        out
    }

    #[test]
    fn encodes_plain_command() {
        let mut cmd = Cmd::<i64>::new("INCR", ["test"]);
        assert_eq!(marshal(&mut cmd), b"*2\r\n$4\r\nINCR\r\n$4\r\ntest\r\n");
    }

    #[test]
    fn encodes_flat_command() {
        let mut cmd = Cmd::<()>::flat("HSET", "testing_h", &[5.into(), "wew".into()]);
        assert_eq!(
            marshal(&mut cmd),
            b"*4\r\n$4\r\nHSET\r\n$9\r\ntesting_h\r\n$1\r\n5\r\n$3\r\nwew\r\n"
        );
        assert_eq!(cmd.keys(), vec!["testing_h".to_string()]);
    }

    #[test]
    fn keys_follow_command_shape() {
        assert_eq!(Cmd::<()>::new("GET", ["k"]).keys(), vec!["k".to_string()]);
        assert!(Cmd::<()>::new("PING", Vec::<String>::new()).keys().is_empty());
        assert!(Cmd::<()>::new("info", ["server"]).keys().is_empty());
        assert_eq!(
            Cmd::<()>::new("BITOP", ["AND", "dest", "a", "b"]).keys(),
            vec!["dest".to_string()]
        );
    }

    #[test]
    fn decodes_reply_into_receiver() {
        let mut cmd = Cmd::<i64>::new("INCR", ["test"]);
        let mut reader = Cursor::new(b":3\r\n".to_vec());
        cmd.unmarshal_resp(&mut reader).unwrap();
        assert_eq!(cmd.take_reply(), Some(3));
    }

    #[test]
    fn error_reply_does_not_stale_command() {
        let mut cmd = Cmd::<i64>::new("INCR", ["test"]);
        let mut reader = Cursor::new(b"-LOADING busy\r\n:1\r\n".to_vec());
        let err = cmd.unmarshal_resp(&mut reader).unwrap_err();
        assert!(matches!(err, ClientError::Server(_)));
        assert!(!cmd.is_stale());
        cmd.unmarshal_resp(&mut reader).unwrap();
        assert_eq!(cmd.reply(), Some(&1));
    }

    #[test]
    fn partial_read_stales_command() {
        let mut cmd = Cmd::<Vec<u8>>::new("GET", ["k"]);
        let mut reader = Cursor::new(b"$10\r\nabc".to_vec());
        assert!(matches!(cmd.unmarshal_resp(&mut reader), Err(ClientError::Io(_))));
        assert!(cmd.is_stale());

        let mut out = Vec::new();
        assert!(matches!(cmd.marshal_resp(&mut out), Err(ClientError::StaleAction)));
        let mut reader = Cursor::new(b"$1\r\na\r\n".to_vec());
        assert!(matches!(
            cmd.unmarshal_resp(&mut reader),
            Err(ClientError::StaleAction)
        ));
    }
}
