//! # Deferred Commands
//!
//! Purpose: Commands that can be sent any number of times by a retrying
//! connection without carrying decoder state from one attempt to the next.
//!
//! ## Design Principles
//! 1. **Late Binding**: The protocol `Cmd` is built from the captured command
//!    shape when it is first needed.
//! 2. **Single-Use Binding**: The bound `Cmd` is dropped after every decode
//!    attempt, successful or not, so the next attempt starts from scratch.
//! 3. **Owned Receiver**: The decoded reply outlives the binding and is read
//!    back through `reply` / `take_reply`.

use std::io::{BufRead, Write};

use crate::action::{Action, Cmd, Conn, Marshal, Unmarshal};
use crate::error::ClientResult;
use crate::resp::{FlatArg, FromResp};

/// Captured command shape a `Cmd` can be rebuilt from.
pub trait CmdShape {
    fn bind<R: FromResp>(&self) -> Cmd<R>;
}

/// Command name plus string arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainArgs {
    cmd: String,
    args: Vec<String>,
}

impl CmdShape for PlainArgs {
    fn bind<R: FromResp>(&self) -> Cmd<R> {
        Cmd::new(&self.cmd, self.args.iter().cloned())
    }
}

/// Command name, key and mixed-type arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatArgs {
    cmd: String,
    key: String,
    args: Vec<FlatArg>,
}

impl CmdShape for FlatArgs {
    fn bind<R: FromResp>(&self) -> Cmd<R> {
        Cmd::flat(&self.cmd, &self.key, &self.args)
    }
}

/// A command that rebinds its protocol `Cmd` for every attempt.
pub struct Deferred<S, R> {
    shape: S,
    reply: Option<R>,
    inner: Option<Cmd<R>>,
}

/// Deferred plain command, see [`cmd`].
pub type RetryableCmd<R> = Deferred<PlainArgs, R>;

/// Deferred flat command, see [`flat_cmd`].
pub type RetryableFlatCmd<R> = Deferred<FlatArgs, R>;

/// Builds a retry-safe command from string arguments.
///
/// ```no_run
/// use rkv_client::{cmd, dial, Conn, DialConfig};
///
/// let mut conn = dial(DialConfig::new("tcp", "127.0.0.1:6379"))?;
/// let mut incr = cmd::<i64, _, _>("INCR", ["test"]);
/// conn.do_action(&mut incr)?;
/// println!("test = {:?}", incr.reply());
/// # Ok::<(), rkv_client::ClientError>(())
/// ```
pub fn cmd<R, I, S>(name: &str, args: I) -> RetryableCmd<R>
where
    R: FromResp,
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Deferred::new(PlainArgs {
        cmd: name.to_string(),
        args: args.into_iter().map(Into::into).collect(),
    })
}

/// Builds a retry-safe command of the form `name key args...`, flattening
/// lists and maps in `args`.
pub fn flat_cmd<R: FromResp>(name: &str, key: &str, args: Vec<FlatArg>) -> RetryableFlatCmd<R> {
    Deferred::new(FlatArgs {
        cmd: name.to_string(),
        key: key.to_string(),
        args,
    })
}

impl<S: CmdShape, R: FromResp> Deferred<S, R> {
    fn new(shape: S) -> Self {
        // Bind once up front so the first attempt does not pay for it.
        let inner = shape.bind();
        Deferred {
            shape,
            reply: None,
            inner: Some(inner),
        }
    }

    fn bound(&mut self) -> &mut Cmd<R> {
        let shape = &self.shape;
        self.inner.get_or_insert_with(|| shape.bind())
    }

    /// Reply of the last successful attempt.
    pub fn reply(&self) -> Option<&R> {
        self.reply.as_ref()
    }

    pub fn take_reply(&mut self) -> Option<R> {
        self.reply.take()
    }

    pub fn into_reply(self) -> Option<R> {
        self.reply
    }

    /// True while a protocol `Cmd` is bound.
    pub fn is_bound(&self) -> bool {
        self.inner.is_some()
    }
}

impl<S: CmdShape, R: FromResp> Action for Deferred<S, R> {
    fn keys(&mut self) -> Vec<String> {
        self.bound().keys()
    }

    fn run(&mut self, conn: &mut dyn Conn) -> ClientResult<()> {
        conn.encode(self)?;
        conn.decode(self)
    }
}

impl<S: CmdShape, R: FromResp> Marshal for Deferred<S, R> {
    fn marshal_resp(&mut self, w: &mut dyn Write) -> ClientResult<()> {
        self.bound().marshal_resp(w)
    }
}

impl<S: CmdShape, R: FromResp> Unmarshal for Deferred<S, R> {
    fn unmarshal_resp(&mut self, r: &mut dyn BufRead) -> ClientResult<()> {
        let mut inner = match self.inner.take() {
            Some(inner) => inner,
            None => self.shape.bind(),
        };
        let result = inner.unmarshal_resp(r);
        if result.is_ok() {
            self.reply = inner.take_reply();
        }
        // `inner` is dropped here: a decoded Cmd is never sent again.
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::net::TcpStream;

    /// In-memory connection: records each request, answers from a queue.
    #[derive(Default)]
    struct MemConn {
        requests: Vec<Vec<u8>>,
        replies: VecDeque<Vec<u8>>,
    }

    impl MemConn {
        fn with_replies(replies: &[&[u8]]) -> Self {
            MemConn {
                requests: Vec::new(),
                replies: replies.iter().map(|r| r.to_vec()).collect(),
            }
        }
    }

    impl Conn for MemConn {
        fn do_action(&mut self, action: &mut dyn Action) -> ClientResult<()> {
            action.run(self)
        }

        fn encode(&mut self, m: &mut dyn Marshal) -> ClientResult<()> {
            let mut buf = Vec::new();
            m.marshal_resp(&mut buf)?;
            self.requests.push(buf);
            Ok(())
        }

        fn decode(&mut self, um: &mut dyn Unmarshal) -> ClientResult<()> {
            let reply = self.replies.pop_front().unwrap_or_default();
            um.unmarshal_resp(&mut Cursor::new(reply))
        }

        fn close(&mut self) -> ClientResult<()> {
            Ok(())
        }

        fn net_conn(&self) -> Option<&TcpStream> {
            None
        }
    }

    #[test]
    fn binding_is_dropped_after_each_decode() {
        let mut conn = MemConn::with_replies(&[b":1\r\n", b"-ERR nope\r\n"]);
        let mut incr = cmd::<i64, _, _>("INCR", ["test"]);
        assert!(incr.is_bound());

        incr.run(&mut conn).unwrap();
        assert!(!incr.is_bound());
        assert_eq!(incr.reply(), Some(&1));

        assert!(matches!(incr.run(&mut conn), Err(ClientError::Server(_))));
        assert!(!incr.is_bound());
        // The failed attempt leaves the previous reply untouched.
        assert_eq!(incr.reply(), Some(&1));
    }

    #[test]
    fn rebinding_sends_identical_request() {
        let mut conn = MemConn::with_replies(&[b":1\r\n", b":2\r\n"]);
        let mut hset = flat_cmd::<i64>("HSET", "testing_h", vec![5.into(), "wew".into()]);
        hset.run(&mut conn).unwrap();
        hset.run(&mut conn).unwrap();

        assert_eq!(conn.requests.len(), 2);
        assert_eq!(conn.requests[0], conn.requests[1]);
        assert_eq!(
            conn.requests[0],
            b"*4\r\n$4\r\nHSET\r\n$9\r\ntesting_h\r\n$1\r\n5\r\n$3\r\nwew\r\n".to_vec()
        );
        assert_eq!(hset.take_reply(), Some(2));
    }

    #[test]
    fn survives_partial_reply_where_plain_cmd_goes_stale() {
        let partial: &[u8] = b"$10\r\nabc";

        let mut plain = Cmd::<Vec<u8>>::new("GET", ["k"]);
        let mut conn = MemConn::with_replies(&[partial, b"$1\r\na\r\n"]);
        assert!(matches!(plain.run(&mut conn), Err(ClientError::Io(_))));
        assert!(matches!(plain.run(&mut conn), Err(ClientError::StaleAction)));

        let mut deferred = cmd::<Vec<u8>, _, _>("GET", ["k"]);
        let mut conn = MemConn::with_replies(&[partial, b"$1\r\na\r\n"]);
        assert!(matches!(deferred.run(&mut conn), Err(ClientError::Io(_))));
        deferred.run(&mut conn).unwrap();
        assert_eq!(deferred.into_reply(), Some(b"a".to_vec()));
    }

    #[test]
    fn keys_rebind_when_needed() {
        let mut conn = MemConn::with_replies(&[b"+OK\r\n"]);
        let mut set = cmd::<(), _, _>("SET", ["alpha", "v"]);
        set.run(&mut conn).unwrap();
        assert!(!set.is_bound());
        assert_eq!(set.keys(), vec!["alpha".to_string()]);
        assert!(set.is_bound());

        let mut hset = flat_cmd::<()>("HSET", "testing_h", vec![1.into(), "x".into()]);
        assert_eq!(hset.keys(), vec!["testing_h".to_string()]);
    }

    #[test]
    fn encode_failure_skips_decode() {
        struct BrokenWriter;
        impl Conn for BrokenWriter {
            fn do_action(&mut self, action: &mut dyn Action) -> ClientResult<()> {
                action.run(self)
            }
            fn encode(&mut self, _m: &mut dyn Marshal) -> ClientResult<()> {
                Err(ClientError::Closed)
            }
            fn decode(&mut self, _um: &mut dyn Unmarshal) -> ClientResult<()> {
                panic!("decode must not run after a failed encode");
            }
            fn close(&mut self) -> ClientResult<()> {
                Ok(())
            }
            fn net_conn(&self) -> Option<&TcpStream> {
                None
            }
        }

        let mut incr = cmd::<i64, _, _>("INCR", ["test"]);
        assert!(matches!(incr.run(&mut BrokenWriter), Err(ClientError::Closed)));
        // Nothing was decoded, so the binding is kept.
        assert!(incr.is_bound());
    }
}
