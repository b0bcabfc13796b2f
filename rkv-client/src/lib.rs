//! # rkv Retrying Client
//!
//! Purpose: Provide a synchronous Redis-compatible connection that survives
//! dropped sockets and servers still loading their dataset, without the
//! caller noticing anything but latency.
//!
//! ## Design Principles
//! 1. **Same Contract**: `RetryableConn` and `RespConn` both implement `Conn`.
//! 2. **Structured Retry Policy**: Errors are classified by kind, not text.
//! 3. **Retry-Safe Commands**: `cmd` / `flat_cmd` rebuild their protocol
//!    command for every attempt so no half-read reply leaks into a retry.
//! 4. **Protocol Clarity**: Encode/parse RESP2 explicitly for correctness.

mod action;
mod conn;
mod error;
mod resp;
mod retry;
mod retry_cmd;

pub use action::{Action, Cmd, Conn, Marshal, Unmarshal};
pub use conn::{DialOpt, Dialer, RespConn, TcpDialer};
pub use error::{ClientError, ClientResult, ErrorClass, ServerError};
pub use resp::{FlatArg, FromResp, RespValue};
pub use retry::{
    conn_func, dial, DialConfig, ReconnectHook, RetryHook, RetryableConn,
    DEFAULT_LOADING_RETRY_DELAY, DEFAULT_RECONNECT_DELAY,
};
pub use retry_cmd::{
    cmd, flat_cmd, CmdShape, Deferred, FlatArgs, PlainArgs, RetryableCmd, RetryableFlatCmd,
};
