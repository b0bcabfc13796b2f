//! # Retrying Connection
//!
//! Purpose: Wrap one connection so that dropped sockets and servers that are
//! still loading their dataset are invisible to the caller.
//!
//! ## Design Principles
//! 1. **Decorator Pattern**: `RetryableConn` implements `Conn` itself, so it
//!    drops in wherever a plain connection is expected.
//! 2. **Exclusive Ownership**: The inner connection is owned and only swapped
//!    through `&mut self`; one caller drives the state machine at a time.
//! 3. **Local Recovery**: Retry decisions are made inside `do_action`; only
//!    terminal errors cross that boundary.
//!
//! ## Retry Policy
//!
//! ```text
//! do_action ──► inner.do_action
//!                 ├─ Ok                 → return
//!                 ├─ Network error      → reconnect_loop, retry
//!                 ├─ LOADING reply      → on_retry, sleep, retry (same socket)
//!                 └─ anything else      → return error
//! ```
//!
//! Neither loop has an attempt cap or a deadline.

use std::fmt;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::action::{Action, Conn, Marshal, Unmarshal};
use crate::conn::{DialOpt, Dialer, TcpDialer};
use crate::error::{ClientError, ClientResult, ErrorClass};

/// Delay between failed reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Delay before re-sending an action the server rejected with `LOADING`.
pub const DEFAULT_LOADING_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Observes every reconnect attempt with its cause (`None` on first dial).
pub type ReconnectHook = Arc<dyn Fn(Option<&ClientError>) + Send + Sync>;

/// Observes every loading retry before it sleeps.
pub type RetryHook = Arc<dyn Fn(&ClientError) + Send + Sync>;

/// Configuration for a retrying connection.
#[derive(Clone)]
pub struct DialConfig {
    /// Network family, e.g. "tcp".
    pub network: String,
    /// Server address, e.g. "127.0.0.1:6379".
    pub addr: String,
    pub on_reconnect: Option<ReconnectHook>,
    pub on_retry: Option<RetryHook>,
    /// Passed to the dialer unchanged on every connect.
    pub dial_opts: Vec<DialOpt>,
    pub dialer: Arc<dyn Dialer>,
    pub reconnect_delay: Duration,
    pub loading_retry_delay: Duration,
}

impl Default for DialConfig {
    fn default() -> Self {
        DialConfig {
            network: "tcp".to_string(),
            addr: "127.0.0.1:6379".to_string(),
            on_reconnect: None,
            on_retry: None,
            dial_opts: Vec::new(),
            dialer: Arc::new(TcpDialer),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            loading_retry_delay: DEFAULT_LOADING_RETRY_DELAY,
        }
    }
}

impl DialConfig {
    pub fn new(network: impl Into<String>, addr: impl Into<String>) -> Self {
        DialConfig {
            network: network.into(),
            addr: addr.into(),
            ..DialConfig::default()
        }
    }

    pub fn on_reconnect(
        mut self,
        hook: impl Fn(Option<&ClientError>) + Send + Sync + 'static,
    ) -> Self {
        let hook: ReconnectHook = Arc::new(hook);
        self.on_reconnect = Some(hook);
        self
    }

    pub fn on_retry(mut self, hook: impl Fn(&ClientError) + Send + Sync + 'static) -> Self {
        let hook: RetryHook = Arc::new(hook);
        self.on_retry = Some(hook);
        self
    }

    pub fn dial_opts(mut self, opts: impl IntoIterator<Item = DialOpt>) -> Self {
        self.dial_opts.extend(opts);
        self
    }

    pub fn dialer(mut self, dialer: impl Dialer + 'static) -> Self {
        self.dialer = Arc::new(dialer);
        self
    }
}

impl fmt::Debug for DialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialConfig")
            .field("network", &self.network)
            .field("addr", &self.addr)
            .field("on_reconnect", &self.on_reconnect.is_some())
            .field("on_retry", &self.on_retry.is_some())
            .field("dial_opts", &self.dial_opts)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("loading_retry_delay", &self.loading_retry_delay)
            .finish()
    }
}

/// Connection that reconnects on network errors and retries on `LOADING`.
pub struct RetryableConn {
    inner: Option<Box<dyn Conn>>,
    conf: DialConfig,
}

/// Dials `conf.addr` once. Fails without retrying if the server is
/// unreachable; recovery only kicks in after the first successful connect.
pub fn dial(conf: DialConfig) -> ClientResult<RetryableConn> {
    let mut rc = RetryableConn { inner: None, conf };
    rc.reconnect(None)?;
    Ok(rc)
}

/// Returns a constructor that dials retrying connections with the given
/// callbacks and default options.
pub fn conn_func(
    on_reconnect: Option<ReconnectHook>,
    on_retry: Option<RetryHook>,
) -> impl Fn(&str, &str) -> ClientResult<RetryableConn> {
    move |network: &str, addr: &str| {
        dial(DialConfig {
            on_reconnect: on_reconnect.clone(),
            on_retry: on_retry.clone(),
            ..DialConfig::new(network, addr)
        })
    }
}

impl RetryableConn {
    pub fn config(&self) -> &DialConfig {
        &self.conf
    }

    /// Replaces the inner connection with a freshly dialed one.
    ///
    /// The old connection is closed first. On failure the wrapper is left
    /// without an inner connection and the dial error is returned.
    pub fn reconnect(&mut self, cause: Option<&ClientError>) -> ClientResult<()> {
        if let Some(mut old) = self.inner.take() {
            let _ = old.close();
        }

        if let Some(hook) = &self.conf.on_reconnect {
            hook(cause);
        }

        let conf = &self.conf;
        match conf.dialer.dial(&conf.network, &conf.addr, &conf.dial_opts) {
            Ok(conn) => {
                self.inner = Some(conn);
                Ok(())
            }
            Err(err) => {
                tracing::debug!(addr = %conf.addr, error = %err, "dial failed");
                Err(err)
            }
        }
    }

    /// Reconnects until a dial succeeds, sleeping `reconnect_delay` between
    /// attempts. Never gives up.
    pub fn reconnect_loop(&mut self, cause: ClientError) {
        let mut cause = cause;
        loop {
            match self.reconnect(Some(&cause)) {
                Ok(()) => {
                    tracing::info!(addr = %self.conf.addr, "reconnected");
                    return;
                }
                Err(err) => {
                    tracing::warn!(
                        addr = %self.conf.addr,
                        error = %err,
                        "reconnect failed, retrying in {:?}",
                        self.conf.reconnect_delay
                    );
                    cause = err;
                    thread::sleep(self.conf.reconnect_delay);
                }
            }
        }
    }
}

impl Conn for RetryableConn {
    fn do_action(&mut self, action: &mut dyn Action) -> ClientResult<()> {
        loop {
            let err = match self.inner.as_mut() {
                Some(inner) => match inner.do_action(action) {
                    Ok(()) => return Ok(()),
                    Err(err) => err,
                },
                None => ClientError::NotConnected,
            };

            match err.class() {
                ErrorClass::Network => {
                    tracing::warn!(error = %err, "connection lost, reconnecting");
                    self.reconnect_loop(err);
                }
                ErrorClass::Loading => {
                    tracing::debug!(error = %err, "server loading, retrying");
                    if let Some(hook) = &self.conf.on_retry {
                        hook(&err);
                    }
                    thread::sleep(self.conf.loading_retry_delay);
                }
                ErrorClass::Terminal => {
                    tracing::debug!(error = %err, "terminal error");
                    return Err(err);
                }
            }
        }
    }

    fn encode(&mut self, m: &mut dyn Marshal) -> ClientResult<()> {
        self.inner.as_mut().ok_or(ClientError::NotConnected)?.encode(m)
    }

    fn decode(&mut self, um: &mut dyn Unmarshal) -> ClientResult<()> {
        self.inner.as_mut().ok_or(ClientError::NotConnected)?.decode(um)
    }

    /// Closes the inner connection. Later calls report whatever the closed
    /// connection reports.
    fn close(&mut self) -> ClientResult<()> {
        self.inner.as_mut().ok_or(ClientError::NotConnected)?.close()
    }

    fn net_conn(&self) -> Option<&TcpStream> {
        self.inner.as_ref().and_then(|inner| inner.net_conn())
    }
}
