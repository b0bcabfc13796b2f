//! # Retrying Client Demo
//!
//! Increments `test` forever through a retrying connection. Restart or
//! `DEBUG RELOAD` the server while it runs to watch reconnects and loading
//! retries in the log.
//!
//! Configuration is read from the JSON file named by `RKV_DEMO_CONFIG`:
//!
//! ```text
//! {"addr": "127.0.0.1:6379", "dial_opts": [{"select_db": 1}], "fill": true}
//! ```

use std::env;
use std::fs;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use rkv_client::{cmd, dial, flat_cmd, Conn, DialConfig, DialOpt, RetryableConn};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

const CONFIG_ENV: &str = "RKV_DEMO_CONFIG";

/// Number of hash fields written by the fill step.
const FILL_COUNT: usize = 100_000;

#[derive(Debug, Deserialize)]
#[serde(default)]
struct DemoConfig {
    network: String,
    addr: String,
    dial_opts: Vec<DialOpt>,
    interval_ms: u64,
    /// Writes `testing_h` before looping.
    fill: bool,
}

impl Default for DemoConfig {
    fn default() -> Self {
        DemoConfig {
            network: "tcp".to_string(),
            addr: "127.0.0.1:6379".to_string(),
            dial_opts: Vec::new(),
            interval_ms: 100,
            fill: false,
        }
    }
}

fn load_config() -> Result<DemoConfig> {
    let path = match env::var(CONFIG_ENV) {
        Ok(path) => path,
        Err(_) => return Ok(DemoConfig::default()),
    };
    let raw = fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))
}

fn fill(conn: &mut RetryableConn) -> Result<()> {
    for i in 0..FILL_COUNT {
        let mut hset = flat_cmd::<()>("HSET", "testing_h", vec![i.into(), "wew".into()]);
        conn.do_action(&mut hset).context("filling testing_h")?;
    }
    tracing::info!(fields = FILL_COUNT, "filled testing_h");
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config()?;
    let dial_config = DialConfig::new(&config.network, &config.addr)
        .dial_opts(config.dial_opts.iter().cloned())
        .on_retry(|err| tracing::info!(error = %err, "retry triggered"))
        .on_reconnect(|cause| match cause {
            Some(err) => tracing::info!(error = %err, "reconnect triggered"),
            None => tracing::info!("connecting"),
        });

    let mut conn = dial(dial_config).with_context(|| format!("dialing {}", config.addr))?;
    tracing::info!(config = ?conn.config(), "dialed");

    if config.fill {
        fill(&mut conn)?;
    }

    let interval = Duration::from_millis(config.interval_ms);
    loop {
        let mut incr = cmd::<i64, _, _>("INCR", ["test"]);
        match conn.do_action(&mut incr) {
            Ok(()) => tracing::info!(r = ?incr.reply(), "incremented"),
            Err(err) => tracing::error!(error = %err, "INCR failed"),
        }
        thread::sleep(interval);
    }
}
