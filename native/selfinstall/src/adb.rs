//! Narrow view of the ADB transport the installer is built on.
//!
//! The wire protocol stays opaque: a connection can discover and connect to
//! the local daemon, run the pairing handshake and open named command
//! streams. Everything else is the session layer's business.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::identity::Identity;

pub mod cli;
pub mod discovery;
#[cfg(test)]
pub(crate) mod mock;

/// Pairing always targets the daemon on this very device
pub const LOCALHOST: &str = "127.0.0.1";

/// Trivial command used to prove the session is authorized
pub const ECHO_SERVICE: &str = "shell:echo test";
/// What [`ECHO_SERVICE`] prints back
pub const ECHO_TOKEN: &str = "test";

/// Streamed install service; the daemon expects exactly `size` bytes of package data
pub fn install_service(size: u64) -> String {
    format!("exec:cmd package install -S {size}")
}

/// Bidirectional byte stream bound to one remote command
pub trait AdbStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AdbStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// An authenticated connection to the local ADB daemon
#[async_trait]
pub trait AdbConnection: Send + Sync {
    /// Discovers the daemon and connects to it within `timeout`.
    /// Returns `false` when nothing could be reached in time.
    async fn auto_connect(&self, timeout: Duration) -> Result<bool>;

    /// Runs the pairing handshake against `host:port` with the given code
    async fn pair(&self, host: &str, port: u16, code: &str) -> Result<()>;

    /// Opens a stream for `service` (e.g. `shell:...` or `exec:...`)
    async fn open_stream(&self, service: &str) -> Result<Box<dyn AdbStream>>;

    /// Tears the connection down. Connecting again afterwards is allowed.
    async fn close(&self) -> Result<()>;
}

/// Creates connections authenticated with a given identity
pub trait AdbConnector: Send + Sync {
    fn new_connection(&self, identity: Arc<Identity>) -> Result<Arc<dyn AdbConnection>>;
}
