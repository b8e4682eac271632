//! Orchestrates every conversation with the device's own ADB daemon.
//!
//! One shared connection serves status probes, pairing and the authorization
//! test; installs always run over a connection of their own.

mod install;
mod pairing;
mod response;
mod status;

use std::{error::Error, sync::Arc, time::Duration};

use anyhow::Result;
use derive_more::Debug;
pub use install::{INSTALL_CHUNK_SIZE, INSTALL_SUCCESS_MESSAGE};
pub use pairing::{PairingInputError, PairingRequest};
use status::StatusCache;
use tokio::{
    io::AsyncWriteExt,
    sync::{Mutex, MutexGuard},
    time::Instant,
};
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    adb::{AdbConnection, AdbConnector, AdbStream, ECHO_SERVICE, ECHO_TOKEN, LOCALHOST},
    identity::{IdentityError, IdentityStore},
    models::{ConnectionStatus, Timeouts},
};

pub const CONNECT_FAILED_MESSAGE: &str =
    "Could not connect to ADB. Make sure wireless debugging is enabled.";
pub const NOT_AUTHORIZED_MESSAGE: &str = "Connection test failed. Did you authorize the prompt?";
pub const AUTHORIZATION_REQUIRED_MESSAGE: &str =
    "Authorization required. Check for 'Allow USB debugging?' prompt and tap 'Always allow'.";

/// Upper bound for releasing a stream or a connection
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    InvalidInput(#[from] PairingInputError),
    /// The daemon could not be reached at all
    #[error("{0}")]
    Transport(String),
    #[error("Pairing failed: {0:#}")]
    Pairing(anyhow::Error),
    #[error("{0}")]
    Unauthorized(String),
    /// The package manager answered with something other than success
    #[error("{0}")]
    InstallRejected(String),
    #[error("Installation failed: {0:#}")]
    Install(anyhow::Error),
}

/// Session with the local ADB daemon
#[derive(Debug)]
pub struct AdbSession {
    identity: Arc<IdentityStore>,
    #[debug(skip)]
    connector: Arc<dyn AdbConnector>,
    /// Held for the whole of a probe, a pairing or a test
    #[debug(skip)]
    shared: Mutex<Option<Arc<dyn AdbConnection>>>,
    status: StatusCache,
    timeouts: Timeouts,
}

impl AdbSession {
    pub fn new(
        identity: Arc<IdentityStore>,
        connector: Arc<dyn AdbConnector>,
        timeouts: Timeouts,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            connector,
            shared: Mutex::new(None),
            status: StatusCache::default(),
            timeouts,
        })
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Last known status without probing
    pub async fn cached_status(&self) -> ConnectionStatus {
        self.status.last().await
    }

    /// Current connection status.
    ///
    /// Answers from the cache while it is fresh unless `force` is set. While
    /// pairing or the authorization test holds the shared connection, the last
    /// known status is returned without probing. Probe failures never surface
    /// as errors, they report [`ConnectionStatus::NeedsPairing`].
    #[instrument(level = "debug", skip(self))]
    pub async fn connection_status(&self, force: bool) -> ConnectionStatus {
        if !force && let Some(status) = self.status.fresh(self.timeouts.status_cache()).await {
            trace!(%status, "Status served from cache");
            return status;
        }

        let Ok(mut shared) = self.shared.try_lock() else {
            let status = self.status.last().await;
            debug!(%status, "Shared connection busy, serving last known status");
            return status;
        };

        let started = Instant::now();
        let status = match self.probe(&mut shared).await {
            Ok(status) => status,
            Err(e) => {
                debug!(error = e.as_ref() as &dyn Error, "Status probe failed");
                ConnectionStatus::NeedsPairing
            }
        };
        self.status.store(started, status).await;
        debug!(%status, "Probed connection status");
        status
    }

    /// Reuses the shared connection. The connection stays open afterwards,
    /// closing it would get in the way of the daemon's discovery.
    async fn probe(
        &self,
        shared: &mut MutexGuard<'_, Option<Arc<dyn AdbConnection>>>,
    ) -> Result<ConnectionStatus> {
        let connection = self.shared_connection(shared).await?;
        if !connection.auto_connect(self.timeouts.probe_connect()).await? {
            return Ok(ConnectionStatus::NeedsPairing);
        }

        let mut stream = connection.open_stream(ECHO_SERVICE).await?;
        let read = response::read_once(&mut stream, self.timeouts.probe_read()).await;
        close_stream(stream).await;

        Ok(match read {
            Ok(n) if n > 0 => ConnectionStatus::Connected,
            Ok(_) => ConnectionStatus::NeedsPairing,
            Err(e) => {
                debug!(error = &e as &dyn Error, "Status probe read failed");
                ConnectionStatus::NeedsPairing
            }
        })
    }

    /// Pairs with the daemon's pairing service on `port` of this device
    #[instrument(level = "debug", skip(self, code), err)]
    pub async fn pair(&self, code: &str, port: i64) -> Result<(), SessionError> {
        let request = PairingRequest::new(code, port)?;
        let mut shared = self.shared.lock().await;
        let connection = self.shared_connection(&mut shared).await?;

        info!(port = request.port(), "Pairing with ADB daemon");
        connection
            .pair(LOCALHOST, request.port(), request.code())
            .await
            .map_err(SessionError::Pairing)?;
        self.status.invalidate().await;
        info!("Pairing successful");
        Ok(())
    }

    /// Checks that the daemon accepts commands from this identity.
    ///
    /// The shared connection is closed afterwards so the next operation
    /// starts from a clean state.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn test_connection(&self) -> Result<(), SessionError> {
        let mut shared = self.shared.lock().await;
        let connection = self.shared_connection(&mut shared).await?;

        let outcome = self.echo_test(connection.as_ref()).await;
        close_connection(connection.as_ref()).await;

        match outcome {
            Ok(Some(output)) if output.contains(ECHO_TOKEN) => {
                info!("ADB connection authorized");
                Ok(())
            }
            Ok(Some(output)) => {
                warn!(%output, "Echo test returned no token");
                Err(SessionError::Unauthorized(NOT_AUTHORIZED_MESSAGE.to_string()))
            }
            Ok(None) => Err(SessionError::Transport(CONNECT_FAILED_MESSAGE.to_string())),
            Err(e) => {
                warn!(error = e.as_ref() as &dyn Error, "Echo test failed");
                Err(SessionError::Unauthorized(AUTHORIZATION_REQUIRED_MESSAGE.to_string()))
            }
        }
    }

    /// Runs the echo command; `None` when the daemon could not be reached
    async fn echo_test(&self, connection: &dyn AdbConnection) -> Result<Option<String>> {
        if !connection.auto_connect(self.timeouts.connect()).await? {
            return Ok(None);
        }

        let mut stream = connection.open_stream(ECHO_SERVICE).await?;
        let output = response::read_response(
            &mut stream,
            self.timeouts.echo_wait(),
            self.timeouts.poll_interval(),
            |text| text.contains(ECHO_TOKEN),
        )
        .await;
        close_stream(stream).await;
        Ok(Some(output?))
    }

    async fn shared_connection(
        &self,
        shared: &mut MutexGuard<'_, Option<Arc<dyn AdbConnection>>>,
    ) -> Result<Arc<dyn AdbConnection>, SessionError> {
        if let Some(connection) = &**shared {
            return Ok(connection.clone());
        }
        let connection = self.new_connection().await?;
        **shared = Some(connection.clone());
        Ok(connection)
    }

    async fn new_connection(&self) -> Result<Arc<dyn AdbConnection>, SessionError> {
        let identity = self.identity.identity().await?;
        self.connector.new_connection(identity).map_err(|e| {
            warn!(error = e.as_ref() as &dyn Error, "Failed to create ADB connection");
            SessionError::Transport(format!("{e:#}"))
        })
    }
}

/// Best-effort close, failures are only logged
async fn close_stream(mut stream: Box<dyn AdbStream>) {
    match tokio::time::timeout(CLOSE_TIMEOUT, stream.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = &e as &dyn Error, "Failed to close ADB stream"),
        Err(_) => warn!("Timed out closing ADB stream"),
    }
}

/// Best-effort close, failures are only logged
async fn close_connection(connection: &dyn AdbConnection) {
    match tokio::time::timeout(CLOSE_TIMEOUT, connection.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = e.as_ref() as &dyn Error, "Failed to close ADB connection"),
        Err(_) => warn!("Timed out closing ADB connection"),
    }
}
