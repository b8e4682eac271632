use std::{error::Error, path::Path};

use anyhow::{Context, Result, anyhow, ensure};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    time::Instant,
};
use tracing::{debug, info, instrument, warn};

use super::{AdbSession, SessionError, close_connection, close_stream, response};
use crate::{
    adb::{AdbConnection, AdbStream, install_service},
    models::ConnectionStatus,
};

/// Bytes written to the install stream at a time
pub const INSTALL_CHUNK_SIZE: usize = 8192;
pub const INSTALL_SUCCESS_MESSAGE: &str = "Installation successful";

const INSTALL_CONNECT_FAILED_MESSAGE: &str =
    "Failed to connect to ADB. Make sure wireless debugging is enabled and you've paired.";
const UNKNOWN_ERROR_MESSAGE: &str = "Unknown error";

/// Markers the package manager ends its verdict with
const VERDICT_MARKERS: [&str; 2] = ["Success", "Failure"];

impl AdbSession {
    /// Installs the package at `package` onto this device.
    ///
    /// Runs over a fresh connection that is closed afterwards, whatever the
    /// outcome. A success marks the session as connected.
    #[instrument(level = "debug", skip(self, package), fields(package = %package.display()), err)]
    pub async fn install(&self, package: &Path) -> Result<String, SessionError> {
        // The daemon may have restarted, never trust an older status here
        self.status.invalidate().await;

        let connection = self.new_connection().await?;
        let outcome = self.install_over(connection.as_ref(), package).await;
        close_connection(connection.as_ref()).await;

        let response = match outcome {
            Ok(Some(response)) => response,
            Ok(None) => {
                return Err(SessionError::Transport(INSTALL_CONNECT_FAILED_MESSAGE.to_string()));
            }
            Err(e) => {
                warn!(error = e.as_ref() as &dyn Error, "Installation failed");
                return Err(SessionError::Install(e));
            }
        };

        match classify_response(&response) {
            Ok(()) => {
                self.status.store(Instant::now(), ConnectionStatus::Connected).await;
                info!("Installation successful");
                Ok(INSTALL_SUCCESS_MESSAGE.to_string())
            }
            Err(message) => {
                warn!(%message, "Package manager rejected the package");
                Err(SessionError::InstallRejected(message))
            }
        }
    }

    /// Streams the package and collects the verdict; `None` when the daemon
    /// could not be reached
    async fn install_over(
        &self,
        connection: &dyn AdbConnection,
        package: &Path,
    ) -> Result<Option<String>> {
        if !connection.auto_connect(self.timeouts.connect()).await? {
            return Ok(None);
        }

        let size = fs_err::tokio::metadata(package).await?.len();
        info!(size = %humansize::format_size(size, humansize::DECIMAL), "Installing package");

        let mut stream = connection.open_stream(&install_service(size)).await?;
        let exchange = self.exchange(&mut stream, package, size).await;
        close_stream(stream).await;
        exchange.map(Some)
    }

    async fn exchange(
        &self,
        stream: &mut Box<dyn AdbStream>,
        package: &Path,
        size: u64,
    ) -> Result<String> {
        let budget = self.timeouts.install_write();
        tokio::time::timeout(budget, stream_package(stream, package, size))
            .await
            .map_err(|_| anyhow!("Timed out streaming package after {} ms", budget.as_millis()))??;

        let response = response::read_response(
            stream,
            self.timeouts.install_response(),
            self.timeouts.poll_interval(),
            |text| VERDICT_MARKERS.iter().any(|marker| text.contains(marker)),
        )
        .await
        .context("Failed to read install response")?;
        debug!(response = response.trim(), "Package manager responded");
        Ok(response)
    }
}

/// Writes the whole file to `stream` in [`INSTALL_CHUNK_SIZE`] chunks
async fn stream_package(stream: &mut Box<dyn AdbStream>, package: &Path, size: u64) -> Result<()> {
    let mut file = fs_err::tokio::File::open(package).await?;
    let mut buf = vec![0u8; INSTALL_CHUNK_SIZE];
    let mut sent = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stream.write_all(&buf[..n]).await.context("Failed to write package")?;
        sent += n as u64;
    }
    stream.flush().await.context("Failed to flush package")?;
    // The daemon waits for exactly the announced size
    ensure!(sent == size, "Package changed while streaming ({sent} of {size} bytes sent)");
    debug!(sent, "Package streamed");
    Ok(())
}

/// `Ok` when the package manager reported success, otherwise the message to show
fn classify_response(response: &str) -> Result<(), String> {
    let response = response.trim();
    if response.to_lowercase().contains("success") {
        Ok(())
    } else if response.is_empty() {
        Err(UNKNOWN_ERROR_MESSAGE.to_string())
    } else {
        Err(response.to_string())
    }
}
