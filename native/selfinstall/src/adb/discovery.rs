use std::{error::Error, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use mdns_sd::{ServiceDaemon, ServiceEvent};
use tokio::{sync::watch, task::JoinHandle};
use tokio_stream::{StreamExt, wrappers::WatchStream};
use tracing::{Instrument, debug, info, info_span, instrument, trace, warn};

/// Advertised by the daemon while wireless debugging accepts connections
pub const CONNECT_SERVICE_TYPE: &str = "_adb-tls-connect._tcp.local.";
/// Advertised while the "Pair device with pairing code" dialog is open
pub const PAIRING_SERVICE_TYPE: &str = "_adb-tls-pairing._tcp.local.";

/// Shuts the mDNS daemon down when dropped
struct Daemon(ServiceDaemon);

impl Drop for Daemon {
    fn drop(&mut self) {
        if let Err(e) = self.0.shutdown() {
            trace!(error = &e as &dyn Error, "mDNS daemon already stopped");
        }
    }
}

/// Waits for the first resolved instance of `service_type` and returns its port.
///
/// Unbounded on its own, callers wrap it in a timeout.
// TODO: skip instances advertised by other devices on the same network
#[instrument(level = "debug", err)]
pub async fn resolve_port(service_type: &str) -> Result<u16> {
    let daemon = Daemon(ServiceDaemon::new().context("Failed to start mDNS daemon")?);
    let rx = daemon.0.browse(service_type).context("Failed to start mDNS browse")?;
    loop {
        match rx.recv_async().await {
            Ok(ServiceEvent::ServiceResolved(resolved)) => {
                let port = resolved.get_port();
                debug!(fullname = %resolved.get_fullname(), port, "mDNS: service resolved");
                if port > 0 {
                    return Ok(port);
                }
            }
            Ok(ServiceEvent::ServiceFound(_, fullname)) => trace!("mDNS: service found: {}", fullname),
            Ok(_) => {}
            Err(e) => bail!("mDNS browse channel closed: {e}"),
        }
    }
}

/// Observes the pairing port the daemon currently advertises (`0` while none is)
pub struct PairingPortWatcher {
    port: watch::Receiver<u16>,
    task: JoinHandle<()>,
}

impl PairingPortWatcher {
    /// Starts browsing for the pairing service in the background
    #[instrument(level = "debug", err)]
    pub fn start() -> Result<Self> {
        let daemon = Daemon(ServiceDaemon::new().context("Failed to start mDNS daemon")?);
        let rx = daemon.0.browse(PAIRING_SERVICE_TYPE).context("Failed to start mDNS browse")?;
        let (tx, port) = watch::channel(0u16);

        let task = tokio::spawn(
            async move {
                // Keep the daemon alive for as long as we browse
                let _daemon = daemon;
                loop {
                    match rx.recv_async().await {
                        Ok(ServiceEvent::ServiceResolved(resolved)) => {
                            let port = resolved.get_port();
                            info!(port, fullname = %resolved.get_fullname(), "Pairing service port");
                            tx.send_replace(port);
                        }
                        Ok(ServiceEvent::ServiceRemoved(_, fullname)) => {
                            debug!("mDNS: pairing service removed: {}", fullname);
                            tx.send_replace(0);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "mDNS browse channel closed");
                            break;
                        }
                    }
                }
            }
            .instrument(info_span!("task_watch_pairing_port")),
        );

        Ok(Self { port, task })
    }

    pub fn subscribe(&self) -> watch::Receiver<u16> {
        self.port.clone()
    }

    /// Waits until a pairing port is advertised
    pub async fn wait_for_port(&self, timeout: Duration) -> Result<u16> {
        first_open_port(self.subscribe(), timeout).await
    }
}

impl Drop for PairingPortWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// First non-zero value seen on `port` within `timeout`
pub(crate) async fn first_open_port(port: watch::Receiver<u16>, timeout: Duration) -> Result<u16> {
    let mut ports = WatchStream::new(port).filter(|port| *port > 0);
    tokio::time::timeout(timeout, ports.next())
        .await
        .map_err(|_| anyhow!("No pairing service seen within {} ms", timeout.as_millis()))?
        .context("Pairing port watcher stopped")
}
