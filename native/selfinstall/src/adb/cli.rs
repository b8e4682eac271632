//! Transport backed by the platform `adb` binary.
//!
//! `adb` authenticates with the key in `$ANDROID_USER_HOME/adbkey`, loaded
//! once when its server starts. Every command therefore runs with a home
//! holding the identity's key and against a server on a port of its own, which
//! is restarted whenever the exported key changes.

use std::{
    io,
    path::{Path, PathBuf},
    pin::Pin,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context as TaskContext, Poll, ready},
    time::Duration,
};

use anyhow::{Context, Result, bail, ensure};
use async_trait::async_trait;
use derive_more::Debug;
use lazy_regex::{Lazy, Regex, lazy_regex};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    sync::RwLock,
};
use tracing::{debug, info, instrument, trace, warn};

use super::{AdbConnection, AdbConnector, AdbStream, LOCALHOST, discovery};
use crate::{
    identity::Identity,
    utils::{resolve_binary_path, sanitize_output},
};

/// `adb connect` exits with 0 even when it fails, the text is what counts
static CONNECTED_REGEX: Lazy<Regex> = lazy_regex!(r"^(?:already )?connected to \S+");
static PAIRED_REGEX: Lazy<Regex> = lazy_regex!(r"Successfully paired to \S+");

/// Directory under the adb home that `adb` reads its keys from
const ANDROID_DIR: &str = ".android";
const PRIVATE_KEY_FILE: &str = "adbkey";
const PUBLIC_KEY_FILE: &str = "adbkey.pub";
/// Name the daemon lists the key under in "Wireless debugging"
const KEY_COMMENT: &str = "selfinstall@localhost";

/// Maps a daemon service string onto `adb` command-line arguments.
///
/// `exec:` services need stdin and stdout both, which among the client's
/// commands only `shell -T` forwards.
fn service_args(service: &str) -> Result<[&str; 3]> {
    match service.split_once(':') {
        Some(("shell" | "exec", command)) if !command.is_empty() => Ok(["shell", "-T", command]),
        _ => bail!("Unsupported ADB service: {service}"),
    }
}

/// Location of the identity's key as exported for `adb` under `adb_home`
pub fn adb_key_path(adb_home: &Path) -> PathBuf {
    adb_home.join(ANDROID_DIR).join(PRIVATE_KEY_FILE)
}

#[derive(Debug, Clone)]
pub struct AdbCliConnector {
    /// Configured `adb` location, `PATH` lookup when empty
    adb_path: Option<String>,
    /// Home directory handed to `adb`, the keys live in its `.android`
    adb_home: PathBuf,
    /// Port of the `adb` server dedicated to this application
    server_port: u16,
}

impl AdbCliConnector {
    pub fn new(adb_path: Option<String>, adb_home: impl Into<PathBuf>, server_port: u16) -> Self {
        Self { adb_path: adb_path.filter(|p| !p.is_empty()), adb_home: adb_home.into(), server_port }
    }

    /// Writes the identity's key pair where `adb` looks for it.
    /// Returns whether anything changed.
    fn export_key(&self, identity: &Identity) -> Result<bool> {
        let private_path = adb_key_path(&self.adb_home);
        let public_path = private_path.with_file_name(PUBLIC_KEY_FILE);
        let private_pem = identity.private_key_pem()?;
        let public_line = identity.adb_public_key(KEY_COMMENT)?;

        let unchanged = fs_err::read_to_string(&private_path).is_ok_and(|existing| existing == private_pem)
            && fs_err::read_to_string(&public_path).is_ok_and(|existing| existing == public_line);
        if unchanged {
            return Ok(false);
        }

        let key_dir = self.adb_home.join(ANDROID_DIR);
        fs_err::create_dir_all(&key_dir).context("Failed to create adb key directory")?;
        fs_err::write(&private_path, private_pem.as_bytes()).context("Failed to export ADB key")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs_err::set_permissions(&private_path, std::fs::Permissions::from_mode(0o600))
                .context("Failed to restrict ADB key permissions")?;
        }
        fs_err::write(&public_path, public_line.as_bytes())
            .context("Failed to export ADB public key")?;
        debug!(path = %private_path.display(), "Exported ADB key");
        Ok(true)
    }
}

impl AdbConnector for AdbCliConnector {
    #[instrument(level = "debug", skip(self, identity), err)]
    fn new_connection(&self, identity: Arc<Identity>) -> Result<Arc<dyn AdbConnection>> {
        let adb = resolve_binary_path(self.adb_path.as_deref(), "adb")
            .context("ADB binary not found")?;
        let key_changed = self.export_key(&identity)?;
        Ok(Arc::new(AdbCliConnection {
            adb,
            adb_home: self.adb_home.clone(),
            server_port: self.server_port,
            restart_server: AtomicBool::new(key_changed),
            serial: RwLock::new(None),
        }))
    }
}

#[derive(Debug)]
pub struct AdbCliConnection {
    adb: PathBuf,
    adb_home: PathBuf,
    server_port: u16,
    /// A running server may still hold an older key
    restart_server: AtomicBool,
    /// `host:port` of the daemon once connected
    serial: RwLock<Option<String>>,
}

impl AdbCliConnection {
    fn command(&self) -> Command {
        let mut command = Command::new(&self.adb);
        command
            .env("HOME", &self.adb_home)
            .env("ANDROID_USER_HOME", self.adb_home.join(ANDROID_DIR))
            .env("ANDROID_ADB_SERVER_PORT", self.server_port.to_string())
            .env_remove("ADB_VENDOR_KEYS")
            .kill_on_drop(true);
        command
    }

    /// Runs `adb <args>` to completion and returns its combined output
    #[instrument(level = "debug", skip_all, fields(command = args.first().copied().unwrap_or_default()), err)]
    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = self
            .command()
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to run adb {}", args.first().copied().unwrap_or_default()))?;
        let mut text = sanitize_output(&output.stdout);
        let stderr = sanitize_output(&output.stderr);
        if !stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&stderr);
        }
        ensure!(output.status.success(), "adb {} failed ({}): {}", args.first().copied().unwrap_or_default(), output.status, text);
        Ok(text)
    }

    /// Stops a server started before the current key was exported
    async fn ensure_fresh_server(&self) {
        if !self.restart_server.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(port = self.server_port, "ADB key changed, restarting adb server");
        if let Err(e) = self.run(&["kill-server"]).await {
            trace!(error = %e, "No adb server to stop");
        }
    }

    async fn is_online(&self, serial: &str) -> bool {
        match self.run(&["-s", serial, "get-state"]).await {
            Ok(state) => state.trim() == "device",
            Err(e) => {
                trace!(error = %e, serial, "Device is not online");
                false
            }
        }
    }

    async fn discover_and_connect(&self) -> Result<bool> {
        self.ensure_fresh_server().await;
        if let Some(serial) = self.serial.read().await.clone()
            && self.is_online(&serial).await
        {
            trace!(serial, "Reusing live connection");
            return Ok(true);
        }

        let port = discovery::resolve_port(discovery::CONNECT_SERVICE_TYPE).await?;
        let target = format!("{LOCALHOST}:{port}");
        info!(%target, "ADB connect attempt");
        let response = self.run(&["connect", &target]).await?;
        if !CONNECTED_REGEX.is_match(&response) {
            warn!(%target, %response, "ADB connect refused");
            return Ok(false);
        }
        *self.serial.write().await = Some(target);
        Ok(true)
    }
}

#[async_trait]
impl AdbConnection for AdbCliConnection {
    #[instrument(level = "debug", skip(self), err)]
    async fn auto_connect(&self, timeout: Duration) -> Result<bool> {
        match tokio::time::timeout(timeout, self.discover_and_connect()).await {
            Ok(result) => result,
            Err(_) => {
                debug!(timeout_ms = timeout.as_millis() as u64, "Auto-connect timed out");
                Ok(false)
            }
        }
    }

    #[instrument(level = "debug", skip(self, code), err)]
    async fn pair(&self, host: &str, port: u16, code: &str) -> Result<()> {
        self.ensure_fresh_server().await;
        let target = format!("{host}:{port}");
        let response = self.run(&["pair", &target, code]).await?;
        ensure!(PAIRED_REGEX.is_match(&response), "Pairing rejected: {response}");
        info!(%target, "Paired with ADB daemon");
        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn open_stream(&self, service: &str) -> Result<Box<dyn AdbStream>> {
        let serial = self.serial.read().await.clone().context("Not connected to ADB")?;
        let [mode, flag, command] = service_args(service)?;
        let mut adb = self.command();
        adb.args(["-s", serial.as_str(), mode, flag, command]);
        // Package manager failures can arrive on stderr only
        let stream = ChildStream::spawn(adb, service.starts_with("exec:"))?;
        Ok(Box::new(stream))
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn close(&self) -> Result<()> {
        let Some(serial) = self.serial.write().await.take() else {
            return Ok(());
        };
        self.run(&["disconnect", &serial]).await?;
        Ok(())
    }
}

/// A running `adb` command; its stdin is our output and its stdout our input.
///
/// With `stderr` captured, a command that printed nothing on stdout reads
/// back its stderr instead.
#[derive(Debug)]
struct ChildStream {
    /// Killed when the stream is dropped
    #[debug(skip)]
    _child: Child,
    #[debug(skip)]
    stdin: ChildStdin,
    #[debug(skip)]
    stdout: ChildStdout,
    #[debug(skip)]
    stderr: Option<ChildStderr>,
    stdout_done: bool,
    stdout_seen: bool,
}

impl ChildStream {
    fn spawn(mut command: Command, capture_stderr: bool) -> Result<Self> {
        let stderr = if capture_stderr { Stdio::piped() } else { Stdio::null() };
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(stderr)
            .spawn()
            .context("Failed to spawn adb")?;
        let stdin = child.stdin.take().context("adb stdin not captured")?;
        let stdout = child.stdout.take().context("adb stdout not captured")?;
        let stderr = child.stderr.take();
        Ok(Self { _child: child, stdin, stdout, stderr, stdout_done: false, stdout_seen: false })
    }
}

impl AsyncRead for ChildStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.stdout_done {
            let before = buf.filled().len();
            ready!(Pin::new(&mut this.stdout).poll_read(cx, buf))?;
            if buf.filled().len() > before {
                this.stdout_seen = true;
                return Poll::Ready(Ok(()));
            }
            this.stdout_done = true;
        }
        match (&mut this.stderr, this.stdout_seen) {
            (Some(stderr), false) => Pin::new(stderr).poll_read(cx, buf),
            _ => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncWrite for ChildStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_shutdown(cx)
    }
}
