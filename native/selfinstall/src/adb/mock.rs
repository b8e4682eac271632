//! Scripted in-memory transport for exercising the session layer.

use std::{
    collections::HashMap,
    io,
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};

use super::{AdbConnection, AdbConnector, AdbStream};
use crate::identity::Identity;

/// How the remote side of a stream ends after its scripted output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamEnd {
    /// Remote closes its side, reads return 0
    Eof,
    /// Remote stays silent forever
    Hang,
}

/// Scripted remote output: chunks written after their delay, then `end`
#[derive(Debug, Clone)]
pub(crate) struct Reply {
    pub chunks: Vec<(Duration, Vec<u8>)>,
    pub end: StreamEnd,
    /// Remote never reads what the client writes
    pub stalls_input: bool,
}

impl Reply {
    pub fn text(text: &str) -> Self {
        Self {
            chunks: vec![(Duration::ZERO, text.as_bytes().to_vec())],
            end: StreamEnd::Eof,
            stalls_input: false,
        }
    }

    pub fn delayed(delay: Duration, text: &str, end: StreamEnd) -> Self {
        Self { chunks: vec![(delay, text.as_bytes().to_vec())], end, stalls_input: false }
    }

    pub fn silent(end: StreamEnd) -> Self {
        Self { chunks: Vec::new(), end, stalls_input: false }
    }

    pub fn stalling_input(mut self) -> Self {
        self.stalls_input = true;
        self
    }
}

#[derive(Debug, Default)]
pub(crate) struct Behavior {
    /// Result of `auto_connect`
    pub connects: bool,
    /// `auto_connect` fails with an error instead of returning a value
    pub connect_error: bool,
    pub pair_error: Option<String>,
    /// Replies keyed by service prefix
    pub replies: Vec<(String, Reply)>,
}

impl Behavior {
    pub fn connected() -> Self {
        Self { connects: true, ..Default::default() }
    }

    pub fn reply(mut self, service_prefix: &str, reply: Reply) -> Self {
        self.replies.push((service_prefix.to_string(), reply));
        self
    }
}

/// Everything the mock observed, shared by all its connections
#[derive(Debug, Default)]
pub(crate) struct Log {
    pub connections_created: AtomicUsize,
    pub connections_closed: AtomicUsize,
    pub auto_connects: AtomicUsize,
    pub opened: Mutex<Vec<String>>,
    pub streams_closed: AtomicUsize,
    pub written: Mutex<HashMap<String, Vec<u8>>>,
    pub paired: Mutex<Vec<(String, u16, String)>>,
}

impl Log {
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }

    pub fn written_to(&self, service: &str) -> Vec<u8> {
        self.written.lock().unwrap().get(service).cloned().unwrap_or_default()
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub(crate) struct MockConnector {
    behavior: Arc<Mutex<Behavior>>,
    pub log: Arc<Log>,
}

impl MockConnector {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self { behavior: Arc::new(Mutex::new(behavior)), log: Arc::default() })
    }

    /// Swaps the script for connections made or used from now on
    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }
}

impl AdbConnector for MockConnector {
    fn new_connection(&self, _identity: Arc<Identity>) -> Result<Arc<dyn AdbConnection>> {
        self.log.connections_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockConnection { behavior: self.behavior.clone(), log: self.log.clone() }))
    }
}

struct MockConnection {
    behavior: Arc<Mutex<Behavior>>,
    log: Arc<Log>,
}

#[async_trait]
impl AdbConnection for MockConnection {
    async fn auto_connect(&self, _timeout: Duration) -> Result<bool> {
        self.log.auto_connects.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior.lock().unwrap();
        if behavior.connect_error {
            return Err(anyhow!("discovery exploded"));
        }
        Ok(behavior.connects)
    }

    async fn pair(&self, host: &str, port: u16, code: &str) -> Result<()> {
        self.log.paired.lock().unwrap().push((host.to_string(), port, code.to_string()));
        match &self.behavior.lock().unwrap().pair_error {
            Some(message) => Err(anyhow!(message.clone())),
            None => Ok(()),
        }
    }

    async fn open_stream(&self, service: &str) -> Result<Box<dyn AdbStream>> {
        self.log.opened.lock().unwrap().push(service.to_string());
        let reply = self
            .behavior
            .lock()
            .unwrap()
            .replies
            .iter()
            .find(|(prefix, _)| service.starts_with(prefix.as_str()))
            .map(|(_, reply)| reply.clone())
            .ok_or_else(|| anyhow!("unexpected service: {service}"))?;

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (mut server_read, mut server_write) = tokio::io::split(server);

        // Drain whatever the client sends
        let log = self.log.clone();
        let key = service.to_string();
        let stalls_input = reply.stalls_input;
        tokio::spawn(async move {
            if stalls_input {
                std::future::pending::<()>().await;
            }
            let mut buf = [0u8; 4096];
            while let Ok(n) = server_read.read(&mut buf).await {
                if n == 0 {
                    break;
                }
                log.written.lock().unwrap().entry(key.clone()).or_default().extend_from_slice(&buf[..n]);
            }
        });

        tokio::spawn(async move {
            for (delay, chunk) in reply.chunks {
                tokio::time::sleep(delay).await;
                if server_write.write_all(&chunk).await.is_err() {
                    return;
                }
            }
            match reply.end {
                StreamEnd::Eof => {
                    let _ = server_write.shutdown().await;
                }
                StreamEnd::Hang => {
                    std::future::pending::<()>().await;
                    drop(server_write);
                }
            }
        });

        Ok(Box::new(TrackedStream {
            inner: client,
            closed: AtomicBool::new(false),
            log: self.log.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.log.connections_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Client half of a duplex pipe that reports its shutdown to the log
struct TrackedStream {
    inner: DuplexStream,
    closed: AtomicBool,
    log: Arc<Log>,
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.log.streams_closed.fetch_add(1, Ordering::SeqCst);
        }
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
