use std::time::Duration;

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    time::{Instant, timeout},
};
use tracing::trace;

/// Size of a single read from a service stream
const READ_BUFFER_SIZE: usize = 1024;

/// Collects output from `stream` until `done` accepts it, the remote closes
/// its side, or `budget` runs out.
///
/// Every read waits at most `poll_interval`, so the budget is checked even
/// while the remote stays silent. Output is returned as lossy UTF-8.
pub(crate) async fn read_response<S, F>(
    stream: &mut S,
    budget: Duration,
    poll_interval: Duration,
    done: F,
) -> std::io::Result<String>
where
    S: AsyncRead + Unpin + ?Sized,
    F: Fn(&str) -> bool,
{
    let deadline = Instant::now() + budget;
    let mut output = Vec::new();
    let mut buf = [0u8; READ_BUFFER_SIZE];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            trace!(budget_ms = budget.as_millis() as u64, "Response budget exhausted");
            break;
        }
        match timeout(poll_interval.min(remaining), stream.read(&mut buf)).await {
            Ok(Ok(0)) => {
                trace!("Remote closed the stream");
                break;
            }
            Ok(Ok(n)) => {
                output.extend_from_slice(&buf[..n]);
                if done(&String::from_utf8_lossy(&output)) {
                    break;
                }
            }
            Ok(Err(e)) => return Err(e),
            // Nothing this tick
            Err(_) => {}
        }
    }

    Ok(String::from_utf8_lossy(&output).into_owned())
}

/// A single read bounded by `limit`; `0` when nothing arrived in time
pub(crate) async fn read_once<S>(stream: &mut S, limit: Duration) -> std::io::Result<usize>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut buf = [0u8; READ_BUFFER_SIZE];
    match timeout(limit, stream.read(&mut buf)).await {
        Ok(read) => read,
        Err(_) => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    const POLL: Duration = Duration::from_millis(100);

    #[tokio::test(start_paused = true)]
    async fn stops_as_soon_as_the_output_is_complete() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            server.write_all(b"Succ").await.unwrap();
            tokio::time::sleep(Duration::from_millis(250)).await;
            server.write_all(b"ess\n").await.unwrap();
            // Keep our side open, only the marker may end the read
            std::future::pending::<()>().await;
        });

        let started = Instant::now();
        let output =
            read_response(&mut client, Duration::from_secs(30), POLL, |text| text.contains("Success"))
                .await
                .unwrap();
        assert_eq!(output, "Success\n");
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_when_the_budget_is_spent() {
        let (mut client, _server) = tokio::io::duplex(1024);
        let started = Instant::now();
        let output = read_response(&mut client, Duration::from_secs(5), POLL, |_| false).await.unwrap();
        assert!(output.is_empty());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_secs(5) + POLL * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn end_of_stream_ends_the_read() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        server.write_all(b"Failure [INSTALL_FAILED_").await.unwrap();
        drop(server);
        let output = read_response(&mut client, Duration::from_secs(30), POLL, |_| false).await.unwrap();
        assert_eq!(output, "Failure [INSTALL_FAILED_");
    }

    #[tokio::test]
    async fn split_multibyte_characters_survive() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let text = "Échec";
        let bytes = text.as_bytes();
        server.write_all(&bytes[..1]).await.unwrap();
        server.write_all(&bytes[1..]).await.unwrap();
        drop(server);
        let output = read_response(&mut client, Duration::from_secs(5), POLL, |_| false).await.unwrap();
        assert_eq!(output, text);
    }

    #[tokio::test(start_paused = true)]
    async fn single_read_reports_silence_as_empty() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        assert_eq!(read_once(&mut client, Duration::from_secs(1)).await.unwrap(), 0);
        server.write_all(b"test\n").await.unwrap();
        assert_eq!(read_once(&mut client, Duration::from_secs(1)).await.unwrap(), 5);
    }
}
