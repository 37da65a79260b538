//! Bidirectional byte pump between a client connection and an upstream.
//!
//! Each direction runs in its own task. Whichever finishes first (EOF or
//! error) ends the relay: the other task is aborted, both endpoints are
//! dropped and the upstream's teardown runs exactly once.

use crate::upstream::{BoxRead, BoxWrite, ByteSource, LossyLines, Upstream};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

const BUFFER_SIZE: usize = 8 * 1024;

/// How long to keep forwarding the side stream once the main output ended.
const SIDE_DRAIN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    /// Straight passthrough.
    Stream,
    /// Forward whole lines only and interleave the upstream's side stream.
    Lines,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedBy {
    Upstream,
    Client,
}

#[derive(Debug)]
pub struct RelayOutcome {
    pub closed_by: ClosedBy,
    pub to_client: u64,
    pub to_upstream: u64,
    /// Exit status of an owned process, if there was one.
    pub exit_status: Option<ExitStatus>,
}

#[derive(Default)]
struct Counters {
    to_client: AtomicU64,
    to_upstream: AtomicU64,
}

/// Relay until either side closes, then release everything.
pub async fn relay<C>(client: C, upstream: Upstream, mode: RelayMode) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let Upstream {
        kind,
        source,
        sink,
        side,
        teardown,
    } = upstream;
    let (client_read, client_write) = tokio::io::split(client);
    let counters = Arc::new(Counters::default());

    let mut downstream = {
        let counters = counters.clone();
        tokio::spawn(async move {
            let result = match mode {
                RelayMode::Stream => pump_stream(source, client_write, &counters).await,
                RelayMode::Lines => pump_lines(source, side, client_write, &counters).await,
            };
            if let Err(e) = result {
                debug!(error = %e, "upstream → client pump ended with error");
            }
        })
    };
    let mut upstream_pump = {
        let counters = counters.clone();
        tokio::spawn(async move {
            if let Err(e) = pump_up(client_read, sink, &counters).await {
                debug!(error = %e, "client → upstream pump ended with error");
            }
        })
    };

    let closed_by = tokio::select! {
        _ = &mut downstream => {
            upstream_pump.abort();
            let _ = upstream_pump.await;
            ClosedBy::Upstream
        }
        _ = &mut upstream_pump => {
            downstream.abort();
            let _ = downstream.await;
            ClosedBy::Client
        }
    };

    let exit_status = teardown.run().await;
    let outcome = RelayOutcome {
        closed_by,
        to_client: counters.to_client.load(Ordering::Relaxed),
        to_upstream: counters.to_upstream.load(Ordering::Relaxed),
        exit_status,
    };
    info!(
        ?kind,
        closed_by = ?outcome.closed_by,
        to_client = outcome.to_client,
        to_upstream = outcome.to_upstream,
        exit = ?outcome.exit_status,
        "relay finished"
    );
    outcome
}

async fn pump_stream<W>(
    mut source: Box<dyn ByteSource>,
    mut client: W,
    counters: &Counters,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        client.write_all(&buf[..n]).await?;
        client.flush().await?;
        counters.to_client.fetch_add(n as u64, Ordering::Relaxed);
    }
    client.shutdown().await
}

/// Line-buffered downstream pump.
///
/// Output is held back until a newline so side-stream lines can only land
/// between complete lines. A line longer than the read buffer is forwarded
/// unfinished. The pending source read is never cancelled while side lines
/// are forwarded.
async fn pump_lines<W>(
    mut source: Box<dyn ByteSource>,
    side: Option<BoxRead>,
    mut client: W,
    counters: &Counters,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut side = side.map(LossyLines::new);
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let n = {
            let mut read = source.read(&mut buf);
            loop {
                let Some(lines) = side.as_mut() else {
                    break (&mut read).await?;
                };
                tokio::select! {
                    n = &mut read => break n?,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => write_line(&mut client, &line, counters).await?,
                        Ok(None) => side = None,
                        Err(e) => {
                            warn!(error = %e, "side stream unreadable, dropping it");
                            side = None;
                        }
                    },
                }
            }
        };
        if n == 0 {
            break;
        }
        pending.extend_from_slice(&buf[..n]);
        let flush_to = match pending.iter().rposition(|b| *b == b'\n') {
            Some(pos) => Some(pos + 1),
            None if pending.len() >= BUFFER_SIZE => Some(pending.len()),
            None => None,
        };
        if let Some(end) = flush_to {
            let complete: Vec<u8> = pending.drain(..end).collect();
            client.write_all(&complete).await?;
            client.flush().await?;
            counters
                .to_client
                .fetch_add(complete.len() as u64, Ordering::Relaxed);
        }
    }

    if !pending.is_empty() {
        client.write_all(&pending).await?;
        counters
            .to_client
            .fetch_add(pending.len() as u64, Ordering::Relaxed);
    }
    if let Some(mut lines) = side {
        let drain = async {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => write_line(&mut client, &line, counters).await?,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "side stream unreadable during drain");
                        break;
                    }
                }
            }
            Ok::<_, std::io::Error>(())
        };
        if let Ok(result) = tokio::time::timeout(SIDE_DRAIN, drain).await {
            result?;
        }
    }
    client.flush().await?;
    client.shutdown().await
}

async fn write_line<W>(client: &mut W, line: &str, counters: &Counters) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    client.write_all(line.as_bytes()).await?;
    client.write_all(b"\n").await?;
    client.flush().await?;
    counters
        .to_client
        .fetch_add(line.len() as u64 + 1, Ordering::Relaxed);
    Ok(())
}

async fn pump_up<R>(mut client: R, mut sink: BoxWrite, counters: &Counters) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = client.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        sink.write_all(&buf[..n]).await?;
        sink.flush().await?;
        counters.to_upstream.fetch_add(n as u64, Ordering::Relaxed);
    }
    sink.shutdown().await
}
