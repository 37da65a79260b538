//! One relay session: handshake, then a byte pipe to stdin/stdout.

use crate::tls::{self, Trust};
use anyhow::{Context, Result};
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};
use trelay_core::{read_reply, write_request, RelayRequest};

/// Where and how to reach the relay server.
#[derive(Debug, Clone)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub trust: Trust,
}

/// Connect, send `request` and relay stdin/stdout until the server closes.
pub async fn run(target: &Target, request: &RelayRequest) -> Result<()> {
    let connector = tls::connector(&target.trust)?;
    let mut stream = tls::connect(&connector, &target.host, target.port).await?;
    handshake(&mut stream, request).await?;
    pipe(stream, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Write the request and wait for the one-shot reply. A refusal becomes an
/// error carrying the server's message.
pub async fn handshake<S>(stream: &mut S, request: &RelayRequest) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_request(stream, request)
        .await
        .context("failed to send request")?;
    let reply = read_reply(stream)
        .await
        .context("failed to read reply")?;
    if !reply.success {
        anyhow::bail!("{}", reply.message);
    }
    info!(app = %request.app_name, message = %reply.message, "relay accepted");
    Ok(())
}

/// Copy `input` to the server and the server to `output` until the server
/// side ends.
///
/// EOF on `input` leaves the write side open: the server tears the relay
/// down as soon as the client direction ends, which would cut off output
/// still in flight.
pub async fn pipe<S, I, O>(stream: S, mut input: I, mut output: O) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    I: AsyncRead + Send + Unpin + 'static,
    O: AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let upload = tokio::spawn(async move {
        match tokio::io::copy(&mut input, &mut writer).await {
            Ok(n) => debug!(bytes = n, "input finished"),
            Err(e) => debug!(error = %e, "input copy stopped"),
        }
        // Hold the write half until the download side is done.
        std::future::pending::<()>().await;
    });

    let result = tokio::io::copy(&mut reader, &mut output).await;
    upload.abort();
    output.flush().await.ok();

    match result {
        Ok(n) => {
            debug!(bytes = n, "relay finished");
            Ok(())
        }
        // Servers that close without close_notify.
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(()),
        Err(e) => Err(e).context("relay failed"),
    }
}
