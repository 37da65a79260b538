//! Length-prefixed CBOR framing for the relay handshake.
//!
//! Wire format: `[4-byte big-endian length][CBOR payload]`

use crate::error::{RelayError, RelayResult};
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single handshake frame. Requests are a handful of short
/// strings, so anything larger is treated as garbage on the wire.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Encode a serializable value into a length-prefixed CBOR frame.
pub fn frame_encode<T: serde::Serialize>(value: &T) -> RelayResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;

    if payload.len() > MAX_FRAME_LEN {
        return Err(RelayError::Codec(format!(
            "frame of {} bytes exceeds limit of {MAX_FRAME_LEN}",
            payload.len()
        )));
    }

    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Decode a CBOR payload (without length prefix) into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> RelayResult<T> {
    let cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(cursor)?;
    Ok(value)
}

/// Read one complete frame and decode it.
///
/// A clean EOF before the length prefix and a truncated payload both surface
/// as [`RelayError::Protocol`].
pub async fn read_frame<R, T>(reader: &mut R) -> RelayResult<T>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| RelayError::Protocol(format!("reading frame length: {e}")))?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(RelayError::Protocol(format!("invalid frame length {len}")));
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| RelayError::Protocol(format!("reading frame payload: {e}")))?;

    cbor_decode(&payload)
}

/// Encode a value, write it as one frame and flush.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> RelayResult<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let frame = frame_encode(value)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
