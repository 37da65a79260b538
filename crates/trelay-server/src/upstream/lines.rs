//! Line reader for process output that may not be valid UTF-8.

use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Splits a byte stream on `\n`, decoding each line lossily.
///
/// A partially read line stays buffered across calls, so `next_line` can be
/// raced in `select!` without losing bytes.
pub struct LossyLines<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R> LossyLines<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    /// Next line without its `\n` / `\r\n` terminator. Invalid sequences
    /// become U+FFFD. `None` at end of stream.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        let n = self.reader.read_until(b'\n', &mut self.buf).await?;
        if n == 0 && self.buf.is_empty() {
            return Ok(None);
        }
        let mut end = self.buf.len();
        if self.buf[..end].ends_with(b"\n") {
            end -= 1;
            if self.buf[..end].ends_with(b"\r") {
                end -= 1;
            }
        }
        let line = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.buf.clear();
        Ok(Some(line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn invalid_bytes_are_replaced_not_fatal() {
        let mut lines = LossyLines::new(Cursor::new(b"ok\r\nbad \xff byte\nlast".to_vec()));
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("ok"));
        assert_eq!(
            lines.next_line().await.unwrap().as_deref(),
            Some("bad \u{FFFD} byte")
        );
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("last"));
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn partial_line_survives_cancellation() {
        use tokio::io::AsyncWriteExt;

        let (mut writer, reader) = tokio::io::duplex(64);
        let mut lines = LossyLines::new(reader);
        writer.write_all(b"hal").await.unwrap();
        let cancelled =
            tokio::time::timeout(std::time::Duration::from_millis(20), lines.next_line()).await;
        assert!(cancelled.is_err());

        writer.write_all(b"f line\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("half line"));
    }
}
