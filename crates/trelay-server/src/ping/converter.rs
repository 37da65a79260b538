//! Traceroute → ping transcript adapter.
//!
//! Some platforms have no working `ping`, so the relay runs `traceroute` and
//! rewrites its output to read like a Windows ping transcript. The adapter is
//! pull driven: every [`ByteSource::read`] call loops over three phases until
//! it has bytes to hand back or the process output is exhausted.
//!
//! 1. **Acquire**: fetch the next non-blank line. On unix traceroute the
//!    header line goes to stderr, so the first acquire waits up to a grace
//!    window for stderr before falling back to stdout.
//! 2. **Transform**: the header yields the target IP plus TTL and packet-size
//!    hints; every later hop line goes through [`PingStats`].
//! 3. **Emit**: queued synthetic lines are returned one per read call.

use super::stats::PingStats;
use crate::upstream::{BoxRead, ByteSource, LossyLines};
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_TTL: u32 = 30;
const DEFAULT_PACKET_SIZE: u32 = 40;

/// Hop lines with this many tokens or fewer are padding.
const MIN_HOP_TOKENS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for the traceroute header line.
    Header,
    /// Header seen; consuming hop lines.
    Hops,
    /// Source exhausted (or unusable); drain the queue then report EOF.
    Finished,
}

/// Target details taken from the traceroute header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceHeader {
    pub target: IpAddr,
    pub ttl: u32,
    pub packet_size: u32,
}

/// Rewrites traceroute output into a ping transcript.
pub struct TraceToPing {
    stdout: LossyLines<BoxRead>,
    stderr: Option<LossyLines<BoxRead>>,
    /// `Some` when the header may arrive on stderr.
    header_grace: Option<Duration>,
    phase: Phase,
    header: Option<TraceHeader>,
    pending: VecDeque<Vec<u8>>,
    /// Bytes of `pending.front()` already handed out.
    offset: usize,
}

impl TraceToPing {
    /// Wrap a traceroute process's output streams.
    ///
    /// `header_grace` enables the stderr header race; pass `None` on
    /// platforms whose traceroute prints everything on stdout.
    pub fn new(stdout: BoxRead, stderr: Option<BoxRead>, header_grace: Option<Duration>) -> Self {
        Self {
            stdout: LossyLines::new(stdout),
            stderr: stderr.map(LossyLines::new),
            header_grace,
            phase: Phase::Header,
            header: None,
            pending: VecDeque::new(),
            offset: 0,
        }
    }

    /// Produce the next chunk of transcript. `Ok(0)` means end of stream.
    pub async fn next_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let n = self.emit(buf);
            if n > 0 {
                return Ok(n);
            }
            match self.phase {
                Phase::Finished => return Ok(0),
                Phase::Header => {
                    let header = self.acquire_header().await;
                    self.release_stderr();
                    match header? {
                        Some(line) => self.on_header(&line),
                        None => self.phase = Phase::Finished,
                    }
                }
                Phase::Hops => match next_non_blank(&mut self.stdout).await? {
                    Some(line) => self.on_hop(&line),
                    None => self.phase = Phase::Finished,
                },
            }
        }
    }

    async fn acquire_header(&mut self) -> io::Result<Option<String>> {
        if let (Some(grace), Some(stderr)) = (self.header_grace, self.stderr.as_mut()) {
            let deadline = tokio::time::Instant::now() + grace;
            loop {
                match tokio::time::timeout_at(deadline, stderr.next_line()).await {
                    Ok(Ok(Some(line))) if !line.trim().is_empty() => {
                        debug!("traceroute header read from stderr");
                        return Ok(Some(line));
                    }
                    Ok(Ok(Some(_))) => continue,
                    Ok(Ok(None)) | Ok(Err(_)) | Err(_) => break,
                }
            }
        }
        next_non_blank(&mut self.stdout).await
    }

    /// Stderr is only wanted for the header. Keep draining it in the
    /// background so a chatty process never blocks on a full pipe.
    fn release_stderr(&mut self) {
        let Some(mut stderr) = self.stderr.take() else {
            return;
        };
        tokio::spawn(async move {
            loop {
                match stderr.next_line().await {
                    Ok(Some(line)) => debug!(%line, "traceroute stderr"),
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = %e, "traceroute stderr unreadable");
                        break;
                    }
                }
            }
        });
    }

    fn on_header(&mut self, line: &str) {
        match parse_header(line) {
            Some(header) => {
                self.queue(format!(
                    "Pinging {} with {} bytes of data :\n\n",
                    header.target, header.packet_size
                ));
                self.header = Some(header);
                self.phase = Phase::Hops;
            }
            None => {
                warn!(line = %line.trim(), "no target address in traceroute header");
                self.phase = Phase::Finished;
            }
        }
    }

    fn on_hop(&mut self, line: &str) {
        let Some(header) = self.header.clone() else {
            return;
        };
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() <= MIN_HOP_TOKENS {
            return;
        }

        let target = header.target.to_string();
        let stats = PingStats::from_hop(&fields, &target);
        if stats.resolved_ip.is_none() {
            return;
        }

        for sample in &stats.samples {
            self.queue(format!(
                "Reply from {}: bytes = {} time={}ms TTL={}\n",
                target, header.packet_size, sample, header.ttl
            ));
        }
        self.queue(format!("\n{stats}"));
    }

    fn queue(&mut self, line: String) {
        self.pending.push_back(line.into_bytes());
    }

    /// Copy (part of) the front queued line into `buf`.
    fn emit(&mut self, buf: &mut [u8]) -> usize {
        let Some(front) = self.pending.front() else {
            return 0;
        };
        let rest = &front[self.offset..];
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        self.offset += n;
        if self.offset >= front.len() {
            self.pending.pop_front();
            self.offset = 0;
        }
        n
    }
}

impl ByteSource for TraceToPing {
    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<usize>> + Send + 'a>> {
        Box::pin(self.next_chunk(buf))
    }
}

async fn next_non_blank(lines: &mut LossyLines<BoxRead>) -> io::Result<Option<String>> {
    while let Some(line) = lines.next_line().await? {
        if !line.trim().is_empty() {
            return Ok(Some(line));
        }
    }
    Ok(None)
}

/// Pull the target address and the `<n> hops` / `<n> byte` hints from a
/// traceroute header such as
/// `traceroute to 10.0.0.5 (10.0.0.5), 30 hops max, 40 byte packets`.
pub fn parse_header(line: &str) -> Option<TraceHeader> {
    let mut target = None;
    let mut ttl = DEFAULT_TTL;
    let mut packet_size = DEFAULT_PACKET_SIZE;
    let mut previous: Option<u32> = None;

    for raw in line.split_whitespace() {
        let token = raw.trim_matches(|c: char| matches!(c, '(' | ')' | '[' | ']' | ','));
        if target.is_none() {
            if let Ok(ip) = token.parse::<IpAddr>() {
                target = Some(ip);
                previous = None;
                continue;
            }
        }
        match previous {
            Some(n) if token.eq_ignore_ascii_case("hops") => ttl = n,
            Some(n) if token.eq_ignore_ascii_case("byte") || token.eq_ignore_ascii_case("bytes") => {
                packet_size = n
            }
            _ => {}
        }
        previous = token.parse::<u32>().ok();
    }

    target.map(|target| TraceHeader {
        target,
        ttl,
        packet_size,
    })
}
