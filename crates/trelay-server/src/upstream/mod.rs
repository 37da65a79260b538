//! Upstream byte sources a connection can be relayed to.
//!
//! Three concrete kinds exist: a spawned diagnostic process (optionally
//! wrapped by the ping adapter), a configuration-collection job stream and an
//! onward TCP socket. The worker and relay engine only ever see [`Upstream`].

pub mod collector;
pub mod lines;
pub mod process;
pub mod socket;

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::ExitStatus;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::debug;

pub use collector::{CollectionJob, CommandJobRunner, JobRunner};
pub use lines::LossyLines;
pub use process::spawn_command;
pub use socket::{Dialer, TcpDialer};

pub type BoxRead = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Pull side of an upstream.
pub trait ByteSource: Send {
    /// Read up to `buf.len()` bytes. Returns number of bytes read, 0 = EOF.
    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<usize>> + Send + 'a>>;
}

/// Adapts any [`AsyncRead`] into a [`ByteSource`].
pub struct ReadSource<R>(pub R);

impl<R> ByteSource for ReadSource<R>
where
    R: AsyncRead + Send + Unpin,
{
    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<usize>> + Send + 'a>> {
        Box::pin(self.0.read(buf))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamKind {
    Process,
    Collection,
    Socket,
}

/// An exclusively owned upstream resource.
pub struct Upstream {
    pub kind: UpstreamKind,
    pub source: Box<dyn ByteSource>,
    pub sink: BoxWrite,
    /// Separate error stream, forwarded line by line in line-buffered relays.
    pub side: Option<BoxRead>,
    pub teardown: Teardown,
}

impl Upstream {
    /// Wrap a plain duplex stream with nothing else to release.
    pub fn from_stream<S>(kind: UpstreamKind, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        Self {
            kind,
            source: Box::new(ReadSource(read)),
            sink: Box::new(write),
            side: None,
            teardown: Teardown::default(),
        }
    }

    /// Release everything without relaying (reply could not be delivered).
    pub async fn close(self) -> Option<ExitStatus> {
        let Upstream {
            kind,
            source,
            sink,
            side,
            teardown,
        } = self;
        drop((source, sink, side));
        debug!(?kind, "closing upstream");
        teardown.run().await
    }
}

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upstream")
            .field("kind", &self.kind)
            .field("side", &self.side.is_some())
            .finish_non_exhaustive()
    }
}

/// Resources behind an upstream that outlive its streams.
#[derive(Default)]
pub struct Teardown {
    child: Option<Child>,
    job: Option<JoinHandle<()>>,
}

impl Teardown {
    pub fn process(child: Child) -> Self {
        Self {
            child: Some(child),
            job: None,
        }
    }

    pub fn job(handle: JoinHandle<()>) -> Self {
        Self {
            child: None,
            job: Some(handle),
        }
    }

    /// Stop the background job and kill the process if it is still running.
    /// Consumes `self`, so it can only happen once.
    pub async fn run(mut self) -> Option<ExitStatus> {
        if let Some(job) = self.job.take() {
            job.abort();
        }
        let mut child = self.child.take()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status),
            _ => {
                if let Err(e) = child.start_kill() {
                    debug!(error = %e, "kill failed");
                }
                child.wait().await.ok()
            }
        }
    }
}
