//! Per-connection state machine.
//!
//! ```text
//! AwaitRequest → ValidateVersion → [Authorize] → Dispatch → UpstreamReady
//!              → ReplySent → Relaying → Closed
//! ```
//!
//! Any failure before `ReplySent` answers with a failure reply and closes.
//! Failures after that point only release resources: the reply has already
//! been used.

use crate::relay::{relay, RelayMode, RelayOutcome};
use crate::server::RelayContext;
use crate::upstream::{self, CollectionJob, Upstream};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};
use trelay_core::{
    read_request, write_reply, AppKind, RelayError, RelayReply, RelayRequest, RelayResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    AwaitRequest,
    ValidateVersion,
    Authorize,
    Dispatch,
    UpstreamReady,
    ReplySent,
    Relaying,
    Closed,
}

/// What happened on one connection.
#[derive(Debug)]
pub struct WorkerReport {
    /// Every state entered, in order.
    pub states: Vec<WorkerState>,
    pub outcome: Option<RelayOutcome>,
}

/// The reply can be written at most once per connection.
#[derive(Debug, Default)]
pub struct ReplyOnce {
    sent: bool,
}

impl ReplyOnce {
    /// Write `reply` unless one was already sent. Returns whether it wrote.
    pub async fn send<W>(&mut self, writer: &mut W, reply: &RelayReply) -> RelayResult<bool>
    where
        W: AsyncWrite + Unpin,
    {
        if self.sent {
            debug!(success = reply.success, "reply already sent, dropping");
            return Ok(false);
        }
        self.sent = true;
        write_reply(writer, reply).await?;
        Ok(true)
    }

    pub fn is_sent(&self) -> bool {
        self.sent
    }
}

pub struct ConnectionWorker {
    ctx: Arc<RelayContext>,
    remote: SocketAddr,
    states: Vec<WorkerState>,
}

impl ConnectionWorker {
    pub fn new(ctx: Arc<RelayContext>, remote: SocketAddr) -> Self {
        Self {
            ctx,
            remote,
            states: vec![WorkerState::AwaitRequest],
        }
    }

    fn enter(&mut self, state: WorkerState) {
        debug!(remote = %self.remote, ?state, "worker state");
        self.states.push(state);
    }

    /// Serve one connection to completion.
    pub async fn run<C>(mut self, mut client: C) -> WorkerReport
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let request = match read_request(&mut client, self.ctx.config.request_timeout).await {
            Ok(request) => request,
            Err(e) => {
                debug!(remote = %self.remote, error = %e, "no usable request");
                return self.close(client).await;
            }
        };
        info!(remote = %self.remote, %request, "relay request");

        let mut reply = ReplyOnce::default();
        let upstream = match self.prepare(&request).await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(remote = %self.remote, app = %request.app_name, error = %e, "request failed");
                if e.is_reportable() {
                    let failure = RelayReply::failure(e.reply_message());
                    if let Err(e) = reply.send(&mut client, &failure).await {
                        debug!(remote = %self.remote, error = %e, "failure reply not delivered");
                    }
                }
                return self.close(client).await;
            }
        };
        self.enter(WorkerState::UpstreamReady);

        if let Err(e) = reply.send(&mut client, &RelayReply::go_ahead()).await {
            warn!(remote = %self.remote, error = %e, "go-ahead not delivered");
            upstream.close().await;
            return self.close(client).await;
        }
        self.enter(WorkerState::ReplySent);

        let mode = if request.kind() == AppKind::Traceroute {
            RelayMode::Lines
        } else {
            RelayMode::Stream
        };
        self.enter(WorkerState::Relaying);
        let outcome = relay(client, upstream, mode).await;
        self.enter(WorkerState::Closed);
        WorkerReport {
            states: self.states,
            outcome: Some(outcome),
        }
    }

    /// Validate, authorize and obtain the upstream.
    async fn prepare(&mut self, request: &RelayRequest) -> RelayResult<Upstream> {
        let config = self.ctx.config.clone();

        self.enter(WorkerState::ValidateVersion);
        if !request.is_version_compatible(&config.compatibility_version) {
            return Err(RelayError::VersionMismatch {
                client: request.version.clone(),
                required: config.compatibility_version.clone(),
            });
        }

        match request.kind() {
            AppKind::Ping | AppKind::Traceroute => {
                self.enter(WorkerState::Dispatch);
                upstream::spawn_command(&config, request)
            }
            AppKind::Config => {
                self.enter(WorkerState::Dispatch);
                let job = CollectionJob::from_request(request, &config.collector)?;
                Ok(upstream::collector::open_collection(
                    job,
                    self.ctx.collector.clone(),
                    config.collector.clone(),
                ))
            }
            AppKind::Relay => {
                if request.is_cross_connect() {
                    self.enter(WorkerState::Authorize);
                    if !self.ctx.patches.is_authorized(&request.relay_src_ip) {
                        warn!(remote = %self.remote, %request, "cross-connect rejected");
                        return Err(RelayError::PatchingNotSupported {
                            app_name: request.app_name.clone(),
                        });
                    }
                    info!(remote = %self.remote, %request, "cross-connect accepted");
                }
                self.enter(WorkerState::Dispatch);
                self.ctx
                    .dialer
                    .dial(
                        &request.relay_src_ip,
                        &request.relay_dst_ip,
                        request.relay_dst_port,
                    )
                    .await
            }
        }
    }

    /// Close without relaying.
    async fn close<C>(mut self, mut client: C) -> WorkerReport
    where
        C: AsyncWrite + Unpin,
    {
        if let Err(e) = client.shutdown().await {
            debug!(remote = %self.remote, error = %e, "client shutdown");
        }
        drop(client);
        self.enter(WorkerState::Closed);
        WorkerReport {
            states: self.states,
            outcome: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::PatchAuthorizationCache;
    use crate::config::ServerConfig;
    use crate::upstream::{CommandJobRunner, Dialer, UpstreamKind};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use trelay_core::{read_reply, write_request, PROTOCOL_VERSION};

    /// Counts dial attempts and hands out one in-memory peer.
    #[derive(Default)]
    struct CountingDialer {
        calls: AtomicUsize,
        upstream_end: Mutex<Option<DuplexStream>>,
    }

    impl Dialer for CountingDialer {
        fn dial<'a>(
            &'a self,
            _src: &'a str,
            dst: &'a str,
            port: u16,
        ) -> Pin<Box<dyn Future<Output = RelayResult<Upstream>> + Send + 'a>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let end = self.upstream_end.lock().unwrap().take();
            Box::pin(async move {
                match end {
                    Some(end) => Ok(Upstream::from_stream(UpstreamKind::Socket, end)),
                    None => Err(RelayError::UpstreamUnavailable(format!(
                        "{dst}:{port}: connection refused"
                    ))),
                }
            })
        }
    }

    fn context(
        config: ServerConfig,
        patches: PatchAuthorizationCache,
        dialer: Arc<CountingDialer>,
    ) -> Arc<RelayContext> {
        let collector = Arc::new(CommandJobRunner::new(&config.collector));
        Arc::new(RelayContext {
            config: Arc::new(config),
            patches: Arc::new(patches),
            dialer,
            collector,
        })
    }

    fn request(app: &str, platform: &str) -> RelayRequest {
        RelayRequest {
            app_name: app.into(),
            platform: platform.into(),
            relay_src_ip: "10.1.1.1".into(),
            relay_dst_ip: "10.2.2.2".into(),
            relay_dst_port: 23,
            options: None,
            write_community: None,
            domain: "LOCAL".into(),
            device_name: None,
            version: PROTOCOL_VERSION.into(),
        }
    }

    fn remote() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    async fn exchange(
        ctx: Arc<RelayContext>,
        req: &RelayRequest,
    ) -> (RelayReply, DuplexStream, tokio::task::JoinHandle<WorkerReport>) {
        let (mut client, server_end) = duplex(4096);
        let worker = tokio::spawn(ConnectionWorker::new(ctx, remote()).run(server_end));
        write_request(&mut client, req).await.unwrap();
        let reply = read_reply(&mut client).await.unwrap();
        (reply, client, worker)
    }

    #[tokio::test]
    async fn unauthorized_cross_connect_never_dials() {
        let dialer = Arc::new(CountingDialer::default());
        let ctx = context(
            ServerConfig::default(),
            PatchAuthorizationCache::new("/nonexistent/patches.txt"),
            dialer.clone(),
        );

        let (reply, mut client, worker) = exchange(ctx, &request("TCP-23", "IOS")).await;
        assert!(!reply.success);
        assert_eq!(
            reply.message,
            "TCP patching request TCP-23 is not supported. Please contact your key user"
        );
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let report = worker.await.unwrap();
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 0);
        assert!(report.states.contains(&WorkerState::Authorize));
        assert!(!report.states.contains(&WorkerState::Dispatch));
        assert_eq!(report.states.last(), Some(&WorkerState::Closed));
    }

    #[tokio::test]
    async fn authorized_cross_connect_relays() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("PatchInterfaceDB.txt");
        std::fs::write(&path, "SRCIP\t10.1.1.1\n").unwrap();
        let patches = PatchAuthorizationCache::start(&path, Duration::from_secs(60)).await;

        let (mut peer, upstream_end) = duplex(4096);
        let dialer = Arc::new(CountingDialer {
            calls: AtomicUsize::new(0),
            upstream_end: Mutex::new(Some(upstream_end)),
        });
        let ctx = context(ServerConfig::default(), patches, dialer.clone());

        let (reply, mut client, worker) = exchange(ctx, &request("TCP-23", "IOS")).await;
        assert_eq!(reply, RelayReply::go_ahead());

        client.write_all(b"login\n").await.unwrap();
        let mut buf = [0u8; 6];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"login\n");
        drop(peer);

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();

        let report = worker.await.unwrap();
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            report.states,
            vec![
                WorkerState::AwaitRequest,
                WorkerState::ValidateVersion,
                WorkerState::Authorize,
                WorkerState::Dispatch,
                WorkerState::UpstreamReady,
                WorkerState::ReplySent,
                WorkerState::Relaying,
                WorkerState::Closed,
            ]
        );
        assert_eq!(report.outcome.unwrap().to_upstream, 6);
    }

    #[tokio::test]
    async fn plain_relay_skips_authorization() {
        let dialer = Arc::new(CountingDialer::default());
        let ctx = context(
            ServerConfig::default(),
            PatchAuthorizationCache::new("/nonexistent/patches.txt"),
            dialer.clone(),
        );

        let (reply, _client, worker) = exchange(ctx, &request("TELNET", "IOS")).await;
        assert!(!reply.success);
        assert_eq!(reply.message, "10.2.2.2:23: connection refused");
        let report = worker.await.unwrap();
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 1);
        assert!(!report.states.contains(&WorkerState::Authorize));
    }

    #[tokio::test]
    async fn version_mismatch_fails_before_dispatch() {
        let dialer = Arc::new(CountingDialer::default());
        let config = ServerConfig {
            compatibility_version: "14.0".into(),
            ..Default::default()
        };
        let ctx = context(
            config,
            PatchAuthorizationCache::new("/nonexistent/patches.txt"),
            dialer.clone(),
        );

        let (reply, _client, worker) = exchange(ctx, &request("TELNET", "IOS")).await;
        assert!(!reply.success);
        assert!(reply.message.contains("13.1.0"));
        assert!(reply.message.contains("14.0"));
        let report = worker.await.unwrap();
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 0);
        assert!(!report.states.contains(&WorkerState::Dispatch));
    }

    #[tokio::test]
    async fn missing_command_template_is_reported() {
        let ctx = context(
            ServerConfig::default(),
            PatchAuthorizationCache::new("/nonexistent/patches.txt"),
            Arc::new(CountingDialer::default()),
        );
        let (reply, _client, worker) = exchange(ctx, &request("PING", "IOS")).await;
        assert_eq!(reply, RelayReply::failure("PING COMMAND not defined for IOS"));
        assert!(worker.await.unwrap().outcome.is_none());
    }

    #[tokio::test]
    async fn garbage_request_closes_without_reply() {
        let ctx = context(
            ServerConfig::default(),
            PatchAuthorizationCache::new("/nonexistent/patches.txt"),
            Arc::new(CountingDialer::default()),
        );
        let (mut client, server_end) = duplex(1024);
        let worker = tokio::spawn(ConnectionWorker::new(ctx, remote()).run(server_end));
        client.write_all(&[0, 0, 0, 2, 0xff, 0xff]).await.unwrap();

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        let report = worker.await.unwrap();
        assert_eq!(
            report.states,
            vec![WorkerState::AwaitRequest, WorkerState::Closed]
        );
    }

    #[tokio::test]
    async fn silent_client_times_out_without_reply() {
        let config = ServerConfig {
            request_timeout: Duration::from_millis(30),
            ..Default::default()
        };
        let ctx = context(
            config,
            PatchAuthorizationCache::new("/nonexistent/patches.txt"),
            Arc::new(CountingDialer::default()),
        );
        let (mut client, server_end) = duplex(1024);
        let worker = tokio::spawn(ConnectionWorker::new(ctx, remote()).run(server_end));

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert!(worker.await.unwrap().outcome.is_none());
    }

    #[tokio::test]
    async fn reply_is_written_at_most_once() {
        let (mut client, mut server_end) = duplex(1024);
        let mut reply = ReplyOnce::default();
        assert!(reply
            .send(&mut server_end, &RelayReply::go_ahead())
            .await
            .unwrap());
        assert!(!reply
            .send(&mut server_end, &RelayReply::failure("late"))
            .await
            .unwrap());
        assert!(reply.is_sent());
        drop(server_end);

        assert_eq!(read_reply(&mut client).await.unwrap(), RelayReply::go_ahead());
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn ping_command_output_is_relayed() {
        let mut config = ServerConfig::default();
        config
            .commands
            .insert("IOSPINGCOMMAND".into(), "echo pong <DESTIP>".into());
        let ctx = context(
            config,
            PatchAuthorizationCache::new("/nonexistent/patches.txt"),
            Arc::new(CountingDialer::default()),
        );

        let (reply, mut client, worker) = exchange(ctx, &request("PING", "IOS")).await;
        assert_eq!(reply, RelayReply::go_ahead());
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "pong 10.2.2.2\n");
        let report = worker.await.unwrap();
        assert!(report.outcome.unwrap().exit_status.is_some());
    }
}
