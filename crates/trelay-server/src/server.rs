//! Core server: accepts TLS connections and runs one worker per connection.
//!
//! Owns the shared pieces every worker needs: the resolved configuration, the
//! patch authorization cache, the onward dialer and the collection runner.

use crate::auth::PatchAuthorizationCache;
use crate::config::ServerConfig;
use crate::transport::{start_listener, TlsConnection};
use crate::upstream::{CommandJobRunner, Dialer, JobRunner, TcpDialer};
use crate::worker::ConnectionWorker;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};
use trelay_core::{RelayError, RelayResult};

/// Read-only state shared by all connection workers.
pub struct RelayContext {
    pub config: Arc<ServerConfig>,
    pub patches: Arc<PatchAuthorizationCache>,
    pub dialer: Arc<dyn Dialer>,
    pub collector: Arc<dyn JobRunner>,
}

/// The trelay server instance.
pub struct RelayServer {
    ctx: Arc<RelayContext>,
}

impl RelayServer {
    /// Create a server with the default dialer and collector, loading the
    /// patch authorization file and starting its refresh task.
    pub async fn new(config: ServerConfig) -> Self {
        let patches =
            PatchAuthorizationCache::start(&config.patch_file, config.patch_refresh).await;
        info!(
            path = %config.patch_file.display(),
            entries = patches.len(),
            "patch authorization cache ready"
        );
        let collector = Arc::new(CommandJobRunner::new(&config.collector));
        Self::with_context(RelayContext {
            config: Arc::new(config),
            patches: Arc::new(patches),
            dialer: Arc::new(TcpDialer),
            collector,
        })
    }

    pub fn with_context(ctx: RelayContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    /// Listen on the configured address and serve until the listener fails.
    pub async fn run(&self, tls_config: Arc<rustls::ServerConfig>) -> RelayResult<()> {
        let config = &self.ctx.config;
        let bind_addr: SocketAddr = config
            .listen_addr()
            .parse()
            .map_err(|e| RelayError::Configuration(format!("invalid address: {e}")))?;

        let (local_addr, mut connections) = start_listener(
            bind_addr,
            config.backlog,
            tls_config,
            config.request_timeout,
        )
        .await?;
        info!(addr = %local_addr, "relay server listening");

        while let Some(conn) = connections.recv().await {
            self.spawn_worker(conn);
        }
        Ok(())
    }

    fn spawn_worker(&self, conn: TlsConnection) {
        let ctx = self.ctx.clone();
        let TlsConnection {
            stream,
            remote_addr,
        } = conn;
        tokio::spawn(async move {
            let report = ConnectionWorker::new(ctx, remote_addr).run(stream).await;
            debug!(remote = %remote_addr, states = ?report.states, "connection closed");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tls::{self_signed_pem, server_config_from_pem};
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio_rustls::rustls::pki_types::ServerName;
    use trelay_core::{read_reply, write_request, RelayRequest, PROTOCOL_VERSION};

    #[derive(Debug)]
    struct AcceptAny;

    impl rustls::client::danger::ServerCertVerifier for AcceptAny {
        fn verify_server_cert(
            &self,
            _end_entity: &rustls::pki_types::CertificateDer<'_>,
            _intermediates: &[rustls::pki_types::CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: rustls::pki_types::UnixTime,
        ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &rustls::pki_types::CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &rustls::crypto::ring::default_provider().signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &rustls::pki_types::CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &rustls::crypto::ring::default_provider().signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }

    #[tokio::test]
    async fn serves_a_request_over_tls() {
        let (cert, key) = self_signed_pem("trelay test").unwrap();
        let tls = Arc::new(server_config_from_pem(cert.as_bytes(), key.as_bytes()).unwrap());

        let config = ServerConfig {
            bind: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        };
        let ctx = RelayContext {
            collector: Arc::new(CommandJobRunner::new(&config.collector)),
            config: Arc::new(config),
            patches: Arc::new(PatchAuthorizationCache::new("/nonexistent/patches.txt")),
            dialer: Arc::new(TcpDialer),
        };
        let (addr, mut connections) =
            start_listener("127.0.0.1:0".parse().unwrap(), 10, tls, Duration::from_secs(5))
                .await
                .unwrap();
        let server = RelayServer::with_context(ctx);
        tokio::spawn(async move {
            while let Some(conn) = connections.recv().await {
                server.spawn_worker(conn);
            }
        });

        let client_config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAny))
        .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));
        let tcp = TcpStream::connect(addr).await.unwrap();
        let mut tls = connector
            .connect(ServerName::try_from("localhost").unwrap(), tcp)
            .await
            .unwrap();

        let request = RelayRequest {
            app_name: "TCP-23".into(),
            platform: "IOS".into(),
            relay_src_ip: "10.1.1.1".into(),
            relay_dst_ip: "10.2.2.2".into(),
            relay_dst_port: 23,
            options: None,
            write_community: None,
            domain: String::new(),
            device_name: None,
            version: PROTOCOL_VERSION.into(),
        };
        write_request(&mut tls, &request).await.unwrap();
        let reply = read_reply(&mut tls).await.unwrap();
        assert!(!reply.success);
        assert!(reply.message.starts_with("TCP patching request TCP-23"));
    }
}
