//! TLS listener using tokio-rustls.
//!
//! Accepts TCP connections with the configured backlog, runs the TLS
//! handshake per connection in its own task and hands finished streams to
//! the server through a channel.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use trelay_core::{RelayError, RelayResult};

/// A handle to an accepted TLS connection.
pub struct TlsConnection {
    pub stream: TlsStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Bind `bind_addr` and start accepting.
///
/// Returns the bound address (useful with port 0) and a receiver that yields
/// connections whose handshake completed within `handshake_timeout`. The
/// accept loop stops once the receiver is dropped.
pub async fn start_listener(
    bind_addr: SocketAddr,
    backlog: u32,
    tls_config: Arc<rustls::ServerConfig>,
    handshake_timeout: Duration,
) -> RelayResult<(SocketAddr, mpsc::Receiver<TlsConnection>)> {
    let socket = if bind_addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket
        .bind(bind_addr)
        .map_err(|e| RelayError::Configuration(format!("bind {bind_addr} failed: {e}")))?;
    let listener = socket.listen(backlog.max(1))?;
    let local_addr = listener.local_addr()?;

    info!(addr = %local_addr, backlog, "TLS listener started");

    let acceptor = TlsAcceptor::from(tls_config);
    let (tx, rx) = mpsc::channel::<TlsConnection>(64);

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = tx.closed() => break,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        match tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await {
                            Ok(Ok(stream)) => {
                                debug!(remote = %addr, "TLS connection accepted");
                                let conn = TlsConnection {
                                    stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("TLS connection channel closed");
                                }
                            }
                            Ok(Err(e)) => {
                                warn!(remote = %addr, error = %e, "TLS handshake failed");
                            }
                            Err(_) => {
                                warn!(remote = %addr, "TLS handshake timed out");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
        debug!("TLS listener stopped");
    });

    Ok((local_addr, rx))
}

/// Load TLS certificate and key from PEM files into a rustls server config.
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> RelayResult<rustls::ServerConfig> {
    let cert_pem = std::fs::read(cert_path).map_err(|e| {
        RelayError::Configuration(format!("cannot read cert {}: {e}", cert_path.display()))
    })?;
    let key_pem = std::fs::read(key_path).map_err(|e| {
        RelayError::Configuration(format!("cannot read key {}: {e}", key_path.display()))
    })?;
    server_config_from_pem(&cert_pem, &key_pem)
}

pub fn server_config_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> RelayResult<rustls::ServerConfig> {
    let tls_error = |e: &dyn std::fmt::Display| RelayError::Configuration(format!("TLS: {e}"));

    let certs: Vec<rustls::pki_types::CertificateDer<'static>> =
        rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| tls_error(&e))?;
    if certs.is_empty() {
        return Err(RelayError::Configuration("TLS: no certificate found in PEM".into()));
    }
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| tls_error(&e))?
        .ok_or_else(|| RelayError::Configuration("TLS: no private key found in PEM".into()))?;

    rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| tls_error(&e))?
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .map_err(|e| tls_error(&e))
}

/// Self-signed certificate and key, both PEM encoded.
pub fn self_signed_pem(common_name: &str) -> RelayResult<(String, String)> {
    let gen_error = |e: rcgen::Error| RelayError::Configuration(format!("certificate generation: {e}"));
    let mut params = rcgen::CertificateParams::new(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ])
    .map_err(gen_error)?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, common_name);

    let key_pair = rcgen::KeyPair::generate().map_err(gen_error)?;
    let cert = params.self_signed(&key_pair).map_err(gen_error)?;
    Ok((cert.pem(), key_pair.serialize_pem()))
}
