//! Relay handshake messages.
//!
//! A connection carries exactly one [`RelayRequest`] (client → server) followed
//! by exactly one [`RelayReply`] (server → client). After the reply the socket
//! becomes a raw byte pipe.

use crate::codec::{read_frame, write_frame};
use crate::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Protocol version this build speaks.
pub const PROTOCOL_VERSION: &str = "13.1.0";

/// Message sent back on a successful dispatch.
pub const GO_AHEAD: &str = "Go ahead, caller.";

/// Application tag prefix marking an IP cross-connect patch.
pub const CROSS_CONNECT_PREFIX: &str = "TCP-";

/// What a request asks the relay to do, derived from its `app_name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppKind {
    /// Run the platform's ping command locally.
    Ping,
    /// Run the platform's traceroute command locally.
    Traceroute,
    /// Run a configuration-collection job.
    Config,
    /// Open an onward TCP connection (cross-connect patches included).
    Relay,
}

/// A relay request as read from the wire. Never mutated after parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRequest {
    pub app_name: String,
    pub platform: String,
    pub relay_src_ip: String,
    pub relay_dst_ip: String,
    pub relay_dst_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_community: Option<String>,
    #[serde(default)]
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    pub version: String,
}

impl RelayRequest {
    pub fn kind(&self) -> AppKind {
        match self.app_name.as_str() {
            "PING" => AppKind::Ping,
            "TRACEROUTE" => AppKind::Traceroute,
            "CONFIG" => AppKind::Config,
            _ => AppKind::Relay,
        }
    }

    /// Cross-connect patches need source-IP authorization before dialing.
    pub fn is_cross_connect(&self) -> bool {
        self.app_name.starts_with(CROSS_CONNECT_PREFIX)
    }

    /// Device label for collection jobs; falls back to the destination IP.
    pub fn device(&self) -> &str {
        self.device_name
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or(&self.relay_dst_ip)
    }

    /// Whether this request's version may talk to a server that requires
    /// `required`. `"0"` (or empty) disables the check.
    pub fn is_version_compatible(&self, required: &str) -> bool {
        is_version_compatible(&self.version, required)
    }
}

/// The write community is a credential, so it never appears here.
impl fmt::Display for RelayRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RelayRequest: app={} platform={} src={} dst={}:{} domain={} options={} version={}",
            self.app_name,
            self.platform,
            self.relay_src_ip,
            self.relay_dst_ip,
            self.relay_dst_port,
            self.domain,
            self.options.as_deref().unwrap_or("-"),
            self.version,
        )
    }
}

/// The one-shot answer to a [`RelayRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayReply {
    pub success: bool,
    pub message: String,
}

impl RelayReply {
    pub fn go_ahead() -> Self {
        Self {
            success: true,
            message: GO_AHEAD.to_string(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Version compatibility relation.
///
/// Both sides are split on `.` or `_` into numeric components. When both
/// parse, the client is compatible if its version is at least `required`
/// (component-wise, missing components count as zero). Otherwise the two
/// strings must match exactly.
pub fn is_version_compatible(client: &str, required: &str) -> bool {
    let required = required.trim();
    if required.is_empty() || required == "0" {
        return true;
    }
    let client = client.trim();

    match (parse_version(client), parse_version(required)) {
        (Some(c), Some(r)) => {
            let width = c.len().max(r.len());
            let pad = |v: &[u64]| -> Vec<u64> {
                let mut v = v.to_vec();
                v.resize(width, 0);
                v
            };
            pad(&c) >= pad(&r)
        }
        _ => client == required,
    }
}

fn parse_version(s: &str) -> Option<Vec<u64>> {
    if s.is_empty() {
        return None;
    }
    s.split(['.', '_'])
        .map(|part| part.parse::<u64>().ok())
        .collect()
}

/// Read the request frame, waiting at most `timeout` for it to arrive.
///
/// The timeout only covers this call; nothing bounds later reads.
pub async fn read_request<R>(reader: &mut R, timeout: Duration) -> RelayResult<RelayRequest>
where
    R: AsyncRead + Unpin,
{
    match tokio::time::timeout(timeout, read_frame::<_, RelayRequest>(reader)).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::Timeout),
    }
}

pub async fn write_request<W>(writer: &mut W, request: &RelayRequest) -> RelayResult<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, request).await
}

/// Serialize and flush a reply frame.
pub async fn write_reply<W>(writer: &mut W, reply: &RelayReply) -> RelayResult<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, reply).await
}

pub async fn read_reply<R>(reader: &mut R) -> RelayResult<RelayReply>
where
    R: AsyncRead + Unpin,
{
    read_frame(reader).await
}
