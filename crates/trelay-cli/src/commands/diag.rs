//! `trelay ping` / `trelay traceroute`: diagnostics run on the relay host.

use super::Invocation;
use crate::session;
use anyhow::Result;
use tracing::info;
use trelay_core::RelayRequest;

/// Which diagnostic to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnostic {
    Ping,
    Traceroute,
}

impl Diagnostic {
    fn app_name(self) -> &'static str {
        match self {
            Diagnostic::Ping => "PING",
            Diagnostic::Traceroute => "TRACEROUTE",
        }
    }
}

pub fn build_request(
    inv: &Invocation,
    diag: Diagnostic,
    dest: &str,
    source: Option<&str>,
    options: Option<&str>,
) -> RelayRequest {
    let mut request = inv.request(diag.app_name(), source.unwrap_or_default(), dest, 0);
    request.options = options.map(str::to_string);
    request
}

pub async fn run(
    inv: &Invocation,
    diag: Diagnostic,
    dest: &str,
    source: Option<&str>,
    options: Option<&str>,
) -> Result<()> {
    let request = build_request(inv, diag, dest, source, options);
    info!(app = %request.app_name, dest, "requesting diagnostic");
    session::run(&inv.target, &request).await
}
