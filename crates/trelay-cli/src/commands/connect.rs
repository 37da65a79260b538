//! `trelay connect`: open a TCP patch through the relay.

use super::Invocation;
use crate::session;
use anyhow::Result;
use tracing::info;
use trelay_core::{RelayRequest, CROSS_CONNECT_PREFIX};

pub fn build_request(
    inv: &Invocation,
    dest: &str,
    port: u16,
    source: Option<&str>,
    app: Option<&str>,
) -> RelayRequest {
    let app_name = match app {
        Some(app) => app.to_string(),
        None => format!("{CROSS_CONNECT_PREFIX}{port}"),
    };
    inv.request(&app_name, source.unwrap_or_default(), dest, port)
}

pub async fn run(
    inv: &Invocation,
    dest: &str,
    port: u16,
    source: Option<&str>,
    app: Option<&str>,
) -> Result<()> {
    let request = build_request(inv, dest, port, source, app);
    info!(app = %request.app_name, dest, port, "requesting connection");
    session::run(&inv.target, &request).await
}
