//! `trelay config`: collect a device configuration through the relay.

use super::Invocation;
use crate::session;
use anyhow::Result;
use tracing::info;
use trelay_core::RelayRequest;

/// Collection job parameters.
#[derive(Debug, Clone)]
pub struct CollectArgs {
    pub device_ip: String,
    pub source: String,
    pub protocol: String,
    pub config_type: String,
    pub file: String,
    pub community: Option<String>,
    pub device_name: Option<String>,
}

pub fn build_request(inv: &Invocation, args: &CollectArgs) -> Result<RelayRequest> {
    for (name, value) in [
        ("protocol", &args.protocol),
        ("type", &args.config_type),
        ("file", &args.file),
    ] {
        if value.is_empty() || value.contains(':') {
            anyhow::bail!("invalid {name} '{value}'");
        }
    }
    let mut request = inv.request("CONFIG", &args.source, &args.device_ip, 0);
    request.options = Some(format!(
        "{}:{}:{}",
        args.protocol, args.config_type, args.file
    ));
    request.write_community = args.community.clone();
    request.device_name = args.device_name.clone();
    Ok(request)
}

pub async fn run(inv: &Invocation, args: &CollectArgs) -> Result<()> {
    let request = build_request(inv, args)?;
    info!(device = %request.device(), file = %args.file, "requesting config collection");
    session::run(&inv.target, &request).await
}
