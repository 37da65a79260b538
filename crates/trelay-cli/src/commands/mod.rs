//! CLI subcommand implementations.

pub mod collect;
pub mod connect;
pub mod diag;

use crate::session::Target;
use trelay_core::{RelayRequest, PROTOCOL_VERSION};

/// Settings shared by every subcommand, resolved from flags and config.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub target: Target,
    pub platform: String,
    pub domain: String,
}

impl Invocation {
    /// A request carrying this client's platform, domain and version.
    pub fn request(&self, app_name: &str, src: &str, dst: &str, port: u16) -> RelayRequest {
        RelayRequest {
            app_name: app_name.to_string(),
            platform: self.platform.clone(),
            relay_src_ip: src.to_string(),
            relay_dst_ip: dst.to_string(),
            relay_dst_port: port,
            options: None,
            write_community: None,
            domain: self.domain.clone(),
            device_name: None,
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

#[cfg(test)]
pub(crate) fn invocation() -> Invocation {
    Invocation {
        target: Target {
            host: "localhost".into(),
            port: 44276,
            trust: crate::tls::Trust::Insecure,
        },
        platform: "VCMS".into(),
        domain: "lab".into(),
    }
}
