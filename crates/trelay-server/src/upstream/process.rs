//! Local diagnostic commands (PING / TRACEROUTE).

use super::{BoxRead, ReadSource, Teardown, Upstream, UpstreamKind};
use crate::config::ServerConfig;
use crate::ping::TraceToPing;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};
use trelay_core::{AppKind, RelayError, RelayRequest, RelayResult};

/// Platform whose PING is emulated with traceroute.
const EMULATED_PING_PLATFORM: &str = "VCMS";
const TRACEROUTE_PREFIXES: [&str; 2] = ["/usr/sbin/traceroute", "tracert"];

/// A command ready to execute: template resolved, split on whitespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
    /// Full rendered text, for logging and ping-emulation detection.
    pub rendered: String,
}

impl CommandLine {
    /// Resolve the `<PLATFORM><APPNAME>COMMAND` template for `request`.
    pub fn for_request(config: &ServerConfig, request: &RelayRequest) -> RelayResult<Self> {
        let template = config
            .command_template(&request.platform, &request.app_name)
            .ok_or_else(|| {
                RelayError::Configuration(format!(
                    "{} COMMAND not defined for {}",
                    request.app_name, request.platform
                ))
            })?;
        let rendered = render(template, request)?;

        let mut words = rendered.split_whitespace().map(str::to_string);
        let program = words.next().ok_or_else(|| {
            RelayError::Configuration(format!(
                "{} COMMAND for {} is empty",
                request.app_name, request.platform
            ))
        })?;
        Ok(Self {
            program,
            args: words.collect(),
            rendered,
        })
    }

    /// PING on the emulating platform, implemented by a traceroute binary.
    pub fn emulates_ping(&self, request: &RelayRequest) -> bool {
        request.kind() == AppKind::Ping
            && request.platform == EMULATED_PING_PLATFORM
            && TRACEROUTE_PREFIXES
                .iter()
                .any(|prefix| self.rendered.starts_with(prefix))
    }
}

/// Apply `key=value` options, then the address placeholders.
pub fn render(template: &str, request: &RelayRequest) -> RelayResult<String> {
    let mut command = template.to_string();
    for (key, value) in parse_options(request.options.as_deref())? {
        command = command.replace(key, value);
    }
    Ok(command
        .replace("<DESTIP>", &request.relay_dst_ip)
        .replace("<SOURCEIP>", &request.relay_src_ip))
}

/// Split a comma separated `key=value` list. Blank entries are skipped.
pub fn parse_options(options: Option<&str>) -> RelayResult<Vec<(&str, &str)>> {
    let Some(options) = options else {
        return Ok(Vec::new());
    };
    options
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => Ok((key.trim(), value.trim())),
            _ => Err(RelayError::InvalidRequest(format!(
                "malformed option '{pair}', expected key=value"
            ))),
        })
        .collect()
}

/// Spawn the diagnostic command for `request` and expose it as an upstream.
///
/// TRACEROUTE keeps stderr as a side stream. Emulated ping hands both pipes
/// to [`TraceToPing`]. Plain PING discards stderr.
pub fn spawn_command(config: &ServerConfig, request: &RelayRequest) -> RelayResult<Upstream> {
    let command = CommandLine::for_request(config, request)?;
    let emulate = command.emulates_ping(request);
    let keep_stderr = reads_stderr(config, request, emulate);

    info!(command = %command.rendered, emulate, "spawning diagnostic command");
    let mut child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(if keep_stderr {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            RelayError::UpstreamUnavailable(format!("cannot start {}: {e}", command.program))
        })?;
    debug!(pid = ?child.id(), "diagnostic command started");

    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        return Err(RelayError::UpstreamUnavailable(
            "process pipes unavailable".into(),
        ));
    };
    let stderr = child.stderr.take().map(|e| Box::new(e) as BoxRead);
    let stdout: BoxRead = Box::new(stdout);

    let (source, side): (Box<dyn super::ByteSource>, _) = if emulate {
        let grace = config.header_on_stderr().then_some(config.header_grace);
        (Box::new(TraceToPing::new(stdout, stderr, grace)), None)
    } else {
        (Box::new(ReadSource(stdout)), stderr)
    };

    Ok(Upstream {
        kind: UpstreamKind::Process,
        source,
        sink: Box::new(stdin),
        side,
        teardown: Teardown::process(child),
    })
}

/// Whether anything will consume the child's stderr. An unread pipe can
/// fill up and stall the process.
fn reads_stderr(config: &ServerConfig, request: &RelayRequest, emulate: bool) -> bool {
    if emulate {
        config.header_on_stderr()
    } else {
        request.kind() == AppKind::Traceroute
    }
}
