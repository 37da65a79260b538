//! Configuration collection (CONFIG requests).
//!
//! The actual collection is done by an external job runner. This module
//! builds the job from the request, runs it in the background and turns its
//! progress plus the collected file into a byte stream for the client.

use super::{ReadSource, Teardown, Upstream, UpstreamKind};
use crate::config::CollectorConfig;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::process::Command;
use tracing::{debug, info, warn};
use trelay_core::{RelayError, RelayRequest, RelayResult};

/// Marker separating the job transcript from the collected file.
pub const DISPLAY_END: &str = "##DISPLAYEND##";
const RUN_FAILED: &str = "Error running config collection";
const FILE_NOT_FOUND: &str = "config file not found";

/// In-memory buffer between the job task and the relay.
const STREAM_BUFFER: usize = 16 * 1024;

/// One collection job, derived from a CONFIG request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionJob {
    pub protocol: String,
    pub collection_type: String,
    pub filename: String,
    pub src_ip: String,
    pub dst_ip: String,
    pub device: String,
    pub community: Option<String>,
    pub platform: String,
    pub domain: String,
}

impl CollectionJob {
    /// Parse `protocol:type:filename` from the request options and check the
    /// type against the prohibited list.
    pub fn from_request(request: &RelayRequest, settings: &CollectorConfig) -> RelayResult<Self> {
        let options = request.options.as_deref().unwrap_or_default();
        let mut parts = options.splitn(3, ':').map(str::trim);
        let (Some(protocol), Some(collection_type), Some(filename)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(RelayError::InvalidRequest(format!(
                "CONFIG options '{options}' must be protocol:type:filename"
            )));
        };
        if protocol.is_empty() || collection_type.is_empty() || filename.is_empty() {
            return Err(RelayError::InvalidRequest(format!(
                "CONFIG options '{options}' must be protocol:type:filename"
            )));
        }
        if settings.is_prohibited(collection_type) {
            return Err(RelayError::Collection(format!(
                "{collection_type} collection is prohibited"
            )));
        }

        Ok(Self {
            protocol: protocol.to_string(),
            collection_type: collection_type.to_string(),
            filename: filename.to_string(),
            src_ip: request.relay_src_ip.clone(),
            dst_ip: request.relay_dst_ip.clone(),
            device: request.device().to_string(),
            community: request.write_community.clone(),
            platform: request.platform.clone(),
            domain: request.domain.clone(),
        })
    }

    fn needs_community(&self) -> bool {
        self.protocol.eq_ignore_ascii_case("SNMP") || self.protocol.eq_ignore_ascii_case("CASCADE")
    }

    /// Tab-delimited job description handed to the runner.
    pub fn job_line(&self) -> String {
        let mut fields = vec![
            self.protocol.as_str(),
            self.src_ip.as_str(),
            self.device.as_str(),
            self.dst_ip.as_str(),
        ];
        if self.needs_community() {
            fields.push(self.community.as_deref().unwrap_or_default());
        }
        fields.extend([
            self.src_ip.as_str(),
            self.filename.as_str(),
            self.collection_type.as_str(),
        ]);
        fields.join("\t")
    }
}

/// What the runner reports back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobReport {
    pub successes: u32,
    pub transcript: String,
}

/// Executes collection jobs.
pub trait JobRunner: Send + Sync {
    fn run<'a>(
        &'a self,
        job: &'a CollectionJob,
    ) -> Pin<Box<dyn Future<Output = RelayResult<JobReport>> + Send + 'a>>;
}

/// Runs the configured collector command, feeding it the job line on stdin.
#[derive(Debug, Clone)]
pub struct CommandJobRunner {
    command: Option<String>,
    syslog_to: Vec<String>,
}

impl CommandJobRunner {
    pub fn new(settings: &CollectorConfig) -> Self {
        Self {
            command: settings.command.clone(),
            syslog_to: settings.syslog_to.clone(),
        }
    }

    async fn execute(&self, job: &CollectionJob) -> RelayResult<JobReport> {
        let command = self
            .command
            .as_deref()
            .ok_or_else(|| RelayError::Configuration("no collector command configured".into()))?;
        let mut words = command.split_whitespace();
        let program = words
            .next()
            .ok_or_else(|| RelayError::Configuration("collector command is empty".into()))?;

        let mut child = Command::new(program)
            .args(words)
            .args(self.syslog_to.iter().map(|t| format!("--syslog={t}")))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RelayError::Collection(format!("cannot start {program}: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(job.job_line().as_bytes()).await?;
            stdin.write_all(b"\n").await?;
        }

        let output = child.wait_with_output().await?;
        let mut transcript = String::from_utf8_lossy(&output.stdout).into_owned();
        transcript.push_str(&String::from_utf8_lossy(&output.stderr));
        debug!(status = %output.status, "collector finished");

        Ok(JobReport {
            successes: u32::from(output.status.success()),
            transcript,
        })
    }
}

impl JobRunner for CommandJobRunner {
    fn run<'a>(
        &'a self,
        job: &'a CollectionJob,
    ) -> Pin<Box<dyn Future<Output = RelayResult<JobReport>> + Send + 'a>> {
        Box::pin(self.execute(job))
    }
}

/// Start `job` in the background and expose its output as an upstream.
/// Client input is discarded.
pub fn open_collection(
    job: CollectionJob,
    runner: Arc<dyn JobRunner>,
    settings: CollectorConfig,
) -> Upstream {
    let (writer, reader) = tokio::io::duplex(STREAM_BUFFER);
    let handle = tokio::spawn(async move {
        let device = job.device.clone();
        if let Err(e) = stream_collection(writer, &job, runner.as_ref(), &settings).await {
            debug!(%device, error = %e, "collection stream closed early");
        }
    });

    Upstream {
        kind: UpstreamKind::Collection,
        source: Box::new(ReadSource(reader)),
        sink: Box::new(tokio::io::sink()),
        side: None,
        teardown: Teardown::job(handle),
    }
}

async fn stream_collection(
    mut out: DuplexStream,
    job: &CollectionJob,
    runner: &dyn JobRunner,
    settings: &CollectorConfig,
) -> std::io::Result<()> {
    write_line(&mut out, &format!("Starting config collection for {}", job.device)).await?;
    info!(device = %job.device, kind = %job.collection_type, "config collection started");

    let report = match runner.run(job).await {
        Ok(report) => report,
        Err(e) => {
            warn!(device = %job.device, error = %e, "config collection failed");
            return write_line(&mut out, RUN_FAILED).await;
        }
    };
    if !report.transcript.is_empty() {
        out.write_all(report.transcript.as_bytes()).await?;
        if !report.transcript.ends_with('\n') {
            out.write_all(b"\n").await?;
        }
    }
    if report.successes == 0 {
        warn!(device = %job.device, "collector reported no successes");
        return write_line(&mut out, RUN_FAILED).await;
    }

    let Some(path) = settings
        .tftp_folder(&job.platform, &job.domain)
        .map(|folder| folder.join(&job.filename))
    else {
        warn!(platform = %job.platform, "no tftp folder configured");
        write_line(&mut out, FILE_NOT_FOUND).await?;
        return write_line(&mut out, RUN_FAILED).await;
    };

    match poll_for_file(&path, settings).await {
        Some(contents) => {
            write_line(&mut out, DISPLAY_END).await?;
            write_line(&mut out, &job.filename).await?;
            out.write_all(&contents).await?;
            out.flush().await
        }
        None => {
            warn!(path = %path.display(), "collected config not readable");
            write_line(&mut out, FILE_NOT_FOUND).await?;
            write_line(&mut out, RUN_FAILED).await
        }
    }
}

/// Wait for the collector to drop the file, then read it.
async fn poll_for_file(path: &Path, settings: &CollectorConfig) -> Option<Vec<u8>> {
    for attempt in 0..settings.poll_attempts {
        if attempt > 0 {
            tokio::time::sleep(settings.poll_interval).await;
        }
        match tokio::fs::read(path).await {
            Ok(contents) => return Some(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "reading collected config");
                return None;
            }
        }
    }
    None
}

async fn write_line<W: AsyncWrite + Unpin>(out: &mut W, line: &str) -> std::io::Result<()> {
    out.write_all(line.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use std::collections::HashMap;
    use std::time::Duration;
    use trelay_core::PROTOCOL_VERSION;

    fn request(options: &str) -> RelayRequest {
        RelayRequest {
            app_name: "CONFIG".into(),
            platform: "VCMS".into(),
            relay_src_ip: "10.1.1.1".into(),
            relay_dst_ip: "10.2.2.2".into(),
            relay_dst_port: 0,
            options: Some(options.into()),
            write_community: Some("private".into()),
            domain: "EAST".into(),
            device_name: Some("edge-router-1".into()),
            version: PROTOCOL_VERSION.into(),
        }
    }

    fn settings(folder: &std::path::Path) -> CollectorConfig {
        let mut settings = ServerConfig::default().collector;
        settings.cc_prohibited = vec!["DIR".into()];
        settings.poll_attempts = 3;
        settings.poll_interval = Duration::from_millis(10);
        settings.tftp_folders = HashMap::from([(
            "VCMS".to_string(),
            format!("{}/<DOMAIN>", folder.display()),
        )]);
        settings
    }

    struct FixedRunner(RelayResult<JobReport>);

    impl JobRunner for FixedRunner {
        fn run<'a>(
            &'a self,
            _job: &'a CollectionJob,
        ) -> Pin<Box<dyn Future<Output = RelayResult<JobReport>> + Send + 'a>> {
            let result = match &self.0 {
                Ok(report) => Ok(report.clone()),
                Err(e) => Err(RelayError::Collection(e.to_string())),
            };
            Box::pin(async move { result })
        }
    }

    async fn read_all(mut upstream: Upstream) -> String {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = upstream.source.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        upstream.close().await;
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn job_line_includes_community_for_snmp() {
        let dir = tempfile::tempdir().unwrap();
        let job = CollectionJob::from_request(&request("SNMP:RUN:edge.cfg"), &settings(dir.path()))
            .unwrap();
        assert_eq!(
            job.job_line(),
            "SNMP\t10.1.1.1\tedge-router-1\t10.2.2.2\tprivate\t10.1.1.1\tedge.cfg\tRUN"
        );

        let job = CollectionJob::from_request(&request("TELNET:RUN:edge.cfg"), &settings(dir.path()))
            .unwrap();
        assert_eq!(
            job.job_line(),
            "TELNET\t10.1.1.1\tedge-router-1\t10.2.2.2\t10.1.1.1\tedge.cfg\tRUN"
        );
    }

    #[test]
    fn malformed_and_prohibited_jobs_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let err = CollectionJob::from_request(&request("SNMP:RUN"), &settings(dir.path())).unwrap_err();
        assert!(matches!(err, RelayError::InvalidRequest(_)));

        let err =
            CollectionJob::from_request(&request("SNMP:dir:x.cfg"), &settings(dir.path())).unwrap_err();
        assert!(matches!(err, RelayError::Collection(_)));
    }

    #[tokio::test]
    async fn successful_job_streams_collected_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("EAST")).unwrap();
        std::fs::write(dir.path().join("EAST/edge.cfg"), "hostname edge\n").unwrap();

        let settings = settings(dir.path());
        let job = CollectionJob::from_request(&request("SNMP:RUN:edge.cfg"), &settings).unwrap();
        let runner = Arc::new(FixedRunner(Ok(JobReport {
            successes: 1,
            transcript: "collected 1 device".into(),
        })));
        let text = read_all(open_collection(job, runner, settings)).await;
        assert_eq!(
            text,
            "Starting config collection for edge-router-1\n\
             collected 1 device\n\
             ##DISPLAYEND##\n\
             edge.cfg\n\
             hostname edge\n"
        );
    }

    #[tokio::test]
    async fn runner_failure_is_reported_in_stream() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let job = CollectionJob::from_request(&request("SNMP:RUN:edge.cfg"), &settings).unwrap();
        let runner = Arc::new(FixedRunner(Err(RelayError::Collection("boom".into()))));
        let text = read_all(open_collection(job, runner, settings)).await;
        assert_eq!(
            text,
            "Starting config collection for edge-router-1\nError running config collection\n"
        );
    }

    #[tokio::test]
    async fn missing_file_after_polling_is_run_error() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let job = CollectionJob::from_request(&request("SNMP:RUN:edge.cfg"), &settings).unwrap();
        let runner = Arc::new(FixedRunner(Ok(JobReport {
            successes: 1,
            transcript: String::new(),
        })));
        let text = read_all(open_collection(job, runner, settings)).await;
        assert_eq!(
            text,
            "Starting config collection for edge-router-1\n\
             config file not found\n\
             Error running config collection\n"
        );
        assert!(!text.contains(DISPLAY_END));
    }

    #[tokio::test]
    async fn missing_tftp_folder_is_run_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path());
        settings.tftp_folders.clear();
        let job = CollectionJob::from_request(&request("SNMP:RUN:edge.cfg"), &settings).unwrap();
        let runner = Arc::new(FixedRunner(Ok(JobReport {
            successes: 1,
            transcript: String::new(),
        })));
        let text = read_all(open_collection(job, runner, settings)).await;
        assert!(text.ends_with("config file not found\nError running config collection\n"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_runner_feeds_job_line_on_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path());
        settings.command = Some("cat".into());
        let job = CollectionJob::from_request(&request("TELNET:RUN:edge.cfg"), &settings).unwrap();
        let report = CommandJobRunner::new(&settings).run(&job).await.unwrap();
        assert_eq!(report.successes, 1);
        assert_eq!(report.transcript, format!("{}\n", job.job_line()));
    }

    #[tokio::test]
    async fn command_runner_without_command_fails() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let job = CollectionJob::from_request(&request("TELNET:RUN:edge.cfg"), &settings).unwrap();
        let err = CommandJobRunner::new(&settings).run(&job).await.unwrap_err();
        assert!(matches!(err, RelayError::Configuration(_)));
    }
}
