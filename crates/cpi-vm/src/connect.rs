//! Finding a reachable Docker daemon
//!
//! The configured host is tried first, then the well-known socket locations
//! and finally `DOCKER_HOST`. The first endpoint that answers a ping wins.

use bollard::{ClientVersion, Docker};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{DockerOpts, TlsOpts};
use crate::engine::SHORT_TIMEOUT;
use crate::engines::DockerEngine;
use crate::error::{CpiError, Result};

/// Socket locations tried after the configured host
pub const FALLBACK_SOCKETS: &[&str] = &[
    "unix:///var/run/docker.sock",
    "unix:///docker.sock",
    "unix:///var/vcap/sys/run/docker.sock",
];

/// Bound on each endpoint's ping
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Endpoints to try, in order and without duplicates.
pub fn candidate_hosts(configured: &str, docker_host_env: Option<&str>) -> Vec<String> {
    let mut hosts: Vec<String> = Vec::new();
    let candidates = std::iter::once(configured)
        .chain(FALLBACK_SOCKETS.iter().copied())
        .chain(docker_host_env);
    for host in candidates {
        if !host.is_empty() && !hosts.iter().any(|h| h == host) {
            hosts.push(host.to_string());
        }
    }
    hosts
}

fn client_version(api_version: &str) -> Result<ClientVersion> {
    let invalid = || CpiError::Configuration(format!("invalid api_version '{api_version}'"));
    let (major, minor) = api_version.trim_start_matches('v').split_once('.').ok_or_else(invalid)?;
    Ok(ClientVersion {
        major_version: major.parse().map_err(|_| invalid())?,
        minor_version: minor.parse().map_err(|_| invalid())?,
    })
}

/// TLS material written out for the client; removed on drop.
struct TlsFiles {
    _dir: tempfile::TempDir,
    key: PathBuf,
    cert: PathBuf,
    ca: PathBuf,
}

impl TlsFiles {
    fn write(tls: &TlsOpts) -> Result<Self> {
        let failed = |e: std::io::Error| CpiError::Configuration(format!("writing TLS material: {e}"));
        let dir = tempfile::Builder::new()
            .prefix("docker-cpi-tls")
            .tempdir()
            .map_err(failed)?;

        let key = dir.path().join("key.pem");
        let cert = dir.path().join("cert.pem");
        let ca = dir.path().join("ca.pem");
        std::fs::write(&key, &tls.private_key).map_err(failed)?;
        std::fs::write(&cert, &tls.certificate).map_err(failed)?;
        std::fs::write(&ca, &tls.ca).map_err(failed)?;

        Ok(Self {
            _dir: dir,
            key,
            cert,
            ca,
        })
    }
}

fn client_for(host: &str, opts: &DockerOpts, version: &ClientVersion) -> Result<Docker> {
    let timeout = SHORT_TIMEOUT.as_secs();
    let connected = if host.starts_with("unix://") {
        Docker::connect_with_unix(host, timeout, version)
    } else if host.starts_with("http://") {
        Docker::connect_with_http(host, timeout, version)
    } else {
        let tls = opts.tls.as_ref().ok_or_else(|| {
            CpiError::Configuration(format!("host '{host}' requires TLS credentials"))
        })?;
        let files = TlsFiles::write(tls)?;
        // The client reads the PEM files while connecting
        Docker::connect_with_ssl(host, &files.key, &files.cert, &files.ca, timeout, version)
    };
    connected.map_err(|e| CpiError::Configuration(format!("{host}: {e}")))
}

/// Connect to the first endpoint that answers a ping.
pub async fn connect(opts: &DockerOpts) -> Result<DockerEngine> {
    let version = client_version(&opts.api_version)?;
    let docker_host = std::env::var("DOCKER_HOST").ok();
    let hosts = candidate_hosts(&opts.host, docker_host.as_deref());

    let mut failures = Vec::with_capacity(hosts.len());
    for host in &hosts {
        let docker = match client_for(host, opts, &version) {
            Ok(docker) => docker,
            Err(e) => {
                tracing::debug!(host = %host, error = %e, "failed to create client");
                failures.push(e.to_string());
                continue;
            }
        };

        match tokio::time::timeout(PING_TIMEOUT, docker.ping()).await {
            Ok(Ok(_)) => {
                if host != &opts.host {
                    tracing::info!(host = %host, configured = %opts.host, "connected using fallback endpoint");
                } else {
                    tracing::debug!(host = %host, "connected to docker");
                }
                return Ok(DockerEngine::with_client(docker));
            }
            Ok(Err(e)) => {
                tracing::debug!(host = %host, error = %e, "ping failed");
                failures.push(format!("{host}: {e}"));
            }
            Err(_) => {
                tracing::debug!(host = %host, "ping timed out");
                failures.push(format!("{host}: ping timed out after {PING_TIMEOUT:?}"));
            }
        }
    }

    Err(CpiError::Configuration(format!(
        "no reachable Docker endpoint (tried {}): {}",
        hosts.join(", "),
        failures.join("; ")
    )))
}
