//! Init style of a stemcell image
//!
//! Older stemcells supervise services with runit and expect the CPI to start
//! `runsvdir`; newer ones boot a full systemd.

use bollard::models::ContainerCreateBody;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::engine::{ContainerSpec, Engine, Platform};
use crate::error::{CpiError, Phase, Result};

/// Prints the os-release file and whether the runit supervisor exists
const PROBE_SCRIPT: &str = "cat /etc/os-release 2>/dev/null || echo OS_RELEASE_NOT_FOUND; \
test -f /usr/sbin/runsvdir-start && echo RUNSVDIR_EXISTS || echo RUNSVDIR_MISSING";

/// First release that boots with systemd
const SYSTEMD_CODENAME: &str = "noble";
const SYSTEMD_VERSION: (u32, u32) = (24, 4);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitSystem {
    Runit,
    Systemd,
}

impl fmt::Display for InitSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitSystem::Runit => f.write_str("runit"),
            InitSystem::Systemd => f.write_str("systemd"),
        }
    }
}

fn parse_version(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.split('.');
    let major = parts.next()?.trim().parse().ok()?;
    let minor = parts.next().map_or(Some(0), |minor| minor.trim().parse().ok())?;
    Some((major, minor))
}

impl InitSystem {
    /// Classify probe output.
    pub fn classify(output: &str) -> Self {
        let mut codename = "";
        let mut version = "";
        let mut found = false;
        for line in output.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"');
            match key.trim() {
                "VERSION_CODENAME" => codename = value,
                "VERSION_ID" => version = value,
                _ => continue,
            }
            found = true;
        }

        let by_release = if !found || output.contains("OS_RELEASE_NOT_FOUND") {
            InitSystem::Runit
        } else if codename == SYSTEMD_CODENAME
            || parse_version(version).is_some_and(|v| v >= SYSTEMD_VERSION)
        {
            InitSystem::Systemd
        } else {
            InitSystem::Runit
        };

        if by_release == InitSystem::Runit && output.contains("RUNSVDIR_MISSING") {
            tracing::warn!("runsvdir-start not found in stemcell, using systemd");
            return InitSystem::Systemd;
        }
        by_release
    }

    /// Probe `image` with a throwaway container. Probe failures fall back to
    /// runit.
    pub async fn detect(engine: &Arc<dyn Engine>, image: &str, platform: &Platform) -> Self {
        match probe(engine, image, platform).await {
            Ok(output) => {
                let detected = Self::classify(&output);
                tracing::debug!(image, init_system = %detected, "detected init system");
                detected
            }
            Err(e) => {
                tracing::warn!(image, error = %e, "init system probe failed, assuming runit");
                InitSystem::Runit
            }
        }
    }

    /// Entrypoint override for the VM container.
    pub fn entrypoint(self) -> Option<Vec<String>> {
        match self {
            InitSystem::Systemd => Some(vec!["/sbin/init".to_string()]),
            InitSystem::Runit => None,
        }
    }

    /// Container command; for runit this prepares the filesystem, runs
    /// `net_init` and execs the supervisor.
    pub fn command(self, net_init: &str) -> Option<Vec<String>> {
        match self {
            InitSystem::Systemd => None,
            InitSystem::Runit => {
                let script = [
                    "umount /etc/resolv.conf",
                    "umount /etc/hosts",
                    "umount /etc/hostname",
                    net_init,
                    "rm -rf /var/vcap/data/sys",
                    "mkdir -p /var/vcap/data/sys",
                    "mkdir -p /var/vcap/store",
                    "sed -i 's/chronyc/# chronyc/g' /var/vcap/bosh/bin/sync-time",
                    "exec env -i /usr/sbin/runsvdir-start",
                ]
                .join(" && ");
                Some(vec!["bash".to_string(), "-c".to_string(), script])
            }
        }
    }

    /// Command run inside the VM once it has started.
    pub fn post_start(self) -> Option<Vec<&'static str>> {
        match self {
            InitSystem::Systemd => Some(vec!["bash", "-c", "umount /etc/hosts"]),
            InitSystem::Runit => None,
        }
    }
}

async fn probe(engine: &Arc<dyn Engine>, image: &str, platform: &Platform) -> Result<String> {
    let spec = ContainerSpec {
        config: ContainerCreateBody {
            image: Some(image.to_string()),
            entrypoint: Some(vec!["/bin/bash".to_string()]),
            cmd: Some(vec!["-c".to_string(), PROBE_SCRIPT.to_string()]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        },
        platform: platform.clone(),
        ..Default::default()
    };

    let id = engine
        .create_container(None, &spec)
        .await
        .map_err(CpiError::engine(Phase::DetectInitSystem))?;

    let output = async {
        engine.start_container(&id).await?;
        engine.wait_container(&id).await?;
        engine.container_logs(&id).await
    }
    .await
    .map_err(CpiError::engine(Phase::DetectInitSystem));

    if let Err(e) = engine.remove_container(&id, true).await {
        tracing::debug!(container = %id, error = %e, "failed to remove probe container");
    }
    output
}
