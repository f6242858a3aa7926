//! Binary configuration: the CPI settings plus logging

use anyhow::{Context, Result};
use cpi_observability::LoggingConfig;
use cpi_vm::{CpiConfig, DockerOpts};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct BinConfig {
    #[serde(flatten)]
    pub(crate) cpi: CpiConfig,

    #[serde(default)]
    pub(crate) logging: LoggingConfig,
}

impl BinConfig {
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_slice(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.cpi.validate().context("Invalid configuration")?;
        Ok(config)
    }

    /// Engine endpoint for one request. A director-supplied endpoint wins and
    /// inherits the configured API version when it names none.
    pub(crate) fn docker_opts(&self, context: Option<DockerOpts>) -> cpi_vm::Result<DockerOpts> {
        match context {
            Some(mut opts) => {
                if opts.api_version.is_empty() {
                    opts.api_version = self.cpi.actions.docker.api_version.clone();
                }
                opts.validate()?;
                tracing::debug!(host = %opts.host, "using engine endpoint from request context");
                Ok(opts)
            }
            None => Ok(self.cpi.actions.docker.clone()),
        }
    }
}
