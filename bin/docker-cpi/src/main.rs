//! docker-cpi -- BOSH CPI running VMs as Docker containers.
//!
//! Each invocation handles exactly one request: the director writes a JSON
//! document on stdin and reads the response from stdout. Everything else,
//! logs included, goes to stderr.

mod cli;
mod config;
mod rpc;

use anyhow::{Context, Result};
use clap::Parser;
use cpi_vm::{connect, Cpi, CpiInfo};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::Instrument;

use cli::Cli;
use config::BinConfig;
use rpc::{DispatchError, Request, Response, ResponseError};

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match BinConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let mut logging = config.logging.clone();
    if cli.verbose > 0 {
        logging.level = logging.level.more_verbose(cli.verbose);
        logging.filter_directives = None;
    }
    if let Some(format) = cli.log_format {
        logging.format = format.into();
    }

    // Hold the guard for the process lifetime so file output is flushed
    let _guard = match cpi_observability::init_logging(&logging)
        .context("Failed to initialize logging")
    {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")
    {
        Ok(rt) => match rt.block_on(run(config)) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error: {e:#}");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: BinConfig) -> Result<()> {
    let mut input = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut input)
        .await
        .context("Failed to read request from stdin")?;

    let response = handle(&config, &input).await;

    let mut output = serde_json::to_vec(&response).context("Failed to encode response")?;
    output.push(b'\n');
    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(&output)
        .await
        .context("Failed to write response")?;
    stdout.flush().await.context("Failed to flush stdout")?;
    Ok(())
}

fn failure(err: DispatchError) -> Response {
    tracing::error!(error = %err, "request failed");
    Response::failed(ResponseError::from(&err))
}

async fn handle(config: &BinConfig, input: &[u8]) -> Response {
    let request: Request = match serde_json::from_slice(input) {
        Ok(request) => request,
        Err(e) => return failure(DispatchError::Request(e.to_string())),
    };

    let span = tracing::info_span!(
        "cpi.request",
        otel.name = %request.method,
        api_version = request.api_version
    );
    async move {
        // Answerable without an engine
        if request.method == "info" {
            return match serde_json::to_value(CpiInfo::default()) {
                Ok(info) => Response::ok(info),
                Err(e) => failure(DispatchError::Request(e.to_string())),
            };
        }

        let engine_failure = |source: cpi_vm::CpiError| {
            failure(DispatchError::Cpi {
                method: request.method.clone(),
                source,
            })
        };
        let opts = match config.docker_opts(request.docker_override()) {
            Ok(opts) => opts,
            Err(e) => return engine_failure(e),
        };
        let engine = match connect::connect(&opts).await {
            Ok(engine) => engine,
            Err(e) => return engine_failure(e),
        };

        let cpi = Cpi::new(Arc::new(engine), &config.cpi);
        match rpc::dispatch(&cpi, &request).await {
            Ok(result) => {
                tracing::info!("request succeeded");
                Response::ok(result)
            }
            Err(e) => failure(e),
        }
    }
    .instrument(span)
    .await
}
