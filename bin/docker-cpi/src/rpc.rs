//! Request and response documents and method dispatch

use cpi_spec::{AgentId, DiskId, Networks, StemcellId, VmId};
use cpi_vm::{Cpi, CpiError, DockerOpts};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

pub(crate) const CLOUD_ERROR: &str = "Bosh::Clouds::CloudError";
pub(crate) const NOT_IMPLEMENTED: &str = "Bosh::Clouds::NotImplemented";
pub(crate) const VM_NOT_FOUND: &str = "Bosh::Clouds::VMNotFound";
pub(crate) const VM_CREATION_FAILED: &str = "Bosh::Clouds::VMCreationFailed";

fn default_api_version() -> u32 {
    1
}

/// One CPI call as sent by the director
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Request {
    pub(crate) method: String,

    #[serde(default)]
    pub(crate) arguments: Vec<Value>,

    #[serde(default)]
    pub(crate) context: Value,

    #[serde(default = "default_api_version")]
    pub(crate) api_version: u32,
}

impl Request {
    /// Engine endpoint carried in the request context, if the director sent one.
    pub(crate) fn docker_override(&self) -> Option<DockerOpts> {
        serde_json::from_value::<DockerOpts>(self.context.clone())
            .ok()
            .filter(|opts| !opts.host.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct ResponseError {
    #[serde(rename = "type")]
    pub(crate) kind: String,
    pub(crate) message: String,
    pub(crate) ok_to_retry: bool,
}

/// Document written to stdout
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct Response {
    pub(crate) result: Value,
    pub(crate) error: Option<ResponseError>,
    pub(crate) log: String,
}

impl Response {
    pub(crate) fn ok(result: Value) -> Self {
        Self {
            result,
            error: None,
            log: String::new(),
        }
    }

    pub(crate) fn failed(error: ResponseError) -> Self {
        Self {
            result: Value::Null,
            error: Some(error),
            log: String::new(),
        }
    }
}

#[derive(Debug, Error)]
pub(crate) enum DispatchError {
    #[error("Invalid request: {0}")]
    Request(String),

    #[error("Method '{0}' is not implemented")]
    NotImplemented(String),

    #[error("Invalid argument {index} for '{method}': {reason}")]
    Argument {
        method: String,
        index: usize,
        reason: String,
    },

    #[error("{method}: {source}")]
    Cpi {
        method: String,
        #[source]
        source: CpiError,
    },
}

impl From<&DispatchError> for ResponseError {
    fn from(err: &DispatchError) -> Self {
        let (kind, ok_to_retry) = match err {
            DispatchError::NotImplemented(_) => (NOT_IMPLEMENTED, false),
            DispatchError::Cpi { method, source } => match source {
                CpiError::VmNotFound(_) => (VM_NOT_FOUND, false),
                _ if method == "create_vm" => (VM_CREATION_FAILED, source.is_retryable()),
                _ => (CLOUD_ERROR, source.is_retryable()),
            },
            DispatchError::Request(_) | DispatchError::Argument { .. } => (CLOUD_ERROR, false),
        };
        Self {
            kind: kind.to_string(),
            message: err.to_string(),
            ok_to_retry,
        }
    }
}

/// Positional arguments of one request
struct Args<'a> {
    method: &'a str,
    values: &'a [Value],
}

impl Args<'_> {
    fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T, DispatchError> {
        let value = self.values.get(index).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| DispatchError::Argument {
            method: self.method.to_string(),
            index,
            reason: e.to_string(),
        })
    }

    /// Missing, null and empty-string arguments read as `None`.
    fn get_opt<T: DeserializeOwned>(&self, index: usize) -> Result<Option<T>, DispatchError> {
        match self.values.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) if s.is_empty() => Ok(None),
            Some(_) => self.get(index).map(Some),
        }
    }

    fn get_or_default<T: DeserializeOwned + Default>(&self, index: usize) -> Result<T, DispatchError> {
        Ok(self.get_opt(index)?.unwrap_or_default())
    }
}

/// Run `request` against `cpi`.
pub(crate) async fn dispatch(cpi: &Cpi, request: &Request) -> Result<Value, DispatchError> {
    let method = request.method.as_str();
    let args = Args {
        method,
        values: &request.arguments,
    };
    let wrap = |source: CpiError| DispatchError::Cpi {
        method: method.to_string(),
        source,
    };

    let result = match method {
        "info" => serde_json::to_value(cpi.info()).map_err(|e| DispatchError::Request(e.to_string()))?,

        "create_vm" => {
            let agent_id: AgentId = args.get(0)?;
            let stemcell: StemcellId = args.get(1)?;
            let cloud_props: Value = args.get_or_default(2)?;
            let networks: Networks = args.get_or_default(3)?;
            let disk_ids: Vec<DiskId> = args.get_or_default(4)?;
            let env: Map<String, Value> = args.get_or_default(5)?;

            let returned_networks = json!(networks);
            let vm = cpi
                .create_vm(agent_id, &stemcell, &cloud_props, networks, &disk_ids, env)
                .await
                .map_err(wrap)?;
            if request.api_version >= 2 {
                json!([vm, returned_networks])
            } else {
                json!(vm)
            }
        }
        "delete_vm" => {
            cpi.delete_vm(args.get(0)?).await.map_err(wrap)?;
            Value::Null
        }
        "has_vm" => json!(cpi.has_vm(args.get(0)?).await.map_err(wrap)?),
        "reboot_vm" => {
            cpi.reboot_vm(args.get(0)?).await.map_err(wrap)?;
            Value::Null
        }
        "set_vm_metadata" => {
            let metadata: Value = args.get_or_default(1)?;
            cpi.set_vm_metadata(args.get(0)?, &metadata)
                .await
                .map_err(wrap)?;
            Value::Null
        }
        "calculate_vm_cloud_properties" => {
            let requirements: Value = args.get_or_default(0)?;
            cpi.calculate_vm_cloud_properties(&requirements)
        }

        "create_disk" => {
            let size_mb: u64 = args.get(0)?;
            let cloud_props: Value = args.get_or_default(1)?;
            let vm: Option<VmId> = args.get_opt(2)?;
            json!(cpi
                .create_disk(size_mb, &cloud_props, vm.as_ref())
                .await
                .map_err(wrap)?)
        }
        "delete_disk" => {
            cpi.delete_disk(args.get(0)?).await.map_err(wrap)?;
            Value::Null
        }
        "has_disk" => json!(cpi.has_disk(args.get(0)?).await.map_err(wrap)?),
        "attach_disk" => {
            let hint = cpi
                .attach_disk(args.get(0)?, args.get(1)?)
                .await
                .map_err(wrap)?;
            if request.api_version >= 2 {
                json!(hint)
            } else {
                Value::Null
            }
        }
        "detach_disk" => {
            cpi.detach_disk(args.get(0)?, args.get(1)?)
                .await
                .map_err(wrap)?;
            Value::Null
        }
        "set_disk_metadata" => {
            let metadata: Value = args.get_or_default(1)?;
            cpi.set_disk_metadata(args.get(0)?, &metadata)
                .await
                .map_err(wrap)?;
            Value::Null
        }
        "get_disks" => json!(cpi.get_disks(args.get(0)?).await.map_err(wrap)?),
        "snapshot_disk" => {
            let metadata: Value = args.get_or_default(1)?;
            json!(cpi
                .snapshot_disk(args.get(0)?, &metadata)
                .await
                .map_err(wrap)?)
        }
        "delete_snapshot" => {
            let snapshot: String = args.get(0)?;
            cpi.delete_snapshot(&snapshot).await.map_err(wrap)?;
            Value::Null
        }

        "delete_stemcell" => {
            let stemcell: StemcellId = args.get(0)?;
            cpi.delete_stemcell(&stemcell).await.map_err(wrap)?;
            Value::Null
        }

        other => return Err(DispatchError::NotImplemented(other.to_string())),
    };
    Ok(result)
}
