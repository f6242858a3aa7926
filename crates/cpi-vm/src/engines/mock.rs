//! In-memory engine for tests and local development
//!
//! Behaves like a single Docker host closely enough to drive the VM factory
//! and the recreate protocol: containers keep per-container file trees that
//! vanish on removal, named volumes referenced by binds are created on
//! demand, networks detect subnet overlap, and every operation can be made to
//! fail on demand.

use async_trait::async_trait;
use bollard::models::EndpointSettings;
use ipnet::IpNet;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::io::Read;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::engine::{
    ContainerSpec, Engine, EngineError, EngineResult, ExecState, HostResources, NetworkRequest,
};

/// Operations that can be counted and made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Ping,
    HostResources,
    Inspect,
    Create,
    Start,
    Kill,
    Stop,
    Remove,
    Wait,
    Logs,
    CreateNetwork,
    ConnectNetwork,
    CreateVolume,
    InspectVolume,
    ListVolumes,
    RemoveVolume,
    RemoveImage,
    CopyFrom,
    CopyTo,
    CreateExec,
    StartExec,
    InspectExec,
}

/// What a probe container sees inside an image
#[derive(Debug, Clone)]
pub struct MockImage {
    /// Contents of `/etc/os-release`
    pub os_release: Option<String>,
    /// Whether `/usr/sbin/runsvdir-start` exists
    pub has_runsvdir: bool,
}

impl Default for MockImage {
    fn default() -> Self {
        Self {
            os_release: None,
            has_runsvdir: true,
        }
    }
}

/// A container as tracked by [`MockEngine`]
#[derive(Debug, Clone)]
pub struct MockContainer {
    pub id: String,
    pub spec: ContainerSpec,
    pub running: bool,
    pub files: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Clone)]
struct MockNetwork {
    subnet: Option<IpNet>,
}

#[derive(Debug, Clone)]
struct MockExec {
    container: String,
    cmd: Vec<String>,
    exit_code: i64,
}

#[derive(Default)]
struct MockState {
    containers: HashMap<String, MockContainer>,
    networks: BTreeMap<String, MockNetwork>,
    volumes: BTreeSet<String>,
    images: HashMap<String, MockImage>,
    execs: Vec<MockExec>,
    exec_exit_codes: VecDeque<i64>,
    failures: HashMap<MockOp, VecDeque<EngineError>>,
    calls: HashMap<MockOp, usize>,
    history: Vec<(MockOp, String)>,
    next_id: u64,
}

impl MockState {
    fn enter(&mut self, op: MockOp, target: &str) -> EngineResult<()> {
        *self.calls.entry(op).or_default() += 1;
        self.history.push((op, target.to_string()));
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn container(&self, name: &str) -> EngineResult<&MockContainer> {
        self.containers
            .get(name)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {name}")))
    }

    fn container_mut(&mut self, name: &str) -> EngineResult<&mut MockContainer> {
        self.containers
            .get_mut(name)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {name}")))
    }

    /// Stored name for `name`, which may omit the node prefix.
    fn resolve_volume(&self, name: &str) -> Option<String> {
        self.volumes
            .iter()
            .find(|stored| {
                stored.as_str() == name
                    || stored.split_once('/').is_some_and(|(_, bare)| bare == name)
            })
            .cloned()
    }

    fn volume_in_use(&self, volume: &str) -> bool {
        let bare = volume.split_once('/').map_or(volume, |(_, bare)| bare);
        self.containers.values().any(|c| {
            c.spec
                .binds()
                .iter()
                .any(|bind| bind.split(':').next() == Some(bare))
        })
    }
}

/// In-memory [`Engine`]
pub struct MockEngine {
    state: RwLock<MockState>,
    resources: HostResources,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    /// A host with 8 GiB of memory and 4 CPUs.
    pub fn new() -> Self {
        Self::with_resources(HostResources {
            total_memory: 8 * 1024 * 1024 * 1024,
            cpus: 4,
        })
    }

    pub fn with_resources(resources: HostResources) -> Self {
        Self {
            state: RwLock::new(MockState::default()),
            resources,
        }
    }

    pub async fn add_image(&self, image: &str, contents: MockImage) {
        self.state
            .write()
            .await
            .images
            .insert(image.to_string(), contents);
    }

    pub async fn add_volume(&self, name: &str) {
        self.state.write().await.volumes.insert(name.to_string());
    }

    pub async fn add_network(&self, name: &str, subnet: Option<IpNet>) {
        self.state
            .write()
            .await
            .networks
            .insert(name.to_string(), MockNetwork { subnet });
    }

    /// Place a running container directly, bypassing create and start.
    pub async fn add_container(&self, name: &str, spec: ContainerSpec) {
        let mut state = self.state.write().await;
        state.next_id += 1;
        let id = format!("mock-{}", state.next_id);
        state.containers.insert(
            name.to_string(),
            MockContainer {
                id,
                spec,
                running: true,
                files: BTreeMap::new(),
            },
        );
    }

    /// Fail the next call of `op` with `err`.
    pub async fn fail(&self, op: MockOp, err: EngineError) {
        self.fail_times(op, err, 1).await;
    }

    /// Fail the next `times` calls of `op` with `err`.
    pub async fn fail_times(&self, op: MockOp, err: EngineError, times: usize) {
        let mut state = self.state.write().await;
        let queue = state.failures.entry(op).or_default();
        queue.extend(std::iter::repeat(err).take(times));
    }

    /// Exit code reported for the next exec instance.
    pub async fn push_exec_exit_code(&self, code: i64) {
        self.state.write().await.exec_exit_codes.push_back(code);
    }

    pub async fn put_file(&self, container: &str, path: &str, contents: &[u8]) {
        if let Some(c) = self.state.write().await.containers.get_mut(container) {
            c.files.insert(path.to_string(), contents.to_vec());
        }
    }

    pub async fn file(&self, container: &str, path: &str) -> Option<Vec<u8>> {
        self.state
            .read()
            .await
            .containers
            .get(container)
            .and_then(|c| c.files.get(path).cloned())
    }

    pub async fn container(&self, name: &str) -> Option<MockContainer> {
        self.state.read().await.containers.get(name).cloned()
    }

    pub async fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().await.containers.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn has_image(&self, image: &str) -> bool {
        self.state.read().await.images.contains_key(image)
    }

    pub async fn volumes(&self) -> Vec<String> {
        self.state.read().await.volumes.iter().cloned().collect()
    }

    pub async fn networks(&self) -> Vec<String> {
        self.state.read().await.networks.keys().cloned().collect()
    }

    pub async fn calls(&self, op: MockOp) -> usize {
        self.state.read().await.calls.get(&op).copied().unwrap_or(0)
    }

    /// Every operation in call order with its target.
    pub async fn history(&self) -> Vec<(MockOp, String)> {
        self.state.read().await.history.clone()
    }

    /// Commands exec'd in `container`, in order.
    pub async fn exec_commands(&self, container: &str) -> Vec<Vec<String>> {
        self.state
            .read()
            .await
            .execs
            .iter()
            .filter(|exec| exec.container == container)
            .map(|exec| exec.cmd.clone())
            .collect()
    }
}

fn probe_output(image: &MockImage, cmd: &str) -> String {
    let mut output = String::new();
    if cmd.contains("/etc/os-release") {
        match &image.os_release {
            Some(contents) => {
                output.push_str(contents);
                if !contents.ends_with('\n') {
                    output.push('\n');
                }
            }
            None => output.push_str("OS_RELEASE_NOT_FOUND\n"),
        }
    }
    if cmd.contains("runsvdir-start") {
        output.push_str(if image.has_runsvdir {
            "RUNSVDIR_EXISTS\n"
        } else {
            "RUNSVDIR_MISSING\n"
        });
    }
    output
}

fn single_file_archive(path: &str, contents: &[u8]) -> EngineResult<Vec<u8>> {
    let name = path.rsplit('/').next().unwrap_or(path);
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o640);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_data(&mut header, name, contents)
        .map_err(|e| EngineError::Malformed(e.to_string()))?;
    builder
        .into_inner()
        .map_err(|e| EngineError::Malformed(e.to_string()))
}

fn unpack(dir: &str, archive: &[u8]) -> EngineResult<Vec<(String, Vec<u8>)>> {
    let malformed = |e: std::io::Error| EngineError::Malformed(format!("archive: {e}"));
    let mut files = Vec::new();
    let mut archive = tar::Archive::new(archive);
    for entry in archive.entries().map_err(malformed)? {
        let mut entry = entry.map_err(malformed)?;
        let name = entry
            .path()
            .map_err(malformed)?
            .to_string_lossy()
            .into_owned();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).map_err(malformed)?;
        files.push((format!("{}/{}", dir.trim_end_matches('/'), name), contents));
    }
    Ok(files)
}

#[async_trait]
impl Engine for MockEngine {
    async fn ping(&self) -> EngineResult<()> {
        self.state.write().await.enter(MockOp::Ping, "")
    }

    async fn host_resources(&self) -> EngineResult<HostResources> {
        self.state.write().await.enter(MockOp::HostResources, "")?;
        Ok(self.resources)
    }

    async fn inspect_container(&self, name: &str) -> EngineResult<ContainerSpec> {
        let mut state = self.state.write().await;
        state.enter(MockOp::Inspect, name)?;
        Ok(state.container(name)?.spec.clone())
    }

    async fn create_container(
        &self,
        name: Option<&str>,
        spec: &ContainerSpec,
    ) -> EngineResult<String> {
        let mut state = self.state.write().await;
        state.enter(MockOp::Create, name.unwrap_or(""))?;

        state.next_id += 1;
        let id = format!("mock-{}", state.next_id);
        let name = name.map(str::to_string).unwrap_or_else(|| id.clone());
        if state.containers.contains_key(&name) {
            return Err(EngineError::Conflict(format!(
                "Conflict. The container name \"/{name}\" is already in use"
            )));
        }
        for network in spec.endpoints.keys() {
            if !state.networks.contains_key(network) {
                return Err(EngineError::NotFound(format!("network {network} not found")));
            }
        }

        for bind in spec.binds() {
            if let Some(source) = bind.split(':').next() {
                if !source.starts_with('/')
                    && !source.is_empty()
                    && state.resolve_volume(source).is_none()
                {
                    state.volumes.insert(source.to_string());
                }
            }
        }

        state.containers.insert(
            name,
            MockContainer {
                id: id.clone(),
                spec: spec.clone(),
                running: false,
                files: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, name: &str) -> EngineResult<()> {
        let mut state = self.state.write().await;
        state.enter(MockOp::Start, name)?;
        state.container_mut(name)?.running = true;
        Ok(())
    }

    async fn kill_container(&self, name: &str, _signal: &str) -> EngineResult<()> {
        let mut state = self.state.write().await;
        state.enter(MockOp::Kill, name)?;
        let container = state.container_mut(name)?;
        if !container.running {
            return Err(EngineError::Conflict(format!(
                "Cannot kill container: {name}: Container {} is not running",
                container.id
            )));
        }
        container.running = false;
        Ok(())
    }

    async fn stop_container(&self, name: &str, _grace: Duration) -> EngineResult<()> {
        let mut state = self.state.write().await;
        state.enter(MockOp::Stop, name)?;
        state.container_mut(name)?.running = false;
        Ok(())
    }

    async fn remove_container(&self, name: &str, force: bool) -> EngineResult<()> {
        let mut state = self.state.write().await;
        state.enter(MockOp::Remove, name)?;
        let container = state.container(name)?;
        if container.running && !force {
            return Err(EngineError::Conflict(format!(
                "You cannot remove a running container {}",
                container.id
            )));
        }
        state.containers.remove(name);
        Ok(())
    }

    async fn wait_container(&self, name: &str) -> EngineResult<i64> {
        let mut state = self.state.write().await;
        state.enter(MockOp::Wait, name)?;
        state.container_mut(name)?.running = false;
        Ok(0)
    }

    async fn container_logs(&self, name: &str) -> EngineResult<String> {
        let mut state = self.state.write().await;
        state.enter(MockOp::Logs, name)?;
        let container = state.container(name)?;
        let cmd = container
            .spec
            .config
            .cmd
            .as_ref()
            .map(|cmd| cmd.join(" "))
            .unwrap_or_default();
        let image = container
            .spec
            .image()
            .and_then(|image| state.images.get(image))
            .cloned()
            .unwrap_or_default();
        Ok(probe_output(&image, &cmd))
    }

    async fn create_network(&self, request: &NetworkRequest) -> EngineResult<()> {
        let mut state = self.state.write().await;
        state.enter(MockOp::CreateNetwork, &request.name)?;

        if matches!(request.name.as_str(), "bridge" | "host" | "none") {
            return Err(EngineError::Api {
                status: 403,
                message: format!(
                    "operation is not permitted on predefined {} network",
                    request.name
                ),
            });
        }
        if state.networks.contains_key(&request.name) {
            return Err(EngineError::Conflict(format!(
                "network with name {} already exists",
                request.name
            )));
        }
        if let Some(subnet) = request.subnet {
            let overlapping = state.networks.iter().find(|(_, net)| {
                net.subnet.is_some_and(|existing| {
                    existing.contains(&subnet.network()) || subnet.contains(&existing.network())
                })
            });
            if let Some((existing, _)) = overlapping {
                let family = if subnet.addr().is_ipv6() { "IPv6" } else { "IPv4" };
                return Err(EngineError::Api {
                    status: 403,
                    message: format!(
                        "cannot create network {} (br-{}): conflicts with network {} (br-{}): networks have overlapping {}",
                        request.name, request.name, existing, existing, family
                    ),
                });
            }
        }

        state.networks.insert(
            request.name.clone(),
            MockNetwork {
                subnet: request.subnet,
            },
        );
        Ok(())
    }

    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        endpoint: &EndpointSettings,
    ) -> EngineResult<()> {
        let mut state = self.state.write().await;
        state.enter(MockOp::ConnectNetwork, network)?;
        if !state.networks.contains_key(network) {
            return Err(EngineError::NotFound(format!("network {network} not found")));
        }
        state
            .container_mut(container)?
            .spec
            .endpoints
            .insert(network.to_string(), endpoint.clone());
        Ok(())
    }

    async fn create_volume(&self, name: &str, _driver: &str) -> EngineResult<()> {
        let mut state = self.state.write().await;
        state.enter(MockOp::CreateVolume, name)?;
        state.volumes.insert(name.to_string());
        Ok(())
    }

    async fn inspect_volume(&self, name: &str) -> EngineResult<()> {
        let mut state = self.state.write().await;
        state.enter(MockOp::InspectVolume, name)?;
        if state.resolve_volume(name).is_some() {
            Ok(())
        } else {
            Err(EngineError::NotFound(format!("get {name}: no such volume")))
        }
    }

    async fn list_volumes(&self) -> EngineResult<Vec<String>> {
        let mut state = self.state.write().await;
        state.enter(MockOp::ListVolumes, "")?;
        Ok(state.volumes.iter().cloned().collect())
    }

    async fn remove_volume(&self, name: &str, _force: bool) -> EngineResult<()> {
        let mut state = self.state.write().await;
        state.enter(MockOp::RemoveVolume, name)?;
        let Some(stored) = state.resolve_volume(name) else {
            return Err(EngineError::NotFound(format!("get {name}: no such volume")));
        };
        if state.volume_in_use(&stored) {
            return Err(EngineError::Conflict(format!(
                "remove {name}: volume is in use"
            )));
        }
        state.volumes.remove(&stored);
        Ok(())
    }

    async fn remove_image(&self, name: &str) -> EngineResult<()> {
        let mut state = self.state.write().await;
        state.enter(MockOp::RemoveImage, name)?;
        match state.images.remove(name) {
            Some(_) => Ok(()),
            None => Err(EngineError::NotFound(format!("No such image: {name}"))),
        }
    }

    async fn copy_from_container(&self, name: &str, path: &str) -> EngineResult<Vec<u8>> {
        let mut state = self.state.write().await;
        state.enter(MockOp::CopyFrom, path)?;
        let contents = state.container(name)?.files.get(path).cloned().ok_or_else(|| {
            EngineError::NotFound(format!(
                "Could not find the file {path} in container {name}"
            ))
        })?;
        single_file_archive(path, &contents)
    }

    async fn copy_to_container(
        &self,
        name: &str,
        dir: &str,
        archive: Vec<u8>,
    ) -> EngineResult<()> {
        let mut state = self.state.write().await;
        state.enter(MockOp::CopyTo, dir)?;
        let files = unpack(dir, &archive)?;
        let container = state.container_mut(name)?;
        container.files.extend(files);
        Ok(())
    }

    async fn create_exec(&self, name: &str, cmd: Vec<String>) -> EngineResult<String> {
        let mut state = self.state.write().await;
        state.enter(MockOp::CreateExec, name)?;
        let container = state.container(name)?;
        if !container.running {
            return Err(EngineError::Conflict(format!(
                "Container {} is not running",
                container.id
            )));
        }
        let exit_code = state.exec_exit_codes.pop_front().unwrap_or(0);
        state.execs.push(MockExec {
            container: name.to_string(),
            cmd,
            exit_code,
        });
        Ok(format!("exec-{}", state.execs.len() - 1))
    }

    async fn start_exec(&self, exec_id: &str) -> EngineResult<()> {
        self.state.write().await.enter(MockOp::StartExec, exec_id)
    }

    async fn inspect_exec(&self, exec_id: &str) -> EngineResult<ExecState> {
        let mut state = self.state.write().await;
        state.enter(MockOp::InspectExec, exec_id)?;
        let exec = exec_id
            .strip_prefix("exec-")
            .and_then(|index| index.parse::<usize>().ok())
            .and_then(|index| state.execs.get(index))
            .ok_or_else(|| EngineError::NotFound(format!("No such exec instance: {exec_id}")))?;
        Ok(ExecState {
            running: false,
            exit_code: Some(exec.exit_code),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with_binds(binds: &[&str]) -> ContainerSpec {
        let mut spec = ContainerSpec::default();
        spec.config.image = Some("stemcell".to_string());
        spec.binds_mut()
            .extend(binds.iter().map(|b| b.to_string()));
        spec
    }

    #[tokio::test]
    async fn test_named_binds_create_volumes() {
        let engine = MockEngine::new();
        engine
            .create_container(Some("c-1"), &spec_with_binds(&["vol-eph-c-1:/var/vcap/data/", "/host:/mnt"]))
            .await
            .unwrap();
        assert_eq!(engine.volumes().await, vec!["vol-eph-c-1".to_string()]);
    }

    #[tokio::test]
    async fn test_node_prefixed_volume_resolves_by_bare_name() {
        let engine = MockEngine::new();
        engine.create_volume("node1/vol-1", "local").await.unwrap();
        engine.inspect_volume("vol-1").await.unwrap();

        engine
            .add_container("c-1", spec_with_binds(&["vol-1:/warden-cpi-dev/vol-1"]))
            .await;
        assert!(engine.remove_volume("vol-1", true).await.unwrap_err().to_string().contains("in use"));

        engine.remove_container("c-1", true).await.unwrap();
        engine.remove_volume("vol-1", true).await.unwrap();
        assert!(engine.volumes().await.is_empty());
    }

    #[tokio::test]
    async fn test_bind_to_node_prefixed_volume_adds_no_duplicate() {
        let engine = MockEngine::new();
        engine.create_volume("node1/vol-1", "local").await.unwrap();
        engine
            .create_container(Some("c-1"), &spec_with_binds(&["vol-1:/warden-cpi-dev/vol-1"]))
            .await
            .unwrap();
        assert_eq!(engine.volumes().await, vec!["node1/vol-1".to_string()]);
    }

    #[tokio::test]
    async fn test_kill_stopped_container_reports_not_running() {
        let engine = MockEngine::new();
        engine.create_container(Some("c-1"), &ContainerSpec::default()).await.unwrap();
        let err = engine.kill_container("c-1", "KILL").await.unwrap_err();
        assert!(err.is_not_running());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed_in_order() {
        let engine = MockEngine::new();
        engine
            .fail_times(MockOp::Ping, EngineError::Transport("EOF".into()), 2)
            .await;
        assert!(engine.ping().await.is_err());
        assert!(engine.ping().await.is_err());
        assert!(engine.ping().await.is_ok());
        assert_eq!(engine.calls(MockOp::Ping).await, 3);
    }

    #[tokio::test]
    async fn test_overlapping_subnet_names_existing_network() {
        let engine = MockEngine::new();
        engine
            .add_network("netB", Some("10.0.5.0/24".parse().unwrap()))
            .await;
        let err = engine
            .create_network(&NetworkRequest {
                name: "10.0.5.0/24".to_string(),
                driver: "bridge".to_string(),
                enable_ipv6: false,
                subnet: Some("10.0.5.0/24".parse().unwrap()),
                gateway: None,
            })
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("conflicts with network netB (br-netB): networks have overlapping IPv4"));
    }

    #[tokio::test]
    async fn test_files_round_trip_through_archives() {
        let engine = MockEngine::new();
        engine.add_container("c-1", ContainerSpec::default()).await;
        let archive = single_file_archive("/etc/motd", b"hello").unwrap();
        engine.copy_to_container("c-1", "/etc", archive).await.unwrap();
        assert_eq!(engine.file("c-1", "/etc/motd").await, Some(b"hello".to_vec()));

        let archive = engine.copy_from_container("c-1", "/etc/motd").await.unwrap();
        let files = unpack("/tmp", &archive).unwrap();
        assert_eq!(files, vec![("/tmp/motd".to_string(), b"hello".to_vec())]);

        let err = engine.copy_from_container("c-1", "/nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_probe_logs_follow_image_contents() {
        let engine = MockEngine::new();
        engine
            .add_image(
                "noble",
                MockImage {
                    os_release: Some("VERSION_CODENAME=noble".to_string()),
                    has_runsvdir: false,
                },
            )
            .await;
        let mut spec = ContainerSpec::default();
        spec.config.image = Some("noble".to_string());
        spec.config.cmd = Some(vec![
            "/bin/bash".to_string(),
            "-c".to_string(),
            "cat /etc/os-release; test -x /usr/sbin/runsvdir-start".to_string(),
        ]);
        let id = engine.create_container(None, &spec).await.unwrap();
        let logs = engine.container_logs(&id).await.unwrap();
        assert_eq!(logs, "VERSION_CODENAME=noble\nRUNSVDIR_MISSING\n");
    }
}
