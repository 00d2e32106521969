//! In-memory runtime for tests and offline development.
//!
//! Containers are plain records with a tiny file tree. Archive transfers
//! follow Docker's conventions: `put_archive` unpacks into an existing
//! directory, `get_archive` returns the addressed path under its base name.

use super::{
    ContainerRuntime, ContainerSpec, ContainerSummary, ExecSession, ExecSpec, ExecStatus,
    OutputChunk,
};
use crate::error::RuntimeError;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io::Read;
use std::path::{Component, Path};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

/// Canned result for the next exec started on a [`MemoryRuntime`].
#[derive(Debug, Clone, Default)]
pub struct ScriptedExec {
    /// Output chunks, delivered in order.
    pub chunks: Vec<OutputChunk>,
    /// Exit code reported once the output is drained.
    pub exit_code: i64,
    /// Status queries answered with "still running" before the exit code.
    pub running_polls: u32,
}

impl ScriptedExec {
    /// An exec exiting with `exit_code` and no output.
    pub fn new(exit_code: i64) -> Self {
        Self {
            chunks: Vec::new(),
            exit_code,
            running_polls: 0,
        }
    }

    /// Report the exec as running for the first `polls` status queries.
    pub fn running_for(mut self, polls: u32) -> Self {
        self.running_polls = polls;
        self
    }

    /// Append a stdout chunk.
    pub fn stdout(mut self, data: impl Into<bytes::Bytes>) -> Self {
        self.chunks.push(OutputChunk::stdout(data));
        self
    }

    /// Append a stderr chunk.
    pub fn stderr(mut self, data: impl Into<bytes::Bytes>) -> Self {
        self.chunks.push(OutputChunk::stderr(data));
        self
    }
}

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Vec<u8>),
}

#[derive(Debug)]
struct FakeContainer {
    spec: ContainerSpec,
    running: bool,
    files: BTreeMap<String, Node>,
}

#[derive(Debug)]
struct FakeExec {
    exit_code: i64,
    running_polls: u32,
}

#[derive(Debug, Default)]
struct State {
    images: HashSet<String>,
    containers: HashMap<String, FakeContainer>,
    execs: HashMap<String, FakeExec>,
    scripted: VecDeque<ScriptedExec>,
    exec_log: Vec<ExecSpec>,
    create_calls: usize,
    pull_calls: usize,
    fail_pulls: bool,
    fail_next_create: bool,
    fail_next_remove: bool,
}

/// [`ContainerRuntime`] that keeps everything in process memory.
#[derive(Debug, Default)]
pub struct MemoryRuntime {
    state: Mutex<State>,
    create_delay: Option<Duration>,
    stop_delay: Option<Duration>,
}

impl MemoryRuntime {
    /// Runtime with no local images.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an image as already present.
    pub fn with_image(self, reference: impl Into<String>) -> Self {
        self.lock().images.insert(reference.into());
        self
    }

    /// Delay every container creation, to widen race windows in tests.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    /// Delay every container stop, like a daemon waiting out the grace period.
    pub fn with_stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = Some(delay);
        self
    }

    /// Make image pulls fail.
    pub fn fail_pulls(&self, fail: bool) {
        self.lock().fail_pulls = fail;
    }

    /// Fail the next creation after the container record already exists.
    pub fn fail_next_create(&self) {
        self.lock().fail_next_create = true;
    }

    /// Fail the next `remove_container` call without touching the container.
    pub fn fail_next_remove(&self) {
        self.lock().fail_next_remove = true;
    }

    /// Queue the result of the next exec.
    pub fn push_exec(&self, exec: ScriptedExec) {
        self.lock().scripted.push_back(exec);
    }

    /// Every exec started so far, in order.
    pub fn exec_log(&self) -> Vec<ExecSpec> {
        self.lock().exec_log.clone()
    }

    /// Number of `create_container` calls, failed ones included.
    pub fn create_calls(&self) -> usize {
        self.lock().create_calls
    }

    /// Number of `pull_image` calls.
    pub fn pull_calls(&self) -> usize {
        self.lock().pull_calls
    }

    /// Names of all existing containers, sorted.
    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .lock()
            .containers
            .values()
            .map(|c| c.spec.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Spec a container was created with, looked up by name.
    pub fn container_spec(&self, name: &str) -> Option<ContainerSpec> {
        self.lock()
            .containers
            .values()
            .find(|c| c.spec.name == name)
            .map(|c| c.spec.clone())
    }

    /// Write a file into a container, creating parent directories.
    pub fn write_file(&self, id: &str, path: &str, data: impl Into<Vec<u8>>) -> bool {
        let mut state = self.lock();
        let Some(container) = state.containers.get_mut(id) else {
            return false;
        };
        let path = normalize(path);
        ensure_dir(&mut container.files, parent_of(&path));
        container.files.insert(path, Node::File(data.into()));
        true
    }

    /// Create a directory (and its parents) in a container.
    pub fn make_dir(&self, id: &str, path: &str) -> bool {
        let mut state = self.lock();
        let Some(container) = state.containers.get_mut(id) else {
            return false;
        };
        ensure_dir(&mut container.files, &normalize(path));
        true
    }

    /// Read a file from a container.
    pub fn read_file(&self, id: &str, path: &str) -> Option<Vec<u8>> {
        let state = self.lock();
        match state.containers.get(id)?.files.get(&normalize(path))? {
            Node::File(data) => Some(data.clone()),
            Node::Dir => None,
        }
    }

    /// Whether `path` exists as a directory in a container.
    pub fn is_dir(&self, id: &str, path: &str) -> bool {
        let state = self.lock();
        state
            .containers
            .get(id)
            .and_then(|c| c.files.get(&normalize(path)))
            .is_some_and(|node| matches!(node, Node::Dir))
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Absolute, slash-separated form of `path` without `.` or trailing slashes.
fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().unwrap_or_default()),
            Component::ParentDir => {
                parts.pop();
            }
            _ => {}
        }
    }
    format!("/{}", parts.join("/"))
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or(".")
}

fn join(dir: &str, rel: &str) -> String {
    if dir == "/" {
        normalize(rel)
    } else {
        normalize(&format!("{dir}/{rel}"))
    }
}

fn ensure_dir(files: &mut BTreeMap<String, Node>, path: &str) {
    let mut current = String::new();
    files.insert("/".into(), Node::Dir);
    for part in path.split('/').filter(|p| !p.is_empty()) {
        current.push('/');
        current.push_str(part);
        files.entry(current.clone()).or_insert(Node::Dir);
    }
}

fn tar_header(kind: tar::EntryType, size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(kind);
    header.set_size(size);
    header.set_mode(if kind == tar::EntryType::Directory {
        0o755
    } else {
        0o644
    });
    header.set_mtime(0);
    header
}

fn archive_error(err: std::io::Error) -> RuntimeError {
    RuntimeError::Api(format!("malformed archive: {err}"))
}

fn unpack_into(
    files: &mut BTreeMap<String, Node>,
    dest: &str,
    archive: &[u8],
) -> Result<(), RuntimeError> {
    let mut archive = tar::Archive::new(archive);
    for entry in archive.entries().map_err(archive_error)? {
        let mut entry = entry.map_err(archive_error)?;
        let rel = entry.path().map_err(archive_error)?.to_string_lossy().into_owned();
        let target = join(dest, &rel);
        match entry.header().entry_type() {
            tar::EntryType::Directory => ensure_dir(files, &target),
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                let mut data = Vec::new();
                entry.read_to_end(&mut data).map_err(archive_error)?;
                ensure_dir(files, parent_of(&target));
                files.insert(target, Node::File(data));
            }
            _ => {}
        }
    }
    Ok(())
}

fn pack_from(files: &BTreeMap<String, Node>, path: &str) -> Result<Vec<u8>, RuntimeError> {
    let root = base_name(path);
    let mut builder = tar::Builder::new(Vec::new());

    let node = files
        .get(path)
        .ok_or_else(|| RuntimeError::NotFound(format!("Could not find the file {path}")))?;
    match node {
        Node::File(data) => {
            let mut header = tar_header(tar::EntryType::Regular, data.len() as u64);
            builder
                .append_data(&mut header, root, data.as_slice())
                .map_err(archive_error)?;
        }
        Node::Dir => {
            let mut header = tar_header(tar::EntryType::Directory, 0);
            builder
                .append_data(&mut header, root, std::io::empty())
                .map_err(archive_error)?;
            let prefix = if path == "/" {
                "/".to_string()
            } else {
                format!("{path}/")
            };
            for (child, node) in files.range(prefix.clone()..) {
                let Some(rel) = child.strip_prefix(&prefix) else {
                    break;
                };
                if rel.is_empty() {
                    continue;
                }
                let name = format!("{root}/{rel}");
                match node {
                    Node::Dir => {
                        let mut header = tar_header(tar::EntryType::Directory, 0);
                        builder
                            .append_data(&mut header, name, std::io::empty())
                            .map_err(archive_error)?;
                    }
                    Node::File(data) => {
                        let mut header = tar_header(tar::EntryType::Regular, data.len() as u64);
                        builder
                            .append_data(&mut header, name, data.as_slice())
                            .map_err(archive_error)?;
                    }
                }
            }
        }
    }

    builder.into_inner().map_err(archive_error)
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn image_exists(&self, reference: &str) -> Result<bool, RuntimeError> {
        Ok(self.lock().images.contains(reference))
    }

    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        state.pull_calls += 1;
        if state.fail_pulls {
            return Err(RuntimeError::Api(format!(
                "pull access denied for {reference}"
            )));
        }
        state.images.insert(reference.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        state.create_calls += 1;

        if !state.images.contains(&spec.image) {
            return Err(RuntimeError::NotFound(format!(
                "No such image: {}",
                spec.image
            )));
        }
        if state.containers.values().any(|c| c.spec.name == spec.name) {
            return Err(RuntimeError::Api(format!(
                "Conflict. The container name \"/{}\" is already in use",
                spec.name
            )));
        }

        let id = Uuid::new_v4().simple().to_string();
        let mut files = BTreeMap::new();
        ensure_dir(&mut files, "/tmp");
        ensure_dir(&mut files, &normalize(&spec.working_dir));

        let failing = std::mem::take(&mut state.fail_next_create);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                running: !failing,
                files,
            },
        );

        if failing {
            return Err(RuntimeError::Api(format!(
                "cannot start container {}: injected failure",
                spec.name
            )));
        }
        Ok(id)
    }

    async fn list_containers(
        &self,
        name_filter: &str,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        Ok(self
            .lock()
            .containers
            .iter()
            .filter(|(_, c)| c.spec.name.contains(name_filter))
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                names: vec![c.spec.name.clone()],
            })
            .collect())
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        if let Some(delay) = self.stop_delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(format!("No such container: {id}")))?;
        container.running = false;
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        if std::mem::take(&mut state.fail_next_remove) {
            return Err(RuntimeError::Api(format!(
                "removal of container {id} is already in progress"
            )));
        }
        match state.containers.get(id) {
            None => Err(RuntimeError::NotFound(format!("No such container: {id}"))),
            Some(c) if c.running && !force => Err(RuntimeError::Api(format!(
                "cannot remove running container {id}"
            ))),
            Some(_) => {
                state.containers.remove(id);
                Ok(())
            }
        }
    }

    async fn put_archive(
        &self,
        id: &str,
        path: &str,
        archive: Vec<u8>,
    ) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(format!("No such container: {id}")))?;

        let dest = normalize(path);
        if !matches!(container.files.get(&dest), Some(Node::Dir)) {
            return Err(RuntimeError::NotFound(format!(
                "Could not find the file {path} in container {id}"
            )));
        }
        unpack_into(&mut container.files, &dest, &archive)
    }

    async fn get_archive(&self, id: &str, path: &str) -> Result<Vec<u8>, RuntimeError> {
        let state = self.lock();
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(format!("No such container: {id}")))?;
        pack_from(&container.files, &normalize(path))
    }

    async fn port_bindings(&self, id: &str) -> Result<HashMap<String, Vec<u16>>, RuntimeError> {
        let state = self.lock();
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(format!("No such container: {id}")))?;
        Ok(container
            .spec
            .port_bindings
            .iter()
            .map(|(port, host)| (port.clone(), vec![*host]))
            .collect())
    }

    async fn start_exec(&self, id: &str, spec: &ExecSpec) -> Result<ExecSession, RuntimeError> {
        let mut state = self.lock();
        match state.containers.get(id) {
            Some(c) if c.running => {}
            Some(_) => {
                return Err(RuntimeError::Api(format!("container {id} is not running")));
            }
            None => return Err(RuntimeError::NotFound(format!("No such container: {id}"))),
        }

        state.exec_log.push(spec.clone());
        let script = state.scripted.pop_front().unwrap_or_default();
        let exec_id = Uuid::new_v4().simple().to_string();
        state.execs.insert(
            exec_id.clone(),
            FakeExec {
                exit_code: script.exit_code,
                running_polls: script.running_polls,
            },
        );

        Ok(ExecSession {
            exec_id,
            output: futures::stream::iter(script.chunks.into_iter().map(Ok)).boxed(),
        })
    }

    async fn exec_status(&self, exec_id: &str) -> Result<ExecStatus, RuntimeError> {
        let mut state = self.lock();
        let exec = state
            .execs
            .get_mut(exec_id)
            .ok_or_else(|| RuntimeError::NotFound(format!("No such exec instance: {exec_id}")))?;
        if exec.running_polls > 0 {
            exec.running_polls -= 1;
            return Ok(ExecStatus {
                running: true,
                exit_code: None,
            });
        }
        Ok(ExecStatus {
            running: false,
            exit_code: Some(exec.exit_code),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.into(),
            image: "ubuntu:latest".into(),
            working_dir: "/opt".into(),
            memory_bytes: None,
            cpu_period: None,
            cpu_quota: None,
            network_enabled: false,
            privileged: false,
            env: Vec::new(),
            port_bindings: HashMap::new(),
        }
    }

    fn entry_names(archive: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(archive);
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let path = e.unwrap().path().unwrap().to_string_lossy().into_owned();
                path.trim_end_matches('/').to_string()
            })
            .collect()
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/opt/"), "/opt");
        assert_eq!(normalize("opt/./a"), "/opt/a");
        assert_eq!(normalize("/opt/a/../b"), "/opt/b");
        assert_eq!(normalize("/"), "/");
        assert_eq!(parent_of("/opt/a"), "/opt");
        assert_eq!(parent_of("/opt"), "/");
        assert_eq!(base_name("/opt/a.txt"), "a.txt");
    }

    #[tokio::test]
    async fn test_create_requires_image() {
        let rt = MemoryRuntime::new();
        let err = rt.create_container(&spec("c1")).await.unwrap_err();
        assert!(err.is_not_found());

        rt.pull_image("ubuntu:latest").await.unwrap();
        let id = rt.create_container(&spec("c1")).await.unwrap();
        assert!(rt.is_dir(&id, "/opt"));
        assert_eq!(rt.create_calls(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_name_conflicts() {
        let rt = MemoryRuntime::new().with_image("ubuntu:latest");
        rt.create_container(&spec("c1")).await.unwrap();
        assert!(matches!(
            rt.create_container(&spec("c1")).await,
            Err(RuntimeError::Api(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_failure_leaves_container() {
        let rt = MemoryRuntime::new().with_image("ubuntu:latest");
        rt.fail_next_create();
        assert!(rt.create_container(&spec("c1")).await.is_err());
        assert_eq!(rt.container_names(), vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn test_archive_round_trip_dir() {
        let rt = MemoryRuntime::new().with_image("ubuntu:latest");
        let id = rt.create_container(&spec("c1")).await.unwrap();
        rt.write_file(&id, "/opt/data/a.txt", "A");
        rt.write_file(&id, "/opt/data/sub/b.txt", "B");

        let archive = rt.get_archive(&id, "/opt/data").await.unwrap();
        assert_eq!(
            entry_names(&archive),
            vec!["data", "data/a.txt", "data/sub", "data/sub/b.txt"]
        );

        rt.put_archive(&id, "/tmp", archive).await.unwrap();
        assert_eq!(rt.read_file(&id, "/tmp/data/sub/b.txt").unwrap(), b"B");
    }

    #[tokio::test]
    async fn test_put_archive_requires_directory() {
        let rt = MemoryRuntime::new().with_image("ubuntu:latest");
        let id = rt.create_container(&spec("c1")).await.unwrap();
        let err = rt.put_archive(&id, "/missing", Vec::new()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_get_archive_missing_path() {
        let rt = MemoryRuntime::new().with_image("ubuntu:latest");
        let id = rt.create_container(&spec("c1")).await.unwrap();
        let err = rt.get_archive(&id, "/opt/nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_scripted_exec() {
        let rt = MemoryRuntime::new().with_image("ubuntu:latest");
        let id = rt.create_container(&spec("c1")).await.unwrap();
        rt.push_exec(ScriptedExec::new(3).stdout("hi\n"));

        let session = rt
            .start_exec(
                &id,
                &ExecSpec {
                    cmd: vec!["echo".into(), "hi".into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let chunks: Vec<_> = session.output.collect().await;
        assert_eq!(chunks.len(), 1);

        let status = rt.exec_status(&session.exec_id).await.unwrap();
        assert_eq!(status.exit_code, Some(3));
        assert_eq!(rt.exec_log()[0].cmd, vec!["echo", "hi"]);
    }

    #[tokio::test]
    async fn test_remove_running_requires_force() {
        let rt = MemoryRuntime::new().with_image("ubuntu:latest");
        let id = rt.create_container(&spec("c1")).await.unwrap();
        assert!(rt.remove_container(&id, false).await.is_err());
        rt.stop_container(&id, Duration::from_secs(1)).await.unwrap();
        rt.remove_container(&id, false).await.unwrap();
        assert!(rt.container_names().is_empty());
    }

    #[tokio::test]
    async fn test_exec_reports_running_before_exit() {
        let rt = MemoryRuntime::new().with_image("ubuntu:latest");
        let id = rt.create_container(&spec("c1")).await.unwrap();
        rt.push_exec(ScriptedExec::new(5).running_for(2));

        let session = rt.start_exec(&id, &ExecSpec::default()).await.unwrap();
        for _ in 0..2 {
            let status = rt.exec_status(&session.exec_id).await.unwrap();
            assert!(status.running);
            assert_eq!(status.exit_code, None);
        }
        let status = rt.exec_status(&session.exec_id).await.unwrap();
        assert!(!status.running);
        assert_eq!(status.exit_code, Some(5));
    }

    #[tokio::test]
    async fn test_fail_next_remove_fails_once() {
        let rt = MemoryRuntime::new().with_image("ubuntu:latest");
        let id = rt.create_container(&spec("c1")).await.unwrap();
        rt.fail_next_remove();

        assert!(rt.remove_container(&id, true).await.is_err());
        assert_eq!(rt.container_names(), vec!["c1".to_string()]);
        rt.remove_container(&id, true).await.unwrap();
        assert!(rt.container_names().is_empty());
    }
}
