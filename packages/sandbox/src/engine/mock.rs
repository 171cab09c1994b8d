// ABOUTME: In-memory engine for tests: containers, labels, ports, pause state and a tar-backed filesystem
// ABOUTME: Exec replies are scripted by a handler so tests can drive every command path

use super::{
    ArchiveStream, ContainerDetails, ContainerSpec, Engine, EngineKind, ExecChunk, ExecSession,
    ExecSpec, ExecState, StreamKind,
};
use crate::error::{Result, SandboxError};
use crate::sandbox::{Mount, PortMapping};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;
use std::path::{Component, Path};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const HEX: [char; 16] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f',
];

/// What a scripted exec does
#[derive(Debug, Clone)]
pub enum MockExecReply {
    Complete {
        exit_code: i64,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
    /// Print the output, then never finish
    Hang { stdout: Vec<u8>, stderr: Vec<u8> },
    /// Close the output stream but leave the exec record running with no exit code
    Unsettled,
}

impl MockExecReply {
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self::Complete {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: Vec::new(),
        }
    }

    pub fn exit(exit_code: i64, stderr: impl Into<Vec<u8>>) -> Self {
        Self::Complete {
            exit_code,
            stdout: Vec::new(),
            stderr: stderr.into(),
        }
    }

    pub fn hang() -> Self {
        Self::Hang {
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }
}

type ExecHandler = Arc<dyn Fn(&ExecSpec) -> MockExecReply + Send + Sync>;

#[derive(Debug, Clone)]
pub enum MockNode {
    Dir { mode: u32 },
    File { data: Vec<u8>, mode: u32 },
    Symlink { target: String },
}

struct MockContainer {
    id: String,
    name: String,
    image: String,
    labels: HashMap<String, String>,
    ports: Vec<PortMapping>,
    mounts: Vec<Mount>,
    status: &'static str,
    created_at: DateTime<Utc>,
    working_dir: String,
    fs: BTreeMap<String, MockNode>,
}

impl MockContainer {
    fn details(&self) -> ContainerDetails {
        ContainerDetails {
            id: self.id.clone(),
            name: self.name.clone(),
            image: self.image.clone(),
            status: self.status.to_string(),
            labels: self.labels.clone(),
            created_at: self.created_at,
            working_dir: Some(self.working_dir.clone()),
            ports: self.ports.clone(),
        }
    }

    fn holds_ports(&self) -> bool {
        matches!(self.status, "running" | "paused")
    }
}

struct MockExec {
    container_id: String,
    running: bool,
    exit_code: Option<i64>,
}

#[derive(Default)]
struct MockState {
    containers: Vec<MockContainer>,
    images: HashSet<String>,
    pullable: HashSet<String>,
    execs: HashMap<String, MockExec>,
    exec_log: Vec<(String, ExecSpec)>,
    create_calls: usize,
    largest_copy_in_chunk: usize,
}

/// Engine double that keeps everything in memory
pub struct MockEngine {
    kind: EngineKind,
    state: Mutex<MockState>,
    handler: Mutex<ExecHandler>,
    interrupt_copy_out: AtomicBool,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    /// Mock Docker with `docker-sandbox:base` and `alpine:latest` present
    pub fn new() -> Self {
        let state = MockState {
            images: HashSet::from([
                "docker-sandbox:base".to_string(),
                "alpine:latest".to_string(),
            ]),
            ..Default::default()
        };
        Self {
            kind: EngineKind::Docker,
            state: Mutex::new(state),
            handler: Mutex::new(Arc::new(|_| MockExecReply::ok(""))),
            interrupt_copy_out: AtomicBool::new(false),
        }
    }

    pub fn with_kind(mut self, kind: EngineKind) -> Self {
        self.kind = kind;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the exec handler; it sees every exec spec the engine receives
    pub fn on_exec<F>(&self, handler: F)
    where
        F: Fn(&ExecSpec) -> MockExecReply + Send + Sync + 'static,
    {
        *self
            .handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(handler);
    }

    /// Allow `image` to be pulled on demand
    pub fn add_pullable_image(&self, image: &str) {
        self.lock().pullable.insert(image.to_string());
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.lock().images.contains(image)
    }

    /// Make archive downloads break off halfway through
    pub fn interrupt_copy_out(&self, interrupt: bool) {
        self.interrupt_copy_out.store(interrupt, Ordering::SeqCst);
    }

    pub fn container_count(&self) -> usize {
        self.lock().containers.len()
    }

    pub fn create_calls(&self) -> usize {
        self.lock().create_calls
    }

    /// Size of the biggest single chunk any upload delivered
    pub fn largest_copy_in_chunk(&self) -> usize {
        self.lock().largest_copy_in_chunk
    }

    /// Every exec received so far, with the container id it targeted
    pub fn exec_log(&self) -> Vec<(String, ExecSpec)> {
        self.lock().exec_log.clone()
    }

    /// Mark a hanging exec as finished
    pub fn finish_exec(&self, exec_id: &str, exit_code: i64) {
        if let Some(exec) = self.lock().execs.get_mut(exec_id) {
            exec.running = false;
            exec.exit_code = Some(exit_code);
        }
    }

    /// Add a container the way an outside tool would, bypassing create/start
    pub fn insert_container(&self, name: &str, labels: HashMap<String, String>) -> String {
        let id = nanoid::nanoid!(64, &HEX);
        let container = MockContainer {
            id: id.clone(),
            name: name.to_string(),
            image: "alpine:latest".to_string(),
            labels,
            ports: Vec::new(),
            mounts: Vec::new(),
            status: "running",
            created_at: Utc::now(),
            working_dir: "/home/user".to_string(),
            fs: seed_fs("/home/user"),
        };
        self.lock().containers.push(container);
        id
    }

    /// Host binds the container was created with
    pub fn mounts(&self, id: &str) -> Vec<Mount> {
        self.lock()
            .containers
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.mounts.clone())
            .unwrap_or_default()
    }

    /// Remove a container behind the manager's back
    pub fn vanish(&self, id: &str) {
        self.lock().containers.retain(|c| c.id != id);
    }

    pub fn file(&self, id: &str, path: &str) -> Option<MockNode> {
        self.lock()
            .containers
            .iter()
            .find(|c| c.id == id)
            .and_then(|c| c.fs.get(&normalize(path)).cloned())
    }

    pub fn put_file(&self, id: &str, path: &str, data: &[u8]) {
        let mut state = self.lock();
        if let Some(container) = state.containers.iter_mut().find(|c| c.id == id) {
            let path = normalize(path);
            ensure_parents(&mut container.fs, &path);
            container.fs.insert(
                path,
                MockNode::File {
                    data: data.to_vec(),
                    mode: 0o644,
                },
            );
        }
    }

    fn err(&self, operation: &str, status: u16, message: impl Into<String>) -> SandboxError {
        SandboxError::engine_call(self.kind.as_str(), operation, Some(status), message)
    }

    fn with_container<T>(
        &self,
        operation: &str,
        id: &str,
        f: impl FnOnce(&mut MockContainer) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.lock();
        match state.containers.iter_mut().find(|c| c.id == id) {
            Some(container) => f(container),
            None => Err(self.err(operation, 404, format!("No such container: {}", id))),
        }
    }

    fn start_exec(&self, id: &str, spec: &ExecSpec) -> Result<(String, MockExecReply)> {
        let status = self.with_container("exec", id, |c| Ok(c.status))?;
        if status != "running" {
            return Err(self.err(
                "exec",
                409,
                format!("Container {} is {}, not running", id, status),
            ));
        }

        let handler = self
            .handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let reply = handler(spec);

        let exec_id = nanoid::nanoid!(64, &HEX);
        let (running, exit_code) = match &reply {
            MockExecReply::Complete { exit_code, .. } => (false, Some(*exit_code)),
            MockExecReply::Hang { .. } | MockExecReply::Unsettled => (true, None),
        };
        let mut state = self.lock();
        state.exec_log.push((id.to_string(), spec.clone()));
        state.execs.insert(
            exec_id.clone(),
            MockExec {
                container_id: id.to_string(),
                running,
                exit_code,
            },
        );
        Ok((exec_id, reply))
    }
}

fn seed_fs(working_dir: &str) -> BTreeMap<String, MockNode> {
    let mut fs = BTreeMap::new();
    fs.insert("/".to_string(), MockNode::Dir { mode: 0o755 });
    ensure_parents(&mut fs, &format!("{}/.keep", working_dir));
    ensure_parents(&mut fs, "/tmp/.keep");
    fs
}

fn normalize(path: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            Component::ParentDir => {
                parts.pop();
            }
            _ => {}
        }
    }
    format!("/{}", parts.join("/"))
}

fn parent_of(path: &str) -> String {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
    }
}

fn ensure_parents(fs: &mut BTreeMap<String, MockNode>, path: &str) {
    let mut current = parent_of(path);
    let mut missing = Vec::new();
    while !fs.contains_key(&current) {
        missing.push(current.clone());
        current = parent_of(&current);
    }
    for dir in missing {
        fs.insert(dir, MockNode::Dir { mode: 0o755 });
    }
}

fn join(dir: &str, name: &str) -> String {
    normalize(&format!("{}/{}", dir, name))
}

/// Pack `path` and everything beneath it, rooted at its basename
fn pack_subtree(fs: &BTreeMap<String, MockNode>, path: &str) -> std::io::Result<Vec<u8>> {
    let base = match path.rsplit_once('/') {
        Some((_, name)) if !name.is_empty() => name.to_string(),
        _ => ".".to_string(),
    };
    let prefix = if path == "/" {
        "/".to_string()
    } else {
        format!("{}/", path)
    };

    let mut builder = tar::Builder::new(Vec::new());
    for (node_path, node) in fs.range(path.to_string()..) {
        let relative = if node_path == path {
            base.clone()
        } else if let Some(rest) = node_path.strip_prefix(&prefix) {
            format!("{}/{}", base, rest)
        } else {
            continue;
        };

        let mut header = tar::Header::new_gnu();
        match node {
            MockNode::Dir { mode } => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(*mode);
                header.set_size(0);
                header.set_cksum();
                builder.append_data(&mut header, &relative, std::io::empty())?;
            }
            MockNode::File { data, mode } => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(*mode);
                header.set_size(data.len() as u64);
                header.set_cksum();
                builder.append_data(&mut header, &relative, data.as_slice())?;
            }
            MockNode::Symlink { target } => {
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_mode(0o777);
                header.set_size(0);
                builder.append_link(&mut header, &relative, target)?;
            }
        }
    }
    builder.into_inner()
}

fn unpack_into(
    fs: &mut BTreeMap<String, MockNode>,
    dest_dir: &str,
    archive: &[u8],
) -> std::io::Result<()> {
    let mut archive = tar::Archive::new(archive);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let relative = entry.path()?.to_string_lossy().to_string();
        let path = join(dest_dir, &relative);
        let mode = entry.header().mode().unwrap_or(0o644);
        let node = match entry.header().entry_type() {
            tar::EntryType::Directory => MockNode::Dir { mode },
            tar::EntryType::Symlink => MockNode::Symlink {
                target: entry
                    .link_name()?
                    .map(|t| t.to_string_lossy().to_string())
                    .unwrap_or_default(),
            },
            _ => {
                let mut data = Vec::new();
                entry.read_to_end(&mut data)?;
                MockNode::File { data, mode }
            }
        };
        ensure_parents(fs, &path);
        fs.insert(path, node);
    }
    Ok(())
}

#[async_trait]
impl Engine for MockEngine {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self.lock().images.contains(image))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let mut state = self.lock();
        if state.pullable.contains(image) {
            state.images.insert(image.to_string());
            Ok(())
        } else {
            Err(self.err(
                "pull",
                404,
                format!("pull access denied for {}, repository does not exist", image),
            ))
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.lock();
        state.create_calls += 1;
        if !state.images.contains(&spec.image) {
            return Err(self.err("create", 404, format!("No such image: {}", spec.image)));
        }
        if state.containers.iter().any(|c| c.name == spec.name) {
            return Err(self.err(
                "create",
                409,
                format!(
                    "Conflict. The container name \"/{}\" is already in use",
                    spec.name
                ),
            ));
        }

        let id = nanoid::nanoid!(64, &HEX);
        state.containers.push(MockContainer {
            id: id.clone(),
            name: spec.name.clone(),
            image: spec.image.clone(),
            labels: spec.labels.clone(),
            ports: spec.ports.clone(),
            mounts: spec.mounts.clone(),
            status: "created",
            created_at: Utc::now(),
            working_dir: spec.working_dir.clone(),
            fs: seed_fs(&spec.working_dir),
        });
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        let Some(index) = state.containers.iter().position(|c| c.id == id) else {
            return Err(self.err("start", 404, format!("No such container: {}", id)));
        };

        let wanted = state.containers[index].ports.clone();
        for other in state.containers.iter().filter(|c| c.id != id && c.holds_ports()) {
            if let Some(taken) = other
                .ports
                .iter()
                .find(|p| wanted.iter().any(|w| w.host_port == p.host_port))
            {
                return Err(self.err(
                    "start",
                    500,
                    format!(
                        "driver failed programming external connectivity: Bind for 127.0.0.1:{} failed: port is already allocated",
                        taken.host_port
                    ),
                ));
            }
        }

        state.containers[index].status = "running";
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> Result<()> {
        self.with_container("stop", id, |c| {
            c.status = "exited";
            Ok(())
        })?;
        let mut state = self.lock();
        for exec in state.execs.values_mut().filter(|e| e.container_id == id) {
            if exec.running {
                exec.running = false;
                exec.exit_code = Some(137);
            }
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        let running = self.with_container("remove", id, |c| Ok(c.holds_ports()))?;
        if running && !force {
            return Err(self.err(
                "remove",
                409,
                format!("cannot remove running container {}", id),
            ));
        }
        let mut state = self.lock();
        state.containers.retain(|c| c.id != id);
        state.execs.retain(|_, e| e.container_id != id);
        Ok(())
    }

    async fn pause_container(&self, id: &str) -> Result<()> {
        self.with_container("pause", id, |c| {
            if c.status != "running" {
                return Err(self.err("pause", 409, format!("Container {} is not running", id)));
            }
            c.status = "paused";
            Ok(())
        })
    }

    async fn unpause_container(&self, id: &str) -> Result<()> {
        self.with_container("unpause", id, |c| {
            if c.status != "paused" {
                return Err(self.err("unpause", 500, format!("Container {} is not paused", id)));
            }
            c.status = "running";
            Ok(())
        })
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails> {
        self.with_container("inspect", id, |c| Ok(c.details()))
    }

    async fn list_containers(&self, label_filters: &[String]) -> Result<Vec<ContainerDetails>> {
        let state = self.lock();
        Ok(state
            .containers
            .iter()
            .filter(|c| {
                label_filters.iter().all(|filter| match filter.split_once('=') {
                    Some((key, value)) => c.labels.get(key).map(String::as_str) == Some(value),
                    None => c.labels.contains_key(filter),
                })
            })
            .map(MockContainer::details)
            .collect())
    }

    async fn exec(&self, id: &str, spec: &ExecSpec) -> Result<ExecSession> {
        let (exec_id, reply) = self.start_exec(id, spec)?;

        let chunk = |kind: StreamKind, data: Vec<u8>| {
            (!data.is_empty()).then(|| {
                Ok::<_, SandboxError>(ExecChunk {
                    stream: kind,
                    data: Bytes::from(data),
                })
            })
        };
        let output = match reply {
            MockExecReply::Complete { stdout, stderr, .. } => stream::iter(
                [
                    chunk(StreamKind::Stdout, stdout),
                    chunk(StreamKind::Stderr, stderr),
                ]
                .into_iter()
                .flatten(),
            )
            .boxed(),
            MockExecReply::Hang { stdout, stderr } => stream::iter(
                [
                    chunk(StreamKind::Stdout, stdout),
                    chunk(StreamKind::Stderr, stderr),
                ]
                .into_iter()
                .flatten(),
            )
            .chain(stream::pending())
            .boxed(),
            MockExecReply::Unsettled => stream::empty().boxed(),
        };

        Ok(ExecSession { exec_id, output })
    }

    async fn exec_detached(&self, id: &str, spec: &ExecSpec) -> Result<String> {
        self.start_exec(id, spec).map(|(exec_id, _)| exec_id)
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecState> {
        let state = self.lock();
        match state.execs.get(exec_id) {
            Some(exec) => Ok(ExecState {
                running: exec.running,
                exit_code: exec.exit_code,
            }),
            None => Err(self.err(
                "inspect exec",
                404,
                format!("No such exec instance: {}", exec_id),
            )),
        }
    }

    async fn copy_in(&self, id: &str, dest_dir: &str, mut archive: ArchiveStream) -> Result<()> {
        let dest = normalize(dest_dir);
        self.with_container("copy in", id, |c| match c.fs.get(&dest) {
            Some(MockNode::Dir { .. }) => Ok(()),
            Some(_) => Err(self.err(
                "copy in",
                400,
                format!("extraction point is not a directory: {}", dest),
            )),
            None => Err(self.err(
                "copy in",
                404,
                format!("Could not find the file {} in container {}", dest, id),
            )),
        })?;

        let mut data = Vec::new();
        while let Some(chunk) = archive.next().await {
            let chunk = chunk?;
            {
                let mut state = self.lock();
                state.largest_copy_in_chunk = state.largest_copy_in_chunk.max(chunk.len());
            }
            data.extend_from_slice(&chunk);
        }

        self.with_container("copy in", id, |c| {
            unpack_into(&mut c.fs, &dest, &data)
                .map_err(|e| self.err("copy in", 400, e.to_string()))
        })
    }

    async fn copy_out(&self, id: &str, path: &str) -> Result<ArchiveStream> {
        let archive = self.with_container("copy out", id, |c| {
            let path = normalize(path);
            if !c.fs.contains_key(&path) {
                return Err(self.err(
                    "copy out",
                    404,
                    format!("Could not find the file {} in container {}", path, id),
                ));
            }
            pack_subtree(&c.fs, &path).map_err(|e| self.err("copy out", 500, e.to_string()))
        })?;

        // Hand the archive out in small chunks like a real socket would
        let chunks: Vec<Bytes> = archive.chunks(512).map(Bytes::copy_from_slice).collect();
        if self.interrupt_copy_out.load(Ordering::SeqCst) {
            let half = chunks.len() / 2;
            let broken = self.err("copy out", 500, "unexpected EOF in archive stream");
            let items: Vec<Result<Bytes>> = chunks
                .into_iter()
                .take(half)
                .map(Ok)
                .chain(std::iter::once(Err(broken)))
                .collect();
            return Ok(stream::iter(items).boxed());
        }
        Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn spec(name: &str, ports: Vec<PortMapping>) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: "alpine:latest".to_string(),
            labels: HashMap::from([("csbx.managed".to_string(), "true".to_string())]),
            env: HashMap::new(),
            ports,
            mounts: Vec::new(),
            command: vec!["sleep".to_string(), "infinity".to_string()],
            working_dir: "/home/user".to_string(),
        }
    }

    fn single_chunk(data: Vec<u8>) -> ArchiveStream {
        stream::iter([Ok(Bytes::from(data))]).boxed()
    }

    #[tokio::test]
    async fn test_name_conflict_is_409() {
        let engine = MockEngine::new();
        engine.create_container(&spec("csbx-a", vec![])).await.unwrap();
        let err = engine
            .create_container(&spec("csbx-a", vec![]))
            .await
            .unwrap_err();
        assert!(err.is_engine_conflict());
    }

    #[tokio::test]
    async fn test_port_collision_fails_at_start() {
        let engine = MockEngine::new();
        let a = engine
            .create_container(&spec("csbx-a", vec![PortMapping::new(8080, 80)]))
            .await
            .unwrap();
        engine.start_container(&a).await.unwrap();
        let b = engine
            .create_container(&spec("csbx-b", vec![PortMapping::new(8080, 3000)]))
            .await
            .unwrap();
        let err = engine.start_container(&b).await.unwrap_err();
        assert!(err.to_string().contains("port is already allocated"));
    }

    #[tokio::test]
    async fn test_copy_round_trip_keeps_tree() {
        let engine = MockEngine::new();
        let id = engine.create_container(&spec("csbx-a", vec![])).await.unwrap();

        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(5);
        header.set_mode(0o600);
        header.set_cksum();
        builder
            .append_data(&mut header, "proj/notes.txt", &b"hello"[..])
            .unwrap();
        let archive = builder.into_inner().unwrap();
        engine
            .copy_in(&id, "/home/user", single_chunk(archive))
            .await
            .unwrap();

        let chunks: Vec<Bytes> = engine
            .copy_out(&id, "/home/user/proj")
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let data: Vec<u8> = chunks.concat();
        let mut archive = tar::Archive::new(data.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["proj", "proj/notes.txt"]);
    }

    #[tokio::test]
    async fn test_copy_in_missing_dir_is_404() {
        let engine = MockEngine::new();
        let id = engine.create_container(&spec("csbx-a", vec![])).await.unwrap();
        let err = engine
            .copy_in(&id, "/nope", single_chunk(Vec::new()))
            .await
            .unwrap_err();
        assert!(err.is_engine_not_found());
    }
}
