use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use super::fingerprint::DigestAlgorithm;
use super::local_fs::{EventSink, LocalEntry, LocalFs, LocalFsError, LocalWatch, RawLocalEvent};
use super::paths;
use super::remote::{RemoteChange, RemoteChangeBatch, RemoteClient, RemoteDescriptor, RemoteError};
use super::store::{ChangeKind, ItemKind};

#[derive(Debug, Clone)]
struct Node {
    kind: ItemKind,
    content: Bytes,
    tag: Option<String>,
    file_id: u64,
    mtime: i64,
}

struct FsState {
    nodes: BTreeMap<String, Node>,
    next_file_id: u64,
    clock: i64,
    sink: Option<(u64, EventSink)>,
    watch_generation: u64,
}

impl FsState {
    fn emit(&self, event: RawLocalEvent) {
        if let Some((_, sink)) = &self.sink {
            sink.send(event);
        }
    }

    fn tick(&mut self) -> i64 {
        self.clock += 1_000;
        self.clock
    }

    fn new_node(&mut self, kind: ItemKind, content: Bytes) -> Node {
        self.next_file_id += 1;
        let mtime = self.tick();
        Node {
            kind,
            content,
            tag: None,
            file_id: self.next_file_id,
            mtime,
        }
    }

    fn subtree(&self, path: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|p| paths::is_within(p, path))
            .cloned()
            .collect()
    }

    fn parent_is_folder(&self, path: &str) -> bool {
        paths::parent_path(path)
            .and_then(|parent| self.nodes.get(parent))
            .is_some_and(|node| node.kind == ItemKind::Folder)
    }
}

/// In-memory [`LocalFs`]. Engine-initiated changes and the test helpers both
/// notify the active watch, like a real watcher would.
#[derive(Clone)]
pub struct MemoryFs {
    state: Arc<Mutex<FsState>>,
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFs {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            paths::ROOT.to_string(),
            Node {
                kind: ItemKind::Folder,
                content: Bytes::new(),
                tag: None,
                file_id: 1,
                mtime: 0,
            },
        );
        Self {
            state: Arc::new(Mutex::new(FsState {
                nodes,
                next_file_id: 1,
                clock: 1_700_000_000_000,
                sink: None,
                watch_generation: 0,
            })),
        }
    }

    pub fn mkdir(&self, path: &str) {
        let mut state = self.state.lock();
        let mut missing = Vec::new();
        let mut current = Some(path);
        while let Some(p) = current {
            if state.nodes.contains_key(p) {
                break;
            }
            missing.push(p.to_string());
            current = paths::parent_path(p);
        }
        for p in missing.into_iter().rev() {
            let node = state.new_node(ItemKind::Folder, Bytes::new());
            state.nodes.insert(p.clone(), node);
            state.emit(RawLocalEvent::Created(p));
        }
    }

    pub fn put_file(&self, path: &str, content: &str) {
        if let Some(parent) = paths::parent_path(path) {
            self.mkdir(parent);
        }
        let mut state = self.state.lock();
        let mtime = state.tick();
        let content = Bytes::copy_from_slice(content.as_bytes());
        match state.nodes.get_mut(path) {
            Some(node) => {
                node.content = content;
                node.mtime = mtime;
                state.emit(RawLocalEvent::Modified(path.to_string()));
            }
            None => {
                let node = state.new_node(ItemKind::File, content);
                state.nodes.insert(path.to_string(), node);
                state.emit(RawLocalEvent::Created(path.to_string()));
            }
        }
    }

    pub fn remove(&self, path: &str) {
        let mut state = self.state.lock();
        for p in state.subtree(path) {
            state.nodes.remove(&p);
        }
        state.emit(RawLocalEvent::Deleted(path.to_string()));
    }

    /// User-level rename; tags and file ids travel with the objects.
    pub fn move_path(&self, from: &str, to: &str) {
        let mut state = self.state.lock();
        Self::move_nodes(&mut state, from, to);
        state.emit(RawLocalEvent::Moved {
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    /// Recursive copy; copies get new file ids and keep the tags only when
    /// `keep_tags` is set (like `cp -a` preserving extended attributes).
    pub fn copy_tree(&self, from: &str, to: &str, keep_tags: bool) {
        let mut state = self.state.lock();
        let sources: Vec<(String, Node)> = state
            .subtree(from)
            .into_iter()
            .filter_map(|p| state.nodes.get(&p).cloned().map(|n| (p, n)))
            .collect();
        for (path, node) in sources {
            let target = format!("{to}{}", &path[from.len()..]);
            let mut copy = state.new_node(node.kind, node.content.clone());
            if keep_tags {
                copy.tag = node.tag.clone();
            }
            state.nodes.insert(target.clone(), copy);
            state.emit(RawLocalEvent::Created(target));
        }
    }

    pub fn set_tag(&self, path: &str, tag: Option<&str>) {
        if let Some(node) = self.state.lock().nodes.get_mut(path) {
            node.tag = tag.map(str::to_string);
        }
    }

    pub fn tag(&self, path: &str) -> Option<String> {
        self.state.lock().nodes.get(path).and_then(|n| n.tag.clone())
    }

    pub fn content(&self, path: &str) -> Option<String> {
        self.state
            .lock()
            .nodes
            .get(path)
            .map(|n| String::from_utf8_lossy(&n.content).into_owned())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().nodes.contains_key(path)
    }

    pub fn child_names(&self, path: &str) -> Vec<String> {
        let state = self.state.lock();
        state
            .nodes
            .keys()
            .filter(|p| paths::parent_path(p) == Some(path))
            .map(|p| paths::file_name(p).to_string())
            .collect()
    }

    fn move_nodes(state: &mut FsState, from: &str, to: &str) {
        for path in state.subtree(from) {
            if let Some(node) = state.nodes.remove(&path) {
                let target = format!("{to}{}", &path[from.len()..]);
                state.nodes.insert(target, node);
            }
        }
    }

    fn entry(path: &str, node: &Node) -> LocalEntry {
        LocalEntry {
            path: path.to_string(),
            kind: node.kind,
            fingerprint: match node.kind {
                ItemKind::File => Some(DigestAlgorithm::Md5.digest(&node.content)),
                ItemKind::Folder => None,
            },
            mtime: Some(node.mtime),
            size: node.content.len() as u64,
            tag: node.tag.clone(),
            file_id: Some(node.file_id.to_string()),
        }
    }
}

struct WatchGuard {
    state: Arc<Mutex<FsState>>,
    generation: u64,
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if state.sink.as_ref().is_some_and(|(g, _)| *g == self.generation) {
            state.sink = None;
        }
    }
}

#[async_trait]
impl LocalFs for MemoryFs {
    async fn list(&self, path: &str) -> Result<Vec<LocalEntry>, LocalFsError> {
        let state = self.state.lock();
        if !state.nodes.contains_key(path) {
            return Err(LocalFsError::NotFound(path.to_string()));
        }
        Ok(state
            .nodes
            .iter()
            .filter(|(p, _)| paths::parent_path(p) == Some(path))
            .map(|(p, node)| Self::entry(p, node))
            .collect())
    }

    async fn stat(&self, path: &str) -> Result<Option<LocalEntry>, LocalFsError> {
        Ok(self
            .state
            .lock()
            .nodes
            .get(path)
            .map(|node| Self::entry(path, node)))
    }

    async fn read_tag(&self, path: &str) -> Result<Option<String>, LocalFsError> {
        Ok(self.tag(path))
    }

    async fn write_tag(&self, path: &str, tag: &str) -> Result<(), LocalFsError> {
        let mut state = self.state.lock();
        let node = state
            .nodes
            .get_mut(path)
            .ok_or_else(|| LocalFsError::NotFound(path.to_string()))?;
        node.tag = Some(tag.to_string());
        Ok(())
    }

    async fn create_folder(&self, path: &str) -> Result<LocalEntry, LocalFsError> {
        let mut state = self.state.lock();
        if let Some(node) = state.nodes.get(path) {
            return match node.kind {
                ItemKind::Folder => Ok(Self::entry(path, node)),
                ItemKind::File => Err(LocalFsError::AlreadyExists(path.to_string())),
            };
        }
        if !state.parent_is_folder(path) {
            return Err(LocalFsError::NotFound(path.to_string()));
        }
        let node = state.new_node(ItemKind::Folder, Bytes::new());
        let entry = Self::entry(path, &node);
        state.nodes.insert(path.to_string(), node);
        state.emit(RawLocalEvent::Created(path.to_string()));
        Ok(entry)
    }

    async fn write_file(
        &self,
        path: &str,
        content: Bytes,
        tag: Option<&str>,
    ) -> Result<LocalEntry, LocalFsError> {
        let mut state = self.state.lock();
        if !state.parent_is_folder(path) {
            return Err(LocalFsError::NotFound(path.to_string()));
        }
        let existed = state.nodes.contains_key(path);
        let mut node = state.new_node(ItemKind::File, content);
        node.tag = tag.map(str::to_string);
        let entry = Self::entry(path, &node);
        state.nodes.insert(path.to_string(), node);
        state.emit(if existed {
            RawLocalEvent::Modified(path.to_string())
        } else {
            RawLocalEvent::Created(path.to_string())
        });
        Ok(entry)
    }

    async fn read_file(&self, path: &str) -> Result<Bytes, LocalFsError> {
        self.state
            .lock()
            .nodes
            .get(path)
            .map(|n| n.content.clone())
            .ok_or_else(|| LocalFsError::NotFound(path.to_string()))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<LocalEntry, LocalFsError> {
        let mut state = self.state.lock();
        if !state.nodes.contains_key(from) {
            return Err(LocalFsError::NotFound(from.to_string()));
        }
        if state.nodes.contains_key(to) {
            return Err(LocalFsError::AlreadyExists(to.to_string()));
        }
        if !state.parent_is_folder(to) {
            return Err(LocalFsError::NotFound(to.to_string()));
        }
        Self::move_nodes(&mut state, from, to);
        state.emit(RawLocalEvent::Moved {
            from: from.to_string(),
            to: to.to_string(),
        });
        let node = state
            .nodes
            .get(to)
            .ok_or_else(|| LocalFsError::NotFound(to.to_string()))?;
        Ok(Self::entry(to, node))
    }

    async fn delete(&self, path: &str) -> Result<(), LocalFsError> {
        let mut state = self.state.lock();
        if !state.nodes.contains_key(path) {
            return Ok(());
        }
        for p in state.subtree(path) {
            state.nodes.remove(&p);
        }
        state.emit(RawLocalEvent::Deleted(path.to_string()));
        Ok(())
    }

    async fn watch(&self) -> Result<LocalWatch, LocalFsError> {
        let (sink, events, backlog) = EventSink::channel();
        let mut state = self.state.lock();
        state.watch_generation += 1;
        let generation = state.watch_generation;
        state.sink = Some((generation, sink));
        Ok(LocalWatch {
            events,
            backlog,
            guard: Box::new(WatchGuard {
                state: self.state.clone(),
                generation,
            }),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOp {
    Create,
    Update,
    Download,
    Move,
    Delete,
    Poll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Transient,
    Rejected,
}

#[derive(Debug, Clone)]
struct Doc {
    parent_id: Option<String>,
    name: String,
    kind: ItemKind,
    content: Bytes,
    version: u64,
}

struct RemoteState {
    docs: BTreeMap<String, Doc>,
    log: Vec<(u64, String, ChangeKind)>,
    seq: u64,
    next_id: u64,
    creates: usize,
    polls: usize,
    failures: Vec<(RemoteOp, Failure, usize)>,
    stalls: Vec<(RemoteOp, Arc<Semaphore>)>,
    stalled: usize,
}

impl RemoteState {
    fn record(&mut self, id: &str, kind: ChangeKind) {
        self.seq += 1;
        let seq = self.seq;
        self.log.push((seq, id.to_string(), kind));
    }

    fn check(&mut self, op: RemoteOp) -> Result<(), RemoteError> {
        let Some(slot) = self
            .failures
            .iter_mut()
            .find(|(o, _, remaining)| *o == op && *remaining > 0)
        else {
            return Ok(());
        };
        slot.2 -= 1;
        match slot.1 {
            Failure::Transient => Err(RemoteError::Unavailable(format!("{op:?} unavailable"))),
            Failure::Rejected => Err(RemoteError::Rejected(format!("{op:?} rejected"))),
        }
    }

    fn descriptor(&self, id: &str) -> Result<RemoteDescriptor, RemoteError> {
        let doc = self
            .docs
            .get(id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        Ok(RemoteDescriptor {
            remote_id: id.to_string(),
            parent_id: doc.parent_id.clone(),
            name: doc.name.clone(),
            kind: doc.kind,
            fingerprint: match doc.kind {
                ItemKind::File => Some(DigestAlgorithm::Md5.digest(&doc.content)),
                ItemKind::Folder => None,
            },
            version: doc.version.to_string(),
            mtime: Some(doc.version as i64),
        })
    }

    fn child_named(&self, parent_id: &str, name: &str) -> Option<String> {
        self.docs
            .iter()
            .find(|(_, d)| d.parent_id.as_deref() == Some(parent_id) && d.name == name)
            .map(|(id, _)| id.clone())
    }

    fn resolve(&self, path: &str) -> Option<String> {
        let mut current = MemoryRemote::ROOT_ID.to_string();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = self.child_named(&current, part)?;
        }
        Some(current)
    }

    fn insert(
        &mut self,
        parent_id: &str,
        name: &str,
        kind: ItemKind,
        content: Bytes,
    ) -> Result<String, RemoteError> {
        match self.docs.get(parent_id) {
            Some(parent) if parent.kind == ItemKind::Folder => {}
            _ => return Err(RemoteError::NotFound(parent_id.to_string())),
        }
        if self.child_named(parent_id, name).is_some() {
            return Err(RemoteError::Rejected(format!("{name} already exists")));
        }
        self.next_id += 1;
        let id = format!("doc-{}", self.next_id);
        self.docs.insert(
            id.clone(),
            Doc {
                parent_id: Some(parent_id.to_string()),
                name: name.to_string(),
                kind,
                content,
                version: 1,
            },
        );
        self.record(&id, ChangeKind::Created);
        Ok(id)
    }

    fn remove(&mut self, id: &str) {
        let children: Vec<String> = self
            .docs
            .iter()
            .filter(|(_, d)| d.parent_id.as_deref() == Some(id))
            .map(|(cid, _)| cid.clone())
            .collect();
        for child in children {
            self.remove(&child);
        }
        self.docs.remove(id);
    }
}

/// In-memory [`RemoteClient`] with a change log, path helpers and failure
/// injection.
#[derive(Clone)]
pub struct MemoryRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub const ROOT_ID: &'static str = "root";

    pub fn new() -> Self {
        let mut docs = BTreeMap::new();
        docs.insert(
            Self::ROOT_ID.to_string(),
            Doc {
                parent_id: None,
                name: String::new(),
                kind: ItemKind::Folder,
                content: Bytes::new(),
                version: 1,
            },
        );
        Self {
            state: Arc::new(Mutex::new(RemoteState {
                docs,
                log: Vec::new(),
                seq: 0,
                next_id: 0,
                creates: 0,
                polls: 0,
                failures: Vec::new(),
                stalls: Vec::new(),
                stalled: 0,
            })),
        }
    }

    pub fn fail(&self, op: RemoteOp, failure: Failure, times: usize) {
        self.state.lock().failures.push((op, failure, times));
    }

    /// Calls of `op` hang until [`MemoryRemote::release`].
    pub fn stall(&self, op: RemoteOp) {
        self.state
            .lock()
            .stalls
            .push((op, Arc::new(Semaphore::new(0))));
    }

    pub fn release(&self, op: RemoteOp) {
        self.state.lock().stalls.retain(|(stalled, gate)| {
            if *stalled == op {
                gate.close();
            }
            *stalled != op
        });
    }

    /// Calls that ran into a stall so far.
    pub fn stalled_calls(&self) -> usize {
        self.state.lock().stalled
    }

    async fn hold(&self, op: RemoteOp) {
        let gate = {
            let mut state = self.state.lock();
            let gate = state
                .stalls
                .iter()
                .find(|(stalled, _)| *stalled == op)
                .map(|(_, gate)| gate.clone());
            if gate.is_some() {
                state.stalled += 1;
            }
            gate
        };
        if let Some(gate) = gate {
            let _ = gate.acquire().await;
        }
    }

    pub fn create_count(&self) -> usize {
        self.state.lock().creates
    }

    pub fn poll_count(&self) -> usize {
        self.state.lock().polls
    }

    pub fn id_at(&self, path: &str) -> Option<String> {
        self.state.lock().resolve(path)
    }

    pub fn content_at(&self, path: &str) -> Option<String> {
        let state = self.state.lock();
        let id = state.resolve(path)?;
        state
            .docs
            .get(&id)
            .map(|d| String::from_utf8_lossy(&d.content).into_owned())
    }

    pub fn child_names(&self, path: &str) -> Vec<String> {
        let state = self.state.lock();
        let Some(id) = state.resolve(path) else {
            return Vec::new();
        };
        let mut names: Vec<String> = state
            .docs
            .values()
            .filter(|d| d.parent_id.as_deref() == Some(id.as_str()))
            .map(|d| d.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Remote-side edit made by another client.
    pub fn put_file_at(&self, path: &str, content: &str) -> String {
        let mut state = self.state.lock();
        let content = Bytes::copy_from_slice(content.as_bytes());
        if let Some(id) = state.resolve(path) {
            if let Some(doc) = state.docs.get_mut(&id) {
                doc.content = content;
                doc.version += 1;
            }
            state.record(&id, ChangeKind::Modified);
            return id;
        }
        let parent = paths::parent_path(path).unwrap_or(paths::ROOT);
        let parent_id = state
            .resolve(parent)
            .unwrap_or_else(|| Self::ROOT_ID.to_string());
        state
            .insert(&parent_id, paths::file_name(path), ItemKind::File, content)
            .unwrap_or_default()
    }

    pub fn mkdir_at(&self, path: &str) -> String {
        let mut state = self.state.lock();
        if let Some(id) = state.resolve(path) {
            return id;
        }
        let parent = paths::parent_path(path).unwrap_or(paths::ROOT);
        let parent_id = state
            .resolve(parent)
            .unwrap_or_else(|| Self::ROOT_ID.to_string());
        state
            .insert(&parent_id, paths::file_name(path), ItemKind::Folder, Bytes::new())
            .unwrap_or_default()
    }

    pub fn rename_at(&self, path: &str, new_name: &str) {
        let mut state = self.state.lock();
        if let Some(id) = state.resolve(path) {
            if let Some(doc) = state.docs.get_mut(&id) {
                doc.name = new_name.to_string();
                doc.version += 1;
            }
            state.record(&id, ChangeKind::Moved);
        }
    }

    pub fn remove_at(&self, path: &str) {
        let mut state = self.state.lock();
        if let Some(id) = state.resolve(path) {
            state.remove(&id);
            state.record(&id, ChangeKind::Deleted);
        }
    }
}

#[async_trait]
impl RemoteClient for MemoryRemote {
    async fn get_document(&self, remote_id: &str) -> Result<RemoteDescriptor, RemoteError> {
        self.state.lock().descriptor(remote_id)
    }

    async fn get_children(&self, remote_id: &str) -> Result<Vec<RemoteDescriptor>, RemoteError> {
        let state = self.state.lock();
        if !state.docs.contains_key(remote_id) {
            return Err(RemoteError::NotFound(remote_id.to_string()));
        }
        let mut ids: Vec<(&String, &Doc)> = state
            .docs
            .iter()
            .filter(|(_, d)| d.parent_id.as_deref() == Some(remote_id))
            .collect();
        ids.sort_by(|a, b| a.1.name.cmp(&b.1.name));
        ids.into_iter().map(|(id, _)| state.descriptor(id)).collect()
    }

    async fn create_folder(
        &self,
        parent_id: &str,
        name: &str,
    ) -> Result<RemoteDescriptor, RemoteError> {
        let mut state = self.state.lock();
        state.check(RemoteOp::Create)?;
        let id = state.insert(parent_id, name, ItemKind::Folder, Bytes::new())?;
        state.creates += 1;
        state.descriptor(&id)
    }

    async fn create_document(
        &self,
        parent_id: &str,
        name: &str,
        content: Bytes,
    ) -> Result<RemoteDescriptor, RemoteError> {
        let mut state = self.state.lock();
        state.check(RemoteOp::Create)?;
        let id = state.insert(parent_id, name, ItemKind::File, content)?;
        state.creates += 1;
        state.descriptor(&id)
    }

    async fn update_content(
        &self,
        remote_id: &str,
        content: Bytes,
    ) -> Result<RemoteDescriptor, RemoteError> {
        let mut state = self.state.lock();
        state.check(RemoteOp::Update)?;
        let doc = state
            .docs
            .get_mut(remote_id)
            .ok_or_else(|| RemoteError::NotFound(remote_id.to_string()))?;
        doc.content = content;
        doc.version += 1;
        state.record(remote_id, ChangeKind::Modified);
        state.descriptor(remote_id)
    }

    async fn download(
        &self,
        remote_id: &str,
        expected: Option<&str>,
    ) -> Result<Bytes, RemoteError> {
        self.hold(RemoteOp::Download).await;
        let mut state = self.state.lock();
        state.check(RemoteOp::Download)?;
        let content = state
            .docs
            .get(remote_id)
            .map(|d| d.content.clone())
            .ok_or_else(|| RemoteError::NotFound(remote_id.to_string()))?;
        if let Some(expected) = expected
            && DigestAlgorithm::Md5.digest(&content) != expected
        {
            return Err(RemoteError::Unavailable("digest mismatch".into()));
        }
        Ok(content)
    }

    async fn move_document(
        &self,
        remote_id: &str,
        parent_id: &str,
        name: &str,
    ) -> Result<RemoteDescriptor, RemoteError> {
        let mut state = self.state.lock();
        state.check(RemoteOp::Move)?;
        if let Some(existing) = state.child_named(parent_id, name)
            && existing != remote_id
        {
            return Err(RemoteError::Rejected(format!("{name} already exists")));
        }
        let doc = state
            .docs
            .get_mut(remote_id)
            .ok_or_else(|| RemoteError::NotFound(remote_id.to_string()))?;
        doc.parent_id = Some(parent_id.to_string());
        doc.name = name.to_string();
        doc.version += 1;
        state.record(remote_id, ChangeKind::Moved);
        state.descriptor(remote_id)
    }

    async fn delete_document(&self, remote_id: &str) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        state.check(RemoteOp::Delete)?;
        if !state.docs.contains_key(remote_id) {
            return Err(RemoteError::NotFound(remote_id.to_string()));
        }
        state.remove(remote_id);
        state.record(remote_id, ChangeKind::Deleted);
        Ok(())
    }

    async fn poll_changes(
        &self,
        checkpoint: Option<&str>,
    ) -> Result<RemoteChangeBatch, RemoteError> {
        let mut state = self.state.lock();
        state.check(RemoteOp::Poll)?;
        state.polls += 1;
        let head = state.seq.to_string();
        let Some(since) = checkpoint.and_then(|c| c.parse::<u64>().ok()) else {
            return Ok(RemoteChangeBatch {
                changes: Vec::new(),
                checkpoint: head,
            });
        };
        let mut changes = Vec::new();
        for (seq, id, kind) in state.log.iter().filter(|(seq, _, _)| *seq > since) {
            let descriptor = state.descriptor(id).ok();
            let kind = if descriptor.is_none() {
                ChangeKind::Deleted
            } else {
                *kind
            };
            changes.push(RemoteChange {
                remote_id: id.clone(),
                kind,
                version: descriptor
                    .as_ref()
                    .map(|d| d.version.clone())
                    .unwrap_or_else(|| format!("deleted-{seq}")),
                descriptor,
            });
        }
        Ok(RemoteChangeBatch {
            changes,
            checkpoint: head,
        })
    }
}
