#![forbid(unsafe_code)]
//! MistFS core: the in-memory node/link graph and memory-backed files.
//!
//! One [`Tmpfs`] instance is the superblock of one mount. Nodes and links
//! live in generation-checked arenas rather than a web of shared pointers,
//! so the directory/tree-link reference cycle of the classic design cannot
//! leak, and open handles can detect that their link was removed beneath
//! them. Open handles pin their link, and a link pins its target node, so a
//! file stays readable after `unlink` until the last handle closes.
//!
//! All operations take a `&Cx` capability context and observe cancellation
//! at entry; the data mutations themselves are synchronous under the tree
//! lock, which is what gives directory readers their no-interleaving
//! guarantee between suspension points.

use asupersync::Cx;
use mist_error::{MistError, Result};
use mist_mem::{Mapping, MemHandle};
use mist_types::{
    DeviceId, DeviceKind, InodeNumber, NodeType, SemanticFlags, Whence, page_align_up,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| MistError::Cancelled)
}

// ── Arena ───────────────────────────────────────────────────────────────────

/// Identity of a node within one mount. Stale after the node is destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

/// Identity of a link within one mount. Stale after the link record dies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId {
    index: u32,
    generation: u32,
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot arena with generation counters; freed slots are recycled but their
/// old ids stop resolving.
struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> Arena<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, value: T) -> (u32, u32) {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            (index, slot.generation)
        } else {
            let index = u32::try_from(self.slots.len()).expect("arena index fits u32");
            self.slots.push(Slot {
                generation: 0,
                value: Some(value),
            });
            (index, 0)
        }
    }

    fn get(&self, index: u32, generation: u32) -> Option<&T> {
        self.slots
            .get(index as usize)
            .filter(|slot| slot.generation == generation)
            .and_then(|slot| slot.value.as_ref())
    }

    fn get_mut(&mut self, index: u32, generation: u32) -> Option<&mut T> {
        self.slots
            .get_mut(index as usize)
            .filter(|slot| slot.generation == generation)
            .and_then(|slot| slot.value.as_mut())
    }

    fn remove(&mut self, index: u32, generation: u32) -> Option<T> {
        let slot = self.slots.get_mut(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        Some(value)
    }
}

// ── Nodes and links ─────────────────────────────────────────────────────────

struct Node {
    ino: InodeNumber,
    /// Number of link records whose target this node is.
    link_count: u32,
    payload: Payload,
}

enum Payload {
    Regular(RegularState),
    Directory(DirState),
    Symlink { target: String },
    Device { kind: DeviceKind, id: DeviceId },
    Socket,
    Fifo { mode: u32 },
}

impl Payload {
    fn node_type(&self) -> NodeType {
        match self {
            Self::Regular(_) => NodeType::Regular,
            Self::Directory(_) => NodeType::Directory,
            Self::Symlink { .. } => NodeType::Symlink,
            Self::Device {
                kind: DeviceKind::Char,
                ..
            } => NodeType::CharDevice,
            Self::Device {
                kind: DeviceKind::Block,
                ..
            } => NodeType::BlockDevice,
            Self::Socket => NodeType::Socket,
            Self::Fifo { .. } => NodeType::Fifo,
        }
    }
}

/// Backing state of a regular node.
///
/// Invariants: `memory` is present iff `area_size > 0`; `area_size` is a
/// page multiple, never decreases, and is always >= `file_size`; `mapping`
/// covers the whole current object.
#[derive(Default)]
struct RegularState {
    file_size: u64,
    area_size: u64,
    memory: Option<MemHandle>,
    mapping: Option<Mapping>,
}

struct DirState {
    /// The link through which this directory is reached from its parent
    /// (for the root, the nameless root link). Set right after the link is
    /// created; plain id storage, so no ownership cycle.
    tree_link: Option<LinkId>,
    entries: BTreeMap<String, LinkId>,
}

impl DirState {
    fn new() -> Self {
        Self {
            tree_link: None,
            entries: BTreeMap::new(),
        }
    }
}

struct LinkRecord {
    owner: Option<NodeId>,
    name: Option<String>,
    target: NodeId,
    /// Live open handles routed through this link.
    opens: u32,
    /// No longer present in any entry set; the record survives only while
    /// `opens > 0`.
    unlinked: bool,
}

struct Tree {
    nodes: Arena<Node>,
    links: Arena<LinkRecord>,
}

/// External-collaborator calls that must run after the tree lock is
/// released, collected during a mutation.
#[derive(Default)]
struct Teardown {
    fifo_unregister: Vec<InodeNumber>,
    observer_gone: Vec<NodeId>,
}

impl Tree {
    fn new() -> Self {
        Self {
            nodes: Arena::new(),
            links: Arena::new(),
        }
    }

    fn insert_node(&mut self, node: Node) -> NodeId {
        let (index, generation) = self.nodes.insert(node);
        NodeId { index, generation }
    }

    fn insert_link(&mut self, record: LinkRecord) -> LinkId {
        let (index, generation) = self.links.insert(record);
        LinkId { index, generation }
    }

    fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(id.index, id.generation).ok_or(MistError::Stale)
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id.index, id.generation)
            .ok_or(MistError::Stale)
    }

    fn link(&self, id: LinkId) -> Result<&LinkRecord> {
        self.links.get(id.index, id.generation).ok_or(MistError::Stale)
    }

    fn link_mut(&mut self, id: LinkId) -> Result<&mut LinkRecord> {
        self.links
            .get_mut(id.index, id.generation)
            .ok_or(MistError::Stale)
    }

    fn dir(&self, id: NodeId) -> Result<&DirState> {
        match &self.node(id)?.payload {
            Payload::Directory(state) => Ok(state),
            _ => Err(MistError::NotDirectory),
        }
    }

    fn dir_mut(&mut self, id: NodeId) -> Result<&mut DirState> {
        match &mut self.node_mut(id)?.payload {
            Payload::Directory(state) => Ok(state),
            _ => Err(MistError::NotDirectory),
        }
    }

    /// Drop one reference to `node`; destroys it at zero.
    fn unref_node(&mut self, id: NodeId, teardown: &mut Teardown) {
        let node = self
            .nodes
            .get_mut(id.index, id.generation)
            .expect("unref of a destroyed node");
        node.link_count -= 1;
        if node.link_count == 0 {
            self.destroy_node(id, teardown);
        }
    }

    fn destroy_node(&mut self, id: NodeId, teardown: &mut Teardown) {
        let node = self
            .nodes
            .remove(id.index, id.generation)
            .expect("double destroy of a node");
        match node.payload {
            Payload::Directory(state) => {
                teardown.observer_gone.push(id);
                for (_, link_id) in state.entries {
                    self.detach_link(link_id, teardown);
                }
            }
            Payload::Fifo { .. } => teardown.fifo_unregister.push(node.ino),
            _ => {}
        }
        debug!(event = "node_destroyed", ino = %node.ino);
    }

    /// Take a link out of the name tree. The record itself survives while
    /// open handles still go through it; the last close reaps it.
    fn detach_link(&mut self, id: LinkId, teardown: &mut Teardown) {
        let record = self
            .links
            .get_mut(id.index, id.generation)
            .expect("detach of a dead link");
        record.unlinked = true;
        if record.opens == 0 {
            let record = self
                .links
                .remove(id.index, id.generation)
                .expect("link vanished during detach");
            self.unref_node(record.target, teardown);
        }
    }

    /// Called when an open handle drops its pin on a link.
    fn release_open(&mut self, id: LinkId, teardown: &mut Teardown) {
        let record = self
            .links
            .get_mut(id.index, id.generation)
            .expect("open release on a dead link");
        record.opens -= 1;
        if record.opens == 0 && record.unlinked {
            let record = self
                .links
                .remove(id.index, id.generation)
                .expect("link vanished during release");
            self.unref_node(record.target, teardown);
        }
    }

    /// Create a named link in `dir` targeting `target`.
    fn insert_entry(&mut self, dir: NodeId, name: &str, target: NodeId) -> Result<LinkId> {
        assert!(!name.is_empty(), "directory entries must be named");
        if self.dir(dir)?.entries.contains_key(name) {
            return Err(MistError::Exists);
        }
        let link_id = self.insert_link(LinkRecord {
            owner: Some(dir),
            name: Some(name.to_owned()),
            target,
            opens: 0,
            unlinked: false,
        });
        self.node_mut(target)?.link_count += 1;
        self.dir_mut(dir)?.entries.insert(name.to_owned(), link_id);
        Ok(link_id)
    }
}

// ── Observers ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirEventKind {
    Delete,
}

/// A change notification delivered to directory observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEvent {
    pub kind: DirEventKind,
    pub name: String,
    pub cookie: u32,
}

pub trait DirectoryObserver: Send {
    fn on_event(&self, event: &DirEvent);
}

// ── External collaborators ──────────────────────────────────────────────────

/// Open handle produced by an external collaborator (device or fifo). The
/// core does not interpret it; it already speaks the file protocol on its
/// own lane.
pub trait ExternalFile: Send {
    /// Collaborator that produced this handle, for diagnostics.
    fn source(&self) -> &'static str;
}

/// Char/block device open dispatch.
pub trait DeviceOpener: Send + Sync {
    fn open_device(
        &self,
        cx: &Cx,
        kind: DeviceKind,
        id: DeviceId,
        flags: SemanticFlags,
    ) -> Result<Box<dyn ExternalFile>>;
}

/// Named-channel registry for fifo nodes.
pub trait FifoChannels: Send + Sync {
    fn register(&self, ino: InodeNumber);
    fn unregister(&self, ino: InodeNumber);
    fn open_channel(
        &self,
        cx: &Cx,
        ino: InodeNumber,
        flags: SemanticFlags,
    ) -> Result<Box<dyn ExternalFile>>;
}

/// Refuses every device open; for mounts without a device registry.
pub struct NoDeviceOpener;

impl DeviceOpener for NoDeviceOpener {
    fn open_device(
        &self,
        _cx: &Cx,
        _kind: DeviceKind,
        _id: DeviceId,
        _flags: SemanticFlags,
    ) -> Result<Box<dyn ExternalFile>> {
        Err(MistError::NotSupported("no device registry attached"))
    }
}

/// Accepts fifo registrations without routing them anywhere.
pub struct NoopFifoChannels;

impl FifoChannels for NoopFifoChannels {
    fn register(&self, _ino: InodeNumber) {}

    fn unregister(&self, _ino: InodeNumber) {}

    fn open_channel(
        &self,
        _cx: &Cx,
        _ino: InodeNumber,
        _flags: SemanticFlags,
    ) -> Result<Box<dyn ExternalFile>> {
        Err(MistError::NotSupported("no fifo registry attached"))
    }
}

// ── Superblock ──────────────────────────────────────────────────────────────

/// Per-node stats exposed to the VFS layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStats {
    pub ino: InodeNumber,
    pub node_type: NodeType,
    /// Logical size; zero for anything but regular files.
    pub file_size: u64,
}

/// One mounted tmpfs: superblock services plus the node/link graph.
pub struct Tmpfs {
    inode_counter: AtomicU64,
    tree: Mutex<Tree>,
    observers: Mutex<HashMap<NodeId, Vec<Box<dyn DirectoryObserver>>>>,
    devices: Arc<dyn DeviceOpener>,
    fifos: Arc<dyn FifoChannels>,
}

impl Tmpfs {
    /// A mount with no device or fifo routing.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_collaborators(Arc::new(NoDeviceOpener), Arc::new(NoopFifoChannels))
    }

    #[must_use]
    pub fn with_collaborators(
        devices: Arc<dyn DeviceOpener>,
        fifos: Arc<dyn FifoChannels>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inode_counter: AtomicU64::new(1),
            tree: Mutex::new(Tree::new()),
            observers: Mutex::new(HashMap::new()),
            devices,
            fifos,
        })
    }

    /// Hand out the next inode number. Strictly increasing, never zero,
    /// never reused.
    pub fn allocate_inode(&self) -> InodeNumber {
        InodeNumber(self.inode_counter.fetch_add(1, Ordering::Relaxed))
    }

    /// Create the root directory and its nameless, ownerless link.
    pub fn create_root(&self, cx: &Cx) -> Result<LinkId> {
        cx_checkpoint(cx)?;
        let ino = self.allocate_inode();
        let mut tree = self.tree.lock();
        let node_id = tree.insert_node(Node {
            ino,
            link_count: 0,
            payload: Payload::Directory(DirState::new()),
        });
        let link_id = tree.insert_link(LinkRecord {
            owner: None,
            name: None,
            target: node_id,
            opens: 0,
            unlinked: false,
        });
        tree.node_mut(node_id)?.link_count = 1;
        tree.dir_mut(node_id)?.tree_link = Some(link_id);
        info!(event = "create_root", ino = %ino);
        Ok(link_id)
    }

    /// Fresh regular node with no backing memory yet. The caller is
    /// expected to link it into a directory.
    pub fn create_regular(&self, cx: &Cx) -> Result<NodeId> {
        cx_checkpoint(cx)?;
        let ino = self.allocate_inode();
        let mut tree = self.tree.lock();
        let id = tree.insert_node(Node {
            ino,
            link_count: 0,
            payload: Payload::Regular(RegularState::default()),
        });
        debug!(event = "create_regular", ino = %ino);
        Ok(id)
    }

    pub fn create_socket(&self, cx: &Cx) -> Result<NodeId> {
        cx_checkpoint(cx)?;
        let ino = self.allocate_inode();
        let mut tree = self.tree.lock();
        let id = tree.insert_node(Node {
            ino,
            link_count: 0,
            payload: Payload::Socket,
        });
        debug!(event = "create_socket", ino = %ino);
        Ok(id)
    }

    // ── Node introspection ──────────────────────────────────────────────

    pub fn stats(&self, cx: &Cx, node: NodeId) -> Result<NodeStats> {
        cx_checkpoint(cx)?;
        let tree = self.tree.lock();
        let node = tree.node(node)?;
        let file_size = match &node.payload {
            Payload::Regular(state) => state.file_size,
            _ => 0,
        };
        Ok(NodeStats {
            ino: node.ino,
            node_type: node.payload.node_type(),
            file_size,
        })
    }

    pub fn node_type(&self, node: NodeId) -> Result<NodeType> {
        Ok(self.tree.lock().node(node)?.payload.node_type())
    }

    pub fn read_symlink(&self, cx: &Cx, node: NodeId) -> Result<String> {
        cx_checkpoint(cx)?;
        let tree = self.tree.lock();
        match &tree.node(node)?.payload {
            Payload::Symlink { target } => Ok(target.clone()),
            _ => Err(MistError::InvalidArgument("not a symlink")),
        }
    }

    pub fn device_id(&self, node: NodeId) -> Result<DeviceId> {
        let tree = self.tree.lock();
        match &tree.node(node)?.payload {
            Payload::Device { id, .. } => Ok(*id),
            _ => Err(MistError::InvalidArgument("not a device")),
        }
    }

    pub fn fifo_mode(&self, node: NodeId) -> Result<u32> {
        let tree = self.tree.lock();
        match &tree.node(node)?.payload {
            Payload::Fifo { mode } => Ok(*mode),
            _ => Err(MistError::InvalidArgument("not a fifo")),
        }
    }

    pub fn link_target(&self, link: LinkId) -> Result<NodeId> {
        Ok(self.tree.lock().link(link)?.target)
    }

    /// Name of a link; `None` only for the root link.
    pub fn link_name(&self, link: LinkId) -> Result<Option<String>> {
        Ok(self.tree.lock().link(link)?.name.clone())
    }

    // ── Directory mutations ─────────────────────────────────────────────

    /// Look up a name in a directory. Absent names are not an error.
    pub fn get_link(&self, cx: &Cx, dir: NodeId, name: &str) -> Result<Option<LinkId>> {
        cx_checkpoint(cx)?;
        Ok(self.tree.lock().dir(dir)?.entries.get(name).copied())
    }

    /// Link an existing node under `name`. Directories are reached only
    /// through their one tree link; extra hard links to them are refused.
    pub fn link(&self, cx: &Cx, dir: NodeId, name: &str, target: NodeId) -> Result<LinkId> {
        cx_checkpoint(cx)?;
        let mut tree = self.tree.lock();
        if matches!(tree.node(target)?.payload, Payload::Directory(_)) {
            return Err(MistError::NotSupported("hard links to directories"));
        }
        let link_id = tree.insert_entry(dir, name, target)?;
        debug!(event = "link", name);
        Ok(link_id)
    }

    /// Create a subdirectory. Surfaces `Exists` so callers can race.
    pub fn mkdir(&self, cx: &Cx, dir: NodeId, name: &str) -> Result<LinkId> {
        cx_checkpoint(cx)?;
        let mut tree = self.tree.lock();
        if tree.dir(dir)?.entries.contains_key(name) {
            return Err(MistError::Exists);
        }
        let ino = self.allocate_inode();
        let node_id = tree.insert_node(Node {
            ino,
            link_count: 0,
            payload: Payload::Directory(DirState::new()),
        });
        let link_id = tree.insert_entry(dir, name, node_id)?;
        tree.dir_mut(node_id)?.tree_link = Some(link_id);
        debug!(event = "mkdir", name, ino = %ino);
        Ok(link_id)
    }

    pub fn symlink(&self, cx: &Cx, dir: NodeId, name: &str, path: &str) -> Result<LinkId> {
        cx_checkpoint(cx)?;
        let mut tree = self.tree.lock();
        if tree.dir(dir)?.entries.contains_key(name) {
            return Err(MistError::Exists);
        }
        let ino = self.allocate_inode();
        let node_id = tree.insert_node(Node {
            ino,
            link_count: 0,
            payload: Payload::Symlink {
                target: path.to_owned(),
            },
        });
        let link_id = tree.insert_entry(dir, name, node_id)?;
        debug!(event = "symlink", name, path);
        Ok(link_id)
    }

    pub fn mkdev(
        &self,
        cx: &Cx,
        dir: NodeId,
        name: &str,
        kind: DeviceKind,
        id: DeviceId,
    ) -> Result<LinkId> {
        cx_checkpoint(cx)?;
        let mut tree = self.tree.lock();
        if tree.dir(dir)?.entries.contains_key(name) {
            return Err(MistError::Exists);
        }
        let ino = self.allocate_inode();
        let node_id = tree.insert_node(Node {
            ino,
            link_count: 0,
            payload: Payload::Device { kind, id },
        });
        let link_id = tree.insert_entry(dir, name, node_id)?;
        debug!(event = "mkdev", name, device = %id);
        Ok(link_id)
    }

    /// Create a fifo node and register its named channel with the external
    /// registry. Registration happens before the name becomes visible; a
    /// losing race unregisters again.
    pub fn mkfifo(&self, cx: &Cx, dir: NodeId, name: &str, mode: u32) -> Result<LinkId> {
        cx_checkpoint(cx)?;
        let ino = self.allocate_inode();
        self.fifos.register(ino);
        let mut tree = self.tree.lock();
        if tree.dir(dir)?.entries.contains_key(name) {
            drop(tree);
            self.fifos.unregister(ino);
            return Err(MistError::Exists);
        }
        let node_id = tree.insert_node(Node {
            ino,
            link_count: 0,
            payload: Payload::Fifo { mode },
        });
        let link_id = tree.insert_entry(dir, name, node_id)?;
        debug!(event = "mkfifo", name, mode);
        Ok(link_id)
    }

    /// Remove a name. Observers of the directory receive exactly one
    /// `(Delete, name, 0)` event.
    pub fn unlink(&self, cx: &Cx, dir: NodeId, name: &str) -> Result<()> {
        cx_checkpoint(cx)?;
        let mut teardown = Teardown::default();
        {
            let mut tree = self.tree.lock();
            let Some(link_id) = tree.dir_mut(dir)?.entries.remove(name) else {
                return Err(MistError::NotFound(name.to_owned()));
            };
            tree.detach_link(link_id, &mut teardown);
        }
        debug!(event = "unlink", name);
        self.notify(
            dir,
            &DirEvent {
                kind: DirEventKind::Delete,
                name: name.to_owned(),
                cookie: 0,
            },
        );
        self.run_teardown(teardown);
        Ok(())
    }

    /// Attach an observer to a directory.
    pub fn attach_observer(
        &self,
        dir: NodeId,
        observer: Box<dyn DirectoryObserver>,
    ) -> Result<()> {
        self.tree.lock().dir(dir)?;
        self.observers.lock().entry(dir).or_default().push(observer);
        Ok(())
    }

    fn notify(&self, dir: NodeId, event: &DirEvent) {
        let observers = self.observers.lock();
        if let Some(list) = observers.get(&dir) {
            for observer in list {
                observer.on_event(event);
            }
        }
    }

    fn run_teardown(&self, teardown: Teardown) {
        for ino in teardown.fifo_unregister {
            self.fifos.unregister(ino);
        }
        if !teardown.observer_gone.is_empty() {
            let mut observers = self.observers.lock();
            for dir in teardown.observer_gone {
                observers.remove(&dir);
            }
        }
    }

    // ── Rename ──────────────────────────────────────────────────────────

    /// Move `src_link` to `dest_name` in `dest_dir`, silently replacing an
    /// existing destination. Returns the new link; the target node (and its
    /// inode number) are unchanged.
    pub fn rename(
        &self,
        cx: &Cx,
        src_link: LinkId,
        dest_dir: NodeId,
        dest_name: &str,
    ) -> Result<LinkId> {
        cx_checkpoint(cx)?;
        let mut teardown = Teardown::default();
        let new_link = {
            let mut tree = self.tree.lock();

            let src = tree.link(src_link)?;
            assert!(!src.unlinked, "rename of an unlinked link");
            let src_dir = src.owner.expect("rename of the root link");
            let src_name = src.name.clone().expect("named link has a name");
            let target = src.target;
            assert_eq!(
                tree.dir(src_dir)?.entries.get(&src_name).copied(),
                Some(src_link),
                "source entry does not match the link being renamed",
            );
            tree.dir(dest_dir)?;

            // Pin the target through the whole shuffle so replacing a link
            // with itself cannot drop the node to zero references.
            let new_link = tree.insert_link(LinkRecord {
                owner: Some(dest_dir),
                name: Some(dest_name.to_owned()),
                target,
                opens: 0,
                unlinked: false,
            });
            tree.node_mut(target)?.link_count += 1;

            // Unlink an existing destination if such a link exists. This is
            // silent: no delete event, unlike `unlink`.
            if let Some(existing) = tree.dir_mut(dest_dir)?.entries.remove(dest_name) {
                tree.detach_link(existing, &mut teardown);
            }
            tree.dir_mut(dest_dir)?
                .entries
                .insert(dest_name.to_owned(), new_link);

            // For a rename onto itself the source entry was already removed
            // (and detached) as the destination; only remove it when it
            // still maps to the link being renamed.
            let src_entries = &mut tree.dir_mut(src_dir)?.entries;
            if src_entries.get(&src_name).copied() == Some(src_link) {
                src_entries.remove(&src_name);
                tree.detach_link(src_link, &mut teardown);
            }

            // A renamed directory is now reached through the new link.
            if let Payload::Directory(state) = &mut tree.node_mut(target)?.payload {
                state.tree_link = Some(new_link);
            }

            new_link
        };
        debug!(event = "rename", dest_name);
        self.run_teardown(teardown);
        Ok(new_link)
    }

    // ── Open ────────────────────────────────────────────────────────────

    /// Open the target of a link.
    ///
    /// Unsupported semantic flags are a caller contract violation and
    /// abort; symlinks and sockets are not openable here.
    pub fn open(self: &Arc<Self>, cx: &Cx, link: LinkId, flags: SemanticFlags) -> Result<OpenFile> {
        cx_checkpoint(cx)?;
        let mut tree = self.tree.lock();
        let record = tree.link(link)?;
        let target = record.target;
        let (ino, action) = {
            let node = tree.node(target)?;
            let action = match &node.payload {
                Payload::Regular(_) => {
                    assert!(
                        flags.is_subset_of(
                            SemanticFlags::READ | SemanticFlags::WRITE | SemanticFlags::NONBLOCK
                        ),
                        "unsupported semantic flags for a regular file",
                    );
                    OpenAction::Regular
                }
                Payload::Directory(state) => {
                    assert!(
                        flags.is_subset_of(SemanticFlags::READ | SemanticFlags::WRITE),
                        "unsupported semantic flags for a directory",
                    );
                    OpenAction::Directory(state.entries.keys().cloned().collect())
                }
                Payload::Device { kind, id } => OpenAction::Device(*kind, *id),
                Payload::Fifo { .. } => OpenAction::Fifo,
                Payload::Symlink { .. } | Payload::Socket => {
                    return Err(MistError::NotSupported("open on this node type"));
                }
            };
            (node.ino, action)
        };
        debug!(event = "open", ino = %ino, flags = flags.bits());
        match action {
            OpenAction::Regular => {
                tree.link_mut(link)?.opens += 1;
                Ok(OpenFile::Regular(RegularFile {
                    fs: Arc::clone(self),
                    link,
                    offset: 0,
                }))
            }
            OpenAction::Directory(names) => {
                tree.link_mut(link)?.opens += 1;
                Ok(OpenFile::Directory(DirectoryFile {
                    fs: Arc::clone(self),
                    link,
                    names,
                    position: 0,
                }))
            }
            OpenAction::Device(kind, id) => {
                drop(tree);
                Ok(OpenFile::External(
                    self.devices.open_device(cx, kind, id, flags)?,
                ))
            }
            OpenAction::Fifo => {
                drop(tree);
                Ok(OpenFile::External(self.fifos.open_channel(cx, ino, flags)?))
            }
        }
    }
}

enum OpenAction {
    Regular,
    Directory(Vec<String>),
    Device(DeviceKind, DeviceId),
    Fifo,
}

/// Convenience for mounting: a fresh filesystem plus its root link.
pub fn mount(cx: &Cx) -> Result<(Arc<Tmpfs>, LinkId)> {
    let fs = Tmpfs::new();
    let root = fs.create_root(cx)?;
    Ok((fs, root))
}

// ── Open files ──────────────────────────────────────────────────────────────

/// Result of opening a link: a served kind, or a collaborator's handle.
pub enum OpenFile {
    Regular(RegularFile),
    Directory(DirectoryFile),
    External(Box<dyn ExternalFile>),
}

/// Open handle onto a regular node.
///
/// Holds the link it was opened through; the link (and through it the node)
/// stays alive until this handle drops, even across `unlink`.
pub struct RegularFile {
    fs: Arc<Tmpfs>,
    link: LinkId,
    offset: u64,
}

impl RegularFile {
    fn with_state<R>(&self, f: impl FnOnce(&mut RegularState) -> Result<R>) -> Result<R> {
        let mut tree = self.fs.tree.lock();
        let target = tree.link(self.link)?.target;
        let node = tree.node_mut(target)?;
        match &mut node.payload {
            Payload::Regular(state) => f(state),
            _ => unreachable!("regular handle bound to a non-regular node"),
        }
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Move the file offset. No bounds check: the offset may exceed the
    /// file size, in which case reads return EOF until something grows the
    /// file past it.
    pub fn seek(&mut self, cx: &Cx, delta: i64, whence: Whence) -> Result<u64> {
        cx_checkpoint(cx)?;
        let base = match whence {
            Whence::Absolute => 0_i128,
            Whence::Relative => i128::from(self.offset),
            Whence::End => {
                let file_size = self.with_state(|state| Ok(state.file_size))?;
                i128::from(self.offset) + i128::from(file_size)
            }
        };
        let resolved = base + i128::from(delta);
        self.offset = u64::try_from(resolved)
            .map_err(|_| MistError::InvalidArgument("seek resolves outside the file range"))?;
        Ok(self.offset)
    }

    /// Read up to `buf.len()` bytes at the current offset, advancing it.
    /// Returns 0 at (or past) end of file.
    pub fn read_some(&mut self, cx: &Cx, buf: &mut [u8]) -> Result<usize> {
        cx_checkpoint(cx)?;
        let offset = self.offset;
        let read = self.with_state(|state| {
            if offset >= state.file_size {
                return Ok(0);
            }
            let available = state.file_size - offset;
            let chunk = usize::try_from(available.min(buf.len() as u64))
                .expect("read chunk fits in usize");
            let mapping = state.mapping.as_ref().expect("non-empty file has a mapping");
            mapping.read_at(offset, &mut buf[..chunk]);
            Ok(chunk)
        })?;
        self.offset += read as u64;
        Ok(read)
    }

    /// Write all of `data` at the current offset, growing the file as
    /// needed, and advance the offset.
    pub fn write_all(&mut self, cx: &Cx, data: &[u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        let offset = self.offset;
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(MistError::InvalidArgument("write extends past u64::MAX"))?;
        self.with_state(|state| {
            if end > state.file_size {
                resize_file(state, end)?;
            }
            if !data.is_empty() {
                let mapping = state.mapping.as_ref().expect("resized file has a mapping");
                mapping.write_at(offset, data);
            }
            Ok(())
        })?;
        self.offset = end;
        Ok(())
    }

    /// Set the logical file size. Shrinking never releases backing memory.
    pub fn truncate(&mut self, cx: &Cx, size: u64) -> Result<()> {
        cx_checkpoint(cx)?;
        self.with_state(|state| resize_file(state, size))
    }

    /// Reserve bytes so the file covers `[0, size)`. Only whole-file
    /// allocation is supported.
    pub fn allocate(&mut self, cx: &Cx, offset: u64, size: u64) -> Result<()> {
        cx_checkpoint(cx)?;
        if offset != 0 {
            return Err(MistError::NotSupported("allocate at a non-zero offset"));
        }
        self.with_state(|state| {
            if size <= state.file_size {
                return Ok(());
            }
            resize_file(state, size)
        })
    }

    /// Duplicate the node's backing-memory handle for direct mapping by the
    /// client. `None` if the file has never grown.
    pub fn access_memory(&self, cx: &Cx) -> Result<Option<MemHandle>> {
        cx_checkpoint(cx)?;
        self.with_state(|state| Ok(state.memory.as_ref().map(MemHandle::dup)))
    }
}

impl Drop for RegularFile {
    fn drop(&mut self) {
        let mut teardown = Teardown::default();
        self.fs.tree.lock().release_open(self.link, &mut teardown);
        self.fs.run_teardown(teardown);
    }
}

/// Set a regular node's logical size, growing the backing object as needed.
///
/// The backing object only ever grows, in page multiples; shrinking the
/// file leaves `[file_size, area_size)` as unspecified garbage.
fn resize_file(state: &mut RegularState, new_size: u64) -> Result<()> {
    state.file_size = new_size;
    let aligned = page_align_up(new_size)
        .ok_or(MistError::InvalidArgument("file size overflows page alignment"))?;
    if aligned <= state.area_size {
        return Ok(());
    }
    match &state.memory {
        Some(memory) => memory.grow(aligned),
        None => state.memory = Some(MemHandle::allocate(aligned)),
    }
    state.mapping = Some(state.memory.as_ref().expect("backing just ensured").map());
    state.area_size = aligned;
    debug!(event = "file_resize", file_size = new_size, area_size = aligned);
    Ok(())
}

/// Open handle onto a directory: a snapshot listing captured at open time.
///
/// Entries `.` and `..` are not materialized; the VFS layer synthesizes
/// them. Mutations after open do not disturb the snapshot.
pub struct DirectoryFile {
    fs: Arc<Tmpfs>,
    link: LinkId,
    names: Vec<String>,
    position: usize,
}

impl DirectoryFile {
    /// Next entry name in lexicographic byte order; `None` ends the
    /// listing.
    pub fn read_entries(&mut self, cx: &Cx) -> Result<Option<String>> {
        cx_checkpoint(cx)?;
        let Some(name) = self.names.get(self.position) else {
            return Ok(None);
        };
        self.position += 1;
        Ok(Some(name.clone()))
    }
}

impl Drop for DirectoryFile {
    fn drop(&mut self) {
        let mut teardown = Teardown::default();
        self.fs.tree.lock().release_open(self.link, &mut teardown);
        self.fs.run_teardown(teardown);
    }
}
