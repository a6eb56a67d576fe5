#![forbid(unsafe_code)]
//! Per-open file-protocol serving.
//!
//! Opening a file creates a lane pair: the client side rides inside the
//! returned handle, and a detached serve task drains the server side,
//! dispatching each wire request into the open file before looking at the
//! next one. That one-at-a-time drain is what serializes requests within a
//! single open handle. Closing the handle signals the task's cancellation
//! flag; the task unwinds, dropping its file (and with it the pin on the
//! link) and its lane end. Requests in flight at cancellation time may not
//! complete.

use asupersync::Cx;
use mist_core::{DirectoryFile, ExternalFile, LinkId, OpenFile, RegularFile, Tmpfs};
use mist_error::{MistError, Result};
use mist_mem::MemHandle;
use mist_types::{SemanticFlags, Whence};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

/// How often a parked serve task re-checks its cancellation flag.
const SERVE_POLL_INTERVAL: Duration = Duration::from_millis(10);

// ── Wire protocol ───────────────────────────────────────────────────────────

/// One request on a passthrough lane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FileRequest {
    Seek { delta: i64, whence: Whence },
    Read { max_len: u32 },
    Write { data: Vec<u8> },
    Truncate { size: u64 },
    Allocate { offset: u64, size: u64 },
    AccessMemory,
    ReadEntries,
}

/// Reply to one request.
///
/// Deliberately not serde-serializable: `Memory` carries a capability
/// handle, which a real transport transfers out of band rather than as
/// bytes.
#[derive(Debug)]
pub enum FileReply {
    Offset(u64),
    Data(Vec<u8>),
    Done,
    Memory(Option<MemHandle>),
    Entry(Option<String>),
    Error(WireStatus),
}

/// Errno-style status carried over the lane when an operation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireStatus(pub i32);

impl WireStatus {
    const PEER_GONE: Self = Self(libc::EPIPE);
    const PROTOCOL: Self = Self(libc::EPROTO);

    #[must_use]
    pub fn errno(self) -> i32 {
        self.0
    }
}

fn status_of(err: &MistError) -> WireStatus {
    WireStatus(err.to_errno())
}

// ── Lanes ───────────────────────────────────────────────────────────────────

/// Server end of a passthrough lane: the serve task drains this.
pub struct ServerLane {
    requests: Receiver<FileRequest>,
    replies: Sender<FileReply>,
}

/// Client end of a passthrough lane, kept inside the served handle.
pub struct ClientLane {
    requests: Sender<FileRequest>,
    replies: Receiver<FileReply>,
}

/// Create a connected lane pair, the in-process stand-in for an IPC stream.
#[must_use]
pub fn lane_pair() -> (ServerLane, ClientLane) {
    let (request_tx, request_rx) = mpsc::channel();
    let (reply_tx, reply_rx) = mpsc::channel();
    (
        ServerLane {
            requests: request_rx,
            replies: reply_tx,
        },
        ClientLane {
            requests: request_tx,
            replies: reply_rx,
        },
    )
}

impl ClientLane {
    /// Issue one request and wait for its reply.
    pub fn call(&self, request: FileRequest) -> std::result::Result<FileReply, WireStatus> {
        self.requests
            .send(request)
            .map_err(|_| WireStatus::PEER_GONE)?;
        self.replies.recv().map_err(|_| WireStatus::PEER_GONE)
    }

    pub fn seek(&self, delta: i64, whence: Whence) -> std::result::Result<u64, WireStatus> {
        match self.call(FileRequest::Seek { delta, whence })? {
            FileReply::Offset(offset) => Ok(offset),
            FileReply::Error(status) => Err(status),
            _ => Err(WireStatus::PROTOCOL),
        }
    }

    pub fn read(&self, max_len: u32) -> std::result::Result<Vec<u8>, WireStatus> {
        match self.call(FileRequest::Read { max_len })? {
            FileReply::Data(data) => Ok(data),
            FileReply::Error(status) => Err(status),
            _ => Err(WireStatus::PROTOCOL),
        }
    }

    pub fn write(&self, data: &[u8]) -> std::result::Result<(), WireStatus> {
        match self.call(FileRequest::Write {
            data: data.to_vec(),
        })? {
            FileReply::Done => Ok(()),
            FileReply::Error(status) => Err(status),
            _ => Err(WireStatus::PROTOCOL),
        }
    }

    pub fn truncate(&self, size: u64) -> std::result::Result<(), WireStatus> {
        match self.call(FileRequest::Truncate { size })? {
            FileReply::Done => Ok(()),
            FileReply::Error(status) => Err(status),
            _ => Err(WireStatus::PROTOCOL),
        }
    }

    pub fn allocate(&self, offset: u64, size: u64) -> std::result::Result<(), WireStatus> {
        match self.call(FileRequest::Allocate { offset, size })? {
            FileReply::Done => Ok(()),
            FileReply::Error(status) => Err(status),
            _ => Err(WireStatus::PROTOCOL),
        }
    }

    pub fn access_memory(&self) -> std::result::Result<Option<MemHandle>, WireStatus> {
        match self.call(FileRequest::AccessMemory)? {
            FileReply::Memory(handle) => Ok(handle),
            FileReply::Error(status) => Err(status),
            _ => Err(WireStatus::PROTOCOL),
        }
    }

    pub fn read_entries(&self) -> std::result::Result<Option<String>, WireStatus> {
        match self.call(FileRequest::ReadEntries)? {
            FileReply::Entry(entry) => Ok(entry),
            FileReply::Error(status) => Err(status),
            _ => Err(WireStatus::PROTOCOL),
        }
    }
}

// ── Serve task ──────────────────────────────────────────────────────────────

/// What one serve task drives.
enum ServeTarget {
    Regular(RegularFile),
    Directory(DirectoryFile),
}

impl ServeTarget {
    fn dispatch(&mut self, cx: &Cx, request: FileRequest) -> FileReply {
        match (self, request) {
            (Self::Regular(file), FileRequest::Seek { delta, whence }) => {
                match file.seek(cx, delta, whence) {
                    Ok(offset) => FileReply::Offset(offset),
                    Err(err) => FileReply::Error(status_of(&err)),
                }
            }
            (Self::Regular(file), FileRequest::Read { max_len }) => {
                let mut buf = vec![0_u8; max_len as usize];
                match file.read_some(cx, &mut buf) {
                    Ok(read) => {
                        buf.truncate(read);
                        FileReply::Data(buf)
                    }
                    Err(err) => FileReply::Error(status_of(&err)),
                }
            }
            (Self::Regular(file), FileRequest::Write { data }) => {
                match file.write_all(cx, &data) {
                    Ok(()) => FileReply::Done,
                    Err(err) => FileReply::Error(status_of(&err)),
                }
            }
            (Self::Regular(file), FileRequest::Truncate { size }) => {
                match file.truncate(cx, size) {
                    Ok(()) => FileReply::Done,
                    Err(err) => FileReply::Error(status_of(&err)),
                }
            }
            (Self::Regular(file), FileRequest::Allocate { offset, size }) => {
                match file.allocate(cx, offset, size) {
                    Ok(()) => FileReply::Done,
                    Err(err) => FileReply::Error(status_of(&err)),
                }
            }
            (Self::Regular(file), FileRequest::AccessMemory) => match file.access_memory(cx) {
                Ok(handle) => FileReply::Memory(handle),
                Err(err) => FileReply::Error(status_of(&err)),
            },
            (Self::Regular(_), FileRequest::ReadEntries) => {
                FileReply::Error(WireStatus(libc::ENOTDIR))
            }
            (Self::Directory(file), FileRequest::ReadEntries) => match file.read_entries(cx) {
                Ok(entry) => FileReply::Entry(entry),
                Err(err) => FileReply::Error(status_of(&err)),
            },
            (Self::Directory(_), _) => FileReply::Error(WireStatus(libc::EISDIR)),
        }
    }
}

/// Signals a serve task to stop at its next scheduling point.
#[derive(Clone)]
pub struct CancelHandle {
    stop: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.stop.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// A served open file: the client lane plus the serve task's lifecycle.
///
/// Dropping it closes the file: the cancellation flag is signalled and the
/// serve task joined, which releases the task's pin on the link.
pub struct ServedFile {
    lane: ClientLane,
    cancel: CancelHandle,
    join: Option<JoinHandle<()>>,
}

impl ServedFile {
    #[must_use]
    pub fn lane(&self) -> &ClientLane {
        &self.lane
    }

    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Close the handle and wait for the serve task to unwind.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ServedFile {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_serve(target: ServeTarget) -> ServedFile {
    let (server, client) = lane_pair();
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    let join = thread::Builder::new()
        .name("mist-serve".to_owned())
        .spawn(move || serve_loop(target, &server, &stop_flag))
        .expect("spawn serve task");
    ServedFile {
        lane: client,
        cancel: CancelHandle { stop },
        join: Some(join),
    }
}

fn serve_loop(mut target: ServeTarget, lane: &ServerLane, stop: &AtomicBool) {
    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }
        match lane.requests.recv_timeout(SERVE_POLL_INTERVAL) {
            Ok(request) => {
                // One context per request, the production acquisition path.
                let cx = Cx::for_request();
                let reply = target.dispatch(&cx, request);
                if lane.replies.send(reply).is_err() {
                    debug!(event = "serve_peer_gone");
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(event = "serve_exit");
    // Dropping the target here releases its pin on the link.
    drop(target);
}

/// Put a serve task behind an already-open regular file.
#[must_use]
pub fn serve_regular(file: RegularFile) -> ServedFile {
    spawn_serve(ServeTarget::Regular(file))
}

/// Put a serve task behind an already-open directory listing.
#[must_use]
pub fn serve_directory(file: DirectoryFile) -> ServedFile {
    spawn_serve(ServeTarget::Directory(file))
}

/// Outcome of [`open_and_serve`]: a lane-backed handle, or a collaborator's
/// own handle (devices and fifos serve themselves).
pub enum Served {
    Lane(ServedFile),
    External(Box<dyn ExternalFile>),
}

/// Open a link and, for the kinds this filesystem serves itself, spawn the
/// serve task and hand back the client-facing lane.
pub fn open_and_serve(
    fs: &Arc<Tmpfs>,
    cx: &Cx,
    link: LinkId,
    flags: SemanticFlags,
) -> Result<Served> {
    match fs.open(cx, link, flags)? {
        OpenFile::Regular(file) => Ok(Served::Lane(serve_regular(file))),
        OpenFile::Directory(file) => Ok(Served::Lane(serve_directory(file))),
        OpenFile::External(handle) => Ok(Served::External(handle)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mist_core::mount;

    fn test_cx() -> Cx {
        Cx::for_testing()
    }

    fn served_regular(name: &str) -> (Arc<Tmpfs>, mist_core::NodeId, ServedFile) {
        let cx = test_cx();
        let (fs, root_link) = mount(&cx).expect("mount");
        let root = fs.link_target(root_link).expect("root");
        let node = fs.create_regular(&cx).expect("create");
        let link = fs.link(&cx, root, name, node).expect("link");
        let served = match open_and_serve(
            &fs,
            &cx,
            link,
            SemanticFlags::READ | SemanticFlags::WRITE,
        ) {
            Ok(Served::Lane(served)) => served,
            _ => panic!("regular files are lane-served"),
        };
        (fs, root, served)
    }

    #[test]
    fn write_seek_read_over_the_lane() {
        let (_fs, _root, served) = served_regular("f");
        let lane = served.lane();

        lane.write(b"hello world").expect("write");
        assert_eq!(lane.seek(0, Whence::Absolute).expect("seek"), 0);
        assert_eq!(lane.read(16).expect("read"), b"hello world");
        assert_eq!(lane.read(16).expect("read"), b"", "EOF reads empty");
        served.close();
    }

    #[test]
    fn requests_are_served_in_order() {
        let (_fs, _root, served) = served_regular("f");
        let lane = served.lane();

        for chunk in [&b"one "[..], b"two ", b"three"] {
            lane.write(chunk).expect("write");
        }
        lane.seek(0, Whence::Absolute).expect("seek");
        assert_eq!(lane.read(64).expect("read"), b"one two three");
    }

    #[test]
    fn truncate_allocate_and_memory_over_the_lane() {
        let (_fs, _root, served) = served_regular("f");
        let lane = served.lane();

        lane.write(b"abcdef").expect("write");
        lane.truncate(3).expect("truncate");
        lane.allocate(0, 10_000).expect("allocate");
        let memory = lane.access_memory().expect("call").expect("grown file");
        assert_eq!(memory.len(), 12_288);

        assert_eq!(
            lane.allocate(5, 10).unwrap_err().errno(),
            libc::EOPNOTSUPP,
            "offset allocation is refused over the wire too"
        );
    }

    #[test]
    fn type_mismatches_map_to_errno() {
        let cx = test_cx();
        let (_fs, _root, served) = served_regular("f");
        assert_eq!(
            served.lane().read_entries().unwrap_err().errno(),
            libc::ENOTDIR
        );
        served.close();

        let (fs, root_link) = mount(&cx).expect("mount");
        let root = fs.link_target(root_link).expect("root");
        fs.mkdir(&cx, root, "a").expect("mkdir");
        let served = match open_and_serve(&fs, &cx, root_link, SemanticFlags::READ) {
            Ok(Served::Lane(served)) => served,
            _ => panic!("directories are lane-served"),
        };
        assert_eq!(served.lane().read(8).unwrap_err().errno(), libc::EISDIR);
        assert_eq!(
            served.lane().read_entries().expect("entry").as_deref(),
            Some("a")
        );
        assert_eq!(served.lane().read_entries().expect("entry"), None);
    }

    #[test]
    fn close_releases_the_node() {
        let cx = test_cx();
        let (fs, root, served) = served_regular("f");
        let link = fs.get_link(&cx, root, "f").expect("lookup").expect("exists");
        let node = fs.link_target(link).expect("node");

        served.lane().write(b"pinned").expect("write");
        fs.unlink(&cx, root, "f").expect("unlink");

        // The serve task still pins the link; reads keep working.
        served.lane().seek(0, Whence::Absolute).expect("seek");
        assert_eq!(served.lane().read(6).expect("read"), b"pinned");

        served.close();
        assert!(matches!(fs.node_type(node), Err(MistError::Stale)));
    }

    #[test]
    fn cancellation_stops_the_serve_task() {
        let (_fs, _root, served) = served_regular("f");
        let cancel = served.cancel_handle();
        assert!(!cancel.is_cancelled());
        cancel.cancel();
        assert!(cancel.is_cancelled());

        // The task parks at most one poll interval before noticing.
        let mut failed = false;
        for _ in 0..100 {
            if served.lane().write(b"x").is_err() {
                failed = true;
                break;
            }
            thread::sleep(SERVE_POLL_INTERVAL);
        }
        assert!(failed, "cancelled serve task must stop answering");
        served.close();
    }

    #[test]
    fn calls_on_a_dead_lane_report_peer_gone() {
        let (server, client) = lane_pair();
        drop(server);
        assert_eq!(client.write(b"x").unwrap_err().errno(), libc::EPIPE);
        assert_eq!(client.read_entries().unwrap_err().errno(), libc::EPIPE);
    }
}
