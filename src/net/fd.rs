//! Fd registration for the event loop.
//!
//! # Responsibilities
//! - Record, per fd, who owns it and which callbacks run on readiness
//! - Dispatch read/write readiness to the typed owner
//!
//! # Design Decisions
//! - Owners are a tagged enum (listener, connection, task) instead of an
//!   untyped pointer cast on dispatch
//! - Listening sockets only ever get a read callback
//! - The table is filled during startup and read-only while serving
//! - Callbacks receive a `BorrowedFd`, so a handler can only touch an fd that
//!   is open for the duration of the call

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::Arc;

use crate::net::connection::ConnectionId;
use crate::net::listener::ListenerId;

/// Identifier of a scheduled task owning an fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

/// Who an fd belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdOwner {
    Listener(ListenerId),
    Connection(ConnectionId),
    Task(TaskId),
}

/// What the fd is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdKind {
    /// Listening socket; readable means a connection is pending.
    Listen,
    /// Outgoing connect in progress.
    Connecting,
    /// Established stream.
    Ready,
}

/// Callback run when an fd becomes ready.
pub trait ReadyHandler: Send + Sync {
    fn on_ready(&self, fd: BorrowedFd<'_>, owner: &FdOwner) -> io::Result<()>;
}

/// One registered fd.
#[derive(Clone)]
pub struct FdEntry {
    pub owner: FdOwner,
    pub kind: FdKind,
    pub read: Option<Arc<dyn ReadyHandler>>,
    pub write: Option<Arc<dyn ReadyHandler>>,
}

impl FdEntry {
    /// Entry for a listening socket: accept on read, never called for write.
    pub fn listener(id: ListenerId, accept: Arc<dyn ReadyHandler>) -> Self {
        Self {
            owner: FdOwner::Listener(id),
            kind: FdKind::Listen,
            read: Some(accept),
            write: None,
        }
    }
}

impl fmt::Debug for FdEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdEntry")
            .field("owner", &self.owner)
            .field("kind", &self.kind)
            .field("read", &self.read.is_some())
            .field("write", &self.write.is_some())
            .finish()
    }
}

/// Registration interface offered by the event loop.
pub trait FdRegistrar {
    fn register(&mut self, fd: RawFd, entry: FdEntry);
    fn unregister(&mut self, fd: RawFd) -> Option<FdEntry>;
}

/// In-memory fd table.
#[derive(Debug, Default)]
pub struct FdTable {
    entries: HashMap<RawFd, FdEntry>,
}

impl FdTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, fd: RawFd) -> Option<&FdEntry> {
        self.entries.get(&fd)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fds registered as listening sockets.
    pub fn listening(&self) -> impl Iterator<Item = (RawFd, &FdEntry)> {
        self.entries
            .iter()
            .filter(|(_, e)| e.kind == FdKind::Listen)
            .map(|(fd, e)| (*fd, e))
    }

    /// Run the read callback of `fd`. Returns false if there is none.
    pub fn dispatch_read(&self, fd: BorrowedFd<'_>) -> io::Result<bool> {
        match self.entries.get(&fd.as_raw_fd()) {
            Some(FdEntry {
                read: Some(cb),
                owner,
                ..
            }) => cb.on_ready(fd, owner).map(|()| true),
            _ => Ok(false),
        }
    }

    /// Run the write callback of `fd`. Returns false if there is none.
    pub fn dispatch_write(&self, fd: BorrowedFd<'_>) -> io::Result<bool> {
        match self.entries.get(&fd.as_raw_fd()) {
            Some(FdEntry {
                write: Some(cb),
                owner,
                ..
            }) => cb.on_ready(fd, owner).map(|()| true),
            _ => Ok(false),
        }
    }
}

impl FdRegistrar for FdTable {
    fn register(&mut self, fd: RawFd, entry: FdEntry) {
        tracing::trace!(fd, owner = ?entry.owner, kind = ?entry.kind, "fd registered");
        self.entries.insert(fd, entry);
    }

    fn unregister(&mut self, fd: RawFd) -> Option<FdEntry> {
        self.entries.remove(&fd)
    }
}
