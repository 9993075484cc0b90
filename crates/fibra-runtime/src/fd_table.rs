//! Process-wide descriptor state table
//!
//! Tracks every descriptor the interception shim has seen. Sockets are
//! forced into kernel non-blocking mode on first sight; the flags the
//! application believes it set (O_NONBLOCK, SO_RCVTIMEO/SO_SNDTIMEO)
//! are shadowed here so fcntl/ioctl/getsockopt can keep lying
//! consistently.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

/// Which of the two per-socket timeouts to read or write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Recv,
    Send,
}

/// Shadow state for one descriptor
pub struct FdContext {
    fd: RawFd,
    is_socket: bool,
    closed: AtomicBool,
    /// O_NONBLOCK as far as the application knows; the kernel-side
    /// flag is always set on managed sockets
    user_nonblock: AtomicBool,
    /// Milliseconds, -1 = wait forever
    recv_timeout_ms: AtomicI64,
    send_timeout_ms: AtomicI64,
}

impl FdContext {
    fn new(fd: RawFd) -> Self {
        let is_socket = unsafe {
            let mut st: libc::stat = std::mem::zeroed();
            libc::fstat(fd, &mut st) == 0 && (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK
        };

        if is_socket {
            // Kernel-side non-blocking always on for managed sockets;
            // the shim supplies the blocking behaviour itself
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL, 0);
                if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                    libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                }
            }
        }

        Self {
            fd,
            is_socket,
            closed: AtomicBool::new(false),
            user_nonblock: AtomicBool::new(false),
            recv_timeout_ms: AtomicI64::new(-1),
            send_timeout_ms: AtomicI64::new(-1),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::Release);
    }

    /// Shadowed SO_RCVTIMEO/SO_SNDTIMEO in milliseconds, -1 = none
    pub fn timeout_ms(&self, kind: TimeoutKind) -> i64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Acquire),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Acquire),
        }
    }

    pub fn set_timeout_ms(&self, kind: TimeoutKind, ms: i64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::Release),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::Release),
        }
    }

    /// True when the shim should drive this descriptor through the
    /// reactor instead of passing calls straight through
    pub fn is_managed(&self) -> bool {
        self.is_socket && !self.is_closed()
    }
}

/// Table of all tracked descriptors, indexed by raw fd
pub struct FdTable {
    slots: RwLock<Vec<Option<Arc<FdContext>>>>,
}

impl FdTable {
    fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
        }
    }

    /// Look up an existing context
    pub fn get(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let slots = match self.slots.read() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots.get(fd as usize).and_then(|s| s.clone())
    }

    /// Register a descriptor, probing its type and forcing sockets
    /// non-blocking. Replaces any stale entry left by fd reuse.
    pub fn add_fd(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let ctx = Arc::new(FdContext::new(fd));
        let mut slots = match self.slots.write() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        let idx = fd as usize;
        if idx >= slots.len() {
            slots.resize(idx + 1, None);
        }
        slots[idx] = Some(Arc::clone(&ctx));
        Some(ctx)
    }

    /// Context for `fd`, registering it on first sight
    pub fn get_or_add(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        match self.get(fd) {
            Some(ctx) => Some(ctx),
            None => self.add_fd(fd),
        }
    }

    /// Drop the entry for a closed descriptor and flag outstanding
    /// holders of the context
    pub fn del_fd(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut slots = match self.slots.write() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(slot) = slots.get_mut(fd as usize) {
            if let Some(ctx) = slot.take() {
                ctx.set_closed();
            }
        }
    }
}

/// The process-wide descriptor table
pub fn fd_table() -> &'static FdTable {
    static TABLE: OnceLock<FdTable> = OnceLock::new();
    TABLE.get_or_init(FdTable::new)
}
