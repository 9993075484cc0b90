//! # hook - the syscall interception shim
//!
//! POSIX-shaped wrappers that keep blocking semantics for the caller
//! while never blocking the OS thread. Each wrapper attempts the real
//! (non-blocking) syscall; on EAGAIN it registers readiness interest,
//! arms a conditional timeout timer when the socket has one, and
//! suspends the calling coroutine until either side fires.
//!
//! Interception is per-thread: worker loops enable it, every other
//! thread passes straight through to libc. Failures are reported the
//! POSIX way, `-1` (or negative count) with errno set - never a Rust
//! error type.
//!
//! ```ignore
//! // Inside a coroutine — looks like blocking, the worker stays free:
//! let n = hook::read(fd, buf.as_mut_ptr() as *mut _, buf.len());
//! let client = hook::accept(listener, std::ptr::null_mut(), std::ptr::null_mut());
//! ```

use std::cell::Cell;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fibra_core::token::IoToken;

use crate::coroutine;
use crate::fd_table::{fd_table, TimeoutKind};
use crate::worker::{self, IoDirection, Worker};

thread_local! {
    static ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Default timeout applied by [`connect`]; settable from config
static CONNECT_TIMEOUT_MS: AtomicI64 = AtomicI64::new(5000);

/// Whether this thread's calls are intercepted
#[inline]
pub fn is_enabled() -> bool {
    ENABLED.with(|e| e.get())
}

/// Enable or disable interception for the calling thread
pub fn set_hook_enabled(on: bool) {
    ENABLED.with(|e| e.set(on));
}

pub fn set_default_connect_timeout_ms(ms: i64) {
    CONNECT_TIMEOUT_MS.store(ms, Ordering::Relaxed);
}

pub fn default_connect_timeout_ms() -> i64 {
    CONNECT_TIMEOUT_MS.load(Ordering::Relaxed)
}

#[inline]
fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[inline]
fn set_errno(e: i32) {
    unsafe { *libc::__errno_location() = e };
}

fn in_coroutine() -> bool {
    is_enabled() && Worker::current().is_some() && coroutine::current().is_some()
}

/// Core blocking-emulation state machine shared by every I/O wrapper.
///
/// `sys` performs one non-blocking attempt of the wrapped syscall.
fn do_io<F>(fd: RawFd, dir: IoDirection, kind: TimeoutKind, mut sys: F) -> isize
where
    F: FnMut() -> isize,
{
    if !is_enabled() {
        return sys();
    }
    let worker = match Worker::current() {
        Some(w) => w,
        None => return sys(),
    };
    let co = match coroutine::current() {
        Some(c) => c,
        None => return sys(),
    };
    let ctx = match fd_table().get_or_add(fd) {
        Some(c) => c,
        None => return sys(),
    };
    // Non-sockets and sockets the app made non-blocking itself keep
    // their native behaviour
    if !ctx.is_socket() || ctx.user_nonblock() {
        return sys();
    }
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }

    loop {
        let mut n = sys();
        while n < 0 && errno() == libc::EINTR {
            n = sys();
        }
        if n >= 0 || errno() != libc::EAGAIN {
            return n;
        }

        // Would block: arm the race between readiness and timeout,
        // park, and let whichever side claims the token decide
        let timeout_ms = ctx.timeout_ms(kind);
        let token = Arc::new(IoToken::new());
        let timer = if timeout_ms >= 0 {
            let weak = Rc::downgrade(&worker);
            Some(worker.add_conditional_timer(
                Duration::from_millis(timeout_ms as u64),
                Arc::downgrade(&token),
                move || {
                    if let Some(worker) = weak.upgrade() {
                        worker.handle_event(fd, dir);
                    }
                },
            ))
        } else {
            None
        };

        if worker.add_event(fd, dir, Rc::clone(&co)).is_err() {
            if let Some(t) = timer {
                worker.cancel_timer(t);
            }
            // errno carries the epoll_ctl failure
            return -1;
        }

        coroutine::yield_to_suspend();

        if let Some(t) = timer {
            worker.cancel_timer(t);
        }
        if let Some(err) = token.claimed() {
            set_errno(err);
            return -1;
        }
        // The fd may have been closed (and its number reused) while we
        // were parked; the retained context says so
        if ctx.is_closed() {
            set_errno(libc::EBADF);
            return -1;
        }
    }
}

// ── sleep family ──

/// Suspends the coroutine instead of the thread; always sleeps the
/// full interval and returns 0
pub fn sleep(secs: u32) -> u32 {
    if !in_coroutine() {
        return unsafe { libc::sleep(secs) };
    }
    worker::sleep(Duration::from_secs(secs as u64));
    0
}

pub fn usleep(usec: libc::useconds_t) -> i32 {
    if !in_coroutine() {
        return unsafe { libc::usleep(usec) };
    }
    worker::sleep(Duration::from_micros(usec as u64));
    0
}

/// Never reports interruption: `rem` is left untouched
pub fn nanosleep(req: *const libc::timespec, rem: *mut libc::timespec) -> i32 {
    if req.is_null() {
        set_errno(libc::EINVAL);
        return -1;
    }
    if !in_coroutine() {
        return unsafe { libc::nanosleep(req, rem) };
    }
    let ts = unsafe { &*req };
    if ts.tv_sec < 0 || ts.tv_nsec < 0 || ts.tv_nsec > 999_999_999 {
        set_errno(libc::EINVAL);
        return -1;
    }
    worker::sleep(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32));
    0
}

/// Convenience millisecond sleep
pub fn sleep_ms(ms: u64) {
    if in_coroutine() {
        worker::sleep(Duration::from_millis(ms));
    } else {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

// ── descriptor lifecycle ──

/// Creates the socket and registers it in the descriptor table, which
/// forces it kernel-side non-blocking
pub fn socket(domain: i32, ty: i32, protocol: i32) -> RawFd {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd >= 0 && is_enabled() {
        fd_table().add_fd(fd);
    }
    fd
}

/// Wakes both directions' waiters (they observe EBADF on retry), drops
/// the table entry, then really closes
pub fn close(fd: RawFd) -> i32 {
    if is_enabled() {
        if let Some(ctx) = fd_table().get(fd) {
            if ctx.is_managed() {
                if let Some(worker) = Worker::current() {
                    worker.handle_all_events(fd);
                }
            }
            fd_table().del_fd(fd);
        }
    }
    unsafe { libc::close(fd) }
}

// ── connect / accept ──

/// `connect` with the configured default timeout
pub fn connect(fd: RawFd, addr: *const libc::sockaddr, addrlen: libc::socklen_t) -> i32 {
    connect_with_timeout(fd, addr, addrlen, default_connect_timeout_ms())
}

/// Non-blocking connect driven to completion: EINPROGRESS parks the
/// coroutine on write readiness, then SO_ERROR decides the outcome.
/// `timeout_ms < 0` waits forever.
pub fn connect_with_timeout(
    fd: RawFd,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
    timeout_ms: i64,
) -> i32 {
    let mut sys = || unsafe { libc::connect(fd, addr, addrlen) };
    if !is_enabled() {
        return sys();
    }
    let worker = match Worker::current() {
        Some(w) => w,
        None => return sys(),
    };
    let co = match coroutine::current() {
        Some(c) => c,
        None => return sys(),
    };
    let ctx = match fd_table().get_or_add(fd) {
        Some(c) => c,
        None => return sys(),
    };
    if !ctx.is_socket() || ctx.user_nonblock() {
        return sys();
    }
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }

    let mut n = sys();
    while n < 0 && errno() == libc::EINTR {
        n = sys();
    }
    if n == 0 {
        return 0;
    }
    if !(n < 0 && errno() == libc::EINPROGRESS) {
        return n;
    }

    let token = Arc::new(IoToken::new());
    let timer = if timeout_ms >= 0 {
        let weak = Rc::downgrade(&worker);
        Some(worker.add_conditional_timer(
            Duration::from_millis(timeout_ms as u64),
            Arc::downgrade(&token),
            move || {
                if let Some(worker) = weak.upgrade() {
                    worker.handle_event(fd, IoDirection::Write);
                }
            },
        ))
    } else {
        None
    };

    if worker.add_event(fd, IoDirection::Write, Rc::clone(&co)).is_err() {
        if let Some(t) = timer {
            worker.cancel_timer(t);
        }
        return -1;
    }

    coroutine::yield_to_suspend();

    if let Some(t) = timer {
        worker.cancel_timer(t);
    }
    if let Some(err) = token.claimed() {
        set_errno(err);
        return -1;
    }
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }

    // Writable now: read back the connection result
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return -1;
    }
    if err != 0 {
        set_errno(err);
        return -1;
    }
    0
}

/// The accepted descriptor is registered (and forced non-blocking)
/// before it is returned
pub fn accept(fd: RawFd, addr: *mut libc::sockaddr, addrlen: *mut libc::socklen_t) -> RawFd {
    let n = do_io(fd, IoDirection::Read, TimeoutKind::Recv, || unsafe {
        libc::accept(fd, addr, addrlen) as isize
    });
    if n >= 0 && is_enabled() {
        fd_table().add_fd(n as RawFd);
    }
    n as RawFd
}

// ── read side ──

pub fn read(fd: RawFd, buf: *mut libc::c_void, count: usize) -> isize {
    do_io(fd, IoDirection::Read, TimeoutKind::Recv, || unsafe {
        libc::read(fd, buf, count)
    })
}

pub fn readv(fd: RawFd, iov: *const libc::iovec, iovcnt: i32) -> isize {
    do_io(fd, IoDirection::Read, TimeoutKind::Recv, || unsafe {
        libc::readv(fd, iov, iovcnt)
    })
}

pub fn recv(fd: RawFd, buf: *mut libc::c_void, len: usize, flags: i32) -> isize {
    do_io(fd, IoDirection::Read, TimeoutKind::Recv, || unsafe {
        libc::recv(fd, buf, len, flags)
    })
}

pub fn recvfrom(
    fd: RawFd,
    buf: *mut libc::c_void,
    len: usize,
    flags: i32,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> isize {
    do_io(fd, IoDirection::Read, TimeoutKind::Recv, || unsafe {
        libc::recvfrom(fd, buf, len, flags, src_addr, addrlen)
    })
}

pub fn recvmsg(fd: RawFd, msg: *mut libc::msghdr, flags: i32) -> isize {
    do_io(fd, IoDirection::Read, TimeoutKind::Recv, || unsafe {
        libc::recvmsg(fd, msg, flags)
    })
}

pub fn recvmmsg(
    fd: RawFd,
    msgvec: *mut libc::mmsghdr,
    vlen: u32,
    flags: i32,
    timeout: *mut libc::timespec,
) -> i32 {
    do_io(fd, IoDirection::Read, TimeoutKind::Recv, || unsafe {
        libc::recvmmsg(fd, msgvec, vlen, flags, timeout) as isize
    }) as i32
}

// ── write side ──

pub fn write(fd: RawFd, buf: *const libc::c_void, count: usize) -> isize {
    do_io(fd, IoDirection::Write, TimeoutKind::Send, || unsafe {
        libc::write(fd, buf, count)
    })
}

pub fn writev(fd: RawFd, iov: *const libc::iovec, iovcnt: i32) -> isize {
    do_io(fd, IoDirection::Write, TimeoutKind::Send, || unsafe {
        libc::writev(fd, iov, iovcnt)
    })
}

pub fn send(fd: RawFd, buf: *const libc::c_void, len: usize, flags: i32) -> isize {
    do_io(fd, IoDirection::Write, TimeoutKind::Send, || unsafe {
        libc::send(fd, buf, len, flags)
    })
}

pub fn sendto(
    fd: RawFd,
    buf: *const libc::c_void,
    len: usize,
    flags: i32,
    dest_addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> isize {
    do_io(fd, IoDirection::Write, TimeoutKind::Send, || unsafe {
        libc::sendto(fd, buf, len, flags, dest_addr, addrlen)
    })
}

pub fn sendmsg(fd: RawFd, msg: *const libc::msghdr, flags: i32) -> isize {
    do_io(fd, IoDirection::Write, TimeoutKind::Send, || unsafe {
        libc::sendmsg(fd, msg, flags)
    })
}

pub fn sendmmsg(fd: RawFd, msgvec: *mut libc::mmsghdr, vlen: u32, flags: i32) -> i32 {
    do_io(fd, IoDirection::Write, TimeoutKind::Send, || unsafe {
        libc::sendmmsg(fd, msgvec, vlen, flags) as isize
    }) as i32
}

// ── flag shadowing ──

/// F_GETFL/F_SETFL report and record the application's view of
/// O_NONBLOCK on managed sockets; the kernel flag stays set. All other
/// commands pass through verbatim.
pub fn fcntl(fd: RawFd, cmd: i32, arg: libc::c_long) -> i32 {
    match cmd {
        libc::F_SETFL => {
            if is_enabled() {
                if let Some(ctx) = fd_table().get_or_add(fd) {
                    if ctx.is_managed() {
                        ctx.set_user_nonblock(arg & libc::O_NONBLOCK as libc::c_long != 0);
                        return unsafe {
                            libc::fcntl(fd, libc::F_SETFL, arg | libc::O_NONBLOCK as libc::c_long)
                        };
                    }
                }
            }
            unsafe { libc::fcntl(fd, cmd, arg) }
        }
        libc::F_GETFL => {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 && is_enabled() {
                if let Some(ctx) = fd_table().get_or_add(fd) {
                    if ctx.is_managed() {
                        return if ctx.user_nonblock() {
                            flags | libc::O_NONBLOCK
                        } else {
                            flags & !libc::O_NONBLOCK
                        };
                    }
                }
            }
            flags
        }
        _ => unsafe { libc::fcntl(fd, cmd, arg) },
    }
}

/// FIONBIO on a managed socket updates the shadowed flag only; the
/// descriptor stays kernel-side non-blocking. Everything else passes
/// through.
pub fn ioctl(fd: RawFd, request: libc::c_ulong, arg: *mut libc::c_void) -> i32 {
    if request == libc::FIONBIO as libc::c_ulong && is_enabled() && !arg.is_null() {
        if let Some(ctx) = fd_table().get_or_add(fd) {
            if ctx.is_managed() {
                let on = unsafe { *(arg as *const libc::c_int) } != 0;
                ctx.set_user_nonblock(on);
                return 0;
            }
        }
    }
    unsafe { libc::ioctl(fd, request as _, arg) }
}

/// Pure pass-through
pub fn getsockopt(
    fd: RawFd,
    level: i32,
    optname: i32,
    optval: *mut libc::c_void,
    optlen: *mut libc::socklen_t,
) -> i32 {
    unsafe { libc::getsockopt(fd, level, optname, optval, optlen) }
}

/// SO_RCVTIMEO/SO_SNDTIMEO are mirrored into the descriptor table so
/// the shim can honour them; a zero timeval means "never time out",
/// matching the kernel. The call is forwarded regardless.
pub fn setsockopt(
    fd: RawFd,
    level: i32,
    optname: i32,
    optval: *const libc::c_void,
    optlen: libc::socklen_t,
) -> i32 {
    if is_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && !optval.is_null()
        && optlen as usize >= std::mem::size_of::<libc::timeval>()
    {
        if let Some(ctx) = fd_table().get_or_add(fd) {
            let tv = unsafe { &*(optval as *const libc::timeval) };
            let ms = tv.tv_sec as i64 * 1000 + tv.tv_usec as i64 / 1000;
            let ms = if ms <= 0 { -1 } else { ms };
            let kind = if optname == libc::SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            ctx.set_timeout_ms(kind, ms);
        }
    }
    unsafe { libc::setsockopt(fd, level, optname, optval, optlen) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interception_is_per_thread() {
        assert!(!is_enabled());
        set_hook_enabled(true);
        assert!(is_enabled());
        let other = std::thread::spawn(is_enabled).join().unwrap();
        assert!(!other);
        set_hook_enabled(false);
    }

    #[test]
    fn disabled_thread_passes_read_through() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let payload = b"x";
        assert_eq!(
            write(fds[1], payload.as_ptr() as *const _, 1),
            1
        );
        let mut buf = [0u8; 4];
        assert_eq!(read(fds[0], buf.as_mut_ptr() as *mut _, 4), 1);
        assert_eq!(buf[0], b'x');
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn nanosleep_rejects_bad_timespec() {
        let ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 2_000_000_000,
        };
        set_hook_enabled(true);
        assert_eq!(nanosleep(&ts, std::ptr::null_mut()), -1);
        assert_eq!(errno(), libc::EINVAL);
        set_hook_enabled(false);
    }

    #[test]
    fn connect_timeout_default_is_configurable() {
        let before = default_connect_timeout_ms();
        set_default_connect_timeout_ms(123);
        assert_eq!(default_connect_timeout_ms(), 123);
        set_default_connect_timeout_ms(before);
    }
}
