//! Shadowed descriptor flags: fcntl, ioctl, setsockopt mirroring

use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

use fibra::{fd_table, hook, Scheduler, SchedulerConfig, TimeoutKind};

fn config() -> SchedulerConfig {
    SchedulerConfig::new().num_workers(1).stack_size(64 * 1024)
}

/// Run one closure as a coroutine and shut down when it finishes
fn run_hooked<F>(func: F)
where
    F: FnOnce() + Send + 'static,
{
    let mut sched = Scheduler::new("flags", config()).unwrap();
    sched.start().unwrap();
    let stop = sched.stop_handle();
    let done = Arc::new(Mutex::new(false));
    let d = Arc::clone(&done);
    sched.add_task(
        move || {
            func();
            *d.lock().unwrap() = true;
            stop.stop();
        },
        None,
    );
    sched.wait().unwrap();
    assert!(*done.lock().unwrap());
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[test]
fn fcntl_hides_the_forced_nonblock_flag() {
    run_hooked(|| {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);

        // Kernel view: forced non-blocking on registration
        let real = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert!(real & libc::O_NONBLOCK != 0);

        // Application view: still blocking
        let seen = hook::fcntl(fd, libc::F_GETFL, 0);
        assert_eq!(seen & libc::O_NONBLOCK, 0);

        hook::close(fd);
    });
}

#[test]
fn fcntl_setfl_records_user_nonblock() {
    run_hooked(|| {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);

        let flags = hook::fcntl(fd, libc::F_GETFL, 0) as libc::c_long;
        assert_eq!(
            hook::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK as libc::c_long),
            0
        );
        let seen = hook::fcntl(fd, libc::F_GETFL, 0);
        assert!(seen & libc::O_NONBLOCK != 0);
        assert!(fd_table().get(fd).unwrap().user_nonblock());

        // Clearing it restores the blocking illusion
        assert_eq!(hook::fcntl(fd, libc::F_SETFL, flags), 0);
        let seen = hook::fcntl(fd, libc::F_GETFL, 0);
        assert_eq!(seen & libc::O_NONBLOCK, 0);

        hook::close(fd);
    });
}

#[test]
fn user_nonblock_sockets_fail_fast_instead_of_parking() {
    run_hooked(|| {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(ret, 0);

        let mut on: libc::c_int = 1;
        assert_eq!(
            hook::ioctl(
                fds[0],
                libc::FIONBIO as libc::c_ulong,
                &mut on as *mut libc::c_int as *mut libc::c_void,
            ),
            0
        );

        // Empty socket + user non-blocking: immediate EAGAIN, no park
        let mut buf = [0u8; 4];
        let n = hook::read(fds[0], buf.as_mut_ptr() as *mut libc::c_void, buf.len());
        assert_eq!(n, -1);
        assert!(last_errno() == libc::EAGAIN || last_errno() == libc::EWOULDBLOCK);

        hook::close(fds[0]);
        hook::close(fds[1]);
    });
}

#[test]
fn setsockopt_mirrors_timeouts_into_the_table() {
    run_hooked(|| {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
        assert!(fd >= 0);

        let tv = libc::timeval {
            tv_sec: 1,
            tv_usec: 250_000,
        };
        assert_eq!(
            hook::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            ),
            0
        );
        let ctx = fd_table().get(fd).unwrap();
        assert_eq!(ctx.timeout_ms(TimeoutKind::Recv), 1250);
        assert_eq!(ctx.timeout_ms(TimeoutKind::Send), -1);

        // Zero timeval means "never time out"
        let zero = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        assert_eq!(
            hook::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &zero as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            ),
            0
        );
        assert_eq!(ctx.timeout_ms(TimeoutKind::Recv), -1);

        hook::close(fd);
    });
}

#[test]
fn closed_descriptor_number_gets_a_fresh_context_on_reuse() {
    run_hooked(|| {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);
        let stale = fd_table().get(fd).unwrap();
        stale.set_user_nonblock(true);
        hook::close(fd);
        assert!(stale.is_closed());

        // The next socket may reuse the same integer; either way the
        // context starts clean
        let fd2 = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd2 >= 0);
        let fresh = fd_table().get(fd2).unwrap();
        assert!(!fresh.is_closed());
        assert!(!fresh.user_nonblock());
        hook::close(fd2);
    });
}
