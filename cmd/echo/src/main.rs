//! Echo server demo
//!
//! One coroutine accepts, one coroutine per connection echoes. Every
//! call below looks blocking; the interception shim keeps the worker
//! threads free.
//!
//! Usage:
//!     cargo run --release -p echo [port]
//!
//! Test with:
//!     echo "hello" | nc localhost 9999

use fibra::{hook, rt_error, rt_info, Scheduler, SchedulerConfig, Worker};

const BUF_SIZE: usize = 4096;

// Startup-only plain syscalls, before any worker runs
fn setup_listener(port: u16) -> i32 {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
        assert!(fd >= 0, "socket() failed");

        let opt: i32 = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const _ as *const _,
            std::mem::size_of::<i32>() as u32,
        );

        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_addr.s_addr = 0; // INADDR_ANY
        addr.sin_port = port.to_be();

        let ret = libc::bind(
            fd,
            &addr as *const _ as *const _,
            std::mem::size_of_val(&addr) as u32,
        );
        assert!(ret == 0, "bind() failed: {}", std::io::Error::last_os_error());

        libc::listen(fd, 1024);
        fd
    }
}

fn serve(fd: i32) {
    let mut buf = [0u8; BUF_SIZE];
    loop {
        let n = hook::read(fd, buf.as_mut_ptr() as *mut libc::c_void, BUF_SIZE);
        if n <= 0 {
            break;
        }
        // Echo back, handling partial writes
        let mut sent = 0isize;
        while sent < n {
            let m = hook::write(
                fd,
                unsafe { buf.as_ptr().offset(sent) } as *const libc::c_void,
                (n - sent) as usize,
            );
            if m <= 0 {
                hook::close(fd);
                return;
            }
            sent += m;
        }
    }
    hook::close(fd);
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9999);

    let listener = setup_listener(port);
    rt_info!("echo: listening on 0.0.0.0:{}", port);

    let mut sched =
        Scheduler::new("echo", SchedulerConfig::from_env()).expect("scheduler setup failed");
    sched.start().expect("scheduler start failed");

    sched.add_task(
        move || loop {
            let client = hook::accept(listener, std::ptr::null_mut(), std::ptr::null_mut());
            if client < 0 {
                rt_error!(
                    "accept failed: {}",
                    std::io::Error::last_os_error()
                );
                continue;
            }
            // Keep the connection on the accepting worker
            let worker = Worker::current().expect("accept loop runs on a worker");
            if let Err(e) = worker.spawn(move || serve(client)) {
                rt_error!("spawn for fd {} failed: {}", client, e);
                hook::close(client);
            }
        },
        None,
    );

    sched.wait().expect("scheduler wait failed");
}
