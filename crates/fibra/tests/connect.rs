//! Connect timeout behaviour against a non-routable address

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fibra::{hook, Scheduler, SchedulerConfig};

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[test]
fn connect_to_blackhole_fails_within_the_timeout() {
    let mut sched = Scheduler::new(
        "conn",
        SchedulerConfig::new().num_workers(1).stack_size(64 * 1024),
    )
    .unwrap();
    sched.start().unwrap();
    let stop = sched.stop_handle();

    let outcome = Arc::new(Mutex::new(None));
    let out = Arc::clone(&outcome);
    sched.add_task(
        move || {
            let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            assert!(fd >= 0);

            // TEST-NET-ish blackhole: packets go nowhere
            let addr = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: 81u16.to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_be_bytes([10, 255, 255, 1]).to_be(),
                },
                sin_zero: [0; 8],
            };

            let start = Instant::now();
            let ret = hook::connect_with_timeout(
                fd,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                100,
            );
            *out.lock().unwrap() = Some((ret, last_errno(), start.elapsed()));
            hook::close(fd);
            stop.stop();
        },
        None,
    );

    sched.wait().unwrap();
    let (ret, errno, elapsed) = outcome.lock().unwrap().take().unwrap();
    assert_eq!(ret, -1);
    // Some environments reject the route immediately instead of
    // letting the SYN time out
    assert!(
        errno == libc::ETIMEDOUT
            || errno == libc::ENETUNREACH
            || errno == libc::EHOSTUNREACH
            || errno == libc::ECONNREFUSED,
        "unexpected errno {}",
        errno
    );
    assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);
}
