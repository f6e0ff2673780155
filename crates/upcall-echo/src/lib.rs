//! The echo application: connection table, state machine, handlers.
//!
//! Kept as its own library crate (rather than folded into the binary, the
//! way `cmd/ksvc-echo` keeps `Conn`/`ConnSlab` alongside `main`) so the
//! state machine can be unit tested without a kernel.

pub mod connection;
pub mod context;
pub mod handlers;
pub mod registry;

use upcall_runtime::buffer::BufferCache;
use upcall_runtime::eventloop::Worker;

pub use connection::{ConnPool, Connection, State};
pub use handlers::{log_stats, on_accept, on_read};
pub use registry::{conns, ConnTable};

const BACKLOG: i32 = 1024;

/// Per-worker setup, run once per worker thread before the rendezvous
/// barrier: opens this worker's own listening socket (`SO_REUSEPORT` +
/// `SO_REUSEADDR`, so every worker can bind the same port and let the
/// kernel load-balance accepts, per spec.md §6), installs the
/// thread-local worker context, and queues the first accept — mirroring
/// `worker_setup` in `event-tester/upcall.c`.
pub fn setup_worker(
    worker: &mut Worker,
    cache: &mut BufferCache,
    index: usize,
    port: u16,
    msg_size: usize,
    donation: bool,
) {
    let listen_fd = open_listener(port);
    context::install(worker, cache, index, msg_size, listen_fd, donation);
    worker.add_accept(listen_fd, on_accept);
}

#[cfg(feature = "legacy")]
/// Per-worker setup for the legacy `ctl`/`wait` variant: same listener
/// setup, but registration goes through `register_event` instead of
/// `add_accept`. Matches the `Fn(&EventRegistry, i32, &mut BufferCache,
/// usize) -> Result<i32>` shape `init_legacy_event_handler` expects —
/// `registry` here is the very table `on_accept_classic`'s fresh
/// connections will register into, via `context::registry()`.
pub fn setup_worker_legacy(
    registry: &upcall_runtime::legacy::EventRegistry,
    upfd: i32,
    cache: &mut BufferCache,
    index: usize,
    port: u16,
    msg_size: usize,
) -> upcall_core::error::Result<i32> {
    let listen_fd = open_listener(port);
    // `donation` is irrelevant to the legacy path — it never uses the
    // modern submit/reap loop's buffer pool, so there is no `Worker` to
    // install at all.
    context::install_legacy(registry, cache, index, msg_size, listen_fd, upfd);

    let item = upcall_core::entry::WorkItem {
        arg: listen_fd as usize as *mut core::ffi::c_void,
        work_fn: handlers::on_accept_classic,
    };
    registry.register_event(upfd, listen_fd, libc::POLLIN as u32, item)?;
    Ok(listen_fd)
}

fn open_listener(port: u16) -> i32 {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        assert!(fd >= 0, "socket() failed: {}", std::io::Error::last_os_error());

        let opt: i32 = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &opt as *const _ as *const libc::c_void,
            std::mem::size_of::<i32>() as u32,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const _ as *const libc::c_void,
            std::mem::size_of::<i32>() as u32,
        );

        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        addr.sin_family = libc::AF_INET as u16;
        addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();
        addr.sin_port = port.to_be();

        let ret = libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of_val(&addr) as u32,
        );
        assert!(ret == 0, "bind() failed: {}", std::io::Error::last_os_error());

        let ret = libc::listen(fd, BACKLOG);
        assert!(ret == 0, "listen() failed: {}", std::io::Error::last_os_error());

        fd
    }
}
