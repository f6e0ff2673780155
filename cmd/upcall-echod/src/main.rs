//! upcall echo daemon
//!
//! TCP echo server driven entirely by the upcall worker fabric: one
//! kernel-assisted batched submit/reap loop per CPU (or cache cluster, or a
//! single shared queue), each echoing fixed-size messages back to the peer
//! that sent them.
//!
//! Usage:
//!     cargo build --release -p upcall-echod
//!     ./target/release/upcall-echod [port] [msg_size] [buf_count] [model] [threads_per_queue]
//!
//! `model` is one of `pcpu` (default), `pcache`, `single`.
//!
//! Test with:
//!     echo "hello" | nc localhost 9999

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use upcall_core::flags::ConcurrencyModel;
use upcall_runtime::EventHandlerBuilder;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_shutdown_signal(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn parse_model(s: &str) -> ConcurrencyModel {
    match s {
        "pcache" => ConcurrencyModel::PerCacheCluster,
        "single" => ConcurrencyModel::Single,
        _ => ConcurrencyModel::PerCpu,
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9999);
    let msg_size: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(4096);
    let buf_count: usize = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(64);
    let model = args.get(4).map(|s| parse_model(s)).unwrap_or(ConcurrencyModel::PerCpu);
    let threads_per_queue: usize = args.get(5).and_then(|s| s.parse().ok()).unwrap_or(1);
    let donation = !cfg!(feature = "legacy");

    unsafe {
        libc::signal(libc::SIGINT, handle_shutdown_signal as usize);
        libc::signal(libc::SIGTERM, handle_shutdown_signal as usize);
    }

    eprintln!(
        "upcall-echod: starting on port {} model={:?} msg_size={} buf_count={} threads_per_queue={}",
        port, model, msg_size, buf_count, threads_per_queue
    );

    #[cfg(not(feature = "legacy"))]
    run_modern(port, msg_size, buf_count, model, threads_per_queue, donation);

    #[cfg(feature = "legacy")]
    run_legacy(port, msg_size, buf_count, model, threads_per_queue);
}

#[cfg(not(feature = "legacy"))]
fn run_modern(port: u16, msg_size: usize, buf_count: usize, model: ConcurrencyModel, threads_per_queue: usize, donation: bool) {
    let handler = EventHandlerBuilder::new()
        .model(model)
        .threads_per_queue(threads_per_queue)
        .msg_size(msg_size)
        .buf_count(buf_count)
        .donation(donation)
        .build(move |worker, cache, index| {
            upcall_echo::setup_worker(worker, cache, index, port, msg_size, donation);
        });

    let handler = match handler {
        Ok(h) => h,
        Err(e) => {
            eprintln!("upcall-echod: startup failed: {}", e);
            std::process::exit(1);
        }
    };

    eprintln!("upcall-echod: listening on 0.0.0.0:{} (upfd={})", port, handler.upfd());

    let start = Instant::now();
    while RUNNING.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_secs(5));
        upcall_echo::log_stats(start.elapsed().as_secs_f64());
    }

    eprintln!("\nupcall-echod: shutting down...");
    handler.shutdown();
    eprintln!("upcall-echod: done.");
}

#[cfg(feature = "legacy")]
fn run_legacy(port: u16, msg_size: usize, buf_count: usize, model: ConcurrencyModel, threads_per_queue: usize) {
    let handler = upcall_runtime::init_legacy_event_handler(model, threads_per_queue, msg_size, buf_count, move |registry, upfd, cache, index| {
        upcall_echo::setup_worker_legacy(registry, upfd, cache, index, port, msg_size)
    });

    let handler = match handler {
        Ok(h) => h,
        Err(e) => {
            eprintln!("upcall-echod: startup failed: {}", e);
            std::process::exit(1);
        }
    };

    eprintln!("upcall-echod: listening on 0.0.0.0:{} (legacy ctl/wait, upfd={})", port, handler.upfd());

    let start = Instant::now();
    while RUNNING.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_secs(5));
        upcall_echo::log_stats(start.elapsed().as_secs_f64());
    }

    eprintln!("\nupcall-echod: shutting down...");
    handler.shutdown();
    eprintln!("upcall-echod: done.");
}
