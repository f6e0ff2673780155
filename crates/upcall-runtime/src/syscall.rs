//! Raw bindings to the upcall syscalls.
//!
//! Mirrors `libupcall/upcall.c` — the shared contract between kernel and
//! userspace. These numbers are reserved but unallocated upstream; a real
//! deployment picks up whatever the running kernel's `<asm/unistd.h>`
//! assigns. Treated as an opaque collaborator per spec.md §1 — this module
//! is the *entire* boundary to it.

use upcall_core::entry::UpEvent;
use upcall_core::error::{Result, UpcallError};
use upcall_core::flags::{UPCALL_MASK, UPIOGQCNT};

#[cfg(not(target_os = "linux"))]
compile_error!("the upcall syscalls are Linux-only");

const SYS_UPCALL_CREATE: libc::c_long = 468;
const SYS_UPCALL_SUBMIT: libc::c_long = 469;

/// `upcall_create(flags) -> upfd | -errno`.
///
/// `flags` must carry exactly one concurrency-model bit and no bits outside
/// [`UPCALL_MASK`] — both are checked here rather than left for the kernel
/// to reject, since a local check gives a typed error instead of a bare
/// errno for the most common misuse.
pub fn create(flags: u32) -> Result<i32> {
    if flags & !UPCALL_MASK != 0 {
        return Err(UpcallError::InvalidFlags);
    }
    let model_bits = (flags & upcall_core::flags::UPCALL_MODEL_MASK).count_ones();
    if model_bits != 1 {
        return Err(UpcallError::InvalidFlags);
    }

    let ret = unsafe { libc::syscall(SYS_UPCALL_CREATE, flags as libc::c_long) };
    if ret < 0 {
        Err(UpcallError::Os(-(ret as i32)))
    } else {
        Ok(ret as i32)
    }
}

/// `upcall_submit(upfd, in_cnt, in, out_cnt, out) -> completed | -errno`.
///
/// Posts up to `in.len()` work requests, blocks the calling worker until at
/// least one event is ready, and writes up to `out.len()` completions into
/// `out`. Returns the number of completions actually written.
///
/// Partial submission is not observable per spec.md §4.1: either every
/// entry in `in` was queued, or this returns `Err` and none were.
pub fn submit(upfd: i32, input: &[UpEvent], output: &mut [UpEvent]) -> Result<usize> {
    let ret = unsafe {
        libc::syscall(
            SYS_UPCALL_SUBMIT,
            upfd as libc::c_long,
            input.len() as libc::c_long,
            input.as_ptr() as libc::c_long,
            output.len() as libc::c_long,
            output.as_mut_ptr() as libc::c_long,
        )
    };
    if ret < 0 {
        Err(UpcallError::Os(-(ret as i32)))
    } else {
        Ok(ret as usize)
    }
}

/// `ioctl(upfd, UPIOGQCNT, &count)` — how many event queues the kernel
/// object exposes. Drives the topology resolver (spec.md §4.3).
pub fn queue_count(upfd: i32) -> Result<u64> {
    let mut count: u64 = 0;
    let ret = unsafe { libc::ioctl(upfd, UPIOGQCNT as _, &mut count as *mut u64) };
    if ret < 0 {
        Err(UpcallError::Os(errno()))
    } else {
        Ok(count)
    }
}

fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[cfg(feature = "legacy")]
pub mod legacy {
    //! The legacy variant's `ctl` (register/unregister) and `wait` (single
    //! completion) operations, per spec.md §4.1.

    use super::errno;
    use upcall_core::entry::UpEvent;
    use upcall_core::error::{Result, UpcallError};
    use upcall_core::flags::CtlAction;

    const SYS_UPCALL_CTL: libc::c_long = 470;
    const SYS_UPCALL_WAIT: libc::c_long = 471;

    /// Bind or unbind a `{work_fn, arg}` pair to an `(fd, event-mask)` tuple.
    pub fn ctl(upfd: i32, action: CtlAction, fd: i32, events: u32, work_arg: u64) -> Result<()> {
        let ret = unsafe {
            libc::syscall(
                SYS_UPCALL_CTL,
                upfd as libc::c_long,
                action as libc::c_long,
                fd as libc::c_long,
                events as libc::c_long,
                work_arg as libc::c_long,
            )
        };
        if ret < 0 {
            Err(UpcallError::Os(errno()))
        } else {
            Ok(())
        }
    }

    /// Block for a single completion.
    pub fn wait(upfd: i32, item: &mut UpEvent) -> Result<()> {
        let ret =
            unsafe { libc::syscall(SYS_UPCALL_WAIT, upfd as libc::c_long, item as *mut UpEvent as libc::c_long) };
        if ret < 0 {
            Err(UpcallError::Os(errno()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_rejects_unknown_bits() {
        let err = create(0xF000_0000 | upcall_core::flags::UPCALL_PCPU).unwrap_err();
        assert!(matches!(err, UpcallError::InvalidFlags));
    }

    #[test]
    fn create_rejects_zero_model_bits() {
        let err = create(0).unwrap_err();
        assert!(matches!(err, UpcallError::InvalidFlags));
    }

    #[test]
    fn create_rejects_multiple_model_bits() {
        let flags = upcall_core::flags::UPCALL_PCPU | upcall_core::flags::UPCALL_PCACHE;
        let err = create(flags).unwrap_err();
        assert!(matches!(err, UpcallError::InvalidFlags));
    }
}
