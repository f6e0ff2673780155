//! Flag and opcode constants for `upcall_create` and the legacy `ctl` path.
//!
//! Mirrors the `#define`s in `upcall.h` bit for bit.

/// One queue per online CPU.
pub const UPCALL_PCPU: u32 = 0x0001_0000;
/// One queue per last-level-cache cluster.
pub const UPCALL_PCACHE: u32 = 0x0002_0000;
/// A single global queue.
pub const UPCALL_SINGLE: u32 = 0x0004_0000;

/// Mask covering the three mutually-exclusive concurrency-model bits.
pub const UPCALL_MODEL_MASK: u32 = UPCALL_PCPU | UPCALL_PCACHE | UPCALL_SINGLE;

/// `O_CLOEXEC`, reused as the upcall fd's close-on-exec bit.
pub const O_CLOEXEC: u32 = libc_cloexec();

const fn libc_cloexec() -> u32 {
    // 0o2000000 on Linux/x86_64 — avoid a libc dependency in this zero-dep crate.
    0o2_000_000
}

/// Bits `upcall_create` accepts; anything else is rejected.
pub const UPCALL_MASK: u32 = O_CLOEXEC | UPCALL_MODEL_MASK;

/// `ioctl(UPIOGQCNT)` — writes a 64-bit queue count at the caller's pointer.
pub const UPIOGQCNT: u32 = 0x0000_0001;
/// `ioctl(UPIOSTSK)` (legacy) — registers the caller as a dispatch context.
pub const UPWRKINIT: u32 = 0x0000_0002;

/// Concurrency model selector — the one axis of variability in the worker
/// fabric (spec.md §9: "model as a small strategy selector, not subclassing").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyModel {
    /// One queue (and worker set) per online CPU.
    PerCpu,
    /// One queue per last-level-cache cluster.
    PerCacheCluster,
    /// A single queue shared by every CPU.
    Single,
}

impl ConcurrencyModel {
    /// The `upcall_create` flag bit this model sets.
    pub const fn flag_bit(self) -> u32 {
        match self {
            Self::PerCpu => UPCALL_PCPU,
            Self::PerCacheCluster => UPCALL_PCACHE,
            Self::Single => UPCALL_SINGLE,
        }
    }
}

/// Legacy `ctl` actions: bind or unbind a `{work_fn, arg}` pair to an
/// `(fd, event-mask)` tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CtlAction {
    Add = 1,
    Del = 2,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_bits_are_disjoint() {
        assert_eq!(UPCALL_PCPU & UPCALL_PCACHE, 0);
        assert_eq!(UPCALL_PCPU & UPCALL_SINGLE, 0);
        assert_eq!(UPCALL_PCACHE & UPCALL_SINGLE, 0);
    }

    #[test]
    fn mask_covers_model_bits() {
        assert_eq!(UPCALL_MASK & UPCALL_MODEL_MASK, UPCALL_MODEL_MASK);
    }
}
