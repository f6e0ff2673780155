//! upcall error types.

use std::fmt;

#[derive(Debug)]
pub enum UpcallError {
    /// A syscall or ioctl failed; the positive errno value.
    Os(i32),
    /// `upcall_create` was called with bits outside `UPCALL_MASK`, or with
    /// zero or more than one concurrency-model bit set.
    InvalidFlags,
    /// The topology resolver found a different number of CPU clusters than
    /// the kernel reports queues for PCACHE mode. Fatal — queues and
    /// affinity sets must correspond one-to-one.
    TopologyMismatch { clusters: usize, queues: usize },
    /// A worker thread failed to spawn or pin during `init_event_handler`.
    SpawnFailed(std::io::Error),
    /// The runtime was used before `init_event_handler`/`upcall_create`
    /// completed successfully.
    NotInitialized,
}

impl fmt::Display for UpcallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Os(e) => write!(f, "upcall syscall failed: errno {}", e),
            Self::InvalidFlags => write!(f, "invalid upcall_create flags"),
            Self::TopologyMismatch { clusters, queues } => write!(
                f,
                "topology mismatch: resolver found {} cluster(s), kernel reports {} queue(s)",
                clusters, queues
            ),
            Self::SpawnFailed(e) => write!(f, "worker thread spawn failed: {}", e),
            Self::NotInitialized => write!(f, "upcall runtime not initialized"),
        }
    }
}

impl std::error::Error for UpcallError {}

impl From<std::io::Error> for UpcallError {
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(errno) => Self::Os(errno),
            None => Self::SpawnFailed(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, UpcallError>;
