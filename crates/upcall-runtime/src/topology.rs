//! CPU topology resolver — builds one affinity set per queue.
//!
//! Mirrors `parse_clusters()` in `libupcall/upcall.c`. The three
//! concurrency models (spec.md §4.3) differ only in how the affinity sets
//! are constructed, not in how workers are spawned or dispatched — modeled
//! here as three functions returning the same `Vec<CpuSet>` shape rather
//! than as a trait hierarchy (spec.md §9: "a small strategy selector, not
//! subclassing").

use nix::sched::CpuSet;
use upcall_core::error::{Result, UpcallError};
use upcall_core::flags::ConcurrencyModel;

/// Build one [`CpuSet`] per queue for the given model.
///
/// `num_cpus` is the number of online CPUs (`0..num_cpus`, matching the
/// indexing `libupcall` assumes). `queue_count` is what the kernel reported
/// via `ioctl(UPIOGQCNT)` — for PCACHE this must equal the number of
/// clusters discovered, or resolution fails per spec.md §4.3.
pub fn resolve(model: ConcurrencyModel, num_cpus: usize, queue_count: usize) -> Result<Vec<CpuSet>> {
    match model {
        ConcurrencyModel::PerCpu => Ok(per_cpu_sets(num_cpus)),
        ConcurrencyModel::Single => Ok(vec![single_set(num_cpus)]),
        ConcurrencyModel::PerCacheCluster => per_cache_sets(num_cpus, queue_count),
    }
}

/// PCPU: queue *i* pinned to CPU *i*, one queue per online CPU.
fn per_cpu_sets(num_cpus: usize) -> Vec<CpuSet> {
    (0..num_cpus)
        .map(|cpu| {
            let mut set = CpuSet::new();
            set.set(cpu).expect("cpu index within CpuSet capacity");
            set
        })
        .collect()
}

/// SINGLE: one affinity set covering every online CPU.
fn single_set(num_cpus: usize) -> CpuSet {
    let mut set = CpuSet::new();
    for cpu in 0..num_cpus {
        set.set(cpu).expect("cpu index within CpuSet capacity");
    }
    set
}

/// PCACHE: group CPUs by last-level-cache cluster.
///
/// Reads each CPU's `cluster_cpus_list` from sysfs (first entry on the line
/// is the cluster's lead CPU). Tie-break per spec.md §4.3: the first CPU
/// encountered in a cluster becomes its lead; later CPUs whose own list
/// begins with that lead join the same set.
fn per_cache_sets(num_cpus: usize, queue_count: usize) -> Result<Vec<CpuSet>> {
    let mut lead_of: Vec<Option<usize>> = Vec::new(); // cluster index -> lead cpu
    let mut sets: Vec<CpuSet> = Vec::new();

    for cpu in 0..num_cpus {
        let lead = cluster_lead(cpu)?;

        if lead == cpu {
            // This CPU is itself a cluster lead — start a new cluster.
            if sets.len() >= queue_count.max(1) && queue_count != 0 {
                return Err(UpcallError::TopologyMismatch {
                    clusters: sets.len() + 1,
                    queues: queue_count,
                });
            }
            let mut set = CpuSet::new();
            set.set(cpu).expect("cpu index within CpuSet capacity");
            sets.push(set);
            lead_of.push(Some(lead));
        } else {
            let cluster_idx = lead_of
                .iter()
                .position(|l| *l == Some(lead))
                .ok_or(UpcallError::TopologyMismatch {
                    clusters: sets.len(),
                    queues: queue_count,
                })?;
            sets[cluster_idx]
                .set(cpu)
                .expect("cpu index within CpuSet capacity");
        }
    }

    if queue_count != 0 && sets.len() != queue_count {
        return Err(UpcallError::TopologyMismatch {
            clusters: sets.len(),
            queues: queue_count,
        });
    }

    Ok(sets)
}

/// Read `/sys/devices/system/cpu/cpu<N>/topology/cluster_cpus_list` and
/// return the first (lowest) CPU number in it — the cluster's lead.
fn cluster_lead(cpu: usize) -> Result<usize> {
    let path = format!(
        "/sys/devices/system/cpu/cpu{}/topology/cluster_cpus_list",
        cpu
    );
    let contents = std::fs::read_to_string(&path).map_err(UpcallError::from)?;
    first_cpu_in_list(&contents).ok_or(UpcallError::TopologyMismatch {
        clusters: 0,
        queues: 0,
    })
}

/// Parse the lowest CPU number out of a `cluster_cpus_list`-style string:
/// comma-separated CPU numbers and ranges, e.g. `"0-3"` or `"0,2,4"`.
fn first_cpu_in_list(s: &str) -> Option<usize> {
    let first_token = s.trim().split(',').next()?;
    let first_num = first_token.split('-').next()?;
    first_num.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_number() {
        assert_eq!(first_cpu_in_list("0\n"), Some(0));
    }

    #[test]
    fn parses_range() {
        assert_eq!(first_cpu_in_list("0-3\n"), Some(0));
    }

    #[test]
    fn parses_comma_list() {
        assert_eq!(first_cpu_in_list("2,4,6\n"), Some(2));
    }

    #[test]
    fn per_cpu_model_has_one_set_per_cpu() {
        let sets = per_cpu_sets(4);
        assert_eq!(sets.len(), 4);
        for (i, set) in sets.iter().enumerate() {
            assert!(set.is_set(i).unwrap());
            for j in 0..4 {
                if j != i {
                    assert!(!set.is_set(j).unwrap());
                }
            }
        }
    }

    #[test]
    fn single_model_covers_all_cpus() {
        let set = single_set(4);
        for cpu in 0..4 {
            assert!(set.is_set(cpu).unwrap());
        }
    }
}
