//! Builds the `(unit -> processes)` mapping the rest of the collectors
//! consume, applying the filters spec'd in the data-model invariants: every
//! process in an active unit must satisfy the ignore-cmdline regex and, if
//! `target_env_vars` is non-empty, carry at least one of those variables.
//!
//! `CgroupManager::discover` already applies both filters while building
//! each `ComputeUnit`'s process list (filtering per-process as it reads
//! `/proc`, which is where the ignore regex and environ lookup live).
//! `Attribution` is the second pass over an already-discovered unit set: it
//! drops units that end up with zero surviving processes, and builds the
//! derived pid->unit index `PerfCollector`/`EbpfCollector`/`RdmaCollector`
//! all need.

use crate::models::ComputeUnit;
use std::collections::HashMap;

/// Drops units with no member processes left after per-process filtering.
/// An empty unit can't contribute any metric sample, and keeping it around
/// would make the unit-set invariant (unit set on the metrics endpoint
/// equals discovery output minus emptied units) false.
pub fn drop_empty_units(units: Vec<ComputeUnit>) -> Vec<ComputeUnit> {
    units.into_iter().filter(|u| !u.processes.is_empty()).collect()
}

/// Builds the reverse index `pid -> unit uuid` used by collectors that
/// iterate kernel resources keyed by pid (perf, RDMA) and need to know
/// which unit to credit.
pub fn pid_to_unit_index(units: &[ComputeUnit]) -> HashMap<u32, String> {
    let mut index = HashMap::new();
    for unit in units {
        for pid in unit.pids() {
            index.insert(pid, unit.uuid.clone());
        }
    }
    index
}

/// The full set of pids across all active units — the perf profiler's
/// required invariant is that its open-handle pid set equals this set at
/// the end of every scrape.
pub fn all_pids(units: &[ComputeUnit]) -> Vec<u32> {
    units.iter().flat_map(|u| u.pids()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Process;

    fn unit(id: &str, pids: &[u32]) -> ComputeUnit {
        ComputeUnit {
            id: id.into(),
            uuid: id.into(),
            processes: pids
                .iter()
                .map(|p| Process {
                    pid: *p,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn drops_empty_units() {
        let units = vec![unit("a", &[1, 2]), unit("b", &[])];
        let kept = drop_empty_units(units);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "a");
    }

    #[test]
    fn builds_pid_index() {
        let units = vec![unit("a", &[1, 2]), unit("b", &[3])];
        let index = pid_to_unit_index(&units);
        assert_eq!(index.get(&1), Some(&"a".to_string()));
        assert_eq!(index.get(&3), Some(&"b".to_string()));
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn collects_all_pids() {
        let units = vec![unit("a", &[1, 2]), unit("b", &[3])];
        let mut pids = all_pids(&units);
        pids.sort_unstable();
        assert_eq!(pids, vec![1, 2, 3]);
    }
}
