//! The perf event catalog, mapped to the `(perf_type, config)` pair
//! `raw::open` needs.

use super::raw::*;

pub const HARDWARE_EVENTS: &[&str] = &[
    "cpu_cycles",
    "instructions",
    "branch_instructions",
    "branch_misses",
    "cache_refs",
    "cache_misses",
    "ref_cpu_cycles",
];

pub const SOFTWARE_EVENTS: &[&str] = &[
    "page_faults",
    "context_switches",
    "cpu_migrations",
    "minor_faults",
    "major_faults",
];

pub const CACHE_EVENTS: &[&str] = &[
    "l1d_read_hit",
    "l1d_read_miss",
    "l1d_write_hit",
    "l1i_read_miss",
    "ll_read_hit",
    "ll_read_miss",
    "ll_write_hit",
    "ll_write_miss",
    "itlb_read_hit",
    "itlb_read_miss",
    "bpu_read_hit",
    "bpu_read_miss",
];

fn cache_config(id: u64, op: u64, result: u64) -> u64 {
    id | (op << 8) | (result << 16)
}

/// Looks up `name` in the catalog, returning the `(perf_type, config)`
/// `raw::open` takes. `None` for a name not in `HARDWARE_EVENTS` /
/// `SOFTWARE_EVENTS` / `CACHE_EVENTS`.
///
/// Cache event naming follows the kernel's `{id}_{op}_{result}` ABI: "hit"
/// maps to `PERF_COUNT_HW_CACHE_RESULT_ACCESS` (the kernel exposes total
/// accesses and misses, not a separate hit counter — accesses minus misses
/// is the hit count), "miss" to `RESULT_MISS`. The BPU only supports the
/// read op in the kernel ABI, matching the `bpu_read_*` names.
pub fn catalog_entry(name: &str) -> Option<(u32, u64)> {
    use PERF_COUNT_HW_CACHE_OP_READ as OP_READ;
    use PERF_COUNT_HW_CACHE_OP_WRITE as OP_WRITE;
    use PERF_COUNT_HW_CACHE_RESULT_ACCESS as HIT;
    use PERF_COUNT_HW_CACHE_RESULT_MISS as MISS;

    Some(match name {
        "cpu_cycles" => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES),
        "instructions" => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_INSTRUCTIONS),
        "branch_instructions" => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_INSTRUCTIONS),
        "branch_misses" => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_MISSES),
        "cache_refs" => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_REFERENCES),
        "cache_misses" => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_MISSES),
        "ref_cpu_cycles" => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_REF_CPU_CYCLES),

        "page_faults" => (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS),
        "context_switches" => (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CONTEXT_SWITCHES),
        "cpu_migrations" => (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CPU_MIGRATIONS),
        "minor_faults" => (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS_MIN),
        "major_faults" => (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS_MAJ),

        "l1d_read_hit" => (PERF_TYPE_HW_CACHE, cache_config(PERF_COUNT_HW_CACHE_L1D, OP_READ, HIT)),
        "l1d_read_miss" => (PERF_TYPE_HW_CACHE, cache_config(PERF_COUNT_HW_CACHE_L1D, OP_READ, MISS)),
        "l1d_write_hit" => (PERF_TYPE_HW_CACHE, cache_config(PERF_COUNT_HW_CACHE_L1D, OP_WRITE, HIT)),
        "l1i_read_miss" => (PERF_TYPE_HW_CACHE, cache_config(PERF_COUNT_HW_CACHE_L1I, OP_READ, MISS)),
        "ll_read_hit" => (PERF_TYPE_HW_CACHE, cache_config(PERF_COUNT_HW_CACHE_LL, OP_READ, HIT)),
        "ll_read_miss" => (PERF_TYPE_HW_CACHE, cache_config(PERF_COUNT_HW_CACHE_LL, OP_READ, MISS)),
        "ll_write_hit" => (PERF_TYPE_HW_CACHE, cache_config(PERF_COUNT_HW_CACHE_LL, OP_WRITE, HIT)),
        "ll_write_miss" => (PERF_TYPE_HW_CACHE, cache_config(PERF_COUNT_HW_CACHE_LL, OP_WRITE, MISS)),
        "itlb_read_hit" => (PERF_TYPE_HW_CACHE, cache_config(super::raw::PERF_COUNT_HW_CACHE_ITLB, OP_READ, HIT)),
        "itlb_read_miss" => (PERF_TYPE_HW_CACHE, cache_config(super::raw::PERF_COUNT_HW_CACHE_ITLB, OP_READ, MISS)),
        "bpu_read_hit" => (PERF_TYPE_HW_CACHE, cache_config(PERF_COUNT_HW_CACHE_BPU, OP_READ, HIT)),
        "bpu_read_miss" => (PERF_TYPE_HW_CACHE, cache_config(PERF_COUNT_HW_CACHE_BPU, OP_READ, MISS)),

        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_catalog_name_resolves() {
        for name in HARDWARE_EVENTS.iter().chain(SOFTWARE_EVENTS).chain(CACHE_EVENTS) {
            assert!(catalog_entry(name).is_some(), "{name} missing from catalog_entry");
        }
    }

    #[test]
    fn unknown_event_name_is_none() {
        assert!(catalog_entry("not_a_real_event").is_none());
    }

    #[test]
    fn cache_config_packs_id_op_result_into_distinct_bytes() {
        let (perf_type, config) = catalog_entry("l1d_read_miss").unwrap();
        assert_eq!(perf_type, PERF_TYPE_HW_CACHE);
        assert_eq!(config & 0xff, PERF_COUNT_HW_CACHE_L1D);
        assert_eq!((config >> 8) & 0xff, PERF_COUNT_HW_CACHE_OP_READ);
        assert_eq!((config >> 16) & 0xff, PERF_COUNT_HW_CACHE_RESULT_MISS);
    }
}
