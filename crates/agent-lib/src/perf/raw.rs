//! Raw `perf_event_open(2)`/`ioctl(2)` bindings.
//!
//! No perf-specific crate exists in the available dependency set
//! (the closest retrieved reference shells out to bindgen-generated kernel
//! headers for a sampling profiler); counting-only events need a much
//! smaller surface, so this wraps the raw syscall directly over the
//! constants `libc` already exposes rather than pulling in a bindgen build
//! step for one struct.

use crate::error::{CollectError, Result};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_SOFTWARE: u32 = 1;
pub const PERF_TYPE_HW_CACHE: u32 = 3;

pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
pub const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
pub const PERF_COUNT_HW_CACHE_REFERENCES: u64 = 2;
pub const PERF_COUNT_HW_CACHE_MISSES: u64 = 3;
pub const PERF_COUNT_HW_BRANCH_INSTRUCTIONS: u64 = 4;
pub const PERF_COUNT_HW_BRANCH_MISSES: u64 = 5;
pub const PERF_COUNT_HW_REF_CPU_CYCLES: u64 = 9;

pub const PERF_COUNT_SW_CPU_CLOCK: u64 = 0;
pub const PERF_COUNT_SW_PAGE_FAULTS: u64 = 2;
pub const PERF_COUNT_SW_CONTEXT_SWITCHES: u64 = 3;
pub const PERF_COUNT_SW_CPU_MIGRATIONS: u64 = 4;
pub const PERF_COUNT_SW_PAGE_FAULTS_MIN: u64 = 5;
pub const PERF_COUNT_SW_PAGE_FAULTS_MAJ: u64 = 6;

pub const PERF_COUNT_HW_CACHE_L1D: u64 = 0;
pub const PERF_COUNT_HW_CACHE_L1I: u64 = 1;
pub const PERF_COUNT_HW_CACHE_LL: u64 = 2;
pub const PERF_COUNT_HW_CACHE_ITLB: u64 = 4;
pub const PERF_COUNT_HW_CACHE_BPU: u64 = 5;

pub const PERF_COUNT_HW_CACHE_OP_READ: u64 = 0;
pub const PERF_COUNT_HW_CACHE_OP_WRITE: u64 = 1;

pub const PERF_COUNT_HW_CACHE_RESULT_ACCESS: u64 = 0;
pub const PERF_COUNT_HW_CACHE_RESULT_MISS: u64 = 1;

const PERF_FORMAT_TOTAL_TIME_ENABLED: u64 = 1 << 0;
const PERF_FORMAT_TOTAL_TIME_RUNNING: u64 = 1 << 1;

const PERF_FLAG_DISABLED: u64 = 1 << 0;
const PERF_FLAG_EXCLUDE_KERNEL: u64 = 1 << 5;
const PERF_FLAG_EXCLUDE_HV: u64 = 1 << 6;

const PERF_EVENT_IOC_MAGIC: u8 = b'$';

// `_IO('$', 0)` / `_IO('$', 1)` / `_IO('$', 2)` per linux/perf_event.h.
fn ioc(nr: u8) -> libc::c_ulong {
    ((PERF_EVENT_IOC_MAGIC as libc::c_ulong) << 8) | nr as libc::c_ulong
}

/// The kernel ABI struct passed to `perf_event_open(2)`. Only the fields a
/// counting (non-sampling) event needs are given real names; the rest are
/// present only to keep `size_of` matching what the kernel expects for
/// this struct generation and are always zeroed.
#[repr(C)]
#[derive(Default)]
struct PerfEventAttr {
    type_: u32,
    size: u32,
    config: u64,
    sample_period_or_freq: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events_or_watermark: u32,
    bp_type: u32,
    config1_or_bp_addr: u64,
    config2_or_bp_len: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    reserved_2: u16,
}

/// Opens one counting perf event for `pid`, scoped to all CPUs (`cpu =
/// -1`), ungrouped (`group_fd = -1`), initially disabled so the caller can
/// reset+enable it atomically right after.
pub fn open(perf_type: u32, config: u64, pid: i32) -> io::Result<OwnedFd> {
    let attr = PerfEventAttr {
        type_: perf_type,
        size: std::mem::size_of::<PerfEventAttr>() as u32,
        config,
        read_format: PERF_FORMAT_TOTAL_TIME_ENABLED | PERF_FORMAT_TOTAL_TIME_RUNNING,
        flags: PERF_FLAG_DISABLED | PERF_FLAG_EXCLUDE_KERNEL | PERF_FLAG_EXCLUDE_HV,
        ..Default::default()
    };

    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            &attr as *const PerfEventAttr,
            pid as libc::pid_t,
            -1 as libc::c_int,
            -1 as libc::c_int,
            0 as libc::c_ulong,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd as i32) };

    unsafe {
        libc::ioctl(fd.as_raw_fd(), ioc(3)); // PERF_EVENT_IOC_RESET
        libc::ioctl(fd.as_raw_fd(), ioc(0)); // PERF_EVENT_IOC_ENABLE
    }

    Ok(fd)
}

/// Reads the current `{value, time_enabled, time_running}` triple. The
/// kernel always returns all 24 bytes for a `read_format` carrying both
/// `TOTAL_TIME_ENABLED` and `TOTAL_TIME_RUNNING`, in one atomic `read(2)`.
pub fn read_sample(fd: &OwnedFd) -> io::Result<crate::models::CounterSample> {
    let mut buf = [0u8; 24];
    let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    if (n as usize) < buf.len() {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short perf_event read"));
    }
    Ok(crate::models::CounterSample {
        value: u64::from_ne_bytes(buf[0..8].try_into().unwrap()),
        time_enabled: u64::from_ne_bytes(buf[8..16].try_into().unwrap()),
        time_running: u64::from_ne_bytes(buf[16..24].try_into().unwrap()),
    })
}

fn paranoid_level() -> io::Result<i32> {
    let content = std::fs::read_to_string("/proc/sys/kernel/perf_event_paranoid")?;
    content
        .trim()
        .parse::<i32>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Spec §4.3: a runtime check requires `perf_event_paranoid <= 2`,
/// otherwise initialization fails with a clear diagnostic. Fatal at
/// startup, not per-scrape.
pub fn check_paranoid() -> Result<()> {
    match paranoid_level() {
        Ok(level) if level <= 2 => Ok(()),
        Ok(level) => Err(CollectError::KernelCapability(format!(
            "kernel.perf_event_paranoid={level} exceeds the <=2 required for perf collection"
        ))),
        Err(e) => Err(CollectError::KernelCapability(format!(
            "could not read kernel.perf_event_paranoid: {e}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_struct_size_is_stable() {
        // perf_event_open(2) validates `attr.size` against its own kernel
        // struct generation; a regression here would silently corrupt the
        // ABI call rather than fail loudly.
        assert_eq!(std::mem::size_of::<PerfEventAttr>(), 112);
    }

    #[test]
    fn ioc_numbers_match_linux_perf_event_h() {
        assert_eq!(ioc(0), 0x2400); // PERF_EVENT_IOC_ENABLE
        assert_eq!(ioc(1), 0x2401); // PERF_EVENT_IOC_DISABLE
        assert_eq!(ioc(3), 0x2403); // PERF_EVENT_IOC_RESET
    }
}
