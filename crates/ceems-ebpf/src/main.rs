#![no_std]
#![no_main]

//! Cgroup-scoped I/O and network accounting.
//!
//! Two kretprobes on `vfs_read`/`vfs_write` turn the syscall's return value
//! (bytes transferred, or a negative errno dropped via `try_into`) into a
//! per-cgroup byte/op count; two `cgroup_skb` programs do the same for
//! ingress/egress packets. Every map is keyed by the calling task's cgroup
//! inode id so userspace can join on `stat(2)` of the cgroup path with no
//! separate id handshake.

use aya_ebpf::{
    helpers::{bpf_get_current_cgroup_id, gen::bpf_skb_cgroup_id},
    macros::{cgroup_skb, kretprobe, map},
    maps::HashMap,
    programs::{ProbeContext, SkBuffContext},
};
use ceems_ebpf_common::{IoCounters, NetCounters};

#[map]
static IO_COUNTERS: HashMap<u64, IoCounters> = HashMap::with_max_entries(4096, 0);

#[map]
static NET_COUNTERS: HashMap<u64, NetCounters> = HashMap::with_max_entries(4096, 0);

#[kretprobe]
pub fn vfs_read_exit(ctx: ProbeContext) -> u32 {
    record_io(&ctx, true)
}

#[kretprobe]
pub fn vfs_write_exit(ctx: ProbeContext) -> u32 {
    record_io(&ctx, false)
}

fn record_io(ctx: &ProbeContext, is_read: bool) -> u32 {
    let ret: i64 = ctx.ret().unwrap_or(0);
    if ret <= 0 {
        return 0;
    }
    let bytes = ret as u64;
    let cgroup_id = unsafe { bpf_get_current_cgroup_id() };

    unsafe {
        match IO_COUNTERS.get_ptr_mut(&cgroup_id) {
            Some(counters) => {
                let counters = &mut *counters;
                if is_read {
                    counters.read_bytes += bytes;
                    counters.read_ops += 1;
                } else {
                    counters.write_bytes += bytes;
                    counters.write_ops += 1;
                }
            }
            None => {
                let mut counters = IoCounters::default();
                if is_read {
                    counters.read_bytes = bytes;
                    counters.read_ops = 1;
                } else {
                    counters.write_bytes = bytes;
                    counters.write_ops = 1;
                }
                let _ = IO_COUNTERS.insert(&cgroup_id, &counters, 0);
            }
        }
    }

    0
}

#[cgroup_skb(name = "ceems_egress")]
pub fn ceems_egress(ctx: SkBuffContext) -> i32 {
    record_net(&ctx, false);
    1 // allow the packet through; this program only observes
}

#[cgroup_skb(name = "ceems_ingress")]
pub fn ceems_ingress(ctx: SkBuffContext) -> i32 {
    record_net(&ctx, true);
    1
}

fn record_net(ctx: &SkBuffContext, is_rx: bool) {
    let skb = ctx.as_ptr();
    let cgroup_id = unsafe { bpf_skb_cgroup_id(skb as *mut _) };
    let bytes = ctx.len() as u64;

    unsafe {
        match NET_COUNTERS.get_ptr_mut(&cgroup_id) {
            Some(counters) => {
                let counters = &mut *counters;
                if is_rx {
                    counters.rx_bytes += bytes;
                    counters.rx_packets += 1;
                } else {
                    counters.tx_bytes += bytes;
                    counters.tx_packets += 1;
                }
            }
            None => {
                let mut counters = NetCounters::default();
                if is_rx {
                    counters.rx_bytes = bytes;
                    counters.rx_packets = 1;
                } else {
                    counters.tx_bytes = bytes;
                    counters.tx_packets = 1;
                }
                let _ = NET_COUNTERS.insert(&cgroup_id, &counters, 0);
            }
        }
    }
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
