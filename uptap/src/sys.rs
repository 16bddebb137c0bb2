// Copyright 2026 Authors of uptap
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The `perf_event_open(2)` ABI subset the uprobe backend needs, plus the
//! per-architecture mapping from call argument slots to sampled registers.

/// `struct perf_event_attr`, `PERF_ATTR_SIZE_VER8` layout. The kernel
/// accepts shorter/older sizes, so carrying the v8 tail is safe everywhere.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PerfEventAttr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
    pub aux_sample_size: u32,
    pub __reserved_3: u32,
    pub sig_data: u64,
    pub config3: u64,
}

/// `struct perf_event_header`, the first 8 bytes of every ring record.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PerfEventHeader {
    pub type_: u32,
    pub misc: u16,
    pub size: u16,
}

/// The metadata page at offset 0 of the ring mmap. Only the head/tail
/// cursors are touched; the reserved block pads them to their fixed kernel
/// offsets (`data_head` at 1024).
#[repr(C)]
pub struct PerfEventMmapPage {
    pub version: u32,
    pub compat_version: u32,
    pub lock: u32,
    pub index: u32,
    pub offset: i64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub capabilities: u64,
    pub pmc_width: u16,
    pub time_shift: u16,
    pub time_mult: u32,
    pub time_offset: u64,
    pub time_zero: u64,
    pub size: u32,
    pub __reserved_1: u32,
    pub time_cycles: u64,
    pub time_mask: u64,
    pub __reserved: [u8; 928],
    pub data_head: u64,
    pub data_tail: u64,
    pub data_offset: u64,
    pub data_size: u64,
}

pub const ATTR_FLAG_DISABLED: u64 = 1 << 0;
pub const ATTR_FLAG_EXCLUDE_KERNEL: u64 = 1 << 5;
pub const ATTR_FLAG_EXCLUDE_HV: u64 = 1 << 6;

pub const PERF_SAMPLE_TID: u64 = 1 << 1;
pub const PERF_SAMPLE_REGS_USER: u64 = 1 << 12;
pub const PERF_SAMPLE_REGS_ABI_NONE: u64 = 0;

pub const PERF_RECORD_LOST: u32 = 2;
pub const PERF_RECORD_SAMPLE: u32 = 9;

pub const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;
pub const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
pub const PERF_EVENT_IOC_DISABLE: libc::c_ulong = 0x2401;

/// Perf register indices (`perf_event_x86_regs`) for the six integer
/// argument registers, in call order: rdi, rsi, rdx, rcx, r8, r9.
#[cfg(target_arch = "x86_64")]
pub const ARG_REGS: [u32; 6] = [5, 4, 3, 2, 16, 17];

/// Perf register indices for aarch64 argument registers x0..x5.
#[cfg(target_arch = "aarch64")]
pub const ARG_REGS: [u32; 6] = [0, 1, 2, 3, 4, 5];

/// The `sample_regs_user` mask selecting the argument registers.
pub fn arg_reg_mask() -> u64 {
    ARG_REGS.iter().fold(0u64, |mask, reg| mask | (1 << reg))
}

/// How many `u64` values a sample carries for [`arg_reg_mask`].
pub fn arg_reg_count() -> usize {
    arg_reg_mask().count_ones() as usize
}

/// Position of each argument slot inside the sampled register array.
///
/// The kernel stores sampled registers in register-index order, not mask
/// order, so slot `n` lives at the count of mask bits below its register
/// index. `arg_positions()[0]` is the first call argument.
pub fn arg_positions() -> [usize; 6] {
    let mask = arg_reg_mask();
    let mut positions = [0usize; 6];
    for (slot, &reg) in ARG_REGS.iter().enumerate() {
        positions[slot] = (mask & ((1u64 << reg) - 1)).count_ones() as usize;
    }
    positions
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoffset::offset_of;
    use std::mem;

    #[test]
    fn attr_is_ver8_sized() {
        assert_eq!(mem::size_of::<PerfEventAttr>(), 136);
    }

    #[test]
    fn header_is_eight_bytes() {
        assert_eq!(mem::size_of::<PerfEventHeader>(), 8);
    }

    #[test]
    fn mmap_page_cursors_sit_at_kernel_offsets() {
        assert_eq!(offset_of!(PerfEventMmapPage, data_head), 1024);
        assert_eq!(offset_of!(PerfEventMmapPage, data_tail), 1032);
        assert_eq!(offset_of!(PerfEventMmapPage, data_offset), 1040);
        assert_eq!(offset_of!(PerfEventMmapPage, data_size), 1048);
    }

    #[test]
    fn positions_cover_all_slots_once() {
        let positions = arg_positions();
        let count = arg_reg_count();
        assert_eq!(count, 6);
        for (i, &a) in positions.iter().enumerate() {
            assert!(a < count);
            for &b in positions.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn x86_64_argument_order() {
        // Mask-sorted register order is cx, dx, si, di, r8, r9; the first
        // call argument (di) therefore sits at index 3.
        assert_eq!(arg_positions(), [3, 2, 1, 0, 4, 5]);
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn aarch64_argument_order() {
        assert_eq!(arg_positions(), [0, 1, 2, 3, 4, 5]);
    }
}
