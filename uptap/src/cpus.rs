// Copyright 2026 Authors of uptap
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fs;
use std::io;

const SYS_CPU_ONLINE: &str = "/sys/devices/system/cpu/online";

pub type CpuId = i32;

/// Returns the online CPU IDs. System-wide probes open one perf event per
/// online CPU.
pub fn get_online() -> io::Result<Vec<CpuId>> {
    let cpus = fs::read_to_string(SYS_CPU_ONLINE)?;
    list_from_string(cpus.trim())
}

/// Parses the kernel's cpu list format: comma-separated single IDs or
/// `start-end` ranges, e.g. `0-2,5-6`.
fn list_from_string(cpus: &str) -> io::Result<Vec<CpuId>> {
    let mut list = Vec::new();
    for group in cpus.split(',') {
        let mut split = group.split('-');
        let start = parse_id(split.next())?;
        let end = match split.next() {
            Some(end) => parse_id(Some(end))?,
            None => start,
        };
        list.extend(start..=end);
    }
    Ok(list)
}

fn parse_id(id: Option<&str>) -> io::Result<CpuId> {
    id.and_then(|id| id.parse::<CpuId>().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed cpu list"))
}
