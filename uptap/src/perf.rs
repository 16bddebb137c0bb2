// Copyright 2026 Authors of uptap
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! # The kernel uprobe backend
//!
//! Each attached descriptor becomes one `perf_event_open(2)` uprobe event
//! per online CPU (or a single event when scoped to one pid), configured to
//! sample the userspace argument registers on every hit. A reader task per
//! event drains the perf mmap ring on fd readiness and feeds the probe's
//! [`EventSink`]; pointer rules are satisfied with `process_vm_readv(2)`
//! against the sampled pid.
//!
//! No code runs inside the probed process and nothing is injected into the
//! kernel; the tap is sampling-only.
use std::cell::RefCell;
use std::ffi::CString;
use std::fs;
use std::io::{self, Cursor};
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::pin::Pin;
use std::ptr::null_mut;
use std::slice;
use std::sync::atomic::{self, AtomicPtr, Ordering};
use std::task::{Context, Poll};

use byteorder::{NativeEndian, ReadBytesExt};
use futures::prelude::*;
use libc::{
    c_void, close, ioctl, iovec, mmap, munmap, pid_t, process_vm_readv, syscall, sysconf,
    SYS_perf_event_open, MAP_FAILED, MAP_SHARED, PROT_READ, PROT_WRITE, _SC_PAGESIZE,
};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cpus::{self, CpuId};
use crate::descriptor::ProbeDescriptor;
use crate::engine::{EventSink, Hit, Tracer};
use crate::error::{Error, Result};
use crate::symbols;
use crate::sys::*;

const UPROBE_TYPE_FILE: &str = "/sys/bus/event_source/devices/uprobe/type";

/// Ring pages per perf event. Must be a power of two.
const DEFAULT_PAGE_COUNT: usize = 16;

/// Probe backend armed through the kernel's uprobe facility.
///
/// `attach` spawns reader tasks, so engines using this tracer must attach
/// from within a tokio runtime.
pub struct UprobeTracer {
    pid: Option<pid_t>,
    page_cnt: usize,
}

impl UprobeTracer {
    /// A tracer observing the whole system, or a single process when `pid`
    /// is given. System-wide tracing opens one perf event per online CPU.
    pub fn new(pid: Option<pid_t>) -> UprobeTracer {
        UprobeTracer {
            pid,
            page_cnt: DEFAULT_PAGE_COUNT,
        }
    }

    /// Same, with a custom ring size in pages (power of two).
    pub fn with_page_count(pid: Option<pid_t>, page_cnt: usize) -> UprobeTracer {
        UprobeTracer { pid, page_cnt }
    }

    fn arm(
        &self,
        library: &Path,
        offset: u64,
        pid: pid_t,
        cpu: CpuId,
        probe: &str,
        sink: EventSink,
    ) -> Result<(RawFd, JoinHandle<()>)> {
        let fd = RingFd(unsafe { open_uprobe_perf_event(library, offset, pid, cpu)? });
        let raw_fd = fd.as_raw_fd();
        let stream = SampleStream::new(fd, self.page_cnt).map_err(Error::IO)?;
        stream.enable().map_err(Error::IO)?;
        let pump = tokio::spawn(pump_samples(stream, sink, probe.to_string()));
        Ok((raw_fd, pump))
    }
}

/// One armed uprobe: its perf event fds and the reader task per fd. The
/// reader tasks own the fds; the raw copies here are only used to disable
/// the events on detach, while the tasks are still alive.
pub struct UprobeProbe {
    name: String,
    fds: Vec<RawFd>,
    pumps: Vec<JoinHandle<()>>,
}

impl Tracer for UprobeTracer {
    type Probe = UprobeProbe;

    fn attach(&mut self, descriptor: &ProbeDescriptor, sink: EventSink) -> Result<UprobeProbe> {
        let library = symbols::resolve_library(descriptor.target(), self.pid)?;
        let offset = symbols::resolve_symbol_offset(&library, descriptor.symbol())?;
        let name = format!("{}@{}", descriptor.symbol(), library.display());

        let targets: Vec<(pid_t, CpuId)> = match self.pid {
            Some(pid) => vec![(pid, -1)],
            None => cpus::get_online()?
                .into_iter()
                .map(|cpu| (-1, cpu))
                .collect(),
        };

        let mut probe = UprobeProbe {
            name: name.clone(),
            fds: Vec::new(),
            pumps: Vec::new(),
        };
        for (pid, cpu) in targets {
            match self.arm(&library, offset, pid, cpu, &name, sink.clone()) {
                Ok((fd, pump)) => {
                    probe.fds.push(fd);
                    probe.pumps.push(pump);
                }
                Err(e) => {
                    let _ = self.detach(&mut probe);
                    return Err(e);
                }
            }
        }
        debug!("attached {} across {} perf event(s)", name, probe.fds.len());
        Ok(probe)
    }

    fn detach(&mut self, probe: &mut UprobeProbe) -> Result<()> {
        // Disable every event while the reader tasks still hold the fds
        // open, then cancel the readers; their drop unmaps the rings and
        // closes the fds.
        let mut first_err = None;
        for &fd in &probe.fds {
            if unsafe { ioctl(fd, PERF_EVENT_IOC_DISABLE, 0) } != 0 && first_err.is_none() {
                first_err = Some(Error::IO(io::Error::last_os_error()));
            }
        }
        probe.fds.clear();
        for pump in probe.pumps.drain(..) {
            pump.abort();
        }
        debug!("detached {}", probe.name);
        first_err.map_or(Ok(()), Err)
    }
}

fn uprobe_event_type() -> Result<u32> {
    let text = fs::read_to_string(UPROBE_TYPE_FILE)?;
    text.trim().parse::<u32>().map_err(|_| {
        Error::IO(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("malformed {}", UPROBE_TYPE_FILE),
        ))
    })
}

unsafe fn open_uprobe_perf_event(
    library: &Path,
    offset: u64,
    pid: pid_t,
    cpu: CpuId,
) -> Result<RawFd> {
    let type_ = uprobe_event_type()?;
    let path = CString::new(library.as_os_str().as_bytes())?;
    let attr = PerfEventAttr {
        type_,
        size: mem::size_of::<PerfEventAttr>() as u32,
        sample_period: 1,
        sample_type: PERF_SAMPLE_TID | PERF_SAMPLE_REGS_USER,
        flags: ATTR_FLAG_DISABLED | ATTR_FLAG_EXCLUDE_KERNEL | ATTR_FLAG_EXCLUDE_HV,
        wakeup_events: 1,
        config1: path.as_ptr() as u64,
        config2: offset,
        sample_regs_user: arg_reg_mask(),
        ..Default::default()
    };

    let pfd = syscall(
        SYS_perf_event_open,
        &attr as *const PerfEventAttr,
        pid,
        cpu,
        -1, // group_fd
        PERF_FLAG_FD_CLOEXEC,
    );
    if pfd < 0 {
        Err(Error::IO(io::Error::last_os_error()))
    } else {
        Ok(pfd as RawFd)
    }
}

/// Owns the perf event fd.
struct RingFd(RawFd);

impl AsRawFd for RingFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for RingFd {
    fn drop(&mut self) {
        unsafe {
            close(self.0);
        }
    }
}

struct SampleRecord {
    pid: u32,
    regs: Vec<u64>,
}

enum RingRecord {
    Sample(SampleRecord),
    Lost(u64),
    // Consumed but not interesting (unknown type, or malformed).
    Skip,
}

#[derive(Default)]
struct Batch {
    samples: Vec<SampleRecord>,
    lost: u64,
}

/// The mmap'd ring of one perf event: a metadata page followed by
/// `page_cnt` data pages. Reading copies each record out (it may wrap the
/// ring edge), advances `data_tail`, and parses it.
struct PerfRing {
    base_ptr: AtomicPtr<PerfEventMmapPage>,
    page_size: usize,
    data_size: usize,
    mmap_size: usize,
    scratch: RefCell<Vec<u8>>,
    reg_count: usize,
}

impl PerfRing {
    fn new(fd: RawFd, page_cnt: usize) -> io::Result<PerfRing> {
        unsafe {
            let page_size = sysconf(_SC_PAGESIZE) as usize;
            let mmap_size = page_size * (page_cnt + 1);
            let base_ptr = mmap(
                null_mut(),
                mmap_size,
                PROT_READ | PROT_WRITE,
                MAP_SHARED,
                fd,
                0,
            );
            if base_ptr == MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            Ok(PerfRing {
                base_ptr: AtomicPtr::new(base_ptr as *mut PerfEventMmapPage),
                page_size,
                data_size: page_cnt * page_size,
                mmap_size,
                scratch: RefCell::new(Vec::new()),
                reg_count: arg_reg_count(),
            })
        }
    }

    fn read(&self) -> Option<RingRecord> {
        unsafe {
            let header = self.base_ptr.load(Ordering::SeqCst);
            let data_head = std::ptr::read_volatile(&(*header).data_head);
            let data_tail = (*header).data_tail;
            if data_tail == data_head {
                return None;
            }
            atomic::fence(Ordering::Acquire);

            let raw_size = self.data_size as u64;
            let base = (header as *const u8).add(self.page_size);
            let start = (data_tail % raw_size) as usize;
            let event = base.add(start) as *const PerfEventHeader;
            let type_ = (*event).type_;
            let size = (*event).size as usize;
            if size < mem::size_of::<PerfEventHeader>() {
                return None;
            }
            let end = ((data_tail + size as u64) % raw_size) as usize;

            let mut scratch = self.scratch.borrow_mut();
            scratch.clear();
            if end < start {
                let len = self.data_size - start;
                scratch.extend_from_slice(slice::from_raw_parts(base.add(start), len));
                scratch.extend_from_slice(slice::from_raw_parts(base, size - len));
            } else {
                scratch.extend_from_slice(slice::from_raw_parts(base.add(start), size));
            }

            atomic::fence(Ordering::SeqCst);
            std::ptr::write_volatile(&mut (*header).data_tail, data_tail + size as u64);

            Some(parse_record(type_, &scratch, self.reg_count))
        }
    }

    fn read_batch(&self) -> Batch {
        let mut batch = Batch::default();
        while let Some(record) = self.read() {
            match record {
                RingRecord::Sample(sample) => batch.samples.push(sample),
                RingRecord::Lost(count) => batch.lost += count,
                RingRecord::Skip => {}
            }
        }
        batch
    }
}

impl Drop for PerfRing {
    fn drop(&mut self) {
        unsafe {
            munmap(
                self.base_ptr.load(Ordering::SeqCst) as *mut c_void,
                self.mmap_size,
            );
        }
    }
}

fn parse_record(type_: u32, bytes: &[u8], reg_count: usize) -> RingRecord {
    if bytes.len() < mem::size_of::<PerfEventHeader>() {
        return RingRecord::Skip;
    }
    let body = &bytes[mem::size_of::<PerfEventHeader>()..];
    match type_ {
        PERF_RECORD_SAMPLE => match parse_sample(body, reg_count) {
            Ok(sample) => RingRecord::Sample(sample),
            Err(_) => RingRecord::Skip,
        },
        PERF_RECORD_LOST => match parse_lost(body) {
            Ok(count) => RingRecord::Lost(count),
            Err(_) => RingRecord::Skip,
        },
        _ => RingRecord::Skip,
    }
}

/// Sample layout for `PERF_SAMPLE_TID | PERF_SAMPLE_REGS_USER`: pid, tid,
/// the register ABI word, then one u64 per set mask bit. An ABI of NONE
/// means the hit had no user register state; the sample is kept with empty
/// registers and skipped at capture time.
fn parse_sample(body: &[u8], reg_count: usize) -> io::Result<SampleRecord> {
    let mut cursor = Cursor::new(body);
    let pid = cursor.read_u32::<NativeEndian>()?;
    let _tid = cursor.read_u32::<NativeEndian>()?;
    let abi = cursor.read_u64::<NativeEndian>()?;
    let mut regs = Vec::new();
    if abi != PERF_SAMPLE_REGS_ABI_NONE {
        regs.reserve_exact(reg_count);
        for _ in 0..reg_count {
            regs.push(cursor.read_u64::<NativeEndian>()?);
        }
    }
    Ok(SampleRecord { pid, regs })
}

/// `PERF_RECORD_LOST` body: the event id, then the number of lost records.
fn parse_lost(body: &[u8]) -> io::Result<u64> {
    let mut cursor = Cursor::new(body);
    let _id = cursor.read_u64::<NativeEndian>()?;
    cursor.read_u64::<NativeEndian>()
}

/// A perf ring plus fd readiness. Yields one parsed batch per wakeup.
/// Declared ring-first so drop unmaps before the fd closes.
struct SampleStream {
    ring: PerfRing,
    fd: AsyncFd<RingFd>,
}

impl SampleStream {
    fn new(fd: RingFd, page_cnt: usize) -> io::Result<SampleStream> {
        let ring = PerfRing::new(fd.as_raw_fd(), page_cnt)?;
        let fd = AsyncFd::with_interest(fd, Interest::READABLE)?;
        Ok(SampleStream { ring, fd })
    }

    fn enable(&self) -> io::Result<()> {
        if unsafe { ioctl(self.fd.get_ref().as_raw_fd(), PERF_EVENT_IOC_ENABLE, 0) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Stream for SampleStream {
    type Item = Batch;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let mut guard = match this.fd.poll_read_ready(cx) {
            Poll::Ready(Ok(guard)) => guard,
            Poll::Ready(Err(_)) => return Poll::Ready(None),
            Poll::Pending => return Poll::Pending,
        };
        let batch = this.ring.read_batch();
        guard.clear_ready();
        Poll::Ready(Some(batch))
    }
}

async fn pump_samples(mut stream: SampleStream, sink: EventSink, probe: String) {
    while let Some(batch) = stream.next().await {
        if batch.lost > 0 {
            sink.count_lost(batch.lost);
            warn!("possibly lost {} samples for {}", batch.lost, probe);
        }
        for sample in &batch.samples {
            if sample.regs.is_empty() {
                continue;
            }
            let hit = SampleHit {
                pid: sample.pid,
                regs: &sample.regs,
            };
            sink.capture(&hit);
        }
    }
}

/// One sampled hit. Argument slots map to sampled registers through the
/// architecture table; dereferences read the sampled process's memory.
struct SampleHit<'a> {
    pid: u32,
    regs: &'a [u64],
}

impl Hit for SampleHit<'_> {
    fn arg(&self, slot: u8) -> Option<u64> {
        let index = usize::from(slot).checked_sub(1)?;
        let position = *arg_positions().get(index)?;
        self.regs.get(position).copied()
    }

    fn read(&self, addr: u64, buf: &mut [u8]) -> io::Result<()> {
        read_process_memory(self.pid as pid_t, addr, buf)
    }
}

fn read_process_memory(pid: pid_t, addr: u64, buf: &mut [u8]) -> io::Result<()> {
    let local = iovec {
        iov_base: buf.as_mut_ptr() as *mut c_void,
        iov_len: buf.len(),
    };
    let remote = iovec {
        iov_base: addr as *mut c_void,
        iov_len: buf.len(),
    };
    let read = unsafe { process_vm_readv(pid, &local, 1, &remote, 1, 0) };
    if read < 0 {
        Err(io::Error::last_os_error())
    } else if read as usize != buf.len() {
        Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "short read from probed process",
        ))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    fn sample_body(pid: u32, abi: u64, regs: &[u64]) -> Vec<u8> {
        let mut body = Vec::new();
        body.write_u32::<NativeEndian>(pid).unwrap();
        body.write_u32::<NativeEndian>(pid).unwrap();
        body.write_u64::<NativeEndian>(abi).unwrap();
        for &reg in regs {
            body.write_u64::<NativeEndian>(reg).unwrap();
        }
        body
    }

    #[test]
    fn samples_carry_pid_and_registers() {
        let regs: Vec<u64> = (10..16).collect();
        let body = sample_body(1234, 2, &regs);
        let sample = parse_sample(&body, 6).unwrap();
        assert_eq!(sample.pid, 1234);
        assert_eq!(sample.regs, regs);
    }

    #[test]
    fn abi_none_samples_have_no_registers() {
        let body = sample_body(1, PERF_SAMPLE_REGS_ABI_NONE, &[]);
        let sample = parse_sample(&body, 6).unwrap();
        assert!(sample.regs.is_empty());
    }

    #[test]
    fn truncated_samples_are_rejected() {
        let body = sample_body(1, 2, &[1, 2, 3]);
        assert!(parse_sample(&body, 6).is_err());
    }

    #[test]
    fn lost_records_report_their_count() {
        let mut body = Vec::new();
        body.write_u64::<NativeEndian>(77).unwrap();
        body.write_u64::<NativeEndian>(41).unwrap();
        assert_eq!(parse_lost(&body).unwrap(), 41);
    }

    #[test]
    fn unknown_record_types_are_skipped() {
        let mut bytes = Vec::new();
        // type 3 (PERF_RECORD_EXIT), misc 0, size 16, arbitrary body
        bytes.write_u32::<NativeEndian>(3).unwrap();
        bytes.write_u16::<NativeEndian>(0).unwrap();
        bytes.write_u16::<NativeEndian>(16).unwrap();
        bytes.write_u64::<NativeEndian>(0).unwrap();
        assert!(matches!(
            parse_record(3, &bytes, 6),
            RingRecord::Skip
        ));
    }

    #[test]
    fn arguments_resolve_through_the_position_table() {
        let positions = arg_positions();
        let mut regs = vec![0u64; arg_reg_count()];
        for (slot, &position) in positions.iter().enumerate() {
            regs[position] = (slot as u64 + 1) * 100;
        }
        let hit = SampleHit { pid: 0, regs: &regs };
        for slot in 1..=6u8 {
            assert_eq!(hit.arg(slot), Some(slot as u64 * 100));
        }
        assert_eq!(hit.arg(0), None);
        assert_eq!(hit.arg(7), None);
    }
}
