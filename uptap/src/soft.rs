// Copyright 2026 Authors of uptap
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An in-process probe backend. Nothing is armed in the kernel; instead the
//! process "fires" probes itself through a [`SoftHandle`]. The capture,
//! channel, and dispatch paths are exactly the ones the uprobe backend
//! drives, which makes the pipeline exercisable without privileges.
use std::collections::HashMap;
use std::io;
use std::ptr;
use std::sync::{Arc, RwLock};

use crate::descriptor::ProbeDescriptor;
use crate::engine::{EventSink, Hit, Tracer};
use crate::error::Result;

type Registry = HashMap<String, Vec<(u64, EventSink)>>;

/// Software probe backend. Attach points are keyed by symbol name alone;
/// the target path is carried but nothing is resolved.
pub struct SoftTracer {
    points: Arc<RwLock<Registry>>,
    next_token: u64,
}

/// A probe armed in a [`SoftTracer`].
pub struct SoftProbe {
    symbol: String,
    token: u64,
}

impl SoftTracer {
    pub fn new() -> SoftTracer {
        SoftTracer {
            points: Arc::new(RwLock::new(HashMap::new())),
            next_token: 0,
        }
    }

    /// The trigger side. Handles stay valid after the tracer moves into an
    /// engine.
    pub fn handle(&self) -> SoftHandle {
        SoftHandle {
            points: self.points.clone(),
        }
    }
}

impl Default for SoftTracer {
    fn default() -> SoftTracer {
        SoftTracer::new()
    }
}

impl Tracer for SoftTracer {
    type Probe = SoftProbe;

    fn attach(&mut self, descriptor: &ProbeDescriptor, sink: EventSink) -> Result<SoftProbe> {
        let token = self.next_token;
        self.next_token += 1;
        self.points
            .write()
            .unwrap()
            .entry(descriptor.symbol().to_string())
            .or_default()
            .push((token, sink));
        Ok(SoftProbe {
            symbol: descriptor.symbol().to_string(),
            token,
        })
    }

    fn detach(&mut self, probe: &mut SoftProbe) -> Result<()> {
        if let Some(points) = self.points.write().unwrap().get_mut(&probe.symbol) {
            points.retain(|(token, _)| *token != probe.token);
        }
        Ok(())
    }
}

/// Fires software probes by symbol name.
#[derive(Clone)]
pub struct SoftHandle {
    points: Arc<RwLock<Registry>>,
}

impl SoftHandle {
    /// Simulates one call of `symbol` with the given argument slots
    /// (`args[0]` is slot 1). Pointer-valued slots that a probe
    /// dereferences must point into this process. Returns how many records
    /// reached their channels.
    pub fn trigger(&self, symbol: &str, args: &[u64]) -> usize {
        let points = self.points.read().unwrap();
        let sinks = match points.get(symbol) {
            Some(sinks) => sinks,
            None => return 0,
        };
        let hit = SoftHit { args };
        sinks.iter().filter(|(_, sink)| sink.capture(&hit)).count()
    }
}

struct SoftHit<'a> {
    args: &'a [u64],
}

impl Hit for SoftHit<'_> {
    fn arg(&self, slot: u8) -> Option<u64> {
        self.args.get(usize::from(slot).checked_sub(1)?).copied()
    }

    fn read(&self, addr: u64, buf: &mut [u8]) -> io::Result<()> {
        if addr == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "null pointer"));
        }
        // The triggering caller passed this address as a probe argument and
        // vouches for it pointing at readable memory in this process.
        unsafe {
            ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::EventChannel;
    use crate::descriptor::ArgSource;
    use crate::engine::ProbeEngine;
    use crate::schema::{EventSchema, FieldKind};

    fn id_descriptor(symbol: &str, rule: ArgSource) -> ProbeDescriptor {
        ProbeDescriptor::describe(
            EventSchema::new("t", &[("id", FieldKind::I32)]),
            "lib.so",
            symbol,
            &[rule],
        )
        .unwrap()
    }

    #[test]
    fn slot_rule_reads_the_argument() {
        let channel = EventChannel::with_capacity(4);
        let tracer = SoftTracer::new();
        let handle = tracer.handle();
        let mut engine = ProbeEngine::new(tracer);
        engine
            .attach(id_descriptor("f", ArgSource::Slot(3)), channel.submitter())
            .unwrap();
        assert_eq!(handle.trigger("f", &[0, 0, 42]), 1);
        assert_eq!(handle.trigger("unprobed", &[1]), 0);
    }

    #[test]
    fn deref_rule_reads_through_the_pointer() {
        let channel = EventChannel::with_capacity(4);
        let tracer = SoftTracer::new();
        let handle = tracer.handle();
        let mut engine = ProbeEngine::new(tracer);
        engine
            .attach(
                id_descriptor("f", ArgSource::Deref { slot: 1, offset: 0 }),
                channel.submitter(),
            )
            .unwrap();
        let value: i32 = 7;
        assert_eq!(handle.trigger("f", &[&value as *const i32 as u64]), 1);
        // Null base pointers are skipped, not read.
        assert_eq!(handle.trigger("f", &[0]), 0);
        assert_eq!(channel.pending_drops(), 0);
    }

    #[test]
    fn missing_argument_slots_capture_nothing() {
        let channel = EventChannel::with_capacity(4);
        let tracer = SoftTracer::new();
        let handle = tracer.handle();
        let mut engine = ProbeEngine::new(tracer);
        engine
            .attach(id_descriptor("f", ArgSource::Slot(4)), channel.submitter())
            .unwrap();
        assert_eq!(handle.trigger("f", &[1, 2]), 0);
    }

    #[test]
    fn detached_probes_stop_firing() {
        let channel = EventChannel::with_capacity(4);
        let tracer = SoftTracer::new();
        let handle = tracer.handle();
        let mut engine = ProbeEngine::new(tracer);
        let id = engine
            .attach(id_descriptor("f", ArgSource::Slot(1)), channel.submitter())
            .unwrap();
        assert_eq!(handle.trigger("f", &[5]), 1);
        engine.detach(id).unwrap();
        assert_eq!(handle.trigger("f", &[5]), 0);
    }

    #[test]
    fn engine_drop_detaches_everything() {
        let channel = EventChannel::with_capacity(4);
        let tracer = SoftTracer::new();
        let handle = tracer.handle();
        {
            let mut engine = ProbeEngine::new(tracer);
            engine
                .attach(id_descriptor("f", ArgSource::Slot(1)), channel.submitter())
                .unwrap();
            assert_eq!(handle.trigger("f", &[5]), 1);
        }
        assert_eq!(handle.trigger("f", &[5]), 0);
    }
}
