// Copyright 2026 Authors of uptap
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Probe lifecycle. A [`ProbeEngine`] owns every probe it attaches and
//! guarantees each one is detached exactly once, at the latest when the
//! engine drops.
use std::io;
use std::sync::Arc;

use tracing::warn;

use crate::channel::Submitter;
use crate::descriptor::{ArgSource, ProbeDescriptor};
use crate::error::{Error, Result};
use crate::schema::{EventRecord, EventSchema};

/// One observed call of a probed function, as seen by a backend.
///
/// Slots are 1-based call argument positions, matching
/// [`ArgSource`](crate::descriptor::ArgSource).
pub trait Hit {
    /// The raw value of an argument slot, if the backend captured it.
    fn arg(&self, slot: u8) -> Option<u64>;

    /// Reads `buf.len()` bytes at `addr` in the probed address space.
    fn read(&self, addr: u64, buf: &mut [u8]) -> io::Result<()>;
}

/// Per-probe capture state handed to a backend on attach. When the probed
/// function fires, the backend calls [`EventSink::capture`] with the hit.
#[derive(Clone)]
pub struct EventSink {
    schema: Arc<EventSchema>,
    rules: Vec<ArgSource>,
    submitter: Submitter,
}

impl EventSink {
    pub(crate) fn new(
        schema: Arc<EventSchema>,
        rules: Vec<ArgSource>,
        submitter: Submitter,
    ) -> EventSink {
        EventSink {
            schema,
            rules,
            submitter,
        }
    }

    pub fn schema(&self) -> &EventSchema {
        &self.schema
    }

    /// Applies the descriptor's extraction rules to one hit and submits the
    /// resulting record. Returns whether a record reached the channel: a
    /// missing argument, unreadable pointer, or full channel all yield
    /// `false`. Never blocks.
    pub fn capture(&self, hit: &dyn Hit) -> bool {
        let mut bytes = Vec::with_capacity(self.schema.byte_width());
        for (field, rule) in self.schema.fields().iter().zip(&self.rules) {
            let width = field.kind().width();
            match *rule {
                ArgSource::Slot(slot) => {
                    let value = match hit.arg(slot) {
                        Some(value) => value,
                        None => return false,
                    };
                    push_truncated(&mut bytes, value, width);
                }
                ArgSource::Deref { slot, offset } => {
                    let base = match hit.arg(slot) {
                        Some(base) => base,
                        None => return false,
                    };
                    if base == 0 {
                        return false;
                    }
                    let mut scratch = [0u8; 8];
                    if hit
                        .read(base.wrapping_add(offset as u64), &mut scratch[..width])
                        .is_err()
                    {
                        return false;
                    }
                    bytes.extend_from_slice(&scratch[..width]);
                }
            }
        }
        match EventRecord::decode(&self.schema, &bytes) {
            Ok(record) => self.submitter.submit(record),
            Err(_) => false,
        }
    }

    /// Reports transport loss for this probe. See [`Submitter::count_lost`].
    pub fn count_lost(&self, n: u64) {
        self.submitter.count_lost(n);
    }
}

/// Narrows an argument register to the field width, in native byte order.
fn push_truncated(bytes: &mut Vec<u8>, value: u64, width: usize) {
    match width {
        1 => bytes.extend_from_slice(&(value as u8).to_ne_bytes()),
        2 => bytes.extend_from_slice(&(value as u16).to_ne_bytes()),
        4 => bytes.extend_from_slice(&(value as u32).to_ne_bytes()),
        _ => bytes.extend_from_slice(&value.to_ne_bytes()),
    }
}

/// A probe backend: something that can arm a descriptor and later disarm
/// the returned resource. [`UprobeTracer`](crate::perf::UprobeTracer) is
/// the kernel-backed implementation; [`SoftTracer`](crate::soft::SoftTracer)
/// runs entirely in-process.
pub trait Tracer {
    type Probe;

    /// Arms `descriptor`. Events observed from now on flow into `sink`.
    fn attach(&mut self, descriptor: &ProbeDescriptor, sink: EventSink) -> Result<Self::Probe>;

    /// Disarms a probe. Called at most once per probe by the engine.
    fn detach(&mut self, probe: &mut Self::Probe) -> Result<()>;
}

/// Handle to a probe owned by a [`ProbeEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeId(usize);

/// Engine-side record of one attachment. The backend resource is taken out
/// on detach, so a detached slot stays behind as a tombstone.
pub struct AttachedProbe<P> {
    resource: Option<P>,
    name: String,
}

impl<P> AttachedProbe<P> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_attached(&self) -> bool {
        self.resource.is_some()
    }
}

/// Owns a backend and every probe attached through it.
pub struct ProbeEngine<T: Tracer> {
    tracer: T,
    probes: Vec<AttachedProbe<T::Probe>>,
}

impl<T: Tracer> ProbeEngine<T> {
    pub fn new(tracer: T) -> ProbeEngine<T> {
        ProbeEngine {
            tracer,
            probes: Vec::new(),
        }
    }

    /// Arms `descriptor` and wires its captures into `submitter`'s channel.
    /// On failure nothing is retained; the error names the probe.
    pub fn attach(&mut self, descriptor: ProbeDescriptor, submitter: Submitter) -> Result<ProbeId> {
        let name = descriptor.probe_name();
        let sink = EventSink::new(
            descriptor.schema().clone(),
            descriptor.rules().to_vec(),
            submitter,
        );
        let resource = self
            .tracer
            .attach(&descriptor, sink)
            .map_err(|e| Error::Attach(name.clone(), Box::new(e)))?;
        self.probes.push(AttachedProbe {
            resource: Some(resource),
            name,
        });
        Ok(ProbeId(self.probes.len() - 1))
    }

    /// Disarms one probe. Detaching an already-detached probe is a no-op;
    /// an unknown id is an error.
    pub fn detach(&mut self, id: ProbeId) -> Result<()> {
        let probe = self
            .probes
            .get_mut(id.0)
            .ok_or_else(|| Error::Dispatch(format!("unknown probe id {}", id.0)))?;
        let mut resource = match probe.resource.take() {
            Some(resource) => resource,
            None => return Ok(()),
        };
        self.tracer
            .detach(&mut resource)
            .map_err(|e| Error::Detach(probe.name.clone(), Box::new(e)))
    }

    /// Disarms everything still attached. Failures don't stop the sweep;
    /// they come back paired with the probe name.
    pub fn detach_all(&mut self) -> Vec<(String, Error)> {
        let mut failures = Vec::new();
        for probe in &mut self.probes {
            let mut resource = match probe.resource.take() {
                Some(resource) => resource,
                None => continue,
            };
            if let Err(e) = self.tracer.detach(&mut resource) {
                failures.push((probe.name.clone(), e));
            }
        }
        failures
    }

    /// Number of probes currently armed.
    pub fn attached(&self) -> usize {
        self.probes.iter().filter(|p| p.is_attached()).count()
    }

    pub fn probes(&self) -> &[AttachedProbe<T::Probe>] {
        &self.probes
    }
}

impl<T: Tracer> Drop for ProbeEngine<T> {
    fn drop(&mut self) {
        for (probe, error) in self.detach_all() {
            warn!("failed to detach {}: {:?}", probe, error);
        }
    }
}
