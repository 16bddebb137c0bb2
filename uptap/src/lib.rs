// Copyright 2026 Authors of uptap
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! # uptap
//!
//! uptap taps calls into native libraries with Linux uprobes and turns them
//! into typed event records, without patching or restarting the probed
//! process.
//!
//! The pieces compose like a pipeline:
//!
//!  * an [`EventSchema`](schema::EventSchema) lays out an event as packed
//!    native-endian integers;
//!  * a [`ProbeDescriptor`](descriptor::ProbeDescriptor) pairs a library
//!    symbol with one extraction rule per field, validated up front;
//!  * a [`ProbeEngine`](engine::ProbeEngine) arms descriptors on a backend
//!    ([`UprobeTracer`](perf::UprobeTracer) for the kernel facility,
//!    [`SoftTracer`](soft::SoftTracer) for in-process use) and owns the
//!    detach lifecycle;
//!  * captured records flow through a bounded
//!    [`EventChannel`](channel::EventChannel) that drops rather than blocks;
//!  * a [`Dispatcher`](dispatch::Dispatcher) drains the channel and routes
//!    each record to the handler registered for its schema.
//!
//! ```no_run
//! use std::time::Duration;
//! use uptap::{
//!     ArgSource, Dispatcher, EventChannel, EventSchema, FieldKind, ProbeDescriptor,
//!     ProbeEngine, UprobeTracer,
//! };
//!
//! # async fn tap() -> uptap::Result<()> {
//! let schema = EventSchema::new("truncate", &[("id", FieldKind::I32)]);
//! let descriptor = ProbeDescriptor::describe(
//!     schema.clone(),
//!     "./libjpaxos-pmem.so",
//!     "Java_lsr_paxos_storage_PersistentLog_truncateBelow_1",
//!     &[ArgSource::Slot(3)],
//! )?;
//!
//! let mut channel = EventChannel::with_capacity(512);
//! let mut engine = ProbeEngine::new(UprobeTracer::new(None));
//! engine.attach(descriptor, channel.submitter())?;
//!
//! let mut dispatcher = Dispatcher::new();
//! dispatcher.on(&schema, |event| {
//!     println!("Truncate I: {}", event.field("id").unwrap());
//!     Ok(())
//! });
//! dispatcher.run(&mut channel, Duration::from_millis(100)).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Attaching uprobes requires root (or `CAP_PERFMON` plus ptrace access for
//! pointer dereferences). The software backend has no such requirement and
//! drives the exact same capture, channel, and dispatch code.
#![deny(clippy::all)]

#[macro_use]
extern crate lazy_static;

pub mod channel;
pub mod cpus;
pub mod descriptor;
pub mod dispatch;
pub mod engine;
mod error;
pub mod perf;
pub mod schema;
pub mod soft;
pub mod symbols;
pub mod sys;

pub use crate::channel::{EventChannel, Submitter};
pub use crate::descriptor::{ArgSource, ProbeDescriptor, MAX_ARG_SLOTS};
pub use crate::dispatch::{DispatchState, Dispatcher, StopHandle};
pub use crate::engine::{AttachedProbe, EventSink, Hit, ProbeEngine, ProbeId, Tracer};
pub use crate::error::{Error, Result};
pub use crate::perf::{UprobeProbe, UprobeTracer};
pub use crate::schema::{EventRecord, EventSchema, Field, FieldKind, FieldValue};
pub use crate::soft::{SoftHandle, SoftProbe, SoftTracer};
