// Copyright 2026 Authors of uptap
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The consumer loop: polls an [`EventChannel`] and routes each record to
//! the handler registered for its schema.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use crate::channel::EventChannel;
use crate::error::{Error, Result};
use crate::schema::{EventRecord, EventSchema};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPING: u8 = 2;
const STOPPED: u8 = 3;

/// Where the dispatch loop is in its life. `Stopping` is observable only
/// between a stop request and the loop noticing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl DispatchState {
    fn from_u8(state: u8) -> DispatchState {
        match state {
            IDLE => DispatchState::Idle,
            RUNNING => DispatchState::Running,
            STOPPING => DispatchState::Stopping,
            _ => DispatchState::Stopped,
        }
    }
}

type Handler = Box<dyn FnMut(&EventRecord) -> Result<()> + Send>;

/// Routes drained records to per-schema handlers.
///
/// A handler returning an error is logged and the loop keeps going; only a
/// [`StopHandle`] ends the run. Records with no registered handler are
/// logged and discarded.
pub struct Dispatcher {
    handlers: HashMap<String, Handler>,
    state: Arc<AtomicU8>,
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher {
            handlers: HashMap::new(),
            state: Arc::new(AtomicU8::new(IDLE)),
        }
    }

    /// Registers `handler` for records carrying `schema`. Schemas are keyed
    /// by name; registering the same name again replaces the handler.
    pub fn on<F>(&mut self, schema: &EventSchema, handler: F)
    where
        F: FnMut(&EventRecord) -> Result<()> + Send + 'static,
    {
        self.handlers
            .insert(schema.name().to_string(), Box::new(handler));
    }

    /// A handle that can end [`run`](Dispatcher::run) from another task or
    /// thread, typically a signal handler.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            state: self.state.clone(),
        }
    }

    pub fn state(&self) -> DispatchState {
        DispatchState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Runs the dispatch loop until stopped: drain the channel with a
    /// `poll` wait, hand out the batch, repeat. Records already drained
    /// when a stop lands are still delivered. A dispatcher runs once;
    /// calling `run` again after it returns is an error.
    pub async fn run(&mut self, channel: &mut EventChannel, poll: Duration) -> Result<()> {
        match self
            .state
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            // Stopped before it started: nothing to do, but not an error.
            Err(STOPPING) => {
                self.state.store(STOPPED, Ordering::Release);
                return Ok(());
            }
            Err(_) => {
                return Err(Error::Dispatch(
                    "dispatch loop has already run".to_string(),
                ))
            }
        }
        while self.state.load(Ordering::Acquire) == RUNNING {
            let records = channel.drain(poll).await;
            for record in &records {
                self.dispatch(record);
            }
        }
        self.state.store(STOPPED, Ordering::Release);
        Ok(())
    }

    fn dispatch(&mut self, record: &EventRecord) {
        let name = record.schema().name();
        match self.handlers.get_mut(name) {
            Some(handler) => {
                if let Err(e) = handler(record) {
                    error!("handler for `{}` failed: {:?}", name, e);
                }
            }
            None => warn!("no handler for `{}` events", name),
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Dispatcher {
        Dispatcher::new()
    }
}

/// Requests that a running [`Dispatcher`] wind down after its current poll.
#[derive(Clone)]
pub struct StopHandle {
    state: Arc<AtomicU8>,
}

impl StopHandle {
    /// Idempotent; safe from any thread. Stopping a dispatcher that never
    /// ran parks it so a later `run` returns immediately.
    pub fn stop(&self) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| match state {
                IDLE | RUNNING => Some(STOPPING),
                _ => None,
            });
    }
}
