// Copyright 2017 PingCAP, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

//! Single-threaded rendezvous (spec §4.E).
//!
//! Does not depend on the channel spin worker: every state-mutating read
//! drives the call's own (segregated) completion queue directly, by
//! calling `transport.next_event()` on the call and dispatching the event
//! itself until the condition it's waiting for is met. Opt-in via
//! `ChannelOptions::single_threaded_unary_stream` (spec §6), used for
//! unary-request calls (unary-unary, unary-stream).

use std::sync::Arc;
use std::time::Duration;

use crate::codec::DeserializeFn;
use crate::error::{Error, Result};
use crate::op::{Batch, OpType, Operation};
use crate::status::{RpcStatus, StatusCode};
use crate::transport::{CallEventOutcome, TransportCall};

use super::CallState;

fn terminal_error(code: StatusCode, details: &str, debug_error_string: &Option<String>) -> Error {
    let status = RpcStatus {
        code,
        details: details.to_owned(),
        debug_error_string: debug_error_string.clone(),
    };
    if code == StatusCode::Cancelled {
        Error::Cancelled
    } else {
        Error::RpcFailure(status)
    }
}

pub struct SingleThreadedCall<Resp> {
    state: Arc<CallState>,
    call: Arc<dyn TransportCall>,
    de: DeserializeFn<Resp>,
}

impl<Resp> SingleThreadedCall<Resp> {
    pub(crate) fn new(
        state: Arc<CallState>,
        call: Arc<dyn TransportCall>,
        de: DeserializeFn<Resp>,
    ) -> SingleThreadedCall<Resp> {
        SingleThreadedCall { state, call, de }
    }

    /// Pull and dispatch events from this call's own completion queue until
    /// `pred` holds.
    fn pump_until(&self, mut pred: impl FnMut(&super::CallStateInner) -> bool) {
        loop {
            {
                let guard = self.state.lock();
                if pred(&guard) {
                    return;
                }
            }
            match self.call.next_event() {
                CallEventOutcome::Event(event) => {
                    self.state.handle_event_propagating(event);
                }
                CallEventOutcome::Timeout => continue,
                CallEventOutcome::QueueShutdown => return,
            }
        }
    }

    /// §9 open question: initial metadata is only delivered once something
    /// pumps the queue. We keep that behavior rather than eagerly
    /// pre-pumping at construction time (see DESIGN.md).
    pub fn initial_metadata(&self) -> crate::metadata::Metadata {
        self.pump_until(|s| s.initial_metadata.is_some() || s.code.is_some());
        self.state.lock().initial_metadata.clone().unwrap_or_default()
    }

    pub fn trailing_metadata(&self) -> crate::metadata::Metadata {
        self.pump_until(|s| s.code.is_some());
        self.state.lock().trailing_metadata.clone().unwrap_or_default()
    }

    pub fn code(&self) -> StatusCode {
        self.pump_until(|s| s.code.is_some());
        self.state.lock().code.unwrap()
    }

    pub fn details(&self) -> String {
        self.pump_until(|s| s.code.is_some());
        self.state.lock().details.clone()
    }

    /// Refuses to block before completion (spec §4.E): callers must drive
    /// the call to termination via `next()` or an accessor first.
    pub fn result(&self) -> Result<Resp> {
        if !self.state.is_terminal() {
            return Err(Error::UsageError(
                "result() cannot be called before a single-threaded call completes",
            ));
        }
        let guard = self.state.lock();
        let code = guard.code.unwrap();
        if code.is_ok() {
            drop(guard);
            let bytes = self
                .state
                .response_snapshot()
                .ok_or_else(|| Error::Codec("no response message received".to_owned()))?;
            (self.de)(&bytes).map_err(Error::Codec)
        } else if guard.cancelled {
            Err(Error::Cancelled)
        } else {
            Err(terminal_error(code, &guard.details, &guard.debug_error_string))
        }
    }

    /// Register a done-callback. Fired by whichever thread's `next`/pump
    /// call observes the terminal event; exceptions in the callback
    /// propagate to that thread, unlike the multi-threaded variant (spec
    /// §4.E).
    pub fn add_done_callback<F>(self: &Arc<Self>, f: F)
    where
        F: FnOnce(&SingleThreadedCall<Resp>) + Send + 'static,
    {
        let this = self.clone();
        let cb: super::DoneCallback = Box::new(move || f(&this));
        if let Some(cb) = self.state.push_callback_if_pending(cb) {
            cb();
        }
    }

    pub fn cancel(&self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.call
            .cancel(StatusCode::Cancelled, "Locally cancelled by application!");
        self.state
            .abort_propagating(StatusCode::Cancelled, "Locally cancelled by application!", true)
    }

    pub fn cancelled(&self) -> bool {
        self.state.cancelled()
    }

    pub fn done(&self) -> bool {
        self.state.is_terminal()
    }

    /// Pull the next response message, pumping this call's own completion
    /// queue as needed (spec §4.E).
    pub fn next(&self) -> Option<Result<Resp>> {
        {
            let guard = self.state.lock();
            if guard.response.is_none() && guard.code.is_some() {
                let code = guard.code.unwrap();
                return if code.is_ok() {
                    None
                } else if guard.cancelled {
                    Some(Err(Error::Cancelled))
                } else {
                    Some(Err(terminal_error(code, &guard.details, &guard.debug_error_string)))
                };
            }
        }

        {
            let mut guard = self.state.lock();
            if guard.response.is_none()
                && guard.code.is_none()
                && !guard.due.contains(&OpType::ReceiveMessage)
            {
                CallState::mark_due(&mut guard, [OpType::ReceiveMessage]);
                drop(guard);
                let mut batch = Batch::new();
                batch.push(Operation::receive_message());
                let tag: crate::op::EventTag = self.state.clone();
                if !self.call.operate(batch, tag) {
                    let mut guard = self.state.lock();
                    CallState::unmark_due(&mut guard, [OpType::ReceiveMessage]);
                }
            }
        }

        self.pump_until(|s| {
            s.response.is_some() || (!s.due.contains(&OpType::ReceiveMessage) && s.code.is_some())
        });

        let bytes = self.state.lock().response.take();
        match bytes {
            Some(bytes) => Some((self.de)(&bytes).map_err(Error::Codec)),
            None => {
                let guard = self.state.lock();
                let code = guard.code.expect("pump_until guarantees termination here");
                if code.is_ok() {
                    None
                } else if guard.cancelled {
                    Some(Err(Error::Cancelled))
                } else {
                    Some(Err(terminal_error(code, &guard.details, &guard.debug_error_string)))
                }
            }
        }
    }
}

impl<Resp> Drop for SingleThreadedCall<Resp> {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            self.call
                .cancel(StatusCode::Cancelled, "Cancelled upon garbage collection!");
            self.state
                .abort(StatusCode::Cancelled, "Cancelled upon garbage collection!", true);
            log::warn!("call dropped without completing; cancelled implicitly");
        }
    }
}
