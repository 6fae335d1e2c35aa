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

//! Multi-threaded rendezvous (spec §4.D).
//!
//! Implements both a "future" surface (`result`, `add_done_callback`,
//! `cancel`, `running`, `done`, `cancelled`) and an "iterator" surface
//! (`std::iter::Iterator`) over one shared [`CallState`]. Relies on the
//! channel spin worker (spec §4.G) to deliver completion events; this type
//! never touches the transport's completion queue directly.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::codec::DeserializeFn;
use crate::error::{Error, Result};
use crate::op::{Batch, EventTag, OpType, Operation};
use crate::status::{RpcStatus, StatusCode};
use crate::transport::TransportCall;

use super::{CallState, DoneCallback};

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

/// The object returned to the caller for a managed (channel-spin-worker-
/// backed) call.
pub struct MultiThreadedCall<Resp> {
    state: Arc<CallState>,
    call: Arc<dyn TransportCall>,
    tag: EventTag,
    de: DeserializeFn<Resp>,
    /// Present only for calls with a streaming request side; joined on
    /// drop so the pump thread never outlives the call it serves.
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl<Resp> MultiThreadedCall<Resp> {
    pub(crate) fn new(
        state: Arc<CallState>,
        call: Arc<dyn TransportCall>,
        tag: EventTag,
        de: DeserializeFn<Resp>,
    ) -> MultiThreadedCall<Resp> {
        MultiThreadedCall {
            state,
            call,
            tag,
            de,
            pump: Mutex::new(None),
        }
    }

    pub(crate) fn attach_pump(&self, handle: JoinHandle<()>) {
        *self.pump.lock().unwrap() = Some(handle);
    }

    pub(crate) fn state(&self) -> &Arc<CallState> {
        &self.state
    }

    pub(crate) fn transport_call(&self) -> &Arc<dyn TransportCall> {
        &self.call
    }

    pub(crate) fn tag(&self) -> &EventTag {
        &self.tag
    }

    pub fn initial_metadata(&self) -> crate::metadata::Metadata {
        self.state.wait_for_initial_metadata()
    }

    pub fn trailing_metadata(&self) -> crate::metadata::Metadata {
        self.state.wait_for_trailing_metadata()
    }

    pub fn code(&self) -> StatusCode {
        self.state.wait_for_code()
    }

    pub fn details(&self) -> String {
        self.state.wait_for_details()
    }

    pub fn debug_error_string(&self) -> Option<String> {
        self.state.wait_for_debug_error_string()
    }

    /// Block for terminal state up to `timeout`; on `Ok` status, returns
    /// the stored response. Spec §4.D.
    pub fn result(&self, timeout: Option<Duration>) -> Result<Resp> {
        let status = self.state.wait_for_terminal(timeout).ok_or(Error::Timeout)?;
        if status.code.is_ok() {
            let bytes = self
                .state
                .response_snapshot()
                .ok_or_else(|| Error::Codec("no response message received".to_owned()))?;
            (self.de)(&bytes).map_err(Error::Codec)
        } else if self.state.cancelled() {
            Err(Error::Cancelled)
        } else {
            Err(terminal_error(
                status.code,
                &status.details,
                &status.debug_error_string,
            ))
        }
    }

    /// Register a callback to run once the call is terminal. If already
    /// terminal, runs synchronously, outside any lock (spec §4.D).
    pub fn add_done_callback<F>(self: &Arc<Self>, f: F)
    where
        F: FnOnce(&MultiThreadedCall<Resp>) + Send + 'static,
    {
        let this = self.clone();
        let cb: DoneCallback = Box::new(move || f(&this));
        if let Some(cb) = self.state.push_callback_if_pending(cb) {
            cb();
        }
    }

    /// Cancel the call. Idempotent: `true` the first time, `false`
    /// thereafter (spec §8 property 4).
    pub fn cancel(&self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.call
            .cancel(StatusCode::Cancelled, "Locally cancelled by application!");
        self.state
            .abort(StatusCode::Cancelled, "Locally cancelled by application!", true)
    }

    pub fn running(&self) -> bool {
        !self.state.is_terminal()
    }

    pub fn done(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn cancelled(&self) -> bool {
        self.state.cancelled()
    }
}

impl<Resp> MultiThreadedCall<Resp> {
    /// Pull the next response message. Takes `&self`, not `&mut self`: every
    /// field this touches is guarded by `state`'s own lock, so a shared
    /// handle (e.g. an `Arc<MultiThreadedCall<Resp>>`) can drive it directly
    /// without needing exclusive access. `Iterator::next` below is a thin
    /// wrapper over this for callers that hold the call by value.
    pub fn next_message(&self) -> Option<Result<Resp>> {
        {
            let guard = self.state.lock();
            if guard.response.is_none() && guard.code.is_some() {
                let code = guard.code.unwrap();
                return if code.is_ok() {
                    None
                } else if guard.cancelled {
                    Some(Err(Error::Cancelled))
                } else {
                    Some(Err(terminal_error(
                        code,
                        &guard.details,
                        &guard.debug_error_string,
                    )))
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
                if !self.call.operate(batch, self.tag.clone()) {
                    let mut guard = self.state.lock();
                    CallState::unmark_due(&mut guard, [OpType::ReceiveMessage]);
                }
            }
        }

        match self.state.wait_for_message_or_terminal() {
            Some(bytes) => Some((self.de)(&bytes).map_err(Error::Codec)),
            None => {
                let guard = self.state.lock();
                let code = guard.code.expect("terminal wait only returns None once code is set");
                if code.is_ok() {
                    None
                } else if guard.cancelled {
                    Some(Err(Error::Cancelled))
                } else {
                    Some(Err(terminal_error(
                        code,
                        &guard.details,
                        &guard.debug_error_string,
                    )))
                }
            }
        }
    }
}

impl<Resp> Iterator for MultiThreadedCall<Resp> {
    type Item = Result<Resp>;

    fn next(&mut self) -> Option<Result<Resp>> {
        self.next_message()
    }
}

impl<Resp> Drop for MultiThreadedCall<Resp> {
    /// Finalizer-based cancellation (spec §9), expressed as deterministic
    /// scope-exit release rather than relying on garbage collection.
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
