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

//! Request-iterator pump (spec §4.C): drains a caller-supplied request
//! stream on a dedicated thread, submitting one `SendMessage` at a time and
//! blocking for its completion before asking the iterator for the next
//! item. That wait is what gives per-message backpressure (spec §8
//! property 5).

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::debug;

use super::CallState;
use crate::codec::SerializeFn;
use crate::op::{Batch, EventTag, OpType, Operation, WriteFlags};
use crate::status::StatusCode;
use crate::transport::TransportCall;

/// One item pulled from the caller's request stream.
pub enum RequestItem<T> {
    Message(T),
    End,
    /// The caller's iterator raised while producing the next item.
    IteratorFailed(String),
}

/// Abstracts the caller-supplied request stream. Blanket-implemented for
/// any `Iterator<Item = Result<T, String>>`, so ordinary iterators and
/// channels both work without the caller touching this trait directly.
pub trait RequestSource<T>: Send {
    fn next_item(&mut self) -> RequestItem<T>;
}

impl<T, I> RequestSource<T> for I
where
    I: Iterator<Item = Result<T, String>> + Send,
{
    fn next_item(&mut self) -> RequestItem<T> {
        match self.next() {
            Some(Ok(item)) => RequestItem::Message(item),
            Some(Err(msg)) => RequestItem::IteratorFailed(msg),
            None => RequestItem::End,
        }
    }
}

/// Spawn the pump thread for `call`/`state`. `tag` is the event handler
/// batches submitted by the pump are tagged with (the call's own
/// `CallState`, cast to `EventTag`, for managed calls).
pub fn spawn<T, S>(
    state: Arc<CallState>,
    call: Arc<dyn TransportCall>,
    tag: EventTag,
    mut source: S,
    serialize: SerializeFn<T>,
    flags: WriteFlags,
) -> JoinHandle<()>
where
    T: Send + 'static,
    S: RequestSource<T> + Send + 'static,
{
    thread::Builder::new()
        .name("grpc-request-pump".to_owned())
        .spawn(move || loop {
            crate::fork::block_if_fork_in_progress();
            match source.next_item() {
                RequestItem::End => {
                    close(&state, &call, &tag);
                    return;
                }
                RequestItem::IteratorFailed(msg) => {
                    debug!("request iterator failed: {}", msg);
                    call.cancel(StatusCode::Unknown, "Exception iterating requests!");
                    state.abort(StatusCode::Unknown, "Exception iterating requests!", false);
                    return;
                }
                RequestItem::Message(item) => {
                    let bytes = match serialize(&item) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            debug!("request serialization failed: {}", e);
                            call.cancel(StatusCode::Internal, "Exception serializing request!");
                            state.abort(StatusCode::Internal, "Exception serializing request!", false);
                            return;
                        }
                    };

                    {
                        let guard = state.lock();
                        if guard.code.is_some() || guard.cancelled {
                            return;
                        }
                    }

                    let mut batch = Batch::new();
                    batch.push(Operation::send_message(bytes, flags));
                    {
                        let mut guard = state.lock();
                        CallState::mark_due(&mut guard, [OpType::SendMessage]);
                    }
                    if !call.operate(batch, tag.clone()) {
                        let mut guard = state.lock();
                        CallState::unmark_due(&mut guard, [OpType::SendMessage]);
                        return;
                    }

                    // Backpressure: wait for this send to clear (or the
                    // call to terminate) before asking for the next item.
                    state.wait_for_send_message_clear();
                    if state.is_terminal() {
                        return;
                    }
                }
            }
        })
        .expect("failed to spawn request-iterator pump thread")
}

fn close(state: &Arc<CallState>, call: &Arc<dyn TransportCall>, tag: &EventTag) {
    let should_send = {
        let guard = state.lock();
        guard.code.is_none()
    };
    if !should_send {
        return;
    }

    let mut batch = Batch::new();
    batch.push(Operation::send_close_from_client());
    {
        let mut guard = state.lock();
        if guard.code.is_some() {
            return;
        }
        CallState::mark_due(&mut guard, [OpType::SendCloseFromClient]);
    }
    if !call.operate(batch, tag.clone()) {
        let mut guard = state.lock();
        CallState::unmark_due(&mut guard, [OpType::SendCloseFromClient]);
    }
}
