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

//! Per-call state machine (spec §3 "RPCState", §4.B "Event dispatcher").
//!
//! One [`CallState`] backs one in-flight or terminated call. It is the one
//! piece of mutable state shared between a rendezvous and whichever worker
//! delivers its completion events (the channel spin worker, for managed
//! calls; the rendezvous's own thread, for segregated ones) — guarded by a
//! single `Mutex` + `Condvar` pair exactly as spec §3 describes.

pub mod multi_threaded;
pub mod pump;
pub mod single_threaded;

use std::collections::HashSet;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::metadata::Metadata;
use crate::op::{CompletionEvent, EventHandler, OpResult, OpType};
use crate::status::{RpcStatus, StatusCode};

/// A callback registered through `add_done_callback`. Takes no arguments:
/// the rendezvous variants close over an `Arc` to themselves so the
/// callback still observes "the final rendezvous" per spec §9, without
/// `CallState` needing to know which rendezvous type wraps it.
pub type DoneCallback = Box<dyn FnOnce() + Send>;

/// The mutable fields behind the lock (spec §3).
pub(crate) struct CallStateInner {
    pub due: HashSet<OpType>,
    pub initial_metadata: Option<Metadata>,
    pub response: Option<Vec<u8>>,
    pub trailing_metadata: Option<Metadata>,
    pub code: Option<StatusCode>,
    pub details: String,
    pub debug_error_string: Option<String>,
    pub cancelled: bool,
    pub callbacks: Vec<DoneCallback>,
    /// Explicit sentinel per spec §9 ("`callbacks = nil` as already-drained
    /// sentinel... represent explicitly as a boolean").
    pub callbacks_fired: bool,
}

pub struct CallState {
    inner: Mutex<CallStateInner>,
    cv: Condvar,
}

impl CallState {
    pub fn new(initial_due: HashSet<OpType>) -> CallState {
        CallState {
            inner: Mutex::new(CallStateInner {
                due: initial_due,
                initial_metadata: None,
                response: None,
                trailing_metadata: None,
                code: None,
                details: String::new(),
                debug_error_string: None,
                cancelled: false,
                callbacks: Vec::new(),
                callbacks_fired: false,
            }),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CallStateInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn notify_all(&self) {
        self.cv.notify_all();
    }

    /// Add `kind` to `due` before submitting a batch that contains it. Must
    /// be called with the lock held, before the batch reaches the
    /// transport (spec §3 invariant).
    pub(crate) fn mark_due(guard: &mut CallStateInner, kinds: impl IntoIterator<Item = OpType>) {
        guard.due.extend(kinds);
    }

    /// Roll back `kinds` after the transport refused a batch (spec §7).
    pub(crate) fn unmark_due(guard: &mut CallStateInner, kinds: impl IntoIterator<Item = OpType>) {
        for kind in kinds {
            guard.due.remove(&kind);
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.lock().code.is_some()
    }

    /// Block until `pred` holds, or return `false` on timeout.
    fn wait_until<F>(&self, mut pred: F, deadline: Option<Instant>) -> Option<MutexGuard<'_, CallStateInner>>
    where
        F: FnMut(&CallStateInner) -> bool,
    {
        let mut guard = self.lock();
        loop {
            if pred(&guard) {
                return Some(guard);
            }
            guard = match deadline {
                None => self.cv.wait(guard).unwrap_or_else(|e| e.into_inner()),
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return None;
                    }
                    let (g, timeout) = self
                        .cv
                        .wait_timeout(guard, d - now)
                        .unwrap_or_else(|e| e.into_inner());
                    if timeout.timed_out() && !pred(&g) {
                        return None;
                    }
                    g
                }
            };
        }
    }

    /// Block until initial metadata has arrived.
    pub fn wait_for_initial_metadata(&self) -> Metadata {
        let guard = self
            .wait_until(|s| s.initial_metadata.is_some(), None)
            .expect("unbounded wait cannot time out");
        guard.initial_metadata.clone().unwrap()
    }

    /// Block until the call is terminal, returning its trailing metadata
    /// (always populated by the time `code` is set).
    pub fn wait_for_trailing_metadata(&self) -> Metadata {
        let guard = self
            .wait_until(|s| s.code.is_some(), None)
            .expect("unbounded wait cannot time out");
        guard.trailing_metadata.clone().unwrap_or_default()
    }

    pub fn wait_for_code(&self) -> StatusCode {
        let guard = self
            .wait_until(|s| s.code.is_some(), None)
            .expect("unbounded wait cannot time out");
        guard.code.unwrap()
    }

    pub fn wait_for_details(&self) -> String {
        let guard = self
            .wait_until(|s| s.code.is_some(), None)
            .expect("unbounded wait cannot time out");
        guard.details.clone()
    }

    pub fn wait_for_debug_error_string(&self) -> Option<String> {
        let guard = self
            .wait_until(|s| s.code.is_some(), None)
            .expect("unbounded wait cannot time out");
        guard.debug_error_string.clone()
    }

    /// Block for terminal state up to `timeout`.
    pub fn wait_for_terminal(&self, timeout: Option<Duration>) -> Option<RpcStatus> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let guard = self.wait_until(|s| s.code.is_some(), deadline)?;
        Some(RpcStatus {
            code: guard.code.unwrap(),
            details: guard.details.clone(),
            debug_error_string: guard.debug_error_string.clone(),
        })
    }

    /// Block until `SendMessage` is no longer outstanding, or the call
    /// becomes terminal — the pump's per-message backpressure wait (spec
    /// §4.C step 3).
    pub fn wait_for_send_message_clear(&self) {
        self.wait_until(
            |s| !s.due.contains(&OpType::SendMessage) || s.code.is_some(),
            None,
        )
        .expect("unbounded wait cannot time out");
    }

    /// Block until a message is available or the call terminates, returning
    /// `Some(bytes)` and clearing `response`, or `None` once terminal
    /// (caller distinguishes OK/non-OK from `code`).
    pub fn wait_for_message_or_terminal(&self) -> Option<Vec<u8>> {
        let mut guard = self
            .wait_until(
                |s| s.response.is_some() || (!s.due.contains(&OpType::ReceiveMessage) && s.code.is_some()),
                None,
            )
            .expect("unbounded wait cannot time out");
        guard.response.take()
    }

    /// Event dispatcher (spec §4.B). Consumes one completion event, updates
    /// this state, and returns whether the call is now terminal (used by
    /// the channel spin worker to drive the managed-call ref count).
    ///
    /// Done-callbacks fired from here are swallowed and logged on panic
    /// (spec §4.B.6) so the spin worker is never killed by a caller's
    /// callback. The single-threaded rendezvous dispatches through
    /// [`CallState::handle_event_propagating`] instead, since its callbacks
    /// run on the caller's own thread and must propagate (spec §4.E).
    pub fn handle_event(&self, event: CompletionEvent) -> bool {
        let (became_terminal, fired) = self.apply_event(event);
        Self::dispatch_callbacks(fired, true);
        became_terminal
    }

    /// Same dispatch as [`CallState::handle_event`], but done-callback
    /// panics propagate to the calling thread instead of being swallowed
    /// (spec §4.E: single-threaded callbacks run on whichever thread pumps
    /// the queue, unlike the multi-threaded variant).
    pub fn handle_event_propagating(&self, event: CompletionEvent) -> bool {
        let (became_terminal, fired) = self.apply_event(event);
        Self::dispatch_callbacks(fired, false);
        became_terminal
    }

    fn apply_event(&self, event: CompletionEvent) -> (bool, Vec<DoneCallback>) {
        let mut fired: Vec<DoneCallback> = Vec::new();
        let became_terminal;
        {
            let mut guard = self.lock();
            for (kind, result) in event.completed {
                guard.due.remove(&kind);
                match result {
                    OpResult::Sent => {}
                    OpResult::InitialMetadata(md) => guard.initial_metadata = Some(md),
                    // Tie-break (spec §4.B): store the message before the
                    // status, so a reader that observes a terminal code
                    // still drains any pending response first.
                    OpResult::Message(bytes) => guard.response = bytes,
                    OpResult::Status(status) => {
                        if guard.code.is_none() {
                            guard.code = Some(status.code);
                            guard.details = status.details;
                            guard.debug_error_string = status.debug_error_string;
                        }
                        guard.trailing_metadata.get_or_insert_with(Metadata::new);
                    }
                }
            }

            if !event.success && guard.code.is_none() {
                // A batch failed without ever surfacing a status (spec §7
                // "transport operation refusal" observed asynchronously).
                debug!("batch failed without a status; awaiting receive-status");
            }

            if guard.code.is_some() && !guard.callbacks_fired {
                guard.callbacks_fired = true;
                fired = std::mem::take(&mut guard.callbacks);
            }
            became_terminal = guard.code.is_some();
            self.notify_all();
        }
        (became_terminal, fired)
    }

    fn dispatch_callbacks(fired: Vec<DoneCallback>, catch: bool) {
        for cb in fired {
            if catch {
                // Swallow and log so the spin worker is never killed by a
                // caller's callback (spec §4.B.6).
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(cb)).is_err() {
                    warn!("done-callback panicked; ignoring");
                }
            } else {
                cb();
            }
        }
    }

    /// Abort to a terminal state (local cancellation, pump failure, etc).
    /// Idempotent: returns `true` only the first time it actually
    /// transitions the call (spec §5 "Cancellation", §8 property 4).
    /// Done-callback panics are swallowed; see
    /// [`CallState::abort_propagating`] for the single-threaded variant.
    pub fn abort(&self, code: StatusCode, details: impl Into<String>, cancelled: bool) -> bool {
        let (transitioned, fired) = self.apply_abort(code, details, cancelled);
        Self::dispatch_callbacks(fired, true);
        transitioned
    }

    /// Same as [`CallState::abort`], but done-callback panics propagate to
    /// the calling thread (spec §4.E) — used by
    /// `SingleThreadedCall::cancel`, which runs on the application's own
    /// thread.
    pub fn abort_propagating(&self, code: StatusCode, details: impl Into<String>, cancelled: bool) -> bool {
        let (transitioned, fired) = self.apply_abort(code, details, cancelled);
        Self::dispatch_callbacks(fired, false);
        transitioned
    }

    fn apply_abort(&self, code: StatusCode, details: impl Into<String>, cancelled: bool) -> (bool, Vec<DoneCallback>) {
        let mut fired: Vec<DoneCallback> = Vec::new();
        let transitioned;
        {
            let mut guard = self.lock();
            if guard.code.is_some() {
                transitioned = false;
            } else {
                guard.code = Some(code);
                guard.details = details.into();
                guard.trailing_metadata.get_or_insert_with(Metadata::new);
                if cancelled {
                    guard.cancelled = true;
                }
                if !guard.callbacks_fired {
                    guard.callbacks_fired = true;
                    fired = std::mem::take(&mut guard.callbacks);
                }
                transitioned = true;
            }
            self.notify_all();
        }
        (transitioned, fired)
    }

    /// Register `cb` to fire once the call is terminal. If already
    /// terminal, the caller must invoke it synchronously itself (outside
    /// any lock) — see `Rendezvous::add_done_callback` in the rendezvous
    /// variants, which is where that distinction actually lives.
    pub fn push_callback_if_pending(&self, cb: DoneCallback) -> Option<DoneCallback> {
        let mut guard = self.lock();
        if guard.code.is_some() {
            Some(cb)
        } else {
            guard.callbacks.push(cb);
            None
        }
    }

    pub fn cancelled(&self) -> bool {
        self.lock().cancelled
    }

    pub fn response_snapshot(&self) -> Option<Vec<u8>> {
        self.lock().response.take()
    }

    pub fn due_contains(&self, kind: OpType) -> bool {
        self.lock().due.contains(&kind)
    }
}

impl EventHandler for CallState {
    fn handle(&self, event: CompletionEvent) -> bool {
        self.handle_event(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::RpcStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn event_with_status(code: StatusCode) -> CompletionEvent {
        CompletionEvent::new(
            vec![(
                OpType::ReceiveStatusOnClient,
                OpResult::Status(RpcStatus::new(code, "details")),
            )],
            true,
        )
    }

    #[test]
    fn finality_first_status_wins() {
        let state = CallState::new(HashSet::new());
        state.handle_event(event_with_status(StatusCode::Ok));
        state.handle_event(event_with_status(StatusCode::Internal));
        assert_eq!(state.wait_for_code(), StatusCode::Ok);
    }

    #[test]
    fn callbacks_fire_exactly_once() {
        let state = Arc::new(CallState::new(HashSet::new()));
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = count.clone();
            let cb: DoneCallback = Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
            assert!(state.push_callback_if_pending(cb).is_none());
        }
        state.handle_event(event_with_status(StatusCode::Ok));
        assert_eq!(count.load(Ordering::SeqCst), 3);

        // A second terminal event must not re-fire anything.
        state.handle_event(event_with_status(StatusCode::Internal));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn abort_is_idempotent() {
        let state = CallState::new(HashSet::new());
        assert!(state.abort(StatusCode::Cancelled, "Locally cancelled by application!", true));
        assert!(!state.abort(StatusCode::Cancelled, "Locally cancelled by application!", true));
        assert_eq!(state.wait_for_code(), StatusCode::Cancelled);
        assert!(state.cancelled());
    }

    #[test]
    fn message_observed_before_terminal_on_tied_event() {
        let state = CallState::new(HashSet::new());
        let event = CompletionEvent::new(
            vec![
                (OpType::ReceiveMessage, OpResult::Message(Some(b"hi".to_vec()))),
                (
                    OpType::ReceiveStatusOnClient,
                    OpResult::Status(RpcStatus::ok()),
                ),
            ],
            true,
        );
        state.handle_event(event);
        assert_eq!(state.response_snapshot(), Some(b"hi".to_vec()));
        assert_eq!(state.wait_for_code(), StatusCode::Ok);
    }
}
