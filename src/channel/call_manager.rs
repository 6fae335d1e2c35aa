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

//! Channel call manager (spec §4.F) and channel spin worker (spec §4.G).
//!
//! One spin worker per channel drains the channel-wide completion queue and
//! dispatches each event to the handler its batch was tagged with. Its
//! lifecycle is ref-counted against the number of managed (integrated)
//! calls still in flight: it is spawned when that count rises from 0 to 1,
//! and exits when it falls back to 0 (spec §3 "Channel call state", §8
//! property 7).

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::debug;

use crate::call::CallState;
use crate::fork;
use crate::op::{Batch, EventTag, OpType};
use crate::transport::{CallParams, ChannelEventOutcome, Transport, TransportCall};

pub(crate) struct ChannelCallManager {
    transport: Arc<dyn Transport>,
    managed: Mutex<usize>,
    spin: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelCallManager {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<ChannelCallManager> {
        Arc::new(ChannelCallManager {
            transport,
            managed: Mutex::new(0),
            spin: Mutex::new(None),
        })
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Spec §4.F `create`: ask the transport to create an integrated call
    /// with the initial batch tagged with the call's own state, then bump
    /// the managed-call count (spawning the spin worker on 0 -> 1).
    pub fn create(
        self: &Arc<Self>,
        params: CallParams<'_>,
        initial_due: HashSet<OpType>,
        initial_batch: Batch,
    ) -> (Arc<CallState>, Arc<dyn TransportCall>) {
        let state = Arc::new(CallState::new(initial_due));
        let tag: EventTag = state.clone();
        let call = self.transport.integrated_call(params, initial_batch, tag);
        self.register_call();
        (state, call)
    }

    fn register_call(self: &Arc<Self>) {
        let mut count = self.managed.lock().unwrap();
        *count += 1;
        if *count == 1 {
            self.spawn_spin_worker();
        }
    }

    fn spawn_spin_worker(self: &Arc<Self>) {
        let this = self.clone();
        let handle = thread::Builder::new()
            .name("grpc-channel-spin".to_owned())
            .spawn(move || this.spin_loop())
            .expect("failed to spawn channel spin worker");
        *self.spin.lock().unwrap() = Some(handle);
        debug!("channel spin worker started");
    }

    fn spin_loop(self: Arc<Self>) {
        let epoch = fork::current_epoch();
        loop {
            fork::block_if_fork_in_progress();
            if fork::current_epoch() != epoch {
                debug!("fork epoch advanced; spin worker exiting");
                break;
            }
            match self.transport.next_call_event() {
                ChannelEventOutcome::Timeout => continue,
                ChannelEventOutcome::QueueShutdown => {
                    debug!("channel completion queue shut down; spin worker exiting");
                    break;
                }
                ChannelEventOutcome::Event(tag, event) => {
                    let completed = tag.handle(event);
                    if completed {
                        let mut count = self.managed.lock().unwrap();
                        debug_assert!(*count > 0);
                        *count -= 1;
                        if *count == 0 {
                            debug!("managed call count reached 0; spin worker exiting");
                            break;
                        }
                    }
                }
            }
        }
        // Detach the handle now that this thread is about to return, so
        // `has_spin_worker`/a future 0 -> 1 transition reflects reality
        // instead of the last-spawned thread's now-stale handle.
        *self.spin.lock().unwrap() = None;
    }

    #[cfg(test)]
    pub(crate) fn managed_call_count(&self) -> usize {
        *self.managed.lock().unwrap()
    }

    #[cfg(test)]
    pub(crate) fn has_spin_worker(&self) -> bool {
        self.spin.lock().unwrap().is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::time::Duration;

    use super::*;
    use crate::metadata::Metadata;
    use crate::op::{CompletionEvent, OpResult};
    use crate::status::{RpcStatus, StatusCode};
    use crate::transport::CallEventOutcome;

    /// Single-call stub transport: `integrated_call` completes immediately
    /// with a full terminal event, queued for the spin worker to pick up.
    struct StubTransport {
        tx: Sender<(EventTag, CompletionEvent)>,
        rx: Mutex<Receiver<(EventTag, CompletionEvent)>>,
    }

    impl StubTransport {
        fn new() -> Arc<StubTransport> {
            let (tx, rx) = mpsc::channel();
            Arc::new(StubTransport {
                tx,
                rx: Mutex::new(rx),
            })
        }
    }

    struct StubCall;

    impl TransportCall for StubCall {
        fn operate(&self, _batch: Batch, _tag: EventTag) -> bool {
            true
        }

        fn next_event(&self) -> crate::transport::CallEventOutcome {
            CallEventOutcome::Timeout
        }

        fn cancel(&self, _code: StatusCode, _details: &str) {}
    }

    impl Transport for StubTransport {
        fn segregated_call(&self, _params: CallParams<'_>) -> Arc<dyn TransportCall> {
            Arc::new(StubCall)
        }

        fn integrated_call(
            &self,
            _params: CallParams<'_>,
            initial_batch: Batch,
            tag: EventTag,
        ) -> Arc<dyn TransportCall> {
            let completed = initial_batch
                .ops()
                .iter()
                .map(|op| {
                    let result = match op.kind {
                        OpType::ReceiveStatusOnClient => OpResult::Status(RpcStatus::ok()),
                        OpType::ReceiveInitialMetadata => OpResult::InitialMetadata(Metadata::new()),
                        OpType::ReceiveMessage => OpResult::Message(Some(Vec::new())),
                        _ => OpResult::Sent,
                    };
                    (op.kind, result)
                })
                .collect();
            self.tx
                .send((tag, CompletionEvent::new(completed, true)))
                .unwrap();
            Arc::new(StubCall)
        }

        fn next_call_event(&self) -> ChannelEventOutcome {
            match self.rx.lock().unwrap().recv_timeout(Duration::from_millis(50)) {
                Ok((tag, event)) => ChannelEventOutcome::Event(tag, event),
                Err(mpsc::RecvTimeoutError::Timeout) => ChannelEventOutcome::Timeout,
                Err(mpsc::RecvTimeoutError::Disconnected) => ChannelEventOutcome::QueueShutdown,
            }
        }

        fn check_connectivity_state(&self, _try_to_connect: bool) -> crate::transport::ConnectivityLevel {
            crate::transport::ConnectivityLevel::Ready
        }

        fn watch_connectivity_state(
            &self,
            _current: crate::transport::ConnectivityLevel,
            _deadline: Duration,
        ) -> bool {
            false
        }

        fn close(&self, _code: StatusCode, _details: &str) {}
    }

    fn params() -> CallParams<'static> {
        CallParams {
            flags: crate::metadata::CallFlags::new(),
            method: "/svc/Method",
            host: None,
            deadline: None,
            metadata: Metadata::new(),
            creds: None,
            trace_context: crate::transport::TraceContext::default(),
        }
    }

    /// Spec §8 property 7: the spin worker exists iff `managedCalls > 0`.
    #[test]
    fn spin_worker_lifecycle_tracks_managed_call_count() {
        let manager = ChannelCallManager::new(StubTransport::new());
        assert_eq!(manager.managed_call_count(), 0);
        assert!(!manager.has_spin_worker());

        let batch = Batch::unary_unary(Metadata::new(), Vec::new(), Default::default());
        let due = batch.due_set();
        manager.create(params(), due, batch);
        assert_eq!(manager.managed_call_count(), 1);
        assert!(manager.has_spin_worker());

        for _ in 0..200 {
            if manager.managed_call_count() == 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(manager.managed_call_count(), 0);

        for _ in 0..200 {
            if !manager.has_spin_worker() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!manager.has_spin_worker(), "spin worker should exit once managed count returns to 0");
    }
}
