// In-memory fake transport (see SPEC_FULL.md "Test tooling"). Implements
// `Transport`/`TransportCall` entirely in memory, driven by small scripted
// `Script` objects registered per method, so the scenarios in spec.md §8 can
// be exercised without a real network stack.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use grpc_invoke_core::metadata::Metadata;
use grpc_invoke_core::op::{Batch, CompletionEvent, EventTag, OpResult, OpType};
use grpc_invoke_core::status::{RpcStatus, StatusCode};
use grpc_invoke_core::transport::{
    CallEventOutcome, CallParams, ChannelEventOutcome, ConnectivityLevel, Transport, TransportCall,
};

/// Produces the completion event a submitted batch should yield. Scripts own
/// whatever state they need (e.g. a queue of response messages) behind
/// interior mutability, since `respond` takes `&self`.
pub trait Script: Send + Sync {
    fn respond(&self, batch: &Batch) -> CompletionEvent;
}

fn sent_result(kind: OpType) -> (OpType, OpResult) {
    (kind, OpResult::Sent)
}

/// Completes every op in one shot: a single-response script for unary-unary
/// calls (spec §8 scenario S1, property 8 round-trip).
pub struct EchoScript {
    response: Mutex<Option<Vec<u8>>>,
}

impl EchoScript {
    pub fn new(response: Vec<u8>) -> EchoScript {
        EchoScript {
            response: Mutex::new(Some(response)),
        }
    }
}

impl Script for EchoScript {
    fn respond(&self, batch: &Batch) -> CompletionEvent {
        let mut completed = Vec::new();
        for op in batch.ops() {
            match op.kind {
                OpType::SendInitialMetadata | OpType::SendMessage | OpType::SendCloseFromClient => {
                    completed.push(sent_result(op.kind));
                }
                OpType::ReceiveInitialMetadata => {
                    completed.push((op.kind, OpResult::InitialMetadata(Metadata::new())));
                }
                OpType::ReceiveMessage => {
                    let msg = self.response.lock().unwrap().take();
                    completed.push((op.kind, OpResult::Message(msg)));
                }
                OpType::ReceiveStatusOnClient => {
                    completed.push((op.kind, OpResult::Status(RpcStatus::ok())));
                }
            }
        }
        CompletionEvent::new(completed, true)
    }
}

/// A script that fails the call with a fixed status the moment its batch is
/// submitted (spec §8 scenario S2, and generally any non-OK unary-unary
/// case). `ReceiveMessage` never completes.
pub struct FailScript {
    status: RpcStatus,
}

impl FailScript {
    pub fn new(status: RpcStatus) -> FailScript {
        FailScript { status }
    }
}

impl Script for FailScript {
    fn respond(&self, batch: &Batch) -> CompletionEvent {
        let mut completed = Vec::new();
        for op in batch.ops() {
            match op.kind {
                OpType::SendInitialMetadata | OpType::SendMessage | OpType::SendCloseFromClient => {
                    completed.push(sent_result(op.kind));
                }
                OpType::ReceiveInitialMetadata => {
                    completed.push((op.kind, OpResult::InitialMetadata(Metadata::new())));
                }
                OpType::ReceiveMessage => {}
                OpType::ReceiveStatusOnClient => {
                    completed.push((op.kind, OpResult::Status(self.status.clone())));
                }
            }
        }
        CompletionEvent::new(completed, true)
    }
}

/// Drip-feeds a fixed list of messages one at a time as `ReceiveMessage` ops
/// arrive (the rendezvous submits one per `next()` call), completing with
/// `final_status` once the list is exhausted (spec §8 scenario S3).
pub struct StreamScript {
    messages: Mutex<std::collections::VecDeque<Vec<u8>>>,
    final_status: RpcStatus,
}

impl StreamScript {
    pub fn new(messages: Vec<Vec<u8>>, final_status: RpcStatus) -> StreamScript {
        StreamScript {
            messages: Mutex::new(messages.into()),
            final_status,
        }
    }
}

impl Script for StreamScript {
    fn respond(&self, batch: &Batch) -> CompletionEvent {
        let mut completed = Vec::new();
        for op in batch.ops() {
            match op.kind {
                OpType::SendInitialMetadata | OpType::SendMessage | OpType::SendCloseFromClient => {
                    completed.push(sent_result(op.kind));
                }
                OpType::ReceiveInitialMetadata => {
                    completed.push((op.kind, OpResult::InitialMetadata(Metadata::new())));
                }
                OpType::ReceiveMessage => {
                    let mut messages = self.messages.lock().unwrap();
                    let next = messages.pop_front();
                    let exhausted = next.is_none();
                    completed.push((op.kind, OpResult::Message(next)));
                    if exhausted {
                        completed.push((
                            OpType::ReceiveStatusOnClient,
                            OpResult::Status(self.final_status.clone()),
                        ));
                    }
                }
                OpType::ReceiveStatusOnClient => {}
            }
        }
        CompletionEvent::new(completed, true)
    }
}

/// Acks every `SendMessage` immediately and counts how many are
/// simultaneously outstanding — used to verify per-message backpressure
/// (spec §8 scenario S5). Completes the (single) response only once
/// `SendCloseFromClient` arrives.
pub struct CountingStreamUnaryScript {
    response: Vec<u8>,
    outstanding: Mutex<usize>,
    max_outstanding_seen: Mutex<usize>,
    total_sent: Mutex<usize>,
}

impl CountingStreamUnaryScript {
    pub fn new(response: Vec<u8>) -> CountingStreamUnaryScript {
        CountingStreamUnaryScript {
            response,
            outstanding: Mutex::new(0),
            max_outstanding_seen: Mutex::new(0),
            total_sent: Mutex::new(0),
        }
    }

    pub fn max_outstanding(&self) -> usize {
        *self.max_outstanding_seen.lock().unwrap()
    }

    pub fn total_sent(&self) -> usize {
        *self.total_sent.lock().unwrap()
    }
}

impl Script for CountingStreamUnaryScript {
    fn respond(&self, batch: &Batch) -> CompletionEvent {
        let mut completed = Vec::new();
        for op in batch.ops() {
            match op.kind {
                OpType::SendInitialMetadata => completed.push(sent_result(op.kind)),
                OpType::ReceiveInitialMetadata => {
                    completed.push((op.kind, OpResult::InitialMetadata(Metadata::new())));
                }
                OpType::SendMessage => {
                    let mut outstanding = self.outstanding.lock().unwrap();
                    *outstanding += 1;
                    let mut max_seen = self.max_outstanding_seen.lock().unwrap();
                    *max_seen = (*max_seen).max(*outstanding);
                    *self.total_sent.lock().unwrap() += 1;
                    *outstanding -= 1;
                    completed.push(sent_result(op.kind));
                }
                OpType::SendCloseFromClient => {
                    completed.push(sent_result(op.kind));
                    completed.push((OpType::ReceiveMessage, OpResult::Message(Some(self.response.clone()))));
                    completed.push((OpType::ReceiveStatusOnClient, OpResult::Status(RpcStatus::ok())));
                }
                OpType::ReceiveMessage | OpType::ReceiveStatusOnClient => {}
            }
        }
        CompletionEvent::new(completed, true)
    }
}

struct SegregatedFakeCall {
    script: Arc<dyn Script>,
    tx: Sender<CompletionEvent>,
    rx: Mutex<Receiver<CompletionEvent>>,
}

impl TransportCall for SegregatedFakeCall {
    fn operate(&self, batch: Batch, _tag: EventTag) -> bool {
        let event = self.script.respond(&batch);
        self.tx.send(event).is_ok()
    }

    fn next_event(&self) -> CallEventOutcome {
        match self.rx.lock().unwrap().recv_timeout(Duration::from_millis(50)) {
            Ok(event) => CallEventOutcome::Event(event),
            Err(mpsc::RecvTimeoutError::Timeout) => CallEventOutcome::Timeout,
            Err(mpsc::RecvTimeoutError::Disconnected) => CallEventOutcome::QueueShutdown,
        }
    }

    fn cancel(&self, _code: StatusCode, _details: &str) {
        // The rendezvous already transitions its own state synchronously
        // (spec §5 "Cancellation"); nothing further to simulate here.
    }
}

struct IntegratedFakeCall {
    script: Arc<dyn Script>,
    tag: EventTag,
    channel_tx: Sender<(EventTag, CompletionEvent)>,
}

impl TransportCall for IntegratedFakeCall {
    fn operate(&self, batch: Batch, tag: EventTag) -> bool {
        let event = self.script.respond(&batch);
        self.channel_tx.send((tag, event)).is_ok()
    }

    fn next_event(&self) -> CallEventOutcome {
        CallEventOutcome::Timeout
    }

    fn cancel(&self, _code: StatusCode, _details: &str) {}
}

/// Registers a [`Script`] factory for a method name; each call to that
/// method gets a fresh script instance.
type ScriptFactory = Box<dyn Fn() -> Arc<dyn Script> + Send + Sync>;

pub struct FakeTransport {
    factories: Mutex<HashMap<&'static str, ScriptFactory>>,
    channel_tx: Sender<(EventTag, CompletionEvent)>,
    channel_rx: Mutex<Receiver<(EventTag, CompletionEvent)>>,
    connectivity: Mutex<ConnectivityLevel>,
    connectivity_cv: Condvar,
    closed: AtomicBool,
}

impl FakeTransport {
    pub fn new() -> Arc<FakeTransport> {
        let (channel_tx, channel_rx) = mpsc::channel();
        Arc::new(FakeTransport {
            factories: Mutex::new(HashMap::new()),
            channel_tx,
            channel_rx: Mutex::new(channel_rx),
            connectivity: Mutex::new(ConnectivityLevel::Idle),
            connectivity_cv: Condvar::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn register(&self, method: &'static str, factory: impl Fn() -> Arc<dyn Script> + Send + Sync + 'static) {
        self.factories.lock().unwrap().insert(method, Box::new(factory));
    }

    fn script_for(&self, method: &str) -> Arc<dyn Script> {
        let factories = self.factories.lock().unwrap();
        (factories.get(method).expect("no script registered for method"))()
    }

    pub fn set_connectivity(&self, level: ConnectivityLevel) {
        *self.connectivity.lock().unwrap() = level;
        self.connectivity_cv.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Transport for FakeTransport {
    fn segregated_call(&self, params: CallParams<'_>) -> Arc<dyn TransportCall> {
        let script = self.script_for(params.method);
        let (tx, rx) = mpsc::channel();
        Arc::new(SegregatedFakeCall {
            script,
            tx,
            rx: Mutex::new(rx),
        })
    }

    fn integrated_call(
        &self,
        params: CallParams<'_>,
        initial_batch: Batch,
        tag: EventTag,
    ) -> Arc<dyn TransportCall> {
        let script = self.script_for(params.method);
        let call = Arc::new(IntegratedFakeCall {
            script,
            tag: tag.clone(),
            channel_tx: self.channel_tx.clone(),
        });
        call.operate(initial_batch, tag);
        call
    }

    fn next_call_event(&self) -> ChannelEventOutcome {
        match self
            .channel_rx
            .lock()
            .unwrap()
            .recv_timeout(Duration::from_millis(50))
        {
            Ok((tag, event)) => ChannelEventOutcome::Event(tag, event),
            Err(mpsc::RecvTimeoutError::Timeout) => ChannelEventOutcome::Timeout,
            Err(mpsc::RecvTimeoutError::Disconnected) => ChannelEventOutcome::QueueShutdown,
        }
    }

    fn check_connectivity_state(&self, _try_to_connect: bool) -> ConnectivityLevel {
        *self.connectivity.lock().unwrap()
    }

    fn watch_connectivity_state(&self, current: ConnectivityLevel, deadline: Duration) -> bool {
        let guard = self.connectivity.lock().unwrap();
        let (_guard, timeout) = self
            .connectivity_cv
            .wait_timeout_while(guard, deadline, |level| *level == current)
            .unwrap();
        !timeout.timed_out()
    }

    fn close(&self, _code: StatusCode, _details: &str) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
