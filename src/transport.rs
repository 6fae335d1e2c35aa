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

//! The `Transport` interface consumed by this crate (spec §6).
//!
//! HTTP/2 framing, TLS, and flow control are explicitly out of scope (spec
//! §1): this module only states the contract the invocation core drives.
//! `grpcio` plays this role against `grpc_sys`'s C core (`src/channel.rs`,
//! `src/call/mod.rs`); here it is a trait so the core can be exercised
//! against an in-memory fake in tests.

use std::sync::Arc;
use std::time::Duration;

use crate::metadata::{CallFlags, Metadata};
use crate::op::{Batch, CompletionEvent, EventTag};
use crate::status::StatusCode;

/// Connectivity levels a channel can be in (spec §3 "Connectivity state").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectivityLevel {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

/// Parent trace context, carrying the ambient deadline used in spec §4.J's
/// deadline arithmetic. Distributed tracing itself is out of scope; this is
/// the one field that arithmetic needs.
#[derive(Clone, Copy, Debug, Default)]
pub struct TraceContext {
    pub parent_deadline: Option<Duration>,
}

/// Opaque call credentials. Credential schemes are out of scope (spec §1);
/// this is a marker the transport is handed verbatim.
pub trait CallCredentials: Send + Sync {}

/// Opaque channel credentials, same rationale as [`CallCredentials`].
pub trait ChannelCredentials: Send + Sync {}

/// The parameters needed to create a call, mirroring the `Transport`
/// interface signature in spec §6 (`propFlags, method, host, deadline,
/// metadata, creds`).
pub struct CallParams<'a> {
    pub flags: CallFlags,
    pub method: &'static str,
    pub host: Option<&'a str>,
    pub deadline: Option<Duration>,
    pub metadata: Metadata,
    pub creds: Option<&'a dyn CallCredentials>,
    pub trace_context: TraceContext,
}

/// Outcome of a segregated call's own `next_event`: either a completion, or
/// a bookkeeping timeout the caller should loop past (spec §4.G step 2).
pub enum CallEventOutcome {
    Event(CompletionEvent),
    Timeout,
    /// The completion queue has been shut down; no more events will arrive.
    QueueShutdown,
}

/// Outcome of the channel-wide queue's `next_call_event`. Unlike a
/// segregated call's events, these carry the tag the event belongs to
/// (spec §3: "for the channel spin worker, the tag is the event-handler to
/// invoke").
pub enum ChannelEventOutcome {
    Event(EventTag, CompletionEvent),
    Timeout,
    QueueShutdown,
}

/// A single in-flight call. Obtained from [`Transport::segregated_call`] or
/// [`Transport::integrated_call`].
pub trait TransportCall: Send + Sync {
    /// Submit a batch, tagged with `tag`. Returns whether the transport
    /// accepted it; on rejection no completion will ever arrive for it
    /// (spec §4.A).
    fn operate(&self, batch: Batch, tag: EventTag) -> bool;

    /// Segregated-call-only: block for this call's own next event.
    fn next_event(&self) -> CallEventOutcome;

    fn cancel(&self, code: StatusCode, details: &str);
}

/// The transport a channel drives. Out of scope per spec §1: this is the
/// contract, not an implementation.
pub trait Transport: Send + Sync {
    /// A call bound to its own private completion queue (used by the
    /// single-threaded rendezvous, spec §4.E).
    fn segregated_call(&self, params: CallParams<'_>) -> Arc<dyn TransportCall>;

    /// A call bound to the channel's shared completion queue, with its
    /// initial batch submitted atomically at creation and tagged with
    /// `tag` (spec §4.F).
    fn integrated_call(
        &self,
        params: CallParams<'_>,
        initial_batch: Batch,
        tag: EventTag,
    ) -> Arc<dyn TransportCall>;

    /// Block until the channel's shared completion queue yields an event
    /// (spec §4.G). This is the channel spin worker's only I/O wait.
    fn next_call_event(&self) -> ChannelEventOutcome;

    fn check_connectivity_state(&self, try_to_connect: bool) -> ConnectivityLevel;

    /// Block (up to `deadline`) for the connectivity level to change from
    /// `current`. Returns whether it did.
    fn watch_connectivity_state(&self, current: ConnectivityLevel, deadline: Duration) -> bool;

    fn close(&self, code: StatusCode, details: &str);
}
