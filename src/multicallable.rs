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

//! Multicallables (spec §4.F component table, row F): one per call
//! cardinality, assembling the canonical initial batch for that cardinality,
//! picking a rendezvous variant, and wiring up the dispatcher.

use std::sync::Arc;

use crate::call::multi_threaded::MultiThreadedCall;
use crate::call::pump::{self, RequestSource};
use crate::call::single_threaded::SingleThreadedCall;
use crate::call::CallState;
use crate::channel::{CallOptions, Channel};
use crate::codec::Marshaller;
use crate::error::{Error, Result};
use crate::metadata::Metadata;
use crate::op::{Batch, EventTag, WriteFlags};
use crate::status::StatusCode;
use crate::transport::TraceContext;

/// No distributed-tracing integration is in scope (spec §1); every call
/// starts from an empty trace context, so `build_call_params`'s deadline
/// arithmetic degenerates to "caller-supplied timeout only".
fn ambient_trace_context() -> TraceContext {
    TraceContext::default()
}

pub struct UnaryUnaryMultiCallable<Req, Resp> {
    channel: Arc<Channel>,
    method: &'static str,
    req_marshaller: Marshaller<Req>,
    resp_marshaller: Marshaller<Resp>,
}

impl<Req, Resp> UnaryUnaryMultiCallable<Req, Resp> {
    pub(crate) fn new(
        channel: Arc<Channel>,
        method: &'static str,
        req_marshaller: Marshaller<Req>,
        resp_marshaller: Marshaller<Resp>,
    ) -> UnaryUnaryMultiCallable<Req, Resp> {
        UnaryUnaryMultiCallable {
            channel,
            method,
            req_marshaller,
            resp_marshaller,
        }
    }

    /// Submit the call without blocking; returns the rendezvous immediately
    /// (spec §6 "future(...)").
    pub fn future(&self, req: &Req, opts: CallOptions) -> Result<Arc<MultiThreadedCall<Resp>>> {
        let bytes = (self.req_marshaller.ser)(req).map_err(Error::Codec)?;
        let params = self
            .channel
            .build_call_params(self.method, &opts, ambient_trace_context());
        let metadata = params.metadata.clone();
        let batch = Batch::unary_unary(metadata, bytes, WriteFlags::new());
        let due = batch.due_set();
        let (state, call) = self.channel.call_manager().create(params, due, batch);
        let tag: EventTag = state.clone();
        Ok(Arc::new(MultiThreadedCall::new(
            state,
            call,
            tag,
            self.resp_marshaller.de,
        )))
    }

    /// Blocking call: submit and wait for the terminal result.
    pub fn call(&self, req: &Req, opts: CallOptions) -> Result<Resp> {
        self.future(req, opts)?.result(None)
    }

    /// Blocking call that also hands back the rendezvous, e.g. to read
    /// trailing metadata after the response (spec §6 "with_call(...)").
    pub fn with_call(
        &self,
        req: &Req,
        opts: CallOptions,
    ) -> Result<(Resp, Arc<MultiThreadedCall<Resp>>)> {
        let call = self.future(req, opts)?;
        let resp = call.result(None)?;
        Ok((resp, call))
    }
}

/// Either rendezvous variant for a unary-request, streaming-response call,
/// chosen at call time by `ChannelOptions::single_threaded_unary_stream`
/// (spec §4.E).
pub enum UnaryStreamCall<Resp> {
    Multi(Arc<MultiThreadedCall<Resp>>),
    Single(Arc<SingleThreadedCall<Resp>>),
}

impl<Resp> UnaryStreamCall<Resp> {
    pub fn initial_metadata(&self) -> Metadata {
        match self {
            UnaryStreamCall::Multi(c) => c.initial_metadata(),
            UnaryStreamCall::Single(c) => c.initial_metadata(),
        }
    }

    pub fn trailing_metadata(&self) -> Metadata {
        match self {
            UnaryStreamCall::Multi(c) => c.trailing_metadata(),
            UnaryStreamCall::Single(c) => c.trailing_metadata(),
        }
    }

    pub fn code(&self) -> StatusCode {
        match self {
            UnaryStreamCall::Multi(c) => c.code(),
            UnaryStreamCall::Single(c) => c.code(),
        }
    }

    pub fn cancel(&self) -> bool {
        match self {
            UnaryStreamCall::Multi(c) => c.cancel(),
            UnaryStreamCall::Single(c) => c.cancel(),
        }
    }

    pub fn cancelled(&self) -> bool {
        match self {
            UnaryStreamCall::Multi(c) => c.cancelled(),
            UnaryStreamCall::Single(c) => c.cancelled(),
        }
    }

    pub fn done(&self) -> bool {
        match self {
            UnaryStreamCall::Multi(c) => c.done(),
            UnaryStreamCall::Single(c) => c.done(),
        }
    }

    /// Pull the next response message.
    pub fn next(&self) -> Option<Result<Resp>> {
        match self {
            UnaryStreamCall::Multi(c) => c.next_message(),
            UnaryStreamCall::Single(c) => c.next(),
        }
    }
}

pub struct UnaryStreamMultiCallable<Req, Resp> {
    channel: Arc<Channel>,
    method: &'static str,
    req_marshaller: Marshaller<Req>,
    resp_marshaller: Marshaller<Resp>,
}

impl<Req, Resp> UnaryStreamMultiCallable<Req, Resp> {
    pub(crate) fn new(
        channel: Arc<Channel>,
        method: &'static str,
        req_marshaller: Marshaller<Req>,
        resp_marshaller: Marshaller<Resp>,
    ) -> UnaryStreamMultiCallable<Req, Resp> {
        UnaryStreamMultiCallable {
            channel,
            method,
            req_marshaller,
            resp_marshaller,
        }
    }

    pub fn call(&self, req: &Req, opts: CallOptions) -> Result<UnaryStreamCall<Resp>> {
        let bytes = (self.req_marshaller.ser)(req).map_err(Error::Codec)?;
        let params = self
            .channel
            .build_call_params(self.method, &opts, ambient_trace_context());
        let metadata = params.metadata.clone();
        let batch = Batch::unary_stream(metadata, bytes, WriteFlags::new());
        let due = batch.due_set();

        if self.channel.options().single_threaded_unary_stream {
            let transport_call = self.channel.transport().segregated_call(params);
            let state = Arc::new(CallState::new(due));
            let tag: EventTag = state.clone();
            if !transport_call.operate(batch, tag) {
                return Err(Error::CallFailure);
            }
            Ok(UnaryStreamCall::Single(Arc::new(SingleThreadedCall::new(
                state,
                transport_call,
                self.resp_marshaller.de,
            ))))
        } else {
            let (state, call) = self.channel.call_manager().create(params, due, batch);
            let tag: EventTag = state.clone();
            Ok(UnaryStreamCall::Multi(Arc::new(MultiThreadedCall::new(
                state,
                call,
                tag,
                self.resp_marshaller.de,
            ))))
        }
    }
}

pub struct StreamUnaryMultiCallable<Req, Resp> {
    channel: Arc<Channel>,
    method: &'static str,
    req_marshaller: Marshaller<Req>,
    resp_marshaller: Marshaller<Resp>,
}

impl<Req, Resp> StreamUnaryMultiCallable<Req, Resp>
where
    Req: Send + 'static,
{
    pub(crate) fn new(
        channel: Arc<Channel>,
        method: &'static str,
        req_marshaller: Marshaller<Req>,
        resp_marshaller: Marshaller<Resp>,
    ) -> StreamUnaryMultiCallable<Req, Resp> {
        StreamUnaryMultiCallable {
            channel,
            method,
            req_marshaller,
            resp_marshaller,
        }
    }

    pub fn future<S>(&self, requests: S, opts: CallOptions) -> Result<Arc<MultiThreadedCall<Resp>>>
    where
        S: RequestSource<Req> + Send + 'static,
    {
        let params = self
            .channel
            .build_call_params(self.method, &opts, ambient_trace_context());
        let metadata = params.metadata.clone();
        let batch = Batch::stream_unary(metadata);
        let due = batch.due_set();
        let (state, call) = self.channel.call_manager().create(params, due, batch);
        let tag: EventTag = state.clone();
        let rendezvous = Arc::new(MultiThreadedCall::new(
            state.clone(),
            call.clone(),
            tag.clone(),
            self.resp_marshaller.de,
        ));
        let handle = pump::spawn(
            state,
            call,
            tag,
            requests,
            self.req_marshaller.ser,
            WriteFlags::new(),
        );
        rendezvous.attach_pump(handle);
        Ok(rendezvous)
    }

    pub fn call<S>(&self, requests: S, opts: CallOptions) -> Result<Resp>
    where
        S: RequestSource<Req> + Send + 'static,
    {
        self.future(requests, opts)?.result(None)
    }

    pub fn with_call<S>(
        &self,
        requests: S,
        opts: CallOptions,
    ) -> Result<(Resp, Arc<MultiThreadedCall<Resp>>)>
    where
        S: RequestSource<Req> + Send + 'static,
    {
        let call = self.future(requests, opts)?;
        let resp = call.result(None)?;
        Ok((resp, call))
    }
}

pub struct StreamStreamMultiCallable<Req, Resp> {
    channel: Arc<Channel>,
    method: &'static str,
    req_marshaller: Marshaller<Req>,
    resp_marshaller: Marshaller<Resp>,
}

impl<Req, Resp> StreamStreamMultiCallable<Req, Resp>
where
    Req: Send + 'static,
{
    pub(crate) fn new(
        channel: Arc<Channel>,
        method: &'static str,
        req_marshaller: Marshaller<Req>,
        resp_marshaller: Marshaller<Resp>,
    ) -> StreamStreamMultiCallable<Req, Resp> {
        StreamStreamMultiCallable {
            channel,
            method,
            req_marshaller,
            resp_marshaller,
        }
    }

    pub fn call<S>(&self, requests: S, opts: CallOptions) -> Result<Arc<MultiThreadedCall<Resp>>>
    where
        S: RequestSource<Req> + Send + 'static,
    {
        let params = self
            .channel
            .build_call_params(self.method, &opts, ambient_trace_context());
        let metadata = params.metadata.clone();
        let batch = Batch::stream_stream(metadata);
        let due = batch.due_set();
        let (state, call) = self.channel.call_manager().create(params, due, batch);
        let tag: EventTag = state.clone();
        let rendezvous = Arc::new(MultiThreadedCall::new(
            state.clone(),
            call.clone(),
            tag.clone(),
            self.resp_marshaller.de,
        ));
        let handle = pump::spawn(
            state,
            call,
            tag,
            requests,
            self.req_marshaller.ser,
            WriteFlags::new(),
        );
        rendezvous.attach_pump(handle);
        Ok(rendezvous)
    }
}
