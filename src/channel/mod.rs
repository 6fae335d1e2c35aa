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

//! The channel façade (spec §4.J): binds the call manager, connectivity
//! engine and per-call configuration together and exposes the public surface
//! (`unary_unary`, `unary_stream`, `stream_unary`, `stream_stream`,
//! `subscribe`, `unsubscribe`, `close`).

mod call_manager;
mod connectivity;

pub(crate) use call_manager::ChannelCallManager;
pub use connectivity::ConnectivityCallback;
use connectivity::ConnectivityState;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::codec::Marshaller;
use crate::metadata::{CallFlags, Metadata};
use crate::multicallable::{
    StreamStreamMultiCallable, StreamUnaryMultiCallable, UnaryStreamMultiCallable,
    UnaryUnaryMultiCallable,
};
use crate::status::StatusCode;
use crate::transport::{CallCredentials, CallParams, ConnectivityLevel, TraceContext, Transport};

const ENV_SINGLE_THREADED_UNARY_STREAM: &str = "GRPC_SINGLE_THREADED_UNARY_STREAM";

/// Per-channel configuration (spec §6 "Configuration options"), generalizing
/// `grpcio::ChannelBuilder`'s options map (`src/channel.rs`)
/// to the fixed table this spec names.
#[derive(Clone, Debug, Default)]
pub struct ChannelOptions {
    pub single_threaded_unary_stream: bool,
    pub primary_user_agent_string: Option<String>,
    /// Channel-default compression, layered onto per-call metadata (spec §6:
    /// "a channel argument that augments per-call metadata").
    pub compression: Option<Vec<u8>>,
}

/// Builds a [`Channel`] from a [`Transport`] and [`ChannelOptions`], the way
/// `grpcio::ChannelBuilder` chains setters before `connect()`.
pub struct ChannelBuilder {
    options: ChannelOptions,
}

impl ChannelBuilder {
    pub fn new() -> ChannelBuilder {
        ChannelBuilder {
            options: ChannelOptions {
                single_threaded_unary_stream: std::env::var_os(ENV_SINGLE_THREADED_UNARY_STREAM)
                    .is_some(),
                primary_user_agent_string: None,
                compression: None,
            },
        }
    }

    pub fn single_threaded_unary_stream(mut self, enabled: bool) -> ChannelBuilder {
        self.options.single_threaded_unary_stream = enabled;
        self
    }

    pub fn primary_user_agent_string(mut self, agent: impl Into<String>) -> ChannelBuilder {
        self.options.primary_user_agent_string = Some(agent.into());
        self
    }

    pub fn compression(mut self, compression: impl Into<Vec<u8>>) -> ChannelBuilder {
        self.options.compression = Some(compression.into());
        self
    }

    pub fn build(self, transport: Arc<dyn Transport>) -> Arc<Channel> {
        Channel::new(transport, self.options)
    }
}

impl Default for ChannelBuilder {
    fn default() -> ChannelBuilder {
        ChannelBuilder::new()
    }
}

/// Per-call configuration, mirroring `grpcio::CallOption` (`src/call/mod.rs`).
#[derive(Clone, Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub metadata: Metadata,
    pub creds: Option<Arc<dyn CallCredentials>>,
    pub wait_for_ready: Option<bool>,
    /// Per-call compression override, overriding the channel default the
    /// same way (spec §6); layered onto metadata at call time.
    pub compression: Option<Vec<u8>>,
}

impl CallOptions {
    pub fn new() -> CallOptions {
        CallOptions::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> CallOptions {
        self.timeout = Some(timeout);
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> CallOptions {
        self.metadata = metadata;
        self
    }

    pub fn creds(mut self, creds: Arc<dyn CallCredentials>) -> CallOptions {
        self.creds = Some(creds);
        self
    }

    pub fn wait_for_ready(mut self, wait_for_ready: bool) -> CallOptions {
        self.wait_for_ready = Some(wait_for_ready);
        self
    }

    pub fn compression(mut self, compression: impl Into<Vec<u8>>) -> CallOptions {
        self.compression = Some(compression.into());
        self
    }
}

const COMPRESSION_METADATA_KEY: &str = "grpc-internal-encoding-request";
const USER_AGENT_METADATA_KEY: &str = "user-agent";

/// Deadline arithmetic (spec §4.J): the sooner of the ambient parent
/// deadline and the caller-supplied one; absent if neither is set.
fn effective_deadline(parent: Option<Duration>, user: Option<Duration>) -> Option<Duration> {
    match (parent, user) {
        (None, None) => None,
        (Some(p), None) => Some(p),
        (None, Some(u)) => Some(u),
        (Some(p), Some(u)) => Some(p.min(u)),
    }
}

/// User-Agent composition, appending this crate's own identity after any
/// caller-supplied primary string.
fn format_user_agent_string(primary: Option<&str>) -> String {
    match primary {
        Some(primary) => format!("{} grpc-rust/{}", primary, env!("CARGO_PKG_VERSION")),
        None => format!("grpc-rust/{}", env!("CARGO_PKG_VERSION")),
    }
}

/// The channel façade. Binds a [`Transport`] to the call manager (§4.F/G)
/// and connectivity engine (§4.H), and is the entry point multicallables are
/// obtained from.
pub struct Channel {
    transport: Arc<dyn Transport>,
    call_manager: Arc<ChannelCallManager>,
    connectivity: Arc<ConnectivityState>,
    options: ChannelOptions,
    user_agent: String,
    closed: AtomicBool,
}

impl Channel {
    fn new(transport: Arc<dyn Transport>, options: ChannelOptions) -> Arc<Channel> {
        let user_agent = format_user_agent_string(options.primary_user_agent_string.as_deref());
        Arc::new(Channel {
            call_manager: ChannelCallManager::new(transport.clone()),
            connectivity: ConnectivityState::new(transport.clone()),
            transport,
            options,
            user_agent,
            closed: AtomicBool::new(false),
        })
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn call_manager(&self) -> &Arc<ChannelCallManager> {
        &self.call_manager
    }

    /// Build the metadata/flags/deadline a call is submitted with: the
    /// caller's own metadata, augmented with the user-agent header and any
    /// compression setting (per-call overriding channel-default), plus
    /// deadline arithmetic against the ambient trace context (spec §4.J).
    pub(crate) fn build_call_params<'a>(
        &self,
        method: &'static str,
        opts: &'a CallOptions,
        trace_context: TraceContext,
    ) -> CallParams<'a> {
        let mut metadata = opts.metadata.clone();
        metadata.push(USER_AGENT_METADATA_KEY, self.user_agent.clone());
        if let Some(compression) = opts.compression.as_ref().or(self.options.compression.as_ref()) {
            metadata.push(COMPRESSION_METADATA_KEY, compression.clone());
        }

        CallParams {
            flags: CallFlags::new().with_wait_for_ready(opts.wait_for_ready),
            method,
            host: None,
            deadline: effective_deadline(trace_context.parent_deadline, opts.timeout),
            metadata,
            creds: opts.creds.as_deref(),
            trace_context,
        }
    }

    pub fn unary_unary<Req, Resp>(
        self: &Arc<Self>,
        method: &'static str,
        req_marshaller: Marshaller<Req>,
        resp_marshaller: Marshaller<Resp>,
    ) -> UnaryUnaryMultiCallable<Req, Resp> {
        UnaryUnaryMultiCallable::new(self.clone(), method, req_marshaller, resp_marshaller)
    }

    pub fn unary_stream<Req, Resp>(
        self: &Arc<Self>,
        method: &'static str,
        req_marshaller: Marshaller<Req>,
        resp_marshaller: Marshaller<Resp>,
    ) -> UnaryStreamMultiCallable<Req, Resp> {
        UnaryStreamMultiCallable::new(self.clone(), method, req_marshaller, resp_marshaller)
    }

    pub fn stream_unary<Req, Resp>(
        self: &Arc<Self>,
        method: &'static str,
        req_marshaller: Marshaller<Req>,
        resp_marshaller: Marshaller<Resp>,
    ) -> StreamUnaryMultiCallable<Req, Resp> {
        StreamUnaryMultiCallable::new(self.clone(), method, req_marshaller, resp_marshaller)
    }

    pub fn stream_stream<Req, Resp>(
        self: &Arc<Self>,
        method: &'static str,
        req_marshaller: Marshaller<Req>,
        resp_marshaller: Marshaller<Resp>,
    ) -> StreamStreamMultiCallable<Req, Resp> {
        StreamStreamMultiCallable::new(self.clone(), method, req_marshaller, resp_marshaller)
    }

    pub fn subscribe(self: &Arc<Self>, callback: ConnectivityCallback, try_to_connect: bool) {
        self.connectivity.subscribe(callback, try_to_connect);
    }

    pub fn unsubscribe(&self, callback: &ConnectivityCallback) {
        self.connectivity.unsubscribe(callback);
    }

    pub fn check_connectivity_state(&self, try_to_connect: bool) -> ConnectivityLevel {
        self.transport.check_connectivity_state(try_to_connect)
    }

    /// Resource release (spec §5): drains subscribers and cancels all
    /// outstanding calls at the transport.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connectivity.clear();
        self.transport
            .close(StatusCode::Unavailable, "Channel closed!");
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_deadline_picks_the_sooner_one() {
        let a = Duration::from_secs(5);
        let b = Duration::from_secs(2);
        assert_eq!(effective_deadline(Some(a), Some(b)), Some(b));
        assert_eq!(effective_deadline(None, Some(b)), Some(b));
        assert_eq!(effective_deadline(Some(a), None), Some(a));
        assert_eq!(effective_deadline(None, None), None);
    }

    #[test]
    fn user_agent_prepends_primary_string() {
        let composed = format_user_agent_string(Some("my-app/1.0"));
        assert!(composed.starts_with("my-app/1.0 grpc-rust/"));
        let default_only = format_user_agent_string(None);
        assert!(default_only.starts_with("grpc-rust/"));
    }
}
