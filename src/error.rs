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

use std::result;

use thiserror::Error;

use crate::status::RpcStatus;

/// Crate-wide result alias.
pub type Result<T> = result::Result<T, Error>;

/// Errors surfaced by the invocation core.
///
/// `RpcFailure` doubles as the "rendezvous is an error" value described in
/// spec §9: a terminated, non-OK call is represented by constructing this
/// variant from the call's stored [`RpcStatus`], not by inheriting from some
/// exception base.
#[derive(Debug, Error, Clone)]
pub enum Error {
    /// The call terminated with a non-OK status.
    #[error("RPC failed: {0}")]
    RpcFailure(RpcStatus),

    /// The caller cancelled the call locally before it terminated.
    #[error("RPC cancelled by application")]
    Cancelled,

    /// A batch completed with `success = false` and no status has arrived
    /// yet (spec §7, "transport operation refusal" / "remote stopped").
    #[error("remote stopped without a status")]
    RemoteStopped,

    /// Local (de)serialization failed; no transport interaction occurred.
    #[error("codec failure: {0}")]
    Codec(String),

    /// `Call::operate` refused to accept a batch synchronously.
    #[error("transport refused to accept batch")]
    CallFailure,

    /// A blocking accessor exceeded its timeout.
    #[error("timed out waiting for the call")]
    Timeout,

    /// The single-threaded rendezvous forbids blocking calls to `result`,
    /// `exception`, or `traceback` prior to completion (spec §4.E).
    #[error("operation is not supported before the call completes")]
    UsageError(&'static str),

    /// The channel has been closed.
    #[error("channel is closed")]
    ChannelClosed,
}

impl Error {
    /// True if this error represents end-of-stream rather than a failure —
    /// used by iterator surfaces, which use a dedicated `Ok(None)` instead.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
            || matches!(&self, Error::RpcFailure(status) if status.code == crate::status::StatusCode::Cancelled)
    }
}
