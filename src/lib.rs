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

//! Client-side call invocation core of a gRPC-style RPC runtime: the
//! per-call state machine, channel event multiplexer, and connectivity
//! subscription engine that sit between a typed method stub and an
//! underlying transport. The transport itself, wire serialization, name
//! resolution and load balancing are external collaborators — see
//! [`transport`] for the interface this crate drives.

pub mod call;
pub mod channel;
pub mod codec;
pub mod error;
pub mod fork;
pub mod metadata;
pub mod multicallable;
pub mod op;
pub mod status;
pub mod transport;

pub use crate::channel::{CallOptions, Channel, ChannelBuilder, ChannelOptions, ConnectivityCallback};
pub use crate::codec::Marshaller;
pub use crate::error::{Error, Result};
pub use crate::metadata::{CallFlags, Metadata};
pub use crate::multicallable::{
    StreamStreamMultiCallable, StreamUnaryMultiCallable, UnaryStreamCall, UnaryStreamMultiCallable,
    UnaryUnaryMultiCallable,
};
pub use crate::status::{RpcStatus, StatusCode};
pub use crate::transport::{
    CallCredentials, CallParams, ChannelCredentials, ConnectivityLevel, TraceContext, Transport,
    TransportCall,
};
