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

//! Operation batch primitives (spec §3 "Operation taxonomy" / §4.A).
//!
//! A [`Batch`] names the wire operations submitted atomically to the
//! transport; a [`CompletionEvent`] is what comes back. `grpcio`'s
//! `BatchContext` (`src/call/mod.rs`) plays the same role against the real C
//! core; here the shape is the same but the payloads are plain Rust values
//! instead of FFI buffers, since the transport itself is an external
//! collaborator (spec §1).

use std::collections::HashSet;
use std::sync::Arc;

use crate::metadata::Metadata;
use crate::status::RpcStatus;

/// The six canonical operation kinds a batch may contain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpType {
    SendInitialMetadata,
    SendMessage,
    SendCloseFromClient,
    ReceiveInitialMetadata,
    ReceiveMessage,
    ReceiveStatusOnClient,
}

impl OpType {
    pub fn is_send(self) -> bool {
        matches!(
            self,
            OpType::SendInitialMetadata | OpType::SendMessage | OpType::SendCloseFromClient
        )
    }

    pub fn is_receive(self) -> bool {
        !self.is_send()
    }
}

/// Write flags for a single message, a pass-through bitfield per spec §1's
/// non-goals ("assumes compression is a pass-through flag on the operation
/// batch"). Named after `grpcio`'s own `WriteFlags`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteFlags {
    raw: u32,
}

const FLAG_BUFFER_HINT: u32 = 1;
const FLAG_NO_COMPRESS: u32 = 2;

impl WriteFlags {
    pub fn new() -> WriteFlags {
        WriteFlags::default()
    }

    pub fn buffer_hint(mut self, hint: bool) -> WriteFlags {
        if hint {
            self.raw |= FLAG_BUFFER_HINT;
        } else {
            self.raw &= !FLAG_BUFFER_HINT;
        }
        self
    }

    pub fn force_no_compress(mut self, no_compress: bool) -> WriteFlags {
        if no_compress {
            self.raw |= FLAG_NO_COMPRESS;
        } else {
            self.raw &= !FLAG_NO_COMPRESS;
        }
        self
    }

    pub fn raw(self) -> u32 {
        self.raw
    }
}

/// The payload an [`Operation`] carries, set at submission for sends and
/// populated from the [`CompletionEvent`] for receives.
#[derive(Clone, Debug)]
pub enum OpPayload {
    Metadata(Metadata),
    Message(Vec<u8>, WriteFlags),
    None,
}

/// One operation within a [`Batch`].
#[derive(Clone, Debug)]
pub struct Operation {
    pub kind: OpType,
    pub payload: OpPayload,
}

impl Operation {
    pub fn send_initial_metadata(metadata: Metadata) -> Operation {
        Operation {
            kind: OpType::SendInitialMetadata,
            payload: OpPayload::Metadata(metadata),
        }
    }

    pub fn send_message(bytes: Vec<u8>, flags: WriteFlags) -> Operation {
        Operation {
            kind: OpType::SendMessage,
            payload: OpPayload::Message(bytes, flags),
        }
    }

    pub fn send_close_from_client() -> Operation {
        Operation {
            kind: OpType::SendCloseFromClient,
            payload: OpPayload::None,
        }
    }

    pub fn receive_initial_metadata() -> Operation {
        Operation {
            kind: OpType::ReceiveInitialMetadata,
            payload: OpPayload::None,
        }
    }

    pub fn receive_message() -> Operation {
        Operation {
            kind: OpType::ReceiveMessage,
            payload: OpPayload::None,
        }
    }

    pub fn receive_status_on_client() -> Operation {
        Operation {
            kind: OpType::ReceiveStatusOnClient,
            payload: OpPayload::None,
        }
    }
}

/// An ordered sequence of operations submitted atomically to the transport.
#[derive(Clone, Debug, Default)]
pub struct Batch(Vec<Operation>);

impl Batch {
    pub fn new() -> Batch {
        Batch(Vec::new())
    }

    pub fn push(&mut self, op: Operation) -> &mut Batch {
        self.0.push(op);
        self
    }

    pub fn ops(&self) -> &[Operation] {
        &self.0
    }

    /// The set of operation kinds this batch names — what gets added to
    /// `due` *before* submission, per spec §3.
    pub fn due_set(&self) -> HashSet<OpType> {
        self.0.iter().map(|op| op.kind).collect()
    }

    /// The six canonical initial batches by cardinality (spec §4.A table).
    pub fn unary_unary(metadata: Metadata, message: Vec<u8>, flags: WriteFlags) -> Batch {
        let mut batch = Batch::new();
        batch
            .push(Operation::send_initial_metadata(metadata))
            .push(Operation::send_message(message, flags))
            .push(Operation::send_close_from_client())
            .push(Operation::receive_initial_metadata())
            .push(Operation::receive_message())
            .push(Operation::receive_status_on_client());
        batch
    }

    pub fn unary_stream(metadata: Metadata, message: Vec<u8>, flags: WriteFlags) -> Batch {
        let mut batch = Batch::new();
        batch
            .push(Operation::send_initial_metadata(metadata))
            .push(Operation::send_message(message, flags))
            .push(Operation::send_close_from_client())
            .push(Operation::receive_initial_metadata())
            .push(Operation::receive_status_on_client());
        batch
    }

    pub fn stream_unary(metadata: Metadata) -> Batch {
        let mut batch = Batch::new();
        batch
            .push(Operation::send_initial_metadata(metadata))
            .push(Operation::receive_initial_metadata())
            .push(Operation::receive_message())
            .push(Operation::receive_status_on_client());
        batch
    }

    pub fn stream_stream(metadata: Metadata) -> Batch {
        let mut batch = Batch::new();
        batch
            .push(Operation::send_initial_metadata(metadata))
            .push(Operation::receive_initial_metadata())
            .push(Operation::receive_status_on_client());
        batch
    }
}

/// The per-operation result carried by a [`CompletionEvent`].
#[derive(Clone, Debug)]
pub enum OpResult {
    /// Acknowledges a send op; carries no payload.
    Sent,
    InitialMetadata(Metadata),
    /// `None` denotes end-of-stream (no more messages will arrive).
    Message(Option<Vec<u8>>),
    Status(RpcStatus),
}

/// A call-completion handler, invoked by the channel spin worker (spec
/// §4.G) with the event whose tag names it. Returns whether the call this
/// event belongs to has now completed (terminal status observed), which
/// drives the managed-call ref count.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: CompletionEvent) -> bool;
}

pub type EventTag = Arc<dyn EventHandler>;

/// Notification that a submitted batch has finished.
pub struct CompletionEvent {
    pub completed: Vec<(OpType, OpResult)>,
    pub success: bool,
}

impl CompletionEvent {
    pub fn new(completed: Vec<(OpType, OpResult)>, success: bool) -> CompletionEvent {
        CompletionEvent { completed, success }
    }

    pub fn failure() -> CompletionEvent {
        CompletionEvent {
            completed: Vec::new(),
            success: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_due_sets_match_cardinality_table() {
        let uu = Batch::unary_unary(Metadata::new(), vec![], WriteFlags::new());
        assert_eq!(uu.due_set().len(), 6);

        let us = Batch::unary_stream(Metadata::new(), vec![], WriteFlags::new());
        let expected: HashSet<_> = [
            OpType::SendInitialMetadata,
            OpType::SendMessage,
            OpType::SendCloseFromClient,
            OpType::ReceiveInitialMetadata,
            OpType::ReceiveStatusOnClient,
        ]
        .into_iter()
        .collect();
        assert_eq!(us.due_set(), expected);

        let su = Batch::stream_unary(Metadata::new());
        let expected: HashSet<_> = [
            OpType::SendInitialMetadata,
            OpType::ReceiveInitialMetadata,
            OpType::ReceiveMessage,
            OpType::ReceiveStatusOnClient,
        ]
        .into_iter()
        .collect();
        assert_eq!(su.due_set(), expected);

        let ss = Batch::stream_stream(Metadata::new());
        let expected: HashSet<_> = [
            OpType::SendInitialMetadata,
            OpType::ReceiveInitialMetadata,
            OpType::ReceiveStatusOnClient,
        ]
        .into_iter()
        .collect();
        assert_eq!(ss.due_set(), expected);
    }
}
