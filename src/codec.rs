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

//! Request/response (de)serialization hooks.
//!
//! Serialization itself is an external collaborator (spec §1): the caller
//! supplies encode/decode functions and this crate only calls them at the
//! right points. `Marshaller<T>` holds plain function pointers rather than a
//! trait object, so the signature stays simple and the compiler can inline
//! the call instead of paying for dynamic dispatch at every call site.

/// Serialize `T` into wire bytes. Returns `Err` on failure, surfaced to the
/// caller as `Error::Codec` / `INTERNAL` per spec §7.
pub type SerializeFn<T> = fn(&T) -> Result<Vec<u8>, String>;

/// Deserialize wire bytes into `T`.
pub type DeserializeFn<T> = fn(&[u8]) -> Result<T, String>;

/// Defines how to serialize and deserialize between the specialized type and byte slice.
pub struct Marshaller<T> {
    /// The serialize function.
    pub ser: SerializeFn<T>,

    /// The deserialize function.
    pub de: DeserializeFn<T>,
}

impl<T> Marshaller<T> {
    pub fn new(ser: SerializeFn<T>, de: DeserializeFn<T>) -> Marshaller<T> {
        Marshaller { ser, de }
    }
}

impl<T> Clone for Marshaller<T> {
    fn clone(&self) -> Marshaller<T> {
        Marshaller {
            ser: self.ser,
            de: self.de,
        }
    }
}

impl<T> Copy for Marshaller<T> {}
