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

//! Key/value metadata lists and the initial-metadata flag encoding (spec
//! §4.I).

/// An ordered list of header-style (key, value) pairs. Repeated keys are
/// allowed, as grpc metadata permits.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata(Vec<(String, Vec<u8>)>);

impl Metadata {
    pub fn new() -> Metadata {
        Metadata(Vec::new())
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.0.push((key.into(), value.into()));
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Vec<u8>)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }
}

impl From<Vec<(String, Vec<u8>)>> for Metadata {
    fn from(pairs: Vec<(String, Vec<u8>)>) -> Metadata {
        Metadata(pairs)
    }
}

impl IntoIterator for Metadata {
    type Item = (String, Vec<u8>);
    type IntoIter = std::vec::IntoIter<(String, Vec<u8>)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Two-bit encoding of "wait for ready", composed so that a caller can
/// distinguish "use the channel default" from "explicitly disabled".
///
/// Mirrors spec §4.I exactly: a `None` input leaves the flags untouched, an
/// explicit `true` sets both bits, an explicit `false` clears the first bit
/// and sets the second. This is preserved verbatim on the wire as two
/// propagation bits rather than collapsed into a single `bool`, so that
/// "explicitly false" and "never set" remain distinguishable downstream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallFlags {
    wait_for_ready: bool,
    wait_for_ready_explicitly_set: bool,
}

impl CallFlags {
    pub fn new() -> CallFlags {
        CallFlags::default()
    }

    /// Compose the wait-for-ready bits. `None` is a no-op.
    pub fn with_wait_for_ready(mut self, wait_for_ready: Option<bool>) -> CallFlags {
        match wait_for_ready {
            None => {}
            Some(true) => {
                self.wait_for_ready = true;
                self.wait_for_ready_explicitly_set = true;
            }
            Some(false) => {
                self.wait_for_ready = false;
                self.wait_for_ready_explicitly_set = true;
            }
        }
        self
    }

    pub fn wait_for_ready(self) -> bool {
        self.wait_for_ready
    }

    pub fn wait_for_ready_explicitly_set(self) -> bool {
        self.wait_for_ready_explicitly_set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_leaves_flags_untouched() {
        let flags = CallFlags::new().with_wait_for_ready(Some(true));
        let unchanged = flags.with_wait_for_ready(None);
        assert_eq!(flags, unchanged);
    }

    #[test]
    fn explicit_true_sets_both_bits() {
        let flags = CallFlags::new().with_wait_for_ready(Some(true));
        assert!(flags.wait_for_ready());
        assert!(flags.wait_for_ready_explicitly_set());
    }

    #[test]
    fn explicit_false_clears_first_sets_second() {
        let flags = CallFlags::new().with_wait_for_ready(Some(false));
        assert!(!flags.wait_for_ready());
        assert!(flags.wait_for_ready_explicitly_set());
    }

    #[test]
    fn default_is_unset() {
        let flags = CallFlags::new();
        assert!(!flags.wait_for_ready());
        assert!(!flags.wait_for_ready_explicitly_set());
    }
}
