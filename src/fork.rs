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

//! Process-wide fork coordination (spec §5 "Fork safety", §9 design note).
//!
//! Only meaningful where `fork()` exists; compiled out everywhere else, as
//! spec §9 itself suggests. Workers consult [`current_epoch`] before
//! blocking and exit if the epoch they were spawned under is stale.

#[cfg(unix)]
mod imp {
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::{Condvar, Mutex};

    static EPOCH: AtomicU64 = AtomicU64::new(0);
    static FORK_IN_PROGRESS: AtomicBool = AtomicBool::new(false);

    static GATE: Mutex<()> = Mutex::new(());
    // lazily constructed at first use; Condvar::new() is const since 1.63.
    static GATE_CV: Condvar = Condvar::new();

    /// Current fork epoch. A worker whose `fork_epoch` is older than this
    /// must exit so post-fork children start with a fresh worker set.
    pub fn current_epoch() -> u64 {
        EPOCH.load(Ordering::SeqCst)
    }

    /// Called by the ambient fork supervisor immediately before `fork()`.
    pub fn begin_fork() {
        FORK_IN_PROGRESS.store(true, Ordering::SeqCst);
    }

    /// Called by the ambient fork supervisor right after `fork()` returns in
    /// the parent (children get a fresh epoch for free since all of this
    /// lives in freshly-copied memory and no other thread survives a fork).
    pub fn end_fork() {
        EPOCH.fetch_add(1, Ordering::SeqCst);
        FORK_IN_PROGRESS.store(false, Ordering::SeqCst);
        let _guard = GATE.lock().unwrap();
        GATE_CV.notify_all();
    }

    /// Suspend the calling thread while a fork is underway.
    pub fn block_if_fork_in_progress() {
        if !FORK_IN_PROGRESS.load(Ordering::SeqCst) {
            return;
        }
        let guard = GATE.lock().unwrap();
        let _unused = GATE_CV
            .wait_while(guard, |_| FORK_IN_PROGRESS.load(Ordering::SeqCst))
            .unwrap();
    }
}

#[cfg(not(unix))]
mod imp {
    pub fn current_epoch() -> u64 {
        0
    }

    pub fn begin_fork() {}

    pub fn end_fork() {}

    pub fn block_if_fork_in_progress() {}
}

pub use imp::{begin_fork, block_if_fork_in_progress, current_epoch, end_fork};
