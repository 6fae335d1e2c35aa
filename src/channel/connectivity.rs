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

//! Connectivity subscription engine (spec §4.H): a polling worker samples
//! the transport's connectivity level, and a delivery worker fans state
//! transitions out to subscribers with strictly sequential per-subscriber
//! ordering (spec §8 property 6).

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::warn;

use crate::fork;
use crate::transport::{ConnectivityLevel, Transport};

/// 200 ms polling cadence (spec §4.H step 3).
const WATCH_DEADLINE: Duration = Duration::from_millis(200);

pub type ConnectivityCallback = Arc<dyn Fn(ConnectivityLevel) + Send + Sync>;

struct Subscriber {
    callback: ConnectivityCallback,
    last_delivered: Mutex<Option<ConnectivityLevel>>,
}

struct Inner {
    level: Option<ConnectivityLevel>,
    try_to_connect: bool,
    subscribers: Vec<Arc<Subscriber>>,
    polling: bool,
    delivering: bool,
}

pub(crate) struct ConnectivityState {
    transport: Arc<dyn Transport>,
    inner: Mutex<Inner>,
}

impl ConnectivityState {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<ConnectivityState> {
        Arc::new(ConnectivityState {
            transport,
            inner: Mutex::new(Inner {
                level: None,
                try_to_connect: false,
                subscribers: Vec::new(),
                polling: false,
                delivering: false,
            }),
        })
    }

    pub fn current_level(&self) -> Option<ConnectivityLevel> {
        self.inner.lock().unwrap().level
    }

    /// Spec §6 `Channel.subscribe`. Spawns the polling worker lazily, on
    /// the 0 -> 1 subscriber transition. A late joiner — one that subscribes
    /// while the poll loop is already running and stable — would otherwise
    /// wait forever for a transition that never comes, so it gets an
    /// immediate delivery of the current level instead.
    pub fn subscribe(self: &Arc<Self>, callback: ConnectivityCallback, try_to_connect: bool) {
        let (need_start, need_delivery) = {
            let mut inner = self.inner.lock().unwrap();
            inner.subscribers.push(Arc::new(Subscriber {
                callback,
                last_delivered: Mutex::new(None),
            }));
            if try_to_connect {
                inner.try_to_connect = true;
            }
            if inner.polling {
                let need_delivery = inner.level.is_some() && !inner.delivering;
                if need_delivery {
                    inner.delivering = true;
                }
                (false, need_delivery)
            } else {
                inner.polling = true;
                (true, false)
            }
        };
        if need_start {
            self.spawn_polling_worker();
        } else if need_delivery {
            self.spawn_delivery_worker();
        }
    }

    /// Spec §6 `Channel.unsubscribe`. Identity is by `Arc` pointer: callers
    /// must pass back the same handle they subscribed with.
    pub fn unsubscribe(&self, callback: &ConnectivityCallback) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .subscribers
            .retain(|s| !Arc::ptr_eq(&s.callback, callback));
    }

    /// Spec §5 "Resource release": drop all subscribers on channel close.
    pub fn clear(&self) {
        self.inner.lock().unwrap().subscribers.clear();
    }

    fn spawn_polling_worker(self: &Arc<Self>) {
        let this = self.clone();
        thread::Builder::new()
            .name("grpc-connectivity-poll".to_owned())
            .spawn(move || this.poll_loop())
            .expect("failed to spawn connectivity polling worker");
    }

    fn spawn_delivery_worker(self: &Arc<Self>) {
        let this = self.clone();
        thread::Builder::new()
            .name("grpc-connectivity-delivery".to_owned())
            .spawn(move || this.delivery_loop())
            .expect("failed to spawn connectivity delivery worker");
    }

    /// Record a freshly observed level and, if any subscriber is now out of
    /// date, ensure a delivery worker is (or remains) running for it.
    fn record_level(self: &Arc<Self>, level: ConnectivityLevel) {
        let should_spawn = {
            let mut inner = self.inner.lock().unwrap();
            inner.level = Some(level);
            let pending = inner
                .subscribers
                .iter()
                .any(|s| *s.last_delivered.lock().unwrap() != Some(level));
            if pending && !inner.delivering {
                inner.delivering = true;
                true
            } else {
                false
            }
        };
        if should_spawn {
            self.spawn_delivery_worker();
        }
    }

    fn poll_loop(self: Arc<Self>) {
        let epoch = fork::current_epoch();

        // Step 1+2: initial read, recorded for every current subscriber.
        let try_connect = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::replace(&mut inner.try_to_connect, false)
        };
        let mut level = self.transport.check_connectivity_state(try_connect);
        self.record_level(level);

        loop {
            fork::block_if_fork_in_progress();
            if fork::current_epoch() != epoch {
                warn!("fork epoch advanced; connectivity poll worker exiting");
                self.inner.lock().unwrap().polling = false;
                return;
            }
            let watch_changed = self.transport.watch_connectivity_state(level, WATCH_DEADLINE);
            fork::block_if_fork_in_progress();

            let try_connect = {
                let mut inner = self.inner.lock().unwrap();
                if inner.subscribers.is_empty() && !inner.try_to_connect {
                    inner.polling = false;
                    return;
                }
                std::mem::replace(&mut inner.try_to_connect, false)
            };

            if watch_changed || try_connect {
                let new_level = self.transport.check_connectivity_state(false);
                if new_level != level {
                    level = new_level;
                    self.record_level(level);
                }
            }
        }
    }

    fn delivery_loop(self: Arc<Self>) {
        loop {
            let (level, batch) = {
                let inner = self.inner.lock().unwrap();
                let level = match inner.level {
                    Some(l) => l,
                    None => {
                        drop(inner);
                        let mut inner = self.inner.lock().unwrap();
                        inner.delivering = false;
                        return;
                    }
                };
                let batch: Vec<Arc<Subscriber>> = inner
                    .subscribers
                    .iter()
                    .filter(|s| *s.last_delivered.lock().unwrap() != Some(level))
                    .cloned()
                    .collect();
                (level, batch)
            };

            if batch.is_empty() {
                let mut inner = self.inner.lock().unwrap();
                inner.delivering = false;
                return;
            }

            for sub in &batch {
                let cb = sub.callback.clone();
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(level))).is_err() {
                    warn!("connectivity subscriber callback panicked; ignoring");
                }
                *sub.last_delivered.lock().unwrap() = Some(level);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_polling(&self) -> bool {
        self.inner.lock().unwrap().polling
    }
}
