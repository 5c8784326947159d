// Copyright (c) 2016-2017 Chef Software Inc. and/or applicable contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The one-shot shutdown latch.
//!
//! Exactly one shutdown runs per supervisor lifetime. Signals and explicit
//! requests race to flip the latch; only the first wins and records the
//! reason. The fast path is a single atomic so `is_set` can be polled from
//! the tick loop; waiters park on a condvar.

use std::sync::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration as StdDuration;

use time::{Duration, SteadyTime};

use core::os::signals;

static LOGKEY: &'static str = "SD";

struct Inner {
    reason: Option<String>,
    initiated_at: Option<SteadyTime>,
}

pub struct ShutdownCoordinator {
    initiated: AtomicBool,
    inner: Mutex<Inner>,
    notify: Condvar,
}

impl ShutdownCoordinator {
    pub fn new() -> ShutdownCoordinator {
        ShutdownCoordinator {
            initiated: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                reason: None,
                initiated_at: None,
            }),
            notify: Condvar::new(),
        }
    }

    /// Request shutdown. Only the first request sets the reason and wakes
    /// waiters; later requests are logged and dropped.
    pub fn request(&self, reason: &str) -> bool {
        if self.initiated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let mut inner = self.inner.lock().expect("shutdown coordinator lock poisoned");
            inner.reason = Some(String::from(reason));
            inner.initiated_at = Some(SteadyTime::now());
            self.notify.notify_all();
            outputln!("=== SHUTDOWN INITIATED (reason: {}) ===", reason);
            true
        } else {
            warn!(
                "shutdown already initiated (reason: {}), ignoring request \"{}\"",
                self.reason().unwrap_or_default(),
                reason
            );
            false
        }
    }

    pub fn is_set(&self) -> bool {
        self.initiated.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.inner
            .lock()
            .expect("shutdown coordinator lock poisoned")
            .reason
            .clone()
    }

    /// Seconds since initiation, if initiated.
    pub fn elapsed(&self) -> Option<Duration> {
        self.inner
            .lock()
            .expect("shutdown coordinator lock poisoned")
            .initiated_at
            .map(|at| SteadyTime::now() - at)
    }

    /// Block until shutdown is requested. With a timeout, returns whether
    /// the latch was set before it expired.
    pub fn wait(&self, timeout: Option<StdDuration>) -> bool {
        let mut inner = self.inner.lock().expect("shutdown coordinator lock poisoned");
        match timeout {
            None => {
                while !self.is_set() {
                    inner = self.notify
                        .wait(inner)
                        .expect("shutdown coordinator lock poisoned");
                }
                true
            }
            Some(timeout) => {
                let deadline = SteadyTime::now() +
                    Duration::milliseconds(timeout.as_millis() as i64);
                while !self.is_set() {
                    let now = SteadyTime::now();
                    if now >= deadline {
                        return false;
                    }
                    let remaining = (deadline - now).num_milliseconds();
                    let (guard, _) = self.notify
                        .wait_timeout(inner, StdDuration::from_millis(remaining as u64))
                        .expect("shutdown coordinator lock poisoned");
                    inner = guard;
                }
                true
            }
        }
    }

    /// Translate trapped signals into shutdown requests. Called from the
    /// main tick loop; the signal handlers themselves never touch this
    /// object.
    pub fn pump_signals(&self) {
        let duplicates = signals::pending_duplicates();
        if duplicates > 0 {
            warn!("ignored {} duplicate shutdown signal(s)", duplicates);
        }
        if let Some(signal) = signals::check_for_signal() {
            self.request(&format!("signal_{}", signal));
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration as StdDuration;

    use super::*;

    #[test]
    fn first_request_wins_and_later_requests_are_ignored() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.is_set());
        assert_eq!(coordinator.reason(), None);
        assert!(coordinator.request("signal_SIGINT"));
        assert!(!coordinator.request("signal_SIGTERM"));
        assert!(!coordinator.request("manual"));
        assert!(coordinator.is_set());
        assert_eq!(coordinator.reason(), Some(String::from("signal_SIGINT")));
    }

    #[test]
    fn wait_times_out_when_nothing_happens() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.wait(Some(StdDuration::from_millis(100))));
    }

    #[test]
    fn wait_releases_when_another_thread_requests() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let remote = coordinator.clone();
        let waiter = thread::spawn(move || remote.wait(Some(StdDuration::from_secs(5))));
        thread::sleep(StdDuration::from_millis(50));
        coordinator.request("manual");
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn wait_returns_immediately_once_set() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.request("manual");
        assert!(coordinator.wait(Some(StdDuration::from_millis(10))));
        assert!(coordinator.wait(None));
    }
}
