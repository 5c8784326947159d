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

//! Registry of closable resources.
//!
//! Databases may need to flush, so they close first; files are cheapest
//! and close last. Within the generic bucket, lower priority closes first,
//! and entries sharing a priority close concurrently. Every cleanup runs
//! under its own timeout, and a failure never stops the rest of the phase.

use std::fmt;
use std::result;
use std::sync::Mutex;
use std::sync::mpsc;
use std::thread;
use std::time::Duration as StdDuration;

use time::{self, SteadyTime, Timespec};

static LOGKEY: &'static str = "RS";

/// Default per-resource cleanup budgets, by kind.
const DATABASE_TIMEOUT_SECS: u64 = 5;
const SERVICE_TIMEOUT_SECS: u64 = 5;
const GENERIC_TIMEOUT_SECS: u64 = 10;
const FILE_TIMEOUT_SECS: u64 = 5;

pub type CleanupFn = Box<FnMut() -> result::Result<(), String> + Send>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResourceKind {
    Database,
    Service,
    Generic,
    File,
}

impl ResourceKind {
    /// Teardown order across kinds.
    fn close_order() -> [ResourceKind; 4] {
        [
            ResourceKind::Database,
            ResourceKind::Service,
            ResourceKind::Generic,
            ResourceKind::File,
        ]
    }

    fn default_timeout(&self) -> StdDuration {
        let secs = match *self {
            ResourceKind::Database => DATABASE_TIMEOUT_SECS,
            ResourceKind::Service => SERVICE_TIMEOUT_SECS,
            ResourceKind::Generic => GENERIC_TIMEOUT_SECS,
            ResourceKind::File => FILE_TIMEOUT_SECS,
        };
        StdDuration::from_secs(secs)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ResourceKind::Database => write!(f, "database"),
            ResourceKind::Service => write!(f, "service"),
            ResourceKind::Generic => write!(f, "generic"),
            ResourceKind::File => write!(f, "file"),
        }
    }
}

/// How a resource is released, fixed at registration time.
pub enum Cleanup {
    /// Runs on a closing thread, bounded by the resource's timeout.
    Run(CleanupFn),
    /// The resource needs no action beyond being dropped.
    Nop,
}

struct ResourceEntry {
    name: String,
    kind: ResourceKind,
    cleanup: Cleanup,
    priority: i32,
    timeout: StdDuration,
    created_at: Timespec,
    close_attempts: u32,
}

#[derive(Debug)]
pub struct ResourceFailure {
    pub name: String,
    pub kind: ResourceKind,
    pub cause: String,
}

#[derive(Debug, Default)]
pub struct ResourceCloseReport {
    pub closed: usize,
    pub failures: Vec<ResourceFailure>,
}

impl ResourceCloseReport {
    pub fn ok(&self) -> bool {
        self.failures.is_empty()
    }

    fn absorb(&mut self, other: ResourceCloseReport) {
        self.closed += other.closed;
        self.failures.extend(other.failures);
    }
}

#[derive(Debug)]
pub struct ResourceStatus {
    pub name: String,
    pub kind: ResourceKind,
    pub priority: i32,
    pub created_at_secs: i64,
    pub close_attempts: u32,
}

struct RegistryState {
    entries: Vec<ResourceEntry>,
    callbacks: Vec<(String, CleanupFn)>,
    closed: bool,
}

/// Owns every registered resource. Resources are closed at most once; a
/// registry that has been closed refuses new registrations.
pub struct ResourceRegistry {
    state: Mutex<RegistryState>,
}

impl ResourceRegistry {
    pub fn new() -> ResourceRegistry {
        ResourceRegistry {
            state: Mutex::new(RegistryState {
                entries: Vec::new(),
                callbacks: Vec::new(),
                closed: false,
            }),
        }
    }

    pub fn add_database(&self, name: &str, cleanup: Cleanup) -> bool {
        self.add(name, ResourceKind::Database, cleanup, 0, None)
    }

    pub fn add_service(&self, name: &str, cleanup: Cleanup) -> bool {
        self.add(name, ResourceKind::Service, cleanup, 0, None)
    }

    pub fn add_file(&self, name: &str, cleanup: Cleanup) -> bool {
        self.add(name, ResourceKind::File, cleanup, 0, None)
    }

    pub fn add_resource(
        &self,
        name: &str,
        cleanup: Cleanup,
        priority: i32,
        timeout: Option<StdDuration>,
    ) -> bool {
        self.add(name, ResourceKind::Generic, cleanup, priority, timeout)
    }

    fn add(
        &self,
        name: &str,
        kind: ResourceKind,
        cleanup: Cleanup,
        priority: i32,
        timeout: Option<StdDuration>,
    ) -> bool {
        let mut state = self.state.lock().expect("resource registry lock poisoned");
        if state.closed {
            warn!("cannot add {} {}: registry is closed", kind, name);
            return false;
        }
        debug!("registered {} {} (priority {})", kind, name, priority);
        let timeout = timeout.unwrap_or_else(|| kind.default_timeout());
        state.entries.push(ResourceEntry {
            name: String::from(name),
            kind: kind,
            cleanup: cleanup,
            priority: priority,
            timeout: timeout,
            created_at: time::get_time(),
            close_attempts: 0,
        });
        true
    }

    /// Register a pre-cleanup callback. Callbacks run in their own phase,
    /// before any resource closes, each bounded like a generic resource.
    pub fn add_cleanup_callback(&self, name: &str, callback: CleanupFn) -> bool {
        let mut state = self.state.lock().expect("resource registry lock poisoned");
        if state.closed {
            warn!("cannot add cleanup callback {}: registry is closed", name);
            return false;
        }
        debug!("registered cleanup callback {}", name);
        state.callbacks.push((String::from(name), callback));
        true
    }

    pub fn resource_count(&self) -> usize {
        self.state
            .lock()
            .expect("resource registry lock poisoned")
            .entries
            .len()
    }

    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .expect("resource registry lock poisoned")
            .closed
    }

    pub fn status(&self) -> Vec<ResourceStatus> {
        let state = self.state.lock().expect("resource registry lock poisoned");
        state
            .entries
            .iter()
            .map(|entry| {
                ResourceStatus {
                    name: entry.name.clone(),
                    kind: entry.kind,
                    priority: entry.priority,
                    created_at_secs: entry.created_at.sec,
                    close_attempts: entry.close_attempts,
                }
            })
            .collect()
    }

    /// Run every registered pre-cleanup callback once, draining the list.
    pub fn run_cleanup_callbacks(&self) -> ResourceCloseReport {
        let callbacks = {
            let mut state = self.state.lock().expect("resource registry lock poisoned");
            state.callbacks.drain(..).collect::<Vec<_>>()
        };
        let mut report = ResourceCloseReport::default();
        if callbacks.is_empty() {
            return report;
        }
        outputln!("running {} cleanup callback(s)", callbacks.len());
        let group = callbacks
            .into_iter()
            .map(|(name, callback)| {
                ResourceEntry {
                    name: name,
                    kind: ResourceKind::Generic,
                    cleanup: Cleanup::Run(callback),
                    priority: 0,
                    timeout: StdDuration::from_secs(GENERIC_TIMEOUT_SECS),
                    created_at: time::get_time(),
                    close_attempts: 0,
                }
            })
            .collect();
        report.absorb(close_group(group));
        report
    }

    /// Close everything, kind by kind, priority by priority. Idempotent:
    /// the second call is a no-op reporting success.
    pub fn close_all(&self) -> ResourceCloseReport {
        let entries = {
            let mut state = self.state.lock().expect("resource registry lock poisoned");
            if state.closed {
                debug!("resources already closed");
                return ResourceCloseReport::default();
            }
            state.closed = true;
            state.entries.drain(..).collect::<Vec<_>>()
        };

        let start = SteadyTime::now();
        let total = entries.len();
        outputln!("closing {} resource(s)", total);

        let mut report = ResourceCloseReport::default();
        let mut remaining = entries;
        for kind in ResourceKind::close_order().iter() {
            let mut bucket = Vec::new();
            let mut rest = Vec::new();
            for entry in remaining {
                if entry.kind == *kind {
                    bucket.push(entry);
                } else {
                    rest.push(entry);
                }
            }
            remaining = rest;
            if bucket.is_empty() {
                continue;
            }
            bucket.sort_by_key(|entry| entry.priority);
            while !bucket.is_empty() {
                let priority = bucket[0].priority;
                let split = bucket
                    .iter()
                    .position(|entry| entry.priority != priority)
                    .unwrap_or_else(|| bucket.len());
                let group: Vec<ResourceEntry> = bucket.drain(..split).collect();
                report.absorb(close_group(group));
            }
        }

        let elapsed = SteadyTime::now() - start;
        outputln!(
            "resource cleanup finished: {}/{} closed in {}ms",
            report.closed,
            total,
            elapsed.num_milliseconds()
        );
        report
    }
}

/// Close a same-priority group concurrently, one bounded thread per entry.
/// A cleanup that outlives its timeout is abandoned to its thread and
/// reported as a failure.
fn close_group(group: Vec<ResourceEntry>) -> ResourceCloseReport {
    let mut report = ResourceCloseReport::default();
    let mut waits = Vec::new();
    for entry in group {
        let mut entry = entry;
        entry.close_attempts += 1;
        let name = entry.name.clone();
        let kind = entry.kind;
        let timeout = entry.timeout;
        let (tx, rx) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name(format!("close-{}", entry.name))
            .spawn(move || {
                let started = SteadyTime::now();
                let result = match entry.cleanup {
                    Cleanup::Run(ref mut run) => run(),
                    Cleanup::Nop => Ok(()),
                };
                let elapsed = SteadyTime::now() - started;
                tx.send((result, elapsed)).ok();
            });
        match spawned {
            Ok(_) => waits.push((name, kind, timeout, rx)),
            Err(err) => {
                report.failures.push(ResourceFailure {
                    name: name,
                    kind: kind,
                    cause: format!("failed to spawn close thread: {}", err),
                });
            }
        }
    }
    for (name, kind, timeout, rx) in waits {
        match rx.recv_timeout(timeout) {
            Ok((Ok(()), elapsed)) => {
                outputln!("closed {} {} in {}ms", kind, name, elapsed.num_milliseconds());
                report.closed += 1;
            }
            Ok((Err(cause), elapsed)) => {
                outputln!(
                    "failed to close {} {} after {}ms: {}",
                    kind,
                    name,
                    elapsed.num_milliseconds(),
                    cause
                );
                report.failures.push(ResourceFailure {
                    name: name,
                    kind: kind,
                    cause: cause,
                });
            }
            Err(_) => {
                outputln!(
                    "timed out closing {} {} after {}ms",
                    kind,
                    name,
                    timeout.as_millis()
                );
                report.failures.push(ResourceFailure {
                    name: name,
                    kind: kind,
                    cause: format!("timed out after {}ms", timeout.as_millis()),
                });
            }
        }
    }
    report
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration as StdDuration;

    use super::*;

    fn recording_cleanup(log: &Arc<Mutex<Vec<String>>>, name: &str) -> Cleanup {
        let log = log.clone();
        let name = String::from(name);
        Cleanup::Run(Box::new(move || {
            log.lock().unwrap().push(name.clone());
            Ok(())
        }))
    }

    #[test]
    fn kinds_close_in_fixed_order() {
        let registry = ResourceRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.add_file("log-file", recording_cleanup(&log, "log-file"));
        registry.add_resource("cache", recording_cleanup(&log, "cache"), 0, None);
        registry.add_service("github", recording_cleanup(&log, "github"));
        registry.add_database("symbols", recording_cleanup(&log, "symbols"));
        let report = registry.close_all();
        assert!(report.ok());
        assert_eq!(report.closed, 4);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["symbols", "github", "cache", "log-file"]
        );
    }

    #[test]
    fn generic_resources_respect_priority() {
        let registry = ResourceRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.add_resource("later", recording_cleanup(&log, "later"), 10, None);
        registry.add_resource("sooner", recording_cleanup(&log, "sooner"), 1, None);
        let report = registry.close_all();
        assert!(report.ok());
        assert_eq!(*log.lock().unwrap(), vec!["sooner", "later"]);
    }

    #[test]
    fn one_failure_does_not_stop_the_rest() {
        let registry = ResourceRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.add_database(
            "broken",
            Cleanup::Run(Box::new(|| Err(String::from("flush failed")))),
        );
        registry.add_file("fine", recording_cleanup(&log, "fine"));
        let report = registry.close_all();
        assert!(!report.ok());
        assert_eq!(report.closed, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].name, "broken");
        assert_eq!(*log.lock().unwrap(), vec!["fine"]);
    }

    #[test]
    fn hung_cleanup_times_out_and_is_reported() {
        let registry = ResourceRegistry::new();
        registry.add_resource(
            "stuck",
            Cleanup::Run(Box::new(|| {
                thread::sleep(StdDuration::from_secs(30));
                Ok(())
            })),
            0,
            Some(StdDuration::from_millis(100)),
        );
        let report = registry.close_all();
        assert!(!report.ok());
        assert!(report.failures[0].cause.contains("timed out"));
    }

    #[test]
    fn close_is_idempotent_and_blocks_new_registrations() {
        let registry = ResourceRegistry::new();
        registry.add_database("db", Cleanup::Nop);
        assert_eq!(registry.close_all().closed, 1);
        assert!(registry.is_closed());
        let again = registry.close_all();
        assert_eq!(again.closed, 0);
        assert!(again.ok());
        assert!(!registry.add_database("late", Cleanup::Nop));
        assert_eq!(registry.resource_count(), 0);
    }

    #[test]
    fn cleanup_callbacks_run_once() {
        let registry = ResourceRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.add_cleanup_callback("flush-index", {
            let log = log.clone();
            Box::new(move || {
                log.lock().unwrap().push(String::from("flush-index"));
                Ok(())
            })
        });
        assert_eq!(registry.run_cleanup_callbacks().closed, 1);
        assert_eq!(registry.run_cleanup_callbacks().closed, 0);
        assert_eq!(log.lock().unwrap().len(), 1);
    }
}
