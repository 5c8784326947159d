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

//! Per-worker shutdown escalation.
//!
//! Three phases under one total budget: ask over HTTP, SIGTERM the
//! process, SIGKILL the process group. The ordering is strict per worker.
//! A worker never sees SIGTERM after SIGKILL, and never an HTTP request
//! after SIGTERM. Between phases the child is re-polled; one that exited
//! during a wait must not be signaled again.

use std::fmt;
use std::process::ExitStatus;
use std::time::Duration as StdDuration;

use time::SteadyTime;

use core::os::process::Signal;
use error::{Error, SupError};
use manager::spawner::ChildHandle;
use manager::verify::{self, VerificationReport};
use manager::worker::{Worker, WorkerState};
use shutdown::{self, EXIT_OK, EXIT_WORKER_FORCE_KILL};
use util::http;

static LOGKEY: &'static str = "LC";

/// Hard cap on waiting out a SIGKILL.
pub const KILL_WAIT_SECS: u64 = 5;

/// How a worker ultimately went down.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShutdownMethod {
    /// Nothing to do; the process was already gone at entry.
    AlreadyExited,
    /// Exited inside the graceful window after `POST /shutdown`.
    Graceful,
    /// Exited after SIGTERM.
    Terminated,
    /// Exited only after SIGKILL on its process group.
    Killed,
    /// Still running after SIGKILL and the hard wait.
    Unkillable,
}

impl fmt::Display for ShutdownMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let method = match *self {
            ShutdownMethod::AlreadyExited => "already exited",
            ShutdownMethod::Graceful => "graceful shutdown",
            ShutdownMethod::Terminated => "terminated",
            ShutdownMethod::Killed => "killed",
            ShutdownMethod::Unkillable => "unkillable",
        };
        write!(f, "{}", method)
    }
}

#[derive(Debug)]
pub struct WorkerShutdownReport {
    pub name: String,
    pub method: ShutdownMethod,
    pub exit_status: Option<ExitStatus>,
    pub verification: Option<VerificationReport>,
    pub failures: Vec<SupError>,
    pub duration: StdDuration,
}

impl WorkerShutdownReport {
    pub fn ok(&self) -> bool {
        match self.method {
            ShutdownMethod::Unkillable => false,
            _ => {
                self.verification
                    .as_ref()
                    .map(|v| v.passed())
                    .unwrap_or(true)
            }
        }
    }

    pub fn exit_contribution(&self) -> i32 {
        let mut code = match self.method {
            ShutdownMethod::Killed => EXIT_WORKER_FORCE_KILL,
            // Required SIGKILL *and* failed to exit; force-kill outranks
            // the timeout code.
            ShutdownMethod::Unkillable => EXIT_WORKER_FORCE_KILL,
            _ => EXIT_OK,
        };
        if let Some(ref verification) = self.verification {
            code = shutdown::worst(code, verification.exit_contribution());
        }
        code
    }
}

/// Walk one worker through the escalation. The worker's process handle is
/// retained in every outcome, including failure; diagnostics need it.
pub fn shutdown_worker(worker: &mut Worker) -> WorkerShutdownReport {
    let start = SteadyTime::now();
    let name = worker.name().to_string();
    let port = worker.port();
    let graceful_timeout = worker.spec.graceful_timeout;
    let shutdown_timeout = worker.spec.shutdown_timeout;
    let mut failures = Vec::new();

    let mut handle = match worker.process.take() {
        Some(handle) => handle,
        None => {
            // Nothing was ever running (or a crash was already observed
            // and recorded); there is no process to signal and no port or
            // zombie evidence to collect.
            outputln!(preamble name, "no live process at shutdown entry");
            worker.change_state(WorkerState::Exited);
            return WorkerShutdownReport {
                name: name,
                method: ShutdownMethod::AlreadyExited,
                exit_status: None,
                verification: None,
                failures: failures,
                duration: elapsed_since(start),
            };
        }
    };

    worker.change_state(WorkerState::Draining);

    let mut method = ShutdownMethod::AlreadyExited;
    let mut exit_status = poll_quietly(&mut handle, &name, &mut failures);

    if exit_status.is_none() {
        // Phase 1: ask nicely over HTTP. Errors and non-2xx responses
        // mean the worker didn't take the request; both fall through to
        // SIGTERM after the graceful window.
        let phase_start = SteadyTime::now();
        match http::request_shutdown(port) {
            Ok(status) if status >= 200 && status < 300 => {
                debug!("worker {} accepted the shutdown request", name)
            }
            Ok(status) => {
                debug!("worker {} answered the shutdown request with {}", name, status)
            }
            Err(err) => {
                debug!("shutdown request to worker {} failed: {}", name, err)
            }
        }
        exit_status = wait_quietly(&mut handle, graceful_timeout, &name, &mut failures);
        match exit_status {
            Some(_) => {
                method = ShutdownMethod::Graceful;
                outputln!(
                    preamble name,
                    "graceful: exited after {}ms",
                    ms_since(phase_start)
                );
            }
            None => {
                outputln!(
                    preamble name,
                    "graceful: timeout after {}ms",
                    ms_since(phase_start)
                );
                failures.push(sup_error!(Error::GracefulTimeout(name.clone())));
            }
        }
    }

    if exit_status.is_none() {
        // Phase 2: SIGTERM the process itself, with whatever is left of
        // the total budget.
        let phase_start = SteadyTime::now();
        let remaining = saturating_sub(shutdown_timeout, graceful_timeout);
        if let Err(err) = handle.signal(Signal::TERM) {
            failures.push(err);
        }
        exit_status = wait_quietly(&mut handle, remaining, &name, &mut failures);
        match exit_status {
            Some(_) => {
                method = ShutdownMethod::Terminated;
                outputln!(
                    preamble name,
                    "SIGTERM: exited after {}ms",
                    ms_since(phase_start)
                );
            }
            None => {
                outputln!(
                    preamble name,
                    "SIGTERM: timeout after {}ms",
                    ms_since(phase_start)
                );
                failures.push(sup_error!(Error::TerminationTimeout(name.clone())));
            }
        }
    }

    if exit_status.is_none() {
        // Phase 3: SIGKILL the whole process group, hard-capped wait.
        let phase_start = SteadyTime::now();
        outputln!(preamble name, "escalating to SIGKILL on process group");
        if let Err(err) = handle.kill_group() {
            failures.push(err);
        }
        exit_status = wait_quietly(
            &mut handle,
            StdDuration::from_secs(KILL_WAIT_SECS),
            &name,
            &mut failures,
        );
        match exit_status {
            Some(_) => {
                method = ShutdownMethod::Killed;
                outputln!(
                    preamble name,
                    "SIGKILL: exited after {}ms",
                    ms_since(phase_start)
                );
            }
            None => {
                method = ShutdownMethod::Unkillable;
                outputln!(
                    preamble name,
                    "CRITICAL: still running after SIGKILL and {}s wait",
                    KILL_WAIT_SECS
                );
                failures.push(sup_error!(Error::TerminationFailed(name.clone())));
            }
        }
    }

    let report = if method == ShutdownMethod::Unkillable {
        // Keep the handle; it is the diagnostic ground truth for the
        // verification phase and the final report.
        worker.process = Some(handle);
        WorkerShutdownReport {
            name: name,
            method: method,
            exit_status: None,
            verification: None,
            failures: failures,
            duration: elapsed_since(start),
        }
    } else {
        let verification = verify::verify_worker(&name, port, &mut handle);
        worker.process = Some(handle);
        worker.change_state(WorkerState::Exited);
        WorkerShutdownReport {
            name: name,
            method: method,
            exit_status: exit_status,
            verification: Some(verification),
            failures: failures,
            duration: elapsed_since(start),
        }
    };
    outputln!(
        preamble report.name,
        "shutdown finished via {} in {}ms",
        report.method,
        report.duration.as_millis()
    );
    report
}

fn poll_quietly(
    handle: &mut Box<ChildHandle>,
    name: &str,
    failures: &mut Vec<SupError>,
) -> Option<ExitStatus> {
    match handle.poll() {
        Ok(status) => status,
        Err(err) => {
            warn!("unable to poll worker {}: {}", name, err);
            failures.push(err);
            None
        }
    }
}

fn wait_quietly(
    handle: &mut Box<ChildHandle>,
    timeout: StdDuration,
    name: &str,
    failures: &mut Vec<SupError>,
) -> Option<ExitStatus> {
    match handle.wait_timeout(timeout) {
        Ok(status) => status,
        Err(err) => {
            warn!("unable to wait on worker {}: {}", name, err);
            failures.push(err);
            None
        }
    }
}

fn saturating_sub(total: StdDuration, spent: StdDuration) -> StdDuration {
    if total > spent {
        total - spent
    } else {
        StdDuration::from_millis(0)
    }
}

fn ms_since(start: SteadyTime) -> i64 {
    (SteadyTime::now() - start).num_milliseconds()
}

fn elapsed_since(start: SteadyTime) -> StdDuration {
    StdDuration::from_millis(ms_since(start) as u64)
}
