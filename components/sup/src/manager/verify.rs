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

//! Post-shutdown verification.
//!
//! Declaring a worker gone takes three proofs: its process handle reports
//! a concrete exit status, a fresh `bind()` on its port succeeds, and no
//! descendant lingers as a zombie after a reap attempt. Anything less is
//! reported, with enough diagnostics to tell "our worker leaked" apart
//! from "another tenant grabbed the port".

use std::process::ExitStatus;
use std::time::Duration as StdDuration;

use time::SteadyTime;

use core::net::{self, PortHolder};
use core::os::process::Pid;
use core::os::system;
use error::{Error, SupError};
use manager::spawner::ChildHandle;
use shutdown::{self, EXIT_OK, EXIT_PORT_HELD, EXIT_ZOMBIE};

static LOGKEY: &'static str = "VF";

/// How long a released port gets to become bindable again.
pub const PORT_RELEASE_TIMEOUT_SECS: u64 = 15;

#[derive(Debug)]
pub struct VerificationReport {
    pub process_exited: bool,
    pub exit_status: Option<ExitStatus>,
    pub port_released: bool,
    pub port_holder: Option<PortHolder>,
    pub zombies_reaped: usize,
    pub zombies_remaining: Vec<Pid>,
    pub failures: Vec<SupError>,
    pub duration: StdDuration,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.process_exited && self.port_released && self.zombies_remaining.is_empty()
    }

    /// What this verification adds to the supervisor's exit code.
    pub fn exit_contribution(&self) -> i32 {
        let mut code = EXIT_OK;
        if !self.port_released {
            code = shutdown::worst(code, EXIT_PORT_HELD);
        }
        if !self.zombies_remaining.is_empty() {
            code = shutdown::worst(code, EXIT_ZOMBIE);
        }
        code
    }
}

/// Run the three checks for one terminated worker.
pub fn verify_worker(name: &str, port: u16, handle: &mut Box<ChildHandle>) -> VerificationReport {
    let start = SteadyTime::now();
    debug!("verifying shutdown of worker {}", name);

    // 1. Process exit. A handle that still reports "running" here means
    // the escalation failed; that is a critical finding, not a retry.
    let exit_status = match handle.poll() {
        Ok(status) => status,
        Err(err) => {
            warn!("unable to poll worker {} during verification: {}", name, err);
            None
        }
    };
    let process_exited = exit_status.is_some();
    if !process_exited {
        outputln!(
            preamble name,
            "CRITICAL: process {} still running after shutdown",
            handle.pid()
        );
    }

    // 2. Port release, proven by bind.
    let port_released = net::wait_for_port_free(
        port,
        StdDuration::from_secs(PORT_RELEASE_TIMEOUT_SECS),
    );
    let port_holder = if port_released {
        None
    } else {
        let holder = net::diagnose_port_holder(port);
        match holder {
            Some(ref holder) => {
                outputln!(
                    preamble name,
                    "port {} still held by pid {} ({}) state {} cmdline \"{}\"",
                    port,
                    holder.pid,
                    holder.name,
                    holder.state,
                    holder.cmdline
                );
            }
            None => {
                outputln!(
                    preamble name,
                    "port {} still held; holder could not be identified",
                    port
                );
            }
        }
        holder
    };

    // 3. Zombie sweep over the worker's original pid.
    let mut zombies_reaped = 0;
    let mut zombies_remaining = Vec::new();
    let mut failures = Vec::new();
    if !port_released {
        failures.push(sup_error!(Error::PortLeaked(port)));
    }
    for zombie in system::zombies_of(handle.pid()) {
        if system::reap(zombie.pid) {
            debug!("reaped zombie {} ({})", zombie.pid, zombie.name);
            zombies_reaped += 1;
        } else {
            outputln!(
                preamble name,
                "zombie pid {} ({}) survived reap attempt",
                zombie.pid,
                zombie.name
            );
            failures.push(sup_error!(Error::ZombieUnreaped(zombie.pid)));
            zombies_remaining.push(zombie.pid);
        }
    }

    let elapsed = SteadyTime::now() - start;
    let report = VerificationReport {
        process_exited: process_exited,
        exit_status: exit_status,
        port_released: port_released,
        port_holder: port_holder,
        zombies_reaped: zombies_reaped,
        zombies_remaining: zombies_remaining,
        failures: failures,
        duration: StdDuration::from_millis(elapsed.num_milliseconds() as u64),
    };
    outputln!(
        preamble name,
        "verification {} in {}ms (process: {}, port: {}, zombies: {})",
        if report.passed() { "PASSED" } else { "FAILED" },
        elapsed.num_milliseconds(),
        report.process_exited,
        report.port_released,
        report.zombies_remaining.len()
    );
    report
}

#[cfg(test)]
mod test {
    use std::net::TcpListener;
    use std::time::Duration as StdDuration;

    use super::*;
    use manager::spawner::{ChildHandle, ProcessSpawner};
    use manager::spawner::fake::{FakeBehavior, FakeSpawner};
    use manager::worker::test_spec;

    fn exited_fake() -> Box<ChildHandle> {
        let spawner = FakeSpawner::new(FakeBehavior::ExitImmediately(0));
        spawner.spawn(&test_spec("v", 0)).unwrap()
    }

    fn free_port() -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn clean_exit_with_free_port_passes() {
        let mut handle = exited_fake();
        let report = verify_worker("v", free_port(), &mut handle);
        assert!(report.passed());
        assert!(report.process_exited);
        assert!(report.port_released);
        assert_eq!(report.exit_contribution(), EXIT_OK);
    }

    #[test]
    fn still_running_process_is_critical() {
        let spawner = FakeSpawner::new(FakeBehavior::Immortal);
        let mut handle = spawner.spawn(&test_spec("v", 0)).unwrap();
        let report = verify_worker("v", free_port(), &mut handle);
        assert!(!report.passed());
        assert!(!report.process_exited);
        // A running process is reported through the termination result,
        // not the verification code.
        assert_eq!(report.exit_contribution(), EXIT_OK);
    }

    #[test]
    fn held_port_contributes_exit_code_4_with_holder_diagnostics() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut handle = exited_fake();
        // Shrink the wait so the test does not sit out the full window.
        let report = verify_with_short_window(port, &mut handle);
        assert!(!report.port_released);
        assert_eq!(report.exit_contribution(), EXIT_PORT_HELD);
        if cfg!(target_os = "linux") {
            let holder = report.port_holder.expect("expected a holder on linux");
            assert_eq!(holder.pid, unsafe { ::libc::getpid() });
        }
        drop(listener);
    }

    // The 15s production window makes for a slow failure test; probe once
    // and reuse the rest of the logic by checking the pieces directly.
    fn verify_with_short_window(port: u16, handle: &mut Box<ChildHandle>) -> VerificationReport {
        use core::net;
        let exit_status = handle.poll().unwrap();
        let port_released = net::wait_for_port_free(port, StdDuration::from_millis(100));
        let port_holder = if port_released {
            None
        } else {
            net::diagnose_port_holder(port)
        };
        VerificationReport {
            process_exited: exit_status.is_some(),
            exit_status: exit_status,
            port_released: port_released,
            port_holder: port_holder,
            zombies_reaped: 0,
            zombies_remaining: Vec::new(),
            failures: Vec::new(),
            duration: StdDuration::from_millis(0),
        }
    }

    #[test]
    fn zombie_contribution_is_exit_code_5() {
        let report = VerificationReport {
            process_exited: true,
            exit_status: None,
            port_released: true,
            port_holder: None,
            zombies_reaped: 0,
            zombies_remaining: vec![4242],
            failures: Vec::new(),
            duration: StdDuration::from_millis(0),
        };
        assert_eq!(report.exit_contribution(), EXIT_ZOMBIE);
    }
}
