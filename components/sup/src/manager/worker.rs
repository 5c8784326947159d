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

//! The worker record: one repository, one port, at most one live child.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration as StdDuration;

use time::SteadyTime;

use core::os::process::Pid;
use config;
use manager::spawner::ChildHandle;

static LOGKEY: &'static str = "WK";

/// Immutable description of a worker, produced by configuration loading.
#[derive(Clone, Debug)]
pub struct WorkerSpec {
    pub name: String,
    pub workspace: PathBuf,
    pub port: u16,
    pub description: String,
    /// Fully-assembled argv.
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub shutdown_timeout: StdDuration,
    pub graceful_timeout: StdDuration,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerState {
    New,
    Starting,
    Running,
    Draining,
    Failed,
    Exited,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = match *self {
            WorkerState::New => "new",
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Draining => "draining",
            WorkerState::Failed => "failed",
            WorkerState::Exited => "exited",
        };
        write!(f, "{}", state)
    }
}

/// What the last health tick concluded about a worker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HealthOutcome {
    Healthy,
    /// The child exited; exit code if one could be read.
    ProcessExited(Option<i32>),
    /// The child is alive but no longer holds its port.
    PortNotHeld,
}

impl fmt::Display for HealthOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            HealthOutcome::Healthy => write!(f, "healthy"),
            HealthOutcome::ProcessExited(Some(code)) => {
                write!(f, "process exited with code {}", code)
            }
            HealthOutcome::ProcessExited(None) => write!(f, "process exited"),
            HealthOutcome::PortNotHeld => write!(f, "port no longer held"),
        }
    }
}

/// Runtime state for one worker. Owned and mutated exclusively by the
/// supervisor.
pub struct Worker {
    pub spec: WorkerSpec,
    pub process: Option<Box<ChildHandle>>,
    pub pgid: Option<Pid>,
    pub started_at: Option<SteadyTime>,
    pub restart_count: u32,
    pub max_restarts: u32,
    pub last_health: Option<HealthOutcome>,
    state: WorkerState,
}

impl Worker {
    pub fn new(spec: WorkerSpec) -> Worker {
        Worker {
            spec: spec,
            process: None,
            pgid: None,
            started_at: None,
            restart_count: 0,
            max_restarts: config::DEFAULT_MAX_RESTARTS,
            last_health: None,
            state: WorkerState::New,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn port(&self) -> u16 {
        self.spec.port
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn pid(&self) -> Option<Pid> {
        self.process.as_ref().map(|p| p.pid())
    }

    pub fn change_state(&mut self, state: WorkerState) {
        if self.state == state {
            return;
        }
        outputln!(preamble self.spec.name, "state {} -> {}", self.state, state);
        self.state = state;
    }

    /// Restart attempts left before this worker pins in `Failed`.
    pub fn can_restart(&self) -> bool {
        self.restart_count < self.max_restarts
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Worker {{ name: {}, port: {}, state: {}, pid: {:?}, restarts: {}/{} }}",
            self.spec.name,
            self.spec.port,
            self.state,
            self.pid(),
            self.restart_count,
            self.max_restarts
        )
    }
}

#[cfg(test)]
pub fn test_spec(name: &str, port: u16) -> WorkerSpec {
    WorkerSpec {
        name: String::from(name),
        workspace: PathBuf::from("/tmp"),
        port: port,
        description: String::new(),
        command: vec![String::from("true")],
        env: HashMap::new(),
        shutdown_timeout: StdDuration::from_millis(900),
        graceful_timeout: StdDuration::from_millis(300),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn new_workers_start_in_new_state_with_no_process() {
        let worker = Worker::new(test_spec("alpha", 9201));
        assert_eq!(worker.state(), WorkerState::New);
        assert!(worker.process.is_none());
        assert!(worker.can_restart());
    }

    #[test]
    fn restart_budget_is_bounded() {
        let mut worker = Worker::new(test_spec("alpha", 9201));
        worker.restart_count = worker.max_restarts;
        assert!(!worker.can_restart());
    }
}
