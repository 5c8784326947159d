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

//! Spawning worker processes.
//!
//! Children are started as session leaders so that a signal to the process
//! group reaches the worker and every descendant it spawns. Stdout and
//! stderr are captured into bounded tail buffers the supervisor can read
//! back after an abnormal exit.

use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read};
use std::os::unix::process::CommandExt;
use std::process::{Command, ExitStatus, Stdio};
use std::result;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration as StdDuration;

use libc;

use core::os::process::{self, Pid, Process, Signal};
use error::{Error, Result};
use manager::worker::WorkerSpec;

static LOGKEY: &'static str = "PS";

/// Lines of stdout/stderr kept per stream for post-mortem diagnostics.
const TAIL_LINES: usize = 100;

/// Captured output tails of a child process.
#[derive(Clone, Debug, Default)]
pub struct OutputTail {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl OutputTail {
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }
}

/// Handle to a spawned worker child.
pub trait ChildHandle: Send {
    fn pid(&self) -> Pid;

    /// Process-group id to reach the child and its descendants.
    fn pgid(&self) -> Pid;

    /// Non-blocking exit check.
    fn poll(&mut self) -> Result<Option<ExitStatus>>;

    /// Bounded wait for exit; `Ok(None)` on timeout.
    fn wait_timeout(&mut self, timeout: StdDuration) -> Result<Option<ExitStatus>>;

    /// Signal the child process (not its group).
    fn signal(&mut self, signal: Signal) -> Result<()>;

    /// SIGKILL the whole process group.
    fn kill_group(&mut self) -> Result<()>;

    /// Snapshot of the captured output tails.
    fn output_tail(&self) -> OutputTail;
}

/// The capability of starting children, abstracted so tests can substitute
/// a fake fleet.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, spec: &WorkerSpec) -> Result<Box<ChildHandle>>;
}

pub struct OsSpawner;

impl ProcessSpawner for OsSpawner {
    fn spawn(&self, spec: &WorkerSpec) -> Result<Box<ChildHandle>> {
        debug!("spawning worker {}: {:?}", spec.name, spec.command);
        let mut cmd = Command::new(&spec.command[0]);
        cmd.args(&spec.command[1..])
            .current_dir(&spec.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .before_exec(new_session);
        for (key, val) in spec.env.iter() {
            cmd.env(key, val);
        }
        let mut child = cmd.spawn()
            .map_err(|e| sup_error!(Error::Spawn(spec.name.clone(), e)))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        Ok(Box::new(OsChild::new(&spec.name, child.id(), stdout, stderr)))
    }
}

// The child becomes the leader of a new session (and with it a new process
// group); a group signal then reaches the worker and any descendants,
// without ever reaching the supervisor itself.
fn new_session() -> result::Result<(), io::Error> {
    if unsafe { libc::setsid() } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub struct OsChild {
    process: Process,
    pgid: Pid,
    stdout: Arc<Mutex<VecDeque<String>>>,
    stderr: Arc<Mutex<VecDeque<String>>>,
}

impl OsChild {
    fn new<T, U>(name: &str, pid: u32, stdout: Option<T>, stderr: Option<U>) -> OsChild
    where
        T: Read + Send + 'static,
        U: Read + Send + 'static,
    {
        let out_tail = Arc::new(Mutex::new(VecDeque::new()));
        let err_tail = Arc::new(Mutex::new(VecDeque::new()));
        if let Some(stdout) = stdout {
            let tail = out_tail.clone();
            thread::Builder::new()
                .name(format!("{}-out", name))
                .spawn(move || capture_tail(stdout, tail))
                .ok();
        }
        if let Some(stderr) = stderr {
            let tail = err_tail.clone();
            thread::Builder::new()
                .name(format!("{}-err", name))
                .spawn(move || capture_tail(stderr, tail))
                .ok();
        }
        OsChild {
            process: Process::new(pid),
            // setsid makes the child its own group leader, so the pgid is
            // the child's pid.
            pgid: pid as Pid,
            stdout: out_tail,
            stderr: err_tail,
        }
    }
}

impl ChildHandle for OsChild {
    fn pid(&self) -> Pid {
        self.process.id()
    }

    fn pgid(&self) -> Pid {
        self.pgid
    }

    fn poll(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.process.try_wait()?)
    }

    fn wait_timeout(&mut self, timeout: StdDuration) -> Result<Option<ExitStatus>> {
        Ok(self.process.wait_timeout(timeout)?)
    }

    fn signal(&mut self, signal: Signal) -> Result<()> {
        Ok(process::signal(self.process.id(), signal)?)
    }

    fn kill_group(&mut self) -> Result<()> {
        Ok(process::signal_group(self.pgid, Signal::KILL)?)
    }

    fn output_tail(&self) -> OutputTail {
        OutputTail {
            stdout: self.stdout.lock().map(|t| t.iter().cloned().collect()).unwrap_or_default(),
            stderr: self.stderr.lock().map(|t| t.iter().cloned().collect()).unwrap_or_default(),
        }
    }
}

/// Consume a child output stream until EOF, keeping the last `TAIL_LINES`
/// lines.
fn capture_tail<T>(stream: T, tail: Arc<Mutex<VecDeque<String>>>)
where
    T: Read,
{
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        let mut tail = match tail.lock() {
            Ok(tail) => tail,
            Err(_) => break,
        };
        if tail.len() == TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

/// A fake fleet for exercising supervision logic without real processes.
#[cfg(test)]
pub mod fake {
    use std::collections::HashMap;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;
    use std::sync::{Arc, Mutex};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration as StdDuration, Instant};

    use core::os::process::{Pid, Signal};
    use error::{Error, Result};
    use manager::worker::WorkerSpec;

    use super::{ChildHandle, OutputTail, ProcessSpawner, LOGKEY};

    /// Pids far outside anything the host will allocate, so `/proc` walks
    /// find nothing.
    const FAKE_PID_BASE: Pid = 900_000;

    #[derive(Clone, Copy, Debug)]
    pub enum FakeBehavior {
        /// Exits on its own after the delay, as a worker honoring
        /// `POST /shutdown` would.
        ExitAfter(StdDuration),
        /// Exits only when signaled with SIGTERM.
        ExitOnTerm,
        /// Ignores SIGTERM; dies only from a group SIGKILL.
        IgnoreTerm,
        /// Survives everything, SIGKILL included.
        Immortal,
        /// Exits immediately with the given code (a crashing worker).
        ExitImmediately(i32),
        /// The spawn itself fails.
        FailSpawn,
    }

    pub struct FakeSpawner {
        behaviors: Mutex<HashMap<String, FakeBehavior>>,
        default: FakeBehavior,
        pub spawn_count: AtomicUsize,
        next_pid: AtomicUsize,
    }

    impl FakeSpawner {
        pub fn new(default: FakeBehavior) -> FakeSpawner {
            FakeSpawner {
                behaviors: Mutex::new(HashMap::new()),
                default: default,
                spawn_count: AtomicUsize::new(0),
                next_pid: AtomicUsize::new(FAKE_PID_BASE as usize),
            }
        }

        /// Override the behavior for one worker by name.
        pub fn set_behavior(&self, name: &str, behavior: FakeBehavior) {
            self.behaviors
                .lock()
                .unwrap()
                .insert(String::from(name), behavior);
        }

        pub fn spawns(&self) -> usize {
            self.spawn_count.load(Ordering::SeqCst)
        }
    }

    impl ProcessSpawner for FakeSpawner {
        fn spawn(&self, spec: &WorkerSpec) -> Result<Box<ChildHandle>> {
            self.spawn_count.fetch_add(1, Ordering::SeqCst);
            let behavior = self.behaviors
                .lock()
                .unwrap()
                .get(&spec.name)
                .cloned()
                .unwrap_or(self.default);
            match behavior {
                FakeBehavior::FailSpawn => {
                    Err(sup_error!(Error::Spawn(
                        spec.name.clone(),
                        ::std::io::Error::new(
                            ::std::io::ErrorKind::NotFound,
                            "no such worker binary",
                        ),
                    )))
                }
                behavior => {
                    let pid = self.next_pid.fetch_add(1, Ordering::SeqCst) as Pid;
                    Ok(Box::new(FakeChild {
                        pid: pid,
                        behavior: behavior,
                        spawned_at: Instant::now(),
                        exit_raw: Arc::new(Mutex::new(None)),
                        term_count: 0,
                        kill_count: 0,
                    }))
                }
            }
        }
    }

    pub struct FakeChild {
        pid: Pid,
        behavior: FakeBehavior,
        spawned_at: Instant,
        // Raw wait(2) status once the fake child has "exited".
        exit_raw: Arc<Mutex<Option<i32>>>,
        pub term_count: u32,
        pub kill_count: u32,
    }

    impl FakeChild {
        fn exit_status(&self) -> Option<ExitStatus> {
            if let Some(raw) = *self.exit_raw.lock().unwrap() {
                return Some(ExitStatus::from_raw(raw));
            }
            match self.behavior {
                FakeBehavior::ExitImmediately(code) => Some(ExitStatus::from_raw(code << 8)),
                FakeBehavior::ExitAfter(delay) => {
                    if self.spawned_at.elapsed() >= delay {
                        Some(ExitStatus::from_raw(0))
                    } else {
                        None
                    }
                }
                _ => None,
            }
        }
    }

    impl ChildHandle for FakeChild {
        fn pid(&self) -> Pid {
            self.pid
        }

        fn pgid(&self) -> Pid {
            self.pid
        }

        fn poll(&mut self) -> Result<Option<ExitStatus>> {
            Ok(self.exit_status())
        }

        fn wait_timeout(&mut self, timeout: StdDuration) -> Result<Option<ExitStatus>> {
            let deadline = Instant::now() + timeout;
            loop {
                if let Some(status) = self.exit_status() {
                    return Ok(Some(status));
                }
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                thread::sleep(StdDuration::from_millis(10));
            }
        }

        fn signal(&mut self, signal: Signal) -> Result<()> {
            if signal == Signal::TERM {
                self.term_count += 1;
                match self.behavior {
                    FakeBehavior::ExitOnTerm => {
                        // Clean exit in response to SIGTERM.
                        *self.exit_raw.lock().unwrap() = Some(0);
                    }
                    _ => (),
                }
            }
            Ok(())
        }

        fn kill_group(&mut self) -> Result<()> {
            self.kill_count += 1;
            match self.behavior {
                FakeBehavior::Immortal => (),
                _ => {
                    // Terminated by SIGKILL.
                    *self.exit_raw.lock().unwrap() = Some(9);
                }
            }
            Ok(())
        }

        fn output_tail(&self) -> OutputTail {
            OutputTail::default()
        }
    }
}
