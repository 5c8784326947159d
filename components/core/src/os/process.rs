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

use std::fmt::{self, Display, Formatter};
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::thread;
use std::time::Duration as StdDuration;

use libc::{self, c_int, pid_t};
use time::{Duration, SteadyTime};

use error::{Error, Result};

pub type Pid = pid_t;

/// How often a bounded wait re-polls the child.
const WAIT_POLL_MS: u64 = 100;

#[allow(non_snake_case)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Signal {
    HUP,
    INT,
    TERM,
    KILL,
}

impl Signal {
    pub fn from_signum(signum: c_int) -> Option<Signal> {
        match signum {
            libc::SIGHUP => Some(Signal::HUP),
            libc::SIGINT => Some(Signal::INT),
            libc::SIGTERM => Some(Signal::TERM),
            libc::SIGKILL => Some(Signal::KILL),
            _ => None,
        }
    }
}

impl From<Signal> for c_int {
    fn from(value: Signal) -> c_int {
        match value {
            Signal::HUP => libc::SIGHUP,
            Signal::INT => libc::SIGINT,
            Signal::TERM => libc::SIGTERM,
            Signal::KILL => libc::SIGKILL,
        }
    }
}

impl Display for Signal {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let s = match *self {
            Signal::HUP => "SIGHUP",
            Signal::INT => "SIGINT",
            Signal::TERM => "SIGTERM",
            Signal::KILL => "SIGKILL",
        };
        write!(f, "{}", s)
    }
}

/// Send a signal to a single process.
///
/// A target that has already exited is not an error; the caller is expected
/// to learn the truth from a subsequent wait.
pub fn signal(pid: Pid, signal: Signal) -> Result<()> {
    match unsafe { libc::kill(pid, signal.into()) } {
        0 => Ok(()),
        _ => {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                debug!("pid {} is already gone, not signaling", pid);
                Ok(())
            } else {
                Err(Error::SignalFailed(pid, err))
            }
        }
    }
}

/// Send a signal to an entire process group.
///
/// Signaling a group whose leader has already exited is not an error.
pub fn signal_group(pgid: Pid, signal: Signal) -> Result<()> {
    match unsafe { libc::killpg(pgid, signal.into()) } {
        0 => Ok(()),
        _ => {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                debug!("process group {} is already gone, not signaling", pgid);
                Ok(())
            } else {
                Err(Error::SignalFailed(pgid, err))
            }
        }
    }
}

pub fn is_alive(pid: Pid) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

/// A spawned child process which we are responsible for reaping.
///
/// Unlike `std::process::Child`, waiting is expressed over the raw pid so
/// the same handle type works for children we hold only a pid for.
pub struct Process {
    pid: pid_t,
    status: Option<ExitStatus>,
}

impl Process {
    pub fn new(pid: u32) -> Self {
        Process {
            pid: pid as pid_t,
            status: None,
        }
    }

    pub fn id(&self) -> Pid {
        self.pid
    }

    /// Non-blocking check for exit. Returns the cached status once the
    /// child has been reaped.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        let mut status = 0 as c_int;
        match unsafe { libc::waitpid(self.pid, &mut status, libc::WNOHANG) } {
            0 => Ok(None),
            -1 => Err(Error::ExecWait(io::Error::last_os_error())),
            _ => {
                self.status = Some(ExitStatus::from_raw(status));
                Ok(self.status)
            }
        }
    }

    /// Block until the child exits.
    pub fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let mut status = 0 as c_int;
        match unsafe { libc::waitpid(self.pid, &mut status, 0) } {
            -1 => Err(Error::ExecWait(io::Error::last_os_error())),
            _ => {
                self.status = Some(ExitStatus::from_raw(status));
                Ok(ExitStatus::from_raw(status))
            }
        }
    }

    /// Wait for exit up to `timeout`, polling on the monotonic clock.
    ///
    /// Returns `Ok(None)` if the child is still running when the deadline
    /// passes.
    pub fn wait_timeout(&mut self, timeout: StdDuration) -> Result<Option<ExitStatus>> {
        let deadline = SteadyTime::now() + Duration::milliseconds(timeout.as_millis() as i64);
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            if SteadyTime::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(StdDuration::from_millis(WAIT_POLL_MS));
        }
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "Process {{ pid: {}, status: {:?} }}", self.pid, self.status)
    }
}
