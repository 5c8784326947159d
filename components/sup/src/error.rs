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

//! Error types for the fleet supervisor.
//!
//! Failures inside a worker, client, or resource are captured and
//! aggregated by the phase that owns them; they never unwind through phase
//! boundaries. The orchestrator's last-resort handler is the only place an
//! unexpected failure escapes to, and it turns into exit code 100.

use std::error;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::result;

use core;
use core::os::process::Pid;
use hyper;
use serde_json;

static LOGKEY: &'static str = "ER";

#[derive(Debug)]
pub struct SupError {
    pub err: Error,
    logkey: &'static str,
    file: &'static str,
    line: u32,
    column: u32,
}

impl SupError {
    pub fn new(
        err: Error,
        logkey: &'static str,
        file: &'static str,
        line: u32,
        column: u32,
    ) -> SupError {
        SupError {
            err: err,
            logkey: logkey,
            file: file,
            line: line,
            column: column,
        }
    }
}

impl fmt::Display for SupError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.err)
    }
}

impl error::Error for SupError {}

pub type Result<T> = result::Result<T, SupError>;

#[derive(Debug)]
pub enum Error {
    /// Every configured worker failed to spawn at startup.
    AllWorkersFailed,
    ConfigFileIO(PathBuf, io::Error),
    ConfigInvalid(String),
    ConfigParse(serde_json::Error),
    /// The graceful-shutdown window expired with the worker still up.
    GracefulTimeout(String),
    HealthParse(serde_json::Error),
    Http(hyper::Error),
    Internal(String),
    Io(io::Error),
    NetErr(core::Error),
    /// Port still bound after the verification window.
    PortLeaked(u16),
    /// Another process held the port at spawn time.
    PortUnavailable(String, u16),
    Spawn(String, io::Error),
    /// The worker survived SIGKILL on its process group.
    TerminationFailed(String),
    /// The SIGTERM window expired with the worker still up.
    TerminationTimeout(String),
    ThreadSpawn(io::Error),
    WorkerNotFound(String),
    /// Zombie pid that survived a reap attempt.
    ZombieUnreaped(Pid),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::AllWorkersFailed => write!(f, "No worker could be started"),
            Error::ConfigFileIO(ref path, ref e) => {
                write!(f, "Unable to read configuration {}, {}", path.display(), e)
            }
            Error::ConfigInvalid(ref msg) => write!(f, "Invalid configuration: {}", msg),
            Error::ConfigParse(ref e) => write!(f, "Unable to parse configuration, {}", e),
            Error::GracefulTimeout(ref name) => {
                write!(f, "Worker {} ignored the graceful shutdown request", name)
            }
            Error::HealthParse(ref e) => write!(f, "Unable to parse health response, {}", e),
            Error::Http(ref e) => write!(f, "HTTP request failed, {}", e),
            Error::Internal(ref msg) => write!(f, "Internal error: {}", msg),
            Error::Io(ref e) => write!(f, "{}", e),
            Error::NetErr(ref e) => write!(f, "{}", e),
            Error::PortLeaked(port) => {
                write!(f, "Port {} still bound after the verification window", port)
            }
            Error::PortUnavailable(ref name, port) => {
                write!(f, "Port {} is not available for worker {}", port, name)
            }
            Error::Spawn(ref name, ref e) => {
                write!(f, "Failed to spawn worker {}, {}", name, e)
            }
            Error::TerminationFailed(ref name) => {
                write!(f, "Worker {} is still running after SIGKILL", name)
            }
            Error::TerminationTimeout(ref name) => {
                write!(f, "Worker {} did not exit within the termination window", name)
            }
            Error::ThreadSpawn(ref e) => write!(f, "Failed to spawn thread, {}", e),
            Error::WorkerNotFound(ref name) => write!(f, "Unknown worker {}", name),
            Error::ZombieUnreaped(pid) => {
                write!(f, "Zombie pid {} survived a reap attempt", pid)
            }
        }
    }
}

impl error::Error for Error {}

#[macro_export]
macro_rules! sup_error {
    ($err:expr) => {{
        $crate::error::SupError::new($err, LOGKEY, file!(), line!(), column!())
    }};
}

impl From<core::Error> for SupError {
    fn from(err: core::Error) -> SupError {
        sup_error!(Error::NetErr(err))
    }
}

impl From<io::Error> for SupError {
    fn from(err: io::Error) -> SupError {
        sup_error!(Error::Io(err))
    }
}

impl From<hyper::Error> for SupError {
    fn from(err: hyper::Error) -> SupError {
        sup_error!(Error::Http(err))
    }
}
