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

use std::error;
use std::fmt;
use std::io;
use std::result;

use libc;

pub type Result<T> = result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// `waitpid(2)` failed for the given child.
    ExecWait(io::Error),
    /// `kill(2)`/`killpg(2)` failed for a reason other than the target
    /// being gone already.
    SignalFailed(libc::pid_t, io::Error),
    /// Reading the OS process table (`/proc`) failed.
    ProcessTable(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::ExecWait(ref e) => write!(f, "Error waiting on child process, {}", e),
            Error::SignalFailed(pid, ref e) => {
                write!(f, "Failed to send a signal to pid {}, {}", pid, e)
            }
            Error::ProcessTable(ref e) => write!(f, "Failed to read the process table, {}", e),
        }
    }
}

impl error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::ProcessTable(err)
    }
}
