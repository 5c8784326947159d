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

//! Coordinated shutdown: the one-shot latch and the phase orchestrator.

pub mod coordinator;
pub mod orchestrator;

use std::cmp;

/// Process exit codes, graded by severity for process-manager monitoring.
pub const EXIT_OK: i32 = 0;
/// Some client failed to disconnect gracefully.
pub const EXIT_CLIENT_DISCONNECT: i32 = 1;
/// Some worker failed to exit within its budget.
pub const EXIT_WORKER_TIMEOUT: i32 = 2;
/// Some worker required SIGKILL.
pub const EXIT_WORKER_FORCE_KILL: i32 = 3;
/// A port was still held after the verification window.
pub const EXIT_PORT_HELD: i32 = 4;
/// A zombie process survived the reap attempt.
pub const EXIT_ZOMBIE: i32 = 5;
/// A resource failed to clean up.
pub const EXIT_RESOURCE_CLEANUP: i32 = 6;
/// The orchestrator itself failed.
pub const EXIT_INTERNAL_ERROR: i32 = 100;

/// Combine two exit codes: the higher severity wins, and the internal
/// error code always wins.
pub fn worst(a: i32, b: i32) -> i32 {
    if a == EXIT_INTERNAL_ERROR || b == EXIT_INTERNAL_ERROR {
        EXIT_INTERNAL_ERROR
    } else {
        cmp::max(a, b)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn worst_prefers_higher_severity() {
        assert_eq!(worst(EXIT_OK, EXIT_WORKER_TIMEOUT), EXIT_WORKER_TIMEOUT);
        assert_eq!(worst(EXIT_PORT_HELD, EXIT_WORKER_FORCE_KILL), EXIT_PORT_HELD);
        assert_eq!(worst(EXIT_INTERNAL_ERROR, EXIT_ZOMBIE), EXIT_INTERNAL_ERROR);
    }
}
