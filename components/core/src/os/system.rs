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

//! Process-table inspection via `/proc`.
//!
//! Used to find descendants of a worker's original pid after termination,
//! to spot zombies among them, and to emit one-line system-state events at
//! phase boundaries.

use std::fs;

use libc::{self, c_int};

use error::Result;
use os::process::Pid;

/// A row from the OS process table.
#[derive(Clone, Debug)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub ppid: Pid,
    pub name: String,
    /// Single-character state code as reported by the kernel; `Z` is a
    /// zombie awaiting reaping.
    pub state: char,
}

impl ProcessInfo {
    pub fn is_zombie(&self) -> bool {
        self.state == 'Z'
    }
}

/// Snapshot the process table. Processes that vanish mid-scan are skipped.
#[cfg(target_os = "linux")]
pub fn process_table() -> Result<Vec<ProcessInfo>> {
    let mut table = Vec::new();
    for entry in fs::read_dir("/proc")? {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let pid = match entry.file_name().to_str().and_then(|n| n.parse::<Pid>().ok()) {
            Some(pid) => pid,
            None => continue,
        };
        if let Some(info) = read_stat(pid) {
            table.push(info);
        }
    }
    Ok(table)
}

#[cfg(not(target_os = "linux"))]
pub fn process_table() -> Result<Vec<ProcessInfo>> {
    Ok(Vec::new())
}

/// Parse `/proc/<pid>/stat`. The second field is the executable name in
/// parentheses and may itself contain spaces or parentheses, so split on
/// the last closing paren.
#[cfg(target_os = "linux")]
fn read_stat(pid: Pid) -> Option<ProcessInfo> {
    let raw = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    let open = raw.find('(')?;
    let close = raw.rfind(')')?;
    let name = raw.get(open + 1..close)?.to_string();
    let mut rest = raw.get(close + 1..)?.split_whitespace();
    let state = rest.next()?.chars().next()?;
    let ppid = rest.next()?.parse::<Pid>().ok()?;
    Some(ProcessInfo {
        pid: pid,
        ppid: ppid,
        name: name,
        state: state,
    })
}

/// All descendants (children, grandchildren, ...) of `pid` currently in
/// the process table.
pub fn descendants_of(pid: Pid) -> Vec<ProcessInfo> {
    let table = match process_table() {
        Ok(table) => table,
        Err(err) => {
            warn!("Unable to read the process table, {}", err);
            return Vec::new();
        }
    };
    let mut found = Vec::new();
    let mut frontier = vec![pid];
    while let Some(parent) = frontier.pop() {
        for info in table.iter().filter(|i| i.ppid == parent) {
            frontier.push(info.pid);
            found.push(info.clone());
        }
    }
    found
}

/// Zombies among `pid` and its descendants.
pub fn zombies_of(pid: Pid) -> Vec<ProcessInfo> {
    let mut zombies: Vec<ProcessInfo> = descendants_of(pid)
        .into_iter()
        .filter(|i| i.is_zombie())
        .collect();
    if let Some(info) = read_stat_portable(pid) {
        if info.is_zombie() {
            zombies.push(info);
        }
    }
    zombies
}

#[cfg(target_os = "linux")]
fn read_stat_portable(pid: Pid) -> Option<ProcessInfo> {
    read_stat(pid)
}

#[cfg(not(target_os = "linux"))]
fn read_stat_portable(_pid: Pid) -> Option<ProcessInfo> {
    None
}

/// Attempt a non-blocking reap of `pid`. Returns true if the zombie was
/// collected by this call. A pid that is not our direct child cannot be
/// reaped here; its parent owns that duty.
pub fn reap(pid: Pid) -> bool {
    let mut status = 0 as c_int;
    match unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) } {
        p if p == pid => true,
        _ => false,
    }
}

/// Full command line of a process, best effort.
#[cfg(target_os = "linux")]
pub fn cmdline(pid: Pid) -> Option<String> {
    let raw = fs::read(format!("/proc/{}/cmdline", pid)).ok()?;
    if raw.is_empty() {
        return None;
    }
    let line: Vec<String> = raw.split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect();
    Some(line.join(" "))
}

#[cfg(not(target_os = "linux"))]
pub fn cmdline(_pid: Pid) -> Option<String> {
    None
}

/// Emit a one-line view of our own subtree. Called at phase boundaries so
/// the log tells us what was alive when things went sideways.
pub fn log_process_state(label: &str) {
    let pid = unsafe { libc::getpid() };
    let children = descendants_of(pid);
    let zombies = children.iter().filter(|i| i.is_zombie()).count();
    debug!(
        "system state {}: pid={} descendants={} zombies={}",
        label,
        pid,
        children.len(),
        zombies
    );
    for child in children {
        debug!(
            "system state {}: child pid={} name={} state={}",
            label, child.pid, child.name, child.state
        );
    }
}

#[cfg(all(test, target_os = "linux"))]
mod test {
    use std::process::Command;
    use std::thread;
    use std::time::Duration;

    use libc;

    use super::*;
    use os::process::{self, Process, Signal};

    #[test]
    fn descendants_include_spawned_children() {
        let child = Command::new("sleep")
            .arg("2")
            .spawn()
            .expect("failed to spawn sleep");
        let me = unsafe { libc::getpid() };
        let descendants = descendants_of(me);
        assert!(descendants.iter().any(|i| i.pid == child.id() as Pid));
        let mut handle = Process::new(child.id());
        process::signal(handle.id(), Signal::KILL).unwrap();
        handle.wait().unwrap();
    }

    #[test]
    fn unreaped_child_shows_as_zombie_and_reaps() {
        let child = Command::new("true").spawn().expect("failed to spawn true");
        let pid = child.id() as Pid;
        // Give it a moment to exit without wait()ing on it.
        thread::sleep(Duration::from_millis(200));
        let me = unsafe { libc::getpid() };
        let zombies = zombies_of(me);
        assert!(zombies.iter().any(|i| i.pid == pid));
        assert!(reap(pid));
        assert!(!zombies_of(me).iter().any(|i| i.pid == pid));
    }
}
