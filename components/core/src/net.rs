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

//! Port probing by `bind()`.
//!
//! A probe that `connect()`s can succeed against a socket in `TIME_WAIT`
//! or one held open by a half-dead descendant; only a successful exclusive
//! `bind()` proves the port is safe to start a worker on. For the same
//! reason the probe socket must not set `SO_REUSEADDR`. That rules out
//! `std::net::TcpListener`, whose `bind` sets it, so the probe goes
//! through `libc` directly.

use std::io;
use std::mem;
use std::thread;
use std::time::Duration as StdDuration;

use libc;
use time::{Duration, SteadyTime};

use os::process::Pid;
use os::system;

/// How often `wait_for_port_free` re-probes.
const PROBE_INTERVAL_MS: u64 = 500;

pub fn is_port_free(port: u16) -> bool {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            warn!(
                "unable to create a probe socket for port {}: {}",
                port,
                io::Error::last_os_error()
            );
            return false;
        }
        let mut addr: libc::sockaddr_in = mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr.s_addr = libc::INADDR_ANY;
        let rc = libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        if rc != 0 {
            debug!(
                "port {} is occupied, bind failed: {}",
                port,
                io::Error::last_os_error()
            );
        }
        libc::close(fd);
        rc == 0
    }
}

/// Poll until `port` binds cleanly or `timeout` passes, on the monotonic
/// clock.
pub fn wait_for_port_free(port: u16, timeout: StdDuration) -> bool {
    let start = SteadyTime::now();
    let deadline = start + Duration::milliseconds(timeout.as_millis() as i64);
    let mut checks = 0;
    loop {
        checks += 1;
        if is_port_free(port) {
            let waited = SteadyTime::now() - start;
            debug!(
                "port {} free after {}ms and {} checks",
                port,
                waited.num_milliseconds(),
                checks
            );
            return true;
        }
        if SteadyTime::now() >= deadline {
            warn!(
                "port {} still occupied after {}ms and {} checks",
                port,
                (SteadyTime::now() - start).num_milliseconds(),
                checks
            );
            return false;
        }
        thread::sleep(StdDuration::from_millis(PROBE_INTERVAL_MS));
    }
}

/// The process found holding a TCP port.
#[derive(Clone, Debug)]
pub struct PortHolder {
    pub pid: Pid,
    pub name: String,
    pub cmdline: String,
    /// Kernel socket state, e.g. `LISTEN` or `TIME_WAIT`.
    pub state: String,
}

/// Find who holds `port`, best effort.
///
/// Walks `/proc/net/tcp{,6}` for a socket bound to the port, then scans
/// process fd tables for the owning pid. Distinguishes "our worker leaked
/// its listener" from "another tenant grabbed the port".
#[cfg(target_os = "linux")]
pub fn diagnose_port_holder(port: u16) -> Option<PortHolder> {
    let inode = linux::socket_inode_for_port(port)?;
    let (inode, state) = inode;
    let pid = linux::pid_for_socket_inode(&inode)?;
    let name = system::process_table()
        .ok()
        .and_then(|table| table.into_iter().find(|i| i.pid == pid))
        .map(|i| i.name)
        .unwrap_or_else(|| String::from("<unknown>"));
    let cmdline = system::cmdline(pid).unwrap_or_else(|| String::from("<unknown>"));
    Some(PortHolder {
        pid: pid,
        name: name,
        cmdline: cmdline,
        state: state,
    })
}

#[cfg(not(target_os = "linux"))]
pub fn diagnose_port_holder(_port: u16) -> Option<PortHolder> {
    None
}

#[cfg(target_os = "linux")]
mod linux {
    use std::fs;

    use os::process::Pid;

    /// TCP socket states as encoded in `/proc/net/tcp`.
    fn state_name(code: &str) -> &'static str {
        match code {
            "01" => "ESTABLISHED",
            "02" => "SYN_SENT",
            "03" => "SYN_RECV",
            "04" => "FIN_WAIT1",
            "05" => "FIN_WAIT2",
            "06" => "TIME_WAIT",
            "07" => "CLOSE",
            "08" => "CLOSE_WAIT",
            "09" => "LAST_ACK",
            "0A" => "LISTEN",
            "0B" => "CLOSING",
            _ => "UNKNOWN",
        }
    }

    /// Find the socket inode of any entry bound to `port`, preferring
    /// listeners over lingering connection states.
    pub fn socket_inode_for_port(port: u16) -> Option<(String, String)> {
        let mut fallback = None;
        for path in &["/proc/net/tcp", "/proc/net/tcp6"] {
            let raw = match fs::read_to_string(path) {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            for line in raw.lines().skip(1) {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() < 10 {
                    continue;
                }
                let local_port = fields[1]
                    .rsplit(':')
                    .next()
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok());
                if local_port != Some(port as u32) {
                    continue;
                }
                let state = String::from(state_name(fields[3]));
                let inode = String::from(fields[9]);
                if fields[3] == "0A" {
                    return Some((inode, state));
                }
                if fallback.is_none() {
                    fallback = Some((inode, state));
                }
            }
        }
        fallback
    }

    /// Scan `/proc/<pid>/fd` tables for the pid holding the socket inode.
    pub fn pid_for_socket_inode(inode: &str) -> Option<Pid> {
        let target = format!("socket:[{}]", inode);
        for entry in fs::read_dir("/proc").ok()? {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let pid = match entry.file_name().to_str().and_then(|n| n.parse::<Pid>().ok()) {
                Some(pid) => pid,
                None => continue,
            };
            let fd_dir = match fs::read_dir(entry.path().join("fd")) {
                Ok(dir) => dir,
                // Not ours to inspect; keep looking.
                Err(_) => continue,
            };
            for fd in fd_dir {
                let fd = match fd {
                    Ok(fd) => fd,
                    Err(_) => continue,
                };
                if let Ok(dest) = fs::read_link(fd.path()) {
                    if dest.to_str() == Some(target.as_str()) {
                        return Some(pid);
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod test {
    use std::net::TcpListener;
    use std::time::Duration as StdDuration;

    use super::*;

    #[test]
    fn bound_port_is_not_free() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_port_free(port));
        drop(listener);
        assert!(is_port_free(port));
    }

    #[test]
    fn wait_for_port_free_times_out_while_held() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!wait_for_port_free(port, StdDuration::from_millis(700)));
        drop(listener);
        assert!(wait_for_port_free(port, StdDuration::from_millis(700)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn diagnosis_names_ourselves_as_holder() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let holder = diagnose_port_holder(port).expect("expected to find a holder");
        assert_eq!(holder.pid, unsafe { ::libc::getpid() });
        assert_eq!(holder.state, "LISTEN");
    }
}
