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

//! Registry of connected protocol clients.
//!
//! Shutdown is two-staged: clients are told the server is going away and
//! given a window to hang up on their own; whoever remains is disconnected
//! by force, each under its own timeout. A transport that will not close
//! marks its client `Error` but never blocks the others.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Mutex;
use std::sync::mpsc;
use std::thread;
use std::time::Duration as StdDuration;

use serde_json;
use time::{self, SteadyTime};

static LOGKEY: &'static str = "CL";

/// How often the cooperative-disconnect wait re-checks the registry.
const DISCONNECT_POLL_MS: u64 = 100;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClientState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Error,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = match *self {
            ClientState::Connecting => "connecting",
            ClientState::Connected => "connected",
            ClientState::Disconnecting => "disconnecting",
            ClientState::Disconnected => "disconnected",
            ClientState::Error => "error",
        };
        write!(f, "{}", state)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DisconnectReason {
    Shutdown,
    Error,
    Timeout,
    ClientRequest,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match *self {
            DisconnectReason::Shutdown => "shutdown",
            DisconnectReason::Error => "error",
            DisconnectReason::Timeout => "timeout",
            DisconnectReason::ClientRequest => "client_request",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A client's wire handle, chosen at registration. No runtime capability
/// sniffing; what a transport can do is part of its variant.
pub enum Transport {
    /// A connected TCP stream speaking line-delimited JSON-RPC.
    Stream(TcpStream),
    /// A sink, for embedders that deliver notifications elsewhere.
    Null,
}

impl Transport {
    fn send_line(&mut self, line: &str) -> io::Result<usize> {
        match *self {
            Transport::Stream(ref mut stream) => {
                stream.write_all(line.as_bytes())?;
                stream.write_all(b"\n")?;
                stream.flush()?;
                Ok(line.len() + 1)
            }
            Transport::Null => Ok(0),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        match *self {
            Transport::Stream(ref mut stream) => stream.shutdown(Shutdown::Both),
            Transport::Null => Ok(()),
        }
    }
}

#[derive(Serialize)]
struct Notification<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: &'a serde_json::Value,
}

pub struct Client {
    pub id: String,
    pub group: Option<String>,
    pub state: ClientState,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub pending_requests: u32,
    pub error_count: u32,
    pub connected_at_secs: i64,
    transport: Transport,
    disconnect_callbacks: Vec<Box<FnMut() + Send>>,
}

impl Client {
    fn new(id: &str, transport: Transport, group: Option<&str>) -> Client {
        Client {
            id: String::from(id),
            group: group.map(String::from),
            state: ClientState::Connected,
            bytes_sent: 0,
            bytes_received: 0,
            pending_requests: 0,
            error_count: 0,
            connected_at_secs: time::get_time().sec,
            transport: transport,
            disconnect_callbacks: Vec::new(),
        }
    }

    fn set_state(&mut self, state: ClientState) {
        if self.state == state {
            return;
        }
        debug!("client {} state {} -> {}", self.id, self.state, state);
        self.state = state;
    }

    fn send_notification(&mut self, method: &str, params: &serde_json::Value) -> io::Result<()> {
        let notification = Notification {
            jsonrpc: "2.0",
            method: method,
            params: params,
        };
        let line = serde_json::to_string(&notification)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        match self.transport.send_line(&line) {
            Ok(sent) => {
                self.bytes_sent += sent as u64;
                Ok(())
            }
            Err(err) => {
                self.error_count += 1;
                Err(err)
            }
        }
    }

    /// Run disconnect callbacks and close the transport.
    fn close(&mut self, reason: DisconnectReason) -> io::Result<()> {
        self.set_state(ClientState::Disconnecting);
        for callback in self.disconnect_callbacks.iter_mut() {
            callback();
        }
        match self.transport.close() {
            Ok(()) => {
                debug!("client {} disconnected ({})", self.id, reason);
                self.set_state(ClientState::Disconnected);
                Ok(())
            }
            Err(err) => {
                self.error_count += 1;
                self.set_state(ClientState::Error);
                Err(err)
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: Vec<String>,
}

impl BroadcastReport {
    pub fn ok(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct ClientShutdownReport {
    /// Clients that hung up on their own inside the grace window.
    pub cooperative: usize,
    /// Clients we had to disconnect.
    pub forced: usize,
    pub failures: Vec<String>,
}

impl ClientShutdownReport {
    pub fn ok(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct ClientRegistry {
    clients: Mutex<HashMap<String, Client>>,
}

impl ClientRegistry {
    pub fn new() -> ClientRegistry {
        ClientRegistry {
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_client(&self, id: &str, transport: Transport, group: Option<&str>) {
        let mut clients = self.clients.lock().expect("client registry lock poisoned");
        debug!("client {} connected (group: {:?})", id, group);
        clients.insert(String::from(id), Client::new(id, transport, group));
    }

    /// Attach a callback to run when the client disconnects, however that
    /// happens.
    pub fn add_disconnect_callback(&self, id: &str, callback: Box<FnMut() + Send>) -> bool {
        let mut clients = self.clients.lock().expect("client registry lock poisoned");
        match clients.get_mut(id) {
            Some(client) => {
                client.disconnect_callbacks.push(callback);
                true
            }
            None => false,
        }
    }

    pub fn remove_client(&self, id: &str, reason: DisconnectReason) -> bool {
        let client = {
            let mut clients = self.clients.lock().expect("client registry lock poisoned");
            clients.remove(id)
        };
        match client {
            Some(mut client) => {
                if let Err(err) = client.close(reason) {
                    warn!("error closing client {}: {}", id, err);
                }
                true
            }
            None => false,
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients
            .lock()
            .expect("client registry lock poisoned")
            .len()
    }

    pub fn connected_count(&self) -> usize {
        self.clients
            .lock()
            .expect("client registry lock poisoned")
            .values()
            .filter(|c| {
                c.state == ClientState::Connected || c.state == ClientState::Connecting
            })
            .count()
    }

    /// Notify clients, optionally restricted to a group tag. Send failures
    /// are recorded per client and do not stop the broadcast.
    pub fn broadcast(
        &self,
        method: &str,
        params: &serde_json::Value,
        group: Option<&str>,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut clients = self.clients.lock().expect("client registry lock poisoned");
        for client in clients.values_mut() {
            if client.state != ClientState::Connected && client.state != ClientState::Connecting {
                continue;
            }
            if let Some(group) = group {
                if client.group.as_ref().map(|g| g.as_str()) != Some(group) {
                    continue;
                }
            }
            match client.send_notification(method, params) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    warn!("failed to notify client {}: {}", client.id, err);
                    report.failed.push(client.id.clone());
                }
            }
        }
        debug!(
            "broadcast {} delivered to {} client(s), {} failure(s)",
            method,
            report.delivered,
            report.failed.len()
        );
        report
    }

    /// The `server/shutdown` notification body.
    pub fn shutdown_params(reason: DisconnectReason, grace_period: StdDuration) -> serde_json::Value {
        let now = time::get_time();
        let timestamp = now.sec as f64 + f64::from(now.nsec) / 1_000_000_000.0;
        json_object(reason, grace_period, timestamp)
    }

    /// Two-stage close: tell everyone, wait out the grace window, then
    /// force whoever is left, each under `force_timeout`.
    pub fn graceful_shutdown(
        &self,
        grace_period: StdDuration,
        force_timeout: StdDuration,
    ) -> ClientShutdownReport {
        let mut report = ClientShutdownReport::default();
        let starting = self.connected_count();
        if starting == 0 {
            debug!("no clients connected");
            return report;
        }
        outputln!(
            "disconnecting {} client(s) (grace: {}ms, force: {}ms)",
            starting,
            grace_period.as_millis(),
            force_timeout.as_millis()
        );

        let params = Self::shutdown_params(DisconnectReason::Shutdown, grace_period);
        self.broadcast("server/shutdown", &params, None);

        // Stage 1: cooperative. Clients unregister themselves via
        // remove_client from their connection handlers.
        let deadline = SteadyTime::now() +
            ::time::Duration::milliseconds(grace_period.as_millis() as i64);
        while self.connected_count() > 0 && SteadyTime::now() < deadline {
            thread::sleep(StdDuration::from_millis(DISCONNECT_POLL_MS));
        }
        report.cooperative = starting.saturating_sub(self.connected_count());

        // Stage 2: forced.
        let remaining: Vec<Client> = {
            let mut clients = self.clients.lock().expect("client registry lock poisoned");
            let ids: Vec<String> = clients.keys().cloned().collect();
            ids.into_iter().filter_map(|id| clients.remove(&id)).collect()
        };
        if remaining.is_empty() {
            outputln!("all {} client(s) disconnected cooperatively", starting);
            return report;
        }

        let mut waits = Vec::new();
        for client in remaining {
            let mut client = client;
            let id = client.id.clone();
            let (tx, rx) = mpsc::channel();
            let spawned = thread::Builder::new()
                .name(format!("disconnect-{}", id))
                .spawn(move || {
                    let result = client.close(DisconnectReason::Shutdown);
                    tx.send(result.map_err(|e| e.to_string())).ok();
                });
            match spawned {
                Ok(_) => waits.push((id, rx)),
                Err(err) => {
                    report
                        .failures
                        .push(format!("{}: failed to spawn disconnect thread: {}", id, err));
                }
            }
        }
        for (id, rx) in waits {
            match rx.recv_timeout(force_timeout) {
                Ok(Ok(())) => {
                    debug!("client {} force-disconnected", id);
                    report.forced += 1;
                }
                Ok(Err(cause)) => {
                    outputln!("failed to disconnect client {}: {}", id, cause);
                    report.failures.push(format!("{}: {}", id, cause));
                }
                Err(_) => {
                    outputln!(
                        "timed out disconnecting client {} after {}ms",
                        id,
                        force_timeout.as_millis()
                    );
                    report.failures.push(format!("{}: disconnect timed out", id));
                }
            }
        }
        outputln!(
            "client disconnect finished: {} cooperative, {} forced, {} failure(s)",
            report.cooperative,
            report.forced,
            report.failures.len()
        );
        report
    }
}

fn json_object(
    reason: DisconnectReason,
    grace_period: StdDuration,
    timestamp: f64,
) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    map.insert(
        String::from("reason"),
        serde_json::Value::String(String::from(reason.as_str())),
    );
    map.insert(
        String::from("grace_period_seconds"),
        serde_json::Value::from(grace_period.as_secs()),
    );
    map.insert(String::from("timestamp"), serde_json::Value::from(timestamp));
    serde_json::Value::Object(map)
}

#[cfg(test)]
mod test {
    use std::io::{BufRead, BufReader};
    use std::net::{TcpListener, TcpStream};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration as StdDuration;

    use serde_json;

    use super::*;

    /// A loopback stream pair: the registry holds one end, the test reads
    /// the other.
    fn stream_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        let ours = TcpStream::connect(addr).unwrap();
        let (theirs, _) = listener.accept().unwrap();
        (ours, theirs)
    }

    #[test]
    fn broadcast_writes_jsonrpc_lines() {
        let registry = ClientRegistry::new();
        let (ours, theirs) = stream_pair();
        registry.add_client("client-1", Transport::Stream(ours), None);
        let params = ClientRegistry::shutdown_params(
            DisconnectReason::Shutdown,
            StdDuration::from_secs(10),
        );
        let report = registry.broadcast("server/shutdown", &params, None);
        assert!(report.ok());
        assert_eq!(report.delivered, 1);

        let mut line = String::new();
        BufReader::new(theirs).read_line(&mut line).unwrap();
        let message: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(message["jsonrpc"], "2.0");
        assert_eq!(message["method"], "server/shutdown");
        assert_eq!(message["params"]["reason"], "shutdown");
        assert_eq!(message["params"]["grace_period_seconds"], 10);
        assert!(message["params"]["timestamp"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn broadcast_respects_group_tags() {
        let registry = ClientRegistry::new();
        registry.add_client("a", Transport::Null, Some("editors"));
        registry.add_client("b", Transport::Null, Some("agents"));
        registry.add_client("c", Transport::Null, None);
        let params = serde_json::Value::Null;
        let report = registry.broadcast("ping", &params, Some("editors"));
        assert_eq!(report.delivered, 1);
        let report = registry.broadcast("ping", &params, None);
        assert_eq!(report.delivered, 3);
    }

    #[test]
    fn graceful_shutdown_forces_stragglers() {
        let registry = ClientRegistry::new();
        let (ours, _theirs) = stream_pair();
        registry.add_client("straggler", Transport::Stream(ours), None);
        let report = registry.graceful_shutdown(
            StdDuration::from_millis(200),
            StdDuration::from_millis(500),
        );
        assert!(report.ok());
        assert_eq!(report.cooperative, 0);
        assert_eq!(report.forced, 1);
        assert_eq!(registry.client_count(), 0);
    }

    #[test]
    fn cooperative_disconnect_is_observed() {
        let registry = Arc::new(ClientRegistry::new());
        registry.add_client("polite", Transport::Null, None);
        let remote = registry.clone();
        thread::spawn(move || {
            thread::sleep(StdDuration::from_millis(100));
            remote.remove_client("polite", DisconnectReason::ClientRequest);
        });
        let report = registry.graceful_shutdown(
            StdDuration::from_secs(2),
            StdDuration::from_millis(500),
        );
        assert!(report.ok());
        assert_eq!(report.cooperative, 1);
        assert_eq!(report.forced, 0);
    }

    #[test]
    fn disconnect_callbacks_fire_on_close() {
        let registry = ClientRegistry::new();
        registry.add_client("cb", Transport::Null, None);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        assert!(registry.add_disconnect_callback(
            "cb",
            Box::new(move || { counter.fetch_add(1, Ordering::SeqCst); }),
        ));
        registry.remove_client("cb", DisconnectReason::Shutdown);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
