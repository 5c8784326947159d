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

//! The shutdown orchestrator.
//!
//! A fixed phase sequence: notify clients, disconnect clients, terminate
//! workers, run pre-cleanup callbacks, close resources, verify. Before any
//! of it, the health loop is stopped; otherwise the supervisor restarts
//! workers while trying to kill them. No phase starts before the previous
//! one returns or times out, and failures are aggregated into a single
//! exit code where the highest severity wins.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use time::SteadyTime;

use core::net;
use core::os::system;
use manager::Manager;
use registry::clients::{ClientRegistry, DisconnectReason};
use registry::resources::{CleanupFn, ResourceRegistry};
use shutdown::{self, EXIT_CLIENT_DISCONNECT, EXIT_INTERNAL_ERROR, EXIT_OK, EXIT_PORT_HELD,
               EXIT_RESOURCE_CLEANUP, EXIT_WORKER_TIMEOUT, EXIT_ZOMBIE};
use shutdown::coordinator::ShutdownCoordinator;

static LOGKEY: &'static str = "OR";

/// Phase 2 gets this share of the grace period for cooperative client
/// disconnect.
const CLIENT_GRACE_SHARE: f64 = 0.3;
/// And this share of the force timeout for each forced disconnect.
const CLIENT_FORCE_SHARE: f64 = 0.5;

pub struct OrchestratorConfig {
    pub grace_period: StdDuration,
    pub force_timeout: StdDuration,
}

impl Default for OrchestratorConfig {
    fn default() -> OrchestratorConfig {
        OrchestratorConfig {
            grace_period: StdDuration::from_secs(10),
            force_timeout: StdDuration::from_secs(5),
        }
    }
}

struct PhaseResult {
    ok: bool,
    exit_contribution: i32,
    failures: Vec<String>,
}

impl PhaseResult {
    fn clean() -> PhaseResult {
        PhaseResult {
            ok: true,
            exit_contribution: EXIT_OK,
            failures: Vec::new(),
        }
    }

    fn failed(exit_contribution: i32, failures: Vec<String>) -> PhaseResult {
        PhaseResult {
            ok: false,
            exit_contribution: exit_contribution,
            failures: failures,
        }
    }
}

/// Drives the phase sequence. Holds non-owning references to the
/// registries and the supervisor; they own their populations.
pub struct ShutdownOrchestrator {
    coordinator: Arc<ShutdownCoordinator>,
    manager: Arc<Manager>,
    clients: Arc<ClientRegistry>,
    resources: Arc<ResourceRegistry>,
    callbacks: Mutex<Vec<(String, CleanupFn)>>,
    config: OrchestratorConfig,
}

impl ShutdownOrchestrator {
    pub fn new(
        coordinator: Arc<ShutdownCoordinator>,
        manager: Arc<Manager>,
        clients: Arc<ClientRegistry>,
        resources: Arc<ResourceRegistry>,
        config: OrchestratorConfig,
    ) -> ShutdownOrchestrator {
        ShutdownOrchestrator {
            coordinator: coordinator,
            manager: manager,
            clients: clients,
            resources: resources,
            callbacks: Mutex::new(Vec::new()),
            config: config,
        }
    }

    /// Register a pre-cleanup callback, run in Phase 4 before any
    /// resource closes.
    pub fn register_callback(&self, name: &str, callback: CleanupFn) {
        self.callbacks
            .lock()
            .expect("orchestrator callback lock poisoned")
            .push((String::from(name), callback));
    }

    /// Run the whole sequence and return the process exit code. This is
    /// the only place an unexpected failure is caught; everything below
    /// aggregates.
    pub fn run(&self) -> i32 {
        match panic::catch_unwind(AssertUnwindSafe(|| self.execute())) {
            Ok(code) => code,
            Err(_) => {
                outputln!("CRITICAL: unhandled panic in the shutdown orchestrator");
                EXIT_INTERNAL_ERROR
            }
        }
    }

    fn execute(&self) -> i32 {
        let start = SteadyTime::now();
        outputln!(
            "shutdown starting (reason: {})",
            self.coordinator
                .reason()
                .unwrap_or_else(|| String::from("unknown"))
        );
        system::log_process_state("SHUTDOWN_STARTING");

        // Phase 0, non-negotiable: quiesce the health loop so nothing
        // restarts a worker underneath Phase 3.
        self.manager.stop_monitor();

        let mut code = EXIT_OK;
        let mut completed = Vec::new();
        code = shutdown::worst(
            code,
            self.run_phase("notify", &mut completed, || self.phase_notify()),
        );
        code = shutdown::worst(
            code,
            self.run_phase("clients", &mut completed, || self.phase_clients()),
        );
        code = shutdown::worst(
            code,
            self.run_phase("workers", &mut completed, || self.phase_workers()),
        );
        code = shutdown::worst(
            code,
            self.run_phase("callbacks", &mut completed, || self.phase_callbacks()),
        );
        code = shutdown::worst(
            code,
            self.run_phase("resources", &mut completed, || self.phase_resources()),
        );
        code = shutdown::worst(
            code,
            self.run_phase("verify", &mut completed, || self.phase_verify()),
        );

        system::log_process_state("SHUTDOWN_COMPLETED");
        let elapsed = SteadyTime::now() - start;
        outputln!(
            "shutdown complete in {}ms: completed phases [{}], exit code {}",
            elapsed.num_milliseconds(),
            completed.join(", "),
            code
        );
        code
    }

    fn run_phase<F>(&self, name: &str, completed: &mut Vec<String>, phase: F) -> i32
    where
        F: FnOnce() -> PhaseResult,
    {
        let start = SteadyTime::now();
        outputln!("phase={} status=start", name);
        let result = phase();
        let elapsed = SteadyTime::now() - start;
        outputln!(
            "phase={} status={} duration_ms={}",
            name,
            if result.ok { "ok" } else { "fail" },
            elapsed.num_milliseconds()
        );
        for failure in result.failures.iter() {
            outputln!("phase={} failure: {}", name, failure);
        }
        if result.ok {
            completed.push(String::from(name));
        }
        result.exit_contribution
    }

    /// Phase 1: broadcast the shutdown notification. Clients must learn
    /// the server is going away before their transports start closing.
    fn phase_notify(&self) -> PhaseResult {
        let reason = self.coordinator
            .reason()
            .unwrap_or_else(|| String::from("unknown"));
        let mut params = ClientRegistry::shutdown_params(
            DisconnectReason::Shutdown,
            self.config.grace_period,
        );
        params["initiated_by"] = ::serde_json::Value::String(reason);
        let report = self.clients.broadcast("server/shutdown_initiated", &params, None);
        if report.ok() {
            PhaseResult::clean()
        } else {
            PhaseResult::failed(
                EXIT_CLIENT_DISCONNECT,
                report
                    .failed
                    .iter()
                    .map(|id| format!("client {} did not receive the notification", id))
                    .collect(),
            )
        }
    }

    /// Phase 2: two-stage client disconnect.
    fn phase_clients(&self) -> PhaseResult {
        let grace = fraction(self.config.grace_period, CLIENT_GRACE_SHARE);
        let force = fraction(self.config.force_timeout, CLIENT_FORCE_SHARE);
        let report = self.clients.graceful_shutdown(grace, force);
        if report.ok() {
            PhaseResult::clean()
        } else {
            PhaseResult::failed(EXIT_CLIENT_DISCONNECT, report.failures)
        }
    }

    /// Phase 3: concurrent worker termination under the fleet umbrella.
    fn phase_workers(&self) -> PhaseResult {
        let report = self.manager.shutdown_all();
        let code = report.exit_contribution();
        if report.ok() && code == EXIT_OK {
            PhaseResult::clean()
        } else {
            let mut failures: Vec<String> = Vec::new();
            for worker_report in report.reports.iter() {
                for failure in worker_report.failures.iter() {
                    failures.push(format!("{}: {}", worker_report.name, failure));
                }
                if let Some(ref verification) = worker_report.verification {
                    for failure in verification.failures.iter() {
                        failures.push(format!("{}: {}", worker_report.name, failure));
                    }
                }
            }
            for name in report.stragglers.iter() {
                failures.push(format!("{}: no shutdown result inside the umbrella", name));
            }
            PhaseResult {
                ok: report.ok(),
                exit_contribution: code,
                failures: failures,
            }
        }
    }

    /// Phase 4: user-registered pre-cleanup callbacks, then any the
    /// resource registry carries. Workers are gone by now; resources are
    /// still open.
    fn phase_callbacks(&self) -> PhaseResult {
        let own = {
            let mut callbacks = self.callbacks
                .lock()
                .expect("orchestrator callback lock poisoned");
            callbacks.drain(..).collect::<Vec<_>>()
        };
        for (name, callback) in own {
            self.resources.add_cleanup_callback(&name, callback);
        }
        let report = self.resources.run_cleanup_callbacks();
        if report.ok() {
            PhaseResult::clean()
        } else {
            PhaseResult::failed(
                EXIT_RESOURCE_CLEANUP,
                report
                    .failures
                    .iter()
                    .map(|f| format!("callback {}: {}", f.name, f.cause))
                    .collect(),
            )
        }
    }

    /// Phase 5: close resources in registry order.
    fn phase_resources(&self) -> PhaseResult {
        let report = self.resources.close_all();
        if report.ok() {
            PhaseResult::clean()
        } else {
            PhaseResult::failed(
                EXIT_RESOURCE_CLEANUP,
                report
                    .failures
                    .iter()
                    .map(|f| format!("{} {}: {}", f.kind, f.name, f.cause))
                    .collect(),
            )
        }
    }

    /// Phase 6: verification. Reads only; contributes to the exit code
    /// without changing any state.
    fn phase_verify(&self) -> PhaseResult {
        let mut code = EXIT_OK;
        let mut failures = Vec::new();

        for status in self.manager.status() {
            if status.healthy {
                code = shutdown::worst(code, EXIT_WORKER_TIMEOUT);
                failures.push(format!(
                    "worker {} (pid {:?}) still running after shutdown",
                    status.name, status.pid
                ));
            }
            if !net::is_port_free(status.port) {
                code = shutdown::worst(code, EXIT_PORT_HELD);
                match net::diagnose_port_holder(status.port) {
                    Some(holder) => {
                        failures.push(format!(
                            "port {} still held by pid {} ({}) cmdline \"{}\"",
                            status.port, holder.pid, holder.name, holder.cmdline
                        ));
                    }
                    None => {
                        failures.push(format!(
                            "port {} still held by an unidentified process",
                            status.port
                        ));
                    }
                }
            }
            if let Some(pid) = status.pid {
                let zombies = system::zombies_of(pid);
                if !zombies.is_empty() {
                    code = shutdown::worst(code, EXIT_ZOMBIE);
                    failures.push(format!(
                        "worker {} left {} zombie process(es)",
                        status.name,
                        zombies.len()
                    ));
                }
            }
        }

        let connected = self.clients.connected_count();
        if connected > 0 {
            code = shutdown::worst(code, EXIT_CLIENT_DISCONNECT);
            failures.push(format!("{} client(s) still connected", connected));
        }

        if !self.resources.is_closed() {
            code = shutdown::worst(code, EXIT_RESOURCE_CLEANUP);
            failures.push(String::from("resource registry never closed"));
        }

        if failures.is_empty() {
            PhaseResult::clean()
        } else {
            PhaseResult {
                ok: false,
                exit_contribution: code,
                failures: failures,
            }
        }
    }
}

fn fraction(duration: StdDuration, share: f64) -> StdDuration {
    StdDuration::from_millis((duration.as_millis() as f64 * share) as u64)
}

#[cfg(test)]
mod test {
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    use super::*;
    use manager::{Manager, ManagerConfig};
    use manager::spawner::fake::{FakeBehavior, FakeSpawner};
    use manager::worker::test_spec;
    use registry::clients::Transport;
    use registry::resources::Cleanup;
    use shutdown::{EXIT_RESOURCE_CLEANUP, EXIT_WORKER_FORCE_KILL};

    fn free_port() -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        listener.local_addr().unwrap().port()
    }

    fn harness(behavior: FakeBehavior) -> ShutdownOrchestrator {
        let spawner = Arc::new(FakeSpawner::new(behavior));
        let manager = Arc::new(Manager::new(spawner, ManagerConfig::default()));
        let coordinator = Arc::new(ShutdownCoordinator::new());
        coordinator.request("test");
        ShutdownOrchestrator::new(
            coordinator,
            manager,
            Arc::new(ClientRegistry::new()),
            Arc::new(ResourceRegistry::new()),
            OrchestratorConfig {
                grace_period: StdDuration::from_millis(500),
                force_timeout: StdDuration::from_millis(500),
            },
        )
    }

    #[test]
    fn clean_run_exits_zero() {
        let orchestrator = harness(FakeBehavior::ExitAfter(StdDuration::from_millis(20)));
        orchestrator.manager.add_worker(test_spec("a", free_port()));
        orchestrator.manager.start_all().unwrap();
        orchestrator.clients.add_client("c1", Transport::Null, None);
        orchestrator
            .resources
            .add_database("symbols", Cleanup::Nop);
        // The Null client stays "connected" through the grace window and
        // is force-disconnected, which is still a success.
        assert_eq!(orchestrator.run(), 0);
        assert!(orchestrator.resources.is_closed());
        assert_eq!(orchestrator.clients.client_count(), 0);
    }

    #[test]
    fn force_killed_worker_drives_exit_code_3() {
        let orchestrator = harness(FakeBehavior::IgnoreTerm);
        orchestrator.manager.add_worker(test_spec("stubborn", free_port()));
        orchestrator.manager.start_all().unwrap();
        assert_eq!(orchestrator.run(), EXIT_WORKER_FORCE_KILL);
    }

    #[test]
    fn resource_failure_drives_exit_code_6() {
        let orchestrator = harness(FakeBehavior::ExitAfter(StdDuration::from_millis(20)));
        orchestrator.resources.add_database(
            "broken",
            Cleanup::Run(Box::new(|| Err(String::from("disk gone")))),
        );
        assert_eq!(orchestrator.run(), EXIT_RESOURCE_CLEANUP);
    }

    #[test]
    fn callbacks_run_before_resources_close() {
        let orchestrator = harness(FakeBehavior::ExitAfter(StdDuration::from_millis(20)));
        let order = Arc::new(AtomicUsize::new(0));
        let callback_saw = Arc::new(AtomicUsize::new(99));
        {
            let order = order.clone();
            let callback_saw = callback_saw.clone();
            orchestrator.register_callback(
                "checkpoint",
                Box::new(move || {
                    callback_saw.store(order.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
                    Ok(())
                }),
            );
        }
        let resource_saw = Arc::new(AtomicUsize::new(99));
        {
            let order = order.clone();
            let resource_saw = resource_saw.clone();
            orchestrator.resources.add_database(
                "db",
                Cleanup::Run(Box::new(move || {
                    resource_saw.store(order.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
                    Ok(())
                })),
            );
        }
        assert_eq!(orchestrator.run(), 0);
        assert_eq!(callback_saw.load(Ordering::SeqCst), 0);
        assert_eq!(resource_saw.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exit_code_prefers_the_highest_severity() {
        let orchestrator = harness(FakeBehavior::IgnoreTerm);
        orchestrator.manager.add_worker(test_spec("stubborn", free_port()));
        orchestrator.manager.start_all().unwrap();
        orchestrator.resources.add_database(
            "broken",
            Cleanup::Run(Box::new(|| Err(String::from("flush failed")))),
        );
        // Resource failure (6) outranks force kill (3).
        assert_eq!(orchestrator.run(), EXIT_RESOURCE_CLEANUP);
    }
}
