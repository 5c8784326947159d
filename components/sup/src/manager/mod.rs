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

//! The worker supervisor.
//!
//! Owns the fleet: starts workers on verified-free ports, runs the
//! periodic health loop, restarts failures until their budget is spent,
//! and drives the concurrent per-worker shutdown under an umbrella
//! timeout. The health loop is quiesced before any shutdown signal is
//! sent; a supervisor that can restart workers mid-shutdown will fight
//! itself.

pub mod lifecycle;
pub mod spawner;
pub mod verify;
pub mod worker;

use std::cmp;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration as StdDuration;

use time::{Duration, SteadyTime};

use core::net;
use core::os::process::{self, Pid, Signal};
use core::os::system;
use config;
use error::{Error, Result};
use shutdown::{self, EXIT_OK, EXIT_WORKER_FORCE_KILL, EXIT_WORKER_TIMEOUT};

use self::lifecycle::{ShutdownMethod, WorkerShutdownReport};
use self::spawner::ProcessSpawner;
use self::worker::{HealthOutcome, Worker, WorkerSpec, WorkerState};

static LOGKEY: &'static str = "MG";

/// The health loop sleeps in short slices so a quiesce request is
/// observed promptly even with long intervals.
const MONITOR_SUB_TICK_MS: u64 = 1000;
/// How long a restart waits for the dead worker's port to free up before
/// giving the cycle back to the health loop.
const RESTART_PORT_WAIT_SECS: u64 = 15;
/// Pad on top of the largest per-worker budget for the fleet umbrella.
const UMBRELLA_PAD_SECS: u64 = 5;
/// After an umbrella expiry and emergency kill, how long to drain late
/// per-worker results before reporting stragglers.
const UMBRELLA_DRAIN_SECS: u64 = 5;

pub struct ManagerConfig {
    pub health_interval: StdDuration,
}

impl Default for ManagerConfig {
    fn default() -> ManagerConfig {
        ManagerConfig {
            health_interval: StdDuration::from_secs(config::DEFAULT_HEALTH_INTERVAL_SECS),
        }
    }
}

pub struct Manager {
    workers: Arc<Mutex<HashMap<String, Worker>>>,
    spawner: Arc<ProcessSpawner>,
    stop: Arc<AtomicBool>,
    config: ManagerConfig,
    monitor: Mutex<Option<thread::JoinHandle<()>>>,
}

#[derive(Debug, Serialize)]
pub struct WorkerStatus {
    pub name: String,
    pub port: u16,
    pub pid: Option<Pid>,
    pub state: String,
    pub restart_count: u32,
    pub healthy: bool,
}

impl Manager {
    pub fn new(spawner: Arc<ProcessSpawner>, config: ManagerConfig) -> Manager {
        Manager {
            workers: Arc::new(Mutex::new(HashMap::new())),
            spawner: spawner,
            stop: Arc::new(AtomicBool::new(false)),
            config: config,
            monitor: Mutex::new(None),
        }
    }

    pub fn add_worker(&self, spec: WorkerSpec) {
        let mut workers = self.workers.lock().expect("worker map lock poisoned");
        debug!("added worker {} (port: {})", spec.name, spec.port);
        let name = spec.name.clone();
        if workers.insert(name.clone(), Worker::new(spec)).is_some() {
            warn!("worker {} was already registered; replaced", name);
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().expect("worker map lock poisoned").len()
    }

    /// Start every configured worker, in name order. Individual spawn
    /// failures are logged and tolerated; a fleet where nothing started
    /// is an error.
    pub fn start_all(&self) -> Result<usize> {
        let mut workers = self.workers.lock().expect("worker map lock poisoned");
        let mut names: Vec<String> = workers.keys().cloned().collect();
        names.sort();
        let total = names.len();
        let mut started = 0;
        for name in names {
            if let Some(worker) = workers.get_mut(&name) {
                match start_worker_impl(worker, &*self.spawner) {
                    Ok(()) => started += 1,
                    Err(err) => outputln!(preamble name, "failed to start: {}", err),
                }
            }
        }
        outputln!("started {}/{} workers", started, total);
        system::log_process_state("FLEET_STARTED");
        if started == 0 && total > 0 {
            return Err(sup_error!(Error::AllWorkersFailed));
        }
        Ok(started)
    }

    pub fn start_worker(&self, name: &str) -> Result<()> {
        let mut workers = self.workers.lock().expect("worker map lock poisoned");
        match workers.get_mut(name) {
            Some(worker) => start_worker_impl(worker, &*self.spawner),
            None => Err(sup_error!(Error::WorkerNotFound(String::from(name)))),
        }
    }

    /// Spawn the health monitor thread.
    pub fn start_monitor(&self) -> Result<()> {
        let workers = self.workers.clone();
        let spawner = self.spawner.clone();
        let stop = self.stop.clone();
        let interval = self.config.health_interval;
        let handle = thread::Builder::new()
            .name(String::from("health-monitor"))
            .spawn(move || health_loop(workers, spawner, stop, interval))
            .map_err(|e| sup_error!(Error::ThreadSpawn(e)))?;
        *self.monitor.lock().expect("monitor handle lock poisoned") = Some(handle);
        Ok(())
    }

    /// Quiesce the health loop and wait for it to finish its current
    /// tick. After this returns, nothing will restart a worker.
    pub fn stop_monitor(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let handle = self.monitor
            .lock()
            .expect("monitor handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("health monitor thread panicked");
            }
            outputln!("health monitoring stopped");
        }
    }

    /// Shut the whole fleet down, one thread per worker, under an
    /// umbrella of `max(per-worker budget) + 5s`. Umbrella expiry means
    /// emergency SIGKILL for every process group still alive and a
    /// partial-failure report.
    pub fn shutdown_all(&self) -> FleetShutdownReport {
        let start = SteadyTime::now();
        let mut drained: Vec<Worker> = {
            let mut workers = self.workers.lock().expect("worker map lock poisoned");
            workers.drain().map(|(_, worker)| worker).collect()
        };
        drained.sort_by(|a, b| a.spec.name.cmp(&b.spec.name));
        let total = drained.len();
        if total == 0 {
            outputln!("no workers to shut down");
            return FleetShutdownReport::default();
        }
        outputln!("shutting down {} worker(s)", total);
        system::log_process_state("WORKERS_SHUTDOWN_STARTING");

        let umbrella = drained
            .iter()
            .map(|w| w.spec.shutdown_timeout)
            .max()
            .unwrap_or_else(|| StdDuration::from_secs(config::DEFAULT_SHUTDOWN_TIMEOUT_SECS)) +
            StdDuration::from_secs(UMBRELLA_PAD_SECS);

        // Process groups not yet confirmed dead; the umbrella handler
        // kills exactly these.
        let live: Arc<Mutex<HashMap<String, Pid>>> = Arc::new(Mutex::new(
            drained
                .iter()
                .filter(|w| w.process.is_some())
                .filter_map(|w| w.pgid.map(|pgid| (w.spec.name.clone(), pgid)))
                .collect(),
        ));

        let mut report = FleetShutdownReport::default();
        let (tx, rx) = mpsc::channel();
        let mut dispatched = HashSet::new();
        for worker in drained {
            let name = worker.spec.name.clone();
            let tx = tx.clone();
            let live = live.clone();
            let spawned = thread::Builder::new()
                .name(format!("shutdown-{}", name))
                .spawn(move || {
                    let mut worker = worker;
                    let worker_report = lifecycle::shutdown_worker(&mut worker);
                    if worker_report.method != ShutdownMethod::Unkillable {
                        if let Ok(mut live) = live.lock() {
                            live.remove(&worker.spec.name);
                        }
                    }
                    tx.send((worker, worker_report)).ok();
                });
            match spawned {
                Ok(_) => {
                    dispatched.insert(name);
                }
                Err(err) => {
                    outputln!(preamble name, "failed to spawn shutdown thread: {}", err);
                    report.stragglers.push(name);
                }
            }
        }
        drop(tx);

        let expected = dispatched.len();
        let deadline = SteadyTime::now() +
            Duration::milliseconds(umbrella.as_millis() as i64);
        let mut returned = Vec::new();
        collect_reports(&rx, deadline, expected, &mut returned, &mut report.reports);

        if report.reports.len() < expected {
            outputln!(
                "umbrella timeout after {}ms; emergency kill for still-running workers",
                umbrella.as_millis()
            );
            let still_live: Vec<(String, Pid)> = live.lock()
                .map(|l| l.iter().map(|(k, v)| (k.clone(), *v)).collect())
                .unwrap_or_default();
            for (name, pgid) in still_live {
                outputln!(preamble name, "emergency SIGKILL on process group {}", pgid);
                if let Err(err) = process::signal_group(pgid, Signal::KILL) {
                    warn!("emergency kill of group {} failed: {}", pgid, err);
                }
                report.emergency_killed.push(name);
            }
            let drain_deadline = SteadyTime::now() +
                Duration::seconds(UMBRELLA_DRAIN_SECS as i64);
            collect_reports(&rx, drain_deadline, expected, &mut returned, &mut report.reports);
        }

        // Anything dispatched but never heard from is a straggler; its
        // thread still owns the record.
        let reported: HashSet<String> =
            report.reports.iter().map(|r| r.name.clone()).collect();
        for name in dispatched {
            if !reported.contains(&name) {
                report.stragglers.push(name);
            }
        }
        report.stragglers.sort();

        // Put the records back for the final verification phase.
        {
            let mut workers = self.workers.lock().expect("worker map lock poisoned");
            for worker in returned {
                workers.insert(worker.spec.name.clone(), worker);
            }
        }

        let elapsed = SteadyTime::now() - start;
        report.duration = StdDuration::from_millis(elapsed.num_milliseconds() as u64);
        let successful = report.reports.iter().filter(|r| r.ok()).count();
        outputln!(
            "worker shutdown completed: {}/{} successful in {}ms",
            successful,
            total,
            elapsed.num_milliseconds()
        );
        if !report.stragglers.is_empty() {
            outputln!("workers without a shutdown result: {:?}", report.stragglers);
        }
        system::log_process_state("WORKERS_SHUTDOWN_COMPLETED");
        report
    }

    pub fn status(&self) -> Vec<WorkerStatus> {
        let workers = self.workers.lock().expect("worker map lock poisoned");
        let mut statuses: Vec<WorkerStatus> = workers
            .values()
            .map(|worker| {
                let pid = worker.pid();
                WorkerStatus {
                    name: worker.spec.name.clone(),
                    port: worker.spec.port,
                    pid: pid,
                    state: worker.state().to_string(),
                    restart_count: worker.restart_count,
                    healthy: worker.state() == WorkerState::Running &&
                        pid.map(process::is_alive).unwrap_or(false),
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }
}

#[derive(Debug, Default)]
pub struct FleetShutdownReport {
    pub reports: Vec<WorkerShutdownReport>,
    /// Dispatched workers that produced no result inside the umbrella.
    pub stragglers: Vec<String>,
    /// Workers whose process groups took the emergency SIGKILL.
    pub emergency_killed: Vec<String>,
    pub duration: StdDuration,
}

impl FleetShutdownReport {
    pub fn ok(&self) -> bool {
        self.stragglers.is_empty() && self.emergency_killed.is_empty() &&
            self.reports.iter().all(|r| r.ok())
    }

    pub fn exit_contribution(&self) -> i32 {
        let mut code = self.reports
            .iter()
            .fold(EXIT_OK, |code, r| shutdown::worst(code, r.exit_contribution()));
        if !self.stragglers.is_empty() {
            code = shutdown::worst(code, EXIT_WORKER_TIMEOUT);
        }
        if !self.emergency_killed.is_empty() {
            code = shutdown::worst(code, EXIT_WORKER_FORCE_KILL);
        }
        code
    }
}

fn collect_reports(
    rx: &mpsc::Receiver<(Worker, WorkerShutdownReport)>,
    deadline: SteadyTime,
    expected: usize,
    returned: &mut Vec<Worker>,
    reports: &mut Vec<WorkerShutdownReport>,
) {
    while reports.len() < expected {
        let now = SteadyTime::now();
        if now >= deadline {
            return;
        }
        let remaining = (deadline - now).num_milliseconds();
        match rx.recv_timeout(StdDuration::from_millis(remaining as u64)) {
            Ok((worker, report)) => {
                returned.push(worker);
                reports.push(report);
            }
            Err(_) => return,
        }
    }
}

fn start_worker_impl(worker: &mut Worker, spawner: &ProcessSpawner) -> Result<()> {
    match worker.state() {
        WorkerState::New | WorkerState::Failed => (),
        state => {
            return Err(sup_error!(Error::Internal(format!(
                "cannot start worker {} from state {}",
                worker.name(),
                state
            ))));
        }
    }
    if !net::is_port_free(worker.port()) {
        return Err(sup_error!(
            Error::PortUnavailable(worker.name().to_string(), worker.port())
        ));
    }
    worker.change_state(WorkerState::Starting);
    match spawner.spawn(&worker.spec) {
        Ok(handle) => {
            worker.pgid = Some(handle.pgid());
            let pid = handle.pid();
            worker.process = Some(handle);
            worker.started_at = Some(SteadyTime::now());
            worker.change_state(WorkerState::Running);
            outputln!(
                preamble worker.name(),
                "started on port {} with PID {}",
                worker.port(),
                pid
            );
            Ok(())
        }
        Err(err) => {
            worker.change_state(WorkerState::Failed);
            Err(err)
        }
    }
}

fn health_loop(
    workers: Arc<Mutex<HashMap<String, Worker>>>,
    spawner: Arc<ProcessSpawner>,
    stop: Arc<AtomicBool>,
    interval: StdDuration,
) {
    debug!("health monitor started (interval: {}s)", interval.as_secs());
    while !stop.load(Ordering::SeqCst) {
        health_tick(&workers, &spawner, &stop);
        let mut slept = StdDuration::from_millis(0);
        while slept < interval && !stop.load(Ordering::SeqCst) {
            let chunk = cmp::min(StdDuration::from_millis(MONITOR_SUB_TICK_MS), interval - slept);
            thread::sleep(chunk);
            slept += chunk;
        }
    }
    debug!("health monitor stopped");
}

/// One pass over the fleet: classify unhealthy workers, then restart
/// those with budget left. The port wait runs without the map lock so
/// status reads and the quiesce flag stay responsive.
pub fn health_tick(
    workers: &Arc<Mutex<HashMap<String, Worker>>>,
    spawner: &Arc<ProcessSpawner>,
    stop: &Arc<AtomicBool>,
) {
    let mut to_restart: Vec<(String, u16)> = Vec::new();
    {
        let mut workers = workers.lock().expect("worker map lock poisoned");
        for (name, worker) in workers.iter_mut() {
            if worker.state() != WorkerState::Running {
                continue;
            }
            match check_health(worker) {
                HealthOutcome::Healthy => {
                    worker.last_health = Some(HealthOutcome::Healthy);
                }
                outcome => {
                    outputln!(preamble name, "unhealthy: {}", outcome);
                    log_output_tail(worker);
                    worker.last_health = Some(outcome);
                    worker.change_state(WorkerState::Failed);
                    if worker.can_restart() {
                        to_restart.push((name.clone(), worker.port()));
                    } else {
                        outputln!(
                            preamble name,
                            "exceeded max restarts ({}), pinning in failed state",
                            worker.max_restarts
                        );
                    }
                }
            }
        }
    }

    for (name, port) in to_restart {
        if stop.load(Ordering::SeqCst) {
            outputln!(preamble name, "shutdown in progress; skipping restart");
            continue;
        }
        if !wait_for_port_free_interruptible(
            port,
            StdDuration::from_secs(RESTART_PORT_WAIT_SECS),
            stop,
        )
        {
            outputln!(
                preamble name,
                "port {} still not available, skipping restart this cycle",
                port
            );
            continue;
        }
        let mut workers = workers.lock().expect("worker map lock poisoned");
        if let Some(worker) = workers.get_mut(&name) {
            if worker.state() != WorkerState::Failed || stop.load(Ordering::SeqCst) {
                continue;
            }
            worker.restart_count += 1;
            let count = worker.restart_count;
            match start_worker_impl(worker, &**spawner) {
                Ok(()) => outputln!(preamble name, "restarted (restart count: {})", count),
                Err(err) => outputln!(preamble name, "restart failed: {}", err),
            }
        }
    }
}

fn check_health(worker: &mut Worker) -> HealthOutcome {
    let port = worker.port();
    let status = match worker.process {
        Some(ref mut handle) => handle.poll(),
        None => return HealthOutcome::ProcessExited(None),
    };
    match status {
        Ok(Some(status)) => HealthOutcome::ProcessExited(status.code()),
        Ok(None) => {
            // The process is up; it should be holding its port. A free
            // port here means the listener is gone even though the
            // process is not.
            if net::is_port_free(port) {
                HealthOutcome::PortNotHeld
            } else {
                HealthOutcome::Healthy
            }
        }
        Err(err) => {
            warn!("unable to poll worker {}: {}", worker.name(), err);
            HealthOutcome::ProcessExited(None)
        }
    }
}

fn log_output_tail(worker: &Worker) {
    if let Some(ref handle) = worker.process {
        let tail = handle.output_tail();
        if tail.is_empty() {
            return;
        }
        for line in tail.stdout.iter() {
            outputln!(preamble worker.name(), "stdout: {}", line);
        }
        for line in tail.stderr.iter() {
            outputln!(preamble worker.name(), "stderr: {}", line);
        }
    }
}

fn wait_for_port_free_interruptible(
    port: u16,
    timeout: StdDuration,
    stop: &AtomicBool,
) -> bool {
    let deadline = SteadyTime::now() + Duration::milliseconds(timeout.as_millis() as i64);
    loop {
        if net::is_port_free(port) {
            return true;
        }
        if stop.load(Ordering::SeqCst) || SteadyTime::now() >= deadline {
            return false;
        }
        thread::sleep(StdDuration::from_millis(500));
    }
}

#[cfg(test)]
mod test {
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::time::Duration as StdDuration;

    use super::*;
    use error::SupError;
    use manager::spawner::fake::{FakeBehavior, FakeSpawner};
    use manager::worker::test_spec;

    fn free_port() -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        listener.local_addr().unwrap().port()
    }

    fn manager_with(behavior: FakeBehavior) -> (Manager, Arc<FakeSpawner>) {
        let spawner = Arc::new(FakeSpawner::new(behavior));
        let manager = Manager::new(spawner.clone(), ManagerConfig::default());
        (manager, spawner)
    }

    #[test]
    fn start_refuses_an_occupied_port() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let (manager, spawner) = manager_with(FakeBehavior::ExitAfter(
            StdDuration::from_secs(60),
        ));
        manager.add_worker(test_spec("held", port));
        match manager.start_worker("held") {
            Err(SupError { err: Error::PortUnavailable(_, p), .. }) => assert_eq!(p, port),
            other => panic!("expected PortUnavailable, got {:?}", other),
        }
        assert_eq!(spawner.spawns(), 0);
    }

    #[test]
    fn all_spawn_failures_at_startup_are_fatal() {
        let (manager, _spawner) = manager_with(FakeBehavior::FailSpawn);
        manager.add_worker(test_spec("a", free_port()));
        manager.add_worker(test_spec("b", free_port()));
        match manager.start_all() {
            Err(SupError { err: Error::AllWorkersFailed, .. }) => (),
            other => panic!("expected AllWorkersFailed, got {:?}", other),
        }
    }

    #[test]
    fn partial_spawn_failure_is_tolerated() {
        let (manager, spawner) = manager_with(FakeBehavior::ExitAfter(
            StdDuration::from_secs(60),
        ));
        spawner.set_behavior("bad", FakeBehavior::FailSpawn);
        manager.add_worker(test_spec("good", free_port()));
        manager.add_worker(test_spec("bad", free_port()));
        assert_eq!(manager.start_all().unwrap(), 1);
        let status = manager.status();
        assert_eq!(status[0].name, "bad");
        assert_eq!(status[0].state, "failed");
        assert_eq!(status[1].name, "good");
        assert_eq!(status[1].state, "running");
    }

    #[test]
    fn crashing_worker_is_restarted_until_pinned() {
        let (manager, spawner) = manager_with(FakeBehavior::ExitImmediately(1));
        manager.add_worker(test_spec("crashy", free_port()));
        manager.start_all().unwrap();
        // One initial spawn, then five restarts, then the pin.
        for _ in 0..7 {
            health_tick(&manager.workers, &manager.spawner, &manager.stop);
        }
        let status = manager.status();
        assert_eq!(status[0].state, "failed");
        assert_eq!(status[0].restart_count, config::DEFAULT_MAX_RESTARTS);
        assert_eq!(spawner.spawns() as u32, 1 + config::DEFAULT_MAX_RESTARTS);
    }

    #[test]
    fn quiesced_supervisor_does_not_restart() {
        let (manager, spawner) = manager_with(FakeBehavior::ExitImmediately(1));
        manager.add_worker(test_spec("crashy", free_port()));
        manager.start_all().unwrap();
        manager.stop.store(true, Ordering::SeqCst);
        health_tick(&manager.workers, &manager.spawner, &manager.stop);
        assert_eq!(spawner.spawns(), 1);
        assert_eq!(manager.status()[0].state, "failed");
    }

    #[test]
    fn fleet_shutdown_reports_every_worker() {
        let (manager, spawner) = manager_with(FakeBehavior::ExitAfter(
            StdDuration::from_millis(50),
        ));
        spawner.set_behavior("stubborn", FakeBehavior::IgnoreTerm);
        manager.add_worker(test_spec("polite", free_port()));
        manager.add_worker(test_spec("stubborn", free_port()));
        manager.start_all().unwrap();
        let report = manager.shutdown_all();
        assert_eq!(report.reports.len(), 2);
        assert!(report.stragglers.is_empty());
        assert_eq!(report.exit_contribution(), EXIT_WORKER_FORCE_KILL);
        // Records are back in the map, terminally Exited.
        for status in manager.status() {
            assert_eq!(status.state, "exited");
        }
    }

    #[test]
    fn never_started_worker_exits_without_signals() {
        let (manager, spawner) = manager_with(FakeBehavior::ExitImmediately(1));
        manager.add_worker(test_spec("pinned", free_port()));
        // Never started: no process at shutdown entry.
        let report = manager.shutdown_all();
        assert_eq!(report.reports.len(), 1);
        assert_eq!(report.reports[0].method, ShutdownMethod::AlreadyExited);
        assert_eq!(report.exit_contribution(), EXIT_OK);
        assert_eq!(spawner.spawns(), 0);
        assert_eq!(manager.status()[0].state, "exited");
    }
}
