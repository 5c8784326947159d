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

extern crate clap;
extern crate env_logger;
extern crate fleet_core as core;
#[macro_use]
extern crate fleet_sup as sup;
#[macro_use]
extern crate log;

use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration as StdDuration;

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};

use core::os::signals;
use sup::VERSION;
use sup::config::{self, EnvConfig, HealthCheckInterval};
use sup::error::{Error, Result};
use sup::manager::{Manager, ManagerConfig};
use sup::manager::spawner::{OsSpawner, ProcessSpawner};
use sup::registry::clients::ClientRegistry;
use sup::registry::resources::ResourceRegistry;
use sup::shutdown::coordinator::ShutdownCoordinator;
use sup::shutdown::orchestrator::{OrchestratorConfig, ShutdownOrchestrator};
use sup::util::http;

static LOGKEY: &'static str = "MN";

/// Main-loop cadence for observing the shutdown latch.
const TICK_MS: u64 = 100;

const DEFAULT_CONFIG_FILE: &'static str = "repositories.json";

fn main() {
    env_logger::init();
    if let Err(err) = start() {
        println!("{}", err);
        process::exit(1);
    }
}

fn cli<'a, 'b>() -> App<'a, 'b> {
    App::new("fleet-sup")
        .version(VERSION)
        .about("Supervises a fleet of repository workers")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommand(
            SubCommand::with_name("run")
                .about("Run the supervisor for all configured repositories")
                .arg(
                    Arg::with_name("config")
                        .long("config")
                        .short("c")
                        .takes_value(true)
                        .help("Path to the repository configuration file"),
                )
                .arg(
                    Arg::with_name("health-interval")
                        .long("health-interval")
                        .takes_value(true)
                        .help("Seconds between health checks"),
                )
                .arg(
                    Arg::with_name("grace-period")
                        .long("grace-period")
                        .takes_value(true)
                        .help("Seconds of grace for cooperative shutdown work"),
                )
                .arg(
                    Arg::with_name("force-timeout")
                        .long("force-timeout")
                        .takes_value(true)
                        .help("Seconds before forced shutdown work is abandoned"),
                ),
        )
        .subcommand(
            SubCommand::with_name("status")
                .about("Query the health endpoint of every configured worker")
                .arg(
                    Arg::with_name("config")
                        .long("config")
                        .short("c")
                        .takes_value(true)
                        .help("Path to the repository configuration file"),
                ),
        )
}

fn start() -> Result<()> {
    let app_matches = cli().get_matches();
    match app_matches.subcommand() {
        ("run", Some(m)) => sub_run(m),
        ("status", Some(m)) => sub_status(m),
        _ => unreachable!(),
    }
}

fn sub_run(m: &ArgMatches) -> Result<()> {
    let config_path = m.value_of("config").unwrap_or(DEFAULT_CONFIG_FILE);
    let specs = config::load_worker_specs(config_path)?;
    outputln!("loaded configuration for {} repositories", specs.len());

    let health_interval = match m.value_of("health-interval") {
        Some(raw) => StdDuration::from_secs(parse_seconds(raw, "health-interval")?),
        None => HealthCheckInterval::configured_value().as_duration(),
    };
    let orchestrator_config = OrchestratorConfig {
        grace_period: match m.value_of("grace-period") {
            Some(raw) => StdDuration::from_secs(parse_seconds(raw, "grace-period")?),
            None => OrchestratorConfig::default().grace_period,
        },
        force_timeout: match m.value_of("force-timeout") {
            Some(raw) => StdDuration::from_secs(parse_seconds(raw, "force-timeout")?),
            None => OrchestratorConfig::default().force_timeout,
        },
    };

    let spawner: Arc<ProcessSpawner> = Arc::new(OsSpawner);
    let manager = Arc::new(Manager::new(
        spawner,
        ManagerConfig { health_interval: health_interval },
    ));
    for spec in specs {
        manager.add_worker(spec);
    }

    let coordinator = Arc::new(ShutdownCoordinator::new());
    let clients = Arc::new(ClientRegistry::new());
    let resources = Arc::new(ResourceRegistry::new());

    // Handlers are installed before anything spawns, so an early signal
    // still produces an orderly teardown.
    signals::init();

    manager.start_all()?;
    manager.start_monitor()?;
    outputln!("fleet supervisor ready (pid {})", process::id());

    loop {
        coordinator.pump_signals();
        if coordinator.is_set() {
            break;
        }
        thread::sleep(StdDuration::from_millis(TICK_MS));
    }

    let orchestrator = ShutdownOrchestrator::new(
        coordinator,
        manager,
        clients,
        resources,
        orchestrator_config,
    );
    let code = orchestrator.run();
    process::exit(code);
}

fn sub_status(m: &ArgMatches) -> Result<()> {
    let config_path = m.value_of("config").unwrap_or(DEFAULT_CONFIG_FILE);
    let specs = config::load_worker_specs(config_path)?;
    for spec in specs {
        match http::health(spec.port) {
            Ok(health) => {
                println!("{} (port {}): {}", spec.name, spec.port, health.status);
            }
            Err(err) => {
                debug!("health request for {} failed: {}", spec.name, err);
                println!("{} (port {}): unreachable", spec.name, spec.port);
            }
        }
    }
    Ok(())
}

fn parse_seconds(raw: &str, flag: &str) -> Result<u64> {
    raw.parse::<u64>().map_err(|_| {
        sup_error!(Error::ConfigInvalid(format!(
            "--{} wants a number of seconds, got \"{}\"",
            flag, raw
        )))
    })
}
