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

//! Repository configuration.
//!
//! The supervisor consumes a JSON document naming one repository per
//! worker. Validation is strict and happens entirely at load time: a
//! configuration problem is fatal before any process is spawned. The file
//! is never written back, and ports are never auto-assigned.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::fs;
use std::num::ParseIntError;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration as StdDuration;

use serde_json;

use error::{Error, Result};
use manager::worker::WorkerSpec;

static LOGKEY: &'static str = "CF";

pub const DEFAULT_MAX_RESTARTS: u32 = 5;
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_GRACEFUL_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct RepositoriesFile {
    repositories: HashMap<String, RepositoryCfg>,
}

#[derive(Clone, Debug, Deserialize)]
struct RepositoryCfg {
    workspace: String,
    port: u16,
    #[serde(default)]
    description: String,
    language: Option<Language>,
    python_path: Option<String>,
    /// Explicit worker argv; overrides the language-derived default.
    command: Option<Vec<String>>,
    #[serde(default)]
    env: HashMap<String, String>,
    shutdown_timeout_secs: Option<u64>,
    graceful_timeout_secs: Option<u64>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Swift,
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Language::Python => write!(f, "python"),
            Language::Swift => write!(f, "swift"),
        }
    }
}

/// Load and validate the repository configuration, producing one
/// `WorkerSpec` per repository, sorted by name for deterministic startup
/// order.
pub fn load_worker_specs<P: AsRef<Path>>(path: P) -> Result<Vec<WorkerSpec>> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .map_err(|e| sup_error!(Error::ConfigFileIO(path.to_path_buf(), e)))?;
    let file: RepositoriesFile =
        serde_json::from_str(&raw).map_err(|e| sup_error!(Error::ConfigParse(e)))?;
    if file.repositories.is_empty() {
        return Err(sup_error!(
            Error::ConfigInvalid(String::from("no repositories configured"))
        ));
    }

    let mut names: Vec<&String> = file.repositories.keys().collect();
    names.sort();

    let mut ports: HashMap<u16, &str> = HashMap::new();
    let mut specs = Vec::with_capacity(names.len());
    for name in names {
        let cfg = &file.repositories[name];
        validate_repository(name, cfg)?;
        if let Some(holder) = ports.insert(cfg.port, name) {
            return Err(sup_error!(Error::ConfigInvalid(format!(
                "port {} is assigned to both {} and {}",
                cfg.port, holder, name
            ))));
        }
        specs.push(worker_spec(name, cfg)?);
    }
    debug!("loaded {} worker specs from {}", specs.len(), path.display());
    Ok(specs)
}

fn validate_repository(name: &str, cfg: &RepositoryCfg) -> Result<()> {
    if name.is_empty() {
        return Err(sup_error!(
            Error::ConfigInvalid(String::from("repository with empty name"))
        ));
    }
    if cfg.port == 0 {
        return Err(sup_error!(Error::ConfigInvalid(format!(
            "repository {} has port 0; ports must be in 1..=65535",
            name
        ))));
    }
    let workspace = Path::new(&cfg.workspace);
    if !workspace.is_absolute() {
        return Err(sup_error!(Error::ConfigInvalid(format!(
            "repository {} workspace {} is not an absolute path",
            name, cfg.workspace
        ))));
    }
    if !workspace.is_dir() {
        return Err(sup_error!(Error::ConfigInvalid(format!(
            "repository {} workspace {} is not an existing directory",
            name, cfg.workspace
        ))));
    }
    Ok(())
}

fn worker_spec(name: &str, cfg: &RepositoryCfg) -> Result<WorkerSpec> {
    let mut command = base_command(name, cfg)?;
    command.push(String::from("--name"));
    command.push(String::from(name));
    command.push(String::from("--workspace"));
    command.push(cfg.workspace.clone());
    command.push(String::from("--port"));
    command.push(cfg.port.to_string());
    command.push(String::from("--description"));
    command.push(cfg.description.clone());
    Ok(WorkerSpec {
        name: String::from(name),
        workspace: PathBuf::from(&cfg.workspace),
        port: cfg.port,
        description: cfg.description.clone(),
        command: command,
        env: cfg.env.clone(),
        shutdown_timeout: StdDuration::from_secs(cfg.shutdown_timeout_secs.unwrap_or_else(
            || WorkerShutdownTimeout::configured_value().as_secs(),
        )),
        graceful_timeout: StdDuration::from_secs(cfg.graceful_timeout_secs.unwrap_or_else(
            || WorkerGracefulTimeout::configured_value().as_secs(),
        )),
    })
}

/// The argv prefix to launch a repository's worker with. An explicit
/// `command` wins; otherwise it is derived from the repository language.
fn base_command(name: &str, cfg: &RepositoryCfg) -> Result<Vec<String>> {
    if let Some(ref command) = cfg.command {
        if command.is_empty() {
            return Err(sup_error!(Error::ConfigInvalid(format!(
                "repository {} has an empty command",
                name
            ))));
        }
        return Ok(command.clone());
    }
    match cfg.language {
        Some(Language::Python) => {
            let python = cfg.python_path
                .clone()
                .unwrap_or_else(|| String::from("python3"));
            Ok(vec![python, String::from("-m"), String::from("fleet_worker")])
        }
        Some(Language::Swift) => Err(sup_error!(Error::ConfigInvalid(format!(
            "repository {} is a swift repository and requires an explicit command",
            name
        )))),
        None => Err(sup_error!(Error::ConfigInvalid(format!(
            "repository {} needs either a language or an explicit command",
            name
        )))),
    }
}

/// Configuration that can be overridden from the environment, in the style
/// of `FLEET_HEALTH_INTERVAL_SECS=5 fleet-sup run`.
pub trait EnvConfig: Default + FromStr {
    const ENVVAR: &'static str;

    fn configured_value() -> Self {
        match env::var(Self::ENVVAR) {
            Ok(raw) => {
                match raw.parse() {
                    Ok(value) => value,
                    Err(_) => {
                        warn!(
                            "Unparseable value \"{}\" for {}, using the default",
                            raw,
                            Self::ENVVAR
                        );
                        Self::default()
                    }
                }
            }
            Err(_) => Self::default(),
        }
    }
}

macro_rules! env_duration_secs {
    ($name:ident, $envvar:expr, $default_secs:expr) => {
        #[derive(Clone, Copy, Debug)]
        pub struct $name(StdDuration);

        impl $name {
            pub fn as_duration(&self) -> StdDuration {
                self.0
            }

            pub fn as_secs(&self) -> u64 {
                self.0.as_secs()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                $name(StdDuration::from_secs($default_secs))
            }
        }

        impl FromStr for $name {
            type Err = ParseIntError;

            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                let raw = s.parse::<u64>()?;
                Ok($name(StdDuration::from_secs(raw)))
            }
        }

        impl EnvConfig for $name {
            const ENVVAR: &'static str = $envvar;
        }
    };
}

env_duration_secs!(
    HealthCheckInterval,
    "FLEET_HEALTH_INTERVAL_SECS",
    DEFAULT_HEALTH_INTERVAL_SECS
);
env_duration_secs!(
    WorkerShutdownTimeout,
    "FLEET_WORKER_SHUTDOWN_TIMEOUT_SECS",
    DEFAULT_SHUTDOWN_TIMEOUT_SECS
);
env_duration_secs!(
    WorkerGracefulTimeout,
    "FLEET_WORKER_GRACEFUL_TIMEOUT_SECS",
    DEFAULT_GRACEFUL_TIMEOUT_SECS
);

#[cfg(test)]
mod test {
    use std::fs::File;
    use std::io::Write;

    use tempfile::TempDir;

    use super::*;
    use error::{Error, SupError};

    fn write_config(dir: &TempDir, contents: &str) -> ::std::path::PathBuf {
        let path = dir.path().join("repositories.json");
        let mut file = File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    fn workspace(dir: &TempDir) -> String {
        dir.path().to_str().unwrap().to_string()
    }

    #[test]
    fn valid_config_produces_sorted_specs() {
        let dir = TempDir::new().unwrap();
        let config = format!(
            r#"{{"repositories": {{
                 "zebra": {{"workspace": "{ws}", "port": 8082, "language": "python"}},
                 "aardvark": {{"workspace": "{ws}", "port": 8081,
                               "description": "first", "language": "python",
                               "python_path": "/opt/python3"}}
               }}}}"#,
            ws = workspace(&dir)
        );
        let path = write_config(&dir, &config);
        let specs = load_worker_specs(&path).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].name, "aardvark");
        assert_eq!(specs[0].port, 8081);
        assert_eq!(specs[0].command[0], "/opt/python3");
        assert!(specs[0].command.contains(&String::from("--port")));
        assert_eq!(specs[1].name, "zebra");
    }

    #[test]
    fn explicit_command_wins_over_language() {
        let dir = TempDir::new().unwrap();
        let config = format!(
            r#"{{"repositories": {{
                 "svc": {{"workspace": "{ws}", "port": 8081,
                          "language": "python",
                          "command": ["/usr/local/bin/worker", "--fast"]}}
               }}}}"#,
            ws = workspace(&dir)
        );
        let path = write_config(&dir, &config);
        let specs = load_worker_specs(&path).unwrap();
        assert_eq!(specs[0].command[0], "/usr/local/bin/worker");
        assert_eq!(specs[0].command[1], "--fast");
    }

    #[test]
    fn duplicate_ports_are_fatal() {
        let dir = TempDir::new().unwrap();
        let config = format!(
            r#"{{"repositories": {{
                 "a": {{"workspace": "{ws}", "port": 8081, "language": "python"}},
                 "b": {{"workspace": "{ws}", "port": 8081, "language": "python"}}
               }}}}"#,
            ws = workspace(&dir)
        );
        let path = write_config(&dir, &config);
        match load_worker_specs(&path) {
            Err(SupError { err: Error::ConfigInvalid(ref msg), .. }) => {
                assert!(msg.contains("8081"))
            }
            other => panic!("expected ConfigInvalid, got {:?}", other),
        }
    }

    #[test]
    fn relative_workspace_is_fatal() {
        let dir = TempDir::new().unwrap();
        let config = r#"{"repositories": {
             "a": {"workspace": "relative/path", "port": 8081, "language": "python"}
           }}"#;
        let path = write_config(&dir, config);
        assert!(load_worker_specs(&path).is_err());
    }

    #[test]
    fn missing_required_field_is_fatal() {
        let dir = TempDir::new().unwrap();
        let config = format!(
            r#"{{"repositories": {{"a": {{"workspace": "{ws}"}}}}}}"#,
            ws = workspace(&dir)
        );
        let path = write_config(&dir, &config);
        match load_worker_specs(&path) {
            Err(SupError { err: Error::ConfigParse(_), .. }) => (),
            other => panic!("expected ConfigParse, got {:?}", other),
        }
    }

    #[test]
    fn port_zero_is_fatal() {
        let dir = TempDir::new().unwrap();
        let config = format!(
            r#"{{"repositories": {{
                 "a": {{"workspace": "{ws}", "port": 0, "language": "python"}}
               }}}}"#,
            ws = workspace(&dir)
        );
        let path = write_config(&dir, &config);
        assert!(load_worker_specs(&path).is_err());
    }

    #[test]
    fn timeout_defaults_apply() {
        let dir = TempDir::new().unwrap();
        let config = format!(
            r#"{{"repositories": {{
                 "a": {{"workspace": "{ws}", "port": 8081, "language": "python",
                        "shutdown_timeout_secs": 7, "graceful_timeout_secs": 2}},
                 "b": {{"workspace": "{ws}", "port": 8082, "language": "python"}}
               }}}}"#,
            ws = workspace(&dir)
        );
        let path = write_config(&dir, &config);
        let specs = load_worker_specs(&path).unwrap();
        assert_eq!(specs[0].shutdown_timeout, StdDuration::from_secs(7));
        assert_eq!(specs[0].graceful_timeout, StdDuration::from_secs(2));
        assert_eq!(
            specs[1].shutdown_timeout,
            StdDuration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS)
        );
    }
}
