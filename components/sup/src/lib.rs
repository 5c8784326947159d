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

//! The fleet supervisor.
//!
//! A single master process reads a repository configuration, spawns one
//! worker process per repository on a dedicated TCP port, watches their
//! health, restarts failures, and on shutdown walks a fixed phase sequence
//! that proves processes exited, ports were released, and nothing was left
//! behind as a zombie.

extern crate fleet_core as core;
extern crate hyper;
extern crate libc;
#[macro_use]
extern crate log;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate serde_json;
#[cfg(test)]
extern crate tempfile;
extern crate time;

#[macro_use]
pub mod output;
#[macro_use]
pub mod error;
pub mod config;
pub mod manager;
pub mod registry;
pub mod shutdown;
pub mod util;

pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");
