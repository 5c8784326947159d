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

//! The worker HTTP contract, from the supervisor's side.
//!
//! A worker exposes `GET /health` and, if it cooperates with graceful
//! shutdown, `POST /shutdown`. A worker without the shutdown endpoint is
//! tolerated; the caller falls through to SIGTERM.

use std::io::Read;
use std::time::Duration as StdDuration;

use hyper::client::Client;
use serde_json;

use error::{Error, Result};

static LOGKEY: &'static str = "HT";

/// Connect/read budget for a single request to a worker.
pub const HTTP_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

impl HealthResponse {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

fn client() -> Client {
    let mut client = Client::new();
    client.set_read_timeout(Some(StdDuration::from_secs(HTTP_TIMEOUT_SECS)));
    client.set_write_timeout(Some(StdDuration::from_secs(HTTP_TIMEOUT_SECS)));
    client
}

/// Ask the worker on `port` to shut itself down. Returns the HTTP status
/// code; a connection error simply means the worker didn't accept the
/// request, which the caller treats the same as a non-2xx response.
pub fn request_shutdown(port: u16) -> Result<u16> {
    let url = format!("http://localhost:{}/shutdown", port);
    let response = client().post(url.as_str()).body("").send()?;
    debug!("shutdown request to {} returned {}", url, response.status);
    Ok(response.status.to_u16())
}

/// Fetch the worker's health document.
pub fn health(port: u16) -> Result<HealthResponse> {
    let url = format!("http://localhost:{}/health", port);
    let mut response = client().get(url.as_str()).send()?;
    let mut body = String::new();
    response.read_to_string(&mut body)?;
    serde_json::from_str(&body).map_err(|e| sup_error!(Error::HealthParse(e)))
}

#[cfg(test)]
mod test {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    use super::*;

    /// One-shot HTTP server answering a canned response.
    fn serve_once(response: &'static str) -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                stream.read(&mut buf).ok();
                stream.write_all(response.as_bytes()).ok();
            }
        });
        port
    }

    #[test]
    fn shutdown_request_reports_status() {
        let port = serve_once("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        assert_eq!(request_shutdown(port).unwrap(), 200);
    }

    #[test]
    fn shutdown_request_against_closed_port_is_an_error() {
        // Nothing is listening here; bind-and-drop to find a free port.
        let port = {
            let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(request_shutdown(port).is_err());
    }

    #[test]
    fn health_parses_status_field() {
        let port = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 20\r\n\r\n{\"status\":\"healthy\"}",
        );
        let health = health(port).unwrap();
        assert!(health.is_healthy());
    }
}
