// Copyright 2023 Google LLC
// Copyright 2026 the prise authors
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

#![allow(dead_code)]

//! Publishes named events over a unix socket so integration tests can
//! block on "session spawned" / "frame rendered" instead of sleeping.

use std::{
    io::Write,
    os::unix::net::{UnixListener, UnixStream},
    sync::Mutex,
    time,
};

use anyhow::{anyhow, Context};
use tracing::{error, info};

#[cfg(feature = "test_hooks")]
pub fn emit(event: &str) {
    let sock_path = TEST_HOOK_SERVER.sock_path.lock().unwrap();
    if sock_path.is_some() {
        TEST_HOOK_SERVER.emit_event(event);
    }
}

#[cfg(not(feature = "test_hooks"))]
pub fn emit(_event: &str) {}

lazy_static::lazy_static! {
    pub static ref TEST_HOOK_SERVER: TestHookServer = TestHookServer::new();
}

pub struct TestHookServer {
    sock_path: Mutex<Option<String>>,
    clients: Mutex<Vec<UnixStream>>,
}

impl TestHookServer {
    fn new() -> Self {
        TestHookServer { sock_path: Mutex::new(None), clients: Mutex::new(vec![]) }
    }

    pub fn set_socket_path(&self, path: String) {
        *self.sock_path.lock().unwrap() = Some(path);
    }

    pub fn wait_for_connect(&self) -> anyhow::Result<()> {
        let mut sleep_dur = time::Duration::from_millis(5);
        for _ in 0..12 {
            if !self.clients.lock().unwrap().is_empty() {
                return Ok(());
            }
            std::thread::sleep(sleep_dur);
            sleep_dur *= 2;
        }
        Err(anyhow!("no connection to test hook server"))
    }

    /// Listens on the configured socket, pushing each accepted client onto
    /// `clients`. Runs on a dedicated thread the caller spawns.
    pub fn start(&self) {
        let sock_path = match self.sock_path.lock().unwrap().clone() {
            Some(s) => s,
            None => {
                error!("you must call set_socket_path before calling start");
                return;
            }
        };

        let listener = match UnixListener::bind(&sock_path).context("binding to socket") {
            Ok(l) => l,
            Err(e) => {
                error!("error binding to test hook socket: {e:?}");
                return;
            }
        };
        info!(sock = %sock_path, "listening for test hook connections");
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    error!("error accepting test hook connection: {e:?}");
                    continue;
                }
            };
            self.clients.lock().unwrap().push(stream);
        }
    }

    fn emit_event(&self, event: &str) {
        info!(event, "emitting test hook event");
        let line = format!("{event}\n");
        for mut client in self.clients.lock().unwrap().iter() {
            if let Err(e) = client.write_all(line.as_bytes()) {
                error!(event, err = ?e, "error emitting test hook event");
            }
        }
    }
}
