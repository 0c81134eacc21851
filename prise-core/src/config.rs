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

use std::{fs, path::Path};

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::info;

/// Daemon-wide tunables that are not part of the per-request protocol.
///
/// Loaded once at startup; there is no background file watcher because the
/// daemon's thread budget is fixed at one loop thread plus one reader
/// thread per session.
#[derive(Debug, Default, Deserialize, PartialEq, Eq, Clone)]
pub struct Config {
    /// Overrides the default `/tmp/prise-<uid>.sock` path.
    pub sock: Option<String>,
    /// Command used to spawn a new session's shell, split with shell-word
    /// rules. Falls back to the user's login shell when unset.
    pub shell: Option<String>,
    /// Extra environment variables forwarded into spawned sessions.
    pub env: Option<std::collections::HashMap<String, String>>,
    /// Target inter-frame time for the redraw scheduler, in milliseconds.
    pub frame_interval_ms: Option<u64>,
    /// Chunk size used by each session's PTY reader thread, in bytes.
    pub pty_read_chunk: Option<usize>,
    /// When true, the daemon loop stops accepting and returns once the
    /// client list becomes empty. Used by the test harness.
    pub exit_on_idle: Option<bool>,
}

/// Reads `config_file` if given, else `$XDG_CONFIG_HOME/prise/config.toml`
/// falling back to `~/.config/prise/config.toml`. A missing file is not an
/// error: the daemon runs on defaults.
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let path = match config_file {
        Some(p) => Some(p.clone()),
        None => default_config_path(),
    };

    let path = match path {
        Some(p) => p,
        None => return Ok(Config::default()),
    };

    if !Path::new(&path).exists() {
        return Ok(Config::default());
    }

    info!(path = %path, "reading config file");
    let contents = fs::read_to_string(&path).context("reading config file")?;
    let config: Config = toml::from_str(&contents).context("parsing config file as toml")?;
    Ok(config)
}

fn default_config_path() -> Option<String> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return Some(format!("{xdg}/prise/config.toml"));
    }
    let home = std::env::var("HOME").ok()?;
    Some(format!("{home}/.config/prise/config.toml"))
}
