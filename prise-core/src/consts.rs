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

use std::time::Duration;

/// Target inter-frame time for the redraw scheduler: at most 125 redraws a
/// second per session.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(8);

/// Chunk size used by each session's PTY reader thread.
pub const PTY_READ_CHUNK: usize = 4 * 1024;

/// How long the reader thread naps after a WouldBlock before retrying.
pub const READER_IDLE_SLEEP: Duration = Duration::from_millis(10);

pub const DEFAULT_ROWS: u16 = 24;
pub const DEFAULT_COLS: u16 = 80;

pub const SOCKET_BACKLOG: i32 = 128;

/// Bound used by `poll(2)` when no timer is pending.
pub const POLL_IDLE_WAIT: Duration = Duration::from_millis(250);
