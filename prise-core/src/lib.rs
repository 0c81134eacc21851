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

//! Core implementation of the prise daemon: a single-threaded reactor that
//! owns any number of PTY sessions and multicasts their output to attached
//! clients as differential redraws.

pub mod client;
pub mod config;
pub mod consts;
pub mod emulator;
pub mod frame;
pub mod keys;
pub mod pty;
pub mod reactor;
pub mod redraw;
pub mod registry;
pub mod server;
pub mod session;
pub mod signals;
pub mod snapshot;
pub mod test_hooks;
pub mod user;
