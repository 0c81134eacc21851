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

//! Top-level daemon wiring: binds the listening socket, owns the reactor
//! and registry, and drives the accept loop.

use std::{
    collections::HashMap,
    os::{
        fd::{AsRawFd, FromRawFd, IntoRawFd},
        unix::net::UnixListener,
    },
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use nix::sys::socket::{self, AddressFamily, Backlog, SockFlag, SockType, UnixAddr};
use tracing::info;

use crate::{
    config::Config,
    consts::{FRAME_INTERVAL, PTY_READ_CHUNK, SOCKET_BACKLOG},
    pty::resolve_argv,
    reactor::{Completion, Reactor},
    registry::{Registry, SpawnDefaults},
    signals,
    user,
};

pub fn default_socket_path() -> PathBuf {
    PathBuf::from(format!("/tmp/prise-{}.sock", nix::unistd::getuid().as_raw()))
}

/// Binds the listening socket, removing a stale leftover socket file from a
/// previous daemon instance that is no longer listening.
fn bind_listener(path: &Path) -> anyhow::Result<UnixListener> {
    if path.exists() {
        match std::os::unix::net::UnixStream::connect(path) {
            Ok(_) => anyhow::bail!("a prise daemon is already listening on {}", path.display()),
            Err(_) => {
                info!(path = %path.display(), "removing stale socket");
                std::fs::remove_file(path).context("removing stale socket")?;
            }
        }
    }
    // Built through `nix::sys::socket` rather than `UnixListener::bind` so
    // the configured backlog actually reaches `listen(2)`.
    let fd = socket::socket(AddressFamily::Unix, SockType::Stream, SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC, None)
        .context("creating unix socket")?;
    let addr = UnixAddr::new(path).context("building socket address")?;
    socket::bind(fd.as_raw_fd(), &addr).context("binding listener socket")?;
    socket::listen(&fd, Backlog::new(SOCKET_BACKLOG).context("invalid socket backlog")?)
        .context("listening on unix socket")?;
    Ok(unsafe { UnixListener::from_raw_fd(fd.into_raw_fd()) })
}

/// Runs the daemon until a fatal error, a term signal, or (with
/// `exit_on_idle` set) the last client disconnects. Never returns on a
/// healthy long-running daemon.
pub fn run(config: Config) -> anyhow::Result<()> {
    let sock_path = config.sock.clone().map(PathBuf::from).unwrap_or_else(default_socket_path);
    let listener = bind_listener(&sock_path)?;

    signals::Handler::new(Some(sock_path.clone())).spawn().context("spawning signal handler")?;

    #[cfg(feature = "test_hooks")]
    if let Ok(test_hook_sock) = std::env::var("PRISE_TEST_HOOK_SOCKET_PATH") {
        info!(sock = %test_hook_sock, "spawning test hook socket");
        crate::test_hooks::TEST_HOOK_SERVER.set_socket_path(test_hook_sock);
        std::thread::spawn(|| crate::test_hooks::TEST_HOOK_SERVER.start());
        crate::test_hooks::TEST_HOOK_SERVER.wait_for_connect()?;
    }

    let user_info = user::info().context("resolving user info")?;
    let argv = resolve_argv(&config.shell, &user_info.default_shell)?;
    let mut env: HashMap<String, String> = std::env::vars().collect();
    if let Some(extra) = &config.env {
        env.extend(extra.clone());
    }

    let frame_interval =
        config.frame_interval_ms.map(Duration::from_millis).unwrap_or(FRAME_INTERVAL);
    let exit_on_idle = config.exit_on_idle.unwrap_or(false);
    let pty_read_chunk = config.pty_read_chunk.unwrap_or(PTY_READ_CHUNK);
    let defaults = SpawnDefaults { argv, env, scrollback_lines: 10_000, pty_read_chunk };

    let registry = Registry::new(exit_on_idle, frame_interval, defaults);
    let mut reactor = Reactor::new();

    info!(sock = %sock_path.display(), "prise daemon listening");
    arm_accept(&registry, &mut reactor, &listener);

    loop {
        reactor.run_once().context("reactor tick")?;
        if registry.borrow().is_idle() {
            info!("exiting on idle (no clients, exit_on_idle set)");
            break;
        }
    }

    let _ = std::fs::remove_file(&sock_path);
    Ok(())
}

fn arm_accept(registry: &std::rc::Rc<std::cell::RefCell<Registry>>, reactor: &mut Reactor, listener: &UnixListener) {
    let fd = listener.as_raw_fd();
    let registry = registry.clone();
    let listener = listener.try_clone().expect("cloning listener fd");
    reactor.submit_readable(fd, move |reactor, completion| {
        if completion == Completion::Cancelled {
            return;
        }
        match listener.accept() {
            Ok((stream, _addr)) => {
                stream.set_nonblocking(true).ok();
                let client_fd = stream.as_raw_fd();
                // Ownership of the fd now lives inside the registry; leak
                // the std wrapper so its Drop doesn't close the fd under us.
                std::mem::forget(stream);
                Registry::add_client(&registry, reactor, client_fd);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => tracing::warn!(err = %e, "accept failed"),
        }
        arm_accept(&registry, reactor, &listener);
    });
}
