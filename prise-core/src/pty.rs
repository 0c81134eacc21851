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

//! Forks and execs a child under a PTY, and owns the master side of it.

use std::{
    collections::HashMap,
    ffi::CString,
    os::{
        fd::{AsRawFd, OwnedFd, RawFd},
        unix::ffi::OsStrExt,
    },
};

use anyhow::Context;
use nix::{
    libc,
    pty::{openpty, Winsize},
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{self, fork, setsid, ForkResult, Pid},
};
use tracing::{info, warn};

pub struct Pty {
    master: OwnedFd,
    pub child: Pid,
}

fn winsize(rows: u16, cols: u16) -> Winsize {
    Winsize { ws_row: rows, ws_col: cols, ws_xpixel: 0, ws_ypixel: 0 }
}

impl Pty {
    /// Opens a PTY pair and forks `argv[0]` (with `argv[1..]` as args) as a
    /// session leader attached to the slave side, with `env` as its full
    /// environment. The parent keeps the master fd and the child pid; the
    /// slave fd is closed in the parent immediately after fork.
    pub fn spawn(argv: &[String], env: &HashMap<String, String>, rows: u16, cols: u16) -> anyhow::Result<Pty> {
        anyhow::ensure!(!argv.is_empty(), "spawn argv must not be empty");

        let pty = openpty(Some(&winsize(rows, cols)), None).context("opening pty")?;
        let master = pty.master;
        let slave = pty.slave;

        // SAFETY: fork() is unsafe because only async-signal-safe calls may
        // run in the child before exec; everything below the match arm for
        // Child sticks to raw libc/nix primitives that are documented safe
        // to use here.
        match unsafe { fork() }.context("forking pty child")? {
            ForkResult::Parent { child } => {
                drop(slave);
                nix::fcntl::fcntl(master.as_raw_fd(), nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK))
                    .context("setting pty master nonblocking")?;
                info!(pid = child.as_raw(), "spawned pty child");
                Ok(Pty { master, child })
            }
            ForkResult::Child => {
                drop(master);
                if let Err(e) = setup_child(&slave, argv, env) {
                    // async-signal-safe-ish: write directly and exit, no
                    // panics or allocations beyond what setup_child already
                    // did.
                    let msg = format!("prise pty child setup failed: {e}\n");
                    let _ = unistd::write(unsafe { std::os::fd::BorrowedFd::borrow_raw(2) }, msg.as_bytes());
                    unsafe { libc::_exit(127) };
                }
                unreachable!("setup_child only returns on error");
            }
        }
    }

    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    pub fn resize(&self, rows: u16, cols: u16) -> nix::Result<()> {
        let ws = winsize(rows, cols);
        unsafe { set_winsize(self.master.as_raw_fd(), &ws) }
    }

    /// Sends SIGHUP then, after a short grace period, SIGKILL, and reaps the
    /// child. Safe to call from the session's reader thread on teardown.
    pub fn close(&self) {
        let _ = kill(self.child, Signal::SIGHUP);
        match waitpid(self.child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                std::thread::sleep(std::time::Duration::from_millis(200));
                if waitpid(self.child, Some(WaitPidFlag::WNOHANG)).map(|s| s == WaitStatus::StillAlive).unwrap_or(false)
                {
                    let _ = kill(self.child, Signal::SIGKILL);
                }
                let _ = waitpid(self.child, None);
            }
            Ok(_) => {}
            Err(e) => warn!(err = %e, "waitpid on pty child failed"),
        }
    }
}

unsafe fn set_winsize(fd: RawFd, ws: &Winsize) -> nix::Result<()> {
    nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, Winsize);
    tiocswinsz(fd, ws as *const Winsize).map(|_| ())
}

fn setup_child(slave: &OwnedFd, argv: &[String], env: &HashMap<String, String>) -> anyhow::Result<()> {
    setsid().context("setsid in pty child")?;

    let slave_fd = slave.as_raw_fd();
    unsafe {
        if libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0) != 0 {
            return Err(std::io::Error::last_os_error()).context("TIOCSCTTY in pty child");
        }
    }

    unistd::dup2(slave_fd, 0).context("dup2 stdin")?;
    unistd::dup2(slave_fd, 1).context("dup2 stdout")?;
    unistd::dup2(slave_fd, 2).context("dup2 stderr")?;
    if slave_fd > 2 {
        let _ = unistd::close(slave_fd);
    }

    let path = CString::new(argv[0].as_bytes()).context("argv[0] has an embedded NUL")?;
    let c_argv: Vec<CString> = argv
        .iter()
        .map(|a| CString::new(a.as_bytes()))
        .collect::<Result<_, _>>()
        .context("argv has an embedded NUL")?;
    let c_env: Vec<CString> = env
        .iter()
        .map(|(k, v)| CString::new(format!("{k}={v}").into_bytes()))
        .collect::<Result<_, _>>()
        .context("env has an embedded NUL")?;
    unistd::execve(&path, &c_argv, &c_env).context("execve in pty child")?;
    unreachable!("execve does not return on success");
}

/// Splits a configured shell command into argv, falling back to the
/// caller's login shell with no arguments when `cmd` is unset.
pub fn resolve_argv(cmd: &Option<String>, login_shell: &str) -> anyhow::Result<Vec<String>> {
    match cmd {
        Some(cmd) => shell_words::split(cmd).context("splitting configured shell command"),
        None => Ok(vec![login_shell.to_string()]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_argv_splits_configured_command() {
        let argv = resolve_argv(&Some("/bin/sh -c 'echo hi'".to_string()), "/bin/bash").unwrap();
        assert_eq!(argv, vec!["/bin/sh", "-c", "echo hi"]);
    }

    #[test]
    fn resolve_argv_falls_back_to_login_shell() {
        let argv = resolve_argv(&None, "/bin/zsh").unwrap();
        assert_eq!(argv, vec!["/bin/zsh"]);
    }

    #[test]
    fn spawn_true_exits_cleanly() {
        let pty = Pty::spawn(&["/bin/true".to_string()], &HashMap::new(), 24, 80).unwrap();
        let mut status;
        loop {
            status = waitpid(pty.child, None).unwrap();
            if !matches!(status, WaitStatus::StillAlive) {
                break;
            }
        }
        assert!(matches!(status, WaitStatus::Exited(_, 0)));
    }
}
