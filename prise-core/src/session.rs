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

//! A session couples one PTY to one emulator and multicasts changes to
//! whichever clients are attached. The PTY's bytes are read on a dedicated
//! OS thread; everything else about a session is only ever touched from
//! the daemon's single loop thread.

use std::{
    collections::{BTreeSet, HashMap},
    os::fd::{AsRawFd, OwnedFd, RawFd},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::Instant,
};

use nix::{
    fcntl::{fcntl, FcntlArg, OFlag},
    sys::wait,
    unistd::Pid,
};
use tracing::debug;

use crate::{
    consts::READER_IDLE_SLEEP,
    emulator::{Emulator, VtEmulator},
    pty::Pty,
    reactor::TaskId,
};

pub type SessionId = u64;

/// Non-blocking self-pipe the reader thread pokes and the loop polls.
struct SignalPipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl SignalPipe {
    fn new() -> nix::Result<SignalPipe> {
        let (read, write) = nix::unistd::pipe()?;
        fcntl(read.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
        fcntl(write.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
        Ok(SignalPipe { read, write })
    }

    fn wake(&self) {
        match nix::unistd::write(&self.write, &[1]) {
            Ok(_) | Err(nix::errno::Errno::EAGAIN) => {}
            Err(e) => debug!(err = %e, "signal pipe wake failed"),
        }
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            match nix::unistd::read(self.read.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(n) if n < buf.len() => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }
}

/// Everything the loop thread is allowed to read or mutate. Reached only
/// through `Session::lock()`, which takes the same mutex the reader thread
/// takes before it calls into the emulator.
pub struct SessionInner {
    pub emulator: Box<dyn Emulator>,
}

pub struct Session {
    pub id: SessionId,
    pty: Pty,
    inner: Arc<Mutex<SessionInner>>,
    signal_pipe: Arc<SignalPipe>,
    running: Arc<AtomicBool>,
    reader_thread: Option<JoinHandle<()>>,
    pub keep_alive: bool,
    pub attached: BTreeSet<RawFd>,
    pub last_render: Instant,
    pub render_timer: Option<TaskId>,
}

impl Session {
    pub fn spawn(
        id: SessionId,
        argv: &[String],
        env: &HashMap<String, String>,
        rows: u16,
        cols: u16,
        scrollback_lines: usize,
        pty_read_chunk: usize,
    ) -> anyhow::Result<Session> {
        let pty = Pty::spawn(argv, env, rows, cols)?;
        let emulator: Box<dyn Emulator> = Box::new(VtEmulator::new(rows, cols, scrollback_lines));
        let inner = Arc::new(Mutex::new(SessionInner { emulator }));
        let signal_pipe = Arc::new(SignalPipe::new()?);
        let running = Arc::new(AtomicBool::new(true));

        let reader_thread = {
            let inner = inner.clone();
            let signal_pipe = signal_pipe.clone();
            let running = running.clone();
            let master_fd = pty.master_fd();
            let pty_child = pty.child;
            std::thread::spawn(move || {
                reader_loop(master_fd, pty_child, inner, signal_pipe, running, pty_read_chunk)
            })
        };

        Ok(Session {
            id,
            pty,
            inner,
            signal_pipe,
            running,
            reader_thread: Some(reader_thread),
            keep_alive: false,
            attached: BTreeSet::new(),
            last_render: Instant::now() - crate::consts::FRAME_INTERVAL,
            render_timer: None,
        })
    }

    pub fn signal_read_fd(&self) -> RawFd {
        self.signal_pipe.read.as_raw_fd()
    }

    pub fn drain_signal(&self) {
        self.signal_pipe.drain();
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn write_pty(&self, bytes: &[u8]) -> nix::Result<()> {
        write_all(self.pty.master_fd(), bytes)
    }

    pub fn resize(&self, rows: u16, cols: u16) -> anyhow::Result<()> {
        self.pty.resize(rows, cols)?;
        self.lock().emulator.resize(rows, cols);
        Ok(())
    }

    pub fn is_idle(&self) -> bool {
        self.attached.is_empty() && !self.keep_alive
    }

    pub fn shutdown(mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.pty.close();
        self.signal_pipe.wake();
        if let Some(handle) = self.reader_thread.take() {
            let _ = handle.join();
        }
    }
}

fn write_all(fd: RawFd, mut bytes: &[u8]) -> nix::Result<()> {
    while !bytes.is_empty() {
        let n = nix::unistd::write(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, bytes)?;
        bytes = &bytes[n..];
    }
    Ok(())
}

fn reader_loop(
    master_fd: RawFd,
    child: Pid,
    inner: Arc<Mutex<SessionInner>>,
    signal_pipe: Arc<SignalPipe>,
    running: Arc<AtomicBool>,
    pty_read_chunk: usize,
) {
    let master = unsafe { std::os::fd::BorrowedFd::borrow_raw(master_fd) };
    let mut buf = vec![0u8; pty_read_chunk];

    while running.load(Ordering::SeqCst) {
        match nix::unistd::read(master.as_raw_fd(), &mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let response = {
                    let mut guard = match inner.lock() {
                        Ok(g) => g,
                        Err(p) => p.into_inner(),
                    };
                    let response = guard.emulator.process(&buf[..n]);
                    let synchronized = guard.emulator.is_synchronized();
                    drop(guard);
                    if !synchronized {
                        signal_pipe.wake();
                    }
                    response
                };
                if !response.is_empty() {
                    let _ = write_all(master_fd, &response);
                }
            }
            Err(nix::errno::Errno::EAGAIN) => {
                std::thread::sleep(READER_IDLE_SLEEP);
            }
            Err(e) => {
                debug!(err = %e, "pty reader exiting");
                break;
            }
        }
    }

    let _ = wait::waitpid(child, None);
    debug!(pid = child.as_raw(), "pty reader reaped child");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_reads_shell_output_and_wakes_signal_pipe() {
        let session = Session::spawn(
            0,
            &["/bin/sh".to_string(), "-c".to_string(), "echo hi".to_string()],
            &Default::default(),
            24,
            80,
            0,
            crate::consts::PTY_READ_CHUNK,
        )
        .unwrap();
        // the reader thread wakes the pipe on its own schedule; give it a
        // moment before polling for readability.
        std::thread::sleep(std::time::Duration::from_millis(200));
        let mut pfd = [nix::poll::PollFd::new(
            unsafe { std::os::fd::BorrowedFd::borrow_raw(session.signal_read_fd()) },
            nix::poll::PollFlags::POLLIN,
        )];
        let n = nix::poll::poll(&mut pfd, nix::poll::PollTimeout::from(0u8)).unwrap();
        assert!(n >= 1);
        session.shutdown();
    }
}
