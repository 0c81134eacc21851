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

//! A single-threaded, completion-oriented event loop.
//!
//! Every socket read, socket write, and timer in the daemon is submitted
//! here and resumed via a callback invoked exactly once. The loop itself
//! never blocks outside of a single `poll(2)` call per tick; callbacks run
//! on the loop thread and must not block.

use std::{
    collections::{HashMap, VecDeque},
    os::unix::io::RawFd,
    time::{Duration, Instant},
};

use nix::poll::{PollFd, PollFlags, PollTimeout};

use crate::consts::POLL_IDLE_WAIT;

pub type TaskId = u64;

/// Why a submitted operation's callback is firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The fd became ready, or the timer elapsed.
    Ready,
    /// The operation was cancelled before it fired, either directly or via
    /// `cancel_by_fd`. Callers must tolerate this instead of treating it as
    /// an error.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interest {
    Readable,
    Writable,
}

type Callback = Box<dyn FnOnce(&mut Reactor, Completion)>;

struct IoTask {
    fd: RawFd,
    interest: Interest,
    callback: Callback,
}

struct TimerTask {
    deadline: Instant,
    callback: Callback,
}

enum Task {
    Io(IoTask),
    Timer(TimerTask),
}

/// The reactor. Owns no fds; callers open/close their own sockets and
/// pipes and submit operations against them.
#[derive(Default)]
pub struct Reactor {
    next_id: TaskId,
    tasks: HashMap<TaskId, Task>,
    /// Per-fd submission order, so callbacks for a given fd fire in the
    /// order they were submitted.
    fd_order: HashMap<RawFd, VecDeque<TaskId>>,
    timer_order: Vec<TaskId>,
}

impl Reactor {
    pub fn new() -> Reactor {
        Reactor { next_id: 0, tasks: HashMap::new(), fd_order: HashMap::new(), timer_order: Vec::new() }
    }

    fn alloc_id(&mut self) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn submit_io(
        &mut self,
        fd: RawFd,
        interest: Interest,
        callback: impl FnOnce(&mut Reactor, Completion) + 'static,
    ) -> TaskId {
        let id = self.alloc_id();
        self.tasks.insert(id, Task::Io(IoTask { fd, interest, callback: Box::new(callback) }));
        self.fd_order.entry(fd).or_default().push_back(id);
        id
    }

    /// Waits for `fd` to become readable: used for both `accept` (the
    /// listening socket becomes readable when a connection is pending) and
    /// `recv`/`read` (a regular fd becomes readable when bytes, or EOF, are
    /// available).
    pub fn submit_readable(&mut self, fd: RawFd, callback: impl FnOnce(&mut Reactor, Completion) + 'static) -> TaskId {
        self.submit_io(fd, Interest::Readable, callback)
    }

    /// Waits for `fd` to become writable: used for `send`.
    pub fn submit_writable(&mut self, fd: RawFd, callback: impl FnOnce(&mut Reactor, Completion) + 'static) -> TaskId {
        self.submit_io(fd, Interest::Writable, callback)
    }

    pub fn submit_timeout(&mut self, after: Duration, callback: impl FnOnce(&mut Reactor, Completion) + 'static) -> TaskId {
        let id = self.alloc_id();
        self.tasks.insert(id, Task::Timer(TimerTask { deadline: Instant::now() + after, callback: Box::new(callback) }));
        self.timer_order.push(id);
        id
    }

    /// Cancels a single outstanding operation by its task handle. No-op if
    /// it already fired.
    pub fn cancel(&mut self, id: TaskId) {
        if let Some(task) = self.tasks.remove(&id) {
            self.untrack(id, &task);
            self.fire(task, Completion::Cancelled);
        }
    }

    /// Cancels every outstanding operation registered against `fd`. Must be
    /// called before closing a client fd so no stale completion fires
    /// against it afterward.
    pub fn cancel_by_fd(&mut self, fd: RawFd) {
        let ids: Vec<TaskId> = self.fd_order.get(&fd).cloned().unwrap_or_default().into();
        for id in ids {
            if let Some(task) = self.tasks.remove(&id) {
                self.untrack(id, &task);
                self.fire(task, Completion::Cancelled);
            }
        }
        self.fd_order.remove(&fd);
    }

    fn untrack(&mut self, id: TaskId, task: &Task) {
        match task {
            Task::Io(io) => {
                if let Some(q) = self.fd_order.get_mut(&io.fd) {
                    q.retain(|t| *t != id);
                }
            }
            Task::Timer(_) => {
                self.timer_order.retain(|t| *t != id);
            }
        }
    }

    fn fire(&mut self, task: Task, result: Completion) {
        let callback = match task {
            Task::Io(io) => io.callback,
            Task::Timer(t) => t.callback,
        };
        callback(self, result);
    }

    fn next_timer_deadline(&self) -> Option<Instant> {
        self.timer_order.iter().filter_map(|id| match self.tasks.get(id) {
            Some(Task::Timer(t)) => Some(t.deadline),
            _ => None,
        }).min()
    }

    /// Runs one tick: polls every registered fd, fires any ready or expired
    /// completions in submission order, and returns. Blocks for at most the
    /// time until the next timer, or `POLL_IDLE_WAIT` if none is pending.
    pub fn run_once(&mut self) -> nix::Result<()> {
        let wait = match self.next_timer_deadline() {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => POLL_IDLE_WAIT,
        };

        let mut fds: Vec<RawFd> = Vec::new();
        let mut flags: Vec<PollFlags> = Vec::new();
        for (&fd, ids) in self.fd_order.iter() {
            let mut want = PollFlags::empty();
            for id in ids {
                match self.tasks.get(id) {
                    Some(Task::Io(io)) if io.interest == Interest::Readable => want |= PollFlags::POLLIN,
                    Some(Task::Io(io)) if io.interest == Interest::Writable => want |= PollFlags::POLLOUT,
                    _ => {}
                }
            }
            if !want.is_empty() {
                fds.push(fd);
                flags.push(want);
            }
        }

        let borrowed: Vec<std::os::fd::BorrowedFd> =
            fds.iter().map(|&fd| unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }).collect();
        let mut pollfds: Vec<PollFd> =
            borrowed.iter().zip(flags.iter()).map(|(fd, f)| PollFd::new(*fd, *f)).collect();

        let timeout = PollTimeout::try_from(wait).unwrap_or(PollTimeout::MAX);
        nix::poll::poll(&mut pollfds, timeout)?;

        let now = Instant::now();
        let mut ready_fds: Vec<(RawFd, bool, bool)> = Vec::new();
        for (i, pfd) in pollfds.iter().enumerate() {
            if let Some(revents) = pfd.revents() {
                let readable = revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR);
                let writable = revents.intersects(PollFlags::POLLOUT | PollFlags::POLLERR);
                if readable || writable {
                    ready_fds.push((fds[i], readable, writable));
                }
            }
        }

        let expired_timers: Vec<TaskId> = self
            .timer_order
            .iter()
            .copied()
            .filter(|id| matches!(self.tasks.get(id), Some(Task::Timer(t)) if t.deadline <= now))
            .collect();
        for id in expired_timers {
            if let Some(task) = self.tasks.remove(&id) {
                self.untrack(id, &task);
                self.fire(task, Completion::Ready);
            }
        }

        for (fd, readable, writable) in ready_fds {
            let ids: Vec<TaskId> = self.fd_order.get(&fd).cloned().unwrap_or_default().into();
            for id in ids {
                let matches = match self.tasks.get(&id) {
                    Some(Task::Io(io)) if io.interest == Interest::Readable => readable,
                    Some(Task::Io(io)) if io.interest == Interest::Writable => writable,
                    _ => false,
                };
                if matches {
                    if let Some(task) = self.tasks.remove(&id) {
                        self.untrack(id, &task);
                        self.fire(task, Completion::Ready);
                    }
                }
            }
        }

        Ok(())
    }

    pub fn has_pending(&self) -> bool {
        !self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, os::unix::io::AsRawFd, rc::Rc};

    #[test]
    fn fires_readable_pipe_and_passes_ready() {
        let (r, w) = nix::unistd::pipe().unwrap();
        let mut reactor = Reactor::new();
        let fired = Rc::new(RefCell::new(None));
        let fired2 = fired.clone();
        reactor.submit_readable(r.as_raw_fd(), move |_, result| {
            *fired2.borrow_mut() = Some(result);
        });
        nix::unistd::write(&w, b"x").unwrap();
        reactor.run_once().unwrap();
        assert_eq!(*fired.borrow(), Some(Completion::Ready));
    }

    #[test]
    fn cancel_by_fd_fires_cancelled_not_ready() {
        let (r, _w) = nix::unistd::pipe().unwrap();
        let mut reactor = Reactor::new();
        let fired = Rc::new(RefCell::new(None));
        let fired2 = fired.clone();
        reactor.submit_readable(r.as_raw_fd(), move |_, result| {
            *fired2.borrow_mut() = Some(result);
        });
        reactor.cancel_by_fd(r.as_raw_fd());
        assert_eq!(*fired.borrow(), Some(Completion::Cancelled));
        assert!(!reactor.has_pending());
    }

    #[test]
    fn timer_fires_after_deadline() {
        let mut reactor = Reactor::new();
        let fired = Rc::new(RefCell::new(false));
        let fired2 = fired.clone();
        reactor.submit_timeout(Duration::from_millis(1), move |_, result| {
            assert_eq!(result, Completion::Ready);
            *fired2.borrow_mut() = true;
        });
        std::thread::sleep(Duration::from_millis(5));
        reactor.run_once().unwrap();
        assert!(*fired.borrow());
    }

    #[test]
    fn io_completions_for_same_fd_fire_in_submission_order() {
        let (r, w) = nix::unistd::pipe().unwrap();
        let mut reactor = Reactor::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            reactor.submit_readable(r.as_raw_fd(), move |_, _| order.borrow_mut().push(i));
        }
        nix::unistd::write(&w, b"x").unwrap();
        reactor.run_once().unwrap();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }
}
