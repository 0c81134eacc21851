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

//! The dispatcher: tracks clients, sessions, attachments, and per-client
//! send queues, and is the only thing in the daemon allowed to mutate any
//! of them. Everything here runs on the loop thread.

use std::{
    cell::RefCell,
    collections::{BTreeSet, HashMap},
    fmt,
    os::fd::{BorrowedFd, RawFd},
    rc::{Rc, Weak},
    time::{Duration, Instant},
};

use prise_protocol::{Message, Value};
use tracing::{info, warn};

use crate::{
    client::Client,
    consts::{DEFAULT_COLS, DEFAULT_ROWS},
    frame::{self, FrameDecision},
    reactor::{Completion, Reactor},
    session::{Session, SessionId},
    snapshot,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    SessionNotFound,
    InvalidParams,
    WriteFailed,
    ResizeFailed,
    SpawnFailed(String),
    UnknownMethod(String),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::SessionNotFound => write!(f, "session not found"),
            DispatchError::InvalidParams => write!(f, "invalid params"),
            DispatchError::WriteFailed => write!(f, "write failed"),
            DispatchError::ResizeFailed => write!(f, "resize failed"),
            DispatchError::SpawnFailed(msg) => write!(f, "spawn failed: {msg}"),
            DispatchError::UnknownMethod(method) => write!(f, "unknown method: {method}"),
        }
    }
}

pub struct SpawnDefaults {
    pub argv: Vec<String>,
    pub env: HashMap<String, String>,
    pub scrollback_lines: usize,
    pub pty_read_chunk: usize,
}

pub struct Registry {
    clients: HashMap<RawFd, Client>,
    sessions: HashMap<SessionId, Session>,
    next_session_id: SessionId,
    pub exit_on_idle: bool,
    /// Set the first time a client connects. Idle-exit only fires on a
    /// non-empty-to-empty transition of the client list, not on the
    /// startup window before anyone has dialed in yet.
    served_any_client: bool,
    frame_interval: Duration,
    defaults: SpawnDefaults,
    self_handle: Option<Weak<RefCell<Registry>>>,
}

impl Registry {
    pub fn new(exit_on_idle: bool, frame_interval: Duration, defaults: SpawnDefaults) -> Rc<RefCell<Registry>> {
        let registry = Rc::new(RefCell::new(Registry {
            clients: HashMap::new(),
            sessions: HashMap::new(),
            next_session_id: 0,
            exit_on_idle,
            served_any_client: false,
            frame_interval,
            defaults,
            self_handle: None,
        }));
        registry.borrow_mut().self_handle = Some(Rc::downgrade(&registry));
        registry
    }

    fn handle(&self) -> Rc<RefCell<Registry>> {
        self.self_handle.as_ref().and_then(Weak::upgrade).expect("registry handle set at construction")
    }

    pub fn is_idle(&self) -> bool {
        self.exit_on_idle && self.served_any_client && self.clients.is_empty()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    // ---- client lifecycle ----------------------------------------------

    /// Registers a freshly accepted client and arms its first recv.
    pub fn add_client(registry: &Rc<RefCell<Registry>>, reactor: &mut Reactor, fd: RawFd) {
        {
            let mut registry = registry.borrow_mut();
            registry.clients.insert(fd, Client::new());
            registry.served_any_client = true;
        }
        Registry::arm_recv(registry, reactor, fd);
    }

    fn arm_recv(registry: &Rc<RefCell<Registry>>, reactor: &mut Reactor, fd: RawFd) {
        let handle = registry.clone();
        reactor.submit_readable(fd, move |reactor, completion| {
            if completion == Completion::Cancelled {
                return;
            }
            Registry::on_readable(&handle, reactor, fd);
        });
    }

    fn on_readable(registry: &Rc<RefCell<Registry>>, reactor: &mut Reactor, fd: RawFd) {
        let mut buf = [0u8; 16 * 1024];
        let outcome = nix::unistd::read(fd, &mut buf);
        match outcome {
            Ok(0) => registry.borrow_mut().disconnect(reactor, fd),
            Ok(n) => {
                registry.borrow_mut().feed(reactor, fd, &buf[..n]);
                Registry::arm_recv(registry, reactor, fd);
            }
            Err(nix::errno::Errno::EAGAIN | nix::errno::Errno::EINTR) => {
                Registry::arm_recv(registry, reactor, fd);
            }
            Err(_) => registry.borrow_mut().disconnect(reactor, fd),
        }
    }

    fn feed(&mut self, reactor: &mut Reactor, fd: RawFd, bytes: &[u8]) {
        let Some(client) = self.clients.get_mut(&fd) else { return };
        client.codec.feed(bytes);
        loop {
            let Some(client) = self.clients.get_mut(&fd) else { return };
            match client.codec.next_message() {
                Ok(Some(msg)) => self.dispatch(reactor, fd, msg),
                Ok(None) => break,
                Err(e) => {
                    warn!(err = %e, fd, "dropping malformed message, clearing recv buffer");
                    if let Some(client) = self.clients.get_mut(&fd) {
                        client.codec.clear();
                    }
                    break;
                }
            }
        }
    }

    fn dispatch(&mut self, reactor: &mut Reactor, fd: RawFd, msg: Message) {
        match msg {
            Message::Request { msgid, method, params } => {
                let result = self.handle_request(reactor, &method, params, fd);
                let response = match result {
                    Ok(value) => Message::response_ok(msgid, value),
                    Err(e) => Message::response_err(msgid, e.to_string()),
                };
                let mut buf = Vec::new();
                if prise_protocol::encode_to(response, &mut buf).is_ok() {
                    self.send_bytes(reactor, fd, buf);
                }
            }
            Message::Notification { method, params } => {
                self.handle_notification(&method, params);
            }
            Message::Response { .. } => {
                warn!(fd, "daemon received a response message, ignoring");
            }
        }
    }

    fn handle_request(
        &mut self,
        reactor: &mut Reactor,
        method: &str,
        params: Value,
        fd: RawFd,
    ) -> Result<Value, DispatchError> {
        match method {
            "ping" => Ok(Value::from("pong")),
            "spawn_pty" => {
                let (rows, cols) = params_rows_cols(&params).unwrap_or((DEFAULT_ROWS, DEFAULT_COLS));
                let id = self
                    .spawn_pty(reactor, rows, cols)
                    .map_err(|e| DispatchError::SpawnFailed(e.to_string()))?;
                Ok(Value::from(id))
            }
            "attach_pty" => {
                let id = params_session_id(&params).ok_or(DispatchError::InvalidParams)?;
                self.attach_pty(reactor, id, fd)?;
                Ok(Value::from(id))
            }
            "detach_pty" => {
                let id = params_session_id(&params).ok_or(DispatchError::InvalidParams)?;
                self.detach_pty(id, fd)?;
                Ok(Value::Nil)
            }
            "write_pty" => {
                let (id, bytes) = params_session_bytes(&params).ok_or(DispatchError::InvalidParams)?;
                self.write_pty(id, &bytes)?;
                Ok(Value::Nil)
            }
            "resize_pty" => {
                let (id, rows, cols) = params_session_rows_cols(&params).ok_or(DispatchError::InvalidParams)?;
                self.resize_pty(id, rows, cols)?;
                Ok(Value::Nil)
            }
            other => Err(DispatchError::UnknownMethod(other.to_string())),
        }
    }

    fn handle_notification(&mut self, method: &str, params: Value) {
        match method {
            "write_pty" => {
                if let Some((id, bytes)) = params_session_bytes(&params) {
                    let _ = self.write_pty(id, &bytes);
                }
            }
            "resize_pty" => {
                if let Some((id, rows, cols)) = params_session_rows_cols(&params) {
                    let _ = self.resize_pty(id, rows, cols);
                }
            }
            "key_input" => {
                if let Some((id, event)) = params_session_key_event(&params) {
                    let _ = self.key_input(id, &event);
                }
            }
            other => warn!(method = other, "ignoring unknown notification"),
        }
    }

    // ---- session operations ---------------------------------------------

    fn spawn_pty(&mut self, reactor: &mut Reactor, rows: u16, cols: u16) -> anyhow::Result<SessionId> {
        let id = self.next_session_id;
        let mut session = Session::spawn(
            id,
            &self.defaults.argv,
            &self.defaults.env,
            rows,
            cols,
            self.defaults.scrollback_lines,
            self.defaults.pty_read_chunk,
        )?;
        self.next_session_id += 1;
        session.last_render = Instant::now() - self.frame_interval;
        self.sessions.insert(id, session);
        info!(session = id, rows, cols, "spawned session");
        self.watch_signal(reactor, id);
        crate::test_hooks::emit("daemon-spawn-pty");
        Ok(id)
    }

    fn attach_pty(&mut self, reactor: &mut Reactor, id: SessionId, fd: RawFd) -> Result<(), DispatchError> {
        {
            let session = self.sessions.get_mut(&id).ok_or(DispatchError::SessionNotFound)?;
            session.attached.insert(fd);
            // Idempotent on re-attach: always forces a fresh full redraw
            // rather than rejecting an already-attached client.
            session.lock().emulator.force_full_redraw();
        }
        if let Some(client) = self.clients.get_mut(&fd) {
            client.attached.insert(id);
        }
        self.render_now(reactor, id);
        Ok(())
    }

    fn detach_pty(&mut self, id: SessionId, fd: RawFd) -> Result<(), DispatchError> {
        let session = self.sessions.get_mut(&id).ok_or(DispatchError::SessionNotFound)?;
        session.attached.remove(&fd);
        session.keep_alive = true;
        if let Some(client) = self.clients.get_mut(&fd) {
            client.forget_session(id);
        }
        self.reap_if_idle(id);
        Ok(())
    }

    fn write_pty(&mut self, id: SessionId, bytes: &[u8]) -> Result<(), DispatchError> {
        let session = self.sessions.get(&id).ok_or(DispatchError::SessionNotFound)?;
        session.write_pty(bytes).map_err(|_| DispatchError::WriteFailed)
    }

    fn resize_pty(&mut self, id: SessionId, rows: u16, cols: u16) -> Result<(), DispatchError> {
        let session = self.sessions.get(&id).ok_or(DispatchError::SessionNotFound)?;
        session.resize(rows, cols).map_err(|_| DispatchError::ResizeFailed)
    }

    /// Encodes `event` under the session's emulator mutex (application
    /// cursor-key mode only makes sense read alongside the rest of the
    /// emulator's state) and writes the result to the PTY master.
    fn key_input(&mut self, id: SessionId, event: &crate::keys::KeyEvent) -> Result<(), DispatchError> {
        let session = self.sessions.get(&id).ok_or(DispatchError::SessionNotFound)?;
        let bytes = {
            let inner = session.lock();
            crate::keys::encode(event, inner.emulator.application_cursor_keys())
        };
        let Some(bytes) = bytes else { return Ok(()) };
        session.write_pty(&bytes).map_err(|_| DispatchError::WriteFailed)
    }

    fn reap_if_idle(&mut self, id: SessionId) {
        let idle = self.sessions.get(&id).map(Session::is_idle).unwrap_or(false);
        if idle {
            if let Some(session) = self.sessions.remove(&id) {
                info!(session = id, "destroying idle session");
                session.shutdown();
            }
        }
    }

    // ---- frame scheduling -------------------------------------------------

    /// Installs the reactor watch for a session's signal pipe; re-arms
    /// itself after every wake so it keeps watching for the session's life.
    ///
    /// Takes `&self` rather than the shared `Rc<RefCell<Registry>>` handle:
    /// this is called from deep inside an already-held `borrow_mut()` (via
    /// `spawn_pty`), so re-borrowing the cell here would panic. The handle
    /// is only cloned (never borrowed) for the callback that fires later.
    fn watch_signal(&self, reactor: &mut Reactor, id: SessionId) {
        let Some(session) = self.sessions.get(&id) else { return };
        let fd = session.signal_read_fd();
        let handle = self.handle();
        reactor.submit_readable(fd, move |reactor, completion| {
            if completion == Completion::Cancelled {
                return;
            }
            handle.borrow_mut().on_signal(reactor, id);
            handle.borrow().watch_signal(reactor, id);
        });
    }

    fn on_signal(&mut self, reactor: &mut Reactor, id: SessionId) {
        let Some(session) = self.sessions.get(&id) else { return };
        session.drain_signal();

        let timer_pending = session.render_timer.is_some();
        let decision = frame::decide(Instant::now(), session.last_render, timer_pending, self.frame_interval);
        match decision {
            FrameDecision::RenderNow => self.render_now(reactor, id),
            FrameDecision::ScheduleIn(delay) => self.schedule_render(reactor, id, delay),
            FrameDecision::AlreadyScheduled => {}
        }
    }

    fn schedule_render(&mut self, reactor: &mut Reactor, id: SessionId, delay: Duration) {
        let registry = self.handle();
        let task = reactor.submit_timeout(delay, move |reactor, completion| {
            let mut registry = registry.borrow_mut();
            if let Some(session) = registry.sessions.get_mut(&id) {
                session.render_timer = None;
            }
            if completion == Completion::Ready {
                registry.render_now(reactor, id);
            }
        });
        if let Some(session) = self.sessions.get_mut(&id) {
            session.render_timer = Some(task);
        }
    }

    fn render_now(&mut self, reactor: &mut Reactor, id: SessionId) {
        let Some(session) = self.sessions.get_mut(&id) else { return };
        if session.attached.is_empty() {
            return;
        }
        let snapshot = {
            let mut inner = session.lock();
            snapshot::capture(&mut *inner.emulator)
        };
        session.last_render = Instant::now();
        let attached: Vec<RawFd> = session.attached.iter().copied().collect();

        for fd in attached {
            let Some(client) = self.clients.get_mut(&fd) else { continue };
            let seen = client.seen_styles_for(id);
            let params = crate::redraw::build(id, &snapshot, seen);
            let msg = Message::notification("redraw", params);
            let mut buf = Vec::new();
            if prise_protocol::encode_to(msg, &mut buf).is_err() {
                continue;
            }
            self.send_bytes(reactor, fd, buf);
        }
        crate::test_hooks::emit("daemon-render-frame");
    }

    // ---- send path ----------------------------------------------------

    fn send_bytes(&mut self, reactor: &mut Reactor, fd: RawFd, bytes: Vec<u8>) {
        let Some(client) = self.clients.get_mut(&fd) else { return };
        if client.enqueue_send(bytes) {
            self.arm_send(reactor, fd);
        }
    }

    fn arm_send(&self, reactor: &mut Reactor, fd: RawFd) {
        let registry = self.handle();
        reactor.submit_writable(fd, move |reactor, completion| {
            if completion == Completion::Cancelled {
                return;
            }
            registry.borrow_mut().on_writable(reactor, fd);
        });
    }

    fn on_writable(&mut self, reactor: &mut Reactor, fd: RawFd) {
        let Some(client) = self.clients.get_mut(&fd) else { return };
        let Some(pending) = client.pending().map(<[u8]>::to_vec) else { return };
        match nix::unistd::write(unsafe { BorrowedFd::borrow_raw(fd) }, &pending) {
            Ok(n) => {
                let client = self.clients.get_mut(&fd).unwrap();
                if client.advance_send(n) {
                    client.complete_send();
                }
                if client.pending().is_some() {
                    self.arm_send(reactor, fd);
                }
            }
            Err(nix::errno::Errno::EAGAIN | nix::errno::Errno::EINTR) => {
                self.arm_send(reactor, fd);
            }
            Err(_) => {
                if let Some(client) = self.clients.get_mut(&fd) {
                    client.drain_send_queue();
                }
            }
        }
    }

    // ---- disconnect -----------------------------------------------------

    pub fn disconnect(&mut self, reactor: &mut Reactor, fd: RawFd) {
        reactor.cancel_by_fd(fd);
        let Some(client) = self.clients.remove(&fd) else { return };
        let affected: BTreeSet<SessionId> = client.attached;
        for id in affected {
            if let Some(session) = self.sessions.get_mut(&id) {
                session.attached.remove(&fd);
            }
            self.reap_if_idle(id);
        }
        let _ = nix::unistd::close(fd);
    }

    pub fn client_fds(&self) -> Vec<RawFd> {
        self.clients.keys().copied().collect()
    }
}

fn as_u64(v: &Value) -> Option<u64> {
    v.as_u64()
}

fn as_u16(v: &Value) -> Option<u16> {
    v.as_u64().and_then(|n| u16::try_from(n).ok())
}

fn params_rows_cols(params: &Value) -> Option<(u16, u16)> {
    let arr = params.as_array()?;
    let rows = as_u16(arr.first()?)?;
    let cols = as_u16(arr.get(1)?)?;
    Some((rows, cols))
}

fn params_session_id(params: &Value) -> Option<SessionId> {
    let arr = params.as_array()?;
    as_u64(arr.first()?)
}

fn params_session_bytes(params: &Value) -> Option<(SessionId, Vec<u8>)> {
    let arr = params.as_array()?;
    let id = as_u64(arr.first()?)?;
    let bytes = match arr.get(1)? {
        Value::Binary(b) => b.clone(),
        Value::String(s) => s.as_bytes().to_vec(),
        _ => return None,
    };
    Some((id, bytes))
}

fn params_session_rows_cols(params: &Value) -> Option<(SessionId, u16, u16)> {
    let arr = params.as_array()?;
    let id = as_u64(arr.first()?)?;
    let rows = as_u16(arr.get(1)?)?;
    let cols = as_u16(arr.get(2)?)?;
    Some((id, rows, cols))
}

/// Parses `[session_id, {key, code, shiftKey, ctrlKey, altKey, metaKey}]`.
fn params_session_key_event(params: &Value) -> Option<(SessionId, crate::keys::KeyEvent)> {
    let arr = params.as_array()?;
    let id = as_u64(arr.first()?)?;
    let map = arr.get(1)?.as_map()?;
    let get = |field: &str| map.iter().find(|(k, _)| k.as_str() == Some(field)).map(|(_, v)| v);
    let key = get("key")?.as_str()?.to_string();
    let code = get("code")?.as_str()?.to_string();
    let flag = |field: &str| get(field).and_then(Value::as_bool).unwrap_or(false);
    Some((
        id,
        crate::keys::KeyEvent {
            key,
            code,
            shift: flag("shiftKey"),
            ctrl: flag("ctrlKey"),
            alt: flag("altKey"),
            meta: flag("metaKey"),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_registry(exit_on_idle: bool) -> Rc<RefCell<Registry>> {
        let defaults =
            SpawnDefaults { argv: vec![], env: HashMap::new(), scrollback_lines: 0, pty_read_chunk: 4096 };
        Registry::new(exit_on_idle, Duration::from_millis(8), defaults)
    }

    #[test]
    fn idle_exit_does_not_fire_before_any_client_has_connected() {
        let registry = new_registry(true);
        assert!(!registry.borrow().is_idle());
    }

    #[test]
    fn idle_exit_fires_after_the_client_list_goes_empty_again() {
        let registry = new_registry(true);
        let mut reactor = Reactor::new();
        Registry::add_client(&registry, &mut reactor, 999);
        assert!(!registry.borrow().is_idle());
        registry.borrow_mut().disconnect(&mut reactor, 999);
        assert!(registry.borrow().is_idle());
    }

    #[test]
    fn idle_exit_stays_off_without_exit_on_idle() {
        let registry = new_registry(false);
        let mut reactor = Reactor::new();
        Registry::add_client(&registry, &mut reactor, 999);
        registry.borrow_mut().disconnect(&mut reactor, 999);
        assert!(!registry.borrow().is_idle());
    }

    #[test]
    fn parses_key_event_map() {
        let params = Value::Array(vec![
            Value::from(3u64),
            Value::Map(vec![
                (Value::from("key"), Value::from("a")),
                (Value::from("code"), Value::from("KeyA")),
                (Value::from("ctrlKey"), Value::from(true)),
            ]),
        ]);
        let (id, event) = params_session_key_event(&params).unwrap();
        assert_eq!(id, 3);
        assert_eq!(event.key, "a");
        assert_eq!(event.code, "KeyA");
        assert!(event.ctrl);
        assert!(!event.shift);
    }

    #[test]
    fn rejects_key_event_with_non_map_second_element() {
        let params = Value::Array(vec![Value::from(0u64), Value::from("Enter")]);
        assert!(params_session_key_event(&params).is_none());
    }
}
