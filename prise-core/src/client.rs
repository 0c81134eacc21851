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

//! One connected front end. A client's send path is the single most
//! important concurrency invariant in the daemon: at most one send is ever
//! outstanding on its socket, with the rest queued FIFO.

use std::collections::{BTreeMap, BTreeSet};

use prise_protocol::Codec;

use crate::{session::SessionId, snapshot::StyleId};

/// Explicit states instead of two nullable fields, per this daemon's
/// concurrency design: a send is either idle, has exactly one buffer in
/// flight, or has one in flight plus a FIFO queue behind it.
pub enum SendState {
    Idle,
    InFlight { buffer: Vec<u8>, sent: usize },
    InFlightQueued { buffer: Vec<u8>, sent: usize, queue: std::collections::VecDeque<Vec<u8>> },
}

pub struct Client {
    pub codec: Codec,
    pub send_state: SendState,
    pub attached: BTreeSet<SessionId>,
    /// Style IDs already defined to this client, scoped per session since
    /// style numbering is only stable within a single session's lifetime.
    seen_styles: BTreeMap<SessionId, BTreeSet<StyleId>>,
}

impl Client {
    pub fn new() -> Client {
        Client { codec: Codec::new(), send_state: SendState::Idle, attached: BTreeSet::new(), seen_styles: BTreeMap::new() }
    }

    pub fn seen_styles_for(&mut self, session: SessionId) -> &mut BTreeSet<StyleId> {
        self.seen_styles.entry(session).or_default()
    }

    pub fn forget_session(&mut self, session: SessionId) {
        self.attached.remove(&session);
        self.seen_styles.remove(&session);
    }

    /// Enqueues `bytes` for send. Returns `true` if the caller should
    /// submit a send immediately (nothing was already in flight).
    pub fn enqueue_send(&mut self, bytes: Vec<u8>) -> bool {
        match &mut self.send_state {
            SendState::Idle => {
                self.send_state = SendState::InFlight { buffer: bytes, sent: 0 };
                true
            }
            SendState::InFlight { buffer, sent } => {
                let buffer = std::mem::take(buffer);
                let sent = *sent;
                let mut queue = std::collections::VecDeque::new();
                queue.push_back(bytes);
                self.send_state = SendState::InFlightQueued { buffer, sent, queue };
                false
            }
            SendState::InFlightQueued { queue, .. } => {
                queue.push_back(bytes);
                false
            }
        }
    }

    /// The bytes still left to write for whatever is currently in flight.
    pub fn pending(&self) -> Option<&[u8]> {
        match &self.send_state {
            SendState::Idle => None,
            SendState::InFlight { buffer, sent } | SendState::InFlightQueued { buffer, sent, .. } => {
                Some(&buffer[*sent..])
            }
        }
    }

    /// Records that `n` more bytes of the in-flight buffer were written.
    /// Returns `true` once that buffer is fully sent.
    pub fn advance_send(&mut self, n: usize) -> bool {
        match &mut self.send_state {
            SendState::Idle => true,
            SendState::InFlight { buffer, sent } | SendState::InFlightQueued { buffer, sent, .. } => {
                *sent += n;
                *sent >= buffer.len()
            }
        }
    }

    /// Called once the in-flight buffer is fully sent. Returns the next
    /// buffer to submit, if the queue was non-empty.
    pub fn complete_send(&mut self) -> Option<Vec<u8>> {
        match std::mem::replace(&mut self.send_state, SendState::Idle) {
            SendState::Idle | SendState::InFlight { .. } => None,
            SendState::InFlightQueued { mut queue, .. } => match queue.pop_front() {
                Some(buffer) => {
                    self.send_state = if queue.is_empty() {
                        SendState::InFlight { buffer: buffer.clone(), sent: 0 }
                    } else {
                        SendState::InFlightQueued { buffer: buffer.clone(), sent: 0, queue }
                    };
                    Some(buffer)
                }
                None => None,
            },
        }
    }

    /// Drops all queued and in-flight buffers, e.g. on send error or
    /// disconnect, where no further sends will be attempted.
    pub fn drain_send_queue(&mut self) {
        self.send_state = SendState::Idle;
    }
}

impl Default for Client {
    fn default() -> Client {
        Client::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_send_is_submitted_immediately() {
        let mut client = Client::new();
        assert!(client.enqueue_send(vec![1]));
    }

    #[test]
    fn second_send_while_in_flight_is_queued_not_submitted() {
        let mut client = Client::new();
        assert!(client.enqueue_send(vec![1]));
        assert!(!client.enqueue_send(vec![2]));
        assert!(!client.enqueue_send(vec![3]));
    }

    #[test]
    fn completion_drains_queue_in_fifo_order() {
        let mut client = Client::new();
        client.enqueue_send(vec![1]);
        client.enqueue_send(vec![2]);
        client.enqueue_send(vec![3]);
        client.advance_send(1);
        assert_eq!(client.complete_send(), Some(vec![2]));
        client.advance_send(1);
        assert_eq!(client.complete_send(), Some(vec![3]));
        client.advance_send(1);
        assert_eq!(client.complete_send(), None);
    }

    #[test]
    fn partial_write_does_not_complete_the_buffer() {
        let mut client = Client::new();
        client.enqueue_send(vec![1, 2, 3]);
        assert!(!client.advance_send(2));
        assert_eq!(client.pending(), Some(&[3][..]));
        assert!(client.advance_send(1));
    }

    #[test]
    fn seen_styles_are_scoped_per_session() {
        let mut client = Client::new();
        client.seen_styles_for(0).insert(5);
        assert!(client.seen_styles_for(0).contains(&5));
        assert!(!client.seen_styles_for(1).contains(&5));
    }
}
