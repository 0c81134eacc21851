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

//! Translates a `key_input` event, shaped like a W3C `KeyboardEvent`
//! (`key`/`code` plus the four modifier flags), into the bytes a shell
//! expects on stdin. `code` carries the physical key for named keys
//! ("Enter", "ArrowUp", "F1", ...); `key` carries the produced character
//! for everything else. Cursor keys additionally depend on whether the
//! emulator has switched to application cursor-key mode (DECCKM), so the
//! caller passes that bit in rather than this module reaching into the
//! emulator itself.

/// A single `key_input` notification's params, after parsing the wire map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: String,
    pub code: String,
    pub shift: bool,
    pub ctrl: bool,
    pub alt: bool,
    pub meta: bool,
}

/// Encodes `event` to PTY bytes, honoring `application_cursor` (DECCKM)
/// for the arrow keys. Returns `None` for events this daemon has no byte
/// sequence for, which the caller should just drop.
pub fn encode(event: &KeyEvent, application_cursor: bool) -> Option<Vec<u8>> {
    if event.ctrl && !event.alt && !event.meta {
        if let Some(bytes) = encode_control(&event.key) {
            return Some(bytes);
        }
    }

    let mut bytes = encode_named(&event.code, application_cursor).or_else(|| encode_literal(&event.key))?;
    if event.alt {
        bytes.insert(0, 0x1b);
    }
    Some(bytes)
}

fn encode_named(code: &str, application_cursor: bool) -> Option<Vec<u8>> {
    let bytes = match code {
        "Enter" | "NumpadEnter" => b"\r".to_vec(),
        "Tab" => b"\t".to_vec(),
        "Escape" => b"\x1b".to_vec(),
        "Backspace" => b"\x7f".to_vec(),
        "Space" => b" ".to_vec(),
        "ArrowUp" => cursor_key(b'A', application_cursor),
        "ArrowDown" => cursor_key(b'B', application_cursor),
        "ArrowRight" => cursor_key(b'C', application_cursor),
        "ArrowLeft" => cursor_key(b'D', application_cursor),
        "Home" => b"\x1b[H".to_vec(),
        "End" => b"\x1b[F".to_vec(),
        "PageUp" => b"\x1b[5~".to_vec(),
        "PageDown" => b"\x1b[6~".to_vec(),
        "Delete" => b"\x1b[3~".to_vec(),
        "F1" => b"\x1bOP".to_vec(),
        "F2" => b"\x1bOQ".to_vec(),
        "F3" => b"\x1bOR".to_vec(),
        "F4" => b"\x1bOS".to_vec(),
        _ => return None,
    };
    Some(bytes)
}

fn cursor_key(final_byte: u8, application_cursor: bool) -> Vec<u8> {
    let prefix = if application_cursor { b'O' } else { b'[' };
    vec![0x1b, prefix, final_byte]
}

/// Falls back to the produced character for anything `encode_named`
/// doesn't recognize as a physical key name (e.g. letters and digits,
/// where `code` is layout-dependent but `key` is already the right byte).
fn encode_literal(key: &str) -> Option<Vec<u8>> {
    if key.chars().count() == 1 {
        Some(key.as_bytes().to_vec())
    } else {
        None
    }
}

fn encode_control(key: &str) -> Option<Vec<u8>> {
    let mut chars = key.chars();
    let ch = chars.next()?;
    if chars.next().is_some() {
        return None;
    }
    let lower = ch.to_ascii_lowercase();
    if !lower.is_ascii_lowercase() {
        return None;
    }
    Some(vec![(lower as u8) - b'a' + 1])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(key: &str, code: &str) -> KeyEvent {
        KeyEvent { key: key.to_string(), code: code.to_string(), shift: false, ctrl: false, alt: false, meta: false }
    }

    #[test]
    fn named_keys_map_to_their_escape_sequences() {
        assert_eq!(encode(&event("Enter", "Enter"), false), Some(b"\r".to_vec()));
        assert_eq!(encode(&event("ArrowUp", "ArrowUp"), false), Some(b"\x1b[A".to_vec()));
    }

    #[test]
    fn application_cursor_mode_changes_arrow_key_encoding() {
        assert_eq!(encode(&event("ArrowUp", "ArrowUp"), true), Some(b"\x1bOA".to_vec()));
        assert_eq!(encode(&event("ArrowUp", "ArrowUp"), false), Some(b"\x1b[A".to_vec()));
    }

    #[test]
    fn ctrl_modifier_maps_to_control_byte_from_key() {
        let mut e = event("c", "KeyC");
        e.ctrl = true;
        assert_eq!(encode(&e, false), Some(vec![3]));

        let mut e = event("a", "KeyA");
        e.ctrl = true;
        assert_eq!(encode(&e, false), Some(vec![1]));
    }

    #[test]
    fn plain_character_passes_through_via_key() {
        assert_eq!(encode(&event("q", "KeyQ"), false), Some(b"q".to_vec()));
    }

    #[test]
    fn alt_modifier_prefixes_escape() {
        let mut e = event("q", "KeyQ");
        e.alt = true;
        assert_eq!(encode(&e, false), Some(b"\x1bq".to_vec()));
    }

    #[test]
    fn unrecognized_event_is_rejected() {
        let e = event("", "Unidentified");
        assert_eq!(encode(&e, false), None);
    }
}
