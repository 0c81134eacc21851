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

//! The terminal emulator this daemon drives is an external collaborator
//! (the `vt100` crate) kept behind a narrow [`Emulator`] trait. Everything
//! this module adds on top of it — per-row dirty tracking, synchronized
//! output mode, and device-query write-back — the upstream screen parser
//! does not provide on its own, so it's tracked here instead.

use std::{
    cell::RefCell,
    collections::{BTreeMap, HashSet},
};

use crate::snapshot::{Cell, Color, CursorShape, Style, StyleId};

/// What changed since the emulator's dirty state was last cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dirty {
    None,
    Rows(Vec<u16>),
    Full,
}

pub trait Emulator: Send {
    fn process(&mut self, bytes: &[u8]) -> Vec<u8>;
    fn resize(&mut self, rows: u16, cols: u16);
    fn dims(&self) -> (u16, u16);
    fn cursor_pos(&self) -> (u16, u16);
    fn cursor_shape(&self) -> CursorShape;
    fn row_cells(&self, row: u16) -> Vec<Cell>;
    fn style(&self, id: StyleId) -> Style;
    /// Returns and clears the set of rows mutated since the last call.
    fn take_dirty(&mut self) -> Dirty;
    /// Forces the next `take_dirty()` to report `Full`, used when a newly
    /// attached client needs a complete screen even though nothing changed.
    fn force_full_redraw(&mut self);
    /// True while the client is mid synchronized-update (DECSET/RST 2026):
    /// the frame scheduler should not wake clients while this holds.
    fn is_synchronized(&self) -> bool;
    /// True when the application has switched cursor keys into application
    /// mode (DECCKM, `CSI ?1h`). Consulted by the key-input encoder so
    /// arrow keys get `SS3` sequences instead of `CSI` ones.
    fn application_cursor_keys(&self) -> bool;
}

const SYNC_SET: &[u8] = b"\x1b[?2026h";
const SYNC_RESET: &[u8] = b"\x1b[?2026l";
const CURSOR_POSITION_REPORT_QUERY: &[u8] = b"\x1b[6n";

/// `vt100`-backed implementation. `vt100::Parser` assigns no persistent
/// per-cell style handle, so styles are interned here by their resolved
/// attributes: two cells with identical attributes share a `StyleId`.
pub struct VtEmulator {
    parser: vt100::Parser,
    rows: u16,
    cols: u16,
    row_hashes: Vec<u64>,
    dirty: HashSet<u16>,
    full_dirty: bool,
    synchronized: bool,
    styles: RefCell<StyleTable>,
}

#[derive(Default)]
struct StyleTable {
    by_id: BTreeMap<StyleId, Style>,
    ids_by_key: BTreeMap<StyleKey, StyleId>,
    next_id: StyleId,
}

impl StyleTable {
    fn new() -> StyleTable {
        StyleTable { by_id: BTreeMap::from([(0, Style::default())]), ids_by_key: BTreeMap::new(), next_id: 1 }
    }

    fn intern(&mut self, style: Style) -> StyleId {
        let key = style_key(&style);
        if let Some(&id) = self.ids_by_key.get(&key) {
            return id;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.ids_by_key.insert(key, id);
        self.by_id.insert(id, style);
        id
    }
}

type StyleKey = (Option<Color>, Option<Color>, bool, bool, bool, bool, bool, bool);

impl VtEmulator {
    pub fn new(rows: u16, cols: u16, scrollback_lines: usize) -> VtEmulator {
        VtEmulator {
            parser: vt100::Parser::new(rows, cols, scrollback_lines),
            rows,
            cols,
            row_hashes: vec![0; rows as usize],
            dirty: HashSet::new(),
            full_dirty: true,
            synchronized: false,
            styles: RefCell::new(StyleTable::new()),
        }
    }

    fn scan_markers(&mut self, bytes: &[u8]) {
        if contains(bytes, SYNC_SET) {
            self.synchronized = true;
        }
        if contains(bytes, SYNC_RESET) {
            self.synchronized = false;
        }
    }

    fn row_hash(&self, row: u16) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        let screen = self.parser.screen();
        for col in 0..self.cols {
            if let Some(cell) = screen.cell(row, col) {
                cell.contents().hash(&mut hasher);
                cell.is_wide().hash(&mut hasher);
                cell.bold().hash(&mut hasher);
                cell.italic().hash(&mut hasher);
                cell.underline().hash(&mut hasher);
                cell.inverse().hash(&mut hasher);
                format!("{:?}", cell.fgcolor()).hash(&mut hasher);
                format!("{:?}", cell.bgcolor()).hash(&mut hasher);
            }
        }
        hasher.finish()
    }
}

fn style_key(s: &Style) -> StyleKey {
    (s.fg, s.bg, s.bold, s.dim, s.italic, s.underline, s.reverse, s.blink)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn convert_color(c: vt100::Color) -> Option<Color> {
    match c {
        vt100::Color::Default => None,
        vt100::Color::Idx(i) => Some(Color::Palette(i)),
        vt100::Color::Rgb(r, g, b) => Some(Color::Rgb(r, g, b)),
    }
}

impl Emulator for VtEmulator {
    fn process(&mut self, bytes: &[u8]) -> Vec<u8> {
        self.scan_markers(bytes);
        self.parser.process(bytes);

        let mut response = Vec::new();
        if contains(bytes, CURSOR_POSITION_REPORT_QUERY) {
            let (row, col) = self.parser.screen().cursor_position();
            response.extend(format!("\x1b[{};{}R", row + 1, col + 1).into_bytes());
        }

        if self.full_dirty {
            for row in 0..self.rows {
                self.row_hashes[row as usize] = self.row_hash(row);
            }
        } else {
            for row in 0..self.rows {
                let h = self.row_hash(row);
                if h != self.row_hashes[row as usize] {
                    self.dirty.insert(row);
                    self.row_hashes[row as usize] = h;
                }
            }
        }

        response
    }

    fn resize(&mut self, rows: u16, cols: u16) {
        self.parser.set_size(rows, cols);
        self.rows = rows;
        self.cols = cols;
        self.row_hashes = vec![0; rows as usize];
        self.dirty.clear();
        self.full_dirty = true;
    }

    fn dims(&self) -> (u16, u16) {
        (self.rows, self.cols)
    }

    fn cursor_pos(&self) -> (u16, u16) {
        self.parser.screen().cursor_position()
    }

    fn cursor_shape(&self) -> CursorShape {
        let screen = self.parser.screen();
        if screen.hide_cursor() {
            return CursorShape::Block;
        }
        match screen.cursor_shape() {
            vt100::CursorShape::Block => CursorShape::Block,
            vt100::CursorShape::Beam => CursorShape::Beam,
            vt100::CursorShape::Underline => CursorShape::Underline,
        }
    }

    fn row_cells(&self, row: u16) -> Vec<Cell> {
        let screen = self.parser.screen();
        let mut out = Vec::with_capacity(self.cols as usize);
        for col in 0..self.cols {
            let Some(cell) = screen.cell(row, col) else {
                out.push(Cell::blank());
                continue;
            };
            if cell.is_wide_continuation() {
                out.push(Cell::blank());
                continue;
            }
            let style = Style {
                fg: convert_color(cell.fgcolor()),
                bg: convert_color(cell.bgcolor()),
                bold: cell.bold(),
                dim: false,
                italic: cell.italic(),
                underline: cell.underline(),
                reverse: cell.inverse(),
                blink: false,
            };
            let id = if style == Style::default() { 0 } else { self.styles.borrow_mut().intern(style) };
            out.push(Cell { text: cell.contents(), style: id, wide: cell.is_wide() });
        }
        out
    }

    fn style(&self, id: StyleId) -> Style {
        self.styles.borrow().by_id.get(&id).copied().unwrap_or_default()
    }

    fn take_dirty(&mut self) -> Dirty {
        if self.full_dirty {
            self.full_dirty = false;
            self.dirty.clear();
            return Dirty::Full;
        }
        if self.dirty.is_empty() {
            return Dirty::None;
        }
        let mut rows: Vec<u16> = self.dirty.drain().collect();
        rows.sort_unstable();
        Dirty::Rows(rows)
    }

    fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    fn application_cursor_keys(&self) -> bool {
        self.parser.screen().application_cursor()
    }

    fn force_full_redraw(&mut self) {
        self.full_dirty = true;
        self.dirty.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_process_call_reports_full_dirty() {
        let mut emu = VtEmulator::new(4, 10, 0);
        emu.process(b"hello");
        assert_eq!(emu.take_dirty(), Dirty::Full);
    }

    #[test]
    fn subsequent_writes_report_only_changed_rows() {
        let mut emu = VtEmulator::new(4, 10, 0);
        emu.process(b"hello");
        emu.take_dirty();
        emu.process(b"\r\n\r\nworld");
        match emu.take_dirty() {
            Dirty::Rows(rows) => assert!(rows.contains(&2)),
            other => panic!("expected Rows, got {other:?}"),
        }
    }

    #[test]
    fn no_writes_report_no_dirty() {
        let mut emu = VtEmulator::new(4, 10, 0);
        emu.process(b"x");
        emu.take_dirty();
        assert_eq!(emu.take_dirty(), Dirty::None);
    }

    #[test]
    fn resize_forces_full_dirty_again() {
        let mut emu = VtEmulator::new(4, 10, 0);
        emu.process(b"x");
        emu.take_dirty();
        emu.resize(6, 12);
        assert_eq!(emu.dims(), (6, 12));
        assert_eq!(emu.take_dirty(), Dirty::Full);
    }

    #[test]
    fn synchronized_output_mode_toggles_on_csi_markers() {
        let mut emu = VtEmulator::new(4, 10, 0);
        assert!(!emu.is_synchronized());
        emu.process(SYNC_SET);
        assert!(emu.is_synchronized());
        emu.process(SYNC_RESET);
        assert!(!emu.is_synchronized());
    }

    #[test]
    fn cursor_position_query_gets_a_response() {
        let mut emu = VtEmulator::new(4, 10, 0);
        let resp = emu.process(CURSOR_POSITION_REPORT_QUERY);
        assert_eq!(resp, b"\x1b[1;1R");
    }

    #[test]
    fn application_cursor_keys_tracks_decckm() {
        let mut emu = VtEmulator::new(4, 10, 0);
        assert!(!emu.application_cursor_keys());
        emu.process(b"\x1b[?1h");
        assert!(emu.application_cursor_keys());
        emu.process(b"\x1b[?1l");
        assert!(!emu.application_cursor_keys());
    }
}
