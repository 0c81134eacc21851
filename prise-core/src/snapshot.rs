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

//! Value types copied out of the emulator under the session lock.
//!
//! Nothing here borrows from emulator memory: `ScreenSnapshot` owns every
//! grapheme it carries so the session mutex can be released before the
//! redraw builder runs.

use std::collections::BTreeMap;

use crate::emulator::{Dirty, Emulator};

pub type StyleId = u16;

pub const DEFAULT_STYLE: StyleId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Color {
    Rgb(u8, u8, u8),
    Palette(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Style {
    pub fg: Option<Color>,
    pub bg: Option<Color>,
    pub bold: bool,
    pub dim: bool,
    pub italic: bool,
    pub underline: bool,
    pub reverse: bool,
    pub blink: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorShape {
    Block,
    Beam,
    Underline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub text: String,
    pub style: StyleId,
    pub wide: bool,
}

impl Cell {
    pub fn blank() -> Cell {
        Cell { text: String::new(), style: DEFAULT_STYLE, wide: false }
    }
}

/// Which rows a snapshot actually carries. `Full` captures every row
/// (always paired with a `resize` sub-event downstream); `Incremental`
/// carries only the rows the emulator flagged dirty since the last
/// capture.
#[derive(Debug, Clone)]
pub enum Extent {
    Full,
    Incremental { rows: Vec<u16> },
}

#[derive(Debug, Clone)]
pub struct ScreenSnapshot {
    pub rows: u16,
    pub cols: u16,
    pub cursor_row: u16,
    pub cursor_col: u16,
    pub cursor_shape: CursorShape,
    pub extent: Extent,
    /// Row number -> that row's cells, left to right. Only rows named by
    /// `extent` are present.
    pub row_cells: BTreeMap<u16, Vec<Cell>>,
    /// Styles referenced by any cell in `row_cells`, resolved so the
    /// redraw builder doesn't need to reach back into the emulator.
    pub styles: BTreeMap<StyleId, Style>,
}

impl ScreenSnapshot {
    pub fn is_full(&self) -> bool {
        matches!(self.extent, Extent::Full)
    }

    pub fn dirty_rows(&self) -> Vec<u16> {
        match &self.extent {
            Extent::Full => (0..self.rows).collect(),
            Extent::Incremental { rows } => rows.clone(),
        }
    }
}

/// Copies state out of `emulator` under whatever lock the caller is
/// already holding, clearing its dirty tracking in the process.
pub fn capture(emulator: &mut dyn Emulator) -> ScreenSnapshot {
    let (rows, cols) = emulator.dims();
    let (cursor_row, cursor_col) = emulator.cursor_pos();
    let cursor_shape = emulator.cursor_shape();

    let extent = match emulator.take_dirty() {
        Dirty::Full => Extent::Full,
        Dirty::Rows(rows) => Extent::Incremental { rows },
        Dirty::None => Extent::Incremental { rows: Vec::new() },
    };

    let rows_to_capture: Vec<u16> = match &extent {
        Extent::Full => (0..rows).collect(),
        Extent::Incremental { rows } => rows.clone(),
    };

    let mut row_cells = BTreeMap::new();
    let mut styles = BTreeMap::new();
    for row in rows_to_capture {
        let cells = emulator.row_cells(row);
        for cell in &cells {
            styles.entry(cell.style).or_insert_with(|| emulator.style(cell.style));
        }
        row_cells.insert(row, cells);
    }

    ScreenSnapshot { rows, cols, cursor_row, cursor_col, cursor_shape, extent, row_cells, styles }
}
