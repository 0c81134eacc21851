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

//! Builds a `redraw` notification for one client out of a screen snapshot
//! and that client's seen-style cache, eliding style definitions the
//! client has already been sent.

use std::collections::BTreeSet;

use prise_protocol::Value;

use crate::snapshot::{Cell, Color, CursorShape, ScreenSnapshot, Style, StyleId, DEFAULT_STYLE};

fn event(name: &str, shape: Value) -> Value {
    Value::Array(vec![Value::from(name), shape])
}

fn cursor_shape_code(shape: CursorShape) -> i64 {
    match shape {
        CursorShape::Block => 0,
        CursorShape::Beam => 1,
        CursorShape::Underline => 2,
    }
}

fn color_attrs(key_rgb: &str, key_idx: &str, color: Option<Color>, out: &mut Vec<(Value, Value)>) {
    match color {
        Some(Color::Rgb(r, g, b)) => {
            let packed = ((r as i64) << 16) | ((g as i64) << 8) | (b as i64);
            out.push((Value::from(key_rgb), Value::from(packed)));
        }
        Some(Color::Palette(idx)) => out.push((Value::from(key_idx), Value::from(idx as i64))),
        None => {}
    }
}

fn style_attrs(style: &Style) -> Value {
    let mut attrs = Vec::new();
    color_attrs("fg", "fg_idx", style.fg, &mut attrs);
    color_attrs("bg", "bg_idx", style.bg, &mut attrs);
    if style.bold {
        attrs.push((Value::from("bold"), Value::from(true)));
    }
    if style.dim {
        attrs.push((Value::from("dim"), Value::from(true)));
    }
    if style.italic {
        attrs.push((Value::from("italic"), Value::from(true)));
    }
    if style.underline {
        attrs.push((Value::from("underline"), Value::from(true)));
    }
    if style.reverse {
        attrs.push((Value::from("reverse"), Value::from(true)));
    }
    if style.blink {
        attrs.push((Value::from("blink"), Value::from(true)));
    }
    Value::Map(attrs)
}

/// Run-length-encodes a row into `[grapheme, style_id?, repeat?]` entries,
/// omitting `style_id` when it equals the previous cell's (starting from
/// the implicit default, 0) and omitting `repeat` when it's 1.
fn encode_row(cells: &[Cell]) -> Value {
    let mut entries = Vec::new();
    let mut last_style: StyleId = DEFAULT_STYLE;
    let mut i = 0;
    while i < cells.len() {
        let run_text = &cells[i].text;
        let run_style = cells[i].style;
        let mut repeat = 1usize;
        while i + repeat < cells.len() && cells[i + repeat].text == *run_text && cells[i + repeat].style == run_style {
            repeat += 1;
        }

        let mut entry = vec![Value::from(run_text.as_str())];
        if run_style != last_style {
            entry.push(Value::from(run_style));
        }
        if repeat > 1 {
            if entry.len() == 1 {
                entry.push(Value::from(run_style));
            }
            entry.push(Value::from(repeat as u64));
        }
        entries.push(Value::Array(entry));

        last_style = run_style;
        i += repeat;
    }
    Value::Array(entries)
}

/// Builds the ordered sub-event list for one client's redraw notification,
/// registering any style this snapshot references for the first time in
/// `seen_styles`.
pub fn build(session_id: u64, snapshot: &ScreenSnapshot, seen_styles: &mut BTreeSet<StyleId>) -> Value {
    let mut events = Vec::new();

    if snapshot.is_full() {
        events.push(event(
            "resize",
            Value::Array(vec![Value::from(session_id), Value::from(snapshot.rows), Value::from(snapshot.cols)]),
        ));
    }

    for (&id, style) in &snapshot.styles {
        if id == DEFAULT_STYLE || seen_styles.contains(&id) {
            continue;
        }
        events.push(event("style", Value::Array(vec![Value::from(id), style_attrs(style)])));
        seen_styles.insert(id);
    }

    for (&row, cells) in &snapshot.row_cells {
        if cells.iter().all(|c| c.text.is_empty()) {
            continue;
        }
        events.push(event(
            "write",
            Value::Array(vec![Value::from(session_id), Value::from(row), Value::from(0u16), encode_row(cells)]),
        ));
    }

    events.push(event(
        "cursor_pos",
        Value::Array(vec![Value::from(session_id), Value::from(snapshot.cursor_row), Value::from(snapshot.cursor_col)]),
    ));
    events.push(event(
        "cursor_shape",
        Value::Array(vec![Value::from(session_id), Value::from(cursor_shape_code(snapshot.cursor_shape))]),
    ));
    events.push(event("flush", Value::Array(vec![])));

    Value::Array(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Extent;
    use std::collections::BTreeMap;

    fn row(cells: Vec<(&str, StyleId)>) -> Vec<Cell> {
        cells.into_iter().map(|(t, s)| Cell { text: t.to_string(), style: s, wide: false }).collect()
    }

    #[test]
    fn full_snapshot_starts_with_resize_and_ends_with_flush() {
        let mut row_cells = BTreeMap::new();
        row_cells.insert(0, row(vec![("a", 0), ("b", 0)]));
        let snapshot = ScreenSnapshot {
            rows: 1,
            cols: 2,
            cursor_row: 0,
            cursor_col: 0,
            cursor_shape: CursorShape::Block,
            extent: Extent::Full,
            row_cells,
            styles: BTreeMap::new(),
        };
        let mut seen = BTreeSet::new();
        let events = build(0, &snapshot, &mut seen);
        let Value::Array(events) = events else { panic!("expected array") };
        let Value::Array(first) = &events[0] else { panic!() };
        assert_eq!(first[0], Value::from("resize"));
        let Value::Array(last) = events.last().unwrap() else { panic!() };
        assert_eq!(last[0], Value::from("flush"));
    }

    #[test]
    fn repeated_style_is_only_defined_once() {
        let mut styles = BTreeMap::new();
        styles.insert(1, Style { bold: true, ..Default::default() });
        let mut row_cells = BTreeMap::new();
        row_cells.insert(0, row(vec![("x", 1)]));
        let snapshot = ScreenSnapshot {
            rows: 1,
            cols: 1,
            cursor_row: 0,
            cursor_col: 0,
            cursor_shape: CursorShape::Block,
            extent: Extent::Full,
            row_cells: row_cells.clone(),
            styles: styles.clone(),
        };
        let mut seen = BTreeSet::new();
        let first = build(0, &snapshot, &mut seen);
        assert!(matches!(&first, Value::Array(v) if v.iter().any(|e| matches!(e, Value::Array(a) if a[0] == Value::from("style")))));

        let second = build(0, &snapshot, &mut seen);
        assert!(matches!(&second, Value::Array(v) if !v.iter().any(|e| matches!(e, Value::Array(a) if a[0] == Value::from("style")))));
    }

    #[test]
    fn blank_rows_produce_no_write_event() {
        let mut row_cells = BTreeMap::new();
        row_cells.insert(0, row(vec![("", 0), ("", 0)]));
        let snapshot = ScreenSnapshot {
            rows: 1,
            cols: 2,
            cursor_row: 0,
            cursor_col: 0,
            cursor_shape: CursorShape::Block,
            extent: Extent::Incremental { rows: vec![0] },
            row_cells,
            styles: BTreeMap::new(),
        };
        let mut seen = BTreeSet::new();
        let events = build(0, &snapshot, &mut seen);
        let Value::Array(events) = events else { panic!() };
        assert!(!events.iter().any(|e| matches!(e, Value::Array(a) if a[0] == Value::from("write"))));
    }

    #[test]
    fn run_length_encoding_merges_identical_adjacent_cells() {
        let cells = row(vec![("a", 0), ("a", 0), ("a", 0), ("b", 0)]);
        let encoded = encode_row(&cells);
        let Value::Array(entries) = encoded else { panic!() };
        assert_eq!(entries.len(), 2);
    }
}
