//! A1-style cell and range addressing.
//!
//! Every coordinate in the public API is 0-based: row 0 is spreadsheet row 1
//! and column 0 is column `A`. Text conversion happens only at the edges
//! (markers, sheet XML, formulas).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Highest 0-based row index an xlsx sheet can hold.
pub const MAX_ROW: u32 = 1_048_575;
/// Highest 0-based column index an xlsx sheet can hold.
pub const MAX_COL: u32 = 16_383;

/// Convert a 0-based column index to its letters (`0 -> A`, `27 -> AB`).
pub fn column_name(col: u32) -> String {
    let mut column = col + 1;
    let mut name = String::new();
    while column > 0 {
        let rem = ((column - 1) % 26) as u8;
        name.insert(0, (b'A' + rem) as char);
        column = (column - 1) / 26;
    }
    name
}

/// Convert column letters to a 0-based index. Case-insensitive.
pub fn column_index(letters: &str) -> Option<u32> {
    if letters.is_empty() || letters.len() > 3 {
        return None;
    }
    let mut value: u32 = 0;
    for ch in letters.chars() {
        if !ch.is_ascii_alphabetic() {
            return None;
        }
        value = value * 26 + (ch.to_ascii_uppercase() as u32 - 'A' as u32 + 1);
    }
    let index = value - 1;
    (index <= MAX_COL).then_some(index)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellRef {
    pub row: u32,
    pub col: u32,
}

impl CellRef {
    pub fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }

    /// Parse `B3`, `$B$3` or `b3`; lock markers are ignored.
    pub fn parse(text: &str) -> Option<Self> {
        let endpoint = Endpoint::parse(text.trim())?;
        Some(Self {
            row: endpoint.row?,
            col: endpoint.col?,
        })
    }

    pub fn a1(&self) -> String {
        format!("{}{}", column_name(self.col), self.row + 1)
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.a1())
    }
}

/// Inclusive rectangular range, normalised so `start <= end` on both axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RangeRef {
    pub start: CellRef,
    pub end: CellRef,
}

impl RangeRef {
    pub fn new(start: CellRef, end: CellRef) -> Self {
        Self {
            start: CellRef::new(start.row.min(end.row), start.col.min(end.col)),
            end: CellRef::new(start.row.max(end.row), start.col.max(end.col)),
        }
    }

    pub fn single(cell: CellRef) -> Self {
        Self {
            start: cell,
            end: cell,
        }
    }

    /// Parse `A3:C5` or a single cell `A3`.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        match text.split_once(':') {
            Some((a, b)) => Some(Self::new(CellRef::parse(a)?, CellRef::parse(b)?)),
            None => CellRef::parse(text).map(Self::single),
        }
    }

    /// Parse a space separated `sqref` list such as `A1:B2 D4`.
    pub fn parse_list(text: &str) -> Option<Vec<Self>> {
        text.split_whitespace().map(Self::parse).collect()
    }

    pub fn height(&self) -> u32 {
        self.end.row - self.start.row + 1
    }

    pub fn width(&self) -> u32 {
        self.end.col - self.start.col + 1
    }

    pub fn contains(&self, row: u32, col: u32) -> bool {
        self.contains_row(row) && col >= self.start.col && col <= self.end.col
    }

    pub fn contains_row(&self, row: u32) -> bool {
        row >= self.start.row && row <= self.end.row
    }

    pub fn rows_overlap(&self, other: &RangeRef) -> bool {
        self.start.row <= other.end.row && other.start.row <= self.end.row
    }

    pub fn cols_overlap(&self, other: &RangeRef) -> bool {
        self.start.col <= other.end.col && other.start.col <= self.end.col
    }

    pub fn overlaps(&self, other: &RangeRef) -> bool {
        self.rows_overlap(other) && self.cols_overlap(other)
    }

    pub fn a1(&self) -> String {
        if self.start == self.end {
            self.start.a1()
        } else {
            format!("{}:{}", self.start.a1(), self.end.a1())
        }
    }
}

impl fmt::Display for RangeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.a1())
    }
}

/// Inclusive span of 0-based rows (or columns, for RIGHT expansion).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub fn new(start: u32, end: u32) -> Self {
        Self {
            start: start.min(end),
            end: start.max(end),
        }
    }

    pub fn size(&self) -> u32 {
        self.end - self.start + 1
    }

    pub fn contains(&self, value: u32) -> bool {
        value >= self.start && value <= self.end
    }
}

/// One side of a reference as written in a formula: either coordinate may be
/// absent (`A:A`, `3:3`) and each carries its own `$` lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub col: Option<u32>,
    pub row: Option<u32>,
    pub col_locked: bool,
    pub row_locked: bool,
}

impl Endpoint {
    pub fn cell(row: u32, col: u32) -> Self {
        Self {
            col: Some(col),
            row: Some(row),
            col_locked: false,
            row_locked: false,
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        let bytes = text.as_bytes();
        let len = bytes.len();
        let mut i = 0;

        let col_locked = i < len && bytes[i] == b'$';
        if col_locked {
            i += 1;
        }
        let letters_start = i;
        while i < len && bytes[i].is_ascii_alphabetic() {
            i += 1;
        }
        let letters = &text[letters_start..i];

        let mut row_locked = false;
        if i < len && bytes[i] == b'$' {
            row_locked = true;
            i += 1;
        }
        let digits_start = i;
        while i < len && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if i != len {
            return None;
        }
        let digits = &text[digits_start..i];

        let col = if letters.is_empty() {
            None
        } else {
            Some(column_index(letters)?)
        };
        let row = if digits.is_empty() {
            None
        } else {
            let one_based: u32 = digits.parse().ok()?;
            if one_based == 0 || one_based > MAX_ROW + 1 {
                return None;
            }
            Some(one_based - 1)
        };

        match (col, row) {
            (None, None) => None,
            // `$3` alone: the leading lock belongs to the row
            (None, Some(_)) => Some(Self {
                col: None,
                row,
                col_locked: false,
                row_locked: col_locked || row_locked,
            }),
            (Some(_), None) if row_locked => None,
            _ => Some(Self {
                col,
                row,
                col_locked: col_locked && col.is_some(),
                row_locked,
            }),
        }
    }

    pub fn format(&self) -> String {
        let mut out = String::new();
        if let Some(col) = self.col {
            if self.col_locked {
                out.push('$');
            }
            out.push_str(&column_name(col));
        }
        if let Some(row) = self.row {
            if self.row_locked {
                out.push('$');
            }
            out.push_str(&(row + 1).to_string());
        }
        out
    }
}

/// Wrap a sheet name for use inside a formula (`'My Sheet'!`).
pub fn sheet_prefix(sheet_name: &str) -> String {
    if sheet_name_needs_quoting(sheet_name) {
        let escaped = sheet_name.replace('\'', "''");
        format!("'{escaped}'!")
    } else {
        format!("{sheet_name}!")
    }
}

/// Undo formula quoting of a sheet name (`'It''s'` -> `It's`).
pub fn unquote_sheet_name(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(stripped) = trimmed.strip_prefix('\'')
        && let Some(inner) = stripped.strip_suffix('\'')
    {
        return inner.replace("''", "'");
    }
    trimmed.to_string()
}

fn sheet_name_needs_quoting(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    let bytes = name.as_bytes();
    if bytes[0].is_ascii_digit() {
        return true;
    }
    for &byte in bytes {
        match byte {
            b' ' | b'!' | b'"' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'(' | b')' | b'*' | b'+'
            | b',' | b'-' | b'.' | b'/' | b':' | b';' | b'<' | b'=' | b'>' | b'?' | b'@' | b'['
            | b'\\' | b']' | b'^' | b'`' | b'{' | b'|' | b'}' | b'~' => return true,
            _ => {}
        }
    }
    // Names that would otherwise parse as a cell reference
    if Endpoint::parse(name).is_some() {
        return true;
    }
    let upper = name.to_uppercase();
    matches!(
        upper.as_str(),
        "TRUE" | "FALSE" | "NULL" | "REF" | "DIV" | "NAME" | "NUM" | "VALUE" | "N/A"
    )
}
