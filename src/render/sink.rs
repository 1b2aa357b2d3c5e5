//! Rendered rows and where they go.
//!
//! [`MemorySheet`] keeps every row of a sheet until the sheet is finished;
//! [`StreamingSheetWriter`] pushes rows into the worksheet entry as soon as a
//! window of them is buffered. Both serialize rows with [`write_row`].

use crate::address::{CellRef, RangeRef, Span};
use crate::error::Result;
use crate::xml::{escape_text, escape_value_text};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::Write;

#[derive(Debug, Clone, PartialEq)]
pub enum OutValue {
    Blank,
    Number(String),
    SharedString(u32),
    Text(String),
    Bool(bool),
    Error(String),
    Date(String),
    Formula {
        text: String,
        array: Option<RangeRef>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutCell {
    pub col: u32,
    pub style: u32,
    pub value: OutValue,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutRow {
    pub index: u32,
    pub height: Option<f64>,
    pub hidden: bool,
    pub style: Option<u32>,
    /// Sorted by column.
    pub cells: Vec<OutCell>,
}

impl OutRow {
    fn is_empty(&self) -> bool {
        self.height.is_none()
            && !self.hidden
            && self.style.is_none()
            && self.cells.iter().all(|c| !c.is_written())
    }
}

impl OutCell {
    fn is_written(&self) -> bool {
        !(matches!(self.value, OutValue::Blank) && self.style == 0)
    }
}

/// Serialize one `<row>` element. Rows without content or formatting are
/// skipped entirely.
pub fn write_row(buf: &mut String, row: &OutRow) {
    if row.is_empty() {
        return;
    }
    let _ = write!(buf, "<row r=\"{}\"", row.index + 1);
    if let Some(style) = row.style {
        let _ = write!(buf, " s=\"{style}\" customFormat=\"1\"");
    }
    if let Some(height) = row.height {
        let _ = write!(buf, " ht=\"{height}\" customHeight=\"1\"");
    }
    if row.hidden {
        buf.push_str(" hidden=\"1\"");
    }
    buf.push('>');
    for cell in row.cells.iter().filter(|c| c.is_written()) {
        write_cell(buf, row.index, cell);
    }
    buf.push_str("</row>");
}

fn write_cell(buf: &mut String, row: u32, cell: &OutCell) {
    let reference = CellRef::new(row, cell.col).a1();
    let _ = write!(buf, "<c r=\"{reference}\"");
    if cell.style != 0 {
        let _ = write!(buf, " s=\"{}\"", cell.style);
    }
    match &cell.value {
        OutValue::Blank => buf.push_str("/>"),
        OutValue::Number(n) => {
            let _ = write!(buf, "><v>{n}</v></c>");
        }
        OutValue::SharedString(index) => {
            let _ = write!(buf, " t=\"s\"><v>{index}</v></c>");
        }
        OutValue::Text(text) => {
            let _ = write!(
                buf,
                " t=\"inlineStr\"><is><t xml:space=\"preserve\">{}</t></is></c>",
                escape_value_text(text)
            );
        }
        OutValue::Bool(b) => {
            let _ = write!(buf, " t=\"b\"><v>{}</v></c>", u8::from(*b));
        }
        OutValue::Error(e) => {
            let _ = write!(buf, " t=\"e\"><v>{}</v></c>", escape_text(e));
        }
        OutValue::Date(d) => {
            let _ = write!(buf, " t=\"d\"><v>{}</v></c>", escape_text(d));
        }
        OutValue::Formula { text, array } => match array {
            Some(range) => {
                let _ = write!(
                    buf,
                    "><f t=\"array\" ref=\"{}\">{}</f></c>",
                    range.a1(),
                    escape_text(text)
                );
            }
            None => {
                let _ = write!(buf, "><f>{}</f></c>", escape_text(text));
            }
        },
    }
}

/// Whether a column's numeric values are whole numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberKind {
    Integer,
    Decimal,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColumnStats {
    pub numeric: u64,
    pub fractional: u64,
}

impl ColumnStats {
    pub fn observe(&mut self, value: &OutValue) {
        if let OutValue::Number(text) = value
            && let Ok(n) = text.parse::<f64>()
        {
            self.numeric += 1;
            if n.fract() != 0.0 {
                self.fractional += 1;
            }
        }
    }

    pub fn merge(&mut self, other: ColumnStats) {
        self.numeric += other.numeric;
        self.fractional += other.fractional;
    }

    pub fn number_kind(&self) -> Option<NumberKind> {
        match (self.numeric, self.fractional) {
            (0, _) => None,
            (_, 0) => Some(NumberKind::Integer),
            _ => Some(NumberKind::Decimal),
        }
    }
}

/// Receives the rows of one sheet in ascending order.
pub trait RowSink {
    fn push_row(&mut self, row: OutRow) -> Result<()>;

    /// Statistics of the numeric cells of `col` on `rows`.
    fn column_stats(&self, col: u32, rows: Span) -> ColumnStats;
}

/// Random-access sheet held entirely in memory.
#[derive(Debug, Default)]
pub struct MemorySheet {
    rows: BTreeMap<u32, OutRow>,
}

impl MemorySheet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row(&self, index: u32) -> Option<&OutRow> {
        self.rows.get(&index)
    }

    pub fn cell(&self, row: u32, col: u32) -> Option<&OutCell> {
        self.rows.get(&row)?.cells.iter().find(|c| c.col == col)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn write_rows(&self, out: &mut impl Write) -> Result<()> {
        let mut buf = String::with_capacity(4096);
        for row in self.rows.values() {
            write_row(&mut buf, row);
            if buf.len() > 64 * 1024 {
                out.write_all(buf.as_bytes())?;
                buf.clear();
            }
        }
        out.write_all(buf.as_bytes())?;
        Ok(())
    }
}

impl RowSink for MemorySheet {
    fn push_row(&mut self, row: OutRow) -> Result<()> {
        self.rows.insert(row.index, row);
        Ok(())
    }

    fn column_stats(&self, col: u32, rows: Span) -> ColumnStats {
        let mut stats = ColumnStats::default();
        for row in self.rows.range(rows.start..=rows.end).map(|(_, r)| r) {
            if let Some(cell) = row.cells.iter().find(|c| c.col == col) {
                stats.observe(&cell.value);
            }
        }
        stats
    }
}

/// Append-only writer flushing every `window` rows.
pub struct StreamingSheetWriter<'w, W: Write> {
    out: &'w mut W,
    buffer: String,
    buffered: usize,
    window: usize,
    /// Columns whose statistics must be gathered while writing.
    tracked: Vec<(u32, Span, ColumnStats)>,
    rows_written: u64,
}

impl<'w, W: Write> StreamingSheetWriter<'w, W> {
    pub fn new(out: &'w mut W, window: usize) -> Self {
        Self {
            out,
            buffer: String::with_capacity(window.max(1) * 256),
            buffered: 0,
            window: window.max(1),
            tracked: Vec::new(),
            rows_written: 0,
        }
    }

    pub fn track(&mut self, col: u32, rows: Span) {
        if !self.tracked.iter().any(|(c, r, _)| *c == col && *r == rows) {
            self.tracked.push((col, rows, ColumnStats::default()));
        }
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    fn flush_window(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.out.write_all(self.buffer.as_bytes())?;
            self.buffer.clear();
        }
        self.buffered = 0;
        Ok(())
    }

    /// Flush buffered rows; the writer must not be used afterwards.
    pub fn finish(mut self) -> Result<Vec<(u32, Span, ColumnStats)>> {
        self.flush_window()?;
        Ok(std::mem::take(&mut self.tracked))
    }
}

impl<W: Write> RowSink for StreamingSheetWriter<'_, W> {
    fn push_row(&mut self, row: OutRow) -> Result<()> {
        for (col, rows, stats) in &mut self.tracked {
            if rows.contains(row.index)
                && let Some(cell) = row.cells.iter().find(|c| c.col == *col)
            {
                stats.observe(&cell.value);
            }
        }
        write_row(&mut self.buffer, &row);
        self.buffered += 1;
        self.rows_written += 1;
        if self.buffered >= self.window {
            self.flush_window()?;
        }
        Ok(())
    }

    fn column_stats(&self, col: u32, rows: Span) -> ColumnStats {
        self.tracked
            .iter()
            .filter(|(c, r, _)| *c == col && *r == rows)
            .map(|(_, _, s)| *s)
            .next()
            .unwrap_or_default()
    }
}
