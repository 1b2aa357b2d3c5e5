//! Row production for one worksheet.
//!
//! Rows are produced strictly in final order, each from its template row and
//! (inside a repeat band) the current item of every region in the band. The
//! producer never looks back, which is what lets streaming output work with
//! forward-only collections.

use super::ProgressSink;
use super::context::{Collections, Globals, ItemCursor, Scope, is_integral, value_cell};
use super::fragments::FragmentContext;
use super::sink::{OutCell, OutRow, OutValue, RowSink};
use super::styles::StyleBook;
use crate::address::{CellRef, MAX_COL, MAX_ROW, RangeRef};
use crate::blueprint::{CellContent, CellSpec, FormulaKind, RowSpec, SheetSpec, StaticValue};
use crate::config::SizeMismatchPolicy;
use crate::error::{Result, TemplateError};
use crate::formula::{Locks, map_references};
use crate::position::{ItemContext, PositionMap, RowInfo, WorkbookLayout};
use serde_json::Value;
use std::fmt::Write as _;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Elements a `<drawing>` element must precede.
const AFTER_DRAWING: &[&str] = &[
    "legacyDrawing",
    "legacyDrawingHF",
    "drawingHF",
    "picture",
    "oleObjects",
    "controls",
    "webPublishItems",
    "tableParts",
    "extLst",
];

/// Row counter feeding the progress callback.
pub struct Progress<'p> {
    sink: Option<&'p dyn ProgressSink>,
    planned: u64,
    written: u64,
    interval: u64,
    streaming: bool,
    next_report: u64,
}

impl<'p> Progress<'p> {
    pub fn new(sink: Option<&'p dyn ProgressSink>, planned: u64, interval: usize, streaming: bool) -> Self {
        let interval = interval.max(1) as u64;
        Self {
            sink,
            planned,
            written: 0,
            interval,
            streaming,
            next_report: interval,
        }
    }

    fn row_done(&mut self) {
        self.written += 1;
        if self.streaming && self.written >= self.next_report {
            self.next_report += self.interval;
            self.report();
        }
    }

    fn report(&self) {
        if let Some(sink) = self.sink {
            sink.report(self.written, self.planned);
        }
    }

    /// Report the final count once row production is over.
    pub fn finish(&self) {
        if !self.streaming || self.written % self.interval != 0 {
            self.report();
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

/// Shared, per-rendering inputs of the producer.
pub struct RenderInputs<'r, 'd> {
    pub layout: &'r WorkbookLayout,
    pub collections: &'r Collections<'d>,
    pub globals: &'r Globals<'d>,
    pub size_mismatch: SizeMismatchPolicy,
    pub preserve_layout: bool,
    pub cancel: Option<&'r CancellationToken>,
}

struct RegionCursor<'d> {
    cursor: ItemCursor<'d>,
    planned: usize,
    short: bool,
}

struct BandState<'d> {
    band: usize,
    cursors: Vec<RegionCursor<'d>>,
}

pub struct RowProducer<'s, 'r, 'd> {
    spec: &'r SheetSpec,
    map: &'r PositionMap,
    inputs: &'r RenderInputs<'r, 'd>,
    styles: &'s mut StyleBook,
}

impl<'s, 'r, 'd> RowProducer<'s, 'r, 'd> {
    pub fn new(
        spec: &'r SheetSpec,
        map: &'r PositionMap,
        inputs: &'r RenderInputs<'r, 'd>,
        styles: &'s mut StyleBook,
    ) -> Self {
        Self {
            spec,
            map,
            inputs,
            styles,
        }
    }

    /// Produce every row of the sheet into `sink`.
    pub fn run(&mut self, sink: &mut dyn RowSink, progress: &mut Progress<'_>) -> Result<u64> {
        let total = self.map.total_rows();
        if total > MAX_ROW + 1 {
            return Err(TemplateError::template(format!(
                "rendered sheet needs {total} rows, more than the sheet limit"
            ))
            .in_sheet(&self.spec.name));
        }
        let mut band: Option<BandState<'d>> = None;
        let mut produced = 0u64;
        for final_row in 0..total {
            if self.inputs.cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(TemplateError::Cancelled);
            }
            let Some(info) = self.map.row_info(final_row) else {
                continue;
            };
            let row = match info {
                RowInfo::Static(template_row) => {
                    if let Some(state) = band.take() {
                        self.finish_band(state)?;
                    }
                    self.static_row(final_row, template_row)?
                }
                RowInfo::Repeat {
                    band: band_idx,
                    item_index,
                    template_row_offset,
                } => {
                    if band.as_ref().is_some_and(|s| s.band != band_idx)
                        && let Some(state) = band.take()
                    {
                        self.finish_band(state)?;
                    }
                    let state = band.get_or_insert_with(|| self.start_band(band_idx));
                    self.band_row(final_row, state, item_index, template_row_offset)?
                }
            };
            sink.push_row(row)?;
            produced += 1;
            progress.row_done();
        }
        if let Some(state) = band.take() {
            self.finish_band(state)?;
        }
        debug!(sheet = %self.spec.name, rows = produced, "sheet rows produced");
        Ok(produced)
    }

    fn start_band(&self, band_idx: usize) -> BandState<'d> {
        let band = &self.map.bands()[band_idx];
        let cursors = band
            .regions
            .iter()
            .map(|entry| RegionCursor {
                cursor: self
                    .inputs
                    .collections
                    .cursor(&self.spec.regions[entry.region].collection),
                planned: entry.items,
                short: false,
            })
            .collect();
        BandState {
            band: band_idx,
            cursors,
        }
    }

    /// Detect collections that hold more items than were planned.
    fn finish_band(&self, mut state: BandState<'d>) -> Result<()> {
        let band = &self.map.bands()[state.band];
        for (entry, rc) in band.regions.iter().zip(state.cursors.iter_mut()) {
            if rc.planned == 0 || rc.short {
                continue;
            }
            let surplus = rc.cursor.surplus(rc.planned);
            if surplus == 0 {
                continue;
            }
            let collection = &self.spec.regions[entry.region].collection;
            match self.inputs.size_mismatch {
                SizeMismatchPolicy::Error => {
                    return Err(TemplateError::CollectionSizeMismatch {
                        collection: collection.clone(),
                        expected: rc.planned,
                        actual: rc.planned + surplus,
                    });
                }
                SizeMismatchPolicy::Reconcile => warn!(
                    sheet = %self.spec.name,
                    collection = %collection,
                    planned = rc.planned,
                    dropped = surplus,
                    "collection yielded more items than planned; extra items dropped"
                ),
            }
        }
        Ok(())
    }

    fn short_collection(&self, rc: &mut RegionCursor<'d>, collection: &str) -> Result<()> {
        if rc.short {
            return Ok(());
        }
        rc.short = true;
        match self.inputs.size_mismatch {
            SizeMismatchPolicy::Error => Err(TemplateError::CollectionSizeMismatch {
                collection: collection.to_string(),
                expected: rc.planned,
                actual: rc.cursor.seen(),
            }),
            SizeMismatchPolicy::Reconcile => {
                warn!(
                    sheet = %self.spec.name,
                    collection = %collection,
                    planned = rc.planned,
                    yielded = rc.cursor.seen(),
                    "collection ended early; remaining rows padded blank"
                );
                Ok(())
            }
        }
    }

    fn band_row(
        &mut self,
        final_row: u32,
        state: &mut BandState<'d>,
        item: usize,
        offset: u32,
    ) -> Result<OutRow> {
        let spec = self.spec;
        let map = self.map;
        let globals = self.inputs.globals;
        let band = &map.bands()[state.band];
        let template_row = band.rows.start + offset;
        let row_spec = spec.row(template_row);
        let item_ctx = ItemContext {
            band: Some((state.band, item)),
            strip: None,
        };
        let mut cells = Vec::new();

        for (entry, rc) in band.regions.iter().zip(state.cursors.iter_mut()) {
            let region = &spec.regions[entry.region];
            let in_region = |c: &&CellSpec| entry.cols.contains(c.col);
            if item < entry.items {
                let Some(row_spec) = row_spec else {
                    continue;
                };
                if rc.cursor.item(item).is_none() {
                    self.short_collection(rc, &region.collection)?;
                    cells.extend(row_spec.cells.iter().filter(in_region).map(padding));
                    continue;
                }
                let Some(value) = rc.cursor.item(item) else {
                    continue;
                };
                let scope = globals.scope().with_item(&region.variable, value);
                for cell in row_spec.cells.iter().filter(in_region) {
                    cells.push(self.render_cell(cell, template_row, final_row, cell.col, scope, item_ctx)?);
                }
            } else if entry.items == 0
                && let Some(empty) = region.empty_range
            {
                let rel = item as u32 * band.height() + offset;
                if rel >= empty.height() {
                    continue;
                }
                let source_row = empty.start.row + rel;
                let Some(source) = spec.row(source_row) else {
                    continue;
                };
                for cell in source.cells.iter().filter(|c| empty.start.col <= c.col && c.col <= empty.end.col) {
                    let col = entry.cols.start + (cell.col - empty.start.col);
                    cells.push(self.render_cell(
                        cell,
                        source_row,
                        final_row,
                        col,
                        globals.scope(),
                        ItemContext::default(),
                    )?);
                }
            }
        }

        if item == 0
            && let Some(row_spec) = row_spec
        {
            for cell in &row_spec.cells {
                if band.region_at_col(cell.col).is_some() || spec.is_suppressed(template_row, cell.col) {
                    continue;
                }
                cells.push(self.render_cell(cell, template_row, final_row, cell.col, globals.scope(), item_ctx)?);
            }
        }
        Ok(self.out_row(final_row, row_spec, cells))
    }

    fn static_row(&mut self, final_row: u32, template_row: u32) -> Result<OutRow> {
        let spec = self.spec;
        let map = self.map;
        let globals = self.inputs.globals;
        let row_spec = spec.row(template_row);
        let strip_idx = map
            .strips()
            .iter()
            .position(|s| s.rows.contains(template_row));
        let mut cells = Vec::new();

        let Some(strip_idx) = strip_idx else {
            if let Some(row_spec) = row_spec {
                for cell in &row_spec.cells {
                    if spec.is_suppressed(template_row, cell.col) {
                        continue;
                    }
                    cells.push(self.render_cell(
                        cell,
                        template_row,
                        final_row,
                        cell.col,
                        globals.scope(),
                        ItemContext::default(),
                    )?);
                }
            }
            return Ok(self.out_row(final_row, row_spec, cells));
        };

        let strip = &map.strips()[strip_idx];
        if let Some(row_spec) = row_spec {
            for cell in &row_spec.cells {
                if spec.is_suppressed(template_row, cell.col) {
                    continue;
                }
                let Some((pos, entry)) = strip.region_at_col(cell.col) else {
                    if let Some(col) = strip.outside_col(cell.col) {
                        cells.push(self.render_cell(
                            cell,
                            template_row,
                            final_row,
                            col,
                            globals.scope(),
                            ItemContext::default(),
                        )?);
                    }
                    continue;
                };
                let region = &spec.regions[entry.region];
                let items = self.inputs.collections.materialized(&region.collection).cloned();
                for k in 0..entry.items {
                    let Some(col) = entry.col_for_item(k, cell.col - entry.cols.start) else {
                        continue;
                    };
                    let ctx = ItemContext {
                        band: None,
                        strip: Some((strip_idx, pos, k)),
                    };
                    match items.as_ref().and_then(|v| v.get(k)) {
                        Some(value) => {
                            let scope = globals.scope().with_item(&region.variable, value);
                            cells.push(self.render_cell(cell, template_row, final_row, col, scope, ctx)?);
                        }
                        None => cells.push(OutCell {
                            col,
                            ..padding(cell)
                        }),
                    }
                }
            }
        }

        for entry in &strip.regions {
            let region = &spec.regions[entry.region];
            let Some(empty) = region.empty_range.filter(|_| entry.items == 0) else {
                continue;
            };
            let rel = template_row - strip.rows.start;
            if rel >= empty.height() {
                continue;
            }
            let source_row = empty.start.row + rel;
            let Some(source) = spec.row(source_row) else {
                continue;
            };
            for cell in source.cells.iter().filter(|c| empty.start.col <= c.col && c.col <= empty.end.col) {
                let col = entry.final_start + (cell.col - empty.start.col);
                cells.push(self.render_cell(
                    cell,
                    source_row,
                    final_row,
                    col,
                    globals.scope(),
                    ItemContext::default(),
                )?);
            }
        }
        Ok(self.out_row(final_row, row_spec, cells))
    }

    fn out_row(&self, index: u32, spec: Option<&RowSpec>, mut cells: Vec<OutCell>) -> OutRow {
        cells.sort_by_key(|c| c.col);
        cells.dedup_by_key(|c| c.col);
        let preserve = self.inputs.preserve_layout;
        OutRow {
            index,
            height: spec.and_then(|s| s.height).filter(|_| preserve),
            hidden: preserve && spec.is_some_and(|s| s.hidden),
            style: spec.and_then(|s| s.style),
            cells,
        }
    }

    fn render_cell(
        &mut self,
        cell: &CellSpec,
        template_row: u32,
        final_row: u32,
        final_col: u32,
        scope: Scope<'_>,
        ctx: ItemContext,
    ) -> Result<OutCell> {
        let at = || CellRef::new(final_row, final_col.min(MAX_COL)).a1();
        if final_col > MAX_COL {
            return Err(TemplateError::template_at(
                "rendered cell is beyond the last sheet column",
                &self.spec.name,
                at(),
            ));
        }
        let mut style = cell.style;
        let value = match &cell.content {
            CellContent::Static(StaticValue::Formula { text, kind }) => {
                let mapper = self.inputs.layout.mapper(&self.spec.name, ctx);
                let mapped = map_references(text, &mapper, Locks::Respect)
                    .map_err(|e| e.at(&self.spec.name, &at(), text))?;
                let array = match kind {
                    FormulaKind::Normal => None,
                    FormulaKind::Array { range } => Some(shift_range(
                        range,
                        final_row as i64 - template_row as i64,
                        final_col as i64 - cell.col as i64,
                    )),
                };
                OutValue::Formula {
                    text: mapped,
                    array,
                }
            }
            CellContent::Static(value) => static_value(value),
            CellContent::VariableRef(path) => {
                let value = scope.lookup(path);
                if let Some(number @ Value::Number(_)) = value.as_deref() {
                    style = self.styles.numeric_style(cell.style, is_integral(number));
                }
                value_cell(value.as_deref())
            }
            CellContent::SizeMarker(collection) => OutValue::Text(scope.size_of(collection).to_string()),
            CellContent::Template(parts) => OutValue::Text(scope.render_parts(parts)),
            CellContent::ImageMarker(_) | CellContent::RepeatMarker => OutValue::Blank,
        };
        Ok(OutCell {
            col: final_col,
            style,
            value,
        })
    }
}

fn padding(cell: &CellSpec) -> OutCell {
    OutCell {
        col: cell.col,
        style: cell.style,
        value: OutValue::Blank,
    }
}

fn static_value(value: &StaticValue) -> OutValue {
    match value {
        StaticValue::Blank => OutValue::Blank,
        StaticValue::Number(n) => OutValue::Number(n.clone()),
        StaticValue::SharedString(i) => OutValue::SharedString(*i),
        StaticValue::Text(t) => OutValue::Text(t.clone()),
        StaticValue::Bool(b) => OutValue::Bool(*b),
        StaticValue::Error(e) => OutValue::Error(e.clone()),
        StaticValue::Date(d) => OutValue::Date(d.clone()),
        StaticValue::Formula { text, .. } => OutValue::Formula {
            text: text.clone(),
            array: None,
        },
    }
}

fn shift_range(range: &RangeRef, rows: i64, cols: i64) -> RangeRef {
    let shift = |v: u32, d: i64| (v as i64 + d).max(0) as u32;
    RangeRef::new(
        CellRef::new(shift(range.start.row, rows), shift(range.start.col, cols)),
        CellRef::new(shift(range.end.row, rows), shift(range.end.col, cols)),
    )
}

/// Worksheet XML around `sheetData`.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetShell {
    pub head: String,
    pub tail: String,
}

impl SheetShell {
    /// Render every fragment of the sheet and split the document at the rows.
    /// `drawing` is a `<drawing>` element to add when the sheet has none.
    pub fn build(ctx: &FragmentContext<'_>, drawing: Option<&str>) -> Result<Self> {
        let spec = ctx.spec;
        let mut head = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n");
        head.push_str(&spec.root_tag);
        let mut tail = String::new();
        let mut after_rows = false;
        let mut drawing = drawing;
        for fragment in &spec.fragments {
            if fragment.name == "sheetData" {
                head.push_str("<sheetData>");
                tail.push_str("</sheetData>");
                after_rows = true;
                continue;
            }
            if after_rows && AFTER_DRAWING.contains(&fragment.name.as_str()) {
                if let Some(element) = drawing.take() {
                    tail.push_str(element);
                }
            }
            if let Some(xml) = ctx.render(fragment)? {
                if after_rows {
                    tail.push_str(&xml);
                } else {
                    head.push_str(&xml);
                }
            }
        }
        if let Some(element) = drawing {
            tail.push_str(element);
        }
        let _ = write!(tail, "</{}>", root_name(&spec.root_tag));
        Ok(Self { head, tail })
    }
}

fn root_name(root_tag: &str) -> &str {
    root_tag
        .trim_start_matches('<')
        .split(|c: char| c.is_whitespace() || c == '>' || c == '/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("worksheet")
}
