//! Position calculation: where each template row and column lands once the
//! repeat regions of a sheet have been expanded.
//!
//! DOWN regions sharing template rows form a *band* and expand together; a
//! band's final height is the tallest of its regions. RIGHT regions sharing
//! rows form a *strip* and shift the columns to their right on those rows.

use crate::address::{MAX_COL, MAX_ROW, Span};
use crate::blueprint::{CollectionSizes, Direction, RepeatRegionSpec};
use crate::error::{Result, TemplateError};
use crate::formula::{FormulaError, ReferenceMapper, Role};
use serde::Serialize;
use std::collections::HashMap;

/// Classification of one final row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RowInfo {
    /// Unexpanded template row.
    Static(u32),
    /// Row `template_row_offset` of the band's template block, rendered for
    /// item `item_index`.
    Repeat {
        band: usize,
        item_index: usize,
        template_row_offset: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BandRegion {
    /// Index into the sheet's region list.
    pub region: usize,
    pub cols: Span,
    pub items: usize,
    /// Rows this region renders (`items * height`, or the empty block height).
    pub rendered: u32,
    pub has_empty_range: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Band {
    pub rows: Span,
    pub regions: Vec<BandRegion>,
    pub final_start: u32,
    pub final_height: u32,
}

impl Band {
    pub fn height(&self) -> u32 {
        self.rows.size()
    }

    /// Region whose columns contain `col`.
    pub fn region_at_col(&self, col: u32) -> Option<&BandRegion> {
        self.regions.iter().find(|r| r.cols.contains(col))
    }

    fn row_for_item(&self, item_index: usize, offset: u32) -> Option<u32> {
        let rel = item_index as u64 * self.height() as u64 + offset as u64;
        (rel < self.final_height as u64).then(|| self.final_start + rel as u32)
    }

    fn last_copy(&self, offset: u32) -> Option<u32> {
        if offset >= self.final_height {
            return None;
        }
        let k_max = (self.final_height - 1 - offset) / self.height();
        Some(self.final_start + k_max * self.height() + offset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StripRegion {
    pub region: usize,
    pub cols: Span,
    pub items: usize,
    pub rendered: u32,
    pub final_start: u32,
    pub has_empty_range: bool,
}

impl StripRegion {
    fn width(&self) -> u32 {
        self.cols.size()
    }

    pub fn col_for_item(&self, item_index: usize, offset: u32) -> Option<u32> {
        let rel = item_index as u64 * self.width() as u64 + offset as u64;
        (rel < self.rendered as u64).then(|| self.final_start + rel as u32)
    }

    fn last_copy(&self, offset: u32) -> Option<u32> {
        if offset >= self.rendered {
            return None;
        }
        let k_max = (self.rendered - 1 - offset) / self.width();
        Some(self.final_start + k_max * self.width() + offset)
    }
}

/// RIGHT regions sharing one row span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Strip {
    pub rows: Span,
    /// Sorted by template column.
    pub regions: Vec<StripRegion>,
}

impl Strip {
    fn shift_before(&self, col: u32) -> i64 {
        self.regions
            .iter()
            .filter(|r| r.cols.end < col)
            .map(|r| r.rendered as i64 - r.width() as i64)
            .sum()
    }

    pub fn region_at_col(&self, col: u32) -> Option<(usize, &StripRegion)> {
        self.regions
            .iter()
            .enumerate()
            .find(|(_, r)| r.cols.contains(col))
    }

    /// Final column of a template column outside every region of the strip.
    pub fn outside_col(&self, col: u32) -> Option<u32> {
        let shifted = col as i64 + self.shift_before(col);
        (shifted >= 0).then_some(shifted as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
enum SegmentKind {
    Static { template_start: u32 },
    Band(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
struct Segment {
    final_start: u32,
    len: u32,
    template: Span,
    kind: SegmentKind,
}

/// Per-sheet mapping from template coordinates to final coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PositionMap {
    template_rows: u32,
    segments: Vec<Segment>,
    bands: Vec<Band>,
    strips: Vec<Strip>,
    total_rows: u32,
}

impl PositionMap {
    /// Build the map for one sheet. `template_rows` is the template's row
    /// count (last used row + 1); it is widened to cover every region.
    pub fn calculate(
        regions: &[RepeatRegionSpec],
        sizes: &CollectionSizes,
        template_rows: u32,
    ) -> Result<Self> {
        validate_regions(regions)?;
        let size_of = |r: &RepeatRegionSpec| sizes.get(&r.collection).copied().unwrap_or(0);

        let mut bands: Vec<Band> = Vec::new();
        let mut strips: Vec<Strip> = Vec::new();
        let mut template_rows = template_rows;

        let mut order: Vec<usize> = (0..regions.len()).collect();
        order.sort_by_key(|&i| (regions[i].start_row(), regions[i].start_col()));

        for idx in order {
            let region = &regions[idx];
            template_rows = template_rows.max(region.end_row() + 1);
            if let Some(empty) = region.empty_range {
                template_rows = template_rows.max(empty.end.row + 1);
            }
            let rows = Span::new(region.start_row(), region.end_row());
            let cols = Span::new(region.start_col(), region.end_col());
            let items = size_of(region);
            let rendered = region.rendered_len(items);
            match region.direction {
                Direction::Down => {
                    let entry = BandRegion {
                        region: idx,
                        cols,
                        items,
                        rendered,
                        has_empty_range: region.empty_range.is_some(),
                    };
                    match bands.iter_mut().find(|b| b.rows == rows) {
                        Some(band) => band.regions.push(entry),
                        None => bands.push(Band {
                            rows,
                            regions: vec![entry],
                            final_start: 0,
                            final_height: 0,
                        }),
                    }
                }
                Direction::Right => {
                    let entry = StripRegion {
                        region: idx,
                        cols,
                        items,
                        rendered,
                        final_start: 0,
                        has_empty_range: region.empty_range.is_some(),
                    };
                    match strips.iter_mut().find(|s| s.rows == rows) {
                        Some(strip) => strip.regions.push(entry),
                        None => strips.push(Strip {
                            rows,
                            regions: vec![entry],
                        }),
                    }
                }
            }
        }

        for band in &mut bands {
            band.regions.sort_by_key(|r| r.cols.start);
            band.final_height = band.regions.iter().map(|r| r.rendered).max().unwrap_or(0);
        }
        bands.sort_by_key(|b| b.rows.start);

        for strip in &mut strips {
            strip.regions.sort_by_key(|r| r.cols.start);
            let mut shift: i64 = 0;
            for region in &mut strip.regions {
                let start = (region.cols.start as i64 + shift).max(0);
                if start + region.rendered as i64 > MAX_COL as i64 + 1 {
                    return Err(TemplateError::template(format!(
                        "repeat region {} expands past the last sheet column",
                        regions[region.region].collection
                    )));
                }
                region.final_start = start as u32;
                shift += region.rendered as i64 - region.cols.size() as i64;
            }
        }

        let advance = |cursor: u32, len: u32| -> Result<u32> {
            cursor
                .checked_add(len)
                .filter(|&total| total <= MAX_ROW + 1)
                .ok_or_else(|| {
                    TemplateError::template(format!(
                        "rendered sheet exceeds {} rows",
                        MAX_ROW as u64 + 1
                    ))
                })
        };
        let mut segments = Vec::new();
        let mut template_cursor = 0u32;
        let mut final_cursor = 0u32;
        for (index, band) in bands.iter_mut().enumerate() {
            if band.rows.start > template_cursor {
                let len = band.rows.start - template_cursor;
                segments.push(Segment {
                    final_start: final_cursor,
                    len,
                    template: Span::new(template_cursor, band.rows.start - 1),
                    kind: SegmentKind::Static {
                        template_start: template_cursor,
                    },
                });
                final_cursor = advance(final_cursor, len)?;
            }
            band.final_start = final_cursor;
            segments.push(Segment {
                final_start: final_cursor,
                len: band.final_height,
                template: band.rows,
                kind: SegmentKind::Band(index),
            });
            final_cursor = advance(final_cursor, band.final_height)?;
            template_cursor = band.rows.end + 1;
        }
        if template_rows > template_cursor {
            let len = template_rows - template_cursor;
            segments.push(Segment {
                final_start: final_cursor,
                len,
                template: Span::new(template_cursor, template_rows - 1),
                kind: SegmentKind::Static {
                    template_start: template_cursor,
                },
            });
            final_cursor = advance(final_cursor, len)?;
        }

        Ok(Self {
            template_rows,
            segments,
            bands,
            strips,
            total_rows: final_cursor,
        })
    }

    /// Identity map for a sheet without repeat regions.
    pub fn identity(template_rows: u32) -> Self {
        // no regions cannot fail validation
        Self::calculate(&[], &CollectionSizes::new(), template_rows).unwrap_or(Self {
            template_rows,
            segments: Vec::new(),
            bands: Vec::new(),
            strips: Vec::new(),
            total_rows: template_rows,
        })
    }

    pub fn total_rows(&self) -> u32 {
        self.total_rows
    }

    pub fn template_rows(&self) -> u32 {
        self.template_rows
    }

    pub fn bands(&self) -> &[Band] {
        &self.bands
    }

    pub fn strips(&self) -> &[Strip] {
        &self.strips
    }

    pub fn band(&self, index: usize) -> Option<&Band> {
        self.bands.get(index)
    }

    pub fn strip_for_row(&self, template_row: u32) -> Option<&Strip> {
        self.strips.iter().find(|s| s.rows.contains(template_row))
    }

    pub fn band_for_row(&self, template_row: u32) -> Option<(usize, &Band)> {
        self.bands
            .iter()
            .enumerate()
            .find(|(_, b)| b.rows.contains(template_row))
    }

    /// Classify a final row. Total over `0..total_rows()`.
    pub fn row_info(&self, final_row: u32) -> Option<RowInfo> {
        if final_row >= self.total_rows {
            return None;
        }
        let idx = self
            .segments
            .partition_point(|s| s.final_start + s.len <= final_row);
        let segment = self.segments.get(idx)?;
        let offset = final_row - segment.final_start;
        Some(match segment.kind {
            SegmentKind::Static { template_start } => RowInfo::Static(template_start + offset),
            SegmentKind::Band(band) => {
                let height = self.bands[band].height();
                RowInfo::Repeat {
                    band,
                    item_index: (offset / height) as usize,
                    template_row_offset: offset % height,
                }
            }
        })
    }

    /// Iterate row classifications in final order.
    pub fn rows(&self) -> impl Iterator<Item = (u32, RowInfo)> + '_ {
        (0..self.total_rows).filter_map(move |r| self.row_info(r).map(|info| (r, info)))
    }

    fn segment_for_template(&self, template_row: u32) -> Option<&Segment> {
        let idx = self
            .segments
            .partition_point(|s| s.template.end < template_row);
        self.segments
            .get(idx)
            .filter(|s| s.template.contains(template_row))
    }

    /// Final row of a template row's first copy. `None` when removed.
    pub fn final_row(&self, template_row: u32) -> Option<u32> {
        match self.segment_for_template(template_row) {
            Some(segment) => match segment.kind {
                SegmentKind::Static { template_start } => {
                    Some(segment.final_start + template_row - template_start)
                }
                SegmentKind::Band(band) => {
                    let band = &self.bands[band];
                    band.row_for_item(0, template_row - band.rows.start)
                }
            },
            // past the template: shift by the whole expansion
            None => {
                let shifted =
                    template_row as i64 + self.total_rows as i64 - self.template_rows as i64;
                (shifted >= 0).then_some(shifted as u32)
            }
        }
    }

    /// Final row of a template row's copy for one band item.
    pub fn final_row_for_item(&self, band: usize, item_index: usize, template_row: u32) -> Option<u32> {
        let band = self.bands.get(band)?;
        if !band.rows.contains(template_row) {
            return self.final_row(template_row);
        }
        band.row_for_item(item_index, template_row - band.rows.start)
    }

    /// Final row of a template row's last copy. `None` when removed.
    pub fn last_final_row(&self, template_row: u32) -> Option<u32> {
        match self.segment_for_template(template_row) {
            Some(Segment {
                kind: SegmentKind::Band(band),
                ..
            }) => {
                let band = &self.bands[*band];
                band.last_copy(template_row - band.rows.start)
            }
            _ => self.final_row(template_row),
        }
    }

    /// First surviving final row at or after a template row.
    pub fn first_at_or_after(&self, template_row: u32) -> Option<u32> {
        if let Some(row) = self.final_row(template_row) {
            return Some(row);
        }
        let segment = self.segment_for_template(template_row)?;
        Some(segment.final_start + segment.len)
    }

    /// Last surviving final row at or before a template row, including every
    /// copy of a repeated row.
    pub fn last_at_or_before(&self, template_row: u32) -> Option<u32> {
        if let Some(row) = self.last_final_row(template_row) {
            return Some(row);
        }
        let segment = self.segment_for_template(template_row)?;
        // rows of the band that did render come before
        let end = segment.final_start + segment.len;
        end.checked_sub(1)
    }

    /// Final extent of a template row span, used for range expansion.
    pub fn final_span(&self, rows: Span) -> Option<Span> {
        let start = self.first_at_or_after(rows.start)?;
        let end = self.last_at_or_before(rows.end)?;
        (start <= end).then(|| Span::new(start, end))
    }

    /// Final column of a template column on a template row.
    pub fn final_col(&self, template_row: Option<u32>, col: u32, role: Role) -> Option<u32> {
        let Some(strip) = template_row.and_then(|r| self.strip_for_row(r)) else {
            return Some(col);
        };
        match strip.region_at_col(col) {
            None => strip.outside_col(col),
            Some((_, region)) => {
                let offset = col - region.cols.start;
                match role {
                    Role::End => region.last_copy(offset).or_else(|| {
                        // removed: previous surviving column
                        (region.final_start + region.rendered).checked_sub(1)
                    }),
                    Role::Start => region
                        .col_for_item(0, offset)
                        .or(Some(region.final_start + region.rendered)),
                    Role::Single => region.col_for_item(0, offset),
                }
            }
        }
    }

    /// Final `(row, col)` of a template cell's first copy.
    pub fn final_position(&self, template_row: u32, template_col: u32) -> Option<(u32, u32)> {
        Some((
            self.final_row(template_row)?,
            self.final_col(Some(template_row), template_col, Role::Single)?,
        ))
    }
}

/// Reject region layouts the calculator cannot place.
pub fn validate_regions(regions: &[RepeatRegionSpec]) -> Result<()> {
    for (i, a) in regions.iter().enumerate() {
        if let Some(empty) = a.empty_range {
            for b in regions {
                if empty.overlaps(&b.range) {
                    return Err(TemplateError::template(format!(
                        "empty range {} of region {} overlaps repeat range {}",
                        empty, a.range, b.range
                    )));
                }
            }
        }
        for b in regions.iter().skip(i + 1) {
            if a.range.overlaps(&b.range) {
                return Err(TemplateError::template(format!(
                    "repeat ranges {} ('{}') and {} ('{}') overlap",
                    a.range, a.collection, b.range, b.collection
                )));
            }
            if !a.range.rows_overlap(&b.range) {
                continue;
            }
            let same_rows =
                a.start_row() == b.start_row() && a.end_row() == b.end_row();
            match (a.direction, b.direction) {
                (Direction::Down, Direction::Down) | (Direction::Right, Direction::Right)
                    if !same_rows =>
                {
                    return Err(TemplateError::template(format!(
                        "side-by-side repeat ranges {} and {} must span the same rows",
                        a.range, b.range
                    )));
                }
                (Direction::Down, Direction::Right) | (Direction::Right, Direction::Down) => {
                    return Err(TemplateError::template(format!(
                        "repeat ranges {} and {} mix DOWN and RIGHT on shared rows",
                        a.range, b.range
                    )));
                }
                _ => {}
            }
        }
    }
    Ok(())
}

/// Item being rendered when a formula is adjusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ItemContext {
    /// `(band index, item index)` for formulas inside a DOWN block.
    pub band: Option<(usize, usize)>,
    /// `(strip index, region position within strip, item index)` for
    /// formulas inside a RIGHT block.
    pub strip: Option<(usize, usize, usize)>,
}

/// Position maps of every sheet of a workbook.
#[derive(Debug, Clone, Default)]
pub struct WorkbookLayout {
    maps: HashMap<String, PositionMap>,
}

impl WorkbookLayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, sheet: impl Into<String>, map: PositionMap) {
        self.maps.insert(sheet.into(), map);
    }

    pub fn get(&self, sheet: &str) -> Option<&PositionMap> {
        self.maps.get(sheet)
    }

    /// Mapper for formulas that live on `sheet`.
    pub fn mapper<'a>(&'a self, sheet: &'a str, context: ItemContext) -> SheetMapper<'a> {
        SheetMapper {
            layout: self,
            sheet,
            context,
        }
    }
}

/// Maps formula references through the owning sheet's position map (or the
/// referenced sheet's, for cross-sheet references).
pub struct SheetMapper<'a> {
    layout: &'a WorkbookLayout,
    sheet: &'a str,
    context: ItemContext,
}

impl SheetMapper<'_> {
    fn resolve(&self, sheet: Option<&str>) -> Result<(&PositionMap, bool), FormulaError> {
        let name = sheet.unwrap_or(self.sheet);
        let map = self
            .layout
            .maps
            .get(name)
            .or_else(|| {
                // sheet names compare case-insensitively in formulas
                self.layout
                    .maps
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v)
            })
            .ok_or_else(|| FormulaError::UnknownSheet(name.to_string()))?;
        Ok((map, sheet.is_none_or(|s| s.eq_ignore_ascii_case(self.sheet))))
    }
}

impl ReferenceMapper for SheetMapper<'_> {
    fn map_row(&self, sheet: Option<&str>, row: u32, role: Role) -> Result<Option<u32>, FormulaError> {
        let (map, same_sheet) = self.resolve(sheet)?;
        if same_sheet
            && let Some((band, item)) = self.context.band
            && map.band(band).is_some_and(|b| b.rows.contains(row))
        {
            return Ok(map.final_row_for_item(band, item, row));
        }
        Ok(match role {
            Role::Single => map.final_row(row),
            Role::Start => map.first_at_or_after(row),
            Role::End => map.last_at_or_before(row),
        })
    }

    fn map_col(
        &self,
        sheet: Option<&str>,
        row: Option<u32>,
        col: u32,
        role: Role,
    ) -> Result<Option<u32>, FormulaError> {
        let (map, same_sheet) = self.resolve(sheet)?;
        if same_sheet
            && let Some((strip_idx, region_pos, item)) = self.context.strip
            && let Some(strip) = map.strips().get(strip_idx)
            && row.is_some_and(|r| strip.rows.contains(r))
            && let Some(region) = strip.regions.get(region_pos)
            && region.cols.contains(col)
        {
            return Ok(region.col_for_item(item, col - region.cols.start));
        }
        Ok(map.final_col(row, col, role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{CellRef, RangeRef};
    use crate::formula::{Locks, map_references};
    use proptest::prelude::*;

    fn region(collection: &str, range: &str) -> RepeatRegionSpec {
        RepeatRegionSpec {
            collection: collection.into(),
            variable: collection.into(),
            range: RangeRef::parse(range).unwrap(),
            direction: Direction::Down,
            empty_range: None,
            marker: CellRef::new(0, 0),
        }
    }

    fn sizes(pairs: &[(&str, usize)]) -> CollectionSizes {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn single_region_expands_rows() {
        // header row 0, repeat row 2 (A3:C3), footer row 4
        let map = PositionMap::calculate(&[region("items", "A3:C3")], &sizes(&[("items", 3)]), 5)
            .unwrap();
        assert_eq!(map.total_rows(), 7);
        assert_eq!(map.row_info(0), Some(RowInfo::Static(0)));
        assert_eq!(map.row_info(1), Some(RowInfo::Static(1)));
        for (final_row, item) in [(2, 0), (3, 1), (4, 2)] {
            assert_eq!(
                map.row_info(final_row),
                Some(RowInfo::Repeat {
                    band: 0,
                    item_index: item,
                    template_row_offset: 0
                })
            );
        }
        assert_eq!(map.row_info(5), Some(RowInfo::Static(3)));
        assert_eq!(map.row_info(7), None);
        assert_eq!(map.final_position(4, 1), Some((6, 1)));
        assert_eq!(map.final_span(Span::new(2, 2)), Some(Span::new(2, 4)));
    }

    #[test]
    fn empty_collection_removes_block() {
        let map = PositionMap::calculate(&[region("items", "A2:C3")], &sizes(&[]), 5).unwrap();
        assert_eq!(map.total_rows(), 3);
        assert_eq!(map.final_row(1), None);
        assert_eq!(map.final_row(4), Some(2));
        assert_eq!(map.first_at_or_after(2), Some(1));
        assert_eq!(map.last_at_or_before(2), Some(0));
    }

    #[test]
    fn empty_range_substitutes_its_height() {
        let mut spec = region("items", "A2:C2");
        spec.empty_range = Some(RangeRef::parse("A8:C9").unwrap());
        let map = PositionMap::calculate(&[spec], &sizes(&[("items", 0)]), 10).unwrap();
        assert_eq!(map.total_rows(), 11);
        assert_eq!(map.bands()[0].final_height, 2);
    }

    #[test]
    fn side_by_side_regions_form_one_band() {
        let regions = [region("a", "A2:B2"), region("b", "D2:E2")];
        let map = PositionMap::calculate(&regions, &sizes(&[("a", 5), ("b", 4)]), 2).unwrap();
        assert_eq!(map.total_rows(), 6);
        assert_eq!(map.bands().len(), 1);
        let band = &map.bands()[0];
        assert_eq!(band.region_at_col(0).unwrap().items, 5);
        assert_eq!(band.region_at_col(4).unwrap().items, 4);
        assert_eq!(band.region_at_col(2), None);
    }

    #[test]
    fn mismatched_side_by_side_spans_are_rejected() {
        let regions = [region("a", "A2:B3"), region("b", "D2:E2")];
        assert!(PositionMap::calculate(&regions, &sizes(&[]), 3).is_err());
        let overlapping = [region("a", "A2:C2"), region("b", "C2:E2")];
        assert!(validate_regions(&overlapping).is_err());
    }

    #[test]
    fn right_regions_shift_columns_on_their_rows() {
        let mut spec = region("months", "B2:B2");
        spec.direction = Direction::Right;
        let map = PositionMap::calculate(&[spec], &sizes(&[("months", 3)]), 3).unwrap();
        assert_eq!(map.total_rows(), 3);
        assert_eq!(map.final_col(Some(1), 2, Role::Single), Some(4));
        assert_eq!(map.final_col(Some(0), 2, Role::Single), Some(2));
        assert_eq!(map.final_col(Some(1), 1, Role::End), Some(3));
    }

    #[test]
    fn sheet_mapper_uses_item_context_and_other_sheets() {
        let mut layout = WorkbookLayout::new();
        layout.insert(
            "Report",
            PositionMap::calculate(&[region("items", "A6:C6")], &sizes(&[("items", 3)]), 8)
                .unwrap(),
        );
        layout.insert(
            "Data",
            PositionMap::calculate(&[region("rows", "B3:B3")], &sizes(&[("rows", 4)]), 3).unwrap(),
        );

        let inside = layout.mapper(
            "Report",
            ItemContext {
                band: Some((0, 2)),
                strip: None,
            },
        );
        assert_eq!(
            map_references("A6*B6", &inside, Locks::Respect).unwrap(),
            "A8*B8"
        );

        let outside = layout.mapper("Report", ItemContext::default());
        assert_eq!(
            map_references("SUM(C6:C6)+Data!B3+SUM(Data!B3:B3)", &outside, Locks::Respect).unwrap(),
            "SUM(C6:C8)+Data!B3+SUM(Data!B3:B6)"
        );
        assert!(map_references("Missing!A1", &outside, Locks::Respect).is_err());
    }

    #[test]
    fn oversized_collections_are_rejected_not_overflowed() {
        let huge = sizes(&[("items", 5_000_000_000)]);
        assert!(PositionMap::calculate(&[region("items", "A2:A2")], &huge, 5).is_err());
        let just_over = sizes(&[("items", MAX_ROW as usize + 1)]);
        assert!(PositionMap::calculate(&[region("items", "A2:A2")], &just_over, 2).is_err());
        let fits = sizes(&[("items", MAX_ROW as usize)]);
        let map = PositionMap::calculate(&[region("items", "A2:A2")], &fits, 1).unwrap();
        assert_eq!(map.total_rows(), MAX_ROW + 1);

        let mut wide = region("months", "B2:B2");
        wide.direction = Direction::Right;
        let columns = sizes(&[("months", MAX_COL as usize + 1)]);
        assert!(PositionMap::calculate(&[wide], &columns, 3).is_err());
    }

    proptest! {
        #[test]
        fn total_rows_and_row_info_are_consistent(
            start in 0u32..20,
            height in 1u32..4,
            items in 0usize..12,
            trailing in 0u32..10,
        ) {
            let end = start + height - 1;
            let template_rows = end + 1 + trailing;
            let range = format!("A{}:C{}", start + 1, end + 1);
            let map = PositionMap::calculate(
                &[region("items", &range)],
                &sizes(&[("items", items)]),
                template_rows,
            ).unwrap();

            let expected = template_rows as i64 - height as i64 + items as i64 * height as i64;
            prop_assert_eq!(map.total_rows() as i64, expected);

            let mut repeat_rows = 0;
            for row in 0..map.total_rows() {
                match map.row_info(row) {
                    Some(RowInfo::Repeat { item_index, template_row_offset, .. }) => {
                        prop_assert!(item_index < items);
                        prop_assert!(template_row_offset < height);
                        prop_assert_eq!(
                            (row - start) as usize,
                            item_index * height as usize + template_row_offset as usize
                        );
                        repeat_rows += 1;
                    }
                    Some(RowInfo::Static(t)) => prop_assert!(t < start || t > end),
                    None => prop_assert!(false, "row {} unclassified", row),
                }
            }
            prop_assert_eq!(repeat_rows, items * height as usize);

            let again = PositionMap::calculate(
                &[region("items", &range)],
                &sizes(&[("items", items)]),
                template_rows,
            ).unwrap();
            prop_assert_eq!(map, again);
        }
    }
}
