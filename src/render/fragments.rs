//! Worksheet children outside `sheetData`, rewritten for the final layout.

use super::context::Scope;
use crate::address::{CellRef, RangeRef, Span};
use crate::analyzer::markers::contains_marker;
use crate::blueprint::{Direction, SheetFragment, SheetSpec};
use crate::error::{Result, TemplateError};
use crate::formula::{Locks, Role, map_references};
use crate::position::{ItemContext, PositionMap, WorkbookLayout};
use crate::xml::{Action, attr, local_name, transform, with_attrs};
use once_cell::sync::Lazy;
use quick_xml::events::{BytesText, Event};
use regex::Regex;
use std::collections::BTreeSet;
use std::fmt::Write as _;

static COUNT_ATTR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"count="\d+""#).expect("valid count regex"));

pub struct FragmentContext<'a> {
    pub spec: &'a SheetSpec,
    pub map: &'a PositionMap,
    pub layout: &'a WorkbookLayout,
    pub scope: Scope<'a>,
}

impl FragmentContext<'_> {
    /// Rewrite one fragment; `None` drops it from the output.
    pub fn render(&self, fragment: &SheetFragment) -> Result<Option<String>> {
        match fragment.name.as_str() {
            "dimension" => Ok(Some(format!(
                "<dimension ref=\"{}\"/>",
                self.extent().a1()
            ))),
            "mergeCells" => Ok(self.merge_cells()),
            "conditionalFormatting" => self.conditional_formatting(fragment),
            "dataValidations" => self.data_validations(fragment),
            "hyperlinks" => self.hyperlinks(fragment),
            "autoFilter" => self.auto_filter(fragment),
            "headerFooter" if contains_marker(&fragment.xml) => {
                self.scope.substitute_xml(&fragment.xml).map(Some)
            }
            _ => Ok(Some(fragment.xml.clone())),
        }
    }

    /// Used range of the rendered sheet.
    pub fn extent(&self) -> RangeRef {
        let last_row = self.map.total_rows().saturating_sub(1);
        let last_template_col = self.spec.last_col.unwrap_or(0);
        let mut last_col = last_template_col;
        for strip in self.map.strips() {
            for region in &strip.regions {
                if region.rendered > 0 {
                    last_col = last_col.max(region.final_start + region.rendered - 1);
                }
            }
            if strip.region_at_col(last_template_col).is_none()
                && let Some(col) = strip.outside_col(last_template_col)
            {
                last_col = last_col.max(col);
            }
        }
        RangeRef::new(CellRef::new(0, 0), CellRef::new(last_row, last_col))
    }

    /// Final area covered by a template range, growing with expanded blocks.
    pub fn map_area(&self, range: &RangeRef) -> Option<RangeRef> {
        map_area(self.map, range)
    }

    fn merge_cells(&self) -> Option<String> {
        let mut merges: BTreeSet<RangeRef> = BTreeSet::new();
        for merge in &self.spec.merges {
            if self.spec.suppressed.iter().any(|s| contains(s, merge)) {
                continue;
            }
            merges.extend(self.replicate(merge));
        }
        merges.extend(self.empty_range_merges());
        merges.retain(|m| m.start != m.end);
        if merges.is_empty() {
            return None;
        }
        let mut xml = format!("<mergeCells count=\"{}\">", merges.len());
        for merge in &merges {
            let _ = write!(xml, "<mergeCell ref=\"{}\"/>", merge.a1());
        }
        xml.push_str("</mergeCells>");
        Some(xml)
    }

    /// Copies of a template merge: one per item inside a repeat block, a
    /// single moved copy elsewhere.
    fn replicate(&self, merge: &RangeRef) -> Vec<RangeRef> {
        let map = self.map;
        if let Some((band_idx, band)) = map.band_for_row(merge.start.row)
            && band.rows.contains(merge.end.row)
        {
            if let Some(region) = band
                .regions
                .iter()
                .find(|r| r.cols.contains(merge.start.col) && r.cols.contains(merge.end.col))
            {
                return (0..region.items)
                    .filter_map(|k| {
                        let start = map.final_row_for_item(band_idx, k, merge.start.row)?;
                        let end = map.final_row_for_item(band_idx, k, merge.end.row)?;
                        Some(RangeRef::new(
                            CellRef::new(start, merge.start.col),
                            CellRef::new(end, merge.end.col),
                        ))
                    })
                    .collect();
            }
        }
        if let Some(strip) = map.strip_for_row(merge.start.row)
            && strip.rows.contains(merge.end.row)
            && let Some((_, region)) = strip.region_at_col(merge.start.col)
            && region.cols.contains(merge.end.col)
        {
            let (Some(top), Some(bottom)) =
                (map.final_row(merge.start.row), map.final_row(merge.end.row))
            else {
                return Vec::new();
            };
            let start_off = merge.start.col - region.cols.start;
            let end_off = merge.end.col - region.cols.start;
            return (0..region.items)
                .filter_map(|k| {
                    Some(RangeRef::new(
                        CellRef::new(top, region.col_for_item(k, start_off)?),
                        CellRef::new(bottom, region.col_for_item(k, end_off)?),
                    ))
                })
                .collect();
        }
        self.map_area(merge).into_iter().collect()
    }

    /// Merges of `emptyRange` blocks, placed where the empty collection's
    /// region renders them.
    fn empty_range_merges(&self) -> Vec<RangeRef> {
        let mut out = Vec::new();
        for (idx, region) in self.spec.regions.iter().enumerate() {
            let Some(empty) = region.empty_range else {
                continue;
            };
            let Some((row0, col0)) = self.empty_origin(idx) else {
                continue;
            };
            for merge in self.spec.merges.iter().filter(|m| contains(&empty, m)) {
                out.push(RangeRef::new(
                    CellRef::new(
                        row0 + merge.start.row - empty.start.row,
                        col0 + merge.start.col - empty.start.col,
                    ),
                    CellRef::new(
                        row0 + merge.end.row - empty.start.row,
                        col0 + merge.end.col - empty.start.col,
                    ),
                ));
            }
        }
        out
    }

    /// Final top-left cell of the empty block of region `idx`, when that
    /// region renders with no items.
    fn empty_origin(&self, idx: usize) -> Option<(u32, u32)> {
        let region = &self.spec.regions[idx];
        match region.direction {
            Direction::Down => {
                let band = self
                    .map
                    .bands()
                    .iter()
                    .find(|b| b.regions.iter().any(|r| r.region == idx))?;
                let entry = band.regions.iter().find(|r| r.region == idx)?;
                (entry.items == 0 && entry.has_empty_range)
                    .then_some((band.final_start, entry.cols.start))
            }
            Direction::Right => {
                let strip = self
                    .map
                    .strips()
                    .iter()
                    .find(|s| s.regions.iter().any(|r| r.region == idx))?;
                let entry = strip.regions.iter().find(|r| r.region == idx)?;
                let row = self.map.final_row(strip.rows.start)?;
                (entry.items == 0 && entry.has_empty_range).then_some((row, entry.final_start))
            }
        }
    }

    fn map_sqref(&self, sqref: &str) -> Option<String> {
        let ranges = RangeRef::parse_list(sqref)?;
        let mapped: Vec<String> = ranges
            .iter()
            .filter_map(|r| self.map_area(r))
            .map(|r| r.a1())
            .collect();
        (!mapped.is_empty()).then(|| mapped.join(" "))
    }

    fn map_formula(&self, formula: &str, anchor: &str) -> Result<String> {
        let mapper = self.layout.mapper(&self.spec.name, ItemContext::default());
        map_references(formula, &mapper, Locks::Respect)
            .map_err(|e| e.at(&self.spec.name, anchor, formula))
    }

    /// Rewrite `sqref` attributes of `element` children and the formulas
    /// nested in them. Elements whose area disappears are dropped.
    fn rewrite_sqref_blocks(&self, fragment: &SheetFragment, element: &str) -> Result<String> {
        let mut skip_depth = 0usize;
        let mut in_formula = false;
        let mut anchor = String::new();
        transform(&self.spec.part, &fragment.xml, |event| {
            if skip_depth > 0 {
                match event {
                    Event::Start(_) => skip_depth += 1,
                    Event::End(_) => skip_depth -= 1,
                    _ => {}
                }
                return Ok(Action::Skip);
            }
            Ok(match event {
                Event::Start(e) | Event::Empty(e) if local_name(e) == element => {
                    let sqref = attr(e, b"sqref").unwrap_or_default();
                    match self.map_sqref(&sqref) {
                        Some(mapped) => {
                            anchor = sqref;
                            let elem = with_attrs(e, &[("sqref", mapped.as_str())]);
                            Action::Replace(vec![if matches!(event, Event::Start(_)) {
                                Event::Start(elem)
                            } else {
                                Event::Empty(elem)
                            }])
                        }
                        None => {
                            if matches!(event, Event::Start(_)) {
                                skip_depth = 1;
                            }
                            Action::Skip
                        }
                    }
                }
                Event::Start(e) if is_formula_element(&local_name(e)) => {
                    in_formula = true;
                    Action::Keep
                }
                Event::End(_) if in_formula => {
                    in_formula = false;
                    Action::Keep
                }
                Event::Text(t) if in_formula => {
                    let text = t.unescape().map_err(|e| TemplateError::xml(&self.spec.part, e))?;
                    let mapped = self.map_formula(&text, &anchor)?;
                    Action::Replace(vec![Event::Text(BytesText::new(&mapped).into_owned())])
                }
                _ => Action::Keep,
            })
        })
    }

    fn conditional_formatting(&self, fragment: &SheetFragment) -> Result<Option<String>> {
        let xml = self.rewrite_sqref_blocks(fragment, "conditionalFormatting")?;
        Ok((!xml.trim().is_empty()).then_some(xml))
    }

    fn data_validations(&self, fragment: &SheetFragment) -> Result<Option<String>> {
        let xml = self.rewrite_sqref_blocks(fragment, "dataValidation")?;
        let count = xml.matches("<dataValidation ").count() + xml.matches("<dataValidation>").count();
        if count == 0 {
            return Ok(None);
        }
        Ok(Some(
            COUNT_ATTR_RE
                .replace(&xml, format!("count=\"{count}\"").as_str())
                .into_owned(),
        ))
    }

    fn hyperlinks(&self, fragment: &SheetFragment) -> Result<Option<String>> {
        let mut kept = 0usize;
        let xml = transform(&self.spec.part, &fragment.xml, |event| {
            Ok(match event {
                Event::Empty(e) if local_name(e) == "hyperlink" => {
                    let mapped = attr(e, b"ref")
                        .and_then(|r| RangeRef::parse(&r))
                        .and_then(|r| self.map_area(&r));
                    match mapped {
                        Some(range) => {
                            kept += 1;
                            Action::Replace(vec![Event::Empty(with_attrs(
                                e,
                                &[("ref", range.a1().as_str())],
                            ))])
                        }
                        None => Action::Skip,
                    }
                }
                _ => Action::Keep,
            })
        })?;
        Ok((kept > 0).then_some(xml))
    }

    fn auto_filter(&self, fragment: &SheetFragment) -> Result<Option<String>> {
        let mut dropped = false;
        let xml = transform(&self.spec.part, &fragment.xml, |event| {
            Ok(match event {
                Event::Start(e) | Event::Empty(e) if local_name(e) == "autoFilter" => {
                    match attr(e, b"ref")
                        .and_then(|r| RangeRef::parse(&r))
                        .and_then(|r| self.map_area(&r))
                    {
                        Some(range) => {
                            let elem = with_attrs(e, &[("ref", range.a1().as_str())]);
                            Action::Replace(vec![if matches!(event, Event::Start(_)) {
                                Event::Start(elem)
                            } else {
                                Event::Empty(elem)
                            }])
                        }
                        None => {
                            dropped = true;
                            Action::Keep
                        }
                    }
                }
                _ => Action::Keep,
            })
        })?;
        Ok((!dropped).then_some(xml))
    }
}

fn is_formula_element(name: &str) -> bool {
    matches!(name, "formula" | "formula1" | "formula2")
}

fn contains(outer: &RangeRef, inner: &RangeRef) -> bool {
    outer.contains(inner.start.row, inner.start.col) && outer.contains(inner.end.row, inner.end.col)
}

/// Final area covered by a template range: rows and columns grow with every
/// expanded block the range spans and shrink with removed ones.
pub fn map_area(map: &PositionMap, range: &RangeRef) -> Option<RangeRef> {
    let rows = map.final_span(Span::new(range.start.row, range.end.row))?;
    let start_col = map.final_col(Some(range.start.row), range.start.col, Role::Start)?;
    let end_col = map.final_col(Some(range.start.row), range.end.col, Role::End)?;
    (start_col <= end_col).then(|| {
        RangeRef::new(
            CellRef::new(rows.start, start_col),
            CellRef::new(rows.end, end_col),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::{CollectionSizes, RepeatRegionSpec, Requirements};
    use crate::data::MapDataSource;
    use crate::render::context::Globals;

    fn region(collection: &str, range: &str, direction: Direction) -> RepeatRegionSpec {
        let range = RangeRef::parse(range).unwrap();
        RepeatRegionSpec {
            collection: collection.into(),
            variable: "e".into(),
            range,
            direction,
            empty_range: None,
            marker: range.start,
        }
    }

    fn spec(regions: Vec<RepeatRegionSpec>, merges: &[&str]) -> SheetSpec {
        SheetSpec {
            name: "Sheet1".into(),
            part: "xl/worksheets/sheet1.xml".into(),
            root_tag: "<worksheet>".into(),
            fragments: Vec::new(),
            rows: Vec::new(),
            regions,
            images: Vec::new(),
            merges: merges.iter().map(|m| RangeRef::parse(m).unwrap()).collect(),
            drawing_rel: None,
            suppressed: Vec::new(),
            last_row: Some(5),
            last_col: Some(3),
        }
    }

    fn with_context<R>(spec: &SheetSpec, items: usize, f: impl FnOnce(&FragmentContext) -> R) -> R {
        let mut sizes = CollectionSizes::new();
        sizes.insert("rows".into(), items);
        let map = PositionMap::calculate(&spec.regions, &sizes, 6).unwrap();
        let mut layout = WorkbookLayout::new();
        layout.insert("Sheet1", map.clone());
        let data = MapDataSource::new().with_value("title", "Q1");
        let globals = Globals::resolve(&data, &Requirements::default(), &sizes);
        let ctx = FragmentContext {
            spec,
            map: &map,
            layout: &layout,
            scope: globals.scope(),
        };
        f(&ctx)
    }

    #[test]
    fn merges_are_replicated_per_item() {
        let spec = spec(
            vec![region("rows", "A3:C3", Direction::Down)],
            &["A1:C1", "B3:C3", "A5:B5"],
        );
        let xml = with_context(&spec, 3, |ctx| ctx.merge_cells()).unwrap();
        assert_eq!(
            xml,
            concat!(
                r#"<mergeCells count="5">"#,
                r#"<mergeCell ref="A1:C1"/>"#,
                r#"<mergeCell ref="B3:C3"/>"#,
                r#"<mergeCell ref="B4:C4"/>"#,
                r#"<mergeCell ref="B5:C5"/>"#,
                r#"<mergeCell ref="A7:B7"/>"#,
                "</mergeCells>"
            )
        );
    }

    #[test]
    fn conditional_formatting_covers_every_copy() {
        let spec = spec(vec![region("rows", "A3:C3", Direction::Down)], &[]);
        let fragment = SheetFragment {
            name: "conditionalFormatting".into(),
            xml: r#"<conditionalFormatting sqref="C3"><cfRule type="expression" priority="1"><formula>$C3&gt;C$5</formula></cfRule></conditionalFormatting>"#.into(),
        };
        let xml = with_context(&spec, 4, |ctx| ctx.render(&fragment))
            .unwrap()
            .unwrap();
        assert!(xml.contains(r#"sqref="C3:C6""#), "{xml}");
        assert!(xml.contains("<formula>$C3&gt;C$5</formula>"), "{xml}");
    }

    #[test]
    fn regions_with_no_items_remove_their_validations() {
        let spec = spec(vec![region("rows", "A3:C3", Direction::Down)], &[]);
        let fragment = SheetFragment {
            name: "dataValidations".into(),
            xml: concat!(
                r#"<dataValidations count="2">"#,
                r#"<dataValidation type="list" sqref="B3"><formula1>"a,b"</formula1></dataValidation>"#,
                r#"<dataValidation type="whole" sqref="A5"><formula1>1</formula1></dataValidation>"#,
                "</dataValidations>"
            )
            .into(),
        };
        let xml = with_context(&spec, 0, |ctx| ctx.render(&fragment))
            .unwrap()
            .unwrap();
        assert!(xml.starts_with(r#"<dataValidations count="1">"#), "{xml}");
        assert!(xml.contains(r#"sqref="A4""#), "{xml}");
        assert!(!xml.contains("list"));
    }

    #[test]
    fn dimension_and_header_follow_the_layout() {
        let spec = spec(vec![region("rows", "B2:C2", Direction::Right)], &[]);
        with_context(&spec, 3, |ctx| {
            assert_eq!(ctx.extent().a1(), "A1:H6");
            let header = SheetFragment {
                name: "headerFooter".into(),
                xml: "<headerFooter><oddHeader>&amp;C${title}</oddHeader></headerFooter>".into(),
            };
            assert_eq!(
                ctx.render(&header).unwrap().unwrap(),
                "<headerFooter><oddHeader>&amp;CQ1</oddHeader></headerFooter>"
            );
        });
    }
}
