//! Rewrites of the package parts that point into worksheets.
//!
//! Everything here runs after the layout is known: defined names, pivot
//! caches and tables, drawings, charts, tables, comments and document
//! properties are brought in line with the final cell positions.

use super::context::Scope;
use super::fragments::map_area;
use super::sink::{ColumnStats, NumberKind};
use crate::address::{CellRef, RangeRef, Span};
use crate::analyzer::Template;
use crate::analyzer::markers::contains_marker;
use crate::analyzer::package::{REL_CALC_CHAIN, REL_PIVOT_CACHE};
use crate::config::RenderConfig;
use crate::data::DocumentMetadata;
use crate::error::{Result, TemplateError};
use crate::formula::{Locks, Role, map_references};
use crate::position::{ItemContext, PositionMap, WorkbookLayout};
use crate::xml::{Action, attr, local_name, reader, transform, with_attrs};
use once_cell::sync::Lazy;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use regex::{Captures, Regex};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

pub const CALC_CHAIN_PART: &str = "xl/calcChain.xml";
pub const CORE_PART: &str = "docProps/core.xml";
pub const CT_CORE: &str = "application/vnd.openxmlformats-package.core-properties+xml";

static ANCHOR_BLOCK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<(?:\w+:)?(from|to)>(.*?)</(?:\w+:)?(?:from|to)>").expect("valid anchor regex")
});
static ANCHOR_ROW_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<((?:\w+:)?)row>(\d+)</").expect("valid row regex"));
static ANCHOR_COL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<((?:\w+:)?)col>(\d+)</").expect("valid col regex"));
static VML_CLIENT_DATA_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<x:ClientData\b.*?</x:ClientData>").expect("valid client data regex")
});
static VML_ROW_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<x:Row>\s*(\d+)\s*</x:Row>").expect("valid vml row regex"));
static VML_COL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<x:Column>\s*(\d+)\s*</x:Column>").expect("valid vml column regex"));
static VML_ANCHOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<x:Anchor>([^<]*)</x:Anchor>").expect("valid vml anchor regex"));

/// Elements `calcPr` must precede inside `<workbook>`.
const AFTER_CALC_PR: &[&str] = &[
    "oleSize",
    "customWorkbookViews",
    "pivotCaches",
    "smartTagPr",
    "smartTagTypes",
    "webPublishing",
    "fileRecoveryPr",
    "webPublishObjects",
    "extLst",
];

/// Core property elements, in the order they are added when missing.
const CORE_FIELDS: &[&str] = &[
    "dc:title",
    "dc:subject",
    "dc:creator",
    "cp:keywords",
    "dc:description",
    "cp:category",
];

pub struct PartContext<'a> {
    pub template: &'a Template,
    pub layout: &'a WorkbookLayout,
    pub scope: Scope<'a>,
    pub config: &'a RenderConfig,
    /// Part name -> name of the worksheet whose relationships point at it.
    pub owners: &'a HashMap<String, String>,
}

impl PartContext<'_> {
    pub fn owner_map(&self, part: &str) -> Option<(&str, &PositionMap)> {
        let sheet = self.owners.get(part)?;
        Some((sheet.as_str(), self.layout.get(sheet)?))
    }

    fn first_sheet(&self) -> &str {
        self.template
            .workbook()
            .sheets
            .first()
            .map(|s| s.name.as_str())
            .unwrap_or_default()
    }
}

/// Map every part a worksheet relates to back to that worksheet.
pub fn sheet_owners(template: &Template) -> Result<HashMap<String, String>> {
    let mut owners = HashMap::new();
    for sheet in &template.workbook().sheets {
        for rel in template.package().relationships(&sheet.part)? {
            if !rel.external {
                owners.insert(rel.target, sheet.name.clone());
            }
        }
    }
    Ok(owners)
}

// =============================================================================
// WORKBOOK
// =============================================================================

/// Defined names follow the layout and the workbook recalculates on open.
pub fn patch_workbook(ctx: &PartContext<'_>, part: &str, xml: &str) -> Result<String> {
    let sheets = &ctx.template.workbook().sheets;
    let mut depth = 0usize;
    let mut calc_pr_written = false;
    let mut defined_name: Option<(String, String)> = None;
    transform(part, xml, |event| {
        let calc_pr = || {
            Event::Empty(BytesStart::new("calcPr").with_attributes([("fullCalcOnLoad", "1")]))
        };
        Ok(match event {
            Event::Start(e) | Event::Empty(e) => {
                let is_start = matches!(event, Event::Start(_));
                let name = local_name(e);
                let child_depth = depth + 1;
                if is_start {
                    depth += 1;
                }
                if child_depth == 2 && name == "calcPr" {
                    calc_pr_written = true;
                    let elem = with_attrs(e, &[("fullCalcOnLoad", "1")]);
                    return Ok(Action::Replace(vec![if is_start {
                        Event::Start(elem)
                    } else {
                        Event::Empty(elem)
                    }]));
                }
                if child_depth == 2 && !calc_pr_written && AFTER_CALC_PR.contains(&name.as_str()) {
                    calc_pr_written = true;
                    return Ok(Action::Replace(vec![calc_pr(), event.clone().into_owned()]));
                }
                if name == "definedName" && is_start {
                    let scope_sheet = attr(e, b"localSheetId")
                        .and_then(|id| id.parse::<usize>().ok())
                        .and_then(|id| sheets.get(id))
                        .map(|s| s.name.clone())
                        .unwrap_or_else(|| ctx.first_sheet().to_string());
                    defined_name = Some((attr(e, b"name").unwrap_or_default(), scope_sheet));
                }
                Action::Keep
            }
            Event::Text(t) if defined_name.is_some() => {
                let Some((name, sheet)) = &defined_name else {
                    return Ok(Action::Keep);
                };
                let text = t.unescape().map_err(|e| TemplateError::xml(part, e))?;
                let mapper = ctx.layout.mapper(sheet, ItemContext::default());
                let mapped = map_references(&text, &mapper, Locks::Track)
                    .map_err(|e| e.at("workbook", name, &text))?;
                Action::Replace(vec![Event::Text(BytesText::new(&mapped).into_owned())])
            }
            Event::End(e) => {
                let closing_depth = depth;
                depth = depth.saturating_sub(1);
                if e.local_name().as_ref() == b"definedName" {
                    defined_name = None;
                }
                if closing_depth == 1 && !calc_pr_written {
                    calc_pr_written = true;
                    return Ok(Action::Replace(vec![calc_pr(), event.clone().into_owned()]));
                }
                Action::Keep
            }
            _ => Action::Keep,
        })
    })
}

// =============================================================================
// RELATIONSHIPS AND CONTENT TYPES
// =============================================================================

/// Append relationships and drop the calculation chain.
pub fn patch_relationships(part: &str, xml: &str, added: &[String]) -> Result<String> {
    let out = transform(part, xml, |event| {
        Ok(match event {
            Event::Empty(e) | Event::Start(e)
                if local_name(e) == "Relationship"
                    && attr(e, b"Type").is_some_and(|t| t.rsplit('/').next() == Some(REL_CALC_CHAIN)) =>
            {
                Action::Skip
            }
            _ => Action::Keep,
        })
    })?;
    Ok(if added.is_empty() {
        out
    } else {
        crate::xml::insert_before_root_end(&out, &added.concat())
    })
}

/// Content types after parts were added or removed.
pub fn patch_content_types(
    xml: &str,
    removed: &BTreeSet<String>,
    defaults: &BTreeSet<(String, String)>,
    overrides: &[(String, String)],
) -> Result<String> {
    let part = "[Content_Types].xml";
    let mut declared: BTreeSet<String> = BTreeSet::new();
    let mut depth = 0usize;
    transform(part, xml, |event| {
        Ok(match event {
            Event::Start(_) => {
                depth += 1;
                Action::Keep
            }
            Event::Empty(e) if local_name(e) == "Default" => {
                if let Some(ext) = attr(e, b"Extension") {
                    declared.insert(ext.to_ascii_lowercase());
                }
                Action::Keep
            }
            Event::Empty(e) if local_name(e) == "Override" => {
                let name = attr(e, b"PartName").unwrap_or_default();
                if removed.contains(name.trim_start_matches('/')) {
                    Action::Skip
                } else {
                    Action::Keep
                }
            }
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                if depth > 0 {
                    return Ok(Action::Keep);
                }
                let mut events = Vec::new();
                for (ext, content_type) in defaults {
                    if declared.insert(ext.to_ascii_lowercase()) {
                        events.push(Event::Empty(BytesStart::new("Default").with_attributes([
                            ("Extension", ext.as_str()),
                            ("ContentType", content_type.as_str()),
                        ])));
                    }
                }
                for (name, content_type) in overrides {
                    events.push(Event::Empty(BytesStart::new("Override").with_attributes([
                        ("PartName", name.as_str()),
                        ("ContentType", content_type.as_str()),
                    ])));
                }
                events.push(event.clone().into_owned());
                Action::Replace(events.into_iter().map(Event::into_owned).collect())
            }
            _ => Action::Keep,
        })
    })
}

// =============================================================================
// PIVOT TABLES
// =============================================================================

/// Source range of one pivot cache, in final coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PivotSource {
    pub sheet: String,
    pub range: RangeRef,
}

impl PivotSource {
    /// Data rows below the header.
    pub fn data_rows(&self) -> Option<Span> {
        (self.range.end.row > self.range.start.row)
            .then(|| Span::new(self.range.start.row + 1, self.range.end.row))
    }
}

#[derive(Debug, Default)]
pub struct PivotPlan {
    /// Cache definition part -> source.
    pub caches: HashMap<String, PivotSource>,
    /// Pivot table part -> cache definition part.
    pub tables: HashMap<String, String>,
}

impl PivotPlan {
    pub fn build(template: &Template, layout: &WorkbookLayout) -> Result<Self> {
        let mut plan = PivotPlan::default();
        let package = template.package();
        for (name, bytes) in package.iter() {
            if name.starts_with("xl/pivotCache/pivotCacheDefinition") && name.ends_with(".xml") {
                let xml = crate::xml::as_utf8(name, bytes)?;
                if let Some((sheet, range)) = worksheet_source(name, xml)? {
                    let Some(map) = layout.get(&sheet) else {
                        debug!(part = %name, sheet = %sheet, "pivot source sheet is not a worksheet");
                        continue;
                    };
                    if let Some(range) = map_area(map, &range) {
                        plan.caches.insert(name.to_string(), PivotSource { sheet, range });
                    }
                }
            } else if name.starts_with("xl/pivotTables/pivotTable") && name.ends_with(".xml") {
                if let Some(cache) = package
                    .relationships(name)?
                    .into_iter()
                    .find(|r| r.is(REL_PIVOT_CACHE))
                {
                    plan.tables.insert(name.to_string(), cache.target);
                }
            }
        }
        Ok(plan)
    }

    /// Columns whose values must be classified, per sheet.
    pub fn tracked_columns(&self, sheet: &str) -> Vec<(u32, Span)> {
        self.caches
            .values()
            .filter(|s| s.sheet == sheet)
            .filter_map(|s| s.data_rows().map(|rows| (s, rows)))
            .flat_map(|(s, rows)| (s.range.start.col..=s.range.end.col).map(move |c| (c, rows)))
            .collect()
    }
}

fn worksheet_source(part: &str, xml: &str) -> Result<Option<(String, RangeRef)>> {
    let mut reader = reader(xml);
    loop {
        match reader.read_event().map_err(|e| TemplateError::xml(part, e))? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"worksheetSource" => {
                let range = attr(&e, b"ref").and_then(|r| RangeRef::parse(&r));
                let sheet = attr(&e, b"sheet");
                return Ok(range.zip(sheet).map(|(r, s)| (s, r)));
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

/// Cache source follows the expanded data; the cache refreshes on open.
pub fn patch_pivot_cache(part: &str, xml: &str, source: Option<&PivotSource>) -> Result<String> {
    transform(part, xml, |event| {
        Ok(match event {
            Event::Start(e) if local_name(e) == "pivotCacheDefinition" => {
                Action::Replace(vec![Event::Start(with_attrs(e, &[("refreshOnLoad", "1")]))])
            }
            Event::Start(e) | Event::Empty(e) if local_name(e) == "worksheetSource" => {
                match source {
                    Some(source) => {
                        let elem = with_attrs(e, &[("ref", source.range.a1().as_str())]);
                        Action::Replace(vec![if matches!(event, Event::Start(_)) {
                            Event::Start(elem)
                        } else {
                            Event::Empty(elem)
                        }])
                    }
                    None => Action::Keep,
                }
            }
            _ => Action::Keep,
        })
    })
}

/// Numeric statistics per `(sheet, column)` of pivot source data.
pub type ColumnStatsBook = HashMap<(String, u32), ColumnStats>;

/// Pivot location moves with its sheet; data fields get number formats from
/// the rendered source columns; a table style is ensured.
pub fn patch_pivot_table(
    config: &RenderConfig,
    owner: Option<&PositionMap>,
    part: &str,
    xml: &str,
    source: Option<&PivotSource>,
    stats: &ColumnStatsBook,
) -> Result<String> {
    let mut depth = 0usize;
    let mut style_seen = false;
    let style_info = || {
        Event::Empty(
            BytesStart::new("pivotTableStyleInfo").with_attributes([
                ("name", config.pivot_style_name.as_str()),
                ("showRowHeaders", "1"),
                ("showColHeaders", "1"),
                ("showRowStripes", "0"),
                ("showColStripes", "0"),
                ("showLastColumn", "1"),
            ])
            .into_owned(),
        )
    };
    transform(part, xml, |event| {
        Ok(match event {
            Event::Start(e) | Event::Empty(e) => {
                let is_start = matches!(event, Event::Start(_));
                let name = local_name(e);
                let this_depth = depth + 1;
                if is_start {
                    depth += 1;
                }
                let wrap = |elem: BytesStart<'static>| {
                    if is_start {
                        Event::Start(elem)
                    } else {
                        Event::Empty(elem)
                    }
                };
                match name.as_str() {
                    "pivotTableStyleInfo" => {
                        style_seen = true;
                        Action::Keep
                    }
                    // pivotTableStyleInfo precedes these in the schema
                    "filters" | "rowHierarchiesUsage" | "colHierarchiesUsage" | "extLst"
                        if this_depth == 2 && !style_seen =>
                    {
                        style_seen = true;
                        Action::Replace(vec![style_info(), event.clone().into_owned()])
                    }
                    "location" => match (owner, attr(e, b"ref").and_then(|r| RangeRef::parse(&r))) {
                        (Some(map), Some(range)) => {
                            let moved = shift_to(map, &range);
                            Action::Replace(vec![wrap(with_attrs(e, &[("ref", moved.a1().as_str())]))])
                        }
                        _ => Action::Keep,
                    },
                    "dataField" => {
                        let format = source.zip(attr(e, b"fld").and_then(|f| f.parse::<u32>().ok())).and_then(
                            |(source, fld)| {
                                let col = source.range.start.col + fld;
                                stats
                                    .get(&(source.sheet.clone(), col))
                                    .and_then(ColumnStats::number_kind)
                            },
                        );
                        match format {
                            Some(kind) => {
                                let id = match kind {
                                    NumberKind::Integer => config.pivot_integer_format_id,
                                    NumberKind::Decimal => config.pivot_decimal_format_id,
                                }
                                .to_string();
                                Action::Replace(vec![wrap(with_attrs(e, &[("numFmtId", id.as_str())]))])
                            }
                            None => Action::Keep,
                        }
                    }
                    _ => Action::Keep,
                }
            }
            Event::End(_) => {
                let closing = depth;
                depth = depth.saturating_sub(1);
                if closing == 1 && !style_seen {
                    style_seen = true;
                    return Ok(Action::Replace(vec![style_info(), event.clone().into_owned()]));
                }
                Action::Keep
            }
            _ => Action::Keep,
        })
    })
}

/// Move a range so its top-left cell lands where the layout puts it, keeping
/// its size.
fn shift_to(map: &PositionMap, range: &RangeRef) -> RangeRef {
    let row = map
        .first_at_or_after(range.start.row)
        .unwrap_or(range.start.row);
    let col = map
        .final_col(Some(range.start.row), range.start.col, Role::Start)
        .unwrap_or(range.start.col);
    RangeRef::new(
        CellRef::new(row, col),
        CellRef::new(
            row + (range.end.row - range.start.row),
            col + (range.end.col - range.start.col),
        ),
    )
}

// =============================================================================
// DRAWINGS AND CHARTS
// =============================================================================

/// Shift anchors to the sheet's final layout, substitute text markers and
/// append new picture anchors.
pub fn patch_drawing(ctx: &PartContext<'_>, part: &str, xml: &str, appended: Option<&str>) -> Result<String> {
    let mut out = match ctx.owner_map(part) {
        Some((_, map)) => shift_anchors(xml, map),
        None => xml.to_string(),
    };
    if ctx.template.marked_parts().contains_key(part) {
        out = ctx.scope.substitute_xml(&out)?;
    }
    if let Some(anchors) = appended {
        out = crate::xml::insert_before_root_end(&out, anchors);
    }
    Ok(out)
}

/// Two-cell anchors keep their size: `to` moves by the same offset as
/// `from`.
pub fn shift_anchors(xml: &str, map: &PositionMap) -> String {
    let mut out = String::with_capacity(xml.len());
    let mut last = 0;
    let mut delta = (0i64, 0i64);
    for caps in ANCHOR_BLOCK_RE.captures_iter(xml) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let body = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        let row = number(&ANCHOR_ROW_RE, body);
        let col = number(&ANCHOR_COL_RE, body);
        let (Some(row), Some(col)) = (row, col) else {
            continue;
        };
        let (new_row, new_col) = if &caps[1] == "from" {
            let new_row = map.first_at_or_after(row).unwrap_or(row);
            let new_col = map.final_col(Some(row), col, Role::Start).unwrap_or(col);
            delta = (new_row as i64 - row as i64, new_col as i64 - col as i64);
            (new_row, new_col)
        } else {
            let shift = |v: u32, d: i64| (v as i64 + d).max(0) as u32;
            (shift(row, delta.0), shift(col, delta.1))
        };
        out.push_str(&xml[last..whole.start()]);
        let block = ANCHOR_ROW_RE.replacen(whole.as_str(), 1, |c: &Captures| {
            format!("<{}row>{new_row}</", &c[1])
        });
        let block = ANCHOR_COL_RE.replacen(&block, 1, |c: &Captures| {
            format!("<{}col>{new_col}</", &c[1])
        });
        out.push_str(&block);
        last = whole.end();
    }
    out.push_str(&xml[last..]);
    out
}

fn number(re: &Regex, text: &str) -> Option<u32> {
    re.captures(text)?.get(2)?.as_str().parse().ok()
}

/// Series references follow the layout; text markers are substituted.
pub fn patch_chart(ctx: &PartContext<'_>, part: &str, xml: &str) -> Result<String> {
    let mapper = ctx.layout.mapper(ctx.first_sheet(), ItemContext::default());
    let mut in_ref = false;
    let out = transform(part, xml, |event| {
        Ok(match event {
            Event::Start(e) if e.local_name().as_ref() == b"f" => {
                in_ref = true;
                Action::Keep
            }
            Event::End(e) if e.local_name().as_ref() == b"f" => {
                in_ref = false;
                Action::Keep
            }
            Event::Text(t) if in_ref => {
                let text = t.unescape().map_err(|e| TemplateError::xml(part, e))?;
                let mapped = map_references(&text, &mapper, Locks::Track)
                    .map_err(|e| e.at("chart", part, &text))?;
                Action::Replace(vec![Event::Text(BytesText::new(&mapped).into_owned())])
            }
            _ => Action::Keep,
        })
    })?;
    if ctx.template.marked_parts().contains_key(part) {
        return ctx.scope.substitute_xml(&out);
    }
    Ok(out)
}

// =============================================================================
// TABLES, COMMENTS, VML
// =============================================================================

/// Table areas grow with the rows rendered inside them.
pub fn patch_table(ctx: &PartContext<'_>, part: &str, xml: &str) -> Result<String> {
    let Some((sheet, map)) = ctx.owner_map(part) else {
        return Ok(xml.to_string());
    };
    transform(part, xml, |event| {
        Ok(match event {
            Event::Start(e) | Event::Empty(e)
                if matches!(local_name(e).as_str(), "table" | "autoFilter" | "sortState") =>
            {
                let Some(range) = attr(e, b"ref").and_then(|r| RangeRef::parse(&r)) else {
                    return Ok(Action::Keep);
                };
                let mapped = match map_area(map, &range) {
                    Some(mut area) => {
                        // header plus at least one data row
                        if area.end.row == area.start.row && range.end.row > range.start.row {
                            area.end.row += 1;
                        }
                        area
                    }
                    None => {
                        warn!(sheet = %sheet, part = %part, "table area removed by layout; kept in place");
                        range
                    }
                };
                let elem = with_attrs(e, &[("ref", mapped.a1().as_str())]);
                Action::Replace(vec![if matches!(event, Event::Start(_)) {
                    Event::Start(elem)
                } else {
                    Event::Empty(elem)
                }])
            }
            _ => Action::Keep,
        })
    })
}

fn moved_cell(map: &PositionMap, cell: CellRef) -> CellRef {
    let row = map
        .final_row(cell.row)
        .or_else(|| map.first_at_or_after(cell.row))
        .unwrap_or(cell.row);
    let col = map
        .final_col(Some(cell.row), cell.col, Role::Single)
        .unwrap_or(cell.col);
    CellRef::new(row, col)
}

/// Blank the shared strings that held markers. Marker cells are written
/// inline, so nothing references these entries any more.
pub fn scrub_shared_strings(part: &str, xml: &str) -> Result<String> {
    // rich text may split a marker across runs
    if !xml.contains('$') {
        return Ok(xml.to_string());
    }
    let mut item: Option<(Vec<Event<'_>>, String)> = None;
    let mut blanked = 0usize;
    let out = transform(part, xml, |event| {
        if let Event::Start(e) = event
            && local_name(e) == "si"
        {
            item = Some((vec![event.clone()], String::new()));
            return Ok(Action::Skip);
        }
        let Some((buffer, text)) = item.as_mut() else {
            return Ok(Action::Keep);
        };
        match event {
            Event::End(e) if e.local_name().as_ref() == b"si" => {
                let (mut buffer, text) = item.take().unwrap_or_default();
                if contains_marker(&text) {
                    blanked += 1;
                    Ok(Action::Replace(vec![
                        Event::Start(BytesStart::new("si")),
                        Event::Empty(BytesStart::new("t")),
                        Event::End(BytesEnd::new("si")),
                    ]))
                } else {
                    buffer.push(event.clone());
                    Ok(Action::Replace(buffer))
                }
            }
            _ => {
                if let Event::Text(t) = event {
                    text.push_str(&String::from_utf8_lossy(t));
                }
                buffer.push(event.clone());
                Ok(Action::Skip)
            }
        }
    })?;
    debug!(part, blanked, "marker strings blanked");
    Ok(out)
}

pub fn patch_comments(ctx: &PartContext<'_>, part: &str, xml: &str) -> Result<String> {
    let Some((_, map)) = ctx.owner_map(part) else {
        return Ok(xml.to_string());
    };
    transform(part, xml, |event| {
        Ok(match event {
            Event::Start(e) if local_name(e) == "comment" => {
                match attr(e, b"ref").and_then(|r| CellRef::parse(&r)) {
                    Some(cell) => {
                        let moved = moved_cell(map, cell).a1();
                        Action::Replace(vec![Event::Start(with_attrs(e, &[("ref", moved.as_str())]))])
                    }
                    None => Action::Keep,
                }
            }
            _ => Action::Keep,
        })
    })
}

/// Legacy comment shapes carry their cell in `x:Row`/`x:Column` and their
/// box in `x:Anchor`.
pub fn patch_vml(ctx: &PartContext<'_>, part: &str, xml: &str) -> String {
    let Some((_, map)) = ctx.owner_map(part) else {
        return xml.to_string();
    };
    VML_CLIENT_DATA_RE
        .replace_all(xml, |caps: &Captures| {
            let block = &caps[0];
            let row = VML_ROW_RE.captures(block).and_then(|c| c[1].parse::<u32>().ok());
            let col = VML_COL_RE.captures(block).and_then(|c| c[1].parse::<u32>().ok());
            let (Some(row), Some(col)) = (row, col) else {
                return block.to_string();
            };
            let moved = moved_cell(map, CellRef::new(row, col));
            let (dr, dc) = (moved.row as i64 - row as i64, moved.col as i64 - col as i64);
            let block = VML_ROW_RE.replace(block, format!("<x:Row>{}</x:Row>", moved.row).as_str());
            let block = VML_COL_RE.replace(&block, format!("<x:Column>{}</x:Column>", moved.col).as_str());
            VML_ANCHOR_RE
                .replace(&block, |a: &Captures| {
                    let values: Vec<i64> = a[1]
                        .split(',')
                        .filter_map(|v| v.trim().parse().ok())
                        .collect();
                    if values.len() != 8 {
                        return a[0].to_string();
                    }
                    let shifted: Vec<String> = values
                        .iter()
                        .enumerate()
                        .map(|(i, v)| match i {
                            0 | 4 => (v + dc).max(0).to_string(),
                            2 | 6 => (v + dr).max(0).to_string(),
                            _ => v.to_string(),
                        })
                        .collect();
                    format!("<x:Anchor>{}</x:Anchor>", shifted.join(", "))
                })
                .into_owned()
        })
        .into_owned()
}

// =============================================================================
// DOCUMENT PROPERTIES
// =============================================================================

fn metadata_fields(metadata: &DocumentMetadata) -> Vec<(&'static str, &str)> {
    let values = [
        metadata.title.as_deref(),
        metadata.subject.as_deref(),
        metadata.creator.as_deref(),
        metadata.keywords.as_deref(),
        metadata.description.as_deref(),
        metadata.category.as_deref(),
    ];
    CORE_FIELDS
        .iter()
        .zip(values)
        .filter_map(|(tag, value)| value.map(|v| (*tag, v)))
        .collect()
}

/// Overwrite (or add) the core properties the data source provides.
pub fn patch_core(xml: &str, metadata: &DocumentMetadata) -> Result<String> {
    let fields = metadata_fields(metadata);
    let mut written: BTreeSet<&str> = BTreeSet::new();
    let mut skipping: Option<&str> = None;
    let mut depth = 0usize;
    transform(CORE_PART, xml, |event| {
        if let Some(tag) = skipping {
            if let Event::End(e) = event
                && e.name().as_ref() == tag.as_bytes()
            {
                skipping = None;
                return Ok(Action::Keep);
            }
            return Ok(Action::Skip);
        }
        Ok(match event {
            Event::Start(e) | Event::Empty(e) => {
                let is_start = matches!(event, Event::Start(_));
                if is_start {
                    depth += 1;
                }
                let qname = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                match fields.iter().find(|(tag, _)| *tag == qname) {
                    Some((tag, value)) => {
                        written.insert(*tag);
                        let mut events = vec![
                            Event::Start(e.clone().into_owned()),
                            Event::Text(BytesText::new(value).into_owned()),
                        ];
                        if is_start {
                            depth -= 1;
                            skipping = Some(*tag);
                        } else {
                            events.push(Event::End(BytesEnd::new(tag.to_string())));
                        }
                        Action::Replace(events)
                    }
                    None => Action::Keep,
                }
            }
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                if depth > 0 {
                    return Ok(Action::Keep);
                }
                let mut events = Vec::new();
                for (tag, value) in &fields {
                    if written.insert(*tag) {
                        events.push(Event::Start(BytesStart::new(tag.to_string())));
                        events.push(Event::Text(BytesText::new(value).into_owned()));
                        events.push(Event::End(BytesEnd::new(tag.to_string())));
                    }
                }
                events.push(event.clone().into_owned());
                Action::Replace(events)
            }
            _ => Action::Keep,
        })
    })
}

/// A fresh `docProps/core.xml` for templates that have none.
pub fn core_document(metadata: &DocumentMetadata) -> Result<String> {
    let skeleton = concat!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n",
        "<cp:coreProperties ",
        "xmlns:cp=\"http://schemas.openxmlformats.org/package/2006/metadata/core-properties\" ",
        "xmlns:dc=\"http://purl.org/dc/elements/1.1/\" ",
        "xmlns:dcterms=\"http://purl.org/dc/terms/\" ",
        "xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\">",
        "</cp:coreProperties>"
    );
    patch_core(skeleton, metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::{CollectionSizes, Direction, RepeatRegionSpec};

    fn band_map(items: usize) -> PositionMap {
        let range = RangeRef::parse("A3:C3").unwrap();
        let region = RepeatRegionSpec {
            collection: "rows".into(),
            variable: "r".into(),
            range,
            direction: Direction::Down,
            empty_range: None,
            marker: range.start,
        };
        let mut sizes = CollectionSizes::new();
        sizes.insert("rows".into(), items);
        PositionMap::calculate(&[region], &sizes, 10).unwrap()
    }

    #[test]
    fn anchors_below_a_band_move_down_and_keep_their_size() {
        let xml = concat!(
            "<xdr:twoCellAnchor><xdr:from><xdr:col>1</xdr:col><xdr:colOff>5</xdr:colOff>",
            "<xdr:row>5</xdr:row><xdr:rowOff>0</xdr:rowOff></xdr:from>",
            "<xdr:to><xdr:col>6</xdr:col><xdr:colOff>0</xdr:colOff>",
            "<xdr:row>15</xdr:row><xdr:rowOff>0</xdr:rowOff></xdr:to></xdr:twoCellAnchor>"
        );
        let out = shift_anchors(xml, &band_map(4));
        assert!(out.contains("<xdr:row>8</xdr:row>"), "{out}");
        assert!(out.contains("<xdr:row>18</xdr:row>"), "{out}");
        assert!(out.contains("<xdr:col>1</xdr:col><xdr:colOff>5</xdr:colOff>"));
    }

    #[test]
    fn content_types_gain_images_and_lose_calc_chain() {
        let xml = concat!(
            r#"<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types">"#,
            r#"<Default Extension="xml" ContentType="application/xml"/>"#,
            r#"<Override PartName="/xl/calcChain.xml" ContentType="x"/>"#,
            r#"</Types>"#
        );
        let removed: BTreeSet<String> = [CALC_CHAIN_PART.to_string()].into();
        let defaults: BTreeSet<(String, String)> = [
            ("png".to_string(), "image/png".to_string()),
            ("xml".to_string(), "application/xml".to_string()),
        ]
        .into();
        let overrides = vec![("/xl/drawings/drawing1.xml".to_string(), "d".to_string())];
        let out = patch_content_types(xml, &removed, &defaults, &overrides).unwrap();
        assert!(!out.contains("calcChain"));
        assert_eq!(out.matches("Extension=\"xml\"").count(), 1);
        assert!(out.contains(r#"<Default Extension="png" ContentType="image/png"/>"#));
        assert!(out.contains(r#"<Override PartName="/xl/drawings/drawing1.xml" ContentType="d"/>"#));
    }

    #[test]
    fn relationships_drop_calc_chain() {
        let xml = concat!(
            r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
            r#"<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/>"#,
            r#"<Relationship Id="rId9" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/calcChain" Target="calcChain.xml"/>"#,
            "</Relationships>"
        );
        let out = patch_relationships("xl/_rels/workbook.xml.rels", xml, &[]).unwrap();
        assert!(out.contains("rId1"));
        assert!(!out.contains("rId9"));
    }

    #[test]
    fn pivot_cache_source_is_widened_and_refreshed() {
        let xml = concat!(
            r#"<pivotCacheDefinition xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" r:id="rId1">"#,
            r#"<cacheSource type="worksheet"><worksheetSource ref="A2:C3" sheet="Data"/></cacheSource>"#,
            "</pivotCacheDefinition>"
        );
        let (sheet, range) = worksheet_source("cache.xml", xml).unwrap().unwrap();
        assert_eq!((sheet.as_str(), range.a1().as_str()), ("Data", "A2:C3"));
        let source = PivotSource {
            sheet,
            range: map_area(&band_map(5), &range).unwrap(),
        };
        assert_eq!(source.range.a1(), "A2:C7");
        assert_eq!(source.data_rows(), Some(Span::new(2, 6)));
        let out = patch_pivot_cache("cache.xml", xml, Some(&source)).unwrap();
        assert!(out.contains(r#"refreshOnLoad="1""#));
        assert!(out.contains(r#"ref="A2:C7""#));
    }

    fn pivot_stats() -> ColumnStatsBook {
        let mut stats = ColumnStatsBook::new();
        stats.insert(("Data".into(), 1), ColumnStats { numeric: 5, fractional: 0 });
        stats.insert(("Data".into(), 2), ColumnStats { numeric: 5, fractional: 2 });
        stats
    }

    fn pivot_source() -> PivotSource {
        PivotSource {
            sheet: "Data".into(),
            range: RangeRef::parse("A2:C7").unwrap(),
        }
    }

    const PIVOT_NS: &str = "http://schemas.openxmlformats.org/spreadsheetml/2006/main";

    #[test]
    fn pivot_data_fields_take_formats_from_column_statistics() {
        let xml = format!(
            concat!(
                r#"<pivotTableDefinition xmlns="{}" name="Sales">"#,
                r#"<location ref="A12:B15" firstHeaderRow="1" firstDataRow="1" firstDataCol="1"/>"#,
                r#"<pivotFields count="3"/>"#,
                r#"<dataFields count="3"><dataField name="Region" fld="0"/>"#,
                r#"<dataField name="Units" fld="1"/><dataField name="Price" fld="2" numFmtId="0"/></dataFields>"#,
                "</pivotTableDefinition>"
            ),
            PIVOT_NS
        );
        let config = RenderConfig::default();
        let map = band_map(5);
        let out = patch_pivot_table(
            &config,
            Some(&map),
            "pivot.xml",
            &xml,
            Some(&pivot_source()),
            &pivot_stats(),
        )
        .unwrap();

        assert!(out.contains(r#"<dataField name="Region" fld="0"/>"#), "{out}");
        assert!(out.contains(&format!(
            r#"<dataField name="Units" fld="1" numFmtId="{}"/>"#,
            config.pivot_integer_format_id
        )));
        assert!(out.contains(&format!(
            r#"<dataField name="Price" fld="2" numFmtId="{}"/>"#,
            config.pivot_decimal_format_id
        )));
        // four extra items push the table down by four rows
        assert!(out.contains(r#"ref="A16:B19""#), "{out}");
        assert_eq!(out.matches("<pivotTableStyleInfo").count(), 1);
        assert!(out.contains(&format!(r#"name="{}""#, config.pivot_style_name)));
        assert!(out.find("<pivotTableStyleInfo").unwrap() < out.find("</pivotTableDefinition>").unwrap());
        assert!(out.find("</dataFields>").unwrap() < out.find("<pivotTableStyleInfo").unwrap());
    }

    #[test]
    fn pivot_style_goes_before_filters_and_hierarchy_usage() {
        let xml = format!(
            concat!(
                r#"<pivotTableDefinition xmlns="{}" name="Sales">"#,
                r#"<location ref="A1:B4" firstHeaderRow="1" firstDataRow="1" firstDataCol="1"/>"#,
                r#"<dataFields count="1"><dataField name="Units" fld="1"/></dataFields>"#,
                r#"<filters count="1"><filter fld="0" type="count" id="1"/></filters>"#,
                r#"<rowHierarchiesUsage count="0"/><extLst/>"#,
                "</pivotTableDefinition>"
            ),
            PIVOT_NS
        );
        let config = RenderConfig::default();
        let out =
            patch_pivot_table(&config, None, "pivot.xml", &xml, None, &ColumnStatsBook::new()).unwrap();
        let style = out.find("<pivotTableStyleInfo").unwrap();
        assert!(style < out.find("<filters").unwrap(), "{out}");
        assert!(out.find("</dataFields>").unwrap() < style);
        assert_eq!(out.matches("<pivotTableStyleInfo").count(), 1);
        // no layout for the owning sheet: location is untouched
        assert!(out.contains(r#"<location ref="A1:B4""#));
    }

    #[test]
    fn existing_pivot_style_is_kept() {
        let xml = format!(
            concat!(
                r#"<pivotTableDefinition xmlns="{}" name="Sales">"#,
                r#"<location ref="A1:B4"/>"#,
                r#"<pivotTableStyleInfo name="PivotStyleDark2"/>"#,
                "<extLst/></pivotTableDefinition>"
            ),
            PIVOT_NS
        );
        let out = patch_pivot_table(
            &RenderConfig::default(),
            None,
            "pivot.xml",
            &xml,
            None,
            &ColumnStatsBook::new(),
        )
        .unwrap();
        assert_eq!(out.matches("<pivotTableStyleInfo").count(), 1);
        assert!(out.contains("PivotStyleDark2"));
    }

    #[test]
    fn marker_strings_are_blanked() {
        let xml = concat!(
            r#"<sst count="3" uniqueCount="3">"#,
            "<si><t>Total</t></si>",
            "<si><t>${title}</t></si>",
            r#"<si><r><t>$</t></r><r><t xml:space="preserve">{item.name}</t></r></si>"#,
            "</sst>"
        );
        let out = scrub_shared_strings("xl/sharedStrings.xml", xml).unwrap();
        assert_eq!(
            out,
            concat!(
                r#"<sst count="3" uniqueCount="3">"#,
                "<si><t>Total</t></si>",
                "<si><t/></si>",
                "<si><t/></si>",
                "</sst>"
            )
        );
    }

    #[test]
    fn core_properties_are_overwritten_or_added() {
        let xml = concat!(
            r#"<cp:coreProperties xmlns:cp="cp" xmlns:dc="dc">"#,
            "<dc:title>Old</dc:title><dc:creator/>",
            "</cp:coreProperties>"
        );
        let metadata = DocumentMetadata {
            title: Some("Quarterly".into()),
            creator: Some("Finance & Ops".into()),
            category: Some("Reports".into()),
            ..DocumentMetadata::default()
        };
        let out = patch_core(xml, &metadata).unwrap();
        assert_eq!(
            out,
            concat!(
                r#"<cp:coreProperties xmlns:cp="cp" xmlns:dc="dc">"#,
                "<dc:title>Quarterly</dc:title>",
                "<dc:creator>Finance &amp; Ops</dc:creator>",
                "<cp:category>Reports</cp:category>",
                "</cp:coreProperties>"
            )
        );
        assert!(core_document(&metadata).unwrap().contains("<dc:title>Quarterly</dc:title>"));
    }
}
