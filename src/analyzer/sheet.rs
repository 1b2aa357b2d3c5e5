//! Worksheet parsing: splits the part into its top-level fragments, reads
//! `sheetData` into rows and cells and classifies every cell's content.

use super::markers::{ImageArgs, Marker, RepeatArgs, contains_marker, parse_formula_marker, parse_text};
use super::package::SheetEntry;
use crate::address::{CellRef, RangeRef};
use crate::blueprint::{
    CellContent, CellSpec, Direction, FormulaKind, ImageMarkerSpec, RepeatRegionSpec, RowSpec,
    SheetFragment, SheetSpec, StaticValue, TextPart,
};
use crate::error::{Result, TemplateError};
use crate::formula::shift_formula;
use crate::xml::{attr, attr_bool, attr_local, attr_u32, local_name, reader};
use quick_xml::events::{BytesStart, Event};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

/// A parsed sheet plus what its cells ask of the data source.
#[derive(Debug, Clone)]
pub struct SheetAnalysis {
    pub spec: SheetSpec,
    /// Variable paths with the cell they appear in (`None` for header/footer
    /// text).
    pub variables: Vec<(Option<CellRef>, String)>,
    /// Collections referenced by size markers.
    pub sized: BTreeSet<String>,
}

impl SheetAnalysis {
    /// Variable paths that are not bound to a repeat alias at their location.
    pub fn free_variables(&self) -> impl Iterator<Item = &str> {
        self.variables.iter().filter_map(|(at, path)| {
            let root = path.split('.').next().unwrap_or(path);
            let bound = at.is_some_and(|cell| {
                self.spec
                    .regions
                    .iter()
                    .any(|r| r.variable == root && r.range.contains(cell.row, cell.col))
            });
            (!bound).then_some(path.as_str())
        })
    }
}

#[derive(Debug, Default)]
struct RawFormula {
    text: String,
    kind: Option<String>,
    shared_index: Option<String>,
    range: Option<String>,
}

#[derive(Debug)]
struct RawCell {
    at: CellRef,
    style: u32,
    kind: Option<String>,
    value: Option<String>,
    formula: Option<RawFormula>,
    inline: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextTarget {
    Value,
    Formula,
    Inline,
}

struct SheetBuilder<'a> {
    name: &'a str,
    shared_strings: &'a [String],
    shared_formulas: HashMap<String, (String, CellRef)>,
    regions: Vec<RepeatRegionSpec>,
    images: Vec<ImageMarkerSpec>,
    variables: Vec<(Option<CellRef>, String)>,
    sized: BTreeSet<String>,
}

/// Parse one worksheet part.
pub fn parse_sheet(entry: &SheetEntry, xml: &str, shared_strings: &[String]) -> Result<SheetAnalysis> {
    let mut builder = SheetBuilder {
        name: &entry.name,
        shared_strings,
        shared_formulas: HashMap::new(),
        regions: Vec::new(),
        images: Vec::new(),
        variables: Vec::new(),
        sized: BTreeSet::new(),
    };

    let mut reader = reader(xml);
    let mut depth = 0usize;
    let mut root_tag: Option<String> = None;
    let mut fragments: Vec<SheetFragment> = Vec::new();
    let mut fragment_start = 0usize;
    let mut in_sheet_data = false;

    let mut rows: Vec<RowSpec> = Vec::new();
    let mut row: Option<RowSpec> = None;
    let mut next_row = 0u32;
    let mut next_col = 0u32;
    let mut cell: Option<RawCell> = None;
    let mut target: Option<TextTarget> = None;
    let mut in_phonetic = false;

    loop {
        let before = reader.buffer_position();
        let event = reader
            .read_event()
            .map_err(|e| TemplateError::xml(&entry.part, e))?;
        let after = reader.buffer_position();
        match event {
            Event::Start(e) => {
                depth += 1;
                match depth {
                    1 => root_tag = Some(xml[before..after].to_string()),
                    2 => {
                        fragment_start = before;
                        in_sheet_data = e.local_name().as_ref() == b"sheetData";
                    }
                    _ if in_sheet_data => match e.local_name().as_ref() {
                        b"row" => {
                            let spec = start_row(&e, next_row);
                            next_row = spec.index + 1;
                            next_col = 0;
                            row = Some(spec);
                        }
                        b"c" => {
                            let raw = start_cell(&e, next_row.saturating_sub(1), next_col);
                            next_col = raw.at.col + 1;
                            cell = Some(raw);
                        }
                        b"v" => target = Some(TextTarget::Value),
                        b"f" => {
                            if let Some(cell) = cell.as_mut() {
                                cell.formula = Some(start_formula(&e));
                            }
                            target = Some(TextTarget::Formula);
                        }
                        b"is" => {
                            if let Some(cell) = cell.as_mut() {
                                cell.inline = Some(String::new());
                            }
                        }
                        b"t" if !in_phonetic => target = Some(TextTarget::Inline),
                        b"rPh" => in_phonetic = true,
                        _ => {}
                    },
                    _ => {}
                }
            }
            Event::Empty(e) => match depth {
                0 => {
                    return Err(TemplateError::xml(&entry.part, "worksheet root is empty"));
                }
                1 => {
                    let name = local_name(&e);
                    fragments.push(SheetFragment {
                        xml: if name == "sheetData" {
                            String::new()
                        } else {
                            xml[before..after].to_string()
                        },
                        name,
                    });
                }
                _ if in_sheet_data => match e.local_name().as_ref() {
                    b"row" => {
                        let spec = start_row(&e, next_row);
                        next_row = spec.index + 1;
                        rows.push(spec);
                    }
                    b"c" => {
                        let raw = start_cell(&e, next_row.saturating_sub(1), next_col);
                        next_col = raw.at.col + 1;
                        let spec = builder.classify(raw)?;
                        if let Some(row) = row.as_mut() {
                            row.cells.push(spec);
                        }
                    }
                    b"f" => {
                        if let Some(cell) = cell.as_mut() {
                            cell.formula = Some(start_formula(&e));
                        }
                    }
                    _ => {}
                },
                _ => {}
            },
            Event::Text(t) => {
                if let (Some(target), Some(cell)) = (target, cell.as_mut()) {
                    let text = t.unescape().map_err(|e| TemplateError::xml(&entry.part, e))?;
                    push_text(cell, target, &text);
                }
            }
            Event::CData(t) => {
                if let (Some(target), Some(cell)) = (target, cell.as_mut()) {
                    push_text(cell, target, &String::from_utf8_lossy(&t));
                }
            }
            Event::End(e) => {
                if depth == 2 {
                    let name = local_name_end(e.local_name().as_ref());
                    fragments.push(SheetFragment {
                        xml: if name == "sheetData" {
                            String::new()
                        } else {
                            xml[fragment_start..after].to_string()
                        },
                        name,
                    });
                    in_sheet_data = false;
                } else if in_sheet_data {
                    match e.local_name().as_ref() {
                        b"row" => {
                            if let Some(done) = row.take() {
                                rows.push(done);
                            }
                        }
                        b"c" => {
                            if let Some(raw) = cell.take() {
                                let spec = builder.classify(raw)?;
                                if let Some(row) = row.as_mut() {
                                    row.cells.push(spec);
                                }
                            }
                        }
                        b"v" | b"f" | b"t" => target = None,
                        b"rPh" => in_phonetic = false,
                        _ => {}
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let root_tag = root_tag
        .ok_or_else(|| TemplateError::xml(&entry.part, "missing <worksheet> root element"))?;
    if !fragments.iter().any(|f| f.name == "sheetData") {
        // sheetData is mandatory; place it after sheetFormatPr/cols like Excel
        let at = fragments
            .iter()
            .position(|f| !matches!(f.name.as_str(), "sheetPr" | "dimension" | "sheetViews" | "sheetFormatPr" | "cols"))
            .unwrap_or(fragments.len());
        fragments.insert(
            at,
            SheetFragment {
                name: "sheetData".to_string(),
                xml: String::new(),
            },
        );
    }

    rows.sort_by_key(|r| r.index);
    for row in &mut rows {
        row.cells.sort_by_key(|c| c.col);
    }

    let merges = fragments
        .iter()
        .filter(|f| f.name == "mergeCells")
        .map(|f| parse_merges(&entry.part, &f.xml))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();

    let drawing_rel = fragments
        .iter()
        .find(|f| f.name == "drawing")
        .map(|f| drawing_rel_id(&entry.part, &f.xml))
        .transpose()?
        .flatten();

    for fragment in fragments.iter().filter(|f| f.name == "headerFooter") {
        builder.scan_header_footer(&fragment.xml)?;
    }

    let last_row = rows
        .iter()
        .filter(|r| !r.cells.is_empty() || r.height.is_some() || r.hidden || r.style.is_some())
        .map(|r| r.index)
        .chain(merges.iter().map(|m| m.end.row))
        .max();
    let last_col = rows
        .iter()
        .filter_map(|r| r.cells.last().map(|c| c.col))
        .chain(merges.iter().map(|m| m.end.col))
        .max();

    let suppressed = builder
        .regions
        .iter()
        .filter_map(|r| r.empty_range)
        .collect();

    debug!(
        sheet = %entry.name,
        rows = rows.len(),
        regions = builder.regions.len(),
        images = builder.images.len(),
        "parsed worksheet"
    );

    Ok(SheetAnalysis {
        spec: SheetSpec {
            name: entry.name.clone(),
            part: entry.part.clone(),
            root_tag,
            fragments,
            rows,
            regions: builder.regions,
            images: builder.images,
            merges,
            drawing_rel,
            suppressed,
            last_row,
            last_col,
        },
        variables: builder.variables,
        sized: builder.sized,
    })
}

fn local_name_end(name: &[u8]) -> String {
    String::from_utf8_lossy(name).into_owned()
}

fn start_row(e: &BytesStart, next_row: u32) -> RowSpec {
    let index = attr_u32(e, b"r")
        .and_then(|r| r.checked_sub(1))
        .unwrap_or(next_row);
    let height = attr_bool(e, b"customHeight")
        .then(|| attr(e, b"ht").and_then(|h| h.parse::<f64>().ok()))
        .flatten();
    RowSpec {
        index,
        height,
        hidden: attr_bool(e, b"hidden"),
        style: attr_bool(e, b"customFormat")
            .then(|| attr_u32(e, b"s"))
            .flatten(),
        cells: Vec::new(),
    }
}

fn start_cell(e: &BytesStart, row: u32, next_col: u32) -> RawCell {
    let at = attr(e, b"r")
        .and_then(|r| CellRef::parse(&r))
        .unwrap_or_else(|| CellRef::new(row, next_col));
    RawCell {
        at,
        style: attr_u32(e, b"s").unwrap_or(0),
        kind: attr(e, b"t"),
        value: None,
        formula: None,
        inline: None,
    }
}

fn start_formula(e: &BytesStart) -> RawFormula {
    RawFormula {
        text: String::new(),
        kind: attr(e, b"t"),
        shared_index: attr(e, b"si"),
        range: attr(e, b"ref"),
    }
}

fn push_text(cell: &mut RawCell, target: TextTarget, text: &str) {
    match target {
        TextTarget::Value => cell.value.get_or_insert_with(String::new).push_str(text),
        TextTarget::Formula => {
            if let Some(formula) = cell.formula.as_mut() {
                formula.text.push_str(text);
            }
        }
        TextTarget::Inline => cell.inline.get_or_insert_with(String::new).push_str(text),
    }
}

fn parse_merges(part: &str, xml: &str) -> Result<Vec<RangeRef>> {
    let mut out = Vec::new();
    let mut reader = reader(xml);
    loop {
        match reader.read_event().map_err(|e| TemplateError::xml(part, e))? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"mergeCell" => {
                if let Some(range) = attr(&e, b"ref").and_then(|r| RangeRef::parse(&r)) {
                    out.push(range);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(out)
}

fn drawing_rel_id(part: &str, xml: &str) -> Result<Option<String>> {
    let mut reader = reader(xml);
    loop {
        match reader.read_event().map_err(|e| TemplateError::xml(part, e))? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"drawing" => {
                return Ok(attr_local(&e, b"id"));
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

impl SheetBuilder<'_> {
    fn error_at(&self, at: CellRef, message: impl Into<String>) -> TemplateError {
        TemplateError::template_at(message, self.name, at.a1())
    }

    fn classify(&mut self, raw: RawCell) -> Result<CellSpec> {
        let at = raw.at;
        let content = match raw.formula {
            Some(formula) => self.formula_content(at, formula)?,
            None => self.value_content(at, raw.kind.as_deref(), raw.value, raw.inline)?,
        };
        Ok(CellSpec {
            col: at.col,
            style: raw.style,
            content,
        })
    }

    fn formula_content(&mut self, at: CellRef, formula: RawFormula) -> Result<CellContent> {
        let text = match (formula.kind.as_deref(), &formula.shared_index) {
            (Some("shared"), Some(si)) if formula.text.is_empty() => {
                let (master, origin) = self.shared_formulas.get(si).ok_or_else(|| {
                    self.error_at(at, format!("shared formula {si} has no master cell"))
                })?;
                shift_formula(
                    master,
                    at.row as i64 - origin.row as i64,
                    at.col as i64 - origin.col as i64,
                )
                .map_err(|e| e.at(self.name, &at.a1(), master))?
            }
            (Some("shared"), Some(si)) => {
                self.shared_formulas
                    .insert(si.clone(), (formula.text.clone(), at));
                formula.text
            }
            _ => formula.text,
        };

        if let Some(marker) = parse_formula_marker(&text) {
            let marker = marker.map_err(|e| self.error_at(at, e.to_string()))?;
            return Ok(match marker {
                Marker::Repeat(args) => {
                    self.add_region(at, args)?;
                    CellContent::RepeatMarker
                }
                Marker::Image(args) => CellContent::ImageMarker(self.add_image(at, args)),
                Marker::Size(collection) => {
                    self.sized.insert(collection.clone());
                    CellContent::SizeMarker(collection)
                }
                Marker::Variable(path) => {
                    self.variables.push((Some(at), path.clone()));
                    CellContent::VariableRef(path)
                }
            });
        }

        let kind = match formula.kind.as_deref() {
            Some("array") => FormulaKind::Array {
                range: formula
                    .range
                    .as_deref()
                    .and_then(RangeRef::parse)
                    .unwrap_or_else(|| RangeRef::single(at)),
            },
            _ => FormulaKind::Normal,
        };
        Ok(CellContent::Static(StaticValue::Formula { text, kind }))
    }

    fn value_content(
        &mut self,
        at: CellRef,
        kind: Option<&str>,
        value: Option<String>,
        inline: Option<String>,
    ) -> Result<CellContent> {
        let value_static = match kind {
            Some("s") => {
                let index = value
                    .as_deref()
                    .and_then(|v| v.trim().parse::<u32>().ok())
                    .ok_or_else(|| self.error_at(at, "shared string cell without an index"))?;
                let text = self
                    .shared_strings
                    .get(index as usize)
                    .ok_or_else(|| self.error_at(at, format!("shared string {index} does not exist")))?;
                if contains_marker(text) {
                    let text = text.clone();
                    return self.text_content(at, &text);
                }
                StaticValue::SharedString(index)
            }
            Some("inlineStr") => {
                let text = inline.unwrap_or_default();
                if contains_marker(&text) {
                    return self.text_content(at, &text);
                }
                StaticValue::Text(text)
            }
            Some("str") => StaticValue::Text(value.unwrap_or_default()),
            Some("b") => StaticValue::Bool(value.as_deref().map(str::trim) == Some("1")),
            Some("e") => StaticValue::Error(value.unwrap_or_default()),
            Some("d") => StaticValue::Date(value.unwrap_or_default()),
            _ => match value {
                Some(number) if !number.trim().is_empty() => StaticValue::Number(number),
                _ => StaticValue::Blank,
            },
        };
        Ok(CellContent::Static(value_static))
    }

    fn text_content(&mut self, at: CellRef, text: &str) -> Result<CellContent> {
        let parsed = parse_text(text).map_err(|e| self.error_at(at, e.to_string()))?;
        let mut image = None;
        for marker in parsed.structural.iter().cloned() {
            match marker {
                Marker::Repeat(args) => self.add_region(at, args)?,
                Marker::Image(args) => {
                    let spec = self.add_image(at, args);
                    image.get_or_insert(spec);
                }
                Marker::Variable(_) | Marker::Size(_) => {}
            }
        }
        for part in &parsed.parts {
            match part {
                TextPart::Variable(path) => self.variables.push((Some(at), path.clone())),
                TextPart::Size(collection) => {
                    self.sized.insert(collection.clone());
                }
                TextPart::Literal(_) => {}
            }
        }

        Ok(match parsed.parts.as_slice() {
            [] => match image {
                Some(image) => CellContent::ImageMarker(image),
                None => CellContent::RepeatMarker,
            },
            [TextPart::Variable(path)] => CellContent::VariableRef(path.clone()),
            [TextPart::Size(collection)] => CellContent::SizeMarker(collection.clone()),
            parts => match parsed.literal() {
                Some(text) => CellContent::Static(StaticValue::Text(text)),
                None => CellContent::Template(parts.to_vec()),
            },
        })
    }

    fn add_region(&mut self, at: CellRef, args: RepeatArgs) -> Result<()> {
        let variable = args.variable.unwrap_or_else(|| args.collection.clone());
        if let Some(empty) = args.empty_range {
            let fits = match args.direction {
                Direction::Down => empty.width() <= args.range.width(),
                Direction::Right => empty.height() <= args.range.height(),
            };
            if !fits {
                return Err(self.error_at(
                    at,
                    format!(
                        "empty range {empty} does not fit across repeat range {}",
                        args.range
                    ),
                ));
            }
        }
        if self
            .regions
            .iter()
            .any(|r| r.collection == args.collection && r.range == args.range)
        {
            warn!(
                sheet = %self.name,
                cell = %at,
                collection = %args.collection,
                range = %args.range,
                "duplicate repeat marker ignored"
            );
            return Ok(());
        }
        self.regions.push(RepeatRegionSpec {
            collection: args.collection,
            variable,
            range: args.range,
            direction: args.direction,
            empty_range: args.empty_range,
            marker: at,
        });
        Ok(())
    }

    fn add_image(&mut self, at: CellRef, args: ImageArgs) -> ImageMarkerSpec {
        let spec = ImageMarkerSpec {
            name: args.name,
            anchor: args.anchor.unwrap_or_else(|| RangeRef::single(at)),
            size: args.size,
        };
        if self.images.contains(&spec) {
            warn!(
                sheet = %self.name,
                cell = %at,
                image = %spec.name,
                "duplicate image marker ignored"
            );
        } else {
            self.images.push(spec.clone());
        }
        spec
    }

    fn scan_header_footer(&mut self, xml: &str) -> Result<()> {
        if !contains_marker(xml) {
            return Ok(());
        }
        let parsed = parse_text(xml).map_err(|e| {
            TemplateError::template_at(e.to_string(), self.name, "headerFooter")
        })?;
        if !parsed.structural.is_empty() {
            warn!(
                sheet = %self.name,
                markers = parsed.structural.len(),
                "structural markers in header/footer text are removed"
            );
        }
        for part in parsed.parts {
            if let TextPart::Variable(path) = part {
                self.variables.push((None, path));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> SheetEntry {
        SheetEntry {
            name: "Report".into(),
            sheet_id: 1,
            rel_id: "rId1".into(),
            part: "xl/worksheets/sheet1.xml".into(),
        }
    }

    fn sheet(rows: &str, tail: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><dimension ref="A1:C3"/><sheetData>{rows}</sheetData>{tail}</worksheet>"#
        )
    }

    #[test]
    fn cells_are_classified() {
        let shared = vec![
            "Title: ${title}".to_string(),
            "${repeat(items, A3:C3, item)}".to_string(),
            "${item.name}".to_string(),
            "Plain".to_string(),
        ];
        let xml = sheet(
            r#"<row r="1"><c r="A1" t="s" s="1"><v>0</v></c><c r="B1" t="s"><v>3</v></c></row>
               <row r="2"><c r="A2" t="s"><v>1</v></c></row>
               <row r="3" ht="24" customHeight="1"><c r="A3" t="s" s="2"><v>2</v></c><c r="B3" s="3"><v>4.5</v></c><c r="C3"><f>A3*B3</f><v>0</v></c></row>"#,
            "",
        );
        let analysis = parse_sheet(&entry(), &xml, &shared).unwrap();
        let spec = &analysis.spec;

        assert_eq!(
            spec.cell(0, 0).unwrap().content,
            CellContent::Template(vec![
                TextPart::Literal("Title: ".into()),
                TextPart::Variable("title".into())
            ])
        );
        assert_eq!(spec.cell(0, 0).unwrap().style, 1);
        assert_eq!(
            spec.cell(0, 1).unwrap().content,
            CellContent::Static(StaticValue::SharedString(3))
        );
        assert_eq!(spec.cell(1, 0).unwrap().content, CellContent::RepeatMarker);
        assert_eq!(
            spec.cell(2, 0).unwrap().content,
            CellContent::VariableRef("item.name".into())
        );
        assert!(spec.cell(2, 2).unwrap().content.is_formula());
        assert_eq!(spec.row(2).unwrap().height, Some(24.0));

        assert_eq!(spec.regions.len(), 1);
        assert_eq!(spec.regions[0].variable, "item");
        assert_eq!(spec.regions[0].marker, CellRef::new(1, 0));

        // item.name is bound by the region alias
        let free: Vec<&str> = analysis.free_variables().collect();
        assert_eq!(free, vec!["title"]);
        assert_eq!(spec.last_row, Some(2));
        assert_eq!(spec.last_col, Some(2));
    }

    #[test]
    fn fragments_keep_document_order() {
        let xml = sheet(
            r#"<row r="1"><c r="A1" t="inlineStr"><is><t>x</t></is></c></row>"#,
            r#"<mergeCells count="1"><mergeCell ref="A1:B1"/></mergeCells><headerFooter><oddHeader>&amp;C${title}</oddHeader></headerFooter><drawing r:id="rId3"/>"#,
        );
        let analysis = parse_sheet(&entry(), &xml, &[]).unwrap();
        let names: Vec<&str> = analysis.spec.fragments.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["dimension", "sheetData", "mergeCells", "headerFooter", "drawing"]
        );
        assert_eq!(analysis.spec.merges, vec![RangeRef::parse("A1:B1").unwrap()]);
        assert_eq!(analysis.spec.drawing_rel.as_deref(), Some("rId3"));
        assert_eq!(analysis.free_variables().collect::<Vec<_>>(), vec!["title"]);
        assert!(analysis.spec.root_tag.starts_with("<worksheet "));
    }

    #[test]
    fn shared_formulas_are_expanded() {
        let xml = sheet(
            r#"<row r="1"><c r="C1"><f t="shared" ref="C1:C3" si="0">A1+B1</f></c></row>
               <row r="2"><c r="C2"><f t="shared" si="0"/></c></row>"#,
            "",
        );
        let analysis = parse_sheet(&entry(), &xml, &[]).unwrap();
        assert_eq!(
            analysis.spec.cell(1, 2).unwrap().content,
            CellContent::Static(StaticValue::Formula {
                text: "A2+B2".into(),
                kind: FormulaKind::Normal
            })
        );
    }

    #[test]
    fn formula_markers_declare_regions() {
        let xml = sheet(
            r#"<row r="1"><c r="A1"><f>TBEG_REPEAT("rows", "A2:B2", "r", "down")</f></c><c r="B1"><f>TBEG_SIZE(rows)</f></c></row>"#,
            "",
        );
        let analysis = parse_sheet(&entry(), &xml, &[]).unwrap();
        assert_eq!(analysis.spec.regions[0].collection, "rows");
        assert_eq!(
            analysis.spec.cell(0, 1).unwrap().content,
            CellContent::SizeMarker("rows".into())
        );
        assert!(analysis.sized.contains("rows"));
    }

    #[test]
    fn duplicate_markers_are_not_fatal() {
        let xml = sheet(
            r#"<row r="1"><c r="A1" t="inlineStr"><is><t>${repeat(items, A2:B2)}</t></is></c><c r="B1" t="inlineStr"><is><t>${repeat(items, A2:B2)}</t></is></c><c r="C1" t="inlineStr"><is><t>${image(logo, D1)}${image(logo, D1)}</t></is></c></row>"#,
            "",
        );
        let analysis = parse_sheet(&entry(), &xml, &[]).unwrap();
        assert_eq!(analysis.spec.regions.len(), 1);
        assert_eq!(analysis.spec.images.len(), 1);
    }

    #[test]
    fn malformed_marker_names_the_cell() {
        let xml = sheet(
            r#"<row r="4"><c r="B4" t="inlineStr"><is><t>${bogus(1)}</t></is></c></row>"#,
            "",
        );
        let err = parse_sheet(&entry(), &xml, &[]).unwrap_err();
        match err {
            TemplateError::TemplateProcessing { sheet, cell, .. } => {
                assert_eq!(sheet.as_deref(), Some("Report"));
                assert_eq!(cell.as_deref(), Some("B4"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn oversized_empty_range_is_rejected() {
        let xml = sheet(
            r#"<row r="1"><c r="A1" t="inlineStr"><is><t>${repeat(items, A2:B2, i, down, A9:D9)}</t></is></c></row>"#,
            "",
        );
        assert!(parse_sheet(&entry(), &xml, &[]).is_err());
    }
}
