//! Structural model of an analyzed template.
//!
//! A [`Blueprint`] is built once by the analyzer and never mutated again. It is
//! shared read-only (behind an `Arc`) by every rendering of the same template,
//! so nothing in here holds per-render state.

use crate::address::{CellRef, RangeRef};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Down,
    Right,
}

/// A declared repeat region. All coordinates are template coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatRegionSpec {
    pub collection: String,
    /// Alias bound to the current item inside the block.
    pub variable: String,
    pub range: RangeRef,
    pub direction: Direction,
    pub empty_range: Option<RangeRef>,
    /// Cell holding the marker that declared this region.
    pub marker: CellRef,
}

impl RepeatRegionSpec {
    pub fn start_row(&self) -> u32 {
        self.range.start.row
    }

    pub fn end_row(&self) -> u32 {
        self.range.end.row
    }

    pub fn start_col(&self) -> u32 {
        self.range.start.col
    }

    pub fn end_col(&self) -> u32 {
        self.range.end.col
    }

    /// Extent of one repetition along the expansion axis.
    pub fn block_len(&self) -> u32 {
        match self.direction {
            Direction::Down => self.range.height(),
            Direction::Right => self.range.width(),
        }
    }

    /// Extent of the empty-collection block along the expansion axis.
    pub fn empty_len(&self) -> Option<u32> {
        self.empty_range.map(|r| match self.direction {
            Direction::Down => r.height(),
            Direction::Right => r.width(),
        })
    }

    /// Number of rows (DOWN) or columns (RIGHT) this region occupies once
    /// rendered with `items` items.
    pub fn rendered_len(&self, items: usize) -> u32 {
        if items > 0 {
            (items as u64 * self.block_len() as u64).min(u32::MAX as u64) as u32
        } else {
            self.empty_len().unwrap_or(0)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMarkerSpec {
    pub name: String,
    pub anchor: RangeRef,
    /// Explicit `WxH` pixel size, when the marker gave one.
    pub size: Option<(u32, u32)>,
}

/// Piece of a cell text that mixes literal text with substitutions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TextPart {
    Literal(String),
    Variable(String),
    Size(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FormulaKind {
    Normal,
    /// Array formula; `range` is the template's `ref` attribute.
    Array { range: RangeRef },
}

/// Literal template content copied to the output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StaticValue {
    /// Styled cell without a value.
    Blank,
    /// Number kept in its original textual form.
    Number(String),
    /// Index into the template's shared-string table.
    SharedString(u32),
    Text(String),
    Bool(bool),
    Error(String),
    /// ISO 8601 date cell (`t="d"`).
    Date(String),
    Formula { text: String, kind: FormulaKind },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellContent {
    Static(StaticValue),
    /// The whole cell is one `${path}`; the value keeps its type.
    VariableRef(String),
    SizeMarker(String),
    /// Literal text interleaved with substitutions; renders as text.
    Template(Vec<TextPart>),
    ImageMarker(ImageMarkerSpec),
    /// Cell held only a repeat marker. Rendered blank with its style.
    RepeatMarker,
}

impl CellContent {
    pub fn is_formula(&self) -> bool {
        matches!(self, CellContent::Static(StaticValue::Formula { .. }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellSpec {
    pub col: u32,
    /// Index into `cellXfs`; preserved verbatim in the output.
    pub style: u32,
    pub content: CellContent,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowSpec {
    pub index: u32,
    pub height: Option<f64>,
    pub hidden: bool,
    /// Row-level default style (`s` with `customFormat`).
    pub style: Option<u32>,
    pub cells: Vec<CellSpec>,
}

/// Top-level child of `<worksheet>` other than `sheetData`, kept verbatim
/// unless the renderer knows how to rewrite it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetFragment {
    pub name: String,
    pub xml: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetSpec {
    pub name: String,
    /// Zip path of the worksheet part, e.g. `xl/worksheets/sheet1.xml`.
    pub part: String,
    /// Opening `<worksheet ...>` tag with its namespace declarations.
    pub root_tag: String,
    /// Top-level children in document order; `sheetData` appears by name
    /// with empty xml and marks where rows are emitted.
    pub fragments: Vec<SheetFragment>,
    pub rows: Vec<RowSpec>,
    pub regions: Vec<RepeatRegionSpec>,
    pub images: Vec<ImageMarkerSpec>,
    pub merges: Vec<RangeRef>,
    /// Relationship id of the sheet's drawing, when it has one.
    pub drawing_rel: Option<String>,
    /// Template cells suppressed at their own location (`emptyRange` blocks).
    pub suppressed: Vec<RangeRef>,
    pub last_row: Option<u32>,
    pub last_col: Option<u32>,
}

impl SheetSpec {
    pub fn row(&self, index: u32) -> Option<&RowSpec> {
        self.rows
            .binary_search_by_key(&index, |r| r.index)
            .ok()
            .map(|i| &self.rows[i])
    }

    pub fn cell(&self, row: u32, col: u32) -> Option<&CellSpec> {
        self.row(row)?.cells.iter().find(|c| c.col == col)
    }

    pub fn is_suppressed(&self, row: u32, col: u32) -> bool {
        self.suppressed.iter().any(|r| r.contains(row, col))
    }

    /// Region whose block contains the given template cell.
    pub fn region_at(&self, row: u32, col: u32) -> Option<usize> {
        self.regions.iter().position(|r| r.range.contains(row, col))
    }

    pub fn has_fragment(&self, name: &str) -> bool {
        self.fragments.iter().any(|f| f.name == name)
    }
}

/// Data a rendering needs from the data source, collected during analysis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    /// Top-level variable paths (item aliases excluded).
    pub variables: BTreeSet<String>,
    pub collections: BTreeSet<String>,
    pub images: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    pub sheets: Vec<SheetSpec>,
    pub requirements: Requirements,
}

impl Blueprint {
    pub fn sheet(&self, name: &str) -> Option<&SheetSpec> {
        self.sheets.iter().find(|s| s.name == name)
    }

    pub fn sheet_index(&self, name: &str) -> Option<usize> {
        self.sheets.iter().position(|s| s.name == name)
    }

    /// Compact structural summary, used by the CLI `inspect` command.
    pub fn summary(&self) -> BlueprintSummary {
        BlueprintSummary {
            sheets: self
                .sheets
                .iter()
                .map(|sheet| SheetSummary {
                    name: sheet.name.clone(),
                    rows: sheet.rows.len(),
                    cells: sheet.rows.iter().map(|r| r.cells.len()).sum(),
                    last_cell: match (sheet.last_row, sheet.last_col) {
                        (Some(row), Some(col)) => Some(CellRef::new(row, col).a1()),
                        _ => None,
                    },
                    regions: sheet
                        .regions
                        .iter()
                        .map(|r| RegionSummary {
                            collection: r.collection.clone(),
                            variable: r.variable.clone(),
                            range: r.range.a1(),
                            direction: r.direction,
                            empty_range: r.empty_range.map(|e| e.a1()),
                        })
                        .collect(),
                    images: sheet.images.iter().map(|i| i.name.clone()).collect(),
                    merges: sheet.merges.len(),
                    conditional_formats: sheet
                        .fragments
                        .iter()
                        .filter(|f| f.name == "conditionalFormatting")
                        .count(),
                })
                .collect(),
            requirements: self.requirements.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BlueprintSummary {
    pub sheets: Vec<SheetSummary>,
    pub requirements: Requirements,
}

#[derive(Debug, Clone, Serialize)]
pub struct SheetSummary {
    pub name: String,
    pub rows: usize,
    pub cells: usize,
    pub last_cell: Option<String>,
    pub regions: Vec<RegionSummary>,
    pub images: Vec<String>,
    pub merges: usize,
    pub conditional_formats: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegionSummary {
    pub collection: String,
    pub variable: String,
    pub range: String,
    pub direction: Direction,
    pub empty_range: Option<String>,
}

/// Collection sizes keyed by collection name.
pub type CollectionSizes = BTreeMap<String, usize>;

#[cfg(test)]
mod tests {
    use super::*;

    fn region(range: &str, direction: Direction, empty: Option<&str>) -> RepeatRegionSpec {
        RepeatRegionSpec {
            collection: "items".into(),
            variable: "item".into(),
            range: RangeRef::parse(range).unwrap(),
            direction,
            empty_range: empty.map(|e| RangeRef::parse(e).unwrap()),
            marker: CellRef::new(0, 0),
        }
    }

    #[test]
    fn rendered_length_follows_item_count() {
        let down = region("A3:C4", Direction::Down, None);
        assert_eq!(down.block_len(), 2);
        assert_eq!(down.rendered_len(3), 6);
        assert_eq!(down.rendered_len(1), 2);
        assert_eq!(down.rendered_len(0), 0);

        let with_empty = region("A3:C4", Direction::Down, Some("A10:C10"));
        assert_eq!(with_empty.rendered_len(0), 1);

        let right = region("B2:C2", Direction::Right, None);
        assert_eq!(right.block_len(), 2);
        assert_eq!(right.rendered_len(4), 8);
    }

    #[test]
    fn direction_parses_case_insensitively() {
        assert_eq!("down".parse::<Direction>().unwrap(), Direction::Down);
        assert_eq!("RIGHT".parse::<Direction>().unwrap(), Direction::Right);
        assert!("up".parse::<Direction>().is_err());
    }
}
