//! Formula reference adjustment.
//!
//! Formulas are rewritten at the token level: the formualizer tokenizer finds
//! the reference operands and every other byte of the formula (functions,
//! strings, whitespace) is copied through untouched. Nothing is evaluated.

use crate::address::{Endpoint, MAX_COL, MAX_ROW, Span, sheet_prefix, unquote_sheet_name};
use crate::error::TemplateError;
use formualizer_parse::tokenizer::Tokenizer;
use thiserror::Error;

/// Longest formula text a cell may hold.
pub const MAX_FORMULA_LEN: usize = 8_192;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormulaError {
    #[error("failed to tokenize formula: {0}")]
    Tokenize(String),
    #[error("row {0} is beyond the last sheet row")]
    RowLimit(u64),
    #[error("column {0} is beyond the last sheet column")]
    ColumnLimit(u64),
    #[error("adjusted formula is {0} characters long")]
    TooLong(usize),
    #[error("formula references unknown sheet '{0}'")]
    UnknownSheet(String),
}

impl FormulaError {
    /// Attach the location of the formula being rewritten.
    pub fn at(self, sheet: &str, cell: &str, formula: &str) -> TemplateError {
        match self {
            FormulaError::UnknownSheet(name) => TemplateError::template_at(
                format!("formula '{formula}' references unknown sheet '{name}'"),
                sheet,
                cell,
            ),
            other => TemplateError::formula(sheet, cell, formula, other.to_string()),
        }
    }
}

/// Which side of a reference an endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Single,
    Start,
    End,
}

/// Whether `$` locks pin an axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locks {
    /// Locked rows/columns are never moved (cell formulas).
    Respect,
    /// Locks are kept in the text but the coordinate still follows the
    /// layout (chart series, pivot sources, defined names).
    Track,
}

/// Maps template coordinates of one reference endpoint to final ones.
/// `None` means the coordinate no longer exists.
pub trait ReferenceMapper {
    fn map_row(&self, sheet: Option<&str>, row: u32, role: Role) -> Result<Option<u32>, FormulaError>;

    fn map_col(
        &self,
        sheet: Option<&str>,
        row: Option<u32>,
        col: u32,
        role: Role,
    ) -> Result<Option<u32>, FormulaError>;
}

/// A reference operand split into its sheet prefix and endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRef {
    /// Sheet prefix exactly as written, including quotes (no `!`).
    pub raw_sheet: Option<String>,
    pub sheet: Option<String>,
    pub start: Endpoint,
    pub end: Option<Endpoint>,
}

impl ParsedRef {
    /// Parse `A1`, `$A$1:B2`, `A:A`, `3:5`, `Sheet!A1`, `'My Sheet'!A1:B2`.
    /// External and 3D references are not parsed.
    pub fn parse(text: &str) -> Option<Self> {
        let (raw_sheet, coords) = match text.rsplit_once('!') {
            Some((sheet, coords)) => (Some(sheet), coords),
            None => (None, text),
        };
        if let Some(sheet) = raw_sheet {
            let quoted = sheet.starts_with('\'');
            if sheet.is_empty() || sheet.starts_with('[') || (!quoted && sheet.contains(':')) {
                return None;
            }
        }
        let (start, end) = match coords.split_once(':') {
            Some((a, b)) => {
                let start = Endpoint::parse(a)?;
                let end = Endpoint::parse(b)?;
                // `A:3` mixes axes
                if start.col.is_some() != end.col.is_some() || start.row.is_some() != end.row.is_some() {
                    return None;
                }
                (start, Some(end))
            }
            None => {
                let start = Endpoint::parse(coords)?;
                // a bare column or row is a name, not a reference
                if start.col.is_none() || start.row.is_none() {
                    return None;
                }
                (start, None)
            }
        };
        Some(Self {
            raw_sheet: raw_sheet.map(str::to_string),
            sheet: raw_sheet.map(unquote_sheet_name),
            start,
            end,
        })
    }

    pub fn format(&self) -> String {
        let mut out = String::new();
        if let Some(sheet) = &self.raw_sheet {
            out.push_str(sheet);
            out.push('!');
        }
        out.push_str(&self.start.format());
        if let Some(end) = &self.end {
            out.push(':');
            out.push_str(&end.format());
        }
        out
    }
}

/// Rewrite every reference operand of `formula` through `f`. `f` returns the
/// replacement text, or `None` to keep the operand as written. The formula may
/// be given with or without its leading `=`; the output keeps the input's
/// form.
pub fn rewrite_references<F>(formula: &str, mut f: F) -> Result<String, FormulaError>
where
    F: FnMut(&ParsedRef) -> Result<Option<String>, FormulaError>,
{
    let had_equals = formula.starts_with('=');
    let formula_with_equals = if had_equals {
        formula.to_string()
    } else {
        format!("={formula}")
    };

    let tokenizer = Tokenizer::new(&formula_with_equals)
        .map_err(|e| FormulaError::Tokenize(e.message.to_string()))?;

    let mut out = String::with_capacity(formula_with_equals.len() + 8);
    let mut cursor = 0usize;
    for token in &tokenizer.items {
        if token.start > cursor {
            out.push_str(&formula_with_equals[cursor..token.start]);
        }
        let replaced = if token.subtype == formualizer_parse::TokenSubType::Range {
            match ParsedRef::parse(&token.value) {
                Some(parsed) => f(&parsed)?,
                None => None,
            }
        } else {
            None
        };
        match replaced {
            Some(text) => out.push_str(&text),
            None => out.push_str(&token.value),
        }
        cursor = token.end;
    }
    if cursor < formula_with_equals.len() {
        out.push_str(&formula_with_equals[cursor..]);
    }

    let result = if had_equals {
        out
    } else {
        out.strip_prefix('=').unwrap_or(&out).to_string()
    };
    if result.chars().count() > MAX_FORMULA_LEN {
        return Err(FormulaError::TooLong(result.chars().count()));
    }
    Ok(result)
}

/// Rewrite all references through a [`ReferenceMapper`].
pub fn map_references(
    formula: &str,
    mapper: &dyn ReferenceMapper,
    locks: Locks,
) -> Result<String, FormulaError> {
    rewrite_references(formula, |parsed| map_parsed(parsed, mapper, locks))
}

/// Map one parsed reference. Returns `#REF!` text when the reference
/// collapses or points into removed cells.
pub fn map_parsed(
    parsed: &ParsedRef,
    mapper: &dyn ReferenceMapper,
    locks: Locks,
) -> Result<Option<String>, FormulaError> {
    let sheet = parsed.sheet.as_deref();
    let invalid = || Ok(Some("#REF!".to_string()));

    match &parsed.end {
        None => match map_endpoint(&parsed.start, sheet, Role::Single, mapper, locks)? {
            Some(start) => Ok(changed(parsed, start, None)),
            None => invalid(),
        },
        Some(end) => {
            let start = map_endpoint(&parsed.start, sheet, Role::Start, mapper, locks)?;
            let new_end = map_endpoint(end, sheet, Role::End, mapper, locks)?;
            match (start, new_end) {
                (Some(s), Some(e)) => {
                    if s.row.zip(e.row).is_some_and(|(a, b)| a > b)
                        || s.col.zip(e.col).is_some_and(|(a, b)| a > b)
                    {
                        return invalid();
                    }
                    Ok(changed(parsed, s, Some(e)))
                }
                _ => invalid(),
            }
        }
    }
}

fn changed(parsed: &ParsedRef, start: Endpoint, end: Option<Endpoint>) -> Option<String> {
    if start == parsed.start && end == parsed.end {
        return None;
    }
    Some(
        ParsedRef {
            start,
            end,
            ..parsed.clone()
        }
        .format(),
    )
}

fn map_endpoint(
    endpoint: &Endpoint,
    sheet: Option<&str>,
    role: Role,
    mapper: &dyn ReferenceMapper,
    locks: Locks,
) -> Result<Option<Endpoint>, FormulaError> {
    let mut out = *endpoint;
    if let Some(row) = endpoint.row
        && !(endpoint.row_locked && locks == Locks::Respect)
    {
        match mapper.map_row(sheet, row, role)? {
            Some(mapped) if mapped > MAX_ROW => return Err(FormulaError::RowLimit(mapped as u64 + 1)),
            Some(mapped) => out.row = Some(mapped),
            None => return Ok(None),
        }
    }
    if let Some(col) = endpoint.col
        && !(endpoint.col_locked && locks == Locks::Respect)
    {
        match mapper.map_col(sheet, endpoint.row, col, role)? {
            Some(mapped) if mapped > MAX_COL => {
                return Err(FormulaError::ColumnLimit(mapped as u64 + 1));
            }
            Some(mapped) => out.col = Some(mapped),
            None => return Ok(None),
        }
    }
    Ok(Some(out))
}

// =============================================================================
// AXIS ADJUSTMENTS
// =============================================================================

fn shift(value: u32, delta: i64) -> Result<Option<u32>, FormulaError> {
    let shifted = value as i64 + delta;
    if shifted < 0 {
        return Ok(None);
    }
    Ok(Some(shifted as u32))
}

/// Expansion of a block of `span` by `offset` along one axis.
fn expand_axis(value: u32, span: Span, offset: i64, role: Role) -> Result<Option<u32>, FormulaError> {
    if value > span.end {
        return shift(value, offset);
    }
    if !span.contains(value) || offset >= 0 {
        return match role {
            Role::End if span.contains(value) => shift(value, offset),
            _ => Ok(Some(value)),
        };
    }
    // shrinking block: cells past the new end are gone
    let new_end = span.end as i64 + offset;
    match role {
        Role::End => shift(value, offset),
        Role::Start | Role::Single if (value as i64) > new_end => {
            if role == Role::Start {
                Ok(Some((new_end + 1).max(0) as u32))
            } else {
                Ok(None)
            }
        }
        _ => Ok(Some(value)),
    }
}

struct RowExpansion {
    rows: Span,
    offset: i64,
}

impl ReferenceMapper for RowExpansion {
    fn map_row(&self, _sheet: Option<&str>, row: u32, role: Role) -> Result<Option<u32>, FormulaError> {
        expand_axis(row, self.rows, self.offset, role)
    }

    fn map_col(
        &self,
        _sheet: Option<&str>,
        _row: Option<u32>,
        col: u32,
        _role: Role,
    ) -> Result<Option<u32>, FormulaError> {
        Ok(Some(col))
    }
}

struct ColumnExpansion {
    cols: Span,
    offset: i64,
}

impl ReferenceMapper for ColumnExpansion {
    fn map_row(&self, _sheet: Option<&str>, row: u32, _role: Role) -> Result<Option<u32>, FormulaError> {
        Ok(Some(row))
    }

    fn map_col(
        &self,
        _sheet: Option<&str>,
        _row: Option<u32>,
        col: u32,
        role: Role,
    ) -> Result<Option<u32>, FormulaError> {
        expand_axis(col, self.cols, self.offset, role)
    }
}

struct Offset {
    rows: Option<Span>,
    delta_row: i64,
    delta_col: i64,
}

impl ReferenceMapper for Offset {
    fn map_row(&self, _sheet: Option<&str>, row: u32, _role: Role) -> Result<Option<u32>, FormulaError> {
        match self.rows {
            Some(span) if !span.contains(row) => Ok(Some(row)),
            _ => shift(row, self.delta_row),
        }
    }

    fn map_col(
        &self,
        _sheet: Option<&str>,
        _row: Option<u32>,
        col: u32,
        _role: Role,
    ) -> Result<Option<u32>, FormulaError> {
        shift(col, self.delta_col)
    }
}

/// Adjust a formula for `offset` extra rows inserted by a repeat block
/// spanning `rows` (0-based, inclusive).
///
/// Relative references after the block shift by `offset`; a range ending
/// inside the block grows to cover the inserted rows; single references
/// inside the block stay put. Rows locked with `$` never move.
pub fn adjust_for_row_expansion(formula: &str, rows: Span, offset: i64) -> Result<String, FormulaError> {
    if offset == 0 {
        return Ok(formula.to_string());
    }
    map_references(formula, &RowExpansion { rows, offset }, Locks::Respect)
}

/// Column counterpart of [`adjust_for_row_expansion`], used for RIGHT
/// regions.
pub fn adjust_for_column_expansion(
    formula: &str,
    cols: Span,
    offset: i64,
) -> Result<String, FormulaError> {
    if offset == 0 {
        return Ok(formula.to_string());
    }
    map_references(formula, &ColumnExpansion { cols, offset }, Locks::Respect)
}

/// Rewrite a formula living inside a repeated block for its `item_index`-th
/// copy: relative rows inside `block` move down by `item_index * block height`.
pub fn adjust_for_repeat_index(
    formula: &str,
    item_index: usize,
    block: Span,
) -> Result<String, FormulaError> {
    if item_index == 0 {
        return Ok(formula.to_string());
    }
    let delta_row = item_index as i64 * block.size() as i64;
    let mapper = Offset {
        rows: Some(block),
        delta_row,
        delta_col: 0,
    };
    map_references(formula, &mapper, Locks::Respect)
}

/// Move every relative reference by a fixed offset, as copying a formula from
/// one cell to another does. Used to expand shared formulas.
pub fn shift_formula(formula: &str, delta_row: i64, delta_col: i64) -> Result<String, FormulaError> {
    if delta_row == 0 && delta_col == 0 {
        return Ok(formula.to_string());
    }
    let mapper = Offset {
        rows: None,
        delta_row,
        delta_col,
    };
    map_references(formula, &mapper, Locks::Respect)
}

/// Format a reference to `range` on `sheet` for use in a formula.
pub fn qualified_range(sheet: &str, range: &crate::address::RangeRef, absolute: bool) -> String {
    let endpoint = |row: u32, col: u32| Endpoint {
        col: Some(col),
        row: Some(row),
        col_locked: absolute,
        row_locked: absolute,
    };
    let start = endpoint(range.start.row, range.start.col).format();
    let end = endpoint(range.end.row, range.end.col).format();
    format!("{}{start}:{end}", sheet_prefix(sheet))
}
