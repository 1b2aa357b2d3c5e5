//! Marker grammar.
//!
//! ```text
//! ${path}                                   variable (path = ident(.ident)*)
//! ${image.name}                             image anchored at the marker cell
//! ${repeat(collection, range, var?, dir?, empty?)}
//! ${size(collection)}
//! ${image(name, anchor, WxH?)}
//! TBEG_REPEAT(...) / TBEG_SIZE(...) / TBEG_IMAGE(...)   as a whole-cell formula
//! ```

use crate::address::RangeRef;
use crate::blueprint::{Direction, TextPart};
use once_cell::sync::Lazy;
use regex::Regex;

static PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$").expect("valid path regex")
});

static FUNCTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^([A-Za-z_]+)\s*\((.*)\)$").expect("valid function regex")
});

static FORMULA_FN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^\s*=?\s*TBEG_(REPEAT|SIZE|IMAGE)\s*\((.*)\)\s*$")
        .expect("valid formula marker regex")
});

#[derive(Debug, Clone, PartialEq)]
pub struct RepeatArgs {
    pub collection: String,
    pub range: RangeRef,
    pub variable: Option<String>,
    pub direction: Direction,
    pub empty_range: Option<RangeRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageArgs {
    pub name: String,
    pub anchor: Option<RangeRef>,
    pub size: Option<(u32, u32)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Marker {
    Variable(String),
    Size(String),
    Repeat(RepeatArgs),
    Image(ImageArgs),
}

/// Cell text with its structural markers taken out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedText {
    /// Remaining text, with variable and size substitutions.
    pub parts: Vec<TextPart>,
    /// Repeat and image markers removed from the text.
    pub structural: Vec<Marker>,
}

impl ParsedText {
    pub fn has_markers(&self) -> bool {
        !self.structural.is_empty()
            || self
                .parts
                .iter()
                .any(|p| !matches!(p, TextPart::Literal(_)))
    }

    /// Remaining literal text when no substitution is left.
    pub fn literal(&self) -> Option<String> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                TextPart::Literal(text) => out.push_str(text),
                _ => return None,
            }
        }
        Some(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct MarkerError(pub String);

type MarkerResult<T> = std::result::Result<T, MarkerError>;

pub fn contains_marker(text: &str) -> bool {
    text.contains("${")
}

/// Split cell text into literal runs and markers.
pub fn parse_text(text: &str) -> MarkerResult<ParsedText> {
    let mut parsed = ParsedText::default();
    let mut literal = String::new();
    let mut rest = text;

    while let Some(start) = rest.find("${") {
        literal.push_str(&rest[..start]);
        let body_start = start + 2;
        let body_len = find_marker_end(&rest[body_start..])
            .ok_or_else(|| MarkerError(format!("unterminated marker in '{text}'")))?;
        let body = &rest[body_start..body_start + body_len];
        rest = &rest[body_start + body_len + 1..];

        match parse_body(body)? {
            marker @ (Marker::Repeat(_) | Marker::Image(_)) => parsed.structural.push(marker),
            Marker::Variable(path) => {
                flush_literal(&mut parsed.parts, &mut literal);
                parsed.parts.push(TextPart::Variable(path));
            }
            Marker::Size(collection) => {
                flush_literal(&mut parsed.parts, &mut literal);
                parsed.parts.push(TextPart::Size(collection));
            }
        }
    }
    literal.push_str(rest);
    flush_literal(&mut parsed.parts, &mut literal);

    // a cell whose only other content was whitespace around a structural
    // marker renders blank
    if !parsed.structural.is_empty()
        && parsed
            .parts
            .iter()
            .all(|p| matches!(p, TextPart::Literal(t) if t.trim().is_empty()))
    {
        parsed.parts.clear();
    }
    Ok(parsed)
}

/// Recognise the formula form (`TBEG_REPEAT(...)`) of a function marker.
pub fn parse_formula_marker(formula: &str) -> Option<MarkerResult<Marker>> {
    let caps = FORMULA_FN_RE.captures(formula)?;
    let name = caps.get(1)?.as_str().to_ascii_lowercase();
    let args = caps.get(2)?.as_str();
    Some(parse_function(&name, args))
}

fn flush_literal(parts: &mut Vec<TextPart>, literal: &mut String) {
    if !literal.is_empty() {
        parts.push(TextPart::Literal(std::mem::take(literal)));
    }
}

/// Byte length of a marker body up to its closing `}`, skipping quoted text.
fn find_marker_end(body: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, ch) in body.char_indices() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => {}
            None => match ch {
                '"' | '\'' => quote = Some(ch),
                '}' => return Some(i),
                _ => {}
            },
        }
    }
    None
}

fn parse_body(body: &str) -> MarkerResult<Marker> {
    let body = body.trim();
    if body.is_empty() {
        return Err(MarkerError("empty marker '${}'".to_string()));
    }
    if let Some(caps) = FUNCTION_RE.captures(body) {
        let name = caps
            .get(1)
            .map(|m| m.as_str().to_ascii_lowercase())
            .unwrap_or_default();
        let args = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        return parse_function(&name, args);
    }
    if !PATH_RE.is_match(body) {
        return Err(MarkerError(format!("invalid marker '${{{body}}}'")));
    }
    if let Some(name) = body.strip_prefix("image.") {
        return Ok(Marker::Image(ImageArgs {
            name: name.to_string(),
            anchor: None,
            size: None,
        }));
    }
    Ok(Marker::Variable(body.to_string()))
}

fn parse_function(name: &str, args: &str) -> MarkerResult<Marker> {
    let args = split_args(args)?;
    match name {
        "repeat" => parse_repeat(&args).map(Marker::Repeat),
        "size" => match args.as_slice() {
            [(None, collection)] if is_identifier(collection) => {
                Ok(Marker::Size(collection.clone()))
            }
            _ => Err(MarkerError(
                "size() expects exactly one collection name".to_string(),
            )),
        },
        "image" => parse_image(&args).map(Marker::Image),
        other => Err(MarkerError(format!("unknown marker function '{other}'"))),
    }
}

type Arg = (Option<String>, String);

/// Split a comma separated argument list. Values may be quoted with `"` or
/// `'`; `key=value` pairs keep their key.
fn split_args(args: &str) -> MarkerResult<Vec<Arg>> {
    let mut out = Vec::new();
    if args.trim().is_empty() {
        return Ok(out);
    }
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for ch in args.chars() {
        match quote {
            Some(q) if ch == q => {
                quote = None;
                current.push(ch);
            }
            Some(_) => current.push(ch),
            None => match ch {
                '"' | '\'' => {
                    quote = Some(ch);
                    current.push(ch);
                }
                ',' => out.push(split_key(&std::mem::take(&mut current))),
                _ => current.push(ch),
            },
        }
    }
    if quote.is_some() {
        return Err(MarkerError("unterminated quote in marker arguments".to_string()));
    }
    out.push(split_key(&current));
    Ok(out)
}

fn split_key(raw: &str) -> Arg {
    let raw = raw.trim();
    if !raw.starts_with(['"', '\''])
        && let Some((key, value)) = raw.split_once('=')
        && is_identifier(key.trim())
    {
        return (Some(key.trim().to_ascii_lowercase()), unquote(value.trim()));
    }
    (None, unquote(raw))
}

fn unquote(value: &str) -> String {
    for q in ['"', '\''] {
        if value.len() >= 2
            && let Some(inner) = value.strip_prefix(q).and_then(|v| v.strip_suffix(q))
        {
            return inner.to_string();
        }
    }
    value.to_string()
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_range(value: &str, what: &str) -> MarkerResult<RangeRef> {
    RangeRef::parse(value).ok_or_else(|| MarkerError(format!("invalid {what} '{value}'")))
}

fn parse_repeat(args: &[Arg]) -> MarkerResult<RepeatArgs> {
    const POSITIONS: [&str; 5] = ["collection", "range", "variable", "direction", "emptyrange"];
    let mut slots: [Option<String>; 5] = Default::default();
    for (index, (key, value)) in args.iter().enumerate() {
        let slot = match key.as_deref() {
            None => {
                if index >= POSITIONS.len() {
                    return Err(MarkerError("repeat() takes at most 5 arguments".to_string()));
                }
                index
            }
            Some("collection" | "items") => 0,
            Some("range") => 1,
            Some("var" | "variable") => 2,
            Some("direction" | "dir") => 3,
            Some("empty" | "emptyrange") => 4,
            Some(other) => {
                return Err(MarkerError(format!("unknown repeat() argument '{other}'")));
            }
        };
        if !value.is_empty() {
            slots[slot] = Some(value.clone());
        }
    }

    let collection = slots[0]
        .take()
        .filter(|c| is_identifier(c))
        .ok_or_else(|| MarkerError("repeat() needs a collection name".to_string()))?;
    let range = slots[1]
        .take()
        .ok_or_else(|| MarkerError("repeat() needs a target range".to_string()))
        .and_then(|r| parse_range(&r, "repeat range"))?;
    let variable = match slots[2].take() {
        Some(v) if is_identifier(&v) => Some(v),
        Some(v) => return Err(MarkerError(format!("invalid repeat variable '{v}'"))),
        None => None,
    };
    let direction = match slots[3].take() {
        Some(d) => d
            .parse::<Direction>()
            .map_err(|_| MarkerError(format!("invalid repeat direction '{d}'")))?,
        None => Direction::Down,
    };
    let empty_range = slots[4]
        .take()
        .map(|r| parse_range(&r, "empty range"))
        .transpose()?;

    Ok(RepeatArgs {
        collection,
        range,
        variable,
        direction,
        empty_range,
    })
}

fn parse_image(args: &[Arg]) -> MarkerResult<ImageArgs> {
    let values: Vec<&str> = args.iter().map(|(_, v)| v.as_str()).collect();
    let (name, anchor, size) = match values.as_slice() {
        [name] => (*name, None, None),
        [name, anchor] => (*name, Some(*anchor), None),
        [name, anchor, size] => (*name, Some(*anchor), Some(*size)),
        _ => {
            return Err(MarkerError(
                "image() expects name, anchor and an optional size".to_string(),
            ));
        }
    };
    if name.is_empty() {
        return Err(MarkerError("image() needs a name".to_string()));
    }
    let anchor = anchor
        .filter(|a| !a.is_empty())
        .map(|a| parse_range(a, "image anchor"))
        .transpose()?;
    let size = size.map(parse_size).transpose()?;
    Ok(ImageArgs {
        name: name.to_string(),
        anchor,
        size,
    })
}

fn parse_size(text: &str) -> MarkerResult<(u32, u32)> {
    let invalid = || MarkerError(format!("invalid image size '{text}', expected WxH"));
    let (w, h) = text
        .split_once(['x', 'X'])
        .ok_or_else(invalid)?;
    let w: u32 = w.trim().parse().map_err(|_| invalid())?;
    let h: u32 = h.trim().parse().map_err(|_| invalid())?;
    if w == 0 || h == 0 {
        return Err(invalid());
    }
    Ok((w, h))
}
