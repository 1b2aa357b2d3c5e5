//! Small quick-xml helpers shared by the analyzer and the package writer.

use crate::error::{Result, TemplateError};
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesStart, Event};
use std::borrow::Cow;

/// Extract an attribute by its qualified name (`r:id`, `ref`).
pub fn attr(e: &BytesStart, key: &[u8]) -> Option<String> {
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() == key {
            return attr.unescape_value().ok().map(Cow::into_owned);
        }
    }
    None
}

/// Extract an attribute by local name, ignoring any namespace prefix.
pub fn attr_local(e: &BytesStart, key: &[u8]) -> Option<String> {
    for attr in e.attributes().flatten() {
        if attr.key.local_name().as_ref() == key {
            return attr.unescape_value().ok().map(Cow::into_owned);
        }
    }
    None
}

pub fn attr_u32(e: &BytesStart, key: &[u8]) -> Option<u32> {
    attr(e, key).and_then(|s| s.parse().ok())
}

pub fn attr_bool(e: &BytesStart, key: &[u8]) -> bool {
    attr(e, key).is_some_and(|s| matches!(s.as_str(), "1" | "true"))
}

pub fn local_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

/// Copy of `e` with the given attributes replaced (or appended when absent).
pub fn with_attrs(e: &BytesStart, overrides: &[(&str, &str)]) -> BytesStart<'static> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut elem = BytesStart::new(name);
    for a in e.attributes().with_checks(false).flatten() {
        let key = String::from_utf8_lossy(a.key.as_ref()).into_owned();
        if overrides.iter().any(|(k, _)| *k == key) {
            continue;
        }
        let value = a
            .unescape_value()
            .map(Cow::into_owned)
            .unwrap_or_else(|_| String::from_utf8_lossy(&a.value).into_owned());
        elem.push_attribute((key.as_str(), value.as_str()));
    }
    for (k, v) in overrides {
        elem.push_attribute((*k, *v));
    }
    elem
}

pub fn escape_text(text: &str) -> Cow<'_, str> {
    quick_xml::escape::escape(text)
}

fn is_xml_illegal(c: char) -> bool {
    matches!(c, '\u{0}'..='\u{8}' | '\u{b}' | '\u{c}' | '\u{e}'..='\u{1f}' | '\u{fffe}' | '\u{ffff}')
}

/// Whether `s` starts with an `_xHHHH_` escape sequence.
fn starts_with_hex_escape(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() >= 7
        && b[0] == b'_'
        && (b[1] == b'x' || b[1] == b'X')
        && b[2..6].iter().all(u8::is_ascii_hexdigit)
        && b[6] == b'_'
}

/// Escape a data value for an OOXML string element.
///
/// Control characters XML 1.0 cannot carry become `_xHHHH_`, and a literal
/// `_xHHHH_` in the value keeps its meaning by escaping its underscore.
pub fn escape_value_text(text: &str) -> Cow<'_, str> {
    if !text.chars().any(is_xml_illegal) && !text.contains("_x") && !text.contains("_X") {
        return escape_text(text);
    }
    let mut encoded = String::with_capacity(text.len() + 8);
    for (i, c) in text.char_indices() {
        if is_xml_illegal(c) {
            encoded.push_str(&format!("_x{:04X}_", c as u32));
        } else if c == '_' && starts_with_hex_escape(&text[i..]) {
            encoded.push_str("_x005F_");
        } else {
            encoded.push(c);
        }
    }
    Cow::Owned(escape_text(&encoded).into_owned())
}

pub fn reader(xml: &str) -> Reader<&[u8]> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(false);
    reader
}

pub fn as_utf8<'a>(part: &str, bytes: &'a [u8]) -> Result<&'a str> {
    std::str::from_utf8(bytes).map_err(|e| TemplateError::xml(part, e))
}

/// What a [`transform`] callback wants done with an event.
pub enum Action<'a> {
    /// Write the event unchanged.
    Keep,
    /// Write these events instead.
    Replace(Vec<Event<'a>>),
    /// Drop the event.
    Skip,
}

/// Stream `xml` through a reader/writer pair, letting `f` rewrite individual
/// events. The callback sees every event except `Eof`.
pub fn transform<'x, F>(part: &str, xml: &'x str, mut f: F) -> Result<String>
where
    F: FnMut(&Event<'x>) -> Result<Action<'x>>,
{
    let mut reader = reader(xml);
    let mut writer = Writer::new(Vec::with_capacity(xml.len() + 256));
    loop {
        let event = reader
            .read_event()
            .map_err(|e| TemplateError::xml(part, e))?;
        if matches!(event, Event::Eof) {
            break;
        }
        match f(&event)? {
            Action::Keep => writer
                .write_event(event)
                .map_err(|e| TemplateError::xml(part, e))?,
            Action::Replace(events) => {
                for replacement in events {
                    writer
                        .write_event(replacement)
                        .map_err(|e| TemplateError::xml(part, e))?;
                }
            }
            Action::Skip => {}
        }
    }
    String::from_utf8(writer.into_inner()).map_err(|e| TemplateError::xml(part, e))
}

/// Insert `fragment` right before the closing tag of the document root.
pub fn insert_before_root_end(xml: &str, fragment: &str) -> String {
    match xml.rfind("</") {
        Some(pos) => {
            let mut out = String::with_capacity(xml.len() + fragment.len());
            out.push_str(&xml[..pos]);
            out.push_str(fragment);
            out.push_str(&xml[pos..]);
            out
        }
        None => format!("{xml}{fragment}"),
    }
}
