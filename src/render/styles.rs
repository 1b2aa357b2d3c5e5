//! Cell formats (`cellXfs`) of the output workbook.
//!
//! Template styles are reused by index. The only styles a rendering adds are
//! number-format variants of General styles, used for numeric values written
//! through `${...}` so integers and decimals display sensibly.

use crate::error::{Result, TemplateError};
use crate::xml::{attr_u32, local_name, reader};
use quick_xml::events::{BytesStart, Event};
use std::collections::HashMap;
use std::fmt::Write as _;

/// Built-in `0` format.
const FORMAT_INTEGER: u32 = 1;
/// Built-in `0.00` format.
const FORMAT_DECIMAL: u32 = 2;

#[derive(Debug, Clone)]
struct Xf {
    num_fmt_id: u32,
    /// Serialized `<xf>` element.
    xml: String,
}

/// Byte ranges of the `cellXfs` element within `styles.xml`.
#[derive(Debug, Clone, Copy)]
struct CellXfsSpan {
    open_start: usize,
    open_end: usize,
    close_start: usize,
}

#[derive(Debug, Default)]
pub struct StyleBook {
    xfs: Vec<Xf>,
    span: Option<CellXfsSpan>,
    derived: Vec<Xf>,
    lookup: HashMap<(u32, u32), u32>,
}

impl StyleBook {
    pub fn parse(part: &str, xml: &str) -> Result<Self> {
        let mut book = StyleBook::default();
        let mut reader = reader(xml);
        let mut in_cell_xfs = false;
        let mut open: Option<(usize, usize)> = None;
        let mut xf_start: Option<(usize, u32)> = None;
        let mut depth = 0usize;
        loop {
            let before = reader.buffer_position();
            let event = reader.read_event().map_err(|e| TemplateError::xml(part, e))?;
            let after = reader.buffer_position();
            match &event {
                Event::Start(e) => {
                    depth += 1;
                    let name = local_name(e);
                    if name == "cellXfs" && depth == 2 {
                        in_cell_xfs = true;
                        open = Some((before, after));
                    } else if in_cell_xfs && name == "xf" && depth == 3 {
                        xf_start = Some((before, num_fmt(e)));
                    }
                }
                Event::Empty(e) => {
                    let name = local_name(e);
                    if name == "cellXfs" && depth == 1 {
                        book.span = Some(CellXfsSpan {
                            open_start: before,
                            open_end: after,
                            close_start: after,
                        });
                    } else if in_cell_xfs && name == "xf" && depth == 2 {
                        book.xfs.push(Xf {
                            num_fmt_id: num_fmt(e),
                            xml: xml[before..after].to_string(),
                        });
                    }
                }
                Event::End(e) => {
                    let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                    if in_cell_xfs && name == "xf" && depth == 3 {
                        if let Some((start, num_fmt_id)) = xf_start.take() {
                            book.xfs.push(Xf {
                                num_fmt_id,
                                xml: xml[start..after].to_string(),
                            });
                        }
                    } else if name == "cellXfs" && depth == 2 {
                        in_cell_xfs = false;
                        if let Some((open_start, open_end)) = open {
                            book.span = Some(CellXfsSpan {
                                open_start,
                                open_end,
                                close_start: before,
                            });
                        }
                    }
                    depth = depth.saturating_sub(1);
                }
                Event::Eof => break,
                _ => {}
            }
        }
        Ok(book)
    }

    pub fn len(&self) -> usize {
        self.xfs.len() + self.derived.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn xf(&self, index: u32) -> Option<&Xf> {
        let index = index as usize;
        if index < self.xfs.len() {
            self.xfs.get(index)
        } else {
            self.derived.get(index - self.xfs.len())
        }
    }

    pub fn number_format(&self, style: u32) -> Option<u32> {
        self.xf(style).map(|xf| xf.num_fmt_id)
    }

    /// Style to use for a number written into a cell styled `style`. General
    /// styles get a derived variant with an integer or decimal format.
    pub fn numeric_style(&mut self, style: u32, integral: bool) -> u32 {
        let Some(base) = self.xf(style) else {
            return style;
        };
        if base.num_fmt_id != 0 || self.span.is_none() {
            return style;
        }
        let format = if integral { FORMAT_INTEGER } else { FORMAT_DECIMAL };
        if let Some(&index) = self.lookup.get(&(style, format)) {
            return index;
        }
        let xml = derive_xf(&base.xml, format);
        let index = self.len() as u32;
        self.derived.push(Xf {
            num_fmt_id: format,
            xml,
        });
        self.lookup.insert((style, format), index);
        index
    }

    pub fn has_derived(&self) -> bool {
        !self.derived.is_empty()
    }

    /// `styles.xml` with the derived formats appended to `cellXfs`.
    pub fn patch(&self, xml: &str) -> String {
        let Some(span) = self.span.filter(|_| self.has_derived()) else {
            return xml.to_string();
        };
        let open_tag = &xml[span.open_start..span.open_end];
        let self_closing = span.close_start == span.open_end && open_tag.ends_with("/>");
        let mut out = String::with_capacity(xml.len() + self.derived.len() * 96);
        out.push_str(&xml[..span.open_start]);
        let _ = write!(out, "<cellXfs count=\"{}\">", self.len());
        if !self_closing {
            out.push_str(&xml[span.open_end..span.close_start]);
        }
        for xf in &self.derived {
            out.push_str(&xf.xml);
        }
        if self_closing {
            out.push_str("</cellXfs>");
            out.push_str(&xml[span.open_end..]);
        } else {
            out.push_str(&xml[span.close_start..]);
        }
        out
    }
}

fn num_fmt(e: &BytesStart) -> u32 {
    attr_u32(e, b"numFmtId").unwrap_or(0)
}

/// Copy of an `<xf>` element with its number format replaced.
fn derive_xf(xf: &str, format: u32) -> String {
    let head_end = xf.find('>').unwrap_or(xf.len());
    let (head, tail) = xf.split_at(head_end);
    let self_closing = head.ends_with('/');
    let head = head.trim_end_matches('/');
    let mut attrs: Vec<String> = Vec::new();
    let mut rest = head.trim_start_matches("<xf").trim();
    while let Some(eq) = rest.find('=') {
        let key = rest[..eq].trim();
        let value_start = eq + 2;
        let quote = rest.as_bytes().get(eq + 1).copied().unwrap_or(b'"') as char;
        let Some(value_len) = rest[value_start..].find(quote) else {
            break;
        };
        let value = &rest[value_start..value_start + value_len];
        if key != "numFmtId" && key != "applyNumberFormat" {
            attrs.push(format!("{key}=\"{value}\""));
        }
        rest = rest[value_start + value_len + 1..].trim_start();
    }
    let mut out = format!("<xf numFmtId=\"{format}\"");
    for attr in attrs {
        out.push(' ');
        out.push_str(&attr);
    }
    out.push_str(" applyNumberFormat=\"1\"");
    if self_closing {
        out.push_str("/>");
    } else {
        out.push_str(tail);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const STYLES: &str = concat!(
        r#"<styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">"#,
        r#"<numFmts count="1"><numFmt numFmtId="164" formatCode="0.0%"/></numFmts>"#,
        r#"<cellStyleXfs count="1"><xf numFmtId="0" fontId="0"/></cellStyleXfs>"#,
        r#"<cellXfs count="3">"#,
        r#"<xf numFmtId="0" fontId="0" fillId="0" borderId="0" xfId="0"/>"#,
        r#"<xf numFmtId="0" fontId="1" fillId="0" borderId="0" xfId="0" applyFont="1"><alignment horizontal="center"/></xf>"#,
        r#"<xf numFmtId="164" fontId="0" fillId="0" borderId="0" xfId="0" applyNumberFormat="1"/>"#,
        r#"</cellXfs></styleSheet>"#
    );

    #[test]
    fn reads_cell_formats_only() {
        let book = StyleBook::parse("xl/styles.xml", STYLES).unwrap();
        assert_eq!(book.len(), 3);
        assert_eq!(book.number_format(2), Some(164));
        assert_eq!(book.number_format(1), Some(0));
    }

    #[test]
    fn general_styles_get_derived_number_formats() {
        let mut book = StyleBook::parse("xl/styles.xml", STYLES).unwrap();
        assert_eq!(book.numeric_style(2, true), 2);
        let int_style = book.numeric_style(1, true);
        let dec_style = book.numeric_style(1, false);
        assert_eq!((int_style, dec_style), (3, 4));
        assert_eq!(book.numeric_style(1, true), 3);
        assert_eq!(book.number_format(4), Some(FORMAT_DECIMAL));

        let patched = book.patch(STYLES);
        assert!(patched.contains(r#"<cellXfs count="5">"#));
        assert!(patched.contains(
            r#"<xf numFmtId="1" fontId="1" fillId="0" borderId="0" xfId="0" applyFont="1" applyNumberFormat="1"><alignment horizontal="center"/></xf>"#
        ));
        assert!(patched.ends_with("</cellXfs></styleSheet>"));
        assert!(StyleBook::parse("xl/styles.xml", &patched).unwrap().len() == 5);
    }

    #[test]
    fn untouched_styles_are_returned_verbatim() {
        let book = StyleBook::parse("xl/styles.xml", STYLES).unwrap();
        assert_eq!(book.patch(STYLES), STYLES);
    }
}
