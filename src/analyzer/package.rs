//! Reading the xlsx (OPC) package: parts, relationships, workbook sheet list
//! and the shared-string table.

use crate::error::{Result, TemplateError};
use crate::xml::{as_utf8, attr, attr_local, reader};
use indexmap::IndexMap;
use quick_xml::events::Event;
use std::io::{Cursor, Read};
use zip::ZipArchive;

pub const REL_OFFICE_DOCUMENT: &str = "officeDocument";
pub const REL_WORKSHEET: &str = "worksheet";
pub const REL_SHARED_STRINGS: &str = "sharedStrings";
pub const REL_STYLES: &str = "styles";
pub const REL_DRAWING: &str = "drawing";
pub const REL_CHART: &str = "chart";
pub const REL_IMAGE: &str = "image";
pub const REL_PIVOT_TABLE: &str = "pivotTable";
pub const REL_PIVOT_CACHE: &str = "pivotCacheDefinition";
pub const REL_TABLE: &str = "table";
pub const REL_COMMENTS: &str = "comments";
pub const REL_CALC_CHAIN: &str = "calcChain";
pub const REL_CORE_PROPERTIES: &str = "core-properties";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    pub id: String,
    /// Full relationship type URI.
    pub rel_type: String,
    /// Target as written in the rels part.
    pub raw_target: String,
    /// Target resolved to a package path (no leading `/`); equal to
    /// `raw_target` for external targets.
    pub target: String,
    pub external: bool,
}

impl Relationship {
    /// Compare the last segment of the relationship type URI.
    pub fn is(&self, kind: &str) -> bool {
        self.rel_type.rsplit('/').next() == Some(kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetEntry {
    pub name: String,
    pub sheet_id: u32,
    pub rel_id: String,
    pub part: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkbookInfo {
    pub part: String,
    pub sheets: Vec<SheetEntry>,
    pub shared_strings: Option<String>,
    pub styles: Option<String>,
}

/// Every entry of the template zip, in archive order.
#[derive(Debug, Clone)]
pub struct TemplatePackage {
    parts: IndexMap<String, Vec<u8>>,
}

impl TemplatePackage {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut archive = ZipArchive::new(Cursor::new(bytes))?;
        let mut parts = IndexMap::with_capacity(archive.len());
        for i in 0..archive.len() {
            let mut file = archive.by_index(i)?;
            if file.is_dir() {
                continue;
            }
            let name = file.name().trim_start_matches('/').to_string();
            let mut data = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut data)?;
            parts.insert(name, data);
        }
        if !parts.contains_key("[Content_Types].xml") {
            return Err(TemplateError::template(
                "not an xlsx package: [Content_Types].xml is missing",
            ));
        }
        Ok(Self { parts })
    }

    pub fn part(&self, name: &str) -> Option<&[u8]> {
        self.parts.get(name).map(Vec::as_slice)
    }

    pub fn part_str(&self, name: &str) -> Result<Option<&str>> {
        self.part(name).map(|bytes| as_utf8(name, bytes)).transpose()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.parts.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.parts.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.parts.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Relationships declared by `part` (empty when it has no rels part).
    pub fn relationships(&self, part: &str) -> Result<Vec<Relationship>> {
        let rels_part = rels_path(part);
        match self.part_str(&rels_part)? {
            Some(xml) => parse_relationships(&rels_part, xml, part),
            None => Ok(Vec::new()),
        }
    }

    pub fn workbook(&self) -> Result<WorkbookInfo> {
        let root_rels = self.relationships("")?;
        let workbook_part = root_rels
            .iter()
            .find(|r| r.is(REL_OFFICE_DOCUMENT))
            .map(|r| r.target.clone())
            .unwrap_or_else(|| "xl/workbook.xml".to_string());
        let xml = self.part_str(&workbook_part)?.ok_or_else(|| {
            TemplateError::template(format!("workbook part '{workbook_part}' is missing"))
        })?;
        let rels = self.relationships(&workbook_part)?;

        let mut sheets = Vec::new();
        let mut reader = reader(xml);
        loop {
            match reader
                .read_event()
                .map_err(|e| TemplateError::xml(&workbook_part, e))?
            {
                Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"sheet" => {
                    let name = attr(&e, b"name").unwrap_or_default();
                    let rel_id = attr_local(&e, b"id").unwrap_or_default();
                    let sheet_id = attr(&e, b"sheetId")
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0);
                    let part = rels
                        .iter()
                        .find(|r| r.id == rel_id && r.is(REL_WORKSHEET))
                        .map(|r| r.target.clone());
                    // chartsheets and dialog sheets carry no cells
                    if let Some(part) = part {
                        sheets.push(SheetEntry {
                            name,
                            sheet_id,
                            rel_id,
                            part,
                        });
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(WorkbookInfo {
            shared_strings: rels
                .iter()
                .find(|r| r.is(REL_SHARED_STRINGS))
                .map(|r| r.target.clone()),
            styles: rels
                .iter()
                .find(|r| r.is(REL_STYLES))
                .map(|r| r.target.clone()),
            part: workbook_part,
            sheets,
        })
    }

    /// Plain text of every `<si>` entry of the shared-string table.
    pub fn shared_strings(&self, part: Option<&str>) -> Result<Vec<String>> {
        let Some(part) = part else {
            return Ok(Vec::new());
        };
        let Some(xml) = self.part_str(part)? else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        let mut reader = reader(xml);
        let mut current: Option<String> = None;
        let mut in_text = false;
        // phonetic runs (<rPh>) are not part of the value
        let mut in_phonetic = false;
        loop {
            match reader.read_event().map_err(|e| TemplateError::xml(part, e))? {
                Event::Start(e) => match e.local_name().as_ref() {
                    b"si" => current = Some(String::new()),
                    b"t" => in_text = true,
                    b"rPh" => in_phonetic = true,
                    _ => {}
                },
                Event::Empty(e) if e.local_name().as_ref() == b"si" => out.push(String::new()),
                Event::Text(t) if in_text && !in_phonetic => {
                    if let Some(current) = current.as_mut() {
                        let text = t.unescape().map_err(|e| TemplateError::xml(part, e))?;
                        current.push_str(&text);
                    }
                }
                Event::End(e) => match e.local_name().as_ref() {
                    b"si" => out.push(current.take().unwrap_or_default()),
                    b"t" => in_text = false,
                    b"rPh" => in_phonetic = false,
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
        }
        Ok(out)
    }
}

/// `xl/worksheets/sheet1.xml` -> `xl/worksheets/_rels/sheet1.xml.rels`;
/// the package root (`""`) maps to `_rels/.rels`.
pub fn rels_path(part: &str) -> String {
    match part.rsplit_once('/') {
        Some((dir, file)) => format!("{dir}/_rels/{file}.rels"),
        None if part.is_empty() => "_rels/.rels".to_string(),
        None => format!("_rels/{part}.rels"),
    }
}

/// Resolve a relationship target against the part that declares it.
pub fn resolve_target(source_part: &str, target: &str) -> String {
    if let Some(absolute) = target.strip_prefix('/') {
        return absolute.to_string();
    }
    let base_dir = source_part.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
    let mut segments: Vec<&str> = if base_dir.is_empty() {
        Vec::new()
    } else {
        base_dir.split('/').collect()
    };
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

/// Relative target from `source_part`'s directory to `target_part`.
pub fn relative_target(source_part: &str, target_part: &str) -> String {
    let base: Vec<&str> = source_part
        .rsplit_once('/')
        .map(|(d, _)| d.split('/').collect())
        .unwrap_or_default();
    let target: Vec<&str> = target_part.split('/').collect();
    let common = base
        .iter()
        .zip(target.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut out: Vec<&str> = vec![".."; base.len() - common];
    out.extend(&target[common..]);
    out.join("/")
}

fn parse_relationships(rels_part: &str, xml: &str, source_part: &str) -> Result<Vec<Relationship>> {
    let mut out = Vec::new();
    let mut reader = reader(xml);
    loop {
        match reader
            .read_event()
            .map_err(|e| TemplateError::xml(rels_part, e))?
        {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"Relationship" => {
                let id = attr(&e, b"Id").unwrap_or_default();
                let rel_type = attr(&e, b"Type").unwrap_or_default();
                let raw_target = attr(&e, b"Target").unwrap_or_default();
                let external = attr(&e, b"TargetMode").is_some_and(|m| m == "External");
                let target = if external {
                    raw_target.clone()
                } else {
                    resolve_target(source_part, &raw_target)
                };
                out.push(Relationship {
                    id,
                    rel_type,
                    raw_target,
                    target,
                    external,
                });
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(out)
}
