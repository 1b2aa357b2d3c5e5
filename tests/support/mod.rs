#![allow(dead_code)]

use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::{TempDir, tempdir};
use umya_spreadsheet::{self, Spreadsheet, Worksheet};
use xlsx_template::{RenderConfig, Template, TemplateEngine};

/// 1x1 transparent PNG.
pub const PIXEL_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

pub fn write_workbook_to_path<F>(path: &Path, f: F)
where
    F: FnOnce(&mut Spreadsheet),
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create dir");
    }
    let mut book = umya_spreadsheet::new_file();
    f(&mut book);
    umya_spreadsheet::writer::xlsx::write(&book, path).expect("write workbook");
}

/// Build a template with umya and analyze it.
pub fn build_template<F>(f: F) -> Arc<Template>
where
    F: FnOnce(&mut Spreadsheet),
{
    let workspace = TestWorkspace::new();
    let path = workspace.create_workbook("template.xlsx", f);
    Template::open(&path).expect("analyze template")
}

pub fn sheet1(book: &mut Spreadsheet) -> &mut Worksheet {
    book.get_sheet_by_name_mut("Sheet1").expect("Sheet1")
}

pub struct TestWorkspace {
    _tempdir: TempDir,
    root: PathBuf,
}

impl TestWorkspace {
    pub fn new() -> Self {
        let tempdir = tempdir().expect("tempdir");
        let root = tempdir.path().to_path_buf();
        Self {
            _tempdir: tempdir,
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn create_workbook<F>(&self, name: &str, f: F) -> PathBuf
    where
        F: FnOnce(&mut Spreadsheet),
    {
        let path = self.path(name);
        write_workbook_to_path(&path, f);
        path
    }

    pub fn out_dir(&self) -> PathBuf {
        let dir = self.path("out");
        std::fs::create_dir_all(&dir).expect("create out dir");
        dir
    }

    /// Regular files in `dir`, sorted by name.
    pub fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .expect("read dir")
            .map(|entry| entry.expect("dir entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

pub fn engine(config: RenderConfig) -> TemplateEngine {
    TemplateEngine::new(config).expect("valid config")
}

pub fn read_output(bytes: &[u8]) -> Spreadsheet {
    umya_spreadsheet::reader::xlsx::read_reader(Cursor::new(bytes.to_vec()), true)
        .expect("rendered workbook is readable")
}

pub fn value(sheet: &Worksheet, cell: &str) -> String {
    sheet
        .get_cell(cell)
        .map(|c| c.get_value().to_string())
        .unwrap_or_default()
}

pub fn formula(sheet: &Worksheet, cell: &str) -> String {
    sheet
        .get_cell(cell)
        .map(|c| c.get_formula().to_string())
        .unwrap_or_default()
}

pub fn merges(sheet: &Worksheet) -> Vec<String> {
    let mut out: Vec<String> = sheet.get_merge_cells().iter().map(|r| r.get_range()).collect();
    out.sort();
    out
}

pub fn part_names(bytes: &[u8]) -> Vec<String> {
    let archive = zip::ZipArchive::new(Cursor::new(bytes)).expect("zip");
    archive.file_names().map(str::to_string).collect()
}

pub fn part_text(bytes: &[u8], name: &str) -> Option<String> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).expect("zip");
    let mut file = archive.by_name(name).ok()?;
    let mut text = String::new();
    file.read_to_string(&mut text).expect("utf-8 part");
    Some(text)
}

/// Every XML part of the package, concatenated.
pub fn all_xml(bytes: &[u8]) -> String {
    let mut out = String::new();
    for name in part_names(bytes) {
        if (name.ends_with(".xml") || name.ends_with(".rels"))
            && let Some(text) = part_text(bytes, &name)
        {
            out.push_str(&text);
        }
    }
    out
}

/// `numFmtId` of the cell format a rendered cell points at.
pub fn cell_num_fmt(bytes: &[u8], sheet_part: &str, cell: &str) -> Option<u32> {
    let sheet = part_text(bytes, sheet_part)?;
    let cell_re = regex::Regex::new(&format!(r#"<c r="{cell}"(?: s="(\d+)")?"#)).ok()?;
    let style: usize = match cell_re.captures(&sheet)?.get(1) {
        Some(s) => s.as_str().parse().ok()?,
        None => 0,
    };
    let styles = part_text(bytes, "xl/styles.xml")?;
    let cell_xfs = &styles[styles.find("<cellXfs")?..];
    let cell_xfs = &cell_xfs[..cell_xfs.find("</cellXfs>")?];
    let xf = regex::Regex::new(r"<xf\b[^>]*").ok()?.find_iter(cell_xfs).nth(style)?;
    let id = regex::Regex::new(r#"numFmtId="(\d+)""#).ok()?;
    Some(
        id.captures(xf.as_str())
            .and_then(|c| c[1].parse().ok())
            .unwrap_or(0),
    )
}
