//! Template Analyzer: turns template bytes into an immutable [`Template`].

pub mod markers;
pub mod package;
pub mod sheet;

use crate::blueprint::{Blueprint, Requirements, TextPart};
use crate::error::{Result, TemplateError};
use crate::position::validate_regions;
use markers::{contains_marker, parse_text};
use package::{TemplatePackage, WorkbookInfo};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// An analyzed template: the blueprint plus the package it was read from.
///
/// Built once, never mutated, shared as `Arc<Template>` by every rendering.
#[derive(Debug)]
pub struct Template {
    blueprint: Blueprint,
    package: TemplatePackage,
    workbook: WorkbookInfo,
    marked_parts: BTreeMap<String, BTreeSet<String>>,
}

impl Template {
    pub fn blueprint(&self) -> &Blueprint {
        &self.blueprint
    }

    pub fn package(&self) -> &TemplatePackage {
        &self.package
    }

    pub fn workbook(&self) -> &WorkbookInfo {
        &self.workbook
    }

    /// Drawing and chart parts whose text holds markers, with the variable
    /// paths they use.
    pub fn marked_parts(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.marked_parts
    }

    pub fn requirements(&self) -> &Requirements {
        &self.blueprint.requirements
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let bytes = std::fs::read(path.as_ref())?;
        analyze(&bytes)
    }
}

/// Analyze a template document.
pub fn analyze(bytes: &[u8]) -> Result<Arc<Template>> {
    let package = TemplatePackage::from_bytes(bytes)?;
    let workbook = package.workbook()?;
    if workbook.sheets.is_empty() {
        return Err(TemplateError::template("template has no worksheets"));
    }
    let shared_strings = package.shared_strings(workbook.shared_strings.as_deref())?;

    let mut sheets = Vec::with_capacity(workbook.sheets.len());
    let mut requirements = Requirements::default();
    for entry in &workbook.sheets {
        let xml = package.part_str(&entry.part)?.ok_or_else(|| {
            TemplateError::template(format!(
                "worksheet part '{}' of sheet '{}' is missing",
                entry.part, entry.name
            ))
        })?;
        let analysis = sheet::parse_sheet(entry, xml, &shared_strings)?;
        validate_regions(&analysis.spec.regions).map_err(|e| e.in_sheet(&entry.name))?;

        requirements
            .variables
            .extend(analysis.free_variables().map(str::to_string));
        requirements.collections.extend(analysis.sized.iter().cloned());
        requirements
            .collections
            .extend(analysis.spec.regions.iter().map(|r| r.collection.clone()));
        requirements
            .images
            .extend(analysis.spec.images.iter().map(|i| i.name.clone()));
        sheets.push(analysis.spec);
    }

    let marked_parts = scan_graphic_parts(&package)?;
    for variables in marked_parts.values() {
        requirements.variables.extend(variables.iter().cloned());
    }

    let blueprint = Blueprint {
        sheets,
        requirements,
    };
    info!(
        sheets = blueprint.sheets.len(),
        regions = blueprint.sheets.iter().map(|s| s.regions.len()).sum::<usize>(),
        variables = blueprint.requirements.variables.len(),
        collections = blueprint.requirements.collections.len(),
        "template analyzed"
    );

    Ok(Arc::new(Template {
        blueprint,
        package,
        workbook,
        marked_parts,
    }))
}

/// Drawing and chart parts may carry variable markers in their text runs.
fn scan_graphic_parts(package: &TemplatePackage) -> Result<BTreeMap<String, BTreeSet<String>>> {
    let mut out = BTreeMap::new();
    for (name, bytes) in package.iter() {
        if !is_graphic_part(name) {
            continue;
        }
        let Ok(xml) = std::str::from_utf8(bytes) else {
            continue;
        };
        if !contains_marker(xml) {
            continue;
        }
        let parsed = parse_text(xml)
            .map_err(|e| TemplateError::template(format!("{name}: {e}")))?;
        if !parsed.structural.is_empty() {
            warn!(
                part = %name,
                markers = parsed.structural.len(),
                "structural markers in drawing text are removed"
            );
        }
        let mut variables = BTreeSet::new();
        for part in parsed.parts {
            match part {
                TextPart::Variable(path) => {
                    variables.insert(path);
                }
                TextPart::Size(collection) => {
                    warn!(part = %name, collection = %collection, "size marker in drawing text is removed");
                }
                TextPart::Literal(_) => {}
            }
        }
        out.insert(name.to_string(), variables);
    }
    Ok(out)
}

pub(crate) fn is_graphic_part(name: &str) -> bool {
    (name.starts_with("xl/drawings/") || name.starts_with("xl/charts/"))
        && name.ends_with(".xml")
        && !name.contains("/_rels/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graphic_parts_are_recognised() {
        assert!(is_graphic_part("xl/drawings/drawing1.xml"));
        assert!(is_graphic_part("xl/charts/chart2.xml"));
        assert!(!is_graphic_part("xl/drawings/_rels/drawing1.xml.rels"));
        assert!(!is_graphic_part("xl/worksheets/sheet1.xml"));
    }

    #[test]
    fn garbage_is_not_a_template() {
        assert!(analyze(b"definitely not a zip").is_err());
    }
}
