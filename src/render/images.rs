//! Image placement: `${image...}` markers become pictures in the sheet's
//! drawing part, which is created when the sheet has none.

use super::fragments::map_area;
use crate::analyzer::Template;
use crate::analyzer::package::{REL_DRAWING, rels_path};
use crate::blueprint::{ImageMarkerSpec, SheetSpec};
use crate::data::{DataSource, ImageData, ImageFormat};
use crate::error::Result;
use crate::position::{PositionMap, WorkbookLayout};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use tracing::{debug, warn};

/// EMUs per pixel at 96 DPI.
pub const EMU_PER_PIXEL: u64 = 9_525;
pub const DEFAULT_IMAGE_SIZE: (u32, u32) = (96, 96);

pub const NS_SPREADSHEET_DRAWING: &str =
    "http://schemas.openxmlformats.org/drawingml/2006/spreadsheetDrawing";
pub const NS_DRAWING_MAIN: &str = "http://schemas.openxmlformats.org/drawingml/2006/main";
pub const NS_RELATIONSHIPS: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships";
pub const REL_TYPE_PREFIX: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/";
pub const CT_DRAWING: &str = "application/vnd.openxmlformats-officedocument.drawing+xml";

/// Package edits needed to place every image of a rendering.
#[derive(Debug, Default)]
pub struct ImagePlan {
    /// Parts that do not exist in the template.
    pub new_parts: BTreeMap<String, Vec<u8>>,
    /// Anchors appended to existing drawing parts.
    pub appended: BTreeMap<String, String>,
    /// Relationship elements appended to existing rels parts.
    pub relationships: BTreeMap<String, Vec<String>>,
    /// `<drawing>` elements for worksheets that had no drawing, by sheet part.
    pub sheet_drawings: BTreeMap<String, String>,
    /// `(extension, content type)` defaults the package must declare.
    pub defaults: BTreeSet<(String, String)>,
    /// Content type overrides for new parts.
    pub overrides: Vec<(String, String)>,
    pub placed: usize,
}

impl ImagePlan {
    pub fn is_empty(&self) -> bool {
        self.placed == 0
    }

    fn add_relationship(&mut self, template: &Template, rels_part: String, xml: String) {
        if template.package().contains(&rels_part) {
            self.relationships.entry(rels_part).or_default().push(xml);
        } else {
            let entry = self.new_parts.entry(rels_part).or_insert_with(|| {
                rels_document("").into_bytes()
            });
            let doc = String::from_utf8_lossy(entry).into_owned();
            *entry = crate::xml::insert_before_root_end(&doc, &xml).into_bytes();
        }
    }
}

/// Pixel size and cell position of one picture.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub from: (u32, u32),
    /// Bottom-right cell (exclusive) for two-cell anchors.
    pub to: Option<(u32, u32)>,
    pub size: (u32, u32),
}

pub fn placement(marker: &ImageMarkerSpec, image: &ImageData, map: &PositionMap) -> Option<Placement> {
    let single = marker.anchor.start == marker.anchor.end;
    if !single && marker.size.is_none() {
        let area = map_area(map, &marker.anchor)?;
        return Some(Placement {
            from: (area.start.row, area.start.col),
            to: Some((area.end.row + 1, area.end.col + 1)),
            size: image.dimensions().unwrap_or(DEFAULT_IMAGE_SIZE),
        });
    }
    let from = map.final_position(marker.anchor.start.row, marker.anchor.start.col)?;
    let size = marker
        .size
        .or_else(|| image.dimensions())
        .unwrap_or(DEFAULT_IMAGE_SIZE);
    Some(Placement {
        from,
        to: None,
        size,
    })
}

/// Serialize one picture anchor. Namespaces are declared on the anchor so it
/// can be appended to any drawing part.
pub fn anchor_xml(placement: &Placement, shape_id: u32, name: &str, rel_id: &str) -> String {
    let cx = placement.size.0 as u64 * EMU_PER_PIXEL;
    let cy = placement.size.1 as u64 * EMU_PER_PIXEL;
    let (row, col) = placement.from;
    let kind = if placement.to.is_some() {
        "twoCellAnchor"
    } else {
        "oneCellAnchor"
    };
    let mut xml = String::with_capacity(1024);
    let _ = write!(
        xml,
        "<xdr:{kind} xmlns:xdr=\"{NS_SPREADSHEET_DRAWING}\" xmlns:a=\"{NS_DRAWING_MAIN}\"{}>",
        if kind == "twoCellAnchor" { " editAs=\"oneCell\"" } else { "" }
    );
    let _ = write!(
        xml,
        "<xdr:from><xdr:col>{col}</xdr:col><xdr:colOff>0</xdr:colOff><xdr:row>{row}</xdr:row><xdr:rowOff>0</xdr:rowOff></xdr:from>"
    );
    match placement.to {
        Some((to_row, to_col)) => {
            let _ = write!(
                xml,
                "<xdr:to><xdr:col>{to_col}</xdr:col><xdr:colOff>0</xdr:colOff><xdr:row>{to_row}</xdr:row><xdr:rowOff>0</xdr:rowOff></xdr:to>"
            );
        }
        None => {
            let _ = write!(xml, "<xdr:ext cx=\"{cx}\" cy=\"{cy}\"/>");
        }
    }
    let _ = write!(
        xml,
        "<xdr:pic><xdr:nvPicPr><xdr:cNvPr id=\"{shape_id}\" name=\"{}\"/><xdr:cNvPicPr><a:picLocks noChangeAspect=\"1\"/></xdr:cNvPicPr></xdr:nvPicPr>",
        crate::xml::escape_text(name)
    );
    let _ = write!(
        xml,
        "<xdr:blipFill><a:blip xmlns:r=\"{NS_RELATIONSHIPS}\" r:embed=\"{rel_id}\"/><a:stretch><a:fillRect/></a:stretch></xdr:blipFill>"
    );
    let _ = write!(
        xml,
        "<xdr:spPr><a:xfrm><a:off x=\"0\" y=\"0\"/><a:ext cx=\"{cx}\" cy=\"{cy}\"/></a:xfrm><a:prstGeom prst=\"rect\"><a:avLst/></a:prstGeom></xdr:spPr></xdr:pic>"
    );
    let _ = write!(xml, "<xdr:clientData/></xdr:{kind}>");
    xml
}

pub fn relationship_xml(id: &str, kind: &str, target: &str) -> String {
    format!(
        "<Relationship Id=\"{id}\" Type=\"{REL_TYPE_PREFIX}{kind}\" Target=\"{}\"/>",
        crate::xml::escape_text(target)
    )
}

fn rels_document(body: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n<Relationships xmlns=\"http://schemas.openxmlformats.org/package/2006/relationships\">{body}</Relationships>"
    )
}

fn drawing_document(anchors: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n<xdr:wsDr xmlns:xdr=\"{NS_SPREADSHEET_DRAWING}\" xmlns:a=\"{NS_DRAWING_MAIN}\">{anchors}</xdr:wsDr>"
    )
}

/// First free `prefix{N}suffix` name in the package.
fn free_part_name(template: &Template, taken: &BTreeMap<String, Vec<u8>>, prefix: &str, suffix: &str) -> String {
    (1u32..)
        .map(|n| format!("{prefix}{n}{suffix}"))
        .find(|name| !template.package().contains(name) && !taken.contains_key(name))
        .unwrap_or_else(|| format!("{prefix}x{suffix}"))
}

fn existing_drawing(template: &Template, sheet: &SheetSpec) -> Result<Option<String>> {
    let Some(rel_id) = &sheet.drawing_rel else {
        return Ok(None);
    };
    Ok(template
        .package()
        .relationships(&sheet.part)?
        .into_iter()
        .find(|r| &r.id == rel_id && r.is(REL_DRAWING) && !r.external)
        .map(|r| r.target))
}

/// Work out every package edit needed for the images of a rendering.
pub fn plan_images(template: &Template, layout: &WorkbookLayout, data: &dyn DataSource) -> Result<ImagePlan> {
    let mut plan = ImagePlan::default();
    let mut media_counter = 0u32;
    for sheet in &template.blueprint().sheets {
        if sheet.images.is_empty() {
            continue;
        }
        let Some(map) = layout.get(&sheet.name) else {
            continue;
        };
        let mut anchors = String::new();
        let mut rels = Vec::new();
        for (i, marker) in sheet.images.iter().enumerate() {
            let Some(image) = data.image(&marker.name) else {
                continue;
            };
            let Some(placement) = placement(marker, &image, map) else {
                warn!(sheet = %sheet.name, image = %marker.name, "image anchor removed by layout; image skipped");
                continue;
            };
            media_counter += 1;
            let media = free_part_name(
                template,
                &plan.new_parts,
                "xl/media/template_image",
                &format!(".{}", image.format.extension()),
            );
            let rel_id = format!("rIdTplImg{media_counter}");
            anchors.push_str(&anchor_xml(&placement, 10_000 + i as u32, &marker.name, &rel_id));
            rels.push((rel_id, media.clone()));
            plan.defaults.insert((
                image.format.extension().to_string(),
                image.format.content_type().to_string(),
            ));
            if image.format == ImageFormat::Jpeg {
                plan.defaults.insert(("jpg".into(), image.format.content_type().into()));
            }
            plan.new_parts.insert(media, image.bytes);
            plan.placed += 1;
            debug!(sheet = %sheet.name, image = %marker.name, row = placement.from.0, col = placement.from.1, "image placed");
        }
        if rels.is_empty() {
            continue;
        }

        let drawing_part = match existing_drawing(template, sheet)? {
            Some(part) => {
                plan.appended.entry(part.clone()).or_default().push_str(&anchors);
                part
            }
            None => {
                let part = free_part_name(template, &plan.new_parts, "xl/drawings/drawing", ".xml");
                plan.new_parts
                    .insert(part.clone(), drawing_document(&anchors).into_bytes());
                plan.overrides.push((format!("/{part}"), CT_DRAWING.to_string()));
                let rel_id = "rIdTplDrawing1";
                plan.add_relationship(
                    template,
                    rels_path(&sheet.part),
                    relationship_xml(
                        rel_id,
                        REL_DRAWING,
                        &crate::analyzer::package::relative_target(&sheet.part, &part),
                    ),
                );
                plan.sheet_drawings.insert(
                    sheet.part.clone(),
                    format!("<drawing xmlns:r=\"{NS_RELATIONSHIPS}\" r:id=\"{rel_id}\"/>"),
                );
                part
            }
        };
        for (rel_id, media) in rels {
            plan.add_relationship(
                template,
                rels_path(&drawing_part),
                relationship_xml(
                    &rel_id,
                    crate::analyzer::package::REL_IMAGE,
                    &crate::analyzer::package::relative_target(&drawing_part, &media),
                ),
            );
        }
    }
    Ok(plan)
}
