//! Writes the output package: planning, mode selection, worksheets, then
//! every other template part patched or copied.

use super::context::{Collections, Globals, check_requirements};
use super::fragments::FragmentContext;
use super::images::{ImagePlan, plan_images};
use super::parts::{
    self, CALC_CHAIN_PART, CORE_PART, CT_CORE, ColumnStatsBook, PartContext, PivotPlan,
};
use super::sheet::{Progress, RenderInputs, RowProducer, SheetShell};
use super::sink::{MemorySheet, RowSink, StreamingSheetWriter};
use super::styles::StyleBook;
use super::{ProgressSink, RenderMode, RenderReport};
use crate::analyzer::Template;
use crate::analyzer::package::rels_path;
use crate::blueprint::Direction;
use crate::config::{RenderConfig, StreamingMode};
use crate::data::DataSource;
use crate::error::{Result, TemplateError};
use crate::position::{PositionMap, WorkbookLayout};
use std::collections::{BTreeSet, HashSet};
use std::io::{Seek, Write};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use zip::ZipWriter;
use zip::write::FileOptions;

const CONTENT_TYPES_PART: &str = "[Content_Types].xml";
const ROOT_RELS_PART: &str = "_rels/.rels";
const CORE_REL: &str = "<Relationship Id=\"rIdTplCore\" Type=\"http://schemas.openxmlformats.org/package/2006/relationships/metadata/core-properties\" Target=\"docProps/core.xml\"/>";

/// Optional observers of one rendering.
#[derive(Clone, Copy, Default)]
pub struct RenderHooks<'h> {
    pub progress: Option<&'h dyn ProgressSink>,
    pub cancel: Option<&'h CancellationToken>,
}

/// How a template part is treated when copied into the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartKind {
    Worksheet,
    ContentTypes,
    CalcChain,
    Workbook,
    Styles,
    SharedStrings,
    Relationships,
    PivotCache,
    PivotTable,
    Drawing,
    Vml,
    Chart,
    Table,
    Comments,
    Core,
    Other,
}

fn classify(name: &str, template: &Template, worksheets: &HashSet<&str>) -> PartKind {
    let workbook = template.workbook();
    if worksheets.contains(name) {
        return PartKind::Worksheet;
    }
    if name == workbook.part {
        return PartKind::Workbook;
    }
    if workbook.styles.as_deref() == Some(name) {
        return PartKind::Styles;
    }
    if workbook.shared_strings.as_deref() == Some(name) {
        return PartKind::SharedStrings;
    }
    match name {
        CONTENT_TYPES_PART => return PartKind::ContentTypes,
        CALC_CHAIN_PART => return PartKind::CalcChain,
        CORE_PART => return PartKind::Core,
        _ => {}
    }
    let xml = name.ends_with(".xml");
    if name.ends_with(".rels") {
        PartKind::Relationships
    } else if xml && name.starts_with("xl/pivotCache/pivotCacheDefinition") {
        PartKind::PivotCache
    } else if xml && name.starts_with("xl/pivotTables/") {
        PartKind::PivotTable
    } else if xml && name.starts_with("xl/drawings/") && !name.contains("/_rels/") {
        PartKind::Drawing
    } else if name.starts_with("xl/drawings/") && name.ends_with(".vml") {
        PartKind::Vml
    } else if xml && name.starts_with("xl/charts/chart") {
        PartKind::Chart
    } else if xml && name.starts_with("xl/tables/") {
        PartKind::Table
    } else if xml && name.starts_with("xl/comments") {
        PartKind::Comments
    } else {
        PartKind::Other
    }
}

/// Everything decided before the first byte is written.
struct Plan<'d> {
    layout: WorkbookLayout,
    collections: Collections<'d>,
    mode: RenderMode,
    planned_rows: u64,
}

fn layout_for(template: &Template, collections: &Collections<'_>) -> Result<(WorkbookLayout, u64)> {
    let mut layout = WorkbookLayout::new();
    let mut planned_rows = 0u64;
    for sheet in &template.blueprint().sheets {
        let template_rows = sheet.last_row.map_or(0, |r| r + 1);
        let map = PositionMap::calculate(&sheet.regions, collections.sizes(), template_rows)
            .map_err(|e| e.in_sheet(&sheet.name))?;
        planned_rows += u64::from(map.total_rows());
        layout.insert(sheet.name.clone(), map);
    }
    Ok((layout, planned_rows))
}

fn plan<'d>(template: &Template, data: &'d dyn DataSource, config: &RenderConfig) -> Result<Plan<'d>> {
    let blueprint = template.blueprint();
    let names = &blueprint.requirements.collections;
    let mut materialize: BTreeSet<String> = blueprint
        .sheets
        .iter()
        .flat_map(|s| s.regions.iter())
        .filter(|r| r.direction == Direction::Right)
        .map(|r| r.collection.clone())
        .collect();
    if config.streaming == StreamingMode::Off {
        materialize.extend(names.iter().cloned());
    }
    let mut collections = Collections::plan(data, names, &materialize);
    let (mut layout, mut planned_rows) = layout_for(template, &collections)?;

    let mode = match config.streaming {
        StreamingMode::On => RenderMode::Streaming,
        StreamingMode::Off => RenderMode::Memory,
        StreamingMode::Auto if planned_rows > config.streaming_threshold_rows as u64 => {
            RenderMode::Streaming
        }
        StreamingMode::Auto => RenderMode::Memory,
    };
    // memory renders work from exact counts, not size hints
    if mode == RenderMode::Memory && !names.is_subset(&materialize) {
        collections = Collections::plan(data, names, names);
        (layout, planned_rows) = layout_for(template, &collections)?;
    }
    info!(
        mode = %mode,
        planned_rows,
        threshold = config.streaming_threshold_rows,
        "render mode selected"
    );
    Ok(Plan {
        layout,
        collections,
        mode,
        planned_rows,
    })
}

/// Render `template` with `data` into a zip package written to `out`.
pub fn write_package<W: Write + Seek>(
    template: &Template,
    data: &dyn DataSource,
    config: &RenderConfig,
    hooks: RenderHooks<'_>,
    out: W,
) -> Result<RenderReport> {
    let started = Instant::now();
    let missing = check_requirements(template.requirements(), data, config.missing_data)?;
    let Plan {
        layout,
        collections,
        mode,
        planned_rows,
    } = plan(template, data, config)?;
    let globals = Globals::resolve(data, template.requirements(), collections.sizes());
    let images = plan_images(template, &layout, data)?;
    let pivots = PivotPlan::build(template, &layout)?;
    let owners = parts::sheet_owners(template)?;
    let package = template.package();
    let workbook = template.workbook();

    let mut styles = match workbook.styles.as_deref() {
        Some(part) => match package.part_str(part)? {
            Some(xml) => StyleBook::parse(part, xml)?,
            None => StyleBook::default(),
        },
        None => StyleBook::default(),
    };
    let metadata = data.metadata().filter(|m| !m.is_empty());
    let create_core = metadata.is_some() && !package.contains(CORE_PART);

    let mut zip = ZipWriter::new(out);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    // content types first
    let mut removed = BTreeSet::new();
    if package.contains(CALC_CHAIN_PART) {
        removed.insert(CALC_CHAIN_PART.to_string());
    }
    let mut overrides = images.overrides.clone();
    if create_core {
        overrides.push((format!("/{CORE_PART}"), CT_CORE.to_string()));
    }
    let content_types = package
        .part_str(CONTENT_TYPES_PART)?
        .ok_or_else(|| TemplateError::template("template package has no [Content_Types].xml"))?;
    let content_types = parts::patch_content_types(content_types, &removed, &images.defaults, &overrides)?;
    zip.start_file(CONTENT_TYPES_PART, options)?;
    zip.write_all(content_types.as_bytes())?;

    // worksheets
    let inputs = RenderInputs {
        layout: &layout,
        collections: &collections,
        globals: &globals,
        size_mismatch: config.size_mismatch,
        preserve_layout: config.preserve_layout,
        cancel: hooks.cancel,
    };
    let mut progress = Progress::new(
        hooks.progress,
        planned_rows,
        config.progress_interval_rows,
        mode == RenderMode::Streaming,
    );
    let mut stats = ColumnStatsBook::new();
    for sheet in &template.blueprint().sheets {
        let Some(map) = layout.get(&sheet.name) else {
            continue;
        };
        let fragments = FragmentContext {
            spec: sheet,
            map,
            layout: &layout,
            scope: globals.scope(),
        };
        let shell = SheetShell::build(&fragments, images.sheet_drawings.get(&sheet.part).map(String::as_str))
            .map_err(|e| e.in_sheet(&sheet.name))?;
        let tracked = pivots.tracked_columns(&sheet.name);

        zip.start_file(sheet.part.as_str(), options)?;
        zip.write_all(shell.head.as_bytes())?;
        let mut producer = RowProducer::new(sheet, map, &inputs, &mut styles);
        match mode {
            RenderMode::Streaming => {
                let mut writer = StreamingSheetWriter::new(&mut zip, config.streaming_window_rows);
                for (col, rows) in &tracked {
                    writer.track(*col, *rows);
                }
                producer
                    .run(&mut writer, &mut progress)
                    .map_err(|e| e.in_sheet(&sheet.name))?;
                for (col, _, column) in writer.finish()? {
                    stats.entry((sheet.name.clone(), col)).or_default().merge(column);
                }
            }
            RenderMode::Memory => {
                let mut rows = MemorySheet::new();
                producer
                    .run(&mut rows, &mut progress)
                    .map_err(|e| e.in_sheet(&sheet.name))?;
                for (col, span) in &tracked {
                    let column = rows.column_stats(*col, *span);
                    stats.entry((sheet.name.clone(), *col)).or_default().merge(column);
                }
                rows.write_rows(&mut zip)?;
            }
        }
        zip.write_all(shell.tail.as_bytes())?;
        debug!(sheet = %sheet.name, rows = map.total_rows(), "worksheet written");
    }
    progress.finish();

    // remaining template parts
    let worksheets: HashSet<&str> = workbook.sheets.iter().map(|s| s.part.as_str()).collect();
    let ctx = PartContext {
        template,
        layout: &layout,
        scope: globals.scope(),
        config,
        owners: &owners,
    };
    let workbook_rels = rels_path(&workbook.part);
    for (name, bytes) in package.iter() {
        if images.new_parts.contains_key(name) {
            continue;
        }
        let kind = classify(name, template, &worksheets);
        let patched = match kind {
            PartKind::Worksheet | PartKind::ContentTypes | PartKind::CalcChain => continue,
            PartKind::Other => None,
            _ => {
                let xml = crate::xml::as_utf8(name, bytes)?;
                patch_part(&ctx, kind, name, xml, &PatchInputs {
                    styles: &styles,
                    images: &images,
                    pivots: &pivots,
                    stats: &stats,
                    workbook_rels: &workbook_rels,
                    create_core,
                    metadata: metadata.as_ref(),
                })?
            }
        };
        zip.start_file(name, options)?;
        match patched {
            Some(xml) => zip.write_all(xml.as_bytes())?,
            None => zip.write_all(bytes)?,
        }
    }

    // parts the template did not have
    for (name, bytes) in &images.new_parts {
        zip.start_file(name.as_str(), options)?;
        zip.write_all(bytes)?;
    }
    if let Some(metadata) = metadata.as_ref().filter(|_| create_core) {
        zip.start_file(CORE_PART, options)?;
        zip.write_all(parts::core_document(metadata)?.as_bytes())?;
    }
    zip.finish()?.flush()?;

    let report = RenderReport {
        mode,
        rows: progress.written(),
        planned_rows,
        sheets: template.blueprint().sheets.len(),
        images: images.placed,
        missing,
        duration: started.elapsed(),
    };
    info!(
        mode = %report.mode,
        rows = report.rows,
        images = report.images,
        elapsed_ms = report.duration.as_millis() as u64,
        "workbook rendered"
    );
    Ok(report)
}

struct PatchInputs<'a> {
    styles: &'a StyleBook,
    images: &'a ImagePlan,
    pivots: &'a PivotPlan,
    stats: &'a ColumnStatsBook,
    workbook_rels: &'a str,
    create_core: bool,
    metadata: Option<&'a crate::data::DocumentMetadata>,
}

/// `None` means the part is copied unchanged.
fn patch_part(
    ctx: &PartContext<'_>,
    kind: PartKind,
    name: &str,
    xml: &str,
    inputs: &PatchInputs<'_>,
) -> Result<Option<String>> {
    Ok(match kind {
        PartKind::Styles => Some(inputs.styles.patch(xml)),
        PartKind::SharedStrings => Some(parts::scrub_shared_strings(name, xml)?),
        PartKind::Workbook => Some(parts::patch_workbook(ctx, name, xml)?),
        PartKind::Relationships => {
            let mut added = inputs.images.relationships.get(name).cloned().unwrap_or_default();
            if name == ROOT_RELS_PART && inputs.create_core {
                added.push(CORE_REL.to_string());
            }
            if added.is_empty() && name != inputs.workbook_rels {
                None
            } else {
                Some(parts::patch_relationships(name, xml, &added)?)
            }
        }
        PartKind::PivotCache => Some(parts::patch_pivot_cache(
            name,
            xml,
            inputs.pivots.caches.get(name),
        )?),
        PartKind::PivotTable => {
            let source = inputs
                .pivots
                .tables
                .get(name)
                .and_then(|cache| inputs.pivots.caches.get(cache));
            let owner = ctx.owner_map(name).map(|(_, map)| map);
            Some(parts::patch_pivot_table(
                ctx.config,
                owner,
                name,
                xml,
                source,
                inputs.stats,
            )?)
        }
        PartKind::Drawing => Some(parts::patch_drawing(
            ctx,
            name,
            xml,
            inputs.images.appended.get(name).map(String::as_str),
        )?),
        PartKind::Vml => Some(parts::patch_vml(ctx, name, xml)),
        PartKind::Chart => Some(parts::patch_chart(ctx, name, xml)?),
        PartKind::Table => Some(parts::patch_table(ctx, name, xml)?),
        PartKind::Comments => Some(parts::patch_comments(ctx, name, xml)?),
        PartKind::Core => match inputs.metadata {
            Some(metadata) => Some(parts::patch_core(xml, metadata)?),
            None => None,
        },
        PartKind::Worksheet | PartKind::ContentTypes | PartKind::CalcChain | PartKind::Other => None,
    })
}
