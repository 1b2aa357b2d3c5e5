//! Rendering Engine: turns an analyzed [`Template`] plus a [`DataSource`]
//! into an output workbook, in memory or streaming.

pub mod context;
pub mod fragments;
pub mod images;
pub mod output;
pub mod package;
pub mod parts;
pub mod sheet;
pub mod sink;
pub mod styles;

pub use context::MissingData;
pub use package::RenderHooks;

use crate::analyzer::Template;
use crate::config::RenderConfig;
use crate::data::DataSource;
use crate::error::Result;
use crate::metrics::RenderTimer;
use chrono::Local;
use output::OutputGuard;
use serde::Serialize;
use std::io::{BufWriter, Cursor};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use tracing::{debug, instrument};

/// Receives `(rows_written, planned_rows)` while worksheets are produced.
pub trait ProgressSink: Send + Sync {
    fn report(&self, written: u64, planned: u64);
}

impl<F> ProgressSink for F
where
    F: Fn(u64, u64) + Send + Sync,
{
    fn report(&self, written: u64, planned: u64) {
        self(written, planned)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RenderMode {
    /// Rows of a sheet are collected in memory, then serialized.
    Memory,
    /// Rows are serialized as produced, a bounded window at a time.
    Streaming,
}

/// What a finished rendering did.
#[derive(Debug, Clone)]
pub struct RenderReport {
    pub mode: RenderMode,
    pub rows: u64,
    pub planned_rows: u64,
    pub sheets: usize,
    pub images: usize,
    /// Omissions tolerated under the WARN missing-data policy.
    pub missing: MissingData,
    pub duration: Duration,
}

/// Entry point for synchronous renderings. Cheap to clone; one engine can
/// serve any number of concurrent renderings.
#[derive(Debug, Clone)]
pub struct TemplateEngine {
    config: Arc<RenderConfig>,
}

impl TemplateEngine {
    pub fn new(config: RenderConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    /// Render into memory and return the package bytes.
    pub fn render(&self, template: &Template, data: &dyn DataSource) -> Result<Vec<u8>> {
        self.render_with(template, data, RenderHooks::default())
            .map(|(bytes, _)| bytes)
    }

    #[instrument(skip_all)]
    pub fn render_with(
        &self,
        template: &Template,
        data: &dyn DataSource,
        hooks: RenderHooks<'_>,
    ) -> Result<(Vec<u8>, RenderReport)> {
        let timer = RenderTimer::start();
        let mut buffer = Cursor::new(Vec::new());
        let mut report = package::write_package(template, data, &self.config, hooks, &mut buffer)?;
        let mut bytes = buffer.into_inner();
        if let Some(password) = self.config.password.as_deref() {
            bytes = output::encrypt_bytes(&bytes, password)?;
        }
        report.duration = timer.finish(&report.mode.to_string(), report.rows);
        Ok((bytes, report))
    }

    /// Render into `dir`, naming the file after `base` under the configured
    /// naming and conflict policies.
    pub fn render_to_file(
        &self,
        template: &Template,
        data: &dyn DataSource,
        dir: &Path,
        base: &str,
    ) -> Result<PathBuf> {
        self.render_to_file_with(template, data, dir, base, RenderHooks::default())
            .map(|(path, _)| path)
    }

    #[instrument(skip_all, fields(dir = %dir.display(), base = %base))]
    pub fn render_to_file_with(
        &self,
        template: &Template,
        data: &dyn DataSource,
        dir: &Path,
        base: &str,
        hooks: RenderHooks<'_>,
    ) -> Result<(PathBuf, RenderReport)> {
        let timer = RenderTimer::start();
        let target = output::output_path(
            dir,
            base,
            self.config.file_naming,
            self.config.conflict,
            Local::now(),
        )?;
        let mut guard = OutputGuard::create(target)?;
        let mut report = package::write_package(
            template,
            data,
            &self.config,
            hooks,
            BufWriter::new(guard.file()),
        )?;
        if let Some(password) = self.config.password.as_deref() {
            output::encrypt_in_place(guard.temp_path(), password)?;
        }
        let path = guard.commit()?;
        report.duration = timer.finish(&report.mode.to_string(), report.rows);
        debug!(path = %path.display(), "rendered to file");
        Ok((path, report))
    }
}
