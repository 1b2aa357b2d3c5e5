use crate::error::{Result, TemplateError};
use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use strum::Display;

pub const DEFAULT_STREAMING_THRESHOLD_ROWS: usize = 100_000;
pub const DEFAULT_STREAMING_WINDOW_ROWS: usize = 100;
pub const DEFAULT_PROGRESS_INTERVAL_ROWS: usize = 1_000;
pub const DEFAULT_PIVOT_INTEGER_FORMAT_ID: u32 = 3;
pub const DEFAULT_PIVOT_DECIMAL_FORMAT_ID: u32 = 4;
pub const DEFAULT_PIVOT_STYLE: &str = "PivotStyleLight16";
/// Largest built-in number format id; custom formats start at 164.
const MAX_BUILTIN_FORMAT_ID: u32 = 163;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StreamingMode {
    /// Stream when the planned row count exceeds the threshold.
    #[default]
    Auto,
    On,
    Off,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MissingDataPolicy {
    #[default]
    Warn,
    Throw,
}

/// What to do when a collection yields a different number of items than
/// was planned for it.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SizeMismatchPolicy {
    /// Drop surplus items, pad missing ones with blank styled rows.
    #[default]
    Reconcile,
    Error,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FileNamingPolicy {
    /// `{base}.xlsx`
    #[default]
    Plain,
    /// `{base}_{yyyyMMdd_HHmmss}.xlsx`
    Timestamped,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConflictPolicy {
    #[default]
    Error,
    /// Append `_1`, `_2`, ... until the name is free.
    Sequence,
}

/// Every knob of a rendering. All fields are independent of each other.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub streaming: StreamingMode,
    pub streaming_threshold_rows: usize,
    pub streaming_window_rows: usize,
    pub progress_interval_rows: usize,
    pub missing_data: MissingDataPolicy,
    pub preserve_layout: bool,
    pub pivot_integer_format_id: u32,
    pub pivot_decimal_format_id: u32,
    pub pivot_style_name: String,
    pub size_mismatch: SizeMismatchPolicy,
    pub file_naming: FileNamingPolicy,
    pub conflict: ConflictPolicy,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub max_concurrent_jobs: usize,
}

impl std::fmt::Debug for RenderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderConfig")
            .field("streaming", &self.streaming)
            .field("streaming_threshold_rows", &self.streaming_threshold_rows)
            .field("streaming_window_rows", &self.streaming_window_rows)
            .field("progress_interval_rows", &self.progress_interval_rows)
            .field("missing_data", &self.missing_data)
            .field("preserve_layout", &self.preserve_layout)
            .field("pivot_integer_format_id", &self.pivot_integer_format_id)
            .field("pivot_decimal_format_id", &self.pivot_decimal_format_id)
            .field("pivot_style_name", &self.pivot_style_name)
            .field("size_mismatch", &self.size_mismatch)
            .field("file_naming", &self.file_naming)
            .field("conflict", &self.conflict)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("max_concurrent_jobs", &self.max_concurrent_jobs)
            .finish()
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            streaming: StreamingMode::Auto,
            streaming_threshold_rows: DEFAULT_STREAMING_THRESHOLD_ROWS,
            streaming_window_rows: DEFAULT_STREAMING_WINDOW_ROWS,
            progress_interval_rows: DEFAULT_PROGRESS_INTERVAL_ROWS,
            missing_data: MissingDataPolicy::Warn,
            preserve_layout: true,
            pivot_integer_format_id: DEFAULT_PIVOT_INTEGER_FORMAT_ID,
            pivot_decimal_format_id: DEFAULT_PIVOT_DECIMAL_FORMAT_ID,
            pivot_style_name: DEFAULT_PIVOT_STYLE.to_string(),
            size_mismatch: SizeMismatchPolicy::Reconcile,
            file_naming: FileNamingPolicy::Plain,
            conflict: ConflictPolicy::Error,
            password: None,
            max_concurrent_jobs: default_parallelism(),
        }
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl RenderConfig {
    pub fn builder() -> RenderConfigBuilder {
        RenderConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.streaming_threshold_rows == 0 {
            return Err(TemplateError::config(
                "streaming_threshold_rows must be greater than 0",
            ));
        }
        if self.streaming_window_rows == 0 {
            return Err(TemplateError::config(
                "streaming_window_rows must be greater than 0",
            ));
        }
        if self.progress_interval_rows == 0 {
            return Err(TemplateError::config(
                "progress_interval_rows must be greater than 0",
            ));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(TemplateError::config(
                "max_concurrent_jobs must be greater than 0",
            ));
        }
        for (name, id) in [
            ("pivot_integer_format_id", self.pivot_integer_format_id),
            ("pivot_decimal_format_id", self.pivot_decimal_format_id),
        ] {
            if id > MAX_BUILTIN_FORMAT_ID {
                return Err(TemplateError::config(format!(
                    "{name} {id} is not a built-in number format (0..={MAX_BUILTIN_FORMAT_ID})"
                )));
            }
        }
        if self.pivot_style_name.trim().is_empty() {
            return Err(TemplateError::config("pivot_style_name must not be empty"));
        }
        if self.password.as_deref().is_some_and(str::is_empty) {
            return Err(TemplateError::config("password must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RenderConfigBuilder {
    streaming: Option<StreamingMode>,
    streaming_threshold_rows: Option<usize>,
    streaming_window_rows: Option<usize>,
    progress_interval_rows: Option<usize>,
    missing_data: Option<MissingDataPolicy>,
    preserve_layout: Option<bool>,
    pivot_integer_format_id: Option<u32>,
    pivot_decimal_format_id: Option<u32>,
    pivot_style_name: Option<String>,
    size_mismatch: Option<SizeMismatchPolicy>,
    file_naming: Option<FileNamingPolicy>,
    conflict: Option<ConflictPolicy>,
    password: Option<String>,
    max_concurrent_jobs: Option<usize>,
}

impl RenderConfigBuilder {
    pub fn streaming(mut self, mode: StreamingMode) -> Self {
        self.streaming = Some(mode);
        self
    }

    pub fn streaming_threshold_rows(mut self, rows: usize) -> Self {
        self.streaming_threshold_rows = Some(rows);
        self
    }

    pub fn streaming_window_rows(mut self, rows: usize) -> Self {
        self.streaming_window_rows = Some(rows);
        self
    }

    pub fn progress_interval_rows(mut self, rows: usize) -> Self {
        self.progress_interval_rows = Some(rows);
        self
    }

    pub fn missing_data(mut self, policy: MissingDataPolicy) -> Self {
        self.missing_data = Some(policy);
        self
    }

    pub fn preserve_layout(mut self, enable: bool) -> Self {
        self.preserve_layout = Some(enable);
        self
    }

    pub fn pivot_integer_format_id(mut self, id: u32) -> Self {
        self.pivot_integer_format_id = Some(id);
        self
    }

    pub fn pivot_decimal_format_id(mut self, id: u32) -> Self {
        self.pivot_decimal_format_id = Some(id);
        self
    }

    pub fn pivot_style_name(mut self, name: impl Into<String>) -> Self {
        self.pivot_style_name = Some(name.into());
        self
    }

    pub fn size_mismatch(mut self, policy: SizeMismatchPolicy) -> Self {
        self.size_mismatch = Some(policy);
        self
    }

    pub fn file_naming(mut self, policy: FileNamingPolicy) -> Self {
        self.file_naming = Some(policy);
        self
    }

    pub fn conflict(mut self, policy: ConflictPolicy) -> Self {
        self.conflict = Some(policy);
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn max_concurrent_jobs(mut self, jobs: usize) -> Self {
        self.max_concurrent_jobs = Some(jobs);
        self
    }

    pub fn build(self) -> RenderConfig {
        let defaults = RenderConfig::default();
        RenderConfig {
            streaming: self.streaming.unwrap_or(defaults.streaming),
            streaming_threshold_rows: self
                .streaming_threshold_rows
                .unwrap_or(defaults.streaming_threshold_rows),
            streaming_window_rows: self
                .streaming_window_rows
                .unwrap_or(defaults.streaming_window_rows),
            progress_interval_rows: self
                .progress_interval_rows
                .unwrap_or(defaults.progress_interval_rows),
            missing_data: self.missing_data.unwrap_or(defaults.missing_data),
            preserve_layout: self.preserve_layout.unwrap_or(defaults.preserve_layout),
            pivot_integer_format_id: self
                .pivot_integer_format_id
                .unwrap_or(defaults.pivot_integer_format_id),
            pivot_decimal_format_id: self
                .pivot_decimal_format_id
                .unwrap_or(defaults.pivot_decimal_format_id),
            pivot_style_name: self.pivot_style_name.unwrap_or(defaults.pivot_style_name),
            size_mismatch: self.size_mismatch.unwrap_or(defaults.size_mismatch),
            file_naming: self.file_naming.unwrap_or(defaults.file_naming),
            conflict: self.conflict.unwrap_or(defaults.conflict),
            password: self.password.or(defaults.password),
            max_concurrent_jobs: self
                .max_concurrent_jobs
                .unwrap_or(defaults.max_concurrent_jobs),
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "xlsx-template",
    about = "Render xlsx reports from marked-up templates",
    version
)]
pub struct CliArgs {
    #[arg(
        long,
        value_name = "FILE",
        help = "Path to a configuration file (YAML or JSON)",
        global = true
    )]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Render a template with a JSON or YAML data file
    Render(RenderArgs),
    /// Print the analyzed structure of a template as JSON
    Inspect(InspectArgs),
}

#[derive(Args, Debug, Clone)]
pub struct InspectArgs {
    #[arg(long, value_name = "FILE", help = "Template workbook (.xlsx)")]
    pub template: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct RenderArgs {
    #[arg(long, value_name = "FILE", help = "Template workbook (.xlsx)")]
    pub template: PathBuf,

    #[arg(long, value_name = "FILE", help = "Data file (.json, .yaml or .yml)")]
    pub data: PathBuf,

    #[arg(
        long,
        env = "XLSX_TEMPLATE_OUTPUT_DIR",
        value_name = "DIR",
        default_value = "."
    )]
    pub output_dir: PathBuf,

    #[arg(long, value_name = "BASE", help = "Output file name without extension")]
    pub name: String,

    #[arg(long, help = "Append a timestamp to the output file name")]
    pub timestamp: bool,

    #[arg(long, env = "XLSX_TEMPLATE_CONFLICT", value_enum)]
    pub conflict: Option<ConflictPolicy>,

    #[arg(long, env = "XLSX_TEMPLATE_STREAMING", value_enum)]
    pub streaming: Option<StreamingMode>,

    #[arg(
        long,
        env = "XLSX_TEMPLATE_STREAMING_THRESHOLD",
        value_name = "ROWS",
        help = "Row count above which auto mode streams"
    )]
    pub threshold: Option<usize>,

    #[arg(long, value_name = "ROWS", help = "Rows between progress reports")]
    pub progress_interval: Option<usize>,

    #[arg(long, env = "XLSX_TEMPLATE_MISSING_DATA", value_enum)]
    pub missing: Option<MissingDataPolicy>,

    #[arg(long, value_enum)]
    pub size_mismatch: Option<SizeMismatchPolicy>,

    #[arg(long, help = "Do not copy template row heights to rendered rows")]
    pub no_preserve_layout: bool,

    #[arg(long, env = "XLSX_TEMPLATE_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    #[arg(
        long = "image",
        value_name = "NAME=PATH",
        value_parser = parse_image_arg,
        help = "Image made available to ${image...} markers"
    )]
    pub images: Vec<(String, PathBuf)>,
}

fn parse_image_arg(raw: &str) -> std::result::Result<(String, PathBuf), String> {
    let (name, path) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=PATH, got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("image name missing in '{raw}'"));
    }
    Ok((name.to_string(), PathBuf::from(path.trim())))
}

impl RenderArgs {
    /// Merge these flags over an optional config file; flags win.
    pub fn render_config(&self, config_file: Option<&Path>) -> anyhow::Result<RenderConfig> {
        let file = match config_file {
            Some(path) => load_config_file(path)?,
            None => PartialConfig::default(),
        };
        let PartialConfig {
            streaming,
            streaming_threshold_rows,
            streaming_window_rows,
            progress_interval_rows,
            missing_data,
            preserve_layout,
            pivot_integer_format_id,
            pivot_decimal_format_id,
            pivot_style_name,
            size_mismatch,
            file_naming,
            conflict,
            password,
            max_concurrent_jobs,
        } = file;

        let defaults = RenderConfig::default();
        let config = RenderConfig {
            streaming: self.streaming.or(streaming).unwrap_or(defaults.streaming),
            streaming_threshold_rows: self
                .threshold
                .or(streaming_threshold_rows)
                .unwrap_or(defaults.streaming_threshold_rows),
            streaming_window_rows: streaming_window_rows.unwrap_or(defaults.streaming_window_rows),
            progress_interval_rows: self
                .progress_interval
                .or(progress_interval_rows)
                .unwrap_or(defaults.progress_interval_rows),
            missing_data: self
                .missing
                .or(missing_data)
                .unwrap_or(defaults.missing_data),
            preserve_layout: if self.no_preserve_layout {
                false
            } else {
                preserve_layout.unwrap_or(defaults.preserve_layout)
            },
            pivot_integer_format_id: pivot_integer_format_id
                .unwrap_or(defaults.pivot_integer_format_id),
            pivot_decimal_format_id: pivot_decimal_format_id
                .unwrap_or(defaults.pivot_decimal_format_id),
            pivot_style_name: pivot_style_name.unwrap_or(defaults.pivot_style_name),
            size_mismatch: self
                .size_mismatch
                .or(size_mismatch)
                .unwrap_or(defaults.size_mismatch),
            file_naming: if self.timestamp {
                FileNamingPolicy::Timestamped
            } else {
                file_naming.unwrap_or(defaults.file_naming)
            },
            conflict: self.conflict.or(conflict).unwrap_or(defaults.conflict),
            password: self.password.clone().or(password),
            max_concurrent_jobs: max_concurrent_jobs.unwrap_or(defaults.max_concurrent_jobs),
        };
        config.validate().context("invalid render configuration")?;
        Ok(config)
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    streaming: Option<StreamingMode>,
    streaming_threshold_rows: Option<usize>,
    streaming_window_rows: Option<usize>,
    progress_interval_rows: Option<usize>,
    missing_data: Option<MissingDataPolicy>,
    preserve_layout: Option<bool>,
    pivot_integer_format_id: Option<u32>,
    pivot_decimal_format_id: Option<u32>,
    pivot_style_name: Option<String>,
    size_mismatch: Option<SizeMismatchPolicy>,
    file_naming: Option<FileNamingPolicy>,
    conflict: Option<ConflictPolicy>,
    password: Option<String>,
    max_concurrent_jobs: Option<usize>,
}

fn load_config_file(path: &Path) -> anyhow::Result<PartialConfig> {
    if !path.exists() {
        anyhow::bail!("config file {:?} does not exist", path);
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {:?}", path))?;
    let ext = path
        .extension()
        .and_then(|os| os.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let parsed = match ext.as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse YAML config {:?}", path))?,
        "json" => serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse JSON config {:?}", path))?,
        other => anyhow::bail!("unsupported config extension: {other}"),
    };
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn render_args(extra: &[&str]) -> RenderArgs {
        let mut argv = vec![
            "xlsx-template",
            "render",
            "--template",
            "t.xlsx",
            "--data",
            "d.json",
            "--name",
            "report",
        ];
        argv.extend_from_slice(extra);
        match CliArgs::parse_from(argv).command {
            Command::Render(args) => args,
            Command::Inspect(_) => panic!("expected render command"),
        }
    }

    #[test]
    fn defaults_are_valid() {
        let config = RenderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.streaming_threshold_rows, 100_000);
        assert_eq!(config.pivot_integer_format_id, 3);
        assert_eq!(config.pivot_decimal_format_id, 4);
        assert!(config.preserve_layout);
    }

    #[test]
    fn builder_sets_fields_independently() {
        let config = RenderConfig::builder()
            .missing_data(MissingDataPolicy::Throw)
            .streaming(StreamingMode::On)
            .build();
        assert_eq!(config.missing_data, MissingDataPolicy::Throw);
        assert_eq!(config.streaming, StreamingMode::On);
        assert_eq!(
            config.progress_interval_rows,
            DEFAULT_PROGRESS_INTERVAL_ROWS
        );
    }

    #[test]
    fn validation_rejects_zero_and_custom_ids() {
        assert!(
            RenderConfig::builder()
                .progress_interval_rows(0)
                .build()
                .validate()
                .is_err()
        );
        assert!(
            RenderConfig::builder()
                .pivot_decimal_format_id(170)
                .build()
                .validate()
                .is_err()
        );
    }

    #[test]
    fn cli_flags_override_config_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "missing_data: throw\nstreaming_threshold_rows: 10\nconflict: sequence"
        )
        .unwrap();

        let args = render_args(&["--threshold", "50", "--timestamp"]);
        let config = args.render_config(Some(file.path())).unwrap();
        assert_eq!(config.missing_data, MissingDataPolicy::Throw);
        assert_eq!(config.streaming_threshold_rows, 50);
        assert_eq!(config.conflict, ConflictPolicy::Sequence);
        assert_eq!(config.file_naming, FileNamingPolicy::Timestamped);
    }

    #[test]
    fn image_arguments_split_on_equals() {
        let args = render_args(&["--image", "logo=assets/logo.png"]);
        assert_eq!(
            args.images,
            vec![("logo".to_string(), PathBuf::from("assets/logo.png"))]
        );
        assert!(parse_image_arg("nologo").is_err());
    }
}
