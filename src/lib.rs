//! Render spreadsheet reports from marked-up xlsx templates.
//!
//! A template is analyzed once into an immutable [`Template`]; each
//! rendering computes where every template row and column ends up for the
//! data at hand, rewrites formulas and dependent parts accordingly, and
//! writes the workbook either in memory or streaming.

pub mod address;
pub mod analyzer;
pub mod blueprint;
pub mod config;
pub mod data;
pub mod error;
pub mod formula;
pub mod job;
pub mod logging;
pub mod metrics;
pub mod position;
pub mod render;
pub mod xml;

pub use analyzer::{Template, analyze};
pub use config::{CliArgs, RenderConfig};
pub use data::{DataSource, DocumentMetadata, ImageData, MapDataSource};
pub use error::{ErrorCode, Result, TemplateError};
pub use job::{Destination, GenerationJob, GenerationResult, JobListener, JobOrchestrator, JobState};
pub use logging::{LoggingConfig, init_logging};
pub use render::{ProgressSink, RenderHooks, RenderMode, RenderReport, TemplateEngine};
