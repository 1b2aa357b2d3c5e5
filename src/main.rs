use anyhow::Context;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use xlsx_template::config::{Command, InspectArgs, RenderArgs};
use xlsx_template::data::ImageData;
use xlsx_template::job::{GenerationResult, JobId};
use xlsx_template::{
    CliArgs, Destination, JobListener, JobOrchestrator, LoggingConfig, MapDataSource, Template,
    TemplateEngine, init_logging,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let logging_config = LoggingConfig::from_env();
    let _guard = init_logging(logging_config)?;

    let cli = CliArgs::parse();
    match cli.command {
        Command::Render(args) => render(args, cli.config.as_deref()).await,
        Command::Inspect(args) => inspect(args),
    }
}

struct LogProgress;

impl JobListener for LogProgress {
    fn on_progress(&self, job: JobId, written: u64, planned: u64) {
        tracing::info!(job_id = %job, written, planned, "rendering");
    }

    fn on_completed(&self, job: JobId, result: &GenerationResult) {
        tracing::info!(job_id = %job, rows = result.rows, mode = %result.mode, "rendering finished");
    }
}

async fn render(args: RenderArgs, config_file: Option<&Path>) -> anyhow::Result<()> {
    let config = args.render_config(config_file)?;
    let template = Template::open(&args.template)
        .with_context(|| format!("failed to analyze template {:?}", args.template))?;
    let data = load_data(&args)?;

    let engine = TemplateEngine::new(config)?;
    let orchestrator = JobOrchestrator::new(engine)?;
    let job = orchestrator.submit(
        template,
        Arc::new(data),
        Destination::Directory {
            dir: args.output_dir.clone(),
            base_name: args.name.clone(),
        },
        Some(Arc::new(LogProgress)),
    );

    let result = tokio::select! {
        result = job.wait() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!(job_id = %job.id(), "interrupted, cancelling");
            job.cancel();
            job.wait().await
        }
    };
    let result = result.context("rendering failed")?;
    if let Some(path) = result.output.path() {
        println!("{}", path.display());
    }
    Ok(())
}

fn load_data(args: &RenderArgs) -> anyhow::Result<MapDataSource> {
    let contents = std::fs::read_to_string(&args.data)
        .with_context(|| format!("failed to read data file {:?}", args.data))?;
    let ext = args
        .data
        .extension()
        .and_then(|os| os.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let root: serde_json::Value = match ext.as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse YAML data {:?}", args.data))?,
        "json" => serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse JSON data {:?}", args.data))?,
        other => anyhow::bail!("unsupported data file extension: {other}"),
    };
    let mut source = MapDataSource::from_json(root);
    for (name, path) in &args.images {
        let bytes =
            std::fs::read(path).with_context(|| format!("failed to read image {:?}", path))?;
        let image = ImageData::from_bytes(bytes)
            .with_context(|| format!("{:?} is not a PNG, JPEG or GIF image", path))?;
        source.insert_image(name.clone(), image);
    }
    Ok(source)
}

fn inspect(args: InspectArgs) -> anyhow::Result<()> {
    let template = Template::open(&args.template)
        .with_context(|| format!("failed to analyze template {:?}", args.template))?;
    let summary = template.blueprint().summary();
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
