use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use market_docgen::config::{init_default_config, Overrides, RunConfig, CONFIG_ENV, CONFIG_FILE};
use market_docgen::docx::document::DocumentTree;
use market_docgen::error::BulkError;
use market_docgen::metadata::{JsonlStore, MetadataStore, NullStore};
use market_docgen::pipeline::{find_placeholders, BulkOptions, BulkReport, BulkStatus, Synthesizer};
use market_docgen::record::flat_from_json;
use market_docgen::template::DirTemplateStore;

#[derive(Parser, Debug)]
#[command(name = "market-docgen")]
#[command(about = "Market report generator: fills DOCX report templates from input records", long_about = None)]
struct Args {
    /// Generate a default config file, then exit
    #[arg(long)]
    init_config: bool,

    /// Directory to write the config file to (default: current directory)
    #[arg(long, value_name = "DIR")]
    init_config_dir: Option<PathBuf>,

    /// Overwrite an existing config file when used with --init-config
    #[arg(long)]
    force: bool,

    /// Config file path (default: search for market-docgen.toml upwards)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Generate one document from a JSON object of flat record fields
    #[arg(long, value_name = "JSON", conflicts_with_all = ["bulk", "list_placeholders"])]
    record: Option<PathBuf>,

    /// Generate one document per row of a CSV table into a ZIP archive
    #[arg(long, value_name = "CSV", conflicts_with = "list_placeholders")]
    bulk: Option<PathBuf>,

    /// Print the template tokens still present in a DOCX, then exit
    #[arg(long, value_name = "DOCX")]
    list_placeholders: Option<PathBuf>,

    /// Output .docx (single) or .zip (bulk). Default: the generated name in the output dir
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Write the bulk report as JSON
    #[arg(long, value_name = "JSON", requires = "bulk")]
    report: Option<PathBuf>,

    /// Template directory (overrides [templates] dir)
    #[arg(long, value_name = "DIR")]
    templates: Option<PathBuf>,

    #[arg(long)]
    user_id: Option<String>,

    #[arg(long)]
    username: Option<String>,

    #[arg(long)]
    role: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.init_config {
        let dir = args
            .init_config_dir
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        let cfg_path = init_default_config(&dir, args.force).context("init default config")?;
        eprintln!("Wrote config: {}", cfg_path.display());
        return Ok(());
    }

    let Some(input) = args
        .record
        .clone()
        .or_else(|| args.bulk.clone())
        .or_else(|| args.list_placeholders.clone())
    else {
        let mut cmd = Args::command();
        cmd.print_help().context("print help")?;
        eprintln!(
            "\n\nUSAGE:\n  market-docgen --record record.json [-o out.docx]\n  market-docgen --bulk table.csv [-o out.zip] [--report report.json]\n\nTIPS:\n  - Default config search: {CONFIG_FILE} (upwards), or set {CONFIG_ENV}.\n"
        );
        return Ok(());
    };

    let workdir = input
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let run = RunConfig::resolve(
        &workdir,
        Overrides {
            config: args.config.clone(),
            templates_dir: args.templates.clone(),
            user_id: args.user_id.clone(),
            username: args.username.clone(),
            role: args.role.clone(),
        },
    )
    .context("build config")?;
    init_logging(&run);
    if let Some(p) = &run.config_path {
        info!(config = %p.display(), "loaded config");
    }

    if let Some(path) = &args.list_placeholders {
        return list_placeholders(path);
    }

    let metadata: Arc<dyn MetadataStore> = match &run.metadata_log {
        Some(p) => Arc::new(JsonlStore::new(p)?),
        None => Arc::new(NullStore),
    };
    let synth = Synthesizer::new(
        Arc::new(DirTemplateStore::new(&run.templates_dir)),
        metadata,
    );

    if let Some(path) = &args.record {
        run_single(&synth, &run, path, args.output.as_deref())
    } else {
        run_bulk(&synth, &run, &input, args.output.as_deref(), args.report.as_deref())
    }
}

fn init_logging(run: &RunConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&run.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if run.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn list_placeholders(path: &Path) -> anyhow::Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("read docx: {}", path.display()))?;
    let tree = DocumentTree::from_bytes(&bytes)
        .with_context(|| format!("load docx: {}", path.display()))?;
    for token in find_placeholders(&tree) {
        println!("{token}");
    }
    Ok(())
}

fn run_single(
    synth: &Synthesizer,
    run: &RunConfig,
    record_path: &Path,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(record_path)
        .with_context(|| format!("read record: {}", record_path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("parse record json: {}", record_path.display()))?;
    let flat = flat_from_json(&value)?;

    let doc = synth.synthesize_flat(&flat, &run.user)?;
    for w in &doc.warnings {
        warn!(warning = %w, "generation warning");
    }
    let out = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| run.output_dir.join(&doc.filename));
    write_file(&out, &doc.bytes)?;
    info!(output = %out.display(), warnings = doc.warnings.len(), "document written");
    Ok(())
}

fn run_bulk(
    synth: &Synthesizer,
    run: &RunConfig,
    table_path: &Path,
    output: Option<&Path>,
    report_path: Option<&Path>,
) -> anyhow::Result<()> {
    let table = std::fs::read(table_path)
        .with_context(|| format!("read table: {}", table_path.display()))?;
    let opts = BulkOptions {
        threads: run.bulk_threads,
    };
    let result = synth.synthesize_bulk(&table, &run.user, &opts);
    if let (Some(path), Err(BulkError::CompleteFailure(report))) = (report_path, &result) {
        write_report(path, report)?;
    }
    let out = result?;
    if let Some(path) = report_path {
        write_report(path, &out.report)?;
    }

    let archive = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| run.output_dir.join(&run.archive_name));
    write_file(&archive, &out.archive)?;
    if out.report.status == BulkStatus::PartialFailure {
        warn!(
            failed = out.report.failed,
            total = out.report.total,
            "some rows failed; see the report"
        );
    }
    info!(archive = %archive.display(), documents = out.report.succeeded, "archive written");
    Ok(())
}

fn write_report(path: &Path, report: &BulkReport) -> anyhow::Result<()> {
    let json = serde_json::to_vec_pretty(report).context("serialize report")?;
    write_file(path, &json)
}

fn write_file(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("create dir: {}", dir.display()))?;
    }
    std::fs::write(path, bytes).with_context(|| format!("write: {}", path.display()))
}
