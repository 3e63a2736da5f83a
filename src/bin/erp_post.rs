use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use erp_post::{Pipeline, PipelineConfig, SafetensorsStore, SubjectId};

#[derive(Parser)]
#[command(name = "erp-post", about = "ERP post-processing: grand averages, difference waves, clusters")]
struct Args {
    /// JSON pipeline configuration (defaults apply when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding one <subject>.safetensors per subject
    #[arg(long)]
    input: PathBuf,

    /// Subjects in canonical order: a comma-separated list, or a file with one
    /// id per line. Defaults to every recording in --input, sorted by name.
    #[arg(long)]
    subjects: Option<String>,

    /// Parent directory; each run writes to a new timestamped subdirectory
    #[arg(long, default_value = "runs")]
    output: PathBuf,

    /// Previous run directory to read artifacts from for steps in load mode
    #[arg(long)]
    load_from: Option<PathBuf>,

    /// Process subjects on the rayon thread pool
    #[arg(long)]
    parallel: bool,

    /// Also save every subject × condition average
    #[arg(long)]
    export_subject_averages: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    cfg.parallel_subjects |= args.parallel;
    cfg.export_subject_averages |= args.export_subject_averages;

    if cfg.steps.needs_previous_run() && args.load_from.is_none() {
        bail!("a step is in load mode; pass --load-from <previous run directory>");
    }

    let subjects = match &args.subjects {
        Some(spec) => parse_subjects(spec)?,
        None => discover_subjects(&args.input)?,
    };
    if subjects.is_empty() && !cfg.steps.needs_previous_run() {
        bail!("no subjects given and none found in {}", args.input.display());
    }

    let run_dir = args
        .output
        .join(format!("run-{}", chrono::Local::now().format("%Y%m%d-%H%M%S")));
    let mut store = SafetensorsStore::new(&args.input, &run_dir)
        .with_context(|| format!("creating {}", run_dir.display()))?;
    if let Some(prev) = &args.load_from {
        store = store.with_previous_run(prev);
    }
    std::fs::write(run_dir.join("config.json"), serde_json::to_vec_pretty(&cfg)?)
        .context("writing config.json")?;
    info!(n_subjects = subjects.len(), output = %run_dir.display(), "starting run");

    let out = Pipeline::new(&store, cfg)?.run(&subjects)?;
    print!("{}", out.report);
    println!("Written → {}", run_dir.display());
    Ok(())
}

/// Comma list, or the path of a file with one id per line.
fn parse_subjects(spec: &str) -> Result<Vec<SubjectId>> {
    let path = Path::new(spec);
    let text = if path.is_file() {
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?
    } else {
        spec.replace(',', "\n")
    };
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.starts_with('#'))
        .map(SubjectId::from)
        .collect())
}

fn discover_subjects(dir: &Path) -> Result<Vec<SubjectId>> {
    let mut ids: Vec<String> = std::fs::read_dir(dir)
        .with_context(|| format!("listing {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|x| x == "safetensors"))
        .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(String::from))
        .collect();
    ids.sort();
    Ok(ids.into_iter().map(SubjectId::new).collect())
}
