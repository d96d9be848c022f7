use anyhow::{Context, Result};
use clap::Parser;
use galaxy_runtime::config::{module_search_paths, ConfigStore, ValueStore};
use galaxy_runtime::pipeline::Pipeline;
use galaxy_runtime::Runtime;
use serde::Serialize;
use std::path::PathBuf;
use std::rc::Rc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Galaxy Runtime - inspect and validate a module setup
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Additional module directory, searched before configured paths
    #[arg(short, long = "module-dir")]
    module_dir: Vec<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct ModuleRow {
    id: String,
    name: String,
    version: String,
    module_type: String,
    initialized: bool,
    active: bool,
    library: Option<PathBuf>,
    errors: usize,
}

#[derive(Serialize)]
struct Report {
    modules: Vec<ModuleRow>,
    pipeline: Vec<StepRow>,
    valid: bool,
}

#[derive(Serialize)]
struct StepRow {
    name: String,
    module_type: String,
    module: Option<String>,
    enabled: bool,
    optional: bool,
}

fn init_logging(debug: bool) -> Result<()> {
    // Logs go to stderr so the report on stdout stays parseable
    let builder = FmtSubscriber::builder().with_writer(std::io::stderr);
    let result = if std::env::var_os("RUST_LOG").is_some() {
        tracing::subscriber::set_global_default(
            builder.with_env_filter(EnvFilter::from_default_env()).finish(),
        )
    } else {
        let level = if debug { Level::DEBUG } else { Level::INFO };
        tracing::subscriber::set_global_default(builder.with_max_level(level).finish())
    };
    result.context("Failed to set global default subscriber")
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug)?;

    let store = match &args.config {
        Some(path) => ValueStore::load_from_file(path)
            .with_context(|| format!("Failed to load configuration {}", path.display()))?,
        None => ValueStore::empty(),
    };
    let config: Rc<dyn ConfigStore> = Rc::new(store);

    let mut runtime = Runtime::with_config(Rc::clone(&config));
    runtime
        .install_merger_queue_module()
        .context("Failed to install merger queue module")?;

    let mut search_paths = args.module_dir.clone();
    search_paths.extend(module_search_paths(config.as_ref()));
    let discovered = runtime.discover(&search_paths);
    let activated = runtime.activate_from_config();
    info!("{} module(s) discovered, {} activated from configuration", discovered, activated);

    let max_steps = runtime.limits().max_pipeline_steps;
    let pipeline = if config.get_array_size("pipeline.steps") > 0 {
        Pipeline::from_config("configured", config.as_ref(), "pipeline.steps", max_steps)
            .context("Invalid pipeline configuration")?
    } else {
        Pipeline::default_physics(max_steps).context("Failed to build default pipeline")?
    };
    let valid = pipeline.validate(runtime.registry());

    if args.json {
        let report = build_report(&runtime, &pipeline, valid);
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize report")?
        );
    } else {
        print_modules(&runtime);
        println!();
        print!("{}", pipeline.describe(runtime.registry()));
        println!();
        println!("Pipeline {}", if valid { "valid" } else { "INVALID" });
    }

    if !valid {
        std::process::exit(1);
    }
    Ok(())
}

fn module_rows(runtime: &Runtime) -> Vec<ModuleRow> {
    runtime
        .registry()
        .iter()
        .map(|entry| ModuleRow {
            id: entry.id().to_string(),
            name: entry.name().to_string(),
            version: entry.version().to_string(),
            module_type: entry.module_type().to_string(),
            initialized: entry.is_initialized(),
            active: entry.is_active(),
            library: entry.library_path().map(PathBuf::from),
            errors: runtime.error_count(entry.id()),
        })
        .collect()
}

fn build_report(runtime: &Runtime, pipeline: &Pipeline, valid: bool) -> Report {
    Report {
        modules: module_rows(runtime),
        pipeline: pipeline
            .steps()
            .iter()
            .map(|step| StepRow {
                name: step.step_name.clone(),
                module_type: step.module_type.to_string(),
                module: step.module_name.clone(),
                enabled: step.enabled,
                optional: step.optional,
            })
            .collect(),
        valid,
    }
}

fn print_modules(runtime: &Runtime) {
    println!(
        "{:<5} {:<24} {:<9} {:<16} {:<7} {:<7} {}",
        "ID", "NAME", "VERSION", "TYPE", "INIT", "ACTIVE", "SOURCE"
    );
    for row in module_rows(runtime) {
        println!(
            "{:<5} {:<24} {:<9} {:<16} {:<7} {:<7} {}",
            row.id,
            row.name,
            row.version,
            row.module_type,
            if row.initialized { "yes" } else { "no" },
            if row.active { "yes" } else { "no" },
            row.library
                .map_or_else(|| "built-in".to_string(), |p| p.display().to_string())
        );
    }
}
