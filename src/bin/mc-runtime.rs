use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use mc_runtime::cache::{default_cache_root, ContentAddressedCache};
use mc_runtime::config::RuntimeConfig;
use mc_runtime::jar::{generate_extra_jar, Dist, DistJar};
use mc_runtime::mapping::MappingTable;
use mc_runtime::preflight::check_host_tools;
use mc_runtime::runtime::run_record::{latest_successful_run_id, prune_old_runs};
use mc_runtime::runtime::{vanilla_pipeline, ExecutionContext};
use mc_runtime::tool::{JavaToolExecutor, LibraryManager, ToolExecutor};
use tracing::info;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "MC_RUNTIME_LOG";

fn usage() -> &'static str {
    "Usage:\n  mc-runtime run <runtime.toml>\n  mc-runtime runs <runtime.toml> [keep <N>]\n  mc-runtime extra-jar <client.jar> <server.jar> <output.jar> [official-mappings.txt]\n  mc-runtime cache status [cache_dir]\n  mc-runtime cache gc [cache_dir]\n  mc-runtime cache prune <N> [cache_dir]"
}

fn main() -> Result<()> {
    init_logging();
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [run, config] if run == "run" => run_pipeline(Path::new(config)),
        [runs, config] if runs == "runs" => show_runs(Path::new(config), None),
        [runs, config, keep, n] if runs == "runs" && keep == "keep" => {
            show_runs(Path::new(config), Some(parse_count(n)?))
        }
        [extra, client, server, output] if extra == "extra-jar" => {
            extra_jar(Path::new(client), Path::new(server), Path::new(output), None)
        }
        [extra, client, server, output, mappings] if extra == "extra-jar" => extra_jar(
            Path::new(client),
            Path::new(server),
            Path::new(output),
            Some(Path::new(mappings)),
        ),
        [cache, status] if cache == "cache" && status == "status" => cache_status(None),
        [cache, status, dir] if cache == "cache" && status == "status" => {
            cache_status(Some(Path::new(dir)))
        }
        [cache, gc] if cache == "cache" && gc == "gc" => cache_gc(None),
        [cache, gc, dir] if cache == "cache" && gc == "gc" => cache_gc(Some(Path::new(dir))),
        [cache, prune, n] if cache == "cache" && prune == "prune" => {
            cache_prune(parse_count(n)?, None)
        }
        [cache, prune, n, dir] if cache == "cache" && prune == "prune" => {
            cache_prune(parse_count(n)?, Some(Path::new(dir)))
        }
        _ => bail!(usage()),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_count(raw: &str) -> Result<usize> {
    raw.parse::<usize>()
        .with_context(|| format!("expected a count, got '{raw}'\n\n{}", usage()))
}

fn run_pipeline(config_path: &Path) -> Result<()> {
    let config = RuntimeConfig::load(config_path)?;

    let executor: Arc<dyn ToolExecutor> = if config.needs_tools() {
        check_host_tools()?;
        Arc::new(JavaToolExecutor::locate()?)
    } else {
        Arc::new(JavaToolExecutor::with_binary(PathBuf::from("java")))
    };
    let options = config.vanilla_options(Arc::new(LibraryManager::new()), executor)?;
    let pipeline = vanilla_pipeline(config.specification()?, &options)?;

    let cache = ContentAddressedCache::open(&config.cache_dir)?;
    let ctx = ExecutionContext::new(cache, config.workspace_dir.clone());
    let run = pipeline.execute(&ctx)?;

    info!(
        run_id = %run.record.run_id,
        hits = run.cache_hits(),
        steps = run.record.steps.len(),
        "runtime ready"
    );
    for step in &run.record.steps {
        println!(
            "{:<20} {:<8} {}",
            step.name,
            format!("{:?}", step.outcome).to_lowercase(),
            step.output.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn show_runs(config_path: &Path, keep: Option<usize>) -> Result<()> {
    let config = RuntimeConfig::load(config_path)?;
    let spec = config.specification()?;
    let runs_dir = config.workspace_dir.join(spec.identifier()).join("runs");

    if let Some(keep) = keep {
        let removed = prune_old_runs(&runs_dir, keep)?;
        println!("removed {removed} run(s)");
    }
    match latest_successful_run_id(&runs_dir)? {
        Some(run_id) => println!("latest successful run: {run_id}"),
        None => println!("no successful runs under {}", runs_dir.display()),
    }
    Ok(())
}

fn extra_jar(client: &Path, server: &Path, output: &Path, mappings: Option<&Path>) -> Result<()> {
    let table = mappings.map(MappingTable::load_reversed).transpose()?;
    let parent = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let scratch = parent.join(format!(".mc-runtime-scratch-{}", std::process::id()));
    std::fs::create_dir_all(&scratch)
        .with_context(|| format!("Failed to create scratch directory '{}'", scratch.display()))?;

    let result = generate_extra_jar(
        DistJar {
            path: client,
            dist: Dist::Client,
        },
        DistJar {
            path: server,
            dist: Dist::Server,
        },
        table.as_ref(),
        output,
        &scratch,
    );
    let _ = std::fs::remove_dir_all(&scratch);
    let summary = result?;

    println!(
        "wrote {} ({} client-only, {} server-only, {} shared, {} resources)",
        output.display(),
        summary.primary_only,
        summary.secondary_only,
        summary.shared,
        summary.resources.len()
    );
    Ok(())
}

fn open_cache(dir: Option<&Path>) -> Result<ContentAddressedCache> {
    let root = dir.map(Path::to_path_buf).unwrap_or_else(default_cache_root);
    ContentAddressedCache::open(&root)
}

fn cache_status(dir: Option<&Path>) -> Result<()> {
    let status = open_cache(dir)?.status()?;
    println!("root:             {}", status.root.display());
    println!("index entries:    {}", status.index_entries);
    println!("referenced blobs: {}", status.referenced_blobs);
    println!("referenced bytes: {}", status.referenced_bytes);
    Ok(())
}

fn cache_gc(dir: Option<&Path>) -> Result<()> {
    let removed = open_cache(dir)?.gc()?;
    println!("removed {removed} file(s)");
    Ok(())
}

fn cache_prune(keep: usize, dir: Option<&Path>) -> Result<()> {
    let removed = open_cache(dir)?.prune_keep_last(keep)?;
    println!("removed {removed} index entr(ies)");
    Ok(())
}
