//! Subcommand implementations.

use anyhow::{bail, Context, Result};
use modelfetch_core::config::PathsConfig;
use modelfetch_core::model_library::Glob;
use modelfetch_core::{
    extract_zip, restructure, DownloadEvent, DownloadOrchestrator, DownloadState, EngineConfig,
    FileFilter, HttpTransferBackend, HuggingFaceRepository, JsonDownloadStore, ModelLocation,
    RestructureOutcome, RestructureRules, TransferState,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// `<local data dir>/modelfetch`, or `./.modelfetch` when the platform has none.
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("modelfetch"))
        .unwrap_or_else(|| PathBuf::from(".modelfetch"))
}

/// Build the engine over the JSON stores in `data_dir`. Downloads interrupted
/// by a previous run are picked up again when `resume` is set.
pub async fn open_engine(
    data_dir: &Path,
    config_path: Option<&Path>,
    resume: bool,
) -> Result<Arc<DownloadOrchestrator>> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

    let config_path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| data_dir.join(PathsConfig::ENGINE_CONFIG_FILENAME));
    let mut config = EngineConfig::load(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;
    config.models_root = anchor(data_dir, &config.models_root);
    config.data_dir = anchor(data_dir, &config.data_dir);

    let token = std::env::var("HF_TOKEN").ok();
    let repository = HuggingFaceRepository::new(&config.hub_base_url, &config.revision)?
        .with_auth_token(token.clone());
    let backend = HttpTransferBackend::new(
        &config.hub_base_url,
        &config.revision,
        config.max_concurrent_transfers,
    )?
    .with_auth_token(token);
    let store = JsonDownloadStore::new(&config.data_dir);

    let engine = DownloadOrchestrator::new(
        config,
        Arc::new(repository),
        Arc::new(backend),
        Arc::new(store),
    )?;

    if resume {
        let handles = engine.resume_all().await?;
        if !handles.is_empty() {
            info!("Picked up {} transfers from a previous run", handles.len());
        }
    }
    Ok(engine)
}

/// Relative config paths are taken relative to the data directory.
fn anchor(data_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else if path == Path::new(".") {
        data_dir.to_path_buf()
    } else {
        data_dir.join(path)
    }
}

fn build_filter(allow: Option<&str>, exclude: &str) -> Result<FileFilter> {
    if let Some(allow) = allow {
        return Ok(FileFilter::parse(allow, exclude)?);
    }

    let defaults = FileFilter::model_defaults();
    let excludes: Vec<String> = defaults
        .exclude_patterns()
        .chain(exclude.split(',').map(str::trim).filter(|p| !p.is_empty()))
        .map(str::to_string)
        .collect();
    Ok(FileFilter::new(defaults.allow_patterns(), excludes)?)
}

pub async fn download(
    engine: &Arc<DownloadOrchestrator>,
    location: &str,
    allow: Option<&str>,
    exclude: &str,
) -> Result<()> {
    let location = ModelLocation::parse(location)?;
    let filter = build_filter(allow, exclude)?;

    let model_id = engine.start(location, &filter).await?;
    println!("Started {}", model_id);
    watch(engine, vec![model_id]).await
}

pub async fn resume(engine: &Arc<DownloadOrchestrator>, model_id: Option<&str>) -> Result<()> {
    if let Some(model_id) = model_id {
        if !engine.resume(model_id).await? {
            println!("{} is {}", model_id, engine.current_state(model_id));
        }
    }

    let active: Vec<String> = engine
        .list_active_downloads()
        .into_iter()
        .filter(|r| r.state == DownloadState::DownloadingActive)
        .map(|r| r.model_id)
        .collect();
    if active.is_empty() {
        println!("Nothing to download");
        return Ok(());
    }
    watch(engine, active).await
}

/// Stream progress until every model settles. Ctrl-C pauses whatever is
/// still running.
async fn watch(engine: &Arc<DownloadOrchestrator>, model_ids: Vec<String>) -> Result<()> {
    let mut watchers = JoinSet::new();
    for model_id in model_ids {
        let mut events = engine.subscribe(&model_id).await?;
        let state = engine.current_state(&model_id);
        if !state.is_in_progress() {
            println!("{}: {}", model_id, state);
            continue;
        }

        watchers.spawn(async move {
            let mut last_percent = None;
            while let Some(event) = events.recv().await {
                match event {
                    DownloadEvent::Progress(progress) => {
                        let percent = (progress.fraction() * 100.0).floor() as u32;
                        if last_percent != Some(percent) {
                            last_percent = Some(percent);
                            println!(
                                "{}: {:>3}% {} / {} ({}/{} files)",
                                model_id,
                                percent,
                                format_bytes(progress.bytes_downloaded),
                                format_bytes(progress.total_bytes),
                                progress.files_completed,
                                progress.total_files
                            );
                        }
                    }
                    DownloadEvent::Completed(info) => {
                        println!(
                            "{}: downloaded to {} ({})",
                            model_id,
                            info.local_path.display(),
                            format_bytes(info.size_on_disk)
                        );
                        if let Some(archive) = info.archive {
                            println!("{}: archive {:?}", model_id, archive);
                        }
                        return true;
                    }
                    DownloadEvent::Failed(error) => {
                        eprintln!("{}: failed: {}", model_id, error);
                        return false;
                    }
                }
            }
            eprintln!("{}: stopped", model_id);
            false
        });
    }

    let mut failures = 0;
    loop {
        tokio::select! {
            joined = watchers.join_next() => match joined {
                Some(Ok(true)) => {}
                Some(Ok(false)) => failures += 1,
                Some(Err(e)) => {
                    warn!("Progress watcher ended abnormally: {}", e);
                    failures += 1;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, pausing active downloads");
                for record in engine.list_active_downloads() {
                    engine.pause(&record.model_id).await?;
                }
                println!("Paused. Run `modelfetch resume` to continue.");
                return Ok(());
            }
        }
    }

    if failures > 0 {
        bail!("{} download(s) did not complete", failures);
    }
    Ok(())
}

pub async fn cancel(engine: &Arc<DownloadOrchestrator>, model_id: &str) -> Result<()> {
    if engine.cancel(model_id).await? {
        println!("Cancelled {}", model_id);
    } else {
        println!("{} is {}, nothing to cancel", model_id, engine.current_state(model_id));
    }
    Ok(())
}

pub async fn delete(engine: &Arc<DownloadOrchestrator>, model_id: &str) -> Result<()> {
    if engine.delete(model_id).await? {
        println!("Deleted {}", model_id);
    } else {
        println!("{} is not downloaded", model_id);
    }
    Ok(())
}

pub async fn status(engine: &Arc<DownloadOrchestrator>, json: bool) -> Result<()> {
    let records = engine.records();
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No models");
    }
    for record in &records {
        let mut line = format!(
            "{:<40} {:<18} {:>5.1}%",
            record.model_id,
            record.state,
            record.progress * 100.0
        );
        if let Some(size) = record.size_on_disk {
            line.push_str(&format!("  {}", format_bytes(size)));
        }
        if let Some(ref path) = record.local_path {
            line.push_str(&format!("  {}", path.display()));
        }
        if let Some(ref error) = record.last_error {
            line.push_str(&format!("  ({})", error));
        }
        println!("{}", line);
    }

    for transfer in engine.status_snapshot().await {
        let eta = transfer
            .estimated_time_remaining
            .map(|d| format!("  eta {}s", d.as_secs()))
            .unwrap_or_default();
        println!(
            "  {} {:?} {} / {}{}",
            transfer.handle.model_id,
            transfer.state,
            format_bytes(transfer.progress.bytes_written),
            format_bytes(transfer.progress.total_bytes),
            eta
        );
        if transfer.state == TransferState::Failed {
            if let Some(error) = transfer.error {
                println!("    {}", error);
            }
        }
    }
    Ok(())
}

pub async fn cleanup(engine: &Arc<DownloadOrchestrator>) -> Result<()> {
    let removed = engine.cleanup_incomplete().await?;
    for path in &removed {
        println!("Removed {}", path.display());
    }
    println!("{} entries removed", removed.len());
    Ok(())
}

pub fn extract(archive: &Path, dest: &Path) -> Result<()> {
    let report = extract_zip(archive, dest)?;
    println!(
        "Extracted {} files and {} directories ({})",
        report.files,
        report.directories,
        format_bytes(report.bytes)
    );
    for skipped in &report.skipped {
        println!("Skipped unsafe entry {}", skipped);
    }
    Ok(())
}

pub fn restructure_dir(
    dir: &Path,
    marker: Option<String>,
    bundle_suffix: Option<String>,
) -> Result<()> {
    let mut rules = RestructureRules::default();
    if let Some(marker) = marker {
        rules.marker_file = marker;
    }
    if let Some(suffix) = bundle_suffix {
        rules.bundle_suffix = suffix;
    }

    match restructure(dir, &rules)? {
        RestructureOutcome::MarkerNotFound => {
            println!("No {} found, layout left unchanged", rules.marker_file)
        }
        RestructureOutcome::AlreadyFlat => println!("Already flat"),
        RestructureOutcome::Restructured(report) => {
            for planned in &report.moves {
                println!(
                    "{} -> {}",
                    planned.source.display(),
                    planned.destination.display()
                );
            }
            println!(
                "Moved {} entries ({} renamed)",
                report.moves.len(),
                report.renamed_count()
            );
        }
    }
    Ok(())
}

pub fn match_pattern(pattern: &str, path: &str) -> Result<()> {
    let glob = Glob::new(pattern)?;
    if glob.is_match(path) {
        println!("match");
        Ok(())
    } else {
        bail!("{} does not match {}", path, pattern)
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
