/// Offline preprocessing: run the upload pipeline over a directory or ZIP
///
/// Usage: cargo run --release --bin preprocess_dir -- <input_dir|archive.zip> [output_dir]
///        [--augment] [--remove-background] [--classify] [--cutout] [--seed N]

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use landmark_workflow::core::config::Config;
use landmark_workflow::core::types::ProcessingConfig;
use landmark_workflow::orchestration::BatchOrchestrator;
use landmark_workflow::utils::Metrics;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!(
            "Usage: {} <input_dir|archive.zip> [output_dir] [--augment] [--remove-background] [--classify] [--cutout] [--seed N]",
            args[0]
        );
        std::process::exit(1);
    }

    let input = PathBuf::from(&args[1]);
    let mut output_dir: Option<PathBuf> = None;
    let mut request = ProcessingConfig::default();

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--augment" => request.augment = Some(true),
            "--remove-background" => request.remove_background = Some(true),
            "--classify" => request.classify = Some(true),
            "--cutout" => request.cutout = Some(true),
            "--seed" => {
                if i + 1 < args.len() {
                    request.seed = Some(
                        args[i + 1]
                            .parse()
                            .with_context(|| format!("Invalid seed: {}", args[i + 1]))?,
                    );
                    i += 1;
                }
            }
            other if output_dir.is_none() && !other.starts_with("--") => {
                output_dir = Some(PathBuf::from(other));
            }
            other => eprintln!("Ignoring unknown argument: {}", other),
        }
        i += 1;
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("landmark_workflow=info,ort=off"))
        .init();

    let mut config = Config::new().context("Failed to load configuration")?;
    if let Some(dir) = output_dir {
        config.storage.processed_dir = dir;
    }
    let config = Arc::new(config);

    let orchestrator = BatchOrchestrator::new(config.clone(), Metrics::new()).await?;

    let result = if input.is_dir() {
        orchestrator.process_directory(&input, &request).await?
    } else {
        let bytes = std::fs::read(&input)
            .with_context(|| format!("Failed to read {}", input.display()))?;
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        orchestrator.process_archive(bytes, &name, &request).await?
    };

    println!(
        "Processed {} files: {} ok, {} failed ({:.1}ms, {:.1}ms/file)",
        result.total,
        result.successful,
        result.failed,
        result.processing_time_ms,
        result.average_time_per_file_ms
    );
    println!(
        "Output: {}",
        config.processed_dir().join(&result.job_id).display()
    );

    for file in result.results.iter().filter(|r| !r.success) {
        println!(
            "  FAILED {}: {}",
            file.filename,
            file.error.as_deref().unwrap_or("unknown error")
        );
    }
    for (name, c) in result
        .results
        .iter()
        .filter_map(|r| r.classification.map(|c| (r.filename.as_str(), c)))
    {
        println!(
            "  {}: {} (tower {:.2}%, skytree {:.2}%)",
            name,
            c.verdict.label(),
            c.tower_percent,
            c.skytree_percent
        );
    }

    Ok(())
}
