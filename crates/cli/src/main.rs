use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use jobs::{run_batch, BatchItem, CancelFlag, EncodeClient, EncodeInput, ItemState};

#[derive(Parser)]
#[command(name = "webpress")]
#[command(about = "Batch image to WebP converter with a worker-isolated encoder")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert images to WebP
    Convert {
        /// Image files to convert
        files: Vec<PathBuf>,

        /// WebP quality (1-100)
        #[arg(short, long, default_value = "75", value_parser = clap::value_parser!(u8).range(1..=100))]
        quality: u8,

        /// Quality preset; overrides --quality
        #[arg(long, value_enum)]
        preset: Option<QualityPreset>,

        /// Output directory (defaults to each source file's directory)
        #[arg(short, long)]
        out_dir: Option<PathBuf>,

        /// Write a JSON conversion report to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Encode one file across a quality sweep and print timings
    Bench {
        /// Image file to benchmark
        file: PathBuf,

        /// Qualities to sweep
        #[arg(long, value_delimiter = ',', default_value = "55,72,90")]
        qualities: Vec<u8>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum QualityPreset {
    Web,
    Email,
    Max,
}

impl QualityPreset {
    fn quality(self) -> u8 {
        match self {
            QualityPreset::Web => 55,
            QualityPreset::Email => 72,
            QualityPreset::Max => 90,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    match cli.command {
        Commands::Convert {
            files,
            quality,
            preset,
            out_dir,
            report,
        } => {
            let quality = preset.map(QualityPreset::quality).unwrap_or(quality);
            convert_command(files, quality, out_dir, report)
        }
        Commands::Bench { file, qualities } => bench_command(file, qualities),
    }
}

fn convert_command(
    files: Vec<PathBuf>,
    quality: u8,
    out_dir: Option<PathBuf>,
    report_path: Option<PathBuf>,
) -> Result<()> {
    let mut paths = Vec::new();
    let mut items = Vec::new();
    let mut skipped = 0usize;

    for file in files {
        let Some(mime_type) = mime_type_for(&file) else {
            warn!("skipping non-image file: {:?}", file);
            skipped += 1;
            continue;
        };

        let bytes = match std::fs::read(&file) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!("could not read {:?}: {error}", file);
                skipped += 1;
                continue;
            }
        };

        let file_name = file
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("image")
            .to_string();
        items.push(BatchItem::new(file_name, mime_type.to_string(), bytes));
        paths.push(file);
    }

    if skipped > 0 {
        warn!("{skipped} file(s) were skipped");
    }
    if items.is_empty() {
        bail!("no image files to convert");
    }

    if let Some(dir) = &out_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create output directory {:?}", dir))?;
    }

    let flag = CancelFlag::new();
    let client = Arc::new(Mutex::new(EncodeClient::new()));
    {
        let flag = flag.clone();
        let client = Arc::clone(&client);
        ctrlc::set_handler(move || {
            info!("cancellation requested");
            flag.request_cancel();
            client.lock().cancel();
        })
        .context("install Ctrl-C handler")?;
    }

    let report = run_batch(&client, &mut items, quality, &flag, |index, success| {
        let target = match &out_dir {
            Some(dir) => dir.join(&success.file_name),
            None => paths[index].with_file_name(&success.file_name),
        };
        std::fs::write(&target, &success.bytes).map_err(|error| error.to_string())?;

        info!(
            "{} -> {:?} ({} -> {}, {} ms)",
            paths[index].display(),
            target,
            format_bytes(success.input_bytes),
            format_bytes(success.output_bytes),
            success.duration_ms,
        );
        Ok(())
    });
    client.lock().dispose();

    println!(
        "{} converted, {} failed, {} cancelled",
        report.completed, report.failed, report.cancelled
    );
    if report.completed > 0 {
        let saved = if report.saved_bytes >= 0 {
            format!("saved {}", format_bytes(report.saved_bytes as u64))
        } else {
            format!("grew by {}", format_bytes(report.saved_bytes.unsigned_abs()))
        };
        println!("{saved}, avg {} ms per image", report.avg_duration_ms);
    }
    if let Some(message) = &report.first_error {
        warn!("first error: {message}");
    }

    if let Some(path) = report_path {
        let json = serde_json::json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "quality": quality,
            "summary": &report,
            "items": &items,
        });
        std::fs::write(&path, serde_json::to_string_pretty(&json)?)
            .with_context(|| format!("write report to {:?}", path))?;
        info!("report written to {:?}", path);
    }

    let was_cancelled = items
        .iter()
        .any(|item| matches!(item.state, ItemState::Cancelled));
    if was_cancelled {
        bail!("conversion cancelled");
    }
    if report.failed > 0 {
        bail!("{} item(s) failed to convert", report.failed);
    }

    Ok(())
}

fn bench_command(file: PathBuf, qualities: Vec<u8>) -> Result<()> {
    let Some(mime_type) = mime_type_for(&file) else {
        bail!("unrecognized image extension: {:?}", file);
    };
    let bytes = std::fs::read(&file).with_context(|| format!("read {:?}", file))?;
    let file_name = file
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("image")
        .to_string();
    let input_bytes = bytes.len() as u64;

    let mut client = EncodeClient::new();
    println!("{:>8}  {:>12}  {:>12}  {:>7}", "quality", "duration", "output", "ratio");

    for quality in qualities {
        let ticket = client.encode(EncodeInput {
            file_name: file_name.clone(),
            mime_type: mime_type.to_string(),
            // The buffer moves to the worker, so each run gets its own copy.
            bytes: bytes.clone(),
            quality,
        });
        let success = match ticket.wait() {
            Ok(success) => success,
            Err(error) => bail!("encode at quality {quality} failed: {error}"),
        };

        let ratio = success.output_bytes as f64 / input_bytes as f64 * 100.0;
        println!(
            "{:>8}  {:>9} ms  {:>12}  {:>6.1}%",
            quality,
            success.duration_ms,
            format_bytes(success.output_bytes),
            ratio,
        );
    }

    client.dispose();
    Ok(())
}

fn mime_type_for(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    match extension.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "bmp" => Some("image/bmp"),
        "tif" | "tiff" => Some("image/tiff"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{bytes} B");
    }

    let kb = bytes as f64 / 1024.0;
    if kb < 1024.0 {
        return format!("{kb:.1} KB");
    }

    format!("{:.1} MB", kb / 1024.0)
}
