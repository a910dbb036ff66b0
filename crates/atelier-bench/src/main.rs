//! atelier-bench: CLI tool for visual analysis diagnostics.
//!
//! Two subcommands:
//!
//! - `analyze` runs the pipeline on an image file and prints per-stage
//!   timing and metrics, optionally exporting every stage as a PNG.
//! - `simulate` runs the full submit / poll / fetch lifecycle against an
//!   in-process analysis service, logging each job transition.
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin atelier-bench -- analyze [OPTIONS] <IMAGE_PATH>
//! cargo run --release --bin atelier-bench -- simulate [OPTIONS] <IMAGE_PATH>
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use atelier_jobs::{
    AnalysisClient, AnalysisService, Begin, InMemoryResultStore, JobsConfig, ManualSpawner,
    ObservationCache, OwnerId, PollError, Spawner, SystemClock, ThreadSpawner, Unlimited,
};
use atelier_pipeline::diagnostics::AnalysisDiagnostics;
use atelier_pipeline::{AnalysisOutput, BinaryThreshold, Palette, RgbImage};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Visual analysis diagnostics for atelier.
#[derive(Parser)]
#[command(name = "atelier-bench", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the analysis pipeline and print diagnostics.
    Analyze(AnalyzeArgs),
    /// Submit the image to an in-process service and poll it to completion.
    Simulate(SimulateArgs),
}

#[derive(clap::Args)]
struct AnalyzeArgs {
    /// Path to the input image (PNG, JPEG, BMP, WebP).
    image_path: PathBuf,

    /// Binary threshold preset (200, 170, 140, 110, 80, 50).
    #[arg(long, default_value = "140", value_parser = parse_threshold)]
    threshold: BinaryThreshold,

    /// Write each stage as a PNG into this directory.
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Number of runs for averaging.
    #[arg(long, default_value_t = 1, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    runs: usize,

    /// Output diagnostics as JSON instead of human-readable report.
    #[arg(long)]
    json: bool,
}

#[derive(clap::Args)]
struct SimulateArgs {
    /// Path to the input image (PNG, JPEG, BMP, WebP).
    image_path: PathBuf,

    /// Binary threshold preset (200, 170, 140, 110, 80, 50).
    #[arg(long, default_value = "140", value_parser = parse_threshold)]
    threshold: BinaryThreshold,

    /// Requester the job is submitted for.
    #[arg(long, default_value = "bench")]
    owner: String,

    /// Never run the job, to exercise stall classification.
    #[arg(long)]
    stall: bool,

    /// Keep the stored result instead of deleting it afterwards.
    #[arg(long)]
    keep_result: bool,

    /// Job and polling configuration as a JSON string.
    ///
    /// Fields left out keep their defaults, e.g.
    /// `{"poll": {"interval": 0.1, "stall_limit": 5}}`.
    #[arg(long)]
    config_json: Option<String>,
}

fn parse_threshold(s: &str) -> Result<BinaryThreshold, String> {
    let level: u32 = s.parse().map_err(|e| format!("{e}"))?;
    BinaryThreshold::try_from(level).map_err(|e| e.to_string())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn read_image(path: &Path) -> Result<Vec<u8>, String> {
    std::fs::read(path).map_err(|e| format!("Error reading {}: {e}", path.display()))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    let result = match cli.command {
        Command::Analyze(args) => analyze(&args),
        Command::Simulate(args) => simulate(&args),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("{msg}");
            ExitCode::FAILURE
        }
    }
}

fn analyze(args: &AnalyzeArgs) -> Result<(), String> {
    let image_bytes = read_image(&args.image_path)?;

    eprintln!(
        "Image: {} ({} bytes)",
        args.image_path.display(),
        image_bytes.len(),
    );
    eprintln!("Threshold: {}", args.threshold);
    eprintln!("Runs: {}", args.runs);
    eprintln!();

    let mut all_diagnostics = Vec::with_capacity(args.runs);

    for run in 0..args.runs {
        if args.runs > 1 {
            eprintln!("--- Run {}/{} ---", run + 1, args.runs);
        }

        let (output, diagnostics) =
            atelier_pipeline::diagnostics::analyze_with_diagnostics(&image_bytes, args.threshold)
                .map_err(|e| format!("Pipeline error: {e}"))?;

        if args.json {
            let json = serde_json::to_string_pretty(&diagnostics)
                .map_err(|e| format!("Error serializing diagnostics: {e}"))?;
            println!("{json}");
        } else {
            println!("{}", diagnostics.report());
            if run == 0 {
                print_palette("8-color palette", &output.palette_8);
                print_palette("12-color palette", &output.palette_12);
            }
        }

        // Export stages on the first run only.
        if run == 0
            && let Some(ref dir) = args.out_dir
        {
            match export_stages(&output, dir) {
                Ok(written) => {
                    eprintln!("{} stage images written to {}", written, dir.display());
                }
                Err(e) => eprintln!("Error exporting stages to {}: {e}", dir.display()),
            }
        }

        all_diagnostics.push(diagnostics);

        if args.runs > 1 {
            eprintln!();
        }
    }

    if args.runs > 1 {
        print_multi_run_summary(&all_diagnostics);
    }
    Ok(())
}

fn print_palette(title: &str, palette: &Palette) {
    println!("{title}");
    for entry in palette.entries() {
        let [r, g, b] = entry.color;
        println!("  #{r:02x}{g:02x}{b:02x}  {:>6.2}%", entry.ratio * 100.0);
    }
    println!();
}

/// Side length of one palette swatch in exported images.
const SWATCH: u32 = 32;

#[allow(clippy::cast_possible_truncation)]
fn palette_strip(palette: &Palette) -> RgbImage {
    let width = (palette.len() as u32).max(1) * SWATCH;
    RgbImage::from_fn(width, SWATCH, |x, _| {
        palette
            .entries()
            .get((x / SWATCH) as usize)
            .map_or(image::Rgb([0, 0, 0]), |entry| image::Rgb(entry.color))
    })
}

/// Save every stage image into `dir`. Returns how many files were written.
fn export_stages(output: &AnalysisOutput, dir: &Path) -> Result<usize, image::ImageError> {
    std::fs::create_dir_all(dir).map_err(image::ImageError::IoError)?;

    let gray = [
        ("binary", &output.binary),
        ("levels_3", &output.levels_3),
        ("levels_4", &output.levels_4),
        ("lab_l", &output.lab_l),
        ("hls_s", &output.hls_s),
        ("hls_s_inverted", &output.hls_s_inverted),
    ];
    let color = [
        ("original", &output.original),
        ("hue", &output.hue),
        ("clusters_8", &output.clusters_8),
        ("clusters_12", &output.clusters_12),
    ];

    for (name, image) in gray {
        image.save(dir.join(format!("{name}.png")))?;
    }
    for (name, image) in color {
        image.save(dir.join(format!("{name}.png")))?;
    }
    palette_strip(&output.palette_8).save(dir.join("palette_8.png"))?;
    palette_strip(&output.palette_12).save(dir.join("palette_12.png"))?;

    Ok(gray.len() + color.len() + 2)
}

/// Print aggregated statistics across multiple runs.
#[allow(clippy::cast_precision_loss)]
fn print_multi_run_summary(all_diagnostics: &[AnalysisDiagnostics]) {
    println!();
    println!(
        "Summary ({} runs)\n{}",
        all_diagnostics.len(),
        "=".repeat(60),
    );

    if all_diagnostics.is_empty() {
        println!("Warning: no diagnostics to summarize");
        return;
    }

    let durations: Vec<f64> = all_diagnostics
        .iter()
        .map(|d| d.total_duration.as_secs_f64() * 1000.0)
        .collect();

    let min = durations.iter().copied().reduce(f64::min).unwrap_or(0.0);
    let max = durations.iter().copied().reduce(f64::max).unwrap_or(0.0);
    let mean = durations.iter().sum::<f64>() / durations.len() as f64;

    println!("Total duration: min={min:.3}ms  mean={mean:.3}ms  max={max:.3}ms");

    println!();
    println!("{:<24} {:>12}", "Stage", "Mean (ms)");
    println!("{}", "-".repeat(40));

    let decode_mean = all_diagnostics
        .iter()
        .map(|d| d.decode_duration.as_secs_f64() * 1000.0)
        .sum::<f64>()
        / all_diagnostics.len() as f64;
    println!("{:<24} {decode_mean:>10.3}ms", "Decode");

    for stage in atelier_pipeline::StageId::ALL {
        let stage_durations: Vec<f64> = all_diagnostics
            .iter()
            .flat_map(|d| d.stages.iter())
            .filter(|s| s.stage == stage)
            .map(|s| s.duration.as_secs_f64() * 1000.0)
            .collect();

        if stage_durations.is_empty() {
            continue;
        }

        let stage_mean = stage_durations.iter().sum::<f64>() / stage_durations.len() as f64;
        println!("{:<24} {stage_mean:>10.3}ms", stage.label());
    }
}

fn simulate(args: &SimulateArgs) -> Result<(), String> {
    let config = match args.config_json {
        Some(ref json) => {
            JobsConfig::from_json(json).map_err(|e| format!("Error parsing --config-json: {e}"))?
        }
        None => JobsConfig::default(),
    };
    let image_bytes = read_image(&args.image_path)?;
    eprintln!("Config: {config:#?}");
    eprintln!();

    if args.stall {
        // Queued tasks are never drained, so the job stays pending.
        let service = Arc::new(AnalysisService::in_memory(ManualSpawner::new(), config));
        run_lifecycle(&service, args, image_bytes, &config)
    } else {
        let service = Arc::new(AnalysisService::new(
            ThreadSpawner,
            Arc::new(InMemoryResultStore::new()),
            Arc::new(Unlimited),
            Arc::new(SystemClock),
            config,
        ));
        run_lifecycle(&service, args, image_bytes, &config)
    }
}

fn run_lifecycle<S: Spawner>(
    service: &Arc<AnalysisService<S>>,
    args: &SimulateArgs,
    image_bytes: Vec<u8>,
    config: &JobsConfig,
) -> Result<(), String> {
    let client = AnalysisClient::new(
        Arc::clone(service),
        OwnerId::new(args.owner.as_str()),
        config.poll,
        Arc::new(SystemClock),
    );
    let cache = ObservationCache::new(Arc::clone(service), Arc::new(SystemClock), config);

    let report = |err: PollError| format!("Analysis error: {err}\n{}", err.remediation());

    let mut session = match client.begin(image_bytes, args.threshold).map_err(report)? {
        Begin::Resumed(session) => {
            info!(job_id = %session.job_id(), "resumed outstanding job");
            session
        }
        Begin::Submitted(session) => {
            info!(job_id = %session.job_id(), owner = %args.owner, "submitted job");
            session
        }
    };

    let mut last = None;
    let output = client
        .drive_with(
            &cache,
            &mut session,
            std::thread::sleep,
            |observation| {
                if last != Some((observation.status, observation.progress)) {
                    last = Some((observation.status, observation.progress));
                    eprintln!("  {:<8} {:>3}%", observation.status, observation.progress);
                }
            },
        )
        .map_err(report)?;

    info!(
        job_id = %session.job_id(),
        polls = session.observations(),
        cached = cache.hits(),
        "analysis finished"
    );
    println!(
        "Analysis of {}x{} image at threshold {}",
        output.dimensions.width, output.dimensions.height, output.threshold,
    );
    print_palette("8-color palette", &output.palette_8);

    if !args.keep_result
        && let Some(result) = client.result_of(&session).map_err(report)?
    {
        client.discard(result).map_err(report)?;
        info!(%result, "deleted result");
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::cast_possible_truncation)]
mod tests {
    use super::*;

    #[test]
    fn threshold_parser_accepts_presets_only() {
        assert_eq!(parse_threshold("80"), Ok(BinaryThreshold::L80));
        assert!(parse_threshold("81").is_err());
        assert!(parse_threshold("dark").is_err());
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["atelier-bench", "analyze", "in.png", "--threshold", "200"])
            .unwrap();
        let Command::Analyze(args) = cli.command else {
            unreachable!("parsed analyze");
        };
        assert_eq!(args.threshold, BinaryThreshold::L200);
        assert_eq!(args.runs, 1);
    }

    #[test]
    fn palette_strip_has_one_swatch_per_entry() {
        let output = atelier_pipeline::run(
            &RgbImage::from_pixel(4, 4, image::Rgb([10, 20, 30])),
            BinaryThreshold::L140,
        )
        .unwrap();
        let strip = palette_strip(&output.palette_12);
        assert_eq!(strip.dimensions(), (12 * SWATCH, SWATCH));
        assert_eq!(strip.get_pixel(0, 0).0, [10, 20, 30]);
    }

    fn simulate_args(extra: &[&str]) -> SimulateArgs {
        let argv = ["atelier-bench", "simulate", "unused.png"]
            .into_iter()
            .chain(extra.iter().copied());
        let Command::Simulate(args) = Cli::try_parse_from(argv).unwrap().command else {
            unreachable!("parsed simulate");
        };
        args
    }

    fn png_bytes() -> Vec<u8> {
        let image = RgbImage::from_fn(8, 6, |x, y| image::Rgb([(x * 30) as u8, (y * 40) as u8, 60]));
        let mut bytes = Vec::new();
        image
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn lifecycle_completes_and_frees_the_slot() {
        let config = JobsConfig::from_json(
            r#"{
                "poll": {"interval": 0.001, "max_observations": 100000, "stall_limit": 100000},
                "cache_ttl": 0.0
            }"#,
        )
        .unwrap();
        let service = Arc::new(AnalysisService::in_memory(ThreadSpawner, config));
        let args = simulate_args(&["--owner", "tester"]);

        run_lifecycle(&service, &args, png_bytes(), &config).unwrap();

        let owner = OwnerId::new("tester");
        assert!(service.outstanding_job(&owner).is_none());
        assert!(
            service
                .submit(&owner, png_bytes(), BinaryThreshold::L140)
                .is_ok()
        );
    }

    #[test]
    fn stalled_lifecycle_reports_remediation() {
        let config =
            JobsConfig::from_json(r#"{"poll": {"interval": 0.0, "stall_limit": 3}}"#).unwrap();
        let service = Arc::new(AnalysisService::in_memory(ManualSpawner::new(), config));
        let args = simulate_args(&["--stall"]);

        let err = run_lifecycle(&service, &args, png_bytes(), &config).unwrap_err();
        assert!(err.contains("worker may be down"));
    }
}

