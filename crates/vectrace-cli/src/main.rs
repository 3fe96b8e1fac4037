//! vectrace: trace a raster image into an SVG.
//!
//! Decodes the input image, runs the tracing pipeline with configurable
//! parameters, writes the SVG and prints per-phase diagnostics. Useful
//! for:
//!
//! - Converting logos, icons and flat illustrations to vector form
//! - Tuning palette size, simplification and detection knobs
//! - Measuring per-phase durations to identify bottlenecks
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin vectrace -- [OPTIONS] <IMAGE_PATH>
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::parser::ValueSource;
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser, ValueEnum};
use vectrace_pipeline::{BackgroundMethod, Bitmap, PipelineConfig};

/// Raster-to-vector tracer.
///
/// Quantizes the image to a small palette, traces every color region
/// into quadratic curves and writes one SVG path per region.
#[derive(Parser)]
#[command(name = "vectrace", version)]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Path to the input image (PNG, JPEG, BMP, WebP).
    image_path: PathBuf,

    /// Write SVG output to this file (defaults to the input path with
    /// an `.svg` extension).
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Pipeline config JSON file. Explicit flags override its values.
    #[arg(long)]
    config_json: Option<PathBuf>,

    /// Output diagnostics as JSON instead of a human-readable report.
    #[arg(long)]
    json: bool,

    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Maximum number of palette colors.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_NUMBER_OF_COLORS)]
    colors: usize,

    /// Palette refinement passes.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_COLOR_QUANTIZATION_CYCLES)]
    cycles: usize,

    /// Straight-line fit threshold in pixels.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_LINE_THRESHOLD)]
    line_threshold: f64,

    /// Quadratic fit threshold in pixels.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_QUADRATIC_THRESHOLD)]
    quadratic_threshold: f64,

    /// Regions with at most this many boundary points are dropped.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_PATH_OMIT_THRESHOLD)]
    path_omit: usize,

    /// Selective blur radius (0 disables).
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_BLUR_RADIUS)]
    blur_radius: f64,

    /// Selective blur color delta.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_BLUR_DELTA)]
    blur_delta: f64,

    /// Remove the background before tracing.
    #[arg(long)]
    remove_background: bool,

    /// Background detection method.
    #[arg(long, value_enum, default_value_t = Background::Auto)]
    background_method: Background,

    /// Background color tolerance (Manhattan RGBA distance).
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_BACKGROUND_TOLERANCE)]
    background_tolerance: u32,

    /// Enable Douglas-Peucker simplification.
    #[arg(long)]
    douglas_peucker: bool,

    /// Douglas-Peucker tolerance in pixels.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_DOUGLAS_PEUCKER_TOLERANCE)]
    dp_tolerance: f64,

    /// Enable Visvalingam-Whyatt simplification.
    #[arg(long)]
    visvalingam: bool,

    /// Visvalingam-Whyatt tolerance in pixels.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_VISVALINGAM_TOLERANCE)]
    vw_tolerance: f64,

    /// Drop regions below the small-object size limits.
    #[arg(long)]
    filter_small_objects: bool,

    /// Replace near-perfect lines and circles by exact primitives.
    #[arg(long)]
    detect_geometry: bool,

    /// Detect linear gradients and merge gradient bands.
    #[arg(long)]
    detect_gradients: bool,

    /// Output coordinate scale.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_SCALE)]
    scale: f64,

    /// Decimal places for coordinates (negative keeps full precision).
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_ROUND_COORDINATES, allow_negative_numbers = true)]
    round: i32,

    /// Emit a viewBox instead of width and height.
    #[arg(long)]
    view_box: bool,
}

/// Background detection method selection.
#[derive(Clone, Copy, ValueEnum)]
enum Background {
    /// Flood fill from the corners.
    Simple,
    /// Compare corner flood and border histogram candidates.
    Auto,
}

impl From<Background> for BackgroundMethod {
    fn from(b: Background) -> Self {
        match b {
            Background::Simple => Self::Simple,
            Background::Auto => Self::Auto,
        }
    }
}

/// Whether `id` was given on the command line rather than defaulted.
fn explicit(matches: &ArgMatches, id: &str) -> bool {
    matches.value_source(id) == Some(ValueSource::CommandLine)
}

/// Build a [`PipelineConfig`] from CLI arguments.
///
/// The base is the `--config-json` file when given, otherwise the
/// defaults. Flags given on the command line override the base; with no
/// config file every flag applies, including its default.
fn config_from_cli(cli: &Cli, matches: &ArgMatches) -> Result<PipelineConfig, String> {
    let (mut config, from_file) = match &cli.config_json {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .map_err(|e| format!("Error reading {}: {e}", path.display()))?;
            let config = serde_json::from_str(&json)
                .map_err(|e| format!("Error parsing --config-json: {e}"))?;
            (config, true)
        }
        None => (PipelineConfig::default(), false),
    };
    let apply = |id: &str| !from_file || explicit(matches, id);

    macro_rules! overlay {
        ($($id:literal => $field:ident = $value:expr),* $(,)?) => {
            $(
                if apply($id) {
                    config.$field = $value;
                }
            )*
        };
    }

    overlay! {
        "colors" => number_of_colors = cli.colors,
        "cycles" => color_quantization_cycles = cli.cycles,
        "line_threshold" => line_threshold = cli.line_threshold,
        "quadratic_threshold" => quadratic_threshold = cli.quadratic_threshold,
        "path_omit" => path_omit_threshold = cli.path_omit,
        "blur_radius" => blur_radius = cli.blur_radius,
        "blur_delta" => blur_delta = cli.blur_delta,
        "remove_background" => remove_background = cli.remove_background,
        "background_method" => background_method = cli.background_method.into(),
        "background_tolerance" => background_tolerance = cli.background_tolerance,
        "douglas_peucker" => douglas_peucker = cli.douglas_peucker,
        "dp_tolerance" => douglas_peucker_tolerance = cli.dp_tolerance,
        "visvalingam" => visvalingam_whyatt = cli.visvalingam,
        "vw_tolerance" => visvalingam_tolerance = cli.vw_tolerance,
        "filter_small_objects" => filter_small_objects = cli.filter_small_objects,
        "detect_geometry" => detect_geometry = cli.detect_geometry,
        "detect_gradients" => detect_gradients = cli.detect_gradients,
        "scale" => scale = cli.scale,
        "round" => round_coordinates = cli.round,
        "view_box" => view_box = cli.view_box,
    }

    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.as_str()))
        .init();
}

fn default_output(input: &Path) -> PathBuf {
    input.with_extension("svg")
}

fn main() -> ExitCode {
    let matches = Cli::command().get_matches();
    let cli = match Cli::from_arg_matches(&matches) {
        Ok(cli) => cli,
        Err(e) => e.exit(),
    };
    init_logging(cli.verbose);

    let config = match config_from_cli(&cli, &matches) {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let image_bytes = match std::fs::read(&cli.image_path) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Error reading {}: {e}", cli.image_path.display());
            return ExitCode::FAILURE;
        }
    };
    log::info!(
        "image: {} ({} bytes)",
        cli.image_path.display(),
        image_bytes.len()
    );

    let bitmap = match Bitmap::decode(&image_bytes) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("Error decoding {}: {e}", cli.image_path.display());
            return ExitCode::FAILURE;
        }
    };

    let mut last_reported = None;
    let outcome = vectrace_pipeline::process_with_progress(&bitmap, &config, &mut |stage, pct| {
        if last_reported != Some(stage) {
            log::debug!("{pct:>3}% {stage}");
            last_reported = Some(stage);
        }
        std::ops::ControlFlow::Continue(())
    });
    let (result, diagnostics) = match outcome {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Pipeline error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if cli.json {
        match serde_json::to_string_pretty(&diagnostics) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Error serializing diagnostics: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        eprintln!("{}", diagnostics.report());
    }

    let title = cli
        .image_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("vectrace");
    let config_json = match serde_json::to_string(&config) {
        Ok(json) => json,
        Err(e) => {
            eprintln!("Error serializing config: {e}");
            return ExitCode::FAILURE;
        }
    };
    let description = format!(
        "{} colors, {} shapes",
        result.palette.len(),
        result.shapes.len()
    );
    let metadata = vectrace_export::SvgMetadata {
        title: Some(title),
        description: config.show_description.then_some(description.as_str()),
        config_json: Some(&config_json),
    };
    let svg = match vectrace_export::to_svg(&result, &config, &metadata) {
        Ok(svg) => svg,
        Err(e) => {
            eprintln!("Export error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let svg_path = cli
        .output
        .clone()
        .unwrap_or_else(|| default_output(&cli.image_path));
    match std::fs::write(&svg_path, &svg) {
        Ok(()) => {
            log::info!("SVG written to {} ({} bytes)", svg_path.display(), svg.len());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error writing SVG to {}: {e}", svg_path.display());
            ExitCode::FAILURE
        }
    }
}
