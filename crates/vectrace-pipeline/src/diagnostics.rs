//! Pipeline diagnostics: timing, counts, and other metrics for each phase.
//!
//! Every [`Pipeline`](crate::Pipeline) run collects one
//! [`StageDiagnostics`] per phase. Timestamps are captured with the
//! `web-time` crate, which uses `performance.now()` on WASM and
//! `std::time::Instant` on native.
//!
//! Durations are serialized as fractional milliseconds (`f64`), since
//! `std::time::Duration` does not implement serde traits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{Color, Path};

/// Serde support for `std::time::Duration` as fractional milliseconds.
mod duration_ms_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional milliseconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        (duration.as_secs_f64() * 1000.0).serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional milliseconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(ms / 1000.0).map_err(|_| {
            serde::de::Error::custom(
                "duration milliseconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Diagnostics collected from a single pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDiagnostics {
    /// Background removal and selective blur.
    pub prepare: StageDiagnostics,
    /// Palette construction, assignment, and region merging.
    pub quantize: StageDiagnostics,
    /// Boundary scanning and coarse edge unification.
    pub scan: StageDiagnostics,
    /// Polyline simplification.
    pub simplify: StageDiagnostics,
    /// Curve fitting.
    pub trace: StageDiagnostics,
    /// Geometry, fine unification, hierarchy, gradients, and shapes.
    pub annotate: StageDiagnostics,
    /// Total wall-clock duration of the run (milliseconds).
    #[serde(with = "duration_ms_serde")]
    pub total_duration: Duration,
    /// Summary counts across all phases.
    pub summary: PipelineSummary,
}

/// Diagnostics for a single phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Wall-clock duration of this phase (milliseconds).
    #[serde(with = "duration_ms_serde")]
    pub duration: Duration,
    /// Phase-specific metrics.
    pub metrics: StageMetrics,
}

/// Phase-specific metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageMetrics {
    /// Background removal and blur.
    Prepare {
        /// Image width in pixels.
        width: u32,
        /// Image height in pixels.
        height: u32,
        /// Pixels made transparent by background removal.
        cleared_pixels: u64,
        /// Whether the selective blur ran.
        blurred: bool,
    },
    /// Palette and index map.
    Quantize {
        /// Final palette size.
        palette_size: usize,
        /// Whether entry 0 is the transparent color.
        transparent_entry: bool,
        /// Palette entries left without pixels after region merging.
        merged_regions: usize,
    },
    /// Boundary scanning.
    Scan {
        /// Closed outlines found.
        path_count: usize,
        /// Vertices across all outlines.
        point_count: usize,
        /// Grid cells unified across paths.
        shared_points: usize,
    },
    /// Simplification.
    Simplify {
        /// Outlines removed by the size filter.
        dropped: usize,
        /// Vertices before simplification.
        points_before: usize,
        /// Vertices after simplification.
        points_after: usize,
        /// `1.0 - after / before`.
        reduction_ratio: f64,
        /// Vertices pinned by shared edges.
        protected_points: usize,
    },
    /// Curve fitting.
    Trace {
        /// Straight segments emitted.
        line_segments: usize,
        /// Quadratic segments emitted.
        quadratic_segments: usize,
    },
    /// Everything after curve fitting.
    Annotate {
        /// Paths replaced by circles.
        circles: usize,
        /// Paths replaced by lines.
        lines: usize,
        /// Grid cells unified in the fine pass.
        shared_points: usize,
        /// Paths marked as holes.
        holes: usize,
        /// Paths with a detected gradient.
        gradients: usize,
        /// Shapes written.
        shapes: usize,
    },
}

/// High-level summary counts for the entire run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSummary {
    /// Source image width in pixels.
    pub image_width: u32,
    /// Source image height in pixels.
    pub image_height: u32,
    /// Final palette size.
    pub palette_size: usize,
    /// Traced paths across all layers.
    pub path_count: usize,
    /// Shapes written.
    pub shape_count: usize,
}

impl PipelineDiagnostics {
    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Tracing Diagnostics Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Image: {}x{}  |  Palette: {} colors",
            self.summary.image_width, self.summary.image_height, self.summary.palette_size,
        ));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<12} {:>10} {:>10}  {}",
            "Phase", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);
        let phases = [
            ("Prepare", &self.prepare),
            ("Quantize", &self.quantize),
            ("Scan", &self.scan),
            ("Simplify", &self.simplify),
            ("Trace", &self.trace),
            ("Annotate", &self.annotate),
        ];
        for (name, diag) in phases {
            let ms = duration_ms(diag.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let details = format_metrics(&diag.metrics);
            lines.push(format!("{name:<12} {ms:>8.3}ms {pct:>9.1}%  {details}"));
        }

        lines.push(String::new());
        lines.push(format!(
            "Paths: {}  |  Shapes: {}",
            self.summary.path_count, self.summary.shape_count,
        ));

        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Format phase metrics into a compact detail string.
fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::Prepare {
            width,
            height,
            cleared_pixels,
            blurred,
        } => format!(
            "{width}x{height} cleared={cleared_pixels} blur={}",
            if *blurred { "on" } else { "off" }
        ),
        StageMetrics::Quantize {
            palette_size,
            transparent_entry,
            merged_regions,
        } => format!(
            "{palette_size} colors{} merged={merged_regions}",
            if *transparent_entry { " (+transparent)" } else { "" }
        ),
        StageMetrics::Scan {
            path_count,
            point_count,
            shared_points,
        } => format!("{path_count} paths, {point_count} pts, {shared_points} shared"),
        StageMetrics::Simplify {
            dropped,
            points_before,
            points_after,
            reduction_ratio,
            protected_points,
        } => format!(
            "{points_before}->{points_after} pts ({:.1}% reduction) dropped={dropped} protected={protected_points}",
            reduction_ratio * 100.0,
        ),
        StageMetrics::Trace {
            line_segments,
            quadratic_segments,
        } => format!("{line_segments} lines, {quadratic_segments} quadratics"),
        StageMetrics::Annotate {
            circles,
            lines,
            shared_points,
            holes,
            gradients,
            shapes,
        } => format!(
            "circles={circles} lines={lines} shared={shared_points} holes={holes} gradients={gradients} shapes={shapes}",
        ),
    }
}

/// Count straight and quadratic segments.
pub(crate) fn segment_counts(layers: &[Vec<Path>]) -> (usize, usize) {
    layers
        .iter()
        .flatten()
        .flat_map(|p| &p.segments)
        .fold((0, 0), |(lines, quads), s| {
            if s.control().is_some() {
                (lines, quads + 1)
            } else {
                (lines + 1, quads)
            }
        })
}

/// Pixels whose alpha went from visible to transparent.
pub(crate) fn cleared_pixels(before: &crate::Bitmap, after: &crate::Bitmap) -> u64 {
    before
        .data()
        .chunks_exact(4)
        .zip(after.data().chunks_exact(4))
        .map(|(a, b)| {
            let was = Color::new(a[0], a[1], a[2], a[3]);
            let now = Color::new(b[0], b[1], b[2], b[3]);
            u64::from(!was.is_transparent() && now.is_transparent())
        })
        .sum()
}

/// `1.0 - after / before`, or 0 when nothing went in.
pub(crate) fn reduction_ratio(before: usize, after: usize) -> f64 {
    if before == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let ratio = 1.0 - after as f64 / before as f64;
    ratio
}
