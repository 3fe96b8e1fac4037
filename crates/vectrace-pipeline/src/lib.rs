//! vectrace-pipeline: raster-to-vector tracing core (sans-IO).
//!
//! Converts an RGBA bitmap into layered vector paths through:
//! background removal -> selective blur -> palette quantization ->
//! region merging -> boundary scanning -> shared-edge unification ->
//! simplification -> curve fitting -> geometry detection -> nesting
//! analysis -> gradient detection -> shape building.
//!
//! This crate has **no I/O dependencies** -- it operates on in-memory
//! bitmaps and returns structured data. SVG serialization lives in
//! `vectrace-export`, file handling in `vectrace-cli`.

pub mod background;
pub mod bitmap;
pub mod blur;
pub mod color;
pub mod config;
pub mod diagnostics;
pub mod geometry;
pub mod gradient;
pub mod hierarchy;
pub mod linalg;
pub mod octree;
pub mod outline;
pub mod pipeline;
pub mod progress;
pub mod quantize;
pub mod region_merge;
pub mod scan;
pub mod shapes;
pub mod shared_edges;
pub mod simplify;
pub mod trace;
pub mod types;
pub mod visvalingam;

use std::ops::ControlFlow;

pub use bitmap::Bitmap;
pub use config::{BackgroundMethod, PipelineConfig};
pub use diagnostics::{PipelineDiagnostics, StageDiagnostics, StageMetrics};
pub use outline::Outline;
pub use pipeline::Pipeline;
pub use progress::{Progress, ProgressStage};
pub use simplify::{Simplifier, SimplifierKind};
pub use types::{
    Bounds, Color, Dimensions, FillRule, IndexMap, Layer, LinearGradient, Paint, Path,
    PathMetadata, PipelineError, Point, Segment, Shape, TraceResult,
};

/// Trace a bitmap into layered vector paths.
///
/// # Pipeline steps
///
/// 1. Optional background removal and selective blur
/// 2. Octree palette, refinement cycles, pixel assignment
/// 3. Gradient-aware region merging (with gradient detection)
/// 4. Boundary scanning and coarse shared-edge unification
/// 5. Simplification (Douglas-Peucker, Visvalingam-Whyatt, refinement,
///    small-object filter)
/// 6. Line and quadratic curve fitting
/// 7. Optional line and circle replacement
/// 8. Fine shared-edge unification
/// 9. Nesting and winding analysis
/// 10. Optional linear gradient detection
/// 11. Shape list construction
///
/// # Errors
///
/// Returns [`PipelineError::InvalidConfig`] for an out-of-domain config,
/// [`PipelineError::InvalidBitmap`] for an invalid bitmap and
/// [`PipelineError::EmptyPalette`] if quantization yields no colors.
pub fn process(
    bitmap: &Bitmap,
    config: &PipelineConfig,
) -> Result<(TraceResult, PipelineDiagnostics), PipelineError> {
    process_with_progress(bitmap, config, &mut |_, _| ControlFlow::Continue(()))
}

/// [`process`] with a progress callback that may cancel the run.
///
/// # Errors
///
/// The errors of [`process`], plus [`PipelineError::Cancelled`] naming
/// the checkpoint at which `progress` returned [`ControlFlow::Break`].
pub fn process_with_progress(
    bitmap: &Bitmap,
    config: &PipelineConfig,
    progress: &mut Progress<'_>,
) -> Result<(TraceResult, PipelineDiagnostics), PipelineError> {
    config.validate()?;
    bitmap.check()?;
    let done = Pipeline::new(bitmap.clone(), config.clone())
        .with_progress(progress)
        .prepare()
        .quantize()?
        .scan()
        .simplify()
        .trace()
        .annotate();
    if let Some(stage) = done.cancelled() {
        return Err(PipelineError::Cancelled(stage));
    }
    Ok(done.into_parts())
}
