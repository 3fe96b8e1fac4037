//! Incremental pipeline: advance phase by phase, inspecting each
//! intermediate result before continuing.
//!
//! Unlike [`crate::process`] which runs everything in one call,
//! [`Pipeline`] lets the caller drive execution one phase at a time:
//!
//! ```rust
//! # use vectrace_pipeline::{Bitmap, Pipeline, PipelineConfig, PipelineError};
//! # fn run(bitmap: Bitmap) -> Result<(), PipelineError> {
//! let traced = Pipeline::new(bitmap, PipelineConfig::default())
//!     .prepare()
//!     .quantize()?
//!     .scan()
//!     .simplify()
//!     .trace();
//! println!("{} layers", traced.traced().len());
//! let result = traced.annotate().into_result();
//! # Ok(())
//! # }
//! ```
//!
//! Each phase method consumes `self` and returns the next pipeline
//! state, carrying the intermediates later phases need.
//!
//! # Cancellation
//!
//! A progress callback installed with [`Pending::with_progress`] is
//! called at every checkpoint. Once it returns [`ControlFlow::Break`]
//! the remaining work of every later phase is skipped;
//! [`Prepared::quantize`] reports the cancellation as an error and
//! later phases expose it through `cancelled()`.

use std::ops::ControlFlow;

use web_time::Instant;

use crate::bitmap::Bitmap;
use crate::diagnostics::{
    PipelineDiagnostics, PipelineSummary, StageDiagnostics, StageMetrics, cleared_pixels,
    reduction_ratio, segment_counts,
};
use crate::outline::Outline;
use crate::progress::{self, Progress, ProgressStage};
use crate::shared_edges::{COARSE_RESOLUTION, FINE_RESOLUTION};
use crate::types::{
    Color, IndexMap, Layer, Path, PathMetadata, PipelineError, Shape, TraceResult,
};
use crate::{PipelineConfig, geometry, gradient, hierarchy, shapes, shared_edges};

/// State shared by every phase.
struct Run<'p> {
    config: PipelineConfig,
    source: Bitmap,
    progress: Box<Progress<'p>>,
    cancelled: Option<ProgressStage>,
    started: Instant,
}

impl Run<'_> {
    /// Report `stage`. Fails once the callback has asked to stop.
    fn checkpoint(&mut self, stage: ProgressStage) -> Result<(), PipelineError> {
        if let Some(at) = self.cancelled {
            return Err(PipelineError::Cancelled(at));
        }
        let outcome = progress::checkpoint(self.progress.as_mut(), stage);
        if outcome.is_err() {
            self.cancelled = Some(stage);
        }
        outcome
    }

    /// [`checkpoint`](Self::checkpoint) for infallible phases.
    fn proceed(&mut self, stage: ProgressStage) -> bool {
        self.checkpoint(stage).is_ok()
    }
}

fn stage_diagnostics(started: Instant, metrics: StageMetrics) -> StageDiagnostics {
    StageDiagnostics {
        duration: started.elapsed(),
        metrics,
    }
}

/// Number of palette entries with at least one pixel.
fn used_entries(index_map: &IndexMap, palette_len: usize) -> usize {
    let mut seen = vec![false; palette_len];
    for &cell in index_map.cells() {
        if let Ok(i) = usize::try_from(cell)
            && let Some(slot) = seen.get_mut(i)
        {
            *slot = true;
        }
    }
    seen.into_iter().filter(|&s| s).count()
}

fn empty_layers<T>(count: usize) -> Vec<Vec<T>> {
    std::iter::repeat_with(Vec::new).take(count).collect()
}

// ───────────────────────── Stage 0: Pending ──────────────────────────

/// Pipeline state before any processing has occurred.
///
/// Call [`prepare`](Self::prepare) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing — call .prepare() to continue"]
pub struct Pending<'p> {
    run: Run<'p>,
}

impl<'p> Pending<'p> {
    /// The source bitmap.
    #[must_use]
    pub const fn source(&self) -> &Bitmap {
        &self.run.source
    }

    /// Install a progress callback, replacing the current one.
    pub fn with_progress<'q>(
        self,
        progress: impl FnMut(ProgressStage, u8) -> ControlFlow<()> + 'q,
    ) -> Pending<'q> {
        Pending {
            run: Run {
                config: self.run.config,
                source: self.run.source,
                progress: Box::new(progress),
                cancelled: self.run.cancelled,
                started: self.run.started,
            },
        }
    }

    /// Remove the background and blur, then advance to [`Prepared`].
    ///
    /// Invalid bitmaps pass through untouched; [`Prepared::quantize`]
    /// rejects them.
    pub fn prepare(mut self) -> Prepared<'p> {
        let started = Instant::now();
        self.run.started = started;
        let mut bitmap = self.run.source.clone();

        if self.run.proceed(ProgressStage::Starting)
            && self.run.config.remove_background
            && self.run.proceed(ProgressStage::RemoveBackground)
        {
            let config = &self.run.config;
            bitmap = crate::background::remove_background(
                &bitmap,
                config.background_method,
                config.background_tolerance,
                config.min_background_ratio,
            );
        }

        let blurred =
            self.run.config.blur_radius > 0.0 && self.run.proceed(ProgressStage::Blur);
        if blurred {
            bitmap = crate::blur::selective_blur(
                &bitmap,
                self.run.config.blur_radius,
                self.run.config.blur_delta,
            );
        }

        let metrics = StageMetrics::Prepare {
            width: bitmap.width(),
            height: bitmap.height(),
            cleared_pixels: cleared_pixels(&self.run.source, &bitmap),
            blurred,
        };
        Prepared {
            run: self.run,
            bitmap,
            prepare: stage_diagnostics(started, metrics),
        }
    }
}

// ───────────────────────── Stage 1: Prepared ─────────────────────────

/// Pipeline state after background removal and selective blur.
///
/// Call [`quantize`](Self::quantize) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing — call .quantize() to continue"]
pub struct Prepared<'p> {
    run: Run<'p>,
    bitmap: Bitmap,
    prepare: StageDiagnostics,
}

impl<'p> Prepared<'p> {
    /// The bitmap every later phase reads.
    #[must_use]
    pub const fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    /// Build the palette, classify pixels and merge gradient regions.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] for an out-of-domain
    /// config, [`PipelineError::InvalidBitmap`] for an invalid source,
    /// [`PipelineError::EmptyPalette`] when no palette can be built and
    /// [`PipelineError::Cancelled`] when the progress callback stopped
    /// the run.
    pub fn quantize(mut self) -> Result<Quantized<'p>, PipelineError> {
        self.run.config.validate()?;
        self.bitmap.check()?;
        let started = Instant::now();

        self.run.checkpoint(ProgressStage::CreatePalette)?;
        let palette = crate::quantize::create_palette(
            &self.bitmap,
            self.run.config.number_of_colors,
            self.run.config.color_quantization_cycles,
        )?;

        self.run.checkpoint(ProgressStage::QuantizeColors)?;
        let quantized = crate::quantize::quantize(&self.bitmap, &palette, &self.run.config);
        let palette = quantized.palette;
        let mut index_map = quantized.index_map;

        let used_before = used_entries(&index_map, palette.len());
        if self.run.config.detect_gradients {
            self.run.checkpoint(ProgressStage::MergeRegions)?;
            index_map = crate::region_merge::merge_regions(
                &index_map,
                &palette,
                &self.bitmap,
                &self.run.config,
            );
        }
        let merged_regions = used_before.saturating_sub(used_entries(&index_map, palette.len()));

        log::debug!(
            "quantized to {} colors ({merged_regions} merged away)",
            palette.len()
        );
        let metrics = StageMetrics::Quantize {
            palette_size: palette.len(),
            transparent_entry: palette.first().is_some_and(|c| c.is_transparent()),
            merged_regions,
        };
        Ok(Quantized {
            run: self.run,
            bitmap: self.bitmap,
            palette,
            index_map,
            prepare: self.prepare,
            quantize: stage_diagnostics(started, metrics),
        })
    }
}

// ───────────────────────── Stage 2: Quantized ────────────────────────

/// Pipeline state after color quantization.
///
/// Call [`scan`](Self::scan) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing — call .scan() to continue"]
pub struct Quantized<'p> {
    run: Run<'p>,
    bitmap: Bitmap,
    palette: Vec<Color>,
    index_map: IndexMap,
    prepare: StageDiagnostics,
    quantize: StageDiagnostics,
}

impl<'p> Quantized<'p> {
    /// The palette; entry 0 is transparent when the source had transparency.
    #[must_use]
    pub fn palette(&self) -> &[Color] {
        &self.palette
    }

    /// Per-pixel palette indices.
    #[must_use]
    pub const fn index_map(&self) -> &IndexMap {
        &self.index_map
    }

    /// Scan region boundaries and, when enabled, unify shared edges on
    /// the coarse grid.
    pub fn scan(mut self) -> Scanned<'p> {
        let started = Instant::now();
        let layer_count = self.palette.len();
        let mut paths = if self.run.proceed(ProgressStage::ScanPaths) {
            crate::scan::scan_layers(
                &self.index_map,
                layer_count,
                self.run.config.path_omit_threshold,
            )
        } else {
            empty_layers(layer_count)
        };

        let (outlines, shared_points) = if self.run.config.unify_shared_edges
            && self.run.proceed(ProgressStage::UnifyCoarseEdges)
        {
            let registry = shared_edges::unify(
                &mut paths,
                COARSE_RESOLUTION,
                self.run.config.edge_snap_tolerance,
            );
            (registry.outlines(&paths), registry.shared_count())
        } else {
            let outlines = paths
                .iter()
                .map(|layer| layer.iter().map(Outline::from_path).collect())
                .collect();
            (outlines, 0)
        };

        let metrics = StageMetrics::Scan {
            path_count: paths.iter().map(Vec::len).sum(),
            point_count: outlines.iter().flatten().map(Outline::len).sum(),
            shared_points,
        };
        Scanned {
            run: self.run,
            bitmap: self.bitmap,
            palette: self.palette,
            index_map: self.index_map,
            paths,
            outlines,
            prepare: self.prepare,
            quantize: self.quantize,
            scan: stage_diagnostics(started, metrics),
        }
    }
}

// ───────────────────────── Stage 3: Scanned ──────────────────────────

/// Pipeline state after boundary scanning.
///
/// Call [`simplify`](Self::simplify) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing — call .simplify() to continue"]
pub struct Scanned<'p> {
    run: Run<'p>,
    bitmap: Bitmap,
    palette: Vec<Color>,
    index_map: IndexMap,
    paths: Vec<Vec<Path>>,
    outlines: Vec<Vec<Outline>>,
    prepare: StageDiagnostics,
    quantize: StageDiagnostics,
    scan: StageDiagnostics,
}

impl<'p> Scanned<'p> {
    /// Scanned boundary paths, one list per palette entry.
    #[must_use]
    pub fn paths(&self) -> &[Vec<Path>] {
        &self.paths
    }

    /// The same boundaries as outlines with shared vertices protected.
    #[must_use]
    pub fn outlines(&self) -> &[Vec<Outline>] {
        &self.outlines
    }

    /// Simplify every outline.
    pub fn simplify(mut self) -> Simplified<'p> {
        let started = Instant::now();
        let (simplified, dropped) = if self.run.proceed(ProgressStage::SimplifyPaths) {
            crate::simplify::simplify_layers(&self.outlines, &self.run.config)
        } else {
            (empty_layers(self.outlines.len()), 0)
        };

        let points_before: usize = self.outlines.iter().flatten().map(Outline::len).sum();
        let points_after: usize = simplified.iter().flatten().map(Outline::len).sum();
        let protected_points = self
            .outlines
            .iter()
            .flatten()
            .flat_map(|o| &o.protected)
            .filter(|&&p| p)
            .count();
        let metrics = StageMetrics::Simplify {
            dropped,
            points_before,
            points_after,
            reduction_ratio: reduction_ratio(points_before, points_after),
            protected_points,
        };
        Simplified {
            run: self.run,
            bitmap: self.bitmap,
            palette: self.palette,
            index_map: self.index_map,
            simplified,
            prepare: self.prepare,
            quantize: self.quantize,
            scan: self.scan,
            simplify: stage_diagnostics(started, metrics),
        }
    }

    /// The cancellation checkpoint, if the run was cancelled.
    #[must_use]
    pub const fn cancelled(&self) -> Option<ProgressStage> {
        self.run.cancelled
    }
}

// ───────────────────────── Stage 4: Simplified ───────────────────────

/// Pipeline state after simplification.
///
/// Call [`trace`](Self::trace) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing — call .trace() to continue"]
pub struct Simplified<'p> {
    run: Run<'p>,
    bitmap: Bitmap,
    palette: Vec<Color>,
    index_map: IndexMap,
    simplified: Vec<Vec<Outline>>,
    prepare: StageDiagnostics,
    quantize: StageDiagnostics,
    scan: StageDiagnostics,
    simplify: StageDiagnostics,
}

impl<'p> Simplified<'p> {
    /// The palette the outlines are layered by.
    #[must_use]
    pub fn palette(&self) -> &[Color] {
        &self.palette
    }

    /// The simplified outlines.
    #[must_use]
    pub fn simplified(&self) -> &[Vec<Outline>] {
        &self.simplified
    }

    /// Fit lines and quadratic curves to every outline.
    pub fn trace(mut self) -> Traced<'p> {
        let started = Instant::now();
        let traced = if self.run.proceed(ProgressStage::TracePaths) {
            crate::trace::trace_layers(&self.simplified, &self.run.config)
        } else {
            empty_layers(self.simplified.len())
        };
        let (line_segments, quadratic_segments) = segment_counts(&traced);
        let metrics = StageMetrics::Trace {
            line_segments,
            quadratic_segments,
        };
        Traced {
            run: self.run,
            bitmap: self.bitmap,
            palette: self.palette,
            index_map: self.index_map,
            simplified: self.simplified,
            traced,
            prepare: self.prepare,
            quantize: self.quantize,
            scan: self.scan,
            simplify: self.simplify,
            trace: stage_diagnostics(started, metrics),
        }
    }

    /// The cancellation checkpoint, if the run was cancelled.
    #[must_use]
    pub const fn cancelled(&self) -> Option<ProgressStage> {
        self.run.cancelled
    }
}

// ───────────────────────── Stage 5: Traced ───────────────────────────

/// Pipeline state after curve fitting.
///
/// Call [`annotate`](Self::annotate) to advance to the final stage.
#[must_use = "pipeline stages are consumed by advancing — call .annotate() to continue"]
pub struct Traced<'p> {
    run: Run<'p>,
    bitmap: Bitmap,
    palette: Vec<Color>,
    index_map: IndexMap,
    simplified: Vec<Vec<Outline>>,
    traced: Vec<Vec<Path>>,
    prepare: StageDiagnostics,
    quantize: StageDiagnostics,
    scan: StageDiagnostics,
    simplify: StageDiagnostics,
    trace: StageDiagnostics,
}

impl<'p> Traced<'p> {
    /// Traced paths, parallel to the simplified outlines.
    #[must_use]
    pub fn traced(&self) -> &[Vec<Path>] {
        &self.traced
    }

    /// Detect primitives, unify shared edges on the fine grid, analyze
    /// nesting, detect gradients and build the shape list.
    pub fn annotate(mut self) -> Annotated {
        let started = Instant::now();
        let mut paths = self.traced;

        let geometry = if self.run.config.detect_geometry
            && self.run.proceed(ProgressStage::DetectGeometry)
        {
            geometry::detect_layers(&self.simplified, &mut paths, &self.run.config)
        } else {
            geometry::GeometryCounts::default()
        };

        let shared_points = if self.run.config.unify_shared_edges
            && self.run.proceed(ProgressStage::UnifyFineEdges)
        {
            shared_edges::unify(&mut paths, FINE_RESOLUTION, self.run.config.edge_snap_tolerance)
                .shared_count()
        } else {
            0
        };

        let metadata = if self.run.proceed(ProgressStage::AnalyzeHierarchy) {
            hierarchy::analyze(&mut paths)
        } else {
            paths
                .iter()
                .map(|layer| vec![PathMetadata::default(); layer.len()])
                .collect()
        };

        let gradients = if self.run.config.detect_gradients
            && self.run.proceed(ProgressStage::DetectGradients)
        {
            gradient::detect_gradients(&paths, &self.bitmap, self.palette.len(), &self.run.config)
        } else {
            paths.iter().map(|layer| vec![None; layer.len()]).collect()
        };

        let layers: Vec<Layer> = paths
            .into_iter()
            .zip(metadata)
            .zip(gradients)
            .map(|((paths, metadata), gradients)| Layer {
                paths,
                metadata,
                gradients,
            })
            .collect();

        let shapes = if self.run.proceed(ProgressStage::WriteShapes) {
            shapes::build_shapes(&layers, &self.palette, &self.bitmap, &self.run.config)
        } else {
            Vec::new()
        };
        self.run.proceed(ProgressStage::Complete);

        let holes = layers
            .iter()
            .flat_map(|l| &l.metadata)
            .filter(|m| m.is_hole)
            .count();
        let gradient_count = layers
            .iter()
            .flat_map(|l| &l.gradients)
            .filter(|g| g.is_some())
            .count();
        let metrics = StageMetrics::Annotate {
            circles: geometry.circles,
            lines: geometry.lines,
            shared_points,
            holes,
            gradients: gradient_count,
            shapes: shapes.len(),
        };
        let annotate = stage_diagnostics(started, metrics);

        let summary = PipelineSummary {
            image_width: self.bitmap.width(),
            image_height: self.bitmap.height(),
            palette_size: self.palette.len(),
            path_count: layers.iter().map(|l| l.paths.len()).sum(),
            shape_count: shapes.len(),
        };
        let diagnostics = PipelineDiagnostics {
            prepare: self.prepare,
            quantize: self.quantize,
            scan: self.scan,
            simplify: self.simplify,
            trace: self.trace,
            annotate,
            total_duration: self.run.started.elapsed(),
            summary,
        };
        log::info!(
            "traced {}x{}: {} colors, {} shapes in {:.1}ms",
            diagnostics.summary.image_width,
            diagnostics.summary.image_height,
            diagnostics.summary.palette_size,
            diagnostics.summary.shape_count,
            diagnostics.total_duration.as_secs_f64() * 1000.0,
        );

        Annotated {
            cancelled: self.run.cancelled,
            result: TraceResult {
                dimensions: self.bitmap.dimensions(),
                palette: self.palette,
                index_map: self.index_map,
                layers,
                shapes,
            },
            diagnostics,
        }
    }

    /// The cancellation checkpoint, if the run was cancelled.
    #[must_use]
    pub const fn cancelled(&self) -> Option<ProgressStage> {
        self.run.cancelled
    }
}

// ───────────────────────── Stage 6: Annotated ────────────────────────

/// Pipeline state after annotation — the final stage.
///
/// Call [`into_result`](Self::into_result) to extract the
/// [`TraceResult`].
#[must_use = "call .into_result() to extract the TraceResult"]
pub struct Annotated {
    cancelled: Option<ProgressStage>,
    result: TraceResult,
    diagnostics: PipelineDiagnostics,
}

impl Annotated {
    /// The annotated layers.
    #[must_use]
    pub fn layers(&self) -> &[Layer] {
        &self.result.layers
    }

    /// Render-ready shapes, back to front.
    #[must_use]
    pub fn shapes(&self) -> &[Shape] {
        &self.result.shapes
    }

    /// Timing and metrics for every phase.
    #[must_use]
    pub const fn diagnostics(&self) -> &PipelineDiagnostics {
        &self.diagnostics
    }

    /// The cancellation checkpoint, if the run was cancelled. The
    /// result of a cancelled run is incomplete.
    #[must_use]
    pub const fn cancelled(&self) -> Option<ProgressStage> {
        self.cancelled
    }

    /// Consume the pipeline and return the [`TraceResult`].
    #[must_use]
    pub fn into_result(self) -> TraceResult {
        self.result
    }

    /// Consume the pipeline and return the result with its diagnostics.
    #[must_use]
    pub fn into_parts(self) -> (TraceResult, PipelineDiagnostics) {
        (self.result, self.diagnostics)
    }
}

// ──────────────────── PipelineStage trait + Stage enum ────────────────

/// Total number of stages in the pipeline.
pub const STAGE_COUNT: usize = 7;

/// Trait implemented by every pipeline stage, enabling uniform iteration.
///
/// Each stage struct implements it, and [`Stage`] delegates to
/// whichever variant it holds.
pub trait PipelineStage<'p>: Sized {
    /// Machine-friendly name of this stage.
    const NAME: &'static str;

    /// Zero-based index of this stage.
    const INDEX: usize;

    /// Metrics for the work done to reach this stage, or `None` for
    /// [`Pending`].
    fn metrics(&self) -> Option<StageMetrics>;

    /// Advance to the next stage; `Ok(None)` at the final stage.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] when quantization fails.
    fn next(self) -> Result<Option<Stage<'p>>, PipelineError>;

    /// Run all remaining stages.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] if a remaining fallible stage fails.
    fn complete(self) -> Result<Annotated, PipelineError>;
}

impl<'p> PipelineStage<'p> for Pending<'p> {
    const NAME: &'static str = "source";
    const INDEX: usize = 0;

    fn metrics(&self) -> Option<StageMetrics> {
        None
    }

    fn next(self) -> Result<Option<Stage<'p>>, PipelineError> {
        Ok(Some(Stage::Prepared(self.prepare())))
    }

    fn complete(self) -> Result<Annotated, PipelineError> {
        self.prepare().complete()
    }
}

impl<'p> PipelineStage<'p> for Prepared<'p> {
    const NAME: &'static str = "prepare";
    const INDEX: usize = 1;

    fn metrics(&self) -> Option<StageMetrics> {
        Some(self.prepare.metrics.clone())
    }

    fn next(self) -> Result<Option<Stage<'p>>, PipelineError> {
        Ok(Some(Stage::Quantized(self.quantize()?)))
    }

    fn complete(self) -> Result<Annotated, PipelineError> {
        self.quantize()?.complete()
    }
}

impl<'p> PipelineStage<'p> for Quantized<'p> {
    const NAME: &'static str = "quantize";
    const INDEX: usize = 2;

    fn metrics(&self) -> Option<StageMetrics> {
        Some(self.quantize.metrics.clone())
    }

    fn next(self) -> Result<Option<Stage<'p>>, PipelineError> {
        Ok(Some(Stage::Scanned(self.scan())))
    }

    fn complete(self) -> Result<Annotated, PipelineError> {
        self.scan().complete()
    }
}

impl<'p> PipelineStage<'p> for Scanned<'p> {
    const NAME: &'static str = "scan";
    const INDEX: usize = 3;

    fn metrics(&self) -> Option<StageMetrics> {
        Some(self.scan.metrics.clone())
    }

    fn next(self) -> Result<Option<Stage<'p>>, PipelineError> {
        Ok(Some(Stage::Simplified(self.simplify())))
    }

    fn complete(self) -> Result<Annotated, PipelineError> {
        self.simplify().complete()
    }
}

impl<'p> PipelineStage<'p> for Simplified<'p> {
    const NAME: &'static str = "simplify";
    const INDEX: usize = 4;

    fn metrics(&self) -> Option<StageMetrics> {
        Some(self.simplify.metrics.clone())
    }

    fn next(self) -> Result<Option<Stage<'p>>, PipelineError> {
        Ok(Some(Stage::Traced(self.trace())))
    }

    fn complete(self) -> Result<Annotated, PipelineError> {
        self.trace().complete()
    }
}

impl<'p> PipelineStage<'p> for Traced<'p> {
    const NAME: &'static str = "trace";
    const INDEX: usize = 5;

    fn metrics(&self) -> Option<StageMetrics> {
        Some(self.trace.metrics.clone())
    }

    fn next(self) -> Result<Option<Stage<'p>>, PipelineError> {
        Ok(Some(Stage::Annotated(self.annotate())))
    }

    fn complete(self) -> Result<Annotated, PipelineError> {
        Ok(self.annotate())
    }
}

impl<'p> PipelineStage<'p> for Annotated {
    const NAME: &'static str = "annotate";
    const INDEX: usize = 6;

    fn metrics(&self) -> Option<StageMetrics> {
        Some(self.diagnostics.annotate.metrics.clone())
    }

    fn next(self) -> Result<Option<Stage<'p>>, PipelineError> {
        Ok(None)
    }

    fn complete(self) -> Result<Annotated, PipelineError> {
        Ok(self)
    }
}

/// Enum wrapping all pipeline stages for uniform, loopable access.
///
/// ```rust
/// # use vectrace_pipeline::{Bitmap, Pipeline, PipelineConfig, PipelineError};
/// # use vectrace_pipeline::pipeline::{Advance, Stage};
/// # fn run(bitmap: Bitmap) -> Result<(), PipelineError> {
/// let mut stage: Stage = Pipeline::new(bitmap, PipelineConfig::default()).into();
/// loop {
///     match stage.advance()? {
///         Advance::Next(next) => stage = next,
///         Advance::Complete(done) => { stage = done; break; }
///     }
/// }
/// let result = stage.complete()?.into_result();
/// # Ok(())
/// # }
/// ```
#[must_use]
pub enum Stage<'p> {
    /// See [`Pending`].
    Pending(Pending<'p>),
    /// See [`Prepared`].
    Prepared(Prepared<'p>),
    /// See [`Quantized`].
    Quantized(Quantized<'p>),
    /// See [`Scanned`].
    Scanned(Scanned<'p>),
    /// See [`Simplified`].
    Simplified(Simplified<'p>),
    /// See [`Traced`].
    Traced(Traced<'p>),
    /// See [`Annotated`].
    Annotated(Annotated),
}

/// Compile-time guard: adding a [`Stage`] variant breaks this match
/// until [`STAGE_COUNT`] is revisited.
#[allow(dead_code, clippy::match_same_arms)]
const fn _stage_count_guard(s: &Stage<'_>) {
    match s {
        Stage::Pending(_)
        | Stage::Prepared(_)
        | Stage::Quantized(_)
        | Stage::Scanned(_)
        | Stage::Simplified(_)
        | Stage::Traced(_)
        | Stage::Annotated(_) => {}
    }
}

/// Result of [`Stage::advance`]: either the next stage or the final
/// stage returned unchanged.
#[must_use]
pub enum Advance<'p> {
    /// The pipeline advanced to this stage.
    Next(Stage<'p>),
    /// The pipeline was already at the final stage.
    Complete(Stage<'p>),
}

/// Delegate a method call to whichever `Stage` variant is active.
macro_rules! delegate {
    ($self:ident, $method:ident $(, $arg:expr)*) => {
        match $self {
            Self::Pending(s) => s.$method($($arg),*),
            Self::Prepared(s) => s.$method($($arg),*),
            Self::Quantized(s) => s.$method($($arg),*),
            Self::Scanned(s) => s.$method($($arg),*),
            Self::Simplified(s) => s.$method($($arg),*),
            Self::Traced(s) => s.$method($($arg),*),
            Self::Annotated(s) => s.$method($($arg),*),
        }
    };
}

impl<'p> Stage<'p> {
    /// Name of the current stage.
    #[must_use]
    pub fn name(&self) -> &'static str {
        delegate!(self, name)
    }

    /// Zero-based index of the current stage.
    #[must_use]
    pub fn index(&self) -> usize {
        delegate!(self, index)
    }

    /// Metrics for the work done to reach the current stage.
    #[must_use]
    pub fn metrics(&self) -> Option<StageMetrics> {
        delegate!(self, metrics)
    }

    /// Whether the pipeline is at the final stage.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self, Self::Annotated(_))
    }

    /// Advance to the next stage; `Ok(None)` consumes the final stage.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] if a fallible transition fails.
    pub fn next(self) -> Result<Option<Self>, PipelineError> {
        delegate!(self, next)
    }

    /// Advance to the next stage, returning `self` unchanged at the end.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] if a fallible transition fails.
    pub fn advance(self) -> Result<Advance<'p>, PipelineError> {
        if self.is_complete() {
            return Ok(Advance::Complete(self));
        }
        // Only the final stage returns `None`, and it was handled above.
        #[allow(clippy::unreachable)]
        let next = self
            .next()?
            .unwrap_or_else(|| unreachable!("non-final stage returned None from next()"));
        Ok(Advance::Next(next))
    }

    /// Run all remaining stages.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] if a remaining fallible stage fails.
    pub fn complete(self) -> Result<Annotated, PipelineError> {
        delegate!(self, complete)
    }
}

// Lets the macro call `.name()` and `.index()`; associated constants
// are not reachable through `self`.
trait StageMetadata {
    fn name(&self) -> &'static str;
    fn index(&self) -> usize;
}

impl<'p, T: PipelineStage<'p>> StageMetadata for T {
    fn name(&self) -> &'static str {
        <T as PipelineStage<'p>>::NAME
    }

    fn index(&self) -> usize {
        <T as PipelineStage<'p>>::INDEX
    }
}

macro_rules! stage_from {
    ($($variant:ident),*) => {
        $(
            impl<'p> From<$variant<'p>> for Stage<'p> {
                fn from(s: $variant<'p>) -> Self {
                    Self::$variant(s)
                }
            }
        )*
    };
}

stage_from!(Pending, Prepared, Quantized, Scanned, Simplified, Traced);

impl From<Annotated> for Stage<'_> {
    fn from(s: Annotated) -> Self {
        Self::Annotated(s)
    }
}

// ───────────────────── Pipeline entry point ──────────────────────────

/// Incremental tracing pipeline.
///
/// Created via [`Pipeline::new`], which stores the bitmap and config
/// without doing any processing. Each phase method consumes the
/// current state and returns the next, so phases cannot be skipped or
/// reordered.
pub struct Pipeline;

impl Pipeline {
    /// Create a new pipeline from a bitmap and config.
    ///
    /// No processing is performed. Call [`.prepare()`](Pending::prepare)
    /// (or convert to a [`Stage`] and loop) to begin.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(bitmap: Bitmap, config: PipelineConfig) -> Pending<'static> {
        Pending {
            run: Run {
                config,
                source: bitmap,
                progress: Box::new(|_, _| ControlFlow::Continue(())),
                cancelled: None,
                started: Instant::now(),
            },
        }
    }
}
