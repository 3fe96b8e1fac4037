//! Progress reporting and cooperative cancellation.
//!
//! The pipeline calls a [`Progress`] callback at each checkpoint with the
//! stage about to run and a nominal completion percentage. Returning
//! [`ControlFlow::Break`] aborts the run with
//! [`crate::PipelineError::Cancelled`] at that checkpoint.

use std::fmt;
use std::ops::ControlFlow;

use serde::{Deserialize, Serialize};

use crate::types::PipelineError;

/// Checkpoints reported while tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    /// Input validated, nothing done yet.
    Starting,
    /// Background detection and removal.
    RemoveBackground,
    /// Selective blur.
    Blur,
    /// Octree palette construction and refinement.
    CreatePalette,
    /// Per-pixel palette assignment and palette cleanup.
    QuantizeColors,
    /// Gradient-aware region merging.
    MergeRegions,
    /// Boundary scanning.
    ScanPaths,
    /// Coarse shared-edge unification.
    UnifyCoarseEdges,
    /// Polyline simplification.
    SimplifyPaths,
    /// Curve fitting.
    TracePaths,
    /// Line and circle detection.
    DetectGeometry,
    /// Fine shared-edge unification.
    UnifyFineEdges,
    /// Nesting and winding analysis.
    AnalyzeHierarchy,
    /// Linear gradient detection.
    DetectGradients,
    /// Shape list construction.
    WriteShapes,
    /// Done.
    Complete,
}

impl ProgressStage {
    /// Nominal completion percentage when this stage starts.
    #[must_use]
    pub const fn percent(self) -> u8 {
        match self {
            Self::Starting => 0,
            Self::RemoveBackground => 2,
            Self::Blur => 5,
            Self::CreatePalette => 10,
            Self::QuantizeColors => 20,
            Self::MergeRegions => 30,
            Self::ScanPaths => 35,
            Self::UnifyCoarseEdges => 45,
            Self::SimplifyPaths => 50,
            Self::TracePaths => 60,
            Self::DetectGeometry => 70,
            Self::UnifyFineEdges => 75,
            Self::AnalyzeHierarchy => 80,
            Self::DetectGradients => 85,
            Self::WriteShapes => 95,
            Self::Complete => 100,
        }
    }

    /// Short machine-friendly name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::RemoveBackground => "remove_background",
            Self::Blur => "blur",
            Self::CreatePalette => "create_palette",
            Self::QuantizeColors => "quantize_colors",
            Self::MergeRegions => "merge_regions",
            Self::ScanPaths => "scan_paths",
            Self::UnifyCoarseEdges => "unify_coarse_edges",
            Self::SimplifyPaths => "simplify_paths",
            Self::TracePaths => "trace_paths",
            Self::DetectGeometry => "detect_geometry",
            Self::UnifyFineEdges => "unify_fine_edges",
            Self::AnalyzeHierarchy => "analyze_hierarchy",
            Self::DetectGradients => "detect_gradients",
            Self::WriteShapes => "write_shapes",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for ProgressStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Progress callback. Return [`ControlFlow::Break`] to cancel.
pub type Progress<'a> = dyn FnMut(ProgressStage, u8) -> ControlFlow<()> + 'a;

/// Report `stage` and translate a cancellation request into an error.
pub(crate) fn checkpoint(
    progress: &mut Progress<'_>,
    stage: ProgressStage,
) -> Result<(), PipelineError> {
    match progress(stage, stage.percent()) {
        ControlFlow::Continue(()) => Ok(()),
        ControlFlow::Break(()) => {
            log::info!("tracing cancelled at {stage}");
            Err(PipelineError::Cancelled(stage))
        }
    }
}
