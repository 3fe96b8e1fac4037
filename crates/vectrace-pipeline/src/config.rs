//! Tracing configuration: one flat table of knobs threaded read-only
//! through every stage.

use serde::{Deserialize, Serialize};

use crate::types::PipelineError;

/// How the background color is chosen before removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundMethod {
    /// Largest area flood-filled from the four corners.
    Simple,
    /// Best of the corner flood and the dominant border color, scored by
    /// border coverage and connectivity.
    #[default]
    Auto,
}

/// Configuration for the tracing pipeline.
///
/// Deserialization fills missing fields from [`Default`], so partial
/// JSON documents are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct PipelineConfig {
    // --- curve fitting ---
    /// Maximum deviation (pixels) for a window to be fitted by one line.
    pub line_threshold: f64,
    /// Maximum deviation (pixels) for a window to be fitted by one quadratic.
    pub quadratic_threshold: f64,
    /// Scanned outlines with fewer boundary points are dropped.
    pub path_omit_threshold: usize,

    // --- palette ---
    /// Target palette size.
    pub number_of_colors: usize,
    /// Palette refinement passes after octree construction.
    pub color_quantization_cycles: usize,

    // --- blur ---
    /// Selective blur radius (0 disables, capped at 5).
    pub blur_radius: f64,
    /// Pixels whose blurred value moves further than this (summed RGBA)
    /// keep their original value.
    pub blur_delta: f64,

    // --- background ---
    /// Make the detected background fully transparent.
    pub remove_background: bool,
    /// Background detection strategy.
    pub background_method: BackgroundMethod,
    /// Summed RGBA difference under which a pixel matches the background.
    pub background_tolerance: u32,
    /// Auto mode skips removal when the background's largest connected
    /// share of the image is below this fraction.
    pub min_background_ratio: f64,

    // --- Douglas-Peucker ---
    /// Run Douglas-Peucker simplification.
    pub douglas_peucker: bool,
    /// Douglas-Peucker deviation tolerance in pixels.
    pub douglas_peucker_tolerance: f64,
    /// Curvature protection in `[0, 1]`. Values above 0.5 keep every
    /// vertex turning by more than `0.1 + 0.9 · value` radians.
    pub douglas_peucker_curve_protection: f64,

    // --- Visvalingam-Whyatt ---
    /// Run Visvalingam-Whyatt simplification.
    pub visvalingam_whyatt: bool,
    /// Visvalingam-Whyatt tolerance; triangles under `tolerance²` go.
    pub visvalingam_tolerance: f64,

    // --- advanced simplification ---
    /// Interior vertices closer than this to their neighbors' chord are dropped.
    pub collinear_tolerance: f64,
    /// Interior vertices closer than this to the previous kept vertex are dropped.
    pub min_segment_length: f64,
    /// Laplacian smoothing weight in `[0, 1]` (0 disables).
    pub curve_smoothing: f64,
    /// Double the collinear and short-segment tolerances.
    pub aggressive_simplification: bool,

    // --- small objects ---
    /// Drop closed outlines below the minima below.
    pub filter_small_objects: bool,
    /// Minimum enclosed area in square pixels.
    pub min_object_area: f64,
    /// Minimum bounding-box width.
    pub min_object_width: f64,
    /// Minimum bounding-box height.
    pub min_object_height: f64,
    /// Minimum perimeter.
    pub min_object_perimeter: f64,

    // --- geometry ---
    /// Replace near-perfect lines and circles by exact primitives.
    pub detect_geometry: bool,
    /// Maximum deviation for a path to collapse to one line.
    pub line_tolerance: f64,
    /// Radial tolerance for circle acceptance.
    pub circle_tolerance: f64,
    /// Smallest accepted circle radius.
    pub min_circle_radius: f64,
    /// Largest accepted circle radius.
    pub max_circle_radius: f64,

    // --- gradients ---
    /// Detect linear gradients inside traced regions.
    pub detect_gradients: bool,
    /// Base pixel stride for gradient sampling.
    pub gradient_sample_stride: usize,
    /// Minimum per-channel plane-fit R².
    pub gradient_min_r2: f64,
    /// Minimum combined R² along the consensus direction.
    pub gradient_min_r2_total: f64,
    /// Minimum RGB distance between the two recovered stop colors.
    pub gradient_min_delta: f64,
    /// Minimum region size (pixels along the longest bbox side).
    pub gradient_min_size: f64,
    /// Subdivisions per quadratic when flattening outlines.
    pub gradient_max_subdivision: usize,
    /// Minimum interior samples.
    pub gradient_min_samples: usize,
    /// Fit in linear light instead of sRGB.
    pub gradient_linear_rgb: bool,

    // --- region merge ---
    /// Mean boundary color difference allowed when merging regions.
    pub region_merge_color_tolerance: f64,
    /// Maximum angle (degrees) between the two sides' luma gradients.
    pub region_merge_angle_tolerance_deg: f64,
    /// Minimum number of boundary samples for a merge candidate.
    pub region_merge_min_boundary_count: usize,

    // --- spatial coherence ---
    /// Majority-filter the index map for mid-sized palettes.
    pub spatial_coherence: bool,
    /// Majority window radius.
    pub spatial_coherence_radius: usize,
    /// Majority filter passes.
    pub spatial_coherence_passes: usize,

    // --- shared edges ---
    /// Unify coordinates of vertices shared by adjacent regions.
    pub unify_shared_edges: bool,
    /// Distance from a whole or half grid line within which shared
    /// vertices snap onto it.
    pub edge_snap_tolerance: f64,

    // --- output ---
    /// Output coordinate scale.
    pub scale: f64,
    /// Decimal places kept in output coordinates (negative disables rounding).
    pub round_coordinates: i32,
    /// Emit `viewBox` instead of fixed width/height.
    pub view_box: bool,
    /// Emit per-path description attributes.
    pub show_description: bool,
    /// Enable output optimizations.
    pub optimize_svg: bool,
    /// Drop shapes whose outline data duplicates an earlier one.
    pub remove_duplicates: bool,
}

impl PipelineConfig {
    /// Default curve-fit thresholds in pixels.
    pub const DEFAULT_LINE_THRESHOLD: f64 = 1.0;
    /// See [`Self::quadratic_threshold`].
    pub const DEFAULT_QUADRATIC_THRESHOLD: f64 = 1.0;
    /// See [`Self::path_omit_threshold`].
    pub const DEFAULT_PATH_OMIT_THRESHOLD: usize = 10;
    /// See [`Self::number_of_colors`].
    pub const DEFAULT_NUMBER_OF_COLORS: usize = 8;
    /// See [`Self::color_quantization_cycles`].
    pub const DEFAULT_COLOR_QUANTIZATION_CYCLES: usize = 10;
    /// See [`Self::blur_radius`].
    pub const DEFAULT_BLUR_RADIUS: f64 = 0.0;
    /// See [`Self::blur_delta`].
    pub const DEFAULT_BLUR_DELTA: f64 = 20.0;
    /// See [`Self::background_tolerance`].
    pub const DEFAULT_BACKGROUND_TOLERANCE: u32 = 10;
    /// See [`Self::min_background_ratio`].
    pub const DEFAULT_MIN_BACKGROUND_RATIO: f64 = 0.3;
    /// See [`Self::douglas_peucker_tolerance`].
    pub const DEFAULT_DOUGLAS_PEUCKER_TOLERANCE: f64 = 2.0;
    /// See [`Self::douglas_peucker_curve_protection`].
    pub const DEFAULT_CURVE_PROTECTION: f64 = 0.5;
    /// See [`Self::visvalingam_tolerance`].
    pub const DEFAULT_VISVALINGAM_TOLERANCE: f64 = 1.0;
    /// See [`Self::line_tolerance`].
    pub const DEFAULT_LINE_TOLERANCE: f64 = 2.0;
    /// See [`Self::circle_tolerance`].
    pub const DEFAULT_CIRCLE_TOLERANCE: f64 = 1.5;
    /// See [`Self::scale`].
    pub const DEFAULT_SCALE: f64 = 1.0;
    /// See [`Self::round_coordinates`].
    pub const DEFAULT_ROUND_COORDINATES: i32 = 1;

    /// Check every knob against its domain.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] naming the first
    /// offending field.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.number_of_colors == 0 {
            return Err(invalid("number_of_colors must be at least 1"));
        }
        let non_negative = [
            ("line_threshold", self.line_threshold),
            ("quadratic_threshold", self.quadratic_threshold),
            ("blur_radius", self.blur_radius),
            ("douglas_peucker_tolerance", self.douglas_peucker_tolerance),
            ("visvalingam_tolerance", self.visvalingam_tolerance),
            ("collinear_tolerance", self.collinear_tolerance),
            ("min_segment_length", self.min_segment_length),
            ("line_tolerance", self.line_tolerance),
            ("circle_tolerance", self.circle_tolerance),
            ("min_circle_radius", self.min_circle_radius),
            ("gradient_min_delta", self.gradient_min_delta),
            ("gradient_min_size", self.gradient_min_size),
            ("region_merge_color_tolerance", self.region_merge_color_tolerance),
            ("edge_snap_tolerance", self.edge_snap_tolerance),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(&format!("{name} must be a finite non-negative number, got {value}")));
            }
        }
        let unit = [
            ("douglas_peucker_curve_protection", self.douglas_peucker_curve_protection),
            ("curve_smoothing", self.curve_smoothing),
            ("min_background_ratio", self.min_background_ratio),
        ];
        for (name, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(&format!("{name} must be within [0, 1], got {value}")));
            }
        }
        if self.max_circle_radius < self.min_circle_radius {
            return Err(invalid("max_circle_radius must not be below min_circle_radius"));
        }
        if !self.scale.is_finite() || self.scale <= 0.0 {
            return Err(invalid(&format!("scale must be positive, got {}", self.scale)));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> PipelineError {
    PipelineError::InvalidConfig(msg.to_owned())
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            line_threshold: Self::DEFAULT_LINE_THRESHOLD,
            quadratic_threshold: Self::DEFAULT_QUADRATIC_THRESHOLD,
            path_omit_threshold: Self::DEFAULT_PATH_OMIT_THRESHOLD,
            number_of_colors: Self::DEFAULT_NUMBER_OF_COLORS,
            color_quantization_cycles: Self::DEFAULT_COLOR_QUANTIZATION_CYCLES,
            blur_radius: Self::DEFAULT_BLUR_RADIUS,
            blur_delta: Self::DEFAULT_BLUR_DELTA,
            remove_background: false,
            background_method: BackgroundMethod::default(),
            background_tolerance: Self::DEFAULT_BACKGROUND_TOLERANCE,
            min_background_ratio: Self::DEFAULT_MIN_BACKGROUND_RATIO,
            douglas_peucker: false,
            douglas_peucker_tolerance: Self::DEFAULT_DOUGLAS_PEUCKER_TOLERANCE,
            douglas_peucker_curve_protection: Self::DEFAULT_CURVE_PROTECTION,
            visvalingam_whyatt: false,
            visvalingam_tolerance: Self::DEFAULT_VISVALINGAM_TOLERANCE,
            collinear_tolerance: 1.0,
            min_segment_length: 2.0,
            curve_smoothing: 0.0,
            aggressive_simplification: false,
            filter_small_objects: false,
            min_object_area: 10.0,
            min_object_width: 3.0,
            min_object_height: 3.0,
            min_object_perimeter: 12.0,
            detect_geometry: false,
            line_tolerance: Self::DEFAULT_LINE_TOLERANCE,
            circle_tolerance: Self::DEFAULT_CIRCLE_TOLERANCE,
            min_circle_radius: 3.0,
            max_circle_radius: 1000.0,
            detect_gradients: false,
            gradient_sample_stride: 2,
            gradient_min_r2: 0.85,
            gradient_min_r2_total: 0.80,
            gradient_min_delta: 10.0,
            gradient_min_size: 8.0,
            gradient_max_subdivision: 8,
            gradient_min_samples: 30,
            gradient_linear_rgb: false,
            region_merge_color_tolerance: 12.0,
            region_merge_angle_tolerance_deg: 20.0,
            region_merge_min_boundary_count: 8,
            spatial_coherence: true,
            spatial_coherence_radius: 1,
            spatial_coherence_passes: 1,
            unify_shared_edges: true,
            edge_snap_tolerance: 0.1,
            scale: Self::DEFAULT_SCALE,
            round_coordinates: Self::DEFAULT_ROUND_COORDINATES,
            view_box: false,
            show_description: true,
            optimize_svg: true,
            remove_duplicates: true,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_colors_is_rejected() {
        let config = PipelineConfig {
            number_of_colors: 0,
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn negative_tolerance_is_rejected() {
        let config = PipelineConfig {
            visvalingam_tolerance: -1.0,
            ..PipelineConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("visvalingam_tolerance"));
    }

    #[test]
    fn inverted_circle_radius_bounds_are_rejected() {
        let config = PipelineConfig {
            min_circle_radius: 50.0,
            max_circle_radius: 10.0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"number_of_colors": 16, "background_method": "simple"}"#)
                .unwrap();
        assert_eq!(config.number_of_colors, 16);
        assert_eq!(config.background_method, BackgroundMethod::Simple);
        assert_eq!(config.path_omit_threshold, PipelineConfig::DEFAULT_PATH_OMIT_THRESHOLD);
    }

    #[test]
    fn json_roundtrip() {
        let config = PipelineConfig {
            detect_gradients: true,
            scale: 2.0,
            ..PipelineConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: PipelineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
