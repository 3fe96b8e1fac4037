//! Outline simplification.
//!
//! This module defines the [`Simplifier`] trait and the
//! [`SimplifierKind`] enum that the pipeline chains according to the
//! configuration: Douglas-Peucker, the advanced refinement pass and
//! Visvalingam-Whyatt. Every simplifier treats protected vertices as
//! fixed and works on the runs between them independently, so two
//! regions that share a boundary simplify it the same way.
//!
//! The small-object filter lives here as well: it runs first and
//! drops whole outlines rather than vertices.

use rayon::prelude::*;

use crate::config::PipelineConfig;
use crate::outline::Outline;
use crate::types::Point;
use crate::visvalingam::VisvalingamWhyatt;

/// Trait for vertex-reduction strategies.
pub trait Simplifier {
    /// Simplify one outline. Protected vertices always survive.
    fn simplify(&self, outline: &Outline) -> Outline;
}

/// The simplifiers the pipeline can chain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SimplifierKind {
    /// Recursive max-deviation splitting.
    DouglasPeucker(DouglasPeucker),
    /// Short-segment removal, smoothing and collinear merging.
    Refine(Refine),
    /// Smallest-triangle elimination.
    Visvalingam(VisvalingamWhyatt),
}

impl Simplifier for SimplifierKind {
    fn simplify(&self, outline: &Outline) -> Outline {
        match self {
            Self::DouglasPeucker(s) => s.simplify(outline),
            Self::Refine(s) => s.simplify(outline),
            Self::Visvalingam(s) => s.simplify(outline),
        }
    }
}

/// Closed outlines that would fall below three vertices keep their input.
fn guard_closed(input: &Outline, output: Outline) -> Outline {
    if input.closed && output.len() < 3 && input.len() >= 3 {
        input.clone()
    } else {
        output
    }
}

// ───── Douglas-Peucker ─────────────────────────────────────────────

/// Douglas-Peucker with optional curvature protection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DouglasPeucker {
    /// Maximum perpendicular deviation of a dropped vertex.
    pub tolerance: f64,
    /// Turn angle (radians) above which a vertex is always kept.
    pub curvature_threshold: Option<f64>,
}

impl DouglasPeucker {
    /// Plain Douglas-Peucker.
    #[must_use]
    pub const fn new(tolerance: f64) -> Self {
        Self {
            tolerance,
            curvature_threshold: None,
        }
    }

    /// Settings from the configuration. Curvature protection switches
    /// on above 0.5; aggressive simplification widens the tolerance by
    /// half.
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        let protection = config.douglas_peucker_curve_protection;
        let tolerance = if config.aggressive_simplification {
            config.douglas_peucker_tolerance * 1.5
        } else {
            config.douglas_peucker_tolerance
        };
        Self {
            tolerance,
            curvature_threshold: (protection > 0.5).then(|| 0.9_f64.mul_add(protection, 0.1)),
        }
    }
}

/// Deflection at `curr` in radians: 0 for a straight continuation,
/// π for a full reversal. Legs shorter than 0.001 count as straight.
fn turn_angle(prev: Point, curr: Point, next: Point) -> f64 {
    let (ax, ay) = (curr.x - prev.x, curr.y - prev.y);
    let (bx, by) = (next.x - curr.x, next.y - curr.y);
    let la = ax.hypot(ay);
    let lb = bx.hypot(by);
    if la < 0.001 || lb < 0.001 {
        return 0.0;
    }
    let dot = (ax / la).mul_add(bx / lb, (ay / la) * (by / lb));
    dot.clamp(-1.0, 1.0).acos()
}

fn rdp_recurse(points: &[Point], start: usize, end: usize, tolerance: f64, kept: &mut [bool]) {
    if end <= start + 1 {
        return;
    }
    let mut max_dist = 0.0;
    let mut max_idx = start;
    for i in (start + 1)..end {
        let d = points[i].distance_to_line(points[start], points[end]);
        if d > max_dist {
            max_dist = d;
            max_idx = i;
        }
    }
    if max_dist > tolerance {
        kept[max_idx] = true;
        rdp_recurse(points, start, max_idx, tolerance, kept);
        rdp_recurse(points, max_idx, end, tolerance, kept);
    }
}

/// Douglas-Peucker keep mask for one run; both ends are kept.
fn rdp_mask(run: &[Point], tolerance: f64) -> Vec<bool> {
    let mut kept = vec![false; run.len()];
    if let Some(last) = run.len().checked_sub(1) {
        kept[0] = true;
        kept[last] = true;
        rdp_recurse(run, 0, last, tolerance, &mut kept);
    }
    kept
}

impl Simplifier for DouglasPeucker {
    fn simplify(&self, outline: &Outline) -> Outline {
        let n = outline.len();
        if n < 3 {
            return outline.clone();
        }
        let mut working = outline.clone();
        if let Some(threshold) = self.curvature_threshold {
            for i in 0..n {
                if !outline.closed && (i == 0 || i == n - 1) {
                    continue;
                }
                let prev = outline.points[(i + n - 1) % n];
                let next = outline.points[(i + 1) % n];
                if turn_angle(prev, outline.points[i], next) > threshold {
                    working.protected[i] = true;
                }
            }
        }
        let mask = working.run_mask(|run| rdp_mask(run, self.tolerance));
        guard_closed(outline, outline.retain(&mask))
    }
}

// ───── Refinement ──────────────────────────────────────────────────

/// Short-segment removal, Laplacian smoothing and collinear merging,
/// applied in that order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Refine {
    /// Interior vertices closer than this to the last kept vertex go.
    pub min_segment_length: f64,
    /// Smoothing strength; `floor(3 · value)` passes.
    pub curve_smoothing: f64,
    /// Interior vertices closer than this to their neighbours' chord go.
    pub collinear_tolerance: f64,
}

/// Laplacian neighbour weight per smoothing pass.
const SMOOTHING_WEIGHT: f64 = 0.3;

/// Upper bound on smoothing passes.
const MAX_SMOOTHING_PASSES: usize = 30;

impl Refine {
    /// Settings from the configuration; aggressive simplification
    /// doubles both distance tolerances.
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        let factor = if config.aggressive_simplification {
            2.0
        } else {
            1.0
        };
        Self {
            min_segment_length: config.min_segment_length * factor,
            curve_smoothing: config.curve_smoothing,
            collinear_tolerance: config.collinear_tolerance * factor,
        }
    }

    /// Whether any of the three passes would run.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.min_segment_length > 0.0 || self.curve_smoothing > 0.0 || self.collinear_tolerance > 0.0
    }
}

fn short_segment_mask(run: &[Point], min_length: f64) -> Vec<bool> {
    let mut keep = vec![false; run.len()];
    let Some(last) = run.len().checked_sub(1) else {
        return keep;
    };
    keep[0] = true;
    let mut anchor = run[0];
    for i in 1..last {
        if run[i].distance(anchor) >= min_length {
            keep[i] = true;
            anchor = run[i];
        }
    }
    keep[last] = true;
    keep
}

fn collinear_mask(run: &[Point], tolerance: f64) -> Vec<bool> {
    let mut keep = vec![false; run.len()];
    let Some(last) = run.len().checked_sub(1) else {
        return keep;
    };
    keep[0] = true;
    let mut prev = run[0];
    for i in 1..last {
        let (curr, next) = (run[i], run[i + 1]);
        let twice_area = (curr.x - prev.x).mul_add(next.y - prev.y, -(next.x - prev.x) * (curr.y - prev.y));
        let base = prev.distance(next).max(1.0);
        if twice_area.abs() / base > tolerance {
            keep[i] = true;
            prev = curr;
        }
    }
    keep[last] = true;
    keep
}

impl Simplifier for Refine {
    fn simplify(&self, outline: &Outline) -> Outline {
        let mut out = outline.clone();
        if self.min_segment_length > 0.0 {
            out = out.simplify_runs(|run| short_segment_mask(run, self.min_segment_length));
        }
        if self.curve_smoothing > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let passes = ((self.curve_smoothing * 3.0).floor() as usize).min(MAX_SMOOTHING_PASSES);
            for _ in 0..passes {
                out = out.map_interior(|prev, curr, next| {
                    let w = SMOOTHING_WEIGHT;
                    let c = 2.0f64.mul_add(-w, 1.0);
                    Point::new(
                        w.mul_add(prev.x + next.x, c * curr.x),
                        w.mul_add(prev.y + next.y, c * curr.y),
                    )
                });
            }
        }
        if self.collinear_tolerance > 0.0 {
            out = out.simplify_runs(|run| collinear_mask(run, self.collinear_tolerance));
        }
        guard_closed(outline, out)
    }
}

// ───── Small-object filter ─────────────────────────────────────────

/// Minimum size of a closed outline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmallObjectFilter {
    /// Minimum enclosed area.
    pub min_area: f64,
    /// Minimum bounding-box width.
    pub min_width: f64,
    /// Minimum bounding-box height.
    pub min_height: f64,
    /// Minimum perimeter.
    pub min_perimeter: f64,
}

impl SmallObjectFilter {
    /// The filter, if enabled in the configuration.
    #[must_use]
    pub const fn from_config(config: &PipelineConfig) -> Option<Self> {
        if !config.filter_small_objects {
            return None;
        }
        Some(Self {
            min_area: config.min_object_area,
            min_width: config.min_object_width,
            min_height: config.min_object_height,
            min_perimeter: config.min_object_perimeter,
        })
    }

    /// Whether a closed outline falls below any minimum. Open outlines
    /// are never too small; closed ones with fewer than 3 vertices always are.
    #[must_use]
    pub fn is_too_small(&self, outline: &Outline) -> bool {
        if !outline.closed {
            return false;
        }
        if outline.len() < 3 {
            return true;
        }
        let Some(bounds) = outline.bounds() else {
            return true;
        };
        outline.signed_area().abs() < self.min_area
            || bounds.width() < self.min_width
            || bounds.height() < self.min_height
            || outline.perimeter() < self.min_perimeter
    }
}

// ───── Chain ───────────────────────────────────────────────────────

/// Everything the simplification phase does, built from the config.
#[derive(Debug, Clone, PartialEq)]
pub struct SimplifyPlan {
    /// Optional size filter, applied first.
    pub filter: Option<SmallObjectFilter>,
    /// Simplifiers in application order.
    pub steps: Vec<SimplifierKind>,
}

impl SimplifyPlan {
    /// Douglas-Peucker, then refinement, then Visvalingam-Whyatt, each
    /// only when enabled.
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        let mut steps = Vec::new();
        if config.douglas_peucker {
            steps.push(SimplifierKind::DouglasPeucker(DouglasPeucker::from_config(
                config,
            )));
        }
        let refine = Refine::from_config(config);
        if refine.is_active() {
            steps.push(SimplifierKind::Refine(refine));
        }
        if config.visvalingam_whyatt {
            steps.push(SimplifierKind::Visvalingam(VisvalingamWhyatt::new(
                config.visvalingam_tolerance,
            )));
        }
        Self {
            filter: SmallObjectFilter::from_config(config),
            steps,
        }
    }

    /// Run the plan on one outline; `None` when it is filtered out or
    /// has fewer than two vertices left to trace.
    #[must_use]
    pub fn apply(&self, outline: &Outline) -> Option<Outline> {
        if self.filter.is_some_and(|f| f.is_too_small(outline)) {
            return None;
        }
        let mut out = outline.clone();
        for step in &self.steps {
            out = step.simplify(&out);
        }
        (out.len() >= 2).then_some(out)
    }
}

/// Simplify every outline of every layer in parallel.
///
/// Returns the surviving outlines per layer and the number dropped.
#[must_use = "returns the simplified outlines"]
pub fn simplify_layers(
    layers: &[Vec<Outline>],
    config: &PipelineConfig,
) -> (Vec<Vec<Outline>>, usize) {
    let plan = SimplifyPlan::from_config(config);
    let out: Vec<Vec<Outline>> = layers
        .par_iter()
        .map(|outlines| outlines.iter().filter_map(|o| plan.apply(o)).collect())
        .collect();
    let before: usize = layers.iter().map(Vec::len).sum();
    let after: usize = out.iter().map(Vec::len).sum();
    (out, before - after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pts(coords: &[(f64, f64)]) -> Vec<Point> {
        coords.iter().map(|&(x, y)| Point::new(x, y)).collect()
    }

    /// Unit-stepped square ring of side `n`, screen clockwise.
    fn staircase_square(side: u32) -> Outline {
        let n = f64::from(side);
        let mut p = Vec::new();
        for i in (0..side).map(f64::from) {
            p.push(Point::new(i, 0.0));
        }
        for i in (0..side).map(f64::from) {
            p.push(Point::new(n, i));
        }
        for i in (0..side).map(f64::from) {
            p.push(Point::new(n - i, n));
        }
        for i in (0..side).map(f64::from) {
            p.push(Point::new(0.0, n - i));
        }
        Outline::new(p, true)
    }

    #[test]
    fn straight_line_collapses_to_endpoints() {
        let o = Outline::new(pts(&[(0.0, 0.0), (1.0, 0.0), (2.0, 0.0), (3.0, 0.0)]), false);
        let s = DouglasPeucker::new(0.5).simplify(&o);
        assert_eq!(s.points, pts(&[(0.0, 0.0), (3.0, 0.0)]));
    }

    #[test]
    fn zero_tolerance_keeps_corners() {
        let o = Outline::new(pts(&[(0.0, 0.0), (5.0, 3.0), (10.0, 0.0)]), false);
        let s = DouglasPeucker::new(0.0).simplify(&o);
        assert_eq!(s.len(), 3);
    }

    #[test]
    fn closed_square_keeps_its_corners() {
        let s = DouglasPeucker::new(0.5).simplify(&staircase_square(4));
        let mut corners = s.points.clone();
        corners.sort_by(|a, b| a.x.total_cmp(&b.x).then(a.y.total_cmp(&b.y)));
        assert_eq!(corners, pts(&[(0.0, 0.0), (0.0, 4.0), (4.0, 0.0), (4.0, 4.0)]));
    }

    #[test]
    fn protected_vertices_survive() {
        let mut o = Outline::new(pts(&[(0.0, 0.0), (1.0, 0.0), (2.0, 0.0), (3.0, 0.0)]), false);
        o.protected[2] = true;
        let s = DouglasPeucker::new(10.0).simplify(&o);
        assert_eq!(s.points, pts(&[(0.0, 0.0), (2.0, 0.0), (3.0, 0.0)]));
        assert_eq!(s.protected, vec![false, true, false]);
    }

    #[test]
    fn curvature_protection_keeps_sharp_turns() {
        // A shallow spike that plain Douglas-Peucker flattens.
        let o = Outline::new(
            pts(&[(0.0, 0.0), (4.0, 0.0), (5.0, 0.8), (6.0, 0.0), (10.0, 0.0)]),
            false,
        );
        let plain = DouglasPeucker::new(1.0).simplify(&o);
        assert_eq!(plain.len(), 2);
        let protected = DouglasPeucker {
            tolerance: 1.0,
            curvature_threshold: Some(0.5),
        }
        .simplify(&o);
        assert!(protected.points.contains(&Point::new(5.0, 0.8)));
    }

    #[test]
    fn tiny_closed_outline_is_not_collapsed() {
        let diamond = Outline::new(pts(&[(0.5, 0.0), (1.0, 0.5), (0.5, 1.0), (0.0, 0.5)]), true);
        assert_eq!(DouglasPeucker::new(5.0).simplify(&diamond), diamond);
    }

    #[test]
    fn turn_angle_measures_deflection() {
        let a = Point::new(0.0, 0.0);
        let b = Point::new(1.0, 0.0);
        assert!(turn_angle(a, b, Point::new(2.0, 0.0)).abs() < 1e-12);
        let right = turn_angle(a, b, Point::new(1.0, 1.0));
        assert!((right - std::f64::consts::FRAC_PI_2).abs() < 1e-12);
    }

    #[test]
    fn short_segments_are_removed() {
        let run = pts(&[(0.0, 0.0), (0.5, 0.0), (1.0, 0.0), (2.5, 0.0), (3.0, 0.0)]);
        assert_eq!(short_segment_mask(&run, 2.0), vec![true, false, false, true, true]);
    }

    #[test]
    fn collinear_vertices_merge() {
        let run = pts(&[(0.0, 0.0), (1.0, 0.1), (2.0, 0.0), (2.0, 3.0)]);
        assert_eq!(collinear_mask(&run, 0.5), vec![true, false, true, true]);
    }

    #[test]
    fn smoothing_moves_interior_towards_neighbours() {
        let o = Outline::new(pts(&[(0.0, 0.0), (1.0, 3.0), (2.0, 0.0)]), false);
        let r = Refine {
            min_segment_length: 0.0,
            curve_smoothing: 0.34,
            collinear_tolerance: 0.0,
        };
        let s = r.simplify(&o);
        // One pass: 0.4 · 3 + 0.3 · 0 + 0.3 · 0.
        assert!((s.points[1].y - 1.2).abs() < 1e-12);
        assert_eq!(s.points[0], o.points[0]);
    }

    #[test]
    fn small_objects_are_filtered() {
        let filter = SmallObjectFilter {
            min_area: 10.0,
            min_width: 3.0,
            min_height: 3.0,
            min_perimeter: 12.0,
        };
        assert!(filter.is_too_small(&staircase_square(2)));
        assert!(!filter.is_too_small(&staircase_square(4)));
        let open = Outline::new(pts(&[(0.0, 0.0), (1.0, 0.0)]), false);
        assert!(!filter.is_too_small(&open));
    }

    #[test]
    fn plan_follows_config() {
        let config = PipelineConfig {
            douglas_peucker: true,
            visvalingam_whyatt: true,
            filter_small_objects: true,
            ..PipelineConfig::default()
        };
        let plan = SimplifyPlan::from_config(&config);
        assert!(plan.filter.is_some());
        assert_eq!(plan.steps.len(), 3);
        assert!(matches!(plan.steps[0], SimplifierKind::DouglasPeucker(_)));
        assert!(matches!(plan.steps[2], SimplifierKind::Visvalingam(_)));

        let none = PipelineConfig {
            collinear_tolerance: 0.0,
            min_segment_length: 0.0,
            ..PipelineConfig::default()
        };
        assert!(SimplifyPlan::from_config(&none).steps.is_empty());
    }

    #[test]
    fn layers_report_filtered_count() {
        let config = PipelineConfig {
            filter_small_objects: true,
            ..PipelineConfig::default()
        };
        let layers = vec![vec![staircase_square(1), staircase_square(6)], vec![]];
        let (out, dropped) = simplify_layers(&layers, &config);
        assert_eq!(dropped, 1);
        assert_eq!(out[0].len(), 1);
        assert!(out[1].is_empty());
    }

    fn arb_outline() -> impl Strategy<Value = Outline> {
        (
            prop::collection::vec((0.0..50.0_f64, 0.0..50.0_f64), 3..40),
            any::<bool>(),
        )
            .prop_map(|(coords, closed)| Outline::new(pts(&coords), closed))
    }

    proptest! {
        #[test]
        fn douglas_peucker_is_idempotent(o in arb_outline(), tol in 0.0..5.0_f64) {
            let dp = DouglasPeucker::new(tol);
            let once = dp.simplify(&o);
            let twice = dp.simplify(&once);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn visvalingam_is_idempotent(o in arb_outline(), tol in 0.0..5.0_f64) {
            let vw = VisvalingamWhyatt::new(tol);
            let once = vw.simplify(&o);
            let twice = vw.simplify(&once);
            prop_assert_eq!(once, twice);
        }
    }
}
