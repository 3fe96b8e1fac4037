//! Primitive detection: near-perfect lines and circles.
//!
//! Detection runs on the simplified outline vertices, which are closer
//! to the pixel boundary than the fitted curves. An accepted circle
//! replaces the traced path by a ring of quadratic arcs that starts at
//! the outline's first vertex and keeps its winding, so rendering order
//! and hole parity are unaffected. Outlines with protected (shared)
//! vertices are left alone; replacing them would open seams.

use std::f64::consts::{PI, TAU};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::linalg::solve3x3;
use crate::outline::Outline;
use crate::types::{Bounds, Path, Point, Segment, signed_ring_area};

/// Gauss-Newton refinement iterations.
const REFINE_ITERATIONS: usize = 8;

/// Fewest outline vertices considered for a circle.
const MIN_CIRCLE_POINTS: usize = 6;

/// A straight segment that fits a vertex run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LineFit {
    /// First vertex.
    pub start: Point,
    /// Last vertex.
    pub end: Point,
    /// Largest perpendicular deviation of an interior vertex.
    pub max_error: f64,
}

/// A circle that fits a closed outline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Circle {
    /// Fitted center.
    pub center: Point,
    /// Fitted radius.
    pub radius: f64,
    /// Largest radial deviation of a vertex.
    pub max_error: f64,
}

/// Fit a line from the first to the last vertex if no interior vertex
/// deviates from that chord by more than `tolerance`.
#[must_use]
pub fn detect_line(points: &[Point], tolerance: f64) -> Option<LineFit> {
    let (&start, &end) = (points.first()?, points.last()?);
    if points.len() < 2 {
        return None;
    }
    let max_error = points[1..points.len() - 1]
        .iter()
        .map(|p| p.distance_to_line(start, end))
        .fold(0.0, f64::max);
    (max_error <= tolerance).then_some(LineFit {
        start,
        end,
        max_error,
    })
}

/// Algebraic (Kasa) circle fit. Points are centered first to keep the
/// normal equations well conditioned.
fn fit_kasa(points: &[Point]) -> Option<(Point, f64)> {
    if points.len() < 3 {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = points.len() as f64;
    let mx = points.iter().map(|p| p.x).sum::<f64>() / n;
    let my = points.iter().map(|p| p.y).sum::<f64>() / n;

    let (mut sx, mut sy, mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0, 0.0, 0.0);
    let (mut sxz, mut syz, mut sz) = (0.0, 0.0, 0.0);
    for p in points {
        let (x, y) = (p.x - mx, p.y - my);
        let z = x.mul_add(x, y * y);
        sx += x;
        sy += y;
        sxx += x * x;
        syy += y * y;
        sxy += x * y;
        sxz += x * z;
        syz += y * z;
        sz += z;
    }
    let [a, b, c] = solve3x3(
        [[sxx, sxy, sx], [sxy, syy, sy], [sx, sy, n]],
        [-sxz, -syz, -sz],
    )?;
    let (cx, cy) = (-a / 2.0, -b / 2.0);
    let t = cx.mul_add(cx, cy * cy) - c;
    if t <= 0.0 {
        return None;
    }
    let r = t.sqrt();
    (cx.is_finite() && cy.is_finite() && r.is_finite()).then(|| (Point::new(cx + mx, cy + my), r))
}

/// Centroid and mean distance, the fallback when the algebraic fit is
/// singular.
fn fit_centroid(points: &[Point]) -> (Point, f64) {
    #[allow(clippy::cast_precision_loss)]
    let n = points.len().max(1) as f64;
    let center = Point::new(
        points.iter().map(|p| p.x).sum::<f64>() / n,
        points.iter().map(|p| p.y).sum::<f64>() / n,
    );
    let r = points.iter().map(|p| p.distance(center)).sum::<f64>() / n;
    (center, r)
}

/// Gauss-Newton on the residuals `|p - center| - r`. Returns `None`
/// when the normal equations become singular or the fit diverges.
fn refine_circle(points: &[Point], mut center: Point, mut r: f64) -> Option<(Point, f64)> {
    for _ in 0..REFINE_ITERATIONS {
        let mut jtj = [[0.0; 3]; 3];
        let mut jtr = [0.0; 3];
        let mut used = 0;
        for p in points {
            let (dx, dy) = (center.x - p.x, center.y - p.y);
            let d = dx.hypot(dy);
            if d < 1e-12 || !d.is_finite() {
                continue;
            }
            let f = d - r;
            let j = [dx / d, dy / d, -1.0];
            for (row, &ja) in jtj.iter_mut().zip(&j) {
                for (v, &jb) in row.iter_mut().zip(&j) {
                    *v += ja * jb;
                }
            }
            for (v, &ja) in jtr.iter_mut().zip(&j) {
                *v += ja * f;
            }
            used += 1;
        }
        if used < 3 {
            return None;
        }
        let [dcx, dcy, dr] = solve3x3(jtj, [-jtr[0], -jtr[1], -jtr[2]])?;
        center = Point::new(center.x + dcx, center.y + dcy);
        r += dr;
        if !center.x.is_finite() || !center.y.is_finite() || !r.is_finite() || r <= 0.0 {
            return None;
        }
        if dcx.mul_add(dcx, dcy.mul_add(dcy, dr * dr)).sqrt() < 1e-6 {
            break;
        }
    }
    Some((center, r))
}

/// Largest angular gap between consecutive vertices seen from `center`.
fn max_angle_gap(points: &[Point], center: Point) -> f64 {
    let mut angles: Vec<f64> = points
        .iter()
        .map(|p| (p.y - center.y).atan2(p.x - center.x))
        .collect();
    if angles.len() < 2 {
        return TAU;
    }
    angles.sort_by(f64::total_cmp);
    let inner = angles.windows(2).map(|w| w[1] - w[0]).fold(0.0, f64::max);
    let wrap = angles[0] + TAU - angles[angles.len() - 1];
    inner.max(wrap)
}

/// Fit and validate a circle through the vertices of a closed outline.
///
/// The fit must pass every gate: absolute and relative radial error,
/// spread of the radii, inlier share, angular coverage, bounding-box
/// aspect and agreement between the fitted radius and the radius
/// implied by the enclosed area. The gates loosen with
/// `tolerance / radius`.
#[must_use]
pub fn detect_circle(points: &[Point], tolerance: f64, min_radius: f64, max_radius: f64) -> Option<Circle> {
    if points.len() < MIN_CIRCLE_POINTS {
        return None;
    }
    let (center, r) = fit_kasa(points).unwrap_or_else(|| fit_centroid(points));
    let (center, radius) = refine_circle(points, center, r)?;
    if radius < min_radius || radius > max_radius {
        return None;
    }

    let radii: Vec<f64> = points.iter().map(|p| p.distance(center)).collect();
    #[allow(clippy::cast_precision_loss)]
    let n = radii.len() as f64;
    let errors: Vec<f64> = radii.iter().map(|d| (d - radius).abs()).collect();
    let max_error = errors.iter().copied().fold(0.0, f64::max);
    let avg_error = errors.iter().sum::<f64>() / n;
    if max_error > radius * 0.2 || max_error > tolerance || avg_error > tolerance * 0.8 {
        return None;
    }

    let r_safe = radius.max(1.0);
    let s = (tolerance / r_safe).clamp(0.0, 0.25);
    if max_error / r_safe > 0.6f64.mul_add(s, 0.04) || avg_error / r_safe > 0.4f64.mul_add(s, 0.02) {
        return None;
    }

    let mean = radii.iter().sum::<f64>() / n;
    let variance = (radii.iter().map(|d| d * d).sum::<f64>() / n - mean * mean).max(0.0);
    let rel_std = variance.sqrt() / radius;

    let inlier_band = tolerance.clamp(1.0, (r_safe * 0.12).max(1.0));
    #[allow(clippy::cast_precision_loss)]
    let inlier_ratio = errors.iter().filter(|&&e| e <= inlier_band).count() as f64 / n;

    let gap = max_angle_gap(points, center);
    let bounds = Bounds::of(points)?;
    let (w, h) = (bounds.width().max(1e-6), bounds.height().max(1e-6));
    let aspect = w.max(h) / w.min(h);
    let area = signed_ring_area(points).abs();
    let area_radius = if area > 0.0 { (area / PI).sqrt() } else { radius };
    let rel_area_diff = (area_radius - radius).abs() / r_safe;

    let accepted = rel_std <= 0.5f64.mul_add(s, 0.04).min(0.12)
        && inlier_ratio >= 1.2f64.mul_add(-s, 0.9).max(0.65)
        && gap <= PI * 0.4f64.mul_add(s, 0.9)
        && aspect <= 3.0f64.mul_add(rel_std, 4.0f64.mul_add(s, 1.1)).min(1.6)
        && rel_area_diff <= 0.5f64.mul_add(rel_std, 0.5f64.mul_add(s, 0.08)).min(0.22);
    accepted.then_some(Circle {
        center,
        radius,
        max_error,
    })
}

/// Number of quadratic arcs used to draw a circle.
#[must_use]
pub fn arc_count(radius: f64) -> usize {
    if radius <= 10.0 {
        4
    } else if radius <= 50.0 {
        6
    } else if radius <= 100.0 {
        8
    } else {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let n = (radius / 20.0) as usize;
        n.clamp(3, 16)
    }
}

/// A closed ring of quadratic arcs approximating `circle`, starting at
/// `start_angle` and running clockwise on screen when `clockwise`.
#[must_use]
pub fn circle_path(circle: &Circle, start_angle: f64, clockwise: bool) -> Path {
    let count = arc_count(circle.radius);
    #[allow(clippy::cast_precision_loss)]
    let step = TAU / count as f64 * if clockwise { 1.0 } else { -1.0 };
    let at = |angle: f64, r: f64| {
        Point::new(
            r.mul_add(angle.cos(), circle.center.x),
            r.mul_add(angle.sin(), circle.center.y),
        )
    };
    let half = step / 2.0;
    let control_radius = circle.radius / half.cos();

    // The last arc ends on the first vertex exactly.
    let mut vertices: Vec<Point> = (0..count)
        .map(|i| {
            #[allow(clippy::cast_precision_loss)]
            let angle = (i as f64).mul_add(step, start_angle);
            at(angle, circle.radius)
        })
        .collect();
    vertices.push(vertices[0]);

    let segments = vertices
        .windows(2)
        .enumerate()
        .map(|(i, w)| {
            #[allow(clippy::cast_precision_loss)]
            let mid = (i as f64).mul_add(step, start_angle) + half;
            Segment::quadratic(w[0], at(mid, control_radius), w[1])
        })
        .collect();
    Path::new(segments, true)
}

/// Geometry detection thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeometryDetector {
    /// Chord tolerance for lines.
    pub line_tolerance: f64,
    /// Radial tolerance for circles.
    pub circle_tolerance: f64,
    /// Smallest accepted radius.
    pub min_radius: f64,
    /// Largest accepted radius.
    pub max_radius: f64,
}

/// What a detector replaced a path with.
#[derive(Debug, Clone, PartialEq)]
pub enum Detected {
    /// A circle drawn as quadratic arcs.
    Circle(Circle, Path),
    /// A single straight segment.
    Line(LineFit, Path),
}

impl GeometryDetector {
    /// Thresholds from the configuration.
    #[must_use]
    pub const fn from_config(config: &PipelineConfig) -> Self {
        Self {
            line_tolerance: config.line_tolerance,
            circle_tolerance: config.circle_tolerance,
            min_radius: config.min_circle_radius,
            max_radius: config.max_circle_radius,
        }
    }

    /// Detect a primitive for one outline. Closed outlines are tested
    /// for circles, open ones for lines.
    #[must_use]
    pub fn detect(&self, outline: &Outline) -> Option<Detected> {
        if outline.has_protection() {
            return None;
        }
        let points = &outline.points;
        if !outline.closed {
            let line = detect_line(points, self.line_tolerance)?;
            return Some(Detected::Line(
                line,
                Path::new(vec![Segment::line(line.start, line.end)], false),
            ));
        }
        let circle = detect_circle(points, self.circle_tolerance, self.min_radius, self.max_radius)?;
        let bounds = outline.bounds()?;
        if circle.radius * 2.0 > bounds.width().max(bounds.height()) * 1.5 {
            return None;
        }
        let first = points[0];
        let start_angle = (first.y - circle.center.y).atan2(first.x - circle.center.x);
        let clockwise = signed_ring_area(points) > 0.0;
        Some(Detected::Circle(circle, circle_path(&circle, start_angle, clockwise)))
    }
}

/// Counts of replaced paths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeometryCounts {
    /// Paths replaced by circles.
    pub circles: usize,
    /// Paths replaced by lines.
    pub lines: usize,
}

/// Replace traced paths by detected primitives, in parallel per layer.
/// `outlines` and `paths` are parallel.
pub fn detect_layers(
    outlines: &[Vec<Outline>],
    paths: &mut [Vec<Path>],
    config: &PipelineConfig,
) -> GeometryCounts {
    let detector = GeometryDetector::from_config(config);
    let counts = paths
        .par_iter_mut()
        .zip(outlines.par_iter())
        .map(|(layer_paths, layer_outlines)| {
            let mut counts = GeometryCounts::default();
            for (path, outline) in layer_paths.iter_mut().zip(layer_outlines) {
                match detector.detect(outline) {
                    Some(Detected::Circle(_, p)) => {
                        *path = p;
                        counts.circles += 1;
                    }
                    Some(Detected::Line(_, p)) => {
                        *path = p;
                        counts.lines += 1;
                    }
                    None => {}
                }
            }
            counts
        })
        .reduce(GeometryCounts::default, |a, b| GeometryCounts {
            circles: a.circles + b.circles,
            lines: a.lines + b.lines,
        });
    log::debug!(
        "geometry: {} circles, {} lines",
        counts.circles,
        counts.lines
    );
    counts
}
