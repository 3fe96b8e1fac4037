//! Curve fitting: simplified outlines → line and quadratic segments.
//!
//! A window of vertices is fitted by one straight segment if every
//! interior vertex lies within `line_threshold` of the chord, otherwise
//! by one quadratic Bezier through the worst vertex if every vertex lies
//! within `quadratic_threshold` of the curve, otherwise it is split at
//! the worst vertex and both halves are fitted recursively.

use rayon::prelude::*;

use crate::config::PipelineConfig;
use crate::outline::Outline;
use crate::scan::Direction;
use crate::types::{Path, Point, Segment};

/// Recursion depth after which a window is closed with a straight line.
const MAX_DEPTH: usize = 50;

/// Smallest `2t(1 - t)` at the fit vertex for which the control point
/// is solved.
const MIN_CONTROL_WEIGHT: f64 = 0.001;

/// Curve-fitting thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tracer {
    /// Maximum chord deviation for a straight segment.
    pub line_threshold: f64,
    /// Maximum curve deviation for a quadratic segment.
    pub quadratic_threshold: f64,
}

impl Tracer {
    /// Thresholds from the configuration.
    #[must_use]
    pub const fn from_config(config: &PipelineConfig) -> Self {
        Self {
            line_threshold: config.line_threshold,
            quadratic_threshold: config.quadratic_threshold,
        }
    }

    /// Fit `points[start..=end]`, appending segments to `out`.
    fn fit(&self, points: &[Point], start: usize, end: usize, depth: usize, out: &mut Vec<Segment>) {
        if end <= start {
            return;
        }
        let (p0, p1) = (points[start], points[end]);
        if end == start + 1 || depth > MAX_DEPTH {
            out.push(Segment::line(p0, p1));
            return;
        }

        let mut worst = start + 1;
        let mut worst_error = -1.0;
        for (i, p) in points.iter().enumerate().take(end).skip(start + 1) {
            let d = p.distance_to_segment(p0, p1);
            if d > worst_error {
                worst_error = d;
                worst = i;
            }
        }
        if worst_error <= self.line_threshold {
            out.push(Segment::line(p0, p1));
            return;
        }

        let mid = start.midpoint(end);
        if end - start < 3 {
            self.fit(points, start, mid, depth + 1, out);
            self.fit(points, mid, end, depth + 1, out);
            return;
        }

        #[allow(clippy::cast_precision_loss)]
        let span = (end - start) as f64;
        #[allow(clippy::cast_precision_loss)]
        let t = (worst - start) as f64 / span;
        let weight = 2.0 * (1.0 - t) * t;
        if weight.abs() < MIN_CONTROL_WEIGHT {
            self.fit(points, start, mid, depth + 1, out);
            self.fit(points, mid, end, depth + 1, out);
            return;
        }
        let (a, c) = ((1.0 - t) * (1.0 - t), t * t);
        let fit = points[worst];
        let control = Point::new(
            (a.mul_add(p0.x, c * p1.x) - fit.x) / -weight,
            (a.mul_add(p0.y, c * p1.y) - fit.y) / -weight,
        );
        let curve = Segment::quadratic(p0, control, p1);

        let mut split = worst;
        let mut split_error = -1.0;
        for (i, p) in points.iter().enumerate().take(end).skip(start + 1) {
            #[allow(clippy::cast_precision_loss)]
            let t = (i - start) as f64 / span;
            let d = p.distance(curve.point_at(t));
            if d > split_error {
                split_error = d;
                split = i;
            }
        }
        if split_error <= self.quadratic_threshold {
            out.push(curve);
            return;
        }

        let split = split.clamp(start + 1, end - 1);
        self.fit(points, start, split, depth + 1, out);
        self.fit(points, split, end, depth + 1, out);
    }

    /// Fit an open run of points.
    #[must_use]
    pub fn fit_points(&self, points: &[Point]) -> Vec<Segment> {
        let mut out = Vec::new();
        if let Some(end) = points.len().checked_sub(1) {
            self.fit(points, 0, end, 0, &mut out);
        }
        out
    }

    /// Trace one outline into a path.
    ///
    /// Protected vertices always become segment endpoints. A closed
    /// outline without protection starts at its first corner (a vertex
    /// where the heading changes); its last segment ends exactly on its
    /// first vertex.
    #[must_use = "returns the traced path"]
    pub fn trace(&self, outline: &Outline) -> Path {
        let n = outline.len();
        if n < 3 {
            let segments = if n == 2 {
                vec![Segment::line(outline.points[0], outline.points[1])]
            } else {
                Vec::new()
            };
            return Path::new(segments, outline.closed);
        }

        let breaks: Vec<usize> = (0..n).filter(|&i| outline.is_protected(i)).collect();
        if !outline.closed {
            let mut cuts = vec![0];
            cuts.extend(breaks.iter().copied().filter(|&b| b != 0 && b != n - 1));
            cuts.push(n - 1);
            let mut segments = Vec::new();
            for w in cuts.windows(2) {
                self.fit(&outline.points, w[0], w[1], 0, &mut segments);
            }
            return Path::new(segments, false);
        }

        let seam = breaks.first().copied().unwrap_or_else(|| first_corner(&outline.points));
        let mut ring: Vec<Point> = outline.points[seam..]
            .iter()
            .chain(&outline.points[..seam])
            .copied()
            .collect();
        ring.push(ring[0]);

        let mut cuts: Vec<usize> = breaks.iter().map(|&b| (b + n - seam) % n).collect();
        cuts.sort_unstable();
        if cuts.first() != Some(&0) {
            cuts.insert(0, 0);
        }
        cuts.push(n);

        let mut segments = Vec::new();
        for w in cuts.windows(2) {
            self.fit(&ring, w[0], w[1], 0, &mut segments);
        }
        Path::new(segments, true)
    }
}

/// First vertex of a closed ring whose incoming and outgoing headings
/// differ, or 0 for a ring without corners.
fn first_corner(points: &[Point]) -> usize {
    let n = points.len();
    (0..n)
        .find(|&i| {
            let prev = points[(i + n - 1) % n];
            let next = points[(i + 1) % n];
            Direction::between(prev, points[i]) != Direction::between(points[i], next)
        })
        .unwrap_or(0)
}

/// Trace every outline of every layer in parallel. The result is
/// parallel to `layers`.
#[must_use = "returns the traced layers"]
pub fn trace_layers(layers: &[Vec<Outline>], config: &PipelineConfig) -> Vec<Vec<Path>> {
    let tracer = Tracer::from_config(config);
    layers
        .par_iter()
        .map(|outlines| outlines.iter().map(|o| tracer.trace(o)).collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACER: Tracer = Tracer {
        line_threshold: 1.0,
        quadratic_threshold: 1.0,
    };

    fn pts(coords: &[(f64, f64)]) -> Vec<Point> {
        coords.iter().map(|&(x, y)| Point::new(x, y)).collect()
    }

    #[test]
    fn collinear_points_fit_one_line() {
        let segs = TRACER.fit_points(&pts(&[(0.0, 0.0), (1.0, 0.2), (2.0, -0.1), (5.0, 0.0)]));
        assert_eq!(segs, vec![Segment::line(Point::new(0.0, 0.0), Point::new(5.0, 0.0))]);
    }

    #[test]
    fn parabola_fits_one_quadratic() {
        // y = x² / 10 sampled at the integers 0..=10.
        let points: Vec<Point> = (0..=10)
            .map(|x| {
                let x = f64::from(x);
                Point::new(x, x * x / 10.0)
            })
            .collect();
        let segs = TRACER.fit_points(&points);
        assert_eq!(segs.len(), 1);
        assert!(matches!(segs[0], Segment::Quadratic { .. }));
        assert_eq!(segs[0].start(), points[0]);
        assert_eq!(segs[0].end(), points[10]);
    }

    #[test]
    fn sharp_corner_splits() {
        let segs = TRACER.fit_points(&pts(&[
            (0.0, 0.0),
            (5.0, 0.0),
            (10.0, 0.0),
            (10.0, 5.0),
            (10.0, 10.0),
        ]));
        assert!(segs.len() >= 2);
        for w in segs.windows(2) {
            assert_eq!(w[0].end(), w[1].start());
        }
        assert!(segs.iter().any(|s| s.end() == Point::new(10.0, 0.0)));
    }

    #[test]
    fn two_points_make_a_line_and_one_makes_nothing() {
        let two = Outline::new(pts(&[(0.0, 0.0), (3.0, 4.0)]), false);
        assert_eq!(TRACER.trace(&two).segments.len(), 1);
        let one = Outline::new(pts(&[(0.0, 0.0)]), true);
        assert!(TRACER.trace(&one).is_empty());
    }

    #[test]
    fn closed_square_closes_exactly() {
        let square = Outline::new(
            pts(&[
                (2.0, 0.0),
                (4.0, 0.0),
                (4.0, 4.0),
                (0.0, 4.0),
                (0.0, 0.0),
            ]),
            true,
        );
        let path = TRACER.trace(&square);
        assert!(path.closed);
        let first = path.segments[0].start();
        let last = path.segments[path.segments.len() - 1].end();
        assert_eq!(first, last);
        // The seam moved off the straight edge onto the first corner.
        assert_eq!(first, Point::new(4.0, 0.0));
        assert_eq!(path.segments.len(), 4);
    }

    #[test]
    fn protected_vertices_become_endpoints() {
        let mut o = Outline::new(
            pts(&[(0.0, 0.0), (1.0, 0.0), (2.0, 0.0), (3.0, 0.0), (4.0, 0.0)]),
            false,
        );
        o.protected[2] = true;
        let segs = TRACER.trace(&o).segments;
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].end(), Point::new(2.0, 0.0));

        let mut ring = Outline::new(
            pts(&[(0.0, 0.0), (2.0, 0.0), (4.0, 0.0), (4.0, 4.0), (0.0, 4.0)]),
            true,
        );
        ring.protected[1] = true;
        let path = TRACER.trace(&ring);
        assert_eq!(path.segments[0].start(), Point::new(2.0, 0.0));
        assert_eq!(path.segments.last().map(Segment::end), Some(Point::new(2.0, 0.0)));
    }

    #[test]
    fn first_corner_skips_straight_runs() {
        let ring = pts(&[(1.0, 0.0), (2.0, 0.0), (2.0, 2.0), (0.0, 2.0), (0.0, 0.0)]);
        assert_eq!(first_corner(&ring), 1);
        assert_eq!(first_corner(&pts(&[(0.0, 0.0), (1.0, 0.0)])), 0);
    }
}
