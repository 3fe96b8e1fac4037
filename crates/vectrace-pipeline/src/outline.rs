//! Vertex outlines: the polyline form paths take while being simplified.
//!
//! An [`Outline`] is the vertex list of one scanned boundary plus a
//! protection mask. Protected vertices sit where a boundary shared with
//! other paths begins or ends; simplifiers never drop or move them and
//! the tracer always places a segment endpoint on them.

use serde::{Deserialize, Serialize};

use crate::types::{Bounds, Path, Point, signed_ring_area};

/// A polyline with per-vertex protection flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outline {
    /// Vertices in traversal order. Closed outlines do not repeat the
    /// first vertex at the end.
    pub points: Vec<Point>,
    /// Parallel to `points`.
    pub protected: Vec<bool>,
    /// Whether the last vertex connects back to the first.
    pub closed: bool,
}

impl Outline {
    /// An outline with no protected vertices.
    #[must_use]
    pub fn new(points: Vec<Point>, closed: bool) -> Self {
        let protected = vec![false; points.len()];
        Self {
            points,
            protected,
            closed,
        }
    }

    /// An outline with the given protection mask; missing flags read as
    /// unprotected.
    #[must_use]
    pub fn with_protection(points: Vec<Point>, mut protected: Vec<bool>, closed: bool) -> Self {
        protected.resize(points.len(), false);
        Self {
            points,
            protected,
            closed,
        }
    }

    /// The vertices of a path, unprotected.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        Self::new(path.vertices(), path.closed)
    }

    /// Number of vertices.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.points.len()
    }

    /// Returns `true` if the outline has no vertices.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Whether vertex `i` is protected.
    #[must_use]
    pub fn is_protected(&self, i: usize) -> bool {
        self.protected.get(i).copied().unwrap_or(false)
    }

    /// Returns `true` if any vertex is protected.
    #[must_use]
    pub fn has_protection(&self) -> bool {
        self.protected.iter().any(|&p| p)
    }

    /// Keep the vertices flagged in `keep`; protected vertices are kept
    /// regardless.
    #[must_use]
    pub fn retain(&self, keep: &[bool]) -> Self {
        let mut points = Vec::with_capacity(self.points.len());
        let mut protected = Vec::with_capacity(self.points.len());
        for (i, &p) in self.points.iter().enumerate() {
            let prot = self.is_protected(i);
            if prot || keep.get(i).copied().unwrap_or(false) {
                points.push(p);
                protected.push(prot);
            }
        }
        Self {
            points,
            protected,
            closed: self.closed,
        }
    }

    /// Shoelace signed area (positive is clockwise on screen).
    #[must_use]
    pub fn signed_area(&self) -> f64 {
        signed_ring_area(&self.points)
    }

    /// Axis-aligned bounds of the vertices.
    #[must_use]
    pub fn bounds(&self) -> Option<Bounds> {
        Bounds::of(&self.points)
    }

    /// Total edge length, including the closing edge of closed outlines.
    #[must_use]
    pub fn perimeter(&self) -> f64 {
        let open: f64 = self
            .points
            .windows(2)
            .map(|w| w[0].distance(w[1]))
            .sum();
        match (self.closed, self.points.first(), self.points.last()) {
            (true, Some(&first), Some(&last)) if self.points.len() > 2 => open + last.distance(first),
            _ => open,
        }
    }

    /// Indices that bound independent runs: protected vertices, plus
    /// both ends of open outlines and vertex 0 of unprotected closed ones.
    fn run_breaks(&self) -> Vec<usize> {
        let n = self.points.len();
        let mut breaks: Vec<usize> = (0..n).filter(|&i| self.is_protected(i)).collect();
        if self.closed {
            if breaks.is_empty() {
                breaks.push(0);
            }
        } else {
            if breaks.first() != Some(&0) {
                breaks.insert(0, 0);
            }
            if breaks.last() != Some(&(n - 1)) {
                breaks.push(n - 1);
            }
        }
        breaks
    }

    /// Simplify each run between breaks independently.
    ///
    /// `keep_run` receives the run including both bounding vertices and
    /// returns a keep mask of the same length; the bounding vertices are
    /// kept whatever it says. Closed outlines wrap around, so with a
    /// single break the run starts and ends on the same vertex.
    #[must_use]
    pub(crate) fn simplify_runs(&self, keep_run: impl FnMut(&[Point]) -> Vec<bool>) -> Self {
        if self.points.len() < 3 {
            return self.clone();
        }
        self.retain(&self.run_mask(keep_run))
    }

    /// The keep mask [`Self::simplify_runs`] would apply.
    pub(crate) fn run_mask(&self, mut keep_run: impl FnMut(&[Point]) -> Vec<bool>) -> Vec<bool> {
        let n = self.points.len();
        if n < 3 {
            return vec![true; n];
        }
        let breaks = self.run_breaks();
        let mut keep = vec![false; n];
        for &b in &breaks {
            keep[b] = true;
        }

        let mut runs: Vec<(usize, usize)> = breaks.windows(2).map(|w| (w[0], w[1])).collect();
        if self.closed
            && let (Some(&first), Some(&last)) = (breaks.first(), breaks.last())
        {
            runs.push((last, first + n));
        }

        for (a, b) in runs {
            if b - a < 2 {
                continue;
            }
            let run: Vec<Point> = (a..=b).map(|i| self.points[i % n]).collect();
            let mask = keep_run(&run);
            for (k, &m) in mask.iter().enumerate().take(run.len() - 1).skip(1) {
                if m {
                    keep[(a + k) % n] = true;
                }
            }
        }
        keep
    }

    /// Move unprotected interior vertices with `f(prev, current, next)`.
    ///
    /// Open outlines keep their end vertices; closed ones wrap around.
    #[must_use]
    pub(crate) fn map_interior(&self, f: impl Fn(Point, Point, Point) -> Point) -> Self {
        let n = self.points.len();
        if n < 3 {
            return self.clone();
        }
        let mut points = self.points.clone();
        for (i, slot) in points.iter_mut().enumerate() {
            if self.is_protected(i) || (!self.closed && (i == 0 || i == n - 1)) {
                continue;
            }
            let prev = self.points[(i + n - 1) % n];
            let next = self.points[(i + 1) % n];
            *slot = f(prev, self.points[i], next);
        }
        Self {
            points,
            protected: self.protected.clone(),
            closed: self.closed,
        }
    }
}
