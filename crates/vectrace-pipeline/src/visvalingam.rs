//! Visvalingam-Whyatt simplification.
//!
//! Repeatedly removes the vertex whose triangle with its two live
//! neighbours has the smallest area, until every remaining triangle is
//! at least `tolerance²`. Removing a vertex only changes the triangles
//! of its two neighbours, so those are recomputed and pushed back onto
//! the heap; stale heap entries are skipped by stamp.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::outline::Outline;
use crate::simplify::Simplifier;
use crate::types::Point;

/// Closed outlines never drop below this many vertices.
const MIN_CLOSED_POINTS: usize = 4;

/// Open outlines never drop below this many vertices.
const MIN_OPEN_POINTS: usize = 3;

/// Visvalingam-Whyatt with a linear tolerance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisvalingamWhyatt {
    /// Triangles smaller than `tolerance²` are eliminated.
    pub tolerance: f64,
}

impl VisvalingamWhyatt {
    /// A simplifier with the given tolerance.
    #[must_use]
    pub const fn new(tolerance: f64) -> Self {
        Self { tolerance }
    }
}

fn triangle_area(a: Point, b: Point, c: Point) -> f64 {
    ((b.x - a.x).mul_add(c.y - a.y, -(c.x - a.x) * (b.y - a.y))).abs() * 0.5
}

/// Min-heap entry: smallest area first, then lowest index.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    area: f64,
    index: usize,
    stamp: u32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .area
            .total_cmp(&self.area)
            .then_with(|| other.index.cmp(&self.index))
            .then_with(|| other.stamp.cmp(&self.stamp))
    }
}

impl Simplifier for VisvalingamWhyatt {
    fn simplify(&self, outline: &Outline) -> Outline {
        let n = outline.len();
        let min_points = if outline.closed {
            MIN_CLOSED_POINTS
        } else {
            MIN_OPEN_POINTS
        };
        if n <= min_points {
            return outline.clone();
        }
        let threshold = self.tolerance * self.tolerance;
        let pts = &outline.points;

        let fixed: Vec<bool> = (0..n)
            .map(|i| outline.is_protected(i) || i == 0 || (!outline.closed && i == n - 1))
            .collect();
        let mut prev: Vec<Option<usize>> = (0..n)
            .map(|i| match (i, outline.closed) {
                (0, false) => None,
                (0, true) => Some(n - 1),
                _ => Some(i - 1),
            })
            .collect();
        let mut next: Vec<Option<usize>> = (0..n)
            .map(|i| if i + 1 < n { Some(i + 1) } else { outline.closed.then_some(0) })
            .collect();

        let area_of = |i: usize, prev: &[Option<usize>], next: &[Option<usize>]| match (prev[i], next[i]) {
            (Some(p), Some(q)) if !fixed[i] => triangle_area(pts[p], pts[i], pts[q]),
            _ => f64::INFINITY,
        };

        let mut stamps = vec![0_u32; n];
        let mut heap: BinaryHeap<Candidate> = (0..n)
            .filter(|&i| !fixed[i])
            .map(|i| Candidate {
                area: area_of(i, &prev, &next),
                index: i,
                stamp: 0,
            })
            .collect();
        let mut removed = vec![false; n];
        let mut remaining = n;

        while remaining > min_points {
            let Some(c) = heap.pop() else {
                break;
            };
            if removed[c.index] || c.stamp != stamps[c.index] {
                continue;
            }
            if c.area >= threshold {
                break;
            }
            let i = c.index;
            removed[i] = true;
            remaining -= 1;
            let (p, q) = (prev[i], next[i]);
            if let Some(p) = p {
                next[p] = q;
            }
            if let Some(q) = q {
                prev[q] = p;
            }
            for j in [p, q].into_iter().flatten() {
                if fixed[j] || removed[j] {
                    continue;
                }
                stamps[j] += 1;
                heap.push(Candidate {
                    area: area_of(j, &prev, &next),
                    index: j,
                    stamp: stamps[j],
                });
            }
        }

        let keep: Vec<bool> = removed.iter().map(|&r| !r).collect();
        outline.retain(&keep)
    }
}
