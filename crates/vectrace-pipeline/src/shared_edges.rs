//! Shared-edge registry: coordinate unification across paths.
//!
//! Adjacent regions are traced and simplified independently, so the
//! vertices they share drift apart and leave hairline seams when
//! rendered. The registry buckets every segment endpoint into a grid
//! cell, remembers who owns it, and writes one agreed coordinate back
//! into every owner of a cell that more than one path touches.

use std::collections::{BTreeMap, BTreeSet};

use crate::outline::Outline;
use crate::types::{Endpoint, Path, Point};

/// Grid cells per pixel before simplification.
pub const COARSE_RESOLUTION: f64 = 2.0;

/// Grid cells per pixel after tracing.
pub const FINE_RESOLUTION: f64 = 8.0;

/// One registered endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Owner {
    layer: usize,
    path: usize,
    segment: usize,
    endpoint: Endpoint,
}

#[derive(Debug, Clone, Default)]
struct Cell {
    sum_x: f64,
    sum_y: f64,
    count: usize,
    owners: Vec<Owner>,
}

impl Cell {
    /// Distinct `(layer, path)` pairs touching this cell.
    fn paths(&self) -> BTreeSet<(usize, usize)> {
        self.owners.iter().map(|o| (o.layer, o.path)).collect()
    }

    fn is_shared(&self) -> bool {
        self.paths().len() >= 2
    }

    #[allow(clippy::cast_precision_loss)]
    fn mean(&self) -> Point {
        let n = self.count.max(1) as f64;
        Point::new(self.sum_x / n, self.sum_y / n)
    }
}

type Key = (i64, i64);

/// Endpoint registry over a grid of `resolution` cells per pixel.
#[derive(Debug, Clone)]
pub struct EdgeRegistry {
    resolution: f64,
    cells: BTreeMap<Key, Cell>,
}

/// Snap one coordinate to the nearest whole or half pixel when its
/// fractional part is within `threshold` of it.
fn snap(v: f64, threshold: f64) -> f64 {
    let base = v.floor();
    let frac = v - base;
    if frac < threshold {
        base
    } else if frac > 1.0 - threshold {
        base + 1.0
    } else if (frac - 0.5).abs() < threshold {
        base + 0.5
    } else {
        v
    }
}

impl EdgeRegistry {
    /// An empty registry; `resolution` is clamped to `1..=32`.
    #[must_use]
    pub fn new(resolution: f64) -> Self {
        let resolution = if resolution.is_finite() {
            resolution.clamp(1.0, 32.0)
        } else {
            FINE_RESOLUTION
        };
        Self {
            resolution,
            cells: BTreeMap::new(),
        }
    }

    /// Register every path of every layer.
    #[must_use]
    pub fn from_layers(layers: &[Vec<Path>], resolution: f64) -> Self {
        let mut registry = Self::new(resolution);
        for (layer, paths) in layers.iter().enumerate() {
            for (index, path) in paths.iter().enumerate() {
                registry.register(layer, index, path);
            }
        }
        registry
    }

    #[allow(clippy::cast_possible_truncation)]
    fn key(&self, p: Point) -> Key {
        (
            p.x.mul_add(self.resolution, 0.5).floor() as i64,
            p.y.mul_add(self.resolution, 0.5).floor() as i64,
        )
    }

    fn add(&mut self, p: Point, owner: Owner) {
        let cell = self.cells.entry(self.key(p)).or_default();
        cell.sum_x += p.x;
        cell.sum_y += p.y;
        cell.count += 1;
        cell.owners.push(owner);
    }

    /// Register both endpoints of every segment of `path`.
    pub fn register(&mut self, layer: usize, path_index: usize, path: &Path) {
        for (segment, seg) in path.segments.iter().enumerate() {
            for endpoint in [Endpoint::Start, Endpoint::End] {
                self.add(
                    seg.endpoint(endpoint),
                    Owner {
                        layer,
                        path: path_index,
                        segment,
                        endpoint,
                    },
                );
            }
        }
    }

    /// Number of cells touched by two or more paths.
    #[must_use]
    pub fn shared_count(&self) -> usize {
        self.cells.values().filter(|c| c.is_shared()).count()
    }

    /// Paths touching the cell of `p`, if two or more do.
    #[must_use]
    pub fn sharers(&self, p: Point) -> Option<BTreeSet<(usize, usize)>> {
        let paths = self.cells.get(&self.key(p))?.paths();
        (paths.len() >= 2).then_some(paths)
    }

    /// Write the unified coordinate of every shared cell back into its
    /// owners. Returns the number of cells unified.
    ///
    /// The unified coordinate is the mean of the registered positions,
    /// snapped to the nearest whole or half pixel when within
    /// `min(snap_tolerance, 0.25)` of it.
    pub fn apply(&self, layers: &mut [Vec<Path>], snap_tolerance: f64) -> usize {
        let threshold = snap_tolerance.clamp(0.0, 0.25);
        let mut unified = 0;
        for cell in self.cells.values().filter(|c| c.is_shared()) {
            let mean = cell.mean();
            let target = Point::new(snap(mean.x, threshold), snap(mean.y, threshold));
            for owner in &cell.owners {
                if let Some(seg) = layers
                    .get_mut(owner.layer)
                    .and_then(|paths| paths.get_mut(owner.path))
                    .and_then(|path| path.segments.get_mut(owner.segment))
                {
                    seg.set_endpoint(owner.endpoint, target);
                }
            }
            unified += 1;
        }
        unified
    }

    /// Vertex outlines for every path, protecting the vertices where a
    /// shared run begins or ends.
    ///
    /// A vertex is protected when its cell is shared and the set of
    /// paths sharing it differs from that of a neighbouring vertex.
    #[must_use]
    pub fn outlines(&self, layers: &[Vec<Path>]) -> Vec<Vec<Outline>> {
        layers
            .iter()
            .map(|paths| {
                paths
                    .iter()
                    .map(|path| {
                        let points = path.vertices();
                        let sharers: Vec<Option<BTreeSet<(usize, usize)>>> =
                            points.iter().map(|&p| self.sharers(p)).collect();
                        let n = points.len();
                        let protected = (0..n)
                            .map(|i| {
                                let Some(own) = &sharers[i] else {
                                    return false;
                                };
                                let neighbours = if path.closed {
                                    [Some((i + n - 1) % n), Some((i + 1) % n)]
                                } else {
                                    [i.checked_sub(1), Some(i + 1).filter(|&j| j < n)]
                                };
                                neighbours
                                    .into_iter()
                                    .any(|j| j.is_none_or(|j| sharers[j].as_ref() != Some(own)))
                            })
                            .collect();
                        Outline::with_protection(points, protected, path.closed)
                    })
                    .collect()
            })
            .collect()
    }
}

/// Register `layers`, unify shared endpoints in place and return the
/// registry for further queries.
pub fn unify(layers: &mut [Vec<Path>], resolution: f64, snap_tolerance: f64) -> EdgeRegistry {
    let registry = EdgeRegistry::from_layers(layers, resolution);
    let unified = registry.apply(layers, snap_tolerance);
    log::debug!(
        "unified {unified} shared vertices at {}x grid resolution",
        registry.resolution
    );
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> Path {
        Path::from_points(
            &[
                Point::new(x0, y0),
                Point::new(x1, y0),
                Point::new(x1, y1),
                Point::new(x0, y1),
            ],
            true,
        )
    }

    #[test]
    fn snapping_pulls_to_whole_and_half_pixels() {
        assert!((snap(3.04, 0.1) - 3.0).abs() < 1e-12);
        assert!((snap(3.97, 0.1) - 4.0).abs() < 1e-12);
        assert!((snap(3.46, 0.1) - 3.5).abs() < 1e-12);
        assert!((snap(3.3, 0.1) - 3.3).abs() < 1e-12);
    }

    #[test]
    fn nearby_shared_points_become_identical() {
        let mut layers = vec![
            vec![rect(0.0, 0.0, 10.03, 5.0)],
            vec![rect(9.98, 0.0, 20.0, 5.0)],
        ];
        let registry = unify(&mut layers, FINE_RESOLUTION, 0.1);
        assert!(registry.shared_count() >= 2);
        let a = layers[0][0].segments[1].start();
        let b = layers[1][0].segments[0].start();
        assert_eq!(a, Point::new(10.0, 0.0));
        assert_eq!(a, b);
        // Closed rings stay closed.
        assert_eq!(layers[0][0].segments[0].end(), a);
    }

    #[test]
    fn unshared_points_are_left_alone() {
        let mut layers = vec![vec![rect(0.13, 0.0, 3.0, 3.0)]];
        let registry = unify(&mut layers, FINE_RESOLUTION, 0.1);
        assert_eq!(registry.shared_count(), 0);
        assert_eq!(layers[0][0].segments[0].start(), Point::new(0.13, 0.0));
    }

    #[test]
    fn protection_marks_ends_of_shared_runs() {
        // Two unit-stepped rectangles sharing the column x = 2.
        let left: Vec<Point> = [(0.0, 0.0), (1.0, 0.0), (2.0, 0.0), (2.0, 1.0), (2.0, 2.0), (1.0, 2.0), (0.0, 2.0), (0.0, 1.0)]
            .into_iter()
            .map(|(x, y)| Point::new(x, y))
            .collect();
        let right: Vec<Point> = [(2.0, 0.0), (3.0, 0.0), (4.0, 0.0), (4.0, 2.0), (3.0, 2.0), (2.0, 2.0), (2.0, 1.0)]
            .into_iter()
            .map(|(x, y)| Point::new(x, y))
            .collect();
        let layers = vec![
            vec![Path::from_points(&left, true)],
            vec![Path::from_points(&right, true)],
        ];
        let registry = EdgeRegistry::from_layers(&layers, COARSE_RESOLUTION);
        let outlines = registry.outlines(&layers);
        let prot = &outlines[0][0].protected;
        // (2,0) and (2,2) end the shared run; (2,1) lies inside it.
        assert_eq!(prot, &vec![false, false, true, false, true, false, false, false]);
    }
}
