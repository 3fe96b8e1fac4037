//! Path nesting within a layer.
//!
//! A path's parent is the smallest other closed path of the same layer
//! whose bounds contain it and which contains a majority of its sample
//! vertices. Depth is the length of the parent chain; odd depths are
//! holes. Winding is normalized afterwards so fills run clockwise on
//! screen and holes counter-clockwise.

use geo::{Contains, Coord, LineString, Polygon};
use rayon::prelude::*;
use rstar::RTree;
use rstar::primitives::{GeomWithData, Rectangle};

use crate::types::{Bounds, Path, PathMetadata};

/// Parent chains longer than this are cut off.
const MAX_DEPTH: usize = 100;

/// Vertices tested against each candidate parent.
const MAX_SAMPLES: usize = 5;

/// Slack when comparing bounding boxes, in pixels.
const BOUNDS_SLACK: f64 = 0.5;

/// Quadratic subdivisions when flattening for containment tests.
const FLATTEN_STEPS: usize = 4;

type IndexedBounds = GeomWithData<Rectangle<[f64; 2]>, usize>;

/// Flattened geometry of one closed path.
struct Ring {
    polygon: Polygon<f64>,
    bounds: Bounds,
    samples: Vec<Coord<f64>>,
}

impl Ring {
    fn of(path: &Path) -> Option<Self> {
        if !path.closed {
            return None;
        }
        let points = path.flatten(FLATTEN_STEPS);
        if points.len() < 3 {
            return None;
        }
        let bounds = Bounds::of(&points)?;
        let coords: Vec<Coord<f64>> = points.iter().map(|p| Coord { x: p.x, y: p.y }).collect();
        let step = coords.len().div_ceil(MAX_SAMPLES).max(1);
        let samples = coords.iter().step_by(step).copied().collect();
        Some(Self {
            polygon: Polygon::new(LineString::from(coords), Vec::new()),
            bounds,
            samples,
        })
    }

    /// Whether most of `other`'s sample vertices lie inside this ring.
    fn encloses(&self, other: &Self) -> bool {
        let inside = other
            .samples
            .iter()
            .filter(|&&c| self.polygon.contains(&geo::Point::from(c)))
            .count();
        inside * 2 > other.samples.len()
    }
}

/// Parent of every path, or `None` for top-level and open paths.
fn parents(rings: &[Option<Ring>]) -> Vec<Option<usize>> {
    let tree: RTree<IndexedBounds> = RTree::bulk_load(
        rings
            .iter()
            .enumerate()
            .filter_map(|(i, r)| {
                r.as_ref().map(|r| {
                    let b = &r.bounds;
                    GeomWithData::new(
                        Rectangle::from_corners([b.min_x, b.min_y], [b.max_x, b.max_y]),
                        i,
                    )
                })
            })
            .collect(),
    );

    rings
        .iter()
        .enumerate()
        .map(|(i, ring)| {
            let ring = ring.as_ref()?;
            let probe = [ring.bounds.min_x, ring.bounds.min_y];
            tree.nearest_neighbor_iter_with_distance_2(&probe)
                .take_while(|(_, d2)| *d2 <= BOUNDS_SLACK * BOUNDS_SLACK)
                .map(|(candidate, _)| candidate.data)
                .filter(|&j| j != i)
                .filter_map(|j| rings[j].as_ref().map(|r| (j, r)))
                .filter(|(_, r)| {
                    r.bounds.area() > ring.bounds.area()
                        && r.bounds.contains(&ring.bounds, BOUNDS_SLACK)
                        && r.encloses(ring)
                })
                .min_by(|(ja, a), (jb, b)| {
                    a.bounds
                        .area()
                        .total_cmp(&b.bounds.area())
                        .then(ja.cmp(jb))
                })
                .map(|(j, _)| j)
        })
        .collect()
}

/// Nesting metadata for one layer's paths, reversing paths whose
/// winding disagrees with their fill or hole role.
#[must_use = "returns the path metadata"]
pub fn analyze_layer(paths: &mut [Path]) -> Vec<PathMetadata> {
    let rings: Vec<Option<Ring>> = paths.iter().map(Ring::of).collect();
    let parent = parents(&rings);

    paths
        .iter_mut()
        .enumerate()
        .map(|(i, path)| {
            let mut depth = 0;
            let mut cursor = parent[i];
            while let Some(p) = cursor {
                depth += 1;
                if depth >= MAX_DEPTH {
                    break;
                }
                cursor = parent[p];
            }
            let is_hole = depth % 2 == 1;
            let clockwise = !is_hole;
            if path.closed && (path.signed_area() > 0.0) != clockwise {
                *path = path.reversed();
            }
            PathMetadata {
                parent: parent[i],
                depth,
                is_hole,
                clockwise,
                area: rings[i]
                    .as_ref()
                    .map_or_else(|| path.bounds().map_or(0.0, |b| b.area()), |r| r.bounds.area()),
            }
        })
        .collect()
}

/// [`analyze_layer`] for every layer, in parallel.
#[must_use = "returns the path metadata"]
pub fn analyze(layers: &mut [Vec<Path>]) -> Vec<Vec<PathMetadata>> {
    let metadata: Vec<Vec<PathMetadata>> = layers
        .par_iter_mut()
        .map(|paths| analyze_layer(paths))
        .collect();
    let holes = metadata.iter().flatten().filter(|m| m.is_hole).count();
    log::debug!("hierarchy: {holes} holes");
    metadata
}
