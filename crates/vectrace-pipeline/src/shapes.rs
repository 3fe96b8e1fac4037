//! Vector writer: annotated layers → render-ready shapes.
//!
//! Every closed path of an opaque or translucent layer becomes one
//! shape. Regions that are transparent in the source are cut out of
//! every shape that encloses them as even-odd subpaths, since scanned
//! outlines cover their holes. Same-layer holes are painted as their
//! own shapes on top of their parent, unless their inside is
//! transparent, in which case they are cut out of the parent as well.
//! Shapes are ordered back to front by descending bounding-box area.

use geo::{Contains, Coord, LineString, Polygon};

use crate::bitmap::Bitmap;
use crate::config::PipelineConfig;
use crate::types::{Bounds, Color, FillRule, Layer, Paint, Path, Shape};

/// Quadratic subdivisions when flattening for containment tests.
const FLATTEN_STEPS: usize = 4;

/// Interior pixels probed per axis when testing a hole for transparency.
const PROBE_GRID: u32 = 8;

/// Stroke widths below this are dropped.
const MIN_STROKE: f64 = 0.5;

/// Stroke widths are capped at this.
const MAX_STROKE: f64 = 4.0;

/// Same-color stroke width for opaque fills, in output units.
///
/// Grows logarithmically with the output size and saturates with the
/// palette size; returns `None` when the width would be too thin to
/// matter.
#[must_use]
pub fn adaptive_stroke_width(width: u32, height: u32, palette_len: usize, scale: f64) -> Option<f64> {
    let max_dimension = (f64::from(width.max(height)) * scale).max(1.0);
    let base = 1.1f64.mul_add((max_dimension / 50.0 + 1.0).ln(), 0.3);
    #[allow(clippy::cast_precision_loss)]
    let palette = (palette_len as f64 / 32.0).min(2.0);
    let factor = 0.75f64.mul_add(1.0 - (-palette * 0.8).exp(), 0.5);
    let stroke = base * factor;
    (stroke >= MIN_STROKE).then(|| stroke.min(MAX_STROKE))
}

/// A closed path flattened for point-in-polygon tests.
struct Region {
    polygon: Polygon<f64>,
    bounds: Bounds,
    probes: Vec<Coord<f64>>,
}

impl Region {
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
        let step = coords.len().div_ceil(5).max(1);
        let probes = coords.iter().step_by(step).copied().collect();
        Some(Self {
            polygon: Polygon::new(LineString::from(coords), Vec::new()),
            bounds,
            probes,
        })
    }

    fn encloses(&self, other: &Self) -> bool {
        if self.bounds.area() <= other.bounds.area() || !self.bounds.contains(&other.bounds, 0.5) {
            return false;
        }
        let inside = other
            .probes
            .iter()
            .filter(|&&c| self.polygon.contains(&geo::Point::from(c)))
            .count();
        inside * 2 > other.probes.len()
    }

    /// Whether most source pixels inside the region are transparent.
    fn is_transparent_in(&self, bitmap: &Bitmap) -> bool {
        let b = &self.bounds;
        let (mut inside, mut clear) = (0, 0);
        for j in 0..PROBE_GRID {
            for i in 0..PROBE_GRID {
                let fx = (f64::from(i) + 0.5) / f64::from(PROBE_GRID);
                let fy = (f64::from(j) + 0.5) / f64::from(PROBE_GRID);
                let (x, y) = (fx.mul_add(b.width(), b.min_x), fy.mul_add(b.height(), b.min_y));
                if !self.polygon.contains(&geo::Point::new(x, y)) || x < 0.0 || y < 0.0 {
                    continue;
                }
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let (px, py) = (x as u32, y as u32);
                if px >= bitmap.width() || py >= bitmap.height() {
                    continue;
                }
                inside += 1;
                if bitmap.pixel(px, py).is_transparent() {
                    clear += 1;
                }
            }
        }
        inside > 0 && clear * 2 > inside
    }
}

fn paint_for(layer: &Layer, index: usize, color: Color) -> Paint {
    match layer.gradients.get(index).copied().flatten() {
        Some(gradient) => Paint::Gradient { gradient },
        None => Paint::Solid { color },
    }
}

/// Build the shape list from annotated layers.
///
/// `bitmap` is the prepared source the palette was built from; it
/// decides whether holes are transparent.
#[must_use = "returns the shapes"]
pub fn build_shapes(layers: &[Layer], palette: &[Color], bitmap: &Bitmap, config: &PipelineConfig) -> Vec<Shape> {
    let stroke = adaptive_stroke_width(bitmap.width(), bitmap.height(), palette.len(), config.scale)
        .map(|w| w / config.scale.max(f64::EPSILON));

    let regions: Vec<Vec<Option<Region>>> = layers
        .iter()
        .map(|layer| layer.paths.iter().map(Region::of).collect())
        .collect();

    // Cutouts: every path of a transparent layer, plus same-layer holes
    // whose inside is transparent.
    let mut cutouts: Vec<(usize, usize)> = Vec::new();
    let mut hole_cut = vec![Vec::new(); layers.len()];
    for (k, layer) in layers.iter().enumerate() {
        let transparent_layer = palette.get(k).is_none_or(|c| c.is_transparent());
        for (i, region) in regions[k].iter().enumerate() {
            let Some(region) = region else { continue };
            if transparent_layer {
                cutouts.push((k, i));
            } else if layer.metadata.get(i).is_some_and(|m| m.is_hole)
                && region.is_transparent_in(bitmap)
            {
                hole_cut[k].push(i);
                cutouts.push((k, i));
            }
        }
    }

    let mut shapes = Vec::new();
    for (k, layer) in layers.iter().enumerate() {
        let Some(&color) = palette.get(k) else { continue };
        if color.is_transparent() {
            continue;
        }
        for (i, path) in layer.paths.iter().enumerate() {
            if hole_cut[k].contains(&i) || path.unique_vertex_count() < 3 {
                continue;
            }
            let Some(region) = &regions[k][i] else { continue };

            let mut subpaths = vec![path.clone()];
            for &(ck, ci) in &cutouts {
                if (ck, ci) == (k, i) {
                    continue;
                }
                if let Some(cut) = &regions[ck][ci]
                    && region.encloses(cut)
                {
                    subpaths.push(layers[ck].paths[ci].clone());
                }
            }

            let paint = paint_for(layer, i, color);
            let opacity = f64::from(color.a) / 255.0;
            let stroke_width = match paint {
                Paint::Solid { .. } if color.a == u8::MAX => stroke,
                _ => None,
            };
            let fill_rule = if subpaths.len() > 1 {
                FillRule::EvenOdd
            } else {
                FillRule::NonZero
            };
            shapes.push(Shape {
                layer: k,
                path: i,
                subpaths,
                paint,
                fill_rule,
                opacity: if matches!(paint, Paint::Gradient { .. }) { 1.0 } else { opacity },
                stroke_width,
                bbox_area: region.bounds.area(),
            });
        }
    }

    shapes.sort_by(|a, b| b.bbox_area.total_cmp(&a.bbox_area));
    log::debug!("shapes: {} from {} cutouts", shapes.len(), cutouts.len());
    shapes
}
