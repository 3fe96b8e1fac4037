//! Gradient-aware merging of adjacent quantized regions.
//!
//! Quantizing a smooth gradient slices it into bands of neighbouring
//! palette entries. For every pair of touching regions this module
//! collects the source colors on both sides of their shared boundary,
//! plus a least-squares luma plane per side fitted over a thin band of
//! pixels behind the boundary. Two regions are united when the boundary
//! is color-continuous and both sides slope the same way (parallel or
//! anti-parallel), which is what a real gradient looks like and an
//! incidental neighbour usually does not. Flat regions only merge when
//! one of them is small.

use std::collections::BTreeMap;

use petgraph::unionfind::UnionFind;

use crate::bitmap::Bitmap;
use crate::color::{MAX_DISTANCE, adaptive_threshold, luma, merge_distance, srgb_to_linear};
use crate::config::PipelineConfig;
use crate::linalg::solve3x3_normalized;
use crate::types::{Color, IndexMap};

/// Pixel area below which a region may merge with a color-continuous
/// neighbour even though the two sides show no agreeing gradient.
///
/// Kept as a fixed constant rather than a knob; the right value has not
/// been established.
pub const MIN_REGION_AREA: usize = 50;

/// Depth in pixels of the band sampled on each side of a boundary.
const BAND_DEPTH: i32 = 3;

/// Luma change per pixel below which a fitted plane counts as flat.
const MIN_GRADIENT: f64 = 1e-3;

/// Weighted least-squares sums for fitting `luma = c + gx·x + gy·y`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct PlaneSums {
    w: f64,
    wx: f64,
    wy: f64,
    wxx: f64,
    wyy: f64,
    wxy: f64,
    ws: f64,
    wsx: f64,
    wsy: f64,
}

impl PlaneSums {
    fn add(&mut self, x: f64, y: f64, s: f64, w: f64) {
        self.w += w;
        self.wx += w * x;
        self.wy += w * y;
        self.wxx += w * x * x;
        self.wyy += w * y * y;
        self.wxy += w * x * y;
        self.ws += w * s;
        self.wsx += w * s * x;
        self.wsy += w * s * y;
    }

    /// `(gx, gy)` of the fitted plane, or `None` when the system is
    /// singular (e.g. all samples on one line).
    fn gradient(&self) -> Option<(f64, f64)> {
        let m = [
            [self.w, self.wx, self.wy],
            [self.wx, self.wxx, self.wxy],
            [self.wy, self.wxy, self.wyy],
        ];
        let x = solve3x3_normalized(m, [self.ws, self.wsx, self.wsy])?;
        Some((x[1], x[2]))
    }

    /// Unit gradient direction, or `None` for a singular or flat fit.
    fn direction(&self) -> Option<(f64, f64)> {
        let (gx, gy) = self.gradient()?;
        let n = gx.hypot(gy);
        if n < MIN_GRADIENT {
            return None;
        }
        Some((gx / n, gy / n))
    }
}

/// Statistics for one unordered pair of adjacent regions.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct EdgeStats {
    sum_diff: f64,
    count: usize,
    /// Samples on the lower-index side.
    low: PlaneSums,
    /// Samples on the higher-index side.
    high: PlaneSums,
}

fn sample_luma(c: Color, linear: bool) -> f64 {
    let [r, g, b, _] = c.channels().map(f64::from);
    if linear {
        luma(srgb_to_linear(r), srgb_to_linear(g), srgb_to_linear(b))
    } else {
        luma(r, g, b)
    }
}

/// Whether palette entries `a` and `b` may ever merge.
fn compatible(palette: &[Color], a: usize, b: usize) -> bool {
    match (palette.get(a), palette.get(b)) {
        (Some(ca), Some(cb)) => {
            !ca.is_transparent() && !cb.is_transparent() && ca.alpha_group() == cb.alpha_group()
        }
        _ => false,
    }
}

/// Add the band of region `index` behind boundary pixel `from`, walking
/// away from its neighbour along `step`.
fn sample_band(
    sums: &mut PlaneSums,
    index_map: &IndexMap,
    source: &Bitmap,
    index: i32,
    from: (u32, u32),
    step: (i32, i32),
    linear: bool,
) {
    for k in 0..BAND_DEPTH {
        let (Some(x), Some(y)) = (
            from.0.checked_add_signed(step.0 * k),
            from.1.checked_add_signed(step.1 * k),
        ) else {
            return;
        };
        if x >= index_map.width() || y >= index_map.height() || index_map.at_pixel(x, y) != index {
            return;
        }
        sums.add(f64::from(x), f64::from(y), sample_luma(source.pixel(x, y), linear), 1.0);
    }
}

fn build_adjacency(
    index_map: &IndexMap,
    palette: &[Color],
    source: &Bitmap,
    linear: bool,
) -> BTreeMap<(usize, usize), EdgeStats> {
    let mut adjacency: BTreeMap<(usize, usize), EdgeStats> = BTreeMap::new();
    let w = index_map.width();
    let h = index_map.height();

    let mut visit = |pa: (u32, u32), pb: (u32, u32), step: (i32, i32)| {
        let (ia, ib) = (index_map.at_pixel(pa.0, pa.1), index_map.at_pixel(pb.0, pb.1));
        let (Ok(a), Ok(b)) = (usize::try_from(ia), usize::try_from(ib)) else {
            return;
        };
        if a == b || !compatible(palette, a, b) {
            return;
        }
        let c_a = source.pixel(pa.0, pa.1);
        let c_b = source.pixel(pb.0, pb.1);
        let diff = merge_distance(c_a, c_b);
        if diff > MAX_DISTANCE * 0.5 {
            return;
        }
        let stats = adjacency.entry((a.min(b), a.max(b))).or_default();
        stats.sum_diff += diff;
        stats.count += 1;

        // `pa` walks back along -step, `pb` forward along +step.
        let back = (-step.0, -step.1);
        let (side_a, side_b) = if a < b {
            (&mut stats.low, &mut stats.high)
        } else {
            (&mut stats.high, &mut stats.low)
        };
        sample_band(side_a, index_map, source, ia, pa, back, linear);
        sample_band(side_b, index_map, source, ib, pb, step, linear);
    };

    for y in 0..h {
        for x in 0..w {
            if x + 1 < w {
                visit((x, y), (x + 1, y), (1, 0));
            }
            if y + 1 < h {
                visit((x, y), (x, y + 1), (0, 1));
            }
        }
    }
    adjacency
}

/// Pixel count per palette entry.
fn region_areas(index_map: &IndexMap, k: usize) -> Vec<usize> {
    let mut areas = vec![0; k];
    for y in 0..index_map.height() {
        for x in 0..index_map.width() {
            if let Some(area) = usize::try_from(index_map.at_pixel(x, y))
                .ok()
                .and_then(|i| areas.get_mut(i))
            {
                *area += 1;
            }
        }
    }
    areas
}

/// Thresholds shared by every merge decision.
#[derive(Debug, Clone, Copy)]
struct MergeGate {
    color_tolerance: f64,
    angle_tolerance: f64,
    min_count: usize,
}

impl MergeGate {
    /// Merge decision for one region pair with pixel areas `areas`.
    fn admits(&self, stats: &EdgeStats, areas: (usize, usize)) -> bool {
        if stats.count < self.min_count || stats.count == 0 {
            return false;
        }
        #[allow(clippy::cast_precision_loss)]
        let mean_diff = stats.sum_diff / stats.count as f64;
        if mean_diff > self.color_tolerance {
            return false;
        }

        match (stats.low.direction(), stats.high.direction()) {
            (Some((ax, ay)), Some((bx, by))) => {
                let angle = ax.mul_add(bx, ay * by).clamp(-1.0, 1.0).acos();
                angle <= self.angle_tolerance
                    || (angle - std::f64::consts::PI).abs() <= self.angle_tolerance
            }
            // A flat or singular side: only a small region is absorbed.
            _ => areas.0.min(areas.1) < MIN_REGION_AREA,
        }
    }
}

/// Union regions across gradient-continuous boundaries.
///
/// Returns the remapped index map; the palette is unchanged and every
/// merged group takes its lowest palette index. Without
/// `detect_gradients` the map is returned as is.
#[must_use = "returns the merged index map"]
pub fn merge_regions(
    index_map: &IndexMap,
    palette: &[Color],
    source: &Bitmap,
    config: &PipelineConfig,
) -> IndexMap {
    if !config.detect_gradients || palette.is_empty() || !source.is_valid() {
        return index_map.clone();
    }
    let k = palette.len();
    let adjacency = build_adjacency(index_map, palette, source, config.gradient_linear_rgb);

    let areas = region_areas(index_map, k);
    let gate = MergeGate {
        color_tolerance: adaptive_threshold(k, config.region_merge_color_tolerance),
        angle_tolerance: config.region_merge_angle_tolerance_deg.to_radians(),
        min_count: config.region_merge_min_boundary_count,
    };
    let mut uf = UnionFind::<usize>::new(k);
    let mut unions = 0;
    for (&(a, b), stats) in &adjacency {
        if gate.admits(stats, (areas[a], areas[b])) && uf.union(a, b) {
            unions += 1;
        }
    }
    if unions == 0 {
        return index_map.clone();
    }

    let mut lowest = vec![usize::MAX; k];
    for i in 0..k {
        let root = uf.find(i);
        lowest[root] = lowest[root].min(i);
    }
    let table: Vec<i32> = (0..k)
        .map(|i| i32::try_from(lowest[uf.find(i)]).unwrap_or(-1))
        .collect();
    log::debug!(
        "merged {unions} region pairs out of {} adjacent pairs",
        adjacency.len()
    );

    let mut merged = index_map.clone();
    merged.remap(&table);
    merged
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::quantize;

    fn gradient_config() -> PipelineConfig {
        PipelineConfig {
            detect_gradients: true,
            ..PipelineConfig::default()
        }
    }

    /// Horizontal grey ramp, quantized into vertical bands.
    fn ramp(width: u32, height: u32) -> (Bitmap, Vec<Color>, IndexMap) {
        let b = Bitmap::from_fn(width, height, |x, _| {
            #[allow(clippy::cast_possible_truncation)]
            let v = (60 + x * 120 / width) as u8;
            Color::rgb(v, v, v)
        });
        let palette: Vec<Color> = (0..4_u32)
            .map(|i| {
                #[allow(clippy::cast_possible_truncation)]
                let v = (75 + i * 30) as u8;
                Color::rgb(v, v, v)
            })
            .collect();
        let map = quantize::assign(&b, &palette);
        (b, palette, map)
    }

    #[test]
    fn disabled_without_gradient_detection() {
        let (b, palette, map) = ramp(40, 20);
        let out = merge_regions(&map, &palette, &b, &PipelineConfig::default());
        assert_eq!(out, map);
    }

    #[test]
    fn smooth_ramp_bands_merge() {
        let (b, palette, map) = ramp(40, 20);
        assert!(map.max_index() > Some(0));
        let out = merge_regions(&map, &palette, &b, &gradient_config());
        for y in 0..20 {
            for x in 0..40 {
                assert_eq!(out.at_pixel(x, y), 0, "({x}, {y})");
            }
        }
    }

    #[test]
    fn hard_edge_does_not_merge() {
        let b = Bitmap::from_fn(40, 20, |x, _| {
            if x < 20 {
                Color::rgb(20, 20, 20)
            } else {
                Color::rgb(230, 230, 230)
            }
        });
        let palette = vec![Color::rgb(20, 20, 20), Color::rgb(230, 230, 230)];
        let map = quantize::assign(&b, &palette);
        let out = merge_regions(&map, &palette, &b, &gradient_config());
        assert_eq!(out, map);
    }

    #[test]
    fn large_flat_regions_stay_apart() {
        // Near-identical greys on either side of a straight edge: color
        // continuous, but neither side slopes and both are large.
        let b = Bitmap::from_fn(40, 20, |x, _| {
            if x < 20 {
                Color::rgb(100, 100, 100)
            } else {
                Color::rgb(102, 102, 102)
            }
        });
        let palette = vec![Color::rgb(100, 100, 100), Color::rgb(102, 102, 102)];
        let map = quantize::assign(&b, &palette);
        let out = merge_regions(&map, &palette, &b, &gradient_config());
        assert_eq!(out.at_pixel(0, 0), 0);
        assert_eq!(out.at_pixel(39, 0), 1);
        assert_eq!(out, map);
    }

    #[test]
    fn small_flat_patch_is_absorbed() {
        let b = Bitmap::from_fn(40, 20, |x, y| {
            if (10..15).contains(&x) && (8..13).contains(&y) {
                Color::rgb(102, 102, 102)
            } else {
                Color::rgb(100, 100, 100)
            }
        });
        let palette = vec![Color::rgb(100, 100, 100), Color::rgb(102, 102, 102)];
        let map = quantize::assign(&b, &palette);
        assert_eq!(map.at_pixel(12, 10), 1);
        let out = merge_regions(&map, &palette, &b, &gradient_config());
        assert_eq!(out.at_pixel(12, 10), 0);
        assert_eq!(out.max_index(), Some(0));
    }

    #[test]
    fn band_sampling_resolves_a_straight_edge() {
        // A plane through the boundary column alone is singular; the band
        // behind it is not.
        let b = Bitmap::from_fn(20, 10, |x, _| {
            #[allow(clippy::cast_possible_truncation)]
            let v = (60 + x * 4) as u8;
            Color::rgb(v, v, v)
        });
        let palette = vec![Color::rgb(81, 81, 81), Color::rgb(121, 121, 121)];
        let map = quantize::assign(&b, &palette);
        let adjacency = build_adjacency(&map, &palette, &b, false);
        let stats = adjacency.get(&(0, 1)).unwrap();
        let (lx, ly) = stats.low.direction().unwrap();
        let (hx, hy) = stats.high.direction().unwrap();
        assert!((lx - 1.0).abs() < 1e-9 && ly.abs() < 1e-9);
        assert!((hx - 1.0).abs() < 1e-9 && hy.abs() < 1e-9);
    }

    #[test]
    fn different_alpha_groups_never_merge() {
        // Identical RGB, one side fully transparent.
        let b = Bitmap::from_fn(20, 10, |x, _| {
            Color::new(120, 120, 120, if x < 10 { 0 } else { 255 })
        });
        let palette = vec![Color::TRANSPARENT, Color::rgb(120, 120, 120)];
        let map = quantize::assign(&b, &palette);
        let config = PipelineConfig {
            region_merge_color_tolerance: 1e6,
            region_merge_min_boundary_count: 1,
            ..gradient_config()
        };
        assert_eq!(merge_regions(&map, &palette, &b, &config), map);

        // Semi-transparent against opaque is refused as well.
        let b = Bitmap::from_fn(20, 10, |x, _| {
            Color::new(120, 120, 120, if x < 10 { 100 } else { 255 })
        });
        let palette = vec![Color::new(120, 120, 120, 100), Color::rgb(120, 120, 120)];
        let map = quantize::assign(&b, &palette);
        assert_eq!(merge_regions(&map, &palette, &b, &config), map);
    }

    #[test]
    fn plane_fit_recovers_slope() {
        let mut s = PlaneSums::default();
        for y in 0..5 {
            for x in 0..5 {
                let (x, y) = (f64::from(x), f64::from(y));
                s.add(x, y, 2.0f64.mul_add(x, 10.0 - y), 1.0);
            }
        }
        let (gx, gy) = s.gradient().unwrap_or((0.0, 0.0));
        assert!((gx - 2.0).abs() < 1e-9);
        assert!((gy + 1.0).abs() < 1e-9);
    }

    #[test]
    fn collinear_samples_have_no_gradient() {
        let mut s = PlaneSums::default();
        for x in 0..10 {
            s.add(f64::from(x), 3.0, f64::from(x), 1.0);
        }
        assert!(s.gradient().is_none());
    }
}
