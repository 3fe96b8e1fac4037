//! Linear gradient reconstruction.
//!
//! For each traced path the interior pixels of the source bitmap are
//! sampled and every color channel is regressed as a plane over the
//! image coordinates. The per-channel slopes vote on one consensus
//! direction; the samples are then projected onto that direction and
//! each channel is regressed again as a line over the projection. The
//! smallest and largest projections of the outline vertices give the
//! stop positions, laid on the axis through the sample centroid, and
//! the line fits evaluated there give the stop colors.

use geo::line_measures::Distance;
use geo::{Contains, Coord, Euclidean, LineString, Polygon};
use rayon::prelude::*;

use crate::bitmap::Bitmap;
use crate::color::{adaptive_threshold, linear_to_srgb, perceptual_distance, srgb_to_linear};
use crate::config::PipelineConfig;
use crate::linalg::solve3x3_normalized;
use crate::types::{Bounds, Color, LinearGradient, Path, Point};

/// Minimum weighted agreement between channel directions and the
/// consensus direction, times the weighted plane R².
const MIN_CONFIDENCE: f64 = 0.3;

/// Fewest samples for a plane fit.
const MIN_PLANE_SAMPLES: usize = 10;

/// Distance from the outline at which a sample reaches full weight.
const BORDER_FALLOFF: f64 = 3.0;

/// Weighted pixel samples from the inside of one outline.
#[derive(Debug, Default)]
struct Samples {
    x: Vec<f64>,
    y: Vec<f64>,
    weight: Vec<f64>,
    /// Red, green, blue, alpha. Color channels are in linear light when
    /// the detector works in linear RGB.
    channels: [Vec<f64>; 4],
}

impl Samples {
    fn len(&self) -> usize {
        self.x.len()
    }

    fn total_weight(&self) -> f64 {
        self.weight.iter().sum()
    }

    fn weighted_mean(&self, values: &[f64]) -> Option<f64> {
        let w = self.total_weight();
        (w > 1e-12).then(|| values.iter().zip(&self.weight).map(|(v, w)| v * w).sum::<f64>() / w)
    }

    fn weighted_variance(&self, values: &[f64]) -> f64 {
        let Some(mean) = self.weighted_mean(values) else {
            return 0.0;
        };
        let ss: f64 = values
            .iter()
            .zip(&self.weight)
            .map(|(v, w)| w * (v - mean) * (v - mean))
            .sum();
        ss / self.total_weight()
    }
}

/// Slope and fit quality of one channel regressed as a plane.
#[derive(Debug, Clone, Copy, PartialEq)]
struct PlaneFit {
    gx: f64,
    gy: f64,
    r2: f64,
}

impl PlaneFit {
    fn magnitude(self) -> f64 {
        self.gx.hypot(self.gy)
    }
}

/// Weighted least squares of `v = a + b·x + c·y` with coordinates scaled
/// into the unit square.
fn plane_fit(samples: &Samples, values: &[f64]) -> Option<PlaneFit> {
    if samples.len() < MIN_PLANE_SAMPLES {
        return None;
    }
    let (min_x, max_x) = min_max(&samples.x);
    let (min_y, max_y) = min_max(&samples.y);
    let range_x = if max_x - min_x < 1e-6 { 1.0 } else { max_x - min_x };
    let range_y = if max_y - min_y < 1e-6 { 1.0 } else { max_y - min_y };
    let norm = |i: usize| ((samples.x[i] - min_x) / range_x, (samples.y[i] - min_y) / range_y);

    let mut m = [[0.0; 3]; 3];
    let mut b = [0.0; 3];
    for (i, (&w, &v)) in samples.weight.iter().zip(values).enumerate() {
        let (x, y) = norm(i);
        let basis = [1.0, x, y];
        for (row, &ba) in m.iter_mut().zip(&basis) {
            for (cell, &bb) in row.iter_mut().zip(&basis) {
                *cell += w * ba * bb;
            }
        }
        for (cell, &ba) in b.iter_mut().zip(&basis) {
            *cell += w * v * ba;
        }
    }
    let [a0, a1, a2] = solve3x3_normalized(m, b)?;

    let mean = samples.weighted_mean(values)?;
    let (mut ss_tot, mut ss_res) = (0.0, 0.0);
    for (i, (&w, &v)) in samples.weight.iter().zip(values).enumerate() {
        let (x, y) = norm(i);
        let predicted = a2.mul_add(y, a1.mul_add(x, a0));
        ss_tot += w * (v - mean) * (v - mean);
        ss_res += w * (v - predicted) * (v - predicted);
    }
    let r2 = if ss_tot > 1e-12 { 1.0 - ss_res / ss_tot } else { 0.0 };
    Some(PlaneFit {
        gx: a1 / range_x,
        gy: a2 / range_y,
        r2,
    })
}

fn min_max(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}

/// Consensus gradient direction of the three color channels and its
/// confidence.
///
/// Each channel's unit slope is sign-aligned with the first usable
/// channel and weighted by `R² · variance · |slope|`.
fn consensus_direction(samples: &Samples) -> Option<(Point, f64)> {
    let fits: Vec<Option<PlaneFit>> = samples.channels[..3]
        .iter()
        .map(|values| plane_fit(samples, values))
        .collect();
    if fits.iter().all(Option::is_none) {
        return None;
    }

    let reliability: Vec<f64> = fits
        .iter()
        .zip(&samples.channels)
        .map(|(fit, values)| {
            fit.map_or(0.0, |f| f.r2 * samples.weighted_variance(values) * f.magnitude())
        })
        .collect();
    let total: f64 = reliability.iter().sum();
    if total < 1e-6 {
        return None;
    }

    // Unit directions of the usable channels, sign-aligned to the first.
    let mut units: Vec<(usize, Point)> = Vec::with_capacity(3);
    for (c, fit) in fits.iter().enumerate() {
        let Some(f) = fit else { continue };
        let mag = f.magnitude();
        if mag <= 1e-6 {
            continue;
        }
        let mut u = Point::new(f.gx / mag, f.gy / mag);
        if let Some(&(_, first)) = units.first()
            && u.x.mul_add(first.x, u.y * first.y) < 0.0
        {
            u = Point::new(-u.x, -u.y);
        }
        units.push((c, u));
    }

    let (mut dx, mut dy) = (0.0, 0.0);
    for &(c, u) in &units {
        let w = reliability[c] / total;
        dx += w * u.x;
        dy += w * u.y;
    }
    let norm = dx.hypot(dy);
    if norm < 1e-8 {
        return None;
    }
    let dir = Point::new(dx / norm, dy / norm);

    let consensus: f64 = units
        .iter()
        .map(|&(c, u)| u.x.mul_add(dir.x, u.y * dir.y).abs() * reliability[c] / total)
        .sum();
    let mean_r2: f64 = fits
        .iter()
        .zip(&reliability)
        .map(|(fit, r)| fit.map_or(0.0, |f| f.r2 * r / total))
        .sum();
    let confidence = consensus * mean_r2;
    if units.len() < 2 && confidence < 0.5 {
        return None;
    }
    Some((dir, confidence))
}

/// `v = a + b·t` by weighted least squares.
#[derive(Debug, Clone, Copy)]
struct LineFit1d {
    a: f64,
    b: f64,
}

impl LineFit1d {
    fn at(self, t: f64) -> f64 {
        self.b.mul_add(t, self.a)
    }
}

/// Gradient detection thresholds, with the palette-adaptive ones
/// already scaled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradientDetector {
    /// Base sampling stride.
    pub stride: usize,
    /// Combined R² floor along the consensus direction.
    pub min_r2: f64,
    /// Minimum RGB distance between the stop colors.
    pub min_delta: f64,
    /// Minimum extent of the region and of the sampled projection.
    pub min_size: f64,
    /// Quadratic subdivisions when flattening outlines.
    pub subdivisions: usize,
    /// Minimum interior samples.
    pub min_samples: usize,
    /// Regress color channels in linear light.
    pub linear_rgb: bool,
}

impl GradientDetector {
    /// Thresholds for a palette of `palette_len` entries.
    #[must_use]
    pub fn from_config(config: &PipelineConfig, palette_len: usize) -> Self {
        Self {
            stride: config.gradient_sample_stride.max(1),
            min_r2: config.gradient_min_r2.max(config.gradient_min_r2_total),
            min_delta: adaptive_threshold(palette_len, config.gradient_min_delta),
            min_size: adaptive_threshold(palette_len, config.gradient_min_size),
            subdivisions: config.gradient_max_subdivision.max(1),
            min_samples: config.gradient_min_samples,
            linear_rgb: config.gradient_linear_rgb,
        }
    }

    /// Sampling stride for a region of the given bounding area.
    fn stride_for(&self, area: f64) -> usize {
        if area > 10_000.0 {
            self.stride + 1
        } else if area > 2_500.0 {
            self.stride
        } else {
            1
        }
    }

    fn sample(&self, outline: &[Point], bounds: &Bounds, bitmap: &Bitmap) -> Samples {
        let ring: LineString<f64> = outline
            .iter()
            .chain(outline.first())
            .map(|p| Coord { x: p.x, y: p.y })
            .collect();
        let polygon = Polygon::new(ring.clone(), Vec::new());

        let stride = self.stride_for(bounds.area());
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let (x0, y0) = (bounds.min_x.floor().max(0.0) as u32, bounds.min_y.floor().max(0.0) as u32);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let (x1, y1) = (
            (bounds.max_x.ceil().max(0.0) as u32).min(bitmap.width().saturating_sub(1)),
            (bounds.max_y.ceil().max(0.0) as u32).min(bitmap.height().saturating_sub(1)),
        );

        let mut samples = Samples::default();
        for y in (y0..=y1).step_by(stride) {
            for x in (x0..=x1).step_by(stride) {
                let center = geo::Point::new(f64::from(x) + 0.5, f64::from(y) + 0.5);
                if !polygon.contains(&center) {
                    continue;
                }
                let px = bitmap.pixel(x, y);
                if px.is_transparent() {
                    continue;
                }
                let border = (Euclidean.distance(&center, &ring) / BORDER_FALLOFF).clamp(0.1, 1.0);
                let weight = border * border * f64::from(px.a) / 255.0;
                let tone = |v: u8| {
                    let v = f64::from(v);
                    if self.linear_rgb { srgb_to_linear(v) } else { v }
                };
                samples.x.push(center.x());
                samples.y.push(center.y());
                samples.weight.push(weight);
                samples.channels[0].push(tone(px.r));
                samples.channels[1].push(tone(px.g));
                samples.channels[2].push(tone(px.b));
                samples.channels[3].push(f64::from(px.a));
            }
        }
        samples
    }

    /// Detect a linear gradient inside one closed path.
    #[must_use]
    pub fn detect(&self, path: &Path, bitmap: &Bitmap) -> Option<LinearGradient> {
        if !path.closed {
            return None;
        }
        let outline = path.flatten(self.subdivisions);
        if outline.len() < 3 {
            return None;
        }
        let bounds = Bounds::of(&outline)?;
        if bounds.width().max(bounds.height()) < self.min_size {
            return None;
        }

        let samples = self.sample(&outline, &bounds, bitmap);
        if samples.len() < self.min_samples.max(MIN_PLANE_SAMPLES) {
            return None;
        }
        let (dir, confidence) = consensus_direction(&samples)?;
        if confidence < MIN_CONFIDENCE {
            return None;
        }

        let t: Vec<f64> = samples
            .x
            .iter()
            .zip(&samples.y)
            .map(|(&x, &y)| x.mul_add(dir.x, y * dir.y))
            .collect();
        let w = &samples.weight;
        let sw: f64 = w.iter().sum();
        let swt: f64 = w.iter().zip(&t).map(|(w, t)| w * t).sum();
        let swtt: f64 = w.iter().zip(&t).map(|(w, t)| w * t * t).sum();
        let denom = sw.mul_add(swtt, -(swt * swt));
        if denom.abs() < 1e-12 {
            return None;
        }
        let fits: Vec<LineFit1d> = samples
            .channels
            .iter()
            .map(|values| {
                let sv: f64 = w.iter().zip(values).map(|(w, v)| w * v).sum();
                let svt: f64 = w.iter().zip(values).zip(&t).map(|((w, v), t)| w * v * t).sum();
                let b = sw.mul_add(svt, -(swt * sv)) / denom;
                LineFit1d {
                    a: b.mul_add(-swt, sv) / sw,
                    b,
                }
            })
            .collect();

        // R² of the color channels, weighted by their total variation.
        let (mut r2_sum, mut ss_sum) = (0.0, 0.0);
        for (fit, values) in fits.iter().zip(&samples.channels).take(3) {
            let Some(mean) = samples.weighted_mean(values) else {
                continue;
            };
            let (mut ss_tot, mut ss_res) = (0.0, 0.0);
            for ((w, v), &t) in w.iter().zip(values).zip(&t) {
                ss_tot += w * (v - mean) * (v - mean);
                ss_res += w * (v - fit.at(t)) * (v - fit.at(t));
            }
            if ss_tot > 1e-12 {
                r2_sum += (1.0 - ss_res / ss_tot) * ss_tot;
                ss_sum += ss_tot;
            }
        }
        let r2 = if ss_sum > 0.0 { r2_sum / ss_sum } else { 0.0 };
        if r2 < self.min_r2 {
            log::trace!("gradient rejected: R² {r2:.3}");
            return None;
        }

        let (t_min, t_max) = min_max(&t);
        if t_max - t_min < self.min_size {
            return None;
        }
        let stop = |t: f64| {
            let mut channels = [0u8; 4];
            for (c, (slot, fit)) in channels.iter_mut().zip(&fits).enumerate() {
                let v = fit.at(t);
                let v = if self.linear_rgb && c < 3 { linear_to_srgb(v) } else { v };
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let byte = (v.clamp(0.0, 255.0) + 0.5) as u8;
                *slot = byte;
            }
            Color::new(channels[0], channels[1], channels[2], channels[3])
        };
        // Stops sit at the outline's extreme projections, placed on the
        // axis through the sample centroid so tied corners cannot skew
        // the vector.
        let project = |p: &Point| p.x.mul_add(dir.x, p.y * dir.y);
        let (lo, hi) = outline.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
            let t = project(p);
            (lo.min(t), hi.max(t))
        });
        let centroid = Point::new(
            samples.weighted_mean(&samples.x)?,
            samples.weighted_mean(&samples.y)?,
        );
        let t_c = project(&centroid);
        let on_axis = |t: f64| {
            Point::new(
                (t - t_c).mul_add(dir.x, centroid.x),
                (t - t_c).mul_add(dir.y, centroid.y),
            )
        };
        let (start, end) = (on_axis(lo), on_axis(hi));

        let (start_color, end_color) = (stop(lo), stop(hi));
        if perceptual_distance(start_color, end_color) < self.min_delta {
            return None;
        }

        Some(LinearGradient {
            start,
            end,
            start_color,
            end_color,
        })
    }
}

/// Detect gradients for every path of every layer, in parallel per
/// layer. The result is parallel to `layers`.
#[must_use = "returns the detected gradients"]
pub fn detect_gradients(
    layers: &[Vec<Path>],
    bitmap: &Bitmap,
    palette_len: usize,
    config: &PipelineConfig,
) -> Vec<Vec<Option<LinearGradient>>> {
    let detector = GradientDetector::from_config(config, palette_len);
    let gradients: Vec<Vec<Option<LinearGradient>>> = layers
        .par_iter()
        .map(|paths| paths.iter().map(|p| detector.detect(p, bitmap)).collect())
        .collect();
    let found = gradients.iter().flatten().filter(|g| g.is_some()).count();
    log::debug!("gradients: {found} detected");
    gradients
}
