//! Color metrics shared by quantization, region merging and gradient
//! detection.

use crate::types::Color;

/// Distance reported between colors that must never be matched.
pub const MAX_DISTANCE: f64 = 999_999.0;

/// HSV-style saturation: `(max - min) / max`, 0 for black.
#[must_use]
pub fn saturation(c: Color) -> f64 {
    let max = c.r.max(c.g).max(c.b);
    let min = c.r.min(c.g).min(c.b);
    if max == 0 {
        return 0.0;
    }
    f64::from(max - min) / f64::from(max)
}

/// Red-mean weighted RGB distance.
fn weighted_rgb(a: Color, b: Color) -> f64 {
    let dr = f64::from(a.r) - f64::from(b.r);
    let dg = f64::from(a.g) - f64::from(b.g);
    let db = f64::from(a.b) - f64::from(b.b);
    let mean_r = (f64::from(a.r) + f64::from(b.r)) * 0.5;
    let wr = 2.0 + mean_r / 256.0;
    let wb = 2.0 + (255.0 - mean_r) / 256.0;
    (wr * dr * dr + 4.0 * dg * dg + wb * db * db).sqrt()
}

/// Perceptual distance used for palette search.
///
/// Two transparent colors are identical; a transparent and an opaque
/// color are infinitely far apart. Otherwise the red-mean weighted RGB
/// distance is penalized by saturation difference, alpha difference and
/// alpha-bucket mismatch.
#[must_use]
pub fn perceptual_distance(a: Color, b: Color) -> f64 {
    match (a.is_transparent(), b.is_transparent()) {
        (true, true) => return 0.0,
        (true, false) | (false, true) => return MAX_DISTANCE,
        (false, false) => {}
    }
    let sat_penalty = (saturation(a) - saturation(b)).abs() * 30.0;
    let alpha_penalty = f64::from(a.a.abs_diff(b.a)).mul_add(
        1.5,
        f64::from(a.alpha_group().distance(b.alpha_group())) * 150.0,
    );
    weighted_rgb(a, b) + sat_penalty + alpha_penalty
}

/// Perceptual distance used when merging palette entries or regions.
///
/// Colors in different alpha buckets are never mergeable.
#[must_use]
pub fn merge_distance(a: Color, b: Color) -> f64 {
    match (a.is_transparent(), b.is_transparent()) {
        (true, true) => return 0.0,
        (true, false) | (false, true) => return MAX_DISTANCE,
        (false, false) => {}
    }
    if a.alpha_group() != b.alpha_group() {
        return MAX_DISTANCE;
    }
    let sat_penalty = (saturation(a) - saturation(b)).abs() * 25.0;
    let alpha_penalty = f64::from(a.a.abs_diff(b.a)) * 1.2;
    weighted_rgb(a, b) + sat_penalty + alpha_penalty
}

/// Scale a base threshold by palette size: small palettes are stricter,
/// large palettes more tolerant.
#[must_use]
pub fn adaptive_threshold(palette_size: usize, base: f64) -> f64 {
    let factor = match palette_size {
        0..=8 => 0.8,
        9..=16 => 0.9,
        17..=32 => 1.0,
        33..=48 => 1.15,
        _ => 1.3,
    };
    base * factor
}

/// sRGB channel value (0–255) to linear light on the same scale.
#[must_use]
pub fn srgb_to_linear(v: f64) -> f64 {
    let u = v / 255.0;
    let l = if u <= 0.040_45 {
        u / 12.92
    } else {
        ((u + 0.055) / 1.055).powf(2.4)
    };
    l * 255.0
}

/// Linear light (0–255 scale) back to an sRGB channel value, clamped.
#[must_use]
pub fn linear_to_srgb(v: f64) -> f64 {
    let u = v / 255.0;
    let s = if u <= 0.003_130_8 {
        12.92 * u
    } else {
        1.055f64.mul_add(u.powf(1.0 / 2.4), -0.055)
    };
    (s * 255.0).clamp(0.0, 255.0)
}

/// Rec. 709 luma of floating-point channels.
#[must_use]
pub fn luma(r: f64, g: f64, b: f64) -> f64 {
    0.2126f64.mul_add(r, 0.7152f64.mul_add(g, 0.0722 * b))
}

/// Rec. 601 luma, as used by the edge-strength filter.
#[must_use]
pub fn luma_601(c: Color) -> f64 {
    f64::from(u32::from(c.r) * 299 + u32::from(c.g) * 587 + u32::from(c.b) * 114) / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_colors_have_zero_distance() {
        let c = Color::rgb(12, 200, 99);
        assert!(perceptual_distance(c, c).abs() < 1e-12);
        assert!(merge_distance(c, c).abs() < 1e-12);
    }

    #[test]
    fn transparency_rules() {
        let clear_a = Color::new(255, 0, 0, 0);
        let clear_b = Color::new(0, 255, 0, 5);
        let opaque = Color::rgb(255, 0, 0);
        assert!(perceptual_distance(clear_a, clear_b).abs() < f64::EPSILON);
        assert!((perceptual_distance(clear_a, opaque) - MAX_DISTANCE).abs() < f64::EPSILON);
        assert!((merge_distance(opaque, clear_b) - MAX_DISTANCE).abs() < f64::EPSILON);
    }

    #[test]
    fn merge_distance_refuses_alpha_bucket_mismatch() {
        let semi = Color::new(100, 100, 100, 100);
        let opaque = Color::rgb(100, 100, 100);
        assert!((merge_distance(semi, opaque) - MAX_DISTANCE).abs() < f64::EPSILON);
        // Search distance only penalizes the mismatch.
        assert!(perceptual_distance(semi, opaque) < MAX_DISTANCE);
        assert!(perceptual_distance(semi, opaque) > 150.0);
    }

    #[test]
    fn green_weighs_more_than_blue() {
        let base = Color::rgb(128, 128, 128);
        let dg = perceptual_distance(base, Color::rgb(128, 148, 128));
        let db = perceptual_distance(base, Color::rgb(128, 128, 148));
        assert!(dg > db);
    }

    #[test]
    fn adaptive_threshold_scales_by_palette_size() {
        assert!((adaptive_threshold(8, 10.0) - 8.0).abs() < 1e-12);
        assert!((adaptive_threshold(16, 10.0) - 9.0).abs() < 1e-12);
        assert!((adaptive_threshold(32, 10.0) - 10.0).abs() < 1e-12);
        assert!((adaptive_threshold(48, 10.0) - 11.5).abs() < 1e-12);
        assert!((adaptive_threshold(64, 10.0) - 13.0).abs() < 1e-12);
    }

    #[test]
    fn srgb_linear_roundtrip() {
        for v in [0.0, 1.0, 10.0, 64.0, 128.0, 200.0, 255.0] {
            let back = linear_to_srgb(srgb_to_linear(v));
            assert!((back - v).abs() < 1e-9, "{v} -> {back}");
        }
    }

    #[test]
    fn saturation_of_grey_is_zero() {
        assert!(saturation(Color::rgb(90, 90, 90)).abs() < f64::EPSILON);
        assert!((saturation(Color::rgb(255, 0, 0)) - 1.0).abs() < f64::EPSILON);
        assert!(saturation(Color::rgb(0, 0, 0)).abs() < f64::EPSILON);
    }

    #[test]
    fn luma_weights_sum_to_one() {
        assert!((luma(255.0, 255.0, 255.0) - 255.0).abs() < 1e-9);
        assert!((luma_601(Color::rgb(255, 255, 255)) - 255.0).abs() < 1e-9);
    }
}
