//! Background detection and removal.
//!
//! The background color is guessed from the image border, then every
//! pixel connected to the border through matching colors becomes fully
//! transparent. Matching uses the summed absolute RGBA difference.

use std::collections::VecDeque;

use image::{GrayImage, Luma};
use imageproc::region_labelling::{Connectivity, connected_components};

use crate::bitmap::Bitmap;
use crate::config::BackgroundMethod;
use crate::types::Color;

fn manhattan(a: Color, b: Color) -> u32 {
    u32::from(a.r.abs_diff(b.r))
        + u32::from(a.g.abs_diff(b.g))
        + u32::from(a.b.abs_diff(b.b))
        + u32::from(a.a.abs_diff(b.a))
}

fn matches(a: Color, b: Color, tolerance: u32) -> bool {
    manhattan(a, b) <= tolerance
}

/// Border pixels in a fixed order: top and bottom rows, then the left
/// and right columns without the corners.
fn border_pixels(width: u32, height: u32) -> Vec<(u32, u32)> {
    let mut out = Vec::with_capacity(2 * (width + height) as usize);
    for x in 0..width {
        out.push((x, 0));
        if height > 1 {
            out.push((x, height - 1));
        }
    }
    for y in 1..height.saturating_sub(1) {
        out.push((0, y));
        if width > 1 {
            out.push((width - 1, y));
        }
    }
    out
}

/// 4-connected flood from `start` over pixels matching `target`,
/// marking `visited`. Returns the flooded pixel indices.
fn flood(
    bitmap: &Bitmap,
    start: (u32, u32),
    target: Color,
    tolerance: u32,
    visited: &mut [bool],
) -> Vec<usize> {
    let w = bitmap.width();
    let h = bitmap.height();
    let mut filled = Vec::new();
    let mut queue = VecDeque::from([start]);
    while let Some((x, y)) = queue.pop_front() {
        let idx = y as usize * w as usize + x as usize;
        if visited[idx] || !matches(bitmap.pixel(x, y), target, tolerance) {
            continue;
        }
        visited[idx] = true;
        filled.push(idx);
        if x + 1 < w {
            queue.push_back((x + 1, y));
        }
        if x > 0 {
            queue.push_back((x - 1, y));
        }
        if y + 1 < h {
            queue.push_back((x, y + 1));
        }
        if y > 0 {
            queue.push_back((x, y - 1));
        }
    }
    filled
}

/// Seed color of the largest region flooded from the four corners.
#[must_use]
pub fn detect_simple(bitmap: &Bitmap, tolerance: u32) -> Color {
    if !bitmap.is_valid() {
        return Color::rgb(0, 0, 0);
    }
    let w = bitmap.width();
    let h = bitmap.height();
    let mut visited = vec![false; w as usize * h as usize];
    let corners = [(0, 0), (w - 1, 0), (0, h - 1), (w - 1, h - 1)];

    let mut best = Color::rgb(0, 0, 0);
    let mut best_area = 0;
    for corner in corners {
        let idx = corner.1 as usize * w as usize + corner.0 as usize;
        if visited[idx] {
            continue;
        }
        let color = bitmap.pixel(corner.0, corner.1);
        let area = flood(bitmap, corner, color, tolerance, &mut visited).len();
        if area > best_area {
            best_area = area;
            best = color;
        }
    }
    best
}

/// Fraction of border pixels matching `color`.
#[must_use]
pub fn edge_score(bitmap: &Bitmap, color: Color, tolerance: u32) -> f64 {
    let border = border_pixels(bitmap.width(), bitmap.height());
    if border.is_empty() {
        return 0.0;
    }
    let hits = border
        .iter()
        .filter(|&&(x, y)| matches(bitmap.pixel(x, y), color, tolerance))
        .count();
    #[allow(clippy::cast_precision_loss)]
    let score = hits as f64 / border.len() as f64;
    score
}

/// Largest 4-connected component of pixels matching `color`, as a
/// fraction of the image.
#[must_use]
pub fn connectivity_score(bitmap: &Bitmap, color: Color, tolerance: u32) -> f64 {
    let w = bitmap.width();
    let h = bitmap.height();
    let mask = GrayImage::from_fn(w, h, |x, y| {
        if matches(bitmap.pixel(x, y), color, tolerance) {
            Luma([255])
        } else {
            Luma([0])
        }
    });
    let labels = connected_components(&mask, Connectivity::Four, Luma([0u8]));

    let mut sizes: Vec<usize> = Vec::new();
    for label in labels.pixels() {
        let l = label.0[0] as usize;
        if l == 0 {
            continue;
        }
        if sizes.len() <= l {
            sizes.resize(l + 1, 0);
        }
        sizes[l] += 1;
    }
    let largest = sizes.into_iter().max().unwrap_or(0);
    #[allow(clippy::cast_precision_loss)]
    let score = largest as f64 / (f64::from(w) * f64::from(h));
    score
}

/// Most common border color, clustering border pixels under `tolerance`.
fn dominant_border_color(bitmap: &Bitmap, tolerance: u32) -> Color {
    let mut clusters: Vec<(Color, usize)> = Vec::new();
    for (x, y) in border_pixels(bitmap.width(), bitmap.height()) {
        let c = bitmap.pixel(x, y);
        if let Some(entry) = clusters.iter_mut().find(|(k, _)| matches(c, *k, tolerance)) {
            entry.1 += 1;
        } else {
            clusters.push((c, 1));
        }
    }
    let mut best = Color::rgb(0, 0, 0);
    let mut best_count = 0;
    for (color, count) in clusters {
        if count > best_count {
            best_count = count;
            best = color;
        }
    }
    best
}

fn score(bitmap: &Bitmap, color: Color, tolerance: u32) -> f64 {
    edge_score(bitmap, color, tolerance).mul_add(2.0, connectivity_score(bitmap, color, tolerance))
}

/// Pick between the corner-flood color and the dominant border color.
#[must_use]
pub fn detect_auto(bitmap: &Bitmap, tolerance: u32) -> Color {
    let flood_color = detect_simple(bitmap, tolerance);
    let edge_color = dominant_border_color(bitmap, tolerance);
    if matches(flood_color, edge_color, tolerance) {
        return flood_color;
    }
    if score(bitmap, edge_color, tolerance) > score(bitmap, flood_color, tolerance) {
        edge_color
    } else {
        flood_color
    }
}

/// Make every border-connected pixel matching `background` transparent.
#[must_use = "returns a new bitmap with the background cleared"]
pub fn clear_background(bitmap: &Bitmap, background: Color, tolerance: u32) -> Bitmap {
    let w = bitmap.width();
    let mut visited = vec![false; w as usize * bitmap.height() as usize];
    let mut out = bitmap.clone();
    for start in border_pixels(w, bitmap.height()) {
        for idx in flood(bitmap, start, background, tolerance, &mut visited) {
            #[allow(clippy::cast_possible_truncation)]
            let (x, y) = ((idx % w as usize) as u32, (idx / w as usize) as u32);
            out.set_channel(x, y, 3, 0);
        }
    }
    out
}

/// Detect and remove the background.
///
/// Invalid bitmaps are returned unchanged. In [`BackgroundMethod::Auto`]
/// mode nothing is removed when the detected background's largest
/// connected area covers less than `min_ratio` of the image.
#[must_use = "returns a new bitmap with the background cleared"]
pub fn remove_background(
    bitmap: &Bitmap,
    method: BackgroundMethod,
    tolerance: u32,
    min_ratio: f64,
) -> Bitmap {
    if !bitmap.is_valid() {
        return bitmap.clone();
    }
    let background = match method {
        BackgroundMethod::Simple => detect_simple(bitmap, tolerance),
        BackgroundMethod::Auto => {
            let color = detect_auto(bitmap, tolerance);
            let ratio = connectivity_score(bitmap, color, tolerance);
            if ratio < min_ratio {
                log::debug!("background {color:?} covers {ratio:.3} of the image, keeping it");
                return bitmap.clone();
            }
            color
        }
    };
    log::debug!("removing background {background:?} (tolerance {tolerance})");
    clear_background(bitmap, background, tolerance)
}

#[cfg(test)]
mod tests {
    use imageproc::drawing::draw_filled_rect_mut;
    use imageproc::rect::Rect;

    use super::*;

    /// 40×40 white canvas with a red 10×10 square at (15, 15).
    fn framed_square() -> Bitmap {
        let mut img = image::RgbaImage::from_pixel(40, 40, image::Rgba([255, 255, 255, 255]));
        draw_filled_rect_mut(
            &mut img,
            Rect::at(15, 15).of_size(10, 10),
            image::Rgba([200, 0, 0, 255]),
        );
        Bitmap::from(img)
    }

    #[test]
    fn corner_flood_finds_white() {
        assert_eq!(detect_simple(&framed_square(), 10), Color::rgb(255, 255, 255));
    }

    #[test]
    fn auto_agrees_on_clean_background() {
        assert_eq!(detect_auto(&framed_square(), 10), Color::rgb(255, 255, 255));
    }

    #[test]
    fn scores_for_background() {
        let b = framed_square();
        let white = Color::rgb(255, 255, 255);
        assert!((edge_score(&b, white, 10) - 1.0).abs() < 1e-12);
        assert!((connectivity_score(&b, white, 10) - 1500.0 / 1600.0).abs() < 1e-12);
    }

    #[test]
    fn removal_clears_only_border_connected_pixels() {
        let mut b = framed_square();
        // A white pixel inside the red square is not border-connected.
        b.set_pixel(20, 20, Color::rgb(255, 255, 255));
        let out = remove_background(&b, BackgroundMethod::Auto, 10, 0.3);
        assert_eq!(out.pixel(0, 0).a, 0);
        assert_eq!(out.pixel(39, 39).a, 0);
        assert_eq!(out.pixel(16, 16), Color::rgb(200, 0, 0));
        assert_eq!(out.pixel(20, 20), Color::rgb(255, 255, 255));
        // Input is untouched.
        assert_eq!(b.pixel(0, 0).a, 255);
    }

    #[test]
    fn small_background_is_kept_in_auto_mode() {
        let b = framed_square();
        let out = remove_background(&b, BackgroundMethod::Auto, 10, 0.99);
        assert_eq!(out, b);
    }

    #[test]
    fn invalid_bitmap_is_noop() {
        let b = Bitmap::new(0, 0, vec![]);
        let out = remove_background(&b, BackgroundMethod::Simple, 10, 0.3);
        assert!(!out.is_valid());
    }

    #[test]
    fn single_pixel_image() {
        let b = Bitmap::from_fn(1, 1, |_, _| Color::rgb(9, 9, 9));
        let out = remove_background(&b, BackgroundMethod::Simple, 0, 0.3);
        assert_eq!(out.pixel(0, 0).a, 0);
    }
}
