//! Palette construction and per-pixel color assignment.
//!
//! The palette starts from an [`Octree`](crate::octree::Octree) over the
//! non-transparent pixels and is refined by a few k-means style cycles.
//! Assignment maps every pixel to its perceptually nearest entry. Large
//! palettes then have near-duplicate entries merged, and mid-sized ones
//! get an edge-aware majority filter over the index map.

use std::collections::BTreeMap;

use image::{GrayImage, Luma};
use imageproc::definitions::Image;
use imageproc::filter::filter_clamped;
use imageproc::kernel;
use rayon::prelude::*;

use crate::bitmap::Bitmap;
use crate::color::{MAX_DISTANCE, adaptive_threshold, luma_601, merge_distance, perceptual_distance};
use crate::config::PipelineConfig;
use crate::octree;
use crate::types::{Color, IndexMap, NO_REGION, PipelineError};

/// Palettes larger than this get near-duplicate entries merged.
const MERGE_MIN_PALETTE: usize = 16;

/// Palettes at or below this size are never merged.
const MERGE_FLOOR: usize = 12;

/// Base perceptual distance under which palette entries merge.
const MERGE_BASE_THRESHOLD: f64 = 18.0;

/// Palette size range that gets the spatial coherence filter.
const COHERENCE_PALETTE: std::ops::RangeInclusive<usize> = 12..=24;

/// A palette together with the index map it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quantized {
    /// Palette; entry 0 is transparent when the source had transparency.
    pub palette: Vec<Color>,
    /// Per-pixel indices into `palette`.
    pub index_map: IndexMap,
}

/// Index of the perceptually nearest non-transparent entry at or after
/// `first`, or `None` when there is none.
fn nearest_entry(color: Color, palette: &[Color], first: usize) -> Option<usize> {
    let mut best = None;
    let mut best_distance = MAX_DISTANCE;
    for (k, entry) in palette.iter().enumerate().skip(first) {
        if entry.is_transparent() {
            continue;
        }
        let d = perceptual_distance(color, *entry);
        if d < best_distance {
            best_distance = d;
            best = Some(k);
        }
    }
    best
}

/// Whether the palette reserves entry 0 for transparency.
fn has_transparent_entry(palette: &[Color]) -> bool {
    palette.first().is_some_and(|c| c.is_transparent())
}

/// Build the initial palette for `bitmap`.
///
/// When any pixel is transparent, entry 0 is [`Color::TRANSPARENT`] and
/// the octree only sees the remaining pixels. The octree palette is then
/// refined for up to `cycles` passes.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidBitmap`] for an invalid bitmap and
/// [`PipelineError::EmptyPalette`] if nothing could be built.
pub fn create_palette(
    bitmap: &Bitmap,
    max_colors: usize,
    cycles: usize,
) -> Result<Vec<Color>, PipelineError> {
    bitmap.check()?;
    let opaque = bitmap
        .data()
        .chunks_exact(4)
        .map(|px| Color::new(px[0], px[1], px[2], px[3]))
        .filter(|c| !c.is_transparent());

    let mut palette = Vec::with_capacity(max_colors + 1);
    if bitmap.has_transparency() {
        palette.push(Color::TRANSPARENT);
    }
    let first = palette.len();
    palette.extend(
        octree::build_palette(opaque, max_colors)
            .into_iter()
            .filter(|c| !c.is_transparent()),
    );
    if palette.is_empty() {
        log::warn!("octree produced no colors");
        return Err(PipelineError::EmptyPalette);
    }

    refine_palette(bitmap, &mut palette, first, cycles);
    log::debug!("palette: {} entries ({} from the octree)", palette.len(), palette.len() - first);
    Ok(palette)
}

/// Per-entry channel sums and member count.
type Sums = Vec<[u64; 5]>;

fn add_sums(mut a: Sums, b: Sums) -> Sums {
    for (x, y) in a.iter_mut().zip(b) {
        for (s, v) in x.iter_mut().zip(y) {
            *s += v;
        }
    }
    a
}

/// Move every entry from `first` on to the mean of the pixels nearest to
/// it. Stops early once a pass changes nothing.
fn refine_palette(bitmap: &Bitmap, palette: &mut [Color], first: usize, cycles: usize) {
    let stride = bitmap.width() as usize * 4;
    for cycle in 0..cycles {
        let current: &[Color] = palette;
        let n = current.len();
        let sums = bitmap
            .data()
            .par_chunks(stride)
            .fold(
                || vec![[0_u64; 5]; n],
                |mut acc, row| {
                    for px in row.chunks_exact(4) {
                        let c = Color::new(px[0], px[1], px[2], px[3]);
                        if c.is_transparent() {
                            continue;
                        }
                        if let Some(k) = nearest_entry(c, current, first) {
                            for (s, v) in acc[k].iter_mut().zip(c.channels()) {
                                *s += u64::from(v);
                            }
                            acc[k][4] += 1;
                        }
                    }
                    acc
                },
            )
            .reduce(|| vec![[0_u64; 5]; n], add_sums);

        let mut changed = false;
        for (entry, sum) in palette.iter_mut().zip(&sums).skip(first) {
            let count = sum[4];
            if count == 0 {
                continue;
            }
            #[allow(clippy::cast_possible_truncation)]
            let mean = |i: usize| ((sum[i] + count / 2) / count).min(255) as u8;
            let next = Color::new(mean(0), mean(1), mean(2), mean(3));
            if next != *entry {
                *entry = next;
                changed = true;
            }
        }
        if !changed {
            log::debug!("palette converged after {cycle} refinement cycles");
            break;
        }
    }
}

/// Assign every pixel to its nearest palette entry.
///
/// Transparent pixels map to entry 0 when the palette reserves it, and to
/// [`NO_REGION`] otherwise. An invalid bitmap yields an all-`NO_REGION`
/// map.
#[must_use = "returns the index map"]
pub fn assign(bitmap: &Bitmap, palette: &[Color]) -> IndexMap {
    let mut map = IndexMap::new(bitmap.width(), bitmap.height());
    if !bitmap.is_valid() {
        return map;
    }
    let reserved = has_transparent_entry(palette);
    let fallback = if reserved { 0 } else { NO_REGION };
    let first = usize::from(reserved);

    let rows: Vec<&mut [i32]> = map.interior_rows_mut().collect();
    rows.into_par_iter().enumerate().for_each(|(y, row)| {
        for (x, cell) in row.iter_mut().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let c = bitmap.pixel(x as u32, y as u32);
            *cell = if c.is_transparent() {
                fallback
            } else {
                nearest_entry(c, palette, first)
                    .and_then(|k| i32::try_from(k).ok())
                    .unwrap_or(fallback)
            };
        }
    });
    map
}

/// Merge palette entries closer than `threshold` (scaled by palette
/// size) and compact the palette, remapping `index_map` to match.
///
/// Palettes of [`MERGE_FLOOR`] entries or fewer are left alone. A
/// transparent entry 0 is never merged and keeps its index.
#[must_use = "returns the compacted palette"]
pub fn merge_similar_colors(
    palette: &[Color],
    index_map: &mut IndexMap,
    threshold: f64,
) -> Vec<Color> {
    let n = palette.len();
    if n <= MERGE_FLOOR {
        return palette.to_vec();
    }
    let reserved = has_transparent_entry(palette);
    let threshold = adaptive_threshold(n, threshold);

    let mut merged = vec![false; n];
    let mut target: Vec<usize> = (0..n).collect();
    if reserved {
        merged[0] = true;
    }
    for i in usize::from(reserved)..n {
        if merged[i] || palette[i].is_transparent() {
            continue;
        }
        for j in i + 1..n {
            if merged[j] || palette[j].is_transparent() {
                continue;
            }
            if merge_distance(palette[i], palette[j]) < threshold {
                merged[j] = true;
                target[j] = i;
            }
        }
    }
    for i in 0..n {
        let mut t = i;
        while target[t] != t {
            t = target[t];
        }
        target[i] = t;
    }

    let kept = |i: usize| !merged[i] || (reserved && i == 0);
    let mut compact = vec![NO_REGION; n];
    let mut out = Vec::with_capacity(n);
    for i in (0..n).filter(|&i| kept(i)) {
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let idx = out.len() as i32;
        compact[i] = idx;
        out.push(palette[i]);
    }
    for i in (0..n).filter(|&i| !kept(i)) {
        compact[i] = compact[target[i]];
    }
    index_map.remap(&compact);
    if out.len() < n {
        log::debug!("merged palette from {n} to {} entries", out.len());
    }
    out
}

/// Sobel gradient magnitude of the Rec. 601 luma at every pixel.
fn edge_strength(bitmap: &Bitmap) -> Vec<f64> {
    let gray = GrayImage::from_fn(bitmap.width(), bitmap.height(), |x, y| {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let l = luma_601(bitmap.pixel(x, y)).round() as u8;
        Luma([l])
    });
    let gx: Image<Luma<i16>> = filter_clamped(&gray, kernel::SOBEL_HORIZONTAL_3X3);
    let gy: Image<Luma<i16>> = filter_clamped(&gray, kernel::SOBEL_VERTICAL_3X3);
    gx.pixels()
        .zip(gy.pixels())
        .map(|(h, v)| f64::from(h.0[0]).hypot(f64::from(v.0[0])))
        .collect()
}

/// Edge-aware majority filter over the index map.
///
/// Each pass re-votes every pixel from its `(2r+1)²` window unless it
/// sits on a color boundary with a noticeable image edge, or on a strong
/// image edge. The vote needs a consensus ratio that relaxes on flat
/// areas and tightens with palette size.
pub fn spatial_coherence(index_map: &mut IndexMap, bitmap: &Bitmap, radius: usize, passes: usize) {
    if radius < 1 || passes < 1 || !bitmap.is_valid() {
        return;
    }
    let w = index_map.width() as usize;
    let h = index_map.height() as usize;
    let palette_size = index_map.max_index().map_or(0, |m| m + 1);
    let strength = edge_strength(bitmap);
    let at = |map: &IndexMap, x: usize, y: usize| map.cell(x + 1, y + 1);

    let mut boundary = vec![false; w * h];
    for y in 0..h {
        for x in 0..w {
            let center = at(index_map, x, y);
            boundary[y * w + x] = (y.saturating_sub(1)..=(y + 1).min(h - 1)).any(|ny| {
                (x.saturating_sub(1)..=(x + 1).min(w - 1))
                    .any(|nx| (nx, ny) != (x, y) && at(index_map, nx, ny) != center)
            });
        }
    }

    let edge_threshold = match palette_size {
        ..=8 => 15.0,
        9..=16 => 18.0,
        _ => 20.0,
    };
    let mut actual_passes = passes;
    if palette_size > 32 {
        actual_passes += 1;
    }
    if palette_size > 48 {
        actual_passes += 1;
    }

    let mut changed = 0_usize;
    for _ in 0..actual_passes {
        let source = index_map.clone();
        for y in 0..h {
            for x in 0..w {
                let center = at(&source, x, y);
                let edge = strength[y * w + x];
                if center < 0
                    || (boundary[y * w + x] && edge > edge_threshold * 0.5)
                    || edge > edge_threshold
                {
                    continue;
                }

                let mut votes: BTreeMap<i32, usize> = BTreeMap::new();
                let mut total = 0;
                for ny in y.saturating_sub(radius)..=(y + radius).min(h - 1) {
                    for nx in x.saturating_sub(radius)..=(x + radius).min(w - 1) {
                        let idx = at(&source, nx, ny);
                        if idx >= 0 {
                            *votes.entry(idx).or_default() += 1;
                            total += 1;
                        }
                    }
                }
                let mut best = (center, 0);
                for (&idx, &count) in &votes {
                    if count > best.1 {
                        best = (idx, count);
                    }
                }

                let mut required = if edge < edge_threshold * 0.3 {
                    0.50
                } else if edge < edge_threshold * 0.6 {
                    0.55
                } else {
                    0.65
                };
                if palette_size > 32 {
                    required = 0.60;
                }
                #[allow(clippy::cast_precision_loss)]
                let ratio = best.1 as f64 / total.max(1) as f64;
                if ratio >= required && best.0 != center {
                    #[allow(clippy::cast_possible_truncation)]
                    let (px, py) = (x as u32, y as u32);
                    index_map.set_pixel(px, py, best.0);
                    changed += 1;
                }
            }
        }
    }
    log::debug!("spatial coherence changed {changed} pixels");
}

/// Assign pixels and run the palette-size dependent cleanups.
#[must_use = "returns the quantized image"]
pub fn quantize(bitmap: &Bitmap, palette: &[Color], config: &PipelineConfig) -> Quantized {
    let original_size = palette.len();
    let mut index_map = assign(bitmap, palette);
    let mut palette = palette.to_vec();

    if original_size > MERGE_MIN_PALETTE {
        let threshold = adaptive_threshold(original_size, MERGE_BASE_THRESHOLD).trunc();
        palette = merge_similar_colors(&palette, &mut index_map, threshold);
    }
    if config.spatial_coherence && COHERENCE_PALETTE.contains(&original_size) {
        spatial_coherence(
            &mut index_map,
            bitmap,
            config.spatial_coherence_radius,
            config.spatial_coherence_passes,
        );
    }
    Quantized { palette, index_map }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use imageproc::drawing::draw_filled_rect_mut;
    use imageproc::rect::Rect;
    use proptest::prelude::*;

    use super::*;

    fn two_tone() -> Bitmap {
        let mut img = image::RgbaImage::from_pixel(20, 10, image::Rgba([250, 250, 250, 255]));
        draw_filled_rect_mut(&mut img, Rect::at(10, 0).of_size(10, 10), image::Rgba([10, 20, 200, 255]));
        Bitmap::from(img)
    }

    fn assert_index_map_in_range(q: &Quantized) {
        let map = &q.index_map;
        let pw = map.padded_width();
        let ph = map.padded_height();
        for py in 0..ph {
            for px in 0..pw {
                let v = map.cell(px, py);
                if px == 0 || py == 0 || px == pw - 1 || py == ph - 1 {
                    assert_eq!(v, NO_REGION, "border cell ({px}, {py})");
                } else {
                    assert!(v == NO_REGION || (v >= 0 && (v as usize) < q.palette.len()));
                }
            }
        }
    }

    #[test]
    fn two_tone_image_gets_two_entries() {
        let b = two_tone();
        let palette = create_palette(&b, 8, 10).unwrap();
        assert_eq!(palette.len(), 2);
        assert!(palette.contains(&Color::rgb(250, 250, 250)));
        assert!(palette.contains(&Color::rgb(10, 20, 200)));
    }

    #[test]
    fn transparency_reserves_entry_zero() {
        let mut b = two_tone();
        b.set_pixel(0, 0, Color::new(1, 2, 3, 0));
        let palette = create_palette(&b, 8, 10).unwrap();
        assert_eq!(palette[0], Color::TRANSPARENT);
        let q = quantize(&b, &palette, &PipelineConfig::default());
        assert_eq!(q.index_map.at_pixel(0, 0), 0);
        assert_ne!(q.index_map.at_pixel(1, 0), 0);
        assert_index_map_in_range(&q);
    }

    #[test]
    fn fully_transparent_image_is_one_transparent_entry() {
        let b = Bitmap::blank(4, 4);
        let palette = create_palette(&b, 8, 10).unwrap();
        assert_eq!(palette, vec![Color::TRANSPARENT]);
        let q = quantize(&b, &palette, &PipelineConfig::default());
        assert!((0..4).all(|y| (0..4).all(|x| q.index_map.at_pixel(x, y) == 0)));
    }

    #[test]
    fn transparent_pixel_without_reserved_entry_is_no_region() {
        let b = Bitmap::from_fn(2, 1, |x, _| {
            if x == 0 {
                Color::TRANSPARENT
            } else {
                Color::rgb(9, 9, 9)
            }
        });
        let map = assign(&b, &[Color::rgb(9, 9, 9)]);
        assert_eq!(map.at_pixel(0, 0), NO_REGION);
        assert_eq!(map.at_pixel(1, 0), 0);
    }

    #[test]
    fn refinement_moves_entries_to_member_means() {
        // Two clusters; the initial entries sit off-center.
        let b = Bitmap::from_fn(4, 1, |x, _| match x {
            0 => Color::rgb(10, 10, 10),
            1 => Color::rgb(20, 20, 20),
            2 => Color::rgb(200, 200, 200),
            _ => Color::rgb(210, 210, 210),
        });
        let mut palette = vec![Color::rgb(0, 0, 0), Color::rgb(255, 255, 255)];
        refine_palette(&b, &mut palette, 0, 5);
        assert_eq!(palette[0], Color::rgb(15, 15, 15));
        assert_eq!(palette[1], Color::rgb(205, 205, 205));
    }

    #[test]
    fn merging_collapses_near_duplicates() {
        // 14 entries: 7 pairs of nearly identical greys.
        let mut palette = Vec::new();
        for i in 0..7_u8 {
            let v = 20 + i * 33;
            palette.push(Color::rgb(v, v, v));
            palette.push(Color::rgb(v, v + 1, v));
        }
        let b = Bitmap::from_fn(14, 1, |x, _| palette[x as usize]);
        let mut map = assign(&b, &palette);
        let merged = merge_similar_colors(&palette, &mut map, 18.0);
        assert_eq!(merged.len(), 7);
        for x in 0..14_u32 {
            assert_eq!(map.at_pixel(x, 0), (x / 2) as i32);
        }
    }

    #[test]
    fn merging_keeps_transparent_entry_at_zero() {
        let mut palette = vec![Color::TRANSPARENT];
        for i in 0..13_u8 {
            palette.push(Color::rgb(i * 19, 0, 0));
        }
        palette.push(Color::rgb(20, 0, 0));
        let mut map = IndexMap::new(2, 1);
        map.set_pixel(0, 0, 14);
        map.set_pixel(1, 0, 0);
        let merged = merge_similar_colors(&palette, &mut map, 18.0);
        assert_eq!(merged.len(), 14);
        assert_eq!(merged[0], Color::TRANSPARENT);
        // Entry 14 merged into entry 2, (19, 0, 0).
        assert_eq!(map.at_pixel(0, 0), 2);
        assert_eq!(map.at_pixel(1, 0), 0);
    }

    #[test]
    fn small_palettes_are_not_merged() {
        let palette = vec![Color::rgb(0, 0, 0), Color::rgb(1, 0, 0)];
        let mut map = IndexMap::new(1, 1);
        map.set_pixel(0, 0, 1);
        assert_eq!(merge_similar_colors(&palette, &mut map, 100.0), palette);
        assert_eq!(map.at_pixel(0, 0), 1);
    }

    #[test]
    fn coherence_removes_isolated_speckle() {
        let b = Bitmap::from_fn(9, 9, |_, _| Color::rgb(100, 100, 100));
        let mut map = IndexMap::new(9, 9);
        for y in 0..9 {
            for x in 0..9 {
                map.set_pixel(x, y, 3);
            }
        }
        map.set_pixel(4, 4, 7);
        spatial_coherence(&mut map, &b, 1, 1);
        assert_eq!(map.at_pixel(4, 4), 3);
    }

    #[test]
    fn coherence_applies_from_twelve_colors() {
        let grey = |i: u8| Color::rgb(i * 20, i * 20, i * 20);
        let palette: Vec<Color> = (0..12).map(grey).collect();
        let b = Bitmap::from_fn(9, 9, |x, y| if (x, y) == (4, 4) { grey(7) } else { grey(5) });
        let config = PipelineConfig::default();

        let q = quantize(&b, &palette, &config);
        assert_eq!(q.index_map.at_pixel(4, 4), 5);

        let q = quantize(&b, &palette[..11], &config);
        assert_eq!(q.index_map.at_pixel(4, 4), 7);
    }

    #[test]
    fn coherence_respects_strong_edges() {
        // A hard luma edge between columns 3 and 4 blocks re-voting there.
        let b = Bitmap::from_fn(8, 8, |x, _| {
            if x < 4 {
                Color::rgb(0, 0, 0)
            } else {
                Color::rgb(255, 255, 255)
            }
        });
        let mut map = IndexMap::new(8, 8);
        for y in 0..8 {
            for x in 0..8 {
                map.set_pixel(x, y, i32::from(x >= 4));
            }
        }
        let before = map.clone();
        spatial_coherence(&mut map, &b, 1, 2);
        assert_eq!(map, before);
    }

    proptest! {
        #[test]
        fn index_map_stays_in_range(
            w in 1_u32..12,
            h in 1_u32..12,
            seed in any::<u64>(),
            colors in 1_usize..24,
        ) {
            let b = Bitmap::from_fn(w, h, |x, y| {
                let v = seed
                    .wrapping_mul(6_364_136_223_846_793_005)
                    .wrapping_add(u64::from(x * 31 + y * 17));
                let bytes = v.to_le_bytes();
                Color::new(bytes[1], bytes[3], bytes[5], if bytes[7] < 40 { 0 } else { 255 })
            });
            let config = PipelineConfig { number_of_colors: colors, ..PipelineConfig::default() };
            let palette = create_palette(&b, colors, 3).unwrap();
            let q = quantize(&b, &palette, &config);
            assert_index_map_in_range(&q);
        }
    }
}
