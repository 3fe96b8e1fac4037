//! Edge-preserving selective blur.
//!
//! A separable Gaussian (radius 1–5) smooths the image, then every pixel
//! whose blurred value strays more than `delta` (summed absolute RGBA
//! difference) from the source is restored. Flat areas lose their noise
//! while hard edges stay crisp, which keeps the quantizer from
//! inventing fringe colors along boundaries.

use rayon::prelude::*;

use crate::bitmap::Bitmap;

const MAX_RADIUS: i64 = 5;
const MAX_DELTA: u32 = 1024;

/// Normalized Gaussian kernel of `2 · radius + 1` taps, `sigma = radius / 2`
/// (at least 0.5).
fn gaussian_kernel(radius: i64) -> Vec<f64> {
    #[allow(clippy::cast_precision_loss)]
    let sigma = (radius as f64 / 2.0).max(0.5);
    let mut kernel: Vec<f64> = (-radius..=radius)
        .map(|i| {
            #[allow(clippy::cast_precision_loss)]
            let i = i as f64;
            (-(i * i) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f64 = kernel.iter().sum();
    for v in &mut kernel {
        *v /= sum;
    }
    kernel
}

/// Convolve one axis. `sample(k)` reads the 4 channels at offset `k`
/// along the axis, or `None` outside the image; missing taps are dropped
/// and the remaining weights renormalized. The result is floored, with a
/// small bias so a flat run of `v` never comes out as `v - 1`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn convolve(kernel: &[f64], radius: i64, sample: impl Fn(i64) -> Option<[u8; 4]>) -> [u8; 4] {
    let mut acc = [0.0_f64; 4];
    let mut weight = 0.0;
    for k in -radius..=radius {
        let w = kernel[(k + radius) as usize];
        if let Some(px) = sample(k) {
            for (a, &v) in acc.iter_mut().zip(&px) {
                *a += f64::from(v) * w;
            }
            weight += w;
        }
    }
    acc.map(|a| (a / weight + 1e-9).floor().clamp(0.0, 255.0) as u8)
}

/// Apply the selective blur.
///
/// `radius` is floored; values below 1 return the input unchanged and
/// values above 5 are capped. `delta` is taken by magnitude and capped
/// at 1024. Invalid bitmaps are returned unchanged.
#[must_use = "returns the blurred bitmap"]
pub fn selective_blur(bitmap: &Bitmap, radius: f64, delta: f64) -> Bitmap {
    if !bitmap.is_valid() || !radius.is_finite() {
        return bitmap.clone();
    }
    #[allow(clippy::cast_possible_truncation)]
    let radius = radius.floor() as i64;
    if radius < 1 {
        return bitmap.clone();
    }
    let radius = radius.min(MAX_RADIUS);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let delta = (delta.abs().min(f64::from(MAX_DELTA))) as u32;

    let kernel = gaussian_kernel(radius);
    let w = bitmap.width() as usize;
    let h = bitmap.height() as usize;
    let src = bitmap.data();
    let stride = w * 4;
    let read = |data: &[u8], x: usize, y: usize| -> [u8; 4] {
        let i = y * stride + x * 4;
        [data[i], data[i + 1], data[i + 2], data[i + 3]]
    };

    let mut horizontal = vec![0_u8; src.len()];
    horizontal
        .par_chunks_mut(stride)
        .enumerate()
        .for_each(|(y, row)| {
            for x in 0..w {
                let px = convolve(&kernel, radius, |k| {
                    let sx = usize::try_from(x as i64 + k).ok().filter(|&sx| sx < w)?;
                    Some(read(src, sx, y))
                });
                row[x * 4..x * 4 + 4].copy_from_slice(&px);
            }
        });

    let mut out = vec![0_u8; src.len()];
    out.par_chunks_mut(stride).enumerate().for_each(|(y, row)| {
        for x in 0..w {
            let blurred = convolve(&kernel, radius, |k| {
                let sy = usize::try_from(y as i64 + k).ok().filter(|&sy| sy < h)?;
                Some(read(&horizontal, x, sy))
            });
            let original = read(src, x, y);
            let difference: u32 = blurred
                .iter()
                .zip(&original)
                .map(|(&a, &b)| u32::from(a.abs_diff(b)))
                .sum();
            let px = if difference > delta { original } else { blurred };
            row[x * 4..x * 4 + 4].copy_from_slice(&px);
        }
    });

    Bitmap::new(bitmap.width(), bitmap.height(), out)
}
