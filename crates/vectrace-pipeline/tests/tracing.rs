//! Integration tests: synthetic images through the full tracing pipeline.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeMap;

use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut};
use imageproc::rect::Rect;
use vectrace_pipeline::geometry::{Detected, GeometryDetector};
use vectrace_pipeline::{
    Bitmap, Color, Paint, Pipeline, PipelineConfig, PipelineError, Point, StageMetrics, process,
};

const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Index of the palette entry closest to `target`.
fn layer_of(palette: &[Color], target: Color) -> usize {
    palette
        .iter()
        .enumerate()
        .min_by_key(|(_, c)| {
            let d = |a: u8, b: u8| i32::from(a).abs_diff(i32::from(b));
            d(c.r, target.r) + d(c.g, target.g) + d(c.b, target.b)
        })
        .map(|(k, _)| k)
        .unwrap()
}

/// Mean center and mean radius of a vertex ring.
fn ring_fit(points: &[Point]) -> (Point, f64) {
    #[allow(clippy::cast_precision_loss)]
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.y).sum::<f64>() / n;
    let r = points.iter().map(|p| (p.x - cx).hypot(p.y - cy)).sum::<f64>() / n;
    (Point::new(cx, cy), r)
}

#[test]
fn enclosed_background_island_is_a_nested_hole() {
    init_logging();
    let mut img = RgbaImage::from_pixel(64, 64, WHITE);
    draw_filled_rect_mut(&mut img, Rect::at(16, 16).of_size(32, 32), Rgba([0, 0, 0, 255]));
    draw_filled_rect_mut(&mut img, Rect::at(26, 26).of_size(12, 12), WHITE);

    let (result, _) = process(&Bitmap::from(img), &PipelineConfig::default()).unwrap();
    let white = layer_of(&result.palette, Color::rgb(255, 255, 255));
    let layer = &result.layers[white];
    assert_eq!(layer.paths.len(), 2, "canvas and island");

    let outer = layer.metadata.iter().position(|m| m.depth == 0).unwrap();
    let inner = layer.metadata.iter().position(|m| m.depth == 1).unwrap();
    assert!(layer.metadata[inner].is_hole);
    assert!(!layer.metadata[outer].is_hole);
    assert_eq!(layer.metadata[inner].parent, Some(outer));

    // The opaque island is painted on top of the black square, not cut.
    let island = result
        .shapes
        .iter()
        .find(|s| s.layer == white && s.path == inner)
        .expect("island shape");
    assert_eq!(island.subpaths.len(), 1);
    let island_at = result.shapes.iter().position(|s| std::ptr::eq(s, island)).unwrap();
    let black = layer_of(&result.palette, Color::rgb(0, 0, 0));
    let square_at = result.shapes.iter().position(|s| s.layer == black).unwrap();
    assert!(square_at < island_at, "larger shapes are drawn first");
}

#[test]
fn rasterized_circle_is_detected() {
    init_logging();
    let mut img = RgbaImage::from_pixel(256, 256, WHITE);
    draw_filled_circle_mut(&mut img, (128, 128), 30, Rgba([200, 30, 30, 255]));
    let config = PipelineConfig {
        detect_geometry: true,
        ..PipelineConfig::default()
    };

    // Fit directly on the simplified outlines.
    let simplified = Pipeline::new(Bitmap::from(img), config.clone())
        .prepare()
        .quantize()
        .unwrap()
        .scan()
        .simplify();
    let red = layer_of(simplified.palette(), Color::rgb(200, 30, 30));
    let detector = GeometryDetector::from_config(&config);
    let circle = simplified.simplified()[red]
        .iter()
        .find_map(|outline| match detector.detect(outline) {
            Some(Detected::Circle(circle, _)) => Some(circle),
            _ => None,
        })
        .expect("disc outline accepted as a circle");
    assert!((circle.radius - 30.0).abs() <= config.circle_tolerance);
    assert!((circle.center.x - 128.5).abs() <= config.circle_tolerance);
    assert!((circle.center.y - 128.5).abs() <= config.circle_tolerance);

    // And end to end: the traced path is replaced by circular arcs.
    let done = simplified.trace().annotate();
    let StageMetrics::Annotate { circles, .. } = done.diagnostics().annotate.metrics else {
        unreachable!("annotate stage reports annotate metrics");
    };
    assert!(circles >= 1);
    let replaced = done.layers()[red]
        .paths
        .iter()
        .map(|p| ring_fit(&p.vertices()))
        .find(|(_, r)| (r - 30.0).abs() <= config.circle_tolerance);
    let (center, _) = replaced.expect("circle path in the disc layer");
    assert!((center.x - 128.5).abs() <= config.circle_tolerance);
    assert!((center.y - 128.5).abs() <= config.circle_tolerance);
}

#[test]
fn adjacent_regions_share_identical_vertices() {
    init_logging();
    let mut img = RgbaImage::from_pixel(64, 32, Rgba([220, 40, 40, 255]));
    draw_filled_rect_mut(&mut img, Rect::at(32, 0).of_size(32, 32), Rgba([40, 40, 220, 255]));
    let config = PipelineConfig::default();
    let (result, diagnostics) = process(&Bitmap::from(img), &config).unwrap();

    let StageMetrics::Annotate { shared_points, .. } = diagnostics.annotate.metrics else {
        unreachable!("annotate stage reports annotate metrics");
    };
    assert!(shared_points > 0);

    // Bucket every vertex on the fine grid; a bucket touched by both
    // layers must hold one coordinate.
    let resolution = 8.0;
    let mut buckets: BTreeMap<(i64, i64), Vec<(usize, Point)>> = BTreeMap::new();
    for (k, layer) in result.layers.iter().enumerate() {
        for path in &layer.paths {
            for p in path.vertices() {
                #[allow(clippy::cast_possible_truncation)]
                let key = (
                    p.x.mul_add(resolution, 0.5).floor() as i64,
                    p.y.mul_add(resolution, 0.5).floor() as i64,
                );
                buckets.entry(key).or_default().push((k, p));
            }
        }
    }
    let mut checked = 0;
    for owners in buckets.values() {
        if owners.iter().all(|(k, _)| *k == owners[0].0) {
            continue;
        }
        checked += 1;
        let first = owners[0].1;
        assert!(
            owners.iter().all(|(_, p)| p.x.to_bits() == first.x.to_bits()
                && p.y.to_bits() == first.y.to_bits()),
            "shared vertex diverged: {owners:?}"
        );
    }
    assert!(checked > 0, "the two halves touch");
}

#[test]
fn horizontal_ramp_is_painted_as_gradient() {
    init_logging();
    let bitmap = Bitmap::from_fn(100, 40, |x, _| {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let t = (f64::from(x) / 99.0 * 255.0).round() as u8;
        Color::rgb(255 - t, 0, t)
    });
    let config = PipelineConfig {
        detect_gradients: true,
        ..PipelineConfig::default()
    };
    let (result, _) = process(&bitmap, &config).unwrap();
    assert!(!result.shapes.is_empty());

    // Quantization may still split the ramp; any gradient found must run
    // left to right from red to blue.
    for shape in &result.shapes {
        let Paint::Gradient { gradient } = shape.paint else {
            continue;
        };
        let (dx, dy) = (gradient.end.x - gradient.start.x, gradient.end.y - gradient.start.y);
        assert!(dx.abs() > dy.abs() * 4.0, "not horizontal: {gradient:?}");
        let (left, right) = if dx > 0.0 {
            (gradient.start_color, gradient.end_color)
        } else {
            (gradient.end_color, gradient.start_color)
        };
        assert!(left.r > right.r);
        assert!(left.b < right.b);
    }
}

#[test]
fn single_pixel_yields_at_most_one_shape() {
    let bitmap = Bitmap::from_fn(1, 1, |_, _| Color::rgb(10, 200, 10));
    let (result, _) = process(&bitmap, &PipelineConfig::default()).unwrap();
    assert!(result.shapes.len() <= 1);
}

#[test]
fn uniform_image_yields_at_most_one_shape() {
    let bitmap = Bitmap::from_fn(32, 32, |_, _| Color::rgb(90, 90, 90));
    let (result, _) = process(&bitmap, &PipelineConfig::default()).unwrap();
    assert!(result.shapes.len() <= 1);
    assert!(result.shapes.iter().all(|s| matches!(s.paint, Paint::Solid { .. })));
}

#[test]
fn fully_transparent_image_yields_no_shapes() {
    let bitmap = Bitmap::blank(16, 16);
    let (result, _) = process(&bitmap, &PipelineConfig::default()).unwrap();
    assert!(result.shapes.is_empty());
    assert!(result.palette.iter().all(|c| c.is_transparent()));
}

#[test]
fn zero_sized_image_is_rejected() {
    let bitmap = Bitmap::new(4, 0, Vec::new());
    assert!(matches!(
        process(&bitmap, &PipelineConfig::default()),
        Err(PipelineError::InvalidBitmap { .. })
    ));
}

#[test]
fn tracing_is_deterministic() {
    let mut img = RgbaImage::from_pixel(40, 40, WHITE);
    draw_filled_circle_mut(&mut img, (20, 20), 12, Rgba([30, 160, 90, 255]));
    draw_filled_rect_mut(&mut img, Rect::at(2, 2).of_size(10, 6), Rgba([240, 200, 0, 255]));
    let bitmap = Bitmap::from(img);
    let config = PipelineConfig::default();
    let (first, _) = process(&bitmap, &config).unwrap();
    let (second, _) = process(&bitmap, &config).unwrap();
    assert_eq!(first, second);
}
