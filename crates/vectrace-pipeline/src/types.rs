//! Shared types for the vectrace tracing pipeline.

use serde::{Deserialize, Serialize};

use crate::progress::ProgressStage;

/// Re-export `RgbaImage` so downstream crates can hand decoded rasters
/// to [`crate::Bitmap`] without depending on `image` directly.
pub use image::RgbaImage;

/// A 2D point in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal position (pixels from left edge).
    pub x: f64,
    /// Vertical position (pixels from top edge).
    pub y: f64,
}

impl Point {
    /// Create a new point.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Squared Euclidean distance to another point.
    ///
    /// Avoids the square root for comparison purposes.
    #[must_use]
    pub fn distance_squared(self, other: Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx.mul_add(dx, dy * dy)
    }

    /// Euclidean distance to another point.
    #[must_use]
    pub fn distance(self, other: Self) -> f64 {
        self.distance_squared(other).sqrt()
    }

    /// Linear interpolation towards `other` (`t = 0` is `self`).
    #[must_use]
    pub fn lerp(self, other: Self, t: f64) -> Self {
        Self::new(
            t.mul_add(other.x - self.x, self.x),
            t.mul_add(other.y - self.y, self.y),
        )
    }

    /// Distance from this point to the segment `a`–`b`.
    ///
    /// A zero-length segment degrades to the distance to `a`.
    #[must_use]
    pub fn distance_to_segment(self, a: Self, b: Self) -> f64 {
        let dx = b.x - a.x;
        let dy = b.y - a.y;
        let len_sq = dx.mul_add(dx, dy * dy);
        if len_sq < f64::EPSILON {
            return self.distance(a);
        }
        let t = ((self.x - a.x).mul_add(dx, (self.y - a.y) * dy) / len_sq).clamp(0.0, 1.0);
        self.distance(Self::new(t.mul_add(dx, a.x), t.mul_add(dy, a.y)))
    }

    /// Perpendicular distance from this point to the infinite line
    /// through `a` and `b`.
    ///
    /// A zero-length chord degrades to the distance to `a`.
    #[must_use]
    pub fn distance_to_line(self, a: Self, b: Self) -> f64 {
        let dx = b.x - a.x;
        let dy = b.y - a.y;
        let len = dx.hypot(dy);
        if len < f64::EPSILON {
            return self.distance(a);
        }
        (dy * self.x - dx * self.y + b.x * a.y - b.y * a.x).abs() / len
    }
}

/// Shoelace signed area of an implicitly closed ring.
pub(crate) fn signed_ring_area(points: &[Point]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut sum = 0.0;
    for (i, a) in points.iter().enumerate() {
        let b = points[(i + 1) % points.len()];
        sum += a.x.mul_add(b.y, -(b.x * a.y));
    }
    sum / 2.0
}

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// Pixels with alpha below this value count as fully transparent.
pub const TRANSPARENT_ALPHA: u8 = 10;

/// Coarse alpha buckets used to keep translucent and opaque colors apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AlphaGroup {
    /// `a < 10`.
    Transparent,
    /// `10 <= a < 128`.
    Semi,
    /// `128 <= a < 250`.
    MostlyOpaque,
    /// `a >= 250`.
    Opaque,
}

impl AlphaGroup {
    /// Bucket an alpha value.
    #[must_use]
    pub const fn of(alpha: u8) -> Self {
        match alpha {
            0..10 => Self::Transparent,
            10..128 => Self::Semi,
            128..250 => Self::MostlyOpaque,
            _ => Self::Opaque,
        }
    }

    /// Bucket distance used by the perceptual color penalty.
    #[must_use]
    pub const fn distance(self, other: Self) -> u8 {
        (self as u8).abs_diff(other as u8)
    }
}

/// An RGBA8 color (palette entry or pixel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color {
    /// Red channel.
    pub r: u8,
    /// Green channel.
    pub g: u8,
    /// Blue channel.
    pub b: u8,
    /// Alpha channel.
    pub a: u8,
}

impl Color {
    /// Fully transparent black, the reserved palette entry 0.
    pub const TRANSPARENT: Self = Self::new(0, 0, 0, 0);

    /// Create a new color.
    #[must_use]
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Create an opaque color.
    #[must_use]
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self::new(r, g, b, 255)
    }

    /// Whether this color counts as fully transparent.
    #[must_use]
    pub const fn is_transparent(self) -> bool {
        self.a < TRANSPARENT_ALPHA
    }

    /// The alpha bucket of this color.
    #[must_use]
    pub const fn alpha_group(self) -> AlphaGroup {
        AlphaGroup::of(self.a)
    }

    /// Channels as an array in RGBA order.
    #[must_use]
    pub const fn channels(self) -> [u8; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

impl From<image::Rgba<u8>> for Color {
    fn from(px: image::Rgba<u8>) -> Self {
        let [r, g, b, a] = px.0;
        Self::new(r, g, b, a)
    }
}

impl From<Color> for image::Rgba<u8> {
    fn from(c: Color) -> Self {
        Self(c.channels())
    }
}

/// One primitive of a traced path.
///
/// Every stage after scanning (simplification, tracing, geometry
/// detection, edge unification, hierarchy, rendering) speaks this type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Segment {
    /// Straight line from `(x0, y0)` to `(x1, y1)`.
    Line {
        /// Start x.
        x0: f64,
        /// Start y.
        y0: f64,
        /// End x.
        x1: f64,
        /// End y.
        y1: f64,
    },
    /// Quadratic Bezier from `(x0, y0)` via control `(cx, cy)` to `(x1, y1)`.
    Quadratic {
        /// Start x.
        x0: f64,
        /// Start y.
        y0: f64,
        /// Control x.
        cx: f64,
        /// Control y.
        cy: f64,
        /// End x.
        x1: f64,
        /// End y.
        y1: f64,
    },
}

/// Which endpoint of a [`Segment`] a coordinate belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    /// The segment's start point.
    Start,
    /// The segment's end point.
    End,
}

impl Segment {
    /// A straight segment between two points.
    #[must_use]
    pub const fn line(from: Point, to: Point) -> Self {
        Self::Line {
            x0: from.x,
            y0: from.y,
            x1: to.x,
            y1: to.y,
        }
    }

    /// A quadratic segment between two points with one control point.
    #[must_use]
    pub const fn quadratic(from: Point, control: Point, to: Point) -> Self {
        Self::Quadratic {
            x0: from.x,
            y0: from.y,
            cx: control.x,
            cy: control.y,
            x1: to.x,
            y1: to.y,
        }
    }

    /// The segment's start point.
    #[must_use]
    pub const fn start(&self) -> Point {
        match *self {
            Self::Line { x0, y0, .. } | Self::Quadratic { x0, y0, .. } => Point::new(x0, y0),
        }
    }

    /// The segment's end point.
    #[must_use]
    pub const fn end(&self) -> Point {
        match *self {
            Self::Line { x1, y1, .. } | Self::Quadratic { x1, y1, .. } => Point::new(x1, y1),
        }
    }

    /// The control point, for quadratic segments.
    #[must_use]
    pub const fn control(&self) -> Option<Point> {
        match *self {
            Self::Line { .. } => None,
            Self::Quadratic { cx, cy, .. } => Some(Point::new(cx, cy)),
        }
    }

    /// Read one endpoint.
    #[must_use]
    pub const fn endpoint(&self, which: Endpoint) -> Point {
        match which {
            Endpoint::Start => self.start(),
            Endpoint::End => self.end(),
        }
    }

    /// Overwrite one endpoint, leaving any control point in place.
    pub fn set_endpoint(&mut self, which: Endpoint, p: Point) {
        match (self, which) {
            (Self::Line { x0, y0, .. } | Self::Quadratic { x0, y0, .. }, Endpoint::Start) => {
                *x0 = p.x;
                *y0 = p.y;
            }
            (Self::Line { x1, y1, .. } | Self::Quadratic { x1, y1, .. }, Endpoint::End) => {
                *x1 = p.x;
                *y1 = p.y;
            }
        }
    }

    /// The same primitive traversed in the opposite direction.
    #[must_use]
    pub const fn reversed(self) -> Self {
        match self {
            Self::Line { x0, y0, x1, y1 } => Self::Line {
                x0: x1,
                y0: y1,
                x1: x0,
                y1: y0,
            },
            Self::Quadratic {
                x0,
                y0,
                cx,
                cy,
                x1,
                y1,
            } => Self::Quadratic {
                x0: x1,
                y0: y1,
                cx,
                cy,
                x1: x0,
                y1: y0,
            },
        }
    }

    /// Evaluate the segment at parameter `t` in `[0, 1]`.
    #[must_use]
    pub fn point_at(&self, t: f64) -> Point {
        match *self {
            Self::Line { .. } => self.start().lerp(self.end(), t),
            Self::Quadratic {
                x0,
                y0,
                cx,
                cy,
                x1,
                y1,
            } => {
                let mt = 1.0 - t;
                let a = mt * mt;
                let b = 2.0 * mt * t;
                let c = t * t;
                Point::new(
                    a.mul_add(x0, b.mul_add(cx, c * x1)),
                    a.mul_add(y0, b.mul_add(cy, c * y1)),
                )
            }
        }
    }
}

/// An ordered sequence of segments.
///
/// For closed paths the last segment ends where the first one starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Path {
    /// The segments in traversal order.
    pub segments: Vec<Segment>,
    /// Whether the path is a closed ring.
    pub closed: bool,
}

impl Path {
    /// Create a path from segments.
    #[must_use]
    pub const fn new(segments: Vec<Segment>, closed: bool) -> Self {
        Self { segments, closed }
    }

    /// Build a path of straight segments through `points`.
    ///
    /// Closed paths get a final segment back to the first point.
    #[must_use]
    pub fn from_points(points: &[Point], closed: bool) -> Self {
        let mut segments: Vec<Segment> = points
            .windows(2)
            .map(|w| Segment::line(w[0], w[1]))
            .collect();
        if closed
            && points.len() > 2
            && let (Some(&first), Some(&last)) = (points.first(), points.last())
            && first != last
        {
            segments.push(Segment::line(last, first));
        }
        Self::new(segments, closed)
    }

    /// Returns `true` if the path has no segments.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Segment start points, plus the final end point for open paths.
    #[must_use]
    pub fn vertices(&self) -> Vec<Point> {
        let mut out: Vec<Point> = self.segments.iter().map(Segment::start).collect();
        if !self.closed
            && let Some(last) = self.segments.last()
        {
            out.push(last.end());
        }
        out
    }

    /// Approximate the outline with points, sampling each quadratic
    /// segment `steps` times.
    ///
    /// The first point is not repeated at the end.
    #[must_use]
    pub fn flatten(&self, steps: usize) -> Vec<Point> {
        let steps = steps.max(1);
        let mut out = Vec::with_capacity(self.segments.len() * steps + 1);
        if let Some(first) = self.segments.first() {
            out.push(first.start());
        }
        for seg in &self.segments {
            match seg {
                Segment::Line { .. } => out.push(seg.end()),
                Segment::Quadratic { .. } => {
                    for k in 1..=steps {
                        #[allow(clippy::cast_precision_loss)]
                        let t = k as f64 / steps as f64;
                        out.push(seg.point_at(t));
                    }
                }
            }
        }
        if self.closed && out.len() > 1 && out.first() == out.last() {
            out.pop();
        }
        out
    }

    /// Axis-aligned bounds over every endpoint and control point.
    #[must_use]
    pub fn bounds(&self) -> Option<Bounds> {
        let mut points = Vec::with_capacity(self.segments.len() * 3);
        for seg in &self.segments {
            points.push(seg.start());
            points.push(seg.end());
            if let Some(c) = seg.control() {
                points.push(c);
            }
        }
        Bounds::of(&points)
    }

    /// Shoelace signed area over the segment start points.
    ///
    /// Positive when the path runs clockwise on screen.
    #[must_use]
    pub fn signed_area(&self) -> f64 {
        let starts: Vec<Point> = self.segments.iter().map(Segment::start).collect();
        signed_ring_area(&starts)
    }

    /// The same path traversed in the opposite direction.
    #[must_use]
    pub fn reversed(&self) -> Self {
        Self::new(
            self.segments.iter().rev().map(|s| s.reversed()).collect(),
            self.closed,
        )
    }

    /// Number of distinct vertices (endpoints compared exactly).
    #[must_use]
    pub fn unique_vertex_count(&self) -> usize {
        let mut seen: Vec<Point> = Vec::with_capacity(self.segments.len() + 1);
        for p in self
            .segments
            .iter()
            .flat_map(|s| [s.start(), s.end()])
        {
            if !seen.contains(&p) {
                seen.push(p);
            }
        }
        seen.len()
    }
}

/// Axis-aligned bounding rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    /// Minimum x.
    pub min_x: f64,
    /// Minimum y.
    pub min_y: f64,
    /// Maximum x.
    pub max_x: f64,
    /// Maximum y.
    pub max_y: f64,
}

impl Bounds {
    /// Bounds of a point set, or `None` when it is empty.
    #[must_use]
    pub fn of(points: &[Point]) -> Option<Self> {
        let first = points.first()?;
        let mut b = Self {
            min_x: first.x,
            min_y: first.y,
            max_x: first.x,
            max_y: first.y,
        };
        for p in &points[1..] {
            b.min_x = b.min_x.min(p.x);
            b.min_y = b.min_y.min(p.y);
            b.max_x = b.max_x.max(p.x);
            b.max_y = b.max_y.max(p.y);
        }
        Some(b)
    }

    /// Width of the box.
    #[must_use]
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    /// Height of the box.
    #[must_use]
    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// `width * height`.
    #[must_use]
    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    /// Whether `inner` lies within this box, allowing `slack` on every side.
    #[must_use]
    pub fn contains(&self, inner: &Self, slack: f64) -> bool {
        inner.min_x >= self.min_x - slack
            && inner.min_y >= self.min_y - slack
            && inner.max_x <= self.max_x + slack
            && inner.max_y <= self.max_y + slack
    }
}

/// Nesting facts for one path, computed by [`crate::hierarchy`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PathMetadata {
    /// Index (within the same layer) of the smallest enclosing path.
    pub parent: Option<usize>,
    /// Length of the parent chain.
    pub depth: usize,
    /// Odd nesting depth.
    pub is_hole: bool,
    /// Winding after normalization (fills clockwise, holes counter-clockwise).
    pub clockwise: bool,
    /// Bounding-box area used for ordering and parent selection.
    pub area: f64,
}

impl Default for PathMetadata {
    fn default() -> Self {
        Self {
            parent: None,
            depth: 0,
            is_hole: false,
            clockwise: true,
            area: 0.0,
        }
    }
}

/// A two-stop linear gradient in image coordinates.
///
/// A path without a detected gradient carries `None` instead.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearGradient {
    /// Position of the first stop.
    pub start: Point,
    /// Position of the second stop.
    pub end: Point,
    /// Color at `start`.
    pub start_color: Color,
    /// Color at `end`.
    pub end_color: Color,
}

/// All traced paths of one palette entry.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Layer {
    /// Traced paths.
    pub paths: Vec<Path>,
    /// Nesting metadata, parallel to `paths`.
    pub metadata: Vec<PathMetadata>,
    /// Detected gradients, parallel to `paths`.
    pub gradients: Vec<Option<LinearGradient>>,
}

impl Layer {
    /// A layer with default metadata and no gradients.
    #[must_use]
    pub fn from_paths(paths: Vec<Path>) -> Self {
        let n = paths.len();
        Self {
            paths,
            metadata: vec![PathMetadata::default(); n],
            gradients: vec![None; n],
        }
    }
}

/// Per-pixel palette indices with a one-cell `-1` border.
///
/// Cells are addressed in padded coordinates: pixel `(x, y)` lives at
/// `(x + 1, y + 1)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMap {
    width: u32,
    height: u32,
    cells: Vec<i32>,
}

/// Index map value for "no region".
pub const NO_REGION: i32 = -1;

impl IndexMap {
    /// An index map of `width × height` pixels, all [`NO_REGION`].
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        let cells = vec![NO_REGION; (width as usize + 2) * (height as usize + 2)];
        Self {
            width,
            height,
            cells,
        }
    }

    /// Image width (without the border).
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Image height (without the border).
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Padded width, `width + 2`.
    #[must_use]
    pub const fn padded_width(&self) -> usize {
        self.width as usize + 2
    }

    /// Padded height, `height + 2`.
    #[must_use]
    pub const fn padded_height(&self) -> usize {
        self.height as usize + 2
    }

    /// Value at padded coordinates; anything outside reads as [`NO_REGION`].
    #[must_use]
    pub fn cell(&self, px: usize, py: usize) -> i32 {
        if px >= self.padded_width() || py >= self.padded_height() {
            return NO_REGION;
        }
        self.cells[py * self.padded_width() + px]
    }

    /// Palette index of pixel `(x, y)`.
    #[must_use]
    pub fn at_pixel(&self, x: u32, y: u32) -> i32 {
        self.cell(x as usize + 1, y as usize + 1)
    }

    /// Assign pixel `(x, y)`; out-of-range pixels are ignored.
    pub fn set_pixel(&mut self, x: u32, y: u32, value: i32) {
        if x < self.width && y < self.height {
            let pw = self.padded_width();
            self.cells[(y as usize + 1) * pw + x as usize + 1] = value;
        }
    }

    /// Raw padded cells in row-major order.
    #[must_use]
    pub fn cells(&self) -> &[i32] {
        &self.cells
    }

    /// Interior rows (without border cells), for parallel fills.
    pub(crate) fn interior_rows_mut(&mut self) -> impl Iterator<Item = &mut [i32]> {
        let pw = self.padded_width();
        let w = self.width as usize;
        let h = self.height as usize;
        self.cells
            .chunks_mut(pw)
            .skip(1)
            .take(h)
            .map(move |row| &mut row[1..=w])
    }

    /// Rewrite every non-negative cell through `table`.
    ///
    /// Values outside the table are left untouched.
    pub fn remap(&mut self, table: &[i32]) {
        for cell in &mut self.cells {
            if let Ok(idx) = usize::try_from(*cell)
                && let Some(&to) = table.get(idx)
            {
                *cell = to;
            }
        }
    }

    /// Largest index present, or `None` if every cell is [`NO_REGION`].
    #[must_use]
    pub fn max_index(&self) -> Option<i32> {
        self.cells.iter().copied().filter(|&v| v >= 0).max()
    }
}

/// How a shape is painted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Paint {
    /// Flat palette color.
    Solid {
        /// The fill color.
        color: Color,
    },
    /// Linear gradient fill.
    Gradient {
        /// The gradient.
        gradient: LinearGradient,
    },
}

/// Fill rule for multi-ring shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillRule {
    /// Single ring, or rings that should all paint.
    NonZero,
    /// Inner rings cut holes.
    EvenOdd,
}

/// One renderable shape, produced by [`crate::shapes`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shape {
    /// Palette layer the outer ring came from.
    pub layer: usize,
    /// Path index of the outer ring within its layer.
    pub path: usize,
    /// Outer ring first, then any merged holes.
    pub subpaths: Vec<Path>,
    /// Fill paint.
    pub paint: Paint,
    /// How overlapping rings combine.
    pub fill_rule: FillRule,
    /// Fill opacity in `[0, 1]`.
    pub opacity: f64,
    /// Stroke width for opaque fills (same color as the fill).
    pub stroke_width: Option<f64>,
    /// Bounding-box area of the outer ring, the sort key.
    pub bbox_area: f64,
}

/// Everything the pipeline produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceResult {
    /// Source image dimensions.
    pub dimensions: Dimensions,
    /// Final palette; index 0 is transparent when the source had transparency.
    pub palette: Vec<Color>,
    /// Per-pixel palette indices.
    pub index_map: IndexMap,
    /// One layer per palette entry.
    pub layers: Vec<Layer>,
    /// Render-ready shapes in back-to-front order.
    pub shapes: Vec<Shape>,
}

/// Errors that can occur during pipeline processing.
///
/// Uses custom `Serialize`/`Deserialize` because `image::ImageError`
/// does not implement serde traits. The `ImageDecode` variant is
/// serialized as its `Display` string.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Failed to decode the input image.
    #[error("failed to decode image: {0}")]
    ImageDecode(#[from] image::ImageError),

    /// The input image bytes were empty.
    #[error("input image data is empty")]
    EmptyInput,

    /// The bitmap's dimensions or buffer length are inconsistent.
    #[error("invalid bitmap: {width}x{height} with {len} bytes")]
    InvalidBitmap {
        /// Declared width.
        width: u32,
        /// Declared height.
        height: u32,
        /// Actual buffer length.
        len: usize,
    },

    /// Pipeline configuration is invalid.
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    /// Palette construction yielded no colors.
    #[error("color quantization produced an empty palette")]
    EmptyPalette,

    /// The progress callback requested cancellation.
    #[error("cancelled during {0}")]
    Cancelled(ProgressStage),
}

/// Serde-compatible proxy for `PipelineError`.
///
/// `image::ImageError` does not implement serde, so the `ImageDecode`
/// variant stores its `Display` string instead.
#[derive(Serialize, Deserialize)]
enum PipelineErrorProxy {
    ImageDecode(String),
    EmptyInput,
    InvalidBitmap { width: u32, height: u32, len: usize },
    InvalidConfig(String),
    EmptyPalette,
    Cancelled(ProgressStage),
}

impl Serialize for PipelineError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let proxy = match self {
            Self::ImageDecode(e) => PipelineErrorProxy::ImageDecode(e.to_string()),
            Self::EmptyInput => PipelineErrorProxy::EmptyInput,
            Self::InvalidBitmap { width, height, len } => PipelineErrorProxy::InvalidBitmap {
                width: *width,
                height: *height,
                len: *len,
            },
            Self::InvalidConfig(s) => PipelineErrorProxy::InvalidConfig(s.clone()),
            Self::EmptyPalette => PipelineErrorProxy::EmptyPalette,
            Self::Cancelled(stage) => PipelineErrorProxy::Cancelled(*stage),
        };
        proxy.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PipelineError {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let proxy = PipelineErrorProxy::deserialize(deserializer)?;
        Ok(match proxy {
            // The typed image error cannot be rebuilt; keep the message.
            PipelineErrorProxy::ImageDecode(msg) => {
                Self::InvalidConfig(format!("image decode error: {msg}"))
            }
            PipelineErrorProxy::EmptyInput => Self::EmptyInput,
            PipelineErrorProxy::InvalidBitmap { width, height, len } => {
                Self::InvalidBitmap { width, height, len }
            }
            PipelineErrorProxy::InvalidConfig(s) => Self::InvalidConfig(s),
            PipelineErrorProxy::EmptyPalette => Self::EmptyPalette,
            PipelineErrorProxy::Cancelled(stage) => Self::Cancelled(stage),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // --- Point tests ---

    #[test]
    fn point_distance() {
        let a = Point::new(0.0, 0.0);
        let b = Point::new(3.0, 4.0);
        assert!((a.distance_squared(b) - 25.0).abs() < f64::EPSILON);
        assert!((a.distance(b) - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn point_distance_to_segment_clamps_to_endpoints() {
        let p = Point::new(-3.0, 4.0);
        let d = p.distance_to_segment(Point::new(0.0, 0.0), Point::new(10.0, 0.0));
        assert!((d - 5.0).abs() < 1e-12);
    }

    #[test]
    fn point_distance_to_line_is_perpendicular() {
        let p = Point::new(-3.0, 4.0);
        let d = p.distance_to_line(Point::new(0.0, 0.0), Point::new(10.0, 0.0));
        assert!((d - 4.0).abs() < 1e-12);
    }

    #[test]
    fn zero_length_chord_falls_back_to_point_distance() {
        let p = Point::new(3.0, 4.0);
        let a = Point::new(0.0, 0.0);
        assert!((p.distance_to_line(a, a) - 5.0).abs() < 1e-12);
        assert!((p.distance_to_segment(a, a) - 5.0).abs() < 1e-12);
    }

    // --- Color tests ---

    #[test]
    fn alpha_groups() {
        assert_eq!(AlphaGroup::of(0), AlphaGroup::Transparent);
        assert_eq!(AlphaGroup::of(9), AlphaGroup::Transparent);
        assert_eq!(AlphaGroup::of(10), AlphaGroup::Semi);
        assert_eq!(AlphaGroup::of(127), AlphaGroup::Semi);
        assert_eq!(AlphaGroup::of(128), AlphaGroup::MostlyOpaque);
        assert_eq!(AlphaGroup::of(249), AlphaGroup::MostlyOpaque);
        assert_eq!(AlphaGroup::of(250), AlphaGroup::Opaque);
        assert_eq!(AlphaGroup::Transparent.distance(AlphaGroup::Opaque), 3);
    }

    #[test]
    fn color_transparency_threshold() {
        assert!(Color::TRANSPARENT.is_transparent());
        assert!(Color::new(255, 255, 255, 9).is_transparent());
        assert!(!Color::new(0, 0, 0, 10).is_transparent());
    }

    // --- Segment tests ---

    #[test]
    fn quadratic_midpoint() {
        let q = Segment::quadratic(
            Point::new(0.0, 0.0),
            Point::new(1.0, 2.0),
            Point::new(2.0, 0.0),
        );
        let m = q.point_at(0.5);
        assert!((m.x - 1.0).abs() < 1e-12);
        assert!((m.y - 1.0).abs() < 1e-12);
    }

    #[test]
    fn set_endpoint_keeps_control() {
        let mut q = Segment::quadratic(
            Point::new(0.0, 0.0),
            Point::new(1.0, 2.0),
            Point::new(2.0, 0.0),
        );
        q.set_endpoint(Endpoint::End, Point::new(5.0, 5.0));
        assert_eq!(q.end(), Point::new(5.0, 5.0));
        assert_eq!(q.control(), Some(Point::new(1.0, 2.0)));
        assert_eq!(q.start(), Point::new(0.0, 0.0));
    }

    #[test]
    fn reversed_swaps_endpoints() {
        let s = Segment::line(Point::new(1.0, 2.0), Point::new(3.0, 4.0)).reversed();
        assert_eq!(s.start(), Point::new(3.0, 4.0));
        assert_eq!(s.end(), Point::new(1.0, 2.0));
    }

    // --- Path tests ---

    fn unit_square() -> Vec<Point> {
        vec![
            Point::new(0.0, 0.0),
            Point::new(1.0, 0.0),
            Point::new(1.0, 1.0),
            Point::new(0.0, 1.0),
        ]
    }

    #[test]
    fn closed_path_from_points_adds_closing_segment() {
        let path = Path::from_points(&unit_square(), true);
        assert_eq!(path.segments.len(), 4);
        assert_eq!(path.segments[3].end(), Point::new(0.0, 0.0));
        assert_eq!(path.vertices().len(), 4);
    }

    #[test]
    fn open_path_vertices_include_last_end() {
        let path = Path::from_points(&unit_square(), false);
        assert_eq!(path.segments.len(), 3);
        assert_eq!(path.vertices().len(), 4);
    }

    #[test]
    fn screen_clockwise_square_has_positive_area() {
        // (0,0) -> (1,0) -> (1,1) -> (0,1) turns clockwise with y pointing down.
        let path = Path::from_points(&unit_square(), true);
        assert!((path.signed_area() - 1.0).abs() < 1e-12);
        assert!((path.reversed().signed_area() + 1.0).abs() < 1e-12);
    }

    #[test]
    fn path_bounds_include_control_points() {
        let path = Path::new(
            vec![Segment::quadratic(
                Point::new(0.0, 0.0),
                Point::new(5.0, 10.0),
                Point::new(10.0, 0.0),
            )],
            false,
        );
        let b = path.bounds().unwrap();
        assert!((b.max_y - 10.0).abs() < f64::EPSILON);
        assert!((b.area() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn flatten_does_not_repeat_start_of_closed_path() {
        let path = Path::from_points(&unit_square(), true);
        assert_eq!(path.flatten(4).len(), 4);
    }

    #[test]
    fn unique_vertex_count_ignores_repeats() {
        let path = Path::from_points(&unit_square(), true);
        assert_eq!(path.unique_vertex_count(), 4);
    }

    // --- IndexMap tests ---

    #[test]
    fn index_map_border_reads_no_region() {
        let mut map = IndexMap::new(3, 2);
        map.set_pixel(0, 0, 4);
        assert_eq!(map.at_pixel(0, 0), 4);
        assert_eq!(map.cell(1, 1), 4);
        assert_eq!(map.cell(0, 0), NO_REGION);
        assert_eq!(map.cell(4, 3), NO_REGION);
        assert_eq!(map.cell(100, 100), NO_REGION);
        assert_eq!(map.cells().len(), 5 * 4);
    }

    #[test]
    fn index_map_remap_leaves_border() {
        let mut map = IndexMap::new(2, 2);
        for y in 0..2 {
            for x in 0..2 {
                map.set_pixel(x, y, 1);
            }
        }
        map.remap(&[0, 0]);
        assert_eq!(map.max_index(), Some(0));
        assert_eq!(map.cell(0, 0), NO_REGION);
    }

    #[test]
    fn interior_rows_skip_border() {
        let mut map = IndexMap::new(3, 2);
        for row in map.interior_rows_mut() {
            row.fill(7);
        }
        assert_eq!(map.at_pixel(2, 1), 7);
        assert_eq!(map.cell(0, 1), NO_REGION);
        assert_eq!(map.cell(4, 1), NO_REGION);
        assert_eq!(map.cell(1, 0), NO_REGION);
    }

    // --- Error serde ---

    #[test]
    fn pipeline_error_roundtrips_through_json() {
        let err = PipelineError::InvalidBitmap {
            width: 0,
            height: 4,
            len: 0,
        };
        let json = serde_json::to_string(&err).unwrap();
        let back: PipelineError = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            back,
            PipelineError::InvalidBitmap {
                width: 0,
                height: 4,
                len: 0
            }
        ));
    }
}
