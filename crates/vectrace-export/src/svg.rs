//! SVG export serializer.
//!
//! Converts a [`TraceResult`] into an SVG string using the [`svg`] crate
//! for document construction and XML escaping. Each [`Shape`] becomes
//! one `<path>` element, in the back-to-front order the pipeline chose.
//! Gradient fills reference a `<linearGradient>` in `<defs>` with
//! `gradientUnits="userSpaceOnUse"`.
//!
//! Optional [`SvgMetadata`] embeds `<title>`, `<desc>` and the pipeline
//! config for reproducibility.
//!
//! This is a pure function with no I/O -- it returns a `String`.

use std::collections::HashSet;
use std::fmt::Write as _;

use svg::Document;
use svg::node::element::{
    Definitions, Description, Element, LinearGradient as SvgLinearGradient, Path as SvgPath,
    Stop, Title,
};
use svg::node::{Node, Text};

use vectrace_pipeline::{
    Color, FillRule, LinearGradient, Paint, Path, PipelineConfig, Point, Segment, Shape,
    TraceResult,
};

/// Namespace of the embedded config element.
const CONFIG_NAMESPACE: &str = "urn:vectrace:config";

/// Errors from SVG serialization.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// A shape contains a NaN or infinite coordinate.
    #[error("shape {layer}/{path} has a non-finite coordinate")]
    NonFiniteCoordinate {
        /// Layer of the offending shape.
        layer: usize,
        /// Path index of the offending shape.
        path: usize,
    },

    /// Writing the document failed.
    #[error("failed to write SVG: {0}")]
    Io(#[from] std::io::Error),
}

/// Metadata to embed in the SVG document.
///
/// All fields are optional. Text values are XML-escaped by the `svg`
/// crate.
#[derive(Debug, Clone, Default)]
pub struct SvgMetadata<'a> {
    /// Document title, emitted as `<title>`.
    ///
    /// Typically the source image filename (without extension).
    pub title: Option<&'a str>,

    /// Document description, emitted as `<desc>`.
    pub description: Option<&'a str>,

    /// Serialized [`PipelineConfig`], emitted inside `<metadata>` in a
    /// namespaced `<vectrace:config>` element.
    pub config_json: Option<&'a str>,
}

/// Coordinate formatting: scale, then optional rounding.
#[derive(Debug, Clone, Copy)]
struct Format {
    scale: f64,
    /// Decimal places, or `None` to keep full precision.
    places: Option<i32>,
}

impl Format {
    fn from_config(config: &PipelineConfig) -> Self {
        Self {
            scale: config.scale,
            places: (config.round_coordinates >= 0).then_some(config.round_coordinates),
        }
    }

    fn number(self, value: f64) -> String {
        let v = value * self.scale;
        let v = self.places.map_or(v, |places| {
            let factor = 10f64.powi(places);
            (v * factor).round() / factor
        });
        // `-0.0 + 0.0` is `0.0`, so rounding never prints `-0`.
        format!("{}", v + 0.0)
    }

    fn point(self, p: Point) -> String {
        format!("{} {}", self.number(p.x), self.number(p.y))
    }
}

/// `#rrggbb` for a palette color.
#[must_use]
pub fn hex_color(color: Color) -> String {
    format!("#{:02x}{:02x}{:02x}", color.r, color.g, color.b)
}

/// Build an SVG path `d` attribute for one path.
///
/// Uses `M` for the start, `L` for straight segments, `Q` for quadratic
/// segments and `Z` for closed paths. Returns an empty string for a
/// path without segments.
///
/// # Examples
///
/// ```
/// use vectrace_pipeline::{Path, Point};
/// use vectrace_export::svg::path_data;
///
/// let path = Path::from_points(
///     &[Point::new(0.0, 0.0), Point::new(10.0, 0.0), Point::new(10.0, 5.5)],
///     true,
/// );
/// assert_eq!(path_data(&path, 1.0, Some(1)), "M 0 0 L 10 0 L 10 5.5 L 0 0 Z");
/// ```
#[must_use]
pub fn path_data(path: &Path, scale: f64, places: Option<i32>) -> String {
    write_path_data(path, Format { scale, places })
}

fn write_path_data(path: &Path, fmt: Format) -> String {
    let Some(first) = path.segments.first() else {
        return String::new();
    };
    let mut d = format!("M {}", fmt.point(first.start()));
    for segment in &path.segments {
        match *segment {
            Segment::Line { x1, y1, .. } => {
                let _ = write!(d, " L {}", fmt.point(Point::new(x1, y1)));
            }
            Segment::Quadratic { cx, cy, x1, y1, .. } => {
                let _ = write!(
                    d,
                    " Q {} {}",
                    fmt.point(Point::new(cx, cy)),
                    fmt.point(Point::new(x1, y1))
                );
            }
        }
    }
    if path.closed {
        d.push_str(" Z");
    }
    d
}

fn is_finite(path: &Path) -> bool {
    path.segments.iter().all(|s| {
        let mut points = vec![s.start(), s.end()];
        points.extend(s.control());
        points.iter().all(|p| p.x.is_finite() && p.y.is_finite())
    })
}

fn gradient_id(shape: &Shape) -> String {
    format!("lg_{}_{}", shape.layer, shape.path)
}

fn gradient_element(id: &str, gradient: &LinearGradient, fmt: Format) -> SvgLinearGradient {
    let stop = |offset: &str, color: Color| {
        let mut stop = Stop::new()
            .set("offset", offset)
            .set("stop-color", hex_color(color));
        if color.a < u8::MAX {
            stop = stop.set("stop-opacity", format!("{:.3}", f64::from(color.a) / 255.0));
        }
        stop
    };
    SvgLinearGradient::new()
        .set("id", id)
        .set("gradientUnits", "userSpaceOnUse")
        .set("x1", fmt.number(gradient.start.x))
        .set("y1", fmt.number(gradient.start.y))
        .set("x2", fmt.number(gradient.end.x))
        .set("y2", fmt.number(gradient.end.y))
        .add(stop("0", gradient.start_color))
        .add(stop("1", gradient.end_color))
}

/// The `<path>` element of a shape, plus a key identifying its
/// geometry and paint.
fn shape_element(shape: &Shape, fmt: Format, describe: bool) -> (SvgPath, String) {
    let d = shape
        .subpaths
        .iter()
        .map(|p| write_path_data(p, fmt))
        .filter(|d| !d.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    let mut attrs: Vec<(&str, String)> = Vec::new();
    match shape.paint {
        Paint::Solid { color } => {
            attrs.push(("fill", hex_color(color)));
            if let Some(width) = shape.stroke_width {
                attrs.push(("stroke", hex_color(color)));
                attrs.push(("stroke-width", fmt.number(width)));
            }
        }
        Paint::Gradient { .. } => attrs.push(("fill", format!("url(#{})", gradient_id(shape)))),
    }
    if shape.opacity < 1.0 {
        attrs.push(("opacity", format!("{:.3}", shape.opacity)));
    }
    if shape.fill_rule == FillRule::EvenOdd {
        attrs.push(("fill-rule", "evenodd".to_owned()));
    }

    let mut key = d.clone();
    for (name, value) in &attrs {
        let _ = write!(key, "|{name}={value}");
    }

    let mut element = SvgPath::new();
    if describe {
        element = element.set("desc", format!("l {} p {}", shape.layer, shape.path));
    }
    for (name, value) in attrs {
        element = element.set(name, value);
    }
    (element.set("d", d), key)
}

/// Serialize a trace result into an SVG document string.
///
/// Honors the output knobs of `config`: `scale` multiplies every
/// coordinate, `round_coordinates` sets the decimal places (negative
/// keeps full precision), `view_box` emits a `viewBox` instead of
/// `width`/`height`, `show_description` tags each path with its layer
/// and path index, and `optimize_svg` together with `remove_duplicates`
/// drops shapes whose geometry and paint repeat an earlier one.
///
/// # Errors
///
/// Returns [`ExportError::NonFiniteCoordinate`] if any shape contains a
/// NaN or infinite coordinate.
///
/// # Examples
///
/// ```
/// use vectrace_pipeline::{Bitmap, Color, PipelineConfig, process};
/// use vectrace_export::{SvgMetadata, to_svg};
///
/// let bitmap = Bitmap::from_fn(16, 16, |x, _| {
///     if x < 8 { Color::rgb(255, 0, 0) } else { Color::rgb(0, 0, 255) }
/// });
/// let config = PipelineConfig::default();
/// let (result, _) = process(&bitmap, &config).unwrap();
/// let metadata = SvgMetadata { title: Some("halves"), ..SvgMetadata::default() };
/// let svg = to_svg(&result, &config, &metadata).unwrap();
/// assert!(svg.contains("<title>halves</title>"));
/// assert!(svg.contains("fill=\"#ff0000\""));
/// ```
pub fn to_svg(
    result: &TraceResult,
    config: &PipelineConfig,
    metadata: &SvgMetadata<'_>,
) -> Result<String, ExportError> {
    let fmt = Format::from_config(config);
    let width = fmt.number(f64::from(result.dimensions.width));
    let height = fmt.number(f64::from(result.dimensions.height));

    let mut doc = Document::new().set("version", "1.1");
    doc = if config.view_box {
        doc.set("viewBox", format!("0 0 {width} {height}"))
    } else {
        doc.set("width", width).set("height", height)
    };

    if let Some(title) = metadata.title {
        doc = doc.add(Title::new(title));
    }
    if let Some(description) = metadata.description {
        doc = doc.add(Description::new().add(Text::new(description)));
    }
    if let Some(config_json) = metadata.config_json {
        let mut config_el = Element::new("vectrace:config");
        config_el.assign("xmlns:vectrace", CONFIG_NAMESPACE);
        config_el.append(Text::new(config_json));
        let mut metadata_el = Element::new("metadata");
        metadata_el.append(config_el);
        doc = doc.add(metadata_el);
    }

    for shape in &result.shapes {
        if !shape.subpaths.iter().all(is_finite) {
            return Err(ExportError::NonFiniteCoordinate {
                layer: shape.layer,
                path: shape.path,
            });
        }
    }

    let mut defs = Definitions::new();
    let mut has_defs = false;
    for shape in &result.shapes {
        if let Paint::Gradient { gradient } = &shape.paint {
            defs = defs.add(gradient_element(&gradient_id(shape), gradient, fmt));
            has_defs = true;
        }
    }
    if has_defs {
        doc = doc.add(defs);
    }

    let dedupe = config.optimize_svg && config.remove_duplicates;
    let mut seen = HashSet::new();
    let mut skipped = 0usize;
    for shape in &result.shapes {
        let (element, key) = shape_element(shape, fmt, config.show_description);
        if dedupe && !seen.insert(key) {
            skipped += 1;
            continue;
        }
        doc = doc.add(element);
    }
    if skipped > 0 {
        log::debug!("dropped {skipped} duplicate paths");
    }

    // The svg crate omits the XML declaration, so we prepend it.
    Ok(format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{doc}\n"))
}

/// [`to_svg`] into any writer.
///
/// # Errors
///
/// Returns the errors of [`to_svg`], and [`ExportError::Io`] if writing
/// fails.
pub fn write_svg(
    mut writer: impl std::io::Write,
    result: &TraceResult,
    config: &PipelineConfig,
    metadata: &SvgMetadata<'_>,
) -> Result<(), ExportError> {
    let svg = to_svg(result, config, metadata)?;
    writer.write_all(svg.as_bytes())?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use vectrace_pipeline::{Dimensions, IndexMap};

    use super::*;

    fn square(x: f64, y: f64, side: f64) -> Path {
        Path::from_points(
            &[
                Point::new(x, y),
                Point::new(x + side, y),
                Point::new(x + side, y + side),
                Point::new(x, y + side),
            ],
            true,
        )
    }

    fn solid(layer: usize, path: Path, color: Color) -> Shape {
        Shape {
            layer,
            path: 0,
            subpaths: vec![path],
            paint: Paint::Solid { color },
            fill_rule: FillRule::NonZero,
            opacity: f64::from(color.a) / 255.0,
            stroke_width: (color.a == u8::MAX).then_some(1.0),
            bbox_area: 0.0,
        }
    }

    fn result(shapes: Vec<Shape>) -> TraceResult {
        TraceResult {
            dimensions: Dimensions {
                width: 20,
                height: 10,
            },
            palette: Vec::new(),
            index_map: IndexMap::new(20, 10),
            layers: Vec::new(),
            shapes,
        }
    }

    fn no_meta() -> SvgMetadata<'static> {
        SvgMetadata::default()
    }

    #[test]
    fn path_data_lines_and_quadratics() {
        let a = Point::new(0.0, 0.0);
        let b = Point::new(4.0, 0.0);
        let c = Point::new(4.0, 4.0);
        let path = Path::new(
            vec![
                Segment::line(a, b),
                Segment::quadratic(b, Point::new(6.0, 2.0), c),
                Segment::line(c, a),
            ],
            true,
        );
        assert_eq!(
            path_data(&path, 1.0, None),
            "M 0 0 L 4 0 Q 6 2 4 4 L 0 0 Z"
        );
    }

    #[test]
    fn rounding_and_scale() {
        let path = Path::from_points(&[Point::new(0.126, 1.0), Point::new(2.0, 3.333)], false);
        assert_eq!(path_data(&path, 2.0, Some(1)), "M 0.3 2 L 4 6.7");
        assert_eq!(path_data(&path, 1.0, Some(0)), "M 0 1 L 2 3");
    }

    #[test]
    fn empty_result_is_a_valid_document() {
        let svg = to_svg(&result(Vec::new()), &PipelineConfig::default(), &no_meta()).unwrap();
        assert!(svg.starts_with("<?xml"));
        assert!(svg.contains("xmlns=\"http://www.w3.org/2000/svg\""));
        assert!(svg.contains("width=\"20\""));
        assert!(!svg.contains("<path"));
        // A childless root is written self-closing.
        let tail = svg.trim_end();
        assert!(tail.ends_with("/>") || tail.ends_with("</svg>"), "{svg}");
        assert_eq!(svg.matches("<svg").count(), 1);
    }

    #[test]
    fn view_box_replaces_size() {
        let config = PipelineConfig {
            view_box: true,
            scale: 2.0,
            ..PipelineConfig::default()
        };
        let svg = to_svg(&result(Vec::new()), &config, &no_meta()).unwrap();
        assert!(svg.contains("viewBox=\"0 0 40 20\""));
        assert!(!svg.contains("width="));
    }

    #[test]
    fn solid_shape_attributes() {
        let shapes = vec![
            solid(1, square(0.0, 0.0, 10.0), Color::rgb(255, 0, 0)),
            solid(2, square(2.0, 2.0, 4.0), Color::new(0, 0, 255, 128)),
        ];
        let svg = to_svg(&result(shapes), &PipelineConfig::default(), &no_meta()).unwrap();
        assert!(svg.contains("fill=\"#ff0000\""));
        assert!(svg.contains("stroke=\"#ff0000\""));
        assert!(svg.contains("desc=\"l 1 p 0\""));
        assert!(svg.contains("opacity=\"0.502\""));
        // The translucent shape carries no stroke.
        assert_eq!(svg.matches("stroke=").count(), 1);
    }

    #[test]
    fn descriptions_can_be_disabled() {
        let config = PipelineConfig {
            show_description: false,
            ..PipelineConfig::default()
        };
        let shapes = vec![solid(0, square(0.0, 0.0, 5.0), Color::rgb(1, 2, 3))];
        let svg = to_svg(&result(shapes), &config, &no_meta()).unwrap();
        assert!(!svg.contains("desc=\""));
    }

    #[test]
    fn even_odd_holes_share_one_element() {
        let mut shape = solid(0, square(0.0, 0.0, 10.0), Color::rgb(0, 0, 0));
        shape.subpaths.push(square(3.0, 3.0, 4.0).reversed());
        shape.fill_rule = FillRule::EvenOdd;
        let svg = to_svg(&result(vec![shape]), &PipelineConfig::default(), &no_meta()).unwrap();
        assert_eq!(svg.matches("<path").count(), 1);
        assert!(svg.contains("fill-rule=\"evenodd\""));
        assert_eq!(svg.matches(" Z").count(), 2);
    }

    #[test]
    fn gradient_fill_references_definition() {
        let gradient = LinearGradient {
            start: Point::new(0.0, 0.0),
            end: Point::new(10.0, 0.0),
            start_color: Color::rgb(255, 0, 0),
            end_color: Color::rgb(0, 0, 255),
        };
        let mut shape = solid(3, square(0.0, 0.0, 10.0), Color::rgb(128, 0, 128));
        shape.path = 7;
        shape.paint = Paint::Gradient { gradient };
        shape.stroke_width = None;
        let svg = to_svg(&result(vec![shape]), &PipelineConfig::default(), &no_meta()).unwrap();
        assert!(svg.contains("<defs>"));
        assert!(svg.contains("id=\"lg_3_7\""));
        assert!(svg.contains("gradientUnits=\"userSpaceOnUse\""));
        assert!(svg.contains("fill=\"url(#lg_3_7)\""));
        assert!(svg.contains("stop-color=\"#0000ff\""));
    }

    #[test]
    fn duplicates_are_removed_when_optimizing() {
        let shapes = vec![
            solid(0, square(0.0, 0.0, 5.0), Color::rgb(9, 9, 9)),
            solid(0, square(0.0, 0.0, 5.0), Color::rgb(9, 9, 9)),
        ];
        let svg = to_svg(&result(shapes.clone()), &PipelineConfig::default(), &no_meta()).unwrap();
        assert_eq!(svg.matches("<path").count(), 1);

        let config = PipelineConfig {
            optimize_svg: false,
            ..PipelineConfig::default()
        };
        let svg = to_svg(&result(shapes), &config, &no_meta()).unwrap();
        assert_eq!(svg.matches("<path").count(), 2);
    }

    #[test]
    fn non_finite_coordinates_are_rejected() {
        let path = Path::from_points(&[Point::new(0.0, 0.0), Point::new(f64::NAN, 1.0)], false);
        let err = to_svg(
            &result(vec![solid(4, path, Color::rgb(0, 0, 0))]),
            &PipelineConfig::default(),
            &no_meta(),
        );
        assert!(matches!(
            err,
            Err(ExportError::NonFiniteCoordinate { layer: 4, path: 0 })
        ));
    }

    #[test]
    fn metadata_elements_are_escaped() {
        let metadata = SvgMetadata {
            title: Some("a <b>"),
            description: Some("x & y"),
            config_json: Some("{\"scale\":1}"),
        };
        let svg = to_svg(&result(Vec::new()), &PipelineConfig::default(), &metadata).unwrap();
        assert!(svg.contains("<title>a &lt;b&gt;</title>"));
        assert!(svg.contains("x &amp; y"));
        assert!(svg.contains("<metadata>"));
        assert!(svg.contains("xmlns:vectrace=\"urn:vectrace:config\""));
    }

    #[test]
    fn write_svg_writes_the_document() {
        let mut out = Vec::new();
        write_svg(&mut out, &result(Vec::new()), &PipelineConfig::default(), &no_meta()).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("<svg"));
    }
}
