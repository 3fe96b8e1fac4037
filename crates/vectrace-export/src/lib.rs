//! vectrace-export: SVG serialization of trace results (sans-IO).
//!
//! Converts a [`vectrace_pipeline::TraceResult`] into an SVG document.

pub mod svg;

pub use svg::{ExportError, SvgMetadata, to_svg, write_svg};
