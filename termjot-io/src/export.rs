use std::fmt::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{anyhow, Result};
use rayon::prelude::*;
use termjot_core::model::{BackgroundKind, Color, Element, LineStyle, Page};
use termjot_core::{Document, DocumentExporter, ExportFormat};
use tracing::{info, instrument};

use crate::write_atomically;

const LINE_SPACING: f64 = 24.0;
const GRID_SPACING: f64 = 14.17;
const RULE_COLOR: &str = "#b0c4de";

/// Produces SVG (one `<svg>` per page) or JSON snapshots on disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileExporter;

impl FileExporter {
    pub fn new() -> Self {
        Self
    }
}

impl DocumentExporter for FileExporter {
    #[instrument(skip(self, document, progress), fields(pages = document.page_count()))]
    fn export(
        &self,
        document: &Document,
        format: ExportFormat,
        target: &Path,
        progress: &(dyn Fn(usize, usize) + Sync),
    ) -> Result<()> {
        let total = document.page_count();
        let payload = match format {
            ExportFormat::Svg => {
                let done = AtomicUsize::new(0);
                let pages: Vec<String> = document
                    .pages()
                    .par_iter()
                    .map(|page| {
                        let svg = render_page_svg(page);
                        progress(done.fetch_add(1, Ordering::Relaxed) + 1, total);
                        svg
                    })
                    .collect();
                pages.concat().into_bytes()
            }
            ExportFormat::Json => {
                let bytes = serde_json::to_vec_pretty(document)
                    .map_err(|err| anyhow!("failed to encode document: {err}"))?;
                progress(total, total);
                bytes
            }
        };
        write_atomically(target, &payload)?;
        info!(target = %target.display(), ?format, "document exported");
        Ok(())
    }
}

fn hex(color: Color) -> String {
    format!("#{:06x}", color & 0xff_ffff)
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Renders one page as a standalone SVG fragment.
pub fn render_page_svg(page: &Page) -> String {
    let (width, height) = (page.width(), page.height());
    let mut svg = String::new();
    let _ = writeln!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{width}" height="{height}" viewBox="0 0 {width} {height}">"#
    );
    let background = page.background();
    let _ = writeln!(
        svg,
        r#"  <rect x="0" y="0" width="{width}" height="{height}" fill="{}"/>"#,
        hex(background.color)
    );
    match background.kind {
        BackgroundKind::Lined => {
            let mut y = LINE_SPACING * 3.0;
            while y < height {
                let _ = writeln!(
                    svg,
                    r#"  <line x1="0" y1="{y:.2}" x2="{width}" y2="{y:.2}" stroke="{RULE_COLOR}" stroke-width="0.5"/>"#
                );
                y += LINE_SPACING;
            }
        }
        BackgroundKind::Graph => {
            let mut x = GRID_SPACING;
            while x < width {
                let _ = writeln!(
                    svg,
                    r#"  <line x1="{x:.2}" y1="0" x2="{x:.2}" y2="{height}" stroke="{RULE_COLOR}" stroke-width="0.5"/>"#
                );
                x += GRID_SPACING;
            }
            let mut y = GRID_SPACING;
            while y < height {
                let _ = writeln!(
                    svg,
                    r#"  <line x1="0" y1="{y:.2}" x2="{width}" y2="{y:.2}" stroke="{RULE_COLOR}" stroke-width="0.5"/>"#
                );
                y += GRID_SPACING;
            }
        }
        BackgroundKind::Plain | BackgroundKind::Pdf { .. } => {}
    }

    for layer in page.layers() {
        svg.push_str("  <g>\n");
        for element in layer.elements() {
            render_element(&mut svg, element);
        }
        svg.push_str("  </g>\n");
    }
    svg.push_str("</svg>\n");
    svg
}

fn render_element(svg: &mut String, element: &Element) {
    match element {
        Element::Stroke(stroke) => {
            let points: Vec<String> = stroke
                .points
                .iter()
                .map(|p| format!("{:.2},{:.2}", p.x, p.y))
                .collect();
            let fill = match stroke.fill {
                Some(alpha) => format!(
                    r#"fill="{}" fill-opacity="{:.3}""#,
                    hex(stroke.color),
                    f64::from(alpha) / 255.0
                ),
                None => r#"fill="none""#.to_string(),
            };
            let dash = match stroke.line_style {
                LineStyle::Solid => "",
                LineStyle::Dashed => r#" stroke-dasharray="6 3""#,
                LineStyle::Dotted => r#" stroke-dasharray="1 3""#,
            };
            let _ = writeln!(
                svg,
                r#"    <polyline points="{}" {fill} stroke="{}" stroke-width="{}" stroke-linecap="round"{dash}/>"#,
                points.join(" "),
                hex(stroke.color),
                stroke.width
            );
        }
        Element::Text(text) => {
            let _ = writeln!(
                svg,
                r#"    <text x="{:.2}" y="{:.2}" font-family="{}" font-size="{}" fill="{}">{}</text>"#,
                text.position.x,
                text.position.y + text.font.size,
                escape(&text.font.family),
                text.font.size,
                hex(text.color),
                escape(&text.text)
            );
        }
        Element::Image(image) => {
            let _ = writeln!(
                svg,
                r##"    <rect x="{:.2}" y="{:.2}" width="{}" height="{}" fill="none" stroke="#999999"/>"##,
                image.position.x, image.position.y, image.width, image.height
            );
        }
        Element::TexImage(tex) => {
            let _ = writeln!(
                svg,
                r##"    <rect x="{:.2}" y="{:.2}" width="{}" height="{}" fill="none" stroke="#999999"><desc>{}</desc></rect>"##,
                tex.position.x,
                tex.position.y,
                tex.width,
                tex.height,
                escape(&tex.source)
            );
        }
    }
}
