//! Projection of template fields and one data row into positioned nodes.
//!
//! The markup is backend neutral: the PDF renderer draws it directly and
//! [`PositionedMarkup::to_html`] serializes it for previews. Text is kept raw
//! here and escaped by whichever backend writes it out.

use std::fmt::Write as _;
use std::path::PathBuf;

use crate::model::{Alignment, BackgroundSource, ColumnMapping, Field, FieldKind, Rgb, Row, Template};
use crate::units::{PageSize, mm_to_px};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ImageRef {
    Embedded(String), // data URI or raw base64
    Url(String),
    File(PathBuf),
}

impl ImageRef {
    /// Interprets an image field value.
    pub fn classify(value: &str) -> ImageRef {
        let value = value.trim();
        if value.starts_with("data:") {
            ImageRef::Embedded(value.to_string())
        } else if value.starts_with("http://") || value.starts_with("https://") {
            ImageRef::Url(value.to_string())
        } else {
            ImageRef::File(PathBuf::from(value))
        }
    }

    pub fn from_background(background: &BackgroundSource) -> Option<ImageRef> {
        match background {
            BackgroundSource::None => None,
            BackgroundSource::EmbeddedImage(payload) => Some(ImageRef::Embedded(payload.clone())),
            BackgroundSource::RasterizedFile(path) => Some(ImageRef::File(path.clone())),
        }
    }

    fn html_src(&self) -> String {
        match self {
            ImageRef::Embedded(payload) if payload.starts_with("data:") => payload.clone(),
            ImageRef::Embedded(payload) => {
                format!("data:{};base64,{payload}", sniff_base64_mime(payload))
            }
            ImageRef::Url(url) => url.clone(),
            ImageRef::File(path) => path.display().to_string(),
        }
    }
}

fn sniff_base64_mime(payload: &str) -> &'static str {
    if payload.starts_with("iVBOR") {
        "image/png"
    } else if payload.starts_with("/9j/") {
        "image/jpeg"
    } else if payload.starts_with("R0lGOD") {
        "image/gif"
    } else if payload.starts_with("UklGR") {
        "image/webp"
    } else {
        "application/octet-stream"
    }
}

/// Field box in millimeters, top-left origin.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MmBox {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub min_height: f32,
}

impl MmBox {
    fn of(field: &Field) -> Self {
        MmBox {
            left: field.x,
            top: field.y,
            width: field.width,
            min_height: field.height,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TextNode {
    pub area: MmBox,
    pub text: String,
    pub font_size_pt: f32,
    pub align: Alignment,
    pub font_family: String,
    pub color: Rgb,
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImageNode {
    pub area: MmBox,
    pub source: ImageRef,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    /// Full-bleed image drawn beneath every field.
    Background(ImageRef),
    Text(TextNode),
    Image(ImageNode),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MarkupPage {
    pub nodes: Vec<Node>,
}

impl MarkupPage {
    pub fn field_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| !matches!(n, Node::Background(_)))
            .count()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PositionedMarkup {
    pub page: PageSize,
    pub pages: Vec<MarkupPage>,
}

/// The display value a field receives from a row, or "" when the column is
/// unmapped or the row lacks the mapped header.
pub fn resolve_value(field: &Field, row: &Row, mapping: &ColumnMapping) -> String {
    mapping
        .header_for(&field.column)
        .and_then(|header| row.get(header))
        .map(|cell| cell.display())
        .unwrap_or_default()
}

pub fn project_page(
    fields: &[Field],
    row: &Row,
    mapping: &ColumnMapping,
    background: Option<&ImageRef>,
) -> MarkupPage {
    let mut nodes = Vec::with_capacity(fields.len() + 1);
    if let Some(bg) = background {
        nodes.push(Node::Background(bg.clone()));
    }

    for field in fields {
        let value = resolve_value(field, row, mapping);
        if value.is_empty() {
            continue;
        }
        let area = MmBox::of(field);
        let node = match field.kind {
            FieldKind::Text => Node::Text(TextNode {
                area,
                text: value,
                font_size_pt: crate::units::font_size_pt(field.style.font_size_pt),
                align: field.style.align,
                font_family: field.style.font_family.clone(),
                color: field.style.color,
                bold: field.style.bold,
                italic: field.style.italic,
                underline: field.style.underline,
            }),
            FieldKind::Image => Node::Image(ImageNode {
                area,
                source: ImageRef::classify(&value),
            }),
        };
        nodes.push(node);
    }

    MarkupPage { nodes }
}

/// Projects every template page. The background is a picture of page 1, so
/// only the first page receives it.
pub fn project(
    template: &Template,
    row: &Row,
    mapping: &ColumnMapping,
    background: &BackgroundSource,
    page: PageSize,
) -> PositionedMarkup {
    let bg = ImageRef::from_background(background);
    let pages = template
        .pages
        .iter()
        .enumerate()
        .map(|(i, p)| project_page(&p.fields, row, mapping, if i == 0 { bg.as_ref() } else { None }))
        .collect();
    PositionedMarkup { page, pages }
}

pub fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#039;"),
            _ => out.push(c),
        }
    }
    out
}

const HTML_HEAD: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="UTF-8">
<style>
* { margin: 0; padding: 0; box-sizing: border-box; }
body { font-family: Arial, sans-serif; background: white; }
.page { position: relative; overflow: hidden; background: white; page-break-after: always; }
.page:last-child { page-break-after: auto; }
.pdf-background { position: absolute; top: 0; left: 0; width: 100%; height: 100%; z-index: 1; object-fit: contain; }
.field { position: absolute; z-index: 2; white-space: pre-wrap; word-wrap: break-word; overflow: visible; background: transparent; line-height: 1.2; }
</style>
</head>
<body>
"#;

impl PositionedMarkup {
    pub fn to_html(&self) -> String {
        let mut html = String::from(HTML_HEAD);
        for page in &self.pages {
            let _ = writeln!(
                html,
                r#"<div class="page" style="width: {:.2}px; height: {:.2}px;">"#,
                mm_to_px(self.page.width_mm),
                mm_to_px(self.page.height_mm)
            );
            for node in &page.nodes {
                write_node(&mut html, node);
            }
            html.push_str("</div>\n");
        }
        html.push_str("</body>\n</html>\n");
        html
    }
}

fn box_style(area: &MmBox) -> String {
    format!(
        "left: {}mm; top: {}mm; width: {}mm; min-height: {}mm;",
        area.left, area.top, area.width, area.min_height
    )
}

fn write_node(html: &mut String, node: &Node) {
    match node {
        Node::Background(src) => {
            let _ = writeln!(
                html,
                r#"<img class="pdf-background" src="{}" alt="PDF Background" />"#,
                html_escape(&src.html_src())
            );
        }
        Node::Text(t) => {
            let style = format!(
                "{} font-size: {}pt; text-align: {}; font-family: {}; color: {}; font-weight: {}; font-style: {}; text-decoration: {};",
                box_style(&t.area),
                t.font_size_pt,
                t.align.as_css(),
                t.font_family,
                t.color.to_hex(),
                if t.bold { "bold" } else { "normal" },
                if t.italic { "italic" } else { "normal" },
                if t.underline { "underline" } else { "none" },
            );
            let _ = writeln!(
                html,
                r#"<div class="field" style="{}">{}</div>"#,
                html_escape(&style),
                html_escape(&t.text)
            );
        }
        Node::Image(img) => {
            let _ = writeln!(
                html,
                r#"<img class="field" style="{} object-fit: contain;" src="{}" alt="" />"#,
                html_escape(&box_style(&img.area)),
                html_escape(&img.source.html_src())
            );
        }
    }
}
