//! PDF output for positioned markup.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Instant;

use pdf_writer::{Content, Filter, Name, Pdf, Rect, Ref, Str};

use crate::error::Error;
use crate::fonts::{FontEntry, font_key, register_font};
use crate::images::{self, PreparedImage};
use crate::markup::{ImageRef, MmBox, Node, PositionedMarkup, TextNode};
use crate::model::Alignment;
use crate::units::{PageSize, mm_to_pt};

const LINE_HEIGHT: f32 = 1.2;

#[derive(Clone, Debug)]
pub struct RenderConfig {
    pub page: PageSize,
    /// Raster images are downsampled to at most this resolution in their box.
    pub image_dpi: u32,
    pub remote_images: bool,
    /// Directory image fields may read local files from. Without one, file
    /// paths coming from row data are refused.
    pub image_root: Option<PathBuf>,
    pub system_fonts: bool,
    pub compress: bool,
    /// Used when a field has no font family.
    pub default_font: String,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            page: PageSize::A4,
            image_dpi: 200,
            remote_images: true,
            image_root: None,
            system_fonts: true,
            compress: true,
            default_font: "Arial".to_string(),
        }
    }
}

type ImageKey = (ImageRef, (u32, u32));

/// Writes positioned markup as PDF. Decoded images are kept until
/// [`Renderer::clear_image_cache`], so a batch decodes its background once.
pub struct Renderer {
    config: RenderConfig,
    images: RefCell<HashMap<ImageKey, Rc<PreparedImage>>>,
}

/// Objects shared by every page of one document.
struct DocState {
    fonts: HashMap<String, FontEntry>,
    font_order: Vec<String>,
    xobjects: Vec<(String, Ref)>,
    xobject_names: HashMap<ImageKey, String>,
}

/// A rectangle in PDF user space, bottom-left origin.
#[derive(Clone, Copy)]
struct PtBox {
    x: f32,
    y: f32,
    w: f32,
    h: f32,
}

impl PtBox {
    fn from_mm(area: &MmBox, page_h: f32) -> Self {
        let h = mm_to_pt(area.min_height);
        PtBox {
            x: mm_to_pt(area.left),
            y: page_h - mm_to_pt(area.top) - h,
            w: mm_to_pt(area.width),
            h,
        }
    }

    fn top(&self) -> f32 {
        self.y + self.h
    }
}

impl Renderer {
    pub fn new(config: RenderConfig) -> Self {
        Self {
            config,
            images: RefCell::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub fn render(
        &self,
        markup: &PositionedMarkup,
        page_width_mm: f32,
        page_height_mm: f32,
    ) -> Result<Vec<u8>, Error> {
        if !(page_width_mm.is_finite() && page_height_mm.is_finite())
            || page_width_mm <= 0.0
            || page_height_mm <= 0.0
        {
            return Err(Error::Render(format!(
                "invalid page size {page_width_mm}x{page_height_mm}mm"
            )));
        }
        let t0 = Instant::now();
        let (page_w, page_h) = (mm_to_pt(page_width_mm), mm_to_pt(page_height_mm));

        let mut pdf = Pdf::new();
        let mut next_id = 1i32;
        let mut alloc = || {
            let r = Ref::new(next_id);
            next_id += 1;
            r
        };
        let catalog_id = alloc();
        let pages_id = alloc();

        let mut doc = DocState {
            fonts: HashMap::new(),
            font_order: Vec::new(),
            xobjects: Vec::new(),
            xobject_names: HashMap::new(),
        };

        let mut contents: Vec<Content> = Vec::with_capacity(markup.pages.len().max(1));
        for page in &markup.pages {
            let mut content = Content::new();
            for node in &page.nodes {
                match node {
                    Node::Background(source) => {
                        let full = PtBox { x: 0.0, y: 0.0, w: page_w, h: page_h };
                        let name = self
                            .place_image(&mut pdf, &mut alloc, &mut doc, source, full)
                            .map_err(|e| Error::Render(format!("background image: {e}")))?;
                        self.draw_image(&mut content, &name, source, full);
                    }
                    Node::Image(img) => {
                        let area = PtBox::from_mm(&img.area, page_h);
                        if area.w <= 0.0 || area.h <= 0.0 {
                            continue;
                        }
                        let placed = self.confine(&img.source).and_then(|source| {
                            let name = self.place_image(&mut pdf, &mut alloc, &mut doc, &source, area)?;
                            Ok((name, source))
                        });
                        match placed {
                            Ok((name, source)) => self.draw_image(&mut content, &name, &source, area),
                            Err(e) => log::warn!("Skipping image field: {e}"),
                        }
                    }
                    Node::Text(text) => {
                        self.draw_text(&mut alloc, &mut doc, &mut content, text, page_h);
                    }
                }
            }
            contents.push(content);
        }
        if contents.is_empty() {
            contents.push(Content::new());
        }

        for key in &doc.font_order {
            if let Some(font) = doc.fonts.get(key) {
                font.write(&mut pdf, &mut alloc);
            }
        }

        let n = contents.len();
        let page_ids: Vec<Ref> = (0..n).map(|_| alloc()).collect();
        let content_ids: Vec<Ref> = (0..n).map(|_| alloc()).collect();

        for (i, c) in contents.into_iter().enumerate() {
            let raw = c.finish();
            if self.config.compress {
                let compressed = miniz_oxide::deflate::compress_to_vec_zlib(raw.as_slice(), 6);
                pdf.stream(content_ids[i], &compressed).filter(Filter::FlateDecode);
            } else {
                pdf.stream(content_ids[i], &raw);
            }
        }

        pdf.catalog(catalog_id).pages(pages_id);
        pdf.pages(pages_id)
            .kids(page_ids.iter().copied())
            .count(n as i32);

        let font_pairs: Vec<(&str, Ref)> = doc
            .font_order
            .iter()
            .filter_map(|key| doc.fonts.get(key))
            .map(|entry| (entry.pdf_name.as_str(), entry.font_ref))
            .collect();

        for i in 0..n {
            let mut page = pdf.page(page_ids[i]);
            page.media_box(Rect::new(0.0, 0.0, page_w, page_h))
                .parent(pages_id)
                .contents(content_ids[i]);
            let mut resources = page.resources();
            if !font_pairs.is_empty() {
                let mut fonts = resources.fonts();
                for (name, font_ref) in &font_pairs {
                    fonts.pair(Name(name.as_bytes()), *font_ref);
                }
            }
            if !doc.xobjects.is_empty() {
                let mut xobjects = resources.x_objects();
                for (name, xobj_ref) in &doc.xobjects {
                    xobjects.pair(Name(name.as_bytes()), *xobj_ref);
                }
            }
        }

        log::debug!(
            "Rendered {n} page(s), {} font(s), {} image(s) in {:.1}ms",
            doc.font_order.len(),
            doc.xobjects.len(),
            t0.elapsed().as_secs_f64() * 1000.0
        );
        Ok(pdf.finish())
    }

    /// Drops decoded images. Files may change between batches.
    pub fn clear_image_cache(&self) {
        self.images.borrow_mut().clear();
    }

    /// Image fields come from row data: local paths must resolve inside
    /// `image_root`.
    fn confine(&self, source: &ImageRef) -> Result<ImageRef, Error> {
        let ImageRef::File(path) = source else {
            return Ok(source.clone());
        };
        let Some(root) = &self.config.image_root else {
            return Err(Error::Image(format!(
                "local image {} refused, no image root configured",
                path.display()
            )));
        };
        let root = root
            .canonicalize()
            .map_err(|e| Error::Image(format!("image root {}: {e}", root.display())))?;
        let resolved = root
            .join(path)
            .canonicalize()
            .map_err(|e| Error::Image(format!("{}: {e}", path.display())))?;
        if !resolved.starts_with(&root) {
            return Err(Error::Image(format!(
                "{} is outside the image root",
                path.display()
            )));
        }
        Ok(ImageRef::File(resolved))
    }

    fn load_image(&self, source: &ImageRef, bounds: (u32, u32)) -> Result<Rc<PreparedImage>, Error> {
        let key = (source.clone(), bounds);
        if let Some(img) = self.images.borrow().get(&key) {
            return Ok(Rc::clone(img));
        }
        let bytes = images::load_bytes(source, self.config.remote_images)?;
        let img = Rc::new(images::prepare(&bytes, bounds)?);
        self.images.borrow_mut().insert(key, Rc::clone(&img));
        Ok(img)
    }

    /// Embeds the image once per document and returns its resource name.
    fn place_image(
        &self,
        pdf: &mut Pdf,
        alloc: &mut impl FnMut() -> Ref,
        doc: &mut DocState,
        source: &ImageRef,
        area: PtBox,
    ) -> Result<String, Error> {
        let bounds = images::pixel_bounds(area.w, area.h, self.config.image_dpi);
        let key = (source.clone(), bounds);
        if let Some(name) = doc.xobject_names.get(&key) {
            return Ok(name.clone());
        }
        let img = self.load_image(source, bounds)?;
        let xobj_ref = alloc();
        images::embed(pdf, xobj_ref, &img, alloc);

        let name = format!("Im{}", doc.xobjects.len() + 1);
        doc.xobjects.push((name.clone(), xobj_ref));
        doc.xobject_names.insert(key, name.clone());
        Ok(name)
    }

    /// Contain fit, centred in `area`.
    fn draw_image(&self, content: &mut Content, name: &str, source: &ImageRef, area: PtBox) {
        let bounds = images::pixel_bounds(area.w, area.h, self.config.image_dpi);
        let Some(img) = self.images.borrow().get(&(source.clone(), bounds)).cloned() else {
            return;
        };
        let (iw, ih) = (img.width.max(1) as f32, img.height.max(1) as f32);
        let scale = (area.w / iw).min(area.h / ih);
        let (dw, dh) = (iw * scale, ih * scale);
        let x = area.x + (area.w - dw) / 2.0;
        let y = area.y + (area.h - dh) / 2.0;

        content.save_state();
        content.transform([dw, 0.0, 0.0, dh, x, y]);
        content.x_object(Name(name.as_bytes()));
        content.restore_state();
    }

    fn draw_text(
        &self,
        alloc: &mut impl FnMut() -> Ref,
        doc: &mut DocState,
        content: &mut Content,
        node: &TextNode,
        page_h: f32,
    ) {
        let family = if node.font_family.trim().is_empty() {
            self.config.default_font.as_str()
        } else {
            node.font_family.as_str()
        };
        let key = font_key(family, node.bold, node.italic);
        if !doc.fonts.contains_key(&key) {
            let pdf_name = format!("F{}", doc.font_order.len() + 1);
            let entry = register_font(
                family,
                node.bold,
                node.italic,
                pdf_name,
                alloc,
                self.config.system_fonts,
            );
            doc.fonts.insert(key.clone(), entry);
            doc.font_order.push(key.clone());
        }
        let Some(font) = doc.fonts.get_mut(&key) else {
            return;
        };
        font.load_glyphs(&node.text);

        let size = node.font_size_pt;
        let area = PtBox::from_mm(&node.area, page_h);
        let lines = wrap_lines(&node.text, font, size, area.w);

        let line_h = size * LINE_HEIGHT;
        let content_h = (font.ascender_ratio - font.descender_ratio) * size;
        let half_leading = (line_h - content_h) / 2.0;
        let (r, g, b) = node.color.unit();

        content.save_state();
        content.set_fill_rgb(r, g, b);
        if node.underline {
            content.set_stroke_rgb(r, g, b);
            content.set_line_width((size * 0.05).max(0.5));
        }
        let mut missing = 0;
        for (i, line) in lines.iter().enumerate() {
            if line.is_empty() {
                continue;
            }
            let width = font.text_width(line, size);
            let encoded = font.encode(line);
            missing += encoded.missing;
            let x = area.x
                + match node.align {
                    Alignment::Left => 0.0,
                    Alignment::Center => (area.w - width) / 2.0,
                    Alignment::Right => area.w - width,
                };
            let baseline = area.top() - i as f32 * line_h - half_leading - font.ascender_ratio * size;

            content
                .begin_text()
                .set_font(Name(font.pdf_name.as_bytes()), size)
                .next_line(x, baseline)
                .show(Str(&encoded.bytes))
                .end_text();

            if node.underline {
                let y = baseline - size * 0.1;
                content.move_to(x, y);
                content.line_to(x + width, y);
                content.stroke();
            }
        }
        content.restore_state();

        if missing > 0 {
            log::warn!(
                "{missing} character(s) of {:?} have no glyph in font {family}",
                node.text
            );
        }
    }
}

/// Splits `text` into lines no wider than `max_w`. Explicit newlines always
/// break; words wider than the box break between characters.
fn wrap_lines(text: &str, font: &FontEntry, size: f32, max_w: f32) -> Vec<String> {
    let mut lines = Vec::new();
    for para in text.split('\n') {
        let para = para.strip_suffix('\r').unwrap_or(para);
        if max_w <= 0.0 {
            lines.push(para.to_string());
            continue;
        }

        let mut line = String::new();
        for word in para.split(' ') {
            if !line.is_empty() {
                let candidate = format!("{line} {word}");
                if font.text_width(&candidate, size) <= max_w {
                    line = candidate;
                    continue;
                }
                lines.push(std::mem::take(&mut line));
            }
            if font.text_width(word, size) <= max_w {
                line.push_str(word);
                continue;
            }
            let mut buf = [0u8; 4];
            for c in word.chars() {
                if !line.is_empty()
                    && font.text_width(&line, size) + font.text_width(c.encode_utf8(&mut buf), size) > max_w
                {
                    lines.push(std::mem::take(&mut line));
                }
                line.push(c);
            }
        }
        lines.push(line);
    }
    lines
}
